//! CLI argument definitions.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

use spawnkit::config::PumpStrategy;

/// Spawnkit - run programs with redirected, concurrently pumped stdio
#[derive(Parser, Debug)]
#[command(name = "spawnkit")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Pump strategy for buffer streams
    #[arg(long, global = true, value_enum)]
    pub pump: Option<PumpArg>,

    /// Read chunk size in bytes
    #[arg(long, global = true)]
    pub chunk_size: Option<usize>,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run one program and exit with its exit code
    Run {
        #[command(flatten)]
        stdio: StdioArgs,

        #[command(flatten)]
        env: EnvArgs,

        /// Print a JSON report instead of passing output through
        #[arg(long)]
        json: bool,

        /// Program and its arguments
        #[arg(trailing_var_arg = true, required = true, allow_hyphen_values = true)]
        argv: Vec<String>,
    },

    /// Run a pipeline of programs separated by `::`
    Pipe {
        #[command(flatten)]
        stdio: StdioArgs,

        #[command(flatten)]
        env: EnvArgs,

        /// Print a JSON report of every stage
        #[arg(long)]
        json: bool,

        /// Stages, e.g. `echo hi :: tr a-z A-Z`
        #[arg(trailing_var_arg = true, required = true, allow_hyphen_values = true)]
        stages: Vec<String>,
    },

    /// Run jobs from a JSON file with a concurrency limit
    Batch {
        /// JSON file holding an array of jobs
        file: PathBuf,

        /// Maximum number of concurrent children
        #[arg(short, long, default_value = "4")]
        jobs: usize,
    },

    /// Show where a program resolves on PATH
    Which {
        /// Program name
        name: String,
    },
}

/// Redirection flags shared by `run` and `pipe`
#[derive(Args, Debug, Default, Clone)]
pub struct StdioArgs {
    /// Read stdin from a file
    #[arg(long, conflicts_with = "input")]
    pub stdin: Option<PathBuf>,

    /// Feed this text to stdin
    #[arg(long)]
    pub input: Option<String>,

    /// Write stdout to a file (truncating)
    #[arg(long)]
    pub stdout: Option<PathBuf>,

    /// Write stderr to a file (truncating)
    #[arg(long)]
    pub stderr: Option<PathBuf>,

    /// Append to the stdout/stderr files instead of truncating
    #[arg(long)]
    pub append: bool,

    /// Discard stdout and stderr
    #[arg(long, conflicts_with_all = ["stdout", "stderr"])]
    pub quiet: bool,
}

/// Environment and directory flags shared by `run` and `pipe`
#[derive(Args, Debug, Default, Clone)]
pub struct EnvArgs {
    /// Working directory for the child
    #[arg(long)]
    pub cwd: Option<PathBuf>,

    /// Set a variable (KEY=VALUE), repeatable
    #[arg(short, long = "env", value_parser = parse_key_value)]
    pub env: Vec<(String, String)>,

    /// Start from an empty environment
    #[arg(long)]
    pub clear_env: bool,
}

/// Pump strategies selectable on the command line
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum PumpArg {
    /// Single-threaded readiness loop
    Reactor,
    /// One thread per stream
    Threads,
}

impl From<PumpArg> for PumpStrategy {
    fn from(arg: PumpArg) -> Self {
        match arg {
            PumpArg::Reactor => Self::Reactor,
            PumpArg::Threads => Self::Threads,
        }
    }
}

fn parse_key_value(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got '{s}'")),
    }
}
