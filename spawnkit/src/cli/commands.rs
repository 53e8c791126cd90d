//! CLI command execution.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use spawnkit::config::PumpSettings;
use spawnkit::env::expand_home;
use spawnkit::process::{
    Completion, Pipeline, ProcessOptions, ProcessPool, SharedBuffer, StdioTarget,
};
use spawnkit::resolve::resolve_program;

use super::args::{Cli, Commands, EnvArgs, StdioArgs};

/// Separator between pipeline stages on the command line.
const STAGE_SEPARATOR: &str = "::";

/// Initialize logging to stderr.
///
/// `RUST_LOG` takes precedence over the verbosity flag.
pub fn init_logging(verbose: u8) -> Result<()> {
    use tracing_subscriber::fmt;
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;
    use tracing_subscriber::EnvFilter;

    let level = match verbose {
        0 => "warn",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;

    Ok(())
}

// === Reports ===

/// Outcome of one child, as printed in JSON reports.
#[derive(Debug, Serialize)]
struct StageReport {
    argv: Vec<String>,
    code: i32,
    status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    spawn_error: Option<String>,
}

impl StageReport {
    fn new(argv: Vec<String>, completion: &Completion) -> Self {
        Self {
            argv,
            code: completion.code(),
            status: completion.to_string(),
            spawn_error: completion.spawn_failure().map(ToString::to_string),
        }
    }
}

/// JSON summary of one run or pipeline.
#[derive(Debug, Serialize)]
struct RunReport {
    started_at: DateTime<Utc>,
    finished_at: DateTime<Utc>,
    duration_ms: i64,
    code: i32,
    stages: Vec<StageReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stdout: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stderr: Option<String>,
}

impl RunReport {
    fn new(
        started_at: DateTime<Utc>,
        code: i32,
        stages: Vec<StageReport>,
        captured: &Captured,
    ) -> Self {
        let finished_at = Utc::now();
        Self {
            started_at,
            finished_at,
            duration_ms: (finished_at - started_at).num_milliseconds(),
            code,
            stages,
            stdout: captured.stdout.as_ref().map(SharedBuffer::to_string_lossy),
            stderr: captured.stderr.as_ref().map(SharedBuffer::to_string_lossy),
        }
    }
}

/// Buffers that replaced inherited output streams.
#[derive(Debug, Default)]
struct Captured {
    stdout: Option<SharedBuffer>,
    stderr: Option<SharedBuffer>,
}

impl Captured {
    /// Replace `target` with `slot`'s buffer if it would be inherited.
    fn redirect(slot: &mut Option<SharedBuffer>, target: &mut StdioTarget) {
        if matches!(target, StdioTarget::Inherit) {
            let buffer = slot.get_or_insert_with(SharedBuffer::new).clone();
            *target = StdioTarget::Buffer(buffer);
        }
    }
}

/// One entry of a batch file.
#[derive(Debug, Deserialize)]
struct BatchJob {
    argv: Vec<String>,
    #[serde(default)]
    cwd: Option<PathBuf>,
    #[serde(default)]
    env: BTreeMap<String, String>,
    #[serde(default)]
    clear_env: bool,
    /// Text fed to stdin.
    #[serde(default)]
    input: Option<String>,
    /// File read as stdin.
    #[serde(default)]
    stdin: Option<PathBuf>,
    /// File receiving stdout; captured into the report otherwise.
    #[serde(default)]
    stdout: Option<PathBuf>,
    /// File receiving stderr; captured into the report otherwise.
    #[serde(default)]
    stderr: Option<PathBuf>,
    #[serde(default)]
    append: bool,
}

impl BatchJob {
    fn into_options(self, pump: PumpSettings) -> (ProcessOptions, Captured) {
        let stdio = StdioArgs {
            stdin: self.stdin,
            input: self.input,
            stdout: self.stdout,
            stderr: self.stderr,
            append: self.append,
            quiet: false,
        };
        let env = EnvArgs {
            cwd: self.cwd,
            env: self.env.into_iter().collect(),
            clear_env: self.clear_env,
        };

        let mut options = apply_env(ProcessOptions::from_argv(self.argv), &env).pump(pump);
        options.stdin = match stdin_target(&stdio) {
            StdioTarget::Inherit => StdioTarget::null_input(),
            target => target,
        };
        options.stdout = output_target(&stdio, stdio.stdout.as_deref());
        options.stderr = output_target(&stdio, stdio.stderr.as_deref());

        let mut captured = Captured::default();
        Captured::redirect(&mut captured.stdout, &mut options.stdout);
        Captured::redirect(&mut captured.stderr, &mut options.stderr);
        (options, captured)
    }
}

// === Command Execution ===

/// Execute a parsed command line and return the process exit code.
pub async fn execute(cli: Cli) -> Result<i32> {
    let mut pump = PumpSettings::from_env()?;
    if let Some(strategy) = cli.pump {
        pump = pump.strategy(strategy.into());
    }
    if let Some(size) = cli.chunk_size {
        pump = pump.chunk_size(size);
    }
    debug!(strategy = %pump.strategy, chunk_size = pump.chunk_size, "pump settings");

    match cli.command {
        Commands::Run {
            stdio,
            env,
            json,
            argv,
        } => run_command(argv, &stdio, &env, pump, json).await,
        Commands::Pipe {
            stdio,
            env,
            json,
            stages,
        } => run_pipeline(&stages, &stdio, &env, pump, json).await,
        Commands::Batch { file, jobs } => run_batch(&file, jobs, pump).await,
        Commands::Which { name } => Ok(which(&name)),
    }
}

async fn run_command(
    argv: Vec<String>,
    stdio: &StdioArgs,
    env: &EnvArgs,
    pump: PumpSettings,
    json: bool,
) -> Result<i32> {
    let mut options = apply_env(ProcessOptions::from_argv(argv.clone()), env).pump(pump);
    options.stdin = stdin_target(stdio);
    options.stdout = output_target(stdio, stdio.stdout.as_deref());
    options.stderr = output_target(stdio, stdio.stderr.as_deref());

    let mut captured = Captured::default();
    if json {
        Captured::redirect(&mut captured.stdout, &mut options.stdout);
        Captured::redirect(&mut captured.stderr, &mut options.stderr);
    }

    let started_at = Utc::now();
    let completion = tokio::task::spawn_blocking(move || options.run())
        .await
        .context("Process task panicked")??;

    if let Some(failure) = completion.spawn_failure() {
        eprintln!("spawnkit: {failure}");
    }

    if json {
        let code = completion.code();
        let stages = vec![StageReport::new(argv, &completion)];
        print_json(&RunReport::new(started_at, code, stages, &captured))?;
    }

    Ok(completion.code())
}

async fn run_pipeline(
    args: &[String],
    stdio: &StdioArgs,
    env: &EnvArgs,
    pump: PumpSettings,
    json: bool,
) -> Result<i32> {
    let stages = split_stages(args)?;
    let last = stages.len() - 1;

    let mut captured = Captured::default();
    let mut pipeline: Option<Pipeline> = None;
    for (index, argv) in stages.iter().enumerate() {
        let mut options = apply_env(ProcessOptions::from_argv(argv.clone()), env)
            .pump(pump)
            .stderr(output_target(stdio, stdio.stderr.as_deref()));
        if index == 0 {
            options.stdin = stdin_target(stdio);
        }
        if index == last {
            options.stdout = output_target(stdio, stdio.stdout.as_deref());
        }
        if json {
            // Every stage's stderr lands in one shared buffer.
            Captured::redirect(&mut captured.stderr, &mut options.stderr);
            if index == last {
                Captured::redirect(&mut captured.stdout, &mut options.stdout);
            }
        }
        pipeline = Some(match pipeline {
            None => Pipeline::new(options),
            Some(pipeline) => pipeline.pipe(options),
        });
    }
    let Some(pipeline) = pipeline else {
        bail!("Pipeline has no stages");
    };

    let started_at = Utc::now();
    let completion = tokio::task::spawn_blocking(move || pipeline.run())
        .await
        .context("Pipeline task panicked")??;

    for failure in completion.stages.iter().filter_map(Completion::spawn_failure) {
        eprintln!("spawnkit: {failure}");
    }
    debug!(codes = ?completion.codes(), "pipeline finished");

    if json {
        let reports = stages
            .into_iter()
            .zip(&completion.stages)
            .map(|(argv, stage)| StageReport::new(argv, stage))
            .collect();
        print_json(&RunReport::new(started_at, completion.code(), reports, &captured))?;
    }

    Ok(completion.code())
}

async fn run_batch(file: &Path, jobs: usize, pump: PumpSettings) -> Result<i32> {
    let path = expand_home(file);
    let text = std::fs::read_to_string(&path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let batch: Vec<BatchJob> = serde_json::from_str(&text)
        .with_context(|| format!("Failed to parse {}", path.display()))?;

    let pool = ProcessPool::new(jobs);
    let mut pending = Vec::with_capacity(batch.len());
    for job in batch {
        let argv = job.argv.clone();
        let (options, captured) = job.into_options(pump);
        pending.push((argv, Utc::now(), captured, pool.spawn(options)));
    }

    let mut reports = Vec::with_capacity(pending.len());
    let mut worst = 0;
    for (argv, started_at, captured, proc) in pending {
        let completion = proc.wait().await?;
        if !completion.success() {
            worst = worst.max(completion.code());
        }
        let code = completion.code();
        let stages = vec![StageReport::new(argv, &completion)];
        reports.push(RunReport::new(started_at, code, stages, &captured));
    }

    print_json(&reports)?;
    Ok(worst)
}

fn which(name: &str) -> i32 {
    let found = std::env::current_dir()
        .ok()
        .and_then(|cwd| locate(name, &cwd));
    match found {
        Some(path) => {
            println!("{}", path.display());
            0
        }
        None => {
            eprintln!("spawnkit: {name}: not found");
            1
        }
    }
}

/// Where `name` resolves. Bare names come only from PATH, never from `cwd`.
fn locate(name: &str, cwd: &Path) -> Option<PathBuf> {
    let resolved = resolve_program(name, None, Some(cwd));
    let path = if resolved.is_absolute() {
        resolved
    } else if Path::new(name).components().count() > 1 {
        cwd.join(resolved)
    } else {
        return None;
    };
    path.is_file().then_some(path)
}

// === Helpers ===

fn apply_env(mut options: ProcessOptions, args: &EnvArgs) -> ProcessOptions {
    if args.clear_env {
        options = options.env_clear();
    }
    for (key, value) in &args.env {
        options = options.env(key.as_str(), value.as_str());
    }
    if let Some(ref dir) = args.cwd {
        options = options.working_dir(expand_home(dir));
    }
    options
}

fn stdin_target(args: &StdioArgs) -> StdioTarget {
    match (&args.stdin, &args.input) {
        (Some(path), _) => StdioTarget::read_file(expand_home(path)),
        (None, Some(text)) => StdioTarget::bytes(text.as_bytes()),
        (None, None) => StdioTarget::Inherit,
    }
}

fn output_target(args: &StdioArgs, path: Option<&Path>) -> StdioTarget {
    match path {
        _ if args.quiet => StdioTarget::null_output(),
        Some(path) if args.append => StdioTarget::append_file(expand_home(path)),
        Some(path) => StdioTarget::write_file(expand_home(path)),
        None => StdioTarget::Inherit,
    }
}

fn split_stages(args: &[String]) -> Result<Vec<Vec<String>>> {
    let stages: Vec<Vec<String>> = args
        .split(|arg| arg == STAGE_SEPARATOR)
        .map(<[String]>::to_vec)
        .collect();
    if stages.iter().any(Vec::is_empty) {
        bail!("Empty pipeline stage; separate programs with '{STAGE_SEPARATOR}'");
    }
    Ok(stages)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let mut stdout = std::io::stdout().lock();
    serde_json::to_writer_pretty(&mut stdout, value).context("Failed to write JSON report")?;
    writeln!(stdout)?;
    Ok(())
}
