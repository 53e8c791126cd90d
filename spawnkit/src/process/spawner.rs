//! Creation of the child process.
//!
//! [`ProcessSpawner`] is the seam between the portable engine and the
//! platform's process-creation call. [`CommandSpawner`] drives
//! [`std::process::Command`], which uses `posix_spawn` where it can and
//! fork/exec otherwise on unix, and `CreateProcessW` on Windows. In every
//! case the child's descriptors 0/1/2 are exactly the handles in
//! [`ChildStdio`]; every other handle this crate creates is close-on-exec.

use std::fmt;
use std::io;
use std::path::PathBuf;
use std::process::{Child, Command};

#[cfg(unix)]
use std::os::unix::process::CommandExt;

use tracing::{debug, warn};

use super::binding::ChildStdio;
use crate::env::Environment;

/// Everything the spawner needs besides the stdio handles.
#[derive(Debug, Clone)]
pub struct SpawnRequest {
    /// Executable to run, already resolved against the search path.
    pub program: PathBuf,
    /// Full argument vector; `argv[0]` is passed to the child unchanged.
    pub argv: Vec<String>,
    /// Working directory, if different from the parent's.
    pub working_dir: Option<PathBuf>,
    /// Complete child environment. `None` inherits the parent's.
    pub env: Option<Environment>,
}

/// Why a child could not be created or executed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnFailure {
    /// Program that failed to start.
    pub program: String,
    /// Classified OS error.
    pub kind: io::ErrorKind,
    /// Raw OS error code, when the platform reported one.
    pub os_code: Option<i32>,
    /// Human readable OS error text.
    pub message: String,
}

impl SpawnFailure {
    /// Record a failure for `program`.
    pub fn new(program: impl Into<String>, err: &io::Error) -> Self {
        Self {
            program: program.into(),
            kind: err.kind(),
            os_code: err.raw_os_error(),
            message: err.to_string(),
        }
    }

    /// The executable could not be found.
    pub fn is_not_found(&self) -> bool {
        self.kind == io::ErrorKind::NotFound
    }

    /// The executable exists but may not be executed.
    pub fn is_permission_denied(&self) -> bool {
        self.kind == io::ErrorKind::PermissionDenied
    }
}

impl fmt::Display for SpawnFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "failed to execute {}: {}", self.program, self.message)
    }
}

/// Platform process reference.
#[derive(Debug)]
pub enum ProcessHandle {
    /// Spawn succeeded; the child must be waited exactly once.
    Live(Child),
    /// Spawn failed; waiting yields exit code 127 without blocking.
    Invalid(SpawnFailure),
}

impl ProcessHandle {
    /// OS process id of a live child.
    pub fn id(&self) -> Option<u32> {
        match self {
            Self::Live(child) => Some(child.id()),
            Self::Invalid(_) => None,
        }
    }

    /// Whether spawning succeeded.
    pub const fn is_live(&self) -> bool {
        matches!(self, Self::Live(_))
    }

    /// The failure, for an invalid handle.
    pub const fn failure(&self) -> Option<&SpawnFailure> {
        match self {
            Self::Live(_) => None,
            Self::Invalid(failure) => Some(failure),
        }
    }
}

/// Strategy for creating a child process.
///
/// Implementations create exactly one process or none. They never raise for
/// an unrunnable program; they return [`ProcessHandle::Invalid`] and the
/// caller unwinds the stdio bindings.
pub trait ProcessSpawner: fmt::Debug + Send + Sync {
    /// Create the child with `stdio` bound to its descriptors 0/1/2.
    ///
    /// The spawner must drop every handle in `stdio` before returning.
    fn spawn(&self, request: &SpawnRequest, stdio: ChildStdio) -> ProcessHandle;
}

/// Spawner backed by [`std::process::Command`].
#[derive(Debug, Default, Clone, Copy)]
pub struct CommandSpawner;

impl ProcessSpawner for CommandSpawner {
    fn spawn(&self, request: &SpawnRequest, stdio: ChildStdio) -> ProcessHandle {
        let mut cmd = Command::new(&request.program);

        #[cfg(unix)]
        if let Some(arg0) = request.argv.first() {
            cmd.arg0(arg0);
        }
        cmd.args(request.argv.iter().skip(1));

        if let Some(ref dir) = request.working_dir {
            cmd.current_dir(dir);
        }

        if let Some(ref env) = request.env {
            cmd.env_clear();
            cmd.envs(env.iter());
        }

        cmd.stdin(stdio.stdin);
        cmd.stdout(stdio.stdout);
        cmd.stderr(stdio.stderr);

        let spawned = cmd.spawn();
        // The command owns the child-side handles until it is dropped.
        drop(cmd);

        match spawned {
            Ok(child) => {
                debug!(pid = child.id(), program = %request.program.display(), "spawned child");
                ProcessHandle::Live(child)
            }
            Err(err) => {
                let program = request
                    .argv
                    .first()
                    .cloned()
                    .unwrap_or_else(|| request.program.display().to_string());
                warn!(%program, error = %err, "spawn failed");
                ProcessHandle::Invalid(SpawnFailure::new(program, &err))
            }
        }
    }
}
