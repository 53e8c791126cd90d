//! Process spawning with redirected stdio.
//!
//! A child is described by [`ProcessOptions`]: argument vector, working
//! directory, environment and one [`StdioTarget`] per standard stream.
//! Spawning binds each target to an OS handle, hands the child its side, and
//! [`Process::wait`] pumps any in-memory buffers concurrently before reaping
//! the child and reporting an exit code.

mod binding;
mod pipe;
mod pipeline;
mod pool;
mod pump;
mod spawn;
mod spawner;
mod target;
mod wait;

pub use binding::{ChildStdio, PumpStream, StdioBinding, StdioBindings, StreamRole};
pub use pipe::Pipe;
pub use pipeline::{Pipeline, PipelineCompletion, RunningPipeline};
pub use pool::{PoolEvent, PooledProcess, ProcessId, ProcessPool};
pub use pump::IoPump;
pub use spawn::{run, Process, ProcessOptions};
pub use spawner::{CommandSpawner, ProcessHandle, ProcessSpawner, SpawnFailure, SpawnRequest};
pub use target::{FileMode, NativeHandle, PipeRole, SharedBuffer, StdioTarget, NULL_DEVICE};
pub use wait::{Completion, ExitStatus, ProcessWaiter, EXIT_NOT_STARTED, SIGNAL_EXIT_BASE};
