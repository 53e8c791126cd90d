//! Spawnkit - spawn child processes with redirected, concurrently pumped stdio.
//!
//! Each of a child's standard streams can be inherited, bound to an existing
//! handle, a file, an in-memory buffer, or one end of a pipe shared with
//! another child. Buffers are fed and drained concurrently so large payloads
//! never deadlock, and every run ends in a single exit code:
//! the child's own code, `128 + signal` when it was killed, or 127 when it
//! never started.
//!
//! ```rust,no_run
//! use spawnkit::process::{ProcessOptions, StdioTarget};
//!
//! let (stdout, captured) = StdioTarget::capture();
//! let completion = ProcessOptions::from_argv(["tr", "a-z", "A-Z"])
//!     .stdin(StdioTarget::bytes("hello"))
//!     .stdout(stdout)
//!     .run()?;
//! assert_eq!(completion.code(), 0);
//! assert_eq!(captured.to_string_lossy(), "HELLO");
//! # Ok::<(), spawnkit::Error>(())
//! ```

pub mod config;
pub mod env;
pub mod error;
pub mod process;
pub mod resolve;

pub use error::{Error, Result};
