//! Reference-counted OS pipe shared between processes.
//!
//! A [`Pipe`] is handed to one process as its stdout ([`Pipe::write_end`])
//! and to another as its stdin ([`Pipe::read_end`]). Each binding gives its
//! child a duplicate of the end it uses and closes the shared end in the
//! parent right after spawning, so the reader observes end-of-stream once
//! the writer exits.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::debug;

use super::target::{NativeHandle, PipeRole, StdioTarget};
use crate::error::{Error, Result};

/// Two connected pipe ends, shared by every process using them.
///
/// Each end serves exactly one spawned child. Spawning the first process
/// bound to an end closes the parent's copy, so a later binding to the same
/// end fails with [`Error::PipeEndClosed`]. Give each extra writer (or
/// reader) its own `Pipe`.
#[derive(Clone)]
pub struct Pipe {
    ends: Arc<[Mutex<Option<NativeHandle>>; 2]>,
}

impl Pipe {
    /// Create a new close-on-exec pipe.
    pub fn create() -> Result<Self> {
        let (reader, writer) = std::io::pipe().map_err(Error::Pipe)?;
        Ok(Self {
            ends: Arc::new([
                Mutex::new(Some(NativeHandle::from(reader))),
                Mutex::new(Some(NativeHandle::from(writer))),
            ]),
        })
    }

    fn end(&self, role: PipeRole) -> MutexGuard<'_, Option<NativeHandle>> {
        self.ends[role.index()]
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Target connecting a stdin to this pipe.
    pub fn read_end(&self) -> StdioTarget {
        StdioTarget::PipeEnd(self.clone(), PipeRole::Read)
    }

    /// Target connecting a stdout or stderr to this pipe.
    pub fn write_end(&self) -> StdioTarget {
        StdioTarget::PipeEnd(self.clone(), PipeRole::Write)
    }

    /// Duplicate one end for a child, leaving the shared end untouched.
    pub(crate) fn duplicate(&self, role: PipeRole) -> Result<NativeHandle> {
        let end = self.end(role);
        let handle = end.as_ref().ok_or(Error::PipeEndClosed { role })?;
        handle.try_clone().map_err(Error::Pipe)
    }

    /// Close one end. Closing an already closed end does nothing.
    pub fn close(&self, role: PipeRole) {
        if self.end(role).take().is_some() {
            debug!(%role, "closed pipe end");
        }
    }

    /// Whether `role`'s end is still open in this process.
    pub fn is_open(&self, role: PipeRole) -> bool {
        self.end(role).is_some()
    }

    /// Whether both ends have been closed.
    pub fn is_inert(&self) -> bool {
        !self.is_open(PipeRole::Read) && !self.is_open(PipeRole::Write)
    }
}

impl fmt::Debug for Pipe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipe")
            .field("read_open", &self.is_open(PipeRole::Read))
            .field("write_open", &self.is_open(PipeRole::Write))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};

    #[test]
    fn test_double_close_is_noop() {
        let pipe = Pipe::create().unwrap();
        pipe.close(PipeRole::Write);
        pipe.close(PipeRole::Write);
        assert!(!pipe.is_open(PipeRole::Write));
        assert!(pipe.is_open(PipeRole::Read));
        assert!(!pipe.is_inert());

        pipe.close(PipeRole::Read);
        assert!(pipe.is_inert());
    }

    #[test]
    fn test_clones_share_ends() {
        let pipe = Pipe::create().unwrap();
        let other = pipe.clone();
        other.close(PipeRole::Read);
        assert!(!pipe.is_open(PipeRole::Read));
    }

    #[test]
    fn test_duplicate_closed_end_fails() {
        let pipe = Pipe::create().unwrap();
        pipe.close(PipeRole::Read);
        let err = pipe.duplicate(PipeRole::Read).unwrap_err();
        assert!(matches!(err, Error::PipeEndClosed { role: PipeRole::Read }));
    }

    #[test]
    fn test_duplicates_carry_bytes() {
        let pipe = Pipe::create().unwrap();
        let mut writer = std::io::PipeWriter::from(pipe.duplicate(PipeRole::Write).unwrap());
        let mut reader = std::io::PipeReader::from(pipe.duplicate(PipeRole::Read).unwrap());
        pipe.close(PipeRole::Read);
        pipe.close(PipeRole::Write);

        writer.write_all(b"123\n").unwrap();
        drop(writer);

        let mut out = String::new();
        reader.read_to_string(&mut out).unwrap();
        assert_eq!(out, "123\n");
    }
}
