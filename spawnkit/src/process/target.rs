//! Redirection targets for a child's standard streams.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[cfg(unix)]
use std::os::fd::{AsFd, OwnedFd};
#[cfg(windows)]
use std::os::windows::io::{AsHandle, OwnedHandle};

use super::pipe::Pipe;

/// OS-level handle for an open I/O resource.
#[cfg(unix)]
pub type NativeHandle = OwnedFd;

/// OS-level handle for an open I/O resource.
#[cfg(windows)]
pub type NativeHandle = OwnedHandle;

/// Path of the platform null device.
#[cfg(unix)]
pub const NULL_DEVICE: &str = "/dev/null";

/// Path of the platform null device.
#[cfg(windows)]
pub const NULL_DEVICE: &str = "NUL";

/// How a redirect file is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileMode {
    /// Open an existing file for reading (stdin).
    ReadOnly,
    /// Create or truncate the file, then write.
    WriteTruncate,
    /// Create the file if needed and append to it.
    WriteAppend,
}

impl FileMode {
    /// Whether the child writes through this mode.
    pub const fn is_write(self) -> bool {
        !matches!(self, Self::ReadOnly)
    }
}

/// Which end of a [`Pipe`] a stream is connected to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PipeRole {
    /// The end bytes come out of.
    Read,
    /// The end bytes go into.
    Write,
}

impl PipeRole {
    pub(crate) const fn index(self) -> usize {
        match self {
            Self::Read => 0,
            Self::Write => 1,
        }
    }
}

impl fmt::Display for PipeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Read => f.write_str("read"),
            Self::Write => f.write_str("write"),
        }
    }
}

/// A byte buffer shared between the caller and a running pump.
///
/// Clones refer to the same storage. Stdin payloads are snapshotted when the
/// process is spawned; stdout/stderr bytes are appended as they arrive.
#[derive(Clone, Default)]
pub struct SharedBuffer {
    inner: Arc<Mutex<Vec<u8>>>,
}

impl SharedBuffer {
    /// Create an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a buffer holding `bytes`.
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(bytes.into())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<u8>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Copy of the current contents.
    pub fn contents(&self) -> Vec<u8> {
        self.lock().clone()
    }

    /// Current contents decoded as UTF-8, replacing invalid sequences.
    pub fn to_string_lossy(&self) -> String {
        String::from_utf8_lossy(&self.lock()).into_owned()
    }

    /// Number of bytes held.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether the buffer holds no bytes.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Discard all bytes.
    pub fn clear(&self) {
        self.lock().clear();
    }

    /// Take the contents, leaving the buffer empty.
    pub fn take(&self) -> Vec<u8> {
        std::mem::take(&mut *self.lock())
    }

    pub(crate) fn append(&self, bytes: &[u8]) {
        self.lock().extend_from_slice(bytes);
    }

    pub(crate) fn snapshot(&self) -> Arc<[u8]> {
        Arc::from(self.lock().as_slice())
    }

    /// Whether two handles refer to the same storage.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for SharedBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedBuffer").field("len", &self.len()).finish()
    }
}

/// Where one standard stream of a child goes.
#[derive(Debug, Default)]
pub enum StdioTarget {
    /// Child shares the parent's stream.
    #[default]
    Inherit,
    /// An already-open handle, owned by the target from now on.
    Handle(NativeHandle),
    /// A file opened just before spawn.
    File(PathBuf, FileMode),
    /// An in-memory buffer backed by a private pipe.
    Buffer(SharedBuffer),
    /// One end of a pipe shared with another process.
    PipeEnd(Pipe, PipeRole),
}

impl StdioTarget {
    /// Read stdin from `path`.
    pub fn read_file(path: impl Into<PathBuf>) -> Self {
        Self::File(path.into(), FileMode::ReadOnly)
    }

    /// Write to `path`, discarding prior content.
    pub fn write_file(path: impl Into<PathBuf>) -> Self {
        Self::File(path.into(), FileMode::WriteTruncate)
    }

    /// Append to `path`.
    pub fn append_file(path: impl Into<PathBuf>) -> Self {
        Self::File(path.into(), FileMode::WriteAppend)
    }

    /// Stdin reading from the null device.
    pub fn null_input() -> Self {
        Self::read_file(Path::new(NULL_DEVICE))
    }

    /// Stdout/stderr discarded into the null device.
    pub fn null_output() -> Self {
        Self::write_file(Path::new(NULL_DEVICE))
    }

    /// Stdin fed from `bytes`.
    pub fn bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self::Buffer(SharedBuffer::from_bytes(bytes))
    }

    /// A fresh capture buffer, returned alongside the target.
    pub fn capture() -> (Self, SharedBuffer) {
        let buffer = SharedBuffer::new();
        (Self::Buffer(buffer.clone()), buffer)
    }

    /// Duplicate a borrowed handle; the caller keeps the original.
    #[cfg(unix)]
    pub fn handle(handle: impl AsFd) -> io::Result<Self> {
        Ok(Self::Handle(handle.as_fd().try_clone_to_owned()?))
    }

    /// Duplicate a borrowed handle; the caller keeps the original.
    #[cfg(windows)]
    pub fn handle(handle: impl AsHandle) -> io::Result<Self> {
        Ok(Self::Handle(handle.as_handle().try_clone_to_owned()?))
    }

    /// Short name of the variant, used in logs and errors.
    pub fn kind(&self) -> String {
        match self {
            Self::Inherit => "inherit".to_string(),
            Self::Handle(_) => "handle".to_string(),
            Self::File(path, mode) => format!("file {} ({mode:?})", path.display()),
            Self::Buffer(_) => "buffer".to_string(),
            Self::PipeEnd(_, role) => format!("pipe {role} end"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shared_buffer_clones_share_storage() {
        let buf = SharedBuffer::new();
        let other = buf.clone();
        other.append(b"abc");
        assert_eq!(buf.contents(), b"abc");
        assert!(buf.ptr_eq(&other));
        assert_eq!(buf.take(), b"abc");
        assert!(other.is_empty());
    }

    #[test]
    fn test_snapshot_is_detached() {
        let buf = SharedBuffer::from_bytes("123");
        let snap = buf.snapshot();
        buf.append(b"456");
        assert_eq!(&*snap, b"123");
        assert_eq!(buf.to_string_lossy(), "123456");
    }

    #[test]
    fn test_file_constructors() {
        assert!(matches!(
            StdioTarget::read_file("a"),
            StdioTarget::File(_, FileMode::ReadOnly)
        ));
        assert!(matches!(
            StdioTarget::write_file("a"),
            StdioTarget::File(_, FileMode::WriteTruncate)
        ));
        assert!(matches!(
            StdioTarget::append_file("a"),
            StdioTarget::File(_, FileMode::WriteAppend)
        ));
        assert!(!FileMode::ReadOnly.is_write());
        assert!(FileMode::WriteAppend.is_write());
    }

    #[test]
    fn test_capture_returns_linked_buffer() {
        let (target, buf) = StdioTarget::capture();
        match target {
            StdioTarget::Buffer(inner) => assert!(inner.ptr_eq(&buf)),
            other => panic!("unexpected target: {other:?}"),
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_handle_duplicates() {
        let file = tempfile::tempfile().unwrap();
        let target = StdioTarget::handle(&file).unwrap();
        assert_eq!(target.kind(), "handle");
        drop(target);
        // Original is still usable.
        assert!(file.metadata().is_ok());
    }
}
