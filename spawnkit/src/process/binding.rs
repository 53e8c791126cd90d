//! Per-stream resolution of a [`StdioTarget`] into OS resources.
//!
//! A [`StdioBinding`] walks through `prepare` → `child_side` /
//! `parent_side` → `close_unused_ends` → `close_all`. The child always
//! receives the end matching its stream direction (read side for stdin,
//! write side for stdout/stderr); the parent keeps the opposite end of a
//! buffer pipe and nothing else.

use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{PipeReader, PipeWriter};
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;

#[cfg(unix)]
use std::os::unix::fs::OpenOptionsExt;

use tracing::debug;

use super::pipe::Pipe;
use super::target::{FileMode, NativeHandle, PipeRole, SharedBuffer, StdioTarget};
use crate::error::{Error, Result};

/// Logical role of a standard stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamRole {
    /// Descriptor 0.
    Stdin,
    /// Descriptor 1.
    Stdout,
    /// Descriptor 2.
    Stderr,
}

impl StreamRole {
    /// All three roles in descriptor order.
    pub const ALL: [Self; 3] = [Self::Stdin, Self::Stdout, Self::Stderr];

    /// The descriptor number the child sees.
    pub const fn fileno(self) -> usize {
        match self {
            Self::Stdin => 0,
            Self::Stdout => 1,
            Self::Stderr => 2,
        }
    }

    /// Whether the child reads from this stream.
    pub const fn is_input(self) -> bool {
        matches!(self, Self::Stdin)
    }

    /// The pipe end the child must receive for this stream.
    pub const fn child_pipe_role(self) -> PipeRole {
        if self.is_input() {
            PipeRole::Read
        } else {
            PipeRole::Write
        }
    }
}

impl fmt::Display for StreamRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stdin => f.write_str("stdin"),
            Self::Stdout => f.write_str("stdout"),
            Self::Stderr => f.write_str("stderr"),
        }
    }
}

/// Parent-side end of a buffer binding, serviced by the pump.
pub enum PumpStream {
    /// Write `payload` into the child's stdin, then close.
    Feed {
        /// Parent's write end.
        writer: PipeWriter,
        /// Bytes to deliver.
        payload: Arc<[u8]>,
    },
    /// Read the child's output into `sink` until end-of-stream.
    Drain {
        /// Which output stream this is.
        stream: StreamRole,
        /// Parent's read end.
        reader: PipeReader,
        /// Destination buffer.
        sink: SharedBuffer,
    },
}

impl PumpStream {
    /// Stream this end services.
    pub const fn stream(&self) -> StreamRole {
        match self {
            Self::Feed { .. } => StreamRole::Stdin,
            Self::Drain { stream, .. } => *stream,
        }
    }
}

impl fmt::Debug for PumpStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Feed { payload, .. } => f
                .debug_struct("Feed")
                .field("payload_len", &payload.len())
                .finish_non_exhaustive(),
            Self::Drain { stream, sink, .. } => f
                .debug_struct("Drain")
                .field("stream", stream)
                .field("sink", sink)
                .finish_non_exhaustive(),
        }
    }
}

/// What the child gets for this stream.
#[derive(Debug)]
enum ChildSide {
    Inherit,
    Handle(NativeHandle),
    Taken,
}

#[derive(Debug)]
enum State {
    Pending(StdioTarget),
    Prepared {
        child: ChildSide,
        parent: Option<PumpStream>,
        shared: Option<(Pipe, PipeRole)>,
    },
    Closed,
}

/// One stream's redirection, from target selection to cleanup.
#[derive(Debug)]
pub struct StdioBinding {
    stream: StreamRole,
    kind: String,
    state: State,
}

impl StdioBinding {
    /// Bind `target` to `stream`. Nothing is opened until [`prepare`](Self::prepare).
    pub fn new(stream: StreamRole, target: StdioTarget) -> Self {
        Self {
            stream,
            kind: target.kind(),
            state: State::Pending(target),
        }
    }

    /// Logical stream of this binding.
    pub const fn stream(&self) -> StreamRole {
        self.stream
    }

    /// Description of the original target.
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// Resolve files and pipes into OS handles.
    ///
    /// On failure the binding is closed and no shared pipe state has been
    /// touched. Calling this on an already prepared binding does nothing.
    pub fn prepare(&mut self) -> Result<()> {
        let target = match std::mem::replace(&mut self.state, State::Closed) {
            State::Pending(target) => target,
            other => {
                self.state = other;
                return Ok(());
            }
        };

        let stream = self.stream;
        self.state = match target {
            StdioTarget::Inherit => State::Prepared {
                child: ChildSide::Inherit,
                parent: None,
                shared: None,
            },
            StdioTarget::Handle(handle) => State::Prepared {
                child: ChildSide::Handle(handle),
                parent: None,
                shared: None,
            },
            StdioTarget::File(path, mode) => {
                let file = open_redirect(stream, &path, mode)?;
                State::Prepared {
                    child: ChildSide::Handle(NativeHandle::from(file)),
                    parent: None,
                    shared: None,
                }
            }
            StdioTarget::Buffer(buffer) => {
                let (reader, writer) = std::io::pipe().map_err(Error::Pipe)?;
                let (child, parent) = if stream.is_input() {
                    let payload = buffer.snapshot();
                    (
                        NativeHandle::from(reader),
                        PumpStream::Feed { writer, payload },
                    )
                } else {
                    (
                        NativeHandle::from(writer),
                        PumpStream::Drain {
                            stream,
                            reader,
                            sink: buffer,
                        },
                    )
                };
                State::Prepared {
                    child: ChildSide::Handle(child),
                    parent: Some(parent),
                    shared: None,
                }
            }
            StdioTarget::PipeEnd(pipe, role) => {
                if role != stream.child_pipe_role() {
                    return Err(Error::Direction {
                        stream,
                        target: format!("pipe {role} end"),
                    });
                }
                let handle = pipe.duplicate(role).map_err(|err| match err {
                    Error::Pipe(source) => Error::Handle { stream, source },
                    other => other,
                })?;
                State::Prepared {
                    child: ChildSide::Handle(handle),
                    parent: None,
                    shared: Some((pipe, role)),
                }
            }
        };
        debug!(%stream, target = %self.kind, "prepared stdio binding");
        Ok(())
    }

    /// Hand the child's end to the spawner.
    ///
    /// The returned [`Stdio`] owns the handle; it is closed in the parent when
    /// the spawner drops its command. Unprepared or closed bindings inherit.
    pub fn child_side(&mut self) -> Stdio {
        match &mut self.state {
            State::Prepared { child, .. } => match std::mem::replace(child, ChildSide::Taken) {
                ChildSide::Inherit | ChildSide::Taken => Stdio::inherit(),
                ChildSide::Handle(handle) => Stdio::from(handle),
            },
            State::Pending(_) | State::Closed => Stdio::inherit(),
        }
    }

    /// Take the parent's end for the pump, if this is a buffer binding.
    pub fn parent_side(&mut self) -> Option<PumpStream> {
        match &mut self.state {
            State::Prepared { parent, .. } => parent.take(),
            State::Pending(_) | State::Closed => None,
        }
    }

    /// Release everything the parent holds for the child after spawn.
    pub fn close_unused_ends(&mut self) {
        if let State::Prepared { child, shared, .. } = &mut self.state {
            if let ChildSide::Handle(_) = child {
                *child = ChildSide::Taken;
            }
            if let Some((pipe, role)) = shared.take() {
                pipe.close(role);
            }
        }
    }

    /// Close every handle this binding holds or references. Idempotent.
    pub fn close_all(&mut self) {
        match std::mem::replace(&mut self.state, State::Closed) {
            State::Pending(StdioTarget::PipeEnd(pipe, role))
            | State::Prepared {
                shared: Some((pipe, role)),
                ..
            } => pipe.close(role),
            State::Pending(_) | State::Prepared { .. } | State::Closed => {}
        }
    }

    /// Whether [`close_all`](Self::close_all) has run (or preparation failed).
    pub const fn is_closed(&self) -> bool {
        matches!(self.state, State::Closed)
    }
}

fn open_redirect(stream: StreamRole, path: &Path, mode: FileMode) -> Result<File> {
    if stream.is_input() == mode.is_write() {
        return Err(Error::Direction {
            stream,
            target: format!("file {} ({mode:?})", path.display()),
        });
    }

    let mut options = OpenOptions::new();
    match mode {
        FileMode::ReadOnly => {
            options.read(true);
        }
        FileMode::WriteTruncate => {
            options.write(true).create(true).truncate(true);
        }
        FileMode::WriteAppend => {
            options.append(true).create(true);
        }
    }
    #[cfg(unix)]
    if mode.is_write() {
        options.mode(0o644);
    }

    options.open(path).map_err(|source| Error::Open {
        path: path.to_path_buf(),
        source,
    })
}

/// The three bindings of one process.
#[derive(Debug)]
pub struct StdioBindings {
    bindings: [StdioBinding; 3],
}

/// Child-side handles passed to a spawner.
#[derive(Debug)]
pub struct ChildStdio {
    /// Descriptor 0.
    pub stdin: Stdio,
    /// Descriptor 1.
    pub stdout: Stdio,
    /// Descriptor 2.
    pub stderr: Stdio,
}

impl StdioBindings {
    /// Bind the three targets.
    pub fn new(stdin: StdioTarget, stdout: StdioTarget, stderr: StdioTarget) -> Self {
        Self {
            bindings: [
                StdioBinding::new(StreamRole::Stdin, stdin),
                StdioBinding::new(StreamRole::Stdout, stdout),
                StdioBinding::new(StreamRole::Stderr, stderr),
            ],
        }
    }

    /// Prepare all three; on the first failure everything is unwound.
    pub fn prepare(&mut self) -> Result<()> {
        for i in 0..self.bindings.len() {
            if let Err(err) = self.bindings[i].prepare() {
                self.close_all();
                return Err(err);
            }
        }
        Ok(())
    }

    /// Child ends, in descriptor order.
    pub fn child_stdio(&mut self) -> ChildStdio {
        let [stdin, stdout, stderr] = &mut self.bindings;
        ChildStdio {
            stdin: stdin.child_side(),
            stdout: stdout.child_side(),
            stderr: stderr.child_side(),
        }
    }

    /// Parent ends that need pumping.
    pub fn parent_streams(&mut self) -> Vec<PumpStream> {
        self.bindings
            .iter_mut()
            .filter_map(StdioBinding::parent_side)
            .collect()
    }

    /// See [`StdioBinding::close_unused_ends`].
    pub fn close_unused_ends(&mut self) {
        self.bindings
            .iter_mut()
            .for_each(StdioBinding::close_unused_ends);
    }

    /// See [`StdioBinding::close_all`].
    pub fn close_all(&mut self) {
        self.bindings.iter_mut().for_each(StdioBinding::close_all);
    }

    /// Binding for `stream`.
    pub fn get(&self, stream: StreamRole) -> &StdioBinding {
        &self.bindings[stream.fileno()]
    }
}
