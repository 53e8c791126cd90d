//! Concurrent stdin feeding and stdout/stderr draining.
//!
//! Every active stream makes progress independently, so a child blocked on
//! a full stdout pipe can never stall delivery of its stdin (and the other
//! way round). Two strategies are available:
//!
//! - [`PumpStrategy::Reactor`]: a current-thread tokio runtime drives one task
//!   per stream; the runtime's readiness poll is the only blocking call. When
//!   the caller already runs inside a tokio context (an async task or a
//!   `spawn_blocking` closure), that runtime lives on one helper thread.
//! - [`PumpStrategy::Threads`]: one scoped OS thread per stream, each doing
//!   plain blocking reads or writes.
//!
//! The pump ends once every stream has been closed. A peer that closes its
//! end (`BrokenPipe` on stdin) ends that stream; any other I/O error is
//! returned as [`Error::Pump`].

use std::io::{self, Read, Write};
use std::thread;

use tracing::{debug, warn};

use super::binding::{PumpStream, StreamRole};
use crate::config::{PumpSettings, PumpStrategy};
use crate::error::{Error, Result};

/// Moves bytes between the parent's buffers and the child's pipes.
#[derive(Debug, Clone, Copy, Default)]
pub struct IoPump {
    settings: PumpSettings,
}

impl IoPump {
    /// Pump with the given settings.
    pub const fn new(settings: PumpSettings) -> Self {
        Self { settings }
    }

    /// Service `streams` until all of them are closed.
    pub fn run(&self, streams: Vec<PumpStream>) -> Result<()> {
        if streams.is_empty() {
            return Ok(());
        }
        let chunk_size = self.settings.chunk_size.max(1);
        debug!(
            streams = streams.len(),
            strategy = %self.settings.strategy,
            "pumping child streams"
        );

        match plan(self.settings.strategy) {
            #[cfg(unix)]
            Plan::Reactor { helper_thread: false } => reactor::run(streams, chunk_size),
            #[cfg(unix)]
            Plan::Reactor { helper_thread: true } => thread::scope(|scope| {
                scope
                    .spawn(move || reactor::run(streams, chunk_size))
                    .join()
                    .unwrap_or_else(|panic| std::panic::resume_unwind(panic))
            }),
            Plan::Threads => run_threads(streams, chunk_size),
        }
    }
}

/// How a strategy is carried out on the calling thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Plan {
    /// Readiness loop; on a helper thread when this thread sees a runtime,
    /// since a runtime cannot be started from within another.
    #[cfg(unix)]
    Reactor { helper_thread: bool },
    Threads,
}

fn plan(strategy: PumpStrategy) -> Plan {
    match strategy {
        #[cfg(unix)]
        PumpStrategy::Reactor => Plan::Reactor {
            helper_thread: tokio::runtime::Handle::try_current().is_ok(),
        },
        #[cfg(not(unix))]
        PumpStrategy::Reactor => Plan::Threads,
        PumpStrategy::Threads => Plan::Threads,
    }
}

fn run_threads(mut streams: Vec<PumpStream>, chunk_size: usize) -> Result<()> {
    if streams.len() == 1 {
        if let Some(stream) = streams.pop() {
            return service_blocking(stream, chunk_size);
        }
    }

    thread::scope(|scope| {
        let workers: Vec<_> = streams
            .into_iter()
            .map(|stream| scope.spawn(move || service_blocking(stream, chunk_size)))
            .collect();

        let mut outcome = Ok(());
        for worker in workers {
            let result = worker
                .join()
                .unwrap_or_else(|panic| std::panic::resume_unwind(panic));
            if let Err(err) = result {
                warn!(error = %err, "stream pump failed");
                if outcome.is_ok() {
                    outcome = Err(err);
                }
            }
        }
        outcome
    })
}

fn service_blocking(stream: PumpStream, chunk_size: usize) -> Result<()> {
    match stream {
        PumpStream::Feed {
            mut writer,
            payload,
        } => {
            match writer.write_all(&payload) {
                Ok(()) => debug!(bytes = payload.len(), "stdin payload delivered"),
                Err(err) if err.kind() == io::ErrorKind::BrokenPipe => {
                    debug!("child closed stdin before payload was delivered");
                }
                Err(source) => {
                    return Err(Error::Pump {
                        stream: StreamRole::Stdin,
                        source,
                    })
                }
            }
            Ok(())
        }
        PumpStream::Drain {
            stream,
            mut reader,
            sink,
        } => {
            let mut chunk = vec![0u8; chunk_size];
            loop {
                match reader.read(&mut chunk) {
                    Ok(0) => break,
                    Ok(n) => sink.append(&chunk[..n]),
                    Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                    Err(source) => return Err(Error::Pump { stream, source }),
                }
            }
            debug!(%stream, "end of stream");
            Ok(())
        }
    }
}

#[cfg(unix)]
mod reactor {
    use std::io;
    use std::os::fd::OwnedFd;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::unix::pipe;
    use tokio::task::JoinSet;
    use tracing::{debug, warn};

    use super::super::binding::{PumpStream, StreamRole};
    use crate::error::{Error, Result};

    pub(super) fn run(streams: Vec<PumpStream>, chunk_size: usize) -> Result<()> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_io()
            .build()
            .map_err(Error::Runtime)?;

        runtime.block_on(async move {
            let mut tasks = JoinSet::new();
            for stream in streams {
                tasks.spawn(service(stream, chunk_size));
            }

            let mut outcome = Ok(());
            while let Some(joined) = tasks.join_next().await {
                match joined {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => {
                        warn!(error = %err, "stream pump failed");
                        // Dropping the remaining ends lets the child see EOF/EPIPE.
                        tasks.abort_all();
                        if outcome.is_ok() {
                            outcome = Err(err);
                        }
                    }
                    Err(join_err) if join_err.is_panic() => {
                        std::panic::resume_unwind(join_err.into_panic())
                    }
                    Err(_) => {}
                }
            }
            outcome
        })
    }

    async fn service(stream: PumpStream, chunk_size: usize) -> Result<()> {
        match stream {
            PumpStream::Feed { writer, payload } => {
                let fail = |source| Error::Pump {
                    stream: StreamRole::Stdin,
                    source,
                };
                let mut sender = pipe::Sender::from_owned_fd(OwnedFd::from(writer)).map_err(fail)?;
                let mut offset = 0;
                while offset < payload.len() {
                    match sender.write(&payload[offset..]).await {
                        Ok(0) => return Err(fail(io::ErrorKind::WriteZero.into())),
                        Ok(n) => offset += n,
                        Err(err) if err.kind() == io::ErrorKind::BrokenPipe => {
                            debug!(
                                written = offset,
                                "child closed stdin before payload was delivered"
                            );
                            break;
                        }
                        Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                        Err(source) => return Err(fail(source)),
                    }
                }
                drop(sender);
                debug!(bytes = offset, "stdin closed");
                Ok(())
            }
            PumpStream::Drain {
                stream,
                reader,
                sink,
            } => {
                let mut receiver = pipe::Receiver::from_owned_fd(OwnedFd::from(reader))
                    .map_err(|source| Error::Pump { stream, source })?;
                let mut chunk = vec![0u8; chunk_size];
                loop {
                    match receiver.read(&mut chunk).await {
                        Ok(0) => break,
                        Ok(n) => sink.append(&chunk[..n]),
                        Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                        Err(source) => return Err(Error::Pump { stream, source }),
                    }
                }
                debug!(%stream, "end of stream");
                Ok(())
            }
        }
    }
}
