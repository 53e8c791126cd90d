//! Process pool for running many children with a concurrency limit.
//!
//! Each child runs to completion on tokio's blocking thread pool; a
//! semaphore bounds how many are alive at once.

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Semaphore};
use tracing::{debug, warn};

use super::spawn::ProcessOptions;
use super::wait::Completion;
use crate::error::Error;

/// A unique identifier for a pooled process.
pub type ProcessId = usize;

/// Handle to a process queued or running in the pool.
#[derive(Debug)]
pub struct PooledProcess {
    /// Unique ID for this process.
    pub id: ProcessId,

    result_rx: oneshot::Receiver<Result<Completion, Error>>,
}

impl PooledProcess {
    /// Wait for the process to complete and get its outcome.
    pub async fn wait(self) -> Result<Completion> {
        let outcome = self
            .result_rx
            .await
            .context("Process task was dropped before completion")?;
        outcome.with_context(|| format!("Process {} failed", self.id))
    }
}

/// Event emitted by the process pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolEvent {
    /// A process acquired a slot and is being spawned.
    Started { id: ProcessId },

    /// A process finished with an exit code.
    Completed { id: ProcessId, code: i32 },

    /// A process could not be set up or its streams failed.
    Failed { id: ProcessId, error: String },
}

/// A pool for running multiple processes concurrently.
///
/// # Example
///
/// ```rust,no_run
/// use spawnkit::process::{ProcessOptions, ProcessPool};
///
/// #[tokio::main]
/// async fn main() -> anyhow::Result<()> {
///     let pool = ProcessPool::new(4);
///
///     let first = pool.spawn(ProcessOptions::new("sleep").arg("1"));
///     let second = pool.spawn(ProcessOptions::new("sleep").arg("2"));
///
///     println!("first exited with {}", first.wait().await?.code());
///     println!("second exited with {}", second.wait().await?.code());
///     Ok(())
/// }
/// ```
#[derive(Debug)]
pub struct ProcessPool {
    /// Semaphore for limiting concurrency.
    semaphore: Arc<Semaphore>,

    /// Counter for generating unique process IDs.
    next_id: AtomicUsize,

    /// Optional channel for pool-wide events.
    event_tx: Option<mpsc::Sender<PoolEvent>>,
}

impl ProcessPool {
    /// Create a new process pool with the given concurrency limit.
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrent.max(1))),
            next_id: AtomicUsize::new(0),
            event_tx: None,
        }
    }

    /// Create a pool with an event channel for monitoring all processes.
    pub fn with_events(max_concurrent: usize) -> (Self, mpsc::Receiver<PoolEvent>) {
        let (tx, rx) = mpsc::channel(1000);
        let pool = Self {
            event_tx: Some(tx),
            ..Self::new(max_concurrent)
        };
        (pool, rx)
    }

    /// Queue a process in the pool.
    ///
    /// The child starts once a slot is free. Must be called from within a
    /// tokio runtime.
    pub fn spawn(&self, options: ProcessOptions) -> PooledProcess {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let semaphore = self.semaphore.clone();
        let event_tx = self.event_tx.clone();
        let (result_tx, result_rx) = oneshot::channel();

        tokio::spawn(async move {
            // The semaphore is never closed, so this always yields a permit.
            let Ok(permit) = semaphore.acquire_owned().await else {
                return;
            };

            if let Some(ref tx) = event_tx {
                let _ = tx.send(PoolEvent::Started { id }).await;
            }
            debug!(id, argv = ?options.argv, "pooled process starting");

            let outcome = match tokio::task::spawn_blocking(move || options.run()).await {
                Ok(outcome) => outcome,
                Err(join_err) if join_err.is_panic() => {
                    std::panic::resume_unwind(join_err.into_panic())
                }
                Err(_) => return,
            };
            drop(permit);

            let event = match &outcome {
                Ok(completion) => PoolEvent::Completed {
                    id,
                    code: completion.code(),
                },
                Err(err) => {
                    warn!(id, error = %err, "pooled process failed");
                    PoolEvent::Failed {
                        id,
                        error: err.to_string(),
                    }
                }
            };
            if let Some(ref tx) = event_tx {
                let _ = tx.send(event).await;
            }

            let _ = result_tx.send(outcome);
        });

        PooledProcess { id, result_rx }
    }

    /// Run multiple processes and wait for all to complete.
    pub async fn spawn_all(
        &self,
        options_list: Vec<ProcessOptions>,
    ) -> Result<HashMap<ProcessId, Completion>> {
        let handles: Vec<_> = options_list
            .into_iter()
            .map(|options| self.spawn(options))
            .collect();

        let mut results = HashMap::new();
        for proc in handles {
            let id = proc.id;
            results.insert(id, proc.wait().await?);
        }

        Ok(results)
    }

    /// Get the number of available slots in the pool.
    pub fn available_permits(&self) -> usize {
        self.semaphore.available_permits()
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::config::{PumpSettings, PumpStrategy};
    use crate::process::StdioTarget;

    #[tokio::test]
    async fn test_pool_basic() {
        let pool = ProcessPool::new(2);
        let (target, out) = StdioTarget::capture();

        let proc = pool.spawn(ProcessOptions::new("echo").arg("hello").stdout(target));

        let completion = proc.wait().await.unwrap();
        assert!(completion.success());
        assert_eq!(out.to_string_lossy(), "hello\n");
    }

    #[tokio::test]
    async fn test_pool_spawn_all() {
        let pool = ProcessPool::new(4);

        let options = vec![
            ProcessOptions::from_argv(["sh", "-c", "exit 0"]),
            ProcessOptions::from_argv(["sh", "-c", "exit 3"]),
            ProcessOptions::new("this_command_not_found_in_paths"),
        ];

        let results = pool.spawn_all(options).await.unwrap();
        assert_eq!(results.len(), 3);
        assert_eq!(results[&0].code(), 0);
        assert_eq!(results[&1].code(), 3);
        assert_eq!(results[&2].code(), 127);
    }

    #[tokio::test]
    async fn test_pool_with_events() {
        let (pool, mut events) = ProcessPool::with_events(2);

        let proc = pool.spawn(ProcessOptions::from_argv(["sh", "-c", "exit 5"]));
        let id = proc.id;
        assert_eq!(proc.wait().await.unwrap().code(), 5);

        assert_eq!(events.recv().await, Some(PoolEvent::Started { id }));
        assert_eq!(events.recv().await, Some(PoolEvent::Completed { id, code: 5 }));
    }

    #[tokio::test]
    async fn test_pool_reports_setup_failure() {
        let (pool, mut events) = ProcessPool::with_events(1);

        let proc = pool.spawn(ProcessOptions::from_argv(Vec::<String>::new()));
        let id = proc.id;
        assert!(proc.wait().await.is_err());

        assert_eq!(events.recv().await, Some(PoolEvent::Started { id }));
        assert!(matches!(events.recv().await, Some(PoolEvent::Failed { .. })));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_pool_runs_reactor_pump() {
        let pool = ProcessPool::new(2);
        let payload: Vec<u8> = (0..1_000_000u32).map(|i| (i % 241) as u8).collect();
        let (target, out) = StdioTarget::capture();

        let proc = pool.spawn(
            ProcessOptions::new("cat")
                .stdin(StdioTarget::bytes(payload.clone()))
                .stdout(target)
                .pump(PumpSettings::default().strategy(PumpStrategy::Reactor)),
        );

        assert_eq!(proc.wait().await.unwrap().code(), 0);
        assert!(out.contents() == payload);
    }

    #[tokio::test]
    async fn test_pool_concurrency_limit() {
        use std::time::{Duration, Instant};

        let pool = ProcessPool::new(1);
        let start = Instant::now();

        let proc1 = pool.spawn(ProcessOptions::new("sleep").arg("0.1"));
        let proc2 = pool.spawn(ProcessOptions::new("sleep").arg("0.1"));

        proc1.wait().await.unwrap();
        proc2.wait().await.unwrap();

        // With a limit of 1 the sleeps run back to back.
        assert!(start.elapsed() >= Duration::from_millis(180));
        assert_eq!(pool.available_permits(), 1);
    }
}
