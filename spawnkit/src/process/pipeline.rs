//! Chaining processes stdout-to-stdin.

use std::thread;

use tracing::{debug, warn};

use super::pipe::Pipe;
use super::spawn::{Process, ProcessOptions};
use super::wait::Completion;
use crate::error::Result;

/// A sequence of processes, each stage's stdout feeding the next one's stdin.
///
/// The first stage keeps its own stdin target and the last keeps its own
/// stdout target; the connections in between are replaced by pipes. Every
/// stage keeps its own stderr.
#[derive(Debug)]
pub struct Pipeline {
    stages: Vec<ProcessOptions>,
}

impl Pipeline {
    /// Start a pipeline with its first stage.
    pub fn new(first: ProcessOptions) -> Self {
        Self {
            stages: vec![first],
        }
    }

    /// Append a stage reading the previous stage's stdout.
    #[must_use]
    pub fn pipe(mut self, next: ProcessOptions) -> Self {
        self.stages.push(next);
        self
    }

    /// Number of stages.
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    /// Always false; a pipeline has at least one stage.
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Spawn every stage.
    ///
    /// If a stage fails setup, the stages already running are waited for
    /// (they see a closed pipe) and the setup error is returned.
    pub fn spawn(self) -> Result<RunningPipeline> {
        let count = self.stages.len();
        let mut running = Vec::with_capacity(count);
        let mut upstream: Option<Pipe> = None;

        for (index, mut stage) in self.stages.into_iter().enumerate() {
            if let Some(pipe) = upstream.take() {
                stage.stdin = pipe.read_end();
            }
            if index + 1 < count {
                match Pipe::create() {
                    Ok(pipe) => {
                        stage.stdout = pipe.write_end();
                        upstream = Some(pipe);
                    }
                    Err(err) => {
                        abandon(running);
                        return Err(err);
                    }
                }
            }

            match stage.spawn() {
                Ok(process) => {
                    debug!(stage = index, pid = process.id(), "pipeline stage started");
                    running.push(process);
                }
                Err(err) => {
                    drop(upstream);
                    abandon(running);
                    return Err(err);
                }
            }
        }

        Ok(RunningPipeline { processes: running })
    }

    /// Spawn every stage and wait for all of them.
    pub fn run(self) -> Result<PipelineCompletion> {
        self.spawn()?.wait()
    }
}

fn abandon(processes: Vec<Process>) {
    for process in processes {
        if let Err(err) = process.wait() {
            warn!(error = %err, "failed to reap pipeline stage");
        }
    }
}

/// Stages of a pipeline that have been spawned.
#[derive(Debug)]
pub struct RunningPipeline {
    processes: Vec<Process>,
}

impl RunningPipeline {
    /// OS process ids of the stages that were created.
    pub fn ids(&self) -> Vec<Option<u32>> {
        self.processes.iter().map(Process::id).collect()
    }

    /// Wait for every stage concurrently.
    ///
    /// Each stage pumps its own buffers on its own thread, so a stage with
    /// captured output never waits on another stage's reader.
    pub fn wait(self) -> Result<PipelineCompletion> {
        let results: Vec<Result<Completion>> = thread::scope(|scope| {
            let waiters: Vec<_> = self
                .processes
                .into_iter()
                .map(|process| scope.spawn(move || process.wait()))
                .collect();
            waiters
                .into_iter()
                .map(|waiter| {
                    waiter
                        .join()
                        .unwrap_or_else(|panic| std::panic::resume_unwind(panic))
                })
                .collect()
        });

        let stages = results.into_iter().collect::<Result<Vec<_>>>()?;
        Ok(PipelineCompletion { stages })
    }
}

/// Outcome of every stage, in pipeline order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineCompletion {
    /// One completion per stage.
    pub stages: Vec<Completion>,
}

impl PipelineCompletion {
    /// Exit code of the last stage.
    pub fn code(&self) -> i32 {
        self.stages.last().map_or(0, Completion::code)
    }

    /// Exit codes of every stage.
    pub fn codes(&self) -> Vec<i32> {
        self.stages.iter().map(Completion::code).collect()
    }

    /// Whether every stage exited with code 0.
    pub fn success(&self) -> bool {
        self.stages.iter().all(Completion::success)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::process::StdioTarget;

    #[test]
    fn test_echo_sed_grep() {
        let (target, out) = StdioTarget::capture();
        let completion = Pipeline::new(ProcessOptions::from_argv(["echo", "123\n456"]))
            .pipe(ProcessOptions::from_argv(["sed", "-e", "s/3/4/g"]))
            .pipe(ProcessOptions::from_argv(["grep", "4"]).stdout(target))
            .run()
            .unwrap();

        assert_eq!(completion.codes(), vec![0, 0, 0]);
        assert!(completion.success());
        assert_eq!(out.to_string_lossy(), "124\n456\n");
    }

    #[test]
    fn test_large_stream_through_stages() {
        let (target, out) = StdioTarget::capture();
        let (err_target, err) = StdioTarget::capture();
        let script = "head -c 500000 /dev/zero; head -c 300000 /dev/zero >&2";
        let completion = Pipeline::new(
            ProcessOptions::from_argv(["sh", "-c", script]).stderr(err_target),
        )
        .pipe(ProcessOptions::new("cat"))
        .pipe(ProcessOptions::from_argv(["wc", "-c"]).stdout(target))
        .run()
        .unwrap();

        assert_eq!(completion.code(), 0);
        assert_eq!(out.to_string_lossy().trim(), "500000");
        assert_eq!(err.len(), 300_000);
    }

    #[test]
    fn test_first_stage_keeps_stdin() {
        let (target, out) = StdioTarget::capture();
        Pipeline::new(ProcessOptions::new("cat").stdin(StdioTarget::bytes("b\na\n")))
            .pipe(ProcessOptions::new("sort").stdout(target))
            .run()
            .unwrap();
        assert_eq!(out.to_string_lossy(), "a\nb\n");
    }

    #[test]
    fn test_missing_stage_reports_127() {
        let completion = Pipeline::new(ProcessOptions::from_argv(["echo", "lost"]))
            .pipe(ProcessOptions::new("this_command_not_found_in_paths"))
            .run()
            .unwrap();
        assert_eq!(completion.code(), 127);
        assert!(!completion.success());
    }

    #[test]
    fn test_setup_failure_reaps_started_stages() {
        let dir = tempfile::tempdir().unwrap();
        let unwritable = StdioTarget::write_file(dir.path().join("no/dir/out"));
        let err = Pipeline::new(ProcessOptions::from_argv(["echo", "x"]))
            .pipe(ProcessOptions::new("cat").stdout(unwritable))
            .run()
            .unwrap_err();
        assert!(err.is_setup());
    }
}
