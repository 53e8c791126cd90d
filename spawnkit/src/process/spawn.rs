//! Spawning a child with redirected stdio and running it to completion.
//!
//! Provides:
//! - A builder for the argument vector, working directory and environment
//! - Per-stream redirection to files, buffers, handles or shared pipes
//! - Deadlock-free feeding and draining of buffer streams
//! - Exit codes with 127 for children that never ran

use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, warn};

use super::binding::{PumpStream, StdioBindings};
use super::pump::IoPump;
use super::spawner::{CommandSpawner, ProcessHandle, ProcessSpawner, SpawnFailure, SpawnRequest};
use super::target::StdioTarget;
use super::wait::{Completion, ProcessWaiter};
use crate::config::PumpSettings;
use crate::env::Environment;
use crate::error::{Error, Result};
use crate::resolve::resolve_program;

/// Configuration for spawning a process.
#[derive(Debug)]
pub struct ProcessOptions {
    /// Argument vector; the first element names the program.
    pub argv: Vec<String>,

    /// Working directory for the process.
    pub working_dir: Option<PathBuf>,

    /// Complete environment for the child. `None` inherits the parent's.
    pub env: Option<Environment>,

    /// Where stdin comes from.
    pub stdin: StdioTarget,

    /// Where stdout goes.
    pub stdout: StdioTarget,

    /// Where stderr goes.
    pub stderr: StdioTarget,

    /// Pump strategy and chunk size.
    pub pump: PumpSettings,

    /// Process creation strategy.
    pub spawner: Arc<dyn ProcessSpawner>,
}

impl ProcessOptions {
    /// Create new options for the given program.
    pub fn new(program: impl Into<String>) -> Self {
        Self::from_argv([program])
    }

    /// Create options from a full argument vector.
    pub fn from_argv<I, S>(argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            argv: argv.into_iter().map(Into::into).collect(),
            working_dir: None,
            env: None,
            stdin: StdioTarget::Inherit,
            stdout: StdioTarget::Inherit,
            stderr: StdioTarget::Inherit,
            pump: PumpSettings::default(),
            spawner: Arc::new(CommandSpawner),
        }
    }

    /// Add an argument.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.argv.push(arg.into());
        self
    }

    /// Add multiple arguments.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.argv.extend(args.into_iter().map(Into::into));
        self
    }

    /// Set the working directory.
    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Replace the child's environment entirely.
    pub fn environment(mut self, env: Environment) -> Self {
        self.env = Some(env);
        self
    }

    /// Set one variable on top of the parent's environment.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let (key, value): (String, String) = (key.into(), value.into());
        let env = self.env.take().unwrap_or_else(Environment::capture);
        self.env = Some(env.set(key, value));
        self
    }

    /// Remove one variable from the child's environment.
    pub fn env_remove(mut self, key: impl Into<String>) -> Self {
        let key: String = key.into();
        let env = self.env.take().unwrap_or_else(Environment::capture);
        self.env = Some(env.remove(key));
        self
    }

    /// Start the child with an empty environment.
    pub fn env_clear(mut self) -> Self {
        self.env = Some(Environment::empty());
        self
    }

    /// Redirect stdin.
    pub fn stdin(mut self, target: StdioTarget) -> Self {
        self.stdin = target;
        self
    }

    /// Redirect stdout.
    pub fn stdout(mut self, target: StdioTarget) -> Self {
        self.stdout = target;
        self
    }

    /// Redirect stderr.
    pub fn stderr(mut self, target: StdioTarget) -> Self {
        self.stderr = target;
        self
    }

    /// Set the pump settings.
    pub const fn pump(mut self, settings: PumpSettings) -> Self {
        self.pump = settings;
        self
    }

    /// Use a different process creation strategy.
    pub fn spawner(mut self, spawner: Arc<dyn ProcessSpawner>) -> Self {
        self.spawner = spawner;
        self
    }

    /// Create the child and return without waiting for it.
    ///
    /// Fails only for setup problems (redirect files, pipes, handles, empty
    /// argument vector); every prepared handle is closed before the error is
    /// returned. A program that cannot be executed yields a [`Process`]
    /// whose [`wait`](Process::wait) reports exit code 127.
    pub fn spawn(self) -> Result<Process> {
        let Self {
            argv,
            working_dir,
            env,
            stdin,
            stdout,
            stderr,
            pump,
            spawner,
        } = self;

        let mut bindings = StdioBindings::new(stdin, stdout, stderr);
        let Some(program) = argv.first() else {
            bindings.close_all();
            return Err(Error::EmptyCommand);
        };
        bindings.prepare()?;

        let request = SpawnRequest {
            program: resolve_program(program, env.as_ref(), working_dir.as_deref()),
            argv,
            working_dir,
            env,
        };
        let handle = spawner.spawn(&request, bindings.child_stdio());

        if handle.is_live() {
            bindings.close_unused_ends();
        } else {
            bindings.close_all();
        }

        Ok(Process {
            handle,
            bindings,
            pump: IoPump::new(pump),
        })
    }

    /// Spawn, pump all buffer streams, and wait for the child.
    pub fn run(self) -> Result<Completion> {
        self.spawn()?.wait()
    }
}

/// A spawned child (or a failed attempt) awaiting [`wait`](Self::wait).
///
/// Dropping a `Process` without waiting leaves a live child unreaped.
#[derive(Debug)]
pub struct Process {
    handle: ProcessHandle,
    bindings: StdioBindings,
    pump: IoPump,
}

impl Process {
    /// OS process id, if the child was created.
    pub fn id(&self) -> Option<u32> {
        self.handle.id()
    }

    /// Why the child could not be started, if it wasn't.
    pub const fn spawn_failure(&self) -> Option<&SpawnFailure> {
        self.handle.failure()
    }

    /// Pump buffer streams until they close, then wait for the child.
    ///
    /// A pump failure is returned only after the child has been reaped.
    pub fn wait(self) -> Result<Completion> {
        let Self {
            handle,
            mut bindings,
            pump,
        } = self;

        let streams = bindings.parent_streams();
        reap_after_pump(pump, streams, handle, bindings)
    }
}

fn reap_after_pump(
    pump: IoPump,
    streams: Vec<PumpStream>,
    handle: ProcessHandle,
    mut bindings: StdioBindings,
) -> Result<Completion> {
    let pumped = pump.run(streams);
    let completion = ProcessWaiter::wait(handle);
    bindings.close_all();

    match (pumped, completion) {
        (Ok(()), completion) => completion,
        (Err(err), Ok(completion)) => {
            warn!(code = completion.code(), error = %err, "child reaped after pump failure");
            Err(err)
        }
        (Err(err), Err(wait_err)) => {
            warn!(error = %wait_err, "wait failed after pump failure");
            Err(err)
        }
    }
}

/// Run `argv` with inherited stdio and return its exit code.
pub fn run<I, S>(argv: I) -> Result<i32>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let completion = ProcessOptions::from_argv(argv).run()?;
    debug!(code = completion.code(), "run finished");
    Ok(completion.code())
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::config::PumpStrategy;
    use crate::process::{
        ChildStdio, ExitStatus, Pipe, PipeRole, SharedBuffer, StreamRole, EXIT_NOT_STARTED,
    };
    use proptest::prelude::*;
    use std::io;

    fn strategies() -> [PumpSettings; 2] {
        [
            PumpSettings::default().strategy(PumpStrategy::Reactor),
            PumpSettings::default().strategy(PumpStrategy::Threads),
        ]
    }

    #[test]
    fn test_echo_captured() {
        let (target, out) = StdioTarget::capture();
        let completion = ProcessOptions::from_argv(["echo", "-n", "123"])
            .stdout(target)
            .run()
            .unwrap();

        assert_eq!(completion.code(), 0);
        assert!(completion.success());
        assert_eq!(out.contents(), b"123");
    }

    #[test]
    fn test_arguments_with_spaces() {
        let (target, out) = StdioTarget::capture();
        ProcessOptions::from_argv(["/bin/echo", "one", "two words", "three"])
            .stdout(target)
            .run()
            .unwrap();
        assert_eq!(out.to_string_lossy(), "one two words three\n");
    }

    #[test]
    fn test_stdin_round_trip_10mb() {
        let payload: Vec<u8> = (0..10 * 1024 * 1024u32)
            .map(|i| (i.wrapping_mul(31) >> 3) as u8)
            .collect();
        for settings in strategies() {
            let (target, out) = StdioTarget::capture();
            let completion = ProcessOptions::new("cat")
                .stdin(StdioTarget::bytes(payload.clone()))
                .stdout(target)
                .pump(settings)
                .run()
                .unwrap();
            assert_eq!(completion.code(), 0);
            assert_eq!(out.len(), payload.len(), "strategy {}", settings.strategy);
            assert!(out.contents() == payload);
        }
    }

    #[test]
    fn test_empty_stdin_closes() {
        for settings in strategies() {
            let (target, out) = StdioTarget::capture();
            let completion = ProcessOptions::new("cat")
                .stdin(StdioTarget::bytes(Vec::new()))
                .stdout(target)
                .pump(settings)
                .run()
                .unwrap();
            assert_eq!(completion.code(), 0);
            assert!(out.is_empty());
        }
    }

    #[test]
    fn test_stdout_and_stderr_larger_than_pipe_buffer() {
        let script = "head -c 1000000 /dev/zero; head -c 700000 /dev/zero | tr '\\0' e >&2";
        for settings in strategies() {
            let (out_target, out) = StdioTarget::capture();
            let (err_target, err) = StdioTarget::capture();
            let completion = ProcessOptions::from_argv(["sh", "-c", script])
                .stdout(out_target)
                .stderr(err_target)
                .pump(settings)
                .run()
                .unwrap();
            assert_eq!(completion.code(), 0);
            assert_eq!(out.len(), 1_000_000);
            assert!(out.contents().iter().all(|&b| b == 0));
            assert_eq!(err.len(), 700_000);
            assert!(err.contents().iter().all(|&b| b == b'e'));
        }
    }

    #[test]
    fn test_stdout_and_stderr_unmixed() {
        let (out_target, out) = StdioTarget::capture();
        let (err_target, err) = StdioTarget::capture();
        ProcessOptions::from_argv(["sh", "-c", "printf Out; printf Err >&2"])
            .stdout(out_target)
            .stderr(err_target)
            .run()
            .unwrap();
        assert_eq!(out.to_string_lossy(), "Out");
        assert_eq!(err.to_string_lossy(), "Err");
    }

    #[test]
    fn test_same_buffer_for_both_streams() {
        let buf = SharedBuffer::new();
        ProcessOptions::from_argv(["sh", "-c", "printf a; printf b >&2"])
            .stdout(StdioTarget::Buffer(buf.clone()))
            .stderr(StdioTarget::Buffer(buf.clone()))
            .run()
            .unwrap();
        let mut got = buf.contents();
        got.sort_unstable();
        assert_eq!(got, b"ab");
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(run(["true"]).unwrap(), 0);
        assert_eq!(run(["false"]).unwrap(), 1);
        for code in [0, 2, 42, 126, 255] {
            assert_eq!(run(["sh", "-c", &format!("exit {code}")]).unwrap(), code);
        }
    }

    #[test]
    fn test_signal_exit_codes() {
        for signal in [4, 9, 15] {
            let completion = ProcessOptions::from_argv(["sh", "-c", &format!("kill -{signal} $$")])
                .run()
                .unwrap();
            assert_eq!(completion.status(), Some(ExitStatus::Signaled(signal)));
            assert_eq!(completion.code(), 128 + signal);
        }
    }

    #[test]
    fn test_command_not_found() {
        let process = ProcessOptions::new("this_command_not_found_in_paths")
            .stdout(StdioTarget::capture().0)
            .spawn()
            .unwrap();
        assert!(process.id().is_none());
        assert!(process.spawn_failure().unwrap().is_not_found());
        let completion = process.wait().unwrap();
        assert_eq!(completion.code(), EXIT_NOT_STARTED);

        assert_eq!(run(["/path/to/this_command_not_exists"]).unwrap(), 127);
    }

    #[test]
    fn test_no_permission() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("script.sh");
        std::fs::write(&script, "#!/bin/sh\necho 123\n").unwrap();

        let completion = ProcessOptions::new(script.display().to_string())
            .run()
            .unwrap();
        assert_eq!(completion.code(), 127);
        assert!(completion.spawn_failure().unwrap().is_permission_denied());
    }

    #[test]
    fn test_redirect_truncate_then_append() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.txt");
        std::fs::write(&path, "OLD").unwrap();

        ProcessOptions::from_argv(["echo", "-n", "first"])
            .stdout(StdioTarget::write_file(&path))
            .run()
            .unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "first");

        ProcessOptions::from_argv(["echo", "-n", "second"])
            .stdout(StdioTarget::append_file(&path))
            .run()
            .unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "firstsecond");
    }

    #[test]
    fn test_redirect_stderr_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("err.txt");
        ProcessOptions::from_argv(["sh", "-c", "printf 123 >&2"])
            .stderr(StdioTarget::write_file(&path))
            .run()
            .unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "123");
    }

    #[test]
    fn test_stdin_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("in.txt");
        std::fs::write(&path, "from a file").unwrap();
        let (target, out) = StdioTarget::capture();
        ProcessOptions::new("cat")
            .stdin(StdioTarget::read_file(&path))
            .stdout(target)
            .run()
            .unwrap();
        assert_eq!(out.to_string_lossy(), "from a file");
    }

    #[test]
    fn test_devnull() {
        let completion = ProcessOptions::from_argv(["/bin/echo", "123"])
            .stdin(StdioTarget::null_input())
            .stdout(StdioTarget::null_output())
            .run()
            .unwrap();
        assert_eq!(completion.code(), 0);
    }

    #[test]
    fn test_handle_target() {
        let mut file = tempfile::tempfile().unwrap();
        ProcessOptions::from_argv(["echo", "-n", "via handle"])
            .stdout(StdioTarget::handle(&file).unwrap())
            .run()
            .unwrap();

        use std::io::{Read, Seek, SeekFrom};
        file.seek(SeekFrom::Start(0)).unwrap();
        let mut content = String::new();
        file.read_to_string(&mut content).unwrap();
        assert_eq!(content, "via handle");
    }

    #[test]
    fn test_missing_redirect_file_is_setup_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = ProcessOptions::new("true")
            .stdin(StdioTarget::read_file(dir.path().join("absent")))
            .run()
            .unwrap_err();
        assert!(err.is_setup());
        assert!(err.to_string().contains("absent"));
    }

    #[test]
    fn test_empty_argv_is_setup_error() {
        let err = ProcessOptions::from_argv(Vec::<String>::new()).run().unwrap_err();
        assert!(matches!(err, Error::EmptyCommand));
    }

    #[test]
    fn test_environment_replaced() {
        let (target, out) = StdioTarget::capture();
        ProcessOptions::from_argv([
            "/bin/sh",
            "-c",
            "if [ \"$ONLY_VAR\" = visible ] && [ -z \"$HOME\" ]; \
             then printf isolated; else printf leaked; fi",
        ])
        .environment(Environment::empty().set("ONLY_VAR", "visible"))
        .stdout(target)
        .run()
        .unwrap();
        assert_eq!(out.to_string_lossy(), "isolated");
    }

    #[test]
    fn test_environment_appended() {
        let (target, out) = StdioTarget::capture();
        ProcessOptions::from_argv([
            "sh",
            "-c",
            "printf \"$MY_APPEND_VAR\"; if [ -n \"$PATH\" ]; then printf _haspath; fi",
        ])
        .env("MY_APPEND_VAR", "appended")
        .stdout(target)
        .run()
        .unwrap();
        assert_eq!(out.to_string_lossy(), "appended_haspath");
    }

    #[test]
    fn test_working_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("relative.txt"), "Relative Content").unwrap();
        let (target, out) = StdioTarget::capture();
        ProcessOptions::from_argv(["cat", "relative.txt"])
            .working_dir(dir.path())
            .stdout(target)
            .run()
            .unwrap();
        assert_eq!(out.to_string_lossy(), "Relative Content");
    }

    #[test]
    fn test_spawn_then_wait() {
        let (target, out) = StdioTarget::capture();
        let process = ProcessOptions::from_argv(["sh", "-c", "printf started"])
            .stdout(target)
            .spawn()
            .unwrap();
        assert!(process.id().is_some());
        assert!(process.spawn_failure().is_none());
        assert_eq!(process.wait().unwrap().code(), 0);
        assert_eq!(out.to_string_lossy(), "started");
    }

    #[test]
    fn test_explicit_pipe_chain() {
        let pipe1 = Pipe::create().unwrap();
        let pipe2 = Pipe::create().unwrap();
        let (target, out) = StdioTarget::capture();

        let p1 = ProcessOptions::from_argv(["echo", "123\n456"])
            .stdout(pipe1.write_end())
            .spawn()
            .unwrap();
        let p2 = ProcessOptions::from_argv(["sed", "-e", "s/3/4/g"])
            .stdin(pipe1.read_end())
            .stdout(pipe2.write_end())
            .spawn()
            .unwrap();
        let p3 = ProcessOptions::from_argv(["grep", "4"])
            .stdin(pipe2.read_end())
            .stdout(target)
            .spawn()
            .unwrap();

        assert!(pipe1.is_inert());
        assert!(pipe2.is_inert());
        assert_eq!(p1.wait().unwrap().code(), 0);
        assert_eq!(p2.wait().unwrap().code(), 0);
        assert_eq!(p3.wait().unwrap().code(), 0);
        assert_eq!(out.to_string_lossy(), "124\n456\n");
    }

    #[derive(Debug)]
    struct RefusingSpawner;

    impl ProcessSpawner for RefusingSpawner {
        fn spawn(&self, request: &SpawnRequest, stdio: ChildStdio) -> ProcessHandle {
            drop(stdio);
            ProcessHandle::Invalid(SpawnFailure::new(
                request.argv[0].clone(),
                &io::Error::from(io::ErrorKind::PermissionDenied),
            ))
        }
    }

    #[test]
    fn test_spawn_failure_closes_shared_ends() {
        let pipe = Pipe::create().unwrap();
        let process = ProcessOptions::new("anything")
            .stdin(pipe.read_end())
            .stdout(StdioTarget::capture().0)
            .spawner(Arc::new(RefusingSpawner))
            .spawn()
            .unwrap();
        assert!(!pipe.is_open(PipeRole::Read));
        assert!(pipe.is_open(PipeRole::Write));
        assert_eq!(process.wait().unwrap().code(), EXIT_NOT_STARTED);
    }

    #[test]
    fn test_pipe_end_serves_one_binding() {
        let pipe = Pipe::create().unwrap();
        let (target, out) = StdioTarget::capture();
        let reader = ProcessOptions::new("cat")
            .stdin(pipe.read_end())
            .stdout(target)
            .spawn()
            .unwrap();
        let writer = ProcessOptions::from_argv(["echo", "first"])
            .stdout(pipe.write_end())
            .spawn()
            .unwrap();

        let err = ProcessOptions::from_argv(["echo", "second"])
            .stdout(pipe.write_end())
            .spawn()
            .unwrap_err();
        assert!(matches!(
            err,
            Error::PipeEndClosed {
                role: PipeRole::Write
            }
        ));
        assert!(err.is_setup());

        assert_eq!(writer.wait().unwrap().code(), 0);
        assert_eq!(reader.wait().unwrap().code(), 0);
        assert_eq!(out.to_string_lossy(), "first\n");
    }

    #[test]
    fn test_pump_failure_still_reaps_child() {
        let dir = tempfile::tempdir().unwrap();
        for settings in strategies() {
            let process = ProcessOptions::from_argv(["sh", "-c", "exit 3"])
                .spawn()
                .unwrap();
            let pid = process.id().unwrap();
            let Process {
                handle, bindings, ..
            } = process;

            // A directory is not a pipe, so draining it fails on both strategies.
            let unreadable = std::fs::File::open(dir.path()).unwrap();
            let streams = vec![PumpStream::Drain {
                stream: StreamRole::Stdout,
                reader: io::PipeReader::from(std::os::fd::OwnedFd::from(unreadable)),
                sink: SharedBuffer::new(),
            }];

            let err = reap_after_pump(IoPump::new(settings), streams, handle, bindings)
                .unwrap_err();
            assert!(
                matches!(
                    err,
                    Error::Pump {
                        stream: StreamRole::Stdout,
                        ..
                    }
                ),
                "strategy {}: {err}",
                settings.strategy
            );

            // A zombie would still answer signal 0.
            let liveness = std::process::Command::new("sh")
                .args(["-c", &format!("kill -0 {pid}")])
                .stderr(std::process::Stdio::null())
                .status()
                .unwrap();
            assert!(!liveness.success(), "child {pid} was not reaped");
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]

        #[test]
        fn prop_cat_round_trips_stdin(
            payload in proptest::collection::vec(any::<u8>(), 0..200_000)
        ) {
            let (target, out) = StdioTarget::capture();
            let completion = ProcessOptions::new("cat")
                .stdin(StdioTarget::bytes(payload.clone()))
                .stdout(target)
                .run()
                .unwrap();
            prop_assert_eq!(completion.code(), 0);
            prop_assert_eq!(out.contents(), payload);
        }
    }
}
