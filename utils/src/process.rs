//! Process launching with owned protocol pipes, per-process output channels,
//! and process-tree termination.
//!
//! Every long-lived child (debugger, test host, `dotnet` invocations) goes
//! through a [`ProcessLauncher`]. The returned [`ProcessHandle`] is the only
//! way to reach the child: protocol pipes are taken exactly once by their
//! owner, diagnostic output is published line by line into a bounded channel,
//! and [`ProcessHandle::kill_tree`] always targets the whole process group.

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader};
use tokio::process::Command;
use tokio::sync::{Notify, mpsc, watch};

/// Capacity of the per-process output channel.
const OUTPUT_CHANNEL_CAPACITY: usize = 256;

/// Grace given to a killed process to be reaped before giving up on it.
const REAP_TIMEOUT: Duration = Duration::from_secs(2);

pub type BoxedReader = Box<dyn AsyncRead + Send + Sync + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Sync + Unpin>;

#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("{program} not found in PATH")]
    NotFound { program: String },
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("{program} did not finish within {timeout:?}")]
    TimedOut { program: String, timeout: Duration },
}

/// How the child's standard streams are wired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StdioMode {
    /// stdin/stdout carry a protocol and are handed to the owner; stderr is
    /// published on the output channel.
    Protocol,
    /// stdin is closed; stdout and stderr are both published on the output channel.
    #[default]
    Lines,
}

#[derive(Debug, Clone)]
pub struct ProcessSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub cwd: Option<PathBuf>,
    pub stdio: StdioMode,
    /// Short name used in log lines (e.g. `netcoredbg`, `testhost`).
    pub label: String,
}

impl ProcessSpec {
    #[must_use]
    pub fn new(program: impl Into<String>) -> Self {
        let program = program.into();
        let label = PathBuf::from(&program)
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_else(|| program.clone());
        Self {
            program,
            args: Vec::new(),
            env: HashMap::new(),
            cwd: None,
            stdio: StdioMode::default(),
            label,
        }
    }

    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    #[must_use]
    pub fn stdio(mut self, stdio: StdioMode) -> Self {
        self.stdio = stdio;
        self
    }

    #[must_use]
    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    /// Render as a shell-like command line for logs.
    #[must_use]
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputLine {
    Stdout(String),
    Stderr(String),
}

impl OutputLine {
    #[must_use]
    pub fn text(&self) -> &str {
        match self {
            Self::Stdout(line) | Self::Stderr(line) => line,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessExit {
    /// `None` when the process was terminated by a signal.
    pub code: Option<i32>,
}

impl ProcessExit {
    #[must_use]
    pub fn success(self) -> bool {
        self.code == Some(0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillOutcome {
    NotRunning,
    Killed,
}

/// Termination hook behind a [`ProcessHandle`]. Must be idempotent.
pub trait ProcessControl: Send + Sync {
    fn kill_tree(&self) -> io::Result<KillOutcome>;
}

/// Starts external processes. The `dotnet`, debugger and test-host glue only
/// ever talk to this trait, so tests can substitute scripted processes.
pub trait ProcessLauncher: Send + Sync {
    fn launch(&self, spec: &ProcessSpec) -> Result<ProcessHandle, LaunchError>;
}

/// Exclusive handle to a running child.
pub struct ProcessHandle {
    label: String,
    pid: Option<u32>,
    stdin: Option<BoxedWriter>,
    stdout: Option<BoxedReader>,
    output: Option<mpsc::Receiver<OutputLine>>,
    exit: watch::Receiver<Option<ProcessExit>>,
    control: Arc<dyn ProcessControl>,
}

impl std::fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("label", &self.label)
            .field("pid", &self.pid)
            .field("exit", &*self.exit.borrow())
            .finish_non_exhaustive()
    }
}

impl ProcessHandle {
    /// Assemble a handle from its parts. Used by launchers.
    #[must_use]
    pub fn from_parts(
        label: impl Into<String>,
        pid: Option<u32>,
        stdin: Option<BoxedWriter>,
        stdout: Option<BoxedReader>,
        output: Option<mpsc::Receiver<OutputLine>>,
        exit: watch::Receiver<Option<ProcessExit>>,
        control: Arc<dyn ProcessControl>,
    ) -> Self {
        Self {
            label: label.into(),
            pid,
            stdin,
            stdout,
            output,
            exit,
            control,
        }
    }

    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn take_stdin(&mut self) -> Option<BoxedWriter> {
        self.stdin.take()
    }

    pub fn take_stdout(&mut self) -> Option<BoxedReader> {
        self.stdout.take()
    }

    pub fn take_output(&mut self) -> Option<mpsc::Receiver<OutputLine>> {
        self.output.take()
    }

    #[must_use]
    pub fn exit_status(&self) -> Option<ProcessExit> {
        *self.exit.borrow()
    }

    #[must_use]
    pub fn exit_watch(&self) -> watch::Receiver<Option<ProcessExit>> {
        self.exit.clone()
    }

    /// Wait for the process to exit.
    pub async fn wait(&self) -> ProcessExit {
        wait_for_exit(self.exit.clone()).await
    }

    pub async fn wait_timeout(&self, timeout: Duration) -> Option<ProcessExit> {
        tokio::time::timeout(timeout, self.wait()).await.ok()
    }

    /// Kill the process and every descendant in its group.
    pub fn kill_tree(&self) -> io::Result<KillOutcome> {
        if self.exit_status().is_some() {
            return Ok(KillOutcome::NotRunning);
        }
        self.control.kill_tree()
    }

    /// Wait up to `grace` for a voluntary exit, then kill the tree.
    ///
    /// The caller is expected to have sent its protocol-level termination
    /// signal (DAP `disconnect`, MTP `exit`, stdin close) before calling this.
    pub async fn terminate(&self, grace: Duration) -> Option<ProcessExit> {
        if let Some(exit) = self.wait_timeout(grace).await {
            return Some(exit);
        }
        tracing::debug!(process = %self.label, "Process did not exit in time, killing tree");
        self.force_terminate().await
    }

    /// Kill the tree immediately and reap.
    pub async fn force_terminate(&self) -> Option<ProcessExit> {
        if let Err(e) = self.kill_tree() {
            tracing::warn!(process = %self.label, "Failed to kill process tree: {e}");
        }
        self.wait_timeout(REAP_TIMEOUT).await
    }
}

async fn wait_for_exit(mut exit: watch::Receiver<Option<ProcessExit>>) -> ProcessExit {
    match exit.wait_for(Option::is_some).await {
        Ok(status) => status.unwrap_or(ProcessExit { code: None }),
        // Sender dropped without reporting: the waiter is gone, treat as exited.
        Err(_) => ProcessExit { code: None },
    }
}

/// Forward a process's output lines to the log until the channel closes.
pub fn spawn_output_logger(
    label: String,
    mut output: mpsc::Receiver<OutputLine>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(line) = output.recv().await {
            match line {
                OutputLine::Stdout(text) => tracing::debug!(process = %label, "{text}"),
                OutputLine::Stderr(text) => tracing::debug!(process = %label, stream = "stderr", "{text}"),
            }
        }
    })
}

/// Output of a process run to completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedProcess {
    pub exit: ProcessExit,
    pub stdout: Vec<String>,
    pub stderr: Vec<String>,
}

/// Launch `spec` in [`StdioMode::Lines`], collect all output, and wait for exit.
///
/// On timeout the process tree is killed.
pub async fn run_to_completion(
    launcher: &dyn ProcessLauncher,
    spec: &ProcessSpec,
    timeout: Duration,
) -> Result<CompletedProcess, LaunchError> {
    let spec = spec.clone().stdio(StdioMode::Lines);
    let mut handle = launcher.launch(&spec)?;
    let mut output = handle.take_output();

    let collect = async {
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        if let Some(rx) = output.as_mut() {
            while let Some(line) = rx.recv().await {
                match line {
                    OutputLine::Stdout(text) => stdout.push(text),
                    OutputLine::Stderr(text) => stderr.push(text),
                }
            }
        }
        let exit = handle.wait().await;
        CompletedProcess {
            exit,
            stdout,
            stderr,
        }
    };

    match tokio::time::timeout(timeout, collect).await {
        Ok(completed) => Ok(completed),
        Err(_) => {
            handle.force_terminate().await;
            Err(LaunchError::TimedOut {
                program: spec.program.clone(),
                timeout,
            })
        }
    }
}

/// Launches real OS processes via `tokio::process`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioProcessLauncher;

impl ProcessLauncher for TokioProcessLauncher {
    fn launch(&self, spec: &ProcessSpec) -> Result<ProcessHandle, LaunchError> {
        let program = which::which(&spec.program).map_err(|_| LaunchError::NotFound {
            program: spec.program.clone(),
        })?;

        let mut cmd = Command::new(&program);
        cmd.args(&spec.args)
            .envs(&spec.env)
            .stderr(Stdio::piped())
            .stdout(Stdio::piped())
            .kill_on_drop(true);
        match spec.stdio {
            StdioMode::Protocol => cmd.stdin(Stdio::piped()),
            StdioMode::Lines => cmd.stdin(Stdio::null()),
        };
        if let Some(cwd) = &spec.cwd {
            cmd.current_dir(cwd);
        }
        #[cfg(unix)]
        set_new_session(&mut cmd);

        tracing::debug!(process = %spec.label, command = %spec.display(), "Spawning process");
        let mut child = cmd.spawn().map_err(|source| LaunchError::Spawn {
            program: spec.program.clone(),
            source,
        })?;
        let pid = child.id();

        let (output_tx, output_rx) = mpsc::channel(OUTPUT_CHANNEL_CAPACITY);
        if let Some(stderr) = child.stderr.take() {
            spawn_line_pump(stderr, output_tx.clone(), OutputLine::Stderr);
        }

        let (stdin, stdout): (Option<BoxedWriter>, Option<BoxedReader>) = match spec.stdio {
            StdioMode::Protocol => (
                child.stdin.take().map(|s| Box::new(s) as BoxedWriter),
                child.stdout.take().map(|s| Box::new(s) as BoxedReader),
            ),
            StdioMode::Lines => {
                if let Some(stdout) = child.stdout.take() {
                    spawn_line_pump(stdout, output_tx.clone(), OutputLine::Stdout);
                }
                (None, None)
            }
        };
        drop(output_tx);

        let (exit_tx, exit_rx) = watch::channel(None);
        let kill_requested = Arc::new(Notify::new());
        let waiter_kill = kill_requested.clone();
        let label = spec.label.clone();
        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                () = waiter_kill.notified() => {
                    let _ = child.start_kill();
                    child.wait().await
                }
            };
            let exit = match status {
                Ok(status) => ProcessExit {
                    code: status.code(),
                },
                Err(e) => {
                    tracing::warn!(process = %label, "Failed to wait for process: {e}");
                    ProcessExit { code: None }
                }
            };
            tracing::debug!(process = %label, code = ?exit.code, "Process exited");
            let _ = exit_tx.send(Some(exit));
        });

        Ok(ProcessHandle::from_parts(
            spec.label.clone(),
            pid,
            stdin,
            stdout,
            Some(output_rx),
            exit_rx,
            Arc::new(OsProcessControl {
                pid,
                kill_requested,
            }),
        ))
    }
}

fn spawn_line_pump<R>(
    reader: R,
    tx: mpsc::Sender<OutputLine>,
    wrap: fn(String) -> OutputLine,
) where
    R: AsyncRead + Send + Unpin + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        let mut forwarding = true;
        // Keep reading after the receiver is gone so the child never blocks on a full pipe.
        while let Ok(Some(line)) = lines.next_line().await {
            if forwarding && tx.send(wrap(line)).await.is_err() {
                forwarding = false;
            }
        }
    });
}

struct OsProcessControl {
    pid: Option<u32>,
    kill_requested: Arc<Notify>,
}

impl ProcessControl for OsProcessControl {
    fn kill_tree(&self) -> io::Result<KillOutcome> {
        let outcome = match self.pid {
            Some(pid) => try_kill_process_group(pid),
            None => Ok(KillOutcome::NotRunning),
        };
        // Always ask the waiter to kill the root too, in case the group kill missed it.
        self.kill_requested.notify_one();
        outcome
    }
}

/// Terminate a process and its descendants, best-effort.
///
/// On Unix this targets the process group whose id equals `pid` (children are
/// started in their own session, making pid == process group id). On Windows
/// it delegates to `taskkill /T`.
pub fn try_kill_process_group(pid: u32) -> io::Result<KillOutcome> {
    #[cfg(unix)]
    {
        let Ok(pgid) = libc::pid_t::try_from(pid) else {
            return Ok(KillOutcome::NotRunning);
        };
        // SAFETY: killpg has no memory-safety preconditions.
        if unsafe { libc::killpg(pgid, libc::SIGKILL) } == -1 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::ESRCH) {
                return Ok(KillOutcome::NotRunning);
            }
            return Err(err);
        }
        Ok(KillOutcome::Killed)
    }

    #[cfg(windows)]
    {
        let status = std::process::Command::new("taskkill")
            .args(["/T", "/F", "/PID", &pid.to_string()])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()?;
        // taskkill exits with 128 when the process does not exist.
        if status.success() {
            Ok(KillOutcome::Killed)
        } else if status.code() == Some(128) {
            Ok(KillOutcome::NotRunning)
        } else {
            Err(io::Error::other(format!("taskkill failed with {status}")))
        }
    }
}

/// Put the child process in its own session (Unix only) so the entire process
/// group can be killed via `killpg`.
#[cfg(unix)]
pub fn set_new_session(cmd: &mut Command) {
    // SAFETY: the pre_exec closure only calls async-signal-safe libc functions.
    unsafe {
        cmd.pre_exec(|| {
            if libc::setsid() == -1 {
                return Err(io::Error::last_os_error());
            }
            // Linux-only: make sure the child dies with the service.
            #[cfg(target_os = "linux")]
            if libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL) == -1 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        });
    }
}

pub mod memory {
    //! In-process stand-ins for child processes.
    //!
    //! [`pair`] returns a [`ProcessHandle`] whose pipes are connected to an
    //! [`InMemoryProcess`] the caller drives, so protocol owners can be
    //! exercised without spawning anything.

    use std::io;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tokio::io::{DuplexStream, duplex};
    use tokio::sync::{mpsc, watch};

    use super::{
        BoxedReader, BoxedWriter, KillOutcome, OutputLine, ProcessControl, ProcessExit,
        ProcessHandle,
    };

    const PIPE_CAPACITY: usize = 64 * 1024;

    /// The child's side of an in-memory process.
    pub struct InMemoryProcess {
        /// Reads what the parent writes to the child's stdin.
        pub stdin: DuplexStream,
        /// Written bytes appear on the parent's stdout reader.
        pub stdout: DuplexStream,
        pub output: mpsc::Sender<OutputLine>,
        exit: watch::Sender<Option<ProcessExit>>,
        kills: Arc<AtomicUsize>,
    }

    impl InMemoryProcess {
        pub fn exit(&self, code: i32) {
            let _ = self.exit.send(Some(ProcessExit { code: Some(code) }));
        }

        #[must_use]
        pub fn kill_count(&self) -> usize {
            self.kills.load(Ordering::SeqCst)
        }

        /// Shared kill counter that outlives this value.
        #[must_use]
        pub fn kill_counter(&self) -> Arc<AtomicUsize> {
            self.kills.clone()
        }

        #[must_use]
        pub fn exit_sender(&self) -> watch::Sender<Option<ProcessExit>> {
            self.exit.clone()
        }
    }

    struct InMemoryControl {
        exit: watch::Sender<Option<ProcessExit>>,
        kills: Arc<AtomicUsize>,
    }

    impl ProcessControl for InMemoryControl {
        fn kill_tree(&self) -> io::Result<KillOutcome> {
            self.kills.fetch_add(1, Ordering::SeqCst);
            let _ = self.exit.send(Some(ProcessExit { code: None }));
            Ok(KillOutcome::Killed)
        }
    }

    #[must_use]
    pub fn pair(label: &str, pid: Option<u32>) -> (ProcessHandle, InMemoryProcess) {
        let (parent_stdin, child_stdin) = duplex(PIPE_CAPACITY);
        let (child_stdout, parent_stdout) = duplex(PIPE_CAPACITY);
        let (output_tx, output_rx) = mpsc::channel(super::OUTPUT_CHANNEL_CAPACITY);
        let (exit_tx, exit_rx) = watch::channel(None);
        let kills = Arc::new(AtomicUsize::new(0));

        let handle = ProcessHandle::from_parts(
            label,
            pid,
            Some(Box::new(parent_stdin) as BoxedWriter),
            Some(Box::new(parent_stdout) as BoxedReader),
            Some(output_rx),
            exit_rx,
            Arc::new(InMemoryControl {
                exit: exit_tx.clone(),
                kills: kills.clone(),
            }),
        );
        let child = InMemoryProcess {
            stdin: child_stdin,
            stdout: child_stdout,
            output: output_tx,
            exit: exit_tx,
            kills,
        };
        (handle, child)
    }
}
