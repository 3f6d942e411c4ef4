//! Supervised subprocess execution.
//!
//! Every child runs in its own process group. On timeout or cancellation the
//! whole group receives SIGTERM, then SIGKILL after a grace period, and the
//! watchdog waits (bounded) until no member of the group is left alive.

use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::ffi::OsString;
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info, warn};

use crate::domain::errors::{AgentError, AgentResult};
use crate::domain::models::result::TIMEOUT_EXIT_CODE;

/// Interval at which a terminated group is polled for survivors.
const REAP_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// What to run.
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    /// Executable to run.
    pub program: PathBuf,
    /// Arguments, in order.
    pub args: Vec<OsString>,
    /// Extra environment on top of the agent's.
    pub env: Vec<(String, String)>,
    /// Working directory; the agent's when unset.
    pub working_dir: Option<PathBuf>,
    /// Wall-clock limit.
    pub timeout: Duration,
}

impl ProcessSpec {
    /// Run `program` with no arguments under `timeout`.
    pub fn new(program: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            working_dir: None,
            timeout,
        }
    }

    /// Append one argument.
    #[must_use]
    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append several arguments.
    #[must_use]
    pub fn args<I, A>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Set one environment variable.
    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Run in `dir`.
    #[must_use]
    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }
}

/// Outcome of one supervised run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawOutcome {
    /// Exit code; 124 on timeout and never 0 after a cancellation.
    pub exit_code: i32,
    /// Captured stdout.
    pub stdout: String,
    /// Captured stderr.
    pub stderr: String,
    /// Whether the timeout fired.
    pub timed_out: bool,
    /// Reason given for cancellation, when the run was cancelled.
    pub cancelled: Option<String>,
    /// Process group the child ran in.
    pub pgid: Option<i32>,
}

/// Termination timing.
#[derive(Debug, Clone, Copy)]
pub struct WatchdogSettings {
    /// Time between SIGTERM and SIGKILL.
    pub kill_grace: Duration,
    /// Upper bound on waiting for a killed group to disappear and for
    /// output readers to drain.
    pub reap_timeout: Duration,
}

impl Default for WatchdogSettings {
    fn default() -> Self {
        Self {
            kill_grace: Duration::from_secs(5),
            reap_timeout: Duration::from_secs(10),
        }
    }
}

enum Ending {
    Exited(ExitStatus),
    TimedOut,
    Cancelled(String),
}

/// Runs processes in isolated groups with an enforced wall-clock timeout.
#[derive(Debug, Clone, Default)]
pub struct ProcessWatchdog {
    settings: WatchdogSettings,
}

impl ProcessWatchdog {
    /// Watchdog with the given timing.
    pub const fn new(settings: WatchdogSettings) -> Self {
        Self { settings }
    }

    /// Run `spec` to completion, timeout or cancellation.
    ///
    /// `cancel` fires with a reason to abort the run. A dropped sender never
    /// cancels.
    pub async fn run(
        &self,
        spec: ProcessSpec,
        cancel: Option<oneshot::Receiver<String>>,
    ) -> AgentResult<RawOutcome> {
        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true);
        if let Some(dir) = &spec.working_dir {
            command.current_dir(dir);
        }

        let mut child = command.spawn().map_err(|e| AgentError::Spawn {
            program: spec.program.display().to_string(),
            reason: e.to_string(),
        })?;

        // With process_group(0) the group id equals the child's pid.
        let pgid = child.id().and_then(|id| i32::try_from(id).ok());
        let mut guard = GroupGuard::arm(pgid);
        debug!(program = %spec.program.display(), pgid, "spawned supervised process");

        let stdout_buf = Arc::new(Mutex::new(Vec::new()));
        let stderr_buf = Arc::new(Mutex::new(Vec::new()));
        let readers = [
            child.stdout.take().map(|s| spawn_reader(s, Arc::clone(&stdout_buf))),
            child.stderr.take().map(|s| spawn_reader(s, Arc::clone(&stderr_buf))),
        ];

        let cancelled = async move {
            match cancel {
                Some(rx) => match rx.await {
                    Ok(reason) => reason,
                    Err(_) => std::future::pending().await,
                },
                None => std::future::pending().await,
            }
        };

        let ending = tokio::select! {
            status = child.wait() => Ending::Exited(status?),
            () = sleep(spec.timeout) => Ending::TimedOut,
            reason = cancelled => Ending::Cancelled(reason),
        };

        let (status, timed_out, cancelled) = match ending {
            Ending::Exited(status) => {
                // Daemons a script leaves behind on success are not ours to kill.
                guard.disarm();
                (status, false, None)
            }
            Ending::TimedOut => {
                warn!(
                    program = %spec.program.display(),
                    pgid,
                    timeout_secs = spec.timeout.as_secs(),
                    "process timed out, terminating its group"
                );
                (self.terminate_group(&mut child, pgid).await?, true, None)
            }
            Ending::Cancelled(reason) => {
                info!(program = %spec.program.display(), pgid, %reason, "process cancelled");
                (self.terminate_group(&mut child, pgid).await?, false, Some(reason))
            }
        };
        guard.disarm();

        for reader in readers.into_iter().flatten() {
            self.join_reader(reader).await;
        }

        let stdout = take_text(&stdout_buf);
        let mut stderr = take_text(&stderr_buf);
        let mut exit_code = exit_code_of(status);

        if timed_out {
            exit_code = TIMEOUT_EXIT_CODE;
            if !stderr.is_empty() && !stderr.ends_with('\n') {
                stderr.push('\n');
            }
            stderr.push_str(&format!(
                "{}; process group was terminated",
                AgentError::ExecutionTimeout(spec.timeout.as_secs())
            ));
        } else if cancelled.is_some() && exit_code == 0 {
            exit_code = 1;
        }

        Ok(RawOutcome {
            exit_code,
            stdout,
            stderr,
            timed_out,
            cancelled,
            pgid,
        })
    }

    /// SIGTERM the group, SIGKILL after the grace period, reap the child and
    /// wait until the group has no members left.
    async fn terminate_group(
        &self,
        child: &mut tokio::process::Child,
        pgid: Option<i32>,
    ) -> AgentResult<ExitStatus> {
        let Some(pgid) = pgid else {
            // Already reaped; nothing left to signal.
            return Ok(child.wait().await?);
        };
        let group = Pid::from_raw(pgid);

        signal_group(group, Signal::SIGTERM);
        let status = match timeout(self.settings.kill_grace, child.wait()).await {
            Ok(status) => status?,
            Err(_) => {
                signal_group(group, Signal::SIGKILL);
                child.wait().await?
            }
        };

        // Descendants may ignore SIGTERM even after the leader exited.
        if group_alive(group) {
            sleep(self.settings.kill_grace.min(Duration::from_millis(500))).await;
            signal_group(group, Signal::SIGKILL);
        }

        let deadline = Instant::now() + self.settings.reap_timeout;
        while group_alive(group) && Instant::now() < deadline {
            sleep(REAP_POLL_INTERVAL).await;
        }
        if group_alive(group) {
            warn!(pgid, "process group still present after reap timeout");
        }

        Ok(status)
    }

    async fn join_reader(&self, mut reader: JoinHandle<()>) {
        if timeout(self.settings.reap_timeout, &mut reader).await.is_err() {
            // A detached descendant still holds the pipe open.
            debug!("output reader did not finish, keeping partial output");
            reader.abort();
        }
    }
}

/// SIGKILLs the process group when a run is dropped before it finished
/// supervising the group, e.g. when the runtime shuts down mid-command.
struct GroupGuard {
    group: Option<Pid>,
    armed: bool,
}

impl GroupGuard {
    fn arm(pgid: Option<i32>) -> Self {
        Self {
            group: pgid.map(Pid::from_raw),
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for GroupGuard {
    fn drop(&mut self) {
        let Some(group) = self.group.filter(|_| self.armed) else {
            return;
        };
        if group_alive(group) {
            warn!(pgid = group.as_raw(), "supervision abandoned, killing process group");
            signal_group(group, Signal::SIGKILL);
        }
    }
}

fn spawn_reader<R>(mut source: R, sink: Arc<Mutex<Vec<u8>>>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut chunk = [0_u8; 8192];
        loop {
            match source.read(&mut chunk).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if let Ok(mut buf) = sink.lock() {
                        buf.extend_from_slice(&chunk[..n]);
                    }
                }
            }
        }
    })
}

fn take_text(buf: &Mutex<Vec<u8>>) -> String {
    buf.lock()
        .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
        .unwrap_or_default()
}

fn signal_group(group: Pid, signal: Signal) {
    match killpg(group, signal) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(err) => warn!(pgid = group.as_raw(), ?signal, %err, "failed to signal process group"),
    }
}

/// Whether any process, zombies included, still belongs to `group`.
fn group_alive(group: Pid) -> bool {
    !matches!(killpg(group, None::<Signal>), Err(Errno::ESRCH))
}

fn exit_code_of(status: ExitStatus) -> i32 {
    status
        .code()
        .or_else(|| status.signal().map(|sig| 128 + sig))
        .unwrap_or(-1)
}
