//! Process lifecycle: spawn, readiness gate, graceful/forced stop

use super::config::{ServerConfig, Timeouts};
use super::output::{DrainTask, OutputBuffer, OutputStream};
use super::{Error, Result};
use crate::net::PortReadinessProbe;
use std::fmt;
use std::io;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use wait_timeout::ChildExt;

/// How long drain threads get to reach EOF once the child is gone
const DRAIN_GRACE: Duration = Duration::from_millis(250);

/// Lifecycle of a supervised process
///
/// Transitions only move forward:
/// `Unstarted → Starting → Running → Stopping → Stopped`, or
/// `Starting → Failed`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ProcessState {
    #[default]
    Unstarted,
    Starting,
    Running,
    Stopping,
    Stopped(ExitReport),
    Failed(String),
}

impl ProcessState {
    fn rank(&self) -> u8 {
        match self {
            ProcessState::Unstarted => 0,
            ProcessState::Starting => 1,
            ProcessState::Running => 2,
            ProcessState::Stopping => 3,
            ProcessState::Stopped(_) | ProcessState::Failed(_) => 4,
        }
    }

    /// True for `Stopped` and `Failed`
    pub fn is_terminal(&self) -> bool {
        self.rank() == 4
    }

    fn can_become(&self, next: &ProcessState) -> bool {
        match (self, next) {
            (ProcessState::Starting, ProcessState::Failed(_)) => true,
            (_, ProcessState::Failed(_)) => false,
            _ => next.rank() > self.rank(),
        }
    }
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessState::Unstarted => write!(f, "unstarted"),
            ProcessState::Starting => write!(f, "starting"),
            ProcessState::Running => write!(f, "running"),
            ProcessState::Stopping => write!(f, "stopping"),
            ProcessState::Stopped(report) => write!(f, "stopped ({})", report),
            ProcessState::Failed(reason) => write!(f, "failed: {}", reason),
        }
    }
}

/// How the process came to an end
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// It had already exited when stop was requested
    AlreadyExited,
    /// It exited within the graceful window after SIGTERM
    Graceful,
    /// SIGKILL was required
    Forced,
}

/// Outcome of stopping a process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitReport {
    pub pid: u32,
    /// `None` only if the process survived even the kill window
    pub status: Option<ExitStatus>,
    pub termination: Termination,
    pub graceful_timeout: Duration,
}

impl ExitReport {
    /// Exit code, if the process exited normally
    pub fn code(&self) -> Option<i32> {
        self.status.and_then(|s| s.code())
    }

    /// Fail with `ShutdownTimeout` if SIGKILL was needed
    pub fn ensure_graceful(&self) -> Result<()> {
        match self.termination {
            Termination::Forced => Err(Error::ShutdownTimeout {
                pid: self.pid,
                graceful_timeout: self.graceful_timeout,
                status: self.status,
            }),
            _ => Ok(()),
        }
    }
}

impl fmt::Display for ExitReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status {
            Some(status) => write!(f, "{}, {:?}", status, self.termination),
            None => write!(f, "no exit status, {:?}", self.termination),
        }
    }
}

/// Result of [`ProcessSupervisor::run_once`]
#[derive(Debug, Clone)]
pub struct CompletedRun {
    pub status: Option<ExitStatus>,
    /// The run outlived its timeout and was killed
    pub timed_out: bool,
    pub stdout: String,
    pub stderr: String,
}

impl CompletedRun {
    /// Exit code, if the process exited normally
    pub fn code(&self) -> Option<i32> {
        self.status.and_then(|s| s.code())
    }

    /// True if the process exited on its own with status 0
    pub fn success(&self) -> bool {
        !self.timed_out && self.status.map_or(false, |s| s.success())
    }
}

/// A running server under test
///
/// Owned by whoever called [`ProcessSupervisor::start`]. Dropping a handle
/// that was not stopped stops it with the supervisor's timeouts.
pub struct ServerProcessHandle {
    child: Child,
    pid: u32,
    port: u16,
    command_line: Vec<String>,
    stdout: OutputBuffer,
    stderr: OutputBuffer,
    drains: Vec<DrainTask>,
    state: ProcessState,
    timeouts: Timeouts,
}

impl ServerProcessHandle {
    /// OS process id
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Port the server was asked to listen on
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Resolved command line, executable first
    pub fn command_line(&self) -> &[String] {
        &self.command_line
    }

    /// Current lifecycle state
    pub fn state(&self) -> &ProcessState {
        &self.state
    }

    /// Captured stdout so far
    pub fn stdout(&self) -> String {
        self.stdout.snapshot()
    }

    /// Captured stderr so far
    pub fn stderr(&self) -> String {
        self.stderr.snapshot()
    }

    /// Live stdout buffer, for waiting on a log line
    pub fn stdout_buffer(&self) -> &OutputBuffer {
        &self.stdout
    }

    /// Live stderr buffer
    pub fn stderr_buffer(&self) -> &OutputBuffer {
        &self.stderr
    }

    /// Non-blocking check whether the process is still alive
    pub fn is_running(&mut self) -> Result<bool> {
        Ok(self.child.try_wait()?.is_none())
    }

    /// Exit status, once known
    pub fn exit_report(&self) -> Option<&ExitReport> {
        match &self.state {
            ProcessState::Stopped(report) => Some(report),
            _ => None,
        }
    }

    /// Stop with explicit timeouts. Stopping twice returns the first report.
    pub fn stop(&mut self, graceful: Duration, kill: Duration) -> Result<ExitReport> {
        match &self.state {
            ProcessState::Stopped(report) => return Ok(*report),
            ProcessState::Failed(reason) => {
                return Err(Error::InvalidState(format!("start failed: {}", reason)))
            }
            ProcessState::Unstarted => {
                return Err(Error::InvalidState("process was never started".into()))
            }
            _ => {}
        }

        if self.state != ProcessState::Stopping {
            self.transition(ProcessState::Stopping)?;
        }
        let report = self.terminate(graceful, kill)?;
        info!(pid = self.pid, %report, "server stopped");
        self.transition(ProcessState::Stopped(report))?;
        Ok(report)
    }

    fn transition(&mut self, next: ProcessState) -> Result<()> {
        if !self.state.can_become(&next) {
            return Err(Error::InvalidState(format!(
                "cannot move from {} to {}",
                self.state, next
            )));
        }
        debug!(pid = self.pid, from = %self.state, to = %next, "state change");
        self.state = next;
        Ok(())
    }

    fn attach_drain(&mut self, stream: OutputStream) -> Result<()> {
        let task = match stream {
            OutputStream::Stdout => match self.child.stdout.take() {
                Some(pipe) => DrainTask::spawn(stream, pipe, self.stdout.clone())?,
                None => return Ok(()),
            },
            OutputStream::Stderr => match self.child.stderr.take() {
                Some(pipe) => DrainTask::spawn(stream, pipe, self.stderr.clone())?,
                None => return Ok(()),
            },
        };
        self.drains.push(task);
        Ok(())
    }

    /// SIGTERM, wait, SIGKILL, wait, then collect the drain threads
    fn terminate(&mut self, graceful: Duration, kill: Duration) -> Result<ExitReport> {
        let (status, termination) = match self.child.try_wait()? {
            Some(status) => (Some(status), Termination::AlreadyExited),
            None => {
                debug!(pid = self.pid, "sending SIGTERM");
                send_sigterm(self.pid)?;

                match self.child.wait_timeout(graceful)? {
                    Some(status) => (Some(status), Termination::Graceful),
                    None => {
                        warn!(pid = self.pid, ?graceful, "SIGTERM ignored, sending SIGKILL");
                        match self.child.kill() {
                            Ok(()) => {}
                            // Exited between the wait and the kill
                            Err(e) if e.kind() == io::ErrorKind::InvalidInput => {}
                            Err(e) => return Err(e.into()),
                        }
                        (self.child.wait_timeout(kill)?, Termination::Forced)
                    }
                }
            }
        };

        self.finish_drains()?;

        Ok(ExitReport {
            pid: self.pid,
            status,
            termination,
            graceful_timeout: graceful,
        })
    }

    fn finish_drains(&mut self) -> Result<()> {
        let mut first_error = None;
        for mut task in self.drains.drain(..) {
            if let Err(e) = task.finish(DRAIN_GRACE) {
                warn!(stream = %task.stream(), error = %e, "drain failed");
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn fail_exited(mut self, status: ExitStatus) -> Error {
        let reason = format!("exited during startup ({})", status);
        warn!(pid = self.pid, %status, "server exited during startup");
        self.state = ProcessState::Failed(reason);
        if let Err(e) = self.finish_drains() {
            debug!(error = %e, "ignoring drain failure after early exit");
        }

        Error::ImmediateExit {
            command: self.command_line.join(" "),
            status,
            stdout: self.stdout.snapshot(),
            stderr: self.stderr.snapshot(),
        }
    }

    fn fail_unreachable(mut self, waited: Duration, reason: &str) -> Error {
        warn!(pid = self.pid, port = self.port, ?waited, reason, "server not reachable");
        let timeouts = self.timeouts;
        if let Err(e) = self.terminate(timeouts.graceful_stop, timeouts.kill) {
            warn!(pid = self.pid, error = %e, "best-effort stop failed");
        }
        self.state = ProcessState::Failed(reason.to_string());

        Error::PortBindTimeout {
            port: self.port,
            waited,
            reason: reason.to_string(),
            stdout: self.stdout.snapshot(),
            stderr: self.stderr.snapshot(),
        }
    }
}

impl fmt::Debug for ServerProcessHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerProcessHandle")
            .field("pid", &self.pid)
            .field("port", &self.port)
            .field("command_line", &self.command_line)
            .field("state", &self.state)
            .finish()
    }
}

impl Drop for ServerProcessHandle {
    fn drop(&mut self) {
        match self.state {
            ProcessState::Starting | ProcessState::Running | ProcessState::Stopping => {
                let timeouts = self.timeouts;
                if let Err(e) = self.terminate(timeouts.graceful_stop, timeouts.kill) {
                    warn!(pid = self.pid, error = %e, "stop on drop failed");
                }
            }
            _ => {}
        }
    }
}

fn send_sigterm(pid: u32) -> Result<()> {
    let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
    if rc != 0 {
        let err = io::Error::last_os_error();
        // Already gone
        if err.raw_os_error() != Some(libc::ESRCH) {
            return Err(err.into());
        }
    }
    Ok(())
}

/// Starts and stops servers under test
#[derive(Debug, Clone, Default)]
pub struct ProcessSupervisor {
    timeouts: Timeouts,
}

impl ProcessSupervisor {
    /// Supervisor with default timeouts
    pub fn new() -> Self {
        ProcessSupervisor::default()
    }

    /// Supervisor with explicit timeouts
    pub fn with_timeouts(timeouts: Timeouts) -> Self {
        ProcessSupervisor { timeouts }
    }

    /// Supervisor with timeouts taken from the environment
    pub fn from_env() -> Self {
        ProcessSupervisor::with_timeouts(Timeouts::from_env())
    }

    /// Configured timeouts
    pub fn timeouts(&self) -> &Timeouts {
        &self.timeouts
    }

    fn spawn(&self, config: &ServerConfig) -> Result<ServerProcessHandle> {
        let command_line = config.command_line();
        let mut command = Command::new(config.executable());
        command
            .args(config.argv())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        for (key, value) in config.env() {
            command.env(key, value);
        }

        let child = command.spawn().map_err(|source| Error::Spawn {
            command: command_line.join(" "),
            source,
        })?;
        let pid = child.id();
        info!(pid, command = %command_line.join(" "), "spawned server");

        let mut handle = ServerProcessHandle {
            child,
            pid,
            port: config.port(),
            command_line,
            stdout: OutputBuffer::new(),
            stderr: OutputBuffer::new(),
            drains: Vec::with_capacity(2),
            state: ProcessState::Unstarted,
            timeouts: self.timeouts,
        };
        handle.transition(ProcessState::Starting)?;
        handle.attach_drain(OutputStream::Stdout)?;
        handle.attach_drain(OutputStream::Stderr)?;
        Ok(handle)
    }

    /// Spawn the server and block until it is alive and, if the config asks
    /// for it, accepting connections.
    pub fn start(&self, config: &ServerConfig) -> Result<ServerProcessHandle> {
        let readiness = if config.wait_for_port() {
            Some(
                PortReadinessProbe::new(config.ready_host(), config.port())?
                    .timeout(self.timeouts.port_wait)
                    .interval(self.timeouts.poll_interval),
            )
        } else {
            None
        };

        // Someone else's listener would make the readiness check meaningless
        let preoccupied = readiness.as_ref().map_or(false, |probe| probe.is_ready());
        if preoccupied {
            warn!(port = config.port(), "port already accepting connections before spawn");
        }

        let mut handle = self.spawn(config)?;

        if let Some(status) = handle.child.wait_timeout(self.timeouts.startup_window)? {
            return Err(handle.fail_exited(status));
        }

        if let Some(probe) = readiness {
            let began = Instant::now();

            if preoccupied {
                let remaining = self.timeouts.port_wait.saturating_sub(began.elapsed());
                return Err(match handle.child.wait_timeout(remaining)? {
                    Some(status) => handle.fail_exited(status),
                    None => handle.fail_unreachable(
                        self.timeouts.port_wait,
                        "port was already in use by another listener",
                    ),
                });
            }

            let mut exited = None;
            let ready = probe.wait_while(|| match handle.child.try_wait() {
                Ok(Some(status)) => {
                    exited = Some(status);
                    false
                }
                _ => true,
            });

            if let Some(status) = exited {
                return Err(handle.fail_exited(status));
            }
            if !ready {
                return Err(handle.fail_unreachable(began.elapsed(), "port never accepted connections"));
            }
            info!(pid = handle.pid, port = handle.port, elapsed = ?began.elapsed(), "server ready");
        }

        handle.transition(ProcessState::Running)?;
        Ok(handle)
    }

    /// Stop with the configured graceful and kill timeouts
    pub fn stop(&self, handle: &mut ServerProcessHandle) -> Result<ExitReport> {
        handle.stop(self.timeouts.graceful_stop, self.timeouts.kill)
    }

    /// Stop with explicit timeouts
    pub fn stop_with(
        &self,
        handle: &mut ServerProcessHandle,
        graceful: Duration,
        kill: Duration,
    ) -> Result<ExitReport> {
        handle.stop(graceful, kill)
    }

    /// Run a short-lived invocation (`--help`, `--version`, a bad flag) to
    /// completion. Killed if still running after `timeout`.
    pub fn run_once(&self, config: &ServerConfig, timeout: Duration) -> Result<CompletedRun> {
        let mut handle = self.spawn(config)?;
        handle.transition(ProcessState::Running)?;

        let timed_out = handle.child.wait_timeout(timeout)?.is_none();
        if timed_out {
            debug!(pid = handle.pid, ?timeout, "run timed out");
        }

        let report = handle.stop(Duration::ZERO, self.timeouts.kill)?;

        Ok(CompletedRun {
            status: report.status,
            timed_out,
            stdout: handle.stdout(),
            stderr: handle.stderr(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_transitions() {
        let report = ExitReport {
            pid: 1,
            status: None,
            termination: Termination::Graceful,
            graceful_timeout: Duration::from_secs(1),
        };

        assert!(ProcessState::Unstarted.can_become(&ProcessState::Starting));
        assert!(ProcessState::Starting.can_become(&ProcessState::Running));
        assert!(ProcessState::Running.can_become(&ProcessState::Stopping));
        assert!(ProcessState::Stopping.can_become(&ProcessState::Stopped(report)));
        assert!(ProcessState::Starting.can_become(&ProcessState::Failed("boom".into())));
    }

    #[test]
    fn test_backward_transitions_rejected() {
        assert!(!ProcessState::Running.can_become(&ProcessState::Starting));
        assert!(!ProcessState::Stopping.can_become(&ProcessState::Running));
        assert!(!ProcessState::Running.can_become(&ProcessState::Failed("late".into())));
        assert!(!ProcessState::Failed("x".into()).can_become(&ProcessState::Running));
    }

    #[test]
    fn test_terminal_states() {
        assert!(ProcessState::Failed("x".into()).is_terminal());
        assert!(!ProcessState::Running.is_terminal());
        assert!(!ProcessState::Unstarted.is_terminal());
    }

    #[test]
    fn test_ensure_graceful() {
        let mut report = ExitReport {
            pid: 42,
            status: None,
            termination: Termination::Graceful,
            graceful_timeout: Duration::from_millis(200),
        };
        assert!(report.ensure_graceful().is_ok());

        report.termination = Termination::Forced;
        match report.ensure_graceful() {
            Err(Error::ShutdownTimeout { pid, graceful_timeout, .. }) => {
                assert_eq!(pid, 42);
                assert_eq!(graceful_timeout, Duration::from_millis(200));
            }
            other => panic!("Expected ShutdownTimeout, got {:?}", other),
        }
    }

    #[test]
    fn test_completed_run_success() {
        let run = CompletedRun {
            status: None,
            timed_out: true,
            stdout: String::new(),
            stderr: String::new(),
        };
        assert!(!run.success());
        assert_eq!(run.code(), None);
    }
}
