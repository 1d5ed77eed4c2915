//! Process execution and ownership.
//!
//! `ProcessRegistry` owns the one live child per service. It spawns children from
//! a resolved `LaunchCommand`, forwards their output into the log store, watches
//! for exit, and brings them down with staged signals. It never touches runtime
//! status: exits are reported on a channel for the supervisor to act on.

use std::collections::HashMap;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use crate::errors::{SpawnError, TerminateError};
use crate::launch::LaunchCommand;
use crate::logs::{LogSink, StreamKind};
use crate::model::ServiceId;

/// Grace periods for bringing a process down.
#[derive(Debug, Clone, Copy)]
pub struct ShutdownConfig {
    sigint_ms: u64,
    sigterm_ms: u64,
    kill_ms: u64,
}

impl ShutdownConfig {
    pub fn new(sigint_ms: u64, sigterm_ms: u64, kill_ms: u64) -> Self {
        Self {
            sigint_ms,
            sigterm_ms,
            kill_ms,
        }
    }

    fn sigint_timeout(&self) -> Duration {
        Duration::from_millis(self.sigint_ms)
    }

    fn sigterm_timeout(&self) -> Duration {
        Duration::from_millis(self.sigterm_ms)
    }

    fn kill_timeout(&self) -> Duration {
        Duration::from_millis(self.kill_ms)
    }

    fn sigint_enabled(&self) -> bool {
        self.sigint_ms > 0
    }

    fn sigterm_enabled(&self) -> bool {
        self.sigterm_ms > 0
    }
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self::new(
            crate::config::DEFAULT_SHUTDOWN_SIGINT_MS,
            crate::config::DEFAULT_SHUTDOWN_SIGTERM_MS,
            crate::config::DEFAULT_KILL_TIMEOUT_MS,
        )
    }
}

/// Signals sent while stopping a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessSignal {
    SigInt,
    SigTerm,
    Kill,
}

/// How a process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitInfo {
    /// Exit code, absent when the process was terminated by a signal.
    pub code: Option<i32>,
    /// Terminating signal number (Unix only).
    pub signal: Option<i32>,
}

impl ExitInfo {
    fn from_status(status: ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;
        Self {
            code: status.code(),
            signal,
        }
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Human-readable reason for an unsuccessful exit.
    pub fn describe(&self) -> String {
        match (self.code, self.signal) {
            (Some(code), _) => format!("exited with code {}", code),
            (None, Some(signal)) => format!("terminated by signal {}", signal),
            (None, None) => "exited with unknown status".to_string(),
        }
    }
}

/// Notification that a registered process has exited.
#[derive(Debug, Clone)]
pub struct ProcessExit {
    pub service_id: ServiceId,
    pub pid: u32,
    pub exit: ExitInfo,
}

struct LiveProcess {
    pid: u32,
    kill_tx: Option<oneshot::Sender<()>>,
    exit_rx: watch::Receiver<Option<ExitInfo>>,
}

/// Owns the mapping from service id to live OS process.
pub struct ProcessRegistry {
    processes: Mutex<HashMap<ServiceId, LiveProcess>>,
    exit_tx: mpsc::UnboundedSender<ProcessExit>,
    shutdown: ShutdownConfig,
}

impl ProcessRegistry {
    /// Creates a registry and the receiving end of its exit notifications.
    pub fn new(shutdown: ShutdownConfig) -> (Self, mpsc::UnboundedReceiver<ProcessExit>) {
        let (exit_tx, exit_rx) = mpsc::unbounded_channel();
        let registry = Self {
            processes: Mutex::new(HashMap::new()),
            exit_tx,
            shutdown,
        };
        (registry, exit_rx)
    }

    /// Spawns the process for a service and registers it.
    ///
    /// Standard output and error are forwarded line by line into `logs`. On
    /// failure nothing is registered.
    pub fn spawn(
        &self,
        id: &ServiceId,
        launch: &LaunchCommand,
        logs: LogSink,
    ) -> Result<u32, SpawnError> {
        if self.processes.lock().contains_key(id) {
            return Err(SpawnError::AlreadyRunning(id.clone()));
        }
        match std::fs::metadata(&launch.cwd) {
            Ok(meta) if meta.is_dir() => {}
            Ok(_) => {
                return Err(SpawnError::WorkingDir {
                    path: launch.cwd.clone(),
                    source: std::io::Error::other("not a directory"),
                })
            }
            Err(source) => {
                return Err(SpawnError::WorkingDir {
                    path: launch.cwd.clone(),
                    source,
                })
            }
        }

        let mut command = Command::new(&launch.program);
        command
            .args(&launch.args)
            .current_dir(&launch.cwd)
            .env_clear()
            .envs(&launch.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        command.kill_on_drop(true);

        #[cfg(windows)]
        {
            const CREATE_NEW_PROCESS_GROUP: u32 = 0x00000200;
            const CREATE_NO_WINDOW: u32 = 0x08000000;
            command.creation_flags(CREATE_NEW_PROCESS_GROUP | CREATE_NO_WINDOW);
        }

        #[cfg(unix)]
        unsafe {
            command.pre_exec(|| {
                let _ = libc::setpgid(0, 0);
                Ok(())
            });
        }

        let mut child = command
            .spawn()
            .map_err(|source| classify_spawn_error(&launch.program, source))?;
        let pid = child.id().unwrap_or_default();

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(read_stream(StreamKind::Stdout, stdout, logs.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(read_stream(StreamKind::Stderr, stderr, logs));
        }

        let (kill_tx, kill_rx) = oneshot::channel();
        let (state_tx, exit_rx) = watch::channel(None);
        self.processes.lock().insert(
            id.clone(),
            LiveProcess {
                pid,
                kill_tx: Some(kill_tx),
                exit_rx,
            },
        );
        tokio::spawn(monitor(
            id.clone(),
            pid,
            child,
            kill_rx,
            state_tx,
            self.exit_tx.clone(),
        ));

        info!(service = %id, pid, command = %launch.command, cwd = %launch.cwd.display(), "spawned");
        Ok(pid)
    }

    /// Brings a process down, escalating to a forced kill.
    ///
    /// With `graceful`, SIGINT and then SIGTERM are tried first, each with its
    /// configured grace period. Returns `Ok(None)` when nothing is registered.
    /// The handle stays registered until `reap`.
    pub async fn signal_stop(
        &self,
        id: &ServiceId,
        graceful: bool,
    ) -> Result<Option<ExitInfo>, TerminateError> {
        let Some((pid, mut exit_rx)) = self
            .processes
            .lock()
            .get(id)
            .map(|process| (process.pid, process.exit_rx.clone()))
        else {
            return Ok(None);
        };

        if let Some(exit) = *exit_rx.borrow() {
            return Ok(Some(exit));
        }

        if graceful {
            if self.shutdown.sigint_enabled() {
                debug!(service = %id, pid, "sending SIGINT");
                send_os_signal(pid, ProcessSignal::SigInt);
                if let Some(exit) =
                    wait_for_exit(&mut exit_rx, self.shutdown.sigint_timeout()).await
                {
                    return Ok(Some(exit));
                }
            }
            if self.shutdown.sigterm_enabled() {
                debug!(service = %id, pid, "sending SIGTERM");
                send_os_signal(pid, ProcessSignal::SigTerm);
                if let Some(exit) =
                    wait_for_exit(&mut exit_rx, self.shutdown.sigterm_timeout()).await
                {
                    return Ok(Some(exit));
                }
            }
            warn!(service = %id, pid, "did not stop gracefully, force killing");
        }

        let kill_tx = self
            .processes
            .lock()
            .get_mut(id)
            .and_then(|process| process.kill_tx.take());
        send_os_signal(pid, ProcessSignal::Kill);
        if let Some(kill_tx) = kill_tx {
            let _ = kill_tx.send(());
        }

        match wait_for_exit(&mut exit_rx, self.shutdown.kill_timeout()).await {
            Some(exit) => Ok(Some(exit)),
            None => Err(TerminateError::Survived {
                service: id.clone(),
                pid,
            }),
        }
    }

    /// Clears the handle of an exited process and returns how it ended.
    ///
    /// Processes that are still alive stay registered and `None` is returned.
    pub fn reap(&self, id: &ServiceId) -> Option<ExitInfo> {
        let mut processes = self.processes.lock();
        let exit = (*processes.get(id)?.exit_rx.borrow())?;
        processes.remove(id);
        debug!(service = %id, code = ?exit.code, "reaped");
        Some(exit)
    }

    pub fn pid(&self, id: &ServiceId) -> Option<u32> {
        self.processes.lock().get(id).map(|process| process.pid)
    }

    pub fn is_live(&self, id: &ServiceId) -> bool {
        self.processes.lock().contains_key(id)
    }

    /// Services with a registered process.
    pub fn live_ids(&self) -> Vec<ServiceId> {
        let mut ids: Vec<ServiceId> = self.processes.lock().keys().cloned().collect();
        ids.sort();
        ids
    }
}

fn classify_spawn_error(program: &str, source: std::io::Error) -> SpawnError {
    let program = program.to_string();
    match source.kind() {
        std::io::ErrorKind::PermissionDenied => SpawnError::PermissionDenied { program, source },
        std::io::ErrorKind::NotFound => SpawnError::NotFound { program, source },
        _ => SpawnError::Io { program, source },
    }
}

// Owns the child until it exits, then publishes the exit once.
async fn monitor(
    id: ServiceId,
    pid: u32,
    mut child: Child,
    kill_rx: oneshot::Receiver<()>,
    state_tx: watch::Sender<Option<ExitInfo>>,
    exit_tx: mpsc::UnboundedSender<ProcessExit>,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        Ok(()) = kill_rx => {
            if let Err(err) = child.start_kill() {
                warn!(service = %id, pid, error = %err, "force kill failed");
            }
            child.wait().await
        }
    };
    let exit = match status {
        Ok(status) => ExitInfo::from_status(status),
        Err(err) => {
            warn!(service = %id, pid, error = %err, "failed to wait for process");
            ExitInfo {
                code: None,
                signal: None,
            }
        }
    };
    debug!(service = %id, pid, code = ?exit.code, signal = ?exit.signal, "process exited");
    let _ = state_tx.send(Some(exit));
    let _ = exit_tx.send(ProcessExit {
        service_id: id,
        pid,
        exit,
    });
}

async fn wait_for_exit(
    exit_rx: &mut watch::Receiver<Option<ExitInfo>>,
    timeout: Duration,
) -> Option<ExitInfo> {
    if timeout.is_zero() {
        return *exit_rx.borrow();
    }
    let waited = match tokio::time::timeout(timeout, exit_rx.wait_for(Option::is_some)).await {
        Ok(Ok(exit)) => *exit,
        _ => None,
    };
    waited.or_else(|| *exit_rx.borrow())
}

// Invalid UTF-8 is replaced rather than ending the reader; a closed pipe
// would kill the child with SIGPIPE on its next write.
async fn read_stream<R>(stream: StreamKind, reader: R, logs: LogSink)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                while matches!(buf.last(), Some(b'\n' | b'\r')) {
                    buf.pop();
                }
                logs.push(stream, String::from_utf8_lossy(&buf).into_owned());
            }
            Err(err) => {
                debug!(error = %err, "output stream closed");
                break;
            }
        }
    }
}

#[cfg(unix)]
fn send_os_signal(pid: u32, signal: ProcessSignal) {
    if pid == 0 {
        return;
    }
    unsafe {
        let sig = match signal {
            ProcessSignal::SigInt => libc::SIGINT,
            ProcessSignal::SigTerm => libc::SIGTERM,
            ProcessSignal::Kill => libc::SIGKILL,
        };
        let pid = pid as i32;
        let _ = libc::kill(-pid, sig);
        let _ = libc::kill(pid, sig);
    }
}

#[cfg(not(unix))]
fn send_os_signal(pid: u32, signal: ProcessSignal) {
    send_ctrl_break(pid, signal);
}

#[cfg(all(not(unix), windows))]
fn send_ctrl_break(pid: u32, signal: ProcessSignal) {
    use windows_sys::Win32::System::Console::GenerateConsoleCtrlEvent;
    use windows_sys::Win32::System::Console::CTRL_BREAK_EVENT;
    // Forced kills go through the child handle.
    if signal == ProcessSignal::Kill {
        return;
    }
    unsafe {
        let _ = GenerateConsoleCtrlEvent(CTRL_BREAK_EVENT, pid);
    }
}

#[cfg(all(not(unix), not(windows)))]
fn send_ctrl_break(_pid: u32, _signal: ProcessSignal) {}
