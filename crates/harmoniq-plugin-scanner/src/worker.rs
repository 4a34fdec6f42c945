use std::ffi::{OsStr, OsString};
use std::io::{self, BufReader, BufWriter};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::thread;

use thiserror::Error;
use tracing::{debug, warn};

use crate::bridge::BridgeEndpoint;
use crate::wire::{read_frame, write_frame, WireError};

/// Identifies a process started as a scan worker rather than as the host.
pub const WORKER_PROCESS_UID: &str = "hq-plugin-scan-worker-3f7c21a4";

const WORKER_ROLE_PREFIX: &str = "--harmoniq-scan-worker=";

/// Environment override for the worker executable.
pub const WORKER_EXECUTABLE_ENV: &str = "HARMONIQ_SCAN_WORKER";

pub fn worker_role_arg() -> String {
    format!("{WORKER_ROLE_PREFIX}{WORKER_PROCESS_UID}")
}

/// True when the command line carries the worker role marker.
pub fn is_worker_invocation<I, S>(args: I) -> bool
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let marker = worker_role_arg();
    args.into_iter()
        .any(|arg| arg.as_ref().to_str() == Some(marker.as_str()))
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to launch scan worker {path:?}: {source}")]
    Launch { path: PathBuf, source: io::Error },
    #[error("scan worker pipes were not captured")]
    MissingPipe,
    #[error("failed to send to scan worker: {0}")]
    Send(#[from] WireError),
    #[error("scan worker is no longer running")]
    Closed,
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub executable: PathBuf,
    pub extra_args: Vec<OsString>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        let executable = std::env::var_os(WORKER_EXECUTABLE_ENV)
            .map(PathBuf::from)
            .or_else(|| std::env::current_exe().ok())
            .unwrap_or_else(|| PathBuf::from("harmoniq-plugin-scanner"));
        Self {
            executable,
            extra_args: Vec::new(),
        }
    }
}

/// Host-side end of a running worker.
pub trait WorkerLink: Send {
    /// Queues one request frame. Success says nothing about a reply.
    fn send(&mut self, payload: &[u8]) -> Result<(), TransportError>;
}

/// Starts workers whose replies and connection loss are reported through
/// the given endpoint, from a thread other than the caller's.
pub trait WorkerLauncher: Send + Sync {
    fn launch(&self, endpoint: BridgeEndpoint) -> Result<Box<dyn WorkerLink>, TransportError>;
}

#[derive(Debug, Clone, Default)]
pub struct ProcessLauncher {
    config: WorkerConfig,
}

impl ProcessLauncher {
    pub fn new(config: WorkerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }
}

impl WorkerLauncher for ProcessLauncher {
    fn launch(&self, endpoint: BridgeEndpoint) -> Result<Box<dyn WorkerLink>, TransportError> {
        let process = WorkerProcess::launch(&self.config, endpoint)?;
        Ok(Box::new(process))
    }
}

/// A child scan process talking frames over its stdin/stdout.
///
/// Dropping it kills and reaps the child.
#[derive(Debug)]
pub struct WorkerProcess {
    child: Child,
    stdin: Option<BufWriter<ChildStdin>>,
    _reader: thread::JoinHandle<()>,
}

impl WorkerProcess {
    pub fn launch(config: &WorkerConfig, endpoint: BridgeEndpoint) -> Result<Self, TransportError> {
        let mut command = Command::new(&config.executable);
        command
            .arg(worker_role_arg())
            .args(&config.extra_args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());

        let mut child = command.spawn().map_err(|source| TransportError::Launch {
            path: config.executable.clone(),
            source,
        })?;
        debug!(pid = child.id(), "launched scan worker");

        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            terminate(&mut child);
            return Err(TransportError::MissingPipe);
        };

        let reader = thread::Builder::new()
            .name("scan-worker-reader".into())
            .spawn(move || pump_replies(stdout, endpoint));
        let reader = match reader {
            Ok(handle) => handle,
            Err(source) => {
                terminate(&mut child);
                return Err(TransportError::Launch {
                    path: config.executable.clone(),
                    source,
                });
            }
        };

        Ok(Self {
            child,
            stdin: Some(BufWriter::new(stdin)),
            _reader: reader,
        })
    }

    pub fn id(&self) -> u32 {
        self.child.id()
    }
}

impl WorkerLink for WorkerProcess {
    fn send(&mut self, payload: &[u8]) -> Result<(), TransportError> {
        if let Ok(Some(status)) = self.child.try_wait() {
            debug!(?status, "scan worker already exited");
            self.stdin = None;
            return Err(TransportError::Closed);
        }
        let stdin = self.stdin.as_mut().ok_or(TransportError::Closed)?;
        if let Err(err) = write_frame(stdin, payload) {
            self.stdin = None;
            return Err(err.into());
        }
        Ok(())
    }
}

impl Drop for WorkerProcess {
    fn drop(&mut self) {
        self.stdin = None;
        terminate(&mut self.child);
    }
}

fn terminate(child: &mut Child) {
    if let Ok(Some(_)) = child.try_wait() {
        return;
    }
    if let Err(err) = child.kill() {
        warn!("failed to kill scan worker {}: {err}", child.id());
    }
    let _ = child.wait();
}

fn pump_replies(stdout: ChildStdout, endpoint: BridgeEndpoint) {
    let mut reader = BufReader::new(stdout);
    loop {
        match read_frame(&mut reader) {
            Ok(Some(frame)) => endpoint.deliver(frame),
            Ok(None) => {
                debug!("scan worker closed its output");
                break;
            }
            Err(err) => {
                warn!("scan worker channel failed: {err}");
                break;
            }
        }
    }
    endpoint.connection_lost();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::ReplyBridge;

    #[test]
    fn role_marker_is_recognised() {
        assert!(is_worker_invocation(["host", worker_role_arg().as_str()]));
        assert!(!is_worker_invocation(["host", "--path", "/plugins"]));
        assert!(!is_worker_invocation([
            "host",
            "--harmoniq-scan-worker=someone-else"
        ]));
    }

    #[test]
    fn missing_executable_fails_to_launch() {
        let bridge = ReplyBridge::new();
        let config = WorkerConfig {
            executable: PathBuf::from("/nonexistent/harmoniq-scan-worker"),
            extra_args: Vec::new(),
        };
        let err = WorkerProcess::launch(&config, bridge.open_generation()).unwrap_err();
        assert!(matches!(err, TransportError::Launch { .. }));
    }
}
