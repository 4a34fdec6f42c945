use std::sync::Arc;
use std::time::{Duration, Instant};

use harmoniq_plugin_db::{descriptions_from_text, PluginDescription};
use tracing::{debug, info, warn};

use crate::bridge::{CancellationToken, ReplyBridge, WakeReason, DEFAULT_POLL_INTERVAL};
use crate::format::PluginFormat;
use crate::mode::{ScanMode, ScanModeFlag};
use crate::wire::{decode_reply, encode_request, ScanRequest};
use crate::worker::{TransportError, WorkerLauncher, WorkerLink};

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// How often a blocked scan re-checks the cancellation token.
    pub poll_interval: Duration,
    /// Optional limit on a single out-of-process scan. `None` waits until a
    /// reply, a lost connection or cancellation.
    pub scan_timeout: Option<Duration>,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            scan_timeout: None,
        }
    }
}

/// Outcome of probing one file.
///
/// `success == false` means out-of-process scanning was unavailable or the
/// worker died; the caller decides whether to retry or give up on the file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanResult {
    pub descriptions: Vec<PluginDescription>,
    pub success: bool,
}

impl ScanResult {
    pub fn succeeded(descriptions: Vec<PluginDescription>) -> Self {
        Self {
            descriptions,
            success: true,
        }
    }

    pub fn failed() -> Self {
        Self {
            descriptions: Vec::new(),
            success: false,
        }
    }
}

/// Decides between in-process and worker scanning and owns the single
/// worker used for the latter.
pub struct ScanCoordinator {
    mode: ScanModeFlag,
    launcher: Box<dyn WorkerLauncher>,
    bridge: Arc<ReplyBridge>,
    worker: Option<Box<dyn WorkerLink>>,
    cancel: CancellationToken,
    config: CoordinatorConfig,
}

impl ScanCoordinator {
    pub fn new(
        mode: ScanModeFlag,
        launcher: Box<dyn WorkerLauncher>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            mode,
            launcher,
            bridge: ReplyBridge::new(),
            worker: None,
            cancel,
            config: CoordinatorConfig::default(),
        }
    }

    pub fn with_config(mut self, config: CoordinatorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn has_live_worker(&self) -> bool {
        self.worker.is_some()
    }

    /// Enumerates the plugin types in `file_or_identifier`, blocking the
    /// calling thread until the scan resolves.
    pub fn find_plugin_types_for(
        &mut self,
        format: &dyn PluginFormat,
        file_or_identifier: &str,
    ) -> ScanResult {
        match self.mode.get() {
            ScanMode::InProcess => {
                self.discard_worker();
                ScanResult::succeeded(format.find_all_types_for_file(file_or_identifier))
            }
            ScanMode::OutOfProcess => self.scan_in_worker(format.name(), file_or_identifier),
        }
    }

    /// Called once a batch of scans is complete; workers are not kept warm.
    pub fn scan_finished(&mut self) {
        self.discard_worker();
    }

    fn scan_in_worker(&mut self, format_name: &str, file_or_identifier: &str) -> ScanResult {
        if self.cancel.is_cancelled() {
            debug!("skipping scan of {file_or_identifier}: shutdown requested");
            self.discard_worker();
            return ScanResult::succeeded(Vec::new());
        }

        let payload = encode_request(&ScanRequest::new(format_name, file_or_identifier));
        if let Err(err) = self.send(&payload) {
            warn!("out-of-process scan of {file_or_identifier} unavailable: {err}");
            self.bridge.disarm();
            self.discard_worker();
            return ScanResult::failed();
        }

        let deadline = self.config.scan_timeout.map(|timeout| Instant::now() + timeout);
        match self
            .bridge
            .wait(&self.cancel, self.config.poll_interval, deadline)
        {
            WakeReason::Reply(reply) => {
                let descriptions = descriptions_from_text(&decode_reply(&reply));
                debug!(
                    count = descriptions.len(),
                    "scan worker finished {file_or_identifier}"
                );
                ScanResult::succeeded(descriptions)
            }
            WakeReason::Cancelled => {
                info!("abandoning scan of {file_or_identifier}: shutdown requested");
                self.discard_worker();
                ScanResult::succeeded(Vec::new())
            }
            WakeReason::ConnectionLost => {
                warn!("scan worker lost while scanning {file_or_identifier}");
                self.discard_worker();
                ScanResult::failed()
            }
            WakeReason::TimedOut => {
                warn!("scan of {file_or_identifier} timed out");
                self.discard_worker();
                ScanResult::failed()
            }
        }
    }

    fn send(&mut self, payload: &[u8]) -> Result<(), TransportError> {
        if self.worker.is_none() {
            let endpoint = self.bridge.open_generation();
            match self.launcher.launch(endpoint) {
                Ok(worker) => self.worker = Some(worker),
                Err(err) => {
                    self.bridge.retire();
                    return Err(err);
                }
            }
        }
        let Some(worker) = self.worker.as_mut() else {
            return Err(TransportError::Closed);
        };
        // Opening a generation disarms, so arm only once the worker exists
        // and before the request leaves.
        self.bridge.arm();
        worker.send(payload)
    }

    fn discard_worker(&mut self) {
        if let Some(worker) = self.worker.take() {
            self.bridge.retire();
            drop(worker);
            debug!("scan worker released");
        }
    }
}

impl std::fmt::Debug for ScanCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScanCoordinator")
            .field("mode", &self.mode.get())
            .field("live_worker", &self.worker.is_some())
            .field("config", &self.config)
            .finish()
    }
}
