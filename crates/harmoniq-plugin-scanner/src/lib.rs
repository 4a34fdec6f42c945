//! Plugin scanning for Harmoniq Studio, optionally isolated in a worker
//! process so a crashing plugin cannot take the host down with it.

pub mod batch;
pub mod bridge;
pub mod child;
pub mod coordinator;
pub mod format;
pub mod mode;
pub mod settings;
pub mod wire;
pub mod worker;

pub use batch::{scan_files, PluginDirectoryScanner, DEAD_MANS_PEDAL_FILE};
pub use bridge::{BridgeEndpoint, CancellationToken, ReplyBridge, WakeReason};
pub use child::serve;
pub use coordinator::{CoordinatorConfig, ScanCoordinator, ScanResult};
pub use format::{BundleKind, FormatManager, ManifestFormat, PluginFormat};
pub use mode::{ModeObserver, ScanMode, ScanModeFlag, SCAN_MODE_KEY};
pub use settings::{PropertiesFile, SettingsError, SettingsStore};
pub use worker::{
    is_worker_invocation, worker_role_arg, ProcessLauncher, TransportError, WorkerConfig,
    WorkerLauncher, WorkerLink, WorkerProcess,
};
