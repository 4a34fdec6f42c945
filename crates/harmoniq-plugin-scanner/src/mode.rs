use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use tracing::debug;

use crate::settings::{SettingsStore, SubscriptionId};

/// Settings key holding the scan mode: `0` in-process, anything else
/// out-of-process.
pub const SCAN_MODE_KEY: &str = "plugin_scan_mode";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanMode {
    InProcess,
    OutOfProcess,
}

impl ScanMode {
    pub fn from_setting(value: i64) -> Self {
        if value == 0 {
            ScanMode::InProcess
        } else {
            ScanMode::OutOfProcess
        }
    }

    pub fn to_setting(self) -> i64 {
        match self {
            ScanMode::InProcess => 0,
            ScanMode::OutOfProcess => 1,
        }
    }
}

/// Process-wide scan mode, read fresh at the start of every scan.
#[derive(Debug, Clone)]
pub struct ScanModeFlag {
    in_process: Arc<AtomicBool>,
}

impl ScanModeFlag {
    pub fn new(mode: ScanMode) -> Self {
        Self {
            in_process: Arc::new(AtomicBool::new(mode == ScanMode::InProcess)),
        }
    }

    pub fn get(&self) -> ScanMode {
        if self.in_process.load(Ordering::SeqCst) {
            ScanMode::InProcess
        } else {
            ScanMode::OutOfProcess
        }
    }

    pub fn set(&self, mode: ScanMode) {
        self.in_process
            .store(mode == ScanMode::InProcess, Ordering::SeqCst);
    }
}

impl Default for ScanModeFlag {
    fn default() -> Self {
        Self::new(ScanMode::InProcess)
    }
}

/// Keeps a [`ScanModeFlag`] in step with the persisted setting.
pub struct ModeObserver {
    store: Arc<dyn SettingsStore>,
    subscription: SubscriptionId,
    flag: ScanModeFlag,
}

impl ModeObserver {
    pub fn attach(store: Arc<dyn SettingsStore>) -> Self {
        let flag = ScanModeFlag::default();
        let weak: Weak<dyn SettingsStore> = Arc::downgrade(&store);
        let listener_flag = flag.clone();
        let subscription = store.subscribe(Arc::new(move || {
            if let Some(store) = weak.upgrade() {
                refresh(store.as_ref(), &listener_flag);
            }
        }));
        refresh(store.as_ref(), &flag);

        Self {
            store,
            subscription,
            flag,
        }
    }

    pub fn flag(&self) -> ScanModeFlag {
        self.flag.clone()
    }

    pub fn mode(&self) -> ScanMode {
        self.flag.get()
    }
}

impl Drop for ModeObserver {
    fn drop(&mut self) {
        self.store.unsubscribe(self.subscription);
    }
}

impl std::fmt::Debug for ModeObserver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModeObserver")
            .field("subscription", &self.subscription)
            .field("mode", &self.flag.get())
            .finish()
    }
}

fn refresh(store: &dyn SettingsStore, flag: &ScanModeFlag) {
    let mode = ScanMode::from_setting(store.get_int(SCAN_MODE_KEY, 0));
    if flag.get() != mode {
        debug!(?mode, "plugin scan mode changed");
    }
    flag.set(mode);
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicI64;

    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    use super::*;
    use crate::settings::{PropertiesFile, SettingsError, SettingsListener};

    /// Store whose value flips while a listener is being registered.
    #[derive(Default)]
    struct FlipOnSubscribe {
        value: AtomicI64,
        listeners: Mutex<Vec<SettingsListener>>,
    }

    impl SettingsStore for FlipOnSubscribe {
        fn get_int(&self, _key: &str, _default: i64) -> i64 {
            self.value.load(Ordering::SeqCst)
        }

        fn set_int(&self, _key: &str, value: i64) -> Result<(), SettingsError> {
            self.value.store(value, Ordering::SeqCst);
            Ok(())
        }

        fn subscribe(&self, listener: SettingsListener) -> SubscriptionId {
            self.listeners.lock().push(listener);
            self.value.store(1, Ordering::SeqCst);
            1
        }

        fn unsubscribe(&self, _id: SubscriptionId) {
            self.listeners.lock().clear();
        }
    }

    #[test]
    fn setting_values_map_to_modes() {
        assert_eq!(ScanMode::from_setting(0), ScanMode::InProcess);
        assert_eq!(ScanMode::from_setting(1), ScanMode::OutOfProcess);
        assert_eq!(ScanMode::from_setting(-3), ScanMode::OutOfProcess);
    }

    #[test]
    fn change_during_subscription_is_seen() {
        let observer = ModeObserver::attach(Arc::new(FlipOnSubscribe::default()));
        assert_eq!(observer.mode(), ScanMode::OutOfProcess);
    }

    #[test]
    fn observer_follows_setting_changes() {
        let dir = tempdir().unwrap();
        let settings = Arc::new(PropertiesFile::open(dir.path().join("settings.json")).unwrap());
        settings.set_int(SCAN_MODE_KEY, 1).unwrap();

        let observer = ModeObserver::attach(settings.clone());
        let flag = observer.flag();
        assert_eq!(flag.get(), ScanMode::OutOfProcess);

        settings.set_int(SCAN_MODE_KEY, 0).unwrap();
        assert_eq!(flag.get(), ScanMode::InProcess);

        drop(observer);
        settings.set_int(SCAN_MODE_KEY, 1).unwrap();
        assert_eq!(flag.get(), ScanMode::InProcess);
    }
}
