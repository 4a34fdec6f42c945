use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::warn;

pub type SubscriptionId = u64;

/// Called after any setting changes; listeners re-read what they need.
pub type SettingsListener = Arc<dyn Fn() + Send + Sync>;

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("failed to access settings file: {0}")]
    Io(#[from] io::Error),
    #[error("failed to encode settings: {0}")]
    Encode(#[from] serde_json::Error),
    #[cfg(feature = "watch")]
    #[error("failed to watch settings file: {0}")]
    Watch(#[from] notify::Error),
}

/// Persisted key/value settings with change notification.
pub trait SettingsStore: Send + Sync {
    fn get_int(&self, key: &str, default: i64) -> i64;
    fn set_int(&self, key: &str, value: i64) -> Result<(), SettingsError>;
    fn subscribe(&self, listener: SettingsListener) -> SubscriptionId;
    fn unsubscribe(&self, id: SubscriptionId);
}

/// Settings kept as a flat JSON object on disk, written on every change.
pub struct PropertiesFile {
    path: PathBuf,
    values: Mutex<Map<String, Value>>,
    listeners: Mutex<Vec<(SubscriptionId, SettingsListener)>>,
    next_id: AtomicU64,
}

impl PropertiesFile {
    /// Opens the file, starting empty when it is missing or not a JSON object.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, SettingsError> {
        let path = path.into();
        let values = read_values(&path)?;
        Ok(Self {
            path,
            values: Mutex::new(values),
            listeners: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        })
    }

    pub fn default_path() -> Result<PathBuf, SettingsError> {
        let mut config_dir = dirs::config_dir().ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, "no config directory")
        })?;
        config_dir.push("HarmoniqStudio");
        fs::create_dir_all(&config_dir)?;
        config_dir.push("settings.json");
        Ok(config_dir)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Re-reads the file and notifies listeners if anything changed.
    pub fn reload(&self) -> Result<(), SettingsError> {
        let fresh = read_values(&self.path)?;
        let changed = {
            let mut values = self.values.lock();
            if *values == fresh {
                false
            } else {
                *values = fresh;
                true
            }
        };
        if changed {
            self.notify();
        }
        Ok(())
    }

    /// Reloads whenever the file is edited by another process. Keep the
    /// returned watcher alive for as long as updates are wanted.
    #[cfg(feature = "watch")]
    pub fn watch(self: &Arc<Self>) -> Result<notify::RecommendedWatcher, SettingsError> {
        use notify::{EventKind, RecursiveMode, Watcher};

        let settings = Arc::downgrade(self);
        let file_name = self.path.file_name().map(|name| name.to_os_string());
        let mut watcher =
            notify::recommended_watcher(move |res: notify::Result<notify::Event>| match res {
                Ok(event) => {
                    if !matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_)) {
                        return;
                    }
                    let ours = event
                        .paths
                        .iter()
                        .any(|path| path.file_name().map(|n| n.to_os_string()) == file_name);
                    if !ours {
                        return;
                    }
                    if let Some(settings) = settings.upgrade() {
                        if let Err(err) = settings.reload() {
                            warn!("failed to reload settings: {err}");
                        }
                    }
                }
                Err(err) => warn!("settings watch error: {err}"),
            })?;
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        watcher.watch(&dir, RecursiveMode::NonRecursive)?;
        Ok(watcher)
    }

    fn notify(&self) {
        let listeners: Vec<SettingsListener> = self
            .listeners
            .lock()
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();
        for listener in listeners {
            listener();
        }
    }

    fn persist_locked(&self, values: &Map<String, Value>) -> Result<(), SettingsError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let json = serde_json::to_string_pretty(values)?;
        fs::write(&self.path, json)?;
        Ok(())
    }
}

impl SettingsStore for PropertiesFile {
    fn get_int(&self, key: &str, default: i64) -> i64 {
        self.values
            .lock()
            .get(key)
            .and_then(|value| match value {
                Value::Number(number) => number.as_i64(),
                Value::Bool(flag) => Some(i64::from(*flag)),
                Value::String(text) => text.trim().parse().ok(),
                _ => None,
            })
            .unwrap_or(default)
    }

    fn set_int(&self, key: &str, value: i64) -> Result<(), SettingsError> {
        {
            let mut values = self.values.lock();
            let new_value = Value::from(value);
            if values.get(key) == Some(&new_value) {
                return Ok(());
            }
            let mut updated = values.clone();
            updated.insert(key.to_string(), new_value);
            self.persist_locked(&updated)?;
            *values = updated;
        }
        self.notify();
        Ok(())
    }

    fn subscribe(&self, listener: SettingsListener) -> SubscriptionId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.listeners.lock().push((id, listener));
        id
    }

    fn unsubscribe(&self, id: SubscriptionId) {
        self.listeners.lock().retain(|(existing, _)| *existing != id);
    }
}

impl std::fmt::Debug for PropertiesFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PropertiesFile")
            .field("path", &self.path)
            .field("listeners", &self.listeners.lock().len())
            .finish()
    }
}

fn read_values(path: &Path) -> Result<Map<String, Value>, SettingsError> {
    if !path.exists() {
        return Ok(Map::new());
    }
    let raw = fs::read_to_string(path)?;
    if raw.trim().is_empty() {
        return Ok(Map::new());
    }
    match serde_json::from_str::<Value>(&raw) {
        Ok(Value::Object(values)) => Ok(values),
        Ok(_) | Err(_) => {
            warn!("ignoring malformed settings file {}", path.display());
            Ok(Map::new())
        }
    }
}
