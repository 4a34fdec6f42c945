use std::cmp::Ordering;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::description::PluginDescription;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to read plugin list: {0}")]
    Read(#[from] std::io::Error),
    #[error("failed to parse plugin list: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Orderings offered when presenting the known plugins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SortMethod {
    DefaultOrder,
    Alphabetically,
    ByCategory,
    #[default]
    ByManufacturer,
    ByFileSystemLocation,
}

impl SortMethod {
    pub fn from_setting(value: i64) -> Self {
        match value {
            0 => Self::DefaultOrder,
            1 => Self::Alphabetically,
            2 => Self::ByCategory,
            4 => Self::ByFileSystemLocation,
            _ => Self::ByManufacturer,
        }
    }

    pub fn to_setting(self) -> i64 {
        match self {
            Self::DefaultOrder => 0,
            Self::Alphabetically => 1,
            Self::ByCategory => 2,
            Self::ByManufacturer => 3,
            Self::ByFileSystemLocation => 4,
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct KnownListData {
    #[serde(default)]
    plugins: Vec<PluginDescription>,
    #[serde(default)]
    blacklist: Vec<String>,
}

/// Persistent registry of every plugin description produced by scanning,
/// plus the files that must not be scanned again.
///
/// Every mutation is written straight to disk so a crash part-way through a
/// scan keeps everything found up to that point.
#[derive(Debug)]
pub struct KnownPluginList {
    path: PathBuf,
    data: Mutex<KnownListData>,
}

impl KnownPluginList {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let data = if path.exists() {
            let raw = fs::read_to_string(&path)?;
            if raw.trim().is_empty() {
                KnownListData::default()
            } else {
                serde_json::from_str(&raw)?
            }
        } else {
            KnownListData::default()
        };
        Ok(Self {
            path,
            data: Mutex::new(data),
        })
    }

    pub fn default_path() -> Result<PathBuf, StoreError> {
        let mut config_dir = dirs::config_dir().ok_or_else(|| {
            StoreError::Read(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "no config directory",
            ))
        })?;
        config_dir.push("HarmoniqStudio");
        fs::create_dir_all(&config_dir)?;
        config_dir.push("known_plugins.json");
        Ok(config_dir)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Adds a description, replacing any entry with the same identifier.
    /// Returns whether the list changed.
    pub fn add_type(&self, description: PluginDescription) -> Result<bool, StoreError> {
        let mut data = self.data.lock();
        let key = description.identifier_string();
        if let Some(existing) = data
            .plugins
            .iter_mut()
            .find(|plugin| plugin.identifier_string() == key)
        {
            if same_metadata(existing, &description) {
                return Ok(false);
            }
            *existing = description;
        } else {
            data.plugins.push(description);
        }
        self.persist_locked(&data)?;
        Ok(true)
    }

    pub fn remove_type(&self, identifier: &str) -> Result<bool, StoreError> {
        let mut data = self.data.lock();
        let before = data.plugins.len();
        data.plugins
            .retain(|plugin| plugin.identifier_string() != identifier);
        if data.plugins.len() == before {
            return Ok(false);
        }
        self.persist_locked(&data)?;
        Ok(true)
    }

    pub fn clear(&self) -> Result<(), StoreError> {
        let mut data = self.data.lock();
        data.plugins.clear();
        self.persist_locked(&data)
    }

    pub fn types(&self) -> Vec<PluginDescription> {
        self.data.lock().plugins.clone()
    }

    pub fn len(&self) -> usize {
        self.data.lock().plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn types_for_file(&self, file_or_identifier: &str) -> Vec<PluginDescription> {
        self.data
            .lock()
            .plugins
            .iter()
            .filter(|plugin| plugin.file_or_identifier == file_or_identifier)
            .cloned()
            .collect()
    }

    /// True when the file is listed and none of its entries predate
    /// `modified`.
    pub fn is_listed_and_up_to_date(
        &self,
        file_or_identifier: &str,
        modified: Option<DateTime<Utc>>,
    ) -> bool {
        let data = self.data.lock();
        let mut entries = data
            .plugins
            .iter()
            .filter(|plugin| plugin.file_or_identifier == file_or_identifier)
            .peekable();
        if entries.peek().is_none() {
            return false;
        }
        entries.all(|plugin| match (plugin.last_file_mod_time, modified) {
            (Some(listed), Some(current)) => listed >= current,
            (_, None) => true,
            (None, Some(_)) => false,
        })
    }

    pub fn add_to_blacklist(&self, file_or_identifier: &str) -> Result<(), StoreError> {
        let mut data = self.data.lock();
        if data.blacklist.iter().any(|entry| entry == file_or_identifier) {
            return Ok(());
        }
        log::debug!("blacklisting {file_or_identifier}");
        data.blacklist.push(file_or_identifier.to_string());
        self.persist_locked(&data)
    }

    pub fn remove_from_blacklist(&self, file_or_identifier: &str) -> Result<(), StoreError> {
        let mut data = self.data.lock();
        let before = data.blacklist.len();
        data.blacklist.retain(|entry| entry != file_or_identifier);
        if data.blacklist.len() == before {
            return Ok(());
        }
        self.persist_locked(&data)
    }

    pub fn is_blacklisted(&self, file_or_identifier: &str) -> bool {
        self.data
            .lock()
            .blacklist
            .iter()
            .any(|entry| entry == file_or_identifier)
    }

    pub fn blacklisted_files(&self) -> Vec<String> {
        self.data.lock().blacklist.clone()
    }

    pub fn clear_blacklist(&self) -> Result<(), StoreError> {
        let mut data = self.data.lock();
        data.blacklist.clear();
        self.persist_locked(&data)
    }

    pub fn sorted(&self, method: SortMethod) -> Vec<PluginDescription> {
        let mut plugins = self.types();
        match method {
            SortMethod::DefaultOrder => {}
            SortMethod::Alphabetically => plugins.sort_by(by_name),
            SortMethod::ByCategory => plugins.sort_by(|a, b| {
                compare_optional(&a.category, &b.category).then_with(|| by_name(a, b))
            }),
            SortMethod::ByManufacturer => plugins.sort_by(|a, b| {
                compare_optional(&a.manufacturer_name, &b.manufacturer_name)
                    .then_with(|| by_name(a, b))
            }),
            SortMethod::ByFileSystemLocation => plugins.sort_by(|a, b| {
                parent_dir(&a.file_or_identifier)
                    .cmp(parent_dir(&b.file_or_identifier))
                    .then_with(|| by_name(a, b))
            }),
        }
        plugins
    }

    fn persist_locked(&self, data: &KnownListData) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let json = serde_json::to_string_pretty(data)?;
        fs::write(&self.path, json)?;
        Ok(())
    }
}

fn same_metadata(a: &PluginDescription, b: &PluginDescription) -> bool {
    let mut a = a.clone();
    a.last_info_update_time = b.last_info_update_time;
    &a == b
}

fn by_name(a: &PluginDescription, b: &PluginDescription) -> Ordering {
    a.name.to_lowercase().cmp(&b.name.to_lowercase())
}

/// Entries without a value sort last.
fn compare_optional(a: &Option<String>, b: &Option<String>) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => a.to_lowercase().cmp(&b.to_lowercase()),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

fn parent_dir(file: &str) -> &str {
    Path::new(file)
        .parent()
        .and_then(Path::to_str)
        .unwrap_or("")
}
