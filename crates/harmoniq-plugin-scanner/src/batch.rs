//! Scanning many files in one go, with crash recovery.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use harmoniq_plugin_db::{KnownPluginList, StoreError};
use tracing::{debug, info, warn};

use crate::coordinator::ScanCoordinator;
use crate::format::{FormatManager, PluginFormat};

/// Name of the file that records which plugin is being scanned right now.
/// Anything still listed at startup crashed the previous scan.
pub const DEAD_MANS_PEDAL_FILE: &str = "RecentlyCrashedPluginsList";

/// Walks one format's search paths and feeds every new or changed file
/// through a [`ScanCoordinator`] into the [`KnownPluginList`].
pub struct PluginDirectoryScanner<'a> {
    list: &'a KnownPluginList,
    format: &'a dyn PluginFormat,
    coordinator: &'a mut ScanCoordinator,
    pedal: Option<PathBuf>,
    files: Vec<String>,
    next: usize,
    failed: Vec<String>,
}

impl<'a> PluginDirectoryScanner<'a> {
    pub fn new(
        list: &'a KnownPluginList,
        format: &'a dyn PluginFormat,
        coordinator: &'a mut ScanCoordinator,
        roots: &[PathBuf],
        recursive: bool,
        pedal: Option<PathBuf>,
    ) -> Result<Self, StoreError> {
        if let Some(pedal) = pedal.as_deref() {
            apply_blacklist_from_pedal(list, pedal)?;
        }
        let files = format
            .search_paths_for_plugins(roots, recursive)
            .into_iter()
            .filter(|file| !list.is_blacklisted(file))
            .collect::<Vec<_>>();
        debug!(count = files.len(), "collected {} candidates", format.name());
        Ok(Self {
            list,
            format,
            coordinator,
            pedal,
            files,
            next: 0,
            failed: Vec::new(),
        })
    }

    pub fn files(&self) -> &[String] {
        &self.files
    }

    /// Files whose scan could not be completed.
    pub fn failed_files(&self) -> &[String] {
        &self.failed
    }

    /// Fraction of candidate files handled so far.
    pub fn progress(&self) -> f32 {
        if self.files.is_empty() {
            1.0
        } else {
            self.next as f32 / self.files.len() as f32
        }
    }

    /// Scans the next candidate and returns its path, or `None` once every
    /// file has been handled.
    pub fn scan_next_file(&mut self) -> Result<Option<String>, StoreError> {
        let Some(file) = self.files.get(self.next).cloned() else {
            return Ok(None);
        };
        self.next += 1;

        let modified = self.format.last_modification_time(&file);
        if self.list.is_listed_and_up_to_date(&file, modified) {
            debug!("{file} is up to date");
            return Ok(Some(file));
        }

        if let Some(pedal) = self.pedal.as_deref() {
            set_pedal(pedal, Some(&file))?;
        }
        let scanned = scan_into_list(self.list, self.format, &mut *self.coordinator, &file);
        if let Some(pedal) = self.pedal.as_deref() {
            set_pedal(pedal, None)?;
        }

        if scanned?.is_none() {
            self.failed.push(file.clone());
        }
        Ok(Some(file))
    }

    /// Scans every remaining candidate, then releases the worker.
    pub fn scan_all(&mut self) -> Result<(), StoreError> {
        while self.scan_next_file()?.is_some() {}
        self.coordinator.scan_finished();
        if !self.failed.is_empty() {
            info!(
                "{} {} files could not be scanned",
                self.failed.len(),
                self.format.name()
            );
        }
        Ok(())
    }
}

impl std::fmt::Debug for PluginDirectoryScanner<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginDirectoryScanner")
            .field("format", &self.format.name())
            .field("files", &self.files.len())
            .field("next", &self.next)
            .field("failed", &self.failed)
            .finish()
    }
}

/// Scans an explicit set of files, such as ones dropped onto the plugin
/// list, against every format that might contain them. Returns the files
/// no format produced anything for.
pub fn scan_files(
    list: &KnownPluginList,
    formats: &FormatManager,
    coordinator: &mut ScanCoordinator,
    files: &[String],
) -> Result<Vec<String>, StoreError> {
    let mut unrecognised = Vec::new();
    for file in files {
        let mut found_any = false;
        for format in formats.formats() {
            if !format.file_might_contain_this_plugin_type(file) {
                continue;
            }
            if let Some(count) = scan_into_list(list, format, coordinator, file)? {
                if count > 0 {
                    found_any = true;
                    break;
                }
            }
        }
        if !found_any {
            unrecognised.push(file.clone());
        }
    }
    coordinator.scan_finished();
    Ok(unrecognised)
}

/// Scans one file and merges the results. `None` means the scan failed.
fn scan_into_list(
    list: &KnownPluginList,
    format: &dyn PluginFormat,
    coordinator: &mut ScanCoordinator,
    file: &str,
) -> Result<Option<usize>, StoreError> {
    let result = coordinator.find_plugin_types_for(format, file);
    if !result.success {
        warn!("scanning {file} as {} failed", format.name());
        return Ok(None);
    }
    let count = result.descriptions.len();
    for description in result.descriptions {
        list.add_type(description)?;
    }
    Ok(Some(count))
}

fn apply_blacklist_from_pedal(list: &KnownPluginList, pedal: &Path) -> Result<(), StoreError> {
    for crashed in read_pedal(pedal)? {
        warn!("{crashed} crashed a previous scan, blacklisting it");
        list.add_to_blacklist(&crashed)?;
    }
    set_pedal(pedal, None)?;
    Ok(())
}

fn read_pedal(pedal: &Path) -> io::Result<Vec<String>> {
    match fs::read_to_string(pedal) {
        Ok(raw) => Ok(raw
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(err) => Err(err),
    }
}

fn set_pedal(pedal: &Path, file: Option<&str>) -> io::Result<()> {
    if let Some(parent) = pedal.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    fs::write(pedal, file.map(|file| format!("{file}\n")).unwrap_or_default())
}
