use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use harmoniq_plugin_db::PluginDescription;
use serde::Deserialize;
use tracing::{debug, warn};
use walkdir::WalkDir;

/// A family of plugin packaging conventions that can enumerate the plugin
/// units inside one file or bundle.
pub trait PluginFormat: Send + Sync {
    fn name(&self) -> &str;

    /// Synchronously probes `file_or_identifier`. This runs third-party code
    /// in the calling process.
    fn find_all_types_for_file(&self, file_or_identifier: &str) -> Vec<PluginDescription>;

    fn file_might_contain_this_plugin_type(&self, file_or_identifier: &str) -> bool;

    fn default_search_paths(&self) -> Vec<PathBuf> {
        Vec::new()
    }

    /// Lists candidate files under `roots` without descending into bundles.
    fn search_paths_for_plugins(&self, roots: &[PathBuf], recursive: bool) -> Vec<String> {
        let max_depth = if recursive { 8 } else { 1 };
        let mut found = Vec::new();
        for root in roots {
            if !root.exists() {
                continue;
            }
            let mut walker = WalkDir::new(root).max_depth(max_depth).into_iter();
            while let Some(entry) = walker.next() {
                let entry = match entry {
                    Ok(entry) => entry,
                    Err(err) => {
                        debug!("skipping entry while searching {}: {err}", root.display());
                        continue;
                    }
                };
                if entry.depth() == 0 {
                    continue;
                }
                let candidate = entry.path().to_string_lossy().into_owned();
                if self.file_might_contain_this_plugin_type(&candidate) {
                    if entry.file_type().is_dir() {
                        walker.skip_current_dir();
                    }
                    found.push(candidate);
                }
            }
        }
        found.sort();
        found.dedup();
        found
    }

    fn last_modification_time(&self, file_or_identifier: &str) -> Option<DateTime<Utc>> {
        modification_time(Path::new(file_or_identifier))
    }
}

/// The set of formats a host or worker knows how to probe.
#[derive(Default)]
pub struct FormatManager {
    formats: Vec<Box<dyn PluginFormat>>,
}

impl FormatManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_default_formats() -> Self {
        let mut manager = Self::new();
        for kind in BundleKind::ALL {
            manager.add_format(Box::new(ManifestFormat::new(kind)));
        }
        manager
    }

    pub fn add_format(&mut self, format: Box<dyn PluginFormat>) {
        self.formats.push(format);
    }

    pub fn formats(&self) -> impl Iterator<Item = &dyn PluginFormat> {
        self.formats.iter().map(|format| format.as_ref())
    }

    /// Looks a format up by name, ignoring case.
    pub fn find(&self, name: &str) -> Option<&dyn PluginFormat> {
        self.formats()
            .find(|format| format.name().eq_ignore_ascii_case(name))
    }

    pub fn names(&self) -> Vec<String> {
        self.formats().map(|format| format.name().to_string()).collect()
    }
}

impl fmt::Debug for FormatManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FormatManager")
            .field("formats", &self.names())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BundleKind {
    Clap,
    Vst3,
    Ovst3,
    Harmoniq,
}

impl BundleKind {
    pub const ALL: [BundleKind; 4] = [
        BundleKind::Clap,
        BundleKind::Vst3,
        BundleKind::Ovst3,
        BundleKind::Harmoniq,
    ];

    pub fn label(self) -> &'static str {
        match self {
            BundleKind::Clap => "CLAP",
            BundleKind::Vst3 => "VST3",
            BundleKind::Ovst3 => "OVST3",
            BundleKind::Harmoniq => "Harmoniq",
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            BundleKind::Clap => "clap",
            BundleKind::Vst3 => "vst3",
            BundleKind::Ovst3 => "ovst3",
            BundleKind::Harmoniq => "hqplug",
        }
    }

    pub fn from_label(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "clap" => Some(Self::Clap),
            "vst3" => Some(Self::Vst3),
            "ovst3" | "openvst3" => Some(Self::Ovst3),
            "harmoniq" | "hq" | "hqplug" => Some(Self::Harmoniq),
            _ => None,
        }
    }
}

impl fmt::Display for BundleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Format that reads `manifest.json` metadata shipped inside plugin bundles.
#[derive(Debug, Clone)]
pub struct ManifestFormat {
    kind: BundleKind,
}

#[derive(Debug, Default, Deserialize)]
struct ManifestEntry {
    id: Option<String>,
    unique_id: Option<u32>,
    name: Option<String>,
    vendor: Option<String>,
    category: Option<String>,
    version: Option<String>,
    description: Option<String>,
    is_instrument: Option<bool>,
    num_inputs: Option<u32>,
    num_outputs: Option<u32>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ManifestFile {
    Bundle { plugins: Vec<ManifestEntry> },
    Single(ManifestEntry),
}

impl ManifestFormat {
    pub fn new(kind: BundleKind) -> Self {
        Self { kind }
    }

    pub fn kind(&self) -> BundleKind {
        self.kind
    }

    fn manifest_candidates(&self, path: &Path) -> Vec<PathBuf> {
        let mut candidates = Vec::new();
        match self.kind {
            BundleKind::Clap | BundleKind::Harmoniq => {
                if path.is_dir() {
                    candidates.push(path.join("manifest.json"));
                    candidates.push(path.join("Contents/manifest.json"));
                } else if let Some(parent) = path.parent() {
                    if let Some(stem) = path.file_stem() {
                        let mut sidecar = stem.to_os_string();
                        sidecar.push(".manifest.json");
                        candidates.push(parent.join(sidecar));
                    }
                }
            }
            BundleKind::Vst3 | BundleKind::Ovst3 => {
                candidates.push(path.join("Contents/manifest.json"));
                candidates.push(path.join("manifest.json"));
            }
        }
        candidates
    }

    fn read_manifest(&self, path: &Path) -> Result<Option<Vec<ManifestEntry>>, String> {
        for candidate in self.manifest_candidates(path) {
            if !candidate.is_file() {
                continue;
            }
            let raw = fs::read_to_string(&candidate)
                .map_err(|err| format!("{}: {err}", candidate.display()))?;
            let manifest: ManifestFile = serde_json::from_str(&raw)
                .map_err(|err| format!("{}: {err}", candidate.display()))?;
            return Ok(Some(match manifest {
                ManifestFile::Bundle { plugins } => plugins,
                ManifestFile::Single(entry) => vec![entry],
            }));
        }
        Ok(None)
    }

    fn describe(
        &self,
        entry: ManifestEntry,
        path: &Path,
        file: &str,
        shared: bool,
        modified: Option<DateTime<Utc>>,
    ) -> PluginDescription {
        let id = entry
            .id
            .unwrap_or_else(|| default_id(self.kind, path));
        let name = entry.name.unwrap_or_else(|| file_stem(path));
        let mut description = PluginDescription::new(name, self.kind.label(), file);
        if let Some(descriptive) = entry.description {
            description.descriptive_name = descriptive;
        }
        description.unique_id = entry.unique_id.unwrap_or_else(|| stable_hash(&id));
        description.manufacturer_name = entry.vendor;
        description.category = entry.category;
        description.version = entry.version;
        description.is_instrument = entry
            .is_instrument
            .unwrap_or(matches!(self.kind, BundleKind::Harmoniq));
        description.num_input_channels = entry.num_inputs.unwrap_or(0);
        description.num_output_channels = entry.num_outputs.unwrap_or(2);
        description.has_shared_container = shared;
        description.last_file_mod_time = modified;
        description
    }
}

impl PluginFormat for ManifestFormat {
    fn name(&self) -> &str {
        self.kind.label()
    }

    fn find_all_types_for_file(&self, file_or_identifier: &str) -> Vec<PluginDescription> {
        let path = Path::new(file_or_identifier);
        if !path.exists() {
            debug!("{} does not exist", path.display());
            return Vec::new();
        }
        let modified = modification_time(path);
        let entries = match self.read_manifest(path) {
            Ok(Some(entries)) => entries,
            Ok(None) => vec![ManifestEntry::default()],
            Err(err) => {
                warn!("unreadable {} manifest {err}", self.kind.label());
                return Vec::new();
            }
        };
        let shared = entries.len() > 1;
        entries
            .into_iter()
            .map(|entry| self.describe(entry, path, file_or_identifier, shared, modified))
            .collect()
    }

    fn file_might_contain_this_plugin_type(&self, file_or_identifier: &str) -> bool {
        let path = Path::new(file_or_identifier);
        let matches_extension = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.eq_ignore_ascii_case(self.kind.extension()))
            .unwrap_or(false);
        if !matches_extension {
            return false;
        }
        match self.kind {
            BundleKind::Vst3 | BundleKind::Ovst3 => path.is_dir(),
            BundleKind::Harmoniq => path.is_file(),
            BundleKind::Clap => true,
        }
    }

    fn default_search_paths(&self) -> Vec<PathBuf> {
        let mut paths = vec![PathBuf::from(format!(
            "/usr/share/harmoniq-studio/plugins/{}",
            self.kind.extension()
        ))];
        if let Some(home) = dirs::home_dir() {
            paths.push(match self.kind {
                BundleKind::Clap => home.join(".clap"),
                BundleKind::Vst3 => home.join(".vst3"),
                BundleKind::Ovst3 => home.join(".ovst3"),
                BundleKind::Harmoniq => home.join(".harmoniq/plugins"),
            });
        }
        paths
    }
}

fn modification_time(path: &Path) -> Option<DateTime<Utc>> {
    fs::metadata(path)
        .and_then(|metadata| metadata.modified())
        .ok()
        .map(DateTime::<Utc>::from)
}

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

fn default_id(kind: BundleKind, path: &Path) -> String {
    format!("{}#{}", file_stem(path), kind.extension())
}

/// FNV-1a, so identifiers map to the same uid on every run.
fn stable_hash(value: &str) -> u32 {
    value.bytes().fold(0x811c_9dc5u32, |hash, byte| {
        (hash ^ u32::from(byte)).wrapping_mul(0x0100_0193)
    })
}

#[cfg(test)]
mod tests {
    use std::fs::{create_dir_all, File};

    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    use super::*;

    #[test]
    fn vst3_bundle_with_two_plugins() {
        let dir = tempdir().unwrap();
        let bundle = dir.path().join("Reverb.vst3");
        create_dir_all(bundle.join("Contents")).unwrap();
        fs::write(
            bundle.join("Contents/manifest.json"),
            serde_json::json!({
                "plugins": [
                    { "id": "acme.reverb", "name": "Reverb", "vendor": "Acme", "num_inputs": 2 },
                    { "id": "acme.reverb.mono", "name": "Reverb Mono", "num_outputs": 1 }
                ]
            })
            .to_string(),
        )
        .unwrap();

        let format = ManifestFormat::new(BundleKind::Vst3);
        let file = bundle.to_string_lossy().into_owned();
        let found = format.find_all_types_for_file(&file);
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].name, "Reverb");
        assert_eq!(found[0].manufacturer_name.as_deref(), Some("Acme"));
        assert_eq!(found[0].unique_id, stable_hash("acme.reverb"));
        assert_eq!(found[1].num_output_channels, 1);
        assert!(found.iter().all(|desc| desc.has_shared_container));
        assert!(found.iter().all(|desc| desc.plugin_format_name == "VST3"));
    }

    #[test]
    fn bare_clap_file_gets_stub_description() {
        let dir = tempdir().unwrap();
        let plugin = dir.path().join("synth.clap");
        File::create(&plugin).unwrap();
        let format = ManifestFormat::new(BundleKind::Clap);
        let found = format.find_all_types_for_file(&plugin.to_string_lossy());
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].name, "synth");
        assert_eq!(found[0].unique_id, stable_hash("synth#clap"));
        assert!(found[0].last_file_mod_time.is_some());
    }

    #[test]
    fn malformed_manifest_yields_nothing() {
        let dir = tempdir().unwrap();
        let bundle = dir.path().join("Broken.vst3");
        create_dir_all(&bundle).unwrap();
        fs::write(bundle.join("manifest.json"), "{ not json").unwrap();
        let format = ManifestFormat::new(BundleKind::Vst3);
        assert!(format
            .find_all_types_for_file(&bundle.to_string_lossy())
            .is_empty());
        assert!(format.find_all_types_for_file("/missing/Gone.vst3").is_empty());
    }

    #[test]
    fn search_does_not_descend_into_bundles() {
        let dir = tempdir().unwrap();
        let bundle = dir.path().join("nested/Cool.vst3");
        create_dir_all(bundle.join("Contents/Inner.vst3")).unwrap();
        File::create(dir.path().join("notes.txt")).unwrap();
        let format = ManifestFormat::new(BundleKind::Vst3);
        let roots = vec![dir.path().to_path_buf()];

        let found = format.search_paths_for_plugins(&roots, true);
        assert_eq!(found, vec![bundle.to_string_lossy().into_owned()]);
        assert!(format.search_paths_for_plugins(&roots, false).is_empty());
    }

    #[test]
    fn manager_finds_formats_by_name() {
        let manager = FormatManager::with_default_formats();
        assert_eq!(manager.names(), vec!["CLAP", "VST3", "OVST3", "Harmoniq"]);
        assert_eq!(manager.find("vst3").map(|f| f.name()), Some("VST3"));
        assert!(manager.find("AU").is_none());
    }

    #[test]
    fn bundle_kinds_parse_from_labels() {
        assert_eq!(BundleKind::from_label("hq"), Some(BundleKind::Harmoniq));
        assert_eq!(BundleKind::from_label("OpenVST3"), Some(BundleKind::Ovst3));
        assert_eq!(BundleKind::from_label("aax"), None);
    }
}
