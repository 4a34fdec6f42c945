use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use harmoniq_plugin_db::{KnownPluginList, SortMethod};
use harmoniq_plugin_scanner::{
    is_worker_invocation, scan_files, serve, BundleKind, CancellationToken, CoordinatorConfig,
    FormatManager, ManifestFormat, ModeObserver, PluginDirectoryScanner, PluginFormat,
    ProcessLauncher, PropertiesFile, ScanCoordinator, ScanMode, SettingsStore,
    DEAD_MANS_PEDAL_FILE, SCAN_MODE_KEY,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

const SORT_METHOD_KEY: &str = "plugin_sort_method";

#[derive(Parser, Debug)]
#[command(name = "harmoniq-plugin-scanner", version)]
struct Args {
    /// Restrict scanning to the given plugin formats
    #[arg(
        long,
        value_name = "FORMAT",
        value_parser = parse_format,
        default_values_t = BundleKind::ALL.to_vec(),
    )]
    formats: Vec<BundleKind>,

    /// Additional paths to scan for plugins
    #[arg(long = "path", value_name = "PATH")]
    extra_paths: Vec<PathBuf>,

    /// Skip the per-format default search locations
    #[arg(long)]
    no_default_paths: bool,

    /// Where plugins are probed; persisted to the settings file
    #[arg(long, value_enum)]
    mode: Option<ModeArg>,

    /// Order used when listing known plugins; persisted to the settings file
    #[arg(long, value_name = "METHOD", value_parser = parse_sort)]
    sort: Option<SortMethod>,

    /// Settings file (defaults to the user config directory)
    #[arg(long, value_name = "FILE")]
    settings: Option<PathBuf>,

    /// Known plugin list (defaults to the user config directory)
    #[arg(long, value_name = "FILE")]
    registry: Option<PathBuf>,

    /// Give up on a single out-of-process scan after this many milliseconds
    #[arg(long, value_name = "MS")]
    scan_timeout_ms: Option<u64>,

    /// Scan these files or bundles instead of searching directories
    #[arg(value_name = "FILES")]
    files: Vec<String>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ModeArg {
    InProcess,
    OutOfProcess,
}

impl From<ModeArg> for ScanMode {
    fn from(value: ModeArg) -> Self {
        match value {
            ModeArg::InProcess => ScanMode::InProcess,
            ModeArg::OutOfProcess => ScanMode::OutOfProcess,
        }
    }
}

fn parse_format(value: &str) -> Result<BundleKind, String> {
    BundleKind::from_label(value).ok_or_else(|| format!("unsupported format: {value}"))
}

fn parse_sort(value: &str) -> Result<SortMethod, String> {
    match value.to_ascii_lowercase().as_str() {
        "default" | "none" => Ok(SortMethod::DefaultOrder),
        "name" | "alphabetical" | "alphabetically" => Ok(SortMethod::Alphabetically),
        "category" => Ok(SortMethod::ByCategory),
        "manufacturer" | "vendor" => Ok(SortMethod::ByManufacturer),
        "location" | "path" => Ok(SortMethod::ByFileSystemLocation),
        other => Err(format!("unsupported sort method: {other}")),
    }
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .try_init()
        .ok();
}

fn main() -> anyhow::Result<()> {
    init_tracing();
    if is_worker_invocation(std::env::args_os()) {
        return run_worker();
    }
    run_host(Args::parse())
}

/// Stdout carries frames, so nothing else may be printed there.
fn run_worker() -> anyhow::Result<()> {
    let formats = FormatManager::with_default_formats();
    let stdin = io::stdin();
    let stdout = io::stdout();
    serve(stdin.lock(), stdout.lock(), &formats).context("scan worker channel failed")?;
    Ok(())
}

fn run_host(args: Args) -> anyhow::Result<()> {
    let settings_path = match args.settings {
        Some(path) => path,
        None => PropertiesFile::default_path()?,
    };
    let settings = Arc::new(
        PropertiesFile::open(&settings_path)
            .with_context(|| format!("failed to open {}", settings_path.display()))?,
    );
    if let Some(mode) = args.mode {
        settings.set_int(SCAN_MODE_KEY, ScanMode::from(mode).to_setting())?;
    }
    if let Some(sort) = args.sort {
        settings.set_int(SORT_METHOD_KEY, sort.to_setting())?;
    }

    let observer = ModeObserver::attach(settings.clone());
    #[cfg(feature = "watch")]
    let _watcher = settings
        .watch()
        .map_err(|err| tracing::warn!("settings will not be reloaded: {err}"))
        .ok();

    let registry_path = match args.registry {
        Some(path) => path,
        None => KnownPluginList::default_path()?,
    };
    let list = KnownPluginList::open(&registry_path)
        .with_context(|| format!("failed to open {}", registry_path.display()))?;
    let pedal = registry_path.with_file_name(DEAD_MANS_PEDAL_FILE);

    let config = CoordinatorConfig {
        scan_timeout: args.scan_timeout_ms.map(Duration::from_millis),
        ..CoordinatorConfig::default()
    };
    let mut coordinator = ScanCoordinator::new(
        observer.flag(),
        Box::new(ProcessLauncher::default()),
        CancellationToken::new(),
    )
    .with_config(config);
    info!(mode = ?observer.mode(), "scanning plugins");

    let mut formats = FormatManager::new();
    for kind in &args.formats {
        formats.add_format(Box::new(ManifestFormat::new(*kind)));
    }

    let failed = if args.files.is_empty() {
        let mut failed = Vec::new();
        for format in formats.formats() {
            let mut roots = args.extra_paths.clone();
            if !args.no_default_paths {
                roots.extend(format.default_search_paths());
            }
            let mut scanner = PluginDirectoryScanner::new(
                &list,
                format,
                &mut coordinator,
                &roots,
                true,
                Some(pedal.clone()),
            )?;
            scanner.scan_all()?;
            failed.extend_from_slice(scanner.failed_files());
        }
        failed
    } else {
        scan_files(&list, &formats, &mut coordinator, &args.files)?
    };

    let sort = SortMethod::from_setting(
        settings.get_int(SORT_METHOD_KEY, SortMethod::default().to_setting()),
    );
    for plugin in list.sorted(sort) {
        println!(
            "{} ({}) - {}",
            plugin.name, plugin.plugin_format_name, plugin.file_or_identifier
        );
    }
    for file in failed {
        println!("failed: {file}");
    }
    Ok(())
}
