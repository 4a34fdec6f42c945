use std::fs;
use std::io::Cursor;
use std::path::Path;

use assert_cmd::Command;
use harmoniq_plugin_db::descriptions_from_text;
use harmoniq_plugin_scanner::wire::{
    decode_reply, encode_request, read_frame, write_frame, ScanRequest,
};
use harmoniq_plugin_scanner::worker::WORKER_EXECUTABLE_ENV;
use harmoniq_plugin_scanner::worker_role_arg;
use tempfile::tempdir;

fn write_bundle(root: &Path, name: &str, vendor: &str) {
    let bundle = root.join(format!("{name}.vst3"));
    fs::create_dir_all(&bundle).unwrap();
    fs::write(
        bundle.join("manifest.json"),
        serde_json::json!({ "id": format!("test.{name}"), "name": name, "vendor": vendor })
            .to_string(),
    )
    .unwrap();
}

fn scanner() -> Command {
    let mut cmd = Command::cargo_bin("harmoniq-plugin-scanner").unwrap();
    cmd.env_remove(WORKER_EXECUTABLE_ENV);
    cmd
}

fn run(dir: &Path, extra: &[&str]) -> String {
    let plugins = dir.join("plugins");
    let output = scanner()
        .arg("--formats")
        .arg("vst3")
        .arg("--no-default-paths")
        .arg("--path")
        .arg(&plugins)
        .arg("--settings")
        .arg(dir.join("settings.json"))
        .arg("--registry")
        .arg(dir.join("known.json"))
        .args(extra)
        .output()
        .unwrap();
    assert!(
        output.status.success(),
        "scanner failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8(output.stdout).unwrap()
}

#[test]
fn in_process_scan_lists_plugins_by_manufacturer() {
    let dir = tempdir().unwrap();
    let plugins = dir.path().join("plugins");
    write_bundle(&plugins, "Zeta", "Acme");
    write_bundle(&plugins, "Alpha", "Zenith");

    let stdout = run(dir.path(), &["--mode", "in-process"]);
    let lines: Vec<_> = stdout.lines().collect();
    assert_eq!(lines.len(), 2);
    assert!(lines[0].starts_with("Zeta (VST3) - "));
    assert!(lines[1].starts_with("Alpha (VST3) - "));
}

#[test]
fn out_of_process_scan_uses_worker_binary() {
    let dir = tempdir().unwrap();
    let plugins = dir.path().join("plugins");
    write_bundle(&plugins, "Gate", "Acme");

    let stdout = run(
        dir.path(),
        &[
            "--mode",
            "out-of-process",
            "--sort",
            "name",
            "--scan-timeout-ms",
            "10000",
        ],
    );
    assert!(stdout.contains("Gate (VST3) - "));
    assert!(!stdout.contains("failed:"));

    let settings = fs::read_to_string(dir.path().join("settings.json")).unwrap();
    let settings: serde_json::Value = serde_json::from_str(&settings).unwrap();
    assert_eq!(settings["plugin_scan_mode"], 1);
    assert_eq!(settings["plugin_sort_method"], 1);
}

#[test]
fn worker_role_serves_framed_requests() {
    let dir = tempdir().unwrap();
    write_bundle(dir.path(), "Comp", "Acme");
    let bundle = dir.path().join("Comp.vst3").to_string_lossy().into_owned();

    let mut input = Vec::new();
    write_frame(
        &mut input,
        &encode_request(&ScanRequest::new("VST3", bundle.as_str())),
    )
    .unwrap();

    let output = scanner()
        .arg(worker_role_arg())
        .write_stdin(input)
        .output()
        .unwrap();
    assert!(output.status.success());

    let mut reader = Cursor::new(output.stdout);
    let frame = read_frame(&mut reader).unwrap().unwrap();
    let found = descriptions_from_text(&decode_reply(&frame));
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].name, "Comp");
    assert_eq!(found[0].file_or_identifier, bundle);
    assert_eq!(read_frame(&mut reader).unwrap(), None);
}
