use std::env;
use std::io::{self, Write};
use std::path::Path;
use std::thread;
use std::time::Duration;

use anyhow::Result;
use harmoniq_plugin_db::{descriptions_to_text, PluginDescription};
use harmoniq_plugin_scanner::wire::{decode_request, encode_reply, read_frame, write_frame};

fn main() -> Result<()> {
    let behavior = env::args()
        .find_map(|arg| arg.strip_prefix("--behavior=").map(str::to_string))
        .unwrap_or_else(|| "echo".to_string());

    let stdin = io::stdin();
    let stdout = io::stdout();
    let mut reader = stdin.lock();
    let mut writer = stdout.lock();

    while let Some(payload) = read_frame(&mut reader)? {
        match behavior.as_str() {
            "exit" => return Ok(()),
            "crash" => std::process::abort(),
            "hang" => loop {
                thread::sleep(Duration::from_millis(100));
            },
            "garbage" => {
                writer.write_all(&[3, 0, 0, 0, 0xff, 0xfe, 0xfd])?;
                writer.flush()?;
            }
            _ => {
                let request = decode_request(&payload)?;
                let name = Path::new(&request.file_or_identifier)
                    .file_stem()
                    .map(|stem| stem.to_string_lossy().into_owned())
                    .unwrap_or_default();
                let description = PluginDescription::new(
                    name,
                    request.format_name.as_str(),
                    request.file_or_identifier.as_str(),
                );
                write_frame(&mut writer, &encode_reply(&descriptions_to_text(&[description])))?;
            }
        }
    }
    Ok(())
}
