//! Worker side of the scan channel.

use std::io::{Read, Write};

use harmoniq_plugin_db::descriptions_to_text;
use tracing::{debug, warn};

use crate::format::FormatManager;
use crate::wire::{decode_request, encode_reply, read_frame, write_frame, WireError};

/// Answers scan requests until the host closes the channel.
///
/// Every request gets exactly one reply; unknown formats and undecodable
/// requests are answered with an empty tree.
pub fn serve<R: Read, W: Write>(
    mut reader: R,
    mut writer: W,
    formats: &FormatManager,
) -> Result<(), WireError> {
    while let Some(payload) = read_frame(&mut reader)? {
        let reply = handle_request(&payload, formats);
        write_frame(&mut writer, &encode_reply(&reply))?;
    }
    debug!("host closed the scan channel");
    Ok(())
}

fn handle_request(payload: &[u8], formats: &FormatManager) -> String {
    let request = match decode_request(payload) {
        Ok(request) => request,
        Err(err) => {
            warn!("ignoring malformed scan request: {err}");
            return descriptions_to_text(&[]);
        }
    };
    let Some(format) = formats.find(&request.format_name) else {
        warn!("no plugin format named {}", request.format_name);
        return descriptions_to_text(&[]);
    };
    let found = format.find_all_types_for_file(&request.file_or_identifier);
    debug!(
        count = found.len(),
        "scanned {} as {}",
        request.file_or_identifier,
        format.name()
    );
    descriptions_to_text(&found)
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::io::Cursor;

    use harmoniq_plugin_db::descriptions_from_text;
    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    use super::*;
    use crate::wire::{decode_reply, encode_request, ScanRequest};

    fn framed(payloads: &[Vec<u8>]) -> Cursor<Vec<u8>> {
        let mut input = Vec::new();
        for payload in payloads {
            write_frame(&mut input, payload).unwrap();
        }
        Cursor::new(input)
    }

    fn replies(output: Vec<u8>) -> Vec<String> {
        let mut cursor = Cursor::new(output);
        let mut texts = Vec::new();
        while let Some(frame) = read_frame(&mut cursor).unwrap() {
            texts.push(decode_reply(&frame));
        }
        texts
    }

    #[test]
    fn answers_every_request_in_order() {
        let dir = tempdir().unwrap();
        let bundle = dir.path().join("Delay.vst3");
        fs::create_dir_all(&bundle).unwrap();
        fs::write(
            bundle.join("manifest.json"),
            r#"{ "id": "acme.delay", "name": "Delay", "vendor": "Acme" }"#,
        )
        .unwrap();
        let file = bundle.to_string_lossy().into_owned();

        let input = framed(&[
            encode_request(&ScanRequest::new("VST3", file.as_str())),
            encode_request(&ScanRequest::new("AU", file.as_str())),
            vec![1, 2, 3],
        ]);
        let mut output = Vec::new();
        serve(input, &mut output, &FormatManager::with_default_formats()).unwrap();

        let texts = replies(output);
        assert_eq!(texts.len(), 3);
        let found = descriptions_from_text(&texts[0]);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].name, "Delay");
        assert_eq!(found[0].file_or_identifier, file);
        assert!(descriptions_from_text(&texts[1]).is_empty());
        assert!(descriptions_from_text(&texts[2]).is_empty());
    }

    #[test]
    fn empty_input_ends_cleanly() {
        let mut output = Vec::new();
        serve(Cursor::new(Vec::new()), &mut output, &FormatManager::new()).unwrap();
        assert!(output.is_empty());
    }
}
