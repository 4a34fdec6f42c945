//! Framing shared by the host and its scan workers.
//!
//! Every message is `[len:u32 LE][payload]`. A request payload holds two
//! length-prefixed UTF-8 strings (format name, then file or identifier); a
//! reply payload holds one length-prefixed UTF-8 string with the descriptor
//! tree text.

use std::io::{self, Read, Write};

use thiserror::Error;

/// Upper bound on a single frame; anything larger is treated as corruption.
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum WireError {
    #[error("i/o error on worker channel: {0}")]
    Io(#[from] io::Error),
    #[error("frame of {0} bytes exceeds the frame size limit")]
    Oversized(usize),
    #[error("message truncated")]
    Truncated,
    #[error("message is not valid UTF-8")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),
}

/// One request sent to a scan worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanRequest {
    pub format_name: String,
    pub file_or_identifier: String,
}

impl ScanRequest {
    pub fn new(format_name: impl Into<String>, file_or_identifier: impl Into<String>) -> Self {
        Self {
            format_name: format_name.into(),
            file_or_identifier: file_or_identifier.into(),
        }
    }
}

pub fn encode_request(request: &ScanRequest) -> Vec<u8> {
    let mut out = Vec::with_capacity(
        8 + request.format_name.len() + request.file_or_identifier.len(),
    );
    put_string(&mut out, &request.format_name);
    put_string(&mut out, &request.file_or_identifier);
    out
}

pub fn decode_request(payload: &[u8]) -> Result<ScanRequest, WireError> {
    let mut cursor = payload;
    let format_name = take_string(&mut cursor)?;
    let file_or_identifier = take_string(&mut cursor)?;
    Ok(ScanRequest {
        format_name,
        file_or_identifier,
    })
}

pub fn encode_reply(tree_text: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + tree_text.len());
    put_string(&mut out, tree_text);
    out
}

/// Extracts the descriptor tree text. A malformed reply degrades to an
/// empty string, which decodes to zero descriptions.
pub fn decode_reply(payload: &[u8]) -> String {
    let mut cursor = payload;
    match take_string(&mut cursor) {
        Ok(text) => text,
        Err(err) => {
            tracing::debug!("discarding malformed worker reply: {err}");
            String::new()
        }
    }
}

pub fn write_frame<W: Write>(writer: &mut W, payload: &[u8]) -> Result<(), WireError> {
    if payload.len() > MAX_FRAME_LEN {
        return Err(WireError::Oversized(payload.len()));
    }
    writer.write_all(&(payload.len() as u32).to_le_bytes())?;
    writer.write_all(payload)?;
    writer.flush()?;
    Ok(())
}

/// Reads one frame. Returns `Ok(None)` when the stream ends cleanly before a
/// new frame starts.
pub fn read_frame<R: Read>(reader: &mut R) -> Result<Option<Vec<u8>>, WireError> {
    let mut header = [0u8; 4];
    let mut filled = 0;
    while filled < header.len() {
        match reader.read(&mut header[filled..]) {
            Ok(0) if filled == 0 => return Ok(None),
            Ok(0) => return Err(WireError::Truncated),
            Ok(n) => filled += n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => return Err(err.into()),
        }
    }
    let len = u32::from_le_bytes(header) as usize;
    if len > MAX_FRAME_LEN {
        return Err(WireError::Oversized(len));
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).map_err(|err| match err.kind() {
        io::ErrorKind::UnexpectedEof => WireError::Truncated,
        _ => WireError::Io(err),
    })?;
    Ok(Some(payload))
}

fn put_string(out: &mut Vec<u8>, value: &str) {
    out.extend_from_slice(&(value.len() as u32).to_le_bytes());
    out.extend_from_slice(value.as_bytes());
}

fn take_string(cursor: &mut &[u8]) -> Result<String, WireError> {
    if cursor.len() < 4 {
        return Err(WireError::Truncated);
    }
    let (header, rest) = cursor.split_at(4);
    let len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
    if rest.len() < len {
        return Err(WireError::Truncated);
    }
    let (bytes, rest) = rest.split_at(len);
    *cursor = rest;
    Ok(String::from_utf8(bytes.to_vec())?)
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn request_layout_is_two_prefixed_strings() {
        let bytes = encode_request(&ScanRequest::new("VST3", "/p/R.vst3"));
        let mut expected = vec![4, 0, 0, 0];
        expected.extend_from_slice(b"VST3");
        expected.extend_from_slice(&[9, 0, 0, 0]);
        expected.extend_from_slice(b"/p/R.vst3");
        assert_eq!(bytes, expected);
        assert_eq!(
            decode_request(&bytes).unwrap(),
            ScanRequest::new("VST3", "/p/R.vst3")
        );
    }

    #[test]
    fn truncated_request_is_an_error() {
        let bytes = encode_request(&ScanRequest::new("CLAP", "/p/synth.clap"));
        assert!(matches!(
            decode_request(&bytes[..bytes.len() - 1]),
            Err(WireError::Truncated)
        ));
        assert!(matches!(decode_request(&[1, 0]), Err(WireError::Truncated)));
    }

    #[test]
    fn bad_reply_degrades_to_empty_text() {
        assert_eq!(decode_reply(&[]), "");
        assert_eq!(decode_reply(&[10, 0, 0, 0, b'x']), "");
        assert_eq!(decode_reply(&[2, 0, 0, 0, 0xff, 0xfe]), "");
        assert_eq!(decode_reply(&encode_reply("{}")), "{}");
    }

    #[test]
    fn frames_stream_back_to_back() {
        let mut buffer = Vec::new();
        write_frame(&mut buffer, b"first").unwrap();
        write_frame(&mut buffer, b"").unwrap();
        let mut reader = Cursor::new(buffer);
        assert_eq!(read_frame(&mut reader).unwrap(), Some(b"first".to_vec()));
        assert_eq!(read_frame(&mut reader).unwrap(), Some(Vec::new()));
        assert_eq!(read_frame(&mut reader).unwrap(), None);
    }

    #[test]
    fn partial_frame_is_truncated() {
        let mut reader = Cursor::new(vec![8, 0, 0, 0, 1, 2]);
        assert!(matches!(read_frame(&mut reader), Err(WireError::Truncated)));
        let mut header_only = Cursor::new(vec![8, 0]);
        assert!(matches!(
            read_frame(&mut header_only),
            Err(WireError::Truncated)
        ));
    }

    #[test]
    fn oversized_header_is_rejected() {
        let mut reader = Cursor::new(u32::MAX.to_le_bytes().to_vec());
        assert!(matches!(
            read_frame(&mut reader),
            Err(WireError::Oversized(_))
        ));
    }
}
