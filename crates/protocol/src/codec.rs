//! Line codec for control and data-plane records
//!
//! Records are compact JSON objects terminated by a single `\n`. JSON string
//! escaping guarantees the encoded record itself never contains a raw
//! newline, so the terminator is an unambiguous frame boundary.
//!
//! # Frame Format
//!
//! ```text
//! {"success":true}\n
//! ```
//!
//! Maximum frame size is 8 MiB to bound memory used by a misbehaving peer.

use crate::error::{ProtocolError, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::io::{BufRead, Read, Write};

/// Maximum allowed frame size (8 MiB), terminator excluded
pub const MAX_FRAME_SIZE: usize = 8 * 1024 * 1024;

/// Encode a record as a single line (without the terminator)
///
/// # Example
/// ```
/// use protocol::{StandardResponse, encode_line};
///
/// let line = encode_line(&StandardResponse::ok()).unwrap();
/// assert_eq!(line, r#"{"success":true}"#);
/// ```
pub fn encode_line<T: Serialize>(value: &T) -> Result<String> {
    let line = serde_json::to_string(value)?;
    check_frame(&line)?;
    Ok(line)
}

/// Decode a record from one line, ignoring a trailing `\r\n` or `\n`
///
/// # Example
/// ```
/// use protocol::{SubscribeRequest, decode_line};
///
/// let req: SubscribeRequest = decode_line("{\"subscribe\":true}\n").unwrap();
/// assert!(req.subscribe);
/// ```
pub fn decode_line<T: DeserializeOwned>(line: &str) -> Result<T> {
    let trimmed = line.trim_end_matches(['\r', '\n']);
    if trimmed.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge {
            size: trimmed.len(),
            max: MAX_FRAME_SIZE,
        });
    }
    Ok(serde_json::from_str(trimmed)?)
}

/// Write a line followed by the terminator
pub fn write_line<W: Write>(writer: &mut W, line: &str) -> Result<()> {
    check_frame(line)?;
    let mut frame = Vec::with_capacity(line.len() + 1);
    frame.extend_from_slice(line.as_bytes());
    frame.push(b'\n');
    writer.write_all(&frame)?;
    writer.flush()?;
    Ok(())
}

/// Largest buffered frame: the limit plus a `\r\n` terminator
const FRAME_CAPACITY: usize = MAX_FRAME_SIZE + 2;

/// Append bytes up to and including the next terminator to `buf`
///
/// `buf` never grows past the frame limit, so a peer that never sends a
/// terminator cannot exhaust memory. Bytes read before an I/O error (a read
/// timeout, say) stay in `buf` and count against the limit on the next call.
/// Check [`frame_overflowed`] after every successful read.
pub fn read_frame<R: BufRead>(reader: &mut R, buf: &mut Vec<u8>) -> std::io::Result<usize> {
    let limit = FRAME_CAPACITY.saturating_sub(buf.len()) as u64;
    reader.by_ref().take(limit).read_until(b'\n', buf)
}

/// True when `buf` holds more than a frame's worth without a terminator
pub fn frame_overflowed(buf: &[u8]) -> bool {
    buf.last() != Some(&b'\n') && buf.len() > MAX_FRAME_SIZE
}

/// Read one line from a blocking reader
///
/// Returns `Ok(None)` on a clean end of stream. The terminator is stripped.
pub fn read_line<R: BufRead>(reader: &mut R) -> Result<Option<String>> {
    let mut buf = Vec::new();
    if read_frame(reader, &mut buf)? == 0 {
        return Ok(None);
    }
    if frame_overflowed(&buf) {
        return Err(ProtocolError::FrameTooLarge {
            size: buf.len(),
            max: MAX_FRAME_SIZE,
        });
    }
    frame_to_string(buf).map(Some)
}

/// Convert a raw frame (terminator optional) into a string
pub fn frame_to_string(mut frame: Vec<u8>) -> Result<String> {
    while matches!(frame.last(), Some(b'\n') | Some(b'\r')) {
        frame.pop();
    }
    String::from_utf8(frame).map_err(|_| ProtocolError::InvalidUtf8)
}

fn check_frame(line: &str) -> Result<()> {
    if line.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge {
            size: line.len(),
            max: MAX_FRAME_SIZE,
        });
    }
    if line.contains('\n') {
        return Err(ProtocolError::EmbeddedNewline);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{RawRecord, StandardResponse};
    use std::io::Cursor;

    #[test]
    fn test_write_then_read_lines() {
        let mut wire = Vec::new();
        write_line(&mut wire, &encode_line(&StandardResponse::ok()).unwrap()).unwrap();
        write_line(
            &mut wire,
            &encode_line(&StandardResponse::failure("nope")).unwrap(),
        )
        .unwrap();

        let mut reader = Cursor::new(wire);
        let first: StandardResponse =
            decode_line(&read_line(&mut reader).unwrap().unwrap()).unwrap();
        let second: StandardResponse =
            decode_line(&read_line(&mut reader).unwrap().unwrap()).unwrap();
        assert!(first.success);
        assert_eq!(second.message.as_deref(), Some("nope"));
        assert!(read_line(&mut reader).unwrap().is_none());
    }

    #[test]
    fn test_payload_newlines_are_escaped() {
        let line = encode_line(&RawRecord::new("a\nb\r\n")).unwrap();
        assert!(!line.contains('\n'));
        let decoded: RawRecord = decode_line(&line).unwrap();
        assert_eq!(decoded.data, "a\nb\r\n");
    }

    #[test]
    fn test_write_rejects_embedded_newline() {
        let mut wire = Vec::new();
        let result = write_line(&mut wire, "{}\n{}");
        assert!(matches!(result, Err(ProtocolError::EmbeddedNewline)));
        assert!(wire.is_empty());
    }

    #[test]
    fn test_decode_strips_crlf() {
        let resp: StandardResponse = decode_line("{\"success\":false}\r\n").unwrap();
        assert!(!resp.success);
    }

    #[test]
    fn test_invalid_json_is_error() {
        let result: Result<StandardResponse> = decode_line("not json");
        assert!(matches!(result, Err(ProtocolError::Serialization(_))));
    }

    #[test]
    fn test_invalid_utf8_frame() {
        assert!(matches!(
            frame_to_string(vec![0xff, 0xfe, b'\n']),
            Err(ProtocolError::InvalidUtf8)
        ));
    }

    #[test]
    fn test_read_frame_stops_at_capacity() {
        let endless = vec![b'x'; MAX_FRAME_SIZE * 2];
        let mut reader = Cursor::new(endless);
        let mut buf = Vec::new();

        let read = read_frame(&mut reader, &mut buf).unwrap();
        assert_eq!(read, FRAME_CAPACITY);
        assert_eq!(buf.len(), FRAME_CAPACITY);
        assert!(frame_overflowed(&buf));
    }

    #[test]
    fn test_read_frame_counts_pending_bytes() {
        let mut buf = vec![b'x'; MAX_FRAME_SIZE];
        let mut reader = Cursor::new(b"yyyy\n".to_vec());

        read_frame(&mut reader, &mut buf).unwrap();
        assert_eq!(buf.len(), FRAME_CAPACITY);
        assert!(frame_overflowed(&buf));
    }
}
