//! Line framing for helper communication.
//!
//! Outbound frames are terminated with `\r\n`; inbound frames are split on
//! `\r?\n`. Empty inbound lines are padding and never surface as frames.
//! Works over any AsyncRead/AsyncWrite (child pipes, in-memory duplex, etc).

use std::io;

use tokio_util::bytes::{BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Longest inbound line accepted by default (8 MiB).
pub const DEFAULT_MAX_LINE_LENGTH: usize = 8 * 1024 * 1024;

/// Codec that frames UTF-8 text lines.
#[derive(Debug)]
pub struct LineCodec {
    /// Bytes already scanned for a newline in the current buffer.
    next_index: usize,
    max_length: usize,
}

impl LineCodec {
    pub fn new() -> Self {
        Self::with_max_length(DEFAULT_MAX_LINE_LENGTH)
    }

    /// Inbound lines longer than `max_length` bytes (terminator excluded)
    /// fail decoding with `InvalidData`.
    pub fn with_max_length(max_length: usize) -> Self {
        Self {
            next_index: 0,
            max_length,
        }
    }

    pub fn max_length(&self) -> usize {
        self.max_length
    }
}

impl Default for LineCodec {
    fn default() -> Self {
        Self::new()
    }
}

fn line_too_long(max_length: usize) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidData,
        format!("helper line exceeds {max_length} bytes"),
    )
}

fn into_line(mut bytes: BytesMut) -> Option<String> {
    if bytes.last() == Some(&b'\r') {
        bytes.truncate(bytes.len() - 1);
    }
    if bytes.is_empty() {
        return None;
    }
    let line = match String::from_utf8(bytes.to_vec()) {
        Ok(line) => line,
        Err(e) => {
            tracing::warn!(error = %e, "Helper emitted invalid UTF-8; decoding lossily");
            String::from_utf8_lossy(e.as_bytes()).into_owned()
        }
    };
    Some(line)
}

impl Decoder for LineCodec {
    type Item = String;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            let Some(offset) = src[self.next_index..].iter().position(|b| *b == b'\n') else {
                // One byte of slack for a trailing `\r`.
                if src.len() > self.max_length.saturating_add(1) {
                    return Err(line_too_long(self.max_length));
                }
                self.next_index = src.len();
                return Ok(None);
            };

            let newline = self.next_index + offset;
            self.next_index = 0;
            let content = if newline > 0 && src[newline - 1] == b'\r' {
                newline - 1
            } else {
                newline
            };
            if content > self.max_length {
                return Err(line_too_long(self.max_length));
            }

            let mut frame = src.split_to(newline + 1);
            frame.truncate(newline);
            if let Some(line) = into_line(frame) {
                return Ok(Some(line));
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(line) = self.decode(src)? {
            return Ok(Some(line));
        }
        // Unterminated trailing output still counts as a line.
        self.next_index = 0;
        if src.is_empty() {
            return Ok(None);
        }
        let rest = src.split_to(src.len());
        Ok(into_line(rest))
    }
}

impl Encoder<String> for LineCodec {
    type Error = io::Error;

    fn encode(&mut self, line: String, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if line.contains('\n') {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "outbound frame contains a newline",
            ));
        }
        tracing::trace!(line_size_bytes = line.len(), "Encoding frame");
        dst.reserve(line.len() + 2);
        dst.put_slice(line.as_bytes());
        dst.put_slice(b"\r\n");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(codec: &mut LineCodec, buf: &mut BytesMut) -> Vec<String> {
        let mut lines = Vec::new();
        while let Some(line) = codec.decode(buf).unwrap() {
            lines.push(line);
        }
        lines
    }

    #[test]
    fn encode_appends_crlf() {
        let mut codec = LineCodec::new();
        let mut buf = BytesMut::new();
        codec
            .encode(r#"{"cmd":"ping"}"#.to_string(), &mut buf)
            .unwrap();
        assert_eq!(&buf[..], b"{\"cmd\":\"ping\"}\r\n");
    }

    #[test]
    fn encode_rejects_embedded_newline() {
        let mut codec = LineCodec::new();
        let mut buf = BytesMut::new();
        let err = codec.encode("a\nb".to_string(), &mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
        assert!(buf.is_empty());
    }

    #[test]
    fn decode_splits_on_lf_and_crlf() {
        let mut codec = LineCodec::new();
        let mut buf = BytesMut::from(&b"one\r\ntwo\nthree\r\n"[..]);
        assert_eq!(decode_all(&mut codec, &mut buf), ["one", "two", "three"]);
        assert!(buf.is_empty());
    }

    #[test]
    fn decode_skips_empty_lines() {
        let mut codec = LineCodec::new();
        let mut buf = BytesMut::from(&b"\r\n\n{\"response\":1}\r\n\r\n"[..]);
        assert_eq!(decode_all(&mut codec, &mut buf), [r#"{"response":1}"#]);
    }

    #[test]
    fn decode_waits_for_terminator() {
        let mut codec = LineCodec::new();
        let mut buf = BytesMut::from(&b"{\"resp"[..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(b"onse\":2}\r");
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(b"\n");
        assert_eq!(
            codec.decode(&mut buf).unwrap().as_deref(),
            Some(r#"{"response":2}"#)
        );
    }

    #[test]
    fn decode_eof_flushes_unterminated_line() {
        let mut codec = LineCodec::new();
        let mut buf = BytesMut::from(&b"first\nlast"[..]);
        assert_eq!(codec.decode_eof(&mut buf).unwrap().as_deref(), Some("first"));
        assert_eq!(codec.decode_eof(&mut buf).unwrap().as_deref(), Some("last"));
        assert!(codec.decode_eof(&mut buf).unwrap().is_none());
    }

    #[test]
    fn decode_rejects_overlong_line() {
        let mut codec = LineCodec::with_max_length(8);
        let mut buf = BytesMut::from(&b"12345678\r\n"[..]);
        assert_eq!(codec.decode(&mut buf).unwrap().as_deref(), Some("12345678"));

        let mut buf = BytesMut::from(&b"123456789\n"[..]);
        let err = codec.decode(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn decode_rejects_unterminated_output_past_limit() {
        let mut codec = LineCodec::with_max_length(8);
        let mut buf = BytesMut::from(&b"{\"response\":"[..]);
        let err = codec.decode(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn decode_replaces_invalid_utf8() {
        let mut codec = LineCodec::new();
        let mut buf = BytesMut::from(&b"ab\xffcd\n"[..]);
        assert_eq!(
            codec.decode(&mut buf).unwrap().as_deref(),
            Some("ab\u{fffd}cd")
        );
    }
}
