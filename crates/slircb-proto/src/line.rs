//! Line framing for tokio.
//!
//! Decodes newline-terminated lines (CRLF on the wire, bare LF accepted) and
//! encodes outgoing lines with CRLF appended. Decoded lines come back with
//! the terminator stripped.

use bytes::{BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::ProtocolError;

/// Hard cap on a single unterminated line. The protocol's 512-byte limit is
/// advisory; this bound only exists so a peer cannot grow the buffer forever.
const FLOOD_BOUND: usize = 8192;

/// Codec turning a byte stream into IRC lines and back.
#[derive(Debug, Default)]
pub struct LineCodec {
    /// Index of the next byte to check for a newline.
    next_index: usize,
}

impl LineCodec {
    pub fn new() -> LineCodec {
        LineCodec::default()
    }
}

impl Decoder for LineCodec {
    type Item = String;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<String>, ProtocolError> {
        if let Some(offset) = src[self.next_index..].iter().position(|b| *b == b'\n') {
            let line = src.split_to(self.next_index + offset + 1);
            self.next_index = 0;

            // IRC has no standard encoding; decode lossily rather than drop
            // lines from peers sending latin-1 or mixed bytes.
            let text = String::from_utf8_lossy(&line);
            let text = text.trim_end_matches(['\r', '\n']);

            Ok(Some(text.to_owned()))
        } else {
            self.next_index = src.len();

            if src.len() > FLOOD_BOUND {
                return Err(ProtocolError::LineTooLong {
                    actual: src.len(),
                    limit: FLOOD_BOUND,
                });
            }

            Ok(None)
        }
    }
}

impl Encoder<String> for LineCodec {
    type Error = ProtocolError;

    fn encode(&mut self, line: String, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        dst.reserve(line.len() + 2);
        dst.put_slice(line.as_bytes());
        dst.put_slice(b"\r\n");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_complete_line() {
        let mut codec = LineCodec::new();
        let mut buf = BytesMut::from("PING :test\r\n");

        let line = codec.decode(&mut buf).unwrap();
        assert_eq!(line.as_deref(), Some("PING :test"));
        assert!(buf.is_empty());
    }

    #[test]
    fn decode_accepts_bare_lf() {
        let mut codec = LineCodec::new();
        let mut buf = BytesMut::from("NICK alice\n");

        let line = codec.decode(&mut buf).unwrap();
        assert_eq!(line.as_deref(), Some("NICK alice"));
    }

    #[test]
    fn decode_partial_line() {
        let mut codec = LineCodec::new();
        let mut buf = BytesMut::from("PING :te");

        assert_eq!(codec.decode(&mut buf).unwrap(), None);

        buf.extend_from_slice(b"st\r\n");
        let line = codec.decode(&mut buf).unwrap();
        assert_eq!(line.as_deref(), Some("PING :test"));
    }

    #[test]
    fn decode_multiple_lines() {
        let mut codec = LineCodec::new();
        let mut buf = BytesMut::from("A\r\nB\r\n");

        assert_eq!(codec.decode(&mut buf).unwrap().as_deref(), Some("A"));
        assert_eq!(codec.decode(&mut buf).unwrap().as_deref(), Some("B"));
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
    }

    #[test]
    fn decode_flood_bound() {
        let mut codec = LineCodec::new();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&vec![b'a'; FLOOD_BOUND + 1]);

        assert!(matches!(
            codec.decode(&mut buf),
            Err(ProtocolError::LineTooLong { .. })
        ));
    }

    #[test]
    fn encode_appends_crlf() {
        let mut codec = LineCodec::new();
        let mut buf = BytesMut::new();

        codec.encode("PONG :test".to_string(), &mut buf).unwrap();
        assert_eq!(&buf[..], b"PONG :test\r\n");
    }
}
