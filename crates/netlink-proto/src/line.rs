//! Newline-delimited line codec for the S2S transport.

use bytes::{BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::ProtoError;

/// Codec reading and writing `\r\n`-terminated lines.
///
/// Inbound lines are decoded as UTF-8; when `lossy` is set, undecodable
/// bytes are replaced instead of failing the link (some ircds relay
/// legacy-encoded text verbatim). Outbound lines get `\r\n` appended.
pub struct LineCodec {
    /// Index of the next byte to scan for a newline.
    next_index: usize,
    max_len: usize,
    lossy: bool,
}

impl LineCodec {
    pub fn new(lossy: bool) -> Self {
        Self { next_index: 0, max_len: 512, lossy }
    }

    pub fn with_max_len(lossy: bool, max_len: usize) -> Self {
        Self { next_index: 0, max_len, lossy }
    }
}

impl Decoder for LineCodec {
    type Item = String;
    type Error = ProtoError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<String>, ProtoError> {
        if let Some(offset) = src[self.next_index..].iter().position(|b| *b == b'\n') {
            let line = src.split_to(self.next_index + offset + 1);
            self.next_index = 0;

            if line.len() > self.max_len {
                return Err(ProtoError::LineTooLong {
                    actual: line.len(),
                    limit: self.max_len,
                });
            }

            let text = if self.lossy {
                String::from_utf8_lossy(&line).into_owned()
            } else {
                String::from_utf8(line.to_vec())
                    .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?
            };

            Ok(Some(text.trim_end_matches(['\r', '\n']).to_string()))
        } else {
            self.next_index = src.len();

            if src.len() > self.max_len {
                return Err(ProtoError::LineTooLong {
                    actual: src.len(),
                    limit: self.max_len,
                });
            }

            Ok(None)
        }
    }
}

impl Encoder<String> for LineCodec {
    type Error = ProtoError;

    fn encode(&mut self, msg: String, dst: &mut BytesMut) -> Result<(), ProtoError> {
        dst.reserve(msg.len() + 2);
        dst.put(msg.as_bytes());
        dst.put_slice(b"\r\n");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_complete_line() {
        let mut codec = LineCodec::new(false);
        let mut buf = BytesMut::from("PING :test\r\n");
        assert_eq!(codec.decode(&mut buf).unwrap(), Some("PING :test".to_string()));
        assert!(buf.is_empty());
    }

    #[test]
    fn waits_for_partial_line() {
        let mut codec = LineCodec::new(false);
        let mut buf = BytesMut::from("PING :te");
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        buf.extend_from_slice(b"st\n");
        assert_eq!(codec.decode(&mut buf).unwrap(), Some("PING :test".to_string()));
    }

    #[test]
    fn rejects_oversized_line() {
        let mut codec = LineCodec::with_max_len(false, 10);
        let mut buf = BytesMut::from("this line is much too long\n");
        assert!(matches!(
            codec.decode(&mut buf),
            Err(ProtoError::LineTooLong { .. })
        ));
    }

    #[test]
    fn lossy_mode_replaces_bad_bytes() {
        let mut codec = LineCodec::new(true);
        let mut buf = BytesMut::from(&b"NOTICE #x :caf\xe9\r\n"[..]);
        let line = codec.decode(&mut buf).unwrap().unwrap();
        assert!(line.starts_with("NOTICE #x :caf"));
    }

    #[test]
    fn strict_mode_errors_on_bad_bytes() {
        let mut codec = LineCodec::new(false);
        let mut buf = BytesMut::from(&b"NOTICE #x :caf\xe9\r\n"[..]);
        assert!(codec.decode(&mut buf).is_err());
    }

    #[test]
    fn encodes_with_crlf() {
        let mut codec = LineCodec::new(false);
        let mut buf = BytesMut::new();
        codec.encode("PONG :test".to_string(), &mut buf).unwrap();
        assert_eq!(&buf[..], b"PONG :test\r\n");
    }
}
