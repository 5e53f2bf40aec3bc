//! Status frame codec
//!
//! The detector writes bare JSON objects with no delimiter and may glue
//! several together or split one across reads. Decoding walks the buffer
//! value by value instead of parsing it as a whole, so framing no longer
//! depends on how TCP segments the stream. Outbound frames are one JSON
//! document per line.

use crate::models::StatusFrame;
use bytes::{Buf, BufMut, BytesMut};
use serde_json::Value;
use std::io;
use tokio_util::codec::{Decoder, Encoder};
use tracing::{debug, warn};

pub struct StatusCodec {
    max_frame_bytes: usize,
}

impl StatusCodec {
    pub fn new(max_frame_bytes: usize) -> Self {
        Self { max_frame_bytes: max_frame_bytes.max(64) }
    }

    /// Drop a bad prefix up to the next newline, or everything without one
    fn discard_garbage(src: &mut BytesMut) {
        match src.iter().position(|b| *b == b'\n') {
            Some(idx) => src.advance(idx + 1),
            None => src.clear(),
        }
    }
}

impl Decoder for StatusCodec {
    type Item = StatusFrame;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            let mut values = serde_json::Deserializer::from_slice(&src[..]).into_iter::<Value>();

            match values.next() {
                None => {
                    // Only whitespace left
                    src.clear();
                    return Ok(None);
                }
                Some(Ok(value)) => {
                    let consumed = values.byte_offset();
                    src.advance(consumed);

                    match serde_json::from_value::<StatusFrame>(value) {
                        Ok(frame) => return Ok(Some(frame)),
                        Err(_) => {
                            debug!("Ignoring non-status message from detector");
                            continue;
                        }
                    }
                }
                Some(Err(e)) if e.is_eof() => {
                    if src.len() > self.max_frame_bytes {
                        warn!(
                            "Discarding {} buffered bytes without a complete frame",
                            src.len()
                        );
                        src.clear();
                    }
                    return Ok(None);
                }
                Some(Err(e)) => {
                    warn!("Discarding malformed data from detector: {}", e);
                    Self::discard_garbage(src);
                }
            }
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(buf)? {
            Some(frame) => Ok(Some(frame)),
            None => {
                if !buf.is_empty() {
                    debug!("Dropping {} trailing bytes at end of stream", buf.len());
                    buf.clear();
                }
                Ok(None)
            }
        }
    }
}

impl Encoder<StatusFrame> for StatusCodec {
    type Error = io::Error;

    fn encode(&mut self, item: StatusFrame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let payload = serde_json::to_vec(&item)?;
        dst.reserve(payload.len() + 1);
        dst.put_slice(&payload);
        dst.put_u8(b'\n');
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(status: &str) -> StatusFrame {
        StatusFrame { status: status.to_string() }
    }

    fn decode_all(codec: &mut StatusCodec, buf: &mut BytesMut) -> Vec<StatusFrame> {
        let mut out = Vec::new();
        while let Some(f) = codec.decode(buf).unwrap() {
            out.push(f);
        }
        out
    }

    #[test]
    fn test_single_unterminated_frame() {
        let mut codec = StatusCodec::new(4096);
        let mut buf = BytesMut::from(&br#"{"status":"off"}"#[..]);
        assert_eq!(decode_all(&mut codec, &mut buf), vec![frame("off")]);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_frame_split_across_reads() {
        let mut codec = StatusCodec::new(4096);
        let mut buf = BytesMut::from(&br#"{"stat"#[..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), 6, "partial frame must stay buffered");

        buf.extend_from_slice(br#"us":"OFF"}"#);
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(frame("OFF")));
    }

    #[test]
    fn test_concatenated_frames_are_all_delivered() {
        let mut codec = StatusCodec::new(4096);
        let mut buf = BytesMut::from(&br#"{"status":"off"}{"status":"on"} {"status":"off"}"#[..]);
        assert_eq!(
            decode_all(&mut codec, &mut buf),
            vec![frame("off"), frame("on"), frame("off")]
        );
    }

    #[test]
    fn test_newline_delimited_frames() {
        let mut codec = StatusCodec::new(4096);
        let mut buf = BytesMut::from(&b"{\"status\":\"on\"}\r\n{\"status\":\"off\"}\n"[..]);
        assert_eq!(decode_all(&mut codec, &mut buf), vec![frame("on"), frame("off")]);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_garbage_line_is_skipped() {
        let mut codec = StatusCodec::new(4096);
        let mut buf = BytesMut::from(&b"@@noise@@\n{\"status\":\"off\"}"[..]);
        assert_eq!(decode_all(&mut codec, &mut buf), vec![frame("off")]);
    }

    #[test]
    fn test_non_status_messages_are_ignored() {
        let mut codec = StatusCodec::new(4096);
        let mut buf = BytesMut::from(&br#"{"message":"success"}{"status":"on"}"#[..]);
        assert_eq!(decode_all(&mut codec, &mut buf), vec![frame("on")]);
    }

    #[test]
    fn test_oversized_partial_frame_is_dropped() {
        let mut codec = StatusCodec::new(64);
        let mut buf = BytesMut::from(&b"{\"status\":\""[..]);
        buf.extend_from_slice(&[b'x'; 100]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_eof_drops_partial_tail() {
        let mut codec = StatusCodec::new(4096);
        let mut buf = BytesMut::from(&br#"{"status":"o"#[..]);
        assert!(codec.decode_eof(&mut buf).unwrap().is_none());
        assert!(buf.is_empty());
    }

    #[test]
    fn test_encode_appends_newline() {
        let mut codec = StatusCodec::new(4096);
        let mut dst = BytesMut::new();
        codec.encode(frame("off"), &mut dst).unwrap();
        assert_eq!(&dst[..], b"{\"status\":\"off\"}\n");
    }
}
