//! Streaming frame codec for the rendezvous protocol.
//!
//! Wire format: `[20-byte header][series label][body]`. The decoder keeps
//! state across calls so a frame may arrive in arbitrarily small pieces; the
//! series label and body come out as zero-copy slices of the receive buffer.

use bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::config::DEFAULT_MAX_FRAME_BYTES;
use crate::error::{RallyError, Result};
use crate::protocol::header::{HEADER_SIZE, Header};
use crate::protocol::message::RallyMessage;
use crate::types::MAX_SERIES_LEN;

#[derive(Debug, Clone, Copy)]
enum DecodeState {
    /// Waiting for the fixed-size header.
    AwaitingHeader,
    /// Header parsed; waiting for the series label and body.
    AwaitingData(Header),
}

/// `Decoder`/`Encoder` pair for [`RallyMessage`] frames.
#[derive(Debug, Clone)]
pub struct RallyCodec {
    max_frame_bytes: usize,
    state: DecodeState,
}

impl RallyCodec {
    /// A codec that refuses bodies larger than `max_frame_bytes`.
    pub fn new(max_frame_bytes: usize) -> Self {
        Self {
            max_frame_bytes,
            state: DecodeState::AwaitingHeader,
        }
    }

    fn validate_lengths(&self, header: &Header) -> Result<()> {
        if header.series_len as usize > MAX_SERIES_LEN {
            return Err(RallyError::DecodeFailed(format!(
                "series label length {} exceeds maximum {MAX_SERIES_LEN}",
                header.series_len
            )));
        }
        if header.body_len as usize > self.max_frame_bytes {
            return Err(RallyError::DecodeFailed(format!(
                "frame body {} exceeds maximum {}",
                header.body_len, self.max_frame_bytes
            )));
        }
        Ok(())
    }
}

impl Default for RallyCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_BYTES)
    }
}

impl Decoder for RallyCodec {
    type Item = RallyMessage;
    type Error = RallyError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        loop {
            match self.state {
                DecodeState::AwaitingHeader => {
                    if src.len() < HEADER_SIZE {
                        return Ok(None);
                    }
                    let mut raw = [0u8; HEADER_SIZE];
                    raw.copy_from_slice(&src[..HEADER_SIZE]);
                    let header = Header::decode(&raw)?;
                    // Validate lengths before waiting on (or reserving for) the data.
                    self.validate_lengths(&header)?;
                    src.advance(HEADER_SIZE);
                    src.reserve(header.variable_len());
                    self.state = DecodeState::AwaitingData(header);
                }
                DecodeState::AwaitingData(header) => {
                    if src.len() < header.variable_len() {
                        return Ok(None);
                    }
                    let series = src.split_to(header.series_len as usize).freeze();
                    let body = src.split_to(header.body_len as usize).freeze();
                    self.state = DecodeState::AwaitingHeader;
                    return RallyMessage::decode(&header, series, body).map(Some);
                }
            }
        }
    }
}

impl Encoder<RallyMessage> for RallyCodec {
    type Error = RallyError;

    fn encode(&mut self, item: RallyMessage, dst: &mut BytesMut) -> Result<()> {
        item.encode(self.max_frame_bytes, dst)
    }
}

/// Encode a single message into a standalone buffer.
pub fn encode_message(msg: &RallyMessage, max_frame_bytes: usize) -> Result<BytesMut> {
    let mut buf = BytesMut::new();
    msg.encode(max_frame_bytes, &mut buf)?;
    Ok(buf)
}

/// Decode exactly one complete frame from `buf`.
pub fn decode_message(buf: &[u8], max_frame_bytes: usize) -> Result<RallyMessage> {
    let mut codec = RallyCodec::new(max_frame_bytes);
    let mut src = BytesMut::from(buf);
    let msg = codec
        .decode(&mut src)?
        .ok_or_else(|| RallyError::DecodeFailed(format!("buffer too short: {} bytes", buf.len())))?;
    if !src.is_empty() {
        return Err(RallyError::DecodeFailed(format!(
            "{} trailing bytes after frame",
            src.len()
        )));
    }
    Ok(msg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{OperationKind, Outcome, SeriesKey};
    use bytes::Bytes;

    fn submit(series: &str, payload: &'static [u8]) -> RallyMessage {
        RallyMessage::Submit {
            key: SeriesKey::new(OperationKind::Gather, series),
            root: 0,
            payload: Some(Bytes::from_static(payload)),
        }
    }

    #[test]
    fn test_decode_byte_by_byte() {
        let msg = submit("weights", b"hello world");
        let encoded = encode_message(&msg, usize::MAX).unwrap();

        let mut codec = RallyCodec::default();
        let mut src = BytesMut::new();
        let mut decoded = None;
        for (i, b) in encoded.iter().enumerate() {
            src.extend_from_slice(&[*b]);
            let out = codec.decode(&mut src).unwrap();
            if i + 1 < encoded.len() {
                assert!(out.is_none(), "frame complete early at byte {i}");
            } else {
                decoded = out;
            }
        }
        assert_eq!(decoded, Some(msg));
    }

    #[test]
    fn test_decode_back_to_back_frames() {
        let mut codec = RallyCodec::default();
        let mut src = BytesMut::new();
        codec.encode(submit("a", b"1"), &mut src).unwrap();
        codec.encode(RallyMessage::Keepalive, &mut src).unwrap();
        codec
            .encode(
                RallyMessage::Deliver {
                    key: SeriesKey::new(OperationKind::Broadcast, "b"),
                    outcome: Outcome::Value(Bytes::from_static(b"v")),
                },
                &mut src,
            )
            .unwrap();

        assert_eq!(codec.decode(&mut src).unwrap(), Some(submit("a", b"1")));
        assert_eq!(codec.decode(&mut src).unwrap(), Some(RallyMessage::Keepalive));
        assert!(matches!(
            codec.decode(&mut src).unwrap(),
            Some(RallyMessage::Deliver { .. })
        ));
        assert_eq!(codec.decode(&mut src).unwrap(), None);
        assert!(src.is_empty());
    }

    #[test]
    fn test_oversize_body_rejected_before_data_arrives() {
        let encoded = encode_message(&submit("a", &[0u8; 128]), usize::MAX).unwrap();
        let mut codec = RallyCodec::new(64);
        // only the header is available; the limit must trip already
        let mut src = BytesMut::from(&encoded[..HEADER_SIZE]);
        let err = codec.decode(&mut src).unwrap_err();
        assert!(err.to_string().contains("exceeds maximum"), "got: {err}");
    }

    #[test]
    fn test_oversize_series_rejected() {
        let mut header = Header::new(crate::protocol::header::FrameKind::Submit);
        header.series_len = (MAX_SERIES_LEN + 1) as u16;
        let mut src = BytesMut::from(&header.encode()[..]);
        assert!(RallyCodec::default().decode(&mut src).is_err());
    }

    #[test]
    fn test_decode_message_helpers() {
        let buf = encode_message(&RallyMessage::Shutdown, 0).unwrap();
        assert_eq!(decode_message(&buf, 0).unwrap(), RallyMessage::Shutdown);

        let err = decode_message(&buf[..4], 0).unwrap_err();
        assert!(err.to_string().contains("too short"), "got: {err}");

        let mut doubled = buf.clone();
        doubled.extend_from_slice(&buf);
        assert!(decode_message(&doubled, 0).is_err());
    }

    #[test]
    fn test_garbage_header() {
        let mut src = BytesMut::from(&[0xAAu8; HEADER_SIZE][..]);
        assert!(RallyCodec::default().decode(&mut src).is_err());
    }
}
