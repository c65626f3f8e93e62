use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{RallyError, Result};
use crate::protocol::header::{FLAG_PRESENT, FLAG_SEQUENCE, FrameKind, HEADER_SIZE, Header};
use crate::types::{Failure, MAX_SERIES_LEN, OperationKind, Outcome, Rank, SeriesKey};

/// Frames exchanged between a worker and the chief.
///
/// Payloads are opaque byte strings; nothing in this enum looks inside them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RallyMessage {
    /// First frame a worker sends after connecting.
    Register { rank: Rank, size: u32 },

    /// Chief accepted the registration.
    Accept { rank: Rank, size: u32 },

    /// Chief refused the registration; the connection closes afterwards.
    Reject { failure: Failure },

    /// One rank's contribution to a collective.
    Submit {
        key: SeriesKey,
        /// Collector (gather) or source (broadcast) rank. Ignored by allgather.
        root: Rank,
        payload: Option<Bytes>,
    },

    /// Per-rank result of a completed collective.
    Deliver { key: SeriesKey, outcome: Outcome },

    /// The collective for `key` will never complete for this rank.
    Fail { key: SeriesKey, failure: Failure },

    /// Graceful departure.
    Shutdown,

    /// Liveness ping; carries nothing.
    Keepalive,
}

impl RallyMessage {
    pub fn name(&self) -> &'static str {
        match self {
            RallyMessage::Register { .. } => "REGISTER",
            RallyMessage::Accept { .. } => "ACCEPT",
            RallyMessage::Reject { .. } => "REJECT",
            RallyMessage::Submit { .. } => "SUBMIT",
            RallyMessage::Deliver { .. } => "DELIVER",
            RallyMessage::Fail { .. } => "FAIL",
            RallyMessage::Shutdown => "SHUTDOWN",
            RallyMessage::Keepalive => "KEEPALIVE",
        }
    }

    /// The series this frame refers to, if any.
    pub fn key(&self) -> Option<&SeriesKey> {
        match self {
            RallyMessage::Submit { key, .. }
            | RallyMessage::Deliver { key, .. }
            | RallyMessage::Fail { key, .. } => Some(key),
            _ => None,
        }
    }

    /// Append `[header][series][body]` to `dst`.
    ///
    /// `max_body` bounds the body length; the series label is bounded by
    /// [`MAX_SERIES_LEN`].
    pub fn encode(&self, max_body: usize, dst: &mut BytesMut) -> Result<()> {
        let mut header = Header::new(self.frame_kind());
        let series: &[u8] = match self.key() {
            Some(key) => {
                header.op = key.kind as u8;
                key.series.as_bytes()
            }
            None => &[],
        };
        if series.len() > MAX_SERIES_LEN {
            return Err(RallyError::SeriesTooLong {
                len: series.len(),
                max: MAX_SERIES_LEN,
            });
        }
        header.series_len = series.len() as u16;

        let body_len = self.body_len();
        if body_len > max_body || body_len > u32::MAX as usize {
            return Err(RallyError::PayloadTooLarge {
                len: body_len,
                max: max_body.min(u32::MAX as usize),
            });
        }
        header.body_len = body_len as u32;

        match self {
            RallyMessage::Register { rank, size } | RallyMessage::Accept { rank, size } => {
                header.arg0 = *rank;
                header.arg1 = *size;
            }
            RallyMessage::Reject { failure } | RallyMessage::Fail { failure, .. } => {
                header.arg0 = failure.code();
                header.arg1 = failure.arg();
            }
            RallyMessage::Submit { root, payload, .. } => {
                header.arg0 = *root;
                if payload.is_some() {
                    header.flags |= FLAG_PRESENT;
                }
            }
            RallyMessage::Deliver { outcome, .. } => match outcome {
                Outcome::Absent => {}
                Outcome::Value(_) => {
                    header.flags |= FLAG_PRESENT;
                    header.arg0 = 1;
                }
                Outcome::Values(values) => {
                    header.flags |= FLAG_PRESENT | FLAG_SEQUENCE;
                    header.arg0 = u32::try_from(values.len()).map_err(|_| {
                        RallyError::EncodeFailed(format!("{} entries overflow u32", values.len()))
                    })?;
                }
            },
            RallyMessage::Shutdown | RallyMessage::Keepalive => {}
        }

        dst.reserve(HEADER_SIZE + series.len() + body_len);
        dst.put_slice(&header.encode());
        dst.put_slice(series);
        match self {
            RallyMessage::Reject { failure } | RallyMessage::Fail { failure, .. } => {
                dst.put_slice(failure.reason().as_bytes());
            }
            RallyMessage::Submit {
                payload: Some(p), ..
            } => dst.put_slice(p),
            RallyMessage::Deliver { outcome, .. } => match outcome {
                Outcome::Absent => {}
                Outcome::Value(v) => dst.put_slice(v),
                Outcome::Values(values) => {
                    for v in values {
                        // entry lengths are bounded by body_len, checked above
                        dst.put_u32_le(v.len() as u32);
                        dst.put_slice(v);
                    }
                }
            },
            _ => {}
        }
        Ok(())
    }

    /// Rebuild a message from a decoded header and its variable sections.
    pub fn decode(header: &Header, series: Bytes, body: Bytes) -> Result<Self> {
        match header.frame {
            FrameKind::Register | FrameKind::Accept | FrameKind::Shutdown | FrameKind::Keepalive => {
                expect_bare(header, &series, &body)?;
                Ok(match header.frame {
                    FrameKind::Register => RallyMessage::Register {
                        rank: header.arg0,
                        size: header.arg1,
                    },
                    FrameKind::Accept => RallyMessage::Accept {
                        rank: header.arg0,
                        size: header.arg1,
                    },
                    FrameKind::Shutdown => RallyMessage::Shutdown,
                    _ => RallyMessage::Keepalive,
                })
            }
            FrameKind::Reject => {
                if header.op != 0 || header.flags != 0 || !series.is_empty() {
                    return Err(malformed(header, "unexpected op kind, flags or series"));
                }
                Ok(RallyMessage::Reject {
                    failure: decode_failure(header, body)?,
                })
            }
            FrameKind::Submit => {
                let key = decode_key(header, series)?;
                if header.has_flag(FLAG_SEQUENCE) {
                    return Err(malformed(header, "SEQUENCE flag is not valid on SUBMIT"));
                }
                let payload = if header.has_flag(FLAG_PRESENT) {
                    Some(body)
                } else if body.is_empty() {
                    None
                } else {
                    return Err(malformed(header, "body without PRESENT flag"));
                };
                Ok(RallyMessage::Submit {
                    key,
                    root: header.arg0,
                    payload,
                })
            }
            FrameKind::Deliver => {
                let key = decode_key(header, series)?;
                let outcome = match (header.has_flag(FLAG_PRESENT), header.has_flag(FLAG_SEQUENCE))
                {
                    (false, false) if body.is_empty() && header.arg0 == 0 => Outcome::Absent,
                    (false, false) => {
                        return Err(malformed(header, "absent result with a body or count"));
                    }
                    (false, true) => return Err(malformed(header, "SEQUENCE without PRESENT")),
                    (true, false) if header.arg0 == 1 => Outcome::Value(body),
                    (true, false) => {
                        return Err(malformed(header, "single result must have count 1"));
                    }
                    (true, true) => Outcome::Values(decode_sequence(header, body)?),
                };
                Ok(RallyMessage::Deliver { key, outcome })
            }
            FrameKind::Fail => {
                let key = decode_key(header, series)?;
                if header.flags != 0 {
                    return Err(malformed(header, "FAIL carries no flags"));
                }
                Ok(RallyMessage::Fail {
                    key,
                    failure: decode_failure(header, body)?,
                })
            }
        }
    }

    fn frame_kind(&self) -> FrameKind {
        match self {
            RallyMessage::Register { .. } => FrameKind::Register,
            RallyMessage::Accept { .. } => FrameKind::Accept,
            RallyMessage::Reject { .. } => FrameKind::Reject,
            RallyMessage::Submit { .. } => FrameKind::Submit,
            RallyMessage::Deliver { .. } => FrameKind::Deliver,
            RallyMessage::Fail { .. } => FrameKind::Fail,
            RallyMessage::Shutdown => FrameKind::Shutdown,
            RallyMessage::Keepalive => FrameKind::Keepalive,
        }
    }

    /// Encoded body length, the part bounded by `max_frame_bytes`.
    pub fn body_len(&self) -> usize {
        match self {
            RallyMessage::Reject { failure } | RallyMessage::Fail { failure, .. } => {
                failure.reason().len()
            }
            RallyMessage::Submit { payload, .. } => payload.as_ref().map_or(0, Bytes::len),
            RallyMessage::Deliver { outcome, .. } => match outcome {
                Outcome::Absent => 0,
                Outcome::Value(v) => v.len(),
                Outcome::Values(values) => values.iter().map(|v| 4 + v.len()).sum(),
            },
            _ => 0,
        }
    }
}

fn malformed(header: &Header, what: &str) -> RallyError {
    RallyError::DecodeFailed(format!("malformed {:?} frame: {what}", header.frame))
}

fn expect_bare(header: &Header, series: &Bytes, body: &Bytes) -> Result<()> {
    if header.op != 0 || header.flags != 0 || !series.is_empty() || !body.is_empty() {
        return Err(malformed(header, "frame carries no op kind, flags, series or body"));
    }
    Ok(())
}

fn decode_key(header: &Header, series: Bytes) -> Result<SeriesKey> {
    let kind = OperationKind::from_u8(header.op)
        .ok_or_else(|| malformed(header, &format!("unknown op kind {}", header.op)))?;
    if series.len() > MAX_SERIES_LEN {
        return Err(RallyError::SeriesTooLong {
            len: series.len(),
            max: MAX_SERIES_LEN,
        });
    }
    let series = String::from_utf8(series.to_vec())
        .map_err(|e| malformed(header, &format!("series label is not UTF-8: {e}")))?;
    Ok(SeriesKey { kind, series })
}

fn decode_failure(header: &Header, body: Bytes) -> Result<Failure> {
    let reason = String::from_utf8(body.to_vec())
        .map_err(|e| malformed(header, &format!("reason is not UTF-8: {e}")))?;
    Failure::from_parts(header.arg0, header.arg1, reason)
        .ok_or_else(|| malformed(header, &format!("unknown failure code {}", header.arg0)))
}

fn decode_sequence(header: &Header, mut body: Bytes) -> Result<Vec<Bytes>> {
    let count = header.arg0 as usize;
    // every entry needs at least its 4-byte length prefix
    if count > body.len() / 4 {
        return Err(malformed(header, &format!("{count} entries cannot fit in {} bytes", body.len())));
    }
    let mut values = Vec::with_capacity(count);
    for i in 0..count {
        if body.remaining() < 4 {
            return Err(malformed(header, &format!("entry {i} length prefix truncated")));
        }
        let len = body.get_u32_le() as usize;
        if body.remaining() < len {
            return Err(malformed(header, &format!("entry {i} is truncated")));
        }
        values.push(body.split_to(len));
    }
    if body.has_remaining() {
        return Err(malformed(
            header,
            &format!("{} trailing bytes after {count} entries", body.remaining()),
        ));
    }
    Ok(values)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn split(buf: &BytesMut) -> (Header, Bytes, Bytes) {
        let header_bytes: [u8; HEADER_SIZE] = buf[..HEADER_SIZE].try_into().unwrap();
        let header = Header::decode(&header_bytes).unwrap();
        let series_end = HEADER_SIZE + header.series_len as usize;
        let series = Bytes::copy_from_slice(&buf[HEADER_SIZE..series_end]);
        let body = Bytes::copy_from_slice(&buf[series_end..]);
        (header, series, body)
    }

    fn roundtrip(msg: &RallyMessage) -> RallyMessage {
        let mut buf = BytesMut::new();
        msg.encode(usize::MAX, &mut buf).unwrap();
        let (header, series, body) = split(&buf);
        RallyMessage::decode(&header, series, body).unwrap()
    }

    #[test]
    fn test_register_layout() {
        let mut buf = BytesMut::new();
        RallyMessage::Register { rank: 2, size: 3 }
            .encode(usize::MAX, &mut buf)
            .unwrap();
        assert_eq!(buf.len(), HEADER_SIZE);
        let (header, _, _) = split(&buf);
        assert_eq!(header.frame, FrameKind::Register);
        assert_eq!(header.arg0, 2);
        assert_eq!(header.arg1, 3);
    }

    #[test]
    fn test_submit_absent_payload_is_not_empty_payload() {
        let key = SeriesKey::new(OperationKind::Broadcast, "w");
        let absent = RallyMessage::Submit {
            key: key.clone(),
            root: 0,
            payload: None,
        };
        let empty = RallyMessage::Submit {
            key,
            root: 0,
            payload: Some(Bytes::new()),
        };
        assert_eq!(roundtrip(&absent), absent);
        assert_eq!(roundtrip(&empty), empty);
    }

    #[test]
    fn test_deliver_sequence_with_empty_entries() {
        let msg = RallyMessage::Deliver {
            key: SeriesKey::new(OperationKind::AllGather, "ids"),
            outcome: Outcome::Values(vec![
                Bytes::from_static(b"zero"),
                Bytes::new(),
                Bytes::from_static(b"two"),
            ]),
        };
        assert_eq!(roundtrip(&msg), msg);
    }

    #[test]
    fn test_fail_carries_reason_and_arg() {
        let msg = RallyMessage::Fail {
            key: SeriesKey::new(OperationKind::Gather, "g"),
            failure: Failure::Protocol {
                reason: "root mismatch".into(),
            },
        };
        assert_eq!(roundtrip(&msg), msg);

        let msg = RallyMessage::Reject {
            failure: Failure::GroupMismatch { expected: 4 },
        };
        assert_eq!(roundtrip(&msg), msg);
    }

    #[test]
    fn test_series_too_long_rejected_on_encode() {
        let msg = RallyMessage::Submit {
            key: SeriesKey::new(OperationKind::Gather, "x".repeat(MAX_SERIES_LEN + 1)),
            root: 0,
            payload: Some(Bytes::from_static(b"p")),
        };
        let err = msg.encode(usize::MAX, &mut BytesMut::new()).unwrap_err();
        assert!(matches!(err, RallyError::SeriesTooLong { len: 257, max: 256 }));
    }

    #[test]
    fn test_body_limit_on_encode() {
        let msg = RallyMessage::Submit {
            key: SeriesKey::new(OperationKind::Gather, "x"),
            root: 0,
            payload: Some(Bytes::from(vec![0u8; 64])),
        };
        let err = msg.encode(63, &mut BytesMut::new()).unwrap_err();
        assert!(matches!(err, RallyError::PayloadTooLarge { len: 64, max: 63 }));
    }

    #[test]
    fn test_sequence_count_mismatch() {
        let mut buf = BytesMut::new();
        RallyMessage::Deliver {
            key: SeriesKey::new(OperationKind::AllGather, "s"),
            outcome: Outcome::Values(vec![Bytes::from_static(b"a"), Bytes::from_static(b"b")]),
        }
        .encode(usize::MAX, &mut buf)
        .unwrap();
        let (mut header, series, body) = split(&buf);
        header.arg0 = 3;
        assert!(RallyMessage::decode(&header, series.clone(), body.clone()).is_err());
        header.arg0 = 1;
        let err = RallyMessage::decode(&header, series, body).unwrap_err();
        assert!(err.to_string().contains("trailing"), "got: {err}");
    }

    #[test]
    fn test_unknown_op_kind() {
        let mut buf = BytesMut::new();
        RallyMessage::Submit {
            key: SeriesKey::new(OperationKind::Gather, "s"),
            root: 0,
            payload: Some(Bytes::from_static(b"p")),
        }
        .encode(usize::MAX, &mut buf)
        .unwrap();
        let (mut header, series, body) = split(&buf);
        header.op = 7;
        assert!(RallyMessage::decode(&header, series, body).is_err());
    }

    #[test]
    fn test_invalid_utf8_series() {
        let mut header = Header::new(FrameKind::Submit);
        header.flags = FLAG_PRESENT;
        header.series_len = 2;
        let err = RallyMessage::decode(&header, Bytes::from_static(&[0xff, 0xfe]), Bytes::new())
            .unwrap_err();
        assert!(err.to_string().contains("UTF-8"), "got: {err}");
    }

    #[test]
    fn test_bare_frames_reject_extras() {
        let mut header = Header::new(FrameKind::Shutdown);
        assert_eq!(
            RallyMessage::decode(&header, Bytes::new(), Bytes::new()).unwrap(),
            RallyMessage::Shutdown
        );
        header.body_len = 1;
        assert!(RallyMessage::decode(&header, Bytes::new(), Bytes::from_static(b"x")).is_err());
        header = Header::new(FrameKind::Keepalive);
        header.op = 1;
        assert!(RallyMessage::decode(&header, Bytes::new(), Bytes::new()).is_err());
    }

    #[test]
    fn test_sequence_without_present() {
        let mut header = Header::new(FrameKind::Deliver);
        header.flags = FLAG_SEQUENCE;
        assert!(RallyMessage::decode(&header, Bytes::new(), Bytes::new()).is_err());
    }

    #[test]
    fn test_unknown_failure_code() {
        let mut header = Header::new(FrameKind::Reject);
        header.arg0 = 42;
        assert!(RallyMessage::decode(&header, Bytes::new(), Bytes::new()).is_err());
    }
}
