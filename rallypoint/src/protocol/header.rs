use crate::error::{RallyError, Result};
use crate::types::PROTOCOL_VERSION;

/// Size of the wire header in bytes.
pub const HEADER_SIZE: usize = 20;

/// The frame carries a payload (SUBMIT) or a result (DELIVER).
pub const FLAG_PRESENT: u8 = 0b0000_0001;
/// The DELIVER body is a sequence of length-prefixed entries.
pub const FLAG_SEQUENCE: u8 = 0b0000_0010;

const KNOWN_FLAGS: u8 = FLAG_PRESENT | FLAG_SEQUENCE;

/// Type tag for the frame that follows the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameKind {
    Register = 1,
    Accept = 2,
    Reject = 3,
    Submit = 4,
    Deliver = 5,
    Fail = 6,
    Shutdown = 7,
    Keepalive = 8,
}

impl FrameKind {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(FrameKind::Register),
            2 => Some(FrameKind::Accept),
            3 => Some(FrameKind::Reject),
            4 => Some(FrameKind::Submit),
            5 => Some(FrameKind::Deliver),
            6 => Some(FrameKind::Fail),
            7 => Some(FrameKind::Shutdown),
            8 => Some(FrameKind::Keepalive),
            _ => None,
        }
    }
}

/// 20-byte wire header prepended to every frame.
///
/// ```text
/// [0]      version: u8
/// [1]      frame kind: u8
/// [2]      op kind: u8
/// [3]      flags: u8
/// [4..8]   arg0: u32 LE
/// [8..12]  arg1: u32 LE
/// [12..14] series_len: u16 LE
/// [14..16] reserved: u16 (must be 0)
/// [16..20] body_len: u32 LE
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub frame: FrameKind,
    /// Raw operation kind byte; interpreted per frame kind.
    pub op: u8,
    pub flags: u8,
    pub arg0: u32,
    pub arg1: u32,
    /// Length of the series label following the header.
    pub series_len: u16,
    /// Length of the body following the series label.
    pub body_len: u32,
}

impl Header {
    /// A header with every optional field zeroed.
    pub fn new(frame: FrameKind) -> Self {
        Self {
            frame,
            op: 0,
            flags: 0,
            arg0: 0,
            arg1: 0,
            series_len: 0,
            body_len: 0,
        }
    }

    pub fn has_flag(&self, flag: u8) -> bool {
        self.flags & flag != 0
    }

    /// Length of everything after the header.
    pub fn variable_len(&self) -> usize {
        self.series_len as usize + self.body_len as usize
    }

    /// Encode header to 20 bytes (little-endian).
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0] = PROTOCOL_VERSION;
        buf[1] = self.frame as u8;
        buf[2] = self.op;
        buf[3] = self.flags;
        buf[4..8].copy_from_slice(&self.arg0.to_le_bytes());
        buf[8..12].copy_from_slice(&self.arg1.to_le_bytes());
        buf[12..14].copy_from_slice(&self.series_len.to_le_bytes());
        // buf[14..16] reserved = 0
        buf[16..20].copy_from_slice(&self.body_len.to_le_bytes());
        buf
    }

    /// Decode header from 20 bytes.
    pub fn decode(buf: &[u8; HEADER_SIZE]) -> Result<Self> {
        if buf[0] != PROTOCOL_VERSION {
            return Err(RallyError::DecodeFailed(format!(
                "protocol version mismatch: local={PROTOCOL_VERSION}, remote={}",
                buf[0]
            )));
        }
        let frame = FrameKind::from_u8(buf[1])
            .ok_or_else(|| RallyError::DecodeFailed(format!("unknown frame kind {}", buf[1])))?;
        let flags = buf[3];
        if flags & !KNOWN_FLAGS != 0 {
            return Err(RallyError::DecodeFailed(format!(
                "unknown flag bits {flags:#010b}"
            )));
        }
        if buf[14] != 0 || buf[15] != 0 {
            return Err(RallyError::DecodeFailed("reserved bytes are not zero".into()));
        }
        Ok(Header {
            frame,
            op: buf[2],
            flags,
            arg0: u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]),
            arg1: u32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]),
            series_len: u16::from_le_bytes([buf[12], buf[13]]),
            body_len: u32::from_le_bytes([buf[16], buf[17], buf[18], buf[19]]),
        })
    }
}
