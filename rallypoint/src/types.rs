use crate::error::RallyError;
use bytes::Bytes;

/// Rank of a participant in the group (0-indexed).
pub type Rank = u32;

/// Current protocol version, carried in every frame header.
pub const PROTOCOL_VERSION: u8 = 1;

/// Longest series label accepted on the wire, in bytes.
pub const MAX_SERIES_LEN: usize = 256;

/// The collective a contribution belongs to.
///
/// The kind decides which ranks must supply a payload and what shape of
/// result each rank gets back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum OperationKind {
    /// Every rank contributes; only the root receives the rank-ordered sequence.
    Gather = 0,
    /// Only the root contributes; every rank receives the root's payload.
    Broadcast = 1,
    /// Every rank contributes; every rank receives the rank-ordered sequence.
    AllGather = 2,
}

impl OperationKind {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(OperationKind::Gather),
            1 => Some(OperationKind::Broadcast),
            2 => Some(OperationKind::AllGather),
            _ => None,
        }
    }

    /// Human-readable name.
    pub const fn name(self) -> &'static str {
        match self {
            OperationKind::Gather => "gather",
            OperationKind::Broadcast => "broadcast",
            OperationKind::AllGather => "allgather",
        }
    }

    /// Whether the root rank matters for this kind.
    pub const fn uses_root(self) -> bool {
        matches!(self, OperationKind::Gather | OperationKind::Broadcast)
    }

    /// Check that a contribution from `rank` has the payload shape this kind
    /// requires. Returns a description of the violation otherwise.
    pub fn check_contribution(
        self,
        rank: Rank,
        root: Rank,
        size: u32,
        has_payload: bool,
    ) -> std::result::Result<(), String> {
        if self.uses_root() && root >= size {
            return Err(format!("root {root} is outside a group of size {size}"));
        }
        match self {
            OperationKind::Gather | OperationKind::AllGather if !has_payload => {
                Err(format!("{self} requires a payload from every rank"))
            }
            OperationKind::Broadcast if rank == root && !has_payload => {
                Err(format!("broadcast source rank {root} must supply a payload"))
            }
            OperationKind::Broadcast if rank != root && has_payload => Err(format!(
                "rank {rank} supplied a payload to a broadcast sourced at rank {root}"
            )),
            _ => Ok(()),
        }
    }
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Identifies one collective instance: its kind plus a caller-chosen label.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SeriesKey {
    pub kind: OperationKind,
    pub series: String,
}

impl SeriesKey {
    pub fn new(kind: OperationKind, series: impl Into<String>) -> Self {
        Self {
            kind,
            series: series.into(),
        }
    }
}

impl std::fmt::Display for SeriesKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}[{:?}]", self.kind, self.series)
    }
}

/// The result a single rank receives from a collective.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// No value for this rank (e.g. a non-root gather participant).
    Absent,
    /// A single payload (broadcast).
    Value(Bytes),
    /// One payload per rank, indexed by ascending rank (gather root, allgather).
    Values(Vec<Bytes>),
}

impl Outcome {
    pub fn is_absent(&self) -> bool {
        matches!(self, Outcome::Absent)
    }

    /// Borrow the single payload, if this is a broadcast result.
    pub fn value(&self) -> Option<&Bytes> {
        match self {
            Outcome::Value(v) => Some(v),
            _ => None,
        }
    }

    /// Borrow the rank-ordered payloads, if this is a sequence result.
    pub fn values(&self) -> Option<&[Bytes]> {
        match self {
            Outcome::Values(v) => Some(v),
            _ => None,
        }
    }

    pub fn into_value(self) -> Option<Bytes> {
        match self {
            Outcome::Value(v) => Some(v),
            _ => None,
        }
    }

    pub fn into_values(self) -> Option<Vec<Bytes>> {
        match self {
            Outcome::Values(v) => Some(v),
            _ => None,
        }
    }
}

/// Why a collective could not produce a result.
///
/// Unlike [`RallyError`], this is cheap to clone and travels on the wire, so
/// an operation can hand the same failure out on every `wait()`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Failure {
    /// A rank left before contributing to the collective.
    PeerDisconnected { rank: Rank },
    /// The coordinator rejected a frame or contribution.
    Protocol { reason: String },
    /// The series key was reused before its previous instance completed.
    SeriesReuse,
    /// The coordinator was torn down before the collective completed.
    CoordinatorShutdown,
    /// The registering rank reported a different group size.
    GroupMismatch { expected: u32 },
    /// The connection to the chief went away.
    ConnectionLost { reason: String },
}

impl Failure {
    /// Wire code, see [`crate::protocol::message`].
    pub fn code(&self) -> u32 {
        match self {
            Failure::PeerDisconnected { .. } => 1,
            Failure::Protocol { .. } => 2,
            Failure::SeriesReuse => 3,
            Failure::CoordinatorShutdown => 4,
            Failure::GroupMismatch { .. } => 5,
            Failure::ConnectionLost { .. } => 6,
        }
    }

    /// The numeric argument carried next to the code.
    pub fn arg(&self) -> u32 {
        match self {
            Failure::PeerDisconnected { rank } => *rank,
            Failure::GroupMismatch { expected } => *expected,
            _ => 0,
        }
    }

    /// Free-form text carried in the frame body.
    pub fn reason(&self) -> &str {
        match self {
            Failure::Protocol { reason } | Failure::ConnectionLost { reason } => reason,
            _ => "",
        }
    }

    /// Shorten the carried reason to at most `max` bytes so the frame fits.
    pub fn fit_reason(self, max: usize) -> Self {
        match self {
            Failure::Protocol { reason } => Failure::Protocol {
                reason: truncate_utf8(reason, max),
            },
            Failure::ConnectionLost { reason } => Failure::ConnectionLost {
                reason: truncate_utf8(reason, max),
            },
            other => other,
        }
    }

    /// Rebuild a failure from its wire parts.
    pub fn from_parts(code: u32, arg: u32, reason: String) -> Option<Self> {
        match code {
            1 => Some(Failure::PeerDisconnected { rank: arg }),
            2 => Some(Failure::Protocol { reason }),
            3 => Some(Failure::SeriesReuse),
            4 => Some(Failure::CoordinatorShutdown),
            5 => Some(Failure::GroupMismatch { expected: arg }),
            6 => Some(Failure::ConnectionLost { reason }),
            _ => None,
        }
    }

    /// Convert into the crate error for the collective identified by `key`.
    pub fn into_error(self, key: &SeriesKey) -> RallyError {
        match self {
            Failure::PeerDisconnected { rank } => RallyError::PeerDisconnected { rank },
            Failure::Protocol { reason } => RallyError::Protocol { reason },
            Failure::SeriesReuse => RallyError::SeriesReuse {
                kind: key.kind,
                series: key.series.clone(),
            },
            Failure::CoordinatorShutdown => RallyError::CoordinatorShutdown,
            // The local size is not known here; callers that can supply it
            // build `GroupMismatch` themselves.
            Failure::GroupMismatch { expected } => RallyError::GroupMismatch {
                expected,
                reported: 0,
            },
            Failure::ConnectionLost { reason } => RallyError::ConnectionLost { reason },
        }
    }
}

fn truncate_utf8(mut s: String, max: usize) -> String {
    if s.len() > max {
        let mut end = max;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        s.truncate(end);
    }
    s
}

impl std::fmt::Display for Failure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Failure::PeerDisconnected { rank } => write!(f, "rank {rank} disconnected"),
            Failure::Protocol { reason } => write!(f, "protocol error: {reason}"),
            Failure::SeriesReuse => f.write_str("series reused before completion"),
            Failure::CoordinatorShutdown => f.write_str("coordinator shut down"),
            Failure::GroupMismatch { expected } => {
                write!(f, "group size mismatch (expected {expected})")
            }
            Failure::ConnectionLost { reason } => write!(f, "connection lost: {reason}"),
        }
    }
}
