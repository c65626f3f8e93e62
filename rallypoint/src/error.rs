use crate::types::{OperationKind, Rank};

pub type Result<T> = std::result::Result<T, RallyError>;

#[derive(Debug, thiserror::Error)]
pub enum RallyError {
    #[error("protocol error: {reason}")]
    Protocol { reason: String },

    #[error("group size mismatch: coordinator expects {expected}, rank reported {reported}")]
    GroupMismatch { expected: u32, reported: u32 },

    #[error("peer {rank} disconnected before contributing")]
    PeerDisconnected { rank: Rank },

    #[error("{kind} series {series:?} reused before its previous instance completed")]
    SeriesReuse { kind: OperationKind, series: String },

    #[error("coordinator shut down before the collective completed")]
    CoordinatorShutdown,

    #[error("connection to chief lost: {reason}")]
    ConnectionLost { reason: String },

    #[error("invalid rank {rank}: group size is {size}")]
    InvalidRank { rank: Rank, size: u32 },

    #[error("invalid group description: {0}")]
    InvalidGroup(String),

    #[error("invalid {kind} contribution: {reason}")]
    InvalidContribution { kind: OperationKind, reason: String },

    #[error("series label is {len} bytes, limit is {max}")]
    SeriesTooLong { len: usize, max: usize },

    #[error("payload is {len} bytes, limit is {max}")]
    PayloadTooLarge { len: usize, max: usize },

    #[error("frame decode failed: {0}")]
    DecodeFailed(String),

    #[error("frame encode failed: {0}")]
    EncodeFailed(String),

    #[error("chief at {addr} unreachable after {attempts} attempts")]
    ChiefUnreachable { addr: String, attempts: u32 },

    #[error("registration handshake timed out after {timeout_ms}ms")]
    HandshakeTimeout { timeout_ms: u64 },

    #[error("context already closed")]
    ContextClosed,

    #[error("internal lock poisoned: {0}")]
    LockPoisoned(&'static str),

    #[error("transport error: {message}")]
    Transport {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl RallyError {
    /// Create a `Transport` error with just a message.
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport {
            message: msg.into(),
            source: None,
        }
    }

    /// Create a `Transport` error with a message and a source error.
    pub fn transport_with_source(
        msg: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Transport {
            message: msg.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a `Protocol` error.
    pub fn protocol(reason: impl Into<String>) -> Self {
        Self::Protocol {
            reason: reason.into(),
        }
    }
}
