use crate::error::{RallyError, Result};
use crate::transport::listener::join_host_service;
use crate::types::Rank;

/// Service used when `CHIEF_SERVICE` is not set.
pub const DEFAULT_CHIEF_SERVICE: &str = "12345";

/// A worker's fixed position in the group and where to find the chief.
///
/// Every member of a run must agree on `size` and the chief address; ranks
/// cover `0..size` exactly once. The local/cross fields describe a
/// hierarchical layout and are carried for the caller's benefit only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupDescriptor {
    rank: Rank,
    size: u32,
    local_rank: u32,
    local_size: u32,
    cross_rank: u32,
    cross_size: u32,
    chief_host: String,
    chief_service: String,
}

impl GroupDescriptor {
    /// Describe rank `rank` of a flat group of `size` ranks.
    ///
    /// Local fields default to the flat layout (`rank`/`size`), cross fields
    /// to a single node (`0`/`1`).
    pub fn new(
        rank: Rank,
        size: u32,
        chief_host: impl Into<String>,
        chief_service: impl Into<String>,
    ) -> Result<Self> {
        if size == 0 {
            return Err(RallyError::InvalidGroup("size must be positive".into()));
        }
        if rank >= size {
            return Err(RallyError::InvalidRank { rank, size });
        }
        let chief_host = chief_host.into();
        if chief_host.is_empty() {
            return Err(RallyError::InvalidGroup("chief host is empty".into()));
        }
        let chief_service = chief_service.into();
        if chief_service.is_empty() {
            return Err(RallyError::InvalidGroup("chief service is empty".into()));
        }
        Ok(Self {
            rank,
            size,
            local_rank: rank,
            local_size: size,
            cross_rank: 0,
            cross_size: 1,
            chief_host,
            chief_service,
        })
    }

    /// Set the node-local position.
    pub fn with_local(mut self, local_rank: u32, local_size: u32) -> Self {
        self.local_rank = local_rank;
        self.local_size = local_size;
        self
    }

    /// Set the cross-node position.
    pub fn with_cross(mut self, cross_rank: u32, cross_size: u32) -> Self {
        self.cross_rank = cross_rank;
        self.cross_size = cross_size;
        self
    }

    /// Build a descriptor from the launcher environment.
    ///
    /// Requires `RANK`, `SIZE` and `CHIEF_IP`; `LOCAL_RANK`, `LOCAL_SIZE`,
    /// `CROSS_RANK`, `CROSS_SIZE` and `CHIEF_SERVICE` are optional.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let required = |key: &str| -> Result<String> {
            get(key).ok_or_else(|| RallyError::InvalidGroup(format!("{key} is not set")))
        };
        let number = |key: &str, raw: String| -> Result<u32> {
            raw.trim()
                .parse::<u32>()
                .map_err(|e| RallyError::InvalidGroup(format!("{key}={raw:?}: {e}")))
        };

        let rank = number("RANK", required("RANK")?)?;
        let size = number("SIZE", required("SIZE")?)?;
        let host = required("CHIEF_IP")?;
        let service = get("CHIEF_SERVICE").unwrap_or_else(|| DEFAULT_CHIEF_SERVICE.to_string());

        let mut group = Self::new(rank, size, host, service)?;
        if let Some(v) = get("LOCAL_RANK") {
            group.local_rank = number("LOCAL_RANK", v)?;
        }
        if let Some(v) = get("LOCAL_SIZE") {
            group.local_size = number("LOCAL_SIZE", v)?;
        }
        if let Some(v) = get("CROSS_RANK") {
            group.cross_rank = number("CROSS_RANK", v)?;
        }
        if let Some(v) = get("CROSS_SIZE") {
            group.cross_size = number("CROSS_SIZE", v)?;
        }
        Ok(group)
    }

    pub fn rank(&self) -> Rank {
        self.rank
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn local_rank(&self) -> u32 {
        self.local_rank
    }

    pub fn local_size(&self) -> u32 {
        self.local_size
    }

    pub fn cross_rank(&self) -> u32 {
        self.cross_rank
    }

    pub fn cross_size(&self) -> u32 {
        self.cross_size
    }

    pub fn chief_host(&self) -> &str {
        &self.chief_host
    }

    pub fn chief_service(&self) -> &str {
        &self.chief_service
    }

    /// `host:service` string used for name resolution.
    ///
    /// IPv6 literals are bracketed so the result parses as a socket address.
    pub fn chief_endpoint(&self) -> String {
        join_host_service(&self.chief_host, &self.chief_service)
    }

    /// Whether this rank hosts the coordinator by default.
    pub fn is_chief(&self) -> bool {
        self.rank == 0
    }
}
