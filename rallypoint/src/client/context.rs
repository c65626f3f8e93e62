use crate::client::WorkerClient;
use crate::cluster::{Coordinator, CoordinatorHandle};
use crate::collective::Operation;
use crate::config::RallyConfig;
use crate::error::Result;
use crate::group::GroupDescriptor;
use crate::types::{OperationKind, Rank};
use bytes::Bytes;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

/// One rank's membership in a rendezvous group (async API).
///
/// Entering connects to the chief and registers this rank; the process that
/// hosts the coordinator (rank 0 unless `RallyConfig::host_coordinator` says
/// otherwise) starts it first and then connects to it over the wire like any
/// other rank. Collectives return an [`Operation`] immediately.
///
/// Call [`exit`](Self::exit) to leave gracefully. Dropping the context
/// without exiting closes the connection abruptly, which the chief treats as
/// a disconnect.
pub struct RallyContext {
    group: GroupDescriptor,
    config: RallyConfig,
    worker: WorkerClient,
    coordinator: Option<CoordinatorHandle>,
}

impl RallyContext {
    /// Join the group described by `group`.
    pub async fn enter(group: GroupDescriptor, config: RallyConfig) -> Result<Self> {
        let hosts = config.host_coordinator.unwrap_or_else(|| group.is_chief());

        let (coordinator, chief_addr) = if hosts {
            let handle = Coordinator::bind(
                group.chief_host(),
                group.chief_service(),
                group.size(),
                config.clone(),
            )
            .await?
            .spawn();
            let addr = dialable(handle.local_addr()).to_string();
            (Some(handle), addr)
        } else {
            (None, group.chief_endpoint())
        };

        let worker = match WorkerClient::connect(&group, &chief_addr, &config).await {
            Ok(w) => w,
            Err(e) => {
                if let Some(handle) = coordinator {
                    let _ = handle.shutdown(Duration::ZERO).await;
                }
                return Err(e);
            }
        };
        tracing::info!(
            rank = group.rank(),
            size = group.size(),
            chief = %chief_addr,
            hosting = coordinator.is_some(),
            "entered rendezvous group"
        );

        Ok(Self {
            group,
            config,
            worker,
            coordinator,
        })
    }

    pub fn group(&self) -> &GroupDescriptor {
        &self.group
    }

    pub fn rank(&self) -> Rank {
        self.group.rank()
    }

    pub fn size(&self) -> u32 {
        self.group.size()
    }

    /// The address this rank's connection dialed. On the hosting rank this
    /// is the coordinator's bound address, so an ephemeral service (`"0"`)
    /// shows up here with its real port.
    pub fn chief_addr(&self) -> &str {
        self.worker.chief()
    }

    /// Whether this process hosts the coordinator.
    pub fn is_hosting(&self) -> bool {
        self.coordinator.is_some()
    }

    /// The hosted coordinator, if any.
    pub fn coordinator(&self) -> Option<&CoordinatorHandle> {
        self.coordinator.as_ref()
    }

    /// Gather to rank 0. Rank 0 receives every payload in rank order; the
    /// other ranks receive [`Outcome::Absent`](crate::Outcome::Absent).
    pub fn gather(&self, payload: impl Into<Bytes>, series: impl Into<String>) -> Result<Operation> {
        self.gather_to(payload, series, 0)
    }

    /// Gather to `root`.
    pub fn gather_to(
        &self,
        payload: impl Into<Bytes>,
        series: impl Into<String>,
        root: Rank,
    ) -> Result<Operation> {
        self.worker
            .submit(OperationKind::Gather, series, root, Some(payload.into()))
    }

    /// Broadcast from rank 0. Rank 0 passes `Some(payload)`, every other
    /// rank `None`; every rank, rank 0 included, receives the payload.
    pub fn broadcast(&self, payload: Option<Bytes>, series: impl Into<String>) -> Result<Operation> {
        self.broadcast_from(payload, series, 0)
    }

    /// Broadcast from `root`.
    pub fn broadcast_from(
        &self,
        payload: Option<Bytes>,
        series: impl Into<String>,
        root: Rank,
    ) -> Result<Operation> {
        self.worker
            .submit(OperationKind::Broadcast, series, root, payload)
    }

    /// Every rank receives every payload in rank order.
    pub fn allgather(
        &self,
        payload: impl Into<Bytes>,
        series: impl Into<String>,
    ) -> Result<Operation> {
        self.worker
            .submit(OperationKind::AllGather, series, 0, Some(payload.into()))
    }

    /// Leave the group.
    ///
    /// Shuts this rank's connection down first. A hosting context then waits
    /// up to `shutdown_grace` for the other ranks before stopping the
    /// coordinator.
    pub async fn exit(mut self) -> Result<()> {
        let worker_result = self.worker.shutdown().await;
        if let Some(handle) = self.coordinator.take() {
            handle.shutdown(self.config.shutdown_grace).await?;
        }
        tracing::debug!(rank = self.group.rank(), "exited rendezvous group");
        worker_result
    }
}

/// Swap an unspecified bind address for loopback so it can be dialed.
fn dialable(addr: SocketAddr) -> SocketAddr {
    match addr.ip() {
        IpAddr::V4(ip) if ip.is_unspecified() => {
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), addr.port())
        }
        IpAddr::V6(ip) if ip.is_unspecified() => {
            SocketAddr::new(IpAddr::V6(Ipv6Addr::LOCALHOST), addr.port())
        }
        _ => addr,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dialable() {
        let any: SocketAddr = "0.0.0.0:4000".parse().unwrap();
        assert_eq!(dialable(any), "127.0.0.1:4000".parse().unwrap());
        let any6: SocketAddr = "[::]:4000".parse().unwrap();
        assert_eq!(dialable(any6), "[::1]:4000".parse().unwrap());
        let fixed: SocketAddr = "10.1.2.3:4000".parse().unwrap();
        assert_eq!(dialable(fixed), fixed);
    }

    #[tokio::test]
    async fn test_single_rank_context() {
        let group = GroupDescriptor::new(0, 1, "127.0.0.1", "0").unwrap();
        let ctx = RallyContext::enter(group, RallyConfig::default()).await.unwrap();
        assert!(ctx.is_hosting());
        assert_ne!(ctx.chief_addr(), "127.0.0.1:0");

        let mut op = ctx.broadcast(Some(Bytes::from_static(b"solo")), "").unwrap();
        assert_eq!(op.resolve().await.unwrap().into_value().unwrap(), "solo");
        ctx.exit().await.unwrap();
    }

    #[tokio::test]
    async fn test_non_host_needs_reachable_chief() {
        let probe = crate::transport::TransportListener::bind("127.0.0.1", "0")
            .await
            .unwrap();
        let port = probe.local_addr().port().to_string();
        drop(probe);

        let group = GroupDescriptor::new(1, 2, "127.0.0.1", port).unwrap();
        let config = RallyConfig {
            connect_timeout: Duration::from_millis(100),
            connect_retry_interval: Duration::from_millis(20),
            ..RallyConfig::default()
        };
        let err = RallyContext::enter(group, config).await.err().unwrap();
        assert!(matches!(err, crate::RallyError::ChiefUnreachable { .. }));
    }
}
