use crate::client::RallyContext;
use crate::collective::Operation;
use crate::config::RallyConfig;
use crate::error::{RallyError, Result};
use crate::group::GroupDescriptor;
use crate::types::Rank;
use bytes::Bytes;

/// Blocking wrapper around [`RallyContext`].
///
/// Owns a `tokio::runtime::Runtime` that keeps the connection's background
/// I/O running while the caller's thread blocks in [`Operation::wait`].
/// The group is left when the context is exited or dropped, whichever
/// comes first.
pub struct DistributedContext {
    group: GroupDescriptor,
    inner: Option<RallyContext>,
    rt: Option<tokio::runtime::Runtime>,
}

impl DistributedContext {
    /// Join the group. Blocks until this rank is registered with the chief.
    pub fn enter(group: GroupDescriptor, config: RallyConfig) -> Result<Self> {
        let rt = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(config.runtime_threads.max(1))
            .thread_name(format!("rallypoint-r{}", group.rank()))
            .enable_all()
            .build()
            .map_err(|e| RallyError::transport_with_source("tokio runtime", e))?;
        let inner = rt.block_on(RallyContext::enter(group.clone(), config))?;
        Ok(Self {
            group,
            inner: Some(inner),
            rt: Some(rt),
        })
    }

    /// Join the group described by the launcher environment.
    pub fn from_env() -> Result<Self> {
        Self::enter(GroupDescriptor::from_env()?, RallyConfig::from_env())
    }

    fn ctx(&self) -> Result<&RallyContext> {
        self.inner.as_ref().ok_or(RallyError::ContextClosed)
    }

    pub fn rank(&self) -> Rank {
        self.group().rank()
    }

    pub fn size(&self) -> u32 {
        self.group().size()
    }

    pub fn local_rank(&self) -> u32 {
        self.group().local_rank()
    }

    pub fn local_size(&self) -> u32 {
        self.group().local_size()
    }

    pub fn cross_rank(&self) -> u32 {
        self.group().cross_rank()
    }

    pub fn cross_size(&self) -> u32 {
        self.group().cross_size()
    }

    pub fn group(&self) -> &GroupDescriptor {
        &self.group
    }

    /// See [`RallyContext::chief_addr`].
    pub fn chief_addr(&self) -> Result<String> {
        Ok(self.ctx()?.chief_addr().to_string())
    }

    pub fn gather(&self, payload: impl Into<Bytes>, series: impl Into<String>) -> Result<Operation> {
        self.ctx()?.gather(payload, series)
    }

    pub fn gather_to(
        &self,
        payload: impl Into<Bytes>,
        series: impl Into<String>,
        root: Rank,
    ) -> Result<Operation> {
        self.ctx()?.gather_to(payload, series, root)
    }

    pub fn broadcast(&self, payload: Option<Bytes>, series: impl Into<String>) -> Result<Operation> {
        self.ctx()?.broadcast(payload, series)
    }

    pub fn broadcast_from(
        &self,
        payload: Option<Bytes>,
        series: impl Into<String>,
        root: Rank,
    ) -> Result<Operation> {
        self.ctx()?.broadcast_from(payload, series, root)
    }

    pub fn allgather(
        &self,
        payload: impl Into<Bytes>,
        series: impl Into<String>,
    ) -> Result<Operation> {
        self.ctx()?.allgather(payload, series)
    }

    /// Leave the group and shut the runtime down.
    pub fn exit(mut self) -> Result<()> {
        self.close()
    }

    fn close(&mut self) -> Result<()> {
        let (Some(inner), Some(rt)) = (self.inner.take(), self.rt.take()) else {
            return Ok(());
        };
        let result = rt.block_on(inner.exit());
        rt.shutdown_background();
        result
    }
}

impl Drop for DistributedContext {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::warn!(error = %e, "leaving the group on drop failed");
        }
    }
}
