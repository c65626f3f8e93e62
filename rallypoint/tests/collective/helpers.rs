use rallypoint::{GroupDescriptor, RallyConfig, RallyContext};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Short timeouts so a broken test fails instead of stalling the suite.
pub fn fast_config() -> RallyConfig {
    RallyConfig {
        connect_timeout: Duration::from_secs(5),
        connect_retry_interval: Duration::from_millis(20),
        handshake_timeout: Duration::from_secs(5),
        shutdown_timeout: Duration::from_secs(2),
        shutdown_grace: Duration::from_secs(2),
        ..RallyConfig::default()
    }
}

/// The port part of a `host:port` string.
pub fn port_of(addr: &str) -> String {
    addr.rsplit(':').next().unwrap_or_default().to_string()
}

/// Enter a `size`-rank group on loopback. Rank 0 hosts the chief on an
/// ephemeral port; the returned contexts are in rank order.
pub async fn enter_group(size: u32, config: RallyConfig) -> Vec<RallyContext> {
    let chief = RallyContext::enter(
        GroupDescriptor::new(0, size, "127.0.0.1", "0").unwrap(),
        config.clone(),
    )
    .await
    .unwrap();
    let port = port_of(chief.chief_addr());

    let mut joins = Vec::new();
    for rank in 1..size {
        let group = GroupDescriptor::new(rank, size, "127.0.0.1", port.clone()).unwrap();
        let config = config.clone();
        joins.push(tokio::spawn(RallyContext::enter(group, config)));
    }
    let mut contexts = vec![chief];
    for j in joins {
        contexts.push(j.await.unwrap().unwrap());
    }
    contexts
}

/// Leave the group: non-chief ranks first so the chief's grace wait is short.
pub async fn exit_group(contexts: Vec<RallyContext>) {
    for ctx in contexts.into_iter().rev() {
        ctx.exit().await.unwrap();
    }
}

/// Run `f` on every rank of a fresh `size`-rank group concurrently and
/// return the per-rank results in rank order.
pub async fn run_collective<F, Fut, T>(size: u32, f: F) -> Vec<T>
where
    F: Fn(Arc<RallyContext>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = T> + Send + 'static,
    T: Send + 'static,
{
    let contexts: Vec<Arc<RallyContext>> = enter_group(size, fast_config())
        .await
        .into_iter()
        .map(Arc::new)
        .collect();

    let f = Arc::new(f);
    let mut handles = Vec::new();
    for ctx in &contexts {
        let ctx = Arc::clone(ctx);
        let f = Arc::clone(&f);
        handles.push(tokio::spawn(async move { f(ctx).await }));
    }
    let mut results = Vec::with_capacity(handles.len());
    for h in handles {
        results.push(h.await.unwrap());
    }

    let contexts = contexts
        .into_iter()
        .map(|c| Arc::try_unwrap(c).ok().unwrap())
        .collect();
    exit_group(contexts).await;
    results
}
