use crate::error::{RallyError, Result};
use crate::types::{Failure, OperationKind, Outcome, Rank, SeriesKey};
use tokio::sync::oneshot;

/// How a pending collective ends, as handed over by the worker client.
pub(crate) type Resolution = std::result::Result<Outcome, Failure>;

/// Handle to one submitted collective.
///
/// Returned immediately by a submit. The result arrives in the background;
/// call [`wait`](Self::wait) (blocking) or [`resolve`](Self::resolve) (async)
/// to get it. The first resolution is cached, so later calls return the same
/// value or failure without touching the connection again.
///
/// A successful result for a rank with nothing to receive (non-root gather)
/// is [`Outcome::Absent`], never an error.
pub struct Operation {
    key: SeriesKey,
    rank: Rank,
    rx: Option<oneshot::Receiver<Resolution>>,
    resolved: Option<Resolution>,
}

impl Operation {
    pub(crate) fn new(key: SeriesKey, rank: Rank, rx: oneshot::Receiver<Resolution>) -> Self {
        Self {
            key,
            rank,
            rx: Some(rx),
            resolved: None,
        }
    }

    pub fn kind(&self) -> OperationKind {
        self.key.kind
    }

    pub fn series(&self) -> &str {
        &self.key.series
    }

    pub fn key(&self) -> &SeriesKey {
        &self.key
    }

    /// The submitting rank.
    pub fn rank(&self) -> Rank {
        self.rank
    }

    /// Block the calling thread until the collective resolves.
    ///
    /// Must not be called from inside an async runtime; use
    /// [`resolve`](Self::resolve) there.
    pub fn wait(&mut self) -> Result<Outcome> {
        if let Some(rx) = self.rx.take() {
            self.resolved = Some(rx.blocking_recv().unwrap_or_else(|_| Err(dropped())));
        }
        self.cached()
    }

    /// Async counterpart of [`wait`](Self::wait).
    ///
    /// Cancel safe: dropping the future leaves the operation pending.
    pub async fn resolve(&mut self) -> Result<Outcome> {
        if let Some(rx) = self.rx.as_mut() {
            let resolution = rx.await.unwrap_or_else(|_| Err(dropped()));
            self.rx = None;
            self.resolved = Some(resolution);
        }
        self.cached()
    }

    /// Check without blocking whether the result has arrived.
    pub fn is_ready(&mut self) -> bool {
        if let Some(rx) = self.rx.as_mut() {
            let resolution = match rx.try_recv() {
                Ok(r) => r,
                Err(oneshot::error::TryRecvError::Empty) => return false,
                Err(oneshot::error::TryRecvError::Closed) => Err(dropped()),
            };
            self.rx = None;
            self.resolved = Some(resolution);
        }
        true
    }

    fn cached(&self) -> Result<Outcome> {
        match &self.resolved {
            Some(Ok(outcome)) => Ok(outcome.clone()),
            Some(Err(failure)) => Err(failure.clone().into_error(&self.key)),
            None => Err(RallyError::protocol("operation not resolved")),
        }
    }
}

impl std::fmt::Debug for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Operation")
            .field("key", &self.key)
            .field("rank", &self.rank)
            .field("resolved", &self.resolved.is_some())
            .finish()
    }
}

fn dropped() -> Failure {
    Failure::ConnectionLost {
        reason: "worker client dropped before the result arrived".into(),
    }
}

/// A group of operations that can be waited on together.
#[derive(Debug, Default)]
pub struct OperationGroup {
    ops: Vec<Operation>,
}

impl OperationGroup {
    /// Create an empty group.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an operation to the group.
    pub fn push(&mut self, op: Operation) {
        self.ops.push(op);
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Block until every operation resolves. Results come back in push order.
    ///
    /// Returns the first error encountered, if any. All operations are
    /// awaited regardless of errors.
    pub fn wait_all(self) -> Result<Vec<Outcome>> {
        collect_first_err(self.ops.into_iter().map(|mut op| op.wait()))
    }

    /// Async counterpart of [`wait_all`](Self::wait_all).
    pub async fn resolve_all(self) -> Result<Vec<Outcome>> {
        let mut results = Vec::with_capacity(self.ops.len());
        for mut op in self.ops {
            results.push(op.resolve().await);
        }
        collect_first_err(results)
    }
}

fn collect_first_err(results: impl IntoIterator<Item = Result<Outcome>>) -> Result<Vec<Outcome>> {
    let mut outcomes = Vec::new();
    let mut first_err = None;
    for r in results {
        match r {
            Ok(o) => outcomes.push(o),
            Err(e) if first_err.is_none() => first_err = Some(e),
            Err(_) => {}
        }
    }
    match first_err {
        Some(e) => Err(e),
        None => Ok(outcomes),
    }
}
