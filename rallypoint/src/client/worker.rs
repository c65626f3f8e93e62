use crate::collective::{Operation, Resolution};
use crate::config::RallyConfig;
use crate::error::{RallyError, Result};
use crate::group::GroupDescriptor;
use crate::protocol::RallyMessage;
use crate::transport::{FrameReader, Outbound, connect_with_retry, split_framed, spawn_writer};
use crate::types::{Failure, MAX_SERIES_LEN, OperationKind, Rank, SeriesKey};
use bytes::Bytes;
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Operations awaiting a DELIVER or FAIL from the chief.
#[derive(Default)]
struct Pending {
    ops: HashMap<SeriesKey, oneshot::Sender<Resolution>>,
    /// Set once the connection is gone; later submits are refused with it.
    closed: Option<Failure>,
}

impl Pending {
    /// Resolve every pending operation with `failure` and refuse new ones.
    fn close(&mut self, failure: Failure) {
        if self.closed.is_none() {
            self.closed = Some(failure.clone());
        }
        for (_, tx) in self.ops.drain() {
            let _ = tx.send(Err(failure.clone()));
        }
    }
}

fn lock_pending(pending: &Mutex<Pending>) -> Result<MutexGuard<'_, Pending>> {
    pending.lock().map_err(|_| RallyError::LockPoisoned("pending operations"))
}

struct Tasks {
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

/// One rank's registered connection to the chief.
///
/// Submits never wait on the network: the SUBMIT frame is queued for a
/// background writer and an [`Operation`] comes back at once. A background
/// reader routes each inbound DELIVER/FAIL to the operation with the same
/// [`SeriesKey`].
pub struct WorkerClient {
    rank: Rank,
    size: u32,
    chief: String,
    max_frame_bytes: usize,
    shutdown_timeout: Duration,
    pending: Arc<Mutex<Pending>>,
    outbound: Mutex<Option<Outbound>>,
    tasks: Mutex<Option<Tasks>>,
    stop: CancellationToken,
}

impl WorkerClient {
    /// Connect to the chief at `endpoint` (`host:service`) and register as
    /// `group.rank()`.
    ///
    /// Retries the connection for up to `config.connect_timeout`, then waits
    /// up to `config.handshake_timeout` for the chief to accept.
    pub async fn connect(
        group: &GroupDescriptor,
        endpoint: &str,
        config: &RallyConfig,
    ) -> Result<Self> {
        let rank = group.rank();
        let size = group.size();

        let stream = connect_with_retry(endpoint, config).await?;
        let (mut reader, writer) = split_framed(stream, config.max_frame_bytes);
        let (outbound, writer_task) = spawn_writer(writer, endpoint.to_string());

        outbound.send(RallyMessage::Register { rank, size })?;
        let reply = tokio::time::timeout(config.handshake_timeout, reader.next())
            .await
            .map_err(|_| RallyError::HandshakeTimeout {
                timeout_ms: config.handshake_timeout.as_millis() as u64,
            })?;
        match reply {
            Some(Ok(RallyMessage::Accept {
                rank: r,
                size: s,
            })) if r == rank && s == size => {}
            Some(Ok(RallyMessage::Reject { failure })) => {
                return Err(match failure {
                    Failure::GroupMismatch { expected } => RallyError::GroupMismatch {
                        expected,
                        reported: size,
                    },
                    Failure::Protocol { reason } => RallyError::Protocol { reason },
                    Failure::CoordinatorShutdown => RallyError::CoordinatorShutdown,
                    other => RallyError::protocol(format!("registration refused: {other}")),
                });
            }
            Some(Ok(other)) => {
                return Err(RallyError::protocol(format!(
                    "expected ACCEPT for rank {rank}, got {other:?}"
                )));
            }
            Some(Err(e)) => return Err(e),
            None => {
                return Err(RallyError::ConnectionLost {
                    reason: "chief closed the connection during registration".into(),
                });
            }
        }
        tracing::info!(rank, size, chief = endpoint, "registered with chief");

        let pending = Arc::new(Mutex::new(Pending::default()));
        let reader_task = tokio::spawn(demux(reader, Arc::clone(&pending), rank));

        let stop = CancellationToken::new();
        if let Some(period) = config.keepalive_interval {
            tokio::spawn(keepalive(outbound.clone(), period, stop.clone()));
        }

        Ok(Self {
            rank,
            size,
            chief: endpoint.to_string(),
            max_frame_bytes: config.max_frame_bytes,
            shutdown_timeout: config.shutdown_timeout,
            pending,
            outbound: Mutex::new(Some(outbound)),
            tasks: Mutex::new(Some(Tasks {
                reader: reader_task,
                writer: writer_task,
            })),
            stop,
        })
    }

    pub fn rank(&self) -> Rank {
        self.rank
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    /// The `host:service` this client is connected to.
    pub fn chief(&self) -> &str {
        &self.chief
    }

    /// Submit this rank's contribution to the collective `kind` on `series`.
    ///
    /// `root` is the collector (gather) or source (broadcast) rank and is
    /// ignored by allgather. The payload shape is checked before anything is
    /// sent.
    pub fn submit(
        &self,
        kind: OperationKind,
        series: impl Into<String>,
        root: Rank,
        payload: Option<Bytes>,
    ) -> Result<Operation> {
        let series = series.into();
        if series.len() > MAX_SERIES_LEN {
            return Err(RallyError::SeriesTooLong {
                len: series.len(),
                max: MAX_SERIES_LEN,
            });
        }
        if let Some(p) = &payload
            && p.len() > self.max_frame_bytes
        {
            return Err(RallyError::PayloadTooLarge {
                len: p.len(),
                max: self.max_frame_bytes,
            });
        }
        kind.check_contribution(self.rank, root, self.size, payload.is_some())
            .map_err(|reason| RallyError::InvalidContribution { kind, reason })?;

        let outbound = self
            .outbound
            .lock()
            .map_err(|_| RallyError::LockPoisoned("outbound"))?
            .clone()
            .ok_or(RallyError::ContextClosed)?;

        let key = SeriesKey::new(kind, series);
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = lock_pending(&self.pending)?;
            if let Some(failure) = &pending.closed {
                return Err(failure.clone().into_error(&key));
            }
            if pending.ops.contains_key(&key) {
                return Err(RallyError::SeriesReuse {
                    kind,
                    series: key.series,
                });
            }
            pending.ops.insert(key.clone(), tx);
        }

        let msg = RallyMessage::Submit {
            key: key.clone(),
            root,
            payload,
        };
        if let Err(e) = outbound.send(msg) {
            lock_pending(&self.pending)?.ops.remove(&key);
            return Err(e);
        }
        tracing::debug!(rank = self.rank, series = %key, root, "submitted");
        Ok(Operation::new(key, self.rank, rx))
    }

    /// Leave the group gracefully.
    ///
    /// Sends SHUTDOWN, half-closes the connection and drains inbound frames
    /// until the chief closes or `shutdown_timeout` elapses. Operations still
    /// pending afterwards fail with `ConnectionLost`. Calling it again is a
    /// no-op.
    pub async fn shutdown(&self) -> Result<()> {
        let outbound = self
            .outbound
            .lock()
            .map_err(|_| RallyError::LockPoisoned("outbound"))?
            .take();
        let Some(outbound) = outbound else {
            return Ok(());
        };
        self.stop.cancel();
        let _ = outbound.send(RallyMessage::Shutdown);
        drop(outbound);

        let tasks = self
            .tasks
            .lock()
            .map_err(|_| RallyError::LockPoisoned("worker tasks"))?
            .take();
        if let Some(Tasks {
            mut reader,
            mut writer,
        }) = tasks
        {
            if tokio::time::timeout(self.shutdown_timeout, &mut writer)
                .await
                .is_err()
            {
                writer.abort();
            }
            if tokio::time::timeout(self.shutdown_timeout, &mut reader)
                .await
                .is_err()
            {
                tracing::warn!(
                    rank = self.rank,
                    timeout_ms = self.shutdown_timeout.as_millis() as u64,
                    "chief did not close the connection in time"
                );
                reader.abort();
            }
        }

        lock_pending(&self.pending)?.close(Failure::ConnectionLost {
            reason: "context exited before the collective completed".into(),
        });
        tracing::info!(rank = self.rank, "left the group");
        Ok(())
    }

    /// Number of submitted operations still waiting on the chief.
    pub fn pending_operations(&self) -> usize {
        self.pending.lock().map(|p| p.ops.len()).unwrap_or(0)
    }
}

impl Drop for WorkerClient {
    fn drop(&mut self) {
        self.stop.cancel();
        if let Ok(mut tasks) = self.tasks.lock()
            && let Some(tasks) = tasks.take()
        {
            tasks.reader.abort();
            tasks.writer.abort();
        }
        if let Ok(mut pending) = self.pending.lock() {
            pending.close(Failure::ConnectionLost {
                reason: "worker client dropped".into(),
            });
        }
    }
}

/// Route inbound frames to their pending operations until the connection
/// ends, then fail whatever is left.
async fn demux(mut reader: FrameReader, pending: Arc<Mutex<Pending>>, rank: Rank) {
    let failure = loop {
        let (key, resolution) = match reader.next().await {
            Some(Ok(RallyMessage::Deliver { key, outcome })) => (key, Ok(outcome)),
            Some(Ok(RallyMessage::Fail { key, failure })) => (key, Err(failure)),
            Some(Ok(RallyMessage::Reject { failure })) => {
                tracing::warn!(rank, %failure, "chief dropped the connection");
                break failure;
            }
            Some(Ok(other)) => {
                tracing::warn!(rank, frame = other.name(), "unexpected frame from chief");
                continue;
            }
            Some(Err(e)) => {
                tracing::warn!(rank, error = %e, "malformed frame from chief");
                break Failure::ConnectionLost {
                    reason: format!("malformed frame from chief: {e}"),
                };
            }
            None => {
                break Failure::ConnectionLost {
                    reason: "chief closed the connection".into(),
                };
            }
        };
        let Ok(mut guard) = pending.lock() else {
            tracing::error!(rank, "pending operations lock poisoned");
            return;
        };
        match guard.ops.remove(&key) {
            Some(tx) => {
                tracing::debug!(rank, series = %key, ok = resolution.is_ok(), "resolved");
                // the caller may have dropped its Operation
                let _ = tx.send(resolution);
            }
            None => tracing::warn!(rank, series = %key, "result for an unknown operation"),
        }
    };
    if let Ok(mut guard) = pending.lock() {
        if !guard.ops.is_empty() {
            tracing::debug!(rank, pending = guard.ops.len(), %failure, "failing pending operations");
        }
        guard.close(failure);
    }
}

async fn keepalive(outbound: Outbound, period: Duration, stop: CancellationToken) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // the first tick fires immediately
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = ticker.tick() => {
                if outbound.send(RallyMessage::Keepalive).is_err() {
                    break;
                }
            }
        }
    }
}
