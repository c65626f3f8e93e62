use crate::cluster::tracker::{Progress, SeriesTracker};
use crate::config::RallyConfig;
use crate::error::{RallyError, Result};
use crate::protocol::RallyMessage;
use crate::transport::{FrameReader, Outbound, TransportListener, split_framed, spawn_writer};
use crate::types::{Failure, Outcome, Rank, SeriesKey};
use bytes::Bytes;
use futures::StreamExt;
use std::collections::{BTreeSet, HashMap};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

/// The rendezvous service hosted by the chief.
///
/// Accepts one connection per rank, routes every SUBMIT to the
/// [`SeriesTracker`] for its key and pushes results back as trackers
/// complete. Each series is locked on its own, so traffic for different
/// keys is processed in parallel.
pub struct Coordinator {
    listener: TransportListener,
    size: u32,
    config: RallyConfig,
}

impl Coordinator {
    /// Bind the coordinator for a group of `size` ranks.
    pub async fn bind(host: &str, service: &str, size: u32, config: RallyConfig) -> Result<Self> {
        if size == 0 {
            return Err(RallyError::InvalidGroup("size must be positive".into()));
        }
        let listener = TransportListener::bind(host, service).await?;
        tracing::info!(addr = %listener.local_addr(), size, "coordinator listening");
        Ok(Self {
            listener,
            size,
            config,
        })
    }

    /// Get the local address the coordinator is listening on.
    pub fn local_addr(&self) -> SocketAddr {
        self.listener.local_addr()
    }

    /// Start serving in the background.
    pub fn spawn(self) -> CoordinatorHandle {
        let (count_tx, _) = watch::channel(0usize);
        let shared = Arc::new(Shared {
            size: self.size,
            config: self.config,
            trackers: Mutex::new(HashMap::new()),
            sessions: Mutex::new(HashMap::new()),
            departed: Mutex::new(BTreeSet::new()),
            session_count: count_tx,
            closing: AtomicBool::new(false),
            next_generation: AtomicU64::new(0),
            cancel: CancellationToken::new(),
        });
        let local_addr = self.listener.local_addr();
        let task = tokio::spawn(accept_loop(Arc::clone(&shared), self.listener));
        CoordinatorHandle {
            shared,
            local_addr,
            task: Some(task),
        }
    }
}

/// Control handle for a running [`Coordinator`].
///
/// Dropping the handle without calling [`shutdown`](Self::shutdown) stops
/// the coordinator abruptly.
pub struct CoordinatorHandle {
    shared: Arc<Shared>,
    local_addr: SocketAddr,
    task: Option<JoinHandle<()>>,
}

impl CoordinatorHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Ranks with a live, registered connection, in ascending order.
    pub fn connected_ranks(&self) -> Vec<Rank> {
        let Ok(sessions) = self.shared.sessions.lock() else {
            return Vec::new();
        };
        let mut ranks: Vec<Rank> = sessions.keys().copied().collect();
        ranks.sort_unstable();
        ranks
    }

    /// Number of series the coordinator still tracks.
    pub fn outstanding_series(&self) -> usize {
        self.shared.trackers.lock().map(|t| t.len()).unwrap_or(0)
    }

    /// Tear the coordinator down.
    ///
    /// Waits up to `grace` for every rank to leave, then fails all
    /// unfinished series with `CoordinatorShutdown`, notifies the ranks still
    /// waiting on them and closes every connection.
    pub async fn shutdown(mut self, grace: Duration) -> Result<()> {
        self.shared.closing.store(true, Ordering::SeqCst);

        let mut count = self.shared.session_count.subscribe();
        if tokio::time::timeout(grace, count.wait_for(|n| *n == 0))
            .await
            .is_err()
        {
            tracing::warn!(
                remaining = ?self.connected_ranks(),
                grace_ms = grace.as_millis() as u64,
                "ranks still connected after shutdown grace"
            );
        }

        let failed = self.shared.fail_all(Failure::CoordinatorShutdown)?;
        if failed > 0 {
            tracing::warn!(failed, "unfinished series failed by coordinator shutdown");
        }
        self.shared.cancel.cancel();
        if let Some(task) = self.task.take() {
            task.await
                .map_err(|e| RallyError::transport_with_source("coordinator task", e))?;
        }
        tracing::info!(addr = %self.local_addr, "coordinator stopped");
        Ok(())
    }
}

impl Drop for CoordinatorHandle {
    fn drop(&mut self) {
        self.shared.cancel.cancel();
    }
}

struct Session {
    generation: u64,
    outbound: Outbound,
}

/// What the read loop does after handling a frame.
enum Flow {
    Continue,
    Close,
}

enum Departure {
    Graceful,
    Abrupt,
    Teardown,
}

struct Shared {
    size: u32,
    config: RallyConfig,
    trackers: Mutex<HashMap<SeriesKey, Arc<Mutex<SeriesTracker>>>>,
    /// Lock order: a tracker first, then `sessions` or `trackers`, then
    /// `departed`.
    sessions: Mutex<HashMap<Rank, Session>>,
    /// Ranks that left and have not registered again.
    departed: Mutex<BTreeSet<Rank>>,
    session_count: watch::Sender<usize>,
    closing: AtomicBool,
    next_generation: AtomicU64,
    cancel: CancellationToken,
}

fn lock<'a, T>(m: &'a Mutex<T>, what: &'static str) -> Result<MutexGuard<'a, T>> {
    m.lock().map_err(|_| RallyError::LockPoisoned(what))
}

async fn accept_loop(shared: Arc<Shared>, listener: TransportListener) {
    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            _ = shared.cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    tracing::debug!(%peer, "incoming connection");
                    connections.spawn(Arc::clone(&shared).serve(stream, peer));
                }
                Err(e) => {
                    tracing::warn!(error = %e, "accept failed");
                }
            },
            Some(joined) = connections.join_next(), if !connections.is_empty() => {
                if let Err(e) = joined {
                    tracing::error!(error = %e, "connection task panicked");
                }
            }
        }
    }
    drop(listener);
    while connections.join_next().await.is_some() {}
}

impl Shared {
    async fn serve(self: Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        let (mut reader, writer) = split_framed(stream, self.config.max_frame_bytes);
        let (outbound, writer_task) = spawn_writer(writer, peer.to_string());

        let Some((rank, generation)) = self.register(&mut reader, &outbound, peer).await else {
            drop(outbound);
            // let the REJECT go out before the socket closes
            let _ = tokio::time::timeout(self.config.handshake_timeout, writer_task).await;
            return;
        };
        self.flush_queued(rank, &outbound);

        let departure = self.read_loop(rank, &mut reader, &outbound).await;
        drop(outbound);

        self.remove_session(rank, generation, !matches!(departure, Departure::Teardown));
        match departure {
            Departure::Graceful => tracing::info!(rank, %peer, "rank left"),
            Departure::Abrupt => tracing::warn!(rank, %peer, "rank disconnected abruptly"),
            Departure::Teardown => tracing::debug!(rank, "connection closed by teardown"),
        }
        if !matches!(departure, Departure::Teardown)
            && let Err(e) = self.depart(rank, matches!(departure, Departure::Graceful))
        {
            tracing::error!(rank, error = %e, "failed to process departure");
        }
        let _ = tokio::time::timeout(self.config.shutdown_timeout, writer_task).await;
    }

    /// Run the REGISTER/ACCEPT handshake. `None` means the connection was
    /// refused and must be closed.
    async fn register(
        &self,
        reader: &mut FrameReader,
        outbound: &Outbound,
        peer: SocketAddr,
    ) -> Option<(Rank, u64)> {
        let first = tokio::select! {
            _ = self.cancel.cancelled() => return None,
            first = tokio::time::timeout(self.config.handshake_timeout, reader.next()) => first,
        };
        let (rank, size) = match first {
            Ok(Some(Ok(RallyMessage::Register { rank, size }))) => (rank, size),
            Ok(Some(Ok(other))) => {
                tracing::warn!(%peer, frame = other.name(), "expected REGISTER");
                let _ = outbound.send(reject_protocol(format!(
                    "expected REGISTER, got {}",
                    other.name()
                )));
                return None;
            }
            Ok(Some(Err(e))) => {
                tracing::warn!(%peer, error = %e, "malformed registration");
                let _ = outbound.send(reject_protocol(e.to_string()));
                return None;
            }
            Ok(None) => {
                tracing::debug!(%peer, "closed before registering");
                return None;
            }
            Err(_) => {
                tracing::warn!(%peer, "registration timed out");
                return None;
            }
        };

        let refusal = if size != self.size {
            Some(Failure::GroupMismatch {
                expected: self.size,
            })
        } else if rank >= self.size {
            Some(Failure::Protocol {
                reason: format!("rank {rank} outside a group of size {}", self.size),
            })
        } else if self.closing.load(Ordering::SeqCst) {
            Some(Failure::CoordinatorShutdown)
        } else {
            None
        };
        if let Some(failure) = refusal {
            tracing::warn!(rank, size, %peer, %failure, "registration refused");
            let _ = outbound.send(RallyMessage::Reject { failure });
            return None;
        }

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let mut sessions = match lock(&self.sessions, "sessions") {
            Ok(s) => s,
            Err(e) => {
                tracing::error!(error = %e, "cannot register rank");
                return None;
            }
        };
        if sessions.contains_key(&rank) {
            drop(sessions);
            tracing::warn!(rank, %peer, "duplicate registration for a live rank");
            let _ = outbound.send(reject_protocol(format!(
                "rank {rank} is already registered"
            )));
            return None;
        }
        // ACCEPT is queued under the sessions lock so it precedes any DELIVER.
        if outbound
            .send(RallyMessage::Accept {
                rank,
                size: self.size,
            })
            .is_err()
        {
            return None;
        }
        match lock(&self.departed, "departed ranks") {
            Ok(mut departed) => {
                departed.remove(&rank);
            }
            Err(e) => tracing::error!(rank, error = %e, "cannot clear departure"),
        }
        sessions.insert(
            rank,
            Session {
                generation,
                outbound: outbound.clone(),
            },
        );
        self.session_count.send_replace(sessions.len());
        let connected = sessions.len();
        drop(sessions);

        tracing::info!(rank, %peer, connected, size = self.size, "rank registered");
        Some((rank, generation))
    }

    async fn read_loop(
        &self,
        rank: Rank,
        reader: &mut FrameReader,
        outbound: &Outbound,
    ) -> Departure {
        loop {
            let next = tokio::select! {
                _ = self.cancel.cancelled() => return Departure::Teardown,
                next = next_frame(reader, self.config.liveness_timeout) => next,
            };
            let frame = match next {
                Inbound::Frame(frame) => frame,
                Inbound::Malformed(e) => {
                    tracing::warn!(rank, error = %e, "malformed frame, closing connection");
                    let _ = outbound.send(reject_protocol(e.to_string()));
                    return Departure::Abrupt;
                }
                Inbound::Closed => return Departure::Abrupt,
                Inbound::Idle => {
                    tracing::warn!(rank, "liveness timeout, closing connection");
                    return Departure::Abrupt;
                }
            };
            match frame {
                RallyMessage::Submit { key, root, payload } => {
                    match self.handle_submit(rank, key, root, payload, outbound) {
                        Ok(Flow::Continue) => {}
                        Ok(Flow::Close) => return Departure::Abrupt,
                        Err(e) => {
                            tracing::error!(rank, error = %e, "submit handling failed");
                            return Departure::Abrupt;
                        }
                    }
                }
                RallyMessage::Shutdown => return Departure::Graceful,
                RallyMessage::Keepalive => tracing::trace!(rank, "keepalive"),
                other => {
                    tracing::warn!(rank, frame = other.name(), "unexpected frame from worker");
                    let _ = outbound.send(reject_protocol(format!(
                        "unexpected {} frame",
                        other.name()
                    )));
                    return Departure::Abrupt;
                }
            }
        }
    }

    fn tracker_for(&self, key: &SeriesKey) -> Result<Arc<Mutex<SeriesTracker>>> {
        let mut map = lock(&self.trackers, "trackers")?;
        if let Some(t) = map.get(key) {
            return Ok(Arc::clone(t));
        }
        let mut fresh = SeriesTracker::new(key.clone(), self.size);
        // a rank that is gone can never contribute
        for &gone in lock(&self.departed, "departed ranks")?.iter() {
            fresh.depart(gone, true);
        }
        match fresh.failure() {
            Some(failure) => tracing::debug!(series = %key, %failure, "tracker created failed"),
            None => tracing::debug!(series = %key, "tracker created"),
        }
        let tracker = Arc::new(Mutex::new(fresh));
        map.insert(key.clone(), Arc::clone(&tracker));
        Ok(tracker)
    }

    fn trackers_snapshot(&self) -> Result<Vec<Arc<Mutex<SeriesTracker>>>> {
        Ok(lock(&self.trackers, "trackers")?.values().cloned().collect())
    }

    fn handle_submit(
        &self,
        rank: Rank,
        key: SeriesKey,
        root: Rank,
        payload: Option<Bytes>,
        outbound: &Outbound,
    ) -> Result<Flow> {
        if self.closing.load(Ordering::SeqCst) {
            let _ = outbound.send(self.fail_frame(key, Failure::CoordinatorShutdown));
            return Ok(Flow::Continue);
        }
        loop {
            let tracker = self.tracker_for(&key)?;
            let mut t = lock(&tracker, "tracker")?;
            if t.is_retired() {
                // reaped between lookup and lock
                continue;
            }
            if t.is_settled_for(rank) {
                tracing::debug!(
                    rank,
                    series = %key,
                    dropped = ?t.pending_deliveries(),
                    "previous instance finished, dropping results queued for absent ranks"
                );
                t.retire();
                lock(&self.trackers, "trackers")?.remove(&key);
                continue;
            }
            let flow = match t.contribute(rank, root, payload.clone()) {
                Ok(Progress::Pending { missing }) => {
                    tracing::debug!(rank, series = %key, missing, "contribution recorded");
                    Flow::Continue
                }
                Ok(Progress::Ready) => {
                    tracing::debug!(series = %key, "series ready");
                    self.deliver_ready(&mut t)?;
                    Flow::Continue
                }
                Err(failure) => {
                    let fatal = matches!(failure, Failure::Protocol { .. });
                    if fatal {
                        tracing::warn!(rank, series = %key, %failure, "rejected contribution");
                    } else {
                        tracing::debug!(rank, series = %key, %failure, "contribution refused");
                    }
                    let _ = outbound.send(self.fail_frame(key.clone(), failure));
                    if fatal { Flow::Close } else { Flow::Continue }
                }
            };
            self.reap_if_drained(&mut t)?;
            return Ok(flow);
        }
    }

    /// Push a Ready tracker's results to every connected rank still owed one.
    fn deliver_ready(&self, t: &mut SeriesTracker) -> Result<()> {
        let sessions = lock(&self.sessions, "sessions")?;
        for r in t.pending_deliveries() {
            let (Some(session), Some(outcome)) = (sessions.get(&r), t.delivery_for(r)) else {
                continue;
            };
            let msg = self.delivery_frame(t.key(), outcome);
            if session.outbound.send(msg).is_ok() {
                t.mark_delivered(r);
            }
        }
        Ok(())
    }

    /// Send results that became Ready while `rank` was not connected.
    fn flush_queued(&self, rank: Rank, outbound: &Outbound) {
        let trackers = match self.trackers_snapshot() {
            Ok(t) => t,
            Err(e) => {
                tracing::error!(rank, error = %e, "cannot flush queued results");
                return;
            }
        };
        for tracker in trackers {
            let Ok(mut t) = lock(&tracker, "tracker") else {
                continue;
            };
            if t.is_retired() {
                continue;
            }
            if let Some(outcome) = t.delivery_for(rank) {
                tracing::debug!(rank, series = %t.key(), "delivering queued result");
                let msg = self.delivery_frame(t.key(), outcome);
                if outbound.send(msg).is_ok() {
                    t.mark_delivered(rank);
                }
            }
            if let Err(e) = self.reap_if_drained(&mut t) {
                tracing::error!(error = %e, "reap failed");
            }
        }
    }

    /// Send the tracker's failure to contributors still waiting on it.
    fn notify_failure(&self, t: &mut SeriesTracker) -> Result<()> {
        let Some(failure) = t.failure().cloned() else {
            return Ok(());
        };
        let targets = t.take_failure_targets();
        let sessions = lock(&self.sessions, "sessions")?;
        for r in targets {
            if let Some(session) = sessions.get(&r) {
                let _ = session
                    .outbound
                    .send(self.fail_frame(t.key().clone(), failure.clone()));
            }
        }
        Ok(())
    }

    /// DELIVER `outcome`, or FAIL when the encoded result would not fit in
    /// one frame.
    fn delivery_frame(&self, key: &SeriesKey, outcome: Outcome) -> RallyMessage {
        let msg = RallyMessage::Deliver {
            key: key.clone(),
            outcome,
        };
        let len = msg.body_len();
        let max = self.config.max_frame_bytes;
        if len <= max {
            return msg;
        }
        tracing::warn!(series = %key, len, max, "result does not fit in one frame");
        self.fail_frame(
            key.clone(),
            Failure::Protocol {
                reason: format!("result of {len} bytes exceeds max_frame_bytes {max}"),
            },
        )
    }

    fn fail_frame(&self, key: SeriesKey, failure: Failure) -> RallyMessage {
        RallyMessage::Fail {
            key,
            failure: failure.fit_reason(self.config.max_frame_bytes),
        }
    }

    fn reap_if_drained(&self, t: &mut SeriesTracker) -> Result<()> {
        if !t.is_drained() {
            return Ok(());
        }
        t.retire();
        lock(&self.trackers, "trackers")?.remove(t.key());
        tracing::debug!(series = %t.key(), "tracker reaped");
        Ok(())
    }

    fn depart(&self, rank: Rank, graceful: bool) -> Result<()> {
        for tracker in self.trackers_snapshot()? {
            let mut t = lock(&tracker, "tracker")?;
            if t.is_retired() {
                continue;
            }
            if t.depart(rank, graceful) {
                tracing::debug!(rank, series = %t.key(), "series failed by departure");
                self.notify_failure(&mut t)?;
            }
            self.reap_if_drained(&mut t)?;
        }
        Ok(())
    }

    /// Fail every Collecting tracker and notify its contributors. Returns
    /// how many were failed.
    fn fail_all(&self, failure: Failure) -> Result<usize> {
        let mut failed = 0;
        for tracker in self.trackers_snapshot()? {
            let mut t = lock(&tracker, "tracker")?;
            if t.is_retired() {
                continue;
            }
            if t.fail(failure.clone()) {
                failed += 1;
                self.notify_failure(&mut t)?;
            }
        }
        Ok(failed)
    }

    /// Drop `rank`'s session if it is still the one with `generation`.
    /// A rank that `departed` stays recorded until it registers again.
    fn remove_session(&self, rank: Rank, generation: u64, departed: bool) {
        let Ok(mut sessions) = lock(&self.sessions, "sessions") else {
            return;
        };
        if sessions.get(&rank).is_some_and(|s| s.generation == generation) {
            sessions.remove(&rank);
            self.session_count.send_replace(sessions.len());
            if departed && let Ok(mut gone) = lock(&self.departed, "departed ranks") {
                gone.insert(rank);
            }
        }
    }
}

fn reject_protocol(reason: String) -> RallyMessage {
    RallyMessage::Reject {
        failure: Failure::Protocol { reason },
    }
}

enum Inbound {
    Frame(RallyMessage),
    Malformed(RallyError),
    Closed,
    Idle,
}

async fn next_frame(reader: &mut FrameReader, liveness: Option<Duration>) -> Inbound {
    let next = match liveness {
        Some(limit) => match tokio::time::timeout(limit, reader.next()).await {
            Ok(next) => next,
            Err(_) => return Inbound::Idle,
        },
        None => reader.next().await,
    };
    match next {
        Some(Ok(frame)) => Inbound::Frame(frame),
        Some(Err(e)) => Inbound::Malformed(e),
        None => Inbound::Closed,
    }
}
