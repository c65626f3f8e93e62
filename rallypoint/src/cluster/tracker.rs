//! Per-series state machine owned by the coordinator.
//!
//! A tracker collects one contribution per rank for a single [`SeriesKey`],
//! computes every rank's [`Outcome`] once all `size` contributions are in,
//! and remembers which ranks still have to be told about the result (or the
//! failure). The coordinator reaps it once [`is_drained`](SeriesTracker::is_drained).

use std::collections::BTreeSet;

use bytes::Bytes;

use crate::types::{Failure, OperationKind, Outcome, Rank, SeriesKey};

#[derive(Debug, Clone)]
enum Slot {
    Missing,
    Present(Bytes),
    Absent,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackerState {
    /// Waiting for contributions.
    Collecting,
    /// Every rank contributed; results are computed.
    Ready,
    /// Can never complete.
    Failed(Failure),
}

/// What a successful contribution did to the tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    /// Still waiting on `missing` ranks.
    Pending { missing: u32 },
    /// This contribution completed the collective.
    Ready,
}

#[derive(Debug)]
pub struct SeriesTracker {
    key: SeriesKey,
    size: u32,
    root: Option<Rank>,
    slots: Vec<Slot>,
    received: u32,
    results: Vec<Outcome>,
    state: TrackerState,
    /// Ranks that still have to receive a DELIVER or FAIL for this series.
    awaiting: BTreeSet<Rank>,
    retired: bool,
}

impl SeriesTracker {
    pub fn new(key: SeriesKey, size: u32) -> Self {
        Self {
            key,
            size,
            root: None,
            slots: vec![Slot::Missing; size as usize],
            received: 0,
            results: Vec::new(),
            state: TrackerState::Collecting,
            awaiting: (0..size).collect(),
            retired: false,
        }
    }

    pub fn key(&self) -> &SeriesKey {
        &self.key
    }

    pub fn state(&self) -> &TrackerState {
        &self.state
    }

    pub fn received(&self) -> u32 {
        self.received
    }

    /// Record `rank`'s contribution.
    ///
    /// On error the returned failure is meant for `rank` alone. A failed
    /// tracker answers a rank it never heard from with its own failure, and
    /// stops expecting that rank.
    pub fn contribute(
        &mut self,
        rank: Rank,
        root: Rank,
        payload: Option<Bytes>,
    ) -> Result<Progress, Failure> {
        if rank >= self.size {
            return Err(Failure::Protocol {
                reason: format!("rank {rank} outside a group of size {}", self.size),
            });
        }
        match &self.state {
            TrackerState::Failed(failure) => {
                let failure = failure.clone();
                if self.has_no_contribution(rank) && self.awaiting.remove(&rank) {
                    return Err(failure);
                }
                return Err(Failure::SeriesReuse);
            }
            TrackerState::Ready => return Err(Failure::SeriesReuse),
            TrackerState::Collecting => {}
        }
        if !self.has_no_contribution(rank) {
            return Err(Failure::SeriesReuse);
        }

        let kind = self.key.kind;
        if kind.uses_root()
            && let Some(expected) = self.root
            && expected != root
        {
            return Err(Failure::Protocol {
                reason: format!(
                    "rank {rank} named root {root} for {}, earlier contributions named {expected}",
                    self.key
                ),
            });
        }
        kind.check_contribution(rank, root, self.size, payload.is_some())
            .map_err(|reason| Failure::Protocol { reason })?;

        if kind.uses_root() {
            self.root = Some(root);
        }
        self.slots[rank as usize] = match payload {
            Some(p) => Slot::Present(p),
            None => Slot::Absent,
        };
        self.received += 1;

        if self.received < self.size {
            return Ok(Progress::Pending {
                missing: self.size - self.received,
            });
        }
        self.results = self.compute_results();
        // payloads now live in `results`
        self.slots.iter_mut().for_each(|s| {
            if matches!(s, Slot::Present(_)) {
                *s = Slot::Absent;
            }
        });
        self.state = TrackerState::Ready;
        Ok(Progress::Ready)
    }

    fn has_no_contribution(&self, rank: Rank) -> bool {
        matches!(self.slots[rank as usize], Slot::Missing)
    }

    fn compute_results(&self) -> Vec<Outcome> {
        let ordered = || -> Vec<Bytes> {
            self.slots
                .iter()
                .map(|s| match s {
                    Slot::Present(p) => p.clone(),
                    // shape checks guarantee every slot is present here
                    Slot::Missing | Slot::Absent => Bytes::new(),
                })
                .collect()
        };
        let root = self.root.unwrap_or(0);
        match self.key.kind {
            OperationKind::Gather => {
                let values = ordered();
                (0..self.size)
                    .map(|r| {
                        if r == root {
                            Outcome::Values(values.clone())
                        } else {
                            Outcome::Absent
                        }
                    })
                    .collect()
            }
            OperationKind::Broadcast => {
                let value = match &self.slots[root as usize] {
                    Slot::Present(p) => p.clone(),
                    Slot::Missing | Slot::Absent => Bytes::new(),
                };
                (0..self.size).map(|_| Outcome::Value(value.clone())).collect()
            }
            OperationKind::AllGather => {
                let values = ordered();
                (0..self.size).map(|_| Outcome::Values(values.clone())).collect()
            }
        }
    }

    /// The result for `rank`, if the tracker is Ready and still owes it one.
    pub fn delivery_for(&self, rank: Rank) -> Option<Outcome> {
        if self.state != TrackerState::Ready || !self.awaiting.contains(&rank) {
            return None;
        }
        self.results.get(rank as usize).cloned()
    }

    /// Ranks still owed a result, if Ready.
    pub fn pending_deliveries(&self) -> Vec<Rank> {
        if self.state != TrackerState::Ready {
            return Vec::new();
        }
        self.awaiting.iter().copied().collect()
    }

    pub fn mark_delivered(&mut self, rank: Rank) {
        self.awaiting.remove(&rank);
    }

    /// Move a Collecting tracker to Failed. No-op otherwise.
    pub fn fail(&mut self, failure: Failure) -> bool {
        if self.state != TrackerState::Collecting {
            return false;
        }
        tracing::debug!(series = %self.key, %failure, received = self.received, "tracker failed");
        self.state = TrackerState::Failed(failure);
        true
    }

    /// After [`fail`](Self::fail): the contributors that are waiting on this
    /// series and must be sent the failure now. They are no longer awaited.
    pub fn take_failure_targets(&mut self) -> Vec<Rank> {
        if !matches!(self.state, TrackerState::Failed(_)) {
            return Vec::new();
        }
        let targets: Vec<Rank> = self
            .awaiting
            .iter()
            .copied()
            .filter(|&r| !matches!(self.slots[r as usize], Slot::Missing))
            .collect();
        for r in &targets {
            self.awaiting.remove(r);
        }
        targets
    }

    pub fn failure(&self) -> Option<&Failure> {
        match &self.state {
            TrackerState::Failed(f) => Some(f),
            _ => None,
        }
    }

    /// React to `rank` leaving the group.
    ///
    /// A Collecting tracker that still lacks `rank` fails with
    /// `PeerDisconnected`. A graceful leaver is no longer owed anything; an
    /// abrupt one keeps a Ready result queued in case it reconnects. The
    /// queued result goes out on re-registration over the same key, so it
    /// only resolves something if the reconnecting client still holds that
    /// operation; a fresh client drops it as unknown. The queue lasts until
    /// the rank returns or a connected rank submits the key again (see
    /// [`is_settled_for`](Self::is_settled_for)).
    /// Returns whether this call failed the tracker.
    pub fn depart(&mut self, rank: Rank, graceful: bool) -> bool {
        if rank >= self.size {
            return false;
        }
        let mut failed = false;
        if self.state == TrackerState::Collecting
            && matches!(self.slots[rank as usize], Slot::Missing)
        {
            failed = self.fail(Failure::PeerDisconnected { rank });
        }
        match self.state {
            TrackerState::Ready if !graceful => {}
            TrackerState::Collecting if !graceful => {}
            _ => {
                self.awaiting.remove(&rank);
            }
        }
        failed
    }

    /// Finished, and `rank` already has its outcome. Whatever is still owed
    /// belongs to ranks that are not connected, so a new SUBMIT from `rank`
    /// starts the next instance of the key.
    pub fn is_settled_for(&self, rank: Rank) -> bool {
        self.state != TrackerState::Collecting && !self.awaiting.contains(&rank)
    }

    /// Finished and owes nothing to anyone.
    pub fn is_drained(&self) -> bool {
        self.state != TrackerState::Collecting && self.awaiting.is_empty()
    }

    pub(crate) fn is_retired(&self) -> bool {
        self.retired
    }

    /// Mark as removed from the coordinator's map. Anyone who locked the
    /// tracker before removal must look the key up again.
    pub(crate) fn retire(&mut self) {
        self.retired = true;
    }
}
