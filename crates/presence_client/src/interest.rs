//! Coalescing of presence interest into debounced resolution cycles.
//!
//! [`InterestTracker`] holds no clock and does no I/O. The facade arms a
//! [`crate::timer::DebounceTimer`] with the delay it returns and calls
//! [`InterestTracker::begin_cycle`] when that timer fires.

use std::{collections::BTreeSet, time::Duration};

use shared::{domain::UserId, protocol::SubscriptionUpdate};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Scheduled,
    Resolving,
}

/// Snapshot taken when the debounce timer fires.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cycle {
    /// Identifies this cycle to [`InterestTracker::finish_cycle`].
    pub seq: u64,
    pub added: Vec<UserId>,
    pub removed: Vec<UserId>,
    /// Delay that armed this cycle; a failed fetch backs off from it.
    pub delay: Duration,
}

impl Cycle {
    pub fn subscription_update(&self) -> SubscriptionUpdate {
        SubscriptionUpdate::new(self.added.clone(), self.removed.clone())
    }

    pub fn needs_fetch(&self) -> bool {
        !self.added.is_empty()
    }
}

#[derive(Debug)]
pub struct InterestTracker {
    pending_fetch: BTreeSet<UserId>,
    pending_removal: BTreeSet<UserId>,
    scheduled: Option<Duration>,
    in_flight: BTreeSet<u64>,
    next_seq: u64,
    base_delay: Duration,
    max_backoff: Duration,
}

impl InterestTracker {
    pub fn new(base_delay: Duration, max_backoff: Duration) -> Self {
        Self {
            pending_fetch: BTreeSet::new(),
            pending_removal: BTreeSet::new(),
            scheduled: None,
            in_flight: BTreeSet::new(),
            next_seq: 0,
            base_delay,
            max_backoff: max_backoff.max(base_delay),
        }
    }

    /// Queues `id` for resolution and returns the delay to (re)arm the timer with.
    pub fn request_interest(&mut self, id: UserId) -> Duration {
        self.pending_removal.remove(&id);
        self.pending_fetch.insert(id);
        self.schedule(self.base_delay)
    }

    /// Queues `id` for release and returns the delay to (re)arm the timer with.
    pub fn request_release(&mut self, id: UserId) -> Duration {
        self.pending_fetch.remove(&id);
        self.pending_removal.insert(id);
        self.schedule(self.base_delay)
    }

    /// Drops `id` from the fetch queue once a record for it arrived.
    pub fn mark_resolved(&mut self, id: &UserId) -> bool {
        self.pending_fetch.remove(id)
    }

    pub fn begin_cycle(&mut self, delay: Duration) -> Cycle {
        self.scheduled = None;
        let added: Vec<UserId> = std::mem::take(&mut self.pending_fetch).into_iter().collect();
        let removed: Vec<UserId> = std::mem::take(&mut self.pending_removal)
            .into_iter()
            .collect();
        let seq = self.next_seq;
        self.next_seq += 1;
        if !added.is_empty() {
            self.in_flight.insert(seq);
        }
        Cycle {
            seq,
            added,
            removed,
            delay,
        }
    }

    /// Marks the fetch of cycle `seq` as done. Finishing a cycle twice is a no-op.
    pub fn finish_cycle(&mut self, seq: u64) {
        self.in_flight.remove(&seq);
    }

    /// Ends a failed cycle: puts `unresolved` back in the fetch queue and
    /// returns the backoff delay to re-arm the timer with. Identifiers
    /// released while the fetch was in flight stay released.
    pub fn requeue(
        &mut self,
        seq: u64,
        unresolved: impl IntoIterator<Item = UserId>,
        failed_delay: Duration,
    ) -> Duration {
        self.finish_cycle(seq);
        for id in unresolved {
            if !self.pending_removal.contains(&id) {
                self.pending_fetch.insert(id);
            }
        }
        let next = self.next_backoff(failed_delay);
        self.schedule(next)
    }

    pub fn next_backoff(&self, delay: Duration) -> Duration {
        delay.saturating_mul(2).min(self.max_backoff)
    }

    pub fn phase(&self) -> Phase {
        if self.scheduled.is_some() {
            Phase::Scheduled
        } else if !self.in_flight.is_empty() {
            Phase::Resolving
        } else {
            Phase::Idle
        }
    }

    pub fn scheduled_delay(&self) -> Option<Duration> {
        self.scheduled
    }

    pub fn pending_fetch(&self) -> impl Iterator<Item = &UserId> {
        self.pending_fetch.iter()
    }

    pub fn pending_removal(&self) -> impl Iterator<Item = &UserId> {
        self.pending_removal.iter()
    }

    fn schedule(&mut self, delay: Duration) -> Duration {
        self.scheduled = Some(delay);
        delay
    }
}

#[cfg(test)]
#[path = "tests/interest_tests.rs"]
mod tests;
