//! Sync Loop
//!
//! Periodic scheduler that flushes locally applied changes still waiting
//! to be broadcast, in batches, retrying failed sends a bounded number of
//! times.
//!
//! The loop holds no timer of its own: it tracks the next deadline and the
//! host polls it (see [`SyncDriver`](crate::SyncDriver)), so every tick runs
//! on the same logical thread as the inbound handlers.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::config::SyncConfig;
use crate::protocol::{EventKind, EventPayload, SyncEvent};

/// A locally applied change awaiting broadcast
#[derive(Debug, Clone, PartialEq)]
pub struct PendingChange {
    pub event: SyncEvent,
    /// Failed send attempts so far
    pub attempts: u32,
}

impl PendingChange {
    pub fn new(event: SyncEvent) -> Self {
        Self { event, attempts: 0 }
    }
}

/// Batched flush/retry scheduler
#[derive(Debug)]
pub struct SyncLoop {
    interval: Duration,
    next_deadline: Option<Instant>,
    pending: VecDeque<PendingChange>,
    max_batch_size: usize,
    max_send_attempts: u32,
    coalesce: bool,
    dropped: u64,
}

impl SyncLoop {
    pub fn new(config: &SyncConfig) -> Self {
        Self {
            interval: config.sync_interval(),
            next_deadline: None,
            pending: VecDeque::new(),
            max_batch_size: config.max_batch_size,
            max_send_attempts: config.max_send_attempts,
            coalesce: config.coalesce_partials,
            dropped: 0,
        }
    }

    /// Arm the loop; returns false if it was already running
    pub fn start(&mut self, now: Instant) -> bool {
        if self.next_deadline.is_some() {
            return false;
        }
        self.next_deadline = Some(now + self.interval);
        true
    }

    /// Disarm the loop; returns false if it was not running
    pub fn stop(&mut self) -> bool {
        self.next_deadline.take().is_some()
    }

    pub fn is_running(&self) -> bool {
        self.next_deadline.is_some()
    }

    /// When the next tick is due
    pub fn deadline(&self) -> Option<Instant> {
        self.next_deadline
    }

    pub fn is_due(&self, now: Instant) -> bool {
        matches!(self.next_deadline, Some(deadline) if now >= deadline)
    }

    /// If a tick is due, reschedule and hand back the next batch
    pub fn poll(&mut self, now: Instant) -> Option<Vec<PendingChange>> {
        if !self.is_due(now) {
            return None;
        }
        self.next_deadline = Some(now + self.interval);
        Some(self.take_batch())
    }

    /// Drain up to one batch of pending changes, oldest first
    pub fn take_batch(&mut self) -> Vec<PendingChange> {
        let count = self.pending.len().min(self.max_batch_size);
        self.pending.drain(..count).collect()
    }

    /// Queue a change, folding it into the newest queued change for the
    /// same object when both are the same coalescable kind
    pub fn enqueue(&mut self, event: SyncEvent) {
        if self.coalesce {
            if let Some(last) = self
                .pending
                .iter_mut()
                .rev()
                .find(|p| p.event.object_id == event.object_id)
            {
                if coalesce_into(&mut last.event, &event) {
                    return;
                }
            }
        }
        self.pending.push_back(PendingChange::new(event));
    }

    /// Put changes that were never attempted back at the head of the queue,
    /// in order, without charging an attempt
    pub fn requeue(&mut self, untried: Vec<PendingChange>) {
        for change in untried.into_iter().rev() {
            self.pending.push_front(change);
        }
    }

    /// Put failed sends back at the head of the queue, in order, dropping
    /// any that have used up their attempts
    pub fn retry(&mut self, failed: Vec<PendingChange>) {
        for mut change in failed.into_iter().rev() {
            change.attempts += 1;
            if change.attempts >= self.max_send_attempts {
                self.dropped += 1;
                log::warn!(
                    "Dropping {} for {} after {} failed sends",
                    change.event.kind(),
                    change.event.object_id,
                    change.attempts
                );
                continue;
            }
            self.pending.push_front(change);
        }
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Changes abandoned after exhausting their send attempts
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }
}

fn coalesce_into(existing: &mut SyncEvent, newer: &SyncEvent) -> bool {
    match (existing.kind(), newer.kind()) {
        (EventKind::Transform, EventKind::Transform) => {
            if let (EventPayload::Transform(older), EventPayload::Transform(patch)) =
                (&mut existing.payload, &newer.payload)
            {
                older.merge(patch);
            }
        }
        (EventKind::Material, EventKind::Material) | (EventKind::Update, EventKind::Update) => {
            existing.payload = newer.payload.clone();
        }
        _ => return false,
    }
    existing.timestamp = newer.timestamp;
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{MaterialPatch, ObjectId, TransformPatch, UserId};
    use glam::DVec3;

    fn config() -> SyncConfig {
        SyncConfig::default()
            .with_sync_interval(Duration::from_millis(100))
            .with_max_batch_size(2)
            .with_max_send_attempts(2)
    }

    fn transform(id: &str, position: DVec3, timestamp: u64) -> SyncEvent {
        SyncEvent::transform(
            ObjectId::new(id),
            TransformPatch::position(position),
            UserId::new("alice"),
            timestamp,
        )
    }

    fn delete(id: &str) -> SyncEvent {
        SyncEvent::delete(ObjectId::new(id), UserId::new("alice"), 1)
    }

    #[test]
    fn test_start_stop_idempotent() {
        let mut sync_loop = SyncLoop::new(&config());
        let now = Instant::now();

        assert!(sync_loop.start(now));
        assert!(!sync_loop.start(now));
        assert_eq!(sync_loop.deadline(), Some(now + Duration::from_millis(100)));

        assert!(sync_loop.stop());
        assert!(!sync_loop.stop());
        assert!(sync_loop.deadline().is_none());
    }

    #[test]
    fn test_poll_respects_deadline() {
        let mut sync_loop = SyncLoop::new(&config());
        let now = Instant::now();

        assert!(sync_loop.poll(now).is_none());

        sync_loop.start(now);
        sync_loop.enqueue(delete("a"));
        assert!(sync_loop.poll(now).is_none());

        let later = now + Duration::from_millis(100);
        let batch = sync_loop.poll(later).unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(sync_loop.deadline(), Some(later + Duration::from_millis(100)));
    }

    #[test]
    fn test_batches_are_bounded() {
        let mut sync_loop = SyncLoop::new(&config());
        sync_loop.enqueue(delete("a"));
        sync_loop.enqueue(delete("b"));
        sync_loop.enqueue(delete("c"));

        let batch = sync_loop.take_batch();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].event.object_id.as_str(), "a");
        assert_eq!(sync_loop.pending_len(), 1);
    }

    #[test]
    fn test_transforms_coalesce() {
        let mut sync_loop = SyncLoop::new(&config());
        sync_loop.enqueue(transform("a", DVec3::X, 1));
        sync_loop.enqueue(transform("a", DVec3::Y, 2));
        sync_loop.enqueue(transform("b", DVec3::Z, 3));

        assert_eq!(sync_loop.pending_len(), 2);
        let batch = sync_loop.take_batch();
        assert_eq!(batch[0].event.timestamp, 2);
        assert_eq!(
            batch[0].event.payload,
            EventPayload::Transform(TransformPatch::position(DVec3::Y))
        );
    }

    #[test]
    fn test_no_coalesce_across_other_kinds() {
        let mut sync_loop = SyncLoop::new(&config());
        sync_loop.enqueue(transform("a", DVec3::X, 1));
        sync_loop.enqueue(delete("a"));
        sync_loop.enqueue(transform("a", DVec3::Y, 2));
        assert_eq!(sync_loop.pending_len(), 3);

        let mut plain = SyncLoop::new(&config().with_coalesce_partials(false));
        plain.enqueue(transform("a", DVec3::X, 1));
        plain.enqueue(transform("a", DVec3::Y, 2));
        assert_eq!(plain.pending_len(), 2);
    }

    #[test]
    fn test_material_replaces() {
        let mut sync_loop = SyncLoop::new(&config());
        let origin = UserId::new("alice");
        sync_loop.enqueue(SyncEvent::material(
            ObjectId::new("a"),
            MaterialPatch::new(Some("oak".into())),
            origin.clone(),
            1,
        ));
        sync_loop.enqueue(SyncEvent::material(
            ObjectId::new("a"),
            MaterialPatch::new(None),
            origin,
            2,
        ));

        let batch = sync_loop.take_batch();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].event.payload, EventPayload::Material(MaterialPatch::new(None)));
    }

    #[test]
    fn test_retry_keeps_order_and_drops_exhausted() {
        let mut sync_loop = SyncLoop::new(&config());
        sync_loop.enqueue(delete("c"));

        sync_loop.retry(vec![PendingChange::new(delete("a")), PendingChange::new(delete("b"))]);
        assert_eq!(sync_loop.pending_len(), 3);

        let batch = sync_loop.take_batch();
        assert_eq!(batch[0].event.object_id.as_str(), "a");
        assert_eq!(batch[1].event.object_id.as_str(), "b");
        assert_eq!(batch[0].attempts, 1);

        // Second failure reaches max_send_attempts = 2
        sync_loop.retry(batch);
        assert_eq!(sync_loop.pending_len(), 1);
        assert_eq!(sync_loop.dropped(), 2);
    }

    #[test]
    fn test_requeue_keeps_attempts() {
        let mut sync_loop = SyncLoop::new(&config());
        sync_loop.enqueue(delete("c"));

        let mut tried = PendingChange::new(delete("a"));
        tried.attempts = 1;
        sync_loop.requeue(vec![tried, PendingChange::new(delete("b"))]);

        let batch = sync_loop.take_batch();
        assert_eq!(batch[0].event.object_id.as_str(), "a");
        assert_eq!(batch[0].attempts, 1);
        assert_eq!(batch[1].event.object_id.as_str(), "b");
        assert_eq!(batch[1].attempts, 0);
        assert_eq!(sync_loop.dropped(), 0);
    }
}
