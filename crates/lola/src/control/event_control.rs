// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Event data control block: the lock-free allocator of sample slots.
//!
//! One control block lives in shared memory per event per quality channel.
//! It owns the slot status words and the transaction log set; the payload
//! bytes live in the separate data segment and are only ever addressed by
//! slot index.
//!
//! # Memory Ordering Strategy
//!
//! - Every CAS on a slot word is acquire-release; pure loads are acquire.
//! - The producer writes payload bytes first, then publishes via the
//!   release-store in `event_ready`. A reader that observes the new
//!   timestamp through an acquire-load is guaranteed to see those bytes.
//! - Transaction log counters bracket each CAS so a crashed party can be
//!   rolled back from the log alone.

use std::sync::Arc;

use crossbeam::utils::Backoff;

use crate::control::atomics::{AtomicOps, RealAtomics};
use crate::control::slot_status::{EventSlotStatus, EventTimestamp, SlotCell, SlotIndex};
use crate::control::transaction_log::{
    rollback_decrements, LogIndex, TransactionLogId, TransactionLogSet,
};
use crate::error::Result;
use crate::shm::arena::{Arena, ShmSlice};

/// Static deployment properties of one event
#[derive(Debug, Clone, Copy)]
pub struct SkeletonEventProperties {
    /// Number of sample slots
    pub number_of_slots: u16,
    /// Maximum number of concurrently subscribed proxies
    pub max_subscribers: u16,
    /// Deny references beyond the per-subscriber quota even when slots are
    /// free
    pub enforce_max_samples: bool,
}

/// Shared-memory-resident part of an event control block
#[repr(C)]
pub struct EventControlShm {
    num_slots: u16,
    max_subscribers: u16,
    enforce_max_samples: u8,
    _pad: [u8; 3],
    state_slots: ShmSlice<SlotCell>,
    logs: TransactionLogSet,
}

impl EventControlShm {
    /// Construct the shared-memory value, allocating the slot and log
    /// arrays from the segment's arena. Runs single-threaded before the
    /// segment is published.
    pub fn new_in(arena: &Arena, properties: &SkeletonEventProperties) -> Result<Self> {
        Ok(Self {
            num_slots: properties.number_of_slots,
            max_subscribers: properties.max_subscribers,
            enforce_max_samples: u8::from(properties.enforce_max_samples),
            _pad: [0; 3],
            state_slots: arena.alloc_slice_zeroed::<SlotCell>(usize::from(
                properties.number_of_slots,
            ))?,
            logs: TransactionLogSet::create(
                arena,
                properties.max_subscribers,
                properties.number_of_slots,
            )?,
        })
    }
}

/// Process-local view of one event control block.
///
/// Cheap to clone; all state lives in the mapped segment.
pub struct EventDataControl {
    arena: Arc<Arena>,
    ctrl: *const EventControlShm,
}

// SAFETY: the view only dereferences into a shared mapping whose mutable
// state is atomic; the raw pointer stays valid for the arena's lifetime,
// which the Arc keeps alive.
unsafe impl Send for EventDataControl {}
unsafe impl Sync for EventDataControl {}

impl Clone for EventDataControl {
    fn clone(&self) -> Self {
        Self {
            arena: Arc::clone(&self.arena),
            ctrl: self.ctrl,
        }
    }
}

impl EventDataControl {
    /// Wrap a control block resident in the given arena
    pub(crate) fn from_raw(arena: Arc<Arena>, ctrl: *const EventControlShm) -> Self {
        assert!(!ctrl.is_null(), "event control pointer must not be null");
        Self { arena, ctrl }
    }

    #[inline]
    fn shm(&self) -> &EventControlShm {
        // SAFETY: ctrl points into the arena's mapping (checked non-null at
        // construction) and outlives self via the Arc.
        unsafe { &*self.ctrl }
    }

    #[inline]
    pub(crate) fn cell(&self, slot: SlotIndex) -> &SlotCell {
        self.shm().state_slots.at(&self.arena, usize::from(slot))
    }

    /// Number of slots backing this event
    #[must_use]
    pub fn num_slots(&self) -> u16 {
        self.shm().num_slots
    }

    /// Configured subscriber limit
    #[must_use]
    pub fn max_subscribers(&self) -> u16 {
        self.shm().max_subscribers
    }

    /// Current status of one slot
    #[must_use]
    pub fn slot_status(&self, slot: SlotIndex) -> EventSlotStatus {
        self.cell(slot).load()
    }

    /// Bounded retry budget for allocation and reference CAS loops:
    /// twice the maximum number of parties acting in parallel.
    fn retry_budget(&self) -> usize {
        (usize::from(self.shm().max_subscribers) + 1) * 2
    }

    /// Oldest slot that is neither in-writing nor referenced
    fn next_free_slot(&self) -> Option<(SlotIndex, EventSlotStatus)> {
        let mut found: Option<(SlotIndex, EventSlotStatus)> = None;
        for slot in 0..self.num_slots() {
            let status = self.cell(slot).load();
            if status.is_used() {
                continue;
            }
            match found {
                Some((_, best)) if best.time_stamp() <= status.time_stamp() => {}
                _ => found = Some((slot, status)),
            }
        }
        found
    }

    /// Claim the oldest free slot for writing.
    ///
    /// On success the caller owns the slot and must publish it with
    /// [`Self::event_ready`] or give it back with [`Self::discard`].
    #[must_use]
    pub fn allocate_next_slot(&self) -> Option<SlotIndex> {
        self.allocate_next_slot_with::<RealAtomics>()
    }

    pub(crate) fn allocate_next_slot_with<A: AtomicOps>(&self) -> Option<SlotIndex> {
        let backoff = Backoff::new();
        for _ in 0..self.retry_budget() {
            let (slot, status) = self.next_free_slot()?;
            if self
                .cell(slot)
                .compare_exchange::<A>(status, EventSlotStatus::in_writing())
                .is_ok()
            {
                return Some(slot);
            }
            backoff.spin();
        }
        None
    }

    /// Publish a slot: clears the writing flag, stores the timestamp and
    /// resets the ref-count to zero. The release-store makes all payload
    /// writes visible to readers that observe the new timestamp.
    pub fn event_ready(&self, slot: SlotIndex, timestamp: EventTimestamp) {
        debug_assert!(
            self.cell(slot).load().is_in_writing(),
            "event_ready on a slot that is not being written"
        );
        self.cell(slot).store(EventSlotStatus::ready(timestamp));
    }

    /// Give a claimed slot back without publishing; it becomes
    /// re-allocatable immediately.
    pub fn discard(&self, slot: SlotIndex) {
        debug_assert!(
            self.cell(slot).load().is_in_writing(),
            "discard on a slot that is not being written"
        );
        self.cell(slot).store(EventSlotStatus::invalid());
    }

    /// Take a reference on the unseen published slot with the smallest
    /// timestamp in `(start, upper]`.
    ///
    /// Returns the slot and its timestamp, or `None` when nothing new is
    /// published, the subscriber's quota is exhausted, or the CAS budget
    /// runs out.
    #[must_use]
    pub fn reference_next_event(
        &self,
        start: EventTimestamp,
        log_index: LogIndex,
        upper: EventTimestamp,
    ) -> Option<(SlotIndex, EventTimestamp)> {
        self.reference_next_event_with::<RealAtomics>(start, log_index, upper)
    }

    pub(crate) fn reference_next_event_with<A: AtomicOps>(
        &self,
        start: EventTimestamp,
        log_index: LogIndex,
        upper: EventTimestamp,
    ) -> Option<(SlotIndex, EventTimestamp)> {
        let node = self.shm().logs.node(&self.arena, log_index);
        if self.shm().enforce_max_samples != 0 && node.total_outstanding(&self.arena) >= node.max_samples()
        {
            return None;
        }

        let backoff = Backoff::new();
        for _ in 0..self.retry_budget() {
            let mut found: Option<(SlotIndex, EventSlotStatus)> = None;
            for slot in 0..self.num_slots() {
                let status = self.cell(slot).load();
                if status.is_in_writing() {
                    continue;
                }
                let timestamp = status.time_stamp();
                if timestamp <= start || timestamp > upper {
                    continue;
                }
                if node.entry(&self.arena, usize::from(slot)).outstanding() > 0 {
                    // This subscriber already holds the slot; one ref per
                    // slot per subscriber.
                    continue;
                }
                match found {
                    Some((_, best)) if best.time_stamp() <= timestamp => {}
                    _ => found = Some((slot, status)),
                }
            }
            let (slot, status) = found?;

            let entry = node.entry(&self.arena, usize::from(slot));
            entry.reference_transaction_begin();
            if self
                .cell(slot)
                .compare_exchange::<A>(status, status.with_ref_taken())
                .is_ok()
            {
                entry.reference_transaction_commit();
                return Some((slot, status.time_stamp()));
            }
            entry.reference_transaction_abort();
            backoff.spin();
        }
        None
    }

    /// Take a reference on a named slot (skeleton tracing path).
    ///
    /// Returns false when the slot is not published or the CAS budget runs
    /// out.
    #[must_use]
    pub fn reference_specific_event(&self, slot: SlotIndex, log_index: LogIndex) -> bool {
        self.reference_specific_event_with::<RealAtomics>(slot, log_index)
    }

    pub(crate) fn reference_specific_event_with<A: AtomicOps>(
        &self,
        slot: SlotIndex,
        log_index: LogIndex,
    ) -> bool {
        let node = self.shm().logs.node(&self.arena, log_index);
        if self.shm().enforce_max_samples != 0 && node.total_outstanding(&self.arena) >= node.max_samples()
        {
            return false;
        }

        let entry = node.entry(&self.arena, usize::from(slot));
        let backoff = Backoff::new();
        for _ in 0..self.retry_budget() {
            let status = self.cell(slot).load();
            if status.is_in_writing() || status.is_invalid() {
                return false;
            }
            entry.reference_transaction_begin();
            if self
                .cell(slot)
                .compare_exchange::<A>(status, status.with_ref_taken())
                .is_ok()
            {
                entry.reference_transaction_commit();
                return true;
            }
            entry.reference_transaction_abort();
            backoff.spin();
        }
        false
    }

    /// Drop a reference previously taken through the given log
    pub fn dereference_event(&self, slot: SlotIndex, log_index: LogIndex) {
        let entry = self
            .shm()
            .logs
            .node(&self.arena, log_index)
            .entry(&self.arena, usize::from(slot));
        entry.dereference_transaction_begin();
        self.cell(slot).release_ref();
        entry.dereference_transaction_commit();
    }

    /// Drop a reference without touching any log. Only the rollback paths
    /// use this: the log being rolled back is the record being erased.
    pub fn dereference_event_without_logging(&self, slot: SlotIndex) {
        self.cell(slot).release_ref();
    }

    /// Number of published slots with a timestamp newer than `since`
    #[must_use]
    pub fn num_new_events(&self, since: EventTimestamp) -> usize {
        (0..self.num_slots())
            .map(|slot| self.cell(slot).load())
            .filter(|s| !s.is_in_writing() && s.time_stamp() > since)
            .count()
    }

    /// Timestamp of the newest published slot, at least 1
    #[must_use]
    pub fn latest_timestamp(&self) -> EventTimestamp {
        let mut latest: EventTimestamp = 1;
        for slot in 0..self.num_slots() {
            let status = self.cell(slot).load();
            if !status.is_invalid() && !status.is_in_writing() && status.time_stamp() > latest {
                latest = status.time_stamp();
            }
        }
        latest
    }

    /// Invalidate every slot still claimed for writing. Called by a
    /// restarted skeleton after detecting a prior crash.
    pub fn remove_allocations_for_writing(&self) {
        for slot in 0..self.num_slots() {
            if self.cell(slot).load().is_in_writing() {
                self.cell(slot).store(EventSlotStatus::invalid());
            }
        }
    }

    // ----- transaction log management -----

    /// Register a subscriber's transaction log
    pub fn register_subscriber(
        &self,
        id: TransactionLogId,
        max_samples: u32,
    ) -> Result<LogIndex> {
        self.shm().logs.register_proxy(&self.arena, id, max_samples)
    }

    /// Release a subscriber's transaction log after a clean unsubscribe
    pub fn unregister_subscriber(&self, log_index: LogIndex) {
        self.shm().logs.unregister(&self.arena, log_index);
    }

    /// Claim the skeleton tracing log
    pub fn register_skeleton_log(&self) -> LogIndex {
        self.shm().logs.register_skeleton(&self.arena)
    }

    /// References currently held through the given log
    #[must_use]
    pub fn log_outstanding(&self, log_index: LogIndex) -> u32 {
        self.shm()
            .logs
            .node(&self.arena, log_index)
            .total_outstanding(&self.arena)
    }

    /// Erase a crashed subscriber's contribution to every slot ref-count
    /// and release its logs. Non-reentrant: the driver holds the instance
    /// flock.
    pub fn rollback_subscriber(&self, id: TransactionLogId) {
        for index in self.shm().logs.proxy_nodes_for(&self.arena, id) {
            self.rollback_log(index);
        }
    }

    /// Roll back the skeleton tracing log after a skeleton crash
    pub fn rollback_skeleton_log(&self) {
        let index = self.shm().logs.skeleton_index();
        if self.shm().logs.node(&self.arena, index).is_used() {
            self.rollback_log(index);
        }
    }

    fn rollback_log(&self, log_index: LogIndex) {
        let node = self.shm().logs.node(&self.arena, log_index);
        for slot in 0..self.num_slots() {
            let snapshot = node.entry(&self.arena, usize::from(slot)).snapshot();
            for _ in 0..rollback_decrements(snapshot) {
                if self.cell(slot).load().ref_count() == 0 {
                    log::error!(
                        "[CTL] rollback would underflow ref count of slot {slot}; log corrupt"
                    );
                    break;
                }
                self.dereference_event_without_logging(slot);
            }
        }
        self.shm().logs.unregister(&self.arena, log_index);
    }

    /// Test support: the sum over all logs of outstanding refs for a slot
    #[cfg(test)]
    fn logged_refs(&self, slot: SlotIndex) -> u32 {
        let logs = &self.shm().logs;
        (0..logs.proxy_capacity() + 1)
            .map(|i| logs.node(&self.arena, i))
            .filter(|n| n.is_used())
            .map(|n| n.entry(&self.arena, usize::from(slot)).outstanding())
            .sum()
    }
}

/// Build a control block in a fresh heap arena (test helper and sizing
/// simulation building block)
pub(crate) fn create_in_arena(
    arena: &Arc<Arena>,
    properties: &SkeletonEventProperties,
) -> Result<EventDataControl> {
    let shm = EventControlShm::new_in(arena, properties)?;
    let offset = arena.alloc_value(shm)?;
    Ok(EventDataControl::from_raw(
        Arc::clone(arena),
        arena.at::<EventControlShm>(offset.raw()),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::atomics::testing::{fail_next_cas, FailingAtomics};
    use crate::control::slot_status::EventSlotStatus;

    fn control(slots: u16, subscribers: u16, enforce: bool) -> EventDataControl {
        let arena = Arc::new(Arena::create_on_heap(256 * 1024).expect("arena"));
        create_in_arena(
            &arena,
            &SkeletonEventProperties {
                number_of_slots: slots,
                max_subscribers: subscribers,
                enforce_max_samples: enforce,
            },
        )
        .expect("control")
    }

    #[test]
    fn test_allocate_publish_reference_dereference_roundtrip() {
        let ctl = control(5, 2, false);
        let log = ctl.register_subscriber(42, 10).expect("subscribe");

        let slot = ctl.allocate_next_slot().expect("allocate");
        assert_eq!(slot, 0);
        assert!(ctl.slot_status(slot).is_in_writing());

        ctl.event_ready(slot, 1);
        assert_eq!(ctl.latest_timestamp(), 1);

        let (read_slot, ts) = ctl.reference_next_event(0, log, EventSlotStatus::TIMESTAMP_MAX)
            .expect("reference");
        assert_eq!(read_slot, slot);
        assert_eq!(ts, 1);
        assert_eq!(ctl.slot_status(slot).ref_count(), 1);

        ctl.dereference_event(slot, log);
        assert_eq!(ctl.slot_status(slot).ref_count(), 0);
        assert_eq!(ctl.slot_status(slot).time_stamp(), 1);
    }

    #[test]
    fn test_allocator_reuses_oldest_slot() {
        let ctl = control(5, 1, false);
        for i in 0..5u16 {
            let slot = ctl.allocate_next_slot().expect("allocate");
            assert_eq!(slot, i);
            ctl.event_ready(slot, u32::from(i) + 1);
        }
        // All published, none referenced: the oldest timestamp (slot 0) is
        // recycled first.
        assert_eq!(ctl.allocate_next_slot(), Some(0));
    }

    #[test]
    fn test_allocator_skips_referenced_slots() {
        let ctl = control(2, 1, false);
        let log = ctl.register_subscriber(1, 10).expect("subscribe");

        let s0 = ctl.allocate_next_slot().unwrap();
        ctl.event_ready(s0, 1);
        let s1 = ctl.allocate_next_slot().unwrap();
        ctl.event_ready(s1, 2);

        ctl.reference_next_event(0, log, u32::MAX).expect("reference");
        // Slot 0 (ts 1) is held; the only free slot is 1.
        assert_eq!(ctl.allocate_next_slot(), Some(s1));
    }

    #[test]
    fn test_allocator_returns_none_when_everything_is_used() {
        let ctl = control(1, 1, false);
        let _slot = ctl.allocate_next_slot().expect("first");
        assert_eq!(ctl.allocate_next_slot(), None);
    }

    #[test]
    fn test_discard_makes_slot_reallocatable() {
        let ctl = control(1, 1, false);
        let slot = ctl.allocate_next_slot().expect("allocate");
        ctl.discard(slot);
        assert!(ctl.slot_status(slot).is_invalid());
        assert_eq!(ctl.allocate_next_slot(), Some(slot));
    }

    #[test]
    fn test_reference_orders_by_timestamp_not_index() {
        let ctl = control(3, 1, false);
        let log = ctl.register_subscriber(1, 10).expect("subscribe");

        // Publish out of index order: slot 0 gets the newest timestamp.
        for (slot, ts) in [(0u16, 3u32), (1, 1), (2, 2)] {
            let s = ctl.allocate_next_slot().unwrap();
            assert_eq!(s, slot);
            ctl.event_ready(s, ts);
        }

        let (slot, ts) = ctl.reference_next_event(0, log, u32::MAX).unwrap();
        assert_eq!((slot, ts), (1, 1));
        let (slot, ts) = ctl.reference_next_event(ts, log, u32::MAX).unwrap();
        assert_eq!((slot, ts), (2, 2));
        let (slot, ts) = ctl.reference_next_event(ts, log, u32::MAX).unwrap();
        assert_eq!((slot, ts), (0, 3));
        assert!(ctl.reference_next_event(ts, log, u32::MAX).is_none());
    }

    #[test]
    fn test_reference_respects_upper_bound() {
        let ctl = control(3, 1, false);
        let log = ctl.register_subscriber(1, 10).expect("subscribe");
        for ts in 1..=3u32 {
            let slot = ctl.allocate_next_slot().unwrap();
            ctl.event_ready(slot, ts);
        }
        assert!(ctl.reference_next_event(2, log, 2).is_none());
        assert!(ctl.reference_next_event(1, log, 2).is_some());
    }

    #[test]
    fn test_second_reference_on_held_slot_is_rejected() {
        let ctl = control(2, 1, false);
        let log = ctl.register_subscriber(1, 10).expect("subscribe");
        let slot = ctl.allocate_next_slot().unwrap();
        ctl.event_ready(slot, 5);

        assert_eq!(ctl.reference_next_event(0, log, u32::MAX), Some((slot, 5)));
        // Same subscriber, same slot still visible above start=0: denied.
        assert!(ctl.reference_next_event(0, log, u32::MAX).is_none());
        assert_eq!(ctl.slot_status(slot).ref_count(), 1);
    }

    #[test]
    fn test_max_samples_quota_denies_even_with_free_slots() {
        let ctl = control(5, 1, true);
        let log = ctl.register_subscriber(1, 2).expect("subscribe");
        for ts in 1..=4u32 {
            let slot = ctl.allocate_next_slot().unwrap();
            ctl.event_ready(slot, ts);
        }
        assert!(ctl.reference_next_event(0, log, u32::MAX).is_some());
        assert!(ctl.reference_next_event(1, log, u32::MAX).is_some());
        // Quota of 2 exhausted although two more published slots exist.
        assert!(ctl.reference_next_event(2, log, u32::MAX).is_none());

        ctl.dereference_event(0, log);
        assert!(ctl.reference_next_event(2, log, u32::MAX).is_some());
    }

    #[test]
    fn test_ref_counts_match_logs_at_all_times() {
        let ctl = control(4, 2, false);
        let log_a = ctl.register_subscriber(100, 10).expect("a");
        let log_b = ctl.register_subscriber(200, 10).expect("b");

        for ts in 1..=4u32 {
            let slot = ctl.allocate_next_slot().unwrap();
            ctl.event_ready(slot, ts);
        }
        let (sa, _) = ctl.reference_next_event(0, log_a, u32::MAX).unwrap();
        let (sb, _) = ctl.reference_next_event(0, log_b, u32::MAX).unwrap();
        let (sb2, _) = ctl.reference_next_event(1, log_b, u32::MAX).unwrap();

        for slot in 0..4u16 {
            assert_eq!(
                u32::from(ctl.slot_status(slot).ref_count()),
                ctl.logged_refs(slot),
                "slot {slot} count out of sync"
            );
        }

        ctl.dereference_event(sa, log_a);
        ctl.dereference_event(sb, log_b);
        ctl.dereference_event(sb2, log_b);
        for slot in 0..4u16 {
            assert_eq!(ctl.slot_status(slot).ref_count(), 0);
            assert_eq!(ctl.logged_refs(slot), 0);
        }
    }

    #[test]
    fn test_num_new_events() {
        let ctl = control(4, 1, false);
        for ts in [2u32, 5, 9] {
            let slot = ctl.allocate_next_slot().unwrap();
            ctl.event_ready(slot, ts);
        }
        assert_eq!(ctl.num_new_events(0), 3);
        assert_eq!(ctl.num_new_events(2), 2);
        assert_eq!(ctl.num_new_events(9), 0);
    }

    #[test]
    fn test_remove_allocations_for_writing() {
        let ctl = control(3, 1, false);
        let s0 = ctl.allocate_next_slot().unwrap();
        ctl.event_ready(s0, 1);
        let s1 = ctl.allocate_next_slot().unwrap();
        // s1 left in-writing, like a skeleton that died mid-publish.
        ctl.remove_allocations_for_writing();
        assert!(ctl.slot_status(s1).is_invalid());
        assert_eq!(ctl.slot_status(s0).time_stamp(), 1);
    }

    #[test]
    fn test_allocate_gives_up_after_injected_cas_losses() {
        let ctl = control(3, 1, false);
        // Budget is (1 + 1) * 2 = 4 attempts; make every CAS fail.
        fail_next_cas(64);
        assert!(ctl.allocate_next_slot_with::<FailingAtomics>().is_none());
        fail_next_cas(0);
        assert!(ctl.allocate_next_slot_with::<FailingAtomics>().is_some());
    }

    #[test]
    fn test_reference_retries_through_cas_loss() {
        let ctl = control(2, 1, false);
        let log = ctl.register_subscriber(1, 10).expect("subscribe");
        let slot = ctl.allocate_next_slot().unwrap();
        ctl.event_ready(slot, 1);

        // One injected loss, then the retry succeeds within budget.
        fail_next_cas(1);
        let got = ctl.reference_next_event_with::<FailingAtomics>(0, log, u32::MAX);
        assert_eq!(got, Some((slot, 1)));
        // The aborted attempt must not leak into the log.
        assert_eq!(ctl.log_outstanding(log), 1);
    }

    #[test]
    fn test_rollback_subscriber_clears_all_contributions() {
        let ctl = control(3, 2, false);
        let log = ctl.register_subscriber(42, 10).expect("subscribe");
        for ts in 1..=3u32 {
            let slot = ctl.allocate_next_slot().unwrap();
            ctl.event_ready(slot, ts);
        }
        ctl.reference_next_event(0, log, u32::MAX).unwrap();
        ctl.reference_next_event(1, log, u32::MAX).unwrap();
        // Crash: no dereference, no unsubscribe.

        ctl.rollback_subscriber(42);
        for slot in 0..3u16 {
            assert_eq!(ctl.slot_status(slot).ref_count(), 0);
        }
        // The log node is free again.
        assert!(ctl.register_subscriber(42, 10).is_ok());
    }

    #[test]
    fn test_rollback_handles_in_flight_reference() {
        use crate::control::atomics::RealAtomics;

        let ctl = control(2, 1, false);
        let log = ctl.register_subscriber(7, 10).expect("subscribe");
        let slot = ctl.allocate_next_slot().unwrap();
        ctl.event_ready(slot, 1);

        // Model a crash between the slot CAS and the commit record: the
        // ref count is incremented but the log still says "in flight".
        let status = ctl.cell(slot).load();
        ctl.cell(slot)
            .compare_exchange::<RealAtomics>(status, status.with_ref_taken())
            .expect("take ref");
        let node = ctl.shm().logs.node(&ctl.arena, log);
        node.entry(&ctl.arena, usize::from(slot))
            .reference_transaction_begin();
        assert_eq!(ctl.slot_status(slot).ref_count(), 1);

        ctl.rollback_subscriber(7);
        assert_eq!(ctl.slot_status(slot).ref_count(), 0);
    }

    #[test]
    fn test_skeleton_log_rollback() {
        let ctl = control(2, 1, false);
        let skel = ctl.register_skeleton_log();
        let slot = ctl.allocate_next_slot().unwrap();
        ctl.event_ready(slot, 1);
        assert!(ctl.reference_specific_event(slot, skel));
        assert_eq!(ctl.slot_status(slot).ref_count(), 1);

        ctl.rollback_skeleton_log();
        assert_eq!(ctl.slot_status(slot).ref_count(), 0);
    }

    #[test]
    fn test_reference_specific_event_rejects_unpublished() {
        let ctl = control(2, 1, false);
        let skel = ctl.register_skeleton_log();
        assert!(!ctl.reference_specific_event(0, skel));
        let slot = ctl.allocate_next_slot().unwrap();
        assert!(!ctl.reference_specific_event(slot, skel));
    }
}
