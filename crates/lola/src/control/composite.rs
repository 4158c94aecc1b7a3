// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Composite over a QM and an optional ASIL-B control block.
//!
//! A dual-quality instance keeps two control blocks for every event, one
//! per quality channel, sharing the payload slots. The composite allocates
//! slots that are free in *both* channels so a published sample is visible
//! to both consumer groups. The safety policy lives in the fallback: when
//! the dual allocation cannot succeed within its retry budget, the QM
//! consumers are misbehaving (holding references forever), and the
//! composite latches `ignore_qm`. From then on the QM channel is treated
//! as absent for the rest of the composite's lifetime so QM consumers can
//! never again starve the ASIL-B path.

use std::sync::atomic::{AtomicBool, Ordering};

use crate::control::atomics::{AtomicOps, RealAtomics};
use crate::control::event_control::EventDataControl;
use crate::control::slot_status::{EventSlotStatus, EventTimestamp, SlotIndex};

/// Retry budget of the dual-channel allocation before QM is dismissed
const MAX_MULTI_ALLOCATE_COUNT: usize = 100;

/// Pair of control blocks for one event of a dual-quality instance
pub struct EventDataControlComposite {
    qm: EventDataControl,
    asil_b: Option<EventDataControl>,
    ignore_qm: AtomicBool,
}

impl EventDataControlComposite {
    /// Composite over a QM control and an optional ASIL-B control
    #[must_use]
    pub fn new(qm: EventDataControl, asil_b: Option<EventDataControl>) -> Self {
        Self {
            qm,
            asil_b,
            ignore_qm: AtomicBool::new(false),
        }
    }

    /// True once the QM channel has been dismissed for good
    #[must_use]
    pub fn is_qm_disconnected(&self) -> bool {
        self.ignore_qm.load(Ordering::Acquire)
    }

    /// The QM control block
    #[must_use]
    pub fn qm_control(&self) -> &EventDataControl {
        &self.qm
    }

    /// The ASIL-B control block, when the instance is dual-quality
    #[must_use]
    pub fn asil_b_control(&self) -> Option<&EventDataControl> {
        self.asil_b.as_ref()
    }

    /// Oldest slot that is free in both channels, together with its
    /// ASIL-B timestamp
    fn next_free_multi_slot(&self, asil_b: &EventDataControl) -> Option<(SlotIndex, EventSlotStatus, EventSlotStatus)> {
        let mut found: Option<(SlotIndex, EventSlotStatus, EventSlotStatus)> = None;
        let mut oldest = EventSlotStatus::TIMESTAMP_MAX;
        for slot in 0..asil_b.num_slots() {
            let status_qm = self.qm.slot_status(slot);
            let status_b = asil_b.slot_status(slot);
            if status_b.is_invalid() || (!status_qm.is_used() && !status_b.is_used()) {
                let timestamp = status_b.time_stamp();
                if timestamp < oldest {
                    oldest = timestamp;
                    found = Some((slot, status_qm, status_b));
                }
            }
        }
        found
    }

    /// Claim a slot in both channels: CAS the QM word first, then the
    /// ASIL-B word; a lost ASIL-B CAS rolls the QM word back.
    fn try_lock_slot<A: AtomicOps>(
        &self,
        asil_b: &EventDataControl,
        slot: SlotIndex,
        status_qm: EventSlotStatus,
        status_b: EventSlotStatus,
    ) -> bool {
        if status_qm.is_used() || status_b.is_used() {
            return false;
        }
        if self
            .qm
            .cell(slot)
            .compare_exchange::<A>(status_qm, EventSlotStatus::in_writing())
            .is_err()
        {
            return false;
        }
        if asil_b
            .cell(slot)
            .compare_exchange::<A>(status_b, EventSlotStatus::in_writing())
            .is_err()
        {
            // Release-store the prior QM word so the aborted claim is never
            // observable as a half-locked slot.
            self.qm.cell(slot).store(status_qm);
            return false;
        }
        true
    }

    fn allocate_next_multi_slot<A: AtomicOps>(&self, asil_b: &EventDataControl) -> Option<SlotIndex> {
        for _ in 0..MAX_MULTI_ALLOCATE_COUNT {
            if let Some((slot, status_qm, status_b)) = self.next_free_multi_slot(asil_b) {
                if self.try_lock_slot::<A>(asil_b, slot, status_qm, status_b) {
                    return Some(slot);
                }
            }
        }
        None
    }

    /// Claim the oldest free slot.
    ///
    /// The returned flag is true when the QM channel is (now) dismissed:
    /// the caller should treat QM subscribers as dropped by policy.
    #[must_use]
    pub fn allocate_next_slot(&self) -> (Option<SlotIndex>, bool) {
        self.allocate_next_slot_with::<RealAtomics>()
    }

    pub(crate) fn allocate_next_slot_with<A: AtomicOps>(&self) -> (Option<SlotIndex>, bool) {
        let Some(asil_b) = self.asil_b.as_ref() else {
            return (self.qm.allocate_next_slot_with::<A>(), false);
        };

        if self.ignore_qm.load(Ordering::Acquire) {
            return (asil_b.allocate_next_slot_with::<A>(), true);
        }

        let slot = self.allocate_next_multi_slot::<A>(asil_b);
        if slot.is_some() {
            return (slot, false);
        }

        // Dual allocation failed within its budget: by definition the QM
        // consumers misbehave. Dismiss the whole QM channel permanently and
        // allocate solely within ASIL-B.
        self.ignore_qm.store(true, Ordering::Release);
        log::warn!(
            "[CTL] dual-quality allocation exhausted {MAX_MULTI_ALLOCATE_COUNT} retries; \
             dismissing QM consumers for this event"
        );
        (asil_b.allocate_next_slot_with::<A>(), true)
    }

    /// Publish a slot in every channel still attached
    pub fn event_ready(&self, slot: SlotIndex, timestamp: EventTimestamp) {
        if let Some(asil_b) = self.asil_b.as_ref() {
            asil_b.event_ready(slot, timestamp);
        }
        if !self.ignore_qm.load(Ordering::Acquire) {
            self.qm.event_ready(slot, timestamp);
        }
    }

    /// Give a claimed slot back in every channel still attached
    pub fn discard(&self, slot: SlotIndex) {
        if let Some(asil_b) = self.asil_b.as_ref() {
            asil_b.discard(slot);
        }
        if !self.ignore_qm.load(Ordering::Acquire) {
            self.qm.discard(slot);
        }
    }

    /// Timestamp of one slot, read from the safety channel when present
    #[must_use]
    pub fn event_slot_timestamp(&self, slot: SlotIndex) -> EventTimestamp {
        self.reference_control().slot_status(slot).time_stamp()
    }

    /// Newest published timestamp, at least 1
    #[must_use]
    pub fn latest_timestamp(&self) -> EventTimestamp {
        self.reference_control().latest_timestamp()
    }

    fn reference_control(&self) -> &EventDataControl {
        self.asil_b.as_ref().unwrap_or(&self.qm)
    }
}
