// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Per-subscriber transaction logs: the crash-recovery record of slot refs.
//!
//! Every reference and dereference a subscriber performs is bracketed by a
//! begin/commit pair written to that subscriber's log *around* the CAS on
//! the slot word. After a crash, the counters tell the rollback executor
//! exactly which decrements restore the slot ref-counts:
//!
//! - `begin > calls` on the reference side: the subscriber died mid-take;
//!   the slot increment is undone once.
//! - `begin > calls` on the dereference side: the subscriber died
//!   mid-release; the release counts as done.
//! - Otherwise `reference_calls - dereference_calls` refs are outstanding.
//!
//! A log is single-writer (the owning subscriber); other parties only read
//! it during rollback while holding the instance flock.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::error::{ComError, Result};
use crate::shm::arena::{Arena, ShmSlice};

/// Identifies the subscriber owning a transaction log (derived from the
/// proxy process uid)
pub type TransactionLogId = u32;

/// Index of a transaction log within one event's log set
pub type LogIndex = usize;

const NODE_UNUSED: u64 = 0;
const NODE_USED: u64 = 1;

fn pack_node_word(status: u64, id: TransactionLogId) -> u64 {
    (status << 32) | u64::from(id)
}

fn unpack_node_word(word: u64) -> (u64, TransactionLogId) {
    (word >> 32, (word & 0xFFFF_FFFF) as TransactionLogId)
}

/// Counters of one slot within one subscriber's log
#[repr(C)]
pub struct TransactionLogEntry {
    reference_begin: AtomicU32,
    reference_calls: AtomicU32,
    dereference_begin: AtomicU32,
    dereference_calls: AtomicU32,
}

/// Plain snapshot of a log entry, used by the rollback computation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TransactionSnapshot {
    /// Started reference transactions
    pub reference_begin: u32,
    /// Completed reference transactions
    pub reference_calls: u32,
    /// Started dereference transactions
    pub dereference_begin: u32,
    /// Completed dereference transactions
    pub dereference_calls: u32,
}

impl TransactionLogEntry {
    /// Record the start of a reference transaction
    #[inline]
    pub fn reference_transaction_begin(&self) {
        self.reference_begin.fetch_add(1, Ordering::AcqRel);
    }

    /// Undo a started reference transaction after a lost CAS
    #[inline]
    pub fn reference_transaction_abort(&self) {
        self.reference_begin.fetch_sub(1, Ordering::AcqRel);
    }

    /// Record a completed reference transaction
    #[inline]
    pub fn reference_transaction_commit(&self) {
        self.reference_calls.fetch_add(1, Ordering::AcqRel);
    }

    /// Record the start of a dereference transaction
    #[inline]
    pub fn dereference_transaction_begin(&self) {
        self.dereference_begin.fetch_add(1, Ordering::AcqRel);
    }

    /// Record a completed dereference transaction
    #[inline]
    pub fn dereference_transaction_commit(&self) {
        self.dereference_calls.fetch_add(1, Ordering::AcqRel);
    }

    /// References taken and not yet released by this subscriber
    #[inline]
    pub fn outstanding(&self) -> u32 {
        let taken = self.reference_calls.load(Ordering::Acquire);
        let released = self.dereference_calls.load(Ordering::Acquire);
        taken.saturating_sub(released)
    }

    /// Capture all four counters
    pub fn snapshot(&self) -> TransactionSnapshot {
        TransactionSnapshot {
            reference_begin: self.reference_begin.load(Ordering::Acquire),
            reference_calls: self.reference_calls.load(Ordering::Acquire),
            dereference_begin: self.dereference_begin.load(Ordering::Acquire),
            dereference_calls: self.dereference_calls.load(Ordering::Acquire),
        }
    }

    /// Zero all counters
    pub fn reset(&self) {
        self.reference_begin.store(0, Ordering::Release);
        self.reference_calls.store(0, Ordering::Release);
        self.dereference_begin.store(0, Ordering::Release);
        self.dereference_calls.store(0, Ordering::Release);
    }
}

/// Slot ref-count decrements required to erase a crashed subscriber's
/// contribution, per the recovery rules in the module docs.
#[must_use]
pub fn rollback_decrements(snapshot: TransactionSnapshot) -> u32 {
    let mut outstanding = snapshot
        .reference_calls
        .saturating_sub(snapshot.dereference_calls);
    if snapshot.dereference_begin > snapshot.dereference_calls {
        // Died mid-release: the slot decrement counts as done.
        outstanding = outstanding.saturating_sub(1);
    }
    let in_flight_reference = u32::from(snapshot.reference_begin > snapshot.reference_calls);
    outstanding + in_flight_reference
}

/// One subscriber's log: an acquisition word plus per-slot entries.
///
/// The acquisition word packs `{status, transaction_log_id}` into a single
/// atomic so registration is lock-free and readers never observe a
/// half-written pair.
#[repr(C)]
pub struct TransactionLogNode {
    status_id: AtomicU64,
    max_samples: AtomicU32,
    _pad: u32,
    entries: ShmSlice<TransactionLogEntry>,
}

impl TransactionLogNode {
    /// Current status and owning id
    fn status_and_id(&self) -> (u64, TransactionLogId) {
        unpack_node_word(self.status_id.load(Ordering::Acquire))
    }

    /// True when registered for the given id
    pub fn is_used_by(&self, id: TransactionLogId) -> bool {
        let (status, owner) = self.status_and_id();
        status == NODE_USED && owner == id
    }

    /// True when any subscriber is registered here
    pub fn is_used(&self) -> bool {
        self.status_and_id().0 == NODE_USED
    }

    /// Per-subscriber sample quota recorded at registration
    pub fn max_samples(&self) -> u32 {
        self.max_samples.load(Ordering::Acquire)
    }

    /// Entry for one slot
    pub fn entry<'a>(&self, arena: &'a Arena, slot: usize) -> &'a TransactionLogEntry {
        self.entries.at(arena, slot)
    }

    /// References this subscriber currently holds across all slots
    pub fn total_outstanding(&self, arena: &Arena) -> u32 {
        self.entries.iter(arena).map(TransactionLogEntry::outstanding).sum()
    }
}

/// The per-event set of transaction logs: one node per possible subscriber
/// plus one distinguished node for the skeleton's own tracing path (last).
#[repr(C)]
pub struct TransactionLogSet {
    nodes: ShmSlice<TransactionLogNode>,
}

impl TransactionLogSet {
    /// Create a log set for `max_subscribers` proxies over `num_slots`
    /// slots. The extra final node is the skeleton tracing log.
    pub fn create(arena: &Arena, max_subscribers: u16, num_slots: u16) -> Result<Self> {
        let nodes = arena.alloc_slice_zeroed::<TransactionLogNode>(usize::from(max_subscribers) + 1)?;
        for index in 0..nodes.len() {
            let entries = arena.alloc_slice_zeroed::<TransactionLogEntry>(usize::from(num_slots))?;
            let raw = nodes.at_raw(arena, index);
            // SAFETY: single-threaded construction before the segment is
            // published to any other participant.
            unsafe {
                std::ptr::addr_of_mut!((*raw).entries).write(entries);
            }
        }
        Ok(Self { nodes })
    }

    /// Number of proxy log nodes (excluding the skeleton tracing node)
    #[must_use]
    pub fn proxy_capacity(&self) -> usize {
        self.nodes.len() - 1
    }

    /// Index of the distinguished skeleton tracing log
    #[must_use]
    pub fn skeleton_index(&self) -> LogIndex {
        self.nodes.len() - 1
    }

    /// Borrow a node by index
    pub fn node<'a>(&self, arena: &'a Arena, index: LogIndex) -> &'a TransactionLogNode {
        self.nodes.at(arena, index)
    }

    /// Register a proxy subscriber, claiming a free node via CAS.
    ///
    /// Fails when the same id is already registered (a subscriber must not
    /// hold two logs for one event) or all nodes are taken.
    pub fn register_proxy(
        &self,
        arena: &Arena,
        id: TransactionLogId,
        max_samples: u32,
    ) -> Result<LogIndex> {
        for index in 0..self.proxy_capacity() {
            if self.node(arena, index).is_used_by(id) {
                return Err(ComError::BindingFailure(format!(
                    "transaction log for subscriber {id} already registered"
                )));
            }
        }
        for index in 0..self.proxy_capacity() {
            let node = self.node(arena, index);
            let word = node.status_id.load(Ordering::Acquire);
            let (status, _) = unpack_node_word(word);
            if status != NODE_UNUSED {
                continue;
            }
            if node
                .status_id
                .compare_exchange(
                    word,
                    pack_node_word(NODE_USED, id),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                node.max_samples.store(max_samples, Ordering::Release);
                for entry in node.entries.iter(arena) {
                    entry.reset();
                }
                return Ok(index);
            }
        }
        Err(ComError::BindingFailure(
            "no free transaction log: max subscribers reached".into(),
        ))
    }

    /// Claim the distinguished skeleton tracing log
    pub fn register_skeleton(&self, arena: &Arena) -> LogIndex {
        let index = self.skeleton_index();
        let node = self.node(arena, index);
        for entry in node.entries.iter(arena) {
            entry.reset();
        }
        node.max_samples.store(u32::MAX, Ordering::Release);
        node.status_id
            .store(pack_node_word(NODE_USED, 0), Ordering::Release);
        index
    }

    /// Release a node after a clean unsubscribe or a completed rollback
    pub fn unregister(&self, arena: &Arena, index: LogIndex) {
        let node = self.node(arena, index);
        for entry in node.entries.iter(arena) {
            entry.reset();
        }
        node.status_id.store(NODE_UNUSED, Ordering::Release);
    }

    /// Indices of proxy nodes registered for the given id
    pub fn proxy_nodes_for(&self, arena: &Arena, id: TransactionLogId) -> Vec<LogIndex> {
        (0..self.proxy_capacity())
            .filter(|index| self.node(arena, *index).is_used_by(id))
            .collect()
    }
}
