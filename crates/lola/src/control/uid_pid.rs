// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Lock-free uid→pid mapping, resident in the control segment.
//!
//! Every proxy application registers its uid together with its current pid
//! here. A restarted proxy gets its previous pid back from
//! [`UidPidMapping::register_pid`] and uses that to tell the skeleton side
//! which pid's messaging artefacts are stale.
//!
//! Each entry packs `{status, uid}` into a single atomic word so readers
//! never observe a half-written pair; the plain pid value is only mutated
//! by the entry's owning uid or while the entry is held in the `Updating`
//! state. There is intentionally no unregister: mappings are overwritten
//! on restart, never removed.

use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};

use crate::control::atomics::{AtomicOps, RealAtomics};
use crate::error::Result;
use crate::shm::arena::{Arena, ShmSlice};

/// Registration retry budget for claiming a free entry
const MAX_REGISTER_RETRIES: usize = 50;

const STATUS_UNUSED: u64 = 0;
const STATUS_USED: u64 = 1;
const STATUS_UPDATING: u64 = 2;

fn pack_key(status: u64, uid: u32) -> u64 {
    (status << 32) | u64::from(uid)
}

fn unpack_key(word: u64) -> (u64, u32) {
    (word >> 32, (word & 0xFFFF_FFFF) as u32)
}

/// One uid→pid entry
#[repr(C)]
pub struct UidPidMappingEntry {
    key_uid_status: AtomicU64,
    pid: AtomicI32,
    _pad: u32,
}

impl UidPidMappingEntry {
    fn status_and_uid(&self) -> (u64, u32) {
        unpack_key(self.key_uid_status.load(Ordering::Acquire))
    }

    fn set_status_and_uid(&self, status: u64, uid: u32) {
        self.key_uid_status.store(pack_key(status, uid), Ordering::Release);
    }
}

/// Fixed-capacity uid→pid table
#[repr(C)]
pub struct UidPidMapping {
    entries: ShmSlice<UidPidMappingEntry>,
}

impl UidPidMapping {
    /// Create a table with space for `capacity` uids
    pub fn create(arena: &Arena, capacity: u16) -> Result<Self> {
        Ok(Self {
            entries: arena.alloc_slice_zeroed::<UidPidMappingEntry>(usize::from(capacity))?,
        })
    }

    /// Register `pid` for `uid`, overwriting an existing mapping.
    ///
    /// Returns the previous pid when the uid was already mapped, the new
    /// pid on first registration, and `None` when the table is full.
    pub fn register_pid(&self, arena: &Arena, uid: u32, pid: i32) -> Option<i32> {
        self.register_pid_with::<RealAtomics>(arena, uid, pid)
    }

    pub(crate) fn register_pid_with<A: AtomicOps>(
        &self,
        arena: &Arena,
        uid: u32,
        pid: i32,
    ) -> Option<i32> {
        if let Some(previous) = self.try_update_existing(arena, uid, pid) {
            return Some(previous);
        }

        for _ in 0..MAX_REGISTER_RETRIES {
            for index in 0..self.entries.len() {
                let entry = self.entries.at(arena, index);
                let word = entry.key_uid_status.load(Ordering::Acquire);
                let (status, _) = unpack_key(word);
                if status != STATUS_UNUSED {
                    continue;
                }
                if A::compare_exchange(&entry.key_uid_status, word, pack_key(STATUS_UPDATING, uid))
                    .is_ok()
                {
                    entry.pid.store(pid, Ordering::Release);
                    entry.set_status_and_uid(STATUS_USED, uid);
                    return Some(pid);
                }
            }
        }
        None
    }

    /// Update the pid in place when the uid already owns an entry.
    ///
    /// An entry found in `Updating` state for our own uid means this
    /// application crashed in the middle of a previous registration; the
    /// entry is taken over and finalised.
    fn try_update_existing(&self, arena: &Arena, uid: u32, pid: i32) -> Option<i32> {
        for index in 0..self.entries.len() {
            let entry = self.entries.at(arena, index);
            let (status, entry_uid) = entry.status_and_uid();
            if status == STATUS_USED && entry_uid == uid {
                // Owned by our uid: update in place without state changes.
                let previous = entry.pid.swap(pid, Ordering::AcqRel);
                return Some(previous);
            }
            if status == STATUS_UPDATING && entry_uid == uid {
                log::warn!(
                    "[CTL] found uid→pid entry for own uid in Updating state; \
                     taking over after a previous crash"
                );
                entry.pid.store(pid, Ordering::Release);
                entry.set_status_and_uid(STATUS_USED, uid);
                return Some(pid);
            }
        }
        None
    }

    /// Current pid registered for a uid, if any
    pub fn lookup(&self, arena: &Arena, uid: u32) -> Option<i32> {
        for index in 0..self.entries.len() {
            let entry = self.entries.at(arena, index);
            let (status, entry_uid) = entry.status_and_uid();
            if status == STATUS_USED && entry_uid == uid {
                return Some(entry.pid.load(Ordering::Acquire));
            }
        }
        None
    }

    /// Force an entry into the `Updating` state (test support for the
    /// crash-takeover path)
    #[cfg(test)]
    fn poison_updating(&self, arena: &Arena, uid: u32) {
        for index in 0..self.entries.len() {
            let entry = self.entries.at(arena, index);
            let (status, entry_uid) = entry.status_and_uid();
            if status == STATUS_USED && entry_uid == uid {
                entry.set_status_and_uid(STATUS_UPDATING, uid);
                return;
            }
        }
        panic!("no entry for uid {uid}");
    }
}
