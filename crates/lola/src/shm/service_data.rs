// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Root objects of the control and data segments.
//!
//! The control segment root maps each element to its control block and
//! carries the uid→pid table; the data segment root maps each element to
//! its raw payload array plus a meta-info record `{size, alignment, slot
//! count}`. The core never interprets payload bytes beyond that layout
//! information.

use std::marker::PhantomData;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use crate::control::event_control::{EventControlShm, EventDataControl, SkeletonEventProperties};
use crate::control::uid_pid::UidPidMapping;
use crate::error::{ComError, Result};
use crate::shm::arena::{Arena, ShmMap};
use crate::types::ElementFqId;

/// Size and alignment of one sample type, as seen by the core
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SampleLayout {
    /// `size_of::<SampleType>()`
    pub size: u32,
    /// `align_of::<SampleType>()`
    pub align: u32,
}

impl SampleLayout {
    /// Layout of a concrete sample type
    #[must_use]
    pub fn of<T>() -> Self {
        Self {
            size: std::mem::size_of::<T>() as u32,
            align: std::mem::align_of::<T>() as u32,
        }
    }
}

/// Meta information of one registered event, resident in the data segment
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct EventMetaInfo {
    /// Sample size in bytes
    pub sample_size: u32,
    /// Sample alignment in bytes
    pub sample_align: u32,
    /// Number of slots in the payload array
    pub number_of_slots: u16,
    _pad: u16,
    /// Offset of the payload array within the data segment
    pub data_offset: u64,
}

/// Payload array record in the data segment root
#[repr(C)]
pub struct EventStorageRecord {
    /// Offset of the raw payload array
    pub data_offset: u64,
    /// Length of the array in bytes
    pub len_bytes: u64,
}

/// Root object of the control segment
#[repr(C)]
pub struct ServiceDataControlShm {
    event_controls: ShmMap<ElementFqId, EventControlShm>,
    uid_pid: UidPidMapping,
}

/// Root object of the data segment
#[repr(C)]
pub struct ServiceDataStorageShm {
    skeleton_pid: AtomicI32,
    _pad: u32,
    events: ShmMap<ElementFqId, EventStorageRecord>,
    events_metainfo: ShmMap<ElementFqId, EventMetaInfo>,
}

/// Process-local view of a control segment root
pub struct ServiceDataControl {
    arena: Arc<Arena>,
    root: *mut ServiceDataControlShm,
}

// SAFETY: all mutable state behind the pointer is atomic or published via
// release stores; the Arc keeps the mapping alive.
unsafe impl Send for ServiceDataControl {}
unsafe impl Sync for ServiceDataControl {}

impl ServiceDataControl {
    /// Construct the root in a freshly created control arena
    pub fn create(arena: Arc<Arena>, element_capacity: usize, uid_pid_capacity: u16) -> Result<Self> {
        let root_value = ServiceDataControlShm {
            event_controls: ShmMap::create(&arena, element_capacity)?,
            uid_pid: UidPidMapping::create(&arena, uid_pid_capacity)?,
        };
        let offset = arena.alloc_value(root_value)?;
        arena.set_root(offset);
        let root = arena.at::<ServiceDataControlShm>(offset.raw());
        Ok(Self { arena, root })
    }

    /// Attach to the root published in an opened control arena
    pub fn open(arena: Arc<Arena>) -> Self {
        let root = arena.root::<ServiceDataControlShm>();
        Self { arena, root }
    }

    fn shm(&self) -> &ServiceDataControlShm {
        // SAFETY: root() aborts on a missing root; the pointer is valid for
        // the arena's lifetime.
        unsafe { &*self.root }
    }

    /// The arena this root lives in
    #[must_use]
    pub fn arena(&self) -> &Arc<Arena> {
        &self.arena
    }

    /// Create the control block for one element
    pub fn insert_event_control(
        &self,
        fq_id: ElementFqId,
        properties: &SkeletonEventProperties,
    ) -> Result<EventDataControl> {
        let value = EventControlShm::new_in(&self.arena, properties)?;
        let ptr = self.shm().event_controls.insert(&self.arena, fq_id, value)?;
        Ok(EventDataControl::from_raw(Arc::clone(&self.arena), ptr))
    }

    /// Look up the control block of one element
    #[must_use]
    pub fn event_control(&self, fq_id: &ElementFqId) -> Option<EventDataControl> {
        self.shm()
            .event_controls
            .get(&self.arena, fq_id)
            .map(|ptr| EventDataControl::from_raw(Arc::clone(&self.arena), ptr))
    }

    /// Ids of all registered elements
    #[must_use]
    pub fn element_ids(&self) -> Vec<ElementFqId> {
        self.shm()
            .event_controls
            .iter(&self.arena)
            .map(|(fq_id, _)| *fq_id)
            .collect()
    }

    /// Register the calling process in the uid→pid table
    #[must_use]
    pub fn register_pid(&self, uid: u32, pid: i32) -> Option<i32> {
        self.shm().uid_pid.register_pid(&self.arena, uid, pid)
    }

    /// Current pid registered for a uid
    #[must_use]
    pub fn registered_pid(&self, uid: u32) -> Option<i32> {
        self.shm().uid_pid.lookup(&self.arena, uid)
    }
}

/// Process-local view of a data segment root
pub struct ServiceDataStorage {
    arena: Arc<Arena>,
    root: *mut ServiceDataStorageShm,
}

// SAFETY: see ServiceDataControl.
unsafe impl Send for ServiceDataStorage {}
unsafe impl Sync for ServiceDataStorage {}

impl ServiceDataStorage {
    /// Construct the root in a freshly created data arena
    pub fn create(arena: Arc<Arena>, element_capacity: usize, skeleton_pid: i32) -> Result<Self> {
        let root_value = ServiceDataStorageShm {
            skeleton_pid: AtomicI32::new(skeleton_pid),
            _pad: 0,
            events: ShmMap::create(&arena, element_capacity)?,
            events_metainfo: ShmMap::create(&arena, element_capacity)?,
        };
        let offset = arena.alloc_value(root_value)?;
        arena.set_root(offset);
        let root = arena.at::<ServiceDataStorageShm>(offset.raw());
        Ok(Self { arena, root })
    }

    /// Attach to the root published in an opened data arena
    pub fn open(arena: Arc<Arena>) -> Self {
        let root = arena.root::<ServiceDataStorageShm>();
        Self { arena, root }
    }

    fn shm(&self) -> &ServiceDataStorageShm {
        // SAFETY: see ServiceDataControl::shm.
        unsafe { &*self.root }
    }

    /// The arena this root lives in
    #[must_use]
    pub fn arena(&self) -> &Arc<Arena> {
        &self.arena
    }

    /// Pid of the providing skeleton process
    #[must_use]
    pub fn skeleton_pid(&self) -> i32 {
        self.shm().skeleton_pid.load(Ordering::Acquire)
    }

    /// Update the provider pid (restarted skeleton re-opening the arena)
    pub fn set_skeleton_pid(&self, pid: i32) {
        self.shm().skeleton_pid.store(pid, Ordering::Release);
    }

    /// Allocate the payload array for one element and record it together
    /// with its meta info
    pub fn insert_event_storage(
        &self,
        fq_id: ElementFqId,
        number_of_slots: u16,
        layout: SampleLayout,
    ) -> Result<u64> {
        let len_bytes = u64::from(layout.size) * u64::from(number_of_slots);
        let data_offset = self
            .arena
            .allocate(len_bytes as usize, layout.align as usize)?;
        self.shm().events.insert(
            &self.arena,
            fq_id,
            EventStorageRecord {
                data_offset,
                len_bytes,
            },
        )?;
        self.shm().events_metainfo.insert(
            &self.arena,
            fq_id,
            EventMetaInfo {
                sample_size: layout.size,
                sample_align: layout.align,
                number_of_slots,
                _pad: 0,
                data_offset,
            },
        )?;
        Ok(data_offset)
    }

    /// Meta info of one registered element
    #[must_use]
    pub fn meta_info(&self, fq_id: &ElementFqId) -> Option<EventMetaInfo> {
        self.shm()
            .events_metainfo
            .get(&self.arena, fq_id)
            // SAFETY: the pointer comes from a published map entry.
            .map(|ptr| unsafe { *ptr })
    }

    /// Typed view onto the payload array of one element.
    ///
    /// Fails when the element is unknown or `T` does not match the layout
    /// recorded by the providing skeleton.
    pub fn event_storage<T>(&self, fq_id: &ElementFqId) -> Result<EventDataStorage<T>> {
        let meta = self.meta_info(fq_id).ok_or_else(|| {
            ComError::BindingFailure(format!("no storage registered for element {fq_id}"))
        })?;
        let expected = SampleLayout::of::<T>();
        if meta.sample_size != expected.size || meta.sample_align != expected.align {
            return Err(ComError::BindingFailure(format!(
                "sample layout mismatch for element {fq_id}: \
                 provider {}x{} vs consumer {}x{}",
                meta.sample_size, meta.sample_align, expected.size, expected.align
            )));
        }
        Ok(EventDataStorage {
            arena: Arc::clone(&self.arena),
            offset: meta.data_offset,
            len: usize::from(meta.number_of_slots),
            _marker: PhantomData,
        })
    }
}

/// Typed view onto one event's payload slot array.
///
/// Access is only synchronised through the control block: a writer must
/// own the slot (in-writing), a reader must hold a reference on it.
pub struct EventDataStorage<T> {
    arena: Arc<Arena>,
    offset: u64,
    len: usize,
    _marker: PhantomData<T>,
}

// SAFETY: raw payload access is gated by the slot protocol documented on
// the type; the view itself carries no thread affinity.
unsafe impl<T: Send> Send for EventDataStorage<T> {}
unsafe impl<T: Sync> Sync for EventDataStorage<T> {}

impl<T> Clone for EventDataStorage<T> {
    fn clone(&self) -> Self {
        Self {
            arena: Arc::clone(&self.arena),
            offset: self.offset,
            len: self.len,
            _marker: PhantomData,
        }
    }
}

impl<T> EventDataStorage<T> {
    /// Number of slots
    #[must_use]
    pub fn num_slots(&self) -> usize {
        self.len
    }

    /// Raw pointer to one slot's payload
    #[must_use]
    pub fn slot_ptr(&self, slot: usize) -> *mut T {
        assert!(slot < self.len, "slot {slot} out of {}", self.len);
        self.arena
            .at::<T>(self.offset + (slot * std::mem::size_of::<T>()) as u64)
    }

    /// Borrow one slot's payload.
    ///
    /// # Safety
    ///
    /// The caller must hold a reference on the slot (or own it in-writing)
    /// via the control block, so no producer mutates it concurrently.
    #[must_use]
    pub unsafe fn slot(&self, slot: usize) -> &T {
        &*self.slot_ptr(slot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ElementType;

    fn fq(element: u8) -> ElementFqId {
        ElementFqId::new(10, element, 1, ElementType::Event)
    }

    fn control_root() -> ServiceDataControl {
        let arena = Arc::new(Arena::create_on_heap(512 * 1024).expect("arena"));
        ServiceDataControl::create(arena, 4, 8).expect("root")
    }

    fn storage_root() -> ServiceDataStorage {
        let arena = Arc::new(Arena::create_on_heap(512 * 1024).expect("arena"));
        ServiceDataStorage::create(arena, 4, 4242).expect("root")
    }

    #[test]
    fn test_control_root_event_lifecycle() {
        let root = control_root();
        let props = SkeletonEventProperties {
            number_of_slots: 3,
            max_subscribers: 2,
            enforce_max_samples: false,
        };
        assert!(root.event_control(&fq(1)).is_none());
        let ctl = root.insert_event_control(fq(1), &props).expect("insert");
        assert_eq!(ctl.num_slots(), 3);

        let looked_up = root.event_control(&fq(1)).expect("lookup");
        assert_eq!(looked_up.num_slots(), 3);
        assert_eq!(root.element_ids(), vec![fq(1)]);
    }

    #[test]
    fn test_control_root_uid_pid_delegation() {
        let root = control_root();
        assert_eq!(root.register_pid(42, 100), Some(100));
        assert_eq!(root.register_pid(42, 101), Some(100));
        assert_eq!(root.registered_pid(42), Some(101));
    }

    #[test]
    fn test_storage_root_typed_access() {
        let root = storage_root();
        assert_eq!(root.skeleton_pid(), 4242);

        root.insert_event_storage(fq(1), 4, SampleLayout::of::<u64>())
            .expect("insert");
        let meta = root.meta_info(&fq(1)).expect("meta");
        assert_eq!(meta.sample_size, 8);
        assert_eq!(meta.number_of_slots, 4);

        let storage = root.event_storage::<u64>(&fq(1)).expect("typed view");
        assert_eq!(storage.num_slots(), 4);
        // SAFETY: no concurrent access in this test.
        unsafe {
            *storage.slot_ptr(2) = 0xFEED;
            assert_eq!(*storage.slot(2), 0xFEED);
        }
    }

    #[test]
    fn test_storage_rejects_layout_mismatch() {
        let root = storage_root();
        root.insert_event_storage(fq(1), 4, SampleLayout::of::<u64>())
            .expect("insert");
        assert!(root.event_storage::<u32>(&fq(1)).is_err());
        assert!(root.event_storage::<u64>(&fq(2)).is_err());
    }

    #[test]
    fn test_storage_pid_update() {
        let root = storage_root();
        root.set_skeleton_pid(77);
        assert_eq!(root.skeleton_pid(), 77);
    }
}
