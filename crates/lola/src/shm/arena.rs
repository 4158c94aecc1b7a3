// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Relocatable arena over a shared-memory segment.
//!
//! The same segment is mapped at different virtual addresses in different
//! processes, so nothing inside it may hold a pointer. The arena therefore
//! hands out *offsets* relative to the segment base; typed references are
//! reconstructed through the local [`Arena`] handle that knows the base of
//! this process' mapping.
//!
//! Allocation is a lock-free atomic bump whose cursor lives in the segment
//! header itself, so the used-bytes count survives re-mapping. Freeing is
//! intentionally absent: every allocation lives until the skeleton removes
//! the whole segment.
//!
//! The arena can also be backed by anonymous heap memory. The sizing
//! simulation runs the real segment construction against a heap arena and
//! reads back the peak via [`Arena::used_bytes`].

use std::alloc::{self, Layout};
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{ComError, Result};
use crate::shm::segment::ShmSegment;

const ARENA_MAGIC: u32 = 0x4C6F_4C61; // "LoLa"
const ARENA_VERSION: u32 = 1;

/// Header at offset 0 of every arena-managed segment
#[repr(C)]
struct ArenaHeader {
    magic: u32,
    version: u32,
    capacity: u64,
    /// Bump cursor: offset of the next free byte
    bump: AtomicU64,
    /// Offset of the root object, 0 while unset
    root: AtomicU64,
}

enum Backing {
    Segment(ShmSegment),
    Heap { ptr: *mut u8, layout: Layout },
}

/// Arena handle local to this process' mapping of a segment
pub struct Arena {
    base: *mut u8,
    capacity: usize,
    backing: Backing,
}

// SAFETY: the arena only exposes offset arithmetic over a mapping designed
// for cross-process concurrent access; all shared mutable state inside it
// is atomic.
unsafe impl Send for Arena {}
unsafe impl Sync for Arena {}

fn align_up(value: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    (value + align - 1) & !(align - 1)
}

impl Arena {
    /// Initialise a freshly created (zero-filled) segment
    pub fn create_in_segment(segment: ShmSegment) -> Result<Self> {
        let arena = Self {
            base: segment.as_ptr(),
            capacity: segment.size(),
            backing: Backing::Segment(segment),
        };
        arena.init_header();
        Ok(arena)
    }

    /// Attach to an already initialised segment
    pub fn open_segment(segment: ShmSegment) -> Result<Self> {
        let arena = Self {
            base: segment.as_ptr(),
            capacity: segment.size(),
            backing: Backing::Segment(segment),
        };
        let header = arena.header();
        if header.magic != ARENA_MAGIC
            || header.version != ARENA_VERSION
            || header.capacity as usize > arena.capacity
        {
            return Err(ComError::BindingFailure(
                "segment does not carry a valid arena header".into(),
            ));
        }
        Ok(arena)
    }

    /// Heap-backed arena for the sizing simulation
    pub fn create_on_heap(capacity: usize) -> Result<Self> {
        let layout = Layout::from_size_align(capacity, 64)
            .map_err(|_| ComError::BindingFailure("invalid arena capacity".into()))?;
        // SAFETY: layout has non-zero size for every sane capacity; the
        // allocation is checked for null below and freed in Drop.
        let ptr = unsafe { alloc::alloc_zeroed(layout) };
        if ptr.is_null() {
            return Err(ComError::BindingFailure(
                "heap arena allocation failed".into(),
            ));
        }
        let arena = Self {
            base: ptr,
            capacity,
            backing: Backing::Heap { ptr, layout },
        };
        arena.init_header();
        Ok(arena)
    }

    fn init_header(&self) {
        let start = align_up(std::mem::size_of::<ArenaHeader>(), 16) as u64;
        // SAFETY: the header region is in bounds (capacity is always larger
        // than the header) and the backing memory is zero-filled, so this is
        // the first write.
        unsafe {
            let header = self.base.cast::<ArenaHeader>();
            (*header).magic = ARENA_MAGIC;
            (*header).version = ARENA_VERSION;
            (*header).capacity = self.capacity as u64;
            (*header).bump = AtomicU64::new(start);
            (*header).root = AtomicU64::new(0);
        }
    }

    fn header(&self) -> &ArenaHeader {
        // SAFETY: every backing is at least header-sized and the header is
        // initialised by the creating process before any other participant
        // can open the segment.
        unsafe { &*self.base.cast::<ArenaHeader>() }
    }

    /// Total capacity of the backing memory
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes consumed so far, including the header
    #[must_use]
    pub fn used_bytes(&self) -> usize {
        self.header().bump.load(Ordering::Acquire) as usize
    }

    /// Allocate `size` bytes at `align`; returns the offset from the base.
    ///
    /// The returned memory is zero-filled (segments are created zero-filled
    /// and never freed piecemeal).
    pub fn allocate(&self, size: usize, align: usize) -> Result<u64> {
        let header = self.header();
        loop {
            let current = header.bump.load(Ordering::Acquire);
            let offset = align_up(current as usize, align);
            let next = offset
                .checked_add(size)
                .ok_or_else(|| ComError::BindingFailure("arena allocation overflow".into()))?;
            if next > self.capacity {
                return Err(ComError::BindingFailure(format!(
                    "arena exhausted: need {size} bytes, {} of {} used",
                    current, self.capacity
                )));
            }
            if header
                .bump
                .compare_exchange(current, next as u64, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Ok(offset as u64);
            }
        }
    }

    /// Resolve an offset to a typed pointer in this process' mapping
    #[inline]
    pub fn at<T>(&self, offset: u64) -> *mut T {
        debug_assert!(offset as usize + std::mem::size_of::<T>() <= self.capacity);
        debug_assert!(offset as usize % std::mem::align_of::<T>() == 0);
        // SAFETY bound: callers only pass offsets produced by allocate()
        // for a T of matching layout.
        unsafe { self.base.add(offset as usize).cast::<T>() }
    }

    /// Move a value into freshly allocated arena memory
    pub fn alloc_value<T>(&self, value: T) -> Result<ShmOffset<T>> {
        let offset = self.allocate(std::mem::size_of::<T>(), std::mem::align_of::<T>())?;
        // SAFETY: the offset was just allocated for a T and is exclusively
        // ours until published.
        unsafe { self.at::<T>(offset).write(value) };
        Ok(ShmOffset {
            offset,
            _marker: PhantomData,
        })
    }

    /// Allocate a zero-initialised slice of `len` elements.
    ///
    /// Only valid for types whose all-zero bit pattern is a legal value
    /// (slot words, counters, map slots).
    pub fn alloc_slice_zeroed<T>(&self, len: usize) -> Result<ShmSlice<T>> {
        let offset = self.allocate(
            std::mem::size_of::<T>().saturating_mul(len),
            std::mem::align_of::<T>(),
        )?;
        Ok(ShmSlice {
            offset,
            len: len as u64,
            _marker: PhantomData,
        })
    }

    /// Publish the root object of this segment
    pub fn set_root<T>(&self, root: ShmOffset<T>) {
        self.header().root.store(root.offset, Ordering::Release);
    }

    /// Resolve the root object published by the creating process.
    ///
    /// Aborts the process if no root has been published: a mapped segment
    /// without a root means the participants disagree about the segment
    /// contents and no safe interpretation exists.
    pub fn root<T>(&self) -> *mut T {
        let offset = self.header().root.load(Ordering::Acquire);
        if offset == 0 {
            log::error!("[SHM] segment has no published root object, aborting");
            std::process::abort();
        }
        self.at::<T>(offset)
    }

    /// Whether a root object has been published yet
    #[must_use]
    pub fn has_root(&self) -> bool {
        self.header().root.load(Ordering::Acquire) != 0
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        if let Backing::Heap { ptr, layout } = self.backing {
            // SAFETY: ptr/layout come from the alloc_zeroed in
            // create_on_heap and Drop runs at most once.
            unsafe { alloc::dealloc(ptr, layout) };
        }
    }
}

/// Typed offset of a single value inside an arena
#[repr(transparent)]
pub struct ShmOffset<T> {
    offset: u64,
    _marker: PhantomData<T>,
}

impl<T> Clone for ShmOffset<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T> Copy for ShmOffset<T> {}

impl<T> ShmOffset<T> {
    /// Raw offset value
    #[must_use]
    pub fn raw(self) -> u64 {
        self.offset
    }
}

/// Typed offset-based slice resident in an arena.
///
/// The slice descriptor itself may be stored inside shared memory; all
/// element access goes through the local [`Arena`] handle.
#[repr(C)]
pub struct ShmSlice<T> {
    offset: u64,
    len: u64,
    _marker: PhantomData<T>,
}

impl<T> Clone for ShmSlice<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T> Copy for ShmSlice<T> {}

impl<T> ShmSlice<T> {
    /// Descriptor of an empty slice (all-zero encoding)
    #[must_use]
    pub fn empty() -> Self {
        Self {
            offset: 0,
            len: 0,
            _marker: PhantomData,
        }
    }

    /// Number of elements
    #[must_use]
    pub fn len(&self) -> usize {
        self.len as usize
    }

    /// True when the slice holds no elements
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Borrow one element
    pub fn at<'a>(&self, arena: &'a Arena, index: usize) -> &'a T {
        assert!(index < self.len(), "slice index {index} out of {}", self.len());
        // SAFETY: the descriptor was produced by alloc_slice_zeroed for this
        // element type and index is bounds-checked above.
        unsafe { &*arena.at::<T>(self.offset + (index * std::mem::size_of::<T>()) as u64) }
    }

    /// Raw pointer to one element (single-threaded construction only)
    pub(crate) fn at_raw(&self, arena: &Arena, index: usize) -> *mut T {
        assert!(index < self.len(), "slice index {index} out of {}", self.len());
        arena.at::<T>(self.offset + (index * std::mem::size_of::<T>()) as u64)
    }

    /// Iterate over all elements
    pub fn iter<'a>(&self, arena: &'a Arena) -> impl Iterator<Item = &'a T> + 'a
    where
        T: 'a,
    {
        let slice = *self;
        (0..slice.len()).map(move |i| slice.at(arena, i))
    }
}

/// Fixed-capacity map resident in an arena.
///
/// Capacity is fixed at creation (the deployment knows the element count up
/// front); lookups are a linear scan, which is exact for the handful of
/// service elements per instance. Slots are claimed with a CAS and become
/// visible to readers through a release-store of the slot state, so lookups
/// from other processes never observe a half-written entry.
#[repr(C)]
pub struct ShmMap<K, V> {
    slots: ShmSlice<MapSlot<K, V>>,
}

const MAP_SLOT_FREE: u32 = 0;
const MAP_SLOT_CLAIMED: u32 = 1;
const MAP_SLOT_READY: u32 = 2;

/// One entry of a [`ShmMap`]
#[repr(C)]
pub struct MapSlot<K, V> {
    state: std::sync::atomic::AtomicU32,
    key: K,
    value: V,
}

impl<K: Copy + PartialEq, V> ShmMap<K, V> {
    /// Create a map with space for `capacity` entries
    pub fn create(arena: &Arena, capacity: usize) -> Result<Self> {
        Ok(Self {
            slots: arena.alloc_slice_zeroed::<MapSlot<K, V>>(capacity)?,
        })
    }

    /// Total entry capacity
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of occupied entries
    pub fn len(&self, arena: &Arena) -> usize {
        self.slots
            .iter(arena)
            .filter(|s| s.state.load(Ordering::Acquire) == MAP_SLOT_READY)
            .count()
    }

    /// True when no entries are occupied
    pub fn is_empty(&self, arena: &Arena) -> bool {
        self.len(arena) == 0
    }

    /// Insert a new entry; fails when the key exists or the map is full
    pub fn insert(&self, arena: &Arena, key: K, value: V) -> Result<*mut V> {
        if self.get(arena, &key).is_some() {
            return Err(ComError::BindingFailure(
                "duplicate key in shared-memory map".into(),
            ));
        }
        for index in 0..self.slots.len() {
            let slot = self.slots.at(arena, index);
            if slot
                .state
                .compare_exchange(
                    MAP_SLOT_FREE,
                    MAP_SLOT_CLAIMED,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                let raw = self.slots.at_raw(arena, index);
                // SAFETY: the CAS above gives this thread exclusive claim of
                // the slot; key/value are written before the release-store
                // that publishes the entry.
                unsafe {
                    std::ptr::addr_of_mut!((*raw).key).write(key);
                    std::ptr::addr_of_mut!((*raw).value).write(value);
                }
                slot.state.store(MAP_SLOT_READY, Ordering::Release);
                // SAFETY: value was just initialised above.
                return Ok(unsafe { std::ptr::addr_of_mut!((*raw).value) });
            }
        }
        Err(ComError::BindingFailure(
            "shared-memory map is full".into(),
        ))
    }

    /// Look up an entry by key
    pub fn get(&self, arena: &Arena, key: &K) -> Option<*mut V> {
        for index in 0..self.slots.len() {
            let slot = self.slots.at(arena, index);
            if slot.state.load(Ordering::Acquire) == MAP_SLOT_READY && slot.key == *key {
                let raw = self.slots.at_raw(arena, index);
                // SAFETY: READY entries are fully initialised.
                return Some(unsafe { std::ptr::addr_of_mut!((*raw).value) });
            }
        }
        None
    }

    /// Iterate over all occupied entries
    pub fn iter<'a>(&self, arena: &'a Arena) -> impl Iterator<Item = (&'a K, &'a V)> + 'a
    where
        K: 'a,
        V: 'a,
    {
        let slots = self.slots;
        (0..slots.len()).filter_map(move |index| {
            let slot = slots.at(arena, index);
            if slot.state.load(Ordering::Acquire) == MAP_SLOT_READY {
                Some((&slot.key, &slot.value))
            } else {
                None
            }
        })
    }
}
