// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! POSIX shared memory segment management.
//!
//! Safe wrappers around `shm_open`, `ftruncate` and `mmap` for creating and
//! mapping the control and data segments. The mapping address is chosen by
//! the OS in every process, which is why everything stored inside a segment
//! is offset-based (see [`crate::shm::arena`]).
//!
//! # Segment Lifecycle
//!
//! 1. The skeleton creates segments with [`ShmSegment::create`]
//! 2. Proxies open them with [`ShmSegment::open`]
//! 3. A segment is unmapped on drop
//! 4. The skeleton unlinks segments at stop-offer when no proxy holds the
//!    usage flock

use std::ffi::CString;
use std::io;
use std::ptr;

use crate::error::{ComError, Result};

/// POSIX shared memory segment wrapper.
///
/// Automatically unmaps the memory region on drop. Does NOT automatically
/// unlink the segment (the skeleton decides when, guarded by the usage
/// marker flock).
pub struct ShmSegment {
    /// Pointer to the mapped region
    ptr: *mut u8,
    /// Size of the mapping
    size: usize,
    /// Segment name (for unlink)
    name: String,
}

// SAFETY: the mapped region is designed for concurrent access across
// processes; all shared state inside it is accessed through atomics.
unsafe impl Send for ShmSegment {}
unsafe impl Sync for ShmSegment {}

impl ShmSegment {
    /// Create a new shared memory segment with the given permission bits.
    ///
    /// Fails if a segment with this name already exists; stale segments are
    /// removed beforehand by the skeleton's artefact cleanup.
    pub fn create(name: &str, size: usize, mode: u32) -> Result<Self> {
        Self::validate_name(name)?;

        let c_name = CString::new(name)
            .map_err(|_| ComError::BindingFailure(format!("invalid segment name: {name}")))?;

        // SAFETY:
        // - c_name is a valid null-terminated CString created above
        // - O_CREAT|O_RDWR|O_EXCL creates a new segment or fails if it exists
        // - mode is a plain permission mask supplied by the caller
        let fd = unsafe {
            libc::shm_open(
                c_name.as_ptr(),
                libc::O_CREAT | libc::O_RDWR | libc::O_EXCL,
                mode as libc::mode_t,
            )
        };
        if fd < 0 {
            return Err(ComError::ErroneousFileHandle(io::Error::last_os_error()));
        }

        // shm_open applies the umask; force the exact deployment bits.
        // SAFETY: fd is a valid descriptor from the successful shm_open above.
        unsafe { libc::fchmod(fd, mode as libc::mode_t) };

        // SAFETY: fd is valid; ftruncate fails gracefully on bad sizes.
        let ret = unsafe { libc::ftruncate(fd, size as libc::off_t) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            // SAFETY: fd is still valid and not used after this error path.
            unsafe { libc::close(fd) };
            return Err(ComError::ErroneousFileHandle(err));
        }

        let ptr = Self::map(fd, size);
        // SAFETY: the mapping (if any) holds its own reference; closing the
        // descriptor is always safe here.
        unsafe { libc::close(fd) };
        let ptr = ptr?;

        // ftruncate zero-fills, so the segment starts out as all-invalid
        // slot words and empty maps without an explicit memset.
        Ok(Self {
            ptr,
            size,
            name: name.to_string(),
        })
    }

    /// Open an existing shared memory segment, sizing the mapping from the
    /// segment itself.
    pub fn open(name: &str) -> Result<Self> {
        Self::validate_name(name)?;

        let c_name = CString::new(name)
            .map_err(|_| ComError::BindingFailure(format!("invalid segment name: {name}")))?;

        // SAFETY: c_name is a valid CString; O_RDWR opens an existing
        // segment for read/write, mode is ignored without O_CREAT.
        let fd = unsafe { libc::shm_open(c_name.as_ptr(), libc::O_RDWR, 0) };
        if fd < 0 {
            return Err(ComError::ErroneousFileHandle(io::Error::last_os_error()));
        }

        // SAFETY: fd is valid; the zeroed stat buffer is written by fstat.
        let size = unsafe {
            let mut stat: libc::stat = std::mem::zeroed();
            if libc::fstat(fd, &mut stat) < 0 {
                let err = io::Error::last_os_error();
                libc::close(fd);
                return Err(ComError::ErroneousFileHandle(err));
            }
            stat.st_size as usize
        };

        let ptr = Self::map(fd, size);
        // SAFETY: see create(); the mapping keeps its own reference.
        unsafe { libc::close(fd) };
        let ptr = ptr?;

        Ok(Self {
            ptr,
            size,
            name: name.to_string(),
        })
    }

    fn map(fd: libc::c_int, size: usize) -> Result<*mut u8> {
        // SAFETY:
        // - null address lets the kernel choose the mapping location
        // - PROT_READ|PROT_WRITE with MAP_SHARED is the cross-process mode
        // - fd is a valid descriptor owned by the caller
        // - MAP_FAILED is checked below
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(ComError::ErroneousFileHandle(io::Error::last_os_error()));
        }
        Ok(ptr.cast::<u8>())
    }

    /// Validate a segment name against POSIX rules
    fn validate_name(name: &str) -> Result<()> {
        if !name.starts_with('/') || (name.len() > 1 && name[1..].contains('/')) || name.len() > 255
        {
            return Err(ComError::BindingFailure(format!(
                "invalid segment name: {name}"
            )));
        }
        Ok(())
    }

    /// Unlink (delete) a segment by name. Not-found is treated as success
    /// so cleanup stays idempotent.
    pub fn unlink(name: &str) -> Result<()> {
        let c_name = CString::new(name)
            .map_err(|_| ComError::BindingFailure(format!("invalid segment name: {name}")))?;

        // SAFETY: c_name is a valid CString; shm_unlink only touches the
        // filesystem namespace.
        let ret = unsafe { libc::shm_unlink(c_name.as_ptr()) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::NotFound {
                return Err(ComError::ErroneousFileHandle(err));
            }
        }
        Ok(())
    }

    /// Check whether a segment with the given name exists
    #[must_use]
    pub fn exists(name: &str) -> bool {
        let Ok(c_name) = CString::new(name) else {
            return false;
        };
        // SAFETY: c_name is a valid CString; O_RDONLY probes existence only.
        let fd = unsafe { libc::shm_open(c_name.as_ptr(), libc::O_RDONLY, 0) };
        if fd >= 0 {
            // SAFETY: fd is valid and not used afterwards.
            unsafe { libc::close(fd) };
            true
        } else {
            false
        }
    }

    /// Raw pointer to the mapped memory
    #[inline]
    #[must_use]
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr
    }

    /// Size of the mapping
    #[inline]
    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Segment name
    #[inline]
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for ShmSegment {
    fn drop(&mut self) {
        // SAFETY: ptr/size come from the successful mmap in create()/open()
        // and Drop runs at most once.
        unsafe {
            libc::munmap(self.ptr.cast::<libc::c_void>(), self.size);
        }
        // Unlinking is the creator's decision, not ours.
    }
}
