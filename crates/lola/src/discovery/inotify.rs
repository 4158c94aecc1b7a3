// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Thin inotify wrapper used by the flag-file watcher.
//!
//! The watcher's worker task blocks in [`Inotify::read`], its only sleep
//! point. Cancellation works by closing the handle from the stop path:
//! the next read attempt observes the closed handle and returns an error,
//! which the worker interprets as "stop requested".

use std::ffi::CString;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::sync::atomic::{AtomicI32, Ordering};

/// Descriptor of one registered watch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WatchDescriptor(pub(crate) i32);

/// One decoded inotify event
#[derive(Debug, Clone)]
pub struct InotifyEvent {
    /// Watch the event was reported on
    pub wd: WatchDescriptor,
    /// Raw event mask
    pub mask: u32,
    /// Name of the affected directory entry (empty for queue overflow)
    pub name: String,
}

impl InotifyEvent {
    /// A directory entry was created under the watched directory
    #[must_use]
    pub fn is_create(&self) -> bool {
        self.mask & libc::IN_CREATE != 0
    }

    /// A directory entry was deleted under the watched directory
    #[must_use]
    pub fn is_delete(&self) -> bool {
        self.mask & libc::IN_DELETE != 0
    }

    /// The kernel dropped events; the view of the filesystem is stale
    #[must_use]
    pub fn is_queue_overflow(&self) -> bool {
        self.mask & libc::IN_Q_OVERFLOW != 0
    }

    /// The watch itself went away (explicit removal or deleted directory)
    #[must_use]
    pub fn is_ignored(&self) -> bool {
        self.mask & libc::IN_IGNORED != 0
    }
}

#[repr(C)]
struct RawEventHeader {
    wd: i32,
    mask: u32,
    cookie: u32,
    len: u32,
}

/// Blocking inotify handle shared between the worker and the stop path
pub struct Inotify {
    fd: AtomicI32,
}

impl Inotify {
    /// Create a new inotify instance
    pub fn new() -> io::Result<Self> {
        // SAFETY: plain syscall, the result is checked below.
        let fd = unsafe { libc::inotify_init1(libc::IN_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self {
            fd: AtomicI32::new(fd),
        })
    }

    /// Watch a directory for entry creation and deletion
    pub fn add_watch(&self, path: &Path) -> io::Result<WatchDescriptor> {
        let fd = self.fd.load(Ordering::Acquire);
        if fd < 0 {
            return Err(io::Error::from_raw_os_error(libc::EBADF));
        }
        let c_path = CString::new(path.as_os_str().as_bytes())
            .map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;
        // SAFETY: fd checked above, c_path is a valid CString.
        let wd = unsafe {
            libc::inotify_add_watch(fd, c_path.as_ptr(), libc::IN_CREATE | libc::IN_DELETE)
        };
        if wd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(WatchDescriptor(wd))
    }

    /// Stop watching
    pub fn remove_watch(&self, wd: WatchDescriptor) -> io::Result<()> {
        let fd = self.fd.load(Ordering::Acquire);
        if fd < 0 {
            return Err(io::Error::from_raw_os_error(libc::EBADF));
        }
        // SAFETY: fd checked above; a stale wd only yields EINVAL.
        let ret = unsafe { libc::inotify_rm_watch(fd, wd.0) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Block until at least one event batch arrives.
    ///
    /// Returns an error once [`Inotify::close`] has been called; signal
    /// interruptions are retried internally.
    pub fn read(&self) -> io::Result<Vec<InotifyEvent>> {
        loop {
            let fd = self.fd.load(Ordering::Acquire);
            if fd < 0 {
                return Err(io::Error::from_raw_os_error(libc::EBADF));
            }

            // Bounded poll instead of a bare read so a concurrent close is
            // observed on the next iteration.
            let mut pollfd = libc::pollfd {
                fd,
                events: libc::POLLIN,
                revents: 0,
            };
            // SAFETY: pollfd is a valid, initialised struct on our stack.
            let ready = unsafe { libc::poll(&mut pollfd, 1, 100) };
            if ready < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err);
            }
            if ready == 0 {
                continue;
            }

            let mut buffer = [0u8; 4096];
            // SAFETY: buffer is valid for its full length; fd re-checked at
            // loop entry.
            let length = unsafe { libc::read(fd, buffer.as_mut_ptr().cast(), buffer.len()) };
            if length < 0 {
                let err = io::Error::last_os_error();
                match err.kind() {
                    io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock => continue,
                    _ => return Err(err),
                }
            }
            return Ok(Self::parse(&buffer[..length as usize]));
        }
    }

    fn parse(mut data: &[u8]) -> Vec<InotifyEvent> {
        const HEADER: usize = std::mem::size_of::<RawEventHeader>();
        let mut events = Vec::new();
        while data.len() >= HEADER {
            // SAFETY: at least HEADER bytes remain; read_unaligned copes
            // with the kernel's packed record stream.
            let header = unsafe { data.as_ptr().cast::<RawEventHeader>().read_unaligned() };
            let name_len = header.len as usize;
            if data.len() < HEADER + name_len {
                log::warn!("[SD] truncated inotify record dropped");
                break;
            }
            let name_bytes = &data[HEADER..HEADER + name_len];
            let name = String::from_utf8_lossy(name_bytes)
                .trim_end_matches('\0')
                .to_string();
            events.push(InotifyEvent {
                wd: WatchDescriptor(header.wd),
                mask: header.mask,
                name,
            });
            data = &data[HEADER + name_len..];
        }
        events
    }

    /// Close the handle, waking the blocked worker with an error
    pub fn close(&self) {
        let fd = self.fd.swap(-1, Ordering::AcqRel);
        if fd >= 0 {
            // SAFETY: fd was valid and is closed exactly once (the swap
            // makes later calls see -1).
            unsafe { libc::close(fd) };
        }
    }
}

impl Drop for Inotify {
    fn drop(&mut self) {
        self.close();
    }
}
