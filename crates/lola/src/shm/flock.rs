// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Marker files and non-blocking `flock` guards.
//!
//! The partial-restart protocol rests on two marker files per instance:
//!
//! - *existence marker*: exclusively flocked by the live skeleton for its
//!   whole lifetime. A second skeleton failing this flock knows the
//!   instance is already provided; a successful flock on a pre-existing
//!   file means the previous skeleton crashed.
//! - *usage marker*: shared-flocked by every proxy for its whole lifetime.
//!   The skeleton probes it with a transient exclusive flock; success
//!   means no proxy uses the previous arena and it can be recreated.
//!
//! All flocks are taken with `LOCK_NB` so contention is reported, never
//! waited out.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use crate::error::{ComError, Result};

/// A marker file that may be unlinked when its owner drops it.
///
/// Ownership is taken explicitly: a skeleton only owns the existence
/// marker after winning the exclusive flock, and the usage marker is never
/// owned (it must outlive skeleton restarts while proxies hold shared
/// locks on it).
pub struct LockFile {
    file: File,
    path: PathBuf,
    owned: bool,
}

impl LockFile {
    /// Create the file if needed, or open the one left behind by a
    /// previous incarnation.
    pub fn create_or_open(path: PathBuf, take_ownership: bool) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .mode(0o666)
            .open(&path)
            .map_err(|e| {
                ComError::BindingFailure(format!("cannot create marker file {}: {e}", path.display()))
            })?;
        // Marker files must be lockable by every participant regardless of
        // the creator's umask.
        let _ = file.set_permissions(std::fs::Permissions::from_mode(0o666));
        Ok(Self {
            file,
            path,
            owned: take_ownership,
        })
    }

    /// Open an existing marker file; fails when it does not exist
    pub fn open(path: PathBuf) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| {
                ComError::BindingFailure(format!("cannot open marker file {}: {e}", path.display()))
            })?;
        Ok(Self {
            file,
            path,
            owned: false,
        })
    }

    /// Unlink the file when this value drops
    pub fn take_ownership(&mut self) {
        self.owned = true;
    }

    /// Path of the marker file
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Try to take a non-blocking flock bound to this file's descriptor.
    ///
    /// Returns `Ok(false)` when another process holds a conflicting lock.
    /// The lock is released by [`LockFile::unlock`] or implicitly when the
    /// file (descriptor) is dropped, which is how lifetime-long locks are
    /// held without a guard object.
    pub fn try_lock(&self, kind: FlockKind) -> Result<bool> {
        let operation = match kind {
            FlockKind::Exclusive => libc::LOCK_EX,
            FlockKind::Shared => libc::LOCK_SH,
        } | libc::LOCK_NB;

        // SAFETY: the fd is valid for the lifetime of self.
        let ret = unsafe { libc::flock(self.raw_fd(), operation) };
        if ret == 0 {
            return Ok(true);
        }
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::WouldBlock {
            return Ok(false);
        }
        Err(ComError::BindingFailure(format!(
            "flock on {} failed: {err}",
            self.path.display()
        )))
    }

    /// Release a lock taken with [`LockFile::try_lock`]
    pub fn unlock(&self) {
        // SAFETY: the fd is valid for the lifetime of self.
        unsafe { libc::flock(self.raw_fd(), libc::LOCK_UN) };
    }

    fn raw_fd(&self) -> libc::c_int {
        self.file.as_raw_fd()
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        if self.owned {
            if let Err(e) = std::fs::remove_file(&self.path) {
                log::warn!("[SHM] could not remove marker file {}: {e}", self.path.display());
            }
        }
    }
}

/// How a [`FlockGuard`] locks the underlying file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlockKind {
    /// `LOCK_EX`: skeleton-side ownership probes
    Exclusive,
    /// `LOCK_SH`: proxy-side usage signal
    Shared,
}

/// RAII flock held on a [`LockFile`]; unlocks on drop.
///
/// The guard borrows the lock file, so the flock can never outlive the
/// descriptor it is taken on.
pub struct FlockGuard<'a> {
    file: &'a LockFile,
}

impl<'a> FlockGuard<'a> {
    /// Try to take a non-blocking flock of the given kind.
    ///
    /// Returns `Ok(None)` when another process holds a conflicting lock,
    /// and an error for any other failure.
    pub fn try_lock(file: &'a LockFile, kind: FlockKind) -> Result<Option<Self>> {
        if file.try_lock(kind)? {
            Ok(Some(Self { file }))
        } else {
            Ok(None)
        }
    }
}

impl Drop for FlockGuard<'_> {
    fn drop(&mut self) {
        self.file.unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn marker(dir: &tempfile::TempDir, name: &str) -> PathBuf {
        dir.path().join(name)
    }

    #[test]
    fn test_create_or_open_is_reentrant() {
        let dir = tempfile::tempdir().unwrap();
        let path = marker(&dir, "service_1_1_usage");
        let first = LockFile::create_or_open(path.clone(), false).unwrap();
        let second = LockFile::create_or_open(path.clone(), false).unwrap();
        drop(first);
        drop(second);
        // Not owned: the file survives both drops.
        assert!(path.exists());
    }

    #[test]
    fn test_owned_file_is_unlinked_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = marker(&dir, "service_1_1_existence");
        let mut file = LockFile::create_or_open(path.clone(), false).unwrap();
        file.take_ownership();
        drop(file);
        assert!(!path.exists());
    }

    #[test]
    fn test_open_requires_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(LockFile::open(marker(&dir, "missing")).is_err());
    }

    #[test]
    fn test_exclusive_excludes_exclusive() {
        let dir = tempfile::tempdir().unwrap();
        let path = marker(&dir, "m");
        let a = LockFile::create_or_open(path.clone(), false).unwrap();
        let b = LockFile::create_or_open(path, false).unwrap();

        let guard = FlockGuard::try_lock(&a, FlockKind::Exclusive)
            .unwrap()
            .expect("first exclusive lock");
        assert!(FlockGuard::try_lock(&b, FlockKind::Exclusive).unwrap().is_none());
        drop(guard);
        assert!(FlockGuard::try_lock(&b, FlockKind::Exclusive).unwrap().is_some());
    }

    #[test]
    fn test_shared_locks_coexist_and_block_exclusive() {
        let dir = tempfile::tempdir().unwrap();
        let path = marker(&dir, "m");
        let proxy1 = LockFile::create_or_open(path.clone(), false).unwrap();
        let proxy2 = LockFile::create_or_open(path.clone(), false).unwrap();
        let skeleton = LockFile::create_or_open(path, false).unwrap();

        let s1 = FlockGuard::try_lock(&proxy1, FlockKind::Shared)
            .unwrap()
            .expect("shared 1");
        let s2 = FlockGuard::try_lock(&proxy2, FlockKind::Shared)
            .unwrap()
            .expect("shared 2");
        // Proxies in use: the skeleton must not reclaim the arena.
        assert!(FlockGuard::try_lock(&skeleton, FlockKind::Exclusive)
            .unwrap()
            .is_none());

        drop(s1);
        assert!(FlockGuard::try_lock(&skeleton, FlockKind::Exclusive)
            .unwrap()
            .is_none());
        drop(s2);
        assert!(FlockGuard::try_lock(&skeleton, FlockKind::Exclusive)
            .unwrap()
            .is_some());
    }
}
