// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Flag files: the advertise side of service discovery.
//!
//! An offer is advertised by an empty regular file
//! `<pid>_<asil-b|asil-qm>_<disambiguator>` under
//! `<discovery-root>/<service-id>/<instance-id>/`. Watchers only care
//! about existence and name; the content stays empty. Directories are
//! world-writable by design: identity is enforced by the flock and
//! file-name conventions, not by directory permissions.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{ComError, Result};
use crate::shm::path::{flag_file_name, search_path_for};
use crate::types::EnrichedInstanceIdentifier;

/// Monotonically increasing value making one offer unique
pub type Disambiguator = u64;

const DIR_CREATE_RETRIES: usize = 3;
const DIR_CREATE_BACKOFF: Duration = Duration::from_millis(10);

/// One advertised offer; unlinks its file on drop.
///
/// Moving the value transfers ownership of the file.
pub struct FlagFile {
    path: PathBuf,
}

impl FlagFile {
    /// Advertise an offer: clear conflicting flag files of the same
    /// quality, create the directory chain and the new flag file.
    pub fn make(
        root: &Path,
        id: &EnrichedInstanceIdentifier,
        disambiguator: Disambiguator,
        pid: i32,
    ) -> Result<Self> {
        assert!(
            id.instance_id.is_some(),
            "flag files require a concrete instance id"
        );

        remove_matching_flag_files(root, id)?;

        let directory = create_search_path(root, id)?;
        let path = directory.join(flag_file_name(pid, id.quality, disambiguator));

        fs::write(&path, b"").map_err(|e| {
            log::error!("[SD] failed to create flag file {}: {e}", path.display());
            ComError::BindingFailure(format!("could not create flag file: {e}"))
        })?;
        fs::set_permissions(&path, fs::Permissions::from_mode(0o644)).map_err(|e| {
            log::error!("[SD] failed to set permissions on {}: {e}", path.display());
            ComError::BindingFailure(format!("could not set flag file permissions: {e}"))
        })?;

        Ok(Self { path })
    }

    /// True when at least one flag file matches `(service, instance,
    /// quality)`
    #[must_use]
    pub fn exists(root: &Path, id: &EnrichedInstanceIdentifier) -> bool {
        !matching_flag_files(root, id).is_empty()
    }

    /// Path of the advertised file
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for FlagFile {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            // The file vanished under us: somebody tampered with the
            // discovery tree and every watcher may now be inconsistent.
            log::error!(
                "[SD] outside tampering: failed to remove flag file {}: {e}; bailing",
                self.path.display()
            );
            std::process::abort();
        }
    }
}

/// Create `<root>/<service-id>[/<instance-id>]` with full permissions.
///
/// Retries with a short backoff: another process may be creating the same
/// chain concurrently, and a directory that exists with the right mode
/// counts as success.
pub fn create_search_path(root: &Path, id: &EnrichedInstanceIdentifier) -> Result<PathBuf> {
    let path = search_path_for(root, id);
    let mut last_error: Option<std::io::Error> = None;

    for attempt in 0..DIR_CREATE_RETRIES {
        match fs::create_dir_all(&path) {
            Ok(()) => {
                // create_dir_all honours the umask; force the open mode on
                // the chain below the root so any uid can advertise.
                let mut current = path.clone();
                loop {
                    let _ = fs::set_permissions(&current, fs::Permissions::from_mode(0o777));
                    if !current.pop() || !current.starts_with(root) || current == *root {
                        break;
                    }
                }
                let _ = fs::set_permissions(root, fs::Permissions::from_mode(0o777));
                return Ok(path);
            }
            Err(e) => {
                if path.is_dir() {
                    return Ok(path);
                }
                log::info!(
                    "[SD] failed to create offer path {} (try {attempt} of {DIR_CREATE_RETRIES}); \
                     path may be in concurrent creation",
                    path.display()
                );
                last_error = Some(e);
                std::thread::sleep(DIR_CREATE_BACKOFF);
            }
        }
    }

    log::error!("[SD] failed to create offer path {}", path.display());
    Err(ComError::BindingFailure(format!(
        "could not create search path {}: {}",
        path.display(),
        last_error.map_or_else(|| "unknown error".into(), |e| e.to_string())
    )))
}

fn matching_flag_files(root: &Path, id: &EnrichedInstanceIdentifier) -> Vec<PathBuf> {
    let token = id.quality.as_file_token();
    let Ok(entries) = fs::read_dir(search_path_for(root, id)) else {
        return Vec::new();
    };
    entries
        .flatten()
        .filter(|entry| entry.file_type().map(|t| t.is_file()).unwrap_or(false))
        .filter(|entry| entry.file_name().to_string_lossy().contains(token))
        .map(|entry| entry.path())
        .collect()
}

fn remove_matching_flag_files(root: &Path, id: &EnrichedInstanceIdentifier) -> Result<()> {
    let conflicting = matching_flag_files(root, id);
    if conflicting.is_empty() {
        return Ok(());
    }
    log::info!(
        "[SD] found {} conflicting flag file(s) while advertising {:?} of service {} instance {:?}",
        conflicting.len(),
        id.quality,
        id.service_id,
        id.instance_id
    );
    let mut result = Ok(());
    for path in conflicting {
        if let Err(e) = fs::remove_file(&path) {
            log::error!(
                "[SD] outside tampering: failed to clear flag file {}: {e}",
                path.display()
            );
            result = Err(ComError::BindingFailure(
                "could not clear directory for flag file".into(),
            ));
        }
    }
    result
}
