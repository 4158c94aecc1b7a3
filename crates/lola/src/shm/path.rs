// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Deterministic path construction for segments, marker files and the
//! discovery tree.
//!
//! Proxies never exchange paths with the skeleton; both sides derive the
//! identical names from `(service id, instance id, quality)` alone:
//!
//! ```text
//! /dev/shm/lola-data-0000000000004660-00007      data segment
//! /dev/shm/lola-ctl-0000000000004660-00007       control segment (QM)
//! /dev/shm/lola-ctl-0000000000004660-00007-b     control segment (ASIL-B)
//! <restart-root>/service_4660_7_existence        existence marker
//! <restart-root>/service_4660_7_usage            usage marker
//! <discovery-root>/4660/7/<pid>_asil-qm_<n>      flag file
//! ```

use std::path::{Path, PathBuf};

use crate::types::{EnrichedInstanceIdentifier, QualityType};

const DATA_CHANNEL_PREFIX: &str = "lola-data-";
const CONTROL_CHANNEL_PREFIX: &str = "lola-ctl-";
const ASIL_B_CONTROL_SUFFIX: &str = "-b";

#[cfg(target_os = "nto")]
const SHARED_MEMORY_PATH_PREFIX: &str = "/dev/shmem/";
#[cfg(not(target_os = "nto"))]
const SHARED_MEMORY_PATH_PREFIX: &str = "/dev/shm/";

fn service_and_instance(service_id: u16, instance_id: u16) -> String {
    format!("{service_id:016}-{instance_id:05}")
}

/// Builds segment names and paths for one service
#[derive(Debug, Clone, Copy)]
pub struct ShmPathBuilder {
    service_id: u16,
}

impl ShmPathBuilder {
    /// Builder for the given service id
    #[must_use]
    pub fn new(service_id: u16) -> Self {
        Self { service_id }
    }

    /// File name of a control segment
    #[must_use]
    pub fn control_channel_file_name(&self, instance_id: u16, quality: QualityType) -> String {
        let base = format!(
            "{CONTROL_CHANNEL_PREFIX}{}",
            service_and_instance(self.service_id, instance_id)
        );
        match quality {
            QualityType::AsilQm => base,
            QualityType::AsilB => format!("{base}{ASIL_B_CONTROL_SUFFIX}"),
        }
    }

    /// File name of the data segment
    #[must_use]
    pub fn data_channel_file_name(&self, instance_id: u16) -> String {
        format!(
            "{DATA_CHANNEL_PREFIX}{}",
            service_and_instance(self.service_id, instance_id)
        )
    }

    /// Full filesystem path of a control segment
    #[must_use]
    pub fn control_channel_path(&self, instance_id: u16, quality: QualityType) -> String {
        format!(
            "{SHARED_MEMORY_PATH_PREFIX}{}",
            self.control_channel_file_name(instance_id, quality)
        )
    }

    /// Full filesystem path of the data segment
    #[must_use]
    pub fn data_channel_path(&self, instance_id: u16) -> String {
        format!(
            "{SHARED_MEMORY_PATH_PREFIX}{}",
            self.data_channel_file_name(instance_id)
        )
    }

    /// `shm_open` name of a control segment
    #[must_use]
    pub fn control_channel_shm_name(&self, instance_id: u16, quality: QualityType) -> String {
        format!("/{}", self.control_channel_file_name(instance_id, quality))
    }

    /// `shm_open` name of the data segment
    #[must_use]
    pub fn data_channel_shm_name(&self, instance_id: u16) -> String {
        format!("/{}", self.data_channel_file_name(instance_id))
    }
}

/// Builds the marker-file paths under the partial-restart directory
#[derive(Debug, Clone)]
pub struct PartialRestartPathBuilder {
    service_id: u16,
    root: PathBuf,
}

impl PartialRestartPathBuilder {
    /// Builder over the configured partial-restart root
    #[must_use]
    pub fn new(service_id: u16, root: &Path) -> Self {
        Self {
            service_id,
            root: root.to_path_buf(),
        }
    }

    /// The partial-restart directory itself
    #[must_use]
    pub fn directory(&self) -> &Path {
        &self.root
    }

    /// Marker file owned (flocked exclusively) by the live skeleton
    #[must_use]
    pub fn existence_marker_file_path(&self, instance_id: u16) -> PathBuf {
        self.root
            .join(format!("service_{}_{instance_id}_existence", self.service_id))
    }

    /// Marker file shared-flocked by every proxy using the instance
    #[must_use]
    pub fn usage_marker_file_path(&self, instance_id: u16) -> PathBuf {
        self.root
            .join(format!("service_{}_{instance_id}_usage", self.service_id))
    }
}

/// Directory crawled and watched for one identifier: the service directory
/// when no instance id is given, the instance directory otherwise.
#[must_use]
pub fn search_path_for(discovery_root: &Path, id: &EnrichedInstanceIdentifier) -> PathBuf {
    let mut path = discovery_root.join(id.service_id.to_string());
    if let Some(instance_id) = id.instance_id {
        path.push(instance_id.to_string());
    }
    path
}

/// Name of a flag file advertising one offer
#[must_use]
pub fn flag_file_name(pid: i32, quality: QualityType, disambiguator: u64) -> String {
    format!("{pid}_{}_{disambiguator}", quality.as_file_token())
}
