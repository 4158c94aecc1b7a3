// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Flag-file crawler: snapshot enumeration and watch registration.
//!
//! `crawl` answers "which instances are offered right now";
//! `crawl_and_watch` additionally registers inotify watches at the
//! service-level directory and every instance-level directory so later
//! creations and deletions are observed by the watcher worker.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use crate::discovery::flag_file::{create_search_path, FlagFile};
use crate::discovery::inotify::{Inotify, WatchDescriptor};
use crate::error::{ComError, Result};
use crate::shm::path::search_path_for;
use crate::types::{EnrichedInstanceIdentifier, QualityAware, QualityType, ServiceHandle};

/// Set of currently offered `(service, instance)` pairs for one quality
#[derive(Debug, Default, Clone)]
pub struct KnownInstancesContainer {
    instances: HashSet<(u16, u16)>,
}

impl KnownInstancesContainer {
    /// Record an offered instance
    pub fn insert(&mut self, service_id: u16, instance_id: u16) {
        self.instances.insert((service_id, instance_id));
    }

    /// Forget an instance (offer withdrawn)
    pub fn remove(&mut self, service_id: u16, instance_id: u16) {
        self.instances.remove(&(service_id, instance_id));
    }

    /// Merge another snapshot into this one
    pub fn merge(&mut self, other: KnownInstancesContainer) {
        self.instances.extend(other.instances);
    }

    /// Forget every instance matching the identifier (all instances of the
    /// service when no instance id is given)
    pub fn remove_matching(&mut self, id: &EnrichedInstanceIdentifier) {
        self.instances.retain(|(service, instance)| {
            *service != id.service_id || id.instance_id.is_some_and(|wanted| *instance != wanted)
        });
    }

    /// Handles matching a search identifier, carrying its quality
    #[must_use]
    pub fn known_handles(&self, id: &EnrichedInstanceIdentifier) -> Vec<ServiceHandle> {
        self.instances
            .iter()
            .filter(|(service, instance)| {
                *service == id.service_id
                    && id.instance_id.map_or(true, |wanted| *instance == wanted)
            })
            .map(|(service, instance)| ServiceHandle {
                service_id: *service,
                instance_id: *instance,
                quality: id.quality,
            })
            .collect()
    }
}

/// Watches registered by one crawl, keyed by descriptor
pub type CrawledWatches = Vec<(WatchDescriptor, EnrichedInstanceIdentifier)>;

/// Crawler over the discovery root
pub struct FlagFileCrawler<'a> {
    inotify: &'a Inotify,
    root: &'a Path,
}

impl<'a> FlagFileCrawler<'a> {
    /// Crawler bound to an inotify instance and a discovery root
    #[must_use]
    pub fn new(inotify: &'a Inotify, root: &'a Path) -> Self {
        Self { inotify, root }
    }

    /// Snapshot-only enumeration of matching offered instances
    pub fn crawl(
        &self,
        id: &EnrichedInstanceIdentifier,
    ) -> Result<QualityAware<KnownInstancesContainer>> {
        let (_, known) = self.crawl_impl(id, false)?;
        Ok(known)
    }

    /// Enumeration plus watch registration at the service directory and
    /// every instance directory
    pub fn crawl_and_watch(
        &self,
        id: &EnrichedInstanceIdentifier,
    ) -> Result<(CrawledWatches, QualityAware<KnownInstancesContainer>)> {
        self.crawl_impl(id, true)
    }

    fn crawl_impl(
        &self,
        id: &EnrichedInstanceIdentifier,
        add_watch: bool,
    ) -> Result<(CrawledWatches, QualityAware<KnownInstancesContainer>)> {
        let mut watches: CrawledWatches = Vec::new();

        if add_watch {
            let wd = self.add_watch_for(id)?;
            watches.push((wd, *id));
        }

        let mut to_check: Vec<EnrichedInstanceIdentifier> = Vec::new();
        if id.instance_id.is_some() {
            to_check.push(*id);
        } else {
            for found in self.gather_existing_instance_directories(id)? {
                if add_watch {
                    let wd = self.add_watch_for(&found)?;
                    watches.push((wd, found));
                }
                to_check.push(found);
            }
        }

        let mut known = QualityAware::<KnownInstancesContainer>::default();
        for candidate in &to_check {
            let instance_id = candidate
                .instance_id
                .expect("instance-level identifiers carry an instance id");
            for quality in [QualityType::AsilB, QualityType::AsilQm] {
                let quality_aware = candidate.with_quality(quality);
                if FlagFile::exists(self.root, &quality_aware) {
                    log::debug!(
                        "[SD] added {} ({quality:?})",
                        search_path_for(self.root, &quality_aware).display()
                    );
                    known.get_mut(quality).insert(candidate.service_id, instance_id);
                }
            }
        }

        Ok((watches, known))
    }

    /// Parse an instance directory name into an instance id
    pub fn parse_instance_id(name: &str) -> Result<u16> {
        name.parse::<u16>().map_err(|_| {
            ComError::BindingFailure(format!("could not parse instance id from {name:?}"))
        })
    }

    /// Parse the quality token out of a flag file name
    #[must_use]
    pub fn parse_quality(name: &str) -> Option<QualityType> {
        if name.contains(QualityType::AsilB.as_file_token()) {
            Some(QualityType::AsilB)
        } else if name.contains(QualityType::AsilQm.as_file_token()) {
            Some(QualityType::AsilQm)
        } else {
            None
        }
    }

    fn gather_existing_instance_directories(
        &self,
        id: &EnrichedInstanceIdentifier,
    ) -> Result<Vec<EnrichedInstanceIdentifier>> {
        debug_assert!(id.instance_id.is_none(), "identifier must not have an instance id");
        let service_dir = search_path_for(self.root, id);
        let mut found = Vec::new();
        for entry in read_dir_or_empty(&service_dir) {
            if !entry.is_dir() {
                log::error!("[SD] found file {} - should be a directory", entry.display());
                continue;
            }
            let name = entry
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            match Self::parse_instance_id(&name) {
                Ok(instance_id) => {
                    found.push(EnrichedInstanceIdentifier::new(
                        id.service_id,
                        instance_id,
                        id.quality,
                    ));
                }
                Err(_) => {
                    log::error!("[SD] could not parse {} to an instance id", entry.display());
                }
            }
        }
        Ok(found)
    }

    fn add_watch_for(&self, id: &EnrichedInstanceIdentifier) -> Result<WatchDescriptor> {
        // The directory must exist before it can be watched; creating it is
        // idempotent and tolerates concurrent creation.
        let path = create_search_path(self.root, id)?;
        self.inotify.add_watch(&path).map_err(|e| {
            log::error!("[SD] could not add watch for {}: {e}", path.display());
            ComError::BindingFailure(format!("could not add watch for {}", path.display()))
        })
    }
}

fn read_dir_or_empty(path: &Path) -> Vec<PathBuf> {
    fs::read_dir(path)
        .map(|entries| entries.flatten().map(|e| e.path()).collect())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::flag_file::FlagFile;

    fn any(service: u16) -> EnrichedInstanceIdentifier {
        EnrichedInstanceIdentifier::any_instance(service, QualityType::AsilQm)
    }

    #[test]
    fn test_parse_instance_id() {
        assert_eq!(FlagFileCrawler::parse_instance_id("7").unwrap(), 7);
        assert_eq!(FlagFileCrawler::parse_instance_id("65535").unwrap(), 65535);
        assert!(FlagFileCrawler::parse_instance_id("seven").is_err());
        assert!(FlagFileCrawler::parse_instance_id("").is_err());
    }

    #[test]
    fn test_parse_quality() {
        assert_eq!(
            FlagFileCrawler::parse_quality("1234_asil-b_987"),
            Some(QualityType::AsilB)
        );
        assert_eq!(
            FlagFileCrawler::parse_quality("1234_asil-qm_987"),
            Some(QualityType::AsilQm)
        );
        assert_eq!(FlagFileCrawler::parse_quality("1234_unrelated_987"), None);
    }

    #[test]
    fn test_crawl_finds_existing_offers_across_qualities() {
        let dir = tempfile::tempdir().unwrap();
        let inotify = Inotify::new().unwrap();
        let crawler = FlagFileCrawler::new(&inotify, dir.path());

        let qm = EnrichedInstanceIdentifier::new(5, 1, QualityType::AsilQm);
        let b = EnrichedInstanceIdentifier::new(5, 2, QualityType::AsilB);
        let _flag_qm = FlagFile::make(dir.path(), &qm, 1, 10).unwrap();
        let _flag_b = FlagFile::make(dir.path(), &b, 2, 10).unwrap();

        let known = crawler.crawl(&any(5)).expect("crawl");
        assert_eq!(known.asil_qm.known_handles(&any(5)).len(), 1);
        assert_eq!(
            known
                .asil_b
                .known_handles(&any(5).with_quality(QualityType::AsilB))
                .len(),
            1
        );
    }

    #[test]
    fn test_crawl_with_instance_id_checks_only_that_instance() {
        let dir = tempfile::tempdir().unwrap();
        let inotify = Inotify::new().unwrap();
        let crawler = FlagFileCrawler::new(&inotify, dir.path());

        let target = EnrichedInstanceIdentifier::new(5, 1, QualityType::AsilQm);
        let other = EnrichedInstanceIdentifier::new(5, 2, QualityType::AsilQm);
        let _a = FlagFile::make(dir.path(), &target, 1, 10).unwrap();
        let _b = FlagFile::make(dir.path(), &other, 2, 10).unwrap();

        let known = crawler.crawl(&target).expect("crawl");
        let handles = known.asil_qm.known_handles(&target);
        assert_eq!(handles.len(), 1);
        assert_eq!(handles[0].instance_id, 1);
    }

    #[test]
    fn test_crawl_and_watch_registers_service_and_instance_watches() {
        let dir = tempfile::tempdir().unwrap();
        let inotify = Inotify::new().unwrap();
        let crawler = FlagFileCrawler::new(&inotify, dir.path());

        let first = EnrichedInstanceIdentifier::new(5, 1, QualityType::AsilQm);
        let second = EnrichedInstanceIdentifier::new(5, 2, QualityType::AsilQm);
        let _a = FlagFile::make(dir.path(), &first, 1, 10).unwrap();
        let _b = FlagFile::make(dir.path(), &second, 2, 10).unwrap();

        let (watches, known) = crawler.crawl_and_watch(&any(5)).expect("crawl");
        // Service-level watch plus one per instance directory.
        assert_eq!(watches.len(), 3);
        assert_eq!(known.asil_qm.known_handles(&any(5)).len(), 2);

        let service_level = watches
            .iter()
            .filter(|(_, id)| id.instance_id.is_none())
            .count();
        assert_eq!(service_level, 1);
    }

    #[test]
    fn test_crawl_and_watch_creates_missing_directories() {
        let dir = tempfile::tempdir().unwrap();
        let inotify = Inotify::new().unwrap();
        let crawler = FlagFileCrawler::new(&inotify, dir.path());

        // Nothing offered yet: the service directory is created so the
        // watch can observe future offers.
        let (watches, known) = crawler.crawl_and_watch(&any(9)).expect("crawl");
        assert_eq!(watches.len(), 1);
        assert!(known.asil_qm.known_handles(&any(9)).is_empty());
        assert!(dir.path().join("9").is_dir());
    }

    #[test]
    fn test_garbage_in_service_directory_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let inotify = Inotify::new().unwrap();
        let crawler = FlagFileCrawler::new(&inotify, dir.path());

        let target = EnrichedInstanceIdentifier::new(5, 1, QualityType::AsilQm);
        let _a = FlagFile::make(dir.path(), &target, 1, 10).unwrap();
        std::fs::create_dir_all(dir.path().join("5").join("not-a-number")).unwrap();
        std::fs::write(dir.path().join("5").join("stray-file"), b"").unwrap();

        let known = crawler.crawl(&any(5)).expect("crawl");
        assert_eq!(known.asil_qm.known_handles(&any(5)).len(), 1);
    }
}
