// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Service discovery client: offers, searches and the watcher worker.
//!
//! One long-lived worker task blocks on inotify reads and owns the event
//! fan-out. All bookkeeping (watches, searches, known instances) lives
//! behind a single mutex taken by the worker and by the start/stop entry
//! points. `stop_find_service` only enqueues a deferred removal that the
//! worker consumes on its next wakeup, so a search can be stopped from
//! within a running callback without re-entering the bookkeeping.
//!
//! Hard stops: an inotify queue overflow or the deletion of a watched
//! instance directory means the discovery view is compromised and no safe
//! recovery exists - the process aborts.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use parking_lot::Mutex;

use crate::discovery::crawler::{FlagFileCrawler, KnownInstancesContainer};
use crate::discovery::flag_file::FlagFile;
use crate::discovery::inotify::{Inotify, InotifyEvent, WatchDescriptor};
use crate::error::{ComError, Result};
use crate::types::{
    EnrichedInstanceIdentifier, QualityAware, QualityType, ServiceHandle, ServiceInstanceKey,
};

/// Identifies one `start_find_service` registration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FindServiceHandle(u64);

/// Callback invoked with the current handle snapshot whenever it changes
pub type FindServiceHandler = Box<dyn Fn(&[ServiceHandle], FindServiceHandle) + Send + Sync>;

/// Which quality channels a stop-offer withdraws
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QualityTypeSelector {
    /// Withdraw the whole offer
    Both,
    /// Withdraw only the QM flag file (disconnecting QM consumers)
    AsilQm,
}

struct SearchEntry {
    identifier: EnrichedInstanceIdentifier,
    watches: HashSet<WatchDescriptor>,
    handler: FindServiceHandler,
    previous_handles: HashSet<ServiceHandle>,
}

struct WatchEntry {
    identifier: EnrichedInstanceIdentifier,
    searches: HashSet<FindServiceHandle>,
}

#[derive(Default)]
struct IdentifierWatches {
    main: Option<WatchDescriptor>,
    children: HashSet<WatchDescriptor>,
}

#[derive(Default)]
struct WatcherState {
    watches: HashMap<WatchDescriptor, WatchEntry>,
    searches: HashMap<FindServiceHandle, SearchEntry>,
    watched_identifiers: HashMap<ServiceInstanceKey, IdentifierWatches>,
    known: QualityAware<KnownInstancesContainer>,
    obsolete: HashSet<FindServiceHandle>,
}

struct ClientInner {
    root: PathBuf,
    inotify: Inotify,
    stop: AtomicBool,
    state: Mutex<WatcherState>,
    offered: DashMap<(u16, u16), QualityAware<Option<FlagFile>>>,
    offer_disambiguator: AtomicU64,
    next_handle: AtomicU64,
}

/// Discovery client with its single watcher worker
pub struct ServiceDiscoveryClient {
    inner: Arc<ClientInner>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl ServiceDiscoveryClient {
    /// Start the client and its worker task over the given discovery root
    pub fn start(root: PathBuf) -> Result<Arc<Self>> {
        let inotify = Inotify::new().map_err(|e| {
            ComError::BindingFailure(format!("could not create inotify instance: {e}"))
        })?;
        let disambiguator_seed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(1);

        let inner = Arc::new(ClientInner {
            root,
            inotify,
            stop: AtomicBool::new(false),
            state: Mutex::new(WatcherState::default()),
            offered: DashMap::new(),
            offer_disambiguator: AtomicU64::new(disambiguator_seed),
            next_handle: AtomicU64::new(1),
        });

        let worker_inner = Arc::clone(&inner);
        let worker = std::thread::Builder::new()
            .name("lola-sd-worker".into())
            .spawn(move || worker_loop(&worker_inner))
            .map_err(|e| ComError::BindingFailure(format!("could not spawn worker: {e}")))?;

        Ok(Arc::new(Self {
            inner,
            worker: Mutex::new(Some(worker)),
        }))
    }

    // ----- advertise side -----

    /// Advertise an instance: one flag file per quality the deployment
    /// carries (an ASIL-B offer also advertises a QM flag file).
    pub fn offer_service(&self, id: EnrichedInstanceIdentifier) -> Result<()> {
        let instance_id = id.instance_id.ok_or_else(|| {
            ComError::BindingFailure("offer requires a concrete instance id".into())
        })?;
        let key = (id.service_id, instance_id);
        if self.inner.offered.contains_key(&key) {
            return Err(ComError::BindingFailure("service is already offered".into()));
        }

        let disambiguator = self.inner.offer_disambiguator.fetch_add(1, Ordering::AcqRel) + 1;
        let pid = std::process::id() as i32;

        let mut flags = QualityAware::<Option<FlagFile>>::default();
        if id.quality == QualityType::AsilB {
            let flag = FlagFile::make(
                &self.inner.root,
                &id.with_quality(QualityType::AsilB),
                disambiguator,
                pid,
            )
            .map_err(|_| {
                ComError::ServiceNotOffered("failed to create flag file for ASIL-B".into())
            })?;
            flags.asil_b = Some(flag);
        }
        let flag = FlagFile::make(
            &self.inner.root,
            &id.with_quality(QualityType::AsilQm),
            disambiguator,
            pid,
        )
        .map_err(|_| ComError::ServiceNotOffered("failed to create flag file for ASIL-QM".into()))?;
        flags.asil_qm = Some(flag);

        self.inner.offered.insert(key, flags);
        Ok(())
    }

    /// Withdraw an offer, either completely or only its QM part
    pub fn stop_offer_service(
        &self,
        id: EnrichedInstanceIdentifier,
        selector: QualityTypeSelector,
    ) -> Result<()> {
        let instance_id = id.instance_id.ok_or_else(|| {
            ComError::BindingFailure("stop-offer requires a concrete instance id".into())
        })?;
        let key = (id.service_id, instance_id);
        match selector {
            QualityTypeSelector::Both => {
                if self.inner.offered.remove(&key).is_none() {
                    return Err(ComError::BindingFailure(
                        "never offered or offer already stopped".into(),
                    ));
                }
            }
            QualityTypeSelector::AsilQm => {
                let mut entry = self.inner.offered.get_mut(&key).ok_or_else(|| {
                    ComError::BindingFailure("never offered or offer already stopped".into())
                })?;
                entry.asil_qm.take();
            }
        }
        Ok(())
    }

    // ----- search side -----

    /// Start watching for offers matching the identifier.
    ///
    /// Reuses existing watches for an already-watched identifier. When
    /// matching offers already exist, the handler is invoked synchronously
    /// before this returns.
    pub fn start_find_service(
        &self,
        handler: FindServiceHandler,
        id: EnrichedInstanceIdentifier,
    ) -> Result<FindServiceHandle> {
        let inner = &self.inner;
        let mut state = inner.state.lock();
        let handle = FindServiceHandle(inner.next_handle.fetch_add(1, Ordering::AcqRel));

        log::debug!(
            "[SD] starting service discovery for service {} instance {:?} with handle {:?}",
            id.service_id,
            id.instance_id,
            handle
        );

        let key = ServiceInstanceKey::from(id);
        let reusable = state
            .watched_identifiers
            .get(&key)
            .and_then(|iw| iw.main.map(|main| (main, iw.children.clone())));

        let watch_descriptors: Vec<WatchDescriptor> = if let Some((main, children)) = reusable {
            // Exact same search already in progress: duplicate the request
            // over the existing watches and cached instances.
            std::iter::once(main).chain(children).collect()
        } else {
            let crawler = FlagFileCrawler::new(&inner.inotify, &inner.root);
            let (watches, found) = crawler.crawl_and_watch(&id)?;
            state.known.asil_b.merge(found.asil_b);
            state.known.asil_qm.merge(found.asil_qm);
            let mut descriptors = Vec::with_capacity(watches.len());
            for (wd, watch_id) in watches {
                inner.store_watch(&mut state, wd, watch_id);
                descriptors.push(wd);
            }
            descriptors
        };

        let mut handles = state.known.get(id.quality).known_handles(&id);
        handles.sort_by_key(|h| (h.service_id, h.instance_id));

        state.searches.insert(
            handle,
            SearchEntry {
                identifier: id,
                watches: watch_descriptors.iter().copied().collect(),
                handler,
                previous_handles: handles.iter().copied().collect(),
            },
        );
        for wd in &watch_descriptors {
            if let Some(watch) = state.watches.get_mut(wd) {
                watch.searches.insert(handle);
            }
        }

        if !handles.is_empty() {
            log::debug!("[SD] synchronously calling handler for {handle:?}");
            let search = state.searches.get(&handle).expect("just inserted");
            (search.handler)(&handles, handle);
        }

        Ok(handle)
    }

    /// Stop a search. The removal is deferred to the worker's next wakeup.
    pub fn stop_find_service(&self, handle: FindServiceHandle) -> Result<()> {
        let mut state = self.inner.state.lock();
        state.obsolete.insert(handle);
        log::debug!("[SD] stopped service discovery for {handle:?}");
        Ok(())
    }

    /// Snapshot-only search without registering a watch
    pub fn find_service(&self, id: EnrichedInstanceIdentifier) -> Result<Vec<ServiceHandle>> {
        let crawler = FlagFileCrawler::new(&self.inner.inotify, &self.inner.root);
        let known = crawler.crawl(&id)?;
        let mut handles = known.get(id.quality).known_handles(&id);
        handles.sort_by_key(|h| (h.service_id, h.instance_id));
        Ok(handles)
    }

    /// Discovery root this client operates on
    #[must_use]
    pub fn root(&self) -> &PathBuf {
        &self.inner.root
    }
}

impl Drop for ServiceDiscoveryClient {
    fn drop(&mut self) {
        self.inner.stop.store(true, Ordering::Release);
        self.inner.inotify.close();
        if let Some(worker) = self.worker.lock().take() {
            let _ = worker.join();
        }
    }
}

fn worker_loop(inner: &Arc<ClientInner>) {
    while !inner.stop.load(Ordering::Acquire) {
        match inner.inotify.read() {
            Ok(events) => inner.handle_events(&events),
            Err(e) => {
                if !inner.stop.load(Ordering::Acquire) {
                    log::error!("[SD] inotify read failed: {e}");
                }
                break;
            }
        }
    }
    log::debug!("[SD] watcher worker stopped");
}

impl ClientInner {
    fn handle_events(&self, events: &[InotifyEvent]) {
        let mut state = self.state.lock();
        self.transfer_obsolete_searches(&mut state);

        let mut deletions: Vec<&InotifyEvent> = Vec::new();
        let mut creations: Vec<&InotifyEvent> = Vec::new();
        for event in events {
            if event.is_queue_overflow() {
                log::error!(
                    "[SD] service discovery lost at least one event and is compromised; bailing out"
                );
                std::process::abort();
            }
            if event.is_ignored() {
                // Echo of a watch removal; the watch map no longer knows it.
                continue;
            }
            if event.is_delete() {
                deletions.push(event);
            } else if event.is_create() {
                creations.push(event);
            } else {
                log::warn!(
                    "[SD] unexpected event mask {:#x} on watch {:?} ({})",
                    event.mask,
                    event.wd,
                    event.name
                );
            }
        }

        let mut impacted = HashSet::new();
        for event in deletions {
            self.handle_deletion(&mut state, event, &mut impacted);
        }
        for event in creations {
            self.handle_creation(&mut state, event, &mut impacted);
        }
        Self::call_handlers(&mut state, &impacted);
    }

    fn handle_deletion(
        &self,
        state: &mut WatcherState,
        event: &InotifyEvent,
        impacted: &mut HashSet<FindServiceHandle>,
    ) {
        let Some(watch) = state.watches.get(&event.wd) else {
            return;
        };
        let identifier = watch.identifier;
        let searches = watch.searches.clone();

        let Some(instance_id) = identifier.instance_id else {
            // A whole instance directory disappeared under the service
            // directory: nobody legitimate removes those while watched.
            log::error!(
                "[SD] directory {}/{} was deleted; outside tampering with service discovery, aborting",
                identifier.service_id,
                event.name
            );
            std::process::abort();
        };

        match FlagFileCrawler::parse_quality(&event.name) {
            Some(quality) => {
                state
                    .known
                    .get_mut(quality)
                    .remove(identifier.service_id, instance_id);
                log::debug!(
                    "[SD] removed {}/{instance_id} ({quality:?})",
                    identifier.service_id
                );
                impacted.extend(searches);
            }
            None => {
                log::error!(
                    "[SD] deletion of {} does not follow the flag-file convention; ignoring",
                    event.name
                );
            }
        }
    }

    fn handle_creation(
        &self,
        state: &mut WatcherState,
        event: &InotifyEvent,
        impacted: &mut HashSet<FindServiceHandle>,
    ) {
        let Some(watch) = state.watches.get(&event.wd) else {
            return;
        };
        let identifier = watch.identifier;
        let searches = watch.searches.clone();

        if let Some(instance_id) = identifier.instance_id {
            // Flag file created inside a watched instance directory.
            match FlagFileCrawler::parse_quality(&event.name) {
                Some(quality) => {
                    state
                        .known
                        .get_mut(quality)
                        .insert(identifier.service_id, instance_id);
                    log::debug!(
                        "[SD] added {}/{instance_id} ({quality:?})",
                        identifier.service_id
                    );
                }
                None => {
                    log::error!(
                        "[SD] creation of {} does not follow the flag-file convention; ignoring",
                        event.name
                    );
                    return;
                }
            }
        } else {
            // New instance directory under a watched service directory.
            let Ok(instance_id) = FlagFileCrawler::parse_instance_id(&event.name) else {
                log::error!(
                    "[SD] outside tampering: could not determine instance id from {}; skipping",
                    event.name
                );
                return;
            };
            let new_id = EnrichedInstanceIdentifier::new(
                identifier.service_id,
                instance_id,
                identifier.quality,
            );

            let crawler = FlagFileCrawler::new(&self.inotify, &self.root);
            let Ok((watches, found)) = crawler.crawl_and_watch(&new_id) else {
                log::error!("[SD] filesystem crawling failed for a created instance; aborting");
                std::process::abort();
            };
            state.known.asil_b.merge(found.asil_b);
            state.known.asil_qm.merge(found.asil_qm);

            for (wd, watch_id) in watches {
                self.store_watch(state, wd, watch_id);
                if let Some(new_watch) = state.watches.get_mut(&wd) {
                    new_watch.searches.extend(searches.iter().copied());
                }
                for search_handle in &searches {
                    if let Some(search) = state.searches.get_mut(search_handle) {
                        search.watches.insert(wd);
                    }
                }
            }
        }

        impacted.extend(searches);
    }

    /// Invoke the handler of every impacted search whose handle-set
    /// actually changed, exactly once per change.
    fn call_handlers(state: &mut WatcherState, impacted: &HashSet<FindServiceHandle>) {
        let WatcherState {
            searches,
            known,
            obsolete,
            ..
        } = state;
        for handle in impacted {
            if obsolete.contains(handle) {
                continue;
            }
            let Some(search) = searches.get_mut(handle) else {
                continue;
            };
            let mut handles = known.get(search.identifier.quality).known_handles(&search.identifier);
            handles.sort_by_key(|h| (h.service_id, h.instance_id));
            let new_set: HashSet<ServiceHandle> = handles.iter().copied().collect();
            if new_set == search.previous_handles {
                continue;
            }
            search.previous_handles = new_set;
            log::debug!(
                "[SD] calling handler for {handle:?} with {} handle(s)",
                handles.len()
            );
            (search.handler)(&handles, *handle);
        }
    }

    fn store_watch(
        &self,
        state: &mut WatcherState,
        wd: WatchDescriptor,
        identifier: EnrichedInstanceIdentifier,
    ) {
        if state.watches.contains_key(&wd) {
            // inotify returns the same descriptor for an already-watched
            // path; the bookkeeping exists already.
            return;
        }
        state.watches.insert(
            wd,
            WatchEntry {
                identifier,
                searches: HashSet::new(),
            },
        );

        let key = ServiceInstanceKey::from(identifier);
        state.watched_identifiers.entry(key).or_default().main = Some(wd);
        if key.instance_id.is_some() {
            let service_key = ServiceInstanceKey {
                service_id: key.service_id,
                instance_id: None,
            };
            state
                .watched_identifiers
                .entry(service_key)
                .or_default()
                .children
                .insert(wd);
        }
    }

    fn erase_watch(&self, state: &mut WatcherState, wd: WatchDescriptor) {
        let Some(watch) = state.watches.remove(&wd) else {
            return;
        };
        debug_assert!(watch.searches.is_empty(), "watch still linked to searches");
        let key = ServiceInstanceKey::from(watch.identifier);
        if key.instance_id.is_some() {
            state.watched_identifiers.remove(&key);
            let service_key = ServiceInstanceKey {
                service_id: key.service_id,
                instance_id: None,
            };
            if let Some(parent) = state.watched_identifiers.get_mut(&service_key) {
                parent.children.remove(&wd);
            }
        } else if let Some(entry) = state.watched_identifiers.get_mut(&key) {
            entry.main = None;
        }
    }

    /// Consume deferred `stop_find_service` requests: unlink the searches
    /// from their watches and drop watches nobody references anymore.
    fn transfer_obsolete_searches(&self, state: &mut WatcherState) {
        let obsolete: Vec<FindServiceHandle> = state.obsolete.drain().collect();
        for handle in obsolete {
            let Some(search) = state.searches.remove(&handle) else {
                log::warn!("[SD] could not find search request for {handle:?}");
                continue;
            };
            for wd in search.watches {
                let Some(watch) = state.watches.get_mut(&wd) else {
                    log::error!("[SD] could not find watch for {handle:?}");
                    continue;
                };
                watch.searches.remove(&handle);
                if watch.searches.is_empty() {
                    let identifier = watch.identifier;
                    state.known.asil_b.remove_matching(&identifier);
                    state.known.asil_qm.remove_matching(&identifier);
                    let _ = self.inotify.remove_watch(wd);
                    self.erase_watch(state, wd);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn client() -> (tempfile::TempDir, Arc<ServiceDiscoveryClient>) {
        let dir = tempfile::tempdir().unwrap();
        let client = ServiceDiscoveryClient::start(dir.path().join("sd")).expect("client");
        (dir, client)
    }

    fn qm(service: u16, instance: u16) -> EnrichedInstanceIdentifier {
        EnrichedInstanceIdentifier::new(service, instance, QualityType::AsilQm)
    }

    #[test]
    fn test_offer_creates_flag_files_per_quality() {
        let (_dir, client) = client();
        let id = EnrichedInstanceIdentifier::new(3, 1, QualityType::AsilB);
        client.offer_service(id).expect("offer");

        assert!(FlagFile::exists(client.root(), &id.with_quality(QualityType::AsilB)));
        assert!(FlagFile::exists(client.root(), &id.with_quality(QualityType::AsilQm)));
    }

    #[test]
    fn test_double_offer_is_rejected() {
        let (_dir, client) = client();
        client.offer_service(qm(3, 1)).expect("offer");
        assert!(matches!(
            client.offer_service(qm(3, 1)),
            Err(ComError::BindingFailure(_))
        ));
    }

    #[test]
    fn test_stop_offer_removes_flag_files() {
        let (_dir, client) = client();
        client.offer_service(qm(3, 1)).expect("offer");
        client
            .stop_offer_service(qm(3, 1), QualityTypeSelector::Both)
            .expect("stop offer");
        assert!(!FlagFile::exists(client.root(), &qm(3, 1)));
        assert!(matches!(
            client.stop_offer_service(qm(3, 1), QualityTypeSelector::Both),
            Err(ComError::BindingFailure(_))
        ));
    }

    #[test]
    fn test_qm_selector_withdraws_only_qm_part() {
        let (_dir, client) = client();
        let id = EnrichedInstanceIdentifier::new(3, 1, QualityType::AsilB);
        client.offer_service(id).expect("offer");
        client
            .stop_offer_service(id, QualityTypeSelector::AsilQm)
            .expect("disconnect QM");
        assert!(!FlagFile::exists(client.root(), &id.with_quality(QualityType::AsilQm)));
        assert!(FlagFile::exists(client.root(), &id.with_quality(QualityType::AsilB)));
    }

    #[test]
    fn test_find_service_snapshot() {
        let (_dir, client) = client();
        client.offer_service(qm(3, 1)).expect("offer");
        client.offer_service(qm(3, 2)).expect("offer");

        let any = EnrichedInstanceIdentifier::any_instance(3, QualityType::AsilQm);
        let handles = client.find_service(any).expect("find");
        assert_eq!(handles.len(), 2);
        assert_eq!(handles[0].instance_id, 1);
        assert_eq!(handles[1].instance_id, 2);

        assert!(client.find_service(qm(9, 9)).expect("find").is_empty());
    }

    #[test]
    fn test_start_find_service_calls_handler_synchronously_for_existing_offer() {
        let (_dir, client) = client();
        client.offer_service(qm(4, 1)).expect("offer");

        let calls = Arc::new(AtomicUsize::new(0));
        let calls_in_handler = Arc::clone(&calls);
        let handle = client
            .start_find_service(
                Box::new(move |handles, _| {
                    assert_eq!(handles.len(), 1);
                    calls_in_handler.fetch_add(1, Ordering::SeqCst);
                }),
                qm(4, 1),
            )
            .expect("start find");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        client.stop_find_service(handle).expect("stop find");
    }

    #[test]
    fn test_start_find_service_without_offer_stays_silent() {
        let (_dir, client) = client();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_in_handler = Arc::clone(&calls);
        let handle = client
            .start_find_service(
                Box::new(move |_, _| {
                    calls_in_handler.fetch_add(1, Ordering::SeqCst);
                }),
                qm(4, 1),
            )
            .expect("start find");
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        client.stop_find_service(handle).expect("stop find");
    }

    #[test]
    fn test_handles_are_unique_per_registration() {
        let (_dir, client) = client();
        let a = client
            .start_find_service(Box::new(|_, _| {}), qm(1, 1))
            .unwrap();
        let b = client
            .start_find_service(Box::new(|_, _| {}), qm(1, 1))
            .unwrap();
        assert_ne!(a, b);
    }
}
