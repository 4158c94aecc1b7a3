// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Proxy: the consuming side of one discovered service instance.
//!
//! Creation order matters for crash safety:
//!
//! 1. Take the *shared* flock on the usage marker. This is what keeps the
//!    skeleton from garbage-collecting the arena for the proxy's whole
//!    lifetime.
//! 2. Open (never create) both segments by their deterministic paths.
//! 3. Run the rollback executor for this uid's transaction log id, erasing
//!    whatever a crashed previous incarnation left behind.
//! 4. Register the current pid; a differing previous pid is reported to
//!    the messaging layer as outdated.
//! 5. Subscribe to discovery so a stop-offer is observed.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::config::{ServiceInstanceDeployment, ServiceTypeDeployment};
use crate::control::event_control::EventDataControl;
use crate::control::rollback::TransactionLogRollbackExecutor;
use crate::control::slot_status::{EventSlotStatus, EventTimestamp, SlotIndex};
use crate::control::transaction_log::{LogIndex, TransactionLogId};
use crate::discovery::client::FindServiceHandle;
use crate::error::{ComError, Result};
use crate::runtime::Runtime;
use crate::shm::arena::Arena;
use crate::shm::flock::{FlockKind, LockFile};
use crate::shm::path::{PartialRestartPathBuilder, ShmPathBuilder};
use crate::shm::segment::ShmSegment;
use crate::shm::service_data::{EventDataStorage, ServiceDataControl, ServiceDataStorage};
use crate::types::{
    ElementFqId, ElementType, EnrichedInstanceIdentifier, QualityType, ServiceHandle,
};

/// The consuming side of one service instance
pub struct Proxy {
    runtime: Arc<Runtime>,
    service: ServiceTypeDeployment,
    instance: ServiceInstanceDeployment,
    quality: QualityType,
    control: ServiceDataControl,
    storage: ServiceDataStorage,
    transaction_log_id: TransactionLogId,
    available: Arc<AtomicBool>,
    find_handle: Option<FindServiceHandle>,
    // Shared-flocked for the proxy's lifetime (released when the fd
    // closes on drop); never owned, never unlinked.
    _usage_marker: LockFile,
}

impl Proxy {
    /// Connect to a discovered instance
    pub fn create(runtime: &Arc<Runtime>, handle: &ServiceHandle) -> Result<Self> {
        let config = runtime
            .config()
            .services
            .iter()
            .find(|s| {
                s.service.service_id == handle.service_id
                    && s.instance.instance_id == handle.instance_id
            })
            .ok_or_else(|| {
                ComError::InvalidBindingInformation(format!(
                    "no deployment for service {} instance {}",
                    handle.service_id, handle.instance_id
                ))
            })?;
        let service = config.service.clone();
        let instance = config.instance.clone();

        let restart_paths = PartialRestartPathBuilder::new(
            handle.service_id,
            &runtime.config().paths.partial_restart_root,
        );
        let usage_marker =
            LockFile::open(restart_paths.usage_marker_file_path(handle.instance_id))?;
        if !usage_marker.try_lock(FlockKind::Shared)? {
            log::error!(
                "[PRX] flock try_lock failed: the skeleton holds the usage marker exclusively: {}",
                usage_marker.path().display()
            );
            return Err(ComError::BindingFailure(
                "usage marker is exclusively locked by the skeleton".into(),
            ));
        }

        let shm_paths = ShmPathBuilder::new(handle.service_id);
        let control_segment = ShmSegment::open(
            &shm_paths.control_channel_shm_name(handle.instance_id, handle.quality),
        )?;
        let control = ServiceDataControl::open(Arc::new(Arena::open_segment(control_segment)?));
        let data_segment = ShmSegment::open(&shm_paths.data_channel_shm_name(handle.instance_id))?;
        let storage = ServiceDataStorage::open(Arc::new(Arena::open_segment(data_segment)?));

        // Erase whatever our crashed previous incarnation still holds
        // before taking any new references.
        let transaction_log_id: TransactionLogId = runtime.uid();
        TransactionLogRollbackExecutor::new(&control, transaction_log_id)
            .rollback_transaction_logs()
            .map_err(|e| {
                log::error!("[PRX] rolling back transaction logs failed: {e}");
                ComError::BindingFailure("could not roll back transaction logs".into())
            })?;

        let Some(previous_pid) = control.register_pid(runtime.uid(), runtime.pid()) else {
            // A full uid→pid table means the deployment's consumer count
            // is violated; no consistent recovery exists.
            log::error!("[PRX] could not register pid/uid in the service data control; aborting");
            std::process::abort();
        };
        if previous_pid != runtime.pid() {
            runtime.messaging().notify_outdated_node_id(
                handle.quality,
                previous_pid,
                storage.skeleton_pid(),
            );
        }

        let available = Arc::new(AtomicBool::new(false));
        let available_in_handler = Arc::clone(&available);
        let find_handle = runtime.discovery().start_find_service(
            Box::new(move |handles, _| {
                available_in_handler.store(!handles.is_empty(), Ordering::Release);
            }),
            EnrichedInstanceIdentifier::new(handle.service_id, handle.instance_id, handle.quality),
        )?;

        Ok(Self {
            runtime: Arc::clone(runtime),
            service,
            instance,
            quality: handle.quality,
            control,
            storage,
            transaction_log_id,
            available,
            find_handle: Some(find_handle),
            _usage_marker: usage_marker,
        })
    }

    /// Typed view onto one event of the instance
    pub fn event<T>(&self, name: &str) -> Result<ProxyEvent<T>> {
        self.element::<T>(name, ElementType::Event)
    }

    /// Typed view onto one field of the instance
    pub fn field<T>(&self, name: &str) -> Result<ProxyEvent<T>> {
        self.element::<T>(name, ElementType::Field)
    }

    fn element<T>(&self, name: &str, element_type: ElementType) -> Result<ProxyEvent<T>> {
        let table = match element_type {
            ElementType::Event => &self.service.events,
            ElementType::Field => &self.service.fields,
        };
        let element_id = table.get(name).ok_or_else(|| {
            ComError::InvalidBindingInformation(format!(
                "element {name} is not part of service {}",
                self.service.service_id
            ))
        })?;
        let fq_id = ElementFqId::new(
            self.service.service_id,
            *element_id,
            self.instance.instance_id,
            element_type,
        );

        // The deployment names this element, so the provider must have
        // registered it; a missing control block means provider and
        // consumer disagree about the segment contents.
        let control = self.control.event_control(&fq_id).unwrap_or_else(|| {
            log::error!("[PRX] no control block for element {fq_id}; aborting");
            std::process::abort();
        });
        let storage = self.storage.event_storage::<T>(&fq_id)?;

        let max_samples = self
            .instance
            .events
            .get(name)
            .map_or(1, |config| u32::from(config.max_samples));

        Ok(ProxyEvent {
            fq_id,
            control,
            storage,
            transaction_log_id: self.transaction_log_id,
            max_samples,
            log_index: None,
        })
    }

    /// False once the skeleton stop-offered the instance
    #[must_use]
    pub fn is_service_available(&self) -> bool {
        self.available.load(Ordering::Acquire)
    }

    /// Quality this proxy consumes
    #[must_use]
    pub fn quality(&self) -> QualityType {
        self.quality
    }

    /// Pid of the providing skeleton
    #[must_use]
    pub fn skeleton_pid(&self) -> i32 {
        self.storage.skeleton_pid()
    }
}

impl Drop for Proxy {
    fn drop(&mut self) {
        if let Some(handle) = self.find_handle.take() {
            let _ = self.runtime.discovery().stop_find_service(handle);
        }
    }
}

/// Consumer view of one event.
///
/// Operations other than `subscribe` require an active subscription and
/// report [`ComError::NotSubscribed`] otherwise.
pub struct ProxyEvent<T> {
    fq_id: ElementFqId,
    control: EventDataControl,
    storage: EventDataStorage<T>,
    transaction_log_id: TransactionLogId,
    max_samples: u32,
    log_index: Option<LogIndex>,
}

impl<T> ProxyEvent<T> {
    /// Register this subscriber's transaction log with the event
    pub fn subscribe(&mut self) -> Result<()> {
        if self.log_index.is_some() {
            return Err(ComError::BindingFailure(format!(
                "already subscribed to {}",
                self.fq_id
            )));
        }
        let index = self
            .control
            .register_subscriber(self.transaction_log_id, self.max_samples)?;
        self.log_index = Some(index);
        Ok(())
    }

    /// Drop the subscription. References still held through this
    /// subscription are released.
    pub fn unsubscribe(&mut self) {
        if self.log_index.take().is_some() {
            // The rollback path releases any outstanding references and
            // frees every log node registered under our id.
            self.control.rollback_subscriber(self.transaction_log_id);
        }
    }

    /// True while subscribed
    #[must_use]
    pub fn is_subscribed(&self) -> bool {
        self.log_index.is_some()
    }

    /// Number of published samples newer than `since`
    pub fn num_new_samples_available(&self, since: EventTimestamp) -> Result<usize> {
        if self.log_index.is_none() {
            return Err(ComError::NotSubscribed);
        }
        Ok(self.control.num_new_events(since))
    }

    /// Take a reference on the oldest unseen sample newer than `start`.
    ///
    /// The returned guard releases the reference on drop. `Ok(None)` means
    /// nothing new is published or the per-subscriber quota is exhausted.
    pub fn receive_next(&self, start: EventTimestamp) -> Result<Option<Sample<'_, T>>> {
        let log_index = self.log_index.ok_or(ComError::NotSubscribed)?;
        Ok(self
            .control
            .reference_next_event(start, log_index, EventSlotStatus::TIMESTAMP_MAX)
            .map(|(slot, timestamp)| Sample {
                event: self,
                log_index,
                slot,
                timestamp,
            }))
    }

    /// The element this view reads
    #[must_use]
    pub fn fq_id(&self) -> ElementFqId {
        self.fq_id
    }

    /// The event's control block (slot states, logs)
    #[must_use]
    pub fn control(&self) -> &EventDataControl {
        &self.control
    }
}

impl<T> Drop for ProxyEvent<T> {
    fn drop(&mut self) {
        // A clean drop releases the subscription; after a crash the next
        // incarnation's rollback does the same from the log alone.
        self.unsubscribe();
    }
}

/// One referenced sample; zero-copy view into the shared payload slot
pub struct Sample<'a, T> {
    event: &'a ProxyEvent<T>,
    log_index: LogIndex,
    slot: SlotIndex,
    timestamp: EventTimestamp,
}

impl<T> Sample<'_, T> {
    /// Producer timestamp of this sample
    #[must_use]
    pub fn timestamp(&self) -> EventTimestamp {
        self.timestamp
    }

    /// Slot the sample lives in
    #[must_use]
    pub fn slot(&self) -> SlotIndex {
        self.slot
    }
}

impl<T> std::ops::Deref for Sample<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: this guard holds a reference on the slot, so the
        // producer cannot reclaim it while we read.
        unsafe { self.event.storage.slot(usize::from(self.slot)) }
    }
}

impl<T> Drop for Sample<'_, T> {
    fn drop(&mut self) {
        self.event.control.dereference_event(self.slot, self.log_index);
    }
}
