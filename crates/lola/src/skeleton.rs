// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Skeleton: the providing side of one service instance.
//!
//! Lifecycle: `create` (take the existence marker) → `prepare_offer`
//! (decide recreate vs re-open via the usage marker) → `register_event` /
//! `register_field` per element → `finalize_offer` (advertise) →
//! `prepare_stop_offer`.
//!
//! Crash survival rests on the two marker files (see [`crate::shm::flock`]):
//! winning the exclusive usage flock at `prepare_offer` proves no proxy
//! still maps the previous arena, so it is removed and recreated. Losing
//! it means live proxies exist: the previous arena is re-opened in place,
//! the provider pid is refreshed and in-flight writes of the crashed
//! predecessor are invalidated.

use std::sync::atomic::AtomicU32;
use std::sync::Arc;

use crate::config::{ServiceInstanceDeployment, ServiceTypeDeployment, ShmSizeCalcMode};
use crate::control::event_control::SkeletonEventProperties;
use crate::control::slot_status::{EventTimestamp, SlotIndex};
use crate::control::transaction_log::LogIndex;
use crate::control::EventDataControlComposite;
use crate::discovery::client::QualityTypeSelector;
use crate::error::{ComError, Result};
use crate::runtime::{MessagePassingService, Runtime};
use crate::shm::arena::Arena;
use crate::shm::flock::{FlockKind, LockFile};
use crate::shm::path::{PartialRestartPathBuilder, ShmPathBuilder};
use crate::shm::segment::ShmSegment;
use crate::shm::service_data::{
    EventDataStorage, EventMetaInfo, SampleLayout, ServiceDataControl, ServiceDataStorage,
};
use crate::types::{ElementFqId, ElementType, EnrichedInstanceIdentifier, QualityType};

/// Layout declaration of one element, needed before the typed
/// registration to size the shared memory
#[derive(Debug, Clone)]
pub struct ElementSpec {
    /// Element name as configured in the deployment
    pub name: String,
    /// Event or field
    pub element_type: ElementType,
    /// Size/alignment of the sample type
    pub layout: SampleLayout,
}

impl ElementSpec {
    /// Spec for an event carrying samples of type `T`
    #[must_use]
    pub fn event<T>(name: &str) -> Self {
        Self {
            name: name.to_string(),
            element_type: ElementType::Event,
            layout: SampleLayout::of::<T>(),
        }
    }

    /// Spec for a field carrying values of type `T`
    #[must_use]
    pub fn field<T>(name: &str) -> Self {
        Self {
            name: name.to_string(),
            element_type: ElementType::Field,
            layout: SampleLayout::of::<T>(),
        }
    }
}

struct ShmResourceStorageSizes {
    data: usize,
    control_qm: usize,
    control_asil_b: Option<usize>,
}

/// The providing side of one service instance
pub struct Skeleton {
    runtime: Arc<Runtime>,
    service: ServiceTypeDeployment,
    instance: ServiceInstanceDeployment,
    shm_paths: ShmPathBuilder,
    restart_paths: PartialRestartPathBuilder,
    // Exclusively flocked for the skeleton's lifetime; unlinked on drop.
    _existence_marker: LockFile,
    usage_marker: Option<LockFile>,
    storage: Option<ServiceDataStorage>,
    control_qm: Option<ServiceDataControl>,
    control_asil_b: Option<ServiceDataControl>,
    was_old_shm_region_reopened: bool,
    offered: bool,
}

impl Skeleton {
    /// Claim the instance: create the partial-restart directory, then win
    /// the exclusive flock on the existence marker. Failure to win it
    /// means another live skeleton already provides this instance.
    pub fn create(runtime: &Arc<Runtime>, instance_specifier: &str) -> Result<Self> {
        let config = runtime.config().find_instance(instance_specifier).ok_or_else(|| {
            ComError::InvalidBindingInformation(format!(
                "no deployment for instance specifier {instance_specifier}"
            ))
        })?;
        let service = config.service.clone();
        let instance = config.instance.clone();

        let restart_paths = PartialRestartPathBuilder::new(
            service.service_id,
            &runtime.config().paths.partial_restart_root,
        );
        create_partial_restart_directory(&restart_paths)?;

        // The marker may pre-exist (another live skeleton or a crashed
        // predecessor); only the flock tells which, so ownership is taken
        // after winning it.
        let mut existence_marker = LockFile::create_or_open(
            restart_paths.existence_marker_file_path(instance.instance_id),
            false,
        )?;
        if !existence_marker.try_lock(FlockKind::Exclusive)? {
            log::error!(
                "[SKL] flock try_lock failed: another skeleton is actively offering \
                 service {} instance {}",
                service.service_id,
                instance.instance_id
            );
            return Err(ComError::BindingFailure(
                "service instance is already provided by a live skeleton".into(),
            ));
        }
        existence_marker.take_ownership();

        Ok(Self {
            runtime: Arc::clone(runtime),
            shm_paths: ShmPathBuilder::new(service.service_id),
            restart_paths,
            service,
            instance,
            _existence_marker: existence_marker,
            usage_marker: None,
            storage: None,
            control_qm: None,
            control_asil_b: None,
            was_old_shm_region_reopened: false,
            offered: false,
        })
    }

    /// Create or re-open the shared-memory arenas, decided by the usage
    /// marker flock.
    pub fn prepare_offer(&mut self, specs: &[ElementSpec]) -> Result<()> {
        let usage_marker = LockFile::create_or_open(
            self.restart_paths.usage_marker_file_path(self.instance.instance_id),
            // Never owned: proxies may hold shared locks across our
            // restarts, and that knowledge must survive us.
            false,
        )?;

        let unused_by_proxies = usage_marker.try_lock(FlockKind::Exclusive)?;
        self.was_old_shm_region_reopened = !unused_by_proxies;

        let result = if unused_by_proxies {
            log::debug!(
                "[SKL] recreating SHM of skeleton (S:{} I:{})",
                self.service.service_id,
                self.instance.instance_id
            );
            // Unused either because the previous offer ended cleanly or
            // because the predecessor crashed before any proxy connected;
            // both ways the old region is disposable.
            self.remove_stale_shm_artefacts();
            let created = self.create_shared_memory(specs);
            usage_marker.unlock();
            created
        } else {
            log::debug!(
                "[SKL] reusing SHM of skeleton (S:{} I:{})",
                self.service.service_id,
                self.instance.instance_id
            );
            let opened = self.open_existing_shared_memory();
            if opened.is_ok() {
                self.cleanup_shared_memory_after_crash();
            }
            opened
        };
        self.usage_marker = Some(usage_marker);
        result
    }

    /// Register one event, creating its control/storage entries or, on a
    /// re-opened arena, attaching to the existing ones and rolling back
    /// the skeleton tracing log of the crashed predecessor.
    pub fn register_event<T>(&mut self, name: &str) -> Result<EventPublisher<T>> {
        self.register_element::<T>(name, ElementType::Event)
    }

    /// Register one field. Fields must be offered with an initial value;
    /// on a re-opened arena the previous value is retained instead.
    pub fn register_field<T>(&mut self, name: &str, initial: Option<T>) -> Result<EventPublisher<T>> {
        if !self.was_old_shm_region_reopened && initial.is_none() {
            return Err(ComError::FieldValueIsNotValid);
        }
        let publisher = self.register_element::<T>(name, ElementType::Field)?;
        if !self.was_old_shm_region_reopened {
            if let Some(value) = initial {
                publisher.send_value(value)?;
            }
        }
        Ok(publisher)
    }

    fn register_element<T>(
        &mut self,
        name: &str,
        element_type: ElementType,
    ) -> Result<EventPublisher<T>> {
        let fq_id = self.element_fq_id(name, element_type)?;
        let properties = self.element_properties(name)?;
        let storage = self
            .storage
            .as_ref()
            .ok_or_else(|| ComError::BindingFailure("prepare_offer has not run".into()))?;
        let control_qm = self
            .control_qm
            .as_ref()
            .ok_or_else(|| ComError::BindingFailure("prepare_offer has not run".into()))?;

        let (event_storage, composite) = if self.was_old_shm_region_reopened {
            // The elements of a re-opened arena were created by the
            // previous incarnation; a registered element missing there
            // means provider and deployment disagree about the segment
            // contents.
            let control = control_qm.event_control(&fq_id).unwrap_or_else(|| {
                log::error!("[SKL] no control block for registered element {fq_id}; aborting");
                std::process::abort();
            });
            control.rollback_skeleton_log();
            let control_b = self.control_asil_b.as_ref().map(|root| {
                root.event_control(&fq_id).unwrap_or_else(|| {
                    log::error!(
                        "[SKL] no ASIL-B control block for registered element {fq_id}; aborting"
                    );
                    std::process::abort();
                })
            });
            let event_storage = storage.event_storage::<T>(&fq_id)?;
            (event_storage, EventDataControlComposite::new(control, control_b))
        } else {
            storage.insert_event_storage(fq_id, properties.number_of_slots, SampleLayout::of::<T>())?;
            let control = control_qm.insert_event_control(fq_id, &properties)?;
            let control_b = match self.control_asil_b.as_ref() {
                Some(root) => Some(root.insert_event_control(fq_id, &properties)?),
                None => None,
            };
            let event_storage = storage.event_storage::<T>(&fq_id)?;
            (event_storage, EventDataControlComposite::new(control, control_b))
        };

        let skeleton_log = composite.qm_control().register_skeleton_log();
        let next_timestamp = if composite.qm_control().num_new_events(0) == 0 {
            1
        } else {
            composite.latest_timestamp() + 1
        };

        Ok(EventPublisher {
            fq_id,
            storage: event_storage,
            composite,
            skeleton_log,
            next_timestamp: AtomicU32::new(next_timestamp),
            messaging: Arc::clone(self.runtime.messaging()),
        })
    }

    /// Advertise the instance through service discovery
    pub fn finalize_offer(&mut self) -> Result<()> {
        self.runtime
            .discovery()
            .offer_service(self.enriched_identifier())?;
        self.offered = true;
        Ok(())
    }

    /// Withdraw the offer and, when no proxy holds the usage marker,
    /// remove the shared-memory segments.
    pub fn prepare_stop_offer(&mut self) {
        if self.offered {
            if let Err(e) = self
                .runtime
                .discovery()
                .stop_offer_service(self.enriched_identifier(), QualityTypeSelector::Both)
            {
                log::warn!("[SKL] stop-offer failed: {e}");
            }
            self.offered = false;
        }

        if let Some(usage_marker) = self.usage_marker.take() {
            match usage_marker.try_lock(FlockKind::Exclusive) {
                Ok(true) => {
                    self.remove_shared_memory();
                    usage_marker.unlock();
                }
                Ok(false) => {
                    log::info!(
                        "[SKL] could not exclusively lock the usage marker: proxies are still \
                         subscribed, not removing shared memory"
                    );
                    self.usage_marker = Some(usage_marker);
                }
                Err(e) => {
                    log::warn!("[SKL] usage marker flock failed: {e}");
                    self.usage_marker = Some(usage_marker);
                }
            }
        }

        self.storage = None;
        self.control_qm = None;
        self.control_asil_b = None;
    }

    /// Invalidate every slot the crashed predecessor left in-writing.
    /// Only called after a crash was detected via the usage marker.
    pub fn cleanup_shared_memory_after_crash(&self) {
        if let Some(control) = &self.control_qm {
            for fq_id in control.element_ids() {
                if let Some(event_control) = control.event_control(&fq_id) {
                    event_control.remove_allocations_for_writing();
                }
            }
        }
        if let Some(control) = &self.control_asil_b {
            for fq_id in control.element_ids() {
                if let Some(event_control) = control.event_control(&fq_id) {
                    event_control.remove_allocations_for_writing();
                }
            }
        }
    }

    /// Stop-offer only the QM channel so no new QM proxy can find the
    /// instance. Only valid for ASIL-B instances.
    pub fn disconnect_qm_consumers(&self) {
        assert!(
            self.instance.asil_level == QualityType::AsilB,
            "disconnect_qm_consumers called on a QM instance"
        );
        if let Err(e) = self
            .runtime
            .discovery()
            .stop_offer_service(self.enriched_identifier(), QualityTypeSelector::AsilQm)
        {
            log::warn!("[SKL] disconnecting QM consumers via QM stop-offer failed: {e}");
        }
    }

    /// Meta info of a registered element
    #[must_use]
    pub fn event_meta_info(&self, fq_id: &ElementFqId) -> Option<EventMetaInfo> {
        self.storage.as_ref().and_then(|s| s.meta_info(fq_id))
    }

    /// Quality the instance is deployed under
    #[must_use]
    pub fn instance_quality_type(&self) -> QualityType {
        self.instance.asil_level
    }

    /// True when `prepare_offer` attached to a predecessor's arena
    #[must_use]
    pub fn was_shm_region_reopened(&self) -> bool {
        self.was_old_shm_region_reopened
    }

    // ----- internals -----

    fn enriched_identifier(&self) -> EnrichedInstanceIdentifier {
        EnrichedInstanceIdentifier::new(
            self.service.service_id,
            self.instance.instance_id,
            self.instance.asil_level,
        )
    }

    fn has_asil_b_support(&self) -> bool {
        self.instance.asil_level == QualityType::AsilB
    }

    fn element_fq_id(&self, name: &str, element_type: ElementType) -> Result<ElementFqId> {
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
        Ok(ElementFqId::new(
            self.service.service_id,
            *element_id,
            self.instance.instance_id,
            element_type,
        ))
    }

    fn element_properties(&self, name: &str) -> Result<SkeletonEventProperties> {
        let config = self.instance.events.get(name).ok_or_else(|| {
            ComError::InvalidBindingInformation(format!(
                "element {name} has no instance properties"
            ))
        })?;
        Ok(SkeletonEventProperties {
            number_of_slots: config.number_of_slots,
            max_subscribers: config.max_subscribers,
            enforce_max_samples: config.enforce_max_samples,
        })
    }

    fn control_mode(&self) -> u32 {
        if self.instance.strict_permissions {
            0o660
        } else {
            0o666
        }
    }

    fn data_mode(&self) -> u32 {
        if self.instance.strict_permissions {
            0o640
        } else {
            0o644
        }
    }

    fn create_shared_memory(&mut self, specs: &[ElementSpec]) -> Result<()> {
        let sizes = self.calculate_shm_resource_storage_sizes(specs)?;
        let instance_id = self.instance.instance_id;
        let element_count = specs.len();

        let control_qm_segment = ShmSegment::create(
            &self.shm_paths.control_channel_shm_name(instance_id, QualityType::AsilQm),
            sizes.control_qm,
            self.control_mode(),
        )?;
        let control_qm_arena = Arc::new(Arena::create_in_segment(control_qm_segment)?);
        self.control_qm = Some(ServiceDataControl::create(
            control_qm_arena,
            element_count,
            self.runtime.config().global.uid_pid_capacity,
        )?);

        if let Some(control_b_size) = sizes.control_asil_b {
            let control_b_segment = ShmSegment::create(
                &self.shm_paths.control_channel_shm_name(instance_id, QualityType::AsilB),
                control_b_size,
                self.control_mode(),
            )?;
            let control_b_arena = Arc::new(Arena::create_in_segment(control_b_segment)?);
            self.control_asil_b = Some(ServiceDataControl::create(
                control_b_arena,
                element_count,
                self.runtime.config().global.uid_pid_capacity,
            )?);
        }

        let data_size = self.instance.shared_memory_size.unwrap_or(sizes.data);
        let data_segment = ShmSegment::create(
            &self.shm_paths.data_channel_shm_name(instance_id),
            data_size,
            self.data_mode(),
        )?;
        let data_arena = Arc::new(Arena::create_in_segment(data_segment)?);
        self.storage = Some(ServiceDataStorage::create(
            data_arena,
            element_count,
            self.runtime.pid(),
        )?);
        Ok(())
    }

    fn open_existing_shared_memory(&mut self) -> Result<()> {
        let instance_id = self.instance.instance_id;

        let control_qm_segment = ShmSegment::open(
            &self.shm_paths.control_channel_shm_name(instance_id, QualityType::AsilQm),
        )?;
        self.control_qm = Some(ServiceDataControl::open(Arc::new(Arena::open_segment(
            control_qm_segment,
        )?)));

        if self.has_asil_b_support() {
            let control_b_segment = ShmSegment::open(
                &self.shm_paths.control_channel_shm_name(instance_id, QualityType::AsilB),
            )?;
            self.control_asil_b = Some(ServiceDataControl::open(Arc::new(Arena::open_segment(
                control_b_segment,
            )?)));
        }

        let data_segment = ShmSegment::open(&self.shm_paths.data_channel_shm_name(instance_id))?;
        let storage = ServiceDataStorage::open(Arc::new(Arena::open_segment(data_segment)?));
        storage.set_skeleton_pid(self.runtime.pid());
        self.storage = Some(storage);
        Ok(())
    }

    fn remove_shared_memory(&self) {
        let instance_id = self.instance.instance_id;
        for name in [
            self.shm_paths.control_channel_shm_name(instance_id, QualityType::AsilQm),
            self.shm_paths.control_channel_shm_name(instance_id, QualityType::AsilB),
            self.shm_paths.data_channel_shm_name(instance_id),
        ] {
            if let Err(e) = ShmSegment::unlink(&name) {
                log::warn!("[SKL] could not unlink segment {name}: {e}");
            }
        }
    }

    fn remove_stale_shm_artefacts(&self) {
        // Identical to removal; stale artefacts are just segments of a
        // predecessor nobody maps anymore.
        self.remove_shared_memory();
    }

    fn calculate_shm_resource_storage_sizes(
        &self,
        specs: &[ElementSpec],
    ) -> Result<ShmResourceStorageSizes> {
        let sizes = match self.runtime.config().global.shm_size_calc_mode {
            ShmSizeCalcMode::Simulation => self.calculate_sizes_by_simulation(specs)?,
            ShmSizeCalcMode::Estimation => self.calculate_sizes_by_estimation(specs),
        };
        log::debug!(
            "[SKL] calculated shm sizes: data {} bytes, control QM {} bytes, control ASIL-B {:?}",
            sizes.data,
            sizes.control_qm,
            sizes.control_asil_b
        );
        Ok(sizes)
    }

    /// Over-approximating closed-form estimate from type sizes plus fixed
    /// per-container overheads.
    fn calculate_sizes_by_estimation(&self, specs: &[ElementSpec]) -> ShmResourceStorageSizes {
        const BASE: usize = 512;
        const CONTAINER_OVERHEAD: usize = 256;
        const MAP_ENTRY_OVERHEAD: usize = 64;
        const LOG_NODE_BYTES: usize = 48;
        const LOG_ENTRY_BYTES: usize = 16;
        const SLOT_WORD_BYTES: usize = 8;
        const UID_PID_ENTRY_BYTES: usize = 16;

        let mut data = BASE;
        let mut control = BASE
            + CONTAINER_OVERHEAD
            + usize::from(self.runtime.config().global.uid_pid_capacity) * UID_PID_ENTRY_BYTES;

        for spec in specs {
            let properties = self
                .element_properties(&spec.name)
                .unwrap_or(SkeletonEventProperties {
                    number_of_slots: 0,
                    max_subscribers: 0,
                    enforce_max_samples: false,
                });
            let slots = usize::from(properties.number_of_slots);
            let subscribers = usize::from(properties.max_subscribers);

            data += slots * spec.layout.size as usize
                + spec.layout.align as usize
                + 2 * MAP_ENTRY_OVERHEAD
                + CONTAINER_OVERHEAD;
            control += slots * SLOT_WORD_BYTES
                + (subscribers + 1) * (LOG_NODE_BYTES + slots * LOG_ENTRY_BYTES)
                + MAP_ENTRY_OVERHEAD
                + CONTAINER_OVERHEAD;
        }

        ShmResourceStorageSizes {
            data: round_up_to_page(data),
            control_qm: round_up_to_page(control),
            control_asil_b: self.has_asil_b_support().then(|| round_up_to_page(control)),
        }
    }

    /// Run the real root/element construction against heap-backed arenas
    /// and read back the peak allocation.
    fn calculate_sizes_by_simulation(&self, specs: &[ElementSpec]) -> Result<ShmResourceStorageSizes> {
        // The estimate over-approximates, so it bounds the scratch arenas.
        let bound = self.calculate_sizes_by_estimation(specs);
        let element_count = specs.len();
        let uid_pid_capacity = self.runtime.config().global.uid_pid_capacity;

        let data_arena = Arc::new(Arena::create_on_heap(bound.data * 2)?);
        let data_root =
            ServiceDataStorage::create(Arc::clone(&data_arena), element_count, self.runtime.pid())?;
        let control_arena = Arc::new(Arena::create_on_heap(bound.control_qm * 2)?);
        let control_root = ServiceDataControl::create(
            Arc::clone(&control_arena),
            element_count,
            uid_pid_capacity,
        )?;

        for spec in specs {
            let fq_id = self.element_fq_id(&spec.name, spec.element_type)?;
            let properties = self.element_properties(&spec.name)?;
            data_root.insert_event_storage(fq_id, properties.number_of_slots, spec.layout)?;
            control_root.insert_event_control(fq_id, &properties)?;
        }

        let control_size = round_up_to_page(control_arena.used_bytes());
        Ok(ShmResourceStorageSizes {
            data: round_up_to_page(data_arena.used_bytes()),
            control_qm: control_size,
            // Both control segments hold identical structures.
            control_asil_b: self.has_asil_b_support().then_some(control_size),
        })
    }
}

impl Drop for Skeleton {
    fn drop(&mut self) {
        if self.offered {
            self.prepare_stop_offer();
        }
    }
}

fn create_partial_restart_directory(paths: &PartialRestartPathBuilder) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::create_dir_all(paths.directory()).map_err(|e| {
        log::error!(
            "[SKL] could not create partial restart directory {}: {e}",
            paths.directory().display()
        );
        ComError::BindingFailure("could not create partial restart directory".into())
    })?;
    let _ = std::fs::set_permissions(
        paths.directory(),
        std::fs::Permissions::from_mode(0o777),
    );
    Ok(())
}

fn round_up_to_page(size: usize) -> usize {
    const PAGE: usize = 4096;
    (size + PAGE - 1) & !(PAGE - 1)
}

/// Publishing handle for one registered element.
///
/// Owns the element's composite control view and hands out slot writers.
/// Timestamps are a per-publisher monotonic clock seeded past the newest
/// timestamp found in a re-opened arena.
pub struct EventPublisher<T> {
    fq_id: ElementFqId,
    storage: EventDataStorage<T>,
    composite: EventDataControlComposite,
    skeleton_log: LogIndex,
    next_timestamp: AtomicU32,
    messaging: Arc<dyn MessagePassingService>,
}

impl<T> EventPublisher<T> {
    /// Claim the oldest free slot for writing.
    ///
    /// When the composite had to dismiss the QM channel, the latch is
    /// observable via [`EventDataControlComposite::is_qm_disconnected`];
    /// the composite logs the transition once.
    pub fn allocate(&self) -> Result<SampleWriter<'_, T>> {
        let (slot, _qm_dismissed) = self.composite.allocate_next_slot();
        let slot = slot.ok_or(ComError::SampleAllocationFailure)?;
        Ok(SampleWriter {
            publisher: self,
            slot,
            sent: false,
        })
    }

    /// Allocate, write and publish one value
    pub fn send_value(&self, value: T) -> Result<EventTimestamp> {
        let mut writer = self.allocate()?;
        writer.write(value);
        Ok(writer.send())
    }

    /// Reference the given slot through the skeleton tracing log
    #[must_use]
    pub fn trace_reference(&self, slot: SlotIndex) -> bool {
        self.composite
            .qm_control()
            .reference_specific_event(slot, self.skeleton_log)
    }

    /// Release a tracing reference
    pub fn trace_dereference(&self, slot: SlotIndex) {
        self.composite
            .qm_control()
            .dereference_event(slot, self.skeleton_log);
    }

    /// The element this publisher serves
    #[must_use]
    pub fn fq_id(&self) -> ElementFqId {
        self.fq_id
    }

    /// The dual-quality control pair
    #[must_use]
    pub fn composite(&self) -> &EventDataControlComposite {
        &self.composite
    }

    /// Newest published timestamp
    #[must_use]
    pub fn latest_timestamp(&self) -> EventTimestamp {
        self.composite.latest_timestamp()
    }
}

/// One claimed slot; publishes on [`SampleWriter::send`], discards on drop
pub struct SampleWriter<'a, T> {
    publisher: &'a EventPublisher<T>,
    slot: SlotIndex,
    sent: bool,
}

impl<T> SampleWriter<'_, T> {
    /// Index of the claimed slot
    #[must_use]
    pub fn slot(&self) -> SlotIndex {
        self.slot
    }

    /// Move a value into the slot's payload
    pub fn write(&mut self, value: T) {
        // SAFETY: the slot is claimed in-writing by this writer, so no
        // reader may access it and no other writer owns it.
        unsafe {
            self.publisher
                .storage
                .slot_ptr(usize::from(self.slot))
                .write(value);
        }
    }

    /// Mutable access to the slot's payload
    pub fn payload_mut(&mut self) -> &mut T {
        // SAFETY: see write(); exclusive by the slot protocol.
        unsafe { &mut *self.publisher.storage.slot_ptr(usize::from(self.slot)) }
    }

    /// Publish: payload writes happen-before the timestamp store
    pub fn send(mut self) -> EventTimestamp {
        use std::sync::atomic::Ordering;
        self.sent = true;
        let timestamp = self.publisher.next_timestamp.fetch_add(1, Ordering::Relaxed);
        self.publisher.composite.event_ready(self.slot, timestamp);
        self.publisher.messaging.notify_event(self.publisher.fq_id);
        timestamp
    }
}

impl<T> Drop for SampleWriter<'_, T> {
    fn drop(&mut self) {
        if !self.sent {
            self.publisher.composite.discard(self.slot);
        }
    }
}
