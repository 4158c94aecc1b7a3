// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Identifier and quality types shared across the transport core.
//!
//! [`ElementFqId`] is the key used in every shared-memory map: it names one
//! event or field of one service instance. Identifiers are plain `#[repr(C)]`
//! PODs because they are stored verbatim inside shared-memory segments.

use serde::Deserialize;
use std::fmt;

/// Safety integrity qualification of a channel or consumer.
///
/// ASIL-B is the safety-critical quality, QM is best-effort. A dual-quality
/// instance publishes both; QM consumers must never starve the ASIL-B path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
pub enum QualityType {
    /// Quality-managed (best effort)
    #[serde(rename = "QM")]
    AsilQm,
    /// Safety-qualified
    #[serde(rename = "ASIL_B")]
    AsilB,
}

impl QualityType {
    /// Token used inside flag-file names (`asil-b` / `asil-qm`)
    #[must_use]
    pub fn as_file_token(self) -> &'static str {
        match self {
            Self::AsilB => "asil-b",
            Self::AsilQm => "asil-qm",
        }
    }
}

/// Transport binding selected by the deployment.
///
/// Only the shared-memory binding is implemented; the other arms exist so
/// deployments referencing them fail with a well-defined error instead of
/// silently falling through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum BindingType {
    /// Shared-memory binding (implemented)
    #[serde(rename = "LoLa")]
    Lola,
    /// SOME/IP network binding (not implemented)
    SomeIp,
    /// Test double binding (not implemented)
    Fake,
}

/// Kind of a service element
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ElementType {
    /// Fire-and-forget notification element
    Event = 0,
    /// Element with a latched last value, offered with an initial value
    Field = 1,
}

/// Fully qualified id of one service element of one service instance.
///
/// Used as key in all shared-memory control and storage maps, so it must be
/// a fixed-layout POD.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(C)]
pub struct ElementFqId {
    /// Service type id from the deployment
    pub service_id: u16,
    /// Instance id from the deployment
    pub instance_id: u16,
    /// Element id within the service type
    pub element_id: u8,
    /// Event or field
    pub element_type: u8,
}

impl ElementFqId {
    /// Build an id from its parts
    #[must_use]
    pub fn new(
        service_id: u16,
        element_id: u8,
        instance_id: u16,
        element_type: ElementType,
    ) -> Self {
        Self {
            service_id,
            instance_id,
            element_id,
            element_type: element_type as u8,
        }
    }
}

impl fmt::Display for ElementFqId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "S:{} I:{} E:{}",
            self.service_id, self.instance_id, self.element_id
        )
    }
}

/// Handle identifying one discovered service instance offer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ServiceHandle {
    /// Service type id
    pub service_id: u16,
    /// Instance id
    pub instance_id: u16,
    /// Quality the offer was discovered under
    pub quality: QualityType,
}

/// Instance identifier enriched with an explicit quality selector.
///
/// The instance id may be absent for "find any instance of this service"
/// searches; the discovery layer then watches the whole service directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EnrichedInstanceIdentifier {
    /// Service type id
    pub service_id: u16,
    /// Concrete instance, or `None` for an any-instance search
    pub instance_id: Option<u16>,
    /// Quality selector
    pub quality: QualityType,
}

impl EnrichedInstanceIdentifier {
    /// Identifier for a concrete instance
    #[must_use]
    pub fn new(service_id: u16, instance_id: u16, quality: QualityType) -> Self {
        Self {
            service_id,
            instance_id: Some(instance_id),
            quality,
        }
    }

    /// Identifier covering any instance of a service
    #[must_use]
    pub fn any_instance(service_id: u16, quality: QualityType) -> Self {
        Self {
            service_id,
            instance_id: None,
            quality,
        }
    }

    /// Same identifier with a different quality selector
    #[must_use]
    pub fn with_quality(self, quality: QualityType) -> Self {
        Self { quality, ..self }
    }
}

/// Quality-unaware key for the watcher's watch-reuse bookkeeping:
/// service id plus optional instance id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ServiceInstanceKey {
    /// Service type id
    pub service_id: u16,
    /// Concrete instance, or `None` for the service-level directory
    pub instance_id: Option<u16>,
}

impl From<EnrichedInstanceIdentifier> for ServiceInstanceKey {
    fn from(id: EnrichedInstanceIdentifier) -> Self {
        Self {
            service_id: id.service_id,
            instance_id: id.instance_id,
        }
    }
}

/// Pair of values, one per supported quality
#[derive(Debug, Default, Clone)]
pub struct QualityAware<T> {
    /// Quality-managed part
    pub asil_qm: T,
    /// Safety-qualified part
    pub asil_b: T,
}

impl<T> QualityAware<T> {
    /// Borrow the part for the given quality
    pub fn get(&self, quality: QualityType) -> &T {
        match quality {
            QualityType::AsilQm => &self.asil_qm,
            QualityType::AsilB => &self.asil_b,
        }
    }

    /// Mutably borrow the part for the given quality
    pub fn get_mut(&mut self, quality: QualityType) -> &mut T {
        match quality {
            QualityType::AsilQm => &mut self.asil_qm,
            QualityType::AsilB => &mut self.asil_b,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_element_fq_id_is_pod_sized() {
        // The id is stored inside shared memory; keep the layout tight.
        assert_eq!(std::mem::size_of::<ElementFqId>(), 6);
    }

    #[test]
    fn test_quality_file_tokens() {
        assert_eq!(QualityType::AsilB.as_file_token(), "asil-b");
        assert_eq!(QualityType::AsilQm.as_file_token(), "asil-qm");
    }

    #[test]
    fn test_enriched_identifier_quality_switch() {
        let id = EnrichedInstanceIdentifier::new(12, 7, QualityType::AsilB);
        let qm = id.with_quality(QualityType::AsilQm);
        assert_eq!(qm.service_id, 12);
        assert_eq!(qm.instance_id, Some(7));
        assert_eq!(qm.quality, QualityType::AsilQm);
    }

    #[test]
    fn test_quality_aware_accessors() {
        let mut qa = QualityAware::<u32>::default();
        *qa.get_mut(QualityType::AsilB) = 3;
        assert_eq!(*qa.get(QualityType::AsilB), 3);
        assert_eq!(*qa.get(QualityType::AsilQm), 0);
    }
}
