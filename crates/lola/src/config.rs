// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Deployment configuration - single source of truth.
//!
//! The transport core never invents ids, slot counts or permissions; all of
//! them come from the parsed deployment. Parsing is JSON via serde; the
//! semantic content mirrors the service-type / service-instance split:
//!
//! - **Service type deployment**: service id plus the element-name to
//!   element-id mapping, shared by all instances of the type.
//! - **Service instance deployment**: instance id, quality level, per-event
//!   slot/subscriber limits, consumer/provider uid lists and permission
//!   strictness.
//!
//! # Example
//!
//! ```ignore
//! let config = Configuration::parse("deployment.json")?;
//! let svc = config.find_instance("/my/service/instance").unwrap();
//! assert_eq!(svc.service.binding, BindingType::Lola);
//! ```

use crate::error::{ComError, Result};
use crate::types::{BindingType, QualityType};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Default capacity of the uid→pid mapping table per service instance
pub const DEFAULT_UID_PID_CAPACITY: u16 = 50;

/// Strategy used to size the shared-memory segments at offer time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
pub enum ShmSizeCalcMode {
    /// Run the real construction against a heap-backed arena and record the
    /// peak allocation
    #[serde(rename = "SIMULATION")]
    #[default]
    Simulation,
    /// Over-approximate from type sizes and container overheads
    #[serde(rename = "ESTIMATION")]
    Estimation,
}

/// Process-global settings
#[derive(Debug, Clone, Deserialize)]
pub struct GlobalConfig {
    /// Shared-memory sizing strategy
    #[serde(default)]
    pub shm_size_calc_mode: ShmSizeCalcMode,
    /// Capacity of the per-instance uid→pid table
    #[serde(default = "default_uid_pid_capacity")]
    pub uid_pid_capacity: u16,
}

fn default_uid_pid_capacity() -> u16 {
    DEFAULT_UID_PID_CAPACITY
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            shm_size_calc_mode: ShmSizeCalcMode::default(),
            uid_pid_capacity: DEFAULT_UID_PID_CAPACITY,
        }
    }
}

/// Per-event deployment properties
#[derive(Debug, Clone, Deserialize)]
pub struct EventInstanceConfig {
    /// Number of sample slots backing this event
    pub number_of_slots: u16,
    /// Maximum number of concurrently subscribed proxies
    pub max_subscribers: u16,
    /// Per-subscriber sample quota
    pub max_samples: u16,
    /// Deny references beyond the quota even when slots are free
    #[serde(default)]
    pub enforce_max_samples: bool,
}

/// Deployment of a service type (shared by all instances)
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceTypeDeployment {
    /// Service type id
    pub service_id: u16,
    /// Transport binding
    pub binding: BindingType,
    /// Event name → element id
    #[serde(default)]
    pub events: BTreeMap<String, u8>,
    /// Field name → element id
    #[serde(default)]
    pub fields: BTreeMap<String, u8>,
}

/// Deployment of one service instance
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceInstanceDeployment {
    /// Instance id
    pub instance_id: u16,
    /// Quality level the instance is offered under
    pub asil_level: QualityType,
    /// Per-event properties, keyed by event/field name
    pub events: BTreeMap<String, EventInstanceConfig>,
    /// Uids allowed to open the instance as consumers
    #[serde(default)]
    pub allowed_consumer_uids: Vec<u32>,
    /// Uids allowed to provide the instance
    #[serde(default)]
    pub allowed_provider_uids: Vec<u32>,
    /// Restrict segment permission bits to owner+group
    #[serde(default)]
    pub strict_permissions: bool,
    /// Explicit data-segment size overriding the sizing calculation
    #[serde(default)]
    pub shared_memory_size: Option<usize>,
}

/// One deployed service instance: type and instance deployment under an
/// application-facing instance specifier
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Application-facing name of the instance
    pub instance_specifier: String,
    /// Service type deployment
    pub service: ServiceTypeDeployment,
    /// Service instance deployment
    pub instance: ServiceInstanceDeployment,
}

/// Filesystem roots used by markers, discovery and shared memory.
///
/// Production uses the fixed platform paths; tests relocate the marker and
/// discovery roots into scratch directories.
#[derive(Debug, Clone, Deserialize)]
pub struct PathConfig {
    /// Partial-restart directory holding the marker files
    #[serde(default = "default_partial_restart_root")]
    pub partial_restart_root: PathBuf,
    /// Root of the flag-file discovery tree
    #[serde(default = "default_discovery_root")]
    pub discovery_root: PathBuf,
}

#[cfg(target_os = "nto")]
fn default_partial_restart_root() -> PathBuf {
    PathBuf::from("/tmp_discovery/mw_com_lola")
}

#[cfg(not(target_os = "nto"))]
fn default_partial_restart_root() -> PathBuf {
    PathBuf::from("/tmp/mw_com_lola")
}

fn default_discovery_root() -> PathBuf {
    default_partial_restart_root().join("service_discovery")
}

impl Default for PathConfig {
    fn default() -> Self {
        Self {
            partial_restart_root: default_partial_restart_root(),
            discovery_root: default_discovery_root(),
        }
    }
}

/// Parsed deployment configuration
#[derive(Debug, Clone, Deserialize)]
pub struct Configuration {
    /// Process-global settings
    #[serde(default)]
    pub global: GlobalConfig,
    /// Filesystem roots
    #[serde(default)]
    pub paths: PathConfig,
    /// Deployed service instances
    pub services: Vec<ServiceConfig>,
}

impl Configuration {
    /// Parse a deployment configuration from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns [`ComError::InvalidBindingInformation`] when the file cannot
    /// be read, is not valid JSON, or a service references a binding other
    /// than the shared-memory one.
    pub fn parse<P: AsRef<Path>>(path: P) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            ComError::InvalidBindingInformation(format!(
                "cannot read {}: {e}",
                path.as_ref().display()
            ))
        })?;
        Self::parse_str(&raw)
    }

    /// Parse a deployment configuration from a JSON string
    pub fn parse_str(raw: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(raw)
            .map_err(|e| ComError::InvalidBindingInformation(format!("malformed deployment: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Empty configuration with default globals (mainly for tests and
    /// programmatic assembly)
    #[must_use]
    pub fn empty() -> Self {
        Self {
            global: GlobalConfig::default(),
            paths: PathConfig::default(),
            services: Vec::new(),
        }
    }

    fn validate(&self) -> Result<()> {
        for svc in &self.services {
            if svc.service.binding != BindingType::Lola {
                return Err(ComError::InvalidBindingInformation(format!(
                    "service {} uses binding {:?}; only the shared-memory binding is implemented",
                    svc.instance_specifier, svc.service.binding
                )));
            }
            for (name, _) in svc.service.events.iter().chain(svc.service.fields.iter()) {
                if !svc.instance.events.contains_key(name) {
                    return Err(ComError::InvalidBindingInformation(format!(
                        "element {name} of {} has no instance properties",
                        svc.instance_specifier
                    )));
                }
            }
        }
        Ok(())
    }

    /// Look up a deployed instance by its instance specifier
    #[must_use]
    pub fn find_instance(&self, instance_specifier: &str) -> Option<&ServiceConfig> {
        self.services
            .iter()
            .find(|s| s.instance_specifier == instance_specifier)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEPLOYMENT: &str = r#"{
        "global": { "shm_size_calc_mode": "ESTIMATION" },
        "services": [{
            "instance_specifier": "/demo/radar",
            "service": {
                "service_id": 4660,
                "binding": "LoLa",
                "events": { "position": 1 }
            },
            "instance": {
                "instance_id": 7,
                "asil_level": "ASIL_B",
                "events": {
                    "position": {
                        "number_of_slots": 5,
                        "max_subscribers": 3,
                        "max_samples": 2,
                        "enforce_max_samples": true
                    }
                },
                "allowed_consumer_uids": [1001, 1002],
                "strict_permissions": true
            }
        }]
    }"#;

    #[test]
    fn test_parse_full_deployment() {
        let config = Configuration::parse_str(DEPLOYMENT).expect("parse failed");
        assert_eq!(config.global.shm_size_calc_mode, ShmSizeCalcMode::Estimation);
        assert_eq!(config.global.uid_pid_capacity, DEFAULT_UID_PID_CAPACITY);

        let svc = config.find_instance("/demo/radar").expect("missing instance");
        assert_eq!(svc.service.service_id, 4660);
        assert_eq!(svc.instance.instance_id, 7);
        assert_eq!(svc.instance.asil_level, QualityType::AsilB);
        let ev = &svc.instance.events["position"];
        assert_eq!(ev.number_of_slots, 5);
        assert!(ev.enforce_max_samples);
    }

    #[test]
    fn test_rejects_non_lola_binding() {
        let raw = DEPLOYMENT.replace("\"LoLa\"", "\"SomeIp\"");
        let err = Configuration::parse_str(&raw).unwrap_err();
        assert!(matches!(err, ComError::InvalidBindingInformation(_)));
    }

    #[test]
    fn test_rejects_event_without_instance_properties() {
        let raw = DEPLOYMENT.replace("\"position\": 1", "\"position\": 1, \"velocity\": 2");
        let err = Configuration::parse_str(&raw).unwrap_err();
        assert!(matches!(err, ComError::InvalidBindingInformation(_)));
    }

    #[test]
    fn test_unknown_instance_specifier() {
        let config = Configuration::parse_str(DEPLOYMENT).unwrap();
        assert!(config.find_instance("/not/there").is_none());
    }
}
