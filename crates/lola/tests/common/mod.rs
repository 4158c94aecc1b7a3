// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Shared scaffolding for the end-to-end tests: a deployment with one
//! event ("position", element id 1) over scratch marker/discovery roots
//! and a randomised service id so parallel tests never collide on the
//! global `/dev/shm` namespace.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;

use lola::config::{
    EventInstanceConfig, GlobalConfig, PathConfig, ServiceConfig, ServiceInstanceDeployment,
    ServiceTypeDeployment,
};
use lola::{BindingType, Configuration, QualityType, Runtime, ServiceHandle};

pub const EVENT_NAME: &str = "position";
pub const INSTANCE_SPECIFIER: &str = "/test/instance";

pub struct TestSetup {
    // Declared before `dir`: struct fields drop in declaration order, and
    // the discovery client must remove its flag files while the scratch
    // tree still exists.
    pub runtime: Arc<Runtime>,
    pub config: Configuration,
    // Holds the marker and discovery roots alive for the test's duration.
    pub dir: tempfile::TempDir,
    pub service_id: u16,
    pub instance_id: u16,
}

impl TestSetup {
    pub fn handle(&self, quality: QualityType) -> ServiceHandle {
        ServiceHandle {
            service_id: self.service_id,
            instance_id: self.instance_id,
            quality,
        }
    }

    /// A second runtime over the same deployment, standing in for another
    /// process after a restart.
    pub fn restarted_runtime(&self) -> Arc<Runtime> {
        Runtime::new(self.config.clone()).expect("runtime")
    }
}

pub fn setup(quality: QualityType, number_of_slots: u16) -> TestSetup {
    setup_with_quota(quality, number_of_slots, 10, false)
}

pub fn setup_with_quota(
    quality: QualityType,
    number_of_slots: u16,
    max_samples: u16,
    enforce_max_samples: bool,
) -> TestSetup {
    let dir = tempfile::tempdir().expect("tempdir");
    let service_id = fastrand::u16(1000..);
    let instance_id = 1;

    let mut events = BTreeMap::new();
    events.insert(EVENT_NAME.to_string(), 1u8);
    let mut event_configs = BTreeMap::new();
    event_configs.insert(
        EVENT_NAME.to_string(),
        EventInstanceConfig {
            number_of_slots,
            max_subscribers: 3,
            max_samples,
            enforce_max_samples,
        },
    );

    let config = Configuration {
        global: GlobalConfig::default(),
        paths: PathConfig {
            partial_restart_root: dir.path().join("restart"),
            discovery_root: dir.path().join("sd"),
        },
        services: vec![ServiceConfig {
            instance_specifier: INSTANCE_SPECIFIER.to_string(),
            service: ServiceTypeDeployment {
                service_id,
                binding: BindingType::Lola,
                events,
                fields: BTreeMap::new(),
            },
            instance: ServiceInstanceDeployment {
                instance_id,
                asil_level: quality,
                events: event_configs,
                allowed_consumer_uids: Vec::new(),
                allowed_provider_uids: Vec::new(),
                strict_permissions: false,
                shared_memory_size: None,
            },
        }],
    };

    let runtime = Runtime::new(config.clone()).expect("runtime");
    TestSetup {
        runtime,
        config,
        dir,
        service_id,
        instance_id,
    }
}

/// Poll until the condition holds or the timeout elapses
pub fn wait_for(mut condition: impl FnMut() -> bool, timeout: std::time::Duration) -> bool {
    let deadline = std::time::Instant::now() + timeout;
    while std::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(std::time::Duration::from_millis(20));
    }
    condition()
}
