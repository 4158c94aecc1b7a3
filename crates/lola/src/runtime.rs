// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Process-wide context: identity, configuration, discovery and messaging.
//!
//! The runtime is an explicit value constructed once at program start and
//! passed by reference into skeleton and proxy constructors. A thin global
//! accessor exists for call sites that cannot thread the reference; it
//! panics when used before initialisation instead of lazily constructing
//! anything.

use std::sync::{Arc, OnceLock};

use crate::config::Configuration;
use crate::discovery::client::ServiceDiscoveryClient;
use crate::error::Result;
use crate::types::{ElementFqId, QualityType};

/// Notification channel towards the skeleton-side messaging layer.
///
/// The transport core only emits the two notifications below; delivering
/// them (message queues, signals, ...) is the messaging layer's concern.
pub trait MessagePassingService: Send + Sync {
    /// A sample was published for the given element
    fn notify_event(&self, fq_id: ElementFqId);

    /// A restarted proxy found a stale pid registered for its uid; the
    /// provider should drop messaging artefacts of `outdated_pid`.
    fn notify_outdated_node_id(&self, quality: QualityType, outdated_pid: i32, provider_pid: i32);
}

/// Default messaging sink that only logs the notifications
pub struct LoggingMessagePassing;

impl MessagePassingService for LoggingMessagePassing {
    fn notify_event(&self, fq_id: ElementFqId) {
        log::trace!("[MSG] event published: {fq_id}");
    }

    fn notify_outdated_node_id(&self, quality: QualityType, outdated_pid: i32, provider_pid: i32) {
        log::debug!(
            "[MSG] outdated node id {outdated_pid} ({quality:?}) reported to provider {provider_pid}"
        );
    }
}

/// Process-wide context handed to skeletons and proxies
pub struct Runtime {
    config: Configuration,
    uid: u32,
    pid: i32,
    discovery: Arc<ServiceDiscoveryClient>,
    messaging: Arc<dyn MessagePassingService>,
}

static GLOBAL_RUNTIME: OnceLock<Arc<Runtime>> = OnceLock::new();

impl Runtime {
    /// Build a runtime with the default (logging) messaging sink
    pub fn new(config: Configuration) -> Result<Arc<Self>> {
        Self::with_messaging(config, Arc::new(LoggingMessagePassing))
    }

    /// Build a runtime with a custom messaging layer
    pub fn with_messaging(
        config: Configuration,
        messaging: Arc<dyn MessagePassingService>,
    ) -> Result<Arc<Self>> {
        let discovery = ServiceDiscoveryClient::start(config.paths.discovery_root.clone())?;
        // SAFETY: getuid never fails.
        let uid = unsafe { libc::getuid() } as u32;
        Ok(Arc::new(Self {
            config,
            uid,
            pid: std::process::id() as i32,
            discovery,
            messaging,
        }))
    }

    /// Publish a runtime as the process-wide instance. Panics when called
    /// twice.
    pub fn initialize(runtime: Arc<Self>) {
        assert!(
            GLOBAL_RUNTIME.set(runtime).is_ok(),
            "runtime already initialised"
        );
    }

    /// The process-wide runtime. Panics when [`Runtime::initialize`] has
    /// not run yet.
    #[must_use]
    pub fn global() -> Arc<Self> {
        GLOBAL_RUNTIME
            .get()
            .expect("runtime accessed before initialisation")
            .clone()
    }

    /// Parsed deployment configuration
    #[must_use]
    pub fn config(&self) -> &Configuration {
        &self.config
    }

    /// Uid of this process
    #[must_use]
    pub fn uid(&self) -> u32 {
        self.uid
    }

    /// Pid of this process
    #[must_use]
    pub fn pid(&self) -> i32 {
        self.pid
    }

    /// The service-discovery client of this process
    #[must_use]
    pub fn discovery(&self) -> &Arc<ServiceDiscoveryClient> {
        &self.discovery
    }

    /// The messaging layer of this process
    #[must_use]
    pub fn messaging(&self) -> &Arc<dyn MessagePassingService> {
        &self.messaging
    }
}
