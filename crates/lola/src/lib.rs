// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! # LoLa - zero-copy shared-memory publish/subscribe
//!
//! A safety-aware inter-process transport: a *skeleton* (producer)
//! publishes typed event samples into shared-memory slots; one or more
//! *proxies* (consumers) read those slots without copying the payload.
//! The transport survives partial restart of either side and keeps
//! safety-qualified (ASIL-B) consumers isolated from misbehaving
//! quality-managed (QM) consumers.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use lola::{Configuration, ElementSpec, Proxy, Runtime, Skeleton};
//!
//! fn main() -> lola::Result<()> {
//!     let runtime = Runtime::new(Configuration::parse("deployment.json")?)?;
//!
//!     // Provider side
//!     let mut skeleton = Skeleton::create(&runtime, "/demo/radar")?;
//!     skeleton.prepare_offer(&[ElementSpec::event::<u64>("position")])?;
//!     let publisher = skeleton.register_event::<u64>("position")?;
//!     skeleton.finalize_offer()?;
//!     publisher.send_value(42)?;
//!
//!     // Consumer side (usually another process)
//!     let handles = runtime.discovery().find_service(
//!         lola::EnrichedInstanceIdentifier::any_instance(4660, lola::QualityType::AsilQm),
//!     )?;
//!     let proxy = Proxy::create(&runtime, &handles[0])?;
//!     let mut event = proxy.event::<u64>("position")?;
//!     event.subscribe()?;
//!     if let Some(sample) = event.receive_next(0)? {
//!         println!("received {}", *sample);
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! +--------------------+                      +--------------------+
//! |  Skeleton process  |    shared memory     |   Proxy process    |
//! |  EventPublisher ---+--> data segment  <---+--- ProxyEvent      |
//! |        |           |    control segment   |        |           |
//! |        +-----------+--> slot words,   <---+--------+           |
//! |                    |    transaction logs  |                    |
//! +---------+----------+                      +---------+----------+
//!           |            flag files + inotify           |
//!           +------------> discovery tree <-------------+
//! ```
//!
//! - The **control segment** holds one lock-free control block per event:
//!   slot status words, per-subscriber transaction logs and the uid→pid
//!   table. Dual-quality instances carry a second control segment for
//!   ASIL-B.
//! - The **data segment** holds the fixed-layout payload arrays; access
//!   is gated by the slot protocol, never copied.
//! - **Marker files** with `flock` semantics make crashes observable:
//!   rollback erases a dead party's slot references from its transaction
//!   log.
//! - **Discovery** is the existence of flag files in a watched tree; no
//!   broker involved.

pub mod config;
pub mod control;
pub mod discovery;
pub mod error;
pub mod proxy;
pub mod runtime;
pub mod shm;
pub mod skeleton;
pub mod types;

pub use config::{Configuration, ShmSizeCalcMode};
pub use control::{
    EventDataControl, EventDataControlComposite, EventSlotStatus, EventTimestamp, SlotIndex,
};
pub use discovery::{FindServiceHandle, QualityTypeSelector, ServiceDiscoveryClient};
pub use error::{ComError, Result};
pub use proxy::{Proxy, ProxyEvent, Sample};
pub use runtime::{LoggingMessagePassing, MessagePassingService, Runtime};
pub use shm::{EventMetaInfo, SampleLayout};
pub use skeleton::{ElementSpec, EventPublisher, SampleWriter, Skeleton};
pub use types::{
    BindingType, ElementFqId, ElementType, EnrichedInstanceIdentifier, QualityType, ServiceHandle,
};
