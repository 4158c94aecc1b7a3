// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Shared-memory plumbing: segments, the offset arena, root objects,
//! deterministic paths and the marker-file flock protocol.

pub mod arena;
pub mod flock;
pub mod path;
pub mod segment;
pub mod service_data;

pub use arena::{Arena, ShmSlice};
pub use flock::{FlockGuard, FlockKind, LockFile};
pub use path::{PartialRestartPathBuilder, ShmPathBuilder};
pub use segment::ShmSegment;
pub use service_data::{
    EventDataStorage, EventMetaInfo, SampleLayout, ServiceDataControl, ServiceDataStorage,
};
