// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Flag-file based service discovery.
//!
//! Offers are advertised as empty flag files in a filesystem tree; finders
//! enumerate the tree once and then follow inotify events. There is no
//! broker and no protocol: existence of a correctly named file *is* the
//! offer.

pub mod client;
pub mod crawler;
pub mod flag_file;
pub mod inotify;

pub use client::{
    FindServiceHandle, FindServiceHandler, QualityTypeSelector, ServiceDiscoveryClient,
};
pub use crawler::{FlagFileCrawler, KnownInstancesContainer};
pub use flag_file::{Disambiguator, FlagFile};
pub use inotify::{Inotify, InotifyEvent, WatchDescriptor};
