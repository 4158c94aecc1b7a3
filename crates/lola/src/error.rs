// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Error types surfaced by the transport core.
//!
//! Recoverable failures are reported as [`ComError`] values; invariant
//! violations (null shared-memory root, missing control block for a
//! registered element, inotify queue overflow, discovery tampering) abort
//! the process instead of unwinding into callers.

use std::fmt;
use std::io;

/// Errors that can occur in transport core operations
#[derive(Debug)]
pub enum ComError {
    /// Generic unrecoverable failure in the core path (SHM create/open,
    /// rollback, or flock acquisition failed where it should have succeeded)
    BindingFailure(String),

    /// Discovery flag file could not be created
    ServiceNotOffered(String),

    /// Proxy-event operation invoked without a prior subscribe
    NotSubscribed,

    /// Slot allocator exhausted its bounded retries
    SampleAllocationFailure,

    /// Shared-memory segment creation failed
    ErroneousFileHandle(io::Error),

    /// A field was offered without an initial value
    FieldValueIsNotValid,

    /// Deployment configuration is missing the required binding variant
    InvalidBindingInformation(String),
}

impl fmt::Display for ComError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BindingFailure(msg) => write!(f, "Binding failure: {msg}"),
            Self::ServiceNotOffered(msg) => write!(f, "Service could not be offered: {msg}"),
            Self::NotSubscribed => write!(f, "Operation requires an active subscription"),
            Self::SampleAllocationFailure => {
                write!(f, "Sample slot allocation exhausted its retries")
            }
            Self::ErroneousFileHandle(e) => {
                write!(f, "Shared-memory segment operation failed: {e}")
            }
            Self::FieldValueIsNotValid => write!(f, "Field offered without an initial value"),
            Self::InvalidBindingInformation(msg) => {
                write!(f, "Invalid binding information in deployment: {msg}")
            }
        }
    }
}

impl std::error::Error for ComError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::ErroneousFileHandle(e) => Some(e),
            _ => None,
        }
    }
}

/// Result type for transport core operations
pub type Result<T> = std::result::Result<T, ComError>;
