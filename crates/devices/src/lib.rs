// SPDX-FileCopyrightText: Copyright © 2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! SCSI device discovery
//!
//! Scans the platform device namespaces through a
//! [`transport::TransportBackend`], identifies every device with Inquiry and
//! keeps one [`DeviceRecord`] per logical unit, however many OS paths lead to
//! it.

pub mod config;
pub mod exclude;
pub mod inquiry;
pub mod namespace;
pub mod registry;
pub mod scanner;

mod errors;
pub use errors::*;

pub use config::ScanFilters;
pub use registry::{DeviceIdentity, DeviceRecord, DeviceRegistry, PathRecord, RegisterResult};
pub use scanner::{DeviceLister, Scanner, SystemLister};

/// Scans with the native backend into the process-wide registry
#[cfg(any(target_os = "linux", target_os = "aix", windows))]
pub fn scan(paths: Option<&str>, filters: &ScanFilters) -> Result<Vec<DeviceRecord>, Error> {
    let backend = transport::backend::NativeBackend::new();
    Scanner::new(&backend, DeviceRegistry::global()).scan(paths, filters)
}

/// Forgets every device found so far, so the next scan reflects current hardware
pub fn flush_registry() {
    DeviceRegistry::global()
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
        .flush();
}
