// SPDX-FileCopyrightText: Copyright © 2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Platform pass-through backends
//!
//! Each backend translates a [`CommandDescriptor`] into the native request
//! of its operating system. Request building and result decoding are plain
//! functions compiled everywhere; only the ioctl itself is gated on the
//! target.

use std::{
    io,
    path::{Path, PathBuf},
};

use log::{debug, error, trace};
use serde::Serialize;

use crate::{status, CommandDescriptor, Error, FailureKind, NativeResult, Outcome, Platform};

pub mod aix;
pub mod linux;
pub mod windows;

#[cfg(target_os = "linux")]
pub use linux::SgBackend as NativeBackend;

#[cfg(target_os = "aix")]
pub use aix::PassthruBackend as NativeBackend;

#[cfg(windows)]
pub use windows::SptdBackend as NativeBackend;

/// SCSI address of one path to a logical unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct Nexus {
    pub bus: u32,
    pub channel: u32,
    pub target: u32,
    pub lun: u64,
}

/// How a device is opened
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Read-write for command execution, falling back to read-only once
    #[default]
    ReadWrite,
    /// Read-only and non-blocking, used while scanning
    Scan,
}

/// An open device
pub trait DeviceHandle {
    /// Path the device was opened with
    fn path(&self) -> &Path;

    /// The generic pass-through alias of a block device, if known
    fn scsi_path(&self) -> Option<&Path> {
        None
    }
}

/// A platform pass-through implementation
pub trait TransportBackend {
    type Handle: DeviceHandle;

    fn platform(&self) -> Platform;

    /// Opens a device; a read-only medium falls back to read-only once
    fn open(&self, path: &Path, mode: OpenMode) -> Result<Self::Handle, Error>;

    /// Releases a handle
    fn close(&self, handle: Self::Handle) {
        debug!("closing {}", handle.path().display());
        drop(handle);
    }

    /// Issues one native request and returns its raw fields
    fn submit(&self, handle: &mut Self::Handle, cmd: &CommandDescriptor) -> Result<NativeResult, Error>;

    /// Issues a command and normalizes the result
    fn execute(&self, handle: &mut Self::Handle, cmd: &CommandDescriptor) -> Outcome {
        trace!("{} to {}: cdb {:02x?}", cmd.cdb_name(), handle.path().display(), cmd.cdb());
        match self.submit(handle, cmd) {
            Ok(native) => status::normalize(self.platform(), cmd, native),
            Err(Error::CdbTooLarge { size, max }) => {
                debug!("{}: CDB size of {size} is too large for max OS CDB of {max}", cmd.cdb_name());
                Outcome::Failure(FailureKind::Validation { size, max })
            }
            Err(err) => {
                if cmd.logs_errors() {
                    error!("{} failed on {}: {err}", cmd.cdb_name(), handle.path().display());
                }
                Outcome::Failure(FailureKind::Transport {
                    os_error: err.os_error(),
                    message: err.to_string(),
                })
            }
        }
    }

    fn reset_bus(&self, handle: &mut Self::Handle) -> Outcome;

    fn reset_controller(&self, handle: &mut Self::Handle) -> Outcome;

    fn reset_target(&self, handle: &mut Self::Handle) -> Outcome;

    fn reset_lun(&self, handle: &mut Self::Handle) -> Outcome;

    fn abort_task_set(&self, handle: &mut Self::Handle) -> Outcome;

    /// The nexus of an open device, where the platform can report one
    fn scsi_address(&self, _handle: &Self::Handle) -> Option<Nexus> {
        None
    }

    /// Issues block I/O to make a multipath driver switch paths
    fn force_failover(&self, _handle: &Self::Handle) -> io::Result<()> {
        Ok(())
    }
}

/// Outcome of a reset ioctl that returned no SCSI status
pub(crate) fn control_outcome(operation: &str, device: &Path, result: io::Result<()>) -> Outcome {
    match result {
        Ok(()) => {
            debug!("{operation} on {} completed", device.display());
            Outcome::done()
        }
        Err(err) => Outcome::os_failure(&err, format!("{operation} failed on {}: {err}", device.display())),
    }
}

/// Path used for diagnostics, preferring the pass-through alias
pub(crate) fn display_path<H: DeviceHandle>(handle: &H) -> PathBuf {
    handle.scsi_path().unwrap_or_else(|| handle.path()).to_path_buf()
}
