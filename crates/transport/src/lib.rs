// SPDX-FileCopyrightText: Copyright © 2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! SCSI pass-through transport
//!
//! One canonical [`CommandDescriptor`] is translated into the native
//! pass-through call of the host operating system, and the native result is
//! normalized into a single [`Outcome`].

use std::{io, path::PathBuf};

use thiserror::Error;

pub mod backend;
pub mod command;
pub mod mock;
pub mod outcome;
mod platform;
pub mod result;
pub mod retry;
pub mod sense;
pub mod session;
pub mod status;

pub use backend::{DeviceHandle, Nexus, OpenMode, TransportBackend};
pub use command::{CommandDescriptor, DataDirection, QueueTag, TransportFlags};
pub use outcome::{Completion, FailureKind, Outcome};
pub use platform::Platform;
pub use result::{NativeResult, StatusValidity};
pub use retry::RetryClassifier;

/// Errors raised by the transport before or instead of a device result
#[derive(Debug, Error)]
pub enum Error {
    /// IO operation error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// The device could not be opened
    #[error("open() of {path:?} failed: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The CDB does not fit the native request
    #[error("CDB size of {size} is too large for max OS CDB of {max}")]
    CdbTooLarge { size: usize, max: usize },

    /// The native call failed and no device status was returned
    #[error("{operation} failed on {device}: {source}")]
    Transport {
        operation: &'static str,
        device: String,
        #[source]
        source: io::Error,
    },

    /// The platform device configuration could not be resolved
    #[error("device configuration lookup failed for {device}: {reason}")]
    Lookup { device: String, reason: String },

    /// An adapter session control call failed
    #[error("{operation} failed on adapter {adapter}: {source}")]
    Adapter {
        operation: &'static str,
        adapter: String,
        #[source]
        source: io::Error,
    },
}

impl Error {
    /// The operating system error number carried by this error, if any
    pub fn os_error(&self) -> Option<i32> {
        match self {
            Error::Io(e) => e.raw_os_error(),
            Error::Open { source, .. } | Error::Transport { source, .. } | Error::Adapter { source, .. } => {
                source.raw_os_error()
            }
            _ => None,
        }
    }
}
