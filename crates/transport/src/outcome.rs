// SPDX-FileCopyrightText: Copyright © 2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Canonical cross-platform command outcome

use core::fmt;
use std::{io, time::Duration};

use crate::{sense::Sense, status, Platform};

/// Decoded result of a command that reached the device
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Completion {
    pub scsi_status: u8,
    pub host_status: u16,
    pub driver_status: u16,
    pub os_error: Option<i32>,
    /// Text for the SCSI status byte
    pub scsi_status_msg: &'static str,
    /// Text for the host or adapter status, where the platform has a table
    pub host_status_msg: Option<String>,
    /// Text for the driver status, where the platform has a table
    pub driver_status_msg: Option<String>,
    /// AIX argument validation reason
    pub einval_msg: Option<&'static str>,
    pub data_length: usize,
    pub data_transferred: usize,
    pub data_resid: u32,
    pub sense_valid: bool,
    pub sense: Vec<u8>,
    /// Data received from the device (empty for writes and no-data commands)
    pub data: Vec<u8>,
    pub duration: Option<Duration>,
}

/// Why a command did not succeed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureKind {
    /// Rejected locally before any native call
    Validation { size: usize, max: usize },
    /// The native call itself failed
    Transport { os_error: Option<i32>, message: String },
    /// The device (or adapter) returned a non-good status
    Device(Box<Completion>),
}

/// One of success, warning (unsupported primitive) or failure
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Success(Box<Completion>),
    Warning(String),
    Failure(FailureKind),
}

/// Bytes moved, never negative and never more than requested
///
/// Some drivers report a residual larger than the request when the CDB
/// allocation length exceeds the buffer. The data still arrives, so such a
/// residual counts the whole buffer as transferred.
pub fn transferred(data_length: usize, data_resid: u32) -> usize {
    let resid = data_resid as usize;
    if resid > data_length {
        data_length
    } else {
        data_length - resid
    }
}

impl Completion {
    /// A completion with nothing transferred, used by reset primitives
    pub fn empty() -> Self {
        Self {
            scsi_status_msg: status::scsi_status(0),
            ..Default::default()
        }
    }

    /// Decoded sense data when the device returned any
    pub fn sense_data(&self) -> Option<Sense> {
        if self.sense_valid {
            Sense::parse(&self.sense)
        } else {
            None
        }
    }

    pub(crate) fn with_platform_messages(mut self, platform: Platform) -> Self {
        let (host, driver) = status::status_messages(platform, self.host_status, self.driver_status);
        self.host_status_msg = host;
        self.driver_status_msg = driver;
        self
    }
}

impl Outcome {
    /// The Warning returned by primitives the platform cannot perform
    pub fn unsupported(operation: &str, platform: Platform) -> Self {
        Outcome::Warning(format!("{operation} is not supported on {platform}"))
    }

    /// A primitive with no data phase that completed
    pub fn done() -> Self {
        Outcome::Success(Box::new(Completion::empty()))
    }

    pub(crate) fn os_failure(err: &io::Error, message: String) -> Self {
        Outcome::Failure(FailureKind::Transport {
            os_error: err.raw_os_error(),
            message,
        })
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success(_))
    }

    pub fn is_warning(&self) -> bool {
        matches!(self, Outcome::Warning(_))
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Outcome::Failure(_))
    }

    /// The device completion, for both successful and device-failed commands
    pub fn completion(&self) -> Option<&Completion> {
        match self {
            Outcome::Success(c) | Outcome::Failure(FailureKind::Device(c)) => Some(c),
            _ => None,
        }
    }

    /// Consumes the outcome, returning the received data of a successful command
    pub fn into_data(self) -> Option<Vec<u8>> {
        match self {
            Outcome::Success(c) => Some(c.data),
            _ => None,
        }
    }

    pub fn os_error(&self) -> Option<i32> {
        match self {
            Outcome::Failure(FailureKind::Transport { os_error, .. }) => *os_error,
            other => other.completion().and_then(|c| c.os_error),
        }
    }

    pub fn host_status(&self) -> u16 {
        self.completion().map(|c| c.host_status).unwrap_or(0)
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Success(c) => write!(f, "success ({} bytes)", c.data_transferred),
            Outcome::Warning(reason) => write!(f, "warning: {reason}"),
            Outcome::Failure(FailureKind::Validation { size, max }) => {
                write!(f, "CDB size of {size} is too large for max OS CDB of {max}")
            }
            Outcome::Failure(FailureKind::Transport { message, .. }) => f.write_str(message),
            Outcome::Failure(FailureKind::Device(c)) => {
                write!(f, "SCSI status = {:#x} ({})", c.scsi_status, c.scsi_status_msg)?;
                if let Some(host) = &c.host_status_msg {
                    write!(f, ", host status = {:#x} ({host})", c.host_status)?;
                }
                if let Some(driver) = &c.driver_status_msg {
                    write!(f, ", driver status = {:#x} ({driver})", c.driver_status)?;
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn test_transferred_clamps_residual() {
        assert_eq!(transferred(512, 0), 512);
        assert_eq!(transferred(512, 12), 500);
        assert_eq!(transferred(512, 512), 0);
        // CDB allocation length larger than the buffer
        assert_eq!(transferred(36, 220), 36);
        assert_eq!(transferred(0, 4), 0);
    }

    #[test]
    fn test_unsupported_is_warning() {
        let outcome = Outcome::unsupported("reset bus", Platform::Windows);
        assert!(outcome.is_warning());
        assert_eq!(outcome.to_string(), "warning: reset bus is not supported on Windows");
        assert_eq!(outcome.os_error(), None);
    }
}
