// SPDX-FileCopyrightText: Copyright © 2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Raw outcome of one native pass-through call

use std::time::Duration;

use bitflags::bitflags;

bitflags! {
    /// Which status fields the native layer marked as authoritative
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
    pub struct StatusValidity: u8 {
        /// The SCSI status byte holds an error
        const SCSI_ERROR = 0x01;
        /// The adapter (host) status holds an error
        const ADAPTER_ERROR = 0x02;
    }
}

/// Fields captured from the native request after the call returns
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct NativeResult {
    /// Return code of the ioctl itself
    pub ioctl_status: i32,
    /// errno (or GetLastError) when the ioctl failed
    pub os_error: Option<i32>,
    pub scsi_status: u8,
    /// Host (Linux) or adapter (AIX) status
    pub host_status: u16,
    pub driver_status: u16,
    pub status_validity: StatusValidity,
    /// Bytes requested but not transferred, as reported by the driver
    pub data_resid: u32,
    /// Sense bytes actually written
    pub sense: Vec<u8>,
    /// The transfer buffer after the call
    pub data: Vec<u8>,
    pub duration: Option<Duration>,
    /// AIX argument validation reason (`einval_arg`)
    pub einval_reason: Option<u32>,
}
