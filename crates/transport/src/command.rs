// SPDX-FileCopyrightText: Copyright © 2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Canonical SCSI request description

use std::time::Duration;

use bitflags::bitflags;

/// Default per-command timeout
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Default sense buffer length (the largest `mx_sb_len` SG_IO accepts)
pub const DEFAULT_SENSE_LENGTH: usize = 255;

/// Direction of the data phase
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum DataDirection {
    /// No data phase
    #[default]
    None,
    /// Data flows from the device
    Read,
    /// Data flows to the device
    Write,
}

/// Queue tag message, using the AIX `q_tag_msg` encoding
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum QueueTag {
    NoTag = 0,
    #[default]
    Simple = 1,
    HeadOfQueue = 2,
    Ordered = 3,
    Aca = 4,
}

bitflags! {
    /// Transport modifiers for a single request
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
    pub struct TransportFlags: u32 {
        /// Asynchronous transfer negotiation
        const ASYNC = 1 << 0;
        /// Disallow disconnects during the command
        const NO_DISCONNECT = 1 << 1;
        /// Ask for direct I/O instead of bounce buffers
        const DIRECT_IO = 1 << 2;
        /// Issue through the parent adapter rather than the disk driver
        const ADAPTER = 1 << 3;
    }
}

/// An immutable SCSI request
///
/// Built once per command with the builder methods:
///
/// ```
/// use transport::CommandDescriptor;
///
/// let inquiry = CommandDescriptor::new([0x12, 0, 0, 0, 36, 0]).read(36).name("Inquiry");
/// assert_eq!(inquiry.data_length(), 36);
/// ```
#[derive(Debug, Clone)]
pub struct CommandDescriptor {
    cdb: Vec<u8>,
    name: &'static str,
    direction: DataDirection,
    data_length: usize,
    data: Vec<u8>,
    sense_length: usize,
    timeout: Duration,
    queue_tag: QueueTag,
    flags: TransportFlags,
    path_id: Option<u32>,
    errlog: bool,
}

impl CommandDescriptor {
    /// Creates a request with no data phase
    pub fn new(cdb: impl Into<Vec<u8>>) -> Self {
        Self {
            cdb: cdb.into(),
            name: "SCSI Command",
            direction: DataDirection::None,
            data_length: 0,
            data: Vec::new(),
            sense_length: DEFAULT_SENSE_LENGTH,
            timeout: DEFAULT_TIMEOUT,
            queue_tag: QueueTag::default(),
            flags: TransportFlags::empty(),
            path_id: None,
            errlog: true,
        }
    }

    /// Read `length` bytes from the device
    pub fn read(mut self, length: usize) -> Self {
        self.direction = DataDirection::Read;
        self.data_length = length;
        self.data.clear();
        self
    }

    /// Write `data` to the device
    pub fn write(mut self, data: impl Into<Vec<u8>>) -> Self {
        self.direction = DataDirection::Write;
        self.data = data.into();
        self.data_length = self.data.len();
        self
    }

    pub fn name(mut self, name: &'static str) -> Self {
        self.name = name;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn sense_length(mut self, length: usize) -> Self {
        self.sense_length = length;
        self
    }

    pub fn queue_tag(mut self, tag: QueueTag) -> Self {
        self.queue_tag = tag;
        self
    }

    pub fn flags(mut self, flags: TransportFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Route the request down one MPIO path
    pub fn path_id(mut self, path_id: u32) -> Self {
        self.path_id = Some(path_id);
        self
    }

    /// Controls whether device-level failures are logged as errors
    pub fn errlog(mut self, errlog: bool) -> Self {
        self.errlog = errlog;
        self
    }

    pub fn cdb(&self) -> &[u8] {
        &self.cdb
    }

    pub fn cdb_name(&self) -> &'static str {
        self.name
    }

    pub fn direction(&self) -> DataDirection {
        self.direction
    }

    pub fn data_length(&self) -> usize {
        self.data_length
    }

    /// Outgoing data for a write request
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn requested_sense_length(&self) -> usize {
        self.sense_length
    }

    pub fn timeout_value(&self) -> Duration {
        self.timeout
    }

    pub fn tag(&self) -> QueueTag {
        self.queue_tag
    }

    pub fn transport_flags(&self) -> TransportFlags {
        self.flags
    }

    pub fn mpio_path(&self) -> Option<u32> {
        self.path_id
    }

    pub fn logs_errors(&self) -> bool {
        self.errlog
    }

    /// A fresh transfer buffer for the native call
    ///
    /// Reads get a zeroed buffer of the requested length, writes a copy of the payload.
    pub(crate) fn transfer_buffer(&self) -> Vec<u8> {
        match self.direction {
            DataDirection::Write => self.data.clone(),
            _ => vec![0; self.data_length],
        }
    }

    /// Rejects CDBs the platform request cannot carry
    pub(crate) fn check_cdb(&self, max: usize) -> Result<(), crate::Error> {
        if self.cdb.len() > max {
            return Err(crate::Error::CdbTooLarge {
                size: self.cdb.len(),
                max,
            });
        }
        Ok(())
    }
}
