// SPDX-FileCopyrightText: Copyright © 2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

use core::fmt;

use serde::Serialize;

/// Host operating system family whose pass-through semantics apply
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Platform {
    /// Linux SCSI generic (SG_IO)
    Linux,
    /// AIX DK_PASSTHRU and adapter sessions
    Aix,
    /// Windows IOCTL_SCSI_PASS_THROUGH_DIRECT
    Windows,
    /// HP-UX, scan tables only
    HpUx,
}

impl Platform {
    /// The platform this crate was built for
    pub const fn current() -> Self {
        if cfg!(target_os = "aix") {
            Platform::Aix
        } else if cfg!(windows) {
            Platform::Windows
        } else {
            Platform::Linux
        }
    }

    /// Largest CDB the native request structure can carry
    pub const fn max_cdb_length(&self) -> usize {
        16
    }

    /// Whether one LUN is legitimately visible under several OS names
    pub const fn multipath(&self) -> bool {
        matches!(self, Platform::Linux)
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Platform::Linux => f.write_str("Linux"),
            Platform::Aix => f.write_str("AIX"),
            Platform::Windows => f.write_str("Windows"),
            Platform::HpUx => f.write_str("HP-UX"),
        }
    }
}
