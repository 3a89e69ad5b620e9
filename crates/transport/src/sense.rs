// SPDX-FileCopyrightText: Copyright © 2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Sense data decoding

use core::fmt;

pub const NO_SENSE: u8 = 0x00;
pub const RECOVERED_ERROR: u8 = 0x01;
pub const NOT_READY: u8 = 0x02;
pub const MEDIUM_ERROR: u8 = 0x03;
pub const HARDWARE_ERROR: u8 = 0x04;
pub const ILLEGAL_REQUEST: u8 = 0x05;
pub const UNIT_ATTENTION: u8 = 0x06;
pub const DATA_PROTECT: u8 = 0x07;
pub const COPY_ABORTED: u8 = 0x0a;
pub const ABORTED_COMMAND: u8 = 0x0b;

static SENSE_KEYS: phf::Map<u8, &'static str> = phf::phf_map! {
    0x00u8 => "NO SENSE",
    0x01u8 => "RECOVERED ERROR",
    0x02u8 => "NOT READY",
    0x03u8 => "MEDIUM ERROR",
    0x04u8 => "HARDWARE ERROR",
    0x05u8 => "ILLEGAL REQUEST",
    0x06u8 => "UNIT ATTENTION",
    0x07u8 => "DATA PROTECT",
    0x08u8 => "BLANK CHECK",
    0x09u8 => "VENDOR SPECIFIC",
    0x0au8 => "COPY ABORTED",
    0x0bu8 => "ABORTED COMMAND",
    0x0du8 => "VOLUME OVERFLOW",
    0x0eu8 => "MISCOMPARE",
    0x0fu8 => "COMPLETED",
};

/// Sense key and additional sense code from fixed or descriptor format sense
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sense {
    pub response_code: u8,
    pub key: u8,
    pub asc: u8,
    pub ascq: u8,
}

impl Sense {
    /// Decodes the leading bytes of a sense buffer
    ///
    /// Returns `None` for empty buffers, unknown response codes and
    /// buffers too short to hold the additional sense code.
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        let response_code = *bytes.first()? & 0x7f;
        match response_code {
            0x70 | 0x71 => {
                if bytes.len() < 14 {
                    return None;
                }
                Some(Self {
                    response_code,
                    key: bytes[2] & 0x0f,
                    asc: bytes[12],
                    ascq: bytes[13],
                })
            }
            0x72 | 0x73 => {
                if bytes.len() < 4 {
                    return None;
                }
                Some(Self {
                    response_code,
                    key: bytes[1] & 0x0f,
                    asc: bytes[2],
                    ascq: bytes[3],
                })
            }
            _ => None,
        }
    }

    /// Deferred errors belong to an earlier command
    pub fn is_deferred(&self) -> bool {
        matches!(self.response_code, 0x71 | 0x73)
    }

    pub fn key_name(&self) -> &'static str {
        SENSE_KEYS.get(&self.key).copied().unwrap_or("RESERVED")
    }
}

impl fmt::Display for Sense {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "sense key = {:#x} ({}), asc = {:#04x}, ascq = {:#04x}",
            self.key,
            self.key_name(),
            self.asc,
            self.ascq
        )
    }
}
