// SPDX-FileCopyrightText: Copyright © 2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Inquiry decoding
//!
//! Only what device identity needs: the standard Inquiry fields, the unit
//! serial number page (0x80), the device identification page (0x83) and the
//! firmware revision of ATA drives behind a SAT layer.

use std::fmt::Write;

use serde::Serialize;
use transport::CommandDescriptor;
use zerocopy::*;

pub const INQUIRY_OPCODE: u8 = 0x12;
pub const ATA_PASS_THROUGH_16: u8 = 0x85;
pub const ATA_IDENTIFY_DEVICE: u8 = 0xec;

/// Standard Inquiry allocation length
pub const INQUIRY_LENGTH: usize = 255;
pub const IDENTIFY_LENGTH: usize = 512;

pub const SERIAL_NUMBER_PAGE: u8 = 0x80;
pub const DEVICE_ID_PAGE: u8 = 0x83;

pub const DTYPE_DIRECT: u8 = 0x00;
pub const DTYPE_UNKNOWN: u8 = 0x1f;

// Firmware revision: words 23..26 of IDENTIFY DEVICE data
const IDENTIFY_FW_OFFSET: usize = 46;
const IDENTIFY_FW_LENGTH: usize = 8;

const CODE_SET_BINARY: u8 = 0x1;
const CODE_SET_ASCII: u8 = 0x2;

const ID_TYPE_T10_VENDOR: u8 = 0x1;
const ID_TYPE_EUI64: u8 = 0x2;
const ID_TYPE_NAA: u8 = 0x3;

const ASSOC_LOGICAL_UNIT: u8 = 0x0;
const ASSOC_TARGET_PORT: u8 = 0x1;

static DEVICE_TYPES: phf::Map<u8, &'static str> = phf::phf_map! {
    0x00u8 => "Direct Access",
    0x01u8 => "Sequential Access",
    0x02u8 => "Printer",
    0x03u8 => "Processor",
    0x04u8 => "Write-Once/Read-Many",
    0x05u8 => "CD/DVD",
    0x06u8 => "Scanner",
    0x07u8 => "Optical Memory",
    0x08u8 => "Medium Changer",
    0x09u8 => "Communications",
    0x0cu8 => "Array Controller",
    0x0du8 => "Enclosure Services",
    0x0eu8 => "Simplified Direct Access",
    0x0fu8 => "Optical Card",
    0x11u8 => "Object Storage",
    0x12u8 => "Automation/Drive Interface",
    0x14u8 => "Host Managed Zoned Block",
    0x1eu8 => "Well Known Logical Unit",
    0x1fu8 => "not present",
};

/// Short device type names accepted in scan filters
static DEVICE_TYPE_CODES: phf::Map<&'static str, u8> = phf::phf_map! {
    "direct" => 0x00,
    "sequential" => 0x01,
    "printer" => 0x02,
    "processor" => 0x03,
    "worm" => 0x04,
    "multimedia" => 0x05,
    "scanner" => 0x06,
    "optical" => 0x07,
    "changer" => 0x08,
    "communications" => 0x09,
    "raid" => 0x0c,
    "enclosure" => 0x0d,
    "simplified" => 0x0e,
    "optical-card" => 0x0f,
    "object" => 0x11,
    "automation" => 0x12,
    "zoned" => 0x14,
    "wlun" => 0x1e,
    "unknown" => 0x1f,
};

/// Descriptive name of a peripheral device type
pub fn device_type_name(code: u8) -> &'static str {
    DEVICE_TYPES.get(&code).copied().unwrap_or("Unknown")
}

/// Device type code for a filter name, or a hex code such as `0x0d`
pub fn device_type_code(name: &str) -> Option<u8> {
    let name = name.trim();
    if let Some(code) = DEVICE_TYPE_CODES.get(name.to_ascii_lowercase().as_str()) {
        return Some(*code);
    }
    let hex = name.strip_prefix("0x").or_else(|| name.strip_prefix("0X")).unwrap_or(name);
    u8::from_str_radix(hex, 16).ok()
}

/// Inquiry CDB, for the standard data when `page` is `None`
pub fn inquiry_cdb(page: Option<u8>, length: usize) -> [u8; 6] {
    let length = length.min(u16::MAX as usize) as u16;
    let [hi, lo] = length.to_be_bytes();
    match page {
        Some(page) => [INQUIRY_OPCODE, 0x01, page, hi, lo, 0],
        None => [INQUIRY_OPCODE, 0x00, 0x00, hi, lo, 0],
    }
}

pub fn inquiry_command(page: Option<u8>) -> CommandDescriptor {
    CommandDescriptor::new(inquiry_cdb(page, INQUIRY_LENGTH))
        .read(INQUIRY_LENGTH)
        .name("Inquiry")
}

/// ATA PASS-THROUGH(16) carrying IDENTIFY DEVICE
///
/// PIO data-in, transfer length in the sector count field, counted in blocks,
/// from the device.
pub fn ata_identify_cdb() -> [u8; 16] {
    let mut cdb = [0u8; 16];
    cdb[0] = ATA_PASS_THROUGH_16;
    cdb[1] = 0x04 << 1;
    cdb[2] = 0x02 | 0x04 | 0x08;
    cdb[6] = 1;
    cdb[14] = ATA_IDENTIFY_DEVICE;
    cdb
}

pub fn ata_identify_command() -> CommandDescriptor {
    CommandDescriptor::new(ata_identify_cdb())
        .read(IDENTIFY_LENGTH)
        .name("ATA Identify")
}

#[repr(C)]
#[derive(FromBytes, Unaligned, Debug)]
struct RawInquiry {
    peripheral: u8,
    _removable: u8,
    _version: u8,
    _response_format: u8,
    _additional_length: u8,
    _flags: [u8; 3],
    vendor: [u8; 8],
    product: [u8; 16],
    revision: [u8; 4],
}

#[repr(C)]
#[derive(FromBytes, Unaligned, Debug)]
struct VpdHeader {
    peripheral: u8,
    page_code: u8,
    page_length: U16<BigEndian>,
}

#[repr(C)]
#[derive(FromBytes, Unaligned, Debug)]
struct IdentDescriptor {
    protocol_code_set: u8,
    association_type: u8,
    _reserved: u8,
    length: u8,
}

impl IdentDescriptor {
    fn code_set(&self) -> u8 {
        self.protocol_code_set & 0x0f
    }

    fn association(&self) -> u8 {
        (self.association_type >> 4) & 0x03
    }

    fn ident_type(&self) -> u8 {
        self.association_type & 0x0f
    }
}

/// Fields of the standard Inquiry data
///
/// Vendor, product and revision are kept as returned, padding included.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StandardInquiry {
    pub qualifier: u8,
    pub device_type: u8,
    pub vendor: String,
    pub product: String,
    pub revision: String,
}

fn ascii(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

fn hex_identifier(bytes: &[u8]) -> String {
    bytes.iter().fold(String::from("0x"), |mut out, b| {
        let _ = write!(out, "{b:02x}");
        out
    })
}

impl StandardInquiry {
    /// Decodes at least 36 bytes of standard Inquiry data
    pub fn parse(data: &[u8]) -> Option<Self> {
        let (raw, _) = RawInquiry::read_from_prefix(data).ok()?;
        Some(Self {
            qualifier: raw.peripheral >> 5,
            device_type: raw.peripheral & 0x1f,
            vendor: ascii(&raw.vendor),
            product: ascii(&raw.product),
            revision: ascii(&raw.revision),
        })
    }

    pub fn device_type_name(&self) -> &'static str {
        device_type_name(self.device_type)
    }

    /// Directly attached ATA drives report "ATA" as the vendor
    pub fn is_ata(&self) -> bool {
        self.device_type == DTYPE_DIRECT && self.vendor.starts_with("ATA")
    }
}

/// A verified vital product data page
#[derive(Debug)]
pub struct VpdPage<'a> {
    pub code: u8,
    payload: &'a [u8],
}

impl<'a> VpdPage<'a> {
    /// Checks the page header against the requested page and the standard Inquiry
    ///
    /// A page is rejected when its length is zero, its page code differs
    /// from the one requested, or its device type differs from the standard
    /// Inquiry data.
    pub fn parse(data: &'a [u8], page: u8, inquiry: &StandardInquiry) -> Option<Self> {
        let (header, rest) = VpdHeader::read_from_prefix(data).ok()?;
        let length = header.page_length.get() as usize;
        if length == 0 || header.page_code != page || header.peripheral & 0x1f != inquiry.device_type {
            return None;
        }
        Some(Self {
            code: page,
            payload: &rest[..length.min(rest.len())],
        })
    }

    pub fn payload(&self) -> &'a [u8] {
        self.payload
    }

    fn descriptors(&self) -> Descriptors<'a> {
        Descriptors { rest: self.payload }
    }
}

struct Descriptors<'a> {
    rest: &'a [u8],
}

impl<'a> Iterator for Descriptors<'a> {
    type Item = (IdentDescriptor, &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        let (descriptor, rest) = IdentDescriptor::read_from_prefix(self.rest).ok()?;
        let length = descriptor.length as usize;
        if length > rest.len() {
            self.rest = &[];
            return None;
        }
        let (identifier, rest) = rest.split_at(length);
        self.rest = rest;
        Some((descriptor, identifier))
    }
}

/// The unit serial number, leading padding preserved
pub fn serial_number(page: &VpdPage<'_>) -> Option<String> {
    let serial = ascii(page.payload());
    (!serial.is_empty()).then_some(serial)
}

// Lower ranks win
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum IdRank {
    NaaRegisteredExtended,
    NaaRegistered,
    NaaExtended,
    NaaOne,
    Eui64,
    T10Vendor,
    Binary,
}

fn naa_rank(identifier: &[u8]) -> IdRank {
    match identifier.first().map(|b| b >> 4) {
        Some(0x6) => IdRank::NaaRegisteredExtended,
        Some(0x5) => IdRank::NaaRegistered,
        Some(0x2) => IdRank::NaaExtended,
        Some(0x1) => IdRank::NaaOne,
        _ => IdRank::Binary,
    }
}

/// The best logical unit identifier (WWN) of a device identification page
///
/// NAA identifiers are preferred in the order registered extended,
/// registered, extended and type 1, then EUI-64, then a T10 vendor
/// identifier (ASCII, prefixed with the product identification). The first
/// descriptor of the best rank wins.
pub fn device_identifier(page: &VpdPage<'_>, inquiry: &StandardInquiry) -> Option<String> {
    let mut best: Option<(IdRank, String)> = None;

    for (descriptor, identifier) in page.descriptors() {
        if descriptor.association() != ASSOC_LOGICAL_UNIT || identifier.is_empty() {
            continue;
        }
        let rank = match (descriptor.code_set(), descriptor.ident_type()) {
            (CODE_SET_BINARY, ID_TYPE_NAA) => naa_rank(identifier),
            (CODE_SET_BINARY, ID_TYPE_EUI64) => IdRank::Eui64,
            (CODE_SET_ASCII, ID_TYPE_T10_VENDOR) => IdRank::T10Vendor,
            _ => continue,
        };
        if best.as_ref().is_some_and(|(current, _)| *current <= rank) {
            continue;
        }
        let text = if rank == IdRank::T10Vendor {
            format!("{}{}", inquiry.product, ascii(identifier))
        } else {
            hex_identifier(identifier)
        };
        best = Some((rank, text));
    }

    best.map(|(_, id)| id)
}

/// The target port identifier (the SAS address on SAS drives)
pub fn target_port_identifier(page: &VpdPage<'_>) -> Option<String> {
    page.descriptors()
        .find(|(d, id)| {
            d.code_set() == CODE_SET_BINARY
                && d.association() == ASSOC_TARGET_PORT
                && d.ident_type() == ID_TYPE_NAA
                && !id.is_empty()
        })
        .map(|(_, id)| hex_identifier(id))
}

/// The full firmware revision from IDENTIFY DEVICE data
///
/// ATA strings are stored as 16-bit words with the first character in the
/// high byte.
pub fn ata_firmware_version(identify: &[u8]) -> Option<String> {
    let raw = identify.get(IDENTIFY_FW_OFFSET..IDENTIFY_FW_OFFSET + IDENTIFY_FW_LENGTH)?;
    let swapped: Vec<u8> = raw.chunks_exact(2).flat_map(|w| [w[1], w[0]]).collect();
    let version = ascii(&swapped);
    (!version.trim().is_empty()).then_some(version)
}


#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;
    use test_log::test;

    fn inquiry() -> StandardInquiry {
        StandardInquiry::parse(&standard("HPE", "MSA 2050 SAN", "G22")).unwrap()
    }

    #[test]
    fn test_standard_inquiry() {
        let inq = inquiry();
        assert_eq!(inq.device_type, DTYPE_DIRECT);
        assert_eq!(inq.vendor, "HPE     ");
        assert_eq!(inq.product, "MSA 2050 SAN    ");
        assert_eq!(inq.revision, "G22 ");
        assert_eq!(inq.device_type_name(), "Direct Access");
        assert!(!inq.is_ata());
        assert!(StandardInquiry::parse(&[0u8; 20]).is_none());
    }

    #[test]
    fn test_vpd_header_checks() {
        let inq = inquiry();
        let page = serial_page("  3SJ1ABCD");
        assert!(VpdPage::parse(&page, SERIAL_NUMBER_PAGE, &inq).is_some());
        assert!(VpdPage::parse(&page, DEVICE_ID_PAGE, &inq).is_none());

        // enclosure device type against a direct access inquiry
        let mut other = page.clone();
        other[0] = 0x0d;
        assert!(VpdPage::parse(&other, SERIAL_NUMBER_PAGE, &inq).is_none());

        let empty = [0x00, 0x80, 0x00, 0x00];
        assert!(VpdPage::parse(&empty, SERIAL_NUMBER_PAGE, &inq).is_none());
    }

    #[test]
    fn test_serial_keeps_padding() {
        let inq = inquiry();
        let data = serial_page("  3SJ1ABCD");
        let page = VpdPage::parse(&data, SERIAL_NUMBER_PAGE, &inq).unwrap();
        assert_eq!(serial_number(&page).as_deref(), Some("  3SJ1ABCD"));
    }

    #[test]
    fn test_identifier_precedence() {
        let inq = inquiry();
        let data = device_id_page(&[
            (CODE_SET_ASCII, ASSOC_LOGICAL_UNIT, ID_TYPE_T10_VENDOR, b"HPE     1234"),
            (CODE_SET_BINARY, ASSOC_TARGET_PORT, ID_TYPE_NAA, &SAS_ADDRESS),
            (CODE_SET_BINARY, ASSOC_LOGICAL_UNIT, ID_TYPE_NAA, &NAA_REGISTERED),
            (CODE_SET_BINARY, ASSOC_LOGICAL_UNIT, ID_TYPE_NAA, &NAA_REGISTERED_EXTENDED),
        ]);
        let page = VpdPage::parse(&data, DEVICE_ID_PAGE, &inq).unwrap();
        assert_eq!(
            device_identifier(&page, &inq).as_deref(),
            Some("0x600c0ff0001be5019a55105e01000000")
        );
        assert_eq!(target_port_identifier(&page).as_deref(), Some("0x5000c50012345679"));
    }

    #[test]
    fn test_vendor_identifier_fallback() {
        let inq = inquiry();
        let data = device_id_page(&[(CODE_SET_ASCII, ASSOC_LOGICAL_UNIT, ID_TYPE_T10_VENDOR, b"HPE 42")]);
        let page = VpdPage::parse(&data, DEVICE_ID_PAGE, &inq).unwrap();
        assert_eq!(device_identifier(&page, &inq).as_deref(), Some("MSA 2050 SAN    HPE 42"));
        assert_eq!(target_port_identifier(&page), None);
    }

    #[test]
    fn test_truncated_descriptor_stops_walk() {
        let inq = inquiry();
        let mut data = device_id_page(&[(CODE_SET_BINARY, ASSOC_LOGICAL_UNIT, ID_TYPE_NAA, &NAA_REGISTERED)]);
        // claim a longer identifier than the page holds
        data[7] = 32;
        let page = VpdPage::parse(&data, DEVICE_ID_PAGE, &inq).unwrap();
        assert_eq!(device_identifier(&page, &inq), None);
    }

    #[test]
    fn test_cdbs() {
        assert_eq!(inquiry_cdb(None, 36), [0x12, 0, 0, 0, 36, 0]);
        assert_eq!(inquiry_cdb(Some(0x83), 255), [0x12, 1, 0x83, 0, 255, 0]);
        let ata = ata_identify_cdb();
        assert_eq!((ata[0], ata[1], ata[2], ata[6], ata[14]), (0x85, 0x08, 0x0e, 1, 0xec));
        assert_eq!(ata_identify_command().data_length(), IDENTIFY_LENGTH);
    }

    #[test]
    fn test_ata_firmware_version() {
        let mut identify = vec![0u8; IDENTIFY_LENGTH];
        identify[46..54].copy_from_slice(b"NS40 1  ");
        assert_eq!(ata_firmware_version(&identify).as_deref(), Some("SN041   "));
        assert_eq!(ata_firmware_version(&[0u8; IDENTIFY_LENGTH]), None);
        assert_eq!(ata_firmware_version(&[0u8; 40]), None);
    }

    #[test]
    fn test_device_type_codes() {
        assert_eq!(device_type_code("enclosure"), Some(0x0d));
        assert_eq!(device_type_code("Direct"), Some(0x00));
        assert_eq!(device_type_code("0x0c"), Some(0x0c));
        assert_eq!(device_type_code("bogus"), None);
    }
}
