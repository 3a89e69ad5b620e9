// SPDX-FileCopyrightText: Copyright © 2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Status code tables and result normalization

use log::{debug, error};

use crate::{
    outcome::{self, Completion, FailureKind, Outcome},
    CommandDescriptor, NativeResult, Platform, StatusValidity,
};

pub const SCSI_GOOD: u8 = 0x00;
pub const SCSI_CHECK_CONDITION: u8 = 0x02;
pub const SCSI_BUSY: u8 = 0x08;
pub const SCSI_QUEUE_FULL: u8 = 0x28;

pub const DID_TRANSPORT_DISRUPTED: u16 = 0x0e;
pub const DID_TRANSPORT_FAILFAST: u16 = 0x0f;

const DRIVER_MASK: u16 = 0x0f;
const SUGGEST_MASK: u16 = 0xf0;

/// Placeholder for codes missing from the Linux and SCSI tables
pub const UNKNOWN: &str = "???";
pub const UNKNOWN_ADAPTER_STATUS: &str = "Unknown Adapter Status";
pub const UNKNOWN_EINVAL_REASON: &str = "Unknown EINVAL Reason";

static SCSI_STATUS: phf::Map<u8, &'static str> = phf::phf_map! {
    0x00u8 => "GOOD",
    0x02u8 => "CHECK CONDITION",
    0x04u8 => "CONDITION MET",
    0x08u8 => "BUSY",
    0x10u8 => "INTERMEDIATE",
    0x14u8 => "INTERMEDIATE-CONDITION MET",
    0x18u8 => "RESERVATION CONFLICT",
    0x22u8 => "COMMAND TERMINATED",
    0x28u8 => "QUEUE FULL",
    0x30u8 => "ACA ACTIVE",
    0x40u8 => "TASK ABORTED",
};

// Linux mid-layer host byte (DID_*)
static LINUX_HOST_STATUS: phf::Map<u16, &'static str> = phf::phf_map! {
    0x00u16 => "DID_OK",
    0x01u16 => "DID_NO_CONNECT",
    0x02u16 => "DID_BUS_BUSY",
    0x03u16 => "DID_TIME_OUT",
    0x04u16 => "DID_BAD_TARGET",
    0x05u16 => "DID_ABORT",
    0x06u16 => "DID_PARITY",
    0x07u16 => "DID_ERROR",
    0x08u16 => "DID_RESET",
    0x09u16 => "DID_BAD_INTR",
    0x0au16 => "DID_PASSTHROUGH",
    0x0bu16 => "DID_SOFT_ERROR",
    0x0cu16 => "DID_IMM_RETRY",
    0x0du16 => "DID_REQUEUE",
    0x0eu16 => "DID_TRANSPORT_DISRUPTED",
    0x0fu16 => "DID_TRANSPORT_FAILFAST",
    0x10u16 => "DID_TARGET_FAILURE",
    0x11u16 => "DID_NEXUS_FAILURE",
    0x12u16 => "DID_ALLOC_FAILURE",
    0x13u16 => "DID_MEDIUM_ERROR",
};

static LINUX_DRIVER_STATUS: phf::Map<u16, &'static str> = phf::phf_map! {
    0x00u16 => "DRIVER_OK",
    0x01u16 => "DRIVER_BUSY",
    0x02u16 => "DRIVER_SOFT",
    0x03u16 => "DRIVER_MEDIA",
    0x04u16 => "DRIVER_ERROR",
    0x05u16 => "DRIVER_INVALID",
    0x06u16 => "DRIVER_TIMEOUT",
    0x07u16 => "DRIVER_HARD",
    0x08u16 => "DRIVER_SENSE",
};

static LINUX_SUGGEST_STATUS: phf::Map<u16, &'static str> = phf::phf_map! {
    0x10u16 => "SUGGEST_RETRY",
    0x20u16 => "SUGGEST_ABORT",
    0x30u16 => "SUGGEST_REMAP",
    0x40u16 => "SUGGEST_DIE",
    0x80u16 => "SUGGEST_SENSE",
};

// AIX adapter status, sys/scsi_buf.h order
static AIX_ADAPTER_STATUS: phf::Map<u16, &'static str> = phf::phf_map! {
    0x01u16 => "SCSI_HOST_IO_BUS_ERR",
    0x02u16 => "SCSI_TRANSPORT_FAULT",
    0x03u16 => "SCSI_CMD_TIMEOUT",
    0x04u16 => "SCSI_NO_DEVICE_RESPONSE",
    0x05u16 => "SCSI_ADAPTER_HDW_FAILURE",
    0x06u16 => "SCSI_ADAPTER_SFW_FAILURE",
    0x07u16 => "SCSI_WW_NAME_CHANGE",
    0x08u16 => "SCSI_FUSE_OR_TERMINAL_PWR",
    0x09u16 => "SCSI_TRANSPORT_RESET",
    0x0au16 => "SCSI_TRANSPORT_BUSY",
    0x0bu16 => "SCSI_TRANSPORT_DEAD",
    0x0cu16 => "SCSI_VERIFY_DEVICE",
};

// AIX DK_PASSTHRU einval_arg reasons: (brief, full)
static AIX_EINVAL_REASON: phf::Map<u32, (&'static str, &'static str)> = phf::phf_map! {
    1u32 => ("SC_PASSTHRU_INV_VERS", "Version field is invalid"),
    9u32 => ("SC_PASSTHRU_INV_Q_TAG_MSG", "q_tag_msg field is invalid"),
    10u32 => ("SC_PASSTHRU_INV_FLAGS", "flags field is invalid"),
    11u32 => ("SC_PASSTHRU_INV_DEVFLAGS", "devflags field is invalid"),
    12u32 => ("SC_PASSTHRU_INV_Q_FLAGS", "q_flags field is invalid"),
    13u32 => ("SC_PASSTHRU_INV_CDB_LEN", "command_length field is invalid"),
    15u32 => ("SC_PASSTHRU_INV_AS_LEN", "autosense_length field is invalid"),
    16u32 => ("SC_PASSTHRU_INV_CDB", "scsi_cdb field is invalid"),
    17u32 => ("SC_PASSTHRU_INV_TO", "timeout_value field is invalid"),
    18u32 => ("SC_PASSTHRU_INV_D_LEN", "data_length field is invalid"),
    19u32 => ("SC_PASSTHRU_INV_SID", "scsi_id field is invalid"),
    20u32 => ("SC_PASSTHRU_INV_LUN", "lun_id field is invalid"),
    21u32 => ("SC_PASSTHRU_INV_BUFF", "buffer field is invalid"),
    22u32 => ("SC_PASSTHRU_INV_AS_BUFF", "autosense_buffer_ptr is invalid"),
    23u32 => ("SC_PASSTHRU_INV_VAR_CDB_LEN", "variable_cdb_length field is invalid"),
    24u32 => ("SC_PASSTHRU_INV_VAR_CDB", "variable_cdb_ptr field is invalid"),
};

pub fn scsi_status(code: u8) -> &'static str {
    SCSI_STATUS.get(&code).copied().unwrap_or(UNKNOWN)
}

pub fn linux_host_status(code: u16) -> &'static str {
    LINUX_HOST_STATUS.get(&code).copied().unwrap_or(UNKNOWN)
}

/// Renders the driver byte as `DRIVER_x` plus `|SUGGEST_y` when a suggestion is present
pub fn linux_driver_status(code: u16) -> String {
    let driver = LINUX_DRIVER_STATUS.get(&(code & DRIVER_MASK)).copied().unwrap_or(UNKNOWN);
    match code & SUGGEST_MASK {
        0 => driver.to_owned(),
        suggest => {
            let suggest = LINUX_SUGGEST_STATUS.get(&suggest).copied().unwrap_or(UNKNOWN);
            format!("{driver}|{suggest}")
        }
    }
}

pub fn aix_adapter_status(code: u16) -> &'static str {
    AIX_ADAPTER_STATUS.get(&code).copied().unwrap_or(UNKNOWN_ADAPTER_STATUS)
}

/// AIX einval reason, either the constant name (`brief`) or its description
pub fn aix_einval_reason(code: u32, brief: bool) -> &'static str {
    match AIX_EINVAL_REASON.get(&code) {
        Some((name, _)) if brief => name,
        Some((_, text)) => text,
        None if brief => "Unknown",
        None => UNKNOWN_EINVAL_REASON,
    }
}

/// Host and driver status text for the platform, where it keeps a table
pub(crate) fn status_messages(platform: Platform, host: u16, driver: u16) -> (Option<String>, Option<String>) {
    match platform {
        Platform::Linux => (
            Some(linux_host_status(host).to_owned()),
            Some(linux_driver_status(driver)),
        ),
        Platform::Aix if host != 0 => (Some(aix_adapter_status(host).to_owned()), None),
        _ => (None, None),
    }
}

/// Whether the native status fields describe a successful command
fn is_good(platform: Platform, native: &NativeResult) -> bool {
    match platform {
        // No validity bits means nothing went wrong, whatever the status bytes say
        Platform::Aix => {
            native.status_validity.is_empty() || (native.scsi_status == SCSI_GOOD && native.host_status == 0)
        }
        Platform::Linux => native.scsi_status == SCSI_GOOD && native.host_status == 0 && native.driver_status == 0,
        Platform::Windows | Platform::HpUx => native.scsi_status == SCSI_GOOD && native.host_status == 0,
    }
}

/// Maps a native result into the canonical outcome
pub fn normalize(platform: Platform, cmd: &CommandDescriptor, native: NativeResult) -> Outcome {
    let good = is_good(platform, &native);
    let sense_valid = native.scsi_status == SCSI_CHECK_CONDITION && !native.sense.is_empty();
    let data_length = cmd.data_length();

    let completion = Completion {
        scsi_status: native.scsi_status,
        host_status: native.host_status,
        driver_status: native.driver_status,
        os_error: native.os_error,
        scsi_status_msg: scsi_status(native.scsi_status),
        host_status_msg: None,
        driver_status_msg: None,
        einval_msg: native.einval_reason.map(|reason| aix_einval_reason(reason, false)),
        data_length,
        data_transferred: outcome::transferred(data_length, native.data_resid),
        data_resid: native.data_resid,
        sense_valid,
        sense: native.sense,
        data: native.data,
        duration: native.duration,
    }
    .with_platform_messages(platform);

    if good {
        return Outcome::Success(Box::new(completion));
    }

    report_failure(platform, cmd, &native.status_validity, &completion);
    Outcome::Failure(FailureKind::Device(Box::new(completion)))
}

// Check conditions are left to the caller, who usually expects them
fn report_failure(platform: Platform, cmd: &CommandDescriptor, validity: &StatusValidity, c: &Completion) {
    let name = cmd.cdb_name();
    let message = if c.scsi_status != SCSI_CHECK_CONDITION && c.scsi_status != SCSI_GOOD {
        Some(format!(
            "{name} failed, SCSI status = {:#x} ({})",
            c.scsi_status, c.scsi_status_msg
        ))
    } else if platform == Platform::Aix && validity.contains(StatusValidity::ADAPTER_ERROR) {
        Some(format!(
            "{name} failed, Adapter status = {:#x} ({})",
            c.host_status,
            aix_adapter_status(c.host_status)
        ))
    } else if c.host_status != 0 || c.driver_status != 0 {
        Some(format!(
            "{name} failed, host status = {:#x} ({}), driver status = {:#x} ({})",
            c.host_status,
            c.host_status_msg.as_deref().unwrap_or(UNKNOWN),
            c.driver_status,
            c.driver_status_msg.as_deref().unwrap_or(UNKNOWN),
        ))
    } else {
        None
    };

    match message {
        Some(message) if cmd.logs_errors() => error!("{message}"),
        Some(message) => debug!("{message}"),
        None => debug!("{name} returned {}", c.scsi_status_msg),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    fn inquiry() -> CommandDescriptor {
        CommandDescriptor::new([0x12, 0, 0, 0, 36, 0]).read(36)
    }

    #[test]
    fn test_tables() {
        assert_eq!(scsi_status(0x18), "RESERVATION CONFLICT");
        assert_eq!(scsi_status(0x7e), UNKNOWN);
        assert_eq!(linux_host_status(0x0e), "DID_TRANSPORT_DISRUPTED");
        assert_eq!(linux_host_status(0x40), UNKNOWN);
        assert_eq!(linux_driver_status(0x08), "DRIVER_SENSE");
        assert_eq!(linux_driver_status(0x28), "DRIVER_SENSE|SUGGEST_ABORT");
        assert_eq!(aix_einval_reason(17, false), "timeout_value field is invalid");
        assert_eq!(aix_einval_reason(17, true), "SC_PASSTHRU_INV_TO");
        assert_eq!(aix_einval_reason(2, false), UNKNOWN_EINVAL_REASON);
        assert_eq!(aix_einval_reason(2, true), "Unknown");
    }

    #[test]
    fn test_linux_good() {
        let native = NativeResult {
            data: vec![0; 36],
            data_resid: 4,
            ..Default::default()
        };
        let outcome = normalize(Platform::Linux, &inquiry(), native);
        let c = outcome.completion().unwrap();
        assert!(outcome.is_success());
        assert_eq!(c.data_transferred, 32);
        assert_eq!(c.host_status_msg.as_deref(), Some("DID_OK"));
        assert!(!c.sense_valid);
    }

    #[test]
    fn test_linux_host_error_is_failure() {
        let native = NativeResult {
            host_status: DID_TRANSPORT_DISRUPTED,
            ..Default::default()
        };
        let outcome = normalize(Platform::Linux, &inquiry(), native);
        match outcome {
            Outcome::Failure(FailureKind::Device(c)) => {
                assert_eq!(c.host_status_msg.as_deref(), Some("DID_TRANSPORT_DISRUPTED"))
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_check_condition_sense() {
        let mut sense = vec![0u8; 18];
        sense[0] = 0x70;
        sense[2] = 0x05;
        sense[7] = 10;
        sense[12] = 0x24;
        let native = NativeResult {
            scsi_status: SCSI_CHECK_CONDITION,
            driver_status: 0x08,
            sense,
            ..Default::default()
        };
        let outcome = normalize(Platform::Linux, &inquiry().errlog(false), native);
        let c = outcome.completion().unwrap();
        assert!(outcome.is_failure());
        assert!(c.sense_valid);
        assert_eq!(c.sense_data().map(|s| (s.key, s.asc)), Some((0x05, 0x24)));
    }

    #[test]
    fn test_aix_adapter_status_decoding() {
        let native = NativeResult {
            ioctl_status: -1,
            os_error: Some(5),
            status_validity: StatusValidity::ADAPTER_ERROR,
            host_status: 0x03,
            ..Default::default()
        };
        let outcome = normalize(Platform::Aix, &inquiry(), native);
        let c = outcome.completion().unwrap();
        assert!(outcome.is_failure());
        assert_eq!(c.host_status_msg.as_deref(), Some("SCSI_CMD_TIMEOUT"));

        let native = NativeResult {
            status_validity: StatusValidity::ADAPTER_ERROR,
            host_status: 0x7f,
            ..Default::default()
        };
        let outcome = normalize(Platform::Aix, &inquiry(), native);
        assert_eq!(
            outcome.completion().and_then(|c| c.host_status_msg.as_deref()),
            Some(UNKNOWN_ADAPTER_STATUS)
        );
    }

    #[test]
    fn test_aix_no_validity_is_success() {
        // Stale status bytes without validity bits are not an error
        let native = NativeResult {
            scsi_status: SCSI_BUSY,
            ..Default::default()
        };
        assert!(normalize(Platform::Aix, &inquiry(), native).is_success());
    }
}
