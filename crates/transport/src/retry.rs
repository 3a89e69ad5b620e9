// SPDX-FileCopyrightText: Copyright © 2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Retriable failure classification
//!
//! Only the decision is made here. How often and how long to wait before
//! resubmitting is up to the caller.

use linux_raw_sys::errno::EAGAIN;
use log::{debug, warn};

use crate::{
    sense::{self, Sense},
    status, Completion, FailureKind, Outcome, Platform, TransportBackend,
};

static WINDOWS_RETRIABLE: phf::Map<i32, &'static str> = phf::phf_map! {
    55i32 => "ERROR_DEV_NOT_EXIST",
    170i32 => "ERROR_BUSY",
    1117i32 => "ERROR_IO_DEVICE",
    1167i32 => "ERROR_DEVICE_NOT_CONNECTED",
    1450i32 => "ERROR_NO_SYSTEM_RESOURCES",
};

// ASCQs of LOGICAL UNIT NOT READY (ASC 0x04) that clear on their own
const NOT_READY_TRANSIENT: [u8; 8] = [0x00, 0x01, 0x05, 0x06, 0x07, 0x08, 0x0a, 0x14];

/// What to do with a completed command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Retry {
    /// Report the outcome as is
    Fatal,
    /// Resubmit the command
    Retriable,
    /// Force a multipath failover, then resubmit
    Failover,
}

/// Platform OS error and host status rules
pub fn is_retriable_status(platform: Platform, os_error: Option<i32>, host_status: u16) -> Retry {
    match platform {
        Platform::Linux => {
            if os_error == Some(EAGAIN as i32) {
                debug!("EAGAIN detected");
                Retry::Failover
            } else if host_status == status::DID_TRANSPORT_FAILFAST || host_status == status::DID_TRANSPORT_DISRUPTED {
                debug!("{} detected", status::linux_host_status(host_status));
                Retry::Failover
            } else {
                Retry::Fatal
            }
        }
        Platform::Windows => match os_error.and_then(|e| WINDOWS_RETRIABLE.get(&e)) {
            Some(name) => {
                debug!("{name} detected");
                Retry::Retriable
            }
            None => Retry::Fatal,
        },
        Platform::Aix | Platform::HpUx => Retry::Fatal,
    }
}

/// Device status rules shared by every platform
fn is_retriable_device(scsi_status: u8, sense: Option<Sense>) -> bool {
    match scsi_status {
        status::SCSI_BUSY | status::SCSI_QUEUE_FULL => true,
        status::SCSI_CHECK_CONDITION => match sense {
            Some(s) if s.key == sense::UNIT_ATTENTION => !matches!(s.asc, 0x17 | 0x18),
            Some(s) if s.key == sense::NOT_READY => s.asc == 0x04 && NOT_READY_TRANSIENT.contains(&s.ascq),
            _ => false,
        },
        _ => false,
    }
}

/// Status and sense of the copy device that made an EXTENDED COPY abort
///
/// Bytes 8 and 9 of fixed format COPY ABORTED sense hold the offsets of the
/// source and destination device status byte, which is followed by the sense
/// data of that device. The destination is reported when both are set.
fn copy_device_status(sense: &[u8]) -> Option<(&'static str, u8, Option<Sense>)> {
    if !matches!(sense.first()? & 0x7f, 0x70 | 0x71) {
        return None;
    }
    let (device, offset) = [("destination", 9), ("source", 8)]
        .into_iter()
        .find_map(|(device, at)| sense.get(at).filter(|&&o| o != 0).map(|&o| (device, o as usize)))?;
    let status = *sense.get(offset)?;
    Some((device, status, sense.get(offset + 1..).and_then(Sense::parse)))
}

fn is_retriable_copy(c: &Completion) -> bool {
    if !c.sense_data().is_some_and(|s| s.key == sense::COPY_ABORTED) {
        return false;
    }
    match copy_device_status(&c.sense) {
        Some((device, status, sense)) if is_retriable_device(status, sense) => {
            debug!("Retriable {device} device error");
            true
        }
        _ => false,
    }
}

/// Decides whether a failed command may be resubmitted
#[derive(Debug, Clone, Copy)]
pub struct RetryClassifier {
    platform: Platform,
}

impl Default for RetryClassifier {
    fn default() -> Self {
        Self::new(Platform::current())
    }
}

impl RetryClassifier {
    pub fn new(platform: Platform) -> Self {
        Self { platform }
    }

    /// Classifies an outcome without side effects
    pub fn classify(&self, outcome: &Outcome) -> Retry {
        match outcome {
            Outcome::Success(_) | Outcome::Warning(_) => Retry::Fatal,
            Outcome::Failure(FailureKind::Validation { .. }) => Retry::Fatal,
            Outcome::Failure(FailureKind::Transport { os_error, .. }) => {
                is_retriable_status(self.platform, *os_error, 0)
            }
            Outcome::Failure(FailureKind::Device(c)) => {
                match is_retriable_status(self.platform, c.os_error, c.host_status) {
                    Retry::Fatal if is_retriable_device(c.scsi_status, c.sense_data()) || is_retriable_copy(c) => {
                        Retry::Retriable
                    }
                    retry => retry,
                }
            }
        }
    }

    /// Whether the command should be resubmitted
    ///
    /// A lost multipath path is reported through the pass-through path
    /// without the multipath driver switching paths, so a block read is
    /// issued first to make it fail over.
    pub fn is_retriable<B: TransportBackend>(&self, backend: &B, handle: &B::Handle, outcome: &Outcome) -> bool {
        match self.classify(outcome) {
            Retry::Fatal => false,
            Retry::Retriable => true,
            Retry::Failover => {
                if let Err(err) = backend.force_failover(handle) {
                    warn!("forced path failover failed: {err}");
                }
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{mock::MockBackend, DeviceHandle, OpenMode};
    use std::path::Path;
    use test_log::test;

    fn device_failure(c: Completion) -> Outcome {
        Outcome::Failure(FailureKind::Device(Box::new(c)))
    }

    fn check_condition(key: u8, asc: u8, ascq: u8) -> Outcome {
        let mut sense = vec![0u8; 18];
        sense[0] = 0x70;
        sense[2] = key;
        sense[12] = asc;
        sense[13] = ascq;
        device_failure(Completion {
            scsi_status: status::SCSI_CHECK_CONDITION,
            sense_valid: true,
            sense,
            ..Default::default()
        })
    }

    #[test]
    fn test_transport_disrupted_is_retriable() {
        let backend = MockBackend::new(Platform::Linux);
        let handle = backend.open(Path::new("/dev/sdc"), OpenMode::ReadWrite).unwrap();
        let outcome = device_failure(Completion {
            host_status: status::DID_TRANSPORT_DISRUPTED,
            ..Default::default()
        });

        let classifier = RetryClassifier::new(Platform::Linux);
        assert_eq!(classifier.classify(&outcome), Retry::Failover);
        assert!(classifier.is_retriable(&backend, &handle, &outcome));
        assert_eq!(backend.failovers(), vec![handle.path().to_path_buf()]);
    }

    #[test]
    fn test_plain_check_condition_is_fatal() {
        let backend = MockBackend::new(Platform::Linux);
        let handle = backend.open(Path::new("/dev/sdc"), OpenMode::ReadWrite).unwrap();
        let classifier = RetryClassifier::new(Platform::Linux);

        let bare = device_failure(Completion {
            scsi_status: status::SCSI_CHECK_CONDITION,
            ..Default::default()
        });
        assert!(!classifier.is_retriable(&backend, &handle, &bare));
        assert!(!classifier.is_retriable(&backend, &handle, &check_condition(sense::ILLEGAL_REQUEST, 0x24, 0)));
        assert!(backend.failovers().is_empty());
    }

    #[test]
    fn test_sense_rules() {
        let classifier = RetryClassifier::new(Platform::Aix);
        assert_eq!(classifier.classify(&check_condition(sense::UNIT_ATTENTION, 0x29, 0)), Retry::Retriable);
        assert_eq!(classifier.classify(&check_condition(sense::UNIT_ATTENTION, 0x18, 0)), Retry::Fatal);
        assert_eq!(classifier.classify(&check_condition(sense::NOT_READY, 0x04, 0x01)), Retry::Retriable);
        assert_eq!(classifier.classify(&check_condition(sense::NOT_READY, 0x04, 0x02)), Retry::Fatal);
        assert_eq!(classifier.classify(&check_condition(sense::NOT_READY, 0x3a, 0x00)), Retry::Fatal);

        let busy = device_failure(Completion {
            scsi_status: status::SCSI_BUSY,
            ..Default::default()
        });
        assert_eq!(classifier.classify(&busy), Retry::Retriable);
    }

    // COPY ABORTED with the status and sense of a copy device appended
    fn copy_aborted(at: usize, status: u8, key: u8, asc: u8, ascq: u8) -> Outcome {
        let mut sense = vec![0u8; 18];
        sense[0] = 0x70;
        sense[2] = sense::COPY_ABORTED;
        sense[7] = 10 + 15;
        sense[at] = 18;
        sense.push(status);
        sense.extend_from_slice(&[0x70, 0, key, 0, 0, 0, 0, 10, 0, 0, 0, 0, asc, ascq]);
        device_failure(Completion {
            scsi_status: status::SCSI_CHECK_CONDITION,
            sense_valid: true,
            sense,
            ..Default::default()
        })
    }

    #[test]
    fn test_copy_device_sense() {
        let classifier = RetryClassifier::new(Platform::Linux);
        let check = status::SCSI_CHECK_CONDITION;

        // source, then destination device
        assert_eq!(classifier.classify(&copy_aborted(8, check, sense::UNIT_ATTENTION, 0x29, 0)), Retry::Retriable);
        assert_eq!(classifier.classify(&copy_aborted(9, status::SCSI_BUSY, 0, 0, 0)), Retry::Retriable);
        assert_eq!(classifier.classify(&copy_aborted(9, check, sense::NOT_READY, 0x04, 0x0a)), Retry::Retriable);
        assert_eq!(classifier.classify(&copy_aborted(9, check, sense::MEDIUM_ERROR, 0x11, 0)), Retry::Fatal);

        // no copy device reported
        assert_eq!(classifier.classify(&check_condition(sense::COPY_ABORTED, 0x0d, 0x01)), Retry::Fatal);
    }

    #[test]
    fn test_platform_os_errors() {
        let eagain = Outcome::Failure(FailureKind::Transport {
            os_error: Some(EAGAIN as i32),
            message: "SG_IO".into(),
        });
        assert_eq!(RetryClassifier::new(Platform::Linux).classify(&eagain), Retry::Failover);
        assert_eq!(RetryClassifier::new(Platform::HpUx).classify(&eagain), Retry::Fatal);

        for code in [55, 170, 1117, 1167, 1450] {
            assert_eq!(is_retriable_status(Platform::Windows, Some(code), 0), Retry::Retriable);
        }
        assert_eq!(is_retriable_status(Platform::Windows, Some(5), 0), Retry::Fatal);
    }

    #[test]
    fn test_warning_is_never_retried() {
        let classifier = RetryClassifier::new(Platform::Linux);
        assert_eq!(classifier.classify(&Outcome::unsupported("abort task set", Platform::Linux)), Retry::Fatal);
    }
}
