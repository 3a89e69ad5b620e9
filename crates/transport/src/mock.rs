// SPDX-FileCopyrightText: Copyright © 2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Scripted mock backend for testing.
//!
//! This module provides a backend that answers commands from a script keyed by
//! device path and CDB prefix, so scanners and retry logic can be exercised
//! without hardware.

use std::{
    collections::BTreeMap,
    io,
    path::{Path, PathBuf},
    sync::{Mutex, MutexGuard, PoisonError},
};

use crate::{
    backend::{DeviceHandle, Nexus, OpenMode, TransportBackend},
    outcome, status, CommandDescriptor, DataDirection, Error, NativeResult, Outcome, Platform, StatusValidity,
};

/// Scripted response to a command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// GOOD status with this data, truncated to the requested length
    Data(Vec<u8>),
    /// CHECK CONDITION with fixed format sense
    Check { key: u8, asc: u8, ascq: u8 },
    /// Any other SCSI status without sense
    Status(u8),
    /// GOOD SCSI status with a host status set
    Host(u16),
    /// The native call fails with this OS error
    OsError(i32),
}

#[derive(Debug, Default)]
struct Script {
    replies: Vec<(PathBuf, Vec<u8>, Reply)>,
    open_errors: BTreeMap<PathBuf, i32>,
    nexus: BTreeMap<PathBuf, Nexus>,
    aliases: BTreeMap<PathBuf, PathBuf>,
}

#[derive(Debug, Default)]
struct Journal {
    opened: Vec<PathBuf>,
    submitted: Vec<(PathBuf, Vec<u8>)>,
    failovers: Vec<PathBuf>,
    resets: Vec<(&'static str, PathBuf)>,
}

/// Handle returned by [`MockBackend::open`]
#[derive(Debug)]
pub struct MockHandle {
    path: PathBuf,
    scsi_path: Option<PathBuf>,
    mode: OpenMode,
}

impl MockHandle {
    pub fn mode(&self) -> OpenMode {
        self.mode
    }
}

impl DeviceHandle for MockHandle {
    fn path(&self) -> &Path {
        &self.path
    }

    fn scsi_path(&self) -> Option<&Path> {
        self.scsi_path.as_deref()
    }
}

/// Represents a scripted pass-through backend.
///
/// Any path opens unless an open error was scripted for it. Commands without
/// a scripted reply fail with ILLEGAL REQUEST, INVALID FIELD IN CDB.
#[derive(Debug)]
pub struct MockBackend {
    platform: Platform,
    script: Script,
    journal: Mutex<Journal>,
}

impl MockBackend {
    pub fn new(platform: Platform) -> Self {
        Self {
            platform,
            script: Script::default(),
            journal: Mutex::new(Journal::default()),
        }
    }

    /// Answers commands to `path` whose CDB starts with `cdb_prefix`
    ///
    /// Earlier replies win when several prefixes match.
    pub fn reply(mut self, path: impl Into<PathBuf>, cdb_prefix: &[u8], reply: Reply) -> Self {
        self.script.replies.push((path.into(), cdb_prefix.to_vec(), reply));
        self
    }

    /// Makes opening `path` fail with an OS error
    pub fn fail_open(mut self, path: impl Into<PathBuf>, errno: i32) -> Self {
        self.script.open_errors.insert(path.into(), errno);
        self
    }

    /// The nexus reported for `path`
    pub fn nexus(mut self, path: impl Into<PathBuf>, nexus: Nexus) -> Self {
        self.script.nexus.insert(path.into(), nexus);
        self
    }

    /// The pass-through alias reported for `path`
    pub fn alias(mut self, path: impl Into<PathBuf>, alias: impl Into<PathBuf>) -> Self {
        self.script.aliases.insert(path.into(), alias.into());
        self
    }

    /// Paths opened so far, in order
    pub fn opened(&self) -> Vec<PathBuf> {
        self.journal().opened.clone()
    }

    /// Path and CDB of every submitted command, in order
    pub fn submitted(&self) -> Vec<(PathBuf, Vec<u8>)> {
        self.journal().submitted.clone()
    }

    pub fn failovers(&self) -> Vec<PathBuf> {
        self.journal().failovers.clone()
    }

    /// Reset primitives issued so far, by operation name
    pub fn resets(&self) -> Vec<(&'static str, PathBuf)> {
        self.journal().resets.clone()
    }

    fn journal(&self) -> MutexGuard<'_, Journal> {
        self.journal.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lookup(&self, path: &Path, cdb: &[u8]) -> Option<&Reply> {
        self.script
            .replies
            .iter()
            .find(|(p, prefix, _)| p == path && cdb.starts_with(prefix))
            .map(|(_, _, reply)| reply)
    }

    fn reset(&self, operation: &'static str, handle: &MockHandle) -> Outcome {
        self.journal().resets.push((operation, handle.path.clone()));
        Outcome::done()
    }
}

fn fixed_sense(key: u8, asc: u8, ascq: u8) -> Vec<u8> {
    let mut sense = vec![0u8; 18];
    sense[0] = 0x70;
    sense[2] = key;
    sense[7] = 10;
    sense[12] = asc;
    sense[13] = ascq;
    sense
}

impl TransportBackend for MockBackend {
    type Handle = MockHandle;

    fn platform(&self) -> Platform {
        self.platform
    }

    fn open(&self, path: &Path, mode: OpenMode) -> Result<MockHandle, Error> {
        if let Some(errno) = self.script.open_errors.get(path) {
            return Err(Error::Open {
                path: path.to_path_buf(),
                source: io::Error::from_raw_os_error(*errno),
            });
        }
        self.journal().opened.push(path.to_path_buf());
        Ok(MockHandle {
            path: path.to_path_buf(),
            scsi_path: self.script.aliases.get(path).cloned(),
            mode,
        })
    }

    fn submit(&self, handle: &mut MockHandle, cmd: &CommandDescriptor) -> Result<NativeResult, Error> {
        cmd.check_cdb(self.platform.max_cdb_length())?;
        self.journal()
            .submitted
            .push((handle.path.clone(), cmd.cdb().to_vec()));

        let mut native = NativeResult {
            data: cmd.transfer_buffer(),
            ..Default::default()
        };
        let default = Reply::Check {
            key: crate::sense::ILLEGAL_REQUEST,
            asc: 0x24,
            ascq: 0,
        };

        match self.lookup(&handle.path, cmd.cdb()).unwrap_or(&default) {
            Reply::Data(bytes) => {
                let len = bytes.len().min(native.data.len());
                native.data[..len].copy_from_slice(&bytes[..len]);
                native.data_resid = (cmd.data_length() - len) as u32;
            }
            Reply::Check { key, asc, ascq } => {
                native.scsi_status = status::SCSI_CHECK_CONDITION;
                native.status_validity = StatusValidity::SCSI_ERROR;
                native.sense = fixed_sense(*key, *asc, *ascq);
                native.sense.truncate(cmd.requested_sense_length());
                native.data_resid = cmd.data_length() as u32;
            }
            Reply::Status(code) => {
                native.scsi_status = *code;
                native.status_validity = StatusValidity::SCSI_ERROR;
                native.data_resid = cmd.data_length() as u32;
            }
            Reply::Host(code) => {
                native.host_status = *code;
                native.status_validity = StatusValidity::ADAPTER_ERROR;
                native.data_resid = cmd.data_length() as u32;
            }
            Reply::OsError(errno) => {
                return Err(Error::Transport {
                    operation: "mock pass-through",
                    device: handle.path.display().to_string(),
                    source: io::Error::from_raw_os_error(*errno),
                })
            }
        }
        match cmd.direction() {
            DataDirection::Read => native
                .data
                .truncate(outcome::transferred(cmd.data_length(), native.data_resid)),
            _ => native.data.clear(),
        }
        Ok(native)
    }

    fn reset_bus(&self, handle: &mut MockHandle) -> Outcome {
        self.reset("reset bus", handle)
    }

    fn reset_controller(&self, handle: &mut MockHandle) -> Outcome {
        self.reset("reset controller", handle)
    }

    fn reset_target(&self, handle: &mut MockHandle) -> Outcome {
        self.reset("reset target", handle)
    }

    fn reset_lun(&self, handle: &mut MockHandle) -> Outcome {
        self.reset("reset lun", handle)
    }

    fn abort_task_set(&self, _handle: &mut MockHandle) -> Outcome {
        Outcome::unsupported("abort task set", self.platform)
    }

    fn scsi_address(&self, handle: &MockHandle) -> Option<Nexus> {
        self.script.nexus.get(&handle.path).copied()
    }

    fn force_failover(&self, handle: &MockHandle) -> io::Result<()> {
        self.journal().failovers.push(handle.path.clone());
        Ok(())
    }
}
