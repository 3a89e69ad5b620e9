// SPDX-FileCopyrightText: Copyright © 2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Adapter login sessions
//!
//! Some drivers only accept commands for a target after the parent adapter
//! has been started (logged in) for it. An [`AdapterSession`] brackets one
//! operation with that start and the matching stop.

use std::path::Path;

use log::{debug, warn};
use serde::Serialize;

use crate::Error;

/// Kind of parent adapter, keyed off its device name
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AdapterType {
    /// Parallel SCSI (`scsiN`)
    Pscsi,
    /// Fibre channel (`fscsiN`)
    Fscsi,
    /// iSCSI (`iscsiN`)
    Iscsi,
    /// Virtual SCSI client (`vscsiN`)
    Vscsi,
    #[default]
    Unknown,
}

impl AdapterType {
    pub fn from_parent(parent: &str) -> Self {
        if parent.starts_with("scsi") {
            AdapterType::Pscsi
        } else if parent.starts_with("fscsi") {
            AdapterType::Fscsi
        } else if parent.starts_with("iscsi") {
            AdapterType::Iscsi
        } else if parent.starts_with("vscsi") {
            AdapterType::Vscsi
        } else {
            AdapterType::Unknown
        }
    }
}

/// Addressing of one LUN behind its parent adapter
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct LunInfo {
    /// Parent adapter device name (e.g. `fscsi0`)
    pub parent: String,
    pub adapter_type: AdapterType,
    pub scsi_id: u64,
    pub lun_id: u64,
    /// iSCSI target name
    pub target_name: Option<String>,
    /// iSCSI target address
    pub host_addr: Option<String>,
    /// iSCSI target port
    pub port: Option<u64>,
}

/// Platform device configuration database
pub trait DeviceConfigLookup {
    /// Resolves the parent adapter and target address of a disk
    fn lun_info(&self, device: &str, path_id: Option<u32>) -> Result<LunInfo, Error>;
}

/// The disk name a raw device path refers to (`/dev/rhdisk3` is `hdisk3`)
pub fn disk_name(path: &Path) -> String {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string_lossy().into_owned());
    match name.strip_prefix('r') {
        Some(rest) if !rest.is_empty() => rest.to_owned(),
        _ => name,
    }
}

/// What the adapter reported when it was started
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StartState {
    /// The target was already started by someone else
    pub already_started: bool,
    /// Dynamic tracking of fibre channel devices is enabled
    pub dynamic_tracking: bool,
    pub world_wide_name: u64,
    pub node_name: u64,
}

/// Native start and stop calls of a parent adapter
pub trait AdapterControl {
    type Adapter;

    fn open_adapter(&self, lun: &LunInfo) -> Result<Self::Adapter, Error>;

    fn start(&self, adapter: &mut Self::Adapter, lun: &LunInfo) -> Result<StartState, Error>;

    fn stop(&self, adapter: &mut Self::Adapter, lun: &LunInfo) -> Result<(), Error>;

    fn close(&self, adapter: Self::Adapter);
}

/// A started adapter
///
/// The adapter is stopped again only when this session performed the start,
/// and its handle is always closed exactly once, by [`AdapterSession::finish`]
/// or on drop.
///
/// Starting a session logs in to the target, and the platform flushes
/// outstanding commands on every LUN of that target when that happens.
/// Sessions against LUNs sharing a target are not serialized here.
pub struct AdapterSession<'a, C: AdapterControl> {
    control: &'a C,
    adapter: Option<C::Adapter>,
    lun: LunInfo,
    state: StartState,
}

impl<'a, C: AdapterControl> AdapterSession<'a, C> {
    /// Opens the parent adapter and starts it for the LUN
    pub fn start(control: &'a C, lun: LunInfo) -> Result<Self, Error> {
        let mut adapter = control.open_adapter(&lun)?;
        debug!(
            "starting adapter {} for scsi_id {:#x} lun_id {:#x}, outstanding commands to the target are flushed",
            lun.parent, lun.scsi_id, lun.lun_id
        );
        let state = match control.start(&mut adapter, &lun) {
            Ok(state) => state,
            Err(err) => {
                control.close(adapter);
                return Err(err);
            }
        };
        Ok(Self {
            control,
            adapter: Some(adapter),
            lun,
            state,
        })
    }

    /// Whether this session performed the start
    pub fn started_here(&self) -> bool {
        !self.state.already_started
    }

    pub fn state(&self) -> &StartState {
        &self.state
    }

    pub fn lun(&self) -> &LunInfo {
        &self.lun
    }

    /// The open adapter, until the session is finished
    pub fn adapter(&mut self) -> Option<&mut C::Adapter> {
        self.adapter.as_mut()
    }

    /// Stops the adapter if this session started it, then closes it
    pub fn finish(mut self) -> Result<(), Error> {
        self.release()
    }

    fn release(&mut self) -> Result<(), Error> {
        let Some(mut adapter) = self.adapter.take() else {
            return Ok(());
        };
        let result = if self.started_here() {
            debug!("stopping adapter {}", self.lun.parent);
            self.control.stop(&mut adapter, &self.lun)
        } else {
            Ok(())
        };
        self.control.close(adapter);
        result
    }
}

impl<C: AdapterControl> Drop for AdapterSession<'_, C> {
    fn drop(&mut self) {
        if let Err(err) = self.release() {
            warn!("{err}");
        }
    }
}
