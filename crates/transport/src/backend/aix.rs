// SPDX-FileCopyrightText: Copyright © 2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! AIX DK_PASSTHRU backend
//!
//! Commands go to the disk driver with `DK_PASSTHRU`, down one MPIO path
//! with `DKPATHPASSTHRU`, or straight to the parent adapter with `SCIOCMD`
//! inside an [`AdapterSession`](crate::session::AdapterSession). Target and
//! LUN resets always go through a session.

use std::{
    collections::HashMap,
    ffi::c_void,
    net::Ipv4Addr,
    process::Command,
    ptr,
    time::Duration,
};

use log::debug;

use crate::{
    session::{AdapterType, DeviceConfigLookup, LunInfo},
    CommandDescriptor, DataDirection, Error, NativeResult, StatusValidity, TransportFlags,
};

// sys/scsi.h, sys/scsi_buf.h and sys/scdisk.h
pub const DK_PASSTHRU: i32 = 0x4407;
pub const DKPATHPASSTHRU: i32 = 0x4417;
pub const SCIOCMD: i32 = 0x4c0e;
pub const SCIOLSTART: i32 = 0x4c40;
pub const SCIOLSTOP: i32 = 0x4c41;
pub const SCIOLRESET: i32 = 0x4c45;
pub const SCIOLHALT: i32 = 0x4c46;

pub const SCSI_VERSION_1: u16 = 1;
pub const SCSI_VERSION_2: u16 = 2;

pub const B_WRITE: u8 = 0x00;
pub const B_READ: u8 = 0x01;
pub const SC_ASYNC: u8 = 0x08;
pub const SC_NODISC: u8 = 0x80;

pub const SC_QUIESCE_IO: u8 = 0x00;
pub const SC_MIX_IO: u8 = 0x01;

pub const ISSUE_LOGIN: u16 = 0x01;
pub const SCIOLRESET_LUN_RESET: u16 = 0x02;
pub const SCSI_DEV_STARTED: u16 = 0x01;
pub const SCIOL_DYNTRK_ENABLED: u16 = 0x02;

pub const SCIOL_ISCSI_LOCATE_IPADDR: u32 = 0x01;
pub const SCIOL_ISCSI_LOC_IPV_ADDR: u32 = 0x01;
pub const ISCSI_IPV4_ADDR: u32 = 0x01;

const EINVAL: i32 = 22;

/// Largest timeout an SC_MIX_IO request may carry, in seconds
pub const AIX_MAX_TIMEOUT: u32 = 60;

const SCSI_CDB_LENGTH: usize = 16;
const ISCSI_NAME_LENGTH: usize = 256;

/// `struct sc_passthru`
#[repr(C)]
#[derive(Debug)]
pub struct ScPassthru {
    pub version: u16,
    pub status_validity: u8,
    pub scsi_bus_status: u8,
    pub adapter_status: u8,
    pub adap_q_status: u8,
    pub q_tag_msg: u8,
    pub flags: u8,
    pub devflags: u8,
    pub q_flags: u8,
    pub command_length: u16,
    pub einval_arg: u16,
    pub autosense_length: u16,
    pub timeout_value: u32,
    pub data_length: u64,
    pub scsi_id: u64,
    pub lun_id: u64,
    pub buffer: *mut u8,
    pub autosense_buffer_ptr: *mut u8,
    pub residual: u32,
    pub adap_set_flags: u16,
    pub add_device_status: u8,
    pub scsi_cdb: [u8; SCSI_CDB_LENGTH],
    pub world_wide_name: u64,
    pub node_name: u64,
    pub variable_cdb_length: u16,
    pub variable_cdb_ptr: *mut u8,
}

impl Default for ScPassthru {
    fn default() -> Self {
        Self {
            version: 0,
            status_validity: 0,
            scsi_bus_status: 0,
            adapter_status: 0,
            adap_q_status: 0,
            q_tag_msg: 0,
            flags: 0,
            devflags: 0,
            q_flags: 0,
            command_length: 0,
            einval_arg: 0,
            autosense_length: 0,
            timeout_value: 0,
            data_length: 0,
            scsi_id: 0,
            lun_id: 0,
            buffer: ptr::null_mut(),
            autosense_buffer_ptr: ptr::null_mut(),
            residual: 0,
            adap_set_flags: 0,
            add_device_status: 0,
            scsi_cdb: [0; SCSI_CDB_LENGTH],
            world_wide_name: 0,
            node_name: 0,
            variable_cdb_length: 0,
            variable_cdb_ptr: ptr::null_mut(),
        }
    }
}

/// `struct scdisk_pathiocmd`
#[repr(C)]
#[derive(Debug)]
pub struct ScdiskPathIoCmd {
    pub path_id: u16,
    pub size: i32,
    pub path_iocmd: *mut c_void,
}

/// `struct sciol_iscsi_addr`
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct IscsiAddr {
    pub addr_type: u32,
    pub addr: [u64; 2],
}

/// iSCSI part of `struct scsi_sciolst`
#[repr(C)]
#[derive(Debug)]
pub struct IscsiParms {
    pub flags: u32,
    pub loc_type: u32,
    pub name: [u8; ISCSI_NAME_LENGTH],
    pub port_num: u64,
    pub location: IscsiAddr,
}

/// `struct scsi_sciolst`
#[repr(C)]
#[derive(Debug)]
pub struct ScsiSciolst {
    pub version: u16,
    pub flags: u16,
    pub adap_set_flags: u16,
    pub scsi_id: u64,
    pub lun_id: u64,
    pub world_wide_name: u64,
    pub node_name: u64,
    pub parms: IscsiParms,
}

impl Default for ScsiSciolst {
    fn default() -> Self {
        Self {
            version: 0,
            flags: 0,
            adap_set_flags: 0,
            scsi_id: 0,
            lun_id: 0,
            world_wide_name: 0,
            node_name: 0,
            parms: IscsiParms {
                flags: 0,
                loc_type: 0,
                name: [0; ISCSI_NAME_LENGTH],
                port_num: 0,
                location: IscsiAddr::default(),
            },
        }
    }
}

/// Control fields of one pass-through request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Plan {
    pub version: u16,
    pub flags: u8,
    pub devflags: u8,
    pub q_tag_msg: u8,
    pub timeout_value: u32,
}

/// Timeout in whole seconds, never zero
pub fn timeout_secs(timeout: Duration) -> u32 {
    u32::try_from(timeout.as_millis() / 1000).unwrap_or(u32::MAX).max(1)
}

/// Works out the control fields for a request
///
/// SC_MIX_IO requests may not write and may not run longer than
/// [`AIX_MAX_TIMEOUT`], so writes and long commands quiesce other I/O.
/// Requests through the adapter have no such limits. Dynamic tracking
/// requires version 1 requests.
pub fn plan(cmd: &CommandDescriptor, via_adapter: bool, dynamic_tracking: bool) -> Plan {
    let timeout = timeout_secs(cmd.timeout_value());
    let mut flags = match cmd.direction() {
        DataDirection::None | DataDirection::Read => B_READ,
        DataDirection::Write => B_WRITE,
    };
    let transport = cmd.transport_flags();
    if transport.contains(TransportFlags::ASYNC) {
        flags |= SC_ASYNC;
    } else if transport.contains(TransportFlags::NO_DISCONNECT) {
        flags |= SC_NODISC;
    }

    let (devflags, timeout_value) = if via_adapter {
        (SC_MIX_IO, timeout)
    } else if timeout > AIX_MAX_TIMEOUT || cmd.direction() == DataDirection::Write {
        (SC_QUIESCE_IO, timeout)
    } else {
        (SC_MIX_IO, timeout.min(AIX_MAX_TIMEOUT))
    };

    Plan {
        version: if via_adapter && dynamic_tracking {
            SCSI_VERSION_1
        } else {
            SCSI_VERSION_2
        },
        flags,
        devflags,
        q_tag_msg: cmd.tag() as u8,
        timeout_value,
    }
}

/// Fills in a request; the pointers borrow the data and sense buffers
pub fn fill(cmd: &CommandDescriptor, plan: Plan, data: &mut [u8], sense: &mut [u8]) -> ScPassthru {
    let mut spt = ScPassthru {
        version: plan.version,
        q_tag_msg: plan.q_tag_msg,
        flags: plan.flags,
        devflags: plan.devflags,
        command_length: cmd.cdb().len() as u16,
        autosense_length: sense.len().min(u16::MAX as usize) as u16,
        autosense_buffer_ptr: sense.as_mut_ptr(),
        timeout_value: plan.timeout_value,
        data_length: data.len() as u64,
        ..Default::default()
    };
    let len = cmd.cdb().len().min(SCSI_CDB_LENGTH);
    spt.scsi_cdb[..len].copy_from_slice(&cmd.cdb()[..len]);
    if !data.is_empty() {
        spt.buffer = data.as_mut_ptr();
    }
    spt
}

/// Collects the completed request fields
///
/// A failed ioctl still carries a device result when status validity is
/// set; without it the transport itself failed and `None` is returned.
pub fn decode(
    spt: &ScPassthru,
    ioctl_status: i32,
    os_error: Option<i32>,
    cmd: &CommandDescriptor,
    mut sense: Vec<u8>,
    mut data: Vec<u8>,
) -> Option<NativeResult> {
    if ioctl_status < 0 && spt.status_validity == 0 {
        return None;
    }
    let validity = StatusValidity::from_bits_retain(spt.status_validity);
    if !(validity.contains(StatusValidity::SCSI_ERROR) && spt.scsi_bus_status == crate::status::SCSI_CHECK_CONDITION)
    {
        sense.clear();
    }
    if cmd.direction() != DataDirection::Read {
        data.clear();
    }
    Some(NativeResult {
        ioctl_status,
        os_error: if ioctl_status < 0 { os_error } else { None },
        scsi_status: spt.scsi_bus_status,
        host_status: spt.adapter_status as u16,
        driver_status: spt.add_device_status as u16,
        status_validity: validity,
        data_resid: spt.residual,
        sense,
        data,
        duration: None,
        einval_reason: (os_error == Some(EINVAL)).then_some(spt.einval_arg as u32),
    })
}

/// Login request for the target behind an adapter
pub fn sciolst(lun: &LunInfo, flags: u16) -> ScsiSciolst {
    let mut sciop = ScsiSciolst {
        version: SCSI_VERSION_1,
        flags,
        ..Default::default()
    };
    match lun.adapter_type {
        AdapterType::Fscsi => {
            sciop.scsi_id = lun.scsi_id;
            sciop.lun_id = lun.lun_id;
        }
        AdapterType::Iscsi => {
            sciop.lun_id = lun.lun_id;
            sciop.parms.flags = SCIOL_ISCSI_LOCATE_IPADDR;
            sciop.parms.loc_type = SCIOL_ISCSI_LOC_IPV_ADDR;
            if let Some(name) = &lun.target_name {
                let len = name.len().min(ISCSI_NAME_LENGTH - 1);
                sciop.parms.name[..len].copy_from_slice(&name.as_bytes()[..len]);
            }
            sciop.parms.port_num = lun.port.unwrap_or_default();
            if let Some(addr) = lun.host_addr.as_deref().and_then(|a| a.parse::<Ipv4Addr>().ok()) {
                sciop.parms.location = IscsiAddr {
                    addr_type: ISCSI_IPV4_ADDR,
                    addr: [u32::from_ne_bytes(addr.octets()) as u64, 0],
                };
            }
        }
        _ => {}
    }
    sciop
}

/// Parses `attribute value` lines as printed by `lsattr -F "attribute value"`
pub fn parse_attributes(output: &str) -> HashMap<String, String> {
    output
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            Some((fields.next()?.to_owned(), fields.next()?.to_owned()))
        })
        .collect()
}

/// Parses a hex attribute, with or without `0x`
pub fn parse_hex(value: &str) -> Option<u64> {
    let digits = value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
        .unwrap_or(value);
    u64::from_str_radix(digits, 16).ok()
}

/// Builds the LUN information from the parent and the device attributes
///
/// `path_attrs` are the attributes of the selected MPIO path, which carry
/// the path specific `scsi_id`.
pub fn lun_info_from(
    parent: &str,
    attrs: &HashMap<String, String>,
    path_attrs: Option<&HashMap<String, String>>,
) -> Result<LunInfo, String> {
    let attr = |map: &HashMap<String, String>, name: &str| {
        map.get(name)
            .cloned()
            .ok_or_else(|| format!("Didn't find {name} attribute"))
    };
    let hex = |map: &HashMap<String, String>, name: &str| {
        attr(map, name).and_then(|v| parse_hex(&v).ok_or_else(|| format!("invalid {name} value '{v}'")))
    };

    let adapter_type = AdapterType::from_parent(parent);
    let mut lun = LunInfo {
        parent: parent.to_owned(),
        adapter_type,
        ..Default::default()
    };
    match adapter_type {
        AdapterType::Fscsi => {
            lun.scsi_id = hex(path_attrs.unwrap_or(attrs), "scsi_id")?;
            lun.lun_id = hex(attrs, "lun_id")?;
        }
        AdapterType::Iscsi => {
            lun.target_name = Some(attr(attrs, "target_name")?);
            lun.host_addr = Some(attr(attrs, "host_addr")?);
            lun.port = Some(hex(attrs, "port_num")?);
            lun.lun_id = hex(attrs, "lun_id")?;
        }
        _ => {}
    }
    Ok(lun)
}

/// Device configuration lookup through the ODM commands
#[derive(Debug, Default, Clone, Copy)]
pub struct OdmLookup;

impl OdmLookup {
    fn run(device: &str, program: &str, args: &[&str]) -> Result<String, Error> {
        debug!("running {program} {}", args.join(" "));
        let output = Command::new(program).args(args).output().map_err(|e| Error::Lookup {
            device: device.to_owned(),
            reason: format!("{program}: {e}"),
        })?;
        if !output.status.success() {
            return Err(Error::Lookup {
                device: device.to_owned(),
                reason: format!("{program}: {}", String::from_utf8_lossy(&output.stderr).trim()),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl DeviceConfigLookup for OdmLookup {
    fn lun_info(&self, device: &str, path_id: Option<u32>) -> Result<LunInfo, Error> {
        let path_id = path_id.map(|id| id.to_string());
        let parent = match &path_id {
            Some(id) => Self::run(device, "lspath", &["-l", device, "-i", id, "-F", "parent"])?,
            None => Self::run(device, "lsdev", &["-l", device, "-F", "parent"])?,
        };
        let parent = parent.lines().next().map(str::trim).unwrap_or_default();
        if parent.is_empty() {
            return Err(Error::Lookup {
                device: device.to_owned(),
                reason: "no parent adapter".to_owned(),
            });
        }

        let attrs = parse_attributes(&Self::run(device, "lsattr", &["-E", "-l", device, "-F", "attribute value"])?);
        let path_attrs = match &path_id {
            Some(id) if AdapterType::from_parent(parent) == AdapterType::Fscsi => Some(parse_attributes(&Self::run(
                device,
                "lspath",
                &["-A", "-E", "-l", device, "-p", parent, "-i", id, "-F", "attribute value"],
            )?)),
            _ => None,
        };

        lun_info_from(parent, &attrs, path_attrs.as_ref()).map_err(|reason| Error::Lookup {
            device: device.to_owned(),
            reason,
        })
    }
}

#[cfg(target_os = "aix")]
pub use native::{AixAdapters, Device, PassthruBackend};

#[cfg(target_os = "aix")]
mod native {
    use std::{
        fs::{File, OpenOptions},
        io,
        os::{fd::AsRawFd, unix::fs::OpenOptionsExt},
        path::{Path, PathBuf},
    };

    use log::{debug, error, warn};
    use nix::libc;

    use super::*;
    use crate::{
        backend::control_outcome,
        session::{self, AdapterControl, AdapterSession, StartState},
        status, DeviceHandle, FailureKind, OpenMode, Outcome, Platform, TransportBackend,
    };

    /// An open hdisk
    #[derive(Debug)]
    pub struct Device {
        file: File,
        path: PathBuf,
        disk: String,
    }

    impl DeviceHandle for Device {
        fn path(&self) -> &Path {
            &self.path
        }
    }

    /// Start and stop of AIX parent adapters
    #[derive(Debug, Default, Clone, Copy)]
    pub struct AixAdapters;

    impl AdapterControl for AixAdapters {
        type Adapter = File;

        fn open_adapter(&self, lun: &LunInfo) -> Result<File, Error> {
            let path = PathBuf::from("/dev").join(&lun.parent);
            OpenOptions::new()
                .read(true)
                .write(true)
                .open(&path)
                .map_err(|source| Error::Open { path, source })
        }

        fn start(&self, adapter: &mut File, lun: &LunInfo) -> Result<StartState, Error> {
            let mut sciop = sciolst(lun, ISSUE_LOGIN);
            let res = unsafe { libc::ioctl(adapter.as_raw_fd(), SCIOLSTART as _, &mut sciop) };
            if res < 0 {
                let err = io::Error::last_os_error();
                // iSCSI may leave SCSI_DEV_STARTED clear with errno still 0, commands then work
                if sciop.adap_set_flags & SCSI_DEV_STARTED == 0 && err.raw_os_error() != Some(0) {
                    return Err(Error::Adapter {
                        operation: "SCIOLSTART",
                        adapter: lun.parent.clone(),
                        source: err,
                    });
                }
            }
            Ok(StartState {
                already_started: sciop.adap_set_flags & SCSI_DEV_STARTED != 0,
                dynamic_tracking: sciop.adap_set_flags & SCIOL_DYNTRK_ENABLED != 0,
                world_wide_name: sciop.world_wide_name,
                node_name: sciop.node_name,
            })
        }

        fn stop(&self, adapter: &mut File, lun: &LunInfo) -> Result<(), Error> {
            let mut sciop = sciolst(lun, 0);
            let res = unsafe { libc::ioctl(adapter.as_raw_fd(), SCIOLSTOP as _, &mut sciop) };
            if res < 0 {
                return Err(Error::Adapter {
                    operation: "SCIOLSTOP",
                    adapter: lun.parent.clone(),
                    source: io::Error::last_os_error(),
                });
            }
            Ok(())
        }

        fn close(&self, adapter: File) {
            drop(adapter);
        }
    }

    /// DK_PASSTHRU pass-through
    #[derive(Debug, Default, Clone)]
    pub struct PassthruBackend<L: DeviceConfigLookup = OdmLookup> {
        lookup: L,
        adapters: AixAdapters,
    }

    impl PassthruBackend {
        pub fn new() -> Self {
            Self::default()
        }
    }

    impl<L: DeviceConfigLookup> PassthruBackend<L> {
        pub fn with_lookup(lookup: L) -> Self {
            Self {
                lookup,
                adapters: AixAdapters,
            }
        }

        fn session(&self, handle: &Device, path_id: Option<u32>) -> Result<AdapterSession<'_, AixAdapters>, Error> {
            let lun = self.lookup.lun_info(&handle.disk, path_id)?;
            AdapterSession::start(&self.adapters, lun)
        }

        /// Issues one SCIOL control request inside an adapter session
        fn session_control(&self, handle: &Device, operation: &'static str, request: i32, flags: u16) -> Outcome {
            let result = self.session(handle, None).and_then(|mut session| {
                let mut sciop = sciolst(session.lun(), flags);
                let res = match session.adapter() {
                    Some(adapter) => unsafe { libc::ioctl(adapter.as_raw_fd(), request as _, &mut sciop) },
                    None => 0,
                };
                let result = if res < 0 {
                    Err(Error::Adapter {
                        operation,
                        adapter: session.lun().parent.clone(),
                        source: io::Error::last_os_error(),
                    })
                } else {
                    Ok(())
                };
                session.finish().and(result)
            });
            match result {
                Ok(()) => control_outcome(operation, &handle.path, Ok(())),
                Err(err) => Outcome::Failure(FailureKind::Transport {
                    os_error: err.os_error(),
                    message: format!("{operation} failed on {}: {err}", handle.path.display()),
                }),
            }
        }

        fn submit_adapter(&self, handle: &Device, cmd: &CommandDescriptor) -> Result<NativeResult, Error> {
            let mut session = self.session(handle, cmd.mpio_path())?;
            let state = *session.state();
            let plan = plan(cmd, true, state.dynamic_tracking);

            let mut data = cmd.transfer_buffer();
            let mut sense = vec![0u8; cmd.requested_sense_length()];
            let mut spt = fill(cmd, plan, &mut data, &mut sense);
            spt.scsi_id = session.lun().scsi_id;
            spt.lun_id = session.lun().lun_id;
            if state.dynamic_tracking {
                spt.world_wide_name = state.world_wide_name;
                spt.node_name = state.node_name;
            }

            let res = match session.adapter() {
                Some(adapter) => unsafe { libc::ioctl(adapter.as_raw_fd(), SCIOCMD as _, &mut spt) },
                None => -1,
            };
            let os_error = (res < 0).then(|| io::Error::last_os_error());
            let parent = session.lun().parent.clone();
            if let Err(err) = session.finish() {
                warn!("{err}");
            }
            self.complete("SCIOCMD", &parent, &spt, res, os_error, cmd, sense, data)
        }

        #[allow(clippy::too_many_arguments)]
        fn complete(
            &self,
            operation: &'static str,
            device: &str,
            spt: &ScPassthru,
            res: i32,
            os_error: Option<io::Error>,
            cmd: &CommandDescriptor,
            sense: Vec<u8>,
            data: Vec<u8>,
        ) -> Result<NativeResult, Error> {
            let errno = os_error.as_ref().and_then(|e| e.raw_os_error());
            match decode(spt, res, errno, cmd, sense, data) {
                Some(native) => Ok(native),
                None => {
                    if errno == Some(libc::EINVAL) && cmd.logs_errors() {
                        error!(
                            "{operation} rejected on {device}: {}",
                            status::aix_einval_reason(spt.einval_arg as u32, false)
                        );
                    }
                    Err(Error::Transport {
                        operation,
                        device: device.to_owned(),
                        source: os_error.unwrap_or_else(|| io::Error::from_raw_os_error(libc::EIO)),
                    })
                }
            }
        }
    }

    impl<L: DeviceConfigLookup> TransportBackend for PassthruBackend<L> {
        type Handle = Device;

        fn platform(&self) -> Platform {
            Platform::Aix
        }

        fn open(&self, path: &Path, mode: OpenMode) -> Result<Device, Error> {
            let open = |write: bool| {
                OpenOptions::new()
                    .read(true)
                    .write(write)
                    .custom_flags(libc::O_NONBLOCK)
                    .open(path)
            };
            let file = match mode {
                OpenMode::Scan => open(false),
                OpenMode::ReadWrite => match open(true) {
                    Err(e) if e.raw_os_error() == Some(libc::EROFS) => {
                        warn!("{} is read-only, reopening without write access", path.display());
                        open(false)
                    }
                    other => other,
                },
            }
            .map_err(|source| Error::Open {
                path: path.to_path_buf(),
                source,
            })?;

            Ok(Device {
                file,
                path: path.to_path_buf(),
                disk: session::disk_name(path),
            })
        }

        fn submit(&self, handle: &mut Device, cmd: &CommandDescriptor) -> Result<NativeResult, Error> {
            cmd.check_cdb(self.platform().max_cdb_length())?;
            if cmd.transport_flags().contains(TransportFlags::ADAPTER) {
                return self.submit_adapter(handle, cmd);
            }

            let plan = plan(cmd, false, false);
            let mut data = cmd.transfer_buffer();
            let mut sense = vec![0u8; cmd.requested_sense_length()];
            let mut spt = fill(cmd, plan, &mut data, &mut sense);

            let fd = handle.file.as_raw_fd();
            let (operation, res) = match cmd.mpio_path() {
                None => ("DK_PASSTHRU", unsafe { libc::ioctl(fd, DK_PASSTHRU as _, &mut spt) }),
                Some(path_id) => {
                    let mut pcmd = ScdiskPathIoCmd {
                        path_id: path_id as u16,
                        size: std::mem::size_of::<ScPassthru>() as i32,
                        path_iocmd: (&mut spt as *mut ScPassthru).cast(),
                    };
                    ("DKPATHPASSTHRU", unsafe { libc::ioctl(fd, DKPATHPASSTHRU as _, &mut pcmd) })
                }
            };
            let os_error = (res < 0).then(|| io::Error::last_os_error());
            let device = handle.path.display().to_string();
            self.complete(operation, &device, &spt, res, os_error, cmd, sense, data)
        }

        fn reset_bus(&self, _handle: &mut Device) -> Outcome {
            Outcome::unsupported("SCSI reset bus", self.platform())
        }

        fn reset_controller(&self, _handle: &mut Device) -> Outcome {
            Outcome::unsupported("SCSI reset controller", self.platform())
        }

        fn reset_target(&self, handle: &mut Device) -> Outcome {
            debug!("issuing target reset to {}", handle.path.display());
            self.session_control(handle, "SCSI reset target (SCIOLRESET)", SCIOLRESET, 0)
        }

        fn reset_lun(&self, handle: &mut Device) -> Outcome {
            debug!("issuing LUN reset to {}", handle.path.display());
            self.session_control(handle, "SCSI reset LUN (SCIOLRESET)", SCIOLRESET, SCIOLRESET_LUN_RESET)
        }

        fn abort_task_set(&self, handle: &mut Device) -> Outcome {
            debug!("issuing abort task set to {}", handle.path.display());
            self.session_control(handle, "abort task set (SCIOLHALT)", SCIOLHALT, 0)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{status, QueueTag};
    use test_log::test;

    fn read(secs: u64) -> CommandDescriptor {
        CommandDescriptor::new([0x28, 0, 0, 0, 0, 0, 0, 0, 8, 0])
            .read(4096)
            .timeout(Duration::from_secs(secs))
    }

    #[test]
    fn test_mix_and_quiesce() {
        let p = plan(&read(30), false, false);
        assert_eq!((p.devflags, p.timeout_value, p.flags), (SC_MIX_IO, 30, B_READ));

        let p = plan(&read(120), false, false);
        assert_eq!((p.devflags, p.timeout_value), (SC_QUIESCE_IO, 120));

        let write = CommandDescriptor::new([0x2a; 10]).write(vec![0; 512]).timeout(Duration::from_secs(10));
        let p = plan(&write, false, false);
        assert_eq!((p.devflags, p.timeout_value, p.flags), (SC_QUIESCE_IO, 10, B_WRITE));

        // the adapter route carries the full timeout without quiescing
        let p = plan(&read(120), true, false);
        assert_eq!((p.devflags, p.timeout_value), (SC_MIX_IO, 120));
    }

    #[test]
    fn test_plan_fields() {
        let cmd = read(0).timeout(Duration::from_millis(500)).queue_tag(QueueTag::Ordered);
        let p = plan(&cmd, false, false);
        assert_eq!(p.timeout_value, 1);
        assert_eq!(p.q_tag_msg, 3);
        assert_eq!(p.version, SCSI_VERSION_2);
        assert_eq!(plan(&cmd, true, true).version, SCSI_VERSION_1);

        let cmd = CommandDescriptor::new([0u8; 6]).flags(TransportFlags::ASYNC | TransportFlags::NO_DISCONNECT);
        assert_eq!(plan(&cmd, false, false).flags, B_READ | SC_ASYNC);
        let cmd = CommandDescriptor::new([0u8; 6]).flags(TransportFlags::NO_DISCONNECT);
        assert_eq!(plan(&cmd, false, false).flags, B_READ | SC_NODISC);
    }

    #[test]
    fn test_fill_copies_cdb() {
        let cmd = read(30);
        let mut data = cmd.transfer_buffer();
        let mut sense = vec![0u8; 64];
        let spt = fill(&cmd, plan(&cmd, false, false), &mut data, &mut sense);
        assert_eq!(spt.command_length, 10);
        assert_eq!(spt.scsi_cdb[0], 0x28);
        assert_eq!(spt.scsi_cdb[8], 8);
        assert_eq!(spt.data_length, 4096);
        assert_eq!(spt.autosense_length, 64);
    }

    #[test]
    fn test_failed_ioctl_without_validity_is_transport() {
        let spt = ScPassthru::default();
        assert_eq!(decode(&spt, -1, Some(5), &read(30), vec![], vec![]), None);
    }

    #[test]
    fn test_failed_ioctl_with_check_condition() {
        let spt = ScPassthru {
            status_validity: StatusValidity::SCSI_ERROR.bits(),
            scsi_bus_status: status::SCSI_CHECK_CONDITION,
            residual: 4096,
            ..Default::default()
        };
        let native = decode(&spt, -1, Some(5), &read(30), vec![0x70; 18], vec![0; 4096]).unwrap();
        assert_eq!(native.sense.len(), 18);
        assert_eq!(native.os_error, Some(5));
        assert_eq!(native.data_resid, 4096);
        assert_eq!(native.einval_reason, None);
    }

    #[test]
    fn test_einval_reason_kept() {
        let spt = ScPassthru {
            status_validity: StatusValidity::ADAPTER_ERROR.bits(),
            adapter_status: 2,
            einval_arg: 17,
            ..Default::default()
        };
        let native = decode(&spt, -1, Some(EINVAL), &read(30), vec![], vec![]).unwrap();
        assert_eq!(native.einval_reason, Some(17));
        assert_eq!(native.host_status, 2);
        assert!(native.sense.is_empty());
    }

    #[test]
    fn test_sciolst_addressing() {
        let fc = LunInfo {
            parent: "fscsi1".into(),
            adapter_type: AdapterType::Fscsi,
            scsi_id: 0x10400,
            lun_id: 0x2000000000000,
            ..Default::default()
        };
        let sciop = sciolst(&fc, ISSUE_LOGIN);
        assert_eq!((sciop.version, sciop.flags), (SCSI_VERSION_1, ISSUE_LOGIN));
        assert_eq!((sciop.scsi_id, sciop.lun_id), (0x10400, 0x2000000000000));

        let iscsi = LunInfo {
            parent: "iscsi0".into(),
            adapter_type: AdapterType::Iscsi,
            lun_id: 0,
            target_name: Some("iqn.1992-04.com.emc:target0".into()),
            host_addr: Some("10.0.0.5".into()),
            port: Some(0xcbc),
            ..Default::default()
        };
        let sciop = sciolst(&iscsi, ISSUE_LOGIN);
        assert_eq!(sciop.scsi_id, 0);
        assert_eq!(sciop.parms.port_num, 0xcbc);
        assert_eq!(sciop.parms.location.addr_type, ISCSI_IPV4_ADDR);
        assert!(sciop.parms.name.starts_with(b"iqn.1992-04.com.emc:target0\0"));
    }

    #[test]
    fn test_lun_info_from_attributes() {
        let attrs = parse_attributes("lun_id 0x1000000000000\nscsi_id 0x10400\npvid none\nq_type simple\n");
        let lun = lun_info_from("fscsi0", &attrs, None).unwrap();
        assert_eq!(lun.adapter_type, AdapterType::Fscsi);
        assert_eq!((lun.scsi_id, lun.lun_id), (0x10400, 0x1000000000000));

        let path = parse_attributes("scsi_id 0x20400\nnode_name 0x5005076801000001\n");
        let lun = lun_info_from("fscsi0", &attrs, Some(&path)).unwrap();
        assert_eq!(lun.scsi_id, 0x20400);

        let err = lun_info_from("iscsi0", &attrs, None).unwrap_err();
        assert_eq!(err, "Didn't find target_name attribute");

        let lun = lun_info_from("vscsi0", &HashMap::new(), None).unwrap();
        assert_eq!(lun.adapter_type, AdapterType::Vscsi);
    }

    #[test]
    fn test_parse_hex() {
        assert_eq!(parse_hex("0x10400"), Some(0x10400));
        assert_eq!(parse_hex("cbc"), Some(0xcbc));
        assert_eq!(parse_hex("none"), None);
    }
}
