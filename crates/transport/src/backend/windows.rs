// SPDX-FileCopyrightText: Copyright © 2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Windows IOCTL_SCSI_PASS_THROUGH_DIRECT backend

use std::{ffi::c_void, mem, ptr};

use crate::{outcome, CommandDescriptor, DataDirection, NativeResult};

pub const IOCTL_SCSI_PASS_THROUGH_DIRECT: u32 = 0x4d014;
pub const IOCTL_SCSI_GET_ADDRESS: u32 = 0x41018;
pub const IOCTL_STORAGE_RESET_BUS: u32 = 0x2d5000;

pub const SCSI_IOCTL_DATA_OUT: u8 = 0;
pub const SCSI_IOCTL_DATA_IN: u8 = 1;
pub const SCSI_IOCTL_DATA_UNSPECIFIED: u8 = 2;

/// Hidden device directory prefix
pub const DEVICE_PREFIX: &str = r"\\.\";

const SENSE_BUFFER_LENGTH: usize = u8::MAX as usize;

/// `SCSI_PASS_THROUGH_DIRECT` from ntddscsi.h
#[repr(C)]
#[derive(Debug)]
pub struct ScsiPassThroughDirect {
    pub length: u16,
    pub scsi_status: u8,
    pub path_id: u8,
    pub target_id: u8,
    pub lun: u8,
    pub cdb_length: u8,
    pub sense_info_length: u8,
    pub data_in: u8,
    pub data_transfer_length: u32,
    pub timeout_value: u32,
    pub data_buffer: *mut c_void,
    pub sense_info_offset: u32,
    pub cdb: [u8; 16],
}

/// The request followed by its sense buffer
#[repr(C)]
#[derive(Debug)]
pub struct SptdWithSense {
    pub spt: ScsiPassThroughDirect,
    pub filler: u32,
    pub sense: [u8; SENSE_BUFFER_LENGTH],
}

/// `SCSI_ADDRESS` from ntddscsi.h
#[repr(C)]
#[derive(Debug, Default)]
pub struct ScsiAddress {
    pub length: u32,
    pub port_number: u8,
    pub path_id: u8,
    pub target_id: u8,
    pub lun: u8,
}

/// `STORAGE_BUS_RESET_REQUEST` from ntddstor.h
#[repr(C)]
#[derive(Debug, Default)]
pub struct StorageBusResetRequest {
    pub path_id: u8,
}

/// Adds the `\\.\` prefix to bare device names such as `PhysicalDrive1`
pub fn device_path(name: &str) -> String {
    if name.starts_with(DEVICE_PREFIX) {
        name.to_owned()
    } else {
        format!("{DEVICE_PREFIX}{name}")
    }
}

pub fn data_in(direction: DataDirection) -> u8 {
    match direction {
        DataDirection::None => SCSI_IOCTL_DATA_UNSPECIFIED,
        DataDirection::Read => SCSI_IOCTL_DATA_IN,
        DataDirection::Write => SCSI_IOCTL_DATA_OUT,
    }
}

/// Fills in a request; the data pointer borrows `data`
pub fn fill(cmd: &CommandDescriptor, data: &mut [u8]) -> SptdWithSense {
    let len = cmd.cdb().len().min(16);
    let mut cdb = [0u8; 16];
    cdb[..len].copy_from_slice(&cmd.cdb()[..len]);

    SptdWithSense {
        spt: ScsiPassThroughDirect {
            length: mem::size_of::<ScsiPassThroughDirect>() as u16,
            scsi_status: 0,
            path_id: 0,
            target_id: 0,
            lun: 0,
            cdb_length: len as u8,
            sense_info_length: cmd.requested_sense_length().min(SENSE_BUFFER_LENGTH) as u8,
            data_in: data_in(cmd.direction()),
            data_transfer_length: data.len() as u32,
            timeout_value: u32::try_from(cmd.timeout_value().as_secs()).unwrap_or(u32::MAX).max(1),
            data_buffer: if data.is_empty() {
                ptr::null_mut()
            } else {
                data.as_mut_ptr().cast()
            },
            sense_info_offset: mem::offset_of!(SptdWithSense, sense) as u32,
            cdb,
        },
        filler: 0,
        sense: [0; SENSE_BUFFER_LENGTH],
    }
}

/// Collects the completed request fields
///
/// Windows reports the bytes moved rather than a residual, and copies sense
/// only for a CHECK CONDITION.
pub fn decode(sptwb: &SptdWithSense, cmd: &CommandDescriptor, mut data: Vec<u8>) -> NativeResult {
    let spt = &sptwb.spt;
    let data_resid = (cmd.data_length() as u32).saturating_sub(spt.data_transfer_length);
    let sense = if spt.scsi_status == crate::status::SCSI_CHECK_CONDITION {
        let len = (spt.sense_info_length as usize).min(cmd.requested_sense_length());
        sptwb.sense[..len].to_vec()
    } else {
        Vec::new()
    };
    match cmd.direction() {
        DataDirection::Read => data.truncate(outcome::transferred(cmd.data_length(), data_resid)),
        _ => data.clear(),
    }
    NativeResult {
        scsi_status: spt.scsi_status,
        data_resid,
        sense,
        data,
        ..Default::default()
    }
}

/// Device names from `wmic diskdrive get DeviceID` output
pub fn parse_disk_inventory(output: &str) -> Vec<String> {
    output
        .lines()
        .skip(1)
        .filter_map(|line| line.split([' ', '\r']).next())
        .filter(|name| !name.is_empty())
        .map(str::to_owned)
        .collect()
}

#[cfg(windows)]
pub use native::{Device, SptdBackend};

#[cfg(windows)]
mod native {
    use std::{
        ffi::CString,
        io, mem,
        path::{Path, PathBuf},
        ptr,
    };

    use log::{debug, warn};
    use winapi::{
        shared::{minwindef::DWORD, winerror::ERROR_WRITE_PROTECT},
        um::{
            fileapi::{CreateFileA, OPEN_EXISTING},
            handleapi::{CloseHandle, INVALID_HANDLE_VALUE},
            ioapiset::DeviceIoControl,
            winnt::{FILE_ATTRIBUTE_NORMAL, FILE_SHARE_READ, FILE_SHARE_WRITE, GENERIC_READ, GENERIC_WRITE, HANDLE},
        },
    };

    use super::*;
    use crate::{
        backend::control_outcome, DeviceHandle, Error, Nexus, OpenMode, Outcome, Platform, TransportBackend,
    };

    /// An open physical drive
    #[derive(Debug)]
    pub struct Device {
        handle: HANDLE,
        path: PathBuf,
        read_only: bool,
    }

    impl Device {
        pub fn is_read_only(&self) -> bool {
            self.read_only
        }

        /// DeviceIoControl with optional in and out buffers
        fn control(&self, code: u32, input: Buffer, output: Buffer) -> io::Result<()> {
            let mut returned: DWORD = 0;
            let ok = unsafe {
                DeviceIoControl(
                    self.handle,
                    code,
                    input.0.cast(),
                    input.1,
                    output.0.cast(),
                    output.1,
                    &mut returned,
                    ptr::null_mut(),
                )
            };
            if ok == 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        }
    }

    type Buffer = (*mut c_void, DWORD);

    const NO_BUFFER: Buffer = (ptr::null_mut(), 0);

    fn buffer<T>(value: &mut T) -> Buffer {
        ((value as *mut T).cast(), mem::size_of::<T>() as DWORD)
    }

    impl Drop for Device {
        fn drop(&mut self) {
            if unsafe { CloseHandle(self.handle) } == 0 {
                warn!("CloseHandle() of {} failed: {}", self.path.display(), io::Error::last_os_error());
            }
        }
    }

    impl DeviceHandle for Device {
        fn path(&self) -> &Path {
            &self.path
        }
    }

    /// IOCTL_SCSI_PASS_THROUGH_DIRECT pass-through
    #[derive(Debug, Default, Clone, Copy)]
    pub struct SptdBackend;

    impl SptdBackend {
        pub fn new() -> Self {
            Self
        }

        fn create(path: &CString, access: u32, share: u32) -> io::Result<HANDLE> {
            let handle = unsafe {
                CreateFileA(
                    path.as_ptr(),
                    access,
                    share,
                    ptr::null_mut(),
                    OPEN_EXISTING,
                    FILE_ATTRIBUTE_NORMAL,
                    ptr::null_mut(),
                )
            };
            if handle == INVALID_HANDLE_VALUE {
                return Err(io::Error::last_os_error());
            }
            Ok(handle)
        }
    }

    impl TransportBackend for SptdBackend {
        type Handle = Device;

        fn platform(&self) -> Platform {
            Platform::Windows
        }

        fn open(&self, path: &Path, mode: OpenMode) -> Result<Device, Error> {
            let full = PathBuf::from(device_path(&path.to_string_lossy()));
            let open_error = |source| Error::Open {
                path: full.clone(),
                source,
            };
            let name = CString::new(full.to_string_lossy().as_bytes())
                .map_err(|e| open_error(io::Error::new(io::ErrorKind::InvalidInput, e)))?;

            debug!("opening device {}", full.display());
            let (handle, read_only) = match mode {
                OpenMode::Scan => (
                    Self::create(&name, GENERIC_READ, FILE_SHARE_READ | FILE_SHARE_WRITE).map_err(open_error)?,
                    true,
                ),
                OpenMode::ReadWrite => match Self::create(
                    &name,
                    GENERIC_READ | GENERIC_WRITE,
                    FILE_SHARE_READ | FILE_SHARE_WRITE,
                ) {
                    Ok(handle) => (handle, false),
                    Err(e) if e.raw_os_error() == Some(ERROR_WRITE_PROTECT as i32) => {
                        warn!("{} is write protected, opening read-only", full.display());
                        (
                            Self::create(&name, GENERIC_READ, FILE_SHARE_READ).map_err(open_error)?,
                            true,
                        )
                    }
                    Err(e) => return Err(open_error(e)),
                },
            };

            Ok(Device {
                handle,
                path: full,
                read_only,
            })
        }

        fn submit(&self, handle: &mut Device, cmd: &CommandDescriptor) -> Result<NativeResult, Error> {
            cmd.check_cdb(self.platform().max_cdb_length())?;

            let mut data = cmd.transfer_buffer();
            let mut sptwb = fill(cmd, &mut data);
            let request = buffer(&mut sptwb);
            handle
                .control(IOCTL_SCSI_PASS_THROUGH_DIRECT, request, request)
                .map_err(|source| Error::Transport {
                    operation: "SCSI request (IOCTL_SCSI_PASS_THROUGH_DIRECT)",
                    device: handle.path.display().to_string(),
                    source,
                })?;

            Ok(decode(&sptwb, cmd, data))
        }

        fn reset_bus(&self, handle: &mut Device) -> Outcome {
            let mut request = StorageBusResetRequest {
                path_id: self.scsi_address(handle).map(|n| n.channel as u8).unwrap_or_default(),
            };
            let result = handle.control(IOCTL_STORAGE_RESET_BUS, buffer(&mut request), NO_BUFFER);
            control_outcome("SCSI reset bus (IOCTL_STORAGE_RESET_BUS)", &handle.path, result)
        }

        fn reset_controller(&self, _handle: &mut Device) -> Outcome {
            Outcome::unsupported("SCSI reset controller", self.platform())
        }

        fn reset_target(&self, _handle: &mut Device) -> Outcome {
            Outcome::unsupported("SCSI reset target", self.platform())
        }

        fn reset_lun(&self, _handle: &mut Device) -> Outcome {
            Outcome::unsupported("SCSI reset LUN", self.platform())
        }

        fn abort_task_set(&self, _handle: &mut Device) -> Outcome {
            Outcome::unsupported("abort task set", self.platform())
        }

        fn scsi_address(&self, handle: &Device) -> Option<Nexus> {
            let mut address = ScsiAddress {
                length: mem::size_of::<ScsiAddress>() as u32,
                ..Default::default()
            };
            match handle.control(IOCTL_SCSI_GET_ADDRESS, NO_BUFFER, buffer(&mut address)) {
                Ok(()) => Some(Nexus {
                    bus: address.port_number as u32,
                    channel: address.path_id as u32,
                    target: address.target_id as u32,
                    lun: address.lun as u64,
                }),
                Err(e) => {
                    debug!("IOCTL_SCSI_GET_ADDRESS failed on {}: {e}", handle.path.display());
                    None
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use test_log::test;

    #[test]
    fn test_device_path() {
        assert_eq!(device_path("PhysicalDrive1"), r"\\.\PhysicalDrive1");
        assert_eq!(device_path(r"\\.\PhysicalDrive0"), r"\\.\PhysicalDrive0");
    }

    #[test]
    fn test_fill() {
        let cmd = CommandDescriptor::new([0x12, 0, 0, 0, 96, 0])
            .read(96)
            .sense_length(32)
            .timeout(Duration::from_millis(200));
        let mut data = cmd.transfer_buffer();
        let sptwb = fill(&cmd, &mut data);
        assert_eq!(sptwb.spt.data_in, SCSI_IOCTL_DATA_IN);
        assert_eq!(sptwb.spt.cdb_length, 6);
        assert_eq!(sptwb.spt.timeout_value, 1);
        assert_eq!(sptwb.spt.sense_info_length, 32);
        assert_eq!(sptwb.spt.data_transfer_length, 96);
        assert_eq!(sptwb.spt.sense_info_offset as usize, mem::offset_of!(SptdWithSense, sense));
        assert_eq!(data_in(DataDirection::None), SCSI_IOCTL_DATA_UNSPECIFIED);
    }

    #[test]
    fn test_decode_short_transfer() {
        let cmd = CommandDescriptor::new([0x12, 0, 0, 0, 96, 0]).read(96);
        let mut data = cmd.transfer_buffer();
        let mut sptwb = fill(&cmd, &mut data);
        sptwb.spt.data_transfer_length = 36;
        let native = decode(&sptwb, &cmd, data);
        assert_eq!(native.data_resid, 60);
        assert_eq!(native.data.len(), 36);
        assert!(native.sense.is_empty());
    }

    #[test]
    fn test_decode_check_condition_copies_sense() {
        let cmd = CommandDescriptor::new([0u8; 6]).sense_length(18);
        let mut sptwb = fill(&cmd, &mut []);
        sptwb.spt.scsi_status = crate::status::SCSI_CHECK_CONDITION;
        sptwb.sense[0] = 0x70;
        sptwb.sense[2] = 0x06;
        let native = decode(&sptwb, &cmd, Vec::new());
        assert_eq!(native.sense.len(), 18);
        assert_eq!(native.sense[2], 0x06);
    }

    #[test]
    fn test_parse_disk_inventory() {
        let output = "DeviceID            \r\n\\\\.\\PHYSICALDRIVE0    \r\n\\\\.\\PHYSICALDRIVE1    \r\n\r\n";
        assert_eq!(
            parse_disk_inventory(output),
            vec![r"\\.\PHYSICALDRIVE0".to_owned(), r"\\.\PHYSICALDRIVE1".to_owned()]
        );
    }
}
