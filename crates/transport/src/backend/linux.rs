// SPDX-FileCopyrightText: Copyright © 2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Linux SCSI generic (SG_IO) backend

use std::{ffi::c_void, path::Path, ptr, time::Duration};

use crate::{outcome, CommandDescriptor, DataDirection, NativeResult, Nexus, TransportFlags};

pub const SG_IO: u32 = 0x2285;
pub const SG_GET_SCSI_ID: u32 = 0x2276;
pub const SG_SCSI_RESET: u32 = 0x2284;
pub const SCSI_IOCTL_GET_IDLUN: u32 = 0x5382;
pub const SCSI_IOCTL_GET_BUS_NUMBER: u32 = 0x5386;

pub const SG_SCSI_RESET_DEVICE: i32 = 1;
pub const SG_SCSI_RESET_BUS: i32 = 2;
pub const SG_SCSI_RESET_HOST: i32 = 3;
pub const SG_SCSI_RESET_TARGET: i32 = 4;

pub const SG_DXFER_NONE: i32 = -1;
pub const SG_DXFER_TO_DEV: i32 = -2;
pub const SG_DXFER_FROM_DEV: i32 = -3;

pub const SG_FLAG_DIRECT_IO: u32 = 1;

/// Largest sense buffer `mx_sb_len` can describe
const MAX_SENSE_LENGTH: usize = u8::MAX as usize;

/// Prefix of SCSI generic device nodes
pub const SG_PATH_PREFIX: &str = "/dev/sg";

/// `struct sg_io_hdr` from scsi/sg.h
#[repr(C)]
#[derive(Debug)]
pub struct SgIoHdr {
    pub interface_id: i32,
    pub dxfer_direction: i32,
    pub cmd_len: u8,
    pub mx_sb_len: u8,
    pub iovec_count: u16,
    pub dxfer_len: u32,
    pub dxferp: *mut c_void,
    pub cmdp: *mut u8,
    pub sbp: *mut u8,
    pub timeout: u32,
    pub flags: u32,
    pub pack_id: i32,
    pub usr_ptr: *mut c_void,
    pub status: u8,
    pub masked_status: u8,
    pub msg_status: u8,
    pub sb_len_wr: u8,
    pub host_status: u16,
    pub driver_status: u16,
    pub resid: i32,
    pub duration: u32,
    pub info: u32,
}

impl Default for SgIoHdr {
    fn default() -> Self {
        Self {
            interface_id: 'S' as i32,
            dxfer_direction: SG_DXFER_NONE,
            cmd_len: 0,
            mx_sb_len: 0,
            iovec_count: 0,
            dxfer_len: 0,
            dxferp: ptr::null_mut(),
            cmdp: ptr::null_mut(),
            sbp: ptr::null_mut(),
            timeout: 0,
            flags: 0,
            pack_id: 0,
            usr_ptr: ptr::null_mut(),
            status: 0,
            masked_status: 0,
            msg_status: 0,
            sb_len_wr: 0,
            host_status: 0,
            driver_status: 0,
            resid: 0,
            duration: 0,
            info: 0,
        }
    }
}

/// `struct sg_scsi_id` from scsi/sg.h
#[repr(C)]
#[derive(Debug, Default)]
pub struct SgScsiId {
    pub host_no: i32,
    pub channel: i32,
    pub scsi_id: i32,
    pub lun: i32,
    pub scsi_type: i32,
    pub h_cmd_per_lun: i16,
    pub d_queue_depth: i16,
    pub unused: [i32; 2],
}

/// `struct scsi_idlun` used by SCSI_IOCTL_GET_IDLUN
#[repr(C)]
#[derive(Debug, Default)]
pub struct ScsiIdLun {
    pub dev_id: i32,
    pub host_unique_id: i32,
}

pub fn dxfer_direction(direction: DataDirection) -> i32 {
    match direction {
        DataDirection::None => SG_DXFER_NONE,
        DataDirection::Read => SG_DXFER_FROM_DEV,
        DataDirection::Write => SG_DXFER_TO_DEV,
    }
}

/// Whether the device node is a SCSI generic device
pub fn is_sg_device(path: &Path) -> bool {
    path.to_str().is_some_and(|p| p.starts_with(SG_PATH_PREFIX))
}

/// The node SG_IO is issued on: the generic alias when one was mapped
pub fn command_path<'a>(path: &'a Path, scsi_path: Option<&'a Path>) -> &'a Path {
    scsi_path.filter(|sg| is_sg_device(sg)).unwrap_or(path)
}

/// Block devices are opened with O_DIRECT, generic devices reject it
pub fn wants_direct_io(path: &Path) -> bool {
    !is_sg_device(path)
}

/// Fills in an SG_IO request
///
/// The returned header borrows the three buffers through raw pointers and
/// must not outlive them.
pub fn request(cmd: &CommandDescriptor, cdb: &mut [u8], data: &mut [u8], sense: &mut [u8]) -> SgIoHdr {
    let mut hdr = SgIoHdr {
        dxfer_direction: dxfer_direction(cmd.direction()),
        cmd_len: cdb.len() as u8,
        cmdp: cdb.as_mut_ptr(),
        mx_sb_len: sense.len().min(MAX_SENSE_LENGTH) as u8,
        sbp: sense.as_mut_ptr(),
        timeout: u32::try_from(cmd.timeout_value().as_millis()).unwrap_or(u32::MAX),
        ..Default::default()
    };
    if !data.is_empty() {
        hdr.dxferp = data.as_mut_ptr().cast();
        hdr.dxfer_len = data.len() as u32;
    }
    if cmd.transport_flags().contains(TransportFlags::DIRECT_IO) {
        hdr.flags |= SG_FLAG_DIRECT_IO;
    }
    hdr
}

/// Collects the completed request fields
///
/// Sense bytes are kept only for a CHECK CONDITION with sense written.
pub fn decode(hdr: &SgIoHdr, cmd: &CommandDescriptor, mut sense: Vec<u8>, mut data: Vec<u8>) -> NativeResult {
    let data_resid = hdr.resid.max(0) as u32;
    if hdr.status == crate::status::SCSI_CHECK_CONDITION && hdr.sb_len_wr > 0 {
        sense.truncate(hdr.sb_len_wr as usize);
    } else {
        sense.clear();
    }
    match cmd.direction() {
        DataDirection::Read => data.truncate(outcome::transferred(cmd.data_length(), data_resid)),
        _ => data.clear(),
    }
    NativeResult {
        scsi_status: hdr.status,
        host_status: hdr.host_status,
        driver_status: hdr.driver_status,
        data_resid,
        sense,
        data,
        duration: Some(Duration::from_millis(hdr.duration as u64)),
        ..Default::default()
    }
}

/// Builds the nexus from SCSI_IOCTL_GET_BUS_NUMBER and SCSI_IOCTL_GET_IDLUN
pub fn nexus_from_idlun(bus: i32, idlun: &ScsiIdLun) -> Nexus {
    Nexus {
        bus: bus as u32,
        channel: ((idlun.dev_id >> 16) & 0xff) as u32,
        target: (idlun.dev_id & 0xff) as u32,
        lun: ((idlun.dev_id >> 8) & 0xff) as u64,
    }
}

pub fn matches_scsi_id(nexus: &Nexus, id: &SgScsiId) -> bool {
    id.host_no as u32 == nexus.bus
        && id.channel as u32 == nexus.channel
        && id.scsi_id as u32 == nexus.target
        && id.lun as u64 == nexus.lun
}

#[cfg(target_os = "linux")]
pub use native::{Device, SgBackend};

#[cfg(target_os = "linux")]
mod native {
    use std::{
        fs::{self, File, OpenOptions},
        io,
        os::{
            fd::AsRawFd,
            unix::fs::{FileExt, OpenOptionsExt},
        },
        path::{Path, PathBuf},
    };

    use linux_raw_sys::ioctl::BLKSSZGET;
    use log::{debug, warn};
    use nix::libc;

    use super::*;
    use crate::{
        backend::{control_outcome, display_path},
        DeviceHandle, Error, OpenMode, Outcome, Platform, TransportBackend,
    };

    const DEVFS_DIR: &str = "/dev";
    const FAILOVER_BLOCK_SIZE: usize = 4096;
    const PAGE_ALIGNMENT: usize = 4096;

    /// An open SCSI device
    ///
    /// `file` is opened on [`command_path`], failover goes through `path`.
    #[derive(Debug)]
    pub struct Device {
        file: File,
        path: PathBuf,
        scsi_path: Option<PathBuf>,
        read_only: bool,
    }

    impl Device {
        pub fn is_read_only(&self) -> bool {
            self.read_only
        }
    }

    impl DeviceHandle for Device {
        fn path(&self) -> &Path {
            &self.path
        }

        fn scsi_path(&self) -> Option<&Path> {
            self.scsi_path.as_deref()
        }
    }

    /// SG_IO pass-through
    #[derive(Debug, Default, Clone)]
    pub struct SgBackend {
        map_sg: bool,
    }

    impl SgBackend {
        pub fn new() -> Self {
            Self::default()
        }

        /// Resolve the `/dev/sgN` alias of each block device on open
        pub fn with_sg_mapping(mut self, map_sg: bool) -> Self {
            self.map_sg = map_sg;
            self
        }

        fn open_file(path: &Path, write: bool, flags: i32) -> io::Result<File> {
            OpenOptions::new().read(true).write(write).custom_flags(flags).open(path)
        }

        /// Scans /dev/sg* for the node with the same nexus
        fn find_sg_alias(nexus: &Nexus) -> Option<PathBuf> {
            let entries = fs::read_dir(DEVFS_DIR).ok()?;
            entries
                .filter_map(Result::ok)
                .map(|e| e.path())
                .filter(|p| {
                    p.file_name()
                        .and_then(|n| n.to_str())
                        .and_then(|n| n.strip_prefix("sg"))
                        .is_some_and(|n| !n.is_empty() && n.chars().all(|c| c.is_ascii_digit()))
                })
                .find(|p| {
                    let Ok(file) = Self::open_file(p, false, libc::O_NONBLOCK) else {
                        return false;
                    };
                    let mut id = SgScsiId::default();
                    let res = unsafe { libc::ioctl(file.as_raw_fd(), SG_GET_SCSI_ID as _, &mut id) };
                    res == 0 && matches_scsi_id(nexus, &id)
                })
        }

        fn sg_reset(&self, handle: &Device, operation: &str, mut arg: i32) -> Outcome {
            let res = unsafe { libc::ioctl(handle.file.as_raw_fd(), SG_SCSI_RESET as _, &mut arg) };
            let result = if res < 0 { Err(io::Error::last_os_error()) } else { Ok(()) };
            control_outcome(operation, &display_path(handle), result)
        }
    }

    impl TransportBackend for SgBackend {
        type Handle = Device;

        fn platform(&self) -> Platform {
            Platform::Linux
        }

        fn open(&self, path: &Path, mode: OpenMode) -> Result<Device, Error> {
            let open_error = |source| Error::Open {
                path: path.to_path_buf(),
                source,
            };

            let (file, read_only) = match mode {
                OpenMode::Scan => (
                    Self::open_file(path, false, libc::O_NONBLOCK).map_err(open_error)?,
                    true,
                ),
                OpenMode::ReadWrite => {
                    let flags = if wants_direct_io(path) {
                        libc::O_NONBLOCK | libc::O_DIRECT
                    } else {
                        libc::O_NONBLOCK
                    };
                    match Self::open_file(path, true, flags) {
                        Ok(file) => (file, false),
                        Err(e) if e.raw_os_error() == Some(libc::EROFS) => {
                            warn!("{} is read-only, reopening without write access", path.display());
                            (Self::open_file(path, false, flags).map_err(open_error)?, true)
                        }
                        Err(e) => return Err(open_error(e)),
                    }
                }
            };

            let mut device = Device {
                file,
                path: path.to_path_buf(),
                scsi_path: None,
                read_only,
            };
            if self.map_sg && !is_sg_device(path) {
                let alias = self.scsi_address(&device).and_then(|nexus| Self::find_sg_alias(&nexus));
                let command = command_path(path, alias.as_deref());
                if command != path {
                    match Self::open_file(command, !read_only, libc::O_NONBLOCK) {
                        Ok(file) => {
                            debug!("{} maps to {}", path.display(), command.display());
                            device.file = file;
                            device.scsi_path = alias;
                        }
                        Err(e) => warn!("Cannot open {}, using {}: {e}", command.display(), path.display()),
                    }
                }
            }
            Ok(device)
        }

        fn submit(&self, handle: &mut Device, cmd: &CommandDescriptor) -> Result<NativeResult, Error> {
            cmd.check_cdb(self.platform().max_cdb_length())?;

            let mut cdb = cmd.cdb().to_vec();
            let mut data = cmd.transfer_buffer();
            let mut sense = vec![0u8; cmd.requested_sense_length().min(MAX_SENSE_LENGTH)];
            let mut hdr = request(cmd, &mut cdb, &mut data, &mut sense);

            let res = unsafe { libc::ioctl(handle.file.as_raw_fd(), SG_IO as _, &mut hdr) };
            if res < 0 {
                return Err(Error::Transport {
                    operation: "SCSI request (SG_IO)",
                    device: display_path(&*handle).display().to_string(),
                    source: io::Error::last_os_error(),
                });
            }

            Ok(decode(&hdr, cmd, sense, data))
        }

        fn reset_bus(&self, handle: &mut Device) -> Outcome {
            self.sg_reset(handle, "SCSI reset bus (SG_SCSI_RESET_BUS)", SG_SCSI_RESET_BUS)
        }

        fn reset_controller(&self, handle: &mut Device) -> Outcome {
            self.sg_reset(handle, "SCSI reset controller (SG_SCSI_RESET_HOST)", SG_SCSI_RESET_HOST)
        }

        fn reset_target(&self, handle: &mut Device) -> Outcome {
            self.sg_reset(handle, "SCSI reset target (SG_SCSI_RESET_TARGET)", SG_SCSI_RESET_TARGET)
        }

        fn reset_lun(&self, handle: &mut Device) -> Outcome {
            self.sg_reset(handle, "SCSI reset device (SG_SCSI_RESET_DEVICE)", SG_SCSI_RESET_DEVICE)
        }

        fn abort_task_set(&self, _handle: &mut Device) -> Outcome {
            Outcome::unsupported("abort task set", self.platform())
        }

        fn scsi_address(&self, handle: &Device) -> Option<Nexus> {
            let fd = handle.file.as_raw_fd();

            let mut bus: i32 = 0;
            let res = unsafe { libc::ioctl(fd, SCSI_IOCTL_GET_BUS_NUMBER as _, &mut bus) };
            if res < 0 {
                debug!(
                    "SCSI_IOCTL_GET_BUS_NUMBER failed on {}: {}",
                    handle.path.display(),
                    io::Error::last_os_error()
                );
                return None;
            }

            let mut idlun = ScsiIdLun::default();
            let res = unsafe { libc::ioctl(fd, SCSI_IOCTL_GET_IDLUN as _, &mut idlun) };
            if res < 0 {
                debug!(
                    "SCSI_IOCTL_GET_IDLUN failed on {}: {}",
                    handle.path.display(),
                    io::Error::last_os_error()
                );
                return None;
            }

            Some(nexus_from_idlun(bus, &idlun))
        }

        /// Reads one block through the block layer
        ///
        /// Pass-through requests never make device-mapper multipath switch
        /// paths, ordinary reads do.
        fn force_failover(&self, handle: &Device) -> io::Result<()> {
            if is_sg_device(&handle.path) {
                return Ok(());
            }
            let file = Self::open_file(&handle.path, false, libc::O_NONBLOCK | libc::O_DIRECT)?;

            let mut size: libc::c_int = 0;
            let res = unsafe { libc::ioctl(file.as_raw_fd(), BLKSSZGET as _, &mut size) };
            let block = if res < 0 || size <= 0 {
                FAILOVER_BLOCK_SIZE
            } else {
                size as usize
            };

            let mut buffer = vec![0u8; block + PAGE_ALIGNMENT];
            let offset = buffer.as_ptr().align_offset(PAGE_ALIGNMENT);
            debug!("reading {block} bytes at lba 0 of {} to force path failover", handle.path.display());
            file.read_at(&mut buffer[offset..offset + block], 0)?;
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn test_request_layout() {
        let cmd = CommandDescriptor::new([0x12, 0, 0, 0, 36, 0])
            .read(36)
            .timeout(Duration::from_secs(5))
            .flags(TransportFlags::DIRECT_IO);
        let mut cdb = cmd.cdb().to_vec();
        let mut data = cmd.transfer_buffer();
        let mut sense = vec![0u8; 300];
        let hdr = request(&cmd, &mut cdb, &mut data, &mut sense);

        assert_eq!(hdr.interface_id, 'S' as i32);
        assert_eq!(hdr.dxfer_direction, SG_DXFER_FROM_DEV);
        assert_eq!(hdr.cmd_len, 6);
        assert_eq!(hdr.dxfer_len, 36);
        assert_eq!(hdr.mx_sb_len, 255);
        assert_eq!(hdr.timeout, 5000);
        assert_eq!(hdr.flags, SG_FLAG_DIRECT_IO);
    }

    #[test]
    fn test_no_data_request() {
        let cmd = CommandDescriptor::new([0u8; 6]);
        let hdr = request(&cmd, &mut [0u8; 6], &mut [], &mut [0u8; 32]);
        assert_eq!(hdr.dxfer_direction, SG_DXFER_NONE);
        assert!(hdr.dxferp.is_null());
        assert_eq!(hdr.dxfer_len, 0);
    }

    #[test]
    fn test_decode_check_condition() {
        let cmd = CommandDescriptor::new([0x12, 1, 0x83, 0, 255, 0]).read(255);
        let hdr = SgIoHdr {
            status: crate::status::SCSI_CHECK_CONDITION,
            sb_len_wr: 18,
            driver_status: 0x08,
            resid: 255,
            duration: 3,
            ..Default::default()
        };
        let native = decode(&hdr, &cmd, vec![0x70; 255], vec![0; 255]);
        assert_eq!(native.sense.len(), 18);
        assert_eq!(native.data_resid, 255);
        assert!(native.data.is_empty());
        assert_eq!(native.duration, Some(Duration::from_millis(3)));
    }

    #[test]
    fn test_decode_oversized_residual() {
        let cmd = CommandDescriptor::new([0x12, 0, 0, 0, 0xff, 0]).read(36);
        let hdr = SgIoHdr {
            resid: 219,
            ..Default::default()
        };
        let native = decode(&hdr, &cmd, vec![0; 32], vec![0xab; 36]);
        assert!(native.sense.is_empty());
        assert_eq!(native.data.len(), 36);
    }

    #[test]
    fn test_nexus_from_idlun() {
        // host 2, channel 0, lun 3, target 5
        let idlun = ScsiIdLun {
            dev_id: (2 << 24) | (3 << 8) | 5,
            host_unique_id: 7,
        };
        let nexus = nexus_from_idlun(2, &idlun);
        assert_eq!(
            nexus,
            Nexus {
                bus: 2,
                channel: 0,
                target: 5,
                lun: 3
            }
        );
        let id = SgScsiId {
            host_no: 2,
            scsi_id: 5,
            lun: 3,
            ..Default::default()
        };
        assert!(matches_scsi_id(&nexus, &id));
    }

    #[test]
    fn test_command_path() {
        let block = Path::new("/dev/sdc");
        assert_eq!(command_path(block, Some(Path::new("/dev/sg2"))), Path::new("/dev/sg2"));
        assert_eq!(command_path(block, None), block);
        assert_eq!(command_path(block, Some(Path::new("/dev/mapper/mpatha"))), block);
    }

    #[test]
    fn test_direct_io_paths() {
        assert!(wants_direct_io(Path::new("/dev/sda")));
        assert!(wants_direct_io(Path::new("/dev/mapper/mpatha")));
        assert!(!wants_direct_io(Path::new("/dev/sg3")));
    }
}
