// SPDX-FileCopyrightText: Copyright © 2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Device namespaces searched by a scan

use std::path::{Path, PathBuf};

use transport::Platform;

/// Linux device-mapper multipath devices
pub const DM_MP_DEVICE: &str = "DM-MP Device";
/// Linux block device
pub const LINUX_DEVICE: &str = "Linux Device";
/// Linux SCSI generic device
pub const SCSI_DEVICE: &str = "SCSI Device";
/// Raw disk device path
pub const DEVICE_PATH: &str = "Device Path";

/// Inventory command listing disks where no device directory exists
pub const WINDOWS_INVENTORY: (&str, &[&str]) = ("wmic", &["diskdrive", "get", "DeviceID"]);

/// One directory searched for devices
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanRoot {
    pub dir: PathBuf,
    /// Only names starting with this prefix are considered
    pub prefix: Option<String>,
    /// Device path type label
    pub kind: &'static str,
    /// Searched without `all_device_paths`
    pub default_scan: bool,
}

impl ScanRoot {
    pub fn new(dir: impl Into<PathBuf>, prefix: Option<&str>, kind: &'static str, default_scan: bool) -> Self {
        Self {
            dir: dir.into(),
            prefix: prefix.map(str::to_owned),
            kind,
            default_scan,
        }
    }
}

/// The default namespaces of a platform
///
/// Windows has no device directory; its disks come from [`WINDOWS_INVENTORY`].
pub fn default_roots(platform: Platform) -> Vec<ScanRoot> {
    match platform {
        Platform::Linux => vec![
            ScanRoot::new("/dev/mapper", None, DM_MP_DEVICE, true),
            ScanRoot::new("/dev", Some("sd"), LINUX_DEVICE, true),
            ScanRoot::new("/dev", Some("sg"), SCSI_DEVICE, false),
        ],
        Platform::Aix => vec![ScanRoot::new("/dev", Some("rhdisk"), DEVICE_PATH, true)],
        Platform::HpUx => vec![ScanRoot::new("/dev/rdisk", Some("disk"), DEVICE_PATH, true)],
        Platform::Windows => vec![],
    }
}

/// Whether devices of a platform live in a directory that can be listed
pub fn has_device_directory(platform: Platform) -> bool {
    !default_roots(platform).is_empty()
}

/// Roots selected by the `all_device_paths` switch
pub fn scan_roots(platform: Platform, all_device_paths: bool) -> Vec<ScanRoot> {
    default_roots(platform)
        .into_iter()
        .filter(|root| all_device_paths || root.default_scan)
        .collect()
}

fn kind_for(platform: Platform, dir: &Path, prefix: Option<&str>) -> &'static str {
    default_roots(platform)
        .into_iter()
        .find(|root| {
            root.dir == dir
                && match (prefix, root.prefix.as_deref()) {
                    (Some(name), Some(root_prefix)) => name.starts_with(root_prefix),
                    _ => true,
                }
        })
        .map(|root| root.kind)
        .unwrap_or(DEVICE_PATH)
}

/// Roots from an explicit comma separated path list
///
/// Each entry is split into its directory and name; the name is used as a
/// prefix and `*` selects every name in the directory.
pub fn explicit_roots(platform: Platform, list: &str) -> Vec<ScanRoot> {
    list.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .filter_map(|entry| {
            let path = Path::new(entry);
            let dir = path.parent().filter(|p| !p.as_os_str().is_empty())?;
            let name = path.file_name()?.to_str()?;
            let prefix = (name != "*").then_some(name);
            Some(ScanRoot {
                dir: dir.to_path_buf(),
                prefix: prefix.map(str::to_owned),
                kind: kind_for(platform, dir, prefix),
                default_scan: true,
            })
        })
        .collect()
}

/// Device paths from an explicit comma separated path list
///
/// Used where there is no device directory to match names against, so every
/// entry is opened as given.
pub fn explicit_paths(list: &str) -> Vec<PathBuf> {
    list.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(PathBuf::from)
        .collect()
}

/// Whether a directory entry name may be a whole device
///
/// Rejects dot entries, disk partitions and device-mapper pseudo devices.
pub fn accepts_name(platform: Platform, root: &ScanRoot, name: &str) -> bool {
    if name.starts_with('.') {
        return false;
    }
    if let Some(prefix) = &root.prefix {
        if !name.starts_with(prefix.as_str()) {
            return false;
        }
    }
    match platform {
        Platform::Linux => {
            if root.dir == Path::new("/dev/mapper") {
                return !is_mapper_pseudo_device(name);
            }
            !is_linux_partition(name)
        }
        Platform::HpUx => !name.contains("_p"),
        Platform::Aix | Platform::Windows => true,
    }
}

/// `sda1` is a partition of `sda`
fn is_linux_partition(name: &str) -> bool {
    match name.strip_prefix("sd") {
        Some(rest) => !rest.chars().all(char::is_alphabetic),
        None => false,
    }
}

fn is_mapper_pseudo_device(name: &str) -> bool {
    name == "control" || ["-home", "-root", "-swap"].iter().any(|suffix| name.ends_with(suffix))
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    fn names<'a>(platform: Platform, root: &ScanRoot, names: &[&'a str]) -> Vec<&'a str> {
        names
            .iter()
            .copied()
            .filter(|n| accepts_name(platform, root, n))
            .collect()
    }

    #[test]
    fn test_linux_defaults() {
        let roots = scan_roots(Platform::Linux, false);
        assert_eq!(roots.len(), 2);
        assert_eq!(roots[0].kind, DM_MP_DEVICE);
        assert_eq!(scan_roots(Platform::Linux, true)[2].prefix.as_deref(), Some("sg"));
        assert!(default_roots(Platform::Windows).is_empty());
    }

    #[test]
    fn test_partitions_skipped() {
        let root = ScanRoot::new("/dev", Some("sd"), LINUX_DEVICE, true);
        assert_eq!(
            names(Platform::Linux, &root, &["sda", "sda1", "sdb", "sg0", ".udev", "sdaa"]),
            vec!["sda", "sdb", "sdaa"]
        );

        let hpux = ScanRoot::new("/dev/rdisk", Some("disk"), DEVICE_PATH, true);
        assert_eq!(names(Platform::HpUx, &hpux, &["disk4", "disk4_p2"]), vec!["disk4"]);
    }

    #[test]
    fn test_mapper_pseudo_devices() {
        let root = ScanRoot::new("/dev/mapper", None, DM_MP_DEVICE, true);
        assert_eq!(
            names(Platform::Linux, &root, &["control", "mpatha", "vg0-root", "vg0-swap", "vg0-home"]),
            vec!["mpatha"]
        );
    }

    #[test]
    fn test_explicit_roots() {
        let roots = explicit_roots(Platform::Linux, "/dev/sdc,/dev/mapper/*, bogus");
        assert_eq!(roots.len(), 2);
        assert_eq!(roots[0].dir, PathBuf::from("/dev"));
        assert_eq!(roots[0].prefix.as_deref(), Some("sdc"));
        assert_eq!(roots[0].kind, LINUX_DEVICE);
        assert_eq!(roots[1].prefix, None);
        assert_eq!(roots[1].kind, DM_MP_DEVICE);
    }

    #[test]
    fn test_explicit_paths() {
        assert!(has_device_directory(Platform::Aix));
        assert!(!has_device_directory(Platform::Windows));
        assert!(explicit_roots(Platform::Windows, r"\\.\PHYSICALDRIVE0").is_empty());
        assert_eq!(
            explicit_paths(r" \\.\PHYSICALDRIVE0,,PhysicalDrive1 "),
            vec![PathBuf::from(r"\\.\PHYSICALDRIVE0"), PathBuf::from("PhysicalDrive1")]
        );
    }
}
