// SPDX-FileCopyrightText: Copyright © 2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Deduplicated table of discovered devices
//!
//! Every sighting of a device path is folded into one [`DeviceRecord`] per
//! logical unit. Identity is decided by the device identifier first, then by
//! serial number, and finally by nexus when nothing else is known.

use std::{
    cmp::Ordering,
    path::{Path, PathBuf},
    sync::{Mutex, OnceLock},
};

use log::{debug, warn};
use serde::Serialize;
use transport::{backend::linux, Nexus, Platform};

use crate::{config::ScanFilters, exclude::ExcludeTable, inquiry};

/// Identity reported by a device through Inquiry
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeviceIdentity {
    pub device_type: u8,
    pub vendor: String,
    pub product: String,
    pub revision: String,
    pub serial: Option<String>,
    /// World wide name from the device identification page
    pub device_id: Option<String>,
    pub target_port: Option<String>,
    pub fw_version: Option<String>,
}

impl DeviceIdentity {
    pub fn device_type_name(&self) -> &'static str {
        inquiry::device_type_name(self.device_type)
    }

    fn is_anonymous(&self) -> bool {
        self.device_id.is_none() && self.serial.is_none()
    }

    /// Whether both identities describe the same logical unit
    ///
    /// Some arrays reuse serial numbers across LUNs, so serials are only
    /// compared when neither side carries a device identifier.
    fn same_unit(&self, other: &DeviceIdentity) -> Option<bool> {
        match (&self.device_id, &other.device_id) {
            (Some(a), Some(b)) => Some(a == b),
            (None, None) => match (&self.serial, &other.serial) {
                (Some(a), Some(b)) => Some(a == b),
                _ => None,
            },
            _ => Some(false),
        }
    }
}

/// One OS path to a device
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PathRecord {
    pub path: PathBuf,
    /// The generic pass-through alias of a block device
    pub scsi_path: Option<PathBuf>,
    pub target_port: Option<String>,
    pub nexus: Option<Nexus>,
    /// Device path type label
    pub kind: &'static str,
}

impl PathRecord {
    pub fn new(path: impl Into<PathBuf>, kind: &'static str) -> Self {
        Self {
            path: path.into(),
            scsi_path: None,
            target_port: None,
            nexus: None,
            kind,
        }
    }

    fn names(&self, path: &Path) -> bool {
        self.path == path || self.scsi_path.as_deref() == Some(path)
    }
}

/// A logical unit and every path it was seen through
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceRecord {
    pub identity: DeviceIdentity,
    pub paths: Vec<PathRecord>,
}

impl DeviceRecord {
    fn first_path(&self) -> &Path {
        self.paths.first().map(|p| p.path.as_path()).unwrap_or(Path::new(""))
    }

    fn has_nexus(&self, nexus: Nexus) -> bool {
        self.paths.iter().any(|p| p.nexus == Some(nexus))
    }

    /// Display time match against the path and identity filters
    ///
    /// A record without any such filter configured always matches.
    pub fn matches(&self, filters: &ScanFilters) -> bool {
        if filters.device_paths.is_none()
            && filters.serial.is_none()
            && filters.device_id.is_none()
            && filters.target_port.is_none()
        {
            return true;
        }

        if let Some(list) = &filters.device_paths {
            let listed = self.paths.iter().any(|p| {
                list.matches(&p.path) || p.scsi_path.as_deref().is_some_and(|alias| list.matches(alias))
            });
            if listed {
                return true;
            }
        }
        if let (Some(wanted), Some(id)) = (&filters.device_id, &self.identity.device_id) {
            if wanted == id {
                return true;
            }
        }
        if let (Some(wanted), Some(serial)) = (&filters.serial, &self.identity.serial) {
            // serials are often space padded
            if serial.contains(wanted.as_str()) {
                return true;
            }
        }
        if let Some(wanted) = &filters.target_port {
            let mut ports = self
                .paths
                .iter()
                .filter_map(|p| p.target_port.as_ref())
                .chain(self.identity.target_port.as_ref());
            if ports.any(|port| port == wanted) {
                return true;
            }
        }
        false
    }
}

/// What [`DeviceRegistry::register`] did with a sighting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterResult {
    /// A new device record
    Created,
    /// A new path on a known device
    Attached,
    /// The path was already registered
    AlreadyPresent,
    /// A second path to a known device on a platform without multipath, ignored
    Duplicate,
    /// A known nexus reported a different identity; kept as a separate record
    Anomaly,
}

/// Device path ordering: shorter names first, then lexicographic
///
/// Keeps `sda`, `sdb`, `sdaa` in the order a user expects.
pub fn path_order(a: &Path, b: &Path) -> Ordering {
    let (a, b) = (a.as_os_str(), b.as_os_str());
    a.len().cmp(&b.len()).then_with(|| a.cmp(b))
}

/// Devices found by every scan since the last flush
#[derive(Debug)]
pub struct DeviceRegistry {
    platform: Platform,
    records: Vec<DeviceRecord>,
    excluded: ExcludeTable,
}

static REGISTRY: OnceLock<Mutex<DeviceRegistry>> = OnceLock::new();

impl DeviceRegistry {
    pub fn new(platform: Platform) -> Self {
        Self {
            platform,
            records: vec![],
            excluded: ExcludeTable::default(),
        }
    }

    /// The process-wide registry, created on first use
    pub fn global() -> &'static Mutex<DeviceRegistry> {
        REGISTRY.get_or_init(|| Mutex::new(DeviceRegistry::new(Platform::current())))
    }

    pub fn platform(&self) -> Platform {
        self.platform
    }

    /// Forgets every device and exclude decision
    pub fn flush(&mut self) {
        debug!("flushing {} device records", self.records.len());
        self.records.clear();
        self.excluded.clear();
    }

    pub fn records(&self) -> &[DeviceRecord] {
        &self.records
    }

    pub fn snapshot(&self) -> Vec<DeviceRecord> {
        self.records.clone()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn excluded(&self) -> &ExcludeTable {
        &self.excluded
    }

    pub fn excluded_mut(&mut self) -> &mut ExcludeTable {
        &mut self.excluded
    }

    /// The record holding a path with this nexus
    pub fn find_by_nexus(&self, nexus: Nexus) -> Option<&DeviceRecord> {
        self.records.iter().find(|r| r.has_nexus(nexus))
    }

    /// The record a path is registered under, by path or pass-through alias
    pub fn find_by_path(&self, path: &Path) -> Option<&DeviceRecord> {
        self.records.iter().find(|r| r.paths.iter().any(|p| p.names(path)))
    }

    fn position(&self, identity: &DeviceIdentity, nexus: Option<Nexus>) -> Option<usize> {
        self.records.iter().position(|record| match record.identity.same_unit(identity) {
            Some(same) => same,
            None => {
                identity.is_anonymous()
                    && record.identity.is_anonymous()
                    && nexus.is_some_and(|n| record.has_nexus(n))
            }
        })
    }

    /// Folds one sighting of a device path into the registry
    pub fn register(&mut self, identity: DeviceIdentity, path: PathRecord) -> RegisterResult {
        if self.find_by_path(&path.path).is_some() {
            return RegisterResult::AlreadyPresent;
        }

        let Some(index) = self.position(&identity, path.nexus) else {
            let anomaly = match path.nexus.and_then(|n| self.find_by_nexus(n)) {
                Some(known) => {
                    warn!(
                        "{} reports the nexus of {} with a different identity, not merging",
                        path.path.display(),
                        known.first_path().display()
                    );
                    true
                }
                None => false,
            };
            self.insert_record(DeviceRecord {
                identity,
                paths: vec![path],
            });
            return if anomaly {
                RegisterResult::Anomaly
            } else {
                RegisterResult::Created
            };
        };

        if !self.platform.multipath() {
            warn!(
                "Found unexpected duplicate device {} of {}, ignoring",
                path.path.display(),
                self.records[index].first_path().display()
            );
            return RegisterResult::Duplicate;
        }

        let record = &mut self.records[index];
        if linux::is_sg_device(&path.path) {
            if let Some(existing) = record
                .paths
                .iter_mut()
                .find(|p| p.scsi_path.is_none() && p.nexus.is_some() && p.nexus == path.nexus)
            {
                debug!("{} is the generic device of {}", path.path.display(), existing.path.display());
                existing.scsi_path = Some(path.path);
                return RegisterResult::Attached;
            }
        }

        let at = record
            .paths
            .partition_point(|p| path_order(&p.path, &path.path) == Ordering::Less);
        record.paths.insert(at, path);
        self.records.sort_by(|a, b| path_order(a.first_path(), b.first_path()));
        RegisterResult::Attached
    }

    fn insert_record(&mut self, record: DeviceRecord) {
        let at = self
            .records
            .partition_point(|r| path_order(r.first_path(), record.first_path()) == Ordering::Less);
        self.records.insert(at, record);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{exclude::PathList, namespace::LINUX_DEVICE};
    use test_log::test;

    fn identity(device_id: Option<&str>, serial: Option<&str>) -> DeviceIdentity {
        DeviceIdentity {
            vendor: "HPE     ".into(),
            product: "MSA 2050 SAN    ".into(),
            revision: "V270".into(),
            device_id: device_id.map(str::to_owned),
            serial: serial.map(str::to_owned),
            ..Default::default()
        }
    }

    fn path(name: &str, nexus: Option<Nexus>) -> PathRecord {
        PathRecord {
            nexus,
            ..PathRecord::new(name, LINUX_DEVICE)
        }
    }

    fn nexus(target: u32, lun: u64) -> Nexus {
        Nexus {
            bus: 1,
            channel: 0,
            target,
            lun,
        }
    }

    fn names(record: &DeviceRecord) -> Vec<&Path> {
        record.paths.iter().map(|p| p.path.as_path()).collect()
    }

    #[test]
    fn test_register_is_idempotent() {
        let mut registry = DeviceRegistry::new(Platform::Linux);
        let id = identity(Some("0x600c0ff0001"), Some("  SER1"));

        assert_eq!(
            registry.register(id.clone(), path("/dev/sda", Some(nexus(0, 0)))),
            RegisterResult::Created
        );
        assert_eq!(
            registry.register(id, path("/dev/sda", Some(nexus(0, 0)))),
            RegisterResult::AlreadyPresent
        );
        assert_eq!(registry.records().len(), 1);
        assert_eq!(registry.records()[0].paths.len(), 1);
    }

    #[test]
    fn test_path_ordering() {
        let mut registry = DeviceRegistry::new(Platform::Linux);
        let id = identity(Some("0x600c0ff0001"), None);
        for (i, name) in ["/dev/sdaa", "/dev/sdb", "/dev/sda"].into_iter().enumerate() {
            registry.register(id.clone(), path(name, Some(nexus(i as u32, 0))));
        }

        assert_eq!(registry.records().len(), 1);
        assert_eq!(
            names(&registry.records()[0]),
            vec![Path::new("/dev/sda"), Path::new("/dev/sdb"), Path::new("/dev/sdaa")]
        );
    }

    #[test]
    fn test_records_sorted_by_first_path() {
        let mut registry = DeviceRegistry::new(Platform::Linux);
        registry.register(identity(Some("0x2"), None), path("/dev/sdc", None));
        registry.register(identity(Some("0x1"), None), path("/dev/sdaa", None));
        registry.register(identity(Some("0x3"), None), path("/dev/sdb", None));

        let firsts = registry.records().iter().map(|r| r.first_path()).collect::<Vec<_>>();
        assert_eq!(
            firsts,
            vec![Path::new("/dev/sdb"), Path::new("/dev/sdc"), Path::new("/dev/sdaa")]
        );
    }

    #[test]
    fn test_same_nexus_different_identity_is_anomaly() {
        let mut registry = DeviceRegistry::new(Platform::Linux);
        registry.register(identity(Some("0x600c0ff0001"), None), path("/dev/sdc", Some(nexus(3, 1))));

        assert_eq!(
            registry.register(identity(Some("0x600c0ff0002"), None), path("/dev/sdd", Some(nexus(3, 1)))),
            RegisterResult::Anomaly
        );
        assert_eq!(registry.records().len(), 2);
    }

    #[test]
    fn test_serial_ignored_when_device_id_present() {
        let mut registry = DeviceRegistry::new(Platform::Linux);
        registry.register(identity(Some("0x1"), Some("SHARED")), path("/dev/sda", None));
        registry.register(identity(Some("0x2"), Some("SHARED")), path("/dev/sdb", None));
        registry.register(identity(None, Some("PLAIN")), path("/dev/sdc", None));

        assert_eq!(
            registry.register(identity(None, Some("PLAIN")), path("/dev/sdd", None)),
            RegisterResult::Attached
        );
        assert_eq!(registry.records().len(), 3);
    }

    #[test]
    fn test_anonymous_devices_match_by_nexus() {
        let mut registry = DeviceRegistry::new(Platform::Linux);
        registry.register(identity(None, None), path("/dev/sde", Some(nexus(4, 0))));

        assert_eq!(
            registry.register(identity(None, None), path("/dev/sg4", Some(nexus(4, 0)))),
            RegisterResult::Attached
        );
        let record = &registry.records()[0];
        assert_eq!(record.paths.len(), 1);
        assert_eq!(record.paths[0].scsi_path.as_deref(), Some(Path::new("/dev/sg4")));
        assert!(registry.find_by_path(Path::new("/dev/sg4")).is_some());
    }

    #[test]
    fn test_duplicate_without_multipath() {
        let mut registry = DeviceRegistry::new(Platform::Aix);
        let id = identity(Some("0x600c0ff0001"), None);
        registry.register(id.clone(), path("/dev/rhdisk1", None));

        assert_eq!(
            registry.register(id, path("/dev/rhdisk7", None)),
            RegisterResult::Duplicate
        );
        assert_eq!(names(&registry.records()[0]), vec![Path::new("/dev/rhdisk1")]);
    }

    #[test]
    fn test_flush() {
        let mut registry = DeviceRegistry::new(Platform::Linux);
        registry.register(identity(None, Some("S")), path("/dev/sda", None));
        registry.excluded_mut().record(Path::new("/dev/sdz"), None);

        registry.flush();
        assert!(registry.is_empty());
        assert!(registry.excluded().is_empty());
    }

    #[test]
    fn test_user_filter_match() {
        let record = DeviceRecord {
            identity: identity(Some("0x600c0ff0001"), Some("   SER123")),
            paths: vec![PathRecord {
                scsi_path: Some("/dev/sg2".into()),
                target_port: Some("0x5000c50012345679".into()),
                ..PathRecord::new("/dev/sdc", LINUX_DEVICE)
            }],
        };

        assert!(record.matches(&ScanFilters::default()));
        assert!(record.matches(&ScanFilters {
            serial: Some("SER1".into()),
            ..Default::default()
        }));
        assert!(record.matches(&ScanFilters {
            device_paths: Some(PathList::parse("/dev/sg2").unwrap()),
            ..Default::default()
        }));
        assert!(record.matches(&ScanFilters {
            target_port: Some("0x5000c50012345679".into()),
            ..Default::default()
        }));
        assert!(!record.matches(&ScanFilters {
            device_id: Some("0x600c0ff0002".into()),
            ..Default::default()
        }));
        // identity filters alone do not restrict display
        assert!(record.matches(&ScanFilters {
            vendor: Some("IBM".into()),
            ..Default::default()
        }));
    }

    #[test]
    fn test_concurrent_registration() {
        // three units with four paths each, /dev/sda../dev/sdl round robin
        let name = |unit: usize, n: usize| format!("/dev/sd{}", (b'a' + (n * 3 + unit) as u8) as char);
        let registry = Mutex::new(DeviceRegistry::new(Platform::Linux));

        let results = std::thread::scope(|scope| {
            let workers = (0..4)
                .map(|worker| {
                    let registry = &registry;
                    scope.spawn(move || {
                        let mut sightings = (0..12).map(|i| (i % 3, i / 3)).collect::<Vec<_>>();
                        sightings.rotate_left(worker * 5);
                        if worker % 2 == 1 {
                            sightings.reverse();
                        }
                        sightings
                            .into_iter()
                            .map(|(unit, n)| {
                                let id = identity(Some(&format!("0x600c0ff000{unit}")), None);
                                let record = path(&name(unit, n), Some(nexus((n * 3 + unit) as u32, 0)));
                                registry.lock().unwrap().register(id, record)
                            })
                            .collect::<Vec<_>>()
                    })
                })
                .collect::<Vec<_>>();
            workers
                .into_iter()
                .flat_map(|worker| worker.join().unwrap())
                .collect::<Vec<_>>()
        });

        let count = |wanted| results.iter().filter(|r| **r == wanted).count();
        assert_eq!(count(RegisterResult::Created), 3);
        assert_eq!(count(RegisterResult::Attached), 9);
        assert_eq!(count(RegisterResult::AlreadyPresent), 36);

        let registry = registry.into_inner().unwrap();
        assert_eq!(registry.records().len(), 3);
        for (unit, record) in registry.records().iter().enumerate() {
            let expected = (0..4).map(|n| PathBuf::from(name(unit, n))).collect::<Vec<_>>();
            assert_eq!(names(record), expected.iter().map(PathBuf::as_path).collect::<Vec<_>>());
            assert_eq!(record.identity.device_id, Some(format!("0x600c0ff000{unit}")));
        }
    }
}
