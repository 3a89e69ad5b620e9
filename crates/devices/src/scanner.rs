// SPDX-FileCopyrightText: Copyright © 2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Device discovery
//!
//! A scan walks the platform device namespaces, asks every candidate for its
//! Inquiry identity and folds the survivors of the configured filters into
//! the [`DeviceRegistry`].

use std::{
    fs, io,
    path::{Path, PathBuf},
    process::Command,
    sync::{Mutex, MutexGuard, PoisonError},
};

use itertools::Itertools;
use linux_raw_sys::errno::{ENODEV, ENOENT, ENXIO};
use log::{debug, info, warn};
use transport::{backend::windows, DeviceHandle, Nexus, OpenMode, TransportBackend};

use crate::{
    config::ScanFilters,
    inquiry::{
        self, ata_identify_command, inquiry_command, StandardInquiry, VpdPage, DEVICE_ID_PAGE, SERIAL_NUMBER_PAGE,
    },
    namespace,
    registry::{path_order, DeviceIdentity, DeviceRecord, DeviceRegistry, PathRecord},
    Error,
};

// Open errors of paths without a device behind them
const ABSENT: [i32; 3] = [ENODEV as i32, ENXIO as i32, ENOENT as i32];

/// Source of candidate device names
pub trait DeviceLister {
    /// Entry names of a device directory
    fn list(&self, dir: &Path) -> io::Result<Vec<String>>;

    /// Device paths reported by the platform disk inventory
    fn inventory(&self) -> Result<Vec<PathBuf>, Error>;
}

/// Lists the live device directories
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemLister;

impl DeviceLister for SystemLister {
    fn list(&self, dir: &Path) -> io::Result<Vec<String>> {
        Ok(fs::read_dir(dir)?
            .filter_map(Result::ok)
            .filter_map(|entry| entry.file_name().into_string().ok())
            .collect())
    }

    fn inventory(&self) -> Result<Vec<PathBuf>, Error> {
        let (command, args) = namespace::WINDOWS_INVENTORY;
        let output = Command::new(command)
            .args(args)
            .output()
            .map_err(|source| Error::Inventory { command, source })?;
        if !output.status.success() {
            return Err(Error::Inventory {
                command,
                source: io::Error::other(format!("exited with {}", output.status)),
            });
        }
        Ok(windows::parse_disk_inventory(&String::from_utf8_lossy(&output.stdout))
            .into_iter()
            .map(PathBuf::from)
            .collect())
    }
}

/// Discovers devices through a transport backend
pub struct Scanner<'a, B, L = SystemLister> {
    backend: &'a B,
    registry: &'a Mutex<DeviceRegistry>,
    lister: L,
}

impl<'a, B: TransportBackend> Scanner<'a, B> {
    pub fn new(backend: &'a B, registry: &'a Mutex<DeviceRegistry>) -> Self {
        Self {
            backend,
            registry,
            lister: SystemLister,
        }
    }
}

impl<'a, B: TransportBackend, L: DeviceLister> Scanner<'a, B, L> {
    /// Use another source of device names
    pub fn with_lister<M: DeviceLister>(self, lister: M) -> Scanner<'a, B, M> {
        Scanner {
            backend: self.backend,
            registry: self.registry,
            lister,
        }
    }

    fn registry(&self) -> MutexGuard<'_, DeviceRegistry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Scans the default namespaces, or the comma separated `paths` instead
    ///
    /// Returns every record in the registry, including those of earlier
    /// scans that were not flushed.
    pub fn scan(&self, paths: Option<&str>, filters: &ScanFilters) -> Result<Vec<DeviceRecord>, Error> {
        let candidates = self.candidates(paths, filters)?;
        info!("Scanning {} candidate device paths", candidates.len());

        for (path, kind) in candidates {
            self.probe(&path, kind, filters);
        }

        let mut registry = self.registry();
        if filters.exclude_paths.is_some() {
            registry.excluded_mut().clear();
        }
        Ok(registry.snapshot())
    }

    fn candidates(&self, paths: Option<&str>, filters: &ScanFilters) -> Result<Vec<(PathBuf, &'static str)>, Error> {
        let platform = self.backend.platform();
        if let Some(list) = paths.filter(|_| !namespace::has_device_directory(platform)) {
            return Ok(namespace::explicit_paths(list)
                .into_iter()
                .unique()
                .map(|path| (path, namespace::DEVICE_PATH))
                .collect());
        }

        let roots = match paths {
            Some(list) => namespace::explicit_roots(platform, list),
            None => namespace::scan_roots(platform, filters.all_device_paths),
        };

        if roots.is_empty() && paths.is_none() {
            return Ok(self
                .lister
                .inventory()?
                .into_iter()
                .map(|path| (path, namespace::DEVICE_PATH))
                .collect());
        }

        let mut candidates = vec![];
        for root in &roots {
            let mut names = match self.lister.list(&root.dir) {
                Ok(names) => names,
                Err(source) if paths.is_none() => {
                    debug!("Skipping {}: {source}", root.dir.display());
                    continue;
                }
                Err(source) => {
                    return Err(Error::Directory {
                        path: root.dir.clone(),
                        source,
                    })
                }
            };
            names.sort_by(|a, b| path_order(Path::new(a), Path::new(b)));
            candidates.extend(
                names
                    .into_iter()
                    .filter(|name| namespace::accepts_name(platform, root, name))
                    .map(|name| (root.dir.join(name), root.kind)),
            );
        }

        Ok(candidates.into_iter().unique_by(|(path, _)| path.clone()).collect())
    }

    fn probe(&self, path: &Path, kind: &'static str, filters: &ScanFilters) {
        // The same unit shows up as block and generic device on multipath
        // platforms, so path lists are only applied once its nexus is known.
        let deferred = self.backend.platform().multipath();
        if !deferred && !self.selected(path, None, filters) {
            return;
        }

        let mut handle = match self.backend.open(path, OpenMode::Scan) {
            Ok(handle) => handle,
            Err(err) => {
                match err.os_error() {
                    Some(code) if ABSENT.contains(&code) => debug!("Skipping {}: {err}", path.display()),
                    _ => warn!("{err}"),
                }
                return;
            }
        };

        let nexus = self.backend.scsi_address(&handle);
        let identity = if deferred && !self.selected(path, nexus, filters) {
            None
        } else {
            self.identify(&mut handle, filters)
        };
        let scsi_path = handle.scsi_path().map(Path::to_path_buf);
        self.backend.close(handle);

        if let Some(identity) = identity {
            let record = PathRecord {
                path: path.to_path_buf(),
                scsi_path,
                target_port: identity.target_port.clone(),
                nexus,
                kind,
            };
            let result = self.registry().register(identity, record);
            debug!("Registered {}: {result:?}", path.display());
        }
    }

    /// Applies the include and exclude path lists
    fn selected(&self, path: &Path, nexus: Option<Nexus>, filters: &ScanFilters) -> bool {
        if let Some(list) = &filters.device_paths {
            let included = list.matches(path)
                || nexus.is_some_and(|n| {
                    self.registry()
                        .find_by_nexus(n)
                        .is_some_and(|record| record.paths.iter().any(|p| list.matches(&p.path)))
                });
            if !included {
                debug!("{} is not a selected device path", path.display());
                return false;
            }
        }

        if let Some(list) = &filters.exclude_paths {
            let mut registry = self.registry();
            if let Some(entry) = registry.excluded().lookup(path, nexus) {
                debug!("{} excluded with {}", path.display(), entry.path.display());
                return false;
            }
            if list.matches(path) {
                debug!("{} excluded", path.display());
                registry.excluded_mut().record(path, nexus);
                return false;
            }
        }
        true
    }

    fn vpd_page(&self, handle: &mut B::Handle, page: u8) -> Option<Vec<u8>> {
        let outcome = self.backend.execute(handle, &inquiry_command(Some(page)).errlog(false));
        if !outcome.is_success() {
            debug!("{}: Inquiry page {page:#04x} unavailable: {outcome}", handle.path().display());
        }
        outcome.into_data()
    }

    /// Reads the Inquiry identity of an open device, `None` when filtered out
    fn identify(&self, handle: &mut B::Handle, filters: &ScanFilters) -> Option<DeviceIdentity> {
        let outcome = self.backend.execute(handle, &inquiry_command(None).errlog(false));
        let Some(inquiry) = outcome.into_data().as_deref().and_then(StandardInquiry::parse) else {
            debug!("{}: standard Inquiry failed", handle.path().display());
            return None;
        };
        if !filters.accepts_inquiry(&inquiry) {
            return None;
        }

        let serial = self
            .vpd_page(handle, SERIAL_NUMBER_PAGE)
            .and_then(|data| {
                VpdPage::parse(&data, SERIAL_NUMBER_PAGE, &inquiry).and_then(|page| inquiry::serial_number(&page))
            });
        if let Some(wanted) = &filters.serial {
            // serials are often space padded
            if !serial.as_ref().is_some_and(|s| s.contains(wanted.as_str())) {
                return None;
            }
        }

        let ident = self.vpd_page(handle, DEVICE_ID_PAGE);
        let page = ident
            .as_deref()
            .and_then(|data| VpdPage::parse(data, DEVICE_ID_PAGE, &inquiry));
        let device_id = page
            .as_ref()
            .and_then(|page| inquiry::device_identifier(page, &inquiry));
        let target_port = page.as_ref().and_then(|page| inquiry::target_port_identifier(page));
        if !exact(&filters.device_id, &device_id) || !exact(&filters.target_port, &target_port) {
            return None;
        }

        let fw_version = if inquiry.is_ata() {
            self.backend
                .execute(handle, &ata_identify_command().errlog(false))
                .into_data()
                .and_then(|data| inquiry::ata_firmware_version(&data))
        } else {
            None
        };
        if !exact(&filters.fw_version, &fw_version) {
            return None;
        }

        Some(DeviceIdentity {
            device_type: inquiry.device_type,
            vendor: inquiry.vendor,
            product: inquiry.product,
            revision: inquiry.revision,
            serial,
            device_id,
            target_port,
            fw_version,
        })
    }
}

// An unset filter accepts anything, a set one needs an equal value
fn exact(wanted: &Option<String>, found: &Option<String>) -> bool {
    wanted.as_ref().is_none_or(|w| found.as_ref() == Some(w))
}
