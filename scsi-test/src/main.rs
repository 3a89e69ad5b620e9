// SPDX-FileCopyrightText: Copyright © 2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

use std::{env, error::Error};

use devices::{DeviceRecord, ScanFilters};
use log::{debug, info};

const USAGE: &str = "usage: scsi-test [scan] [--paths LIST] [--filters FILE] [--all] [--json]
       scsi-test inquiry DEVICE";

/// Scan options from the command line
#[derive(Debug, Default)]
struct ScanArgs {
    paths: Option<String>,
    filters: Option<String>,
    all_device_paths: bool,
    json: bool,
}

impl ScanArgs {
    fn parse(mut args: impl Iterator<Item = String>) -> Result<Self, Box<dyn Error>> {
        let mut parsed = Self::default();
        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--paths" => parsed.paths = Some(args.next().ok_or(USAGE)?),
                "--filters" => parsed.filters = Some(args.next().ok_or(USAGE)?),
                "--all" => parsed.all_device_paths = true,
                "--json" => parsed.json = true,
                _ => return Err(USAGE.into()),
            }
        }
        Ok(parsed)
    }
}

/// Prints one line per matching device, followed by its paths
fn show(records: &[DeviceRecord], filters: &ScanFilters) {
    for record in records.iter().filter(|r| r.matches(filters)) {
        let identity = &record.identity;
        println!(
            "{:<11.11} {:<8} {:<16} {:<4} {:<20} {}",
            identity.device_type_name(),
            identity.vendor.trim_end(),
            identity.product.trim_end(),
            identity.revision.trim_end(),
            identity.serial.as_deref().map(str::trim).unwrap_or("-"),
            identity.device_id.as_deref().unwrap_or("-"),
        );
        for path in &record.paths {
            let alias = path
                .scsi_path
                .as_ref()
                .map(|p| format!(" ({})", p.display()))
                .unwrap_or_default();
            println!("  └─{} {}{alias}", path.kind, path.path.display());
        }
    }
}

#[cfg(any(target_os = "linux", target_os = "aix", windows))]
fn scan(args: ScanArgs) -> Result<(), Box<dyn Error>> {
    let mut filters = match &args.filters {
        Some(file) => ScanFilters::new_for_path(file)?,
        None => ScanFilters::default(),
    };
    filters.all_device_paths |= args.all_device_paths;
    debug!("Scan filters: {filters:?}");

    let records = devices::scan(args.paths.as_deref(), &filters)?;
    info!("Found {} devices", records.len());

    if args.json {
        let shown = records.iter().filter(|r| r.matches(&filters)).collect::<Vec<_>>();
        println!("{}", serde_json::to_string_pretty(&shown)?);
    } else {
        show(&records, &filters);
    }
    Ok(())
}

/// Sends a standard Inquiry to one device, retrying transient failures
#[cfg(any(target_os = "linux", target_os = "aix", windows))]
fn inquiry(device: &str) -> Result<(), Box<dyn Error>> {
    use std::{path::Path, thread, time::Duration};

    use devices::inquiry::{inquiry_command, StandardInquiry};
    use log::warn;
    use transport::{backend::NativeBackend, OpenMode, RetryClassifier, TransportBackend};

    const RETRY_LIMIT: usize = 3;
    const RETRY_DELAY: Duration = Duration::from_secs(1);

    let backend = NativeBackend::new();
    let mut handle = backend.open(Path::new(device), OpenMode::ReadWrite)?;
    let classifier = RetryClassifier::default();
    let cmd = inquiry_command(None);

    let mut outcome = backend.execute(&mut handle, &cmd);
    for attempt in 1..=RETRY_LIMIT {
        if !classifier.is_retriable(&backend, &handle, &outcome) {
            break;
        }
        warn!("Retrying Inquiry on {device}, attempt {attempt} of {RETRY_LIMIT}");
        thread::sleep(RETRY_DELAY);
        outcome = backend.execute(&mut handle, &cmd);
    }
    backend.close(handle);
    info!("{device}: {outcome}");

    let standard = outcome
        .into_data()
        .as_deref()
        .and_then(StandardInquiry::parse)
        .ok_or("no standard Inquiry data")?;
    println!("Device Type: {}", standard.device_type_name());
    println!("Vendor:      {}", standard.vendor.trim_end());
    println!("Product:     {}", standard.product.trim_end());
    println!("Revision:    {}", standard.revision.trim_end());
    Ok(())
}

#[cfg(not(any(target_os = "linux", target_os = "aix", windows)))]
fn scan(_args: ScanArgs) -> Result<(), Box<dyn Error>> {
    Err("no pass-through backend for this platform".into())
}

#[cfg(not(any(target_os = "linux", target_os = "aix", windows)))]
fn inquiry(_device: &str) -> Result<(), Box<dyn Error>> {
    Err("no pass-through backend for this platform".into())
}

/// Discovers SCSI devices, or queries a single one
fn main() -> Result<(), Box<dyn Error>> {
    pretty_env_logger::formatted_timed_builder()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .init();

    let mut args = env::args().skip(1).peekable();
    match args.peek().map(String::as_str) {
        Some("inquiry") => {
            args.next();
            let device = args.next().ok_or(USAGE)?;
            inquiry(&device)
        }
        Some("scan") => {
            args.next();
            scan(ScanArgs::parse(args)?)
        }
        _ => scan(ScanArgs::parse(args)?),
    }
}
