// SPDX-FileCopyrightText: Copyright © 2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Scan filter configuration
//!
//! Filters are usually built in code, but can also be read from a KDL
//! document holding a single `filters` node:
//!
//! ```kdl
//! filters {
//!     device-types "direct" "enclosure"
//!     vendor "HPE"
//!     exclude-paths "/dev/sdz*"
//!     all-device-paths #true
//! }
//! ```

use std::{fmt, fs, path::Path, sync::Arc};

use itertools::{Either, Itertools};
use kdl::{KdlDocument, KdlEntry, KdlNode, KdlValue};
use miette::NamedSource;

use crate::{
    exclude::PathList,
    inquiry::{self, StandardInquiry},
    Error, InvalidArguments, InvalidType, ParseError, UnsupportedNode, UnsupportedValue,
};

/// Which devices a scan registers
#[derive(Debug, Clone, Default)]
pub struct ScanFilters {
    /// Peripheral device type codes; empty accepts every type
    pub device_types: Vec<u8>,
    /// Vendor identification prefix
    pub vendor: Option<String>,
    /// Product identification substring
    pub product: Option<String>,
    /// Product revision prefix
    pub revision: Option<String>,
    /// Serial number substring
    pub serial: Option<String>,
    pub device_id: Option<String>,
    pub target_port: Option<String>,
    pub fw_version: Option<String>,
    pub device_paths: Option<PathList>,
    pub exclude_paths: Option<PathList>,
    /// Also search namespaces that are skipped by default
    pub all_device_paths: bool,
}

impl ScanFilters {
    /// Load filters from a KDL file
    pub fn new_for_path<P>(file: P) -> Result<Self, Error>
    where
        P: AsRef<Path>,
    {
        let file = file.as_ref();
        let name = file.to_string_lossy();
        let txt = fs::read_to_string(file)?;
        Self::from_kdl(name.to_string(), txt)
    }

    /// Load filters from a KDL string
    pub fn from_kdl(name: String, contents: String) -> Result<Self, Error> {
        let ns = NamedSource::new(name, Arc::new(contents)).with_language("KDL");
        let d = KdlDocument::parse_v2(ns.inner())?;

        let mut filters = Self::default();
        for node in d.nodes() {
            match node.name().value() {
                "filters" => filters.parse_filters(&ns, node)?,
                what => {
                    return Err(UnsupportedNode {
                        at: node.span(),
                        name: what.to_owned(),
                        advice: Some("only 'filters' nodes are supported".to_owned()),
                    }
                    .into());
                }
            }
        }
        Ok(filters)
    }

    fn parse_filters(&mut self, ns: &NamedSource<Arc<String>>, node: &KdlNode) -> Result<(), Error> {
        // Collect every failure in the block before bailing out
        let (_, errors): (Vec<_>, Vec<_>) = node
            .iter_children()
            .partition_map(|child| match self.parse_filter(child) {
                Ok(()) => Either::Left(()),
                Err(e) => Either::Right(e),
            });

        if !errors.is_empty() {
            return Err(ParseError {
                src: ns.clone(),
                diagnostics: errors,
            }
            .into());
        }
        Ok(())
    }

    fn parse_filter(&mut self, node: &KdlNode) -> Result<(), Error> {
        match node.name().value() {
            "device-types" => {
                self.device_types = arguments(node)?
                    .into_iter()
                    .map(|entry| -> Result<u8, Error> {
                        let name = string_value(entry)?;
                        let code = inquiry::device_type_code(name).ok_or_else(|| UnsupportedValue {
                            at: entry.span(),
                            advice: Some(format!("'{name}' is not a device type name such as \"direct\"")),
                        })?;
                        Ok(code)
                    })
                    .collect::<Result<_, _>>()?;
            }
            "vendor" => self.vendor = Some(single_string(node)?),
            "product" => self.product = Some(single_string(node)?),
            "revision" => self.revision = Some(single_string(node)?),
            "serial" => self.serial = Some(single_string(node)?),
            "device-id" => self.device_id = Some(single_string(node)?),
            "target-port" => self.target_port = Some(single_string(node)?),
            "fw-version" => self.fw_version = Some(single_string(node)?),
            "device-paths" => self.device_paths = Some(path_list(node)?),
            "exclude-paths" => self.exclude_paths = Some(path_list(node)?),
            "all-device-paths" => {
                let entry = single_argument(node)?;
                self.all_device_paths = entry.value().as_bool().ok_or(InvalidType {
                    at: entry.span(),
                    expected_type: KdlType::Boolean,
                    found_type: KdlType::for_value(entry.value()),
                })?;
            }
            what => {
                return Err(UnsupportedNode {
                    at: node.span(),
                    name: what.to_owned(),
                    advice: None,
                }
                .into());
            }
        }
        Ok(())
    }

    /// Whether standard Inquiry data passes the type, vendor, product and revision filters
    pub fn accepts_inquiry(&self, inquiry: &StandardInquiry) -> bool {
        if !self.device_types.is_empty() && !self.device_types.contains(&inquiry.device_type) {
            return false;
        }
        if self.product.as_ref().is_some_and(|p| !inquiry.product.contains(p.as_str())) {
            return false;
        }
        if self.vendor.as_ref().is_some_and(|v| !inquiry.vendor.starts_with(v.as_str())) {
            return false;
        }
        if self.revision.as_ref().is_some_and(|r| !inquiry.revision.starts_with(r.as_str())) {
            return false;
        }
        true
    }
}

// Positional arguments of a node
fn arguments(node: &KdlNode) -> Result<Vec<&KdlEntry>, Error> {
    let arguments = node.entries().iter().filter(|e| e.name().is_none()).collect_vec();
    if arguments.is_empty() {
        return Err(InvalidArguments {
            at: node.span(),
            advice: Some(format!("{} <value> - provide a value", node.name().value())),
        }
        .into());
    }
    Ok(arguments)
}

fn single_argument(node: &KdlNode) -> Result<&KdlEntry, Error> {
    match arguments(node)?.as_slice() {
        [entry] => Ok(*entry),
        _ => Err(InvalidArguments {
            at: node.span(),
            advice: Some(format!("{} <value> - only one argument supported", node.name().value())),
        }
        .into()),
    }
}

fn string_value(entry: &KdlEntry) -> Result<&str, Error> {
    entry.value().as_string().ok_or_else(|| {
        InvalidType {
            at: entry.span(),
            expected_type: KdlType::String,
            found_type: KdlType::for_value(entry.value()),
        }
        .into()
    })
}

fn single_string(node: &KdlNode) -> Result<String, Error> {
    Ok(string_value(single_argument(node)?)?.to_owned())
}

fn path_list(node: &KdlNode) -> Result<PathList, Error> {
    let entry = single_argument(node)?;
    PathList::parse(string_value(entry)?).map_err(|err| {
        UnsupportedValue {
            at: entry.span(),
            advice: Some(err.to_string()),
        }
        .into()
    })
}

/// The type of a KDL value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KdlType {
    /// A boolean value
    Boolean,
    /// A string value
    String,
    /// A null value
    Null,
    /// An integer value
    Integer,
    /// A floating point value
    Float,
}

impl KdlType {
    // Determine the kdl value type
    pub fn for_value(value: &KdlValue) -> Self {
        if value.is_bool() {
            Self::Boolean
        } else if value.is_string() {
            Self::String
        } else if value.is_null() {
            Self::Null
        } else if value.is_integer() {
            Self::Integer
        } else {
            Self::Float
        }
    }
}

impl fmt::Display for KdlType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KdlType::Boolean => f.write_str("boolean"),
            KdlType::String => f.write_str("string"),
            KdlType::Null => f.write_str("null"),
            KdlType::Integer => f.write_str("int"),
            KdlType::Float => f.write_str("float"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    fn parse(doc: &str) -> Result<ScanFilters, Error> {
        ScanFilters::from_kdl("filters.kdl".to_owned(), doc.to_owned())
    }

    #[test]
    fn test_load_file() {
        let filters = ScanFilters::new_for_path("tests/filters.kdl").unwrap();
        assert_eq!(filters.device_types, vec![inquiry::DTYPE_DIRECT, 0x0d]);
        assert_eq!(filters.vendor.as_deref(), Some("HPE"));
        assert_eq!(filters.product.as_deref(), Some("MSA"));
        assert_eq!(filters.fw_version.as_deref(), Some("SN04"));
        assert!(filters.all_device_paths);
        assert!(filters.exclude_paths.unwrap().matches(Path::new("/dev/sdz3")));
        assert_eq!(filters.device_paths.unwrap().as_str(), "/dev/sda,/dev/sdb");
    }

    #[test]
    fn test_unknown_top_level_node() {
        let err = parse("scan { }").unwrap_err();
        assert!(matches!(err, Error::UnsupportedNode(ref n) if n.name == "scan"), "{err:?}");
    }

    #[test]
    fn test_errors_are_collected() {
        let err = parse(
            r#"
            filters {
                vendor 42
                colour "blue"
                all-device-paths "yes"
                serial "ABC"
            }
            "#,
        )
        .unwrap_err();

        let Error::Parse(parse) = &err else {
            panic!("expected a parse error, got {err:?}");
        };
        assert_eq!(parse.diagnostics.len(), 3);
        assert!(matches!(
            &parse.diagnostics[0],
            Error::InvalidType(InvalidType {
                expected_type: KdlType::String,
                found_type: KdlType::Integer,
                ..
            })
        ));
        assert!(matches!(&parse.diagnostics[1], Error::UnsupportedNode(n) if n.name == "colour"));
        assert!(matches!(
            &parse.diagnostics[2],
            Error::InvalidType(InvalidType {
                expected_type: KdlType::Boolean,
                ..
            })
        ));
    }

    #[test]
    fn test_bad_values() {
        assert!(matches!(
            parse(r#"filters { device-types "direct" "toaster" }"#),
            Err(Error::Parse(_))
        ));
        assert!(matches!(
            parse(r#"filters { vendor "HPE" "IBM" }"#),
            Err(Error::Parse(_))
        ));
        assert!(matches!(parse("filters { vendor }"), Err(Error::Parse(_))));
    }

    #[test]
    fn test_accepts_inquiry() {
        let inquiry = StandardInquiry {
            qualifier: 0,
            device_type: inquiry::DTYPE_DIRECT,
            vendor: "HPE     ".into(),
            product: "MSA 2050 SAN    ".into(),
            revision: "V270".into(),
        };

        assert!(ScanFilters::default().accepts_inquiry(&inquiry));
        let filters = ScanFilters {
            vendor: Some("HP".into()),
            product: Some("2050".into()),
            revision: Some("V2".into()),
            ..Default::default()
        };
        assert!(filters.accepts_inquiry(&inquiry));
        assert!(!ScanFilters {
            vendor: Some("PE".into()),
            ..Default::default()
        }
        .accepts_inquiry(&inquiry));
        assert!(!ScanFilters {
            device_types: vec![0x0d],
            ..Default::default()
        }
        .accepts_inquiry(&inquiry));
    }
}
