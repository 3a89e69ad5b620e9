// SPDX-FileCopyrightText: Copyright © 2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Include and exclude path lists

use std::path::{Path, PathBuf};

use itertools::Itertools;
use regex::Regex;
use transport::Nexus;

use crate::Error;

#[derive(Debug, Clone)]
enum Pattern {
    Exact(String),
    Glob(Regex),
}

impl Pattern {
    fn parse(entry: &str) -> Result<Self, Error> {
        if !entry.contains(['*', '?']) {
            return Ok(Pattern::Exact(entry.to_owned()));
        }
        let body = entry
            .split_inclusive(['*', '?'])
            .map(|part| match part.strip_suffix('*') {
                Some(literal) => format!("{}.*", regex::escape(literal)),
                None => match part.strip_suffix('?') {
                    Some(literal) => format!("{}.", regex::escape(literal)),
                    None => regex::escape(part),
                },
            })
            .join("");
        let regex = Regex::new(&format!("^{body}$")).map_err(|source| Error::Pattern {
            pattern: entry.to_owned(),
            source,
        })?;
        Ok(Pattern::Glob(regex))
    }

    fn matches(&self, path: &str) -> bool {
        match self {
            Pattern::Exact(p) => p == path,
            Pattern::Glob(r) => r.is_match(path),
        }
    }
}

/// A comma separated list of device paths
///
/// Entries containing `*` or `?` are globs, all others must match exactly.
#[derive(Debug, Clone, Default)]
pub struct PathList {
    source: String,
    patterns: Vec<Pattern>,
}

impl PathList {
    pub fn parse(list: &str) -> Result<Self, Error> {
        let patterns = list
            .split(',')
            .map(str::trim)
            .filter(|entry| !entry.is_empty())
            .map(Pattern::parse)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            source: list.to_owned(),
            patterns,
        })
    }

    pub fn matches(&self, path: &Path) -> bool {
        let path = path.to_string_lossy();
        self.patterns.iter().any(|p| p.matches(&path))
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// The list as it was given
    pub fn as_str(&self) -> &str {
        &self.source
    }
}

/// A path found to match an exclude rule
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExcludeEntry {
    pub path: PathBuf,
    pub nexus: Option<Nexus>,
}

/// Exclude decisions already made during a scan
///
/// Once a path is excluded every other name of the same nexus is excluded
/// too, without consulting the path list or touching the device again.
#[derive(Debug, Default)]
pub struct ExcludeTable {
    entries: Vec<ExcludeEntry>,
}

impl ExcludeTable {
    /// Finds a previous decision by nexus, or by path when the nexus is unknown
    pub fn lookup(&self, path: &Path, nexus: Option<Nexus>) -> Option<&ExcludeEntry> {
        self.entries.iter().find(|entry| match (nexus, entry.nexus) {
            (Some(wanted), Some(known)) => wanted == known,
            _ => entry.path == path,
        })
    }

    pub fn record(&mut self, path: &Path, nexus: Option<Nexus>) -> &ExcludeEntry {
        self.entries.push(ExcludeEntry {
            path: path.to_path_buf(),
            nexus,
        });
        &self.entries[self.entries.len() - 1]
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn test_exact_and_glob() {
        let list = PathList::parse("/dev/sda, /dev/sdz*,/dev/mapper/mpath?").unwrap();
        assert!(list.matches(Path::new("/dev/sda")));
        assert!(!list.matches(Path::new("/dev/sdaa")));
        assert!(list.matches(Path::new("/dev/sdz")));
        assert!(list.matches(Path::new("/dev/sdzb")));
        assert!(list.matches(Path::new("/dev/mapper/mpatha")));
        assert!(!list.matches(Path::new("/dev/mapper/mpathaa")));
        assert_eq!(list.as_str(), "/dev/sda, /dev/sdz*,/dev/mapper/mpath?");
    }

    #[test]
    fn test_glob_escapes_literals() {
        let list = PathList::parse("/dev/disk.by*").unwrap();
        assert!(list.matches(Path::new("/dev/disk.by-id")));
        assert!(!list.matches(Path::new("/dev/diskXby-id")));
    }

    #[test]
    fn test_empty_entries_ignored() {
        assert!(PathList::parse(",,").unwrap().is_empty());
    }

    #[test]
    fn test_exclude_by_nexus() {
        let nexus = Nexus {
            bus: 2,
            channel: 0,
            target: 1,
            lun: 4,
        };
        let mut table = ExcludeTable::default();
        table.record(Path::new("/dev/sdc"), Some(nexus));

        // the generic alias of the same LUN
        assert!(table.lookup(Path::new("/dev/sg3"), Some(nexus)).is_some());
        assert!(table
            .lookup(Path::new("/dev/sdd"), Some(Nexus { lun: 5, ..nexus }))
            .is_none());
        assert!(table.lookup(Path::new("/dev/sdc"), None).is_some());

        table.clear();
        assert!(table.is_empty());
    }
}
