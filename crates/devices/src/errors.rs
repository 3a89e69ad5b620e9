// SPDX-FileCopyrightText: Copyright © 2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

use std::{io, path::PathBuf, sync::Arc};

use miette::{Diagnostic, NamedSource, SourceSpan};
use thiserror::Error;

use crate::config::KdlType;

/// Error type for the devices crate
#[derive(Diagnostic, Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] io::Error),

    /// A path list entry is not a valid glob
    #[error("invalid path pattern {pattern:?}: {source}")]
    Pattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    /// A device directory could not be listed
    #[error("cannot list {path:?}: {source}")]
    Directory {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The disk inventory command could not be run
    #[error("{command} failed: {source}")]
    Inventory {
        command: &'static str,
        #[source]
        source: io::Error,
    },

    #[diagnostic(transparent)]
    #[error(transparent)]
    Kdl(#[from] kdl::KdlError),

    #[diagnostic(transparent)]
    #[error(transparent)]
    InvalidArguments(#[from] InvalidArguments),

    #[diagnostic(transparent)]
    #[error(transparent)]
    InvalidType(#[from] InvalidType),

    #[diagnostic(transparent)]
    #[error(transparent)]
    UnsupportedNode(#[from] UnsupportedNode),

    #[diagnostic(transparent)]
    #[error(transparent)]
    UnsupportedValue(#[from] UnsupportedValue),

    #[diagnostic(transparent)]
    #[error(transparent)]
    Parse(#[from] ParseError),
}

/// Merged error for parsing failures
/// Returns a list of diagnostics for the user
#[derive(Debug, Diagnostic, Error)]
#[error("failed to parse KDL")]
#[diagnostic(severity(error))]
pub struct ParseError {
    #[source_code]
    pub src: NamedSource<Arc<String>>,
    #[related]
    pub diagnostics: Vec<Error>,
}

/// Error for invalid types
#[derive(Debug, Diagnostic, Error)]
#[error("invalid type, expected {expected_type}")]
#[diagnostic(severity(error))]
pub struct InvalidType {
    #[label("found {found_type}")]
    pub at: SourceSpan,

    pub expected_type: KdlType,
    pub found_type: KdlType,
}

/// Error for unsupported node types
#[derive(Debug, Diagnostic, Error)]
#[error("unsupported node: {name}")]
#[diagnostic(severity(error))]
pub struct UnsupportedNode {
    #[label]
    pub at: SourceSpan,

    pub name: String,

    #[help]
    pub advice: Option<String>,
}

/// Error for unsupported values
#[derive(Debug, Diagnostic, Error)]
#[error("unsupported value")]
#[diagnostic(severity(error))]
pub struct UnsupportedValue {
    #[label]
    pub at: SourceSpan,

    #[help]
    pub advice: Option<String>,
}

/// Error for invalid arguments
#[derive(Debug, Diagnostic, Error)]
#[error("invalid arguments")]
#[diagnostic(severity(error))]
pub struct InvalidArguments {
    #[label]
    pub at: SourceSpan,

    #[help]
    pub advice: Option<String>,
}
