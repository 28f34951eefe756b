//! Core fetch domain types shared across the workspace.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Field a metadata search matches against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SearchField {
    /// Match on package name only.
    Name,
    /// Match on package name and description.
    NameDescription,
    /// Match on maintainer username.
    Maintainer,
}

impl SearchField {
    /// Wire token used in the repository query string.
    #[must_use]
    pub const fn as_token(self) -> &'static str {
        match self {
            Self::Name => "name",
            Self::NameDescription => "name-desc",
            Self::Maintainer => "maintainer",
        }
    }
}

/// Metadata query issued against the repository RPC endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetadataRequest {
    /// Exact-name lookup for one or more packages.
    Info {
        /// Package names to resolve.
        names: Vec<String>,
    },
    /// Keyword search across a chosen field.
    Search {
        /// Search term.
        term: String,
        /// Field the term matches against.
        field: SearchField,
    },
}

impl MetadataRequest {
    /// Convenience constructor for a single-package lookup.
    #[must_use]
    pub fn info(name: impl Into<String>) -> Self {
        Self::Info {
            names: vec![name.into()],
        }
    }
}

/// Raw download issued against the repository content endpoints.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawRequest {
    /// Snapshot archive of a package tree.
    Snapshot {
        /// Package name.
        name: String,
    },
    /// Plain-text build recipe for a package.
    Recipe {
        /// Package name.
        name: String,
    },
}

impl RawRequest {
    /// Package name the request targets.
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Snapshot { name } | Self::Recipe { name } => name,
        }
    }
}

/// Source-repository clone request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloneRequest {
    /// Package name; also the default checkout directory.
    pub name: String,
    /// Checkout directory override.
    pub workdir: Option<PathBuf>,
}

impl CloneRequest {
    /// Clone request checked out into the directory named after the package.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            workdir: None,
        }
    }
}

/// One package record from the metadata endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackageInfo {
    /// Package name.
    pub name: String,
    /// Current version string.
    pub version: String,
    /// Short description.
    #[serde(default)]
    pub description: Option<String>,
    /// Maintainer username, if any.
    #[serde(default)]
    pub maintainer: Option<String>,
    /// Runtime dependency names.
    #[serde(default)]
    pub depends: Vec<String>,
    /// Seconds since the epoch of the last package update.
    #[serde(default)]
    pub last_modified: Option<i64>,
}

/// Parsed reply to a metadata query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetadataReply {
    /// Matched package records, in repository order.
    pub packages: Vec<PackageInfo>,
}

/// Reply to a raw download: payload plus transport status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawReply {
    /// HTTP status the repository answered with.
    pub status: u16,
    /// Raw payload bytes.
    pub body: Vec<u8>,
}

/// Action the clone subsystem performed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloneAction {
    /// Fresh clone into a new working directory.
    Cloned,
    /// Fast-forward update of an existing checkout.
    Updated,
}

/// Reply to a clone request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloneReply {
    /// Action performed.
    pub action: CloneAction,
    /// Working directory of the checkout.
    pub workdir: PathBuf,
}

/// Verdict a completion callback hands back to the multiplexer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Keep processing the remaining operations.
    Continue,
    /// Tear down every other pending operation and make `wait` fail.
    Cancel,
}

/// Observability side channel for outbound requests.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum DebugMode {
    /// Structured logs only; request targets are not recorded.
    #[default]
    Off,
    /// Log every outbound request target at debug level.
    Verbose,
    /// Append one line per outbound request to the given file.
    Requests(PathBuf),
}
