//! Error types and SNAFU context selectors for the archive engine.
//!
//! Two public enums live here:
//!
//! - [`SchemaError`] covers every violation of the fixed-shape contract
//!   (shape mismatches, unknown columns, invalid descriptors, re-building an
//!   existing table). These are always fatal; values are never coerced.
//! - [`ArchiveError`] is the crate-wide error returned by container, append,
//!   query and dump operations. It wraps `SchemaError` and adds the lock,
//!   range and I/O failure modes.
//!
//! A crate-internal `CatalogError` describes catalog replay failures; it is
//! folded into `ArchiveError::Corrupt` with the container path attached.
//!
//! Context selectors are exported crate-wide via
//! `#[snafu(visibility(pub(crate)))]` so sibling modules can attach context
//! without re-declaring variants. Keep new variants here so user-facing
//! messages stay consistent.

use arrow::error::ArrowError;
use snafu::{Backtrace, prelude::*};

use crate::storage::lock::LockMode;

/// Result alias used throughout the crate.
pub type ArchiveResult<T> = Result<T, ArchiveError>;

/// Violations of a group's fixed schema.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SchemaError {
    /// A value's shape differs from the declared shape of its column or
    /// auxiliary array.
    #[snafu(display(
        "Shape mismatch for {name} in group {group}: declared {expected:?}, got {found:?}"
    ))]
    ShapeMismatch {
        /// Group holding the column or array.
        group: String,
        /// Column or auxiliary array name.
        name: String,
        /// Declared shape.
        expected: Vec<usize>,
        /// Shape of the rejected value.
        found: Vec<usize>,
    },

    /// The named column or auxiliary array does not exist in the group.
    #[snafu(display("Group {group} has no column or auxiliary array named {name}"))]
    UnknownColumn {
        /// Group that was searched.
        group: String,
        /// Name that was not found.
        name: String,
    },

    /// `build` was invoked on a group that already holds a table.
    #[snafu(display("Group {group} already has a table; schemas are immutable once created"))]
    TableExists {
        /// Group that already holds a table.
        group: String,
    },

    /// A column or auxiliary array name appears more than once.
    #[snafu(display("Name {name} is declared more than once in group {group}"))]
    DuplicateName {
        /// Group being built.
        group: String,
        /// Repeated name.
        name: String,
    },

    /// A declared name is reserved by the engine.
    #[snafu(display("Name {name:?} is reserved"))]
    ReservedName {
        /// Offending name.
        name: String,
    },

    /// A declared shape contains a zero-sized dimension.
    #[snafu(display("Invalid shape {shape:?} for {name}: dimensions must be non-zero"))]
    InvalidShape {
        /// Column or auxiliary array name.
        name: String,
        /// Offending shape.
        shape: Vec<usize>,
    },

    /// The value buffer length does not match the product of the shape.
    #[snafu(display("Array of shape {shape:?} needs {expected} values, got {found}"))]
    ArrayLength {
        /// Declared shape.
        shape: Vec<usize>,
        /// Number of elements implied by `shape`.
        expected: usize,
        /// Number of elements supplied.
        found: usize,
    },

    /// The schema declares no table columns.
    #[snafu(display("Group {group} declares no columns"))]
    EmptySchema {
        /// Group being built.
        group: String,
    },

    /// A group path could not be parsed.
    #[snafu(display("Invalid group path {path:?}: {reason}"))]
    InvalidGroupPath {
        /// Raw path as supplied.
        path: String,
        /// Why the path was rejected.
        reason: &'static str,
    },
}

/// Errors from archive operations.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ArchiveError {
    /// Opening a container that does not exist. Write-open never creates.
    #[snafu(display("Container not found: {path}"))]
    NotFound {
        /// Path of the missing container.
        path: String,
    },

    /// The advisory lock could not be acquired within the configured bound.
    #[snafu(display("Timed out after {waited_ms} ms waiting for {mode} lock on {path}"))]
    LockTimeout {
        /// Container whose lock was contended.
        path: String,
        /// Lock mode requested.
        mode: LockMode,
        /// Time spent waiting before giving up.
        waited_ms: u128,
    },

    /// Schema or shape violation.
    #[snafu(display("Schema error: {source}"))]
    Schema {
        /// Underlying schema error.
        source: SchemaError,
    },

    /// A slice was requested without any time selector.
    #[snafu(display(
        "No time selector given; specify an interval, begin, end or duration \
         (use dump for whole columns)"
    ))]
    AmbiguousRange,

    /// The resolved time window matched no rows.
    #[snafu(display("Group {group} has no rows within [{begin}, {end}]"))]
    EmptyRange {
        /// Group that was sliced.
        group: String,
        /// Inclusive lower bound of the resolved window.
        begin: i64,
        /// Inclusive upper bound of the resolved window.
        end: i64,
    },

    /// Filesystem failure.
    #[snafu(display("I/O error at {path}: {source}"))]
    Io {
        /// Path being accessed.
        path: String,
        /// Underlying I/O error.
        source: std::io::Error,
        /// Backtrace captured at the failure site.
        backtrace: Backtrace,
    },

    /// The container bytes do not decode to a valid frame sequence.
    #[snafu(display("Corrupt container {path}: {msg}"))]
    Corrupt {
        /// Container path.
        path: String,
        /// Description of the corruption.
        msg: String,
        /// Backtrace for debugging.
        backtrace: Backtrace,
    },

    /// A mutating operation was attempted through a read handle.
    #[snafu(display("Container {path} is open read-only"))]
    ReadOnly {
        /// Container path.
        path: String,
    },

    /// An operation was attempted through a handle that was already closed.
    #[snafu(display("Container handle for {path} is closed"))]
    Closed {
        /// Container path.
        path: String,
    },

    /// The named group has no table.
    #[snafu(display("Group {group} does not exist or has no table"))]
    UnknownGroup {
        /// Group path as supplied.
        group: String,
    },

    /// Row ids are `u32`; the table cannot hold more rows.
    #[snafu(display("Group {group} cannot hold more rows"))]
    TableFull {
        /// Group that is full.
        group: String,
    },

    /// Timestamp text did not match the supplied format.
    #[snafu(display("Cannot parse timestamp {text:?} with format {format:?}: {source}"))]
    InvalidTimestamp {
        /// Input text.
        text: String,
        /// `strftime`-style format.
        format: String,
        /// Underlying chrono parse error.
        source: chrono::ParseError,
    },

    /// A UTC offset or local time could not be mapped to a single instant.
    #[snafu(display("Cannot map {text:?} at UTC offset {offset_seconds}s to a single instant"))]
    InvalidLocalTime {
        /// Input text.
        text: String,
        /// Offset east of UTC, in seconds.
        offset_seconds: i32,
    },

    /// A configuration document could not be parsed.
    #[snafu(display("Invalid configuration {origin}: {source}"))]
    InvalidConfig {
        /// File path, or `<string>` for inline JSON.
        origin: String,
        /// Underlying JSON error.
        source: serde_json::Error,
    },

    /// Arrow error while building an export batch.
    #[snafu(display("Arrow error while building record batch: {source}"))]
    Arrow {
        /// Underlying Arrow error.
        source: ArrowError,
    },
}

/// Inconsistencies found while applying catalog actions or replaying frames.
///
/// Never returned to callers directly; the container reports these as
/// [`ArchiveError::Corrupt`].
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub(crate) enum CatalogError {
    #[snafu(display("table for {group} declared twice"))]
    DuplicateTable { group: String },

    #[snafu(display("group id {group_id} reused by {group}"))]
    ReusedGroupId { group_id: u32, group: String },

    #[snafu(display("{name} declared twice in {group}"))]
    DuplicateAux { group: String, name: String },

    #[snafu(display("{group} refers to undeclared auxiliary array {name}"))]
    UndeclaredAux { group: String, name: String },

    #[snafu(display("group {group} has no table"))]
    MissingTable { group: String },

    #[snafu(display("no group has id {group_id}"))]
    UnknownGroupId { group_id: u32 },

    #[snafu(display("undecodable catalog action: {source}"))]
    UndecodableAction { source: serde_json::Error },

    #[snafu(display("short {kind} frame"))]
    ShortFrame { kind: &'static str },
}

impl ArchiveError {
    /// Whether retrying the same call later may succeed.
    ///
    /// Only lock timeouts are transient; callers should back off between
    /// attempts.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ArchiveError::LockTimeout { .. })
    }

    /// Borrow the schema error, if this is one.
    pub fn as_schema_error(&self) -> Option<&SchemaError> {
        match self {
            ArchiveError::Schema { source } => Some(source),
            _ => None,
        }
    }
}

impl From<SchemaError> for ArchiveError {
    fn from(source: SchemaError) -> Self {
        ArchiveError::Schema { source }
    }
}
