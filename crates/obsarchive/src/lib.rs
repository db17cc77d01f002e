//! # obsarchive
//!
//! Append-only, time-indexed archive for multi-dimensional instrument
//! observations, stored in a single local file.
//!
//! This crate is the supported public entry point and provides a small,
//! stable surface over `obsarchive-core`.
//!
//! ## Example
//!
//! ```rust
//! use obsarchive::prelude::*;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let dir = tempfile::tempdir()?;
//! let archive = Archive::new(dir.path().join("ct12.oba"));
//! archive.create("/ct12", &GroupSchema::new().column("bs", [250]), true)?;
//! assert!(archive.stat()?.groups[0].rows == 0);
//! # Ok(())
//! # }
//! ```

/// Convenience prelude with the stable, supported surface.
pub mod prelude;

/// Timestamp parsing helpers.
pub mod time {
    pub use obsarchive_core::time::{parse_local_timestamp, parse_timestamp};
}

pub use obsarchive_core::{
    AcceptAll, AdmissionPredicate, AppendReport, Archive, ArchiveConfig, ArchiveError,
    ArchiveResult, Array, AuxSpec, AuxStat, ColumnSpec, Compression, Container, ContainerStat,
    FORMAT_VERSION, GroupPath, GroupSchema, GroupStat, IndexMode, LockMode, Observation, OpenMode,
    ReadPlan, RejectDuplicateTime, RequireIncreasingTime, RootAttrs, SENTINEL_FILL, SchemaError,
    SliceRequest, SliceResult, TIME_COLUMN, TimeSelector, Values, lock_path,
};
