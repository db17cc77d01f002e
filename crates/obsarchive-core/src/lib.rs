//! Core engine for a file-backed time-series archive of instrument
//! observations.
//!
//! This crate provides the storage engine behind `obsarchive`:
//!
//! - A single-file container made of checksummed frames, with an advisory
//!   lock on a `<container>.lock` sidecar (`container`, `storage` modules).
//! - Explicit, immutable group schemas: fixed-shape `f32` columns after an
//!   implicit `time` column, plus time-invariant auxiliary arrays
//!   (`schema`, `catalog` modules).
//! - Predicate-gated incremental appends (`append` module).
//! - A clustered ascending time index with auto or on-demand maintenance
//!   (`index` module).
//! - Time-range slices with per-request read-plan selection and an Arrow
//!   export, plus whole-column dumps and introspection (`query`, `dump`
//!   modules).
//!
//! Everything is synchronous. A [`Container`] is an explicit handle that
//! owns its lock until it is closed or dropped; [`Archive`] wraps the
//! handle-per-operation pattern for one-off calls.
//!
//! ```
//! use obsarchive_core::{AcceptAll, Archive, Array, GroupSchema, SliceRequest, Values};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let dir = tempfile::tempdir()?;
//! let archive = Archive::new(dir.path().join("site.oba"));
//! archive.create("/ct12", &GroupSchema::new().column("bs", [4]).aux("height", [4]), true)?;
//!
//! let mut values = Values::new();
//! values.insert("bs".to_string(), Array::vector(vec![1.0, 2.0, 3.0, 4.0]));
//! archive.append("/ct12", 1_000, &values, &AcceptAll)?;
//!
//! let slice = archive.slice("/ct12", &SliceRequest::new(["bs"]).interval(900, 1_100))?;
//! assert_eq!(slice.times, vec![1_000]);
//! # Ok(())
//! # }
//! ```
#![deny(missing_docs)]

pub mod append;
pub mod archive;
pub mod array;
mod builder;
pub mod catalog;
pub mod config;
pub mod container;
pub mod dump;
pub mod error;
pub mod group;
pub mod index;
pub mod query;
pub mod schema;
pub mod storage;
pub mod time;

pub use append::{
    AcceptAll, AdmissionPredicate, AppendReport, Observation, RejectDuplicateTime,
    RequireIncreasingTime,
};
pub use archive::Archive;
pub use array::{Array, Values};
pub use catalog::{FORMAT_VERSION, RootAttrs};
pub use config::ArchiveConfig;
pub use container::{Container, OpenMode};
pub use dump::{AuxStat, ContainerStat, GroupStat};
pub use error::{ArchiveError, ArchiveResult, SchemaError};
pub use group::GroupPath;
pub use index::IndexMode;
pub use query::{ReadPlan, SliceRequest, SliceResult, TimeSelector};
pub use schema::{AuxSpec, ColumnSpec, Compression, GroupSchema, SENTINEL_FILL, TIME_COLUMN};
pub use storage::{LockMode, lock_path};
