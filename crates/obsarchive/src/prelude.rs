//! Wrapper prelude.
//!
//! The `obsarchive` crate is the supported public entry point. Downstream
//! code should prefer importing from this prelude instead of depending on
//! `obsarchive-core` module paths.

pub use crate::time;
pub use crate::{
    AcceptAll, AdmissionPredicate, Archive, ArchiveConfig, ArchiveError, ArchiveResult, Array,
    ColumnSpec, Compression, Container, GroupSchema, IndexMode, Observation, RejectDuplicateTime,
    RequireIncreasingTime, SchemaError, SliceRequest, SliceResult, TimeSelector, Values,
};
