//! Append engine: admission, row encoding and frame writes.
//!
//! One call to [`Container::append`] inserts at most one row:
//!
//! 1. The values are encoded against the table schema. Unknown columns or a
//!    shape mismatch fail with a `SchemaError` and nothing is written.
//! 2. The [`AdmissionPredicate`] is consulted. A rejection returns `false`
//!    and leaves the container untouched.
//! 3. The row frame is appended and the row directory extended. With
//!    auto-indexing on, the row is merged into the time index immediately.
//!
//! The engine never orders or deduplicates rows itself; that is the
//! predicate's job.

use std::time::{Duration, Instant};

use log::{debug, info};
use snafu::prelude::*;

use crate::{
    array::{Array, Values},
    container::Container,
    error::{ArchiveResult, IoSnafu, ShapeMismatchSnafu, TableFullSnafu, UnknownColumnSnafu},
    group::GroupPath,
    schema::encode_f32s,
    storage::frame::{FrameKind, encode_aux_payload, encode_row_payload},
};

/// Decides whether a row may be appended.
///
/// Implemented for closures with the same signature, so ad-hoc policies can
/// be passed inline:
///
/// ```
/// use obsarchive_core::{AdmissionPredicate, Container, GroupPath, Values};
///
/// fn after_2020(_: &Container, _: &GroupPath, time: i64, _: &Values) -> bool {
///     time >= 1_577_836_800
/// }
/// fn takes(_: &dyn AdmissionPredicate) {}
/// takes(&after_2020);
/// ```
pub trait AdmissionPredicate {
    /// Return `true` to admit the row.
    fn admit(&self, container: &Container, group: &GroupPath, time: i64, values: &Values) -> bool;
}

impl<F> AdmissionPredicate for F
where
    F: Fn(&Container, &GroupPath, i64, &Values) -> bool,
{
    fn admit(&self, container: &Container, group: &GroupPath, time: i64, values: &Values) -> bool {
        self(container, group, time, values)
    }
}

/// Admit every row.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAll;

impl AdmissionPredicate for AcceptAll {
    fn admit(&self, _: &Container, _: &GroupPath, _: i64, _: &Values) -> bool {
        true
    }
}

/// Reject rows whose time is already present in the group.
#[derive(Debug, Clone, Copy, Default)]
pub struct RejectDuplicateTime;

impl AdmissionPredicate for RejectDuplicateTime {
    fn admit(&self, container: &Container, group: &GroupPath, time: i64, _: &Values) -> bool {
        container
            .group(group)
            .map_or(true, |g| !g.index.contains(&g.rows.times, time))
    }
}

/// Admit only rows strictly later than the last appended row.
#[derive(Debug, Clone, Copy, Default)]
pub struct RequireIncreasingTime;

impl AdmissionPredicate for RequireIncreasingTime {
    fn admit(&self, container: &Container, group: &GroupPath, time: i64, _: &Values) -> bool {
        container
            .group(group)
            .ok()
            .and_then(|g| g.rows.times.last().copied())
            .is_none_or(|last| time > last)
    }
}

/// One record handed to [`Container::append_batch`].
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    /// Epoch seconds, UTC.
    pub time: i64,
    /// Column values; absent columns take their default fill.
    pub values: Values,
}

impl Observation {
    /// Observation with no values yet.
    pub fn new(time: i64) -> Self {
        Self {
            time,
            values: Values::new(),
        }
    }

    /// Set one column value.
    pub fn with(mut self, column: impl Into<String>, value: impl Into<Array>) -> Self {
        self.values.insert(column.into(), value.into());
        self
    }
}

/// Outcome of a batch append.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppendReport {
    /// Group appended to.
    pub group: String,
    /// Rows written.
    pub accepted: usize,
    /// Rows the predicate turned away.
    pub rejected: usize,
    /// Rows in the table after the batch.
    pub total_rows: usize,
    /// Wall time spent in the batch.
    pub elapsed: Duration,
}

impl Container {
    /// Append one row to `group` if `predicate` admits it.
    ///
    /// Returns `Ok(false)` when the predicate rejects the row. Schema
    /// violations are errors even for rows the predicate would reject.
    pub fn append<P>(
        &mut self,
        group: &str,
        time: i64,
        values: &Values,
        predicate: &P,
    ) -> ArchiveResult<bool>
    where
        P: AdmissionPredicate + ?Sized,
    {
        self.ensure_writable()?;
        let path = GroupPath::parse(group)?;
        let cells = self.group(&path)?.schema.encode_row(&path, values)?;

        if !predicate.admit(self, &path, time, values) {
            debug!("predicate rejected row at {time} for {path}");
            return Ok(false);
        }
        self.append_cells(&path, time, cells)?;
        Ok(true)
    }

    /// Append a sequence of observations through this handle.
    ///
    /// Stops at the first error; rows written before it stay written.
    pub fn append_batch<I, P>(
        &mut self,
        group: &str,
        records: I,
        predicate: &P,
    ) -> ArchiveResult<AppendReport>
    where
        I: IntoIterator<Item = Observation>,
        P: AdmissionPredicate + ?Sized,
    {
        let start = Instant::now();
        let mut accepted = 0;
        let mut rejected = 0;
        for record in records {
            if self.append(group, record.time, &record.values, predicate)? {
                accepted += 1;
            } else {
                rejected += 1;
            }
        }

        let report = AppendReport {
            group: group.to_string(),
            accepted,
            rejected,
            total_rows: self.row_count(group)?,
            elapsed: start.elapsed(),
        };
        info!(
            "appended {} rows to {} ({} rejected) in {:?}",
            report.accepted, report.group, report.rejected, report.elapsed
        );
        Ok(report)
    }

    /// Replace the contents of an auxiliary array.
    ///
    /// The shape must equal the declared shape; the array's shape never
    /// changes after build.
    pub fn write_aux(&mut self, group: &str, name: &str, array: &Array) -> ArchiveResult<()> {
        self.ensure_writable()?;
        let path = GroupPath::parse(group)?;
        let state = self.group(&path)?;
        let aux = state.aux.get(name).context(UnknownColumnSnafu {
            group: path.to_string(),
            name,
        })?;
        ensure!(
            aux.spec.shape == array.shape(),
            ShapeMismatchSnafu {
                group: path.to_string(),
                name,
                expected: aux.spec.shape.clone(),
                found: array.shape().to_vec(),
            }
        );

        let (group_id, compression) = (state.id, state.compression);
        let stored = compression.encode(encode_f32s(array)).context(IoSnafu {
            path: self.path().display().to_string(),
        })?;
        let payload = encode_aux_payload(group_id, name, &stored);
        let frame = self.write_frame(FrameKind::Aux, &payload)?;
        if let Some(aux) = self.group_mut(&path)?.aux.get_mut(name) {
            aux.latest = Some(frame);
        }
        debug!("rewrote auxiliary array {name} in {path}");
        Ok(())
    }

    fn append_cells(&mut self, path: &GroupPath, time: i64, cells: Vec<u8>) -> ArchiveResult<()> {
        let state = self.group(path)?;
        ensure!(
            state.rows.len() < u32::MAX as usize,
            TableFullSnafu {
                group: path.to_string(),
            }
        );
        let (group_id, compression) = (state.id, state.compression);
        let stored = compression.encode(cells).context(IoSnafu {
            path: self.path().display().to_string(),
        })?;
        let payload = encode_row_payload(group_id, time, &stored);
        let frame = self.write_frame(FrameKind::Row, &payload)?;

        let state = self.group_mut(path)?;
        state.rows.push(time, frame);
        if state.auto_index && state.has_time_index {
            state.index.refresh_dirty(&state.rows.times);
        }
        Ok(())
    }
}
