//! Range queries over a group's table.
//!
//! A slice resolves a [`TimeSelector`] to an inclusive `[begin, end]`
//! window, looks the window up in the time index, and reads the requested
//! columns for the matched rows. Results are time-ascending; rows with equal
//! times keep append order.
//!
//! # Read plans
//!
//! - [`ReadPlan::Projection`] (one or two columns): per matched row, read
//!   and verify that row's frame, then copy out only the requested cells.
//! - [`ReadPlan::Contiguous`] (more columns, matched row ids form one
//!   consecutive run) and [`ReadPlan::Gathered`] (more columns, scattered
//!   row ids): walk the matched frames in file order and read each run of
//!   back-to-back frames as one span, placing every row at its output
//!   position. A run never crosses bytes that belong to other frames, and
//!   stops at `MAX_SPAN_ROWS` rows or `MAX_SPAN_BYTES` bytes.
//!
//! Every plan checks each frame's checksum before using its cells, so a
//! damaged row surfaces as [`ArchiveError::Corrupt`](crate::ArchiveError)
//! whichever plan reads it.
//!
//! # Window resolution
//!
//! | Selector                          | Window                      |
//! |-----------------------------------|-----------------------------|
//! | `Interval { begin, end }`         | `[begin, end]`              |
//! | `Since { begin, duration: None }` | `[begin, end_time]`         |
//! | `Since { begin, duration: d }`    | `[begin, begin + d]`        |
//! | `Until { end, duration: d }`      | `[end - d, end]`            |
//! | `Until { end, duration: None }`   | `[min time, end]`           |
//! | `Latest { duration: d }`          | `[end_time - d, end_time]`  |
//!
//! `end_time` is the largest time among the last `tail_scan_rows` rows in
//! append order (see [`ArchiveConfig`](crate::ArchiveConfig)).

use std::{
    collections::{HashMap, HashSet},
    ops::Range,
    sync::Arc,
};

use arrow::{
    array::{ArrayRef, FixedSizeListArray, Float32Array, TimestampSecondArray},
    datatypes::{DataType, Field, Schema, TimeUnit},
    record_batch::RecordBatch,
};
use bytes::Buf;
use log::debug;
use roaring::RoaringBitmap;
use snafu::prelude::*;

use crate::{
    array::{Array, element_count},
    container::Container,
    error::{AmbiguousRangeSnafu, ArchiveResult, ArrowSnafu, EmptyRangeSnafu, UnknownColumnSnafu},
    group::GroupPath,
    schema::{ColumnLayout, Compression, TIME_COLUMN},
    storage::frame::{FrameKind, FrameRef, decode_row_payload, open_frame},
};

/// Rows read per span in the contiguous and gathered plans.
const MAX_SPAN_ROWS: usize = 1024;

/// Bytes read per span in the contiguous and gathered plans. A single frame
/// larger than this is still read whole.
const MAX_SPAN_BYTES: u64 = 4 << 20;

/// How the time window of a slice is chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeSelector {
    /// Explicit inclusive window.
    Interval {
        /// Lower bound.
        begin: i64,
        /// Upper bound.
        end: i64,
    },
    /// From `begin`, for `duration` seconds or to the end of the table.
    Since {
        /// Lower bound.
        begin: i64,
        /// Window length; `None` runs to the end of the table.
        duration: Option<i64>,
    },
    /// Up to `end`, for `duration` seconds or from the start of the table.
    Until {
        /// Upper bound.
        end: i64,
        /// Window length; `None` runs from the earliest row.
        duration: Option<i64>,
    },
    /// The last `duration` seconds of the table.
    Latest {
        /// Window length.
        duration: i64,
    },
}

impl TimeSelector {
    /// Map loose optional arguments onto a selector.
    ///
    /// Precedence: `interval`, then `duration` alone, then `begin` with
    /// `duration`, then `end` with `duration`, then `begin` and/or `end`.
    /// Fails with `AmbiguousRange` when nothing is given.
    pub fn from_parts(
        interval: Option<(i64, i64)>,
        begin: Option<i64>,
        end: Option<i64>,
        duration: Option<i64>,
    ) -> ArchiveResult<Self> {
        let selector = match (interval, begin, end, duration) {
            (Some((begin, end)), ..) => TimeSelector::Interval { begin, end },
            (None, None, None, Some(duration)) => TimeSelector::Latest { duration },
            (None, Some(begin), _, Some(d)) => TimeSelector::Since {
                begin,
                duration: Some(d),
            },
            (None, None, Some(end), Some(d)) => TimeSelector::Until {
                end,
                duration: Some(d),
            },
            (None, Some(begin), Some(end), None) => TimeSelector::Interval { begin, end },
            (None, Some(begin), None, None) => TimeSelector::Since {
                begin,
                duration: None,
            },
            (None, None, Some(end), None) => TimeSelector::Until {
                end,
                duration: None,
            },
            (None, None, None, None) => return AmbiguousRangeSnafu.fail(),
        };
        Ok(selector)
    }

    /// Resolve to an inclusive window given the table's end time and
    /// earliest time (both `None` for an empty table).
    pub fn window(&self, end_time: Option<i64>, min_time: Option<i64>) -> (i64, i64) {
        match *self {
            TimeSelector::Interval { begin, end } => (begin, end),
            TimeSelector::Since {
                begin,
                duration: Some(d),
            } => (begin, begin.saturating_add(d)),
            TimeSelector::Since {
                begin,
                duration: None,
            } => (begin, end_time.unwrap_or(i64::MAX)),
            TimeSelector::Until {
                end,
                duration: Some(d),
            } => (end.saturating_sub(d), end),
            TimeSelector::Until {
                end,
                duration: None,
            } => (min_time.unwrap_or(i64::MIN), end),
            TimeSelector::Latest { duration } => match end_time {
                Some(end) => (end.saturating_sub(duration), end),
                None => (i64::MIN, i64::MAX),
            },
        }
    }
}

/// Parameters of a slice.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SliceRequest {
    /// Columns to return. `time` is always returned and may be omitted.
    pub columns: Vec<String>,
    /// Time window; required.
    pub selector: Option<TimeSelector>,
    /// Auxiliary arrays to merge into the result.
    pub aux_names: Vec<String>,
}

impl SliceRequest {
    /// Request `columns` with no selector yet.
    pub fn new<I, S>(columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            columns: columns.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// Use an explicit selector.
    pub fn selector(mut self, selector: TimeSelector) -> Self {
        self.selector = Some(selector);
        self
    }

    /// `[begin, end]` inclusive.
    pub fn interval(self, begin: i64, end: i64) -> Self {
        self.selector(TimeSelector::Interval { begin, end })
    }

    /// From `begin`, optionally for `duration` seconds.
    pub fn since(self, begin: i64, duration: Option<i64>) -> Self {
        self.selector(TimeSelector::Since { begin, duration })
    }

    /// Up to `end`, optionally for `duration` seconds.
    pub fn until(self, end: i64, duration: Option<i64>) -> Self {
        self.selector(TimeSelector::Until { end, duration })
    }

    /// The last `duration` seconds of the table.
    pub fn latest(self, duration: i64) -> Self {
        self.selector(TimeSelector::Latest { duration })
    }

    /// Merge an auxiliary array into the result.
    pub fn with_aux(mut self, name: impl Into<String>) -> Self {
        self.aux_names.push(name.into());
        self
    }
}

/// Rows of one group within a time window.
#[derive(Debug, Clone, PartialEq)]
pub struct SliceResult {
    /// Group that was sliced.
    pub group: GroupPath,
    /// Inclusive lower bound of the resolved window.
    pub begin: i64,
    /// Inclusive upper bound of the resolved window.
    pub end: i64,
    /// Row times, ascending.
    pub times: Vec<i64>,
    /// Requested columns, each shaped `[rows, ..cell shape]`.
    pub columns: Vec<(String, Array)>,
    /// Requested auxiliary arrays, full contents.
    pub aux: Vec<(String, Array)>,
}

impl SliceResult {
    /// Number of matched rows.
    pub fn len(&self) -> usize {
        self.times.len()
    }

    /// Always `false`: empty windows are reported as `EmptyRange`.
    pub fn is_empty(&self) -> bool {
        self.times.is_empty()
    }

    /// A sliced column by name.
    pub fn column(&self, name: &str) -> Option<&Array> {
        self.columns.iter().find(|(n, _)| n == name).map(|(_, a)| a)
    }

    /// An auxiliary array by name.
    pub fn aux_array(&self, name: &str) -> Option<&Array> {
        self.aux.iter().find(|(n, _)| n == name).map(|(_, a)| a)
    }

    /// Convert the row-aligned part (time and columns) to an Arrow batch.
    ///
    /// `time` becomes `Timestamp(Second, "UTC")`. Scalar columns become
    /// `Float32`; shaped columns become `FixedSizeList<Float32>` whose field
    /// carries the cell shape as a comma-separated `shape` metadata entry.
    /// Auxiliary arrays are not row-aligned and are left out.
    pub fn to_record_batch(&self) -> ArchiveResult<RecordBatch> {
        let mut fields = vec![Field::new(
            TIME_COLUMN,
            DataType::Timestamp(TimeUnit::Second, Some("UTC".into())),
            false,
        )];
        let mut arrays: Vec<ArrayRef> = vec![Arc::new(
            TimestampSecondArray::from(self.times.clone()).with_timezone("UTC"),
        )];

        for (name, array) in &self.columns {
            let cell_shape = array.shape().get(1..).unwrap_or(&[]);
            let values = Float32Array::from(array.values().to_vec());
            if cell_shape.is_empty() {
                fields.push(Field::new(name, DataType::Float32, false));
                arrays.push(Arc::new(values));
                continue;
            }

            let width = element_count(cell_shape) as i32;
            let item = Arc::new(Field::new("item", DataType::Float32, false));
            let list = FixedSizeListArray::try_new(item.clone(), width, Arc::new(values), None)
                .context(ArrowSnafu)?;
            let shape = cell_shape
                .iter()
                .map(|d| d.to_string())
                .collect::<Vec<_>>()
                .join(",");
            fields.push(
                Field::new(name, DataType::FixedSizeList(item, width), false)
                    .with_metadata(HashMap::from([("shape".to_string(), shape)])),
            );
            arrays.push(Arc::new(list));
        }

        RecordBatch::try_new(Arc::new(Schema::new(fields)), arrays).context(ArrowSnafu)
    }
}

/// Strategy for reading matched rows.
#[derive(Debug, Clone, PartialEq)]
pub enum ReadPlan {
    /// Read only the requested cells of each row.
    Projection,
    /// Read row ids `first..=last` as one span.
    Contiguous {
        /// Lowest matched row id.
        first: u32,
        /// Highest matched row id.
        last: u32,
    },
    /// Read the matched row-id set in file order.
    Gathered(RoaringBitmap),
}

impl ReadPlan {
    /// Pick a plan for `columns` requested columns over matched `rows`.
    pub fn choose(columns: usize, rows: &[u32]) -> Self {
        if columns <= 2 {
            return ReadPlan::Projection;
        }
        let (Some(&first), Some(&last)) = (rows.iter().min(), rows.iter().max()) else {
            return ReadPlan::Projection;
        };
        if (last - first) as usize + 1 == rows.len() {
            ReadPlan::Contiguous { first, last }
        } else {
            ReadPlan::Gathered(rows.iter().copied().collect())
        }
    }
}

struct ColumnSink {
    name: String,
    layout: ColumnLayout,
    shape: Vec<usize>,
    values: Vec<f32>,
}

impl ColumnSink {
    fn fill(&mut self, pos: usize, mut bytes: &[u8]) {
        let start = pos * self.layout.elements;
        for slot in &mut self.values[start..start + self.layout.elements] {
            *slot = bytes.get_f32_le();
        }
    }
}

impl Container {
    /// Read `request.columns` for the rows of `group` inside the selected
    /// window.
    ///
    /// Fails with `AmbiguousRange` when no selector is set, `SchemaError`
    /// for unknown columns or auxiliary arrays, and `EmptyRange` when the
    /// window matches no rows.
    pub fn slice(&mut self, group: &str, request: &SliceRequest) -> ArchiveResult<SliceResult> {
        self.ensure_open()?;
        let selector = request.selector.context(AmbiguousRangeSnafu)?;
        let path = GroupPath::parse(group)?;

        let tail_scan_rows = self.config().tail_scan_rows;
        let state = self.group(&path)?;
        let mut seen = HashSet::new();
        let columns: Vec<String> = request
            .columns
            .iter()
            .filter(|c| c.as_str() != TIME_COLUMN && seen.insert(c.as_str()))
            .cloned()
            .collect();
        let unknown = columns
            .iter()
            .find(|name| state.schema.column(name).is_none())
            .or_else(|| {
                request
                    .aux_names
                    .iter()
                    .find(|name| !state.aux.contains_key(*name))
            });
        if let Some(name) = unknown {
            return UnknownColumnSnafu {
                group: path.to_string(),
                name: name.clone(),
            }
            .fail()
            .map_err(Into::into);
        }

        let times = &state.rows.times;
        let (begin, end) = selector.window(
            tail_end_time(times, tail_scan_rows),
            state.index.min_time(times),
        );
        let rows = state.index.lookup(times, begin, end);
        ensure!(
            !rows.is_empty(),
            EmptyRangeSnafu {
                group: path.to_string(),
                begin,
                end,
            }
        );
        let row_times: Vec<i64> = rows.iter().map(|&r| times[r as usize]).collect();

        let plan = ReadPlan::choose(columns.len(), &rows);
        debug!(
            "slice {path} [{begin}, {end}]: {} rows, {} columns, {}",
            rows.len(),
            columns.len(),
            plan_name(&plan)
        );
        let columns = self.gather_columns(&path, &rows, &columns, &plan)?;
        let aux = request
            .aux_names
            .iter()
            .map(|name| Ok((name.clone(), self.aux_array(&path, name)?)))
            .collect::<ArchiveResult<Vec<_>>>()?;

        Ok(SliceResult {
            group: path,
            begin,
            end,
            times: row_times,
            columns,
            aux,
        })
    }

    /// Largest time among the last `tail_scan_rows` rows, or `None` for an
    /// empty table.
    ///
    /// Assumes times arrive non-decreasing; older out-of-order rows are not
    /// considered.
    pub fn end_time(&self, group: &str) -> ArchiveResult<Option<i64>> {
        self.ensure_open()?;
        let path = GroupPath::parse(group)?;
        let state = self.group(&path)?;
        Ok(tail_end_time(&state.rows.times, self.config().tail_scan_rows))
    }

    /// Whether any row of `group` has exactly `time`.
    pub fn contains_time(&self, group: &str, time: i64) -> ArchiveResult<bool> {
        self.ensure_open()?;
        let path = GroupPath::parse(group)?;
        let state = self.group(&path)?;
        Ok(state.index.contains(&state.rows.times, time))
    }

    /// Read `columns` for `rows`; output position `i` holds row `rows[i]`.
    pub(crate) fn gather_columns(
        &mut self,
        path: &GroupPath,
        rows: &[u32],
        columns: &[String],
        plan: &ReadPlan,
    ) -> ArchiveResult<Vec<(String, Array)>> {
        let state = self.group(path)?;
        let compression = state.compression;
        let row_bytes = state.schema.row_bytes();

        let mut sinks = Vec::with_capacity(columns.len());
        for name in columns {
            let (spec, layout) = state
                .schema
                .column(name)
                .zip(state.schema.layout_of(name))
                .context(UnknownColumnSnafu {
                    group: path.to_string(),
                    name: name.clone(),
                })?;
            sinks.push(ColumnSink {
                name: name.clone(),
                layout,
                shape: spec.shape.clone(),
                values: vec![0.0; rows.len() * layout.elements],
            });
        }

        let frames = rows
            .iter()
            .map(|&r| state.rows.frames.get(r as usize).copied())
            .collect::<Option<Vec<FrameRef>>>()
            .ok_or_else(|| self.corrupt(format!("row directory of {path} is inconsistent")))?;

        match plan {
            ReadPlan::Projection => {
                for (pos, frame) in frames.iter().enumerate() {
                    let payload = self.read_frame(*frame, FrameKind::Row)?;
                    let cells = self.decode_cells(&payload, compression, row_bytes)?;
                    for sink in &mut sinks {
                        sink.fill(pos, &cells[sink.layout.byte_range()]);
                    }
                }
            }
            ReadPlan::Contiguous { .. } | ReadPlan::Gathered(_) => {
                self.read_runs(&frames, compression, row_bytes, &mut sinks)?;
            }
        }

        sinks
            .into_iter()
            .map(|sink| {
                let mut shape = Vec::with_capacity(sink.shape.len() + 1);
                shape.push(rows.len());
                shape.extend(&sink.shape);
                Ok((sink.name, Array::new(shape, sink.values)?))
            })
            .collect()
    }

    /// Read `frames` in file order, one span per run of adjacent frames,
    /// and fill row `pos` of every sink from `frames[pos]`.
    fn read_runs(
        &mut self,
        frames: &[FrameRef],
        compression: Compression,
        row_bytes: usize,
        sinks: &mut [ColumnSink],
    ) -> ArchiveResult<()> {
        let mut order: Vec<usize> = (0..frames.len()).collect();
        order.sort_unstable_by_key(|&pos| frames[pos].offset);
        let in_file_order: Vec<FrameRef> = order.iter().map(|&pos| frames[pos]).collect();

        for run in span_runs(&in_file_order) {
            let (first, last) = (in_file_order[run.start], in_file_order[run.end - 1]);
            let span = self.read_span(first.offset, last.end())?;

            for &pos in &order[run] {
                let frame = frames[pos];
                let start = (frame.offset - first.offset) as usize;
                let end = (frame.end() - first.offset) as usize;
                let bytes = span
                    .get(start..end)
                    .ok_or_else(|| self.corrupt(format!("short span at offset {}", frame.offset)))?;
                let payload = open_frame(bytes, FrameKind::Row)
                    .map_err(|e| self.corrupt(format!("{e} at offset {}", frame.offset)))?;
                let cells = self.decode_cells(payload, compression, row_bytes)?;
                for sink in sinks.iter_mut() {
                    sink.fill(pos, &cells[sink.layout.byte_range()]);
                }
            }
        }
        Ok(())
    }

    fn decode_cells(
        &self,
        payload: &[u8],
        compression: Compression,
        row_bytes: usize,
    ) -> ArchiveResult<Vec<u8>> {
        let (_, _, stored) =
            decode_row_payload(payload).ok_or_else(|| self.corrupt("short row frame"))?;
        compression
            .decode(stored, row_bytes)
            .map_err(|e| self.corrupt(format!("undecodable row cells: {e}")))
    }
}

fn plan_name(plan: &ReadPlan) -> &'static str {
    match plan {
        ReadPlan::Projection => "projection",
        ReadPlan::Contiguous { .. } => "contiguous span",
        ReadPlan::Gathered(_) => "gathered",
    }
}

pub(crate) fn tail_end_time(times: &[i64], tail_scan_rows: usize) -> Option<i64> {
    let from = times.len().saturating_sub(tail_scan_rows.max(1));
    times[from..].iter().copied().max()
}

/// Split frames sorted by offset into runs that can be read as one span.
///
/// A run breaks where a frame does not start at the previous frame's end,
/// after `MAX_SPAN_ROWS` frames, or before the span would exceed
/// `MAX_SPAN_BYTES`.
fn span_runs(frames: &[FrameRef]) -> Vec<Range<usize>> {
    let mut runs = Vec::new();
    let mut start = 0;
    for i in 1..=frames.len() {
        let breaks = i == frames.len()
            || frames[i].offset != frames[i - 1].end()
            || i - start == MAX_SPAN_ROWS
            || frames[i].end() - frames[start].offset > MAX_SPAN_BYTES;
        if breaks {
            runs.push(start..i);
            start = i;
        }
    }
    runs
}
