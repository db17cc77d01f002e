//! Whole-column dumps and container introspection.

use std::fmt;

use chrono::{DateTime, Utc};
use snafu::prelude::*;

use crate::{
    array::{Array, element_count},
    catalog::RootAttrs,
    container::{Container, OpenMode},
    error::{ArchiveResult, IoSnafu, UnknownColumnSnafu},
    group::GroupPath,
    query::ReadPlan,
    schema::{AuxSpec, ColumnSpec, Compression, SENTINEL_FILL, TIME_COLUMN, decode_f32s},
    storage::frame::{FrameKind, decode_aux_payload},
};

impl Container {
    /// Full contents of `name` in `group`, independent of time.
    ///
    /// If `name` is one of the group's auxiliary arrays, its contents are
    /// returned. Otherwise the whole table column is returned in append
    /// order with shape `[rows, ..cell shape]`. Passing `time` fails with
    /// `UnknownColumn`; the time column is read with [`Container::dump_time`].
    pub fn dump(&mut self, group: &str, name: &str) -> ArchiveResult<Array> {
        self.ensure_open()?;
        let path = GroupPath::parse(group)?;
        let state = self.group(&path)?;
        if state.is_aux(name) {
            return self.aux_array(&path, name);
        }

        let spec = state.schema.column(name).context(UnknownColumnSnafu {
            group: path.to_string(),
            name,
        })?;
        let rows = state.rows.len();
        if rows == 0 {
            let mut shape = vec![0];
            shape.extend(&spec.shape);
            return Ok(Array::new(shape, Vec::new())?);
        }

        let ids: Vec<u32> = (0..rows as u32).collect();
        let plan = ReadPlan::Contiguous {
            first: 0,
            last: rows as u32 - 1,
        };
        let mut columns = self.gather_columns(&path, &ids, &[name.to_string()], &plan)?;
        match columns.pop() {
            Some((_, array)) => Ok(array),
            None => Err(self.corrupt(format!("column {name} of {path} produced no data"))),
        }
    }

    /// The time column of `group` in append order.
    pub fn dump_time(&self, group: &str) -> ArchiveResult<Vec<i64>> {
        self.ensure_open()?;
        let path = GroupPath::parse(group)?;
        Ok(self.group(&path)?.rows.times.clone())
    }

    /// Current contents of an auxiliary array. Arrays that were never
    /// written read back as sentinel fill.
    pub fn read_aux(&mut self, group: &str, name: &str) -> ArchiveResult<Array> {
        self.ensure_open()?;
        let path = GroupPath::parse(group)?;
        self.aux_array(&path, name)
    }

    pub(crate) fn aux_array(&mut self, path: &GroupPath, name: &str) -> ArchiveResult<Array> {
        let state = self.group(path)?;
        let aux = state.aux.get(name).context(UnknownColumnSnafu {
            group: path.to_string(),
            name,
        })?;
        let shape = aux.spec.shape.clone();
        let Some(frame) = aux.latest else {
            return Ok(Array::filled(shape, SENTINEL_FILL));
        };
        let compression = state.compression;

        let payload = self.read_frame(frame, FrameKind::Aux)?;
        let (_, _, stored) = decode_aux_payload(&payload)
            .ok_or_else(|| self.corrupt(format!("short aux frame at offset {}", frame.offset)))?;
        let raw = compression
            .decode(stored, element_count(&shape) * size_of::<f32>())
            .map_err(|e| self.corrupt(format!("undecodable auxiliary array {name}: {e}")))?;
        let mut values = Vec::new();
        decode_f32s(&raw, &mut values);
        Ok(Array::new(shape, values)?)
    }

    /// Summary of the container and every group in it.
    pub fn stat(&self) -> ArchiveResult<ContainerStat> {
        self.ensure_open()?;
        let file_bytes = std::fs::metadata(self.path())
            .context(IoSnafu {
                path: self.path().display().to_string(),
            })?
            .len();

        let groups = self
            .catalog
            .groups
            .values()
            .map(|g| {
                let times = &g.rows.times;
                let time_range = g
                    .index
                    .min_time(times)
                    .zip(times.iter().copied().max());
                GroupStat {
                    path: g.path.clone(),
                    rows: g.rows.len(),
                    columns: g.schema.columns().to_vec(),
                    aux: g
                        .aux_names
                        .iter()
                        .filter_map(|n| g.aux.get(n))
                        .map(|a| AuxStat {
                            spec: a.spec.clone(),
                            written: a.latest.is_some(),
                        })
                        .collect(),
                    compression: g.compression,
                    auto_index: g.auto_index,
                    indexed_rows: g.index.indexed_rows(),
                    time_range,
                }
            })
            .collect();

        Ok(ContainerStat {
            path: self.path().display().to_string(),
            mode: self.mode(),
            file_bytes,
            root: self.root_attrs().cloned(),
            groups,
        })
    }
}

/// Summary of one container.
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerStat {
    /// Container path.
    pub path: String,
    /// Mode of the handle that produced the summary.
    pub mode: OpenMode,
    /// File size on disk. Frames still buffered by a write handle are not
    /// counted until flushed.
    pub file_bytes: u64,
    /// Root attributes, if any group has been built.
    pub root: Option<RootAttrs>,
    /// Groups that hold a table.
    pub groups: Vec<GroupStat>,
}

/// Summary of one group.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupStat {
    /// Group path.
    pub path: GroupPath,
    /// Rows in the table.
    pub rows: usize,
    /// Value columns.
    pub columns: Vec<ColumnSpec>,
    /// Auxiliary arrays in declaration order.
    pub aux: Vec<AuxStat>,
    /// Codec for cells and auxiliary data.
    pub compression: Compression,
    /// Whether appends refresh the index immediately.
    pub auto_index: bool,
    /// Rows covered by the index watermark.
    pub indexed_rows: usize,
    /// Earliest and latest time, if any rows exist.
    pub time_range: Option<(i64, i64)>,
}

/// Summary of one auxiliary array.
#[derive(Debug, Clone, PartialEq)]
pub struct AuxStat {
    /// Name and shape.
    pub spec: AuxSpec,
    /// Whether contents have been written since build.
    pub written: bool,
}

impl fmt::Display for ContainerStat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} ({} bytes)", self.path, self.file_bytes)?;
        if let Some(root) = &self.root {
            writeln!(
                f,
                "  created by {} (format {}) at {}",
                root.creator, root.format_version, root.created_at
            )?;
        }
        for g in &self.groups {
            write!(f, "{g}")?;
        }
        Ok(())
    }
}

impl fmt::Display for GroupStat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let compression = match self.compression {
            Compression::None => "none".to_string(),
            Compression::Zstd { level } => format!("zstd({level})"),
        };
        writeln!(
            f,
            "  {}: {} rows, {} indexed, auto-index {}, compression {}",
            self.path,
            self.rows,
            self.indexed_rows,
            if self.auto_index { "on" } else { "off" },
            compression
        )?;
        if let Some((lo, hi)) = self.time_range {
            writeln!(f, "    {TIME_COLUMN}: {} .. {}", fmt_time(lo), fmt_time(hi))?;
        }
        for c in &self.columns {
            writeln!(f, "    {} {:?} default {}", c.name, c.shape, c.default)?;
        }
        for a in &self.aux {
            let state = if a.written { "written" } else { "unwritten" };
            writeln!(f, "    aux {} {:?} ({state})", a.spec.name, a.spec.shape)?;
        }
        Ok(())
    }
}

fn fmt_time(t: i64) -> String {
    DateTime::<Utc>::from_timestamp(t, 0).map_or_else(|| t.to_string(), |d| d.to_rfc3339())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        append::AcceptAll,
        array::Values,
        config::ArchiveConfig,
        error::{ArchiveError, SchemaError},
        schema::GroupSchema,
        storage::frame::encode_aux_payload,
    };
    use tempfile::TempDir;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    fn container(tmp: &TempDir, compression: Compression) -> ArchiveResult<Container> {
        let cfg = ArchiveConfig::default().with_sync_on_close(false);
        let mut c = Container::create(tmp.path().join("a.oba"), true, &cfg)?;
        c.build(
            "/ct12",
            &GroupSchema::new()
                .column("bs", [2])
                .aux("height", [2])
                .compression(compression),
        )?;
        Ok(c)
    }

    #[test]
    fn dump_returns_column_in_append_order() -> TestResult {
        for compression in [Compression::None, Compression::Zstd { level: 1 }] {
            let tmp = TempDir::new()?;
            let mut c = container(&tmp, compression)?;
            for (t, v) in [(30, 3.0), (10, 1.0), (20, 2.0)] {
                let mut values = Values::new();
                values.insert("bs".to_string(), Array::vector(vec![v, v]));
                c.append("/ct12", t, &values, &AcceptAll)?;
            }

            let bs = c.dump("/ct12", "bs")?;
            assert_eq!(bs.shape(), &[3, 2]);
            assert_eq!(bs.values(), &[3.0, 3.0, 1.0, 1.0, 2.0, 2.0]);
            assert_eq!(c.dump_time("/ct12")?, vec![30, 10, 20]);
        }
        Ok(())
    }

    #[test]
    fn unwritten_aux_reads_as_sentinel_then_latest_write_wins() -> TestResult {
        let tmp = TempDir::new()?;
        let mut c = container(&tmp, Compression::default())?;
        assert_eq!(c.dump("/ct12", "height")?.values(), &[SENTINEL_FILL; 2]);

        c.write_aux("/ct12", "height", &Array::vector(vec![1.0, 2.0]))?;
        c.write_aux("/ct12", "height", &Array::vector(vec![5.0, 6.0]))?;
        assert_eq!(c.read_aux("/ct12", "height")?.values(), &[5.0, 6.0]);
        Ok(())
    }

    #[test]
    fn dump_of_empty_table_has_zero_rows() -> TestResult {
        let tmp = TempDir::new()?;
        let mut c = container(&tmp, Compression::None)?;
        assert_eq!(c.dump("/ct12", "bs")?.shape(), &[0, 2]);
        assert!(matches!(
            c.dump("/ct12", "nope"),
            Err(ArchiveError::Schema { .. })
        ));
        Ok(())
    }

    #[test]
    fn time_column_is_only_available_through_dump_time() -> TestResult {
        let tmp = TempDir::new()?;
        let mut c = container(&tmp, Compression::None)?;
        c.append("/ct12", 1_700_000_001, &Values::new(), &AcceptAll)?;

        let err = c.dump("/ct12", TIME_COLUMN).expect_err("time is not an f32 column");
        assert!(matches!(
            err.as_schema_error(),
            Some(SchemaError::UnknownColumn { name, .. }) if name == TIME_COLUMN
        ));
        assert_eq!(c.dump_time("/ct12")?, vec![1_700_000_001]);
        Ok(())
    }

    #[test]
    fn undecodable_aux_data_is_corrupt() -> TestResult {
        let tmp = TempDir::new()?;
        let cfg = ArchiveConfig::default().with_sync_on_close(false);
        {
            let mut c = container(&tmp, Compression::Zstd { level: 1 })?;
            let group_id = c.group(&GroupPath::parse("/ct12")?)?.id;
            // Valid frame checksum, but the payload is not a zstd stream.
            let payload = encode_aux_payload(group_id, "height", &[1, 2, 3]);
            c.write_frame(FrameKind::Aux, &payload)?;
        }

        let mut c = Container::open_read(tmp.path().join("a.oba"), &cfg)?;
        assert!(matches!(
            c.read_aux("/ct12", "height"),
            Err(ArchiveError::Corrupt { .. })
        ));
        Ok(())
    }

    #[test]
    fn stat_reports_groups() -> TestResult {
        let tmp = TempDir::new()?;
        let mut c = container(&tmp, Compression::None)?;
        c.append("/ct12", 1_000, &Values::new(), &AcceptAll)?;
        c.flush()?;

        let stat = c.stat()?;
        assert_eq!(stat.groups.len(), 1);
        let g = &stat.groups[0];
        assert_eq!((g.rows, g.indexed_rows), (1, 1));
        assert_eq!(g.time_range, Some((1_000, 1_000)));
        assert!(!g.aux[0].written);
        assert!(stat.to_string().contains("/ct12: 1 rows"));
        Ok(())
    }
}
