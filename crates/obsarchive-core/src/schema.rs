//! Schema descriptors for a group's table and auxiliary arrays.
//!
//! A group is declared once with an explicit, ordered [`GroupSchema`]:
//!
//! - `columns`: `(name, shape, default)` entries; the table stores `time` at
//!   position 0 followed by these columns in declaration order.
//! - `aux`: time-invariant arrays (for example a shared height grid) that are
//!   declared with a fixed shape and rewritten in place later.
//! - `compression`: one policy applied uniformly to the group's row cells and
//!   auxiliary data.
//!
//! The persisted part of the table description is [`TableSchema`], which also
//! owns the row cell layout used by the append and query paths.

use std::collections::BTreeSet;
use std::io;

use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use snafu::prelude::*;

use crate::{
    array::{Array, Values, element_count},
    error::{
        DuplicateNameSnafu, EmptySchemaSnafu, InvalidShapeSnafu, ReservedNameSnafu, SchemaError,
        ShapeMismatchSnafu, UnknownColumnSnafu,
    },
    group::GroupPath,
};

/// Fill value for cells absent from an append, and for auxiliary arrays that
/// have never been written.
pub const SENTINEL_FILL: f32 = -9999.0;

/// Name of the implicit time column (position 0 of every table).
pub const TIME_COLUMN: &str = "time";

/// One fixed-shape table column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnSpec {
    /// Column name.
    pub name: String,
    /// Per-row cell shape. Empty for scalar columns.
    pub shape: Vec<usize>,
    /// Fill value for rows that do not set this column.
    pub default: f32,
}

impl ColumnSpec {
    /// A column filled with [`SENTINEL_FILL`] when unset.
    pub fn new(name: impl Into<String>, shape: impl Into<Vec<usize>>) -> Self {
        Self {
            name: name.into(),
            shape: shape.into(),
            default: SENTINEL_FILL,
        }
    }

    /// Override the fill value.
    pub fn with_default(mut self, default: f32) -> Self {
        self.default = default;
        self
    }

    /// Number of `f32` elements in one cell.
    pub fn element_count(&self) -> usize {
        element_count(&self.shape)
    }
}

/// One time-invariant auxiliary array.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuxSpec {
    /// Array name.
    pub name: String,
    /// Fixed shape.
    pub shape: Vec<usize>,
}

impl AuxSpec {
    /// Declare an auxiliary array.
    pub fn new(name: impl Into<String>, shape: impl Into<Vec<usize>>) -> Self {
        Self {
            name: name.into(),
            shape: shape.into(),
        }
    }
}

/// Compression applied to a group's row cells and auxiliary data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "codec", rename_all = "snake_case")]
pub enum Compression {
    /// Store raw little-endian `f32` values.
    None,
    /// Zstandard at the given level.
    Zstd {
        /// Compression level (1-22).
        level: i32,
    },
}

impl Default for Compression {
    fn default() -> Self {
        Compression::Zstd { level: 3 }
    }
}

impl Compression {
    pub(crate) fn encode(&self, raw: Vec<u8>) -> io::Result<Vec<u8>> {
        match self {
            Compression::None => Ok(raw),
            Compression::Zstd { level } => zstd::encode_all(raw.as_slice(), *level),
        }
    }

    pub(crate) fn decode(&self, stored: &[u8], expected_len: usize) -> io::Result<Vec<u8>> {
        let raw = match self {
            Compression::None => stored.to_vec(),
            Compression::Zstd { .. } => zstd::decode_all(stored)?,
        };
        if raw.len() != expected_len {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("decoded {} bytes, expected {expected_len}", raw.len()),
            ));
        }
        Ok(raw)
    }
}

/// Full declaration of a group: table columns, auxiliary arrays and storage
/// policy. Passed once to `build`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupSchema {
    /// Table columns after `time`, in order.
    pub columns: Vec<ColumnSpec>,
    /// Auxiliary arrays.
    pub aux: Vec<AuxSpec>,
    /// Compression for row cells and auxiliary data.
    pub compression: Compression,
    /// Merge every append into the time index immediately.
    pub auto_index: bool,
}

impl Default for GroupSchema {
    fn default() -> Self {
        Self {
            columns: Vec::new(),
            aux: Vec::new(),
            compression: Compression::default(),
            auto_index: true,
        }
    }
}

impl GroupSchema {
    /// Empty schema with default compression and auto-indexing on.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a column filled with [`SENTINEL_FILL`] when unset.
    pub fn column(mut self, name: impl Into<String>, shape: impl Into<Vec<usize>>) -> Self {
        self.columns.push(ColumnSpec::new(name, shape));
        self
    }

    /// Add a fully specified column.
    pub fn column_spec(mut self, spec: ColumnSpec) -> Self {
        self.columns.push(spec);
        self
    }

    /// Add an auxiliary array.
    pub fn aux(mut self, name: impl Into<String>, shape: impl Into<Vec<usize>>) -> Self {
        self.aux.push(AuxSpec::new(name, shape));
        self
    }

    /// Set the compression policy.
    pub fn compression(mut self, compression: Compression) -> Self {
        self.compression = compression;
        self
    }

    /// Enable or disable auto-indexing on append.
    pub fn auto_index(mut self, enabled: bool) -> Self {
        self.auto_index = enabled;
        self
    }

    /// Check names and shapes.
    ///
    /// Names must be non-empty, unique across columns and auxiliary arrays,
    /// and must not be `time`. Every dimension must be non-zero. At least one
    /// column is required.
    pub fn validate(&self, group: &GroupPath) -> Result<(), SchemaError> {
        ensure!(
            !self.columns.is_empty(),
            EmptySchemaSnafu {
                group: group.to_string(),
            }
        );
        let mut seen = BTreeSet::new();
        let declared = self
            .columns
            .iter()
            .map(|c| (&c.name, &c.shape))
            .chain(self.aux.iter().map(|a| (&a.name, &a.shape)));

        for (name, shape) in declared {
            ensure!(
                !name.is_empty() && name != TIME_COLUMN,
                ReservedNameSnafu { name: name.clone() }
            );
            ensure!(
                seen.insert(name.as_str()),
                DuplicateNameSnafu {
                    group: group.to_string(),
                    name: name.clone(),
                }
            );
            ensure!(
                shape.iter().all(|&d| d > 0),
                InvalidShapeSnafu {
                    name: name.clone(),
                    shape: shape.clone(),
                }
            );
        }
        Ok(())
    }

    pub(crate) fn table_schema(&self) -> TableSchema {
        TableSchema {
            columns: self.columns.clone(),
        }
    }
}

/// Where one column's cell sits inside an encoded row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ColumnLayout {
    /// Byte offset from the start of the row cells.
    pub byte_offset: usize,
    /// Number of `f32` elements.
    pub elements: usize,
}

impl ColumnLayout {
    pub(crate) fn byte_len(&self) -> usize {
        self.elements * size_of::<f32>()
    }

    pub(crate) fn byte_range(&self) -> std::ops::Range<usize> {
        self.byte_offset..self.byte_offset + self.byte_len()
    }
}

/// Persisted description of a table's value columns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableSchema {
    columns: Vec<ColumnSpec>,
}

impl TableSchema {
    /// Value columns in storage order (time excluded).
    pub fn columns(&self) -> &[ColumnSpec] {
        &self.columns
    }

    /// Look up a column by name.
    pub fn column(&self, name: &str) -> Option<&ColumnSpec> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Size of one row's encoded cells in bytes.
    pub(crate) fn row_bytes(&self) -> usize {
        self.columns
            .iter()
            .map(|c| c.element_count() * size_of::<f32>())
            .sum()
    }

    pub(crate) fn layout_of(&self, name: &str) -> Option<ColumnLayout> {
        let mut byte_offset = 0;
        for c in &self.columns {
            let elements = c.element_count();
            if c.name == name {
                return Some(ColumnLayout {
                    byte_offset,
                    elements,
                });
            }
            byte_offset += elements * size_of::<f32>();
        }
        None
    }

    /// Encode one row's cells in column order, filling absent columns with
    /// their default.
    ///
    /// Every key in `values` must name a column and carry exactly the
    /// declared shape.
    pub(crate) fn encode_row(
        &self,
        group: &GroupPath,
        values: &Values,
    ) -> Result<Vec<u8>, SchemaError> {
        for name in values.keys() {
            ensure!(
                self.column(name).is_some(),
                UnknownColumnSnafu {
                    group: group.to_string(),
                    name: name.clone(),
                }
            );
        }

        let mut buf = BytesMut::with_capacity(self.row_bytes());
        for column in &self.columns {
            match values.get(&column.name) {
                Some(value) => {
                    ensure!(
                        value.shape() == column.shape.as_slice(),
                        ShapeMismatchSnafu {
                            group: group.to_string(),
                            name: column.name.clone(),
                            expected: column.shape.clone(),
                            found: value.shape().to_vec(),
                        }
                    );
                    for v in value.values() {
                        buf.put_f32_le(*v);
                    }
                }
                None => {
                    for _ in 0..column.element_count() {
                        buf.put_f32_le(column.default);
                    }
                }
            }
        }
        Ok(buf.to_vec())
    }
}

/// Decode little-endian `f32` values, appending them to `out`.
pub(crate) fn decode_f32s(mut bytes: &[u8], out: &mut Vec<f32>) {
    out.reserve(bytes.len() / size_of::<f32>());
    while bytes.remaining() >= size_of::<f32>() {
        out.push(bytes.get_f32_le());
    }
}

/// Encode an array's values as little-endian `f32`.
pub(crate) fn encode_f32s(array: &Array) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(array.len() * size_of::<f32>());
    for v in array.values() {
        buf.put_f32_le(*v);
    }
    buf.to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn group() -> GroupPath {
        GroupPath::parse("/ct12").expect("valid group")
    }

    fn sample() -> GroupSchema {
        GroupSchema::new()
            .column("bs", [4])
            .column("status", [2])
            .column_spec(ColumnSpec::new("tilt", Vec::new()).with_default(0.0))
            .aux("height", [4])
    }

    #[test]
    fn validate_accepts_well_formed_schema() {
        assert!(sample().validate(&group()).is_ok());
    }

    #[test]
    fn validate_rejects_time_duplicates_and_zero_dims() {
        let reserved = GroupSchema::new().column("time", [1]);
        assert!(matches!(
            reserved.validate(&group()),
            Err(SchemaError::ReservedName { .. })
        ));

        let dup = GroupSchema::new().column("bs", [4]).aux("bs", [4]);
        assert!(matches!(
            dup.validate(&group()),
            Err(SchemaError::DuplicateName { .. })
        ));

        assert!(matches!(
            GroupSchema::new().aux("height", [4]).validate(&group()),
            Err(SchemaError::EmptySchema { .. })
        ));

        let zero = GroupSchema::new().column("bs", [0]);
        assert!(matches!(
            zero.validate(&group()),
            Err(SchemaError::InvalidShape { .. })
        ));
    }

    #[test]
    fn layout_follows_declaration_order() {
        let table = sample().table_schema();
        assert_eq!(table.row_bytes(), (4 + 2 + 1) * 4);
        assert_eq!(
            table.layout_of("status"),
            Some(ColumnLayout {
                byte_offset: 16,
                elements: 2
            })
        );
        assert_eq!(table.layout_of("missing"), None);
    }

    #[test]
    fn encode_row_fills_absent_columns_with_defaults() {
        let table = sample().table_schema();
        let mut values = Values::new();
        values.insert("status".to_string(), Array::vector(vec![1.0, 2.0]));

        let bytes = table.encode_row(&group(), &values).expect("encode");
        let mut decoded = Vec::new();
        decode_f32s(&bytes, &mut decoded);

        assert_eq!(&decoded[0..4], &[SENTINEL_FILL; 4]);
        assert_eq!(&decoded[4..6], &[1.0, 2.0]);
        assert_eq!(decoded[6], 0.0);
    }

    #[test]
    fn encode_row_rejects_shape_mismatch_and_unknown_columns() {
        let table = sample().table_schema();

        let mut wrong = Values::new();
        wrong.insert("bs".to_string(), Array::vector(vec![1.0; 3]));
        assert!(matches!(
            table.encode_row(&group(), &wrong),
            Err(SchemaError::ShapeMismatch { .. })
        ));

        let mut unknown = Values::new();
        unknown.insert("nope".to_string(), Array::scalar(1.0));
        assert!(matches!(
            table.encode_row(&group(), &unknown),
            Err(SchemaError::UnknownColumn { .. })
        ));
    }

    #[test]
    fn zstd_roundtrip_checks_length() -> Result<(), Box<dyn std::error::Error>> {
        let codec = Compression::Zstd { level: 3 };
        let raw = vec![7u8; 1000];
        let stored = codec.encode(raw.clone())?;
        assert_eq!(codec.decode(&stored, 1000)?, raw);
        assert!(codec.decode(&stored, 999).is_err());
        Ok(())
    }
}
