//! Fixed-shape `f32` arrays exchanged with the engine.
//!
//! [`Array`] is the unit of data for a single cell (one column of one row),
//! for an auxiliary array, and for a sliced column (where the leading
//! dimension is the row count). Values are stored row-major in one flat
//! buffer.

use std::collections::BTreeMap;

use snafu::prelude::*;

use crate::error::{ArrayLengthSnafu, SchemaError};

/// Column name → cell value for a single appended row.
pub type Values = BTreeMap<String, Array>;

/// Number of elements implied by `shape`. The empty shape is a scalar.
pub(crate) fn element_count(shape: &[usize]) -> usize {
    shape.iter().product()
}

/// A dense, row-major `f32` array with an explicit shape.
#[derive(Debug, Clone, PartialEq)]
pub struct Array {
    shape: Vec<usize>,
    values: Vec<f32>,
}

impl Array {
    /// Build an array, checking that `values` holds exactly the number of
    /// elements implied by `shape`.
    pub fn new(shape: impl Into<Vec<usize>>, values: Vec<f32>) -> Result<Self, SchemaError> {
        let shape = shape.into();
        let expected = element_count(&shape);
        ensure!(
            values.len() == expected,
            ArrayLengthSnafu {
                shape,
                expected,
                found: values.len(),
            }
        );
        Ok(Self { shape, values })
    }

    /// A zero-dimensional array holding one value.
    pub fn scalar(value: f32) -> Self {
        Self {
            shape: Vec::new(),
            values: vec![value],
        }
    }

    /// A one-dimensional array over `values`.
    pub fn vector(values: Vec<f32>) -> Self {
        Self {
            shape: vec![values.len()],
            values,
        }
    }

    /// An array of `shape` with every element set to `value`.
    pub fn filled(shape: impl Into<Vec<usize>>, value: f32) -> Self {
        let shape = shape.into();
        let values = vec![value; element_count(&shape)];
        Self { shape, values }
    }

    /// Shape of the array.
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Flat row-major values.
    pub fn values(&self) -> &[f32] {
        &self.values
    }

    /// Consume the array and return its flat values.
    pub fn into_values(self) -> Vec<f32> {
        self.values
    }

    /// Total number of elements.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether the array holds no elements.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Size of the leading dimension (1 for scalars).
    pub fn rows(&self) -> usize {
        self.shape.first().copied().unwrap_or(1)
    }

    /// Borrow the `i`-th slab along the leading dimension.
    ///
    /// For a sliced column of shape `[rows, 250]` this is the 250 values of
    /// row `i`. Returns `None` when `i` is out of range.
    pub fn row(&self, i: usize) -> Option<&[f32]> {
        if i >= self.rows() {
            return None;
        }
        let stride = match self.shape.split_first() {
            Some((_, rest)) => element_count(rest),
            None => 1,
        };
        self.values.get(i * stride..(i + 1) * stride)
    }
}

impl From<Vec<f32>> for Array {
    fn from(values: Vec<f32>) -> Self {
        Array::vector(values)
    }
}

impl From<f32> for Array {
    fn from(value: f32) -> Self {
        Array::scalar(value)
    }
}
