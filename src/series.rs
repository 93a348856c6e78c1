use std::collections::HashMap;
use std::fmt;

use bytes::{Buf, BufMut};
use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;
use thiserror::Error;

/// Errors raised while converting between wire datasets and columnar
/// series.
#[derive(Error, Debug)]
pub enum SeriesError {
    #[error("mismatched dataset shape: {names} names, {types} types, {buffers} buffers")]
    Shape {
        names: usize,
        types: usize,
        buffers: usize,
    },
    #[error("column '{name}' holds {have} bytes, expected {want}")]
    Truncated {
        name: String,
        have: usize,
        want: usize,
    },
    #[error("slice {start}+{len} exceeds dataset length {length}")]
    OutOfBounds {
        start: usize,
        len: usize,
        length: usize,
    },
    #[error("dataset indexes key '{0}' without a matching length")]
    MissingLength(String),
}

/// Element type of a wire column, tagged with the service's type codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColumnType {
    #[serde(rename = "i4")]
    I32,
    #[serde(rename = "i8")]
    I64,
    #[serde(rename = "f4")]
    F32,
    #[serde(rename = "f8")]
    F64,
    #[serde(rename = "u1")]
    U8,
}

impl ColumnType {
    /// Width of one element in bytes.
    pub fn size(self) -> usize {
        match self {
            ColumnType::I32 | ColumnType::F32 => 4,
            ColumnType::I64 | ColumnType::F64 => 8,
            ColumnType::U8 => 1,
        }
    }
}

/// An owned, typed column of values.
#[derive(Debug, Clone, PartialEq)]
pub enum Column {
    I32(Vec<i32>),
    I64(Vec<i64>),
    F32(Vec<f32>),
    F64(Vec<f64>),
    U8(Vec<u8>),
}

impl Column {
    pub fn len(&self) -> usize {
        match self {
            Column::I32(v) => v.len(),
            Column::I64(v) => v.len(),
            Column::F32(v) => v.len(),
            Column::F64(v) => v.len(),
            Column::U8(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn column_type(&self) -> ColumnType {
        match self {
            Column::I32(_) => ColumnType::I32,
            Column::I64(_) => ColumnType::I64,
            Column::F32(_) => ColumnType::F32,
            Column::F64(_) => ColumnType::F64,
            Column::U8(_) => ColumnType::U8,
        }
    }

    pub fn as_i64(&self) -> Option<&[i64]> {
        match self {
            Column::I64(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<&[f64]> {
        match self {
            Column::F64(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_f32(&self) -> Option<&[f32]> {
        match self {
            Column::F32(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_i32(&self) -> Option<&[i32]> {
        match self {
            Column::I32(v) => Some(v),
            _ => None,
        }
    }
}

/// An in-memory columnar series: ordered named columns of equal length.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ColumnSeries {
    names: Vec<String>,
    columns: Vec<Column>,
}

impl ColumnSeries {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a column (builder style).
    pub fn add_column(mut self, name: impl Into<String>, column: Column) -> Self {
        self.names.push(name.into());
        self.columns.push(column);
        self
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.names
            .iter()
            .position(|n| n == name)
            .map(|i| &self.columns[i])
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    /// Number of rows, taken from the first column.
    pub fn len(&self) -> usize {
        self.columns.first().map_or(0, Column::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Identifier of a series bucket, e.g. `"XYZ/1Min/OHLCV"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SeriesKey(String);

impl SeriesKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SeriesKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Query results and write payloads keyed by series bucket.
pub type ColumnSeriesMap = HashMap<SeriesKey, ColumnSeries>;

/// The packed tabular form datasets travel in on the wire.
///
/// Each column is a little-endian buffer of `length` elements. A single
/// dataset may carry rows for several series buckets back to back;
/// `start_index` and `lengths` record the row range belonging to each
/// bucket key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataSet {
    pub column_types: Vec<ColumnType>,
    pub column_names: Vec<String>,
    pub column_data: Vec<ByteBuf>,
    pub length: usize,
    pub start_index: HashMap<String, usize>,
    pub lengths: HashMap<String, usize>,
}

impl DataSet {
    /// Pack a single-bucket series into wire form.
    pub fn from_column_series(key: &SeriesKey, series: &ColumnSeries) -> Self {
        let mut column_types = Vec::with_capacity(series.columns().len());
        let mut column_data = Vec::with_capacity(series.columns().len());
        for column in series.columns() {
            column_types.push(column.column_type());
            column_data.push(ByteBuf::from(pack_column(column)));
        }
        DataSet {
            column_types,
            column_names: series.names().to_vec(),
            column_data,
            length: series.len(),
            start_index: HashMap::from([(key.as_str().to_string(), 0)]),
            lengths: HashMap::from([(key.as_str().to_string(), series.len())]),
        }
    }

    /// Unpack the row range `[start, start + len)` into a typed series.
    pub fn to_column_series(&self, start: usize, len: usize) -> Result<ColumnSeries, SeriesError> {
        if self.column_names.len() != self.column_types.len()
            || self.column_names.len() != self.column_data.len()
        {
            return Err(SeriesError::Shape {
                names: self.column_names.len(),
                types: self.column_types.len(),
                buffers: self.column_data.len(),
            });
        }
        if start + len > self.length {
            return Err(SeriesError::OutOfBounds {
                start,
                len,
                length: self.length,
            });
        }

        let mut series = ColumnSeries::new();
        for ((name, &ty), data) in self
            .column_names
            .iter()
            .zip(&self.column_types)
            .zip(&self.column_data)
        {
            let want = self.length * ty.size();
            if data.len() < want {
                return Err(SeriesError::Truncated {
                    name: name.clone(),
                    have: data.len(),
                    want,
                });
            }
            let slice = &data[start * ty.size()..(start + len) * ty.size()];
            series = series.add_column(name.clone(), unpack_column(ty, slice));
        }
        Ok(series)
    }

    /// Split the dataset into per-bucket series and merge them into `out`.
    pub fn merge_into(&self, out: &mut ColumnSeriesMap) -> Result<(), SeriesError> {
        for (key, &start) in &self.start_index {
            let len = *self
                .lengths
                .get(key)
                .ok_or_else(|| SeriesError::MissingLength(key.clone()))?;
            let series = self.to_column_series(start, len)?;
            out.insert(SeriesKey::new(key.clone()), series);
        }
        Ok(())
    }
}

fn pack_column(column: &Column) -> Vec<u8> {
    let mut buf = Vec::with_capacity(column.len() * column.column_type().size());
    match column {
        Column::I32(v) => v.iter().for_each(|x| buf.put_i32_le(*x)),
        Column::I64(v) => v.iter().for_each(|x| buf.put_i64_le(*x)),
        Column::F32(v) => v.iter().for_each(|x| buf.put_f32_le(*x)),
        Column::F64(v) => v.iter().for_each(|x| buf.put_f64_le(*x)),
        Column::U8(v) => buf.extend_from_slice(v),
    }
    buf
}

fn unpack_column(ty: ColumnType, mut slice: &[u8]) -> Column {
    let n = slice.len() / ty.size();
    match ty {
        ColumnType::I32 => {
            let mut v = Vec::with_capacity(n);
            while slice.has_remaining() {
                v.push(slice.get_i32_le());
            }
            Column::I32(v)
        }
        ColumnType::I64 => {
            let mut v = Vec::with_capacity(n);
            while slice.has_remaining() {
                v.push(slice.get_i64_le());
            }
            Column::I64(v)
        }
        ColumnType::F32 => {
            let mut v = Vec::with_capacity(n);
            while slice.has_remaining() {
                v.push(slice.get_f32_le());
            }
            Column::F32(v)
        }
        ColumnType::F64 => {
            let mut v = Vec::with_capacity(n);
            while slice.has_remaining() {
                v.push(slice.get_f64_le());
            }
            Column::F64(v)
        }
        ColumnType::U8 => Column::U8(slice.to_vec()),
    }
}
