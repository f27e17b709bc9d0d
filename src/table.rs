use serde::{Deserialize, Serialize};

use crate::device::{DeviceBuffer, ExecutionContext};
use crate::errors::GroupByError;
use crate::value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataType {
    Int32,
    Int64,
    Float32,
    Float64,
    /// Opaque fixed-width value of the given byte width (e.g. zero-padded strings).
    Fixed(usize),
}

impl DataType {
    pub fn size(self) -> usize {
        match self {
            DataType::Int32 | DataType::Float32 => 4,
            DataType::Int64 | DataType::Float64 => 8,
            DataType::Fixed(width) => width,
        }
    }

    pub fn is_numeric(self) -> bool {
        !matches!(self, DataType::Fixed(_))
    }

    pub fn is_float(self) -> bool {
        matches!(self, DataType::Float32 | DataType::Float64)
    }

    pub fn decode(self, bytes: &[u8]) -> Value {
        let mut word = [0u8; 8];
        let n = bytes.len().min(8);
        word[..n].copy_from_slice(&bytes[..n]);
        let raw = u64::from_le_bytes(word);
        match self {
            DataType::Int32 => Value::Int(raw as u32 as i32 as i64),
            DataType::Int64 => Value::Int(raw as i64),
            DataType::Float32 => Value::from(f32::from_bits(raw as u32) as f64),
            DataType::Float64 => Value::from(f64::from_bits(raw)),
            DataType::Fixed(_) => Value::Bytes(bytes.to_vec()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataFormat {
    Uncompressed,
    RunLength,
    Dictionary,
    Delta,
}

/// Where a column's backing memory lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataPos {
    Host,
    Device,
}

#[derive(Debug)]
pub enum ColumnData {
    Host(Vec<u8>),
    Device(DeviceBuffer),
}

#[derive(Debug)]
pub struct Column {
    data_type: DataType,
    format: DataFormat,
    data: ColumnData,
}

impl Column {
    pub fn host(data_type: DataType, bytes: Vec<u8>) -> Column {
        Column {
            data_type,
            format: DataFormat::Uncompressed,
            data: ColumnData::Host(bytes),
        }
    }

    pub fn device(data_type: DataType, buffer: DeviceBuffer) -> Column {
        Column {
            data_type,
            format: DataFormat::Uncompressed,
            data: ColumnData::Device(buffer),
        }
    }

    pub fn from_i32(values: &[i32]) -> Column {
        Column::host(DataType::Int32, values.iter().flat_map(|v| v.to_le_bytes()).collect())
    }

    pub fn from_i64(values: &[i64]) -> Column {
        Column::host(DataType::Int64, values.iter().flat_map(|v| v.to_le_bytes()).collect())
    }

    pub fn from_f32(values: &[f32]) -> Column {
        Column::host(DataType::Float32, values.iter().flat_map(|v| v.to_le_bytes()).collect())
    }

    pub fn from_f64(values: &[f64]) -> Column {
        Column::host(DataType::Float64, values.iter().flat_map(|v| v.to_le_bytes()).collect())
    }

    /// Zero-padded (or truncated) strings of `width` bytes each.
    pub fn from_fixed_str(width: usize, values: &[&str]) -> Column {
        let mut bytes = Vec::with_capacity(width * values.len());
        for value in values {
            let start = bytes.len();
            bytes.extend(value.bytes().take(width));
            bytes.resize(start + width, 0);
        }
        Column::host(DataType::Fixed(width), bytes)
    }

    pub fn with_format(mut self, format: DataFormat) -> Column {
        self.format = format;
        self
    }

    pub fn data_type(&self) -> DataType {
        self.data_type
    }

    pub fn format(&self) -> DataFormat {
        self.format
    }

    pub fn data(&self) -> &ColumnData {
        &self.data
    }

    pub fn location(&self) -> DataPos {
        match self.data {
            ColumnData::Host(_) => DataPos::Host,
            ColumnData::Device(_) => DataPos::Device,
        }
    }

    pub fn byte_len(&self) -> usize {
        match self.data {
            ColumnData::Host(ref bytes) => bytes.len(),
            ColumnData::Device(ref buffer) => buffer.len(),
        }
    }

    pub fn read_host(&self, ctx: &ExecutionContext) -> Result<Vec<u8>, GroupByError> {
        match self.data {
            ColumnData::Host(ref bytes) => Ok(bytes.clone()),
            ColumnData::Device(ref buffer) => {
                let mut bytes = vec![0u8; buffer.len()];
                ctx.read_buffer(buffer, 0, &mut bytes)?;
                Ok(bytes)
            }
        }
    }

    pub fn values(&self, ctx: &ExecutionContext) -> Result<Vec<Value>, GroupByError> {
        let size = self.data_type.size();
        if size == 0 {
            return Ok(vec![]);
        }
        let bytes = self.read_host(ctx)?;
        Ok(bytes.chunks(size).map(|cell| self.data_type.decode(cell)).collect())
    }

    pub fn to_device(&self, ctx: &ExecutionContext) -> Result<Column, GroupByError> {
        let buffer = ctx.alloc("column", self.byte_len())?;
        match self.data {
            ColumnData::Host(ref bytes) => ctx.write_buffer(&buffer, 0, bytes)?,
            ColumnData::Device(ref src) => ctx.copy_buffer(src, 0, &buffer, 0, src.len())?,
        }
        Ok(Column {
            data_type: self.data_type,
            format: self.format,
            data: ColumnData::Device(buffer),
        })
    }
}

/// Columns of equal length, stored independently (column-major).
#[derive(Debug)]
pub struct Table {
    columns: Vec<Column>,
    tuple_num: usize,
}

impl Table {
    pub fn new(columns: Vec<Column>) -> Result<Table, GroupByError> {
        let tuple_num = match columns.first() {
            Some(column) if column.data_type.size() > 0 => column.byte_len() / column.data_type.size(),
            Some(_) => bail!(GroupByError::TypeError, "Column 0 has zero width"),
            None => bail!(GroupByError::TypeError, "Table has no columns"),
        };
        for (i, column) in columns.iter().enumerate() {
            let size = column.data_type.size();
            if size == 0 {
                bail!(GroupByError::TypeError, "Column {} has zero width", i);
            }
            if column.byte_len() != size * tuple_num {
                bail!(GroupByError::TypeError,
                      "Column {} holds {} bytes, expected {} tuples of {} bytes",
                      i, column.byte_len(), tuple_num, size);
            }
        }
        Ok(Table { columns, tuple_num })
    }

    pub(crate) fn from_parts(columns: Vec<Column>, tuple_num: usize) -> Table {
        Table { columns, tuple_num }
    }

    pub fn tuple_num(&self) -> usize {
        self.tuple_num
    }

    /// Logical row width: the sum of all column element sizes.
    pub fn tuple_size(&self) -> usize {
        self.columns.iter().map(|c| c.data_type.size()).sum()
    }

    pub fn total_attr(&self) -> usize {
        self.columns.len()
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn column(&self, index: usize) -> Option<&Column> {
        self.columns.get(index)
    }

    pub fn to_device(&self, ctx: &ExecutionContext) -> Result<Table, GroupByError> {
        let columns = self
            .columns
            .iter()
            .map(|column| column.to_device(ctx))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Table::from_parts(columns, self.tuple_num))
    }

    pub fn rows(&self, ctx: &ExecutionContext) -> Result<Vec<Vec<Value>>, GroupByError> {
        let columns = self
            .columns
            .iter()
            .map(|column| column.values(ctx))
            .collect::<Result<Vec<_>, _>>()?;
        Ok((0..self.tuple_num)
            .map(|row| columns.iter().map(|values| values[row].clone()).collect())
            .collect())
    }
}
