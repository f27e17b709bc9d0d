use crate::device::{DeviceBuffer, ExecutionContext};
use crate::errors::GroupByError;
use crate::expression::Num;
use crate::table::{ColumnData, DataType, Table};

/// Source table staged into one device buffer, columns stored back to back.
pub(crate) struct PackedTable {
    pub content: DeviceBuffer,
    /// Byte offset of every column inside `content`, one word per column.
    pub offsets: DeviceBuffer,
    pub tuple_num: usize,
}

impl PackedTable {
    pub fn view(&self) -> SourceView<'_> {
        SourceView {
            content: &self.content,
            offsets: &self.offsets,
            tuple_num: self.tuple_num,
        }
    }
}

/// Byte offset of each column when `sizes` columns of `tuple_num` elements are packed contiguously.
pub(crate) fn column_offsets(sizes: &[usize], tuple_num: usize) -> Result<(Vec<usize>, usize), GroupByError> {
    let mut offsets = Vec::with_capacity(sizes.len());
    let mut offset = 0usize;
    for &size in sizes {
        offsets.push(offset);
        offset = size
            .checked_mul(tuple_num)
            .and_then(|bytes| offset.checked_add(bytes))
            .ok_or(GroupByError::Overflow)?;
    }
    Ok((offsets, offset))
}

pub(crate) fn pack(ctx: &ExecutionContext, table: &Table) -> Result<PackedTable, GroupByError> {
    let tuple_num = table.tuple_num();
    let sizes = table.columns().iter().map(|c| c.data_type().size()).collect::<Vec<_>>();
    let (offsets, total) = column_offsets(&sizes, tuple_num)?;

    let content = ctx.alloc("content", total)?;
    for ((column, &offset), &size) in table.columns().iter().zip(&offsets).zip(&sizes) {
        let len = size * tuple_num;
        match *column.data() {
            ColumnData::Host(ref bytes) => ctx.write_buffer(&content, offset, &bytes[..len.min(bytes.len())])?,
            ColumnData::Device(ref buffer) => ctx.copy_buffer(buffer, 0, &content, offset, len)?,
        }
    }
    let offsets = ctx.upload_words("column_offsets", &offsets.iter().map(|&o| o as u64).collect::<Vec<_>>())?;
    log::debug!("packed {} columns x {} tuples into {} bytes", table.total_attr(), tuple_num, total);
    Ok(PackedTable { content, offsets, tuple_num })
}

/// Read access to packed source columns from inside kernels.
#[derive(Clone, Copy)]
pub struct SourceView<'a> {
    content: &'a DeviceBuffer,
    offsets: &'a DeviceBuffer,
    tuple_num: usize,
}

impl<'a> SourceView<'a> {
    pub fn tuple_num(&self) -> usize {
        self.tuple_num
    }

    #[inline]
    pub fn cell_offset(&self, column: usize, size: usize, row: usize) -> usize {
        self.offsets.load(column * 8, 8) as usize + row * size
    }

    /// Raw element of a column no wider than 8 bytes, zero-extended.
    #[inline]
    pub fn element(&self, column: usize, size: usize, row: usize) -> u64 {
        self.content.load(self.cell_offset(column, size, row), size)
    }

    /// The element as consecutive 8-byte little-endian chunks; the last chunk is zero-extended.
    #[inline]
    pub fn chunks(&self, column: usize, size: usize, row: usize) -> impl Iterator<Item = u64> + 'a {
        let content = self.content;
        let start = self.cell_offset(column, size, row);
        (0..size).step_by(8).map(move |i| content.load(start + i, (size - i).min(8)))
    }

    #[inline]
    pub fn number(&self, column: usize, data_type: DataType, row: usize) -> Num {
        let raw = self.element(column, data_type.size().min(8), row);
        match data_type {
            DataType::Int32 => Num::Int(raw as u32 as i32 as i64),
            DataType::Int64 => Num::Int(raw as i64),
            DataType::Float32 => Num::Float(f32::from_bits(raw as u32) as f64),
            DataType::Float64 => Num::Float(f64::from_bits(raw)),
            DataType::Fixed(_) => Num::Int(raw as i64),
        }
    }

    pub(crate) fn copy_cell(&self, column: usize, size: usize, row: usize, dst: &DeviceBuffer, dst_offset: usize) {
        self.content.copy_to(self.cell_offset(column, size, row), dst, dst_offset, size);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::Options;
    use crate::table::Column;

    #[test]
    fn test_column_offsets() {
        let (offsets, total) = column_offsets(&[4, 8, 3], 5).unwrap();
        assert_eq!(offsets, vec![0, 20, 60]);
        assert_eq!(total, 75);
    }

    #[test]
    fn test_pack_host_and_device_columns() {
        let ctx = ExecutionContext::new(&Options::default().with_lanes(2));
        let host = Column::from_i32(&[1, -2, 3]);
        let device = Column::from_f64(&[0.25, 0.5, 0.75]).to_device(&ctx).unwrap();
        let fixed = Column::from_fixed_str(10, &["alpha", "beta", "gamma"]);
        let table = Table::new(vec![host, device, fixed]).unwrap();

        let packed = pack(&ctx, &table).unwrap();
        assert_eq!(packed.content.len(), table.tuple_size() * 3);
        assert_eq!(ctx.read_words(&packed.offsets, 3).unwrap(), vec![0, 12, 36]);

        let view = packed.view();
        assert_eq!(view.number(0, DataType::Int32, 1), Num::Int(-2));
        assert_eq!(view.number(1, DataType::Float64, 2), Num::Float(0.75));
        let chunks = view.chunks(2, 10, 1).collect::<Vec<_>>();
        assert_eq!(chunks, vec![u64::from_le_bytes(*b"beta\0\0\0\0"), 0]);
    }
}
