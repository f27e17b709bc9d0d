use std::sync::atomic::Ordering;

use crate::device::{require_words, DeviceBuffer, ExecutionContext, Kernel};
use crate::errors::GroupByError;
use crate::expression::{CompiledExpr, CompiledOutput, Num, Operand};
use crate::groupby::aggregate::{unbias, Accumulator, AccumulatorLayout};
use crate::groupby::hash::NO_TUPLE;
use crate::groupby::pack::column_offsets;
use crate::groupby::SourceView;
use crate::table::{Column, DataType, Table};

/// Byte layout of the flat result buffer: output column `c`, row `r` lives at
/// `offsets[c] + r * sizes[c]`.
#[derive(Debug)]
pub(crate) struct ResultLayout {
    pub sizes: Vec<usize>,
    pub offsets: Vec<usize>,
    pub rows: usize,
    pub total: usize,
}

impl ResultLayout {
    pub fn new(outputs: &[CompiledOutput], rows: usize) -> Result<ResultLayout, GroupByError> {
        let sizes = outputs.iter().map(|o| o.data_type.size()).collect::<Vec<_>>();
        let (offsets, total) = column_offsets(&sizes, rows)?;
        Ok(ResultLayout { sizes, offsets, rows, total })
    }

    #[inline]
    fn cell(&self, column: usize, row: usize) -> usize {
        self.offsets[column] + row * self.sizes[column]
    }
}

/// How finalize work items map to accumulator slots and result rows.
pub(crate) enum RowMapping<'a> {
    /// One work item per bucket. Empty buckets are skipped, a non-empty bucket
    /// `b` reads slot `offsets[b]` and writes row `ranks[b]`.
    Grouped {
        occupancy: &'a DeviceBuffer,
        offsets: &'a DeviceBuffer,
        ranks: &'a DeviceBuffer,
    },
    /// A single work item: slot 0 into row 0.
    Constant,
}

/// Converts accumulator state into output values and writes them to the flat result buffer.
pub(crate) struct FinalizeGroups<'a> {
    pub source: SourceView<'a>,
    pub outputs: &'a [CompiledOutput],
    pub layout: &'a AccumulatorLayout,
    pub accumulators: &'a DeviceBuffer,
    pub result_layout: &'a ResultLayout,
    pub result: &'a DeviceBuffer,
    pub mapping: RowMapping<'a>,
}

impl<'a> Kernel for FinalizeGroups<'a> {
    fn name(&self) -> &'static str { "finalize_groups" }

    fn check_args(&self, work_items: usize) -> Result<(), String> {
        if self.result.len() < self.result_layout.total {
            return Err(format!("{} holds {} bytes, {} required",
                               self.result.name(), self.result.len(), self.result_layout.total));
        }
        require_words(self.accumulators.name(), self.accumulators.word_count(), self.layout.total_words())?;
        match self.mapping {
            RowMapping::Grouped { occupancy, offsets, ranks } => {
                for buffer in &[occupancy, offsets, ranks] {
                    require_words(buffer.name(), buffer.word_count(), work_items)?;
                }
                Ok(())
            }
            RowMapping::Constant if work_items > 1 => Err(format!("constant finalize takes 1 item, got {}", work_items)),
            RowMapping::Constant => Ok(()),
        }
    }

    fn run(&self, item: usize) -> Result<(), GroupByError> {
        let (slot, row) = match self.mapping {
            RowMapping::Grouped { occupancy, offsets, ranks } => {
                if occupancy.word(item).load(Ordering::Relaxed) == 0 {
                    return Ok(());
                }
                (offsets.word(item).load(Ordering::Relaxed) as usize,
                 ranks.word(item).load(Ordering::Relaxed) as usize)
            }
            RowMapping::Constant => (0, 0),
        };
        ensure!(slot < self.layout.slots && row < self.result_layout.rows,
                "bucket {} maps to slot {} / row {} outside {} slots / {} rows",
                item, slot, row, self.layout.slots, self.result_layout.rows);

        for (column, output) in self.outputs.iter().enumerate() {
            let cell = self.layout.cell(self.accumulators, column, slot);
            let first = cell[0].load(Ordering::Relaxed);
            let offset = self.result_layout.cell(column, row);
            let value = match self.layout.accumulators[column] {
                Accumulator::Representative => {
                    if first == NO_TUPLE {
                        continue;
                    }
                    let representative = first as usize;
                    if let DataType::Fixed(width) = output.data_type {
                        match output.expr {
                            CompiledExpr::Operand(Operand::Col { index, .. }) => {
                                self.source.copy_cell(index, width, representative, self.result, offset);
                                continue;
                            }
                            _ => return Err(fatal!("fixed-width output {} is not a column", column)),
                        }
                    }
                    output.expr.eval(&self.source, representative)?
                }
                Accumulator::Count => Num::Int(first as i64),
                Accumulator::IntSum => Num::Int(first as i64),
                Accumulator::FloatSum => Num::Float(f64::from_bits(first)),
                Accumulator::IntAvg => {
                    let count = cell[1].load(Ordering::Relaxed);
                    let sum = first as i64;
                    match (count, output.data_type.is_float()) {
                        (0, _) => Num::Int(0),
                        (_, true) => Num::Float(sum as f64 / count as f64),
                        (_, false) => Num::Int(sum.checked_div(count as i64).ok_or(GroupByError::Overflow)?),
                    }
                }
                Accumulator::FloatAvg => {
                    let count = cell[1].load(Ordering::Relaxed);
                    if count == 0 {
                        Num::Float(0.0)
                    } else {
                        Num::Float(f64::from_bits(first) / count as f64)
                    }
                }
                Accumulator::IntMax | Accumulator::IntMin => Num::Int(unbias(first)),
                Accumulator::FloatMax | Accumulator::FloatMin => Num::Float(f64::from_bits(first)),
            };
            write_num(self.result, offset, output.data_type, value)?;
        }
        Ok(())
    }
}

/// Stores `value` in the encoding of `data_type`. Floats written to integer
/// columns truncate toward zero; narrowing to Int32 is checked.
#[inline]
fn write_num(dst: &DeviceBuffer, offset: usize, data_type: DataType, value: Num) -> Result<(), GroupByError> {
    match data_type {
        DataType::Int32 => {
            let v = match value {
                Num::Int(i) => i32::try_from(i).map_err(|_| GroupByError::Overflow)?,
                Num::Float(f) => f as i32,
            };
            dst.store(offset, 4, v as u32 as u64);
        }
        DataType::Int64 => {
            let v = match value {
                Num::Int(i) => i,
                Num::Float(f) => f as i64,
            };
            dst.store(offset, 8, v as u64);
        }
        DataType::Float32 => dst.store(offset, 4, (value.as_f64() as f32).to_bits() as u64),
        DataType::Float64 => dst.store(offset, 8, value.as_f64().to_bits()),
        DataType::Fixed(width) => return Err(fatal!("numeric value written to fixed-width column of {} bytes", width)),
    }
    Ok(())
}

/// Splits the flat result buffer into one freshly allocated device buffer per output column.
pub(crate) fn split_result(ctx: &ExecutionContext,
                           flat: &DeviceBuffer,
                           layout: &ResultLayout,
                           outputs: &[CompiledOutput]) -> Result<Table, GroupByError> {
    let mut columns = Vec::with_capacity(outputs.len());
    for (column, output) in outputs.iter().enumerate() {
        let len = layout.sizes[column] * layout.rows;
        let buffer = ctx.alloc("result_column", len)?;
        ctx.copy_buffer(flat, layout.offsets[column], &buffer, 0, len)?;
        columns.push(Column::device(output.data_type, buffer));
    }
    Ok(Table::from_parts(columns, layout.rows))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::ExecutionContext;
    use crate::options::Options;

    #[test]
    fn test_write_num_encodings() {
        let ctx = ExecutionContext::new(&Options::default().with_lanes(1));
        let buffer = ctx.alloc("out", 24).unwrap();
        write_num(&buffer, 0, DataType::Int32, Num::Int(-5)).unwrap();
        write_num(&buffer, 4, DataType::Int32, Num::Float(7.9)).unwrap();
        write_num(&buffer, 8, DataType::Float64, Num::Int(3)).unwrap();
        write_num(&buffer, 16, DataType::Float32, Num::Float(0.5)).unwrap();
        assert_eq!(buffer.load(0, 4) as u32 as i32, -5);
        assert_eq!(buffer.load(4, 4) as u32 as i32, 7);
        assert_eq!(f64::from_bits(buffer.load(8, 8)), 3.0);
        assert_eq!(f32::from_bits(buffer.load(16, 4) as u32), 0.5);
        assert!(matches!(write_num(&buffer, 0, DataType::Int32, Num::Int(1 << 40)), Err(GroupByError::Overflow)));
    }

    #[test]
    fn test_result_layout() {
        let outputs = [DataType::Int32, DataType::Fixed(3), DataType::Float64]
            .iter()
            .map(|&data_type| CompiledOutput {
                data_type,
                aggregator: None,
                expr: CompiledExpr::Operand(Operand::Int(0)),
            })
            .collect::<Vec<_>>();
        let layout = ResultLayout::new(&outputs, 4).unwrap();
        assert_eq!(layout.offsets, vec![0, 16, 28]);
        assert_eq!(layout.total, 60);
        assert_eq!(layout.cell(2, 1), 36);
    }
}
