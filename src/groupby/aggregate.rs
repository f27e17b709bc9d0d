use std::sync::atomic::{AtomicU64, Ordering};

use crate::device::{require_words, DeviceBuffer, ExecutionContext, Kernel};
use crate::errors::GroupByError;
use crate::expression::{Aggregator, CompiledOutput, Num};
use crate::groupby::hash::NO_TUPLE;
use crate::groupby::SourceView;

const SIGN_BIT: u64 = 1 << 63;

/// Maps i64 to u64 preserving order, so signed min/max can use unsigned atomics.
#[inline]
pub(crate) fn bias(value: i64) -> u64 {
    (value as u64) ^ SIGN_BIT
}

#[inline]
pub(crate) fn unbias(value: u64) -> i64 {
    (value ^ SIGN_BIT) as i64
}

/// Running state kept per group for one output column. Integer sums are kept
/// in checked i64, float sums in f64, AVG as a (sum, count) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Accumulator {
    /// Lowest tuple index of the group; the output is evaluated on that tuple.
    Representative,
    Count,
    IntSum,
    FloatSum,
    IntAvg,
    FloatAvg,
    IntMax,
    FloatMax,
    IntMin,
    FloatMin,
}

impl Accumulator {
    pub fn for_output(output: &CompiledOutput) -> Accumulator {
        let float = output.expr.is_float();
        match (output.aggregator, float) {
            (None, _) => Accumulator::Representative,
            (Some(Aggregator::Count), _) => Accumulator::Count,
            (Some(Aggregator::Sum), false) => Accumulator::IntSum,
            (Some(Aggregator::Sum), true) => Accumulator::FloatSum,
            (Some(Aggregator::Avg), false) => Accumulator::IntAvg,
            (Some(Aggregator::Avg), true) => Accumulator::FloatAvg,
            (Some(Aggregator::Max), false) => Accumulator::IntMax,
            (Some(Aggregator::Max), true) => Accumulator::FloatMax,
            (Some(Aggregator::Min), false) => Accumulator::IntMin,
            (Some(Aggregator::Min), true) => Accumulator::FloatMin,
        }
    }

    pub fn words(self) -> usize {
        match self {
            Accumulator::IntAvg | Accumulator::FloatAvg => 2,
            _ => 1,
        }
    }

    /// Initial value of the first word; any second word starts at zero.
    pub fn unit(self) -> u64 {
        match self {
            Accumulator::Representative => NO_TUPLE,
            Accumulator::IntMax => bias(i64::MIN),
            Accumulator::IntMin => bias(i64::MAX),
            Accumulator::FloatMax => f64::NEG_INFINITY.to_bits(),
            Accumulator::FloatMin => f64::INFINITY.to_bits(),
            Accumulator::FloatSum | Accumulator::FloatAvg => 0f64.to_bits(),
            Accumulator::Count | Accumulator::IntSum | Accumulator::IntAvg => 0,
        }
    }

    #[inline]
    fn accumulate(self, cell: &[AtomicU64], value: impl FnOnce() -> Result<Num, GroupByError>, row: usize)
                  -> Result<(), GroupByError> {
        match self {
            Accumulator::Representative => {
                cell[0].fetch_min(row as u64, Ordering::Relaxed);
            }
            Accumulator::Count => {
                cell[0].fetch_add(1, Ordering::Relaxed);
            }
            Accumulator::IntSum => add_i64(&cell[0], as_i64(value()?))?,
            Accumulator::FloatSum => add_f64(&cell[0], value()?.as_f64()),
            Accumulator::IntAvg => {
                add_i64(&cell[0], as_i64(value()?))?;
                cell[1].fetch_add(1, Ordering::Relaxed);
            }
            Accumulator::FloatAvg => {
                add_f64(&cell[0], value()?.as_f64());
                cell[1].fetch_add(1, Ordering::Relaxed);
            }
            Accumulator::IntMax => {
                cell[0].fetch_max(bias(as_i64(value()?)), Ordering::Relaxed);
            }
            Accumulator::IntMin => {
                cell[0].fetch_min(bias(as_i64(value()?)), Ordering::Relaxed);
            }
            Accumulator::FloatMax => {
                let v = value()?.as_f64();
                update_f64(&cell[0], |current| if v > current { Some(v) } else { None });
            }
            Accumulator::FloatMin => {
                let v = value()?.as_f64();
                update_f64(&cell[0], |current| if v < current { Some(v) } else { None });
            }
        }
        Ok(())
    }
}

#[inline]
fn as_i64(value: Num) -> i64 {
    match value {
        Num::Int(i) => i,
        Num::Float(f) => f as i64,
    }
}

#[inline]
fn add_i64(cell: &AtomicU64, value: i64) -> Result<(), GroupByError> {
    cell.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
        (current as i64).checked_add(value).map(|sum| sum as u64)
    })
        .map(|_| ())
        .map_err(|_| GroupByError::Overflow)
}

#[inline]
fn add_f64(cell: &AtomicU64, value: f64) {
    update_f64(cell, |current| Some(current + value));
}

#[inline]
fn update_f64(cell: &AtomicU64, mut f: impl FnMut(f64) -> Option<f64>) {
    let _ = cell.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |bits| f(f64::from_bits(bits)).map(f64::to_bits));
}

/// Word layout of the accumulator buffer: one region per output column, each
/// holding `slots` cells of `Accumulator::words` words.
#[derive(Debug)]
pub(crate) struct AccumulatorLayout {
    pub accumulators: Vec<Accumulator>,
    offsets: Vec<usize>,
    pub slots: usize,
    total_words: usize,
}

impl AccumulatorLayout {
    pub fn new(outputs: &[CompiledOutput], slots: usize) -> Result<AccumulatorLayout, GroupByError> {
        let accumulators = outputs.iter().map(Accumulator::for_output).collect::<Vec<_>>();
        let mut offsets = Vec::with_capacity(accumulators.len());
        let mut total_words = 0usize;
        for accumulator in &accumulators {
            offsets.push(total_words);
            total_words = accumulator
                .words()
                .checked_mul(slots)
                .and_then(|words| total_words.checked_add(words))
                .ok_or(GroupByError::Overflow)?;
        }
        Ok(AccumulatorLayout { accumulators, offsets, slots, total_words })
    }

    pub fn total_words(&self) -> usize {
        self.total_words
    }

    #[inline]
    pub fn cell<'b>(&self, buffer: &'b DeviceBuffer, column: usize, slot: usize) -> &'b [AtomicU64] {
        let accumulator = self.accumulators[column];
        let start = self.offsets[column] + slot * accumulator.words();
        buffer.words(start, accumulator.words())
    }

    /// Allocates the accumulator buffer with every cell set to its unit.
    pub fn allocate(&self, ctx: &ExecutionContext) -> Result<DeviceBuffer, GroupByError> {
        let buffer = ctx.alloc_words("accumulators", self.total_words)?;
        if self.accumulators.iter().any(|a| a.unit() != 0) {
            ctx.launch(&InitAccumulators { layout: self, accumulators: &buffer }, self.slots)?;
        }
        Ok(buffer)
    }
}

struct InitAccumulators<'a> {
    layout: &'a AccumulatorLayout,
    accumulators: &'a DeviceBuffer,
}

impl<'a> Kernel for InitAccumulators<'a> {
    fn name(&self) -> &'static str { "init_accumulators" }

    fn check_args(&self, _: usize) -> Result<(), String> {
        require_words(self.accumulators.name(), self.accumulators.word_count(), self.layout.total_words())
    }

    fn run(&self, slot: usize) -> Result<(), GroupByError> {
        for (column, accumulator) in self.layout.accumulators.iter().enumerate() {
            let unit = accumulator.unit();
            if unit != 0 {
                self.layout.cell(self.accumulators, column, slot)[0].store(unit, Ordering::Relaxed);
            }
        }
        Ok(())
    }
}

#[inline]
fn accumulate_row(source: &SourceView,
                  outputs: &[CompiledOutput],
                  layout: &AccumulatorLayout,
                  accumulators: &DeviceBuffer,
                  row: usize,
                  slot: usize) -> Result<(), GroupByError> {
    for (column, output) in outputs.iter().enumerate() {
        let accumulator = layout.accumulators[column];
        let cell = layout.cell(accumulators, column, slot);
        accumulator.accumulate(cell, || output.expr.eval(source, row), row)?;
    }
    Ok(())
}

fn check_accumulators(layout: &AccumulatorLayout, accumulators: &DeviceBuffer, outputs: &[CompiledOutput]) -> Result<(), String> {
    if layout.accumulators.len() != outputs.len() {
        return Err(format!("layout has {} columns, {} outputs bound", layout.accumulators.len(), outputs.len()));
    }
    require_words(accumulators.name(), accumulators.word_count(), layout.total_words())
}

/// Accumulates every tuple into the slot of its group: `offsets[keys[row]]`.
pub(crate) struct GroupedAggregate<'a> {
    pub source: SourceView<'a>,
    pub outputs: &'a [CompiledOutput],
    pub layout: &'a AccumulatorLayout,
    pub accumulators: &'a DeviceBuffer,
    pub keys: &'a DeviceBuffer,
    pub offsets: &'a DeviceBuffer,
}

impl<'a> Kernel for GroupedAggregate<'a> {
    fn name(&self) -> &'static str { "aggregate_grouped" }

    fn check_args(&self, work_items: usize) -> Result<(), String> {
        require_words(self.keys.name(), self.keys.word_count(), work_items)?;
        check_accumulators(self.layout, self.accumulators, self.outputs)
    }

    #[inline]
    fn run(&self, row: usize) -> Result<(), GroupByError> {
        let bucket = self.keys.word(row).load(Ordering::Relaxed) as usize;
        let slot = self.offsets.word(bucket).load(Ordering::Relaxed) as usize;
        ensure!(slot < self.layout.slots, "slot {} of tuple {} exceeds {} slots", slot, row, self.layout.slots);
        accumulate_row(&self.source, self.outputs, self.layout, self.accumulators, row, slot)
    }
}

/// Accumulates every tuple into slot 0.
pub(crate) struct ConstantAggregate<'a> {
    pub source: SourceView<'a>,
    pub outputs: &'a [CompiledOutput],
    pub layout: &'a AccumulatorLayout,
    pub accumulators: &'a DeviceBuffer,
}

impl<'a> Kernel for ConstantAggregate<'a> {
    fn name(&self) -> &'static str { "aggregate_constant" }

    fn check_args(&self, _: usize) -> Result<(), String> {
        if self.layout.slots == 0 {
            return Err("no accumulator slot".to_string());
        }
        check_accumulators(self.layout, self.accumulators, self.outputs)
    }

    #[inline]
    fn run(&self, row: usize) -> Result<(), GroupByError> {
        accumulate_row(&self.source, self.outputs, self.layout, self.accumulators, row, 0)
    }
}
