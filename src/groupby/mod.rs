mod aggregate;
mod count;
mod hash;
mod materialize;
mod pack;
mod scan;

use std::fmt;

use itertools::Itertools;

use crate::device::{DeviceBuffer, ExecutionContext};
use crate::errors::GroupByError;
use crate::expression::{CompiledOutput, OutputColumn};
use crate::stats::*;
use crate::table::{Column, DataFormat, Table};

use self::aggregate::{AccumulatorLayout, ConstantAggregate, GroupedAggregate};
use self::count::CountGroups;
use self::hash::{BuildGroupKey, GroupColumn, GroupKeyHasher, VerifyGroupKeys, NO_TUPLE};
use self::materialize::{split_result, FinalizeGroups, ResultLayout, RowMapping};
use self::pack::pack;

pub use self::pack::SourceView;
pub use self::scan::{BlockScan, PrefixScan};

/// Which columns form the grouping key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GroupingSpec {
    Columns(Vec<usize>),
    /// No grouping: a single output row aggregated over every tuple.
    WholeTable,
}

impl GroupingSpec {
    /// Parses a list of column indices where the single entry `-1` selects the whole table.
    pub fn from_indices(indices: &[i64]) -> Result<GroupingSpec, GroupByError> {
        match indices {
            [] => bail!(GroupByError::InvalidExpression, "grouping key has no columns"),
            [-1] => Ok(GroupingSpec::WholeTable),
            _ => indices
                .iter()
                .map(|&i| match usize::try_from(i) {
                    Ok(index) => Ok(index),
                    Err(_) => bail!(GroupByError::InvalidExpression, "invalid grouping column index {}", i),
                })
                .collect::<Result<Vec<_>, _>>()
                .map(GroupingSpec::Columns),
        }
    }
}

impl fmt::Display for GroupingSpec {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            GroupingSpec::Columns(ref columns) => write!(f, "[{}]", columns.iter().map(|c| format!("${}", c)).join(", ")),
            GroupingSpec::WholeTable => write!(f, "[*]"),
        }
    }
}

pub struct GroupByRequest<'a> {
    pub table: &'a Table,
    pub grouping: GroupingSpec,
    pub outputs: Vec<OutputColumn>,
}

impl<'a> GroupByRequest<'a> {
    pub fn new(table: &'a Table, grouping: GroupingSpec, outputs: Vec<OutputColumn>) -> GroupByRequest<'a> {
        GroupByRequest { table, grouping, outputs }
    }
}

/// Groups `request.table` and evaluates the output columns for every group.
///
/// The result is a freshly allocated, device-resident table with one row per
/// non-empty hash bucket (rows ordered by bucket), or exactly one row in
/// whole-table mode. Every intermediate buffer is released before returning,
/// on success and on error.
pub fn group_by(request: &GroupByRequest,
                ctx: &ExecutionContext,
                stats: &mut dyn StatsSink) -> Result<Table, GroupByError> {
    group_by_with_scan(request, ctx, stats, &BlockScan::default())
}

/// `group_by` with a caller supplied prefix scan.
pub fn group_by_with_scan(request: &GroupByRequest,
                          ctx: &ExecutionContext,
                          stats: &mut dyn StatsSink,
                          scan: &dyn PrefixScan) -> Result<Table, GroupByError> {
    let table = request.table;
    let source_types = table.columns().iter().map(Column::data_type).collect::<Vec<_>>();
    for (i, column) in table.columns().iter().enumerate() {
        if column.format() != DataFormat::Uncompressed {
            bail!(GroupByError::NotImplemented, "column {} is stored as {:?}", i, column.format());
        }
    }
    let group_columns = match request.grouping {
        GroupingSpec::WholeTable => None,
        GroupingSpec::Columns(ref indices) => {
            if indices.is_empty() {
                bail!(GroupByError::InvalidExpression, "grouping key has no columns");
            }
            let mut columns = Vec::with_capacity(indices.len());
            for &index in indices {
                match source_types.get(index) {
                    Some(&data_type) => columns.push(GroupColumn { index, data_type }),
                    None => bail!(GroupByError::InvalidExpression,
                                  "grouping column {} out of range, table has {} columns",
                                  index, source_types.len()),
                }
            }
            Some(columns)
        }
    };
    if request.outputs.is_empty() {
        bail!(GroupByError::InvalidExpression, "no output columns");
    }
    let outputs = request
        .outputs
        .iter()
        .map(|output| output.compile(&source_types))
        .collect::<Result<Vec<_>, _>>()?;
    log::debug!("group_by {} over {} tuples: {}",
                request.grouping, table.tuple_num(), request.outputs.iter().join(", "));

    let timer = PhaseTimer::start();
    let packed = pack(ctx, table)?;
    timer.finish(PHASE_PACK, stats);

    let result = match group_columns {
        None => aggregate_whole_table(ctx, packed.view(), &outputs, stats)?,
        Some(columns) => aggregate_groups(ctx, packed.view(), &columns, &outputs, scan, stats)?,
    };
    log::info!("group_by {} produced {} rows from {} tuples (peak device memory {} bytes)",
               request.grouping, result.tuple_num(), table.tuple_num(), ctx.memory().peak_bytes());
    Ok(result)
}

fn aggregate_whole_table(ctx: &ExecutionContext,
                         source: SourceView,
                         outputs: &[CompiledOutput],
                         stats: &mut dyn StatsSink) -> Result<Table, GroupByError> {
    let layout = AccumulatorLayout::new(outputs, 1)?;
    let accumulators = layout.allocate(ctx)?;
    if source.tuple_num() > 0 {
        let timer = PhaseTimer::start();
        ctx.launch(&ConstantAggregate { source, outputs, layout: &layout, accumulators: &accumulators },
                   source.tuple_num())?;
        timer.finish(PHASE_AGGREGATE, stats);
    }

    let timer = PhaseTimer::start();
    let result_layout = ResultLayout::new(outputs, 1)?;
    let result = ctx.alloc("result", result_layout.total)?;
    // Without tuples the zeroed result buffer is the answer.
    if source.tuple_num() > 0 {
        ctx.launch(&FinalizeGroups {
            source,
            outputs,
            layout: &layout,
            accumulators: &accumulators,
            result_layout: &result_layout,
            result: &result,
            mapping: RowMapping::Constant,
        }, 1)?;
    }
    let table = split_result(ctx, &result, &result_layout, outputs)?;
    timer.finish(PHASE_MATERIALIZE, stats);
    Ok(table)
}

/// Bucket assignment of every tuple plus the per-bucket state derived from it.
struct GroupAssignment {
    /// Bucket of every tuple.
    keys: DeviceBuffer,
    /// Tuples per bucket.
    histogram: DeviceBuffer,
    /// 1 for every non-empty bucket.
    occupancy: DeviceBuffer,
    groups: usize,
    aliased_tuples: u64,
}

fn assign_groups(ctx: &ExecutionContext,
                 hasher: GroupKeyHasher,
                 stats: &mut dyn StatsSink) -> Result<GroupAssignment, GroupByError> {
    let tuple_num = hasher.source.tuple_num();
    let capacity = ctx.opts().hash_capacity;

    let timer = PhaseTimer::start();
    let keys = ctx.alloc_words("group_keys", tuple_num)?;
    let histogram = ctx.alloc_words("histogram", capacity)?;
    let representatives = if ctx.opts().verify_group_keys {
        let representatives = ctx.alloc_words("representatives", capacity)?;
        ctx.fill_words(&representatives, 0, capacity, NO_TUPLE)?;
        Some(representatives)
    } else {
        None
    };
    ctx.launch(&BuildGroupKey {
        hasher,
        hash_capacity: capacity,
        keys: &keys,
        histogram: &histogram,
        representatives: representatives.as_ref(),
    }, tuple_num)?;
    timer.finish(PHASE_BUILD_KEYS, stats);

    let aliased_tuples = match representatives {
        Some(ref representatives) => {
            let timer = PhaseTimer::start();
            let aliased = ctx.alloc_words("aliased_tuples", 1)?;
            ctx.launch(&VerifyGroupKeys { hasher, keys: &keys, representatives, aliased: &aliased }, tuple_num)?;
            let aliased_tuples = ctx.read_word(&aliased, 0)?;
            timer.finish(PHASE_VERIFY_KEYS, stats);
            aliased_tuples
        }
        None => 0,
    };

    let timer = PhaseTimer::start();
    let occupancy = ctx.alloc_words("occupancy", capacity)?;
    let group_count = ctx.alloc_words("group_count", 1)?;
    ctx.launch(&CountGroups { histogram: &histogram, occupancy: &occupancy, group_count: &group_count }, capacity)?;
    let groups = ctx.read_word(&group_count, 0)? as usize;
    timer.finish(PHASE_COUNT, stats);
    ensure!(groups >= 1 && groups <= tuple_num.min(capacity),
            "{} groups counted for {} tuples in {} buckets", groups, tuple_num, capacity);

    if aliased_tuples > 0 || groups == capacity {
        let overflow = CapacityOverflow { groups, capacity, aliased_tuples };
        log::warn!("group-by hash capacity reached: {} groups in {} buckets, {} tuples merged into a foreign group",
                   groups, capacity, aliased_tuples);
        stats.capacity_overflow(&overflow);
    }
    log::debug!("{} tuples fall into {} groups", tuple_num, groups);
    Ok(GroupAssignment { keys, histogram, occupancy, groups, aliased_tuples })
}

fn aggregate_groups(ctx: &ExecutionContext,
                    source: SourceView,
                    columns: &[GroupColumn],
                    outputs: &[CompiledOutput],
                    scan: &dyn PrefixScan,
                    stats: &mut dyn StatsSink) -> Result<Table, GroupByError> {
    let tuple_num = source.tuple_num();
    if tuple_num == 0 {
        let result_layout = ResultLayout::new(outputs, 0)?;
        let result = ctx.alloc("result", result_layout.total)?;
        return split_result(ctx, &result, &result_layout, outputs);
    }
    let capacity = ctx.opts().hash_capacity;
    let assignment = assign_groups(ctx, GroupKeyHasher { source, columns }, stats)?;

    let timer = PhaseTimer::start();
    let offsets = ctx.alloc_words("offsets", capacity)?;
    scan.exclusive_scan(ctx, &assignment.histogram, &offsets, capacity)?;
    let ranks = ctx.alloc_words("ranks", capacity)?;
    scan.exclusive_scan(ctx, &assignment.occupancy, &ranks, capacity)?;
    timer.finish(PHASE_SCAN, stats);

    let timer = PhaseTimer::start();
    let layout = AccumulatorLayout::new(outputs, tuple_num)?;
    let accumulators = layout.allocate(ctx)?;
    ctx.launch(&GroupedAggregate {
        source,
        outputs,
        layout: &layout,
        accumulators: &accumulators,
        keys: &assignment.keys,
        offsets: &offsets,
    }, tuple_num)?;
    timer.finish(PHASE_AGGREGATE, stats);

    let timer = PhaseTimer::start();
    let result_layout = ResultLayout::new(outputs, assignment.groups)?;
    let result = ctx.alloc("result", result_layout.total)?;
    ctx.launch(&FinalizeGroups {
        source,
        outputs,
        layout: &layout,
        accumulators: &accumulators,
        result_layout: &result_layout,
        result: &result,
        mapping: RowMapping::Grouped {
            occupancy: &assignment.occupancy,
            offsets: &offsets,
            ranks: &ranks,
        },
    }, capacity)?;
    let table = split_result(ctx, &result, &result_layout, outputs)?;
    timer.finish(PHASE_MATERIALIZE, stats);
    if assignment.aliased_tuples > 0 {
        log::debug!("{} of {} tuples were aggregated into an aliased group", assignment.aliased_tuples, tuple_num);
    }
    Ok(table)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::Options;
    use crate::table::DataType;

    fn context(hash_capacity: usize) -> ExecutionContext {
        ExecutionContext::new(&Options::default()
            .with_lanes(4)
            .with_block_size(16)
            .with_hash_capacity(hash_capacity))
    }

    fn assign(ctx: &ExecutionContext, table: &Table, key: &[usize]) -> GroupAssignment {
        let columns = key
            .iter()
            .map(|&index| GroupColumn { index, data_type: table.columns()[index].data_type() })
            .collect::<Vec<_>>();
        let packed = pack(ctx, table).unwrap();
        assign_groups(ctx, GroupKeyHasher { source: packed.view(), columns: &columns }, &mut NoopStats).unwrap()
    }

    fn sample_table() -> Table {
        let g = (0..1000).map(|i| (i * 37 % 23) as i64).collect::<Vec<_>>();
        let h = (0..1000).map(|i| (i % 3) as i32).collect::<Vec<_>>();
        Table::new(vec![Column::from_i64(&g), Column::from_i32(&h)]).unwrap()
    }

    #[test]
    fn test_histogram_counts_every_tuple() {
        let ctx = context(1 << 20);
        let table = sample_table();
        let assignment = assign(&ctx, &table, &[0, 1]);
        let histogram = ctx.read_words(&assignment.histogram, 1 << 20).unwrap();
        assert_eq!(histogram.iter().sum::<u64>(), 1000);
        let occupancy = ctx.read_words(&assignment.occupancy, 1 << 20).unwrap();
        assert_eq!(histogram.iter().filter(|&&c| c > 0).count(), assignment.groups);
        assert_eq!(occupancy.iter().sum::<u64>() as usize, assignment.groups);
        // (i*37 % 23, i % 3) has 69 distinct values
        assert_eq!(assignment.groups, 69);
        assert_eq!(assignment.aliased_tuples, 0);
    }

    #[test]
    fn test_offsets_give_disjoint_slots() {
        let ctx = context(512);
        let table = sample_table();
        let assignment = assign(&ctx, &table, &[0]);
        let offsets = ctx.alloc_words("offsets", 512).unwrap();
        BlockScan { block: 64 }.exclusive_scan(&ctx, &assignment.histogram, &offsets, 512).unwrap();
        let histogram = ctx.read_words(&assignment.histogram, 512).unwrap();
        let offsets = ctx.read_words(&offsets, 512).unwrap();
        assert_eq!(offsets[0], 0);
        assert!(offsets.windows(2).all(|w| w[0] <= w[1]));
        for b in 0..511 {
            assert!(offsets[b] + histogram[b] <= offsets[b + 1]);
        }
        assert_eq!(offsets[511] + histogram[511], 1000);
    }

    #[test]
    fn test_tiny_capacity_reports_overflow() {
        let ctx = context(4);
        let table = sample_table();
        let mut timings = PhaseTimings::new();
        let columns = [GroupColumn { index: 0, data_type: DataType::Int64 }];
        let packed = pack(&ctx, &table).unwrap();
        let assignment = assign_groups(&ctx, GroupKeyHasher { source: packed.view(), columns: &columns }, &mut timings).unwrap();
        assert!(assignment.groups <= 4);
        assert!(assignment.aliased_tuples > 0);
        assert_eq!(timings.overflows().len(), 1);
        assert_eq!(timings.overflows()[0].capacity, 4);
        assert_eq!(timings.phase_names(), vec![PHASE_BUILD_KEYS, PHASE_VERIFY_KEYS, PHASE_COUNT]);
    }

    #[test]
    fn test_grouping_spec_from_indices() {
        assert_eq!(GroupingSpec::from_indices(&[-1]).unwrap(), GroupingSpec::WholeTable);
        assert_eq!(GroupingSpec::from_indices(&[2, 0]).unwrap(), GroupingSpec::Columns(vec![2, 0]));
        assert!(matches!(GroupingSpec::from_indices(&[]), Err(GroupByError::InvalidExpression(_))));
        assert!(matches!(GroupingSpec::from_indices(&[0, -1]), Err(GroupByError::InvalidExpression(_))));
    }
}
