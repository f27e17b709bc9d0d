#[macro_use]
mod errors;
pub mod device;
pub mod expression;
pub mod groupby;
mod options;
pub mod stats;
pub mod table;
mod value;

pub use crate::device::{DeviceBuffer, ExecutionContext, MemoryPool};
pub use crate::errors::GroupByError;
pub use crate::expression::{AggregateExpr, Aggregator, Expr, Func2Type, OutputColumn, MAX_EXPRESSION_DEPTH};
pub use crate::groupby::{group_by, group_by_with_scan, GroupByRequest, GroupingSpec};
pub use crate::options::{Options, HSIZE};
pub use crate::stats::{CapacityOverflow, NoopStats, PhaseTimings, StatsSink};
pub use crate::table::{Column, ColumnData, DataFormat, DataPos, DataType, Table};
pub use crate::value::Value;
