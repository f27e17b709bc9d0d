use std::fmt;

use crate::errors::GroupByError;
use crate::groupby::SourceView;
use crate::table::DataType;
use crate::value::Value;

/// Deepest expression tree accepted: an arithmetic operator directly over
/// column references or constants. Raising this is a format change for every
/// kernel that evaluates expressions, not a silent generalization.
pub const MAX_EXPRESSION_DEPTH: usize = 2;

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Col(usize),
    Const(Value),
    Func2(Func2Type, Box<Expr>, Box<Expr>),
}

#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub enum Func2Type {
    Add,
    Subtract,
    Multiply,
    Divide,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Aggregator {
    Sum,
    Count,
    Avg,
    Max,
    Min,
}

/// An output column's expression, optionally reduced by an aggregator.
/// Without an aggregator the column carries the group's value of `expr`,
/// taken from the group's first tuple.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregateExpr {
    pub aggregator: Option<Aggregator>,
    pub expr: Expr,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OutputColumn {
    pub data_type: DataType,
    pub aggregate: AggregateExpr,
}

impl Expr {
    pub fn col(index: usize) -> Expr {
        Expr::Col(index)
    }

    pub fn int(value: i64) -> Expr {
        Expr::Const(Value::Int(value))
    }

    pub fn float(value: f64) -> Expr {
        Expr::Const(Value::from(value))
    }

    pub fn func2(op: Func2Type, lhs: Expr, rhs: Expr) -> Expr {
        Expr::Func2(op, Box::new(lhs), Box::new(rhs))
    }

    pub fn depth(&self) -> usize {
        match *self {
            Expr::Col(_) | Expr::Const(_) => 1,
            Expr::Func2(_, ref lhs, ref rhs) => 1 + lhs.depth().max(rhs.depth()),
        }
    }

    pub fn compile(&self, source_types: &[DataType]) -> Result<CompiledExpr, GroupByError> {
        if self.depth() > MAX_EXPRESSION_DEPTH {
            bail!(GroupByError::InvalidExpression,
                  "{} has depth {}, at most {} is supported",
                  self, self.depth(), MAX_EXPRESSION_DEPTH);
        }
        match *self {
            Expr::Func2(op, ref lhs, ref rhs) => {
                let lhs = lhs.operand(source_types)?;
                let rhs = rhs.operand(source_types)?;
                for operand in &[lhs, rhs] {
                    if let Operand::Col { index, data_type: DataType::Fixed(_) } = *operand {
                        bail!(GroupByError::InvalidExpression,
                              "column {} is not numeric and cannot be used in {}", index, self);
                    }
                }
                Ok(CompiledExpr::Func2(op, lhs, rhs))
            }
            _ => Ok(CompiledExpr::Operand(self.operand(source_types)?)),
        }
    }

    fn operand(&self, source_types: &[DataType]) -> Result<Operand, GroupByError> {
        match *self {
            Expr::Col(index) => match source_types.get(index) {
                Some(&data_type) => Ok(Operand::Col { index, data_type }),
                None => bail!(GroupByError::InvalidExpression,
                              "column {} out of range, table has {} columns", index, source_types.len()),
            },
            Expr::Const(Value::Int(i)) => Ok(Operand::Int(i)),
            Expr::Const(Value::Float(f)) => Ok(Operand::Float(f.into_inner())),
            Expr::Const(ref value) => bail!(GroupByError::InvalidExpression, "unsupported constant {}", value),
            Expr::Func2(..) => Err(fatal!("operand() called on operator node {}", self)),
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Expr::Col(index) => write!(f, "${}", index),
            Expr::Const(ref value) => write!(f, "{}", value),
            Expr::Func2(op, ref lhs, ref rhs) => write!(f, "({} {} {})", lhs, op.symbol(), rhs),
        }
    }
}

impl Func2Type {
    pub fn symbol(self) -> &'static str {
        match self {
            Func2Type::Add => "+",
            Func2Type::Subtract => "-",
            Func2Type::Multiply => "*",
            Func2Type::Divide => "/",
        }
    }

    /// Integer operands stay integer (checked, division truncates toward zero);
    /// any float operand promotes both sides to f64.
    #[inline]
    pub fn apply(self, lhs: Num, rhs: Num) -> Result<Num, GroupByError> {
        match (lhs, rhs) {
            (Num::Int(a), Num::Int(b)) => {
                let result = match self {
                    Func2Type::Add => a.checked_add(b),
                    Func2Type::Subtract => a.checked_sub(b),
                    Func2Type::Multiply => a.checked_mul(b),
                    Func2Type::Divide => a.checked_div(b),
                };
                result.map(Num::Int).ok_or(GroupByError::Overflow)
            }
            (a, b) => {
                let (a, b) = (a.as_f64(), b.as_f64());
                Ok(Num::Float(match self {
                    Func2Type::Add => a + b,
                    Func2Type::Subtract => a - b,
                    Func2Type::Multiply => a * b,
                    Func2Type::Divide => a / b,
                }))
            }
        }
    }
}

impl Aggregator {
    pub fn get_string(self, expr: String) -> String {
        match self {
            Aggregator::Sum => format!("Sum({})", expr),
            Aggregator::Count => format!("Count({})", expr),
            Aggregator::Avg => format!("Avg({})", expr),
            Aggregator::Max => format!("Max({})", expr),
            Aggregator::Min => format!("Min({})", expr),
        }
    }
}

impl AggregateExpr {
    pub fn value(expr: Expr) -> AggregateExpr {
        AggregateExpr { aggregator: None, expr }
    }

    pub fn sum(expr: Expr) -> AggregateExpr {
        AggregateExpr { aggregator: Some(Aggregator::Sum), expr }
    }

    pub fn count(expr: Expr) -> AggregateExpr {
        AggregateExpr { aggregator: Some(Aggregator::Count), expr }
    }

    /// `COUNT(*)`
    pub fn count_star() -> AggregateExpr {
        AggregateExpr::count(Expr::int(1))
    }

    pub fn avg(expr: Expr) -> AggregateExpr {
        AggregateExpr { aggregator: Some(Aggregator::Avg), expr }
    }

    pub fn max(expr: Expr) -> AggregateExpr {
        AggregateExpr { aggregator: Some(Aggregator::Max), expr }
    }

    pub fn min(expr: Expr) -> AggregateExpr {
        AggregateExpr { aggregator: Some(Aggregator::Min), expr }
    }
}

impl fmt::Display for AggregateExpr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.aggregator {
            Some(aggregator) => write!(f, "{}", aggregator.get_string(self.expr.to_string())),
            None => write!(f, "{}", self.expr),
        }
    }
}

impl OutputColumn {
    pub fn new(data_type: DataType, aggregate: AggregateExpr) -> OutputColumn {
        OutputColumn { data_type, aggregate }
    }

    /// Type-checks the column against the source table and lowers its expression
    /// to the form evaluated by the aggregate kernels.
    pub fn compile(&self, source_types: &[DataType]) -> Result<CompiledOutput, GroupByError> {
        let expr = self.aggregate.expr.compile(source_types)?;
        let aggregator = self.aggregate.aggregator;
        match (self.data_type, aggregator) {
            (DataType::Fixed(0), _) => {
                bail!(GroupByError::InvalidExpression, "output {} has zero width", self.aggregate)
            }
            (DataType::Fixed(width), None) => match expr {
                CompiledExpr::Operand(Operand::Col { data_type: DataType::Fixed(w), .. }) if w == width => {}
                _ => bail!(GroupByError::InvalidExpression,
                           "fixed-width output of {} bytes must be a column of the same width, got {}",
                           width, self.aggregate),
            },
            (DataType::Fixed(_), Some(_)) => {
                bail!(GroupByError::InvalidExpression, "{} cannot produce a fixed-width output", self.aggregate)
            }
            (_, Some(Aggregator::Count)) => {}
            (_, _) => {
                if !expr.is_numeric() {
                    bail!(GroupByError::InvalidExpression, "{} requires a numeric expression", self.aggregate);
                }
            }
        }
        Ok(CompiledOutput {
            data_type: self.data_type,
            aggregator,
            expr,
        })
    }
}

impl fmt::Display for OutputColumn {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}: {:?}", self.aggregate, self.data_type)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Num {
    Int(i64),
    Float(f64),
}

impl Num {
    #[inline]
    pub fn as_f64(self) -> f64 {
        match self {
            Num::Int(i) => i as f64,
            Num::Float(f) => f,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Operand {
    Col { index: usize, data_type: DataType },
    Int(i64),
    Float(f64),
}

impl Operand {
    #[inline]
    fn eval(self, source: &SourceView, row: usize) -> Num {
        match self {
            Operand::Col { index, data_type } => source.number(index, data_type, row),
            Operand::Int(i) => Num::Int(i),
            Operand::Float(f) => Num::Float(f),
        }
    }

    fn is_float(self) -> bool {
        match self {
            Operand::Col { data_type, .. } => data_type.is_float(),
            Operand::Int(_) => false,
            Operand::Float(_) => true,
        }
    }
}

/// Expression lowered against a concrete source schema.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CompiledExpr {
    Operand(Operand),
    Func2(Func2Type, Operand, Operand),
}

impl CompiledExpr {
    #[inline]
    pub fn eval(&self, source: &SourceView, row: usize) -> Result<Num, GroupByError> {
        match *self {
            CompiledExpr::Operand(operand) => Ok(operand.eval(source, row)),
            CompiledExpr::Func2(op, lhs, rhs) => op.apply(lhs.eval(source, row), rhs.eval(source, row)),
        }
    }

    /// Whether evaluation yields floats. Decides the accumulator domain.
    pub fn is_float(&self) -> bool {
        match *self {
            CompiledExpr::Operand(operand) => operand.is_float(),
            CompiledExpr::Func2(_, lhs, rhs) => lhs.is_float() || rhs.is_float(),
        }
    }

    pub fn is_numeric(&self) -> bool {
        !matches!(*self, CompiledExpr::Operand(Operand::Col { data_type: DataType::Fixed(_), .. }))
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CompiledOutput {
    pub data_type: DataType,
    pub aggregator: Option<Aggregator>,
    pub expr: CompiledExpr,
}
