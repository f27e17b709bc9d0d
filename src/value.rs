use std::fmt;

use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};

/// A decoded cell of a host or result column.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Hash, Serialize, Deserialize)]
pub enum Value {
    Int(i64),
    Float(OrderedFloat<f64>),
    Bytes(Vec<u8>),
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(x) => write!(f, "{}", x.into_inner()),
            Value::Bytes(ref bytes) => {
                let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
                write!(f, "\"{}\"", String::from_utf8_lossy(&bytes[..end]))
            }
        }
    }
}

impl From<i64> for Value {
    fn from(val: i64) -> Value {
        Value::Int(val)
    }
}

impl From<f64> for Value {
    fn from(val: f64) -> Self {
        Value::Float(OrderedFloat(val))
    }
}

impl<'a> From<&'a [u8]> for Value {
    fn from(val: &[u8]) -> Value {
        Value::Bytes(val.to_vec())
    }
}
