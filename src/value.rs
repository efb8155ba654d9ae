//! The value type stored in state intervals.
//!
//! A [`StateValue`] is a small tagged union: null, 32/64-bit integer, double,
//! or string. Numeric kinds compare and add across each other; strings only
//! compare to strings. Everything else is a [`StateError::ValueType`].

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, StateError};

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub enum StateValue {
    #[default]
    Null,
    Int(i32),
    Long(i64),
    Double(f64),
    Str(String),
}

impl StateValue {
    pub fn is_null(&self) -> bool {
        matches!(self, StateValue::Null)
    }

    /// True for the kinds the mipmap layer can summarize.
    pub fn is_numeric(&self) -> bool {
        matches!(self, StateValue::Int(_) | StateValue::Long(_))
    }

    fn kind(&self) -> &'static str {
        match self {
            StateValue::Null => "null",
            StateValue::Int(_) => "int",
            StateValue::Long(_) => "long",
            StateValue::Double(_) => "double",
            StateValue::Str(_) => "string",
        }
    }

    pub fn unbox_int(&self) -> Result<i32> {
        match self {
            StateValue::Int(v) => Ok(*v),
            other => Err(StateError::ValueType {
                expected: "int",
                actual: other.kind(),
            }),
        }
    }

    pub fn unbox_long(&self) -> Result<i64> {
        match self {
            StateValue::Int(v) => Ok(*v as i64),
            StateValue::Long(v) => Ok(*v),
            other => Err(StateError::ValueType {
                expected: "long",
                actual: other.kind(),
            }),
        }
    }

    pub fn unbox_str(&self) -> Result<&str> {
        match self {
            StateValue::Str(s) => Ok(s),
            other => Err(StateError::ValueType {
                expected: "string",
                actual: other.kind(),
            }),
        }
    }

    /// Numeric value widened to f64, used by the mipmap averaging path.
    /// Null weighs in as 0.0 so gaps still count toward time-weighted means.
    pub fn to_f64(&self) -> Result<f64> {
        match self {
            StateValue::Null => Ok(0.0),
            StateValue::Int(v) => Ok(*v as f64),
            StateValue::Long(v) => Ok(*v as f64),
            StateValue::Double(v) => Ok(*v),
            other => Err(StateError::ValueType {
                expected: "numeric",
                actual: other.kind(),
            }),
        }
    }

    /// Checked numeric addition, used for cumulative counter attributes.
    pub fn add(&self, other: &StateValue) -> Result<StateValue> {
        match (self, other) {
            (StateValue::Int(a), StateValue::Int(b)) => Ok(StateValue::Int(a.wrapping_add(*b))),
            (a, b) if a.is_numeric() && b.is_numeric() => {
                Ok(StateValue::Long(a.unbox_long()?.wrapping_add(b.unbox_long()?)))
            }
            (a, b) => Err(StateError::ValueType {
                expected: "numeric",
                actual: if a.is_numeric() { b.kind() } else { a.kind() },
            }),
        }
    }

    /// Ordering across comparable kinds. Numeric kinds compare to each other,
    /// strings compare to strings; any mix involving Null or crossing the
    /// numeric/string divide is not ordered.
    pub fn compare(&self, other: &StateValue) -> Option<Ordering> {
        match (self, other) {
            (StateValue::Str(a), StateValue::Str(b)) => Some(a.cmp(b)),
            (a, b) if a.is_null() || b.is_null() => None,
            (StateValue::Str(_), _) | (_, StateValue::Str(_)) => None,
            (a, b) => a.to_f64().ok()?.partial_cmp(&b.to_f64().ok()?),
        }
    }
}

impl fmt::Display for StateValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StateValue::Null => write!(f, "null"),
            StateValue::Int(v) => write!(f, "{v}"),
            StateValue::Long(v) => write!(f, "{v}"),
            StateValue::Double(v) => write!(f, "{v}"),
            StateValue::Str(s) => write!(f, "{s:?}"),
        }
    }
}
