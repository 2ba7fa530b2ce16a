//! tslab - an embedded time-series store built from fixed-interval partition files
//!
//! Every series is cut into period-bounded partitions (a day, a month, a year). A partition
//! is a memory-mapped file holding one fixed-width slot per interval, encoded with a
//! pluggable numeric codec that trades precision for size on disk.

pub mod archive;
pub mod cache;
pub mod catalog;
pub mod cgroup;
pub mod concurrency;
pub mod encoding;
pub mod error;
pub mod interval;
pub mod minifloat;
pub mod mmap;
pub mod partition;
pub mod quantize;
pub mod query;
pub mod range;
pub mod reducer;
pub mod series;
pub mod storage;
pub mod store;

pub use encoding::{Codec, NumberType};
pub use error::{Result, TslabError};
pub use interval::TimeRange;
pub use query::{BucketValue, NullHandling, QueryRequest, SeriesData, SeriesSelector};
pub use reducer::{PrecisionMode, Reducer, Value};
pub use series::{PartitionKey, Period, SeriesDefinition, SeriesFile};
pub use storage::{Storage, StorageBuilder};

use serde::{Deserialize, Serialize};
use std::fmt;

/// A decoded numeric value. Integer codecs produce `Int`, float codecs produce `Float`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Number {
    Int(i64),
    Float(f64),
}

impl Number {
    /// Returns the value as a double, losing precision above 2^53 for integers.
    pub fn as_f64(self) -> f64 {
        match self {
            Number::Int(v) => v as f64,
            Number::Float(v) => v,
        }
    }

    /// Returns true for a float NaN, which every codec stores as null.
    pub fn is_nan(self) -> bool {
        matches!(self, Number::Float(v) if v.is_nan())
    }
}

impl From<f64> for Number {
    fn from(value: f64) -> Self {
        Number::Float(value)
    }
}

impl From<f32> for Number {
    fn from(value: f32) -> Self {
        Number::Float(value as f64)
    }
}

impl From<i64> for Number {
    fn from(value: i64) -> Self {
        Number::Int(value)
    }
}

impl From<i32> for Number {
    fn from(value: i32) -> Self {
        Number::Int(value as i64)
    }
}

impl fmt::Display for Number {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Number::Int(v) => write!(f, "{}", v),
            Number::Float(v) => write!(f, "{}", v),
        }
    }
}

/// A timestamped, nullable value; the unit of insertion and raw selection.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DataPoint {
    /// Unix timestamp in milliseconds.
    pub timestamp: i64,
    /// The value, or `None` for "no data".
    pub value: Option<Number>,
}

impl DataPoint {
    /// Creates a new DataPoint.
    pub fn new(timestamp: i64, value: impl Into<Number>) -> Self {
        Self {
            timestamp,
            value: Some(value.into()),
        }
    }

    /// Creates a DataPoint carrying no value.
    pub fn null(timestamp: i64) -> Self {
        Self {
            timestamp,
            value: None,
        }
    }
}

impl fmt::Display for DataPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.value {
            Some(value) => write!(f, "DataPoint(ts: {}, val: {})", self.timestamp, value),
            None => write!(f, "DataPoint(ts: {}, val: null)", self.timestamp),
        }
    }
}
