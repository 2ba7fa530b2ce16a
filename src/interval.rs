//! Splitting a query window into equal-width buckets.

use crate::{Result, TslabError};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A closed time interval `[start, end]` in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: i64,
    pub end: i64,
}

impl TimeRange {
    pub fn new(start: i64, end: i64) -> Self {
        Self { start, end }
    }

    /// Number of milliseconds covered.
    pub fn duration(&self) -> i64 {
        self.end - self.start + 1
    }

    pub fn contains(&self, timestamp: i64) -> bool {
        timestamp >= self.start && timestamp <= self.end
    }
}

impl fmt::Display for TimeRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.start, self.end)
    }
}

/// Splits `[from, to)` into contiguous buckets of equal width.
///
/// The width is `interval` when given (more than `max_size` buckets widen it), otherwise
/// `to - from` divided by `size` or by `max_size`. Each bucket ends one millisecond before
/// the next begins; the last one ends at `to - 1` and absorbs the division remainder.
pub fn interval_ranges(
    from: i64,
    to: i64,
    size: Option<usize>,
    interval: Option<i64>,
    max_size: usize,
) -> Result<Vec<TimeRange>> {
    if from >= to {
        return Err(TslabError::InvalidTimeRange {
            start: from,
            end: to,
        });
    }
    if max_size == 0 {
        return Err(TslabError::InvalidConfiguration(
            "max query size must be positive".to_string(),
        ));
    }

    let duration = to.checked_sub(from).ok_or(TslabError::InvalidTimeRange {
        start: from,
        end: to,
    })?;
    let max = max_size as i64;
    let (count, width) = match (interval, size) {
        (Some(interval), _) => {
            if interval <= 0 {
                return Err(TslabError::InvalidConfiguration(format!(
                    "query interval must be positive, got {interval}"
                )));
            }
            let count = (duration / interval).max(1);
            if count > max {
                (max, duration / max)
            } else {
                (count, interval.min(duration))
            }
        }
        (None, Some(size)) => {
            if size == 0 {
                return Err(TslabError::InvalidConfiguration(
                    "query size must be positive".to_string(),
                ));
            }
            let count = (size as i64).min(max);
            (count, duration / count)
        }
        (None, None) => (max, duration / max),
    };

    // Buckets are at least one millisecond wide.
    let (count, width) = if width == 0 {
        (duration, 1)
    } else {
        (count, width)
    };

    Ok((0..count)
        .map(|i| {
            let start = from + i * width;
            let end = if i == count - 1 {
                to - 1
            } else {
                start + width - 1
            };
            TimeRange::new(start, end)
        })
        .collect())
}
