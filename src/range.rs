//! Partition ranges: the time bounds, slot geometry and codec of one partition.

use crate::encoding::{Codec, NumberType};
use crate::series::{PartitionKey, SeriesDefinition};
use crate::{Result, TslabError};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::warn;

/// Derived description of a partition, computed from its series definition and key.
#[derive(Debug, Clone)]
pub struct PartitionRange {
    key: PartitionKey,
    /// First millisecond covered.
    start: i64,
    /// Last millisecond covered (inclusive).
    end: i64,
    interval: i64,
    slot_count: usize,
    number_type: NumberType,
    codec: Arc<dyn Codec>,
}

impl PartitionRange {
    /// Computes the nominal range of `key` from its series definition.
    pub fn calculate(definition: &SeriesDefinition, key: &PartitionKey) -> Result<Self> {
        let start = definition.period.parse(&key.label)?;
        let next = definition.period.end_of(start)?;
        let slot_count = ((next - start) / definition.interval) as usize;
        if slot_count == 0 {
            return Err(TslabError::InvalidConfiguration(format!(
                "interval {}ms of series '{}' does not fit period {}",
                definition.interval, definition.id, key.label
            )));
        }

        Ok(Self {
            key: key.clone(),
            start,
            end: next - 1,
            interval: definition.interval,
            slot_count,
            number_type: definition.number_type,
            codec: definition.codec()?,
        })
    }

    /// Re-derives the interval from the slot count of an existing file. The file wins over
    /// the definition when they disagree.
    pub fn with_slot_count(&self, slot_count: usize) -> Result<Self> {
        if slot_count == 0 {
            return Err(TslabError::InvalidConfiguration(format!(
                "partition {} cannot have zero slots",
                self.key
            )));
        }
        if slot_count == self.slot_count {
            return Ok(self.clone());
        }

        let interval = self.duration() / slot_count as i64;
        if interval == 0 {
            return Err(TslabError::InvalidConfiguration(format!(
                "partition {} has more slots ({}) than milliseconds",
                self.key, slot_count
            )));
        }
        if interval != self.interval {
            warn!(
                "Partition {} holds {} slots: using interval {}ms instead of the declared {}ms",
                self.key, slot_count, interval, self.interval
            );
        }

        Ok(Self {
            interval,
            slot_count,
            ..self.clone()
        })
    }

    pub fn key(&self) -> &PartitionKey {
        &self.key
    }

    pub fn start(&self) -> i64 {
        self.start
    }

    pub fn end(&self) -> i64 {
        self.end
    }

    pub fn interval(&self) -> i64 {
        self.interval
    }

    pub fn slot_count(&self) -> usize {
        self.slot_count
    }

    pub fn number_type(&self) -> NumberType {
        self.number_type
    }

    pub fn codec(&self) -> &Arc<dyn Codec> {
        &self.codec
    }

    pub fn type_width(&self) -> usize {
        self.codec.type_width()
    }

    /// Exact size of the partition file in bytes.
    pub fn byte_len(&self) -> usize {
        self.slot_count * self.codec.type_width()
    }

    /// Length of the covered period in milliseconds.
    pub fn duration(&self) -> i64 {
        self.end - self.start + 1
    }

    pub fn contains(&self, timestamp: i64) -> bool {
        timestamp >= self.start && timestamp <= self.end
    }

    /// True when `[from, to]` (inclusive) intersects this range.
    pub fn overlaps(&self, from: i64, to: i64) -> bool {
        from <= self.end && to >= self.start
    }

    /// Slot holding `timestamp`: `floor((timestamp - start) / interval)`.
    pub fn index_of(&self, timestamp: i64) -> Option<usize> {
        if !self.contains(timestamp) {
            return None;
        }
        let index = ((timestamp - self.start) / self.interval) as usize;
        (index < self.slot_count).then_some(index)
    }

    /// First millisecond of `slot`.
    pub fn timestamp_of(&self, slot: usize) -> i64 {
        self.start + slot as i64 * self.interval
    }
}

/// Ordered, non-overlapping index of the partitions of one series, keyed by range start.
#[derive(Debug, Clone, Default)]
pub struct RangeMap {
    ranges: BTreeMap<i64, PartitionRange>,
}

impl RangeMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a range. Ranges overlapping an existing entry are rejected and logged.
    pub fn insert(&mut self, range: PartitionRange) -> bool {
        let overlaps = self.overlapping(range.start(), range.end()).next().is_some();
        if overlaps {
            warn!("Ignoring partition {} overlapping another partition", range.key());
            return false;
        }
        self.ranges.insert(range.start(), range);
        true
    }

    /// Ranges intersecting `[from, to]` (inclusive), in chronological order.
    pub fn overlapping(&self, from: i64, to: i64) -> impl Iterator<Item = &PartitionRange> {
        let first = self
            .ranges
            .range(..from)
            .next_back()
            .map(|(_, range)| range)
            .filter(|range| range.end() >= from);
        let rest = (from <= to)
            .then(|| self.ranges.range(from..=to).map(|(_, range)| range))
            .into_iter()
            .flatten();
        first.into_iter().chain(rest)
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PartitionRange> {
        self.ranges.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::series::Period;

    fn definition(interval: i64) -> SeriesDefinition {
        SeriesDefinition::new("s", NumberType::Float32, interval, Period::Day)
    }

    #[test]
    fn test_calculate_day_range() {
        let key = PartitionKey::new("s", "20241111");
        let range = PartitionRange::calculate(&definition(60_000), &key).unwrap();
        assert_eq!(range.start(), 1_731_283_200_000);
        assert_eq!(range.end(), 1_731_283_200_000 + 86_400_000 - 1);
        assert_eq!(range.slot_count(), 1440);
        assert_eq!(range.byte_len(), 1440 * 4);
    }

    #[test]
    fn test_index_of_is_floor_division() {
        let key = PartitionKey::new("s", "20241111");
        let range = PartitionRange::calculate(&definition(60_000), &key).unwrap();
        let start = range.start();
        assert_eq!(range.index_of(start), Some(0));
        assert_eq!(range.index_of(start + 59_999), Some(0));
        assert_eq!(range.index_of(start + 60_000), Some(1));
        assert_eq!(range.index_of(range.end()), Some(1439));
        assert_eq!(range.index_of(start - 1), None);
        assert_eq!(range.index_of(range.end() + 1), None);
        assert_eq!(range.timestamp_of(1439), start + 1439 * 60_000);
    }

    #[test]
    fn test_remainder_after_last_slot_has_no_index() {
        // 86_400_000 / 7_000_000 leaves a tail shorter than one slot.
        let key = PartitionKey::new("s", "20241111");
        let range = PartitionRange::calculate(&definition(7_000_000), &key).unwrap();
        assert_eq!(range.slot_count(), 12);
        assert_eq!(range.index_of(range.start() + 12 * 7_000_000), None);
    }

    #[test]
    fn test_file_slot_count_wins() {
        let key = PartitionKey::new("s", "20241111");
        let range = PartitionRange::calculate(&definition(60_000), &key).unwrap();
        let coarse = range.with_slot_count(24).unwrap();
        assert_eq!(coarse.interval(), 3_600_000);
        assert_eq!(coarse.slot_count(), 24);
        assert_eq!(coarse.start(), range.start());
        assert!(range.with_slot_count(0).is_err());
    }

    #[test]
    fn test_range_map_overlap_lookup() {
        let def = definition(60_000);
        let mut map = RangeMap::new();
        for label in ["20241110", "20241111", "20241113"] {
            let key = PartitionKey::new("s", label);
            assert!(map.insert(PartitionRange::calculate(&def, &key).unwrap()));
        }
        assert_eq!(map.len(), 3);

        let day = 86_400_000;
        let nov11 = 1_731_283_200_000;
        let labels = |from: i64, to: i64| {
            map.overlapping(from, to)
                .map(|r| r.key().label.clone())
                .collect::<Vec<_>>()
        };

        assert_eq!(labels(nov11 + 5, nov11 + 10), vec!["20241111"]);
        assert_eq!(labels(nov11 - 1, nov11), vec!["20241110", "20241111"]);
        assert_eq!(labels(nov11 + day, nov11 + 2 * day - 1), Vec::<String>::new());
        assert_eq!(
            labels(nov11 - day, nov11 + 3 * day),
            vec!["20241110", "20241111", "20241113"]
        );

        let duplicate = PartitionRange::calculate(&def, &PartitionKey::new("s", "20241111"));
        assert!(!map.insert(duplicate.unwrap()));
    }
}
