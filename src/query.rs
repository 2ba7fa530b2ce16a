//! Bucketed queries over one or many series.

use crate::concurrency::WorkerPool;
use crate::interval::{TimeRange, interval_ranges};
use crate::partition::Partition;
use crate::reducer::{NullPolicy, PartialReduction, PrecisionMode, Reducer, Reduction, Value};
use crate::series::SeriesFile;
use crate::store::PartitionStore;
use crate::{DataPoint, Number, Result, TslabError};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, instrument};

/// Which series a query reads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SeriesSelector {
    /// Exactly these series. Every id must exist.
    Ids(Vec<String>),
    /// Series whose whole id matches `pattern` and whose metadata contains every pair of
    /// `metadata`.
    Pattern {
        pattern: String,
        #[serde(default)]
        metadata: BTreeMap<String, String>,
    },
}

impl SeriesSelector {
    pub fn ids<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        SeriesSelector::Ids(ids.into_iter().map(Into::into).collect())
    }

    pub fn pattern(pattern: impl Into<String>) -> Self {
        SeriesSelector::Pattern {
            pattern: pattern.into(),
            metadata: BTreeMap::new(),
        }
    }

    /// Adds a required metadata pair. Has no effect on an id list.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        if let SeriesSelector::Pattern { metadata, .. } = &mut self {
            metadata.insert(key.into(), value.into());
        }
        self
    }

    /// Resolves the selected series, sorted by id.
    pub fn resolve(&self, store: &PartitionStore) -> Result<Vec<SeriesFile>> {
        match self {
            SeriesSelector::Ids(ids) => ids
                .iter()
                .collect::<BTreeSet<_>>()
                .into_iter()
                .map(|id| store.series(id))
                .collect(),
            SeriesSelector::Pattern { pattern, metadata } => {
                let regex = Regex::new(&format!("^(?:{})$", pattern))?;
                Ok(store
                    .list_series()
                    .into_iter()
                    .filter(|file| regex.is_match(file.id()))
                    .filter(|file| {
                        metadata
                            .iter()
                            .all(|(key, value)| file.metadata.get(key) == Some(value))
                    })
                    .collect())
            }
        }
    }
}

/// What happens to buckets that reduce to null.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NullHandling {
    #[default]
    Drop,
    Keep,
    /// Null buckets repeat the last non-null value. Nulls before the first value are dropped.
    CarryForward,
}

impl NullHandling {
    fn apply(self, points: Vec<BucketValue>) -> Vec<BucketValue> {
        match self {
            NullHandling::Keep => points,
            NullHandling::Drop => points.into_iter().filter(|p| p.value.is_some()).collect(),
            NullHandling::CarryForward => {
                let mut last: Option<Value> = None;
                points
                    .into_iter()
                    .filter_map(|point| {
                        if point.value.is_some() {
                            last = point.value;
                        }
                        Some(BucketValue {
                            timestamp: point.timestamp,
                            value: Some(last.clone()?),
                        })
                    })
                    .collect()
            }
        }
    }
}

/// A bucketed query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryRequest {
    pub selector: SeriesSelector,
    /// Inclusive start, milliseconds.
    pub from: i64,
    /// Exclusive end, milliseconds.
    pub to: i64,
    /// Requested bucket count.
    pub size: Option<usize>,
    /// Requested bucket width in milliseconds. Takes precedence over `size`.
    pub interval: Option<i64>,
    pub time_reducer: Reducer,
    pub series_reducer: Option<Reducer>,
    pub null_handling: NullHandling,
    pub precision: PrecisionMode,
    /// Substituted for null slots before reduction.
    pub fallback: Option<Number>,
}

impl QueryRequest {
    pub fn new(selector: SeriesSelector, from: i64, to: i64) -> Self {
        Self {
            selector,
            from,
            to,
            size: None,
            interval: None,
            time_reducer: Reducer::Average,
            series_reducer: None,
            null_handling: NullHandling::default(),
            precision: PrecisionMode::default(),
            fallback: None,
        }
    }

    pub fn with_size(mut self, size: usize) -> Self {
        self.size = Some(size);
        self
    }

    pub fn with_interval(mut self, interval: i64) -> Self {
        self.interval = Some(interval);
        self
    }

    pub fn with_time_reducer(mut self, reducer: Reducer) -> Self {
        self.time_reducer = reducer;
        self
    }

    pub fn with_series_reducer(mut self, reducer: Reducer) -> Self {
        self.series_reducer = Some(reducer);
        self
    }

    pub fn with_null_handling(mut self, handling: NullHandling) -> Self {
        self.null_handling = handling;
        self
    }

    pub fn with_precision(mut self, precision: PrecisionMode) -> Self {
        self.precision = precision;
        self
    }

    pub fn with_fallback(mut self, fallback: impl Into<Number>) -> Self {
        self.fallback = Some(fallback.into());
        self
    }
}

/// One reduced bucket, stamped with the bucket start.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BucketValue {
    pub timestamp: i64,
    pub value: Option<Value>,
}

/// The buckets of one series, or of the synthesized series of a cross-series reduction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeriesData {
    pub id: String,
    pub metadata: BTreeMap<String, String>,
    pub points: Vec<BucketValue>,
}

/// A decode task: the buckets of one series served by one partition.
struct Segment {
    series: usize,
    partition: Arc<Partition>,
}

/// Runs bucketed queries against a [`PartitionStore`], decoding partitions on a worker pool.
pub struct QueryService {
    store: Arc<PartitionStore>,
    pool: Arc<WorkerPool>,
    max_query_size: usize,
}

impl QueryService {
    pub fn new(store: Arc<PartitionStore>, pool: Arc<WorkerPool>, max_query_size: usize) -> Self {
        Self {
            store,
            pool,
            max_query_size,
        }
    }

    pub fn max_query_size(&self) -> usize {
        self.max_query_size
    }

    /// Reduces every selected series to one value per bucket, then optionally across series.
    /// Results are sorted by series id.
    #[instrument(skip(self, request), fields(from = request.from, to = request.to))]
    pub fn find_data(&self, request: &QueryRequest) -> Result<Vec<SeriesData>> {
        let buckets: Arc<[TimeRange]> = interval_ranges(
            request.from,
            request.to,
            request.size,
            request.interval,
            self.max_query_size,
        )?
        .into();
        let series = request.selector.resolve(&self.store)?;
        let reduction = Reduction::new(
            request.time_reducer,
            request.precision,
            NullPolicy::new(request.fallback),
        );

        let window_end = request.to - 1;
        let mut segments = Vec::new();
        for (index, file) in series.iter().enumerate() {
            let ranges = self.store.get_range_map(file.id())?;
            for range in ranges.overlapping(request.from, window_end) {
                if let Some(partition) = self.store.find_buffer(range.key())? {
                    segments.push(Segment {
                        series: index,
                        partition,
                    });
                }
            }
        }
        debug!(
            "Query spans {} series, {} buckets, {} partitions",
            series.len(),
            buckets.len(),
            segments.len()
        );

        let tasks: Vec<_> = segments
            .iter()
            .map(|segment| {
                let partition = Arc::clone(&segment.partition);
                let buckets = Arc::clone(&buckets);
                move || reduce_partition(&partition, &buckets, reduction)
            })
            .collect();
        let partials = self.pool.run_all(tasks)?;

        // Segments are chronological within a series, so combining in task order keeps
        // FIRST and LAST meaningful.
        let mut states: Vec<Vec<Option<PartialReduction>>> = series
            .iter()
            .map(|_| buckets.iter().map(|_| None).collect())
            .collect();
        for (segment, partial) in segments.iter().zip(partials) {
            let slots = &mut states[segment.series];
            for (bucket, state) in partial {
                slots[bucket] = Some(match slots[bucket].take() {
                    Some(acc) => reduction.combine(acc, state),
                    None => state,
                });
            }
        }

        let mut results: Vec<SeriesData> = series
            .into_iter()
            .zip(states)
            .filter_map(|(file, slots)| {
                let points: Vec<BucketValue> = buckets
                    .iter()
                    .zip(slots)
                    .map(|(bucket, state)| BucketValue {
                        timestamp: bucket.start,
                        value: state.and_then(|s| reduction.finish(s)),
                    })
                    .collect();
                if points.iter().all(|p| p.value.is_none()) {
                    debug!("Dropping series '{}' with no values in range", file.id());
                    return None;
                }
                Some(SeriesData {
                    id: file.definition.id,
                    metadata: file.metadata,
                    points: request.null_handling.apply(points),
                })
            })
            .collect();

        if let Some(series_reducer) = request.series_reducer {
            let cross = Reduction::new(
                series_reducer,
                request.precision,
                NullPolicy::new(request.fallback),
            );
            results = reduce_across(&results, cross, request.null_handling)
                .into_iter()
                .collect();
        }

        results.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(results)
    }

    /// Every slot of a series in `[from, to)`, with its timestamp. Unwritten slots are null;
    /// periods without a partition are skipped.
    pub fn select_raw(&self, series_id: &str, from: i64, to: i64) -> Result<Vec<DataPoint>> {
        if from >= to {
            return Err(TslabError::InvalidTimeRange {
                start: from,
                end: to,
            });
        }

        let mut points = Vec::new();
        for range in self.store.get_range_map(series_id)?.overlapping(from, to - 1) {
            if let Some(partition) = self.store.find_buffer(range.key())? {
                points.extend(partition.select_points(from, to - 1)?);
            }
        }
        Ok(points)
    }
}

/// Folds the slots of `partition` into the buckets they fall in.
fn reduce_partition(
    partition: &Partition,
    buckets: &[TimeRange],
    reduction: Reduction,
) -> Result<Vec<(usize, PartialReduction)>> {
    let range = partition.range();
    let first = buckets.partition_point(|b| b.end < range.start());
    let mut partials = Vec::new();

    for (index, bucket) in buckets.iter().enumerate().skip(first) {
        if bucket.start > range.end() {
            break;
        }
        let mut state = reduction.supplier();
        for value in partition.select(bucket.start, bucket.end)? {
            reduction.accumulate(&mut state, value);
        }
        partials.push((index, state));
    }
    Ok(partials)
}

/// Folds the buckets of several series sharing a timestamp into one synthesized series named
/// after the reducer. Its metadata holds the pairs common to every input.
fn reduce_across(
    series: &[SeriesData],
    reduction: Reduction,
    null_handling: NullHandling,
) -> Option<SeriesData> {
    let (head, tail) = series.split_first()?;

    let mut metadata = head.metadata.clone();
    for other in tail {
        metadata.retain(|key, value| other.metadata.get(key) == Some(value));
    }

    let mut grouped: BTreeMap<i64, PartialReduction> = BTreeMap::new();
    for data in series {
        for point in &data.points {
            let state = grouped
                .entry(point.timestamp)
                .or_insert_with(|| reduction.supplier());
            reduction.accumulate_value(state, point.value.as_ref());
        }
    }

    let points = grouped
        .into_iter()
        .map(|(timestamp, state)| BucketValue {
            timestamp,
            value: reduction.finish(state),
        })
        .collect();

    Some(SeriesData {
        id: reduction.reducer().name().to_lowercase(),
        metadata,
        points: null_handling.apply(points),
    })
}
