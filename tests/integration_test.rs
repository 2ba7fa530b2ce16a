//! Integration tests for tslab.

use std::collections::BTreeMap;
use std::fs;
use std::sync::Arc;
use tempfile::TempDir;
use tslab::{
    DataPoint, Number, NumberType, PartitionKey, Period, SeriesDefinition, SeriesFile, Storage,
    StorageBuilder, TslabError,
};

const NOV11: i64 = 1_731_283_200_000;
const MINUTE: i64 = 60_000;
const DAY: i64 = 86_400_000;

fn open(dir: &TempDir) -> Arc<dyn Storage> {
    StorageBuilder::new()
        .with_data_path(dir.path())
        .with_workers(2)
        .build()
        .unwrap()
}

fn minute_series(id: &str, number_type: NumberType) -> SeriesFile {
    SeriesFile::new(SeriesDefinition::new(id, number_type, MINUTE, Period::Day))
}

fn values(points: &[DataPoint]) -> Vec<Option<f64>> {
    points.iter().map(|p| p.value.map(Number::as_f64)).collect()
}

#[test]
fn test_basic_insert_and_select_raw() {
    let dir = TempDir::new().unwrap();
    let storage = open(&dir);
    storage
        .create_series(minute_series("temp", NumberType::Float64))
        .unwrap();

    storage
        .insert(
            "temp",
            &[
                DataPoint::new(NOV11, 1.0),
                DataPoint::new(NOV11 + MINUTE, 2.0),
                DataPoint::new(NOV11 + 3 * MINUTE, 3.0),
            ],
        )
        .unwrap();

    let points = storage.select_raw("temp", NOV11, NOV11 + 4 * MINUTE).unwrap();
    assert_eq!(points.len(), 4);
    assert_eq!(points[2].timestamp, NOV11 + 2 * MINUTE);
    assert_eq!(values(&points), vec![Some(1.0), Some(2.0), None, Some(3.0)]);
}

#[test]
fn test_timestamps_inside_a_slot_share_it() {
    let dir = TempDir::new().unwrap();
    let storage = open(&dir);
    storage
        .create_series(minute_series("temp", NumberType::Int32))
        .unwrap();

    storage
        .insert("temp", &[DataPoint::new(NOV11 + 59_999, 7i64)])
        .unwrap();
    let points = storage.select_raw("temp", NOV11, NOV11 + 1).unwrap();
    assert_eq!(points, vec![DataPoint::new(NOV11, 7i64)]);
}

#[test]
fn test_null_insert_clears_slot() {
    let dir = TempDir::new().unwrap();
    let storage = open(&dir);
    storage
        .create_series(minute_series("temp", NumberType::Float32))
        .unwrap();

    storage.insert("temp", &[DataPoint::new(NOV11, 4.5)]).unwrap();
    storage.insert("temp", &[DataPoint::null(NOV11)]).unwrap();

    let points = storage.select_raw("temp", NOV11, NOV11 + MINUTE).unwrap();
    assert_eq!(values(&points), vec![None]);
}

#[test]
fn test_out_of_range_integers_saturate_to_values() {
    let dir = TempDir::new().unwrap();
    let storage = open(&dir);
    storage
        .create_series(minute_series("temp", NumberType::Int8))
        .unwrap();

    storage
        .insert(
            "temp",
            &[
                DataPoint::new(NOV11, -200i64),
                DataPoint::new(NOV11 + MINUTE, 200i64),
                DataPoint::new(NOV11 + 2 * MINUTE, -128i64),
            ],
        )
        .unwrap();

    let points = storage.select_raw("temp", NOV11, NOV11 + 3 * MINUTE).unwrap();
    assert_eq!(values(&points), vec![Some(-127.0), Some(127.0), None]);
}

#[test]
fn test_insert_spanning_partitions_creates_each() {
    let dir = TempDir::new().unwrap();
    let storage = open(&dir);
    storage
        .create_series(minute_series("temp", NumberType::Int16))
        .unwrap();

    storage
        .insert(
            "temp",
            &[
                DataPoint::new(NOV11 + DAY - MINUTE, 1i64),
                DataPoint::new(NOV11 + DAY, 2i64),
            ],
        )
        .unwrap();

    assert_eq!(
        storage.partition_keys("temp").unwrap(),
        vec![
            PartitionKey::new("temp", "20241111"),
            PartitionKey::new("temp", "20241112"),
        ]
    );
    let file = dir.path().join("temp").join("20241112");
    assert_eq!(fs::metadata(file).unwrap().len(), 1440 * 2);

    let points = storage
        .select_raw("temp", NOV11 + DAY - MINUTE, NOV11 + DAY + MINUTE)
        .unwrap();
    assert_eq!(values(&points), vec![Some(1.0), Some(2.0)]);
}

#[test]
fn test_data_survives_reopen() {
    let dir = TempDir::new().unwrap();
    {
        let storage = open(&dir);
        storage
            .create_series(minute_series("temp", NumberType::Float64).with_metadata("unit", "C"))
            .unwrap();
        storage
            .insert("temp", &[DataPoint::new(NOV11 + 10 * MINUTE, 21.5)])
            .unwrap();
        storage.close().unwrap();
    }

    let storage = open(&dir);
    let series = storage.series("temp").unwrap();
    assert_eq!(series.metadata["unit"], "C");
    let points = storage
        .select_raw("temp", NOV11 + 10 * MINUTE, NOV11 + 11 * MINUTE)
        .unwrap();
    assert_eq!(values(&points), vec![Some(21.5)]);
}

#[test]
fn test_missing_series_errors() {
    let dir = TempDir::new().unwrap();
    let storage = open(&dir);

    assert!(matches!(
        storage.insert("nope", &[DataPoint::new(NOV11, 1.0)]),
        Err(TslabError::SeriesNotFound(_))
    ));
    assert!(matches!(
        storage.delete_series("nope"),
        Err(TslabError::SeriesNotFound(_))
    ));
    assert!(matches!(
        storage.select_raw("nope", NOV11, NOV11 + 1),
        Err(TslabError::SeriesNotFound(_))
    ));
}

#[test]
fn test_invalid_definitions_are_rejected() {
    let dir = TempDir::new().unwrap();
    let storage = open(&dir);

    assert!(matches!(
        storage.create_series(minute_series("level", NumberType::Mapped16)),
        Err(TslabError::MissingDomain { .. })
    ));
    assert!(matches!(
        storage.create_series(minute_series("../escape", NumberType::Int8)),
        Err(TslabError::InvalidConfiguration(_))
    ));
    assert!(matches!(
        storage.create_series(SeriesFile::new(SeriesDefinition::new(
            "slow",
            NumberType::Int8,
            2 * DAY,
            Period::Day
        ))),
        Err(TslabError::InvalidConfiguration(_))
    ));
    assert!(storage.list_series().unwrap().is_empty());
}

#[test]
fn test_invalid_time_range() {
    let dir = TempDir::new().unwrap();
    let storage = open(&dir);
    storage
        .create_series(minute_series("temp", NumberType::Int8))
        .unwrap();

    assert!(matches!(
        storage.select_raw("temp", NOV11 + 1, NOV11),
        Err(TslabError::InvalidTimeRange { .. })
    ));
}

#[test]
fn test_delete_series_removes_directory() {
    let dir = TempDir::new().unwrap();
    let storage = open(&dir);
    storage
        .create_series(minute_series("temp", NumberType::Int8))
        .unwrap();
    storage.insert("temp", &[DataPoint::new(NOV11, 3i64)]).unwrap();

    storage.delete_series("temp").unwrap();
    assert!(!dir.path().join("temp").exists());
    assert!(storage.list_series().unwrap().is_empty());

    // The id is free again, with no leftover partitions.
    storage
        .create_series(minute_series("temp", NumberType::Int8))
        .unwrap();
    assert!(storage.partition_keys("temp").unwrap().is_empty());
}

#[test]
fn test_clone_series_is_byte_identical() {
    let dir = TempDir::new().unwrap();
    let storage = open(&dir);
    storage
        .create_series(
            SeriesFile::new(
                SeriesDefinition::new("src", NumberType::Curved16, MINUTE, Period::Day)
                    .with_domain(-40.0, 60.0),
            )
            .with_metadata("site", "north"),
        )
        .unwrap();

    let points: Vec<DataPoint> = (0..100)
        .map(|i| DataPoint::new(NOV11 + DAY / 2 + i * MINUTE * 17, (i as f64) * 0.7 - 30.0))
        .collect();
    storage.insert("src", &points).unwrap();

    let clone = storage.clone_series("src", "dst").unwrap();
    assert_eq!(clone.id(), "dst");
    assert_eq!(clone.metadata["site"], "north");
    assert_eq!(clone.definition.min, Some(-40.0));

    let keys = storage.partition_keys("src").unwrap();
    assert_eq!(keys.len(), 2);
    for key in keys {
        let original = fs::read(dir.path().join("src").join(&key.label)).unwrap();
        let copied = fs::read(dir.path().join("dst").join(&key.label)).unwrap();
        assert_eq!(original, copied, "partition {} differs", key.label);
    }

    assert_eq!(
        storage.select_raw("src", NOV11, NOV11 + 2 * DAY).unwrap(),
        storage.select_raw("dst", NOV11, NOV11 + 2 * DAY).unwrap()
    );
    assert!(matches!(
        storage.clone_series("src", "dst"),
        Err(TslabError::SeriesExists(_))
    ));
}

#[test]
fn test_update_metadata_and_list() {
    let dir = TempDir::new().unwrap();
    let storage = open(&dir);
    for id in ["b", "a", "c"] {
        storage
            .create_series(minute_series(id, NumberType::Int8))
            .unwrap();
    }

    let metadata = BTreeMap::from([("owner".to_string(), "ops".to_string())]);
    let updated = storage.update_metadata("b", metadata.clone()).unwrap();
    assert_eq!(updated.metadata, metadata);

    let ids: Vec<String> = storage
        .list_series()
        .unwrap()
        .iter()
        .map(|s| s.id().to_string())
        .collect();
    assert_eq!(ids, vec!["a", "b", "c"]);

    let saved = fs::read_to_string(dir.path().join("b").join("series.json")).unwrap();
    assert!(saved.contains("\"owner\""));
}

#[test]
fn test_archive_round_trip() {
    let dir = TempDir::new().unwrap();
    let storage = open(&dir);
    storage
        .create_series(minute_series("temp", NumberType::Float32))
        .unwrap();
    let points: Vec<DataPoint> = (0..1440)
        .map(|i| DataPoint::new(NOV11 + i * MINUTE, (i % 50) as f64))
        .collect();
    storage.insert("temp", &points).unwrap();

    let key = PartitionKey::new("temp", "20241111");
    let path = dir.path().join("temp").join("20241111");
    let before = fs::read(&path).unwrap();

    storage.archive_partition(&key).unwrap();
    assert!(fs::metadata(&path).unwrap().len() < before.len() as u64);

    // Archived partitions stay readable but reject writes.
    let raw = storage.select_raw("temp", NOV11, NOV11 + DAY).unwrap();
    assert_eq!(raw, points);
    assert!(matches!(
        storage.insert("temp", &[DataPoint::new(NOV11, 1.0)]),
        Err(TslabError::ReadOnlyPartition { .. })
    ));

    storage.unarchive_partition(&key).unwrap();
    assert_eq!(fs::read(&path).unwrap(), before);
    storage.insert("temp", &[DataPoint::new(NOV11, 99.0)]).unwrap();
}

#[test]
fn test_archived_partition_survives_reopen() {
    let dir = TempDir::new().unwrap();
    {
        let storage = open(&dir);
        storage
            .create_series(minute_series("temp", NumberType::Int16))
            .unwrap();
        storage
            .insert("temp", &[DataPoint::new(NOV11 + MINUTE, 12i64)])
            .unwrap();
        storage
            .archive_partition(&PartitionKey::new("temp", "20241111"))
            .unwrap();
        storage.close().unwrap();
    }

    let storage = open(&dir);
    let points = storage.select_raw("temp", NOV11, NOV11 + 2 * MINUTE).unwrap();
    assert_eq!(values(&points), vec![None, Some(12.0)]);
}

#[test]
fn test_archive_before_cutoff() {
    let dir = TempDir::new().unwrap();
    let storage = open(&dir);
    storage
        .create_series(minute_series("temp", NumberType::Int8))
        .unwrap();
    storage
        .insert(
            "temp",
            &[
                DataPoint::new(NOV11, 1i64),
                DataPoint::new(NOV11 + DAY, 2i64),
            ],
        )
        .unwrap();

    let archived = storage.archive_before("temp", NOV11 + DAY).unwrap();
    assert_eq!(archived, vec![PartitionKey::new("temp", "20241111")]);
    assert!(storage.archive_before("temp", NOV11 + DAY).unwrap().is_empty());

    assert!(matches!(
        storage.archive_partition(&PartitionKey::new("temp", "20241120")),
        Err(TslabError::PartitionNotFound { .. })
    ));
}

#[test]
fn test_sweep_idle_closes_then_reopens() {
    let dir = TempDir::new().unwrap();
    let storage = open(&dir);
    storage
        .create_series(minute_series("temp", NumberType::Float64))
        .unwrap();
    storage.insert("temp", &[DataPoint::new(NOV11, 5.0)]).unwrap();

    assert_eq!(storage.sweep_idle().unwrap(), 0);
    assert_eq!(storage.sweep_idle().unwrap(), 1);
    assert_eq!(storage.sweep_idle().unwrap(), 0);

    let points = storage.select_raw("temp", NOV11, NOV11 + MINUTE).unwrap();
    assert_eq!(values(&points), vec![Some(5.0)]);
}

#[test]
fn test_operations_after_close_fail() {
    let dir = TempDir::new().unwrap();
    let storage = open(&dir);
    storage
        .create_series(minute_series("temp", NumberType::Int8))
        .unwrap();

    storage.close().unwrap();
    storage.close().unwrap();
    assert!(matches!(
        storage.insert("temp", &[DataPoint::new(NOV11, 1i64)]),
        Err(TslabError::StorageClosed)
    ));
    assert!(matches!(
        storage.list_series(),
        Err(TslabError::StorageClosed)
    ));
}

#[test]
fn test_build_requires_data_path() {
    assert!(matches!(
        StorageBuilder::new().build(),
        Err(TslabError::InvalidConfiguration(_))
    ));
}
