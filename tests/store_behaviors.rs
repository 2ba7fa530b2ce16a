//! Partition store behaviors: creation races, cache eviction and on-disk validation.

use std::fs;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;
use tempfile::TempDir;
use tslab::catalog::{Catalog, DirCatalog};
use tslab::partition::Partition;
use tslab::range::PartitionRange;
use tslab::store::{PartitionStore, StoreOptions};
use tslab::{Number, NumberType, PartitionKey, Period, SeriesDefinition, SeriesFile, TslabError};

const MINUTE: i64 = 60_000;
const HOUR: i64 = 3_600_000;

fn open_store(dir: &TempDir, options: StoreOptions) -> Arc<PartitionStore> {
    let catalog = Arc::new(DirCatalog::new(dir.path()).unwrap());
    Arc::new(PartitionStore::new(catalog, options).unwrap())
}

fn definition(id: &str) -> SeriesDefinition {
    SeriesDefinition::new(id, NumberType::Int32, MINUTE, Period::Day)
}

#[test]
fn test_creation_race_creates_one_file() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir, StoreOptions::default());
    store.create_series(SeriesFile::new(definition("race"))).unwrap();

    let threads = 16;
    let barrier = Arc::new(Barrier::new(threads));
    let key = PartitionKey::new("race", "20241111");
    let handles: Vec<_> = (0..threads)
        .map(|i| {
            let store = Arc::clone(&store);
            let barrier = Arc::clone(&barrier);
            let key = key.clone();
            thread::spawn(move || {
                barrier.wait();
                let partition = store.get_buffer(&key, None).unwrap();
                partition.set(i, Some(Number::Int(i as i64))).unwrap();
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let entries: Vec<_> = fs::read_dir(dir.path().join("race"))
        .unwrap()
        .map(|e| e.unwrap().file_name().into_string().unwrap())
        .filter(|name| name != "series.json")
        .collect();
    assert_eq!(entries, vec!["20241111".to_string()]);

    let partition = store.get_buffer(&key, None).unwrap();
    for i in 0..threads {
        assert_eq!(partition.get(i).unwrap(), Some(Number::Int(i as i64)));
    }
    assert_eq!(store.partition_keys("race").unwrap(), vec![key]);
}

#[test]
fn test_eviction_closes_partitions() {
    let dir = TempDir::new().unwrap();
    let options = StoreOptions {
        buffer_cache_size: 2,
        ..StoreOptions::default()
    };
    let store = open_store(&dir, options);
    store.create_series(SeriesFile::new(definition("temp"))).unwrap();

    let first = store
        .get_buffer(&PartitionKey::new("temp", "20241111"), None)
        .unwrap();
    first.set(3, Some(Number::Int(33))).unwrap();
    for label in ["20241112", "20241113"] {
        store
            .get_buffer(&PartitionKey::new("temp", label), None)
            .unwrap();
    }

    assert_eq!(store.cached_buffers(), 2);
    assert!(!first.is_open());

    // The evicted file is released: it can be moved away and back.
    let path = dir.path().join("temp").join("20241111");
    let moved = dir.path().join("temp").join("moved");
    fs::rename(&path, &moved).unwrap();
    assert!(!path.exists());
    fs::rename(&moved, &path).unwrap();
    // A closed partition maps itself again on access; nothing was lost.
    assert_eq!(first.get(3).unwrap(), Some(Number::Int(33)));
    let reopened = store
        .find_buffer(&PartitionKey::new("temp", "20241111"))
        .unwrap()
        .unwrap();
    assert_eq!(reopened.get(3).unwrap(), Some(Number::Int(33)));
}

#[test]
fn test_range_cache_expiry_recomputes() {
    let dir = TempDir::new().unwrap();
    let options = StoreOptions {
        range_cache_ttl: Duration::from_millis(1),
        ..StoreOptions::default()
    };
    let store = open_store(&dir, options);
    store.create_series(SeriesFile::new(definition("temp"))).unwrap();

    let key = PartitionKey::new("temp", "20241111");
    let nominal = store.calculate_range(&key).unwrap();
    assert_eq!(nominal.slot_count(), 1440);
    thread::sleep(Duration::from_millis(5));
    assert_eq!(store.calculate_range(&key).unwrap().slot_count(), 1440);
}

#[test]
fn test_existing_file_decides_interval() {
    let dir = TempDir::new().unwrap();
    let def = definition("temp");
    {
        let store = open_store(&dir, StoreOptions::default());
        store.create_series(SeriesFile::new(def.clone())).unwrap();
    }

    // A file written with hourly slots while the definition declares minutes.
    let key = PartitionKey::new("temp", "20241111");
    let hourly = PartitionRange::calculate(&def, &key)
        .unwrap()
        .with_slot_count(24)
        .unwrap();
    let path = dir.path().join("temp").join("20241111");
    let partition = Partition::create(&path, hourly).unwrap();
    partition.set(2, Some(Number::Int(7))).unwrap();
    partition.close().unwrap();

    let store = open_store(&dir, StoreOptions::default());
    let range = store.calculate_range(&key).unwrap();
    assert_eq!(range.slot_count(), 24);
    assert_eq!(range.interval(), HOUR);

    let partition = store.find_buffer(&key).unwrap().unwrap();
    let start = range.start();
    assert_eq!(partition.get_at(start + 2 * HOUR + 59 * MINUTE).unwrap(), Some(Number::Int(7)));
}

#[test]
fn test_corrupt_partition_sizes_are_rejected() {
    let dir = TempDir::new().unwrap();
    {
        let store = open_store(&dir, StoreOptions::default());
        store.create_series(SeriesFile::new(definition("temp"))).unwrap();
    }
    let series_dir = dir.path().join("temp");
    fs::write(series_dir.join("20241111"), [0u8; 7]).unwrap();
    fs::write(series_dir.join("20241112"), []).unwrap();

    let store = open_store(&dir, StoreOptions::default());
    for label in ["20241111", "20241112"] {
        assert!(matches!(
            store.find_buffer(&PartitionKey::new("temp", label)),
            Err(TslabError::CorruptPartition { .. })
        ));
    }
}

#[test]
fn test_plain_partition_starting_like_gzip_stays_plain() {
    let dir = TempDir::new().unwrap();
    let key = PartitionKey::new("temp", "20241111");
    // Slot bytes 1f 8b 08 00 00 00 00 00 00 ff form a complete gzip member header.
    let header = [31i64, -117, 8, 0, 0, 0, 0, 0, 0, -1];
    {
        let store = open_store(&dir, StoreOptions::default());
        let def = SeriesDefinition::new("temp", NumberType::Int8, MINUTE, Period::Day);
        store.create_series(SeriesFile::new(def)).unwrap();
        let partition = store.get_buffer(&key, None).unwrap();
        for (slot, value) in header.iter().enumerate() {
            partition.set(slot, Some(Number::Int(*value))).unwrap();
        }
        store.close_all().unwrap();
    }
    let path = dir.path().join("temp").join("20241111");
    assert_eq!(&fs::read(&path).unwrap()[..2], &[0x1f, 0x8b]);

    let store = open_store(&dir, StoreOptions::default());
    assert_eq!(store.calculate_range(&key).unwrap().slot_count(), 1440);
    let partition = store.find_buffer(&key).unwrap().unwrap();
    assert!(!partition.is_archived());
    for (slot, value) in header.iter().enumerate() {
        assert_eq!(partition.get(slot).unwrap(), Some(Number::Int(*value)));
    }
    assert_eq!(partition.get(1439).unwrap(), None);
    partition.set(1439, Some(Number::Int(5))).unwrap();
    assert_eq!(partition.get(1439).unwrap(), Some(Number::Int(5)));
}

#[test]
fn test_catalog_ignores_foreign_files() {
    let dir = TempDir::new().unwrap();
    let catalog = DirCatalog::new(dir.path()).unwrap();
    catalog.save(&SeriesFile::new(definition("temp"))).unwrap();

    let series_dir = catalog.series_dir("temp");
    fs::write(series_dir.join("notes.txt"), b"hello").unwrap();
    fs::write(series_dir.join("20241111"), [0u8; 4]).unwrap();
    fs::create_dir(dir.path().join("stray")).unwrap();

    let loaded = catalog.load_all().unwrap();
    assert_eq!(loaded.len(), 1);
    assert_eq!(
        catalog.partition_labels(&loaded[0].definition).unwrap(),
        vec!["20241111".to_string()]
    );
}
