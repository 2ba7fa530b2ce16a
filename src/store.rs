//! Series registry, partition addressing and the partition caches.

use crate::cache::{BufferCache, RangeCache};
use crate::catalog::Catalog;
use crate::partition::{self, Partition};
use crate::range::{PartitionRange, RangeMap};
use crate::series::{PartitionKey, SeriesDefinition, SeriesFile};
use crate::{Result, TslabError};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Cache sizing of a [`PartitionStore`].
#[derive(Debug, Clone)]
pub struct StoreOptions {
    pub range_cache_size: usize,
    pub range_cache_ttl: Duration,
    pub buffer_cache_size: usize,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            range_cache_size: 4096,
            range_cache_ttl: Duration::from_secs(600),
            buffer_cache_size: 256,
        }
    }
}

struct SeriesEntry {
    file: RwLock<SeriesFile>,
    /// Labels of the partition files known to exist.
    partitions: RwLock<BTreeSet<String>>,
}

impl SeriesEntry {
    fn new(file: SeriesFile, labels: impl IntoIterator<Item = String>) -> Arc<Self> {
        Arc::new(Self {
            file: RwLock::new(file),
            partitions: RwLock::new(labels.into_iter().collect()),
        })
    }

    fn definition(&self) -> SeriesDefinition {
        self.file.read().definition.clone()
    }
}

/// Owns every series and hands out partitions by key, creating them on demand.
pub struct PartitionStore {
    catalog: Arc<dyn Catalog>,
    series: DashMap<String, Arc<SeriesEntry>>,
    ranges: RangeCache,
    buffers: BufferCache,
    creation_lock: Mutex<()>,
}

impl PartitionStore {
    /// Opens a store over `catalog`, registering every stored series and its partitions.
    pub fn new(catalog: Arc<dyn Catalog>, options: StoreOptions) -> Result<Self> {
        let series = DashMap::new();
        for file in catalog.load_all()? {
            let labels = catalog.partition_labels(&file.definition)?;
            debug!("Series '{}' has {} partitions", file.id(), labels.len());
            series.insert(file.id().to_string(), SeriesEntry::new(file, labels));
        }

        Ok(Self {
            catalog,
            series,
            ranges: RangeCache::new(options.range_cache_size, options.range_cache_ttl),
            buffers: BufferCache::new(options.buffer_cache_size),
            creation_lock: Mutex::new(()),
        })
    }

    pub fn catalog(&self) -> &Arc<dyn Catalog> {
        &self.catalog
    }

    fn entry(&self, series_id: &str) -> Result<Arc<SeriesEntry>> {
        self.series
            .get(series_id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| TslabError::SeriesNotFound(series_id.to_string()))
    }

    /// Registers and persists a new series.
    #[instrument(skip(self, file), fields(series = %file.id()))]
    pub fn create_series(&self, file: SeriesFile) -> Result<()> {
        file.definition.validate()?;
        match self.series.entry(file.id().to_string()) {
            Entry::Occupied(_) => Err(TslabError::SeriesExists(file.id().to_string())),
            Entry::Vacant(vacant) => {
                self.catalog.save(&file)?;
                info!("Created series '{}'", file.id());
                vacant.insert(SeriesEntry::new(file, []));
                Ok(())
            }
        }
    }

    /// Closes and forgets every partition of a series, then deletes its files.
    #[instrument(skip(self))]
    pub fn delete_series(&self, series_id: &str) -> Result<()> {
        self.series
            .remove(series_id)
            .ok_or_else(|| TslabError::SeriesNotFound(series_id.to_string()))?;

        for partition in self.buffers.remove_series(series_id) {
            if let Err(e) = partition.close() {
                warn!(
                    "Failed to close partition {} of deleted series: {}",
                    partition.range().key(),
                    e
                );
            }
        }
        self.ranges.invalidate_series(series_id);
        self.catalog.remove(series_id)
    }

    pub fn contains_series(&self, series_id: &str) -> bool {
        self.series.contains_key(series_id)
    }

    pub fn series(&self, series_id: &str) -> Result<SeriesFile> {
        Ok(self.entry(series_id)?.file.read().clone())
    }

    pub fn definition(&self, series_id: &str) -> Result<SeriesDefinition> {
        Ok(self.entry(series_id)?.definition())
    }

    /// Every series, sorted by id.
    pub fn list_series(&self) -> Vec<SeriesFile> {
        let mut all: Vec<SeriesFile> = self
            .series
            .iter()
            .map(|entry| entry.value().file.read().clone())
            .collect();
        all.sort_by(|a, b| a.id().cmp(b.id()));
        all
    }

    /// Replaces the metadata of a series and persists it.
    pub fn update_metadata(
        &self,
        series_id: &str,
        metadata: BTreeMap<String, String>,
    ) -> Result<SeriesFile> {
        let entry = self.entry(series_id)?;
        let mut file = entry.file.write();
        let mut updated = file.clone();
        updated.metadata = metadata;
        self.catalog.save(&updated)?;
        *file = updated.clone();
        Ok(updated)
    }

    /// Keys of the existing partitions of a series, in chronological order.
    pub fn partition_keys(&self, series_id: &str) -> Result<Vec<PartitionKey>> {
        let entry = self.entry(series_id)?;
        let labels = entry.partitions.read();
        Ok(labels
            .iter()
            .map(|label| PartitionKey::new(series_id, label.clone()))
            .collect())
    }

    /// Range of `key`. An existing file decides the slot count.
    pub fn calculate_range(&self, key: &PartitionKey) -> Result<PartitionRange> {
        if let Some(range) = self.ranges.get(key) {
            return Ok(range);
        }

        let definition = self.definition(&key.series_id)?;
        let nominal = PartitionRange::calculate(&definition, key)?;
        let path = self.catalog.partition_path(key);
        let range = if path.exists() {
            let (_, slot_count) = partition::inspect(&path, &nominal)?;
            nominal.with_slot_count(slot_count)?
        } else {
            nominal
        };

        self.ranges.insert(range.clone());
        Ok(range)
    }

    /// Returns the partition for `key`, opening or creating it as needed. A new file gets
    /// `required_slot_count` slots when given, the nominal count otherwise.
    pub fn get_buffer(
        &self,
        key: &PartitionKey,
        required_slot_count: Option<usize>,
    ) -> Result<Arc<Partition>> {
        if let Some(partition) = self.buffers.get(key) {
            return Ok(partition);
        }

        // Labels are registered only once their file is complete.
        let entry = self.entry(&key.series_id)?;
        if entry.partitions.read().contains(&key.label) {
            return self.open_existing(&entry, key);
        }

        let _creation = self.creation_lock.lock();
        if let Some(partition) = self.buffers.get(key) {
            return Ok(partition);
        }
        let path = self.catalog.partition_path(key);
        if entry.partitions.read().contains(&key.label) || path.exists() {
            return self.open_existing(&entry, key);
        }

        let mut range = self.calculate_range(key)?;
        if let Some(slot_count) = required_slot_count {
            range = range.with_slot_count(slot_count)?;
        }
        let partition = Arc::new(Partition::create(&path, range)?);

        entry.partitions.write().insert(key.label.clone());
        self.ranges.insert(partition.range().clone());
        Ok(self.buffers.get_or_insert(key.clone(), partition))
    }

    fn open_existing(&self, entry: &SeriesEntry, key: &PartitionKey) -> Result<Arc<Partition>> {
        let range = self.calculate_range(key)?;
        let partition = Arc::new(Partition::open(self.catalog.partition_path(key), range)?);
        entry.partitions.write().insert(key.label.clone());
        Ok(self.buffers.get_or_insert(key.clone(), partition))
    }

    /// Returns the partition for `key` if its file exists, without creating one.
    pub fn find_buffer(&self, key: &PartitionKey) -> Result<Option<Arc<Partition>>> {
        if let Some(partition) = self.buffers.get(key) {
            return Ok(Some(partition));
        }
        let entry = self.entry(&key.series_id)?;
        if !entry.partitions.read().contains(&key.label) {
            return Ok(None);
        }
        self.open_existing(&entry, key).map(Some)
    }

    /// Ordered index of the existing partitions of a series.
    pub fn get_range_map(&self, series_id: &str) -> Result<RangeMap> {
        let mut map = RangeMap::new();
        for key in self.partition_keys(series_id)? {
            map.insert(self.calculate_range(&key)?);
        }
        Ok(map)
    }

    fn cached_partitions(&self, series_id: &str) -> Vec<Arc<Partition>> {
        self.buffers
            .partitions()
            .into_iter()
            .filter(|partition| partition.range().key().series_id == series_id)
            .collect()
    }

    /// Flushes every open partition of a series.
    pub fn flush_series(&self, series_id: &str) -> Result<()> {
        for partition in self.cached_partitions(series_id) {
            partition.flush()?;
        }
        Ok(())
    }

    /// Copies a series under a new id: same definition and metadata, byte-identical
    /// partition files.
    #[instrument(skip(self))]
    pub fn clone_series(&self, source_id: &str, dest_id: &str) -> Result<SeriesFile> {
        let source = self.series(source_id)?;
        if self.contains_series(dest_id) {
            return Err(TslabError::SeriesExists(dest_id.to_string()));
        }
        self.flush_series(source_id)?;

        let mut clone = source.clone();
        clone.definition.id = dest_id.to_string();
        self.create_series(clone.clone())?;

        let dest = self.entry(dest_id)?;
        for key in self.partition_keys(source_id)? {
            let from = self.catalog.partition_path(&key);
            let to = self
                .catalog
                .partition_path(&PartitionKey::new(dest_id, key.label.clone()));
            fs::copy(&from, &to).map_err(|e| TslabError::io_at(&from, e))?;
            dest.partitions.write().insert(key.label);
        }

        info!(
            "Cloned series '{}' to '{}' ({} partitions)",
            source_id,
            dest_id,
            dest.partitions.read().len()
        );
        Ok(clone)
    }

    fn existing_partition(&self, key: &PartitionKey) -> Result<Arc<Partition>> {
        self.find_buffer(key)?
            .ok_or_else(|| TslabError::PartitionNotFound {
                series_id: key.series_id.clone(),
                label: key.label.clone(),
            })
    }

    pub fn archive_partition(&self, key: &PartitionKey) -> Result<()> {
        self.existing_partition(key)?.archive()
    }

    pub fn unarchive_partition(&self, key: &PartitionKey) -> Result<()> {
        self.existing_partition(key)?.unarchive()
    }

    /// Archives every partition of a series that ends before `cutoff`. Returns the keys that
    /// were newly archived.
    pub fn archive_before(&self, series_id: &str, cutoff: i64) -> Result<Vec<PartitionKey>> {
        let mut archived = Vec::new();
        for range in self.get_range_map(series_id)?.iter() {
            if range.end() >= cutoff {
                continue;
            }
            let partition = self.existing_partition(range.key())?;
            if !partition.is_archived() {
                partition.archive()?;
                archived.push(range.key().clone());
            }
        }
        Ok(archived)
    }

    /// Runs one idle pass over the cached partitions. Returns how many were closed.
    pub fn sweep_idle(&self) -> usize {
        let mut closed = 0;
        for partition in self.buffers.partitions() {
            match partition.sweep() {
                Ok(true) => closed += 1,
                Ok(false) => {}
                Err(e) => warn!(
                    "Failed to close idle partition {}: {}",
                    partition.range().key(),
                    e
                ),
            }
        }
        if closed > 0 {
            debug!("Idle sweep closed {} partitions", closed);
        }
        closed
    }

    /// Closes and evicts every cached partition. Every partition is attempted; the first
    /// failure is returned.
    pub fn close_all(&self) -> Result<()> {
        let mut first_error = None;
        for partition in self.buffers.clear() {
            if let Err(e) = partition.close() {
                warn!("Failed to close partition {}: {}", partition.range().key(), e);
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Number of partitions currently cached.
    pub fn cached_buffers(&self) -> usize {
        self.buffers.len()
    }
}
