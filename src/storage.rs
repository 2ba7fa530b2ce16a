//! Main storage implementation for tslab.

use crate::catalog::DirCatalog;
use crate::concurrency::{Semaphore, WorkerPool};
use crate::query::{QueryRequest, QueryService, SeriesData};
use crate::series::{PartitionKey, SeriesFile};
use crate::store::{PartitionStore, StoreOptions};
use crate::{DataPoint, Result, TslabError};
use crossbeam_channel::{RecvTimeoutError, Sender, bounded};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};

/// Storage provides thread-safe series management, insertion and bucketed queries.
pub trait Storage: Send + Sync {
    /// Registers a new series and persists its definition.
    fn create_series(&self, file: SeriesFile) -> Result<()>;

    /// Deletes a series with all of its partitions.
    fn delete_series(&self, series_id: &str) -> Result<()>;

    fn series(&self, series_id: &str) -> Result<SeriesFile>;

    /// Every series, sorted by id.
    fn list_series(&self) -> Result<Vec<SeriesFile>>;

    /// Replaces the metadata of a series.
    fn update_metadata(
        &self,
        series_id: &str,
        metadata: BTreeMap<String, String>,
    ) -> Result<SeriesFile>;

    /// Writes points into their partition slots, creating partitions as needed. A null value
    /// clears its slot.
    fn insert(&self, series_id: &str, points: &[DataPoint]) -> Result<()>;

    /// Runs a bucketed query.
    fn find_data(&self, request: &QueryRequest) -> Result<Vec<SeriesData>>;

    /// Raw slots of a series in `[from, to)`.
    fn select_raw(&self, series_id: &str, from: i64, to: i64) -> Result<Vec<DataPoint>>;

    /// Copies a series and its partition files under a new id.
    fn clone_series(&self, source_id: &str, dest_id: &str) -> Result<SeriesFile>;

    /// Keys of the existing partitions of a series, in chronological order.
    fn partition_keys(&self, series_id: &str) -> Result<Vec<PartitionKey>>;

    fn archive_partition(&self, key: &PartitionKey) -> Result<()>;

    fn unarchive_partition(&self, key: &PartitionKey) -> Result<()>;

    /// Archives every partition of a series ending before `cutoff`.
    fn archive_before(&self, series_id: &str, cutoff: i64) -> Result<Vec<PartitionKey>>;

    /// Closes partitions that stayed unused since the previous sweep.
    fn sweep_idle(&self) -> Result<usize>;

    /// Closes the storage gracefully.
    fn close(&self) -> Result<()>;
}

/// Builder for creating a Storage instance.
pub struct StorageBuilder {
    data_path: Option<PathBuf>,
    range_cache_size: usize,
    range_cache_ttl: Duration,
    buffer_cache_size: usize,
    max_query_size: usize,
    workers: usize,
    max_writers: usize,
    write_timeout: Duration,
    idle_sweep_interval: Option<Duration>,
}

impl Default for StorageBuilder {
    fn default() -> Self {
        let store = StoreOptions::default();
        Self {
            data_path: None,
            range_cache_size: store.range_cache_size,
            range_cache_ttl: store.range_cache_ttl,
            buffer_cache_size: store.buffer_cache_size,
            max_query_size: 1000,
            workers: crate::cgroup::default_workers_limit(),
            max_writers: crate::cgroup::default_workers_limit(),
            write_timeout: Duration::from_secs(30),
            idle_sweep_interval: None,
        }
    }
}

impl StorageBuilder {
    /// Creates a new StorageBuilder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the directory holding every series. Required.
    pub fn with_data_path(mut self, path: impl AsRef<Path>) -> Self {
        self.data_path = Some(path.as_ref().to_path_buf());
        self
    }

    /// Sets how many partition ranges are cached, and for how long.
    pub fn with_range_cache(mut self, size: usize, ttl: Duration) -> Self {
        self.range_cache_size = size;
        self.range_cache_ttl = ttl;
        self
    }

    /// Sets how many partitions stay open. Evicted partitions are closed.
    pub fn with_buffer_cache_size(mut self, size: usize) -> Self {
        self.buffer_cache_size = size;
        self
    }

    /// Sets the maximum number of buckets per query.
    pub fn with_max_query_size(mut self, size: usize) -> Self {
        self.max_query_size = size;
        self
    }

    /// Sets the number of decode worker threads.
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Sets the maximum number of concurrent writers.
    pub fn with_max_writers(mut self, max_writers: usize) -> Self {
        self.max_writers = max_writers;
        self
    }

    /// Sets the write timeout.
    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    /// Enables the background idle sweeper.
    pub fn with_idle_sweep_interval(mut self, interval: Duration) -> Self {
        self.idle_sweep_interval = Some(interval);
        self
    }

    /// Builds the Storage instance.
    pub fn build(self) -> Result<Arc<dyn Storage>> {
        let data_path = self.data_path.ok_or_else(|| {
            TslabError::InvalidConfiguration("a data path is required".to_string())
        })?;
        if self.max_query_size == 0 {
            return Err(TslabError::InvalidConfiguration(
                "max query size must be positive".to_string(),
            ));
        }

        // Check file descriptor limits on Unix systems
        #[cfg(unix)]
        {
            let mut rlim = libc::rlimit {
                rlim_cur: 0,
                rlim_max: 0,
            };
            unsafe {
                if libc::getrlimit(libc::RLIMIT_NOFILE, &mut rlim) == 0 {
                    let required_fds = self.buffer_cache_size as libc::rlim_t + 32;
                    if rlim.rlim_cur < required_fds {
                        warn!(
                            "Low file descriptor limit: {}. Consider increasing with 'ulimit -n'",
                            rlim.rlim_cur
                        );
                    }
                }
            }
        }

        let catalog = Arc::new(DirCatalog::new(&data_path)?);
        let store = Arc::new(PartitionStore::new(
            catalog,
            StoreOptions {
                range_cache_size: self.range_cache_size,
                range_cache_ttl: self.range_cache_ttl,
                buffer_cache_size: self.buffer_cache_size,
            },
        )?);
        let pool = Arc::new(WorkerPool::new(self.workers));
        let queries = QueryService::new(Arc::clone(&store), pool.clone(), self.max_query_size);

        let storage = StorageImpl {
            store: Arc::clone(&store),
            queries,
            pool,
            writers: Semaphore::new(self.max_writers),
            write_timeout: self.write_timeout,
            closing: AtomicBool::new(false),
            sweeper: Mutex::new(None),
        };

        if let Some(interval) = self.idle_sweep_interval {
            *storage.sweeper.lock() = Some(Sweeper::start(store, interval)?);
        }

        info!(
            "Opened storage at {} with {} series",
            data_path.display(),
            storage.store.list_series().len()
        );
        Ok(Arc::new(storage))
    }
}

/// Background thread closing idle partitions.
struct Sweeper {
    stop: Sender<()>,
    thread: JoinHandle<()>,
}

impl Sweeper {
    fn start(store: Arc<PartitionStore>, interval: Duration) -> Result<Self> {
        let (stop, stopped) = bounded::<()>(1);
        let thread = thread::Builder::new()
            .name("tslab-sweeper".to_string())
            .spawn(move || {
                loop {
                    match stopped.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => {
                            store.sweep_idle();
                        }
                        // Stop requested, or the storage was dropped.
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                debug!("Idle sweeper stopped");
            })?;
        Ok(Self { stop, thread })
    }

    fn stop(self) {
        let _ = self.stop.send(());
        if self.thread.join().is_err() {
            error!("Idle sweeper panicked");
        }
    }
}

/// Main storage implementation.
struct StorageImpl {
    store: Arc<PartitionStore>,
    queries: QueryService,
    pool: Arc<WorkerPool>,
    writers: Semaphore,
    write_timeout: Duration,
    closing: AtomicBool,
    sweeper: Mutex<Option<Sweeper>>,
}

impl StorageImpl {
    fn ensure_open(&self) -> Result<()> {
        if self.closing.load(Ordering::Acquire) {
            return Err(TslabError::StorageClosed);
        }
        Ok(())
    }

    fn insert_internal(&self, series_id: &str, points: &[DataPoint]) -> Result<()> {
        let period = self.store.definition(series_id)?.period;

        let mut by_partition: BTreeMap<PartitionKey, Vec<DataPoint>> = BTreeMap::new();
        for point in points {
            let key = PartitionKey::of(series_id, period, point.timestamp)?;
            by_partition.entry(key).or_default().push(*point);
        }

        for (key, points) in by_partition {
            self.store.get_buffer(&key, None)?.write_points(&points)?;
        }
        Ok(())
    }
}

impl Storage for StorageImpl {
    fn create_series(&self, file: SeriesFile) -> Result<()> {
        self.ensure_open()?;
        self.store.create_series(file)
    }

    fn delete_series(&self, series_id: &str) -> Result<()> {
        self.ensure_open()?;
        self.store.delete_series(series_id)
    }

    fn series(&self, series_id: &str) -> Result<SeriesFile> {
        self.ensure_open()?;
        self.store.series(series_id)
    }

    fn list_series(&self) -> Result<Vec<SeriesFile>> {
        self.ensure_open()?;
        Ok(self.store.list_series())
    }

    fn update_metadata(
        &self,
        series_id: &str,
        metadata: BTreeMap<String, String>,
    ) -> Result<SeriesFile> {
        self.ensure_open()?;
        self.store.update_metadata(series_id, metadata)
    }

    #[instrument(skip(self, points), fields(points = points.len()))]
    fn insert(&self, series_id: &str, points: &[DataPoint]) -> Result<()> {
        self.ensure_open()?;
        if points.is_empty() {
            return Ok(());
        }

        let _permit = self.writers.try_acquire_for(self.write_timeout)?;
        self.insert_internal(series_id, points)
    }

    fn find_data(&self, request: &QueryRequest) -> Result<Vec<SeriesData>> {
        self.ensure_open()?;
        self.queries.find_data(request)
    }

    fn select_raw(&self, series_id: &str, from: i64, to: i64) -> Result<Vec<DataPoint>> {
        self.ensure_open()?;
        self.queries.select_raw(series_id, from, to)
    }

    fn clone_series(&self, source_id: &str, dest_id: &str) -> Result<SeriesFile> {
        self.ensure_open()?;
        self.store.clone_series(source_id, dest_id)
    }

    fn partition_keys(&self, series_id: &str) -> Result<Vec<PartitionKey>> {
        self.ensure_open()?;
        self.store.partition_keys(series_id)
    }

    fn archive_partition(&self, key: &PartitionKey) -> Result<()> {
        self.ensure_open()?;
        self.store.archive_partition(key)
    }

    fn unarchive_partition(&self, key: &PartitionKey) -> Result<()> {
        self.ensure_open()?;
        self.store.unarchive_partition(key)
    }

    fn archive_before(&self, series_id: &str, cutoff: i64) -> Result<Vec<PartitionKey>> {
        self.ensure_open()?;
        self.store.archive_before(series_id, cutoff)
    }

    fn sweep_idle(&self) -> Result<usize> {
        self.ensure_open()?;
        Ok(self.store.sweep_idle())
    }

    fn close(&self) -> Result<()> {
        if self.closing.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        if let Some(sweeper) = self.sweeper.lock().take() {
            sweeper.stop();
        }
        self.pool.shutdown();
        self.store.close_all()?;

        info!("Storage closed");
        Ok(())
    }
}
