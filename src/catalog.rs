//! Persistence of series definitions and discovery of partition files.

use crate::series::{PartitionKey, SeriesDefinition, SeriesFile};
use crate::{Result, TslabError};
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

/// Name of the definition file inside each series directory.
pub const SERIES_FILE_NAME: &str = "series.json";

/// Where series definitions live and where their partitions are stored.
pub trait Catalog: Send + Sync {
    /// Loads every stored series.
    fn load_all(&self) -> Result<Vec<SeriesFile>>;

    /// Creates or replaces the stored definition of a series.
    fn save(&self, file: &SeriesFile) -> Result<()>;

    /// Deletes a series with all of its partitions.
    fn remove(&self, series_id: &str) -> Result<()>;

    /// Labels of the partition files that exist for a series, in chronological order.
    fn partition_labels(&self, definition: &SeriesDefinition) -> Result<Vec<String>>;

    /// Directory holding the files of a series.
    fn series_dir(&self, series_id: &str) -> PathBuf;

    /// Location of a partition file.
    fn partition_path(&self, key: &PartitionKey) -> PathBuf {
        self.series_dir(&key.series_id).join(&key.label)
    }
}

/// A catalog laid out on a directory: `<root>/<series_id>/series.json` next to one file
/// per partition, named by its label.
#[derive(Debug, Clone)]
pub struct DirCatalog {
    root: PathBuf,
}

impl DirCatalog {
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).map_err(|e| TslabError::io_at(&root, e))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn load_series(&self, dir: &Path) -> Result<Option<SeriesFile>> {
        let path = dir.join(SERIES_FILE_NAME);
        let file = match File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(TslabError::io_at(&path, e)),
        };

        let series: SeriesFile = match serde_json::from_reader(BufReader::new(file)) {
            Ok(series) => series,
            Err(e) => {
                warn!("Skipping unreadable series file {:?}: {}", path, e);
                return Ok(None);
            }
        };

        let dir_name = dir.file_name().and_then(|name| name.to_str());
        if dir_name != Some(series.id()) {
            warn!(
                "Skipping series '{}' stored under mismatched directory {:?}",
                series.id(),
                dir
            );
            return Ok(None);
        }
        if let Err(e) = series.definition.validate() {
            warn!("Skipping invalid series '{}': {}", series.id(), e);
            return Ok(None);
        }
        Ok(Some(series))
    }
}

impl Catalog for DirCatalog {
    fn load_all(&self) -> Result<Vec<SeriesFile>> {
        let entries = fs::read_dir(&self.root).map_err(|e| TslabError::io_at(&self.root, e))?;

        let mut loaded = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| TslabError::io_at(&self.root, e))?;
            if !entry.path().is_dir() {
                continue;
            }
            if let Some(series) = self.load_series(&entry.path())? {
                loaded.push(series);
            }
        }
        loaded.sort_by(|a, b| a.id().cmp(b.id()));

        info!("Loaded {} series from {:?}", loaded.len(), self.root);
        Ok(loaded)
    }

    fn save(&self, file: &SeriesFile) -> Result<()> {
        let dir = self.series_dir(file.id());
        fs::create_dir_all(&dir).map_err(|e| TslabError::io_at(&dir, e))?;

        let temp = NamedTempFile::new_in(&dir).map_err(|e| TslabError::io_at(&dir, e))?;
        {
            let mut writer = BufWriter::new(temp.as_file());
            serde_json::to_writer_pretty(&mut writer, file)?;
            writer.flush().map_err(|e| TslabError::io_at(temp.path(), e))?;
        }
        let path = dir.join(SERIES_FILE_NAME);
        temp.persist(&path)
            .map_err(|e| TslabError::io_at(&path, e.error))?;

        debug!("Saved series '{}' to {:?}", file.id(), path);
        Ok(())
    }

    fn remove(&self, series_id: &str) -> Result<()> {
        let dir = self.series_dir(series_id);
        match fs::remove_dir_all(&dir) {
            Ok(()) => {
                info!("Removed series '{}' at {:?}", series_id, dir);
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(TslabError::io_at(&dir, e)),
        }
    }

    fn partition_labels(&self, definition: &SeriesDefinition) -> Result<Vec<String>> {
        let dir = self.series_dir(&definition.id);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(TslabError::io_at(&dir, e)),
        };

        let mut labels = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| TslabError::io_at(&dir, e))?;
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if definition.period.parse(&name).is_ok() && entry.path().is_file() {
                labels.push(name);
            }
        }
        // Labels are zero-padded, so lexical order is chronological.
        labels.sort();
        Ok(labels)
    }

    fn series_dir(&self, series_id: &str) -> PathBuf {
        self.root.join(series_id)
    }
}
