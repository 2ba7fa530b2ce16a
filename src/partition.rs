//! Memory-mapped partition files.
//!
//! A partition is a flat array of fixed-width slots, one per interval of its period. The
//! file is mapped lazily on first access and may be closed again by the idle sweeper; an
//! archived (gzip) partition is served read-only from a decompressed temporary copy.

use crate::archive;
use crate::mmap::PlatformMmap;
use crate::range::PartitionRange;
use crate::{DataPoint, Number, Result, TslabError};
use parking_lot::{
    MappedRwLockReadGuard, RwLock, RwLockReadGuard, RwLockUpgradableReadGuard, RwLockWriteGuard,
};
use std::fmt;
use std::fs::{self, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, instrument};

/// One partition file and its (possibly closed) mapping.
pub struct Partition {
    path: PathBuf,
    range: PartitionRange,
    mapping: RwLock<Option<PlatformMmap>>,
    archived: AtomicBool,
    idle: AtomicBool,
}

impl Partition {
    /// Creates a null-filled partition file of exactly `range.byte_len()` bytes. The file
    /// must not exist yet.
    #[instrument(skip(path, range), fields(key = %range.key()))]
    pub fn create(path: impl AsRef<Path>, range: PartitionRange) -> Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(|e| TslabError::io_at(path, e))?;
        file.set_len(range.byte_len() as u64)
            .map_err(|e| TslabError::io_at(path, e))?;

        let mut mmap = PlatformMmap::read_write(file, range.byte_len())
            .map_err(|e| map_error(path, e))?;
        if let Some(buf) = mmap.as_mut_slice() {
            range.codec().fill_null(buf);
        }
        mmap.flush().map_err(|e| map_error(path, e))?;

        info!(
            "Created partition {} at {:?} ({} slots of {} bytes)",
            range.key(),
            path,
            range.slot_count(),
            range.type_width()
        );

        Ok(Self {
            path: path.to_path_buf(),
            range,
            mapping: RwLock::new(Some(mmap)),
            archived: AtomicBool::new(false),
            idle: AtomicBool::new(false),
        })
    }

    /// Opens an existing partition file without mapping it. The file size decides the
    /// slot count, overriding the nominal one of `range`.
    pub fn open(path: impl AsRef<Path>, range: PartitionRange) -> Result<Self> {
        let path = path.as_ref();
        let (archived, slot_count) = inspect(path, &range)?;
        let range = range.with_slot_count(slot_count)?;
        debug!(
            "Opened partition {} at {:?} (archived: {})",
            range.key(),
            path,
            archived
        );

        Ok(Self {
            path: path.to_path_buf(),
            range,
            mapping: RwLock::new(None),
            archived: AtomicBool::new(archived),
            idle: AtomicBool::new(false),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn range(&self) -> &PartitionRange {
        &self.range
    }

    pub fn slot_count(&self) -> usize {
        self.range.slot_count()
    }

    pub fn index_of(&self, timestamp: i64) -> Option<usize> {
        self.range.index_of(timestamp)
    }

    pub fn timestamp_of(&self, slot: usize) -> i64 {
        self.range.timestamp_of(slot)
    }

    pub fn is_open(&self) -> bool {
        self.mapping.read().is_some()
    }

    pub fn is_archived(&self) -> bool {
        self.archived.load(Ordering::Acquire)
    }

    pub fn is_idle(&self) -> bool {
        self.idle.load(Ordering::Acquire)
    }

    /// Records an access, cancelling a pending idle mark.
    pub fn touch(&self) {
        self.idle.store(false, Ordering::Release);
    }

    fn map(&self) -> Result<PlatformMmap> {
        let expected = self.range.byte_len();
        // Another handle on the same file may have archived or restored it since this one
        // was last mapped.
        let (archived, _) = inspect(&self.path, &self.range)?;
        self.archived.store(archived, Ordering::Release);

        if self.is_archived() {
            let (file, temp_path, len) = archive::decompress_to_temp(&self.path)?;
            if len != expected as u64 {
                return Err(TslabError::CorruptPartition {
                    path: self.path.clone(),
                    details: format!("archive holds {len} bytes, expected {expected}"),
                });
            }
            let mmap = PlatformMmap::read_only(file, expected)
                .map_err(|e| map_error(&self.path, e))?;
            debug!("Mapped archived partition {} read-only", self.range.key());
            return Ok(mmap.with_temp_path(temp_path));
        }

        match OpenOptions::new().read(true).write(true).open(&self.path) {
            Ok(file) => {
                PlatformMmap::read_write(file, expected).map_err(|e| map_error(&self.path, e))
            }
            Err(e) if e.kind() == io::ErrorKind::PermissionDenied => {
                debug!("Partition {:?} is not writable, mapping read-only", self.path);
                let file = fs::File::open(&self.path).map_err(|e| TslabError::io_at(&self.path, e))?;
                PlatformMmap::read_only(file, expected).map_err(|e| map_error(&self.path, e))
            }
            Err(e) => Err(TslabError::io_at(&self.path, e)),
        }
    }

    /// Read access to the mapping, mapping the file first if needed.
    fn mapped(&self) -> Result<MappedRwLockReadGuard<'_, PlatformMmap>> {
        self.touch();

        let guard = self.mapping.read();
        if guard.is_some() {
            return read_mapping(guard, &self.path);
        }
        drop(guard);

        let guard = self.mapping.upgradable_read();
        let guard = if guard.is_some() {
            RwLockUpgradableReadGuard::downgrade(guard)
        } else {
            let mut guard = RwLockUpgradableReadGuard::upgrade(guard);
            *guard = Some(self.map()?);
            RwLockWriteGuard::downgrade(guard)
        };
        read_mapping(guard, &self.path)
    }

    /// Write access to the mapped bytes.
    fn with_writable<R>(&self, f: impl FnOnce(&mut [u8]) -> Result<R>) -> Result<R> {
        self.touch();

        let mut guard = self.mapping.write();
        if guard.is_none() {
            *guard = Some(self.map()?);
        }
        if self.is_archived() {
            return Err(TslabError::ReadOnlyPartition {
                path: self.path.clone(),
            });
        }
        let buf = guard
            .as_mut()
            .and_then(PlatformMmap::as_mut_slice)
            .ok_or_else(|| TslabError::ReadOnlyPartition {
                path: self.path.clone(),
            })?;
        f(buf)
    }

    fn check_slot(&self, slot: usize) -> Result<()> {
        if slot >= self.slot_count() {
            return Err(TslabError::SlotOutOfRange {
                slot,
                slots: self.slot_count(),
            });
        }
        Ok(())
    }

    fn slot_for(&self, timestamp: i64) -> Result<usize> {
        self.index_of(timestamp)
            .ok_or(TslabError::TimestampOutOfRange {
                timestamp,
                start: self.range.start(),
                end: self.range.end(),
            })
    }

    /// Reads `slot`.
    pub fn get(&self, slot: usize) -> Result<Option<Number>> {
        self.check_slot(slot)?;
        let mmap = self.mapped()?;
        Ok(self.range.codec().decode(mmap.as_slice(), slot))
    }

    /// Writes `value` into `slot`.
    pub fn set(&self, slot: usize, value: Option<Number>) -> Result<()> {
        self.check_slot(slot)?;
        let codec = self.range.codec();
        self.with_writable(|buf| {
            codec.encode(buf, slot, value);
            Ok(())
        })
    }

    /// Reads the slot covering `timestamp`.
    pub fn get_at(&self, timestamp: i64) -> Result<Option<Number>> {
        self.get(self.slot_for(timestamp)?)
    }

    /// Writes the slot covering `timestamp`.
    pub fn set_at(&self, timestamp: i64, value: Option<Number>) -> Result<()> {
        self.set(self.slot_for(timestamp)?, value)
    }

    /// Writes a batch of points under a single lock acquisition. Every timestamp must fall
    /// inside this partition; nothing is written otherwise.
    pub fn write_points(&self, points: &[DataPoint]) -> Result<()> {
        let slots = points
            .iter()
            .map(|point| Ok((self.slot_for(point.timestamp)?, point.value)))
            .collect::<Result<Vec<_>>>()?;
        let codec = self.range.codec();
        self.with_writable(|buf| {
            for (slot, value) in slots {
                codec.encode(buf, slot, value);
            }
            Ok(())
        })
    }

    /// Slot bounds of `[from, to]` (inclusive) clipped to this partition.
    fn slot_span(&self, from: i64, to: i64) -> Option<(usize, usize)> {
        let lo = from.max(self.range.start());
        let hi = to.min(self.range.end());
        if lo > hi {
            return None;
        }
        let first = ((lo - self.range.start()) / self.range.interval()) as usize;
        if first >= self.slot_count() {
            return None;
        }
        let last = (((hi - self.range.start()) / self.range.interval()) as usize)
            .min(self.slot_count() - 1);
        Some((first, last))
    }

    /// Decoded values of every slot intersecting `[from, to]` (inclusive), in slot order.
    pub fn select(&self, from: i64, to: i64) -> Result<Vec<Option<Number>>> {
        let Some((first, last)) = self.slot_span(from, to) else {
            return Ok(Vec::new());
        };
        let mmap = self.mapped()?;
        let codec = self.range.codec();
        Ok((first..=last)
            .map(|slot| codec.decode(mmap.as_slice(), slot))
            .collect())
    }

    /// Like [`select`](Self::select), paired with each slot's timestamp.
    pub fn select_points(&self, from: i64, to: i64) -> Result<Vec<DataPoint>> {
        let Some((first, last)) = self.slot_span(from, to) else {
            return Ok(Vec::new());
        };
        let mmap = self.mapped()?;
        let codec = self.range.codec();
        Ok((first..=last)
            .map(|slot| DataPoint {
                timestamp: self.timestamp_of(slot),
                value: codec.decode(mmap.as_slice(), slot),
            })
            .collect())
    }

    /// Flushes dirty pages of an open read-write mapping.
    pub fn flush(&self) -> Result<()> {
        if let Some(mmap) = self.mapping.read().as_ref() {
            mmap.flush().map_err(|e| map_error(&self.path, e))?;
        }
        Ok(())
    }

    /// Flushes and unmaps. The partition maps itself again on the next access.
    pub fn close(&self) -> Result<()> {
        let mut guard = self.mapping.write();
        self.close_locked(&mut guard)
    }

    fn close_locked(&self, guard: &mut Option<PlatformMmap>) -> Result<()> {
        if let Some(mmap) = guard.take() {
            mmap.flush().map_err(|e| map_error(&self.path, e))?;
            debug!("Closed partition {}", self.range.key());
        }
        Ok(())
    }

    /// Idle sweep: the first sweep after an access marks the partition idle, the next one
    /// closes it. Returns true when the mapping was closed.
    pub fn sweep(&self) -> Result<bool> {
        if !self.is_open() {
            return Ok(false);
        }
        if !self.idle.swap(true, Ordering::AcqRel) {
            return Ok(false);
        }

        let mut guard = self.mapping.write();
        // An access between the swap and the lock cancels the close.
        if !self.is_idle() || guard.is_none() {
            return Ok(false);
        }
        self.close_locked(&mut guard)?;
        Ok(true)
    }

    /// Closes the mapping and gzips the file in place. No-op when already archived.
    #[instrument(skip(self), fields(key = %self.range.key()))]
    pub fn archive(&self) -> Result<()> {
        let mut guard = self.mapping.write();
        self.close_locked(&mut guard)?;
        let (archived, _) = inspect(&self.path, &self.range)?;
        self.archived.store(archived, Ordering::Release);
        if archived {
            return Ok(());
        }
        archive::compress_in_place(&self.path)?;
        self.archived.store(true, Ordering::Release);
        Ok(())
    }

    /// Closes the temporary mapping and restores the plain file. No-op when not archived.
    #[instrument(skip(self), fields(key = %self.range.key()))]
    pub fn unarchive(&self) -> Result<()> {
        let mut guard = self.mapping.write();
        self.close_locked(&mut guard)?;
        let (archived, _) = inspect(&self.path, &self.range)?;
        self.archived.store(archived, Ordering::Release);
        if !archived {
            return Ok(());
        }
        archive::decompress_in_place(&self.path)?;
        self.archived.store(false, Ordering::Release);
        Ok(())
    }
}

impl fmt::Debug for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Partition")
            .field("key", self.range.key())
            .field("path", &self.path)
            .field("slots", &self.slot_count())
            .field("open", &self.is_open())
            .field("archived", &self.is_archived())
            .finish()
    }
}

fn read_mapping<'a>(
    guard: RwLockReadGuard<'a, Option<PlatformMmap>>,
    path: &Path,
) -> Result<MappedRwLockReadGuard<'a, PlatformMmap>> {
    RwLockReadGuard::try_map(guard, Option::as_ref).map_err(|_| TslabError::MemoryMap {
        path: path.to_path_buf(),
        details: "partition closed while being mapped".to_string(),
    })
}

fn map_error(path: &Path, err: io::Error) -> TslabError {
    TslabError::MemoryMap {
        path: path.to_path_buf(),
        details: err.to_string(),
    }
}

/// Validates a partition file and returns whether it is archived and how many slots it
/// holds. A file counts as archived only when its gzip trailer describes a slot array that
/// fits `range`'s period; anything else is taken as a plain slot array.
pub fn inspect(path: &Path, range: &PartitionRange) -> Result<(bool, usize)> {
    let corrupt = |details: String| TslabError::CorruptPartition {
        path: path.to_path_buf(),
        details,
    };
    let type_width = range.type_width() as u64;
    let max_len = range.duration() as u64 * type_width;
    let fits = |len: u64| len > 0 && len % type_width == 0 && len <= max_len;

    let archived_len = if archive::is_archived(path)? {
        match archive::uncompressed_len(path) {
            Ok(len) if fits(len) => Some(len),
            Ok(len) => {
                debug!("{:?} has a gzip header but an implausible size {}", path, len);
                None
            }
            Err(TslabError::Compression { .. }) => None,
            Err(e) => return Err(e),
        }
    } else {
        None
    };

    let (archived, len) = match archived_len {
        Some(len) => (true, len),
        None => {
            let len = fs::metadata(path)
                .map_err(|e| TslabError::io_at(path, e))?
                .len();
            (false, len)
        }
    };

    if len == 0 {
        return Err(corrupt("file is empty".to_string()));
    }
    if len % type_width != 0 {
        return Err(corrupt(format!(
            "size {len} is not a multiple of the {type_width}-byte slot width"
        )));
    }
    if len > max_len {
        return Err(corrupt(format!(
            "size {len} holds more slots than the period has milliseconds"
        )));
    }
    Ok((archived, (len / type_width) as usize))
}
