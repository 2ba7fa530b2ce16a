//! Error types for tslab.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for tslab operations.
pub type Result<T> = std::result::Result<T, TslabError>;

/// Main error type for tslab operations.
#[derive(Error, Debug)]
pub enum TslabError {
    #[error("Unknown number type: {0}")]
    UnknownNumberType(String),

    #[error("Unknown reducer: {0}")]
    UnknownReducer(String),

    #[error("Unknown period: {0}")]
    UnknownPeriod(String),

    #[error("Number type {number_type} requires a finite [min, max] domain with min < max")]
    MissingDomain { number_type: String },

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Invalid partition label '{label}' for period {period}")]
    InvalidLabel { label: String, period: String },

    #[error("Timestamp {0} is outside the supported calendar range")]
    InvalidTimestamp(i64),

    #[error("Invalid time range: start {start} >= end {end}")]
    InvalidTimeRange { start: i64, end: i64 },

    #[error("Series '{0}' does not exist")]
    SeriesNotFound(String),

    #[error("Series '{0}' already exists")]
    SeriesExists(String),

    #[error("Partition {series_id}/{label} does not exist")]
    PartitionNotFound { series_id: String, label: String },

    #[error("Corrupt partition file {path:?}: {details}")]
    CorruptPartition { path: PathBuf, details: String },

    #[error("Cannot write to read-only partition at {path:?}")]
    ReadOnlyPartition { path: PathBuf },

    #[error("Slot {slot} out of range for partition with {slots} slots")]
    SlotOutOfRange { slot: usize, slots: usize },

    #[error("Timestamp {timestamp} outside partition range [{start}, {end}]")]
    TimestampOutOfRange { timestamp: i64, start: i64, end: i64 },

    #[error("Write timeout exceeded after {timeout_ms}ms with {workers} concurrent writers")]
    WriteTimeout { timeout_ms: u64, workers: usize },

    #[error("Storage already closed")]
    StorageClosed,

    #[error("Memory map error at {path:?}: {details}")]
    MemoryMap { path: PathBuf, details: String },

    #[error("Compression error at {path:?}: {details}")]
    Compression { path: PathBuf, details: String },

    #[error("IO error at path {path:?}: {source}")]
    IoWithPath {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid series pattern: {0}")]
    Regex(#[from] regex::Error),

    #[error("Channel send error for {channel}")]
    ChannelSend { channel: String },

    #[error("Channel receive error for {channel}")]
    ChannelReceive { channel: String },

    #[error("Worker task panicked: {0}")]
    TaskPanicked(String),
}

impl TslabError {
    /// Wraps an I/O error with the path it happened on.
    pub(crate) fn io_at(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        TslabError::IoWithPath {
            path: path.into(),
            source,
        }
    }
}

impl<T> From<crossbeam_channel::SendError<T>> for TslabError {
    fn from(err: crossbeam_channel::SendError<T>) -> Self {
        TslabError::ChannelSend {
            channel: format!("{:?}", err),
        }
    }
}

impl From<crossbeam_channel::RecvError> for TslabError {
    fn from(err: crossbeam_channel::RecvError) -> Self {
        TslabError::ChannelReceive {
            channel: format!("{:?}", err),
        }
    }
}
