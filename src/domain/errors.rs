//! Error types, one enum per layer. Every per-pipeline error is
//! recoverable and contained; only `ConfigError` aborts the process.

use thiserror::Error;

/// Errors from applying events to a reconstructed book.
///
/// `SequenceGap` is guaranteed to leave the book untouched; the caller
/// must trigger a resync. Crossed books are not an `Err` because the
/// mutated state is still recorded, flagged, for forensic replay; see
/// `ApplyOutcome::Crossed`.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum BookError {
    #[error("sequence gap: expected {expected}, got {actual}")]
    SequenceGap { expected: u64, actual: u64 },

    #[error("delta received while book is not synced")]
    NotSynced,

    #[error("malformed price level: {0}")]
    MalformedLevel(String),
}

/// Transport-level errors; all recoverable via reconnect with backoff.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("connection failed: {0}")]
    Connection(String),

    #[error("subscription failed: {0}")]
    Subscribe(String),

    #[error("snapshot request failed: {0}")]
    Snapshot(String),

    #[error("connection closed by remote")]
    ConnectionClosed,

    #[error("no message within the idle window")]
    IdleTimeout,

    #[error("venue has no snapshot endpoint")]
    SnapshotUnsupported,
}

/// Storage faults during batch writes; retried with backoff, then the
/// batch is re-queued or dropped with a loss record.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),

    #[error("parquet error: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),
}

/// Fatal at startup, before any connection is opened.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("no venues enabled in configuration")]
    NoVenuesEnabled,

    #[error("unknown venue '{0}'")]
    UnknownVenue(String),
}
