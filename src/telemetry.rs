//! Per-pipeline counters and the periodic stats report.
//!
//! Counters are plain atomics bumped from the venue and writer tasks;
//! the reporter task snapshots them on an interval and logs one line per
//! pipeline plus a process-wide total.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::domain::InstrumentKey;
use crate::recorder::RecordBuffer;

/// Lock-free counters for one (venue, instrument) pipeline.
#[derive(Debug, Default)]
pub struct PipelineStats {
    /// Book events applied (snapshots and deltas)
    pub messages: AtomicU64,
    /// Transport reconnects affecting this pipeline
    pub reconnects: AtomicU64,
    /// Resyncs triggered by gaps, crossed books or reconnects
    pub resyncs: AtomicU64,
    /// Rows persisted to parquet
    pub rows_written: AtomicU64,
    /// Deltas discarded because the resync buffer was full
    pub pending_dropped: AtomicU64,
    /// Rows made unreadable by a partition file that failed to close
    pub write_lost: AtomicU64,
    /// Unix millis of the last event seen
    pub last_seen_ms: AtomicU64,
}

impl PipelineStats {
    pub fn record_message(&self) {
        self.messages.fetch_add(1, Ordering::Relaxed);
        self.last_seen_ms
            .store(chrono::Utc::now().timestamp_millis() as u64, Ordering::Relaxed);
    }

    pub fn record_reconnect(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_resync(&self) {
        self.resyncs.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rows_written(&self, n: u64) {
        self.rows_written.fetch_add(n, Ordering::Relaxed);
    }

    pub fn record_pending_dropped(&self, n: u64) {
        self.pending_dropped.fetch_add(n, Ordering::Relaxed);
    }

    pub fn record_write_lost(&self, n: u64) {
        self.write_lost.fetch_add(n, Ordering::Relaxed);
    }
}

/// Point-in-time view of one pipeline, for logging and tests.
#[derive(Debug, Clone)]
pub struct PipelineTelemetry {
    pub key: InstrumentKey,
    pub messages: u64,
    pub reconnects: u64,
    pub resyncs: u64,
    pub rows_written: u64,
    pub rows_lost: u64,
    pub pending_dropped: u64,
    pub buffered: usize,
}

struct Entry {
    key: InstrumentKey,
    stats: Arc<PipelineStats>,
    buffer: Arc<RecordBuffer>,
}

/// Registry of all live pipelines, read by the reporter task.
#[derive(Default)]
pub struct TelemetryRegistry {
    entries: RwLock<Vec<Entry>>,
}

impl TelemetryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &self,
        key: InstrumentKey,
        stats: Arc<PipelineStats>,
        buffer: Arc<RecordBuffer>,
    ) {
        self.entries.write().push(Entry { key, stats, buffer });
    }

    pub fn snapshot(&self) -> Vec<PipelineTelemetry> {
        self.entries
            .read()
            .iter()
            .map(|e| PipelineTelemetry {
                key: e.key.clone(),
                messages: e.stats.messages.load(Ordering::Relaxed),
                reconnects: e.stats.reconnects.load(Ordering::Relaxed),
                resyncs: e.stats.resyncs.load(Ordering::Relaxed),
                rows_written: e.stats.rows_written.load(Ordering::Relaxed),
                rows_lost: e.buffer.rows_lost() + e.stats.write_lost.load(Ordering::Relaxed),
                pending_dropped: e.stats.pending_dropped.load(Ordering::Relaxed),
                buffered: e.buffer.len(),
            })
            .collect()
    }
}

/// Periodic stats reporter; runs until cancelled.
pub async fn run_reporter(
    registry: Arc<TelemetryRegistry>,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    // skip the immediate first tick
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => report(&registry),
        }
    }
}

fn report(registry: &TelemetryRegistry) {
    let snapshot = registry.snapshot();
    let mut total_messages = 0u64;
    let mut total_rows = 0u64;
    let mut total_lost = 0u64;

    for p in &snapshot {
        info!(
            pipeline = %p.key,
            messages = p.messages,
            rows_written = p.rows_written,
            buffered = p.buffered,
            reconnects = p.reconnects,
            resyncs = p.resyncs,
            "pipeline stats"
        );
        if p.rows_lost > 0 || p.pending_dropped > 0 {
            warn!(
                pipeline = %p.key,
                rows_lost = p.rows_lost,
                pending_dropped = p.pending_dropped,
                "data loss counters nonzero"
            );
        }
        total_messages += p.messages;
        total_rows += p.rows_written;
        total_lost += p.rows_lost + p.pending_dropped;
    }

    info!(
        pipelines = snapshot.len(),
        messages = total_messages,
        rows_written = total_rows,
        rows_lost = total_lost,
        "recorder totals"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_snapshot() {
        let registry = TelemetryRegistry::new();
        let stats = Arc::new(PipelineStats::default());
        let buffer = Arc::new(RecordBuffer::new(10));
        registry.register(
            InstrumentKey::new("binance_spot", "BTCUSDT"),
            stats.clone(),
            buffer,
        );

        stats.record_message();
        stats.record_message();
        stats.record_rows_written(5);
        stats.record_resync();

        let snap = registry.snapshot();
        assert_eq!(snap.len(), 1);
        assert_eq!(snap[0].messages, 2);
        assert_eq!(snap[0].rows_written, 5);
        assert_eq!(snap[0].resyncs, 1);
        assert_eq!(snap[0].rows_lost, 0);
    }

    #[test]
    fn test_rows_lost_includes_failed_closes() {
        let registry = TelemetryRegistry::new();
        let stats = Arc::new(PipelineStats::default());
        let buffer = Arc::new(RecordBuffer::new(10));
        registry.register(
            InstrumentKey::new("binance_spot", "BTCUSDT"),
            stats.clone(),
            buffer,
        );

        stats.record_write_lost(4);
        assert_eq!(registry.snapshot()[0].rows_lost, 4);
    }
}
