//! Parquet persistence task.
//!
//! One writer task serves every pipeline. Each sink drains on its own
//! flush interval; drained rows are grouped by the hour of their
//! capture timestamp and appended to the matching partition file.
//! Parquet files cannot be appended after close, so a partition's
//! `ArrowWriter` stays open for the whole hour and is finalized when the
//! hour rolls over (or at shutdown).

use std::collections::HashMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::NaiveDate;
use parquet::arrow::ArrowWriter;
use parquet::basic::{Compression, ZstdLevel};
use parquet::file::properties::WriterProperties;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::book::RecordedRow;
use crate::config::StorageConfig;
use crate::domain::{InstrumentKey, StorageError};
use crate::recorder::buffer::RecordBuffer;
use crate::recorder::schema::rows_to_batch;
use crate::telemetry::PipelineStats;

const WRITE_RETRIES: u32 = 3;
const DRAIN_CHUNK: usize = 10_000;

/// One pipeline's connection to the writer.
pub struct SinkConfig {
    pub key: InstrumentKey,
    pub buffer: std::sync::Arc<RecordBuffer>,
    pub stats: std::sync::Arc<PipelineStats>,
    pub flush_interval: Duration,
}

struct Sink {
    key: InstrumentKey,
    buffer: std::sync::Arc<RecordBuffer>,
    stats: std::sync::Arc<PipelineStats>,
    flush_interval: Duration,
    next_flush: Instant,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct PartitionKey {
    venue: String,
    instrument: String,
    date: NaiveDate,
    hour: u32,
}

struct OpenPartition {
    writer: ArrowWriter<File>,
    rows_written: usize,
    path: PathBuf,
    /// Rotation counter within the hour, bumped at max_records_per_file
    part: usize,
}

pub struct PersistenceWriter {
    base_dir: PathBuf,
    storage: StorageConfig,
    sinks: Vec<Sink>,
    partitions: HashMap<PartitionKey, OpenPartition>,
}

impl PersistenceWriter {
    pub fn new(base_dir: PathBuf, storage: StorageConfig, sinks: Vec<SinkConfig>) -> Self {
        let now = Instant::now();
        let sinks = sinks
            .into_iter()
            .map(|s| Sink {
                next_flush: now + s.flush_interval,
                key: s.key,
                buffer: s.buffer,
                stats: s.stats,
                flush_interval: s.flush_interval,
            })
            .collect();
        PersistenceWriter {
            base_dir,
            storage,
            sinks,
            partitions: HashMap::new(),
        }
    }

    /// Run until cancelled, then flush everything and close all files.
    pub async fn run(mut self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(Duration::from_millis(500));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.flush_due().await;
                    self.close_stale_partitions();
                }
            }
        }

        info!("writer shutting down, final flush");
        self.flush_all().await;
        self.close_all();
    }

    /// Flush every sink whose interval has elapsed, plus any buffer
    /// filling up faster than its schedule drains it.
    pub async fn flush_due(&mut self) {
        let now = Instant::now();
        for i in 0..self.sinks.len() {
            let nearly_full =
                self.sinks[i].buffer.len() * 2 >= self.sinks[i].buffer.capacity();
            if self.sinks[i].next_flush <= now || nearly_full {
                self.flush_sink(i).await;
                let interval = self.sinks[i].flush_interval;
                self.sinks[i].next_flush = Instant::now() + interval;
            }
        }
    }

    /// Drain and persist every sink regardless of schedule.
    pub async fn flush_all(&mut self) {
        for i in 0..self.sinks.len() {
            self.flush_sink(i).await;
        }
    }

    async fn flush_sink(&mut self, idx: usize) {
        loop {
            let rows = self.sinks[idx].buffer.drain(DRAIN_CHUNK);
            if rows.is_empty() {
                return;
            }
            let count = rows.len();
            match self.write_rows(rows).await {
                Ok(()) => {
                    self.sinks[idx].stats.record_rows_written(count as u64);
                    debug!(pipeline = %self.sinks[idx].key, rows = count, "flushed");
                }
                Err((rows, err)) => {
                    error!(
                        pipeline = %self.sinks[idx].key,
                        error = %err,
                        rows = rows.len(),
                        "write failed after retries, re-queueing batch"
                    );
                    self.sinks[idx].buffer.requeue_front(rows);
                    return;
                }
            }
            if count < DRAIN_CHUNK {
                return;
            }
        }
    }

    /// Write one drained batch, split by hour partition. On failure the
    /// unwritten remainder is handed back for re-queueing.
    async fn write_rows(
        &mut self,
        rows: Vec<RecordedRow>,
    ) -> Result<(), (Vec<RecordedRow>, StorageError)> {
        // rows arrive in capture order, so hour groups are contiguous
        let mut groups: Vec<(PartitionKey, Vec<RecordedRow>)> = Vec::new();
        for row in rows {
            let (date, hour) = row.hour_key();
            let key = PartitionKey {
                venue: row.venue.as_str().to_string(),
                instrument: row.instrument.clone(),
                date,
                hour,
            };
            match groups.last_mut() {
                Some((k, group)) if *k == key => group.push(row),
                _ => groups.push((key, vec![row])),
            }
        }

        for gi in 0..groups.len() {
            let key = groups[gi].0.clone();
            let result = self.write_group(&key, &groups[gi].1).await;
            if let Err(err) = result {
                let remainder: Vec<RecordedRow> = groups
                    .split_off(gi)
                    .into_iter()
                    .flat_map(|(_, g)| g)
                    .collect();
                return Err((remainder, err));
            }
        }
        Ok(())
    }

    async fn write_group(
        &mut self,
        key: &PartitionKey,
        rows: &[RecordedRow],
    ) -> Result<(), StorageError> {
        let mut attempt = 0;
        loop {
            match self.try_write_group(key, rows) {
                Ok(()) => return Ok(()),
                Err(err) => {
                    attempt += 1;
                    if attempt >= WRITE_RETRIES {
                        return Err(err);
                    }
                    warn!(
                        venue = %key.venue,
                        instrument = %key.instrument,
                        attempt,
                        error = %err,
                        "write failed, retrying"
                    );
                    // a failed writer may hold a poisoned file handle;
                    // close it so rows already written keep their footer
                    if let Some(p) = self.partitions.remove(key) {
                        self.close_and_account(key, p);
                    }
                    tokio::time::sleep(Duration::from_millis(250 * attempt as u64)).await;
                }
            }
        }
    }

    fn try_write_group(
        &mut self,
        key: &PartitionKey,
        rows: &[RecordedRow],
    ) -> Result<(), StorageError> {
        let batch = rows_to_batch(rows)?;

        if !self.partitions.contains_key(key) {
            let partition = self.open_partition(key, 0)?;
            self.partitions.insert(key.clone(), partition);
        }
        // rotate early when the file is full
        let rotate = {
            let p = &self.partitions[key];
            p.rows_written + rows.len() > self.storage.max_records_per_file && p.rows_written > 0
        };
        if rotate {
            if let Some(p) = self.partitions.remove(key) {
                let next_part = p.part + 1;
                self.close_and_account(key, p);
                let partition = self.open_partition(key, next_part)?;
                self.partitions.insert(key.clone(), partition);
            }
        }

        let partition = self
            .partitions
            .get_mut(key)
            .ok_or_else(|| StorageError::Io(std::io::Error::other("partition vanished")))?;
        partition.writer.write(&batch)?;
        partition.writer.flush()?;
        partition.rows_written += rows.len();
        Ok(())
    }

    fn open_partition(
        &self,
        key: &PartitionKey,
        part: usize,
    ) -> Result<OpenPartition, StorageError> {
        let dir = self.base_dir.join(&key.venue).join(&key.instrument);
        std::fs::create_dir_all(&dir)?;
        let (path, part) = next_free_path(&dir, key, part);

        let file = File::create(&path)?;
        let props = WriterProperties::builder()
            .set_compression(compression_from_config(&self.storage.compression))
            .build();
        let writer = ArrowWriter::try_new(file, crate::recorder::schema::row_schema(), Some(props))?;

        info!(path = %path.display(), "opened partition file");
        Ok(OpenPartition {
            writer,
            rows_written: 0,
            path,
            part,
        })
    }

    /// Close partitions whose hour has passed for every open book.
    fn close_stale_partitions(&mut self) {
        let now = chrono::Utc::now();
        let current = (now.date_naive(), chrono::Timelike::hour(&now));
        let stale: Vec<PartitionKey> = self
            .partitions
            .keys()
            .filter(|k| (k.date, k.hour) < current)
            .cloned()
            .collect();
        for key in stale {
            if let Some(p) = self.partitions.remove(&key) {
                self.close_and_account(&key, p);
            }
        }
    }

    pub fn close_all(&mut self) {
        let keys: Vec<PartitionKey> = self.partitions.keys().cloned().collect();
        for key in keys {
            if let Some(p) = self.partitions.remove(&key) {
                self.close_and_account(&key, p);
            }
        }
    }

    pub fn open_partition_count(&self) -> usize {
        self.partitions.len()
    }

    /// Finalize a partition file. A file whose footer never lands is
    /// unreadable, so its rows count as lost on the owning pipeline.
    fn close_and_account(&self, key: &PartitionKey, p: OpenPartition) {
        let lost = close_partition(p);
        if lost > 0 {
            if let Some(sink) = self
                .sinks
                .iter()
                .find(|s| s.key.venue.as_str() == key.venue && s.key.instrument == key.instrument)
            {
                sink.stats.record_write_lost(lost);
            }
        }
    }
}

/// Returns the number of rows lost if the footer could not be written.
fn close_partition(p: OpenPartition) -> u64 {
    match p.writer.close() {
        Ok(_) => {
            info!(path = %p.path.display(), rows = p.rows_written, "closed partition file");
            0
        }
        Err(err) => {
            error!(path = %p.path.display(), error = %err, "failed to close partition");
            p.rows_written as u64
        }
    }
}

/// First filename for this partition that does not exist yet. A restart
/// within the same hour lands on the next numeric part.
fn next_free_path(dir: &Path, key: &PartitionKey, start_part: usize) -> (PathBuf, usize) {
    let label = RecordedRow::hour_label(key.date, key.hour);
    let mut part = start_part;
    loop {
        let name = if part == 0 {
            format!(
                "{}_orderbook_{}_{}.parquet",
                key.venue, key.instrument, label
            )
        } else {
            format!(
                "{}_orderbook_{}_{}_{}.parquet",
                key.venue, key.instrument, label, part
            )
        };
        let path = dir.join(name);
        if !path.exists() {
            return (path, part);
        }
        part += 1;
    }
}

fn compression_from_config(name: &str) -> Compression {
    match name.to_ascii_lowercase().as_str() {
        "none" | "uncompressed" => Compression::UNCOMPRESSED,
        "zstd" => Compression::ZSTD(ZstdLevel::default()),
        // snappy is the default and the fallback
        _ => Compression::SNAPPY,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::book::{EventType, PriceLevel};
    use crate::domain::VenueId;
    use chrono::{TimeZone, Utc};
    use rust_decimal_macros::dec;
    use std::sync::Arc;

    fn row_at(hour: u32, sequence_id: u64) -> RecordedRow {
        RecordedRow {
            ts: Utc.with_ymd_and_hms(2024, 3, 15, hour, 30, 0).unwrap(),
            sequence_id,
            venue: VenueId::binance_spot(),
            instrument: "BTCUSDT".to_string(),
            event_type: EventType::Delta,
            crossed: false,
            bids: vec![PriceLevel {
                price: dec!(100.0),
                quantity: dec!(1.0),
            }],
            asks: vec![PriceLevel {
                price: dec!(100.5),
                quantity: dec!(1.0),
            }],
            best_bid: Some(dec!(100.0)),
            best_ask: Some(dec!(100.5)),
            best_bid_size: Some(dec!(1.0)),
            best_ask_size: Some(dec!(1.0)),
            spread: Some(dec!(0.5)),
            spread_percent: None,
            mid_price: Some(dec!(100.25)),
            total_bid_volume: dec!(1.0),
            total_ask_volume: dec!(1.0),
        }
    }

    fn writer_with_sink(
        dir: &Path,
        buffer: Arc<RecordBuffer>,
        max_records: usize,
    ) -> PersistenceWriter {
        let storage = StorageConfig {
            compression: "snappy".to_string(),
            max_records_per_file: max_records,
        };
        PersistenceWriter::new(
            dir.to_path_buf(),
            storage,
            vec![SinkConfig {
                key: InstrumentKey::new("binance_spot", "BTCUSDT"),
                buffer,
                stats: Arc::new(PipelineStats::default()),
                flush_interval: Duration::from_secs(1),
            }],
        )
    }

    #[tokio::test]
    async fn test_rows_partitioned_by_capture_hour() {
        let dir = tempfile::tempdir().unwrap();
        let buffer = Arc::new(RecordBuffer::new(100));
        buffer.push(row_at(13, 1));
        buffer.push(row_at(13, 2));
        buffer.push(row_at(14, 3));

        let mut writer = writer_with_sink(dir.path(), buffer, 100_000);
        writer.flush_all().await;
        assert_eq!(writer.open_partition_count(), 2);
        writer.close_all();

        let base = dir.path().join("binance_spot").join("BTCUSDT");
        assert!(
            base.join("binance_spot_orderbook_BTCUSDT_2024_03_15_13.parquet")
                .exists()
        );
        assert!(
            base.join("binance_spot_orderbook_BTCUSDT_2024_03_15_14.parquet")
                .exists()
        );
    }

    #[tokio::test]
    async fn test_rotation_at_max_records() {
        let dir = tempfile::tempdir().unwrap();
        let buffer = Arc::new(RecordBuffer::new(100));
        let mut writer = writer_with_sink(dir.path(), buffer.clone(), 2);

        for i in 0..2 {
            buffer.push(row_at(13, i));
        }
        writer.flush_all().await;
        for i in 2..4 {
            buffer.push(row_at(13, i));
        }
        writer.flush_all().await;
        writer.close_all();

        let base = dir.path().join("binance_spot").join("BTCUSDT");
        assert!(
            base.join("binance_spot_orderbook_BTCUSDT_2024_03_15_13.parquet")
                .exists()
        );
        assert!(
            base.join("binance_spot_orderbook_BTCUSDT_2024_03_15_13_1.parquet")
                .exists()
        );
    }

    #[tokio::test]
    async fn test_partition_replaced_mid_hour_stays_readable() {
        use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;

        let dir = tempfile::tempdir().unwrap();
        let buffer = Arc::new(RecordBuffer::new(100));
        let mut writer = writer_with_sink(dir.path(), buffer.clone(), 2);

        // first file fills up and is swapped out while the hour is
        // still live; its rows must survive with a valid footer
        for i in 0..2 {
            buffer.push(row_at(13, i));
        }
        writer.flush_all().await;
        for i in 2..4 {
            buffer.push(row_at(13, i));
        }
        writer.flush_all().await;

        let base = dir.path().join("binance_spot").join("BTCUSDT");
        let first = File::open(
            base.join("binance_spot_orderbook_BTCUSDT_2024_03_15_13.parquet"),
        )
        .unwrap();
        let reader = ParquetRecordBatchReaderBuilder::try_new(first)
            .unwrap()
            .build()
            .unwrap();
        let rows: usize = reader.map(|b| b.unwrap().num_rows()).sum();
        assert_eq!(rows, 2);
        writer.close_all();
    }

    #[tokio::test]
    async fn test_restart_collision_gets_part_suffix() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("binance_spot").join("BTCUSDT");
        std::fs::create_dir_all(&base).unwrap();
        std::fs::write(
            base.join("binance_spot_orderbook_BTCUSDT_2024_03_15_13.parquet"),
            b"existing",
        )
        .unwrap();

        let buffer = Arc::new(RecordBuffer::new(100));
        buffer.push(row_at(13, 1));
        let mut writer = writer_with_sink(dir.path(), buffer, 100_000);
        writer.flush_all().await;
        writer.close_all();

        assert!(
            base.join("binance_spot_orderbook_BTCUSDT_2024_03_15_13_1.parquet")
                .exists()
        );
    }
}
