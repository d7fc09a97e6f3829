//! Bounded staging buffer between a book pipeline and the writer.
//!
//! Drop-oldest under pressure: recording must never exert backpressure
//! on ingestion, so when the buffer is full the oldest rows give way and
//! the loss is counted.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::book::RecordedRow;

pub struct RecordBuffer {
    rows: Mutex<VecDeque<RecordedRow>>,
    capacity: usize,
    rows_lost: AtomicU64,
}

impl RecordBuffer {
    pub fn new(capacity: usize) -> Self {
        RecordBuffer {
            rows: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            rows_lost: AtomicU64::new(0),
        }
    }

    /// Append a row, evicting the oldest if at capacity.
    pub fn push(&self, row: RecordedRow) {
        let mut rows = self.rows.lock();
        if rows.len() >= self.capacity {
            rows.pop_front();
            self.rows_lost.fetch_add(1, Ordering::Relaxed);
        }
        rows.push_back(row);
    }

    /// Take up to `max` rows in arrival order.
    pub fn drain(&self, max: usize) -> Vec<RecordedRow> {
        let mut rows = self.rows.lock();
        let n = max.min(rows.len());
        rows.drain(..n).collect()
    }

    /// Put rows back at the front after a failed write, preserving
    /// order. If the batch no longer fits, its oldest rows are dropped
    /// and counted lost, matching the eviction policy of `push`.
    pub fn requeue_front(&self, batch: Vec<RecordedRow>) {
        let mut rows = self.rows.lock();
        let room = self.capacity.saturating_sub(rows.len());
        let overflow = batch.len().saturating_sub(room);
        if overflow > 0 {
            self.rows_lost.fetch_add(overflow as u64, Ordering::Relaxed);
        }
        for row in batch.into_iter().skip(overflow).rev() {
            rows.push_front(row);
        }
    }

    pub fn len(&self) -> usize {
        self.rows.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Rows dropped so far, from eviction or failed requeue.
    pub fn rows_lost(&self) -> u64 {
        self.rows_lost.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::book::EventType;
    use crate::domain::VenueId;
    use chrono::Utc;
    use rust_decimal::Decimal;

    fn row(sequence_id: u64) -> RecordedRow {
        RecordedRow {
            ts: Utc::now(),
            sequence_id,
            venue: VenueId::binance_spot(),
            instrument: "BTCUSDT".to_string(),
            event_type: EventType::Delta,
            crossed: false,
            bids: vec![],
            asks: vec![],
            best_bid: None,
            best_ask: None,
            best_bid_size: None,
            best_ask_size: None,
            spread: None,
            spread_percent: None,
            mid_price: None,
            total_bid_volume: Decimal::ZERO,
            total_ask_volume: Decimal::ZERO,
        }
    }

    #[test]
    fn test_push_and_drain_in_order() {
        let buf = RecordBuffer::new(10);
        for i in 0..5 {
            buf.push(row(i));
        }
        let drained = buf.drain(3);
        assert_eq!(
            drained.iter().map(|r| r.sequence_id).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );
        assert_eq!(buf.len(), 2);
    }

    #[test]
    fn test_drop_oldest_when_full() {
        let buf = RecordBuffer::new(3);
        for i in 0..5 {
            buf.push(row(i));
        }
        assert_eq!(buf.len(), 3);
        assert_eq!(buf.rows_lost(), 2);
        let drained = buf.drain(10);
        assert_eq!(
            drained.iter().map(|r| r.sequence_id).collect::<Vec<_>>(),
            vec![2, 3, 4]
        );
    }

    #[test]
    fn test_requeue_preserves_order() {
        let buf = RecordBuffer::new(10);
        buf.push(row(3));
        buf.requeue_front(vec![row(1), row(2)]);
        let drained = buf.drain(10);
        assert_eq!(
            drained.iter().map(|r| r.sequence_id).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
        assert_eq!(buf.rows_lost(), 0);
    }

    #[test]
    fn test_requeue_overflow_drops_oldest() {
        let buf = RecordBuffer::new(3);
        buf.push(row(10));
        buf.push(row(11));
        buf.requeue_front(vec![row(1), row(2), row(3)]);
        assert_eq!(buf.len(), 3);
        assert_eq!(buf.rows_lost(), 2);
        // the batch's oldest rows (1, 2) give way; the newest survives
        let drained = buf.drain(10);
        assert_eq!(
            drained.iter().map(|r| r.sequence_id).collect::<Vec<_>>(),
            vec![3, 10, 11]
        );
    }
}
