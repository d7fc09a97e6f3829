//! Recorded output row: the full state of one book at one point in
//! time, with derived stats precomputed for downstream analysis.

use chrono::{DateTime, Datelike, NaiveDate, Timelike, Utc};
use rust_decimal::Decimal;

use crate::domain::VenueId;

/// One price level in a recorded row, top-of-book first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PriceLevel {
    pub price: Decimal,
    pub quantity: Decimal,
}

/// What produced a row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    Snapshot,
    Delta,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Snapshot => "snapshot",
            EventType::Delta => "delta",
        }
    }
}

/// A fully materialized book observation.
///
/// Derived fields are computed from the live book at emission time, never
/// carried over from a previous row. All of them are `None` when the
/// corresponding side is empty.
#[derive(Debug, Clone)]
pub struct RecordedRow {
    /// Capture time, assigned by the recorder
    pub ts: DateTime<Utc>,
    /// Book sequence after this event was applied
    pub sequence_id: u64,
    pub venue: VenueId,
    pub instrument: String,
    pub event_type: EventType,
    /// Set when best_bid >= best_ask at emission time
    pub crossed: bool,
    /// Best `depth` bid levels, highest price first
    pub bids: Vec<PriceLevel>,
    /// Best `depth` ask levels, lowest price first
    pub asks: Vec<PriceLevel>,
    pub best_bid: Option<Decimal>,
    pub best_ask: Option<Decimal>,
    pub best_bid_size: Option<Decimal>,
    pub best_ask_size: Option<Decimal>,
    pub spread: Option<Decimal>,
    pub spread_percent: Option<Decimal>,
    pub mid_price: Option<Decimal>,
    /// Sum of bid quantities over the recorded levels
    pub total_bid_volume: Decimal,
    /// Sum of ask quantities over the recorded levels
    pub total_ask_volume: Decimal,
}

impl RecordedRow {
    /// Partitioning key: rows land in the file for the hour they were
    /// captured in, regardless of when they are flushed.
    pub fn hour_key(&self) -> (NaiveDate, u32) {
        (self.ts.date_naive(), self.ts.hour())
    }

    /// Filename timestamp component, `YYYY_MM_DD_HH`.
    pub fn hour_label(date: NaiveDate, hour: u32) -> String {
        format!(
            "{:04}_{:02}_{:02}_{:02}",
            date.year(),
            date.month(),
            date.day(),
            hour
        )
    }
}
