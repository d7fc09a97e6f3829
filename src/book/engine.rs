//! Order book reconstruction for one (venue, instrument).
//!
//! Bids and asks are `BTreeMap<Decimal, Decimal>` keyed by price, the
//! full authoritative state from the venue's point of view. Recorded
//! rows truncate to the configured depth, but sequence validation and
//! crossed-book detection run against the full maps.

use std::collections::BTreeMap;

use chrono::Utc;
use rust_decimal::Decimal;

use crate::book::row::{EventType, PriceLevel, RecordedRow};
use crate::domain::{BookError, DepthDelta, DepthSnapshot, InstrumentKey, RawLevel, SyncStatus};

/// Result of applying a delta to a synced book.
#[derive(Debug)]
pub enum ApplyOutcome {
    /// Applied cleanly; the row reflects the new state.
    Applied(RecordedRow),
    /// Applied, but the book is now crossed. The row is flagged and the
    /// engine has moved to `OutOfSync`; the caller must resync.
    Crossed(RecordedRow),
    /// Delta predates the current state, nothing changed.
    Stale,
}

/// Reconstructed book for a single instrument on a single venue.
///
/// Single-writer by construction: the owning venue task is the only
/// mutator, so no interior locking is needed.
pub struct BookEngine {
    key: InstrumentKey,
    depth: usize,
    bids: BTreeMap<Decimal, Decimal>,
    asks: BTreeMap<Decimal, Decimal>,
    last_update_id: u64,
    status: SyncStatus,
}

impl BookEngine {
    pub fn new(key: InstrumentKey, depth: usize) -> Self {
        BookEngine {
            key,
            depth,
            bids: BTreeMap::new(),
            asks: BTreeMap::new(),
            last_update_id: 0,
            status: SyncStatus::Uninitialized,
        }
    }

    pub fn key(&self) -> &InstrumentKey {
        &self.key
    }

    pub fn status(&self) -> SyncStatus {
        self.status
    }

    pub fn last_update_id(&self) -> u64 {
        self.last_update_id
    }

    pub fn best_bid(&self) -> Option<Decimal> {
        self.bids.keys().next_back().copied()
    }

    pub fn best_ask(&self) -> Option<Decimal> {
        self.asks.keys().next().copied()
    }

    /// Mark the book as waiting for a fresh snapshot. State is kept
    /// until the snapshot arrives so the last good row stays queryable.
    pub fn begin_resync(&mut self) {
        self.status = SyncStatus::AwaitingSnapshot;
    }

    /// Replace the book wholesale from an authoritative snapshot.
    ///
    /// Levels are parsed before any state is touched, so a malformed
    /// snapshot leaves the previous book intact.
    pub fn apply_snapshot(&mut self, snapshot: &DepthSnapshot) -> Result<RecordedRow, BookError> {
        let bids = parse_levels(&snapshot.bids)?;
        let asks = parse_levels(&snapshot.asks)?;

        self.bids.clear();
        self.asks.clear();
        for (price, qty) in bids {
            if qty > Decimal::ZERO {
                self.bids.insert(price, qty);
            }
        }
        for (price, qty) in asks {
            if qty > Decimal::ZERO {
                self.asks.insert(price, qty);
            }
        }
        self.last_update_id = snapshot.last_update_id;
        self.status = SyncStatus::Synced;

        let crossed = self.is_crossed();
        if crossed {
            self.status = SyncStatus::OutOfSync;
        }
        Ok(self.derive_row(EventType::Snapshot, crossed))
    }

    /// Apply an incremental delta under the update-id continuity rule.
    ///
    /// A delta whose range has already been covered is `Stale` and
    /// ignored. A delta starting beyond `last_update_id + 1` is a
    /// sequence gap: the book is marked `OutOfSync` and otherwise left
    /// exactly as it was.
    pub fn apply_delta(&mut self, delta: &DepthDelta) -> Result<ApplyOutcome, BookError> {
        if !self.status.is_ready() {
            return Err(BookError::NotSynced);
        }

        let next = self.last_update_id + 1;
        if delta.final_update_id < next {
            return Ok(ApplyOutcome::Stale);
        }
        if delta.first_update_id > next {
            self.status = SyncStatus::OutOfSync;
            return Err(BookError::SequenceGap {
                expected: next,
                actual: delta.first_update_id,
            });
        }

        // Parse first so a malformed level cannot half-apply the delta.
        let bids = parse_levels(&delta.bids)?;
        let asks = parse_levels(&delta.asks)?;

        for (price, qty) in bids {
            if qty == Decimal::ZERO {
                self.bids.remove(&price);
            } else {
                self.bids.insert(price, qty);
            }
        }
        for (price, qty) in asks {
            if qty == Decimal::ZERO {
                self.asks.remove(&price);
            } else {
                self.asks.insert(price, qty);
            }
        }
        self.last_update_id = delta.final_update_id;

        if self.is_crossed() {
            self.status = SyncStatus::OutOfSync;
            return Ok(ApplyOutcome::Crossed(self.derive_row(EventType::Delta, true)));
        }
        Ok(ApplyOutcome::Applied(self.derive_row(EventType::Delta, false)))
    }

    fn is_crossed(&self) -> bool {
        match (self.best_bid(), self.best_ask()) {
            (Some(bid), Some(ask)) => bid >= ask,
            _ => false,
        }
    }

    /// Materialize the current state into a row, recomputing every
    /// derived stat from the live maps.
    fn derive_row(&self, event_type: EventType, crossed: bool) -> RecordedRow {
        let bids: Vec<PriceLevel> = self
            .bids
            .iter()
            .rev()
            .take(self.depth)
            .map(|(p, q)| PriceLevel {
                price: *p,
                quantity: *q,
            })
            .collect();
        let asks: Vec<PriceLevel> = self
            .asks
            .iter()
            .take(self.depth)
            .map(|(p, q)| PriceLevel {
                price: *p,
                quantity: *q,
            })
            .collect();

        let best_bid = bids.first().map(|l| l.price);
        let best_ask = asks.first().map(|l| l.price);
        let best_bid_size = bids.first().map(|l| l.quantity);
        let best_ask_size = asks.first().map(|l| l.quantity);

        let spread = match (best_bid, best_ask) {
            (Some(b), Some(a)) => Some(a - b),
            _ => None,
        };
        let spread_percent = match (spread, best_ask) {
            (Some(s), Some(a)) if !a.is_zero() => Some(s / a * Decimal::ONE_HUNDRED),
            _ => None,
        };
        let mid_price = match (best_bid, best_ask) {
            (Some(b), Some(a)) => Some((b + a) / Decimal::TWO),
            _ => None,
        };

        let total_bid_volume = bids.iter().map(|l| l.quantity).sum();
        let total_ask_volume = asks.iter().map(|l| l.quantity).sum();

        RecordedRow {
            ts: Utc::now(),
            sequence_id: self.last_update_id,
            venue: self.key.venue.clone(),
            instrument: self.key.instrument.clone(),
            event_type,
            crossed,
            bids,
            asks,
            best_bid,
            best_ask,
            best_bid_size,
            best_ask_size,
            spread,
            spread_percent,
            mid_price,
            total_bid_volume,
            total_ask_volume,
        }
    }
}

fn parse_levels(raw: &[RawLevel]) -> Result<Vec<(Decimal, Decimal)>, BookError> {
    raw.iter()
        .map(|[price, qty]| {
            let price = price
                .parse::<Decimal>()
                .map_err(|_| BookError::MalformedLevel(price.clone()))?;
            let qty = qty
                .parse::<Decimal>()
                .map_err(|_| BookError::MalformedLevel(qty.clone()))?;
            Ok((price, qty))
        })
        .collect()
}
