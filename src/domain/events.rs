use serde::{Deserialize, Serialize};

/// Wire-level price level as most venues ship it: `[price, quantity]`
/// decimal strings. Parsed into `Decimal` at the engine boundary so that
/// malformed input can be rejected before any state is touched.
pub type RawLevel = [String; 2];

/// Full, authoritative book state at a sequence point.
///
/// Field naming follows the Binance REST depth endpoint; other venues
/// construct this struct manually from their own snapshot messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DepthSnapshot {
    #[serde(rename = "lastUpdateId")]
    pub last_update_id: u64,
    pub bids: Vec<RawLevel>,
    pub asks: Vec<RawLevel>,
}

/// Incremental change relative to a known sequence point.
///
/// Binance deltas carry a `[first, final]` update-id range; venues with a
/// scalar sequence number set `first == final`, which reduces the
/// continuity rule to `sequence_id == last + 1`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DepthDelta {
    pub first_update_id: u64,
    pub final_update_id: u64,
    /// Exchange-reported event time in milliseconds, informational only;
    /// recorded rows carry capture time.
    pub event_time: i64,
    pub bids: Vec<RawLevel>,
    pub asks: Vec<RawLevel>,
}

impl DepthDelta {
    /// Delta for a venue with a single scalar sequence number.
    pub fn with_sequence(
        sequence_id: u64,
        event_time: i64,
        bids: Vec<RawLevel>,
        asks: Vec<RawLevel>,
    ) -> Self {
        DepthDelta {
            first_update_id: sequence_id,
            final_update_id: sequence_id,
            event_time,
            bids,
            asks,
        }
    }
}

pub fn level(price: &str, quantity: &str) -> RawLevel {
    [price.to_string(), quantity.to_string()]
}
