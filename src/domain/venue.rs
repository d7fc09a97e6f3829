use std::fmt;

use serde::{Deserialize, Serialize};

/// Unique identifier for a market data venue
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VenueId(String);

impl VenueId {
    pub fn new(id: impl Into<String>) -> Self {
        VenueId(id.into().to_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for VenueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for VenueId {
    fn from(s: &str) -> Self {
        VenueId::new(s)
    }
}

impl From<String> for VenueId {
    fn from(s: String) -> Self {
        VenueId::new(s)
    }
}

/// Well-known venue identifiers
impl VenueId {
    pub fn binance_spot() -> Self {
        VenueId::new("binance_spot")
    }

    pub fn binance_futures() -> Self {
        VenueId::new("binance_futures")
    }

    pub fn lighter() -> Self {
        VenueId::new("lighter")
    }
}

/// An instrument qualified with its venue.
/// One recording pipeline exists per key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstrumentKey {
    pub venue: VenueId,
    pub instrument: String,
}

impl InstrumentKey {
    pub fn new(venue: impl Into<VenueId>, instrument: impl Into<String>) -> Self {
        InstrumentKey {
            venue: venue.into(),
            instrument: instrument.into().to_uppercase(),
        }
    }
}

impl fmt::Display for InstrumentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.venue, self.instrument)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_venue_id_normalization() {
        let id = VenueId::new("Binance_Spot");
        assert_eq!(id.as_str(), "binance_spot");
        assert_eq!(id, VenueId::binance_spot());
    }

    #[test]
    fn test_instrument_key() {
        let key = InstrumentKey::new("binance_spot", "btcusdt");
        assert_eq!(key.venue, VenueId::binance_spot());
        assert_eq!(key.instrument, "BTCUSDT");
        assert_eq!(key.to_string(), "binance_spot:BTCUSDT");
    }

    #[test]
    fn test_key_equality_across_venues() {
        let spot = InstrumentKey::new("binance_spot", "BTCUSDT");
        let futs = InstrumentKey::new("binance_futures", "BTCUSDT");
        assert_ne!(spot, futs);
    }
}
