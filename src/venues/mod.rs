//! Venue adapters: everything venue-specific behind one trait.
//!
//! An adapter owns URL construction, subscription frames, message
//! parsing into canonical events and the snapshot strategy. The shared
//! connection loop in `stream` drives any adapter the same way.

mod binance;
mod lighter;
mod stream;
mod synthetic;

pub use binance::BinanceProtocol;
pub use lighter::LighterProtocol;
pub use stream::{Backoff, VenueRuntime};
pub use synthetic::SyntheticFeed;

use async_trait::async_trait;

use crate::domain::{DepthDelta, DepthSnapshot, TransportError, VenueId};

/// A parsed inbound frame, already normalized to canonical events.
#[derive(Debug)]
pub enum VenueMessage {
    Snapshot {
        instrument: String,
        snapshot: DepthSnapshot,
    },
    Delta {
        instrument: String,
        delta: DepthDelta,
    },
    /// Keepalive or ack, nothing to record
    Heartbeat,
    /// Unknown frame, logged at debug and skipped
    Ignored,
}

/// How a venue delivers authoritative snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotSource {
    /// Fetch over REST while the stream keeps running
    Rest,
    /// Re-send the subscription; the venue replies with a snapshot frame
    Resubscribe,
}

/// Venue-specific protocol details, implemented per exchange.
#[async_trait]
pub trait VenueProtocol: Send + Sync {
    fn venue(&self) -> VenueId;

    /// Full WebSocket URL for the given instruments.
    fn ws_url(&self, instruments: &[String]) -> String;

    /// Frames to send right after connecting. Empty when subscriptions
    /// are encoded in the URL.
    fn subscribe_frames(&self, instruments: &[String]) -> Vec<String>;

    /// Parse one text frame into a canonical message.
    fn parse(&self, text: &str) -> VenueMessage;

    fn snapshot_source(&self) -> SnapshotSource;

    /// Fetch a REST snapshot. Only called when `snapshot_source()` is
    /// `Rest`.
    async fn fetch_snapshot(
        &self,
        _instrument: &str,
        _depth: usize,
    ) -> Result<DepthSnapshot, TransportError> {
        Err(TransportError::SnapshotUnsupported)
    }
}
