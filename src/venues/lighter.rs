//! Lighter adapter.
//!
//! Books are addressed by numeric market id. The subscribe reply
//! (`subscribed/order_book`) carries a full snapshot with an `offset`
//! sequence; subsequent `update/order_book` frames carry a scalar
//! `offset`, so continuity reduces to `offset == last + 1`. There is no
//! REST depth endpoint; resync means re-subscribing the channel.

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use crate::domain::{DepthDelta, DepthSnapshot, VenueId};
use crate::venues::{SnapshotSource, VenueMessage, VenueProtocol};

pub struct LighterProtocol {
    venue: VenueId,
    ws_base: String,
}

impl LighterProtocol {
    pub fn new(ws_override: Option<String>) -> Self {
        LighterProtocol {
            venue: VenueId::lighter(),
            ws_base: ws_override.unwrap_or_else(|| "wss://mainnet.zklighter.elliot.ai/stream".to_string()),
        }
    }

    /// Levels arrive as `{"price": "...", "size": "..."}` objects.
    fn parse_levels(value: Option<&Value>) -> Option<Vec<[String; 2]>> {
        let Some(value) = value else {
            return Some(Vec::new());
        };
        value
            .as_array()?
            .iter()
            .map(|level| {
                Some([
                    level.get("price")?.as_str()?.to_string(),
                    level.get("size")?.as_str()?.to_string(),
                ])
            })
            .collect()
    }

    /// Channel suffix is the market id, e.g. `order_book/0` or
    /// `order_book:0` depending on direction.
    fn market_from_channel(channel: &str) -> Option<String> {
        channel
            .rsplit(|c| c == '/' || c == ':')
            .next()
            .map(|s| s.to_string())
    }
}

#[async_trait]
impl VenueProtocol for LighterProtocol {
    fn venue(&self) -> VenueId {
        self.venue.clone()
    }

    fn ws_url(&self, _instruments: &[String]) -> String {
        self.ws_base.clone()
    }

    fn subscribe_frames(&self, instruments: &[String]) -> Vec<String> {
        instruments
            .iter()
            .map(|market_id| {
                format!(
                    r#"{{"type":"subscribe","channel":"order_book/{market_id}"}}"#
                )
            })
            .collect()
    }

    fn parse(&self, text: &str) -> VenueMessage {
        let value: Value = match serde_json::from_str(text) {
            Ok(v) => v,
            Err(_) => return VenueMessage::Ignored,
        };
        let msg_type = value.get("type").and_then(|t| t.as_str()).unwrap_or_default();
        match msg_type {
            "ping" | "pong" | "connected" => return VenueMessage::Heartbeat,
            "subscribed/order_book" | "update/order_book" => {}
            _ => {
                debug!(venue = %self.venue, msg_type, "unrecognized frame");
                return VenueMessage::Ignored;
            }
        }

        let instrument = match value
            .get("channel")
            .and_then(|c| c.as_str())
            .and_then(Self::market_from_channel)
        {
            Some(market) => market,
            None => return VenueMessage::Ignored,
        };
        let book = value.get("order_book").unwrap_or(&value);
        let offset = match book.get("offset").and_then(|o| o.as_u64()) {
            Some(offset) => offset,
            None => return VenueMessage::Ignored,
        };
        let bids = match Self::parse_levels(book.get("bids")) {
            Some(levels) => levels,
            None => return VenueMessage::Ignored,
        };
        let asks = match Self::parse_levels(book.get("asks")) {
            Some(levels) => levels,
            None => return VenueMessage::Ignored,
        };

        if msg_type == "subscribed/order_book" {
            VenueMessage::Snapshot {
                instrument,
                snapshot: DepthSnapshot {
                    last_update_id: offset,
                    bids,
                    asks,
                },
            }
        } else {
            let event_time = value.get("timestamp").and_then(|t| t.as_i64()).unwrap_or_default();
            VenueMessage::Delta {
                instrument,
                delta: DepthDelta::with_sequence(offset, event_time, bids, asks),
            }
        }
    }

    fn snapshot_source(&self) -> SnapshotSource {
        SnapshotSource::Resubscribe
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subscribe_frames() {
        let protocol = LighterProtocol::new(None);
        let frames = protocol.subscribe_frames(&["0".to_string(), "1".to_string()]);
        assert_eq!(
            frames[0],
            r#"{"type":"subscribe","channel":"order_book/0"}"#
        );
        assert_eq!(frames.len(), 2);
    }

    #[test]
    fn test_parse_subscribed_snapshot() {
        let protocol = LighterProtocol::new(None);
        let frame = r#"{
            "type": "subscribed/order_book",
            "channel": "order_book:0",
            "order_book": {
                "offset": 5000,
                "bids": [{"price": "100.0", "size": "1.5"}],
                "asks": [{"price": "100.5", "size": "2.0"}]
            }
        }"#;

        match protocol.parse(frame) {
            VenueMessage::Snapshot { instrument, snapshot } => {
                assert_eq!(instrument, "0");
                assert_eq!(snapshot.last_update_id, 5000);
                assert_eq!(snapshot.bids[0], ["100.0".to_string(), "1.5".to_string()]);
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn test_parse_update_scalar_sequence() {
        let protocol = LighterProtocol::new(None);
        let frame = r#"{
            "type": "update/order_book",
            "channel": "order_book:0",
            "timestamp": 1700000000000,
            "order_book": {
                "offset": 5001,
                "bids": [{"price": "100.1", "size": "0"}],
                "asks": []
            }
        }"#;

        match protocol.parse(frame) {
            VenueMessage::Delta { instrument, delta } => {
                assert_eq!(instrument, "0");
                assert_eq!(delta.first_update_id, 5001);
                assert_eq!(delta.final_update_id, 5001);
                assert_eq!(delta.bids[0][1], "0");
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn test_parse_heartbeat() {
        let protocol = LighterProtocol::new(None);
        assert!(matches!(
            protocol.parse(r#"{"type":"ping"}"#),
            VenueMessage::Heartbeat
        ));
    }
}
