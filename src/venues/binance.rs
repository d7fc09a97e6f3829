//! Binance adapter, covering spot and USD-M futures.
//!
//! Deltas arrive on the combined depth stream
//! (`/stream?streams=btcusdt@depth@100ms/...`); snapshots come from the
//! REST depth endpoint. The continuity rule between the two is the
//! documented update-id range check, enforced by the book engine.

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use crate::domain::{DepthDelta, DepthSnapshot, TransportError, VenueId};
use crate::venues::{SnapshotSource, VenueMessage, VenueProtocol};

/// REST depth endpoint only accepts fixed limits.
const DEPTH_LIMITS: [usize; 7] = [5, 10, 20, 50, 100, 500, 1000];

pub struct BinanceProtocol {
    venue: VenueId,
    ws_base: String,
    rest_base: String,
    depth_path: &'static str,
    client: reqwest::Client,
}

impl BinanceProtocol {
    pub fn spot(ws_override: Option<String>, rest_override: Option<String>) -> Self {
        BinanceProtocol {
            venue: VenueId::binance_spot(),
            ws_base: ws_override.unwrap_or_else(|| "wss://stream.binance.com:9443".to_string()),
            rest_base: rest_override.unwrap_or_else(|| "https://api.binance.com".to_string()),
            depth_path: "/api/v3/depth",
            client: reqwest::Client::new(),
        }
    }

    pub fn futures(ws_override: Option<String>, rest_override: Option<String>) -> Self {
        BinanceProtocol {
            venue: VenueId::binance_futures(),
            ws_base: ws_override.unwrap_or_else(|| "wss://fstream.binance.com".to_string()),
            rest_base: rest_override.unwrap_or_else(|| "https://fapi.binance.com".to_string()),
            depth_path: "/fapi/v1/depth",
            client: reqwest::Client::new(),
        }
    }

    fn parse_levels(value: Option<&Value>) -> Option<Vec<[String; 2]>> {
        value?
            .as_array()?
            .iter()
            .map(|level| {
                let pair = level.as_array()?;
                Some([pair.first()?.as_str()?.to_string(), pair.get(1)?.as_str()?.to_string()])
            })
            .collect()
    }
}

/// Smallest REST limit that still covers the requested depth.
fn snapshot_limit(depth: usize) -> usize {
    DEPTH_LIMITS
        .iter()
        .copied()
        .find(|&l| l >= depth)
        .unwrap_or(1000)
}

#[async_trait]
impl VenueProtocol for BinanceProtocol {
    fn venue(&self) -> VenueId {
        self.venue.clone()
    }

    fn ws_url(&self, instruments: &[String]) -> String {
        let streams: Vec<String> = instruments
            .iter()
            .map(|s| format!("{}@depth@100ms", s.to_lowercase()))
            .collect();
        format!("{}/stream?streams={}", self.ws_base, streams.join("/"))
    }

    fn subscribe_frames(&self, _instruments: &[String]) -> Vec<String> {
        // subscriptions are encoded in the combined-stream URL
        Vec::new()
    }

    fn parse(&self, text: &str) -> VenueMessage {
        let value: Value = match serde_json::from_str(text) {
            Ok(v) => v,
            Err(_) => return VenueMessage::Ignored,
        };
        // combined stream wrapper: {"stream": ..., "data": {...}}
        let data = value.get("data").unwrap_or(&value);

        if data.get("e").and_then(|e| e.as_str()) != Some("depthUpdate") {
            if data.get("result").is_some() || data.get("id").is_some() {
                return VenueMessage::Heartbeat;
            }
            debug!(venue = %self.venue, "unrecognized frame");
            return VenueMessage::Ignored;
        }

        let instrument = match data.get("s").and_then(|s| s.as_str()) {
            Some(s) => s.to_string(),
            None => return VenueMessage::Ignored,
        };
        let (first, last) = match (
            data.get("U").and_then(|v| v.as_u64()),
            data.get("u").and_then(|v| v.as_u64()),
        ) {
            (Some(first), Some(last)) => (first, last),
            _ => return VenueMessage::Ignored,
        };
        let event_time = data.get("E").and_then(|v| v.as_i64()).unwrap_or_default();
        let bids = match Self::parse_levels(data.get("b")) {
            Some(levels) => levels,
            None => return VenueMessage::Ignored,
        };
        let asks = match Self::parse_levels(data.get("a")) {
            Some(levels) => levels,
            None => return VenueMessage::Ignored,
        };

        VenueMessage::Delta {
            instrument,
            delta: DepthDelta {
                first_update_id: first,
                final_update_id: last,
                event_time,
                bids,
                asks,
            },
        }
    }

    fn snapshot_source(&self) -> SnapshotSource {
        SnapshotSource::Rest
    }

    async fn fetch_snapshot(
        &self,
        instrument: &str,
        depth: usize,
    ) -> Result<DepthSnapshot, TransportError> {
        let url = format!(
            "{}{}?symbol={}&limit={}",
            self.rest_base,
            self.depth_path,
            instrument.to_uppercase(),
            snapshot_limit(depth)
        );
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| TransportError::Snapshot(e.to_string()))?;
        if !response.status().is_success() {
            return Err(TransportError::Snapshot(format!(
                "{} returned {}",
                url,
                response.status()
            )));
        }
        response
            .json::<DepthSnapshot>()
            .await
            .map_err(|e| TransportError::Snapshot(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_combined_stream_url() {
        let protocol = BinanceProtocol::spot(None, None);
        let url = protocol.ws_url(&["BTCUSDT".to_string(), "ETHUSDT".to_string()]);
        assert_eq!(
            url,
            "wss://stream.binance.com:9443/stream?streams=btcusdt@depth@100ms/ethusdt@depth@100ms"
        );
    }

    #[test]
    fn test_parse_depth_update() {
        let protocol = BinanceProtocol::spot(None, None);
        let frame = r#"{
            "stream": "btcusdt@depth@100ms",
            "data": {
                "e": "depthUpdate",
                "E": 1672515782136,
                "s": "BTCUSDT",
                "U": 157,
                "u": 160,
                "b": [["0.0024", "10"]],
                "a": [["0.0026", "100"]]
            }
        }"#;

        match protocol.parse(frame) {
            VenueMessage::Delta { instrument, delta } => {
                assert_eq!(instrument, "BTCUSDT");
                assert_eq!(delta.first_update_id, 157);
                assert_eq!(delta.final_update_id, 160);
                assert_eq!(delta.bids[0], ["0.0024".to_string(), "10".to_string()]);
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn test_parse_subscribe_ack() {
        let protocol = BinanceProtocol::spot(None, None);
        assert!(matches!(
            protocol.parse(r#"{"result":null,"id":1}"#),
            VenueMessage::Heartbeat
        ));
    }

    #[test]
    fn test_parse_garbage() {
        let protocol = BinanceProtocol::spot(None, None);
        assert!(matches!(protocol.parse("not json"), VenueMessage::Ignored));
        assert!(matches!(
            protocol.parse(r#"{"e":"trade","s":"BTCUSDT"}"#),
            VenueMessage::Ignored
        ));
    }

    #[test]
    fn test_snapshot_limit_rounding() {
        assert_eq!(snapshot_limit(1), 5);
        assert_eq!(snapshot_limit(20), 20);
        assert_eq!(snapshot_limit(21), 50);
        assert_eq!(snapshot_limit(999), 1000);
        assert_eq!(snapshot_limit(5000), 1000);
    }

    #[test]
    fn test_futures_endpoints() {
        let protocol = BinanceProtocol::futures(None, None);
        assert_eq!(protocol.venue().as_str(), "binance_futures");
        assert!(protocol.ws_url(&["BTCUSDT".to_string()]).starts_with("wss://fstream.binance.com"));
    }
}
