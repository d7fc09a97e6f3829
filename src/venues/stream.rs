//! Shared WebSocket connection loop driving one venue's pipelines.
//!
//! One task per venue connection: it owns every pipeline for that venue,
//! so book state is single-writer and lock-free. REST snapshot fetches
//! run on spawned tasks and report back through an mpsc channel, keeping
//! the stream drained while a resync is in flight.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::domain::{DepthSnapshot, TransportError};
use crate::pipeline::{Pipeline, PipelineAction};
use crate::venues::{SnapshotSource, VenueMessage, VenueProtocol};

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type SnapshotResult = (String, DepthSnapshot);

/// Exponential backoff with jitter for reconnects.
pub struct Backoff {
    base: Duration,
    max: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Backoff {
            base,
            max,
            attempt: 0,
        }
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Next delay: base * 2^attempt, capped, with +-20% jitter.
    pub fn next_delay(&mut self) -> Duration {
        let exp = self
            .base
            .saturating_mul(2u32.saturating_pow(self.attempt.min(16)));
        self.attempt = self.attempt.saturating_add(1);
        let capped = exp.min(self.max);
        let jitter = rand::thread_rng().gen_range(0.8..1.2);
        capped.mul_f64(jitter)
    }
}

/// Connection loop for one venue, owning its pipelines.
pub struct VenueRuntime {
    protocol: Arc<dyn VenueProtocol>,
    instruments: Vec<String>,
    depth: usize,
    pipelines: HashMap<String, Pipeline>,
    backoff: Backoff,
    idle_timeout: Duration,
}

impl VenueRuntime {
    pub fn new(
        protocol: Arc<dyn VenueProtocol>,
        instruments: Vec<String>,
        depth: usize,
        pipelines: Vec<Pipeline>,
        backoff: Backoff,
        idle_timeout: Duration,
    ) -> Self {
        let pipelines = pipelines
            .into_iter()
            .map(|p| (p.key().instrument.clone(), p))
            .collect();
        VenueRuntime {
            protocol,
            instruments,
            depth,
            pipelines,
            backoff,
            idle_timeout,
        }
    }

    /// Connect, stream, reconnect with backoff; returns when cancelled.
    pub async fn run(mut self, cancel: CancellationToken) {
        let venue = self.protocol.venue();
        loop {
            // fresh channel per session so a stale fetch from a dead
            // connection cannot seed a new book
            let (snap_tx, mut snap_rx) = mpsc::channel::<SnapshotResult>(32);
            match self.session(&snap_tx, &mut snap_rx, &cancel).await {
                Ok(()) => {
                    info!(%venue, "venue task stopped");
                    return;
                }
                Err(err) => {
                    if cancel.is_cancelled() {
                        return;
                    }
                    for p in self.pipelines.values() {
                        p.stats().record_reconnect();
                    }
                    let delay = self.backoff.next_delay();
                    warn!(%venue, error = %err, delay_ms = delay.as_millis() as u64, "connection lost, reconnecting");
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    async fn session(
        &mut self,
        snap_tx: &mpsc::Sender<SnapshotResult>,
        snap_rx: &mut mpsc::Receiver<SnapshotResult>,
        cancel: &CancellationToken,
    ) -> Result<(), TransportError> {
        let url = self.protocol.ws_url(&self.instruments);
        info!(venue = %self.protocol.venue(), %url, "connecting");
        let (ws, _) = connect_async(url.as_str())
            .await
            .map_err(|e| TransportError::Connection(e.to_string()))?;
        let (mut sink, mut read) = ws.split();

        for frame in self.protocol.subscribe_frames(&self.instruments) {
            sink.send(Message::text(frame))
                .await
                .map_err(|e| TransportError::Subscribe(e.to_string()))?;
        }
        self.backoff.reset();

        // every book starts a session out of sync
        for p in self.pipelines.values_mut() {
            p.begin_resync();
        }
        if self.protocol.snapshot_source() == SnapshotSource::Rest {
            // fetch by pipeline key, not config spelling, so the result
            // routes back to the book it was fetched for
            for instrument in self.snapshot_targets() {
                self.spawn_snapshot_fetch(&instrument, snap_tx);
            }
        }

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = sink.send(Message::Close(None)).await;
                    return Ok(());
                }
                Some((instrument, snapshot)) = snap_rx.recv() => {
                    self.handle_snapshot(instrument, snapshot, &mut sink, snap_tx).await?;
                }
                result = tokio::time::timeout(self.idle_timeout, read.next()) => {
                    self.handle_frame(result, &mut sink, snap_tx).await?;
                }
            }
        }
    }

    async fn handle_frame(
        &mut self,
        result: Result<Option<Result<Message, tokio_tungstenite::tungstenite::Error>>, tokio::time::error::Elapsed>,
        sink: &mut WsSink,
        snap_tx: &mpsc::Sender<SnapshotResult>,
    ) -> Result<(), TransportError> {
        match result {
            Err(_) => Err(TransportError::IdleTimeout),
            Ok(None) => Err(TransportError::ConnectionClosed),
            Ok(Some(Err(e))) => Err(TransportError::Connection(e.to_string())),
            Ok(Some(Ok(Message::Text(text)))) => {
                self.handle_text(text.as_str(), sink, snap_tx).await
            }
            Ok(Some(Ok(Message::Ping(payload)))) => {
                sink.send(Message::Pong(payload))
                    .await
                    .map_err(|e| TransportError::Connection(e.to_string()))
            }
            Ok(Some(Ok(Message::Close(_)))) => Err(TransportError::ConnectionClosed),
            Ok(Some(Ok(_))) => Ok(()),
        }
    }

    async fn handle_text(
        &mut self,
        text: &str,
        sink: &mut WsSink,
        snap_tx: &mpsc::Sender<SnapshotResult>,
    ) -> Result<(), TransportError> {
        match self.protocol.parse(text) {
            VenueMessage::Delta { instrument, delta } => {
                let action = match self.pipelines.get_mut(&instrument) {
                    Some(p) => p.on_delta(delta),
                    None => {
                        debug!(%instrument, "delta for unsubscribed instrument");
                        return Ok(());
                    }
                };
                if action == PipelineAction::NeedsResync {
                    self.request_resync(&instrument, sink, snap_tx).await?;
                }
                Ok(())
            }
            VenueMessage::Snapshot { instrument, snapshot } => {
                self.handle_snapshot(instrument, snapshot, sink, snap_tx).await
            }
            VenueMessage::Heartbeat | VenueMessage::Ignored => Ok(()),
        }
    }

    async fn handle_snapshot(
        &mut self,
        instrument: String,
        snapshot: DepthSnapshot,
        sink: &mut WsSink,
        snap_tx: &mpsc::Sender<SnapshotResult>,
    ) -> Result<(), TransportError> {
        let action = match self.pipelines.get_mut(&instrument) {
            Some(p) => p.on_snapshot(snapshot),
            None => {
                debug!(%instrument, "snapshot for unsubscribed instrument");
                return Ok(());
            }
        };
        if action == PipelineAction::NeedsResync {
            self.request_resync(&instrument, sink, snap_tx).await?;
        }
        Ok(())
    }

    /// Put one pipeline back on the resync path.
    async fn request_resync(
        &mut self,
        instrument: &str,
        sink: &mut WsSink,
        snap_tx: &mpsc::Sender<SnapshotResult>,
    ) -> Result<(), TransportError> {
        if let Some(p) = self.pipelines.get_mut(instrument) {
            p.begin_resync();
        }
        match self.protocol.snapshot_source() {
            SnapshotSource::Rest => {
                self.spawn_snapshot_fetch(instrument, snap_tx);
                Ok(())
            }
            SnapshotSource::Resubscribe => {
                for frame in self.protocol.subscribe_frames(&[instrument.to_string()]) {
                    sink.send(Message::text(frame))
                        .await
                        .map_err(|e| TransportError::Subscribe(e.to_string()))?;
                }
                Ok(())
            }
        }
    }

    /// Instruments to request snapshots for, in the pipeline map's
    /// normalized spelling.
    fn snapshot_targets(&self) -> Vec<String> {
        self.pipelines.keys().cloned().collect()
    }

    /// Fetch a REST snapshot off the stream task, retrying until it
    /// lands or the session ends.
    fn spawn_snapshot_fetch(&self, instrument: &str, snap_tx: &mpsc::Sender<SnapshotResult>) {
        let protocol = self.protocol.clone();
        let tx = snap_tx.clone();
        let instrument = instrument.to_string();
        let depth = self.depth;
        tokio::spawn(async move {
            let mut delay = Duration::from_millis(500);
            loop {
                match protocol.fetch_snapshot(&instrument, depth).await {
                    Ok(snapshot) => {
                        let _ = tx.send((instrument, snapshot)).await;
                        return;
                    }
                    Err(err) => {
                        warn!(%instrument, error = %err, "snapshot fetch failed, retrying");
                    }
                }
                if tx.is_closed() {
                    return;
                }
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(Duration::from_secs(10));
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::InstrumentKey;
    use crate::recorder::RecordBuffer;
    use crate::telemetry::PipelineStats;
    use crate::venues::BinanceProtocol;

    #[test]
    fn test_snapshot_targets_match_pipeline_keys() {
        // config may spell a symbol in any case; the fetch must be
        // keyed the way the pipeline map is, or the result mis-routes
        // and the book never syncs
        let buffer = Arc::new(RecordBuffer::new(10));
        let pipeline = Pipeline::new(
            InstrumentKey::new("binance_spot", "btcusdt"),
            20,
            100,
            buffer,
            Arc::new(PipelineStats::default()),
        );
        let runtime = VenueRuntime::new(
            Arc::new(BinanceProtocol::spot(None, None)),
            vec!["btcusdt".to_string()],
            20,
            vec![pipeline],
            Backoff::new(Duration::from_secs(1), Duration::from_secs(60)),
            Duration::from_secs(30),
        );

        assert!(runtime.pipelines.contains_key("BTCUSDT"));
        assert_eq!(runtime.snapshot_targets(), vec!["BTCUSDT".to_string()]);
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(60));
        let mut last = Duration::ZERO;
        for expected_secs in [1u64, 2, 4, 8, 16, 32, 60, 60] {
            let delay = backoff.next_delay();
            let expected = Duration::from_secs(expected_secs);
            assert!(delay >= expected.mul_f64(0.8), "delay {delay:?} below floor");
            assert!(delay <= expected.mul_f64(1.2), "delay {delay:?} above ceiling");
            last = delay;
        }
        assert!(last <= Duration::from_secs(72));
    }

    #[test]
    fn test_backoff_reset() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(60));
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();
        let delay = backoff.next_delay();
        assert!(delay <= Duration::from_secs(1).mul_f64(1.2));
    }
}
