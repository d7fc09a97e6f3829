//! Process orchestration: builds the pipelines, spawns one task per
//! venue connection plus the writer and the stats reporter, then waits
//! for shutdown and drains everything in order.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::RecorderConfig;
use crate::domain::{ConfigError, InstrumentKey};
use crate::pipeline::Pipeline;
use crate::recorder::{PersistenceWriter, RecordBuffer, SinkConfig};
use crate::telemetry::{PipelineStats, PipelineTelemetry, TelemetryRegistry, run_reporter};
use crate::venues::{
    Backoff, BinanceProtocol, LighterProtocol, SyntheticFeed, VenueProtocol, VenueRuntime,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Live venue connections
    Realtime,
    /// Seeded in-process feed, no network
    Test,
}

pub struct Supervisor {
    config: RecorderConfig,
    mode: RunMode,
    /// Stop after this long; `None` runs until interrupted
    duration: Option<Duration>,
    registry: Arc<TelemetryRegistry>,
}

impl Supervisor {
    pub fn new(config: RecorderConfig, mode: RunMode, duration: Option<Duration>) -> Self {
        Supervisor {
            config,
            mode,
            duration,
            registry: Arc::new(TelemetryRegistry::new()),
        }
    }

    /// Live per-pipeline counters, for an external display layer.
    pub fn telemetry(&self) -> Vec<PipelineTelemetry> {
        self.registry.snapshot()
    }

    pub async fn run(&self) -> Result<(), ConfigError> {
        if self.config.enabled_venues().count() == 0 {
            return Err(ConfigError::NoVenuesEnabled);
        }
        // validate every venue name before spawning anything
        if self.mode == RunMode::Realtime {
            for (name, venue_cfg) in self.config.enabled_venues() {
                protocol_for(name, venue_cfg)?;
            }
        }

        let registry = self.registry.clone();
        let cancel = CancellationToken::new();
        let mut sinks = Vec::new();
        let mut venue_tasks = Vec::new();
        let mut seed = 0u64;

        for (name, venue_cfg) in self.config.enabled_venues() {
            let mut pipelines = Vec::new();
            for symbol in &venue_cfg.symbols {
                let key = InstrumentKey::new(name.as_str(), symbol.as_str());
                let buffer = Arc::new(RecordBuffer::new(venue_cfg.buffer_size));
                let stats = Arc::new(PipelineStats::default());
                registry.register(key.clone(), stats.clone(), buffer.clone());
                sinks.push(SinkConfig {
                    key: key.clone(),
                    buffer: buffer.clone(),
                    stats: stats.clone(),
                    flush_interval: venue_cfg.flush_interval(),
                });
                pipelines.push(Pipeline::new(
                    key,
                    venue_cfg.depth_levels,
                    self.config.global.resync_pending_limit,
                    buffer,
                    stats,
                ));
            }

            info!(
                venue = %name,
                instruments = venue_cfg.symbols.len(),
                mode = ?self.mode,
                "starting venue"
            );
            match self.mode {
                RunMode::Test => {
                    seed += 1;
                    let feed = SyntheticFeed::new(pipelines, seed);
                    venue_tasks.push(tokio::spawn(feed.run(cancel.clone())));
                }
                RunMode::Realtime => {
                    let protocol = protocol_for(name, venue_cfg)?;
                    let runtime = VenueRuntime::new(
                        protocol,
                        venue_cfg.symbols.clone(),
                        venue_cfg.depth_levels,
                        pipelines,
                        Backoff::new(
                            self.config.global.reconnect_base_delay(),
                            self.config.global.reconnect_max_delay(),
                        ),
                        self.config.idle_timeout_for(venue_cfg),
                    );
                    venue_tasks.push(tokio::spawn(runtime.run(cancel.clone())));
                }
            }
        }

        let writer = PersistenceWriter::new(
            self.config.base_data_dir.clone(),
            self.config.storage.clone(),
            sinks,
        );
        // the writer gets its own stop signal: it must keep running
        // until every venue task has pushed its last row
        let writer_cancel = CancellationToken::new();
        let writer_task = tokio::spawn(writer.run(writer_cancel.clone()));
        let reporter_task = tokio::spawn(run_reporter(
            registry.clone(),
            self.config.global.telemetry_interval(),
            cancel.clone(),
        ));

        self.wait_for_shutdown().await;
        info!("shutting down");
        cancel.cancel();

        for task in venue_tasks {
            if let Err(err) = task.await {
                error!(error = %err, "venue task panicked");
            }
        }
        // venues are done; the writer's final flush now sees every row
        writer_cancel.cancel();
        if let Err(err) = writer_task.await {
            error!(error = %err, "writer task panicked");
        }
        let _ = reporter_task.await;

        for p in registry.snapshot() {
            info!(
                pipeline = %p.key,
                messages = p.messages,
                rows_written = p.rows_written,
                rows_lost = p.rows_lost,
                "final pipeline stats"
            );
        }
        Ok(())
    }

    async fn wait_for_shutdown(&self) {
        match self.duration {
            Some(duration) => {
                tokio::select! {
                    _ = tokio::time::sleep(duration) => {
                        info!(secs = duration.as_secs(), "run duration elapsed");
                    }
                    result = tokio::signal::ctrl_c() => {
                        if let Err(err) = result {
                            warn!(error = %err, "ctrl-c handler failed");
                        }
                    }
                }
            }
            None => {
                if let Err(err) = tokio::signal::ctrl_c().await {
                    warn!(error = %err, "ctrl-c handler failed, stopping");
                }
            }
        }
    }
}

fn protocol_for(
    name: &str,
    cfg: &crate::config::VenueConfig,
) -> Result<Arc<dyn VenueProtocol>, ConfigError> {
    match name {
        "binance_spot" => Ok(Arc::new(BinanceProtocol::spot(
            cfg.ws_url.clone(),
            cfg.rest_url.clone(),
        ))),
        "binance_futures" => Ok(Arc::new(BinanceProtocol::futures(
            cfg.ws_url.clone(),
            cfg.rest_url.clone(),
        ))),
        "lighter" => Ok(Arc::new(LighterProtocol::new(cfg.ws_url.clone()))),
        other => Err(ConfigError::UnknownVenue(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::default_config;

    #[tokio::test]
    async fn test_no_enabled_venues_is_fatal() {
        let mut config = default_config();
        for venue in config.venues.values_mut() {
            venue.enabled = false;
        }
        let supervisor = Supervisor::new(config, RunMode::Test, Some(Duration::from_millis(10)));
        assert!(matches!(
            supervisor.run().await,
            Err(ConfigError::NoVenuesEnabled)
        ));
    }

    #[tokio::test]
    async fn test_shutdown_drains_every_row() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = default_config();
        config.base_data_dir = dir.path().to_path_buf();
        for (name, venue) in config.venues.iter_mut() {
            venue.enabled = name == "binance_spot";
        }
        if let Some(venue) = config.venues.get_mut("binance_spot") {
            venue.symbols = vec!["BTCUSDT".to_string()];
        }

        let supervisor =
            Supervisor::new(config, RunMode::Test, Some(Duration::from_millis(250)));
        supervisor.run().await.unwrap();

        // the feed stopped before the writer's final flush, so nothing
        // may be left sitting in the buffer and nothing may be lost
        let snapshot = supervisor.telemetry();
        assert_eq!(snapshot.len(), 1);
        assert!(snapshot[0].rows_written > 0);
        assert_eq!(snapshot[0].buffered, 0);
        assert_eq!(snapshot[0].rows_lost, 0);
    }

    #[tokio::test]
    async fn test_unknown_venue_is_fatal() {
        let mut config = default_config();
        let venue_cfg = config.venues["binance_spot"].clone();
        config.venues.insert("kraken".to_string(), venue_cfg);
        let supervisor = Supervisor::new(config, RunMode::Realtime, Some(Duration::from_millis(10)));
        assert!(matches!(
            supervisor.run().await,
            Err(ConfigError::UnknownVenue(_))
        ));
    }
}
