//! Multi-venue order book recorder.
//!
//! Connects to exchange depth streams, reconstructs full books with
//! sequence validation and automatic resync, and persists every book
//! state to hourly-partitioned parquet files.

pub mod book;
pub mod config;
pub mod domain;
pub mod pipeline;
pub mod recorder;
pub mod supervisor;
pub mod telemetry;
pub mod venues;
