//! Per-instrument pipeline: book engine, resync buffering and handoff
//! to the record buffer.
//!
//! Owned by a single venue task, so all methods take `&mut self` and no
//! locking is involved. Rows flow out through the shared `RecordBuffer`;
//! resync requests flow back to the transport via the returned action.

use std::collections::VecDeque;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::book::{ApplyOutcome, BookEngine};
use crate::domain::{BookError, DepthDelta, DepthSnapshot, InstrumentKey, SyncStatus};
use crate::recorder::RecordBuffer;
use crate::telemetry::PipelineStats;

/// What the transport must do after handing the pipeline an event.
#[derive(Debug, PartialEq, Eq)]
pub enum PipelineAction {
    Continue,
    /// The book lost sync; a fresh snapshot must be requested.
    NeedsResync,
}

pub struct Pipeline {
    engine: BookEngine,
    /// Deltas parked while a snapshot is in flight
    pending: VecDeque<DepthDelta>,
    pending_limit: usize,
    buffer: Arc<RecordBuffer>,
    stats: Arc<PipelineStats>,
}

impl Pipeline {
    pub fn new(
        key: InstrumentKey,
        depth: usize,
        pending_limit: usize,
        buffer: Arc<RecordBuffer>,
        stats: Arc<PipelineStats>,
    ) -> Self {
        Pipeline {
            engine: BookEngine::new(key, depth),
            pending: VecDeque::new(),
            pending_limit,
            buffer,
            stats,
        }
    }

    pub fn key(&self) -> &InstrumentKey {
        self.engine.key()
    }

    pub fn status(&self) -> SyncStatus {
        self.engine.status()
    }

    pub fn stats(&self) -> &Arc<PipelineStats> {
        &self.stats
    }

    /// Mark the book out of sync and start buffering deltas. Called by
    /// the transport right before it requests a snapshot.
    pub fn begin_resync(&mut self) {
        self.engine.begin_resync();
        self.stats.record_resync();
    }

    /// Handle an incoming delta.
    ///
    /// While a snapshot is pending the delta is parked (bounded, drop
    /// oldest). Once synced, deltas apply directly; a gap or crossed
    /// book returns `NeedsResync`.
    pub fn on_delta(&mut self, delta: DepthDelta) -> PipelineAction {
        self.stats.record_message();

        if !self.engine.status().is_ready() {
            self.park(delta);
            return PipelineAction::Continue;
        }
        self.apply(delta)
    }

    /// Handle an arriving snapshot: replace the book, then replay any
    /// parked deltas in order.
    pub fn on_snapshot(&mut self, snapshot: DepthSnapshot) -> PipelineAction {
        self.stats.record_message();

        let row = match self.engine.apply_snapshot(&snapshot) {
            Ok(row) => row,
            Err(err) => {
                warn!(pipeline = %self.engine.key(), error = %err, "snapshot rejected");
                self.pending.clear();
                return PipelineAction::NeedsResync;
            }
        };
        let crossed = row.crossed;
        self.buffer.push(row);
        if crossed {
            warn!(pipeline = %self.engine.key(), "snapshot produced a crossed book");
            self.pending.clear();
            return PipelineAction::NeedsResync;
        }

        info!(
            pipeline = %self.engine.key(),
            last_update_id = self.engine.last_update_id(),
            pending = self.pending.len(),
            "book synced from snapshot"
        );

        // replay deltas parked while the snapshot was in flight
        while let Some(delta) = self.pending.pop_front() {
            if self.apply(delta) == PipelineAction::NeedsResync {
                self.pending.clear();
                return PipelineAction::NeedsResync;
            }
        }
        PipelineAction::Continue
    }

    fn apply(&mut self, delta: DepthDelta) -> PipelineAction {
        match self.engine.apply_delta(&delta) {
            Ok(ApplyOutcome::Applied(row)) => {
                self.buffer.push(row);
                PipelineAction::Continue
            }
            Ok(ApplyOutcome::Crossed(row)) => {
                warn!(pipeline = %self.engine.key(), "book crossed, resyncing");
                self.buffer.push(row);
                PipelineAction::NeedsResync
            }
            Ok(ApplyOutcome::Stale) => {
                debug!(
                    pipeline = %self.engine.key(),
                    final_update_id = delta.final_update_id,
                    "stale delta skipped"
                );
                PipelineAction::Continue
            }
            Err(BookError::SequenceGap { expected, actual }) => {
                warn!(
                    pipeline = %self.engine.key(),
                    expected,
                    actual,
                    "sequence gap, resyncing"
                );
                PipelineAction::NeedsResync
            }
            Err(err) => {
                warn!(pipeline = %self.engine.key(), error = %err, "delta rejected, resyncing");
                PipelineAction::NeedsResync
            }
        }
    }

    fn park(&mut self, delta: DepthDelta) {
        if self.pending.len() >= self.pending_limit {
            self.pending.pop_front();
            self.stats.record_pending_dropped(1);
        }
        self.pending.push_back(delta);
    }
}
