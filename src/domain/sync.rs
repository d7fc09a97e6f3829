/// Synchronization state for one reconstructed book.
///
/// `Uninitialized → AwaitingSnapshot → Synced` on startup; `Synced →
/// OutOfSync` on a sequence gap or crossed book, after which a fresh
/// snapshot request moves the book back through `AwaitingSnapshot`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
    /// No data received yet
    Uninitialized,
    /// Snapshot requested, buffering deltas until it arrives
    AwaitingSnapshot,
    /// Fully synced, applying deltas normally
    Synced,
    /// Gap or corruption detected, needs resync
    OutOfSync,
}

impl SyncStatus {
    /// Deltas may only be applied in this state.
    pub fn is_ready(&self) -> bool {
        matches!(self, SyncStatus::Synced)
    }

    pub fn needs_snapshot(&self) -> bool {
        matches!(
            self,
            SyncStatus::Uninitialized | SyncStatus::AwaitingSnapshot | SyncStatus::OutOfSync
        )
    }
}
