mod errors;
mod events;
mod sync;
mod venue;

pub use errors::{BookError, ConfigError, StorageError, TransportError};
pub use events::{DepthDelta, DepthSnapshot, RawLevel, level};
pub use sync::SyncStatus;
pub use venue::{InstrumentKey, VenueId};
