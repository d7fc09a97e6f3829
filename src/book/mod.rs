mod engine;
mod row;

pub use engine::{ApplyOutcome, BookEngine};
pub use row::{EventType, PriceLevel, RecordedRow};
