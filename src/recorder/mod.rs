mod buffer;
mod schema;
mod writer;

pub use buffer::RecordBuffer;
pub use schema::{row_schema, rows_to_batch};
pub use writer::{PersistenceWriter, SinkConfig};
