//! Data model flowing from the replication log to the event bus.

mod event;
mod position;
mod value;

pub use event::{ChangeEvent, ChangeType, RowValues};
pub use position::ReplicationPosition;
pub use value::{TIMESTAMP_FORMAT, Value};
