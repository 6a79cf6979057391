//! Blocking access to an ordered replication log.
//!
//! Implementations are driven from the dedicated reader thread, so every method may block
//! the calling thread. They must never be called from an async task.

use std::sync::Arc;
use std::time::Duration;

use postgres::schema::{ColumnSchema, TableName};

use crate::error::EtlResult;
use crate::types::{ChangeType, ReplicationPosition};

pub mod memory;
pub mod pg;

/// A row mutation as read from the log, before mapping.
#[derive(Debug, Clone, PartialEq)]
pub struct RawRowEvent {
    pub table: TableName,
    pub change_type: ChangeType,
    /// Column names of the tuple, shared between rows of the same relation.
    pub columns: Arc<[String]>,
    /// Text encoded cells, `None` for `NULL` or values the log did not carry.
    pub values: Vec<Option<String>>,
}

/// A row together with its place in the log.
#[derive(Debug, Clone, PartialEq)]
pub struct LogRecord {
    pub position: ReplicationPosition,
    pub row: RawRowEvent,
}

/// Result of waiting for the next row on a stream.
#[derive(Debug)]
pub enum NextRecord {
    Record(LogRecord),
    /// Nothing arrived within the requested wait.
    Timeout,
    /// The log closed the stream.
    End,
}

/// A source of row events, opened on demand.
pub trait LogSource: Send + 'static {
    type Stream: RowEventStream;

    /// Returns the live columns of `table`, or an empty list when it does not exist.
    fn describe_table(&mut self, table: &TableName) -> EtlResult<Vec<ColumnSchema>>;

    /// Opens a stream positioned after `position`, or at the log tail when `None`.
    ///
    /// Records at or before `position` may be emitted again by some sources; readers
    /// are expected to skip them.
    fn open_stream(&mut self, position: Option<&ReplicationPosition>) -> EtlResult<Self::Stream>;
}

/// An open, position tracked stream of row events.
pub trait RowEventStream: Send {
    /// Waits up to `wait` for the next record.
    fn next_record(&mut self, wait: Duration) -> EtlResult<NextRecord>;

    /// Marks every record up to and including `position` as handed off.
    fn confirm(&mut self, position: &ReplicationPosition) -> EtlResult<()>;
}
