use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use postgres::schema::{ColumnSchema, TableName};

use crate::error::{ErrorKind, EtlResult};
use crate::etl_error;
use crate::source::{LogRecord, LogSource, NextRecord, RawRowEvent, RowEventStream};
use crate::types::{ChangeType, ReplicationPosition};

/// Log file name of every record appended to a [`MemoryLog`].
pub const MEMORY_LOG_FILE: &str = "memory-log";

#[derive(Debug, Default)]
struct Inner {
    tables: HashMap<TableName, Vec<ColumnSchema>>,
    records: Vec<LogRecord>,
    disconnect_after: Option<u64>,
    fail_confirm_of: Option<u64>,
    closed: bool,
    opened: Vec<Option<ReplicationPosition>>,
    confirmed: Vec<ReplicationPosition>,
}

#[derive(Debug, Default)]
struct Shared {
    inner: Mutex<Inner>,
    appended: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// In-memory replication log.
///
/// The log keeps every appended record, so opening a stream without a position starts at
/// its first record. Transport failures can be scripted with [`MemoryLog::disconnect_after`]
/// and [`MemoryLog::fail_confirm_of`].
#[derive(Debug, Clone, Default)]
pub struct MemoryLog {
    shared: Arc<Shared>,
}

impl MemoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the live schema reported for `table`.
    pub fn define_table(&self, table: TableName, columns: Vec<ColumnSchema>) {
        self.shared.lock().tables.insert(table, columns);
    }

    /// Appends a row and wakes up waiting streams.
    pub fn append(
        &self,
        table: TableName,
        change_type: ChangeType,
        columns: Arc<[String]>,
        values: Vec<Option<String>>,
    ) -> ReplicationPosition {
        let mut inner = self.shared.lock();

        let position = ReplicationPosition::new(MEMORY_LOG_FILE, inner.records.len() as u64 + 1);
        inner.records.push(LogRecord {
            position: position.clone(),
            row: RawRowEvent {
                table,
                change_type,
                columns,
                values,
            },
        });
        drop(inner);

        self.shared.appended.notify_all();

        position
    }

    /// Fails the next read of a record after `position` once, as if the connection dropped.
    pub fn disconnect_after(&self, position: &ReplicationPosition) {
        self.shared.lock().disconnect_after = Some(position.log_offset);
    }

    /// Fails the first confirmation of `position` once, as if the connection dropped.
    pub fn fail_confirm_of(&self, position: &ReplicationPosition) {
        self.shared.lock().fail_confirm_of = Some(position.log_offset);
    }

    /// Ends every stream once it has read all records.
    pub fn close(&self) {
        self.shared.lock().closed = true;
        self.shared.appended.notify_all();
    }

    /// Positions passed to every `open_stream` call, in call order.
    pub fn opened_positions(&self) -> Vec<Option<ReplicationPosition>> {
        self.shared.lock().opened.clone()
    }

    /// Positions confirmed by readers, in confirmation order.
    pub fn confirmed_positions(&self) -> Vec<ReplicationPosition> {
        self.shared.lock().confirmed.clone()
    }

    pub fn source(&self) -> MemoryLogSource {
        MemoryLogSource {
            shared: self.shared.clone(),
        }
    }
}

/// [`LogSource`] reading from a [`MemoryLog`].
#[derive(Debug, Clone)]
pub struct MemoryLogSource {
    shared: Arc<Shared>,
}

impl LogSource for MemoryLogSource {
    type Stream = MemoryLogStream;

    fn describe_table(&mut self, table: &TableName) -> EtlResult<Vec<ColumnSchema>> {
        Ok(self
            .shared
            .lock()
            .tables
            .get(table)
            .cloned()
            .unwrap_or_default())
    }

    fn open_stream(&mut self, position: Option<&ReplicationPosition>) -> EtlResult<Self::Stream> {
        let mut inner = self.shared.lock();
        inner.opened.push(position.cloned());

        let cursor = match position {
            Some(position) => inner
                .records
                .iter()
                .position(|record| record.position > *position)
                .unwrap_or(inner.records.len()),
            None => 0,
        };

        Ok(MemoryLogStream {
            shared: self.shared.clone(),
            cursor,
        })
    }
}

#[derive(Debug)]
pub struct MemoryLogStream {
    shared: Arc<Shared>,
    cursor: usize,
}

impl RowEventStream for MemoryLogStream {
    fn next_record(&mut self, wait: Duration) -> EtlResult<NextRecord> {
        let deadline = Instant::now() + wait;
        let mut inner = self.shared.lock();

        loop {
            if self.cursor < inner.records.len() {
                let offset = inner.records[self.cursor].position.log_offset;
                if let Some(after) = inner.disconnect_after
                    && offset > after
                {
                    inner.disconnect_after = None;
                    return Err(etl_error!(
                        ErrorKind::SourceConnectionFailed,
                        "Memory log connection dropped",
                        format!("scripted disconnect before offset {offset}")
                    ));
                }

                let record = inner.records[self.cursor].clone();
                self.cursor += 1;
                return Ok(NextRecord::Record(record));
            }

            if inner.closed {
                return Ok(NextRecord::End);
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(NextRecord::Timeout);
            }

            inner = self
                .shared
                .appended
                .wait_timeout(inner, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    fn confirm(&mut self, position: &ReplicationPosition) -> EtlResult<()> {
        let mut inner = self.shared.lock();

        if inner.fail_confirm_of == Some(position.log_offset) {
            inner.fail_confirm_of = None;
            return Err(etl_error!(
                ErrorKind::SourceConnectionFailed,
                "Memory log connection dropped",
                format!("scripted failure confirming offset {}", position.log_offset)
            ));
        }

        inner.confirmed.push(position.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(log: &MemoryLog, value: &str) -> ReplicationPosition {
        log.append(
            TableName::new("public", "readings"),
            ChangeType::Insert,
            Arc::from(vec!["dt".to_string()]),
            vec![Some(value.to_string())],
        )
    }

    fn expect_record(stream: &mut MemoryLogStream) -> LogRecord {
        match stream.next_record(Duration::from_millis(10)).unwrap() {
            NextRecord::Record(record) => record,
            other => panic!("expected a record, got {other:?}"),
        }
    }

    #[test]
    fn reopening_resumes_after_position() {
        let log = MemoryLog::new();
        let mut source = log.source();
        row(&log, "1");
        let second = row(&log, "2");
        row(&log, "3");

        let mut stream = source.open_stream(Some(&second)).unwrap();
        let record = expect_record(&mut stream);
        assert_eq!(record.position.log_offset, 3);
        assert_eq!(log.opened_positions(), vec![Some(second)]);
    }

    #[test]
    fn empty_log_times_out_and_closed_log_ends() {
        let log = MemoryLog::new();
        let mut stream = log.source().open_stream(None).unwrap();

        assert!(matches!(
            stream.next_record(Duration::from_millis(10)).unwrap(),
            NextRecord::Timeout
        ));

        log.close();
        assert!(matches!(
            stream.next_record(Duration::from_millis(10)).unwrap(),
            NextRecord::End
        ));
    }

    #[test]
    fn scripted_disconnect_fires_once() {
        let log = MemoryLog::new();
        let first = row(&log, "1");
        row(&log, "2");
        log.disconnect_after(&first);

        let mut source = log.source();
        let mut stream = source.open_stream(None).unwrap();
        expect_record(&mut stream);

        let err = stream.next_record(Duration::from_millis(10)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SourceConnectionFailed);

        let mut stream = source.open_stream(Some(&first)).unwrap();
        let record = expect_record(&mut stream);
        assert_eq!(record.position.log_offset, 2);
    }

    #[test]
    fn waiting_stream_wakes_up_on_append() {
        let log = MemoryLog::new();
        let mut stream = log.source().open_stream(None).unwrap();

        let writer = log.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            row(&writer, "1");
        });

        match stream.next_record(Duration::from_secs(5)).unwrap() {
            NextRecord::Record(record) => assert_eq!(record.position.log_offset, 1),
            other => panic!("expected a record, got {other:?}"),
        }
        handle.join().unwrap();
    }
}
