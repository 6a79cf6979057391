use tokio::sync::mpsc;

use crate::error::{ErrorKind, EtlResult};
use crate::etl_error;
use crate::types::ChangeEvent;

/// Item handed from the reader to the dispatcher.
#[derive(Debug, Clone, PartialEq)]
pub enum QueueItem {
    /// A decoded row of a mapped table.
    Change(ChangeEvent),
    /// A row of the backfill marker table.
    BackfillMarker,
}

/// Producer side of the change queue, used from the reader thread.
#[derive(Debug)]
pub struct ChangeQueueTx(mpsc::Sender<QueueItem>);

impl ChangeQueueTx {
    /// Enqueues `item`, blocking the calling thread while the queue is full.
    ///
    /// Must not be called from an async context. Fails once the consumer is gone.
    pub fn blocking_send(&self, item: QueueItem) -> EtlResult<()> {
        self.0.blocking_send(item).map_err(|_| {
            etl_error!(
                ErrorKind::InvalidState,
                "Change queue closed",
                "the dispatcher stopped receiving changes"
            )
        })
    }
}

/// Consumer side of the change queue.
#[derive(Debug)]
pub struct ChangeQueueRx(mpsc::Receiver<QueueItem>);

impl ChangeQueueRx {
    /// Returns the next item, or `None` once the producer is gone and the queue is drained.
    pub async fn recv(&mut self) -> Option<QueueItem> {
        self.0.recv().await
    }
}

/// Creates a bounded, ordered queue holding up to `capacity` items.
pub fn create_change_queue(capacity: usize) -> (ChangeQueueTx, ChangeQueueRx) {
    let (tx, rx) = mpsc::channel(capacity);
    (ChangeQueueTx(tx), ChangeQueueRx(rx))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::types::{ChangeType, RowValues};

    fn change(table: &str) -> QueueItem {
        QueueItem::Change(ChangeEvent::new(table, RowValues::new(), ChangeType::Insert))
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn full_queue_blocks_the_producer() {
        let (tx, mut rx) = create_change_queue(1);

        let producer = tokio::task::spawn_blocking(move || {
            tx.blocking_send(change("a")).unwrap();
            tx.blocking_send(change("b")).unwrap();
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!producer.is_finished());

        assert_eq!(rx.recv().await, Some(change("a")));
        assert_eq!(rx.recv().await, Some(change("b")));
        producer.await.unwrap();
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn sending_to_a_dropped_consumer_fails() {
        let (tx, rx) = create_change_queue(4);
        drop(rx);

        let err = tx.send(QueueItem::BackfillMarker).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);
    }
}
