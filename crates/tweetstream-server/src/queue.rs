use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tweetstream_telemetry::{names, MetricsRecorder};

pub const DEFAULT_QUEUE_CAPACITY: usize = 100;

/// Create one session's outbound queue.
///
/// The producer side belongs to the read path, the consumer side to the
/// write path. Dropping the producer closes the queue; the consumer still
/// drains whatever was already queued.
pub fn outbound_queue(
    capacity: usize,
    metrics: Arc<MetricsRecorder>,
) -> (QueueProducer, QueueConsumer) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let dropped = Arc::new(AtomicU64::new(0));
    (
        QueueProducer {
            tx,
            dropped: Arc::clone(&dropped),
            metrics,
        },
        QueueConsumer { rx, dropped },
    )
}

pub struct QueueProducer {
    tx: mpsc::Sender<String>,
    dropped: Arc<AtomicU64>,
    metrics: Arc<MetricsRecorder>,
}

impl QueueProducer {
    /// Queue a payload without waiting. A full queue drops the payload.
    pub fn enqueue(&self, payload: String) -> bool {
        match self.tx.try_send(payload) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(payload)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                self.metrics.counter_inc(names::MESSAGES_DROPPED, &[], 1);
                tracing::warn!(
                    payload_len = payload.len(),
                    capacity = self.tx.max_capacity(),
                    "outbound queue full, dropping message"
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

pub struct QueueConsumer {
    rx: mpsc::Receiver<String>,
    dropped: Arc<AtomicU64>,
}

impl QueueConsumer {
    /// Next payload, or `None` once the queue is closed and empty.
    pub async fn dequeue(&mut self) -> Option<String> {
        self.rx.recv().await
    }

    /// Refuse further payloads. Already queued ones can still be drained.
    pub fn close(&mut self) {
        self.rx.close();
    }

    /// Discard everything still queued, returning how many were discarded.
    pub fn drain(&mut self) -> usize {
        let mut discarded = 0;
        while self.rx.try_recv().is_ok() {
            discarded += 1;
        }
        discarded
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// Payloads dropped on overflow over the queue's lifetime.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue(capacity: usize) -> (QueueProducer, QueueConsumer, Arc<MetricsRecorder>) {
        let metrics = Arc::new(MetricsRecorder::new());
        let (p, c) = outbound_queue(capacity, Arc::clone(&metrics));
        (p, c, metrics)
    }

    #[tokio::test]
    async fn fifo_within_capacity() {
        let (producer, mut consumer, _) = queue(4);
        assert!(producer.enqueue("a".into()));
        assert!(producer.enqueue("b".into()));
        assert!(producer.enqueue("c".into()));
        assert_eq!(consumer.len(), 3);

        assert_eq!(consumer.dequeue().await.as_deref(), Some("a"));
        assert_eq!(consumer.dequeue().await.as_deref(), Some("b"));
        assert_eq!(consumer.dequeue().await.as_deref(), Some("c"));
        assert!(consumer.is_empty());
    }

    #[tokio::test]
    async fn full_queue_drops_newest_without_blocking() {
        let (producer, mut consumer, metrics) = queue(2);
        assert!(producer.enqueue("1".into()));
        assert!(producer.enqueue("2".into()));

        // Returns immediately and leaves the contents unchanged
        assert!(!producer.enqueue("3".into()));
        assert_eq!(producer.dropped(), 1);
        assert_eq!(metrics.counter_total(names::MESSAGES_DROPPED), 1);

        assert_eq!(consumer.dequeue().await.as_deref(), Some("1"));
        assert_eq!(consumer.dequeue().await.as_deref(), Some("2"));
        assert_eq!(consumer.dropped(), 1);

        // Room again
        assert!(producer.enqueue("4".into()));
        assert_eq!(consumer.dequeue().await.as_deref(), Some("4"));
    }

    #[tokio::test]
    async fn dropping_producer_closes_after_drain() {
        let (producer, mut consumer, _) = queue(4);
        producer.enqueue("last".into());
        drop(producer);

        assert_eq!(consumer.dequeue().await.as_deref(), Some("last"));
        assert_eq!(consumer.dequeue().await, None);
    }

    #[tokio::test]
    async fn closed_queue_rejects_enqueue() {
        let (producer, mut consumer, metrics) = queue(4);
        producer.enqueue("queued".into());
        consumer.close();

        assert!(!producer.enqueue("late".into()));
        // A closed queue is not an overflow
        assert_eq!(metrics.counter_total(names::MESSAGES_DROPPED), 0);
        assert_eq!(consumer.drain(), 1);
        assert_eq!(consumer.dequeue().await, None);
    }

    #[test]
    fn zero_capacity_is_clamped() {
        let (producer, _consumer, _) = queue(0);
        assert!(producer.enqueue("only".into()));
        assert!(!producer.enqueue("overflow".into()));
    }
}
