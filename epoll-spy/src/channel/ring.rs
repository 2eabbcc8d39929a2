//! In-process event ring
//!
//! A fixed-capacity queue shared by any number of [`RingProducer`]s and
//! exactly one [`RingConsumer`]. Slot storage lives in the channel itself
//! and is freed only once every producer and the consumer are gone, so a
//! write racing with teardown never touches released memory.

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use epoll_spy_common::SyscallEvent;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use super::EventChannel;

/// Create a ring with room for `capacity` events
#[must_use]
pub fn event_ring(capacity: NonZeroUsize) -> (RingProducer, RingConsumer) {
    let (tx, rx) = bounded(capacity.get());
    let dropped = Arc::new(AtomicU64::new(0));

    let producer = RingProducer { tx, dropped: Arc::clone(&dropped), cpu_id: 0, sequence: 0 };
    let consumer = RingConsumer { rx, dropped, capacity };
    (producer, consumer)
}

/// Write side, one per producer context
///
/// Each producer stamps `cpu_id` and its own sequence into every event it
/// writes, mirroring the per-CPU counters of the kernel probes.
#[derive(Debug)]
pub struct RingProducer {
    tx: Sender<SyscallEvent>,
    dropped: Arc<AtomicU64>,
    cpu_id: u32,
    sequence: u64,
}

impl RingProducer {
    /// A new producer for another context, writing into the same ring
    #[must_use]
    pub fn for_context(&self, cpu_id: u32) -> Self {
        Self { tx: self.tx.clone(), dropped: Arc::clone(&self.dropped), cpu_id, sequence: 0 }
    }

    /// Enqueue `event`, never blocking.
    ///
    /// Returns false if the event was dropped: either the ring is full
    /// (counted in `dropped_count`) or the consumer is gone.
    pub fn write(&mut self, mut event: SyscallEvent) -> bool {
        self.sequence += 1;
        event.sequence = self.sequence;
        event.cpu_id = self.cpu_id;

        match self.tx.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
            Err(TrySendError::Disconnected(_)) => false,
        }
    }
}

/// Read side; not `Clone`, so there is exactly one consumer
#[derive(Debug)]
pub struct RingConsumer {
    rx: Receiver<SyscallEvent>,
    dropped: Arc<AtomicU64>,
    capacity: NonZeroUsize,
}

impl RingConsumer {
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity.get()
    }

    /// Number of events currently queued
    #[must_use]
    pub fn pending(&self) -> usize {
        self.rx.len()
    }
}

impl EventChannel for RingConsumer {
    fn read_batch(&mut self, max_n: usize) -> impl Iterator<Item = SyscallEvent> + '_ {
        self.rx.try_iter().take(max_n)
    }

    fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn ring(capacity: usize) -> (RingProducer, RingConsumer) {
        event_ring(NonZeroUsize::new(capacity).unwrap())
    }

    fn event(fd: i32) -> SyscallEvent {
        SyscallEvent { fd, ..SyscallEvent::default() }
    }

    #[test]
    fn test_read_in_write_order() {
        let (mut producer, mut consumer) = ring(8);
        for fd in 0..8 {
            assert!(producer.write(event(fd)));
        }

        let fds: Vec<i32> = consumer.read_batch(100).map(|e| e.fd).collect();
        assert_eq!(fds, (0..8).collect::<Vec<_>>());
        assert_eq!(consumer.dropped_count(), 0);
    }

    #[test]
    fn test_overflow_counts_drops() {
        let (mut producer, mut consumer) = ring(4);
        let accepted: Vec<bool> = (0..6).map(|fd| producer.write(event(fd))).collect();
        assert_eq!(accepted, [true, true, true, true, false, false]);

        let events: Vec<SyscallEvent> = consumer.read_batch(10).collect();
        assert_eq!(events.len(), 4);
        assert_eq!(consumer.dropped_count(), 2);

        // Rejected writes still consume a sequence number, leaving a visible gap
        assert!(producer.write(event(6)));
        let next: Vec<SyscallEvent> = consumer.read_batch(10).collect();
        assert_eq!(next[0].sequence, 7);
    }

    #[test]
    fn test_capacity_plus_k() {
        for k in [1_usize, 3, 17] {
            let (mut producer, mut consumer) = ring(16);
            for fd in 0..(16 + k) {
                producer.write(event(i32::try_from(fd).unwrap()));
            }
            assert_eq!(consumer.read_batch(usize::MAX).count(), 16);
            assert_eq!(consumer.dropped_count(), k as u64);
        }
    }

    #[test]
    fn test_read_batch_empty() {
        let (_producer, mut consumer) = ring(4);
        assert_eq!(consumer.read_batch(10).count(), 0);
    }

    #[test]
    fn test_batch_is_lazy() {
        let (mut producer, mut consumer) = ring(8);
        for fd in 0..5 {
            producer.write(event(fd));
        }

        let mut batch = consumer.read_batch(5);
        assert_eq!(batch.next().map(|e| e.fd), Some(0));
        assert_eq!(batch.next().map(|e| e.fd), Some(1));
        drop(batch);

        assert_eq!(consumer.pending(), 3);
        let rest: Vec<i32> = consumer.read_batch(2).map(|e| e.fd).collect();
        assert_eq!(rest, [2, 3]);
    }

    #[test]
    fn test_write_after_consumer_gone() {
        let (mut producer, consumer) = ring(4);
        drop(consumer);
        assert!(!producer.write(event(1)));
    }

    #[test]
    fn test_concurrent_producers() {
        let (producer, mut consumer) = ring(64);
        let handles: Vec<_> = (0..4)
            .map(|cpu| {
                let mut p = producer.for_context(cpu);
                thread::spawn(move || (0..100).filter(|fd| p.write(event(*fd))).count())
            })
            .collect();
        let accepted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();

        let events: Vec<SyscallEvent> = consumer.read_batch(usize::MAX).collect();
        assert_eq!(events.len(), accepted);
        assert_eq!(accepted as u64 + consumer.dropped_count(), 400);

        // Per-context order is preserved
        for cpu in 0..4 {
            let seqs: Vec<u64> =
                events.iter().filter(|e| e.cpu_id == cpu).map(|e| e.sequence).collect();
            assert!(seqs.windows(2).all(|w| w[0] < w[1]));
        }
    }
}
