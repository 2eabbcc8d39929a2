//! # Event Transport Channel
//!
//! Bounded, drop-on-full queues carrying [`SyscallEvent`]s from probe
//! contexts to the single collector.
//!
//! - [`ring`]: in-process ring (lock-free bounded queue), many producers
//! - [`kernel`]: the `EVENTS` BPF ring buffer plus the per-CPU `DROPPED` counter
//!
//! Both reject the incoming event when full rather than evicting unread
//! ones, so only the consumer ever advances the read position.

pub mod kernel;
pub mod ring;

use epoll_spy_common::SyscallEvent;

pub use kernel::KernelRing;
pub use ring::{event_ring, RingConsumer, RingProducer};

/// Consumer side of a transport channel
pub trait EventChannel {
    /// Dequeue up to `max_n` pending events.
    ///
    /// The returned iterator is lazy: events are removed from the channel
    /// only as it is advanced, and whatever it did not yield stays queued.
    fn read_batch(&mut self, max_n: usize) -> impl Iterator<Item = SyscallEvent> + '_;

    /// Total number of events dropped because the channel was full.
    /// Monotonic; never resets.
    fn dropped_count(&self) -> u64;
}
