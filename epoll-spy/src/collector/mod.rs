//! # Event Collector
//!
//! Cooperative polling loop between a transport channel and a sink.
//!
//! ```text
//!   EventChannel ──read_batch──▶ decode ──▶ SequenceTracker ──▶ EventSink::emit
//!        ▲                                                           │
//!        └───────────── sleep(poll_interval) ◀────── flush ◀─────────┘
//! ```
//!
//! Sink and decode failures are counted and logged; neither stops the
//! loop. [`Collector::run`] returns when the loader leaves
//! [`SessionState::Attached`] or its state channel closes. A caller-side
//! stop (ctrl-c, duration) is done by dropping the `run` future, which is
//! only ever suspended between polls.

pub mod sink;

use epoll_spy_common::SyscallEvent;
use log::{debug, info, warn};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::watch;

use crate::channel::EventChannel;
use crate::event::EpollCtlEvent;
use crate::loader::SessionState;

pub use sink::{EventSink, JsonSink, TextSink};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);
pub const DEFAULT_MAX_BATCH: usize = 1024;

const IDLE_NOTICE: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CollectorConfig {
    pub poll_interval: Duration,
    /// Upper bound on events taken per `read_batch`
    pub max_batch: usize,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self { poll_interval: DEFAULT_POLL_INTERVAL, max_batch: DEFAULT_MAX_BATCH }
    }
}

/// Counters accumulated over the collector's lifetime
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CollectorStats {
    /// Raw records taken off the channel
    pub received: u64,
    /// Events the sink accepted
    pub emitted: u64,
    pub sink_failures: u64,
    pub decode_failures: u64,
    /// Sequence numbers skipped by a producer context, i.e. lost events
    pub sequence_gaps: u64,
    /// Events that arrived at or below their context's last sequence
    pub reordered: u64,
}

/// Outcome of checking one sequence number
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceCheck {
    /// First event seen from this context
    First,
    InOrder,
    /// This many sequence numbers were skipped
    Gap(u64),
    Reordered,
}

/// Per-context sequence bookkeeping, keyed by CPU
#[derive(Debug, Default)]
pub struct SequenceTracker {
    last: HashMap<u32, u64>,
}

impl SequenceTracker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&mut self, context: u32, sequence: u64) -> SequenceCheck {
        let Some(last) = self.last.get_mut(&context) else {
            self.last.insert(context, sequence);
            return SequenceCheck::First;
        };

        if sequence <= *last {
            return SequenceCheck::Reordered;
        }

        let skipped = sequence - *last - 1;
        *last = sequence;
        if skipped == 0 {
            SequenceCheck::InOrder
        } else {
            SequenceCheck::Gap(skipped)
        }
    }
}

pub struct Collector<S: EventSink> {
    sink: S,
    config: CollectorConfig,
    stats: CollectorStats,
    sequences: SequenceTracker,
}

impl<S: EventSink> Collector<S> {
    pub fn new(sink: S, config: CollectorConfig) -> Self {
        Self { sink, config, stats: CollectorStats::default(), sequences: SequenceTracker::new() }
    }

    #[must_use]
    pub fn config(&self) -> CollectorConfig {
        self.config
    }

    #[must_use]
    pub fn stats(&self) -> CollectorStats {
        self.stats
    }

    pub fn into_sink(self) -> S {
        self.sink
    }

    /// Read one batch and forward it to the sink
    ///
    /// Returns the number of records taken off the channel.
    pub fn poll_once<C: EventChannel>(&mut self, channel: &mut C) -> usize {
        let mut taken = 0;
        for raw in channel.read_batch(self.config.max_batch) {
            taken += 1;
            self.handle(raw);
        }

        if taken > 0 {
            if let Err(e) = self.sink.flush() {
                warn!("Sink flush failed: {e}");
            }
        }
        taken
    }

    /// Poll until the channel is empty; used after the probes are detached
    pub fn drain<C: EventChannel>(&mut self, channel: &mut C) -> usize {
        let mut total = 0;
        loop {
            let taken = self.poll_once(channel);
            if taken == 0 {
                return total;
            }
            total += taken;
        }
    }

    /// Collect what is still queued once detaching is over.
    ///
    /// A probe that failed to detach may still be producing, so the channel
    /// might never run empty; in that case only a single batch is taken.
    pub fn finish<C: EventChannel>(&mut self, channel: &mut C, detached: bool) -> usize {
        if detached {
            self.drain(channel)
        } else {
            self.poll_once(channel)
        }
    }

    /// Poll every `poll_interval` while the loader reports `Attached`
    pub async fn run<C: EventChannel>(
        &mut self,
        channel: &mut C,
        mut state: watch::Receiver<SessionState>,
    ) {
        let mut last_notice = Instant::now();

        loop {
            let current = *state.borrow_and_update();
            if current != SessionState::Attached {
                debug!("Collector stopping, loader is {current:?}");
                return;
            }

            self.poll_once(channel);

            if self.stats.received == 0 && last_notice.elapsed() > IDLE_NOTICE {
                info!("Still waiting for events... (no events received yet)");
                last_notice = Instant::now();
            }

            tokio::select! {
                () = tokio::time::sleep(self.config.poll_interval) => {}
                changed = state.changed() => {
                    if changed.is_err() {
                        debug!("Loader gone, collector stopping");
                        return;
                    }
                }
            }
        }
    }

    fn handle(&mut self, raw: SyscallEvent) {
        self.stats.received += 1;

        match self.sequences.observe(raw.cpu_id, raw.sequence) {
            SequenceCheck::Gap(n) => {
                debug!("CPU {} skipped {n} events before sequence {}", raw.cpu_id, raw.sequence);
                self.stats.sequence_gaps += n;
            }
            SequenceCheck::Reordered => self.stats.reordered += 1,
            SequenceCheck::First | SequenceCheck::InOrder => {}
        }

        let event = match EpollCtlEvent::try_from(raw) {
            Ok(event) => event,
            Err(e) => {
                warn!("Dropping record with unknown probe kind {}", e.0);
                self.stats.decode_failures += 1;
                return;
            }
        };

        match self.sink.emit(&event) {
            Ok(()) => self.stats.emitted += 1,
            Err(e) => {
                debug!("Sink rejected event {}: {e}", event.sequence);
                if self.stats.sink_failures == 0 {
                    warn!("Sink failed, continuing to consume: {e}");
                }
                self.stats.sink_failures += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::event_ring;
    use crate::domain::SinkError;
    use crate::event::tests::raw_event;
    use std::collections::VecDeque;
    use std::num::NonZeroUsize;

    /// Channel fed with hand-built records, sequence numbers included
    struct ScriptedChannel(VecDeque<SyscallEvent>);

    impl EventChannel for ScriptedChannel {
        fn read_batch(&mut self, max_n: usize) -> impl Iterator<Item = SyscallEvent> + '_ {
            std::iter::from_fn(|| self.0.pop_front()).take(max_n)
        }

        fn dropped_count(&self) -> u64 {
            0
        }
    }

    #[derive(Default)]
    struct RecordingSink(Vec<EpollCtlEvent>);

    impl EventSink for RecordingSink {
        fn emit(&mut self, event: &EpollCtlEvent) -> Result<(), SinkError> {
            self.0.push(event.clone());
            Ok(())
        }
    }

    struct FailingSink;

    impl EventSink for FailingSink {
        fn emit(&mut self, _event: &EpollCtlEvent) -> Result<(), SinkError> {
            Err(SinkError::Closed)
        }

        fn flush(&mut self) -> Result<(), SinkError> {
            Err(SinkError::Closed)
        }
    }

    /// A channel some producer keeps refilling faster than it is read
    struct EndlessChannel {
        next_sequence: u64,
    }

    impl EventChannel for EndlessChannel {
        fn read_batch(&mut self, max_n: usize) -> impl Iterator<Item = SyscallEvent> + '_ {
            std::iter::repeat_with(|| {
                self.next_sequence += 1;
                raw_event(0, self.next_sequence)
            })
            .take(max_n)
        }

        fn dropped_count(&self) -> u64 {
            0
        }
    }

    fn batch_config(max_batch: usize) -> CollectorConfig {
        CollectorConfig { poll_interval: Duration::from_millis(5), max_batch }
    }

    #[test]
    fn test_sequence_tracker() {
        let mut tracker = SequenceTracker::new();
        assert_eq!(tracker.observe(0, 5), SequenceCheck::First);
        assert_eq!(tracker.observe(0, 6), SequenceCheck::InOrder);
        assert_eq!(tracker.observe(1, 1), SequenceCheck::First);
        assert_eq!(tracker.observe(0, 9), SequenceCheck::Gap(2));
        assert_eq!(tracker.observe(0, 8), SequenceCheck::Reordered);
        assert_eq!(tracker.observe(0, 10), SequenceCheck::InOrder);
    }

    #[test]
    fn test_failing_sink_still_drains() {
        let (mut producer, mut consumer) = event_ring(NonZeroUsize::new(8).unwrap());
        for _ in 0..8 {
            assert!(producer.write(raw_event(0, 0)));
        }

        let mut collector = Collector::new(FailingSink, batch_config(3));
        assert_eq!(collector.poll_once(&mut consumer), 3);
        assert_eq!(collector.poll_once(&mut consumer), 3);
        assert_eq!(collector.poll_once(&mut consumer), 2);
        assert_eq!(collector.poll_once(&mut consumer), 0);

        assert_eq!(consumer.pending(), 0);
        let stats = collector.stats();
        assert_eq!(stats.received, 8);
        assert_eq!(stats.emitted, 0);
        assert_eq!(stats.sink_failures, 8);

        // Still usable after failures
        assert!(producer.write(raw_event(0, 0)));
        assert_eq!(collector.poll_once(&mut consumer), 1);
        assert_eq!(collector.stats().sink_failures, 9);
    }

    #[test]
    fn test_gaps_and_reordering_counted_per_context() {
        let records = [raw_event(0, 1), raw_event(1, 1), raw_event(0, 4), raw_event(0, 3), raw_event(1, 2)];
        let mut channel = ScriptedChannel(records.into_iter().collect());

        let mut collector = Collector::new(RecordingSink::default(), batch_config(16));
        assert_eq!(collector.drain(&mut channel), 5);

        let stats = collector.stats();
        assert_eq!(stats.sequence_gaps, 2);
        assert_eq!(stats.reordered, 1);
        // Out-of-order events are still forwarded
        assert_eq!(stats.emitted, 5);
        assert_eq!(collector.into_sink().0.len(), 5);
    }

    #[test]
    fn test_unknown_probe_kind_skipped() {
        let mut bad = raw_event(0, 2);
        bad.probe_kind = 42;
        let mut channel = ScriptedChannel([raw_event(0, 1), bad, raw_event(0, 3)].into_iter().collect());

        let mut collector = Collector::new(RecordingSink::default(), batch_config(16));
        collector.drain(&mut channel);

        let stats = collector.stats();
        assert_eq!(stats.received, 3);
        assert_eq!(stats.decode_failures, 1);
        assert_eq!(stats.emitted, 2);
        assert_eq!(stats.sequence_gaps, 0);
    }

    #[test]
    fn test_batch_limit_leaves_rest_queued() {
        let (mut producer, mut consumer) = event_ring(NonZeroUsize::new(16).unwrap());
        for _ in 0..10 {
            producer.write(raw_event(0, 0));
        }

        let mut collector = Collector::new(RecordingSink::default(), batch_config(4));
        assert_eq!(collector.poll_once(&mut consumer), 4);
        assert_eq!(consumer.pending(), 6);
        assert_eq!(collector.drain(&mut consumer), 6);

        let sequences: Vec<u64> = collector.into_sink().0.iter().map(|e| e.sequence).collect();
        assert_eq!(sequences, (1..=10).collect::<Vec<_>>());
    }

    #[test]
    fn test_finish_after_failed_detach_takes_one_batch() {
        let mut channel = EndlessChannel { next_sequence: 0 };
        let mut collector = Collector::new(RecordingSink::default(), batch_config(8));

        assert_eq!(collector.finish(&mut channel, false), 8);
        assert_eq!(collector.stats().emitted, 8);
        assert_eq!(collector.stats().sequence_gaps, 0);
    }

    #[test]
    fn test_finish_after_detach_drains_everything() {
        let records = (1..=20).map(|seq| raw_event(0, seq)).collect();
        let mut channel = ScriptedChannel(records);
        let mut collector = Collector::new(RecordingSink::default(), batch_config(8));

        assert_eq!(collector.finish(&mut channel, true), 20);
        assert!(channel.0.is_empty());
        assert_eq!(collector.into_sink().0.len(), 20);
    }

    #[tokio::test]
    async fn test_run_stops_on_detach() {
        let (mut producer, mut consumer) = event_ring(NonZeroUsize::new(16).unwrap());
        for _ in 0..3 {
            producer.write(raw_event(0, 0));
        }

        let (state_tx, state_rx) = watch::channel(SessionState::Attached);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            state_tx.send_replace(SessionState::Detaching);
            // Keep the sender alive until the collector has seen the change
            tokio::time::sleep(Duration::from_millis(100)).await;
        });

        let mut collector = Collector::new(RecordingSink::default(), batch_config(16));
        collector.run(&mut consumer, state_rx).await;

        assert_eq!(collector.stats().emitted, 3);
    }

    #[tokio::test]
    async fn test_run_requires_attached_state() {
        let (mut producer, mut consumer) = event_ring(NonZeroUsize::new(4).unwrap());
        producer.write(raw_event(0, 0));

        let (_state_tx, state_rx) = watch::channel(SessionState::Unattached);
        let mut collector = Collector::new(RecordingSink::default(), batch_config(16));
        collector.run(&mut consumer, state_rx).await;

        assert_eq!(collector.stats().received, 0);
        assert_eq!(consumer.pending(), 1);
    }
}
