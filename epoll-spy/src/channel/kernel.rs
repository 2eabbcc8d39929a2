//! Kernel-backed transport: the `EVENTS` ring buffer map
//!
//! Probe programs append with `bpf_ringbuf_output`; when the buffer is full
//! the write fails and the program bumps its per-CPU `DROPPED` slot.

use aya::maps::{MapData, PerCpuArray, RingBuf};
use aya::Ebpf;
use epoll_spy_common::{SyscallEvent, DROPPED_MAP, EVENTS_MAP};
use log::{debug, warn};
use std::sync::atomic::{AtomicU64, Ordering};

use super::EventChannel;
use crate::domain::ProbeError;

/// Consumer of the kernel `EVENTS` ring buffer
pub struct KernelRing {
    ring: RingBuf<MapData>,
    dropped: PerCpuArray<MapData, u64>,
    /// Last successfully read drop total; keeps `dropped_count` monotonic
    last_dropped: AtomicU64,
}

impl KernelRing {
    /// Take the `EVENTS` and `DROPPED` maps out of a loaded object.
    ///
    /// The maps keep their kernel references after the probes detach, so
    /// events written by in-flight triggers can still be drained.
    ///
    /// # Errors
    /// Returns an error if either map is missing or has the wrong type
    pub fn from_ebpf(ebpf: &mut Ebpf) -> Result<Self, ProbeError> {
        let ring =
            RingBuf::try_from(ebpf.take_map(EVENTS_MAP).ok_or(ProbeError::MapNotFound(EVENTS_MAP))?)?;
        let dropped = PerCpuArray::try_from(
            ebpf.take_map(DROPPED_MAP).ok_or(ProbeError::MapNotFound(DROPPED_MAP))?,
        )?;
        Ok(Self { ring, dropped, last_dropped: AtomicU64::new(0) })
    }
}

impl EventChannel for KernelRing {
    fn read_batch(&mut self, max_n: usize) -> impl Iterator<Item = SyscallEvent> + '_ {
        KernelBatch { ring: &mut self.ring, remaining: max_n }
    }

    fn dropped_count(&self) -> u64 {
        match self.dropped.get(&0, 0) {
            Ok(per_cpu) => {
                let total: u64 = per_cpu.iter().sum();
                self.last_dropped.fetch_max(total, Ordering::Relaxed).max(total)
            }
            Err(e) => {
                debug!("Failed to read {DROPPED_MAP}: {e}");
                self.last_dropped.load(Ordering::Relaxed)
            }
        }
    }
}

struct KernelBatch<'a> {
    ring: &'a mut RingBuf<MapData>,
    remaining: usize,
}

impl Iterator for KernelBatch<'_> {
    type Item = SyscallEvent;

    fn next(&mut self) -> Option<SyscallEvent> {
        while self.remaining > 0 {
            let item = self.ring.next()?;
            self.remaining -= 1;
            match parse_event(&item) {
                Some(event) => return Some(event),
                None => warn!("Received incomplete event ({} bytes)", item.len()),
            }
        }
        None
    }
}

/// Copy a [`SyscallEvent`] out of a ring buffer record
#[must_use]
pub fn parse_event(bytes: &[u8]) -> Option<SyscallEvent> {
    if bytes.len() < std::mem::size_of::<SyscallEvent>() {
        return None;
    }

    // SAFETY: length checked above; SyscallEvent is repr(C) plain data valid for any bit pattern
    #[allow(unsafe_code)]
    let event = unsafe { std::ptr::read_unaligned(bytes.as_ptr().cast::<SyscallEvent>()) };
    Some(event)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[allow(unsafe_code)]
    fn as_bytes(event: &SyscallEvent) -> Vec<u8> {
        let ptr = std::ptr::from_ref(event).cast::<u8>();
        unsafe { std::slice::from_raw_parts(ptr, std::mem::size_of::<SyscallEvent>()) }.to_vec()
    }

    #[test]
    fn test_event_layout_size() {
        assert_eq!(std::mem::size_of::<SyscallEvent>(), 64);
    }

    #[test]
    fn test_parse_event() {
        let event = SyscallEvent { pid: 7, fd: 12, sequence: 3, ..SyscallEvent::default() };
        assert_eq!(parse_event(&as_bytes(&event)), Some(event));
    }

    #[test]
    fn test_parse_unaligned() {
        let event = SyscallEvent { pid: 9, return_value: -1, ..SyscallEvent::default() };
        let mut bytes = vec![0u8];
        bytes.extend(as_bytes(&event));
        assert_eq!(parse_event(&bytes[1..]), Some(event));
    }

    #[test]
    fn test_parse_short_record() {
        let bytes = as_bytes(&SyscallEvent::default());
        assert_eq!(parse_event(&bytes[..32]), None);
        assert_eq!(parse_event(&[]), None);
    }
}
