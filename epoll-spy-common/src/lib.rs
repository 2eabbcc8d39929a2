//! # Shared Data Structures (eBPF ↔ Userspace)
//!
//! Defines the event record and configuration keys shared between the
//! kernel-side probe programs and the userspace collector. All types use
//! `#[repr(C)]` for a consistent memory layout across the boundary.
//!
//! ## Key Types
//!
//! - [`SyscallEvent`] - One traced `epoll_ctl` call, passed via ring buffer
//!
//! ## Maps
//!
//! - `EVENTS` - Ring buffer carrying [`SyscallEvent`] records
//! - `DROPPED` - Per-CPU count of events the ring buffer rejected
//! - `SEQUENCE` - Per-CPU sequence counter stamped into each event
//! - `CONFIG` - Runtime configuration (see `CONFIG_*` keys)
//! - `PIDS` - Target process/thread IDs when the PID filter is enabled

#![no_std]

// ============================================================================
// Probe Kinds
// ============================================================================

/// Probe attached before the traced function runs (`fentry`)
pub const PROBE_KIND_ENTRY: u8 = 0;

/// Probe attached after the traced function returns (`fexit`)
pub const PROBE_KIND_RETURN: u8 = 1;

/// Probe that may override the traced function's return value (`kprobe` + override)
pub const PROBE_KIND_MODIFY_RETURN: u8 = 2;

// ============================================================================
// Map Names
// ============================================================================

pub const EVENTS_MAP: &str = "EVENTS";
pub const DROPPED_MAP: &str = "DROPPED";
pub const CONFIG_MAP: &str = "CONFIG";
pub const PIDS_MAP: &str = "PIDS";

/// Default `EVENTS` ring buffer size in bytes (must be a power-of-two multiple of the page size)
pub const DEFAULT_RING_BYTES: u32 = 256 * 1024;

// ============================================================================
// Configuration Keys (`CONFIG` map)
// ============================================================================

/// 1 if syscalls go through an architecture wrapper taking `struct pt_regs *`
pub const CONFIG_SYSCALL_WRAPPER: u32 = 0;

/// 1 if only PIDs present in the `PIDS` map should be traced
pub const CONFIG_PID_FILTER: u32 = 1;

/// 1 if modify-return probes should override the traced call's return value
pub const CONFIG_OVERRIDE_ENABLED: u32 = 2;

/// Return value (an `i64` stored as `u64`) used when the override is enabled
pub const CONFIG_OVERRIDE_VALUE: u32 = 3;

/// 1 if user space `struct epoll_event` is packed (12 bytes, x86_64 only)
pub const CONFIG_PACKED_EPOLL_EVENT: u32 = 4;

// ============================================================================
// Shared Data Structures
// ============================================================================

/// Event sent from eBPF to userspace via ring buffer
///
/// Written once by a probe program at trigger time and never mutated
/// afterwards. `sequence` is per-CPU, so a gap between two consecutive
/// events from the same `cpu_id` means the ring buffer dropped something.
///
/// **Memory Layout**: `#[repr(C)]`, 64 bytes, no implicit padding
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SyscallEvent {
    /// Monotonic timestamp from `bpf_ktime_get_ns()`
    pub timestamp_ns: u64,

    /// Per-CPU monotonic counter, incremented for every trigger (including dropped ones)
    pub sequence: u64,

    /// Process ID (TGID in Linux terms)
    pub pid: u32,

    /// Thread ID (PID in Linux terms)
    pub tid: u32,

    /// CPU that executed the probe; identifies the producer context
    pub cpu_id: u32,

    /// One of the `PROBE_KIND_*` constants
    pub probe_kind: u8,

    /// 1 if `return_value` holds a real value (return probes, or an applied override)
    pub has_return: u8,

    #[allow(clippy::pub_underscore_fields)]
    pub _padding: [u8; 2],

    /// `epoll_ctl` epoll file descriptor
    pub epfd: i32,

    /// `epoll_ctl` operation (`EPOLL_CTL_ADD` = 1, `DEL` = 2, `MOD` = 3)
    pub op: i32,

    /// Target file descriptor
    pub fd: i32,

    /// `epoll_event.events` mask (0 when no event was passed)
    pub events: u32,

    /// `epoll_event.data`
    pub data: u64,

    /// Syscall return value (valid when `has_return == 1`)
    pub return_value: i64,
}

#[cfg(feature = "user")]
use aya::Pod;

// Pod trait ensures types can be safely transmitted as plain bytes
#[cfg(feature = "user")]
#[allow(unsafe_code)]
unsafe impl Pod for SyscallEvent {}
