//! # eBPF Kernel-Side Probes
//!
//! eBPF programs attached to the `epoll_ctl` syscall. Each program captures
//! the calling process and the syscall arguments into a [`SyscallEvent`] and
//! pushes it onto the `EVENTS` ring buffer.
//!
//! ## Programs
//!
//! - **KProbe**: `epoll_ctl_monitor` - Modify-return probe, observe only
//! - **KProbe**: `epoll_ctl_monitor_override` - Same, forcing the return value
//!   with `bpf_override_return` (loaded only for `--override-return`)
//! - **FEntry**: `epoll_ctl_entry` - Fires before the syscall body runs
//! - **FExit**: `epoll_ctl_return` - Fires after the syscall returns, captures the return value
//!
//! ## Maps (Shared with Userspace)
//!
//! - `EVENTS` - Ring buffer (256KB default, resized by userspace at load time)
//! - `DROPPED` - Per-CPU count of events rejected by a full ring buffer
//! - `SEQUENCE` - Per-CPU event sequence counter
//! - `CONFIG` - Runtime configuration (wrapper flag, `epoll_event` layout, PID filter, return override)
//! - `PIDS` - Target PIDs/TIDs when the PID filter is enabled
//!
//! ## Build
//!
//! ```bash
//! cargo xtask build-ebpf --release
//! ```

#![no_std]
#![no_main]
#![allow(unused_unsafe)]

mod epoll_ctl;

use aya_ebpf::{
    bindings::pt_regs,
    helpers::{bpf_get_current_pid_tgid, bpf_ktime_get_ns, gen::bpf_get_smp_processor_id},
    macros::{fentry, fexit, kprobe, map},
    maps::{HashMap, PerCpuArray, RingBuf},
    programs::{FEntryContext, FExitContext, ProbeContext},
};
use aya_log_ebpf::debug;
use epoll_ctl::EpollCtlArgs;
use epoll_spy_common::{
    SyscallEvent, CONFIG_OVERRIDE_ENABLED, CONFIG_OVERRIDE_VALUE, CONFIG_PACKED_EPOLL_EVENT,
    CONFIG_PID_FILTER, CONFIG_SYSCALL_WRAPPER, DEFAULT_RING_BYTES, PROBE_KIND_ENTRY,
    PROBE_KIND_MODIFY_RETURN, PROBE_KIND_RETURN,
};

#[link_section = "license"]
#[used]
pub static LICENSE: [u8; 13] = *b"Dual MIT/GPL\0";

// ============================================================================
// eBPF Maps - Shared data structures between kernel and userspace
// ============================================================================

/// Ring buffer for sending events to userspace
///
/// - **Size**: 256KB unless userspace overrides it with `set_max_entries`
/// - **Overflow**: `output()` fails, the event is counted in `DROPPED`
#[map]
static EVENTS: RingBuf = RingBuf::with_byte_size(DEFAULT_RING_BYTES, 0);

/// Number of events the ring buffer rejected, per CPU
#[map]
static DROPPED: PerCpuArray<u64> = PerCpuArray::with_max_entries(1, 0);

/// Per-CPU sequence counter; incremented on every trigger so drops leave gaps
#[map]
static SEQUENCE: PerCpuArray<u64> = PerCpuArray::with_max_entries(1, 0);

/// Map: Config key → Config value (see `CONFIG_*` in `epoll-spy-common`)
#[map]
static CONFIG: HashMap<u32, u64> = HashMap::with_max_entries(16, 0);

/// Map: PID or TID → 1, consulted only when `CONFIG_PID_FILTER` is set
#[map]
static PIDS: HashMap<u32, u8> = HashMap::with_max_entries(4096, 0);

// ============================================================================
// eBPF Program Hooks
// ============================================================================

/// Hook: `<arch>sys_epoll_ctl` via kprobe
#[kprobe]
pub fn epoll_ctl_monitor(ctx: ProbeContext) -> u32 {
    match try_epoll_ctl_monitor::<false>(&ctx) {
        Ok(()) => 0,
        Err(_) => 1,
    }
}

/// Hook: `<arch>sys_epoll_ctl` via kprobe, overriding the return value.
///
/// Needs `CONFIG_BPF_KPROBE_OVERRIDE`; the kernel refuses to load it otherwise.
#[kprobe]
pub fn epoll_ctl_monitor_override(ctx: ProbeContext) -> u32 {
    match try_epoll_ctl_monitor::<true>(&ctx) {
        Ok(()) => 0,
        Err(_) => 1,
    }
}

/// `OVERRIDE` is a const so `bpf_override_return` is compiled out of the
/// observe-only program
fn try_epoll_ctl_monitor<const OVERRIDE: bool>(ctx: &ProbeContext) -> Result<(), i64> {
    let Some((pid, tid)) = traced_task() else {
        return Ok(());
    };

    let args = if syscall_wrapped() {
        let regs: *mut pt_regs = ctx.arg(0).ok_or(1i64)?;
        EpollCtlArgs::from_regs(regs).ok_or(1i64)?
    } else {
        EpollCtlArgs::from_probe(ctx).ok_or(1i64)?
    };

    let mut event = new_event(PROBE_KIND_MODIFY_RETURN, pid, tid, &args);

    if OVERRIDE && config(CONFIG_OVERRIDE_ENABLED) != 0 {
        let rc = config(CONFIG_OVERRIDE_VALUE);
        unsafe {
            aya_ebpf::helpers::gen::bpf_override_return(ctx.regs, rc);
        }
        event.return_value = rc as i64;
        event.has_return = 1;
    }

    debug!(ctx, "epoll_ctl from pid {}", pid);
    submit(&event);
    Ok(())
}

/// Hook: `<arch>sys_epoll_ctl` via fentry
#[fentry]
pub fn epoll_ctl_entry(ctx: FEntryContext) -> u32 {
    match try_epoll_ctl_entry(&ctx) {
        Ok(()) => 0,
        Err(_) => 1,
    }
}

fn try_epoll_ctl_entry(ctx: &FEntryContext) -> Result<(), i64> {
    let Some((pid, tid)) = traced_task() else {
        return Ok(());
    };

    let args = if syscall_wrapped() {
        let regs: *mut pt_regs = unsafe { ctx.arg(0) };
        EpollCtlArgs::from_regs(regs).ok_or(1i64)?
    } else {
        unsafe { EpollCtlArgs::new(ctx.arg(0), ctx.arg(1), ctx.arg(2), ctx.arg(3)) }
    };

    submit(&new_event(PROBE_KIND_ENTRY, pid, tid, &args));
    Ok(())
}

/// Hook: `<arch>sys_epoll_ctl` via fexit, captures the return value
#[fexit]
pub fn epoll_ctl_return(ctx: FExitContext) -> u32 {
    match try_epoll_ctl_return(&ctx) {
        Ok(()) => 0,
        Err(_) => 1,
    }
}

fn try_epoll_ctl_return(ctx: &FExitContext) -> Result<(), i64> {
    let Some((pid, tid)) = traced_task() else {
        return Ok(());
    };

    // The return value follows the last argument: one `pt_regs *` for
    // wrapped syscalls, four longs otherwise.
    let (args, return_value) = if syscall_wrapped() {
        let regs: *mut pt_regs = unsafe { ctx.arg(0) };
        let ret: i64 = unsafe { ctx.arg(1) };
        (EpollCtlArgs::from_regs(regs).ok_or(1i64)?, ret)
    } else {
        let args = unsafe { EpollCtlArgs::new(ctx.arg(0), ctx.arg(1), ctx.arg(2), ctx.arg(3)) };
        let ret: i64 = unsafe { ctx.arg(4) };
        (args, ret)
    };

    let mut event = new_event(PROBE_KIND_RETURN, pid, tid, &args);
    event.return_value = return_value;
    event.has_return = 1;
    submit(&event);
    Ok(())
}

// ============================================================================
// Helpers
// ============================================================================

fn config(key: u32) -> u64 {
    unsafe { CONFIG.get(&key).copied().unwrap_or(0) }
}

fn syscall_wrapped() -> bool {
    config(CONFIG_SYSCALL_WRAPPER) != 0
}

/// Returns `(pid, tid)` of the current task if it passes the PID filter
fn traced_task() -> Option<(u32, u32)> {
    let pid_tgid = unsafe { bpf_get_current_pid_tgid() };
    let pid = (pid_tgid >> 32) as u32;
    let tid = pid_tgid as u32;

    if config(CONFIG_PID_FILTER) != 0 {
        let known = unsafe { PIDS.get(&pid).is_some() || PIDS.get(&tid).is_some() };
        if !known {
            return None;
        }
    }

    Some((pid, tid))
}

fn next_sequence() -> u64 {
    match SEQUENCE.get_ptr_mut(0) {
        Some(seq) => unsafe {
            *seq += 1;
            *seq
        },
        None => 0,
    }
}

fn new_event(probe_kind: u8, pid: u32, tid: u32, args: &EpollCtlArgs) -> SyscallEvent {
    let (events, data) = args.read_epoll_event(config(CONFIG_PACKED_EPOLL_EVENT) != 0);

    SyscallEvent {
        timestamp_ns: unsafe { bpf_ktime_get_ns() },
        sequence: next_sequence(),
        pid,
        tid,
        cpu_id: unsafe { bpf_get_smp_processor_id() },
        probe_kind,
        has_return: 0,
        _padding: [0u8; 2],
        epfd: args.epfd,
        op: args.op,
        fd: args.fd,
        events,
        data,
        return_value: 0,
    }
}

/// Push an event onto the ring buffer, counting it in `DROPPED` when full
fn submit(event: &SyscallEvent) {
    if EVENTS.output(event, 0).is_err() {
        if let Some(dropped) = DROPPED.get_ptr_mut(0) {
            unsafe { *dropped += 1 };
        }
    }
}

#[cfg(all(not(test), target_os = "none"))]
#[panic_handler]
fn panic(_info: &core::panic::PanicInfo) -> ! {
    unsafe { core::hint::unreachable_unchecked() }
}
