//! # epoll-spy - eBPF `epoll_ctl` Tracer
//!
//! epoll-spy attaches small eBPF programs to the kernel's `epoll_ctl`
//! syscall entry point and streams every call (arguments, and the return
//! value where available) to stdout as text or JSON lines.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                  Traced processes (any CPU)                     │
//! └───────────────────────┬─────────────────────────────────────────┘
//!                         │ epoll_ctl(2)
//!                         ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     eBPF Programs (Kernel)                      │
//! │  • kprobe  epoll_ctl_monitor  (modify-return, observe only)     │
//! │  • kprobe  epoll_ctl_monitor_override (--override-return only)  │
//! │  • fentry  epoll_ctl_entry                                      │
//! │  • fexit   epoll_ctl_return                                     │
//! └───────────────────────┬─────────────────────────────────────────┘
//!                         │ EVENTS ring buffer (drop on full → DROPPED)
//!                         ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     epoll-spy (This Crate)                      │
//! │                                                                 │
//! │  ┌──────────────┐   ┌──────────────┐   ┌──────────────┐         │
//! │  │   Loader     │──▶│  Collector   │──▶│    Sink      │         │
//! │  │ (attach/     │   │ (poll, decode│   │ (text/json)  │         │
//! │  │  detach)     │   │  sequence)   │   │              │         │
//! │  └──────────────┘   └──────────────┘   └──────────────┘         │
//! │         ▲                                                       │
//! │  ┌──────────────┐                                               │
//! │  │  Registry    │  logical name → {arch}sys_epoll_ctl           │
//! │  └──────────────┘                                               │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Structure
//!
//! - [`registry`]: Allow-list of attachable events and per-architecture
//!   symbol resolution
//! - [`loader`]: Verify, load, attach and detach probe programs
//!   - `ebpf`: aya backend (kprobe / fentry / fexit)
//!   - `symbols`: kernel symbol table from `/proc/kallsyms`
//!   - `setup`: object loading, memlock, kernel-side configuration maps
//! - [`channel`]: Bounded drop-on-full event transport
//!   - `kernel`: the BPF ring buffer
//!   - `ring`: an in-process equivalent
//! - [`collector`]: Polling loop, sequence tracking and sinks
//! - [`event`]: Decoding raw records into named operations and flags
//! - [`config`]: Validated run configuration
//! - [`targets`]: `--follow` expansion of target processes
//! - [`preflight`]: Privilege and kernel version checks
//! - [`cli`]: Command-line argument parsing
//! - [`domain`]: Core domain types (Pid, Tid, CpuId) and errors
//!
//! ## Typical Usage
//!
//! ```bash
//! # Build the probes, then trace every epoll_ctl return on the system
//! cargo xtask build-ebpf --release
//! sudo ./epoll-spy attach epoll_ctl_return
//!
//! # One process and everything it spawns, as JSON lines
//! sudo ./epoll-spy attach epoll_ctl_entry --pid <PID> --follow --format json
//! ```

pub mod channel;
pub mod cli;
pub mod collector;
pub mod config;
pub mod domain;
pub mod event;
pub mod loader;
pub mod preflight;
pub mod registry;
pub mod targets;
