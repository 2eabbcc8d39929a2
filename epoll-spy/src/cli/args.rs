//! CLI argument definitions

use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use crate::collector::DEFAULT_MAX_BATCH;
use epoll_spy_common::DEFAULT_RING_BYTES;

/// Compiled probe object produced by `cargo xtask build-ebpf --release`
pub const DEFAULT_OBJECT_PATH: &str = "target/bpfel-unknown-none/release/epoll-spy";

#[derive(Parser, Debug)]
#[command(
    name = "epoll-spy",
    version,
    about = "Trace epoll_ctl calls with eBPF",
    after_help = "\
EXAMPLES:
    sudo epoll-spy list                                 Show attachable events
    sudo epoll-spy attach epoll_ctl_return              Trace every process
    sudo epoll-spy attach epoll_ctl_entry --pid 1234    Trace one process
    sudo epoll-spy attach epoll_ctl_return --pid 1234 --follow --format json"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Attach a probe and stream its events until interrupted
    Attach(AttachArgs),
    /// Release probes (they are released automatically when `attach` exits)
    Detach,
    /// List the logical event names that can be attached
    List,
}

#[derive(Args, Debug, Clone)]
pub struct AttachArgs {
    /// Logical event name (see `epoll-spy list`)
    #[arg(value_name = "EVENT")]
    pub event: String,

    /// Only trace these process or thread IDs
    #[arg(short, long, value_delimiter = ',')]
    pub pid: Vec<u32>,

    /// Also trace threads and child processes of --pid
    #[arg(short, long, requires = "pid")]
    pub follow: bool,

    /// Stop after N seconds (0 = unlimited)
    #[arg(long, default_value = "0")]
    pub duration: u64,

    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,

    /// Size of the kernel event ring in bytes (power of two, page multiple)
    #[arg(long, default_value_t = DEFAULT_RING_BYTES)]
    pub ring_bytes: u32,

    /// Maximum events read per poll
    #[arg(long, default_value_t = DEFAULT_MAX_BATCH)]
    pub max_batch: usize,

    /// Milliseconds between polls of the event ring
    #[arg(long, env = "EPOLL_SPY_POLL_INTERVAL_MS", default_value = "100")]
    pub poll_interval_ms: u64,

    /// Force the traced call to return this value (modify-return probes only)
    #[arg(long, value_name = "RC", allow_hyphen_values = true)]
    pub override_return: Option<i64>,

    /// Path to the compiled eBPF object
    #[arg(long, env = "EPOLL_SPY_OBJECT", default_value = DEFAULT_OBJECT_PATH)]
    pub object: PathBuf,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    /// One decoded call per line
    #[default]
    Text,
    /// JSON lines
    Json,
}
