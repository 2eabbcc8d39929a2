//! Structured error types for epoll-spy
//!
//! Using thiserror for automatic Display implementation and error chaining.
//! Attach-time failures are [`ProbeError`]s and map onto CLI exit codes;
//! sink failures are [`SinkError`]s and never stop the collector.

use std::error::Error as StdError;
use std::io;
use thiserror::Error;

pub const EXIT_SUCCESS: i32 = 0;
pub const EXIT_ERROR: i32 = 1;
pub const EXIT_SYMBOL_NOT_FOUND: i32 = 2;
pub const EXIT_VERIFICATION_FAILED: i32 = 3;
pub const EXIT_PERMISSION_DENIED: i32 = 4;
pub const EXIT_UNKNOWN_EVENT: i32 = 5;

#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("Unknown event: {0} (run `epoll-spy list` for the allow-list)")]
    UnknownEvent(String),

    #[error("Kernel does not expose symbol {symbol}")]
    SymbolNotFound { symbol: String },

    #[error("Verifier rejected program {program}: {log}")]
    VerificationFailed { program: String, log: String },

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Program {0} not found in eBPF object")]
    ProgramNotFound(String),

    #[error("Failed to load eBPF object: {0}")]
    LoadFailed(String),

    #[error("Failed to attach {program} to {symbol}: {error}")]
    AttachFailed { program: String, symbol: String, error: String },

    #[error("Failed to detach {program}: {error}")]
    DetachFailed { program: String, error: String },

    #[error("No probe is attached under handle {0}")]
    HandleNotAttached(u64),

    #[error("Map {0} not found in eBPF object")]
    MapNotFound(&'static str),

    #[error(transparent)]
    Map(#[from] aya::maps::MapError),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl ProbeError {
    /// Process exit code for this error kind
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::UnknownEvent(_) => EXIT_UNKNOWN_EVENT,
            Self::SymbolNotFound { .. } => EXIT_SYMBOL_NOT_FOUND,
            Self::VerificationFailed { .. } => EXIT_VERIFICATION_FAILED,
            Self::PermissionDenied(_) => EXIT_PERMISSION_DENIED,
            _ => EXIT_ERROR,
        }
    }
}

#[derive(Error, Debug)]
pub enum SinkError {
    #[error("Sink write failed: {0}")]
    Write(#[from] io::Error),

    #[error("Failed to serialize event: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Sink closed")]
    Closed,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Polling interval must be greater than zero")]
    ZeroPollInterval,

    #[error("Batch size must be greater than zero")]
    ZeroBatch,

    #[error("Ring buffer size {bytes} must be a power of two and a multiple of {page} bytes")]
    InvalidRingSize { bytes: u32, page: u32 },

    #[error("--override-return only applies to modify-return probes, {0} is not one")]
    OverrideNotSupported(String),
}

/// True if any error in the source chain is an `EPERM`/`EACCES` from the kernel
#[must_use]
pub fn is_permission_error(err: &(dyn StdError + 'static)) -> bool {
    let mut current = Some(err);
    while let Some(e) = current {
        if let Some(io_err) = e.downcast_ref::<io::Error>() {
            if io_err.kind() == io::ErrorKind::PermissionDenied
                || matches!(io_err.raw_os_error(), Some(libc::EPERM | libc::EACCES))
            {
                return true;
            }
        }
        current = e.source();
    }
    false
}
