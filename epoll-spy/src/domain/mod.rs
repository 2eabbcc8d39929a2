//! Domain model for epoll-spy
//!
//! This module contains core domain types and errors that provide:
//! - Compile-time safety via newtype pattern
//! - Structured error handling with per-kind exit codes

pub mod errors;
pub mod types;

pub use types::{CpuId, Pid, Tid};

pub use errors::{ConfigError, ProbeError, SinkError};
