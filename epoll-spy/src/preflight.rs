//! Pre-flight checks for epoll-spy
//!
//! Validates system requirements before attempting to load eBPF programs.
//! Provides clear, actionable error messages when requirements aren't met.

#![allow(unsafe_code)] // geteuid() requires unsafe

use anyhow::{bail, Context, Result};
use std::path::Path;

use crate::domain::ProbeError;

/// Minimum kernel version required for the BPF ring buffer
const MIN_KERNEL_VERSION: (u32, u32) = (5, 8);

/// Capability bits from linux/capability.h
const CAP_SYS_ADMIN: u32 = 21;
const CAP_BPF: u32 = 39;

/// Run all pre-flight checks before eBPF loading
///
/// # Errors
/// `ProbeError::PermissionDenied` without the needed privileges, otherwise
/// a descriptive error for an old kernel or a missing target process
pub fn run_preflight_checks(pids: &[u32]) -> Result<()> {
    check_privileges()?;
    check_kernel_version()?;
    for &pid in pids {
        check_process_exists(pid)?;
    }
    Ok(())
}

/// Check if running with sufficient privileges for eBPF
fn check_privileges() -> Result<(), ProbeError> {
    if unsafe { libc::geteuid() } == 0 {
        return Ok(());
    }

    // CAP_BPF (5.8+) or the older catch-all CAP_SYS_ADMIN
    let effective = std::fs::read_to_string("/proc/self/status")
        .ok()
        .and_then(|status| effective_capabilities(&status))
        .unwrap_or(0);
    if has_capability(effective, CAP_BPF) || has_capability(effective, CAP_SYS_ADMIN) {
        return Ok(());
    }

    Err(ProbeError::PermissionDenied(
        "epoll-spy requires root (or CAP_BPF) to load eBPF programs.\n\n\
         Run with: sudo epoll-spy ..."
            .to_string(),
    ))
}

/// Parse the `CapEff:` line of /proc/self/status
fn effective_capabilities(status: &str) -> Option<u64> {
    let line = status.lines().find(|l| l.starts_with("CapEff:"))?;
    u64::from_str_radix(line.trim_start_matches("CapEff:").trim(), 16).ok()
}

fn has_capability(mask: u64, cap: u32) -> bool {
    mask & (1u64 << cap) != 0
}

/// Parse `major.minor` from a release string like "6.1.0-arch1-1"
fn parse_kernel_release(release: &str) -> Option<(u32, u32)> {
    let mut parts = release.split('.');
    let major = parts.next()?.parse().ok()?;
    let minor = parts
        .next()?
        .chars()
        .take_while(char::is_ascii_digit)
        .collect::<String>()
        .parse()
        .ok()?;
    Some((major, minor))
}

/// Check if the kernel version is sufficient for eBPF features
fn check_kernel_version() -> Result<()> {
    let version_str = std::fs::read_to_string("/proc/version")
        .context("Failed to read kernel version from /proc/version")?;

    // Parse version like "Linux version 5.15.0-generic ..."
    let release = version_str.split_whitespace().nth(2).unwrap_or("unknown");

    let Some((major, minor)) = parse_kernel_release(release) else {
        // Can't parse, assume it's fine
        return Ok(());
    };

    if (major, minor) < MIN_KERNEL_VERSION {
        bail!(
            "Kernel version {}.{} is too old.\n\n\
             epoll-spy requires Linux {}.{} or newer for eBPF ring buffer support.\n\
             Current kernel: {}",
            major,
            minor,
            MIN_KERNEL_VERSION.0,
            MIN_KERNEL_VERSION.1,
            release
        );
    }

    Ok(())
}

/// Check if the target process exists
///
/// # Errors
/// Returns an error if /proc/pid is missing
pub fn check_process_exists(pid: u32) -> Result<()> {
    let proc_path = format!("/proc/{pid}");
    if !Path::new(&proc_path).exists() {
        bail!(
            "Process {pid} not found.\n\n\
             Is the process still running? Check with: ps -p {pid}"
        );
    }
    Ok(())
}
