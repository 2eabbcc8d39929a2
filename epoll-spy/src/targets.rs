//! Target process discovery
//!
//! Expands `--pid` targets with their threads and descendant processes by
//! reading the /proc filesystem. Processes can exit at any point during
//! the walk; those are skipped rather than reported.

use anyhow::{Context, Result};
use log::{debug, info};
use std::collections::{BTreeSet, VecDeque};
use std::fs;

use crate::domain::{Pid, Tid};

/// List thread IDs of `pid` from /proc/pid/task
///
/// # Errors
/// Returns an error if the task directory cannot be read
pub fn list_threads(pid: Pid) -> Result<Vec<Tid>> {
    let task_dir = format!("/proc/{}/task", pid.0);
    let entries = fs::read_dir(&task_dir).context(format!("Failed to read {task_dir}"))?;

    let mut tids: Vec<Tid> = entries
        .filter_map(|entry| {
            let entry = entry.ok()?;
            entry.file_name().to_str()?.parse::<u32>().ok().map(Tid)
        })
        .collect();
    tids.sort_unstable();
    Ok(tids)
}

/// Direct children of one thread, from /proc/pid/task/tid/children
fn thread_children(pid: Pid, tid: Tid) -> Vec<Pid> {
    let path = format!("/proc/{}/task/{}/children", pid.0, tid.0);
    match fs::read_to_string(&path) {
        Ok(contents) => parse_pid_list(&contents),
        Err(e) => {
            debug!("Skipping {path}: {e}");
            Vec::new()
        }
    }
}

/// Parse a whitespace-separated PID list as found in `children`
fn parse_pid_list(contents: &str) -> Vec<Pid> {
    contents.split_whitespace().filter_map(|s| s.parse().ok()).map(Pid).collect()
}

/// Resolve the final set of IDs for the kernel PID filter.
///
/// Without `follow` the targets are returned as given. With it, every
/// target contributes its threads and, recursively, its child processes
/// and their threads.
///
/// # Errors
/// Returns an error if a requested target cannot be inspected
pub fn expand_targets(pids: &[u32], follow: bool) -> Result<Vec<u32>> {
    let mut ids: BTreeSet<u32> = pids.iter().copied().collect();
    if !follow {
        return Ok(ids.into_iter().collect());
    }

    let mut seen: BTreeSet<u32> = BTreeSet::new();
    let mut queue: VecDeque<(Pid, bool)> = pids.iter().map(|&p| (Pid(p), true)).collect();

    while let Some((pid, requested)) = queue.pop_front() {
        if !seen.insert(pid.0) {
            continue;
        }

        let threads = match list_threads(pid) {
            Ok(threads) => threads,
            Err(e) if requested => return Err(e),
            Err(e) => {
                debug!("Child {pid} vanished: {e:#}");
                continue;
            }
        };

        ids.insert(pid.0);
        for tid in threads {
            ids.insert(tid.0);
            for child in thread_children(pid, tid) {
                if !seen.contains(&child.0) {
                    debug!("Following child {child} of {pid}");
                    queue.push_back((child, false));
                }
            }
        }
    }

    info!("Following {} targets: {} PIDs/TIDs", pids.len(), ids.len());
    Ok(ids.into_iter().collect())
}
