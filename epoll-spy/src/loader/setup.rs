//! # eBPF Object Loading and Configuration
//!
//! ## Functions
//!
//! - [`bump_memlock_rlimit()`] - Lift `RLIMIT_MEMLOCK` for pre-5.11 kernels
//! - [`load_ebpf_object()`] - Load the compiled object with the configured ring size
//! - [`init_ebpf_logger()`] - Forward `aya-log` output from the probes
//! - [`configure_probes()`] - Fill the `CONFIG` and `PIDS` maps

use aya::maps::HashMap;
use aya::{Ebpf, EbpfLoader};
use aya_log::EbpfLogger;
use epoll_spy_common::{
    CONFIG_MAP, CONFIG_OVERRIDE_ENABLED, CONFIG_OVERRIDE_VALUE, CONFIG_PACKED_EPOLL_EVENT,
    CONFIG_PID_FILTER, CONFIG_SYSCALL_WRAPPER, EVENTS_MAP, PIDS_MAP,
};
use log::{debug, info, warn};
use std::path::Path;

use crate::domain::errors::is_permission_error;
use crate::domain::ProbeError;
use crate::registry::ArchPrefix;

/// Kernel-side knobs written into `CONFIG` before attaching
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProbeSettings {
    /// Trace only these PIDs/TIDs; empty means trace everything
    pub pids: Vec<u32>,
    /// Return value forced by modify-return probes; `None` leaves calls untouched
    pub override_return: Option<i64>,
}

/// Remove the limit on locked memory.
///
/// Needed on kernels that predate memcg-based accounting of BPF memory,
/// see <https://lwn.net/Articles/837122/>.
pub fn bump_memlock_rlimit() {
    let rlim = libc::rlimit { rlim_cur: libc::RLIM_INFINITY, rlim_max: libc::RLIM_INFINITY };
    #[allow(unsafe_code)]
    let ret = unsafe { libc::setrlimit(libc::RLIMIT_MEMLOCK, &rlim) };
    if ret != 0 {
        debug!("remove limit on locked memory failed, ret is: {ret}");
    }
}

/// Load the eBPF object from `path`, sizing the `EVENTS` ring to `ring_bytes`
///
/// # Errors
/// `PermissionDenied` if the kernel refuses to create maps, `LoadFailed` otherwise
pub fn load_ebpf_object(path: &Path, ring_bytes: u32) -> Result<Ebpf, ProbeError> {
    let bytes = std::fs::read(path).map_err(|e| {
        ProbeError::LoadFailed(format!(
            "{}: {e} (build it with `cargo xtask build-ebpf` or set EPOLL_SPY_OBJECT)",
            path.display()
        ))
    })?;

    EbpfLoader::new().set_max_entries(EVENTS_MAP, ring_bytes).load(&bytes).map_err(|e| {
        if is_permission_error(&e) {
            ProbeError::PermissionDenied(e.to_string())
        } else {
            ProbeError::LoadFailed(e.to_string())
        }
    })
}

/// Initialize eBPF logger
pub fn init_ebpf_logger(ebpf: &mut Ebpf) {
    if let Err(e) = EbpfLogger::init(ebpf) {
        // This can happen if all log statements are optimized out of the probes
        warn!("Failed to initialize eBPF logger: {e}");
    }
}

/// Write architecture and filter settings into the probe maps
///
/// # Errors
/// Returns an error if a map is missing or an update fails
pub fn configure_probes(
    ebpf: &mut Ebpf,
    arch: ArchPrefix,
    settings: &ProbeSettings,
) -> Result<(), ProbeError> {
    let mut config: HashMap<_, u32, u64> =
        HashMap::try_from(ebpf.map_mut(CONFIG_MAP).ok_or(ProbeError::MapNotFound(CONFIG_MAP))?)?;

    config.insert(CONFIG_SYSCALL_WRAPPER, u64::from(arch.is_wrapped()), 0)?;
    config.insert(CONFIG_PACKED_EPOLL_EVENT, u64::from(cfg!(target_arch = "x86_64")), 0)?;
    config.insert(CONFIG_PID_FILTER, u64::from(!settings.pids.is_empty()), 0)?;

    if let Some(rc) = settings.override_return {
        #[allow(clippy::cast_sign_loss)]
        config.insert(CONFIG_OVERRIDE_VALUE, rc as u64, 0)?;
        config.insert(CONFIG_OVERRIDE_ENABLED, 1, 0)?;
        warn!("⚠️  Modify-return probes will force epoll_ctl to return {rc}");
    } else {
        config.insert(CONFIG_OVERRIDE_ENABLED, 0, 0)?;
    }

    if !settings.pids.is_empty() {
        let mut pids: HashMap<_, u32, u8> =
            HashMap::try_from(ebpf.map_mut(PIDS_MAP).ok_or(ProbeError::MapNotFound(PIDS_MAP))?)?;
        for pid in &settings.pids {
            pids.insert(pid, 1, 0)?;
        }
        info!("✓ Filtering on {} PIDs/TIDs", settings.pids.len());
    }

    info!("✓ Configured probes for {arch} (syscall wrapper: {})", arch.is_wrapped());
    Ok(())
}
