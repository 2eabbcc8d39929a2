//! Validated run configuration
//!
//! Built from the parsed `attach` arguments; everything past this point
//! can assume sane values.

use std::num::NonZeroU64;
use std::path::PathBuf;
use std::sync::OnceLock;
use std::time::Duration;

use crate::cli::AttachArgs;
pub use crate::cli::OutputFormat;
use crate::collector::CollectorConfig;
use crate::domain::ConfigError;
use crate::registry::ProbeDescriptor;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpyConfig {
    pub event: String,
    pub poll_interval: Duration,
    pub max_batch: usize,
    pub ring_bytes: u32,
    pub object_path: PathBuf,
    pub pids: Vec<u32>,
    pub follow: bool,
    /// `None` runs until interrupted
    pub duration: Option<Duration>,
    pub format: OutputFormat,
    pub override_return: Option<i64>,
}

impl SpyConfig {
    #[must_use]
    pub fn collector(&self) -> CollectorConfig {
        CollectorConfig { poll_interval: self.poll_interval, max_batch: self.max_batch }
    }

    /// Reject settings the chosen probe cannot honour
    ///
    /// # Errors
    /// `OverrideNotSupported` if a return override is requested for a
    /// probe that cannot change the return value
    pub fn check_probe(&self, descriptor: &ProbeDescriptor) -> Result<(), ConfigError> {
        if self.override_return.is_some() && descriptor.override_program.is_none() {
            return Err(ConfigError::OverrideNotSupported(descriptor.logical_name.to_string()));
        }
        Ok(())
    }
}

const FALLBACK_PAGE_SIZE: u32 = 4096;

/// Page size of the running kernel
#[must_use]
pub fn page_size() -> u32 {
    static PAGE: OnceLock<u32> = OnceLock::new();
    *PAGE.get_or_init(|| {
        #[allow(unsafe_code)]
        let raw = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        u32::try_from(raw).ok().filter(|&p| p > 0).unwrap_or(FALLBACK_PAGE_SIZE)
    })
}

fn check_ring_bytes(bytes: u32) -> Result<u32, ConfigError> {
    check_ring_bytes_for_page(bytes, page_size())
}

/// Ring buffer maps must be a power-of-two multiple of the page size
fn check_ring_bytes_for_page(bytes: u32, page: u32) -> Result<u32, ConfigError> {
    if bytes >= page && bytes % page == 0 && bytes.is_power_of_two() {
        Ok(bytes)
    } else {
        Err(ConfigError::InvalidRingSize { bytes, page })
    }
}

impl TryFrom<&AttachArgs> for SpyConfig {
    type Error = ConfigError;

    fn try_from(args: &AttachArgs) -> Result<Self, Self::Error> {
        let poll_interval = NonZeroU64::new(args.poll_interval_ms)
            .map(|ms| Duration::from_millis(ms.get()))
            .ok_or(ConfigError::ZeroPollInterval)?;

        if args.max_batch == 0 {
            return Err(ConfigError::ZeroBatch);
        }

        let mut pids = args.pid.clone();
        pids.sort_unstable();
        pids.dedup();

        Ok(Self {
            event: args.event.clone(),
            poll_interval,
            max_batch: args.max_batch,
            ring_bytes: check_ring_bytes(args.ring_bytes)?,
            object_path: args.object.clone(),
            pids,
            follow: args.follow,
            duration: (args.duration > 0).then(|| Duration::from_secs(args.duration)),
            format: args.format,
            override_return: args.override_return,
        })
    }
}
