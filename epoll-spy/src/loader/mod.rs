//! # Probe Loading and Attachment
//!
//! The [`Loader`] turns a [`ProbeDescriptor`] into a live kernel attachment:
//!
//! 1. Resolve the concrete symbol for the running [`ArchPrefix`]
//! 2. Check the kernel symbol table for it (`SymbolNotFound` otherwise)
//! 3. Load the program, which runs it through the kernel verifier
//! 4. Attach it and hand back a [`ProbeHandle`]
//!
//! The kernel interaction sits behind [`ProbeBackend`]; [`EbpfBackend`]
//! is the aya implementation. Failures are returned as-is; retrying is
//! up to the caller (see [`Loader::reattach`]).
//!
//! Lifecycle state is published on a `watch` channel so the collector can
//! stop polling once the probes are gone.

pub mod ebpf;
pub mod setup;
pub mod symbols;

use log::{debug, info, warn};
use std::collections::BTreeMap;
use tokio::sync::watch;

use crate::domain::ProbeError;
use crate::registry::{self, ArchPrefix, ProbeDescriptor};

pub use ebpf::{EbpfBackend, EbpfLink};
pub use setup::{
    bump_memlock_rlimit, configure_probes, init_ebpf_logger, load_ebpf_object, ProbeSettings,
};
pub use symbols::KernelSymbols;

/// Kernel-side capability the loader drives
pub trait ProbeBackend {
    /// Token identifying one attachment, returned by `attach`
    type Link;

    /// Whether the kernel exposes `symbol` as an attachable function
    fn has_symbol(&self, symbol: &str) -> bool;

    /// Verify and load the program for `descriptor` (idempotent)
    ///
    /// # Errors
    /// `VerificationFailed`, `PermissionDenied` or another load failure
    fn load(&mut self, descriptor: &ProbeDescriptor, symbol: &str) -> Result<(), ProbeError>;

    /// Bind the loaded program to `symbol`
    ///
    /// # Errors
    /// Returns an error if the kernel refuses the attachment
    fn attach(&mut self, descriptor: &ProbeDescriptor, symbol: &str)
        -> Result<Self::Link, ProbeError>;

    /// Release one attachment. A link the kernel already dropped must
    /// be reported as success.
    ///
    /// # Errors
    /// Returns an error if the kernel refuses to release the link
    fn detach(&mut self, descriptor: &ProbeDescriptor, link: Self::Link) -> Result<(), ProbeError>;
}

/// Loader/collector lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Unattached,
    Attaching,
    /// At least one probe attached; the only state in which events flow
    Attached,
    Detaching,
}

/// Opaque reference to an attachment owned by the [`Loader`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProbeHandle(u64);

struct Attachment<L> {
    descriptor: &'static ProbeDescriptor,
    symbol: String,
    link: L,
}

pub struct Loader<B: ProbeBackend> {
    backend: B,
    arch: ArchPrefix,
    attachments: BTreeMap<ProbeHandle, Attachment<B::Link>>,
    next_handle: u64,
    state: watch::Sender<SessionState>,
}

impl<B: ProbeBackend> Loader<B> {
    /// Loader for the running architecture
    pub fn new(backend: B) -> Self {
        Self::with_arch(backend, ArchPrefix::current())
    }

    pub fn with_arch(backend: B, arch: ArchPrefix) -> Self {
        let (state, _) = watch::channel(SessionState::Unattached);
        Self { backend, arch, attachments: BTreeMap::new(), next_handle: 0, state }
    }

    #[must_use]
    pub fn arch(&self) -> ArchPrefix {
        self.arch
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Receive lifecycle transitions
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    #[must_use]
    pub fn attached_count(&self) -> usize {
        self.attachments.len()
    }

    /// Concrete symbol a handle is attached to, if still attached
    #[must_use]
    pub fn symbol(&self, handle: ProbeHandle) -> Option<&str> {
        self.attachments.get(&handle).map(|a| a.symbol.as_str())
    }

    /// Attach a probe by logical event name
    ///
    /// # Errors
    /// `UnknownEvent` plus everything [`Loader::attach`] returns
    pub fn attach_by_name(&mut self, logical_name: &str) -> Result<ProbeHandle, ProbeError> {
        let descriptor = registry::lookup(logical_name)?;
        self.attach(descriptor)
    }

    /// Resolve, verify, load and attach `descriptor`
    ///
    /// # Errors
    /// `SymbolNotFound`, `VerificationFailed`, `PermissionDenied`, or an
    /// attach failure. No handle is created on error.
    pub fn attach(
        &mut self,
        descriptor: &'static ProbeDescriptor,
    ) -> Result<ProbeHandle, ProbeError> {
        self.set_state(SessionState::Attaching);

        match self.try_attach(descriptor) {
            Ok(handle) => {
                self.set_state(SessionState::Attached);
                Ok(handle)
            }
            Err(e) => {
                warn!("Failed to attach {}: {e}", descriptor.logical_name);
                self.settle();
                Err(e)
            }
        }
    }

    fn try_attach(
        &mut self,
        descriptor: &'static ProbeDescriptor,
    ) -> Result<ProbeHandle, ProbeError> {
        let symbol = descriptor.symbol_for(self.arch);
        debug!("Resolved {} to {symbol} ({})", descriptor.logical_name, self.arch);

        if !self.backend.has_symbol(&symbol) {
            return Err(ProbeError::SymbolNotFound { symbol });
        }

        self.backend.load(descriptor, &symbol)?;
        let link = self.backend.attach(descriptor, &symbol)?;

        let handle = ProbeHandle(self.next_handle);
        self.next_handle += 1;
        info!("✓ Attached {} ({}) to {symbol}", descriptor.logical_name, descriptor.kind);
        self.attachments.insert(handle, Attachment { descriptor, symbol, link });
        Ok(handle)
    }

    /// Release the attachment behind `handle`.
    ///
    /// Detaching an unknown or already-detached handle is a no-op.
    ///
    /// # Errors
    /// Returns an error if the backend refuses to release a live link;
    /// the handle is forgotten either way.
    pub fn detach(&mut self, handle: ProbeHandle) -> Result<(), ProbeError> {
        let Some(attachment) = self.attachments.remove(&handle) else {
            debug!("Handle {handle:?} already detached");
            return Ok(());
        };

        self.set_state(SessionState::Detaching);
        let result = self.backend.detach(attachment.descriptor, attachment.link);
        match &result {
            Ok(()) => info!(
                "✓ Detached {} from {}",
                attachment.descriptor.logical_name, attachment.symbol
            ),
            Err(e) => warn!("Failed to detach {}: {e}", attachment.descriptor.logical_name),
        }
        self.settle();
        result
    }

    /// Detach every probe, returning the first failure
    ///
    /// # Errors
    /// The first backend detach failure; all handles are still released
    pub fn detach_all(&mut self) -> Result<(), ProbeError> {
        let handles: Vec<ProbeHandle> = self.attachments.keys().copied().collect();
        let mut first_err = None;
        for handle in handles {
            if let Err(e) = self.detach(handle) {
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    /// Detach `handle` and attach the same descriptor again
    ///
    /// # Errors
    /// `HandleNotAttached` for an unknown or already-detached handle,
    /// otherwise the detach or attach failure
    pub fn reattach(&mut self, handle: ProbeHandle) -> Result<ProbeHandle, ProbeError> {
        let descriptor = self
            .attachments
            .get(&handle)
            .map(|a| a.descriptor)
            .ok_or(ProbeError::HandleNotAttached(handle.0))?;
        self.detach(handle)?;
        self.attach(descriptor)
    }

    fn settle(&self) {
        let state = if self.attachments.is_empty() {
            SessionState::Unattached
        } else {
            SessionState::Attached
        };
        self.set_state(state);
    }

    fn set_state(&self, state: SessionState) {
        self.state.send_replace(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[derive(Default)]
    struct FakeBackend {
        symbols: HashSet<String>,
        fail_load: Option<fn() -> ProbeError>,
        live: HashSet<u32>,
        next_link: u32,
        detach_calls: usize,
    }

    impl FakeBackend {
        fn with_symbols(symbols: &[&str]) -> Self {
            Self { symbols: symbols.iter().map(ToString::to_string).collect(), ..Self::default() }
        }
    }

    impl ProbeBackend for FakeBackend {
        type Link = u32;

        fn has_symbol(&self, symbol: &str) -> bool {
            self.symbols.contains(symbol)
        }

        fn load(&mut self, _: &ProbeDescriptor, _: &str) -> Result<(), ProbeError> {
            self.fail_load.map_or(Ok(()), |f| Err(f()))
        }

        fn attach(&mut self, _: &ProbeDescriptor, _: &str) -> Result<u32, ProbeError> {
            self.next_link += 1;
            self.live.insert(self.next_link);
            Ok(self.next_link)
        }

        fn detach(&mut self, _: &ProbeDescriptor, link: u32) -> Result<(), ProbeError> {
            self.detach_calls += 1;
            // A link the kernel already dropped is not an error
            self.live.remove(&link);
            Ok(())
        }
    }

    fn x86_loader() -> Loader<FakeBackend> {
        Loader::with_arch(FakeBackend::with_symbols(&["__x64_sys_epoll_ctl"]), ArchPrefix::X86_64)
    }

    #[test]
    fn test_attach_and_detach() {
        let mut loader = x86_loader();
        assert_eq!(loader.state(), SessionState::Unattached);

        let handle = loader.attach_by_name("epoll_ctl_monitor").unwrap();
        assert_eq!(loader.state(), SessionState::Attached);
        assert_eq!(loader.symbol(handle), Some("__x64_sys_epoll_ctl"));
        assert_eq!(loader.backend.live.len(), 1);

        loader.detach(handle).unwrap();
        assert_eq!(loader.state(), SessionState::Unattached);
        assert!(loader.backend.live.is_empty());
    }

    #[test]
    fn test_detach_twice_is_noop() {
        let mut loader = x86_loader();
        let handle = loader.attach_by_name("epoll_ctl_entry").unwrap();

        loader.detach(handle).unwrap();
        loader.detach(handle).unwrap();
        assert_eq!(loader.backend.detach_calls, 1);
        assert_eq!(loader.state(), SessionState::Unattached);
    }

    #[test]
    fn test_empty_symbol_table() {
        let mut loader = Loader::with_arch(FakeBackend::default(), ArchPrefix::X86_64);
        let err = loader.attach_by_name("epoll_ctl_monitor").unwrap_err();

        assert!(
            matches!(err, ProbeError::SymbolNotFound { ref symbol } if symbol == "__x64_sys_epoll_ctl")
        );
        assert_eq!(loader.attached_count(), 0);
        assert_eq!(loader.state(), SessionState::Unattached);
        assert!(loader.backend.live.is_empty());
    }

    #[test]
    fn test_arch_mismatch_is_symbol_not_found() {
        let mut loader = Loader::with_arch(
            FakeBackend::with_symbols(&["__x64_sys_epoll_ctl"]),
            ArchPrefix::Arm64,
        );
        let err = loader.attach_by_name("epoll_ctl_return").unwrap_err();
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn test_unknown_event() {
        let mut loader = x86_loader();
        let err = loader.attach_by_name("epoll_wait_monitor").unwrap_err();
        assert!(matches!(err, ProbeError::UnknownEvent(_)));
        assert_eq!(loader.state(), SessionState::Unattached);
    }

    #[test]
    fn test_verification_failure_creates_no_handle() {
        let mut loader = x86_loader();
        loader.backend.fail_load = Some(|| ProbeError::VerificationFailed {
            program: "epoll_ctl_monitor".into(),
            log: "invalid mem access".into(),
        });

        let err = loader.attach_by_name("epoll_ctl_monitor").unwrap_err();
        assert_eq!(err.exit_code(), 3);
        assert_eq!(loader.attached_count(), 0);
    }

    #[test]
    fn test_permission_denied() {
        let mut loader = x86_loader();
        loader.backend.fail_load = Some(|| ProbeError::PermissionDenied("EPERM".into()));
        let err = loader.attach_by_name("epoll_ctl_monitor").unwrap_err();
        assert_eq!(err.exit_code(), 4);
    }

    #[test]
    fn test_failed_attach_keeps_existing_probes() {
        let mut loader = x86_loader();
        loader.attach_by_name("epoll_ctl_entry").unwrap();

        loader.backend.fail_load = Some(|| ProbeError::PermissionDenied("EPERM".into()));
        assert!(loader.attach_by_name("epoll_ctl_return").is_err());
        assert_eq!(loader.state(), SessionState::Attached);
        assert_eq!(loader.attached_count(), 1);
    }

    #[test]
    fn test_reattach() {
        let mut loader = x86_loader();
        let first = loader.attach_by_name("epoll_ctl_monitor").unwrap();
        let second = loader.reattach(first).unwrap();

        assert_ne!(first, second);
        assert_eq!(loader.attached_count(), 1);
        assert_eq!(loader.backend.live.len(), 1);
    }

    #[test]
    fn test_reattach_stale_handle_leaves_probes_alone() {
        let mut loader = x86_loader();
        let first = loader.attach_by_name("epoll_ctl_monitor").unwrap();
        let second = loader.reattach(first).unwrap();

        let err = loader.reattach(first).unwrap_err();
        assert!(matches!(err, ProbeError::HandleNotAttached(h) if h == first.0));
        assert_eq!(err.exit_code(), 1);
        assert_eq!(loader.symbol(second), Some("__x64_sys_epoll_ctl"));
        assert_eq!(loader.backend.live.len(), 1);
        assert_eq!(loader.state(), SessionState::Attached);
    }

    #[test]
    fn test_detach_all_and_state_watch() {
        let mut loader = x86_loader();
        let rx = loader.subscribe();
        loader.attach_by_name("epoll_ctl_entry").unwrap();
        loader.attach_by_name("epoll_ctl_return").unwrap();
        assert_eq!(*rx.borrow(), SessionState::Attached);

        loader.detach_all().unwrap();
        assert_eq!(*rx.borrow(), SessionState::Unattached);
        assert!(loader.backend.live.is_empty());
    }
}
