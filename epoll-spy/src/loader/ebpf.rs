//! aya implementation of [`ProbeBackend`]
//!
//! | kind           | program type | attach                          |
//! |----------------|--------------|---------------------------------|
//! | `Entry`        | `FEntry`     | BTF target resolved at load     |
//! | `Return`       | `FExit`      | BTF target resolved at load     |
//! | `ModifyReturn` | `KProbe`     | symbol name                     |
//!
//! Only the `_override` variant of the modify-return program contains a
//! `bpf_override_return` call. It is selected with
//! [`EbpfBackend::with_override`], so the default program never needs
//! `CONFIG_BPF_KPROBE_OVERRIDE`.

use aya::programs::fentry::FEntryLinkId;
use aya::programs::fexit::FExitLinkId;
use aya::programs::kprobe::KProbeLinkId;
use aya::programs::{FEntry, FExit, KProbe, Program, ProgramError};
use aya::{Btf, Ebpf};
use log::{debug, info};
use std::collections::HashSet;
use std::io;

use super::{KernelSymbols, ProbeBackend};
use crate::domain::errors::is_permission_error;
use crate::domain::ProbeError;
use crate::registry::{ProbeDescriptor, ProbeKind};

/// Live attachment created by [`EbpfBackend`]
#[derive(Debug)]
pub enum EbpfLink {
    KProbe(KProbeLinkId),
    FEntry(FEntryLinkId),
    FExit(FExitLinkId),
}

pub struct EbpfBackend {
    ebpf: Ebpf,
    symbols: KernelSymbols,
    btf: Option<Btf>,
    loaded: HashSet<&'static str>,
    override_return: bool,
}

impl EbpfBackend {
    #[must_use]
    pub fn new(ebpf: Ebpf, symbols: KernelSymbols) -> Self {
        Self { ebpf, symbols, btf: None, loaded: HashSet::new(), override_return: false }
    }

    /// Use the overriding variant of programs that have one
    #[must_use]
    pub fn with_override(mut self, override_return: bool) -> Self {
        self.override_return = override_return;
        self
    }
}

/// Program inside the object that implements `descriptor`
fn program_name(descriptor: &ProbeDescriptor, override_return: bool) -> &'static str {
    match descriptor.override_program {
        Some(name) if override_return => name,
        _ => descriptor.program,
    }
}

/// Parse kernel BTF on first use; shared by every fentry/fexit load
fn kernel_btf<'a>(slot: &'a mut Option<Btf>, symbol: &str) -> Result<&'a Btf, ProbeError> {
    if slot.is_none() {
        let btf = Btf::from_sys_fs().map_err(|e| ProbeError::SymbolNotFound {
            symbol: format!("{symbol} (kernel BTF unavailable: {e})"),
        })?;
        *slot = Some(btf);
    }
    slot.as_ref().ok_or_else(|| ProbeError::LoadFailed("kernel BTF unavailable".into()))
}

fn program_mut<'a, T>(ebpf: &'a mut Ebpf, name: &str) -> Result<&'a mut T, ProbeError>
where
    &'a mut T: TryFrom<&'a mut Program, Error = ProgramError>,
{
    let program =
        ebpf.program_mut(name).ok_or_else(|| ProbeError::ProgramNotFound(name.to_string()))?;
    program.try_into().map_err(|e: ProgramError| ProbeError::LoadFailed(format!("{name}: {e}")))
}

/// Sort a load failure into the error taxonomy
fn classify_load_error(program: &str, symbol: &str, err: ProgramError) -> ProbeError {
    match err {
        ProgramError::LoadError { io_error, verifier_log } => {
            classify_rejected_load(program, &io_error, &verifier_log.to_string())
        }
        ProgramError::Btf(e) => {
            ProbeError::SymbolNotFound { symbol: format!("{symbol} (no BTF info: {e})") }
        }
        other if is_permission_error(&other) => {
            ProbeError::PermissionDenied(format!("loading {program}: {other}"))
        }
        other => ProbeError::LoadFailed(format!("{program}: {other}")),
    }
}

/// `BPF_PROG_LOAD` failed. The verifier reports rejections as `EACCES`
/// too, so only an empty log means the caller lacked privileges.
fn classify_rejected_load(program: &str, io_error: &io::Error, verifier_log: &str) -> ProbeError {
    let log = verifier_log.trim();
    let denied = io_error.kind() == io::ErrorKind::PermissionDenied
        || matches!(io_error.raw_os_error(), Some(libc::EPERM | libc::EACCES));
    if log.is_empty() && denied {
        return ProbeError::PermissionDenied(format!("loading {program}: {io_error}"));
    }
    let log = if log.is_empty() { io_error.to_string() } else { log.to_string() };
    ProbeError::VerificationFailed { program: program.to_string(), log }
}

fn classify_attach_error(program: &str, symbol: &str, err: ProgramError) -> ProbeError {
    if is_permission_error(&err) {
        return ProbeError::PermissionDenied(format!("attaching {program}: {err}"));
    }
    ProbeError::AttachFailed {
        program: program.to_string(),
        symbol: symbol.to_string(),
        error: err.to_string(),
    }
}

impl ProbeBackend for EbpfBackend {
    type Link = EbpfLink;

    fn has_symbol(&self, symbol: &str) -> bool {
        self.symbols.contains(symbol)
    }

    fn load(&mut self, descriptor: &ProbeDescriptor, symbol: &str) -> Result<(), ProbeError> {
        let name = program_name(descriptor, self.override_return);
        if self.loaded.contains(name) {
            return Ok(());
        }

        let result = match descriptor.kind {
            ProbeKind::ModifyReturn => program_mut::<KProbe>(&mut self.ebpf, name)?.load(),
            ProbeKind::Entry => {
                let btf = kernel_btf(&mut self.btf, symbol)?;
                program_mut::<FEntry>(&mut self.ebpf, name)?.load(symbol, btf)
            }
            ProbeKind::Return => {
                let btf = kernel_btf(&mut self.btf, symbol)?;
                program_mut::<FExit>(&mut self.ebpf, name)?.load(symbol, btf)
            }
        };
        result.map_err(|e| classify_load_error(name, symbol, e))?;

        debug!("Verifier accepted {name}");
        self.loaded.insert(name);
        Ok(())
    }

    fn attach(&mut self, descriptor: &ProbeDescriptor, symbol: &str) -> Result<EbpfLink, ProbeError> {
        let name = program_name(descriptor, self.override_return);
        let link = match descriptor.kind {
            ProbeKind::ModifyReturn => program_mut::<KProbe>(&mut self.ebpf, name)?
                .attach(symbol, 0)
                .map(EbpfLink::KProbe),
            ProbeKind::Entry => {
                program_mut::<FEntry>(&mut self.ebpf, name)?.attach().map(EbpfLink::FEntry)
            }
            ProbeKind::Return => {
                program_mut::<FExit>(&mut self.ebpf, name)?.attach().map(EbpfLink::FExit)
            }
        };
        link.map_err(|e| classify_attach_error(name, symbol, e))
    }

    fn detach(&mut self, descriptor: &ProbeDescriptor, link: EbpfLink) -> Result<(), ProbeError> {
        let name = program_name(descriptor, self.override_return);
        let result = match link {
            EbpfLink::KProbe(id) => program_mut::<KProbe>(&mut self.ebpf, name)?.detach(id),
            EbpfLink::FEntry(id) => program_mut::<FEntry>(&mut self.ebpf, name)?.detach(id),
            EbpfLink::FExit(id) => program_mut::<FExit>(&mut self.ebpf, name)?.detach(id),
        };
        map_detach_result(name, result)
    }
}

/// The kernel or aya already dropping the link counts as detached
fn map_detach_result(program: &str, result: Result<(), ProgramError>) -> Result<(), ProbeError> {
    match result {
        Ok(()) => Ok(()),
        Err(ProgramError::NotAttached | ProgramError::NotLoaded) => {
            info!("{program} was already detached");
            Ok(())
        }
        Err(e) => {
            Err(ProbeError::DetachFailed { program: program.to_string(), error: e.to_string() })
        }
    }
}
