//! # Probe Descriptor Registry
//!
//! Static allow-list mapping logical event names to kernel attachment points.
//!
//! Syscall entry points are named differently per architecture: kernels
//! built with syscall wrappers expose `__x64_sys_epoll_ctl`,
//! `__arm64_sys_epoll_ctl` and so on, while others only have the
//! `__se_sys_*` form. Templates carry an [`ARCH_PLACEHOLDER`] that
//! [`resolve`] replaces with the prefix of the running [`ArchPrefix`].

use serde::Serialize;
use std::fmt;
use std::sync::OnceLock;

use epoll_spy_common::{PROBE_KIND_ENTRY, PROBE_KIND_MODIFY_RETURN, PROBE_KIND_RETURN};

use crate::domain::ProbeError;

/// Placeholder substituted with the architecture prefix
pub const ARCH_PLACEHOLDER: &str = "{arch}";

/// Where a probe runs relative to the traced function
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeKind {
    /// Before the call (`fentry`)
    Entry,
    /// After the call (`fexit`)
    Return,
    /// Around the call, with the ability to override its return value
    ModifyReturn,
}

impl ProbeKind {
    #[must_use]
    pub fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            PROBE_KIND_ENTRY => Some(Self::Entry),
            PROBE_KIND_RETURN => Some(Self::Return),
            PROBE_KIND_MODIFY_RETURN => Some(Self::ModifyReturn),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_raw(self) -> u8 {
        match self {
            Self::Entry => PROBE_KIND_ENTRY,
            Self::Return => PROBE_KIND_RETURN,
            Self::ModifyReturn => PROBE_KIND_MODIFY_RETURN,
        }
    }
}

impl fmt::Display for ProbeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Entry => "entry",
            Self::Return => "return",
            Self::ModifyReturn => "modify-return",
        })
    }
}

/// Architecture-specific syscall symbol prefix
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArchPrefix {
    X86_64,
    S390x,
    Arm64,
    Riscv,
    /// No syscall wrapper; arguments are passed directly
    Generic,
}

impl ArchPrefix {
    pub const ALL: [ArchPrefix; 5] =
        [Self::X86_64, Self::S390x, Self::Arm64, Self::Riscv, Self::Generic];

    #[must_use]
    pub fn prefix(self) -> &'static str {
        match self {
            Self::X86_64 => "__x64_",
            Self::S390x => "__s390x_",
            Self::Arm64 => "__arm64_",
            Self::Riscv => "__riscv_",
            Self::Generic => "__se_",
        }
    }

    /// Wrapped syscalls take a single `struct pt_regs *` argument
    #[must_use]
    pub fn is_wrapped(self) -> bool {
        self != Self::Generic
    }

    /// Map a Rust `target_arch` name onto a prefix
    #[must_use]
    pub fn from_target_arch(arch: &str) -> Self {
        match arch {
            "x86_64" => Self::X86_64,
            "s390x" => Self::S390x,
            "aarch64" => Self::Arm64,
            "riscv64" => Self::Riscv,
            _ => Self::Generic,
        }
    }

    /// Prefix of the running architecture, decided once per process
    #[must_use]
    pub fn current() -> Self {
        static CURRENT: OnceLock<ArchPrefix> = OnceLock::new();
        *CURRENT.get_or_init(|| Self::from_target_arch(std::env::consts::ARCH))
    }
}

impl fmt::Display for ArchPrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::X86_64 => "x86_64",
            Self::S390x => "s390x",
            Self::Arm64 => "arm64",
            Self::Riscv => "riscv",
            Self::Generic => "generic",
        })
    }
}

/// A logical event and the kernel attachment point it maps to
#[derive(Debug, PartialEq, Eq)]
pub struct ProbeDescriptor {
    pub logical_name: &'static str,
    pub symbol_template: &'static str,
    pub kind: ProbeKind,
    /// Program name inside the compiled eBPF object
    pub program: &'static str,
    /// Variant of `program` that calls `bpf_override_return`, used only
    /// when a return override is requested
    pub override_program: Option<&'static str>,
}

impl ProbeDescriptor {
    /// Concrete kernel symbol for `arch`
    #[must_use]
    pub fn symbol_for(&self, arch: ArchPrefix) -> String {
        self.symbol_template.replacen(ARCH_PLACEHOLDER, arch.prefix(), 1)
    }
}

pub static REGISTRY: &[ProbeDescriptor] = &[
    ProbeDescriptor {
        logical_name: "epoll_ctl_monitor",
        symbol_template: "{arch}sys_epoll_ctl",
        kind: ProbeKind::ModifyReturn,
        program: "epoll_ctl_monitor",
        override_program: Some("epoll_ctl_monitor_override"),
    },
    ProbeDescriptor {
        logical_name: "epoll_ctl_entry",
        symbol_template: "{arch}sys_epoll_ctl",
        kind: ProbeKind::Entry,
        program: "epoll_ctl_entry",
        override_program: None,
    },
    ProbeDescriptor {
        logical_name: "epoll_ctl_return",
        symbol_template: "{arch}sys_epoll_ctl",
        kind: ProbeKind::Return,
        program: "epoll_ctl_return",
        override_program: None,
    },
];

/// Find the descriptor registered under `logical_name`
///
/// # Errors
/// Returns [`ProbeError::UnknownEvent`] if the name is not in the allow-list
pub fn lookup(logical_name: &str) -> Result<&'static ProbeDescriptor, ProbeError> {
    REGISTRY
        .iter()
        .find(|d| d.logical_name == logical_name)
        .ok_or_else(|| ProbeError::UnknownEvent(logical_name.to_string()))
}

/// Resolve a logical event name to a concrete kernel symbol
///
/// # Errors
/// Returns [`ProbeError::UnknownEvent`] if the name is not in the allow-list
pub fn resolve(logical_name: &str, arch: ArchPrefix) -> Result<String, ProbeError> {
    lookup(logical_name).map(|d| d.symbol_for(arch))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_every_event_on_every_arch() {
        for descriptor in REGISTRY {
            for arch in ArchPrefix::ALL {
                let symbol = resolve(descriptor.logical_name, arch).unwrap();
                assert!(symbol.starts_with(arch.prefix()), "{symbol}");
                assert_eq!(symbol.matches(arch.prefix()).count(), 1, "{symbol}");
                assert!(symbol.ends_with("sys_epoll_ctl"), "{symbol}");
                assert!(!symbol.contains(ARCH_PLACEHOLDER));
            }
        }
    }

    #[test]
    fn test_resolve_x86_symbol() {
        assert_eq!(
            resolve("epoll_ctl_monitor", ArchPrefix::X86_64).unwrap(),
            "__x64_sys_epoll_ctl"
        );
        assert_eq!(resolve("epoll_ctl_entry", ArchPrefix::Generic).unwrap(), "__se_sys_epoll_ctl");
    }

    #[test]
    fn test_unknown_event() {
        for name in ["", "epoll_wait", "EPOLL_CTL_MONITOR", "epoll_ctl_monitor ", "{arch}"] {
            for arch in ArchPrefix::ALL {
                let err = resolve(name, arch).unwrap_err();
                assert!(matches!(err, ProbeError::UnknownEvent(ref n) if n == name));
            }
        }
    }

    #[test]
    fn test_logical_names_unique() {
        for (i, a) in REGISTRY.iter().enumerate() {
            for b in &REGISTRY[i + 1..] {
                assert_ne!(a.logical_name, b.logical_name);
            }
        }
    }

    #[test]
    fn test_only_modify_return_has_override_program() {
        for descriptor in REGISTRY {
            let expected = descriptor.kind == ProbeKind::ModifyReturn;
            let name = descriptor.logical_name;
            assert_eq!(descriptor.override_program.is_some(), expected, "{name}");
            assert_ne!(descriptor.override_program, Some(descriptor.program));
        }
    }

    #[test]
    fn test_arch_from_target() {
        assert_eq!(ArchPrefix::from_target_arch("x86_64"), ArchPrefix::X86_64);
        assert_eq!(ArchPrefix::from_target_arch("aarch64"), ArchPrefix::Arm64);
        assert_eq!(ArchPrefix::from_target_arch("riscv64"), ArchPrefix::Riscv);
        assert_eq!(ArchPrefix::from_target_arch("s390x"), ArchPrefix::S390x);
        assert_eq!(ArchPrefix::from_target_arch("mips"), ArchPrefix::Generic);
        assert!(!ArchPrefix::Generic.is_wrapped());
        assert_eq!(ArchPrefix::current(), ArchPrefix::current());
    }

    #[test]
    fn test_probe_kind_raw_roundtrip() {
        for kind in [ProbeKind::Entry, ProbeKind::Return, ProbeKind::ModifyReturn] {
            assert_eq!(ProbeKind::from_raw(kind.as_raw()), Some(kind));
        }
        assert_eq!(ProbeKind::from_raw(42), None);
    }
}
