//! # Event Decoding
//!
//! Turns raw [`SyscallEvent`] records into [`EpollCtlEvent`]s with named
//! operations and flags, ready for a sink.

use bitflags::bitflags;
use epoll_spy_common::SyscallEvent;
use serde::{Serialize, Serializer};
use std::fmt;

use crate::domain::{CpuId, Pid, Tid};
use crate::registry::ProbeKind;

/// `epoll_ctl` operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EpollOp {
    Add,
    Del,
    Mod,
    Invalid(i32),
}

impl From<i32> for EpollOp {
    fn from(raw: i32) -> Self {
        match raw {
            1 => Self::Add,
            2 => Self::Del,
            3 => Self::Mod,
            other => Self::Invalid(other),
        }
    }
}

impl fmt::Display for EpollOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Add => "EPOLL_CTL_ADD",
            Self::Del => "EPOLL_CTL_DEL",
            Self::Mod => "EPOLL_CTL_MOD",
            Self::Invalid(_) => "INVALID_OPCODE",
        })
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct EpollFlags: u32 {
        const EPOLLIN        = 0x001;
        const EPOLLPRI       = 0x002;
        const EPOLLOUT       = 0x004;
        const EPOLLERR       = 0x008;
        const EPOLLHUP       = 0x010;
        const EPOLLRDNORM    = 0x040;
        const EPOLLRDBAND    = 0x080;
        const EPOLLWRNORM    = 0x100;
        const EPOLLWRBAND    = 0x200;
        const EPOLLMSG       = 0x400;
        const EPOLLRDHUP     = 0x2000;
        const EPOLLEXCLUSIVE = 1 << 28;
        const EPOLLWAKEUP    = 1 << 29;
        const EPOLLONESHOT   = 1 << 30;
        const EPOLLET        = 1 << 31;
    }
}

impl fmt::Display for EpollFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.iter_names().map(|(name, _)| name).collect();
        f.write_str(&names.join(" | "))
    }
}

/// A decoded `epoll_ctl` observation
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EpollCtlEvent {
    pub pid: Pid,
    pub tid: Tid,
    pub cpu: CpuId,
    pub timestamp_ns: u64,
    pub sequence: u64,
    pub kind: ProbeKind,
    pub epfd: i32,
    #[serde(serialize_with = "as_display")]
    pub op: EpollOp,
    pub fd: i32,
    #[serde(serialize_with = "as_display")]
    pub events: EpollFlags,
    pub data: u64,
    pub return_value: Option<i64>,
}

/// Raw record carried an unknown probe kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnknownProbeKind(pub u8);

impl TryFrom<SyscallEvent> for EpollCtlEvent {
    type Error = UnknownProbeKind;

    fn try_from(raw: SyscallEvent) -> Result<Self, Self::Error> {
        let kind = ProbeKind::from_raw(raw.probe_kind).ok_or(UnknownProbeKind(raw.probe_kind))?;

        Ok(Self {
            pid: Pid(raw.pid),
            tid: Tid(raw.tid),
            cpu: CpuId(raw.cpu_id),
            timestamp_ns: raw.timestamp_ns,
            sequence: raw.sequence,
            kind,
            epfd: raw.epfd,
            op: EpollOp::from(raw.op),
            fd: raw.fd,
            // Unknown bits are kept so nothing the kernel reported is hidden
            events: EpollFlags::from_bits_retain(raw.events),
            data: raw.data,
            return_value: (raw.has_return != 0).then_some(raw.return_value),
        })
    }
}

impl fmt::Display for EpollCtlEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "(pid: {}) epoll_ctl({}, {}, {}, {{ events={{ {} }}, data={} }})",
            self.pid.0, self.epfd, self.op, self.fd, self.events, self.data
        )?;
        match self.return_value {
            Some(ret) => write!(f, " = {ret}"),
            None => Ok(()),
        }
    }
}

fn as_display<T: fmt::Display, S: Serializer>(value: &T, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_str(value)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use epoll_spy_common::{PROBE_KIND_ENTRY, PROBE_KIND_RETURN};

    pub(crate) fn raw_event(cpu_id: u32, sequence: u64) -> SyscallEvent {
        SyscallEvent {
            timestamp_ns: 1_000 + sequence,
            sequence,
            pid: 4242,
            tid: 4243,
            cpu_id,
            probe_kind: PROBE_KIND_ENTRY,
            epfd: 3,
            op: 1,
            fd: 7,
            events: 0x001 | (1 << 31),
            data: 99,
            ..SyscallEvent::default()
        }
    }

    #[test]
    fn test_decode_entry_event() {
        let event = EpollCtlEvent::try_from(raw_event(0, 1)).unwrap();
        assert_eq!(event.pid, Pid(4242));
        assert_eq!(event.kind, ProbeKind::Entry);
        assert_eq!(event.op, EpollOp::Add);
        assert_eq!(event.events, EpollFlags::EPOLLIN | EpollFlags::EPOLLET);
        assert_eq!(event.return_value, None);
    }

    #[test]
    fn test_decode_unknown_kind() {
        let mut raw = raw_event(0, 1);
        raw.probe_kind = 9;
        assert_eq!(EpollCtlEvent::try_from(raw), Err(UnknownProbeKind(9)));
    }

    #[test]
    fn test_display_with_return_value() {
        let mut raw = raw_event(0, 1);
        raw.probe_kind = PROBE_KIND_RETURN;
        raw.has_return = 1;
        raw.return_value = -9;
        let event = EpollCtlEvent::try_from(raw).unwrap();
        assert_eq!(
            event.to_string(),
            "(pid: 4242) epoll_ctl(3, EPOLL_CTL_ADD, 7, { events={ EPOLLIN | EPOLLET }, data=99 }) = -9"
        );
    }

    #[test]
    fn test_invalid_opcode() {
        assert_eq!(EpollOp::from(17).to_string(), "INVALID_OPCODE");
        assert_eq!(EpollOp::from(2).to_string(), "EPOLL_CTL_DEL");
    }

    #[test]
    fn test_serialize_json() {
        let event = EpollCtlEvent::try_from(raw_event(2, 5)).unwrap();
        let json: serde_json::Value = serde_json::to_value(&event).unwrap();
        assert_eq!(json["pid"], 4242);
        assert_eq!(json["cpu"], 2);
        assert_eq!(json["kind"], "entry");
        assert_eq!(json["op"], "EPOLL_CTL_ADD");
        assert_eq!(json["events"], "EPOLLIN | EPOLLET");
        assert!(json["return_value"].is_null());
    }
}
