use aya_ebpf::{
    args::PtRegs, bindings::pt_regs, helpers::bpf_probe_read_user_buf, programs::ProbeContext,
};

/// `struct epoll_event`: packed on x86_64, naturally aligned elsewhere
const EPOLL_EVENT_SIZE_PACKED: usize = 12;
const EPOLL_EVENT_SIZE: usize = 16;

/// Arguments of `epoll_ctl(epfd, op, fd, event)`
pub struct EpollCtlArgs {
    pub epfd: i32,
    pub op: i32,
    pub fd: i32,
    event: u64,
}

impl EpollCtlArgs {
    #[inline(always)]
    pub fn new(epfd: i64, op: i64, fd: i64, event: u64) -> Self {
        Self { epfd: epfd as i32, op: op as i32, fd: fd as i32, event }
    }

    /// Wrapped syscalls (`__x64_sys_*` and friends) receive the user registers
    #[inline(always)]
    pub fn from_regs(regs: *mut pt_regs) -> Option<Self> {
        let regs = PtRegs::new(regs);
        Some(Self::new(regs.arg(0)?, regs.arg(1)?, regs.arg(2)?, regs.arg(3)?))
    }

    #[inline(always)]
    pub fn from_probe(ctx: &ProbeContext) -> Option<Self> {
        Some(Self::new(ctx.arg(0)?, ctx.arg(1)?, ctx.arg(2)?, ctx.arg(3)?))
    }

    /// Copy `events` and `data` out of the user's `epoll_event`.
    ///
    /// `EPOLL_CTL_DEL` may pass NULL; a failed read yields zeroes.
    #[inline(always)]
    pub fn read_epoll_event(&self, packed: bool) -> (u32, u64) {
        if self.event == 0 {
            return (0, 0);
        }

        let mut buf = [0u8; EPOLL_EVENT_SIZE];
        let (len, d) = if packed { (EPOLL_EVENT_SIZE_PACKED, 4) } else { (EPOLL_EVENT_SIZE, 8) };
        if unsafe { bpf_probe_read_user_buf(self.event as *const u8, &mut buf[..len]) }.is_err() {
            return (0, 0);
        }

        let events = u32::from_ne_bytes([buf[0], buf[1], buf[2], buf[3]]);
        let data = u64::from_ne_bytes([
            buf[d],
            buf[d + 1],
            buf[d + 2],
            buf[d + 3],
            buf[d + 4],
            buf[d + 5],
            buf[d + 6],
            buf[d + 7],
        ]);
        (events, data)
    }
}
