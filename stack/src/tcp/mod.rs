//! TCP engine.
//!
//! A BSD-style connection state machine terminating the guest's TCP and
//! relaying the byte streams over host sockets. Timer values are counted in
//! slow ticks of [`SLOW_TICK_MS`].

mod input;
mod output;
mod subr;
mod tcb;
mod timer;

pub(crate) use input::input;
pub(crate) use output::output;
pub(crate) use subr::{
    accept, ack_pending, connect_completed, connect_failed, drop_connection, fasttimo, listen,
    slowtimo, sockclosed,
};
pub use tcb::{QueuedSegment, Tcb};
pub use timer::{RetransmitState, RttEstimator, TcpTimers, TimerKind};

/// Slow timer period. Two ticks per second.
pub const SLOW_TICK_MS: u64 = 500;
/// Delayed-ACK flush period.
pub const FAST_TICK_MS: u64 = 2;

pub const TCPTV_MIN: u32 = 2;
pub const TCPTV_REXMTMAX: u32 = 24;
pub const TCPTV_SRTTDFLT: u32 = 6;
pub const TCPTV_KEEP_INIT: u32 = 150;
pub const TCPTV_KEEP_IDLE: u32 = 14400;
pub const TCPTV_KEEPINTVL: u32 = 150;
pub const TCPTV_KEEPCNT: u32 = 8;
pub const TCPTV_MSL: u32 = 10;
pub const TCPTV_PERSMIN: u32 = 10;
pub const TCPTV_PERSMAX: u32 = 120;
pub const TCP_MAXIDLE: u32 = TCPTV_KEEPCNT * TCPTV_KEEPINTVL;

pub const TCP_MAXRXTSHIFT: usize = 12;
pub const TCP_BACKOFF: [u32; TCP_MAXRXTSHIFT + 1] = [1, 2, 4, 8, 16, 32, 64, 64, 64, 64, 64, 64, 64];

pub const TCP_MSS_DEFAULT: u16 = 512;
pub const TCP_MAXWIN: u32 = 65535;
pub const TCP_ISSINCR: u32 = 125 * 1024;
pub const TCP_DUPACK_THRESHOLD: u32 = 3;

/// RFC 793 connection states, ordered as in BSD so range checks work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TcpState {
    Closed,
    Listen,
    SynSent,
    SynReceived,
    Established,
    CloseWait,
    FinWait1,
    Closing,
    LastAck,
    FinWait2,
    TimeWait,
}

impl TcpState {
    pub fn have_received_syn(self) -> bool {
        self >= TcpState::SynReceived
    }

    pub fn have_established(self) -> bool {
        self >= TcpState::Established
    }

    /// A FIN from the guest has been consumed.
    pub fn have_received_fin(self) -> bool {
        matches!(
            self,
            TcpState::CloseWait | TcpState::Closing | TcpState::LastAck | TcpState::TimeWait
        )
    }

    /// Flags every segment sent in this state carries.
    pub fn out_flags(self) -> u8 {
        use crate::wire::tcp_flags::*;
        match self {
            TcpState::Closed => RST | ACK,
            TcpState::Listen => 0,
            TcpState::SynSent => SYN,
            TcpState::SynReceived => SYN | ACK,
            TcpState::Established | TcpState::CloseWait | TcpState::FinWait2 => ACK,
            TcpState::TimeWait => ACK,
            TcpState::FinWait1 | TcpState::Closing | TcpState::LastAck => FIN | ACK,
        }
    }
}

/// Application protocols whose payload carries addresses that must be
/// rewritten for the NAT.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Emulation {
    #[default]
    None,
    Ftp,
    /// rsh and kshell stderr port announcement.
    Ksh,
    Irc,
    RealAudio(crate::emu::RealAudioScan),
    /// Pending partial ident query line.
    Ident(Vec<u8>),
}

impl Emulation {
    pub fn is_active(&self) -> bool {
        !matches!(self, Emulation::None)
    }

    /// Guest bytes accepted but not yet forwarded to the host.
    pub fn held(&self) -> usize {
        match self {
            Emulation::Ident(pending) => pending.len(),
            _ => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::tcp_flags::*;

    #[test]
    fn test_state_ordering() {
        assert!(!TcpState::Listen.have_received_syn());
        assert!(TcpState::SynReceived.have_received_syn());
        assert!(!TcpState::SynReceived.have_established());
        assert!(TcpState::TimeWait.have_established());
        assert!(TcpState::CloseWait.have_received_fin());
        assert!(!TcpState::FinWait2.have_received_fin());
    }

    #[test]
    fn test_out_flags() {
        assert_eq!(TcpState::SynSent.out_flags(), SYN);
        assert_eq!(TcpState::Closed.out_flags(), RST | ACK);
        assert_eq!(TcpState::LastAck.out_flags(), FIN | ACK);
        assert_eq!(TcpState::Listen.out_flags(), 0);
    }
}
