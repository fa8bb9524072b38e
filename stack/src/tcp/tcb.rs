use super::timer::{RetransmitState, RttEstimator, TcpTimers, TimerKind, range_set};
use super::{
    Emulation, TCP_BACKOFF, TCP_MAXWIN, TCP_MSS_DEFAULT, TCPTV_PERSMAX, TCPTV_PERSMIN, TcpState,
};
use crate::wire::{seq_gt, seq_lt};
use usernet_mbuf::Cursor;

/// Out-of-order guest segment waiting in the reassembly queue. `data`
/// points at the first payload byte inside the segment's buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueuedSegment {
    pub seq: u32,
    pub len: usize,
    pub fin: bool,
    pub data: Cursor,
}

impl QueuedSegment {
    pub fn end(&self) -> u32 {
        self.seq.wrapping_add(self.len as u32)
    }
}

/// Per-connection TCP control block.
#[derive(Debug)]
pub struct Tcb {
    pub state: TcpState,
    pub timers: TcpTimers,
    pub backoff: RetransmitState,
    pub rtt: RttEstimator,
    pub dupacks: u32,
    pub maxseg: u16,
    /// Send one segment even into a zero window.
    pub force: bool,
    pub ack_now: bool,
    pub delayed_ack: bool,
    pub sent_fin: bool,
    /// Slow ticks since the guest last sent anything.
    pub idle: u32,

    pub snd_una: u32,
    pub snd_nxt: u32,
    pub snd_max: u32,
    pub snd_wl1: u32,
    pub snd_wl2: u32,
    pub iss: u32,
    pub snd_wnd: u32,
    pub max_sndwnd: u32,
    pub snd_cwnd: u32,
    pub snd_ssthresh: u32,

    pub rcv_wnd: u32,
    pub rcv_nxt: u32,
    pub rcv_adv: u32,
    pub irs: u32,
    pub last_ack_sent: u32,

    pub reassembly: Vec<QueuedSegment>,
    pub emu: Emulation,
}

impl Tcb {
    pub fn new() -> Self {
        Self {
            state: TcpState::Closed,
            timers: TcpTimers::default(),
            backoff: RetransmitState::Idle,
            rtt: RttEstimator::default(),
            dupacks: 0,
            maxseg: TCP_MSS_DEFAULT,
            force: false,
            ack_now: false,
            delayed_ack: false,
            sent_fin: false,
            idle: 0,
            snd_una: 0,
            snd_nxt: 0,
            snd_max: 0,
            snd_wl1: 0,
            snd_wl2: 0,
            iss: 0,
            snd_wnd: 0,
            max_sndwnd: 0,
            snd_cwnd: TCP_MAXWIN << 14,
            snd_ssthresh: TCP_MAXWIN << 14,
            rcv_wnd: 0,
            rcv_nxt: 0,
            rcv_adv: 0,
            irs: 0,
            last_ack_sent: 0,
            reassembly: Vec::new(),
            emu: Emulation::None,
        }
    }

    pub fn send_seq_init(&mut self, iss: u32) {
        self.iss = iss;
        self.snd_una = iss;
        self.snd_nxt = iss;
        self.snd_max = iss;
    }

    pub fn rcv_seq_init(&mut self, irs: u32) {
        self.irs = irs;
        self.rcv_nxt = irs.wrapping_add(1);
        self.rcv_adv = self.rcv_nxt;
    }

    /// Settle the segment size from the peer's offer and the link MTU, and
    /// reset the congestion window to match.
    pub fn set_mss(&mut self, mtu: usize, offer: Option<u16>) -> u16 {
        let mut mss = (mtu.saturating_sub(40)).min(u16::MAX as usize) as u16;
        if let Some(offer) = offer.filter(|&o| o != 0) {
            mss = mss.min(offer);
        }
        self.maxseg = mss.max(32);
        self.snd_cwnd = 2 * self.maxseg as u32;
        self.maxseg
    }

    /// Arm the persist timer with the current backoff applied and step the
    /// backoff.
    pub fn set_persist(&mut self) {
        let t = ((self.rtt.srtt >> 2) + self.rtt.rttvar).max(0) as u32 >> 1;
        let shift = self.backoff.shift();
        let value = range_set(t * TCP_BACKOFF[shift], TCPTV_PERSMIN, TCPTV_PERSMAX);
        self.timers.arm(TimerKind::Persist, value);
        if let Some(next) = self.backoff.escalate() {
            self.backoff = next;
        }
    }

    /// Fold the running round-trip measurement in and clear the backoff.
    pub fn rtt_sample(&mut self) {
        let rtt = self.rtt.rtt;
        self.rtt.update(rtt);
        self.backoff = RetransmitState::Idle;
    }

    /// Halve the effective window after loss.
    pub fn enter_loss_recovery(&mut self) {
        let win = (self.snd_wnd.min(self.snd_cwnd) / 2 / self.maxseg as u32).max(2);
        self.snd_ssthresh = win * self.maxseg as u32;
    }

    /// Open the congestion window for one new ACK: exponential below the
    /// threshold, linear above.
    pub fn open_cwnd(&mut self) {
        let cw = self.snd_cwnd;
        let mut incr = self.maxseg as u32;
        if cw > self.snd_ssthresh {
            incr = incr * incr / cw;
        }
        self.snd_cwnd = (cw + incr).min(TCP_MAXWIN);
    }

    /// Bytes the receive window currently advertises to the guest.
    pub fn advertised(&self) -> u32 {
        self.rcv_adv.wrapping_sub(self.rcv_nxt)
    }

    /// Insert an out-of-order segment, trimming it against its neighbours.
    /// Returns the segments that became redundant and must be freed, and
    /// whether `seg` itself was accepted.
    pub fn queue_segment(&mut self, mut seg: QueuedSegment) -> (bool, Vec<QueuedSegment>) {
        let mut discarded = Vec::new();
        let pos = self
            .reassembly
            .iter()
            .position(|q| seq_gt(q.seq, seg.seq))
            .unwrap_or(self.reassembly.len());

        if pos > 0 {
            let prev = self.reassembly[pos - 1];
            let overlap = prev.end().wrapping_sub(seg.seq) as i32;
            if overlap > 0 {
                let overlap = overlap as usize;
                if overlap >= seg.len {
                    return (false, discarded);
                }
                seg.seq = seg.seq.wrapping_add(overlap as u32);
                seg.len -= overlap;
                seg.data = seg.data.advance(overlap);
            }
        }

        while pos < self.reassembly.len() {
            let next = &mut self.reassembly[pos];
            let overlap = seg.end().wrapping_sub(next.seq) as i32;
            if overlap <= 0 {
                break;
            }
            let overlap = overlap as usize;
            if overlap < next.len {
                next.seq = next.seq.wrapping_add(overlap as u32);
                next.len -= overlap;
                next.data = next.data.advance(overlap);
                break;
            }
            discarded.push(self.reassembly.remove(pos));
        }

        self.reassembly.insert(pos, seg);
        (true, discarded)
    }

    /// Pop the head of the queue if it continues the in-order stream.
    pub fn next_in_order(&mut self) -> Option<QueuedSegment> {
        let first = self.reassembly.first()?;
        if first.seq != self.rcv_nxt || !self.state.have_established() {
            return None;
        }
        Some(self.reassembly.remove(0))
    }

    pub fn snd_nxt_behind_una(&self) -> bool {
        seq_lt(self.snd_nxt, self.snd_una)
    }
}

impl Default for Tcb {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use usernet_mbuf::MbufPool;

    fn seg(pool: &mut MbufPool, seq: u32, len: usize) -> QueuedSegment {
        let id = pool.allocate_from(&vec![0u8; len]).unwrap();
        QueuedSegment {
            seq,
            len,
            fin: false,
            data: Cursor::new(id, 0),
        }
    }

    #[test]
    fn test_set_mss_from_offer() {
        let mut tcb = Tcb::new();
        assert_eq!(tcb.set_mss(1500, Some(536)), 536);
        assert_eq!(tcb.snd_cwnd, 1072);
        let mut tcb = Tcb::new();
        assert_eq!(tcb.set_mss(1500, None), 1460);
    }

    #[test]
    fn test_queue_trims_predecessor_overlap() {
        let mut pool = MbufPool::default();
        let mut tcb = Tcb::new();
        let a = seg(&mut pool, 100, 10);
        let b = seg(&mut pool, 105, 10);
        assert!(tcb.queue_segment(a).0);
        let (accepted, dropped) = tcb.queue_segment(b);
        assert!(accepted);
        assert!(dropped.is_empty());
        assert_eq!(tcb.reassembly[1].seq, 110);
        assert_eq!(tcb.reassembly[1].len, 5);
        assert_eq!(tcb.reassembly[1].data.offset, 5);
    }

    #[test]
    fn test_queue_removes_covered_successors() {
        let mut pool = MbufPool::default();
        let mut tcb = Tcb::new();
        tcb.queue_segment(seg(&mut pool, 110, 5));
        tcb.queue_segment(seg(&mut pool, 120, 10));
        let (accepted, dropped) = tcb.queue_segment(seg(&mut pool, 100, 25));
        assert!(accepted);
        assert_eq!(dropped.len(), 1);
        assert_eq!(tcb.reassembly.len(), 2);
        assert_eq!(tcb.reassembly[1].seq, 125);
        assert_eq!(tcb.reassembly[1].len, 5);
    }

    #[test]
    fn test_queue_rejects_duplicate() {
        let mut pool = MbufPool::default();
        let mut tcb = Tcb::new();
        tcb.queue_segment(seg(&mut pool, 100, 10));
        let (accepted, _) = tcb.queue_segment(seg(&mut pool, 102, 4));
        assert!(!accepted);
        assert_eq!(tcb.reassembly.len(), 1);
    }

    #[test]
    fn test_next_in_order_requires_established() {
        let mut pool = MbufPool::default();
        let mut tcb = Tcb::new();
        tcb.rcv_nxt = 100;
        tcb.queue_segment(seg(&mut pool, 100, 10));
        tcb.state = TcpState::SynReceived;
        assert!(tcb.next_in_order().is_none());
        tcb.state = TcpState::Established;
        assert_eq!(tcb.next_in_order().unwrap().seq, 100);
    }

    #[test]
    fn test_persist_backoff_bounded() {
        let mut tcb = Tcb::new();
        for _ in 0..20 {
            tcb.set_persist();
            let t = tcb.timers.remaining(TimerKind::Persist).unwrap();
            assert!((TCPTV_PERSMIN..=TCPTV_PERSMAX).contains(&t));
        }
    }

    #[test]
    fn test_open_cwnd_slow_start_then_linear() {
        let mut tcb = Tcb::new();
        tcb.set_mss(1500, None);
        tcb.snd_ssthresh = 4 * 1460;
        tcb.open_cwnd();
        assert_eq!(tcb.snd_cwnd, 3 * 1460);
        tcb.snd_cwnd = 5 * 1460;
        tcb.open_cwnd();
        assert_eq!(tcb.snd_cwnd, 5 * 1460 + 1460 / 5);
    }
}
