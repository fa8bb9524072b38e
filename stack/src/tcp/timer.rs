//! Named per-connection timers and the round-trip estimator.

use super::{TCP_BACKOFF, TCP_MAXRXTSHIFT, TCPTV_MIN, TCPTV_REXMTMAX, TCPTV_SRTTDFLT};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    Retransmit,
    Persist,
    Keepalive,
    TwoMsl,
}

impl TimerKind {
    pub const ALL: [TimerKind; 4] = [
        TimerKind::Retransmit,
        TimerKind::Persist,
        TimerKind::Keepalive,
        TimerKind::TwoMsl,
    ];

    fn slot(self) -> usize {
        match self {
            TimerKind::Retransmit => 0,
            TimerKind::Persist => 1,
            TimerKind::Keepalive => 2,
            TimerKind::TwoMsl => 3,
        }
    }
}

/// Countdowns in slow ticks. An unarmed timer is `None`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TcpTimers {
    slots: [Option<u32>; 4],
}

impl TcpTimers {
    pub fn arm(&mut self, kind: TimerKind, ticks: u32) {
        self.slots[kind.slot()] = (ticks > 0).then_some(ticks);
    }

    pub fn cancel(&mut self, kind: TimerKind) {
        self.slots[kind.slot()] = None;
    }

    pub fn cancel_all(&mut self) {
        self.slots = [None; 4];
    }

    pub fn is_armed(&self, kind: TimerKind) -> bool {
        self.slots[kind.slot()].is_some()
    }

    pub fn remaining(&self, kind: TimerKind) -> Option<u32> {
        self.slots[kind.slot()]
    }

    /// Count every armed timer down by one tick and report those that hit
    /// zero, in firing order.
    pub fn tick(&mut self) -> Vec<TimerKind> {
        let mut fired = Vec::new();
        for kind in TimerKind::ALL {
            let slot = &mut self.slots[kind.slot()];
            if let Some(t) = slot {
                *t -= 1;
                if *t == 0 {
                    *slot = None;
                    fired.push(kind);
                }
            }
        }
        fired
    }
}

/// Retransmission backoff. `Idle` until a retransmit or persist probe has
/// fired; each further firing moves one step along [`TCP_BACKOFF`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RetransmitState {
    #[default]
    Idle,
    Backoff { shift: usize },
}

impl RetransmitState {
    pub fn shift(self) -> usize {
        match self {
            RetransmitState::Idle => 0,
            RetransmitState::Backoff { shift } => shift,
        }
    }

    pub fn multiplier(self) -> u32 {
        TCP_BACKOFF[self.shift().min(TCP_MAXRXTSHIFT)]
    }

    /// Advance one step. `None` once the ceiling is passed: give up.
    pub fn escalate(self) -> Option<Self> {
        let shift = self.shift() + 1;
        (shift <= TCP_MAXRXTSHIFT).then_some(RetransmitState::Backoff { shift })
    }
}

/// Clamp `value` into `[min, max]`.
pub fn range_set(value: u32, min: u32, max: u32) -> u32 {
    value.clamp(min, max)
}

/// Smoothed round-trip time and variance, fixed point as in BSD: `srtt` is
/// scaled by 8, `rttvar` by 4.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RttEstimator {
    pub srtt: i32,
    pub rttvar: i32,
    pub rttmin: u32,
    /// Ticks the timed segment has been outstanding; 0 when nothing is timed.
    pub rtt: u32,
    /// Sequence number being timed.
    pub rtseq: u32,
    /// Current retransmit timeout in ticks.
    pub rxtcur: u32,
}

const RTT_SHIFT: i32 = 3;
const RTTVAR_SHIFT: i32 = 2;

impl Default for RttEstimator {
    fn default() -> Self {
        let rttvar = (TCPTV_SRTTDFLT << 2) as i32;
        Self {
            srtt: 0,
            rttvar,
            rttmin: TCPTV_MIN,
            rtt: 0,
            rtseq: 0,
            rxtcur: range_set((rttvar as u32) >> 1, TCPTV_MIN, TCPTV_REXMTMAX),
        }
    }
}

impl RttEstimator {
    /// Base retransmit value before backoff: srtt + 4 * rttvar, unscaled.
    pub fn rexmt_value(&self) -> u32 {
        ((self.srtt >> RTT_SHIFT) + self.rttvar).max(0) as u32
    }

    /// Begin timing the segment starting at `seq`.
    pub fn start(&mut self, seq: u32) {
        self.rtt = 1;
        self.rtseq = seq;
    }

    pub fn is_timing(&self) -> bool {
        self.rtt != 0
    }

    /// Fold a measured round trip of `rtt` ticks into the estimate.
    pub fn update(&mut self, rtt: u32) {
        let rtt = rtt as i32;
        if self.srtt != 0 {
            let mut delta = rtt - 1 - (self.srtt >> RTT_SHIFT);
            self.srtt += delta;
            if self.srtt <= 0 {
                self.srtt = 1;
            }
            if delta < 0 {
                delta = -delta;
            }
            delta -= self.rttvar >> RTTVAR_SHIFT;
            self.rttvar += delta;
            if self.rttvar <= 0 {
                self.rttvar = 1;
            }
        } else {
            self.srtt = rtt << RTT_SHIFT;
            self.rttvar = rtt << (RTTVAR_SHIFT - 1);
        }
        self.rtt = 0;
        self.rxtcur = range_set(self.rexmt_value(), self.rttmin, TCPTV_REXMTMAX);
    }

    /// After repeated timeouts the estimate is no longer trusted; keep the
    /// variance, forget the mean.
    pub fn discard_srtt(&mut self) {
        self.rttvar += self.srtt >> RTT_SHIFT;
        self.srtt = 0;
    }
}
