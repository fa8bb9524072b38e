//! Segment transmission toward the guest.

use super::{TCP_MAXWIN, TcpState, TimerKind, RetransmitState};
use crate::Stack;
use crate::ip::{self, IpOut};
use crate::socket::SocketId;
use crate::wire::tcp_flags::*;
use crate::wire::{
    IP_PROTO_TCP, TCP_HLEN, TcpHeader, mss_option, seq_gt, seq_lt, tcp_udp_checksum,
};
use std::net::Ipv4Addr;

/// Addressing of a segment: `src` is the peer as the guest sees it, `dst`
/// the guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Endpoints {
    pub src: Ipv4Addr,
    pub sport: u16,
    pub dst: Ipv4Addr,
    pub dport: u16,
}

struct OutSegment {
    ends: Endpoints,
    tos: u8,
    seq: u32,
    ack: u32,
    flags: u8,
    window: u16,
    mss: Option<u16>,
    payload: Vec<u8>,
    more: bool,
}

/// Send whatever the connection's state calls for: data, a FIN, a window
/// update, or nothing.
pub(crate) fn output(stack: &mut Stack, id: SocketId) {
    while let Some(seg) = next_segment(stack, id) {
        let more = seg.more;
        let header = TcpHeader {
            src_port: seg.ends.sport,
            dst_port: seg.ends.dport,
            seq: seg.seq,
            ack: seg.ack,
            data_offset: 0,
            flags: seg.flags,
            window: seg.window,
        };
        let options = seg.mss.map(mss_option);
        emit(
            stack,
            seg.ends,
            seg.tos,
            header,
            options.as_ref().map(|o| &o[..]).unwrap_or(&[]),
            &seg.payload,
        );
        if !more {
            break;
        }
    }
}

fn next_segment(stack: &mut Stack, id: SocketId) -> Option<OutSegment> {
    let our_mss = stack.config.mtu.saturating_sub(40) as u16;
    let so = stack.sockets.get_mut(id)?;
    let ends = Endpoints {
        src: so.faddr,
        sport: so.fport,
        dst: so.laddr,
        dport: so.lport,
    };
    let tos = so.tos;
    let snd_len = so.snd.len() as u32;
    let rcv_space = so.rcv_space() as u32;
    let rcv_cap = so.rcv.capacity() as u32;
    let tp = so.tcb.as_deref_mut()?;
    if tp.state == TcpState::Listen {
        return None;
    }
    let maxseg = tp.maxseg as u32;

    // Restart slow start after an idle period.
    let idle = tp.snd_max == tp.snd_una;
    if idle && tp.idle >= tp.rtt.rxtcur {
        tp.snd_cwnd = maxseg;
    }

    let off = tp.snd_nxt.wrapping_sub(tp.snd_una);
    let mut win = tp.snd_wnd.min(tp.snd_cwnd);
    let mut flags = tp.state.out_flags();

    if tp.force {
        if win == 0 {
            if off < snd_len {
                flags &= !FIN;
            }
            win = 1;
        } else {
            tp.timers.cancel(TimerKind::Persist);
            tp.backoff = RetransmitState::Idle;
        }
    }

    let mut len = snd_len.min(win) as i64 - off as i64;
    if len < 0 {
        len = 0;
        if win == 0 {
            tp.timers.cancel(TimerKind::Retransmit);
            tp.snd_nxt = tp.snd_una;
        }
    }
    // Data only flows once the handshake is done.
    if !tp.state.have_established() {
        len = 0;
    }
    let mut more = false;
    if len > maxseg as i64 {
        len = maxseg as i64;
        more = true;
    }
    let len = len as u32;
    if seq_lt(
        tp.snd_nxt.wrapping_add(len),
        tp.snd_una.wrapping_add(snd_len),
    ) {
        flags &= !FIN;
    }

    let send = 'decide: {
        if len > 0 {
            if len == maxseg
                || (idle && len + off >= snd_len)
                || tp.force
                || (tp.max_sndwnd > 0 && len >= tp.max_sndwnd / 2)
                || seq_lt(tp.snd_nxt, tp.snd_max)
            {
                break 'decide true;
            }
        }
        // Window update worth telling the guest about.
        if rcv_space > 0 {
            let adv = rcv_space.min(TCP_MAXWIN) as i64 - tp.advertised() as i32 as i64;
            if adv >= 2 * maxseg as i64 || 2 * adv >= rcv_cap as i64 {
                break 'decide true;
            }
        }
        if tp.ack_now || flags & (SYN | RST) != 0 {
            break 'decide true;
        }
        flags & FIN != 0 && (!tp.sent_fin || tp.snd_nxt == tp.snd_una)
    };

    if !send {
        // Data queued but the window is shut: probe it.
        if snd_len > 0
            && !tp.timers.is_armed(TimerKind::Retransmit)
            && !tp.timers.is_armed(TimerKind::Persist)
        {
            tp.backoff = RetransmitState::Idle;
            tp.set_persist();
        }
        return None;
    }

    let mss = if flags & SYN != 0 {
        tp.snd_nxt = tp.iss;
        Some(our_mss)
    } else {
        None
    };

    let mut payload = Vec::new();
    if len > 0 {
        so_copy(&so.snd, off, len, &mut payload);
        if off + len == snd_len {
            flags |= PSH;
        }
    }

    // Retransmitting our FIN: back up over it.
    if flags & FIN != 0 && tp.sent_fin && tp.snd_nxt == tp.snd_max {
        tp.snd_nxt = tp.snd_nxt.wrapping_sub(1);
    }

    let seq = if len > 0 || flags & (SYN | FIN) != 0 || tp.timers.is_armed(TimerKind::Persist) {
        tp.snd_nxt
    } else {
        tp.snd_max
    };
    let ack = tp.rcv_nxt;

    // Receiver side silly-window avoidance.
    let mut win = rcv_space;
    if win < rcv_cap / 4 && win < maxseg {
        win = 0;
    }
    win = win.min(TCP_MAXWIN);
    let advertised = tp.advertised() as i32;
    if (win as i64) < advertised as i64 {
        win = advertised as u32;
    }

    if !tp.force || !tp.timers.is_armed(TimerKind::Persist) {
        let start = tp.snd_nxt;
        if flags & (SYN | FIN) != 0 {
            if flags & FIN != 0 {
                tp.sent_fin = true;
            }
            tp.snd_nxt = tp.snd_nxt.wrapping_add(1);
        }
        tp.snd_nxt = tp.snd_nxt.wrapping_add(len);
        if seq_gt(tp.snd_nxt, tp.snd_max) {
            tp.snd_max = tp.snd_nxt;
            if !tp.rtt.is_timing() {
                tp.rtt.start(start);
            }
        }
        if !tp.timers.is_armed(TimerKind::Retransmit) && tp.snd_nxt != tp.snd_una {
            tp.timers.arm(TimerKind::Retransmit, tp.rtt.rxtcur);
            if tp.timers.is_armed(TimerKind::Persist) {
                tp.timers.cancel(TimerKind::Persist);
                tp.backoff = RetransmitState::Idle;
            }
        }
    } else if seq_gt(tp.snd_nxt.wrapping_add(len), tp.snd_max) {
        tp.snd_max = tp.snd_nxt.wrapping_add(len);
    }

    if win > 0 && seq_gt(tp.rcv_nxt.wrapping_add(win), tp.rcv_adv) {
        tp.rcv_adv = tp.rcv_nxt.wrapping_add(win);
    }
    tp.last_ack_sent = tp.rcv_nxt;
    tp.ack_now = false;
    tp.delayed_ack = false;

    tracing::trace!(seq, ack, flags, len, win, "tcp output");
    Some(OutSegment {
        ends,
        tos,
        seq,
        ack,
        flags,
        window: win as u16,
        mss,
        payload,
        more,
    })
}

fn so_copy(snd: &crate::sbuf::SBuf, off: u32, len: u32, out: &mut Vec<u8>) {
    snd.copy_out(off as usize, len as usize, out);
}

/// Send a bare control segment outside the normal output path: resets,
/// keepalive probes, refusals.
pub(crate) fn respond(
    stack: &mut Stack,
    ends: Endpoints,
    ack: u32,
    seq: u32,
    flags: u8,
    window: u16,
) {
    let header = TcpHeader {
        src_port: ends.sport,
        dst_port: ends.dport,
        seq,
        ack,
        data_offset: 0,
        flags,
        window,
    };
    tracing::trace!(seq, ack, flags, "tcp respond");
    emit(stack, ends, 0, header, &[], &[]);
}

fn emit(
    stack: &mut Stack,
    ends: Endpoints,
    tos: u8,
    header: TcpHeader,
    options: &[u8],
    payload: &[u8],
) {
    let m = match stack.pool.allocate() {
        Ok(m) => m,
        Err(e) => {
            tracing::debug!(error = %e, "dropping tcp segment");
            return;
        }
    };
    let Some(mbuf) = stack.pool.get_mut(m) else {
        return;
    };
    let hlen = TCP_HLEN + options.len();
    mbuf.append(&[0u8; TCP_HLEN + 4][..hlen]);
    header.emit(mbuf.data_mut(), options);
    mbuf.append(payload);
    let sum = tcp_udp_checksum(ends.src, ends.dst, IP_PROTO_TCP, mbuf.data());
    mbuf.data_mut()[16..18].copy_from_slice(&sum.to_be_bytes());
    ip::output(
        stack,
        m,
        IpOut {
            src: ends.src,
            dst: ends.dst,
            proto: IP_PROTO_TCP,
            tos,
        },
    );
}
