//! Guest segment processing.
//!
//! Follows the 4.4BSD input path: locate or create the connection, trim the
//! segment to the receive window, then handle RST, SYN, ACK, data and FIN
//! in that order.

use super::output::{Endpoints, output, respond};
use super::subr::{
    close, connect_failed, drop_connection, enter_time_wait, fconnect, set_mss, tos_for,
};
use super::tcb::QueuedSegment;
use super::{
    TCP_DUPACK_THRESHOLD, TCP_MAXIDLE, TCP_MSS_DEFAULT, TCPTV_KEEP_IDLE, TCPTV_KEEP_INIT,
    TCPTV_MSL, Tcb, TcpState, TimerKind,
};
use crate::Stack;
use crate::socket::{Phase, SocketId, VirtualSocket};
use crate::wire::tcp_flags::*;
use crate::wire::{
    IP_PROTO_TCP, Ipv4Header, TCP_HLEN, TcpHeader, parse_mss_option, seq_gt, seq_leq, seq_lt,
    tcp_udp_checksum,
};
use std::net::Ipv4Addr;
use usernet_mbuf::{Cursor, MbufId};

/// A guest segment as it is trimmed and consumed. `off` is the first
/// payload byte within the datagram's buffer.
#[derive(Debug, Clone, Copy)]
struct Segment {
    src: Ipv4Addr,
    sport: u16,
    dst: Ipv4Addr,
    dport: u16,
    seq: u32,
    ack: u32,
    flags: u8,
    win: u32,
    mss: Option<u16>,
    off: usize,
    len: u32,
}

impl Segment {
    fn trim_front(&mut self, n: u32) {
        self.off += n as usize;
        self.seq = self.seq.wrapping_add(n);
        self.len -= n;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AckStep {
    Normal,
    /// Our SYN was just acknowledged; nothing else is to be retired.
    FromSynReceived,
    /// The segment completed our own open; go straight to the window.
    Skip,
}

enum Outcome {
    /// Free the datagram.
    Drop,
    /// The datagram now belongs to the connection.
    Keep,
    /// ACK the guest to resynchronise, then free.
    DropAfterAck(SocketId),
    /// Reset the guest, then free.
    DropWithReset,
    /// The old connection was closed; look the segment up again.
    Retry,
}

/// Process one TCP segment. `m` holds the whole datagram, header included,
/// and is consumed.
pub(crate) fn input(stack: &mut Stack, m: MbufId, ip: &Ipv4Header) {
    let Some(mut seg) = parse(stack, m, ip) else {
        let _ = stack.pool.free(m);
        return;
    };
    match process(stack, m, &mut seg) {
        Outcome::Keep => return,
        Outcome::Drop => {}
        Outcome::DropAfterAck(id) => {
            if seg.flags & RST == 0 {
                if let Some(tp) = stack.sockets.get_mut(id).and_then(|so| so.tcb_mut()) {
                    tp.ack_now = true;
                }
                output(stack, id);
            }
        }
        Outcome::DropWithReset => reset(stack, &seg),
        Outcome::Retry => return input(stack, m, ip),
    }
    let _ = stack.pool.free(m);
}

fn parse(stack: &Stack, m: MbufId, ip: &Ipv4Header) -> Option<Segment> {
    let data = stack.pool.data(m);
    let tcp = data.get(ip.header_len..)?;
    if tcp.len() < TCP_HLEN || tcp_udp_checksum(ip.src, ip.dst, IP_PROTO_TCP, tcp) != 0 {
        tracing::trace!(src = %ip.src, "bad tcp segment");
        return None;
    }
    let th = TcpHeader::parse(tcp)?;
    if th.data_offset < TCP_HLEN || th.data_offset > tcp.len() {
        return None;
    }
    let mss = if th.flags & SYN != 0 {
        parse_mss_option(&tcp[TCP_HLEN..th.data_offset])
    } else {
        None
    };
    Some(Segment {
        src: ip.src,
        sport: th.src_port,
        dst: ip.dst,
        dport: th.dst_port,
        seq: th.seq,
        ack: th.ack,
        flags: th.flags,
        win: th.window as u32,
        mss,
        off: ip.header_len + th.data_offset,
        len: (tcp.len() - th.data_offset) as u32,
    })
}

fn process(stack: &mut Stack, m: MbufId, seg: &mut Segment) -> Outcome {
    let id = match stack
        .sockets
        .find_tcp(seg.src, seg.sport, seg.dst, seg.dport)
    {
        Some(id) => id,
        None => {
            if seg.flags & (SYN | RST | ACK | FIN) != SYN {
                return Outcome::DropWithReset;
            }
            if seg.dst.is_broadcast()
                || seg.dst.is_multicast()
                || seg.dst == stack.config.broadcast_addr()
            {
                tracing::trace!(dst = %seg.dst, "ignoring syn to broadcast address");
                return Outcome::Drop;
            }
            let mut so = VirtualSocket::new_tcp(seg.src, seg.sport, seg.dst, seg.dport);
            let (tos, emu) = tos_for(seg.sport, seg.dport);
            so.tos = tos;
            let mut tcb = Tcb::new();
            tcb.emu = emu;
            tcb.state = TcpState::Listen;
            so.tcb = Some(Box::new(tcb));
            match stack.sockets.insert(so) {
                Ok(id) => id,
                Err(e) => {
                    tracing::debug!(error = %e, "refusing guest connection");
                    return Outcome::DropWithReset;
                }
            }
        }
    };

    let mtu = stack.config.mtu;
    let Some(so) = stack.sockets.get_mut(id) else {
        return Outcome::Drop;
    };
    if so.state.phase == Phase::Connecting {
        // Still waiting on the host connect; the guest will retransmit.
        return Outcome::Drop;
    }
    let rcv_space = so.rcv_space() as u32;
    let Some(tp) = so.tcb.as_deref_mut() else {
        return Outcome::Drop;
    };
    if tp.state == TcpState::Closed {
        return Outcome::Drop;
    }

    tp.idle = 0;
    tp.timers.arm(TimerKind::Keepalive, TCPTV_KEEP_IDLE);
    let advertised = tp.advertised() as i32;
    tp.rcv_wnd = if advertised > 0 {
        rcv_space.max(advertised as u32)
    } else {
        rcv_space
    };

    match tp.state {
        TcpState::Listen => return listen_input(stack, id, m, seg, mtu),
        TcpState::SynSent => {
            if seg.flags & ACK != 0 && (seq_leq(seg.ack, tp.iss) || seq_gt(seg.ack, tp.snd_max))
            {
                return Outcome::DropWithReset;
            }
            if seg.flags & RST != 0 {
                if seg.flags & ACK != 0 {
                    tracing::debug!(lport = seg.sport, "guest refused connection");
                    drop_connection(stack, id);
                }
                return Outcome::Drop;
            }
            if seg.flags & SYN == 0 {
                return Outcome::Drop;
            }
            if seg.flags & ACK != 0 {
                tp.snd_una = seg.ack;
                if seq_lt(tp.snd_nxt, tp.snd_una) {
                    tp.snd_nxt = tp.snd_una;
                }
            }
            tp.timers.cancel(TimerKind::Retransmit);
            tp.rcv_seq_init(seg.seq);
            tp.ack_now = true;
            if seg.flags & ACK != 0 && seq_gt(tp.snd_una, tp.iss) {
                tp.state = TcpState::Established;
                if tp.rtt.is_timing() {
                    tp.rtt_sample();
                }
            } else {
                tp.state = TcpState::SynReceived;
            }
            // The SYN occupies one sequence number.
            seg.seq = seg.seq.wrapping_add(1);
            if seg.len > tp.rcv_wnd {
                seg.len = tp.rcv_wnd;
                seg.flags &= !FIN;
            }
            tp.snd_wl1 = seg.seq.wrapping_sub(1);
            let offer = seg.mss;
            if let Some(so) = stack.sockets.get_mut(id) {
                set_mss(so, mtu, offer.or(Some(TCP_MSS_DEFAULT)));
            }
            return after_ack(stack, id, m, seg, AckStep::Skip);
        }
        _ => {}
    }

    // Trim anything already received off the front.
    let mut todrop = tp.rcv_nxt.wrapping_sub(seg.seq) as i32;
    if todrop > 0 {
        if seg.flags & SYN != 0 {
            seg.flags &= !SYN;
            seg.seq = seg.seq.wrapping_add(1);
            todrop -= 1;
        }
        if todrop as u32 > seg.len || (todrop as u32 == seg.len && seg.flags & FIN == 0) {
            // Entirely old: resynchronise but keep going for RST or ACK.
            seg.flags &= !FIN;
            tp.ack_now = true;
            todrop = seg.len as i32;
        }
        seg.trim_front(todrop as u32);
    }

    // Data for a connection whose host side is gone.
    if so.state.phase == Phase::NoFd && tp.state > TcpState::CloseWait && seg.len > 0 {
        close(stack, id);
        return Outcome::DropWithReset;
    }

    // Trim anything beyond the window off the back.
    let todrop = seg
        .seq
        .wrapping_add(seg.len)
        .wrapping_sub(tp.rcv_nxt.wrapping_add(tp.rcv_wnd)) as i32;
    if todrop > 0 {
        if todrop as u32 >= seg.len {
            if seg.flags & SYN != 0
                && tp.state == TcpState::TimeWait
                && seq_gt(seg.seq, tp.rcv_nxt)
            {
                close(stack, id);
                return Outcome::Retry;
            }
            if tp.rcv_wnd == 0 && seg.seq == tp.rcv_nxt {
                tp.ack_now = true;
            } else {
                return Outcome::DropAfterAck(id);
            }
        }
        seg.len -= (todrop as u32).min(seg.len);
        seg.flags &= !(PSH | FIN);
    }

    if seg.flags & RST != 0 {
        tracing::debug!(lport = seg.sport, state = ?tp.state, "guest reset connection");
        match tp.state {
            TcpState::SynReceived
            | TcpState::Established
            | TcpState::FinWait1
            | TcpState::FinWait2
            | TcpState::CloseWait => {
                tp.state = TcpState::Closed;
                close(stack, id);
            }
            TcpState::Closing | TcpState::LastAck | TcpState::TimeWait => close(stack, id),
            _ => {}
        }
        return Outcome::Drop;
    }

    if seg.flags & SYN != 0 {
        drop_connection(stack, id);
        return Outcome::DropWithReset;
    }

    if seg.flags & ACK == 0 {
        return Outcome::Drop;
    }

    let mut step = AckStep::Normal;
    if tp.state == TcpState::SynReceived {
        if seq_gt(tp.snd_una, seg.ack) || seq_gt(seg.ack, tp.snd_max) {
            return Outcome::DropWithReset;
        }
        tp.state = TcpState::Established;
        tp.snd_una = seg.ack;
        tp.snd_wl1 = seg.seq.wrapping_sub(1);
        tracing::debug!(lport = seg.sport, fport = seg.dport, "tcp established");
        step = AckStep::FromSynReceived;
        present(stack, id);
    }
    after_ack(stack, id, m, seg, step)
}

/// A SYN for a new connection: start the host connect and hold the SYN
/// until it completes.
fn listen_input(
    stack: &mut Stack,
    id: SocketId,
    m: MbufId,
    seg: &mut Segment,
    mtu: usize,
) -> Outcome {
    if seg.flags & RST != 0 {
        return Outcome::Drop;
    }
    if seg.flags & ACK != 0 {
        return Outcome::DropWithReset;
    }
    if seg.flags & SYN == 0 {
        return Outcome::Drop;
    }
    if let Some(so) = stack.sockets.get_mut(id) {
        set_mss(so, mtu, seg.mss.or(Some(TCP_MSS_DEFAULT)));
        if let Some(tp) = so.tcb_mut() {
            tp.rcv_seq_init(seg.seq);
            tp.snd_wnd = seg.win;
            tp.max_sndwnd = seg.win;
        }
    }
    // Held from here on: a failed connect quotes it back to the guest.
    match stack.sockets.get_mut(id) {
        Some(so) => so.saved = Some(m),
        None => return Outcome::Drop,
    }
    if let Err(e) = fconnect(stack, id) {
        connect_failed(stack, id, e);
        return Outcome::Keep;
    }
    let Some(so) = stack.sockets.get_mut(id) else {
        return Outcome::Keep;
    };
    if let Some(tp) = so.tcb_mut() {
        tp.timers.arm(TimerKind::Keepalive, TCPTV_KEEP_INIT);
        tp.state = TcpState::SynReceived;
    }
    Outcome::Keep
}

/// ACK processing onward: retire acknowledged data, update the send window,
/// take in data and FIN, and send whatever that calls for.
fn after_ack(
    stack: &mut Stack,
    id: SocketId,
    m: MbufId,
    seg: &mut Segment,
    step: AckStep,
) -> Outcome {
    let mut need_output = false;
    let Some(so) = stack.sockets.get_mut(id) else {
        return Outcome::Drop;
    };
    let cant_rcv_more = so.state.cant_rcv_more;
    let Some(tp) = so.tcb.as_deref_mut() else {
        return Outcome::Drop;
    };

    if step != AckStep::Skip {
        let duplicate = step == AckStep::Normal && seq_leq(seg.ack, tp.snd_una);
        if duplicate {
            if seg.len == 0 && seg.win == tp.snd_wnd {
                if !tp.timers.is_armed(TimerKind::Retransmit) || seg.ack != tp.snd_una {
                    tp.dupacks = 0;
                } else {
                    tp.dupacks += 1;
                    if tp.dupacks == TCP_DUPACK_THRESHOLD {
                        // Fast retransmit of the missing segment.
                        let onxt = tp.snd_nxt;
                        tp.enter_loss_recovery();
                        tp.timers.cancel(TimerKind::Retransmit);
                        tp.rtt.rtt = 0;
                        tp.snd_nxt = seg.ack;
                        tp.snd_cwnd = tp.maxseg as u32;
                        output(stack, id);
                        if let Some(tp) = stack.sockets.get_mut(id).and_then(|so| so.tcb_mut()) {
                            tp.snd_cwnd = tp.snd_ssthresh + tp.maxseg as u32 * tp.dupacks;
                            if seq_gt(onxt, tp.snd_nxt) {
                                tp.snd_nxt = onxt;
                            }
                        }
                        return Outcome::Drop;
                    } else if tp.dupacks > TCP_DUPACK_THRESHOLD {
                        tp.snd_cwnd += tp.maxseg as u32;
                        output(stack, id);
                        return Outcome::Drop;
                    }
                }
            } else {
                tp.dupacks = 0;
            }
        } else {
            if tp.dupacks > TCP_DUPACK_THRESHOLD && tp.snd_cwnd > tp.snd_ssthresh {
                tp.snd_cwnd = tp.snd_ssthresh;
            }
            tp.dupacks = 0;
            if seq_gt(seg.ack, tp.snd_max) {
                return Outcome::DropAfterAck(id);
            }
            let acked = seg.ack.wrapping_sub(tp.snd_una);

            if tp.rtt.is_timing() && seq_gt(seg.ack, tp.rtt.rtseq) {
                tp.rtt_sample();
            }
            if seg.ack == tp.snd_max {
                tp.timers.cancel(TimerKind::Retransmit);
                need_output = true;
            } else if !tp.timers.is_armed(TimerKind::Persist) {
                tp.timers.arm(TimerKind::Retransmit, tp.rtt.rxtcur);
            }
            tp.open_cwnd();

            let buffered = so.snd.len() as u32;
            let fin_acked = if acked > buffered {
                tp.snd_wnd = tp.snd_wnd.saturating_sub(buffered);
                so.snd.clear();
                true
            } else {
                so.snd.drop_front(acked as usize);
                tp.snd_wnd = tp.snd_wnd.saturating_sub(acked);
                false
            };
            tp.snd_una = seg.ack;
            if seq_lt(tp.snd_nxt, tp.snd_una) {
                tp.snd_nxt = tp.snd_una;
            }

            match tp.state {
                TcpState::FinWait1 if fin_acked => {
                    if cant_rcv_more {
                        tp.timers.arm(TimerKind::TwoMsl, TCP_MAXIDLE);
                    }
                    tp.state = TcpState::FinWait2;
                }
                TcpState::Closing if fin_acked => enter_time_wait(tp),
                TcpState::LastAck if fin_acked => {
                    close(stack, id);
                    return Outcome::Drop;
                }
                TcpState::TimeWait => {
                    tp.timers.arm(TimerKind::TwoMsl, 2 * TCPTV_MSL);
                    return Outcome::DropAfterAck(id);
                }
                _ => {}
            }
        }
    }

    // Window update.
    if seg.flags & ACK != 0
        && (seq_lt(tp.snd_wl1, seg.seq)
            || (tp.snd_wl1 == seg.seq
                && (seq_lt(tp.snd_wl2, seg.ack)
                    || (tp.snd_wl2 == seg.ack && seg.win > tp.snd_wnd))))
    {
        tp.snd_wnd = seg.win;
        tp.snd_wl1 = seg.seq;
        tp.snd_wl2 = seg.ack;
        tp.max_sndwnd = tp.max_sndwnd.max(tp.snd_wnd);
        need_output = true;
    }

    let mut kept = false;
    let mut fin = seg.flags & FIN != 0;
    if (seg.len > 0 || fin) && !tp.state.have_received_fin() {
        if seg.seq == tp.rcv_nxt && tp.reassembly.is_empty() && tp.state == TcpState::Established
        {
            if seg.flags & PSH != 0 {
                tp.ack_now = true;
            } else {
                tp.delayed_ack = true;
            }
            tp.rcv_nxt = tp.rcv_nxt.wrapping_add(seg.len);
            if seg.len > 0 {
                let bytes = stack.pool.data(m)[seg.off..seg.off + seg.len as usize].to_vec();
                deliver(stack, id, bytes);
            }
        } else {
            let queued = QueuedSegment {
                seq: seg.seq,
                len: seg.len as usize,
                fin,
                data: Cursor::new(m, seg.off),
            };
            let (accepted, discarded) = tp.queue_segment(queued);
            tp.ack_now = true;
            kept = accepted;
            for old in discarded {
                let _ = stack.pool.free(old.data.id);
            }
            fin = present(stack, id);
        }
    } else {
        fin = false;
    }

    if fin {
        let Some(so) = stack.sockets.get_mut(id) else {
            return keep_or_drop(kept);
        };
        let Some(tp) = so.tcb.as_deref_mut() else {
            return keep_or_drop(kept);
        };
        if !tp.state.have_received_fin() {
            tp.ack_now = true;
            tp.rcv_nxt = tp.rcv_nxt.wrapping_add(1);
            so.fwdrain();
        }
        let Some(tp) = so.tcb.as_deref_mut() else {
            return keep_or_drop(kept);
        };
        match tp.state {
            TcpState::SynReceived | TcpState::Established => tp.state = TcpState::CloseWait,
            TcpState::FinWait1 => tp.state = TcpState::Closing,
            TcpState::FinWait2 => {
                enter_time_wait(tp);
                so.disconnected();
            }
            TcpState::TimeWait => tp.timers.arm(TimerKind::TwoMsl, 2 * TCPTV_MSL),
            _ => {}
        }
    }

    let ack_now = stack
        .sockets
        .get(id)
        .and_then(|so| so.tcb())
        .is_some_and(|tp| tp.ack_now);
    if need_output || ack_now {
        output(stack, id);
    }
    keep_or_drop(kept)
}

fn keep_or_drop(kept: bool) -> Outcome {
    if kept { Outcome::Keep } else { Outcome::Drop }
}

/// Hand queued segments that now continue the stream to the host side.
/// Returns whether the last one carried a FIN.
fn present(stack: &mut Stack, id: SocketId) -> bool {
    let mut fin = false;
    loop {
        let Some(so) = stack.sockets.get_mut(id) else {
            return fin;
        };
        let cant_send_more = so.state.cant_send_more;
        let Some(tp) = so.tcb.as_deref_mut() else {
            return fin;
        };
        let Some(seg) = tp.next_in_order() else {
            return fin;
        };
        tp.rcv_nxt = tp.rcv_nxt.wrapping_add(seg.len as u32);
        fin = seg.fin;
        let bytes = stack
            .pool
            .data(seg.data.id)
            .get(seg.data.offset..seg.data.offset + seg.len)
            .map(<[u8]>::to_vec)
            .unwrap_or_default();
        let _ = stack.pool.free(seg.data.id);
        if !cant_send_more && !bytes.is_empty() {
            deliver(stack, id, bytes);
        }
    }
}

/// Queue in-order guest bytes for the host, rewriting them first if the
/// flow carries an emulated protocol.
fn deliver(stack: &mut Stack, id: SocketId, bytes: Vec<u8>) {
    let bytes = crate::emu::rewrite(stack, id, bytes);
    if let Some(so) = stack.sockets.get_mut(id) {
        so.rcv.extend(&bytes);
    }
}

/// Answer an unacceptable segment with a reset.
fn reset(stack: &mut Stack, seg: &Segment) {
    if seg.flags & RST != 0 {
        return;
    }
    let ends = Endpoints {
        src: seg.dst,
        sport: seg.dport,
        dst: seg.src,
        dport: seg.sport,
    };
    if seg.flags & ACK != 0 {
        respond(stack, ends, 0, seg.ack, RST, 0);
    } else {
        let len = seg.len + (seg.flags & SYN != 0) as u32;
        respond(stack, ends, seg.seq.wrapping_add(len), 0, RST | ACK, 0);
    }
}
