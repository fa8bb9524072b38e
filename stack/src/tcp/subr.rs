//! Connection lifecycle: opening, accepting, closing, and the timer sweeps.

use super::output::{Endpoints, output, respond};
use super::{
    Emulation, RetransmitState, TCP_ISSINCR, TCP_MAXIDLE, TCP_MAXRXTSHIFT, TCPTV_KEEP_IDLE,
    TCPTV_KEEP_INIT, TCPTV_KEEPINTVL, TCPTV_MSL, TCPTV_REXMTMAX, Tcb, TcpState, TimerKind,
    timer::range_set,
};
use crate::host::{self, HostSocket};
use crate::icmp;
use crate::socket::{Phase, SOCKET_BUFFER, SocketId, VirtualSocket};
use crate::wire::tcp_flags::*;
use crate::wire::{IPTOS_LOWDELAY, IPTOS_THROUGHPUT};
use crate::{Stack, StackError};
use std::io;
use std::net::{Ipv4Addr, SocketAddrV4};

/// Type of service and payload emulation for a flow between guest port
/// `lport` and peer port `fport`.
pub(crate) fn tos_for(lport: u16, fport: u16) -> (u8, Emulation) {
    if fport == 20 {
        return (IPTOS_THROUGHPUT, Emulation::None);
    }
    if lport == 21 || fport == 21 {
        return (IPTOS_LOWDELAY, Emulation::Ftp);
    }
    match fport {
        23 | 513 | 543 => (IPTOS_LOWDELAY, Emulation::None),
        80 => (IPTOS_THROUGHPUT, Emulation::None),
        514 | 544 => (IPTOS_LOWDELAY, Emulation::Ksh),
        6667 | 6668 => (IPTOS_THROUGHPUT, Emulation::Irc),
        7070 => (IPTOS_LOWDELAY, Emulation::RealAudio(Default::default())),
        113 => (IPTOS_LOWDELAY, Emulation::Ident(Vec::new())),
        _ => (0, Emulation::None),
    }
}

pub(crate) fn endpoints(so: &VirtualSocket) -> Endpoints {
    Endpoints {
        src: so.faddr,
        sport: so.fport,
        dst: so.laddr,
        dport: so.lport,
    }
}

/// Settle MSS for a connection and size both rings to whole segments.
pub(crate) fn set_mss(so: &mut VirtualSocket, mtu: usize, offer: Option<u16>) {
    let Some(tp) = so.tcb.as_deref_mut() else {
        return;
    };
    let mss = tp.set_mss(mtu, offer) as usize;
    let rounded = SOCKET_BUFFER.div_ceil(mss) * mss;
    so.snd.reserve(rounded);
    so.rcv.reserve(rounded);
}

/// Start the host side of a guest-initiated connection.
pub(crate) fn fconnect(stack: &mut Stack, id: SocketId) -> io::Result<()> {
    let Some(so) = stack.sockets.get_mut(id) else {
        return Ok(());
    };
    let target = SocketAddrV4::new(stack.config.host_target(so.faddr), so.fport);
    tracing::debug!(guest = %so.laddr, lport = so.lport, %target, "tcp connect");
    let stream = host::connect_nonblocking(target)?;
    so.host = HostSocket::Stream(stream);
    so.set_phase(Phase::Connecting);
    Ok(())
}

/// The host connect finished successfully: answer the guest's SYN.
pub(crate) fn connect_completed(stack: &mut Stack, id: SocketId) {
    stack.tcp_iss = stack.tcp_iss.wrapping_add(TCP_ISSINCR / 2);
    let iss = stack.tcp_iss;
    let saved = {
        let Some(so) = stack.sockets.get_mut(id) else {
            return;
        };
        so.set_phase(Phase::Connected);
        let saved = so.saved.take();
        let Some(tp) = so.tcb.as_deref_mut() else {
            return;
        };
        tp.send_seq_init(iss);
        tp.ack_now = true;
        tp.state = TcpState::SynReceived;
        tp.timers.arm(TimerKind::Keepalive, TCPTV_KEEP_INIT);
        tp.snd_wl1 = tp.irs;
        tracing::debug!(lport = so.lport, fport = so.fport, "tcp host connected");
        saved
    };
    if let Some(m) = saved {
        let _ = stack.pool.free(m);
    }
    output(stack, id);
}

/// The host connect failed: refuse the guest with a reset, or report the
/// destination unreachable, then forget the connection.
pub(crate) fn connect_failed(stack: &mut Stack, id: SocketId, err: io::Error) {
    let Some(so) = stack.sockets.get(id) else {
        return;
    };
    tracing::debug!(error = %err, lport = so.lport, fport = so.fport, "tcp connect failed");
    let ends = endpoints(so);
    let irs = so.tcb().map(|tp| tp.irs).unwrap_or(0);
    let saved = so.saved.map(|m| stack.pool.data(m).to_vec());
    if err.kind() == io::ErrorKind::ConnectionRefused {
        respond(stack, ends, irs.wrapping_add(1), 0, RST | ACK, 0);
    } else if let Some(orig) = saved {
        icmp::error(stack, &orig, icmp::UNREACH, unreach_code(&err));
    }
    close(stack, id);
}

/// ICMP unreachable code for a failed host connect.
pub(crate) fn unreach_code(err: &io::Error) -> u8 {
    if err.raw_os_error() == Some(nix::libc::EHOSTUNREACH) {
        icmp::UNREACH_HOST
    } else {
        icmp::UNREACH_NET
    }
}

/// Tear down a connection and release everything it holds.
pub(crate) fn close(stack: &mut Stack, id: SocketId) {
    let Some(mut so) = stack.sockets.remove(id) else {
        return;
    };
    tracing::debug!(lport = so.lport, fport = so.fport, "tcp close");
    if let Some(tp) = so.tcb.take() {
        for seg in tp.reassembly {
            let _ = stack.pool.free(seg.data.id);
        }
    }
    if let Some(m) = so.saved.take() {
        let _ = stack.pool.free(m);
    }
    so.disconnected();
}

/// Abort a connection, resetting the guest if it ever saw our SYN.
pub(crate) fn drop_connection(stack: &mut Stack, id: SocketId) {
    let synced = stack
        .sockets
        .get_mut(id)
        .and_then(|so| so.tcb_mut())
        .map(|tp| {
            let synced = tp.state.have_received_syn();
            if synced {
                tp.state = TcpState::Closed;
            }
            synced
        })
        .unwrap_or(false);
    if synced {
        output(stack, id);
    }
    close(stack, id);
}

/// The host side is done sending: move toward sending our FIN.
pub(crate) fn sockclosed(stack: &mut Stack, id: SocketId) {
    let Some(tp) = stack.sockets.get_mut(id).and_then(|so| so.tcb_mut()) else {
        return;
    };
    match tp.state {
        TcpState::Closed | TcpState::Listen | TcpState::SynSent => {
            tp.state = TcpState::Closed;
            close(stack, id);
            return;
        }
        TcpState::SynReceived | TcpState::Established => tp.state = TcpState::FinWait1,
        TcpState::CloseWait => tp.state = TcpState::LastAck,
        _ => {}
    }
    output(stack, id);
}

/// Open a host listener whose connections are forwarded to
/// `laddr:lport` on the guest. The listener's bound port is reported back
/// through the socket's `fport`.
pub(crate) fn listen(
    stack: &mut Stack,
    port: u16,
    laddr: Ipv4Addr,
    lport: u16,
    accept_once: bool,
) -> Result<SocketId, StackError> {
    let listener = host::listen_tcp(port)?;
    let bound = listener.local_addr()?.port();
    let mut so = VirtualSocket::new_tcp(laddr, lport, stack.config.nat_visible_addr(), bound);
    so.host = HostSocket::Listener(listener);
    so.set_phase(Phase::Listening);
    so.set_accept_once(accept_once);
    so.tcb = Some(Box::new(Tcb::new()));
    let id = stack.sockets.insert(so)?;
    tracing::debug!(port = bound, %laddr, lport, accept_once, "tcp listen");
    Ok(id)
}

/// A host connection arrived on a listener: accept it and open the guest
/// side with our own SYN.
pub(crate) fn accept(stack: &mut Stack, listener: SocketId) {
    let Some(inso) = stack.sockets.get_mut(listener) else {
        return;
    };
    let accepted = match &inso.host {
        HostSocket::Listener(l) => l.accept(),
        _ => return,
    };
    let (stream, peer) = match accepted {
        Ok(pair) => pair,
        Err(e) if host::would_block(&e) => return,
        Err(e) => {
            tracing::debug!(error = %e, "tcp accept failed");
            return;
        }
    };
    if let Err(e) = stream.set_nonblocking(true) {
        tracing::debug!(error = %e, "tcp accept failed");
        return;
    }
    let _ = stream.set_nodelay(true);

    let (laddr, lport) = (inso.laddr, inso.lport);
    let id = if inso.state.accept_once {
        listener
    } else {
        let mut so = VirtualSocket::new_tcp(laddr, lport, Ipv4Addr::UNSPECIFIED, 0);
        so.tcb = Some(Box::new(Tcb::new()));
        match stack.sockets.insert(so) {
            Ok(id) => id,
            Err(e) => {
                tracing::debug!(error = %e, "dropping incoming connection");
                return;
            }
        }
    };

    let alias = stack.config.alias_addr;
    let mtu = stack.config.mtu;
    stack.tcp_iss = stack.tcp_iss.wrapping_add(TCP_ISSINCR / 2);
    let iss = stack.tcp_iss;
    let Some(so) = stack.sockets.get_mut(id) else {
        return;
    };
    let peer = host::v4(peer).unwrap_or(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0));
    so.faddr = if peer.ip().is_loopback() || peer.ip().is_unspecified() {
        alias
    } else {
        *peer.ip()
    };
    so.fport = peer.port();
    so.host = HostSocket::Stream(stream);
    so.set_phase(Phase::Connected);
    so.set_accept_once(false);
    let (tos, emu) = tos_for(so.lport, so.fport);
    so.tos = tos;
    set_mss(so, mtu, None);
    let Some(tp) = so.tcb.as_deref_mut() else {
        return;
    };
    tp.emu = emu;
    tp.state = TcpState::SynSent;
    tp.timers.arm(TimerKind::Keepalive, TCPTV_KEEP_INIT);
    tp.send_seq_init(iss);
    tracing::debug!(peer = %so.faddr, fport = so.fport, lport = so.lport, "tcp accepted");
    output(stack, id);
}

/// Delayed-ACK sweep.
pub(crate) fn fasttimo(stack: &mut Stack) {
    for id in stack.sockets.tcp_ids() {
        let due = stack
            .sockets
            .get_mut(id)
            .and_then(|so| so.tcb_mut())
            .is_some_and(|tp| {
                let due = tp.delayed_ack;
                if due {
                    tp.delayed_ack = false;
                    tp.ack_now = true;
                }
                due
            });
        if due {
            output(stack, id);
        }
    }
}

/// Whether any connection is holding back an ACK.
pub(crate) fn ack_pending(stack: &Stack) -> bool {
    stack.sockets.tcp_ids().into_iter().any(|id| {
        stack
            .sockets
            .get(id)
            .and_then(|so| so.tcb())
            .is_some_and(|tp| tp.delayed_ack)
    })
}

/// Slow sweep: run every connection's timers and age its counters.
pub(crate) fn slowtimo(stack: &mut Stack) {
    for id in stack.sockets.tcp_ids() {
        let fired = match stack.sockets.get_mut(id).and_then(|so| so.tcb_mut()) {
            Some(tp) => tp.timers.tick(),
            None => continue,
        };
        for kind in fired {
            if !stack.sockets.contains(id) {
                break;
            }
            timer_fired(stack, id, kind);
        }
        if let Some(tp) = stack.sockets.get_mut(id).and_then(|so| so.tcb_mut()) {
            tp.idle += 1;
            if tp.rtt.is_timing() {
                tp.rtt.rtt += 1;
            }
        }
    }
    stack.tcp_iss = stack.tcp_iss.wrapping_add(TCP_ISSINCR / 2);
}

fn timer_fired(stack: &mut Stack, id: SocketId, kind: TimerKind) {
    let Some(so) = stack.sockets.get_mut(id) else {
        return;
    };
    let ends = endpoints(so);
    let window = so.rcv_space().min(u16::MAX as usize) as u16;
    let Some(tp) = so.tcb.as_deref_mut() else {
        return;
    };
    tracing::trace!(?kind, state = ?tp.state, "tcp timer");
    match kind {
        TimerKind::TwoMsl => {
            if tp.state != TcpState::TimeWait && tp.idle <= TCP_MAXIDLE {
                tp.timers.arm(TimerKind::TwoMsl, TCPTV_KEEPINTVL);
            } else {
                close(stack, id);
            }
        }
        TimerKind::Retransmit => {
            let Some(next) = tp.backoff.escalate() else {
                tp.backoff = RetransmitState::Backoff {
                    shift: TCP_MAXRXTSHIFT,
                };
                tracing::debug!(lport = ends.dport, "tcp retransmit limit reached");
                drop_connection(stack, id);
                return;
            };
            tp.backoff = next;
            let rexmt = tp.rtt.rexmt_value() * next.multiplier();
            tp.rtt.rxtcur = range_set(rexmt, tp.rtt.rttmin, TCPTV_REXMTMAX);
            tp.timers.arm(TimerKind::Retransmit, tp.rtt.rxtcur);
            if next.shift() > TCP_MAXRXTSHIFT / 4 {
                tp.rtt.discard_srtt();
            }
            tp.snd_nxt = tp.snd_una;
            tp.rtt.rtt = 0;
            tp.enter_loss_recovery();
            tp.snd_cwnd = tp.maxseg as u32;
            tp.dupacks = 0;
            output(stack, id);
        }
        TimerKind::Persist => {
            tp.set_persist();
            tp.force = true;
            output(stack, id);
            if let Some(tp) = stack.sockets.get_mut(id).and_then(|so| so.tcb_mut()) {
                tp.force = false;
            }
        }
        TimerKind::Keepalive => {
            if !tp.state.have_established() {
                tracing::debug!(lport = ends.dport, "tcp connection timed out");
                drop_connection(stack, id);
                return;
            }
            if tp.state > TcpState::CloseWait {
                tp.timers.arm(TimerKind::Keepalive, TCPTV_KEEP_IDLE);
                return;
            }
            if tp.idle >= TCPTV_KEEP_IDLE + TCP_MAXIDLE {
                tracing::debug!(lport = ends.dport, "tcp keepalive timeout");
                drop_connection(stack, id);
                return;
            }
            let (ack, seq) = (tp.rcv_nxt, tp.snd_una.wrapping_sub(1));
            tp.timers.arm(TimerKind::Keepalive, TCPTV_KEEPINTVL);
            respond(stack, ends, ack, seq, ACK, window);
        }
    }
}

/// Enter TIME_WAIT: stop everything but the 2MSL timer.
pub(crate) fn enter_time_wait(tp: &mut Tcb) {
    tp.state = TcpState::TimeWait;
    tp.timers.cancel_all();
    tp.timers.arm(TimerKind::TwoMsl, 2 * TCPTV_MSL);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tos_table() {
        assert_eq!(tos_for(40000, 21), (IPTOS_LOWDELAY, Emulation::Ftp));
        assert_eq!(tos_for(21, 40000), (IPTOS_LOWDELAY, Emulation::Ftp));
        assert_eq!(tos_for(40000, 20), (IPTOS_THROUGHPUT, Emulation::None));
        assert_eq!(tos_for(20, 40000), (0, Emulation::None));
        assert_eq!(tos_for(1023, 514), (IPTOS_LOWDELAY, Emulation::Ksh));
        assert_eq!(tos_for(40000, 6668), (IPTOS_THROUGHPUT, Emulation::Irc));
        assert!(matches!(tos_for(1, 7070).1, Emulation::RealAudio(_)));
        assert_eq!(tos_for(1, 113).1, Emulation::Ident(Vec::new()));
        assert_eq!(tos_for(40000, 443), (0, Emulation::None));
    }

    #[test]
    fn test_set_mss_rounds_rings() {
        let mut so = VirtualSocket::new_tcp(Ipv4Addr::new(10, 0, 2, 15), 1, Ipv4Addr::LOCALHOST, 2);
        so.tcb = Some(Box::new(Tcb::new()));
        set_mss(&mut so, 1500, Some(1000));
        assert_eq!(so.tcb().unwrap().maxseg, 1000);
        assert_eq!(so.snd.capacity(), 9000);
        assert_eq!(so.rcv.capacity(), 9000);
    }

    #[test]
    fn test_time_wait_arms_only_2msl() {
        let mut tp = Tcb::new();
        tp.timers.arm(TimerKind::Retransmit, 5);
        tp.timers.arm(TimerKind::Keepalive, 5);
        enter_time_wait(&mut tp);
        assert_eq!(tp.state, TcpState::TimeWait);
        assert!(!tp.timers.is_armed(TimerKind::Retransmit));
        assert_eq!(tp.timers.remaining(TimerKind::TwoMsl), Some(2 * TCPTV_MSL));
    }
}
