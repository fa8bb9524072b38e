//! ICMP: echo handling and error generation.

use crate::Stack;
use crate::host::{self, HostSocket};
use crate::ip::{self, IpOut};
use crate::socket::{Phase, SocketId, VirtualSocket};
use crate::udp;
use crate::wire::{IP_HLEN, IP_PROTO_ICMP, Ipv4Header, checksum};
use std::io;
use std::net::SocketAddrV4;
use usernet_mbuf::MbufId;

pub const ECHOREPLY: u8 = 0;
pub const UNREACH: u8 = 3;
pub const SOURCEQUENCH: u8 = 4;
pub const REDIRECT: u8 = 5;
pub const ECHO: u8 = 8;
pub const TIMXCEED: u8 = 11;
pub const PARAMPROB: u8 = 12;

pub const UNREACH_NET: u8 = 0;
pub const UNREACH_HOST: u8 = 1;
pub const UNREACH_PORT: u8 = 3;

pub const ICMP_MINLEN: usize = 8;
/// Most of an offending datagram quoted in an error.
pub const MAXDATALEN: usize = 548;

/// Port echo requests to outside hosts are relayed to.
const ECHO_PORT: u16 = 7;

fn is_error(kind: u8) -> bool {
    matches!(kind, UNREACH | SOURCEQUENCH | REDIRECT | TIMXCEED | PARAMPROB)
}

/// Process a guest ICMP message. `m` holds the whole datagram and is
/// consumed.
pub(crate) fn input(stack: &mut Stack, m: MbufId, ip: &Ipv4Header) {
    let data = stack.pool.data(m);
    let Some(msg) = data.get(ip.header_len..) else {
        let _ = stack.pool.free(m);
        return;
    };
    if msg.len() < ICMP_MINLEN || checksum(msg) != 0 {
        tracing::trace!(src = %ip.src, "bad icmp message");
        let _ = stack.pool.free(m);
        return;
    }
    let kind = msg[0];
    if kind != ECHO {
        tracing::trace!(kind, "ignoring icmp message");
        let _ = stack.pool.free(m);
        return;
    }

    if stack.config.is_alias(ip.dst) {
        reflect(stack, m);
        return;
    }
    let payload = msg[ICMP_MINLEN..].to_vec();
    if let Err(e) = relay_echo(stack, m, ip, &payload) {
        tracing::debug!(error = %e, dst = %ip.dst, "icmp echo relay failed");
        let orig = stack.pool.data(m).to_vec();
        error(stack, &orig, UNREACH, unreach_code(&e));
        let _ = stack.pool.free(m);
    }
}

/// Turn the echo request in `m` around into a reply and send it. Consumes
/// `m`.
fn reflect(stack: &mut Stack, m: MbufId) {
    let data = stack.pool.data(m);
    let Some(ip) = Ipv4Header::parse(data) else {
        let _ = stack.pool.free(m);
        return;
    };
    let msg = data.get(ip.header_len..).map(<[u8]>::to_vec);
    let _ = stack.pool.free(m);
    let Some(mut msg) = msg.filter(|msg| msg.len() >= ICMP_MINLEN) else {
        return;
    };
    msg[0] = ECHOREPLY;
    msg[2..4].copy_from_slice(&[0, 0]);
    let sum = checksum(&msg);
    msg[2..4].copy_from_slice(&sum.to_be_bytes());
    send(
        stack,
        &msg,
        IpOut {
            src: ip.dst,
            dst: ip.src,
            proto: IP_PROTO_ICMP,
            tos: ip.tos,
        },
    );
}

/// Probe an outside host with a UDP datagram to its echo port. The first
/// answer, or error, settles the guest's request.
fn relay_echo(stack: &mut Stack, m: MbufId, ip: &Ipv4Header, payload: &[u8]) -> io::Result<()> {
    let target = SocketAddrV4::new(stack.config.host_target(ip.dst), ECHO_PORT);
    let socket = host::bind_udp(0)?;
    socket.send_to(payload, target)?;
    let mut so = VirtualSocket::new_udp(ip.src, 0, ip.dst, ECHO_PORT);
    so.host = HostSocket::Datagram(socket);
    so.set_phase(Phase::Connected);
    so.icmp_relay = true;
    so.saved = Some(m);
    so.expire = Some(stack.now + udp::EXPIRE);
    stack.sockets.insert(so).map_err(io::Error::other)?;
    tracing::trace!(%target, "icmp echo relayed");
    Ok(())
}

/// The relay probe for `id` was answered (or failed): reply to the guest
/// and drop the probe.
pub(crate) fn relay_done(stack: &mut Stack, id: SocketId, result: io::Result<()>) {
    let Some(mut so) = stack.sockets.remove(id) else {
        return;
    };
    let Some(m) = so.saved.take() else {
        return;
    };
    so.disconnected();
    match result {
        Ok(()) => reflect(stack, m),
        Err(e) => {
            tracing::debug!(error = %e, "icmp echo relay failed");
            let orig = stack.pool.data(m).to_vec();
            error(stack, &orig, UNREACH, unreach_code(&e));
            let _ = stack.pool.free(m);
        }
    }
}

/// Unreachable code matching a host socket error.
pub(crate) fn unreach_code(err: &io::Error) -> u8 {
    match err.raw_os_error() {
        Some(nix::libc::EHOSTUNREACH) => UNREACH_HOST,
        Some(nix::libc::ENETUNREACH) => UNREACH_NET,
        _ => UNREACH_PORT,
    }
}

/// Report a problem with the guest datagram `orig` back to its sender.
/// Nothing is sent for trailing fragments, for ICMP errors, or when the
/// sender or destination is unspecified or broadcast.
pub(crate) fn error(stack: &mut Stack, orig: &[u8], kind: u8, code: u8) {
    let Some(ip) = Ipv4Header::parse(orig) else {
        return;
    };
    if ip.header_len < IP_HLEN || orig.len() < ip.header_len || ip.frag_offset() != 0 {
        return;
    }
    let broadcast = stack.config.broadcast_addr();
    if ip.src.is_unspecified()
        || ip.src.is_broadcast()
        || ip.dst.is_broadcast()
        || ip.dst.is_multicast()
        || ip.dst == broadcast
    {
        return;
    }
    if ip.proto == IP_PROTO_ICMP && orig.get(ip.header_len).is_some_and(|&t| is_error(t)) {
        return;
    }

    let quoted = orig.len().min(ip.total_len).min(MAXDATALEN);
    let mut msg = Vec::with_capacity(ICMP_MINLEN + quoted);
    msg.extend_from_slice(&[kind, code, 0, 0, 0, 0, 0, 0]);
    msg.extend_from_slice(&orig[..quoted]);
    let sum = checksum(&msg);
    msg[2..4].copy_from_slice(&sum.to_be_bytes());
    tracing::debug!(kind, code, dst = %ip.src, "sending icmp error");
    let src = stack.config.alias_addr;
    send(
        stack,
        &msg,
        IpOut {
            src,
            dst: ip.src,
            proto: IP_PROTO_ICMP,
            tos: (ip.tos & 0x1e) | 0xc0,
        },
    );
}

fn send(stack: &mut Stack, msg: &[u8], out: IpOut) {
    match stack.pool.allocate_from(msg) {
        Ok(m) => ip::output(stack, m, out),
        Err(e) => tracing::debug!(error = %e, "dropping icmp message"),
    }
}
