//! UDP relay.
//!
//! Each guest endpoint gets a host datagram socket. Replies are sent back
//! to the guest as coming from the address the guest originally used, so
//! traffic to the DNS alias looks like it is answered by the alias.

use crate::host::{self, HostSocket};
use crate::ip::{self, IpOut};
use crate::socket::{Phase, SocketId, VirtualSocket};
use crate::wire::{IP_PROTO_UDP, Ipv4Header, UDP_HLEN, UdpHeader, build_udp, tcp_udp_checksum};
use crate::{Stack, StackError, dhcp, icmp, tftp};
use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::{Duration, Instant};
use usernet_mbuf::MbufId;

/// Idle lifetime of a UDP flow.
pub const EXPIRE: Duration = Duration::from_secs(240);
/// Idle lifetime of a DNS query flow.
pub const EXPIRE_DNS: Duration = Duration::from_secs(10);

const BOOTP_SERVER: u16 = 67;
const TFTP_PORT: u16 = 69;
const DNS_PORT: u16 = 53;
const MAX_DATAGRAM: usize = 65536;

/// Process a guest UDP datagram. `m` holds the whole datagram and is
/// consumed: either freed or kept as the flow's last datagram for ICMP
/// errors.
pub(crate) fn input(stack: &mut Stack, m: MbufId, ip: &Ipv4Header) {
    let data = stack.pool.data(m);
    let Some(udp) = data.get(ip.header_len..) else {
        let _ = stack.pool.free(m);
        return;
    };
    let Some(uh) = UdpHeader::parse(udp) else {
        let _ = stack.pool.free(m);
        return;
    };
    if uh.len < UDP_HLEN || uh.len > udp.len() {
        tracing::trace!(src = %ip.src, "bad udp length");
        let _ = stack.pool.free(m);
        return;
    }
    let udp = &udp[..uh.len];
    if uh.checksum != 0 && tcp_udp_checksum(ip.src, ip.dst, IP_PROTO_UDP, udp) != 0 {
        tracing::trace!(src = %ip.src, "bad udp checksum");
        let _ = stack.pool.free(m);
        return;
    }
    let payload = udp[UDP_HLEN..].to_vec();

    if uh.dst_port == BOOTP_SERVER {
        let _ = stack.pool.free(m);
        dhcp::input(stack, &payload);
        return;
    }
    if ip.dst == stack.config.alias_addr && uh.dst_port == TFTP_PORT {
        let _ = stack.pool.free(m);
        tftp::input(stack, SocketAddrV4::new(ip.src, uh.src_port), &payload);
        return;
    }

    let id = match stack.sockets.find_udp(ip.src, uh.src_port) {
        Some(id) => id,
        None => match attach(stack, ip.src, uh.src_port) {
            Ok(id) => id,
            Err(e) => {
                tracing::debug!(error = %e, "cannot open udp flow");
                let _ = stack.pool.free(m);
                return;
            }
        },
    };

    let target = SocketAddrV4::new(stack.config.host_target(ip.dst), uh.dst_port);
    let now = stack.now;
    let Some(so) = stack.sockets.get_mut(id) else {
        let _ = stack.pool.free(m);
        return;
    };
    so.faddr = ip.dst;
    so.fport = uh.dst_port;
    so.tos = ip.tos;
    let sent = match so.host.datagram() {
        Some(socket) => socket.send_to(&payload, target).map(|_| ()),
        None => Ok(()),
    };
    if let Err(e) = sent {
        tracing::debug!(error = %e, %target, "udp send failed");
        let orig = stack.pool.data(m).to_vec();
        let _ = stack.pool.free(m);
        icmp::error(stack, &orig, icmp::UNREACH, icmp::UNREACH_NET);
        return;
    }
    if so.expire.is_some() {
        let ttl = if uh.dst_port == DNS_PORT {
            EXPIRE_DNS
        } else {
            EXPIRE
        };
        so.expire = Some(now + ttl);
    }
    if let Some(old) = so.saved.replace(m) {
        let _ = stack.pool.free(old);
    }
    tracing::trace!(lport = uh.src_port, %target, len = payload.len(), "udp relayed");
}

/// Open a host socket for a new guest endpoint.
fn attach(stack: &mut Stack, laddr: Ipv4Addr, lport: u16) -> Result<SocketId, StackError> {
    let socket = host::bind_udp(0)?;
    let mut so = VirtualSocket::new_udp(laddr, lport, Ipv4Addr::UNSPECIFIED, 0);
    so.host = HostSocket::Datagram(socket);
    so.set_phase(Phase::Connected);
    so.expire = Some(stack.now + EXPIRE);
    let id = stack.sockets.insert(so)?;
    tracing::debug!(%laddr, lport, "udp flow opened");
    Ok(id)
}

/// Forget a UDP flow and release its host socket.
pub(crate) fn detach(stack: &mut Stack, id: SocketId) {
    let Some(mut so) = stack.sockets.remove(id) else {
        return;
    };
    tracing::debug!(laddr = %so.laddr, lport = so.lport, "udp flow closed");
    if let Some(m) = so.saved.take() {
        let _ = stack.pool.free(m);
    }
    so.disconnected();
}

/// Host datagram arrived (or the socket reported an error) for `id`.
pub(crate) fn readable(stack: &mut Stack, id: SocketId) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    let Some(so) = stack.sockets.get(id) else {
        return;
    };
    let Some(socket) = so.host.datagram() else {
        return;
    };
    let received = socket.recv_from(&mut buf);
    if so.icmp_relay {
        if !matches!(&received, Err(e) if host::would_block(e)) {
            icmp::relay_done(stack, id, received.map(|_| ()));
        }
        return;
    }

    let (len, from) = match received {
        Ok((len, from)) => (len, from),
        Err(e) if host::would_block(&e) => return,
        Err(e) => {
            tracing::debug!(error = %e, lport = so.lport, "udp receive failed");
            let saved = so.saved;
            if let Some(m) = saved {
                let orig = stack.pool.data(m).to_vec();
                icmp::error(stack, &orig, icmp::UNREACH, icmp::unreach_code(&e));
            }
            return;
        }
    };
    let Some(from) = host::v4(from) else {
        return;
    };

    let (laddr, lport, faddr, tos) = (so.laddr, so.lport, so.faddr, so.tos);
    let config = &stack.config;
    let src = if !faddr.is_unspecified() && *from.ip() == config.host_target(faddr) {
        faddr
    } else if from.ip().is_loopback() {
        config.alias_addr
    } else {
        *from.ip()
    };
    let now = stack.now;
    if let Some(so) = stack.sockets.get_mut(id)
        && so.expire.is_some()
    {
        let ttl = if from.port() == DNS_PORT {
            EXPIRE_DNS
        } else {
            EXPIRE
        };
        so.expire = Some(now + ttl);
    }
    output(stack, (src, from.port()), (laddr, lport), tos, &buf[..len]);
}

/// Send a datagram to the guest.
pub(crate) fn output(
    stack: &mut Stack,
    from: (Ipv4Addr, u16),
    to: (Ipv4Addr, u16),
    tos: u8,
    payload: &[u8],
) {
    let datagram = build_udp(from.0, from.1, to.0, to.1, payload);
    match stack.pool.allocate_from(&datagram) {
        Ok(m) => ip::output(
            stack,
            m,
            IpOut {
                src: from.0,
                dst: to.0,
                proto: IP_PROTO_UDP,
                tos,
            },
        ),
        Err(e) => tracing::debug!(error = %e, "dropping udp datagram"),
    }
}

/// Bind host port `port` and forward what arrives on it to `laddr:lport`
/// on the guest. Accept-once listeners expire like ordinary flows; the
/// others live until the stack goes away.
pub(crate) fn listen(
    stack: &mut Stack,
    port: u16,
    laddr: Ipv4Addr,
    lport: u16,
    accept_once: bool,
) -> Result<SocketId, StackError> {
    let socket = host::bind_udp(port)?;
    let bound = socket.local_addr()?.port();
    let mut so = VirtualSocket::new_udp(laddr, lport, stack.config.nat_visible_addr(), bound);
    so.host = HostSocket::Datagram(socket);
    so.set_phase(Phase::Connected);
    so.set_accept_once(accept_once);
    so.expire = accept_once.then(|| stack.now + EXPIRE);
    let id = stack.sockets.insert(so)?;
    tracing::debug!(port = bound, %laddr, lport, accept_once, "udp listen");
    Ok(id)
}

/// Close flows whose idle deadline has passed.
pub(crate) fn expire(stack: &mut Stack, now: Instant) {
    for id in stack.sockets.udp_ids() {
        let due = stack
            .sockets
            .get(id)
            .and_then(|so| so.expire)
            .is_some_and(|deadline| deadline <= now);
        if due {
            detach(stack, id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::NetConfig;
    use crate::stack::tests::{CapturedFrames, guest_datagram};

    fn guest_udp(stack: &Stack, sport: u16, dst: Ipv4Addr, dport: u16, payload: &[u8]) -> Vec<u8> {
        let udp = build_udp(stack.config.guest_addr, sport, dst, dport, payload);
        guest_datagram(IP_PROTO_UDP, dst, &udp)
    }

    #[test]
    fn test_flow_created_and_expires() {
        let (mut stack, _frames) = CapturedFrames::stack(NetConfig::default());
        let server = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let port = server.local_addr().unwrap().port();
        let alias = stack.config.alias_addr;
        let dgram = guest_udp(&stack, 5000, alias, port, b"hello");
        stack.deliver_ip(&dgram);

        let mut buf = [0u8; 16];
        let (n, _) = server.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"hello");
        assert_eq!(stack.sockets.udp_count(), 1);

        let later = stack.now + EXPIRE + Duration::from_secs(1);
        expire(&mut stack, later);
        assert_eq!(stack.sockets.udp_count(), 0);
        assert_eq!(stack.pool.live(), 0);
    }

    #[test]
    fn test_dns_flow_expires_sooner() {
        let (mut stack, _frames) = CapturedFrames::stack(NetConfig {
            dns_server: Some(Ipv4Addr::LOCALHOST),
            ..Default::default()
        });
        let dns = stack.config.dns_alias;
        let dgram = guest_udp(&stack, 5001, dns, DNS_PORT, b"query");
        stack.deliver_ip(&dgram);
        assert_eq!(stack.sockets.udp_count(), 1);
        let later = stack.now + EXPIRE_DNS + Duration::from_secs(1);
        expire(&mut stack, later);
        assert_eq!(stack.sockets.udp_count(), 0);
    }

    #[test]
    fn test_bad_checksum_dropped() {
        let (mut stack, _frames) = CapturedFrames::stack(NetConfig::default());
        let alias = stack.config.alias_addr;
        let mut udp = build_udp(stack.config.guest_addr, 5002, alias, 9, b"x");
        udp[6] ^= 0x55;
        let dgram = guest_datagram(IP_PROTO_UDP, alias, &udp);
        stack.deliver_ip(&dgram);
        assert_eq!(stack.sockets.udp_count(), 0);
        assert_eq!(stack.pool.live(), 0);
    }

    #[test]
    fn test_listen_never_expires_unless_accept_once() {
        let (mut stack, _frames) = CapturedFrames::stack(NetConfig::default());
        let guest = stack.config.guest_addr;
        let fixed = listen(&mut stack, 0, guest, 53, false).unwrap();
        let once = listen(&mut stack, 0, guest, 7000, true).unwrap();
        let later = stack.now + EXPIRE + Duration::from_secs(1);
        expire(&mut stack, later);
        assert!(stack.sockets.contains(fixed));
        assert!(!stack.sockets.contains(once));
    }
}
