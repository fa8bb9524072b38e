//! IPv4 input validation, dispatch and output with fragmentation.

use crate::Stack;
use crate::wire::{
    IP_DEFAULT_TTL, IP_HLEN, IP_MF, IP_PROTO_ICMP, IP_PROTO_TCP, IP_PROTO_UDP, Ipv4Header,
    checksum,
};
use crate::{icmp, tcp, udp};
use std::net::Ipv4Addr;
use usernet_mbuf::MbufId;

/// What [`output`] needs to put an IP header in front of a segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct IpOut {
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    pub proto: u8,
    pub tos: u8,
}

/// Validate a guest datagram and hand it up. `m` starts at the IP header
/// and is consumed.
pub(crate) fn input(stack: &mut Stack, m: MbufId) {
    let Some(ip) = validate(stack.pool.data(m)) else {
        tracing::trace!("dropping malformed ip datagram");
        let _ = stack.pool.free(m);
        return;
    };
    // Link-layer padding.
    if let Some(mbuf) = stack.pool.get_mut(m) {
        mbuf.truncate(ip.total_len);
    }

    if ip.ttl == 0 {
        let orig = stack.pool.data(m).to_vec();
        let _ = stack.pool.free(m);
        icmp::error(stack, &orig, icmp::TIMXCEED, 0);
        return;
    }

    let (m, ip) = if ip.is_fragment() {
        let Some(whole) = stack.ipq.insert(&mut stack.pool, m, &ip) else {
            return;
        };
        match Ipv4Header::parse(stack.pool.data(whole)) {
            Some(ip) => (whole, ip),
            None => {
                let _ = stack.pool.free(whole);
                return;
            }
        }
    } else {
        (m, ip)
    };

    match ip.proto {
        IP_PROTO_TCP => tcp::input(stack, m, &ip),
        IP_PROTO_UDP => udp::input(stack, m, &ip),
        IP_PROTO_ICMP => icmp::input(stack, m, &ip),
        proto => {
            tracing::trace!(proto, "unsupported ip protocol");
            let _ = stack.pool.free(m);
        }
    }
}

fn validate(data: &[u8]) -> Option<Ipv4Header> {
    if Ipv4Header::version(data) != 4 {
        return None;
    }
    let ip = Ipv4Header::parse(data)?;
    if ip.header_len < IP_HLEN || ip.header_len > data.len() {
        return None;
    }
    if checksum(&data[..ip.header_len]) != 0 {
        return None;
    }
    if ip.total_len < ip.header_len || ip.total_len > data.len() {
        return None;
    }
    Some(ip)
}

/// Prepend an IP header to the segment in `m` and queue it for the guest,
/// fragmenting to the MTU. Consumes `m`.
pub(crate) fn output(stack: &mut Stack, m: MbufId, out: IpOut) {
    let id = stack.ip_id;
    stack.ip_id = stack.ip_id.wrapping_add(1);
    let mtu = stack.config.mtu;
    let len = stack.pool.data(m).len();

    let mut header = Ipv4Header {
        header_len: IP_HLEN,
        tos: out.tos,
        total_len: IP_HLEN + len,
        id,
        frag: 0,
        ttl: IP_DEFAULT_TTL,
        proto: out.proto,
        src: out.src,
        dst: out.dst,
    };

    if IP_HLEN + len <= mtu {
        let Some(mbuf) = stack.pool.get_mut(m) else {
            return;
        };
        header.emit(mbuf.prepend(IP_HLEN));
        stack.outbound.push_back(m);
        return;
    }

    let payload = stack.pool.data(m).to_vec();
    let _ = stack.pool.free(m);
    let chunk = (mtu - IP_HLEN) & !7;
    let mut offset = 0;
    while offset < payload.len() {
        let end = (offset + chunk).min(payload.len());
        header.total_len = IP_HLEN + end - offset;
        header.frag = (offset / 8) as u16 | if end < payload.len() { IP_MF } else { 0 };
        let frag = match stack.pool.allocate() {
            Ok(frag) => frag,
            Err(e) => {
                tracing::debug!(error = %e, id, "dropping fragmented datagram");
                return;
            }
        };
        if let Some(mbuf) = stack.pool.get_mut(frag) {
            mbuf.append(&[0u8; IP_HLEN]);
            header.emit(mbuf.data_mut());
            mbuf.append(&payload[offset..end]);
        }
        stack.outbound.push_back(frag);
        offset = end;
    }
    tracing::trace!(id, len, "datagram fragmented");
}
