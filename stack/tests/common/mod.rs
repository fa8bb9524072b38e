#![allow(dead_code)]

use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use usernet_stack::wire::{
    ETH_HLEN, ETHERTYPE_IPV4, IP_HLEN, IP_PROTO_TCP, IP_PROTO_UDP, Ipv4Header, TcpHeader,
    UdpHeader, build_eth_header, build_udp, mss_option, tcp_udp_checksum,
};
use usernet_stack::{NetConfig, Stack};

pub const GUEST_MAC: [u8; 6] = [0x52, 0x54, 0x00, 0x12, 0x34, 0x56];

/// A stack plus every frame it has handed to the guest.
pub struct Harness {
    pub stack: Stack,
    frames: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl Harness {
    pub fn new(config: NetConfig) -> Self {
        let frames = Arc::new(Mutex::new(Vec::new()));
        let sink = frames.clone();
        let stack = Stack::new(config, move |f: &[u8]| {
            sink.lock().unwrap().push(f.to_vec());
        })
        .unwrap();
        Self { stack, frames }
    }

    pub fn guest(&self) -> Ipv4Addr {
        self.stack.config().guest_addr
    }

    pub fn alias(&self) -> Ipv4Addr {
        self.stack.config().alias_addr
    }

    pub fn take(&self) -> Vec<Vec<u8>> {
        std::mem::take(&mut *self.frames.lock().unwrap())
    }

    /// Send a bare IP datagram inside an Ethernet frame.
    pub fn send_ip(&mut self, packet: &[u8]) {
        let mut frame = build_eth_header(&usernet_stack::arp::GATEWAY_MAC, &GUEST_MAC, ETHERTYPE_IPV4)
            .to_vec();
        frame.extend_from_slice(packet);
        self.stack.deliver_frame(&frame);
    }

    /// Poll until `done` accepts a frame, returning it.
    pub fn wait_for<F>(&mut self, mut done: F) -> Vec<u8>
    where
        F: FnMut(&[u8]) -> bool,
    {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            for frame in self.take() {
                if done(&frame) {
                    return frame;
                }
            }
            assert!(Instant::now() < deadline, "timed out waiting for a frame");
            self.stack.poll(Duration::from_millis(10)).unwrap();
        }
    }

    /// Poll until `cond` holds on the stack.
    pub fn wait_until<F>(&mut self, mut cond: F)
    where
        F: FnMut(&Stack) -> bool,
    {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond(&self.stack) {
            assert!(Instant::now() < deadline, "timed out waiting for the stack");
            self.stack.poll(Duration::from_millis(10)).unwrap();
        }
    }
}

pub fn ip_datagram(src: Ipv4Addr, dst: Ipv4Addr, proto: u8, id: u16, frag: u16, payload: &[u8]) -> Vec<u8> {
    let header = Ipv4Header {
        header_len: IP_HLEN,
        tos: 0,
        total_len: IP_HLEN + payload.len(),
        id,
        frag,
        ttl: 64,
        proto,
        src,
        dst,
    };
    let mut out = vec![0u8; IP_HLEN];
    header.emit(&mut out);
    out.extend_from_slice(payload);
    out
}

pub fn udp_datagram(src: (Ipv4Addr, u16), dst: (Ipv4Addr, u16), payload: &[u8]) -> Vec<u8> {
    let udp = build_udp(src.0, src.1, dst.0, dst.1, payload);
    ip_datagram(src.0, dst.0, IP_PROTO_UDP, 7, 0, &udp)
}

/// A TCP segment, with an MSS option on SYNs.
pub fn tcp_segment(
    src: (Ipv4Addr, u16),
    dst: (Ipv4Addr, u16),
    seq: u32,
    ack: u32,
    flags: u8,
    payload: &[u8],
) -> Vec<u8> {
    let options: Vec<u8> = if flags & usernet_stack::wire::tcp_flags::SYN != 0 {
        mss_option(1460).to_vec()
    } else {
        Vec::new()
    };
    let header = TcpHeader {
        src_port: src.1,
        dst_port: dst.1,
        seq,
        ack,
        data_offset: 20 + options.len(),
        flags,
        window: 65535,
    };
    let mut tcp = vec![0u8; 20 + options.len()];
    header.emit(&mut tcp, &options);
    tcp.extend_from_slice(payload);
    let sum = tcp_udp_checksum(src.0, dst.0, IP_PROTO_TCP, &tcp);
    tcp[16..18].copy_from_slice(&sum.to_be_bytes());
    ip_datagram(src.0, dst.0, IP_PROTO_TCP, 1, 0, &tcp)
}

/// The IP header of a frame sent to the guest.
pub fn ip_of(frame: &[u8]) -> Option<Ipv4Header> {
    Ipv4Header::parse(frame.get(ETH_HLEN..)?)
}

/// A TCP segment sent to the guest: header and payload.
pub fn tcp_of(frame: &[u8]) -> Option<(Ipv4Header, TcpHeader, Vec<u8>)> {
    let ip = ip_of(frame)?;
    if ip.proto != IP_PROTO_TCP {
        return None;
    }
    let packet = &frame[ETH_HLEN..ETH_HLEN + ip.total_len];
    let segment = &packet[ip.header_len..];
    let tcp = TcpHeader::parse(segment)?;
    Some((ip, tcp, segment[tcp.data_offset..].to_vec()))
}

/// A UDP datagram sent to the guest: header and payload.
pub fn udp_of(frame: &[u8]) -> Option<(Ipv4Header, UdpHeader, Vec<u8>)> {
    let ip = ip_of(frame)?;
    if ip.proto != IP_PROTO_UDP {
        return None;
    }
    let packet = &frame[ETH_HLEN..ETH_HLEN + ip.total_len];
    let datagram = &packet[ip.header_len..];
    let udp = UdpHeader::parse(datagram)?;
    Some((ip, udp, datagram[8..udp.len].to_vec()))
}
