mod common;

use common::{Harness, ip_datagram, udp_datagram, udp_of};
use std::net::{Ipv4Addr, UdpSocket};
use std::thread;
use std::time::Duration;
use usernet_stack::NetConfig;
use usernet_stack::wire::{IP_PROTO_ICMP, checksum};

fn udp_echo_server(replies: usize) -> (u16, thread::JoinHandle<()>) {
    let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
    socket.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    let port = socket.local_addr().unwrap().port();
    let handle = thread::spawn(move || {
        let mut buf = [0u8; 2048];
        for _ in 0..replies {
            let (n, peer) = socket.recv_from(&mut buf).unwrap();
            socket.send_to(&buf[..n], peer).unwrap();
        }
    });
    (port, handle)
}

#[test]
fn test_reply_source_rewritten_to_alias() {
    let (port, server) = udp_echo_server(1);
    let mut h = Harness::new(NetConfig::default());
    let guest = (h.guest(), 5000);
    h.send_ip(&udp_datagram(guest, (h.alias(), port), b"ping"));
    assert_eq!(h.stack.udp_sockets(), 1);

    let frame = h.wait_for(|f| udp_of(f).is_some_and(|(_, u, _)| u.dst_port == 5000));
    let (ip, udp, payload) = udp_of(&frame).unwrap();
    assert_eq!(ip.src, Ipv4Addr::new(10, 0, 2, 2));
    assert_eq!(ip.dst, h.guest());
    assert_eq!(udp.src_port, port);
    assert_eq!(payload, b"ping");
    server.join().unwrap();
}

#[test]
fn test_flow_reused_per_guest_port() {
    let (port, server) = udp_echo_server(2);
    let mut h = Harness::new(NetConfig::default());
    let guest = (h.guest(), 5001);
    h.send_ip(&udp_datagram(guest, (h.alias(), port), b"one"));
    h.send_ip(&udp_datagram(guest, (h.alias(), port), b"two"));
    assert_eq!(h.stack.udp_sockets(), 1);
    h.send_ip(&udp_datagram((h.guest(), 5002), (h.alias(), port), b"three"));
    assert_eq!(h.stack.udp_sockets(), 2);
    h.wait_for(|f| udp_of(f).is_some_and(|(_, _, p)| p == b"two"));
    server.join().unwrap();
}

#[test]
fn test_socket_table_limit() {
    let config = NetConfig {
        max_sockets: 2,
        ..NetConfig::default()
    };
    let mut h = Harness::new(config);
    let dst = (h.alias(), 9);
    for port in 6000..6004 {
        h.send_ip(&udp_datagram((h.guest(), port), dst, b"x"));
    }
    assert_eq!(h.stack.udp_sockets(), 2);
    // Nothing leaks for the refused flows.
    assert!(h.stack.live_buffers() <= 2);
}

#[test]
fn test_bad_checksum_dropped() {
    let mut h = Harness::new(NetConfig::default());
    let mut packet = udp_datagram((h.guest(), 5003), (h.alias(), 9), b"payload");
    let last = packet.len() - 1;
    packet[last] ^= 0xff;
    h.send_ip(&packet);
    assert_eq!(h.stack.udp_sockets(), 0);
    assert_eq!(h.stack.live_buffers(), 0);
}

#[test]
fn test_dhcp_discover_answered() {
    let mut h = Harness::new(NetConfig::default());
    let mut request = vec![0u8; 240];
    request[0] = 1;
    request[4..8].copy_from_slice(&[1, 2, 3, 4]);
    request[236..240].copy_from_slice(&[99, 130, 83, 99]);
    request.extend_from_slice(&[53, 1, 1, 255]);
    h.send_ip(&udp_datagram((Ipv4Addr::UNSPECIFIED, 68), (Ipv4Addr::BROADCAST, 67), &request));
    let out = h.take();
    let (ip, udp, reply) = out.iter().find_map(|f| udp_of(f)).unwrap();
    assert_eq!(ip.dst, Ipv4Addr::BROADCAST);
    assert_eq!(udp.src_port, 67);
    assert_eq!(udp.dst_port, 68);
    assert_eq!(&reply[16..20], &[10, 0, 2, 15]);
    assert_eq!(h.stack.udp_sockets(), 0);
}

#[test]
fn test_fragmented_echo_reassembled() {
    let mut h = Harness::new(NetConfig::default());
    let mut icmp = vec![8u8, 0, 0, 0, 0x12, 0x34, 0, 1];
    icmp.extend((0..1000u32).map(|i| i as u8));
    let sum = checksum(&icmp);
    icmp[2..4].copy_from_slice(&sum.to_be_bytes());

    let (guest, alias) = (h.guest(), h.alias());
    let pieces = [(0usize, 400usize), (400, 400), (800, icmp.len() - 800)];
    // Delivered back to front.
    for &(offset, len) in pieces.iter().rev() {
        let more = if offset + len < icmp.len() { 0x2000 } else { 0 };
        let frag = more | (offset / 8) as u16;
        let packet = ip_datagram(guest, alias, IP_PROTO_ICMP, 99, frag, &icmp[offset..offset + len]);
        h.stack.deliver_ip(&packet);
    }
    assert_eq!(h.stack.reassembly_queues(), 0);

    let out = h.take();
    assert_eq!(out.len(), 1);
    let ip = common::ip_of(&out[0]).unwrap();
    assert_eq!(ip.proto, IP_PROTO_ICMP);
    assert_eq!(ip.src, alias);
    assert_eq!(ip.total_len, 20 + icmp.len());
    let reply = &out[0][14 + 20..14 + ip.total_len];
    assert_eq!(reply[0], 0);
    assert_eq!(&reply[8..], &icmp[8..]);
    assert_eq!(h.stack.live_buffers(), 0);
}
