mod common;

use common::{Harness, udp_datagram, udp_of};
use usernet_stack::NetConfig;

const CLIENT_PORT: u16 = 2000;

fn rrq(name: &str) -> Vec<u8> {
    let mut p = vec![0, 1];
    p.extend_from_slice(name.as_bytes());
    p.push(0);
    p.extend_from_slice(b"octet\0");
    p
}

fn ack(block: u16) -> Vec<u8> {
    let mut p = vec![0, 4];
    p.extend_from_slice(&block.to_be_bytes());
    p
}

fn harness(root: &std::path::Path) -> Harness {
    Harness::new(NetConfig {
        tftp_root: root.to_path_buf(),
        ..NetConfig::default()
    })
}

/// Send `packet` to the TFTP port and return the answer payload.
fn exchange(h: &mut Harness, packet: &[u8]) -> Vec<u8> {
    let server = (h.alias(), 69);
    h.send_ip(&udp_datagram((h.guest(), CLIENT_PORT), server, packet));
    let out = h.take();
    assert_eq!(out.len(), 1);
    let (ip, udp, payload) = udp_of(&out[0]).unwrap();
    assert_eq!(ip.src, h.alias());
    assert_eq!(udp.src_port, 69);
    assert_eq!(udp.dst_port, CLIENT_PORT);
    payload
}

#[test]
fn test_file_served_in_blocks() {
    let dir = tempfile::tempdir().unwrap();
    let contents: Vec<u8> = (0..700u32).map(|i| (i % 256) as u8).collect();
    std::fs::write(dir.path().join("boot.bin"), &contents).unwrap();
    let mut h = harness(dir.path());

    let first = exchange(&mut h, &rrq("boot.bin"));
    assert_eq!(&first[0..4], &[0, 3, 0, 1]);
    assert_eq!(&first[4..], &contents[..512]);
    assert_eq!(h.stack.tftp_sessions(), 1);

    let second = exchange(&mut h, &ack(1));
    assert_eq!(&second[0..4], &[0, 3, 0, 2]);
    assert_eq!(&second[4..], &contents[512..]);

    // Acknowledging the short block ends the transfer.
    let server = (h.alias(), 69);
    h.send_ip(&udp_datagram((h.guest(), CLIENT_PORT), server, &ack(2)));
    assert_eq!(h.stack.tftp_sessions(), 0);
    // Served locally: no NAT flow was opened.
    assert_eq!(h.stack.udp_sockets(), 0);
}

#[test]
fn test_escape_from_root_refused() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("root");
    std::fs::create_dir(&root).unwrap();
    std::fs::write(dir.path().join("secret"), b"nope").unwrap();
    let mut h = harness(&root);

    let reply = exchange(&mut h, &rrq("../secret"));
    assert_eq!(&reply[0..4], &[0, 5, 0, 2]);
    assert_eq!(h.stack.tftp_sessions(), 0);
}

#[test]
fn test_missing_file_and_write_request() {
    let dir = tempfile::tempdir().unwrap();
    let mut h = harness(dir.path());

    let reply = exchange(&mut h, &rrq("absent"));
    assert_eq!(&reply[0..4], &[0, 5, 0, 1]);

    let mut wrq = rrq("upload");
    wrq[1] = 2;
    let reply = exchange(&mut h, &wrq);
    assert_eq!(&reply[0..4], &[0, 5, 0, 4]);
    assert_eq!(h.stack.tftp_sessions(), 0);
}
