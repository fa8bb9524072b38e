//! ARP responder for the stack's own addresses.

use crate::wire::{ETHERTYPE_ARP, build_eth_header};
use std::net::Ipv4Addr;

/// MAC the gateway and DNS aliases answer with.
pub const GATEWAY_MAC: [u8; 6] = [0x52, 0x55, 0x0a, 0x00, 0x02, 0x02];

const ARP_LEN: usize = 28;
const ARP_REQUEST: u16 = 1;
const ARP_REPLY: u16 = 2;

/// Answer an ARP request if it asks for one of `ours`. Returns the whole
/// reply frame.
pub fn handle(payload: &[u8], src_mac: &[u8], ours: &[Ipv4Addr]) -> Option<Vec<u8>> {
    if payload.len() < ARP_LEN {
        return None;
    }
    let operation = u16::from_be_bytes([payload[6], payload[7]]);
    if operation != ARP_REQUEST {
        return None;
    }
    let target = Ipv4Addr::new(payload[24], payload[25], payload[26], payload[27]);
    if !ours.contains(&target) {
        return None;
    }
    tracing::debug!(%target, "arp request");

    let mut reply = Vec::with_capacity(14 + ARP_LEN);
    reply.extend_from_slice(&build_eth_header(src_mac, &GATEWAY_MAC, ETHERTYPE_ARP));
    let mut arp = [0u8; ARP_LEN];
    arp[0..2].copy_from_slice(&[0, 1]);
    arp[2..4].copy_from_slice(&[0x08, 0]);
    arp[4] = 6;
    arp[5] = 4;
    arp[6..8].copy_from_slice(&ARP_REPLY.to_be_bytes());
    arp[8..14].copy_from_slice(&GATEWAY_MAC);
    arp[14..18].copy_from_slice(&target.octets());
    arp[18..24].copy_from_slice(src_mac);
    arp[24..28].copy_from_slice(&payload[14..18]);
    reply.extend_from_slice(&arp);
    Some(reply)
}

#[cfg(test)]
mod tests {
    use super::*;

    const GUEST_MAC: [u8; 6] = [0x52, 0x54, 0, 0x12, 0x34, 0x56];

    fn request(target: Ipv4Addr, op: u16) -> Vec<u8> {
        let mut arp = vec![0u8; ARP_LEN];
        arp[0..2].copy_from_slice(&[0, 1]);
        arp[2..4].copy_from_slice(&[0x08, 0]);
        arp[4] = 6;
        arp[5] = 4;
        arp[6..8].copy_from_slice(&op.to_be_bytes());
        arp[8..14].copy_from_slice(&GUEST_MAC);
        arp[14..18].copy_from_slice(&[10, 0, 2, 15]);
        arp[24..28].copy_from_slice(&target.octets());
        arp
    }

    #[test]
    fn test_reply_for_alias() {
        let alias = Ipv4Addr::new(10, 0, 2, 2);
        let reply = handle(&request(alias, ARP_REQUEST), &GUEST_MAC, &[alias]).unwrap();
        assert_eq!(&reply[0..6], &GUEST_MAC);
        assert_eq!(&reply[6..12], &GATEWAY_MAC);
        let arp = &reply[14..];
        assert_eq!(u16::from_be_bytes([arp[6], arp[7]]), ARP_REPLY);
        assert_eq!(&arp[8..14], &GATEWAY_MAC);
        assert_eq!(&arp[14..18], &[10, 0, 2, 2]);
        assert_eq!(&arp[24..28], &[10, 0, 2, 15]);
    }

    #[test]
    fn test_ignores_other_targets_and_replies() {
        let alias = Ipv4Addr::new(10, 0, 2, 2);
        let other = Ipv4Addr::new(10, 0, 2, 99);
        assert!(handle(&request(other, ARP_REQUEST), &GUEST_MAC, &[alias]).is_none());
        assert!(handle(&request(alias, ARP_REPLY), &GUEST_MAC, &[alias]).is_none());
        assert!(handle(&[0u8; 10], &GUEST_MAC, &[alias]).is_none());
    }
}
