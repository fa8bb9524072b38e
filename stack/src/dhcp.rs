//! DHCP/BOOTP server for the single guest.

use crate::{Stack, udp};
use std::net::Ipv4Addr;

const BOOTREQUEST: u8 = 1;
const BOOTREPLY: u8 = 2;
const MAGIC_COOKIE: [u8; 4] = [99, 130, 83, 99];
const OPTIONS_AT: usize = 240;
const LEASE_SECS: u32 = 86400;

const OPT_PAD: u8 = 0;
const OPT_SUBNET_MASK: u8 = 1;
const OPT_ROUTER: u8 = 3;
const OPT_DNS: u8 = 6;
const OPT_LEASE_TIME: u8 = 51;
const OPT_MSG_TYPE: u8 = 53;
const OPT_SERVER_ID: u8 = 54;
const OPT_END: u8 = 255;

const DHCPDISCOVER: u8 = 1;
const DHCPOFFER: u8 = 2;
const DHCPREQUEST: u8 = 3;
const DHCPACK: u8 = 5;

/// Addresses handed out in every reply.
#[derive(Debug, Clone, Copy)]
pub struct Lease {
    pub client: Ipv4Addr,
    pub server: Ipv4Addr,
    pub netmask: Ipv4Addr,
    pub dns: Ipv4Addr,
}

/// Handle a request arriving on the BOOTP server port.
pub(crate) fn input(stack: &mut Stack, payload: &[u8]) {
    let config = &stack.config;
    let lease = Lease {
        client: config.guest_addr,
        server: config.alias_addr,
        netmask: config.netmask,
        dns: config.dns_alias,
    };
    let Some(reply) = handle(payload, &lease) else {
        return;
    };
    udp::output(
        stack,
        (lease.server, 67),
        (Ipv4Addr::BROADCAST, 68),
        0,
        &reply,
    );
}

/// Build the reply to a BOOTP or DHCP request. DISCOVER gets an OFFER,
/// REQUEST an ACK; other DHCP messages are ignored.
pub fn handle(payload: &[u8], lease: &Lease) -> Option<Vec<u8>> {
    if payload.len() < OPTIONS_AT || payload[0] != BOOTREQUEST {
        return None;
    }
    let msg_type = if payload[236..240] == MAGIC_COOKIE {
        find_option(&payload[OPTIONS_AT..], OPT_MSG_TYPE)
    } else {
        None
    };
    let response = match msg_type {
        Some(DHCPDISCOVER) => Some(DHCPOFFER),
        Some(DHCPREQUEST) => Some(DHCPACK),
        Some(_) => return None,
        // Plain BOOTP.
        None => None,
    };
    tracing::debug!(?msg_type, "dhcp request");
    let reply = build_reply(payload, response, lease);
    tracing::info!(
        response = match response {
            Some(DHCPOFFER) => "OFFER",
            Some(_) => "ACK",
            None => "BOOTREPLY",
        },
        ip = %lease.client,
        "dhcp response"
    );
    Some(reply)
}

fn find_option(options: &[u8], code: u8) -> Option<u8> {
    let mut i = 0;
    while i < options.len() {
        match options[i] {
            OPT_END => break,
            OPT_PAD => {
                i += 1;
                continue;
            }
            _ => {}
        }
        let len = *options.get(i + 1)? as usize;
        if options[i] == code && len >= 1 {
            return options.get(i + 2).copied();
        }
        i += 2 + len;
    }
    None
}

fn put_addr(out: &mut Vec<u8>, code: u8, addr: Ipv4Addr) {
    out.extend_from_slice(&[code, 4]);
    out.extend_from_slice(&addr.octets());
}

fn build_reply(request: &[u8], msg_type: Option<u8>, lease: &Lease) -> Vec<u8> {
    let mut reply = vec![0u8; OPTIONS_AT];
    reply[0] = BOOTREPLY;
    reply[1] = 1;
    reply[2] = 6;
    reply[4..8].copy_from_slice(&request[4..8]);
    reply[10..12].copy_from_slice(&[0x80, 0]);
    reply[16..20].copy_from_slice(&lease.client.octets());
    reply[20..24].copy_from_slice(&lease.server.octets());
    reply[28..34].copy_from_slice(&request[28..34]);
    reply[236..240].copy_from_slice(&MAGIC_COOKIE);

    if let Some(t) = msg_type {
        reply.extend_from_slice(&[OPT_MSG_TYPE, 1, t]);
        put_addr(&mut reply, OPT_SERVER_ID, lease.server);
        reply.extend_from_slice(&[OPT_LEASE_TIME, 4]);
        reply.extend_from_slice(&LEASE_SECS.to_be_bytes());
    }
    put_addr(&mut reply, OPT_SUBNET_MASK, lease.netmask);
    put_addr(&mut reply, OPT_ROUTER, lease.server);
    put_addr(&mut reply, OPT_DNS, lease.dns);
    reply.push(OPT_END);
    // BOOTP clients expect at least the 300-byte legacy size.
    if reply.len() < 300 {
        reply.resize(300, 0);
    }
    reply
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lease() -> Lease {
        Lease {
            client: Ipv4Addr::new(10, 0, 2, 15),
            server: Ipv4Addr::new(10, 0, 2, 2),
            netmask: Ipv4Addr::new(255, 255, 255, 0),
            dns: Ipv4Addr::new(10, 0, 2, 3),
        }
    }

    fn request(msg_type: Option<u8>) -> Vec<u8> {
        let mut req = vec![0u8; OPTIONS_AT];
        req[0] = BOOTREQUEST;
        req[4..8].copy_from_slice(&[0xde, 0xad, 0xbe, 0xef]);
        req[28..34].copy_from_slice(&[0x52, 0x54, 0, 0x12, 0x34, 0x56]);
        req[236..240].copy_from_slice(&MAGIC_COOKIE);
        if let Some(t) = msg_type {
            req.extend_from_slice(&[OPT_PAD, OPT_MSG_TYPE, 1, t]);
        }
        req.push(OPT_END);
        req
    }

    #[test]
    fn test_discover_gets_offer() {
        let reply = handle(&request(Some(DHCPDISCOVER)), &lease()).unwrap();
        assert_eq!(reply[0], BOOTREPLY);
        assert_eq!(&reply[4..8], &[0xde, 0xad, 0xbe, 0xef]);
        assert_eq!(&reply[16..20], &[10, 0, 2, 15]);
        assert_eq!(&reply[28..34], &[0x52, 0x54, 0, 0x12, 0x34, 0x56]);
        let options = &reply[OPTIONS_AT..];
        assert_eq!(find_option(options, OPT_MSG_TYPE), Some(DHCPOFFER));
        assert_eq!(find_option(options, OPT_ROUTER), Some(10));
        let dns_at = options.windows(2).position(|w| w == [OPT_DNS, 4]).unwrap();
        assert_eq!(&options[dns_at + 2..dns_at + 6], &[10, 0, 2, 3]);
    }

    #[test]
    fn test_request_gets_ack() {
        let reply = handle(&request(Some(DHCPREQUEST)), &lease()).unwrap();
        assert_eq!(find_option(&reply[OPTIONS_AT..], OPT_MSG_TYPE), Some(DHCPACK));
    }

    #[test]
    fn test_plain_bootp_and_ignored_types() {
        let reply = handle(&request(None), &lease()).unwrap();
        assert_eq!(find_option(&reply[OPTIONS_AT..], OPT_MSG_TYPE), None);
        assert!(reply.len() >= 300);
        // DHCPRELEASE
        assert!(handle(&request(Some(7)), &lease()).is_none());
        assert!(handle(&[1u8; 10], &lease()).is_none());
    }
}
