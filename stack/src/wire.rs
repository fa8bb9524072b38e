//! Ethernet, IPv4, TCP and UDP header codecs and checksums.
//!
//! Everything on the wire is big-endian; conversion happens here and
//! nowhere else.

use std::net::Ipv4Addr;

pub const ETH_HLEN: usize = 14;
pub const ETHERTYPE_ARP: u16 = 0x0806;
pub const ETHERTYPE_IPV4: u16 = 0x0800;

pub const IP_PROTO_ICMP: u8 = 1;
pub const IP_PROTO_TCP: u8 = 6;
pub const IP_PROTO_UDP: u8 = 17;

pub const IP_HLEN: usize = 20;
pub const TCP_HLEN: usize = 20;
pub const UDP_HLEN: usize = 8;
pub const IP_MAXPACKET: usize = 65535;
pub const IP_DEFAULT_TTL: u8 = 64;

pub const IP_DF: u16 = 0x4000;
pub const IP_MF: u16 = 0x2000;
pub const IP_OFFMASK: u16 = 0x1fff;

pub const IPTOS_LOWDELAY: u8 = 0x10;
pub const IPTOS_THROUGHPUT: u8 = 0x08;

pub const BROADCAST_MAC: [u8; 6] = [0xff; 6];

/// Build an ethernet header.
pub fn build_eth_header(dst: &[u8], src: &[u8], ethertype: u16) -> [u8; ETH_HLEN] {
    let mut hdr = [0u8; ETH_HLEN];
    hdr[0..6].copy_from_slice(dst);
    hdr[6..12].copy_from_slice(src);
    hdr[12..14].copy_from_slice(&ethertype.to_be_bytes());
    hdr
}

/// Internet checksum of `data`.
pub fn checksum(data: &[u8]) -> u16 {
    finalize_checksum(sum_be_words(data))
}

/// TCP/UDP checksum including the IPv4 pseudo-header. `data` is the whole
/// segment with its checksum field zeroed (or intact, when verifying: a
/// valid segment then sums to zero).
pub fn tcp_udp_checksum(src: Ipv4Addr, dst: Ipv4Addr, proto: u8, data: &[u8]) -> u16 {
    let src = src.octets();
    let dst = dst.octets();
    let mut sum = 0u64;
    sum += u16::from_be_bytes([src[0], src[1]]) as u64;
    sum += u16::from_be_bytes([src[2], src[3]]) as u64;
    sum += u16::from_be_bytes([dst[0], dst[1]]) as u64;
    sum += u16::from_be_bytes([dst[2], dst[3]]) as u64;
    sum += proto as u64;
    sum += data.len() as u64;
    sum += sum_be_words(data);
    finalize_checksum(sum)
}

#[inline]
fn finalize_checksum(mut sum: u64) -> u16 {
    while (sum >> 16) != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

/// Sum 16-bit big-endian words in `data` into a 64-bit accumulator.
#[inline]
fn sum_be_words(data: &[u8]) -> u64 {
    let mut chunks = data.chunks_exact(2);
    let mut sum: u64 = chunks
        .by_ref()
        .map(|w| u16::from_be_bytes([w[0], w[1]]) as u64)
        .sum();
    if let [last] = chunks.remainder() {
        sum += u16::from_be_bytes([*last, 0]) as u64;
    }
    sum
}

pub fn read_u16(buf: &[u8], at: usize) -> u16 {
    u16::from_be_bytes([buf[at], buf[at + 1]])
}

pub fn read_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

pub fn read_addr(buf: &[u8], at: usize) -> Ipv4Addr {
    Ipv4Addr::new(buf[at], buf[at + 1], buf[at + 2], buf[at + 3])
}

/// Decoded IPv4 header, in host order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv4Header {
    pub header_len: usize,
    pub tos: u8,
    pub total_len: usize,
    pub id: u16,
    /// Flags and fragment offset exactly as on the wire.
    pub frag: u16,
    pub ttl: u8,
    pub proto: u8,
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
}

impl Ipv4Header {
    /// Decode without validation beyond the bounds needed to read it.
    pub fn parse(buf: &[u8]) -> Option<Self> {
        if buf.len() < IP_HLEN {
            return None;
        }
        let header_len = ((buf[0] & 0x0f) as usize) * 4;
        Some(Self {
            header_len,
            tos: buf[1],
            total_len: read_u16(buf, 2) as usize,
            id: read_u16(buf, 4),
            frag: read_u16(buf, 6),
            ttl: buf[8],
            proto: buf[9],
            src: read_addr(buf, 12),
            dst: read_addr(buf, 16),
        })
    }

    pub fn version(buf: &[u8]) -> u8 {
        buf.first().map(|b| b >> 4).unwrap_or(0)
    }

    pub fn more_fragments(&self) -> bool {
        self.frag & IP_MF != 0
    }

    pub fn dont_fragment(&self) -> bool {
        self.frag & IP_DF != 0
    }

    /// Fragment offset in bytes.
    pub fn frag_offset(&self) -> usize {
        ((self.frag & IP_OFFMASK) as usize) * 8
    }

    pub fn is_fragment(&self) -> bool {
        self.more_fragments() || self.frag_offset() != 0
    }

    pub fn payload_len(&self) -> usize {
        self.total_len.saturating_sub(self.header_len)
    }

    /// Write a 20-byte header (no options) with a fresh checksum.
    pub fn emit(&self, out: &mut [u8]) {
        out[0] = 0x45;
        out[1] = self.tos;
        out[2..4].copy_from_slice(&(self.total_len as u16).to_be_bytes());
        out[4..6].copy_from_slice(&self.id.to_be_bytes());
        out[6..8].copy_from_slice(&self.frag.to_be_bytes());
        out[8] = self.ttl;
        out[9] = self.proto;
        out[10..12].copy_from_slice(&[0, 0]);
        out[12..16].copy_from_slice(&self.src.octets());
        out[16..20].copy_from_slice(&self.dst.octets());
        let sum = checksum(&out[..IP_HLEN]);
        out[10..12].copy_from_slice(&sum.to_be_bytes());
    }
}

/// Rewrite length, fragment field and checksum of a header in place.
pub fn patch_ip_header(hdr: &mut [u8], total_len: usize, frag: u16) {
    let hlen = ((hdr[0] & 0x0f) as usize) * 4;
    hdr[2..4].copy_from_slice(&(total_len as u16).to_be_bytes());
    hdr[6..8].copy_from_slice(&frag.to_be_bytes());
    hdr[10..12].copy_from_slice(&[0, 0]);
    let sum = checksum(&hdr[..hlen]);
    hdr[10..12].copy_from_slice(&sum.to_be_bytes());
}

pub mod tcp_flags {
    pub const FIN: u8 = 0x01;
    pub const SYN: u8 = 0x02;
    pub const RST: u8 = 0x04;
    pub const PSH: u8 = 0x08;
    pub const ACK: u8 = 0x10;
    pub const URG: u8 = 0x20;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpHeader {
    pub src_port: u16,
    pub dst_port: u16,
    pub seq: u32,
    pub ack: u32,
    /// Header length in bytes, options included.
    pub data_offset: usize,
    pub flags: u8,
    pub window: u16,
}

impl TcpHeader {
    pub fn parse(buf: &[u8]) -> Option<Self> {
        if buf.len() < TCP_HLEN {
            return None;
        }
        Some(Self {
            src_port: read_u16(buf, 0),
            dst_port: read_u16(buf, 2),
            seq: read_u32(buf, 4),
            ack: read_u32(buf, 8),
            data_offset: ((buf[12] >> 4) as usize) * 4,
            flags: buf[13] & 0x3f,
            window: read_u16(buf, 14),
        })
    }

    /// Write header plus `options` (a multiple of four bytes). The checksum
    /// field is left zero.
    pub fn emit(&self, out: &mut [u8], options: &[u8]) {
        debug_assert!(options.len() % 4 == 0);
        out[0..2].copy_from_slice(&self.src_port.to_be_bytes());
        out[2..4].copy_from_slice(&self.dst_port.to_be_bytes());
        out[4..8].copy_from_slice(&self.seq.to_be_bytes());
        out[8..12].copy_from_slice(&self.ack.to_be_bytes());
        out[12] = (((TCP_HLEN + options.len()) / 4) as u8) << 4;
        out[13] = self.flags;
        out[14..16].copy_from_slice(&self.window.to_be_bytes());
        out[16..20].copy_from_slice(&[0, 0, 0, 0]);
        out[TCP_HLEN..TCP_HLEN + options.len()].copy_from_slice(options);
    }
}

/// Maximum segment size announced in a SYN's options, if any.
pub fn parse_mss_option(options: &[u8]) -> Option<u16> {
    let mut i = 0usize;
    while i < options.len() {
        let kind = options[i];
        match kind {
            0 => break,
            1 => {
                i += 1;
                continue;
            }
            _ => {
                if i + 1 >= options.len() {
                    break;
                }
                let len = options[i + 1] as usize;
                if len < 2 || i + len > options.len() {
                    break;
                }
                if kind == 2 && len == 4 {
                    return Some(read_u16(options, i + 2));
                }
                i += len;
            }
        }
    }
    None
}

/// The MSS option block we put in our own SYNs.
pub fn mss_option(mss: u16) -> [u8; 4] {
    let m = mss.to_be_bytes();
    [2, 4, m[0], m[1]]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UdpHeader {
    pub src_port: u16,
    pub dst_port: u16,
    pub len: usize,
    pub checksum: u16,
}

impl UdpHeader {
    pub fn parse(buf: &[u8]) -> Option<Self> {
        if buf.len() < UDP_HLEN {
            return None;
        }
        Some(Self {
            src_port: read_u16(buf, 0),
            dst_port: read_u16(buf, 2),
            len: read_u16(buf, 4) as usize,
            checksum: read_u16(buf, 6),
        })
    }
}

/// Build a UDP datagram with its checksum filled in.
pub fn build_udp(
    src: Ipv4Addr,
    src_port: u16,
    dst: Ipv4Addr,
    dst_port: u16,
    payload: &[u8],
) -> Vec<u8> {
    let len = UDP_HLEN + payload.len();
    let mut udp = Vec::with_capacity(len);
    udp.extend_from_slice(&src_port.to_be_bytes());
    udp.extend_from_slice(&dst_port.to_be_bytes());
    udp.extend_from_slice(&(len as u16).to_be_bytes());
    udp.extend_from_slice(&[0, 0]);
    udp.extend_from_slice(payload);
    let mut sum = tcp_udp_checksum(src, dst, IP_PROTO_UDP, &udp);
    if sum == 0 {
        sum = 0xffff;
    }
    udp[6..8].copy_from_slice(&sum.to_be_bytes());
    udp
}

/// Sequence-space comparisons (modulo 2^32).
pub fn seq_lt(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) < 0
}

pub fn seq_leq(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) <= 0
}

pub fn seq_gt(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) > 0
}

pub fn seq_geq(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) >= 0
}
