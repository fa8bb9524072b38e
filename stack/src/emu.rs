//! Application-level NAT helpers.
//!
//! Some protocols carry addresses and ports inside their payload. For flows
//! tagged with one of them, every in-order chunk of guest data is scanned
//! before it is forwarded. A recognised announcement gets a NAT listener
//! opened for it and is rewritten to point at that listener. Anything that
//! does not parse is forwarded untouched. Each chunk is scanned on its own,
//! so an announcement split across two segments is not recognised.

use crate::Stack;
use crate::socket::SocketId;
use crate::tcp::{self, Emulation};
use crate::udp;
use std::net::{Ipv4Addr, SocketAddrV4};

const PORT_CMD: &[u8] = b"ORT";
const PASV_REPLY: &[u8] = b"27 Entering";
const REALAUDIO_FIRST_PORT: u16 = 6970;
const REALAUDIO_PORT_END: u16 = 7071;

/// `sscanf`-flavoured cursor over a byte buffer.
struct Scanner<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Scanner<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn peek(&self) -> Option<u8> {
        self.buf.get(self.pos).copied()
    }

    fn skip_ws(&mut self) {
        while self.peek().is_some_and(|b| b.is_ascii_whitespace()) {
            self.pos += 1;
        }
    }

    /// Match `lit`; whitespace in `lit` matches any run of whitespace,
    /// including none.
    fn literal(&mut self, lit: &[u8]) -> Option<()> {
        for &c in lit {
            if c.is_ascii_whitespace() {
                self.skip_ws();
            } else if self.peek() == Some(c) {
                self.pos += 1;
            } else {
                return None;
            }
        }
        Some(())
    }

    fn int(&mut self) -> Option<i64> {
        self.skip_ws();
        let start = self.pos;
        if matches!(self.peek(), Some(b'-' | b'+')) {
            self.pos += 1;
        }
        let digits = self.pos;
        while self.peek().is_some_and(|b| b.is_ascii_digit()) {
            self.pos += 1;
        }
        if self.pos == digits {
            self.pos = start;
            return None;
        }
        std::str::from_utf8(&self.buf[start..self.pos])
            .ok()?
            .parse()
            .ok()
    }

    fn byte(&mut self) -> Option<u8> {
        u8::try_from(self.int()?).ok()
    }

    fn word(&mut self) -> Option<&'a [u8]> {
        self.skip_ws();
        let start = self.pos;
        while self.peek().is_some_and(|b| !b.is_ascii_whitespace()) {
            self.pos += 1;
        }
        (self.pos > start).then(|| &self.buf[start..self.pos])
    }

    fn rest(&self) -> &'a [u8] {
        &self.buf[self.pos..]
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Six comma-separated bytes: four of address, two of port.
fn host_port(s: &mut Scanner<'_>) -> Option<SocketAddrV4> {
    let mut b = [0u8; 6];
    for (i, slot) in b.iter_mut().enumerate() {
        if i > 0 {
            s.literal(b",")?;
        }
        *slot = s.byte()?;
    }
    Some(SocketAddrV4::new(
        Ipv4Addr::new(b[0], b[1], b[2], b[3]),
        u16::from_be_bytes([b[4], b[5]]),
    ))
}

fn format_host_port(addr: SocketAddrV4) -> String {
    let o = addr.ip().octets();
    let p = addr.port().to_be_bytes();
    format!("{},{},{},{},{},{}", o[0], o[1], o[2], o[3], p[0], p[1])
}

/// Trailing bytes carried over after a rewritten command, up to the first
/// DEL.
fn tail(s: &mut Scanner<'_>) -> Vec<u8> {
    s.skip_ws();
    let rest = s.rest();
    let end = rest.iter().position(|&b| b == 0x7f).unwrap_or(rest.len());
    rest[..end].to_vec()
}

/// Rewrite an FTP `PORT` command or `227` passive reply. `listen` opens a
/// one-shot listener forwarding to the announced guest endpoint and returns
/// the endpoint outside peers should use.
pub fn ftp(
    data: &[u8],
    listen: &mut impl FnMut(Ipv4Addr, u16) -> Option<SocketAddrV4>,
) -> Option<Vec<u8>> {
    let (at, prefix, close) = if let Some(at) = find(data, PORT_CMD) {
        (at, &b"ORT "[..], &b""[..])
    } else if let Some(at) = find(data, PASV_REPLY) {
        (at, &b"27 Entering Passive Mode ("[..], &b")"[..])
    } else {
        return None;
    };
    let mut s = Scanner::new(&data[at..]);
    s.literal(prefix)?;
    let guest = host_port(&mut s)?;
    s.literal(close)?;
    let tail = tail(&mut s);

    let visible = listen(*guest.ip(), guest.port())?;
    tracing::debug!(%guest, %visible, "rewriting ftp data endpoint");
    let mut out = data[..at].to_vec();
    out.extend_from_slice(prefix);
    out.extend_from_slice(format_host_port(visible).as_bytes());
    out.extend_from_slice(close);
    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(&tail);
    Some(out)
}

/// Rewrite an IRC `DCC CHAT`, `DCC SEND` or `DCC MOVE` offer.
pub fn irc(
    data: &[u8],
    listen: &mut impl FnMut(Ipv4Addr, u16) -> Option<SocketAddrV4>,
) -> Option<Vec<u8>> {
    let at = find(data, b"DCC")?;
    let mut s = Scanner::new(&data[at..]);
    s.literal(b"DCC ")?;
    let kind = s.word()?;
    let name = s.word()?;
    let addr = u32::try_from(s.int()?).ok()?;
    let port = u16::try_from(s.int()?).ok()?;
    let line = match kind {
        b"CHAT" => {
            let visible = listen(Ipv4Addr::from(addr), port)?;
            format!(
                "DCC CHAT chat {} {}\x01\n",
                u32::from(*visible.ip()),
                visible.port()
            )
        }
        b"SEND" | b"MOVE" => {
            let size = u32::try_from(s.int()?).ok()?;
            let visible = listen(Ipv4Addr::from(addr), port)?;
            format!(
                "DCC {} {} {} {} {}\x01\n",
                String::from_utf8_lossy(kind),
                String::from_utf8_lossy(name),
                u32::from(*visible.ip()),
                visible.port(),
                size
            )
        }
        _ => return None,
    };
    tracing::debug!(kind = %String::from_utf8_lossy(kind), "rewriting dcc offer");
    let mut out = data[..at].to_vec();
    out.extend_from_slice(line.as_bytes());
    Some(out)
}

/// Rewrite the NUL-terminated decimal port an rsh or kshell client sends
/// first. `listen` receives the guest's port.
pub fn ksh(data: &[u8], listen: &mut impl FnMut(u16) -> Option<u16>) -> Option<Vec<u8>> {
    let (last, digits) = data.split_last()?;
    if *last != 0 || digits.is_empty() || !digits.iter().all(u8::is_ascii_digit) {
        return None;
    }
    let port: u16 = std::str::from_utf8(digits).ok()?.parse().ok()?;
    if port == 0 {
        return None;
    }
    let visible = listen(port)?;
    let mut out = visible.to_string().into_bytes();
    out.push(0);
    Some(out)
}

/// Parse a complete ident query line `fport , lport` and answer it with
/// `lookup`, which maps the guest's port to the host port of the matching
/// flow.
pub fn ident(line: &[u8], lookup: &mut impl FnMut(u16, u16) -> Option<u16>) -> Option<Vec<u8>> {
    let mut s = Scanner::new(line);
    let fport = u16::try_from(s.int()?).ok()?;
    let sep = s.pos;
    while matches!(s.peek(), Some(b' ' | b',')) {
        s.pos += 1;
    }
    if s.pos == sep {
        return None;
    }
    let lport = u16::try_from(s.int()?).ok()?;
    let host_port = lookup(fport, lport).unwrap_or(lport);
    Some(format!("{},{}\r\n", fport, host_port).into_bytes())
}

/// RealAudio control stream scanner. Looks for the `PNA\0` header, skips
/// the version fields and rewrites the client's UDP port. The position in
/// the header survives across chunks.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RealAudioScan {
    stage: u8,
    /// Bytes still to skip at the start of the next chunk.
    skip: usize,
}

impl RealAudioScan {
    const MAGIC: [u8; 4] = [0x50, 0x4e, 0x41, 0x00];

    /// Scan `data` in place. `listen` gets a candidate NAT port and the
    /// guest's port and reports whether the redirect could be opened.
    pub fn scan(&mut self, data: &mut [u8], listen: &mut impl FnMut(u16, u16) -> bool) {
        let mut i = self.skip.min(data.len());
        self.skip -= i;
        while i < data.len() {
            match self.stage {
                0 | 2 | 3 => {
                    let b = data[i];
                    i += 1;
                    if b != Self::MAGIC[self.stage as usize] {
                        self.stage = 0;
                        continue;
                    }
                }
                1 => {
                    let b = data[i];
                    i += 1;
                    if b == Self::MAGIC[0] {
                        continue;
                    }
                    if b != Self::MAGIC[1] {
                        self.stage = 0;
                        continue;
                    }
                }
                // Version byte.
                4 => i += 1,
                5 => {
                    let Some(&next) = data.get(i + 1) else {
                        return;
                    };
                    let skip = if next == 0x02 { 8 } else { 4 };
                    if i + skip > data.len() {
                        self.skip = i + skip - data.len();
                        self.stage = 6;
                        return;
                    }
                    i += skip;
                }
                6 => {
                    self.stage = 0;
                    if i + 2 > data.len() {
                        return;
                    }
                    let mut lport = u16::from_be_bytes([data[i], data[i + 1]]);
                    if lport < REALAUDIO_FIRST_PORT {
                        lport = lport.wrapping_add(256);
                    }
                    if !(REALAUDIO_FIRST_PORT..=7170).contains(&lport) {
                        return;
                    }
                    let port = (REALAUDIO_FIRST_PORT..REALAUDIO_PORT_END)
                        .find(|&p| listen(p, lport))
                        .unwrap_or(0);
                    tracing::debug!(guest_port = lport, port, "rewriting realaudio port");
                    data[i..i + 2].copy_from_slice(&port.to_be_bytes());
                    return;
                }
                _ => {
                    self.stage = 0;
                    continue;
                }
            }
            self.stage += 1;
        }
    }
}

fn open_tcp_listener(stack: &mut Stack, addr: Ipv4Addr, port: u16) -> Option<SocketAddrV4> {
    match tcp::listen(stack, 0, addr, port, true) {
        Ok(id) => stack
            .sockets
            .get(id)
            .map(|so| SocketAddrV4::new(so.faddr, so.fport)),
        Err(e) => {
            tracing::debug!(error = %e, "emulation listener failed");
            None
        }
    }
}

/// Run `bytes` through the flow's emulation, returning what should be
/// forwarded to the host.
pub(crate) fn rewrite(stack: &mut Stack, id: SocketId, bytes: Vec<u8>) -> Vec<u8> {
    let Some(so) = stack.sockets.get_mut(id) else {
        return bytes;
    };
    let (laddr, faddr) = (so.laddr, so.faddr);
    let limit = so.rcv.capacity();
    let Some(tp) = so.tcb_mut() else {
        return bytes;
    };
    if !tp.emu.is_active() {
        return bytes;
    }
    let emu = std::mem::take(&mut tp.emu);

    let (next, out) = match emu {
        Emulation::None => (Emulation::None, bytes),
        Emulation::Ftp => {
            let out = ftp(&bytes, &mut |a, p| open_tcp_listener(stack, a, p));
            (Emulation::Ftp, out.unwrap_or(bytes))
        }
        Emulation::Irc => {
            let out = irc(&bytes, &mut |a, p| open_tcp_listener(stack, a, p));
            (Emulation::Irc, out.unwrap_or(bytes))
        }
        Emulation::Ksh => {
            let out = ksh(&bytes, &mut |p| {
                open_tcp_listener(stack, laddr, p).map(|v| v.port())
            });
            (Emulation::None, out.unwrap_or(bytes))
        }
        Emulation::RealAudio(mut scan) => {
            let mut out = bytes;
            scan.scan(&mut out, &mut |port, lport| {
                udp::listen(stack, port, laddr, lport, true).is_ok()
            });
            (Emulation::RealAudio(scan), out)
        }
        Emulation::Ident(mut pending) => {
            pending.extend_from_slice(&bytes);
            if pending.iter().any(|&b| b == b'\r' || b == b'\n') {
                let out = ident(&pending, &mut |fport, lport| {
                    ident_lookup(stack, laddr, faddr, fport, lport)
                });
                (Emulation::Ident(Vec::new()), out.unwrap_or(pending))
            } else if pending.len() >= limit {
                // No query is this long; stop emulating and pass it on.
                tracing::debug!(len = pending.len(), "ident line too long");
                (Emulation::None, pending)
            } else {
                (Emulation::Ident(pending), Vec::new())
            }
        }
    };

    if let Some(tp) = stack.sockets.get_mut(id).and_then(|so| so.tcb_mut()) {
        tp.emu = next;
    }
    out
}

/// Host port of the flow from guest `laddr:lport` to `faddr:fport`.
fn ident_lookup(
    stack: &Stack,
    laddr: Ipv4Addr,
    faddr: Ipv4Addr,
    fport: u16,
    lport: u16,
) -> Option<u16> {
    stack.sockets.tcp_ids().into_iter().find_map(|id| {
        let so = stack.sockets.get(id)?;
        (so.laddr == laddr && so.lport == lport && so.faddr == faddr && so.fport == fport)
            .then(|| so.host.local_port())
            .flatten()
    })
}
