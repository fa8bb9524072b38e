//! Read-only TFTP server on the gateway alias.
//!
//! Octet mode only, one outstanding block per client, a small fixed table
//! of sessions.

use crate::{Stack, udp};
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::net::SocketAddrV4;
use std::path::{Component, Path, PathBuf};
use std::time::{Duration, Instant};

pub const MAX_SESSIONS: usize = 3;
pub const SESSION_TIMEOUT: Duration = Duration::from_secs(5);
pub const BLOCK_SIZE: usize = 512;
pub const TFTP_PORT: u16 = 69;

const OP_RRQ: u16 = 1;
const OP_WRQ: u16 = 2;
const OP_DATA: u16 = 3;
const OP_ACK: u16 = 4;
const OP_ERROR: u16 = 5;

pub const ERR_NOT_FOUND: u16 = 1;
pub const ERR_ACCESS: u16 = 2;
pub const ERR_ILLEGAL_OP: u16 = 4;

#[derive(Debug)]
struct Session {
    client: SocketAddrV4,
    file: File,
    /// Last block sent, counting from 1.
    block: u32,
    /// The last block sent was short: the next matching ACK ends the transfer.
    final_sent: bool,
    last_active: Instant,
}

#[derive(Debug)]
pub struct TftpServer {
    root: PathBuf,
    sessions: Vec<Option<Session>>,
}

impl TftpServer {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            sessions: (0..MAX_SESSIONS).map(|_| None).collect(),
        }
    }

    pub fn active_sessions(&self) -> usize {
        self.sessions.iter().filter(|s| s.is_some()).count()
    }

    fn find(&self, client: SocketAddrV4) -> Option<usize> {
        self.sessions
            .iter()
            .position(|s| s.as_ref().is_some_and(|s| s.client == client))
    }

    /// A slot for a new session: the client's own, a free one, or one whose
    /// client went quiet.
    fn slot_for(&self, client: SocketAddrV4, now: Instant) -> Option<usize> {
        self.find(client).or_else(|| {
            self.sessions.iter().position(|s| match s {
                None => true,
                Some(s) => now.duration_since(s.last_active) > SESSION_TIMEOUT,
            })
        })
    }

    /// Handle one packet from `client`, returning the reply to send, if any.
    pub fn handle(&mut self, client: SocketAddrV4, packet: &[u8], now: Instant) -> Option<Vec<u8>> {
        if packet.len() < 2 {
            return None;
        }
        let op = u16::from_be_bytes([packet[0], packet[1]]);
        match op {
            OP_RRQ => self.read_request(client, &packet[2..], now),
            OP_WRQ => Some(error_packet(ERR_ILLEGAL_OP, "Unsupported operation")),
            OP_ACK => {
                let block = u16::from_be_bytes([*packet.get(2)?, *packet.get(3)?]);
                self.ack(client, block, now)
            }
            OP_ERROR => {
                if let Some(i) = self.find(client) {
                    tracing::debug!(%client, "tftp client aborted");
                    self.sessions[i] = None;
                }
                None
            }
            _ => Some(error_packet(ERR_ILLEGAL_OP, "Unsupported operation")),
        }
    }

    fn read_request(
        &mut self,
        client: SocketAddrV4,
        body: &[u8],
        now: Instant,
    ) -> Option<Vec<u8>> {
        let mut fields = body.split(|&b| b == 0);
        let name = std::str::from_utf8(fields.next()?).ok()?;
        let mode = std::str::from_utf8(fields.next()?).ok()?;
        // A repeated request restarts the client's transfer.
        if let Some(i) = self.find(client) {
            self.sessions[i] = None;
        }

        if !mode.eq_ignore_ascii_case("octet") {
            return Some(error_packet(ERR_ILLEGAL_OP, "Unsupported transfer mode"));
        }
        let Some(path) = self.resolve(name) else {
            tracing::debug!(%client, name, "tftp path rejected");
            return Some(error_packet(ERR_ACCESS, "Access violation"));
        };
        let file = match File::open(&path) {
            Ok(file) => file,
            Err(e) => {
                tracing::debug!(error = %e, %client, name, "tftp open failed");
                return Some(error_packet(ERR_NOT_FOUND, "File not found"));
            }
        };
        let Some(slot) = self.slot_for(client, now) else {
            tracing::debug!(%client, name, "tftp session table full");
            return None;
        };
        tracing::debug!(%client, name, "tftp read");
        let mut session = Session {
            client,
            file,
            block: 0,
            final_sent: false,
            last_active: now,
        };
        let reply = session.next_block();
        match reply {
            Ok(data) => {
                self.sessions[slot] = Some(session);
                Some(data)
            }
            Err(e) => {
                tracing::debug!(error = %e, name, "tftp read failed");
                Some(error_packet(ERR_NOT_FOUND, "File not found"))
            }
        }
    }

    fn ack(&mut self, client: SocketAddrV4, block: u16, now: Instant) -> Option<Vec<u8>> {
        let i = self.find(client)?;
        let session = self.sessions[i].as_mut()?;
        if block != session.block as u16 {
            return None;
        }
        session.last_active = now;
        if session.final_sent {
            tracing::debug!(%client, blocks = session.block, "tftp transfer complete");
            self.sessions[i] = None;
            return None;
        }
        match session.next_block() {
            Ok(data) => Some(data),
            Err(e) => {
                tracing::debug!(error = %e, %client, "tftp read failed");
                self.sessions[i] = None;
                Some(error_packet(ERR_NOT_FOUND, "File not found"))
            }
        }
    }

    /// Map a requested name under the root. Absolute paths, parent
    /// references and directory names are refused.
    fn resolve(&self, name: &str) -> Option<PathBuf> {
        if name.is_empty() || name.ends_with('/') {
            return None;
        }
        let rel = Path::new(name);
        if !rel.components().all(|c| matches!(c, Component::Normal(_))) {
            return None;
        }
        Some(self.root.join(rel))
    }

    /// Drop sessions whose client stopped acknowledging.
    pub fn expire(&mut self, now: Instant) {
        for slot in &mut self.sessions {
            if slot
                .as_ref()
                .is_some_and(|s| now.duration_since(s.last_active) > SESSION_TIMEOUT)
            {
                tracing::debug!("tftp session timed out");
                *slot = None;
            }
        }
    }
}

impl Session {
    fn next_block(&mut self) -> io::Result<Vec<u8>> {
        let offset = self.block as u64 * BLOCK_SIZE as u64;
        self.file.seek(SeekFrom::Start(offset))?;
        let mut data = Vec::with_capacity(4 + BLOCK_SIZE);
        self.block += 1;
        data.extend_from_slice(&OP_DATA.to_be_bytes());
        data.extend_from_slice(&(self.block as u16).to_be_bytes());
        let read = (&mut self.file)
            .take(BLOCK_SIZE as u64)
            .read_to_end(&mut data)?;
        self.final_sent = read < BLOCK_SIZE;
        Ok(data)
    }
}

fn error_packet(code: u16, msg: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(5 + msg.len());
    out.extend_from_slice(&OP_ERROR.to_be_bytes());
    out.extend_from_slice(&code.to_be_bytes());
    out.extend_from_slice(msg.as_bytes());
    out.push(0);
    out
}

/// Serve a datagram the guest sent to the alias's TFTP port.
pub(crate) fn input(stack: &mut Stack, client: SocketAddrV4, packet: &[u8]) {
    let now = stack.now;
    let Some(reply) = stack.tftp.handle(client, packet, now) else {
        return;
    };
    let alias = stack.config.alias_addr;
    udp::output(
        stack,
        (alias, TFTP_PORT),
        (*client.ip(), client.port()),
        0,
        &reply,
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn client(port: u16) -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::new(10, 0, 2, 15), port)
    }

    fn rrq(name: &str, mode: &str) -> Vec<u8> {
        let mut p = OP_RRQ.to_be_bytes().to_vec();
        p.extend_from_slice(name.as_bytes());
        p.push(0);
        p.extend_from_slice(mode.as_bytes());
        p.push(0);
        p
    }

    fn ack(block: u16) -> Vec<u8> {
        let mut p = OP_ACK.to_be_bytes().to_vec();
        p.extend_from_slice(&block.to_be_bytes());
        p
    }

    fn error_code(p: &[u8]) -> Option<u16> {
        (u16::from_be_bytes([p[0], p[1]]) == OP_ERROR).then(|| u16::from_be_bytes([p[2], p[3]]))
    }

    fn root_with(name: &str, contents: &[u8]) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(name), contents).unwrap();
        dir
    }

    #[test]
    fn test_read_in_blocks() {
        let contents: Vec<u8> = (0..1100u32).map(|i| (i % 251) as u8).collect();
        let dir = root_with("boot.img", &contents);
        let mut server = TftpServer::new(dir.path());
        let now = Instant::now();

        let mut received = Vec::new();
        let mut reply = server.handle(client(2000), &rrq("boot.img", "octet"), now);
        let mut expected_block = 1u16;
        while let Some(p) = reply {
            assert_eq!(u16::from_be_bytes([p[0], p[1]]), OP_DATA);
            assert_eq!(u16::from_be_bytes([p[2], p[3]]), expected_block);
            received.extend_from_slice(&p[4..]);
            reply = server.handle(client(2000), &ack(expected_block), now);
            expected_block += 1;
        }
        assert_eq!(received, contents);
        assert_eq!(expected_block, 4);
        assert_eq!(server.active_sessions(), 0);
    }

    #[test]
    fn test_exact_multiple_ends_with_empty_block() {
        let dir = root_with("f", &[7u8; 1024]);
        let mut server = TftpServer::new(dir.path());
        let now = Instant::now();
        server.handle(client(1), &rrq("f", "OCTET"), now).unwrap();
        server.handle(client(1), &ack(1), now).unwrap();
        let last = server.handle(client(1), &ack(2), now).unwrap();
        assert_eq!(last.len(), 4);
        assert_eq!(u16::from_be_bytes([last[2], last[3]]), 3);
        assert!(server.handle(client(1), &ack(3), now).is_none());
        assert_eq!(server.active_sessions(), 0);
    }

    #[test]
    fn test_traversal_rejected_without_session() {
        let dir = root_with("f", b"x");
        let mut server = TftpServer::new(dir.path().join("sub"));
        let now = Instant::now();
        for name in ["../secret", "/etc/passwd", "a/../../b", "dir/"] {
            let reply = server.handle(client(1), &rrq(name, "octet"), now).unwrap();
            assert_eq!(error_code(&reply), Some(ERR_ACCESS), "{}", name);
        }
        assert_eq!(server.active_sessions(), 0);
    }

    #[test]
    fn test_missing_file_and_bad_mode() {
        let dir = tempfile::tempdir().unwrap();
        let mut server = TftpServer::new(dir.path());
        let now = Instant::now();
        let reply = server.handle(client(1), &rrq("nope", "octet"), now).unwrap();
        assert_eq!(error_code(&reply), Some(ERR_NOT_FOUND));
        let reply = server.handle(client(1), &rrq("nope", "netascii"), now).unwrap();
        assert_eq!(error_code(&reply), Some(ERR_ILLEGAL_OP));
        let mut wrq = rrq("nope", "octet");
        wrq[1] = OP_WRQ as u8;
        let reply = server.handle(client(1), &wrq, now).unwrap();
        assert_eq!(error_code(&reply), Some(ERR_ILLEGAL_OP));
        assert_eq!(server.active_sessions(), 0);
    }

    #[test]
    fn test_table_full_until_timeout() {
        let dir = root_with("f", &[1u8; 2000]);
        let mut server = TftpServer::new(dir.path());
        let start = Instant::now();
        for port in 1..=MAX_SESSIONS as u16 {
            assert!(server.handle(client(port), &rrq("f", "octet"), start).is_some());
        }
        assert!(server.handle(client(99), &rrq("f", "octet"), start).is_none());

        let later = start + SESSION_TIMEOUT + Duration::from_secs(1);
        assert!(server.handle(client(99), &rrq("f", "octet"), later).is_some());
        assert_eq!(server.active_sessions(), MAX_SESSIONS);
        server.expire(later + SESSION_TIMEOUT + Duration::from_secs(1));
        assert_eq!(server.active_sessions(), 0);
    }

    #[test]
    fn test_full_table_still_answers_bad_requests() {
        let dir = root_with("f", &[1u8; 2000]);
        let mut server = TftpServer::new(dir.path());
        let now = Instant::now();
        for port in 1..=MAX_SESSIONS as u16 {
            server.handle(client(port), &rrq("f", "octet"), now).unwrap();
        }
        let reply = server.handle(client(99), &rrq("../secret", "octet"), now).unwrap();
        assert_eq!(error_code(&reply), Some(ERR_ACCESS));
        let reply = server.handle(client(99), &rrq("f", "netascii"), now).unwrap();
        assert_eq!(error_code(&reply), Some(ERR_ILLEGAL_OP));
        let reply = server.handle(client(99), &rrq("absent", "octet"), now).unwrap();
        assert_eq!(error_code(&reply), Some(ERR_NOT_FOUND));
        assert_eq!(server.active_sessions(), MAX_SESSIONS);
    }

    #[test]
    fn test_client_error_ends_session() {
        let dir = root_with("f", &[1u8; 2000]);
        let mut server = TftpServer::new(dir.path());
        let now = Instant::now();
        server.handle(client(5), &rrq("f", "octet"), now).unwrap();
        let mut err = OP_ERROR.to_be_bytes().to_vec();
        err.extend_from_slice(&[0, 0, 0]);
        assert!(server.handle(client(5), &err, now).is_none());
        assert_eq!(server.active_sessions(), 0);
        assert!(server.handle(client(5), &ack(1), now).is_none());
    }
}
