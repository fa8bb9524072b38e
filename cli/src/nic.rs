//! Unix datagram "NIC": one Ethernet frame per datagram, vfkit style.

use std::io;
use std::os::fd::{AsFd, AsRawFd};
use std::os::unix::net::UnixDatagram;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;
use usernet_stack::{NetConfig, Stack, StackError};

const VFKIT_MAGIC: [u8; 4] = *b"VFKT";
const SOCKET_BUFFER: libc::c_int = 128 * 1024 * 1024;
const MAX_FRAME: usize = 65535;

#[derive(Error, Debug)]
pub enum NicError {
    #[error("nic socket {path}: {source}")]
    Socket { path: PathBuf, source: io::Error },

    #[error("nic io: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Stack(#[from] StackError),
}

/// The bound socket. Removes its path when dropped.
pub struct Nic {
    socket: UnixDatagram,
    path: PathBuf,
}

impl Nic {
    pub fn bind(path: &Path) -> Result<Self, NicError> {
        let _ = std::fs::remove_file(path);
        let socket = UnixDatagram::bind(path).map_err(|source| NicError::Socket {
            path: path.to_path_buf(),
            source,
        })?;
        set_buffer_sizes(&socket);
        tracing::info!(path = %path.display(), "nic socket bound");
        Ok(Self {
            socket,
            path: path.to_path_buf(),
        })
    }

    /// Block until the emulator says hello, then connect back to it.
    /// Returns false if shutdown was requested first.
    pub fn wait_for_peer(&self, shutdown: &AtomicBool) -> Result<bool, NicError> {
        self.socket
            .set_read_timeout(Some(Duration::from_millis(200)))?;
        let mut buf = [0u8; MAX_FRAME];
        while !shutdown.load(Ordering::Relaxed) {
            let (n, peer) = match self.socket.recv_from(&mut buf) {
                Ok(r) => r,
                Err(e) if is_retry(&e) => continue,
                Err(e) => return Err(e.into()),
            };
            if n < VFKIT_MAGIC.len() || buf[..4] != VFKIT_MAGIC {
                tracing::debug!(n, "ignoring datagram before hello");
                continue;
            }
            let Some(peer_path) = peer.as_pathname() else {
                tracing::warn!("hello from an unnamed socket, cannot reply");
                continue;
            };
            self.socket.connect(peer_path)?;
            tracing::info!(peer = %peer_path.display(), "guest connected");
            self.socket.set_read_timeout(None)?;
            self.socket.set_nonblocking(true)?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Shuttle frames between the peer and a fresh stack until shutdown.
    pub fn run(&self, config: NetConfig, shutdown: &AtomicBool) -> Result<(), NicError> {
        let tx = self.socket.try_clone()?;
        let sink = move |frame: &[u8]| {
            if let Err(e) = tx.send(frame) {
                // The guest retransmits whatever mattered.
                tracing::trace!(error = %e, len = frame.len(), "frame to guest dropped");
            }
        };
        let mut stack = Stack::new(config, sink)?;
        let mut buf = vec![0u8; MAX_FRAME];

        while !shutdown.load(Ordering::Relaxed) {
            let timeout = stack.poll_timeout(Instant::now());
            let ready = stack.poll_with(&[self.socket.as_fd()], timeout)?;
            if !ready.first().copied().unwrap_or(false) {
                continue;
            }
            loop {
                match self.socket.recv(&mut buf) {
                    Ok(n) => stack.deliver_frame(&buf[..n]),
                    Err(e) if is_retry(&e) => break,
                    Err(e) if e.kind() == io::ErrorKind::ConnectionRefused => {
                        tracing::info!("guest went away");
                        return Ok(());
                    }
                    Err(e) => return Err(e.into()),
                }
            }
        }
        tracing::debug!(
            tcp = stack.tcp_sockets(),
            udp = stack.udp_sockets(),
            "nic loop stopped"
        );
        Ok(())
    }
}

impl Drop for Nic {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Bursts from the guest overrun the default buffers; ask for plenty and let
/// the kernel cap it.
fn set_buffer_sizes(socket: &UnixDatagram) {
    for option in [libc::SO_RCVBUF, libc::SO_SNDBUF] {
        let rc = unsafe {
            libc::setsockopt(
                socket.as_raw_fd(),
                libc::SOL_SOCKET,
                option,
                &SOCKET_BUFFER as *const _ as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if rc != 0 {
            tracing::debug!(error = %io::Error::last_os_error(), option, "setsockopt failed");
        }
    }
}

fn is_retry(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_handshake_connects_back() {
        let dir = tempfile::tempdir().unwrap();
        let nic = Nic::bind(&dir.path().join("net.sock")).unwrap();
        let guest_path = dir.path().join("guest.sock");
        let guest = UnixDatagram::bind(&guest_path).unwrap();
        guest.send_to(b"junk", dir.path().join("net.sock")).unwrap();
        guest.send_to(&VFKIT_MAGIC, dir.path().join("net.sock")).unwrap();

        let shutdown = AtomicBool::new(false);
        assert!(nic.wait_for_peer(&shutdown).unwrap());
        nic.socket.send(b"frame").unwrap();
        let mut buf = [0u8; 16];
        let n = guest.recv(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"frame");
    }

    #[test]
    fn test_shutdown_before_hello() {
        let dir = tempfile::tempdir().unwrap();
        let nic = Nic::bind(&dir.path().join("net.sock")).unwrap();
        let shutdown = Arc::new(AtomicBool::new(false));
        let flag = shutdown.clone();
        let waiter = thread::spawn(move || nic.wait_for_peer(&flag).unwrap());
        shutdown.store(true, Ordering::Relaxed);
        assert!(!waiter.join().unwrap());
    }

    #[test]
    fn test_socket_path_removed_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("net.sock");
        drop(Nic::bind(&path).unwrap());
        assert!(!path.exists());
    }
}
