//! Readiness loop over every live host socket.

use crate::host::{self, HostSocket};
use crate::socket::{Phase, Proto, SocketId};
use crate::{Stack, StackError, tcp, udp};
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use std::os::fd::{AsFd, BorrowedFd};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Interest {
    Accept,
    Connect,
    Stream { read: bool, write: bool },
    Datagram,
}

impl Interest {
    fn flags(self) -> PollFlags {
        match self {
            Interest::Accept | Interest::Datagram => PollFlags::POLLIN,
            Interest::Connect => PollFlags::POLLOUT,
            Interest::Stream { read, write } => {
                let mut flags = PollFlags::empty();
                if read {
                    flags |= PollFlags::POLLIN;
                }
                if write {
                    flags |= PollFlags::POLLOUT;
                }
                flags
            }
        }
    }
}

impl Stack {
    /// What each socket is waiting for. Sockets with nothing to wait for
    /// are left out.
    fn interests(&self) -> Vec<(SocketId, Interest)> {
        let ids = self.sockets.tcp_ids().into_iter().chain(self.sockets.udp_ids());
        ids.filter_map(|id| {
            let so = self.sockets.get(id)?;
            if so.host.as_fd().is_none() {
                return None;
            }
            let interest = match (so.proto, so.state.phase) {
                (Proto::Tcp, Phase::Listening) => Interest::Accept,
                (Proto::Tcp, Phase::Connecting) => Interest::Connect,
                (Proto::Tcp, Phase::Connected) => {
                    let read = so.state.can_receive_from_host() && so.snd.space() > 0;
                    let write = so.state.can_send_to_host() && !so.rcv.is_empty();
                    if !read && !write {
                        return None;
                    }
                    Interest::Stream { read, write }
                }
                (Proto::Udp, Phase::Connected) => Interest::Datagram,
                _ => return None,
            };
            Some((id, interest))
        })
        .collect()
    }

    /// Wait up to `timeout` for host sockets, service whatever became
    /// ready, then run due timers.
    pub fn poll(&mut self, timeout: Duration) -> Result<(), StackError> {
        self.poll_with(&[], timeout).map(|_| ())
    }

    /// Like [`Stack::poll`], also waiting for input on `extra`. Returns
    /// which of `extra` became readable.
    pub fn poll_with(
        &mut self,
        extra: &[BorrowedFd<'_>],
        timeout: Duration,
    ) -> Result<Vec<bool>, StackError> {
        let interests = self.interests();
        let (ready, extra_ready) = {
            let mut fds: Vec<PollFd<'_>> = extra
                .iter()
                .map(|fd| PollFd::new(fd.as_fd(), PollFlags::POLLIN))
                .collect();
            let mut polled = Vec::with_capacity(interests.len());
            for &(id, interest) in &interests {
                if let Some(fd) = self.sockets.get(id).and_then(|so| so.host.as_fd()) {
                    fds.push(PollFd::new(fd, interest.flags()));
                    polled.push((id, interest));
                }
            }
            let ms = timeout.as_millis().min(u16::MAX as u128) as u16;
            loop {
                match poll(&mut fds, PollTimeout::from(ms)) {
                    Ok(_) => break,
                    Err(nix::errno::Errno::EINTR) => continue,
                    Err(e) => return Err(e.into()),
                }
            }
            let revents: Vec<PollFlags> = fds
                .iter()
                .map(|fd| fd.revents().unwrap_or(PollFlags::empty()))
                .collect();
            let (extra_revents, socket_revents) = revents.split_at(extra.len());
            let extra_ready = extra_revents
                .iter()
                .map(|r| r.intersects(PollFlags::POLLIN | PollFlags::POLLHUP))
                .collect::<Vec<_>>();
            let ready = polled
                .iter()
                .zip(socket_revents.iter().copied())
                .filter(|(_, r)| !r.is_empty())
                .map(|(&(id, interest), r)| (id, interest, r))
                .collect::<Vec<_>>();
            (ready, extra_ready)
        };

        self.now = Instant::now();
        for (id, interest, revents) in ready {
            if !self.sockets.contains(id) {
                continue;
            }
            self.service(id, interest, revents);
        }
        // Segments produced while servicing go out before the timers run.
        self.flush();
        self.tick(Instant::now());
        Ok(extra_ready)
    }

    fn service(&mut self, id: SocketId, interest: Interest, revents: PollFlags) {
        let errored = revents.intersects(PollFlags::POLLERR | PollFlags::POLLHUP);
        match interest {
            Interest::Accept => tcp::accept(self, id),
            Interest::Connect => self.connect_ready(id),
            Interest::Datagram => udp::readable(self, id),
            Interest::Stream { read, write } => {
                if read && (revents.contains(PollFlags::POLLIN) || errored) {
                    self.stream_read(id);
                }
                // A socket polled only for writing hears of a dead peer
                // through the failed write.
                let writable = revents.contains(PollFlags::POLLOUT) || errored;
                if write && writable && self.sockets.contains(id) {
                    self.stream_write(id);
                }
            }
        }
    }

    fn connect_ready(&mut self, id: SocketId) {
        let Some(so) = self.sockets.get(id) else {
            return;
        };
        let err = match &so.host {
            HostSocket::Stream(stream) => host::take_connect_error(stream),
            _ => return,
        };
        match err {
            None => tcp::connect_completed(self, id),
            Some(e) => tcp::connect_failed(self, id, e),
        }
    }

    /// Host bytes for the guest.
    fn stream_read(&mut self, id: SocketId) {
        let Some(so) = self.sockets.get_mut(id) else {
            return;
        };
        let HostSocket::Stream(stream) = &mut so.host else {
            return;
        };
        match so.snd.read_from(stream) {
            Ok(0) => {
                tracing::debug!(lport = so.lport, fport = so.fport, "host closed connection");
                so.cant_rcv_more();
                tcp::sockclosed(self, id);
            }
            Ok(n) => {
                tracing::trace!(n, lport = so.lport, "host read");
                tcp::output(self, id);
            }
            Err(e) if host::would_block(&e) => {}
            Err(e) => {
                tracing::debug!(error = %e, lport = so.lport, "host read failed");
                tcp::drop_connection(self, id);
            }
        }
    }

    /// Guest bytes for the host.
    fn stream_write(&mut self, id: SocketId) {
        let Some(so) = self.sockets.get_mut(id) else {
            return;
        };
        let HostSocket::Stream(stream) = &mut so.host else {
            return;
        };
        match so.rcv.write_to(stream) {
            Ok(n) => {
                tracing::trace!(n, lport = so.lport, "host write");
                if so.state.fwdrain && so.rcv.is_empty() {
                    so.cant_send_more();
                }
                // The receive window opened.
                tcp::output(self, id);
            }
            Err(e) if host::would_block(&e) => {}
            Err(e) => {
                tracing::debug!(error = %e, lport = so.lport, "host write failed");
                tcp::drop_connection(self, id);
            }
        }
    }
}
