//! Real host sockets behind virtual flows.

use nix::errno::Errno;
use nix::fcntl::{FcntlArg, OFlag, fcntl};
use nix::sys::socket::{
    AddressFamily, SockFlag, SockType, SockaddrIn, connect, getsockopt, socket, sockopt,
};
use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, TcpListener, TcpStream, UdpSocket};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};

#[derive(Debug, Default)]
pub enum HostSocket {
    /// No host descriptor: not yet opened, or both directions shut.
    #[default]
    None,
    Stream(TcpStream),
    Listener(TcpListener),
    Datagram(UdpSocket),
}

impl HostSocket {
    pub fn as_fd(&self) -> Option<BorrowedFd<'_>> {
        match self {
            HostSocket::None => None,
            HostSocket::Stream(s) => Some(s.as_fd()),
            HostSocket::Listener(l) => Some(l.as_fd()),
            HostSocket::Datagram(d) => Some(d.as_fd()),
        }
    }

    pub fn local_port(&self) -> Option<u16> {
        let addr = match self {
            HostSocket::None => return None,
            HostSocket::Stream(s) => s.local_addr(),
            HostSocket::Listener(l) => l.local_addr(),
            HostSocket::Datagram(d) => d.local_addr(),
        };
        addr.ok().map(|a| a.port())
    }

    pub fn stream(&mut self) -> Option<&mut TcpStream> {
        match self {
            HostSocket::Stream(s) => Some(s),
            _ => None,
        }
    }

    pub fn datagram(&self) -> Option<&UdpSocket> {
        match self {
            HostSocket::Datagram(d) => Some(d),
            _ => None,
        }
    }
}

fn set_nonblocking(fd: &OwnedFd) -> Result<(), Errno> {
    let flags = OFlag::from_bits_truncate(fcntl(fd.as_raw_fd(), FcntlArg::F_GETFL)?);
    fcntl(fd.as_raw_fd(), FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK))?;
    Ok(())
}

/// Start a non-blocking connect. `Ok` means the connect is in progress (or
/// already done); completion is reported by writability and
/// [`take_connect_error`].
pub fn connect_nonblocking(addr: SocketAddrV4) -> io::Result<TcpStream> {
    let fd = socket(
        AddressFamily::Inet,
        SockType::Stream,
        SockFlag::empty(),
        None,
    )?;
    set_nonblocking(&fd)?;
    match connect(fd.as_raw_fd(), &SockaddrIn::from(addr)) {
        Ok(()) | Err(Errno::EINPROGRESS) | Err(Errno::EAGAIN) => {}
        Err(e) => return Err(e.into()),
    }
    let stream = TcpStream::from(fd);
    let _ = stream.set_nodelay(true);
    Ok(stream)
}

/// Pending error of a socket whose connect finished.
pub fn take_connect_error(stream: &TcpStream) -> Option<io::Error> {
    match getsockopt(stream, sockopt::SocketError) {
        Ok(0) => None,
        Ok(errno) => Some(io::Error::from_raw_os_error(errno)),
        Err(e) => Some(e.into()),
    }
}

pub fn listen_tcp(port: u16) -> io::Result<TcpListener> {
    let listener = TcpListener::bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port))?;
    listener.set_nonblocking(true)?;
    Ok(listener)
}

pub fn bind_udp(port: u16) -> io::Result<UdpSocket> {
    let socket = UdpSocket::bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port))?;
    socket.set_nonblocking(true)?;
    Ok(socket)
}

pub fn v4(addr: SocketAddr) -> Option<SocketAddrV4> {
    match addr {
        SocketAddr::V4(a) => Some(a),
        SocketAddr::V6(a) => a
            .ip()
            .to_ipv4_mapped()
            .map(|ip| SocketAddrV4::new(ip, a.port())),
    }
}

pub fn would_block(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}
