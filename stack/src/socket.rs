//! Virtual sockets: one per NATed TCP or UDP flow.
//!
//! Every live [`VirtualSocket`] sits in exactly one of the table's two
//! lists. Handles are generational so a closed flow's id never aliases a new
//! one.

use crate::StackError;
use crate::host::HostSocket;
use crate::sbuf::SBuf;
use crate::tcp::Tcb;
use std::net::{Ipv4Addr, Shutdown};
use std::time::Instant;
use usernet_mbuf::MbufId;

/// Default size of each direction's ring.
pub const SOCKET_BUFFER: usize = 8192;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SocketId {
    index: u32,
    generation: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Proto {
    Tcp,
    Udp,
}

/// Host side of the flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// No usable host descriptor.
    NoFd,
    /// Non-blocking connect in flight.
    Connecting,
    Connected,
    /// Waiting for connections from the outside.
    Listening,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SockState {
    pub phase: Phase,
    /// The host stopped sending to us.
    pub cant_rcv_more: bool,
    /// We stopped sending to the host.
    pub cant_send_more: bool,
    /// Shut the host write side once the ring drains.
    pub fwdrain: bool,
    /// Listener that turns into the flow itself on first accept.
    pub accept_once: bool,
}

impl SockState {
    fn new(phase: Phase) -> Self {
        Self {
            phase,
            cant_rcv_more: false,
            cant_send_more: false,
            fwdrain: false,
            accept_once: false,
        }
    }

    /// Host data may still arrive.
    pub fn can_receive_from_host(&self) -> bool {
        self.phase == Phase::Connected && !self.cant_rcv_more
    }

    /// Data may still be written to the host.
    pub fn can_send_to_host(&self) -> bool {
        self.phase == Phase::Connected && !self.cant_send_more
    }
}

#[derive(Debug)]
pub struct VirtualSocket {
    pub proto: Proto,
    pub host: HostSocket,
    /// Guest side of the flow.
    pub laddr: Ipv4Addr,
    pub lport: u16,
    /// Peer the guest is talking to, as the guest sees it.
    pub faddr: Ipv4Addr,
    pub fport: u16,
    pub state: SockState,
    pub tos: u8,
    /// Bytes heading to the guest.
    pub snd: SBuf,
    /// Bytes heading to the host.
    pub rcv: SBuf,
    /// UDP idle deadline; `None` never expires.
    pub expire: Option<Instant>,
    pub tcb: Option<Box<Tcb>>,
    /// Last guest datagram (or SYN), kept to quote in ICMP errors.
    pub saved: Option<MbufId>,
    /// UDP probe standing in for a guest ICMP echo request.
    pub icmp_relay: bool,
}

impl VirtualSocket {
    pub fn new_tcp(laddr: Ipv4Addr, lport: u16, faddr: Ipv4Addr, fport: u16) -> Self {
        Self::new(Proto::Tcp, laddr, lport, faddr, fport)
    }

    pub fn new_udp(laddr: Ipv4Addr, lport: u16, faddr: Ipv4Addr, fport: u16) -> Self {
        Self::new(Proto::Udp, laddr, lport, faddr, fport)
    }

    fn new(proto: Proto, laddr: Ipv4Addr, lport: u16, faddr: Ipv4Addr, fport: u16) -> Self {
        Self {
            proto,
            host: HostSocket::None,
            laddr,
            lport,
            faddr,
            fport,
            state: SockState::new(Phase::NoFd),
            tos: 0,
            snd: SBuf::new(SOCKET_BUFFER),
            rcv: SBuf::new(SOCKET_BUFFER),
            expire: None,
            tcb: None,
            saved: None,
            icmp_relay: false,
        }
    }

    pub fn tcb(&self) -> Option<&Tcb> {
        self.tcb.as_deref()
    }

    pub fn tcb_mut(&mut self) -> Option<&mut Tcb> {
        self.tcb.as_deref_mut()
    }

    /// Room left for guest bytes, counting those an emulation holds back.
    pub fn rcv_space(&self) -> usize {
        let held = self.tcb().map_or(0, |tp| tp.emu.held());
        self.rcv.space().saturating_sub(held)
    }

    /// The host finished sending to us.
    pub fn cant_rcv_more(&mut self) {
        if let Some(s) = self.host.stream() {
            let _ = s.shutdown(Shutdown::Read);
        }
        self.state.fwdrain = false;
        if self.state.cant_send_more {
            self.disconnected();
        } else {
            self.state.cant_rcv_more = true;
        }
    }

    /// We are done writing to the host.
    pub fn cant_send_more(&mut self) {
        if let Some(s) = self.host.stream() {
            let _ = s.shutdown(Shutdown::Write);
        }
        self.state.fwdrain = false;
        if self.state.cant_rcv_more {
            self.disconnected();
        } else {
            self.state.cant_send_more = true;
        }
    }

    /// Guest finished sending: shut the host write side now, or after the
    /// ring has drained.
    pub fn fwdrain(&mut self) {
        if self.rcv.is_empty() {
            self.cant_send_more();
        } else {
            self.state.fwdrain = true;
        }
    }

    /// Both directions of the host side are done; release the descriptor.
    pub fn disconnected(&mut self) {
        if let Some(s) = self.host.stream() {
            let _ = s.shutdown(Shutdown::Both);
        }
        self.host = HostSocket::None;
        self.state.phase = Phase::NoFd;
        self.state.cant_rcv_more = true;
        self.state.cant_send_more = true;
        self.state.fwdrain = false;
    }

    pub fn set_phase(&mut self, phase: Phase) {
        self.state.phase = phase;
    }

    pub fn set_accept_once(&mut self, accept_once: bool) {
        self.state.accept_once = accept_once;
    }
}

#[derive(Debug)]
struct Slot {
    generation: u32,
    socket: Option<VirtualSocket>,
}

/// All virtual sockets of one stack instance.
#[derive(Debug)]
pub struct SocketTable {
    slots: Vec<Slot>,
    vacant: Vec<u32>,
    tcp: Vec<SocketId>,
    udp: Vec<SocketId>,
    max: usize,
}

impl SocketTable {
    pub fn new(max: usize) -> Self {
        Self {
            slots: Vec::new(),
            vacant: Vec::new(),
            tcp: Vec::new(),
            udp: Vec::new(),
            max,
        }
    }

    pub fn insert(&mut self, socket: VirtualSocket) -> Result<SocketId, StackError> {
        if self.len() >= self.max {
            return Err(StackError::SocketTableFull(self.max));
        }
        let proto = socket.proto;
        let id = match self.vacant.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                slot.socket = Some(socket);
                SocketId {
                    index,
                    generation: slot.generation,
                }
            }
            None => {
                let index = self.slots.len() as u32;
                self.slots.push(Slot {
                    generation: 0,
                    socket: Some(socket),
                });
                SocketId {
                    index,
                    generation: 0,
                }
            }
        };
        match proto {
            Proto::Tcp => self.tcp.push(id),
            Proto::Udp => self.udp.push(id),
        }
        Ok(id)
    }

    /// Unlink a socket from its list and hand it back.
    pub fn remove(&mut self, id: SocketId) -> Option<VirtualSocket> {
        let slot = self
            .slots
            .get_mut(id.index as usize)
            .filter(|s| s.generation == id.generation)?;
        let socket = slot.socket.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.vacant.push(id.index);
        let list = match socket.proto {
            Proto::Tcp => &mut self.tcp,
            Proto::Udp => &mut self.udp,
        };
        list.retain(|&s| s != id);
        Some(socket)
    }

    pub fn get(&self, id: SocketId) -> Option<&VirtualSocket> {
        self.slots
            .get(id.index as usize)
            .filter(|s| s.generation == id.generation)
            .and_then(|s| s.socket.as_ref())
    }

    pub fn get_mut(&mut self, id: SocketId) -> Option<&mut VirtualSocket> {
        self.slots
            .get_mut(id.index as usize)
            .filter(|s| s.generation == id.generation)
            .and_then(|s| s.socket.as_mut())
    }

    pub fn contains(&self, id: SocketId) -> bool {
        self.get(id).is_some()
    }

    /// Which list a socket is on, if any.
    pub fn membership(&self, id: SocketId) -> Option<Proto> {
        let in_tcp = self.tcp.contains(&id);
        let in_udp = self.udp.contains(&id);
        match (in_tcp, in_udp) {
            (true, false) => Some(Proto::Tcp),
            (false, true) => Some(Proto::Udp),
            _ => None,
        }
    }

    /// Snapshot of the TCP list, safe to iterate while mutating the table.
    pub fn tcp_ids(&self) -> Vec<SocketId> {
        self.tcp.clone()
    }

    pub fn udp_ids(&self) -> Vec<SocketId> {
        self.udp.clone()
    }

    pub fn tcp_count(&self) -> usize {
        self.tcp.len()
    }

    pub fn udp_count(&self) -> usize {
        self.udp.len()
    }

    pub fn len(&self) -> usize {
        self.tcp.len() + self.udp.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Established or pending TCP flow for a guest segment. Listeners never
    /// match.
    pub fn find_tcp(
        &self,
        laddr: Ipv4Addr,
        lport: u16,
        faddr: Ipv4Addr,
        fport: u16,
    ) -> Option<SocketId> {
        self.tcp.iter().copied().find(|&id| {
            self.get(id).is_some_and(|s| {
                s.state.phase != Phase::Listening
                    && s.lport == lport
                    && s.fport == fport
                    && s.laddr == laddr
                    && s.faddr == faddr
            })
        })
    }

    /// UDP flow owning a guest endpoint.
    pub fn find_udp(&self, laddr: Ipv4Addr, lport: u16) -> Option<SocketId> {
        self.udp.iter().copied().find(|&id| {
            self.get(id)
                .is_some_and(|s| s.lport == lport && s.laddr == laddr)
        })
    }
}
