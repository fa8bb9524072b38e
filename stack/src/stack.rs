//! The stack instance and its entry points.

use crate::config::NetConfig;
use crate::reass::Reassembly;
use crate::socket::{SocketId, SocketTable};
use crate::tcp::{self, FAST_TICK_MS, SLOW_TICK_MS};
use crate::tftp::TftpServer;
use crate::wire::{BROADCAST_MAC, ETH_HLEN, ETHERTYPE_ARP, ETHERTYPE_IPV4, build_eth_header};
use crate::{StackError, arp, ip, udp};
use std::collections::VecDeque;
use std::net::Ipv4Addr;
use std::time::{Duration, Instant};
use usernet_mbuf::{MbufId, MbufPool};

/// Consumer of frames heading to the guest: the emulated NIC.
pub trait FrameSink {
    fn emit_frame(&mut self, frame: &[u8]);
}

impl<F: FnMut(&[u8])> FrameSink for F {
    fn emit_frame(&mut self, frame: &[u8]) {
        self(frame)
    }
}

pub(crate) const FAST_TICK: Duration = Duration::from_millis(FAST_TICK_MS);
pub(crate) const SLOW_TICK: Duration = Duration::from_millis(SLOW_TICK_MS);

/// One user-mode network: a guest, its virtual gateway, and every NATed
/// flow. All state lives here and is only touched from the thread that
/// drives [`Stack::poll`].
pub struct Stack {
    pub(crate) config: NetConfig,
    pub(crate) pool: MbufPool,
    pub(crate) sockets: SocketTable,
    pub(crate) ipq: Reassembly,
    pub(crate) tftp: TftpServer,
    pub(crate) tcp_iss: u32,
    pub(crate) ip_id: u16,
    pub(crate) guest_mac: Option<[u8; 6]>,
    /// IP packets waiting to be framed for the guest.
    pub(crate) outbound: VecDeque<MbufId>,
    /// Time of the current cycle.
    pub(crate) now: Instant,
    next_fast: Instant,
    next_slow: Instant,
    sink: Box<dyn FrameSink + Send>,
}

impl Stack {
    /// Build a stack and open the configured redirects.
    pub fn new(config: NetConfig, sink: impl FrameSink + Send + 'static) -> Result<Self, StackError> {
        config.validate()?;
        let now = Instant::now();
        let redirects = config.redirects.clone();
        let mut stack = Self {
            pool: MbufPool::new(config.mbuf_high_water, config.mbuf_limit),
            sockets: SocketTable::new(config.max_sockets),
            ipq: Reassembly::new(config.max_reassembly_queues),
            tftp: TftpServer::new(config.tftp_root.clone()),
            tcp_iss: 1,
            ip_id: 0,
            guest_mac: None,
            outbound: VecDeque::new(),
            now,
            next_fast: now + FAST_TICK,
            next_slow: now + SLOW_TICK,
            sink: Box::new(sink),
            config,
        };
        for r in redirects {
            let guest = r.guest_addr.unwrap_or(stack.config.guest_addr);
            stack.add_redirect(r.udp, r.host_port, guest, r.guest_port)?;
        }
        tracing::info!(
            network = %stack.config.network,
            guest = %stack.config.guest_addr,
            alias = %stack.config.alias_addr,
            "network stack ready"
        );
        Ok(stack)
    }

    pub fn config(&self) -> &NetConfig {
        &self.config
    }

    /// Forward connections (or datagrams) arriving on host port `host_port`
    /// to `guest_addr:guest_port`. Port 0 picks a free port.
    pub fn add_redirect(
        &mut self,
        udp: bool,
        host_port: u16,
        guest_addr: Ipv4Addr,
        guest_port: u16,
    ) -> Result<SocketId, StackError> {
        let result = if udp {
            udp::listen(self, host_port, guest_addr, guest_port, false)
        } else {
            tcp::listen(self, host_port, guest_addr, guest_port, false)
        };
        result.map_err(|e| {
            StackError::Redirect(format!(
                "{} {} -> {}:{}: {}",
                if udp { "udp" } else { "tcp" },
                host_port,
                guest_addr,
                guest_port,
                e
            ))
        })
    }

    /// Host port a redirect ended up on.
    pub fn redirect_port(&self, id: SocketId) -> Option<u16> {
        self.sockets.get(id).and_then(|so| so.host.local_port())
    }

    /// Take an Ethernet frame from the guest.
    pub fn deliver_frame(&mut self, frame: &[u8]) {
        if frame.len() < ETH_HLEN {
            return;
        }
        let src_mac = &frame[6..12];
        // Unicast source only.
        if src_mac[0] & 1 == 0 {
            let mut mac = [0u8; 6];
            mac.copy_from_slice(src_mac);
            self.guest_mac = Some(mac);
        }
        let payload = &frame[ETH_HLEN..];
        match u16::from_be_bytes([frame[12], frame[13]]) {
            ETHERTYPE_ARP => {
                let ours = [self.config.alias_addr, self.config.dns_alias];
                if let Some(reply) = arp::handle(payload, src_mac, &ours) {
                    self.sink.emit_frame(&reply);
                }
            }
            ETHERTYPE_IPV4 => self.deliver_ip(payload),
            ethertype => tracing::trace!(ethertype, "ignoring frame"),
        }
    }

    /// Take a bare IP datagram from the guest.
    pub fn deliver_ip(&mut self, packet: &[u8]) {
        self.now = Instant::now();
        match self.pool.allocate_from(packet) {
            Ok(m) => ip::input(self, m),
            Err(e) => tracing::debug!(error = %e, "dropping guest datagram"),
        }
        self.flush();
    }

    /// Frame every queued packet and hand it to the sink.
    pub(crate) fn flush(&mut self) {
        while let Some(m) = self.outbound.pop_front() {
            let Some(mbuf) = self.pool.get_mut(m) else {
                continue;
            };
            let data = mbuf.data();
            let broadcast = data.len() >= 20 && data[16..20] == [0xff; 4];
            let dst = match self.guest_mac {
                Some(mac) if !broadcast => mac,
                _ => BROADCAST_MAC,
            };
            let header = build_eth_header(&dst, &arp::GATEWAY_MAC, ETHERTYPE_IPV4);
            mbuf.prepend(ETH_HLEN).copy_from_slice(&header);
            self.sink.emit_frame(mbuf.data());
            let _ = self.pool.free(m);
        }
    }

    /// Run whatever timers are due at `now`, then flush.
    pub fn tick(&mut self, now: Instant) {
        self.now = now;
        if now >= self.next_fast {
            if tcp::ack_pending(self) {
                tcp::fasttimo(self);
            }
            self.next_fast = now + FAST_TICK;
        }
        if now >= self.next_slow {
            tcp::slowtimo(self);
            self.ipq.slowtimo(&mut self.pool);
            self.tftp.expire(now);
            self.next_slow += SLOW_TICK;
            if self.next_slow <= now {
                self.next_slow = now + SLOW_TICK;
            }
        }
        udp::expire(self, now);
        self.flush();
    }

    /// How long the next readiness wait may block.
    pub fn poll_timeout(&self, now: Instant) -> Duration {
        let mut deadline = self.next_slow;
        if tcp::ack_pending(self) {
            deadline = deadline.min(self.next_fast);
        }
        deadline
            .saturating_duration_since(now)
            .max(Duration::from_millis(1))
    }

    pub fn tcp_sockets(&self) -> usize {
        self.sockets.tcp_count()
    }

    pub fn udp_sockets(&self) -> usize {
        self.sockets.udp_count()
    }

    /// Packet buffers currently held by the stack.
    pub fn live_buffers(&self) -> usize {
        self.pool.live()
    }

    pub fn reassembly_queues(&self) -> usize {
        self.ipq.len()
    }

    pub fn tftp_sessions(&self) -> usize {
        self.tftp.active_sessions()
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        self.ipq.clear(&mut self.pool);
        tracing::debug!(sockets = self.sockets.len(), "network stack shut down");
    }
}
