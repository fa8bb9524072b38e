//! User-mode TCP/IP stack giving an emulated guest NATed network access.
//!
//! The guest's Ethernet frames are terminated here: ARP and DHCP are
//! answered locally, TCP connections and UDP flows are relayed over
//! ordinary host sockets, and replies are framed back for the guest. One
//! [`Stack`] value holds all state and is driven by [`Stack::poll`] from a
//! single thread.

pub mod arp;
pub mod config;
pub mod dhcp;
pub mod emu;
mod error;
mod host;
mod icmp;
mod ip;
mod poll;
pub mod reass;
pub mod sbuf;
pub mod socket;
mod stack;
pub mod tcp;
pub mod tftp;
mod udp;
pub mod wire;

pub use config::{NetConfig, Redirect};
pub use error::StackError;
pub use socket::SocketId;
pub use stack::{FrameSink, Stack};
