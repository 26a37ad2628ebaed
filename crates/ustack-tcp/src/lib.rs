#![forbid(unsafe_code)]

//! User-space TCP connection tracking and NAT.
//!
//! [`TcpStack`] consumes parsed [`ustack_packet::IpPacket`]s and returns [`Action`]s: packets to
//! emit, translated packets to forward, and notifications for the connection owner. It never
//! runs an event loop; the host feeds it packets, application calls and the current time, and
//! drives [`TcpStack::poll_timers`] from [`TcpStack::next_deadline`].

pub mod config;
pub mod conntrack;
pub mod entry;
pub mod error;
pub mod listen;
pub mod nat;
pub mod pool;
pub mod proxy_protocol;
pub mod receiving;
pub mod segment;
pub mod sending;
pub mod seq;
pub mod stack;
pub mod state;
pub mod tcp_utils;
pub mod timer;

pub use config::{ConfigError, StackConfig};
pub use conntrack::{Conntrack, TcpTable};
pub use entry::{ConnEvent, HandlerId, Owner, TcpEntry};
pub use error::TcpError;
pub use listen::TcpListenEntry;
pub use nat::{NatId, NatVerdict, TcpNat, TcpTimeout};
pub use pool::PortPool;
pub use proxy_protocol::ProxyProtocolHelper;
pub use receiving::ReceivingQueue;
pub use segment::Segment;
pub use sending::SendingQueue;
pub use stack::{Action, NatRule, TcpStack};
pub use state::TcpState;
pub use timer::{TimerEvent, TimerId, TimerQueue};

use core::fmt;
use core::net::SocketAddr;

pub type Millis = u64;

pub type Endpoint = SocketAddr;

/// Key of a tracked connection as seen from the local side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Tuple {
    pub remote: Endpoint,
    pub local: Endpoint,
}

impl Tuple {
    pub fn new(remote: Endpoint, local: Endpoint) -> Self {
        Self { remote, local }
    }
}

impl fmt::Display for Tuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}->{}", self.remote, self.local)
    }
}

pub const WMEM_MAX: usize = 212_992;
pub const RMEM_MAX: usize = 212_992;
pub const SND_DEFAULT_MSS: usize = 1360;
pub const RCV_MSS: u16 = 1360;
/// Multiplier applied to our advertised receive window (shift 6).
pub const RCV_WINDOW_SCALE: usize = 64;
pub const TCP_SEQ_INIT_MIN: u64 = (i32::MAX / 3) as u64;
pub const TCP_SEQ_RAND: u64 = (i32::MAX / 2) as u64;
pub const RTO_MIN: Millis = 200;
pub const RTO_MAX: Millis = 120_000;
pub const DELAYED_ACK_TIMEOUT: Millis = 20;
pub const MAX_REMOTE_WINDOW_MSS_DUP: usize = 45;
pub const MAX_RETRANSMISSION_AFTER_CLOSING: u32 = 7;
pub const MAX_SYN_BACKLOG_SIZE: usize = 128;
pub const MAX_BACKLOG_SIZE: usize = 128;
