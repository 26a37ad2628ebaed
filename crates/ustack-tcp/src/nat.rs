//! Pairing of two conntrack entries into one translated connection.
//!
//! A [`TcpNat`] never terminates TCP itself. It follows the flags of the packets it sees to
//! pick an idle timeout, and tears down both legs when that timer fires or the flow resets.

use core::fmt;

use tracing::{debug, trace, warn};
use ustack_packet::{IpPacket, TcpFlags};

use crate::conntrack::TcpTable;
use crate::pool::PortPool;
use crate::proxy_protocol::ProxyProtocolHelper;
use crate::state::TcpState;
use crate::timer::{TimerEvent, TimerId, TimerQueue};
use crate::{Endpoint, Millis, Tuple};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NatId(pub u64);

impl fmt::Display for NatId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "nat#{}", self.0)
    }
}

/// Idle timeouts of a translated connection, in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpTimeout {
    pub syn_sent: u64,
    pub syn_recv: u64,
    pub established: u64,
    /// FIN_WAIT_1, FIN_WAIT_2 and CLOSING.
    pub fin_wait: u64,
    pub close_wait: u64,
    pub last_ack: u64,
    pub time_wait: u64,
    pub close: u64,
}

impl Default for TcpTimeout {
    fn default() -> Self {
        Self {
            syn_sent: 120,
            syn_recv: 60,
            established: 432_000,
            fin_wait: 120,
            close_wait: 60,
            last_ack: 30,
            time_wait: 120,
            close: 10,
        }
    }
}

impl TcpTimeout {
    pub fn for_state(&self, state: TcpState) -> u64 {
        match state {
            TcpState::SynSent => self.syn_sent,
            TcpState::SynReceived => self.syn_recv,
            TcpState::Established => self.established,
            TcpState::FinWait1 | TcpState::FinWait2 | TcpState::Closing => self.fin_wait,
            TcpState::CloseWait => self.close_wait,
            TcpState::LastAck => self.last_ack,
            TcpState::TimeWait => self.time_wait,
            TcpState::Closed => self.close,
        }
    }

    pub(crate) fn millis(&self, state: TcpState) -> Millis {
        self.for_state(state).saturating_mul(1000)
    }
}

/// What to do with a packet after [`TcpNat::track`] has seen it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NatVerdict {
    /// Translate the addresses and forward.
    Forward,
    /// The packet was rewritten into a reply to the server and must be sent as is.
    ReplyToServer,
    Drop,
}

/// A translated connection.
///
/// `leg1` is the client-facing tuple (remote = client, local = the address the client
/// targeted). `leg2` is the server-facing tuple (remote = server, local = the address the
/// server sees as its peer).
#[derive(Debug)]
pub struct TcpNat {
    id: NatId,
    leg1: Tuple,
    leg2: Tuple,
    pooled: Option<Endpoint>,
    release_ip_on_close: bool,
    state: TcpState,
    timeouts: TcpTimeout,
    timer: Option<TimerId>,
    destroyed: bool,
    proxy_protocol: Option<ProxyProtocolHelper>,
}

impl TcpNat {
    pub fn new(id: NatId, leg1: Tuple, leg2: Tuple, timeouts: TcpTimeout) -> Self {
        Self {
            id,
            leg1,
            leg2,
            pooled: None,
            release_ip_on_close: false,
            state: TcpState::Closed,
            timeouts,
            timer: None,
            destroyed: false,
            proxy_protocol: None,
        }
    }

    /// Records the pool address used as `leg2.local`; it is released on teardown.
    pub fn with_pooled(mut self, pooled: Endpoint) -> Self {
        self.pooled = Some(pooled);
        self.release_ip_on_close = true;
        self
    }

    pub fn with_proxy_protocol(mut self, helper: ProxyProtocolHelper) -> Self {
        self.proxy_protocol = Some(helper);
        self
    }

    /// Arms the idle timer for the current state.
    pub fn start(&mut self, timers: &mut TimerQueue<TimerEvent>, now: Millis) {
        self.set_state(self.state, timers, now);
    }

    pub fn id(&self) -> NatId {
        self.id
    }

    pub fn leg1(&self) -> Tuple {
        self.leg1
    }

    pub fn leg2(&self) -> Tuple {
        self.leg2
    }

    pub fn state(&self) -> TcpState {
        self.state
    }

    pub fn pooled(&self) -> Option<Endpoint> {
        self.pooled
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    pub fn proxy_protocol(&self) -> Option<&ProxyProtocolHelper> {
        self.proxy_protocol.as_ref()
    }

    pub fn timer(&self) -> Option<TimerId> {
        self.timer
    }

    pub fn set_state(&mut self, state: TcpState, timers: &mut TimerQueue<TimerEvent>, now: Millis) {
        if self.state != state {
            trace!(nat = %self.id, "nat state changing: {} -> {state}", self.state);
        }
        self.state = state;
        let delay = self.timeouts.millis(state);
        let rearmed = match self.timer {
            Some(id) => timers.set_timeout(id, now, delay),
            None => false,
        };
        if !rearmed {
            self.timer = Some(timers.schedule(now, delay, TimerEvent::NatExpired(self.id)));
        }
    }

    /// Pushes the idle deadline out without changing its duration.
    pub fn reset_timer(&mut self, timers: &mut TimerQueue<TimerEvent>, now: Millis) {
        if let Some(id) = self.timer {
            timers.reset(id, now);
        }
    }

    /// Runs the flow state machine for one packet of this connection.
    ///
    /// `is_backhaul` is true for packets coming from the server. With PROXY protocol enabled
    /// the packet may be rewritten in place.
    pub fn track(
        &mut self,
        packet: &mut IpPacket,
        is_backhaul: bool,
        timers: &mut TimerQueue<TimerEvent>,
        now: Millis,
    ) -> NatVerdict {
        let (syn, ack, fin, rst) = {
            let tcp = packet.tcp();
            (tcp.is_syn(), tcp.is_ack(), tcp.is_fin(), tcp.is_rst())
        };

        if rst {
            self.set_state(TcpState::Closed, timers, now);
            return NatVerdict::Forward;
        }

        match self.state {
            TcpState::Closed | TcpState::TimeWait => {
                if syn && !ack && !is_backhaul {
                    self.shift_client_syn(packet);
                    self.set_state(TcpState::SynSent, timers, now);
                } else {
                    self.reset_timer(timers, now);
                }
            }
            TcpState::SynSent => {
                let sent = self.proxy_protocol.as_ref().map(|h| h.sent);
                match (is_backhaul, sent) {
                    (true, Some(false)) if syn && ack => {
                        self.reset_timer(timers, now);
                        self.inject_header(packet);
                        return NatVerdict::ReplyToServer;
                    }
                    (true, Some(true)) if ack && !syn => {
                        to_syn_ack(packet);
                        self.set_state(TcpState::SynReceived, timers, now);
                    }
                    (true, Some(_)) => {
                        debug!(nat = %self.id, "dropping server packet while the PROXY header is pending");
                        return NatVerdict::Drop;
                    }
                    (true, None) if syn && ack => {
                        self.set_state(TcpState::SynReceived, timers, now);
                    }
                    (false, Some(_)) => {
                        if !(syn && !ack) {
                            return NatVerdict::Drop;
                        }
                        self.shift_client_syn(packet);
                        self.reset_timer(timers, now);
                    }
                    _ => self.reset_timer(timers, now),
                }
            }
            TcpState::SynReceived => {
                if !is_backhaul && ack && !syn {
                    self.proxy_protocol = None;
                    self.set_state(TcpState::Established, timers, now);
                } else {
                    if is_backhaul && self.proxy_protocol.is_some() && ack && !syn {
                        to_syn_ack(packet);
                    }
                    self.reset_timer(timers, now);
                }
            }
            TcpState::Established if fin => {
                let next = if is_backhaul {
                    TcpState::CloseWait
                } else {
                    TcpState::FinWait1
                };
                self.set_state(next, timers, now);
            }
            TcpState::FinWait1 if is_backhaul && ack => {
                let next = if fin {
                    TcpState::TimeWait
                } else {
                    TcpState::FinWait2
                };
                self.set_state(next, timers, now);
            }
            TcpState::FinWait2 if is_backhaul && fin => {
                self.set_state(TcpState::TimeWait, timers, now);
            }
            TcpState::CloseWait if !is_backhaul && fin => {
                let next = if ack {
                    TcpState::TimeWait
                } else {
                    TcpState::Closing
                };
                self.set_state(next, timers, now);
            }
            TcpState::Closing if ack => {
                self.set_state(TcpState::TimeWait, timers, now);
            }
            _ => self.reset_timer(timers, now),
        }
        NatVerdict::Forward
    }

    /// Moves the client's SYN back by the PROXY header length so the header fits in front
    /// of the client's first byte.
    fn shift_client_syn(&self, packet: &mut IpPacket) {
        if let Some(helper) = &self.proxy_protocol {
            let len = helper.v2_header_len() as u32;
            let tcp = packet.tcp_mut();
            tcp.seq_number = tcp.seq_number.wrapping_sub(len);
        }
    }

    /// Turns the server's SYN-ACK into the header-carrying segment that completes the
    /// server-side handshake.
    fn inject_header(&mut self, packet: &mut IpPacket) {
        let helper = match self.proxy_protocol.as_mut() {
            Some(helper) => helper,
            None => return,
        };
        packet.swap_src_dst();
        packet.set_hop_limit(u8::MAX);
        let tcp = packet.tcp_mut();
        let (seq, ack) = (tcp.seq_number, tcp.ack_number);
        tcp.seq_number = ack;
        tcp.ack_number = seq.wrapping_add(1);
        tcp.flags = TcpFlags::PSH | TcpFlags::ACK;
        tcp.options.clear();
        tcp.payload = helper.build_v2_header();
        helper.sent = true;
        debug!(nat = %self.id, len = tcp.payload.len(), "sending PROXY protocol header to server");
    }

    /// Removes both legs and returns the pooled address. Only the first call has any effect.
    ///
    /// Returns `false` if the connection was already destroyed.
    pub fn destroy(
        &mut self,
        table: &mut TcpTable,
        timers: &mut TimerQueue<TimerEvent>,
        pool: &mut PortPool,
    ) -> bool {
        if self.destroyed {
            return false;
        }
        self.destroyed = true;
        trace!(nat = %self.id, leg1 = %self.leg1, leg2 = %self.leg2, "destroying nat");

        if let Some(id) = self.timer.take() {
            timers.cancel(id);
        }
        for tuple in [self.leg1, self.leg2] {
            match table.remove(tuple) {
                Some(mut entry) if entry.nat() == Some(self.id) => entry.destroy(timers),
                Some(entry) => {
                    warn!(nat = %self.id, %tuple, "leg is owned by another connection, keeping it");
                    table.insert(entry);
                }
                None => {}
            }
        }
        if self.release_ip_on_close {
            if let Some(pooled) = self.pooled {
                pool.release(pooled);
            }
        }
        true
    }
}

/// Rewrites the server's ACK of the PROXY header into the SYN-ACK the client is waiting for.
fn to_syn_ack(packet: &mut IpPacket) {
    let tcp = packet.tcp_mut();
    tcp.flags = TcpFlags::SYN | TcpFlags::ACK;
    tcp.seq_number = tcp.seq_number.wrapping_sub(1);
}
