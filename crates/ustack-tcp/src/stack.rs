use tracing::{debug, trace, warn};
use ustack_packet::{IpPacket, PacketError, TcpFlags, TcpPacket};

use crate::config::StackConfig;
use crate::conntrack::Conntrack;
use crate::entry::{ConnEvent, HandlerId, Owner, TcpEntry};
use crate::error::TcpError;
use crate::listen::TcpListenEntry;
use crate::nat::{NatId, NatVerdict, TcpNat};
use crate::pool::PortPool;
use crate::proxy_protocol::ProxyProtocolHelper;
use crate::segment::Segment;
use crate::state::TcpState;
use crate::tcp_utils::{
    build_ack_response, build_common_tcp_response, build_ip_response, build_rst_for,
    build_rst_response, build_syn_ack,
};
use crate::timer::{TimerEvent, TimerQueue};
use crate::{
    seq, Endpoint, Millis, Tuple, DELAYED_ACK_TIMEOUT, MAX_RETRANSMISSION_AFTER_CLOSING, RTO_MAX,
    RTO_MIN, SND_DEFAULT_MSS,
};

/// Largest window scale shift allowed by RFC 7323.
const MAX_WINDOW_SCALE_SHIFT: u8 = 14;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// A packet generated for a locally terminated connection (or a reset for an unknown one).
    Emit(IpPacket),
    /// A translated packet, to be routed to its new destination.
    Forward(IpPacket),
    /// A listener has a completed connection waiting in its accept backlog.
    ListenReadable { listening: Endpoint },
    Readable { tuple: Tuple },
    /// Send buffer space was released.
    Writable { tuple: Tuple },
    Destroyed { tuple: Tuple },
}

/// How a packet is translated when it starts a new NAT connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NatRule {
    /// Rewrite the destination, keep the client address as source.
    Dnat { dst: Endpoint },
    /// Keep the destination, take the source from the pool.
    Snat,
    /// Rewrite the destination and take the source from the pool.
    Fnat { dst: Endpoint },
    /// Rewrite both ends to fixed endpoints.
    Fixed { src: Endpoint, dst: Endpoint },
}

/// What a call to `transmit` may put on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flight {
    /// Bytes not sent yet; an armed retransmission timer keeps running.
    New,
    /// The peer acknowledged new data: send what the window now allows and restart the timer.
    Acked,
    /// The retransmission timer fired: rebuild the flight from the oldest unacknowledged byte.
    Retransmit { last_begin_seq: u64, count: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Disposition {
    Keep,
    Destroy,
}

/// Single-threaded TCP engine: terminates connections for listeners and translates NAT
/// flows. Every entry point returns the [`Action`]s the host has to carry out.
#[derive(Debug)]
pub struct TcpStack {
    cfg: StackConfig,
    conntrack: Conntrack,
    timers: TimerQueue<TimerEvent>,
    pool: PortPool,
}

impl Default for TcpStack {
    fn default() -> Self {
        Self::new(StackConfig::default())
    }
}

impl TcpStack {
    pub fn new(cfg: StackConfig) -> Self {
        let pool = cfg.port_pool();
        Self {
            cfg,
            conntrack: Conntrack::new(),
            timers: TimerQueue::new(),
            pool,
        }
    }

    pub fn config(&self) -> &StackConfig {
        &self.cfg
    }

    pub fn conntrack(&self) -> &Conntrack {
        &self.conntrack
    }

    pub fn entry(&self, tuple: Tuple) -> Option<&TcpEntry> {
        self.conntrack.lookup_tcp(tuple)
    }

    pub fn pool(&self) -> &PortPool {
        &self.pool
    }

    pub fn set_pool(&mut self, pool: PortPool) {
        self.pool = pool;
    }

    /// Earliest pending timer deadline; the host should call [`Self::poll_timers`] then.
    pub fn next_deadline(&self) -> Option<Millis> {
        self.timers.next_deadline()
    }

    pub fn listen(&mut self, listening: Endpoint) -> Vec<Action> {
        let entry =
            TcpListenEntry::with_limits(listening, self.cfg.max_syn_backlog, self.cfg.max_backlog);
        let destroyed = self.conntrack.listen_tcp(entry, &mut self.timers);
        reset_all(destroyed)
    }

    /// Stops listening. Connections that were never accepted are reset.
    pub fn unlisten(&mut self, listening: Endpoint) -> Vec<Action> {
        let destroyed = self.conntrack.remove_tcp_listen(listening, &mut self.timers);
        reset_all(destroyed)
    }

    /// Takes the oldest completed connection of `listening` and binds it to `handler`.
    ///
    /// Data that arrived before the connection was accepted is already buffered and can be
    /// read right away.
    pub fn accept(&mut self, listening: Endpoint, handler: HandlerId) -> Option<Tuple> {
        loop {
            let tuple = self.conntrack.lookup_tcp_listen_mut(listening)?.accept()?;
            let Some(entry) = self.conntrack.lookup_tcp_mut(tuple) else {
                continue;
            };
            match entry.set_connection_handler(handler) {
                Ok(()) => return Some(tuple),
                Err(err) => warn!(%tuple, %err, "backlog entry cannot be accepted"),
            }
        }
    }

    pub fn write(
        &mut self,
        tuple: Tuple,
        data: &[u8],
        now: Millis,
    ) -> Result<(usize, Vec<Action>), TcpError> {
        let mut entry = self.take_accepted(tuple)?;
        let mut out = Vec::new();
        let wrote = entry.sending.api_write(data);
        let disposition = if wrote > 0 {
            self.transmit(&mut entry, Flight::New, now, &mut out)
        } else {
            Disposition::Keep
        };
        self.finish(entry, disposition, &mut out);
        Ok((wrote, out))
    }

    pub fn read(
        &mut self,
        tuple: Tuple,
        max_len: usize,
        now: Millis,
    ) -> Result<(Vec<u8>, Vec<Action>), TcpError> {
        let mut entry = self.take_accepted(tuple)?;
        let mut out = Vec::new();
        let data = entry.receiving.api_read(max_len);
        if !data.is_empty() {
            let was_closed = entry.receiving.window() == 0;
            entry.receiving.reset_window();
            if was_closed {
                self.send_ack(&mut entry, &mut out);
            } else {
                self.tcp_ack(&mut entry, now, &mut out);
            }
        }
        self.finish(entry, Disposition::Keep, &mut out);
        Ok((data, out))
    }

    /// Queues our FIN behind any pending data.
    pub fn close(&mut self, tuple: Tuple, now: Millis) -> Result<Vec<Action>, TcpError> {
        let mut entry = self.take_accepted(tuple)?;
        let next = match entry.state() {
            TcpState::Established => TcpState::FinWait1,
            TcpState::CloseWait => TcpState::LastAck,
            state => {
                self.conntrack.insert_tcp(entry);
                return Err(TcpError::InvalidState { tuple, state });
            }
        };
        entry.set_state(next);
        let mut out = Vec::new();
        let disposition = self.transmit(&mut entry, Flight::New, now, &mut out);
        self.finish(entry, disposition, &mut out);
        Ok(out)
    }

    /// Resets the connection once every queued byte has been acknowledged.
    pub fn close_when_flushed(&mut self, tuple: Tuple, now: Millis) -> Result<Vec<Action>, TcpError> {
        let mut entry = self.take_accepted(tuple)?;
        entry.do_close();
        let mut out = Vec::new();
        let disposition = self.transmit(&mut entry, Flight::New, now, &mut out);
        self.finish(entry, disposition, &mut out);
        Ok(out)
    }

    /// Resets and forgets a locally terminated connection.
    pub fn abort(&mut self, tuple: Tuple) -> Result<Vec<Action>, TcpError> {
        let entry = self
            .conntrack
            .remove_tcp(tuple)
            .ok_or(TcpError::NoSuchConnection(tuple))?;
        if entry.nat().is_some() {
            self.conntrack.insert_tcp(entry);
            return Err(TcpError::OwnedByNat);
        }
        let mut out = Vec::new();
        emit(&entry, build_rst_response(&entry), &mut out);
        self.finish(entry, Disposition::Destroy, &mut out);
        Ok(out)
    }

    /// Destroys every listener, connection and NAT pair.
    pub fn shutdown(&mut self) -> Vec<Action> {
        let destroyed = self.conntrack.destroy_all(&mut self.timers, &mut self.pool);
        let mut out = Vec::new();
        for mut entry in destroyed {
            push_events(&mut entry, &mut out);
        }
        out
    }

    fn take_accepted(&mut self, tuple: Tuple) -> Result<TcpEntry, TcpError> {
        let entry = self
            .conntrack
            .remove_tcp(tuple)
            .ok_or(TcpError::NoSuchConnection(tuple))?;
        match entry.owner() {
            Owner::Established { .. } => Ok(entry),
            _ => {
                self.conntrack.insert_tcp(entry);
                Err(TcpError::NotAccepted(tuple))
            }
        }
    }

    /// Feeds one inbound packet through conntrack.
    pub fn handle_packet(&mut self, ip: IpPacket, now: Millis) -> Vec<Action> {
        let tuple = Tuple::new(ip.src_endpoint(), ip.dst_endpoint());
        let mut out = Vec::new();
        match self.conntrack.lookup_tcp(tuple).map(TcpEntry::owner) {
            Some(Owner::Nat(id)) => self.execute_nat(id, ip, now, &mut out),
            Some(Owner::Unattached) => {
                debug!(%tuple, "dropping packet for unattached entry");
            }
            Some(_) => {
                // Temporarily remove the entry so we can mutate `self` (schedule timers, reach
                // the listener) while holding a mutable entry.
                let Some(mut entry) = self.conntrack.remove_tcp(tuple) else {
                    return out;
                };
                let disposition = self.on_segment(&mut entry, ip.tcp(), now, &mut out);
                self.finish(entry, disposition, &mut out);
            }
            None => self.on_unknown(tuple, &ip, now, &mut out),
        }
        out
    }

    fn on_unknown(&mut self, tuple: Tuple, ip: &IpPacket, now: Millis, out: &mut Vec<Action>) {
        let tcp = ip.tcp();
        if tcp.is_rst() {
            return;
        }
        let pure_syn = tcp.flags == TcpFlags::SYN;
        let listen = match self.conntrack.lookup_tcp_listen_mut(tuple.local) {
            Some(listen) if pure_syn => listen,
            _ => {
                trace!(%tuple, "no connection or listener, answering with RST");
                out.push(Action::Emit(build_rst_for(ip)));
                return;
            }
        };
        if !listen.try_push_syn(tuple) {
            debug!(%tuple, listening = %listen.listening(), "syn backlog is full, dropping SYN");
            return;
        }
        let listening = listen.listening();
        let mut entry = TcpEntry::pending(listening, tuple.remote, tuple.local, u64::from(tcp.seq_number));
        let disposition = self.on_closed(&mut entry, tcp, now, out);
        self.finish(entry, disposition, out);
    }

    fn on_segment(
        &mut self,
        entry: &mut TcpEntry,
        tcp: &TcpPacket,
        now: Millis,
        out: &mut Vec<Action>,
    ) -> Disposition {
        if tcp.is_rst() {
            let expecting = entry.receiving.expecting_seq();
            if seq::from_wire(tcp.seq_number, expecting) == expecting {
                debug!(tuple = %entry.tuple(), state = %entry.state(), "connection reset by peer");
                return Disposition::Destroy;
            }
            trace!(tuple = %entry.tuple(), "ignoring RST outside of the expected sequence");
            return Disposition::Keep;
        }

        match entry.state() {
            TcpState::Closed => self.on_closed(entry, tcp, now, out),
            TcpState::SynReceived => self.on_syn_received(entry, tcp, now, out),
            TcpState::Established => self.on_established(entry, tcp, now, out),
            TcpState::FinWait1 => self.on_fin_wait_1(entry, tcp, now, out),
            TcpState::FinWait2 => self.on_fin_wait_2(entry, tcp, now, out),
            TcpState::CloseWait => self.on_close_wait(entry, tcp, now, out),
            TcpState::Closing => self.on_closing(entry, tcp, now, out),
            TcpState::LastAck => self.on_last_ack(entry, tcp, now, out),
            state @ (TcpState::SynSent | TcpState::TimeWait) => {
                trace!(tuple = %entry.tuple(), %state, "dropping packet");
                Disposition::Keep
            }
        }
    }

    fn on_closed(
        &mut self,
        entry: &mut TcpEntry,
        tcp: &TcpPacket,
        now: Millis,
        out: &mut Vec<Action>,
    ) -> Disposition {
        if !tcp.is_syn() || tcp.is_ack() {
            trace!(tuple = %entry.tuple(), "expecting SYN in CLOSED state");
            return Disposition::Keep;
        }
        entry.set_state(TcpState::SynReceived);

        let mss = tcp
            .mss()
            .filter(|&mss| mss > 0)
            .map_or(SND_DEFAULT_MSS, usize::from);
        let window_scale = tcp
            .window_scale()
            .map_or(1, |shift| 1usize << shift.min(MAX_WINDOW_SCALE_SHIFT));
        entry
            .sending
            .init(usize::from(tcp.window_size), mss, window_scale);
        if entry.receiving.expecting_seq() == 0 && entry.receiving.acked_seq() == 0 {
            entry.receiving.set_initial_seq(u64::from(tcp.seq_number) + 1);
        }

        emit(entry, build_syn_ack(entry, self.cfg.rcv_mss), out);
        entry.sending.inc_all_seq();

        if entry.handshake_timer.is_none() {
            let delay = self.cfg.tcp_timeout.millis(TcpState::SynReceived);
            let event = TimerEvent::HandshakeExpired {
                tuple: entry.tuple(),
            };
            entry.handshake_timer = Some(self.timers.schedule(now, delay, event));
        }
        Disposition::Keep
    }

    fn on_syn_received(
        &mut self,
        entry: &mut TcpEntry,
        tcp: &TcpPacket,
        now: Millis,
        out: &mut Vec<Action>,
    ) -> Disposition {
        if tcp.is_syn() && !tcp.is_ack() {
            let syn = seq::from_wire(tcp.seq_number, entry.receiving.expecting_seq());
            if syn + 1 == entry.receiving.acked_seq() {
                // Our SYN-ACK was lost: rebuild it at the ISN.
                entry.sending.dec_all_seq();
                emit(entry, build_syn_ack(entry, self.cfg.rcv_mss), out);
                entry.sending.inc_all_seq();
            }
            return Disposition::Keep;
        }
        if !tcp.is_ack() {
            return Disposition::Keep;
        }
        let ack = seq::from_wire(tcp.ack_number, entry.sending.latest_seq());
        if ack != entry.sending.ack_seq() {
            debug!(tuple = %entry.tuple(), ack, expected = entry.sending.ack_seq(), "unexpected ACK for SYN-ACK");
            return Disposition::Keep;
        }

        let Owner::Pending { listening } = entry.owner() else {
            return Disposition::Keep;
        };
        let tuple = entry.tuple();
        let promoted = self
            .conntrack
            .lookup_tcp_listen_mut(listening)
            .is_some_and(|listen| listen.promote(tuple));
        if !promoted {
            debug!(%tuple, %listening, "accept backlog is full, dropping ACK");
            return Disposition::Keep;
        }
        if let Some(id) = entry.handshake_timer.take() {
            self.timers.cancel(id);
        }
        entry.set_state(TcpState::Established);
        out.push(Action::ListenReadable { listening });
        self.on_established(entry, tcp, now, out)
    }

    /// Drops segments that are not at the expected position and applies the ACK.
    ///
    /// Returns the disposition to stop with, or `None` to continue processing the segment.
    fn precheck(
        &mut self,
        entry: &mut TcpEntry,
        tcp: &TcpPacket,
        now: Millis,
        out: &mut Vec<Action>,
    ) -> Option<Disposition> {
        let expecting = entry.receiving.expecting_seq();
        let seq = seq::from_wire(tcp.seq_number, expecting);
        if seq != expecting && (seq > expecting || (!tcp.is_fin() && tcp.payload.is_empty())) {
            trace!(tuple = %entry.tuple(), seq, expecting, "dropping segment out of order");
            return Some(Disposition::Keep);
        }
        if tcp.is_ack() {
            let before = entry.sending.ack_seq();
            let ack = seq::from_wire(tcp.ack_number, entry.sending.latest_seq());
            entry.ack(ack, usize::from(tcp.window_size));
            let send = if entry.sending.ack_seq() != before {
                Flight::Acked
            } else {
                Flight::New
            };
            if let Disposition::Destroy = self.transmit(entry, send, now, out) {
                return Some(Disposition::Destroy);
            }
        }
        None
    }

    /// Stores the payload and returns the unwrapped sequence number of the segment.
    fn on_data(&mut self, entry: &mut TcpEntry, tcp: &TcpPacket, now: Millis, out: &mut Vec<Action>) -> u64 {
        let seq = seq::from_wire(tcp.seq_number, entry.receiving.expecting_seq());
        if !tcp.payload.is_empty() {
            entry.store(&Segment::new(seq, tcp.payload.clone()));
            self.tcp_ack(entry, now, out);
        }
        seq
    }

    fn on_established(
        &mut self,
        entry: &mut TcpEntry,
        tcp: &TcpPacket,
        now: Millis,
        out: &mut Vec<Action>,
    ) -> Disposition {
        if let Some(disposition) = self.precheck(entry, tcp, now, out) {
            return disposition;
        }
        let seq = self.on_data(entry, tcp, now, out);
        if tcp.is_fin() && fin_acceptable(entry, tcp, seq) {
            entry.set_state(TcpState::CloseWait);
            entry.receiving.inc_expecting_seq();
            self.tcp_ack(entry, now, out);
        }
        Disposition::Keep
    }

    fn on_fin_wait_1(
        &mut self,
        entry: &mut TcpEntry,
        tcp: &TcpPacket,
        now: Millis,
        out: &mut Vec<Action>,
    ) -> Disposition {
        if let Some(disposition) = self.precheck(entry, tcp, now, out) {
            return disposition;
        }
        let seq = self.on_data(entry, tcp, now, out);
        if tcp.is_fin() && fin_acceptable(entry, tcp, seq) {
            entry.set_state(TcpState::Closing);
            entry.receiving.inc_expecting_seq();
            if entry.sending.ack_of_fin_received() {
                emit(entry, build_rst_response(entry), out);
                return Disposition::Destroy;
            }
            self.send_ack(entry, out);
        } else if !tcp.is_fin() && entry.sending.ack_of_fin_received() {
            entry.set_state(TcpState::FinWait2);
        }
        Disposition::Keep
    }

    fn on_fin_wait_2(
        &mut self,
        entry: &mut TcpEntry,
        tcp: &TcpPacket,
        now: Millis,
        out: &mut Vec<Action>,
    ) -> Disposition {
        if let Some(disposition) = self.precheck(entry, tcp, now, out) {
            return disposition;
        }
        let seq = self.on_data(entry, tcp, now, out);
        if tcp.is_fin() && fin_acceptable(entry, tcp, seq) {
            entry.set_state(TcpState::Closing);
            entry.receiving.inc_expecting_seq();
            emit(entry, build_rst_response(entry), out);
            return Disposition::Destroy;
        }
        Disposition::Keep
    }

    fn on_close_wait(
        &mut self,
        entry: &mut TcpEntry,
        tcp: &TcpPacket,
        now: Millis,
        out: &mut Vec<Action>,
    ) -> Disposition {
        if let Some(disposition) = self.precheck(entry, tcp, now, out) {
            return disposition;
        }
        self.reack_fin(entry, tcp, now, out);
        Disposition::Keep
    }

    fn on_closing(
        &mut self,
        entry: &mut TcpEntry,
        tcp: &TcpPacket,
        now: Millis,
        out: &mut Vec<Action>,
    ) -> Disposition {
        if let Some(disposition) = self.precheck(entry, tcp, now, out) {
            return disposition;
        }
        if entry.sending.ack_of_fin_received() {
            emit(entry, build_rst_response(entry), out);
            return Disposition::Destroy;
        }
        Disposition::Keep
    }

    fn on_last_ack(
        &mut self,
        entry: &mut TcpEntry,
        tcp: &TcpPacket,
        now: Millis,
        out: &mut Vec<Action>,
    ) -> Disposition {
        if let Some(disposition) = self.precheck(entry, tcp, now, out) {
            return disposition;
        }
        if entry.sending.ack_of_fin_received() {
            return Disposition::Destroy;
        }
        self.reack_fin(entry, tcp, now, out);
        Disposition::Keep
    }

    /// Acknowledges a retransmission of the FIN we already consumed.
    fn reack_fin(&mut self, entry: &mut TcpEntry, tcp: &TcpPacket, now: Millis, out: &mut Vec<Action>) {
        if !tcp.is_fin() {
            return;
        }
        let seq = seq::from_wire(tcp.seq_number, entry.receiving.expecting_seq());
        if seq + tcp.payload.len() as u64 + 1 == entry.receiving.expecting_seq() {
            self.tcp_ack(entry, now, out);
        }
    }

    /// Sends data (or our FIN) and keeps the retransmission timer armed while anything is
    /// unacknowledged.
    fn transmit(
        &mut self,
        entry: &mut TcpEntry,
        send: Flight,
        now: Millis,
        out: &mut Vec<Action>,
    ) -> Disposition {
        let (last_begin_seq, count) = match send {
            Flight::Retransmit {
                last_begin_seq,
                count,
            } => (last_begin_seq, count),
            Flight::New | Flight::Acked => (0, 0),
        };
        if entry.require_closing() && count > MAX_RETRANSMISSION_AFTER_CLOSING {
            debug!(tuple = %entry.tuple(), count, "too many retransmissions while closing");
            emit(entry, build_rst_response(entry), out);
            return Disposition::Destroy;
        }

        let pending = entry.sending.has_more_data();
        if !pending && !entry.sending.need_to_send_fin() {
            if let Some(id) = entry.retransmission_timer.take() {
                self.timers.cancel(id);
            }
            if entry.require_closing() {
                emit(entry, build_rst_response(entry), out);
                return Disposition::Destroy;
            }
            return Disposition::Keep;
        }

        let resend = matches!(send, Flight::Retransmit { .. });
        let flight = if resend {
            entry.sending.fetch()
        } else {
            entry.sending.fetch_new()
        };
        let send_fin = !pending && entry.sending.fetch_fin(resend);

        if entry.retransmission_timer.is_none() || send != Flight::New {
            if let Some(id) = entry.retransmission_timer.take() {
                self.timers.cancel(id);
            }
            let begin = if pending {
                entry.sending.ack_seq()
            } else {
                entry.sending.latest_seq() + 1
            };
            let count = if begin == last_begin_seq { count } else { 0 };
            let delay = rto(count);
            trace!(tuple = %entry.tuple(), begin, count, delay, segments = flight.len(), "transmitting");
            entry.retransmission_timer = Some(self.timers.schedule(
                now,
                delay,
                TimerEvent::Retransmit {
                    tuple: entry.tuple(),
                    last_begin_seq: begin,
                    count: count + 1,
                },
            ));
        }

        if send_fin {
            let mut tcp = build_common_tcp_response(entry);
            tcp.flags = TcpFlags::FIN | TcpFlags::ACK;
            emit(entry, tcp, out);
        }
        for segment in flight {
            let mut tcp = build_common_tcp_response(entry);
            tcp.seq_number = seq::to_wire(segment.seq_begin());
            tcp.flags = TcpFlags::PSH | TcpFlags::ACK;
            tcp.payload = segment.into_data();
            emit(entry, tcp, out);
        }
        Disposition::Keep
    }

    /// Acknowledges received data, immediately when our window is closed and delayed otherwise.
    fn tcp_ack(&mut self, entry: &mut TcpEntry, now: Millis, out: &mut Vec<Action>) {
        if entry.receiving.window() == 0 {
            self.send_ack(entry, out);
            return;
        }
        if entry.delayed_ack_timer.is_some() {
            return;
        }
        let event = TimerEvent::DelayedAck {
            tuple: entry.tuple(),
        };
        entry.delayed_ack_timer = Some(self.timers.schedule(now, DELAYED_ACK_TIMEOUT, event));
    }

    fn send_ack(&mut self, entry: &mut TcpEntry, out: &mut Vec<Action>) {
        if let Some(id) = entry.delayed_ack_timer.take() {
            self.timers.cancel(id);
        }
        emit(entry, build_ack_response(entry), out);
    }

    /// Reinserts or tears down an entry taken out of the table, reporting its events.
    fn finish(&mut self, mut entry: TcpEntry, disposition: Disposition, out: &mut Vec<Action>) {
        match disposition {
            Disposition::Keep => {
                push_events(&mut entry, out);
                if let Some(displaced) = self.conntrack.insert_tcp(entry) {
                    warn!(tuple = %displaced.tuple(), "replaced a tracked entry");
                }
            }
            Disposition::Destroy => {
                let tuple = entry.tuple();
                entry.destroy(&mut self.timers);
                if let Owner::Pending { listening } = entry.owner() {
                    if let Some(listen) = self.conntrack.lookup_tcp_listen_mut(listening) {
                        listen.remove(tuple);
                    }
                }
                trace!(%tuple, "connection destroyed");
                push_events(&mut entry, out);
            }
        }
    }

    /// Fires every timer due at `now`.
    pub fn poll_timers(&mut self, now: Millis) -> Vec<Action> {
        let mut out = Vec::new();
        for event in self.timers.poll_expired(now) {
            match event {
                TimerEvent::Retransmit {
                    tuple,
                    last_begin_seq,
                    count,
                } => {
                    let Some(mut entry) = self.conntrack.remove_tcp(tuple) else {
                        continue;
                    };
                    entry.retransmission_timer = None;
                    let send = Flight::Retransmit {
                        last_begin_seq,
                        count,
                    };
                    let disposition = self.transmit(&mut entry, send, now, &mut out);
                    self.finish(entry, disposition, &mut out);
                }
                TimerEvent::DelayedAck { tuple } => {
                    let Some(mut entry) = self.conntrack.remove_tcp(tuple) else {
                        continue;
                    };
                    entry.delayed_ack_timer = None;
                    self.send_ack(&mut entry, &mut out);
                    self.finish(entry, Disposition::Keep, &mut out);
                }
                TimerEvent::HandshakeExpired { tuple } => {
                    let Some(mut entry) = self.conntrack.remove_tcp(tuple) else {
                        continue;
                    };
                    entry.handshake_timer = None;
                    if entry.state() == TcpState::SynReceived {
                        debug!(%tuple, "handshake not completed in time");
                        self.finish(entry, Disposition::Destroy, &mut out);
                    } else {
                        self.finish(entry, Disposition::Keep, &mut out);
                    }
                }
                TimerEvent::NatExpired(id) => {
                    debug!(nat = %id, "nat connection expired");
                    self.conntrack.destroy_nat(id, &mut self.timers, &mut self.pool);
                }
            }
        }
        out
    }

    /// Translates `ip` according to `rule`, creating the NAT pair on the first packet of a
    /// connection. With `proxy_protocol`, a PROXY v2 header describing the client is sent to
    /// the server ahead of the client's data.
    pub fn nat(
        &mut self,
        ip: IpPacket,
        rule: NatRule,
        proxy_protocol: bool,
        now: Millis,
    ) -> Result<Vec<Action>, TcpError> {
        let client = ip.src_endpoint();
        let target = ip.dst_endpoint();
        let leg1 = Tuple::new(client, target);
        let mut out = Vec::new();

        if let Some(owner) = self.conntrack.lookup_tcp(leg1).map(TcpEntry::owner) {
            return match owner {
                Owner::Nat(id) => {
                    self.execute_nat(id, ip, now, &mut out);
                    Ok(out)
                }
                _ => Err(TcpError::OwnedByStack),
            };
        }

        let (leg2, pooled) = match rule {
            NatRule::Dnat { dst } => (Tuple::new(dst, client), None),
            NatRule::Snat => {
                let src = self.pool.allocate(target).ok_or(TcpError::PoolExhausted)?;
                (Tuple::new(target, src), Some(src))
            }
            NatRule::Fnat { dst } => {
                let src = self.pool.allocate(dst).ok_or(TcpError::PoolExhausted)?;
                (Tuple::new(dst, src), Some(src))
            }
            NatRule::Fixed { src, dst } => (Tuple::new(dst, src), None),
        };
        if leg2.remote.is_ipv4() != leg2.local.is_ipv4() {
            if let Some(pooled) = pooled {
                self.pool.release(pooled);
            }
            return Err(PacketError::AddressFamilyMismatch.into());
        }

        if let Some(displaced) = self.conntrack.lookup_tcp(leg2).map(TcpEntry::owner) {
            warn!(tuple = %leg2, "server side tuple is already tracked, replacing it");
            match displaced {
                Owner::Nat(other) => {
                    self.conntrack.destroy_nat(other, &mut self.timers, &mut self.pool);
                }
                _ => {
                    if let Some(entry) = self.conntrack.remove_tcp(leg2) {
                        emit(&entry, build_rst_response(&entry), &mut out);
                        self.finish(entry, Disposition::Destroy, &mut out);
                    }
                }
            }
        }

        let id = self.conntrack.next_nat_id();
        for tuple in [leg1, leg2] {
            let mut entry = TcpEntry::unattached(tuple.remote, tuple.local);
            entry.set_nat(id)?;
            self.conntrack.insert_tcp(entry);
        }
        let mut nat = TcpNat::new(id, leg1, leg2, self.cfg.tcp_timeout);
        if let Some(pooled) = pooled {
            nat = nat.with_pooled(pooled);
        }
        if proxy_protocol {
            nat = nat.with_proxy_protocol(ProxyProtocolHelper::new(
                client.ip(),
                target.ip(),
                client.port(),
                target.port(),
            ));
        }
        nat.start(&mut self.timers, now);
        debug!(nat = %id, %leg1, %leg2, ?rule, proxy_protocol, "new nat connection");
        self.conntrack.insert_nat(nat);

        self.execute_nat(id, ip, now, &mut out);
        Ok(out)
    }

    fn execute_nat(&mut self, id: NatId, mut ip: IpPacket, now: Millis, out: &mut Vec<Action>) {
        let Some(nat) = self.conntrack.nat_mut(id) else {
            return;
        };
        let (leg1, leg2) = (nat.leg1(), nat.leg2());
        let is_backhaul = ip.src_endpoint() == leg2.remote;
        match nat.track(&mut ip, is_backhaul, &mut self.timers, now) {
            NatVerdict::Drop => trace!(nat = %id, "dropping packet"),
            NatVerdict::ReplyToServer => out.push(Action::Forward(ip)),
            NatVerdict::Forward => {
                let (src, dst) = if is_backhaul {
                    (leg1.local, leg1.remote)
                } else {
                    (leg2.local, leg2.remote)
                };
                match translate(ip, src, dst) {
                    Ok(ip) => out.push(Action::Forward(ip)),
                    Err(err) => warn!(nat = %id, %err, "unable to translate packet"),
                }
            }
        }
    }
}

/// Retransmission timeout after `count` unanswered transmissions of the same flight.
fn rto(count: u32) -> Millis {
    RTO_MIN
        .saturating_mul(1u64.checked_shl(count).unwrap_or(u64::MAX))
        .min(RTO_MAX)
}

/// Only the FIN directly after the last byte we delivered, with nothing left unread.
fn fin_acceptable(entry: &TcpEntry, tcp: &TcpPacket, seq: u64) -> bool {
    let expecting = entry.receiving.expecting_seq();
    seq + tcp.payload.len() as u64 == expecting && expecting == entry.receiving.acked_seq()
}

fn translate(mut ip: IpPacket, src: Endpoint, dst: Endpoint) -> Result<IpPacket, PacketError> {
    if ip.src().is_ipv4() == src.is_ipv4() && src.is_ipv4() == dst.is_ipv4() {
        ip.set_src(src)?;
        ip.set_dst(dst)?;
        return Ok(ip);
    }
    let hop_limit = ip.hop_limit();
    let mut tcp = ip.into_tcp();
    tcp.src_port = src.port();
    tcp.dst_port = dst.port();
    IpPacket::new(src.ip(), dst.ip(), hop_limit, tcp)
}

fn emit(entry: &TcpEntry, tcp: TcpPacket, out: &mut Vec<Action>) {
    match build_ip_response(entry, tcp) {
        Ok(ip) => out.push(Action::Emit(ip)),
        Err(err) => warn!(tuple = %entry.tuple(), %err, "unable to build response"),
    }
}

fn push_events(entry: &mut TcpEntry, out: &mut Vec<Action>) {
    let tuple = entry.tuple();
    out.extend(entry.take_events().into_iter().map(|event| match event {
        ConnEvent::Readable => Action::Readable { tuple },
        ConnEvent::Writable => Action::Writable { tuple },
        ConnEvent::Destroyed => Action::Destroyed { tuple },
    }));
}

/// Resets connections dropped together with their listener.
fn reset_all(destroyed: Vec<TcpEntry>) -> Vec<Action> {
    let mut out = Vec::new();
    for entry in destroyed {
        emit(&entry, build_rst_response(&entry), &mut out);
    }
    out
}
