use rand::Rng;
use tracing::trace;

use crate::error::TcpError;
use crate::nat::NatId;
use crate::receiving::ReceivingQueue;
use crate::segment::Segment;
use crate::sending::SendingQueue;
use crate::state::TcpState;
use crate::timer::{TimerId, TimerQueue};
use crate::{Endpoint, Tuple, TCP_SEQ_INIT_MIN, TCP_SEQ_RAND};

/// Opaque id of the application object that accepted a connection.
pub type HandlerId = u64;

/// Who is responsible for a tracked entry. Exactly one at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Owner {
    Unattached,
    /// Waiting in the backlogs of the listener at `listening`.
    Pending { listening: Endpoint },
    Established { handler: HandlerId },
    Nat(NatId),
}

/// Notifications for the connection handler, drained after each call into the entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnEvent {
    Readable,
    Writable,
    Destroyed,
}

#[derive(Debug)]
pub struct TcpEntry {
    pub remote: Endpoint,
    pub local: Endpoint,
    state: TcpState,
    pub sending: SendingQueue,
    pub receiving: ReceivingQueue,
    pub(crate) retransmission_timer: Option<TimerId>,
    pub(crate) delayed_ack_timer: Option<TimerId>,
    pub(crate) handshake_timer: Option<TimerId>,
    need_closing: bool,
    owner: Owner,
    events: Vec<ConnEvent>,
    destroyed: bool,
}

impl TcpEntry {
    /// Entry created by a SYN towards `listening`, with a random initial send sequence.
    pub fn pending(listening: Endpoint, remote: Endpoint, local: Endpoint, syn_seq: u64) -> Self {
        let isn = rand::thread_rng().gen_range(TCP_SEQ_INIT_MIN..TCP_SEQ_INIT_MIN + TCP_SEQ_RAND);
        Self::pending_with_isn(listening, remote, local, syn_seq, isn)
    }

    pub fn pending_with_isn(
        listening: Endpoint,
        remote: Endpoint,
        local: Endpoint,
        syn_seq: u64,
        isn: u64,
    ) -> Self {
        let expecting = if syn_seq == 0 { 0 } else { syn_seq + 1 };
        Self::build(
            remote,
            local,
            SendingQueue::new(isn),
            ReceivingQueue::new(expecting),
            Owner::Pending { listening },
        )
    }

    /// Entry recorded for a NAT leg. Its queues are never used.
    pub fn unattached(remote: Endpoint, local: Endpoint) -> Self {
        Self::build(
            remote,
            local,
            SendingQueue::new(0),
            ReceivingQueue::new(0),
            Owner::Unattached,
        )
    }

    fn build(
        remote: Endpoint,
        local: Endpoint,
        sending: SendingQueue,
        receiving: ReceivingQueue,
        owner: Owner,
    ) -> Self {
        let mut entry = Self {
            remote,
            local,
            state: TcpState::Closed,
            sending,
            receiving,
            retransmission_timer: None,
            delayed_ack_timer: None,
            handshake_timer: None,
            need_closing: false,
            owner,
            events: Vec::new(),
            destroyed: false,
        };
        entry.mirror_state();
        entry
    }

    pub fn tuple(&self) -> Tuple {
        Tuple::new(self.remote, self.local)
    }

    pub fn state(&self) -> TcpState {
        self.state
    }

    pub fn owner(&self) -> Owner {
        self.owner
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    fn mirror_state(&mut self) {
        self.sending.set_fin_sent(self.state.fin_sent());
        self.receiving.set_remote_closed(self.state.remote_closed());
    }

    fn push_event(&mut self, event: ConnEvent) {
        if matches!(self.owner, Owner::Established { .. }) {
            self.events.push(event);
        }
    }

    pub fn set_state(&mut self, state: TcpState) {
        let old = self.state;
        trace!(remote = %self.remote, local = %self.local, "tcp state changing: {old} -> {state}");
        self.state = state;
        self.mirror_state();
        if !old.remote_closed() && state.remote_closed() {
            self.push_event(ConnEvent::Readable);
        }
        if old == TcpState::SynSent && state == TcpState::Established {
            self.push_event(ConnEvent::Writable);
        }
    }

    /// Stores received data, signalling `Readable` when anything was accepted.
    pub fn store(&mut self, segment: &Segment) -> bool {
        let stored = self.receiving.store(segment);
        if stored {
            self.push_event(ConnEvent::Readable);
        }
        stored
    }

    /// Applies an ACK, signalling `Writable` once per released segment.
    pub fn ack(&mut self, seq: u64, window: usize) -> usize {
        let released = self.sending.ack(seq, window);
        for _ in 0..released {
            self.push_event(ConnEvent::Writable);
        }
        released
    }

    pub fn take_events(&mut self) -> Vec<ConnEvent> {
        core::mem::take(&mut self.events)
    }

    pub fn set_connection_handler(&mut self, handler: HandlerId) -> Result<(), TcpError> {
        match self.owner {
            Owner::Established { .. } => Err(TcpError::HandlerAlreadySet),
            Owner::Nat(_) => Err(TcpError::OwnedByNat),
            Owner::Unattached | Owner::Pending { .. } => {
                self.owner = Owner::Established { handler };
                Ok(())
            }
        }
    }

    pub fn set_nat(&mut self, nat: NatId) -> Result<(), TcpError> {
        match self.owner {
            Owner::Nat(_) => Err(TcpError::NatAlreadySet),
            Owner::Pending { .. } | Owner::Established { .. } => Err(TcpError::OwnedByStack),
            Owner::Unattached => {
                self.owner = Owner::Nat(nat);
                Ok(())
            }
        }
    }

    pub fn nat(&self) -> Option<NatId> {
        match self.owner {
            Owner::Nat(id) => Some(id),
            _ => None,
        }
    }

    /// Marks the connection to be reset once everything queued has been sent.
    pub fn do_close(&mut self) {
        self.need_closing = true;
    }

    pub fn require_closing(&self) -> bool {
        self.need_closing
    }

    /// Cancels every timer and moves to CLOSED. Only the first call has any effect.
    pub fn destroy<E>(&mut self, timers: &mut TimerQueue<E>) {
        if self.destroyed {
            return;
        }
        self.destroyed = true;
        self.state = TcpState::Closed;
        self.mirror_state();
        if let Some(id) = self.retransmission_timer.take() {
            timers.cancel(id);
        }
        if let Some(id) = self.delayed_ack_timer.take() {
            timers.cancel(id);
        }
        if let Some(id) = self.handshake_timer.take() {
            timers.cancel(id);
        }
        self.push_event(ConnEvent::Destroyed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timer::TimerEvent;

    fn ep(s: &str) -> Endpoint {
        s.parse().unwrap()
    }

    fn accepted() -> TcpEntry {
        let mut e = TcpEntry::pending_with_isn(ep("10.0.0.1:80"), ep("10.0.0.2:5000"), ep("10.0.0.1:80"), 99, 1000);
        e.set_connection_handler(7).unwrap();
        e
    }

    #[test]
    fn pending_initial_sequences() {
        let e = TcpEntry::pending_with_isn(ep("10.0.0.1:80"), ep("10.0.0.2:5000"), ep("10.0.0.1:80"), 99, 1000);
        assert_eq!(e.receiving.expecting_seq(), 100);
        assert_eq!(e.sending.latest_seq(), 1000);
        assert_eq!(e.state(), TcpState::Closed);

        let zero = TcpEntry::pending(ep("10.0.0.1:80"), ep("10.0.0.2:5000"), ep("10.0.0.1:80"), 0);
        assert_eq!(zero.receiving.expecting_seq(), 0);
        let isn = zero.sending.latest_seq();
        assert!((TCP_SEQ_INIT_MIN..TCP_SEQ_INIT_MIN + TCP_SEQ_RAND).contains(&isn));
    }

    #[test]
    fn handler_and_nat_are_exclusive() {
        let mut e = accepted();
        assert_eq!(e.set_connection_handler(8), Err(TcpError::HandlerAlreadySet));
        assert_eq!(e.set_nat(NatId(1)), Err(TcpError::OwnedByStack));

        let mut leg = TcpEntry::unattached(ep("10.0.0.2:5000"), ep("10.0.0.1:80"));
        leg.set_nat(NatId(1)).unwrap();
        assert_eq!(leg.set_nat(NatId(2)), Err(TcpError::NatAlreadySet));
        assert_eq!(leg.set_connection_handler(1), Err(TcpError::OwnedByNat));
        assert_eq!(leg.nat(), Some(NatId(1)));
    }

    #[test]
    fn remote_close_wakes_reader() {
        let mut e = accepted();
        e.set_state(TcpState::Established);
        assert!(e.take_events().is_empty());
        e.set_state(TcpState::CloseWait);
        assert_eq!(e.take_events(), vec![ConnEvent::Readable]);
        e.set_state(TcpState::LastAck);
        assert!(e.take_events().is_empty());
    }

    #[test]
    fn active_open_signals_writable() {
        let mut e = accepted();
        e.set_state(TcpState::SynSent);
        e.set_state(TcpState::Established);
        assert_eq!(e.take_events(), vec![ConnEvent::Writable]);
    }

    #[test]
    fn queue_results_become_events() {
        let mut e = accepted();
        e.set_state(TcpState::Established);
        e.sending.init(65535, 10, 1);
        e.sending.api_write(&[0u8; 25]);
        e.sending.fetch();
        assert_eq!(e.ack(1020, 65535), 2);
        assert!(e.store(&Segment::new(100, b"hi".to_vec())));
        assert!(!e.store(&Segment::new(100, b"hi".to_vec())));
        assert_eq!(
            e.take_events(),
            vec![ConnEvent::Writable, ConnEvent::Writable, ConnEvent::Readable]
        );
    }

    #[test]
    fn pending_entries_do_not_emit_events() {
        let mut e = TcpEntry::pending_with_isn(ep("10.0.0.1:80"), ep("10.0.0.2:5000"), ep("10.0.0.1:80"), 99, 1000);
        e.set_state(TcpState::SynReceived);
        e.set_state(TcpState::Established);
        e.store(&Segment::new(100, b"early".to_vec()));
        assert!(e.take_events().is_empty());
        assert_eq!(e.receiving.current_size(), 5);
    }

    #[test]
    fn destroy_is_idempotent_and_cancels_timers() {
        let mut timers: TimerQueue<TimerEvent> = TimerQueue::new();
        let mut e = accepted();
        e.set_state(TcpState::Established);
        let tuple = e.tuple();
        e.retransmission_timer = Some(timers.schedule(0, 200, TimerEvent::DelayedAck { tuple }));
        e.delayed_ack_timer = Some(timers.schedule(0, 20, TimerEvent::DelayedAck { tuple }));
        e.handshake_timer = Some(timers.schedule(0, 60_000, TimerEvent::HandshakeExpired { tuple }));

        e.destroy(&mut timers);
        e.destroy(&mut timers);
        assert!(timers.is_empty());
        assert_eq!(e.state(), TcpState::Closed);
        assert_eq!(e.take_events(), vec![ConnEvent::Destroyed]);
    }
}
