use std::collections::{BTreeSet, HashMap};

use crate::nat::NatId;
use crate::{Millis, Tuple};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(u64);

/// Expiry messages delivered to [`crate::TcpStack`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimerEvent {
    Retransmit {
        tuple: Tuple,
        last_begin_seq: u64,
        count: u32,
    },
    DelayedAck {
        tuple: Tuple,
    },
    /// A half-open connection did not complete its handshake in time.
    HandshakeExpired {
        tuple: Tuple,
    },
    NatExpired(NatId),
}

#[derive(Debug)]
struct Timer<E> {
    deadline: Millis,
    delay: Millis,
    event: E,
}

/// Deadline-ordered one-shot timers carrying an event payload.
///
/// Timers fire at most once and are forgotten afterwards; cancelling, resetting or
/// re-arming a fired or unknown id is a no-op.
#[derive(Debug)]
pub struct TimerQueue<E> {
    next_id: u64,
    timers: HashMap<TimerId, Timer<E>>,
    order: BTreeSet<(Millis, TimerId)>,
}

impl<E> Default for TimerQueue<E> {
    fn default() -> Self {
        Self {
            next_id: 0,
            timers: HashMap::new(),
            order: BTreeSet::new(),
        }
    }
}

impl<E> TimerQueue<E> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schedule(&mut self, now: Millis, delay: Millis, event: E) -> TimerId {
        let id = TimerId(self.next_id);
        self.next_id += 1;
        let deadline = now.saturating_add(delay);
        self.timers.insert(
            id,
            Timer {
                deadline,
                delay,
                event,
            },
        );
        self.order.insert((deadline, id));
        id
    }

    pub fn cancel(&mut self, id: TimerId) -> bool {
        match self.timers.remove(&id) {
            Some(timer) => {
                self.order.remove(&(timer.deadline, id));
                true
            }
            None => false,
        }
    }

    /// Restarts the timer with its current delay.
    pub fn reset(&mut self, id: TimerId, now: Millis) -> bool {
        let delay = match self.timers.get(&id) {
            Some(timer) => timer.delay,
            None => return false,
        };
        self.set_timeout(id, now, delay)
    }

    /// Re-arms the timer to fire `delay` ms after `now`, keeping the new delay for later resets.
    pub fn set_timeout(&mut self, id: TimerId, now: Millis, delay: Millis) -> bool {
        let timer = match self.timers.get_mut(&id) {
            Some(timer) => timer,
            None => return false,
        };
        self.order.remove(&(timer.deadline, id));
        timer.deadline = now.saturating_add(delay);
        timer.delay = delay;
        self.order.insert((timer.deadline, id));
        true
    }

    pub fn is_scheduled(&self, id: TimerId) -> bool {
        self.timers.contains_key(&id)
    }

    pub fn deadline(&self, id: TimerId) -> Option<Millis> {
        self.timers.get(&id).map(|t| t.deadline)
    }

    pub fn next_deadline(&self) -> Option<Millis> {
        self.order.first().map(|(deadline, _)| *deadline)
    }

    pub fn len(&self) -> usize {
        self.timers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timers.is_empty()
    }

    /// Removes and returns the events of every timer due at `now`, earliest first.
    pub fn poll_expired(&mut self, now: Millis) -> Vec<E> {
        let mut fired = Vec::new();
        while let Some(&(deadline, id)) = self.order.first() {
            if deadline > now {
                break;
            }
            self.order.remove(&(deadline, id));
            if let Some(timer) = self.timers.remove(&id) {
                fired.push(timer.event);
            }
        }
        fired
    }
}
