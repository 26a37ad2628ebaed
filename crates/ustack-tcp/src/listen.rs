use std::collections::VecDeque;

use crate::{Endpoint, Tuple, MAX_BACKLOG_SIZE, MAX_SYN_BACKLOG_SIZE};

/// A listening endpoint and its two bounded backlogs.
///
/// The backlogs hold tuples; the entries themselves live in the conntrack table.
#[derive(Debug)]
pub struct TcpListenEntry {
    listening: Endpoint,
    syn_backlog: VecDeque<Tuple>,
    backlog: VecDeque<Tuple>,
    max_syn_backlog: usize,
    max_backlog: usize,
}

impl TcpListenEntry {
    pub fn new(listening: Endpoint) -> Self {
        Self::with_limits(listening, MAX_SYN_BACKLOG_SIZE, MAX_BACKLOG_SIZE)
    }

    pub fn with_limits(listening: Endpoint, max_syn_backlog: usize, max_backlog: usize) -> Self {
        Self {
            listening,
            syn_backlog: VecDeque::new(),
            backlog: VecDeque::new(),
            max_syn_backlog,
            max_backlog,
        }
    }

    pub fn listening(&self) -> Endpoint {
        self.listening
    }

    /// Records a half-open connection. Returns `false` when the SYN backlog is full.
    pub fn try_push_syn(&mut self, tuple: Tuple) -> bool {
        if self.syn_backlog.len() >= self.max_syn_backlog {
            return false;
        }
        self.syn_backlog.push_back(tuple);
        true
    }

    /// Moves a completed handshake to the accept backlog. Returns `false` if it is full or the
    /// tuple was not half-open.
    pub fn promote(&mut self, tuple: Tuple) -> bool {
        if self.backlog.len() >= self.max_backlog {
            return false;
        }
        let pos = match self.syn_backlog.iter().position(|t| *t == tuple) {
            Some(pos) => pos,
            None => return false,
        };
        self.syn_backlog.remove(pos);
        self.backlog.push_back(tuple);
        true
    }

    pub fn accept(&mut self) -> Option<Tuple> {
        self.backlog.pop_front()
    }

    pub fn remove(&mut self, tuple: Tuple) {
        self.syn_backlog.retain(|t| *t != tuple);
        self.backlog.retain(|t| *t != tuple);
    }

    /// Empties both backlogs, returning every tuple they held.
    pub fn drain(&mut self) -> Vec<Tuple> {
        self.syn_backlog.drain(..).chain(self.backlog.drain(..)).collect()
    }

    pub fn syn_backlog_len(&self) -> usize {
        self.syn_backlog.len()
    }

    pub fn backlog_len(&self) -> usize {
        self.backlog.len()
    }
}
