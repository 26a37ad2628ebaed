use std::collections::VecDeque;

use tracing::warn;

use crate::segment::Segment;
use crate::{MAX_REMOTE_WINDOW_MSS_DUP, WMEM_MAX};

/// Outbound byte stream of one connection.
///
/// Holds everything written by the application that the peer has not acknowledged yet.
/// Invariant: `ack_seq <= fetch_seq <= latest_seq`, and `current_size` equals the sum of the
/// queued segment lengths.
#[derive(Debug)]
pub struct SendingQueue {
    queue: VecDeque<Segment>,
    current_size: usize,
    latest_seq: u64,
    ack_seq: u64,
    fetch_seq: u64,
    window: usize,
    mss: usize,
    window_scale: usize,
    fin_acked: bool,
    fin_sent: bool,
    fin_fetched: bool,
}

impl SendingQueue {
    pub fn new(isn: u64) -> Self {
        Self {
            queue: VecDeque::new(),
            current_size: 0,
            latest_seq: isn,
            ack_seq: isn,
            fetch_seq: isn,
            window: 0,
            mss: 0,
            window_scale: 1,
            fin_acked: false,
            fin_sent: false,
            fin_fetched: false,
        }
    }

    /// Applies the parameters negotiated by the peer's SYN. `window_scale` is a multiplier.
    pub fn init(&mut self, window: usize, mss: usize, window_scale: usize) {
        self.window = window.min(MAX_REMOTE_WINDOW_MSS_DUP * mss);
        self.mss = mss;
        self.window_scale = window_scale.max(1);
    }

    pub fn inc_all_seq(&mut self) {
        self.latest_seq += 1;
        self.ack_seq += 1;
        self.fetch_seq += 1;
    }

    pub fn dec_all_seq(&mut self) {
        self.latest_seq -= 1;
        self.ack_seq -= 1;
        self.fetch_seq -= 1;
    }

    pub(crate) fn set_fin_sent(&mut self, fin_sent: bool) {
        self.fin_sent = fin_sent;
    }

    pub fn has_more_space(&self) -> bool {
        self.current_size < WMEM_MAX
    }

    pub fn has_more_data(&self) -> bool {
        !self.queue.is_empty()
    }

    /// Queues as much of `buf` as fits below `WMEM_MAX`, in chunks of at most one MSS.
    ///
    /// Returns the number of bytes accepted.
    pub fn api_write(&mut self, buf: &[u8]) -> usize {
        if self.fin_sent {
            warn!("FIN is set but still writing data");
            return 0;
        }
        let mut total = 0;
        while total < buf.len() {
            let len = (buf.len() - total)
                .min(self.mss)
                .min(WMEM_MAX - self.current_size);
            if len == 0 {
                break;
            }
            let segment = Segment::new(self.latest_seq, buf[total..total + len].to_vec());
            self.latest_seq = segment.seq_end();
            self.current_size += len;
            self.queue.push_back(segment);
            total += len;
        }
        total
    }

    /// Rebuilds the flight from `ack_seq`. Only a retransmission should go back this far.
    pub fn fetch(&mut self) -> Vec<Segment> {
        self.fetch_seq = self.ack_seq;
        self.fetch_new()
    }

    /// Builds segments for the bytes after `fetch_seq`, up to `ack_seq + window`.
    pub fn fetch_new(&mut self) -> Vec<Segment> {
        let limit = self.ack_seq + self.window as u64;
        let mut flight = Vec::new();
        loop {
            let begin = self.fetch_seq;
            let end = limit.min(begin + self.mss as u64);
            let Some(segment) = self.fetch0(begin, end) else {
                break;
            };
            flight.push(segment);
        }
        flight
    }

    fn fetch0(&mut self, begin: u64, end: u64) -> Option<Segment> {
        if begin >= end {
            return None;
        }
        let front = self.queue.front()?;
        if front.seq_begin() > begin {
            return None;
        }
        let mut data = Vec::new();
        for s in &self.queue {
            if s.seq_begin() >= end {
                break;
            }
            if s.seq_end() <= begin {
                continue;
            }
            let from = (begin.max(s.seq_begin()) - s.seq_begin()) as usize;
            let to = (end.min(s.seq_end()) - s.seq_begin()) as usize;
            data.extend_from_slice(&s.data()[from..to]);
        }
        if data.is_empty() {
            return None;
        }
        let segment = Segment::new(begin, data);
        self.fetch_seq = segment.seq_end();
        Some(segment)
    }

    /// Consumes a cumulative ACK. `window` is the raw 16-bit field value.
    ///
    /// Returns how many queued segments were released; each is a resume signal for a writer
    /// blocked on `WMEM_MAX`.
    pub fn ack(&mut self, seq: u64, window: usize) -> usize {
        if self.fin_acked {
            return 0;
        }
        self.window = (MAX_REMOTE_WINDOW_MSS_DUP * self.mss).min(window.saturating_mul(self.window_scale));

        if self.fin_sent && seq == self.latest_seq + 1 {
            self.latest_seq += 1;
            self.ack_seq = self.latest_seq;
            self.fetch_seq = self.latest_seq;
            self.fin_acked = true;
            self.queue.clear();
            self.current_size = 0;
            return 0;
        }

        let mut seq = seq;
        if seq > self.latest_seq {
            // Acks data we never sent; trust our own queue instead.
            match self.queue.back() {
                Some(last) => seq = last.seq_end(),
                None => return 0,
            }
        }
        if self.ack_seq < seq {
            self.ack_seq = seq;
        }
        if self.fetch_seq < self.ack_seq {
            self.fetch_seq = self.ack_seq;
        }

        let mut released = 0;
        while let Some(front) = self.queue.front() {
            if front.seq_end() > seq {
                break;
            }
            self.current_size -= front.len();
            self.queue.pop_front();
            released += 1;
        }
        released
    }

    pub fn need_to_send_fin(&self) -> bool {
        self.fin_sent && !self.fin_acked
    }

    /// Hands our FIN to the wire. Once it is in flight, only a retransmission (`resend`)
    /// takes it again.
    pub fn fetch_fin(&mut self, resend: bool) -> bool {
        if !self.need_to_send_fin() || (self.fin_fetched && !resend) {
            return false;
        }
        self.fin_fetched = true;
        true
    }

    pub fn ack_of_fin_received(&self) -> bool {
        self.fin_acked
    }

    pub fn current_size(&self) -> usize {
        self.current_size
    }

    pub fn latest_seq(&self) -> u64 {
        self.latest_seq
    }

    pub fn ack_seq(&self) -> u64 {
        self.ack_seq
    }

    pub fn fetch_seq(&self) -> u64 {
        self.fetch_seq
    }

    pub fn window(&self) -> usize {
        self.window
    }

    pub fn mss(&self) -> usize {
        self.mss
    }

    pub fn window_scale(&self) -> usize {
        self.window_scale
    }
}
