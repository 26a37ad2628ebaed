use std::collections::VecDeque;

use tracing::{debug, warn};

use crate::segment::Segment;
use crate::{RCV_WINDOW_SCALE, RMEM_MAX};

/// Inbound byte stream of one connection.
///
/// Only strictly contiguous data is accepted; anything beyond `expecting_seq` is dropped and
/// left to the peer's retransmission. `acked_seq` trails `expecting_seq` by the bytes the
/// application has not read yet.
#[derive(Debug)]
pub struct ReceivingQueue {
    queue: VecDeque<Segment>,
    current_size: usize,
    expecting_seq: u64,
    acked_seq: u64,
    window: usize,
    window_scale: usize,
    remote_closed: bool,
}

impl ReceivingQueue {
    pub fn new(expecting_seq: u64) -> Self {
        Self {
            queue: VecDeque::new(),
            current_size: 0,
            expecting_seq,
            acked_seq: expecting_seq,
            window: RMEM_MAX,
            window_scale: RCV_WINDOW_SCALE,
            remote_closed: false,
        }
    }

    /// Consumes the sequence number of a remote FIN.
    pub fn inc_expecting_seq(&mut self) {
        if self.acked_seq != self.expecting_seq {
            warn!(
                expecting = self.expecting_seq,
                acked = self.acked_seq,
                "consuming FIN while data is still unread"
            );
        }
        self.expecting_seq += 1;
        self.acked_seq += 1;
    }

    pub fn set_initial_seq(&mut self, seq: u64) {
        if self.expecting_seq == 0 && self.acked_seq == 0 {
            self.expecting_seq = seq;
            self.acked_seq = seq;
        } else {
            warn!(
                expecting = self.expecting_seq,
                acked = self.acked_seq,
                "set_initial_seq called on an initialized queue"
            );
        }
    }

    pub(crate) fn set_remote_closed(&mut self, remote_closed: bool) {
        self.remote_closed = remote_closed;
    }

    pub fn has_more_data_to_read(&self) -> bool {
        !self.queue.is_empty()
    }

    /// Appends the part of `segment` at `expecting_seq`, cut to the advertised window.
    /// Returns `true` when bytes were stored.
    pub fn store(&mut self, segment: &Segment) -> bool {
        if self.remote_closed {
            debug!(?segment, "FIN received but still storing data");
            return false;
        }
        let room = self.window.min(RMEM_MAX.saturating_sub(self.current_size));
        if room == 0 {
            debug!(size = self.current_size, "receiving queue is full");
            return false;
        }
        if segment.seq_begin() > self.expecting_seq {
            debug!(?segment, expecting = self.expecting_seq, "gap in received data");
            return false;
        }
        if segment.seq_end() <= self.expecting_seq {
            debug!(?segment, expecting = self.expecting_seq, "duplicate segment");
            return false;
        }
        let skip = (self.expecting_seq - segment.seq_begin()) as usize;
        let len = (segment.len() - skip).min(room);
        if len < segment.len() - skip {
            debug!(?segment, room, "clamping data beyond the receive window");
        }
        let data = segment.data()[skip..skip + len].to_vec();
        self.queue.push_back(Segment::new(self.expecting_seq, data));
        self.expecting_seq += len as u64;
        self.current_size += len;
        self.window = self.window.saturating_sub(len);
        true
    }

    /// Reads up to `max_len` bytes in order.
    pub fn api_read(&mut self, max_len: usize) -> Vec<u8> {
        let max_len = max_len.min(self.current_size);
        let mut out = Vec::with_capacity(max_len);
        while out.len() < max_len {
            let front = match self.queue.pop_front() {
                Some(s) => s,
                None => break,
            };
            let want = max_len - out.len();
            if front.len() <= want {
                self.current_size -= front.len();
                self.acked_seq = front.seq_end();
                out.extend_from_slice(front.data());
            } else {
                let begin = front.seq_begin() + want as u64;
                let mut data = front.into_data();
                let rest = data.split_off(want);
                out.extend_from_slice(&data);
                self.current_size -= want;
                self.acked_seq = begin;
                self.queue.push_front(Segment::new(begin, rest));
            }
        }
        out
    }

    pub fn reset_window(&mut self) {
        self.window = RMEM_MAX.saturating_sub(self.current_size);
    }

    pub fn current_size(&self) -> usize {
        self.current_size
    }

    pub fn expecting_seq(&self) -> u64 {
        self.expecting_seq
    }

    pub fn acked_seq(&self) -> u64 {
        self.acked_seq
    }

    pub fn window(&self) -> usize {
        self.window
    }

    pub fn window_scale(&self) -> usize {
        self.window_scale
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seg(begin: u64, data: &[u8]) -> Segment {
        Segment::new(begin, data.to_vec())
    }

    #[test]
    fn stores_in_order_and_reads_back() {
        let mut q = ReceivingQueue::new(1000);
        assert!(q.store(&seg(1000, b"hello ")));
        assert!(q.store(&seg(1006, b"world")));
        assert_eq!(q.expecting_seq(), 1011);
        assert_eq!(q.window(), RMEM_MAX - 11);
        assert_eq!(q.api_read(100), b"hello world");
        assert_eq!(q.acked_seq(), 1011);
        assert!(!q.has_more_data_to_read());
    }

    #[test]
    fn rejects_gap_and_duplicate() {
        let mut q = ReceivingQueue::new(10);
        assert!(!q.store(&seg(11, b"x")));
        assert!(q.store(&seg(10, b"ab")));
        assert!(!q.store(&seg(10, b"ab")));
        assert!(!q.store(&seg(11, b"")));
        assert_eq!(q.current_size(), 2);
    }

    #[test]
    fn trims_overlap() {
        let mut q = ReceivingQueue::new(0);
        q.store(&seg(0, b"abc"));
        assert!(q.store(&seg(1, b"bcdef")));
        assert_eq!(q.api_read(10), b"abcdef");
    }

    #[test]
    fn partial_read_keeps_remainder() {
        let mut q = ReceivingQueue::new(0);
        q.store(&seg(0, b"abcdef"));
        assert_eq!(q.api_read(4), b"abcd");
        assert_eq!(q.acked_seq(), 4);
        assert_eq!(q.current_size(), 2);
        assert_eq!(q.api_read(4), b"ef");
        assert_eq!(q.acked_seq(), 6);
        assert!(q.api_read(4).is_empty());
    }

    #[test]
    fn refuses_after_remote_close() {
        let mut q = ReceivingQueue::new(0);
        q.set_remote_closed(true);
        assert!(!q.store(&seg(0, b"abc")));
    }

    #[test]
    fn window_floor_and_reset() {
        let mut q = ReceivingQueue::new(0);
        let big = vec![0u8; RMEM_MAX];
        assert!(q.store(&Segment::new(0, big)));
        assert_eq!(q.window(), 0);
        assert!(!q.store(&seg(RMEM_MAX as u64, b"z")));
        assert_eq!(q.current_size(), RMEM_MAX);
        assert_eq!(q.expecting_seq(), RMEM_MAX as u64);

        q.api_read(1000);
        q.reset_window();
        assert_eq!(q.window(), RMEM_MAX - q.current_size());
    }

    #[test]
    fn data_beyond_the_window_is_cut() {
        let mut q = ReceivingQueue::new(0);
        assert!(q.store(&Segment::new(0, vec![1u8; RMEM_MAX - 10])));
        assert_eq!(q.window(), 10);
        assert!(q.store(&Segment::new(RMEM_MAX as u64 - 10, vec![2u8; 100])));
        assert_eq!(q.current_size(), RMEM_MAX);
        assert_eq!(q.expecting_seq(), RMEM_MAX as u64);
        assert_eq!(q.window(), 0);

        // A window that was not reopened by a read also bounds the queue.
        q.api_read(100);
        assert!(!q.store(&seg(RMEM_MAX as u64, b"x")));
        q.reset_window();
        assert!(q.store(&Segment::new(RMEM_MAX as u64, vec![3u8; 500])));
        assert_eq!(q.current_size(), RMEM_MAX);
    }

    #[test]
    fn initial_seq_only_once() {
        let mut q = ReceivingQueue::new(0);
        q.set_initial_seq(77);
        assert_eq!(q.expecting_seq(), 77);
        q.set_initial_seq(5);
        assert_eq!(q.expecting_seq(), 77);
        q.inc_expecting_seq();
        assert_eq!((q.expecting_seq(), q.acked_seq()), (78, 78));
    }
}
