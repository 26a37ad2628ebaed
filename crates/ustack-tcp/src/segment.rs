/// A contiguous run of stream bytes starting at `seq_begin`.
///
/// Segments are immutable; queues split them by building new ones.
#[derive(Clone, PartialEq, Eq)]
pub struct Segment {
    seq_begin: u64,
    data: Vec<u8>,
}

impl Segment {
    pub fn new(seq_begin: u64, data: Vec<u8>) -> Self {
        Self { seq_begin, data }
    }

    pub fn seq_begin(&self) -> u64 {
        self.seq_begin
    }

    /// Exclusive end.
    pub fn seq_end(&self) -> u64 {
        self.seq_begin + self.data.len() as u64
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn into_data(self) -> Vec<u8> {
        self.data
    }
}

impl core::fmt::Debug for Segment {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Segment")
            .field("seq", &(self.seq_begin..self.seq_end()))
            .field("len", &self.data.len())
            .finish()
    }
}
