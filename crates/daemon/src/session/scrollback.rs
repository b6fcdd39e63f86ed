//! Bounded replay buffer for session output.

use std::collections::VecDeque;

use bytes::Bytes;

/// Ring of the most recent `capacity` bytes a process produced.
///
/// Writes never fail; once full, the oldest bytes are discarded.
#[derive(Debug)]
pub struct OutputRing {
    buf: VecDeque<u8>,
    capacity: usize,
    total_written: u64,
    evicted: u64,
}

impl OutputRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: VecDeque::with_capacity(capacity),
            capacity,
            total_written: 0,
            evicted: 0,
        }
    }

    /// Appends a chunk, evicting the oldest bytes as needed.
    pub fn push(&mut self, chunk: &[u8]) {
        self.total_written += chunk.len() as u64;

        if self.capacity == 0 {
            self.evicted += chunk.len() as u64;
            return;
        }

        if chunk.len() >= self.capacity {
            self.evicted += (self.buf.len() + chunk.len() - self.capacity) as u64;
            self.buf.clear();
            self.buf.extend(&chunk[chunk.len() - self.capacity..]);
            return;
        }

        let overflow = (self.buf.len() + chunk.len()).saturating_sub(self.capacity);
        if overflow > 0 {
            self.buf.drain(..overflow);
            self.evicted += overflow as u64;
        }
        self.buf.extend(chunk);
    }

    /// Buffered bytes, oldest first.
    pub fn snapshot(&self) -> Bytes {
        let (front, back) = self.buf.as_slices();
        let mut out = Vec::with_capacity(self.buf.len());
        out.extend_from_slice(front);
        out.extend_from_slice(back);
        Bytes::from(out)
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes ever pushed, including evicted ones.
    pub fn total_written(&self) -> u64 {
        self.total_written
    }

    /// Bytes discarded to stay within capacity.
    pub fn evicted(&self) -> u64 {
        self.evicted
    }
}
