use std::collections::VecDeque;

use crate::memblock::Memchunk;

/// Bounded FIFO of audio views with the four flow-control watermarks.
///
/// `maxlength` is the hard cap, `tlength` the target fill the peer keeps
/// topped up, `prebuf` the fill required before a reader may dequeue, and
/// `minreq` the smallest refill worth asking for. While the queue is in the
/// prebuffer state nothing can be read; the state clears once the fill
/// reaches `prebuf` and can be re-armed explicitly.
#[derive(Debug)]
pub struct Memblockq {
    chunks: VecDeque<Memchunk>,
    length: usize,
    maxlength: usize,
    tlength: usize,
    prebuf: usize,
    minreq: usize,
    in_prebuf: bool,
}

impl Memblockq {
    pub fn new(maxlength: usize, tlength: usize, prebuf: usize, minreq: usize) -> Self {
        let tlength = tlength.min(maxlength).max(1);
        let prebuf = prebuf.min(tlength);
        Self {
            chunks: VecDeque::new(),
            length: 0,
            maxlength,
            tlength,
            prebuf,
            minreq: minreq.max(1),
            in_prebuf: prebuf > 0,
        }
    }

    /// Appends a chunk; refuses it when the hard cap would be exceeded.
    pub fn push(&mut self, chunk: Memchunk) -> Result<(), Memchunk> {
        if chunk.length == 0 || self.length + chunk.length > self.maxlength {
            return Err(chunk);
        }
        self.length += chunk.length;
        self.chunks.push_back(chunk);
        if self.in_prebuf && self.length >= self.prebuf {
            self.in_prebuf = false;
        }
        Ok(())
    }

    /// The chunk a reader would consume next, `None` while empty or
    /// prebuffering.
    pub fn peek(&self) -> Option<&Memchunk> {
        if self.in_prebuf {
            return None;
        }
        self.chunks.front()
    }

    /// Discards `n` bytes from the front, splitting a chunk if needed.
    /// No-op while prebuffering.
    pub fn drop_bytes(&mut self, mut n: usize) {
        if self.in_prebuf {
            return;
        }
        while n > 0 {
            let Some(front) = self.chunks.front_mut() else { break };
            if front.length > n {
                front.consume(n);
                self.length -= n;
                return;
            }
            n -= front.length;
            self.length -= front.length;
            self.chunks.pop_front();
        }
    }

    pub fn length(&self) -> usize {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Bytes worth requesting from the writer: the shortfall below
    /// `tlength`, suppressed while it is smaller than `minreq`.
    pub fn missing(&self) -> usize {
        let shortfall = self.tlength.saturating_sub(self.length);
        if shortfall < self.minreq { 0 } else { shortfall }
    }

    /// Re-enters the prebuffer state.
    pub fn prebuf(&mut self) {
        if self.prebuf > 0 && self.length < self.prebuf {
            self.in_prebuf = true;
        }
    }

    pub fn is_prebuffering(&self) -> bool {
        self.in_prebuf
    }
}
