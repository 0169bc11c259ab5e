use std::{cell::Cell, fmt, rc::Rc};

use bytes::Bytes;

/// Counters over every memblock created against one statistics handle.
///
/// Streams allocate audio payloads at a high rate; the counters make leaks
/// and runaway queueing observable without walking any structure.
#[derive(Clone, Default)]
pub struct MemblockStat {
    inner: Rc<StatInner>,
}

#[derive(Default)]
struct StatInner {
    live_blocks: Cell<usize>,
    live_bytes: Cell<usize>,
    total_blocks: Cell<u64>,
    total_bytes: Cell<u64>,
}

impl MemblockStat {
    pub fn new() -> Self {
        Self::default()
    }

    fn add(&self, len: usize) {
        let i = &self.inner;
        i.live_blocks.set(i.live_blocks.get() + 1);
        i.live_bytes.set(i.live_bytes.get() + len);
        i.total_blocks.set(i.total_blocks.get() + 1);
        i.total_bytes.set(i.total_bytes.get() + len as u64);
    }

    fn remove(&self, len: usize) {
        let i = &self.inner;
        i.live_blocks.set(i.live_blocks.get() - 1);
        i.live_bytes.set(i.live_bytes.get() - len);
    }

    pub fn live_blocks(&self) -> usize {
        self.inner.live_blocks.get()
    }

    pub fn live_bytes(&self) -> usize {
        self.inner.live_bytes.get()
    }

    pub fn total_blocks(&self) -> u64 {
        self.inner.total_blocks.get()
    }

    pub fn total_bytes(&self) -> u64 {
        self.inner.total_bytes.get()
    }
}

struct BlockInner {
    data: Bytes,
    silence: Cell<bool>,
    stat: Option<MemblockStat>,
}

impl Drop for BlockInner {
    fn drop(&mut self) {
        if let Some(stat) = &self.stat {
            stat.remove(self.data.len());
        }
    }
}

/// An immutable, reference-counted region of audio bytes.
///
/// Contents are fixed at construction and never mutated afterwards, so any
/// number of views may alias the block. Access goes through
/// [`as_slice`](Self::as_slice); the borrow is the acquire/release bracket.
#[derive(Clone)]
pub struct Memblock {
    inner: Rc<BlockInner>,
}

impl Memblock {
    fn wrap(data: Bytes, stat: Option<&MemblockStat>) -> Self {
        if let Some(stat) = stat {
            stat.add(data.len());
        }
        Self {
            inner: Rc::new(BlockInner {
                data,
                silence: Cell::new(false),
                stat: stat.cloned(),
            }),
        }
    }

    /// Copies `data` into freshly owned storage.
    pub fn new_copied(data: &[u8], stat: Option<&MemblockStat>) -> Self {
        Self::wrap(Bytes::copy_from_slice(data), stat)
    }

    /// Takes ownership of an existing allocation without copying.
    pub fn from_vec(data: Vec<u8>, stat: Option<&MemblockStat>) -> Self {
        Self::wrap(Bytes::from(data), stat)
    }

    /// Wraps caller-owned storage; `owner` is dropped (releasing the
    /// storage) when the last reference to the block goes away.
    pub fn from_owner<T>(owner: T, stat: Option<&MemblockStat>) -> Self
    where
        T: AsRef<[u8]> + Send + 'static,
    {
        Self::wrap(Bytes::from_owner(owner), stat)
    }

    /// A block of `len` zero bytes, pre-marked as silence.
    pub fn new_silence(len: usize, stat: Option<&MemblockStat>) -> Self {
        let b = Self::wrap(Bytes::from(vec![0u8; len]), stat);
        b.inner.silence.set(true);
        b
    }

    pub fn len(&self) -> usize {
        self.inner.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.data.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.inner.data
    }

    /// Marks the block as silence so downstream mixing may skip it.
    pub fn mark_silence(&self) {
        self.inner.silence.set(true);
    }

    pub fn is_silence(&self) -> bool {
        self.inner.silence.get()
    }

    pub fn ref_count(&self) -> usize {
        Rc::strong_count(&self.inner)
    }
}

impl fmt::Debug for Memblock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Memblock")
            .field("len", &self.len())
            .field("silence", &self.is_silence())
            .field("refs", &self.ref_count())
            .finish()
    }
}

/// A view into part of a memblock. Many chunks may alias one block.
#[derive(Clone, Debug)]
pub struct Memchunk {
    pub block: Memblock,
    pub index: usize,
    pub length: usize,
}

impl Memchunk {
    /// A view over the whole block.
    pub fn from_block(block: Memblock) -> Self {
        let length = block.len();
        Self { block, index: 0, length }
    }

    pub fn new(block: Memblock, index: usize, length: usize) -> Self {
        debug_assert!(index + length <= block.len());
        Self { block, index, length }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.block.as_slice()[self.index..self.index + self.length]
    }

    /// Narrows the view by dropping `n` bytes from the front.
    pub fn consume(&mut self, n: usize) {
        debug_assert!(n <= self.length);
        self.index += n;
        self.length -= n;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    };

    use super::*;

    #[test]
    fn stat_tracks_live_blocks_and_bytes() {
        let stat = MemblockStat::new();
        let a = Memblock::new_copied(&[0u8; 100], Some(&stat));
        let b = Memblock::from_vec(vec![0u8; 50], Some(&stat));
        assert_eq!(stat.live_blocks(), 2);
        assert_eq!(stat.live_bytes(), 150);

        // Clones share the block and do not count again.
        let a2 = a.clone();
        assert_eq!(stat.live_blocks(), 2);

        drop(a);
        assert_eq!(stat.live_blocks(), 2, "still referenced by a clone");
        drop(a2);
        drop(b);
        assert_eq!(stat.live_blocks(), 0);
        assert_eq!(stat.live_bytes(), 0);
        assert_eq!(stat.total_blocks(), 2);
        assert_eq!(stat.total_bytes(), 150);
    }

    #[test]
    fn owner_released_on_last_drop() {
        struct Owner(Vec<u8>, Arc<AtomicBool>);
        impl AsRef<[u8]> for Owner {
            fn as_ref(&self) -> &[u8] {
                &self.0
            }
        }
        impl Drop for Owner {
            fn drop(&mut self) {
                self.1.store(true, Ordering::SeqCst);
            }
        }

        let released = Arc::new(AtomicBool::new(false));
        let block = Memblock::from_owner(Owner(vec![1, 2, 3], Arc::clone(&released)), None);
        let clone = block.clone();
        assert_eq!(clone.as_slice(), [1, 2, 3]);

        drop(block);
        assert!(!released.load(Ordering::SeqCst));
        drop(clone);
        assert!(released.load(Ordering::SeqCst));
    }

    #[test]
    fn chunk_views_alias_one_block() {
        let block = Memblock::new_copied(b"abcdef", None);
        let left = Memchunk::new(block.clone(), 0, 3);
        let right = Memchunk::new(block.clone(), 3, 3);
        assert_eq!(left.as_slice(), b"abc");
        assert_eq!(right.as_slice(), b"def");
        assert_eq!(block.ref_count(), 3);

        let mut c = Memchunk::from_block(block);
        c.consume(4);
        assert_eq!(c.as_slice(), b"ef");
    }
}
