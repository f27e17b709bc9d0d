use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::errors::GroupByError;

const ORDERING: Ordering = Ordering::SeqCst;

/// Fixed-capacity device memory. Every `DeviceBuffer` holds a reservation on the
/// pool it was allocated from and returns it when dropped.
#[derive(Debug)]
pub struct MemoryPool {
    capacity: usize,
    allocated: AtomicUsize,
    peak: AtomicUsize,
    live_buffers: AtomicUsize,
}

impl MemoryPool {
    pub fn new(capacity: usize) -> Arc<MemoryPool> {
        Arc::new(MemoryPool {
            capacity,
            allocated: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            live_buffers: AtomicUsize::new(0),
        })
    }

    pub fn allocate(self: &Arc<Self>, name: &'static str, len: usize) -> Result<DeviceBuffer, GroupByError> {
        let capacity = self.capacity;
        let reserved = self.allocated.fetch_update(ORDERING, ORDERING, |allocated| {
            allocated.checked_add(len).filter(|&total| total <= capacity)
        });
        match reserved {
            Ok(before) => {
                self.peak.fetch_max(before + len, ORDERING);
                self.live_buffers.fetch_add(1, ORDERING);
            }
            Err(allocated) => {
                return Err(GroupByError::Allocation {
                    buffer: name,
                    requested: len,
                    available: capacity.saturating_sub(allocated),
                });
            }
        }
        let words = (0..len.div_ceil(8)).map(|_| AtomicU64::new(0)).collect();
        Ok(DeviceBuffer {
            name,
            len,
            words,
            pool: self.clone(),
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn allocated_bytes(&self) -> usize {
        self.allocated.load(ORDERING)
    }

    pub fn peak_bytes(&self) -> usize {
        self.peak.load(ORDERING)
    }

    pub fn live_buffers(&self) -> usize {
        self.live_buffers.load(ORDERING)
    }

    fn release(&self, len: usize) {
        self.allocated.fetch_sub(len, ORDERING);
        self.live_buffers.fetch_sub(1, ORDERING);
    }
}

/// Byte-addressable device allocation backed by atomic 64-bit words.
///
/// Sub-word writes use masked `fetch_and`/`fetch_or` pairs, so lanes writing
/// disjoint byte ranges of the same word never lose each other's updates.
/// Values are little-endian.
pub struct DeviceBuffer {
    name: &'static str,
    len: usize,
    words: Box<[AtomicU64]>,
    pool: Arc<MemoryPool>,
}

impl DeviceBuffer {
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn word_count(&self) -> usize {
        self.words.len()
    }

    pub(crate) fn word(&self, index: usize) -> &AtomicU64 {
        &self.words[index]
    }

    pub(crate) fn words(&self, first: usize, count: usize) -> &[AtomicU64] {
        &self.words[first..first + count]
    }

    pub(crate) fn belongs_to(&self, pool: &Arc<MemoryPool>) -> bool {
        Arc::ptr_eq(&self.pool, pool)
    }

    /// Loads `size <= 8` bytes starting at `offset`, zero-extended.
    #[inline]
    pub fn load(&self, offset: usize, size: usize) -> u64 {
        debug_assert!(size <= 8 && offset + size <= self.len);
        if size == 0 {
            return 0;
        }
        let word = offset / 8;
        let shift = (offset % 8) * 8;
        let mut value = self.words[word].load(Ordering::Relaxed) >> shift;
        if shift != 0 && shift + size * 8 > 64 {
            value |= self.words[word + 1].load(Ordering::Relaxed) << (64 - shift);
        }
        if size == 8 {
            value
        } else {
            value & ((1u64 << (size * 8)) - 1)
        }
    }

    /// Stores the low `size <= 8` bytes of `value` at `offset`.
    #[inline]
    pub fn store(&self, offset: usize, size: usize, value: u64) {
        debug_assert!(size <= 8 && offset + size <= self.len);
        if size == 0 {
            return;
        }
        let bits = size * 8;
        let mask = if bits == 64 { u64::MAX } else { (1u64 << bits) - 1 };
        let value = value & mask;
        let word = offset / 8;
        let shift = (offset % 8) * 8;
        if shift == 0 && bits == 64 {
            self.words[word].store(value, Ordering::Relaxed);
            return;
        }
        self.words[word].fetch_and(!(mask << shift), Ordering::Relaxed);
        self.words[word].fetch_or(value << shift, Ordering::Relaxed);
        if shift != 0 && shift + bits > 64 {
            let spill = 64 - shift;
            self.words[word + 1].fetch_and(!(mask >> spill), Ordering::Relaxed);
            self.words[word + 1].fetch_or(value >> spill, Ordering::Relaxed);
        }
    }

    pub(crate) fn read_into(&self, offset: usize, dst: &mut [u8]) {
        for (i, chunk) in dst.chunks_mut(8).enumerate() {
            let value = self.load(offset + i * 8, chunk.len());
            chunk.copy_from_slice(&value.to_le_bytes()[..chunk.len()]);
        }
    }

    pub(crate) fn write_from(&self, offset: usize, src: &[u8]) {
        for (i, chunk) in src.chunks(8).enumerate() {
            let mut bytes = [0u8; 8];
            bytes[..chunk.len()].copy_from_slice(chunk);
            self.store(offset + i * 8, chunk.len(), u64::from_le_bytes(bytes));
        }
    }

    pub(crate) fn copy_to(&self, src_offset: usize, dst: &DeviceBuffer, dst_offset: usize, len: usize) {
        let mut copied = 0;
        while copied < len {
            let size = (len - copied).min(8);
            let value = self.load(src_offset + copied, size);
            dst.store(dst_offset + copied, size, value);
            copied += size;
        }
    }
}

impl Drop for DeviceBuffer {
    fn drop(&mut self) {
        self.pool.release(self.len);
    }
}

impl fmt::Debug for DeviceBuffer {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "DeviceBuffer({}, {} bytes)", self.name, self.len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocation_is_bounded_and_released() {
        let pool = MemoryPool::new(64);
        assert_eq!(pool.capacity(), 64);
        let a = pool.allocate("a", 40).unwrap();
        assert!(!a.is_empty());
        assert!(pool.allocate("empty", 0).unwrap().is_empty());
        assert_eq!(pool.allocated_bytes(), 40);
        match pool.allocate("b", 32) {
            Err(GroupByError::Allocation { buffer, requested, available }) => {
                assert_eq!((buffer, requested, available), ("b", 32, 24));
            }
            other => panic!("expected allocation error, got {:?}", other),
        }
        drop(a);
        assert_eq!(pool.allocated_bytes(), 0);
        assert_eq!(pool.live_buffers(), 0);
        assert_eq!(pool.peak_bytes(), 40);
        let _b = pool.allocate("b", 32).unwrap();
        assert_eq!(pool.live_buffers(), 1);
    }

    #[test]
    fn test_unaligned_access_straddles_words() {
        let pool = MemoryPool::new(1024);
        let buffer = pool.allocate("content", 24).unwrap();
        buffer.store(6, 4, 0xdead_beef);
        buffer.store(3, 1, 0x7f);
        buffer.store(10, 8, 0x0102_0304_0506_0708);
        assert_eq!(buffer.load(6, 4), 0xdead_beef);
        assert_eq!(buffer.load(3, 1), 0x7f);
        assert_eq!(buffer.load(10, 8), 0x0102_0304_0506_0708);
        let mut bytes = vec![0u8; 4];
        buffer.read_into(6, &mut bytes);
        assert_eq!(bytes, vec![0xef, 0xbe, 0xad, 0xde]);
    }

    #[test]
    fn test_copy_between_buffers() {
        let pool = MemoryPool::new(1024);
        let src = pool.allocate("src", 19).unwrap();
        let dst = pool.allocate("dst", 32).unwrap();
        let data: Vec<u8> = (1..=19).collect();
        src.write_from(0, &data);
        src.copy_to(0, &dst, 5, 19);
        let mut out = vec![0u8; 19];
        dst.read_into(5, &mut out);
        assert_eq!(out, data);
        assert_eq!(dst.load(0, 5), 0);
    }
}
