//! Contiguous-view single-producer/single-consumer byte queue.
//!
//! The readable region is always a single linear byte range regardless
//! of logical wrap-around, thanks to a mirrored virtual-memory mapping:
//! for a buffer of capacity `C`, the address range `[base, base+C)`
//! aliases the same physical pages as `[base+C, base+2C)`. A write that
//! wraps past `base+C` is still readable as one flat `&[u8]`.
//!
//! Grounded on `vmap::io::ring::Ring`/`InfiniteRing` for the
//! cursor/counter algebra, and `vmap::os::unix::posix::map_ring` for the
//! mirror allocation (see [`mmap`]).

mod mmap;

use crate::error::{Error, Operation, Result};
use std::cmp;

/// Initial capacity used the first time a [`RingBuffer`] allocates.
pub const DEFAULT_INITIAL_SIZE: usize = 1024 * 1024;

/// A mirrored-mapping ring buffer.
///
/// Not `Sync`: the contract (spec.md §4.A) is single-producer/single-
/// consumer, where the producer and consumer may be different threads
/// but never run concurrently against the same buffer. `acquire_write`/
/// `commit_write` are the producer-side operations; `acquire_read`/
/// `commit_read` are the consumer-side operations. Each side's counter
/// is written only by that side and merely read by the other, so a
/// `RingBuffer` may be freely handed across a thread boundary (`Send`)
/// as long as the caller upholds that split.
pub struct RingBuffer {
    base: Option<*mut u8>,
    capacity: usize,
    read_cursor: usize,
    write_cursor: usize,
    bytes_written: u64,
    bytes_read: u64,
    initial_size: usize,
}

unsafe impl Send for RingBuffer {}

impl RingBuffer {
    /// Creates an empty buffer. No mapping is allocated until the first
    /// write that needs space.
    pub fn new(initial_size: usize) -> Self {
        Self {
            base: None,
            capacity: 0,
            read_cursor: 0,
            write_cursor: 0,
            bytes_written: 0,
            bytes_read: 0,
            initial_size: cmp::max(initial_size, 1),
        }
    }

    /// Bytes currently queued for reading.
    pub fn available(&self) -> usize {
        self.bytes_written.wrapping_sub(self.bytes_read) as usize
    }

    /// Remaining room for writes without growing the mapping.
    pub fn free_space(&self) -> usize {
        self.capacity - self.available()
    }

    /// Current allocated capacity (0 before the first allocation).
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Total bytes ever committed by the producer (wraps at `u64::MAX`).
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Total bytes ever committed by the consumer (wraps at `u64::MAX`).
    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    /// Returns a linear region of at least `n` writable bytes starting at
    /// the write cursor, allocating or growing the mapping per the
    /// policy in spec.md §4.A. Fails with a recoverable
    /// [`Error::write_buffer_full`] when the buffer is non-empty and
    /// cannot satisfy the request without overwriting unread data.
    pub fn acquire_write(&mut self, n: usize) -> Result<&mut [u8]> {
        if self.capacity == 0 {
            self.allocate(mmap::round_up_to_page(cmp::max(self.initial_size, n)))?;
        } else if self.free_space() < n {
            if self.available() == 0 {
                self.reallocate(mmap::round_up_to_page(n))?;
            } else {
                return Err(Error::write_buffer_full(Operation::Write));
            }
        }

        let base = self.base.expect("capacity > 0 implies a mapping");
        // Safe: write_cursor < capacity and n <= capacity (guaranteed by
        // the branches above), so write_cursor + n <= 2*capacity, which
        // is within the mirrored mapping.
        let slice = unsafe {
            std::slice::from_raw_parts_mut(base.add(self.write_cursor), n)
        };
        Ok(slice)
    }

    /// Advances the write cursor by `n` (modulo capacity) and the
    /// `bytes_written` counter. `n` must not exceed the length most
    /// recently returned by `acquire_write`.
    pub fn commit_write(&mut self, n: usize) {
        debug_assert!(n <= self.capacity);
        self.write_cursor = (self.write_cursor + n) % cmp::max(self.capacity, 1);
        self.bytes_written = self.bytes_written.wrapping_add(n as u64);
    }

    /// Returns the current read pointer and fill level. The slice is
    /// always linearly addressable up to `capacity` bytes thanks to the
    /// mirror, regardless of whether the logical region wraps.
    pub fn acquire_read(&self) -> &[u8] {
        let Some(base) = self.base else { return &[] };
        let available = self.available();
        unsafe { std::slice::from_raw_parts(base.add(self.read_cursor), available) }
    }

    /// Advances the read cursor by `n` (modulo capacity) and the
    /// `bytes_read` counter. `n` must not exceed `available()`.
    pub fn commit_read(&mut self, n: usize) {
        debug_assert!(n <= self.available());
        if self.capacity > 0 {
            self.read_cursor = (self.read_cursor + n) % self.capacity;
        }
        self.bytes_read = self.bytes_read.wrapping_add(n as u64);
    }

    /// Zeroes cursors and counters; retains the mapping.
    pub fn reset(&mut self) {
        self.read_cursor = 0;
        self.write_cursor = 0;
        self.bytes_written = 0;
        self.bytes_read = 0;
    }

    /// Transfers all of `other`'s available bytes into `self` in a
    /// single memcpy, returning the number of bytes moved. Used by
    /// `Connection::copy_all_from` for proxy-style relays without
    /// double buffering.
    pub fn splice_from(&mut self, other: &mut RingBuffer) -> Result<usize> {
        let n = other.available();
        if n == 0 {
            return Ok(0);
        }
        let dst = self.acquire_write(n)?;
        dst.copy_from_slice(other.acquire_read());
        self.commit_write(n);
        other.commit_read(n);
        Ok(n)
    }

    fn allocate(&mut self, capacity: usize) -> Result<()> {
        debug_assert!(self.base.is_none());
        let ptr = unsafe { mmap::map_ring(capacity)? };
        self.base = Some(ptr);
        self.capacity = capacity;
        Ok(())
    }

    fn reallocate(&mut self, capacity: usize) -> Result<()> {
        debug_assert_eq!(self.available(), 0);
        if let Some(base) = self.base.take() {
            unsafe { mmap::unmap_ring(base, self.capacity)? };
        }
        self.capacity = 0;
        self.read_cursor = 0;
        self.write_cursor = 0;
        self.allocate(capacity)
    }
}

impl Drop for RingBuffer {
    fn drop(&mut self) {
        if let Some(base) = self.base.take() {
            unsafe { mmap::unmap_ring(base, self.capacity) }.unwrap_or_default();
        }
    }
}

impl std::fmt::Debug for RingBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingBuffer")
            .field("capacity", &self.capacity)
            .field("available", &self.available())
            .field("bytes_written", &self.bytes_written)
            .field("bytes_read", &self.bytes_read)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lazily_allocates_on_first_write() {
        let mut ring = RingBuffer::new(4096);
        assert_eq!(ring.capacity(), 0);
        let buf = ring.acquire_write(10).unwrap();
        buf[..5].copy_from_slice(b"hello");
        ring.commit_write(5);
        assert!(ring.capacity() >= mmap::round_up_to_page(4096));
        assert_eq!(ring.available(), 5);
        assert_eq!(&ring.acquire_read()[..5], b"hello");
    }

    #[test]
    fn round_trip_matches_written_bytes() {
        let mut ring = RingBuffer::new(mmap::page_size());
        let input = b"the quick brown fox jumps over the lazy dog";
        let buf = ring.acquire_write(input.len()).unwrap();
        buf[..input.len()].copy_from_slice(input);
        ring.commit_write(input.len());

        let read = ring.acquire_read();
        assert_eq!(&read[..input.len()], &input[..]);
        ring.commit_read(input.len());
        assert_eq!(ring.available(), 0);
    }

    #[test]
    fn wrap_around_is_linearly_addressable() {
        let page = mmap::page_size();
        let mut ring = RingBuffer::new(page);
        ring.acquire_write(1).unwrap();
        ring.commit_write(0); // force allocation at page size without filling

        let cap = ring.capacity();
        // Fill to cap - 2, drain all but 2 bytes, then write cap bytes so
        // the write wraps across the boundary.
        let filler = vec![b'a'; cap - 2];
        {
            let buf = ring.acquire_write(filler.len()).unwrap();
            buf.copy_from_slice(&filler);
        }
        ring.commit_write(filler.len());
        ring.commit_read(cap - 4);

        assert_eq!(ring.available(), 2);
        let wrap_bytes: Vec<u8> = (0..cap).map(|i| (i % 256) as u8).collect();
        {
            let buf = ring.acquire_write(cap - 2).unwrap();
            buf.copy_from_slice(&wrap_bytes[..cap - 2]);
        }
        ring.commit_write(cap - 2);

        assert_eq!(ring.available(), cap);
        let read = ring.acquire_read();
        assert_eq!(read.len(), cap);
        assert_eq!(&read[2..], &wrap_bytes[..cap - 2]);
    }

    #[test]
    fn full_nonempty_write_fails_with_recoverable_error() {
        let mut ring = RingBuffer::new(mmap::page_size());
        let cap = {
            let buf = ring.acquire_write(1).unwrap();
            buf[0] = 1;
            ring.commit_write(1);
            ring.capacity()
        };

        let err = ring.acquire_write(cap).unwrap_err();
        assert!(err.is_write_buffer_full());
    }

    #[test]
    fn resizes_in_place_when_empty() {
        let mut ring = RingBuffer::new(mmap::page_size());
        let _ = ring.acquire_write(1).unwrap();
        let small_cap = ring.capacity();

        let big = vec![b'x'; small_cap * 3];
        let buf = ring.acquire_write(big.len()).unwrap();
        buf.copy_from_slice(&big);
        ring.commit_write(big.len());

        assert!(ring.capacity() >= big.len());
        assert_eq!(ring.available(), big.len());
    }

    #[test]
    fn splice_from_moves_all_available_bytes() {
        let mut src = RingBuffer::new(mmap::page_size());
        let mut dst = RingBuffer::new(mmap::page_size());

        let payload = b"relay payload";
        let buf = src.acquire_write(payload.len()).unwrap();
        buf.copy_from_slice(payload);
        src.commit_write(payload.len());

        let n = dst.splice_from(&mut src).unwrap();
        assert_eq!(n, payload.len());
        assert_eq!(src.available(), 0);
        assert_eq!(dst.acquire_read(), payload);
    }

    #[test]
    fn reset_zeroes_cursors_but_keeps_mapping() {
        let mut ring = RingBuffer::new(mmap::page_size());
        let buf = ring.acquire_write(4).unwrap();
        buf.copy_from_slice(b"data");
        ring.commit_write(4);
        let cap = ring.capacity();

        ring.reset();
        assert_eq!(ring.available(), 0);
        assert_eq!(ring.capacity(), cap);
    }
}
