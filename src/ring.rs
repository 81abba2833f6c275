//! Multi-chunk ring allocator staging inbound messages between the
//! completion dispatcher and the bottom-half worker pool.
//!
//! The ring is a fixed number of fixed-size chunks arranged as a logical
//! circle. Each record is a (reclaim, size) header followed by its payload,
//! 64-byte aligned. Records may be released out of order; the read cursor
//! only advances over consecutively reclaimable records in arrival order, so
//! space accounting never passes an unreclaimed record.

use std::cell::UnsafeCell;
use std::collections::HashMap;
use std::sync::Arc;
use std::{fmt, ptr, slice};

use parking_lot::Mutex;

/// Record alignment unit.
pub const RB_ALIGN: usize = 64;

/// Default number of chunks.
pub const RB_NR_CHUNKS: usize = 8;

/// Default chunk size in bytes.
pub const RB_CHUNK_SIZE: usize = 64 * 1024;

/// Logical footprint of one record header in the space accounting.
const RB_HDR: usize = 8;

#[inline]
const fn align_up(x: usize) -> usize {
    (x + RB_ALIGN - 1) & !(RB_ALIGN - 1)
}

struct RecHdr {
    reclaim: bool,
    /// Payload footprint, excluding the header, trailer bytes absorbed.
    size: usize,
}

struct RingState {
    head_chunk: usize,
    tail_chunk: usize,
    /// Read cursor offset within `head_chunk`.
    head: usize,
    /// Write cursor offset within `tail_chunk`.
    tail: usize,
    /// Number of laps the write cursor is ahead of the read cursor.
    wraparound: usize,
    /// Record headers keyed by (chunk, header offset).
    headers: HashMap<(usize, usize), RecHdr>,
    peak_usage: usize,
}

struct RingInner {
    nr_chunks: usize,
    chunk_size: usize,
    chunks: Vec<Box<[UnsafeCell<u8>]>>,
    state: Mutex<RingState>,
}

// SAFETY: chunk bytes are only accessed through `RingRecord`s, and a record's
// region belongs exclusively to that record between acquisition and release.
unsafe impl Send for RingInner {}
unsafe impl Sync for RingInner {}

/// The ring allocator handle. Cheap to clone; all clones share one ring.
#[derive(Clone)]
pub struct RingBuffer {
    inner: Arc<RingInner>,
}

impl fmt::Debug for RingBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RingBuffer")
            .field("nr_chunks", &self.inner.nr_chunks)
            .field("chunk_size", &self.inner.chunk_size)
            .field("usage", &self.usage())
            .finish()
    }
}

impl RingBuffer {
    /// Create a ring of `nr_chunks` chunks of `chunk_size` bytes each.
    ///
    /// # Panics
    ///
    /// If `chunk_size` is not a positive multiple of [`RB_ALIGN`].
    pub fn new(nr_chunks: usize, chunk_size: usize) -> Self {
        assert!(nr_chunks > 0);
        assert!(chunk_size > 0 && chunk_size % RB_ALIGN == 0);
        let chunks = (0..nr_chunks)
            .map(|_| {
                (0..chunk_size)
                    .map(|_| UnsafeCell::new(0u8))
                    .collect::<Vec<_>>()
                    .into_boxed_slice()
            })
            .collect();
        Self {
            inner: Arc::new(RingInner {
                nr_chunks,
                chunk_size,
                chunks,
                state: Mutex::new(RingState {
                    head_chunk: 0,
                    tail_chunk: 0,
                    head: 0,
                    tail: 0,
                    wraparound: 0,
                    headers: HashMap::new(),
                    peak_usage: 0,
                }),
            }),
        }
    }

    /// Total capacity in bytes.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.inner.nr_chunks * self.inner.chunk_size
    }

    /// Carve a record of at least `size` payload bytes.
    ///
    /// Returns `None` when the space between the write cursor and the read
    /// cursor is insufficient, i.e. the ring is full relative to outstanding
    /// unreclaimed records.
    pub fn acquire(&self, size: usize) -> Option<RingRecord> {
        let requested = size;
        let size = align_up(RB_HDR + size) - RB_HDR;
        if RB_HDR + size > self.inner.chunk_size {
            return None;
        }

        let mut st = self.inner.state.lock();
        let chunk_size = self.inner.chunk_size;

        if st.tail + RB_HDR + size > chunk_size {
            // The record does not fit in the current chunk. The remainder is
            // only ours to terminate if the read cursor is not in it.
            if st.wraparound > 0 && st.head_chunk == st.tail_chunk {
                return None;
            }
            let term = RecHdr {
                reclaim: true,
                size: chunk_size - (st.tail + RB_HDR),
            };
            let key = (st.tail_chunk, st.tail);
            st.headers.insert(key, term);
            self.advance_tail_chunk(&mut st);
        }

        // Is the ring full?
        if st.wraparound > 0 && st.head_chunk == st.tail_chunk && st.tail + RB_HDR + size > st.head
        {
            return None;
        }

        let hdr_chunk = st.tail_chunk;
        let hdr_off = st.tail;
        let payload_off = hdr_off + RB_HDR;
        st.tail += RB_HDR + size;

        let mut rec_size = size;
        if st.tail + align_up(RB_HDR) >= chunk_size {
            // Skip the small trailer: absorb it into this record.
            rec_size += chunk_size - st.tail;
            self.advance_tail_chunk(&mut st);
        }
        st.headers.insert(
            (hdr_chunk, hdr_off),
            RecHdr {
                reclaim: false,
                size: rec_size,
            },
        );

        let used = self.usage_locked(&st);
        st.peak_usage = st.peak_usage.max(used);

        Some(RingRecord {
            ring: self.clone(),
            chunk: hdr_chunk,
            hdr_off,
            payload_off,
            len: requested,
        })
    }

    fn advance_tail_chunk(&self, st: &mut RingState) {
        st.tail_chunk += 1;
        if st.tail_chunk == self.inner.nr_chunks {
            st.tail_chunk = 0;
            st.wraparound += 1;
        }
        st.tail = 0;
    }

    /// Mark a record reclaimable and sweep the read cursor forward over
    /// consecutively reclaimable records, in arrival order.
    fn release(&self, chunk: usize, hdr_off: usize) {
        let mut st = self.inner.state.lock();
        let hdr = st
            .headers
            .get_mut(&(chunk, hdr_off))
            .expect("released a record the ring does not own");
        assert!(!hdr.reclaim, "ring record reclaimed twice");
        hdr.reclaim = true;

        let chunk_size = self.inner.chunk_size;
        loop {
            if st.wraparound == 0 && st.head_chunk == st.tail_chunk && st.head == st.tail {
                break;
            }
            let key = (st.head_chunk, st.head);
            match st.headers.get(&key) {
                Some(h) if h.reclaim => {
                    let size = h.size;
                    st.headers.remove(&key);
                    st.head += RB_HDR + size;
                    debug_assert!(st.head <= chunk_size);
                    if st.head == chunk_size {
                        st.head_chunk += 1;
                        if st.head_chunk == self.inner.nr_chunks {
                            st.head_chunk = 0;
                            st.wraparound -= 1;
                        }
                        st.head = 0;
                    }
                }
                _ => break,
            }
        }
    }

    fn usage_locked(&self, st: &RingState) -> usize {
        let chunk_size = self.inner.chunk_size;
        if st.head_chunk == st.tail_chunk {
            if st.wraparound == 0 {
                st.tail - st.head
            } else {
                self.capacity() - (st.head - st.tail)
            }
        } else {
            (chunk_size - st.head)
                + st.tail
                + ((st.tail_chunk + st.wraparound * self.inner.nr_chunks) - st.head_chunk - 1)
                    * chunk_size
        }
    }

    /// Bytes currently held by unreclaimed records (terminators included).
    pub fn usage(&self) -> usize {
        let st = self.inner.state.lock();
        self.usage_locked(&st)
    }

    /// Highest usage observed so far.
    pub fn peak_usage(&self) -> usize {
        self.inner.state.lock().peak_usage
    }
}

impl Default for RingBuffer {
    /// A ring of [`RB_NR_CHUNKS`] chunks of [`RB_CHUNK_SIZE`] bytes each.
    fn default() -> Self {
        Self::new(RB_NR_CHUNKS, RB_CHUNK_SIZE)
    }
}

/// One record carved from the ring. The payload region belongs exclusively to
/// this record until it is dropped, which releases it back to the ring.
pub struct RingRecord {
    ring: RingBuffer,
    chunk: usize,
    hdr_off: usize,
    payload_off: usize,
    len: usize,
}

// SAFETY: the record's payload region is not aliased by the ring or any other
// record between acquisition and release.
unsafe impl Send for RingRecord {}
unsafe impl Sync for RingRecord {}

impl RingRecord {
    #[inline]
    fn payload_ptr(&self) -> *mut u8 {
        self.ring.inner.chunks[self.chunk][self.payload_off].get()
    }

    /// Usable payload length (the size requested at acquisition).
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: the region is exclusively owned by this record and within
        // one chunk by construction.
        unsafe { slice::from_raw_parts(self.payload_ptr(), self.len) }
    }

    /// Copy `src` into the record. `src` must not exceed the record length.
    pub fn copy_from_slice(&mut self, src: &[u8]) {
        assert!(src.len() <= self.len);
        // SAFETY: same region argument as `as_slice`, and `&mut self` makes
        // this the only accessor.
        unsafe { ptr::copy_nonoverlapping(src.as_ptr(), self.payload_ptr(), src.len()) };
    }
}

impl Drop for RingRecord {
    fn drop(&mut self) {
        self.ring.release(self.chunk, self.hdr_off);
    }
}

impl fmt::Debug for RingRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RingRecord")
            .field("chunk", &self.chunk)
            .field("offset", &self.payload_off)
            .field("len", &self.len)
            .finish()
    }
}
