//! DMA-capable buffers and remote memory references.

use std::cell::UnsafeCell;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

struct DmaBufInner {
    buf: UnsafeCell<Box<[u8]>>,
}

// SAFETY: the buffer is written by at most one party at a time. One-sided
// fabric operations complete before the owner touches the bytes again, the
// same discipline real DMA-capable memory requires. Completions carry the
// necessary happens-before edges.
unsafe impl Send for DmaBufInner {}
unsafe impl Sync for DmaBufInner {}

/// A fixed-size buffer that the fabric can read and write directly, the
/// moral equivalent of DMA-capable memory. Cloning shares the allocation.
#[derive(Clone)]
pub struct DmaBuf {
    inner: Arc<DmaBufInner>,
}

impl DmaBuf {
    /// Allocate a zeroed buffer of `len` bytes.
    pub fn alloc(len: usize) -> Self {
        Self {
            inner: Arc::new(DmaBufInner {
                buf: UnsafeCell::new(vec![0u8; len].into_boxed_slice()),
            }),
        }
    }

    /// Allocate a buffer holding a copy of `content`.
    pub fn from_slice(content: &[u8]) -> Self {
        Self {
            inner: Arc::new(DmaBufInner {
                buf: UnsafeCell::new(content.to_vec().into_boxed_slice()),
            }),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        // SAFETY: the length is fixed at allocation and never mutated.
        unsafe { (&(*self.inner.buf.get())).len() }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy `len` bytes starting at `offset` out of the buffer.
    ///
    /// # Panics
    ///
    /// Panics if the range is out of bounds.
    pub fn read(&self, offset: usize, len: usize) -> Vec<u8> {
        assert!(offset + len <= self.len(), "read beyond buffer bounds");
        // SAFETY: bounds checked above; synchronization contract in the
        // Send/Sync impls.
        unsafe { (&(*self.inner.buf.get()))[offset..offset + len].to_vec() }
    }

    /// Copy `src` into the buffer starting at `offset`.
    ///
    /// # Panics
    ///
    /// Panics if the range is out of bounds.
    pub fn write(&self, offset: usize, src: &[u8]) {
        assert!(offset + src.len() <= self.len(), "write beyond buffer bounds");
        // SAFETY: bounds checked above; synchronization contract in the
        // Send/Sync impls.
        unsafe {
            (&mut (*self.inner.buf.get()))[offset..offset + src.len()].copy_from_slice(src);
        }
    }
}

impl fmt::Debug for DmaBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DmaBuf").field("len", &self.len()).finish()
    }
}

/// A reference to a registered remote memory window: everything one side
/// needs to hand the other for a one-sided read or write.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct RemoteMem {
    /// Remote key naming the window in the fabric's registry.
    pub rkey: u32,
    /// Base offset of usable bytes within the window. Always zero for
    /// windows produced by slot registration; kept on the wire so a
    /// sub-window can be referenced.
    pub offset: u64,
    /// Window length in bytes.
    pub len: u64,
}
