//! Per-connection I/O buffer.
//!
//! Every connection owns two of these: the dispatcher appends received bytes
//! at the tail (reading directly into spare capacity), and protocol parsers
//! consume from the head with [`IoBuf::remove_head`] after a successful
//! parse. Growth is geometric and amortized; head removal keeps capacity.

use bytes::{Buf, BytesMut};

/// An appendable byte buffer with amortized-growth append and head removal.
///
/// Invariants: `len() <= capacity()`; append never truncates;
/// `remove_head(n)` with `n <= len()` leaves exactly the suffix `bytes[n..]`.
#[derive(Debug, Default)]
pub struct IoBuf {
    inner: BytesMut,
}

impl IoBuf {
    pub fn new() -> Self {
        Self {
            inner: BytesMut::new(),
        }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: BytesMut::with_capacity(capacity),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.inner.capacity()
    }

    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.inner
    }

    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.inner
    }

    /// Append bytes at the tail, growing capacity if needed.
    #[inline]
    pub fn append(&mut self, data: &[u8]) {
        self.inner.extend_from_slice(data);
    }

    /// Drop `n` bytes from the head.
    ///
    /// # Panics
    ///
    /// Panics if `n` exceeds `len()`.
    #[inline]
    pub fn remove_head(&mut self, n: usize) {
        self.inner.advance(n);
    }

    /// Ensure capacity for at least `additional` more bytes.
    #[inline]
    pub fn reserve(&mut self, additional: usize) {
        self.inner.reserve(additional);
    }

    /// Spare capacity available for writing without reallocation.
    #[inline]
    pub fn spare_capacity(&self) -> usize {
        self.inner.capacity() - self.inner.len()
    }

    /// The spare capacity as a writable slice.
    ///
    /// The dispatcher reads from the socket directly into this slice and then
    /// calls [`IoBuf::commit`] with the byte count. Call [`IoBuf::reserve`]
    /// first to guarantee the slice is large enough.
    #[inline]
    pub fn spare_mut(&mut self) -> &mut [u8] {
        let len = self.inner.len();
        let cap = self.inner.capacity();
        // Safety: the region between len and capacity is allocated; the
        // caller treats it as write-only until commit() sets the length.
        unsafe { std::slice::from_raw_parts_mut(self.inner.as_mut_ptr().add(len), cap - len) }
    }

    /// Commit `n` bytes written into the spare capacity.
    ///
    /// # Panics
    ///
    /// Panics if `n` exceeds the spare capacity.
    #[inline]
    pub fn commit(&mut self, n: usize) {
        assert!(n <= self.spare_capacity(), "commit beyond spare capacity");
        // Safety: the caller wrote `n` bytes into spare_mut().
        unsafe {
            self.inner.set_len(self.inner.len() + n);
        }
    }

    #[inline]
    pub fn clear(&mut self) {
        self.inner.clear();
    }
}
