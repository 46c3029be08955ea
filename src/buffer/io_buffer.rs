//! Pooled byte buffer used for data-phase payloads.

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};

use crate::buffer::pool::BufferPoolInner;
use crate::buffer::reusable::Reusable;

/// A growable byte buffer whose storage can be handed back to a [`BufferPool`].
///
/// Freeing through [`Reusable::free`] recycles the storage. A buffer that is
/// simply dropped deallocates normally.
///
/// [`BufferPool`]: crate::buffer::BufferPool
pub struct IoBuffer {
    bytes: BytesMut,
    home: Option<Arc<BufferPoolInner>>,
}

impl IoBuffer {
    pub(crate) fn pooled(bytes: BytesMut, home: Arc<BufferPoolInner>) -> Self {
        Self {
            bytes,
            home: Some(home),
        }
    }

    /// A buffer with no pool behind it.
    pub fn detached(data: impl AsRef<[u8]>) -> Self {
        Self {
            bytes: BytesMut::from(data.as_ref()),
            home: None,
        }
    }

    pub fn capacity(&self) -> usize {
        self.bytes.capacity()
    }

    pub fn extend_from_slice(&mut self, data: &[u8]) {
        self.bytes.extend_from_slice(data);
    }

    /// Move all bytes of `other` to the end of `self`, leaving `other` empty.
    pub fn append(&mut self, other: &mut IoBuffer) {
        if self.bytes.is_empty() && self.bytes.capacity() < other.bytes.capacity() {
            std::mem::swap(&mut self.bytes, &mut other.bytes);
            return;
        }
        self.bytes.extend_from_slice(&other.bytes);
        other.bytes.clear();
    }

    /// Copy the readable bytes out, leaving the buffer empty but keeping its capacity.
    pub fn drain_to_bytes(&mut self) -> Bytes {
        let out = Bytes::copy_from_slice(&self.bytes);
        self.bytes.clear();
        out
    }

    /// Direct access to the storage, e.g. for `AsyncReadExt::read_buf`.
    pub fn bytes_mut(&mut self) -> &mut BytesMut {
        &mut self.bytes
    }

    pub fn is_pooled(&self) -> bool {
        self.home.is_some()
    }
}

impl Deref for IoBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.bytes
    }
}

impl DerefMut for IoBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.bytes
    }
}

impl fmt::Debug for IoBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IoBuffer")
            .field("len", &self.bytes.len())
            .field("capacity", &self.bytes.capacity())
            .field("pooled", &self.home.is_some())
            .finish()
    }
}

impl Reusable for IoBuffer {
    fn free(self: Box<Self>) {
        let IoBuffer { bytes, home } = *self;
        if let Some(pool) = home {
            pool.recycle(bytes);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_preserves_order() {
        let mut head = IoBuffer::detached(b"hello ");
        let mut tail = IoBuffer::detached(b"world");

        head.append(&mut tail);

        assert_eq!(&head[..], b"hello world");
        assert!(tail.is_empty());
    }

    #[test]
    fn test_append_into_empty_takes_storage() {
        let mut head = IoBuffer::detached(b"");
        let mut tail = IoBuffer::detached(b"payload");

        head.append(&mut tail);

        assert_eq!(&head[..], b"payload");
        assert!(tail.is_empty());
    }

    #[test]
    fn test_drain_keeps_capacity() {
        let mut buf = IoBuffer::detached(b"abc");
        let before = buf.capacity();

        let out = buf.drain_to_bytes();

        assert_eq!(&out[..], b"abc");
        assert!(buf.is_empty());
        assert_eq!(buf.capacity(), before);
    }
}
