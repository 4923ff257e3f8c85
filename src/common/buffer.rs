//! BufferPool - reusable byte buffers with scoped return
//!
//! A pool is an ordinary value: construct one, clone it into whatever needs
//! scratch space (frame reader, frame writer, socket bridge). Nothing here is
//! process-global, so tests can size or swap pools freely.

use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use bytes::BytesMut;
use parking_lot::Mutex;

/// Default buffer size (8KB, one stream chunk)
pub const DEFAULT_BUFFER_SIZE: usize = 8 * 1024;

/// Default number of idle buffers kept around
const DEFAULT_MAX_RETAINED: usize = 64;

struct PoolInner {
    buffer_size: usize,
    max_retained: usize,
    free: Mutex<Vec<BytesMut>>,
}

/// Pool of equally sized `BytesMut` buffers.
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

impl BufferPool {
    pub fn new(buffer_size: usize, max_retained: usize) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                buffer_size,
                max_retained,
                free: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Size of the buffers handed out by this pool
    pub fn buffer_size(&self) -> usize {
        self.inner.buffer_size
    }

    /// Take an empty buffer with at least `buffer_size` capacity.
    pub fn acquire(&self) -> PooledBuf {
        let buf = self
            .inner
            .free
            .lock()
            .pop()
            .unwrap_or_else(|| BytesMut::with_capacity(self.inner.buffer_size));

        PooledBuf {
            buf: Some(buf),
            pool: Arc::clone(&self.inner),
        }
    }

    /// Number of idle buffers currently held
    pub fn idle(&self) -> usize {
        self.inner.free.lock().len()
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER_SIZE, DEFAULT_MAX_RETAINED)
    }
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPool")
            .field("buffer_size", &self.inner.buffer_size)
            .field("idle", &self.idle())
            .finish()
    }
}

/// A buffer on loan from a `BufferPool`; goes back on drop.
pub struct PooledBuf {
    buf: Option<BytesMut>,
    pool: Arc<PoolInner>,
}

impl Deref for PooledBuf {
    type Target = BytesMut;

    fn deref(&self) -> &BytesMut {
        // Only None during drop
        self.buf.as_ref().unwrap_or_else(|| unreachable!())
    }
}

impl DerefMut for PooledBuf {
    fn deref_mut(&mut self) -> &mut BytesMut {
        self.buf.as_mut().unwrap_or_else(|| unreachable!())
    }
}

impl Drop for PooledBuf {
    fn drop(&mut self) {
        let Some(mut buf) = self.buf.take() else {
            return;
        };
        // Buffers whose storage was split off and frozen come back too small
        buf.clear();
        if buf.capacity() < self.pool.buffer_size {
            return;
        }
        let mut free = self.pool.free.lock();
        if free.len() < self.pool.max_retained {
            free.push(buf);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BufMut;

    #[test]
    fn test_buffer_returns_on_drop() {
        let pool = BufferPool::new(1024, 4);
        assert_eq!(pool.idle(), 0);
        {
            let mut buf = pool.acquire();
            buf.put_slice(b"hello");
            assert_eq!(&buf[..], b"hello");
        }
        assert_eq!(pool.idle(), 1);

        // Reused buffer comes back empty
        let buf = pool.acquire();
        assert!(buf.is_empty());
        assert!(buf.capacity() >= 1024);
        assert_eq!(pool.idle(), 0);
    }

    #[test]
    fn test_retention_is_bounded() {
        let pool = BufferPool::new(64, 2);
        let held: Vec<_> = (0..5).map(|_| pool.acquire()).collect();
        drop(held);
        assert_eq!(pool.idle(), 2);
    }

    #[test]
    fn test_split_buffer_not_retained() {
        let pool = BufferPool::new(64, 2);
        {
            let mut buf = pool.acquire();
            buf.put_bytes(0, 64);
            let _frozen = buf.split().freeze();
        }
        assert_eq!(pool.idle(), 0);
    }
}
