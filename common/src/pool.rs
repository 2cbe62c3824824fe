//! Fixed-size pool of reusable I/O buffers.
//!
//! The pool is seeded with all of its buffers up front and never allocates afterwards. A stage
//! that wants to produce data must first [`acquire`](BufferPool::acquire) a buffer, which gives
//! natural backpressure: when every buffer is in flight, producers wait for consumers. Buffers are
//! handed out as [`PooledBuffer`] guards that return the buffer on drop, so a buffer goes back to
//! the pool on every exit path, including errors and panics.

use tokio_util::sync::CancellationToken;

use crate::error::CopyError;

/// Byte region of fixed capacity with a filled length.
#[derive(Debug)]
pub struct Buffer {
    data: Box<[u8]>,
    len: usize,
}

impl Buffer {
    fn new(capacity: usize) -> Self {
        Self {
            data: vec![0u8; capacity].into_boxed_slice(),
            len: 0,
        }
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The filled part of the buffer.
    #[must_use]
    pub fn filled(&self) -> &[u8] {
        &self.data[..self.len]
    }

    /// The whole backing storage, regardless of the filled length.
    pub fn storage_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// # Panics
    ///
    /// Panics if `len` exceeds the buffer capacity.
    pub fn set_len(&mut self, len: usize) {
        assert!(
            len <= self.data.len(),
            "buffer length {len} exceeds capacity {}",
            self.data.len()
        );
        self.len = len;
    }
}

#[derive(Debug)]
pub struct BufferPool {
    free_tx: async_channel::Sender<Buffer>,
    free_rx: async_channel::Receiver<Buffer>,
    count: usize,
}

impl BufferPool {
    /// Creates a pool holding `count` buffers of `buffer_size` bytes each.
    ///
    /// # Panics
    ///
    /// Panics if `count` is zero.
    #[must_use]
    pub fn new(count: usize, buffer_size: usize) -> Self {
        assert!(count > 0, "buffer pool must hold at least one buffer");
        let (free_tx, free_rx) = async_channel::bounded(count);
        for _ in 0..count {
            // capacity is exactly `count`, seeding can not fail
            let _ = free_tx.try_send(Buffer::new(buffer_size));
        }
        tracing::trace!("buffer pool seeded with {count} x {buffer_size} bytes");
        Self {
            free_tx,
            free_rx,
            count,
        }
    }

    /// Total number of buffers owned by the pool, idle or in flight.
    #[must_use]
    pub fn count(&self) -> usize {
        self.count
    }

    /// Number of buffers currently idle in the pool.
    #[must_use]
    pub fn available(&self) -> usize {
        self.free_rx.len()
    }

    /// Waits for an idle buffer. Returns [`CopyError::Cancelled`] if `cancel` fires first.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<PooledBuffer, CopyError> {
        let buffer = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(CopyError::Cancelled),
            buffer = self.free_rx.recv() => buffer.map_err(|_| CopyError::Cancelled)?,
        };
        Ok(PooledBuffer {
            buffer: Some(buffer),
            release: self.free_tx.clone(),
        })
    }

    /// Removes every idle buffer from the pool and returns how many were reclaimed.
    ///
    /// Called once an operation has joined all of its stages; anything short of
    /// [`count`](Self::count) means a buffer is still held somewhere.
    pub fn drain(&self) -> usize {
        let mut reclaimed = 0;
        while self.free_rx.try_recv().is_ok() {
            reclaimed += 1;
        }
        if reclaimed != self.count {
            tracing::error!(
                "buffer pool drained {reclaimed} of {} buffers, some are still in use",
                self.count
            );
        }
        reclaimed
    }
}

/// Exclusive ownership of one pool buffer, returned to the pool on drop.
#[derive(Debug)]
pub struct PooledBuffer {
    buffer: Option<Buffer>,
    release: async_channel::Sender<Buffer>,
}

impl std::ops::Deref for PooledBuffer {
    type Target = Buffer;
    fn deref(&self) -> &Buffer {
        self.buffer.as_ref().expect("buffer is present until drop")
    }
}

impl std::ops::DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut Buffer {
        self.buffer.as_mut().expect("buffer is present until drop")
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(mut buffer) = self.buffer.take() {
            buffer.len = 0;
            // the pool channel is sized to hold every buffer, this only fails once the pool is gone
            let _ = self.release.try_send(buffer);
        }
    }
}
