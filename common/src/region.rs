//! Bounded window over a random-access source or destination.

use crate::io::{ReadAt, WriteAt};

/// A `[base, base + len)` window over a positional handle with its own cursor.
///
/// [`std::io::Read`] is available when the handle implements [`ReadAt`] and [`std::io::Write`]
/// when it implements [`WriteAt`]. Transfers never cross the end of the window: reads past it
/// report end of data and writes are truncated to what is left.
#[derive(Debug)]
pub struct Region<'a, T: ?Sized> {
    inner: &'a T,
    base: u64,
    cursor: u64,
    limit: u64,
}

impl<'a, T: ?Sized> Region<'a, T> {
    #[must_use]
    pub fn new(inner: &'a T, offset: u64, len: u64) -> Self {
        Self {
            inner,
            base: offset,
            cursor: offset,
            limit: offset.saturating_add(len),
        }
    }

    /// Bytes transferred through this view so far.
    #[must_use]
    pub fn position(&self) -> u64 {
        self.cursor - self.base
    }

    /// Bytes left before the end of the window.
    #[must_use]
    pub fn remaining(&self) -> u64 {
        self.limit - self.cursor
    }

    /// Absolute offset of the cursor in the underlying handle.
    #[must_use]
    pub fn offset(&self) -> u64 {
        self.cursor
    }

    fn clamp(&self, len: usize) -> usize {
        usize::try_from(self.remaining()).map_or(len, |remaining| len.min(remaining))
    }
}

impl<T: ReadAt + ?Sized> std::io::Read for Region<'_, T> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let max = self.clamp(buf.len());
        if max == 0 {
            return Ok(0);
        }
        let n = self.inner.read_at(&mut buf[..max], self.cursor)?;
        self.cursor += n as u64;
        Ok(n)
    }
}

impl<T: WriteAt + ?Sized> std::io::Write for Region<'_, T> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let max = self.clamp(buf.len());
        if max == 0 {
            return Ok(0);
        }
        let n = self.inner.write_at(&buf[..max], self.cursor)?;
        self.cursor += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
