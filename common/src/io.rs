//! Positional I/O capabilities used by the block copy engine.
//!
//! Unlike [`std::io::Read`] and [`std::io::Write`] these traits carry no cursor: every call names
//! its own offset, so a single handle can be shared by many workers as long as they touch disjoint
//! ranges.

use std::os::unix::fs::FileExt;

/// Random-access source.
///
/// `read_at` may return fewer bytes than requested. `Ok(0)` for a non-empty `buf` means the
/// offset is at or past the end of data.
pub trait ReadAt {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> std::io::Result<usize>;
}

/// Random-access destination.
///
/// `write_at` may accept fewer bytes than offered. Implementations must tolerate concurrent calls
/// on non-overlapping ranges.
pub trait WriteAt {
    fn write_at(&self, buf: &[u8], offset: u64) -> std::io::Result<usize>;
}

impl ReadAt for std::fs::File {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> std::io::Result<usize> {
        FileExt::read_at(self, buf, offset)
    }
}

impl WriteAt for std::fs::File {
    fn write_at(&self, buf: &[u8], offset: u64) -> std::io::Result<usize> {
        FileExt::write_at(self, buf, offset)
    }
}

impl ReadAt for [u8] {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> std::io::Result<usize> {
        let Ok(start) = usize::try_from(offset) else {
            return Ok(0);
        };
        if start >= self.len() {
            return Ok(0);
        }
        let n = buf.len().min(self.len() - start);
        buf[..n].copy_from_slice(&self[start..start + n]);
        Ok(n)
    }
}

impl ReadAt for Vec<u8> {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> std::io::Result<usize> {
        self.as_slice().read_at(buf, offset)
    }
}

impl ReadAt for bytes::Bytes {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> std::io::Result<usize> {
        self.as_ref().read_at(buf, offset)
    }
}

/// In-memory destination, grows (zero-filled) to fit writes past the current end.
impl WriteAt for std::sync::Mutex<Vec<u8>> {
    fn write_at(&self, buf: &[u8], offset: u64) -> std::io::Result<usize> {
        let start = usize::try_from(offset)
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidInput, "offset too large"))?;
        let end = start + buf.len();
        let mut data = self.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if data.len() < end {
            data.resize(end, 0);
        }
        data[start..end].copy_from_slice(buf);
        Ok(buf.len())
    }
}

impl<T: ReadAt + ?Sized> ReadAt for std::sync::Arc<T> {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> std::io::Result<usize> {
        (**self).read_at(buf, offset)
    }
}

impl<T: WriteAt + ?Sized> WriteAt for std::sync::Arc<T> {
    fn write_at(&self, buf: &[u8], offset: u64) -> std::io::Result<usize> {
        (**self).write_at(buf, offset)
    }
}
