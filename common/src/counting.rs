//! I/O decorators that add transferred byte counts to a [`TlsCounter`].
//!
//! The positional decorators also mark every call as an operation in a [`ProgressCounter`], so
//! the progress printer can show how many reads and writes are in flight.

use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::io::{ReadAt, WriteAt};
use crate::progress::{ProgressCounter, TlsCounter};

#[derive(Debug)]
pub struct CountingReader<'a, R> {
    inner: R,
    bytes: &'a TlsCounter,
}

impl<'a, R> CountingReader<'a, R> {
    pub fn new(inner: R, bytes: &'a TlsCounter) -> Self {
        Self { inner, bytes }
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for CountingReader<'_, R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let before = buf.filled().len();
        let res = Pin::new(&mut self.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = res {
            self.bytes.add((buf.filled().len() - before) as u64);
        }
        res
    }
}

#[derive(Debug)]
pub struct CountingWriter<'a, W> {
    inner: W,
    bytes: &'a TlsCounter,
}

impl<'a, W> CountingWriter<'a, W> {
    pub fn new(inner: W, bytes: &'a TlsCounter) -> Self {
        Self { inner, bytes }
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: AsyncWrite + Unpin> AsyncWrite for CountingWriter<'_, W> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        let res = Pin::new(&mut self.inner).poll_write(cx, buf);
        if let Poll::Ready(Ok(n)) = res {
            self.bytes.add(n as u64);
        }
        res
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

#[derive(Debug)]
pub struct CountingReadAt<'a, R: ?Sized> {
    ops: &'a ProgressCounter,
    bytes: &'a TlsCounter,
    inner: R,
}

impl<'a, R> CountingReadAt<'a, R> {
    pub fn new(inner: R, ops: &'a ProgressCounter, bytes: &'a TlsCounter) -> Self {
        Self { ops, bytes, inner }
    }
}

impl<R: ReadAt + ?Sized> ReadAt for CountingReadAt<'_, R> {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> std::io::Result<usize> {
        let _guard = self.ops.guard();
        let n = self.inner.read_at(buf, offset)?;
        self.bytes.add(n as u64);
        Ok(n)
    }
}

#[derive(Debug)]
pub struct CountingWriteAt<'a, W: ?Sized> {
    ops: &'a ProgressCounter,
    bytes: &'a TlsCounter,
    inner: W,
}

impl<'a, W> CountingWriteAt<'a, W> {
    pub fn new(inner: W, ops: &'a ProgressCounter, bytes: &'a TlsCounter) -> Self {
        Self { ops, bytes, inner }
    }
}

impl<W: WriteAt + ?Sized> WriteAt for CountingWriteAt<'_, W> {
    fn write_at(&self, buf: &[u8], offset: u64) -> std::io::Result<usize> {
        let _guard = self.ops.guard();
        let n = self.inner.write_at(buf, offset)?;
        self.bytes.add(n as u64);
        Ok(n)
    }
}
