//! Double-buffered sequential copy.
//!
//! One read stage and one write stage relay two buffers between each other so the destination
//! drains buffer `k` while the source fills buffer `k + 1`. Useful when both ends are slow and
//! neither supports positional access.

use std::sync::atomic::{AtomicU64, Ordering};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::error::{CopyError, Error, Summary};
use crate::group::{Failure, supervise};
use crate::pool::{BufferPool, PooledBuffer};

/// Buffers circulating between the read and the write stage.
pub const BUFFER_COUNT: usize = 2;

#[derive(Debug, Default)]
struct Counters {
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
    chunks_written: AtomicU64,
}

impl Counters {
    fn summary(&self) -> Summary {
        Summary {
            bytes_read: self.bytes_read.load(Ordering::Acquire),
            bytes_written: self.bytes_written.load(Ordering::Acquire),
            chunks_written: self.chunks_written.load(Ordering::Acquire),
        }
    }
}

/// Copies `reader` into `writer` until end of input, overlapping reads with writes.
///
/// Each read is a single `read` call into a buffer of `buffer_size` bytes, so short reads are
/// forwarded as-is. Writes loop until the whole buffer is accepted; a write that has started is
/// never interrupted by `cancel`, only new reads and writes are. The destination is flushed after
/// the last buffer.
///
/// Returns the transfer summary on success. On success `bytes_written == bytes_read` and equals
/// the length of the input.
#[instrument(skip(reader, writer, cancel))]
pub async fn double_buffered_copy<R, W>(
    reader: &mut R,
    writer: &mut W,
    buffer_size: usize,
    cancel: &CancellationToken,
) -> Result<Summary, Error>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    if buffer_size == 0 {
        return Err(CopyError::Config("buffer size must be greater than 0".to_string()).into());
    }
    let pool = BufferPool::new(BUFFER_COUNT, buffer_size);
    let failure = Failure::new(cancel);
    let counters = Counters::default();
    // data-ready queue, the read stage can be at most one buffer ahead of the writer
    let (full_tx, full_rx) = tokio::sync::mpsc::channel::<PooledBuffer>(1);
    {
        let token = failure.token();
        let read_stage = read_stage(reader, &pool, full_tx, &counters, token);
        let write_stage = write_stage(writer, full_rx, &counters, token);
        tokio::join!(
            supervise(&failure, "reader", read_stage),
            supervise(&failure, "writer", write_stage),
        );
    }
    let reclaimed = pool.drain();
    tracing::debug!("reclaimed {reclaimed} buffers");
    let summary = counters.summary();
    if let Some(error) = failure.take() {
        return Err(Error::new(error, summary));
    }
    if summary.bytes_written < summary.bytes_read {
        return Err(Error::new(
            CopyError::ShortWrite {
                offset: summary.bytes_written,
                expected: summary.bytes_read,
                written: summary.bytes_written,
            },
            summary,
        ));
    }
    tracing::debug!("copied {} bytes", summary.bytes_written);
    Ok(summary)
}

async fn read_stage<R>(
    reader: &mut R,
    pool: &BufferPool,
    full_tx: tokio::sync::mpsc::Sender<PooledBuffer>,
    counters: &Counters,
    cancel: &CancellationToken,
) -> Result<(), CopyError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    loop {
        let mut buffer = pool.acquire(cancel).await?;
        let offset = counters.bytes_read.load(Ordering::Acquire);
        let n = loop {
            let res = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(CopyError::Cancelled),
                res = reader.read(buffer.storage_mut()) => res,
            };
            match res {
                Ok(n) => break n,
                Err(error) if error.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(error) => {
                    return Err(CopyError::Read {
                        from: offset,
                        to: offset + buffer.capacity() as u64,
                        source: error,
                    });
                }
            }
        };
        if n == 0 {
            tracing::debug!("end of input after {offset} bytes");
            return Ok(());
        }
        buffer.set_len(n);
        counters.bytes_read.fetch_add(n as u64, Ordering::AcqRel);
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(CopyError::Cancelled),
            res = full_tx.send(buffer) => {
                if res.is_err() {
                    // the writer is gone, it has already recorded why
                    return Err(CopyError::Cancelled);
                }
            }
        }
    }
}

async fn write_stage<W>(
    writer: &mut W,
    mut full_rx: tokio::sync::mpsc::Receiver<PooledBuffer>,
    counters: &Counters,
    cancel: &CancellationToken,
) -> Result<(), CopyError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    loop {
        let buffer = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(CopyError::Cancelled),
            buffer = full_rx.recv() => match buffer {
                Some(buffer) => buffer,
                None => break,
            },
        };
        if buffer.is_empty() {
            continue;
        }
        // not raced against `cancel`: bytes handed to the destination are never abandoned midway
        write_buffer(writer, buffer.filled(), counters).await?;
        counters.chunks_written.fetch_add(1, Ordering::AcqRel);
    }
    let offset = counters.bytes_written.load(Ordering::Acquire);
    writer.flush().await.map_err(|error| CopyError::Write {
        from: offset,
        to: offset,
        source: error,
    })
}

async fn write_buffer<W>(
    writer: &mut W,
    payload: &[u8],
    counters: &Counters,
) -> Result<(), CopyError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let start = counters.bytes_written.load(Ordering::Acquire);
    let mut written = 0;
    while written < payload.len() {
        match writer.write(&payload[written..]).await {
            Ok(0) => {
                return Err(CopyError::ShortWrite {
                    offset: start + written as u64,
                    expected: payload.len() as u64,
                    written: written as u64,
                });
            }
            Ok(n) => {
                written += n;
                counters.bytes_written.fetch_add(n as u64, Ordering::AcqRel);
            }
            Err(error) if error.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(error) => {
                return Err(CopyError::Write {
                    from: start,
                    to: start + payload.len() as u64,
                    source: error,
                });
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::pin::Pin;
    use std::task::{Context, Poll};

    use super::*;
    use tracing_test::traced_test;

    fn pattern() -> Vec<u8> {
        b"0123456789abcdef".repeat(16)
    }

    /// Reader returning at most `chunk` bytes per call.
    struct TrickleReader {
        data: Vec<u8>,
        pos: usize,
        chunk: usize,
    }

    impl AsyncRead for TrickleReader {
        fn poll_read(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &mut tokio::io::ReadBuf<'_>,
        ) -> Poll<std::io::Result<()>> {
            let n = self
                .chunk
                .min(buf.remaining())
                .min(self.data.len() - self.pos);
            let start = self.pos;
            buf.put_slice(&self.data[start..start + n]);
            self.pos += n;
            Poll::Ready(Ok(()))
        }
    }

    /// Writer accepting at most `chunk` bytes per call, failing after `fail_after` bytes.
    #[derive(Default)]
    struct LimitedWriter {
        data: Vec<u8>,
        chunk: usize,
        fail_after: Option<usize>,
        flushed: bool,
    }

    impl AsyncWrite for LimitedWriter {
        fn poll_write(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<std::io::Result<usize>> {
            if self.fail_after.is_some_and(|limit| self.data.len() >= limit) {
                return Poll::Ready(Err(std::io::Error::other("disk full")));
            }
            let n = self.chunk.min(buf.len());
            self.data.extend_from_slice(&buf[..n]);
            Poll::Ready(Ok(n))
        }

        fn poll_flush(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            self.flushed = true;
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    /// Reader that never produces data.
    struct StalledReader;

    impl AsyncRead for StalledReader {
        fn poll_read(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &mut tokio::io::ReadBuf<'_>,
        ) -> Poll<std::io::Result<()>> {
            Poll::Pending
        }
    }

    struct FailingReader;

    impl AsyncRead for FailingReader {
        fn poll_read(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &mut tokio::io::ReadBuf<'_>,
        ) -> Poll<std::io::Result<()>> {
            Poll::Ready(Err(std::io::Error::other("device error")))
        }
    }

    #[tokio::test]
    #[traced_test]
    async fn copies_with_uneven_buffer_size() -> anyhow::Result<()> {
        let content = pattern();
        let mut input = content.as_slice();
        let mut output = Vec::new();
        // 15 does not divide 256, the last buffer is partially filled
        let summary =
            double_buffered_copy(&mut input, &mut output, 15, &CancellationToken::new()).await?;
        assert_eq!(summary.bytes_written, 256);
        assert_eq!(summary.bytes_read, 256);
        assert_eq!(summary.chunks_written, 18);
        assert_eq!(output, content);
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn empty_input() -> anyhow::Result<()> {
        let mut input: &[u8] = &[];
        let mut output = Vec::new();
        let summary =
            double_buffered_copy(&mut input, &mut output, 8, &CancellationToken::new()).await?;
        assert_eq!(summary, Summary::default());
        assert!(output.is_empty());
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn short_reads_and_writes_are_completed() -> anyhow::Result<()> {
        let content: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();
        let mut reader = TrickleReader {
            data: content.clone(),
            pos: 0,
            chunk: 7,
        };
        let mut writer = LimitedWriter {
            chunk: 3,
            ..Default::default()
        };
        let summary =
            double_buffered_copy(&mut reader, &mut writer, 64, &CancellationToken::new()).await?;
        assert_eq!(summary.bytes_written, 1000);
        assert_eq!(writer.data, content);
        assert!(writer.flushed);
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn write_error_fails_copy() {
        let content = vec![7u8; 4096];
        let mut input = content.as_slice();
        let mut writer = LimitedWriter {
            chunk: usize::MAX,
            fail_after: Some(1024),
            ..Default::default()
        };
        let err = double_buffered_copy(&mut input, &mut writer, 256, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err.source, CopyError::Write { .. }), "{err}");
        assert_eq!(err.summary.bytes_written, 1024);
    }

    #[tokio::test]
    #[traced_test]
    async fn zero_progress_write_is_short_write() {
        let content = vec![1u8; 100];
        let mut input = content.as_slice();
        let mut writer = LimitedWriter::default();
        let err = double_buffered_copy(&mut input, &mut writer, 32, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err.source, CopyError::ShortWrite { .. }), "{err}");
    }

    #[tokio::test]
    #[traced_test]
    async fn read_error_fails_copy() {
        let mut writer = Vec::new();
        let err =
            double_buffered_copy(&mut FailingReader, &mut writer, 32, &CancellationToken::new())
                .await
                .unwrap_err();
        assert!(matches!(err.source, CopyError::Read { .. }), "{err}");
        assert!(writer.is_empty());
    }

    #[tokio::test]
    #[traced_test]
    async fn cancellation_stops_copy() {
        let cancel = CancellationToken::new();
        let canceller = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                cancel.cancel();
            })
        };
        let mut writer = Vec::new();
        let err = double_buffered_copy(&mut StalledReader, &mut writer, 32, &cancel)
            .await
            .unwrap_err();
        canceller.await.unwrap();
        assert!(err.source.is_cancelled(), "{err}");
        assert!(!logs_contain("still in use"));
    }

    #[tokio::test]
    async fn zero_buffer_size_is_rejected() {
        let mut input: &[u8] = b"abc";
        let mut output = Vec::new();
        let err = double_buffered_copy(&mut input, &mut output, 0, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err.source, CopyError::Config(_)));
        assert!(output.is_empty());
    }
}
