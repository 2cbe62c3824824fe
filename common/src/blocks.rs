//! Block-parallel copy between two random-access endpoints.
//!
//! The transfer `[0, size)` is cut into blocks of `block_size` bytes. A generator stage hands one
//! block at a time, together with a pool buffer, to a set of read workers; each read worker fills
//! the buffer from the source and forwards the block to a set of write workers, which store it at
//! the same offset in the destination and release the buffer. The pool holds one buffer per
//! worker, so at most `workers` blocks are in flight.
//!
//! Handoff to the readers is synchronous: an idle reader announces itself first, and only then
//! does the generator take a buffer and pass the block straight to that reader.
//!
//! The source may end inside the final block; whatever was read is written and the summary counts
//! the bytes actually copied. Running out of data in any earlier block is a read error.
//!
//! Blocks are handed out in increasing offset order but may be written in any order: every block
//! targets a disjoint destination range.

use std::io::{Read, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::error::{CopyError, Error, Summary};
use crate::group::{TaskGroup, join_error};
use crate::io::{ReadAt, WriteAt};
use crate::pool::{BufferPool, PooledBuffer};
use crate::region::Region;

/// Parameters of one block copy.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Settings {
    /// Total number of bytes to copy.
    pub size: u64,
    pub block_size: u64,
    /// Number of read workers, and separately of write workers.
    pub workers: usize,
}

impl Settings {
    /// Validate settings and return a configuration error if they are unusable.
    pub fn validate(&self) -> Result<(), CopyError> {
        if self.size == 0 {
            return Err(CopyError::Config(format!("invalid size: {}", self.size)));
        }
        if self.block_size == 0 {
            return Err(CopyError::Config(format!(
                "invalid block size: {}",
                self.block_size
            )));
        }
        if self.workers == 0 {
            return Err(CopyError::Config(format!(
                "invalid number of workers: {}",
                self.workers
            )));
        }
        if usize::try_from(self.block_size).is_err() {
            return Err(CopyError::Config(format!(
                "block size {} does not fit in memory",
                self.block_size
            )));
        }
        Ok(())
    }

    /// Number of blocks the transfer is split into.
    #[must_use]
    pub fn block_count(&self) -> u64 {
        if self.block_size == 0 {
            return 0;
        }
        self.size.div_ceil(self.block_size)
    }

    /// `[from, to)` of every block, in increasing offset order.
    fn block_ranges(&self) -> impl Iterator<Item = (u64, u64)> + use<> {
        let Settings {
            size, block_size, ..
        } = *self;
        let mut from = 0;
        std::iter::from_fn(move || {
            if from >= size || block_size == 0 {
                return None;
            }
            let to = size.min(from.saturating_add(block_size));
            let range = (from, to);
            from = to;
            Some(range)
        })
    }
}

/// One block of the transfer and the buffer carrying its data.
#[derive(Debug)]
struct Job {
    from: u64,
    to: u64,
    buffer: PooledBuffer,
}

impl Job {
    fn len(&self) -> u64 {
        self.to - self.from
    }
}

/// An idle read worker waiting for its next block.
type ReadySlot = tokio::sync::oneshot::Sender<Job>;

#[derive(Debug, Default)]
struct Counters {
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
    blocks_written: AtomicU64,
}

impl Counters {
    fn summary(&self) -> Summary {
        Summary {
            bytes_read: self.bytes_read.load(Ordering::Acquire),
            bytes_written: self.bytes_written.load(Ordering::Acquire),
            chunks_written: self.blocks_written.load(Ordering::Acquire),
        }
    }
}

/// Copies `settings.size` bytes from `src` to `dst` using `settings.workers` concurrent reader and
/// writer stages.
///
/// Invalid settings fail before any I/O is issued. On failure the summary attached to the error
/// only counts blocks that were completely written before the failure; the destination content is
/// undefined and the count must not be used to resume.
#[instrument(skip(src, dst, cancel))]
pub async fn copy_in_blocks<R, W>(
    src: Arc<R>,
    dst: Arc<W>,
    settings: &Settings,
    cancel: &CancellationToken,
) -> Result<Summary, Error>
where
    R: ReadAt + Send + Sync + ?Sized + 'static,
    W: WriteAt + Send + Sync + ?Sized + 'static,
{
    settings.validate()?;
    let block_len = usize::try_from(settings.block_size)
        .map_err(|_| CopyError::Config("block size does not fit in memory".to_string()))?;
    let pool = Arc::new(BufferPool::new(settings.workers, block_len));
    let counters = Arc::new(Counters::default());
    // every reader has at most one outstanding slot; readers run at most one block ahead of writers
    let (ready_tx, ready_rx) = async_channel::bounded::<ReadySlot>(settings.workers);
    let (write_tx, write_rx) = async_channel::bounded::<Job>(1);
    let mut group = TaskGroup::new(cancel);
    group.spawn(
        "generator".to_string(),
        generate_blocks(*settings, pool.clone(), ready_rx, group.token().clone()),
    );
    for worker in 0..settings.workers {
        group.spawn(
            format!("reader-{worker}"),
            read_worker(
                src.clone(),
                settings.size,
                ready_tx.clone(),
                write_tx.clone(),
                counters.clone(),
                group.token().clone(),
            ),
        );
    }
    // each read worker owns a sender, the write queue closes once the last of them has exited
    drop(write_tx);
    drop(ready_tx);
    for worker in 0..settings.workers {
        group.spawn(
            format!("writer-{worker}"),
            write_worker(
                dst.clone(),
                write_rx.clone(),
                counters.clone(),
                group.token().clone(),
            ),
        );
    }
    drop(write_rx);
    let result = group.wait().await;
    let reclaimed = pool.drain();
    tracing::debug!("reclaimed {reclaimed} of {} buffers", pool.count());
    let summary = counters.summary();
    match result {
        Ok(()) => {
            tracing::debug!(
                "copied {} bytes in {} blocks",
                summary.bytes_written,
                summary.chunks_written
            );
            Ok(summary)
        }
        Err(error) => Err(Error::new(error, summary)),
    }
}

/// Hands every block to an idle reader. A buffer is only taken once a reader is waiting for it.
async fn generate_blocks(
    settings: Settings,
    pool: Arc<BufferPool>,
    ready_rx: async_channel::Receiver<ReadySlot>,
    cancel: CancellationToken,
) -> Result<(), CopyError> {
    for (from, to) in settings.block_ranges() {
        let slot = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(CopyError::Cancelled),
            slot = ready_rx.recv() => match slot {
                Ok(slot) => slot,
                // every reader is gone, the one that failed has recorded why
                Err(_) => return Err(CopyError::Cancelled),
            },
        };
        let buffer = pool.acquire(&cancel).await?;
        if slot.send(Job { from, to, buffer }).is_err() {
            // the reader stopped waiting, it only does so when the copy is cancelled
            return Err(CopyError::Cancelled);
        }
        tracing::trace!("handed out block {from}-{to}");
    }
    // dropping the slots still queued wakes their readers, which then exit
    ready_rx.close();
    while let Ok(slot) = ready_rx.try_recv() {
        drop(slot);
    }
    tracing::debug!("all {} blocks handed out", settings.block_count());
    Ok(())
}

async fn read_worker<R>(
    src: Arc<R>,
    size: u64,
    ready_tx: async_channel::Sender<ReadySlot>,
    write_tx: async_channel::Sender<Job>,
    counters: Arc<Counters>,
    cancel: CancellationToken,
) -> Result<(), CopyError>
where
    R: ReadAt + Send + Sync + ?Sized + 'static,
{
    loop {
        let (slot, next) = tokio::sync::oneshot::channel();
        if ready_tx.send(slot).await.is_err() {
            // the generator has handed out every block
            return Ok(());
        }
        let job = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(CopyError::Cancelled),
            job = next => match job {
                Ok(job) => job,
                Err(_) => return Ok(()),
            },
        };
        let job = {
            let src = src.clone();
            let cancel = cancel.clone();
            tokio::task::spawn_blocking(move || read_block(src.as_ref(), job, size, &cancel))
                .await
                .map_err(|error| join_error("read", error))??
        };
        counters
            .bytes_read
            .fetch_add(job.buffer.len() as u64, Ordering::AcqRel);
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(CopyError::Cancelled),
            res = write_tx.send(job) => {
                if res.is_err() {
                    return Err(CopyError::Cancelled);
                }
            }
        }
    }
}

/// Fills the job buffer with `[from, to)` of the source, looping over short reads.
///
/// End of data is accepted only in the block ending at `size`; the payload is cut to what was read.
fn read_block<R: ReadAt + ?Sized>(
    src: &R,
    mut job: Job,
    size: u64,
    cancel: &CancellationToken,
) -> Result<Job, CopyError> {
    let (from, to) = (job.from, job.to);
    let len = usize::try_from(job.len()).map_err(|_| {
        CopyError::Config(format!("block {from}-{to} does not fit in memory"))
    })?;
    let mut region = Region::new(src, from, job.len());
    let storage = job.buffer.storage_mut();
    let mut filled = 0;
    while filled < len {
        if cancel.is_cancelled() {
            return Err(CopyError::Cancelled);
        }
        match region.read(&mut storage[filled..len]) {
            Ok(0) if to == size => {
                tracing::debug!("source ended at offset {} in the final block", region.offset());
                break;
            }
            Ok(0) => {
                return Err(CopyError::Read {
                    from,
                    to,
                    source: std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        format!("source ended at offset {}", region.offset()),
                    ),
                });
            }
            Ok(n) => filled += n,
            Err(error) if error.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(error) => {
                return Err(CopyError::Read {
                    from,
                    to,
                    source: error,
                });
            }
        }
    }
    job.buffer.set_len(filled);
    tracing::trace!("read block {from}-{to}");
    Ok(job)
}

async fn write_worker<W>(
    dst: Arc<W>,
    write_rx: async_channel::Receiver<Job>,
    counters: Arc<Counters>,
    cancel: CancellationToken,
) -> Result<(), CopyError>
where
    W: WriteAt + Send + Sync + ?Sized + 'static,
{
    loop {
        let job = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(CopyError::Cancelled),
            job = write_rx.recv() => match job {
                Ok(job) => job,
                Err(_) => return Ok(()),
            },
        };
        let dst = dst.clone();
        let counters = counters.clone();
        // the job, and with it the pool buffer, is released on the blocking thread once written
        tokio::task::spawn_blocking(move || write_block(dst.as_ref(), &job, &counters))
            .await
            .map_err(|error| join_error("write", error))??;
    }
}

/// Stores the job payload at `[from, to)` of the destination, looping over short writes.
fn write_block<W: WriteAt + ?Sized>(
    dst: &W,
    job: &Job,
    counters: &Counters,
) -> Result<(), CopyError> {
    let payload = job.buffer.filled();
    let mut region = Region::new(dst, job.from, job.len());
    let mut written = 0;
    while written < payload.len() {
        match region.write(&payload[written..]) {
            Ok(0) => {
                return Err(CopyError::ShortWrite {
                    offset: region.offset(),
                    expected: payload.len() as u64,
                    written: written as u64,
                });
            }
            Ok(n) => written += n,
            Err(error) if error.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(error) => {
                return Err(CopyError::Write {
                    from: job.from,
                    to: job.to,
                    source: error,
                });
            }
        }
    }
    counters
        .bytes_written
        .fetch_add(written as u64, Ordering::AcqRel);
    counters.blocks_written.fetch_add(1, Ordering::AcqRel);
    tracing::trace!("wrote block {}-{}", job.from, job.to);
    Ok(())
}
