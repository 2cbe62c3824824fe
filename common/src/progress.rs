use tracing::{Level, event, instrument};

/// Counter sharded per thread, cheap to bump from many workers at once.
#[derive(Debug)]
pub struct TlsCounter {
    // each mutex is used almost exclusively by its owning thread, it is not contended
    count: thread_local::ThreadLocal<std::sync::Mutex<u64>>,
}

impl TlsCounter {
    #[must_use]
    pub fn new() -> Self {
        Self {
            count: thread_local::ThreadLocal::new(),
        }
    }

    pub fn add(&self, value: u64) {
        let mutex = self.count.get_or(|| std::sync::Mutex::new(0));
        let mut guard = mutex
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        *guard += value;
    }

    pub fn inc(&self) {
        self.add(1);
    }

    #[must_use]
    pub fn get(&self) -> u64 {
        self.count.iter().fold(0, |total, shard| {
            total
                + *shard
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner)
        })
    }
}

impl Default for TlsCounter {
    fn default() -> Self {
        Self::new()
    }
}

/// Pair of counters tracking operations that were started and finished.
#[derive(Debug, Default)]
pub struct ProgressCounter {
    started: TlsCounter,
    finished: TlsCounter,
}

/// Marks one operation as started on creation and as finished on drop.
pub struct ProgressGuard<'a> {
    progress: &'a ProgressCounter,
}

impl<'a> ProgressGuard<'a> {
    pub fn new(progress: &'a ProgressCounter) -> Self {
        progress.started.inc();
        Self { progress }
    }
}

impl Drop for ProgressGuard<'_> {
    fn drop(&mut self) {
        self.progress.finished.inc();
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Status {
    pub started: u64,
    pub finished: u64,
}

impl Status {
    #[must_use]
    pub fn pending(&self) -> u64 {
        self.started - self.finished
    }
}

impl ProgressCounter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn guard(&self) -> ProgressGuard<'_> {
        ProgressGuard::new(self)
    }

    #[instrument]
    pub fn get(&self) -> Status {
        // read finished first, a concurrent guard may bump both in between
        let finished = self.finished.get();
        let mut status = Status {
            started: self.started.get(),
            finished,
        };
        if status.finished > status.started {
            event!(
                Level::DEBUG,
                "Progress inversion - started: {}, finished {}",
                status.started,
                status.finished
            );
            status.started = status.finished;
        }
        status
    }
}

/// Process-wide transfer statistics, fed by the counting decorators.
#[derive(Debug)]
pub struct Progress {
    /// Positional read and write calls.
    pub ops: ProgressCounter,
    pub bytes_read: TlsCounter,
    pub bytes_written: TlsCounter,
    start_time: std::time::Instant,
}

impl Progress {
    #[must_use]
    pub fn new() -> Self {
        Self {
            ops: ProgressCounter::default(),
            bytes_read: TlsCounter::default(),
            bytes_written: TlsCounter::default(),
            start_time: std::time::Instant::now(),
        }
    }

    #[must_use]
    pub fn get_duration(&self) -> std::time::Duration {
        self.start_time.elapsed()
    }
}

impl Default for Progress {
    fn default() -> Self {
        Self::new()
    }
}

/// Renders periodic text updates with average and current rates.
pub struct ProgressPrinter<'a> {
    progress: &'a Progress,
    last_read: u64,
    last_written: u64,
    last_update: std::time::Instant,
}

fn rate(bytes: u64, secs: f64) -> bytesize::ByteSize {
    if secs <= 0.0 {
        return bytesize::ByteSize(0);
    }
    bytesize::ByteSize((bytes as f64 / secs) as u64)
}

impl<'a> ProgressPrinter<'a> {
    pub fn new(progress: &'a Progress) -> Self {
        Self {
            progress,
            last_read: progress.bytes_read.get(),
            last_written: progress.bytes_written.get(),
            last_update: std::time::Instant::now(),
        }
    }

    pub fn print(&mut self) -> String {
        let time_now = std::time::Instant::now();
        let ops = self.progress.ops.get();
        let total_secs = self.progress.get_duration().as_secs_f64();
        let curr_secs = (time_now - self.last_update).as_secs_f64();
        let read = self.progress.bytes_read.get();
        let written = self.progress.bytes_written.get();
        let text = format!(
            "-----------------------\n\
            OPS:\n\
            pending: {:>10}\n\
            -----------------------\n\
            READ:\n\
            average: {:>10}/s\n\
            current: {:>10}/s\n\
            total:   {:>10}\n\
            -----------------------\n\
            WRITTEN:\n\
            average: {:>10}/s\n\
            current: {:>10}/s\n\
            total:   {:>10}",
            ops.pending(),
            rate(read, total_secs),
            rate(read.saturating_sub(self.last_read), curr_secs),
            bytesize::ByteSize(read),
            rate(written, total_secs),
            rate(written.saturating_sub(self.last_written), curr_secs),
            bytesize::ByteSize(written),
        );
        self.last_read = read;
        self.last_written = written;
        self.last_update = time_now;
        text
    }
}
