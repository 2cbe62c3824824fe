/// Reason a copy operation stopped.
///
/// The first error recorded by any stage becomes the result of the whole operation, siblings
/// that stop because of it never override it.
#[derive(Debug, thiserror::Error)]
pub enum CopyError {
    /// Invalid transfer parameters, detected before any I/O.
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("reading block {from}-{to}: {source}")]
    Read {
        from: u64,
        to: u64,
        #[source]
        source: std::io::Error,
    },
    #[error("writing block {from}-{to}: {source}")]
    Write {
        from: u64,
        to: u64,
        #[source]
        source: std::io::Error,
    },
    /// The destination accepted fewer bytes than were read and could not make progress.
    #[error("short write at offset {offset}: wrote {written} of {expected} bytes")]
    ShortWrite {
        offset: u64,
        expected: u64,
        written: u64,
    },
    #[error("copy cancelled")]
    Cancelled,
    #[error("{stage} panicked: {message}")]
    Panic { stage: String, message: String },
}

impl CopyError {
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, CopyError::Cancelled)
    }

    pub(crate) fn panic(stage: &str, payload: &(dyn std::any::Any + Send)) -> Self {
        let message = if let Some(msg) = payload.downcast_ref::<&str>() {
            (*msg).to_string()
        } else if let Some(msg) = payload.downcast_ref::<String>() {
            msg.clone()
        } else {
            "unknown panic payload".to_string()
        };
        CopyError::Panic {
            stage: stage.to_string(),
            message,
        }
    }
}

/// Error type for copy operations that preserves the transfer summary even on failure.
///
/// The summary of a failed operation is advisory only: it counts what completed before the
/// failure was observed and must not be used to resume a transfer.
///
/// # Logging Convention
/// The Display implementation shows the underlying reason, so you can log it with any format
/// specifier:
/// ```ignore
/// tracing::error!("copy failed: {}", &error);
/// tracing::error!("copy failed: {:#}", &error);
/// ```
#[derive(Debug, thiserror::Error)]
#[error("{source}")]
pub struct Error {
    #[source]
    pub source: CopyError,
    pub summary: Summary,
}

impl Error {
    #[must_use]
    pub fn new(source: CopyError, summary: Summary) -> Self {
        Error { source, summary }
    }
}

impl From<CopyError> for Error {
    fn from(source: CopyError) -> Self {
        Error::new(source, Summary::default())
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Summary {
    pub bytes_read: u64,
    pub bytes_written: u64,
    /// Buffers (sequential copy) or blocks (block copy) fully written to the destination.
    pub chunks_written: u64,
}

impl std::ops::Add for Summary {
    type Output = Self;
    fn add(self, other: Self) -> Self {
        Self {
            bytes_read: self.bytes_read + other.bytes_read,
            bytes_written: self.bytes_written + other.bytes_written,
            chunks_written: self.chunks_written + other.chunks_written,
        }
    }
}

impl std::fmt::Display for Summary {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "bytes read: {}\n\
            bytes written: {}\n\
            chunks written: {}",
            bytesize::ByteSize(self.bytes_read),
            bytesize::ByteSize(self.bytes_written),
            self.chunks_written,
        )
    }
}
