//! Structured concurrency for copy stages.
//!
//! Every stage of a copy runs under a [`TaskGroup`] (or, for stages that borrow their I/O
//! handles, under `supervise` driven by `tokio::join!`). The first error reported by any stage
//! is recorded and cancels the group token so that sibling stages stop starting new work. Panics
//! are caught and recorded as [`CopyError::Panic`].

use futures::FutureExt;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::error::CopyError;

/// First-error slot shared by the stages of one operation.
#[derive(Debug)]
pub(crate) struct Failure {
    cancel: CancellationToken,
    first: std::sync::Mutex<Option<CopyError>>,
}

impl Failure {
    /// Creates a slot whose token is a child of `parent`: cancelling `parent` stops the operation,
    /// a failing stage does not cancel `parent`.
    pub(crate) fn new(parent: &CancellationToken) -> Self {
        Self {
            cancel: parent.child_token(),
            first: std::sync::Mutex::new(None),
        }
    }

    pub(crate) fn token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub(crate) fn record(&self, error: CopyError) {
        {
            let mut first = self
                .first
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            if first.is_none() {
                if !error.is_cancelled() {
                    tracing::debug!("stage failed, cancelling siblings: {error}");
                }
                *first = Some(error);
            }
        }
        self.cancel.cancel();
    }

    pub(crate) fn take(&self) -> Option<CopyError> {
        self.first
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take()
    }
}

/// Runs one stage to completion, recording its error or panic in `failure`.
pub(crate) async fn supervise<F>(failure: &Failure, stage: &str, fut: F)
where
    F: std::future::Future<Output = Result<(), CopyError>>,
{
    match std::panic::AssertUnwindSafe(fut).catch_unwind().await {
        Ok(Ok(())) => tracing::trace!("{stage} finished"),
        Ok(Err(error)) => failure.record(error),
        Err(payload) => {
            tracing::error!("{stage} panicked");
            failure.record(CopyError::panic(stage, payload.as_ref()));
        }
    }
}

/// Converts the error of a joined blocking task into a copy error.
pub(crate) fn join_error(stage: &str, error: tokio::task::JoinError) -> CopyError {
    match error.try_into_panic() {
        Ok(payload) => CopyError::panic(stage, payload.as_ref()),
        Err(_) => CopyError::Cancelled,
    }
}

/// Set of spawned stages sharing one cancellation token and one first-error slot.
#[derive(Debug)]
pub struct TaskGroup {
    failure: std::sync::Arc<Failure>,
    tasks: tokio::task::JoinSet<()>,
}

impl TaskGroup {
    #[must_use]
    pub fn new(parent: &CancellationToken) -> Self {
        Self {
            failure: std::sync::Arc::new(Failure::new(parent)),
            tasks: tokio::task::JoinSet::new(),
        }
    }

    /// Token observed by every stage of the group.
    #[must_use]
    pub fn token(&self) -> &CancellationToken {
        self.failure.token()
    }

    pub fn spawn<F>(&mut self, stage: String, fut: F)
    where
        F: std::future::Future<Output = Result<(), CopyError>> + Send + 'static,
    {
        let failure = self.failure.clone();
        let span = tracing::debug_span!("stage", name = %stage);
        self.tasks.spawn(
            async move {
                supervise(&failure, &stage, fut).await;
            }
            .instrument(span),
        );
    }

    /// Joins every stage and returns the first recorded error.
    pub async fn wait(mut self) -> Result<(), CopyError> {
        while let Some(res) = self.tasks.join_next().await {
            if let Err(error) = res {
                self.failure.record(join_error("stage", error));
            }
        }
        match self.failure.take() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}
