//! Common utilities and types for the bcp copy tool
//!
//! This crate provides the copy engines and the runtime plumbing shared by the `bcp` binary.
//!
//! # Engines
//!
//! - [`pipeline`] - double-buffered sequential copy between any async reader and writer
//! - [`blocks`] - block-parallel copy between random-access endpoints
//!
//! Both engines draw their memory from a fixed [`pool::BufferPool`], run their stages under a
//! [`group::TaskGroup`] style supervisor where the first error cancels the rest, and report a
//! [`Summary`] of what was transferred. Panics inside a stage are turned into errors.
//!
//! # Progress
//!
//! Transfers are observed through the counting decorators in [`counting`], which feed the
//! process-wide [`progress::Progress`] returned by [`get_progress`].
//!
//! # Runtime
//!
//! [`run`] builds the tokio runtime, installs logging, prints progress and turns Ctrl-C or
//! SIGTERM into cancellation of the token handed to the operation.

pub mod blocks;
pub mod config;
pub mod counting;
pub mod error;
pub mod group;
pub mod io;
pub mod pipeline;
pub mod pool;
pub mod progress;
pub mod region;

pub use config::{CopyConfig, CopyMode, OutputConfig, ProgressSettings, RuntimeConfig};
pub use error::{CopyError, Error, Summary};

use tokio_util::sync::CancellationToken;

static PROGRESS: std::sync::LazyLock<progress::Progress> =
    std::sync::LazyLock::new(progress::Progress::new);

/// Process-wide transfer statistics.
pub fn get_progress() -> &'static progress::Progress {
    &PROGRESS
}

fn init_logging(output: &OutputConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(output.log_level()));
    // stdout may carry copied data; a subscriber may already be installed when run repeatedly
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

fn build_runtime(runtime: &RuntimeConfig) -> std::io::Result<tokio::runtime::Runtime> {
    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all();
    if runtime.max_workers > 0 {
        builder.worker_threads(runtime.max_workers);
    }
    if runtime.max_blocking_threads > 0 {
        builder.max_blocking_threads(runtime.max_blocking_threads);
    }
    builder.build()
}

/// Cancels `token` on the first Ctrl-C or SIGTERM.
async fn cancel_on_shutdown_signal(token: CancellationToken) {
    #[cfg(unix)]
    {
        let mut sigterm =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(sigterm) => sigterm,
                Err(error) => {
                    tracing::warn!("cannot listen for SIGTERM: {error}");
                    if tokio::signal::ctrl_c().await.is_ok() {
                        tracing::warn!("received Ctrl-C, cancelling");
                        token.cancel();
                    }
                    return;
                }
            };
        tokio::select! {
            res = tokio::signal::ctrl_c() => {
                if res.is_err() {
                    return;
                }
                tracing::warn!("received Ctrl-C, cancelling");
            }
            _ = sigterm.recv() => tracing::warn!("received SIGTERM, cancelling"),
        }
    }
    #[cfg(not(unix))]
    {
        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
        tracing::warn!("received Ctrl-C, cancelling");
    }
    token.cancel();
}

async fn print_progress(delay: std::time::Duration, done: CancellationToken) {
    let mut printer = progress::ProgressPrinter::new(get_progress());
    loop {
        tokio::select! {
            _ = done.cancelled() => break,
            _ = tokio::time::sleep(delay) => eprintln!("{}", printer.print()),
        }
    }
}

/// Runs `func` on a new tokio runtime and reports its outcome.
///
/// `func` receives the root cancellation token, which is cancelled on Ctrl-C or SIGTERM. Returns
/// `None` if the runtime could not be built or `func` failed; the error has been printed unless
/// `output.quiet` is set.
pub fn run<Fut, S>(
    progress: Option<ProgressSettings>,
    output: OutputConfig,
    runtime: RuntimeConfig,
    func: impl FnOnce(CancellationToken) -> Fut,
) -> Option<S>
where
    S: std::fmt::Display,
    Fut: std::future::Future<Output = anyhow::Result<S>>,
{
    init_logging(&output);
    let runtime = match build_runtime(&runtime) {
        Ok(runtime) => runtime,
        Err(error) => {
            if !output.quiet {
                eprintln!("failed to start tokio runtime: {error}");
            }
            return None;
        }
    };
    let res = runtime.block_on(async move {
        let token = CancellationToken::new();
        let shutdown = tokio::spawn(cancel_on_shutdown_signal(token.clone()));
        let done = CancellationToken::new();
        let printer = progress
            .map(|settings| tokio::spawn(print_progress(settings.delay, done.clone())));
        let res = func(token).await;
        done.cancel();
        if let Some(printer) = printer {
            printer
                .await
                .unwrap_or_else(|error| tracing::error!("progress printer failed: {error}"));
        }
        shutdown.abort();
        res
    });
    match res {
        Ok(summary) => {
            if output.print_summary || output.verbose > 0 {
                eprintln!("{summary}");
            }
            Some(summary)
        }
        Err(error) => {
            if !output.quiet {
                eprintln!("{error:#}");
            }
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_returns_summary() {
        let res = run(None, OutputConfig::default(), RuntimeConfig::default(), |token| async move {
            assert!(!token.is_cancelled());
            anyhow::Ok(Summary {
                bytes_read: 4,
                bytes_written: 4,
                chunks_written: 1,
            })
        });
        assert_eq!(res.map(|summary| summary.bytes_written), Some(4));
    }

    #[test]
    fn run_reports_failure_as_none() {
        let output = OutputConfig {
            quiet: true,
            ..OutputConfig::default()
        };
        let runtime = RuntimeConfig {
            max_workers: 2,
            max_blocking_threads: 4,
        };
        let res: Option<Summary> = run(None, output, runtime, |_| async {
            Err(anyhow::anyhow!("copy failed"))
        });
        assert!(res.is_none());
    }

    #[test]
    fn run_with_progress_printer() {
        let progress = ProgressSettings {
            delay: std::time::Duration::from_millis(5),
        };
        let res = run(
            Some(progress),
            OutputConfig::default(),
            RuntimeConfig::default(),
            |_| async {
                get_progress().bytes_read.add(10);
                tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                anyhow::Ok(Summary::default())
            },
        );
        assert!(res.is_some());
    }
}
