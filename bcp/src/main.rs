use anyhow::{Context, anyhow};
use clap::Parser;
use tracing::instrument;

use common::counting::{CountingReadAt, CountingReader, CountingWriter};
use common::{CopyConfig, CopyMode};

#[derive(Parser, Debug, Clone)]
#[command(
    name = "bcp",
    version,
    about = "Copy a single file fast - block-parallel for regular files, double-buffered streaming otherwise",
    long_about = "`bcp` copies one file, either by streaming it through two alternating buffers or by splitting it into blocks that are read and written concurrently at their own offsets.

Use `-` as SRC to read from stdin or as DST to write to stdout; streams are always copied sequentially.

EXAMPLES:
    # Copy a large image with 8 readers and 8 writers
    bcp disk.img /backup/disk.img --workers 8 --block-size 8MiB --progress

    # Stream from stdin into a file
    cat data.bin | bcp - /tmp/data.bin --summary"
)]
struct Args {
    // Copy options
    /// Copy engine to use
    ///
    /// `auto` uses the block-parallel engine when the source is a non-empty regular file and the
    /// destination is a path, the sequential engine otherwise.
    #[arg(long, value_name = "MODE", help_heading = "Copy options")]
    mode: Option<CopyMode>,

    /// Overwrite the destination if it exists
    #[arg(short, long, help_heading = "Copy options")]
    overwrite: bool,

    /// Block size for the block-parallel engine, e.g. "4MiB"
    #[arg(long, value_name = "SIZE", help_heading = "Copy options")]
    block_size: Option<bytesize::ByteSize>,

    /// Concurrent readers (and, separately, writers) for the block-parallel engine (0 = number of CPU cores)
    #[arg(long, value_name = "N", help_heading = "Copy options")]
    workers: Option<usize>,

    /// Buffer size for the sequential engine, e.g. "256KiB"
    #[arg(long, value_name = "SIZE", help_heading = "Copy options")]
    buffer_size: Option<bytesize::ByteSize>,

    /// JSON file with copy settings; command line flags take precedence
    #[arg(long, value_name = "PATH", help_heading = "Copy options")]
    config: Option<std::path::PathBuf>,

    // Progress & output
    /// Show progress
    #[arg(long, help_heading = "Progress & output")]
    progress: bool,

    /// Set delay between progress updates
    ///
    /// If specified, --progress flag is implied. Accepts human-readable durations like "200ms", "10s", "5min".
    #[arg(long, value_name = "DELAY", help_heading = "Progress & output")]
    progress_delay: Option<String>,

    /// Print summary at the end
    #[arg(long, help_heading = "Progress & output")]
    summary: bool,

    /// Verbose level (implies "summary"): -v INFO / -vv DEBUG / -vvv TRACE (default: ERROR)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, help_heading = "Progress & output")]
    verbose: u8,

    /// Quiet mode, don't report errors
    #[arg(short = 'q', long = "quiet", help_heading = "Progress & output")]
    quiet: bool,

    // Advanced settings
    /// Number of worker threads (0 = number of CPU cores)
    #[arg(
        long,
        default_value = "0",
        value_name = "N",
        help_heading = "Advanced settings"
    )]
    max_workers: usize,

    /// Number of blocking worker threads (0 = Tokio default of 512)
    #[arg(
        long,
        default_value = "0",
        value_name = "N",
        help_heading = "Advanced settings"
    )]
    max_blocking_threads: usize,

    // ARGUMENTS
    /// Source file, or `-` for stdin
    #[arg()]
    src: String,

    /// Destination file, or `-` for stdout
    #[arg()]
    dst: String,
}

const STDIO: &str = "-";

impl Args {
    /// Settings from the config file (if any) with command line overrides applied.
    fn copy_config(&self) -> anyhow::Result<CopyConfig> {
        let mut config = match &self.config {
            Some(path) => CopyConfig::load(path)?,
            None => CopyConfig::default(),
        };
        if let Some(mode) = self.mode {
            config.mode = mode;
        }
        if let Some(block_size) = self.block_size {
            config.block_size = block_size.as_u64();
        }
        if let Some(workers) = self.workers {
            config.workers = workers;
        }
        if let Some(buffer_size) = self.buffer_size {
            config.buffer_size = buffer_size.as_u64();
        }
        if let Some(delay) = &self.progress_delay {
            config.progress_delay = humantime::parse_duration(delay)
                .with_context(|| format!("invalid progress delay {delay:?}"))?;
        }
        config.validate()?;
        Ok(config)
    }
}

/// Engine picked for a given source and destination.
async fn resolve_mode(args: &Args, mode: CopyMode) -> anyhow::Result<CopyMode> {
    let streaming = args.src == STDIO || args.dst == STDIO;
    match mode {
        CopyMode::Sequential => Ok(CopyMode::Sequential),
        CopyMode::Blocks if streaming => Err(anyhow!(
            "block mode needs a regular source file and a destination path, stdin/stdout can only be copied sequentially"
        )),
        CopyMode::Blocks => Ok(CopyMode::Blocks),
        CopyMode::Auto if streaming => Ok(CopyMode::Sequential),
        CopyMode::Auto => {
            let metadata = tokio::fs::metadata(&args.src)
                .await
                .with_context(|| format!("cannot access source {:?}", args.src))?;
            if metadata.is_file() && metadata.len() > 0 {
                Ok(CopyMode::Blocks)
            } else {
                Ok(CopyMode::Sequential)
            }
        }
    }
}

async fn check_destination(args: &Args) -> anyhow::Result<()> {
    if args.dst == STDIO {
        return Ok(());
    }
    if args.src != STDIO {
        // opening the destination truncates it, which would destroy a source it aliases
        let src = tokio::fs::canonicalize(&args.src).await;
        let dst = tokio::fs::canonicalize(&args.dst).await;
        if matches!((src, dst), (Ok(src), Ok(dst)) if src == dst) {
            return Err(anyhow!(
                "source {:?} and destination {:?} are the same file",
                args.src,
                args.dst
            ));
        }
    }
    if args.overwrite {
        return Ok(());
    }
    if tokio::fs::symlink_metadata(&args.dst).await.is_ok() {
        return Err(anyhow!(
            "destination {:?} already exists, use --overwrite to replace it",
            args.dst
        ));
    }
    Ok(())
}

#[instrument(skip(cancel))]
async fn copy_sequential(
    args: &Args,
    config: &CopyConfig,
    cancel: &tokio_util::sync::CancellationToken,
) -> anyhow::Result<common::Summary> {
    let progress = common::get_progress();
    let reader: Box<dyn tokio::io::AsyncRead + Unpin + Send> = if args.src == STDIO {
        Box::new(tokio::io::stdin())
    } else {
        Box::new(
            tokio::fs::File::open(&args.src)
                .await
                .with_context(|| format!("cannot open source {:?}", args.src))?,
        )
    };
    let writer: Box<dyn tokio::io::AsyncWrite + Unpin + Send> = if args.dst == STDIO {
        Box::new(tokio::io::stdout())
    } else {
        Box::new(
            tokio::fs::File::create(&args.dst)
                .await
                .with_context(|| format!("cannot create destination {:?}", args.dst))?,
        )
    };
    let mut reader = CountingReader::new(reader, &progress.bytes_read);
    let mut writer = CountingWriter::new(writer, &progress.bytes_written);
    let buffer_size = usize::try_from(config.buffer_size)?;
    let summary =
        common::pipeline::double_buffered_copy(&mut reader, &mut writer, buffer_size, cancel)
            .await
            .with_context(|| format!("failed copying {:?} to {:?}", args.src, args.dst))?;
    Ok(summary)
}

#[instrument(skip(cancel))]
async fn copy_blocks(
    args: &Args,
    config: &CopyConfig,
    cancel: &tokio_util::sync::CancellationToken,
) -> anyhow::Result<common::Summary> {
    let progress = common::get_progress();
    let src = tokio::fs::File::open(&args.src)
        .await
        .with_context(|| format!("cannot open source {:?}", args.src))?;
    let size = src
        .metadata()
        .await
        .with_context(|| format!("cannot read metadata of {:?}", args.src))?
        .len();
    let dst = tokio::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(false)
        .open(&args.dst)
        .await
        .with_context(|| format!("cannot create destination {:?}", args.dst))?;
    // blocks land at their own offsets, the destination must already have its final length
    dst.set_len(size)
        .await
        .with_context(|| format!("cannot resize destination {:?} to {size} bytes", args.dst))?;
    if size == 0 {
        tracing::debug!("source {:?} is empty, nothing to copy", args.src);
        return Ok(common::Summary::default());
    }
    let settings = common::blocks::Settings {
        size,
        block_size: config.block_size,
        workers: config.effective_workers(),
    };
    tracing::info!(
        "copying {} in {} blocks of {} with {} workers",
        bytesize::ByteSize(size),
        settings.block_count(),
        bytesize::ByteSize(settings.block_size),
        settings.workers
    );
    let src = std::sync::Arc::new(CountingReadAt::new(
        src.into_std().await,
        &progress.ops,
        &progress.bytes_read,
    ));
    let dst = std::sync::Arc::new(common::counting::CountingWriteAt::new(
        dst.into_std().await,
        &progress.ops,
        &progress.bytes_written,
    ));
    let summary = common::blocks::copy_in_blocks(src, dst, &settings, cancel)
        .await
        .with_context(|| format!("failed copying {:?} to {:?}", args.src, args.dst))?;
    Ok(summary)
}

async fn async_main(
    args: Args,
    config: CopyConfig,
    cancel: tokio_util::sync::CancellationToken,
) -> anyhow::Result<common::Summary> {
    let mode = resolve_mode(&args, config.mode).await?;
    check_destination(&args).await?;
    tracing::debug!("copying {:?} to {:?} using {mode} mode", args.src, args.dst);
    match mode {
        CopyMode::Blocks => copy_blocks(&args, &config, &cancel).await,
        CopyMode::Sequential | CopyMode::Auto => copy_sequential(&args, &config, &cancel).await,
    }
}

fn main() -> Result<(), anyhow::Error> {
    let args = Args::parse();
    let config = args.copy_config()?;
    let progress = if args.progress || args.progress_delay.is_some() {
        Some(common::ProgressSettings {
            delay: config.progress_delay,
        })
    } else {
        None
    };
    let output = common::OutputConfig {
        quiet: args.quiet,
        verbose: args.verbose,
        print_summary: args.summary,
    };
    let runtime = common::RuntimeConfig {
        max_workers: args.max_workers,
        max_blocking_threads: args.max_blocking_threads,
    };
    let func = move |cancel| async_main(args, config, cancel);
    let res = common::run(progress, output, runtime, func);
    if res.is_none() {
        std::process::exit(1);
    }
    Ok(())
}
