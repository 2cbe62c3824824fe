//! Configuration types for runtime, output and copy settings

use anyhow::Context;

/// Runtime configuration for tokio and thread pools
#[derive(Debug, Clone, Copy, Default)]
pub struct RuntimeConfig {
    /// Number of worker threads (0 = number of CPU cores)
    pub max_workers: usize,
    /// Number of blocking threads (0 = tokio default of 512)
    pub max_blocking_threads: usize,
}

/// Output and logging configuration
#[derive(Debug, Clone, Copy, Default)]
pub struct OutputConfig {
    /// Suppress error output
    pub quiet: bool,
    /// Verbosity level: 0=ERROR, 1=INFO, 2=DEBUG, 3=TRACE
    pub verbose: u8,
    /// Print summary statistics at the end
    pub print_summary: bool,
}

impl OutputConfig {
    /// Default tracing filter directive for the configured verbosity.
    #[must_use]
    pub fn log_level(&self) -> &'static str {
        if self.quiet {
            return "off";
        }
        match self.verbose {
            0 => "error",
            1 => "info",
            2 => "debug",
            _ => "trace",
        }
    }
}

/// Progress reporting configuration
#[derive(Debug, Clone, Copy)]
pub struct ProgressSettings {
    /// Delay between progress updates
    pub delay: std::time::Duration,
}

/// Which copy engine to use.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum, serde::Serialize, serde::Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum CopyMode {
    /// Blocks for regular files, sequential for everything else
    #[default]
    Auto,
    Sequential,
    Blocks,
}

impl std::str::FromStr for CopyMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "auto" => Ok(CopyMode::Auto),
            "sequential" => Ok(CopyMode::Sequential),
            "blocks" => Ok(CopyMode::Blocks),
            other => Err(anyhow::anyhow!(
                "unknown copy mode {other:?}, expected one of: auto, sequential, blocks"
            )),
        }
    }
}

impl std::fmt::Display for CopyMode {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let name = match self {
            CopyMode::Auto => "auto",
            CopyMode::Sequential => "sequential",
            CopyMode::Blocks => "blocks",
        };
        write!(f, "{name}")
    }
}

pub const DEFAULT_BLOCK_SIZE: u64 = 4 * 1024 * 1024;
pub const DEFAULT_BUFFER_SIZE: u64 = 256 * 1024;
pub const DEFAULT_PROGRESS_DELAY: std::time::Duration = std::time::Duration::from_secs(1);

/// Copy settings, loadable from a JSON file.
///
/// Every field is optional in the file, missing ones take their defaults. Unknown fields are
/// rejected so that a misspelled setting is not silently ignored.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CopyConfig {
    pub mode: CopyMode,
    /// Block size for the block-parallel engine (bytes)
    pub block_size: u64,
    /// Concurrent readers and writers for the block-parallel engine (0 = number of CPU cores)
    pub workers: usize,
    /// Buffer size for the sequential engine (bytes)
    pub buffer_size: u64,
    /// Delay between progress updates, e.g. "500ms" or "2s"
    #[serde(with = "human_duration")]
    pub progress_delay: std::time::Duration,
}

impl Default for CopyConfig {
    fn default() -> Self {
        Self {
            mode: CopyMode::Auto,
            block_size: DEFAULT_BLOCK_SIZE,
            workers: 0,
            buffer_size: DEFAULT_BUFFER_SIZE,
            progress_delay: DEFAULT_PROGRESS_DELAY,
        }
    }
}

impl CopyConfig {
    /// Reads a JSON config file.
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed reading config file {path:?}"))?;
        Self::from_json(&text).with_context(|| format!("invalid config file {path:?}"))
    }

    pub fn from_json(text: &str) -> anyhow::Result<Self> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration and return errors if invalid
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.block_size == 0 {
            anyhow::bail!("block_size must be greater than 0");
        }
        if self.buffer_size == 0 {
            anyhow::bail!("buffer_size must be greater than 0");
        }
        if usize::try_from(self.block_size).is_err() || usize::try_from(self.buffer_size).is_err()
        {
            anyhow::bail!("buffer sizes must fit in memory");
        }
        Ok(())
    }

    /// Number of block workers, resolving 0 to the number of CPU cores.
    #[must_use]
    pub fn effective_workers(&self) -> usize {
        if self.workers > 0 {
            return self.workers;
        }
        num_cpus::get()
    }
}

/// Serializes durations as human readable strings ("1s", "250ms").
mod human_duration {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        duration: &std::time::Duration,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<std::time::Duration, D::Error> {
        let text = String::deserialize(deserializer)?;
        humantime::parse_duration(&text).map_err(serde::de::Error::custom)
    }
}
