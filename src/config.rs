use crate::collector::CollectorConfig;
use crate::container::Compression;
use crate::merger::MergeTrigger;
use crate::partition::RowLayout;
use crate::MergeError;
use clap::Args;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

pub const ENV_SPLIT: &str = "ROWMERGE_SPLIT";
pub const ENV_SYNC_RATE: &str = "ROWMERGE_SYNC_RATE";
pub const ENV_OUTPUT: &str = "ROWMERGE_OUTPUT";
pub const ENV_MERGE_THRESHOLD: &str = "ROWMERGE_MERGE_THRESHOLD";
pub const ENV_CLIENT_MEMORY_LIMIT: &str = "ROWMERGE_CLIENT_MEMORY_LIMIT";

const DEFAULT_SPLIT: usize = 0;
const DEFAULT_SYNC_RATE: u64 = 100;
const DEFAULT_OUTPUT: &str = "merged.rmc";

/// Command line of `rowmerge run`. Unset options fall back to the
/// `ROWMERGE_*` environment, then to built-in defaults.
#[derive(Debug, Clone, Args)]
pub struct RunArgs {
    /// Number of ranks in the process group
    #[arg(short = 'n', long, default_value_t = 4)]
    pub world_size: usize,
    /// Number of rows, each with its own collector and output (0 = one shared row)
    #[arg(short, long)]
    pub split: Option<usize>,
    /// Events between two snapshots of a worker
    #[arg(long)]
    pub sync_rate: Option<u64>,
    /// Events generated by each worker
    #[arg(short, long, default_value_t = 1000)]
    pub events: u64,
    /// Table rows produced per event
    #[arg(long, default_value_t = 4)]
    pub records_per_event: usize,
    /// Histogram bins
    #[arg(long, default_value_t = 50)]
    pub bins: usize,
    /// Per-event delay in microseconds
    #[arg(long, default_value_t = 0)]
    pub delay_us: u64,
    /// Output file pattern; row `c` writes `<stem>_<c>.<ext>`
    #[arg(short, long)]
    pub output: Option<PathBuf>,
    /// Merge only when the client statistics call for it, with this threshold
    #[arg(long)]
    pub merge_threshold: Option<f32>,
    /// Resident bytes of client containers before the oldest are moved to disk
    #[arg(long)]
    pub client_memory_limit: Option<usize>,
    /// Payload compression: none or lz4
    #[arg(long, default_value = "lz4", value_parser = parse_compression)]
    pub compression: Compression,
    /// Consecutive merge failures tolerated before the collector gives up
    #[arg(long, default_value_t = 3)]
    pub max_merge_failures: u32,
}

impl Default for RunArgs {
    fn default() -> Self {
        Self {
            world_size: 4,
            split: None,
            sync_rate: None,
            events: 1000,
            records_per_event: 4,
            bins: 50,
            delay_us: 0,
            output: None,
            merge_threshold: None,
            client_memory_limit: None,
            compression: Compression::Lz4,
            max_merge_failures: 3,
        }
    }
}

pub fn parse_compression(value: &str) -> Result<Compression, String> {
    match value.to_ascii_lowercase().as_str() {
        "none" | "off" => Ok(Compression::None),
        "lz4" => Ok(Compression::Lz4),
        other => Err(format!("unknown compression '{}', expected none or lz4", other)),
    }
}

/// Workload parameters of one worker rank.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerConfig {
    pub sync_rate: u64,
    pub events: u64,
    pub records_per_event: usize,
    pub bins: usize,
    pub delay: Duration,
    pub compression: Compression,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunConfig {
    pub world_size: usize,
    pub split: usize,
    pub sync_rate: u64,
    pub events: u64,
    pub records_per_event: usize,
    pub bins: usize,
    pub delay: Duration,
    pub output: PathBuf,
    pub merge_threshold: Option<f32>,
    pub client_memory_limit: Option<usize>,
    pub compression: Compression,
    pub max_consecutive_merge_failures: u32,
}

impl RunConfig {
    /// Resolve against the process environment.
    pub fn from_env(args: RunArgs) -> Result<Self, MergeError> {
        Self::resolve(args, |key| std::env::var(key).ok())
    }

    /// Resolve `args` against `lookup` (environment style) and validate the result.
    pub fn resolve<F>(args: RunArgs, lookup: F) -> Result<Self, MergeError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let split = match args.split {
            Some(v) => v,
            None => env_value(&lookup, ENV_SPLIT)?.unwrap_or(DEFAULT_SPLIT),
        };
        let sync_rate = match args.sync_rate {
            Some(v) => v,
            None => env_value(&lookup, ENV_SYNC_RATE)?.unwrap_or(DEFAULT_SYNC_RATE),
        };
        let output = match args.output {
            Some(v) => v,
            None => lookup(ENV_OUTPUT)
                .filter(|v| !v.is_empty())
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_OUTPUT)),
        };
        let merge_threshold = match args.merge_threshold {
            Some(v) => Some(v),
            None => env_value(&lookup, ENV_MERGE_THRESHOLD)?,
        };
        let client_memory_limit = match args.client_memory_limit {
            Some(v) => Some(v),
            None => env_value(&lookup, ENV_CLIENT_MEMORY_LIMIT)?,
        };

        let config = Self {
            world_size: args.world_size,
            split,
            sync_rate,
            events: args.events,
            records_per_event: args.records_per_event,
            bins: args.bins,
            delay: Duration::from_micros(args.delay_us),
            output,
            merge_threshold,
            client_memory_limit,
            compression: args.compression,
            max_consecutive_merge_failures: args.max_merge_failures,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), MergeError> {
        RowLayout::compute(self.world_size, self.split)?;
        if self.world_size < 2 {
            return Err(MergeError::Configuration(format!(
                "world size {} leaves no worker next to the collector",
                self.world_size
            )));
        }
        if self.sync_rate == 0 {
            return Err(MergeError::Configuration("sync rate must be at least 1".to_string()));
        }
        if self.bins == 0 {
            return Err(MergeError::Configuration("histogram needs at least one bin".to_string()));
        }
        if let Some(threshold) = self.merge_threshold {
            if !(threshold > 0.0 && threshold.is_finite()) {
                return Err(MergeError::Configuration(format!(
                    "merge threshold {} must be a positive number",
                    threshold
                )));
            }
        }
        if self.max_consecutive_merge_failures == 0 {
            return Err(MergeError::Configuration(
                "at least one merge failure must be tolerated".to_string(),
            ));
        }
        if self.output.file_name().is_none() {
            return Err(MergeError::Configuration(format!(
                "output pattern {} has no file name",
                self.output.display()
            )));
        }
        Ok(())
    }

    pub fn merge_trigger(&self) -> MergeTrigger {
        match self.merge_threshold {
            Some(threshold) => MergeTrigger::Threshold(threshold),
            None => MergeTrigger::EveryMessage,
        }
    }

    pub fn collector_config(&self) -> CollectorConfig {
        CollectorConfig {
            output_pattern: self.output.clone(),
            merge_trigger: self.merge_trigger(),
            client_memory_limit: self.client_memory_limit,
            compression: self.compression,
            max_consecutive_merge_failures: self.max_consecutive_merge_failures,
        }
    }

    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            sync_rate: self.sync_rate,
            events: self.events,
            records_per_event: self.records_per_event,
            bins: self.bins,
            delay: self.delay,
            compression: self.compression,
        }
    }
}

fn env_value<T, F>(lookup: &F, key: &str) -> Result<Option<T>, MergeError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| MergeError::Configuration(format!("{}={:?}: {}", key, raw, e))),
        _ => Ok(None),
    }
}
