//! Journal configuration.
//!
//! Handles the serializable configuration surface (credentials, target
//! bucket, batching bounds, directory layout) plus the injectable tuning
//! knobs used to shrink store limits in tests.

use serde::{Deserialize, Serialize};
use snafu::prelude::*;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::codec::Compression;
use crate::error::{
    ConfigError, EmptyBucketSnafu, EmptyDirectoryFormatSnafu, EmptyIdSnafu,
    EmptyLocalDirectorySnafu, MissingBatchBoundSnafu, ReadFileSnafu, ShardsOutOfRangeSnafu,
    YamlParseSnafu,
};

/// Byte size constants (binary/IEC units).
pub const KB: u64 = 1024;
pub const MB: u64 = 1024 * KB;

/// Smallest non-terminal multipart part the store accepts.
pub const MIN_PART_SIZE: u64 = 5 * MB;

/// Parts per journal file before rolling to the next file number.
pub const MAX_PARTS_PER_FILE: u64 = 500;

/// Maximum shard fan-out (one symbol per digit and lowercase letter).
pub const MAX_SHARDS: u32 = 36;

/// Process-wide store limits and pacing, injectable for tests.
#[derive(Debug, Clone)]
pub struct Tuning {
    /// Non-terminal parts must exceed this many bytes.
    pub min_part_size: u64,
    /// Part count per file before file rollover.
    pub max_parts_per_file: u64,
    /// Sleep between retries of failed store calls.
    pub retry_delay: Duration,
    /// Take timeout used by the coordinator once the close latch is set.
    pub drain_take_timeout: Duration,
}

impl Default for Tuning {
    fn default() -> Self {
        Self {
            min_part_size: MIN_PART_SIZE,
            max_parts_per_file: MAX_PARTS_PER_FILE,
            retry_delay: Duration::from_secs(1),
            drain_take_timeout: Duration::from_secs(5),
        }
    }
}

/// Main configuration for a journal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalConfig {
    /// Target bucket.
    pub bucket: String,

    /// Static access key; when absent the SDK environment chain is used.
    #[serde(default)]
    pub access_key: Option<String>,

    /// Static secret key.
    #[serde(default)]
    pub secret_key: Option<String>,

    /// Region override.
    #[serde(default)]
    pub region: Option<String>,

    /// Custom endpoint for S3-compatible stores; forces path-style requests.
    #[serde(default)]
    pub endpoint: Option<String>,

    /// strftime format for time-partitioned directories. Literal characters
    /// before the first `%` double as the multipart listing prefix.
    #[serde(default = "default_directory_format")]
    pub directory_format: String,

    /// Path for durable-queue state; created if missing.
    pub local_directory: PathBuf,

    /// Chunk compression applied after encoding.
    #[serde(default)]
    pub compression: Compression,

    /// Bytes emitted after each encoded entry.
    #[serde(default = "default_delimiter")]
    pub delimiter: Vec<u8>,

    /// Flush a batch once it holds this many entries.
    #[serde(default)]
    pub max_batch_size: Option<usize>,

    /// Flush a batch at least this often (default 60s).
    #[serde(default = "default_max_batch_latency_ms")]
    pub max_batch_latency_ms: Option<u64>,

    /// Sync the durable queue to disk on every put.
    #[serde(default = "default_fsync")]
    pub fsync: bool,

    /// Journal identifier embedded in file keys; must be stable across
    /// restarts. Defaults to the hostname with `/` replaced by `_`.
    #[serde(default = "default_id")]
    pub id: String,

    /// Fan out across this many independent journals (1..=36).
    #[serde(default)]
    pub shards: Option<u32>,
}

fn default_directory_format() -> String {
    "%Y/%m/%d".to_string()
}

fn default_delimiter() -> Vec<u8> {
    vec![b'\n']
}

fn default_max_batch_latency_ms() -> Option<u64> {
    Some(60_000)
}

fn default_fsync() -> bool {
    true
}

fn default_id() -> String {
    gethostname::gethostname()
        .to_string_lossy()
        .replace('/', "_")
}

impl JournalConfig {
    /// Minimal configuration for the given bucket and local state directory.
    pub fn new(bucket: impl Into<String>, local_directory: impl Into<PathBuf>) -> Self {
        Self {
            bucket: bucket.into(),
            access_key: None,
            secret_key: None,
            region: None,
            endpoint: None,
            directory_format: default_directory_format(),
            local_directory: local_directory.into(),
            compression: Compression::default(),
            delimiter: default_delimiter(),
            max_batch_size: None,
            max_batch_latency_ms: default_max_batch_latency_ms(),
            fsync: default_fsync(),
            id: default_id(),
            shards: None,
        }
    }

    /// Load configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref()).context(ReadFileSnafu)?;
        let config: JournalConfig = serde_yaml::from_str(&content).context(YamlParseSnafu)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        ensure!(!self.bucket.is_empty(), EmptyBucketSnafu);
        ensure!(
            !self.local_directory.as_os_str().is_empty(),
            EmptyLocalDirectorySnafu
        );
        ensure!(!self.id.is_empty(), EmptyIdSnafu);
        ensure!(!self.directory_format.is_empty(), EmptyDirectoryFormatSnafu);
        ensure!(
            self.max_batch_size.is_some() || self.max_batch_latency_ms.is_some(),
            MissingBatchBoundSnafu
        );
        if let Some(shards) = self.shards {
            ensure!(
                (1..=MAX_SHARDS).contains(&shards),
                ShardsOutOfRangeSnafu { shards }
            );
        }
        Ok(())
    }

    /// Batch latency as a `Duration`, when configured.
    pub fn max_batch_latency(&self) -> Option<Duration> {
        self.max_batch_latency_ms.map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> JournalConfig {
        let mut config = JournalConfig::new("journal-bucket", "/tmp/drift-queue");
        config.id = "test-host".to_string();
        config
    }

    #[test]
    fn defaults_are_valid() {
        let config = base();
        config.validate().unwrap();
        assert_eq!(config.directory_format, "%Y/%m/%d");
        assert_eq!(config.delimiter, vec![b'\n']);
        assert_eq!(config.max_batch_latency(), Some(Duration::from_secs(60)));
        assert!(config.fsync);
    }

    #[test]
    fn rejects_empty_bucket() {
        let mut config = base();
        config.bucket.clear();
        assert!(matches!(config.validate(), Err(ConfigError::EmptyBucket)));
    }

    #[test]
    fn rejects_missing_batch_bounds() {
        let mut config = base();
        config.max_batch_size = None;
        config.max_batch_latency_ms = None;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingBatchBound)
        ));
    }

    #[test]
    fn rejects_out_of_range_shards() {
        let mut config = base();
        config.shards = Some(0);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ShardsOutOfRange { shards: 0 })
        ));
        config.shards = Some(37);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ShardsOutOfRange { shards: 37 })
        ));
        config.shards = Some(36);
        config.validate().unwrap();
    }

    #[test]
    fn config_yaml_parsing() {
        let yaml = r#"
bucket: journal-bucket
local_directory: /var/lib/drift
max_batch_size: 100000
compression: gzip
id: app-01
"#;
        let config: JournalConfig = serde_yaml::from_str(yaml).unwrap();
        config.validate().unwrap();
        assert_eq!(config.bucket, "journal-bucket");
        assert_eq!(config.max_batch_size, Some(100_000));
        assert!(matches!(config.compression, Compression::Gzip));
    }

    #[test]
    fn default_id_has_no_slashes() {
        assert!(!default_id().contains('/'));
    }
}
