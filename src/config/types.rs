use crate::batch::{FlushPolicy, RetryPolicy};
use crate::event::TableId;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    pub source: SourceConfig,
    pub target: TargetConfig,
    #[serde(default)]
    pub batch: BatchConfig,
    #[serde(default)]
    pub writer: WriterConfig,
    #[serde(default)]
    pub schema: SchemaConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub web: Option<WebConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    #[serde(rename = "type", default)]
    pub source_type: SourceType,
    pub path: PathBuf,
    #[serde(default)]
    pub follow: bool,
    #[serde(default = "default_poll_interval", with = "humantime_serde")]
    pub poll_interval: Duration,
    #[serde(default)]
    pub snapshot_mode: SnapshotMode,
    /// Default schema for DDL statements that do not name one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database: Option<String>,
    /// `schema.table` or `schema.*` entries. Empty replicates everything.
    #[serde(default)]
    pub include_tables: Vec<String>,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            source_type: SourceType::File,
            path: PathBuf::new(),
            follow: false,
            poll_interval: default_poll_interval(),
            snapshot_mode: SnapshotMode::Initial,
            database: None,
            include_tables: Vec::new(),
        }
    }
}

impl SourceConfig {
    pub fn includes(&self, table: &TableId) -> bool {
        if self.include_tables.is_empty() {
            return true;
        }
        self.include_tables.iter().any(|entry| match entry.split_once('.') {
            Some((schema, "*")) => schema.eq_ignore_ascii_case(&table.schema),
            Some((schema, name)) => {
                schema.eq_ignore_ascii_case(&table.schema) && name.eq_ignore_ascii_case(&table.name)
            }
            None => entry.eq_ignore_ascii_case(&table.name),
        })
    }
}

fn default_poll_interval() -> Duration {
    Duration::from_millis(200)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    #[default]
    File,
}

/// How to start when no checkpoint has been stored yet.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotMode {
    #[default]
    Initial,
    SchemaOnly,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetConfig {
    pub path: PathBuf,
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("target.duckdb"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchConfig {
    #[serde(default = "default_max_rows")]
    pub max_rows: usize,
    #[serde(default = "default_max_bytes")]
    pub max_bytes: usize,
    #[serde(default = "default_max_latency", with = "humantime_serde")]
    pub max_latency: Duration,
    #[serde(default = "default_max_buffered_rows")]
    pub max_buffered_rows: usize,
    #[serde(default = "default_max_parked_rows")]
    pub max_parked_rows: usize,
    #[serde(default = "default_check_interval", with = "humantime_serde")]
    pub check_interval: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_rows: default_max_rows(),
            max_bytes: default_max_bytes(),
            max_latency: default_max_latency(),
            max_buffered_rows: default_max_buffered_rows(),
            max_parked_rows: default_max_parked_rows(),
            check_interval: default_check_interval(),
        }
    }
}

impl BatchConfig {
    pub fn flush_policy(&self) -> FlushPolicy {
        FlushPolicy {
            max_rows: self.max_rows,
            max_bytes: self.max_bytes,
            max_latency: self.max_latency,
            max_buffered_rows: self.max_buffered_rows,
            max_parked_rows: self.max_parked_rows,
        }
    }
}

fn default_max_rows() -> usize {
    100_000
}

fn default_max_bytes() -> usize {
    64 * 1024 * 1024
}

fn default_max_latency() -> Duration {
    Duration::from_secs(1)
}

fn default_max_buffered_rows() -> usize {
    500_000
}

fn default_max_parked_rows() -> usize {
    500_000
}

fn default_check_interval() -> Duration {
    Duration::from_millis(100)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriterConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff", with = "humantime_serde")]
    pub initial_backoff: Duration,
    #[serde(default = "default_max_backoff", with = "humantime_serde")]
    pub max_backoff: Duration,
    #[serde(default)]
    pub on_failure: FailurePolicy,
    #[serde(default = "default_rebuffer_delay", with = "humantime_serde")]
    pub rebuffer_delay: Duration,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff: default_initial_backoff(),
            max_backoff: default_max_backoff(),
            on_failure: FailurePolicy::Halt,
            rebuffer_delay: default_rebuffer_delay(),
        }
    }
}

impl WriterConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            initial_backoff: self.initial_backoff,
            max_backoff: self.max_backoff,
        }
    }
}

fn default_max_attempts() -> u32 {
    5
}

fn default_initial_backoff() -> Duration {
    Duration::from_millis(100)
}

fn default_max_backoff() -> Duration {
    Duration::from_secs(10)
}

fn default_rebuffer_delay() -> Duration {
    Duration::from_secs(5)
}

/// What to do with a batch whose flush exhausted its retries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Fault the table and keep the batch unacknowledged.
    #[default]
    Halt,
    /// Put the batch back and try again after `rebuffer_delay`.
    Rebuffer,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_max_pending_events")]
    pub max_pending_events: usize,
}

impl Default for SchemaConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            max_pending_events: default_max_pending_events(),
        }
    }
}

fn default_max_retries() -> u32 {
    3
}

fn default_max_pending_events() -> usize {
    10_000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default = "default_shutdown_timeout", with = "humantime_serde")]
    pub shutdown_timeout: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            shutdown_timeout: default_shutdown_timeout(),
        }
    }
}

fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(30)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebConfig {
    pub listen: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config_fills_defaults() {
        let yaml = r#"
source:
  path: /tmp/changes.jsonl
target:
  path: /tmp/target.duckdb
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.source.source_type, SourceType::File);
        assert_eq!(config.source.poll_interval, Duration::from_millis(200));
        assert_eq!(config.batch.max_rows, 100_000);
        assert_eq!(config.writer.on_failure, FailurePolicy::Halt);
        assert_eq!(config.pipeline.shutdown_timeout, Duration::from_secs(30));
        assert!(config.web.is_none());
    }

    #[test]
    fn test_durations_use_human_units() {
        let yaml = r#"
source:
  path: a.jsonl
  poll_interval: 50ms
  snapshot_mode: schema_only
target:
  path: t.duckdb
batch:
  max_latency: 2s
writer:
  on_failure: rebuffer
  rebuffer_delay: 1m
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.source.poll_interval, Duration::from_millis(50));
        assert_eq!(config.source.snapshot_mode, SnapshotMode::SchemaOnly);
        assert_eq!(config.batch.max_latency, Duration::from_secs(2));
        assert_eq!(config.writer.on_failure, FailurePolicy::Rebuffer);
        assert_eq!(config.writer.rebuffer_delay, Duration::from_secs(60));
    }

    #[test]
    fn test_include_tables_filter() {
        let mut source = SourceConfig::default();
        assert!(source.includes(&TableId::new("shop", "orders")));

        source.include_tables = vec!["shop.orders".into(), "audit.*".into()];
        assert!(source.includes(&TableId::new("shop", "orders")));
        assert!(source.includes(&TableId::new("AUDIT", "events")));
        assert!(!source.includes(&TableId::new("shop", "customers")));
    }
}
