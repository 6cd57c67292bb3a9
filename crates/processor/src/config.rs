//! Configuration types for the stream processor
//!
//! [`ProcessorConfig::load`] layers an optional YAML file under
//! `KPI_`-prefixed environment variables, with `__` separating nested keys
//! (`KPI_WINDOW__SIZE_MS=30000`). Every field has a default, so an empty
//! configuration is valid.

use crate::error::{ProcessorError, Result};
use figment::{
    providers::{Env, Format, Serialized, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable prefix for configuration overrides
pub const ENV_PREFIX: &str = "KPI_";

/// Main processor configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessorConfig {
    /// Window configuration
    #[serde(default)]
    pub window: WindowConfig,

    /// Trigger configuration
    #[serde(default)]
    pub trigger: TriggerConfig,

    /// Input source configuration
    #[serde(default)]
    pub source: SourceConfig,

    /// Output destinations
    #[serde(default)]
    pub sinks: SinksConfig,

    /// Engine checkpoint configuration
    #[serde(default)]
    pub checkpoint: CheckpointConfig,

    /// Number of parallel decode and delivery workers
    #[serde(default = "default_parallelism")]
    pub parallelism: usize,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Where to write the metrics exposition on shutdown
    #[serde(default)]
    pub metrics_file: Option<PathBuf>,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            window: WindowConfig::default(),
            trigger: TriggerConfig::default(),
            source: SourceConfig::default(),
            sinks: SinksConfig::default(),
            checkpoint: CheckpointConfig::default(),
            parallelism: default_parallelism(),
            logging: LoggingConfig::default(),
            metrics_file: None,
        }
    }
}

impl ProcessorConfig {
    /// Load configuration from an optional YAML file and the environment
    pub fn load(config_path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::from(Serialized::defaults(ProcessorConfig::default()));

        if let Some(path) = config_path {
            figment = figment.merge(Yaml::file(path));
        }

        figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));

        let config: ProcessorConfig = figment.extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a YAML string, without environment overrides
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: ProcessorConfig = Figment::from(Serialized::defaults(ProcessorConfig::default()))
            .merge(Yaml::string(yaml))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.window.validate()?;
        self.trigger.validate()?;
        self.source.validate()?;
        self.sinks.validate()?;
        self.checkpoint.validate()?;

        if self.parallelism == 0 {
            return Err(invalid("parallelism must be greater than 0"));
        }

        let checkpoint_dirs = [
            ("engine", &self.checkpoint.path),
            ("global_kpi", &self.sinks.global_kpi.checkpoint_path),
            ("country_kpi", &self.sinks.country_kpi.checkpoint_path),
        ];
        for (i, (left_ns, left)) in checkpoint_dirs.iter().enumerate() {
            for (right_ns, right) in checkpoint_dirs.iter().skip(i + 1) {
                if left == right {
                    return Err(invalid(format!(
                        "checkpoint paths of '{}' and '{}' must differ",
                        left_ns, right_ns
                    )));
                }
            }
        }

        Ok(())
    }
}

/// Tumbling window configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowConfig {
    /// Window size in milliseconds
    #[serde(default = "default_minute_ms")]
    pub size_ms: u64,

    /// Allowed lateness for late events (milliseconds)
    #[serde(default = "default_minute_ms")]
    pub allowed_lateness_ms: u64,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            size_ms: default_minute_ms(),
            allowed_lateness_ms: default_minute_ms(),
        }
    }
}

impl WindowConfig {
    /// Validate window configuration
    pub fn validate(&self) -> Result<()> {
        if self.size_ms == 0 {
            return Err(invalid("tumbling window size must be greater than 0"));
        }
        if self.size_ms > i64::MAX as u64 || self.allowed_lateness_ms > i64::MAX as u64 {
            return Err(invalid("window durations must fit in signed milliseconds"));
        }
        Ok(())
    }

    /// Get window size as Duration
    pub fn size(&self) -> Duration {
        Duration::from_millis(self.size_ms)
    }

    /// Get allowed lateness as Duration
    pub fn allowed_lateness(&self) -> Duration {
        Duration::from_millis(self.allowed_lateness_ms)
    }
}

/// Trigger scheduler configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerConfig {
    /// Interval between ticks (milliseconds)
    #[serde(default = "default_minute_ms")]
    pub interval_ms: u64,

    /// Upper bound on events read per tick
    #[serde(default)]
    pub max_events_per_tick: Option<usize>,
}

impl Default for TriggerConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_minute_ms(),
            max_events_per_tick: None,
        }
    }
}

impl TriggerConfig {
    /// Validate trigger configuration
    pub fn validate(&self) -> Result<()> {
        if self.interval_ms == 0 {
            return Err(invalid("trigger interval_ms must be greater than 0"));
        }
        if self.max_events_per_tick == Some(0) {
            return Err(invalid("max_events_per_tick must be greater than 0 when set"));
        }
        Ok(())
    }

    /// Get trigger interval as Duration
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

/// Where the engine reads transactions from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SourceKind {
    /// A JSON-lines file
    File { path: PathBuf },
    /// A Kafka topic, requires the `kafka` feature
    Kafka {
        brokers: String,
        topic: String,
        #[serde(default = "default_group_id")]
        group_id: String,
        #[serde(default)]
        properties: BTreeMap<String, String>,
    },
}

impl Default for SourceKind {
    fn default() -> Self {
        SourceKind::File {
            path: PathBuf::from("./input/transactions.jsonl"),
        }
    }
}

/// One explicit starting offset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionOffset {
    pub partition: u32,
    pub offset: i64,
}

/// Where to start reading when no checkpoint exists
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StartPosition {
    /// Oldest retained record
    #[default]
    Earliest,
    /// Only records produced after startup
    Latest,
    /// Explicit offsets per partition
    Explicit { offsets: Vec<PartitionOffset> },
}

/// Source configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Source implementation
    #[serde(default)]
    pub kind: SourceKind,

    /// Starting position for a first run
    #[serde(default)]
    pub start_position: StartPosition,

    /// Halt instead of skipping when input becomes unavailable
    #[serde(default)]
    pub fail_on_data_loss: bool,

    /// Retries for transient read failures
    #[serde(default = "default_source_retries")]
    pub max_retries: u32,

    /// Initial retry backoff (milliseconds), doubled per attempt
    #[serde(default = "default_source_backoff_ms")]
    pub retry_backoff_ms: u64,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            kind: SourceKind::default(),
            start_position: StartPosition::default(),
            fail_on_data_loss: false,
            max_retries: default_source_retries(),
            retry_backoff_ms: default_source_backoff_ms(),
        }
    }
}

impl SourceConfig {
    /// Validate source configuration
    pub fn validate(&self) -> Result<()> {
        if let SourceKind::Kafka { brokers, topic, .. } = &self.kind {
            if brokers.is_empty() || topic.is_empty() {
                return Err(invalid("kafka source requires brokers and topic"));
            }
        }
        if let StartPosition::Explicit { offsets } = &self.start_position {
            if offsets.iter().any(|o| o.offset < 0) {
                return Err(invalid("explicit start offsets must not be negative"));
            }
        }
        Ok(())
    }

    /// Get retry backoff as Duration
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

/// Console sink configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsoleSinkConfig {
    /// Print the raw enriched stream
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Shorten long cells
    #[serde(default)]
    pub truncate: bool,
}

impl Default for ConsoleSinkConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            truncate: false,
        }
    }
}

/// A durable KPI output and its checkpoint namespace location
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KpiSinkConfig {
    /// Output directory
    pub path: PathBuf,
    /// Checkpoint directory for the aggregator feeding this sink
    pub checkpoint_path: PathBuf,
}

impl KpiSinkConfig {
    fn validate(&self, name: &str) -> Result<()> {
        if self.path == self.checkpoint_path {
            return Err(invalid(format!(
                "{} output path and checkpoint path must differ",
                name
            )));
        }
        Ok(())
    }
}

/// Sink configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SinksConfig {
    #[serde(default)]
    pub console: ConsoleSinkConfig,

    #[serde(default = "default_global_sink")]
    pub global_kpi: KpiSinkConfig,

    #[serde(default = "default_country_sink")]
    pub country_kpi: KpiSinkConfig,

    /// Delivery attempts per sink and tick
    #[serde(default = "default_sink_attempts")]
    pub max_attempts: u32,

    /// Initial retry backoff (milliseconds), doubled per attempt
    #[serde(default = "default_sink_backoff_ms")]
    pub retry_backoff_ms: u64,
}

impl Default for SinksConfig {
    fn default() -> Self {
        Self {
            console: ConsoleSinkConfig::default(),
            global_kpi: default_global_sink(),
            country_kpi: default_country_sink(),
            max_attempts: default_sink_attempts(),
            retry_backoff_ms: default_sink_backoff_ms(),
        }
    }
}

impl SinksConfig {
    /// Validate sink configuration
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(invalid("sink max_attempts must be greater than 0"));
        }
        self.global_kpi.validate("global_kpi")?;
        self.country_kpi.validate("country_kpi")?;
        if self.global_kpi.path == self.country_kpi.path {
            return Err(invalid("global_kpi and country_kpi output paths must differ"));
        }
        Ok(())
    }

    /// Get retry backoff as Duration
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

/// Engine checkpoint configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointConfig {
    /// Directory holding the engine namespace
    #[serde(default = "default_checkpoint_path")]
    pub path: PathBuf,

    /// Number of committed checkpoints to retain per namespace
    #[serde(default = "default_checkpoint_retention")]
    pub max_retained: usize,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            path: default_checkpoint_path(),
            max_retained: default_checkpoint_retention(),
        }
    }
}

impl CheckpointConfig {
    /// Validate checkpoint configuration
    pub fn validate(&self) -> Result<()> {
        if self.max_retained == 0 {
            return Err(invalid("checkpoint max_retained must be greater than 0"));
        }
        Ok(())
    }
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive, overridden by `RUST_LOG`
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn invalid(message: impl Into<String>) -> ProcessorError {
    ProcessorError::Configuration {
        source: message.into().into(),
    }
}

// Default value functions
fn default_parallelism() -> usize {
    4
}

fn default_minute_ms() -> u64 {
    60_000
}

fn default_true() -> bool {
    true
}

fn default_group_id() -> String {
    "retail-kpi".to_string()
}

fn default_source_retries() -> u32 {
    3
}

fn default_source_backoff_ms() -> u64 {
    500
}

fn default_sink_attempts() -> u32 {
    3
}

fn default_sink_backoff_ms() -> u64 {
    200
}

fn default_global_sink() -> KpiSinkConfig {
    KpiSinkConfig {
        path: PathBuf::from("./out/time_kpi"),
        checkpoint_path: PathBuf::from("./out/time_kpi_checkpoints"),
    }
}

fn default_country_sink() -> KpiSinkConfig {
    KpiSinkConfig {
        path: PathBuf::from("./out/country_kpi"),
        checkpoint_path: PathBuf::from("./out/country_kpi_checkpoints"),
    }
}

fn default_checkpoint_path() -> PathBuf {
    PathBuf::from("./out/engine_checkpoints")
}

fn default_checkpoint_retention() -> usize {
    5
}

fn default_log_level() -> String {
    "info".to_string()
}
