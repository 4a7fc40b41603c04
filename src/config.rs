//! Configuration for the salesforest trainer.

use crate::data::{parse_timestamp, Row};
use chrono::NaiveDate;
use serde::{Deserialize, Deserializer, Serialize};
use std::path::PathBuf;

/// Main configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Where training rows are read from
    #[serde(default)]
    pub source: SourceConfig,

    /// Where the model checkpoint lives
    #[serde(default)]
    pub checkpoint: CheckpointConfig,

    /// Regressor hyper-parameters
    #[serde(default)]
    pub model: ModelConfig,

    /// Training loop tuning
    #[serde(default)]
    pub training: TrainingConfig,

    /// Held-out rows scored after training
    #[serde(default)]
    pub validation: ValidationConfig,
}

/// Training data source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Parquet table: a local path, `file://` URI or `s3://bucket/key`
    #[serde(default = "default_source_uri")]
    pub uri: String,

    /// S3 credentials; the AWS environment chain is used when absent
    #[serde(default)]
    pub credentials: Option<CredentialsConfig>,

    /// Column name overrides
    #[serde(default)]
    pub columns: ColumnConfig,

    /// Only rows dated on or after this day are read
    #[serde(default)]
    pub since: Option<NaiveDate>,

    /// Rows per chunk
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            uri: default_source_uri(),
            credentials: None,
            columns: ColumnConfig::default(),
            since: None,
            chunk_size: default_chunk_size(),
        }
    }
}

/// Explicit source column names. Unset columns are found by common names.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ColumnConfig {
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub sku: Option<String>,
    #[serde(default)]
    pub target: Option<String>,
}

/// S3 connection settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CredentialsConfig {
    #[serde(default)]
    pub access_key_id: Option<String>,
    #[serde(default)]
    pub secret_access_key: Option<String>,
    #[serde(default)]
    pub session_token: Option<String>,
    #[serde(default)]
    pub region: Option<String>,

    /// Custom S3 endpoint (MinIO, LocalStack, ...)
    #[serde(default)]
    pub endpoint_url: Option<String>,

    /// Allow plain-HTTP endpoints
    #[serde(default)]
    pub allow_http: bool,

    /// Send unsigned requests (public buckets)
    #[serde(default)]
    pub anonymous: bool,
}

/// Checkpoint location.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointConfig {
    /// Local path, `file://` URI or `s3://bucket/key`
    #[serde(default = "default_checkpoint_uri")]
    pub uri: String,

    #[serde(default)]
    pub credentials: Option<CredentialsConfig>,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            uri: default_checkpoint_uri(),
            credentials: None,
        }
    }
}

/// Random forest hyper-parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Ensemble size of a freshly created model
    #[serde(default = "default_initial_capacity")]
    pub initial_capacity: usize,

    /// Ensemble members added per applied chunk
    #[serde(default = "default_capacity_increment")]
    pub capacity_increment: usize,

    #[serde(default = "default_seed")]
    pub seed: u64,

    #[serde(default)]
    pub max_depth: Option<usize>,

    #[serde(default = "default_min_samples_split")]
    pub min_samples_split: usize,

    #[serde(default = "default_min_samples_leaf")]
    pub min_samples_leaf: usize,

    /// Features considered per split (all when unset)
    #[serde(default)]
    pub max_features: Option<usize>,

    #[serde(default = "default_true")]
    pub bootstrap: bool,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            initial_capacity: default_initial_capacity(),
            capacity_increment: default_capacity_increment(),
            seed: default_seed(),
            max_depth: None,
            min_samples_split: default_min_samples_split(),
            min_samples_leaf: default_min_samples_leaf(),
            max_features: None,
            bootstrap: true,
        }
    }
}

impl ModelConfig {
    /// Forest parameters for a new model.
    pub fn to_params(&self) -> crate::model::ForestParams {
        crate::model::ForestParams {
            tree: crate::model::TreeParams {
                max_depth: self.max_depth,
                min_samples_split: self.min_samples_split,
                min_samples_leaf: self.min_samples_leaf,
                max_features: self.max_features,
            },
            bootstrap: self.bootstrap,
            seed: self.seed,
        }
    }
}

/// Order in which completed encodings are applied to the model.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplyOrder {
    /// Source order, buffering early completions
    #[default]
    Submission,
    /// As soon as each encoding completes
    Completion,
}

/// Training loop configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingConfig {
    /// Chunks encoded concurrently
    #[serde(default = "default_pool_width")]
    pub pool_width: usize,

    #[serde(default)]
    pub apply_order: ApplyOrder,

    /// Per-chunk encoding deadline in seconds
    #[serde(default)]
    pub encode_timeout_secs: Option<u64>,

    /// Skip chunks already applied by a previous run
    #[serde(default = "default_true")]
    pub resume: bool,

    /// Number of Tokio worker threads
    #[serde(default)]
    pub worker_threads: Option<usize>,

    /// Rayon thread pool size for tree growth
    #[serde(default)]
    pub rayon_threads: Option<usize>,

    /// Enable metrics reporting
    #[serde(default = "default_true")]
    pub enable_metrics: bool,

    /// Metrics reporting interval in seconds
    #[serde(default = "default_metrics_interval")]
    pub metrics_interval_secs: u64,

    /// Optional path to save metrics JSON after the run completes
    #[serde(default)]
    pub metrics_output_path: Option<String>,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            pool_width: default_pool_width(),
            apply_order: ApplyOrder::default(),
            encode_timeout_secs: None,
            resume: true,
            worker_threads: None,
            rayon_threads: None,
            enable_metrics: true,
            metrics_interval_secs: default_metrics_interval(),
            metrics_output_path: None,
        }
    }
}

/// A held-out row written inline in the configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowSpec {
    /// Date or date-time
    pub date: String,
    pub location: String,
    #[serde(deserialize_with = "string_or_number")]
    pub sku: String,
    pub quantity: f64,
}

impl RowSpec {
    /// Convert to a row, failing on an unparseable date.
    pub fn to_row(&self) -> anyhow::Result<Row> {
        let timestamp = parse_timestamp(&self.date)
            .ok_or_else(|| anyhow::anyhow!("Invalid validation date '{}'", self.date))?;
        Ok(Row::new(timestamp, self.location.clone(), self.sku.clone(), self.quantity))
    }
}

/// Held-out validation set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationConfig {
    /// Inline rows
    #[serde(default = "default_validation_rows")]
    pub rows: Vec<RowSpec>,

    /// Parquet table of extra rows, read with the source column mapping
    #[serde(default)]
    pub path: Option<String>,

    /// Optional path to save the validation report as JSON
    #[serde(default)]
    pub report_path: Option<String>,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            rows: default_validation_rows(),
            path: None,
            report_path: None,
        }
    }
}

impl ValidationConfig {
    /// Inline rows converted to [`Row`]s.
    pub fn inline_rows(&self) -> anyhow::Result<Vec<Row>> {
        self.rows.iter().map(RowSpec::to_row).collect()
    }
}

fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Label {
        Text(String),
        Int(i64),
    }

    Ok(match Label::deserialize(deserializer)? {
        Label::Text(s) => s,
        Label::Int(n) => n.to_string(),
    })
}

impl Config {
    /// Load configuration from a YAML or JSON file.
    /// Format is auto-detected from file extension (.yaml, .yml, or .json).
    pub fn from_file(path: &PathBuf) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");

        let config: Config = match ext {
            "json" => serde_json::from_str(&contents)?,
            // YAML is a superset of JSON
            _ => serde_yaml::from_str(&contents)?,
        };
        Ok(config)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> anyhow::Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Load configuration from a JSON string.
    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Serialize configuration to YAML.
    pub fn to_yaml(&self) -> anyhow::Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> anyhow::Result<()> {
        crate::io::parse_location(&self.source.uri)?;
        crate::io::parse_location(&self.checkpoint.uri)?;
        if let Some(path) = &self.validation.path {
            crate::io::parse_location(path)?;
        }

        if self.source.chunk_size == 0 {
            anyhow::bail!("Chunk size must be > 0");
        }
        if self.training.pool_width == 0 {
            anyhow::bail!("Pool width must be > 0");
        }
        if self.model.capacity_increment == 0 {
            anyhow::bail!("Capacity increment must be > 0");
        }
        if self.model.min_samples_split < 2 {
            anyhow::bail!("min_samples_split must be >= 2");
        }
        if self.model.min_samples_leaf == 0 {
            anyhow::bail!("min_samples_leaf must be > 0");
        }
        if self.model.max_features == Some(0) {
            anyhow::bail!("max_features must be > 0 when set");
        }
        if self.training.encode_timeout_secs == Some(0) {
            anyhow::bail!("Encode timeout must be > 0 when set");
        }
        if self.training.enable_metrics && self.training.metrics_interval_secs == 0 {
            anyhow::bail!("Metrics interval must be > 0");
        }

        let columns = [
            ("timestamp", &self.source.columns.timestamp),
            ("location", &self.source.columns.location),
            ("sku", &self.source.columns.sku),
            ("target", &self.source.columns.target),
        ];
        for (name, column) in columns {
            if column.as_deref().is_some_and(|c| c.trim().is_empty()) {
                anyhow::bail!("Column name for '{}' must not be empty", name);
            }
        }

        self.validation.inline_rows()?;
        Ok(())
    }
}

/// Commented sample written by `generate-config`.
pub const SAMPLE_CONFIG: &str = r#"# salesforest configuration

# === SOURCE: Where training rows are read from ===
source:
  # Parquet table: local path or s3://bucket/key
  uri: "data/ventas.parquet"

  # Rows per training chunk
  chunk_size: 100000

  # Only read rows dated on or after this day (omit to read everything)
  # since: "2024-01-01"

  # Column names; omitted columns are found by common names
  # (id_tie_fecha/timestamp/date, desc_cli_localidad/location,
  #  id_sku/sku, vtas_neta_tns/quantity/target)
  # columns:
  #   timestamp: "id_tie_fecha"
  #   location: "desc_cli_localidad"
  #   sku: "id_sku"
  #   target: "vtas_neta_tns"

  # S3 credentials (defaults to the AWS environment / instance profile)
  # credentials:
  #   region: "us-east-1"
  #   endpoint_url: "http://localhost:9000"
  #   allow_http: true

# === CHECKPOINT: Model + vocabularies, rewritten after every chunk ===
checkpoint:
  uri: "checkpoints/model.ckpt"

# === MODEL: Random forest hyper-parameters ===
model:
  # Ensemble size of a fresh model
  initial_capacity: 100

  # Trees added for every applied chunk
  capacity_increment: 10

  seed: 42
  min_samples_split: 2
  min_samples_leaf: 1
  bootstrap: true
  # max_depth: 16
  # max_features: 3

# === TRAINING: Concurrency and bookkeeping ===
training:
  # Chunks encoded concurrently
  pool_width: 2

  # submission: apply in source order (reproducible)
  # completion: apply as encodings finish
  apply_order: submission

  # Skip chunks already applied by a previous run
  resume: true

  # Per-chunk encoding deadline in seconds
  # encode_timeout_secs: 60

  # Tokio / Rayon thread counts (null = num CPUs)
  # worker_threads: 4
  # rayon_threads: 4

  enable_metrics: true
  metrics_interval_secs: 10
  # metrics_output_path: "metrics.json"

# === VALIDATION: Held-out rows scored after training ===
validation:
  rows:
    - { date: "2024-07-17", location: "ESQUEL", sku: 138202, quantity: -2.88 }
    - { date: "2024-07-17", location: "ESQUEL", sku: 609400, quantity: -3.48 }
    - { date: "2024-07-17", location: "ESQUEL", sku: 138402, quantity: -2.88 }
    - { date: "2024-07-17", location: "ESQUEL", sku: 138401, quantity: -2.88 }
    - { date: "2024-07-17", location: "ESQUEL", sku: 138302, quantity: -3.08 }

  # Parquet table of additional held-out rows
  # path: "data/holdout.parquet"

  # report_path: "validation.json"
"#;

// Default value functions for serde
fn default_source_uri() -> String { "data/ventas.parquet".to_string() }
fn default_checkpoint_uri() -> String { "checkpoints/model.ckpt".to_string() }
fn default_chunk_size() -> usize { 100_000 }
fn default_initial_capacity() -> usize { 100 }
fn default_capacity_increment() -> usize { 10 }
fn default_seed() -> u64 { 42 }
fn default_min_samples_split() -> usize { 2 }
fn default_min_samples_leaf() -> usize { 1 }
fn default_pool_width() -> usize { 2 }
fn default_true() -> bool { true }
fn default_metrics_interval() -> u64 { 10 }

fn default_validation_rows() -> Vec<RowSpec> {
    [
        ("138202", -2.88),
        ("609400", -3.48),
        ("138402", -2.88),
        ("138401", -2.88),
        ("138302", -3.08),
    ]
    .into_iter()
    .map(|(sku, quantity)| RowSpec {
        date: "2024-07-17".to_string(),
        location: "ESQUEL".to_string(),
        sku: sku.to_string(),
        quantity,
    })
    .collect()
}
