//! Engine configuration
//!
//! Every field has a default, so a TOML file only needs to name what it
//! changes. `ETHOS_MODEL_DIR` and `ETHOS_EVENT_LOG` override the matching
//! paths after the file is read.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::{EthosError, Result};

/// Network topology used for the policy and target networks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Architecture {
    /// Two ReLU hidden layers feeding a linear output layer
    #[default]
    #[serde(alias = "mlp")]
    Dense,
    /// Attention-gated hidden blocks: `relu(Wx) * sigmoid(Gx)`
    #[serde(alias = "attention")]
    Gated,
    /// 1-D convolution over the observation vector
    #[serde(alias = "conv")]
    Conv1d,
}

impl std::fmt::Display for Architecture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Architecture::Dense => "dense",
            Architecture::Gated => "gated",
            Architecture::Conv1d => "conv1d",
        })
    }
}

/// Top-level configuration of the decision engine
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Length of the observation vector
    pub state_size: usize,
    /// Number of action slots produced by the network
    pub action_size: usize,
    /// Discount factor
    pub gamma: f32,
    /// Optimizer learning rate
    pub learning_rate: f32,
    /// Initial exploration rate
    pub epsilon_start: f64,
    /// Exploration floor
    pub epsilon_min: f64,
    /// Multiplicative decay applied after each non-blocked decision
    pub epsilon_decay: f64,
    /// Mini-batch size for training
    pub batch_size: usize,
    /// Replay memory capacity
    pub memory_capacity: usize,
    /// Copy policy weights into the target every N training steps
    pub target_update_every: u64,
    /// Hidden layer widths
    pub hidden_sizes: Vec<usize>,
    /// Network architecture
    pub architecture: Architecture,
    /// Directory holding policy, target and engine state
    pub model_dir: PathBuf,
    /// Seed for weight init and exploration; random when absent
    pub seed: Option<u64>,
    /// JSONL event log; logging is disabled when absent
    pub event_log: Option<PathBuf>,
    /// Training scheduler limits
    pub training: TrainingConfig,
    /// Daily batch trainer
    pub daily: DailyConfig,
    /// Human approval
    pub approval: ApprovalConfig,
    /// Alignment classifier
    pub alignment: AlignmentConfig,
    /// Built-in adapters
    pub adapters: AdaptersConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            state_size: 32,
            action_size: 8,
            gamma: 0.95,
            learning_rate: 1e-3,
            epsilon_start: 1.0,
            epsilon_min: 0.05,
            epsilon_decay: 0.995,
            batch_size: 32,
            memory_capacity: 10_000,
            target_update_every: 100,
            hidden_sizes: vec![64, 64],
            architecture: Architecture::Dense,
            model_dir: PathBuf::from("data/models"),
            seed: None,
            event_log: Some(PathBuf::from("data/events.jsonl")),
            training: TrainingConfig::default(),
            daily: DailyConfig::default(),
            approval: ApprovalConfig::default(),
            alignment: AlignmentConfig::default(),
            adapters: AdaptersConfig::default(),
        }
    }
}

/// Rate, concurrency and memory limits for training
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    /// Token refill rate; `0` disables rate limiting
    pub rate_limit_per_sec: f64,
    /// Bucket size
    pub burst: u32,
    /// Maximum concurrent training passes
    pub max_concurrent: usize,
    /// Ceiling for replay footprint plus batch working set
    pub max_memory_bytes: usize,
    /// Periodic trainer interval
    pub periodic_interval_ms: u64,
    /// Micro-trainer interval
    pub micro_interval_ms: u64,
    /// Batch size of a micro-trainer step
    pub micro_batch_size: usize,
    /// Attempt one background step after each decision
    pub train_after_act: bool,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            rate_limit_per_sec: 2.0,
            burst: 2,
            max_concurrent: 1,
            max_memory_bytes: 256 * 1024 * 1024,
            periodic_interval_ms: 5_000,
            micro_interval_ms: 1_000,
            micro_batch_size: 8,
            train_after_act: true,
        }
    }
}

/// Daily batch trainer window
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DailyConfig {
    /// Start the daily trainer with the scheduler
    pub enabled: bool,
    /// Local hour the window opens
    pub hour: u32,
    /// Window length in minutes
    pub window_minutes: u32,
    /// Upper bound on training steps per run
    pub max_batches_per_run: usize,
    /// Passes over the re-ingested experiences
    pub passes: usize,
    /// How often the trainer checks the clock
    pub check_interval_secs: u64,
}

impl Default for DailyConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            hour: 3,
            window_minutes: 60,
            max_batches_per_run: 200,
            passes: 3,
            check_interval_secs: 60,
        }
    }
}

/// Human approval settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApprovalConfig {
    /// How long to wait for a decision
    pub timeout_ms: u64,
    /// Risk at or above which approval is required
    pub risk_threshold: f64,
}

impl Default for ApprovalConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 120_000,
            risk_threshold: 0.8,
        }
    }
}

/// Alignment classifier settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlignmentConfig {
    /// Dataset and classifier directory
    pub dir: PathBuf,
    /// Retention cap of the dataset
    pub max_samples: usize,
    /// Samples required before the classifier is trained or used
    pub min_samples: usize,
    /// Default epochs per training run
    pub epochs: usize,
    /// Default mini-batch size
    pub batch_size: usize,
    /// Optimizer learning rate
    pub learning_rate: f32,
    /// Hidden layer width
    pub hidden_size: usize,
}

impl Default for AlignmentConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("data/alignment"),
            max_samples: 5_000,
            min_samples: 20,
            epochs: 20,
            batch_size: 32,
            learning_rate: 0.01,
            hidden_size: 16,
        }
    }
}

/// Settings for the built-in adapters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdaptersConfig {
    /// HTTP request timeout
    pub http_timeout_ms: u64,
    /// Subprocess and script timeout
    pub process_timeout_ms: u64,
    /// Confine file actions to this directory when set
    pub file_root: Option<PathBuf>,
    /// Device hub endpoint; the device adapter is disabled when absent
    pub device_hub_url: Option<String>,
    /// Run scripts with PowerShell instead of `sh`
    pub powershell: bool,
}

impl Default for AdaptersConfig {
    fn default() -> Self {
        Self {
            http_timeout_ms: 30_000,
            process_timeout_ms: 60_000,
            file_root: None,
            device_hub_url: None,
            powershell: cfg!(windows),
        }
    }
}

impl EngineConfig {
    /// Parse a TOML document
    pub fn from_toml(source: &str) -> Result<Self> {
        let config: Self = toml::from_str(source).map_err(|e| EthosError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `path`, or defaults when `path` is `None`, then apply env overrides
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => {
                let source = std::fs::read_to_string(path).map_err(|e| {
                    EthosError::Config(format!("cannot read {}: {e}", path.display()))
                })?;
                toml::from_str(&source).map_err(|e| EthosError::Config(e.to_string()))?
            }
            None => Self::default(),
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(dir) = std::env::var("ETHOS_MODEL_DIR") {
            if !dir.is_empty() {
                self.model_dir = PathBuf::from(dir);
            }
        }
        if let Ok(log) = std::env::var("ETHOS_EVENT_LOG") {
            self.event_log = (!log.is_empty()).then(|| PathBuf::from(log));
        }
    }

    /// Check ranges and cross-field consistency
    pub fn validate(&self) -> Result<()> {
        let fail = |msg: &str| Err(EthosError::Config(msg.to_string()));
        if self.state_size == 0 || self.action_size == 0 {
            return fail("state_size and action_size must be positive");
        }
        if !(0.0..=1.0).contains(&self.gamma) {
            return fail("gamma must be within [0, 1]");
        }
        if self.learning_rate <= 0.0 || !self.learning_rate.is_finite() {
            return fail("learning_rate must be positive");
        }
        if !(0.0..=1.0).contains(&self.epsilon_start)
            || !(0.0..=1.0).contains(&self.epsilon_min)
            || self.epsilon_min > self.epsilon_start
        {
            return fail("epsilon bounds must satisfy 0 <= epsilon_min <= epsilon_start <= 1");
        }
        if !(0.0..=1.0).contains(&self.epsilon_decay) {
            return fail("epsilon_decay must be within [0, 1]");
        }
        if self.batch_size == 0 || self.memory_capacity == 0 {
            return fail("batch_size and memory_capacity must be positive");
        }
        if self.target_update_every == 0 {
            return fail("target_update_every must be positive");
        }
        if self.hidden_sizes.is_empty() || self.hidden_sizes.contains(&0) {
            return fail("hidden_sizes must list at least one positive width");
        }
        if self.training.max_concurrent == 0 {
            return fail("training.max_concurrent must be positive");
        }
        if !(0.0..=1.0).contains(&self.approval.risk_threshold) {
            return fail("approval.risk_threshold must be within [0, 1]");
        }
        if self.approval.timeout_ms == 0 {
            return fail("approval.timeout_ms must be positive");
        }
        if self.daily.hour > 23 {
            return fail("daily.hour must be within 0..=23");
        }
        if self.alignment.min_samples == 0 || self.alignment.max_samples < self.alignment.min_samples {
            return fail("alignment.max_samples must be >= alignment.min_samples > 0");
        }
        Ok(())
    }
}
