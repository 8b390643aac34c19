//! Configuration loading for the evaluation service
//!
//! A single TOML file configures paths, instrument metadata, the two external
//! capabilities and the species threshold table. Configuration errors are
//! fatal at start-up; there is no partial start.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::species::SpeciesTable;
use crate::{Error, Result};

/// Top-level evaluation service configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvalConfig {
    pub main: MainConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    pub detector: CapabilityConfig,
    pub classifier: CapabilityConfig,
    /// Raw threshold table; see [`SpeciesTable::parse`] for the entry format.
    pub thresholds: BTreeMap<String, String>,
}

/// Paths, polling cadence and instrument metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MainConfig {
    /// Directory watched for new sample input (streamed regions, folders or
    /// archives).
    pub path_samples_in: PathBuf,
    /// Root for per-sample evaluation output directories.
    pub path_eval_out: PathBuf,
    /// Drop location for finished analysis artifacts (archived samples).
    pub path_out_analysis: PathBuf,

    /// Idle sleep between polling passes when no sample is open.
    #[serde(default = "default_sleep_seconds")]
    pub sleep_seconds: u64,

    /// Save per-object cropped stacks alongside crops.
    #[serde(default)]
    pub save_little_stacks: bool,
    /// Evaluate synthesized images only, never resolving the raw stack.
    #[serde(default)]
    pub eval_synth_only: bool,
    /// Stack retention: 0 = never, 1 = always, 2 = only when objects found.
    #[serde(default)]
    pub save_stacks: u8,

    /// Pump flow rate (l/min) used for volume derivation.
    pub flow_rate: u32,
    /// Carrier material; plastic instead of glass.
    #[serde(default)]
    pub carrier_type_plastic: bool,

    pub device_type: String,
    pub device_name: String,
    pub serial_number: String,
}

impl MainConfig {
    pub fn carrier_type(&self) -> &'static str {
        if self.carrier_type_plastic {
            "Plastic"
        } else {
            "Glass"
        }
    }
}

/// Retry policy for transient I/O failures (a producer still writing the
/// file). The default preserves unbounded blocking retry; setting `max_wait`
/// escalates to an integrity error once exceeded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    /// Maximum total wait in seconds before giving up; `None` retries
    /// forever.
    #[serde(default)]
    pub max_wait_secs: Option<u64>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            initial_delay_ms: default_initial_delay_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            max_wait_secs: None,
        }
    }
}

/// One external capability: the tool to invoke and the model it loads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilityConfig {
    /// Executable invoked for each request (JSON on stdout).
    pub command: String,
    /// Model file handed to the tool; its name carries the model version.
    pub model_path: PathBuf,
    /// Minimum detection confidence (detector only).
    #[serde(default)]
    pub min_confidence: Option<f64>,
}

fn default_sleep_seconds() -> u64 {
    30
}

fn default_initial_delay_ms() -> u64 {
    100
}

fn default_max_backoff_ms() -> u64 {
    5_000
}

impl EvalConfig {
    /// Load and validate configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read config {}: {e}", path.display()))
        })?;
        let config: EvalConfig = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("cannot parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Start-up validation; any failure prevents the service from starting.
    pub fn validate(&self) -> Result<()> {
        if self.main.save_stacks > 2 {
            return Err(Error::Config(
                "save_stacks must be between 0 and 2".to_string(),
            ));
        }
        if !self.detector.model_path.is_file() {
            return Err(Error::Config(format!(
                "detector model not found: {}",
                self.detector.model_path.display()
            )));
        }
        if !self.classifier.model_path.is_file() {
            return Err(Error::Config(format!(
                "classifier model not found: {}",
                self.classifier.model_path.display()
            )));
        }
        // Threshold table must parse as a whole before anything runs.
        self.species_table()?;
        Ok(())
    }

    /// Parse the threshold section into an immutable species table.
    pub fn species_table(&self) -> Result<SpeciesTable> {
        SpeciesTable::parse(&self.thresholds)
    }
}

/// Derive the model version from a model file name.
///
/// The instrument names models `v{major}.{minor}_...`; an unversioned file
/// maps to `vX.X` with a warning.
pub fn model_version(model_path: &Path) -> String {
    let tail = model_path
        .file_name()
        .map(|f| f.to_string_lossy().into_owned())
        .unwrap_or_default();
    let version = tail.split('_').next().unwrap_or_default();
    if version.starts_with('v') {
        version.to_string()
    } else {
        tracing::warn!(model = %tail, "Could not get version of model");
        "vX.X".to_string()
    }
}
