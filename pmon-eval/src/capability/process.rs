//! Subprocess-backed capability clients
//!
//! Each capability is an external command-line tool that loads a model,
//! receives image files and answers with JSON on stdout. The evaluation core
//! never reimplements inference; it only drives the tools and parses their
//! results.

use std::path::{Path, PathBuf};
use std::process::Command;

use thiserror::Error;
use uuid::Uuid;

use pmon_common::config::{model_version, CapabilityConfig};
use pmon_common::Result;

use crate::imaging::{CropImage, RegionImage};

use super::{Classification, Classifier, Detection, Detector};

/// Capability subprocess errors
#[derive(Debug, Error)]
pub enum ProcessError {
    /// Tool binary not found or not executable
    #[error("Capability tool not found: {0}")]
    ToolNotFound(String),

    /// Failed to execute the tool
    #[error("Failed to execute {0}: {1}")]
    ExecutionError(String, String),

    /// Tool exited with a failure status
    #[error("{0} failed: {1}")]
    ToolFailed(String, String),

    /// Failed to parse the tool's JSON output
    #[error("Failed to parse {0} output: {1}")]
    ParseError(String, String),

    /// I/O error staging image data for the tool
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

impl From<ProcessError> for pmon_common::Error {
    fn from(e: ProcessError) -> Self {
        match e {
            ProcessError::ToolNotFound(msg) => pmon_common::Error::Config(msg),
            ProcessError::IoError(io) => pmon_common::Error::Io(io),
            other => pmon_common::Error::Integrity(other.to_string()),
        }
    }
}

/// Verify the configured tool responds and the model file exists.
fn probe_tool(config: &CapabilityConfig) -> std::result::Result<(), ProcessError> {
    if !config.model_path.is_file() {
        return Err(ProcessError::ToolNotFound(format!(
            "model file not found: {}",
            config.model_path.display()
        )));
    }
    match Command::new(&config.command).arg("--version").output() {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(ProcessError::ToolNotFound(
            format!("{} not found in PATH", config.command),
        )),
        Err(e) => Err(ProcessError::ExecutionError(
            config.command.clone(),
            e.to_string(),
        )),
    }
}

fn run_tool(command: &str, args: &[String]) -> std::result::Result<Vec<u8>, ProcessError> {
    let output = Command::new(command)
        .args(args)
        .output()
        .map_err(|e| ProcessError::ExecutionError(command.to_string(), e.to_string()))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        return Err(ProcessError::ToolFailed(command.to_string(), stderr));
    }
    Ok(output.stdout)
}

/// Stage an image as a temporary PNG for a tool invocation.
fn stage_image(
    prefix: &str,
    img: &image::DynamicImage,
) -> std::result::Result<PathBuf, ProcessError> {
    let path = std::env::temp_dir().join(format!("{prefix}-{}.png", Uuid::new_v4()));
    img.save(&path)
        .map_err(|e| ProcessError::ExecutionError(prefix.to_string(), e.to_string()))?;
    Ok(path)
}

fn discard_staged(paths: &[PathBuf]) {
    for path in paths {
        if let Err(e) = std::fs::remove_file(path) {
            tracing::debug!(path = %path.display(), error = %e, "Could not remove staged image");
        }
    }
}

/// Detection capability driven through an external tool.
pub struct ProcessDetector {
    command: String,
    model_path: PathBuf,
    version: String,
    min_confidence: Option<f64>,
}

impl ProcessDetector {
    pub fn new(config: &CapabilityConfig) -> Result<Self> {
        probe_tool(config).map_err(pmon_common::Error::from)?;
        let version = model_version(&config.model_path);
        tracing::info!(
            model = %config.model_path.display(),
            version = %version,
            "Initialize detector"
        );
        Ok(ProcessDetector {
            command: config.command.clone(),
            model_path: config.model_path.clone(),
            version,
            min_confidence: config.min_confidence,
        })
    }
}

impl Detector for ProcessDetector {
    fn detect(&self, image: &RegionImage) -> Result<Vec<Detection>> {
        let synth = image.synth()?;
        let staged = stage_image("pmon-detect", synth).map_err(pmon_common::Error::from)?;

        let mut args = vec![
            "--model".to_string(),
            self.model_path.to_string_lossy().into_owned(),
        ];
        if let Some(min) = self.min_confidence {
            args.push("--min-confidence".to_string());
            args.push(min.to_string());
        }
        args.push(staged.to_string_lossy().into_owned());

        let result = run_tool(&self.command, &args);
        discard_staged(std::slice::from_ref(&staged));

        let stdout = result.map_err(pmon_common::Error::from)?;
        let detections: Vec<Detection> = serde_json::from_slice(&stdout).map_err(|e| {
            pmon_common::Error::from(ProcessError::ParseError(
                self.command.clone(),
                e.to_string(),
            ))
        })?;
        Ok(detections)
    }

    fn version(&self) -> &str {
        &self.version
    }

    fn model_path(&self) -> &Path {
        &self.model_path
    }
}

/// Classification capability driven through an external tool.
pub struct ProcessClassifier {
    command: String,
    model_path: PathBuf,
    version: String,
}

impl ProcessClassifier {
    pub fn new(config: &CapabilityConfig) -> Result<Self> {
        probe_tool(config).map_err(pmon_common::Error::from)?;
        let version = model_version(&config.model_path);
        tracing::info!(
            model = %config.model_path.display(),
            version = %version,
            "Initialize classifier"
        );
        Ok(ProcessClassifier {
            command: config.command.clone(),
            model_path: config.model_path.clone(),
            version,
        })
    }
}

impl Classifier for ProcessClassifier {
    fn classify(&self, crops: &[CropImage]) -> Result<Vec<Classification>> {
        if crops.is_empty() {
            return Ok(Vec::new());
        }

        let mut staged = Vec::with_capacity(crops.len());
        for crop in crops {
            match stage_image("pmon-classify", crop) {
                Ok(path) => staged.push(path),
                Err(e) => {
                    discard_staged(&staged);
                    return Err(e.into());
                }
            }
        }

        let mut args = vec![
            "--model".to_string(),
            self.model_path.to_string_lossy().into_owned(),
        ];
        args.extend(staged.iter().map(|p| p.to_string_lossy().into_owned()));

        let result = run_tool(&self.command, &args);
        discard_staged(&staged);

        let stdout = result.map_err(pmon_common::Error::from)?;
        let classified: Vec<Classification> = serde_json::from_slice(&stdout).map_err(|e| {
            pmon_common::Error::from(ProcessError::ParseError(
                self.command.clone(),
                e.to_string(),
            ))
        })?;
        Ok(classified)
    }

    fn version(&self) -> &str {
        &self.version
    }

    fn model_path(&self) -> &Path {
        &self.model_path
    }
}
