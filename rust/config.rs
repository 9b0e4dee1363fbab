//! Run configuration.
//!
//! A run is described by one JSON document, loaded once and shared read-only
//! by every worker:
//!
//! ```json
//! {
//!   "macenko": { "Io": 240, "alpha": 1, "beta": 0.15,
//!                "HERef": [[0.5626, 0.2159], [0.7201, 0.8012], [0.4062, 0.5581]],
//!                "maxCRef": [1.9705, 1.0308] },
//!   "datasets": [ { "name": "CRC5000", "input_dir": "...", "output_dir": "..." } ],
//!   "processing": { "preserve_structure": true, "skip_existing": false, "log_every": 100 },
//!   "log_path": "results/logs/pipeline.log"
//! }
//! ```
//!
//! Every field is optional; missing ones take the defaults below.

use crate::error::{NormalizeError, Result};
use crate::macenko_normalize::MacenkoParams;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub macenko: MacenkoParams,
    pub datasets: Vec<DatasetConfig>,
    pub processing: ProcessingConfig,
    /// Append-only, human-readable run log.
    pub log_path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetConfig {
    pub name: String,
    pub input_dir: PathBuf,
    pub output_dir: PathBuf,
    /// Informational only; outputs keep the extension of their input.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessingConfig {
    /// Mirror the input directory tree under the output directory. When
    /// false, outputs are written flat by file name.
    pub preserve_structure: bool,
    /// Count an already existing output as done without reprocessing it.
    pub skip_existing: bool,
    /// Log progress every N images; 0 disables progress lines.
    pub log_every: usize,
    /// Worker threads; `None` uses rayon's default.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub threads: Option<usize>,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            preserve_structure: true,
            skip_existing: false,
            log_every: 100,
            threads: None,
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            macenko: MacenkoParams::default(),
            datasets: vec![
                DatasetConfig {
                    name: "LC25000".to_string(),
                    input_dir: PathBuf::from("data/processed/LC25000/LC25000"),
                    output_dir: PathBuf::from("data/processed/LC25000/macenko_norm"),
                    format: Some("jpeg".to_string()),
                },
                DatasetConfig {
                    name: "CRC5000".to_string(),
                    input_dir: PathBuf::from(
                        "data/processed/CRC5000/Kather_texture_2016_image_tiles_5000",
                    ),
                    output_dir: PathBuf::from("data/processed/CRC5000/macenko_norm"),
                    format: Some("tif".to_string()),
                },
            ],
            processing: ProcessingConfig::default(),
            log_path: PathBuf::from("results/logs/pipeline.log"),
        }
    }
}

impl PipelineConfig {
    pub fn from_json_str(s: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(s).map_err(|e| NormalizeError::ConfigError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|e| {
            NormalizeError::ConfigError(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_json_str(&text)
    }

    pub fn to_json_pretty(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| NormalizeError::ConfigError(e.to_string()))
    }

    pub fn validate(&self) -> Result<()> {
        self.macenko.validate()?;
        if self.processing.threads == Some(0) {
            return Err(NormalizeError::ConfigError(
                "processing.threads must be at least 1".to_string(),
            ));
        }
        for d in &self.datasets {
            if d.name.trim().is_empty() {
                return Err(NormalizeError::ConfigError("dataset with empty name".to_string()));
            }
        }
        Ok(())
    }
}
