// Copyright 2025 Gibran Rodriguez <brangi000@gmail.com>
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Configuration management for Lithe

use crate::optimization::distillation::DistillationConfig;
use crate::optimization::quantization::QuantizationConfig;
use crate::{LitheError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Global configuration for a compression run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub data: DataConfig,
    pub training: TrainingConfig,
    pub distillation: DistillationConfig,
    pub quantization: QuantizationConfig,
    pub output: OutputConfig,
}

/// Ingestion and preprocessing settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataConfig {
    /// Name of the reserved label column (after whitespace normalization)
    pub label_column: String,
    /// File extension matched during discovery
    pub file_extension: String,
    /// Fraction of rows held out as the fixed test set
    pub test_fraction: f32,
    /// Balance training classes with SMOTE
    pub oversample: bool,
    /// Neighbours considered when synthesizing minority samples
    pub smote_neighbors: usize,
    pub seed: u64,
}

/// Supervised training settings shared by baseline, teacher and QAT fine-tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingConfig {
    pub epochs: usize,
    pub batch_size: usize,
    pub learning_rate: f64,
    /// Trailing fraction of the training rows used for per-epoch validation
    pub validation_fraction: f32,
    pub shuffle: bool,
    pub seed: u64,
    pub show_progress: bool,
}

/// Where artifacts are written
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    pub directory: PathBuf,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            label_column: "Label".to_string(),
            file_extension: "csv".to_string(),
            test_fraction: 0.2,
            oversample: true,
            smote_neighbors: 5,
            seed: 42,
        }
    }
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            epochs: 10,
            batch_size: 64,
            learning_rate: 1e-3,
            validation_fraction: 0.1,
            shuffle: true,
            seed: 42,
            show_progress: false,
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("./output"),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data: DataConfig::default(),
            training: TrainingConfig::default(),
            distillation: DistillationConfig::default(),
            quantization: QuantizationConfig::default(),
            output: OutputConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config =
            toml::from_str(&content).map_err(|e| LitheError::Configuration(e.to_string()))?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content =
            toml::to_string_pretty(self).map_err(|e| LitheError::Configuration(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Validate configuration for consistency
    pub fn validate(&self) -> Result<()> {
        let test_fraction = self.data.test_fraction;
        if !(test_fraction > 0.0 && test_fraction < 1.0) {
            return Err(LitheError::Configuration(
                "data.test_fraction must be in (0, 1)".to_string(),
            ));
        }

        if self.data.oversample && self.data.smote_neighbors == 0 {
            return Err(LitheError::Configuration(
                "data.smote_neighbors must be greater than 0".to_string(),
            ));
        }

        if self.training.epochs == 0 || self.training.batch_size == 0 {
            return Err(LitheError::Configuration(
                "training.epochs and training.batch_size must be greater than 0".to_string(),
            ));
        }

        if self.training.learning_rate <= 0.0 {
            return Err(LitheError::Configuration(
                "training.learning_rate must be positive".to_string(),
            ));
        }

        if !(0.0..1.0).contains(&self.training.validation_fraction) {
            return Err(LitheError::Configuration(
                "training.validation_fraction must be in [0, 1)".to_string(),
            ));
        }

        self.distillation.validate()?;
        self.quantization.validate()?;

        Ok(())
    }

    /// Named presets
    pub fn preset(name: &str) -> Result<Self> {
        let mut config = Self::default();

        match name.to_lowercase().as_str() {
            "default" => {}
            "smoke" => {
                config.training.epochs = 1;
                config.training.batch_size = 128;
                config.distillation.epochs = 1;
                config.distillation.batch_size = 128;
                config.quantization.fine_tune_epochs = 1;
                config.quantization.batch_size = 128;
                config.data.oversample = false;
            }
            "thorough" => {
                config.training.epochs = 30;
                config.distillation.epochs = 30;
                config.quantization.fine_tune_epochs = 5;
                config.training.show_progress = true;
            }
            _ => {
                return Err(LitheError::Configuration(format!(
                    "unknown preset '{}' (expected default, smoke or thorough)",
                    name
                )));
            }
        }

        Ok(config)
    }
}
