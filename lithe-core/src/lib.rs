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

//! Lithe Core - compression of flow-based intrusion-detection classifiers
//!
//! This crate trains compact feed-forward classifiers over tabular network
//! flow features and shrinks them two ways:
//!
//! - Knowledge distillation of a wide teacher into a small student
//! - Quantization-aware fine-tuning followed by export to integer codes
//!
//! Data preparation, evaluation reports and a float/quantized artifact
//! format round out the pipeline.

pub mod artifact;
pub mod config;
pub mod data;
pub mod error;
pub mod evaluation;
pub mod model;
pub mod optimization;
pub mod pipeline;
pub mod serialization;
pub mod training;

pub use artifact::{CompressedArtifact, QuantizedClassifier};
pub use config::Config;
pub use data::{DatasetSplit, LabelSpace, PreparedData};
pub use error::{InstabilityDiagnostics, LitheError, Result};
pub use evaluation::{ComparisonReport, Evaluator, ModelReport, Predictor};
pub use model::{Architecture, Classifier, ClassifierBuilder, ClassifierSpec, ForwardMode, TrainingBundle};
pub use optimization::{CompressionTechnique, DistillationConfig, Distiller, QuantizationConfig, Quantizer};
pub use pipeline::{Pipeline, PipelineOutcome};
pub use training::{EpochStats, TrainingHistory, TrainingOptions};

/// Core version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize the Lithe core library with logging
pub fn init() -> Result<()> {
    // Try to initialize logger, but don't fail if already initialized
    let _ = env_logger::try_init();
    log::info!("Lithe Core v{} initialized", VERSION);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init() {
        assert!(init().is_ok());
        assert!(init().is_ok());
    }

    #[test]
    fn test_version() {
        assert_eq!(VERSION, "0.1.0");
    }
}
