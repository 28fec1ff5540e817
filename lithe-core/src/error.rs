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

//! Error handling for Lithe Core

use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for Lithe operations
pub type Result<T> = std::result::Result<T, LitheError>;

/// Error types for compression, training and artifact handling
#[derive(Error, Debug)]
pub enum LitheError {
    #[error("Ingestion failed for {}: {reason}", path.display())]
    Ingestion { path: PathBuf, reason: String },

    #[error("Shape mismatch in {what}: expected {expected}, got {actual}")]
    ShapeMismatch {
        what: String,
        expected: usize,
        actual: usize,
    },

    #[error("Numeric instability: {0}")]
    NumericInstability(Box<InstabilityDiagnostics>),

    #[error("Serialization failed for {}: {reason}", path.display())]
    Serialization { path: PathBuf, reason: String },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Artifact format error: {0}")]
    ArtifactFormat(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Tensor error: {0}")]
    Tensor(#[from] candle_core::Error),

    #[error("Safetensors error: {0}")]
    SafeTensors(#[from] safetensors::SafeTensorError),
}

/// Values captured when a training step produces a non-finite loss or gradient.
///
/// Logits are stored row-major, one inner vector per sample of the failing batch.
#[derive(Debug, Clone)]
pub struct InstabilityDiagnostics {
    pub phase: String,
    pub epoch: usize,
    pub batch: usize,
    pub teacher_logits: Option<Vec<Vec<f32>>>,
    pub student_logits: Vec<Vec<f32>>,
    pub student_loss: f32,
    pub distillation_loss: Option<f32>,
    pub combined_loss: f32,
    /// Name of the first parameter whose gradient contained NaN or infinity
    pub non_finite_gradient: Option<String>,
}

impl fmt::Display for InstabilityDiagnostics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} epoch {} batch {}: combined loss {}, student loss {}",
            self.phase, self.epoch, self.batch, self.combined_loss, self.student_loss
        )?;
        if let Some(distill) = self.distillation_loss {
            write!(f, ", distillation loss {}", distill)?;
        }
        if let Some(name) = &self.non_finite_gradient {
            write!(f, ", non-finite gradient in '{}'", name)?;
        }
        if let Some(teacher) = &self.teacher_logits {
            write!(f, ", teacher logits {:?}", preview(teacher))?;
        }
        write!(f, ", student logits {:?}", preview(&self.student_logits))
    }
}

/// First few rows, enough to eyeball a blow-up without flooding the log
fn preview(rows: &[Vec<f32>]) -> &[Vec<f32>] {
    &rows[..rows.len().min(4)]
}

impl LitheError {
    pub fn shape_mismatch(what: impl Into<String>, expected: usize, actual: usize) -> Self {
        Self::ShapeMismatch {
            what: what.into(),
            expected,
            actual,
        }
    }

    pub fn serialization(path: impl Into<PathBuf>, reason: impl fmt::Display) -> Self {
        Self::Serialization {
            path: path.into(),
            reason: reason.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instability_message_lists_components() {
        let diag = InstabilityDiagnostics {
            phase: "distillation".to_string(),
            epoch: 1,
            batch: 7,
            teacher_logits: Some(vec![vec![1.0, 2.0]]),
            student_logits: vec![vec![f32::NAN, 0.0]],
            student_loss: f32::NAN,
            distillation_loss: Some(0.5),
            combined_loss: f32::NAN,
            non_finite_gradient: Some("dense_0.weight".to_string()),
        };
        let message = LitheError::NumericInstability(Box::new(diag)).to_string();
        assert!(message.contains("distillation epoch 1 batch 7"));
        assert!(message.contains("distillation loss 0.5"));
        assert!(message.contains("dense_0.weight"));
        assert!(message.contains("teacher logits"));
    }

    #[test]
    fn test_shape_mismatch_display() {
        let err = LitheError::shape_mismatch("teacher output width", 3, 4);
        assert_eq!(
            err.to_string(),
            "Shape mismatch in teacher output width: expected 3, got 4"
        );
    }
}
