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

//! Compression techniques: knowledge distillation and quantization-aware training

pub mod distillation;
pub mod quantization;

pub use distillation::{
    combine_losses, distillation_loss, softened_probabilities, DistillationConfig,
    DistillationHistory, DistilledModel, Distiller, KnowledgeDistillation,
};
pub use quantization::{
    fake_quantize, FakeQuantSettings, QuantizationConfig, QuantizationParam, QuantizedModel,
    Quantizer,
};

use crate::data::DatasetSplit;
use crate::model::TrainingBundle;

/// Trait for all compression techniques
///
/// A technique reads a trained source bundle and produces its own output; it
/// never mutates the source model.
pub trait CompressionTechnique {
    type Output;

    fn name(&self) -> &'static str;

    /// Apply the technique, training on `train` where it needs to
    fn compress(&self, source: &TrainingBundle, train: &DatasetSplit) -> crate::Result<Self::Output>;
}
