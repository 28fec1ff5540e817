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

//! Compact quantized inference artifact
//!
//! Layout (safetensors):
//! - `dense_{i}.weight`: `U8` codes `q - qmin`, row-major `[out, in]`, two
//!   codes per byte (low nibble first) when the bit width is 4 or less
//! - `dense_{i}.bias`: `F32`
//! - metadata: `format`, `version`, `spec` (JSON), `bits`, `symmetric`,
//!   `quantize_activations` and `dense_{i}.{scale,zero_point,qmin,qmax}`;
//!   hidden layers with quantized activations also carry
//!   `dense_{i}.act_{scale,zero_point,qmin,qmax}`

use crate::model::{layer_name, Classifier, ClassifierSpec};
use crate::optimization::quantization::{FakeQuantSettings, QuantizationParam};
use crate::serialization::{self, Archive, TensorEntry};
use crate::{LitheError, Result};
use candle_core::{Device, Tensor, D};
use std::collections::HashMap;
use std::path::Path;

pub const ARTIFACT_FORMAT: &str = "lithe-qat";
pub const ARTIFACT_VERSION: u32 = 1;

/// A fine-tuned quantization-aware model together with its exported bytes
///
/// Only [`Quantizer::export`](crate::optimization::Quantizer::export) builds
/// one, so the reported size always belongs to a finished transform.
#[derive(Debug)]
pub struct CompressedArtifact {
    model: Classifier,
    bytes: Vec<u8>,
}

impl CompressedArtifact {
    pub(crate) fn from_model(model: Classifier) -> Result<Self> {
        let bytes = encode(&model)?;
        Ok(Self { model, bytes })
    }

    /// The in-memory quantization-aware model the bytes were produced from
    pub fn model(&self) -> &Classifier {
        &self.model
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn size_bytes(&self) -> usize {
        self.bytes.len()
    }

    pub fn size_mb(&self) -> f64 {
        self.bytes.len() as f64 / (1024.0 * 1024.0)
    }

    pub fn write_to<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        serialization::write_bytes(path.as_ref(), &self.bytes)?;
        log::info!(
            "Wrote quantized artifact to {} ({} bytes)",
            path.as_ref().display(),
            self.bytes.len()
        );
        Ok(())
    }

    pub fn reload(&self) -> Result<QuantizedClassifier> {
        QuantizedClassifier::from_bytes(&self.bytes, self.model.device())
    }
}

fn encode(model: &Classifier) -> Result<Vec<u8>> {
    let settings = model.fake_quantization().ok_or_else(|| {
        LitheError::InvalidArgument(
            "only a quantization-aware model can be exported; run Quantizer::simulate first"
                .to_string(),
        )
    })?;

    let mut metadata = HashMap::new();
    metadata.insert("format".to_string(), ARTIFACT_FORMAT.to_string());
    metadata.insert("version".to_string(), ARTIFACT_VERSION.to_string());
    metadata.insert("spec".to_string(), serde_json::to_string(model.spec())?);
    metadata.insert("bits".to_string(), settings.bits.to_string());
    metadata.insert("symmetric".to_string(), settings.symmetric.to_string());
    metadata.insert(
        "quantize_activations".to_string(),
        settings.quantize_activations.to_string(),
    );

    let activations = model.activation_params()?;
    if settings.quantize_activations && activations.iter().any(Option::is_none) {
        return Err(LitheError::InvalidArgument(
            "activation ranges are not calibrated; fine-tune or run Quantizer::calibrate first"
                .to_string(),
        ));
    }

    let mut entries = Vec::with_capacity(model.layers().len() * 2);
    for (i, layer) in model.layers().iter().enumerate() {
        let name = layer_name(i);
        let weight = layer.weight();
        let param = QuantizationParam::for_tensor(weight, settings.bits, settings.symmetric)?;
        let codes: Vec<u8> = param
            .quantize(weight)?
            .flatten_all()?
            .to_vec1::<f32>()?
            .into_iter()
            .map(|c| (c as i32 - param.qmin) as u8)
            .collect();
        entries.push(TensorEntry::u8(
            format!("{}.weight", name),
            pack_codes(&codes, settings.bits),
        ));

        if let Some(bias) = layer.bias() {
            let values = bias.to_vec1::<f32>()?;
            entries.push(TensorEntry::f32(format!("{}.bias", name), vec![values.len()], &values));
        }

        metadata.insert(format!("{}.scale", name), param.scale.to_string());
        metadata.insert(format!("{}.zero_point", name), param.zero_point.to_string());
        metadata.insert(format!("{}.qmin", name), param.qmin.to_string());
        metadata.insert(format!("{}.qmax", name), param.qmax.to_string());

        if let Some(Some(act)) = activations.get(i).filter(|_| settings.quantize_activations) {
            metadata.insert(format!("{}.act_scale", name), act.scale.to_string());
            metadata.insert(format!("{}.act_zero_point", name), act.zero_point.to_string());
            metadata.insert(format!("{}.act_qmin", name), act.qmin.to_string());
            metadata.insert(format!("{}.act_qmax", name), act.qmax.to_string());
        }
    }

    serialization::encode(entries, metadata)
}

/// Two codes per byte when they fit in a nibble
pub(crate) fn pack_codes(codes: &[u8], bits: u8) -> Vec<u8> {
    if bits > 4 {
        return codes.to_vec();
    }
    codes
        .chunks(2)
        .map(|pair| (pair[0] & 0x0f) | (pair.get(1).copied().unwrap_or(0) << 4))
        .collect()
}

pub(crate) fn unpack_codes(bytes: &[u8], bits: u8, count: usize) -> Result<Vec<u8>> {
    let expected = if bits > 4 { count } else { count.div_ceil(2) };
    if bytes.len() != expected {
        return Err(LitheError::ArtifactFormat(format!(
            "expected {} code bytes for {} weights, found {}",
            expected,
            count,
            bytes.len()
        )));
    }
    if bits > 4 {
        return Ok(bytes.to_vec());
    }
    Ok(bytes
        .iter()
        .flat_map(|b| [b & 0x0f, b >> 4])
        .take(count)
        .collect())
}

/// `{prefix}scale`, `{prefix}zero_point`, `{prefix}qmin` and `{prefix}qmax`
fn read_param(archive: &Archive<'_>, prefix: &str) -> Result<QuantizationParam> {
    Ok(QuantizationParam {
        scale: archive.metadata_parsed(&format!("{}scale", prefix))?,
        zero_point: archive.metadata_parsed(&format!("{}zero_point", prefix))?,
        qmin: archive.metadata_parsed(&format!("{}qmin", prefix))?,
        qmax: archive.metadata_parsed(&format!("{}qmax", prefix))?,
    })
}

struct QuantizedLayer {
    weight: Tensor,
    bias: Tensor,
    param: QuantizationParam,
    /// Frozen range for the activation after this layer's ReLU
    activation: Option<QuantizationParam>,
}

/// Inference-only classifier rebuilt from an exported artifact
///
/// Weights are held dequantized; the forward pass matches the
/// quantization-aware model it was exported from in inference mode. Every
/// parameter is fixed at load time, so rows are independent of their batch.
pub struct QuantizedClassifier {
    spec: ClassifierSpec,
    settings: FakeQuantSettings,
    layers: Vec<QuantizedLayer>,
    device: Device,
}

impl QuantizedClassifier {
    pub fn from_bytes(bytes: &[u8], device: &Device) -> Result<Self> {
        let archive = Archive::parse(bytes)?;
        archive.expect_format(ARTIFACT_FORMAT)?;
        let version: u32 = archive.metadata_parsed("version")?;
        if version != ARTIFACT_VERSION {
            return Err(LitheError::ArtifactFormat(format!(
                "unsupported artifact version {}",
                version
            )));
        }

        let spec: ClassifierSpec = serde_json::from_str(archive.metadata_value("spec")?)?;
        spec.validate()?;
        let settings = FakeQuantSettings {
            bits: archive.metadata_parsed("bits")?,
            symmetric: archive.metadata_parsed("symmetric")?,
            quantize_activations: archive.metadata_parsed("quantize_activations")?,
        };
        if !(2..=8).contains(&settings.bits) {
            return Err(LitheError::ArtifactFormat(format!(
                "bit width {} out of range",
                settings.bits
            )));
        }

        let widths = spec.widths();
        let mut layers = Vec::with_capacity(widths.len() - 1);
        for (i, w) in widths.windows(2).enumerate() {
            let (fan_in, fan_out) = (w[0], w[1]);
            let name = layer_name(i);
            let param = read_param(&archive, &format!("{}.", name))?;

            let packed = archive.u8_values(&format!("{}.weight", name))?;
            let codes: Vec<f32> = unpack_codes(&packed, settings.bits, fan_in * fan_out)?
                .into_iter()
                .map(|u| (u as i32 + param.qmin) as f32)
                .collect();
            let codes = Tensor::from_vec(codes, (fan_out, fan_in), device)?;
            let weight = param.dequantize(&codes)?;

            let bias_values = archive.f32_values(&format!("{}.bias", name))?;
            if bias_values.len() != fan_out {
                return Err(LitheError::shape_mismatch(
                    format!("{}.bias", name),
                    fan_out,
                    bias_values.len(),
                ));
            }
            let bias = Tensor::from_vec(bias_values, fan_out, device)?;

            let hidden = i + 1 < widths.len() - 1;
            let activation = if hidden && settings.quantize_activations {
                Some(read_param(&archive, &format!("{}.act_", name))?)
            } else {
                None
            };

            layers.push(QuantizedLayer {
                weight,
                bias,
                param,
                activation,
            });
        }

        Ok(Self {
            spec,
            settings,
            layers,
            device: device.clone(),
        })
    }

    pub fn from_file<P: AsRef<Path>>(path: P, device: &Device) -> Result<Self> {
        let bytes = std::fs::read(path.as_ref())
            .map_err(|e| LitheError::serialization(path.as_ref(), e))?;
        Self::from_bytes(&bytes, device)
    }

    pub fn spec(&self) -> &ClassifierSpec {
        &self.spec
    }

    pub fn settings(&self) -> &FakeQuantSettings {
        &self.settings
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Per-layer weight scale and zero point, in layer order
    pub fn layer_params(&self) -> Vec<&QuantizationParam> {
        self.layers.iter().map(|l| &l.param).collect()
    }

    /// Frozen activation parameters of the hidden layers, in layer order
    pub fn activation_params(&self) -> Vec<&QuantizationParam> {
        self.layers.iter().filter_map(|l| l.activation.as_ref()).collect()
    }

    /// Raw logits `[batch, num_classes]`
    pub fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let width = xs.dim(D::Minus1)?;
        if width != self.spec.input_dim {
            return Err(LitheError::shape_mismatch(
                "classifier input width",
                self.spec.input_dim,
                width,
            ));
        }

        let last = self.layers.len() - 1;
        let mut h = xs.clone();
        for (i, layer) in self.layers.iter().enumerate() {
            h = h.matmul(&layer.weight.t()?)?.broadcast_add(&layer.bias)?;
            if i < last {
                h = h.relu()?;
                if let Some(param) = &layer.activation {
                    h = param.fake_quantize(&h)?;
                }
            }
        }
        Ok(h)
    }

    pub fn predict_proba(&self, xs: &Tensor) -> Result<Tensor> {
        Ok(candle_nn::ops::softmax(&self.forward(xs)?, D::Minus1)?)
    }
}
