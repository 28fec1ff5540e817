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

//! Quantization-aware training
//!
//! Fake quantization rounds weights (and optionally hidden activations) to a
//! reduced bit width on the forward pass while gradients flow through as if
//! the rounding were the identity (straight-through estimator). A model
//! fine-tuned this way is then exported as integer codes with per-layer
//! scale and zero point. Hidden activations use ranges tracked by a
//! moving-average observer during fine-tuning, frozen for inference.

use super::CompressionTechnique;
use crate::artifact::CompressedArtifact;
use crate::data::DatasetSplit;
use crate::model::{Classifier, ClassifierBuilder, ForwardMode, OptimizerSettings, TrainingBundle};
use crate::training::{TrainingHistory, TrainingOptions};
use crate::{LitheError, Result};
use candle_core::Tensor;
use log::{debug, info};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

/// Configuration for quantization-aware training and export
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuantizationConfig {
    /// Target bit width for weights and activations (2..=8)
    pub bits: u8,
    /// Symmetric weight ranges with zero point 0; otherwise min/max affine
    pub symmetric: bool,
    pub fine_tune_epochs: usize,
    pub batch_size: usize,
    pub quantize_activations: bool,
    /// Overrides the source model's learning rate during fine-tuning
    pub learning_rate: Option<f64>,
    pub validation_fraction: f32,
    pub seed: u64,
}

impl Default for QuantizationConfig {
    fn default() -> Self {
        Self {
            bits: 8,
            symmetric: true,
            fine_tune_epochs: 2,
            batch_size: 64,
            quantize_activations: true,
            learning_rate: None,
            validation_fraction: 0.1,
            seed: 42,
        }
    }
}

impl QuantizationConfig {
    pub fn validate(&self) -> Result<()> {
        if !(2..=8).contains(&self.bits) {
            return Err(LitheError::Configuration(format!(
                "quantization.bits must be between 2 and 8, got {}",
                self.bits
            )));
        }
        if self.batch_size == 0 {
            return Err(LitheError::Configuration(
                "quantization.batch_size must be greater than 0".to_string(),
            ));
        }
        if let Some(lr) = self.learning_rate {
            if lr <= 0.0 {
                return Err(LitheError::Configuration(
                    "quantization.learning_rate must be positive".to_string(),
                ));
            }
        }
        if !(0.0..1.0).contains(&self.validation_fraction) {
            return Err(LitheError::Configuration(
                "quantization.validation_fraction must be in [0, 1)".to_string(),
            ));
        }
        Ok(())
    }

    pub fn fake_quant_settings(&self) -> FakeQuantSettings {
        FakeQuantSettings {
            bits: self.bits,
            symmetric: self.symmetric,
            quantize_activations: self.quantize_activations,
        }
    }

    fn fine_tune_options(&self) -> TrainingOptions {
        TrainingOptions {
            epochs: self.fine_tune_epochs,
            batch_size: self.batch_size,
            validation_fraction: self.validation_fraction,
            shuffle: true,
            seed: self.seed,
            show_progress: false,
            phase: "quantization-aware fine-tuning".to_string(),
        }
    }
}

/// Fake-quantization behaviour attached to a classifier
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FakeQuantSettings {
    pub bits: u8,
    pub symmetric: bool,
    pub quantize_activations: bool,
}

impl FakeQuantSettings {
    pub(crate) fn weight_fake_quant(&self, weight: &Tensor, mode: ForwardMode) -> Result<Tensor> {
        let param = QuantizationParam::for_tensor(weight, self.bits, self.symmetric)?;
        apply(weight, &param, mode)
    }
}

/// Weight given to each new batch by an [`ActivationObserver`]
pub const OBSERVER_MOMENTUM: f32 = 0.1;

/// Moving-average min/max of one hidden activation
///
/// Updated on every training batch (and by calibration passes); inference
/// only reads it, so a row's output never depends on the rest of its batch.
#[derive(Debug, Clone, PartialEq)]
pub struct ActivationObserver {
    momentum: f32,
    running_min: Option<f32>,
    running_max: Option<f32>,
    batches: usize,
}

impl Default for ActivationObserver {
    fn default() -> Self {
        Self::new(OBSERVER_MOMENTUM)
    }
}

impl ActivationObserver {
    pub fn new(momentum: f32) -> Self {
        Self {
            momentum,
            running_min: None,
            running_max: None,
            batches: 0,
        }
    }

    pub fn observe(&mut self, x: &Tensor) -> Result<()> {
        let flat = x.detach().flatten_all()?;
        if flat.elem_count() == 0 {
            return Ok(());
        }
        let batch_min = flat.min(0)?.to_scalar::<f32>()?;
        let batch_max = flat.max(0)?.to_scalar::<f32>()?;
        if !(batch_min.is_finite() && batch_max.is_finite()) {
            return Ok(());
        }

        let m = self.momentum;
        self.running_min = Some(
            self.running_min
                .map_or(batch_min, |r| r * (1.0 - m) + batch_min * m),
        );
        self.running_max = Some(
            self.running_max
                .map_or(batch_max, |r| r * (1.0 - m) + batch_max * m),
        );
        self.batches += 1;
        Ok(())
    }

    pub fn batches(&self) -> usize {
        self.batches
    }

    pub fn range(&self) -> Option<(f32, f32)> {
        self.running_min.zip(self.running_max)
    }

    /// Frozen asymmetric parameters; activations are non-negative after ReLU
    pub fn param(&self, bits: u8) -> Option<QuantizationParam> {
        self.range()
            .map(|(lo, hi)| QuantizationParam::from_min_max(lo, hi, bits, false))
    }
}

/// Fake-quantize a hidden activation against its observer's range
///
/// With `observe` set the batch first updates the running range; either way
/// the quantization itself uses the observer's current parameters.
pub(crate) fn activation_fake_quant(
    h: &Tensor,
    bits: u8,
    observer: &mut ActivationObserver,
    observe: bool,
    mode: ForwardMode,
) -> Result<Tensor> {
    if observe {
        observer.observe(h)?;
    }
    let param = observer.param(bits).ok_or_else(|| {
        LitheError::InvalidArgument(
            "activation ranges are not calibrated; fine-tune or run Quantizer::calibrate first"
                .to_string(),
        )
    })?;
    apply(h, &param, mode)
}

fn apply(x: &Tensor, param: &QuantizationParam, mode: ForwardMode) -> Result<Tensor> {
    match mode {
        ForwardMode::Inference => param.fake_quantize(x),
        ForwardMode::Train => straight_through(x, param),
    }
}

/// Forward value of the quantized tensor with the gradient of the identity
fn straight_through(x: &Tensor, param: &QuantizationParam) -> Result<Tensor> {
    let detached = x.detach();
    let delta = param.fake_quantize(&detached)?.sub(&detached)?;
    Ok(x.add(&delta)?)
}

/// Fake-quantize `x` per tensor with min/max calibration
///
/// The result equals `(clamp(round(x / s) + z, qmin, qmax) - z) * s` up to
/// float rounding; its gradient with respect to `x` is the identity.
pub fn fake_quantize(x: &Tensor, bits: u8, symmetric: bool) -> Result<Tensor> {
    let param = QuantizationParam::for_tensor(x, bits, symmetric)?;
    straight_through(x, &param)
}

/// Single quantization parameter set
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuantizationParam {
    pub scale: f32,
    pub zero_point: i32,
    pub qmin: i32,
    pub qmax: i32,
}

impl QuantizationParam {
    /// Integer code range: `[-(2^(b-1) - 1), 2^(b-1) - 1]` when symmetric,
    /// `[0, 2^b - 1]` otherwise
    pub fn range(bits: u8, symmetric: bool) -> (i32, i32) {
        if symmetric {
            let qmax = (1i32 << (bits - 1)) - 1;
            (-qmax, qmax)
        } else {
            (0, (1i32 << bits) - 1)
        }
    }

    pub fn from_min_max(min_val: f32, max_val: f32, bits: u8, symmetric: bool) -> Self {
        let (qmin, qmax) = Self::range(bits, symmetric);

        if symmetric {
            let abs_max = min_val.abs().max(max_val.abs());
            return Self {
                scale: usable_scale(abs_max / qmax as f32),
                zero_point: 0,
                qmin,
                qmax,
            };
        }

        // the representable range must contain zero so that zero maps exactly
        let lo = min_val.min(0.0);
        let hi = max_val.max(0.0);
        let scale = usable_scale((hi - lo) / (qmax - qmin) as f32);
        let zero_point = ((qmin as f32 - lo / scale).round() as i32).clamp(qmin, qmax);
        Self {
            scale,
            zero_point,
            qmin,
            qmax,
        }
    }

    /// Calibrate from the observed range of `x`; never tracked by autograd
    pub fn for_tensor(x: &Tensor, bits: u8, symmetric: bool) -> Result<Self> {
        let flat = x.detach().flatten_all()?;
        let min_val = flat.min(0)?.to_scalar::<f32>()?;
        let max_val = flat.max(0)?.to_scalar::<f32>()?;
        Ok(Self::from_min_max(min_val, max_val, bits, symmetric))
    }

    /// Integer codes (stored as f32) in `[qmin, qmax]`
    pub fn quantize(&self, x: &Tensor) -> Result<Tensor> {
        Ok(x
            .affine(1.0 / self.scale as f64, self.zero_point as f64)?
            .round()?
            .clamp(self.qmin as f32, self.qmax as f32)?)
    }

    pub fn dequantize(&self, codes: &Tensor) -> Result<Tensor> {
        let scale = self.scale as f64;
        Ok(codes.affine(scale, -(self.zero_point as f64) * scale)?)
    }

    pub fn fake_quantize(&self, x: &Tensor) -> Result<Tensor> {
        self.dequantize(&self.quantize(x)?)
    }
}

/// All-zero or degenerate ranges fall back to unit scale
fn usable_scale(scale: f32) -> f32 {
    if scale.is_finite() && scale > f32::MIN_POSITIVE {
        scale
    } else {
        1.0
    }
}

/// Quantization algorithm implementation
pub struct Quantizer {
    config: QuantizationConfig,
}

impl Quantizer {
    pub fn new(config: QuantizationConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &QuantizationConfig {
        &self.config
    }

    /// Clone `source`, switch on fake quantization and bind a fresh optimizer
    ///
    /// The clone starts from the trained float weights; `source` is never
    /// touched.
    pub fn simulate(&self, source: &Classifier, settings: &OptimizerSettings) -> Result<TrainingBundle> {
        self.config.validate()?;
        let qat = source
            .try_clone()?
            .with_fake_quantization(self.config.fake_quant_settings());

        let mut settings = settings.clone();
        if let Some(lr) = self.config.learning_rate {
            settings.learning_rate = lr;
        }

        info!(
            "Simulating {}-bit {} quantization (activations: {})",
            self.config.bits,
            if self.config.symmetric { "symmetric" } else { "asymmetric" },
            self.config.quantize_activations
        );
        ClassifierBuilder::rebuild(qat, &settings)
    }

    /// Short supervised run with fake quantization active
    ///
    /// With zero epochs the weights stay as they are and a calibration pass
    /// over `train` fixes the activation ranges instead.
    pub fn fine_tune(&self, bundle: &mut TrainingBundle, train: &DatasetSplit) -> Result<TrainingHistory> {
        if bundle.model().fake_quantization().is_none() {
            return Err(LitheError::InvalidArgument(
                "fine-tuning requires a model prepared by Quantizer::simulate".to_string(),
            ));
        }
        if self.config.fine_tune_epochs == 0 {
            info!("Skipping quantization-aware fine-tuning (0 epochs), calibrating only");
            self.calibrate(bundle.model(), train)?;
            return Ok(TrainingHistory::default());
        }
        bundle.fit(train, &self.config.fine_tune_options())
    }

    /// Feed `data` through `model` in inference mode, updating only the
    /// activation observers
    pub fn calibrate(&self, model: &Classifier, data: &DatasetSplit) -> Result<()> {
        if model.fake_quantization().is_none() {
            return Err(LitheError::InvalidArgument(
                "calibration requires a model prepared by Quantizer::simulate".to_string(),
            ));
        }
        if data.is_empty() {
            return Err(LitheError::InvalidArgument(
                "calibration needs at least one row".to_string(),
            ));
        }
        let mut rng = StdRng::seed_from_u64(self.config.seed);
        for indices in data.batch_indices(self.config.batch_size, false, &mut rng) {
            let (xs, _) = data.batch(&indices, model.device())?;
            model.observe_activations(&xs)?;
        }
        debug!("Calibrated activation ranges over {} rows", data.len());
        Ok(())
    }

    /// Encode the fine-tuned model as the compact inference artifact
    pub fn export(&self, model: Classifier) -> Result<CompressedArtifact> {
        let artifact = CompressedArtifact::from_model(model)?;
        info!(
            "Exported quantized artifact: {} bytes ({:.3} MB)",
            artifact.size_bytes(),
            artifact.size_mb()
        );
        Ok(artifact)
    }
}

/// Result of the full clone → simulate → fine-tune → export sequence
#[derive(Debug)]
pub struct QuantizedModel {
    pub artifact: CompressedArtifact,
    pub history: TrainingHistory,
    /// Size of the source model's float checkpoint
    pub float_size_bytes: usize,
}

impl QuantizedModel {
    /// Fraction of the float checkpoint size saved by the artifact
    pub fn compression_ratio(&self) -> f32 {
        1.0 - (self.artifact.size_bytes() as f32 / self.float_size_bytes.max(1) as f32)
    }

    pub fn size_reduction_mb(&self) -> f32 {
        self.float_size_bytes.saturating_sub(self.artifact.size_bytes()) as f32 / (1024.0 * 1024.0)
    }
}

impl CompressionTechnique for Quantizer {
    type Output = QuantizedModel;

    fn name(&self) -> &'static str {
        "quantization-aware training"
    }

    fn compress(&self, source: &TrainingBundle, train: &DatasetSplit) -> Result<QuantizedModel> {
        let float_size_bytes = source.model().checkpoint_bytes()?.len();
        let mut bundle = self.simulate(source.model(), source.settings())?;
        let history = self.fine_tune(&mut bundle, train)?;
        let artifact = self.export(bundle.into_model())?;

        let result = QuantizedModel {
            artifact,
            history,
            float_size_bytes,
        };
        info!(
            "Quantization complete: {:.1}% size reduction ({:.2} MB saved)",
            result.compression_ratio() * 100.0,
            result.size_reduction_mb()
        );
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Architecture, ClassifierBuilder};
    use approx::assert_relative_eq;
    use candle_core::{Device, Var};

    #[test]
    fn test_quantization_config_default() {
        let config = QuantizationConfig::default();
        assert_eq!(config.bits, 8);
        assert!(config.symmetric);
        assert_eq!(config.fine_tune_epochs, 2);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_bit_width_bounds() {
        for bits in [1u8, 9, 16] {
            let config = QuantizationConfig {
                bits,
                ..Default::default()
            };
            assert!(config.validate().is_err(), "bits {} accepted", bits);
        }
    }

    #[test]
    fn test_code_ranges() {
        assert_eq!(QuantizationParam::range(8, true), (-127, 127));
        assert_eq!(QuantizationParam::range(8, false), (0, 255));
        assert_eq!(QuantizationParam::range(4, true), (-7, 7));
        assert_eq!(QuantizationParam::range(2, false), (0, 3));
    }

    #[test]
    fn test_symmetric_vs_asymmetric_params() {
        let symmetric = QuantizationParam::from_min_max(-2.0, 1.0, 8, true);
        assert_eq!(symmetric.zero_point, 0);
        assert_relative_eq!(symmetric.scale, 2.0 / 127.0);

        let asymmetric = QuantizationParam::from_min_max(-1.0, 3.0, 8, false);
        assert_relative_eq!(asymmetric.scale, 4.0 / 255.0);
        assert!(asymmetric.zero_point > 0 && asymmetric.zero_point < 255);

        // ranges that exclude zero still represent it exactly
        let positive = QuantizationParam::from_min_max(2.0, 4.0, 8, false);
        assert_eq!(positive.zero_point, 0);
    }

    #[test]
    fn test_constant_zero_tensor() {
        let param = QuantizationParam::from_min_max(0.0, 0.0, 8, true);
        assert_eq!(param.scale, 1.0);
        let x = Tensor::zeros(4, candle_core::DType::F32, &Device::Cpu).unwrap();
        let q = param.fake_quantize(&x).unwrap().to_vec1::<f32>().unwrap();
        assert_eq!(q, vec![0.0; 4]);
    }

    #[test]
    fn test_fake_quantize_error_bounded_by_half_step() {
        let values = vec![-1.0f32, -0.37, 0.0, 0.12, 0.5, 0.999];
        let x = Tensor::new(values.as_slice(), &Device::Cpu).unwrap();
        let param = QuantizationParam::for_tensor(&x, 4, true).unwrap();
        let q = fake_quantize(&x, 4, true).unwrap().to_vec1::<f32>().unwrap();

        for (orig, deq) in values.iter().zip(q.iter()) {
            assert!((orig - deq).abs() <= param.scale / 2.0 + 1e-6, "{} -> {}", orig, deq);
        }
        // at most 2^4 - 1 distinct levels
        let mut levels = q.clone();
        levels.sort_by(|a, b| a.partial_cmp(b).unwrap());
        levels.dedup();
        assert!(levels.len() <= 15);
    }

    #[test]
    fn test_straight_through_gradient_is_identity() {
        let x = Var::new(&[0.31f32, -0.77, 0.05], &Device::Cpu).unwrap();
        let y = fake_quantize(x.as_tensor(), 3, true).unwrap();
        let loss = y.sum_all().unwrap();
        let grads = loss.backward().unwrap();
        let g = grads.get(x.as_tensor()).unwrap().to_vec1::<f32>().unwrap();
        assert_eq!(g, vec![1.0, 1.0, 1.0]);
    }

    #[test]
    fn test_simulate_leaves_source_untouched() {
        let source = ClassifierBuilder::new(4, 3)
            .architecture(Architecture::Custom {
                hidden: vec![8],
                dropout: 0.0,
            })
            .build()
            .unwrap();
        let before = source.model().parameter_snapshot().unwrap();

        let quantizer = Quantizer::new(QuantizationConfig::default());
        let qat = quantizer.simulate(source.model(), source.settings()).unwrap();

        assert!(source.model().fake_quantization().is_none());
        assert!(qat.model().fake_quantization().is_some());
        assert_eq!(qat.model().parameter_snapshot().unwrap(), before);
    }

    #[test]
    fn test_fine_tune_requires_simulation() {
        let mut bundle = ClassifierBuilder::new(2, 2).build().unwrap();
        let data = DatasetSplit::from_rows(&[vec![0.0, 1.0]], vec![0]).unwrap();
        let quantizer = Quantizer::new(QuantizationConfig::default());
        assert!(quantizer.fine_tune(&mut bundle, &data).is_err());
    }
    #[test]
    fn test_observer_moving_average() {
        let mut observer = ActivationObserver::new(0.5);
        assert!(observer.param(8).is_none());

        let first = Tensor::new(&[0.0f32, 2.0, 4.0], &Device::Cpu).unwrap();
        observer.observe(&first).unwrap();
        assert_eq!(observer.range(), Some((0.0, 4.0)));

        let second = Tensor::new(&[-2.0f32, 0.0, 8.0], &Device::Cpu).unwrap();
        observer.observe(&second).unwrap();
        assert_eq!(observer.range(), Some((-1.0, 6.0)));
        assert_eq!(observer.batches(), 2);

        // non-finite batches are ignored
        let bad = Tensor::new(&[f32::NAN, 1.0], &Device::Cpu).unwrap();
        observer.observe(&bad).unwrap();
        assert_eq!(observer.batches(), 2);
    }

    #[test]
    fn test_uncalibrated_activation_quant_fails() {
        let mut observer = ActivationObserver::default();
        let h = Tensor::new(&[[0.5f32, 1.5]], &Device::Cpu).unwrap();
        let result = activation_fake_quant(&h, 8, &mut observer, false, ForwardMode::Inference);
        assert!(matches!(result, Err(LitheError::InvalidArgument(_))));

        assert!(activation_fake_quant(&h, 8, &mut observer, true, ForwardMode::Train).is_ok());
        assert_eq!(observer.batches(), 1);
    }

    #[test]
    fn test_zero_epoch_fine_tune_calibrates() {
        let source = ClassifierBuilder::new(2, 2)
            .architecture(Architecture::Custom {
                hidden: vec![4],
                dropout: 0.0,
            })
            .build()
            .unwrap();
        let config = QuantizationConfig {
            fine_tune_epochs: 0,
            batch_size: 2,
            ..Default::default()
        };
        let quantizer = Quantizer::new(config);
        let mut qat = quantizer.simulate(source.model(), source.settings()).unwrap();
        let before = qat.model().parameter_snapshot().unwrap();
        assert_eq!(qat.model().activation_params().unwrap(), vec![None]);

        let rows = vec![vec![0.0, 1.0], vec![1.0, 0.0], vec![2.0, -1.0], vec![-1.0, 3.0]];
        let data = DatasetSplit::from_rows(&rows, vec![0, 1, 0, 1]).unwrap();
        let history = quantizer.fine_tune(&mut qat, &data).unwrap();

        assert!(history.is_empty());
        assert_eq!(qat.model().parameter_snapshot().unwrap(), before);
        assert!(qat.model().activation_params().unwrap()[0].is_some());
    }
}
