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

//! Feed-forward classifiers and the training-ready bundle built around them

use crate::optimization::quantization::{
    activation_fake_quant, ActivationObserver, FakeQuantSettings, QuantizationParam,
};
use crate::serialization::{self, TensorEntry};
use crate::{LitheError, Result};
use candle_core::backprop::GradStore;
use candle_core::{DType, Device, Tensor, Var, D};
use candle_nn::optim::{AdamW, Optimizer, ParamsAdamW};
use candle_nn::{Linear, VarBuilder, VarMap};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

/// Format tag written into float checkpoint metadata
pub const CHECKPOINT_FORMAT: &str = "lithe-float";

/// Hidden-layer layout of a classifier
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Architecture {
    /// Compact 128 → 64 → 32 network with dropout 0.3
    Student,
    /// Wider 256 → 128 → 64 → 32 network with dropout 0.4
    Teacher,
    Custom { hidden: Vec<usize>, dropout: f32 },
}

impl Architecture {
    pub fn hidden(&self) -> Vec<usize> {
        match self {
            Architecture::Student => vec![128, 64, 32],
            Architecture::Teacher => vec![256, 128, 64, 32],
            Architecture::Custom { hidden, .. } => hidden.clone(),
        }
    }

    pub fn dropout(&self) -> f32 {
        match self {
            Architecture::Student => 0.3,
            Architecture::Teacher => 0.4,
            Architecture::Custom { dropout, .. } => *dropout,
        }
    }
}

/// Complete shape description of a classifier
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassifierSpec {
    pub input_dim: usize,
    pub num_classes: usize,
    pub hidden: Vec<usize>,
    /// Dropout probability applied after every hidden layer in training mode
    pub dropout: f32,
}

impl ClassifierSpec {
    pub fn new(input_dim: usize, num_classes: usize, architecture: &Architecture) -> Self {
        Self {
            input_dim,
            num_classes,
            hidden: architecture.hidden(),
            dropout: architecture.dropout(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.input_dim == 0 {
            return Err(LitheError::InvalidArgument(
                "input dimension must be positive".to_string(),
            ));
        }
        if self.num_classes == 0 {
            return Err(LitheError::InvalidArgument(
                "class count must be positive".to_string(),
            ));
        }
        if self.hidden.iter().any(|&w| w == 0) {
            return Err(LitheError::InvalidArgument(
                "hidden layer widths must be positive".to_string(),
            ));
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return Err(LitheError::InvalidArgument(format!(
                "dropout {} must be in [0, 1)",
                self.dropout
            )));
        }
        Ok(())
    }

    /// Layer widths from input to output
    pub fn widths(&self) -> Vec<usize> {
        let mut widths = Vec::with_capacity(self.hidden.len() + 2);
        widths.push(self.input_dim);
        widths.extend_from_slice(&self.hidden);
        widths.push(self.num_classes);
        widths
    }

    /// Weight and bias count of the full network
    pub fn parameter_count(&self) -> usize {
        self.widths().windows(2).map(|w| w[0] * w[1] + w[1]).sum()
    }
}

/// Whether stochastic layers are active
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardMode {
    Train,
    Inference,
}

/// Stack of dense layers with ReLU between them, producing raw logits
///
/// Parameters live in the classifier's own `VarMap`, so two classifiers never
/// share storage and an optimizer bound to one cannot reach the other.
pub struct Classifier {
    spec: ClassifierSpec,
    varmap: VarMap,
    layers: Vec<Linear>,
    fake_quant: Option<FakeQuantSettings>,
    /// One per hidden layer; only populated once fake quantization is on
    observers: Mutex<Vec<ActivationObserver>>,
    device: Device,
}

impl std::fmt::Debug for Classifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Classifier")
            .field("spec", &self.spec)
            .field("fake_quant", &self.fake_quant)
            .finish()
    }
}

impl Classifier {
    /// Freshly initialised classifier
    pub fn new(spec: ClassifierSpec, device: &Device) -> Result<Self> {
        spec.validate()?;

        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let layers = spec
            .widths()
            .windows(2)
            .enumerate()
            .map(|(i, w)| candle_nn::linear(w[0], w[1], vb.pp(layer_name(i))))
            .collect::<candle_core::Result<Vec<_>>>()?;

        debug!(
            "Built classifier {:?} with {} parameters",
            spec.widths(),
            spec.parameter_count()
        );

        Ok(Self {
            spec,
            varmap,
            layers,
            fake_quant: None,
            observers: Mutex::new(Vec::new()),
            device: device.clone(),
        })
    }

    pub fn spec(&self) -> &ClassifierSpec {
        &self.spec
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn layers(&self) -> &[Linear] {
        &self.layers
    }

    pub fn fake_quantization(&self) -> Option<&FakeQuantSettings> {
        self.fake_quant.as_ref()
    }

    /// Insert fake quantization into every dense layer's forward pass
    ///
    /// Activation observers start empty; they fill up during fine-tuning or
    /// a calibration pass.
    pub fn with_fake_quantization(mut self, settings: FakeQuantSettings) -> Self {
        self.fake_quant = Some(settings);
        self.observers = Mutex::new(vec![ActivationObserver::default(); self.spec.hidden.len()]);
        self
    }

    fn observers(&self) -> Result<MutexGuard<'_, Vec<ActivationObserver>>> {
        self.observers
            .lock()
            .map_err(|_| LitheError::Internal("activation observer lock poisoned".to_string()))
    }

    /// Frozen activation parameters per hidden layer, `None` where nothing
    /// has been observed yet. Empty without fake quantization.
    pub fn activation_params(&self) -> Result<Vec<Option<QuantizationParam>>> {
        let Some(settings) = &self.fake_quant else {
            return Ok(Vec::new());
        };
        Ok(self
            .observers()?
            .iter()
            .map(|o| o.param(settings.bits))
            .collect())
    }

    /// Update activation ranges from `xs` without touching any weight
    pub fn observe_activations(&self, xs: &Tensor) -> Result<()> {
        self.run(xs, ForwardMode::Inference, true).map(|_| ())
    }

    /// Raw logits `[batch, num_classes]`
    ///
    /// Training batches update the activation observers; inference reads them
    /// unchanged.
    pub fn forward(&self, xs: &Tensor, mode: ForwardMode) -> Result<Tensor> {
        self.run(xs, mode, mode == ForwardMode::Train)
    }

    fn run(&self, xs: &Tensor, mode: ForwardMode, observe: bool) -> Result<Tensor> {
        let width = xs.dim(D::Minus1)?;
        if width != self.spec.input_dim {
            return Err(LitheError::shape_mismatch(
                "classifier input width",
                self.spec.input_dim,
                width,
            ));
        }

        let quantize_activations = self
            .fake_quant
            .as_ref()
            .filter(|s| s.quantize_activations)
            .map(|s| s.bits);
        let mut observers = match quantize_activations {
            Some(_) => Some(self.observers()?),
            None => None,
        };

        let last = self.layers.len() - 1;
        let mut h = xs.clone();
        for (i, layer) in self.layers.iter().enumerate() {
            h = self.dense(layer, &h, mode)?;
            if i < last {
                h = h.relu()?;
                if let (Some(bits), Some(observers)) = (quantize_activations, observers.as_mut()) {
                    h = activation_fake_quant(&h, bits, &mut observers[i], observe, mode)?;
                }
                if mode == ForwardMode::Train && self.spec.dropout > 0.0 {
                    h = candle_nn::ops::dropout(&h, self.spec.dropout)?;
                }
            }
        }
        Ok(h)
    }

    fn dense(&self, layer: &Linear, xs: &Tensor, mode: ForwardMode) -> Result<Tensor> {
        let weight = match &self.fake_quant {
            Some(settings) => settings.weight_fake_quant(layer.weight(), mode)?,
            None => layer.weight().clone(),
        };
        let mut out = xs.matmul(&weight.t()?)?;
        if let Some(bias) = layer.bias() {
            out = out.broadcast_add(bias)?;
        }
        Ok(out)
    }

    /// Class probabilities in inference mode
    pub fn predict_proba(&self, xs: &Tensor) -> Result<Tensor> {
        let logits = self.forward(xs, ForwardMode::Inference)?;
        Ok(candle_nn::ops::softmax(&logits, D::Minus1)?)
    }

    pub fn parameter_count(&self) -> usize {
        self.varmap.all_vars().iter().map(|v| v.elem_count()).sum()
    }

    /// Trainable variables, in no particular order
    pub fn trainable_vars(&self) -> Vec<Var> {
        self.varmap.all_vars()
    }

    /// Variables keyed by `dense_{i}.weight` / `dense_{i}.bias`, sorted by name
    pub fn named_parameters(&self) -> Result<Vec<(String, Var)>> {
        let data = self
            .varmap
            .data()
            .lock()
            .map_err(|_| LitheError::Internal("parameter store lock poisoned".to_string()))?;
        let mut named: Vec<(String, Var)> =
            data.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        named.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(named)
    }

    /// Flattened copy of every parameter, keyed by name
    pub fn parameter_snapshot(&self) -> Result<Vec<(String, Vec<f32>)>> {
        self.named_parameters()?
            .into_iter()
            .map(|(name, var)| Ok((name, var.as_tensor().flatten_all()?.to_vec1::<f32>()?)))
            .collect()
    }

    /// Deep copy with independent parameter storage
    pub fn try_clone(&self) -> Result<Self> {
        let mut clone = Classifier::new(self.spec.clone(), &self.device)?;
        for (name, var) in self.named_parameters()? {
            clone.varmap.set_one(&name, var.as_tensor())?;
        }
        clone.fake_quant = self.fake_quant.clone();
        clone.observers = Mutex::new(self.observers()?.clone());
        Ok(clone)
    }

    /// F32 safetensors encoding with the spec in the metadata
    pub fn checkpoint_bytes(&self) -> Result<Vec<u8>> {
        let mut entries = Vec::new();
        for (name, var) in self.named_parameters()? {
            let tensor = var.as_tensor();
            entries.push(TensorEntry::f32(
                name,
                tensor.dims().to_vec(),
                &tensor.flatten_all()?.to_vec1::<f32>()?,
            ));
        }

        let mut metadata = HashMap::new();
        metadata.insert("format".to_string(), CHECKPOINT_FORMAT.to_string());
        metadata.insert("spec".to_string(), serde_json::to_string(&self.spec)?);
        serialization::encode(entries, metadata)
    }

    pub fn save_checkpoint<P: AsRef<Path>>(&self, path: P) -> Result<usize> {
        let bytes = self.checkpoint_bytes()?;
        serialization::write_bytes(path.as_ref(), &bytes)?;
        info!(
            "Saved float checkpoint to {} ({} bytes)",
            path.as_ref().display(),
            bytes.len()
        );
        Ok(bytes.len())
    }

    pub fn from_checkpoint_bytes(bytes: &[u8], device: &Device) -> Result<Self> {
        let archive = serialization::Archive::parse(bytes)?;
        archive.expect_format(CHECKPOINT_FORMAT)?;
        let spec: ClassifierSpec = serde_json::from_str(archive.metadata_value("spec")?)?;

        let mut model = Classifier::new(spec, device)?;
        for (name, var) in model.named_parameters()? {
            let values = archive.f32_values(&name)?;
            let tensor = Tensor::from_vec(values, var.as_tensor().shape(), device)?;
            model.varmap.set_one(&name, &tensor)?;
        }
        Ok(model)
    }

    pub fn load_checkpoint<P: AsRef<Path>>(path: P, device: &Device) -> Result<Self> {
        let bytes = std::fs::read(path.as_ref())
            .map_err(|e| LitheError::serialization(path.as_ref(), e))?;
        Self::from_checkpoint_bytes(&bytes, device)
    }
}

pub(crate) fn layer_name(index: usize) -> String {
    format!("dense_{}", index)
}

/// Adam hyperparameters bound to a bundle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizerSettings {
    pub learning_rate: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub eps: f64,
}

impl Default for OptimizerSettings {
    fn default() -> Self {
        Self {
            learning_rate: 1e-3,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-7,
        }
    }
}

impl OptimizerSettings {
    fn to_params(&self) -> ParamsAdamW {
        ParamsAdamW {
            lr: self.learning_rate,
            beta1: self.beta1,
            beta2: self.beta2,
            eps: self.eps,
            weight_decay: 0.0,
        }
    }
}

/// Fluent construction of a training-ready classifier
#[derive(Debug, Clone)]
pub struct ClassifierBuilder {
    input_dim: usize,
    num_classes: usize,
    architecture: Architecture,
    settings: OptimizerSettings,
    device: Device,
}

impl ClassifierBuilder {
    pub fn new(input_dim: usize, num_classes: usize) -> Self {
        Self {
            input_dim,
            num_classes,
            architecture: Architecture::Student,
            settings: OptimizerSettings::default(),
            device: Device::Cpu,
        }
    }

    pub fn architecture(mut self, architecture: Architecture) -> Self {
        self.architecture = architecture;
        self
    }

    pub fn learning_rate(mut self, learning_rate: f64) -> Self {
        self.settings.learning_rate = learning_rate;
        self
    }

    pub fn optimizer_settings(mut self, settings: OptimizerSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn device(mut self, device: &Device) -> Self {
        self.device = device.clone();
        self
    }

    pub fn build(self) -> Result<TrainingBundle> {
        let spec = ClassifierSpec::new(self.input_dim, self.num_classes, &self.architecture);
        let model = Classifier::new(spec, &self.device)?;
        info!(
            "Built {:?} classifier: {} inputs, {} classes, {} parameters",
            self.architecture,
            self.input_dim,
            self.num_classes,
            model.parameter_count()
        );
        Self::rebuild(model, &self.settings)
    }

    /// Bind a fresh optimizer with `settings` to an existing model
    pub fn rebuild(model: Classifier, settings: &OptimizerSettings) -> Result<TrainingBundle> {
        if settings.learning_rate <= 0.0 {
            return Err(LitheError::InvalidArgument(format!(
                "learning rate {} must be positive",
                settings.learning_rate
            )));
        }
        let optimizer = AdamW::new(model.trainable_vars(), settings.to_params())?;
        Ok(TrainingBundle {
            model,
            optimizer,
            settings: settings.clone(),
        })
    }
}

/// A classifier paired with the only optimizer allowed to update it
///
/// The loss is sparse categorical cross-entropy over integer labels.
pub struct TrainingBundle {
    model: Classifier,
    optimizer: AdamW,
    settings: OptimizerSettings,
}

impl TrainingBundle {
    pub fn model(&self) -> &Classifier {
        &self.model
    }

    pub fn settings(&self) -> &OptimizerSettings {
        &self.settings
    }

    pub fn into_model(self) -> Classifier {
        self.model
    }

    /// Mean cross-entropy of `logits` against integer `labels`
    pub fn loss(logits: &Tensor, labels: &Tensor) -> Result<Tensor> {
        Ok(candle_nn::loss::cross_entropy(logits, labels)?)
    }

    /// Apply already computed gradients unless one of them is not finite
    pub(crate) fn apply_gradients(&mut self, grads: &GradStore) -> Result<Option<String>> {
        for (name, var) in self.model.named_parameters()? {
            if let Some(grad) = grads.get(var.as_tensor()) {
                if !all_finite(grad)? {
                    return Ok(Some(name));
                }
            }
        }
        self.optimizer.step(grads)?;
        Ok(None)
    }
}

/// True when no element of `t` is NaN or infinite
pub(crate) fn all_finite(t: &Tensor) -> Result<bool> {
    let total = t.sqr()?.sum_all()?.to_dtype(DType::F32)?.to_scalar::<f32>()?;
    if total.is_finite() {
        return Ok(true);
    }
    // a huge but finite gradient can overflow the squared sum
    Ok(t
        .flatten_all()?
        .to_vec1::<f32>()?
        .iter()
        .all(|v| v.is_finite()))
}
