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

//! Knowledge distillation for model compression
//!
//! A student classifier learns from both the hard labels and the softened
//! output distribution of a frozen teacher. The teacher is only ever run in
//! inference mode with its logits detached from the graph, and the optimizer
//! owned by the student bundle holds nothing but student variables.

use super::CompressionTechnique;
use crate::data::DatasetSplit;
use crate::model::{Architecture, Classifier, ClassifierBuilder, ForwardMode, TrainingBundle};
use crate::training::{
    batches_per_epoch, check_input_width, count_correct, evaluate_split, log_epoch, progress_bar,
    FailedStep, TrainingHistory, TrainingState,
};
use crate::{LitheError, Result};
use candle_core::{Tensor, D};
use log::{debug, info};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

/// Configuration for knowledge distillation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DistillationConfig {
    /// Weight on the hard-label loss; `1 - alpha` goes to the distillation term
    pub alpha: f32,
    /// Softmax temperature applied to both teacher and student logits
    pub temperature: f32,
    pub epochs: usize,
    pub batch_size: usize,
    /// Overrides the builder's learning rate for the student
    pub learning_rate: Option<f64>,
    /// Trailing fraction of training rows held out for per-epoch validation
    pub validation_fraction: f32,
    pub shuffle: bool,
    pub seed: u64,
    /// Multiply the divergence by `T^2` to keep gradient magnitudes
    /// comparable across temperatures
    pub scale_by_temperature_squared: bool,
    pub show_progress: bool,
}

impl Default for DistillationConfig {
    fn default() -> Self {
        Self {
            alpha: 0.1,
            temperature: 3.0,
            epochs: 10,
            batch_size: 64,
            learning_rate: None,
            validation_fraction: 0.1,
            shuffle: true,
            seed: 42,
            scale_by_temperature_squared: false,
            show_progress: false,
        }
    }
}

impl DistillationConfig {
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.alpha) {
            return Err(LitheError::Configuration(format!(
                "distillation.alpha must be in [0, 1], got {}",
                self.alpha
            )));
        }
        if !(self.temperature.is_finite() && self.temperature > 0.0) {
            return Err(LitheError::Configuration(format!(
                "distillation.temperature must be positive, got {}",
                self.temperature
            )));
        }
        if self.epochs == 0 || self.batch_size == 0 {
            return Err(LitheError::Configuration(
                "distillation.epochs and distillation.batch_size must be greater than 0"
                    .to_string(),
            ));
        }
        if !(0.0..1.0).contains(&self.validation_fraction) {
            return Err(LitheError::Configuration(
                "distillation.validation_fraction must be in [0, 1)".to_string(),
            ));
        }
        Ok(())
    }
}

/// `softmax(logits / T)` along the class axis
pub fn softened_probabilities(logits: &Tensor, temperature: f32) -> Result<Tensor> {
    let scaled = logits.affine(1.0 / temperature as f64, 0.0)?;
    Ok(candle_nn::ops::softmax(&scaled, D::Minus1)?)
}

/// KL(teacher ‖ student) of the temperature-softened distributions, averaged
/// over the batch
///
/// Computed from log-softmax so a teacher probability that underflows to zero
/// contributes zero instead of NaN. The teacher logits are detached here as
/// well, so no gradient can reach whatever produced them.
pub fn distillation_loss(
    teacher_logits: &Tensor,
    student_logits: &Tensor,
    temperature: f32,
) -> Result<Tensor> {
    let (batch, t_width) = teacher_logits.dims2()?;
    let (s_batch, s_width) = student_logits.dims2()?;
    if t_width != s_width {
        return Err(LitheError::shape_mismatch("logit width", t_width, s_width));
    }
    if batch != s_batch {
        return Err(LitheError::shape_mismatch("logit rows", batch, s_batch));
    }

    let inv_t = 1.0 / temperature as f64;
    let log_p = candle_nn::ops::log_softmax(&teacher_logits.detach().affine(inv_t, 0.0)?, D::Minus1)?;
    let log_q = candle_nn::ops::log_softmax(&student_logits.affine(inv_t, 0.0)?, D::Minus1)?;
    let kl = log_p.exp()?.mul(&log_p.sub(&log_q)?)?.sum_all()?;
    Ok(kl.affine(1.0 / batch.max(1) as f64, 0.0)?)
}

/// `alpha * student_loss + (1 - alpha) * distillation_loss`
pub fn combine_losses(student_loss: &Tensor, distillation_loss: &Tensor, alpha: f32) -> Result<Tensor> {
    let hard = student_loss.affine(alpha as f64, 0.0)?;
    let soft = distillation_loss.affine(1.0 - alpha as f64, 0.0)?;
    Ok(hard.add(&soft)?)
}

/// Scalar values from one optimizer step
#[derive(Debug, Clone, Copy)]
pub struct StepMetrics {
    pub combined_loss: f32,
    pub student_loss: f32,
    pub distillation_loss: f32,
    pub correct: usize,
}

/// Per-epoch record of a distillation run
pub type DistillationHistory = TrainingHistory;

/// Trains one student against one frozen teacher
///
/// The teacher is borrowed immutably for the whole run; the student bundle is
/// owned and handed back by [`Distiller::into_student`].
pub struct Distiller<'t> {
    teacher: &'t Classifier,
    student: TrainingBundle,
    config: DistillationConfig,
}

impl<'t> Distiller<'t> {
    pub fn new(teacher: &'t Classifier, student: TrainingBundle, config: DistillationConfig) -> Result<Self> {
        config.validate()?;

        let t_spec = teacher.spec();
        let s_spec = student.model().spec();
        if t_spec.num_classes != s_spec.num_classes {
            return Err(LitheError::shape_mismatch(
                "teacher/student output width",
                t_spec.num_classes,
                s_spec.num_classes,
            ));
        }
        if t_spec.input_dim != s_spec.input_dim {
            return Err(LitheError::shape_mismatch(
                "teacher/student input width",
                t_spec.input_dim,
                s_spec.input_dim,
            ));
        }

        Ok(Self {
            teacher,
            student,
            config,
        })
    }

    pub fn teacher(&self) -> &Classifier {
        self.teacher
    }

    pub fn student(&self) -> &Classifier {
        self.student.model()
    }

    pub fn config(&self) -> &DistillationConfig {
        &self.config
    }

    pub fn into_student(self) -> TrainingBundle {
        self.student
    }

    /// One forward/backward/update cycle on a single batch
    pub fn train_step(&mut self, xs: &Tensor, ys: &Tensor, epoch: usize, batch: usize) -> Result<StepMetrics> {
        let temperature = self.config.temperature;

        let teacher_logits = self.teacher.forward(xs, ForwardMode::Inference)?.detach();
        let student_logits = self.student.model().forward(xs, ForwardMode::Train)?;

        let student_loss = TrainingBundle::loss(&student_logits, ys)?;
        let mut soft_loss = distillation_loss(&teacher_logits, &student_logits, temperature)?;
        if self.config.scale_by_temperature_squared {
            soft_loss = soft_loss.affine((temperature * temperature) as f64, 0.0)?;
        }
        let combined = combine_losses(&student_loss, &soft_loss, self.config.alpha)?;

        let student_value = student_loss.to_scalar::<f32>()?;
        let soft_value = soft_loss.to_scalar::<f32>()?;
        let combined_value = combined.to_scalar::<f32>()?;

        let failed = |gradient: Option<String>| FailedStep {
            phase: "distillation",
            epoch,
            batch,
            teacher_logits: Some(&teacher_logits),
            student_logits: &student_logits,
            student_loss: student_value,
            distillation_loss: Some(soft_value),
            combined_loss: combined_value,
            non_finite_gradient: gradient,
        };
        if !(combined_value.is_finite() && student_value.is_finite() && soft_value.is_finite()) {
            return Err(failed(None).into_error());
        }

        let grads = combined.backward()?;
        for (name, var) in self.teacher.named_parameters()? {
            if grads.get(var.as_tensor()).is_some() {
                return Err(LitheError::Internal(format!(
                    "teacher parameter '{}' received a gradient",
                    name
                )));
            }
        }
        self.student.update_or_fail(&grads, failed(None))?;

        Ok(StepMetrics {
            combined_loss: combined_value,
            student_loss: student_value,
            distillation_loss: soft_value,
            correct: count_correct(&student_logits, ys)?,
        })
    }

    /// Run every configured epoch over `data`
    ///
    /// Batching, shuffling and the validation hold-out follow the same rules
    /// as [`TrainingBundle::fit`], so `alpha = 1` reproduces plain supervised
    /// training.
    pub fn train(&mut self, data: &DatasetSplit) -> Result<DistillationHistory> {
        check_input_width(self.student.model(), data)?;
        if data.is_empty() {
            return Err(LitheError::InvalidArgument(
                "distillation needs at least one training row".to_string(),
            ));
        }

        let (train, validation) = data.split_tail(self.config.validation_fraction);
        let device = self.student.model().device().clone();
        let mut rng = StdRng::seed_from_u64(self.config.seed);
        let mut history = DistillationHistory::default();
        let epochs = self.config.epochs;
        let batch_size = self.config.batch_size;

        info!(
            "Starting knowledge distillation: alpha {}, temperature {}, {} epochs",
            self.config.alpha, self.config.temperature, epochs
        );
        info!(
            "Teacher params: {}, student params: {}",
            self.teacher.parameter_count(),
            self.student.model().parameter_count()
        );

        let total = (batches_per_epoch(train.len(), batch_size) * epochs) as u64;
        let pb = progress_bar(total, "distillation", self.config.show_progress);

        for epoch in 1..=epochs {
            let mut state = TrainingState::default();
            let plan = train.batch_indices(batch_size, self.config.shuffle, &mut rng);

            for (batch, indices) in plan.iter().enumerate() {
                let (xs, ys) = train.batch(indices, &device)?;
                let step = self.train_step(&xs, &ys, epoch, batch)?;
                state.record(
                    indices.len(),
                    step.combined_loss,
                    step.student_loss,
                    Some(step.distillation_loss),
                    step.correct,
                );
                debug!(
                    "distillation epoch {} batch {}: combined {:.4}, student {:.4}, distillation {:.4}",
                    epoch, batch, step.combined_loss, step.student_loss, step.distillation_loss
                );
                pb.inc(1);
            }

            let validation_metrics = validation
                .as_ref()
                .map(|v| evaluate_split(self.student.model(), v, batch_size))
                .transpose()?;
            let stats = state.finish(epoch, validation_metrics);
            log_epoch("distillation", epochs, &stats);
            history.push(stats);
        }

        pb.finish_and_clear();
        Ok(history)
    }
}

/// Result of a distillation run
#[derive(Debug)]
pub struct DistilledModel {
    pub student: Classifier,
    pub history: DistillationHistory,
    pub teacher_parameters: usize,
    pub student_parameters: usize,
}

impl DistilledModel {
    /// Teacher parameter count divided by student parameter count
    pub fn compression_ratio(&self) -> f32 {
        self.teacher_parameters as f32 / self.student_parameters.max(1) as f32
    }
}

/// Builds a fresh student and distils the source model into it
pub struct KnowledgeDistillation {
    config: DistillationConfig,
    student_architecture: Architecture,
}

impl KnowledgeDistillation {
    pub fn new(config: DistillationConfig) -> Self {
        Self {
            config,
            student_architecture: Architecture::Student,
        }
    }

    pub fn with_student_architecture(mut self, architecture: Architecture) -> Self {
        self.student_architecture = architecture;
        self
    }
}

impl CompressionTechnique for KnowledgeDistillation {
    type Output = DistilledModel;

    fn name(&self) -> &'static str {
        "knowledge distillation"
    }

    fn compress(&self, source: &TrainingBundle, train: &DatasetSplit) -> Result<DistilledModel> {
        let teacher = source.model();
        let mut settings = source.settings().clone();
        if let Some(lr) = self.config.learning_rate {
            settings.learning_rate = lr;
        }

        let student = ClassifierBuilder::new(teacher.spec().input_dim, teacher.spec().num_classes)
            .architecture(self.student_architecture.clone())
            .optimizer_settings(settings)
            .device(teacher.device())
            .build()?;

        let mut distiller = Distiller::new(teacher, student, self.config.clone())?;
        let history = distiller.train(train)?;
        let student = distiller.into_student().into_model();

        let result = DistilledModel {
            teacher_parameters: teacher.parameter_count(),
            student_parameters: student.parameter_count(),
            student,
            history,
        };
        info!(
            "Distillation complete: {:.1}x fewer parameters than the teacher",
            result.compression_ratio()
        );
        Ok(result)
    }
}
