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

//! Supervised training loop and the per-epoch bookkeeping shared with distillation

use crate::config::TrainingConfig;
use crate::data::DatasetSplit;
use crate::error::InstabilityDiagnostics;
use crate::model::{Classifier, ForwardMode, TrainingBundle};
use crate::{LitheError, Result};
use candle_core::backprop::GradStore;
use candle_core::{DType, Tensor, D};
use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, info};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

/// Knobs for one supervised training run
#[derive(Debug, Clone)]
pub struct TrainingOptions {
    pub epochs: usize,
    pub batch_size: usize,
    /// Trailing fraction of the rows held out for per-epoch validation
    pub validation_fraction: f32,
    pub shuffle: bool,
    pub seed: u64,
    pub show_progress: bool,
    /// Label used in logs and instability diagnostics
    pub phase: String,
}

impl Default for TrainingOptions {
    fn default() -> Self {
        Self::from(&TrainingConfig::default())
    }
}

impl From<&TrainingConfig> for TrainingOptions {
    fn from(config: &TrainingConfig) -> Self {
        Self {
            epochs: config.epochs,
            batch_size: config.batch_size,
            validation_fraction: config.validation_fraction,
            shuffle: config.shuffle,
            seed: config.seed,
            show_progress: config.show_progress,
            phase: "training".to_string(),
        }
    }
}

impl TrainingOptions {
    pub fn with_phase(mut self, phase: impl Into<String>) -> Self {
        self.phase = phase.into();
        self
    }

    pub fn with_epochs(mut self, epochs: usize) -> Self {
        self.epochs = epochs;
        self
    }
}

/// Averages for one completed epoch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochStats {
    /// 1-based epoch number
    pub epoch: usize,
    /// Mean optimized loss (the combined loss when distilling)
    pub loss: f32,
    pub accuracy: f32,
    pub student_loss: f32,
    pub distillation_loss: Option<f32>,
    pub val_loss: Option<f32>,
    pub val_accuracy: Option<f32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrainingHistory {
    epochs: Vec<EpochStats>,
}

impl TrainingHistory {
    pub fn push(&mut self, stats: EpochStats) {
        self.epochs.push(stats);
    }

    pub fn epochs(&self) -> &[EpochStats] {
        &self.epochs
    }

    pub fn last(&self) -> Option<&EpochStats> {
        self.epochs.last()
    }

    pub fn len(&self) -> usize {
        self.epochs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.epochs.is_empty()
    }
}

/// Running sums for the epoch in progress
#[derive(Debug, Default)]
pub(crate) struct TrainingState {
    loss_sum: f64,
    student_sum: f64,
    distill_sum: Option<f64>,
    correct: usize,
    seen: usize,
}

impl TrainingState {
    pub(crate) fn record(
        &mut self,
        batch_len: usize,
        combined: f32,
        student: f32,
        distillation: Option<f32>,
        correct: usize,
    ) {
        let n = batch_len as f64;
        self.loss_sum += combined as f64 * n;
        self.student_sum += student as f64 * n;
        if let Some(d) = distillation {
            *self.distill_sum.get_or_insert(0.0) += d as f64 * n;
        }
        self.correct += correct;
        self.seen += batch_len;
    }

    pub(crate) fn finish(self, epoch: usize, validation: Option<(f32, f32)>) -> EpochStats {
        let n = self.seen.max(1) as f64;
        EpochStats {
            epoch,
            loss: (self.loss_sum / n) as f32,
            accuracy: self.correct as f32 / self.seen.max(1) as f32,
            student_loss: (self.student_sum / n) as f32,
            distillation_loss: self.distill_sum.map(|d| (d / n) as f32),
            val_loss: validation.map(|(loss, _)| loss),
            val_accuracy: validation.map(|(_, acc)| acc),
        }
    }
}

/// Number of rows whose argmax matches the label
pub(crate) fn count_correct(logits: &Tensor, labels: &Tensor) -> Result<usize> {
    let hits = logits
        .argmax(D::Minus1)?
        .eq(labels)?
        .to_dtype(DType::U32)?
        .sum_all()?
        .to_scalar::<u32>()?;
    Ok(hits as usize)
}

/// Mean cross-entropy and accuracy of `model` over `data`, dropout disabled
pub fn evaluate_split(model: &Classifier, data: &DatasetSplit, batch_size: usize) -> Result<(f32, f32)> {
    if data.is_empty() {
        return Ok((0.0, 0.0));
    }
    let mut rng = StdRng::seed_from_u64(0);
    let mut loss_sum = 0.0f64;
    let mut correct = 0usize;
    for indices in data.batch_indices(batch_size, false, &mut rng) {
        let (xs, ys) = data.batch(&indices, model.device())?;
        let logits = model.forward(&xs, ForwardMode::Inference)?;
        let loss = TrainingBundle::loss(&logits, &ys)?.to_scalar::<f32>()?;
        loss_sum += loss as f64 * indices.len() as f64;
        correct += count_correct(&logits, &ys)?;
    }
    Ok((
        (loss_sum / data.len() as f64) as f32,
        correct as f32 / data.len() as f32,
    ))
}

pub(crate) fn check_input_width(model: &Classifier, data: &DatasetSplit) -> Result<()> {
    if model.spec().input_dim != data.num_features() {
        return Err(LitheError::shape_mismatch(
            "dataset feature columns",
            model.spec().input_dim,
            data.num_features(),
        ));
    }
    Ok(())
}

/// Row-major copy of a logits tensor for diagnostics; empty if it cannot be read
pub(crate) fn logit_rows(logits: &Tensor) -> Vec<Vec<f32>> {
    logits.to_vec2::<f32>().unwrap_or_default()
}

/// Values describing one failed step
pub(crate) struct FailedStep<'a> {
    pub phase: &'a str,
    pub epoch: usize,
    pub batch: usize,
    pub teacher_logits: Option<&'a Tensor>,
    pub student_logits: &'a Tensor,
    pub student_loss: f32,
    pub distillation_loss: Option<f32>,
    pub combined_loss: f32,
    pub non_finite_gradient: Option<String>,
}

impl FailedStep<'_> {
    pub(crate) fn into_error(self) -> LitheError {
        let diagnostics = InstabilityDiagnostics {
            phase: self.phase.to_string(),
            epoch: self.epoch,
            batch: self.batch,
            teacher_logits: self.teacher_logits.map(logit_rows),
            student_logits: logit_rows(self.student_logits),
            student_loss: self.student_loss,
            distillation_loss: self.distillation_loss,
            combined_loss: self.combined_loss,
            non_finite_gradient: self.non_finite_gradient,
        };
        log::error!("Aborting {}: {}", self.phase, diagnostics);
        LitheError::NumericInstability(Box::new(diagnostics))
    }
}

pub(crate) fn progress_bar(total: u64, label: &str, enabled: bool) -> ProgressBar {
    if !enabled {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new(total);
    if let Ok(style) = ProgressStyle::with_template(
        "{spinner:.cyan} [{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} {msg}",
    ) {
        pb.set_style(style.progress_chars("█▓░"));
    }
    pb.set_message(label.to_string());
    pb
}

pub(crate) fn batches_per_epoch(rows: usize, batch_size: usize) -> usize {
    rows.div_ceil(batch_size.max(1))
}

impl TrainingBundle {
    /// Apply `grads`, or turn the first non-finite one into the error
    /// described by `failure` without touching any parameter
    pub(crate) fn update_or_fail(&mut self, grads: &GradStore, failure: FailedStep<'_>) -> Result<()> {
        match self.apply_gradients(grads)? {
            Some(name) => Err(FailedStep {
                non_finite_gradient: Some(name),
                ..failure
            }
            .into_error()),
            None => Ok(()),
        }
    }

    /// Plain supervised training against integer labels
    ///
    /// A non-finite loss or gradient aborts the run with
    /// [`LitheError::NumericInstability`]; no update is applied for that batch.
    pub fn fit(&mut self, data: &DatasetSplit, options: &TrainingOptions) -> Result<TrainingHistory> {
        check_input_width(self.model(), data)?;
        if data.is_empty() {
            return Err(LitheError::InvalidArgument(format!(
                "{} needs at least one training row",
                options.phase
            )));
        }

        let (train, validation) = data.split_tail(options.validation_fraction);
        let device = self.model().device().clone();
        let mut rng = StdRng::seed_from_u64(options.seed);
        let mut history = TrainingHistory::default();

        info!(
            "Starting {}: {} epochs over {} rows ({} held out for validation)",
            options.phase,
            options.epochs,
            train.len(),
            validation.as_ref().map_or(0, DatasetSplit::len)
        );

        let total = (batches_per_epoch(train.len(), options.batch_size) * options.epochs) as u64;
        let pb = progress_bar(total, &options.phase, options.show_progress);

        for epoch in 1..=options.epochs {
            let mut state = TrainingState::default();
            let plan = train.batch_indices(options.batch_size, options.shuffle, &mut rng);

            for (batch, indices) in plan.iter().enumerate() {
                let (xs, ys) = train.batch(indices, &device)?;
                let logits = self.model().forward(&xs, ForwardMode::Train)?;
                let loss = Self::loss(&logits, &ys)?;
                let loss_value = loss.to_scalar::<f32>()?;

                let failed = |gradient: Option<String>| FailedStep {
                    phase: &options.phase,
                    epoch,
                    batch,
                    teacher_logits: None,
                    student_logits: &logits,
                    student_loss: loss_value,
                    distillation_loss: None,
                    combined_loss: loss_value,
                    non_finite_gradient: gradient,
                };
                if !loss_value.is_finite() {
                    return Err(failed(None).into_error());
                }
                let grads = loss.backward()?;
                self.update_or_fail(&grads, failed(None))?;

                let correct = count_correct(&logits, &ys)?;
                state.record(indices.len(), loss_value, loss_value, None, correct);
                debug!("{} epoch {} batch {}: loss {:.4}", options.phase, epoch, batch, loss_value);
                pb.inc(1);
            }

            let validation_metrics = validation
                .as_ref()
                .map(|v| evaluate_split(self.model(), v, options.batch_size))
                .transpose()?;
            let stats = state.finish(epoch, validation_metrics);
            log_epoch(&options.phase, options.epochs, &stats);
            pb.set_message(format!("{} epoch {}/{} loss {:.4}", options.phase, epoch, options.epochs, stats.loss));
            history.push(stats);
        }

        pb.finish_and_clear();
        Ok(history)
    }
}

pub(crate) fn log_epoch(phase: &str, total: usize, stats: &EpochStats) {
    let mut line = format!(
        "{} epoch {}/{}: loss {:.4}, accuracy {:.4}",
        phase, stats.epoch, total, stats.loss, stats.accuracy
    );
    if let Some(d) = stats.distillation_loss {
        line.push_str(&format!(", student loss {:.4}, distillation loss {:.4}", stats.student_loss, d));
    }
    if let (Some(l), Some(a)) = (stats.val_loss, stats.val_accuracy) {
        line.push_str(&format!(", val loss {:.4}, val accuracy {:.4}", l, a));
    }
    info!("{}", line);
}
