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

//! End-to-end compression run: baseline, teacher, distilled student and QAT artifact

use crate::config::Config;
use crate::data::{load_directory, prepare, DatasetSplit, PreparedData};
use crate::evaluation::{ComparisonReport, Evaluator};
use crate::model::{Architecture, Classifier, ClassifierBuilder, OptimizerSettings, TrainingBundle};
use crate::optimization::{CompressionTechnique, KnowledgeDistillation, Quantizer};
use crate::training::{TrainingHistory, TrainingOptions};
use crate::{LitheError, Result};
use candle_core::Device;
use log::{info, warn};
use std::path::{Path, PathBuf};
use std::time::Instant;

pub const BASELINE_FILE: &str = "baseline.safetensors";
pub const TEACHER_FILE: &str = "teacher.safetensors";
pub const STUDENT_FILE: &str = "student.safetensors";
pub const QUANTIZED_FILE: &str = "model_qat.lqa";

/// Names used for the variants in the comparison report
pub const BASELINE: &str = "baseline";
pub const QUANTIZED: &str = "qat";
pub const DISTILLED: &str = "distilled";

/// Everything a run produced
#[derive(Debug)]
pub struct PipelineOutcome {
    pub report: ComparisonReport,
    pub baseline_history: TrainingHistory,
    pub teacher_history: TrainingHistory,
    pub distillation_history: TrainingHistory,
    pub qat_history: TrainingHistory,
    /// Files that were written successfully
    pub written: Vec<PathBuf>,
    /// Write failures; earlier phases and the report stay valid
    pub write_failures: Vec<LitheError>,
    pub elapsed_ms: u64,
}

impl PipelineOutcome {
    pub fn is_complete(&self) -> bool {
        self.write_failures.is_empty()
    }

    pub fn summary(&self) -> String {
        let files = self
            .written
            .iter()
            .map(|p| p.display().to_string())
            .collect::<Vec<_>>()
            .join(", ");
        format!(
            "Run Summary:\n\
             - Baseline epochs: {}\n\
             - Teacher epochs: {}\n\
             - Distillation epochs: {}\n\
             - QAT fine-tuning epochs: {}\n\
             - Files written: {}\n\
             - Write failures: {}\n\
             - Elapsed: {} ms",
            self.baseline_history.len(),
            self.teacher_history.len(),
            self.distillation_history.len(),
            self.qat_history.len(),
            if files.is_empty() { "none".to_string() } else { files },
            self.write_failures.len(),
            self.elapsed_ms
        )
    }
}

/// Orchestrates the full compression run
pub struct Pipeline {
    config: Config,
    device: Device,
}

impl Pipeline {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            device: Device::Cpu,
        }
    }

    pub fn with_device(mut self, device: Device) -> Self {
        self.device = device;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Ingest and prepare a directory of flow records, then run
    pub fn run_directory<P: AsRef<Path>>(&self, dir: P) -> Result<PipelineOutcome> {
        self.config.validate()?;
        let table = load_directory(dir.as_ref(), &self.config.data)?;
        let prepared = prepare(table, &self.config.data)?;
        self.run(&prepared)
    }

    pub fn run(&self, data: &PreparedData) -> Result<PipelineOutcome> {
        self.config.validate()?;
        let start = Instant::now();
        let num_features = data.train.num_features();
        let num_classes = data.labels.len();

        info!(
            "Starting compression run: {} train rows, {} test rows, {} features, {} classes",
            data.train.len(),
            data.test.len(),
            num_features,
            num_classes
        );

        let settings = OptimizerSettings {
            learning_rate: self.config.training.learning_rate,
            ..Default::default()
        };
        let options = TrainingOptions::from(&self.config.training);

        let mut baseline = self.builder(num_features, num_classes, Architecture::Student, &settings)
            .build()?;
        let baseline_history = baseline.fit(&data.train, &options.clone().with_phase(BASELINE))?;

        let mut teacher = self.builder(num_features, num_classes, Architecture::Teacher, &settings)
            .build()?;
        let teacher_history = teacher.fit(&data.train, &options.with_phase("teacher"))?;

        let distillation = KnowledgeDistillation::new(self.config.distillation.clone());
        let distilled = apply_technique(&distillation, &teacher, &data.train)?;

        // QAT works on its own clone, so the baseline measured below is untouched
        let quantizer = Quantizer::new(self.config.quantization.clone());
        let quantized = apply_technique(&quantizer, &baseline, &data.train)?;

        let mut written = Vec::new();
        let mut write_failures = Vec::new();
        let out_dir = &self.config.output.directory;
        let dir_ready = match std::fs::create_dir_all(out_dir) {
            Ok(()) => true,
            Err(e) => {
                let err = LitheError::serialization(out_dir, e);
                warn!("{}", err);
                write_failures.push(err);
                false
            }
        };
        if dir_ready {
            let mut record = |path: PathBuf, result: Result<()>| match result {
                Ok(()) => written.push(path),
                Err(e) => {
                    warn!("{}", e);
                    write_failures.push(e);
                }
            };
            for (file, model) in [
                (BASELINE_FILE, baseline.model()),
                (TEACHER_FILE, teacher.model()),
                (STUDENT_FILE, &distilled.student),
            ] {
                let path = out_dir.join(file);
                let result = model.save_checkpoint(&path).map(|_| ());
                record(path, result);
            }
            let path = out_dir.join(QUANTIZED_FILE);
            let result = quantized.artifact.write_to(&path);
            record(path, result);
        }

        let evaluator = Evaluator::new(&data.labels);
        let mut report = ComparisonReport::new();
        report.push(evaluator.evaluate(
            BASELINE,
            baseline.model(),
            &data.test,
            Some(checkpoint_size(baseline.model())?),
        )?);
        let reloaded = quantized.artifact.reload()?;
        report.push(evaluator.evaluate(
            QUANTIZED,
            &reloaded,
            &data.test,
            Some(quantized.artifact.size_bytes()),
        )?);
        report.push(evaluator.evaluate(
            DISTILLED,
            &distilled.student,
            &data.test,
            Some(checkpoint_size(&distilled.student)?),
        )?);

        let outcome = PipelineOutcome {
            report,
            baseline_history,
            teacher_history,
            distillation_history: distilled.history,
            qat_history: quantized.history,
            written,
            write_failures,
            elapsed_ms: start.elapsed().as_millis() as u64,
        };
        info!("{}", outcome.summary());
        Ok(outcome)
    }

    fn builder(
        &self,
        num_features: usize,
        num_classes: usize,
        architecture: Architecture,
        settings: &OptimizerSettings,
    ) -> ClassifierBuilder {
        ClassifierBuilder::new(num_features, num_classes)
            .architecture(architecture)
            .optimizer_settings(settings.clone())
            .device(&self.device)
    }
}

fn apply_technique<T: CompressionTechnique>(
    technique: &T,
    source: &TrainingBundle,
    train: &DatasetSplit,
) -> Result<T::Output> {
    info!("Applying {}", technique.name());
    let start = Instant::now();
    let output = technique.compress(source, train)?;
    info!("Finished {} in {:.1}s", technique.name(), start.elapsed().as_secs_f64());
    Ok(output)
}

fn checkpoint_size(model: &Classifier) -> Result<usize> {
    Ok(model.checkpoint_bytes()?.len())
}
