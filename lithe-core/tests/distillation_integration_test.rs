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

//! Knowledge distillation integration tests
//!
//! Covers a full distillation run on a small imbalanced three-class problem,
//! the frozen-teacher guarantee and the `alpha = 1` reduction to plain
//! supervised training.

mod common;

#[cfg(test)]
mod tests {
    use super::common::clustered_split;
    use candle_core::Device;
    use lithe_core::model::OptimizerSettings;
    use lithe_core::optimization::{CompressionTechnique, KnowledgeDistillation};
    use lithe_core::{
        Architecture, ClassifierBuilder, DistillationConfig, Distiller, LitheError, TrainingBundle,
        TrainingOptions,
    };

    fn trained_teacher(input_dim: usize, num_classes: usize) -> TrainingBundle {
        let data = clustered_split(&[120, 120, 60], input_dim, 11);
        let mut teacher = ClassifierBuilder::new(input_dim, num_classes)
            .architecture(Architecture::Teacher)
            .build()
            .unwrap();
        teacher
            .fit(&data, &TrainingOptions::default().with_epochs(1))
            .unwrap();
        teacher
    }

    fn distillation_config(alpha: f32, epochs: usize, batch_size: usize) -> DistillationConfig {
        DistillationConfig {
            alpha,
            temperature: 3.0,
            epochs,
            batch_size,
            ..Default::default()
        }
    }

    #[test]
    fn test_distilled_student_produces_distributions() {
        let data = clustered_split(&[400, 400, 200], 10, 1);
        let teacher = trained_teacher(10, 3);

        let distilled = KnowledgeDistillation::new(distillation_config(0.1, 2, 64))
            .compress(&teacher, &data)
            .unwrap();

        assert_eq!(distilled.history.len(), 2);
        assert!(distilled.compression_ratio() > 1.0);

        let xs = data.features_tensor(&Device::Cpu).unwrap();
        let probs = distilled.student.predict_proba(&xs).unwrap();
        assert_eq!(probs.dims(), &[1000, 3]);
        for row in probs.to_vec2::<f32>().unwrap() {
            assert_eq!(row.len(), 3);
            let total: f32 = row.iter().sum();
            assert!((total - 1.0).abs() <= 1e-6, "row sums to {}", total);
            assert!(row.iter().all(|p| (0.0..=1.0).contains(p)));
        }

        for stats in distilled.history.epochs() {
            assert!(stats.loss.is_finite());
            assert!(stats.distillation_loss.is_some());
            assert!(stats.val_loss.is_some());
        }
    }

    #[test]
    fn test_teacher_parameters_are_untouched() {
        let data = clustered_split(&[80, 80, 40], 10, 2);
        let teacher = trained_teacher(10, 3);
        let before = teacher.model().parameter_snapshot().unwrap();

        let student = ClassifierBuilder::new(10, 3).build().unwrap();
        let mut distiller =
            Distiller::new(teacher.model(), student, distillation_config(0.1, 2, 32)).unwrap();
        distiller.train(&data).unwrap();

        let after = teacher.model().parameter_snapshot().unwrap();
        assert_eq!(before.len(), after.len());
        for ((name_a, a), (name_b, b)) in before.iter().zip(after.iter()) {
            assert_eq!(name_a, name_b);
            let same_bits = a.iter().zip(b.iter()).all(|(x, y)| x.to_bits() == y.to_bits());
            assert!(same_bits, "teacher parameter {} changed", name_a);
        }
    }

    #[test]
    fn test_alpha_one_matches_supervised_training() {
        let data = clustered_split(&[60, 60, 30], 6, 3);
        let teacher = trained_teacher(6, 3);
        let architecture = Architecture::Custom {
            hidden: vec![16, 8],
            dropout: 0.0,
        };
        let settings = OptimizerSettings::default();

        let distilled_student = ClassifierBuilder::new(6, 3)
            .architecture(architecture)
            .optimizer_settings(settings.clone())
            .build()
            .unwrap();
        let twin = distilled_student.model().try_clone().unwrap();
        let mut supervised = ClassifierBuilder::rebuild(twin, &settings).unwrap();

        let config = DistillationConfig {
            validation_fraction: 0.1,
            seed: 7,
            shuffle: true,
            ..distillation_config(1.0, 2, 16)
        };
        let options = TrainingOptions {
            epochs: 2,
            batch_size: 16,
            validation_fraction: 0.1,
            shuffle: true,
            seed: 7,
            ..Default::default()
        };

        let mut distiller = Distiller::new(teacher.model(), distilled_student, config).unwrap();
        distiller.train(&data).unwrap();
        supervised.fit(&data, &options).unwrap();

        let distilled = distiller.student().parameter_snapshot().unwrap();
        let plain = supervised.model().parameter_snapshot().unwrap();
        for ((name, a), (_, b)) in distilled.iter().zip(plain.iter()) {
            for (x, y) in a.iter().zip(b.iter()) {
                assert!((x - y).abs() <= 1e-5, "{} diverged: {} vs {}", name, x, y);
            }
        }
    }

    #[test]
    fn test_mismatched_class_count_rejected() {
        let teacher = trained_teacher(10, 3);
        let student = ClassifierBuilder::new(10, 4).build().unwrap();
        let err = Distiller::new(teacher.model(), student, DistillationConfig::default())
            .err()
            .unwrap();
        assert!(matches!(err, LitheError::ShapeMismatch { expected: 3, actual: 4, .. }));
    }

    #[test]
    fn test_non_finite_batch_reports_both_models() {
        let teacher = trained_teacher(4, 3);
        let mut rows: Vec<Vec<f32>> = (0..32).map(|i| vec![i as f32 * 0.1; 4]).collect();
        rows[5][2] = f32::NAN;
        let labels = (0..32).map(|i| (i % 3) as u32).collect();
        let data = lithe_core::DatasetSplit::from_rows(&rows, labels).unwrap();

        let student = ClassifierBuilder::new(4, 3).build().unwrap();
        let config = DistillationConfig {
            shuffle: false,
            validation_fraction: 0.0,
            ..distillation_config(0.5, 1, 32)
        };
        let mut distiller = Distiller::new(teacher.model(), student, config).unwrap();

        match distiller.train(&data) {
            Err(LitheError::NumericInstability(diag)) => {
                assert_eq!(diag.phase, "distillation");
                assert_eq!(diag.epoch, 1);
                assert_eq!(diag.batch, 0);
                assert!(diag.teacher_logits.is_some());
                assert_eq!(diag.student_logits.len(), 32);
                assert!(diag.distillation_loss.is_some());
            }
            other => panic!("expected numeric instability, got {:?}", other.map(|h| h.len())),
        }
    }
}
