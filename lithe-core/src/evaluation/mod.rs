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

//! Accuracy, loss and per-class metrics for trained and compressed models

mod report;

pub use report::{ClassMetrics, ComparisonReport, ModelReport};

use crate::artifact::QuantizedClassifier;
use crate::data::{DatasetSplit, LabelSpace};
use crate::model::{Classifier, ForwardMode, TrainingBundle};
use crate::{LitheError, Result};
use candle_core::{Device, Tensor, D};
use log::info;
use rand::rngs::StdRng;
use rand::SeedableRng;

/// Anything that maps a feature batch to class logits without side effects
pub trait Predictor {
    /// Raw logits `[batch, num_classes]` in inference mode
    fn logits(&self, xs: &Tensor) -> Result<Tensor>;

    fn device(&self) -> &Device;

    fn num_classes(&self) -> usize;
}

impl Predictor for Classifier {
    fn logits(&self, xs: &Tensor) -> Result<Tensor> {
        self.forward(xs, ForwardMode::Inference)
    }

    fn device(&self) -> &Device {
        Classifier::device(self)
    }

    fn num_classes(&self) -> usize {
        self.spec().num_classes
    }
}

impl Predictor for QuantizedClassifier {
    fn logits(&self, xs: &Tensor) -> Result<Tensor> {
        self.forward(xs)
    }

    fn device(&self) -> &Device {
        QuantizedClassifier::device(self)
    }

    fn num_classes(&self) -> usize {
        self.spec().num_classes
    }
}

const EVAL_BATCH_SIZE: usize = 256;

/// Evaluation context carrying the label space explicitly
pub struct Evaluator<'a> {
    labels: &'a LabelSpace,
}

impl<'a> Evaluator<'a> {
    pub fn new(labels: &'a LabelSpace) -> Self {
        Self { labels }
    }

    /// Score `model` on `test`; `size_bytes` is the artifact size when one exists
    pub fn evaluate<P: Predictor + ?Sized>(
        &self,
        name: &str,
        model: &P,
        test: &DatasetSplit,
        size_bytes: Option<usize>,
    ) -> Result<ModelReport> {
        let k = self.labels.len();
        if model.num_classes() != k {
            return Err(LitheError::shape_mismatch(
                format!("{} output width", name),
                k,
                model.num_classes(),
            ));
        }
        if test.is_empty() {
            return Err(LitheError::InvalidArgument(
                "cannot evaluate on an empty test split".to_string(),
            ));
        }

        let mut confusion = vec![vec![0usize; k]; k];
        let mut loss_sum = 0.0f64;
        let mut rng = StdRng::seed_from_u64(0);
        for indices in test.batch_indices(EVAL_BATCH_SIZE, false, &mut rng) {
            let (xs, ys) = test.batch(&indices, model.device())?;
            let logits = model.logits(&xs)?;
            let loss = TrainingBundle::loss(&logits, &ys)?.to_scalar::<f32>()?;
            loss_sum += loss as f64 * indices.len() as f64;

            let predicted = logits.argmax(D::Minus1)?.to_vec1::<u32>()?;
            for (&truth, &guess) in ys.to_vec1::<u32>()?.iter().zip(predicted.iter()) {
                if let Some(row) = confusion.get_mut(truth as usize) {
                    if let Some(cell) = row.get_mut(guess as usize) {
                        *cell += 1;
                    }
                }
            }
        }

        let report = ModelReport::from_confusion(
            name,
            self.labels,
            confusion,
            (loss_sum / test.len() as f64) as f32,
            size_bytes,
        );
        info!(
            "{}: accuracy {:.4}, loss {:.4}",
            report.name, report.accuracy, report.loss
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    /// Always predicts the first feature's sign: class 1 if positive
    struct SignPredictor {
        device: Device,
    }

    impl Predictor for SignPredictor {
        fn logits(&self, xs: &Tensor) -> Result<Tensor> {
            let first = xs.narrow(1, 0, 1)?;
            let zeros = first.zeros_like()?;
            Ok(Tensor::cat(&[&zeros, &first], 1)?)
        }

        fn device(&self) -> &Device {
            &self.device
        }

        fn num_classes(&self) -> usize {
            2
        }
    }

    fn labels() -> LabelSpace {
        LabelSpace::from_names(["BENIGN", "DDoS"]).unwrap()
    }

    #[test]
    fn test_evaluate_counts_and_metrics() {
        let rows = vec![vec![1.0], vec![2.0], vec![-1.0], vec![-3.0], vec![0.5]];
        let truth = vec![1, 1, 0, 1, 0];
        let test = DatasetSplit::from_rows(&rows, truth).unwrap();

        let space = labels();
        let report = Evaluator::new(&space)
            .evaluate("sign", &SignPredictor { device: Device::Cpu }, &test, Some(2048))
            .unwrap();

        // predictions: 1, 1, 0, 0, 1
        assert_eq!(report.confusion, vec![vec![1, 1], vec![1, 2]]);
        assert_relative_eq!(report.accuracy, 0.6);
        assert_eq!(report.per_class[1].support, 3);
        assert_relative_eq!(report.per_class[1].precision, 2.0 / 3.0, epsilon = 1e-6);
        assert_relative_eq!(report.per_class[1].recall, 2.0 / 3.0, epsilon = 1e-6);
        assert_relative_eq!(report.per_class[0].recall, 0.5, epsilon = 1e-6);
        assert_eq!(report.size_bytes, Some(2048));
        assert!(report.loss > 0.0);
    }

    #[test]
    fn test_label_space_width_must_match() {
        let space = LabelSpace::from_names(["a", "b", "c"]).unwrap();
        let test = DatasetSplit::from_rows(&[vec![1.0]], vec![0]).unwrap();
        assert!(matches!(
            Evaluator::new(&space).evaluate(
                "sign",
                &SignPredictor { device: Device::Cpu },
                &test,
                None
            ),
            Err(LitheError::ShapeMismatch { .. })
        ));
    }
}
