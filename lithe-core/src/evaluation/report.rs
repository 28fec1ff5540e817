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

//! Report types and their textual rendering

use crate::data::LabelSpace;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Precision, recall and F1 for one class
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassMetrics {
    pub name: String,
    pub precision: f32,
    pub recall: f32,
    pub f1: f32,
    pub support: usize,
}

/// Test-set metrics for one model variant
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelReport {
    pub name: String,
    pub accuracy: f32,
    pub loss: f32,
    pub per_class: Vec<ClassMetrics>,
    pub macro_avg: ClassMetrics,
    pub weighted_avg: ClassMetrics,
    /// Serialized size, when the variant has an artifact
    pub size_bytes: Option<usize>,
    /// `confusion[truth][predicted]`
    pub confusion: Vec<Vec<usize>>,
}

fn ratio(num: usize, den: usize) -> f32 {
    if den == 0 {
        0.0
    } else {
        num as f32 / den as f32
    }
}

fn f1(precision: f32, recall: f32) -> f32 {
    if precision + recall == 0.0 {
        0.0
    } else {
        2.0 * precision * recall / (precision + recall)
    }
}

impl ModelReport {
    pub(crate) fn from_confusion(
        name: &str,
        labels: &LabelSpace,
        confusion: Vec<Vec<usize>>,
        loss: f32,
        size_bytes: Option<usize>,
    ) -> Self {
        let k = confusion.len();
        let total: usize = confusion.iter().flatten().sum();
        let correct: usize = (0..k).map(|i| confusion[i][i]).sum();

        let per_class: Vec<ClassMetrics> = (0..k)
            .map(|c| {
                let tp = confusion[c][c];
                let support: usize = confusion[c].iter().sum();
                let predicted: usize = confusion.iter().map(|row| row[c]).sum();
                let precision = ratio(tp, predicted);
                let recall = ratio(tp, support);
                ClassMetrics {
                    name: labels.decode(c as u32).unwrap_or("?").to_string(),
                    precision,
                    recall,
                    f1: f1(precision, recall),
                    support,
                }
            })
            .collect();

        let average = |name: &str, weight: &dyn Fn(&ClassMetrics) -> f32| {
            let norm: f32 = per_class.iter().map(weight).sum();
            let mean = |field: fn(&ClassMetrics) -> f32| {
                if norm == 0.0 {
                    0.0
                } else {
                    per_class.iter().map(|m| field(m) * weight(m)).sum::<f32>() / norm
                }
            };
            ClassMetrics {
                name: name.to_string(),
                precision: mean(|m| m.precision),
                recall: mean(|m| m.recall),
                f1: mean(|m| m.f1),
                support: total,
            }
        };
        let macro_avg = average("macro avg", &|_| 1.0);
        let weighted_avg = average("weighted avg", &|m| m.support as f32);

        Self {
            name: name.to_string(),
            accuracy: ratio(correct, total),
            loss,
            per_class,
            macro_avg,
            weighted_avg,
            size_bytes,
            confusion,
        }
    }

    pub fn size_mb(&self) -> Option<f64> {
        self.size_bytes.map(|b| b as f64 / (1024.0 * 1024.0))
    }
}

impl fmt::Display for ModelReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== {} ===", self.name)?;
        writeln!(f, "Test accuracy: {:.4}", self.accuracy)?;
        writeln!(f, "Test loss:     {:.4}", self.loss)?;
        match self.size_mb() {
            Some(mb) => writeln!(f, "Size:          {:.4} MB", mb)?,
            None => writeln!(f, "Size:          n/a")?,
        }

        let width = self
            .per_class
            .iter()
            .map(|m| m.name.len())
            .max()
            .unwrap_or(0)
            .max(12);
        writeln!(
            f,
            "{:>width$}  {:>9}  {:>9}  {:>9}  {:>9}",
            "",
            "precision",
            "recall",
            "f1-score",
            "support",
            width = width
        )?;
        let row = |f: &mut fmt::Formatter<'_>, m: &ClassMetrics| {
            writeln!(
                f,
                "{:>width$}  {:>9.4}  {:>9.4}  {:>9.4}  {:>9}",
                m.name,
                m.precision,
                m.recall,
                m.f1,
                m.support,
                width = width
            )
        };
        for m in &self.per_class {
            row(f, m)?;
        }
        writeln!(f)?;
        row(f, &self.macro_avg)?;
        row(f, &self.weighted_avg)
    }
}

/// Side-by-side view of several variants evaluated on the same split
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ComparisonReport {
    pub reports: Vec<ModelReport>,
}

impl ComparisonReport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, report: ModelReport) {
        self.reports.push(report);
    }

    pub fn get(&self, name: &str) -> Option<&ModelReport> {
        self.reports.iter().find(|r| r.name == name)
    }
}

impl fmt::Display for ComparisonReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for report in &self.reports {
            writeln!(f, "{}", report)?;
        }

        writeln!(f, "=== Summary ===")?;
        writeln!(
            f,
            "{:<16}  {:>9}  {:>9}  {:>9}  {:>11}",
            "model", "accuracy", "loss", "macro f1", "size (MB)"
        )?;
        for r in &self.reports {
            let size = r
                .size_mb()
                .map(|mb| format!("{:.4}", mb))
                .unwrap_or_else(|| "n/a".to_string());
            writeln!(
                f,
                "{:<16}  {:>9.4}  {:>9.4}  {:>9.4}  {:>11}",
                r.name, r.accuracy, r.loss, r.macro_avg.f1, size
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn report() -> ModelReport {
        let labels = LabelSpace::from_names(["BENIGN", "Bot", "DDoS"]).unwrap();
        let confusion = vec![vec![5, 0, 0], vec![1, 2, 1], vec![0, 0, 0]];
        ModelReport::from_confusion("baseline", &labels, confusion, 0.42, Some(3 * 1024 * 1024))
    }

    #[test]
    fn test_metrics_from_confusion() {
        let r = report();
        assert_relative_eq!(r.accuracy, 7.0 / 9.0);
        assert_relative_eq!(r.per_class[0].precision, 5.0 / 6.0);
        assert_relative_eq!(r.per_class[1].recall, 0.5);
        // a class with no support and no predictions scores zero, not NaN
        assert_eq!(r.per_class[2].precision, 0.0);
        assert_eq!(r.per_class[2].f1, 0.0);
        assert_eq!(r.macro_avg.support, 9);
        assert!(r.weighted_avg.recall > r.macro_avg.recall);
        assert_relative_eq!(r.size_mb().unwrap(), 3.0);
    }

    #[test]
    fn test_comparison_renders_every_variant() {
        let mut comparison = ComparisonReport::new();
        comparison.push(report());
        let mut qat = report();
        qat.name = "qat".to_string();
        qat.size_bytes = None;
        comparison.push(qat);

        let text = comparison.to_string();
        assert!(text.contains("=== baseline ==="));
        assert!(text.contains("=== qat ==="));
        assert!(text.contains("precision"));
        assert!(text.contains("DDoS"));
        assert!(text.contains("n/a"));
        assert!(comparison.get("qat").is_some());
    }
}
