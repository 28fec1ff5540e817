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

//! Dataset splits and the shared label space

use crate::{LitheError, Result};
use candle_core::{Device, Tensor};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Bijection between class names and dense indices `0..K-1`
///
/// Names are kept sorted so the encoding is stable across runs, matching
/// the usual label-encoder convention.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelSpace {
    names: Vec<String>,
}

impl LabelSpace {
    /// Build from any collection of (possibly repeated) class names
    pub fn from_names<I, S>(names: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let unique: BTreeSet<String> = names
            .into_iter()
            .map(|n| n.as_ref().trim().to_string())
            .collect();

        if unique.is_empty() {
            return Err(LitheError::InvalidArgument(
                "label space needs at least one class".to_string(),
            ));
        }

        Ok(Self {
            names: unique.into_iter().collect(),
        })
    }

    pub fn encode(&self, name: &str) -> Option<u32> {
        self.names
            .binary_search_by(|candidate| candidate.as_str().cmp(name.trim()))
            .ok()
            .map(|i| i as u32)
    }

    pub fn encode_all<S: AsRef<str>>(&self, names: &[S]) -> Result<Vec<u32>> {
        names
            .iter()
            .map(|n| {
                self.encode(n.as_ref()).ok_or_else(|| {
                    LitheError::InvalidArgument(format!("unknown class '{}'", n.as_ref()))
                })
            })
            .collect()
    }

    pub fn decode(&self, index: u32) -> Option<&str> {
        self.names.get(index as usize).map(String::as_str)
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

/// Feature matrix paired with integer labels
///
/// Features are stored row-major; every row has `num_features` columns.
#[derive(Debug, Clone)]
pub struct DatasetSplit {
    features: Vec<f32>,
    labels: Vec<u32>,
    num_features: usize,
}

impl DatasetSplit {
    pub fn new(features: Vec<f32>, labels: Vec<u32>, num_features: usize) -> Result<Self> {
        if num_features == 0 {
            return Err(LitheError::InvalidArgument(
                "dataset needs at least one feature column".to_string(),
            ));
        }
        if features.len() % num_features != 0 {
            return Err(LitheError::InvalidArgument(format!(
                "feature buffer of {} values is not a multiple of {} columns",
                features.len(),
                num_features
            )));
        }
        let rows = features.len() / num_features;
        if rows != labels.len() {
            return Err(LitheError::shape_mismatch("label rows", rows, labels.len()));
        }

        Ok(Self {
            features,
            labels,
            num_features,
        })
    }

    /// Build from per-row vectors; every row must have the same width
    pub fn from_rows(rows: &[Vec<f32>], labels: Vec<u32>) -> Result<Self> {
        let num_features = rows.first().map(Vec::len).unwrap_or(0);
        let mut features = Vec::with_capacity(rows.len() * num_features);
        for row in rows {
            if row.len() != num_features {
                return Err(LitheError::shape_mismatch(
                    "row width",
                    num_features,
                    row.len(),
                ));
            }
            features.extend_from_slice(row);
        }
        Self::new(features, labels, num_features)
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn num_features(&self) -> usize {
        self.num_features
    }

    pub fn labels(&self) -> &[u32] {
        &self.labels
    }

    pub fn features(&self) -> &[f32] {
        &self.features
    }

    pub fn row(&self, index: usize) -> &[f32] {
        let start = index * self.num_features;
        &self.features[start..start + self.num_features]
    }

    /// Per-class sample counts for classes `0..num_classes`
    pub fn class_counts(&self, num_classes: usize) -> Vec<usize> {
        let mut counts = vec![0; num_classes];
        for &label in &self.labels {
            if let Some(slot) = counts.get_mut(label as usize) {
                *slot += 1;
            }
        }
        counts
    }

    /// Rows at `indices`, in that order
    pub fn subset(&self, indices: &[usize]) -> Self {
        let mut features = Vec::with_capacity(indices.len() * self.num_features);
        let mut labels = Vec::with_capacity(indices.len());
        for &i in indices {
            features.extend_from_slice(self.row(i));
            labels.push(self.labels[i]);
        }
        Self {
            features,
            labels,
            num_features: self.num_features,
        }
    }

    /// Same rows in a seeded random order
    pub fn shuffled(&self, rng: &mut StdRng) -> Self {
        let mut order: Vec<usize> = (0..self.len()).collect();
        order.shuffle(rng);
        self.subset(&order)
    }

    /// Hold out the trailing `fraction` of rows
    ///
    /// Returns `None` for the hold-out when the fraction rounds to zero rows
    /// or would leave no training rows.
    pub fn split_tail(&self, fraction: f32) -> (DatasetSplit, Option<DatasetSplit>) {
        let held_out = (self.len() as f32 * fraction.clamp(0.0, 1.0)).floor() as usize;
        if held_out == 0 || held_out >= self.len() {
            return (self.clone(), None);
        }

        let cut = self.len() - held_out;
        let head: Vec<usize> = (0..cut).collect();
        let tail: Vec<usize> = (cut..self.len()).collect();
        (self.subset(&head), Some(self.subset(&tail)))
    }

    /// Index plan for one epoch
    pub fn batch_indices(
        &self,
        batch_size: usize,
        shuffle: bool,
        rng: &mut StdRng,
    ) -> Vec<Vec<usize>> {
        let mut order: Vec<usize> = (0..self.len()).collect();
        if shuffle {
            order.shuffle(rng);
        }
        order
            .chunks(batch_size.max(1))
            .map(|chunk| chunk.to_vec())
            .collect()
    }

    /// `(features[b, f], labels[b])` tensors for the given rows
    pub fn batch(&self, indices: &[usize], device: &Device) -> Result<(Tensor, Tensor)> {
        let mut features = Vec::with_capacity(indices.len() * self.num_features);
        let mut labels = Vec::with_capacity(indices.len());
        for &i in indices {
            features.extend_from_slice(self.row(i));
            labels.push(self.labels[i]);
        }
        let xs = Tensor::from_vec(features, (indices.len(), self.num_features), device)?;
        let ys = Tensor::from_vec(labels, indices.len(), device)?;
        Ok((xs, ys))
    }

    pub fn features_tensor(&self, device: &Device) -> Result<Tensor> {
        Ok(Tensor::from_slice(
            &self.features,
            (self.len(), self.num_features),
            device,
        )?)
    }

    pub fn labels_tensor(&self, device: &Device) -> Result<Tensor> {
        Ok(Tensor::from_slice(&self.labels, self.len(), device)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn toy_split() -> DatasetSplit {
        let rows: Vec<Vec<f32>> = (0..10).map(|i| vec![i as f32, -(i as f32)]).collect();
        let labels = (0..10).map(|i| (i % 3) as u32).collect();
        DatasetSplit::from_rows(&rows, labels).unwrap()
    }

    #[test]
    fn test_label_space_is_sorted_and_bijective() {
        let space = LabelSpace::from_names(["PortScan", "BENIGN", "DDoS", "BENIGN"]).unwrap();
        assert_eq!(space.len(), 3);
        assert_eq!(space.names(), &["BENIGN", "DDoS", "PortScan"]);
        for (i, name) in space.names().iter().enumerate() {
            assert_eq!(space.encode(name), Some(i as u32));
            assert_eq!(space.decode(i as u32), Some(name.as_str()));
        }
        assert_eq!(space.encode("Heartbleed"), None);
        assert!(space.encode_all(&["DDoS", "Bot"]).is_err());
    }

    #[test]
    fn test_row_count_mismatch_rejected() {
        let err = DatasetSplit::new(vec![0.0; 6], vec![0, 1], 2).unwrap_err();
        assert!(matches!(err, LitheError::ShapeMismatch { .. }));
    }

    #[test]
    fn test_split_tail_keeps_order() {
        let split = toy_split();
        let (train, val) = split.split_tail(0.2);
        let val = val.unwrap();
        assert_eq!(train.len(), 8);
        assert_eq!(val.len(), 2);
        assert_eq!(val.row(0), &[8.0, -8.0]);
        assert_eq!(train.row(7), &[7.0, -7.0]);

        let (all, none) = split.split_tail(0.05);
        assert_eq!(all.len(), 10);
        assert!(none.is_none());
    }

    #[test]
    fn test_batch_indices_cover_every_row_once() {
        let split = toy_split();
        let mut rng = StdRng::seed_from_u64(7);
        let plan = split.batch_indices(4, true, &mut rng);
        assert_eq!(plan.len(), 3);
        let mut seen: Vec<usize> = plan.into_iter().flatten().collect();
        seen.sort_unstable();
        assert_eq!(seen, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn test_batch_tensor_shapes() {
        let split = toy_split();
        let (xs, ys) = split.batch(&[1, 4, 9], &Device::Cpu).unwrap();
        assert_eq!(xs.dims(), &[3, 2]);
        assert_eq!(ys.to_vec1::<u32>().unwrap(), vec![1, 1, 0]);
    }

    #[test]
    fn test_class_counts() {
        let split = toy_split();
        assert_eq!(split.class_counts(3), vec![4, 3, 3]);
    }
    #[test]
    fn test_shuffled_keeps_rows_paired_with_labels() {
        let split = toy_split();
        let shuffled = split.shuffled(&mut StdRng::seed_from_u64(3));
        assert_eq!(shuffled.len(), split.len());
        assert_eq!(shuffled.class_counts(3), split.class_counts(3));
        for i in 0..shuffled.len() {
            let original = shuffled.row(i)[0] as usize;
            assert_eq!(shuffled.labels()[i], (original % 3) as u32);
        }
    }
}
