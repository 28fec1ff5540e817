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

//! Cleaning, encoding, partitioning, scaling and oversampling

use super::dataset::{DatasetSplit, LabelSpace};
use super::ingest::RawTable;
use crate::config::DataConfig;
use crate::{LitheError, Result};
use log::info;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Train/test splits ready for model construction
#[derive(Debug, Clone)]
pub struct PreparedData {
    pub train: DatasetSplit,
    pub test: DatasetSplit,
    pub labels: LabelSpace,
    pub scaler: StandardScaler,
    pub feature_names: Vec<String>,
}

/// Drop rows holding NaN or infinite values; returns the number removed
pub fn drop_invalid_rows(table: &mut RawTable) -> usize {
    let before = table.rows.len();
    let (rows, labels): (Vec<_>, Vec<_>) = std::mem::take(&mut table.rows)
        .into_iter()
        .zip(std::mem::take(&mut table.labels))
        .filter(|(row, _)| row.iter().all(|v| v.is_finite()))
        .unzip();
    table.rows = rows;
    table.labels = labels;
    before - table.rows.len()
}

/// Zero-mean, unit-variance scaling fit on training rows only
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StandardScaler {
    pub mean: Vec<f64>,
    pub scale: Vec<f64>,
}

impl StandardScaler {
    pub fn fit(rows: &[&[f64]]) -> Result<Self> {
        let width = rows
            .first()
            .map(|r| r.len())
            .ok_or_else(|| LitheError::InvalidArgument("cannot fit scaler on zero rows".into()))?;
        let n = rows.len() as f64;

        let mut mean = vec![0.0; width];
        for row in rows {
            for (m, v) in mean.iter_mut().zip(row.iter()) {
                *m += v / n;
            }
        }

        let mut var = vec![0.0; width];
        for row in rows {
            for ((acc, v), m) in var.iter_mut().zip(row.iter()).zip(mean.iter()) {
                *acc += (v - m) * (v - m) / n;
            }
        }

        // Constant columns keep unit scale
        let scale = var
            .into_iter()
            .map(|v| if v > 0.0 { v.sqrt() } else { 1.0 })
            .collect();

        Ok(Self { mean, scale })
    }

    pub fn transform_row(&self, row: &[f64]) -> Vec<f32> {
        row.iter()
            .zip(self.mean.iter().zip(self.scale.iter()))
            .map(|(v, (m, s))| ((v - m) / s) as f32)
            .collect()
    }
}

/// Per-class shuffled split; returns `(train, test)` row indices
pub fn stratified_split(labels: &[u32], test_fraction: f32, seed: u64) -> (Vec<usize>, Vec<usize>) {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut by_class: HashMap<u32, Vec<usize>> = HashMap::new();
    for (i, &label) in labels.iter().enumerate() {
        by_class.entry(label).or_default().push(i);
    }

    let mut classes: Vec<u32> = by_class.keys().copied().collect();
    classes.sort_unstable();

    let mut train = Vec::new();
    let mut test = Vec::new();
    for class in classes {
        let mut members = by_class.remove(&class).unwrap_or_default();
        members.shuffle(&mut rng);
        let n_test = (members.len() as f32 * test_fraction).round() as usize;
        let n_test = n_test.min(members.len().saturating_sub(1));
        test.extend_from_slice(&members[..n_test]);
        train.extend_from_slice(&members[n_test..]);
    }

    train.shuffle(&mut rng);
    test.shuffle(&mut rng);
    (train, test)
}

/// Synthetic Minority Over-sampling Technique
///
/// Every class below the majority count is topped up with points placed on
/// the segment between a random member and one of its `k` nearest same-class
/// neighbours.
#[derive(Debug, Clone)]
pub struct Smote {
    pub k_neighbors: usize,
    pub seed: u64,
}

impl Smote {
    pub fn new(k_neighbors: usize, seed: u64) -> Self {
        Self { k_neighbors, seed }
    }

    pub fn resample(&self, split: &DatasetSplit, num_classes: usize) -> Result<DatasetSplit> {
        let counts = split.class_counts(num_classes);
        let target = counts.iter().copied().max().unwrap_or(0);
        let mut rng = StdRng::seed_from_u64(self.seed);

        let mut features = split.features().to_vec();
        let mut labels = split.labels().to_vec();

        for (class, &count) in counts.iter().enumerate() {
            if count == 0 || count >= target {
                continue;
            }
            let members: Vec<usize> = split
                .labels()
                .iter()
                .enumerate()
                .filter(|(_, &l)| l as usize == class)
                .map(|(i, _)| i)
                .collect();

            let mut neighbours: HashMap<usize, Vec<usize>> = HashMap::new();
            for _ in 0..(target - count) {
                let anchor = members[rng.gen_range(0..members.len())];
                let candidates = neighbours
                    .entry(anchor)
                    .or_insert_with(|| self.nearest(split, anchor, &members));

                let row = split.row(anchor);
                if candidates.is_empty() {
                    features.extend_from_slice(row);
                } else {
                    let other = split.row(candidates[rng.gen_range(0..candidates.len())]);
                    let gap: f32 = rng.gen();
                    features.extend(row.iter().zip(other).map(|(a, b)| a + gap * (b - a)));
                }
                labels.push(class as u32);
            }
        }

        DatasetSplit::new(features, labels, split.num_features())
    }

    fn nearest(&self, split: &DatasetSplit, anchor: usize, members: &[usize]) -> Vec<usize> {
        let origin = split.row(anchor);
        let mut distances: Vec<(f32, usize)> = members
            .iter()
            .filter(|&&m| m != anchor)
            .map(|&m| {
                let d = split
                    .row(m)
                    .iter()
                    .zip(origin)
                    .map(|(a, b)| (a - b) * (a - b))
                    .sum::<f32>();
                (d, m)
            })
            .collect();
        distances.sort_by(|a, b| a.0.total_cmp(&b.0));
        distances
            .into_iter()
            .take(self.k_neighbors)
            .map(|(_, m)| m)
            .collect()
    }
}

/// Clean, encode, split, scale and (optionally) oversample a raw table
pub fn prepare(mut table: RawTable, config: &DataConfig) -> Result<PreparedData> {
    let dropped = drop_invalid_rows(&mut table);
    if dropped > 0 {
        info!("Dropped {} rows with NaN or infinite values", dropped);
    }
    if table.is_empty() {
        return Err(LitheError::InvalidArgument(
            "no valid rows remain after cleaning".to_string(),
        ));
    }

    let labels = LabelSpace::from_names(&table.labels)?;
    let encoded = labels.encode_all(&table.labels)?;
    let (train_idx, test_idx) = stratified_split(&encoded, config.test_fraction, config.seed);

    let train_rows: Vec<&[f64]> = train_idx.iter().map(|&i| table.rows[i].as_slice()).collect();
    let scaler = StandardScaler::fit(&train_rows)?;

    let build = |indices: &[usize]| -> Result<DatasetSplit> {
        let rows: Vec<Vec<f32>> = indices
            .iter()
            .map(|&i| scaler.transform_row(&table.rows[i]))
            .collect();
        let ys = indices.iter().map(|&i| encoded[i]).collect();
        if rows.is_empty() {
            DatasetSplit::new(Vec::new(), ys, table.feature_names.len())
        } else {
            DatasetSplit::from_rows(&rows, ys)
        }
    };

    let mut train = build(&train_idx)?;
    let test = build(&test_idx)?;

    if config.oversample {
        let before = train.len();
        train = Smote::new(config.smote_neighbors, config.seed).resample(&train, labels.len())?;
        // synthetic rows are appended; mix them in before any tail hold-out
        train = train.shuffled(&mut StdRng::seed_from_u64(config.seed.wrapping_add(1)));
        info!("SMOTE oversampling: {} -> {} training rows", before, train.len());
    }

    info!(
        "Prepared {} training / {} test rows across {} classes",
        train.len(),
        test.len(),
        labels.len()
    );

    Ok(PreparedData {
        train,
        test,
        labels,
        scaler,
        feature_names: table.feature_names,
    })
}
