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

//! Synthetic flow-like data shared by the integration tests

#![allow(dead_code)]

use lithe_core::DatasetSplit;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use std::fs;
use std::path::Path;

/// One noisy cluster per class; class `c` is shifted along every feature `f`
/// with `f % num_classes == c`
pub fn clustered_rows(counts: &[usize], num_features: usize, seed: u64) -> (Vec<Vec<f32>>, Vec<u32>) {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut samples = Vec::new();
    for (class, &n) in counts.iter().enumerate() {
        for _ in 0..n {
            let row: Vec<f32> = (0..num_features)
                .map(|f| {
                    let centre = if f % counts.len() == class { 2.0 } else { 0.0 };
                    centre + rng.gen_range(-1.0f32..1.0)
                })
                .collect();
            samples.push((row, class as u32));
        }
    }
    samples.shuffle(&mut rng);
    samples.into_iter().unzip()
}

pub fn clustered_split(counts: &[usize], num_features: usize, seed: u64) -> DatasetSplit {
    let (rows, labels) = clustered_rows(counts, num_features, seed);
    DatasetSplit::from_rows(&rows, labels).unwrap()
}

/// Write a CSV export with padded headers and a trailing `Label` column
pub fn write_flow_csv(path: &Path, class_names: &[&str], counts: &[usize], num_features: usize, seed: u64) {
    let (rows, labels) = clustered_rows(counts, num_features, seed);
    let mut text = String::new();
    let headers: Vec<String> = (0..num_features).map(|f| format!(" Feature  {}", f)).collect();
    text.push_str(&headers.join(","));
    text.push_str(", Label\n");
    for (row, label) in rows.iter().zip(labels) {
        let cells: Vec<String> = row.iter().map(|v| v.to_string()).collect();
        text.push_str(&cells.join(","));
        text.push(',');
        text.push_str(class_names[label as usize]);
        text.push('\n');
    }
    fs::write(path, text).unwrap();
}
