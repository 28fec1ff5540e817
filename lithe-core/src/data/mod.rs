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

//! Flow-record data: label space, dataset splits, ingestion and preprocessing
//!
//! The compression pipeline consumes ready-made `(features, labels)` splits.
//! This module produces them from a directory of tabular flow exports:
//!
//! - Discovery and concatenation of files sharing one schema
//! - Removal of rows with NaN or infinite values
//! - Label encoding, stratified train/test partitioning, standard scaling
//! - SMOTE oversampling of minority classes on the training split

pub mod dataset;
pub mod ingest;
pub mod preprocess;

pub use dataset::{DatasetSplit, LabelSpace};
pub use ingest::{discover_files, load_directory, RawTable};
pub use preprocess::{prepare, PreparedData, Smote, StandardScaler};
