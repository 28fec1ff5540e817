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

//! Discovery and loading of tabular flow-record files

use crate::config::DataConfig;
use crate::{LitheError, Result};
use log::{debug, info};
use std::path::{Path, PathBuf};

/// Concatenated rows from one or more files sharing a schema
#[derive(Debug, Clone, Default)]
pub struct RawTable {
    /// Normalized names of the numeric columns, label column excluded
    pub feature_names: Vec<String>,
    pub rows: Vec<Vec<f64>>,
    pub labels: Vec<String>,
}

impl RawTable {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    fn append(&mut self, other: RawTable) {
        self.rows.extend(other.rows);
        self.labels.extend(other.labels);
    }
}

/// Trim a header and collapse internal whitespace runs to one space
pub fn normalize_column_name(name: &str) -> String {
    name.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// List files in `dir` whose extension matches, sorted by path
pub fn discover_files(dir: &Path, extension: &str) -> Result<Vec<PathBuf>> {
    let entries = std::fs::read_dir(dir).map_err(|e| LitheError::Ingestion {
        path: dir.to_path_buf(),
        reason: e.to_string(),
    })?;

    let mut files = Vec::new();
    for entry in entries {
        let path = entry?.path();
        let matches = path.is_file()
            && path
                .extension()
                .and_then(|ext| ext.to_str())
                .map(|ext| ext.eq_ignore_ascii_case(extension))
                .unwrap_or(false);
        if matches {
            files.push(path);
        }
    }

    if files.is_empty() {
        return Err(LitheError::Ingestion {
            path: dir.to_path_buf(),
            reason: format!("no *.{} files found", extension),
        });
    }

    files.sort();
    Ok(files)
}

/// Read one file, splitting the reserved label column from the features
///
/// Cells that do not parse as numbers become NaN and are removed later by
/// cleaning.
pub fn read_table(path: &Path, label_column: &str) -> Result<RawTable> {
    let ingestion_error = |reason: String| LitheError::Ingestion {
        path: path.to_path_buf(),
        reason,
    };

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .from_path(path)
        .map_err(|e| ingestion_error(e.to_string()))?;

    let headers: Vec<String> = reader
        .headers()
        .map_err(|e| ingestion_error(e.to_string()))?
        .iter()
        .map(normalize_column_name)
        .collect();

    let wanted = normalize_column_name(label_column);
    let label_index = headers
        .iter()
        .position(|h| *h == wanted)
        .ok_or_else(|| ingestion_error(format!("label column '{}' not found", wanted)))?;

    let feature_names: Vec<String> = headers
        .iter()
        .enumerate()
        .filter(|(i, _)| *i != label_index)
        .map(|(_, h)| h.clone())
        .collect();

    let mut table = RawTable {
        feature_names,
        ..Default::default()
    };

    for record in reader.records() {
        let record = record.map_err(|e| ingestion_error(e.to_string()))?;
        let mut row = Vec::with_capacity(headers.len().saturating_sub(1));
        let mut label = String::new();
        for (i, cell) in record.iter().enumerate() {
            if i == label_index {
                label = cell.trim().to_string();
            } else {
                row.push(cell.trim().parse::<f64>().unwrap_or(f64::NAN));
            }
        }
        table.rows.push(row);
        table.labels.push(label);
    }

    debug!("Read {} rows from {}", table.len(), path.display());
    Ok(table)
}

/// Discover every matching file in `dir` and concatenate them
///
/// All files must have the same normalized feature columns as the first.
pub fn load_directory(dir: &Path, config: &DataConfig) -> Result<RawTable> {
    let files = discover_files(dir, &config.file_extension)?;
    info!("Ingesting {} file(s) from {}", files.len(), dir.display());

    let mut combined: Option<RawTable> = None;
    for path in &files {
        let table = read_table(path, &config.label_column)?;
        match combined.as_mut() {
            None => combined = Some(table),
            Some(acc) => {
                if acc.feature_names != table.feature_names {
                    return Err(LitheError::Ingestion {
                        path: path.clone(),
                        reason: "column schema differs from the first file".to_string(),
                    });
                }
                acc.append(table);
            }
        }
    }

    let table = combined.unwrap_or_default();
    info!(
        "Loaded {} rows with {} feature columns",
        table.len(),
        table.feature_names.len()
    );
    Ok(table)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_normalize_column_name() {
        assert_eq!(normalize_column_name("  Flow   Duration "), "Flow Duration");
        assert_eq!(normalize_column_name(" Label"), "Label");
    }

    #[test]
    fn test_read_table_parses_and_marks_invalid() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("monday.csv");
        fs::write(
            &path,
            " Flow Duration, Total  Fwd Packets, Label\n10,2,BENIGN\nInfinity,3,DDoS\nabc,4,DDoS\n",
        )
        .unwrap();

        let table = read_table(&path, "Label").unwrap();
        assert_eq!(table.feature_names, vec!["Flow Duration", "Total Fwd Packets"]);
        assert_eq!(table.labels, vec!["BENIGN", "DDoS", "DDoS"]);
        assert_eq!(table.rows[0], vec![10.0, 2.0]);
        assert!(table.rows[1][0].is_infinite());
        assert!(table.rows[2][0].is_nan());
    }

    #[test]
    fn test_missing_label_column() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.csv");
        fs::write(&path, "x,y\n1,2\n").unwrap();
        let err = read_table(&path, "Label").unwrap_err();
        assert!(matches!(err, LitheError::Ingestion { .. }));
    }

    #[test]
    fn test_load_directory_concatenates_sorted_files() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("b.csv"), "x, Label\n2,B\n").unwrap();
        fs::write(dir.path().join("a.csv"), "x,Label\n1,A\n").unwrap();
        fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let table = load_directory(dir.path(), &DataConfig::default()).unwrap();
        assert_eq!(table.labels, vec!["A", "B"]);
        assert_eq!(table.rows, vec![vec![1.0], vec![2.0]]);
    }

    #[test]
    fn test_schema_mismatch_rejected() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a.csv"), "x,Label\n1,A\n").unwrap();
        fs::write(dir.path().join("b.csv"), "y,Label\n2,B\n").unwrap();
        assert!(load_directory(dir.path(), &DataConfig::default()).is_err());
    }
}
