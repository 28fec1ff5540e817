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

//! Safetensors encoding shared by float checkpoints and quantized artifacts

use crate::{LitheError, Result};
use safetensors::tensor::{Dtype, SafeTensors, TensorView};
use std::collections::HashMap;
use std::path::Path;

/// One named tensor ready for encoding, data already in little-endian bytes
#[derive(Debug, Clone)]
pub struct TensorEntry {
    pub name: String,
    pub dtype: Dtype,
    pub shape: Vec<usize>,
    pub data: Vec<u8>,
}

impl TensorEntry {
    pub fn f32(name: impl Into<String>, shape: Vec<usize>, values: &[f32]) -> Self {
        Self {
            name: name.into(),
            dtype: Dtype::F32,
            shape,
            data: values.iter().flat_map(|v| v.to_le_bytes()).collect(),
        }
    }

    pub fn u8(name: impl Into<String>, codes: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            dtype: Dtype::U8,
            shape: vec![codes.len()],
            data: codes,
        }
    }
}

/// Serialize `entries` with string `metadata` into one byte stream
pub fn encode(entries: Vec<TensorEntry>, metadata: HashMap<String, String>) -> Result<Vec<u8>> {
    let mut views = Vec::with_capacity(entries.len());
    for entry in &entries {
        let view = TensorView::new(entry.dtype, entry.shape.clone(), &entry.data)?;
        views.push((entry.name.as_str(), view));
    }
    Ok(safetensors::serialize(views, &Some(metadata))?)
}

/// Write bytes to `path`, mapping any IO failure to a serialization error
pub fn write_bytes(path: &Path, bytes: &[u8]) -> Result<()> {
    std::fs::write(path, bytes).map_err(|e| LitheError::serialization(path, e))
}

/// Parsed view over an encoded byte stream
pub struct Archive<'a> {
    tensors: SafeTensors<'a>,
    metadata: HashMap<String, String>,
}

impl<'a> Archive<'a> {
    pub fn parse(bytes: &'a [u8]) -> Result<Self> {
        let (_, header) = SafeTensors::read_metadata(bytes)?;
        let metadata = header.metadata().clone().unwrap_or_default();
        let tensors = SafeTensors::deserialize(bytes)?;
        Ok(Self { tensors, metadata })
    }

    pub fn metadata_value(&self, key: &str) -> Result<&str> {
        self.metadata
            .get(key)
            .map(String::as_str)
            .ok_or_else(|| LitheError::ArtifactFormat(format!("missing metadata key '{}'", key)))
    }

    /// Parse a metadata value with `FromStr`
    pub fn metadata_parsed<T: std::str::FromStr>(&self, key: &str) -> Result<T> {
        let raw = self.metadata_value(key)?;
        raw.parse().map_err(|_| {
            LitheError::ArtifactFormat(format!("metadata key '{}' has invalid value '{}'", key, raw))
        })
    }

    pub fn expect_format(&self, tag: &str) -> Result<()> {
        let found = self.metadata_value("format")?;
        if found != tag {
            return Err(LitheError::ArtifactFormat(format!(
                "expected format '{}', found '{}'",
                tag, found
            )));
        }
        Ok(())
    }

    fn view(&self, name: &str, dtype: Dtype) -> Result<TensorView<'a>> {
        let view = self
            .tensors
            .tensor(name)
            .map_err(|_| LitheError::ArtifactFormat(format!("missing tensor '{}'", name)))?;
        if view.dtype() != dtype {
            return Err(LitheError::ArtifactFormat(format!(
                "tensor '{}' has dtype {:?}, expected {:?}",
                name,
                view.dtype(),
                dtype
            )));
        }
        Ok(view)
    }

    pub fn f32_values(&self, name: &str) -> Result<Vec<f32>> {
        let view = self.view(name, Dtype::F32)?;
        Ok(view
            .data()
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect())
    }

    pub fn u8_values(&self, name: &str) -> Result<Vec<u8>> {
        Ok(self.view(name, Dtype::U8)?.data().to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_and_read_back() {
        let mut metadata = HashMap::new();
        metadata.insert("format".to_string(), "unit".to_string());
        metadata.insert("bits".to_string(), "4".to_string());
        let bytes = encode(
            vec![
                TensorEntry::f32("w", vec![2, 2], &[1.0, -2.5, 0.0, 3.25]),
                TensorEntry::u8("codes", vec![0, 7, 255]),
            ],
            metadata,
        )
        .unwrap();

        let archive = Archive::parse(&bytes).unwrap();
        archive.expect_format("unit").unwrap();
        assert!(archive.expect_format("other").is_err());
        assert_eq!(archive.metadata_parsed::<u8>("bits").unwrap(), 4);
        assert_eq!(archive.f32_values("w").unwrap(), vec![1.0, -2.5, 0.0, 3.25]);
        assert_eq!(archive.u8_values("codes").unwrap(), vec![0, 7, 255]);
    }

    #[test]
    fn test_missing_pieces_are_format_errors() {
        let bytes = encode(vec![TensorEntry::u8("codes", vec![1])], HashMap::new()).unwrap();
        let archive = Archive::parse(&bytes).unwrap();
        assert!(matches!(
            archive.metadata_value("format"),
            Err(LitheError::ArtifactFormat(_))
        ));
        assert!(matches!(
            archive.f32_values("codes"),
            Err(LitheError::ArtifactFormat(_))
        ));
        assert!(matches!(
            archive.u8_values("absent"),
            Err(LitheError::ArtifactFormat(_))
        ));
    }

    #[test]
    fn test_garbage_rejected() {
        assert!(Archive::parse(&[1, 2, 3]).is_err());
    }
}
