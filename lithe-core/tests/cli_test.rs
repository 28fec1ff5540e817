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

//! CLI integration tests

use std::fs;
use std::process::Command;
use tempfile::TempDir;

use lithe_core::{Config, Result};

fn lithe() -> Command {
    Command::new(env!("CARGO_BIN_EXE_lithe"))
}

#[test]
fn test_init_config_writes_loadable_preset() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let path = temp_dir.path().join("lithe.toml");

    let status = lithe()
        .args(["init-config", "--preset", "smoke"])
        .arg(&path)
        .status()?;
    assert!(status.success());

    let config = Config::load(&path)?;
    assert_eq!(config.training.epochs, 1);
    assert_eq!(config.quantization.bits, 8);
    Ok(())
}

#[test]
fn test_init_config_refuses_to_overwrite() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let path = temp_dir.path().join("existing.toml");
    fs::write(&path, "keep me")?;

    let output = lithe().arg("init-config").arg(&path).output()?;
    assert!(!output.status.success());
    assert_eq!(fs::read_to_string(&path)?, "keep me");
    Ok(())
}

#[test]
fn test_run_on_empty_directory_fails() -> Result<()> {
    let data_dir = TempDir::new()?;
    let out_dir = TempDir::new()?;

    let output = lithe()
        .args(["run", "--preset", "smoke", "--data-dir"])
        .arg(data_dir.path())
        .arg("--output")
        .arg(out_dir.path())
        .output()?;

    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Ingestion failed"), "stderr was: {}", stderr);
    Ok(())
}

#[test]
fn test_unknown_preset_rejected() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let output = lithe()
        .args(["init-config", "--preset", "gigantic"])
        .arg(temp_dir.path().join("x.toml"))
        .output()?;
    assert!(!output.status.success());
    assert!(!temp_dir.path().join("x.toml").exists());
    Ok(())
}
