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

//! `lithe` command-line entry point

use clap::{Parser, Subcommand};
use lithe_core::{Config, LitheError, Pipeline};
use log::error;
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser)]
#[command(name = "lithe", version, about = "Distil and quantize intrusion-detection classifiers")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Train baseline and teacher, distil a student, quantize the baseline and report
    Run {
        /// Directory of flow-record files sharing one schema
        #[arg(long)]
        data_dir: PathBuf,
        /// TOML configuration file
        #[arg(long)]
        config: Option<PathBuf>,
        /// Preset used when no configuration file is given
        #[arg(long, default_value = "default")]
        preset: String,
        /// Overrides the configured output directory
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Write a configuration file for a preset
    InitConfig {
        path: PathBuf,
        #[arg(long, default_value = "default")]
        preset: String,
    },
}

fn run(cli: Cli) -> lithe_core::Result<bool> {
    match cli.command {
        Command::Run {
            data_dir,
            config,
            preset,
            output,
        } => {
            let mut config = match config {
                Some(path) => Config::load(path)?,
                None => Config::preset(&preset)?,
            };
            if let Some(dir) = output {
                config.output.directory = dir;
            }

            let outcome = Pipeline::new(config).run_directory(&data_dir)?;
            println!("{}", outcome.report);
            println!("{}", outcome.summary());
            for failure in &outcome.write_failures {
                eprintln!("warning: {}", failure);
            }
            Ok(outcome.is_complete())
        }
        Command::InitConfig { path, preset } => {
            let config = Config::preset(&preset)?;
            if path.exists() {
                return Err(LitheError::InvalidArgument(format!(
                    "{} already exists",
                    path.display()
                )));
            }
            config.save(&path)?;
            println!("Wrote {} configuration to {}", preset, path.display());
            Ok(true)
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    if let Err(e) = lithe_core::init() {
        eprintln!("failed to initialize: {}", e);
    }

    match run(cli) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(2),
        Err(e) => {
            error!("{}", e);
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}
