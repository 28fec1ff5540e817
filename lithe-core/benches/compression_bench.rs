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

//! Performance benchmarks for the compression hot paths

use candle_core::{Device, Tensor};
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use lithe_core::{
    artifact::CompressedArtifact,
    optimization::{distillation_loss, fake_quantize, QuantizationConfig, Quantizer},
    ClassifierBuilder, DatasetSplit,
};

fn random_tensor(rows: usize, cols: usize) -> Tensor {
    Tensor::randn(0f32, 1.0, (rows, cols), &Device::Cpu).unwrap()
}

fn bench_fake_quantize(c: &mut Criterion) {
    let mut group = c.benchmark_group("fake_quantize");
    let weights = random_tensor(256, 78);

    for bits in [8u8, 4, 2] {
        group.bench_function(format!("{}bit_symmetric", bits), |b| {
            b.iter(|| black_box(fake_quantize(black_box(&weights), bits, true).unwrap()))
        });
    }
    group.bench_function("8bit_asymmetric", |b| {
        b.iter(|| black_box(fake_quantize(black_box(&weights), 8, false).unwrap()))
    });
    group.finish();
}

fn bench_distillation_loss(c: &mut Criterion) {
    let mut group = c.benchmark_group("distillation_loss");

    for batch in [64usize, 512] {
        let teacher = random_tensor(batch, 15);
        let student = random_tensor(batch, 15);
        group.bench_function(format!("batch_{}", batch), |b| {
            b.iter(|| {
                black_box(distillation_loss(black_box(&teacher), black_box(&student), 3.0).unwrap())
            })
        });
    }
    group.finish();
}

fn bench_artifact_export(c: &mut Criterion) {
    let baseline = ClassifierBuilder::new(78, 15).build().unwrap();
    let quantizer = Quantizer::new(QuantizationConfig::default());
    let qat = quantizer
        .simulate(baseline.model(), baseline.settings())
        .unwrap()
        .into_model();
    let rows = random_tensor(512, 78).to_vec2::<f32>().unwrap();
    let labels = (0..rows.len() as u32).map(|i| i % 15).collect();
    let calibration = DatasetSplit::from_rows(&rows, labels).unwrap();
    quantizer.calibrate(&qat, &calibration).unwrap();
    let artifact: CompressedArtifact = quantizer.export(qat.try_clone().unwrap()).unwrap();

    c.bench_function("export_8bit_student", |b| {
        b.iter(|| black_box(quantizer.export(qat.try_clone().unwrap()).unwrap()))
    });
    c.bench_function("reload_8bit_student", |b| {
        b.iter(|| black_box(artifact.reload().unwrap()))
    });
}

criterion_group!(
    benches,
    bench_fake_quantize,
    bench_distillation_loss,
    bench_artifact_export
);
criterion_main!(benches);
