//! Benchmarks for FP8 casting and the FP8 linear layer.
//!
//! - `fp8_cast`: quantize a square activation under an autocast scope
//! - `fp8_linear`: `Fp8Linear` forward with a fresh vs. cached weight cast

use candle_core::{Device, Tensor};
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use fp8_train_rs::{fp8_autocast, DelayedScaling, Fp8Linear, Fp8State, MicrobatchMode, TensorKey};

const SIZES: &[usize] = &[256, 1024];

fn benchmark_cast(c: &mut Criterion) {
    let mut group = c.benchmark_group("fp8_cast");
    let device = Device::Cpu;
    let recipe = DelayedScaling::hybrid();
    let key = TensorKey::input("x");

    for &size in SIZES {
        let Ok(x) = Tensor::randn(0f32, 1.0, (size, size), &device) else {
            continue;
        };
        let mut state = Fp8State::new();

        group.bench_with_input(BenchmarkId::new("cpu", size), &x, |b, x| {
            b.iter(|| {
                fp8_autocast(&mut state, &recipe, true, None, |scope| scope.cast(&key, x)).unwrap()
            });
        });
    }
    group.finish();
}

fn benchmark_linear(c: &mut Criterion) {
    let mut group = c.benchmark_group("fp8_linear");
    let device = Device::Cpu;
    let recipe = DelayedScaling::hybrid();

    for &hidden in SIZES {
        let Ok(w) = Tensor::randn(0f32, 0.02, (hidden, hidden), &device) else {
            continue;
        };
        let Ok(x) = Tensor::randn(0f32, 1.0, (128, 1, hidden), &device) else {
            continue;
        };
        let Ok(mut layer) = Fp8Linear::new("fc", w, None) else {
            continue;
        };
        let mut state = Fp8State::new();

        // AlwaysCast runs first and leaves a valid entry for ReuseCached.
        for mode in [MicrobatchMode::AlwaysCast, MicrobatchMode::ReuseCached] {
            let id = format!("{mode:?}_h{hidden}");
            group.bench_with_input(BenchmarkId::new("cpu", &id), &x, |b, x| {
                b.iter(|| {
                    fp8_autocast(&mut state, &recipe, true, None, |scope| {
                        layer.forward(scope, x, mode)
                    })
                    .unwrap()
                });
            });
        }
    }
    group.finish();
}

criterion_group!(benches, benchmark_cast, benchmark_linear);
criterion_main!(benches);
