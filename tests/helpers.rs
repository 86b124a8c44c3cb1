//! Test utilities and fixtures for FP8 training integration tests.
//!
//! Deterministic tensor generation, numerical comparison, and a helper for
//! running one closure per rank of a thread-backed process group.

use std::thread;

use anyhow::Result;
use candle_core::{Device, Tensor};
use fp8_train_rs::distributed::ThreadGroup;

/// Accuracy metrics for numerical validation.
#[derive(Debug, Clone)]
pub struct AccuracyMetrics {
    /// Mean Absolute Error.
    pub mae: f32,
    /// Maximum absolute error.
    pub max_error: f32,
    /// Cosine similarity between tensors.
    pub cosine_similarity: f32,
}

/// Test fixtures for common tensor patterns.
pub struct TestFixtures;

impl TestFixtures {
    /// Reproducible values in `[-max, max]` from a linear congruential generator.
    pub fn uniform(shape: &[usize], max: f32, seed: u64) -> Result<Tensor> {
        let n = shape.iter().product::<usize>();
        let mut state = seed.wrapping_mul(6_364_136_223_846_793_005).wrapping_add(1);
        let values: Vec<f32> = (0..n)
            .map(|_| {
                state = state
                    .wrapping_mul(6_364_136_223_846_793_005)
                    .wrapping_add(1_442_695_040_888_963_407);
                let unit = (state >> 40) as f32 / (1u64 << 24) as f32;
                (unit * 2.0 - 1.0) * max
            })
            .collect();
        Ok(Tensor::from_vec(values, shape, &Device::Cpu)?)
    }

    /// Activation in `[seq, batch, hidden]` layout.
    pub fn activation(seq: usize, batch: usize, hidden: usize, seed: u64) -> Result<Tensor> {
        Self::uniform(&[seq, batch, hidden], 1.0, seed)
    }

    /// Weight `[out, in]` with values in `[-0.5, 0.5]`.
    pub fn weight(out_features: usize, in_features: usize, seed: u64) -> Result<Tensor> {
        Self::uniform(&[out_features, in_features], 0.5, seed)
    }
}

/// Utility functions for numerical validation.
pub struct ValidationUtils;

impl ValidationUtils {
    /// Calculate accuracy metrics between two tensors.
    pub fn calculate_accuracy_metrics(expected: &Tensor, actual: &Tensor) -> Result<AccuracyMetrics> {
        let expected = expected.flatten_all()?.to_vec1::<f32>()?;
        let actual = actual.flatten_all()?.to_vec1::<f32>()?;
        assert_eq!(expected.len(), actual.len(), "Tensor dimensions must match");

        let mut sum_abs_error = 0.0;
        let mut max_error: f32 = 0.0;
        let mut dot_product = 0.0;
        let mut expected_norm_sq = 0.0;
        let mut actual_norm_sq = 0.0;

        for (e, a) in expected.iter().zip(actual.iter()) {
            let error = (e - a).abs();
            sum_abs_error += error;
            max_error = max_error.max(error);
            dot_product += e * a;
            expected_norm_sq += e * e;
            actual_norm_sq += a * a;
        }

        let cosine_similarity = if expected_norm_sq > 0.0 && actual_norm_sq > 0.0 {
            dot_product / (expected_norm_sq.sqrt() * actual_norm_sq.sqrt())
        } else {
            0.0
        };

        Ok(AccuracyMetrics {
            mae: sum_abs_error / expected.len() as f32,
            max_error,
            cosine_similarity,
        })
    }

    /// Assert two tensors agree element-wise within `tol`.
    pub fn assert_close(expected: &Tensor, actual: &Tensor, tol: f32) -> Result<()> {
        assert_eq!(expected.dims(), actual.dims());
        let metrics = Self::calculate_accuracy_metrics(expected, actual)?;
        assert!(
            metrics.max_error <= tol,
            "max error {:.6} exceeds {tol}",
            metrics.max_error
        );
        Ok(())
    }
}

/// Run `f` once per rank of a fresh `world_size` thread group.
///
/// Results are returned in rank order.
pub fn run_ranks<F, T>(world_size: usize, f: F) -> Result<Vec<T>>
where
    F: Fn(ThreadGroup) -> Result<T> + Send + Sync + Clone + 'static,
    T: Send + 'static,
{
    let handles: Vec<_> = ThreadGroup::create(world_size)?
        .into_iter()
        .map(|group| {
            let f = f.clone();
            thread::spawn(move || f(group))
        })
        .collect();

    handles
        .into_iter()
        .map(|h| {
            h.join()
                .map_err(|_| anyhow::anyhow!("rank thread panicked"))?
        })
        .collect()
}
