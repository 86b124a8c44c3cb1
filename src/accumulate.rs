// SPDX-License-Identifier: MIT
// Copyright 2026 Tyler Zervas

//! Fused gradient accumulation into high-precision buffers.
//!
//! Weight gradients of each micro-batch are added straight into the
//! parameter's `main_grad` buffer in the buffer's precision, so a
//! multiply-accumulate GEMM can target the full-precision buffer without a
//! separate up-cast pass. The primary `grad` slot is left alone or cleared.

use candle_core::Tensor;

use crate::error::{Fp8Error, Result};
use crate::parameter::{check_same_dims, Parameter};

/// What happens to the primary gradient slot on accumulation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PrimaryGradPolicy {
    /// Leave `grad` as it is.
    #[default]
    Untouched,
    /// Clear `grad` so only `main_grad` holds the gradient.
    Clear,
}

/// Accumulator configuration.
#[derive(Debug, Clone, Copy, Default)]
pub struct AccumulatorConfig {
    /// Primary gradient handling.
    pub primary_grad: PrimaryGradPolicy,
}

/// Adds incoming gradients into attached accumulation buffers.
///
/// Never allocates a buffer: callers attach and zero `main_grad` before the
/// first micro-batch.
#[derive(Debug, Clone, Copy, Default)]
pub struct GradientAccumulator {
    config: AccumulatorConfig,
}

impl GradientAccumulator {
    /// Create an accumulator.
    #[must_use]
    pub fn new(config: AccumulatorConfig) -> Self {
        Self { config }
    }

    /// Accumulator configuration.
    #[must_use]
    pub fn config(&self) -> &AccumulatorConfig {
        &self.config
    }

    /// Add `incoming` (cast up to the buffer dtype) into `param.main_grad`.
    ///
    /// # Errors
    ///
    /// - `UninitializedBuffer` if no buffer is attached
    /// - `ShapeMismatch` if `incoming` does not match the buffer shape
    pub fn accumulate(&self, param: &mut Parameter, incoming: &Tensor) -> Result<()> {
        let buffer = param
            .main_grad()
            .ok_or_else(|| Fp8Error::UninitializedBuffer {
                param: param.name().to_string(),
            })?;
        check_same_dims(buffer.dims(), incoming.dims())?;

        let updated = buffer.add(&incoming.to_dtype(buffer.dtype())?)?;
        param.replace_main_grad(updated);

        if self.config.primary_grad == PrimaryGradPolicy::Clear {
            param.take_grad();
        }
        Ok(())
    }
}
