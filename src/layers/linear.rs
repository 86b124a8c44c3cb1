// SPDX-License-Identifier: MIT
// Copyright 2026 Tyler Zervas

//! `Fp8Linear`: a linear layer with FP8 forward and backward GEMMs.
//!
//! ## Usage
//!
//! ```rust
//! use candle_core::{Device, Tensor};
//! use fp8_train_rs::autocast::{fp8_autocast, Fp8State};
//! use fp8_train_rs::layers::Fp8Linear;
//! use fp8_train_rs::recipe::DelayedScaling;
//! use fp8_train_rs::weight_cache::MicrobatchMode;
//!
//! let device = Device::Cpu;
//! let mut fc1 = Fp8Linear::new("fc1", Tensor::randn(0f32, 0.02, (32, 16), &device)?, None)?;
//! let mut state = Fp8State::new();
//! let x = Tensor::randn(0f32, 1.0, (4, 2, 16), &device)?;
//!
//! let y = fp8_autocast(&mut state, &DelayedScaling::default(), true, None, |scope| {
//!     fc1.forward(scope, &x, MicrobatchMode::AlwaysCast)
//! })?;
//! assert_eq!(y.dims(), &[4, 2, 32]);
//! # Ok::<(), fp8_train_rs::Fp8Error>(())
//! ```
//!
//! GEMMs are evaluated on dequantized FP8 values, so results carry exactly
//! the rounding of the FP8 encoding.

use candle_core::Tensor;

use crate::accumulate::GradientAccumulator;
use crate::autocast::AutocastScope;
use crate::error::{Fp8Error, Result};
use crate::parameter::Parameter;
use crate::scaling::TensorKey;
use crate::weight_cache::MicrobatchMode;

/// Activations saved by `forward` for `backward`.
#[derive(Debug, Clone)]
struct Saved {
    /// Leading dims of the forward input.
    leading: Vec<usize>,
    /// Input as used by the forward GEMM, flattened to 2-D.
    input: Tensor,
    /// Input in its original precision, flattened to 2-D.
    input_hp: Tensor,
    /// Weight as used by the forward GEMM.
    weight: Tensor,
}

/// A linear layer `y = x W^T + b` with FP8 GEMMs.
///
/// # Gradients
///
/// - Input gradient: `g W`, returned from [`Fp8Linear::backward`]
/// - Weight gradient: `g^T x`, added into `weight.main_grad` through the
///   gradient accumulator when `fuse_wgrad_accumulation` is set, otherwise
///   into `weight.grad`
/// - Bias gradient: row sum of `g`, added into `bias.grad`
///
/// With [`Fp8Linear::with_requires_wgrad`] set to `false` (frozen parameters)
/// only the input gradient is computed.
#[derive(Debug, Clone)]
pub struct Fp8Linear {
    name: String,
    /// Weight [`out_features`, `in_features`].
    weight: Parameter,
    /// Optional bias [`out_features`].
    bias: Option<Parameter>,
    fuse_wgrad_accumulation: bool,
    requires_wgrad: bool,
    accumulator: GradientAccumulator,
    saved: Option<Saved>,
}

impl Fp8Linear {
    /// Create a layer named `name`.
    ///
    /// Parameters are named `<name>.weight` and `<name>.bias`.
    ///
    /// # Errors
    ///
    /// Returns `ShapeMismatch` if the weight is not 2-D or the bias shape
    /// doesn't match `out_features`.
    pub fn new(name: impl Into<String>, weight: Tensor, bias: Option<Tensor>) -> Result<Self> {
        let name = name.into();
        let (out_features, _) = weight.dims2().map_err(|_| Fp8Error::ShapeMismatch {
            expected: vec![0, 0],
            actual: weight.dims().to_vec(),
        })?;

        if let Some(ref b) = bias {
            if b.dims() != [out_features] {
                return Err(Fp8Error::ShapeMismatch {
                    expected: vec![out_features],
                    actual: b.dims().to_vec(),
                });
            }
        }

        Ok(Self {
            weight: Parameter::new(format!("{name}.weight"), weight),
            bias: bias.map(|b| Parameter::new(format!("{name}.bias"), b)),
            name,
            fuse_wgrad_accumulation: false,
            requires_wgrad: true,
            accumulator: GradientAccumulator::default(),
            saved: None,
        })
    }

    /// Route weight gradients into `weight.main_grad`.
    #[must_use]
    pub fn with_fused_wgrad(mut self, fuse: bool) -> Self {
        self.fuse_wgrad_accumulation = fuse;
        self
    }

    /// Compute parameter gradients in `backward`. Defaults to `true`.
    #[must_use]
    pub fn with_requires_wgrad(mut self, requires_wgrad: bool) -> Self {
        self.requires_wgrad = requires_wgrad;
        self
    }

    /// Use `accumulator` for fused weight gradients.
    #[must_use]
    pub fn with_accumulator(mut self, accumulator: GradientAccumulator) -> Self {
        self.accumulator = accumulator;
        self
    }

    /// Layer name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the input features (`in_features`).
    #[must_use]
    pub fn in_features(&self) -> usize {
        self.weight.value().dims()[1]
    }

    /// Get the output features (`out_features`).
    #[must_use]
    pub fn out_features(&self) -> usize {
        self.weight.value().dims()[0]
    }

    /// Whether weight gradients go to the accumulation buffer.
    #[must_use]
    pub fn fuse_wgrad_accumulation(&self) -> bool {
        self.fuse_wgrad_accumulation
    }

    /// Whether `backward` produces parameter gradients.
    #[must_use]
    pub fn requires_wgrad(&self) -> bool {
        self.requires_wgrad
    }

    /// Weight parameter.
    #[must_use]
    pub fn weight(&self) -> &Parameter {
        &self.weight
    }

    /// Mutable weight parameter, e.g. to attach `main_grad` or apply an update.
    pub fn weight_mut(&mut self) -> &mut Parameter {
        &mut self.weight
    }

    /// Bias parameter.
    #[must_use]
    pub fn bias(&self) -> Option<&Parameter> {
        self.bias.as_ref()
    }

    /// Mutable bias parameter.
    pub fn bias_mut(&mut self) -> Option<&mut Parameter> {
        self.bias.as_mut()
    }

    /// Forward pass.
    ///
    /// Inside an enabled scope the input and weight are cast to FP8 (the
    /// weight through the weight cache according to `mode`) unless the recipe
    /// overrides `fprop`.
    ///
    /// # Arguments
    ///
    /// * `input` - Input tensor [..., `in_features`]
    ///
    /// # Returns
    ///
    /// Output tensor [..., `out_features`]
    ///
    /// # Errors
    ///
    /// - `ShapeMismatch` if the last input dim is not `in_features`
    /// - `CacheMiss` in `ReuseCached` mode without a cached weight
    pub fn forward(
        &mut self,
        scope: &mut AutocastScope<'_>,
        input: &Tensor,
        mode: MicrobatchMode,
    ) -> Result<Tensor> {
        let (leading, x_hp) = self.flatten(input, self.in_features())?;

        let fp8 = scope.is_enabled() && !scope.recipe().override_linear_precision.fprop;
        let (x, w) = if fp8 {
            let xq = scope.cast(&TensorKey::input(self.name.as_str()), &x_hp)?;
            let wq = scope.cast_weight(&self.weight, mode)?;
            (xq.dequantize()?, wq.dequantize()?)
        } else {
            (x_hp.clone(), self.weight.value().clone())
        };

        let output = self.linear(&x, &w)?;
        let mut out_dims = leading.clone();
        out_dims.push(self.out_features());

        self.saved = Some(Saved {
            leading,
            input: x,
            input_hp: x_hp,
            weight: w,
        });
        Ok(output.reshape(out_dims)?)
    }

    /// Backward pass for the most recent `forward`.
    ///
    /// The output gradient is cast to FP8 unless no GEMM needs it (`dgrad`
    /// overridden, and `wgrad` overridden or not required). Each GEMM then
    /// uses the FP8 or the original operands per its override flag.
    ///
    /// The FP8 dgrad reuses the weight exactly as the forward GEMM saw it. If
    /// `fprop` was overridden while `dgrad` was not, that is the
    /// high-precision weight, so dgrad multiplies the FP8 output gradient by
    /// the unquantized weight.
    ///
    /// Without `requires_wgrad` the weight and bias gradients are skipped
    /// entirely, including the fused accumulation.
    ///
    /// # Returns
    ///
    /// Input gradient [..., `in_features`]
    ///
    /// # Errors
    ///
    /// - `InvalidState` if there is no saved forward
    /// - `ShapeMismatch` if `grad_output` does not match the forward output
    /// - `UninitializedBuffer` with fused accumulation and no `main_grad`
    pub fn backward(&mut self, scope: &mut AutocastScope<'_>, grad_output: &Tensor) -> Result<Tensor> {
        let saved = self.saved.take().ok_or_else(|| {
            Fp8Error::InvalidState(format!("backward on {} without a saved forward", self.name))
        })?;
        let (leading, g_hp) = self.flatten(grad_output, self.out_features())?;
        if leading != saved.leading {
            let mut expected = saved.leading.clone();
            expected.push(self.out_features());
            return Err(Fp8Error::ShapeMismatch {
                expected,
                actual: grad_output.dims().to_vec(),
            });
        }

        let enabled = scope.is_enabled();
        let overrides = scope.recipe().override_linear_precision;
        let needs_fp8 = !overrides.dgrad || (self.requires_wgrad && !overrides.wgrad);
        let g_fp8 = if enabled && needs_fp8 {
            let key = TensorKey::grad_output(self.name.as_str());
            Some(scope.cast(&key, &g_hp)?.dequantize()?)
        } else {
            None
        };

        // dgrad
        let (g, w) = match &g_fp8 {
            Some(g) if !overrides.dgrad => (g, &saved.weight),
            _ => (&g_hp, self.weight.value()),
        };
        let grad_input = g.matmul(w)?;

        let mut in_dims = saved.leading;
        in_dims.push(self.in_features());
        let grad_input = grad_input.reshape(in_dims)?;
        if !self.requires_wgrad {
            return Ok(grad_input);
        }

        // wgrad
        let (g, x) = match &g_fp8 {
            Some(g) if !overrides.wgrad => (g, &saved.input),
            _ => (&g_hp, &saved.input_hp),
        };
        let grad_weight = g.t()?.matmul(x)?;

        if self.fuse_wgrad_accumulation {
            self.accumulator.accumulate(&mut self.weight, &grad_weight)?;
        } else {
            add_grad(&mut self.weight, grad_weight)?;
        }
        if let Some(bias) = self.bias.as_mut() {
            add_grad(bias, g_hp.sum(0)?)?;
        }
        Ok(grad_input)
    }

    /// Split `[..., features]` into its leading dims and a 2-D view.
    fn flatten(&self, tensor: &Tensor, features: usize) -> Result<(Vec<usize>, Tensor)> {
        match tensor.dims().split_last() {
            Some((&last, leading)) if last == features => {
                let rows = leading.iter().product::<usize>();
                Ok((leading.to_vec(), tensor.reshape((rows, features))?))
            }
            _ => {
                let mut expected = tensor.dims().to_vec();
                match expected.last_mut() {
                    Some(last) => *last = features,
                    None => expected.push(features),
                }
                Err(Fp8Error::ShapeMismatch {
                    expected,
                    actual: tensor.dims().to_vec(),
                })
            }
        }
    }

    fn linear(&self, x: &Tensor, w: &Tensor) -> Result<Tensor> {
        let mut output = x.matmul(&w.t()?)?;
        if let Some(ref bias) = self.bias {
            output = output.broadcast_add(bias.value())?;
        }
        Ok(output)
    }
}

fn add_grad(param: &mut Parameter, grad: Tensor) -> Result<()> {
    let total = match param.take_grad() {
        Some(existing) => existing.add(&grad.to_dtype(existing.dtype())?)?,
        None => grad,
    };
    param.set_grad(total)
}

/// High-precision forward, for evaluation outside any autocast scope.
impl candle_core::Module for Fp8Linear {
    fn forward(&self, input: &Tensor) -> candle_core::Result<Tensor> {
        let run = || -> Result<Tensor> {
            let (mut leading, x) = self.flatten(input, self.in_features())?;
            let output = self.linear(&x, self.weight.value())?;
            leading.push(self.out_features());
            Ok(output.reshape(leading)?)
        };
        run().map_err(|e| candle_core::Error::Msg(e.to_string()))
    }
}
