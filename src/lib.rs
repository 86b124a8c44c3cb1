//! # fp8-train-rs
//!
//! The engine behind FP8 mixed-precision Transformer training, built on
//! [Candle](https://github.com/huggingface/candle) tensors:
//!
//! - E4M3 / E5M2 encoding with saturation ([`fp8`])
//! - Delayed-scaling recipes and per-tensor amax histories ([`recipe`], [`amax`], [`scaling`])
//! - Autocast scopes with all-or-nothing scale updates ([`autocast`])
//! - FP8 weight caching across micro-batches ([`weight_cache`])
//! - Fused gradient accumulation into high-precision buffers ([`accumulate`])
//! - Tensor/sequence parallel boundary communication ([`parallel`], [`distributed`])
//! - An FP8 linear layer and gradient-accumulation driver ([`layers`], [`training`])
//!
//! ## Status
//!
//! GEMMs run on dequantized FP8 values through Candle, so numerics match FP8
//! hardware rounding while compute stays on Candle's CPU/CUDA backends.
//! Collectives have an in-process thread backend; network transports plug in
//! through [`distributed::CommGroup`].
//!
//! ## Quick Start
//!
//! ```rust
//! use candle_core::{Device, Tensor};
//! use fp8_train_rs::{fp8_autocast, DelayedScaling, Fp8Linear, Fp8State, MicrobatchMode};
//!
//! let device = Device::Cpu;
//! let mut fc = Fp8Linear::new("fc", Tensor::randn(0f32, 0.02, (64, 32), &device)?, None)?;
//! let mut state = Fp8State::new();
//! let x = Tensor::randn(0f32, 1.0, (8, 2, 32), &device)?;
//!
//! let y = fp8_autocast(&mut state, &DelayedScaling::hybrid(), true, None, |scope| {
//!     fc.forward(scope, &x, MicrobatchMode::AlwaysCast)
//! })?;
//! assert_eq!(y.dims(), &[8, 2, 64]);
//! # Ok::<(), fp8_train_rs::Fp8Error>(())
//! ```

#![warn(missing_docs)]
#![warn(clippy::pedantic)]

pub mod accumulate;
pub mod amax;
pub mod autocast;
pub mod distributed;
pub mod error;
pub mod fp8;
pub mod layers;
pub mod parallel;
pub mod parameter;
pub mod recipe;
pub mod scaling;
pub mod training;
pub mod weight_cache;

pub use accumulate::{AccumulatorConfig, GradientAccumulator, PrimaryGradPolicy};
pub use autocast::{fp8_autocast, AutocastScope, Fp8State};
pub use error::{Fp8Error, Result};
pub use fp8::{Fp8Dtype, Fp8Tensor};
pub use layers::Fp8Linear;
pub use parameter::{ParamId, Parameter};
pub use recipe::{AmaxComputeAlgo, DelayedScaling, Fp8Format};
pub use scaling::{ScalingFactorStore, TensorKey, TensorRole};
pub use weight_cache::{MicrobatchMode, WeightCache};
