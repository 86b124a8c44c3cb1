// SPDX-License-Identifier: MIT
// Copyright 2026 Tyler Zervas

//! Delayed-scaling recipes.
//!
//! A recipe fixes which FP8 encodings are used for forward and backward
//! tensors and how a scaling factor is derived from the amax history.
//!
//! ## Scaling Factor
//!
//! ```text
//! amax  = compute_algo(history)          // max, most recent, or custom
//! scale = fp8_max / amax / 2^margin      // previous scale kept if amax is 0 or non-finite
//! ```
//!
//! # Example
//!
//! ```rust
//! use fp8_train_rs::recipe::{AmaxComputeAlgo, DelayedScaling, Fp8Format};
//!
//! let recipe = DelayedScaling {
//!     amax_history_len: 16,
//!     amax_compute_algo: AmaxComputeAlgo::Max,
//!     ..DelayedScaling::hybrid()
//! };
//! assert!(recipe.validate().is_ok());
//! assert_eq!(recipe.fp8_format, Fp8Format::Hybrid);
//! ```

use std::fmt;

use crate::error::{Fp8Error, Result};
use crate::fp8::Fp8Dtype;

/// FP8 format variant of a recipe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Fp8Format {
    /// E4M3 for every tensor.
    E4M3,
    /// E5M2 for every tensor.
    E5M2,
    /// E4M3 for forward tensors, E5M2 for gradients.
    #[default]
    Hybrid,
}

impl Fp8Format {
    /// Encoding used for activations and weights.
    #[must_use]
    pub const fn forward_dtype(self) -> Fp8Dtype {
        match self {
            Self::E4M3 | Self::Hybrid => Fp8Dtype::E4M3,
            Self::E5M2 => Fp8Dtype::E5M2,
        }
    }

    /// Encoding used for gradients.
    #[must_use]
    pub const fn backward_dtype(self) -> Fp8Dtype {
        match self {
            Self::E4M3 => Fp8Dtype::E4M3,
            Self::E5M2 | Self::Hybrid => Fp8Dtype::E5M2,
        }
    }
}

/// User-supplied reduction of an amax history (oldest first) to one value.
#[derive(Clone, Copy)]
pub struct CustomAmaxAlgo {
    /// Name used for recipe comparison and diagnostics.
    pub name: &'static str,
    /// Reduction function.
    pub func: fn(&[f32]) -> f32,
}

/// User-supplied scaling factor computation.
#[derive(Clone, Copy)]
pub struct CustomScalingAlgo {
    /// Name used for recipe comparison and diagnostics.
    pub name: &'static str,
    /// `(amax, previous_scale, fp8_max, margin) -> scale`.
    pub func: fn(f32, f32, f32, u32) -> f32,
}

macro_rules! impl_named_algo {
    ($ty:ty) => {
        impl PartialEq for $ty {
            fn eq(&self, other: &Self) -> bool {
                self.name == other.name
            }
        }

        impl Eq for $ty {}

        impl fmt::Debug for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.debug_tuple(stringify!($ty)).field(&self.name).finish()
            }
        }
    };
}

impl_named_algo!(CustomAmaxAlgo);
impl_named_algo!(CustomScalingAlgo);

/// How the amax used for scaling is derived from the history window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AmaxComputeAlgo {
    /// Maximum over the whole window.
    Max,
    /// Newest observation only.
    #[default]
    MostRecent,
    /// Custom reduction.
    Custom(CustomAmaxAlgo),
}

impl AmaxComputeAlgo {
    /// Reduce a history (oldest first). Empty histories yield 0.
    #[must_use]
    pub fn reduce(&self, history: &[f32]) -> f32 {
        if history.is_empty() {
            return 0.0;
        }
        match self {
            Self::Max => history.iter().copied().fold(f32::NEG_INFINITY, f32::max),
            Self::MostRecent => history[history.len() - 1],
            Self::Custom(algo) => (algo.func)(history),
        }
    }
}

/// How a scaling factor is derived from an amax.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScalingFactorAlgo {
    /// `fp8_max / amax / 2^margin`, keeping the previous scale for zero or non-finite amax.
    #[default]
    Default,
    /// Custom computation.
    Custom(CustomScalingAlgo),
}

impl ScalingFactorAlgo {
    /// Compute the next scale.
    #[must_use]
    pub fn compute(&self, amax: f32, previous: f32, fp8_max: f32, margin: u32) -> f32 {
        match self {
            Self::Default => {
                if amax > 0.0 && amax.is_finite() {
                    fp8_max / amax / 2f32.powi(margin as i32)
                } else {
                    previous
                }
            }
            Self::Custom(algo) => (algo.func)(amax, previous, fp8_max, margin),
        }
    }
}

/// Per-GEMM opt-out of FP8 in linear layers.
///
/// A `true` field runs that GEMM in the input precision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OverrideLinearPrecision {
    /// Forward GEMM.
    pub fprop: bool,
    /// Input-gradient GEMM.
    pub dgrad: bool,
    /// Weight-gradient GEMM.
    pub wgrad: bool,
}

/// Delayed-scaling FP8 recipe. Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DelayedScaling {
    /// Scale is divided by `2^margin`.
    pub margin: u32,
    /// Scales are recomputed every `interval` committed scopes.
    pub interval: u32,
    /// FP8 format variant.
    pub fp8_format: Fp8Format,
    /// Amax history window length.
    pub amax_history_len: usize,
    /// Amax reduction over the history.
    pub amax_compute_algo: AmaxComputeAlgo,
    /// Scaling factor computation.
    pub scaling_factor_compute_algo: ScalingFactorAlgo,
    /// GEMMs that stay in high precision.
    pub override_linear_precision: OverrideLinearPrecision,
}

impl Default for DelayedScaling {
    fn default() -> Self {
        Self {
            margin: 0,
            interval: 1,
            fp8_format: Fp8Format::Hybrid,
            amax_history_len: 1,
            amax_compute_algo: AmaxComputeAlgo::MostRecent,
            scaling_factor_compute_algo: ScalingFactorAlgo::Default,
            override_linear_precision: OverrideLinearPrecision::default(),
        }
    }
}

impl DelayedScaling {
    /// Recipe with the given format, history length and amax algorithm.
    #[must_use]
    pub fn new(
        fp8_format: Fp8Format,
        amax_history_len: usize,
        amax_compute_algo: AmaxComputeAlgo,
    ) -> Self {
        Self {
            fp8_format,
            amax_history_len,
            amax_compute_algo,
            ..Self::default()
        }
    }

    /// E4M3 everywhere.
    #[must_use]
    pub fn e4m3() -> Self {
        Self {
            fp8_format: Fp8Format::E4M3,
            ..Self::default()
        }
    }

    /// E4M3 forward, E5M2 backward.
    #[must_use]
    pub fn hybrid() -> Self {
        Self::default()
    }

    /// Validate recipe parameters.
    ///
    /// # Errors
    ///
    /// Returns error if `amax_history_len` or `interval` is zero.
    pub fn validate(&self) -> Result<()> {
        if self.amax_history_len == 0 {
            return Err(Fp8Error::InvalidConfig(
                "amax_history_len must be at least 1".to_string(),
            ));
        }
        if self.interval == 0 {
            return Err(Fp8Error::InvalidConfig(
                "interval must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

impl fmt::Display for DelayedScaling {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "DelayedScaling({:?}, history={}, algo={:?}, margin={}, interval={})",
            self.fp8_format,
            self.amax_history_len,
            self.amax_compute_algo,
            self.margin,
            self.interval
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn min_amax(history: &[f32]) -> f32 {
        history.iter().copied().fold(f32::INFINITY, f32::min)
    }

    fn always_two(_amax: f32, _scale: f32, _fp8_max: f32, _margin: u32) -> f32 {
        2.0
    }

    #[test]
    fn test_default_recipe_valid() {
        let recipe = DelayedScaling::default();
        assert!(recipe.validate().is_ok());
        assert_eq!(recipe.fp8_format, Fp8Format::Hybrid);
        assert_eq!(recipe.amax_history_len, 1);
    }

    #[test]
    fn test_invalid_history_len() {
        let recipe = DelayedScaling {
            amax_history_len: 0,
            ..Default::default()
        };
        assert!(matches!(recipe.validate(), Err(Fp8Error::InvalidConfig(_))));
    }

    #[test]
    fn test_invalid_interval() {
        let recipe = DelayedScaling {
            interval: 0,
            ..Default::default()
        };
        assert!(recipe.validate().is_err());
    }

    #[test]
    fn test_hybrid_dtypes() {
        assert_eq!(Fp8Format::Hybrid.forward_dtype(), Fp8Dtype::E4M3);
        assert_eq!(Fp8Format::Hybrid.backward_dtype(), Fp8Dtype::E5M2);
        assert_eq!(Fp8Format::E4M3.backward_dtype(), Fp8Dtype::E4M3);
    }

    #[test]
    fn test_amax_algorithms() {
        let history = [3.0, 9.0, 1.0];
        assert_eq!(AmaxComputeAlgo::Max.reduce(&history), 9.0);
        assert_eq!(AmaxComputeAlgo::MostRecent.reduce(&history), 1.0);

        let custom = AmaxComputeAlgo::Custom(CustomAmaxAlgo {
            name: "min",
            func: min_amax,
        });
        assert_eq!(custom.reduce(&history), 1.0);
        assert_eq!(AmaxComputeAlgo::Max.reduce(&[]), 0.0);
    }

    #[test]
    fn test_default_scaling_with_margin() {
        let algo = ScalingFactorAlgo::Default;
        assert_eq!(algo.compute(4.0, 1.0, 448.0, 0), 112.0);
        assert_eq!(algo.compute(4.0, 1.0, 448.0, 1), 56.0);
    }

    #[test]
    fn test_default_scaling_keeps_previous_on_bad_amax() {
        let algo = ScalingFactorAlgo::Default;
        assert_eq!(algo.compute(0.0, 3.0, 448.0, 0), 3.0);
        assert_eq!(algo.compute(f32::INFINITY, 3.0, 448.0, 0), 3.0);
        assert_eq!(algo.compute(f32::NAN, 3.0, 448.0, 0), 3.0);
    }

    #[test]
    fn test_custom_recipes_compare_by_name() {
        let a = DelayedScaling {
            scaling_factor_compute_algo: ScalingFactorAlgo::Custom(CustomScalingAlgo {
                name: "two",
                func: always_two,
            }),
            ..Default::default()
        };
        assert_eq!(a, a.clone());
        assert_ne!(a, DelayedScaling::default());
        assert_eq!(a.scaling_factor_compute_algo.compute(1.0, 1.0, 448.0, 0), 2.0);
    }
}
