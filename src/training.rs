//! Training utilities for gradient accumulation with FP8 weight caching.

use candle_core::Tensor;

use crate::autocast::{fp8_autocast, AutocastScope, Fp8State};
use crate::distributed::CommGroup;
use crate::error::{Fp8Error, Result};
use crate::parameter::Parameter;
use crate::recipe::DelayedScaling;
use crate::weight_cache::MicrobatchMode;

/// Training configuration.
#[derive(Debug, Clone)]
pub struct TrainingConfig {
    /// Batch size
    pub batch_size: usize,
    /// Maximum sequence length
    pub max_seq_len: usize,
    /// Gradient accumulation steps (micro-batches per optimizer step)
    pub gradient_accumulation_steps: usize,
    /// FP8 recipe; `None` trains in high precision
    pub recipe: Option<DelayedScaling>,
    /// Accumulate weight gradients into `main_grad`
    pub fuse_wgrad_accumulation: bool,
    /// Reuse FP8 weights across the micro-batches of one step
    pub cache_fp8_weights: bool,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            batch_size: 4,
            max_seq_len: 2048,
            gradient_accumulation_steps: 4,
            recipe: Some(DelayedScaling::default()),
            fuse_wgrad_accumulation: false,
            cache_fp8_weights: true,
        }
    }
}

impl TrainingConfig {
    /// Validate configuration.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if a size is zero or the recipe is invalid.
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(Fp8Error::InvalidConfig(
                "batch_size must be > 0".to_string(),
            ));
        }
        if self.max_seq_len == 0 {
            return Err(Fp8Error::InvalidConfig(
                "max_seq_len must be > 0".to_string(),
            ));
        }
        if self.gradient_accumulation_steps == 0 {
            return Err(Fp8Error::InvalidConfig(
                "gradient_accumulation_steps must be > 0".to_string(),
            ));
        }
        if let Some(recipe) = &self.recipe {
            recipe.validate()?;
        }
        Ok(())
    }

    /// Whether FP8 autocast is enabled.
    #[must_use]
    pub fn fp8_enabled(&self) -> bool {
        self.recipe.is_some()
    }
}

/// Weight-cache mode for each micro-batch of one optimizer step.
///
/// Yields `(index, mode)`: `AlwaysCast` for the first micro-batch, then
/// `ReuseCached` when weight caching is on.
#[derive(Debug, Clone)]
pub struct MicrobatchSchedule {
    steps: usize,
    next: usize,
    cache: bool,
}

impl MicrobatchSchedule {
    /// Schedule for `config`.
    #[must_use]
    pub fn new(config: &TrainingConfig) -> Self {
        Self {
            steps: config.gradient_accumulation_steps,
            next: 0,
            cache: config.cache_fp8_weights,
        }
    }
}

impl Iterator for MicrobatchSchedule {
    type Item = (usize, MicrobatchMode);

    fn next(&mut self) -> Option<Self::Item> {
        if self.next >= self.steps {
            return None;
        }
        let index = self.next;
        self.next += 1;
        let mode = if self.cache && index > 0 {
            MicrobatchMode::ReuseCached
        } else {
            MicrobatchMode::AlwaysCast
        };
        Some((index, mode))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.steps - self.next;
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for MicrobatchSchedule {}

/// Run one gradient-accumulation step.
///
/// Invalidates the weight cache, then calls `microbatch(scope, index, mode)`
/// once per micro-batch, each inside its own autocast scope synchronized
/// over `group`. Stops at the first error; observations of the failing
/// micro-batch are discarded.
///
/// # Errors
///
/// Returns a config validation error or the first micro-batch error.
pub fn run_accumulation_step<F>(
    state: &mut Fp8State,
    config: &TrainingConfig,
    group: Option<&dyn CommGroup>,
    mut microbatch: F,
) -> Result<()>
where
    F: FnMut(&mut AutocastScope<'_>, usize, MicrobatchMode) -> Result<()>,
{
    config.validate()?;
    state.weight_cache_mut().invalidate_all();

    let recipe = config.recipe.clone().unwrap_or_default();
    let enabled = config.fp8_enabled();
    for (index, mode) in MicrobatchSchedule::new(config) {
        tracing::debug!(microbatch = index, ?mode, "running micro-batch");
        fp8_autocast(state, &recipe, enabled, group, |scope| {
            microbatch(scope, index, mode)
        })?;
    }
    Ok(())
}

/// Scale gradients by a constant.
///
/// # Errors
///
/// Returns error if the multiplication fails.
pub fn scale_gradients(gradients: &[Tensor], scale: f32) -> Result<Vec<Tensor>> {
    gradients
        .iter()
        .map(|g| (g * f64::from(scale)).map_err(Into::into))
        .collect()
}

/// Divide each parameter's `main_grad` by `steps`, turning a sum over
/// micro-batches into a mean.
///
/// # Errors
///
/// Returns `UninitializedBuffer` for a parameter without a buffer.
pub fn average_main_grads<'a, I>(params: I, steps: usize) -> Result<()>
where
    I: IntoIterator<Item = &'a mut Parameter>,
{
    #[allow(clippy::cast_precision_loss)]
    let factor = 1.0 / steps.max(1) as f64;
    for param in params {
        let buffer = param
            .main_grad()
            .ok_or_else(|| Fp8Error::UninitializedBuffer {
                param: param.name().to_string(),
            })?;
        let averaged = (buffer * factor)?;
        param.replace_main_grad(averaged);
    }
    Ok(())
}
