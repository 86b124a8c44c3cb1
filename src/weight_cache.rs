//! FP8 weight cache for gradient accumulation.
//!
//! Weights do not change between the micro-batches of one training iteration,
//! so the FP8 cast done on the first micro-batch can be reused by the rest.
//! Entries remember the recipe they were cast under; a different recipe makes
//! them stale.

use std::collections::HashMap;

use crate::error::{Fp8Error, Result};
use crate::fp8::Fp8Tensor;
use crate::parameter::{ParamId, Parameter};
use crate::recipe::DelayedScaling;

/// Cache behaviour for one weight request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MicrobatchMode {
    /// Cast and overwrite any cached entry (first micro-batch, or no caching).
    #[default]
    AlwaysCast,
    /// Reuse a valid entry cast under the same recipe, otherwise cast.
    CastIfMissing,
    /// Reuse the cached entry; never cast.
    ReuseCached,
}

impl From<Option<bool>> for MicrobatchMode {
    /// `None` and `Some(true)` cast, `Some(false)` reuses.
    fn from(is_first_microbatch: Option<bool>) -> Self {
        match is_first_microbatch {
            None | Some(true) => Self::AlwaysCast,
            Some(false) => Self::ReuseCached,
        }
    }
}

/// A cached FP8 weight.
#[derive(Debug, Clone)]
pub struct WeightCacheEntry {
    /// Quantized weight.
    pub quantized: Fp8Tensor,
    /// Recipe active when the weight was cast.
    pub recipe: DelayedScaling,
    /// Cleared at the start of each training iteration.
    pub valid: bool,
}

/// Per-process cache of FP8 weights keyed by parameter identity.
#[derive(Debug, Clone, Default)]
pub struct WeightCache {
    entries: HashMap<ParamId, WeightCacheEntry>,
}

impl WeightCache {
    /// Empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the FP8 weight for `param`, casting with `cast` when `mode` requires it.
    ///
    /// # Errors
    ///
    /// - `CacheMiss` in `ReuseCached` mode when there is no valid entry for the
    ///   current recipe (a stale entry is dropped first)
    /// - any error returned by `cast`
    pub fn get_or_cast<F>(
        &mut self,
        param: &Parameter,
        recipe: &DelayedScaling,
        mode: MicrobatchMode,
        cast: F,
    ) -> Result<Fp8Tensor>
    where
        F: FnOnce() -> Result<Fp8Tensor>,
    {
        let id = param.id();
        if self.entries.get(&id).is_some_and(|e| e.recipe != *recipe) {
            tracing::debug!(param = param.name(), "recipe changed, dropping cached FP8 weight");
            self.entries.remove(&id);
        }

        match mode {
            MicrobatchMode::AlwaysCast => {}
            MicrobatchMode::CastIfMissing | MicrobatchMode::ReuseCached => {
                match self.entries.get(&id) {
                    Some(entry) if entry.valid => {
                        tracing::debug!(param = param.name(), "FP8 weight cache hit");
                        return Ok(entry.quantized.clone());
                    }
                    entry if mode == MicrobatchMode::ReuseCached => {
                        let reason = if entry.is_some() {
                            "entry was invalidated for a new iteration"
                        } else {
                            "weight was never cast under the current recipe"
                        };
                        return Err(Fp8Error::CacheMiss {
                            param: param.name().to_string(),
                            reason: reason.to_string(),
                        });
                    }
                    _ => {}
                }
            }
        }

        let quantized = cast()?;
        tracing::debug!(param = param.name(), "cast FP8 weight");
        self.entries.insert(
            id,
            WeightCacheEntry {
                quantized: quantized.clone(),
                recipe: recipe.clone(),
                valid: true,
            },
        );
        Ok(quantized)
    }

    /// Entry for `param`, valid or not.
    #[must_use]
    pub fn get(&self, param: ParamId) -> Option<&WeightCacheEntry> {
        self.entries.get(&param)
    }

    /// Mark every entry invalid. Call at the start of each training iteration.
    pub fn invalidate_all(&mut self) {
        for entry in self.entries.values_mut() {
            entry.valid = false;
        }
    }

    /// Re-validate an entry the caller knows is still current.
    ///
    /// Returns `false` if there is no entry for `param`.
    pub fn mark_valid(&mut self, param: ParamId) -> bool {
        self.entries
            .get_mut(&param)
            .map(|entry| entry.valid = true)
            .is_some()
    }

    /// Drop the entry for `param`.
    pub fn remove(&mut self, param: ParamId) -> Option<WeightCacheEntry> {
        self.entries.remove(&param)
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Bytes held by cached FP8 weights.
    #[must_use]
    pub fn memory_bytes(&self) -> usize {
        self.entries.values().map(|e| e.quantized.size_bytes()).sum()
    }
}
