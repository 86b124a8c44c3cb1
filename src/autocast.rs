// SPDX-License-Identifier: MIT
// Copyright 2026 Tyler Zervas

//! FP8 autocast scopes with delayed scaling.
//!
//! All scaling state lives in an explicit per-process [`Fp8State`]. An
//! [`AutocastScope`] mutably borrows that state for its lifetime, so two
//! overlapping scopes over the same state cannot exist; nesting goes through
//! [`AutocastScope::nested`].
//!
//! ## Lifecycle
//!
//! 1. **Enter**: [`Fp8State::autocast`] validates the recipe and opens a scope.
//! 2. **Run**: eligible operations ([`AutocastScope::cast`],
//!    [`AutocastScope::cast_weight`]) quantize with the *current* scale and
//!    record amax observations into a pending set.
//! 3. **Exit**: the outermost [`AutocastScope::exit`] all-reduces the pending
//!    amaxes (max) over the optional group and folds them into the scaling
//!    factor store in one step.
//!
//! A scope dropped without `exit` (for example because the wrapped
//! computation returned an error through `?`) discards its observations, so
//! scale entries are either fully updated or left as they were.
//!
//! # Example
//!
//! ```rust
//! use candle_core::{Device, Tensor};
//! use fp8_train_rs::autocast::{fp8_autocast, Fp8State};
//! use fp8_train_rs::recipe::DelayedScaling;
//! use fp8_train_rs::scaling::TensorKey;
//!
//! let mut state = Fp8State::new();
//! let x = Tensor::randn(0f32, 1.0, (4, 8), &Device::Cpu)?;
//! let key = TensorKey::input("fc1");
//!
//! fp8_autocast(&mut state, &DelayedScaling::e4m3(), true, None, |scope| {
//!     scope.cast(&key, &x)?;
//!     Ok(())
//! })?;
//! assert!(state.store().scale(&key) > 1.0);
//! # Ok::<(), fp8_train_rs::Fp8Error>(())
//! ```

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};

use candle_core::Tensor;

use crate::distributed::CommGroup;
use crate::error::{Fp8Error, Result};
use crate::fp8::Fp8Tensor;
use crate::parameter::{ParamId, Parameter};
use crate::recipe::DelayedScaling;
use crate::scaling::{ScalingFactorStore, TensorKey};
use crate::weight_cache::{MicrobatchMode, WeightCache};

/// Scaling factors, weight cache and scope bookkeeping for one process.
#[derive(Debug, Default)]
pub struct Fp8State {
    store: ScalingFactorStore,
    weight_cache: WeightCache,
    /// Recipe of the outermost enabled scope.
    active: Option<DelayedScaling>,
    /// Number of open enabled scopes.
    depth: usize,
    /// Amax observations of the open scope, max-merged per key.
    pending: HashMap<TensorKey, f32>,
    /// Weights cast in the open scope; dropped from the cache if it fails.
    fresh_casts: Vec<ParamId>,
}

impl Fp8State {
    /// Fresh state with no scaling history.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a top-level autocast scope.
    ///
    /// `group` is the data-parallel group amaxes are synchronized over at exit.
    /// With `enabled = false` the scope is a pass-through.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if the recipe fails validation.
    pub fn autocast<'a>(
        &'a mut self,
        recipe: &DelayedScaling,
        enabled: bool,
        group: Option<&'a dyn CommGroup>,
    ) -> Result<AutocastScope<'a>> {
        // No scope can be alive while `self` is mutably borrowed here, so any
        // leftover bookkeeping comes from a leaked scope.
        self.discard();
        AutocastScope::open(self, recipe, enabled, group)
    }

    /// Scaling factor store.
    #[must_use]
    pub fn store(&self) -> &ScalingFactorStore {
        &self.store
    }

    /// FP8 weight cache.
    #[must_use]
    pub fn weight_cache(&self) -> &WeightCache {
        &self.weight_cache
    }

    /// Mutable FP8 weight cache, e.g. to invalidate it at an iteration start.
    pub fn weight_cache_mut(&mut self) -> &mut WeightCache {
        &mut self.weight_cache
    }

    fn release(&mut self) {
        self.active = None;
        self.depth = 0;
        self.pending.clear();
        self.fresh_casts.clear();
    }

    /// Release after a failed or abandoned scope.
    ///
    /// Weights cast in the scope lose their cache entries, since their amax
    /// observations are discarded with it.
    fn discard(&mut self) {
        for id in self.fresh_casts.drain(..) {
            self.weight_cache.remove(id);
        }
        self.release();
    }
}

/// RAII guard over an active autocast region.
///
/// Release is guaranteed on every path: [`AutocastScope::exit`] commits,
/// dropping without `exit` discards.
pub struct AutocastScope<'a> {
    state: &'a mut Fp8State,
    recipe: DelayedScaling,
    enabled: bool,
    group: Option<&'a dyn CommGroup>,
    /// Counted in `state.depth`.
    registered: bool,
    /// Outermost enabled scope; synchronizes and commits at exit.
    owns_sync: bool,
    closed: bool,
}

impl<'a> AutocastScope<'a> {
    fn open(
        state: &'a mut Fp8State,
        recipe: &DelayedScaling,
        enabled: bool,
        group: Option<&'a dyn CommGroup>,
    ) -> Result<Self> {
        let mut scope = Self {
            state,
            recipe: recipe.clone(),
            enabled,
            group,
            registered: false,
            owns_sync: false,
            closed: false,
        };
        if !enabled {
            return Ok(scope);
        }

        match &scope.state.active {
            Some(active) if active != recipe => {
                return Err(Fp8Error::RecipeConflict {
                    active: active.to_string(),
                    requested: recipe.to_string(),
                });
            }
            Some(_) => {}
            None => {
                recipe.validate()?;
                scope.state.active = Some(recipe.clone());
                scope.state.pending.clear();
                scope.owns_sync = true;
            }
        }
        scope.state.depth += 1;
        scope.registered = true;
        tracing::debug!(depth = scope.state.depth, recipe = %recipe, "entered FP8 autocast");
        Ok(scope)
    }

    /// Open a nested scope.
    ///
    /// An enabled nested scope must use the active recipe; its observations
    /// are committed by the outermost scope.
    ///
    /// # Errors
    ///
    /// Returns `RecipeConflict` if `recipe` differs from the active recipe.
    pub fn nested(&mut self, recipe: &DelayedScaling, enabled: bool) -> Result<AutocastScope<'_>> {
        AutocastScope::open(self.state, recipe, enabled, self.group)
    }

    /// Whether FP8 casting is active in this scope.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Recipe of this scope.
    #[must_use]
    pub fn recipe(&self) -> &DelayedScaling {
        &self.recipe
    }

    /// Group amaxes are synchronized over.
    #[must_use]
    pub fn group(&self) -> Option<&'a dyn CommGroup> {
        self.group
    }

    /// Current scale for `key`; identity if never observed.
    #[must_use]
    pub fn scale(&self, key: &TensorKey) -> f32 {
        self.state.store.scale(key)
    }

    /// Record an amax for `key`. No-op when disabled.
    pub fn record_amax(&mut self, key: &TensorKey, amax: f32) {
        if !self.enabled {
            return;
        }
        self.state
            .pending
            .entry(key.clone())
            .and_modify(|current| {
                *current = if current.is_nan() || amax.is_nan() {
                    f32::NAN
                } else {
                    current.max(amax)
                };
            })
            .or_insert(amax);
    }

    /// Quantize `tensor` with the current scale of `key` and record its amax.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` if the scope is disabled.
    pub fn cast(&mut self, key: &TensorKey, tensor: &Tensor) -> Result<Fp8Tensor> {
        self.ensure_enabled("cast")?;
        let dtype = key.role().dtype(&self.recipe);
        let (quantized, amax) = Fp8Tensor::quantize(tensor, dtype, self.scale(key))?;
        self.record_amax(key, amax);
        Ok(quantized)
    }

    /// FP8 weight for `param`, served from the weight cache according to `mode`.
    ///
    /// A fresh cast records the weight amax; a cache hit records nothing.
    ///
    /// # Errors
    ///
    /// - `InvalidState` if the scope is disabled
    /// - `CacheMiss` in `ReuseCached` mode without a valid cached entry
    pub fn cast_weight(&mut self, param: &Parameter, mode: MicrobatchMode) -> Result<Fp8Tensor> {
        self.ensure_enabled("cast_weight")?;
        let key = TensorKey::weight(param.name());
        let dtype = key.role().dtype(&self.recipe);
        let scale = self.scale(&key);

        let mut observed = None;
        let quantized = self
            .state
            .weight_cache
            .get_or_cast(param, &self.recipe, mode, || {
                let (quantized, amax) = Fp8Tensor::quantize(param.value(), dtype, scale)?;
                observed = Some(amax);
                Ok(quantized)
            })?;

        if let Some(amax) = observed {
            self.record_amax(&key, amax);
            self.state.fresh_casts.push(param.id());
        }
        Ok(quantized)
    }

    /// Close the scope.
    ///
    /// The outermost enabled scope all-reduces pending amaxes over its group
    /// and commits them; nested and disabled scopes only release.
    ///
    /// # Errors
    ///
    /// Returns `Communication` if synchronization fails or replicas observed
    /// different tensors; no scale entry is modified in that case.
    pub fn exit(mut self) -> Result<()> {
        self.closed = true;
        if !self.registered {
            return Ok(());
        }
        if !self.owns_sync {
            self.state.depth -= 1;
            return Ok(());
        }

        let result = self.synchronize_and_commit();
        if result.is_ok() {
            self.state.release();
        } else {
            self.state.discard();
        }
        result
    }

    fn synchronize_and_commit(&mut self) -> Result<()> {
        let mut observations: Vec<(TensorKey, f32)> = self.state.pending.drain().collect();
        observations.sort_by(|a, b| a.0.cmp(&b.0));

        if let Some(group) = self.group {
            // The key-set fingerprint rides along in the same reduction: every
            // replica holds the same fingerprint iff max(f) == f == -max(-f).
            let fingerprint = key_fingerprint(&observations);
            let mut values: Vec<f32> = fingerprint
                .iter()
                .copied()
                .chain(fingerprint.iter().map(|f| -f))
                .chain(observations.iter().map(|(_, v)| *v))
                .collect();
            group.all_reduce_max(&mut values)?;

            let (max, neg_max) = values.split_at(FINGERPRINT_LEN);
            let agree = fingerprint
                .iter()
                .zip(max)
                .zip(neg_max)
                .all(|((f, hi), lo)| f == hi && *f == -lo);
            if !agree {
                return Err(Fp8Error::Communication(format!(
                    "replicas observed different FP8 tensors ({} local)",
                    observations.len()
                )));
            }

            let synced = &values[2 * FINGERPRINT_LEN..];
            for ((_, amax), synced) in observations.iter_mut().zip(synced) {
                *amax = *synced;
            }
        }

        tracing::debug!(
            tensors = observations.len(),
            synchronized = self.group.is_some(),
            "committing FP8 amax observations"
        );
        self.state.store.commit(&self.recipe, observations);
        Ok(())
    }

    fn ensure_enabled(&self, op: &str) -> Result<()> {
        if self.enabled {
            Ok(())
        } else {
            Err(Fp8Error::InvalidState(format!(
                "{op} called inside a disabled autocast scope"
            )))
        }
    }
}

impl Drop for AutocastScope<'_> {
    fn drop(&mut self) {
        if self.closed || !self.registered {
            return;
        }
        if self.owns_sync {
            if !self.state.pending.is_empty() {
                tracing::warn!(
                    discarded = self.state.pending.len(),
                    "FP8 autocast scope dropped without exit, discarding amax observations"
                );
            }
            self.state.discard();
        } else {
            self.state.depth -= 1;
        }
    }
}

/// Number of 16-bit chunks of the key-set hash.
const FINGERPRINT_LEN: usize = 4;

/// Hash of the sorted key set, split into chunks exactly representable as `f32`.
#[allow(clippy::cast_possible_truncation)]
fn key_fingerprint(observations: &[(TensorKey, f32)]) -> [f32; FINGERPRINT_LEN] {
    let mut hasher = DefaultHasher::new();
    observations.len().hash(&mut hasher);
    for (key, _) in observations {
        key.hash(&mut hasher);
    }
    let hash = hasher.finish();
    std::array::from_fn(|i| f32::from(((hash >> (16 * i)) & 0xFFFF) as u16))
}

/// Run `f` inside an autocast scope.
///
/// Commits on `Ok`, discards observations on `Err`.
///
/// # Errors
///
/// Returns the error of `f`, or of entering/exiting the scope.
pub fn fp8_autocast<T, F>(
    state: &mut Fp8State,
    recipe: &DelayedScaling,
    enabled: bool,
    group: Option<&dyn CommGroup>,
    f: F,
) -> Result<T>
where
    F: FnOnce(&mut AutocastScope<'_>) -> Result<T>,
{
    let mut scope = state.autocast(recipe, enabled, group)?;
    let value = f(&mut scope)?;
    scope.exit()?;
    Ok(value)
}
