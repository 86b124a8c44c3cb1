// SPDX-License-Identifier: MIT
// Copyright 2026 Tyler Zervas

//! Per-process scaling factor table.
//!
//! Every FP8-cast tensor is identified by a [`TensorKey`]. The store keeps one
//! [`ScaleEntry`] per key and only changes it through [`ScalingFactorStore::commit`],
//! which the autocast scope calls once at its outermost exit.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::amax::AmaxHistory;
use crate::fp8::Fp8Dtype;
use crate::recipe::DelayedScaling;

/// What a cast tensor is used for. Selects the forward or backward encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TensorRole {
    /// Activation entering a GEMM.
    Input,
    /// Layer weight.
    Weight,
    /// Gradient flowing back into a GEMM.
    GradOutput,
}

impl TensorRole {
    /// Encoding for this role under `recipe`.
    #[must_use]
    pub fn dtype(self, recipe: &DelayedScaling) -> Fp8Dtype {
        match self {
            Self::Input | Self::Weight => recipe.fp8_format.forward_dtype(),
            Self::GradOutput => recipe.fp8_format.backward_dtype(),
        }
    }
}

/// Identity of an FP8-cast tensor.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TensorKey {
    name: Arc<str>,
    role: TensorRole,
}

impl TensorKey {
    /// Key for `name` in `role`.
    pub fn new(name: impl Into<Arc<str>>, role: TensorRole) -> Self {
        Self {
            name: name.into(),
            role,
        }
    }

    /// Key for an activation.
    pub fn input(name: impl Into<Arc<str>>) -> Self {
        Self::new(name, TensorRole::Input)
    }

    /// Key for a weight.
    pub fn weight(name: impl Into<Arc<str>>) -> Self {
        Self::new(name, TensorRole::Weight)
    }

    /// Key for an output gradient.
    pub fn grad_output(name: impl Into<Arc<str>>) -> Self {
        Self::new(name, TensorRole::GradOutput)
    }

    /// Owning tensor name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Role.
    #[must_use]
    pub fn role(&self) -> TensorRole {
        self.role
    }
}

impl fmt::Display for TensorKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{:?}", self.name, self.role)
    }
}

/// Current scale and the history it was derived from.
#[derive(Debug, Clone, PartialEq)]
pub struct ScaleEntry {
    /// Multiplier applied before FP8 encoding.
    pub scale: f32,
    /// `1 / scale`, applied after decoding.
    pub inverse_scale: f32,
    /// Past amax observations.
    pub amax_history: AmaxHistory,
}

impl ScaleEntry {
    /// Identity-scaled entry with an empty history.
    #[must_use]
    pub fn new(history_len: usize) -> Self {
        Self {
            scale: 1.0,
            inverse_scale: 1.0,
            amax_history: AmaxHistory::new(history_len),
        }
    }

    fn refresh(&mut self, recipe: &DelayedScaling, fp8_max: f32) {
        let amax = recipe.amax_compute_algo.reduce(&self.amax_history.to_vec());
        let scale = recipe.scaling_factor_compute_algo.compute(
            amax,
            self.scale,
            fp8_max,
            recipe.margin,
        );
        self.scale = scale;
        self.inverse_scale = 1.0 / scale;
    }
}

/// Table of scale entries for one process.
///
/// Not shared across processes: replicas agree on scales only because they
/// commit the same all-reduced observations.
#[derive(Debug, Clone, Default)]
pub struct ScalingFactorStore {
    entries: HashMap<TensorKey, ScaleEntry>,
    commits: u64,
}

impl ScalingFactorStore {
    /// Empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current scale for `key`, identity if never observed.
    #[must_use]
    pub fn scale(&self, key: &TensorKey) -> f32 {
        self.entries.get(key).map_or(1.0, |e| e.scale)
    }

    /// Entry for `key`.
    #[must_use]
    pub fn get(&self, key: &TensorKey) -> Option<&ScaleEntry> {
        self.entries.get(key)
    }

    /// Number of tracked tensors.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no tensor has been tracked yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of successful commits so far.
    #[must_use]
    pub fn commits(&self) -> u64 {
        self.commits
    }

    /// Fold one scope's observations into the histories.
    ///
    /// Each key must appear at most once. When the commit count is a multiple
    /// of `recipe.interval`, every entry is rescaled, including entries with
    /// no observation in this commit.
    pub fn commit<I>(&mut self, recipe: &DelayedScaling, observations: I)
    where
        I: IntoIterator<Item = (TensorKey, f32)>,
    {
        self.commits += 1;

        for (key, amax) in observations {
            let entry = self
                .entries
                .entry(key)
                .or_insert_with(|| ScaleEntry::new(recipe.amax_history_len));
            if entry.amax_history.capacity() != recipe.amax_history_len {
                entry.amax_history.set_capacity(recipe.amax_history_len);
            }
            entry.amax_history.push(amax);
        }

        if self.commits % u64::from(recipe.interval.max(1)) != 0 {
            return;
        }
        for (key, entry) in &mut self.entries {
            if entry.amax_history.capacity() != recipe.amax_history_len {
                entry.amax_history.set_capacity(recipe.amax_history_len);
            }
            entry.refresh(recipe, key.role().dtype(recipe).max_value());
        }
    }

    /// Drop every entry.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.commits = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recipe::{AmaxComputeAlgo, Fp8Format};

    #[test]
    fn test_missing_key_has_identity_scale() {
        let store = ScalingFactorStore::new();
        assert_eq!(store.scale(&TensorKey::input("fc1")), 1.0);
        assert!(store.get(&TensorKey::input("fc1")).is_none());
    }

    #[test]
    fn test_commit_updates_scale() {
        let recipe = DelayedScaling::e4m3();
        let mut store = ScalingFactorStore::new();
        let key = TensorKey::input("fc1");

        store.commit(&recipe, [(key.clone(), 4.0)]);

        let entry = store.get(&key).unwrap();
        assert_eq!(entry.scale, 112.0);
        assert_eq!(entry.inverse_scale, 1.0 / 112.0);
        assert_eq!(store.commits(), 1);
    }

    #[test]
    fn test_gradients_use_backward_format() {
        let recipe = DelayedScaling::hybrid();
        let mut store = ScalingFactorStore::new();
        let key = TensorKey::grad_output("fc1");

        store.commit(&recipe, [(key.clone(), 57344.0)]);
        assert_eq!(store.scale(&key), 1.0);
    }

    #[test]
    fn test_interval_delays_refresh() {
        let recipe = DelayedScaling {
            interval: 2,
            ..DelayedScaling::e4m3()
        };
        let mut store = ScalingFactorStore::new();
        let key = TensorKey::weight("w");

        store.commit(&recipe, [(key.clone(), 2.0)]);
        assert_eq!(store.scale(&key), 1.0);
        store.commit(&recipe, [(key.clone(), 4.0)]);
        assert_eq!(store.scale(&key), 112.0);
    }

    #[test]
    fn test_interval_refreshes_unobserved_entries() {
        let recipe = DelayedScaling {
            interval: 2,
            ..DelayedScaling::e4m3()
        };
        let mut store = ScalingFactorStore::new();
        let weight = TensorKey::weight("w");
        let input = TensorKey::input("x");

        // The weight is only observed on odd commits, which never refresh.
        for step in 0..4 {
            let mut observations = vec![(input.clone(), 2.0)];
            if step % 2 == 0 {
                observations.push((weight.clone(), 4.0));
            }
            store.commit(&recipe, observations);
        }

        assert_eq!(store.scale(&input), 224.0);
        assert_eq!(store.scale(&weight), 112.0);
    }

    #[test]
    fn test_history_resizes_with_recipe() {
        let mut store = ScalingFactorStore::new();
        let key = TensorKey::input("x");
        let long = DelayedScaling::new(Fp8Format::E4M3, 4, AmaxComputeAlgo::Max);
        for v in [1.0, 8.0, 2.0, 3.0] {
            store.commit(&long, [(key.clone(), v)]);
        }
        let short = DelayedScaling::new(Fp8Format::E4M3, 2, AmaxComputeAlgo::Max);
        store.commit(&short, [(key.clone(), 1.0)]);

        let entry = store.get(&key).unwrap();
        assert_eq!(entry.amax_history.to_vec(), vec![3.0, 1.0]);
        assert_eq!(entry.scale, 448.0 / 3.0);
    }
}
