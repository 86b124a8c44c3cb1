// SPDX-License-Identifier: MIT
// Copyright 2026 Tyler Zervas

//! Error types for fp8-train-rs.

use thiserror::Error;

/// Result type alias for fp8-train-rs operations.
pub type Result<T> = std::result::Result<T, Fp8Error>;

/// Errors that can occur in fp8-train-rs operations.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Fp8Error {
    /// A cached FP8 weight was requested before it was cast.
    #[error("weight cache miss for `{param}`: {reason}")]
    CacheMiss {
        /// Parameter name
        param: String,
        /// Why the cache could not serve the request
        reason: String,
    },

    /// Gradient accumulation requested on a parameter with no buffer attached.
    #[error("no gradient accumulation buffer attached to `{param}`")]
    UninitializedBuffer {
        /// Parameter name
        param: String,
    },

    /// Shape mismatch.
    #[error("shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        /// Expected shape
        expected: Vec<usize>,
        /// Actual shape
        actual: Vec<usize>,
    },

    /// Nested autocast scope requested with a recipe different from the active one.
    #[error("recipe conflict: active scope uses {active}, nested scope requested {requested}")]
    RecipeConflict {
        /// Recipe of the active scope
        active: String,
        /// Recipe of the rejected nested scope
        requested: String,
    },

    /// Collective communication failed or timed out.
    #[error("communication failure: {0}")]
    Communication(String),

    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Operation called in the wrong lifecycle state.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Candle error.
    #[error("candle error: {0}")]
    Candle(#[from] candle_core::Error),
}

impl Fp8Error {
    /// Whether the error leaves shared collective state unusable.
    ///
    /// Communication failures are never retried internally; everything else is
    /// a local, caller-correctable error.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Communication(_))
    }
}
