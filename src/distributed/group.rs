// SPDX-License-Identifier: MIT
// Copyright 2026 Tyler Zervas

//! The collective communication interface.

use candle_core::Tensor;

use crate::error::Result;

/// A process group providing the collectives the engine needs.
///
/// Every member must issue the same collectives in the same order. Any
/// failure is reported as [`Fp8Error::Communication`](crate::Fp8Error::Communication)
/// and is not retried.
pub trait CommGroup: Send + Sync {
    /// Rank of this participant.
    fn rank(&self) -> usize;

    /// Number of participants.
    fn world_size(&self) -> usize;

    /// Element-wise maximum across all participants, in place.
    ///
    /// # Errors
    ///
    /// Fails if peers disagree on the slice length or a peer is unreachable.
    fn all_reduce_max(&self, values: &mut [f32]) -> Result<()>;

    /// Element-wise sum across all participants.
    ///
    /// # Errors
    ///
    /// Fails on shape disagreement or an unreachable peer.
    fn all_reduce_sum(&self, tensor: &Tensor) -> Result<Tensor>;

    /// Concatenate every participant's tensor along `dim`, in rank order.
    ///
    /// # Errors
    ///
    /// Fails on shape disagreement or an unreachable peer.
    fn all_gather(&self, tensor: &Tensor, dim: usize) -> Result<Tensor>;

    /// Sum across participants, then keep this rank's chunk along `dim`.
    ///
    /// # Errors
    ///
    /// Fails if `dim` is not divisible by the world size, on shape
    /// disagreement, or on an unreachable peer.
    fn reduce_scatter(&self, tensor: &Tensor, dim: usize) -> Result<Tensor>;
}

/// Single-participant group.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalGroup;

impl CommGroup for LocalGroup {
    fn rank(&self) -> usize {
        0
    }

    fn world_size(&self) -> usize {
        1
    }

    fn all_reduce_max(&self, _values: &mut [f32]) -> Result<()> {
        Ok(())
    }

    fn all_reduce_sum(&self, tensor: &Tensor) -> Result<Tensor> {
        Ok(tensor.clone())
    }

    fn all_gather(&self, tensor: &Tensor, _dim: usize) -> Result<Tensor> {
        Ok(tensor.clone())
    }

    fn reduce_scatter(&self, tensor: &Tensor, _dim: usize) -> Result<Tensor> {
        Ok(tensor.clone())
    }
}
