// SPDX-License-Identifier: MIT
// Copyright 2026 Tyler Zervas

//! Parallel layout configuration and partition checks.

use candle_core::Tensor;

use crate::error::{Fp8Error, Result};

/// Dimension index of the sequence axis.
pub const SEQ_DIM: usize = 0;

/// Tensor/sequence parallel layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParallelConfig {
    /// Full hidden size.
    pub hidden_size: usize,
    /// Number of tensor-parallel partitions.
    pub tensor_parallel_size: usize,
    /// Shard non-tensor-parallel regions along the sequence axis.
    pub sequence_parallel: bool,
}

impl Default for ParallelConfig {
    fn default() -> Self {
        Self {
            hidden_size: 768,
            tensor_parallel_size: 1,
            sequence_parallel: false,
        }
    }
}

impl ParallelConfig {
    /// Validate the layout.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if:
    /// - `tensor_parallel_size` is zero
    /// - `hidden_size` is not divisible by `tensor_parallel_size`
    /// - sequence parallelism is requested without tensor parallelism
    pub fn validate(&self) -> Result<()> {
        if self.tensor_parallel_size == 0 {
            return Err(Fp8Error::InvalidConfig(
                "tensor_parallel_size must be at least 1".to_string(),
            ));
        }
        if self.hidden_size % self.tensor_parallel_size != 0 {
            return Err(Fp8Error::InvalidConfig(format!(
                "hidden_size {} is not divisible by tensor_parallel_size {}",
                self.hidden_size, self.tensor_parallel_size
            )));
        }
        if self.sequence_parallel && self.tensor_parallel_size == 1 {
            return Err(Fp8Error::InvalidConfig(
                "sequence_parallel requires tensor_parallel_size > 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Partition scheme for this layout.
    #[must_use]
    pub fn scheme(&self) -> PartitionScheme {
        PartitionScheme {
            hidden_size: self.hidden_size,
            partitions: self.tensor_parallel_size,
        }
    }
}

/// Even split of the hidden (and sequence) axis across partitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionScheme {
    /// Full hidden size.
    pub hidden_size: usize,
    /// Number of partitions.
    pub partitions: usize,
}

impl PartitionScheme {
    /// Hidden columns owned by each partition.
    #[must_use]
    pub fn local_hidden(&self) -> usize {
        self.hidden_size / self.partitions
    }

    /// Check that the last axis of `tensor` has exactly `columns` entries.
    ///
    /// # Errors
    ///
    /// Returns `ShapeMismatch` otherwise.
    pub fn expect_columns(tensor: &Tensor, columns: usize) -> Result<()> {
        let dims = tensor.dims();
        match dims.last() {
            Some(&last) if last == columns => Ok(()),
            _ => {
                let mut expected = dims.to_vec();
                match expected.last_mut() {
                    Some(last) => *last = columns,
                    None => expected.push(columns),
                }
                Err(Fp8Error::ShapeMismatch {
                    expected,
                    actual: dims.to_vec(),
                })
            }
        }
    }

    /// Check that `tensor` holds exactly one partition of the hidden axis.
    ///
    /// # Errors
    ///
    /// Returns `ShapeMismatch` otherwise.
    pub fn expect_local_columns(&self, tensor: &Tensor) -> Result<()> {
        Self::expect_columns(tensor, self.local_hidden())
    }

    /// Check that `tensor` spans the full hidden axis.
    ///
    /// # Errors
    ///
    /// Returns `ShapeMismatch` otherwise.
    pub fn expect_full_columns(&self, tensor: &Tensor) -> Result<()> {
        Self::expect_columns(tensor, self.hidden_size)
    }

    /// Rows of the sequence axis owned by each partition.
    ///
    /// # Errors
    ///
    /// Returns `ShapeMismatch` if `seq_len` is not divisible by the partition count.
    pub fn local_seq(&self, tensor: &Tensor) -> Result<usize> {
        let seq_len = tensor.dim(SEQ_DIM)?;
        if seq_len % self.partitions == 0 {
            Ok(seq_len / self.partitions)
        } else {
            let mut expected = tensor.dims().to_vec();
            expected[SEQ_DIM] = seq_len.next_multiple_of(self.partitions);
            Err(Fp8Error::ShapeMismatch {
                expected,
                actual: tensor.dims().to_vec(),
            })
        }
    }

    /// Slice partition `rank` out of a full tensor along the hidden axis.
    ///
    /// # Errors
    ///
    /// Returns `ShapeMismatch` if `tensor` does not span the full hidden axis.
    pub fn split_columns(&self, tensor: &Tensor, rank: usize) -> Result<Tensor> {
        self.expect_full_columns(tensor)?;
        let dim = tensor.rank() - 1;
        let width = self.local_hidden();
        Ok(tensor.narrow(dim, rank * width, width)?)
    }
}
