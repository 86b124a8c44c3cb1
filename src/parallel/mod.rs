// SPDX-License-Identifier: MIT
// Copyright 2026 Tyler Zervas

//! Tensor and sequence parallel execution.
//!
//! Activations use the `[seq, batch, hidden]` layout. With tensor parallel
//! size `tp`:
//!
//! | Region             | Local input            | Local output      | Forward comm            | Backward comm          |
//! |--------------------|------------------------|-------------------|-------------------------|------------------------|
//! | `ColumnParallel`   | `[.., hidden]`         | `[.., hidden/tp]` | all-gather(hidden)      | split(hidden)          |
//! | `RowParallel`      | `[.., hidden/tp]`      | `[.., hidden]`    | all-reduce / reduce-scatter(seq) | identity / all-gather(seq) |
//! | `SequenceParallel` | `[seq/tp, .., hidden]` | same as input     | all-gather(seq)         | reduce-scatter(seq)    |
//! | `Replicated`       | `[.., hidden]`         | same as input     | identity                | all-reduce             |
//!
//! Sequence parallelism covers regions that cannot be split along the hidden
//! dimension (normalization, dropout) and is only valid with `tp > 1`.
//! Without it, such regions are `Replicated`: every rank holds the full
//! activation and the partial input gradients of the following column-parallel
//! region are summed on the way back.
//!
//! Data parallelism is external. Its group is the one to pass to
//! [`Fp8State::autocast`](crate::autocast::Fp8State::autocast) so FP8 scales
//! are synchronized once per effective batch.

pub mod config;
pub mod coordinator;

pub use config::{ParallelConfig, PartitionScheme};
pub use coordinator::{ParallelCoordinator, RegionKind, StepPhase};
