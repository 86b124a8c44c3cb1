// SPDX-License-Identifier: MIT
// Copyright 2026 Tyler Zervas

//! Boundary communication and the per-step state machine.
//!
//! ```text
//! Idle -> ForwardLocal -> ForwardComm -> ReadyForBackward
//!      -> BackwardComm -> BackwardLocal -> Idle
//! ```
//!
//! A failure in a communication phase moves the coordinator to `Failed`,
//! which only [`ParallelCoordinator::reset`] leaves. Shape violations detected
//! before communicating leave the phase as it was before the call. An error
//! from the forward `local` closure returns to `Idle`; an error from the
//! backward `local` closure ends the step and also returns to `Idle`, since
//! the gradients were already communicated.

use std::sync::Arc;

use candle_core::Tensor;

use super::config::{ParallelConfig, PartitionScheme, SEQ_DIM};
use crate::distributed::CommGroup;
use crate::error::{Fp8Error, Result};

/// Training-step phase of a coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepPhase {
    /// Waiting for a forward pass.
    Idle,
    /// Running local forward compute.
    ForwardLocal,
    /// Communicating forward outputs.
    ForwardComm,
    /// Forward done, waiting for gradients.
    ReadyForBackward,
    /// Communicating output gradients.
    BackwardComm,
    /// Running local backward compute.
    BackwardLocal,
    /// A collective failed; requires [`ParallelCoordinator::reset`].
    Failed,
}

/// Partitioning of the wrapped module.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionKind {
    /// Weight split along outputs: full-hidden input, local-hidden output.
    ColumnParallel,
    /// Weight split along inputs: local-hidden input, partial-sum output.
    RowParallel,
    /// Sequence-sharded region (norm, dropout) feeding a tensor-parallel region.
    SequenceParallel,
    /// Replicated region feeding a tensor-parallel region without sequence
    /// parallelism. Forward is the identity; backward all-reduces gradients.
    Replicated,
}

/// Wraps a module's forward/backward with tensor/sequence parallel communication.
pub struct ParallelCoordinator {
    config: ParallelConfig,
    scheme: PartitionScheme,
    region: RegionKind,
    group: Arc<dyn CommGroup>,
    phase: StepPhase,
}

impl ParallelCoordinator {
    /// Create a coordinator over the tensor-parallel `group`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if:
    /// - the config fails validation
    /// - the group size differs from `tensor_parallel_size`
    /// - a `SequenceParallel` region is requested without sequence parallelism
    pub fn new(
        config: ParallelConfig,
        region: RegionKind,
        group: Arc<dyn CommGroup>,
    ) -> Result<Self> {
        config.validate()?;
        if group.world_size() != config.tensor_parallel_size {
            return Err(Fp8Error::InvalidConfig(format!(
                "group has {} ranks but tensor_parallel_size is {}",
                group.world_size(),
                config.tensor_parallel_size
            )));
        }
        if region == RegionKind::SequenceParallel && !config.sequence_parallel {
            return Err(Fp8Error::InvalidConfig(
                "SequenceParallel region requires sequence_parallel".to_string(),
            ));
        }

        Ok(Self {
            scheme: config.scheme(),
            config,
            region,
            group,
            phase: StepPhase::Idle,
        })
    }

    /// Current phase.
    #[must_use]
    pub fn phase(&self) -> StepPhase {
        self.phase
    }

    /// Region kind.
    #[must_use]
    pub fn region(&self) -> RegionKind {
        self.region
    }

    /// Layout.
    #[must_use]
    pub fn config(&self) -> &ParallelConfig {
        &self.config
    }

    /// Partition scheme derived from the layout.
    #[must_use]
    pub fn scheme(&self) -> &PartitionScheme {
        &self.scheme
    }

    /// Rank within the tensor-parallel group.
    #[must_use]
    pub fn rank(&self) -> usize {
        self.group.rank()
    }

    /// Return to `Idle`, e.g. after a failure was handled externally.
    pub fn reset(&mut self) {
        if self.phase != StepPhase::Idle {
            tracing::debug!(from = ?self.phase, "resetting parallel coordinator");
        }
        self.phase = StepPhase::Idle;
    }

    /// Run `local` on `input` and communicate its output.
    ///
    /// # Errors
    ///
    /// - `InvalidState` if not `Idle`
    /// - `ShapeMismatch` if `input` or the local output violates the partition
    /// - `Communication` if the collective fails (coordinator becomes `Failed`)
    /// - any error from `local`
    pub fn forward<F>(&mut self, input: &Tensor, local: F) -> Result<Tensor>
    where
        F: FnOnce(&Tensor) -> Result<Tensor>,
    {
        self.expect_phase(StepPhase::Idle, "forward")?;

        self.phase = StepPhase::ForwardLocal;
        let local_output = match self.run_forward_local(input, local) {
            Ok(output) => output,
            Err(e) => {
                self.phase = StepPhase::Idle;
                return Err(e);
            }
        };

        self.phase = StepPhase::ForwardComm;
        let output = self.communicate(|c| c.forward_comm(&local_output))?;

        self.phase = StepPhase::ReadyForBackward;
        Ok(output)
    }

    /// Communicate `grad_output` and run `local` on the result.
    ///
    /// The step ends once `local` runs: the coordinator is `Idle` afterwards
    /// whether `local` succeeds or not.
    ///
    /// # Errors
    ///
    /// - `InvalidState` if not `ReadyForBackward`
    /// - `ShapeMismatch` if `grad_output` violates the partition (phase unchanged)
    /// - `Communication` if the collective fails (coordinator becomes `Failed`)
    /// - any error from `local`
    pub fn backward<F>(&mut self, grad_output: &Tensor, local: F) -> Result<Tensor>
    where
        F: FnOnce(&Tensor) -> Result<Tensor>,
    {
        self.expect_phase(StepPhase::ReadyForBackward, "backward")?;
        self.check_grad_output(grad_output)?;

        self.phase = StepPhase::BackwardComm;
        let grad = self.communicate(|c| c.backward_comm(grad_output))?;

        self.phase = StepPhase::BackwardLocal;
        let result = local(&grad);
        self.phase = StepPhase::Idle;
        result
    }

    fn expect_phase(&self, expected: StepPhase, op: &str) -> Result<()> {
        if self.phase == expected {
            Ok(())
        } else if self.phase == StepPhase::Failed {
            Err(Fp8Error::InvalidState(format!(
                "{op} on a failed coordinator; reset required"
            )))
        } else {
            Err(Fp8Error::InvalidState(format!(
                "{op} called in phase {:?}, expected {expected:?}",
                self.phase
            )))
        }
    }

    fn communicate<F>(&mut self, f: F) -> Result<Tensor>
    where
        F: FnOnce(&Self) -> Result<Tensor>,
    {
        f(self).map_err(|e| {
            tracing::warn!(phase = ?self.phase, error = %e, "collective failed, coordinator entering Failed");
            self.phase = StepPhase::Failed;
            e
        })
    }

    fn run_forward_local<F>(&self, input: &Tensor, local: F) -> Result<Tensor>
    where
        F: FnOnce(&Tensor) -> Result<Tensor>,
    {
        match self.region {
            RegionKind::ColumnParallel | RegionKind::Replicated => {
                self.scheme.expect_full_columns(input)?;
            }
            RegionKind::RowParallel => {
                self.scheme.expect_local_columns(input)?;
                if self.config.sequence_parallel {
                    self.scheme.local_seq(input)?;
                }
            }
            RegionKind::SequenceParallel => self.scheme.expect_full_columns(input)?,
        }

        let output = local(input)?;

        let columns = match self.region {
            RegionKind::ColumnParallel => self.scheme.local_hidden(),
            _ => self.scheme.hidden_size,
        };
        let mut expected = input.dims().to_vec();
        if let Some(last) = expected.last_mut() {
            *last = columns;
        }
        if output.dims() != expected.as_slice() {
            return Err(Fp8Error::ShapeMismatch {
                expected,
                actual: output.dims().to_vec(),
            });
        }
        Ok(output)
    }

    fn forward_comm(&self, local_output: &Tensor) -> Result<Tensor> {
        match self.region {
            RegionKind::ColumnParallel => {
                let gathered = self
                    .group
                    .all_gather(local_output, local_output.rank() - 1)?;
                self.scheme.expect_full_columns(&gathered)?;
                Ok(gathered)
            }
            RegionKind::RowParallel if self.config.sequence_parallel => {
                self.group.reduce_scatter(local_output, SEQ_DIM)
            }
            RegionKind::RowParallel => self.group.all_reduce_sum(local_output),
            RegionKind::SequenceParallel => self.group.all_gather(local_output, SEQ_DIM),
            RegionKind::Replicated => Ok(local_output.clone()),
        }
    }

    fn check_grad_output(&self, grad_output: &Tensor) -> Result<()> {
        self.scheme.expect_full_columns(grad_output)?;
        if self.region == RegionKind::SequenceParallel {
            self.scheme.local_seq(grad_output)?;
        }
        Ok(())
    }

    fn backward_comm(&self, grad_output: &Tensor) -> Result<Tensor> {
        match self.region {
            RegionKind::ColumnParallel => self.scheme.split_columns(grad_output, self.rank()),
            RegionKind::RowParallel if self.config.sequence_parallel => {
                self.group.all_gather(grad_output, SEQ_DIM)
            }
            RegionKind::RowParallel => Ok(grad_output.clone()),
            RegionKind::SequenceParallel => self.group.reduce_scatter(grad_output, SEQ_DIM),
            RegionKind::Replicated => self.group.all_reduce_sum(grad_output),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributed::{LocalGroup, ThreadGroup};
    use candle_core::{DType, Device};
    use std::thread;
    use std::time::Duration;

    fn tp_config(hidden_size: usize, tp: usize) -> ParallelConfig {
        ParallelConfig {
            hidden_size,
            tensor_parallel_size: tp,
            sequence_parallel: false,
        }
    }

    fn values(t: &Tensor) -> Vec<f32> {
        t.flatten_all().unwrap().to_vec1().unwrap()
    }

    #[test]
    fn test_group_size_must_match() {
        let err = ParallelCoordinator::new(
            tp_config(8, 2),
            RegionKind::ColumnParallel,
            Arc::new(LocalGroup),
        )
        .err()
        .unwrap();
        assert!(matches!(err, Fp8Error::InvalidConfig(_)));
    }

    #[test]
    fn test_state_machine_round_trip() {
        let mut coord = ParallelCoordinator::new(
            tp_config(8, 1),
            RegionKind::RowParallel,
            Arc::new(LocalGroup),
        )
        .unwrap();
        let x = Tensor::ones((2, 1, 8), DType::F32, &Device::Cpu).unwrap();

        assert_eq!(coord.phase(), StepPhase::Idle);
        let y = coord.forward(&x, |x| Ok((x * 2.0)?)).unwrap();
        assert_eq!(coord.phase(), StepPhase::ReadyForBackward);
        assert!(values(&y).iter().all(|v| *v == 2.0));

        assert!(matches!(
            coord.forward(&x, |x| Ok(x.clone())),
            Err(Fp8Error::InvalidState(_))
        ));

        coord.backward(&y, |g| Ok(g.clone())).unwrap();
        assert_eq!(coord.phase(), StepPhase::Idle);
    }

    #[test]
    fn test_local_width_mismatch_is_shape_error() {
        let group = ThreadGroup::create(1).unwrap().pop().unwrap();
        let mut coord = ParallelCoordinator::new(
            tp_config(4096, 1),
            RegionKind::ColumnParallel,
            Arc::new(group),
        )
        .unwrap();
        let x = Tensor::zeros((2, 1, 4096), DType::F32, &Device::Cpu).unwrap();

        let err = coord
            .forward(&x, |x| Ok(x.narrow(2, 0, 2048)?))
            .unwrap_err();
        assert!(matches!(err, Fp8Error::ShapeMismatch { .. }));
        assert_eq!(coord.phase(), StepPhase::Idle);
    }

    #[test]
    fn test_column_parallel_4096_over_two_ranks() {
        let handles: Vec<_> = ThreadGroup::create(2)
            .unwrap()
            .into_iter()
            .map(|group| {
                thread::spawn(move || {
                    let rank = group.rank();
                    let mut coord = ParallelCoordinator::new(
                        tp_config(4096, 2),
                        RegionKind::ColumnParallel,
                        Arc::new(group),
                    )
                    .unwrap();
                    let x = Tensor::ones((2, 1, 4096), DType::F32, &Device::Cpu).unwrap();

                    // Each rank must produce exactly 2048 columns.
                    let bad = coord.forward(&x, |x| Ok(x.narrow(2, 0, 2047)?));
                    assert!(matches!(bad, Err(Fp8Error::ShapeMismatch { .. })));

                    let y = coord
                        .forward(&x, |x| {
                            Ok((x.narrow(2, 0, 2048)? * (rank + 1) as f64)?)
                        })
                        .unwrap();
                    assert_eq!(y.dims(), &[2, 1, 4096]);
                    let v = values(&y);
                    assert_eq!(v[0], 1.0);
                    assert_eq!(v[4095], 2.0);

                    let g = coord.backward(&y, |g| Ok(g.clone())).unwrap();
                    assert_eq!(g.dims(), &[2, 1, 2048]);
                    assert!(values(&g).iter().all(|v| *v == (rank + 1) as f32));
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
    }

    #[test]
    fn test_sequence_parallel_row_and_norm_regions() {
        let config = ParallelConfig {
            hidden_size: 4,
            tensor_parallel_size: 2,
            sequence_parallel: true,
        };
        let handles: Vec<_> = ThreadGroup::create(2)
            .unwrap()
            .into_iter()
            .map(|group| {
                thread::spawn(move || {
                    let group: Arc<dyn CommGroup> = Arc::new(group);
                    let mut row =
                        ParallelCoordinator::new(config, RegionKind::RowParallel, group.clone())
                            .unwrap();
                    let mut norm =
                        ParallelCoordinator::new(config, RegionKind::SequenceParallel, group)
                            .unwrap();

                    // Row region: partial sums over the full sequence reduce-scatter to seq/2.
                    let x = Tensor::ones((4, 1, 2), DType::F32, &Device::Cpu).unwrap();
                    let y = row
                        .forward(&x, |x| Ok(Tensor::cat(&[x, x], 2)?))
                        .unwrap();
                    assert_eq!(y.dims(), &[2, 1, 4]);
                    assert!(values(&y).iter().all(|v| *v == 2.0));

                    // Norm region: sequence shard all-gathers back to the full sequence.
                    let z = norm.forward(&y, |y| Ok(y.clone())).unwrap();
                    assert_eq!(z.dims(), &[4, 1, 4]);

                    let gz = norm.backward(&z, |g| Ok(g.clone())).unwrap();
                    assert_eq!(gz.dims(), &[2, 1, 4]);
                    assert!(values(&gz).iter().all(|v| *v == 4.0));

                    let gy = Tensor::ones((2, 1, 4), DType::F32, &Device::Cpu).unwrap();
                    let gx = row.backward(&gy, |g| Ok(g.clone())).unwrap();
                    assert_eq!(gx.dims(), &[4, 1, 4]);
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
    }

    #[test]
    fn test_replicated_region_sums_column_input_grads() {
        let device = Device::Cpu;
        let x = Tensor::randn(0f32, 1.0, (3, 2, 4), &device).unwrap();
        let w = Tensor::randn(0f32, 1.0, (4, 4), &device).unwrap();
        let g = Tensor::randn(0f32, 1.0, (3, 2, 4), &device).unwrap();
        // Single device: y = (2x) W^T, so dx = 2 (g W).
        let expected = values(&(g.broadcast_matmul(&w).unwrap() * 2.0).unwrap());

        let handles: Vec<_> = ThreadGroup::create(2)
            .unwrap()
            .into_iter()
            .map(|group| {
                let (x, w, g) = (x.clone(), w.clone(), g.clone());
                thread::spawn(move || {
                    let rank = group.rank();
                    let group: Arc<dyn CommGroup> = Arc::new(group);
                    let config = tp_config(4, 2);
                    let mut norm =
                        ParallelCoordinator::new(config, RegionKind::Replicated, group.clone())
                            .unwrap();
                    let mut column =
                        ParallelCoordinator::new(config, RegionKind::ColumnParallel, group)
                            .unwrap();
                    let shard = w.narrow(0, rank * 2, 2).unwrap().contiguous().unwrap();

                    let h = norm.forward(&x, |x| Ok((x * 2.0)?)).unwrap();
                    let y = column
                        .forward(&h, |h| Ok(h.broadcast_matmul(&shard.t()?)?))
                        .unwrap();
                    assert_eq!(y.dims(), &[3, 2, 4]);

                    let partial = column
                        .backward(&g, |g| Ok(g.broadcast_matmul(&shard)?))
                        .unwrap();
                    let dx = norm.backward(&partial, |g| Ok((g * 2.0)?)).unwrap();
                    values(&dx)
                })
            })
            .collect();

        for h in handles {
            for (a, b) in h.join().unwrap().iter().zip(&expected) {
                assert!((a - b).abs() < 1e-4, "{a} vs {b}");
            }
        }
    }

    #[test]
    fn test_backward_local_error_ends_step() {
        let mut coordinator = ParallelCoordinator::new(
            ParallelConfig {
                hidden_size: 4,
                ..Default::default()
            },
            RegionKind::ColumnParallel,
            Arc::new(LocalGroup),
        )
        .unwrap();
        let x = Tensor::ones((2, 1, 4), DType::F32, &Device::Cpu).unwrap();
        coordinator.forward(&x, |x| Ok(x.clone())).unwrap();

        let bad_grad = Tensor::ones((2, 1, 3), DType::F32, &Device::Cpu).unwrap();
        assert!(coordinator.backward(&bad_grad, |g| Ok(g.clone())).is_err());
        assert_eq!(coordinator.phase(), StepPhase::ReadyForBackward);

        let err = coordinator
            .backward(&x, |_| Err(Fp8Error::InvalidState("local".to_string())))
            .unwrap_err();
        assert!(matches!(err, Fp8Error::InvalidState(_)));
        assert_eq!(coordinator.phase(), StepPhase::Idle);
        assert!(coordinator.forward(&x, |x| Ok(x.clone())).is_ok());
    }

    #[test]
    fn test_communication_failure_is_terminal() {
        let mut groups = ThreadGroup::create(2).unwrap();
        let _silent_peer = groups.pop();
        let group = groups
            .pop()
            .unwrap()
            .with_timeout(Duration::from_millis(20));
        let mut coord = ParallelCoordinator::new(
            tp_config(4, 2),
            RegionKind::ColumnParallel,
            Arc::new(group),
        )
        .unwrap();
        let x = Tensor::ones((1, 1, 4), DType::F32, &Device::Cpu).unwrap();

        let err = coord.forward(&x, |x| Ok(x.narrow(2, 0, 2)?)).unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(coord.phase(), StepPhase::Failed);
        assert!(matches!(
            coord.forward(&x, |x| Ok(x.narrow(2, 0, 2)?)),
            Err(Fp8Error::InvalidState(_))
        ));

        coord.reset();
        assert_eq!(coord.phase(), StepPhase::Idle);
    }

    #[test]
    fn test_sequence_region_requires_sequence_parallel() {
        let group = ThreadGroup::create(2).unwrap().pop().unwrap();
        assert!(ParallelCoordinator::new(
            tp_config(8, 2),
            RegionKind::SequenceParallel,
            Arc::new(group),
        )
        .is_err());
    }
}
