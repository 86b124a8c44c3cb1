// SPDX-License-Identifier: MIT
// Copyright 2026 Tyler Zervas

//! In-process collective backend over `crossbeam` channels.
//!
//! Each ordered pair of ranks gets its own channel, so messages between two
//! ranks stay in FIFO order even when a fast rank runs ahead into the next
//! collective. Every collective is an all-to-all exchange followed by a local
//! reduction; this is O(world²) traffic and meant for CPU reference runs.

use std::time::Duration;

use candle_core::{DType, Device, Tensor};
use crossbeam::channel::{unbounded, Receiver, RecvTimeoutError, Sender};

use super::group::CommGroup;
use crate::error::{Fp8Error, Result};

/// Default time to wait for a peer before declaring a communication failure.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
struct Packet {
    dims: Vec<usize>,
    data: Vec<f32>,
}

impl Packet {
    fn from_tensor(tensor: &Tensor) -> Result<Self> {
        Ok(Self {
            dims: tensor.dims().to_vec(),
            data: tensor.to_dtype(DType::F32)?.flatten_all()?.to_vec1()?,
        })
    }

    fn into_tensor(self, dtype: DType, device: &Device) -> Result<Tensor> {
        Ok(Tensor::from_vec(self.data, self.dims, device)?.to_dtype(dtype)?)
    }
}

/// One member of a thread-backed process group.
///
/// Create all members at once with [`ThreadGroup::create`] and move each into
/// its own thread.
pub struct ThreadGroup {
    rank: usize,
    world_size: usize,
    /// `senders[dst]`, `None` at our own rank.
    senders: Vec<Option<Sender<Packet>>>,
    /// `receivers[src]`, `None` at our own rank.
    receivers: Vec<Option<Receiver<Packet>>>,
    timeout: Duration,
}

impl ThreadGroup {
    /// Build a fully connected group of `world_size` members, indexed by rank.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if `world_size` is zero.
    pub fn create(world_size: usize) -> Result<Vec<Self>> {
        if world_size == 0 {
            return Err(Fp8Error::InvalidConfig(
                "world_size must be at least 1".to_string(),
            ));
        }

        let mut senders: Vec<Vec<Option<Sender<Packet>>>> =
            (0..world_size).map(|_| vec![None; world_size]).collect();
        let mut receivers: Vec<Vec<Option<Receiver<Packet>>>> =
            (0..world_size).map(|_| vec![None; world_size]).collect();

        for src in 0..world_size {
            for dst in 0..world_size {
                if src != dst {
                    let (tx, rx) = unbounded();
                    senders[src][dst] = Some(tx);
                    receivers[dst][src] = Some(rx);
                }
            }
        }

        Ok(senders
            .into_iter()
            .zip(receivers)
            .enumerate()
            .map(|(rank, (senders, receivers))| Self {
                rank,
                world_size,
                senders,
                receivers,
                timeout: DEFAULT_TIMEOUT,
            })
            .collect())
    }

    /// Override the peer timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Send `packet` to every peer and collect every peer's packet, in rank order.
    fn exchange(&self, packet: Packet) -> Result<Vec<Packet>> {
        for (dst, sender) in self.senders.iter().enumerate() {
            if let Some(sender) = sender {
                sender.send(packet.clone()).map_err(|_| {
                    Fp8Error::Communication(format!(
                        "rank {} could not reach rank {dst}: peer disconnected",
                        self.rank
                    ))
                })?;
            }
        }

        let mut packets = Vec::with_capacity(self.world_size);
        for (src, receiver) in self.receivers.iter().enumerate() {
            match receiver {
                None => packets.push(packet.clone()),
                Some(receiver) => {
                    let received = receiver.recv_timeout(self.timeout).map_err(|e| match e {
                        RecvTimeoutError::Timeout => Fp8Error::Communication(format!(
                            "rank {} timed out after {:?} waiting for rank {src}",
                            self.rank, self.timeout
                        )),
                        RecvTimeoutError::Disconnected => Fp8Error::Communication(format!(
                            "rank {} lost connection to rank {src}",
                            self.rank
                        )),
                    })?;
                    packets.push(received);
                }
            }
        }
        Ok(packets)
    }

    fn sum_packets(&self, packets: Vec<Packet>) -> Result<Packet> {
        let mut iter = packets.into_iter();
        let mut acc = iter
            .next()
            .ok_or_else(|| Fp8Error::Communication("empty exchange".to_string()))?;
        for packet in iter {
            if packet.dims != acc.dims {
                return Err(self.disagreement(&acc.dims, &packet.dims));
            }
            for (a, b) in acc.data.iter_mut().zip(packet.data) {
                *a += b;
            }
        }
        Ok(acc)
    }

    fn disagreement(&self, ours: &[usize], theirs: &[usize]) -> Fp8Error {
        Fp8Error::Communication(format!(
            "rank {}: peers disagree on shape ({ours:?} vs {theirs:?})",
            self.rank
        ))
    }
}

impl CommGroup for ThreadGroup {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    fn all_reduce_max(&self, values: &mut [f32]) -> Result<()> {
        tracing::debug!(rank = self.rank, len = values.len(), "all_reduce_max");
        let packets = self.exchange(Packet {
            dims: vec![values.len()],
            data: values.to_vec(),
        })?;
        for packet in packets {
            if packet.data.len() != values.len() {
                return Err(self.disagreement(&[values.len()], &packet.dims));
            }
            for (v, p) in values.iter_mut().zip(packet.data) {
                // NaN wins so a diverged replica is visible everywhere.
                *v = if v.is_nan() || p.is_nan() { f32::NAN } else { v.max(p) };
            }
        }
        Ok(())
    }

    fn all_reduce_sum(&self, tensor: &Tensor) -> Result<Tensor> {
        tracing::debug!(rank = self.rank, shape = ?tensor.dims(), "all_reduce_sum");
        let packets = self.exchange(Packet::from_tensor(tensor)?)?;
        self.sum_packets(packets)?
            .into_tensor(tensor.dtype(), tensor.device())
    }

    fn all_gather(&self, tensor: &Tensor, dim: usize) -> Result<Tensor> {
        tracing::debug!(rank = self.rank, shape = ?tensor.dims(), dim, "all_gather");
        let packets = self.exchange(Packet::from_tensor(tensor)?)?;
        let parts = packets
            .into_iter()
            .map(|packet| {
                if packet.dims == tensor.dims() {
                    packet.into_tensor(tensor.dtype(), tensor.device())
                } else {
                    Err(self.disagreement(tensor.dims(), &packet.dims))
                }
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Tensor::cat(&parts, dim)?)
    }

    fn reduce_scatter(&self, tensor: &Tensor, dim: usize) -> Result<Tensor> {
        tracing::debug!(rank = self.rank, shape = ?tensor.dims(), dim, "reduce_scatter");
        let size = tensor.dim(dim)?;
        if size % self.world_size != 0 {
            let mut expected = tensor.dims().to_vec();
            expected[dim] = size.next_multiple_of(self.world_size);
            return Err(Fp8Error::ShapeMismatch {
                expected,
                actual: tensor.dims().to_vec(),
            });
        }

        let packets = self.exchange(Packet::from_tensor(tensor)?)?;
        let summed = self
            .sum_packets(packets)?
            .into_tensor(tensor.dtype(), tensor.device())?;
        let chunk = size / self.world_size;
        Ok(summed.narrow(dim, self.rank * chunk, chunk)?)
    }
}
