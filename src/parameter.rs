// SPDX-License-Identifier: MIT
// Copyright 2026 Tyler Zervas

//! Trainable parameters with a separate high-precision gradient slot.

use std::sync::atomic::{AtomicU64, Ordering};

use candle_core::{DType, Tensor};

use crate::error::{Fp8Error, Result};

static NEXT_PARAM_ID: AtomicU64 = AtomicU64::new(0);

/// Process-unique parameter identity. Keys the weight cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ParamId(u64);

impl ParamId {
    fn next() -> Self {
        Self(NEXT_PARAM_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// A trainable tensor.
///
/// `grad` is the primary (compute-precision) gradient slot. `main_grad` is the
/// accumulation buffer; it is allocated and zeroed by the caller and
/// outlives micro-batches until the optimizer step.
#[derive(Debug, Clone)]
pub struct Parameter {
    id: ParamId,
    name: String,
    value: Tensor,
    grad: Option<Tensor>,
    main_grad: Option<Tensor>,
}

impl Parameter {
    /// Wrap `value` as a parameter with a fresh identity.
    pub fn new(name: impl Into<String>, value: Tensor) -> Self {
        Self {
            id: ParamId::next(),
            name: name.into(),
            value,
            grad: None,
            main_grad: None,
        }
    }

    /// Identity.
    #[must_use]
    pub fn id(&self) -> ParamId {
        self.id
    }

    /// Name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current value.
    #[must_use]
    pub fn value(&self) -> &Tensor {
        &self.value
    }

    /// Replace the value, e.g. after an optimizer step.
    ///
    /// # Errors
    ///
    /// Returns `ShapeMismatch` if the new value has a different shape.
    pub fn set_value(&mut self, value: Tensor) -> Result<()> {
        check_same_dims(self.value.dims(), value.dims())?;
        self.value = value;
        Ok(())
    }

    /// Primary gradient.
    #[must_use]
    pub fn grad(&self) -> Option<&Tensor> {
        self.grad.as_ref()
    }

    /// Overwrite the primary gradient.
    ///
    /// # Errors
    ///
    /// Returns `ShapeMismatch` if the gradient does not match the value shape.
    pub fn set_grad(&mut self, grad: Tensor) -> Result<()> {
        check_same_dims(self.value.dims(), grad.dims())?;
        self.grad = Some(grad);
        Ok(())
    }

    /// Take the primary gradient out, leaving the slot empty.
    pub fn take_grad(&mut self) -> Option<Tensor> {
        self.grad.take()
    }

    /// Accumulation buffer.
    #[must_use]
    pub fn main_grad(&self) -> Option<&Tensor> {
        self.main_grad.as_ref()
    }

    /// Attach a caller-allocated accumulation buffer.
    ///
    /// # Errors
    ///
    /// Returns `ShapeMismatch` if the buffer does not match the value shape.
    pub fn attach_main_grad(&mut self, buffer: Tensor) -> Result<()> {
        check_same_dims(self.value.dims(), buffer.dims())?;
        self.main_grad = Some(buffer);
        Ok(())
    }

    /// Attach a zeroed buffer of `dtype` with the value's shape.
    ///
    /// # Errors
    ///
    /// Returns error if the tensor cannot be allocated.
    pub fn attach_zeroed_main_grad(&mut self, dtype: DType) -> Result<()> {
        let buffer = Tensor::zeros(self.value.dims(), dtype, self.value.device())?;
        self.main_grad = Some(buffer);
        Ok(())
    }

    /// Zero the attached buffer before the next optimizer step.
    ///
    /// # Errors
    ///
    /// Returns `UninitializedBuffer` if no buffer is attached.
    pub fn zero_main_grad(&mut self) -> Result<()> {
        let buffer = self
            .main_grad
            .as_ref()
            .ok_or_else(|| Fp8Error::UninitializedBuffer {
                param: self.name.clone(),
            })?;
        self.main_grad = Some(buffer.zeros_like()?);
        Ok(())
    }

    /// Detach and return the buffer.
    pub fn detach_main_grad(&mut self) -> Option<Tensor> {
        self.main_grad.take()
    }

    pub(crate) fn replace_main_grad(&mut self, buffer: Tensor) {
        self.main_grad = Some(buffer);
    }
}

pub(crate) fn check_same_dims(expected: &[usize], actual: &[usize]) -> Result<()> {
    if expected == actual {
        Ok(())
    } else {
        Err(Fp8Error::ShapeMismatch {
            expected: expected.to_vec(),
            actual: actual.to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn test_ids_are_unique() {
        let device = Device::Cpu;
        let a = Parameter::new("a", Tensor::zeros((2, 2), DType::F32, &device).unwrap());
        let b = Parameter::new("a", Tensor::zeros((2, 2), DType::F32, &device).unwrap());
        assert_ne!(a.id(), b.id());
        assert_eq!(a.id(), a.clone().id());
    }

    #[test]
    fn test_attach_main_grad_checks_shape() {
        let device = Device::Cpu;
        let mut p = Parameter::new("w", Tensor::zeros((4, 8), DType::F32, &device).unwrap());
        let wrong = Tensor::zeros((8, 4), DType::F32, &device).unwrap();
        assert!(matches!(
            p.attach_main_grad(wrong),
            Err(Fp8Error::ShapeMismatch { .. })
        ));
        assert!(p.main_grad().is_none());
    }

    #[test]
    fn test_zero_main_grad() {
        let device = Device::Cpu;
        let mut p = Parameter::new("w", Tensor::zeros((2, 3), DType::BF16, &device).unwrap());
        assert!(matches!(
            p.zero_main_grad(),
            Err(Fp8Error::UninitializedBuffer { .. })
        ));

        p.attach_main_grad(Tensor::ones((2, 3), DType::F32, &device).unwrap())
            .unwrap();
        p.zero_main_grad().unwrap();
        let sum = p.main_grad().unwrap().sum_all().unwrap().to_scalar::<f32>().unwrap();
        assert_eq!(sum, 0.0);
        assert_eq!(p.main_grad().unwrap().dtype(), DType::F32);
    }

    #[test]
    fn test_attach_zeroed_main_grad() {
        let device = Device::Cpu;
        let mut p = Parameter::new("w", Tensor::zeros((2, 3), DType::F16, &device).unwrap());
        p.attach_zeroed_main_grad(DType::F32).unwrap();
        assert_eq!(p.main_grad().unwrap().dims(), &[2, 3]);
        assert_eq!(p.main_grad().unwrap().dtype(), DType::F32);
    }
}
