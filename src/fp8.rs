// SPDX-License-Identifier: MIT
// Copyright 2026 Tyler Zervas

//! FP8 encodings and scaled FP8 tensors.
//!
//! Candle has no native 8-bit float storage, so FP8 values are encoded on the
//! host and stored as `u8` bit patterns inside a [`Tensor`].
//!
//! ## Formats
//!
//! | Format | Exponent | Mantissa | Bias | Max    | Inf |
//! |--------|----------|----------|------|--------|-----|
//! | E4M3   | 4        | 3        | 7    | 448    | no  |
//! | E5M2   | 5        | 2        | 15   | 57344  | yes |
//!
//! Encoding rounds to nearest-even and saturates at the format maximum, so a
//! finite input never produces an infinity or NaN code.
//!
//! ## Scaling
//!
//! ```text
//! code  = encode(x * scale)
//! x_hat = decode(code) * scale_inv
//! ```

use candle_core::{DType, Device, Tensor};

use crate::error::Result;

/// An 8-bit floating point encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Fp8Dtype {
    /// 4-bit exponent, 3-bit mantissa, no infinity. Better precision.
    E4M3,
    /// 5-bit exponent, 2-bit mantissa, IEEE-style inf/NaN. Better range.
    E5M2,
}

impl Fp8Dtype {
    /// Largest finite representable magnitude.
    #[must_use]
    pub const fn max_value(self) -> f32 {
        match self {
            Self::E4M3 => 448.0,
            Self::E5M2 => 57344.0,
        }
    }

    /// Smallest positive (subnormal) magnitude.
    #[must_use]
    pub fn min_positive(self) -> f32 {
        match self {
            Self::E4M3 => 2.0f32.powi(-9),
            Self::E5M2 => 2.0f32.powi(-16),
        }
    }

    const fn mantissa_bits(self) -> u32 {
        match self {
            Self::E4M3 => 3,
            Self::E5M2 => 2,
        }
    }

    const fn bias(self) -> i32 {
        match self {
            Self::E4M3 => 7,
            Self::E5M2 => 15,
        }
    }

    /// Code of the largest finite positive value.
    const fn max_code(self) -> u8 {
        match self {
            Self::E4M3 => 0x7E,
            Self::E5M2 => 0x7B,
        }
    }

    const fn nan_code(self) -> u8 {
        match self {
            Self::E4M3 => 0x7F,
            Self::E5M2 => 0x7E,
        }
    }

    /// Encode one value, saturating out-of-range magnitudes.
    #[must_use]
    pub fn encode(self, x: f32) -> u8 {
        if x.is_nan() {
            return self.nan_code();
        }
        let sign = if x.is_sign_negative() { 0x80u8 } else { 0 };
        let a = f64::from(x.abs());
        if a == 0.0 {
            return sign;
        }
        if a >= f64::from(self.max_value()) {
            return sign | self.max_code();
        }

        let man_bits = self.mantissa_bits();
        let min_normal_exp = 1 - self.bias();
        let exp = (a.log2().floor() as i32).max(min_normal_exp);

        // Subnormals share the quantum of the smallest normal binade, and a
        // rounded mantissa that overflows carries into the exponent field.
        let quantum = 2f64.powi(exp - man_bits as i32);
        let m = (a / quantum).round_ties_even() as u32;
        let code = if exp == min_normal_exp && m < (1 << man_bits) {
            m
        } else {
            (((exp + self.bias()) as u32) << man_bits) + m - (1 << man_bits)
        };

        sign | (code.min(u32::from(self.max_code())) as u8)
    }

    /// Decode one code into `f32`.
    #[must_use]
    pub fn decode(self, code: u8) -> f32 {
        let negative = code & 0x80 != 0;
        let magnitude = code & 0x7F;
        let man_bits = self.mantissa_bits();
        let exp_field = i32::from(magnitude >> man_bits);
        let mantissa = f32::from(magnitude & ((1 << man_bits) - 1));
        let exp_all_ones = (1 << (7 - man_bits)) - 1;

        let value = match self {
            Self::E4M3 if magnitude == 0x7F => f32::NAN,
            Self::E5M2 if exp_field == exp_all_ones => {
                if mantissa == 0.0 {
                    f32::INFINITY
                } else {
                    f32::NAN
                }
            }
            _ if exp_field == 0 => {
                mantissa * 2f32.powi(1 - self.bias() - man_bits as i32)
            }
            _ => {
                (1.0 + mantissa / (1u32 << man_bits) as f32) * 2f32.powi(exp_field - self.bias())
            }
        };

        if negative {
            -value
        } else {
            value
        }
    }
}

/// Maximum absolute value of a slice. NaN propagates.
#[must_use]
pub fn amax(values: &[f32]) -> f32 {
    values.iter().fold(0.0f32, |acc, v| {
        if v.is_nan() || acc.is_nan() {
            f32::NAN
        } else {
            acc.max(v.abs())
        }
    })
}

/// A tensor quantized to FP8 with a per-tensor scale.
#[derive(Debug, Clone)]
pub struct Fp8Tensor {
    /// FP8 bit patterns (`DType::U8`), same shape as the source tensor.
    data: Tensor,
    /// Encoding of `data`.
    dtype: Fp8Dtype,
    /// Multiplier applied before encoding.
    scale: f32,
    /// Multiplier applied after decoding.
    scale_inv: f32,
    /// Source dtype, restored by [`Fp8Tensor::dequantize`].
    source_dtype: DType,
}

impl Fp8Tensor {
    /// Quantize `tensor` with the given scale.
    ///
    /// Returns the FP8 tensor and the amax of the unscaled input.
    ///
    /// # Errors
    ///
    /// Returns error if the tensor cannot be read back to host memory.
    pub fn quantize(tensor: &Tensor, dtype: Fp8Dtype, scale: f32) -> Result<(Self, f32)> {
        let values: Vec<f32> = tensor.to_dtype(DType::F32)?.flatten_all()?.to_vec1()?;
        let observed = amax(&values);
        let codes: Vec<u8> = values.iter().map(|v| dtype.encode(v * scale)).collect();
        let data = Tensor::from_vec(codes, tensor.dims(), tensor.device())?;

        Ok((
            Self {
                data,
                dtype,
                scale,
                scale_inv: 1.0 / scale,
                source_dtype: tensor.dtype(),
            },
            observed,
        ))
    }

    /// Decode back to the source dtype.
    ///
    /// # Errors
    ///
    /// Returns error if the codes cannot be read back to host memory.
    pub fn dequantize(&self) -> Result<Tensor> {
        let values: Vec<f32> = self
            .codes()?
            .into_iter()
            .map(|c| self.dtype.decode(c) * self.scale_inv)
            .collect();
        let tensor = Tensor::from_vec(values, self.data.dims(), self.data.device())?;
        Ok(tensor.to_dtype(self.source_dtype)?)
    }

    /// Raw FP8 codes in row-major order.
    ///
    /// # Errors
    ///
    /// Returns error if the codes cannot be read back to host memory.
    pub fn codes(&self) -> Result<Vec<u8>> {
        Ok(self.data.flatten_all()?.to_vec1()?)
    }

    /// FP8 encoding.
    #[must_use]
    pub fn dtype(&self) -> Fp8Dtype {
        self.dtype
    }

    /// Scale used at quantization time.
    #[must_use]
    pub fn scale(&self) -> f32 {
        self.scale
    }

    /// Inverse scale used at dequantization time.
    #[must_use]
    pub fn scale_inv(&self) -> f32 {
        self.scale_inv
    }

    /// Tensor dimensions.
    #[must_use]
    pub fn dims(&self) -> &[usize] {
        self.data.dims()
    }

    /// Device holding the codes.
    #[must_use]
    pub fn device(&self) -> &Device {
        self.data.device()
    }

    /// Storage size in bytes (one byte per element plus the scale pair).
    #[must_use]
    pub fn size_bytes(&self) -> usize {
        self.data.elem_count() + 2 * std::mem::size_of::<f32>()
    }
}
