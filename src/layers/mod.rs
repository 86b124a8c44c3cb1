//! Layers whose GEMMs run through an FP8 autocast scope.

pub mod linear;

pub use linear::Fp8Linear;
