//! Reverse-mode automatic differentiation substrate
//!
//! This module provides the value abstraction the normalization primitives
//! plug into, plus the generic node operations they are benchmarked and
//! tested against.

mod ops;
mod value;

pub use ops::{add, add_scalar, mul, pool, pow, repeat, scale, slice, square};
pub use value::{Gradient, Value, Variable};
