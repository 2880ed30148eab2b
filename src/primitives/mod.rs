//! Fused differentiable primitives
//!
//! The performance-critical node set: per-channel statistics over repeated
//! blocks and single-pass broadcast affine transforms. Each primitive is
//! output- and gradient-equivalent to a composition of the generic ops in
//! [`crate::graph`], which the tests hold it to.

mod affine;
mod mean;
mod stddev;

pub use affine::{add_mul, mul_add};
pub use mean::{mean, mean_of_squares};
pub use stddev::std_dev;
