//! Differentiable Batch Normalization
//!
//! This library provides a batch normalization layer that plugs into a small
//! reverse-mode automatic differentiation graph, plus the machinery to freeze
//! its statistics over a whole sample set.
//!
//! # Modules
//!
//! - `graph`: the differentiable value abstraction and generic node ops
//! - `primitives`: fused statistic and affine nodes (Mean, StdDev, AddMul, ...)
//! - `layer`: the batch normalization layer and its Training/Frozen state
//! - `network`: layer, network, and sample-set collaborator interfaces
//! - `statistics`: whole-sample-set statistics, output caching, calibration
//! - `utils`: shared utilities (RNG)

pub mod graph;
pub mod layer;
pub mod network;
pub mod primitives;
pub mod statistics;
pub mod utils;

/// Stabilizer substituted when a caller supplies zero.
///
/// The stabilizer is added to a variance before it is inverted, so it must be
/// strictly positive to keep normalization finite when a variance is 0.
pub const DEFAULT_STABILIZER: f64 = 1e-3;
