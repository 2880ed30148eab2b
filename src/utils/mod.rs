//! Utility modules.

pub mod rng;

pub use rng::SimpleRng;
