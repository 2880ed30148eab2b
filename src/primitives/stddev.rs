//! Standard-deviation node over summary statistics.

use std::rc::Rc;

use crate::graph::{Gradient, Value};
use crate::DEFAULT_STABILIZER;

/// Per-channel standard deviation from a mean and a mean of squares:
/// `sqrt(meanSquare[j] - mean[j]² + stabilizer)`.
///
/// A zero `stabilizer` is replaced with [`DEFAULT_STABILIZER`]; the additive
/// term keeps the output (and the backward division by it) away from zero
/// when a channel's variance vanishes.
///
/// # Panics
///
/// Panics if the operands have different lengths or the stabilizer is
/// negative.
pub fn std_dev(
    mean: Rc<dyn Value>,
    mean_square: Rc<dyn Value>,
    stabilizer: f64,
) -> Rc<dyn Value> {
    assert!(
        stabilizer >= 0.0,
        "std_dev: stabilizer must not be negative, got {}",
        stabilizer
    );
    let stabilizer = if stabilizer == 0.0 {
        DEFAULT_STABILIZER
    } else {
        stabilizer
    };

    let mean_out = mean.output();
    let square_out = mean_square.output();
    assert_eq!(
        mean_out.len(),
        square_out.len(),
        "std_dev: operand len mismatch: {} vs {}",
        mean_out.len(),
        square_out.len()
    );

    let out = mean_out
        .iter()
        .zip(&square_out)
        .map(|(m, s)| (s - m * m + stabilizer).sqrt())
        .collect();
    Rc::new(StdDev { mean, mean_square, mean_out, out })
}

struct StdDev {
    mean: Rc<dyn Value>,
    mean_square: Rc<dyn Value>,
    mean_out: Vec<f64>,
    out: Vec<f64>,
}

impl Value for StdDev {
    fn output(&self) -> Vec<f64> {
        self.out.clone()
    }

    fn is_constant(&self, grad: &Gradient) -> bool {
        self.mean.is_constant(grad) && self.mean_square.is_constant(grad)
    }

    fn propagate(&self, mut upstream: Vec<f64>, grad: &mut Gradient) {
        let mean_live = !self.mean.is_constant(grad);
        let square_live = !self.mean_square.is_constant(grad);
        if !mean_live && !square_live {
            return;
        }

        // d out / d meanSquare = 1 / (2 out); d out / d mean = -mean / out.
        for (u, o) in upstream.iter_mut().zip(&self.out) {
            *u /= 2.0 * o;
        }
        if square_live {
            let down = if mean_live {
                upstream.clone()
            } else {
                std::mem::take(&mut upstream)
            };
            self.mean_square.propagate(down, grad);
        }
        if mean_live {
            for (u, m) in upstream.iter_mut().zip(&self.mean_out) {
                *u *= -2.0 * m;
            }
            self.mean.propagate(upstream, grad);
        }
    }
}
