//! Per-channel mean and mean-of-squares nodes.
//!
//! Both nodes view their input as N repeated blocks of `channel_width`
//! elements and reduce across the blocks, producing one value per channel.
//! They replace the equivalent slice/add/scale compositions with a single
//! pass and no intermediate vectors.

use std::rc::Rc;

use crate::graph::{Gradient, Value};

fn check_blocking(len: usize, channel_width: usize, op: &str) -> usize {
    assert!(channel_width > 0, "{}: channel width must be positive", op);
    assert!(
        len > 0 && len % channel_width == 0,
        "{}: input len {} is not a positive multiple of channel width {}",
        op,
        len,
        channel_width
    );
    len / channel_width
}

/// Arithmetic mean of each channel position across the input's blocks.
///
/// # Panics
///
/// Panics unless the input length is a positive multiple of `channel_width`.
///
/// # Example
///
/// ```
/// use batchnorm::graph::{Value, Variable};
/// use batchnorm::primitives::mean;
///
/// let v = Variable::new(vec![1.0, 2.0, 3.0, 4.0]);
/// assert_eq!(mean(v, 2).output(), vec![2.0, 3.0]);
/// ```
pub fn mean(input: Rc<dyn Value>, channel_width: usize) -> Rc<dyn Value> {
    let in_out = input.output();
    let blocks = check_blocking(in_out.len(), channel_width, "mean");

    let mut out = vec![0.0; channel_width];
    for block in in_out.chunks_exact(channel_width) {
        for (o, x) in out.iter_mut().zip(block) {
            *o += x;
        }
    }
    for o in &mut out {
        *o /= blocks as f64;
    }
    Rc::new(Mean { input, blocks, out })
}

struct Mean {
    input: Rc<dyn Value>,
    blocks: usize,
    out: Vec<f64>,
}

impl Value for Mean {
    fn output(&self) -> Vec<f64> {
        self.out.clone()
    }

    fn is_constant(&self, grad: &Gradient) -> bool {
        self.input.is_constant(grad)
    }

    fn propagate(&self, mut upstream: Vec<f64>, grad: &mut Gradient) {
        if self.input.is_constant(grad) {
            return;
        }
        for u in &mut upstream {
            *u /= self.blocks as f64;
        }
        let width = upstream.len();
        let mut down = Vec::with_capacity(width * self.blocks);
        for _ in 0..self.blocks {
            down.extend_from_slice(&upstream);
        }
        self.input.propagate(down, grad);
    }
}

/// Mean of squares of each channel position across the input's blocks.
///
/// Together with [`mean`] this yields the single-pass variance
/// `E[x²] − E[x]²`.
///
/// # Panics
///
/// Panics unless the input length is a positive multiple of `channel_width`.
pub fn mean_of_squares(input: Rc<dyn Value>, channel_width: usize) -> Rc<dyn Value> {
    let in_out = input.output();
    let blocks = check_blocking(in_out.len(), channel_width, "mean_of_squares");

    let mut out = vec![0.0; channel_width];
    for block in in_out.chunks_exact(channel_width) {
        for (o, x) in out.iter_mut().zip(block) {
            *o += x * x;
        }
    }
    for o in &mut out {
        *o /= blocks as f64;
    }
    Rc::new(MeanOfSquares { input, in_out, blocks, out })
}

struct MeanOfSquares {
    input: Rc<dyn Value>,
    in_out: Vec<f64>,
    blocks: usize,
    out: Vec<f64>,
}

impl Value for MeanOfSquares {
    fn output(&self) -> Vec<f64> {
        self.out.clone()
    }

    fn is_constant(&self, grad: &Gradient) -> bool {
        self.input.is_constant(grad)
    }

    fn propagate(&self, upstream: Vec<f64>, grad: &mut Gradient) {
        if self.input.is_constant(grad) {
            return;
        }
        // Chain rule through x²: each block position gets 2·u/N·x.
        let width = upstream.len();
        let n = self.blocks as f64;
        let mut down = vec![0.0; self.in_out.len()];
        for i in 0..self.blocks {
            for j in 0..width {
                let idx = i * width + j;
                down[idx] = 2.0 * upstream[j] / n * self.in_out[idx];
            }
        }
        self.input.propagate(down, grad);
    }
}
