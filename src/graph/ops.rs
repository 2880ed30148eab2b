//! Generic differentiable node operations.
//!
//! These are the unfused building blocks: elementwise arithmetic, scalar
//! broadcasts, block tiling, and the pooling combinator that shares one
//! forward result across several consumers. The fused primitives in
//! `crate::primitives` replace chains of these nodes on the hot path; the
//! generic forms remain the reference they are tested against.

use std::rc::Rc;

use crate::graph::value::{Gradient, Value, Variable};

/// Elementwise sum of two values of equal length.
pub fn add(a: Rc<dyn Value>, b: Rc<dyn Value>) -> Rc<dyn Value> {
    let av = a.output();
    let bv = b.output();
    assert_eq!(
        av.len(),
        bv.len(),
        "add: operand len mismatch: {} vs {}",
        av.len(),
        bv.len()
    );
    let out = av.iter().zip(&bv).map(|(x, y)| x + y).collect();
    Rc::new(Add { a, b, out })
}

struct Add {
    a: Rc<dyn Value>,
    b: Rc<dyn Value>,
    out: Vec<f64>,
}

impl Value for Add {
    fn output(&self) -> Vec<f64> {
        self.out.clone()
    }

    fn is_constant(&self, grad: &Gradient) -> bool {
        self.a.is_constant(grad) && self.b.is_constant(grad)
    }

    fn propagate(&self, upstream: Vec<f64>, grad: &mut Gradient) {
        let a_live = !self.a.is_constant(grad);
        let b_live = !self.b.is_constant(grad);
        if a_live && b_live {
            self.a.propagate(upstream.clone(), grad);
            self.b.propagate(upstream, grad);
        } else if a_live {
            self.a.propagate(upstream, grad);
        } else if b_live {
            self.b.propagate(upstream, grad);
        }
    }
}

/// Elementwise product of two values of equal length.
pub fn mul(a: Rc<dyn Value>, b: Rc<dyn Value>) -> Rc<dyn Value> {
    let a_out = a.output();
    let b_out = b.output();
    assert_eq!(
        a_out.len(),
        b_out.len(),
        "mul: operand len mismatch: {} vs {}",
        a_out.len(),
        b_out.len()
    );
    let out = a_out.iter().zip(&b_out).map(|(x, y)| x * y).collect();
    Rc::new(Mul { a, b, a_out, b_out, out })
}

struct Mul {
    a: Rc<dyn Value>,
    b: Rc<dyn Value>,
    a_out: Vec<f64>,
    b_out: Vec<f64>,
    out: Vec<f64>,
}

impl Value for Mul {
    fn output(&self) -> Vec<f64> {
        self.out.clone()
    }

    fn is_constant(&self, grad: &Gradient) -> bool {
        self.a.is_constant(grad) && self.b.is_constant(grad)
    }

    fn propagate(&self, mut upstream: Vec<f64>, grad: &mut Gradient) {
        if !self.a.is_constant(grad) {
            let down = upstream
                .iter()
                .zip(&self.b_out)
                .map(|(u, y)| u * y)
                .collect();
            self.a.propagate(down, grad);
        }
        if !self.b.is_constant(grad) {
            for (u, x) in upstream.iter_mut().zip(&self.a_out) {
                *u *= x;
            }
            self.b.propagate(upstream, grad);
        }
    }
}

/// Multiply every element by the scalar `c`.
pub fn scale(input: Rc<dyn Value>, c: f64) -> Rc<dyn Value> {
    let out = input.output().iter().map(|x| x * c).collect();
    Rc::new(Scale { input, c, out })
}

struct Scale {
    input: Rc<dyn Value>,
    c: f64,
    out: Vec<f64>,
}

impl Value for Scale {
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
            *u *= self.c;
        }
        self.input.propagate(upstream, grad);
    }
}

/// Add the scalar `c` to every element.
pub fn add_scalar(input: Rc<dyn Value>, c: f64) -> Rc<dyn Value> {
    let out = input.output().iter().map(|x| x + c).collect();
    Rc::new(AddScalar { input, out })
}

struct AddScalar {
    input: Rc<dyn Value>,
    out: Vec<f64>,
}

impl Value for AddScalar {
    fn output(&self) -> Vec<f64> {
        self.out.clone()
    }

    fn is_constant(&self, grad: &Gradient) -> bool {
        self.input.is_constant(grad)
    }

    fn propagate(&self, upstream: Vec<f64>, grad: &mut Gradient) {
        if !self.input.is_constant(grad) {
            self.input.propagate(upstream, grad);
        }
    }
}

/// Square every element.
pub fn square(input: Rc<dyn Value>) -> Rc<dyn Value> {
    let in_out = input.output();
    let out = in_out.iter().map(|x| x * x).collect();
    Rc::new(Square { input, in_out, out })
}

struct Square {
    input: Rc<dyn Value>,
    in_out: Vec<f64>,
    out: Vec<f64>,
}

impl Value for Square {
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
        for (u, x) in upstream.iter_mut().zip(&self.in_out) {
            *u *= 2.0 * x;
        }
        self.input.propagate(upstream, grad);
    }
}

/// Raise every element to the power `p`.
///
/// Backward rule: `p * x^(p-1)`. With negative or fractional `p` the caller
/// is responsible for keeping the inputs in the valid domain.
pub fn pow(input: Rc<dyn Value>, p: f64) -> Rc<dyn Value> {
    let in_out = input.output();
    let out = in_out.iter().map(|x| x.powf(p)).collect();
    Rc::new(Pow { input, in_out, p, out })
}

struct Pow {
    input: Rc<dyn Value>,
    in_out: Vec<f64>,
    p: f64,
    out: Vec<f64>,
}

impl Value for Pow {
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
        for (u, x) in upstream.iter_mut().zip(&self.in_out) {
            *u *= self.p * x.powf(self.p - 1.0);
        }
        self.input.propagate(upstream, grad);
    }
}

/// Tile the input `n` times.
///
/// The output has `n * len(input)` elements; the backward pass folds the
/// upstream blocks back into one gradient of the input's length.
pub fn repeat(input: Rc<dyn Value>, n: usize) -> Rc<dyn Value> {
    assert!(n > 0, "repeat: n must be positive");
    let in_out = input.output();
    let mut out = Vec::with_capacity(in_out.len() * n);
    for _ in 0..n {
        out.extend_from_slice(&in_out);
    }
    let width = in_out.len();
    Rc::new(Repeat { input, width, out })
}

struct Repeat {
    input: Rc<dyn Value>,
    width: usize,
    out: Vec<f64>,
}

impl Value for Repeat {
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
        let mut down = vec![0.0; self.width];
        for block in upstream.chunks_exact(self.width) {
            for (d, u) in down.iter_mut().zip(block) {
                *d += u;
            }
        }
        self.input.propagate(down, grad);
    }
}

/// The contiguous sub-range `[start, end)` of the input.
pub fn slice(input: Rc<dyn Value>, start: usize, end: usize) -> Rc<dyn Value> {
    let in_out = input.output();
    assert!(
        start <= end && end <= in_out.len(),
        "slice: invalid range {}..{} for length {}",
        start,
        end,
        in_out.len()
    );
    let out = in_out[start..end].to_vec();
    let full_len = in_out.len();
    Rc::new(Slice { input, start, full_len, out })
}

struct Slice {
    input: Rc<dyn Value>,
    start: usize,
    full_len: usize,
    out: Vec<f64>,
}

impl Value for Slice {
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
        let mut down = vec![0.0; self.full_len];
        down[self.start..self.start + upstream.len()].copy_from_slice(&upstream);
        self.input.propagate(down, grad);
    }
}

/// Share one forward result across every consumer `body` creates.
///
/// The input's output is materialized once into a fresh variable which `body`
/// may consume any number of times. On the backward pass the variable
/// temporarily joins the gradient so every consumer accumulates into it; the
/// aggregate is then forwarded to the real input exactly once.
///
/// # Example
///
/// ```
/// use batchnorm::graph::{mul, pool, Value, Variable};
///
/// let v = Variable::new(vec![2.0, 3.0]);
/// let y = pool(v, |shared| mul(shared.clone(), shared));
/// assert_eq!(y.output(), vec![4.0, 9.0]);
/// ```
pub fn pool<F>(input: Rc<dyn Value>, body: F) -> Rc<dyn Value>
where
    F: FnOnce(Rc<Variable>) -> Rc<dyn Value>,
{
    let shared = Variable::new(input.output());
    let out = body(Rc::clone(&shared));
    Rc::new(Pooled { input, shared, out })
}

struct Pooled {
    input: Rc<dyn Value>,
    shared: Rc<Variable>,
    out: Rc<dyn Value>,
}

impl Value for Pooled {
    fn output(&self) -> Vec<f64> {
        self.out.output()
    }

    fn is_constant(&self, grad: &Gradient) -> bool {
        self.input.is_constant(grad) && self.out.is_constant(grad)
    }

    fn propagate(&self, upstream: Vec<f64>, grad: &mut Gradient) {
        grad.insert_zero(&self.shared);
        self.out.propagate(upstream, grad);
        if let Some(aggregate) = grad.take(&self.shared) {
            if !self.input.is_constant(grad) {
                self.input.propagate(aggregate, grad);
            }
        }
    }
}
