//! Fused broadcast affine nodes.
//!
//! `add_mul` and `mul_add` apply a per-channel affine transform to every
//! block of a repeated input in one pass. Each is equivalent to a chain of
//! `repeat`/`add`/`mul` nodes but allocates only the output vector, and its
//! backward pass reduces the per-parameter gradients across blocks directly.

use std::rc::Rc;

use crate::graph::{Gradient, Value};

fn check_shape(
    op: &str,
    input_len: usize,
    bias_len: usize,
    scale_len: usize,
    n: usize,
) {
    assert_eq!(
        bias_len, scale_len,
        "{}: bias len {} != scale len {}",
        op, bias_len, scale_len
    );
    assert!(bias_len > 0, "{}: channel width must be positive", op);
    assert_eq!(
        input_len,
        n * bias_len,
        "{}: input len {} != {} blocks of width {}",
        op,
        input_len,
        n,
        bias_len
    );
}

/// Compute `(input + bias) * scale` with `bias` and `scale` broadcast across
/// `n` blocks.
///
/// # Panics
///
/// Panics if `bias` and `scale` differ in length or the input does not hold
/// exactly `n` blocks of their width.
pub fn add_mul(
    input: Rc<dyn Value>,
    bias: Rc<dyn Value>,
    scale: Rc<dyn Value>,
    n: usize,
) -> Rc<dyn Value> {
    let in_out = input.output();
    let bias_out = bias.output();
    let scale_out = scale.output();
    check_shape("add_mul", in_out.len(), bias_out.len(), scale_out.len(), n);

    let width = bias_out.len();
    let mut out = in_out.clone();
    for block in out.chunks_exact_mut(width) {
        for (j, o) in block.iter_mut().enumerate() {
            *o = (*o + bias_out[j]) * scale_out[j];
        }
    }

    Rc::new(AddMul {
        input,
        bias,
        scale,
        in_out,
        bias_out,
        scale_out,
        out,
    })
}

struct AddMul {
    input: Rc<dyn Value>,
    bias: Rc<dyn Value>,
    scale: Rc<dyn Value>,
    in_out: Vec<f64>,
    bias_out: Vec<f64>,
    scale_out: Vec<f64>,
    out: Vec<f64>,
}

impl Value for AddMul {
    fn output(&self) -> Vec<f64> {
        self.out.clone()
    }

    fn is_constant(&self, grad: &Gradient) -> bool {
        self.input.is_constant(grad)
            && self.bias.is_constant(grad)
            && self.scale.is_constant(grad)
    }

    fn propagate(&self, mut upstream: Vec<f64>, grad: &mut Gradient) {
        let width = self.bias_out.len();
        let n = self.in_out.len() / width;

        if !self.scale.is_constant(grad) {
            let mut down = vec![0.0; width];
            for i in 0..n {
                for j in 0..width {
                    let idx = i * width + j;
                    down[j] += upstream[idx] * (self.in_out[idx] + self.bias_out[j]);
                }
            }
            self.scale.propagate(down, grad);
        }
        if !self.bias.is_constant(grad) {
            let mut down = vec![0.0; width];
            for i in 0..n {
                for j in 0..width {
                    down[j] += upstream[i * width + j] * self.scale_out[j];
                }
            }
            self.bias.propagate(down, grad);
        }
        // The input branch mutates the upstream buffer in place, so it runs
        // after the branches that still need the original values.
        if !self.input.is_constant(grad) {
            for i in 0..n {
                for j in 0..width {
                    upstream[i * width + j] *= self.scale_out[j];
                }
            }
            self.input.propagate(upstream, grad);
        }
    }
}

/// Compute `input * scale + bias` with `scale` and `bias` broadcast across
/// `n` blocks.
///
/// The mirror of [`add_mul`] with the multiply applied first; used after
/// normalization to apply the learned affine transform.
///
/// # Panics
///
/// Panics if `scale` and `bias` differ in length or the input does not hold
/// exactly `n` blocks of their width.
pub fn mul_add(
    input: Rc<dyn Value>,
    scale: Rc<dyn Value>,
    bias: Rc<dyn Value>,
    n: usize,
) -> Rc<dyn Value> {
    let in_out = input.output();
    let scale_out = scale.output();
    let bias_out = bias.output();
    check_shape("mul_add", in_out.len(), bias_out.len(), scale_out.len(), n);

    let width = scale_out.len();
    let mut out = in_out.clone();
    for block in out.chunks_exact_mut(width) {
        for (j, o) in block.iter_mut().enumerate() {
            *o = *o * scale_out[j] + bias_out[j];
        }
    }

    Rc::new(MulAdd {
        input,
        scale,
        bias,
        in_out,
        scale_out,
        out,
    })
}

struct MulAdd {
    input: Rc<dyn Value>,
    scale: Rc<dyn Value>,
    bias: Rc<dyn Value>,
    in_out: Vec<f64>,
    scale_out: Vec<f64>,
    out: Vec<f64>,
}

impl Value for MulAdd {
    fn output(&self) -> Vec<f64> {
        self.out.clone()
    }

    fn is_constant(&self, grad: &Gradient) -> bool {
        self.input.is_constant(grad)
            && self.scale.is_constant(grad)
            && self.bias.is_constant(grad)
    }

    fn propagate(&self, mut upstream: Vec<f64>, grad: &mut Gradient) {
        let width = self.scale_out.len();
        let n = self.in_out.len() / width;

        if !self.scale.is_constant(grad) {
            let mut down = vec![0.0; width];
            for i in 0..n {
                for j in 0..width {
                    let idx = i * width + j;
                    down[j] += upstream[idx] * self.in_out[idx];
                }
            }
            self.scale.propagate(down, grad);
        }
        if !self.bias.is_constant(grad) {
            let mut down = vec![0.0; width];
            for i in 0..n {
                for j in 0..width {
                    down[j] += upstream[i * width + j];
                }
            }
            self.bias.propagate(down, grad);
        }
        if !self.input.is_constant(grad) {
            for i in 0..n {
                for j in 0..width {
                    upstream[i * width + j] *= self.scale_out[j];
                }
            }
            self.input.propagate(upstream, grad);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Variable;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_add_mul_forward() {
        let input = Variable::new(vec![1.0, 2.0, 3.0, 4.0]);
        let bias = Variable::new(vec![1.0, -1.0]);
        let scale = Variable::new(vec![2.0, 3.0]);
        let out = add_mul(input, bias, scale, 2);
        // ((1+1)*2, (2-1)*3, (3+1)*2, (4-1)*3)
        assert_eq!(out.output(), vec![4.0, 3.0, 8.0, 9.0]);
    }

    #[test]
    fn test_mul_add_forward() {
        let input = Variable::new(vec![1.0, 2.0, 3.0, 4.0]);
        let scale = Variable::new(vec![2.0, 3.0]);
        let bias = Variable::new(vec![1.0, -1.0]);
        let out = mul_add(input, scale, bias, 2);
        // (1*2+1, 2*3-1, 3*2+1, 4*3-1)
        assert_eq!(out.output(), vec![3.0, 5.0, 7.0, 11.0]);
    }

    #[test]
    fn test_add_mul_backward_all_operands() {
        let input = Variable::new(vec![1.0, 2.0, 3.0, 4.0]);
        let bias = Variable::new(vec![1.0, -1.0]);
        let scale = Variable::new(vec![2.0, 3.0]);
        let out = add_mul(input.clone(), bias.clone(), scale.clone(), 2);

        let mut grad = Gradient::new(&[input.clone(), bias.clone(), scale.clone()]);
        out.propagate(vec![1.0, 1.0, 1.0, 1.0], &mut grad);

        // d/d scale[j] = sum_i (in[i,j] + bias[j])
        let g_scale = grad.get(&scale).unwrap();
        assert_abs_diff_eq!(g_scale[0], (1.0 + 1.0) + (3.0 + 1.0), epsilon = 1e-12);
        assert_abs_diff_eq!(g_scale[1], (2.0 - 1.0) + (4.0 - 1.0), epsilon = 1e-12);

        // d/d bias[j] = sum_i scale[j]
        let g_bias = grad.get(&bias).unwrap();
        assert_abs_diff_eq!(g_bias[0], 4.0, epsilon = 1e-12);
        assert_abs_diff_eq!(g_bias[1], 6.0, epsilon = 1e-12);

        // d/d in[i,j] = scale[j]
        let g_in = grad.get(&input).unwrap();
        assert_eq!(g_in, &[2.0, 3.0, 2.0, 3.0][..]);
    }

    #[test]
    fn test_mul_add_backward_all_operands() {
        let input = Variable::new(vec![1.0, 2.0, 3.0, 4.0]);
        let scale = Variable::new(vec![2.0, 3.0]);
        let bias = Variable::new(vec![1.0, -1.0]);
        let out = mul_add(input.clone(), scale.clone(), bias.clone(), 2);

        let mut grad = Gradient::new(&[input.clone(), bias.clone(), scale.clone()]);
        out.propagate(vec![1.0, 2.0, 3.0, 4.0], &mut grad);

        // d/d scale[j] = sum_i u[i,j] * in[i,j]
        let g_scale = grad.get(&scale).unwrap();
        assert_abs_diff_eq!(g_scale[0], 1.0 * 1.0 + 3.0 * 3.0, epsilon = 1e-12);
        assert_abs_diff_eq!(g_scale[1], 2.0 * 2.0 + 4.0 * 4.0, epsilon = 1e-12);

        // d/d bias[j] = sum_i u[i,j]
        let g_bias = grad.get(&bias).unwrap();
        assert_abs_diff_eq!(g_bias[0], 4.0, epsilon = 1e-12);
        assert_abs_diff_eq!(g_bias[1], 6.0, epsilon = 1e-12);

        // d/d in[i,j] = u[i,j] * scale[j]
        let g_in = grad.get(&input).unwrap();
        assert_eq!(g_in, &[2.0, 6.0, 6.0, 12.0][..]);
    }

    #[test]
    fn test_add_mul_constant_branches_skipped() {
        let input = Variable::new(vec![1.0, 2.0]);
        let bias = Variable::new(vec![0.5, 0.5]);
        let scale = Variable::new(vec![2.0, 2.0]);
        let out = add_mul(input.clone(), bias.clone(), scale.clone(), 1);

        // Only bias is tracked; the other branches must not contribute.
        let mut grad = Gradient::new(&[bias.clone()]);
        out.propagate(vec![1.0, 1.0], &mut grad);
        assert_eq!(grad.get(&bias), Some(&[2.0, 2.0][..]));
        assert_eq!(grad.get(&input), None);
        assert_eq!(grad.get(&scale), None);
    }

    #[test]
    #[should_panic(expected = "add_mul: input len 5 != 2 blocks of width 2")]
    fn test_add_mul_bad_input_len() {
        let input = Variable::new(vec![0.0; 5]);
        let bias = Variable::new(vec![0.0; 2]);
        let scale = Variable::new(vec![1.0; 2]);
        add_mul(input, bias, scale, 2);
    }

    #[test]
    #[should_panic(expected = "mul_add: bias len 3 != scale len 2")]
    fn test_mul_add_param_len_mismatch() {
        let input = Variable::new(vec![0.0; 4]);
        let scale = Variable::new(vec![1.0; 2]);
        let bias = Variable::new(vec![0.0; 3]);
        mul_add(input, scale, bias, 2);
    }
}
