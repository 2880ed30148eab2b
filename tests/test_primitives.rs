// Integration tests for the fused statistic and affine primitives.
// Each fused node is held to the generic-op composition it replaces, for
// both forward outputs and backward gradients on every operand.

use std::rc::Rc;

use approx::assert_abs_diff_eq;
use batchnorm::graph::{
    add, add_scalar, mul, pow, repeat, scale, slice, square, Gradient, Value, Variable,
};
use batchnorm::primitives::{add_mul, mean, mean_of_squares, mul_add, std_dev};
use batchnorm::utils::SimpleRng;

const TOLERANCE: f64 = 1e-5;

// ============================================================================
// Generic-composition references
// ============================================================================

/// Per-channel mean via slice/add/scale nodes.
fn generic_mean(input: Rc<dyn Value>, width: usize) -> Rc<dyn Value> {
    let n = input.output().len() / width;
    let mut sum = slice(Rc::clone(&input), 0, width);
    for i in 1..n {
        sum = add(sum, slice(Rc::clone(&input), i * width, (i + 1) * width));
    }
    scale(sum, 1.0 / n as f64)
}

fn generic_mean_of_squares(input: Rc<dyn Value>, width: usize) -> Rc<dyn Value> {
    generic_mean(square(input), width)
}

/// sqrt(meanSquare - mean^2 + stabilizer) via generic nodes.
fn generic_std_dev(
    mean_node: Rc<dyn Value>,
    mean_square: Rc<dyn Value>,
    stabilizer: f64,
) -> Rc<dyn Value> {
    let neg_sq = scale(square(mean_node), -1.0);
    pow(add_scalar(add(mean_square, neg_sq), stabilizer), 0.5)
}

fn generic_add_mul(
    input: Rc<dyn Value>,
    bias: Rc<dyn Value>,
    scale_v: Rc<dyn Value>,
    n: usize,
) -> Rc<dyn Value> {
    mul(add(input, repeat(bias, n)), repeat(scale_v, n))
}

fn generic_mul_add(
    input: Rc<dyn Value>,
    scale_v: Rc<dyn Value>,
    bias: Rc<dyn Value>,
    n: usize,
) -> Rc<dyn Value> {
    add(mul(input, repeat(scale_v, n)), repeat(bias, n))
}

fn assert_outputs_close(fused: &Rc<dyn Value>, reference: &Rc<dyn Value>) {
    let f = fused.output();
    let r = reference.output();
    assert_eq!(f.len(), r.len());
    for (a, b) in f.iter().zip(&r) {
        assert_abs_diff_eq!(a, b, epsilon = TOLERANCE);
    }
}

fn assert_gradients_close(fused: &Gradient, reference: &Gradient, var: &Rc<Variable>) {
    let f = fused.get(var).expect("fused gradient missing");
    let r = reference.get(var).expect("reference gradient missing");
    assert_eq!(f.len(), r.len());
    for (a, b) in f.iter().zip(r) {
        assert_abs_diff_eq!(a, b, epsilon = TOLERANCE);
    }
}

// ============================================================================
// AddMul / MulAdd fusion equivalence
// ============================================================================

#[test]
fn test_add_mul_matches_generic_composition() {
    let mut rng = SimpleRng::new(42);
    for &(width, n) in &[(1usize, 1usize), (2, 5), (3, 4), (7, 2)] {
        let input = Variable::new(rng.gen_vec(width * n, -2.0, 2.0));
        let bias = Variable::new(rng.gen_vec(width, -1.0, 1.0));
        let scale_v = Variable::new(rng.gen_vec(width, -1.5, 1.5));

        let fused = add_mul(input.clone(), bias.clone(), scale_v.clone(), n);
        let reference = generic_add_mul(input.clone(), bias.clone(), scale_v.clone(), n);
        assert_outputs_close(&fused, &reference);

        let upstream = rng.gen_vec(width * n, -1.0, 1.0);
        let tracked = [input.clone(), bias.clone(), scale_v.clone()];
        let mut g_fused = Gradient::new(&tracked);
        let mut g_ref = Gradient::new(&tracked);
        fused.propagate(upstream.clone(), &mut g_fused);
        reference.propagate(upstream, &mut g_ref);

        assert_gradients_close(&g_fused, &g_ref, &input);
        assert_gradients_close(&g_fused, &g_ref, &bias);
        assert_gradients_close(&g_fused, &g_ref, &scale_v);
    }
}

#[test]
fn test_mul_add_matches_generic_composition() {
    let mut rng = SimpleRng::new(271828);
    for &(width, n) in &[(1usize, 3usize), (2, 5), (5, 5), (11, 1)] {
        let input = Variable::new(rng.gen_vec(width * n, -3.0, 3.0));
        let scale_v = Variable::new(rng.gen_vec(width, -1.0, 1.0));
        let bias = Variable::new(rng.gen_vec(width, -0.5, 0.5));

        let fused = mul_add(input.clone(), scale_v.clone(), bias.clone(), n);
        let reference = generic_mul_add(input.clone(), scale_v.clone(), bias.clone(), n);
        assert_outputs_close(&fused, &reference);

        let upstream = rng.gen_vec(width * n, -2.0, 2.0);
        let tracked = [input.clone(), bias.clone(), scale_v.clone()];
        let mut g_fused = Gradient::new(&tracked);
        let mut g_ref = Gradient::new(&tracked);
        fused.propagate(upstream.clone(), &mut g_fused);
        reference.propagate(upstream, &mut g_ref);

        assert_gradients_close(&g_fused, &g_ref, &input);
        assert_gradients_close(&g_fused, &g_ref, &bias);
        assert_gradients_close(&g_fused, &g_ref, &scale_v);
    }
}

#[test]
fn test_add_mul_partial_constancy_matches_generic() {
    // Only the parameters are tracked; the input branch must be skipped by
    // both formulations without disturbing the parameter gradients.
    let mut rng = SimpleRng::new(7);
    let input = Variable::new(rng.gen_vec(6, -1.0, 1.0));
    let bias = Variable::new(rng.gen_vec(2, -1.0, 1.0));
    let scale_v = Variable::new(rng.gen_vec(2, -1.0, 1.0));

    let fused = add_mul(input.clone(), bias.clone(), scale_v.clone(), 3);
    let reference = generic_add_mul(input.clone(), bias.clone(), scale_v.clone(), 3);

    let tracked = [bias.clone(), scale_v.clone()];
    let upstream = rng.gen_vec(6, -1.0, 1.0);
    let mut g_fused = Gradient::new(&tracked);
    let mut g_ref = Gradient::new(&tracked);
    fused.propagate(upstream.clone(), &mut g_fused);
    reference.propagate(upstream, &mut g_ref);

    assert_gradients_close(&g_fused, &g_ref, &bias);
    assert_gradients_close(&g_fused, &g_ref, &scale_v);
    assert_eq!(g_fused.get(&input), None);
}

// ============================================================================
// Mean / MeanOfSquares / StdDev correctness
// ============================================================================

#[test]
fn test_mean_matches_generic_composition() {
    let mut rng = SimpleRng::new(1001);
    for &(width, n) in &[(1usize, 4usize), (2, 1), (3, 7), (8, 3)] {
        let input = Variable::new(rng.gen_vec(width * n, -5.0, 5.0));

        let fused = mean(input.clone(), width);
        let reference = generic_mean(input.clone(), width);
        assert_outputs_close(&fused, &reference);

        let upstream = rng.gen_vec(width, -1.0, 1.0);
        let tracked = [input.clone()];
        let mut g_fused = Gradient::new(&tracked);
        let mut g_ref = Gradient::new(&tracked);
        fused.propagate(upstream.clone(), &mut g_fused);
        reference.propagate(upstream, &mut g_ref);
        assert_gradients_close(&g_fused, &g_ref, &input);
    }
}

#[test]
fn test_mean_of_squares_matches_generic_composition() {
    let mut rng = SimpleRng::new(2002);
    for &(width, n) in &[(1usize, 2usize), (2, 5), (4, 4)] {
        let input = Variable::new(rng.gen_vec(width * n, -2.0, 2.0));

        let fused = mean_of_squares(input.clone(), width);
        let reference = generic_mean_of_squares(input.clone(), width);
        assert_outputs_close(&fused, &reference);

        let upstream = rng.gen_vec(width, -1.0, 1.0);
        let tracked = [input.clone()];
        let mut g_fused = Gradient::new(&tracked);
        let mut g_ref = Gradient::new(&tracked);
        fused.propagate(upstream.clone(), &mut g_fused);
        reference.propagate(upstream, &mut g_ref);
        assert_gradients_close(&g_fused, &g_ref, &input);
    }
}

#[test]
fn test_std_dev_matches_generic_composition() {
    let mut rng = SimpleRng::new(3003);
    let stabilizer = 1e-4;
    for &width in &[1usize, 2, 6] {
        // Keep meanSquare - mean^2 positive: means small, squares offset up.
        let mean_data = rng.gen_vec(width, -0.5, 0.5);
        let square_data: Vec<f64> = mean_data
            .iter()
            .map(|m| m * m + rng.gen_range_f64(0.1, 2.0))
            .collect();
        let m = Variable::new(mean_data);
        let ms = Variable::new(square_data);

        let fused = std_dev(m.clone(), ms.clone(), stabilizer);
        let reference = generic_std_dev(m.clone(), ms.clone(), stabilizer);
        assert_outputs_close(&fused, &reference);

        let upstream = rng.gen_vec(width, -1.0, 1.0);
        let tracked = [m.clone(), ms.clone()];
        let mut g_fused = Gradient::new(&tracked);
        let mut g_ref = Gradient::new(&tracked);
        fused.propagate(upstream.clone(), &mut g_fused);
        reference.propagate(upstream, &mut g_ref);
        assert_gradients_close(&g_fused, &g_ref, &m);
        assert_gradients_close(&g_fused, &g_ref, &ms);
    }
}

#[test]
fn test_mean_against_direct_arithmetic() {
    // Mean of each channel position across blocks, computed by hand.
    let mut rng = SimpleRng::new(4004);
    let width = 3;
    let n = 5;
    let data = rng.gen_vec(width * n, -10.0, 10.0);
    let m = mean(Variable::new(data.clone()), width);

    let out = m.output();
    for c in 0..width {
        let expected: f64 = (0..n).map(|i| data[i * width + c]).sum::<f64>() / n as f64;
        assert_abs_diff_eq!(out[c], expected, epsilon = 1e-12);
    }
}
