//! Shared helpers for the integration tests
#![allow(dead_code)]

use tisslm::{Parameter, Tensor};

/// Central-difference step
pub const EPS: f32 = 3e-3;

/// Allowed relative error per gradient entry
pub const RTOL: f64 = 1e-2;

/// Absolute floor for f32 round-off in the loss differences
pub const ATOL: f64 = 3e-3;

/// `Σ out ⊙ weights`, accumulated in f64
///
/// Using a fixed random `weights` tensor as the upstream gradient turns any
/// tensor-valued forward into a scalar loss whose gradient is `weights`.
pub fn weighted_sum(out: &Tensor, weights: &Tensor) -> f32 {
    assert_eq!(out.shape(), weights.shape());
    out.data()
        .iter()
        .zip(weights.data())
        .map(|(&a, &b)| a as f64 * b as f64)
        .sum::<f64>() as f32
}

fn sample_indices(n: usize, max: usize) -> Vec<usize> {
    if n <= max {
        (0..n).collect()
    } else {
        (0..max).map(|k| k * n / max).collect()
    }
}

/// Numerical derivative from three loss evaluations at `-EPS`, `0`, `+EPS`
///
/// Returns `None` when the one-sided slopes disagree by more than twice the
/// comparison tolerance. That happens when the step straddles a ReLU kink,
/// where the central difference is off by half the slope jump.
fn central_difference(minus: f32, center: f32, plus: f32) -> Option<f64> {
    let eps = EPS as f64;
    let forward = (plus as f64 - center as f64) / eps;
    let backward = (center as f64 - minus as f64) / eps;
    let jump = (forward - backward).abs();
    if jump > 2.0 * (RTOL * forward.abs().max(backward.abs()) + ATOL) {
        return None;
    }
    Some((plus as f64 - minus as f64) / (2.0 * eps))
}

/// Element-wise comparison of analytic and numerical gradients
///
/// Each entry must satisfy `|a - n| ≤ RTOL · max(|a|, |n|) + ATOL`.
pub fn assert_grads_close(label: &str, analytic: &[f32], numeric: &[f64]) {
    for (i, (&a, &n)) in analytic.iter().zip(numeric).enumerate() {
        let a = a as f64;
        let err = (a - n).abs();
        let tol = RTOL * a.abs().max(n.abs()) + ATOL;
        assert!(
            err <= tol,
            "{label}[{i}]: analytic {a} vs numeric {n} (err {err}, tol {tol})\n analytic {analytic:?}\n numeric  {numeric:?}"
        );
    }
}

/// At least a quarter of the samples must survive the kink filter
fn assert_enough_samples(label: &str, kept: usize, total: usize) {
    assert!(
        kept * 4 >= total && kept > 0,
        "{label}: only {kept} of {total} samples were smooth enough to compare"
    );
}

/// Finite-difference check of every parameter's accumulated gradient
///
/// The caller has already run forward and backward so `grad` holds the
/// analytic gradient of `loss`. `loss` reruns the forward pass only.
pub fn check_param_grads<M>(
    module: &mut M,
    mut loss: impl FnMut(&mut M) -> f32,
    params: impl Fn(&mut M) -> Vec<&mut Parameter>,
) {
    let count = params(module).len();
    assert!(count > 0);
    let center = loss(module);
    let (mut kept, mut total) = (0, 0);

    for p in 0..count {
        let (name, n) = {
            let ps = params(module);
            (ps[p].name.clone(), ps[p].numel())
        };
        let mut analytic = Vec::new();
        let mut numeric = Vec::new();
        for i in sample_indices(n, 12) {
            let orig = params(module)[p].value.data()[i];
            params(module)[p].value.data_mut()[i] = orig + EPS;
            let plus = loss(module);
            params(module)[p].value.data_mut()[i] = orig - EPS;
            let minus = loss(module);
            params(module)[p].value.data_mut()[i] = orig;

            total += 1;
            if let Some(d) = central_difference(minus, center, plus) {
                kept += 1;
                numeric.push(d);
                analytic.push(params(module)[p].grad.data()[i]);
            }
        }
        assert_grads_close(&name, &analytic, &numeric);
    }
    assert_enough_samples("parameters", kept, total);
}

/// Finite-difference check of an input gradient
pub fn check_input_grad(x: &Tensor, analytic: &Tensor, mut loss: impl FnMut(&Tensor) -> f32) {
    assert_eq!(x.shape(), analytic.shape());
    let center = loss(x);
    let mut shifted = x.clone();
    let mut a = Vec::new();
    let mut numeric = Vec::new();
    let indices = sample_indices(x.numel(), 16);
    for &i in &indices {
        let orig = shifted.data()[i];
        shifted.data_mut()[i] = orig + EPS;
        let plus = loss(&shifted);
        shifted.data_mut()[i] = orig - EPS;
        let minus = loss(&shifted);
        shifted.data_mut()[i] = orig;

        if let Some(d) = central_difference(minus, center, plus) {
            numeric.push(d);
            a.push(analytic.data()[i]);
        }
    }
    assert_enough_samples("input", a.len(), indices.len());
    assert_grads_close("input", &a, &numeric);
}
