//! Shared helpers for the integration tests.
#![allow(dead_code)]

use cinder::Scalar;
use rand::rngs::StdRng;
use rand::Rng;

pub fn init() {
    cinder::init_logger();
}

/// Combined absolute/relative closeness check.
pub fn assert_close(actual: f32, expected: f32, tol: f32) {
    let scale = expected.abs().max(1.0);
    assert!(
        (actual - expected).abs() <= tol * scale,
        "expected {expected}, got {actual} (tol {tol})"
    );
}

/// Closeness check that also accepts matching non-finite results:
/// interpreted and compiled passes run the same IEEE operations in the
/// same order, so NaN/Inf must agree rather than fail the comparison.
pub fn assert_float_matches(actual: f32, expected: f32, tol: f32) {
    if actual.is_nan() && expected.is_nan() {
        return;
    }
    if actual.is_infinite() || expected.is_infinite() {
        assert_eq!(actual, expected, "non-finite results diverged");
        return;
    }
    assert_close(actual, expected, tol);
}

/// Centred finite-difference estimate of `∂root/∂leaf` at the leaf's
/// current value, restoring the leaf and the DAG afterwards.
pub fn numeric_partial(root: &Scalar, leaf: &Scalar, h: f32) -> f32 {
    let x = leaf.value();
    leaf.set_value(x + h);
    root.forward();
    let plus = root.value();
    leaf.set_value(x - h);
    root.forward();
    let minus = root.value();
    let width = (x + h) - (x - h);
    leaf.set_value(x);
    root.forward();
    (plus - minus) / width
}

/// Random expression over `vars`: uniform over the four arithmetic
/// operations at inner levels, forced to a leaf once `max_depth` runs
/// out and away from leaves while `min_depth` remains.
pub fn random_expression(rng: &mut StdRng, min_depth: i32, max_depth: i32, vars: &[Scalar]) -> Scalar {
    let lo = if max_depth <= 0 { 4 } else { 0 };
    let hi = if min_depth <= 0 { 8 } else { 3 };
    match rng.gen_range(lo..=hi) {
        0 => {
            random_expression(rng, min_depth - 1, max_depth - 1, vars)
                + random_expression(rng, min_depth - 1, max_depth - 1, vars)
        }
        1 => {
            random_expression(rng, min_depth - 1, max_depth - 1, vars)
                - random_expression(rng, min_depth - 1, max_depth - 1, vars)
        }
        2 => {
            random_expression(rng, min_depth - 1, max_depth - 1, vars)
                * random_expression(rng, min_depth - 1, max_depth - 1, vars)
        }
        3 => {
            random_expression(rng, min_depth - 1, max_depth - 1, vars)
                / random_expression(rng, min_depth - 1, max_depth - 1, vars)
        }
        _ => vars[rng.gen_range(0..vars.len())].clone(),
    }
}
