use nalgebra::*;

/// Stable log of the summed exponentials of the informed values: the maximum
/// is factored out before exponentiation so that rows of very negative
/// log-probabilities do not underflow to zero. An empty or all -inf input
/// yields -inf (the log of zero total mass).
pub fn log_sum_exp(vals : impl Iterator<Item=f64> + Clone) -> f64 {
    let max = vals.clone().fold(f64::NEG_INFINITY, f64::max);
    if !max.is_finite() {
        return max;
    }
    let sum : f64 = vals.map(|v| (v - max).exp() ).sum();
    max + sum.ln()
}

/// Log-sum-exp across the columns of row i.
pub fn row_log_sum_exp(m : &DMatrix<f64>, i : usize) -> f64 {
    log_sum_exp(m.row(i).iter().cloned().collect::<Vec<_>>().into_iter())
}

/// Log-sum-exp down the rows of column j.
pub fn col_log_sum_exp(m : &DMatrix<f64>, j : usize) -> f64 {
    log_sum_exp(m.column(j).iter().cloned().collect::<Vec<_>>().into_iter())
}

#[test]
fn log_sum_exp_matches_direct_sum() {
    let vals = [-1.0, 0.5, 2.0];
    let direct : f64 = vals.iter().map(|v| v.exp() ).sum();
    let lse = log_sum_exp(vals.iter().cloned());
    assert!((lse - direct.ln()).abs() < 1e-12);
}

#[test]
fn log_sum_exp_factors_out_large_magnitudes() {
    // Direct exponentiation of those entries would underflow to zero.
    let vals = [-1200.0, -1201.0];
    let lse = log_sum_exp(vals.iter().cloned());
    assert!((lse - (-1200.0 + (1.0 + (-1.0f64).exp()).ln())).abs() < 1e-9);
}

#[test]
fn log_sum_exp_of_empty_mass_is_neg_infinity() {
    assert_eq!(log_sum_exp(std::iter::empty::<f64>()), f64::NEG_INFINITY);
    let vals = [f64::NEG_INFINITY, f64::NEG_INFINITY];
    assert_eq!(log_sum_exp(vals.iter().cloned()), f64::NEG_INFINITY);
}
