use nalgebra::*;

mod gaussian;

pub use gaussian::*;

mod mixture;

pub use mixture::*;

const EPS : f64 = 1E-8;

/// Verifies that the informed matrix is square and symmetric up to a small
/// absolute tolerance, so it can be used as a covariance matrix. Positive
/// definiteness is not required here: a component covariance is allowed to be
/// merely semi-definite (even zero), since only its combination with the
/// observation noise must be invertible.
pub fn is_symmetric(m : &DMatrix<f64>) -> bool {
    if m.nrows() != m.ncols() {
        return false;
    }
    for i in 0..m.nrows() {
        for j in (i + 1)..m.ncols() {
            if (m[(i, j)] - m[(j, i)]).abs() > EPS {
                return false;
            }
        }
    }
    true
}

/// Builds a symmetric matrix from M as (1/2)*(M + M^T). Applied to
/// re-estimated covariances so that accumulated floating-point asymmetries
/// from the matrix products do not drift across iterations.
pub fn build_symmetric(m : DMatrix<f64>) -> DMatrix<f64> {
    assert!(m.nrows() == m.ncols(), "build_symmetric: informed non-square matrix");
    let mt = m.transpose();
    (m + mt).scale(0.5)
}
