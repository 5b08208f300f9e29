use nalgebra::*;
use super::*;
use serde::{Serialize, Deserialize};
use std::fmt::{self, Display};
use rand::Rng;
use anyhow;

/// One component of a latent-space mixture: a multivariate normal with its
/// mixture weight. The amplitude is non-negative but not necessarily
/// normalized in isolation; the mixture owning the component keeps the
/// weights summing to one across components.
///
/// The covariance is kept symmetric by construction and by every
/// re-estimation step. It may be semi-definite: a component that degenerated
/// onto a subspace still yields a valid observable density once the
/// per-observation noise is added on top of it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Gaussian {

    alpha : f64,

    mean : DVector<f64>,

    cov : DMatrix<f64>

}

impl Gaussian {

    /// Builds a new component from an amplitude, a mean vector and a
    /// symmetric covariance matrix.
    pub fn new(alpha : f64, mean : DVector<f64>, cov : DMatrix<f64>) -> Result<Self, anyhow::Error> {
        if !alpha.is_finite() || alpha < 0.0 {
            return Err(anyhow::Error::msg("Amplitude must be finite and non-negative"));
        }
        if mean.nrows() != cov.nrows() || mean.nrows() != cov.ncols() {
            return Err(anyhow::Error::msg("Mismatch between mean vector and covariance sizes"));
        }
        if mean.iter().any(|m| !m.is_finite() ) || cov.iter().any(|c| !c.is_finite() ) {
            return Err(anyhow::Error::msg("Mean or covariance carries a non-finite entry"));
        }
        if !is_symmetric(&cov) {
            return Err(anyhow::Error::msg("Informed covariance matrix is not symmetric"));
        }
        Ok(Self { alpha, mean, cov })
    }

    /// Creates a centered component with identity covariance and the informed
    /// amplitude.
    pub fn standard(dim : usize, alpha : f64) -> Self {
        let mut cov = DMatrix::zeros(dim, dim);
        cov.fill_with_identity();
        Self { alpha, mean : DVector::zeros(dim), cov }
    }

    /// Dimension of the latent space this component lives in.
    pub fn dim(&self) -> usize {
        self.mean.nrows()
    }

    pub fn amplitude(&self) -> f64 {
        self.alpha
    }

    pub fn mean(&self) -> &DVector<f64> {
        &self.mean
    }

    pub fn cov(&self) -> &DMatrix<f64> {
        &self.cov
    }

    pub(crate) fn set_amplitude(&mut self, alpha : f64) {
        self.alpha = alpha;
    }

    pub(crate) fn set_mean(&mut self, mean : DVector<f64>) {
        self.mean = mean;
    }

    pub(crate) fn set_cov(&mut self, cov : DMatrix<f64>) {
        self.cov = cov;
    }

    /// Populates the rows of the destination slice with independent draws
    /// from this component, by scaling standard normal draws with the lower
    /// Cholesky factor of the covariance and offsetting by the mean. Fails if
    /// the covariance is not positive-definite, since a semi-definite
    /// component does not admit a full-rank factorization.
    pub fn sample_into<R>(&self, rng : &mut R, mut dst : DMatrixSliceMut<'_, f64>) -> Result<(), anyhow::Error>
        where R : Rng + ?Sized
    {
        if dst.ncols() != self.dim() {
            return Err(anyhow::Error::msg("Destination columns do not match the component dimension"));
        }
        let chol = Cholesky::new(self.cov.clone())
            .ok_or(anyhow::Error::msg("Covariance is not positive-definite"))?;
        let low = chol.l();
        let mut z = DVector::zeros(self.dim());
        let mut scaled = DVector::zeros(self.dim());
        for mut row in dst.row_iter_mut() {
            for zi in z.iter_mut() {
                *zi = rng.sample(rand_distr::StandardNormal);
            }
            low.mul_to(&z, &mut scaled);
            scaled += &self.mean;
            for (dst_el, src_el) in row.iter_mut().zip(scaled.iter()) {
                *dst_el = *src_el;
            }
        }
        Ok(())
    }

}

impl Display for Gaussian {

    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Gaussian({}; alpha = {:.4})", self.mean.nrows(), self.alpha)
    }

}

#[test]
fn asymmetric_covariance_is_rejected() {
    let cov = DMatrix::from_row_slice(2, 2, &[1.0, 0.3, 0.0, 1.0]);
    assert!(Gaussian::new(1.0, DVector::zeros(2), cov).is_err());
}

#[test]
fn sample_centroid_approaches_mean() {
    use rand::SeedableRng;
    let mut rng = rand::rngs::StdRng::seed_from_u64(42);
    let mean = DVector::from_column_slice(&[1.0, -2.0]);
    let cov = DMatrix::from_row_slice(2, 2, &[0.5, 0.1, 0.1, 0.25]);
    let g = Gaussian::new(1.0, mean.clone(), cov).unwrap();
    let mut draws = DMatrix::zeros(20_000, 2);
    g.sample_into(&mut rng, draws.slice_mut((0, 0), (20_000, 2))).unwrap();
    let centroid = draws.row_mean();
    assert!((centroid[0] - mean[0]).abs() < 0.05);
    assert!((centroid[1] - mean[1]).abs() < 0.05);
}
