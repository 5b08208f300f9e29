/// Model types for latent-space Gaussian mixtures: a single component
/// (amplitude, mean, covariance) and the full mixture with its per-component
/// re-estimation constraints.
pub mod prob;

/// Observation types: heterogeneous, noisy data points that may live in a
/// lower-dimensional projection of the model's latent space, plus CSV loading.
pub mod sample;

/// Numeric helpers shared by the estimation routines (stable log-sum-exp
/// reductions over slices and matrix rows/columns).
pub mod calc;

/// Estimation: the expectation-maximization update for noisy projected
/// mixtures and the outer driver that iterates it to convergence.
pub mod fit;
