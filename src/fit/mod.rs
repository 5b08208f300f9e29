use thiserror::Error;
use crate::prob::Mixture;
use crate::sample::Observation;

/// The expectation-maximization update for noisy, projected mixtures.
pub mod em;

pub use em::{run_em_step, EmControl, EmStep};

/// Failure modes of an estimation call. Configuration and shape problems are
/// detected before any numerical work starts; a singular combined covariance
/// aborts the whole update mid-flight, leaving the model untouched. A
/// component losing all responsibility mass is not an error: it is frozen in
/// place for the remainder of the call.
#[derive(Debug, Clone, Error)]
pub enum EmError {

    #[error("mixture has no components")]
    EmptyMixture,

    #[error("no observations were informed")]
    NoObservations,

    #[error("mixture amplitudes carry no mass")]
    ZeroAmplitudeMass,

    #[error("regularization strength must be non-negative (got {0})")]
    NegativeRegularization(f64),

    #[error("observation {index}: {reason}")]
    BadObservation { index : usize, reason : String },

    #[error("combined covariance of observation {observation} against component {component} is singular")]
    SingularCovariance { observation : usize, component : usize }

}

/// Outcome of an estimation run: where the average log-likelihood landed and
/// how it got there.
#[derive(Debug, Clone)]
pub struct EmFit {

    pub avg_loglike : f64,

    pub iterations : usize,

    pub converged : bool

}

/// Outer expectation-maximization driver: repeatedly applies the update step
/// until the average log-likelihood stops improving by more than the
/// tolerance, or the iteration budget runs out. Initialization, the choice of
/// the number of components and any multi-start strategy are the caller's
/// business; this loop only iterates from whatever model it is given.
///
/// # References
/// Dempster, A. P., Laird, N. M., & Rubin, D. B.
/// ([1977](https://rss.onlinelibrary.wiley.com/doi/abs/10.1111/j.2517-6161.1977.tb01600.x)).
/// Maximum Likelihood from Incomplete Data Via the EM Algorithm.
/// Journal of the Royal Statistical Society: Series B, 39(1), 1-22.
#[derive(Debug, Clone)]
pub struct ExpectMax {

    pub control : EmControl,

    /// Absolute tolerance on the improvement of the average log-likelihood.
    pub tol : f64,

    pub max_iter : usize

}

impl Default for ExpectMax {

    fn default() -> Self {
        Self { control : EmControl::default(), tol : 1e-6, max_iter : 1000 }
    }

}

impl ExpectMax {

    /// Runs the EM loop over the informed observations, updating the mixture
    /// in place. The control's likelihood-only switch is ignored here: a
    /// fitting loop that never moved the parameters would spin until the
    /// iteration budget, so the driver always runs full updates.
    pub fn fit(&self, data : &[Observation], mixture : &mut Mixture) -> Result<EmFit, EmError> {
        self.fit_with(data, mixture, |_, _| {})
    }

    /// Same as fit, but reports (iteration, average log-likelihood) to the
    /// observer after every step, for progress display.
    pub fn fit_with<F>(&self, data : &[Observation], mixture : &mut Mixture, mut observer : F) -> Result<EmFit, EmError>
        where F : FnMut(usize, f64)
    {
        let mut control = self.control.clone();
        control.likelihood_only = false;
        let mut prev = f64::NEG_INFINITY;
        for iteration in 1..=self.max_iter {
            let step = run_em_step(data, mixture, &control)?;
            observer(iteration, step.avg_loglike);
            log::debug!("EM iteration {}: avg loglike = {}", iteration, step.avg_loglike);
            if (step.avg_loglike - prev).abs() < self.tol {
                return Ok(EmFit { avg_loglike : step.avg_loglike, iterations : iteration, converged : true });
            }
            prev = step.avg_loglike;
        }
        Ok(EmFit { avg_loglike : prev, iterations : self.max_iter, converged : false })
    }

}
