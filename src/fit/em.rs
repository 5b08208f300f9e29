use nalgebra::*;
use std::f64::consts::PI;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::thread;
use super::EmError;
use crate::calc;
use crate::prob::{build_symmetric, Gaussian, Mixture};
use crate::sample::{Noise, Observation};

/// How many observations a worker claims at a time. Observations of
/// different dimensionality cost different amounts to score, so workers keep
/// claiming chunks dynamically rather than splitting the data up front.
const CHUNK : usize = 100;

/// Switches of a single estimation step.
#[derive(Debug, Clone)]
pub struct EmControl {

    /// Evaluate the average log-likelihood of the current model and stop:
    /// no parameter is touched.
    pub likelihood_only : bool,

    /// Wishart-style prior weight (>= 0) added to the re-estimated
    /// covariances. A positive value keeps covariances positive-definite
    /// when a component's responsibility mass gets small.
    pub regularization : f64,

    /// Treat every observation as living directly in the latent space,
    /// skipping the projection operators entirely.
    pub no_projection : bool,

    /// Expect every observation's noise as per-coordinate variances instead
    /// of a full covariance matrix.
    pub diagonal_noise : bool,

    /// Ignore per-observation log-weights; amplitudes are normalized by the
    /// raw observation count instead of the weighted mass.
    pub no_weighting : bool,

    /// Size of the worker pool; defaults to the available parallelism.
    pub threads : Option<usize>

}

impl Default for EmControl {

    fn default() -> Self {
        Self {
            likelihood_only : false,
            regularization : 0.0,
            no_projection : false,
            diagonal_noise : false,
            no_weighting : false,
            threads : None
        }
    }

}

/// Outcome of one estimation step. The responsibility matrix holds the
/// normalized log-responsibilities (observations over rows, components over
/// columns); callers that only want the likelihood can drop it.
#[derive(Debug, Clone)]
pub struct EmStep {

    pub avg_loglike : f64,

    pub responsibilities : DMatrix<f64>

}

/// Posterior contribution of the current observation against one component,
/// private to the worker that computed it. Overwritten at every observation;
/// the ordered fold reads it before the worker moves on.
struct Scratch {

    /// Posterior mean b.
    mean : DVector<f64>,

    /// Combined second moment b b^T + B.
    second : DMatrix<f64>

}

impl Scratch {

    fn new(dim : usize) -> Self {
        Self { mean : DVector::zeros(dim), second : DMatrix::zeros(dim, dim) }
    }

}

/// Shared reduction state. Workers score observations in parallel, but fold
/// their contributions here strictly in observation order: the ticket only
/// advances once the observation holding it has committed. Summation order is
/// therefore fixed regardless of the worker count, which makes the likelihood
/// and the fitted parameters bit-reproducible.
struct Accum {

    turn : usize,

    error : Option<EmError>,

    loglike : f64,

    resp : DMatrix<f64>,

    mean_stat : Vec<DVector<f64>>,

    second_stat : Vec<DMatrix<f64>>

}

struct OrderedFold {

    state : Mutex<Accum>,

    ready : Condvar,

    abort : AtomicBool

}

impl OrderedFold {

    fn new(n : usize, k : usize, dim : usize) -> Self {
        let accum = Accum {
            turn : 0,
            error : None,
            loglike : 0.0,
            resp : DMatrix::zeros(n, k),
            mean_stat : (0..k).map(|_| DVector::zeros(dim) ).collect(),
            second_stat : (0..k).map(|_| DMatrix::zeros(dim, dim) ).collect()
        };
        Self { state : Mutex::new(accum), ready : Condvar::new(), abort : AtomicBool::new(false) }
    }

    /// Blocks until observation i holds the commit ticket. Returns None when
    /// the update was aborted by a failure on another worker.
    fn wait_turn(&self, i : usize) -> Option<MutexGuard<'_, Accum>> {
        let mut state = self.state.lock().unwrap();
        while state.turn != i && !self.abort.load(Ordering::SeqCst) {
            state = self.ready.wait(state).unwrap();
        }
        if self.abort.load(Ordering::SeqCst) {
            None
        } else {
            Some(state)
        }
    }

    /// Passes the ticket to the next observation and wakes the waiters.
    fn advance(&self, mut state : MutexGuard<'_, Accum>) {
        state.turn += 1;
        drop(state);
        self.ready.notify_all();
    }

    /// Records the first failure and wakes every waiter so the pool drains.
    fn fail(&self, error : EmError) {
        let mut state = self.state.lock().unwrap();
        if state.error.is_none() {
            state.error = Some(error);
        }
        self.abort.store(true, Ordering::SeqCst);
        drop(state);
        self.ready.notify_all();
    }

    fn aborted(&self) -> bool {
        self.abort.load(Ordering::SeqCst)
    }

}

/// Marker for a combined covariance that could not be inverted; the caller
/// attaches the offending (observation, component) pair.
struct Singular;

/// One expectation-maximization update of the mixture against the informed
/// observations, following Bovy, Hogg & Roweis
/// ([2011](https://arxiv.org/abs/0905.2979)): every observation is explained
/// as a noisy, possibly projected draw from the latent mixture, so the fitted
/// model describes the intrinsic distribution with the measurement errors
/// deconvolved away.
///
/// The model is updated in place unless the control requests a
/// likelihood-only evaluation. Validation and scoring failures leave the
/// model exactly as it was. The returned average log-likelihood refers to the
/// model as it was when the call started.
pub fn run_em_step(data : &[Observation], mixture : &mut Mixture, control : &EmControl) -> Result<EmStep, EmError> {
    validate(data, mixture, control)?;
    let n = data.len();
    let k = mixture.len();
    let dim = mixture.dim();

    // Per-call tri-state: flags start from the configured constraints and
    // may flip to frozen when a component ends up with no responsibility
    // mass. The configured constraints on the mixture itself are never
    // written back.
    let mut fix_amp : Vec<bool> = mixture.fixed().iter().map(|f| f.amplitude ).collect();
    let mut fix_mean : Vec<bool> = mixture.fixed().iter().map(|f| f.mean ).collect();
    let mut fix_cov : Vec<bool> = mixture.fixed().iter().map(|f| f.cov ).collect();
    let mut all_fixed : Vec<bool> = mixture.fixed().iter().map(|f| f.is_all_fixed() ).collect();
    let fixed_amp_mass : f64 = mixture.components().iter()
        .zip(fix_amp.iter())
        .filter(|(_, fixed)| **fixed )
        .map(|(c, _)| c.amplitude() )
        .sum();

    let workers = control.threads
        .unwrap_or_else(|| thread::available_parallelism().map(|p| p.get() ).unwrap_or(1) )
        .max(1)
        .min(n);
    let fold = OrderedFold::new(n, k, dim);
    let next = AtomicUsize::new(0);
    {
        let model : &Mixture = mixture;
        let fold = &fold;
        let next = &next;
        let all_fixed = &all_fixed;
        thread::scope(|scope| {
            for _ in 0..workers {
                scope.spawn(move || score_worker(data, model, control, all_fixed, next, fold) );
            }
        });
    }

    let accum = fold.state.into_inner().unwrap();
    if let Some(error) = accum.error {
        return Err(error);
    }
    let Accum { loglike, resp, mean_stat, second_stat, .. } = accum;
    let avg_loglike = loglike / n as f64;
    if control.likelihood_only {
        return Ok(EmStep { avg_loglike, responsibilities : resp });
    }

    // M-step: closed-form re-estimation from the reduced statistics,
    // sequential over components.
    for j in 0..k {
        if all_fixed[j] {
            continue;
        }
        let mass = calc::col_log_sum_exp(&resp, j).exp();
        let mass = if mass < f64::MIN_POSITIVE { 0.0 } else { mass };
        if !fix_amp[j] {
            mixture.component_mut(j).set_amplitude(mass);
        }
        if mass == 0.0 {
            // No observation supports this component: it cannot be
            // re-estimated safely, so it stays frozen for the rest of the
            // call (including the amplitude renormalization below).
            fix_amp[j] = true;
            fix_mean[j] = true;
            fix_cov[j] = true;
            all_fixed[j] = true;
            continue;
        }
        if !fix_mean[j] {
            mixture.component_mut(j).set_mean(mean_stat[j].unscale(mass));
        }
        if !fix_cov[j] {
            let mut cov = second_stat[j].clone();
            let mean = mixture.component(j).mean().clone();
            if !fix_mean[j] {
                // The statistic folded the mean term in; remove it about the
                // freshly updated mean.
                cov.ger(-mass, &mean, &mean, 1.0);
            } else {
                // Correction about the held-fixed mean, without ever forming
                // a difference vector.
                cov.ger(mass, &mean, &mean, 1.0);
                cov.ger(-mass, &mean, &mean_stat[j], 1.0);
                cov.ger(-mass, &mean_stat[j], &mean, 1.0);
            }
            if control.regularization > 0.0 {
                for l in 0..dim {
                    cov[(l, l)] += control.regularization;
                }
                cov.unscale_mut(mass + 1.0);
            } else {
                cov.unscale_mut(mass);
            }
            mixture.component_mut(j).set_cov(build_symmetric(cov));
        }
    }

    // Renormalize the amplitudes so the mixture weights sum to one, keeping
    // whatever mass the configured-fixed amplitudes already claim.
    if fixed_amp_mass == 0.0 && control.no_weighting {
        for j in 0..k {
            let alpha = mixture.component(j).amplitude() / n as f64;
            mixture.component_mut(j).set_amplitude(alpha);
        }
    } else {
        let free_mass : f64 = (0..k)
            .filter(|j| !fix_amp[*j] )
            .map(|j| mixture.component(j).amplitude() )
            .sum();
        for j in 0..k {
            if !fix_amp[j] {
                let alpha = mixture.component(j).amplitude() / free_mass * (1.0 - fixed_amp_mass);
                mixture.component_mut(j).set_amplitude(alpha);
            }
        }
    }

    Ok(EmStep { avg_loglike, responsibilities : resp })
}

/// Configuration checks, all performed before any numerical work: an invalid
/// call must not leave a partially updated model behind.
fn validate(data : &[Observation], mixture : &Mixture, control : &EmControl) -> Result<(), EmError> {
    if mixture.is_empty() {
        return Err(EmError::EmptyMixture);
    }
    if data.is_empty() {
        return Err(EmError::NoObservations);
    }
    // An all-zero amplitude vector would turn every row of the
    // responsibility matrix into the log of zero mass.
    if mixture.components().iter().all(|c| c.amplitude() == 0.0 ) {
        return Err(EmError::ZeroAmplitudeMass);
    }
    if control.regularization < 0.0 {
        return Err(EmError::NegativeRegularization(control.regularization));
    }
    let dim = mixture.dim();
    for (index, obs) in data.iter().enumerate() {
        let bad = |reason : String| EmError::BadObservation { index, reason };
        match (control.diagonal_noise, obs.noise()) {
            (true, Noise::Full(_)) =>
                return Err(bad(String::from("expected diagonal noise variances, found a full covariance"))),
            (false, Noise::Diagonal(_)) =>
                return Err(bad(String::from("expected a full noise covariance, found diagonal variances"))),
            _ => { }
        }
        if control.no_projection {
            if obs.projection().is_some() {
                return Err(bad(String::from("carries a projection operator, but projection is disabled")));
            }
            if obs.dim() != dim {
                return Err(bad(format!("dimension {} does not match the latent dimension {}", obs.dim(), dim)));
            }
        } else {
            match obs.projection() {
                Some(proj) => {
                    if proj.nrows() != obs.dim() || proj.ncols() != dim {
                        return Err(bad(format!(
                            "projection is {}x{}, expected {}x{}",
                            proj.nrows(), proj.ncols(), obs.dim(), dim
                        )));
                    }
                },
                None => return Err(bad(String::from("is missing its projection operator")))
            }
        }
    }
    Ok(())
}

/// Worker loop: claim a chunk of observations, score each against every
/// component into private scratch, then commit the observation's row and
/// statistics through the ordered fold.
fn score_worker(
    data : &[Observation],
    model : &Mixture,
    control : &EmControl,
    all_fixed : &[bool],
    next : &AtomicUsize,
    fold : &OrderedFold
) {
    let k = model.len();
    let mut scratch : Vec<Scratch> = (0..k).map(|_| Scratch::new(model.dim()) ).collect();
    let mut row = vec![0.0; k];
    loop {
        let start = next.fetch_add(CHUNK, Ordering::SeqCst);
        if start >= data.len() {
            return;
        }
        let end = (start + CHUNK).min(data.len());
        for i in start..end {
            if fold.aborted() {
                return;
            }
            for j in 0..k {
                match score(&data[i], model.component(j), &mut scratch[j]) {
                    Ok(logq) => row[j] = logq,
                    Err(Singular) => {
                        fold.fail(EmError::SingularCovariance { observation : i, component : j });
                        return;
                    }
                }
            }
            let lse = calc::log_sum_exp(row.iter().cloned());
            let log_weight = if control.no_weighting { 0.0 } else { data[i].log_weight() };
            let mut state = match fold.wait_turn(i) {
                Some(state) => state,
                None => return
            };
            state.loglike += if control.no_weighting { lse } else { lse * log_weight.exp() };
            for j in 0..k {
                let norm = row[j] - lse + log_weight;
                state.resp[(i, j)] = norm;
                if !all_fixed[j] {
                    let resp = norm.exp();
                    state.mean_stat[j].axpy(resp, &scratch[j].mean, 1.0);
                    for (dst, src) in state.second_stat[j].iter_mut().zip(scratch[j].second.iter()) {
                        *dst += resp * *src;
                    }
                }
            }
            fold.advance(state);
        }
    }
}

/// Scores one (observation, component) pair: unnormalized log-responsibility
/// plus the posterior mean and combined second moment left in the worker's
/// scratch. Touches only read-only shared inputs and the scratch; the
/// temporaries live for this call only, keeping peak memory proportional to
/// the worker count rather than the data size.
fn score(obs : &Observation, comp : &Gaussian, scratch : &mut Scratch) -> Result<f64, Singular> {
    let obs_dim = obs.dim();

    // Combined covariance T = S + R V R^T (or S + V in the latent space).
    let mut combined = match obs.noise() {
        Noise::Full(s) => s.clone(),
        Noise::Diagonal(v) => DMatrix::from_diagonal(v)
    };
    match obs.projection() {
        Some(proj) => {
            let vrt = comp.cov() * proj.transpose();
            combined.gemm(1.0, proj, &vrt, 1.0);
        },
        None => combined += comp.cov()
    }

    let lu = LU::new(combined);
    let inv = match lu.try_inverse() {
        Some(inv) => inv,
        None => return Err(Singular)
    };
    // Log-determinant from the factor diagonal; |T| must come out positive
    // for T to be a usable covariance.
    let mut sign : f64 = lu.p().determinant();
    let mut ln_det = 0.0;
    for pivot in lu.u().diagonal().iter() {
        if *pivot == 0.0 || !pivot.is_finite() {
            return Err(Singular);
        }
        sign *= pivot.signum();
        ln_det += pivot.abs().ln();
    }
    if sign <= 0.0 {
        return Err(Singular);
    }

    // Residual r = w - R m (or w - m) and Mahalanobis exponent r^T T^-1 r.
    let mut resid = obs.values().clone();
    match obs.projection() {
        Some(proj) => resid.gemv(-1.0, proj, comp.mean(), 1.0),
        None => resid -= comp.mean()
    }
    let inv_resid = &inv * &resid;
    let exponent = resid.dot(&inv_resid);

    let logq = comp.amplitude().ln()
        - 0.5 * obs_dim as f64 * (2.0 * PI).ln()
        - 0.5 * ln_det
        - 0.5 * exponent;
    if logq.is_nan() {
        return Err(Singular);
    }

    // Posterior mean b = m + V R^T T^-1 r and covariance (Schur complement)
    // B = V - V R^T T^-1 R V; the scratch keeps b b^T + B, built by a rank-1
    // update onto B to limit cancellation.
    scratch.mean.copy_from(comp.mean());
    match obs.projection() {
        Some(proj) => {
            let vrt = comp.cov() * proj.transpose();
            scratch.mean.gemv(1.0, &vrt, &inv_resid, 1.0);
            let vrt_inv = &vrt * &inv;
            scratch.second.copy_from(comp.cov());
            scratch.second.gemm(-1.0, &vrt_inv, &vrt.transpose(), 1.0);
        },
        None => {
            scratch.mean.gemv(1.0, comp.cov(), &inv_resid, 1.0);
            let v_inv = comp.cov() * &inv;
            scratch.second.copy_from(comp.cov());
            scratch.second.gemm(-1.0, &v_inv, comp.cov(), 1.0);
        }
    }
    scratch.second.ger(1.0, &scratch.mean, &scratch.mean, 1.0);

    Ok(logq)
}

#[test]
fn scoring_matches_the_plain_gaussian_density() {
    let comp = Gaussian::new(
        1.0,
        DVector::from_column_slice(&[0.0, 0.0]),
        DMatrix::identity(2, 2)
    ).unwrap();
    let obs = Observation::new(
        DVector::from_column_slice(&[1.0, 0.0]),
        Noise::Full(DMatrix::identity(2, 2).scale(0.01))
    ).unwrap();
    let mut scratch = Scratch::new(2);
    let logq = score(&obs, &comp, &mut scratch).ok().unwrap();
    // Closed form: N([1, 0]; 0, 1.01 I).
    let var = 1.01f64;
    let expected = -(2.0 * PI).ln() - var.ln() - 0.5 * 1.0 / var;
    assert!((logq - expected).abs() < 1e-12);
}

#[test]
fn zero_combined_covariance_is_singular() {
    let comp = Gaussian::new(1.0, DVector::zeros(2), DMatrix::zeros(2, 2)).unwrap();
    let obs = Observation::new(
        DVector::from_column_slice(&[1.0, 0.0]),
        Noise::Full(DMatrix::zeros(2, 2))
    ).unwrap();
    let mut scratch = Scratch::new(2);
    assert!(score(&obs, &comp, &mut scratch).is_err());
}
