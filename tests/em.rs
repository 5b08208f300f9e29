use nalgebra::*;
use std::f64::consts::PI;
use deconv::fit::{run_em_step, EmControl, EmError, ExpectMax};
use deconv::prob::{Fixed, Gaussian, Mixture};
use deconv::sample::{Noise, Observation};

const EPS : f64 = 1E-9;

/// Closed-form multivariate normal log-density, written independently of the
/// estimation code so the likelihood tests have an external reference.
fn gaussian_log_density(x : &DVector<f64>, mean : &DVector<f64>, cov : &DMatrix<f64>) -> f64 {
    let chol = Cholesky::new(cov.clone()).unwrap();
    let diff = x - mean;
    let maha = diff.dot(&chol.solve(&diff));
    let ln_det = 2.0 * chol.l().diagonal().iter().map(|l| l.ln() ).sum::<f64>();
    -0.5 * x.nrows() as f64 * (2.0 * PI).ln() - 0.5 * ln_det - 0.5 * maha
}

fn full_noise(variance : f64, dim : usize) -> Noise {
    Noise::Full(DMatrix::identity(dim, dim).scale(variance))
}

/// A deterministic cloud of 2-dimensional observations with homogeneous
/// full noise, spread over two lobes so multi-component fits have something
/// to separate.
fn two_lobe_data(n : usize, noise_var : f64) -> Vec<Observation> {
    (0..n).map(|i| {
        let t = i as f64 / n as f64;
        let (cx, cy) = if i % 2 == 0 { (-2.0, 0.0) } else { (2.0, 1.0) };
        let values = DVector::from_column_slice(&[
            cx + (7.0 * t).sin(),
            cy + (11.0 * t).cos() * 0.8
        ]);
        Observation::new(values, full_noise(noise_var, 2)).unwrap()
    }).collect()
}

fn latent_control() -> EmControl {
    EmControl { no_projection : true, no_weighting : true, ..Default::default() }
}

#[test]
fn single_component_likelihood_matches_closed_form() {
    let mean = DVector::from_column_slice(&[0.5, -1.0]);
    let cov = DMatrix::from_row_slice(2, 2, &[1.2, 0.3, 0.3, 0.8]);
    let mut mixture = Mixture::new(vec![
        Gaussian::new(1.0, mean.clone(), cov.clone()).unwrap()
    ]).unwrap();
    mixture.fix(0, Fixed::all());
    let data = two_lobe_data(9, 0.04);
    let step = run_em_step(&data, &mut mixture, &latent_control()).unwrap();
    let expected = data.iter().map(|obs| {
        let combined = match obs.noise() {
            Noise::Full(s) => s + &cov,
            Noise::Diagonal(_) => unreachable!()
        };
        gaussian_log_density(obs.values(), &mean, &combined)
    }).sum::<f64>() / data.len() as f64;
    assert!((step.avg_loglike - expected).abs() < EPS);
}

#[test]
fn responsibility_rows_sum_to_one() {
    let mut mixture = Mixture::new(vec![
        Gaussian::new(0.5, DVector::from_column_slice(&[-2.0, 0.0]), DMatrix::identity(2, 2)).unwrap(),
        Gaussian::new(0.3, DVector::from_column_slice(&[2.0, 1.0]), DMatrix::identity(2, 2)).unwrap(),
        Gaussian::new(0.2, DVector::from_column_slice(&[0.0, 0.0]), DMatrix::identity(2, 2).scale(4.0)).unwrap()
    ]).unwrap();
    let data = two_lobe_data(24, 0.09);
    let step = run_em_step(&data, &mut mixture, &latent_control()).unwrap();
    for i in 0..data.len() {
        let total : f64 = step.responsibilities.row(i).iter().map(|lq| lq.exp() ).sum();
        assert!((total - 1.0).abs() < EPS);
    }
}

#[test]
fn likelihood_only_leaves_parameters_untouched() {
    let mut mixture = Mixture::new(vec![
        Gaussian::new(0.6, DVector::from_column_slice(&[-1.0, 0.5]), DMatrix::from_row_slice(2, 2, &[1.0, 0.2, 0.2, 0.7])).unwrap(),
        Gaussian::new(0.4, DVector::from_column_slice(&[1.5, -0.5]), DMatrix::identity(2, 2)).unwrap()
    ]).unwrap();
    let before = mixture.clone();
    let control = EmControl { likelihood_only : true, ..latent_control() };
    let step = run_em_step(&two_lobe_data(17, 0.04), &mut mixture, &control).unwrap();
    assert!(step.avg_loglike.is_finite());
    assert_eq!(mixture, before);
}

#[test]
fn fully_fixed_components_survive_a_full_update() {
    let mut mixture = Mixture::new(vec![
        Gaussian::new(0.6, DVector::from_column_slice(&[-2.0, 0.0]), DMatrix::identity(2, 2)).unwrap(),
        Gaussian::new(0.4, DVector::from_column_slice(&[2.0, 1.0]), DMatrix::identity(2, 2)).unwrap()
    ]).unwrap();
    mixture.fix(0, Fixed::all());
    mixture.fix(1, Fixed::all());
    let before = mixture.clone();
    let step = run_em_step(&two_lobe_data(17, 0.04), &mut mixture, &latent_control()).unwrap();
    assert!(step.avg_loglike.is_finite());
    assert_eq!(mixture, before);
}

#[test]
fn noise_free_update_lands_on_the_sample_moments() {
    use rand::SeedableRng;
    let mut rng = rand::rngs::StdRng::seed_from_u64(7);
    let truth = Gaussian::new(
        1.0,
        DVector::from_column_slice(&[1.0, -0.5]),
        DMatrix::from_row_slice(2, 2, &[0.9, 0.2, 0.2, 0.5])
    ).unwrap();
    let n = 4000;
    let mut draws = DMatrix::zeros(n, 2);
    truth.sample_into(&mut rng, draws.slice_mut((0, 0), (n, 2))).unwrap();
    let data : Vec<Observation> = draws.row_iter().map(|row| {
        Observation::new(row.transpose(), full_noise(0.0, 2)).unwrap()
    }).collect();

    let mut mixture = Mixture::new(vec![truth.clone()]).unwrap();
    run_em_step(&data, &mut mixture, &latent_control()).unwrap();

    // With zero noise the posterior of each observation is the observation
    // itself, so the single-component update is exactly the sample mean and
    // covariance.
    let sample_mean = draws.row_mean().transpose();
    let mut sample_cov = DMatrix::zeros(2, 2);
    for row in draws.row_iter() {
        let diff = row.transpose() - &sample_mean;
        sample_cov.ger(1.0 / n as f64, &diff, &diff, 1.0);
    }
    assert!((mixture.component(0).mean() - &sample_mean).norm() < 1e-9);
    assert!((mixture.component(0).cov() - &sample_cov).norm() < 1e-9);

    // Those moments sit close to the generating parameters, so a second
    // update stays put: the generator is (nearly) a fixed point.
    let after_first = mixture.clone();
    run_em_step(&data, &mut mixture, &latent_control()).unwrap();
    assert!((mixture.component(0).mean() - after_first.component(0).mean()).norm() < 1e-9);
    assert!((mixture.component(0).cov() - after_first.component(0).cov()).norm() < 1e-9);
    assert!((mixture.component(0).mean() - truth.mean()).norm() < 0.1);
    assert!((mixture.component(0).cov() - truth.cov()).norm() < 0.1);
}

#[test]
fn amplitudes_renormalize_to_unit_mass() {
    let data = two_lobe_data(30, 0.04);
    let components = vec![
        Gaussian::new(0.5, DVector::from_column_slice(&[-2.0, 0.0]), DMatrix::identity(2, 2)).unwrap(),
        Gaussian::new(0.3, DVector::from_column_slice(&[2.0, 1.0]), DMatrix::identity(2, 2)).unwrap(),
        Gaussian::new(0.2, DVector::from_column_slice(&[0.0, 0.5]), DMatrix::identity(2, 2).scale(2.0)).unwrap()
    ];

    let mut free = Mixture::new(components.clone()).unwrap();
    run_em_step(&data, &mut free, &latent_control()).unwrap();
    assert!((free.amplitude_sum() - 1.0).abs() < EPS);

    let mut constrained = Mixture::new(components).unwrap();
    constrained.fix(0, Fixed { amplitude : true, mean : false, cov : false });
    run_em_step(&data, &mut constrained, &latent_control()).unwrap();
    assert!((constrained.component(0).amplitude() - 0.5).abs() < EPS);
    let free_mass : f64 = constrained.component(1).amplitude() + constrained.component(2).amplitude();
    assert!((free_mass - 0.5).abs() < EPS);
}

#[test]
fn single_observation_update_follows_the_posterior() {
    let mut mixture = Mixture::new(vec![
        Gaussian::new(1.0, DVector::zeros(2), DMatrix::identity(2, 2)).unwrap()
    ]).unwrap();
    let data = vec![
        Observation::new(DVector::from_column_slice(&[1.0, 0.0]), full_noise(0.01, 2)).unwrap()
    ];
    let step = run_em_step(&data, &mut mixture, &latent_control()).unwrap();

    let expected_loglike = gaussian_log_density(
        data[0].values(),
        &DVector::zeros(2),
        &DMatrix::identity(2, 2).scale(1.01)
    );
    assert!((step.avg_loglike - expected_loglike).abs() < EPS);

    // Posterior for the single observation: b = T^-1 w with T = 1.01 I, and
    // B = (0.01 / 1.01) I; with unit responsibility the update adopts them.
    let shrink = 1.0 / 1.01;
    assert!((mixture.component(0).amplitude() - 1.0).abs() < EPS);
    assert!((mixture.component(0).mean()[0] - shrink).abs() < EPS);
    assert!(mixture.component(0).mean()[1].abs() < EPS);
    let post_var = 0.01 / 1.01;
    assert!((mixture.component(0).cov()[(0, 0)] - post_var).abs() < EPS);
    assert!((mixture.component(0).cov()[(1, 1)] - post_var).abs() < EPS);
    assert!(mixture.component(0).cov()[(0, 1)].abs() < EPS);
}

#[test]
fn observations_of_mixed_dimension_share_one_latent_model() {
    let mut mixture = Mixture::new(vec![
        Gaussian::new(0.5, DVector::from_column_slice(&[0.0, 0.0, 0.0]), DMatrix::identity(3, 3)).unwrap(),
        Gaussian::new(0.5, DVector::from_column_slice(&[2.0, -1.0, 1.0]), DMatrix::identity(3, 3)).unwrap()
    ]).unwrap();
    let complete = Observation::new(
        DVector::from_column_slice(&[0.4, -0.2, 0.1]),
        Noise::Diagonal(DVector::from_element(3, 0.01))
    ).unwrap().with_projection(DMatrix::identity(3, 3)).unwrap();
    // Second observation only sees latent coordinates 0 and 2.
    let mut selection = DMatrix::zeros(2, 3);
    selection[(0, 0)] = 1.0;
    selection[(1, 2)] = 1.0;
    let partial = Observation::new(
        DVector::from_column_slice(&[1.8, 0.9]),
        Noise::Diagonal(DVector::from_element(2, 0.04))
    ).unwrap().with_projection(selection).unwrap();

    let control = EmControl { diagonal_noise : true, no_weighting : true, ..Default::default() };
    let step = run_em_step(&vec![complete, partial], &mut mixture, &control).unwrap();
    assert!(step.avg_loglike.is_finite());
    for i in 0..2 {
        let total : f64 = step.responsibilities.row(i).iter().map(|lq| lq.exp() ).sum();
        assert!((total - 1.0).abs() < EPS);
    }
    assert!((mixture.amplitude_sum() - 1.0).abs() < EPS);
}

#[test]
fn singular_combined_covariance_aborts_the_update() {
    let mut mixture = Mixture::new(vec![
        Gaussian::new(1.0, DVector::zeros(2), DMatrix::zeros(2, 2)).unwrap()
    ]).unwrap();
    let before = mixture.clone();
    let data = vec![
        Observation::new(DVector::from_column_slice(&[1.0, 0.0]), full_noise(0.0, 2)).unwrap()
    ];
    let err = run_em_step(&data, &mut mixture, &latent_control()).unwrap_err();
    match err {
        EmError::SingularCovariance { observation, component } => {
            assert_eq!((observation, component), (0, 0));
        },
        other => panic!("Unexpected error: {}", other)
    }
    assert_eq!(mixture, before);
}

#[test]
fn invalid_configurations_are_rejected_before_any_work() {
    let mut mixture = Mixture::new(vec![Gaussian::standard(2, 1.0)]).unwrap();
    let data = vec![
        Observation::new(DVector::from_column_slice(&[0.0, 0.0]), full_noise(0.1, 2)).unwrap()
    ];

    let negative = EmControl { regularization : -1.0, ..latent_control() };
    assert!(matches!(
        run_em_step(&data, &mut mixture, &negative),
        Err(EmError::NegativeRegularization(_))
    ));

    assert!(matches!(
        run_em_step(&[], &mut mixture, &latent_control()),
        Err(EmError::NoObservations)
    ));

    let mut massless = Mixture::new(vec![Gaussian::new(0.0, DVector::zeros(2), DMatrix::identity(2, 2)).unwrap()]).unwrap();
    assert!(matches!(
        run_em_step(&data, &mut massless, &latent_control()),
        Err(EmError::ZeroAmplitudeMass)
    ));

    let short = vec![
        Observation::new(DVector::from_column_slice(&[0.0]), full_noise(0.1, 1)).unwrap()
    ];
    assert!(matches!(
        run_em_step(&short, &mut mixture, &latent_control()),
        Err(EmError::BadObservation { index : 0, .. })
    ));

    // Projection mode demands an operator on every observation.
    let unprojected_control = EmControl { no_weighting : true, ..Default::default() };
    assert!(matches!(
        run_em_step(&data, &mut mixture, &unprojected_control),
        Err(EmError::BadObservation { index : 0, .. })
    ));

    // Noise representation must match the control switch.
    let diag_control = EmControl { diagonal_noise : true, ..latent_control() };
    assert!(matches!(
        run_em_step(&data, &mut mixture, &diag_control),
        Err(EmError::BadObservation { index : 0, .. })
    ));
}

#[test]
fn diagonal_and_full_noise_representations_agree() {
    let variances = [0.04, 0.09];
    let values = [
        [-1.0, 0.3], [0.5, -0.2], [2.0, 1.0], [0.0, 0.0], [-2.0, 0.8]
    ];
    let full : Vec<Observation> = values.iter().map(|v| {
        let noise = DMatrix::from_diagonal(&DVector::from_column_slice(&variances));
        Observation::new(DVector::from_column_slice(v), Noise::Full(noise)).unwrap()
    }).collect();
    let diag : Vec<Observation> = values.iter().map(|v| {
        Observation::new(
            DVector::from_column_slice(v),
            Noise::Diagonal(DVector::from_column_slice(&variances))
        ).unwrap()
    }).collect();

    let components = vec![
        Gaussian::new(0.5, DVector::from_column_slice(&[-1.0, 0.0]), DMatrix::identity(2, 2)).unwrap(),
        Gaussian::new(0.5, DVector::from_column_slice(&[1.0, 0.5]), DMatrix::identity(2, 2)).unwrap()
    ];
    let mut from_full = Mixture::new(components.clone()).unwrap();
    let mut from_diag = Mixture::new(components).unwrap();
    let step_full = run_em_step(&full, &mut from_full, &latent_control()).unwrap();
    let diag_control = EmControl { diagonal_noise : true, ..latent_control() };
    let step_diag = run_em_step(&diag, &mut from_diag, &diag_control).unwrap();

    assert!((step_full.avg_loglike - step_diag.avg_loglike).abs() < 1e-12);
    for j in 0..2 {
        assert!((from_full.component(j).amplitude() - from_diag.component(j).amplitude()).abs() < 1e-12);
        assert!((from_full.component(j).mean() - from_diag.component(j).mean()).norm() < 1e-12);
        assert!((from_full.component(j).cov() - from_diag.component(j).cov()).norm() < 1e-12);
    }
}

#[test]
fn identity_projection_matches_the_latent_space_path() {
    let data = two_lobe_data(15, 0.04);
    let projected : Vec<Observation> = data.iter().map(|obs| {
        obs.clone().with_projection(DMatrix::identity(2, 2)).unwrap()
    }).collect();
    let components = vec![
        Gaussian::new(0.5, DVector::from_column_slice(&[-2.0, 0.0]), DMatrix::identity(2, 2)).unwrap(),
        Gaussian::new(0.5, DVector::from_column_slice(&[2.0, 1.0]), DMatrix::identity(2, 2)).unwrap()
    ];
    let mut latent = Mixture::new(components.clone()).unwrap();
    let mut through_projection = Mixture::new(components).unwrap();
    let step_latent = run_em_step(&data, &mut latent, &latent_control()).unwrap();
    let projected_control = EmControl { no_weighting : true, ..Default::default() };
    let step_projected = run_em_step(&projected, &mut through_projection, &projected_control).unwrap();

    assert!((step_latent.avg_loglike - step_projected.avg_loglike).abs() < 1e-10);
    for j in 0..2 {
        assert!((latent.component(j).mean() - through_projection.component(j).mean()).norm() < 1e-10);
        assert!((latent.component(j).cov() - through_projection.component(j).cov()).norm() < 1e-10);
    }
}

#[test]
fn results_do_not_depend_on_the_worker_count() {
    let data = two_lobe_data(250, 0.04);
    let components = vec![
        Gaussian::new(0.5, DVector::from_column_slice(&[-2.0, 0.0]), DMatrix::identity(2, 2)).unwrap(),
        Gaussian::new(0.5, DVector::from_column_slice(&[2.0, 1.0]), DMatrix::identity(2, 2)).unwrap()
    ];
    let mut serial = Mixture::new(components.clone()).unwrap();
    let mut parallel = Mixture::new(components).unwrap();
    let serial_control = EmControl { threads : Some(1), ..latent_control() };
    let parallel_control = EmControl { threads : Some(4), ..latent_control() };
    let step_serial = run_em_step(&data, &mut serial, &serial_control).unwrap();
    let step_parallel = run_em_step(&data, &mut parallel, &parallel_control).unwrap();

    // The ordered fold makes the reduction order independent of the pool
    // size, so the agreement is exact, not approximate.
    assert_eq!(step_serial.avg_loglike, step_parallel.avg_loglike);
    assert_eq!(serial, parallel);
    assert_eq!(step_serial.responsibilities, step_parallel.responsibilities);
}

#[test]
fn log_weights_match_observation_duplication() {
    let first = DVector::from_column_slice(&[-1.0, 0.2]);
    let second = DVector::from_column_slice(&[1.4, -0.3]);
    let weighted = vec![
        Observation::new(first.clone(), full_noise(0.04, 2)).unwrap()
            .with_log_weight(2.0f64.ln()),
        Observation::new(second.clone(), full_noise(0.04, 2)).unwrap()
    ];
    let duplicated = vec![
        Observation::new(first.clone(), full_noise(0.04, 2)).unwrap(),
        Observation::new(first, full_noise(0.04, 2)).unwrap(),
        Observation::new(second, full_noise(0.04, 2)).unwrap()
    ];
    let components = vec![
        Gaussian::new(0.5, DVector::from_column_slice(&[-1.0, 0.0]), DMatrix::identity(2, 2)).unwrap(),
        Gaussian::new(0.5, DVector::from_column_slice(&[1.0, 0.0]), DMatrix::identity(2, 2)).unwrap()
    ];
    let control = EmControl { no_projection : true, ..Default::default() };
    let mut from_weights = Mixture::new(components.clone()).unwrap();
    let mut from_duplicates = Mixture::new(components).unwrap();
    run_em_step(&weighted, &mut from_weights, &control).unwrap();
    run_em_step(&duplicated, &mut from_duplicates, &control).unwrap();
    for j in 0..2 {
        assert!((from_weights.component(j).amplitude() - from_duplicates.component(j).amplitude()).abs() < 1e-12);
        assert!((from_weights.component(j).mean() - from_duplicates.component(j).mean()).norm() < 1e-12);
        assert!((from_weights.component(j).cov() - from_duplicates.component(j).cov()).norm() < 1e-12);
    }
}

#[test]
fn driver_improves_the_likelihood_until_convergence() {
    let data = two_lobe_data(60, 0.04);
    let mut mixture = Mixture::new(vec![
        Gaussian::new(0.5, DVector::from_column_slice(&[-1.0, 0.0]), DMatrix::identity(2, 2)).unwrap(),
        Gaussian::new(0.5, DVector::from_column_slice(&[1.0, 0.0]), DMatrix::identity(2, 2)).unwrap()
    ]).unwrap();
    let em = ExpectMax { control : latent_control(), tol : 1e-8, max_iter : 200 };
    let mut trajectory = Vec::new();
    let fit = em.fit_with(&data, &mut mixture, |_, avg| trajectory.push(avg) ).unwrap();
    assert!(fit.converged);
    assert!(trajectory.windows(2).all(|w| w[1] >= w[0] - 1e-9 ));
    assert!((mixture.amplitude_sum() - 1.0).abs() < EPS);
}
