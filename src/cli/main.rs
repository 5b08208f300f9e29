use structopt::*;
use indicatif::{ProgressBar, ProgressStyle};
use rand::SeedableRng;
use deconv::fit::{run_em_step, EmControl, ExpectMax};
use deconv::prob::Mixture;
use deconv::sample::{self, Observation};

/// Fit latent Gaussian mixtures to noisy, possibly incomplete observation
/// tables from the command line.
#[derive(StructOpt, Debug)]
pub enum Deconv {

    /// Fits a mixture model to an observation table, writing the updated
    /// model back as JSON.
    Fit {
        /// JSON file with the starting mixture
        model : String,

        /// CSV table of observations (values, uncertainties, optional weight)
        #[structopt(short)]
        data : String,

        #[structopt(short)]
        output : Option<String>,

        /// Absolute tolerance on the average log-likelihood improvement
        #[structopt(short, default_value = "1e-6")]
        tol : f64,

        #[structopt(short, long, default_value = "1000")]
        max_iter : usize,

        /// Wishart-style prior weight added to the covariance updates
        #[structopt(short, long, default_value = "0")]
        regularization : f64,

        /// Ignore the weight column even when present
        #[structopt(long)]
        unweighted : bool,

        #[structopt(long)]
        threads : Option<usize>
    },

    /// Evaluates the average log-likelihood of a model over an observation
    /// table, without updating any parameter.
    Likelihood {
        model : String,

        #[structopt(short)]
        data : String,

        #[structopt(long)]
        threads : Option<usize>
    },

    /// Draws latent-space realizations from a mixture model.
    Sample {
        model : String,

        #[structopt(short)]
        n : usize,

        #[structopt(short)]
        seed : Option<u64>
    }

}

fn load_inputs(model_path : &str, data_path : &str) -> Result<(Mixture, Vec<Observation>, EmControl), String> {
    let mixture = Mixture::load(model_path).map_err(|e| format!("Error opening model: {}", e) )?;
    let data = sample::read_observations(data_path, mixture.dim())
        .map_err(|e| format!("Error opening data: {}", e) )?;
    let projected = data.iter().any(|obs| obs.projection().is_some() );
    let control = EmControl {
        no_projection : !projected,
        diagonal_noise : true,
        ..Default::default()
    };
    Ok((mixture, data, control))
}

fn print_or_save(mixture : &Mixture, opt_path : &Option<String>) -> Result<(), String> {
    match opt_path {
        Some(path) => mixture.save(path).map_err(|e| format!("{}", e) ),
        None => {
            let content = serde_json::to_string_pretty(mixture).map_err(|e| format!("{}", e) )?;
            println!("{}", content);
            Ok(())
        }
    }
}

fn main() -> Result<(), String> {
    let cli = Deconv::from_args();
    match &cli {
        Deconv::Fit { model, data, output, tol, max_iter, regularization, unweighted, threads } => {
            let (mut mixture, obs, mut control) = load_inputs(model, data)?;
            control.regularization = *regularization;
            control.no_weighting = *unweighted;
            control.threads = *threads;
            let em = ExpectMax { control, tol : *tol, max_iter : *max_iter };
            let progress = ProgressBar::new(*max_iter as u64);
            progress.set_style(ProgressStyle::default_bar()
                .template("{bar:30} iteration {pos} avg loglike {msg}"));
            let fit = em.fit_with(&obs, &mut mixture, |_, avg_loglike| {
                progress.set_message(format!("{:.6}", avg_loglike));
                progress.inc(1);
            }).map_err(|e| format!("Fit error: {}", e) )?;
            if fit.converged {
                progress.finish_with_message(format!("converged at {:.6}", fit.avg_loglike));
            } else {
                progress.finish_with_message(format!("iteration budget exhausted at {:.6}", fit.avg_loglike));
            }
            print_or_save(&mixture, output)
        },
        Deconv::Likelihood { model, data, threads } => {
            let (mut mixture, obs, mut control) = load_inputs(model, data)?;
            control.likelihood_only = true;
            control.threads = *threads;
            let step = run_em_step(&obs, &mut mixture, &control)
                .map_err(|e| format!("Likelihood error: {}", e) )?;
            println!("{}", step.avg_loglike);
            Ok(())
        },
        Deconv::Sample { model, n, seed } => {
            let mixture = Mixture::load(model).map_err(|e| format!("Error opening model: {}", e) )?;
            let mut rng = match seed {
                Some(seed) => rand::rngs::StdRng::seed_from_u64(*seed),
                None => rand::rngs::StdRng::from_entropy()
            };
            let draws = mixture.sample(*n, &mut rng).map_err(|e| format!("Sampling error: {}", e) )?;
            let mut out = csv::Writer::from_writer(std::io::stdout());
            out.write_record((0..mixture.dim()).map(|j| format!("x{}", j) ))
                .map_err(|e| format!("{}", e) )?;
            for row in draws.row_iter() {
                out.write_record(row.iter().map(|v| v.to_string() ))
                    .map_err(|e| format!("{}", e) )?;
            }
            out.flush().map_err(|e| format!("{}", e) )?;
            Ok(())
        }
    }
}
