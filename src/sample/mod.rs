use nalgebra::*;
use std::path::Path;
use anyhow;

/// Measurement uncertainty attached to one observation, in the observation's
/// own space. Diagonal noise stores the per-coordinate variances only; full
/// noise stores the complete symmetric covariance. Which representation the
/// estimation step expects is selected globally through its control switches,
/// so that a data set mixes the two by mistake rather than by design.
#[derive(Debug, Clone, PartialEq)]
pub enum Noise {

    Full(DMatrix<f64>),

    Diagonal(DVector<f64>)

}

impl Noise {

    pub fn dim(&self) -> usize {
        match self {
            Noise::Full(m) => m.nrows(),
            Noise::Diagonal(v) => v.nrows()
        }
    }

}

/// One noisy data point. The value vector lives in the observation's own
/// space, whose dimension may be smaller than the latent dimension of the
/// model explaining it; in that case a projection operator (rows = observed
/// space, columns = latent space) maps latent positions into the observed
/// space. The optional log-weight scales the observation's contribution to
/// the likelihood and to the accumulated statistics.
///
/// Observations are immutable once built: the estimation step only reads
/// them.
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {

    values : DVector<f64>,

    noise : Noise,

    projection : Option<DMatrix<f64>>,

    log_weight : f64

}

impl Observation {

    /// Builds an observation from its value vector and noise description,
    /// with no projection and unit weight.
    pub fn new(values : DVector<f64>, noise : Noise) -> Result<Self, anyhow::Error> {
        if values.nrows() == 0 {
            return Err(anyhow::Error::msg("Observation requires at least one coordinate"));
        }
        if noise.dim() != values.nrows() {
            return Err(anyhow::Error::msg("Noise dimension does not match the value vector"));
        }
        if let Noise::Full(m) = &noise {
            if !crate::prob::is_symmetric(m) {
                return Err(anyhow::Error::msg("Full noise covariance is not symmetric"));
            }
        }
        Ok(Self { values, noise, projection : None, log_weight : 0.0 })
    }

    /// Attaches the projection operator mapping the latent space into this
    /// observation's space. Its row count must match the observed dimension;
    /// the column count is the latent dimension and is checked against the
    /// model when an estimation step runs.
    pub fn with_projection(mut self, projection : DMatrix<f64>) -> Result<Self, anyhow::Error> {
        if projection.nrows() != self.values.nrows() {
            return Err(anyhow::Error::msg("Projection rows do not match the observed dimension"));
        }
        self.projection = Some(projection);
        Ok(self)
    }

    pub fn with_log_weight(mut self, log_weight : f64) -> Self {
        self.log_weight = log_weight;
        self
    }

    /// Dimension of the observed space.
    pub fn dim(&self) -> usize {
        self.values.nrows()
    }

    pub fn values(&self) -> &DVector<f64> {
        &self.values
    }

    pub fn noise(&self) -> &Noise {
        &self.noise
    }

    pub fn projection(&self) -> Option<&DMatrix<f64>> {
        self.projection.as_ref()
    }

    pub fn log_weight(&self) -> f64 {
        self.log_weight
    }

}

/// Reads observations from a CSV table with a header row. The first dim
/// columns are the observed values, the following dim columns their standard
/// deviations (turned into diagonal noise variances), and an optional extra
/// column holds a positive weight (stored as its logarithm).
///
/// An empty value cell marks that coordinate as unobserved for that row: the
/// observation is built in the reduced space of its present coordinates, with
/// a selection operator recording which latent coordinates were seen. When at
/// least one row is incomplete, complete rows receive the identity operator
/// so the whole data set goes through the projected estimation path.
pub fn read_observations(path : impl AsRef<Path>, dim : usize) -> Result<Vec<Observation>, anyhow::Error> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::All)
        .from_path(path.as_ref())?;
    let weighted = reader.headers()?.len() > 2 * dim;
    let mut rows : Vec<(Vec<Option<f64>>, Vec<f64>, f64)> = Vec::new();
    for (i, record) in reader.records().enumerate() {
        let record = record?;
        if record.len() < 2 * dim {
            return Err(anyhow::Error::msg(format!("Row {}: expected at least {} columns, found {}", i, 2 * dim, record.len())));
        }
        let mut values = Vec::with_capacity(dim);
        let mut sigmas = Vec::with_capacity(dim);
        for l in 0..dim {
            let field = &record[l];
            if field.is_empty() {
                values.push(None);
                sigmas.push(0.0);
            } else {
                let value : f64 = field.parse()
                    .map_err(|_| anyhow::Error::msg(format!("Row {}: unable to parse value column {}", i, l)))?;
                let sigma : f64 = record[dim + l].parse()
                    .map_err(|_| anyhow::Error::msg(format!("Row {}: unable to parse uncertainty column {}", i, dim + l)))?;
                values.push(Some(value));
                sigmas.push(sigma);
            }
        }
        let log_weight = if weighted {
            let weight : f64 = record[2 * dim].parse()
                .map_err(|_| anyhow::Error::msg(format!("Row {}: unable to parse weight column", i)))?;
            if weight <= 0.0 {
                return Err(anyhow::Error::msg(format!("Row {}: weight must be positive", i)));
            }
            weight.ln()
        } else {
            0.0
        };
        if values.iter().all(|v| v.is_none() ) {
            return Err(anyhow::Error::msg(format!("Row {}: no coordinate is observed", i)));
        }
        rows.push((values, sigmas, log_weight));
    }
    let any_incomplete = rows.iter().any(|(values, _, _)| values.iter().any(|v| v.is_none() ) );
    let mut observations = Vec::with_capacity(rows.len());
    for (values, sigmas, log_weight) in rows {
        let present : Vec<usize> = (0..dim).filter(|l| values[*l].is_some() ).collect();
        let observed = DVector::from_iterator(present.len(), present.iter().map(|l| values[*l].unwrap() ));
        let variances = DVector::from_iterator(present.len(), present.iter().map(|l| sigmas[*l].powi(2) ));
        let mut obs = Observation::new(observed, Noise::Diagonal(variances))?
            .with_log_weight(log_weight);
        if any_incomplete {
            let mut selection = DMatrix::zeros(present.len(), dim);
            for (row, l) in present.iter().enumerate() {
                selection[(row, *l)] = 1.0;
            }
            obs = obs.with_projection(selection)?;
        }
        observations.push(obs);
    }
    Ok(observations)
}

#[test]
fn missing_cells_become_selection_operators() {
    use std::io::Write;
    let path = std::env::temp_dir().join("deconv_obs_missing.csv");
    let mut f = std::fs::File::create(&path).unwrap();
    writeln!(f, "x0,x1,s0,s1").unwrap();
    writeln!(f, "1.0,2.0,0.1,0.1").unwrap();
    writeln!(f, ",3.0,,0.2").unwrap();
    drop(f);
    let obs = read_observations(&path, 2).unwrap();
    assert_eq!(obs.len(), 2);
    assert_eq!(obs[0].dim(), 2);
    assert_eq!(obs[1].dim(), 1);
    let sel = obs[1].projection().unwrap();
    assert_eq!((sel.nrows(), sel.ncols()), (1, 2));
    assert_eq!(sel[(0, 1)], 1.0);
    assert_eq!(obs[0].projection().unwrap(), &DMatrix::identity(2, 2));
    std::fs::remove_file(&path).ok();
}

#[test]
fn complete_tables_stay_unprojected() {
    use std::io::Write;
    let path = std::env::temp_dir().join("deconv_obs_complete.csv");
    let mut f = std::fs::File::create(&path).unwrap();
    writeln!(f, "x0,s0,w").unwrap();
    writeln!(f, "0.5,0.1,2.0").unwrap();
    drop(f);
    let obs = read_observations(&path, 1).unwrap();
    assert!(obs[0].projection().is_none());
    assert!((obs[0].log_weight() - 2.0f64.ln()).abs() < 1e-12);
    std::fs::remove_file(&path).ok();
}
