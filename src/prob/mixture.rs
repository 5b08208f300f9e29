use nalgebra::*;
use super::*;
use serde::{Serialize, Deserialize};
use std::fmt::{self, Display};
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;
use rand::Rng;
use anyhow;

/// Which parameters of a component are held fixed during re-estimation.
/// Flags are independent: a component may have its amplitude re-estimated
/// while mean and covariance stay pinned, or any other combination.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Fixed {

    pub amplitude : bool,

    pub mean : bool,

    pub cov : bool

}

impl Fixed {

    /// Pins amplitude, mean and covariance at once.
    pub fn all() -> Self {
        Self { amplitude : true, mean : true, cov : true }
    }

    /// True when no parameter of the component can be re-estimated.
    pub fn is_all_fixed(&self) -> bool {
        self.amplitude && self.mean && self.cov
    }

}

/// A finite mixture of latent-space Gaussian components sharing a common
/// dimension, together with the per-component re-estimation constraints.
/// Amplitudes are the mixture weights; after an unconstrained re-estimation
/// they sum to one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mixture {

    components : Vec<Gaussian>,

    fixed : Vec<Fixed>

}

impl Mixture {

    /// Builds a mixture from a non-empty set of components of uniform
    /// dimension. No constraint is placed on the amplitudes summing to one
    /// here: un-normalized weights are legal inputs to the estimation step,
    /// which renormalizes on update.
    pub fn new(components : Vec<Gaussian>) -> Result<Self, anyhow::Error> {
        let dim = components.first()
            .map(|c| c.dim() )
            .ok_or(anyhow::Error::msg("Mixture requires at least one component"))?;
        if components.iter().any(|c| c.dim() != dim ) {
            return Err(anyhow::Error::msg("Components of a mixture must share a common dimension"));
        }
        let fixed = vec![Fixed::default(); components.len()];
        Ok(Self { components, fixed })
    }

    /// Builds a mixture of k standard components with uniform amplitudes,
    /// useful as a bland starting point for the estimation driver.
    pub fn standard(dim : usize, k : usize) -> Result<Self, anyhow::Error> {
        if k == 0 {
            return Err(anyhow::Error::msg("Mixture requires at least one component"));
        }
        let components = (0..k).map(|_| Gaussian::standard(dim, 1.0 / k as f64) ).collect();
        Self::new(components)
    }

    /// Dimension of the shared latent space.
    pub fn dim(&self) -> usize {
        self.components[0].dim()
    }

    /// Number of components.
    pub fn len(&self) -> usize {
        self.components.len()
    }

    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }

    pub fn components(&self) -> &[Gaussian] {
        &self.components
    }

    pub fn component(&self, j : usize) -> &Gaussian {
        &self.components[j]
    }

    pub(crate) fn component_mut(&mut self, j : usize) -> &mut Gaussian {
        &mut self.components[j]
    }

    pub fn fixed(&self) -> &[Fixed] {
        &self.fixed
    }

    /// Replaces the re-estimation constraints of component j.
    pub fn fix(&mut self, j : usize, fixed : Fixed) {
        self.fixed[j] = fixed;
    }

    /// Sum of the component amplitudes (1 for a normalized mixture).
    pub fn amplitude_sum(&self) -> f64 {
        self.components.iter().map(|c| c.amplitude() ).sum()
    }

    /// Draws n latent-space realizations from the mixture, one per row:
    /// a component is chosen with probability proportional to its amplitude,
    /// then the draw is sampled from it.
    pub fn sample<R>(&self, n : usize, rng : &mut R) -> Result<DMatrix<f64>, anyhow::Error>
        where R : Rng + ?Sized
    {
        let total = self.amplitude_sum();
        if total <= 0.0 {
            return Err(anyhow::Error::msg("Mixture amplitudes carry no mass to sample from"));
        }
        let mut dst = DMatrix::zeros(n, self.dim());
        for i in 0..n {
            let mut u = rng.gen::<f64>() * total;
            let mut chosen = self.components.len() - 1;
            for (j, comp) in self.components.iter().enumerate() {
                u -= comp.amplitude();
                if u <= 0.0 {
                    chosen = j;
                    break;
                }
            }
            self.components[chosen].sample_into(rng, dst.slice_mut((i, 0), (1, self.dim())))?;
        }
        Ok(dst)
    }

    /// Reads a mixture from a JSON file previously written by save.
    pub fn load(path : impl AsRef<Path>) -> Result<Self, anyhow::Error> {
        let mut content = String::new();
        File::open(path)?.read_to_string(&mut content)?;
        let mix : Mixture = serde_json::from_str(&content)?;
        if mix.is_empty() {
            return Err(anyhow::Error::msg("Informed model carries no components"));
        }
        let dim = mix.dim();
        if mix.components.iter().any(|c| c.dim() != dim ) {
            return Err(anyhow::Error::msg("Components of a mixture must share a common dimension"));
        }
        if mix.fixed.len() != mix.components.len() {
            return Err(anyhow::Error::msg("Constraint flags do not match the number of components"));
        }
        Ok(mix)
    }

    /// Writes the mixture (components and constraints) to a JSON file.
    pub fn save(&self, path : impl AsRef<Path>) -> Result<(), anyhow::Error> {
        let content = serde_json::to_string_pretty(&self)?;
        File::create(path)?.write_all(content.as_bytes())?;
        Ok(())
    }

}

impl Display for Mixture {

    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Mixture({} x {})", self.len(), self.dim())
    }

}

#[test]
fn mixture_requires_uniform_dimension() {
    let c1 = Gaussian::standard(2, 0.5);
    let c2 = Gaussian::standard(3, 0.5);
    assert!(Mixture::new(vec![c1, c2]).is_err());
}

#[test]
fn mixture_roundtrips_through_json() {
    let mut mix = Mixture::standard(2, 3).unwrap();
    mix.fix(1, Fixed { amplitude : true, mean : false, cov : false });
    let path = std::env::temp_dir().join("deconv_mixture_roundtrip.json");
    mix.save(&path).unwrap();
    let back = Mixture::load(&path).unwrap();
    assert_eq!(mix, back);
    std::fs::remove_file(&path).ok();
}
