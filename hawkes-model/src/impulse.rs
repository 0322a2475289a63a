//! Dirichlet-distributed impulse-response coefficients.

use anyhow::{ensure, Context};
use hawkes_param::moments::dirichlet_ln_pdf;
use hawkes_param::{DirichletCube, OneStatParam, PosteriorInference};
use ndarray::prelude::*;
use rand::Rng;
use rand_distr::{Distribution, Gamma as GammaDistr};

/// g[k, k', :] ~ Dirichlet(gamma0) for every directed edge (k, k').
///
/// The simplex coefficients mix the raised-cosine basis columns; since
/// each column integrates to one, so does every impulse response.
pub struct DirichletImpulseResponses {
    k: usize,
    b: usize,
    gamma0: f64,
    /// point state, K x K x B
    pub g: Array3<f64>,
    /// variational factor
    mf: DirichletCube,
}

impl DirichletImpulseResponses {
    pub fn new<R: Rng>(k: usize, b: usize, gamma0: f64, rng: &mut R) -> anyhow::Result<Self> {
        ensure!(gamma0 > 0.0, "dirichlet concentration must be positive");
        let mut ret = Self {
            k,
            b,
            gamma0,
            g: Array3::zeros((k, k, b)),
            mf: DirichletCube::new((k, k, b), gamma0),
        };
        let prior = Array3::from_elem((k, k, b), gamma0);
        ret.sample_simplices(rng, &prior)?;
        Ok(ret)
    }

    /// Gibbs update. `z_sum[k, k', b]` is the count attributed to basis
    /// bump b on edge (k, k') summed over time and datasets.
    pub fn resample<R: Rng>(&mut self, rng: &mut R, z_sum: &Array3<f64>) -> anyhow::Result<()> {
        let conc = z_sum + self.gamma0;
        self.sample_simplices(rng, &conc)
    }

    fn sample_simplices<R: Rng>(&mut self, rng: &mut R, conc: &Array3<f64>) -> anyhow::Result<()> {
        for k1 in 0..self.k {
            for k2 in 0..self.k {
                let mut total = 0.0;
                for b in 0..self.b {
                    let a = conc[[k1, k2, b]];
                    let x: f64 = GammaDistr::new(a, 1.0)
                        .context("invalid impulse posterior concentration")?
                        .sample(rng);
                    self.g[[k1, k2, b]] = x;
                    total += x;
                }
                ensure!(total > 0.0, "degenerate impulse sample at ({},{})", k1, k2);
                for b in 0..self.b {
                    self.g[[k1, k2, b]] /= total;
                }
            }
        }
        Ok(())
    }

    pub fn meanfield_update(&mut self, ez_sum: &Array3<f64>) {
        self.mf.update_stat(ez_sum);
        self.mf.calibrate();
    }

    pub fn meanfield_sgd_step(&mut self, ez_sum: &Array3<f64>, minibatchfrac: f64, stepsize: f64) {
        self.mf.stochastic_update(ez_sum, minibatchfrac, stepsize);
        self.mf.calibrate();
    }

    pub fn expected_g(&self) -> &Array3<f64> {
        self.mf.posterior_mean()
    }

    pub fn expected_log_g(&self) -> &Array3<f64> {
        self.mf.posterior_log_mean()
    }

    /// Prior log density at the current point state.
    pub fn log_probability(&self) -> f64 {
        let mut total = 0.0;
        for k1 in 0..self.k {
            for k2 in 0..self.k {
                let row: Vec<f64> = self.g.slice(s![k1, k2, ..]).iter().copied().collect();
                total += dirichlet_ln_pdf(self.gamma0, &row);
            }
        }
        total
    }

    pub fn vlb(&self) -> f64 {
        self.mf.vlb()
    }

    pub fn resample_from_mf<R: Rng>(&mut self, rng: &mut R) -> anyhow::Result<()> {
        self.g = self.mf.posterior_sample(rng)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::SmallRng;
    use rand::SeedableRng;

    #[test]
    fn point_state_lives_on_the_simplex() {
        let mut rng = SmallRng::seed_from_u64(5);
        let imp = DirichletImpulseResponses::new(3, 4, 1.0, &mut rng).unwrap();
        for k1 in 0..3 {
            for k2 in 0..3 {
                let total: f64 = imp.g.slice(s![k1, k2, ..]).sum();
                assert!((total - 1.0).abs() < 1e-12);
            }
        }
    }

    #[test]
    fn resample_follows_attributed_counts() {
        let mut rng = SmallRng::seed_from_u64(6);
        let mut imp = DirichletImpulseResponses::new(1, 2, 1.0, &mut rng).unwrap();
        let mut z = Array3::zeros((1, 1, 2));
        z[[0, 0, 0]] = 500.0;
        let mut acc = 0.0;
        let n = 100;
        for _ in 0..n {
            imp.resample(&mut rng, &z).unwrap();
            acc += imp.g[[0, 0, 0]];
        }
        assert!(acc / n as f64 > 0.97);
    }

    #[test]
    fn meanfield_expectations_follow_counts() {
        let mut rng = SmallRng::seed_from_u64(7);
        let mut imp = DirichletImpulseResponses::new(1, 2, 1.0, &mut rng).unwrap();
        let mut ez = Array3::zeros((1, 1, 2));
        ez[[0, 0, 1]] = 98.0;
        imp.meanfield_update(&ez);
        assert!(imp.expected_g()[[0, 0, 1]] > 0.97);
        assert!(imp.expected_log_g()[[0, 0, 1]] < 0.0);
    }
}
