use crate::moments::{digamma, dirichlet_vlb_term};
use crate::traits::{OneStatParam, PosteriorInference};

use anyhow::ensure;
use ndarray::prelude::*;
use rand::Rng;
use rand_distr::{Distribution, Gamma as GammaDistr};

/// A cube of Dirichlet parameters: one simplex of size `b` along the
/// last axis for every (row, column) pair.
///
/// x[i,j,:] ~ Dirichlet(gamma0, ..., gamma0)
///
/// `stat[i,j,:]` holds the posterior concentrations.
pub struct DirichletCube {
    num_rows: usize,
    num_columns: usize,
    simplex_dim: usize,
    // hyper parameter (symmetric concentration)
    gamma0: f64,
    // sufficient statistics
    stat: Array3<f64>,
    // estimated parameters
    estimated_mean: Array3<f64>,
    estimated_log_mean: Array3<f64>,
}

impl DirichletCube {
    pub fn new(dims: (usize, usize, usize), gamma0: f64) -> Self {
        let mut ret = Self {
            num_rows: dims.0,
            num_columns: dims.1,
            simplex_dim: dims.2,
            gamma0,
            stat: Array3::zeros(dims),
            estimated_mean: Array3::zeros(dims),
            estimated_log_mean: Array3::zeros(dims),
        };
        ret.reset_stat();
        ret.calibrate();
        ret
    }

    pub fn concentration_stat(&self) -> &Array3<f64> {
        &self.stat
    }

    pub fn hyper(&self) -> f64 {
        self.gamma0
    }
}

impl OneStatParam for DirichletCube {
    type Stat = Array3<f64>;

    fn reset_stat(&mut self) {
        self.stat.fill(self.gamma0);
    }

    fn add_stat(&mut self, add: &Self::Stat) {
        self.stat += add;
    }

    fn update_stat(&mut self, update: &Self::Stat) {
        self.reset_stat();
        self.add_stat(update);
    }

    fn stochastic_update(&mut self, add: &Self::Stat, minibatchfrac: f64, stepsize: f64) {
        let gamma0 = self.gamma0;
        self.stat.zip_mut_with(add, |cur, &a| {
            *cur = (1.0 - stepsize) * *cur + stepsize * (gamma0 + a / minibatchfrac);
        });
    }
}

impl PosteriorInference for DirichletCube {
    type Mat = Array3<f64>;

    fn calibrate(&mut self) {
        for i in 0..self.num_rows {
            for j in 0..self.num_columns {
                let total: f64 = self.stat.slice(s![i, j, ..]).sum();
                let dg_total = digamma(total);
                for b in 0..self.simplex_dim {
                    let a = self.stat[[i, j, b]];
                    self.estimated_mean[[i, j, b]] = a / total;
                    self.estimated_log_mean[[i, j, b]] = digamma(a) - dg_total;
                }
            }
        }
    }

    fn posterior_mean(&self) -> &Self::Mat {
        &self.estimated_mean
    }

    fn posterior_log_mean(&self) -> &Self::Mat {
        &self.estimated_log_mean
    }

    /// Sample each simplex as normalized gamma draws.
    fn posterior_sample<R: Rng>(&self, rng: &mut R) -> anyhow::Result<Self::Mat> {
        let mut out = Array3::zeros((self.num_rows, self.num_columns, self.simplex_dim));
        for i in 0..self.num_rows {
            for j in 0..self.num_columns {
                let mut total = 0.0;
                for b in 0..self.simplex_dim {
                    let a = self.stat[[i, j, b]];
                    ensure!(a > 0.0, "invalid concentration at ({},{},{})", i, j, b);
                    let x: f64 = GammaDistr::new(a, 1.0)?.sample(rng);
                    out[[i, j, b]] = x;
                    total += x;
                }
                // a zero total is possible only for degenerate concentrations
                ensure!(total > 0.0, "degenerate dirichlet sample at ({},{})", i, j);
                for b in 0..self.simplex_dim {
                    out[[i, j, b]] /= total;
                }
            }
        }
        Ok(out)
    }

    fn vlb(&self) -> f64 {
        let mut total = 0.0;
        for i in 0..self.num_rows {
            for j in 0..self.num_columns {
                let row = self.stat.slice(s![i, j, ..]);
                let row: Vec<f64> = row.iter().copied().collect();
                total += dirichlet_vlb_term(self.gamma0, &row);
            }
        }
        total
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::SmallRng;
    use rand::SeedableRng;

    #[test]
    fn prior_mean_is_uniform() {
        let cube = DirichletCube::new((2, 2, 4), 1.0);
        for &m in cube.posterior_mean() {
            assert!((m - 0.25).abs() < 1e-12);
        }
    }

    #[test]
    fn samples_live_on_the_simplex() {
        let cube = DirichletCube::new((3, 3, 5), 0.7);
        let mut rng = SmallRng::seed_from_u64(3);
        let s = cube.posterior_sample(&mut rng).unwrap();
        for i in 0..3 {
            for j in 0..3 {
                let total: f64 = s.slice(s![i, j, ..]).sum();
                assert!((total - 1.0).abs() < 1e-12);
                assert!(s.slice(s![i, j, ..]).iter().all(|&x| x >= 0.0));
            }
        }
    }

    #[test]
    fn update_concentrates_mass() {
        let mut cube = DirichletCube::new((1, 1, 2), 1.0);
        let mut counts = Array3::zeros((1, 1, 2));
        counts[[0, 0, 0]] = 98.0;
        counts[[0, 0, 1]] = 0.0;
        cube.update_stat(&counts);
        cube.calibrate();
        assert!(cube.posterior_mean()[[0, 0, 0]] > 0.97);
    }
}
