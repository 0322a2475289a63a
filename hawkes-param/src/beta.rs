use crate::moments::{beta_vlb_term, digamma};
use crate::traits::{PosteriorInference, TwoStatParam};

use anyhow::ensure;
use ndarray::prelude::*;
use rand::Rng;
use rand_distr::{Beta as BetaDistr, Distribution};

/// Bernoulli-Beta conjugate parameter matrix.
///
/// a[i,j] ~ Bernoulli(p[i,j])
/// p[i,j] ~ Beta(a0, b0)
///
/// `a_stat` accumulates successes, `b_stat` failures.
pub struct BetaMatrix {
    num_rows: usize,
    num_columns: usize,
    // hyper parameters
    a0: f64,
    b0: f64,
    // sufficient statistics
    a_stat: Array2<f64>,
    b_stat: Array2<f64>,
    // estimated parameters
    estimated_mean: Array2<f64>,
    estimated_log_mean: Array2<f64>,
    estimated_log_1m_mean: Array2<f64>,
}

impl TwoStatParam for BetaMatrix {
    type Stat = Array2<f64>;

    fn new(dims: (usize, usize), a0: f64, b0: f64) -> Self {
        let mut ret = Self {
            num_rows: dims.0,
            num_columns: dims.1,
            a0,
            b0,
            a_stat: Array2::zeros(dims),
            b_stat: Array2::zeros(dims),
            estimated_mean: Array2::zeros(dims),
            estimated_log_mean: Array2::zeros(dims),
            estimated_log_1m_mean: Array2::zeros(dims),
        };
        ret.reset_stat();
        ret.calibrate();
        ret
    }

    fn reset_stat(&mut self) {
        self.a_stat.fill(self.a0);
        self.b_stat.fill(self.b0);
    }

    fn add_stat(&mut self, add_a: &Self::Stat, add_b: &Self::Stat) {
        self.a_stat += add_a;
        self.b_stat += add_b;
    }

    fn update_stat(&mut self, update_a: &Self::Stat, update_b: &Self::Stat) {
        self.reset_stat();
        self.add_stat(update_a, update_b);
    }

    fn stochastic_update(
        &mut self,
        add_a: &Self::Stat,
        add_b: &Self::Stat,
        minibatchfrac: f64,
        stepsize: f64,
    ) {
        let (a0, b0) = (self.a0, self.b0);
        self.a_stat.zip_mut_with(add_a, |cur, &add| {
            *cur = (1.0 - stepsize) * *cur + stepsize * (a0 + add / minibatchfrac);
        });
        self.b_stat.zip_mut_with(add_b, |cur, &add| {
            *cur = (1.0 - stepsize) * *cur + stepsize * (b0 + add / minibatchfrac);
        });
    }
}

impl PosteriorInference for BetaMatrix {
    type Mat = Array2<f64>;

    fn calibrate(&mut self) {
        for ((i, j), &a) in self.a_stat.indexed_iter() {
            let b = self.b_stat[[i, j]];
            let dg_total = digamma(a + b);
            self.estimated_mean[[i, j]] = a / (a + b);
            self.estimated_log_mean[[i, j]] = digamma(a) - dg_total;
            self.estimated_log_1m_mean[[i, j]] = digamma(b) - dg_total;
        }
    }

    fn posterior_mean(&self) -> &Self::Mat {
        &self.estimated_mean
    }

    fn posterior_log_mean(&self) -> &Self::Mat {
        &self.estimated_log_mean
    }

    fn posterior_sample<R: Rng>(&self, rng: &mut R) -> anyhow::Result<Self::Mat> {
        let mut out = Array2::zeros((self.num_rows, self.num_columns));
        for ((i, j), x) in out.indexed_iter_mut() {
            let a = self.a_stat[[i, j]];
            let b = self.b_stat[[i, j]];
            ensure!(a > 0.0 && b > 0.0, "invalid beta statistics at ({},{})", i, j);
            *x = BetaDistr::new(a, b)?.sample(rng);
        }
        Ok(out)
    }

    fn vlb(&self) -> f64 {
        let mut total = 0.0;
        for ((i, j), &a) in self.a_stat.indexed_iter() {
            total += beta_vlb_term(self.a0, self.b0, a, self.b_stat[[i, j]]);
        }
        total
    }
}

impl BetaMatrix {
    /// E[ln p] - E[ln (1 - p)], the expected log odds.
    pub fn posterior_logit_mean(&self) -> Array2<f64> {
        &self.estimated_log_mean - &self.estimated_log_1m_mean
    }

    pub fn posterior_log_1m_mean(&self) -> &Array2<f64> {
        &self.estimated_log_1m_mean
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prior_mean_is_balanced() {
        let bm = BetaMatrix::new((2, 2), 0.5, 0.5);
        for &m in bm.posterior_mean() {
            assert!((m - 0.5).abs() < 1e-12);
        }
    }

    #[test]
    fn counts_move_the_mean() {
        let mut bm = BetaMatrix::new((1, 1), 1.0, 1.0);
        bm.update_stat(&array![[8.0]], &array![[2.0]]);
        bm.calibrate();
        assert!((bm.posterior_mean()[[0, 0]] - 9.0 / 12.0).abs() < 1e-12);
    }

    #[test]
    fn logit_mean_sign_follows_the_counts() {
        let mut bm = BetaMatrix::new((1, 1), 1.0, 1.0);
        bm.update_stat(&array![[20.0]], &array![[1.0]]);
        bm.calibrate();
        assert!(bm.posterior_logit_mean()[[0, 0]] > 0.0);
    }
}
