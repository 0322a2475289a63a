use crate::moments::{digamma, gamma_vlb_term};
use crate::traits::{PosteriorInference, TwoStatParam};

use anyhow::ensure;
use ndarray::prelude::*;
use rand::Rng;
use rand_distr::{Distribution, Gamma as GammaDistr};

/// Poisson-Gamma conjugate parameter matrix.
///
/// x[i,j] ~ Poisson(lambda[i,j] * exposure)
/// lambda[i,j] ~ Gamma(a0, b0)  (shape/rate)
///
/// `a_stat` holds the posterior shapes and `b_stat` the posterior rates.
pub struct GammaMatrix {
    num_rows: usize,
    num_columns: usize,
    //////////////////////
    // hyper parameters //
    //////////////////////
    a0: f64,
    b0: f64,
    ///////////////////////////
    // sufficient statistics //
    ///////////////////////////
    a_stat: Array2<f64>,
    b_stat: Array2<f64>,
    //////////////////////////
    // estimated parameters //
    //////////////////////////
    estimated_mean: Array2<f64>,
    estimated_log_mean: Array2<f64>,
}

impl TwoStatParam for GammaMatrix {
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

impl PosteriorInference for GammaMatrix {
    type Mat = Array2<f64>;

    fn calibrate(&mut self) {
        self.estimated_mean = &self.a_stat / &self.b_stat;
        self.estimated_log_mean =
            &self.a_stat.mapv(digamma) - &self.b_stat.mapv(|b| b.ln());
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
            ensure!(a > 0.0 && b > 0.0, "invalid gamma statistics at ({},{})", i, j);
            // rand_distr parameterizes by shape and scale
            let distr = GammaDistr::new(a, 1.0 / b)?;
            *x = distr.sample(rng);
        }
        Ok(out)
    }

    fn vlb(&self) -> f64 {
        let mut total = 0.0;
        for ((i, j), &a) in self.a_stat.indexed_iter() {
            total += gamma_vlb_term(self.a0, self.b0, a, self.b_stat[[i, j]]);
        }
        total
    }
}

impl GammaMatrix {
    pub fn nrows(&self) -> usize {
        self.num_rows
    }

    pub fn ncols(&self) -> usize {
        self.num_columns
    }

    pub fn shape_stat(&self) -> &Array2<f64> {
        &self.a_stat
    }

    pub fn rate_stat(&self) -> &Array2<f64> {
        &self.b_stat
    }

    pub fn hyper(&self) -> (f64, f64) {
        (self.a0, self.b0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::SmallRng;
    use rand::SeedableRng;

    #[test]
    fn prior_mean_before_any_data() {
        let mut gm = GammaMatrix::new((2, 3), 4.0, 2.0);
        gm.calibrate();
        for &m in gm.posterior_mean() {
            assert!((m - 2.0).abs() < 1e-12);
        }
    }

    #[test]
    fn conjugate_update_shifts_mean() {
        let mut gm = GammaMatrix::new((1, 1), 1.0, 1.0);
        // 10 counts with exposure 5 -> posterior mean (1+10)/(1+5)
        gm.update_stat(&array![[10.0]], &array![[5.0]]);
        gm.calibrate();
        assert!((gm.posterior_mean()[[0, 0]] - 11.0 / 6.0).abs() < 1e-12);
    }

    #[test]
    fn stochastic_update_with_unit_step_is_exact() {
        let mut full = GammaMatrix::new((1, 2), 1.0, 1.0);
        full.update_stat(&array![[3.0, 7.0]], &array![[2.0, 2.0]]);

        let mut svi = GammaMatrix::new((1, 2), 1.0, 1.0);
        svi.stochastic_update(&array![[3.0, 7.0]], &array![[2.0, 2.0]], 1.0, 1.0);

        assert_eq!(full.shape_stat(), svi.shape_stat());
        assert_eq!(full.rate_stat(), svi.rate_stat());
    }

    #[test]
    fn posterior_sample_is_positive() {
        let gm = GammaMatrix::new((3, 3), 2.0, 1.0);
        let mut rng = SmallRng::seed_from_u64(7);
        let s = gm.posterior_sample(&mut rng).unwrap();
        assert!(s.iter().all(|&x| x > 0.0));
    }

    #[test]
    fn sample_mean_tracks_posterior_mean() {
        let mut gm = GammaMatrix::new((1, 1), 2.0, 1.0);
        gm.update_stat(&array![[100.0]], &array![[50.0]]);
        gm.calibrate();
        let mut rng = SmallRng::seed_from_u64(11);
        let n = 2000;
        let mut acc = 0.0;
        for _ in 0..n {
            acc += gm.posterior_sample(&mut rng).unwrap()[[0, 0]];
        }
        let emp = acc / n as f64;
        let truth = gm.posterior_mean()[[0, 0]];
        assert!(
            (emp - truth).abs() < 0.05 * truth,
            "empirical {} vs posterior {}",
            emp,
            truth
        );
    }
}
