//! Gamma-distributed per-node background rates.

use anyhow::Context;
use hawkes_param::moments::gamma_ln_pdf;
use hawkes_param::{GammaMatrix, PosteriorInference, TwoStatParam};
use ndarray::prelude::*;
use rand::Rng;
use rand_distr::{Distribution, Gamma as GammaDistr};

/// lambda0[k] ~ Gamma(alpha0, beta0), one homogeneous Poisson background
/// rate per node.
///
/// Carries both the point state used by Gibbs sampling and rate
/// computations, and the variational gamma factor used by mean field.
pub struct GammaBias {
    k: usize,
    alpha0: f64,
    beta0: f64,
    /// point state (current sample)
    pub lambda0: Array1<f64>,
    /// variational factor, K x 1
    mf: GammaMatrix,
}

impl GammaBias {
    pub fn new<R: Rng>(k: usize, alpha0: f64, beta0: f64, rng: &mut R) -> anyhow::Result<Self> {
        let prior = GammaDistr::new(alpha0, 1.0 / beta0)
            .context("invalid background rate prior")?;
        let lambda0 = Array1::from_iter((0..k).map(|_| prior.sample(rng)));
        Ok(Self {
            k,
            alpha0,
            beta0,
            lambda0,
            mf: GammaMatrix::new((k, 1), alpha0, beta0),
        })
    }

    /// Gibbs update from background-attributed event counts.
    ///
    /// `z0_sum[k]` is the total count attributed to the background of
    /// node k across all datasets; `exposure` is the total observation
    /// time (sum of T_i * dt).
    pub fn resample<R: Rng>(
        &mut self,
        rng: &mut R,
        z0_sum: &Array1<f64>,
        exposure: f64,
    ) -> anyhow::Result<()> {
        for k in 0..self.k {
            let shape = self.alpha0 + z0_sum[k];
            let rate = self.beta0 + exposure;
            let distr = GammaDistr::new(shape, 1.0 / rate)
                .context("invalid background rate posterior")?;
            self.lambda0[k] = distr.sample(rng);
        }
        Ok(())
    }

    pub fn meanfield_update(&mut self, ez0_sum: &Array1<f64>, exposure: f64) {
        let (a, b) = self.stat_arrays(ez0_sum, exposure);
        self.mf.update_stat(&a, &b);
        self.mf.calibrate();
    }

    pub fn meanfield_sgd_step(
        &mut self,
        ez0_sum: &Array1<f64>,
        exposure: f64,
        minibatchfrac: f64,
        stepsize: f64,
    ) {
        let (a, b) = self.stat_arrays(ez0_sum, exposure);
        self.mf.stochastic_update(&a, &b, minibatchfrac, stepsize);
        self.mf.calibrate();
    }

    fn stat_arrays(&self, ez0_sum: &Array1<f64>, exposure: f64) -> (Array2<f64>, Array2<f64>) {
        let a = ez0_sum
            .view()
            .insert_axis(Axis(1))
            .to_owned();
        let b = Array2::from_elem((self.k, 1), exposure);
        (a, b)
    }

    pub fn expected_lambda0(&self) -> Array1<f64> {
        self.mf.posterior_mean().column(0).to_owned()
    }

    pub fn expected_log_lambda0(&self) -> Array1<f64> {
        self.mf.posterior_log_mean().column(0).to_owned()
    }

    /// Prior log density at the current point state.
    pub fn log_probability(&self) -> f64 {
        self.lambda0
            .iter()
            .map(|&x| gamma_ln_pdf(self.alpha0, self.beta0, x))
            .sum()
    }

    pub fn vlb(&self) -> f64 {
        self.mf.vlb()
    }

    pub fn resample_from_mf<R: Rng>(&mut self, rng: &mut R) -> anyhow::Result<()> {
        self.lambda0 = self.mf.posterior_sample(rng)?.column(0).to_owned();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::SmallRng;
    use rand::SeedableRng;

    #[test]
    fn resample_concentrates_on_the_empirical_rate() {
        let mut rng = SmallRng::seed_from_u64(0);
        let mut bias = GammaBias::new(2, 1.0, 1.0, &mut rng).unwrap();

        // 500 background events over exposure 100 -> rate near 5
        let z0 = array![500.0, 50.0];
        let mut acc = Array1::<f64>::zeros(2);
        let n = 200;
        for _ in 0..n {
            bias.resample(&mut rng, &z0, 100.0).unwrap();
            acc += &bias.lambda0;
        }
        let mean = acc / n as f64;
        assert!((mean[0] - 501.0 / 101.0).abs() < 0.3, "mean {}", mean[0]);
        assert!((mean[1] - 51.0 / 101.0).abs() < 0.1, "mean {}", mean[1]);
    }

    #[test]
    fn meanfield_expectations_match_closed_form() {
        let mut rng = SmallRng::seed_from_u64(1);
        let mut bias = GammaBias::new(1, 2.0, 1.0, &mut rng).unwrap();
        bias.meanfield_update(&array![10.0], 5.0);
        assert!((bias.expected_lambda0()[0] - 12.0 / 6.0).abs() < 1e-12);
    }

    #[test]
    fn sgd_with_unit_step_and_full_batch_matches_meanfield() {
        let mut rng = SmallRng::seed_from_u64(2);
        let mut a = GammaBias::new(3, 1.0, 1.0, &mut rng).unwrap();
        let mut b = GammaBias::new(3, 1.0, 1.0, &mut rng).unwrap();
        let z0 = array![4.0, 0.0, 9.0];

        a.meanfield_update(&z0, 20.0);
        b.meanfield_sgd_step(&z0, 20.0, 1.0, 1.0);

        assert_eq!(a.expected_lambda0(), b.expected_lambda0());
        assert_eq!(a.expected_log_lambda0(), b.expected_log_lambda0());
    }
}
