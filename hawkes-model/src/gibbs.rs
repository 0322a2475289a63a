//! Collapsed Gibbs sampling for the spike-and-slab model.

use crate::model::{Dataset, ModelParameters, NetworkHawkesGibbs};
use crate::weights::WeightModel;
use anyhow::ensure;
use ndarray::prelude::*;

pub trait GibbsSampling {
    /// One full sweep over every conditional.
    fn resample_model(&mut self) -> anyhow::Result<()>;

    fn copy_sample(&self) -> ModelParameters;

    fn resample_and_copy(&mut self) -> anyhow::Result<ModelParameters> {
        self.resample_model()?;
        Ok(self.copy_sample())
    }
}

impl GibbsSampling for NetworkHawkesGibbs {
    fn resample_model(&mut self) -> anyhow::Result<()> {
        let exposure = self.total_exposure();

        // conjugate globals from the current attributions
        let mut z0 = Array1::zeros(self.k);
        let mut z_cube = Array3::zeros((self.k, self.k, self.b));
        let mut z_edge = Array2::zeros((self.k, self.k));
        for ds in &self.data {
            z0 += &ds.parents.z0_sum();
            z_cube += &ds.parents.z_cube_sum();
            z_edge += &ds.parents.z_edge_sum();
        }

        self.bias.resample(&mut self.rng, &z0, exposure)?;
        self.impulses.resample(&mut self.rng, &z_cube)?;
        let n = self.total_events();
        self.weights
            .resample(&mut self.rng, &self.network, &n, &z_edge)?;

        // local attributions from the fresh globals
        let w_eff = self.weights.effective();
        for ds in self.data.iter_mut() {
            let Dataset { s, f, parents, .. } = ds;
            parents.resample(
                &mut self.rng,
                &s.view(),
                &f.view(),
                &self.bias.lambda0,
                &w_eff,
                &self.impulses.g,
            )?;
        }

        self.network
            .resample(&mut self.rng, &self.weights.a, &self.weights.w)?;
        Ok(())
    }

    fn copy_sample(&self) -> ModelParameters {
        self.parameters()
    }
}

/// A collected posterior chain: parameter snapshots with the joint log
/// probability and optional heldout likelihood per iteration.
pub struct McmcChain {
    pub samples: Vec<ModelParameters>,
    pub log_probs: Vec<f64>,
    pub heldout_lls: Vec<f64>,
}

impl McmcChain {
    pub fn run(
        model: &mut NetworkHawkesGibbs,
        num_iters: usize,
        heldout: Option<&Array2<u64>>,
    ) -> anyhow::Result<Self> {
        let mut chain = Self {
            samples: Vec::with_capacity(num_iters),
            log_probs: Vec::with_capacity(num_iters),
            heldout_lls: Vec::with_capacity(num_iters),
        };
        for iter in 0..num_iters {
            let sample = model.resample_and_copy()?;
            let lp = model.log_probability()?;
            if let Some(counts) = heldout {
                chain.heldout_lls.push(model.heldout_log_likelihood(counts)?);
            }
            if iter % 10 == 0 {
                log::info!("gibbs iteration {}: log probability {:.3}", iter, lp);
            }
            chain.samples.push(sample);
            chain.log_probs.push(lp);
        }
        Ok(chain)
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Posterior mean of A over the collected samples.
    pub fn posterior_mean_adjacency(&self) -> anyhow::Result<Array2<f64>> {
        self.average(|p| &p.a)
    }

    /// Posterior mean of A * W over the collected samples.
    pub fn posterior_mean_weights(&self) -> anyhow::Result<Array2<f64>> {
        ensure!(!self.samples.is_empty(), "empty chain");
        let mut acc: Array2<f64> = &self.samples[0].a * &self.samples[0].w;
        for p in &self.samples[1..] {
            acc += &(&p.a * &p.w);
        }
        Ok(acc / self.samples.len() as f64)
    }

    pub fn posterior_mean_bias(&self) -> anyhow::Result<Array1<f64>> {
        ensure!(!self.samples.is_empty(), "empty chain");
        let mut acc = self.samples[0].lambda0.clone();
        for p in &self.samples[1..] {
            acc += &p.lambda0;
        }
        Ok(acc / self.samples.len() as f64)
    }

    fn average(
        &self,
        get: impl Fn(&ModelParameters) -> &Array2<f64>,
    ) -> anyhow::Result<Array2<f64>> {
        ensure!(!self.samples.is_empty(), "empty chain");
        let mut acc = get(&self.samples[0]).clone();
        for p in &self.samples[1..] {
            acc += get(p);
        }
        Ok(acc / self.samples.len() as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::NetworkHawkesOptions;

    fn options() -> NetworkHawkesOptions {
        let mut opts = NetworkHawkesOptions::new(2);
        opts.b = 2;
        opts.dt_max = 4.0;
        opts.fixed_p = Some(0.5);
        opts.fixed_v = Some(5.0);
        opts
    }

    #[test]
    fn sweeps_preserve_parent_conservation() {
        let mut model = NetworkHawkesGibbs::new(&options()).unwrap();
        model.generate(100, true).unwrap();
        for _ in 0..5 {
            model.resample_model().unwrap();
            let ds = &model.data[0];
            for t in 0..ds.s.nrows() {
                for k2 in 0..2 {
                    let attributed =
                        ds.parents.z0[[t, k2]] + ds.parents.z.slice(s![t, .., k2, ..]).sum();
                    assert_eq!(attributed, ds.s[[t, k2]]);
                }
            }
        }
    }

    #[test]
    fn chain_collects_every_iteration() {
        let mut model = NetworkHawkesGibbs::new(&options()).unwrap();
        let sim = model.generate(60, true).unwrap();
        let chain = McmcChain::run(&mut model, 8, Some(&sim.counts)).unwrap();
        assert_eq!(chain.len(), 8);
        assert_eq!(chain.log_probs.len(), 8);
        assert_eq!(chain.heldout_lls.len(), 8);
        assert!(chain.log_probs.iter().all(|lp| lp.is_finite()));
    }

    #[test]
    fn posterior_means_have_model_shapes() {
        let mut model = NetworkHawkesGibbs::new(&options()).unwrap();
        model.generate(40, true).unwrap();
        let chain = McmcChain::run(&mut model, 5, None).unwrap();
        assert_eq!(chain.posterior_mean_adjacency().unwrap().dim(), (2, 2));
        assert_eq!(chain.posterior_mean_weights().unwrap().dim(), (2, 2));
        assert_eq!(chain.posterior_mean_bias().unwrap().len(), 2);
    }

    #[test]
    fn background_rate_is_recovered_without_excitation() {
        // all-off network: events can only come from the background
        let mut opts = options();
        opts.fixed_p = Some(0.0);
        let mut model = NetworkHawkesGibbs::new(&opts).unwrap();
        let mut params = model.parameters();
        params.a = Array2::zeros((2, 2));
        params.lambda0 = array![5.0, 1.0];
        model.set_parameters(&params).unwrap();
        model.generate(500, true).unwrap();

        let chain = McmcChain::run(&mut model, 50, None).unwrap();
        let mean = chain.posterior_mean_bias().unwrap();
        assert!((mean[0] - 5.0).abs() < 1.0, "lambda0[0] {}", mean[0]);
        assert!((mean[1] - 1.0).abs() < 0.5, "lambda0[1] {}", mean[1]);
    }
}
