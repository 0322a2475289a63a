//! Discrete-time network Hawkes model.
//!
//! The model is generic over the weight treatment: the Gibbs sampler
//! uses collapsed spike-and-slab weights and the variational engine a
//! gamma mixture. Everything else (basis, bias, impulses, network,
//! parents, rates, likelihoods) is shared.

use crate::basis::CosineBasis;
use crate::bias::GammaBias;
use crate::impulse::DirichletImpulseResponses;
use crate::network::{NetworkPriors, StochasticBlockModel};
use crate::parents::Parents;
use crate::standard::StandardHawkesModel;
use crate::weights::{GammaMixtureWeights, SpikeAndSlabWeights, WeightModel};

use anyhow::{ensure, Context};
use hawkes_param::moments::ln_gamma;
use ndarray::prelude::*;
use rand::rngs::SmallRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Poisson};
use serde::{Deserialize, Serialize};

/// Number of events per bin beyond which generation is considered to
/// have exploded.
const SATURATION_LIMIT: u64 = 1000;

#[derive(Debug, Clone)]
pub struct NetworkHawkesOptions {
    /// number of nodes
    pub k: usize,
    /// bin width
    pub dt: f64,
    /// impulse response support
    pub dt_max: f64,
    /// number of basis bumps
    pub b: usize,
    /// number of latent blocks
    pub c: usize,
    /// gamma prior over background rates
    pub alpha0: f64,
    pub beta0: f64,
    /// dirichlet concentration over impulse coefficients
    pub gamma: f64,
    /// gamma shape of the weight prior
    pub kappa: f64,
    /// block model hypers
    pub network: NetworkPriors,
    /// spike component of the mixture weight model
    pub kappa0: f64,
    pub nu0: f64,
    pub allow_self_connections: bool,
    /// pin block assignments, connection probability, or weight rate
    pub fixed_c: Option<Vec<usize>>,
    pub fixed_p: Option<f64>,
    pub fixed_v: Option<f64>,
    pub seed: u64,
}

impl NetworkHawkesOptions {
    pub fn new(k: usize) -> Self {
        Self {
            k,
            dt: 1.0,
            dt_max: 10.0,
            b: 5,
            c: 1,
            alpha0: 1.0,
            beta0: 1.0,
            gamma: 1.0,
            kappa: 1.0,
            network: NetworkPriors::default(),
            kappa0: 0.1,
            nu0: 10.0,
            allow_self_connections: true,
            fixed_c: None,
            fixed_p: None,
            fixed_v: None,
            seed: 42,
        }
    }
}

/// A value snapshot of every canonical parameter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelParameters {
    pub a: Array2<f64>,
    pub w: Array2<f64>,
    pub g: Array3<f64>,
    pub lambda0: Array1<f64>,
    pub c: Vec<usize>,
    pub p: Array2<f64>,
    pub v: Array2<f64>,
    pub m: Array1<f64>,
}

/// One observed count matrix with its cached features and parents.
pub struct Dataset {
    /// T x K counts (integral, stored as f64)
    pub s: Array2<f64>,
    /// per-node event totals
    pub n: Array1<f64>,
    /// T x K x B filtered features
    pub f: Array3<f64>,
    pub parents: Parents,
}

pub struct Simulation {
    pub counts: Array2<u64>,
    pub rates: Array2<f64>,
    /// true if any bin hit the per-bin event cap
    pub saturated: bool,
}

pub struct NetworkHawkesModel<Wm: WeightModel> {
    pub(crate) k: usize,
    pub(crate) dt: f64,
    pub(crate) b: usize,
    pub(crate) basis: CosineBasis,
    pub(crate) bias: GammaBias,
    pub(crate) impulses: DirichletImpulseResponses,
    pub(crate) network: StochasticBlockModel,
    pub(crate) weights: Wm,
    pub(crate) data: Vec<Dataset>,
    pub(crate) rng: SmallRng,
    /// cyclic minibatch position for SVI; None before the first step
    pub(crate) sgd_cursor: Option<usize>,
    /// lower bound of the previous coordinate sweep
    pub(crate) last_vlb: Option<f64>,
}

pub type NetworkHawkesGibbs = NetworkHawkesModel<SpikeAndSlabWeights>;
pub type NetworkHawkesMeanField = NetworkHawkesModel<GammaMixtureWeights>;

impl NetworkHawkesGibbs {
    pub fn new(options: &NetworkHawkesOptions) -> anyhow::Result<Self> {
        NetworkHawkesModel::with_weights(options, |network, allow_self, rng| {
            SpikeAndSlabWeights::new(options.k, options.kappa, network, allow_self, rng)
        })
    }
}

impl NetworkHawkesMeanField {
    pub fn new(options: &NetworkHawkesOptions) -> anyhow::Result<Self> {
        NetworkHawkesModel::with_weights(options, |network, allow_self, rng| {
            GammaMixtureWeights::new(
                options.k,
                options.kappa,
                options.kappa0,
                options.nu0,
                network,
                allow_self,
                rng,
            )
        })
    }
}

impl<Wm: WeightModel> NetworkHawkesModel<Wm> {
    fn with_weights(
        options: &NetworkHawkesOptions,
        build: impl FnOnce(&StochasticBlockModel, bool, &mut SmallRng) -> anyhow::Result<Wm>,
    ) -> anyhow::Result<Self> {
        ensure!(options.k > 0, "need at least one node");
        ensure!(options.alpha0 > 0.0 && options.beta0 > 0.0, "invalid bias prior");
        ensure!(options.gamma > 0.0, "invalid impulse prior");
        ensure!(options.kappa > 0.0, "invalid weight shape");

        let mut rng = SmallRng::seed_from_u64(options.seed);
        let basis = CosineBasis::new(options.b, options.dt, options.dt_max)?;
        let bias = GammaBias::new(options.k, options.alpha0, options.beta0, &mut rng)?;
        let impulses =
            DirichletImpulseResponses::new(options.k, options.b, options.gamma, &mut rng)?;
        let network = StochasticBlockModel::new(
            options.k,
            options.c,
            options.kappa,
            options.network,
            options.fixed_c.clone(),
            options.fixed_p,
            options.fixed_v,
            options.allow_self_connections,
            &mut rng,
        )?;
        let weights = build(&network, options.allow_self_connections, &mut rng)?;

        Ok(Self {
            k: options.k,
            dt: options.dt,
            b: options.b,
            basis,
            bias,
            impulses,
            network,
            weights,
            data: Vec::new(),
            rng,
            sgd_cursor: None,
            last_vlb: None,
        })
    }

    pub fn num_nodes(&self) -> usize {
        self.k
    }

    pub fn num_basis(&self) -> usize {
        self.b
    }

    pub fn dt(&self) -> f64 {
        self.dt
    }

    pub fn num_datasets(&self) -> usize {
        self.data.len()
    }

    pub fn network(&self) -> &StochasticBlockModel {
        &self.network
    }

    pub fn weight_model(&self) -> &Wm {
        &self.weights
    }

    /// Register a T x K count matrix. Features are filtered once and
    /// the parents are drawn from the current parameters.
    pub fn add_data(&mut self, counts: &Array2<u64>) -> anyhow::Result<()> {
        ensure!(
            counts.ncols() == self.k,
            "expected {} columns, got {}",
            self.k,
            counts.ncols()
        );
        let s = counts.mapv(|x| x as f64);
        let n = s.sum_axis(Axis(0));
        let f = self.basis.convolve_with_basis(&s.view());
        let mut parents = Parents::new(s.nrows(), self.k, self.b);
        let w_eff = self.weights.effective();
        parents.resample(
            &mut self.rng,
            &s.view(),
            &f.view(),
            &self.bias.lambda0,
            &w_eff,
            &self.impulses.g,
        )?;
        self.data.push(Dataset { s, n, f, parents });
        Ok(())
    }

    /// H[k, k', b]: contribution of a unit of filtered input at the
    /// source node k to the rate of k'.
    fn excitation_tensor(&self) -> Array3<f64> {
        let eff = self.weights.effective();
        let mut h = Array3::zeros((self.k, self.k, self.b));
        for ((k1, k2, b), x) in h.indexed_iter_mut() {
            *x = eff[[k1, k2]] * self.impulses.g[[k1, k2, b]];
        }
        h
    }

    fn rate_from_features(&self, f: &ArrayView3<f64>) -> Array2<f64> {
        let t = f.dim().0;
        let h = self.excitation_tensor();
        let mut r = Array2::zeros((t, self.k));
        for ti in 0..t {
            for k2 in 0..self.k {
                let mut acc = self.bias.lambda0[k2];
                for k1 in 0..self.k {
                    for b in 0..self.b {
                        acc += f[[ti, k1, b]] * h[[k1, k2, b]];
                    }
                }
                r[[ti, k2]] = acc;
            }
        }
        r
    }

    /// Rates of a registered dataset at the current point parameters.
    pub fn compute_rate(&self, index: usize) -> anyhow::Result<Array2<f64>> {
        ensure!(index < self.data.len(), "no dataset at index {}", index);
        Ok(self.rate_from_features(&self.data[index].f.view()))
    }

    /// Rate of a single target node in a registered dataset, without
    /// touching the other columns.
    pub fn compute_rate_for(&self, index: usize, node: usize) -> anyhow::Result<Array1<f64>> {
        ensure!(index < self.data.len(), "no dataset at index {}", index);
        ensure!(node < self.k, "no node {}", node);
        let f = self.data[index].f.view();
        let t = f.dim().0;
        let eff = self.weights.effective();
        let mut r = Array1::from_elem(t, self.bias.lambda0[node]);
        for k1 in 0..self.k {
            for b in 0..self.b {
                let h = eff[[k1, node]] * self.impulses.g[[k1, node, b]];
                if h == 0.0 {
                    continue;
                }
                for ti in 0..t {
                    r[ti] += f[[ti, k1, b]] * h;
                }
            }
        }
        Ok(r)
    }

    /// Rates of counts that were never registered with the model.
    pub fn compute_rate_of(&self, counts: &Array2<u64>) -> anyhow::Result<Array2<f64>> {
        ensure!(
            counts.ncols() == self.k,
            "expected {} columns, got {}",
            self.k,
            counts.ncols()
        );
        let s = counts.mapv(|x| x as f64);
        let f = self.basis.convolve_with_basis(&s.view());
        Ok(self.rate_from_features(&f.view()))
    }

    fn poisson_log_likelihood(s: &ArrayView2<f64>, r: &Array2<f64>, dt: f64) -> anyhow::Result<f64> {
        let mut total = 0.0;
        for (&count, &rate) in s.iter().zip(r.iter()) {
            ensure!(rate > 0.0, "non-positive rate {}", rate);
            total += -ln_gamma(count + 1.0) + count * (rate * dt).ln() - rate * dt;
        }
        Ok(total)
    }

    pub fn log_likelihood_for(&self, index: usize) -> anyhow::Result<f64> {
        let r = self.compute_rate(index)?;
        Self::poisson_log_likelihood(&self.data[index].s.view(), &r, self.dt)
    }

    /// Likelihood of one node's column of a registered dataset.
    pub fn log_likelihood_for_process(&self, index: usize, node: usize) -> anyhow::Result<f64> {
        let r = self.compute_rate_for(index, node)?;
        let s = self.data[index].s.column(node);
        let mut total = 0.0;
        for (&count, &rate) in s.iter().zip(r.iter()) {
            ensure!(rate > 0.0, "non-positive rate {}", rate);
            total += -ln_gamma(count + 1.0) + count * (rate * self.dt).ln() - rate * self.dt;
        }
        Ok(total)
    }

    pub fn log_likelihood(&self) -> anyhow::Result<f64> {
        let mut total = 0.0;
        for index in 0..self.data.len() {
            total += self.log_likelihood_for(index)?;
        }
        Ok(total)
    }

    /// Likelihood of counts that were never registered with the model.
    pub fn heldout_log_likelihood(&self, counts: &Array2<u64>) -> anyhow::Result<f64> {
        let r = self.compute_rate_of(counts)?;
        let s = counts.mapv(|x| x as f64);
        Self::poisson_log_likelihood(&s.view(), &r, self.dt)
    }

    /// Joint log density of data and point parameters.
    pub fn log_probability(&self) -> anyhow::Result<f64> {
        Ok(self.log_likelihood()?
            + self.bias.log_probability()
            + self.impulses.log_probability()
            + self.weights.log_prior(&self.network)
            + self.network.log_probability())
    }

    /// The process is stationary when the largest real eigenvalue part
    /// of the effective weight matrix stays below one.
    pub fn check_stability(&self) -> bool {
        let eff = self.weights.effective();
        let mat = nalgebra::DMatrix::from_fn(self.k, self.k, |i, j| eff[[i, j]]);
        let max_eig = mat
            .complex_eigenvalues()
            .iter()
            .map(|e| e.re)
            .fold(f64::NEG_INFINITY, f64::max);
        if max_eig >= 1.0 {
            log::warn!("unstable network: max eigenvalue {:.3} >= 1", max_eig);
        }
        max_eig < 1.0
    }

    /// Simulate T bins from the current point parameters.
    pub fn generate(&mut self, t: usize, keep: bool) -> anyhow::Result<Simulation> {
        let h = self.excitation_tensor();
        let basis = self.basis.matrix().clone();
        let support = self.basis.support();

        let mut rates = Array2::zeros((t, self.k));
        for ti in 0..t {
            for k2 in 0..self.k {
                rates[[ti, k2]] = self.bias.lambda0[k2];
            }
        }

        let mut counts = Array2::<u64>::zeros((t, self.k));
        let mut saturated = false;
        for ti in 0..t {
            for kk in 0..self.k {
                let lam = rates[[ti, kk]] * self.dt;
                ensure!(lam.is_finite() && lam >= 0.0, "invalid rate at bin {}", ti);
                let mut count = if lam > 0.0 {
                    Poisson::new(lam).context("invalid poisson rate")?.sample(&mut self.rng)
                        as u64
                } else {
                    0
                };
                if count >= SATURATION_LIMIT {
                    log::warn!(
                        "generation saturated at bin {}, node {}: {} events",
                        ti,
                        kk,
                        count
                    );
                    saturated = true;
                    count = SATURATION_LIMIT;
                }
                counts[[ti, kk]] = count;

                if count > 0 {
                    // propagate the excitation into future bins
                    let horizon = support.min(t - ti - 1);
                    for l in 1..=horizon {
                        for k2 in 0..self.k {
                            let mut add = 0.0;
                            for b in 0..self.b {
                                add += basis[[l - 1, b]] * h[[kk, k2, b]];
                            }
                            rates[[ti + l, k2]] += count as f64 * add;
                        }
                    }
                }
            }
        }

        if keep {
            self.add_data(&counts)?;
        }
        Ok(Simulation {
            counts,
            rates,
            saturated,
        })
    }

    pub fn parameters(&self) -> ModelParameters {
        ModelParameters {
            a: self.weights.adjacency().clone(),
            w: self.weights.weight_matrix().clone(),
            g: self.impulses.g.clone(),
            lambda0: self.bias.lambda0.clone(),
            c: self.network.assignments.clone(),
            p: self.network.p.clone(),
            v: self.network.v.clone(),
            m: self.network.m.clone(),
        }
    }

    /// Install a parameter snapshot as the point state.
    pub fn set_parameters(&mut self, params: &ModelParameters) -> anyhow::Result<()> {
        let k = self.k;
        let c = self.network.num_blocks();
        ensure!(params.g.dim() == (k, k, self.b), "impulse shape mismatch");
        ensure!(params.lambda0.len() == k, "bias length mismatch");
        ensure!(
            params.lambda0.iter().all(|&x| x >= 0.0),
            "background rates must be non-negative"
        );
        for k1 in 0..k {
            for k2 in 0..k {
                let total: f64 = params.g.slice(s![k1, k2, ..]).sum();
                ensure!(
                    (total - 1.0).abs() < 1e-8
                        && params.g.slice(s![k1, k2, ..]).iter().all(|&x| x >= 0.0),
                    "impulse coefficients at ({},{}) are not a simplex",
                    k1,
                    k2
                );
            }
        }
        ensure!(params.c.len() == k, "assignment length mismatch");
        ensure!(params.c.iter().all(|&x| x < c), "block assignment out of range");
        ensure!(params.p.dim() == (c, c), "connection probability shape mismatch");
        ensure!(
            params.p.iter().all(|&x| (0.0..=1.0).contains(&x)),
            "connection probabilities must lie in [0, 1]"
        );
        ensure!(params.v.dim() == (c, c), "weight rate shape mismatch");
        ensure!(params.v.iter().all(|&x| x > 0.0), "weight rates must be positive");
        ensure!(params.m.len() == c, "block probability length mismatch");
        ensure!(
            (params.m.sum() - 1.0).abs() < 1e-8 && params.m.iter().all(|&x| x >= 0.0),
            "block probabilities are not a simplex"
        );

        self.weights.set_state(params.a.clone(), params.w.clone())?;
        self.impulses.g = params.g.clone();
        self.bias.lambda0 = params.lambda0.clone();
        self.network.assignments = params.c.clone();
        self.network.p = params.p.clone();
        self.network.v = params.v.clone();
        self.network.m = params.m.clone();
        Ok(())
    }

    /// Start from the hypothesis that all events are background noise.
    pub fn initialize_to_background_rate(&mut self) -> anyhow::Result<()> {
        ensure!(!self.data.is_empty(), "no data to initialize from");
        let exposure = self.total_exposure();
        let n = self.total_events();
        self.bias.lambda0 = n.mapv(|x| (x / exposure).max(1e-8));
        self.bias.meanfield_update(&n, exposure);
        Ok(())
    }

    /// Seed the point state from a MAP fit of the standard model.
    pub fn initialize_with_standard_model(
        &mut self,
        standard: &StandardHawkesModel,
    ) -> anyhow::Result<()> {
        let (lambda0, w, g) = standard.hawkes_parameters()?;
        ensure!(lambda0.len() == self.k, "node count mismatch");
        ensure!(g.dim() == (self.k, self.k, self.b), "basis size mismatch");
        let mut a = Array2::ones((self.k, self.k));
        if !self.network.allow_self_connections() {
            a.diag_mut().fill(0.0);
        }
        self.bias.lambda0 = lambda0;
        self.impulses.g = g;
        self.weights.set_state(a, w)?;
        Ok(())
    }

    pub(crate) fn total_exposure(&self) -> f64 {
        self.data.iter().map(|d| d.s.nrows() as f64 * self.dt).sum()
    }

    pub(crate) fn total_events(&self) -> Array1<f64> {
        let mut n = Array1::zeros(self.k);
        for d in &self.data {
            n += &d.n;
        }
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn small_options() -> NetworkHawkesOptions {
        let mut opts = NetworkHawkesOptions::new(2);
        opts.b = 3;
        opts.dt_max = 5.0;
        opts.fixed_p = Some(0.5);
        opts.fixed_v = Some(10.0);
        opts
    }

    #[test]
    fn add_data_rejects_mismatched_shapes() {
        let mut model = NetworkHawkesGibbs::new(&small_options()).unwrap();
        let bad = Array2::<u64>::zeros((10, 3));
        assert!(model.add_data(&bad).is_err());
    }

    #[test]
    fn rates_are_at_least_the_background() {
        let mut model = NetworkHawkesGibbs::new(&small_options()).unwrap();
        let sim = model.generate(50, true).unwrap();
        assert!(!sim.saturated);
        let r = model.compute_rate(0).unwrap();
        for t in 0..50 {
            for k in 0..2 {
                assert!(r[[t, k]] >= model.bias.lambda0[k] - 1e-12);
            }
        }
    }

    #[test]
    fn generated_rates_match_recomputed_rates() {
        let mut model = NetworkHawkesGibbs::new(&small_options()).unwrap();
        let sim = model.generate(80, true).unwrap();
        let r = model.compute_rate(0).unwrap();
        for t in 0..80 {
            for k in 0..2 {
                assert_relative_eq!(sim.rates[[t, k]], r[[t, k]], max_relative = 1e-10);
            }
        }
    }

    #[test]
    fn single_process_rates_match_the_full_matrix_columns() {
        let mut model = NetworkHawkesGibbs::new(&small_options()).unwrap();
        model.generate(60, true).unwrap();
        let full = model.compute_rate(0).unwrap();
        let mut total = 0.0;
        for node in 0..2 {
            let col = model.compute_rate_for(0, node).unwrap();
            for t in 0..60 {
                assert_relative_eq!(col[t], full[[t, node]], max_relative = 1e-12);
            }
            total += model.log_likelihood_for_process(0, node).unwrap();
        }
        assert_relative_eq!(
            total,
            model.log_likelihood_for(0).unwrap(),
            max_relative = 1e-10
        );
        assert!(model.compute_rate_for(0, 2).is_err());
    }

    #[test]
    fn external_rates_match_registered_rates() {
        let mut model = NetworkHawkesGibbs::new(&small_options()).unwrap();
        let sim = model.generate(40, true).unwrap();
        let external = model.compute_rate_of(&sim.counts).unwrap();
        let registered = model.compute_rate(0).unwrap();
        assert_eq!(external, registered);
    }

    #[test]
    fn generating_zero_bins_yields_empty_output() {
        let mut model = NetworkHawkesGibbs::new(&small_options()).unwrap();
        let sim = model.generate(0, false).unwrap();
        assert_eq!(sim.counts.dim(), (0, 2));
        assert_eq!(sim.rates.dim(), (0, 2));
        assert!(!sim.saturated);
    }

    #[test]
    fn likelihood_without_edges_matches_the_homogeneous_closed_form() {
        let mut model = NetworkHawkesGibbs::new(&small_options()).unwrap();
        let mut params = model.parameters();
        params.a = Array2::zeros((2, 2));
        model.set_parameters(&params).unwrap();
        model.generate(50, true).unwrap();

        let ll = model.log_likelihood().unwrap();
        let mut expected = 0.0;
        let ds = &model.data[0];
        for t in 0..50 {
            for k in 0..2 {
                let s = ds.s[[t, k]];
                let lam = model.bias.lambda0[k] * model.dt;
                expected += -ln_gamma(s + 1.0) + s * lam.ln() - lam;
            }
        }
        assert_relative_eq!(ll, expected, max_relative = 1e-12);
    }

    #[test]
    fn parameter_roundtrip_preserves_the_likelihood() {
        let mut model = NetworkHawkesGibbs::new(&small_options()).unwrap();
        model.generate(60, true).unwrap();
        let ll = model.log_likelihood().unwrap();
        let params = model.parameters();

        let mut other = NetworkHawkesGibbs::new(&{
            let mut o = small_options();
            o.seed = 99;
            o
        })
        .unwrap();
        other
            .add_data(&model.data[0].s.mapv(|x| x as u64))
            .unwrap();
        other.set_parameters(&params).unwrap();
        assert_relative_eq!(other.log_likelihood().unwrap(), ll, max_relative = 1e-10);
    }

    #[test]
    fn stability_reflects_the_effective_weights() {
        let mut model = NetworkHawkesGibbs::new(&small_options()).unwrap();
        let mut params = model.parameters();
        params.a = Array2::ones((2, 2));
        params.w = Array2::from_elem((2, 2), 0.1);
        model.set_parameters(&params).unwrap();
        assert!(model.check_stability());

        params.w = Array2::from_elem((2, 2), 2.0);
        model.set_parameters(&params).unwrap();
        assert!(!model.check_stability());
    }

    #[test]
    fn heldout_likelihood_agrees_with_registered_likelihood() {
        let mut model = NetworkHawkesGibbs::new(&small_options()).unwrap();
        let sim = model.generate(40, true).unwrap();
        let ll = model.log_likelihood_for(0).unwrap();
        let heldout = model.heldout_log_likelihood(&sim.counts).unwrap();
        assert_relative_eq!(ll, heldout, max_relative = 1e-10);
    }

    #[test]
    fn set_parameters_rejects_a_broken_simplex() {
        let mut model = NetworkHawkesGibbs::new(&small_options()).unwrap();
        let mut params = model.parameters();
        params.g.fill(0.9);
        assert!(model.set_parameters(&params).is_err());
    }
}
