//! Standard (non-Bayesian) Hawkes model with a MAP objective.
//!
//! Each node k carries a positive weight row over 1 + K * B features:
//! a constant bias column followed by the filtered features of every
//! (source, bump) pair. Optimization runs in log-weight space so the
//! positivity constraint disappears; the fitted weights can seed the
//! Bayesian models.

use crate::basis::CosineBasis;
use crate::model::ModelParameters;
use anyhow::{ensure, Context};
use argmin::core::{CostFunction, Executor, Gradient, State};
use argmin::solver::linesearch::MoreThuenteLineSearch;
use argmin::solver::quasinewton::LBFGS;
use hawkes_param::moments::ln_gamma;
use ndarray::prelude::*;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

#[derive(Debug, Clone)]
pub struct StandardHawkesOptions {
    pub k: usize,
    pub dt: f64,
    pub dt_max: f64,
    pub b: usize,
    pub l2_penalty: f64,
    pub l1_penalty: f64,
    pub seed: u64,
}

impl StandardHawkesOptions {
    pub fn new(k: usize) -> Self {
        Self {
            k,
            dt: 1.0,
            dt_max: 10.0,
            b: 5,
            l2_penalty: 0.0,
            l1_penalty: 0.0,
            seed: 42,
        }
    }
}

struct StandardDataset {
    /// T x K counts
    s: Array2<f64>,
    /// T x (1 + K * B) features, bias column first
    f: Array2<f64>,
}

pub struct StandardHawkesModel {
    k: usize,
    dt: f64,
    b: usize,
    basis: CosineBasis,
    l2_penalty: f64,
    l1_penalty: f64,
    /// K x (1 + K * B), strictly positive
    weights: Array2<f64>,
    data: Vec<StandardDataset>,
    rng: SmallRng,
}

impl StandardHawkesModel {
    pub fn new(options: &StandardHawkesOptions) -> anyhow::Result<Self> {
        ensure!(options.k > 0, "need at least one node");
        ensure!(
            options.l2_penalty >= 0.0 && options.l1_penalty >= 0.0,
            "penalties must be non-negative"
        );
        let basis = CosineBasis::new(options.b, options.dt, options.dt_max)?;
        let d = 1 + options.k * options.b;
        let mut weights = Array2::from_elem((options.k, d), 0.1);
        weights.column_mut(0).fill(1.0);
        Ok(Self {
            k: options.k,
            dt: options.dt,
            b: options.b,
            basis,
            l2_penalty: options.l2_penalty,
            l1_penalty: options.l1_penalty,
            weights,
            data: Vec::new(),
            rng: SmallRng::seed_from_u64(options.seed),
        })
    }

    pub fn num_nodes(&self) -> usize {
        self.k
    }

    pub fn weights(&self) -> &Array2<f64> {
        &self.weights
    }

    /// Register a T x K count matrix, optionally split into contiguous
    /// minibatch datasets for `sgd_step`.
    ///
    /// The features are always filtered on the full matrix before
    /// slicing, so excitation crossing a chunk boundary is preserved.
    pub fn add_data(
        &mut self,
        counts: &Array2<u64>,
        minibatch: Option<usize>,
    ) -> anyhow::Result<()> {
        ensure!(
            counts.ncols() == self.k,
            "expected {} columns, got {}",
            self.k,
            counts.ncols()
        );
        let s = counts.mapv(|x| x as f64);
        let cube = self.basis.convolve_with_basis(&s.view());
        let t = s.nrows();
        let mut f = Array2::zeros((t, 1 + self.k * self.b));
        f.column_mut(0).fill(1.0);
        for ti in 0..t {
            for k in 0..self.k {
                for b in 0..self.b {
                    f[[ti, 1 + k * self.b + b]] = cube[[ti, k, b]];
                }
            }
        }
        match minibatch {
            None => self.data.push(StandardDataset { s, f }),
            Some(chunk) => {
                ensure!(chunk > 0, "minibatch size must be positive");
                let mut start = 0;
                while start < t {
                    let end = (start + chunk).min(t);
                    self.data.push(StandardDataset {
                        s: s.slice(s![start..end, ..]).to_owned(),
                        f: f.slice(s![start..end, ..]).to_owned(),
                    });
                    start = end;
                }
            }
        }
        Ok(())
    }

    pub fn compute_rate(&self, index: usize) -> anyhow::Result<Array2<f64>> {
        ensure!(index < self.data.len(), "no dataset at index {}", index);
        let ds = &self.data[index];
        Ok(ds.f.dot(&self.weights.t()))
    }

    pub fn log_likelihood(&self) -> anyhow::Result<f64> {
        let mut total = 0.0;
        for index in 0..self.data.len() {
            let r = self.compute_rate(index)?;
            let s = &self.data[index].s;
            for (&count, &rate) in s.iter().zip(r.iter()) {
                ensure!(rate > 0.0, "non-positive rate {}", rate);
                total += -ln_gamma(count + 1.0) + count * rate.ln() - rate * self.dt;
            }
        }
        Ok(total)
    }

    /// Log likelihood minus the penalties on the excitation weights.
    /// The bias column is never penalized.
    pub fn log_posterior(&self) -> anyhow::Result<f64> {
        let excitation = self.weights.slice(s![.., 1..]);
        let l2: f64 = excitation.iter().map(|&w| w * w).sum();
        let l1: f64 = excitation.sum();
        Ok(self.log_likelihood()? - 0.5 * self.l2_penalty * l2 - self.l1_penalty * l1)
    }

    /// Gradient of the penalized likelihood with respect to the log
    /// weights of one node.
    fn log_space_gradient(&self, node: usize, w: &[f64]) -> Vec<f64> {
        let mut grad = grad_ll_node(&self.data, node, w, self.dt);
        for (j, g) in grad.iter_mut().enumerate() {
            if j > 0 {
                *g -= self.l2_penalty * w[j] + self.l1_penalty;
            }
            // chain rule through w = exp(x)
            *g *= w[j];
        }
        grad
    }

    /// MAP fit, one L-BFGS run per node.
    pub fn fit_with_bfgs(&mut self, max_iters: u64) -> anyhow::Result<f64> {
        ensure!(!self.data.is_empty(), "no data to fit");
        for node in 0..self.k {
            let problem = NodeObjective {
                data: &self.data,
                node,
                dt: self.dt,
                l2_penalty: self.l2_penalty,
                l1_penalty: self.l1_penalty,
            };
            let x0: Vec<f64> = self
                .weights
                .row(node)
                .iter()
                .map(|&w| w.max(1e-8).ln())
                .collect();
            let linesearch = MoreThuenteLineSearch::new();
            let solver = LBFGS::new(linesearch, 7);
            let result = Executor::new(problem, solver)
                .configure(|state| state.param(x0).max_iters(max_iters))
                .run()?;
            let best = result
                .state()
                .get_best_param()
                .context("optimizer returned no parameters")?
                .clone();
            for (j, &x) in best.iter().enumerate() {
                self.weights[[node, j]] = x.exp();
            }
            log::info!(
                "node {}: MAP cost {:.4} after {} iterations",
                node,
                result.state().get_best_cost(),
                result.state().get_iter()
            );
        }
        self.log_posterior()
    }

    /// One full-gradient ascent step in log-weight space.
    pub fn gradient_descent_step(&mut self, stepsize: f64) -> anyhow::Result<f64> {
        ensure!(!self.data.is_empty(), "no data to fit");
        for node in 0..self.k {
            let w: Vec<f64> = self.weights.row(node).to_vec();
            let grad = self.log_space_gradient(node, &w);
            for (j, g) in grad.iter().enumerate() {
                let x = self.weights[[node, j]].max(1e-300).ln() + stepsize * g;
                self.weights[[node, j]] = x.exp();
            }
        }
        self.log_posterior()
    }

    /// Stochastic step on one randomly chosen dataset, with momentum.
    /// Returns the updated velocity alongside the objective.
    pub fn sgd_step(
        &mut self,
        velocity: Option<Array2<f64>>,
        learning_rate: f64,
        momentum: f64,
    ) -> anyhow::Result<(Array2<f64>, f64)> {
        ensure!(!self.data.is_empty(), "no data to fit");
        let d = 1 + self.k * self.b;
        let mut vel = velocity.unwrap_or_else(|| Array2::zeros((self.k, d)));
        ensure!(vel.dim() == (self.k, d), "velocity shape mismatch");

        let pick = self.rng.random_range(0..self.data.len());
        let scale = self.data.len() as f64;
        let batch = std::slice::from_ref(&self.data[pick]);
        for node in 0..self.k {
            let w: Vec<f64> = self.weights.row(node).to_vec();
            let mut grad = grad_ll_node(batch, node, &w, self.dt);
            for (j, g) in grad.iter_mut().enumerate() {
                *g *= scale;
                if j > 0 {
                    *g -= self.l2_penalty * w[j] + self.l1_penalty;
                }
                *g *= w[j];
            }
            for j in 0..d {
                vel[[node, j]] = momentum * vel[[node, j]] + learning_rate * grad[j];
                let x = self.weights[[node, j]].max(1e-300).ln() + vel[[node, j]];
                self.weights[[node, j]] = x.exp();
            }
        }
        let objective = self.log_posterior()?;
        Ok((vel, objective))
    }

    /// Explain all events with the background alone.
    pub fn initialize_to_background_rate(&mut self) -> anyhow::Result<()> {
        ensure!(!self.data.is_empty(), "no data to initialize from");
        let exposure: f64 = self.data.iter().map(|d| d.s.nrows() as f64 * self.dt).sum();
        let mut n = Array1::<f64>::zeros(self.k);
        for d in &self.data {
            n += &d.s.sum_axis(Axis(0));
        }
        self.weights.fill(1e-4);
        for k in 0..self.k {
            self.weights[[k, 0]] = (n[k] / exposure).max(1e-8);
        }
        Ok(())
    }

    /// Seed the weight rows from a network-model parameter snapshot,
    /// the inverse of [`Self::hawkes_parameters`].
    pub fn initialize_with_sample(&mut self, params: &ModelParameters) -> anyhow::Result<()> {
        ensure!(params.lambda0.len() == self.k, "node count mismatch");
        ensure!(
            params.g.dim() == (self.k, self.k, self.b),
            "basis size mismatch"
        );
        for k in 0..self.k {
            self.weights[[k, 0]] = params.lambda0[k].max(1e-8);
        }
        for k1 in 0..self.k {
            for k2 in 0..self.k {
                let eff = params.a[[k1, k2]] * params.w[[k1, k2]];
                for b in 0..self.b {
                    // keep strictly positive for the log-space objective
                    self.weights[[k2, 1 + k1 * self.b + b]] =
                        (eff * params.g[[k1, k2, b]]).max(1e-8);
                }
            }
        }
        Ok(())
    }

    /// Decompose the weight rows into (lambda0, W, g).
    ///
    /// `W[k1, k2]` is the total excitation weight of the edge and the
    /// invariant `W[k1, k2] == sum_b weights[k2, 1 + k1 * B + b]` holds
    /// by construction. Edges with zero mass get a uniform g.
    pub fn hawkes_parameters(&self) -> anyhow::Result<(Array1<f64>, Array2<f64>, Array3<f64>)> {
        let lambda0 = self.weights.column(0).to_owned();
        let mut w = Array2::zeros((self.k, self.k));
        let mut g = Array3::zeros((self.k, self.k, self.b));
        for k1 in 0..self.k {
            for k2 in 0..self.k {
                let block = self
                    .weights
                    .slice(s![k2, 1 + k1 * self.b..1 + (k1 + 1) * self.b]);
                let total = block.sum();
                w[[k1, k2]] = total;
                for b in 0..self.b {
                    g[[k1, k2, b]] = if total > 0.0 {
                        block[b] / total
                    } else {
                        1.0 / self.b as f64
                    };
                }
            }
        }
        Ok((lambda0, w, g))
    }
}

fn node_rates(ds: &StandardDataset, w: &[f64]) -> Array1<f64> {
    let t = ds.f.nrows();
    let mut r = Array1::zeros(t);
    for ti in 0..t {
        let mut acc = 0.0;
        for (j, &wj) in w.iter().enumerate() {
            acc += ds.f[[ti, j]] * wj;
        }
        r[ti] = acc;
    }
    r
}

/// sum_t S ln R - R dt for one node, without the Poisson normalizer.
fn unnormalized_ll_node(data: &[StandardDataset], node: usize, w: &[f64], dt: f64) -> f64 {
    let mut total = 0.0;
    for ds in data {
        let r = node_rates(ds, w);
        for (ti, &rate) in r.iter().enumerate() {
            if rate <= 0.0 {
                return f64::NEG_INFINITY;
            }
            total += ds.s[[ti, node]] * rate.ln() - rate * dt;
        }
    }
    total
}

fn grad_ll_node(data: &[StandardDataset], node: usize, w: &[f64], dt: f64) -> Vec<f64> {
    let mut grad = vec![0.0; w.len()];
    for ds in data {
        let r = node_rates(ds, w);
        for ti in 0..ds.f.nrows() {
            let resid = ds.s[[ti, node]] / r[ti] - dt;
            for (j, g) in grad.iter_mut().enumerate() {
                *g += ds.f[[ti, j]] * resid;
            }
        }
    }
    grad
}

/// Negative penalized likelihood of one node in log-weight space.
struct NodeObjective<'a> {
    data: &'a [StandardDataset],
    node: usize,
    dt: f64,
    l2_penalty: f64,
    l1_penalty: f64,
}

impl NodeObjective<'_> {
    fn weights(x: &[f64]) -> Vec<f64> {
        x.iter().map(|&xi| xi.exp()).collect()
    }
}

impl CostFunction for NodeObjective<'_> {
    type Param = Vec<f64>;
    type Output = f64;

    fn cost(&self, x: &Self::Param) -> Result<Self::Output, argmin::core::Error> {
        let w = Self::weights(x);
        let ll = unnormalized_ll_node(self.data, self.node, &w, self.dt);
        let l2: f64 = w[1..].iter().map(|&wj| wj * wj).sum();
        let l1: f64 = w[1..].iter().sum();
        let cost = -(ll - 0.5 * self.l2_penalty * l2 - self.l1_penalty * l1);
        if cost.is_finite() {
            Ok(cost)
        } else {
            Ok(1e300)
        }
    }
}

impl Gradient for NodeObjective<'_> {
    type Param = Vec<f64>;
    type Gradient = Vec<f64>;

    fn gradient(&self, x: &Self::Param) -> Result<Self::Gradient, argmin::core::Error> {
        let w = Self::weights(x);
        let mut grad = grad_ll_node(self.data, self.node, &w, self.dt);
        for (j, g) in grad.iter_mut().enumerate() {
            if j > 0 {
                *g -= self.l2_penalty * w[j] + self.l1_penalty;
            }
            *g *= -w[j];
            if !g.is_finite() {
                *g = 0.0;
            }
        }
        Ok(grad)
    }
}
