//! Stochastic block model prior over the excitation network.
//!
//! Nodes carry latent block assignments c[k]; every ordered block pair
//! (c1, c2) has a connection probability p[c1, c2] and a weight rate
//! v[c1, c2]. Edges and weights are drawn per ordered node pair:
//!
//!   A[k1, k2] ~ Bernoulli(p[c1, c2])
//!   W[k1, k2] | A = 1 ~ Gamma(kappa, v[c1, c2])
//!
//! Each of c, p, v can be pinned to a fixed value; the degenerate
//! single-block fixed-p fixed-v configuration is the dense network.

use crate::sample::sample_categorical_log;
use anyhow::{ensure, Context};
use hawkes_param::moments::{
    beta_ln_pdf, digamma, dirichlet_ln_pdf, dirichlet_vlb_term, gamma_ln_pdf, ln_gamma,
};
use hawkes_param::{BetaMatrix, GammaMatrix, PosteriorInference, TwoStatParam};
use ndarray::prelude::*;
use rand::Rng;
use rand_distr::{Beta as BetaDistr, Distribution, Gamma as GammaDistr};

/// Hyper parameters of the block model.
#[derive(Debug, Clone, Copy)]
pub struct NetworkPriors {
    /// Dirichlet concentration over block probabilities m
    pub pi: f64,
    /// Beta prior over connection probabilities p
    pub tau1: f64,
    pub tau0: f64,
    /// Gamma prior over weight rates v
    pub alpha: f64,
    pub beta: f64,
}

impl Default for NetworkPriors {
    fn default() -> Self {
        Self {
            pi: 1.0,
            tau1: 1.0,
            tau0: 1.0,
            alpha: 1.0,
            beta: 1.0,
        }
    }
}

pub struct StochasticBlockModel {
    k: usize,
    c: usize,
    /// shape of the weight prior, shared with the weight models
    kappa: f64,
    priors: NetworkPriors,
    allow_self: bool,
    fixed_c: bool,
    fixed_p: bool,
    fixed_v: bool,
    // point state
    pub assignments: Vec<usize>,
    pub p: Array2<f64>,
    pub v: Array2<f64>,
    pub m: Array1<f64>,
    // variational factors
    mf_pi: Array2<f64>,
    mf_p: BetaMatrix,
    mf_v: GammaMatrix,
    mf_m: Array1<f64>,
}

impl StochasticBlockModel {
    #[allow(clippy::too_many_arguments)]
    pub fn new<R: Rng>(
        k: usize,
        c: usize,
        kappa: f64,
        priors: NetworkPriors,
        fixed_c: Option<Vec<usize>>,
        fixed_p: Option<f64>,
        fixed_v: Option<f64>,
        allow_self: bool,
        rng: &mut R,
    ) -> anyhow::Result<Self> {
        ensure!(k > 0 && c > 0, "need at least one node and one block");
        ensure!(kappa > 0.0, "weight shape must be positive");
        if let Some(ref cs) = fixed_c {
            ensure!(cs.len() == k, "need one block assignment per node");
            ensure!(cs.iter().all(|&x| x < c), "block assignment out of range");
        }
        if let Some(p0) = fixed_p {
            ensure!((0.0..=1.0).contains(&p0), "fixed p must lie in [0, 1]");
        }
        if let Some(v0) = fixed_v {
            ensure!(v0 > 0.0, "fixed v must be positive");
        }

        let m = if c == 1 {
            array![1.0]
        } else {
            sample_dirichlet(&Array1::from_elem(c, priors.pi), rng)?
        };

        let assignments = match fixed_c {
            Some(ref cs) => cs.clone(),
            None => {
                let log_m: Vec<f64> = m.iter().map(|&x| x.ln()).collect();
                (0..k)
                    .map(|_| sample_categorical_log(&log_m, rng))
                    .collect::<anyhow::Result<Vec<usize>>>()?
            }
        };

        let p = match fixed_p {
            Some(p0) => Array2::from_elem((c, c), p0),
            None => {
                let distr =
                    BetaDistr::new(priors.tau1, priors.tau0).context("invalid edge prior")?;
                Array2::from_shape_fn((c, c), |_| distr.sample(rng))
            }
        };

        let v = match fixed_v {
            Some(v0) => Array2::from_elem((c, c), v0),
            None => {
                let distr = GammaDistr::new(priors.alpha, 1.0 / priors.beta)
                    .context("invalid weight rate prior")?;
                Array2::from_shape_fn((c, c), |_| distr.sample(rng))
            }
        };

        let mf_pi = match fixed_c {
            Some(ref cs) => {
                let mut pi = Array2::zeros((k, c));
                for (node, &block) in cs.iter().enumerate() {
                    pi[[node, block]] = 1.0;
                }
                pi
            }
            None => Array2::from_elem((k, c), 1.0 / c as f64),
        };

        Ok(Self {
            k,
            c,
            kappa,
            priors,
            allow_self,
            fixed_c: fixed_c.is_some(),
            fixed_p: fixed_p.is_some(),
            fixed_v: fixed_v.is_some(),
            assignments,
            p,
            v,
            m,
            mf_pi,
            mf_p: BetaMatrix::new((c, c), priors.tau1, priors.tau0),
            mf_v: GammaMatrix::new((c, c), priors.alpha, priors.beta),
            mf_m: Array1::from_elem(c, priors.pi),
        })
    }

    pub fn num_blocks(&self) -> usize {
        self.c
    }

    pub fn allow_self_connections(&self) -> bool {
        self.allow_self
    }

    /// Edge connection probability at the current point state.
    pub fn p_edge(&self, k1: usize, k2: usize) -> f64 {
        if !self.allow_self && k1 == k2 {
            return 0.0;
        }
        self.p[[self.assignments[k1], self.assignments[k2]]]
    }

    /// Edge weight rate at the current point state.
    pub fn v_edge(&self, k1: usize, k2: usize) -> f64 {
        self.v[[self.assignments[k1], self.assignments[k2]]]
    }

    fn pair_counts(&self, a: &Array2<f64>, w: &Array2<f64>) -> PairStats {
        let c = self.c;
        let mut stats = PairStats {
            pairs: Array2::zeros((c, c)),
            edges: Array2::zeros((c, c)),
            weight: Array2::zeros((c, c)),
        };
        for k1 in 0..self.k {
            for k2 in 0..self.k {
                if !self.allow_self && k1 == k2 {
                    continue;
                }
                let (c1, c2) = (self.assignments[k1], self.assignments[k2]);
                stats.pairs[[c1, c2]] += 1.0;
                if a[[k1, k2]] > 0.5 {
                    stats.edges[[c1, c2]] += 1.0;
                    stats.weight[[c1, c2]] += w[[k1, k2]];
                }
            }
        }
        stats
    }

    /// Gibbs sweep over p, v, m, and the block assignments, conditioned
    /// on the current adjacency and weight matrices.
    pub fn resample<R: Rng>(
        &mut self,
        rng: &mut R,
        a: &Array2<f64>,
        w: &Array2<f64>,
    ) -> anyhow::Result<()> {
        let stats = self.pair_counts(a, w);

        if !self.fixed_p {
            for c1 in 0..self.c {
                for c2 in 0..self.c {
                    let on = self.priors.tau1 + stats.edges[[c1, c2]];
                    let off =
                        self.priors.tau0 + stats.pairs[[c1, c2]] - stats.edges[[c1, c2]];
                    self.p[[c1, c2]] = BetaDistr::new(on, off)
                        .context("invalid edge posterior")?
                        .sample(rng);
                }
            }
        }

        if !self.fixed_v {
            for c1 in 0..self.c {
                for c2 in 0..self.c {
                    let shape = self.priors.alpha + self.kappa * stats.edges[[c1, c2]];
                    let rate = self.priors.beta + stats.weight[[c1, c2]];
                    self.v[[c1, c2]] = GammaDistr::new(shape, 1.0 / rate)
                        .context("invalid weight rate posterior")?
                        .sample(rng);
                }
            }
        }

        let mut counts = Array1::from_elem(self.c, self.priors.pi);
        for &block in &self.assignments {
            counts[block] += 1.0;
        }
        self.m = sample_dirichlet(&counts, rng)?;

        if !self.fixed_c && self.c > 1 {
            self.resample_assignments(rng, a, w)?;
        }
        Ok(())
    }

    fn edge_term(&self, a: f64, w: f64, p: f64, v: f64) -> f64 {
        if a > 0.5 {
            p.ln() + self.kappa * v.ln() - ln_gamma(self.kappa) + (self.kappa - 1.0) * w.ln()
                - v * w
        } else {
            (1.0 - p).ln()
        }
    }

    fn resample_assignments<R: Rng>(
        &mut self,
        rng: &mut R,
        a: &Array2<f64>,
        w: &Array2<f64>,
    ) -> anyhow::Result<()> {
        let mut scores = vec![0.0; self.c];
        for node in 0..self.k {
            for (c1, score) in scores.iter_mut().enumerate() {
                let mut acc = self.m[c1].ln();
                for other in 0..self.k {
                    if other == node {
                        continue;
                    }
                    let c2 = self.assignments[other];
                    acc += self.edge_term(
                        a[[node, other]],
                        w[[node, other]],
                        self.p[[c1, c2]],
                        self.v[[c1, c2]],
                    );
                    acc += self.edge_term(
                        a[[other, node]],
                        w[[other, node]],
                        self.p[[c2, c1]],
                        self.v[[c2, c1]],
                    );
                }
                if self.allow_self {
                    acc += self.edge_term(
                        a[[node, node]],
                        w[[node, node]],
                        self.p[[c1, c1]],
                        self.v[[c1, c1]],
                    );
                }
                *score = acc;
            }
            self.assignments[node] = sample_categorical_log(&scores, rng)?;
        }
        Ok(())
    }

    /// Prior log density of the point state (m, c, p, v). Fixed
    /// components contribute nothing.
    pub fn log_probability(&self) -> f64 {
        let mut total = 0.0;
        if self.c > 1 {
            total += dirichlet_ln_pdf(self.priors.pi, &self.m.to_vec());
        }
        for &block in &self.assignments {
            total += self.m[block].ln();
        }
        if !self.fixed_p {
            for &p in &self.p {
                total += beta_ln_pdf(self.priors.tau1, self.priors.tau0, p);
            }
        }
        if !self.fixed_v {
            for &v in &self.v {
                total += gamma_ln_pdf(self.priors.alpha, self.priors.beta, v);
            }
        }
        total
    }

    // ------------------------------------------------------------------
    // mean field
    // ------------------------------------------------------------------

    fn block_e_log_p(&self) -> Array2<f64> {
        if self.fixed_p {
            self.p.mapv(f64::ln)
        } else {
            self.mf_p.posterior_log_mean().clone()
        }
    }

    fn block_e_log_1m_p(&self) -> Array2<f64> {
        if self.fixed_p {
            self.p.mapv(|p| (1.0 - p).ln())
        } else {
            self.mf_p.posterior_log_1m_mean().clone()
        }
    }

    fn block_e_v(&self) -> Array2<f64> {
        if self.fixed_v {
            self.v.clone()
        } else {
            self.mf_v.posterior_mean().clone()
        }
    }

    fn block_e_log_v(&self) -> Array2<f64> {
        if self.fixed_v {
            self.v.mapv(f64::ln)
        } else {
            self.mf_v.posterior_log_mean().clone()
        }
    }

    fn contract(&self, block_mat: &Array2<f64>) -> Array2<f64> {
        // edge[k1,k2] = sum_{c1,c2} pi[k1,c1] pi[k2,c2] block[c1,c2]
        let tmp = self.mf_pi.dot(block_mat);
        tmp.dot(&self.mf_pi.t())
    }

    pub fn expected_p_edge(&self) -> Array2<f64> {
        let block = if self.fixed_p {
            self.p.clone()
        } else {
            self.mf_p.posterior_mean().clone()
        };
        let mut out = self.contract(&block);
        if !self.allow_self {
            out.diag_mut().fill(0.0);
        }
        out
    }

    pub fn expected_log_p_edge(&self) -> Array2<f64> {
        self.contract(&self.block_e_log_p())
    }

    pub fn expected_log_1m_p_edge(&self) -> Array2<f64> {
        self.contract(&self.block_e_log_1m_p())
    }

    /// E[logit p] per ordered node pair under q(c).
    pub fn expected_logit_p_edge(&self) -> Array2<f64> {
        self.contract(&(&self.block_e_log_p() - &self.block_e_log_1m_p()))
    }

    pub fn expected_v_edge(&self) -> Array2<f64> {
        self.contract(&self.block_e_v())
    }

    pub fn expected_log_v_edge(&self) -> Array2<f64> {
        self.contract(&self.block_e_log_v())
    }

    fn e_log_m(&self) -> Array1<f64> {
        let dg_total = digamma(self.mf_m.sum());
        self.mf_m.mapv(|x| digamma(x) - dg_total)
    }

    fn block_pair_stats(&self, rho: &Array2<f64>, e_w_on: &Array2<f64>) -> PairStats {
        let c = self.c;
        let mut stats = PairStats {
            pairs: Array2::zeros((c, c)),
            edges: Array2::zeros((c, c)),
            weight: Array2::zeros((c, c)),
        };
        for k1 in 0..self.k {
            for k2 in 0..self.k {
                if !self.allow_self && k1 == k2 {
                    continue;
                }
                let r = rho[[k1, k2]];
                let rw = r * e_w_on[[k1, k2]];
                for c1 in 0..c {
                    let p1 = self.mf_pi[[k1, c1]];
                    if p1 == 0.0 {
                        continue;
                    }
                    for c2 in 0..c {
                        let q = p1 * self.mf_pi[[k2, c2]];
                        stats.pairs[[c1, c2]] += q;
                        stats.edges[[c1, c2]] += q * r;
                        stats.weight[[c1, c2]] += q * rw;
                    }
                }
            }
        }
        stats
    }

    /// Coordinate updates for q(p), q(v), q(m) and q(c), in that order.
    ///
    /// `rho` is q(A=1) per ordered pair, `e_w_on` and `e_log_w_on` are
    /// the slab moments E[W | A=1] and E[ln W | A=1].
    pub fn meanfield_update(
        &mut self,
        rho: &Array2<f64>,
        e_w_on: &Array2<f64>,
        e_log_w_on: &Array2<f64>,
    ) {
        let stats = self.block_pair_stats(rho, e_w_on);
        self.apply_global_updates(&stats, None);
        if !self.fixed_c && self.c > 1 {
            self.update_assignment_factor(rho, e_w_on, e_log_w_on, None);
        }
    }

    pub fn meanfield_sgd_step(
        &mut self,
        rho: &Array2<f64>,
        e_w_on: &Array2<f64>,
        e_log_w_on: &Array2<f64>,
        stepsize: f64,
    ) {
        // the network sees only global statistics, so the minibatch
        // fraction never rescales them; only the stepsize blend applies
        let stats = self.block_pair_stats(rho, e_w_on);
        self.apply_global_updates(&stats, Some(stepsize));
        if !self.fixed_c && self.c > 1 {
            self.update_assignment_factor(rho, e_w_on, e_log_w_on, Some(stepsize));
        }
    }

    fn apply_global_updates(&mut self, stats: &PairStats, stepsize: Option<f64>) {
        if !self.fixed_p {
            let on = stats.edges.clone();
            let off = &stats.pairs - &stats.edges;
            match stepsize {
                None => self.mf_p.update_stat(&on, &off),
                Some(s) => self.mf_p.stochastic_update(&on, &off, 1.0, s),
            }
            self.mf_p.calibrate();
        }
        if !self.fixed_v {
            let shape = stats.edges.mapv(|x| self.kappa * x);
            match stepsize {
                None => self.mf_v.update_stat(&shape, &stats.weight),
                Some(s) => self.mf_v.stochastic_update(&shape, &stats.weight, 1.0, s),
            }
            self.mf_v.calibrate();
        }

        let counts = self.mf_pi.sum_axis(Axis(0));
        let target = counts.mapv(|x| self.priors.pi + x);
        match stepsize {
            None => self.mf_m = target,
            Some(s) => self.mf_m = (1.0 - s) * &self.mf_m + s * &target,
        }
    }

    fn update_assignment_factor(
        &mut self,
        rho: &Array2<f64>,
        e_w_on: &Array2<f64>,
        e_log_w_on: &Array2<f64>,
        stepsize: Option<f64>,
    ) {
        let e_log_m = self.e_log_m();
        let e_log_p = self.block_e_log_p();
        let e_log_1m_p = self.block_e_log_1m_p();
        let e_v = self.block_e_v();
        let e_log_v = self.block_e_log_v();
        let kappa = self.kappa;

        let pair_term = move |k1: usize, k2: usize, c1: usize, c2: usize| -> f64 {
            let r = rho[[k1, k2]];
            let mut acc = zero_guard(r, e_log_p[[c1, c2]])
                + zero_guard(1.0 - r, e_log_1m_p[[c1, c2]]);
            acc += zero_guard(
                r,
                kappa * e_log_v[[c1, c2]] - ln_gamma(kappa)
                    + (kappa - 1.0) * e_log_w_on[[k1, k2]]
                    - e_v[[c1, c2]] * e_w_on[[k1, k2]],
            );
            acc
        };

        let mut scores = vec![0.0; self.c];
        for node in 0..self.k {
            for (c1, score) in scores.iter_mut().enumerate() {
                let mut acc = e_log_m[c1];
                for other in 0..self.k {
                    if other == node {
                        continue;
                    }
                    for c2 in 0..self.c {
                        let q = self.mf_pi[[other, c2]];
                        if q == 0.0 {
                            continue;
                        }
                        acc += q * (pair_term(node, other, c1, c2)
                            + pair_term(other, node, c2, c1));
                    }
                }
                if self.allow_self {
                    acc += pair_term(node, node, c1, c1);
                }
                *score = acc;
            }
            let target = softmax(&scores);
            match stepsize {
                None => {
                    for c1 in 0..self.c {
                        self.mf_pi[[node, c1]] = target[c1];
                    }
                }
                Some(s) => {
                    // blend in the natural (log) parameterization
                    let blended: Vec<f64> = (0..self.c)
                        .map(|c1| {
                            (1.0 - s) * self.mf_pi[[node, c1]].max(1e-300).ln()
                                + s * target[c1].max(1e-300).ln()
                        })
                        .collect();
                    let renorm = softmax(&blended);
                    for c1 in 0..self.c {
                        self.mf_pi[[node, c1]] = renorm[c1];
                    }
                }
            }
        }
    }

    /// Variational lower-bound contribution of the network factors.
    pub fn vlb(&self) -> f64 {
        let mut total = 0.0;
        if !self.fixed_p {
            total += self.mf_p.vlb();
        }
        if !self.fixed_v {
            total += self.mf_v.vlb();
        }
        if self.c > 1 {
            total += dirichlet_vlb_term(self.priors.pi, &self.mf_m.to_vec());
        }
        let e_log_m = self.e_log_m();
        for node in 0..self.k {
            for c1 in 0..self.c {
                let q = self.mf_pi[[node, c1]];
                if q > 0.0 {
                    total += q * (e_log_m[c1] - if self.fixed_c { 0.0 } else { q.ln() });
                }
            }
        }
        total
    }

    pub fn resample_from_mf<R: Rng>(&mut self, rng: &mut R) -> anyhow::Result<()> {
        self.m = sample_dirichlet(&self.mf_m, rng)?;
        if !self.fixed_c {
            for node in 0..self.k {
                let lw: Vec<f64> = (0..self.c)
                    .map(|c1| self.mf_pi[[node, c1]].max(1e-300).ln())
                    .collect();
                self.assignments[node] = sample_categorical_log(&lw, rng)?;
            }
        }
        if !self.fixed_p {
            self.p = self.mf_p.posterior_sample(rng)?;
        }
        if !self.fixed_v {
            self.v = self.mf_v.posterior_sample(rng)?;
        }
        Ok(())
    }
}

struct PairStats {
    pairs: Array2<f64>,
    edges: Array2<f64>,
    weight: Array2<f64>,
}

fn zero_guard(weight: f64, x: f64) -> f64 {
    if weight == 0.0 {
        0.0
    } else {
        weight * x
    }
}

fn softmax(scores: &[f64]) -> Vec<f64> {
    let max = scores.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let exps: Vec<f64> = scores.iter().map(|&x| (x - max).exp()).collect();
    let total: f64 = exps.iter().sum();
    exps.into_iter().map(|x| x / total).collect()
}

fn sample_dirichlet<R: Rng>(conc: &Array1<f64>, rng: &mut R) -> anyhow::Result<Array1<f64>> {
    let mut out = Array1::zeros(conc.len());
    let mut total = 0.0;
    for (x, &a) in out.iter_mut().zip(conc.iter()) {
        ensure!(a > 0.0, "dirichlet concentration must be positive");
        let g: f64 = GammaDistr::new(a, 1.0)?.sample(rng);
        *x = g;
        total += g;
    }
    ensure!(total > 0.0, "degenerate dirichlet sample");
    Ok(out / total)
}
