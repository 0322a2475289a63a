//! Weight models over the excitation network.
//!
//! Two conjugate treatments of the pair (A, W):
//!
//! * [`SpikeAndSlabWeights`] keeps A binary and integrates W out of the
//!   edge odds, for collapsed Gibbs sampling.
//! * [`GammaMixtureWeights`] relaxes the spike to a gamma with small
//!   mean, so W is always positive and the rate never needs the hard
//!   indicator. Used by mean field and SVI.

use crate::network::StochasticBlockModel;
use anyhow::{bail, ensure, Context};
use hawkes_param::moments::{digamma, gamma_ln_pdf, ln_gamma};
use hawkes_param::{GammaMatrix, PosteriorInference, TwoStatParam};
use ndarray::prelude::*;
use rand::Rng;
use rand_distr::{Distribution, Gamma as GammaDistr};

/// The point-state surface every weight model exposes to the rate and
/// likelihood computations.
pub trait WeightModel {
    fn adjacency(&self) -> &Array2<f64>;

    fn weight_matrix(&self) -> &Array2<f64>;

    /// The matrix that multiplies the filtered features in the rate.
    fn effective(&self) -> Array2<f64>;

    fn set_state(&mut self, a: Array2<f64>, w: Array2<f64>) -> anyhow::Result<()>;

    /// Prior log density of the point state given the network.
    fn log_prior(&self, network: &StochasticBlockModel) -> f64;
}

/// Marginal evidence of m attributed counts on an edge with exposure n,
/// after integrating the gamma weight out.
fn poisson_gamma_score(kappa: f64, v: f64, m: f64, n: f64) -> f64 {
    kappa * v.ln() - ln_gamma(kappa) + ln_gamma(kappa + m) - (kappa + m) * (v + n).ln()
}

fn zero_guard(weight: f64, x: f64) -> f64 {
    if weight == 0.0 {
        0.0
    } else {
        weight * x
    }
}

// ----------------------------------------------------------------------
// collapsed spike and slab, for Gibbs
// ----------------------------------------------------------------------

pub struct SpikeAndSlabWeights {
    k: usize,
    kappa: f64,
    allow_self: bool,
    /// binary adjacency, stored as 0.0 / 1.0
    pub a: Array2<f64>,
    pub w: Array2<f64>,
}

impl SpikeAndSlabWeights {
    pub fn new<R: Rng>(
        k: usize,
        kappa: f64,
        network: &StochasticBlockModel,
        allow_self: bool,
        rng: &mut R,
    ) -> anyhow::Result<Self> {
        let mut a = Array2::zeros((k, k));
        let mut w = Array2::zeros((k, k));
        for k1 in 0..k {
            for k2 in 0..k {
                let p = network.p_edge(k1, k2);
                let v = network.v_edge(k1, k2);
                a[[k1, k2]] = f64::from(rng.random::<f64>() < p);
                w[[k1, k2]] = GammaDistr::new(kappa, 1.0 / v)
                    .context("invalid weight prior")?
                    .sample(rng);
            }
        }
        Ok(Self {
            k,
            kappa,
            allow_self,
            a,
            w,
        })
    }

    /// Collapsed Gibbs update of every edge.
    ///
    /// `n_events[k1]` is the total event count of the source node and
    /// `z_edge[k1, k2]` the count attributed to the edge by the parent
    /// variables. An edge with attributed counts cannot turn off.
    pub fn resample<R: Rng>(
        &mut self,
        rng: &mut R,
        network: &StochasticBlockModel,
        n_events: &Array1<f64>,
        z_edge: &Array2<f64>,
    ) -> anyhow::Result<()> {
        for k1 in 0..self.k {
            for k2 in 0..self.k {
                let p = network.p_edge(k1, k2);
                let v = network.v_edge(k1, k2);
                let m = z_edge[[k1, k2]];
                let n = n_events[k1];

                if p <= 0.0 {
                    ensure!(
                        m == 0.0,
                        "counts attributed to the impossible edge ({},{})",
                        k1,
                        k2
                    );
                    self.a[[k1, k2]] = 0.0;
                    self.w[[k1, k2]] = 0.0;
                    continue;
                }

                let log_on = p.ln() + poisson_gamma_score(self.kappa, v, m, n);
                let log_off = if m > 0.0 {
                    f64::NEG_INFINITY
                } else {
                    (1.0 - p).ln()
                };

                let on = if log_off == f64::NEG_INFINITY {
                    true
                } else {
                    let p_on = 1.0 / (1.0 + (log_off - log_on).exp());
                    rng.random::<f64>() < p_on
                };

                self.a[[k1, k2]] = f64::from(on);
                self.w[[k1, k2]] = if on {
                    GammaDistr::new(self.kappa + m, 1.0 / (v + n))
                        .context("invalid weight posterior")?
                        .sample(rng)
                } else {
                    // off edges carry a fresh prior draw
                    GammaDistr::new(self.kappa, 1.0 / v)
                        .context("invalid weight prior")?
                        .sample(rng)
                };
            }
        }
        Ok(())
    }
}

impl WeightModel for SpikeAndSlabWeights {
    fn adjacency(&self) -> &Array2<f64> {
        &self.a
    }

    fn weight_matrix(&self) -> &Array2<f64> {
        &self.w
    }

    fn effective(&self) -> Array2<f64> {
        &self.a * &self.w
    }

    fn set_state(&mut self, a: Array2<f64>, w: Array2<f64>) -> anyhow::Result<()> {
        validate_state(self.k, &a, &w, !self.allow_self)?;
        self.a = a;
        self.w = w;
        Ok(())
    }

    fn log_prior(&self, network: &StochasticBlockModel) -> f64 {
        let mut total = 0.0;
        for k1 in 0..self.k {
            for k2 in 0..self.k {
                if !self.allow_self && k1 == k2 {
                    continue;
                }
                let p = network.p_edge(k1, k2);
                let v = network.v_edge(k1, k2);
                if self.a[[k1, k2]] > 0.5 {
                    total += p.ln() + gamma_ln_pdf(self.kappa, v, self.w[[k1, k2]]);
                } else {
                    total += (1.0 - p).ln();
                }
            }
        }
        total
    }
}

// ----------------------------------------------------------------------
// gamma mixture, for mean field
// ----------------------------------------------------------------------

pub struct GammaMixtureWeights {
    k: usize,
    kappa: f64,
    kappa0: f64,
    nu0: f64,
    allow_self: bool,
    /// point state sampled from the variational posterior
    pub a: Array2<f64>,
    pub w: Array2<f64>,
    /// q(A[k1,k2] = 1)
    rho: Array2<f64>,
    /// q(W | A = 1); the prior rate enters through the statistics
    slab: GammaMatrix,
    /// q(W | A = 0)
    spike: GammaMatrix,
}

impl GammaMixtureWeights {
    pub fn new<R: Rng>(
        k: usize,
        kappa: f64,
        kappa0: f64,
        nu0: f64,
        network: &StochasticBlockModel,
        allow_self: bool,
        rng: &mut R,
    ) -> anyhow::Result<Self> {
        ensure!(kappa0 > 0.0 && nu0 > 0.0, "spike hypers must be positive");
        let mut a = Array2::zeros((k, k));
        let mut w = Array2::zeros((k, k));
        for k1 in 0..k {
            for k2 in 0..k {
                let p = network.p_edge(k1, k2);
                let on = rng.random::<f64>() < p;
                a[[k1, k2]] = f64::from(on);
                let (shape, rate) = if on {
                    (kappa, network.v_edge(k1, k2))
                } else {
                    (kappa0, nu0)
                };
                w[[k1, k2]] = GammaDistr::new(shape, 1.0 / rate)
                    .context("invalid weight prior")?
                    .sample(rng);
            }
        }

        let mut ret = Self {
            k,
            kappa,
            kappa0,
            nu0,
            allow_self,
            a,
            w,
            rho: Array2::zeros((k, k)),
            // rate statistics carry the edge-dependent prior rate E[v]
            slab: GammaMatrix::new((k, k), kappa, 0.0),
            spike: GammaMatrix::new((k, k), kappa0, nu0),
        };
        // initialize the factors at the prior
        ret.meanfield_update(network, &Array1::zeros(k), &Array2::zeros((k, k)));
        Ok(ret)
    }

    fn exposure_matrix(&self, n_events: &Array1<f64>) -> Array2<f64> {
        Array2::from_shape_fn((self.k, self.k), |(k1, _)| n_events[k1])
    }

    fn update_rho(&mut self, network: &StochasticBlockModel, stepsize: Option<f64>) {
        let logit_p = network.expected_logit_p_edge();
        let e_log_v = network.expected_log_v_edge();
        for k1 in 0..self.k {
            for k2 in 0..self.k {
                if !self.allow_self && k1 == k2 {
                    self.rho[[k1, k2]] = 0.0;
                    continue;
                }
                let a1 = self.slab.shape_stat()[[k1, k2]];
                let b1 = self.slab.rate_stat()[[k1, k2]];
                let a0 = self.spike.shape_stat()[[k1, k2]];
                let b0 = self.spike.rate_stat()[[k1, k2]];
                // difference of marginal log normalizers under each component
                let slab_score = self.kappa * e_log_v[[k1, k2]] - ln_gamma(self.kappa)
                    + ln_gamma(a1)
                    - a1 * b1.ln();
                let spike_score = self.kappa0 * self.nu0.ln() - ln_gamma(self.kappa0)
                    + ln_gamma(a0)
                    - a0 * b0.ln();
                let mut logit = logit_p[[k1, k2]] + slab_score - spike_score;
                if let Some(s) = stepsize {
                    let old = self.rho[[k1, k2]].clamp(1e-300, 1.0 - 1e-15);
                    logit = (1.0 - s) * (old / (1.0 - old)).ln() + s * logit;
                }
                self.rho[[k1, k2]] = 1.0 / (1.0 + (-logit).exp());
            }
        }
    }

    /// Coordinate updates for q(W | A) and q(A).
    ///
    /// `ez_edge[k1, k2]` is the expected count attributed to the edge
    /// and `n_events[k1]` the source exposure.
    pub fn meanfield_update(
        &mut self,
        network: &StochasticBlockModel,
        n_events: &Array1<f64>,
        ez_edge: &Array2<f64>,
    ) {
        let n_mat = self.exposure_matrix(n_events);
        let e_v = network.expected_v_edge();
        self.slab.update_stat(ez_edge, &(&e_v + &n_mat));
        self.slab.calibrate();
        self.spike.update_stat(ez_edge, &n_mat);
        self.spike.calibrate();
        self.update_rho(network, None);
    }

    pub fn meanfield_sgd_step(
        &mut self,
        network: &StochasticBlockModel,
        n_events: &Array1<f64>,
        ez_edge: &Array2<f64>,
        minibatchfrac: f64,
        stepsize: f64,
    ) {
        let n_mat = self.exposure_matrix(n_events);
        let e_v = network.expected_v_edge();
        // the prior-rate part of the slab statistic must not be rescaled
        // by the minibatch fraction, so pre-multiply it back
        let slab_rate = e_v.mapv(|x| x * minibatchfrac) + &n_mat;
        self.slab
            .stochastic_update(ez_edge, &slab_rate, minibatchfrac, stepsize);
        self.slab.calibrate();
        self.spike
            .stochastic_update(ez_edge, &n_mat, minibatchfrac, stepsize);
        self.spike.calibrate();
        self.update_rho(network, Some(stepsize));
    }

    pub fn expected_a(&self) -> &Array2<f64> {
        &self.rho
    }

    /// E[W] under the mixture.
    pub fn expected_w(&self) -> Array2<f64> {
        let mut out = Array2::zeros((self.k, self.k));
        let slab_mean = self.slab.posterior_mean();
        let spike_mean = self.spike.posterior_mean();
        for ((k1, k2), x) in out.indexed_iter_mut() {
            let r = self.rho[[k1, k2]];
            *x = zero_guard(r, slab_mean[[k1, k2]])
                + zero_guard(1.0 - r, spike_mean[[k1, k2]]);
        }
        out
    }

    /// E[ln W] under the mixture.
    pub fn expected_log_w(&self) -> Array2<f64> {
        let mut out = Array2::zeros((self.k, self.k));
        let slab_lm = self.slab.posterior_log_mean();
        let spike_lm = self.spike.posterior_log_mean();
        for ((k1, k2), x) in out.indexed_iter_mut() {
            let r = self.rho[[k1, k2]];
            *x = zero_guard(r, slab_lm[[k1, k2]]) + zero_guard(1.0 - r, spike_lm[[k1, k2]]);
        }
        out
    }

    /// E[W | A = 1], the slab posterior mean.
    pub fn expected_w_given_on(&self) -> &Array2<f64> {
        self.slab.posterior_mean()
    }

    pub fn expected_log_w_given_on(&self) -> &Array2<f64> {
        self.slab.posterior_log_mean()
    }

    /// Variational lower-bound contribution of q(A) and q(W | A).
    pub fn vlb(&self, network: &StochasticBlockModel) -> f64 {
        let e_log_p = network.expected_log_p_edge();
        let e_log_1m_p = network.expected_log_1m_p_edge();
        let e_v = network.expected_v_edge();
        let e_log_v = network.expected_log_v_edge();

        let mut total = 0.0;
        for k1 in 0..self.k {
            for k2 in 0..self.k {
                if !self.allow_self && k1 == k2 {
                    continue;
                }
                let r = self.rho[[k1, k2]];

                // Bernoulli factor
                total += zero_guard(r, e_log_p[[k1, k2]])
                    + zero_guard(1.0 - r, e_log_1m_p[[k1, k2]])
                    - zero_guard(r, r.ln())
                    - zero_guard(1.0 - r, (1.0 - r).ln());

                // slab branch
                let a1 = self.slab.shape_stat()[[k1, k2]];
                let b1 = self.slab.rate_stat()[[k1, k2]];
                let e_ln_w1 = digamma(a1) - b1.ln();
                let e_w1 = a1 / b1;
                let prior1 = self.kappa * e_log_v[[k1, k2]] - ln_gamma(self.kappa)
                    + (self.kappa - 1.0) * e_ln_w1
                    - e_v[[k1, k2]] * e_w1;
                let entropy1 = a1 * b1.ln() - ln_gamma(a1) + (a1 - 1.0) * e_ln_w1 - a1;
                total += zero_guard(r, prior1 - entropy1);

                // spike branch
                let a0 = self.spike.shape_stat()[[k1, k2]];
                let b0 = self.spike.rate_stat()[[k1, k2]];
                let e_ln_w0 = digamma(a0) - b0.ln();
                let e_w0 = a0 / b0;
                let prior0 = self.kappa0 * self.nu0.ln() - ln_gamma(self.kappa0)
                    + (self.kappa0 - 1.0) * e_ln_w0
                    - self.nu0 * e_w0;
                let entropy0 = a0 * b0.ln() - ln_gamma(a0) + (a0 - 1.0) * e_ln_w0 - a0;
                total += zero_guard(1.0 - r, prior0 - entropy0);
            }
        }
        total
    }

    pub fn resample_from_mf<R: Rng>(&mut self, rng: &mut R) -> anyhow::Result<()> {
        for k1 in 0..self.k {
            for k2 in 0..self.k {
                let on = rng.random::<f64>() < self.rho[[k1, k2]];
                self.a[[k1, k2]] = f64::from(on);
                let (gm, idx) = if on {
                    (&self.slab, [k1, k2])
                } else {
                    (&self.spike, [k1, k2])
                };
                let shape = gm.shape_stat()[idx];
                let rate = gm.rate_stat()[idx];
                self.w[[k1, k2]] = GammaDistr::new(shape, 1.0 / rate)
                    .context("invalid weight factor")?
                    .sample(rng);
            }
        }
        Ok(())
    }
}

impl WeightModel for GammaMixtureWeights {
    fn adjacency(&self) -> &Array2<f64> {
        &self.a
    }

    fn weight_matrix(&self) -> &Array2<f64> {
        &self.w
    }

    /// The mixture rate uses W directly; A only indexes the component.
    fn effective(&self) -> Array2<f64> {
        self.w.clone()
    }

    fn set_state(&mut self, a: Array2<f64>, w: Array2<f64>) -> anyhow::Result<()> {
        validate_state(self.k, &a, &w, !self.allow_self)?;
        self.a = a;
        self.w = w;
        Ok(())
    }

    fn log_prior(&self, network: &StochasticBlockModel) -> f64 {
        let mut total = 0.0;
        for k1 in 0..self.k {
            for k2 in 0..self.k {
                if !self.allow_self && k1 == k2 {
                    continue;
                }
                let p = network.p_edge(k1, k2);
                let w = self.w[[k1, k2]];
                if self.a[[k1, k2]] > 0.5 {
                    total += p.ln() + gamma_ln_pdf(self.kappa, network.v_edge(k1, k2), w);
                } else {
                    total += (1.0 - p).ln() + gamma_ln_pdf(self.kappa0, self.nu0, w);
                }
            }
        }
        total
    }
}

fn validate_state(
    k: usize,
    a: &Array2<f64>,
    w: &Array2<f64>,
    require_zero_diag: bool,
) -> anyhow::Result<()> {
    ensure!(a.dim() == (k, k), "adjacency must be {} x {}", k, k);
    ensure!(w.dim() == (k, k), "weights must be {} x {}", k, k);
    for &x in a {
        if x != 0.0 && x != 1.0 {
            bail!("adjacency entries must be 0 or 1");
        }
    }
    ensure!(w.iter().all(|&x| x >= 0.0), "weights must be non-negative");
    if require_zero_diag {
        ensure!(
            a.diag().iter().all(|&x| x == 0.0),
            "self connections are disabled"
        );
    }
    Ok(())
}
