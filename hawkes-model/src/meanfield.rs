//! Mean-field variational inference and SVI for the mixture model.

use crate::model::{Dataset, NetworkHawkesMeanField};
use crate::parents::Parents;
use anyhow::ensure;
use ndarray::prelude::*;

pub trait MeanField {
    /// One sweep of exact coordinate updates. Returns the lower bound
    /// after the sweep.
    fn meanfield_coordinate_descent_step(&mut self) -> anyhow::Result<f64>;

    /// The variational lower bound at the current factors.
    fn get_vlb(&self) -> f64;

    /// Draw a point state from the variational posterior.
    fn resample_from_mf(&mut self) -> anyhow::Result<()>;
}

/// Robbins-Monro stepsize schedule, (t + delay) ^ -forgetting_rate.
pub fn svi_stepsize(iteration: usize, delay: f64, forgetting_rate: f64) -> f64 {
    (iteration as f64 + delay).powf(-forgetting_rate)
}

/// A drop beyond rounding noise; exact coordinate ascent never does this.
fn vlb_decreased(previous: f64, current: f64) -> bool {
    current < previous - 1e-8 * (1.0 + previous.abs())
}

impl MeanField for NetworkHawkesMeanField {
    fn meanfield_coordinate_descent_step(&mut self) -> anyhow::Result<f64> {
        // local factors first
        let e_log_lambda0 = self.bias.expected_log_lambda0();
        let e_log_w = self.weights.expected_log_w();
        let e_log_g = self.impulses.expected_log_g().clone();
        for ds in self.data.iter_mut() {
            let Dataset { s, f, parents, .. } = ds;
            parents.meanfield_update(&s.view(), &f.view(), &e_log_lambda0, &e_log_w, &e_log_g)?;
        }

        // conjugate globals from the expected attributions
        let mut ez0 = Array1::zeros(self.k);
        let mut ez_cube = Array3::zeros((self.k, self.k, self.b));
        let mut ez_edge = Array2::zeros((self.k, self.k));
        for ds in &self.data {
            ez0 += &ds.parents.ez0_sum();
            ez_cube += &ds.parents.ez_cube_sum();
            ez_edge += &ds.parents.ez_edge_sum();
        }

        self.bias.meanfield_update(&ez0, self.total_exposure());
        self.impulses.meanfield_update(&ez_cube);
        let n = self.total_events();
        self.weights.meanfield_update(&self.network, &n, &ez_edge);
        self.network.meanfield_update(
            self.weights.expected_a(),
            self.weights.expected_w_given_on(),
            self.weights.expected_log_w_given_on(),
        );

        let vlb = self.get_vlb();
        if let Some(prev) = self.last_vlb {
            if vlb_decreased(prev, vlb) {
                log::warn!("lower bound decreased from {:.6} to {:.6}", prev, vlb);
            }
        }
        self.last_vlb = Some(vlb);
        Ok(vlb)
    }

    fn get_vlb(&self) -> f64 {
        let mut total = self.bias.vlb()
            + self.impulses.vlb()
            + self.weights.vlb(&self.network)
            + self.network.vlb();

        let e_lambda0 = self.bias.expected_lambda0();
        let e_log_lambda0 = self.bias.expected_log_lambda0();
        let e_w = self.weights.expected_w();
        let e_log_w = self.weights.expected_log_w();
        let e_g = self.impulses.expected_g();
        let e_log_g = self.impulses.expected_log_g();
        for ds in &self.data {
            total += ds.parents.vlb(
                &ds.s.view(),
                &ds.f.view(),
                self.dt,
                &e_lambda0,
                &e_log_lambda0,
                &e_w,
                &e_log_w,
                e_g,
                e_log_g,
            );
        }
        total
    }

    fn resample_from_mf(&mut self) -> anyhow::Result<()> {
        self.bias.resample_from_mf(&mut self.rng)?;
        self.impulses.resample_from_mf(&mut self.rng)?;
        self.weights.resample_from_mf(&mut self.rng)?;
        self.network.resample_from_mf(&mut self.rng)?;
        Ok(())
    }
}

impl NetworkHawkesMeanField {
    /// One stochastic variational step on a contiguous minibatch of
    /// time bins. The cursor walks the dataset cyclically, restarting
    /// at zero when a minibatch would run past the end.
    pub fn sgd_step(&mut self, minibatchsize: usize, stepsize: f64) -> anyhow::Result<()> {
        ensure!(self.data.len() == 1, "SVI expects exactly one dataset");
        ensure!(minibatchsize > 0, "minibatch size must be positive");
        ensure!(
            (0.0..=1.0).contains(&stepsize),
            "stepsize must lie in [0, 1]"
        );
        let t_total = self.data[0].s.nrows();
        ensure!(t_total > 0, "empty dataset");

        let start = match self.sgd_cursor {
            None => 0,
            Some(cur) => {
                let next = cur + minibatchsize;
                if next >= t_total {
                    0
                } else {
                    next
                }
            }
        };
        self.sgd_cursor = Some(start);
        let end = (start + minibatchsize).min(t_total);
        let t_mb = end - start;
        let frac = t_mb as f64 / t_total as f64;

        // local update on the minibatch only; the features were
        // filtered on the full history, so excitation crossing the
        // minibatch boundary is still seen
        let e_log_lambda0 = self.bias.expected_log_lambda0();
        let e_log_w = self.weights.expected_log_w();
        let e_log_g = self.impulses.expected_log_g().clone();
        let s_mb = self.data[0].s.slice(s![start..end, ..]);
        let f_mb = self.data[0].f.slice(s![start..end, .., ..]);
        let mut parents = Parents::new(t_mb, self.k, self.b);
        parents.meanfield_update(&s_mb, &f_mb, &e_log_lambda0, &e_log_w, &e_log_g)?;

        let n_mb = s_mb.sum_axis(Axis(0));
        let exposure_mb = t_mb as f64 * self.dt;

        self.bias
            .meanfield_sgd_step(&parents.ez0_sum(), exposure_mb, frac, stepsize);
        self.impulses
            .meanfield_sgd_step(&parents.ez_cube_sum(), frac, stepsize);
        self.weights.meanfield_sgd_step(
            &self.network,
            &n_mb,
            &parents.ez_edge_sum(),
            frac,
            stepsize,
        );
        self.network.meanfield_sgd_step(
            self.weights.expected_a(),
            self.weights.expected_w_given_on(),
            self.weights.expected_log_w_given_on(),
            stepsize,
        );
        Ok(())
    }
}
