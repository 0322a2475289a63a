//! Raised-cosine impulse-response basis.
//!
//! The basis is an L x B matrix: L time lags (bins 1..=L after an event)
//! by B bumps. Each column is normalized so that its time integral is
//! one, which makes the total excitation contributed by one event on
//! edge (k, k') equal to the edge weight W[k, k'].

use anyhow::ensure;
use ndarray::prelude::*;
use std::f64::consts::PI;

#[derive(Debug, Clone)]
pub struct CosineBasis {
    num_basis: usize,
    dt: f64,
    dt_max: f64,
    /// L x B basis matrix; row l covers lag (l + 1) * dt
    basis: Array2<f64>,
}

impl CosineBasis {
    /// Build `num_basis` raised-cosine bumps with support `dt_max`.
    ///
    /// Fails if any bump has no mass at the discrete lags (too many
    /// bumps for too short a support).
    pub fn new(num_basis: usize, dt: f64, dt_max: f64) -> anyhow::Result<Self> {
        ensure!(num_basis > 0, "basis size must be positive");
        ensure!(dt > 0.0 && dt_max > dt, "need 0 < dt < dt_max");

        let support = (dt_max / dt).ceil() as usize;
        let spacing = dt_max / (num_basis as f64 + 1.0);
        let width = 2.0 * spacing;

        let mut basis = Array2::zeros((support, num_basis));
        for b in 0..num_basis {
            let center = spacing * (b as f64 + 1.0);
            for l in 0..support {
                let lag = (l as f64 + 1.0) * dt;
                let arg = (lag - center) / width;
                if arg.abs() <= 1.0 {
                    basis[[l, b]] = 0.5 * (1.0 + (PI * arg).cos());
                }
            }
            let total: f64 = basis.column(b).sum();
            ensure!(
                total > 0.0,
                "basis bump {} has no support; reduce B or increase dt_max/dt",
                b
            );
            // unit time integral: sum_l basis[l,b] * dt == 1
            basis.column_mut(b).mapv_inplace(|x| x / (total * dt));
        }

        Ok(Self {
            num_basis,
            dt,
            dt_max,
            basis,
        })
    }

    pub fn num_basis(&self) -> usize {
        self.num_basis
    }

    /// Number of lag bins covered by the basis.
    pub fn support(&self) -> usize {
        self.basis.nrows()
    }

    pub fn dt(&self) -> f64 {
        self.dt
    }

    pub fn dt_max(&self) -> f64 {
        self.dt_max
    }

    pub fn matrix(&self) -> &Array2<f64> {
        &self.basis
    }

    /// Convolve a T x K count matrix with every basis column.
    ///
    /// Returns F: T x K x B with
    /// `F[t,k,b] = sum_{l=1..=L} basis[l-1,b] * S[t-l,k]`,
    /// i.e. strictly causal: events in bin t start influencing at t+1.
    pub fn convolve_with_basis(&self, s: &ArrayView2<f64>) -> Array3<f64> {
        let (t_bins, k_procs) = s.dim();
        let support = self.support();
        let mut f = Array3::zeros((t_bins, k_procs, self.num_basis));

        for t in 0..t_bins {
            let lmax = support.min(t);
            for l in 1..=lmax {
                let row = s.row(t - l);
                for k in 0..k_procs {
                    let count = row[k];
                    if count == 0.0 {
                        continue;
                    }
                    for b in 0..self.num_basis {
                        f[[t, k, b]] += self.basis[[l - 1, b]] * count;
                    }
                }
            }
        }

        f
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn columns_integrate_to_one() {
        let basis = CosineBasis::new(3, 0.5, 5.0).unwrap();
        for b in 0..3 {
            let integral: f64 = basis.matrix().column(b).sum() * basis.dt();
            assert!((integral - 1.0).abs() < 1e-12);
        }
    }

    #[test]
    fn convolution_is_strictly_causal() {
        let basis = CosineBasis::new(2, 1.0, 4.0).unwrap();
        let mut s = Array2::zeros((8, 1));
        s[[2, 0]] = 1.0;
        let f = basis.convolve_with_basis(&s.view());

        // nothing before or at the event bin
        for t in 0..3 {
            for b in 0..2 {
                assert_eq!(f[[t, 0, b]], 0.0, "t={} b={}", t, b);
            }
        }
        // the filtered mass appears strictly after the event
        let after: f64 = f.slice(s![3.., 0, ..]).sum();
        assert!((after - basis.matrix().sum()).abs() < 1e-12);
    }

    #[test]
    fn empty_input_gives_empty_features() {
        let basis = CosineBasis::new(2, 1.0, 4.0).unwrap();
        let s = Array2::zeros((0, 3));
        let f = basis.convolve_with_basis(&s.view());
        assert_eq!(f.dim(), (0, 3, 2));
    }

    #[test]
    fn total_filtered_mass_matches_event_count() {
        // away from the right boundary, sum_t F[t,k,b] == N_k / dt
        let basis = CosineBasis::new(2, 1.0, 4.0).unwrap();
        let mut s = Array2::zeros((20, 1));
        s[[0, 0]] = 3.0;
        let f = basis.convolve_with_basis(&s.view());
        for b in 0..2 {
            let total: f64 = f.slice(s![.., 0, b]).sum();
            assert!((total - 3.0 / basis.dt()).abs() < 1e-10);
        }
    }

    #[test]
    fn too_many_bumps_is_rejected() {
        assert!(CosineBasis::new(12, 1.0, 3.0).is_err());
    }
}
