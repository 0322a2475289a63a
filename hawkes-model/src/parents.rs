//! Auxiliary parent variables.
//!
//! Each observed count S[t, k'] is split over 1 + K * B candidate
//! causes: the background of node k', or basis bump b of the edge
//! (k, k'). The split is multinomial given the rates, which restores
//! conjugacy for every other update. The counts always satisfy
//! z0[t,k'] + sum_{k,b} z[t,k,k',b] = S[t,k'].

use crate::sample::sample_categorical;
use anyhow::ensure;
use hawkes_param::moments::ln_gamma;
use ndarray::prelude::*;
use rand::Rng;

pub struct Parents {
    t: usize,
    k: usize,
    b: usize,
    /// background attributions, T x K
    pub z0: Array2<f64>,
    /// edge attributions, T x K(source) x K(target) x B
    pub z: Array4<f64>,
    /// mean-field expected attributions
    pub ez0: Array2<f64>,
    pub ez: Array4<f64>,
}

impl Parents {
    pub fn new(t: usize, k: usize, b: usize) -> Self {
        Self {
            t,
            k,
            b,
            z0: Array2::zeros((t, k)),
            z: Array4::zeros((t, k, k, b)),
            ez0: Array2::zeros((t, k)),
            ez: Array4::zeros((t, k, k, b)),
        }
    }

    /// Multinomial Gibbs update given point parameters.
    ///
    /// `w_eff[k, k']` is the matrix multiplying the filtered features
    /// and `g` the impulse coefficients.
    pub fn resample<R: Rng>(
        &mut self,
        rng: &mut R,
        s: &ArrayView2<f64>,
        f: &ArrayView3<f64>,
        lambda0: &Array1<f64>,
        w_eff: &Array2<f64>,
        g: &Array3<f64>,
    ) -> anyhow::Result<()> {
        self.z0.fill(0.0);
        self.z.fill(0.0);

        let mut weights = vec![0.0; 1 + self.k * self.b];
        for t in 0..self.t {
            for k2 in 0..self.k {
                let count = s[[t, k2]] as usize;
                if count == 0 {
                    continue;
                }
                weights[0] = lambda0[k2];
                for k1 in 0..self.k {
                    for b in 0..self.b {
                        weights[1 + k1 * self.b + b] =
                            w_eff[[k1, k2]] * g[[k1, k2, b]] * f[[t, k1, b]];
                    }
                }
                for _ in 0..count {
                    let cause = sample_categorical(&weights, rng)?;
                    if cause == 0 {
                        self.z0[[t, k2]] += 1.0;
                    } else {
                        let k1 = (cause - 1) / self.b;
                        let b = (cause - 1) % self.b;
                        self.z[[t, k1, k2, b]] += 1.0;
                    }
                }
            }
        }
        Ok(())
    }

    /// Exact coordinate update of the local factors: the expected
    /// attribution is proportional to exp of the expected log rate of
    /// each cause.
    pub fn meanfield_update(
        &mut self,
        s: &ArrayView2<f64>,
        f: &ArrayView3<f64>,
        e_log_lambda0: &Array1<f64>,
        e_log_w: &Array2<f64>,
        e_log_g: &Array3<f64>,
    ) -> anyhow::Result<()> {
        self.ez0.fill(0.0);
        self.ez.fill(0.0);

        let mut weights = vec![0.0; 1 + self.k * self.b];
        for t in 0..self.t {
            for k2 in 0..self.k {
                let count = s[[t, k2]];
                if count == 0.0 {
                    continue;
                }
                weights[0] = e_log_lambda0[k2].exp();
                for k1 in 0..self.k {
                    for b in 0..self.b {
                        let feat = f[[t, k1, b]];
                        weights[1 + k1 * self.b + b] = if feat > 0.0 {
                            (e_log_w[[k1, k2]] + e_log_g[[k1, k2, b]]).exp() * feat
                        } else {
                            0.0
                        };
                    }
                }
                let total: f64 = weights.iter().sum();
                ensure!(
                    total > 0.0 && total.is_finite(),
                    "degenerate parent update at bin ({}, {})",
                    t,
                    k2
                );
                self.ez0[[t, k2]] = count * weights[0] / total;
                for k1 in 0..self.k {
                    for b in 0..self.b {
                        self.ez[[t, k1, k2, b]] =
                            count * weights[1 + k1 * self.b + b] / total;
                    }
                }
            }
        }
        Ok(())
    }

    pub fn z0_sum(&self) -> Array1<f64> {
        self.z0.sum_axis(Axis(0))
    }

    pub fn ez0_sum(&self) -> Array1<f64> {
        self.ez0.sum_axis(Axis(0))
    }

    /// Counts per (source, target, bump), summed over time.
    pub fn z_cube_sum(&self) -> Array3<f64> {
        self.z.sum_axis(Axis(0))
    }

    pub fn ez_cube_sum(&self) -> Array3<f64> {
        self.ez.sum_axis(Axis(0))
    }

    /// Counts per directed edge, summed over time and bumps.
    pub fn z_edge_sum(&self) -> Array2<f64> {
        self.z_cube_sum().sum_axis(Axis(2))
    }

    pub fn ez_edge_sum(&self) -> Array2<f64> {
        self.ez_cube_sum().sum_axis(Axis(2))
    }

    /// Local contribution to the lower bound:
    /// E[ln p(S, Z | rates)] - E[ln q(Z)].
    ///
    /// The multinomial coefficients of p and q cancel except for the
    /// Poisson normalizer of each bin.
    #[allow(clippy::too_many_arguments)]
    pub fn vlb(
        &self,
        s: &ArrayView2<f64>,
        f: &ArrayView3<f64>,
        dt: f64,
        e_lambda0: &Array1<f64>,
        e_log_lambda0: &Array1<f64>,
        e_w: &Array2<f64>,
        e_log_w: &Array2<f64>,
        e_g: &Array3<f64>,
        e_log_g: &Array3<f64>,
    ) -> f64 {
        let ln_dt = dt.ln();
        let mut total = 0.0;
        for t in 0..self.t {
            for k2 in 0..self.k {
                let count = s[[t, k2]];

                let mut e_rate = e_lambda0[k2];
                for k1 in 0..self.k {
                    for b in 0..self.b {
                        e_rate += e_w[[k1, k2]] * e_g[[k1, k2, b]] * f[[t, k1, b]];
                    }
                }
                total -= e_rate * dt + ln_gamma(count + 1.0);

                if count == 0.0 {
                    continue;
                }
                let u0 = self.ez0[[t, k2]];
                if u0 > 0.0 {
                    let q = u0 / count;
                    total += u0 * (e_log_lambda0[k2] + ln_dt - q.ln());
                }
                for k1 in 0..self.k {
                    for b in 0..self.b {
                        let u = self.ez[[t, k1, k2, b]];
                        if u > 0.0 {
                            let q = u / count;
                            total += u
                                * (e_log_w[[k1, k2]]
                                    + e_log_g[[k1, k2, b]]
                                    + f[[t, k1, b]].ln()
                                    + ln_dt
                                    - q.ln());
                        }
                    }
                }
            }
        }
        total
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::SmallRng;
    use rand::SeedableRng;

    fn toy_setup() -> (Array2<f64>, Array3<f64>, Array1<f64>, Array2<f64>, Array3<f64>) {
        let k = 2;
        let b = 1;
        let t = 4;
        let mut s = Array2::zeros((t, k));
        s[[0, 0]] = 2.0;
        s[[1, 1]] = 3.0;
        s[[3, 0]] = 1.0;
        let mut f = Array3::zeros((t, k, b));
        f[[1, 0, 0]] = 1.5;
        f[[3, 1, 0]] = 0.5;
        let lambda0 = array![1.0, 0.5];
        let w = Array2::from_elem((k, k), 0.8);
        let g = Array3::ones((k, k, b));
        (s, f, lambda0, w, g)
    }

    #[test]
    fn resampled_attributions_conserve_the_counts() {
        let (s, f, lambda0, w, g) = toy_setup();
        let mut parents = Parents::new(4, 2, 1);
        let mut rng = SmallRng::seed_from_u64(31);
        for _ in 0..10 {
            parents
                .resample(&mut rng, &s.view(), &f.view(), &lambda0, &w, &g)
                .unwrap();
            for t in 0..4 {
                for k2 in 0..2 {
                    let attributed: f64 =
                        parents.z0[[t, k2]] + parents.z.slice(s![t, .., k2, ..]).sum();
                    assert_eq!(attributed, s[[t, k2]], "bin ({}, {})", t, k2);
                }
            }
        }
    }

    #[test]
    fn bins_without_filtered_input_go_to_background() {
        let (s, f, lambda0, w, g) = toy_setup();
        let mut parents = Parents::new(4, 2, 1);
        let mut rng = SmallRng::seed_from_u64(32);
        parents
            .resample(&mut rng, &s.view(), &f.view(), &lambda0, &w, &g)
            .unwrap();
        // bin (0, 0) has no active features, F[0,:,:] == 0
        assert_eq!(parents.z0[[0, 0]], 2.0);
        assert_eq!(parents.z.slice(s![0, .., 0, ..]).sum(), 0.0);
    }

    #[test]
    fn expected_attributions_conserve_the_counts() {
        let (s, f, lambda0, w, g) = toy_setup();
        let mut parents = Parents::new(4, 2, 1);
        let e_log_lambda0 = lambda0.mapv(f64::ln);
        let e_log_w = w.mapv(f64::ln);
        let e_log_g = g.mapv(f64::ln);
        parents
            .meanfield_update(&s.view(), &f.view(), &e_log_lambda0, &e_log_w, &e_log_g)
            .unwrap();
        for t in 0..4 {
            for k2 in 0..2 {
                let attributed: f64 =
                    parents.ez0[[t, k2]] + parents.ez.slice(s![t, .., k2, ..]).sum();
                assert!((attributed - s[[t, k2]]).abs() < 1e-12);
            }
        }
    }

    #[test]
    fn edge_sums_aggregate_the_cube() {
        let (s, f, lambda0, w, g) = toy_setup();
        let mut parents = Parents::new(4, 2, 1);
        let mut rng = SmallRng::seed_from_u64(33);
        parents
            .resample(&mut rng, &s.view(), &f.view(), &lambda0, &w, &g)
            .unwrap();
        let total_attributed = parents.z0_sum().sum() + parents.z_edge_sum().sum();
        assert_eq!(total_attributed, s.sum());
    }
}
