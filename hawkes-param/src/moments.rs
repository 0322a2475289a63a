//! Scalar log-density and ELBO helpers shared by the parameter types.

extern crate special;

use special::Gamma as SpecialGamma;

#[inline]
pub fn ln_gamma(x: f64) -> f64 {
    SpecialGamma::ln_gamma(x).0
}

#[inline]
pub fn digamma(x: f64) -> f64 {
    SpecialGamma::digamma(x)
}

/// Log density of Gamma(a0, b0) (shape/rate) at x.
pub fn gamma_ln_pdf(a0: f64, b0: f64, x: f64) -> f64 {
    if x <= 0.0 {
        return f64::NEG_INFINITY;
    }
    a0 * b0.ln() - ln_gamma(a0) + (a0 - 1.0) * x.ln() - b0 * x
}

/// E_q[ln p(x)] - E_q[ln q(x)] for prior Gamma(a0, b0), q = Gamma(a, b).
pub fn gamma_vlb_term(a0: f64, b0: f64, a: f64, b: f64) -> f64 {
    let e_x = a / b;
    let e_ln_x = digamma(a) - b.ln();
    let lp = a0 * b0.ln() - ln_gamma(a0) + (a0 - 1.0) * e_ln_x - b0 * e_x;
    let lq = a * b.ln() - ln_gamma(a) + (a - 1.0) * e_ln_x - b * e_x;
    lp - lq
}

/// Log density of Beta(t1, t0) at x.
pub fn beta_ln_pdf(t1: f64, t0: f64, x: f64) -> f64 {
    if x <= 0.0 || x >= 1.0 {
        return f64::NEG_INFINITY;
    }
    ln_gamma(t1 + t0) - ln_gamma(t1) - ln_gamma(t0)
        + (t1 - 1.0) * x.ln()
        + (t0 - 1.0) * (1.0 - x).ln()
}

/// E_q[ln p(x)] - E_q[ln q(x)] for prior Beta(t1, t0), q = Beta(a, b).
pub fn beta_vlb_term(t1: f64, t0: f64, a: f64, b: f64) -> f64 {
    let e_ln = digamma(a) - digamma(a + b);
    let e_ln_1m = digamma(b) - digamma(a + b);
    let lp = ln_gamma(t1 + t0) - ln_gamma(t1) - ln_gamma(t0)
        + (t1 - 1.0) * e_ln
        + (t0 - 1.0) * e_ln_1m;
    let lq =
        ln_gamma(a + b) - ln_gamma(a) - ln_gamma(b) + (a - 1.0) * e_ln + (b - 1.0) * e_ln_1m;
    lp - lq
}

/// Log density of a symmetric Dirichlet(alpha0) at the simplex point x.
pub fn dirichlet_ln_pdf(alpha0: f64, x: &[f64]) -> f64 {
    let n = x.len() as f64;
    let mut lp = ln_gamma(alpha0 * n) - n * ln_gamma(alpha0);
    for &xi in x {
        if xi <= 0.0 {
            return f64::NEG_INFINITY;
        }
        lp += (alpha0 - 1.0) * xi.ln();
    }
    lp
}

/// E_q[ln p(x)] - E_q[ln q(x)] for a symmetric Dirichlet(alpha0) prior
/// and q = Dirichlet(a).
pub fn dirichlet_vlb_term(alpha0: f64, a: &[f64]) -> f64 {
    let n = a.len() as f64;
    let s: f64 = a.iter().sum();
    let mut lp = ln_gamma(alpha0 * n) - n * ln_gamma(alpha0);
    let mut lq = ln_gamma(s);
    for &ai in a {
        let e_ln = digamma(ai) - digamma(s);
        lp += (alpha0 - 1.0) * e_ln;
        lq += -ln_gamma(ai) + (ai - 1.0) * e_ln;
    }
    lp - lq
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gamma_vlb_is_zero_when_q_equals_prior() {
        // KL(q || p) = 0 and the cross terms cancel when q == p.
        let term = gamma_vlb_term(2.5, 1.5, 2.5, 1.5);
        assert!(term.abs() < 1e-12, "expected 0, got {}", term);
    }

    #[test]
    fn gamma_vlb_is_negative_kl() {
        // For q != p the term equals -KL(q || p) < 0.
        let term = gamma_vlb_term(1.0, 1.0, 5.0, 2.0);
        assert!(term < 0.0, "expected negative, got {}", term);
    }

    #[test]
    fn beta_vlb_matches_zero_at_prior() {
        let term = beta_vlb_term(0.5, 0.5, 0.5, 0.5);
        assert!(term.abs() < 1e-12);
    }

    #[test]
    fn dirichlet_vlb_matches_zero_at_prior() {
        let term = dirichlet_vlb_term(1.5, &[1.5, 1.5, 1.5]);
        assert!(term.abs() < 1e-12);
    }

    #[test]
    fn gamma_ln_pdf_exponential_case() {
        // Gamma(1, 1) is Exponential(1): ln pdf(x) = -x.
        assert!((gamma_ln_pdf(1.0, 1.0, 2.0) + 2.0).abs() < 1e-12);
    }
}
