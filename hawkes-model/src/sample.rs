//! Categorical sampling helpers shared by the Gibbs updates.

use anyhow::ensure;
use rand::Rng;

/// Sample an index proportional to `exp(log_weights)`.
///
/// Uses the max trick, so the weights may be arbitrarily small or
/// `-inf` (zero mass). Fails only if no entry carries mass.
pub fn sample_categorical_log<R: Rng>(log_weights: &[f64], rng: &mut R) -> anyhow::Result<usize> {
    let max = log_weights.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    ensure!(max.is_finite(), "categorical with no finite log weight");

    let total: f64 = log_weights.iter().map(|&lw| (lw - max).exp()).sum();
    let u: f64 = rng.random::<f64>() * total;
    let mut cum = 0.0;
    for (i, &lw) in log_weights.iter().enumerate() {
        cum += (lw - max).exp();
        if u <= cum {
            return Ok(i);
        }
    }
    Ok(log_weights.len() - 1)
}

/// Sample an index proportional to non-negative linear weights.
pub fn sample_categorical<R: Rng>(weights: &[f64], rng: &mut R) -> anyhow::Result<usize> {
    let total: f64 = weights.iter().sum();
    ensure!(
        total > 0.0 && total.is_finite(),
        "categorical with total mass {}",
        total
    );
    let u: f64 = rng.random::<f64>() * total;
    let mut cum = 0.0;
    for (i, &w) in weights.iter().enumerate() {
        cum += w;
        if u <= cum {
            return Ok(i);
        }
    }
    Ok(weights.len() - 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::SmallRng;
    use rand::SeedableRng;

    #[test]
    fn log_sampler_respects_the_weights() {
        let mut rng = SmallRng::seed_from_u64(9);
        let lw = [0.0_f64.ln(), 1.0_f64.ln(), 9.0_f64.ln()];
        let mut counts = [0usize; 3];
        for _ in 0..2000 {
            counts[sample_categorical_log(&lw, &mut rng).unwrap()] += 1;
        }
        assert_eq!(counts[0], 0);
        assert!(counts[2] > counts[1] * 5);
    }

    #[test]
    fn zero_mass_is_an_error() {
        let mut rng = SmallRng::seed_from_u64(10);
        assert!(sample_categorical(&[0.0, 0.0], &mut rng).is_err());
        assert!(sample_categorical_log(&[f64::NEG_INFINITY], &mut rng).is_err());
    }

    #[test]
    fn linear_sampler_is_unbiased_enough() {
        let mut rng = SmallRng::seed_from_u64(11);
        let w = [1.0, 3.0];
        let mut ones = 0usize;
        for _ in 0..4000 {
            if sample_categorical(&w, &mut rng).unwrap() == 1 {
                ones += 1;
            }
        }
        let frac = ones as f64 / 4000.0;
        assert!((frac - 0.75).abs() < 0.03, "frac {}", frac);
    }
}
