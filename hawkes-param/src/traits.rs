use rand::Rng;

/// A parameter matrix driven by a pair of sufficient statistics
/// (e.g. gamma shape/rate, beta success/failure counts) on top of
/// scalar hyper parameters a0 and b0.
pub trait TwoStatParam {
    type Stat;

    fn new(dims: (usize, usize), a0: f64, b0: f64) -> Self;

    /// Reset both statistics to the prior.
    fn reset_stat(&mut self);

    /// Accumulate additional observations into the statistics.
    fn add_stat(&mut self, add_a: &Self::Stat, add_b: &Self::Stat);

    /// Replace the statistics with prior + new observations.
    fn update_stat(&mut self, update_a: &Self::Stat, update_b: &Self::Stat);

    /// Natural-gradient stochastic update: blend the current statistics
    /// toward `prior + stat / minibatchfrac` with weight `stepsize`.
    ///
    /// `minibatchfrac` is the fraction of the full data the statistics
    /// were computed from; `stepsize` follows a Robbins-Monro schedule.
    fn stochastic_update(
        &mut self,
        add_a: &Self::Stat,
        add_b: &Self::Stat,
        minibatchfrac: f64,
        stepsize: f64,
    );
}

/// Same contract for parameters with a single sufficient statistic
/// (e.g. Dirichlet concentrations).
pub trait OneStatParam {
    type Stat;

    fn reset_stat(&mut self);
    fn add_stat(&mut self, add: &Self::Stat);
    fn update_stat(&mut self, update: &Self::Stat);
    fn stochastic_update(&mut self, add: &Self::Stat, minibatchfrac: f64, stepsize: f64);
}

/// Calibrated posterior queries over the current statistics.
///
/// `calibrate` must be called after the statistics change; the accessors
/// return the summaries computed at the last calibration.
pub trait PosteriorInference {
    type Mat;

    fn calibrate(&mut self);

    fn posterior_mean(&self) -> &Self::Mat;
    fn posterior_log_mean(&self) -> &Self::Mat;

    /// Draw one exact sample from the posterior.
    fn posterior_sample<R: Rng>(&self, rng: &mut R) -> anyhow::Result<Self::Mat>;

    /// E_q[ln p(x)] - E_q[ln q(x)] under the stored prior, summed over
    /// all entries. This is the factor's contribution to the ELBO.
    fn vlb(&self) -> f64;
}
