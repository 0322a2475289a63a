//! Bayesian inference for discrete-time network Hawkes processes.
//!
//! Events live on K nodes and are binned into counts S (T x K). Each
//! node fires from its own background rate plus excitation arriving
//! over a latent directed network: an edge (k, k') with weight W and a
//! normalized impulse response lets events on k raise the rate of k'
//! for a short window. A stochastic block model prior ties the edges
//! together.
//!
//! # Inference
//!
//! Every count is augmented with multinomial parent attributions,
//! which makes all conditionals conjugate. Two engines share the model
//! substrate: collapsed Gibbs sampling over a spike-and-slab network,
//! and mean field / stochastic variational inference over a gamma
//! mixture relaxation. A penalized MAP model without the network prior
//! is available for initialization.
//!
//! # References
//!
//! Linderman & Adams (2014). "Discovering latent network structure in
//! point process data." ICML.

/// Raised-cosine basis and causal filtering of count matrices
pub mod basis;

/// Gamma background rates
pub mod bias;

/// Dirichlet impulse-response coefficients
pub mod impulse;

/// Stochastic block model prior over edges
pub mod network;

/// Spike-and-slab and gamma-mixture weight models
pub mod weights;

/// Multinomial parent attributions
pub mod parents;

/// The shared model substrate: data, rates, likelihoods, simulation
pub mod model;

/// Collapsed Gibbs sampling and chain collection
pub mod gibbs;

/// Mean-field coordinate descent and SVI
pub mod meanfield;

/// Penalized MAP model for initialization
pub mod standard;

mod sample;

#[cfg(test)]
mod test;

pub use gibbs::{GibbsSampling, McmcChain};
pub use meanfield::{svi_stepsize, MeanField};
pub use model::{
    ModelParameters, NetworkHawkesGibbs, NetworkHawkesMeanField, NetworkHawkesOptions, Simulation,
};
pub use network::NetworkPriors;
pub use standard::{StandardHawkesModel, StandardHawkesOptions};
