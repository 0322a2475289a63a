//! Conjugate parameter matrices for Poisson factor models.
//!
//! Each parameter type keeps its prior hyperparameters, additive
//! sufficient statistics, and calibrated posterior summaries side by
//! side. Gibbs samplers draw exact posterior samples from the current
//! statistics; mean-field updates overwrite the statistics and read the
//! calibrated expectations; stochastic variational inference blends new
//! statistics in with a Robbins-Monro step.

pub mod beta;
pub mod dirichlet;
pub mod gamma;
pub mod moments;
pub mod traits;

pub use beta::BetaMatrix;
pub use dirichlet::DirichletCube;
pub use gamma::GammaMatrix;
pub use traits::{OneStatParam, PosteriorInference, TwoStatParam};
