//! Posterior predictive checks for Bayesian linear regression.
//!
//! The pipeline runs in four steps, each in its own module:
//!
//! 1. [`datagen`] generates a synthetic dataset with known coefficients and
//!    Normal or Student-t noise.
//! 2. [`engine`] fits a [`model::ModelSpec`] with a Gibbs sampler and
//!    reports convergence through [`diagnostics`].
//! 3. [`ppc`] simulates replicate response vectors from randomly selected
//!    posterior draws.
//! 4. [`compare`] sets the replicates against the observed response.
//!
//! All randomness flows through a caller-supplied RNG, so one seed fixes
//! the whole run.

pub mod compare;
pub mod config;
pub mod datagen;
pub mod diagnostics;
pub mod draws;
pub mod engine;
pub mod error;
pub mod model;
pub mod ppc;

pub use compare::{LongTable, PpcComparison, TailCheck, ValueRange};
pub use config::PpcConfig;
pub use datagen::{generate_dataset, Covariates, Dataset, NoiseModel, TrueParams};
pub use diagnostics::{summarize_draws, FitMcmcSummary};
pub use draws::{Param, PosteriorDraw, PosteriorDraws};
pub use engine::{GibbsSampler, InferenceEngine, PosteriorFit, SamplerConfig};
pub use error::{PpcError, Result};
pub use model::{Likelihood, ModelSpec};
pub use ppc::{simulate_from_fit, simulate_replicates, DfPolicy, ReplicateConfig, ReplicateMatrix};
