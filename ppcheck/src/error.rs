//! Error types for the posterior predictive check pipeline.
//!
//! Every failure propagates to the caller. Nothing here is retried: a bad
//! distribution parameter or a diverged chain produces equally bad output on
//! a second attempt.

use thiserror::Error;

/// Errors raised by data generation, model fitting, replicate simulation
/// and comparison.
#[derive(Debug, Error)]
pub enum PpcError {
    /// A distribution or model parameter is outside its valid support.
    #[error("invalid parameter {name} = {value}: {constraint}")]
    InvalidParameter {
        name: String,
        value: String,
        constraint: String,
    },

    /// Covariates, responses or parameter vectors disagree in size.
    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: String, actual: String },

    /// The model description is incomplete or inconsistent.
    #[error("invalid model: {0}")]
    InvalidModel(String),

    /// The sampler produced a non-finite value.
    #[error("sampler divergence in chain {chain} at iteration {iteration}: {detail}")]
    Divergence {
        chain: usize,
        iteration: usize,
        detail: String,
    },

    /// Convergence diagnostics failed and the caller asked for a hard stop.
    #[error("MCMC did not converge (max R-hat {max_rhat:.3}, min bulk ESS {min_ess:.0})")]
    NotConverged { max_rhat: f64, min_ess: f64 },

    /// More replicate draws were requested than the posterior holds.
    #[error("requested {requested} draws but only {available} are available")]
    InsufficientDraws { requested: usize, available: usize },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("IO error: {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl PpcError {
    /// Shorthand for [`PpcError::InvalidParameter`].
    pub fn invalid(name: &str, value: impl ToString, constraint: &str) -> Self {
        PpcError::InvalidParameter {
            name: name.to_string(),
            value: value.to_string(),
            constraint: constraint.to_string(),
        }
    }

    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        PpcError::Io {
            context: context.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, PpcError>;

/// Fails unless `value` is finite and strictly positive.
pub(crate) fn ensure_positive(name: &str, value: f64) -> Result<()> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(PpcError::invalid(name, value, "must be finite and > 0"))
    }
}
