//! Model descriptions for Bayesian linear regression.
//!
//! A [`ModelSpec`] is a plain data object: priors keyed by parameter name, a
//! likelihood family, a mean function and the list of monitored parameters.
//! It is handed to an [`crate::engine::InferenceEngine`], which decides how to
//! sample it.
//!
//! Parameter names follow the usual BUGS conventions:
//!
//! | name     | meaning                                    |
//! |----------|--------------------------------------------|
//! | `beta`   | regression coefficients (intercept first)  |
//! | `tau`    | residual precision                         |
//! | `sigma`  | residual scale, `1 / sqrt(tau)`            |
//! | `nu`     | Student-t degrees of freedom               |
//! | `lambda` | per-observation latent mixing weight       |
//! | `mu`     | per-observation mean                       |
//! | `resid`  | per-observation residual `y - mu`          |

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::datagen::Dataset;
use crate::error::{PpcError, Result};

pub const BETA: &str = "beta";
pub const TAU: &str = "tau";
pub const SIGMA: &str = "sigma";
pub const NU: &str = "nu";
pub const LAMBDA: &str = "lambda";
pub const MU: &str = "mu";
pub const RESID: &str = "resid";

/// Prior distribution for a (scalar or exchangeable vector) parameter
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "dist", rename_all = "snake_case")]
pub enum Prior {
    Normal { mean: f64, precision: f64 },
    Gamma { shape: f64, rate: f64 },
    Uniform { lower: f64, upper: f64 },
}

impl Prior {
    pub fn validate(&self, name: &str) -> Result<()> {
        let bad = |what: &str| Err(PpcError::InvalidModel(format!("prior on '{name}': {what}")));
        match *self {
            Prior::Normal { mean, precision } => {
                if !mean.is_finite() {
                    return bad("mean must be finite");
                }
                if !(precision.is_finite() && precision > 0.0) {
                    return bad("precision must be > 0");
                }
            }
            Prior::Gamma { shape, rate } => {
                if !(shape.is_finite() && shape > 0.0 && rate.is_finite() && rate > 0.0) {
                    return bad("shape and rate must be > 0");
                }
            }
            Prior::Uniform { lower, upper } => {
                if !(lower.is_finite() && upper.is_finite() && lower < upper) {
                    return bad("uniform support must satisfy lower < upper");
                }
            }
        }
        Ok(())
    }
}

/// Observation model for the response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Likelihood {
    /// `y_i ~ Normal(mu_i, 1/tau)`
    Normal,
    /// `y_i ~ Normal(mu_i, 1/(tau * lambda_i))`, `lambda_i ~ Gamma(nu/2, nu/2)`
    StudentT,
}

impl Likelihood {
    pub fn name(&self) -> &'static str {
        match self {
            Likelihood::Normal => "normal",
            Likelihood::StudentT => "student_t",
        }
    }
}

/// Deterministic mean function
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MeanFunction {
    /// `mu_i = beta_1 + sum_j beta_{j+1} * x_ij` over the named covariates
    Linear { covariates: Vec<String> },
}

impl MeanFunction {
    /// Number of coefficients, intercept included.
    pub fn n_coef(&self) -> usize {
        match self {
            MeanFunction::Linear { covariates } => covariates.len() + 1,
        }
    }
}

/// Language-neutral regression model description
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSpec {
    pub name: String,
    pub priors: BTreeMap<String, Prior>,
    pub likelihood: Likelihood,
    pub mean: MeanFunction,
    /// Parameters retained in the posterior draws. Must include every
    /// entry of [`ModelSpec::required_parameters`]; `sigma` is derived from
    /// `tau` and always reported.
    pub monitor: Vec<String>,
}

fn default_covariates() -> Vec<String> {
    vec!["x1".to_string(), "x2".to_string()]
}

impl ModelSpec {
    /// Linear regression with Normal errors and diffuse priors:
    /// `beta_j ~ N(0, precision 1e-4)`, `tau ~ Gamma(0.001, 0.001)`.
    pub fn normal_regression() -> Self {
        let mut priors = BTreeMap::new();
        priors.insert(
            BETA.to_string(),
            Prior::Normal {
                mean: 0.0,
                precision: 1e-4,
            },
        );
        priors.insert(
            TAU.to_string(),
            Prior::Gamma {
                shape: 0.001,
                rate: 0.001,
            },
        );

        Self {
            name: "normal_regression".to_string(),
            priors,
            likelihood: Likelihood::Normal,
            mean: MeanFunction::Linear {
                covariates: default_covariates(),
            },
            monitor: vec![BETA.to_string(), TAU.to_string(), SIGMA.to_string()],
        }
    }

    /// Same mean function with Student-t errors via a latent Gamma scale
    /// mixture, and `nu ~ Uniform(1.1, 10)` keeping the variance finite.
    pub fn student_t_regression() -> Self {
        let mut spec = Self::normal_regression();
        spec.name = "student_t_regression".to_string();
        spec.likelihood = Likelihood::StudentT;
        spec.priors.insert(
            NU.to_string(),
            Prior::Uniform {
                lower: 1.1,
                upper: 10.0,
            },
        );
        spec.monitor.push(NU.to_string());
        spec
    }

    /// Built-in model for a likelihood family.
    pub fn for_likelihood(likelihood: Likelihood) -> Self {
        match likelihood {
            Likelihood::Normal => Self::normal_regression(),
            Likelihood::StudentT => Self::student_t_regression(),
        }
    }

    /// Built-in model for a likelihood family over the covariates of `data`.
    pub fn for_dataset(likelihood: Likelihood, data: &Dataset) -> Self {
        Self::for_likelihood(likelihood).with_covariates(data.covariates().names().to_vec())
    }

    /// Use a different set of named covariates.
    pub fn with_covariates(mut self, covariates: Vec<String>) -> Self {
        self.mean = MeanFunction::Linear { covariates };
        self
    }

    /// Also retain `name` in the draws (e.g. `mu` or `resid`).
    pub fn with_monitor(mut self, name: &str) -> Self {
        if !self.monitors(name) {
            self.monitor.push(name.to_string());
        }
        self
    }

    pub fn with_prior(mut self, name: &str, prior: Prior) -> Self {
        self.priors.insert(name.to_string(), prior);
        self
    }

    pub fn monitors(&self, name: &str) -> bool {
        self.monitor.iter().any(|m| m == name)
    }

    pub fn prior(&self, name: &str) -> Result<Prior> {
        self.priors
            .get(name)
            .copied()
            .ok_or_else(|| PpcError::InvalidModel(format!("no prior for '{name}'")))
    }

    /// Parameters this model can produce draws for.
    pub fn known_parameters(&self) -> Vec<&'static str> {
        let mut params = vec![BETA, TAU, SIGMA, MU, RESID];
        if self.likelihood == Likelihood::StudentT {
            params.extend([NU, LAMBDA]);
        }
        params
    }

    /// Parameters every draw carries: replicates cannot be simulated
    /// without them.
    pub fn required_parameters(&self) -> Vec<&'static str> {
        match self.likelihood {
            Likelihood::Normal => vec![BETA, TAU],
            Likelihood::StudentT => vec![BETA, TAU, NU],
        }
    }

    pub fn validate(&self) -> Result<()> {
        match self.prior(BETA)? {
            Prior::Normal { .. } => {}
            other => {
                return Err(PpcError::InvalidModel(format!(
                    "'beta' needs a Normal prior, got {other:?}"
                )))
            }
        }
        match self.prior(TAU)? {
            Prior::Gamma { .. } => {}
            other => {
                return Err(PpcError::InvalidModel(format!(
                    "'tau' needs a Gamma prior, got {other:?}"
                )))
            }
        }
        if self.likelihood == Likelihood::StudentT {
            match self.prior(NU)? {
                Prior::Uniform { lower, .. } if lower > 0.0 => {}
                other => {
                    return Err(PpcError::InvalidModel(format!(
                        "'nu' needs a Uniform prior on positive support, got {other:?}"
                    )))
                }
            }
        }

        for (name, prior) in &self.priors {
            prior.validate(name)?;
        }

        let known = self.known_parameters();
        if let Some(unknown) = self.monitor.iter().find(|m| !known.contains(&m.as_str())) {
            return Err(PpcError::InvalidModel(format!(
                "cannot monitor unknown parameter '{unknown}' in {}",
                self.name
            )));
        }
        if let Some(missing) = self.required_parameters().into_iter().find(|p| !self.monitors(p)) {
            return Err(PpcError::InvalidModel(format!(
                "{} must monitor '{missing}'",
                self.name
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_specs_validate() {
        assert!(ModelSpec::normal_regression().validate().is_ok());
        assert!(ModelSpec::student_t_regression().validate().is_ok());
    }

    #[test]
    fn test_student_t_spec_contents() {
        let spec = ModelSpec::student_t_regression();
        assert_eq!(spec.likelihood, Likelihood::StudentT);
        assert_eq!(spec.mean.n_coef(), 3);
        assert!(spec.monitors(NU));
        assert_eq!(
            spec.prior(NU).unwrap(),
            Prior::Uniform {
                lower: 1.1,
                upper: 10.0
            }
        );
    }

    #[test]
    fn test_unknown_monitor_rejected() {
        let spec = ModelSpec::normal_regression().with_monitor(NU);
        assert!(matches!(spec.validate(), Err(PpcError::InvalidModel(_))));

        let spec = ModelSpec::normal_regression().with_monitor(MU).with_monitor(MU);
        assert_eq!(spec.monitor.iter().filter(|m| *m == MU).count(), 1);
        assert!(spec.validate().is_ok());
    }

    #[test]
    fn test_monitor_must_keep_required_parameters() {
        let mut spec = ModelSpec::student_t_regression();
        spec.monitor = vec![BETA.to_string()];
        let err = spec.validate().unwrap_err();
        assert!(matches!(err, PpcError::InvalidModel(ref m) if m.contains("'tau'")));

        spec.monitor = vec![BETA.to_string(), TAU.to_string(), SIGMA.to_string()];
        let err = spec.validate().unwrap_err();
        assert!(matches!(err, PpcError::InvalidModel(ref m) if m.contains("'nu'")));

        let mut spec = ModelSpec::normal_regression();
        spec.monitor = vec![BETA.to_string(), TAU.to_string()];
        assert!(spec.validate().is_ok());
        assert_eq!(spec.required_parameters(), vec![BETA, TAU]);
    }

    #[test]
    fn test_bad_priors_rejected() {
        let spec = ModelSpec::normal_regression().with_prior(
            TAU,
            Prior::Gamma {
                shape: 0.0,
                rate: 1.0,
            },
        );
        assert!(spec.validate().is_err());

        let spec = ModelSpec::student_t_regression().with_prior(
            NU,
            Prior::Uniform {
                lower: 10.0,
                upper: 1.1,
            },
        );
        assert!(spec.validate().is_err());

        let mut spec = ModelSpec::normal_regression();
        spec.priors.remove(BETA);
        assert!(spec.validate().is_err());
    }

    #[test]
    fn test_spec_serializes() {
        let spec = ModelSpec::student_t_regression();
        let json = serde_json::to_string(&spec).unwrap();
        assert!(json.contains("\"dist\":\"uniform\""));
        let back: ModelSpec = serde_json::from_str(&json).unwrap();
        assert_eq!(back, spec);
    }
}
