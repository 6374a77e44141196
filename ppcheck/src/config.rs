//! Run configuration.
//!
//! A single TOML file fixes everything a check depends on: the seed, the
//! generative truth, the sampler settings and the comparison settings.
//! Every section is optional and falls back to [`PpcConfig::default`].

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::compare::ValueRange;
use crate::datagen::{Dataset, NoiseModel, TrueParams};
use crate::engine::SamplerConfig;
use crate::error::{PpcError, Result};
use crate::model::{Likelihood, ModelSpec};
use crate::ppc::{DfPolicy, ReplicateConfig};

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PpcConfig {
    /// Seed for the single RNG threaded through generation, fitting and
    /// replicate simulation
    pub seed: u64,

    /// Observations to generate
    pub n_obs: usize,

    /// Models to fit, in order
    pub models: Vec<Likelihood>,

    pub truth: TruthConfig,

    pub sampler: SamplerConfig,

    pub check: CheckConfig,
}

/// Generative model for synthetic data
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TruthConfig {
    #[serde(flatten)]
    pub coefficients: TrueParams,
    pub noise: NoiseModel,
}

impl Default for TruthConfig {
    fn default() -> Self {
        Self {
            coefficients: TrueParams::default(),
            noise: NoiseModel::default(),
        }
    }
}

/// Posterior predictive comparison settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckConfig {
    /// Posterior draws to simulate replicates from
    pub n_replicates: usize,
    pub df_policy: DfPolicy,
    /// Restricts the visual comparison; `None` shows every value
    pub value_range: Option<ValueRange>,
    /// Quantile of |residual| compared in the tail check
    pub tail_quantile: f64,
}

impl Default for CheckConfig {
    fn default() -> Self {
        Self {
            n_replicates: 50,
            df_policy: DfPolicy::PerDraw,
            value_range: Some(ValueRange {
                lower: -100.0,
                upper: 100.0,
            }),
            tail_quantile: 0.99,
        }
    }
}

impl CheckConfig {
    pub fn replicate_config(&self) -> ReplicateConfig {
        ReplicateConfig {
            n_replicates: self.n_replicates,
            df_policy: self.df_policy,
        }
    }
}

impl Default for PpcConfig {
    fn default() -> Self {
        Self {
            seed: 20240101,
            n_obs: 5000,
            models: vec![Likelihood::Normal, Likelihood::StudentT],
            truth: TruthConfig::default(),
            sampler: SamplerConfig::default(),
            check: CheckConfig::default(),
        }
    }
}

impl PpcConfig {
    /// Load and validate a TOML configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| PpcError::io(format!("cannot read config {}", path.display()), e))?;
        let config = Self::from_toml(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| PpcError::Config(e.to_string()))
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| PpcError::Config(e.to_string()))
    }

    pub fn validate(&self) -> Result<()> {
        if self.n_obs == 0 {
            return Err(PpcError::Config("n_obs must be >= 1".to_string()));
        }
        if self.models.is_empty() {
            return Err(PpcError::Config("at least one model is required".to_string()));
        }
        self.truth.noise.validate()?;
        self.sampler.validate()?;

        let q = self.check.tail_quantile;
        if !(q > 0.0 && q < 1.0) {
            return Err(PpcError::Config(format!(
                "tail_quantile must lie in (0, 1), got {q}"
            )));
        }
        if let Some(range) = &self.check.value_range {
            range.validate()?;
        }

        let available = self.sampler.num_chains * self.sampler.draws_per_chain();
        if self.check.n_replicates > available {
            return Err(PpcError::Config(format!(
                "n_replicates = {} exceeds the {available} retained posterior draws",
                self.check.n_replicates
            )));
        }
        Ok(())
    }

    /// Model descriptions for the configured likelihoods.
    pub fn model_specs(&self) -> Vec<ModelSpec> {
        self.models.iter().map(|&l| ModelSpec::for_likelihood(l)).collect()
    }

    /// Model descriptions for the configured likelihoods, using the
    /// covariate names of `data`.
    pub fn model_specs_for(&self, data: &Dataset) -> Vec<ModelSpec> {
        self.models.iter().map(|&l| ModelSpec::for_dataset(l, data)).collect()
    }

    /// Annotated configuration with the default values.
    pub fn example_toml() -> &'static str {
        r#"# ppc configuration file

# Seed for every random draw in the run
seed = 20240101

# Observations to generate
n_obs = 5000

# Models to fit: "normal" and/or "student_t"
models = ["normal", "student_t"]

[truth]
b0 = 3.0
b1 = 1.5
b2 = -0.5

[truth.noise]
kind = "student_t"   # or "normal" with sigma = ...
df = 3.0
scale = 1.0

[sampler]
num_chains = 3
num_warmup = 1000
num_samples = 1000
thin = 1

[check]
n_replicates = 50
df_policy = "per_draw"   # or "posterior_mean"
tail_quantile = 0.99

[check.value_range]
lower = -100.0
upper = 100.0
"#
    }
}
