//! MCMC inference for the regression models in [`crate::model`].
//!
//! [`GibbsSampler`] implements [`InferenceEngine`] with conjugate full
//! conditionals:
//!
//! ```text
//! beta | tau, lambda, y  ~ N(Q⁻¹b, Q⁻¹)
//!     Q = P0 + tau XᵀΛX,   b = P0 m0 + tau XᵀΛy
//! tau | beta, lambda     ~ Gamma(a + n/2, r + ½ Σ λᵢ eᵢ²)
//! lambda_i | beta, tau, nu ~ Gamma((nu + 1)/2, (nu + tau eᵢ²)/2)     (Student-t only)
//! nu | lambda            slice sampling on the Uniform prior support  (Student-t only)
//! ```
//!
//! For the Normal likelihood `Λ = I` and the last two steps are skipped.

use std::f64::consts::PI;
use std::time::Instant;

use nalgebra::{DMatrix, DVector};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;
use rand_distr::{Distribution, Exp1, StandardNormal};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::datagen::{gamma_rate, Dataset};
use crate::diagnostics::{summarize_draws, FitMcmcSummary};
use crate::draws::{PosteriorDraw, PosteriorDraws};
use crate::error::{PpcError, Result};
use crate::model::{Likelihood, MeanFunction, ModelSpec, Prior, BETA, LAMBDA, MU, NU, RESID, TAU};

/// Configuration for MCMC sampling
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplerConfig {
    /// Number of independent chains
    pub num_chains: usize,
    /// Warmup iterations discarded per chain
    pub num_warmup: usize,
    /// Post-warmup iterations per chain
    pub num_samples: usize,
    /// Keep every `thin`-th post-warmup iteration
    pub thin: usize,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            num_chains: 3,
            num_warmup: 1000,
            num_samples: 1000,
            thin: 1,
        }
    }
}

impl SamplerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.num_chains == 0 {
            return Err(PpcError::Config("num_chains must be >= 1".to_string()));
        }
        if self.num_samples == 0 {
            return Err(PpcError::Config("num_samples must be >= 1".to_string()));
        }
        if self.thin == 0 {
            return Err(PpcError::Config("thin must be >= 1".to_string()));
        }
        Ok(())
    }

    /// Retained draws per chain.
    pub fn draws_per_chain(&self) -> usize {
        self.num_samples.div_ceil(self.thin)
    }
}

/// Posterior draws together with their convergence diagnostics
#[derive(Debug, Clone)]
pub struct PosteriorFit {
    pub model_name: String,
    pub likelihood: Likelihood,
    pub draws: PosteriorDraws,
    pub summary: FitMcmcSummary,
}

impl PosteriorFit {
    /// Turn convergence problems into an error.
    pub fn ensure_converged(&self) -> Result<&Self> {
        let q = &self.summary.overall_quality;
        if q.has_convergence_issues {
            return Err(PpcError::NotConverged {
                max_rhat: q.max_rhat,
                min_ess: q.min_ess_bulk,
            });
        }
        Ok(self)
    }
}

/// Anything that can turn data plus a model description into posterior draws.
pub trait InferenceEngine {
    fn fit<R: Rng>(&self, data: &Dataset, spec: &ModelSpec, rng: &mut R) -> Result<PosteriorFit>;
}

/// Block Gibbs sampler for Normal and Student-t linear regression
#[derive(Debug, Clone, Default)]
pub struct GibbsSampler {
    config: SamplerConfig,
}

impl GibbsSampler {
    pub fn new(config: SamplerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SamplerConfig {
        &self.config
    }
}

impl InferenceEngine for GibbsSampler {
    fn fit<R: Rng>(&self, data: &Dataset, spec: &ModelSpec, rng: &mut R) -> Result<PosteriorFit> {
        self.config.validate()?;
        spec.validate()?;
        let problem = Problem::new(data, spec)?;

        info!(
            "fitting {} on {} observations ({} chains x {} samples, {} warmup)",
            spec.name,
            data.n_obs(),
            self.config.num_chains,
            self.config.num_samples,
            self.config.num_warmup
        );
        let start = Instant::now();

        // One independent stream per chain, all derived from the caller's RNG
        let seeds: Vec<u64> = (0..self.config.num_chains).map(|_| rng.gen()).collect();

        let mut draws = Vec::with_capacity(self.config.num_chains * self.config.draws_per_chain());
        for (chain, seed) in seeds.into_iter().enumerate() {
            let mut chain_rng = ChaCha20Rng::seed_from_u64(seed);
            debug!("chain {}/{} started", chain + 1, self.config.num_chains);
            draws.extend(problem.run_chain(chain, &self.config, &mut chain_rng)?);
        }

        let draws = PosteriorDraws::new(draws)?;
        let summary = summarize_draws(&draws);
        info!(
            "{} finished in {:.2?}: {} draws, max R-hat {:.3}, grade {}",
            spec.name,
            start.elapsed(),
            draws.len(),
            summary.overall_quality.max_rhat,
            summary.overall_quality.quality_grade
        );
        if summary.overall_quality.has_convergence_issues {
            warn!("{} shows convergence problems; inspect the diagnostics before trusting replicates", spec.name);
        }

        Ok(PosteriorFit {
            model_name: spec.name.clone(),
            likelihood: spec.likelihood,
            draws,
            summary,
        })
    }
}

/// Data and priors unpacked for the sampler
struct Problem<'a> {
    x: &'a DMatrix<f64>,
    y: DVector<f64>,
    likelihood: Likelihood,
    beta_mean: f64,
    beta_precision: f64,
    tau_shape: f64,
    tau_rate: f64,
    nu_bounds: (f64, f64),
    /// XᵀX and Xᵀy, reused every iteration when Λ = I
    xtx: DMatrix<f64>,
    xty: DVector<f64>,
    keep_mu: bool,
    keep_resid: bool,
    keep_lambda: bool,
}

/// Mutable state of one chain
struct ChainState {
    beta: DVector<f64>,
    tau: f64,
    nu: f64,
    lambda: Vec<f64>,
}

impl<'a> Problem<'a> {
    fn new(data: &'a Dataset, spec: &ModelSpec) -> Result<Self> {
        let covariates = data.covariates();
        let MeanFunction::Linear { covariates: names } = &spec.mean;
        if names.as_slice() != covariates.names() {
            return Err(PpcError::DimensionMismatch {
                expected: format!("covariates {names:?}"),
                actual: format!("covariates {:?}", covariates.names()),
            });
        }

        let Prior::Normal {
            mean: beta_mean,
            precision: beta_precision,
        } = spec.prior(BETA)?
        else {
            return Err(PpcError::InvalidModel("'beta' needs a Normal prior".to_string()));
        };
        let Prior::Gamma {
            shape: tau_shape,
            rate: tau_rate,
        } = spec.prior(TAU)?
        else {
            return Err(PpcError::InvalidModel("'tau' needs a Gamma prior".to_string()));
        };
        let nu_bounds = match spec.likelihood {
            Likelihood::StudentT => match spec.prior(NU)? {
                Prior::Uniform { lower, upper } => (lower, upper),
                _ => return Err(PpcError::InvalidModel("'nu' needs a Uniform prior".to_string())),
            },
            Likelihood::Normal => (0.0, 0.0),
        };

        let x = covariates.design();
        let y = DVector::from_column_slice(data.y());
        let xtx = x.tr_mul(x);
        let xty = x.tr_mul(&y);

        Ok(Self {
            x,
            y,
            likelihood: spec.likelihood,
            beta_mean,
            beta_precision,
            tau_shape,
            tau_rate,
            nu_bounds,
            xtx,
            xty,
            keep_mu: spec.monitors(MU),
            keep_resid: spec.monitors(RESID),
            keep_lambda: spec.monitors(LAMBDA),
        })
    }

    fn n(&self) -> usize {
        self.y.len()
    }

    fn p(&self) -> usize {
        self.x.ncols()
    }

    fn is_student_t(&self) -> bool {
        self.likelihood == Likelihood::StudentT
    }

    /// Dispersed starting point; beta is drawn first, so only tau and nu
    /// need initial values.
    fn initial_state<R: Rng>(&self, rng: &mut R) -> ChainState {
        let (lo, hi) = self.nu_bounds;
        ChainState {
            beta: DVector::zeros(self.p()),
            tau: rng.gen_range(0.1..2.0),
            nu: if self.is_student_t() { rng.gen_range(lo..hi) } else { f64::NAN },
            lambda: vec![1.0; self.n()],
        }
    }

    fn run_chain<R: Rng>(
        &self,
        chain: usize,
        config: &SamplerConfig,
        rng: &mut R,
    ) -> Result<Vec<PosteriorDraw>> {
        let mut state = self.initial_state(rng);
        let mut kept = Vec::with_capacity(config.draws_per_chain());
        let total = config.num_warmup + config.num_samples;

        for iter in 0..total {
            self.step(&mut state, rng)
                .map_err(|detail| PpcError::Divergence {
                    chain,
                    iteration: iter,
                    detail,
                })?;

            if iter >= config.num_warmup && (iter - config.num_warmup) % config.thin == 0 {
                kept.push(self.record(chain, iter - config.num_warmup, &state));
            }
        }
        Ok(kept)
    }

    /// One full Gibbs sweep. Errors carry a description of what diverged.
    fn step<R: Rng>(&self, s: &mut ChainState, rng: &mut R) -> std::result::Result<(), String> {
        s.beta = self.sample_beta(s, rng)?;

        let resid = self.residuals(&s.beta);
        s.tau = self.sample_tau(&resid, &s.lambda, rng)?;

        if self.is_student_t() {
            self.sample_lambda(s, &resid, rng)?;
            s.nu = self.sample_nu(s.nu, &s.lambda, rng)?;
        }
        Ok(())
    }

    fn sample_beta<R: Rng>(&self, s: &ChainState, rng: &mut R) -> std::result::Result<DVector<f64>, String> {
        let p = self.p();
        let (xtwx, xtwy) = if self.is_student_t() {
            self.weighted_cross_products(&s.lambda)
        } else {
            (self.xtx.clone(), self.xty.clone())
        };

        let q = DMatrix::<f64>::identity(p, p) * self.beta_precision + xtwx * s.tau;
        let b = DVector::from_element(p, self.beta_precision * self.beta_mean) + xtwy * s.tau;

        let chol = q
            .cholesky()
            .ok_or_else(|| "posterior precision of beta is not positive definite".to_string())?;
        let mean = chol.solve(&b);

        let z = DVector::from_iterator(p, (0..p).map(|_| rng.sample::<f64, _>(StandardNormal)));
        let noise = chol
            .l()
            .transpose()
            .solve_upper_triangular(&z)
            .ok_or_else(|| "singular Cholesky factor for beta".to_string())?;

        let beta = mean + noise;
        if beta.iter().all(|b| b.is_finite()) {
            Ok(beta)
        } else {
            Err(format!("non-finite beta {:?}", beta.as_slice()))
        }
    }

    /// XᵀΛX and XᵀΛy for the current mixing weights.
    fn weighted_cross_products(&self, lambda: &[f64]) -> (DMatrix<f64>, DVector<f64>) {
        let p = self.p();
        let mut xtwx = DMatrix::zeros(p, p);
        let mut xtwy = DVector::zeros(p);
        for (i, &w) in lambda.iter().enumerate() {
            let row = self.x.row(i);
            for a in 0..p {
                let wa = w * row[a];
                xtwy[a] += wa * self.y[i];
                for b in 0..=a {
                    xtwx[(a, b)] += wa * row[b];
                }
            }
        }
        xtwx.fill_upper_triangle_with_lower_triangle();
        (xtwx, xtwy)
    }

    fn residuals(&self, beta: &DVector<f64>) -> DVector<f64> {
        &self.y - self.x * beta
    }

    fn sample_tau<R: Rng>(
        &self,
        resid: &DVector<f64>,
        lambda: &[f64],
        rng: &mut R,
    ) -> std::result::Result<f64, String> {
        let ss: f64 = resid.iter().zip(lambda).map(|(e, w)| w * e * e).sum();
        let shape = self.tau_shape + self.n() as f64 / 2.0;
        let rate = self.tau_rate + ss / 2.0;
        let tau = gamma_rate(shape, rate).map_err(|e| e.to_string())?.sample(rng);
        if tau.is_finite() && tau > 0.0 {
            Ok(tau)
        } else {
            Err(format!("tau = {tau}"))
        }
    }

    fn sample_lambda<R: Rng>(
        &self,
        s: &mut ChainState,
        resid: &DVector<f64>,
        rng: &mut R,
    ) -> std::result::Result<(), String> {
        let shape = (s.nu + 1.0) / 2.0;
        for (w, r) in s.lambda.iter_mut().zip(resid.iter()) {
            let rate = (s.nu + s.tau * r * r) / 2.0;
            *w = gamma_rate(shape, rate).map_err(|e| e.to_string())?.sample(rng);
            if !(w.is_finite() && *w > 0.0) {
                return Err(format!("lambda = {w}"));
            }
        }
        Ok(())
    }

    /// Slice sampler (stepping out, then shrinkage) for nu on its bounded
    /// Uniform support, using the sufficient statistics of lambda.
    fn sample_nu<R: Rng>(&self, nu: f64, lambda: &[f64], rng: &mut R) -> std::result::Result<f64, String> {
        const WIDTH: f64 = 1.0;
        const MAX_STEPS: usize = 64;

        let (lo, hi) = self.nu_bounds;
        let n = lambda.len() as f64;
        let sum_log: f64 = lambda.iter().map(|w| w.ln()).sum();
        let sum_lin: f64 = lambda.iter().sum();
        let log_density = |v: f64| -> f64 {
            let h = v / 2.0;
            n * (h * h.ln() - ln_gamma(h)) + (h - 1.0) * sum_log - h * sum_lin
        };

        let e: f64 = rng.sample(Exp1);
        let level = log_density(nu) - e;

        let mut left = nu - WIDTH * rng.gen::<f64>();
        let mut right = left + WIDTH;
        for _ in 0..MAX_STEPS {
            if left <= lo || log_density(left) <= level {
                break;
            }
            left -= WIDTH;
        }
        for _ in 0..MAX_STEPS {
            if right >= hi || log_density(right) <= level {
                break;
            }
            right += WIDTH;
        }
        left = left.max(lo);
        right = right.min(hi);

        for _ in 0..MAX_STEPS {
            if right - left < 1e-12 {
                break;
            }
            let proposal = rng.gen_range(left..right);
            if log_density(proposal) > level {
                return Ok(proposal);
            }
            if proposal < nu {
                left = proposal;
            } else {
                right = proposal;
            }
        }
        // Shrinkage collapsed onto the current point
        if nu.is_finite() {
            debug!(
                "nu slice sampler stalled on [{left:.4}, {right:.4}] after {MAX_STEPS} steps; keeping nu = {nu:.4}"
            );
            Ok(nu)
        } else {
            Err("nu slice sampler failed".to_string())
        }
    }

    fn record(&self, chain: usize, iteration: usize, s: &ChainState) -> PosteriorDraw {
        let mut draw = PosteriorDraw::new(chain, iteration, s.beta.as_slice().to_vec(), s.tau);
        if self.is_student_t() {
            draw = draw.with_nu(s.nu);
            if self.keep_lambda {
                draw = draw.with_lambda(s.lambda.clone());
            }
        }
        if self.keep_mu || self.keep_resid {
            let mu = self.x * &s.beta;
            if self.keep_resid {
                draw = draw.with_resid((&self.y - &mu).as_slice().to_vec());
            }
            if self.keep_mu {
                draw = draw.with_mu(mu.as_slice().to_vec());
            }
        }
        draw
    }
}

/// Log-gamma via Lanczos approximation (g=7, n=9 coefficients).
#[allow(clippy::excessive_precision)]
pub(crate) fn ln_gamma(x: f64) -> f64 {
    const COEFFS: [f64; 9] = [
        0.999_999_999_999_809_93,
        676.520_368_121_885_1,
        -1_259.139_216_722_402_8,
        771.323_428_777_653_13,
        -176.615_029_162_140_59,
        12.507_343_278_686_905,
        -0.138_571_095_265_720_12,
        9.984_369_578_019_571_6e-6,
        1.505_632_735_149_311_6e-7,
    ];

    if x < 0.5 {
        // Reflection formula
        PI.ln() - (PI * x).sin().abs().ln() - ln_gamma(1.0 - x)
    } else {
        let x = x - 1.0;
        let mut ag = COEFFS[0];
        for (i, &c) in COEFFS[1..].iter().enumerate() {
            ag += c / (x + i as f64 + 1.0);
        }
        let t = x + 7.5;
        0.5 * (2.0 * PI).ln() + (x + 0.5) * t.ln() - t + ag.ln()
    }
}
