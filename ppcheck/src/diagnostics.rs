//! MCMC quality metrics for fitted posteriors
//!
//! This module provides functionality to:
//! - Compute split R-hat and bulk / tail ESS per scalar parameter
//! - Summarize posterior quantiles
//! - Grade overall fit quality and surface convergence warnings

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::draws::{Param, PosteriorDraws};

/// R-hat above this flags a convergence problem
pub const RHAT_THRESHOLD: f64 = 1.01;
/// Bulk ESS below this flags a convergence problem
pub const MIN_ESS_BULK: f64 = 100.0;

/// MCMC statistics for a single parameter
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParamMcmcStats {
    pub name: String,
    pub mean: f64,
    pub sd: f64,
    pub rhat: f64,
    pub ess_bulk: f64,
    pub ess_tail: f64,
    pub q025: f64,
    pub q50: f64,
    pub q975: f64,
}

/// Summary of MCMC fit quality
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FitMcmcSummary {
    pub n_draws: usize,
    pub n_chains: usize,
    pub params: Vec<ParamMcmcStats>,
    pub overall_quality: FitQuality,
}

/// Overall fit quality assessment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FitQuality {
    pub has_convergence_issues: bool,
    pub max_rhat: f64,
    pub min_ess_bulk: f64,
    pub quality_grade: String, // "A", "B", "C", "D", "F"
}

impl FitMcmcSummary {
    pub fn param(&self, name: &str) -> Option<&ParamMcmcStats> {
        self.params.iter().find(|p| p.name == name)
    }

    /// Human-readable warnings, one per offending parameter.
    pub fn warnings(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        for p in &self.params {
            if p.rhat.is_nan() || p.rhat > RHAT_THRESHOLD {
                warnings.push(format!(
                    "{} has R-hat = {:.3} (should be < {RHAT_THRESHOLD})",
                    p.name, p.rhat
                ));
            }
            if p.ess_bulk < MIN_ESS_BULK {
                warnings.push(format!(
                    "{} has low bulk ESS = {:.0} (should be > {MIN_ESS_BULK})",
                    p.name, p.ess_bulk
                ));
            }
        }
        warnings
    }

    /// Fixed-width table in the style of CmdStan's `stansummary`.
    pub fn render_table(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!(
            "{:<12} {:>10} {:>10} {:>10} {:>10} {:>10} {:>8} {:>8} {:>8}\n",
            "Parameter", "Mean", "SD", "2.5%", "50%", "97.5%", "Rhat", "ESS_b", "ESS_t"
        ));
        out.push_str(&"-".repeat(94));
        out.push('\n');
        for p in &self.params {
            out.push_str(&format!(
                "{:<12} {:>10.4} {:>10.4} {:>10.4} {:>10.4} {:>10.4} {:>8.3} {:>8.0} {:>8.0}\n",
                p.name, p.mean, p.sd, p.q025, p.q50, p.q975, p.rhat, p.ess_bulk, p.ess_tail
            ));
        }
        out.push_str(&format!(
            "\n{} draws from {} chains, quality grade {}\n",
            self.n_draws, self.n_chains, self.overall_quality.quality_grade
        ));
        out
    }
}

/// Summarize all scalar parameters of a posterior.
///
/// Problems are logged with `tracing::warn!` and reflected in
/// [`FitQuality`]; the caller decides whether to stop.
pub fn summarize_draws(draws: &PosteriorDraws) -> FitMcmcSummary {
    let mut params = Vec::new();
    let mut max_rhat: f64 = 0.0;
    let mut min_ess_bulk = f64::INFINITY;

    for param in draws.scalar_params() {
        let stats = describe(draws, param);

        max_rhat = if stats.rhat.is_nan() { f64::INFINITY } else { max_rhat.max(stats.rhat) };
        min_ess_bulk = min_ess_bulk.min(stats.ess_bulk);
        params.push(stats);
    }
    if params.is_empty() {
        min_ess_bulk = 0.0;
    }

    let has_convergence_issues = max_rhat > RHAT_THRESHOLD || min_ess_bulk < MIN_ESS_BULK;

    let quality_grade = if !has_convergence_issues {
        "A" // Excellent
    } else if max_rhat < 1.05 && min_ess_bulk > 50.0 {
        "B" // Good
    } else if max_rhat < 1.10 && min_ess_bulk > 20.0 {
        "C" // Acceptable with caution
    } else if max_rhat < 1.20 {
        "D" // Poor
    } else {
        "F" // Failed convergence
    };

    let summary = FitMcmcSummary {
        n_draws: draws.len(),
        n_chains: draws.n_chains(),
        params,
        overall_quality: FitQuality {
            has_convergence_issues,
            max_rhat,
            min_ess_bulk,
            quality_grade: quality_grade.to_string(),
        },
    };

    for w in summary.warnings() {
        warn!("{w}");
    }
    summary
}

fn param_stats(name: &str, chains: &[Vec<f64>]) -> ParamMcmcStats {
    let flat: Vec<f64> = chains.iter().flatten().copied().collect();
    let mean = mean(&flat);
    let sd = sample_variance(&flat, mean).sqrt();
    let q = quantiles(&flat, &[0.025, 0.5, 0.975]);

    ParamMcmcStats {
        name: name.to_string(),
        mean,
        sd,
        rhat: split_rhat(chains),
        ess_bulk: ess(chains),
        ess_tail: ess_tail(chains),
        q025: q[0],
        q50: q[1],
        q975: q[2],
    }
}

fn mean(xs: &[f64]) -> f64 {
    if xs.is_empty() {
        return 0.0;
    }
    xs.iter().sum::<f64>() / xs.len() as f64
}

fn sample_variance(xs: &[f64], mean: f64) -> f64 {
    if xs.len() < 2 {
        return 0.0;
    }
    xs.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / (xs.len() - 1) as f64
}

/// Split each chain in half and trim to a common length.
fn split_chains(chains: &[Vec<f64>]) -> Vec<&[f64]> {
    let n = chains.iter().map(Vec::len).min().unwrap_or(0) / 2;
    if n == 0 {
        return Vec::new();
    }
    chains
        .iter()
        .flat_map(|c| [&c[..n], &c[n..2 * n]])
        .collect()
}

/// Pooled and within-chain variance of equally sized chains.
fn variance_components(chains: &[&[f64]]) -> (f64, f64) {
    let m = chains.len() as f64;
    let n = chains[0].len() as f64;

    let means: Vec<f64> = chains.iter().map(|c| mean(c)).collect();
    let within = chains
        .iter()
        .zip(&means)
        .map(|(c, &mu)| sample_variance(c, mu))
        .sum::<f64>()
        / m;

    let grand = mean(&means);
    let between = n * means.iter().map(|mu| (mu - grand).powi(2)).sum::<f64>() / (m - 1.0);

    let var_plus = ((n - 1.0) * within + between) / n;
    (var_plus, within)
}

/// Split R-hat (potential scale reduction factor)
pub fn split_rhat(chains: &[Vec<f64>]) -> f64 {
    let split = split_chains(chains);
    if split.len() < 2 || split[0].len() < 2 {
        return f64::NAN;
    }
    let (var_plus, within) = variance_components(&split);
    if within <= 0.0 {
        return if var_plus <= 0.0 { 1.0 } else { f64::INFINITY };
    }
    (var_plus / within).sqrt()
}

/// Autocovariance of one chain at lag `k` (biased estimator).
fn autocovariance(chain: &[f64], mu: f64, k: usize) -> f64 {
    let n = chain.len();
    (0..n - k)
        .map(|i| (chain[i] - mu) * (chain[i + k] - mu))
        .sum::<f64>()
        / n as f64
}

/// Effective sample size from split chains, truncating the autocorrelation
/// sum with Geyer's initial positive sequence.
pub fn ess(chains: &[Vec<f64>]) -> f64 {
    let split = split_chains(chains);
    if split.len() < 2 || split[0].len() < 4 {
        return 0.0;
    }
    let m = split.len();
    let n = split[0].len();
    let total = (m * n) as f64;

    let (var_plus, within) = variance_components(&split);
    if var_plus <= 0.0 || within <= 0.0 {
        return total;
    }

    let means: Vec<f64> = split.iter().map(|c| mean(c)).collect();
    let rho = |t: usize| -> f64 {
        let mean_acov = split
            .iter()
            .zip(&means)
            .map(|(c, &mu)| autocovariance(c, mu, t))
            .sum::<f64>()
            / m as f64;
        1.0 - (within - mean_acov) / var_plus
    };

    // tau = -1 + 2 * sum_k (rho_2k + rho_2k+1) while the pair sums stay positive
    let mut tau = -1.0;
    let mut t = 0;
    while t + 1 < n {
        let pair = rho(t) + rho(t + 1);
        if pair <= 0.0 {
            break;
        }
        tau += 2.0 * pair;
        t += 2;
    }

    // Antithetic chains can push tau below 1; cap ESS at N * log10(N)
    total / tau.max(1.0 / total.log10())
}

/// Tail ESS: the smaller ESS of the 5% and 95% quantile indicators.
pub fn ess_tail(chains: &[Vec<f64>]) -> f64 {
    let flat: Vec<f64> = chains.iter().flatten().copied().collect();
    if flat.is_empty() {
        return 0.0;
    }
    let q = quantiles(&flat, &[0.05, 0.95]);
    let indicator = |cut: f64| -> Vec<Vec<f64>> {
        chains
            .iter()
            .map(|c| c.iter().map(|&x| if x <= cut { 1.0 } else { 0.0 }).collect())
            .collect()
    };
    ess(&indicator(q[0])).min(ess(&indicator(q[1])))
}

/// Empirical quantiles with linear interpolation between order statistics.
pub fn quantiles(draws: &[f64], probs: &[f64]) -> Vec<f64> {
    if draws.is_empty() {
        return vec![f64::NAN; probs.len()];
    }
    let mut sorted = draws.to_vec();
    sorted.sort_by(f64::total_cmp);
    probs.iter().map(|&p| quantile_sorted(&sorted, p)).collect()
}

pub(crate) fn quantile_sorted(sorted: &[f64], p: f64) -> f64 {
    let h = p.clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
    let lo = h.floor() as usize;
    let hi = h.ceil() as usize;
    sorted[lo] + (h - lo as f64) * (sorted[hi] - sorted[lo])
}

/// Summary statistics for a single parameter column.
pub fn describe(draws: &PosteriorDraws, param: Param) -> ParamMcmcStats {
    param_stats(&param.label(), &draws.by_chain(param))
}
