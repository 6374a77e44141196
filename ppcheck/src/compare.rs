//! Observed-versus-simulated comparison
//!
//! Terminal step of a posterior predictive check. The replicate matrix and
//! the observed response are reshaped into a long table tagged `Observed` /
//! `Simulated`, summarised as overlaid kernel densities and boxplots, and
//! checked quantitatively on the tails and on a handful of test statistics.
//!
//! An empty replicate set is valid input: the comparison then carries only
//! the observed series.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::diagnostics::{quantile_sorted, quantiles};
use crate::error::{PpcError, Result};
use crate::ppc::ReplicateMatrix;

/// Number of grid points for density estimates
pub const DENSITY_GRID_POINTS: usize = 64;

const PLOT_HEIGHT: usize = 12;

/// Whether a value comes from the data or from the model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Source {
    Observed,
    Simulated,
}

impl Source {
    pub fn label(&self) -> &'static str {
        match self {
            Source::Observed => "Observed",
            Source::Simulated => "Simulated",
        }
    }
}

/// Closed interval restricting which values enter the visual comparison
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ValueRange {
    pub lower: f64,
    pub upper: f64,
}

impl ValueRange {
    pub fn new(lower: f64, upper: f64) -> Result<Self> {
        let range = Self { lower, upper };
        range.validate()?;
        Ok(range)
    }

    /// `[-limit, limit]`
    pub fn symmetric(limit: f64) -> Result<Self> {
        Self::new(-limit, limit)
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.lower.is_finite() && self.upper.is_finite() && self.lower < self.upper) {
            return Err(PpcError::invalid(
                "value_range",
                format!("[{}, {}]", self.lower, self.upper),
                "bounds must be finite with lower < upper",
            ));
        }
        Ok(())
    }

    pub fn contains(&self, v: f64) -> bool {
        v >= self.lower && v <= self.upper
    }
}

/// One value of the long-form table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LongRow {
    pub source: Source,
    /// `observed`, or `draw_<index>` for the replicate's posterior draw
    pub series: String,
    pub value: f64,
}

/// Long-form table of observed and simulated values
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LongTable {
    rows: Vec<LongRow>,
    n_excluded: usize,
}

fn check_observed_len(observed: &[f64], replicates: &ReplicateMatrix) -> Result<()> {
    if !replicates.is_empty() && observed.len() != replicates.n_rows() {
        return Err(PpcError::DimensionMismatch {
            expected: format!("{} observations", replicates.n_rows()),
            actual: format!("{} observations", observed.len()),
        });
    }
    Ok(())
}

impl LongTable {
    /// Tag every value by source. Values outside `range` are dropped and
    /// counted.
    pub fn build(observed: &[f64], replicates: &ReplicateMatrix, range: Option<ValueRange>) -> Result<Self> {
        check_observed_len(observed, replicates)?;

        let keep = |v: &f64| range.map_or(true, |r| r.contains(*v));
        let mut rows = Vec::with_capacity(observed.len() * (replicates.n_cols() + 1));
        let mut n_excluded = 0;

        let observed_rows = observed.iter().map(|v| (Source::Observed, "observed".to_string(), *v));
        let simulated_rows = replicates.replicates().iter().flat_map(|r| {
            let series = format!("draw_{}", r.draw_index);
            r.values
                .iter()
                .map(move |v| (Source::Simulated, series.clone(), *v))
        });

        for (source, series, value) in observed_rows.chain(simulated_rows) {
            if keep(&value) {
                rows.push(LongRow { source, series, value });
            } else {
                n_excluded += 1;
            }
        }

        Ok(Self { rows, n_excluded })
    }

    pub fn rows(&self) -> &[LongRow] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Values dropped by the range filter
    pub fn n_excluded(&self) -> usize {
        self.n_excluded
    }

    pub fn values(&self, source: Source) -> Vec<f64> {
        self.rows
            .iter()
            .filter(|r| r.source == source)
            .map(|r| r.value)
            .collect()
    }

    /// Simulated series names in first-seen order.
    pub fn simulated_series(&self) -> Vec<&str> {
        let mut names: Vec<&str> = Vec::new();
        for r in self.rows.iter().filter(|r| r.source == Source::Simulated) {
            if names.last() != Some(&r.series.as_str()) {
                names.push(&r.series);
            }
        }
        names
    }

    pub fn series_values(&self, series: &str) -> Vec<f64> {
        self.rows
            .iter()
            .filter(|r| r.series == series)
            .map(|r| r.value)
            .collect()
    }

    /// `source,series,value` CSV for external plotting.
    pub fn write_csv(&self, path: &Path) -> Result<()> {
        let file = File::create(path)
            .map_err(|e| PpcError::io(format!("cannot create {}", path.display()), e))?;
        let mut out = BufWriter::new(file);
        let io_err = |e: std::io::Error| PpcError::io("write long table", e);

        writeln!(out, "source,series,value").map_err(io_err)?;
        for r in &self.rows {
            writeln!(out, "{},{},{:.9}", r.source.label(), r.series, r.value).map_err(io_err)?;
        }
        out.flush().map_err(io_err)
    }
}

/// Silverman's rule of thumb, `0.9 * min(sd, IQR/1.34) * n^(-1/5)`.
///
/// Falls back to whichever spread is non-zero, then to `|x_0|`, then to 1,
/// so constant data still yields a usable bandwidth.
pub fn silverman_bandwidth(values: &[f64]) -> f64 {
    let n = values.len();
    if n < 2 {
        return 1.0;
    }
    let sd = sample_sd(values);
    let q = quantiles(values, &[0.25, 0.75]);
    let iqr_scale = (q[1] - q[0]) / 1.34;

    let mut spread = sd.min(iqr_scale);
    if spread <= 0.0 {
        spread = sd.max(iqr_scale);
    }
    if spread <= 0.0 {
        spread = values[0].abs();
    }
    if spread <= 0.0 {
        spread = 1.0;
    }
    0.9 * spread * (n as f64).powf(-0.2)
}

/// Evenly spaced grid covering every series, padded by 5% on each side.
pub fn shared_grid<'a>(series: impl IntoIterator<Item = &'a [f64]>, n_points: usize) -> Vec<f64> {
    let (lo, hi) = series
        .into_iter()
        .flat_map(|s| s.iter().copied())
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| (lo.min(v), hi.max(v)));
    if !lo.is_finite() || n_points == 0 {
        return Vec::new();
    }
    let pad = if hi > lo { 0.05 * (hi - lo) } else { 1.0 };
    let (lo, hi) = (lo - pad, hi + pad);
    if n_points == 1 {
        return vec![(lo + hi) / 2.0];
    }
    let step = (hi - lo) / (n_points - 1) as f64;
    (0..n_points).map(|i| lo + step * i as f64).collect()
}

/// Gaussian kernel density evaluated on a grid
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DensityEstimate {
    pub label: String,
    pub bandwidth: f64,
    pub grid: Vec<f64>,
    pub density: Vec<f64>,
}

impl DensityEstimate {
    /// KDE of `values` with Silverman bandwidth; `None` for empty input.
    pub fn gaussian(label: &str, values: &[f64], grid: &[f64]) -> Option<Self> {
        if values.is_empty() || grid.is_empty() {
            return None;
        }
        let h = silverman_bandwidth(values);
        let norm = 1.0 / (values.len() as f64 * h * (2.0 * std::f64::consts::PI).sqrt());
        let density = grid
            .iter()
            .map(|&g| {
                values
                    .iter()
                    .map(|&v| {
                        let u = (g - v) / h;
                        (-0.5 * u * u).exp()
                    })
                    .sum::<f64>()
                    * norm
            })
            .collect();

        Some(Self {
            label: label.to_string(),
            bandwidth: h,
            grid: grid.to_vec(),
            density,
        })
    }

    /// Pointwise average of densities sharing one grid.
    pub fn pointwise_mean(label: &str, estimates: &[DensityEstimate]) -> Option<Self> {
        let first = estimates.first()?;
        let mut density = vec![0.0; first.grid.len()];
        for est in estimates {
            for (acc, d) in density.iter_mut().zip(&est.density) {
                *acc += d;
            }
        }
        let k = estimates.len() as f64;
        density.iter_mut().for_each(|d| *d /= k);
        let bandwidth = estimates.iter().map(|e| e.bandwidth).sum::<f64>() / k;

        Some(Self {
            label: label.to_string(),
            bandwidth,
            grid: first.grid.clone(),
            density,
        })
    }

    pub fn max_density(&self) -> f64 {
        self.density.iter().copied().fold(0.0, f64::max)
    }
}

/// Tukey boxplot summary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoxplotStats {
    pub label: String,
    pub n: usize,
    pub min: f64,
    pub q1: f64,
    pub median: f64,
    pub q3: f64,
    pub max: f64,
    /// Most extreme values within 1.5 IQR of the box
    pub lower_whisker: f64,
    pub upper_whisker: f64,
    pub n_outliers: usize,
}

impl BoxplotStats {
    pub fn from_values(label: &str, values: &[f64]) -> Option<Self> {
        if values.is_empty() {
            return None;
        }
        let mut sorted = values.to_vec();
        sorted.sort_by(f64::total_cmp);

        let q1 = quantile_sorted(&sorted, 0.25);
        let median = quantile_sorted(&sorted, 0.5);
        let q3 = quantile_sorted(&sorted, 0.75);
        let iqr = q3 - q1;
        let (lo_fence, hi_fence) = (q1 - 1.5 * iqr, q3 + 1.5 * iqr);

        let lower_whisker = sorted.iter().copied().find(|&v| v >= lo_fence).unwrap_or(q1);
        let upper_whisker = sorted.iter().rev().copied().find(|&v| v <= hi_fence).unwrap_or(q3);
        let n_outliers = sorted.iter().filter(|&&v| v < lo_fence || v > hi_fence).count();

        Some(Self {
            label: label.to_string(),
            n: sorted.len(),
            min: sorted[0],
            q1,
            median,
            q3,
            max: sorted[sorted.len() - 1],
            lower_whisker,
            upper_whisker,
            n_outliers,
        })
    }

    pub fn iqr(&self) -> f64 {
        self.q3 - self.q1
    }
}

/// Tail comparison of absolute residuals.
///
/// For every replicate the observed residual `|y - mu_d|` and the simulated
/// residual `|y_rep - mu_d|` use the mean vector of the draw `d` that
/// produced it; both sets are pooled over replicates before taking the
/// quantile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TailCheck {
    pub quantile: f64,
    pub observed: f64,
    pub simulated: f64,
    /// `observed - simulated`; positive when simulated tails are too thin
    pub gap: f64,
    /// `simulated / observed`
    pub ratio: f64,
    /// Share of replicates whose own quantile reaches the observed one
    pub p_value: f64,
    pub n_replicates: usize,
}

impl TailCheck {
    /// `None` when there are no replicates.
    pub fn compute(observed: &[f64], replicates: &ReplicateMatrix, q: f64) -> Result<Option<Self>> {
        if !(q > 0.0 && q < 1.0) {
            return Err(PpcError::invalid("tail_quantile", q, "must lie in (0, 1)"));
        }
        check_observed_len(observed, replicates)?;
        if replicates.is_empty() {
            return Ok(None);
        }

        let mut obs_abs = Vec::with_capacity(observed.len() * replicates.n_cols());
        let mut sim_abs = Vec::with_capacity(obs_abs.capacity());
        let mut exceed = 0usize;

        for rep in replicates.replicates() {
            let o: Vec<f64> = observed.iter().zip(&rep.mean).map(|(y, m)| (y - m).abs()).collect();
            let s: Vec<f64> = rep.residuals().iter().map(|r| r.abs()).collect();
            if quantiles(&s, &[q])[0] >= quantiles(&o, &[q])[0] {
                exceed += 1;
            }
            obs_abs.extend(o);
            sim_abs.extend(s);
        }

        let observed_q = quantiles(&obs_abs, &[q])[0];
        let simulated_q = quantiles(&sim_abs, &[q])[0];
        let ratio = if observed_q > 0.0 {
            simulated_q / observed_q
        } else {
            f64::NAN
        };

        Ok(Some(Self {
            quantile: q,
            observed: observed_q,
            simulated: simulated_q,
            gap: observed_q - simulated_q,
            ratio,
            p_value: exceed as f64 / replicates.n_cols() as f64,
            n_replicates: replicates.n_cols(),
        }))
    }
}

/// Test statistic `T(y)` for a Bayesian p-value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestStatistic {
    Mean,
    Sd,
    Min,
    Max,
    /// 99th percentile of `|y|`
    AbsQ99,
}

impl TestStatistic {
    pub const ALL: [TestStatistic; 5] = [
        TestStatistic::Mean,
        TestStatistic::Sd,
        TestStatistic::Min,
        TestStatistic::Max,
        TestStatistic::AbsQ99,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            TestStatistic::Mean => "mean",
            TestStatistic::Sd => "sd",
            TestStatistic::Min => "min",
            TestStatistic::Max => "max",
            TestStatistic::AbsQ99 => "q99|y|",
        }
    }

    pub fn compute(&self, values: &[f64]) -> f64 {
        if values.is_empty() {
            return f64::NAN;
        }
        match self {
            TestStatistic::Mean => values.iter().sum::<f64>() / values.len() as f64,
            TestStatistic::Sd => sample_sd(values),
            TestStatistic::Min => values.iter().copied().fold(f64::INFINITY, f64::min),
            TestStatistic::Max => values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
            TestStatistic::AbsQ99 => {
                let abs: Vec<f64> = values.iter().map(|v| v.abs()).collect();
                quantiles(&abs, &[0.99])[0]
            }
        }
    }
}

/// Observed statistic against its posterior predictive distribution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatCheck {
    pub statistic: TestStatistic,
    pub obs_value: f64,
    pub pred_mean: f64,
    pub pred_sd: f64,
    pub pred_p05: f64,
    pub pred_p50: f64,
    pub pred_p95: f64,
    pub in_credible_interval: bool, // obs_value in [p05, p95]
    /// `P(T(y_rep) >= T(y))`
    pub p_value: f64,
}

/// Bayesian p-value of `stat`; `None` when there are no replicates.
pub fn summary_statistic_ppc(
    stat: TestStatistic,
    observed: &[f64],
    replicates: &ReplicateMatrix,
) -> Option<StatCheck> {
    if replicates.is_empty() {
        return None;
    }
    let obs_value = stat.compute(observed);
    let pred: Vec<f64> = replicates
        .replicates()
        .iter()
        .map(|r| stat.compute(&r.values))
        .collect();

    let pred_mean = pred.iter().sum::<f64>() / pred.len() as f64;
    let q = quantiles(&pred, &[0.05, 0.5, 0.95]);
    let p_value = pred.iter().filter(|&&t| t >= obs_value).count() as f64 / pred.len() as f64;

    Some(StatCheck {
        statistic: stat,
        obs_value,
        pred_mean,
        pred_sd: sample_sd(&pred),
        pred_p05: q[0],
        pred_p50: q[1],
        pred_p95: q[2],
        in_credible_interval: obs_value >= q[0] && obs_value <= q[2],
        p_value,
    })
}

/// Everything a posterior predictive check reports for one model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PpcComparison {
    pub model_name: String,
    pub n_obs: usize,
    pub n_replicates: usize,
    pub draw_indices: Vec<usize>,
    pub range: Option<ValueRange>,
    pub n_excluded: usize,
    pub observed_box: Option<BoxplotStats>,
    pub simulated_box: Option<BoxplotStats>,
    pub observed_density: Option<DensityEstimate>,
    /// Pointwise mean of the per-replicate densities
    pub simulated_density: Option<DensityEstimate>,
    pub replicate_densities: Vec<DensityEstimate>,
    pub tail: Option<TailCheck>,
    pub statistics: Vec<StatCheck>,
}

impl PpcComparison {
    pub fn build(
        model_name: &str,
        observed: &[f64],
        replicates: &ReplicateMatrix,
        range: Option<ValueRange>,
        tail_quantile: f64,
    ) -> Result<Self> {
        if let Some(r) = range {
            r.validate()?;
        }
        let table = LongTable::build(observed, replicates, range)?;

        let observed_shown = table.values(Source::Observed);
        let series: Vec<Vec<f64>> = table
            .simulated_series()
            .into_iter()
            .map(|s| table.series_values(s))
            .collect();

        let grid = shared_grid(
            std::iter::once(observed_shown.as_slice()).chain(series.iter().map(Vec::as_slice)),
            DENSITY_GRID_POINTS,
        );
        let observed_density = DensityEstimate::gaussian("Observed", &observed_shown, &grid);
        let replicate_densities: Vec<DensityEstimate> = table
            .simulated_series()
            .into_iter()
            .zip(&series)
            .filter_map(|(name, values)| DensityEstimate::gaussian(name, values, &grid))
            .collect();
        let simulated_density = DensityEstimate::pointwise_mean("Simulated", &replicate_densities);

        let statistics = TestStatistic::ALL
            .iter()
            .filter_map(|&s| summary_statistic_ppc(s, observed, replicates))
            .collect();

        Ok(Self {
            model_name: model_name.to_string(),
            n_obs: observed.len(),
            n_replicates: replicates.n_cols(),
            draw_indices: replicates.draw_indices(),
            range,
            n_excluded: table.n_excluded(),
            observed_box: BoxplotStats::from_values("Observed", &observed_shown),
            simulated_box: BoxplotStats::from_values("Simulated", &table.values(Source::Simulated)),
            observed_density,
            simulated_density,
            replicate_densities,
            tail: TailCheck::compute(observed, replicates, tail_quantile)?,
            statistics,
        })
    }

    /// Overlaid density chart, boxplot table, tail check and p-values.
    pub fn render_text(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!("=== Posterior predictive check: {} ===\n", self.model_name));
        out.push_str(&format!(
            "{} observations, {} simulated replicates",
            self.n_obs, self.n_replicates
        ));
        if let Some(r) = self.range {
            out.push_str(&format!(
                ", range [{}, {}] ({} values excluded)",
                r.lower, r.upper, self.n_excluded
            ));
        }
        out.push('\n');
        if self.n_replicates == 0 {
            out.push_str("no simulated replicates; showing observed data only\n");
        }

        out.push_str("\nDensity (o = observed, * = simulated, # = both)\n");
        out.push_str(&self.render_density());

        out.push_str(&format!(
            "\n{:<10} {:>8} {:>10} {:>10} {:>10} {:>10} {:>10} {:>9}\n",
            "Source", "N", "Whisk_lo", "Q1", "Median", "Q3", "Whisk_hi", "Outliers"
        ));
        for b in self.observed_box.iter().chain(&self.simulated_box) {
            out.push_str(&format!(
                "{:<10} {:>8} {:>10.3} {:>10.3} {:>10.3} {:>10.3} {:>10.3} {:>9}\n",
                b.label, b.n, b.lower_whisker, b.q1, b.median, b.q3, b.upper_whisker, b.n_outliers
            ));
        }

        if let Some(t) = &self.tail {
            out.push_str(&format!(
                "\nTail check, q{:.0} of |residual|: observed {:.3}, simulated {:.3}, gap {:.3}, ratio {:.3}, p = {:.2}\n",
                t.quantile * 100.0,
                t.observed,
                t.simulated,
                t.gap,
                t.ratio,
                t.p_value
            ));
        }

        if !self.statistics.is_empty() {
            out.push_str(&format!(
                "\n{:<8} {:>10} {:>10} {:>10} {:>10} {:>8}\n",
                "Stat", "T(y)", "5%", "50%", "95%", "p"
            ));
            for s in &self.statistics {
                out.push_str(&format!(
                    "{:<8} {:>10.3} {:>10.3} {:>10.3} {:>10.3} {:>8.2}{}\n",
                    s.statistic.name(),
                    s.obs_value,
                    s.pred_p05,
                    s.pred_p50,
                    s.pred_p95,
                    s.p_value,
                    if s.in_credible_interval { "" } else { "  !" }
                ));
            }
        }
        out
    }

    fn render_density(&self) -> String {
        let Some(obs) = &self.observed_density else {
            return "(no observed values in range)\n".to_string();
        };
        let sim = self.simulated_density.as_ref();
        let peak = obs
            .max_density()
            .max(sim.map_or(0.0, DensityEstimate::max_density));
        if peak <= 0.0 {
            return String::new();
        }

        let mut out = String::new();
        for level in (1..=PLOT_HEIGHT).rev() {
            let cut = peak * (level as f64 - 0.5) / PLOT_HEIGHT as f64;
            out.push('|');
            for (i, &o) in obs.density.iter().enumerate() {
                let s = sim.map_or(0.0, |d| d.density[i]);
                out.push(match (o >= cut, s >= cut) {
                    (true, true) => '#',
                    (true, false) => 'o',
                    (false, true) => '*',
                    (false, false) => ' ',
                });
            }
            out.push('\n');
        }
        out.push('+');
        out.push_str(&"-".repeat(obs.grid.len()));
        out.push('\n');
        if let (Some(lo), Some(hi)) = (obs.grid.first(), obs.grid.last()) {
            let left = format!("{lo:.2}");
            let right = format!("{hi:.2}");
            let gap = (obs.grid.len() + 1).saturating_sub(left.len() + right.len());
            out.push_str(&format!("{left}{}{right}\n", " ".repeat(gap)));
        }
        out
    }
}

fn sample_sd(values: &[f64]) -> f64 {
    let n = values.len();
    if n < 2 {
        return 0.0;
    }
    let mean = values.iter().sum::<f64>() / n as f64;
    (values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1) as f64).sqrt()
}
