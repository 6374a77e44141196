//! Posterior draw collection.
//!
//! Draws are stored as typed records rather than a name-indexed matrix, so
//! the replicate sampler can ask for "the coefficient vector of draw 17"
//! without building column names. [`PosteriorDraws::to_matrix`] produces the
//! flat matrix view (one column per scalar, vector parameters expanded as
//! `beta[1]`, `mu[1]`, ...) for export and diagnostics.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::datagen::Covariates;
use crate::error::{PpcError, Result};
use crate::model::{BETA, LAMBDA, MU, NU, RESID, SIGMA, TAU};

/// One complete parameter assignment from one retained MCMC iteration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PosteriorDraw {
    pub chain: usize,
    pub iteration: usize,
    beta: Vec<f64>,
    tau: f64,
    nu: Option<f64>,
    lambda: Option<Vec<f64>>,
    mu: Option<Vec<f64>>,
    resid: Option<Vec<f64>>,
}

impl PosteriorDraw {
    pub fn new(chain: usize, iteration: usize, beta: Vec<f64>, tau: f64) -> Self {
        Self {
            chain,
            iteration,
            beta,
            tau,
            nu: None,
            lambda: None,
            mu: None,
            resid: None,
        }
    }

    pub fn with_nu(mut self, nu: f64) -> Self {
        self.nu = Some(nu);
        self
    }

    pub fn with_lambda(mut self, lambda: Vec<f64>) -> Self {
        self.lambda = Some(lambda);
        self
    }

    pub fn with_mu(mut self, mu: Vec<f64>) -> Self {
        self.mu = Some(mu);
        self
    }

    pub fn with_resid(mut self, resid: Vec<f64>) -> Self {
        self.resid = Some(resid);
        self
    }

    pub fn beta(&self) -> &[f64] {
        &self.beta
    }

    pub fn tau(&self) -> f64 {
        self.tau
    }

    /// Residual scale `1 / sqrt(tau)`.
    pub fn sigma(&self) -> f64 {
        1.0 / self.tau.sqrt()
    }

    pub fn nu(&self) -> Option<f64> {
        self.nu
    }

    pub fn lambda(&self) -> Option<&[f64]> {
        self.lambda.as_deref()
    }

    pub fn mu(&self) -> Option<&[f64]> {
        self.mu.as_deref()
    }

    pub fn resid(&self) -> Option<&[f64]> {
        self.resid.as_deref()
    }

    /// Per-observation mean of this draw: the monitored `mu` when present,
    /// otherwise `X * beta` computed from this draw's own coefficients.
    pub fn mean_vector(&self, covariates: &Covariates) -> Result<Vec<f64>> {
        match &self.mu {
            Some(mu) if mu.len() == covariates.n_obs() => Ok(mu.clone()),
            Some(mu) => Err(PpcError::DimensionMismatch {
                expected: format!("{} observations", covariates.n_obs()),
                actual: format!("mu of length {}", mu.len()),
            }),
            None => covariates.linear_predictor(&self.beta),
        }
    }

    fn is_finite(&self) -> bool {
        let vec_ok = |v: &Option<Vec<f64>>| v.as_ref().map_or(true, |v| v.iter().all(|x| x.is_finite()));
        self.beta.iter().all(|b| b.is_finite())
            && self.tau.is_finite()
            && self.nu.map_or(true, f64::is_finite)
            && vec_ok(&self.lambda)
            && vec_ok(&self.mu)
            && vec_ok(&self.resid)
    }
}

/// Scalar parameter selector for column access
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Param {
    /// Coefficient by zero-based index
    Beta(usize),
    Tau,
    Sigma,
    Nu,
}

impl Param {
    pub fn label(&self) -> String {
        match self {
            Param::Beta(j) => format!("{BETA}[{}]", j + 1),
            Param::Tau => TAU.to_string(),
            Param::Sigma => SIGMA.to_string(),
            Param::Nu => NU.to_string(),
        }
    }

    fn value(&self, draw: &PosteriorDraw) -> Option<f64> {
        match *self {
            Param::Beta(j) => draw.beta.get(j).copied(),
            Param::Tau => Some(draw.tau),
            Param::Sigma => Some(draw.sigma()),
            Param::Nu => draw.nu,
        }
    }
}

/// Ordered collection of retained draws across all chains
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PosteriorDraws {
    n_chains: usize,
    draws: Vec<PosteriorDraw>,
}

impl PosteriorDraws {
    /// Collect draws; every draw must have the same number of coefficients,
    /// the same optional parameters and only finite values.
    pub fn new(draws: Vec<PosteriorDraw>) -> Result<Self> {
        if let Some(first) = draws.first() {
            let p = first.beta.len();
            for d in &draws {
                if d.beta.len() != p {
                    return Err(PpcError::DimensionMismatch {
                        expected: format!("{p} coefficients"),
                        actual: format!(
                            "{} coefficients in chain {} iteration {}",
                            d.beta.len(),
                            d.chain,
                            d.iteration
                        ),
                    });
                }
                if d.nu.is_some() != first.nu.is_some() {
                    return Err(PpcError::InvalidModel(
                        "draws disagree on presence of 'nu'".to_string(),
                    ));
                }
                let vectors = [
                    (LAMBDA, &first.lambda, &d.lambda),
                    (MU, &first.mu, &d.mu),
                    (RESID, &first.resid, &d.resid),
                ];
                for (name, expected, actual) in vectors {
                    match (expected, actual) {
                        (None, None) => {}
                        (Some(e), Some(a)) if e.len() == a.len() => {}
                        (Some(e), Some(a)) => {
                            return Err(PpcError::DimensionMismatch {
                                expected: format!("{} values of '{name}'", e.len()),
                                actual: format!(
                                    "{} in chain {} iteration {}",
                                    a.len(),
                                    d.chain,
                                    d.iteration
                                ),
                            });
                        }
                        _ => {
                            return Err(PpcError::InvalidModel(format!(
                                "draws disagree on presence of '{name}'"
                            )));
                        }
                    }
                }
                if !d.is_finite() {
                    return Err(PpcError::Divergence {
                        chain: d.chain,
                        iteration: d.iteration,
                        detail: "non-finite parameter value".to_string(),
                    });
                }
            }
        }
        let n_chains = draws.iter().map(|d| d.chain + 1).max().unwrap_or(0);
        Ok(Self { n_chains, draws })
    }

    pub fn len(&self) -> usize {
        self.draws.len()
    }

    pub fn is_empty(&self) -> bool {
        self.draws.is_empty()
    }

    pub fn n_chains(&self) -> usize {
        self.n_chains
    }

    pub fn get(&self, idx: usize) -> Option<&PosteriorDraw> {
        self.draws.get(idx)
    }

    pub fn iter(&self) -> impl Iterator<Item = &PosteriorDraw> {
        self.draws.iter()
    }

    pub fn n_coef(&self) -> usize {
        self.draws.first().map_or(0, |d| d.beta.len())
    }

    pub fn has_nu(&self) -> bool {
        self.draws.first().is_some_and(|d| d.nu.is_some())
    }

    /// All retained values of a scalar parameter, in storage order.
    pub fn column(&self, param: Param) -> Vec<f64> {
        self.draws.iter().filter_map(|d| param.value(d)).collect()
    }

    /// Values of a scalar parameter split by chain.
    pub fn by_chain(&self, param: Param) -> Vec<Vec<f64>> {
        let mut chains = vec![Vec::new(); self.n_chains];
        for d in &self.draws {
            if let Some(v) = param.value(d) {
                chains[d.chain].push(v);
            }
        }
        chains
    }

    pub fn mean(&self, param: Param) -> Option<f64> {
        let col = self.column(param);
        if col.is_empty() {
            None
        } else {
            Some(col.iter().sum::<f64>() / col.len() as f64)
        }
    }

    /// Posterior mean of the coefficient vector.
    pub fn beta_mean(&self) -> Vec<f64> {
        (0..self.n_coef())
            .filter_map(|j| self.mean(Param::Beta(j)))
            .collect()
    }

    /// Scalar parameters present in every draw.
    pub fn scalar_params(&self) -> Vec<Param> {
        let mut params: Vec<Param> = (0..self.n_coef()).map(Param::Beta).collect();
        params.extend([Param::Tau, Param::Sigma]);
        if self.has_nu() {
            params.push(Param::Nu);
        }
        params
    }

    /// Flat matrix view: one row per retained iteration, one column per
    /// scalar, vector parameters expanded one column per index.
    pub fn to_matrix(&self) -> DrawMatrix {
        let Some(first) = self.draws.first() else {
            return DrawMatrix::default();
        };

        let mut columns: Vec<String> = (1..=first.beta.len()).map(|j| format!("{BETA}[{j}]")).collect();
        columns.push(TAU.to_string());
        columns.push(SIGMA.to_string());
        if first.nu.is_some() {
            columns.push(NU.to_string());
        }
        let vector_params = [
            (LAMBDA, first.lambda.as_ref().map(Vec::len)),
            (MU, first.mu.as_ref().map(Vec::len)),
            (RESID, first.resid.as_ref().map(Vec::len)),
        ];
        for (name, len) in vector_params {
            if let Some(len) = len {
                columns.extend((1..=len).map(|i| format!("{name}[{i}]")));
            }
        }

        let rows = self
            .draws
            .iter()
            .map(|d| {
                let mut row = d.beta.clone();
                row.push(d.tau);
                row.push(d.sigma());
                if let Some(nu) = d.nu {
                    row.push(nu);
                }
                for v in [&d.lambda, &d.mu, &d.resid].into_iter().flatten() {
                    row.extend_from_slice(v);
                }
                row
            })
            .collect();

        DrawMatrix { columns, rows }
    }
}

/// Row-per-iteration matrix of posterior draws with named columns
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DrawMatrix {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<f64>>,
}

impl DrawMatrix {
    pub fn n_rows(&self) -> usize {
        self.rows.len()
    }

    pub fn n_cols(&self) -> usize {
        self.columns.len()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    pub fn write_csv(&self, path: &Path) -> Result<()> {
        let file = File::create(path)
            .map_err(|e| PpcError::io(format!("cannot create {}", path.display()), e))?;
        let mut out = BufWriter::new(file);
        let io_err = |e: std::io::Error| PpcError::io("write draws", e);

        writeln!(out, "{}", self.columns.join(",")).map_err(io_err)?;
        for row in &self.rows {
            let line: Vec<String> = row.iter().map(|v| format!("{v:.9}")).collect();
            writeln!(out, "{}", line.join(",")).map_err(io_err)?;
        }
        out.flush().map_err(io_err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_draws() -> PosteriorDraws {
        let draws = (0..6)
            .map(|i| {
                PosteriorDraw::new(i % 2, i / 2, vec![3.0 + i as f64 * 0.1, 1.0, -0.5], 4.0)
                    .with_nu(3.0 + i as f64)
            })
            .collect();
        PosteriorDraws::new(draws).unwrap()
    }

    #[test]
    fn test_typed_accessors() {
        let draws = sample_draws();
        assert_eq!(draws.len(), 6);
        assert_eq!(draws.n_chains(), 2);
        assert_eq!(draws.n_coef(), 3);
        assert!(draws.has_nu());

        let d = draws.get(0).unwrap();
        assert!((d.sigma() - 0.5).abs() < 1e-12);
        assert_eq!(d.nu(), Some(3.0));

        let nu_mean = draws.mean(Param::Nu).unwrap();
        assert!((nu_mean - 5.5).abs() < 1e-12);

        let chains = draws.by_chain(Param::Beta(0));
        assert_eq!(chains.len(), 2);
        assert_eq!(chains[0].len(), 3);
    }

    #[test]
    fn test_matrix_expands_vector_params() {
        let draws = PosteriorDraws::new(vec![PosteriorDraw::new(0, 0, vec![1.0, 2.0], 1.0)
            .with_mu(vec![0.1, 0.2, 0.3])
            .with_resid(vec![-0.1, 0.0, 0.1])])
        .unwrap();

        let m = draws.to_matrix();
        assert_eq!(
            m.columns,
            vec!["beta[1]", "beta[2]", "tau", "sigma", "mu[1]", "mu[2]", "mu[3]", "resid[1]", "resid[2]", "resid[3]"]
        );
        assert_eq!(m.n_rows(), 1);
        assert_eq!(m.rows[0].len(), m.n_cols());
        assert_eq!(m.rows[0][m.column_index("mu[2]").unwrap()], 0.2);
    }

    #[test]
    fn test_non_finite_draw_is_divergence() {
        let bad = PosteriorDraw::new(1, 7, vec![f64::NAN, 1.0], 1.0);
        let err = PosteriorDraws::new(vec![bad]).unwrap_err();
        assert!(matches!(
            err,
            PpcError::Divergence {
                chain: 1,
                iteration: 7,
                ..
            }
        ));
    }

    #[test]
    fn test_inconsistent_draws_rejected() {
        let a = PosteriorDraw::new(0, 0, vec![1.0, 2.0], 1.0);
        let b = PosteriorDraw::new(0, 1, vec![1.0], 1.0);
        assert!(PosteriorDraws::new(vec![a, b]).is_err());
    }

    #[test]
    fn test_inconsistent_vector_params_rejected() {
        let with_mu = PosteriorDraw::new(0, 0, vec![1.0, 2.0], 1.0).with_mu(vec![0.1, 0.2, 0.3]);
        let without_mu = PosteriorDraw::new(0, 1, vec![1.0, 2.0], 1.0);
        let err = PosteriorDraws::new(vec![with_mu.clone(), without_mu]).unwrap_err();
        assert!(matches!(err, PpcError::InvalidModel(ref m) if m.contains("'mu'")));

        let short_mu = PosteriorDraw::new(1, 0, vec![1.0, 2.0], 1.0).with_mu(vec![0.1, 0.2]);
        let err = PosteriorDraws::new(vec![with_mu.clone(), short_mu]).unwrap_err();
        assert!(matches!(err, PpcError::DimensionMismatch { .. }));

        let with_lambda = PosteriorDraw::new(0, 1, vec![1.0, 2.0], 1.0)
            .with_mu(vec![0.1, 0.2, 0.3])
            .with_lambda(vec![1.0, 1.0, 1.0]);
        let err = PosteriorDraws::new(vec![with_mu.clone(), with_lambda]).unwrap_err();
        assert!(matches!(err, PpcError::InvalidModel(ref m) if m.contains("'lambda'")));

        let same = PosteriorDraw::new(0, 1, vec![1.0, 2.0], 1.0).with_mu(vec![0.4, 0.5, 0.6]);
        let draws = PosteriorDraws::new(vec![with_mu, same]).unwrap();
        let m = draws.to_matrix();
        assert!(m.rows.iter().all(|row| row.len() == m.n_cols()));
    }

    #[test]
    fn test_mean_vector_prefers_monitored_mu() {
        let cov = Covariates::new(vec!["x".to_string()], vec![vec![1.0, 2.0]]).unwrap();

        let d = PosteriorDraw::new(0, 0, vec![1.0, 1.0], 1.0);
        assert_eq!(d.mean_vector(&cov).unwrap(), vec![2.0, 3.0]);

        let d = d.with_mu(vec![9.0, 9.0]);
        assert_eq!(d.mean_vector(&cov).unwrap(), vec![9.0, 9.0]);

        let d = PosteriorDraw::new(0, 0, vec![1.0, 1.0], 1.0).with_mu(vec![1.0]);
        assert!(d.mean_vector(&cov).is_err());
    }

    #[test]
    fn test_write_csv() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("draws.csv");
        sample_draws().to_matrix().write_csv(&path).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let mut lines = content.lines();
        assert_eq!(lines.next().unwrap(), "beta[1],beta[2],beta[3],tau,sigma,nu");
        assert_eq!(lines.count(), 6);
    }
}
