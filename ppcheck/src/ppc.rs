//! Posterior predictive replicate simulation
//!
//! Draw `k` posterior samples uniformly without replacement and generate one
//! synthetic response vector from each. Every replicate is built from a
//! single draw record: its mean vector, its scale and (for Student-t) its
//! degrees of freedom. Point estimates are never substituted for the mean or
//! scale, since that would collapse the posterior uncertainty the check is
//! supposed to expose.

use rand::seq::index;
use rand::Rng;
use rand_distr::{Distribution, StandardNormal};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::datagen::{gamma_rate, Covariates};
use crate::draws::{Param, PosteriorDraw, PosteriorDraws};
use crate::engine::PosteriorFit;
use crate::error::{ensure_positive, PpcError, Result};
use crate::model::Likelihood;

/// Where Student-t replicates take their degrees of freedom from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DfPolicy {
    /// The selected draw's own `nu`
    #[default]
    PerDraw,
    /// Posterior mean of `nu` across all draws (plug-in)
    PosteriorMean,
}

/// Replicate simulation settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicateConfig {
    /// Number of posterior draws to simulate from
    pub n_replicates: usize,
    pub df_policy: DfPolicy,
}

impl Default for ReplicateConfig {
    fn default() -> Self {
        Self {
            n_replicates: 50,
            df_policy: DfPolicy::PerDraw,
        }
    }
}

/// One simulated response vector and the draw it came from
#[derive(Debug, Clone, PartialEq)]
pub struct Replicate {
    pub draw_index: usize,
    pub sigma: f64,
    pub nu: Option<f64>,
    /// Mean vector of the generating draw
    pub mean: Vec<f64>,
    pub values: Vec<f64>,
}

impl Replicate {
    /// `y_rep - mu` for the generating draw.
    pub fn residuals(&self) -> Vec<f64> {
        self.values.iter().zip(&self.mean).map(|(y, m)| y - m).collect()
    }
}

/// `n` rows × `k` columns of simulated responses; column `j` is replicate `j`
#[derive(Debug, Clone, PartialEq)]
pub struct ReplicateMatrix {
    n_obs: usize,
    replicates: Vec<Replicate>,
}

impl ReplicateMatrix {
    pub fn empty(n_obs: usize) -> Self {
        Self {
            n_obs,
            replicates: Vec::new(),
        }
    }

    /// Assemble from precomputed replicates; every column must hold `n_obs`
    /// values and a mean vector of the same length.
    pub fn from_replicates(n_obs: usize, replicates: Vec<Replicate>) -> Result<Self> {
        if let Some(bad) = replicates
            .iter()
            .find(|r| r.values.len() != n_obs || r.mean.len() != n_obs)
        {
            return Err(PpcError::DimensionMismatch {
                expected: format!("{n_obs} values per replicate"),
                actual: format!(
                    "{} values and {} means for draw {}",
                    bad.values.len(),
                    bad.mean.len(),
                    bad.draw_index
                ),
            });
        }
        Ok(Self { n_obs, replicates })
    }

    pub fn n_rows(&self) -> usize {
        self.n_obs
    }

    pub fn n_cols(&self) -> usize {
        self.replicates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.replicates.is_empty()
    }

    pub fn replicates(&self) -> &[Replicate] {
        &self.replicates
    }

    pub fn column(&self, j: usize) -> Option<&[f64]> {
        self.replicates.get(j).map(|r| r.values.as_slice())
    }

    pub fn get(&self, i: usize, j: usize) -> Option<f64> {
        self.replicates.get(j)?.values.get(i).copied()
    }

    pub fn draw_indices(&self) -> Vec<usize> {
        self.replicates.iter().map(|r| r.draw_index).collect()
    }

    /// All simulated values, column-major.
    pub fn values(&self) -> impl Iterator<Item = f64> + '_ {
        self.replicates.iter().flat_map(|r| r.values.iter().copied())
    }
}

/// Choose `k` distinct draw indices uniformly at random from `0..n_draws`.
pub fn select_draw_indices<R: Rng>(n_draws: usize, k: usize, rng: &mut R) -> Result<Vec<usize>> {
    if k > n_draws {
        return Err(PpcError::InsufficientDraws {
            requested: k,
            available: n_draws,
        });
    }
    Ok(index::sample(rng, n_draws, k).into_vec())
}

/// Generate one response vector from a single draw.
///
/// `nu` must come from the same draw (or be the caller's explicit plug-in
/// value); the mean vector and scale are always taken from `draw`.
pub fn simulate_replicate<R: Rng>(
    draw_index: usize,
    draw: &PosteriorDraw,
    likelihood: Likelihood,
    nu: Option<f64>,
    covariates: &Covariates,
    rng: &mut R,
) -> Result<Replicate> {
    let mean = draw.mean_vector(covariates)?;
    let sigma = draw.sigma();
    ensure_positive("sigma", sigma)?;

    let values = match likelihood {
        Likelihood::Normal => mean
            .iter()
            .map(|m| m + sigma * rng.sample::<f64, _>(StandardNormal))
            .collect(),
        Likelihood::StudentT => {
            let nu = nu.ok_or_else(|| {
                PpcError::InvalidModel(format!("draw {draw_index} has no degrees of freedom"))
            })?;
            ensure_positive("nu", nu)?;
            let mixing = gamma_rate(nu / 2.0, nu / 2.0)?;
            mean.iter()
                .map(|m| {
                    let z: f64 = rng.sample(StandardNormal);
                    let w = mixing.sample(rng);
                    m + sigma * z / w.sqrt()
                })
                .collect()
        }
    };

    Ok(Replicate {
        draw_index,
        sigma,
        nu: if likelihood == Likelihood::StudentT { nu } else { None },
        mean,
        values,
    })
}

/// Simulate `config.n_replicates` response vectors from randomly selected
/// posterior draws.
pub fn simulate_replicates<R: Rng>(
    draws: &PosteriorDraws,
    likelihood: Likelihood,
    covariates: &Covariates,
    config: &ReplicateConfig,
    rng: &mut R,
) -> Result<ReplicateMatrix> {
    let indices = select_draw_indices(draws.len(), config.n_replicates, rng)?;
    debug!("simulating {} replicates from draws {:?}", indices.len(), indices);

    let plug_in_nu = match (likelihood, config.df_policy) {
        (Likelihood::StudentT, DfPolicy::PosteriorMean) => Some(draws.mean(Param::Nu).ok_or_else(|| {
            PpcError::InvalidModel("posterior has no degrees of freedom".to_string())
        })?),
        _ => None,
    };

    let mut replicates = Vec::with_capacity(indices.len());
    for idx in indices {
        let draw = draws.get(idx).ok_or(PpcError::InsufficientDraws {
            requested: idx + 1,
            available: draws.len(),
        })?;
        let nu = plug_in_nu.or(draw.nu());
        replicates.push(simulate_replicate(idx, draw, likelihood, nu, covariates, rng)?);
    }

    ReplicateMatrix::from_replicates(covariates.n_obs(), replicates)
}

/// [`simulate_replicates`] for a fitted model.
pub fn simulate_from_fit<R: Rng>(
    fit: &PosteriorFit,
    covariates: &Covariates,
    config: &ReplicateConfig,
    rng: &mut R,
) -> Result<ReplicateMatrix> {
    simulate_replicates(&fit.draws, fit.likelihood, covariates, config, rng)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha20Rng;
    use std::collections::HashSet;

    fn covariates(n: usize) -> Covariates {
        Covariates::new(vec!["x".to_string()], vec![(0..n).map(|i| i as f64 / n as f64).collect()]).unwrap()
    }

    /// Draws whose parameters encode their own index so mixing is detectable.
    fn tagged_draws(n: usize, with_nu: bool) -> PosteriorDraws {
        let draws = (0..n)
            .map(|i| {
                let d = PosteriorDraw::new(0, i, vec![100.0 * i as f64, 0.0], 1e6);
                if with_nu {
                    d.with_nu(2.0 + i as f64)
                } else {
                    d
                }
            })
            .collect();
        PosteriorDraws::new(draws).unwrap()
    }

    #[test]
    fn test_select_draw_indices() {
        let mut rng = ChaCha20Rng::seed_from_u64(42);
        let idx = select_draw_indices(100, 20, &mut rng).unwrap();
        assert_eq!(idx.len(), 20);
        assert_eq!(idx.iter().collect::<HashSet<_>>().len(), 20);
        assert!(idx.iter().all(|&i| i < 100));

        let all = select_draw_indices(5, 5, &mut rng).unwrap();
        let mut sorted = all.clone();
        sorted.sort_unstable();
        assert_eq!(sorted, vec![0, 1, 2, 3, 4]);

        assert!(select_draw_indices(10, 0, &mut rng).unwrap().is_empty());
        assert!(matches!(
            select_draw_indices(3, 4, &mut rng),
            Err(PpcError::InsufficientDraws {
                requested: 4,
                available: 3
            })
        ));
    }

    #[test]
    fn test_normal_replicates_shape() {
        let mut rng = ChaCha20Rng::seed_from_u64(1);
        let draws = PosteriorDraws::new(
            (0..10)
                .map(|i| PosteriorDraw::new(0, i, vec![1.0, 2.0], 4.0))
                .collect(),
        )
        .unwrap();
        let cfg = ReplicateConfig {
            n_replicates: 4,
            ..ReplicateConfig::default()
        };
        let reps = simulate_replicates(&draws, Likelihood::Normal, &covariates(30), &cfg, &mut rng).unwrap();

        assert_eq!(reps.n_rows(), 30);
        assert_eq!(reps.n_cols(), 4);
        for r in reps.replicates() {
            assert_eq!(r.values.len(), 30);
            assert!(r.values.iter().all(|v| v.is_finite()));
            assert_eq!(r.sigma, 0.5);
            assert!(r.nu.is_none());
        }
    }

    #[test]
    fn test_replicates_use_single_draw() {
        let mut rng = ChaCha20Rng::seed_from_u64(8);
        let draws = tagged_draws(40, true);
        let cfg = ReplicateConfig {
            n_replicates: 15,
            df_policy: DfPolicy::PerDraw,
        };
        let reps = simulate_replicates(&draws, Likelihood::StudentT, &covariates(20), &cfg, &mut rng).unwrap();

        for r in reps.replicates() {
            let draw = draws.get(r.draw_index).unwrap();
            assert_eq!(r.nu, draw.nu());
            assert_eq!(r.sigma, draw.sigma());
            let expected_mean = 100.0 * r.draw_index as f64;
            assert!(r.mean.iter().all(|&m| m == expected_mean));
            // tau = 1e6 keeps values within a few units of the draw's mean
            assert!(r.values.iter().all(|v| (v - expected_mean).abs() < 1.0));
        }
    }

    #[test]
    fn test_posterior_mean_df_policy() {
        let mut rng = ChaCha20Rng::seed_from_u64(3);
        let draws = tagged_draws(5, true);
        let cfg = ReplicateConfig {
            n_replicates: 3,
            df_policy: DfPolicy::PosteriorMean,
        };
        let reps = simulate_replicates(&draws, Likelihood::StudentT, &covariates(10), &cfg, &mut rng).unwrap();
        for r in reps.replicates() {
            assert_eq!(r.nu, Some(4.0));
        }
    }

    #[test]
    fn test_zero_replicates_is_empty() {
        let mut rng = ChaCha20Rng::seed_from_u64(0);
        let cfg = ReplicateConfig {
            n_replicates: 0,
            ..ReplicateConfig::default()
        };
        let reps =
            simulate_replicates(&tagged_draws(3, false), Likelihood::Normal, &covariates(7), &cfg, &mut rng).unwrap();
        assert!(reps.is_empty());
        assert_eq!(reps.n_rows(), 7);
        assert_eq!(reps.n_cols(), 0);
        assert_eq!(reps.values().count(), 0);
    }

    #[test]
    fn test_student_t_without_nu_fails() {
        let mut rng = ChaCha20Rng::seed_from_u64(0);
        let err = simulate_replicates(
            &tagged_draws(3, false),
            Likelihood::StudentT,
            &covariates(5),
            &ReplicateConfig {
                n_replicates: 1,
                ..ReplicateConfig::default()
            },
            &mut rng,
        );
        assert!(matches!(err, Err(PpcError::InvalidModel(_))));
    }

    #[test]
    fn test_dimension_mismatch_fails_fast() {
        let mut rng = ChaCha20Rng::seed_from_u64(0);
        let draw = PosteriorDraw::new(0, 0, vec![1.0, 2.0, 3.0], 1.0);
        let err = simulate_replicate(0, &draw, Likelihood::Normal, None, &covariates(5), &mut rng);
        assert!(matches!(err, Err(PpcError::DimensionMismatch { .. })));
    }

    #[test]
    fn test_invalid_scale_fails_fast() {
        let mut rng = ChaCha20Rng::seed_from_u64(0);
        let draw = PosteriorDraw::new(0, 0, vec![1.0, 2.0], 0.0);
        let err = simulate_replicate(0, &draw, Likelihood::Normal, None, &covariates(5), &mut rng);
        assert!(matches!(err, Err(PpcError::InvalidParameter { .. })));

        let draw = PosteriorDraw::new(0, 0, vec![1.0, 2.0], 1.0);
        let err = simulate_replicate(0, &draw, Likelihood::StudentT, Some(-1.0), &covariates(5), &mut rng);
        assert!(matches!(err, Err(PpcError::InvalidParameter { .. })));
    }

    mod prop {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn selection_is_distinct_and_in_range(n in 0usize..300, frac in 0.0f64..=1.0, seed in any::<u64>()) {
                let k = (n as f64 * frac) as usize;
                let mut rng = ChaCha20Rng::seed_from_u64(seed);
                let idx = select_draw_indices(n, k, &mut rng).unwrap();
                prop_assert_eq!(idx.len(), k);
                prop_assert!(idx.iter().all(|&i| i < n));
                prop_assert_eq!(idx.iter().collect::<HashSet<_>>().len(), k);
            }

            #[test]
            fn selection_rejects_oversized_requests(n in 0usize..50, extra in 1usize..10) {
                let mut rng = ChaCha20Rng::seed_from_u64(0);
                prop_assert!(select_draw_indices(n, n + extra, &mut rng).is_err());
            }
        }
    }
}
