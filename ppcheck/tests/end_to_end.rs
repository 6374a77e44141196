use ppcheck::compare::{LongTable, PpcComparison, Source, TailCheck, ValueRange};
use ppcheck::datagen::{generate_dataset, Covariates, Dataset, NoiseModel, TrueParams};
use ppcheck::draws::Param;
use ppcheck::engine::{GibbsSampler, InferenceEngine, PosteriorFit, SamplerConfig};
use ppcheck::config::PpcConfig;
use ppcheck::error::PpcError;
use ppcheck::model::{Likelihood, ModelSpec};
use ppcheck::ppc::{simulate_from_fit, DfPolicy, ReplicateConfig};
use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;

fn sampler() -> GibbsSampler {
    GibbsSampler::new(SamplerConfig {
        num_chains: 2,
        num_warmup: 300,
        num_samples: 300,
        thin: 1,
    })
}

fn heavy_tailed_data(rng: &mut ChaCha20Rng) -> Dataset {
    generate_dataset(
        5000,
        &TrueParams::default(),
        NoiseModel::StudentT { df: 3.0, scale: 1.0 },
        rng,
    )
    .expect("data generation failed")
}

fn fit(data: &Dataset, spec: &ModelSpec, rng: &mut ChaCha20Rng) -> PosteriorFit {
    sampler().fit(data, spec, rng).expect("fit failed")
}

fn tail_check(data: &Dataset, fit: &PosteriorFit, rng: &mut ChaCha20Rng) -> TailCheck {
    let config = ReplicateConfig {
        n_replicates: 40,
        df_policy: DfPolicy::PerDraw,
    };
    let replicates = simulate_from_fit(fit, data.covariates(), &config, rng).expect("simulation failed");
    assert_eq!(replicates.n_rows(), data.n_obs());
    assert_eq!(replicates.n_cols(), 40);
    assert!(replicates.values().all(f64::is_finite));

    TailCheck::compute(data.y(), &replicates, 0.99)
        .expect("tail check failed")
        .expect("replicates present")
}

#[test]
fn test_normal_model_recovers_intercept() {
    let mut rng = ChaCha20Rng::seed_from_u64(2024);
    let data = generate_dataset(5000, &TrueParams::default(), NoiseModel::Normal { sigma: 1.0 }, &mut rng)
        .expect("data generation failed");

    let fit = fit(&data, &ModelSpec::normal_regression(), &mut rng);
    let intercept = fit.draws.mean(Param::Beta(0)).expect("intercept draws");
    assert!((intercept - 3.0).abs() < 0.15, "intercept = {intercept}");

    let stats = fit.summary.param("beta[1]").expect("intercept summary");
    assert!(stats.q025 < 3.0 + 0.1 && stats.q975 > 3.0 - 0.1);

    let sigma = fit.draws.mean(Param::Sigma).expect("sigma draws");
    assert!((sigma - 1.0).abs() < 0.1, "sigma = {sigma}");
}

#[test]
fn test_misspecified_normal_model_has_thin_tails() {
    let mut rng = ChaCha20Rng::seed_from_u64(7);
    let data = heavy_tailed_data(&mut rng);

    let fit = fit(&data, &ModelSpec::normal_regression(), &mut rng);
    let tail = tail_check(&data, &fit, &mut rng);

    assert!(tail.ratio < 0.9, "ratio = {}", tail.ratio);
    assert!(tail.gap > 0.0);
    assert!(tail.p_value < 0.1, "p = {}", tail.p_value);
}

#[test]
fn test_student_t_model_closes_tail_gap() {
    let mut rng = ChaCha20Rng::seed_from_u64(7);
    let data = heavy_tailed_data(&mut rng);

    let normal_fit = fit(&data, &ModelSpec::normal_regression(), &mut rng);
    let normal_tail = tail_check(&data, &normal_fit, &mut rng);

    let t_fit = fit(&data, &ModelSpec::student_t_regression(), &mut rng);
    let t_tail = tail_check(&data, &t_fit, &mut rng);

    assert!((t_tail.ratio - 1.0).abs() < 0.2, "ratio = {}", t_tail.ratio);
    assert!(t_tail.gap.abs() < normal_tail.gap.abs());

    let nu = t_fit.draws.mean(Param::Nu).expect("nu draws");
    assert!(nu > 2.0 && nu < 5.0, "nu = {nu}");
}

#[test]
fn test_zero_replicates_flow_through_comparison() {
    let mut rng = ChaCha20Rng::seed_from_u64(11);
    let data = generate_dataset(200, &TrueParams::default(), NoiseModel::default(), &mut rng)
        .expect("data generation failed");
    let fit = GibbsSampler::new(SamplerConfig {
        num_chains: 1,
        num_warmup: 50,
        num_samples: 50,
        thin: 1,
    })
    .fit(&data, &ModelSpec::student_t_regression(), &mut rng)
    .expect("fit failed");

    let config = ReplicateConfig {
        n_replicates: 0,
        df_policy: DfPolicy::PerDraw,
    };
    let replicates = simulate_from_fit(&fit, data.covariates(), &config, &mut rng).expect("simulation failed");
    assert!(replicates.is_empty());

    let range = ValueRange::symmetric(100.0).ok();
    let table = LongTable::build(data.y(), &replicates, range).expect("long table");
    assert!(table.values(Source::Simulated).is_empty());

    let comparison = PpcComparison::build(&fit.model_name, data.y(), &replicates, range, 0.99)
        .expect("comparison with no replicates");
    assert!(comparison.tail.is_none());
    assert!(comparison.render_text().contains("no simulated replicates"));
}

#[test]
fn test_pipeline_is_deterministic() {
    let run = |seed: u64| {
        let mut rng = ChaCha20Rng::seed_from_u64(seed);
        let data = generate_dataset(300, &TrueParams::default(), NoiseModel::default(), &mut rng)
            .expect("data generation failed");
        let fit = GibbsSampler::new(SamplerConfig {
            num_chains: 2,
            num_warmup: 20,
            num_samples: 20,
            thin: 1,
        })
        .fit(&data, &ModelSpec::student_t_regression(), &mut rng)
        .expect("fit failed");
        let replicates = simulate_from_fit(
            &fit,
            data.covariates(),
            &ReplicateConfig {
                n_replicates: 5,
                df_policy: DfPolicy::PerDraw,
            },
            &mut rng,
        )
        .expect("simulation failed");
        (data, fit.draws, replicates)
    };

    let (data_a, draws_a, reps_a) = run(99);
    let (data_b, draws_b, reps_b) = run(99);
    assert_eq!(data_a, data_b);
    assert_eq!(draws_a, draws_b);
    assert_eq!(reps_a, reps_b);

    let (data_c, _, _) = run(100);
    assert_ne!(data_a.y(), data_c.y());
}

#[test]
fn test_fit_from_csv_dataset() {
    let dir = tempfile::tempdir().expect("temp dir");
    let path = dir.path().join("data.csv");

    let mut rng = ChaCha20Rng::seed_from_u64(5);
    let data = generate_dataset(400, &TrueParams::default(), NoiseModel::Normal { sigma: 0.5 }, &mut rng)
        .expect("data generation failed");
    data.write_csv(&path).expect("write csv");

    let loaded = Dataset::from_csv(&path).expect("read csv");
    assert_eq!(loaded.n_obs(), 400);

    let fit = fit(&loaded, &ModelSpec::normal_regression(), &mut rng);
    assert_eq!(fit.likelihood, Likelihood::Normal);
    let beta = fit.draws.beta_mean();
    assert!((beta[1] - 1.5).abs() < 0.1, "b1 = {}", beta[1]);
    assert!((beta[2] + 0.5).abs() < 0.1, "b2 = {}", beta[2]);
}

#[test]
fn test_fit_csv_with_custom_predictor_names() {
    let dir = tempfile::tempdir().expect("temp dir");
    let path = dir.path().join("renamed.csv");

    let mut rng = ChaCha20Rng::seed_from_u64(17);
    let data = generate_dataset(400, &TrueParams::default(), NoiseModel::Normal { sigma: 0.5 }, &mut rng)
        .expect("data generation failed");
    let covariates = data.covariates();
    let predictors = vec![
        covariates.column("x1").expect("x1"),
        covariates.column("x2").expect("x2"),
    ];
    let renamed = Covariates::new(vec!["dose".to_string(), "weight".to_string()], predictors)
        .expect("renamed covariates");
    Dataset::new(data.y().to_vec(), renamed)
        .expect("renamed dataset")
        .write_csv(&path)
        .expect("write csv");

    let loaded = Dataset::from_csv(&path).expect("read csv");
    assert_eq!(loaded.covariates().names(), ["dose", "weight"]);

    let err = sampler()
        .fit(&loaded, &ModelSpec::normal_regression(), &mut rng)
        .expect_err("default predictor names should not match");
    assert!(matches!(err, PpcError::DimensionMismatch { .. }));

    let spec = ModelSpec::for_dataset(Likelihood::Normal, &loaded);
    let fit = fit(&loaded, &spec, &mut rng);
    let beta = fit.draws.beta_mean();
    assert!((beta[1] - 1.5).abs() < 0.1, "b1 = {}", beta[1]);

    let specs = PpcConfig::default().model_specs_for(&loaded);
    assert_eq!(specs.len(), 2);
    assert!(specs.iter().all(|s| s.validate().is_ok()));
    let t_fit = GibbsSampler::new(SamplerConfig {
        num_chains: 1,
        num_warmup: 20,
        num_samples: 20,
        thin: 1,
    })
    .fit(&loaded, &specs[1], &mut rng)
    .expect("student-t fit on renamed predictors");
    assert_eq!(t_fit.likelihood, Likelihood::StudentT);
}
