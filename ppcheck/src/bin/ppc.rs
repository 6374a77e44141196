// Posterior predictive check CLI
use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use ppcheck::compare::{LongTable, PpcComparison};
use ppcheck::config::PpcConfig;
use ppcheck::datagen::{generate_dataset, Dataset, NoiseModel};
use ppcheck::engine::{GibbsSampler, InferenceEngine, PosteriorFit};
use ppcheck::model::{Likelihood, ModelSpec};
use ppcheck::ppc::simulate_from_fit;

#[derive(Parser)]
#[command(name = "ppc")]
#[command(version)]
#[command(about = "Posterior predictive checks for Normal and Student-t linear regression")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to TOML configuration file (defaults apply when omitted)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Clone, Copy, ValueEnum)]
enum ModelArg {
    Normal,
    StudentT,
}

impl From<ModelArg> for Likelihood {
    fn from(m: ModelArg) -> Self {
        match m {
            ModelArg::Normal => Likelihood::Normal,
            ModelArg::StudentT => Likelihood::StudentT,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum NoiseArg {
    Normal,
    StudentT,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a synthetic regression dataset
    GenerateData {
        /// Output CSV file
        #[arg(short, long, value_name = "OUTPUT")]
        output: PathBuf,

        /// Number of observations (overrides config)
        #[arg(short = 'n', long)]
        n_obs: Option<usize>,

        /// Random seed (overrides config)
        #[arg(long)]
        seed: Option<u64>,

        /// Noise family (overrides config; Normal uses sigma = 1)
        #[arg(long, value_enum)]
        noise: Option<NoiseArg>,
    },

    /// Fit one model and print MCMC diagnostics
    Fit {
        /// Input CSV written by generate-data (generated from config when omitted)
        #[arg(short, long)]
        data: Option<PathBuf>,

        /// Likelihood family
        #[arg(short, long, value_enum, default_value = "normal")]
        model: ModelArg,

        /// Write retained draws as CSV
        #[arg(long, value_name = "DRAWS_CSV")]
        draws_out: Option<PathBuf>,

        /// Random seed (overrides config)
        #[arg(long)]
        seed: Option<u64>,
    },

    /// Run the full check: fit, simulate replicates, compare
    Check {
        /// Input CSV written by generate-data (generated from config when omitted)
        #[arg(short, long)]
        data: Option<PathBuf>,

        /// Check only this model (default: every model in the config)
        #[arg(short, long, value_enum)]
        model: Option<ModelArg>,

        /// Directory for long-table and draw CSV files
        #[arg(long, value_name = "DIR")]
        output_dir: Option<PathBuf>,

        /// Write the comparisons as JSON
        #[arg(long, value_name = "REPORT_JSON")]
        report: Option<PathBuf>,

        /// Fail when R-hat or ESS flag a convergence problem
        #[arg(long)]
        require_convergence: bool,
    },

    /// Show example configuration
    ExampleConfig,
}

fn setup_logging(verbose: bool) -> Result<()> {
    let level = if verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber).context("Failed to set subscriber")
}

fn load_config(path: Option<&Path>) -> Result<PpcConfig> {
    match path {
        Some(p) => PpcConfig::load(p).with_context(|| format!("Failed to load config from {}", p.display())),
        None => Ok(PpcConfig::default()),
    }
}

/// Read `data` if given, otherwise generate from the config with `rng`.
fn obtain_dataset(data: Option<&Path>, config: &PpcConfig, rng: &mut ChaCha20Rng) -> Result<Dataset> {
    match data {
        Some(path) => {
            let dataset =
                Dataset::from_csv(path).with_context(|| format!("Failed to read dataset {}", path.display()))?;
            info!("loaded {} observations from {}", dataset.n_obs(), path.display());
            Ok(dataset)
        }
        None => {
            let truth = &config.truth;
            info!(
                "generating {} observations (b0 = {}, b1 = {}, b2 = {}, noise {:?})",
                config.n_obs, truth.coefficients.b0, truth.coefficients.b1, truth.coefficients.b2, truth.noise
            );
            generate_dataset(config.n_obs, &truth.coefficients, truth.noise, rng).context("Data generation failed")
        }
    }
}

fn print_fit(fit: &PosteriorFit) {
    println!("\n=== {} ===", fit.model_name);
    print!("{}", fit.summary.render_table());
    for w in fit.summary.warnings() {
        println!("  ⚠ {w}");
    }
}

fn generate_data_command(
    config: PpcConfig,
    output: PathBuf,
    n_obs: Option<usize>,
    seed: Option<u64>,
    noise: Option<NoiseArg>,
) -> Result<()> {
    let n = n_obs.unwrap_or(config.n_obs);
    let seed = seed.unwrap_or(config.seed);
    let noise = match noise {
        Some(NoiseArg::Normal) => NoiseModel::Normal { sigma: 1.0 },
        Some(NoiseArg::StudentT) => NoiseModel::StudentT { df: 3.0, scale: 1.0 },
        None => config.truth.noise,
    };

    let mut rng = ChaCha20Rng::seed_from_u64(seed);
    let dataset =
        generate_dataset(n, &config.truth.coefficients, noise, &mut rng).context("Data generation failed")?;
    dataset
        .write_csv(&output)
        .with_context(|| format!("Failed to write {}", output.display()))?;

    println!("✓ {} observations written to {}", dataset.n_obs(), output.display());
    Ok(())
}

fn fit_command(
    config: PpcConfig,
    data: Option<PathBuf>,
    model: ModelArg,
    draws_out: Option<PathBuf>,
    seed: Option<u64>,
) -> Result<()> {
    let mut rng = ChaCha20Rng::seed_from_u64(seed.unwrap_or(config.seed));
    let dataset = obtain_dataset(data.as_deref(), &config, &mut rng)?;

    let spec = ModelSpec::for_dataset(model.into(), &dataset);
    let sampler = GibbsSampler::new(config.sampler.clone());
    let fit = sampler
        .fit(&dataset, &spec, &mut rng)
        .with_context(|| format!("Fitting {} failed", spec.name))?;
    print_fit(&fit);

    if let Some(path) = draws_out {
        fit.draws
            .to_matrix()
            .write_csv(&path)
            .with_context(|| format!("Failed to write draws to {}", path.display()))?;
        println!("\n✓ Draws saved to: {}", path.display());
    }
    Ok(())
}

fn check_command(
    config: PpcConfig,
    data: Option<PathBuf>,
    model: Option<ModelArg>,
    output_dir: Option<PathBuf>,
    report: Option<PathBuf>,
    require_convergence: bool,
) -> Result<()> {
    let mut rng = ChaCha20Rng::seed_from_u64(config.seed);
    let dataset = obtain_dataset(data.as_deref(), &config, &mut rng)?;

    let specs = match model {
        Some(m) => vec![ModelSpec::for_dataset(m.into(), &dataset)],
        None => config.model_specs_for(&dataset),
    };
    if let Some(dir) = &output_dir {
        fs::create_dir_all(dir).with_context(|| format!("Failed to create {}", dir.display()))?;
    }

    let sampler = GibbsSampler::new(config.sampler.clone());
    let replicate_config = config.check.replicate_config();
    let mut comparisons = Vec::with_capacity(specs.len());

    for spec in &specs {
        let fit = sampler
            .fit(&dataset, spec, &mut rng)
            .with_context(|| format!("Fitting {} failed", spec.name))?;
        print_fit(&fit);
        if require_convergence {
            fit.ensure_converged()
                .with_context(|| format!("{} did not converge", spec.name))?;
        }

        let replicates = simulate_from_fit(&fit, dataset.covariates(), &replicate_config, &mut rng)
            .with_context(|| format!("Replicate simulation for {} failed", spec.name))?;
        let comparison = PpcComparison::build(
            &spec.name,
            dataset.y(),
            &replicates,
            config.check.value_range,
            config.check.tail_quantile,
        )?;
        println!();
        print!("{}", comparison.render_text());

        if let Some(dir) = &output_dir {
            let long_path = dir.join(format!("{}_long.csv", spec.name));
            LongTable::build(dataset.y(), &replicates, config.check.value_range)?
                .write_csv(&long_path)
                .with_context(|| format!("Failed to write {}", long_path.display()))?;
            let draws_path = dir.join(format!("{}_draws.csv", spec.name));
            fit.draws
                .to_matrix()
                .write_csv(&draws_path)
                .with_context(|| format!("Failed to write {}", draws_path.display()))?;
            info!("wrote {} and {}", long_path.display(), draws_path.display());
        }
        comparisons.push(comparison);
    }

    if let Some(path) = report {
        let json = serde_json::to_string_pretty(&comparisons).context("Failed to serialize report")?;
        fs::write(&path, json).with_context(|| format!("Failed to write {}", path.display()))?;
        println!("\n✓ Report saved to: {}", path.display());
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose)?;

    match cli.command {
        Commands::ExampleConfig => {
            print!("{}", PpcConfig::example_toml());
            Ok(())
        }
        Commands::GenerateData {
            output,
            n_obs,
            seed,
            noise,
        } => generate_data_command(load_config(cli.config.as_deref())?, output, n_obs, seed, noise),
        Commands::Fit {
            data,
            model,
            draws_out,
            seed,
        } => fit_command(load_config(cli.config.as_deref())?, data, model, draws_out, seed),
        Commands::Check {
            data,
            model,
            output_dir,
            report,
            require_convergence,
        } => check_command(
            load_config(cli.config.as_deref())?,
            data,
            model,
            output_dir,
            report,
            require_convergence,
        ),
    }
}
