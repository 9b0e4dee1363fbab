//! macenko-norm CLI: stain-normalize H&E tiles and score the result.

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use macenko_norm::config::PipelineConfig;
use macenko_norm::image_io::normalize_image_file;
use macenko_norm::metrics::{self, ChannelMode, MetricsSummary};
use macenko_norm::pipeline::run_pipeline;
use macenko_norm::{logger, MacenkoParams, NormalizeOutcome, StainNormalizer};
use std::path::PathBuf;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "macenko-norm")]
#[command(about = "Macenko stain normalization for H&E histopathology tiles")]
#[command(version)]
struct Cli {
    /// Default log level when RUST_LOG is unset.
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Normalize a single image.
    Normalize {
        /// Input image (JPEG/PNG/TIFF).
        #[arg(long)]
        input: PathBuf,

        /// Output path; the format follows its extension.
        #[arg(long)]
        output: PathBuf,

        #[command(flatten)]
        params: CliParams,
    },

    /// Normalize every dataset listed in a JSON config.
    Run {
        /// Pipeline config (JSON). Defaults are used when omitted.
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Compute PSNR/SSIM/RMSE between original and normalized images.
    Metrics(CliMetricsArgs),

    /// Print the default pipeline config as JSON.
    DefaultConfig,
}

#[derive(Debug, Clone, Args)]
struct CliParams {
    /// Transmitted light intensity.
    #[arg(long, default_value_t = 240.0)]
    io: f64,

    /// Angle percentile trimmed on each side.
    #[arg(long, default_value_t = 1.0)]
    alpha: f64,

    /// OD threshold for tissue pixels.
    #[arg(long, default_value_t = 0.15)]
    beta: f64,
}

impl CliParams {
    fn to_params(&self) -> MacenkoParams {
        MacenkoParams {
            io: self.io,
            alpha: self.alpha,
            beta: self.beta,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ChannelModeArg {
    Rgb,
    Gray,
}

impl From<ChannelModeArg> for ChannelMode {
    fn from(v: ChannelModeArg) -> Self {
        match v {
            ChannelModeArg::Rgb => ChannelMode::Rgb,
            ChannelModeArg::Gray => ChannelMode::Gray,
        }
    }
}

#[derive(Debug, Clone, Args)]
struct CliMetricsArgs {
    /// Dataset name used in the tables.
    #[arg(long, default_value = "dataset")]
    name: String,

    /// Directory of original images.
    #[arg(long)]
    original: PathBuf,

    /// Directory of normalized images.
    #[arg(long)]
    normalized: PathBuf,

    /// Channel mode for the metrics.
    #[arg(long, value_enum, default_value_t = ChannelModeArg::Rgb)]
    mode: ChannelModeArg,

    /// Directory for metrics_detailed.csv and metrics.csv.
    #[arg(long, default_value = "results/tables")]
    out_dir: PathBuf,
}

fn run_metrics(args: &CliMetricsArgs) -> Result<()> {
    let result = metrics::evaluate_dataset(
        &args.name,
        &args.original,
        &args.normalized,
        args.mode.into(),
    )?;
    let summary = MetricsSummary::from_records(&args.name, &result.records);
    info!(
        "{}: n={}, PSNR={:.2}±{:.2} dB, SSIM={:.4}±{:.4}, RMSE={:.2}±{:.2}",
        summary.dataset,
        summary.n_images,
        summary.psnr_mean,
        summary.psnr_std,
        summary.ssim_mean,
        summary.ssim_std,
        summary.rmse_mean,
        summary.rmse_std
    );

    let detailed = args.out_dir.join("metrics_detailed.csv");
    metrics::write_detailed_csv(&detailed, &result.records)
        .with_context(|| format!("writing {}", detailed.display()))?;
    let summary_path = args.out_dir.join("metrics.csv");
    metrics::write_summary_csv(&summary_path, &[summary])
        .with_context(|| format!("writing {}", summary_path.display()))?;
    info!("Metrics saved to {}", args.out_dir.display());
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    logger::init(&cli.log_level);

    match cli.command {
        Commands::Normalize {
            input,
            output,
            params,
        } => {
            let normalizer = StainNormalizer::new(params.to_params())?;
            let outcome = normalize_image_file(&input, &output, &normalizer)
                .with_context(|| format!("normalizing {}", input.display()))?;
            match outcome {
                NormalizeOutcome::Normalized => info!(
                    "Successfully normalized: {} -> {}",
                    input.display(),
                    output.display()
                ),
                other => warn!(
                    "Wrote {} unchanged ({:?})",
                    output.display(),
                    other
                ),
            }
        }
        Commands::Run { config } => {
            let config = match config {
                Some(path) => PipelineConfig::from_json_file(&path)
                    .with_context(|| format!("loading config {}", path.display()))?,
                None => PipelineConfig::default(),
            };
            let summary = run_pipeline(&config)?;
            if summary.total() > 0 && summary.success() == 0 {
                bail!("no image was normalized ({} failed)", summary.failed());
            }
        }
        Commands::Metrics(args) => run_metrics(&args)?,
        Commands::DefaultConfig => {
            println!("{}", PipelineConfig::default().to_json_pretty()?);
        }
    }

    Ok(())
}
