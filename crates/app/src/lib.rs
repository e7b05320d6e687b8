use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use ndarray::{Array4, Ix4};
use tracing::{info, warn};
use tracing_subscriber::prelude::*;

use patchdiff_core::config::{config_path, data_dir, initialize_data_dir, AppConfig};
use patchdiff_core::logging::{self, LogSettings, DEFAULT_LOG_FILTER};
use patchdiff_core::onnx::OnnxDenoiser;
use patchdiff_core::{EdmSampler, GaussianNoise, NoiseSource, SampleRequest, Shape2};

#[derive(Parser)]
#[command(
    name = "patchdiff",
    about = "Patch-based diffusion super-resolution with an EDM Heun sampler"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(
        short = 'v',
        long = "verbose",
        action = ArgAction::Count,
        global = true,
        help = "Increase log verbosity (-v: debug, -vv: trace)"
    )]
    verbose: u8,

    #[arg(
        long = "log-filter",
        value_name = "FILTER",
        global = true,
        help = "Explicit tracing filter (overrides RUST_LOG and -v)"
    )]
    log_filter: Option<String>,

    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[arg(long, global = true, help = "Config file (default: <data-dir>/config.toml)")]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the noise schedule as JSON.
    Schedule(PlanArgs),
    /// Print the schedule, tiling layout and denoiser call count as JSON.
    Plan(PlanArgs),
    /// Run the sampler with an ONNX denoiser.
    Sample(SampleArgs),
}

impl Commands {
    fn name(&self) -> &'static str {
        match self {
            Self::Schedule(_) => "schedule",
            Self::Plan(_) => "plan",
            Self::Sample(_) => "sample",
        }
    }
}

#[derive(Args)]
struct PlanArgs {
    #[arg(long, help = "Minimum sigma supported by the network (default from config)")]
    net_sigma_min: Option<f64>,
}

#[derive(Args)]
struct SampleArgs {
    #[arg(long, help = "Path to the exported denoiser (.onnx)")]
    model: PathBuf,
    #[arg(long, help = "Upsampled low-res conditioning, raw little-endian f32")]
    lr: PathBuf,
    #[arg(long, value_name = "B,C,H,W")]
    lr_shape: String,
    #[arg(long, requires = "mean_hr_shape", help = "Mean high-res prediction, raw little-endian f32")]
    mean_hr: Option<PathBuf>,
    #[arg(long, value_name = "B,C,H,W", requires = "mean_hr")]
    mean_hr_shape: Option<String>,
    #[arg(long, help = "Channels of the generated image (default: low-res channels)")]
    out_channels: Option<usize>,
    #[arg(long, help = "Seed for latents and churn noise (random if omitted)")]
    seed: Option<u64>,
    #[arg(short = 'o', long, help = "Output path, raw little-endian f32")]
    output: PathBuf,
}

pub fn run_from_env() -> Result<()> {
    let cli = Cli::parse();
    let resolved_data_dir = data_dir(cli.data_dir.as_deref());

    patchdiff_core::runtime::setup_runtime_libs();
    init_logging(&resolved_data_dir, cli.verbose, cli.log_filter.as_deref());
    logging::set_crash_command(cli.command.name());
    patchdiff_core::runtime::log_runtime_lib_status();

    let cfg_path = cli
        .config
        .clone()
        .unwrap_or_else(|| config_path(&resolved_data_dir));
    info!(
        pid = std::process::id(),
        data_dir = %resolved_data_dir.display(),
        config_path = %cfg_path.display(),
        "Runtime startup metadata"
    );
    let config = AppConfig::load_from_path(&cfg_path)?;

    match cli.command {
        Commands::Schedule(args) => {
            let plan = build_sampler(&config).plan_with(net_sigma_min(&config, &args), |s| s)?;
            println!("{}", serde_json::to_string_pretty(&plan.sigmas)?);
            Ok(())
        }
        Commands::Plan(args) => {
            let plan = build_sampler(&config).plan_with(net_sigma_min(&config, &args), |s| s)?;
            println!("{}", serde_json::to_string_pretty(&plan)?);
            Ok(())
        }
        Commands::Sample(args) => {
            if cli.config.is_none() {
                initialize_data_dir(&resolved_data_dir)?;
            }
            run_sample(config, args, &resolved_data_dir)
        }
    }
}

fn build_sampler(config: &AppConfig) -> EdmSampler {
    EdmSampler::new(config.sampler.clone(), config.patching.clone())
        .with_sigma_channels(config.inference.sigma_channels)
}

fn net_sigma_min(config: &AppConfig, args: &PlanArgs) -> f64 {
    args.net_sigma_min.unwrap_or(config.inference.net_sigma_min)
}

fn run_sample(mut config: AppConfig, args: SampleArgs, data_dir: &Path) -> Result<()> {
    let lr_shape = parse_shape(&args.lr_shape)?;
    let img_lr = read_f32_tensor(&args.lr, lr_shape)?;
    let (batch, lr_channels, height, width) = img_lr.dim();

    let img_shape = Shape2::new(height, width);
    if config.patching.img_shape != img_shape {
        info!(
            configured = %config.patching.img_shape,
            input = %img_shape,
            "Using image shape of the low-res input"
        );
        config.patching.img_shape = img_shape;
    }

    let mean_hr = match (&args.mean_hr, &args.mean_hr_shape) {
        (Some(path), Some(shape)) => Some(read_f32_tensor(path, parse_shape(shape)?)?),
        _ => None,
    };

    let mut noise = match args.seed {
        Some(seed) => GaussianNoise::seeded(seed),
        None => GaussianNoise::from_entropy(),
    };
    logging::set_crash_seed(noise.seed());
    info!(seed = noise.seed(), "Noise source ready");

    let out_channels = args.out_channels.unwrap_or(lr_channels);
    let latents = noise.standard_normal(Ix4(batch, out_channels, height, width));

    let mut net = OnnxDenoiser::load(
        &args.model,
        &config.inference,
        config.patching.patch_shape,
        data_dir,
    )?;
    let sampler = build_sampler(&config);

    let request = SampleRequest {
        mean_hr: mean_hr.as_ref().map(|m| m.view()),
        ..SampleRequest::new(latents.view(), img_lr.view())
    };

    let started = Instant::now();
    let output = sampler.sample(&mut net, &request, &mut noise)?;
    info!(
        elapsed_secs = started.elapsed().as_secs_f64(),
        shape = ?output.shape(),
        "Sampling finished"
    );

    write_f32_tensor(&args.output, &output)?;
    info!(output = %args.output.display(), "Wrote result");
    Ok(())
}

/// Parse `B,C,H,W`.
fn parse_shape(raw: &str) -> Result<[usize; 4]> {
    let dims = raw
        .split(',')
        .map(|part| {
            part.trim()
                .parse::<usize>()
                .with_context(|| format!("invalid dimension '{part}' in shape '{raw}'"))
        })
        .collect::<Result<Vec<_>>>()?;
    let Ok(shape) = <[usize; 4]>::try_from(dims) else {
        bail!("shape '{raw}' must have exactly four dimensions (B,C,H,W)");
    };
    if shape.contains(&0) {
        bail!("shape '{raw}' has a zero dimension");
    }
    Ok(shape)
}

fn read_f32_tensor(path: &Path, shape: [usize; 4]) -> Result<Array4<f64>> {
    let bytes =
        fs::read(path).with_context(|| format!("failed to read tensor: {}", path.display()))?;
    let expected = shape.iter().product::<usize>() * 4;
    if bytes.len() != expected {
        bail!(
            "{} holds {} bytes, shape {shape:?} needs {expected}",
            path.display(),
            bytes.len()
        );
    }

    let values: Vec<f64> = bytes
        .chunks_exact(4)
        .map(|chunk| f64::from(f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]])))
        .collect();
    Ok(Array4::from_shape_vec(shape, values)?)
}

fn write_f32_tensor(path: &Path, tensor: &Array4<f64>) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create output directory: {}", parent.display()))?;
    }
    let bytes: Vec<u8> = tensor
        .iter()
        .flat_map(|&v| (v as f32).to_le_bytes())
        .collect();
    fs::write(path, bytes).with_context(|| format!("failed to write tensor: {}", path.display()))
}

fn init_logging(data_dir: &Path, verbose: u8, cli_log_filter: Option<&str>) {
    let crash_reporter = logging::install_crash_reporter(data_dir);

    let filters = LogSettings {
        verbose,
        cli_filter: cli_log_filter.map(ToString::to_string),
        rust_log: std::env::var("RUST_LOG").ok(),
    }
    .filters();
    let console = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(parse_env_filter_with_fallback(&filters.console, "console"));

    let (file, file_error) = match logging::open_log_file(data_dir) {
        Ok(appender) => {
            let layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(appender)
                .with_filter(parse_env_filter_with_fallback(&filters.file, "file"));
            (Some(layer), None)
        }
        Err(error) => (None, Some(error)),
    };

    let subscriber = tracing_subscriber::registry().with(console).with(file);
    if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!(
            "Failed to initialize tracing subscriber: {error}. Continuing without structured tracing."
        );
        return;
    }

    if let Some(error) = file_error {
        warn!("Persistent file logging unavailable, console only: {error:#}");
    }
    if let Err(error) = crash_reporter {
        warn!("Crash reports disabled: {error:#}");
    }
}

fn parse_env_filter_with_fallback(filter: &str, sink_name: &str) -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::try_new(filter).unwrap_or_else(|error| {
        eprintln!(
            "Invalid {sink_name} log filter '{filter}': {error}. Falling back to '{DEFAULT_LOG_FILTER}'."
        );
        tracing_subscriber::EnvFilter::new(DEFAULT_LOG_FILTER)
    })
}
