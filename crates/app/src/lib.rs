use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use ndarray::{ArrayD, IxDyn};
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

use tessera_core::axis::{AxisConstraint, AxisKind, AxisMapping, TilingMode};
use tessera_core::config::{config_path, data_dir, AppConfig, RunOptions};
use tessera_core::error::ExecError;
use tessera_core::executor::TiledExecutor;
use tessera_core::logging::{self, FileSinkPlan, LoggingInitOptions};
use tessera_core::model::{ModelRunner, PredictError};
use tessera_core::node::{InputNode, OutputNode};

#[derive(Parser)]
#[command(
    name = "tessera",
    about = "Adaptive tiled execution of fixed-shape inference models"
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
}

#[derive(Subcommand)]
enum Commands {
    /// Run a built-in demonstration model over a synthetic image.
    Run(RunArgs),
}

#[derive(Args)]
struct RunArgs {
    #[arg(long, default_value_t = 512, help = "Synthetic image width")]
    width: usize,
    #[arg(long, default_value_t = 512, help = "Synthetic image height")]
    height: usize,
    #[arg(long = "min-size", default_value_t = 32, help = "Smallest legal tile extent")]
    min_size: usize,
    #[arg(long, default_value_t = 16, help = "Legal extents are min-size + k*step")]
    step: usize,
    #[arg(long, help = "Tile overlap per side (defaults to the configured halo)")]
    halo: Option<usize>,
    #[arg(long, help = "Minimum number of tiles (overrides config)")]
    tiles: Option<usize>,
    #[arg(long, help = "Disable tiling and predict on the whole array")]
    no_tiling: bool,
    #[arg(long, help = "Cache directory for disk-backed outputs (overrides config)")]
    cache_dir: Option<PathBuf>,
    #[arg(long, value_enum, default_value_t = DemoModelKind::Identity)]
    model: DemoModelKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum DemoModelKind {
    /// Copies every tile through unchanged.
    Identity,
    /// Nearest-neighbor 2x upsampling.
    Upscale,
}

impl DemoModelKind {
    fn scale(self) -> f64 {
        match self {
            DemoModelKind::Identity => 1.0,
            DemoModelKind::Upscale => 2.0,
        }
    }
}

impl std::fmt::Display for DemoModelKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.to_possible_value()
            .expect("no skipped variants")
            .get_name()
            .fmt(f)
    }
}

pub async fn run_from_env() -> Result<()> {
    let cli = Cli::parse();
    let resolved_data_dir = data_dir(cli.data_dir.as_deref());
    init_logging(
        Some(resolved_data_dir.as_path()),
        cli.verbose,
        cli.log_filter.as_deref(),
    );

    match cli.command {
        Commands::Run(args) => run_demo(args, &resolved_data_dir).await,
    }
}

fn init_logging(data_dir: Option<&Path>, verbose: u8, cli_log_filter: Option<&str>) {
    let options = LoggingInitOptions {
        data_dir: data_dir.map(Path::to_path_buf),
        verbose,
        cli_log_filter: cli_log_filter.map(ToString::to_string),
        rust_log_env: std::env::var("RUST_LOG").ok(),
        ..Default::default()
    };
    let filter = logging::select_log_filter(&options);
    let console_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);
    let registry = tracing_subscriber::registry()
        .with(EnvFilter::new(&filter))
        .with(console_layer);

    match logging::build_file_sink_plan(&options) {
        FileSinkPlan::Ready(ready) => {
            let file_layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(ready.appender);
            registry.with(file_layer).init();
        }
        FileSinkPlan::Fallback(fallback) => {
            registry.init();
            warn!(
                "file logging unavailable ({}), continuing with console only",
                fallback.reason
            );
        }
    }
}

async fn run_demo(args: RunArgs, resolved_data_dir: &Path) -> Result<()> {
    let config = AppConfig::load_from_path(&config_path(resolved_data_dir))
        .context("failed to load configuration")?;
    let mut options: RunOptions = config.execution;
    if let Some(tiles) = args.tiles {
        options.number_of_tiles = tiles;
    }
    if args.no_tiling {
        options.tiling_enabled = false;
    }
    if args.cache_dir.is_some() {
        options.cache_directory = args.cache_dir.clone();
    }
    options.validate()?;

    let (input, output) = build_demo_nodes(&args)?;
    info!(
        width = args.width,
        height = args.height,
        model = ?args.model,
        tiles = options.number_of_tiles,
        tiling = options.tiling_enabled,
        "Starting demo run"
    );

    let (cancel_tx, cancel_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, canceling at the next tile boundary");
            let _ = cancel_tx.send(true);
        }
    });

    let model = DemoModel::new(args.model);
    let started = Instant::now();
    let outcome = tokio::task::spawn_blocking(move || {
        let mut executor = TiledExecutor::new(model, options);
        executor.run(
            &[input],
            &[output],
            Some(Box::new(|done, total| {
                info!(done, total, "Tile resolved");
            })),
            Some(cancel_rx),
        )
    })
    .await
    .context("demo run worker panicked")?;

    match outcome {
        Ok(run) => {
            let result = &run.outputs()[0];
            let array = result.to_array();
            let mean = array.iter().copied().sum::<f32>() / array.len().max(1) as f32;
            info!(
                output = result.name(),
                shape = ?result.shape(),
                mean,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Run finished"
            );
            Ok(())
        }
        Err(ExecError::Canceled) => {
            info!("Run canceled, no output produced");
            Ok(())
        }
        Err(error) => Err(error.into()),
    }
}

fn build_demo_nodes(args: &RunArgs) -> Result<(InputNode, OutputNode)> {
    let mut y_axis =
        AxisConstraint::new(AxisKind::Y, TilingMode::WithHalo, args.min_size).with_step(args.step);
    let mut x_axis =
        AxisConstraint::new(AxisKind::X, TilingMode::WithHalo, args.min_size).with_step(args.step);
    if let Some(halo) = args.halo {
        y_axis = y_axis.with_halo(halo);
        x_axis = x_axis.with_halo(halo);
    }

    let input = InputNode::new(
        "image",
        vec![y_axis, x_axis],
        AxisMapping::identity(2),
        demo_image(args.height, args.width),
    )?;

    let scale = args.model.scale();
    let output = OutputNode::new(
        "result",
        vec![
            AxisConstraint::new(AxisKind::Y, TilingMode::WithHalo, 0).with_scale(scale, 0),
            AxisConstraint::new(AxisKind::X, TilingMode::WithHalo, 0).with_scale(scale, 0),
        ],
        AxisMapping::identity(2),
    )?;
    Ok((input, output))
}

/// Diagonal gradient test pattern.
fn demo_image(height: usize, width: usize) -> ArrayD<f32> {
    let values: Vec<f32> = (0..height * width)
        .map(|i| {
            let y = i / width;
            let x = i % width;
            ((x + y) % 256) as f32
        })
        .collect();
    ArrayD::from_shape_vec(IxDyn(&[height, width]), values).expect("demo image shape")
}

struct DemoModel {
    kind: DemoModelKind,
}

impl DemoModel {
    fn new(kind: DemoModelKind) -> Self {
        Self { kind }
    }
}

impl ModelRunner for DemoModel {
    fn predict(&mut self, inputs: &[ArrayD<f32>]) -> Result<Vec<ArrayD<f32>>, PredictError> {
        let input = &inputs[0];
        match self.kind {
            DemoModelKind::Identity => Ok(vec![input.clone()]),
            DemoModelKind::Upscale => {
                let (h, w) = (input.shape()[0], input.shape()[1]);
                let source = input
                    .view()
                    .into_dimensionality::<ndarray::Ix2>()
                    .map_err(|error| PredictError::Failure(error.into()))?;
                let mut out = ArrayD::zeros(IxDyn(&[2 * h, 2 * w]));
                for ((y, x), &value) in source.indexed_iter() {
                    for dy in 0..2 {
                        for dx in 0..2 {
                            out[IxDyn(&[2 * y + dy, 2 * x + dx])] = value;
                        }
                    }
                }
                Ok(vec![out])
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn demo_image_has_requested_shape_and_gradient() {
        let image = demo_image(4, 6);
        assert_eq!(image.shape(), &[4, 6]);
        assert_eq!(image[IxDyn(&[0, 0])], 0.0);
        assert_eq!(image[IxDyn(&[1, 2])], 3.0);
    }

    #[test]
    fn upscale_model_doubles_both_extents() {
        let mut model = DemoModel::new(DemoModelKind::Upscale);
        let out = model
            .predict(&[demo_image(3, 5)])
            .expect("predict succeeds");
        assert_eq!(out[0].shape(), &[6, 10]);
        assert_eq!(out[0][IxDyn(&[5, 9])], demo_image(3, 5)[IxDyn(&[2, 4])]);
    }

    #[test]
    fn model_kind_scales_match_their_outputs() {
        assert_eq!(DemoModelKind::Identity.scale(), 1.0);
        assert_eq!(DemoModelKind::Upscale.scale(), 2.0);
    }
}
