use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tsne_core::{Init, Tsne, TsneParams, TsneResult};
use tsne_store::{DataFile, ExchangeKind, ExchangeParams, ResultFile, RunConfig, identify, tsv};

#[derive(Parser)]
#[command(name = "bhtsne", about = "Barnes-Hut t-SNE dimensionality reduction")]
struct Cli {
    /// Enable verbose debug output
    #[arg(long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Embed a dataset into 2 or 3 dimensions
    Run(RunArgs),

    /// Pack a text matrix and run parameters into a binary data file
    Pack {
        /// Whitespace-separated input matrix
        #[arg(short, long)]
        input: PathBuf,

        /// Data file to write
        #[arg(short, long)]
        output: PathBuf,

        #[command(flatten)]
        params: ParamArgs,

        /// TOML file with run parameters
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Show the header of a data or result file
    Inspect {
        path: PathBuf,

        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Args)]
struct RunArgs {
    /// Input matrix: text rows, or a `.dat` data file
    #[arg(short, long)]
    input: PathBuf,

    /// Where to write the embedding: text rows, or a `.dat` result file
    #[arg(short, long)]
    output: PathBuf,

    #[command(flatten)]
    params: ParamArgs,

    /// Rescale the embedding into [0, 1] per axis
    #[arg(long)]
    unit_scale: bool,

    /// Write a JSON run summary to this path
    #[arg(long)]
    report: Option<PathBuf>,

    /// TOML file with run parameters
    #[arg(long)]
    config: Option<PathBuf>,
}

/// Parameter flags. Anything given here wins over the config and data file.
#[derive(Args)]
struct ParamArgs {
    /// Output dimensionality (2 or 3)
    #[arg(short = 'd', long)]
    no_dims: Option<usize>,

    /// Target perplexity
    #[arg(short, long)]
    perplexity: Option<f64>,

    /// Barnes-Hut accuracy; 0 runs exact t-SNE
    #[arg(short, long)]
    theta: Option<f64>,

    /// Random seed
    #[arg(short = 'r', long)]
    seed: Option<u64>,

    /// Number of gradient descent iterations
    #[arg(long)]
    max_iter: Option<usize>,

    /// Initial layout
    #[arg(long, value_enum)]
    init: Option<InitArg>,
}

#[derive(Clone, Copy, ValueEnum)]
enum InitArg {
    Random,
    Pca,
}

impl ParamArgs {
    fn apply(&self, params: &mut TsneParams) {
        if let Some(d) = self.no_dims {
            params.no_dims = d;
        }
        if let Some(p) = self.perplexity {
            params.perplexity = p;
        }
        if let Some(t) = self.theta {
            params.theta = t;
        }
        if let Some(s) = self.seed {
            params.seed = Some(s);
        }
        if let Some(m) = self.max_iter {
            params.max_iter = m;
        }
        if let Some(init) = self.init {
            params.init = match init {
                InitArg::Random => Init::Random,
                InitArg::Pca => Init::Pca,
            };
        }
    }
}

/// Summary written by `run --report`.
#[derive(Serialize)]
struct RunReport<'a> {
    points: usize,
    input_dims: usize,
    output_dims: usize,
    iterations: usize,
    cancelled: bool,
    kl_divergence: f64,
    neighbors: usize,
    unconverged: &'a [usize],
    degenerate: &'a [usize],
    elapsed_secs: f64,
    params: &'a TsneParams,
}

fn init_tracing(verbose: bool) {
    use tracing_subscriber::EnvFilter;

    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::from_default_env().add_directive(tracing::Level::WARN.into())
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Commands::Run(args) => cmd_run(args).await,
        Commands::Pack {
            input,
            output,
            params,
            config,
        } => cmd_pack(&input, &output, &params, config.as_deref()),
        Commands::Inspect { path, json } => cmd_inspect(&path, json),
    }
}

fn is_exchange(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("dat"))
}

fn load_config(path: Option<&Path>) -> Result<RunConfig> {
    match path {
        Some(p) => {
            RunConfig::load(p).with_context(|| format!("failed to load config {}", p.display()))
        }
        None => Ok(RunConfig::default()),
    }
}

/// Resolves when SIGTERM or SIGINT arrives. Never resolves if the handlers
/// can't be installed.
async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let (mut sigterm, mut sigint) =
            match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
                (Ok(term), Ok(int)) => (term, int),
                (Err(e), _) | (_, Err(e)) => {
                    tracing::warn!("signal handlers unavailable: {e}");
                    return std::future::pending().await;
                }
            };

        tokio::select! {
            _ = sigterm.recv() => tracing::info!("received SIGTERM"),
            _ = sigint.recv() => tracing::info!("received SIGINT"),
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!("ctrl+c handler unavailable: {e}");
            return std::future::pending().await;
        }
        tracing::info!("received Ctrl+C");
    }
}

async fn cmd_run(args: RunArgs) -> Result<()> {
    // Listen before any heavy work so an early signal still cancels cleanly.
    let cancel = Arc::new(AtomicBool::new(false));
    let listener = {
        let cancel = Arc::clone(&cancel);
        tokio::spawn(async move {
            wait_for_shutdown_signal().await;
            tracing::warn!("stopping at the next iteration");
            cancel.store(true, Ordering::Relaxed);
        })
    };

    // Flags beat the config file, which beats the data file header.
    let (mut config, data) = if is_exchange(&args.input) {
        let file = DataFile::load(&args.input)
            .with_context(|| format!("failed to read data file {}", args.input.display()))?;
        let config = RunConfig::load_over(args.config.as_deref(), &file.params)
            .context("failed to load config over the data file header")?;
        (config, file.samples)
    } else {
        let samples = tsv::load_matrix(&args.input)
            .with_context(|| format!("failed to read {}", args.input.display()))?;
        (load_config(args.config.as_deref())?, samples)
    };
    args.params.apply(&mut config.params);
    let unit_scale = config.unit_scale || args.unit_scale;

    let (points, input_dims) = (data.rows(), data.cols());
    let tsne = Tsne::new(config.params);
    let start = Instant::now();
    let job = {
        let cancel = Arc::clone(&cancel);
        tokio::task::spawn_blocking(move || {
            let result = tsne.run_with_cancel(&data, Some(&*cancel));
            (tsne, result)
        })
    };
    let (tsne, result) = job.await.context("embedding task panicked")?;
    listener.abort();
    let mut result = result.context("embedding failed")?;
    let elapsed = start.elapsed().as_secs_f64();

    if unit_scale {
        result.embedding.scale_to_unit_box();
    }
    write_embedding(&args.output, &result)?;

    if let Some(path) = &args.report {
        let report = RunReport {
            points,
            input_dims,
            output_dims: result.embedding.dims(),
            iterations: result.status.iterations,
            cancelled: result.status.cancelled,
            kl_divergence: result.cost.total,
            neighbors: result.report.neighbors,
            unconverged: &result.report.unconverged,
            degenerate: &result.report.degenerate,
            elapsed_secs: elapsed,
            params: tsne.params(),
        };
        std::fs::write(path, serde_json::to_string_pretty(&report)?)
            .with_context(|| format!("failed to write report {}", path.display()))?;
    }

    if result.status.cancelled {
        tracing::warn!(
            "cancelled after {} iterations; wrote partial embedding",
            result.status.iterations
        );
    }
    println!(
        "embedded {points} points into {} dims: {} iterations, KL {:.6}",
        result.embedding.dims(),
        result.status.iterations,
        result.cost.total
    );
    Ok(())
}

fn write_embedding(path: &Path, result: &TsneResult) -> Result<()> {
    let written = if is_exchange(path) {
        ResultFile::from_result(result).save(path)
    } else {
        tsv::save_embedding(path, &result.embedding)
    };
    written.with_context(|| format!("failed to write {}", path.display()))
}

fn cmd_pack(input: &Path, output: &Path, flags: &ParamArgs, config: Option<&Path>) -> Result<()> {
    let mut params = load_config(config)?.params;
    flags.apply(&mut params);

    let samples = tsv::load_matrix(input)
        .with_context(|| format!("failed to read {}", input.display()))?;
    params
        .validate(samples.rows())
        .context("parameters do not fit the data")?;

    let file = DataFile {
        params: ExchangeParams::from_params(&params),
        samples,
    };
    file.save(output)
        .with_context(|| format!("failed to write {}", output.display()))?;
    println!(
        "packed {} x {} into {}",
        file.samples.rows(),
        file.samples.cols(),
        output.display()
    );
    Ok(())
}

fn cmd_inspect(path: &Path, json: bool) -> Result<()> {
    let kind = identify(path).with_context(|| format!("failed to inspect {}", path.display()))?;
    let summary = match kind {
        ExchangeKind::Data => {
            let file = DataFile::load(path)?;
            let p = &file.params;
            serde_json::json!({
                "kind": "data",
                "points": file.samples.rows(),
                "dims": file.samples.cols(),
                "theta": p.theta,
                "perplexity": p.perplexity,
                "no_dims": p.no_dims,
                "max_iter": p.max_iter,
                "seed": p.seed,
            })
        }
        ExchangeKind::Result => {
            let file = ResultFile::load(path)?;
            serde_json::json!({
                "kind": "result",
                "points": file.embedding.n(),
                "dims": file.embedding.dims(),
                "kl_divergence": file.costs.iter().sum::<f64>(),
                "bounds": file.embedding.bounds(),
            })
        }
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
        return Ok(());
    }
    let Some(fields) = summary.as_object() else {
        bail!("unexpected summary shape");
    };
    for (key, value) in fields {
        println!("{:<14}{value}", format!("{key}:"));
    }
    Ok(())
}
