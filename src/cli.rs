//! Command-line interface for the factor backtester.

use crossfactor::analytics::ResultFormatter;
use crossfactor::config::{RunFileConfig, StrategySettings};
use crossfactor::data::{load_panel, Panel};
use crossfactor::error::{FactorError, Result};
use crossfactor::export::ArtifactWriter;
use crossfactor::metadata::{fingerprint_file, RunMetadata};
use crossfactor::optimizer::{MeanVarianceOptimizer, StrategyReturnMatrix};
use crossfactor::portfolio::{CombinedResult, MultiStrategyEngine};
use crossfactor::strategy::StrategyVariant;
use crossfactor::sweep::{ParameterSweep, SweepGrid};

use clap::{Parser, Subcommand, ValueEnum};
use colored::Colorize;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tabled::{builder::Builder, settings::Style};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

/// crossfactor - cross-sectional factor backtesting for multi-strategy portfolios.
#[derive(Parser)]
#[command(name = "crossfactor")]
#[command(version)]
#[command(about = "Backtest cross-sectional factor strategies with regime gating and capital reallocation")]
#[command(long_about = None)]
pub struct Cli {
    /// Verbosity level
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Output format
    #[arg(short, long, value_enum, default_value = "text", global = true)]
    pub format: OutputFormat,

    #[command(subcommand)]
    pub command: Commands,
}

/// Inputs shared by the commands that run a backtest.
#[derive(clap::Args, Debug, Clone)]
pub struct RunArgs {
    /// Path to observation CSV (overrides the config's data.path)
    #[arg(short, long)]
    pub data: Option<PathBuf>,

    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// First simulated date (YYYY-MM-DD)
    #[arg(long)]
    pub start: Option<String>,

    /// Last simulated date (YYYY-MM-DD)
    #[arg(long)]
    pub end: Option<String>,

    /// Run a single strategy variant instead of the configured set
    #[arg(short = 'S', long)]
    pub variant: Option<String>,

    /// Output path prefix for artifacts (e.g. results/run1)
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Show a progress bar
    #[arg(long)]
    pub progress: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a multi-strategy backtest
    Run(RunArgs),

    /// Run a backtest, then optimize capital weights across its strategies
    Optimize(RunArgs),

    /// Sweep factor windows across strategy variants
    Sweep {
        /// Path to observation CSV
        #[arg(short, long)]
        data: Option<PathBuf>,

        /// Path to TOML configuration file (backtest, data and regime sections)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Comma-separated variant names (default: all)
        #[arg(long, value_delimiter = ',')]
        variants: Vec<String>,

        /// Comma-separated factor windows
        #[arg(long, value_delimiter = ',', default_value = "7,14,30,60")]
        windows: Vec<usize>,

        /// Output directory for per-point artifacts
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Show a progress bar
        #[arg(long)]
        progress: bool,
    },

    /// Show information about available strategy variants
    Strategies,

    /// Validate a configuration file and/or data file
    Validate {
        /// Path to TOML configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Path to observation CSV
        #[arg(short, long)]
        data: Option<PathBuf>,
    },

    /// Generate an example configuration file
    Init {
        /// Output path for config file
        #[arg(short, long, default_value = "crossfactor.toml")]
        output: PathBuf,
    },
}

#[derive(Copy, Clone, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

impl Cli {
    /// Initialize logging based on verbosity level.
    pub fn init_logging(&self) {
        let level = match self.verbose {
            0 => Level::WARN,
            1 => Level::INFO,
            2 => Level::DEBUG,
            _ => Level::TRACE,
        };

        let subscriber = FmtSubscriber::builder()
            .with_max_level(level)
            .with_target(false)
            .with_writer(std::io::stderr)
            .finish();

        if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
            eprintln!("Failed to set tracing subscriber: {}", e);
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    cli.init_logging();

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{} {}", "error:".red().bold(), e);
            if e.is_user_error() {
                ExitCode::from(2)
            } else {
                ExitCode::from(70)
            }
        }
    }
}

/// Run the CLI application.
fn run(cli: &Cli) -> Result<()> {
    match &cli.command {
        Commands::Run(args) => run_backtest(args, cli.format).map(|_| ()),
        Commands::Optimize(args) => run_optimization(args, cli.format),
        Commands::Sweep {
            data,
            config,
            variants,
            windows,
            output,
            progress,
        } => run_sweep(
            data.as_deref(),
            config.as_deref(),
            variants,
            windows,
            output.as_deref(),
            *progress,
            cli.format,
        ),
        Commands::Strategies => {
            print_strategies();
            Ok(())
        }
        Commands::Validate { config, data } => validate(config.as_deref(), data.as_deref()),
        Commands::Init { output } => init_config(output),
    }
}

fn load_file_config(path: Option<&Path>) -> Result<RunFileConfig> {
    match path {
        Some(p) => RunFileConfig::load(p),
        None => Ok(RunFileConfig::default()),
    }
}

/// Merge command-line overrides into the file configuration.
fn resolve_config(args: &RunArgs) -> Result<RunFileConfig> {
    let mut config = load_file_config(args.config.as_deref())?;
    if let Some(start) = &args.start {
        config.backtest.start_date = Some(start.clone());
    }
    if let Some(end) = &args.end {
        config.backtest.end_date = Some(end.clone());
    }
    if let Some(variant) = &args.variant {
        config.strategies = vec![StrategySettings {
            variant: variant.clone(),
            ..Default::default()
        }];
    }
    if config.strategies.is_empty() {
        config.strategies = vec![StrategySettings::for_variant(StrategyVariant::Momentum)];
    }
    if args.progress {
        config.backtest.show_progress = true;
    }
    if let Some(data) = &args.data {
        config.data.path = Some(data.display().to_string());
    }
    Ok(config)
}

fn data_path(config: &RunFileConfig) -> Result<PathBuf> {
    config
        .data
        .path
        .as_ref()
        .map(PathBuf::from)
        .ok_or_else(|| FactorError::config("data.path", "no data file given (use --data or [data] path)"))
}

fn load_inputs(config: &RunFileConfig) -> Result<(MultiStrategyEngine, Panel, PathBuf)> {
    // Configuration is checked in full before any data is read.
    let engine = config.to_engine()?;
    let path = data_path(config)?;
    info!("Loading data from: {}", path.display());
    let panel = load_panel(&path, &config.to_data_config()?)?;
    Ok((engine, panel, path))
}

fn run_backtest(args: &RunArgs, format: OutputFormat) -> Result<(RunFileConfig, MultiStrategyEngine, CombinedResult)> {
    let config = resolve_config(args)?;
    let (engine, panel, path) = load_inputs(&config)?;
    let result = engine.run(&panel)?;

    match format {
        OutputFormat::Text => ResultFormatter::print_report(&result),
        OutputFormat::Json => println!("{}", ResultFormatter::to_json(&result.metrics)),
    }

    if let Some(prefix) = &args.output {
        let ids = engine.strategies().iter().map(|s| s.id.clone()).collect();
        let metadata = RunMetadata::new(&engine, &panel, ids).with_input(fingerprint_file(&path)?);
        let paths = ArtifactWriter::from_prefix(prefix).write_run(&result, &engine, Some(metadata))?;
        if format == OutputFormat::Text {
            for p in &paths {
                println!("  Saved: {}", p.display());
            }
        }
    }

    Ok((config, engine, result))
}

fn run_optimization(args: &RunArgs, format: OutputFormat) -> Result<()> {
    let (config, engine, result) = run_backtest(args, format)?;
    let matrix = StrategyReturnMatrix::from_runs(&result.runs)?;
    let optimizer = MeanVarianceOptimizer::new(config.to_optimizer_config(engine.config().periods_per_year));
    let optimized = optimizer.optimize(&matrix, &config.optimizer.caps, &config.optimizer.floors)?;

    match format {
        OutputFormat::Text => ResultFormatter::print_optimization(&optimized),
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&optimized)?),
    }

    if let Some(prefix) = &args.output {
        let path = ArtifactWriter::from_prefix(prefix).write_optimization(&optimized)?;
        if format == OutputFormat::Text {
            println!("  Saved: {}", path.display());
        }
    }
    Ok(())
}

fn run_sweep(
    data: Option<&Path>,
    config_path: Option<&Path>,
    variants: &[String],
    windows: &[usize],
    output: Option<&Path>,
    progress: bool,
    format: OutputFormat,
) -> Result<()> {
    let mut config = load_file_config(config_path)?;
    if let Some(d) = data {
        config.data.path = Some(d.display().to_string());
    }
    if progress {
        config.backtest.show_progress = true;
    }

    let variants = if variants.is_empty() {
        StrategyVariant::ALL.to_vec()
    } else {
        variants
            .iter()
            .map(|name| {
                StrategyVariant::from_name(name).ok_or_else(|| {
                    FactorError::config("sweep.variants", format!("unknown variant '{}'", name))
                })
            })
            .collect::<Result<Vec<_>>>()?
    };

    let mut sweep = ParameterSweep::new(
        config.to_backtest_config()?,
        config.to_regime_config(),
        SweepGrid::new(variants, windows.to_vec()),
    );
    if let Some(dir) = output {
        sweep = sweep.with_output_dir(dir);
    }
    sweep.validate()?;

    let path = data_path(&config)?;
    let panel = load_panel(&path, &config.to_data_config()?)?;
    let report = sweep.run(&panel)?;

    match format {
        OutputFormat::Text => {
            println!("{}", report.table());
            if let Some(best) = report.best_by_sharpe() {
                println!("Best by Sharpe: {}", best.point.id().green().bold());
            }
        }
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
    }
    Ok(())
}

fn print_strategies() {
    println!("{}", "Available strategy variants".bold().underline());
    println!();

    let mut builder = Builder::new();
    builder.push_record(["Variant", "Factor", "Window", "Rebalance", "Weighting", "Flexible", "Description"]);
    for variant in StrategyVariant::ALL {
        let d = variant.defaults();
        builder.push_record([
            variant.name().to_string(),
            d.factor.name(),
            d.window.to_string(),
            format!("{}d", d.rebalance_period_days),
            d.weighting_method.to_string(),
            d.capital_flexible.to_string(),
            variant.description().to_string(),
        ]);
    }
    println!("{}", builder.build().with(Style::rounded()));
    println!();
    println!("Run one with: crossfactor run -d data.csv -S momentum -o results/momentum");
}

fn validate(config_path: Option<&Path>, data: Option<&Path>) -> Result<()> {
    if config_path.is_none() && data.is_none() {
        return Err(FactorError::config("validate", "pass --config and/or --data"));
    }

    let config = load_file_config(config_path)?;
    if let Some(p) = config_path {
        println!("Validating configuration: {}", p.display());
        let engine = config.to_engine()?;
        for s in engine.strategies() {
            println!(
                "  {:<16} {:<14} weight {:.3}  window {:>3}  every {:>2}d",
                s.id,
                s.variant.name(),
                s.capital_weight,
                s.window,
                s.rebalance_period_days
            );
        }
    }

    let path = match data {
        Some(d) => Some(d.to_path_buf()),
        None => config.data.path.as_ref().map(PathBuf::from),
    };
    if let Some(path) = path {
        println!("Validating data file: {}", path.display());
        let panel = load_panel(&path, &config.to_data_config()?)?;
        println!("\nData Summary:");
        println!("  Rows:    {}", panel.observation_count());
        println!("  Symbols: {}", panel.symbols().len());
        println!("  Dates:   {}", panel.len());
        if let (Some(first), Some(last)) = (panel.dates().first(), panel.dates().last()) {
            println!("  Start:   {}", first);
            println!("  End:     {}", last);
        }
    }

    println!("\nValidation: {}", "PASSED".green().bold());
    Ok(())
}

fn init_config(output: &Path) -> Result<()> {
    std::fs::write(output, RunFileConfig::example())?;
    println!("Created example configuration file: {}", output.display());
    println!("\nEdit this file to customize your run, then:");
    println!("  crossfactor run -c {}", output.display());
    Ok(())
}
