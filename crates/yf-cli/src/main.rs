//! yieldfit CLI

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use yf_analysis::{
    BackgroundMode, NormalizationMode, RunConfig, SampleConfig, SampleKind, SampleProcessor, load_variable,
};
use yf_core::{BinEdges, EventSource, Variable};
use yf_fit::{ExtractionMode, PeakFitConfig, fit_peak};
use yf_hist::Histogram1D;
use yf_io::ParquetEventSource;

#[derive(Parser)]
#[command(name = "yieldfit")]
#[command(about = "yieldfit - binned signal yields with sideband background subtraction")]
#[command(version)]
struct Cli {
    /// Log verbosity level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "warn")]
    log_level: tracing::Level,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fill normalized data and simulation histograms
    Fill(FillArgs),

    /// Fit the sideband distribution of a single sample
    Peak {
        /// Sample directory (Parquet trees)
        #[arg(short, long)]
        sample: PathBuf,

        /// Tree to read
        #[arg(short, long)]
        treename: String,

        /// Sideband variable descriptor (JSON or YAML)
        #[arg(long)]
        sidevariable: PathBuf,

        /// Restrict to one bin of this variable
        #[arg(long, requires = "bin")]
        variable: Option<PathBuf>,

        /// Bin index of --variable
        #[arg(long, requires = "variable")]
        bin: Option<usize>,

        /// Weight events as simulation (_weight / hCounter)
        #[arg(long)]
        simulation: bool,

        /// Peak extraction mode compared against cut-and-count
        #[arg(long, default_value = "hybrid")]
        mode: ExtractionMode,

        /// Read only the first N entries
        #[arg(long)]
        nprocess: Option<usize>,

        /// Output file for results (pretty JSON). Defaults to stdout.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Print version information
    Version,
}

#[derive(clap::Args)]
struct FillArgs {
    /// Run configuration (JSON or YAML); replaces all other options
    #[arg(short, long, conflicts_with_all = ["input", "treename", "variable", "output"])]
    config: Option<PathBuf>,

    /// Input configuration with `datain` and `mcin` sample lists
    #[arg(short, long, required_unless_present = "config")]
    input: Option<PathBuf>,

    /// Candidate tree name
    #[arg(short, long, required_unless_present = "config")]
    treename: Option<String>,

    /// Primary variable descriptor
    #[arg(long, required_unless_present = "config")]
    variable: Option<PathBuf>,

    /// Output artifact; confidences go to <stem>_confidence.json
    #[arg(short, long, required_unless_present = "config")]
    output: Option<PathBuf>,

    /// Secondary variable descriptor
    #[arg(long)]
    yvariable: Option<PathBuf>,

    /// Background mode (none, sideband)
    #[arg(long, default_value = "none")]
    bkgmode: BackgroundMode,

    /// Sideband variable descriptor
    #[arg(long)]
    sidevariable: Option<PathBuf>,

    /// Normalization mode (none, lumi, yield, range, eventyield)
    #[arg(long, default_value = "none")]
    normmode: NormalizationMode,

    /// Normalization variable descriptor (normmode range)
    #[arg(long)]
    normvariable: Option<PathBuf>,

    /// Event-level tree (normmode eventyield)
    #[arg(long)]
    eventtreename: Option<String>,

    /// Read only the first N entries of every tree
    #[arg(long)]
    nprocess: Option<usize>,

    /// Threads (0 = auto). Use 1 for deterministic parity.
    #[arg(long, default_value = "1")]
    threads: usize,

    /// Peak extraction mode (subtract, gfit, hybrid)
    #[arg(long, default_value = "hybrid")]
    fit_mode: ExtractionMode,

    /// Pileup profile directory; no pileup reweighting when unset
    #[arg(long)]
    pileup_dir: Option<PathBuf>,

    /// Write every cell's fit detail as JSON into this directory
    #[arg(long)]
    fit_dump_dir: Option<PathBuf>,
}

impl FillArgs {
    fn into_config(self) -> Result<RunConfig> {
        if let Some(path) = &self.config {
            return RunConfig::load(path).with_context(|| format!("loading run config {}", path.display()));
        }
        let (Some(input), Some(treename), Some(variable), Some(output)) =
            (self.input, self.treename, self.variable, self.output)
        else {
            anyhow::bail!("--input, --treename, --variable and --output are required without --config");
        };
        let config = RunConfig {
            input,
            treename,
            variable,
            output,
            yvariable: self.yvariable,
            bkgmode: self.bkgmode,
            sidevariable: self.sidevariable,
            normmode: self.normmode,
            normvariable: self.normvariable,
            eventtreename: self.eventtreename,
            nprocess: self.nprocess,
            threads: self.threads,
            peak: PeakFitConfig { mode: self.fit_mode, ..Default::default() },
            pileup_dir: self.pileup_dir,
            fit_dump_dir: self.fit_dump_dir,
        };
        config.validate()?;
        Ok(config)
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_max_level(cli.log_level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Fill(args) => cmd_fill(args),
        Commands::Peak { sample, treename, sidevariable, variable, bin, simulation, mode, nprocess, output } => {
            let selection = variable.zip(bin);
            cmd_peak(&sample, &treename, &sidevariable, selection, simulation, mode, nprocess, output.as_ref())
        }
        Commands::Version => {
            println!("yieldfit {}", yf_core::VERSION);
            Ok(())
        }
    }
}

fn cmd_fill(args: FillArgs) -> Result<()> {
    let config = args.into_config()?;
    tracing::info!(
        input = %config.input.display(),
        bkgmode = %config.bkgmode,
        normmode = %config.normmode,
        threads = config.threads,
        "starting fill"
    );

    let outcome = yf_analysis::run(&config)?;
    tracing::info!(
        simulation = outcome.simulation.len(),
        data = outcome.data.len(),
        scale = outcome.scale,
        "samples processed"
    );
    tracing::info!(
        yields = %config.output.display(),
        confidences = %yf_io::confidence_path(&config.output).display(),
        "artifacts written"
    );
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn cmd_peak(
    sample: &Path,
    treename: &str,
    sidevariable: &Path,
    selection: Option<(PathBuf, usize)>,
    simulation: bool,
    mode: ExtractionMode,
    nprocess: Option<usize>,
    output: Option<&PathBuf>,
) -> Result<()> {
    let sideband = load_variable(sidevariable)
        .with_context(|| format!("loading sideband variable {}", sidevariable.display()))?;
    let source = ParquetEventSource::open(sample)?;
    tracing::info!(sample = %source.describe(), tree = treename, "reading sample");

    let sample_config = SampleConfig {
        file: sample.to_path_buf(),
        label: source.describe(),
        luminosity: 1.0,
        xsection: 1.0,
        year: None,
        campaign: None,
    };
    let kind = if simulation { SampleKind::Simulation } else { SampleKind::Data };
    let processor = SampleProcessor::new(treename).with_entry_limit(nprocess);
    let mut weights = processor.weights(&source, treename, &sample_config, kind)?;
    let stop = Some(weights.len());
    let mut values = source.branch(treename, &sideband.branch, stop)?;

    let selected = match &selection {
        Some((path, bin)) => {
            let variable = load_variable(path).with_context(|| format!("loading variable {}", path.display()))?;
            let edges = bin_range(&variable, *bin)?;
            let primary = source.branch(treename, &variable.branch, stop)?;
            let keep: Vec<bool> = primary.iter().map(|&p| edges.low() < p && p < edges.high()).collect();
            values = values.iter().zip(&keep).filter(|(_, k)| **k).map(|(v, _)| *v).collect();
            weights = weights.iter().zip(&keep).filter(|(_, k)| **k).map(|(w, _)| *w).collect();
            Some(serde_json::json!({
                "variable": variable.display_name(),
                "bin": bin,
                "range": [edges.low(), edges.high()],
            }))
        }
        None => None,
    };

    let histogram = Histogram1D::fill(sideband.bins.clone(), &values, &weights)?;
    let counting = fit_peak(&histogram, PeakFitConfig { mode: ExtractionMode::Subtract, ..Default::default() });
    let fitted = fit_peak(&histogram, PeakFitConfig { mode, ..Default::default() });
    tracing::info!(
        cut_and_count = counting.estimate.signal,
        fit = fitted.estimate.signal,
        confidence = fitted.estimate.confidence,
        "peak fit complete"
    );

    let output_json = serde_json::json!({
        "sample": sample.display().to_string(),
        "treename": treename,
        "sidevariable": sideband.display_name(),
        "selection": selected,
        "effective_entries": histogram.effective_entries(),
        "histogram": histogram,
        "cut_and_count": counting,
        "fit": fitted,
        "mode": mode.to_string(),
    });
    write_json(output, output_json)
}

fn bin_range(variable: &Variable, bin: usize) -> Result<BinEdges> {
    let n = variable.bins.n_bins();
    anyhow::ensure!(bin < n, "bin {bin} out of range: {} has {n} bins", variable.display_name());
    let edges = variable.bins.as_slice();
    Ok(BinEdges::new(vec![edges[bin], edges[bin + 1]])?)
}

fn write_json(output: Option<&PathBuf>, value: serde_json::Value) -> Result<()> {
    if let Some(path) = output {
        std::fs::write(path, serde_json::to_string_pretty(&value)?)?;
    } else {
        println!("{}", serde_json::to_string_pretty(&value)?);
    }
    Ok(())
}
