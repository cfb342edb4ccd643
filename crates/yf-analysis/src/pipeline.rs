//! End-to-end fill: samples in, normalized yield and confidence artifacts out.
//!
//! Simulation samples are processed first, then data, one source at a time.
//! Each source is opened right before its sample is processed and dropped
//! right after.

use yf_core::{ArtifactKind, ArtifactMeta, Error, EventSource, Result, ResultSink, Variable};
use yf_io::{JsonArtifactWriter, ParquetEventSource};

use crate::config::{BackgroundMode, InputConfig, NormalizationMode, RunConfig, SampleConfig, load_variable};
use crate::normalize::{YieldSums, apply_scale, normalize, range_variable, single_bin_count};
use crate::processor::{SampleHistograms, SampleKind, SampleProcessor};

/// Opens the event source of a sample.
pub type SourceOpener<'a> = dyn Fn(&SampleConfig) -> Result<Box<dyn EventSource>> + 'a;

/// Variable descriptors of a run.
#[derive(Debug, Clone, PartialEq)]
pub struct Variables {
    /// Primary variable.
    pub primary: Variable,
    /// Secondary variable.
    pub secondary: Option<Variable>,
    /// Sideband variable, set when the background mode is `sideband`.
    pub sideband: Option<Variable>,
    /// Single-bin normalization variable, set for normalization mode `range`.
    pub normalization: Option<Variable>,
}

impl Variables {
    /// Load every descriptor the run's modes need.
    pub fn load(config: &RunConfig) -> Result<Self> {
        config.validate()?;
        let optional = |path: Option<&std::path::Path>| path.map(load_variable).transpose();
        let sideband = match config.bkgmode {
            BackgroundMode::Sideband => optional(config.sidevariable.as_deref())?,
            BackgroundMode::None => None,
        };
        let normalization = match config.normmode {
            NormalizationMode::Range => optional(config.normvariable.as_deref())?.map(|v| range_variable(&v)),
            _ => None,
        };
        Ok(Self {
            primary: load_variable(&config.variable)?,
            secondary: optional(config.yvariable.as_deref())?,
            sideband,
            normalization,
        })
    }
}

/// Normalized histograms of a run and their metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct FillOutcome {
    /// Simulation samples, scaled and clipped.
    pub simulation: Vec<SampleHistograms>,
    /// Data samples, clipped.
    pub data: Vec<SampleHistograms>,
    /// Factor applied to simulation.
    pub scale: f64,
    /// Metadata shared by both artifacts.
    pub meta: ArtifactMeta,
}

impl FillOutcome {
    fn samples(&self) -> impl Iterator<Item = &SampleHistograms> {
        self.simulation.iter().chain(&self.data)
    }

    /// Write the yield artifact, then the confidence artifact.
    pub fn write(&self, sink: &mut dyn ResultSink) -> Result<()> {
        let yields: Vec<_> = self.samples().map(SampleHistograms::yield_arrays).collect();
        sink.write(ArtifactKind::Yield, &yields, &self.meta)?;
        let confidences: Vec<_> = self.samples().map(SampleHistograms::confidence_arrays).collect();
        sink.write(ArtifactKind::Confidence, &confidences, &self.meta)
    }
}

/// Process all samples of `inputs` and normalize simulation to data.
pub fn fill(
    config: &RunConfig,
    mut inputs: InputConfig,
    variables: &Variables,
    open: &SourceOpener<'_>,
) -> Result<FillOutcome> {
    config.validate()?;
    let total_lumi = inputs.simulation_lumi();
    inputs.check_luminosity();
    if config.normmode == NormalizationMode::None {
        inputs.unit_simulation_weights();
    }

    let mut base = SampleProcessor::new(&config.treename)
        .with_entry_limit(config.nprocess)
        .with_threads(config.threads)
        .with_pileup_dir(config.pileup_dir.as_deref());
    if let Some(sideband) = &variables.sideband {
        base = base.with_sideband(sideband, config.peak);
    }
    let main = base.clone().with_fit_dump_dir(config.fit_dump_dir.as_deref());

    let process_all = |samples: &[SampleConfig], kind: SampleKind| -> Result<Vec<SampleHistograms>> {
        samples
            .iter()
            .map(|s| {
                let source = open(s)?;
                let mut h = main.process(source.as_ref(), s, kind, &variables.primary, variables.secondary.as_ref())?;
                h.clip();
                Ok(h)
            })
            .collect()
    };
    let mut simulation = process_all(&inputs.mcin, SampleKind::Simulation)?;
    let data = process_all(&inputs.datain, SampleKind::Data)?;

    let recount = |mode: NormalizationMode| -> Result<YieldSums> {
        let mut sums = YieldSums::default();
        for (samples, kind) in [(&inputs.datain, SampleKind::Data), (&inputs.mcin, SampleKind::Simulation)] {
            for s in samples {
                let source = open(s)?;
                let value = match (mode, &variables.normalization, &config.eventtreename) {
                    (NormalizationMode::Range, Some(norm), _) => {
                        single_bin_count(&base.process(source.as_ref(), s, kind, norm, None)?)?
                    }
                    (NormalizationMode::EventYield, _, Some(tree)) => {
                        base.weight_sum(source.as_ref(), tree, s, kind)?.0
                    }
                    _ => {
                        return Err(Error::Config(format!(
                            "normalization mode {mode} is missing its variable or event tree"
                        )));
                    }
                };
                match kind {
                    SampleKind::Data => sums.data += value,
                    SampleKind::Simulation => sums.simulation += value,
                }
            }
        }
        Ok(sums)
    };
    let scale = normalize(&simulation, &data, config.normmode, recount)?;
    apply_scale(&mut simulation, scale);

    Ok(FillOutcome { meta: metadata(config, variables, scale, total_lumi), simulation, data, scale })
}

fn metadata(config: &RunConfig, variables: &Variables, scale: f64, lumi: f64) -> ArtifactMeta {
    let norm = variables.normalization.as_ref();
    ArtifactMeta {
        variable: variables.primary.display_name().to_string(),
        bins: variables.primary.bins.as_slice().to_vec(),
        yvariable: variables.secondary.as_ref().map(|v| v.display_name().to_string()),
        ybins: variables.secondary.as_ref().map(|v| v.bins.as_slice().to_vec()),
        normalization: config.normmode.to_string(),
        normrange: norm.map(|v| [v.bins.low(), v.bins.high()]),
        normvariable: norm.map(|v| v.display_name().to_string()),
        scale,
        lumi,
        bkgmode: config.bkgmode.to_string(),
        treename: config.treename.clone(),
    }
}

/// Opens a sample directory of Parquet trees.
pub fn open_parquet(sample: &SampleConfig) -> Result<Box<dyn EventSource>> {
    Ok(Box::new(ParquetEventSource::open(&sample.file)?))
}

/// Load the inputs of `config`, fill, and write both JSON artifacts.
pub fn run(config: &RunConfig) -> Result<FillOutcome> {
    let inputs = InputConfig::load(&config.input)?;
    inputs.check_files()?;
    let variables = Variables::load(config)?;
    let outcome = fill(config, inputs, &variables, &open_parquet)?;
    outcome.write(&mut JsonArtifactWriter::new(&config.output))?;
    Ok(outcome)
}
