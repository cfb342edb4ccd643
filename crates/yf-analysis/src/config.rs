//! Run, input and variable configuration.
//!
//! Every configuration file is JSON or YAML, chosen by extension (`.json` is
//! JSON, anything else is read as YAML, which also accepts plain JSON).

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use yf_core::{Error, Result, Variable};
use yf_fit::PeakFitConfig;
use yf_io::Campaign;

/// Relative tolerance of the data/simulation luminosity comparison.
pub const LUMI_TOLERANCE: f64 = 1e-3;

/// Read a JSON or YAML file into `T`.
pub fn read_config_file<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let bytes = std::fs::read(path)
        .map_err(|e| Error::Config(format!("cannot read {}: {e}", path.display())))?;
    let ext = path.extension().and_then(|s| s.to_str()).unwrap_or("").to_ascii_lowercase();
    if ext == "json" {
        serde_json::from_slice(&bytes)
            .map_err(|e| Error::Config(format!("invalid JSON in {}: {e}", path.display())))
    } else {
        serde_yaml_ng::from_slice(&bytes)
            .map_err(|e| Error::Config(format!("invalid YAML in {}: {e}", path.display())))
    }
}

/// Load a variable descriptor (`name`, `variable`, `label`, `bins`).
pub fn load_variable(path: &Path) -> Result<Variable> {
    read_config_file(path)
}

/// Background treatment of the primary histogram.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackgroundMode {
    /// Plain weighted counts.
    #[default]
    None,
    /// Per-cell sideband fit of the sideband variable.
    Sideband,
}

impl FromStr for BackgroundMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "none" => Ok(Self::None),
            "sideband" => Ok(Self::Sideband),
            other => Err(Error::Config(format!(
                "unknown background mode '{other}' (expected none or sideband)"
            ))),
        }
    }
}

impl fmt::Display for BackgroundMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::None => "none",
            Self::Sideband => "sideband",
        })
    }
}

/// Policy reconciling simulation to data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NormalizationMode {
    /// No scaling; simulation luminosity and cross-section are forced to 1.
    #[default]
    None,
    /// Cross-section × luminosity weighting only.
    Lumi,
    /// Total simulation yield matched to total data yield.
    Yield,
    /// Yields matched inside the range of the normalization variable.
    Range,
    /// Event weight sums of the event tree matched.
    EventYield,
}

impl FromStr for NormalizationMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "none" => Ok(Self::None),
            "lumi" => Ok(Self::Lumi),
            "yield" => Ok(Self::Yield),
            "range" => Ok(Self::Range),
            "eventyield" => Ok(Self::EventYield),
            other => Err(Error::Config(format!(
                "unknown normalization mode '{other}' (expected none, lumi, yield, range or eventyield)"
            ))),
        }
    }
}

impl fmt::Display for NormalizationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::None => "none",
            Self::Lumi => "lumi",
            Self::Yield => "yield",
            Self::Range => "range",
            Self::EventYield => "eventyield",
        })
    }
}

/// One input sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleConfig {
    /// Sample directory.
    pub file: PathBuf,
    /// Label used for output histograms.
    pub label: String,
    /// Integrated luminosity.
    #[serde(default = "one")]
    pub luminosity: f64,
    /// Cross-section (simulation only).
    #[serde(default = "one")]
    pub xsection: f64,
    /// Data-taking year or era tag (simulation only).
    #[serde(default)]
    pub year: Option<String>,
    /// Pileup campaign (simulation only).
    #[serde(default)]
    pub campaign: Option<Campaign>,
}

fn one() -> f64 {
    1.0
}

impl SampleConfig {
    /// Label with surrounding spaces and dots removed, for file names.
    pub fn short_label(&self) -> &str {
        self.label.trim_matches(|c| c == ' ' || c == '.')
    }
}

/// `datain` and `mcin` sample lists.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputConfig {
    /// Data samples.
    pub datain: Vec<SampleConfig>,
    /// Simulation samples.
    pub mcin: Vec<SampleConfig>,
}

impl InputConfig {
    /// Load from JSON or YAML.
    pub fn load(path: &Path) -> Result<Self> {
        read_config_file(path)
    }

    /// Sum of simulation luminosities.
    pub fn simulation_lumi(&self) -> f64 {
        self.mcin.iter().map(|s| s.luminosity).sum()
    }

    /// Sum of data luminosities.
    pub fn data_lumi(&self) -> f64 {
        self.datain.iter().map(|s| s.luminosity).sum()
    }

    /// Fail with every sample path that does not exist.
    pub fn check_files(&self) -> Result<()> {
        let missing: Vec<String> = self
            .mcin
            .iter()
            .chain(&self.datain)
            .filter(|s| !s.file.exists())
            .map(|s| s.file.display().to_string())
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(Error::Config(format!(
                "following input files do not seem to exist: {}",
                missing.join(", ")
            )))
        }
    }

    /// Warn when data and simulation luminosities differ by more than
    /// [`LUMI_TOLERANCE`]. Returns whether they agree.
    pub fn check_luminosity(&self) -> bool {
        let sim = self.simulation_lumi();
        let data = self.data_lumi();
        let agree = if sim == 0.0 { data == 0.0 } else { ((data - sim) / sim).abs() <= LUMI_TOLERANCE };
        if !agree {
            log::warn!(
                "total luminosity for data ({data}) and simulation ({sim}) do not agree; \
                 data values are only used for labels, simulation values for weighting"
            );
        }
        agree
    }

    /// Force simulation luminosity and cross-section to 1 (no normalization).
    pub fn unit_simulation_weights(&mut self) {
        for s in &mut self.mcin {
            s.luminosity = 1.0;
            s.xsection = 1.0;
        }
    }
}

/// Full description of a fill run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    /// Input configuration file (`datain` / `mcin`).
    pub input: PathBuf,
    /// Candidate tree.
    pub treename: String,
    /// Primary variable descriptor file.
    pub variable: PathBuf,
    /// Output artifact path.
    pub output: PathBuf,

    /// Secondary variable descriptor file.
    #[serde(default)]
    pub yvariable: Option<PathBuf>,

    /// Background treatment.
    #[serde(default)]
    pub bkgmode: BackgroundMode,
    /// Sideband (invariant mass) variable descriptor file.
    #[serde(default)]
    pub sidevariable: Option<PathBuf>,

    /// Normalization policy.
    #[serde(default)]
    pub normmode: NormalizationMode,
    /// Normalization variable descriptor file (mode `range`).
    #[serde(default)]
    pub normvariable: Option<PathBuf>,
    /// Event-level tree (mode `eventyield`).
    #[serde(default)]
    pub eventtreename: Option<String>,

    /// Read only the first N entries of every tree.
    #[serde(default)]
    pub nprocess: Option<usize>,

    /// Threads (0 = auto). Use 1 for deterministic parity.
    #[serde(default = "default_threads")]
    pub threads: usize,

    /// Peak fit tuning.
    #[serde(default)]
    pub peak: PeakFitConfig,

    /// Directory of pileup profiles; pileup reweighting is skipped when unset.
    #[serde(default)]
    pub pileup_dir: Option<PathBuf>,

    /// Write every cell's fit detail as JSON below this directory.
    #[serde(default)]
    pub fit_dump_dir: Option<PathBuf>,
}

fn default_threads() -> usize {
    1
}

impl RunConfig {
    /// Load from JSON or YAML.
    pub fn load(path: &Path) -> Result<Self> {
        let cfg: Self = read_config_file(path)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Check that every mode has the inputs it needs.
    pub fn validate(&self) -> Result<()> {
        if self.bkgmode == BackgroundMode::Sideband && self.sidevariable.is_none() {
            return Err(Error::Config(
                "background subtraction via sideband requested, but no sideband variable given".into(),
            ));
        }
        if self.normmode == NormalizationMode::Range && self.normvariable.is_none() {
            return Err(Error::Config(
                "normalization in range requested, but no normalization variable given".into(),
            ));
        }
        if self.normmode == NormalizationMode::EventYield && self.eventtreename.is_none() {
            return Err(Error::Config(
                "normalization by event yield requested, but no event tree name given".into(),
            ));
        }
        if self.nprocess == Some(0) {
            return Err(Error::Config("nprocess must be positive".into()));
        }
        Ok(())
    }
}
