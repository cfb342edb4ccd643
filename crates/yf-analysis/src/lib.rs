//! # yf-analysis
//!
//! The fill pipeline of yieldfit: run configuration, per-cell background
//! subtraction, per-sample processing and the normalization of simulation
//! to data.
//!
//! ```text
//! RunConfig ──► Variables ──► SampleProcessor (per sample)
//!                               ├── aggregate            (bkgmode none)
//!                               └── BackgroundSubtractor (bkgmode sideband)
//!                                     └── fit_peak per cell, on rayon
//!           ──► normalize ──► FillOutcome ──► ResultSink
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod normalize;
pub mod orchestrator;
pub mod pipeline;
pub mod processor;

pub use config::{
    BackgroundMode, InputConfig, LUMI_TOLERANCE, NormalizationMode, RunConfig, SampleConfig, load_variable,
    read_config_file,
};
pub use normalize::{YieldSums, apply_scale, normalize, range_variable, single_bin_count};
pub use orchestrator::{BackgroundSubtractor, CellFit, FitObserver, PeakGrid, subtract_background};
pub use pipeline::{FillOutcome, SourceOpener, Variables, fill, open_parquet, run};
pub use processor::{JsonFitDumper, SampleHistograms, SampleKind, SampleProcessor, entry_range};
