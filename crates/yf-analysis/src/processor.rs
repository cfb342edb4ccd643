//! Turning one sample into its four result grids.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::Serialize;
use yf_core::{Error, EventSource, LabeledArrays, PileupReweight, Result, Variable};
use yf_fit::{PeakFit, PeakFitConfig};
use yf_hist::{Grid, Histogram1D, Secondary, aggregate, sum_weights};
use yf_io::PileupTable;

use crate::config::SampleConfig;
use crate::orchestrator::{BackgroundSubtractor, CellFit, FitObserver};

/// Per-event weight branch of simulation trees.
pub const WEIGHT_BRANCH: &str = "_weight";
/// Number of true pileup interactions per event.
pub const TRUE_INTERACTIONS_BRANCH: &str = "_nTrueInt";
/// Counter holding the sum of generated weights.
pub const SUM_WEIGHTS_COUNTER: &str = "hCounter";

/// Data or simulation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleKind {
    /// Recorded events, unit weight.
    Data,
    /// Simulated events, weighted by cross-section, luminosity and pileup.
    Simulation,
}

impl fmt::Display for SampleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Data => "data",
            Self::Simulation => "simulation",
        })
    }
}

/// Counts, errors, confidences and confidence errors of one sample.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleHistograms {
    /// Sample label as given in the input configuration.
    pub label: String,
    /// Data or simulation.
    pub kind: SampleKind,
    /// `[nx]` or `[nx, ny]`.
    pub shape: Vec<usize>,
    /// Signal counts.
    pub counts: Grid,
    /// Count errors.
    pub errors: Grid,
    /// Confidence widths (zero without background subtraction).
    pub confidences: Grid,
    /// Confidence width errors.
    pub confidence_errors: Grid,
}

impl SampleHistograms {
    /// Sum of counts over all cells.
    pub fn total(&self) -> f64 {
        self.counts.sum()
    }

    /// Multiply all four grids by `factor`.
    pub fn scale(&mut self, factor: f64) {
        for g in self.grids_mut() {
            g.scale(factor);
        }
    }

    /// Replace negative (and NaN) entries by zero in all four grids.
    pub fn clip(&mut self) {
        for g in self.grids_mut() {
            g.clip_non_negative();
        }
    }

    fn grids_mut(&mut self) -> [&mut Grid; 4] {
        [&mut self.counts, &mut self.errors, &mut self.confidences, &mut self.confidence_errors]
    }

    /// Counts and errors, flattened row-major.
    pub fn yield_arrays(&self) -> LabeledArrays {
        self.labeled(&self.counts, &self.errors)
    }

    /// Confidences and their errors, flattened row-major.
    pub fn confidence_arrays(&self) -> LabeledArrays {
        self.labeled(&self.confidences, &self.confidence_errors)
    }

    fn labeled(&self, values: &Grid, errors: &Grid) -> LabeledArrays {
        LabeledArrays {
            label: self.label.clone(),
            shape: self.shape.clone(),
            values: values.as_slice().to_vec(),
            errors: errors.as_slice().to_vec(),
        }
    }
}

/// Number of entries to read and the weight factor compensating for the
/// unread part.
pub fn entry_range(total: usize, limit: Option<usize>) -> (usize, f64) {
    match limit {
        Some(n) if n > 0 && n < total => (n, total as f64 / n as f64),
        _ => (total, 1.0),
    }
}

/// Fail before reading anything when `tree` lacks one of `required`, naming
/// every missing branch at once.
fn require_branches(source: &dyn EventSource, tree: &str, required: &[&str]) -> Result<()> {
    let available = source.branch_names(tree)?;
    let missing: Vec<&str> = required.iter().copied().filter(|b| !available.iter().any(|a| a == b)).collect();
    if missing.is_empty() {
        return Ok(());
    }
    Err(Error::DataSource(format!(
        "{}: tree '{tree}' has no branch {} (available: {})",
        source.describe(),
        missing.join(", "),
        available.join(", ")
    )))
}

/// Serialized cell fit written by [`JsonFitDumper`].
#[derive(Serialize)]
struct CellDump<'a> {
    label: &'a str,
    bin: usize,
    ybin: Option<usize>,
    histogram: &'a Histogram1D,
    fit: &'a PeakFit,
}

/// Observer writing every cell fit to `<dir>/<label>_bin<i>[_ybin<j>].json`.
#[derive(Debug, Clone)]
pub struct JsonFitDumper {
    dir: PathBuf,
    label: String,
}

impl JsonFitDumper {
    /// Dumper for sample `label` below `dir` (created if missing).
    pub fn new(dir: &Path, label: &str) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        Ok(Self { dir: dir.to_path_buf(), label: label.to_string() })
    }

    /// File name of cell `(i, j)`.
    pub fn path_for(&self, i: usize, j: Option<usize>) -> PathBuf {
        let name = match j {
            Some(j) => format!("{}_bin{i}_ybin{j}.json", self.label),
            None => format!("{}_bin{i}.json", self.label),
        };
        self.dir.join(name)
    }

    fn dump(&self, cell: &CellFit<'_>) -> Result<()> {
        let ybin = cell.two_dimensional.then_some(cell.j);
        let record =
            CellDump { label: &self.label, bin: cell.i, ybin, histogram: cell.histogram, fit: cell.fit };
        std::fs::write(self.path_for(cell.i, ybin), serde_json::to_string_pretty(&record)?)?;
        Ok(())
    }
}

impl FitObserver for JsonFitDumper {
    fn observe(&self, cell: &CellFit<'_>) {
        if let Err(e) = self.dump(cell) {
            log::warn!("could not write fit dump for {} bin {}: {e}", self.label, cell.i);
        }
    }
}

/// Reads one sample and produces its grids.
#[derive(Debug, Clone)]
pub struct SampleProcessor<'a> {
    treename: &'a str,
    entry_limit: Option<usize>,
    sideband: Option<&'a Variable>,
    peak: PeakFitConfig,
    threads: usize,
    pileup_dir: Option<&'a Path>,
    fit_dump_dir: Option<&'a Path>,
}

impl<'a> SampleProcessor<'a> {
    /// Processor reading `treename` in full, without background subtraction
    /// or pileup reweighting.
    pub fn new(treename: &'a str) -> Self {
        Self {
            treename,
            entry_limit: None,
            sideband: None,
            peak: PeakFitConfig::default(),
            threads: 0,
            pileup_dir: None,
            fit_dump_dir: None,
        }
    }

    /// Read at most `limit` entries per tree.
    pub fn with_entry_limit(mut self, limit: Option<usize>) -> Self {
        self.entry_limit = limit;
        self
    }

    /// Subtract the background by fitting `sideband` in every cell.
    pub fn with_sideband(mut self, sideband: &'a Variable, peak: PeakFitConfig) -> Self {
        self.sideband = Some(sideband);
        self.peak = peak;
        self
    }

    /// Thread count for the per-cell fits (0 = ambient rayon pool).
    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = threads;
        self
    }

    /// Reweight simulation with pileup profiles from `dir`.
    pub fn with_pileup_dir(mut self, dir: Option<&'a Path>) -> Self {
        self.pileup_dir = dir;
        self
    }

    /// Dump every cell fit below `dir`.
    pub fn with_fit_dump_dir(mut self, dir: Option<&'a Path>) -> Self {
        self.fit_dump_dir = dir;
        self
    }

    /// Per-event weights of `tree` and the number of entries they cover.
    ///
    /// Data events weigh 1. Simulation events weigh
    /// `_weight / hCounter · xsection · luminosity`, times the pileup factor
    /// when a profile directory is set. Both are multiplied by the
    /// partial-read factor.
    pub fn weights(
        &self,
        source: &dyn EventSource,
        tree: &str,
        sample: &SampleConfig,
        kind: SampleKind,
    ) -> Result<Vec<f64>> {
        let total = source.n_entries(tree)?;
        let (stop, factor) = entry_range(total, self.entry_limit);
        log::info!(
            "{}: tree {tree} has {total} entries, reading {stop} (reweighting factor {factor})",
            source.describe()
        );

        if kind == SampleKind::Data {
            return Ok(vec![factor; stop]);
        }
        let pileup = match self.pileup_dir {
            Some(dir) => {
                let (Some(campaign), Some(year)) = (sample.campaign, sample.year.as_deref()) else {
                    return Err(Error::Config(format!(
                        "sample '{}' needs campaign and year for pileup reweighting",
                        sample.label
                    )));
                };
                Some((dir, campaign, year))
            }
            None => None,
        };
        let mut required = vec![WEIGHT_BRANCH];
        if pileup.is_some() {
            required.push(TRUE_INTERACTIONS_BRANCH);
        }
        require_branches(source, tree, &required)?;

        let sum_of_weights = match source.counter(SUM_WEIGHTS_COUNTER)? {
            Some(s) if s.is_finite() && s != 0.0 => s,
            other => {
                log::warn!(
                    "{}: no valid {SUM_WEIGHTS_COUNTER} found ({other:?}), using sum of weights = 1",
                    source.describe()
                );
                1.0
            }
        };
        let norm = sample.xsection * sample.luminosity / sum_of_weights * factor;
        let mut weights: Vec<f64> =
            source.branch(tree, WEIGHT_BRANCH, Some(stop))?.into_iter().map(|w| w * norm).collect();

        if let Some((dir, campaign, year)) = pileup {
            // The sample's own profile always comes from the full tree, whatever the entry limit.
            let table =
                PileupTable::for_sample(dir, campaign, year, || source.branch(tree, TRUE_INTERACTIONS_BRANCH, None))?;
            let true_interactions = source.branch(tree, TRUE_INTERACTIONS_BRANCH, Some(stop))?;
            for (w, f) in weights.iter_mut().zip(table.reweight(&true_interactions)?) {
                *w *= f;
            }
        }
        Ok(weights)
    }

    /// `(Σw, sqrt(Σw²))` over `tree`.
    pub fn weight_sum(
        &self,
        source: &dyn EventSource,
        tree: &str,
        sample: &SampleConfig,
        kind: SampleKind,
    ) -> Result<(f64, f64)> {
        Ok(sum_weights(&self.weights(source, tree, sample, kind)?))
    }

    /// Histogram `primary` (and `secondary`) for one sample.
    ///
    /// Without a sideband variable the grids are plain weighted counts and
    /// the confidences are zero. Results are not clipped.
    pub fn process(
        &self,
        source: &dyn EventSource,
        sample: &SampleConfig,
        kind: SampleKind,
        primary: &Variable,
        secondary: Option<&Variable>,
    ) -> Result<SampleHistograms> {
        let required: Vec<&str> = [Some(primary), secondary, self.sideband]
            .into_iter()
            .flatten()
            .map(|v| v.branch.as_str())
            .collect();
        require_branches(source, self.treename, &required)?;
        let weights = self.weights(source, self.treename, sample, kind)?;
        let stop = Some(weights.len());
        let values = source.branch(self.treename, &primary.branch, stop)?;
        let secondary_values = match secondary {
            Some(v) => Some(source.branch(self.treename, &v.branch, stop)?),
            None => None,
        };
        let sec = secondary
            .zip(secondary_values.as_deref())
            .map(|(v, values)| Secondary { values, bins: &v.bins });

        let nx = primary.bins.n_bins();
        let ny = secondary.map_or(1, |v| v.bins.n_bins());
        let shape = if secondary.is_some() { vec![nx, ny] } else { vec![nx] };

        let histograms = match self.sideband {
            None => {
                let binned = aggregate(&values, &weights, &primary.bins, sec)?;
                SampleHistograms {
                    label: sample.label.clone(),
                    kind,
                    shape,
                    counts: binned.counts,
                    errors: binned.errors,
                    confidences: Grid::zeros(nx, ny),
                    confidence_errors: Grid::zeros(nx, ny),
                }
            }
            Some(sideband) => {
                let sideband_values = source.branch(self.treename, &sideband.branch, stop)?;
                let dumper = match self.fit_dump_dir {
                    Some(dir) => Some(JsonFitDumper::new(dir, sample.short_label())?),
                    None => None,
                };
                let mut subtractor = BackgroundSubtractor::new(self.peak).with_threads(self.threads);
                if let Some(d) = &dumper {
                    subtractor = subtractor.with_observer(d);
                }
                let grid = subtractor.run(&values, sec, &sideband_values, &weights, &primary.bins, &sideband.bins)?;
                SampleHistograms {
                    label: sample.label.clone(),
                    kind,
                    shape,
                    counts: grid.signal,
                    errors: grid.signal_error,
                    confidences: grid.confidence,
                    confidence_errors: grid.confidence_error,
                }
            }
        };
        log::info!("{} ({kind}): total yield {:.4}", sample.label, histograms.total());
        Ok(histograms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use yf_core::BinEdges;
    use yf_io::MemoryEventSource;

    fn sample(xsection: f64, luminosity: f64) -> SampleConfig {
        SampleConfig {
            file: "unused".into(),
            label: "toy".into(),
            luminosity,
            xsection,
            year: None,
            campaign: None,
        }
    }

    fn source() -> MemoryEventSource {
        MemoryEventSource::new("toy")
            .with_tree(
                "cands",
                vec![
                    ("pt", vec![0.5, 1.5, 1.5, 2.5]),
                    ("_weight", vec![1.0, 2.0, 3.0, 4.0]),
                ],
            )
            .unwrap()
            .with_counter("hCounter", 10.0)
    }

    #[test]
    fn test_entry_range() {
        assert_eq!(entry_range(100, None), (100, 1.0));
        assert_eq!(entry_range(100, Some(25)), (25, 4.0));
        assert_eq!(entry_range(100, Some(200)), (100, 1.0));
        assert_eq!(entry_range(100, Some(0)), (100, 1.0));
    }

    #[test]
    fn test_simulation_weights() {
        let p = SampleProcessor::new("cands");
        let w = p.weights(&source(), "cands", &sample(2.0, 5.0), SampleKind::Simulation).unwrap();
        assert_eq!(w.len(), 4);
        assert_relative_eq!(w[0], 1.0);
        assert_relative_eq!(w[3], 4.0);

        let data = p.weights(&source(), "cands", &sample(2.0, 5.0), SampleKind::Data).unwrap();
        assert_eq!(data, vec![1.0; 4]);
    }

    #[test]
    fn test_partial_read_scales_weights() {
        let p = SampleProcessor::new("cands").with_entry_limit(Some(2));
        let w = p.weights(&source(), "cands", &sample(1.0, 1.0), SampleKind::Data).unwrap();
        assert_eq!(w, vec![2.0, 2.0]);
    }

    #[test]
    fn test_missing_counter_falls_back_to_one() {
        let src = MemoryEventSource::new("nocounter")
            .with_tree("cands", vec![("_weight", vec![0.5])])
            .unwrap();
        let w = SampleProcessor::new("cands")
            .weights(&src, "cands", &sample(1.0, 1.0), SampleKind::Simulation)
            .unwrap();
        assert_eq!(w, vec![0.5]);
    }

    #[test]
    fn test_pileup_requires_campaign() {
        let dir = tempfile::tempdir().unwrap();
        let p = SampleProcessor::new("cands").with_pileup_dir(Some(dir.path()));
        let err = p.weights(&source(), "cands", &sample(1.0, 1.0), SampleKind::Simulation);
        assert!(matches!(err, Err(Error::Config(_))));
    }

    #[test]
    fn test_pileup_factors_multiply_simulation_weights() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("run2ul")).unwrap();
        std::fs::write(
            dir.path().join("run2ul/2017.json"),
            r#"{"edges": [0, 20, 40], "values": [0.5, 2.0]}"#,
        )
        .unwrap();
        let src = MemoryEventSource::new("pu")
            .with_tree("cands", vec![("_weight", vec![1.0, 1.0, 1.0]), ("_nTrueInt", vec![10.0, 30.0, 50.0])])
            .unwrap()
            .with_counter("hCounter", 1.0);
        let mut s = sample(1.0, 1.0);
        s.campaign = Some(yf_io::Campaign::Run2Ul);
        s.year = Some("2017".into());

        let w = SampleProcessor::new("cands")
            .with_pileup_dir(Some(dir.path()))
            .weights(&src, "cands", &s, SampleKind::Simulation)
            .unwrap();
        assert_eq!(w, vec![0.5, 2.0, 0.0]);
        // data is never reweighted
        let d = SampleProcessor::new("cands")
            .with_pileup_dir(Some(dir.path()))
            .weights(&src, "cands", &s, SampleKind::Data)
            .unwrap();
        assert_eq!(d, vec![1.0; 3]);
    }

    #[test]
    fn test_pre_ul_profile_uses_the_full_tree() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("run2preul")).unwrap();
        std::fs::write(dir.path().join("run2preul/2018.json"), r#"{"edges": [0, 10, 20], "values": [1, 1]}"#)
            .unwrap();
        let src = MemoryEventSource::new("pu")
            .with_tree("cands", vec![("_weight", vec![1.0; 4]), ("_nTrueInt", vec![5.0, 5.0, 15.0, 15.0])])
            .unwrap()
            .with_counter("hCounter", 1.0);
        let mut s = sample(1.0, 1.0);
        s.campaign = Some(yf_io::Campaign::Run2PreUl);
        s.year = Some("2018".into());

        // Half the tree is read, but the sample profile still sees both pileup bins equally
        // populated, so the data/simulation ratio stays 1 and only the partial-read factor remains.
        let w = SampleProcessor::new("cands")
            .with_entry_limit(Some(2))
            .with_pileup_dir(Some(dir.path()))
            .weights(&src, "cands", &s, SampleKind::Simulation)
            .unwrap();
        assert_eq!(w, vec![2.0, 2.0]);
    }

    #[test]
    fn test_missing_branches_are_reported_together() {
        let mass = Variable::new("mass", BinEdges::uniform(10, 0.44, 0.56).unwrap());
        let var = Variable::new("eta", BinEdges::new(vec![0.0, 1.0]).unwrap());
        let err = SampleProcessor::new("cands")
            .with_sideband(&mass, PeakFitConfig::default())
            .process(&source(), &sample(1.0, 1.0), SampleKind::Data, &var, None)
            .unwrap_err();
        assert!(matches!(err, Error::DataSource(_)));
        let msg = err.to_string();
        assert!(msg.contains("eta, mass"), "{msg}");
        assert!(msg.contains("available: pt, _weight"), "{msg}");
    }

    #[test]
    fn test_pileup_needs_true_interactions_branch() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = sample(1.0, 1.0);
        s.campaign = Some(yf_io::Campaign::Run2Ul);
        s.year = Some("2017".into());
        let err = SampleProcessor::new("cands")
            .with_pileup_dir(Some(dir.path()))
            .weights(&source(), "cands", &s, SampleKind::Simulation)
            .unwrap_err();
        assert!(err.to_string().contains("no branch _nTrueInt"), "{err}");
    }

    #[test]
    fn test_process_without_background() {
        let var = Variable::new("pt", BinEdges::new(vec![0.0, 1.0, 2.0, 3.0]).unwrap());
        let h = SampleProcessor::new("cands")
            .process(&source(), &sample(10.0, 1.0), SampleKind::Simulation, &var, None)
            .unwrap();
        assert_eq!(h.shape, vec![3]);
        assert_relative_eq!(h.counts.get(0, 0), 1.0);
        assert_relative_eq!(h.counts.get(1, 0), 5.0);
        assert_relative_eq!(h.errors.get(1, 0), 13f64.sqrt());
        assert_eq!(h.confidences.sum(), 0.0);
    }

    #[test]
    fn test_scale_and_clip() {
        let mut h = SampleHistograms {
            label: "x".into(),
            kind: SampleKind::Simulation,
            shape: vec![3],
            counts: Grid::from_vec(3, 1, vec![10.0, -1.0, 30.0]).unwrap(),
            errors: Grid::from_vec(3, 1, vec![1.0, 1.0, 1.0]).unwrap(),
            confidences: Grid::zeros(3, 1),
            confidence_errors: Grid::zeros(3, 1),
        };
        h.scale(2.0);
        h.clip();
        assert_eq!(h.counts.as_slice(), &[20.0, 0.0, 60.0]);
        assert_eq!(h.errors.as_slice(), &[2.0, 2.0, 2.0]);
        assert_eq!(h.yield_arrays().values, vec![20.0, 0.0, 60.0]);
    }

    #[test]
    fn test_dump_paths() {
        let dir = tempfile::tempdir().unwrap();
        let d = JsonFitDumper::new(&dir.path().join("fits"), "ttbar").unwrap();
        assert!(d.path_for(3, None).ends_with("fits/ttbar_bin3.json"));
        assert!(d.path_for(3, Some(1)).ends_with("fits/ttbar_bin3_ybin1.json"));
    }
}
