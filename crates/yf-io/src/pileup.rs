//! Pileup reweighting from binned ratio tables.
//!
//! Profiles live under a profile directory as
//! `<dir>/<campaign>/<era>.json` with content `{"edges": [...], "values": [...]}`.
//! For `run2ul` and `run3` the stored values already are data/simulation
//! ratios. For `run2preul` they are the data pileup profile, and the ratio is
//! formed per sample against that sample's own true-interaction distribution.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use yf_core::{BinEdges, Error, PileupReweight, Result};
use yf_hist::Histogram1D;

/// Data-taking campaign, selecting the profile layout and ratio convention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Campaign {
    /// Run 2, pre-ultra-legacy: per-sample ratio against the data profile.
    Run2PreUl,
    /// Run 2, ultra-legacy: stored ratio.
    Run2Ul,
    /// Run 3: stored ratio.
    Run3,
}

impl Campaign {
    /// Whether stored profiles must be divided by the sample's own profile.
    pub fn needs_sample_profile(self) -> bool {
        self == Self::Run2PreUl
    }

    /// Directory-level era for a sample `year` tag.
    pub fn era(self, year: &str) -> Result<String> {
        match self {
            Self::Run2PreUl | Self::Run2Ul => {
                let year = if year.starts_with("2016") { "2016" } else { year };
                if ["2016", "2017", "2018"].contains(&year) {
                    Ok(year.to_string())
                } else {
                    Err(Error::Config(format!("year '{year}' not recognized for campaign {self}")))
                }
            }
            Self::Run3 => {
                const ERAS: [&str; 9] = [
                    "2022",
                    "2022preEE",
                    "2022postEE",
                    "2022combined",
                    "2023",
                    "2023combined",
                    "2023preBPix",
                    "2023postBPix",
                    "2024",
                ];
                if !ERAS.contains(&year) {
                    return Err(Error::Config(format!(
                        "year '{year}' not recognized for campaign {self}"
                    )));
                }
                Ok(year.trim_end_matches(|c: char| "prepostcombinedABCDEFGHI".contains(c)).to_string())
            }
        }
    }

    /// Location of the profile for `year` under `dir`.
    pub fn profile_path(self, dir: &Path, year: &str) -> Result<PathBuf> {
        Ok(dir.join(self.to_string()).join(format!("{}.json", self.era(year)?)))
    }
}

impl FromStr for Campaign {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "run2preul" => Ok(Self::Run2PreUl),
            "run2ul" => Ok(Self::Run2Ul),
            "run3" => Ok(Self::Run3),
            other => Err(Error::Config(format!("campaign '{other}' not recognized"))),
        }
    }
}

impl fmt::Display for Campaign {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Run2PreUl => "run2preul",
            Self::Run2Ul => "run2ul",
            Self::Run3 => "run3",
        })
    }
}

/// On-disk binned profile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PileupProfile {
    /// Bin edges in number of true interactions.
    pub edges: BinEdges,
    /// Per-bin content.
    pub values: Vec<f64>,
}

impl PileupProfile {
    /// Read a profile from JSON.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("pileup profile {} does not seem to exist: {e}", path.display()))
        })?;
        let profile: Self = serde_json::from_str(&text)?;
        if profile.values.len() != profile.edges.n_bins() {
            return Err(Error::Config(format!(
                "pileup profile {}: {} values for {} bins",
                path.display(),
                profile.values.len(),
                profile.edges.n_bins()
            )));
        }
        Ok(profile)
    }

    fn normalized(&self) -> Vec<f64> {
        let total: f64 = self.values.iter().sum();
        if total > 0.0 { self.values.iter().map(|v| v / total).collect() } else { vec![0.0; self.values.len()] }
    }
}

/// Per-bin reweighting factors, looked up by bin (out of range → 0).
#[derive(Debug, Clone, PartialEq)]
pub struct PileupTable {
    edges: BinEdges,
    ratio: Vec<f64>,
}

impl PileupTable {
    /// Table from ready-made ratios.
    pub fn from_ratio(profile: PileupProfile) -> Self {
        Self { edges: profile.edges, ratio: profile.values }
    }

    /// Normalized data profile divided by the normalized distribution of the
    /// sample's true interactions. Bins empty in simulation get factor 0.
    pub fn from_data_profile(data: &PileupProfile, sample_true_interactions: &[f64]) -> Result<Self> {
        let ones = vec![1.0; sample_true_interactions.len()];
        let sim = Histogram1D::fill(data.edges.clone(), sample_true_interactions, &ones)?;
        let sim_total = sim.total();
        let ratio = data
            .normalized()
            .into_iter()
            .zip(sim.counts())
            .map(|(d, &s)| if s > 0.0 && sim_total > 0.0 { d / (s / sim_total) } else { 0.0 })
            .collect();
        Ok(Self { edges: data.edges.clone(), ratio })
    }

    /// Resolve and load the table for a sample.
    ///
    /// `sample_true_interactions` is only read for campaigns that need the
    /// sample's own profile.
    pub fn for_sample(
        dir: &Path,
        campaign: Campaign,
        year: &str,
        sample_true_interactions: impl FnOnce() -> Result<Vec<f64>>,
    ) -> Result<Self> {
        let path = campaign.profile_path(dir, year)?;
        let profile = PileupProfile::load(&path)?;
        log::debug!("pileup profile for {campaign}/{year}: {}", path.display());
        if campaign.needs_sample_profile() {
            Self::from_data_profile(&profile, &sample_true_interactions()?)
        } else {
            Ok(Self::from_ratio(profile))
        }
    }

    /// Factor for one value.
    pub fn factor(&self, true_interactions: f64) -> f64 {
        self.edges.find_bin(true_interactions).map_or(0.0, |b| self.ratio[b])
    }
}

impl PileupReweight for PileupTable {
    fn reweight(&self, true_interactions: &[f64]) -> Result<Vec<f64>> {
        Ok(true_interactions.iter().map(|&n| self.factor(n)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn profile(values: Vec<f64>) -> PileupProfile {
        let n = values.len();
        PileupProfile { edges: BinEdges::uniform(n, 0.0, n as f64).unwrap(), values }
    }

    #[test]
    fn test_era_resolution() {
        assert_eq!(Campaign::Run2Ul.era("2016PreVFP").unwrap(), "2016");
        assert_eq!(Campaign::Run2PreUl.era("2018").unwrap(), "2018");
        assert!(matches!(Campaign::Run2Ul.era("2019"), Err(Error::Config(_))));
        assert_eq!(Campaign::Run3.era("2022postEE").unwrap(), "2022");
        assert_eq!(Campaign::Run3.era("2023combined").unwrap(), "2023");
        assert!(Campaign::Run3.era("2021").is_err());
        assert!("run4".parse::<Campaign>().is_err());
        assert_eq!(
            Campaign::Run3.profile_path(Path::new("/pu"), "2022preEE").unwrap(),
            PathBuf::from("/pu/run3/2022.json")
        );
    }

    #[test]
    fn test_ratio_lookup_out_of_range_is_zero() {
        let table = PileupTable::from_ratio(profile(vec![0.5, 1.0, 2.0]));
        assert_eq!(table.reweight(&[0.5, 1.5, 3.0, 3.5, -1.0]).unwrap(), vec![0.5, 1.0, 2.0, 0.0, 0.0]);
    }

    #[test]
    fn test_pre_ul_ratio_uses_sample_profile() {
        // data: 25% / 75%; simulation: 50% / 50%
        let data = profile(vec![1.0, 3.0]);
        let table = PileupTable::from_data_profile(&data, &[0.5, 0.5, 1.5, 1.5]).unwrap();
        assert_relative_eq!(table.factor(0.2), 0.5);
        assert_relative_eq!(table.factor(1.2), 1.5);

        let empty_bin = PileupTable::from_data_profile(&data, &[0.5]).unwrap();
        assert_eq!(empty_bin.factor(1.5), 0.0);
    }

    #[test]
    fn test_for_sample_reads_json_profile() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("run2ul")).unwrap();
        std::fs::write(
            dir.path().join("run2ul/2017.json"),
            serde_json::to_string(&profile(vec![0.9, 1.1])).unwrap(),
        )
        .unwrap();
        let table = PileupTable::for_sample(dir.path(), Campaign::Run2Ul, "2017", || {
            panic!("UL campaigns never read the sample profile")
        })
        .unwrap();
        assert_eq!(table.factor(1.0), 1.1);
        assert!(PileupTable::for_sample(dir.path(), Campaign::Run2Ul, "2018", || Ok(vec![])).is_err());
    }
}
