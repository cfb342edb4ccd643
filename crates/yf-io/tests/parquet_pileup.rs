//! Parquet sample directories combined with pileup profiles.

use std::collections::HashMap;

use approx::assert_relative_eq;
use yf_core::{BinEdges, EventSource, PileupReweight};
use yf_io::{Campaign, ParquetEventSource, PileupProfile, PileupTable, write_counters, write_tree};

fn write_profile(dir: &std::path::Path, campaign: &str, era: &str, values: Vec<f64>) {
    let n = values.len();
    let profile = PileupProfile { edges: BinEdges::uniform(n, 0.0, 10.0 * n as f64).unwrap(), values };
    let sub = dir.join(campaign);
    std::fs::create_dir_all(&sub).unwrap();
    std::fs::write(sub.join(format!("{era}.json")), serde_json::to_string(&profile).unwrap()).unwrap();
}

#[test]
fn pre_ul_sample_reweighting_from_parquet() {
    let sample = tempfile::tempdir().unwrap();
    // 3 events in [0, 10), 1 in [10, 20)
    let ntrue = [2.0, 4.0, 6.0, 15.0];
    write_tree(&sample.path().join("cands.parquet"), &[("_nTrueInt", &ntrue), ("_weight", &[1.0; 4])]).unwrap();
    write_counters(sample.path(), &HashMap::from([("hCounter".to_string(), 4.0)])).unwrap();

    let profiles = tempfile::tempdir().unwrap();
    // data: 50% / 50%
    write_profile(profiles.path(), "run2preul", "2016", vec![1.0, 1.0]);

    let source = ParquetEventSource::open(sample.path()).unwrap();
    assert_eq!(source.counter("hCounter").unwrap(), Some(4.0));
    let values = source.branch("cands", "_nTrueInt", None).unwrap();
    let table =
        PileupTable::for_sample(profiles.path(), Campaign::Run2PreUl, "2016PostVFP", || Ok(values.clone())).unwrap();
    let factors = table.reweight(&values).unwrap();

    // 0.5 / 0.75 and 0.5 / 0.25
    assert_relative_eq!(factors[0], 2.0 / 3.0);
    assert_relative_eq!(factors[2], 2.0 / 3.0);
    assert_relative_eq!(factors[3], 2.0);
    // reweighting preserves the number of events
    assert_relative_eq!(factors.iter().sum::<f64>(), 4.0, epsilon = 1e-12);
}

#[test]
fn run3_ratio_profiles_are_used_directly() {
    let profiles = tempfile::tempdir().unwrap();
    write_profile(profiles.path(), "run3", "2023", vec![0.8, 1.2, 1.0]);
    let table = PileupTable::for_sample(profiles.path(), Campaign::Run3, "2023combined", || {
        panic!("run3 profiles are ratios already")
    })
    .unwrap();
    assert_eq!(table.reweight(&[5.0, 15.0, 25.0, 35.0]).unwrap(), vec![0.8, 1.2, 1.0, 0.0]);
}

#[test]
fn partial_reads_follow_entry_stop() {
    let sample = tempfile::tempdir().unwrap();
    let pt: Vec<f64> = (0..100).map(f64::from).collect();
    write_tree(&sample.path().join("events.parquet"), &[("pt", &pt)]).unwrap();

    let source = ParquetEventSource::open(sample.path()).unwrap();
    assert_eq!(source.n_entries("events").unwrap(), 100);
    assert_eq!(source.branch("events", "pt", Some(10)).unwrap(), pt[..10].to_vec());
    assert!(source.branch("missing", "pt", None).is_err());
    assert!(ParquetEventSource::open(sample.path().join("nope")).is_err());
}
