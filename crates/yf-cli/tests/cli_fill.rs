use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use yf_io::{write_counters, write_tree};

fn bin_path() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_yieldfit"))
}

fn run(args: &[&str]) -> Output {
    Command::new(bin_path())
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("failed to run {:?} {:?}: {}", bin_path(), args, e))
}

fn write_json(path: &Path, value: serde_json::Value) -> String {
    std::fs::write(path, serde_json::to_string_pretty(&value).unwrap()).unwrap();
    path.to_str().unwrap().to_string()
}

/// Data and simulation sample directories plus descriptors under `root`.
fn fixture(root: &Path) -> (String, String, String) {
    let n = 300;
    let mass: Vec<f64> = (0..n)
        .map(|k| {
            if k % 3 == 0 {
                0.44 + 0.12 * (k as f64 + 0.5) / n as f64
            } else {
                0.5 + 0.002 * ((k % 5) as f64 - 2.0)
            }
        })
        .collect();
    let pt: Vec<f64> = (0..n).map(|k| (k % 3) as f64 + 0.5).collect();

    let data = root.join("data");
    std::fs::create_dir_all(&data).unwrap();
    write_tree(&data.join("cands.parquet"), &[("mass", &mass), ("pt", &pt)]).unwrap();

    let sim = root.join("sim");
    std::fs::create_dir_all(&sim).unwrap();
    let weight = vec![0.5; n];
    write_tree(&sim.join("cands.parquet"), &[("mass", &mass), ("pt", &pt), ("_weight", &weight)]).unwrap();
    write_counters(&sim, &HashMap::from([("hCounter".to_string(), 1.0)])).unwrap();

    let input = write_json(
        &root.join("inputs.json"),
        serde_json::json!({
            "datain": [{"file": data, "label": "data"}],
            "mcin": [{"file": sim, "label": "sim"}],
        }),
    );
    let variable = write_json(
        &root.join("pt.json"),
        serde_json::json!({"name": "pt", "variable": "pt", "bins": [0, 1, 2, 3]}),
    );
    let mass_bins: Vec<f64> = (0..=30).map(|i| 0.44 + 0.004 * i as f64).collect();
    let sidevariable =
        write_json(&root.join("mass.json"), serde_json::json!({"name": "mass", "variable": "mass", "bins": mass_bins}));
    (input, variable, sidevariable)
}

#[test]
fn version_prints_crate_version() {
    let out = run(&["version"]);
    assert!(out.status.success());
    let stdout = String::from_utf8(out.stdout).unwrap();
    assert!(stdout.starts_with("yieldfit "), "stdout={stdout}");
}

#[test]
fn fill_with_flags_writes_normalized_artifacts() {
    let dir = tempfile::tempdir().unwrap();
    let (input, variable, _) = fixture(dir.path());
    let output = dir.path().join("result.json");

    let out = run(&[
        "fill",
        "--input",
        &input,
        "--treename",
        "cands",
        "--variable",
        &variable,
        "--output",
        output.to_str().unwrap(),
        "--normmode",
        "yield",
    ]);
    assert!(out.status.success(), "stderr={}", String::from_utf8_lossy(&out.stderr));

    let v: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&output).unwrap()).unwrap();
    assert_eq!(v["kind"], "yield");
    assert_eq!(v["meta"]["normalization"], "yield");
    assert_eq!(v["meta"]["scale"], 2.0);
    let histograms = v["histograms"].as_array().unwrap();
    assert_eq!(histograms[0]["label"], "sim");
    assert_eq!(histograms[1]["label"], "data");
    assert_eq!(histograms[0]["values"], histograms[1]["values"]);
    assert!(dir.path().join("result_confidence.json").is_file());
}

#[test]
fn fill_from_yaml_config_with_sideband() {
    let dir = tempfile::tempdir().unwrap();
    let (input, variable, sidevariable) = fixture(dir.path());
    let output = dir.path().join("out/sideband.json");
    let config = dir.path().join("run.yaml");
    std::fs::write(
        &config,
        format!(
            "input: {input}\ntreename: cands\nvariable: {variable}\noutput: {}\n\
             bkgmode: sideband\nsidevariable: {sidevariable}\nnormmode: lumi\nthreads: 2\n\
             peak:\n  mode: subtract\n",
            output.display()
        ),
    )
    .unwrap();

    let out = run(&["fill", "--config", config.to_str().unwrap()]);
    assert!(out.status.success(), "stderr={}", String::from_utf8_lossy(&out.stderr));
    let v: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&output).unwrap()).unwrap();
    assert_eq!(v["meta"]["bkgmode"], "sideband");
    assert_eq!(v["meta"]["scale"], 1.0);
    let conf: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(dir.path().join("out/sideband_confidence.json")).unwrap())
            .unwrap();
    assert_eq!(conf["kind"], "confidence");
}

#[test]
fn fill_rejects_unknown_normalization_mode() {
    let out = run(&[
        "fill", "-i", "in.json", "-t", "cands", "--variable", "v.json", "-o", "o.json", "--normmode", "area",
    ]);
    assert!(!out.status.success());
    let stderr = String::from_utf8_lossy(&out.stderr);
    assert!(stderr.contains("area"), "stderr={stderr}");
}

#[test]
fn fill_sideband_without_sideband_variable_fails() {
    let out = run(&[
        "fill", "-i", "in.json", "-t", "cands", "--variable", "v.json", "-o", "o.json", "--bkgmode", "sideband",
    ]);
    assert!(!out.status.success());
    let stderr = String::from_utf8_lossy(&out.stderr);
    assert!(stderr.contains("sideband"), "stderr={stderr}");
}

#[test]
fn peak_prints_fit_json() {
    let dir = tempfile::tempdir().unwrap();
    let (_, variable, sidevariable) = fixture(dir.path());
    let sample = dir.path().join("data");

    let out = run(&[
        "peak",
        "--sample",
        sample.to_str().unwrap(),
        "--treename",
        "cands",
        "--sidevariable",
        &sidevariable,
        "--variable",
        &variable,
        "--bin",
        "1",
    ]);
    assert!(out.status.success(), "stderr={}", String::from_utf8_lossy(&out.stderr));
    let v: serde_json::Value = serde_json::from_slice(&out.stdout).unwrap();
    assert_eq!(v["cut_and_count"]["method"], "cut_and_count");
    assert_eq!(v["selection"]["bin"], 1);
    assert_eq!(v["selection"]["range"], serde_json::json!([1.0, 2.0]));
    assert!(v["fit"]["estimate"]["signal"].as_f64().unwrap().is_finite());
    assert!(v["effective_entries"].as_f64().unwrap() > 0.0);
}
