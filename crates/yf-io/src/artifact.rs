//! JSON result artifacts.
//!
//! A run produces two files: the yield artifact at the requested path and
//! the confidence artifact next to it as `<stem>_confidence.json`. Both carry
//! the same run metadata.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use yf_core::{ArtifactKind, ArtifactMeta, Error, LabeledArrays, Result, ResultSink};

/// Serialized form of one artifact file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    /// Yield or confidence.
    pub kind: ArtifactKind,
    /// Run metadata.
    pub meta: ArtifactMeta,
    /// One entry per sample, simulation first, then data.
    pub histograms: Vec<LabeledArrays>,
}

/// [`ResultSink`] writing pretty-printed JSON artifacts.
#[derive(Debug, Clone)]
pub struct JsonArtifactWriter {
    output: PathBuf,
}

impl JsonArtifactWriter {
    /// Writer for the yield artifact at `output`.
    pub fn new(output: impl Into<PathBuf>) -> Self {
        Self { output: output.into() }
    }

    /// Destination of an artifact of the given kind.
    pub fn path_for(&self, kind: ArtifactKind) -> PathBuf {
        match kind {
            ArtifactKind::Yield => self.output.clone(),
            ArtifactKind::Confidence => confidence_path(&self.output),
        }
    }
}

/// `<dir>/<stem>_confidence.json` for `<dir>/<stem>.<ext>`.
pub fn confidence_path(output: &Path) -> PathBuf {
    let stem = output.file_stem().map_or_else(|| "output".into(), |s| s.to_string_lossy());
    output.with_file_name(format!("{stem}_confidence.json"))
}

impl ResultSink for JsonArtifactWriter {
    fn write(&mut self, kind: ArtifactKind, arrays: &[LabeledArrays], meta: &ArtifactMeta) -> Result<()> {
        for a in arrays {
            let n: usize = a.shape.iter().product();
            if a.values.len() != n || a.errors.len() != n {
                return Err(Error::Validation(format!(
                    "sample '{}': shape {:?} does not match {} values / {} errors",
                    a.label,
                    a.shape,
                    a.values.len(),
                    a.errors.len()
                )));
            }
        }

        let path = self.path_for(kind);
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let artifact = Artifact { kind, meta: meta.clone(), histograms: arrays.to_vec() };
        let mut out = BufWriter::new(File::create(&path)?);
        serde_json::to_writer_pretty(&mut out, &artifact)?;
        out.flush()?;
        log::info!("wrote {} histogram(s) to {}", arrays.len(), path.display());
        Ok(())
    }
}

/// Read back an artifact written by [`JsonArtifactWriter`].
pub fn read_artifact(path: &Path) -> Result<Artifact> {
    let text = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&text)?)
}
