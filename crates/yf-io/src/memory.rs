//! In-memory event source for tests and embedding.

use std::collections::{BTreeMap, HashMap};

use yf_core::{Error, EventSource, Result};

/// Trees held as named `f64` columns.
#[derive(Debug, Clone, Default)]
pub struct MemoryEventSource {
    name: String,
    trees: BTreeMap<String, Vec<(String, Vec<f64>)>>,
    counters: HashMap<String, f64>,
}

impl MemoryEventSource {
    /// Empty source called `name`.
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), ..Default::default() }
    }

    /// Add (or replace) a tree. All columns must have the same length.
    pub fn with_tree(
        mut self,
        tree: impl Into<String>,
        columns: Vec<(impl Into<String>, Vec<f64>)>,
    ) -> Result<Self> {
        let tree = tree.into();
        let columns: Vec<(String, Vec<f64>)> =
            columns.into_iter().map(|(n, v)| (n.into(), v)).collect();
        if let Some((first, rest)) = columns.split_first()
            && let Some((name, col)) = rest.iter().find(|(_, c)| c.len() != first.1.len())
        {
            return Err(Error::Validation(format!(
                "tree '{tree}': column '{name}' has {} entries, '{}' has {}",
                col.len(),
                first.0,
                first.1.len()
            )));
        }
        self.trees.insert(tree, columns);
        Ok(self)
    }

    /// Set a scalar counter.
    pub fn with_counter(mut self, name: impl Into<String>, value: f64) -> Self {
        self.counters.insert(name.into(), value);
        self
    }

    fn tree(&self, tree: &str) -> Result<&[(String, Vec<f64>)]> {
        self.trees
            .get(tree)
            .map(Vec::as_slice)
            .ok_or_else(|| Error::DataSource(format!("no tree '{tree}' in {}", self.name)))
    }
}

impl EventSource for MemoryEventSource {
    fn n_entries(&self, tree: &str) -> Result<usize> {
        Ok(self.tree(tree)?.first().map_or(0, |(_, c)| c.len()))
    }

    fn branch_names(&self, tree: &str) -> Result<Vec<String>> {
        Ok(self.tree(tree)?.iter().map(|(n, _)| n.clone()).collect())
    }

    fn branch(&self, tree: &str, branch: &str, entry_stop: Option<usize>) -> Result<Vec<f64>> {
        let (_, col) = self.tree(tree)?.iter().find(|(n, _)| n == branch).ok_or_else(|| {
            Error::DataSource(format!("branch '{branch}' not found in tree '{tree}' of {}", self.name))
        })?;
        let stop = entry_stop.map_or(col.len(), |s| s.min(col.len()));
        Ok(col[..stop].to_vec())
    }

    fn counter(&self, name: &str) -> Result<Option<f64>> {
        Ok(self.counters.get(name).copied())
    }

    fn describe(&self) -> String {
        self.name.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_source() {
        let src = MemoryEventSource::new("toy")
            .with_tree("cands", vec![("mass", vec![0.5, 0.6]), ("pt", vec![1.0, 2.0])])
            .unwrap()
            .with_counter("hCounter", 10.0);
        assert_eq!(src.n_entries("cands").unwrap(), 2);
        assert_eq!(src.branch("cands", "pt", Some(1)).unwrap(), vec![1.0]);
        assert_eq!(src.branch("cands", "pt", Some(10)).unwrap(), vec![1.0, 2.0]);
        assert_eq!(src.counter("hCounter").unwrap(), Some(10.0));
        assert!(src.branch("cands", "eta", None).is_err());
        assert!(src.n_entries("events").is_err());
    }

    #[test]
    fn test_ragged_tree_rejected() {
        let err = MemoryEventSource::new("toy").with_tree("t", vec![("a", vec![1.0]), ("b", vec![])]);
        assert!(matches!(err, Err(Error::Validation(_))));
    }
}
