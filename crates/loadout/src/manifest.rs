//! Build manifest: what each entry needs loaded, and every auxiliary asset

use std::path::Path;

use indexmap::{IndexMap, IndexSet};
use serde::{Deserialize, Serialize};

use crate::error::{BuildError, BuildResult};

pub const MANIFEST_FILE: &str = "manifest.json";

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OutputAsset {
    /// Path relative to the output directory, forward-slashed
    pub path: String,
    pub size_bytes: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    /// Entry name -> files to load, in load order
    pub entries: IndexMap<String, Vec<OutputAsset>>,
    /// Files referenced from bundles (fonts, images, ...)
    pub assets: Vec<OutputAsset>,
}

impl Manifest {
    /// Read a manifest written by an earlier build, if there is one
    pub fn read(path: &Path) -> BuildResult<Option<Self>> {
        match std::fs::read(path) {
            Ok(bytes) => serde_json::from_slice(&bytes).map(Some).map_err(|e| {
                BuildError::io(path, std::io::Error::new(std::io::ErrorKind::InvalidData, e))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(BuildError::io(path, e)),
        }
    }

    pub fn to_json(&self) -> String {
        let mut text = serde_json::to_string_pretty(self).unwrap_or_else(|_| "{}".to_owned());
        text.push('\n');
        text
    }

    /// Every file the manifest references, without duplicates
    pub fn all_paths(&self) -> IndexSet<&str> {
        self.entries
            .values()
            .flatten()
            .chain(&self.assets)
            .map(|asset| asset.path.as_str())
            .collect()
    }

    /// Keep serving the previous files of entries that failed to rebuild
    pub fn carry_over(&mut self, previous: &Self, failed: &[String]) {
        if failed.is_empty() {
            return;
        }
        for name in failed {
            if let Some(files) = previous.entries.get(name) {
                self.entries.insert(name.clone(), files.clone());
            }
        }
        // Old assets may still be referenced by the carried bundles
        for asset in &previous.assets {
            if !self.assets.contains(asset) {
                self.assets.push(asset.clone());
            }
        }
        let order: IndexSet<&String> = previous.entries.keys().collect();
        self.entries.sort_by(|a, _, b, _| {
            let rank = |name: &String| order.get_index_of(name).unwrap_or(usize::MAX);
            rank(a).cmp(&rank(b))
        });
    }

    /// Paths that are new or whose size changed relative to `previous`
    pub fn changed_paths(&self, previous: Option<&Self>) -> Vec<String> {
        let before: IndexSet<(&str, u64)> = previous
            .map(|p| {
                p.entries
                    .values()
                    .flatten()
                    .chain(&p.assets)
                    .map(|a| (a.path.as_str(), a.size_bytes))
                    .collect()
            })
            .unwrap_or_default();
        let mut changed: Vec<String> = Vec::new();
        for asset in self.entries.values().flatten().chain(&self.assets) {
            if !before.contains(&(asset.path.as_str(), asset.size_bytes))
                && !changed.contains(&asset.path)
            {
                changed.push(asset.path.clone());
            }
        }
        changed
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn asset(path: &str, size: u64) -> OutputAsset {
        OutputAsset {
            path: path.to_owned(),
            size_bytes: size,
        }
    }

    fn manifest(entries: &[(&str, &[OutputAsset])], assets: &[OutputAsset]) -> Manifest {
        Manifest {
            entries: entries
                .iter()
                .map(|(name, files)| ((*name).to_owned(), files.to_vec()))
                .collect(),
            assets: assets.to_vec(),
        }
    }

    #[test]
    fn test_json_shape() {
        let m = manifest(&[("app", &[asset("app-dist.js", 120)])], &[asset("a.woff", 9)]);
        let value: serde_json::Value = serde_json::from_str(&m.to_json()).expect("json");
        assert_eq!(value["entries"]["app"][0]["path"], "app-dist.js");
        assert_eq!(value["entries"]["app"][0]["size_bytes"], 120);
        assert_eq!(value["assets"][0]["path"], "a.woff");
    }

    #[test]
    fn test_changed_paths() {
        let old = manifest(&[("app", &[asset("app.js", 10)])], &[asset("a.png", 5)]);
        let new = manifest(&[("app", &[asset("app.js", 11)])], &[asset("a.png", 5)]);
        assert_eq!(new.changed_paths(Some(&old)), vec!["app.js"]);
        assert_eq!(new.changed_paths(None), vec!["app.js", "a.png"]);
    }

    #[test]
    fn test_carry_over_keeps_failed_entries_in_order() {
        let old = manifest(
            &[("app", &[asset("app.1.js", 10)]), ("admin", &[asset("admin.1.js", 20)])],
            &[asset("old.png", 3)],
        );
        let mut new = manifest(&[("admin", &[asset("admin.2.js", 21)])], &[]);
        new.carry_over(&old, &["app".to_owned()]);
        let names: Vec<&str> = new.entries.keys().map(String::as_str).collect();
        assert_eq!(names, vec!["app", "admin"]);
        assert_eq!(new.entries["app"], vec![asset("app.1.js", 10)]);
        assert_eq!(new.assets, vec![asset("old.png", 3)]);
    }

    #[test]
    fn test_missing_manifest_reads_as_none() {
        let dir = tempfile::TempDir::new().expect("temp dir");
        let read = Manifest::read(&dir.path().join(MANIFEST_FILE)).expect("read");
        assert!(read.is_none());
    }
}
