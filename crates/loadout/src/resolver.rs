use std::{
    path::{Path, PathBuf},
    sync::RwLock,
};

use cow_utils::CowUtils;
use indexmap::IndexSet;
use log::{debug, trace, warn};
use rustc_hash::FxHashMap;

use crate::{
    config::ResolveConfig,
    error::{BuildError, BuildResult},
};

/// A specifier resolved to an existing file, with its query suffix kept aside
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResolvedRequest {
    /// Canonical absolute path of the file
    pub path: PathBuf,
    /// `?v=1.0.0` or `#iefix` style suffix from the specifier, empty if none
    pub query: String,
}

impl ResolvedRequest {
    /// The string rules are tested against: forward-slashed path plus query
    pub fn rule_subject(&self) -> String {
        let path = self.path.to_string_lossy();
        let mut subject = path.cow_replace('\\', "/").into_owned();
        subject.push_str(&self.query);
        subject
    }
}

/// Module descriptor for a specifier before filesystem lookup
#[derive(Debug)]
struct SpecifierDescriptor<'a> {
    /// Specifier without its query or fragment
    request: &'a str,
    /// The stripped suffix
    query: &'a str,
}

impl<'a> SpecifierDescriptor<'a> {
    fn parse(specifier: &'a str) -> Self {
        match specifier.find(['?', '#']) {
            Some(idx) => Self {
                request: &specifier[..idx],
                query: &specifier[idx..],
            },
            None => Self {
                request: specifier,
                query: "",
            },
        }
    }

    fn is_relative(&self) -> bool {
        self.request == "."
            || self.request == ".."
            || self.request.starts_with("./")
            || self.request.starts_with("../")
    }
}

/// Turns `(specifier, from_dir)` into an existing absolute path.
///
/// Candidate order per base directory: the literal path, the path with each
/// configured extension appended, then `<dir>/<index><ext>` when the path is a
/// directory. The first existing file wins.
#[derive(Debug)]
pub struct PathResolver {
    extensions: Vec<String>,
    index: String,
    /// Search roots for bare specifiers, canonicalized and deduplicated
    roots: Vec<PathBuf>,
    /// Cache of resolved paths keyed by (requesting directory, request)
    cache: RwLock<FxHashMap<(PathBuf, String), Option<PathBuf>>>,
}

impl PathResolver {
    pub fn new(config: &ResolveConfig, project_root: &Path) -> Self {
        let mut unique_roots = IndexSet::new();
        for root in &config.roots {
            let joined = project_root.join(root);
            unique_roots.insert(canonicalize_path(joined));
        }
        Self {
            extensions: config.extensions.clone(),
            index: config.index.clone(),
            roots: unique_roots.into_iter().collect(),
            cache: RwLock::new(FxHashMap::default()),
        }
    }

    /// Resolve `specifier` as requested from a file living in `from_dir`
    pub fn resolve(&self, specifier: &str, from_dir: &Path) -> BuildResult<ResolvedRequest> {
        let descriptor = SpecifierDescriptor::parse(specifier);
        let not_found = || BuildError::Resolution {
            specifier: specifier.to_owned(),
            from: from_dir.to_path_buf(),
            importer: None,
        };
        if descriptor.request.is_empty() {
            return Err(not_found());
        }

        let key = (from_dir.to_path_buf(), descriptor.request.to_owned());
        if let Some(cached) = self.cached(&key) {
            return cached
                .map(|path| ResolvedRequest {
                    path,
                    query: descriptor.query.to_owned(),
                })
                .ok_or_else(not_found);
        }

        let resolved = self
            .base_candidates(&descriptor, from_dir)
            .into_iter()
            .find_map(|base| self.resolve_base(&base));
        if let Ok(mut cache) = self.cache.write() {
            cache.insert(key, resolved.clone());
        }

        match resolved {
            Some(path) => {
                trace!("Resolved '{specifier}' from {} to {}", from_dir.display(), path.display());
                Ok(ResolvedRequest {
                    path,
                    query: descriptor.query.to_owned(),
                })
            }
            None => {
                debug!("Failed to resolve '{specifier}' from {}", from_dir.display());
                Err(not_found())
            }
        }
    }

    /// Drop cached lookups, e.g. after files were created or removed
    pub fn clear_cache(&self) {
        if let Ok(mut cache) = self.cache.write() {
            cache.clear();
        }
    }

    fn cached(&self, key: &(PathBuf, String)) -> Option<Option<PathBuf>> {
        self.cache.read().ok()?.get(key).cloned()
    }

    /// Directories (or files) the request is tried against, in order
    fn base_candidates(&self, descriptor: &SpecifierDescriptor<'_>, from_dir: &Path) -> Vec<PathBuf> {
        let request = descriptor.request;
        if descriptor.is_relative() {
            return vec![from_dir.join(request)];
        }
        let path = Path::new(request);
        if path.is_absolute() {
            return vec![path.to_path_buf()];
        }
        // `~pkg/file` is the CSS spelling of a root-relative request
        let bare = request.strip_prefix('~').unwrap_or(request);
        self.roots.iter().map(|root| root.join(bare)).collect()
    }

    fn resolve_base(&self, base: &Path) -> Option<PathBuf> {
        // 1. Literal path
        if base.is_file() {
            return Some(canonicalize_path(base.to_path_buf()));
        }

        // 2. Path with each extension appended
        if let Some(found) = self.try_extensions(base) {
            return Some(found);
        }

        // 3. Directory index
        if base.is_dir() {
            let index = base.join(&self.index);
            if let Some(found) = self.try_extensions(&index) {
                return Some(found);
            }
        }
        None
    }

    fn try_extensions(&self, base: &Path) -> Option<PathBuf> {
        self.extensions.iter().find_map(|ext| {
            let mut candidate = base.as_os_str().to_owned();
            candidate.push(ext);
            let candidate = PathBuf::from(candidate);
            candidate
                .is_file()
                .then(|| canonicalize_path(candidate))
        })
    }
}

/// Canonicalize a path, handling errors gracefully
fn canonicalize_path(path: PathBuf) -> PathBuf {
    match path.canonicalize() {
        Ok(canonical) => canonical,
        Err(e) => {
            // Log warning but don't fail - return the original path
            warn!("Failed to canonicalize path {}: {}", path.display(), e);
            path
        }
    }
}
