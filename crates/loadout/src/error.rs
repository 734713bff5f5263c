//! Error taxonomy for the build pipeline
//!
//! Library code returns [`BuildError`]; the CLI and the dev loop wrap these in
//! `anyhow` with context so the causal chain reaches the user.

use std::{
    fmt,
    path::{Path, PathBuf},
};

use serde_json::json;
use thiserror::Error;

/// Result type alias for build operations
pub type BuildResult<T> = Result<T, BuildError>;

/// Errors raised while resolving, transforming or emitting modules
#[derive(Debug, Error)]
pub enum BuildError {
    /// A specifier matched no file after extension and index resolution
    ///
    /// `from` is the directory the lookup started in; `importer` is the module
    /// that made the request, absent for entry specifiers.
    #[error("cannot resolve '{specifier}' from {}", importer.as_ref().unwrap_or(from).display())]
    Resolution {
        specifier: String,
        from: PathBuf,
        importer: Option<PathBuf>,
    },

    /// A transform step failed for a module
    #[error("step '{step}' failed for {}: {reason}", path.display())]
    Transform {
        step: String,
        path: PathBuf,
        reason: String,
    },

    /// Malformed configuration, reported before any build starts
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// Filesystem failure
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The build was superseded or interrupted
    #[error("build cancelled")]
    Cancelled,
}

impl BuildError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    /// Attribute a resolution failure to the module whose request failed
    #[must_use]
    pub fn imported_by(self, module: &Path) -> Self {
        match self {
            Self::Resolution {
                specifier, from, ..
            } => Self::Resolution {
                specifier,
                from,
                importer: Some(module.to_path_buf()),
            },
            other => other,
        }
    }

    /// Stable identifier used in machine-readable summaries
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Resolution { .. } => "resolution",
            Self::Transform { .. } => "transform",
            Self::Configuration(_) => "configuration",
            Self::Io { .. } => "io",
            Self::Cancelled => "cancelled",
        }
    }

    /// The module the error originates from, when there is one
    pub fn module_path(&self) -> Option<&PathBuf> {
        match self {
            Self::Resolution { importer, .. } => importer.as_ref(),
            Self::Transform { path, .. } | Self::Io { path, .. } => Some(path),
            Self::Configuration(_) | Self::Cancelled => None,
        }
    }
}

/// A fatal module error together with the entry points whose bundles it breaks
#[derive(Debug)]
pub struct BuildFailure {
    pub entries: Vec<String>,
    pub error: BuildError,
}

impl BuildFailure {
    pub fn new(entries: Vec<String>, error: BuildError) -> Self {
        Self { entries, error }
    }

    pub fn to_json(&self) -> serde_json::Value {
        json!({
            "kind": self.error.kind(),
            "module": self.error.module_path().map(|p| p.display().to_string()),
            "entries": self.entries,
            "message": self.error.to_string(),
        })
    }
}

impl fmt::Display for BuildFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.entries.is_empty() {
            write!(f, "{}", self.error)
        } else {
            write!(f, "{} (affects entries: {})", self.error, self.entries.join(", "))
        }
    }
}

/// Error returned by one-shot builds: every failure collected before aborting
#[derive(Debug, Error)]
#[error("build failed with {} error(s)", .0.len())]
pub struct BuildFailed(pub Vec<BuildFailure>);

impl BuildFailed {
    pub fn to_json(&self) -> serde_json::Value {
        json!({
            "status": "failed",
            "errors": self.0.iter().map(BuildFailure::to_json).collect::<Vec<_>>(),
        })
    }
}

/// Informational record for a strongly connected component in the module graph
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleWarning {
    pub modules: Vec<PathBuf>,
}

impl fmt::Display for CycleWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let chain: Vec<String> = self
            .modules
            .iter()
            .map(|p| p.display().to_string())
            .collect();
        write!(f, "circular dependency: {}", chain.join(" -> "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_display_lists_entries() {
        let failure = BuildFailure::new(
            vec!["app".to_owned(), "alt".to_owned()],
            BuildError::Resolution {
                specifier: "./missing".to_owned(),
                from: PathBuf::from("src"),
                importer: Some(PathBuf::from("src/leaf.js")),
            },
        );
        assert_eq!(
            failure.to_string(),
            "cannot resolve './missing' from src/leaf.js (affects entries: app, alt)"
        );
    }

    #[test]
    fn test_failure_json_summary() {
        let failure = BuildFailure::new(
            vec!["app".to_owned()],
            BuildError::Transform {
                step: "css".to_owned(),
                path: PathBuf::from("src/a.css"),
                reason: "not UTF-8".to_owned(),
            },
        );
        let value = failure.to_json();
        assert_eq!(value["kind"], "transform");
        assert_eq!(value["module"], "src/a.css");
        assert_eq!(value["entries"][0], "app");
    }
}
