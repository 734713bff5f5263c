//! Linter collaborator
//!
//! Runs an external lint command over the configured files. The rule table is
//! handed over as a temporary JSON file, either through a `{rules}` argument or
//! the `LOADOUT_LINT_RULES` environment variable, and the command is expected
//! to print a JSON array of diagnostics.

use std::{
    path::{Path, PathBuf},
    process::Stdio,
};

use cow_utils::CowUtils;
use indexmap::{IndexMap, IndexSet};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use tokio::process::Command;

use crate::{
    config::LintConfig,
    error::{BuildError, BuildResult},
};

/// Environment variable carrying the rule table path
pub const RULES_ENV: &str = "LOADOUT_LINT_RULES";
const RULES_PLACEHOLDER: &str = "{rules}";

/// Flat map of rule name to setting
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RuleTable(pub IndexMap<String, serde_json::Value>);

impl RuleTable {
    /// Load a rule table from a `.json` or `.toml` file
    pub fn load(path: &Path) -> BuildResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| BuildError::io(path, e))?;
        let is_json = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
        let parsed = if is_json {
            serde_json::from_str(&text).map_err(|e| e.to_string())
        } else {
            toml::from_str(&text).map_err(|e| e.to_string())
        };
        parsed.map_err(|e| {
            BuildError::config(format!("invalid lint rule table {}: {e}", path.display()))
        })
    }

    /// Names of rules that are not switched off
    pub fn enabled(&self) -> impl Iterator<Item = &str> {
        self.0
            .iter()
            .filter(|(_, setting)| !is_off(setting))
            .map(|(name, _)| name.as_str())
    }
}

fn is_off(setting: &serde_json::Value) -> bool {
    let level = match setting {
        serde_json::Value::Array(items) => items.first(),
        other => Some(other),
    };
    match level {
        Some(serde_json::Value::String(s)) => s == "off",
        Some(serde_json::Value::Number(n)) => n.as_u64() == Some(0),
        Some(serde_json::Value::Bool(b)) => !b,
        Some(serde_json::Value::Null) => true,
        _ => false,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    #[serde(alias = "warn")]
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LintDiagnostic {
    pub file: String,
    #[serde(default)]
    pub line: u32,
    #[serde(default)]
    pub rule: String,
    pub severity: Severity,
    pub message: String,
}

impl std::fmt::Display for LintDiagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let severity = match self.severity {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Error => "error",
        };
        write!(f, "{}:{}: {severity}: {}", self.file, self.line, self.message)?;
        if !self.rule.is_empty() {
            write!(f, " [{}]", self.rule)?;
        }
        Ok(())
    }
}

/// Runs the configured lint command
#[derive(Debug, Clone)]
pub struct CommandLinter {
    command: String,
    args: Vec<String>,
    rules: Option<PathBuf>,
    patterns: Vec<String>,
    root: PathBuf,
}

impl CommandLinter {
    pub fn new(config: &LintConfig, root: &Path) -> Self {
        Self {
            command: config.command.clone(),
            args: config.args.clone(),
            rules: config.rules.as_ref().map(|rules| root.join(rules)),
            patterns: config.files.clone(),
            root: root.to_path_buf(),
        }
    }

    /// Files matched by the configured globs, sorted and without duplicates
    pub fn files(&self) -> BuildResult<Vec<PathBuf>> {
        let mut files = IndexSet::new();
        for pattern in &self.patterns {
            let full = self.root.join(pattern);
            let full = full.to_string_lossy();
            let mut matched: Vec<PathBuf> = glob::glob(&full)
                .map_err(|e| BuildError::config(format!("invalid lint pattern '{pattern}': {e}")))?
                .filter_map(Result::ok)
                .filter(|path| path.is_file())
                .collect();
            matched.sort();
            files.extend(matched);
        }
        Ok(files.into_iter().collect())
    }

    /// Lint every matched file
    pub async fn run(&self) -> BuildResult<Vec<LintDiagnostic>> {
        let files = self.files()?;
        if files.is_empty() {
            info!("No files to lint");
            return Ok(Vec::new());
        }
        let table = match &self.rules {
            Some(path) => RuleTable::load(path)?,
            None => RuleTable::default(),
        };
        debug!("Linting {} files with {} enabled rules", files.len(), table.enabled().count());

        let mut table_file = tempfile::Builder::new()
            .prefix("loadout-lint-")
            .suffix(".json")
            .tempfile()
            .map_err(|e| BuildError::io(std::env::temp_dir(), e))?;
        serde_json::to_writer(&mut table_file, &table)
            .map_err(|e| BuildError::io(table_file.path(), e.into()))?;
        let table_path = table_file.path().to_string_lossy().into_owned();

        let args: Vec<String> = self
            .args
            .iter()
            .map(|arg| arg.cow_replace(RULES_PLACEHOLDER, &table_path).into_owned())
            .collect();
        let output = Command::new(&self.command)
            .args(&args)
            .args(&files)
            .env(RULES_ENV, &table_path)
            .current_dir(&self.root)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| BuildError::io(&self.command, e))?;

        // Linters exit non-zero when they report problems; only unreadable output is fatal
        serde_json::from_slice(&output.stdout).map_err(|e| {
            BuildError::config(format!(
                "lint command '{}' ({}) did not print a diagnostics array: {e}; stderr: {}",
                self.command,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ))
        })
    }
}

/// Whether any diagnostic should fail the run
pub fn has_errors(diagnostics: &[LintDiagnostic]) -> bool {
    diagnostics.iter().any(|d| d.severity == Severity::Error)
}
