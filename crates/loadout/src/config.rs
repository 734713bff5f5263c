//! Project configuration loaded from `loadout.toml`

use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use log::debug;
use serde::Deserialize;

use crate::{
    error::{BuildError, BuildResult},
    filename::validate_template,
    rules::RuleSet,
};

/// Default configuration file name looked up in the working directory
pub const DEFAULT_CONFIG_FILE: &str = "loadout.toml";

/// Name of the bundle that collects modules shared between entries
pub const SHARED_BUNDLE_NAME: &str = "shared";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Logical entry name -> ordered list of specifiers
    pub entries: IndexMap<String, Vec<String>>,
    #[serde(default)]
    pub output: OutputConfig,
    #[serde(default)]
    pub resolve: ResolveConfig,
    #[serde(default)]
    pub module: ModuleConfig,
    #[serde(default)]
    pub build: BuildSettings,
    #[serde(default)]
    pub dev_server: DevServerConfig,
    #[serde(default)]
    pub html: Option<HtmlConfig>,
    #[serde(default)]
    pub lint: Option<LintConfig>,
    /// Project root; every relative path in the file is relative to it
    #[serde(skip)]
    pub root: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OutputConfig {
    #[serde(default = "default_output_dir")]
    pub dir: PathBuf,
    #[serde(default = "default_filename")]
    pub filename: String,
    #[serde(default = "default_asset_filename")]
    pub asset_filename: String,
    #[serde(default)]
    pub public_path: String,
    #[serde(default)]
    pub shared_modules: SharedModules,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            dir: default_output_dir(),
            filename: default_filename(),
            asset_filename: default_asset_filename(),
            public_path: String::new(),
            shared_modules: SharedModules::default(),
        }
    }
}

/// What to do with modules reachable from more than one entry
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SharedModules {
    /// Every entry bundle carries its own copy
    #[default]
    Duplicate,
    /// Modules used by two or more entries move into one shared bundle
    Shared,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResolveConfig {
    #[serde(default = "default_extensions")]
    pub extensions: Vec<String>,
    #[serde(default = "default_index")]
    pub index: String,
    /// Directories searched for bare specifiers, in order
    #[serde(default = "default_roots")]
    pub roots: Vec<PathBuf>,
}

impl Default for ResolveConfig {
    fn default() -> Self {
        Self {
            extensions: default_extensions(),
            index: default_index(),
            roots: default_roots(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModuleConfig {
    #[serde(default)]
    pub rules: Vec<RuleConfig>,
    /// Patterns whose matches are emitted but never scanned for dependencies
    #[serde(default)]
    pub no_parse: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuleConfig {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub test: String,
    #[serde(default)]
    pub exclude: Vec<String>,
    #[serde(rename = "use", alias = "loader")]
    pub steps: OneOrMany<StepSpec>,
}

/// A loader written either as `"name?key=value"` or as a table with options
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum StepSpec {
    Short(String),
    Full {
        loader: String,
        #[serde(default)]
        options: toml::Table,
    },
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany<T> {
    One(T),
    Many(Vec<T>),
}

impl<T> OneOrMany<T> {
    pub fn as_slice(&self) -> &[T] {
        match self {
            Self::One(item) => std::slice::from_ref(item),
            Self::Many(items) => items,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BuildSettings {
    /// Upper bound on modules transformed at the same time
    #[serde(default)]
    pub concurrency: Option<usize>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DevServerConfig {
    #[serde(default = "default_true", alias = "inline")]
    pub inline_reload: bool,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
}

impl Default for DevServerConfig {
    fn default() -> Self {
        Self {
            inline_reload: true,
            host: default_host(),
            port: default_port(),
            debounce_ms: default_debounce_ms(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HtmlConfig {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub template: Option<PathBuf>,
    #[serde(default)]
    pub inject: InjectPosition,
    #[serde(default = "default_html_filename")]
    pub filename: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InjectPosition {
    Head,
    #[default]
    Body,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LintConfig {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Flat rule table handed to the linter (TOML or JSON)
    #[serde(default)]
    pub rules: Option<PathBuf>,
    pub files: Vec<String>,
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("dist")
}

fn default_filename() -> String {
    "[name].js".to_owned()
}

fn default_asset_filename() -> String {
    "[hash:20][ext]".to_owned()
}

fn default_extensions() -> Vec<String> {
    vec![".js".to_owned()]
}

fn default_index() -> String {
    "index".to_owned()
}

fn default_roots() -> Vec<PathBuf> {
    vec![PathBuf::from(".")]
}

fn default_true() -> bool {
    true
}

fn default_host() -> String {
    "127.0.0.1".to_owned()
}

fn default_port() -> u16 {
    8080
}

fn default_debounce_ms() -> u64 {
    100
}

fn default_html_filename() -> String {
    "index.html".to_owned()
}

impl Config {
    /// Load and validate a configuration file; its directory becomes the project root
    pub fn load(path: &Path) -> BuildResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| BuildError::io(path, e))?;
        let root = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let root = root.canonicalize().map_err(|e| BuildError::io(root, e))?;
        Self::from_toml_str(&text, root)
    }

    pub fn from_toml_str(text: &str, root: PathBuf) -> BuildResult<Self> {
        let mut config: Self = toml::from_str(text)
            .map_err(|e| BuildError::config(format!("failed to parse configuration: {e}")))?;
        config.root = root;
        config.validate()?;
        debug!(
            "Loaded configuration with {} entries and {} rules",
            config.entries.len(),
            config.module.rules.len()
        );
        Ok(config)
    }

    /// Check everything that can be checked before a build starts
    pub fn validate(&self) -> BuildResult<()> {
        if self.entries.is_empty() {
            return Err(BuildError::config("at least one entry is required"));
        }
        for (name, specifiers) in &self.entries {
            if name.is_empty() {
                return Err(BuildError::config("entry names must not be empty"));
            }
            if specifiers.is_empty() {
                return Err(BuildError::config(format!(
                    "entry '{name}' lists no modules"
                )));
            }
        }
        if self.output.filename.trim().is_empty() {
            return Err(BuildError::config("output.filename must not be empty"));
        }
        validate_template(&self.output.filename)?;
        validate_template(&self.output.asset_filename)?;
        if self.entries.len() > 1 && !self.output.filename.contains("[name]") {
            return Err(BuildError::config(
                "output.filename must contain [name] when there are several entries",
            ));
        }
        if self.output.shared_modules == SharedModules::Shared
            && self.entries.contains_key(SHARED_BUNDLE_NAME)
        {
            return Err(BuildError::config(format!(
                "entry name '{SHARED_BUNDLE_NAME}' is reserved when shared_modules = \"shared\""
            )));
        }
        for ext in &self.resolve.extensions {
            if !ext.starts_with('.') {
                return Err(BuildError::config(format!(
                    "resolve extension '{ext}' must start with '.'"
                )));
            }
        }
        if self.build.concurrency == Some(0) {
            return Err(BuildError::config("build.concurrency must be at least 1"));
        }
        RuleSet::from_config(&self.module)?;
        Ok(())
    }

    /// Turn off named rules, e.g. from `--disable-rule fonts`
    pub fn disable_rules(&mut self, names: &[String]) -> BuildResult<()> {
        for name in names {
            let rule = self
                .module
                .rules
                .iter_mut()
                .find(|rule| rule.name.as_deref() == Some(name.as_str()))
                .ok_or_else(|| BuildError::config(format!("no rule named '{name}'")))?;
            rule.enabled = false;
        }
        Ok(())
    }

    pub fn output_dir(&self) -> PathBuf {
        self.root.join(&self.output.dir)
    }

    pub fn concurrency(&self) -> usize {
        self.build.concurrency.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(std::num::NonZeroUsize::get)
                .unwrap_or(4)
        })
    }
}
