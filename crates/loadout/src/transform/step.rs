//! Transform step descriptors and their option parsing

use std::path::PathBuf;

use indexmap::IndexMap;

use super::ContentKind;
use crate::{
    config::StepSpec,
    error::{BuildError, BuildResult},
    filename::validate_template,
};

/// One configured step of a rule's chain
#[derive(Debug, Clone, PartialEq)]
pub struct StepDescriptor {
    /// Name as written in the configuration, used when reporting failures
    pub name: String,
    pub kind: StepKind,
    /// Position within the declaring rule's `use` list
    pub position: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StepKind {
    Css(CssOptions),
    Style(StyleOptions),
    Url(UrlOptions),
    File(FileOptions),
    Raw,
    Json,
    Command(CommandOptions),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CssOptions {
    /// Turn relative `url(...)` references into dependencies
    pub url: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StyleOptions {
    pub insert: StyleInsert,
    pub attributes: IndexMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StyleInsert {
    Head,
    Body,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UrlOptions {
    /// Content strictly smaller than this many bytes is inlined; `None` inlines everything
    pub limit: Option<usize>,
    pub mimetype: Option<String>,
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileOptions {
    pub name: Option<String>,
    pub public_path: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOptions {
    pub program: String,
    /// `{path}` is replaced by the module's absolute path
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub input: CommandInput,
    /// What the command prints to stdout
    pub output: ContentKind,
    /// `false` reruns the command on every build, for compilers that read files
    /// other than the module itself
    pub cache: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandInput {
    /// Module content is piped to stdin
    Stdin,
    /// The command reads the file itself via `{path}`
    Path,
}

impl StepDescriptor {
    /// Whether a cached output of this step stays valid while the module content is unchanged
    pub fn cacheable(&self) -> bool {
        match &self.kind {
            StepKind::Command(command) => command.cache,
            _ => true,
        }
    }

    pub fn parse(spec: &StepSpec, position: usize) -> BuildResult<Self> {
        let (name, options) = match spec {
            StepSpec::Short(text) => match text.split_once('?') {
                Some((name, query)) => (name.to_owned(), parse_query(query)),
                None => (text.clone(), toml::Table::new()),
            },
            StepSpec::Full { loader, options } => (loader.clone(), options.clone()),
        };
        let mut reader = OptionReader {
            step: &name,
            table: options,
        };
        let kind = match canonical_name(&name) {
            Some("css") => StepKind::Css(CssOptions {
                url: reader.take_bool("url")?.unwrap_or(true),
            }),
            Some("style") => StepKind::Style(StyleOptions {
                insert: match reader.take_string("insert")?.as_deref() {
                    None | Some("head") => StyleInsert::Head,
                    Some("body") => StyleInsert::Body,
                    Some(other) => {
                        return Err(reader.invalid("insert", &format!("unknown position '{other}'")));
                    }
                },
                attributes: reader.take_string_table("attributes")?,
            }),
            Some("url") => StepKind::Url(UrlOptions {
                limit: reader.take_usize("limit")?,
                mimetype: reader.take_string("mimetype")?,
                name: reader.take_template("name")?,
            }),
            Some("file") => StepKind::File(FileOptions {
                name: reader.take_template("name")?,
                public_path: reader.take_string("public_path")?,
            }),
            Some("raw") => StepKind::Raw,
            Some("json") => StepKind::Json,
            Some("command") => StepKind::Command(parse_command(&mut reader)?),
            _ => {
                return Err(BuildError::config(format!("unknown transform step '{name}'")));
            }
        };
        reader.finish()?;
        Ok(Self {
            name,
            kind,
            position,
        })
    }

    /// Built-in step with default options, used for implicit chains
    pub fn builtin(name: &str, kind: StepKind) -> Self {
        Self {
            name: name.to_owned(),
            kind,
            position: 0,
        }
    }
}

/// Steps of one rule in the order they run.
///
/// The last declared step runs first on the raw content, so chains compose like
/// function application: `use = ["style", "css"]` is `style(css(raw))`.
pub fn execution_order(declared: &[StepDescriptor]) -> impl Iterator<Item = &StepDescriptor> {
    declared.iter().rev()
}

fn canonical_name(name: &str) -> Option<&'static str> {
    Some(match name {
        "css" | "css-loader" | "css-load" => "css",
        "style" | "style-loader" | "style-inject" => "style",
        "url" | "url-loader" => "url",
        "file" | "file-loader" => "file",
        "raw" | "raw-loader" => "raw",
        "json" | "json-loader" => "json",
        "command" | "exec" => "command",
        _ => return None,
    })
}

fn parse_command(reader: &mut OptionReader<'_>) -> BuildResult<CommandOptions> {
    let program = reader
        .take_string("program")?
        .ok_or_else(|| reader.invalid("program", "is required"))?;
    let input = match reader.take_string("input")?.as_deref() {
        None | Some("stdin") => CommandInput::Stdin,
        Some("path") => CommandInput::Path,
        Some(other) => return Err(reader.invalid("input", &format!("unknown mode '{other}'"))),
    };
    let output = match reader.take_string("output")?.as_deref() {
        None | Some("script") => ContentKind::Script,
        Some("style") => ContentKind::Style,
        Some(other) => return Err(reader.invalid("output", &format!("unknown kind '{other}'"))),
    };
    Ok(CommandOptions {
        program,
        args: reader.take_strings("args")?.unwrap_or_default(),
        cwd: reader.take_string("cwd")?.map(PathBuf::from),
        input,
        output,
        cache: reader.take_bool("cache")?.unwrap_or(true),
    })
}

/// Parse `limit=10000&mimetype=application/font-woff&verbose`
fn parse_query(query: &str) -> toml::Table {
    let mut table = toml::Table::new();
    for pair in query.split('&').filter(|p| !p.is_empty()) {
        let (key, value) = match pair.split_once('=') {
            Some((key, value)) => (key, query_value(value)),
            None => (pair, toml::Value::Boolean(true)),
        };
        table.insert(key.to_owned(), value);
    }
    table
}

fn query_value(raw: &str) -> toml::Value {
    if let Ok(int) = raw.parse::<i64>() {
        return toml::Value::Integer(int);
    }
    match raw {
        "true" => toml::Value::Boolean(true),
        "false" => toml::Value::Boolean(false),
        _ => toml::Value::String(raw.to_owned()),
    }
}

/// Consumes options by key and rejects whatever is left over
struct OptionReader<'a> {
    step: &'a str,
    table: toml::Table,
}

impl OptionReader<'_> {
    fn invalid(&self, key: &str, reason: &str) -> BuildError {
        BuildError::config(format!("step '{}': option '{key}' {reason}", self.step))
    }

    fn take_bool(&mut self, key: &str) -> BuildResult<Option<bool>> {
        match self.table.remove(key) {
            None => Ok(None),
            Some(toml::Value::Boolean(b)) => Ok(Some(b)),
            Some(_) => Err(self.invalid(key, "must be a boolean")),
        }
    }

    fn take_usize(&mut self, key: &str) -> BuildResult<Option<usize>> {
        match self.table.remove(key) {
            None => Ok(None),
            Some(toml::Value::Integer(i)) => usize::try_from(i)
                .map(Some)
                .map_err(|_| self.invalid(key, "must not be negative")),
            Some(_) => Err(self.invalid(key, "must be an integer")),
        }
    }

    fn take_string(&mut self, key: &str) -> BuildResult<Option<String>> {
        match self.table.remove(key) {
            None => Ok(None),
            Some(toml::Value::String(s)) => Ok(Some(s)),
            Some(_) => Err(self.invalid(key, "must be a string")),
        }
    }

    fn take_template(&mut self, key: &str) -> BuildResult<Option<String>> {
        let template = self.take_string(key)?;
        if let Some(template) = &template {
            validate_template(template)?;
        }
        Ok(template)
    }

    fn take_strings(&mut self, key: &str) -> BuildResult<Option<Vec<String>>> {
        match self.table.remove(key) {
            None => Ok(None),
            Some(toml::Value::Array(items)) => items
                .into_iter()
                .map(|item| match item {
                    toml::Value::String(s) => Ok(s),
                    _ => Err(self.invalid(key, "must be a list of strings")),
                })
                .collect::<BuildResult<Vec<_>>>()
                .map(Some),
            Some(toml::Value::String(s)) => {
                Ok(Some(s.split_whitespace().map(str::to_owned).collect()))
            }
            Some(_) => Err(self.invalid(key, "must be a list of strings")),
        }
    }

    fn take_string_table(&mut self, key: &str) -> BuildResult<IndexMap<String, String>> {
        match self.table.remove(key) {
            None => Ok(IndexMap::new()),
            Some(toml::Value::Table(table)) => table
                .into_iter()
                .map(|(k, v)| match v {
                    toml::Value::String(s) => Ok((k, s)),
                    _ => Err(self.invalid(key, "must map names to strings")),
                })
                .collect(),
            Some(_) => Err(self.invalid(key, "must be a table")),
        }
    }

    fn finish(self) -> BuildResult<()> {
        match self.table.keys().next() {
            Some(key) => Err(BuildError::config(format!(
                "step '{}' does not accept option '{key}'",
                self.step
            ))),
            None => Ok(()),
        }
    }
}
