//! Transform chain executor
//!
//! Runs the steps selected by the rule matcher over a module's raw bytes. Step
//! `i`'s output is step `i + 1`'s input; the caller passes steps already in
//! execution order (see [`step::execution_order`]).

mod asset;
mod command;
mod css;
pub mod step;

use std::path::Path;

use log::trace;

use crate::error::{BuildError, BuildResult};
pub use step::{StepDescriptor, StepKind, execution_order};

/// Broad category of a module's content
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContentKind {
    /// Executable script in the bundle's module format
    Script,
    /// Style sheet text
    Style,
    /// Anything else; emitted as a file
    Asset,
}

impl ContentKind {
    /// Kind of a file before any transform ran, judged by extension
    pub fn from_path(path: &Path) -> Self {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase);
        match ext.as_deref() {
            Some("js" | "mjs" | "cjs") => Self::Script,
            Some("css" | "scss" | "sass" | "less") => Self::Style,
            _ => Self::Asset,
        }
    }
}

impl std::fmt::Display for ContentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Script => write!(f, "script"),
            Self::Style => write!(f, "style"),
            Self::Asset => write!(f, "asset"),
        }
    }
}

/// Per-module inputs the steps may consult
#[derive(Debug, Clone, Copy)]
pub struct TransformContext<'a> {
    /// Absolute path of the module
    pub path: &'a Path,
    /// Stable project-relative key of the module
    pub module_key: &'a str,
    /// Project root, working directory for external commands
    pub root: &'a Path,
    /// Prefix for URLs of emitted assets
    pub public_path: &'a str,
    /// Default filename template for emitted assets
    pub asset_template: &'a str,
}

/// A file extracted from a module and emitted next to the bundles
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubResource {
    pub file_name: String,
    pub bytes: Vec<u8>,
}

/// Final content of a module after its chain ran
#[derive(Debug, Clone)]
pub struct TransformOutput {
    pub content: Vec<u8>,
    pub kind: ContentKind,
    pub sub_resources: Vec<SubResource>,
    /// Names of the steps that ran, in execution order
    pub applied: Vec<String>,
}

/// Content flowing between steps
#[derive(Debug)]
struct StepState {
    content: Vec<u8>,
    kind: ContentKind,
    sub_resources: Vec<SubResource>,
}

/// Run `steps` (in execution order) over `raw`.
///
/// Content that is not a script once the chain finished is treated as an opaque
/// asset: it is emitted as a file and the module exports its URL.
pub async fn apply(
    raw: Vec<u8>,
    steps: &[StepDescriptor],
    ctx: &TransformContext<'_>,
) -> BuildResult<TransformOutput> {
    let mut state = StepState {
        content: raw,
        kind: ContentKind::from_path(ctx.path),
        sub_resources: Vec::new(),
    };
    let mut applied = Vec::with_capacity(steps.len());

    for step in steps {
        trace!("Applying step '{}' to {}", step.name, ctx.path.display());
        state = run_step(step, state, ctx)
            .await
            .map_err(|reason| BuildError::Transform {
                step: step.name.clone(),
                path: ctx.path.to_path_buf(),
                reason,
            })?;
        applied.push(step.name.clone());
    }

    if state.kind != ContentKind::Script {
        state = asset::emit_file(state, None, None, ctx);
    }

    Ok(TransformOutput {
        content: state.content,
        kind: state.kind,
        sub_resources: state.sub_resources,
        applied,
    })
}

/// Output for a module whose chain is skipped entirely.
///
/// Scripts are carried verbatim; anything else is copied as an asset.
pub fn passthrough(raw: Vec<u8>, ctx: &TransformContext<'_>) -> TransformOutput {
    let state = StepState {
        content: raw,
        kind: ContentKind::from_path(ctx.path),
        sub_resources: Vec::new(),
    };
    let state = if state.kind == ContentKind::Script {
        state
    } else {
        asset::emit_file(state, None, None, ctx)
    };
    TransformOutput {
        content: state.content,
        kind: state.kind,
        sub_resources: state.sub_resources,
        applied: Vec::new(),
    }
}

async fn run_step(
    step: &StepDescriptor,
    state: StepState,
    ctx: &TransformContext<'_>,
) -> Result<StepState, String> {
    match &step.kind {
        StepKind::Css(options) => css::load(state, options),
        StepKind::Style(options) => css::inject(state, options, ctx),
        StepKind::Url(options) => Ok(asset::url(state, options, ctx)),
        StepKind::File(options) => Ok(asset::emit_file(
            state,
            options.name.as_deref(),
            options.public_path.as_deref(),
            ctx,
        )),
        StepKind::Raw => asset::raw(state),
        StepKind::Json => asset::json(state),
        StepKind::Command(options) => command::run(state, options, ctx).await,
    }
}

/// Quote `text` as a JavaScript string literal
pub(crate) fn js_string(text: &str) -> String {
    serde_json::Value::String(text.to_owned()).to_string()
}

fn utf8(content: Vec<u8>, what: &str) -> Result<String, String> {
    String::from_utf8(content).map_err(|e| format!("{what} is not valid UTF-8: {e}"))
}
