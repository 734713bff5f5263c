//! `url`, `file`, `raw` and `json` steps

use base64::{Engine as _, engine::general_purpose::STANDARD};

use super::{
    ContentKind, StepState, SubResource, TransformContext, js_string, step::UrlOptions, utf8,
};
use crate::filename::{render_template, split_name};

/// Emit the content as a separate file and export its public URL
pub(super) fn emit_file(
    mut state: StepState,
    name_template: Option<&str>,
    public_path: Option<&str>,
    ctx: &TransformContext<'_>,
) -> StepState {
    let file_name = ctx
        .path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let (stem, ext) = split_name(&file_name);
    let template = name_template.unwrap_or(ctx.asset_template);
    let emitted = render_template(template, stem, ext, &state.content);
    let url = format!("{}{emitted}", public_path.unwrap_or(ctx.public_path));

    state.sub_resources.push(SubResource {
        file_name: emitted,
        bytes: std::mem::take(&mut state.content),
    });
    StepState {
        content: format!("module.exports = {};\n", js_string(&url)).into_bytes(),
        kind: ContentKind::Script,
        sub_resources: state.sub_resources,
    }
}

/// Inline small content as a `data:` URI, emit anything at or above the limit.
///
/// Exactly one representation is produced for the content.
pub(super) fn url(state: StepState, options: &UrlOptions, ctx: &TransformContext<'_>) -> StepState {
    let inline = options.limit.is_none_or(|limit| state.content.len() < limit);
    if !inline {
        return emit_file(state, options.name.as_deref(), None, ctx);
    }
    let mime = options.mimetype.clone().unwrap_or_else(|| {
        mime_guess::from_path(ctx.path)
            .first_raw()
            .unwrap_or("application/octet-stream")
            .to_owned()
    });
    let uri = format!("data:{mime};base64,{}", STANDARD.encode(&state.content));
    StepState {
        content: format!("module.exports = {};\n", js_string(&uri)).into_bytes(),
        kind: ContentKind::Script,
        sub_resources: state.sub_resources,
    }
}

pub(super) fn raw(state: StepState) -> Result<StepState, String> {
    let text = utf8(state.content, "file")?;
    Ok(StepState {
        content: format!("module.exports = {};\n", js_string(&text)).into_bytes(),
        kind: ContentKind::Script,
        sub_resources: state.sub_resources,
    })
}

pub(super) fn json(state: StepState) -> Result<StepState, String> {
    let value: serde_json::Value =
        serde_json::from_slice(&state.content).map_err(|e| format!("invalid JSON: {e}"))?;
    Ok(StepState {
        content: format!("module.exports = {value};\n").into_bytes(),
        kind: ContentKind::Script,
        sub_resources: state.sub_resources,
    })
}
