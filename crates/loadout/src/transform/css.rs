//! `css` and `style` steps

use std::fmt::Write as _;

use once_cell::sync::Lazy;
use regex::{Captures, Regex};

use super::{
    ContentKind, StepState, TransformContext, js_string,
    step::{CssOptions, StyleInsert, StyleOptions},
    utf8,
};

static IMPORT_RULE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"@import\s+(?:url\(\s*)?(?:"([^"]*)"|'([^']*)'|([^"')\s;]+))\s*\)?[^;]*;"#)
        .expect("import pattern is valid")
});

static URL_FUNCTION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"url\(\s*(?:"([^"]*)"|'([^']*)'|([^"')\s]*))\s*\)"#)
        .expect("url pattern is valid")
});

fn first_group<'t>(caps: &Captures<'t>) -> &'t str {
    caps.get(1)
        .or_else(|| caps.get(2))
        .or_else(|| caps.get(3))
        .map_or("", |m| m.as_str())
}

/// Whether a `url(...)` target names a file of the project
fn is_module_reference(target: &str) -> bool {
    !(target.is_empty()
        || target.starts_with('#')
        || target.starts_with('/')
        || target.starts_with("data:")
        || target.starts_with("http:")
        || target.starts_with("https:"))
}

/// Module request for a style sheet reference; CSS treats `a.png` as `./a.png`
fn module_request(target: &str) -> String {
    if let Some(bare) = target.strip_prefix('~') {
        bare.to_owned()
    } else if target.starts_with("./") || target.starts_with("../") {
        target.to_owned()
    } else {
        format!("./{target}")
    }
}

/// Turn a style sheet into a script exporting its text.
///
/// `@import` rules become side-effect requires placed before the sheet, and
/// relative `url(...)` targets become requires of the referenced files.
pub(super) fn load(state: StepState, options: &CssOptions) -> Result<StepState, String> {
    if state.kind == ContentKind::Script {
        return Err("input is already a script; the css step expects style sheet text".to_owned());
    }
    let css = utf8(state.content, "style sheet")?;

    let mut imports = Vec::new();
    let sheet = IMPORT_RULE.replace_all(&css, |caps: &Captures<'_>| {
        let target = first_group(caps);
        if is_module_reference(target) {
            imports.push(module_request(target));
            String::new()
        } else {
            caps[0].to_owned()
        }
    });

    let mut pieces = Vec::new();
    let mut last = 0;
    if options.url {
        for caps in URL_FUNCTION.captures_iter(&sheet) {
            let target = first_group(&caps);
            if !is_module_reference(target) {
                continue;
            }
            let whole = caps.get(0).map_or(0..0, |m| m.range());
            pieces.push(js_string(&sheet[last..whole.start]));
            pieces.push(format!(
                "\"url(\" + require({}) + \")\"",
                js_string(&module_request(target))
            ));
            last = whole.end;
        }
    }
    pieces.push(js_string(&sheet[last..]));

    let mut script = String::new();
    for request in &imports {
        let _ = writeln!(script, "require({});", js_string(request));
    }
    let _ = writeln!(script, "module.exports = {};", pieces.join(" + "));

    Ok(StepState {
        content: script.into_bytes(),
        kind: ContentKind::Script,
        sub_resources: state.sub_resources,
    })
}

/// Wrap a CSS-exporting script so that evaluating it injects a `<style>` element
pub(super) fn inject(
    state: StepState,
    options: &StyleOptions,
    ctx: &TransformContext<'_>,
) -> Result<StepState, String> {
    if state.kind != ContentKind::Script {
        return Err(format!(
            "input is {} text; the style step expects a module exporting CSS, declare the css \
             step after it",
            state.kind
        ));
    }
    let inner = utf8(state.content, "module")?;
    let parent = match options.insert {
        StyleInsert::Head => "document.head",
        StyleInsert::Body => "(document.body || document.head)",
    };

    let mut script = String::new();
    script.push_str("var __loadout_css_module__ = { exports: {} };\n");
    script.push_str("(function (module, exports) {\n");
    script.push_str(&inner);
    if !inner.ends_with('\n') {
        script.push('\n');
    }
    script.push_str("})(__loadout_css_module__, __loadout_css_module__.exports);\n");
    script.push_str("var __loadout_css__ = __loadout_css_module__.exports;\n");
    script.push_str("if (typeof document !== \"undefined\") {\n");
    script.push_str("  var __loadout_style__ = document.createElement(\"style\");\n");
    let _ = writeln!(
        script,
        "  __loadout_style__.setAttribute(\"data-loadout-module\", {});",
        js_string(ctx.module_key)
    );
    for (name, value) in &options.attributes {
        let _ = writeln!(
            script,
            "  __loadout_style__.setAttribute({}, {});",
            js_string(name),
            js_string(value)
        );
    }
    script.push_str("  __loadout_style__.appendChild(document.createTextNode(String(__loadout_css__)));\n");
    let _ = writeln!(script, "  {parent}.appendChild(__loadout_style__);");
    script.push_str("}\n");
    script.push_str("module.exports = __loadout_css__;\n");

    Ok(StepState {
        content: script.into_bytes(),
        kind: ContentKind::Script,
        sub_resources: state.sub_resources,
    })
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;
    use crate::deps::extract_dependencies;

    fn style_state(css: &str) -> StepState {
        StepState {
            content: css.as_bytes().to_vec(),
            kind: ContentKind::Style,
            sub_resources: Vec::new(),
        }
    }

    fn loaded(css: &str, url: bool) -> String {
        let out = load(style_state(css), &CssOptions { url }).expect("css step");
        String::from_utf8(out.content).expect("utf8")
    }

    #[test]
    fn test_plain_sheet_exports_text() {
        assert_eq!(
            loaded("a { color: red; }", true),
            "module.exports = \"a { color: red; }\";\n"
        );
    }

    #[test]
    fn test_url_references_become_requires() {
        let script = loaded(
            "@font-face { src: url('fonts/icons.woff?v=4.7.0') format('woff'); }\n\
             .logo { background: url(data:image/png;base64,AAAA); }\n\
             .remote { background: url(\"https://example.com/x.png\"); }",
            true,
        );
        assert!(script.contains("\"url(\" + require(\"./fonts/icons.woff?v=4.7.0\") + \")\""));
        assert!(script.contains("url(data:image/png;base64,AAAA)"));
        assert_eq!(
            extract_dependencies(&script),
            vec!["./fonts/icons.woff?v=4.7.0".to_owned()]
        );
    }

    #[test]
    fn test_url_option_disables_rewriting() {
        let script = loaded(".a { background: url(./a.png); }", false);
        assert!(!script.contains("require("));
    }

    #[test]
    fn test_imports_are_hoisted_as_requires() {
        let script = loaded("@import \"./base.css\";\n@import url(~theme/dark.css) screen;\nbody{}", true);
        assert!(script.starts_with("require(\"./base.css\");\nrequire(\"theme/dark.css\");\n"));
        assert!(!script.contains("@import"));
    }

    #[test]
    fn test_inject_wraps_exports() {
        let css = load(style_state("p{}"), &CssOptions { url: true }).expect("css");
        let ctx = TransformContext {
            path: Path::new("/p/src/a.css"),
            module_key: "src/a.css",
            root: Path::new("/p"),
            public_path: "",
            asset_template: "[hash][ext]",
        };
        let options = StyleOptions {
            insert: StyleInsert::Head,
            attributes: [("nonce".to_owned(), "abc".to_owned())].into_iter().collect(),
        };
        let out = inject(css, &options, &ctx).expect("style step");
        let script = String::from_utf8(out.content).expect("utf8");
        assert!(script.contains("setAttribute(\"data-loadout-module\", \"src/a.css\")"));
        assert!(script.contains("setAttribute(\"nonce\", \"abc\")"));
        assert!(script.contains("document.head.appendChild(__loadout_style__)"));
        assert!(script.ends_with("module.exports = __loadout_css__;\n"));
    }
}
