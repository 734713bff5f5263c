//! Module linking
//!
//! Rewrites the import sites of a transformed script into runtime requires of
//! stable module keys, and turns ES `export` syntax into assignments on
//! `exports`. Each rewrite stays on the line of the statement it replaces.

use std::{fmt::Write as _, ops::Range};

use once_cell::sync::Lazy;
use regex::Regex;
use rustc_hash::FxHashMap;

use super::runtime::DEFAULT_INTEROP;
use crate::{
    deps::{ImportBindings, ImportForm, ImportSite, ReExport, mask, parse_specifier_list, scan},
    transform::js_string,
};

static LOCAL_EXPORT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?x)
        \bexport\s+
        (?:
            (?P<default>default\b)
          | (?P<decl>(?:async\s+)?function\b\s*\*?|class\b|const\b|let\b|var\b)\s*(?P<name>[\w$]+)
          | (?P<list>\{[\w$\s,]*\})\s*(?P<from>from\b)?
        )",
    )
    .expect("export pattern is valid")
});

#[derive(Debug)]
struct Edit {
    range: Range<usize>,
    text: String,
}

/// Rewrite `source` for the bundle runtime.
///
/// `targets` maps each specifier of the module to the key of the module it
/// resolved to; specifiers without a target are left untouched.
pub(crate) fn link(source: &str, targets: &FxHashMap<&str, &str>) -> String {
    let sites = scan(source);
    let mut edits = Vec::new();
    let mut module_syntax = false;

    for (index, site) in sites.iter().enumerate() {
        if matches!(site.form, ImportForm::Import(_) | ImportForm::ExportFrom(_)) {
            module_syntax = true;
        }
        let Some(key) = targets.get(site.specifier.as_str()) else {
            continue;
        };
        edits.push(rewrite_site(site, key, index));
    }

    let mut exported = Vec::new();
    module_syntax |= collect_local_exports(source, &sites, &mut edits, &mut exported);

    edits.sort_by_key(|edit| edit.range.start);
    let mut out = String::with_capacity(source.len() + 64);
    if module_syntax {
        out.push_str("exports.__esModule = true; ");
    }
    let mut last = 0;
    for edit in &edits {
        if edit.range.start < last {
            continue;
        }
        out.push_str(&source[last..edit.range.start]);
        out.push_str(&edit.text);
        last = edit.range.end;
    }
    out.push_str(&source[last..]);

    if !exported.is_empty() {
        if !out.ends_with('\n') {
            out.push('\n');
        }
        for (local, name) in &exported {
            let _ = writeln!(out, "exports.{name} = {local};");
        }
    }
    out
}

fn rewrite_site(site: &ImportSite, key: &str, index: usize) -> Edit {
    let request = format!("require({})", js_string(key));
    let binding = format!("__loadout_import_{index}__");
    let text = match &site.form {
        ImportForm::Require => {
            // Only the literal changes; the surrounding call stays as written
            return Edit {
                range: site.specifier_range.start - 1..site.specifier_range.end + 1,
                text: js_string(key),
            };
        }
        ImportForm::Dynamic => {
            format!("Promise.resolve().then(function () {{ return {request}; }})")
        }
        ImportForm::Import(bindings) => import_statement(bindings, &request, &binding),
        ImportForm::ExportFrom(ReExport::All) => format!(
            "(function (m) {{ for (var k in m) if (k !== \"default\" && \
             !Object.prototype.hasOwnProperty.call(exports, k)) exports[k] = m[k]; }})({request});"
        ),
        ImportForm::ExportFrom(ReExport::Namespace(name)) => {
            format!("exports.{name} = {request};")
        }
        ImportForm::ExportFrom(ReExport::Named(pairs)) => {
            let mut text = format!("var {binding} = {request};");
            for (imported, exported) in pairs {
                let _ = write!(text, " exports.{exported} = {};", member(&binding, imported));
            }
            text
        }
    };
    Edit {
        range: site.range.clone(),
        text,
    }
}

fn import_statement(bindings: &ImportBindings, request: &str, binding: &str) -> String {
    if bindings.default.is_none() && bindings.namespace.is_none() && bindings.named.is_empty() {
        return format!("{request};");
    }
    let mut text = format!("var {binding} = {request};");
    if let Some(default) = &bindings.default {
        let _ = write!(text, " var {default} = {DEFAULT_INTEROP}({binding});");
    }
    if let Some(namespace) = &bindings.namespace {
        let _ = write!(text, " var {namespace} = {binding};");
    }
    for (imported, local) in &bindings.named {
        let _ = write!(text, " var {local} = {};", member(binding, imported));
    }
    text
}

fn member(binding: &str, name: &str) -> String {
    if name == "default" {
        format!("{DEFAULT_INTEROP}({binding})")
    } else {
        format!("{binding}.{name}")
    }
}

/// Strip `export` from local declarations and record what they export.
///
/// Returns whether the module has any local `export`.
fn collect_local_exports(
    source: &str,
    sites: &[ImportSite],
    edits: &mut Vec<Edit>,
    exported: &mut Vec<(String, String)>,
) -> bool {
    let mut found = false;
    let masked = mask(source);
    for caps in LOCAL_EXPORT.captures_iter(&masked) {
        let Some(whole) = caps.get(0) else { continue };
        if sites.iter().any(|site| site.range.contains(&whole.start())) {
            continue;
        }
        if let Some(default) = caps.name("default") {
            edits.push(Edit {
                range: whole.start()..default.end(),
                text: "exports.default =".to_owned(),
            });
        } else if let (Some(decl), Some(name)) = (caps.name("decl"), caps.name("name")) {
            edits.push(Edit {
                range: whole.start()..decl.start(),
                text: String::new(),
            });
            exported.push((name.as_str().to_owned(), name.as_str().to_owned()));
            if matches!(decl.as_str(), "const" | "let" | "var") {
                for extra in later_declarators(&masked, name.end()) {
                    exported.push((extra.clone(), extra));
                }
            }
        } else if let Some(list) = caps.name("list") {
            if caps.name("from").is_some() {
                continue;
            }
            edits.push(Edit {
                range: whole.start()..list.end(),
                text: String::new(),
            });
            exported.extend(parse_specifier_list(&source[list.range()]));
        } else {
            continue;
        }
        found = true;
    }
    found
}

/// Names bound by the declarators after the first one in `const a = 1, b = 2;`.
///
/// Scanning starts right after the first name and stops at a top-level `;`, or at
/// a top-level line break not adjacent to a comma. Destructuring declarators are
/// skipped.
fn later_declarators(masked: &str, from: usize) -> Vec<String> {
    let mut names = Vec::new();
    let mut depth = 0_usize;
    let mut last_significant = None;
    for (offset, c) in masked[from..].char_indices() {
        match c {
            '(' | '[' | '{' => depth += 1,
            ')' | ']' | '}' => {
                if depth == 0 {
                    break;
                }
                depth -= 1;
            }
            ';' if depth == 0 => break,
            '\n' if depth == 0 => {
                let continues = last_significant == Some(',')
                    || masked[from + offset + 1..].trim_start().starts_with(',');
                if !continues {
                    break;
                }
            }
            ',' if depth == 0 => {
                let rest = masked[from + offset + 1..].trim_start();
                let name: String = rest
                    .chars()
                    .take_while(|c| c.is_alphanumeric() || *c == '_' || *c == '$')
                    .collect();
                if !name.is_empty() && !name.starts_with(|c: char| c.is_ascii_digit()) {
                    names.push(name);
                }
            }
            _ => {}
        }
        if !c.is_whitespace() {
            last_significant = Some(c);
        }
    }
    names
}
