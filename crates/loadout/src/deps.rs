//! Static dependency extraction from script modules
//!
//! Scans for `import`/`export ... from` statements, `require("...")` calls and
//! `import("...")` expressions. Comments and the contents of string and template
//! literals are masked first, so text that merely looks like an import is ignored.
//! Only literal specifiers count; computed ones are left to the runtime.

use std::ops::Range;

use indexmap::IndexSet;
use once_cell::sync::Lazy;
use regex::{Captures, Regex};

static IMPORT_SITE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"(?x)
        (?P<import>\bimport\b\s*(?:(?P<clause>[\w$\s{},*]+?)\s*\bfrom\s*)?(?P<iq>"[^"\n]*"|'[^'\n]*')\s*;?)
        | (?P<export>\bexport\s*(?P<eclause>\*(?:\s*as\s+[\w$]+)?|\{[\w$\s,]*\})\s*from\s*(?P<eq>"[^"\n]*"|'[^'\n]*')\s*;?)
        | (?P<require>\brequire\s*\(\s*(?P<rq>"[^"\n]*"|'[^'\n]*')\s*\))
        | (?P<dynamic>\bimport\s*\(\s*(?P<dq>"[^"\n]*"|'[^'\n]*')\s*\))
        "#,
    )
    .expect("import site pattern is valid")
});

/// Names bound by a static `import` statement
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportBindings {
    pub default: Option<String>,
    pub namespace: Option<String>,
    /// `(imported, local)` pairs
    pub named: Vec<(String, String)>,
}

/// What an `export ... from` statement re-exports
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReExport {
    /// `export * from "x"`
    All,
    /// `export * as ns from "x"`
    Namespace(String),
    /// `export { a, b as c } from "x"` as `(imported, exported)` pairs
    Named(Vec<(String, String)>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImportForm {
    /// Static `import`; no bindings means a side-effect import
    Import(ImportBindings),
    ExportFrom(ReExport),
    Require,
    Dynamic,
}

/// One place in a script that references another module
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportSite {
    /// Span of the whole statement or call
    pub range: Range<usize>,
    /// Span of the specifier text, without quotes
    pub specifier_range: Range<usize>,
    pub specifier: String,
    pub form: ImportForm,
}

/// Literal dependency specifiers of a script, in order of first appearance
pub fn extract_dependencies(source: &str) -> Vec<String> {
    let unique: IndexSet<String> = scan(source).into_iter().map(|site| site.specifier).collect();
    unique.into_iter().collect()
}

/// Every import site of a script, ordered by offset
pub fn scan(source: &str) -> Vec<ImportSite> {
    let masked = mask(source);
    IMPORT_SITE
        .captures_iter(&masked)
        .filter_map(|caps| site_from(&caps, source))
        .collect()
}

fn site_from(caps: &Captures<'_>, source: &str) -> Option<ImportSite> {
    let whole = caps.get(0)?.range();
    let (quoted, form) = if caps.name("import").is_some() {
        let bindings = caps
            .name("clause")
            .map(|c| parse_bindings(c.as_str()))
            .unwrap_or_default();
        (caps.name("iq")?, ImportForm::Import(bindings))
    } else if caps.name("export").is_some() {
        let clause = caps.name("eclause")?.as_str();
        (caps.name("eq")?, ImportForm::ExportFrom(parse_re_export(clause)))
    } else if caps.name("require").is_some() {
        (caps.name("rq")?, ImportForm::Require)
    } else {
        (caps.name("dq")?, ImportForm::Dynamic)
    };
    // Quotes are single bytes; the masked text keeps every offset of the source
    let specifier_range = quoted.start() + 1..quoted.end() - 1;
    let specifier = source.get(specifier_range.clone())?.to_owned();
    if specifier.is_empty() {
        return None;
    }
    Some(ImportSite {
        range: whole,
        specifier_range,
        specifier,
        form,
    })
}

fn parse_bindings(clause: &str) -> ImportBindings {
    let mut bindings = ImportBindings::default();
    let clause = clause.trim();
    let (head, rest) = if clause.starts_with('{') || clause.starts_with('*') {
        ("", clause)
    } else {
        match clause.split_once(',') {
            Some((head, rest)) => (head.trim(), rest.trim()),
            None => (clause, ""),
        }
    };
    if !head.is_empty() {
        bindings.default = Some(head.to_owned());
    }
    if let Some(ns) = rest.strip_prefix('*') {
        bindings.namespace = ns.trim().strip_prefix("as").map(|n| n.trim().to_owned());
    } else if rest.starts_with('{') {
        bindings.named = parse_specifier_list(rest);
    }
    bindings
}

fn parse_re_export(clause: &str) -> ReExport {
    let clause = clause.trim();
    if let Some(ns) = clause.strip_prefix('*') {
        match ns.trim().strip_prefix("as") {
            Some(name) => ReExport::Namespace(name.trim().to_owned()),
            None => ReExport::All,
        }
    } else {
        ReExport::Named(parse_specifier_list(clause))
    }
}

/// `{ a, b as c }` into `[(a, a), (b, c)]`
pub(crate) fn parse_specifier_list(list: &str) -> Vec<(String, String)> {
    list.trim()
        .trim_start_matches('{')
        .trim_end_matches('}')
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(|item| {
            let mut parts = item.split_whitespace();
            let imported = parts.next().unwrap_or_default().to_owned();
            let local = match (parts.next(), parts.next()) {
                (Some("as"), Some(local)) => local.to_owned(),
                _ => imported.clone(),
            };
            (imported, local)
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lexical {
    Code,
    LineComment,
    BlockComment,
    Quoted(char),
}

/// Copy of `source` with comments and literal contents blanked out.
///
/// Every byte offset is preserved: masked characters become as many spaces as
/// their UTF-8 width, newlines are kept, quote characters stay in place.
pub(crate) fn mask(source: &str) -> String {
    let mut out = String::with_capacity(source.len());
    let mut state = Lexical::Code;
    let mut chars = source.chars().peekable();
    let blank = |out: &mut String, c: char| {
        if c == '\n' {
            out.push('\n');
        } else {
            out.extend(std::iter::repeat_n(' ', c.len_utf8()));
        }
    };

    while let Some(c) = chars.next() {
        match state {
            Lexical::Code => match c {
                '/' if chars.peek() == Some(&'/') => {
                    chars.next();
                    out.push_str("  ");
                    state = Lexical::LineComment;
                }
                '/' if chars.peek() == Some(&'*') => {
                    chars.next();
                    out.push_str("  ");
                    state = Lexical::BlockComment;
                }
                '"' | '\'' | '`' => {
                    out.push(c);
                    state = Lexical::Quoted(c);
                }
                _ => out.push(c),
            },
            Lexical::LineComment => {
                blank(&mut out, c);
                if c == '\n' {
                    state = Lexical::Code;
                }
            }
            Lexical::BlockComment => {
                if c == '*' && chars.peek() == Some(&'/') {
                    chars.next();
                    out.push_str("  ");
                    state = Lexical::Code;
                } else {
                    blank(&mut out, c);
                }
            }
            Lexical::Quoted(quote) => {
                if c == quote {
                    out.push(c);
                    state = Lexical::Code;
                } else if c == '\\' {
                    blank(&mut out, c);
                    if let Some(escaped) = chars.next() {
                        blank(&mut out, escaped);
                    }
                } else if c == '\n' && quote != '`' {
                    // Unterminated string literal; resynchronise at the line end
                    out.push('\n');
                    state = Lexical::Code;
                } else {
                    blank(&mut out, c);
                }
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_all_forms_in_source_order() {
        let source = r#"
import Elm from './Main';
import './main.css';
import * as icons from "./icons";
export * from './reexported';
export { a as b } from "./named";
const lazy = import('./lazy');
var fonts = require("font-awesome/css/font-awesome.css");
"#;
        assert_eq!(
            extract_dependencies(source),
            vec![
                "./Main",
                "./main.css",
                "./icons",
                "./reexported",
                "./named",
                "./lazy",
                "font-awesome/css/font-awesome.css",
            ]
        );
    }

    #[test]
    fn test_duplicates_keep_first_position() {
        let source = "require('./b'); require('./a'); require('./b');";
        assert_eq!(extract_dependencies(source), vec!["./b", "./a"]);
    }

    #[test]
    fn test_comments_and_strings_are_ignored() {
        let source = r#"
// import './commented';
/* require("./block"); */
var text = "import x from './in-string'";
var tpl = `require('./in-template')`;
require('./real');
"#;
        assert_eq!(extract_dependencies(source), vec!["./real"]);
    }

    #[test]
    fn test_computed_specifiers_are_skipped() {
        let source = "require(name); import(`./pages/${page}`); require('./ok');";
        assert_eq!(extract_dependencies(source), vec!["./ok"]);
    }

    #[test]
    fn test_import_bindings() {
        let sites = scan("import main, { a, b as c } from './m';\nimport * as ns from './n';");
        assert_eq!(
            sites[0].form,
            ImportForm::Import(ImportBindings {
                default: Some("main".to_owned()),
                namespace: None,
                named: vec![
                    ("a".to_owned(), "a".to_owned()),
                    ("b".to_owned(), "c".to_owned()),
                ],
            })
        );
        assert_eq!(
            sites[1].form,
            ImportForm::Import(ImportBindings {
                namespace: Some("ns".to_owned()),
                ..ImportBindings::default()
            })
        );
    }

    #[test]
    fn test_ranges_point_into_source() {
        let source = "/* é */ import x from './x';";
        let sites = scan(source);
        assert_eq!(&source[sites[0].specifier_range.clone()], "./x");
        assert_eq!(&source[sites[0].range.clone()], "import x from './x';");
    }

    #[test]
    fn test_mask_preserves_offsets() {
        let source = "a /* ü */ 'ß' // x\nb";
        let masked = mask(source);
        assert_eq!(masked.len(), source.len());
        assert!(masked.ends_with("\nb"));
    }
}
