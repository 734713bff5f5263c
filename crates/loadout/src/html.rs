//! HTML page generation from the build manifest

use std::{fmt::Write as _, path::Path};

use cow_utils::CowUtils;
use indexmap::IndexSet;
use once_cell::sync::Lazy;
use regex::{NoExpand, Regex};

use crate::{
    config::{HtmlConfig, InjectPosition},
    emitter::OutputFile,
    error::{BuildError, BuildResult},
    manifest::Manifest,
};

static TITLE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{\{\s*title\s*\}\}").expect("title pattern is valid"));

const DEFAULT_TEMPLATE: &str = "<!DOCTYPE html>
<html>
  <head>
    <meta charset=\"utf-8\">
    <title>{{ title }}</title>
  </head>
  <body>
  </body>
</html>
";

const DEFAULT_TITLE: &str = "loadout";

/// Produces the page that loads a build's bundles
pub trait HtmlEmitter: std::fmt::Debug + Send + Sync {
    fn emit(&self, manifest: &Manifest, public_path: &str) -> BuildResult<OutputFile>;
}

/// Fills a template with a title and tags for every bundle in the manifest
#[derive(Debug, Clone)]
pub struct TemplateHtmlEmitter {
    title: String,
    template: String,
    inject: InjectPosition,
    filename: String,
}

impl TemplateHtmlEmitter {
    /// Load the configured template, relative to the project root
    pub fn from_config(config: &HtmlConfig, root: &Path) -> BuildResult<Self> {
        let template = match &config.template {
            Some(path) => {
                let path = root.join(path);
                std::fs::read_to_string(&path).map_err(|e| BuildError::io(path, e))?
            }
            None => DEFAULT_TEMPLATE.to_owned(),
        };
        Ok(Self {
            title: config.title.clone().unwrap_or_else(|| DEFAULT_TITLE.to_owned()),
            template,
            inject: config.inject,
            filename: config.filename.clone(),
        })
    }

    fn tags(manifest: &Manifest, public_path: &str) -> String {
        let files: IndexSet<&str> = manifest
            .entries
            .values()
            .flatten()
            .map(|asset| asset.path.as_str())
            .collect();
        let mut tags = String::new();
        for file in files {
            let url = escape(&format!("{public_path}{file}"));
            if file.ends_with(".css") {
                let _ = writeln!(tags, "    <link rel=\"stylesheet\" href=\"{url}\">");
            } else if file.ends_with(".js") {
                let _ = writeln!(tags, "    <script src=\"{url}\"></script>");
            }
        }
        tags
    }
}

impl HtmlEmitter for TemplateHtmlEmitter {
    fn emit(&self, manifest: &Manifest, public_path: &str) -> BuildResult<OutputFile> {
        let title = escape(&self.title);
        let page = TITLE.replace_all(&self.template, NoExpand(&title));
        let tags = Self::tags(manifest, public_path);
        let closing = match self.inject {
            InjectPosition::Head => "</head>",
            InjectPosition::Body => "</body>",
        };
        let html = match find_ignore_case(&page, closing) {
            Some(idx) => {
                let idx = line_start(&page, idx);
                format!("{}{tags}{}", &page[..idx], &page[idx..])
            }
            None => format!("{page}{tags}"),
        };
        Ok(OutputFile {
            path: self.filename.clone(),
            bytes: html.into_bytes(),
        })
    }
}

/// Byte offset of the last occurrence of an ASCII `needle`, ignoring case
pub(crate) fn find_ignore_case(haystack: &str, needle: &str) -> Option<usize> {
    haystack.to_ascii_lowercase().rfind(needle)
}

/// Move `idx` back to the start of its line when only indentation precedes it
fn line_start(text: &str, idx: usize) -> usize {
    let before = &text[..idx];
    let indent = before.len() - before.trim_end_matches([' ', '\t']).len();
    let start = idx - indent;
    if start == 0 || before[..start].ends_with('\n') {
        start
    } else {
        idx
    }
}

fn escape(text: &str) -> String {
    text.cow_replace('&', "&amp;")
        .cow_replace('<', "&lt;")
        .cow_replace('>', "&gt;")
        .cow_replace('"', "&quot;")
        .into_owned()
}
