//! Output filename templates and content hashing
//!
//! Templates understand `[name]`, `[ext]`, `[hash]`, `[contenthash]` and
//! `[hash:N]`. Hashes are SHA-256 of the final bytes, hex encoded.

use std::fmt::Write as _;

use once_cell::sync::Lazy;
use regex::Regex;
use sha2::{Digest, Sha256};

use crate::error::{BuildError, BuildResult};

static PLACEHOLDER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\[([a-z]+)(?::(\d+))?\]").expect("placeholder pattern is valid")
});

/// Shortest hash prefix a template may request
pub const MIN_HASH_LEN: usize = 8;
const FULL_HASH_LEN: usize = 64;

/// SHA-256 of `bytes` as lowercase hex
pub fn content_hash(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    let mut hex = String::with_capacity(FULL_HASH_LEN);
    for byte in digest {
        let _ = write!(hex, "{byte:02x}");
    }
    hex
}

/// Reject templates with unknown placeholders or out-of-range hash widths
pub fn validate_template(template: &str) -> BuildResult<()> {
    for caps in PLACEHOLDER.captures_iter(template) {
        let key = &caps[1];
        match key {
            "name" | "ext" => {
                if caps.get(2).is_some() {
                    return Err(BuildError::config(format!(
                        "placeholder [{key}] does not take a length in '{template}'"
                    )));
                }
            }
            "hash" | "contenthash" => {
                if let Some(len) = caps.get(2) {
                    let len: usize = len.as_str().parse().map_err(|_| {
                        BuildError::config(format!("invalid hash length in '{template}'"))
                    })?;
                    if !(MIN_HASH_LEN..=FULL_HASH_LEN).contains(&len) {
                        return Err(BuildError::config(format!(
                            "hash length in '{template}' must be between {MIN_HASH_LEN} and \
                             {FULL_HASH_LEN}"
                        )));
                    }
                }
            }
            other => {
                return Err(BuildError::config(format!(
                    "unknown placeholder [{other}] in '{template}'"
                )));
            }
        }
    }
    Ok(())
}

/// Instantiate a template for a logical `name` and the final `bytes`.
///
/// `ext` includes its leading dot (or is empty).
pub fn render_template(template: &str, name: &str, ext: &str, bytes: &[u8]) -> String {
    let mut hash: Option<String> = None;
    PLACEHOLDER
        .replace_all(template, |caps: &regex::Captures<'_>| match &caps[1] {
            "name" => name.to_owned(),
            "ext" => ext.to_owned(),
            "hash" | "contenthash" => {
                let full = hash.get_or_insert_with(|| content_hash(bytes));
                let len = caps
                    .get(2)
                    .and_then(|m| m.as_str().parse::<usize>().ok())
                    .unwrap_or(FULL_HASH_LEN)
                    .min(FULL_HASH_LEN);
                full[..len].to_owned()
            }
            _ => caps[0].to_owned(),
        })
        .into_owned()
}

/// Split a file name into stem and dotted extension
pub fn split_name(file_name: &str) -> (&str, &str) {
    match file_name.rfind('.') {
        Some(0) | None => (file_name, ""),
        Some(idx) => file_name.split_at(idx),
    }
}
