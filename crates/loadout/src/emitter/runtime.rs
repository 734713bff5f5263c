//! Bundle runtime
//!
//! Every bundle registers its module definitions in one registry shared by all
//! bundles of the page. A module's exports object is cached before its body
//! runs, so a module required again while it is still initialising (a cycle)
//! receives its partially populated exports.

use std::fmt::Write as _;

use crate::transform::js_string;

/// Global the registry lives on
pub(crate) const REGISTRY: &str = "__loadout__";
/// Runtime require function, passed to module bodies as `require`
pub(crate) const REQUIRE: &str = "__loadout_require__";
/// Unwraps the default export of ES-style modules
pub(crate) const DEFAULT_INTEROP: &str = "__loadout_default__";

const PRELUDE: &str = r#"(function () {
var __loadout_global__ = typeof globalThis !== "undefined" ? globalThis : typeof window !== "undefined" ? window : this;
var __loadout__ = __loadout_global__.__loadout__ || (__loadout_global__.__loadout__ = { definitions: {}, cache: {} });
function __loadout_require__(key) {
  var cached = __loadout__.cache[key];
  if (cached) return cached.exports;
  var definition = __loadout__.definitions[key];
  if (!definition) throw new Error("loadout: unknown module " + key);
  var module = __loadout__.cache[key] = { exports: {} };
  definition.call(module.exports, module, module.exports, __loadout_require__);
  return module.exports;
}
function __loadout_default__(exports) {
  return exports && exports.__esModule ? exports["default"] : exports;
}
"#;

const EPILOGUE: &str = "})();\n";

/// Assembles one bundle's text
#[derive(Debug, Default)]
pub(crate) struct BundleWriter {
    text: String,
}

impl BundleWriter {
    pub(crate) fn new() -> Self {
        Self {
            text: PRELUDE.to_owned(),
        }
    }

    /// Register a module body under its key
    pub(crate) fn define(&mut self, key: &str, body: &str) {
        let _ = writeln!(
            self.text,
            "{REGISTRY}.definitions[{}] = function (module, exports, require) {{",
            js_string(key)
        );
        self.text.push_str(body);
        if !body.ends_with('\n') {
            self.text.push('\n');
        }
        self.text.push_str("};\n");
    }

    /// Evaluate an entry module once the bundle loads
    pub(crate) fn run(&mut self, key: &str) {
        let _ = writeln!(self.text, "{REQUIRE}({});", js_string(key));
    }

    pub(crate) fn finish(mut self) -> String {
        self.text.push_str(EPILOGUE);
        self.text
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bundle_layout() {
        let mut writer = BundleWriter::new();
        writer.define("src/a.js", "exports.a = 1;");
        writer.run("src/a.js");
        let text = writer.finish();
        insta::assert_snapshot!(&text[PRELUDE.len()..], @r#"
        __loadout__.definitions["src/a.js"] = function (module, exports, require) {
        exports.a = 1;
        };
        __loadout_require__("src/a.js");
        })();
        "#);
        assert!(text.starts_with("(function () {\n"));
    }
}
