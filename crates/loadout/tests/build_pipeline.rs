use std::{
    fs,
    path::{Path, PathBuf},
};

use loadout::{
    bundler::{self, BuildReport},
    config::Config,
    error::BuildFailed,
    manifest::{MANIFEST_FILE, Manifest},
};
use pretty_assertions::assert_eq;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

/// A throwaway project: `files` are written relative to the root next to `loadout.toml`
fn project(config: &str, files: &[(&str, &[u8])]) -> (TempDir, Config) {
    let dir = TempDir::new().expect("temp dir");
    for (path, contents) in files {
        let path = dir.path().join(path);
        fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
        fs::write(path, contents).expect("write");
    }
    let config_path = dir.path().join("loadout.toml");
    fs::write(&config_path, config).expect("write config");
    let config = Config::load(&config_path).expect("config");
    (dir, config)
}

async fn build(config: Config) -> BuildReport {
    bundler::build(config, CancellationToken::new())
        .await
        .expect("build succeeds")
}

fn bundle_text(report: &BuildReport, entry: &str) -> String {
    let file = report.manifest.entries[entry]
        .last()
        .expect("entry has a bundle");
    fs::read_to_string(report.output_dir.join(&file.path)).expect("bundle on disk")
}

fn snapshot_dir(dir: &Path) -> Vec<(PathBuf, Vec<u8>)> {
    let mut files = Vec::new();
    let mut stack = vec![dir.to_path_buf()];
    while let Some(current) = stack.pop() {
        for entry in fs::read_dir(&current).expect("read dir") {
            let path = entry.expect("entry").path();
            if path.is_dir() {
                stack.push(path);
            } else {
                let bytes = fs::read(&path).expect("read");
                files.push((path.strip_prefix(dir).expect("inside").to_path_buf(), bytes));
            }
        }
    }
    files.sort();
    files
}

#[tokio::test]
async fn test_commonjs_bundle_text() {
    let (_dir, config) = project(
        "[entries]\napp = [\"./src/index.js\"]\n",
        &[
            ("src/index.js", b"var greet = require('./greet');\ngreet('world');\n"),
            ("src/greet.js", b"module.exports = function (name) { return 'hi ' + name; };\n"),
        ],
    );
    let report = build(config).await;
    let bundle = bundle_text(&report, "app");
    let body = &bundle[bundle.find("__loadout__.definitions[\"").expect("definitions")..];
    insta::assert_snapshot!(body, @r#"
    __loadout__.definitions["src/greet.js"] = function (module, exports, require) {
    module.exports = function (name) { return 'hi ' + name; };
    };
    __loadout__.definitions["src/index.js"] = function (module, exports, require) {
    var greet = require("src/greet.js");
    greet('world');
    };
    __loadout_require__("src/index.js");
    })();
    "#);
}

#[tokio::test]
async fn test_acyclic_bundle_order_is_topological() {
    let (_dir, config) = project(
        "[entries]\napp = [\"./src/index.js\"]\n",
        &[
            ("src/index.js", b"import a from './a';\nimport c from './c';\na(c);\n"),
            ("src/a.js", b"var b = require('./b');\nmodule.exports = b;\n"),
            ("src/b.js", b"require('./c');\nmodule.exports = 2;\n"),
            ("src/c.js", b"module.exports = 3;\n"),
        ],
    );
    let report = build(config).await;
    let bundle = bundle_text(&report, "app");
    let position = |key: &str| {
        bundle
            .find(&format!("definitions[\"{key}\"]"))
            .expect("module is defined")
    };
    assert!(position("src/c.js") < position("src/b.js"));
    assert!(position("src/b.js") < position("src/a.js"));
    assert!(position("src/a.js") < position("src/index.js"));
    assert_eq!(report.module_count, 4);
}

#[tokio::test]
async fn test_unchanged_inputs_give_identical_output() {
    let config_text = r#"
[entries]
app = ["./src/index.js"]
admin = ["./src/admin.js"]

[output]
filename = "[name].[hash:8].js"
shared_modules = "shared"

[[module.rules]]
test = '\.png$'
use = ["file"]
"#;
    let (dir, config) = project(
        config_text,
        &[
            ("src/index.js", b"require('./lib');\nrequire('./logo.png');\n"),
            ("src/admin.js", b"require('./lib');\n"),
            ("src/lib.js", b"module.exports = {};\n"),
            ("src/logo.png", b"\x89PNG fake"),
        ],
    );
    let first_report = build(config.clone()).await;
    let first = snapshot_dir(&dir.path().join("dist"));
    fs::remove_dir_all(dir.path().join("dist")).expect("clean");
    let second_report = build(config).await;
    let second = snapshot_dir(&dir.path().join("dist"));

    assert_eq!(first_report.manifest, second_report.manifest);
    assert_eq!(first, second);
    assert!(first_report.manifest.entries["app"][0].path.starts_with("shared."));
    assert_eq!(first_report.manifest.assets.len(), 1);
}

#[tokio::test]
async fn test_css_chain_injects_a_style_wrapper() {
    let config_text = r#"
[entries]
app = ["./src/index.js"]

[[module.rules]]
name = "styles"
test = '\.css$'
use = ["style-inject", "css-load"]
"#;
    let (_dir, config) = project(
        config_text,
        &[
            ("src/index.js", b"require('./main.css');\n"),
            ("src/main.css", b"body { margin: 0; }\n"),
        ],
    );
    let report = build(config).await;
    let bundle = bundle_text(&report, "app");
    assert!(bundle.contains("document.createElement(\"style\")"));
    assert!(bundle.contains("\"body { margin: 0; }\\n\""));
    assert!(!bundle.contains("\nbody { margin: 0; }"));
}

#[tokio::test]
async fn test_no_parse_modules_are_emitted_without_edges() {
    let config_text = r#"
[entries]
app = ["./src/index.js"]

[module]
no_parse = ['/vendor/']
"#;
    let (_dir, config) = project(
        config_text,
        &[
            ("src/index.js", b"require('./vendor/legacy');\n"),
            ("src/vendor/legacy.js", b"var dep = require('./does-not-exist');\n"),
        ],
    );
    let report = build(config).await;
    assert_eq!(report.module_count, 2);
    let bundle = bundle_text(&report, "app");
    assert!(bundle.contains("var dep = require('./does-not-exist');"));
    assert!(bundle.contains("require(\"src/vendor/legacy.js\")"));
}

#[tokio::test]
async fn test_url_threshold_inlines_or_emits() {
    let config_text = r#"
[entries]
app = ["./src/index.js"]

[[module.rules]]
test = '\.(png|woff)$'
use = ["url-loader?limit=10"]
"#;
    let (dir, config) = project(
        config_text,
        &[
            ("src/index.js", b"require('./dot.png');\nrequire('./font.woff');\n"),
            ("src/dot.png", b"tiny"),
            ("src/font.woff", b"definitely over ten bytes"),
        ],
    );
    let report = build(config).await;
    let bundle = bundle_text(&report, "app");
    assert!(bundle.contains("data:image/png;base64,"));
    assert!(!bundle.contains("data:font/woff"));
    assert_eq!(report.manifest.assets.len(), 1);
    let asset = &report.manifest.assets[0];
    assert!(asset.path.ends_with(".woff"));
    assert!(bundle.contains(&asset.path));
    assert!(dir.path().join("dist").join(&asset.path).exists());
}

#[tokio::test]
async fn test_identical_bundles_share_a_hash() {
    let config_text = r#"
[entries]
app = ["./src/main.js"]
mirror = ["./src/main.js"]

[output]
filename = "[name].[hash:12].js"
"#;
    let (_dir, config) = project(config_text, &[("src/main.js", b"console.log(1);\n")]);
    let report = build(config).await;
    let app = &report.manifest.entries["app"][0].path;
    let mirror = &report.manifest.entries["mirror"][0].path;
    let app_hash = app.strip_prefix("app.").expect("app prefix");
    let mirror_hash = mirror.strip_prefix("mirror.").expect("mirror prefix");
    assert_eq!(app_hash.len(), "0123456789ab.js".len());
    assert_eq!(app_hash, mirror_hash);
}

#[tokio::test]
async fn test_distinct_files_with_equal_content_share_a_hash() {
    let config_text = r#"
[entries]
main = ["./src/main.js"]
alt = ["./src/alt.js"]

[output]
filename = "[name].[hash:12].js"
asset_filename = "[name]-[hash:12][ext]"

[[module.rules]]
test = '\.png$'
use = ["file"]
"#;
    let (dir, config) = project(
        config_text,
        &[
            ("src/main.js", b"require('./img/logo.png');\n"),
            ("src/alt.js", b"require('./img/badge.png');\n"),
            ("src/img/logo.png", b"\x89PNG same pixels"),
            ("src/img/badge.png", b"\x89PNG same pixels"),
        ],
    );
    let report = build(config).await;
    let asset = |prefix: &str| {
        report
            .manifest
            .assets
            .iter()
            .map(|asset| asset.path.as_str())
            .find(|path| path.starts_with(prefix))
            .expect("asset emitted")
            .to_owned()
    };
    let logo = asset("logo-");
    let badge = asset("badge-");
    let logo_hash = logo.strip_prefix("logo-").expect("logo prefix");
    let badge_hash = badge.strip_prefix("badge-").expect("badge prefix");
    assert_eq!(logo_hash.len(), "0123456789ab.png".len());
    assert_eq!(logo_hash, badge_hash);
    assert!(dir.path().join("dist").join(&logo).exists());
    assert!(dir.path().join("dist").join(&badge).exists());
}

#[tokio::test]
async fn test_cycle_builds_and_is_reported() {
    let (_dir, config) = project(
        "[entries]\napp = [\"./src/a.js\"]\n",
        &[
            ("src/a.js", b"var b = require('./b');\nexports.a = 1;\n"),
            ("src/b.js", b"var a = require('./a');\nexports.b = 2;\n"),
        ],
    );
    let report = build(config).await;
    assert_eq!(report.module_count, 2);
    assert_eq!(report.cycles.len(), 1);
    let bundle = bundle_text(&report, "app");
    assert_eq!(bundle.matches("definitions[\"src/a.js\"]").count(), 1);
    assert_eq!(bundle.matches("definitions[\"src/b.js\"]").count(), 1);
}

#[tokio::test]
async fn test_failed_build_names_entries_and_publishes_nothing() {
    let (dir, config) = project(
        "[entries]\napp = [\"./src/index.js\"]\n",
        &[
            ("src/index.js", b"require('./leaf');\n"),
            ("src/leaf.js", b"require('./missing');\n"),
        ],
    );
    let err = bundler::build(config, CancellationToken::new())
        .await
        .expect_err("unresolved module");
    let failed = err.downcast_ref::<BuildFailed>().expect("build failure summary");
    assert_eq!(failed.0.len(), 1);
    assert_eq!(failed.0[0].entries, vec!["app".to_owned()]);
    let summary = failed.to_json();
    assert_eq!(summary["errors"][0]["kind"], "resolution");
    let module = summary["errors"][0]["module"].as_str().expect("module path");
    assert!(Path::new(module).ends_with("src/leaf.js"), "reported {module}");
    assert!(failed.0[0].to_string().contains("leaf.js"));
    let manifest = Manifest::read(&dir.path().join("dist").join(MANIFEST_FILE)).expect("read");
    assert!(manifest.is_none());
}

#[tokio::test]
async fn test_html_page_lists_bundles() {
    let config_text = r#"
[entries]
app = ["./src/index.js"]

[output]
public_path = "/assets/"

[html]
title = "Space Junker"
"#;
    let (dir, config) = project(config_text, &[("src/index.js", b"console.log(1);\n")]);
    build(config).await;
    let page = fs::read_to_string(dir.path().join("dist/index.html")).expect("page");
    assert!(page.contains("<title>Space Junker</title>"));
    assert!(page.contains("<script src=\"/assets/app.js\"></script>"));
}
