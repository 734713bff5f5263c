//! Emitter: turns a finished module graph into bundles, assets and a manifest
//!
//! Rendering is pure and produces every output file in memory. Writing stages
//! the files in a temporary directory inside the output directory and moves
//! them into place; `manifest.json` goes last, so an interrupted emit never
//! publishes a manifest that points at missing files. Files the previous
//! manifest listed and the new one does not are deleted afterwards.

mod link;
mod runtime;

use std::path::{Path, PathBuf};

use indexmap::{IndexMap, IndexSet};
use log::{debug, info, warn};
use rustc_hash::FxHashMap;
use tokio_util::sync::CancellationToken;

use crate::{
    config::{Config, SHARED_BUNDLE_NAME, SharedModules},
    error::{BuildError, BuildResult},
    filename::render_template,
    manifest::{MANIFEST_FILE, Manifest, OutputAsset},
    module_graph::{ModuleGraph, ModuleId},
};
use runtime::BundleWriter;

/// One file of a rendered build
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputFile {
    /// Path relative to the output directory, forward-slashed
    pub path: String,
    pub bytes: Vec<u8>,
}

impl OutputFile {
    fn manifest_entry(&self) -> OutputAsset {
        OutputAsset {
            path: self.path.clone(),
            size_bytes: self.bytes.len() as u64,
        }
    }
}

/// Everything a build emits, held in memory
#[derive(Debug, Clone, Default)]
pub struct RenderedBuild {
    pub files: Vec<OutputFile>,
    pub manifest: Manifest,
}

impl RenderedBuild {
    pub fn file(&self, path: &str) -> Option<&OutputFile> {
        self.files.iter().find(|file| file.path == path)
    }

    /// Add a file that is not listed in the manifest, such as an HTML page
    pub fn add_page(&mut self, file: OutputFile) {
        self.files.retain(|existing| existing.path != file.path);
        self.files.push(file);
    }
}

#[derive(Debug)]
pub struct Emitter<'a> {
    config: &'a Config,
}

impl<'a> Emitter<'a> {
    pub fn new(config: &'a Config) -> Self {
        Self { config }
    }

    /// Render bundles for every entry except those in `skip`
    pub fn render(&self, graph: &ModuleGraph, skip: &[String]) -> RenderedBuild {
        let entries: Vec<(&String, &Vec<ModuleId>)> = graph
            .entries()
            .iter()
            .filter(|(name, roots)| !skip.contains(name) && !roots.is_empty())
            .collect();

        let shared = match self.config.output.shared_modules {
            SharedModules::Duplicate => IndexSet::new(),
            SharedModules::Shared => {
                graph.shared_modules(entries.iter().map(|(_, roots)| roots.as_slice()))
            }
        };

        let mut rendered = RenderedBuild::default();
        let mut assets: IndexMap<String, OutputFile> = IndexMap::new();

        let shared_bundle = (!shared.is_empty()).then(|| {
            let mut order: IndexSet<ModuleId> = IndexSet::new();
            for (_, roots) in &entries {
                order.extend(graph.bundle_order(roots).into_iter().filter(|id| shared.contains(id)));
            }
            let order: Vec<ModuleId> = order.into_iter().collect();
            collect_assets(graph, &order, &mut assets);
            let text = render_bundle(graph, &order, &[]);
            self.bundle_file(SHARED_BUNDLE_NAME, text)
        });

        for (name, roots) in entries {
            let full_order = graph.bundle_order(roots);
            let uses_shared = full_order.iter().any(|id| shared.contains(id));
            let order: Vec<ModuleId> = full_order
                .into_iter()
                .filter(|id| !shared.contains(id))
                .collect();
            collect_assets(graph, &order, &mut assets);
            let file = self.bundle_file(name, render_bundle(graph, &order, roots));
            debug!("Rendered bundle {} with {} modules", file.path, order.len());

            let mut listed = Vec::new();
            if let (true, Some(shared_file)) = (uses_shared, &shared_bundle) {
                listed.push(shared_file.manifest_entry());
            }
            listed.push(file.manifest_entry());
            rendered.manifest.entries.insert(name.clone(), listed);
            rendered.files.push(file);
        }

        if let Some(shared_file) = shared_bundle {
            rendered.files.insert(0, shared_file);
        }
        for (_, asset) in assets {
            rendered.manifest.assets.push(asset.manifest_entry());
            rendered.files.push(asset);
        }
        rendered
    }

    fn bundle_file(&self, name: &str, text: String) -> OutputFile {
        let path = render_template(&self.config.output.filename, name, ".js", text.as_bytes());
        OutputFile {
            path,
            bytes: text.into_bytes(),
        }
    }

    /// Write `rendered` into the output directory, manifest last
    pub async fn write(
        &self,
        rendered: &RenderedBuild,
        cancel: &CancellationToken,
    ) -> BuildResult<PathBuf> {
        let out_dir = self.config.output_dir();
        tokio::fs::create_dir_all(&out_dir)
            .await
            .map_err(|e| BuildError::io(&out_dir, e))?;
        let staging = tempfile::Builder::new()
            .prefix(".loadout-staging-")
            .tempdir_in(&out_dir)
            .map_err(|e| BuildError::io(&out_dir, e))?;

        for file in &rendered.files {
            write_file(&staging.path().join(&file.path), &file.bytes).await?;
        }
        let manifest_text = rendered.manifest.to_json();
        write_file(&staging.path().join(MANIFEST_FILE), manifest_text.as_bytes()).await?;

        if cancel.is_cancelled() {
            debug!("Emit cancelled before publishing");
            return Err(BuildError::Cancelled);
        }

        let manifest_path = out_dir.join(MANIFEST_FILE);
        let previous = Manifest::read(&manifest_path).unwrap_or_else(|e| {
            warn!("Ignoring unreadable previous manifest: {e}");
            None
        });
        for file in &rendered.files {
            publish(staging.path(), &out_dir, &file.path).await?;
        }
        publish(staging.path(), &out_dir, MANIFEST_FILE).await?;
        if let Some(previous) = previous {
            remove_outdated(&out_dir, &previous, &rendered.manifest).await;
        }
        info!(
            "Wrote {} files to {}",
            rendered.files.len() + 1,
            out_dir.display()
        );
        Ok(out_dir)
    }
}

/// Bundle text for `order`, running `roots` once every module is defined
fn render_bundle(graph: &ModuleGraph, order: &[ModuleId], roots: &[ModuleId]) -> String {
    let mut writer = BundleWriter::new();
    for &id in order {
        let module = graph.module(id);
        let Some(output) = &module.output else {
            warn!("Module {} has no output; leaving it out of the bundle", module.key);
            continue;
        };
        let source = String::from_utf8_lossy(&output.content);
        if module.parse_skipped {
            writer.define(&module.key, &source);
            continue;
        }
        let targets: FxHashMap<&str, &str> = module
            .dependencies
            .iter()
            .map(|(specifier, to)| (specifier.as_str(), graph.module(*to).key.as_str()))
            .collect();
        writer.define(&module.key, &link::link(&source, &targets));
    }
    for &root in roots {
        writer.run(&graph.module(root).key);
    }
    writer.finish()
}

fn collect_assets(graph: &ModuleGraph, order: &[ModuleId], assets: &mut IndexMap<String, OutputFile>) {
    for &id in order {
        let Some(output) = &graph.module(id).output else {
            continue;
        };
        for resource in &output.sub_resources {
            assets
                .entry(resource.file_name.clone())
                .or_insert_with(|| OutputFile {
                    path: resource.file_name.clone(),
                    bytes: resource.bytes.clone(),
                });
        }
    }
}

async fn write_file(path: &Path, bytes: &[u8]) -> BuildResult<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| BuildError::io(parent, e))?;
    }
    tokio::fs::write(path, bytes)
        .await
        .map_err(|e| BuildError::io(path, e))
}

/// Delete files the previous manifest listed and the new one no longer does
async fn remove_outdated(out_dir: &Path, previous: &Manifest, current: &Manifest) {
    let keep = current.all_paths();
    for path in previous.all_paths() {
        if keep.contains(path) {
            continue;
        }
        let relative = Path::new(path);
        if !relative
            .components()
            .all(|c| matches!(c, std::path::Component::Normal(_)))
        {
            warn!("Not removing {path}: outside the output directory");
            continue;
        }
        match tokio::fs::remove_file(out_dir.join(relative)).await {
            Ok(()) => debug!("Removed outdated {path}"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove outdated {path}: {e}"),
        }
    }
}

async fn publish(staging: &Path, out_dir: &Path, relative: &str) -> BuildResult<()> {
    let from = staging.join(relative);
    let to = out_dir.join(relative);
    if let Some(parent) = to.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| BuildError::io(parent, e))?;
    }
    tokio::fs::rename(&from, &to)
        .await
        .map_err(|e| BuildError::io(&to, e))
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::transform::{ContentKind, SubResource, TransformOutput};

    fn script(text: &str) -> Option<TransformOutput> {
        Some(TransformOutput {
            content: text.as_bytes().to_vec(),
            kind: ContentKind::Script,
            sub_resources: Vec::new(),
            applied: Vec::new(),
        })
    }

    fn config(extra: &str) -> Config {
        let text = format!(
            "[entries]\napp = [\"./app.js\"]\nadmin = [\"./admin.js\"]\n[output]\nfilename = \
             \"[name].[hash:8].js\"\n{extra}"
        );
        Config::from_toml_str(&text, PathBuf::from("/p")).expect("valid config")
    }

    /// app -> common -> logo.png, admin -> common
    fn graph() -> ModuleGraph {
        let mut graph = ModuleGraph::new();
        let app = graph.add_module(PathBuf::from("/p/app.js"), "app.js".to_owned());
        let admin = graph.add_module(PathBuf::from("/p/admin.js"), "admin.js".to_owned());
        let common = graph.add_module(PathBuf::from("/p/common.js"), "common.js".to_owned());
        let logo = graph.add_module(PathBuf::from("/p/logo.png"), "logo.png".to_owned());
        graph.module_mut(app).output = script("var c = require('./common');");
        graph.module_mut(admin).output = script("import c from './common';");
        graph.module_mut(common).output = script("module.exports = require('./logo.png');");
        graph.module_mut(logo).output = Some(TransformOutput {
            content: b"module.exports = \"logo.0123abcd.png\";\n".to_vec(),
            kind: ContentKind::Script,
            sub_resources: vec![SubResource {
                file_name: "logo.0123abcd.png".to_owned(),
                bytes: vec![1, 2, 3],
            }],
            applied: vec!["file".to_owned()],
        });
        graph.add_dependency(app, "./common".to_owned(), common);
        graph.add_dependency(admin, "./common".to_owned(), common);
        graph.add_dependency(common, "./logo.png".to_owned(), logo);
        graph.add_entry("app", app);
        graph.add_entry("admin", admin);
        graph
    }

    fn text(file: &OutputFile) -> &str {
        std::str::from_utf8(&file.bytes).expect("utf8")
    }

    #[test]
    fn test_duplicate_policy_gives_self_contained_bundles() {
        let config = config("");
        let rendered = Emitter::new(&config).render(&graph(), &[]);
        assert_eq!(rendered.manifest.entries.len(), 2);
        assert_eq!(rendered.manifest.assets.len(), 1);
        assert_eq!(rendered.manifest.assets[0].size_bytes, 3);

        let app = &rendered.manifest.entries["app"];
        assert_eq!(app.len(), 1);
        let bundle = text(rendered.file(&app[0].path).expect("app bundle"));
        let logo = bundle.find("definitions[\"logo.png\"]").expect("logo defined");
        let common = bundle.find("definitions[\"common.js\"]").expect("common defined");
        let entry = bundle.find("definitions[\"app.js\"]").expect("app defined");
        assert!(logo < common && common < entry);
        assert!(bundle.contains("var c = require(\"common.js\");"));
        assert!(bundle.ends_with("__loadout_require__(\"app.js\");\n})();\n"));
    }

    #[test]
    fn test_shared_policy_moves_common_modules() {
        let config = config("shared_modules = \"shared\"\n");
        let rendered = Emitter::new(&config).render(&graph(), &[]);
        let app = &rendered.manifest.entries["app"];
        let admin = &rendered.manifest.entries["admin"];
        assert_eq!(app.len(), 2);
        assert!(app[0].path.starts_with("shared."));
        assert_eq!(app[0], admin[0]);

        let shared = text(rendered.file(&app[0].path).expect("shared bundle"));
        assert!(shared.contains("definitions[\"common.js\"]"));
        assert!(!shared.contains("__loadout_require__(\"common.js\");"));
        let app_bundle = text(rendered.file(&app[1].path).expect("app bundle"));
        assert!(!app_bundle.contains("definitions[\"common.js\"]"));
    }

    #[test]
    fn test_rendering_is_deterministic() {
        let config = config("");
        let first = Emitter::new(&config).render(&graph(), &[]);
        let second = Emitter::new(&config).render(&graph(), &[]);
        assert_eq!(first.files, second.files);
        assert_eq!(first.manifest, second.manifest);
    }

    #[test]
    fn test_skipped_entries_are_not_rendered() {
        let config = config("");
        let rendered = Emitter::new(&config).render(&graph(), &["admin".to_owned()]);
        let names: Vec<&str> = rendered.manifest.entries.keys().map(String::as_str).collect();
        assert_eq!(names, vec!["app"]);
    }

    #[tokio::test]
    async fn test_write_publishes_manifest_last() {
        let dir = tempfile::TempDir::new().expect("temp dir");
        let mut config = config("");
        config.root = dir.path().to_path_buf();
        let emitter = Emitter::new(&config);
        let rendered = emitter.render(&graph(), &[]);

        let cancelled = CancellationToken::new();
        cancelled.cancel();
        let err = emitter
            .write(&rendered, &cancelled)
            .await
            .expect_err("cancelled emit");
        assert!(matches!(err, BuildError::Cancelled));
        assert!(!config.output_dir().join(MANIFEST_FILE).exists());

        let out_dir = emitter
            .write(&rendered, &CancellationToken::new())
            .await
            .expect("emit");
        let manifest = Manifest::read(&out_dir.join(MANIFEST_FILE))
            .expect("read")
            .expect("manifest written");
        assert_eq!(manifest, rendered.manifest);
        for path in manifest.all_paths() {
            assert!(out_dir.join(path).is_file(), "{path} should exist");
        }
        let leftovers = std::fs::read_dir(&out_dir)
            .expect("read dir")
            .filter_map(Result::ok)
            .filter(|e| e.file_name().to_string_lossy().starts_with(".loadout-staging-"))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn test_write_removes_files_dropped_from_the_manifest() {
        let dir = tempfile::TempDir::new().expect("temp dir");
        let mut config = config("");
        config.root = dir.path().to_path_buf();
        let emitter = Emitter::new(&config);
        let first = emitter.render(&graph(), &[]);
        let out_dir = emitter
            .write(&first, &CancellationToken::new())
            .await
            .expect("emit");

        let mut changed = graph();
        let app = changed.id_of(Path::new("/p/app.js")).expect("app module");
        changed.module_mut(app).output = script("var c = require('./common'); c();");
        let second = emitter.render(&changed, &[]);
        emitter
            .write(&second, &CancellationToken::new())
            .await
            .expect("emit");

        let old_app = &first.manifest.entries["app"][0].path;
        let new_app = &second.manifest.entries["app"][0].path;
        assert_ne!(old_app, new_app);
        assert!(!out_dir.join(old_app).exists());
        for path in second.manifest.all_paths() {
            assert!(out_dir.join(path).is_file(), "{path} should exist");
        }
    }
}
