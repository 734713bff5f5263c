//! Dev server loop
//!
//! A [`DevSession`] owns everything carried from one build to the next: the
//! module graph, the transform cache and the last rendered output. Rebuilds
//! reuse cached transforms for untouched modules, and an entry that fails keeps
//! its previous files until a later rebuild succeeds for it.

pub mod http;
mod watcher;

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use log::{debug, info, warn};
use serde::Serialize;
use tokio::sync::{RwLock, broadcast};
use tokio_util::sync::CancellationToken;

use crate::{
    bundler,
    config::Config,
    emitter::{Emitter, RenderedBuild},
    error::{BuildError, BuildFailure, BuildResult},
    graph_builder::{BuildContext, BuildMode, GraphBuilder, TransformCache},
    manifest::Manifest,
    module_graph::{ModuleGraph, ModuleId},
};

pub use watcher::watch;

const EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DevState {
    Idle,
    Building,
    Serving,
    Rebuilding,
    Stopped,
}

/// Pushed to connected browsers and printed by `--json`
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum DevEvent {
    /// Output files changed; pages should reload
    Reload { changed: Vec<String> },
    /// Some entries failed and keep their previous files
    BuildFailed { errors: Vec<serde_json::Value> },
}

impl DevEvent {
    /// SSE event name
    pub fn name(&self) -> &'static str {
        match self {
            Self::Reload { .. } => "reload",
            Self::BuildFailed { .. } => "build_failed",
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_owned())
    }
}

/// Outcome of one build in a session
#[derive(Debug)]
pub struct RebuildOutcome {
    pub manifest: Manifest,
    pub failures: Vec<BuildFailure>,
    /// Output paths that are new or changed
    pub changed: Vec<String>,
}

/// Last good output, shared with the HTTP server
pub type ServedBuild = Arc<RwLock<RenderedBuild>>;

#[derive(Debug)]
pub struct DevSession {
    ctx: Arc<BuildContext>,
    state: DevState,
    graph: Option<ModuleGraph>,
    cache: TransformCache,
    rendered: RenderedBuild,
    served: ServedBuild,
    events: broadcast::Sender<DevEvent>,
    write_output: bool,
}

impl DevSession {
    /// `write_output` also writes every successful build to the output directory
    pub fn new(config: Config, write_output: bool) -> BuildResult<Self> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Ok(Self {
            ctx: Arc::new(BuildContext::new(config)?),
            state: DevState::Idle,
            graph: None,
            cache: TransformCache::default(),
            rendered: RenderedBuild::default(),
            served: ServedBuild::default(),
            events,
            write_output,
        })
    }

    pub fn state(&self) -> DevState {
        self.state
    }

    pub fn config(&self) -> &Config {
        &self.ctx.config
    }

    pub fn manifest(&self) -> &Manifest {
        &self.rendered.manifest
    }

    pub fn served(&self) -> ServedBuild {
        Arc::clone(&self.served)
    }

    pub fn events(&self) -> broadcast::Sender<DevEvent> {
        self.events.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DevEvent> {
        self.events.subscribe()
    }

    /// Initial full build
    pub async fn start(&mut self, cancel: CancellationToken) -> BuildResult<RebuildOutcome> {
        self.state = DevState::Building;
        info!("Starting dev session in {}", self.ctx.config.root.display());
        let outcome = self.run_build(cancel).await;
        self.settle(&outcome);
        outcome
    }

    /// Rebuild after `changed` files were modified, created or removed
    pub async fn rebuild(
        &mut self,
        changed: &[PathBuf],
        cancel: CancellationToken,
    ) -> BuildResult<RebuildOutcome> {
        self.state = DevState::Rebuilding;
        let stale = self.stale_modules(changed);
        debug!(
            "{} changed files invalidate {} cached modules",
            changed.len(),
            stale.len()
        );
        self.cache.invalidate(&stale);
        self.ctx.resolver.clear_cache();
        let outcome = self.run_build(cancel).await;
        self.settle(&outcome);
        outcome
    }

    pub fn stop(&mut self) {
        self.state = DevState::Stopped;
    }

    fn settle(&mut self, outcome: &BuildResult<RebuildOutcome>) {
        self.state = match (outcome, &self.graph) {
            (Err(_), None) => DevState::Idle,
            _ => DevState::Serving,
        };
    }

    /// Changed modules plus everything that imports them, directly or not
    fn stale_modules(&self, changed: &[PathBuf]) -> Vec<PathBuf> {
        let Some(graph) = &self.graph else {
            return changed.to_vec();
        };
        let seeds: Vec<ModuleId> = changed
            .iter()
            .filter_map(|path| graph.id_of(&canonical(path)))
            .collect();
        let mut stale: Vec<ModuleId> = graph.transitive_dependents(&seeds).into_iter().collect();
        stale.extend(seeds);
        stale.sort();
        stale.dedup();
        stale
            .into_iter()
            .map(|id| graph.module(id).path.clone())
            .collect()
    }

    async fn run_build(&mut self, cancel: CancellationToken) -> BuildResult<RebuildOutcome> {
        let built = GraphBuilder::new(Arc::clone(&self.ctx), BuildMode::Watch)
            .with_cache(self.cache.clone())
            .with_cancellation(cancel.clone())
            .build()
            .await?;

        let failed = built.failed_entries();
        let config = &self.ctx.config;
        let mut rendered = Emitter::new(config).render(&built.graph, &failed);
        rendered.manifest.carry_over(&self.rendered.manifest, &failed);
        let listed: Vec<String> = rendered
            .manifest
            .all_paths()
            .into_iter()
            .map(str::to_owned)
            .collect();
        for path in listed {
            if rendered.file(&path).is_none() {
                if let Some(previous) = self.rendered.file(&path) {
                    rendered.files.push(previous.clone());
                }
            }
        }
        bundler::attach_page(config, &mut rendered)?;

        if cancel.is_cancelled() {
            return Err(BuildError::Cancelled);
        }
        if self.write_output {
            Emitter::new(config).write(&rendered, &cancel).await?;
        }

        let changed = rendered.manifest.changed_paths(Some(&self.rendered.manifest));
        *self.served.write().await = rendered.clone();
        self.rendered = rendered;
        self.graph = Some(built.graph);
        self.cache = built.cache;

        for failure in &built.failures {
            warn!("{failure}");
        }
        if !built.failures.is_empty() {
            let errors = built.failures.iter().map(BuildFailure::to_json).collect();
            let _ = self.events.send(DevEvent::BuildFailed { errors });
        }
        if !changed.is_empty() {
            let _ = self.events.send(DevEvent::Reload {
                changed: changed.clone(),
            });
        }
        info!(
            "Serving {} entries ({} failed, {} files changed)",
            self.rendered.manifest.entries.len(),
            failed.len(),
            changed.len()
        );
        Ok(RebuildOutcome {
            manifest: self.rendered.manifest.clone(),
            failures: built.failures,
            changed,
        })
    }
}

fn canonical(path: &Path) -> PathBuf {
    path.canonicalize().unwrap_or_else(|_| path.to_path_buf())
}
