//! Dependency graph builder
//!
//! Walks the module graph breadth-first from the configured entries. The
//! modules of one layer are read, matched and transformed concurrently on
//! spawned tasks, bounded by a semaphore. This coordinating task alone owns the
//! visited set and the graph, and integrates each layer in id order, so module
//! ids, edges and bundle contents do not depend on task scheduling.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use cow_utils::CowUtils;
use log::{debug, info, trace, warn};
use rustc_hash::FxHashMap;
use tokio::{sync::Semaphore, task::JoinSet};
use tokio_util::sync::CancellationToken;

use crate::{
    config::Config,
    deps::extract_dependencies,
    error::{BuildError, BuildFailure, BuildResult, CycleWarning},
    filename::content_hash,
    module_graph::{ModuleGraph, ModuleId},
    resolver::{PathResolver, ResolvedRequest},
    rules::RuleSet,
    transform::{self, ContentKind, StepDescriptor, TransformContext, TransformOutput},
};

/// Whether the first failure ends the walk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildMode {
    /// Abort after the layer where the first failure occurred
    OneShot,
    /// Walk everything reachable and collect every failure
    Watch,
}

/// Immutable inputs shared by every task of a build
#[derive(Debug)]
pub struct BuildContext {
    pub config: Config,
    pub rules: RuleSet,
    pub resolver: PathResolver,
}

impl BuildContext {
    pub fn new(config: Config) -> BuildResult<Self> {
        let rules = RuleSet::from_config(&config.module)?;
        let resolver = PathResolver::new(&config.resolve, &config.root);
        Ok(Self {
            config,
            rules,
            resolver,
        })
    }

    /// Stable runtime key of a module: its project-relative, forward-slashed path
    pub fn module_key(&self, path: &Path) -> String {
        let relative = path.strip_prefix(&self.config.root).unwrap_or(path);
        relative.to_string_lossy().cow_replace('\\', "/").into_owned()
    }
}

/// A module's transform result kept across builds
#[derive(Debug, Clone)]
pub struct CachedModule {
    raw_hash: String,
    steps: Vec<StepDescriptor>,
    parse_skipped: bool,
    output: TransformOutput,
    specifiers: Vec<String>,
}

/// Transform results of the previous build, keyed by module path
#[derive(Debug, Clone, Default)]
pub struct TransformCache {
    modules: FxHashMap<PathBuf, CachedModule>,
}

impl TransformCache {
    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    /// Forget the given modules so they are transformed again
    pub fn invalidate<'a>(&mut self, paths: impl IntoIterator<Item = &'a PathBuf>) {
        for path in paths {
            self.modules.remove(path);
        }
    }
}

/// Result of a graph walk
#[derive(Debug)]
pub struct GraphBuildOutput {
    pub graph: ModuleGraph,
    /// Failures in module discovery order, each naming the entries it breaks
    pub failures: Vec<BuildFailure>,
    /// Transform results of every successfully processed module
    pub cache: TransformCache,
    pub cycles: Vec<CycleWarning>,
}

impl GraphBuildOutput {
    /// Names of the entries with at least one failure
    pub fn failed_entries(&self) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        for failure in &self.failures {
            for entry in &failure.entries {
                if !names.contains(entry) {
                    names.push(entry.clone());
                }
            }
        }
        names
    }
}

/// A failure before entry attribution: failing module (if any), known entries, error
type PendingFailure = (Option<ModuleId>, Vec<String>, BuildError);

/// A module waiting to be processed
#[derive(Debug)]
struct Pending {
    id: ModuleId,
    request: ResolvedRequest,
    key: String,
    cached: Option<CachedModule>,
}

/// What a task hands back to the coordinator
#[derive(Debug)]
struct Processed {
    raw_hash: String,
    steps: Vec<StepDescriptor>,
    parse_skipped: bool,
    output: TransformOutput,
    specifiers: Vec<String>,
    resolved: Vec<BuildResult<ResolvedRequest>>,
}

#[derive(Debug)]
pub struct GraphBuilder {
    ctx: Arc<BuildContext>,
    mode: BuildMode,
    cache: TransformCache,
    cancel: CancellationToken,
}

impl GraphBuilder {
    pub fn new(ctx: Arc<BuildContext>, mode: BuildMode) -> Self {
        Self {
            ctx,
            mode,
            cache: TransformCache::default(),
            cancel: CancellationToken::new(),
        }
    }

    /// Reuse transform results of a previous build
    #[must_use]
    pub fn with_cache(mut self, cache: TransformCache) -> Self {
        self.cache = cache;
        self
    }

    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Walk the graph from every configured entry.
    ///
    /// Module failures are reported in the output; only cancellation is an error.
    pub async fn build(self) -> BuildResult<GraphBuildOutput> {
        info!(
            "Building module graph for {} entries",
            self.ctx.config.entries.len()
        );
        let mut graph = ModuleGraph::new();
        let mut failures: Vec<PendingFailure> = Vec::new();
        let mut next_cache = TransformCache::default();
        let semaphore = Arc::new(Semaphore::new(self.ctx.config.concurrency()));

        let mut layer = self.seed_entries(&mut graph, &mut failures);
        let mut depth = 0;
        while !layer.is_empty() {
            if self.cancel.is_cancelled() {
                return Err(BuildError::Cancelled);
            }
            if self.mode == BuildMode::OneShot && !failures.is_empty() {
                debug!("Stopping the walk after the first failure");
                break;
            }
            debug!("Processing layer {depth} with {} modules", layer.len());
            let results = self.run_layer(layer, &semaphore).await?;
            layer = self.integrate(results, &mut graph, &mut failures, &mut next_cache);
            depth += 1;
        }

        let cycles = graph.cycle_warnings();
        for cycle in &cycles {
            warn!("{cycle}");
        }
        let failures = failures
            .into_iter()
            .map(|(id, entries, error)| {
                let entries = id.map_or(entries, |id| graph.entries_reaching(id));
                BuildFailure::new(entries, error)
            })
            .collect();
        info!("Module graph has {} modules", graph.len());
        Ok(GraphBuildOutput {
            graph,
            failures,
            cache: next_cache,
            cycles,
        })
    }

    fn seed_entries(
        &self,
        graph: &mut ModuleGraph,
        failures: &mut Vec<PendingFailure>,
    ) -> Vec<Pending> {
        let root = &self.ctx.config.root;
        let mut layer = Vec::new();
        for (name, specifiers) in &self.ctx.config.entries {
            for specifier in specifiers {
                match self.ctx.resolver.resolve(specifier, root) {
                    Ok(request) => {
                        let path = request.path.clone();
                        if let Some(pending) = self.discover(graph, request) {
                            layer.push(pending);
                        }
                        if let Some(id) = graph.id_of(&path) {
                            graph.add_entry(name, id);
                        }
                    }
                    Err(error) => failures.push((None, vec![name.clone()], error)),
                }
            }
        }
        layer
    }

    /// Register a resolved module; returns work for it when it is new
    fn discover(&self, graph: &mut ModuleGraph, request: ResolvedRequest) -> Option<Pending> {
        if graph.id_of(&request.path).is_some() {
            return None;
        }
        let key = self.ctx.module_key(&request.path);
        let id = graph.add_module(request.path.clone(), key.clone());
        let cached = self.cache.modules.get(&request.path).cloned();
        Some(Pending {
            id,
            request,
            key,
            cached,
        })
    }

    async fn run_layer(
        &self,
        layer: Vec<Pending>,
        semaphore: &Arc<Semaphore>,
    ) -> BuildResult<Vec<(ModuleId, BuildResult<Processed>)>> {
        let mut tasks = JoinSet::new();
        for pending in layer {
            let ctx = Arc::clone(&self.ctx);
            let semaphore = Arc::clone(semaphore);
            tasks.spawn(async move {
                let result = match semaphore.acquire_owned().await {
                    Ok(_permit) => process(&ctx, &pending).await,
                    Err(_) => Err(BuildError::Cancelled),
                };
                (pending.id, result)
            });
        }

        let mut results = Vec::with_capacity(tasks.len());
        loop {
            let joined = tokio::select! {
                biased;
                () = self.cancel.cancelled() => {
                    tasks.abort_all();
                    return Err(BuildError::Cancelled);
                }
                joined = tasks.join_next() => joined,
            };
            match joined {
                Some(Ok(result)) => results.push(result),
                Some(Err(e)) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
                Some(Err(_)) => return Err(BuildError::Cancelled),
                None => break,
            }
        }
        results.sort_by_key(|(id, _)| *id);
        Ok(results)
    }

    /// Fold a finished layer into the graph and collect the next frontier
    fn integrate(
        &self,
        results: Vec<(ModuleId, BuildResult<Processed>)>,
        graph: &mut ModuleGraph,
        failures: &mut Vec<PendingFailure>,
        next_cache: &mut TransformCache,
    ) -> Vec<Pending> {
        let mut next_layer = Vec::new();
        for (id, result) in results {
            let processed = match result {
                Ok(processed) => processed,
                Err(error) => {
                    failures.push((Some(id), Vec::new(), error));
                    continue;
                }
            };
            let path = graph.module(id).path.clone();
            for (specifier, resolved) in processed.specifiers.iter().zip(processed.resolved) {
                match resolved {
                    Ok(request) => {
                        let target = request.path.clone();
                        if let Some(pending) = self.discover(graph, request) {
                            next_layer.push(pending);
                        }
                        if let Some(to) = graph.id_of(&target) {
                            graph.add_dependency(id, specifier.clone(), to);
                        }
                    }
                    Err(error) => failures.push((Some(id), Vec::new(), error)),
                }
            }

            next_cache.modules.insert(
                path,
                CachedModule {
                    raw_hash: processed.raw_hash.clone(),
                    steps: processed.steps,
                    parse_skipped: processed.parse_skipped,
                    output: processed.output.clone(),
                    specifiers: processed.specifiers,
                },
            );
            let module = graph.module_mut(id);
            module.raw_hash = processed.raw_hash;
            module.parse_skipped = processed.parse_skipped;
            module.output = Some(processed.output);
        }
        next_layer
    }
}

/// Read, match, transform and scan one module, then resolve what it requires
async fn process(ctx: &BuildContext, pending: &Pending) -> BuildResult<Processed> {
    let path = &pending.request.path;
    let raw = tokio::fs::read(path)
        .await
        .map_err(|e| BuildError::io(path, e))?;
    let raw_hash = content_hash(&raw);
    let matched = ctx.rules.match_request(&pending.request);

    let reusable = pending.cached.as_ref().filter(|cached| {
        cached.raw_hash == raw_hash
            && cached.parse_skipped == matched.parse_skipped
            && cached.steps == matched.steps
            && matched.steps.iter().all(StepDescriptor::cacheable)
    });
    let (output, specifiers) = if let Some(cached) = reusable {
        trace!("Reusing cached transform of {}", pending.key);
        (cached.output.clone(), cached.specifiers.clone())
    } else {
        let output_config = &ctx.config.output;
        let tctx = TransformContext {
            path,
            module_key: &pending.key,
            root: &ctx.config.root,
            public_path: &output_config.public_path,
            asset_template: &output_config.asset_filename,
        };
        let output = if matched.parse_skipped {
            transform::passthrough(raw, &tctx)
        } else {
            transform::apply(raw, &matched.steps, &tctx).await?
        };
        let specifiers = if !matched.parse_skipped && output.kind == ContentKind::Script {
            extract_dependencies(&String::from_utf8_lossy(&output.content))
        } else {
            Vec::new()
        };
        (output, specifiers)
    };

    let from_dir = path.parent().unwrap_or(&ctx.config.root);
    let resolved = specifiers
        .iter()
        .map(|specifier| {
            ctx.resolver
                .resolve(specifier, from_dir)
                .map_err(|e| e.imported_by(path))
        })
        .collect();
    Ok(Processed {
        raw_hash,
        steps: matched.steps,
        parse_skipped: matched.parse_skipped,
        output,
        specifiers,
        resolved,
    })
}
