//! Module dependency graph
//!
//! Nodes are modules identified by their resolved path; edges run from a
//! dependency to its dependent, so a topological sort yields dependencies first.

use std::path::{Path, PathBuf};

use anyhow::{Result, anyhow};
use indexmap::{IndexMap, IndexSet};
use log::debug;
use petgraph::{
    Direction,
    algo::{is_cyclic_directed, tarjan_scc, toposort},
    graph::{DiGraph, NodeIndex},
};
use rustc_hash::{FxHashMap, FxHashSet};

use crate::{error::CycleWarning, transform::TransformOutput};

/// Dense module identifier, assigned in discovery order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModuleId(u32);

impl ModuleId {
    pub fn new(id: u32) -> Self {
        Self(id)
    }

    /// Returns the underlying u32 value of the ModuleId
    #[inline]
    pub const fn as_u32(&self) -> u32 {
        self.0
    }

    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// A module discovered during the walk
#[derive(Debug, Clone)]
pub struct Module {
    pub id: ModuleId,
    /// Canonical absolute path
    pub path: PathBuf,
    /// Project-relative, forward-slashed path used as the runtime module key
    pub key: String,
    /// SHA-256 of the raw content
    pub raw_hash: String,
    pub parse_skipped: bool,
    /// Final content and sub-resources; `None` until transformed or after a failure
    pub output: Option<TransformOutput>,
    /// `(specifier, target)` pairs in the order the specifiers appear
    pub dependencies: Vec<(String, ModuleId)>,
}

impl Module {
    pub fn applied_steps(&self) -> &[String] {
        self.output.as_ref().map_or(&[], |o| o.applied.as_slice())
    }
}

#[derive(Debug, Default)]
pub struct ModuleGraph {
    modules: Vec<Module>,
    paths: FxHashMap<PathBuf, ModuleId>,
    /// Entry name -> root modules, in configuration order
    entries: IndexMap<String, Vec<ModuleId>>,
    graph: DiGraph<ModuleId, ()>,
    node_indices: FxHashMap<ModuleId, NodeIndex>,
}

impl ModuleGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a module by path, returning the existing id when already known
    pub fn add_module(&mut self, path: PathBuf, key: String) -> ModuleId {
        if let Some(&id) = self.paths.get(&path) {
            return id;
        }
        let id = ModuleId::new(self.modules.len() as u32);
        let node = self.graph.add_node(id);
        self.node_indices.insert(id, node);
        self.paths.insert(path.clone(), id);
        debug!("Registered module {key} as {id:?}");
        self.modules.push(Module {
            id,
            path,
            key,
            raw_hash: String::new(),
            parse_skipped: false,
            output: None,
            dependencies: Vec::new(),
        });
        id
    }

    pub fn add_entry(&mut self, name: &str, root: ModuleId) {
        let roots = self.entries.entry(name.to_owned()).or_default();
        if !roots.contains(&root) {
            roots.push(root);
        }
    }

    /// Record that `from` requires `to` through `specifier`.
    ///
    /// One edge per pair; every specifier is kept on the module for linking.
    pub fn add_dependency(&mut self, from: ModuleId, specifier: String, to: ModuleId) {
        if let (Some(&from_idx), Some(&to_idx)) =
            (self.node_indices.get(&from), self.node_indices.get(&to))
        {
            if !self.graph.contains_edge(to_idx, from_idx) {
                self.graph.add_edge(to_idx, from_idx, ());
            }
            let module = &mut self.modules[from.index()];
            if !module.dependencies.iter().any(|(s, _)| *s == specifier) {
                module.dependencies.push((specifier, to));
            }
        }
    }

    pub fn module(&self, id: ModuleId) -> &Module {
        &self.modules[id.index()]
    }

    pub fn module_mut(&mut self, id: ModuleId) -> &mut Module {
        &mut self.modules[id.index()]
    }

    pub fn modules(&self) -> &[Module] {
        &self.modules
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    pub fn id_of(&self, path: &Path) -> Option<ModuleId> {
        self.paths.get(path).copied()
    }

    pub fn entries(&self) -> &IndexMap<String, Vec<ModuleId>> {
        &self.entries
    }

    /// Get topologically sorted modules (dependencies first)
    pub fn topological_sort(&self) -> Result<Vec<ModuleId>> {
        toposort(&self.graph, None)
            .map(|nodes| nodes.into_iter().map(|n| self.graph[n]).collect())
            .map_err(|_| anyhow!("Circular dependency detected"))
    }

    pub fn has_cycles(&self) -> bool {
        is_cyclic_directed(&self.graph)
    }

    /// Modules that directly depend on `id`
    pub fn get_dependents(&self, id: ModuleId) -> Vec<ModuleId> {
        self.neighbors(id, Direction::Outgoing)
    }

    /// Modules `id` directly depends on
    pub fn get_dependencies(&self, id: ModuleId) -> Vec<ModuleId> {
        self.neighbors(id, Direction::Incoming)
    }

    fn neighbors(&self, id: ModuleId, direction: Direction) -> Vec<ModuleId> {
        let Some(&node) = self.node_indices.get(&id) else {
            return Vec::new();
        };
        let mut ids: Vec<ModuleId> = self
            .graph
            .neighbors_directed(node, direction)
            .map(|idx| self.graph[idx])
            .collect();
        ids.sort_unstable();
        ids
    }

    /// `seeds` plus every module that transitively imports one of them
    pub fn transitive_dependents(&self, seeds: &[ModuleId]) -> FxHashSet<ModuleId> {
        let mut seen: FxHashSet<ModuleId> = seeds.iter().copied().collect();
        let mut stack: Vec<ModuleId> = seeds.to_vec();
        while let Some(id) = stack.pop() {
            for dependent in self.get_dependents(id) {
                if seen.insert(dependent) {
                    stack.push(dependent);
                }
            }
        }
        seen
    }

    /// Modules reachable from `roots`, roots included
    pub fn reachable_from(&self, roots: &[ModuleId]) -> FxHashSet<ModuleId> {
        let mut seen: FxHashSet<ModuleId> = roots.iter().copied().collect();
        let mut stack: Vec<ModuleId> = roots.to_vec();
        while let Some(id) = stack.pop() {
            for &(_, dep) in &self.modules[id.index()].dependencies {
                if seen.insert(dep) {
                    stack.push(dep);
                }
            }
        }
        seen
    }

    /// Names of the entries whose bundles contain `id`
    pub fn entries_reaching(&self, id: ModuleId) -> Vec<String> {
        let importers = self.transitive_dependents(&[id]);
        self.entries
            .iter()
            .filter(|(_, roots)| roots.iter().any(|root| importers.contains(root)))
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Bundle order for an entry: depth-first post-order from its roots, visiting
    /// dependencies in specifier order. First discovery breaks cycles.
    pub fn bundle_order(&self, roots: &[ModuleId]) -> Vec<ModuleId> {
        let mut visited = FxHashSet::default();
        let mut order = Vec::new();
        for &root in roots {
            if !visited.insert(root) {
                continue;
            }
            // Explicit stack of (module, next dependency index) to keep deep graphs off the call stack
            let mut stack = vec![(root, 0usize)];
            while let Some((id, next)) = stack.last_mut() {
                let deps = &self.modules[id.index()].dependencies;
                if let Some(&(_, dep)) = deps.get(*next) {
                    *next += 1;
                    if visited.insert(dep) {
                        stack.push((dep, 0));
                    }
                } else {
                    order.push(*id);
                    stack.pop();
                }
            }
        }
        order
    }

    /// Strongly connected components that form cycles, in discovery order
    pub fn find_cycles(&self) -> Vec<Vec<ModuleId>> {
        let mut components: Vec<Vec<ModuleId>> = tarjan_scc(&self.graph)
            .into_iter()
            .filter(|component| {
                component.len() > 1
                    || component
                        .first()
                        .is_some_and(|&n| self.graph.contains_edge(n, n))
            })
            .map(|component| {
                let mut ids: Vec<ModuleId> = component.into_iter().map(|n| self.graph[n]).collect();
                ids.sort_unstable();
                ids
            })
            .collect();
        components.sort();
        components
    }

    pub fn cycle_warnings(&self) -> Vec<CycleWarning> {
        self.find_cycles()
            .into_iter()
            .map(|ids| CycleWarning {
                modules: ids.iter().map(|&id| self.module(id).path.clone()).collect(),
            })
            .collect()
    }

    /// Modules reachable from two or more of the given root sets
    pub fn shared_modules<'a>(
        &self,
        root_sets: impl IntoIterator<Item = &'a [ModuleId]>,
    ) -> IndexSet<ModuleId> {
        let mut seen_by: FxHashMap<ModuleId, usize> = FxHashMap::default();
        for roots in root_sets {
            for id in self.reachable_from(roots) {
                *seen_by.entry(id).or_default() += 1;
            }
        }
        let mut shared: Vec<ModuleId> = seen_by
            .into_iter()
            .filter(|&(_, count)| count > 1)
            .map(|(id, _)| id)
            .collect();
        shared.sort_unstable();
        shared.into_iter().collect()
    }
}
