// SPDX-FileCopyrightText: Copyright © 2020-2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Conversion of the resolver's raw tree into a scheduling-ready graph
//!
//! Four passes: reverse the tree into doubly linked edges, contract nodes
//! which aren't scheduled for install, break cycles against the resolver's
//! install order, then fill transitive provides. Traversals use explicit
//! stacks; input graphs can reach tens of thousands of packages.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Instant;

use itertools::Itertools;
use log::info;

use crate::{Action, Catalog, DepGraph, DepKind, Node, PackageId, RawNode, RawTree};

/// Install-time hook phases which may inspect dependent packages
const HOOK_PHASES: &[&str] = &["setup", "preinst", "postinst"];

/// Builds a [`DepGraph`] from the resolver's raw tree, install-order list
/// and package catalog
pub struct Builder<'a> {
    tree: &'a RawTree,
    order: &'a [PackageId],
    catalog: &'a Catalog,
    quiet: bool,
}

impl<'a> Builder<'a> {
    pub fn new(tree: &'a RawTree, order: &'a [PackageId], catalog: &'a Catalog) -> Self {
        Self {
            tree,
            order,
            catalog,
            quiet: false,
        }
    }

    /// Suppress cycle-break reporting
    pub fn quiet(self, quiet: bool) -> Self {
        Self { quiet, ..self }
    }

    /// Run all passes and return the sanitized graph
    pub fn build(self) -> DepGraph {
        let idx = self
            .order
            .iter()
            .enumerate()
            .map(|(i, id)| (id.clone(), i))
            .collect::<HashMap<_, _>>();

        let mut graph = self.reverse(&idx);
        prune(&mut graph, &idx);
        self.sanitize(&mut graph);
        fill_tprovides(&mut graph);
        graph
    }

    /// Reverse the tree of package -> requirements into a digraph of
    /// buildable packages -> packages they unblock
    fn reverse(&self, idx: &HashMap<PackageId, usize>) -> DepGraph {
        let mut graph = DepGraph::new();
        let mut stack: Vec<(PackageId, &BTreeMap<PackageId, RawNode>)> = vec![];

        for (pkg, entry) in self.tree {
            self.ensure_node(&mut graph, pkg, entry.action, idx);
            stack.push((pkg.clone(), &entry.deps));
        }

        while let Some((parent, deps)) = stack.pop() {
            for (dep, item) in deps {
                // An uninstall happens automatically when its replacement
                // merges; depend on the replacement instead
                let (target, action) = match (item.action, &item.replacement) {
                    (Action::Uninstall, Some(replacement)) => {
                        (replacement.clone(), Action::Merge)
                    }
                    _ => (dep.clone(), item.action),
                };

                self.ensure_node(&mut graph, &target, action, idx);

                // Only blockers and buildtime/runtime dependencies
                // constrain install order
                if item.kinds.iter().any(|kind| kind.ordered()) {
                    let kinds = item.kinds.iter().join("/");
                    graph
                        .get_mut(&parent)
                        .expect("parent node exists")
                        .needs
                        .insert(target.clone(), kinds);
                    graph
                        .get_mut(&target)
                        .expect("dep node exists")
                        .provides
                        .insert(parent.clone());
                }

                // A blocker means files may move between the two packages,
                // which must not happen while either installs
                if item.kinds.contains(&DepKind::Blocker) {
                    graph.get_mut(&parent).expect("parent node exists").nodeps = false;
                }

                stack.push((target, &item.deps));
            }
        }

        graph
    }

    /// Create the node for `id` unless already present. The first
    /// encountered action wins.
    fn ensure_node(
        &self,
        graph: &mut DepGraph,
        id: &PackageId,
        action: Action,
        idx: &HashMap<PackageId, usize>,
    ) {
        if graph.contains(id) {
            return;
        }

        let mut node = Node::new(action);
        if let Some(i) = idx.get(id) {
            node.idx = *i;
        }

        if let Some(facts) = self.catalog.get(id) {
            if facts.binary {
                node.binary = true;
                // No hooks touch dependent packages, so this prebuilt can
                // be merged before its needs are satisfied
                if !HOOK_PHASES.iter().any(|phase| facts.hook_phases.contains(*phase)) {
                    node.nodeps = true;
                }
            }
        }

        graph.insert(id.clone(), node);
    }

    /// Break cycles until none remain. Edges which go against the
    /// resolver's install order are soft: the resolver's ordering is
    /// authoritative, so deleting them keeps our merge order aligned
    /// with it.
    fn sanitize(&self, graph: &mut DepGraph) {
        let start = Instant::now();

        let mut cycles = find_cycles(graph);
        while !cycles.is_empty() {
            for (dep, basedeps) in &cycles {
                for (basedep, cycle) in basedeps {
                    let dep_idx = graph.get(dep).map_or(usize::MAX, |n| n.idx);
                    let base_idx = graph.get(basedep).map_or(usize::MAX, |n| n.idx);
                    if base_idx >= dep_idx {
                        if !self.quiet {
                            report_cycle_break(graph, basedep, dep, cycle);
                        }
                        graph.remove_edge(dep, basedep);
                    }
                }
            }
            cycles = find_cycles(graph);
        }

        let elapsed = start.elapsed().as_secs_f64();
        if elapsed >= 0.1 && !self.quiet {
            info!(
                "Tree sanitized in {}m{:.1}s",
                (elapsed / 60.0) as u64,
                elapsed % 60.0
            );
        }
    }
}

/// Cyclic packages mapped to the needs-edges continuing a cycle, each
/// with an example traversal for reporting
type Cycles = BTreeMap<PackageId, BTreeMap<PackageId, Vec<PackageId>>>;

struct Frame {
    pkg: PackageId,
    deps: std::vec::IntoIter<PackageId>,
    /// Whether `pkg` already had recorded cycles when entered
    had_cycles: bool,
}

fn frame(graph: &DepGraph, cycles: &Cycles, pkg: PackageId) -> Frame {
    let mut deps = graph
        .get(&pkg)
        .map(|n| n.needs.keys().cloned().collect::<Vec<_>>())
        .unwrap_or_default();
    deps.sort();

    Frame {
        had_cycles: cycles.contains_key(&pkg),
        deps: deps.into_iter(),
        pkg,
    }
}

/// Find cycles via iterative depth-first traversal of `needs` edges
fn find_cycles(graph: &DepGraph) -> Cycles {
    let mut cycles = Cycles::new();
    let mut resolved = HashSet::new();
    let mut unresolved: Vec<PackageId> = vec![];

    // A package is settled once resolved with no cycles recorded against it
    let settled = |pkg: &PackageId, cycles: &Cycles, resolved: &HashSet<PackageId>| {
        resolved.contains(pkg) && cycles.get(pkg).map_or(true, |m| m.is_empty())
    };

    for start in graph.sorted_keys() {
        if settled(&start, &cycles, &resolved) {
            continue;
        }

        unresolved.push(start.clone());
        let mut stack = vec![frame(graph, &cycles, start)];

        while !stack.is_empty() {
            let (next, pkg, had_cycles) = {
                let top = stack.last_mut().expect("non-empty stack");
                (top.deps.next(), top.pkg.clone(), top.had_cycles)
            };

            let Some(dep) = next else {
                stack.pop();
                unresolved.pop();
                resolved.insert(pkg);
                continue;
            };

            if let Some(pos) = unresolved.iter().position(|p| *p == dep) {
                // Walked back onto the traversal path: record the minimal
                // cyclic path for every edge along it
                let mut cycle = unresolved[pos..].to_vec();
                cycle.push(dep);
                for pair in cycle.windows(2) {
                    cycles
                        .entry(pair[0].clone())
                        .or_default()
                        .entry(pair[1].clone())
                        .or_insert_with(|| cycle.clone());
                }
            } else {
                let known_edge =
                    had_cycles && cycles.get(&pkg).is_some_and(|m| m.contains_key(&dep));
                if !known_edge && !settled(&dep, &cycles, &resolved) {
                    unresolved.push(dep.clone());
                    let next_frame = frame(graph, &cycles, dep);
                    stack.push(next_frame);
                }
            }
        }
    }

    cycles
}

/// Report a cycle about to be broken, where `dep` needs `basedep`
fn report_cycle_break(graph: &DepGraph, basedep: &PackageId, dep: &PackageId, cycle: &[PackageId]) {
    let kinds = |from: &PackageId, to: &PackageId| {
        graph
            .get(from)
            .and_then(|n| n.needs.get(to).cloned())
            .unwrap_or_else(|| "deleted".to_owned())
    };

    // The two packages already depend on each other, so the blocker's
    // ordering purpose is preserved by not running them concurrently;
    // dropping the edge needs no warning
    let info = kinds(dep, basedep);
    if info == "blocker" {
        return;
    }

    info!("Breaking {dep} -> {basedep} ({info})");

    for pair in cycle.windows(2) {
        let mut info = kinds(&pair[0], &pair[1]);
        if pair[0] == *dep && pair[1] == *basedep {
            info.push_str(", deleting");
        }
        info!("  {} -> {} ({info})", pair[0], pair[1]);
    }
}

/// Contract nodes which aren't on the install-order list, wiring their
/// needs and provides through to the remaining neighbours
fn prune(graph: &mut DepGraph, idx: &HashMap<PackageId, usize>) {
    let mut remove = graph
        .keys()
        .filter(|id| !idx.contains_key(*id))
        .cloned()
        .collect::<Vec<_>>();
    remove.sort();

    for pkg in remove {
        let Some(node) = graph.remove(&pkg) else {
            continue;
        };

        for dep in node.needs.keys() {
            let provides = &mut graph.get_mut(dep).expect("edge symmetry").provides;
            provides.extend(node.provides.iter().cloned());
            provides.remove(&pkg);
            provides.remove(dep);
        }

        for target in &node.provides {
            let needs = &mut graph.get_mut(target).expect("edge symmetry").needs;
            for (dep, kinds) in &node.needs {
                needs.insert(dep.clone(), kinds.clone());
            }
            needs.remove(&pkg);
            needs.remove(target);
        }
    }
}

/// Fill each node's transitive provides set. Assumes an acyclic graph.
fn fill_tprovides(graph: &mut DepGraph) {
    enum Visit {
        Enter(PackageId),
        Exit(PackageId),
    }

    let mut seen = HashSet::new();

    for start in graph.sorted_keys() {
        let mut stack = vec![Visit::Enter(start)];

        while let Some(visit) = stack.pop() {
            match visit {
                Visit::Enter(pkg) => {
                    if !seen.insert(pkg.clone()) {
                        continue;
                    }
                    let provides = graph
                        .get(&pkg)
                        .map(|n| n.provides.iter().cloned().collect::<Vec<_>>())
                        .unwrap_or_default();
                    stack.push(Visit::Exit(pkg));
                    stack.extend(provides.into_iter().map(Visit::Enter));
                }
                Visit::Exit(pkg) => {
                    let node = graph.get(&pkg).expect("node exists");
                    let provides = node.provides.clone();
                    let mut tprovides = provides.clone();
                    for dep in &provides {
                        if let Some(dep_node) = graph.get(dep) {
                            tprovides.extend(dep_node.tprovides.iter().cloned());
                        }
                    }
                    graph.get_mut(&pkg).expect("node exists").tprovides = tprovides;
                }
            }
        }
    }
}
