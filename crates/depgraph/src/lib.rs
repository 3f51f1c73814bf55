// SPDX-FileCopyrightText: Copyright © 2020-2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Doubly linked dependency graph used to schedule parallel installs
//!
//! The external resolver hands us a raw tree of package requirements plus
//! its intended install order. [`Builder`] turns that into a [`DepGraph`]:
//! forward `needs` edges, reverse `provides` edges, cycles broken against
//! the resolver's ordering, and transitive provides counts for priority.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use self::builder::Builder;

pub mod builder;

/// Opaque identifier for a package version, e.g. `sys-apps/baselayout-2.2-r1`
///
/// Equality and ordering are bytewise.
#[derive(
    Debug,
    Clone,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    derive_more::Display,
    derive_more::From,
    derive_more::Into,
    derive_more::AsRef,
    Serialize,
    Deserialize,
)]
pub struct PackageId(String);

impl PackageId {
    /// The name-version part of the identifier, without the category
    pub fn short_name(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or(&self.0)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for PackageId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// What the driver will do with a node
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    strum::Display,
    strum::EnumString,
    Serialize,
    Deserialize,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Action {
    /// Install the package
    Merge,
    /// Keep the node for graph linkage, skip execution
    Nomerge,
    /// Remove the package; folded into its replacement merge when one
    /// exists, otherwise dispatched as a removal
    Uninstall,
}

/// Type of a dependency edge as reported by the resolver
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    strum::Display,
    strum::EnumString,
    Serialize,
    Deserialize,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum DepKind {
    Blocker,
    Buildtime,
    Runtime,
    RuntimePost,
    Ignored,
    Optional,
}

impl DepKind {
    /// Whether this kind constrains install ordering. Ignored, optional
    /// and post-install dependencies do not.
    pub fn ordered(self) -> bool {
        matches!(self, Self::Blocker | Self::Buildtime | Self::Runtime)
    }
}

/// One entry in the resolver's raw dependency tree
///
/// The same shape is used for root packages and nested dependencies;
/// `kinds` and `replacement` are only meaningful on dependency entries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawNode {
    pub action: Action,
    #[serde(default)]
    pub kinds: Vec<DepKind>,
    /// Merge replacing this uninstall, when the resolver found one
    #[serde(default)]
    pub replacement: Option<PackageId>,
    #[serde(default)]
    pub deps: BTreeMap<PackageId, RawNode>,
}

/// Raw dependency tree as produced by the external resolver
pub type RawTree = BTreeMap<PackageId, RawNode>;

/// Per-package facts reported by the package catalog
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PackageFacts {
    /// Package is a prebuilt binary
    #[serde(default)]
    pub binary: bool,
    /// Install-time hook phases the package defines
    #[serde(default)]
    pub hook_phases: BTreeSet<String>,
}

/// Catalog lookup for [`PackageFacts`]
pub type Catalog = BTreeMap<PackageId, PackageFacts>;

/// A single package in the working graph
#[derive(Debug, Clone)]
pub struct Node {
    pub action: Action,
    /// Unmet dependencies, mapped to their joined edge kinds
    pub needs: HashMap<PackageId, String>,
    /// Packages directly depending on this node
    pub provides: HashSet<PackageId>,
    /// Transitive closure of `provides`, used as a priority term
    pub tprovides: HashSet<PackageId>,
    /// Install-order hint from the resolver; lower merges earlier
    pub idx: usize,
    pub binary: bool,
    /// Node may be merged before its needs are satisfied
    pub nodeps: bool,
}

impl Node {
    pub fn new(action: Action) -> Self {
        Self {
            action,
            needs: HashMap::new(),
            provides: HashSet::new(),
            tprovides: HashSet::new(),
            idx: usize::MAX,
            binary: false,
            nodeps: false,
        }
    }
}

/// Mapping of [`PackageId`] to [`Node`] with edge-symmetric mutation
///
/// For every edge `a ∈ needs(b)` the graph also holds `b ∈ provides(a)`.
/// After [`Builder::build`] the graph is acyclic.
#[derive(Debug, Clone, Default)]
pub struct DepGraph(HashMap<PackageId, Node>);

impl DepGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, id: &PackageId) -> bool {
        self.0.contains_key(id)
    }

    pub fn get(&self, id: &PackageId) -> Option<&Node> {
        self.0.get(id)
    }

    pub fn get_mut(&mut self, id: &PackageId) -> Option<&mut Node> {
        self.0.get_mut(id)
    }

    pub fn insert(&mut self, id: PackageId, node: Node) {
        self.0.insert(id, node);
    }

    pub fn remove(&mut self, id: &PackageId) -> Option<Node> {
        self.0.remove(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&PackageId, &Node)> {
        self.0.iter()
    }

    pub fn keys(&self) -> impl Iterator<Item = &PackageId> {
        self.0.keys()
    }

    /// Keys in bytewise order, for deterministic traversal
    pub fn sorted_keys(&self) -> Vec<PackageId> {
        let mut keys = self.0.keys().cloned().collect::<Vec<_>>();
        keys.sort();
        keys
    }

    /// Delete the edge `from -> to`, maintaining edge symmetry
    pub fn remove_edge(&mut self, from: &PackageId, to: &PackageId) {
        if let Some(node) = self.0.get_mut(from) {
            node.needs.remove(to);
        }
        if let Some(node) = self.0.get_mut(to) {
            node.provides.remove(from);
        }
    }

    /// Linearize the graph into an install order by repeatedly releasing
    /// nodes whose needs are satisfied, preferring the resolver's order.
    ///
    /// Fails if cycles survived sanitizing; the residual graph is returned
    /// for diagnosis.
    pub fn install_plan(&self) -> Result<Vec<PackageId>, Error> {
        use std::cmp::Reverse;
        use std::collections::BinaryHeap;

        let mut work = self.clone();
        let mut open = work
            .iter()
            .filter(|(_, node)| node.needs.is_empty())
            .map(|(id, node)| Reverse((node.idx, id.clone())))
            .collect::<BinaryHeap<_>>();

        let mut plan = Vec::with_capacity(work.len());

        while let Some(Reverse((_, target))) = open.pop() {
            let Some(node) = work.remove(&target) else {
                continue;
            };
            for dep in &node.provides {
                let dep_node = work.get_mut(dep).expect("edge symmetry");
                dep_node.needs.remove(&target);
                if dep_node.needs.is_empty() {
                    open.push(Reverse((dep_node.idx, dep.clone())));
                }
            }
            plan.push(target);
        }

        if work.is_empty() {
            Ok(plan)
        } else {
            Err(Error::Cyclic(work))
        }
    }
}

impl fmt::Display for DepGraph {
    /// Dump the graph, listing each package's prerequisites
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for id in self.sorted_keys() {
            let node = &self.0[&id];
            writeln!(f, "{id}: ({}) needs", node.action)?;
            let mut needs = node.needs.keys().collect::<Vec<_>>();
            needs.sort();
            for dep in &needs {
                writeln!(f, "    {dep}")?;
            }
            if needs.is_empty() {
                writeln!(f, "    no dependencies")?;
            }
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("cyclic dependencies")]
    Cyclic(DepGraph),
}

#[cfg(test)]
mod test {
    use super::*;

    fn chain() -> DepGraph {
        // a needs b needs c
        let mut graph = DepGraph::new();
        for (i, id) in ["x/a-1", "x/b-1", "x/c-1"].into_iter().enumerate() {
            let mut node = Node::new(Action::Merge);
            node.idx = 2 - i;
            graph.insert(id.into(), node);
        }
        graph.get_mut(&"x/a-1".into()).unwrap().needs.insert("x/b-1".into(), "runtime".into());
        graph.get_mut(&"x/b-1".into()).unwrap().provides.insert("x/a-1".into());
        graph.get_mut(&"x/b-1".into()).unwrap().needs.insert("x/c-1".into(), "buildtime".into());
        graph.get_mut(&"x/c-1".into()).unwrap().provides.insert("x/b-1".into());
        graph
    }

    #[test]
    fn short_name_strips_category() {
        let id = PackageId::from("chromeos-base/power_manager-0.0.1-r1");
        assert_eq!(id.short_name(), "power_manager-0.0.1-r1");
    }

    #[test]
    fn install_plan_follows_needs() {
        let plan = chain().install_plan().unwrap();
        let expected: Vec<PackageId> = vec!["x/c-1".into(), "x/b-1".into(), "x/a-1".into()];
        assert_eq!(plan, expected);
    }

    #[test]
    fn install_plan_reports_cycles() {
        let mut graph = chain();
        // close the loop: c needs a
        graph.get_mut(&"x/c-1".into()).unwrap().needs.insert("x/a-1".into(), "runtime".into());
        graph.get_mut(&"x/a-1".into()).unwrap().provides.insert("x/c-1".into());

        let Err(Error::Cyclic(residual)) = graph.install_plan() else {
            panic!("expected cycle error");
        };
        assert_eq!(residual.len(), 3);
    }

    #[test]
    fn remove_edge_is_symmetric() {
        let mut graph = chain();
        graph.remove_edge(&"x/a-1".into(), &"x/b-1".into());
        assert!(graph.get(&"x/a-1".into()).unwrap().needs.is_empty());
        assert!(graph.get(&"x/b-1".into()).unwrap().provides.is_empty());
    }

    #[test]
    fn dump_lists_prerequisites() {
        let out = chain().to_string();
        assert!(out.contains("x/a-1: (merge) needs\n    x/b-1"));
        assert!(out.contains("x/c-1: (merge) needs\n    no dependencies"));
    }
}
