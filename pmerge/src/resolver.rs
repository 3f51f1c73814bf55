// SPDX-FileCopyrightText: Copyright © 2020-2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Interface to the external dependency resolver
//!
//! The resolver is a separate program: it receives the forwarded command
//! line, computes a full install plan, and emits it as a JSON document on
//! stdout. Problems are its own to display on stderr; a non-zero exit
//! means no valid plan exists.

use std::collections::BTreeMap;
use std::io;
use std::process::Stdio;
use std::time::Instant;

use depgraph::{Catalog, PackageId, RawNode, RawTree};
use serde::Deserialize;
use thiserror::Error;

use crate::env::Env;
use crate::util;

/// Everything the resolver reports for one run
#[derive(Debug, Deserialize)]
pub struct Plan {
    /// Raw dependency tree of the requested packages
    pub tree: RawTree,
    /// Intended install order; also the set of packages to install
    #[serde(default)]
    pub order: Vec<PackageId>,
    /// Catalog facts for the involved packages
    #[serde(default)]
    pub packages: Catalog,
}

/// Run the resolver and parse its plan
pub fn resolve(env: &Env) -> Result<Plan, Error> {
    let start = Instant::now();
    if !env.quiet {
        println!("Calculating deps...");
    }

    let output = env
        .resolver_command()
        .stdin(Stdio::null())
        .stderr(Stdio::inherit())
        .output()
        .map_err(Error::Spawn)?;

    if !output.status.success() {
        return Err(Error::NoPlan(output.status.code().unwrap_or(1)));
    }

    let plan = serde_json::from_slice(&output.stdout)?;

    if !env.quiet {
        println!("Deps calculated in {}", util::time_span(start.elapsed()));
    }

    Ok(plan)
}

/// Print the raw dependency tree, indented by depth
pub fn print_tree(tree: &RawTree) {
    fn level(deps: &BTreeMap<PackageId, RawNode>, depth: usize) {
        for (pkg, entry) in deps {
            println!("{:depth$} {pkg} ({})", "", entry.action);
            level(&entry.deps, depth + 2);
        }
    }

    level(tree, 0);
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("run resolver")]
    Spawn(#[source] io::Error),

    #[error("resolver found no valid plan (status {0})")]
    NoPlan(i32),

    #[error("parse resolver output")]
    Parse(#[from] serde_json::Error),
}

#[cfg(test)]
mod test {
    use depgraph::Action;

    use super::*;

    #[test]
    fn plan_parses_resolver_output() {
        let plan: Plan = serde_json::from_str(
            r#"{
                "tree": {
                    "cat/a-1": {"action": "merge", "deps": {
                        "cat/b-1": {"action": "merge", "kinds": ["runtime"], "deps": {}}
                    }}
                },
                "order": ["cat/b-1", "cat/a-1"],
                "packages": {"cat/b-1": {"binary": true, "hook_phases": ["postinst"]}}
            }"#,
        )
        .expect("valid plan");

        assert_eq!(plan.order.len(), 2);
        let root = &plan.tree[&PackageId::from("cat/a-1")];
        assert_eq!(root.action, Action::Merge);
        assert_eq!(root.deps.len(), 1);
        assert!(plan.packages[&PackageId::from("cat/b-1")].binary);
    }

    #[test]
    fn order_and_catalog_are_optional() {
        let plan: Plan = serde_json::from_str(r#"{"tree": {}}"#).expect("valid plan");
        assert!(plan.order.is_empty());
        assert!(plan.packages.is_empty());
    }
}
