// SPDX-FileCopyrightText: Copyright © 2020-2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Driver configuration and downstream environment composition
//!
//! Everything the resolver and install children observe is decided here,
//! once, during startup: board roots, feature toggles, and the argument
//! translations the driver performs on the executor's behalf. Children
//! inherit the composed map rather than ad-hoc parent mutations.

use std::collections::BTreeMap;
use std::env;
use std::ffi::OsStr;
use std::path::Path;
use std::process;

use crate::util;
use crate::worker::Executor;

/// Packages too expensive to rebuild just because a dependency changed
const REBUILD_EXCLUDE: &[&str] = &[
    "chromeos-base/chromeos-chrome",
    "media-plugins/o3d",
    "dev-java/icedtea",
];

/// Driver flags scraped from the command line
#[derive(Debug, Default)]
pub struct Options {
    pub board: Option<String>,
    pub workon: Option<String>,
    pub force_remote_binary: Option<String>,
    pub show_output: bool,
    pub rebuild: bool,
    pub jobs: Option<usize>,
    pub load_average: Option<f64>,
}

/// Fully composed driver configuration
#[derive(Debug)]
pub struct Env {
    pub board: Option<String>,
    pub show_output: bool,
    pub pretend: bool,
    pub quiet: bool,
    pub tree: bool,
    pub verbose: bool,
    pub procs: usize,
    pub load_average: Option<f64>,
    /// Arguments forwarded to resolver and executor, original order
    pub forward: Vec<String>,
    /// Flag subset of `forward`, used for install children
    pub flags: Vec<String>,
    /// Package atoms requested on the command line
    pub packages: Vec<String>,
    /// Environment inherited by resolver and install children
    pub vars: BTreeMap<String, String>,
}

impl Env {
    pub fn new(options: Options, mut forward: Vec<String>) -> Self {
        // Observed but still forwarded; the executor honors them too
        let has = |name: &str, short: &str| forward.iter().any(|a| a == name || a == short);
        let pretend = has("--pretend", "-p");
        let quiet = has("--quiet", "-q");
        let tree = has("--tree", "-t");
        let verbose = has("--verbose", "-v");

        if let Some(atoms) = &options.workon {
            // Workon atoms always build from source
            forward.push(format!("--reinstall-atoms={atoms}"));
            forward.push(format!("--usepkg-exclude={atoms}"));
        }
        if let Some(atoms) = &options.force_remote_binary {
            forward.push(format!("--useoldpkg-atoms={atoms}"));
        }
        if options.rebuild {
            forward.push("--rebuild-if-unbuilt".to_owned());
        }
        for pkg in REBUILD_EXCLUDE {
            forward.push(format!("--rebuild-exclude={pkg}"));
        }

        // Board installs want build deps inside the board root as well
        if options.board.is_some() && !forward.iter().any(|a| a.starts_with("--root-deps")) {
            forward.push("--root-deps".to_owned());
        }

        let (flags, packages) = forward.iter().cloned().partition(|a| a.starts_with('-'));

        let vars = compose_vars(env::vars().collect(), options.board.as_deref());

        Self {
            board: options.board,
            show_output: options.show_output,
            pretend,
            quiet,
            tree,
            verbose,
            procs: options.jobs.unwrap_or_else(|| util::num_cpus().get()),
            load_average: options.load_average,
            forward,
            flags,
            packages,
            vars,
        }
    }

    /// Compose the install executor for the worker pool
    pub fn executor(&self) -> Executor {
        Executor::new(executor_program(), self.flags.clone(), self.vars.clone())
    }

    /// Command running the external resolver with our composed state
    pub fn resolver_command(&self) -> process::Command {
        let mut command = process::Command::new(resolver_program());
        command
            .args(&self.forward)
            .env_clear()
            .envs(&self.vars);
        command
    }
}

/// Install executor binary; overridable for tests and alternate layouts
pub fn executor_program() -> String {
    env::var("PMERGE_EXECUTOR").unwrap_or_else(|_| "emerge".to_owned())
}

/// Resolver binary emitting the dependency plan as JSON on stdout
pub fn resolver_program() -> String {
    env::var("PMERGE_RESOLVER").unwrap_or_else(|_| "pmerge-resolve".to_owned())
}

/// Build the child environment from the parent's, applying board roots
/// and feature toggles
fn compose_vars(
    mut vars: BTreeMap<String, String>,
    board: Option<&str>,
) -> BTreeMap<String, String> {
    // The package manager needs a named service user; when the caller
    // (usually sudo) didn't provide one, derive it from $HOME
    if !vars.contains_key("PORTAGE_USERNAME") {
        let user = vars
            .get("HOME")
            .and_then(|home| Path::new(home).file_name())
            .and_then(OsStr::to_str)
            .map(ToOwned::to_owned);
        if let Some(user) = user {
            vars.insert("PORTAGE_USERNAME".to_owned(), user);
        }
    }

    if let Some(board) = board {
        let root = format!("/build/{board}");
        vars.insert("PORTAGE_CONFIGROOT".to_owned(), root.clone());
        vars.insert("PORTAGE_SYSROOT".to_owned(), root.clone());
        vars.insert("SYSROOT".to_owned(), root);
        if let Some(home) = vars.get("HOME").cloned() {
            vars.entry("CHROMEOS_ROOT".to_owned())
                .or_insert(format!("{home}/trunk"));
        }
    }

    // No interactive pauses inside install children
    vars.insert("EBEEP_IGNORE".to_owned(), "1".to_owned());
    vars.insert("EPAUSE_IGNORE".to_owned(), "1".to_owned());
    vars.insert("UNMERGE_DELAY".to_owned(), "0".to_owned());

    // collision-protect trips over stale files from earlier failed
    // merges; parallel-install lets children merge concurrently
    let mut features = vars.get("FEATURES").cloned().unwrap_or_default();
    features.push_str(" -collision-protect parallel-install");

    // Board packages are cross-compiled and never execute during install,
    // so unofficial board builds can skip install locking and deferred
    // environment updates
    if board.is_some() && vars.get("CHROMEOS_OFFICIAL").map(String::as_str) != Some("1") {
        vars.entry("PORTAGE_LOCKS".to_owned())
            .or_insert_with(|| "false".to_owned());
        features.push_str(" -ebuild-locks no-env-update");
    }

    vars.insert("FEATURES".to_owned(), features.trim_start().to_owned());
    vars
}
