// SPDX-FileCopyrightText: Copyright © 2020-2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Command-line front end
//!
//! The driver stays argument-compatible with the underlying install
//! executor: flags it recognizes are scraped out of the command line
//! wherever they appear, and everything else is forwarded untouched to
//! the resolver and the install children.

use std::io;
use std::process;

use clap::Parser;
use depgraph::DepGraph;
use itertools::Itertools;
use pmerge::env::{self, Env};
use pmerge::{queue, resolver, style, util};
use thiserror::Error;

/// Driver flags taking a `--flag=value` argument
const DRIVER_FLAGS: &[&str] = &[
    "--board",
    "--workon",
    "--force-remote-binary",
    "--jobs",
    "--load-average",
];

/// Driver switches without a value
const DRIVER_SWITCHES: &[&str] = &["--show-output", "--rebuild"];

/// Interactive or resumption flags we cannot honor
const UNSUPPORTED: &[&str] = &["--ask", "--ask-enter-invalid", "--resume", "--skipfirst"];

/// Executor actions which bypass the parallel driver entirely
const EXECUTOR_ACTIONS: &[&str] = &[
    "--clean",
    "--depclean",
    "--info",
    "--metadata",
    "--prune",
    "--regen",
    "--search",
    "--sync",
    "--unmerge",
];

/// The package manager's own atom; upgrading it restarts the driver
const PACKAGE_MANAGER: &str = "sys-apps/portage";

#[derive(Debug, Parser)]
#[command(
    name = "pmerge",
    about = "Install packages in parallel, honoring dependency order",
    long_about = "Resolves the full dependency graph up front, then runs \
                  mutually independent install jobs concurrently. Unrecognized \
                  arguments are passed through to the install executor."
)]
pub struct Command {
    /// Build for the named board, rooted at /build/<name>
    #[arg(long, value_name = "NAME")]
    pub board: Option<String>,

    /// Always build the listed atoms from source
    #[arg(long, value_name = "ATOMS")]
    pub workon: Option<String>,

    /// Prefer existing prebuilt packages for the listed atoms
    #[arg(long, value_name = "ATOMS")]
    pub force_remote_binary: Option<String>,

    /// Print job output as it is produced
    #[arg(long)]
    pub show_output: bool,

    /// Rebuild packages whenever their dependencies change
    #[arg(long)]
    pub rebuild: bool,

    /// Maximum number of concurrent install jobs
    #[arg(long, value_name = "N")]
    pub jobs: Option<usize>,

    /// Only run one job at a time while the 1 minute load exceeds this
    #[arg(long, value_name = "LOAD")]
    pub load_average: Option<f64>,
}

/// Process all CLI arguments
pub fn process() -> Result<(), Error> {
    let args = std::env::args().collect::<Vec<_>>();
    let (driver_args, forward) = split_args(&args);

    for arg in &forward {
        let name = arg.split_once('=').map_or(arg.as_str(), |(name, _)| name);
        if UNSUPPORTED.contains(&name) {
            return Err(Error::Unsupported(name.to_owned()));
        }
    }

    let command = Command::parse_from(&driver_args);
    let env = Env::new(
        env::Options {
            board: command.board,
            workon: command.workon,
            force_remote_binary: command.force_remote_binary,
            show_output: command.show_output,
            rebuild: command.rebuild,
            jobs: command.jobs,
            load_average: command.load_average,
        },
        forward,
    );

    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(if env.quiet { "warn" } else { "info" }),
    )
    .format_target(false)
    .format_timestamp(None)
    .init();

    // Alternate executor actions aren't ours to parallelize
    if env.flags.iter().any(|a| EXECUTOR_ACTIONS.contains(&a.as_str())) {
        return Err(Error::Exec(delegate(&env)));
    }

    if env.packages.is_empty() {
        return Err(Error::NoPackages);
    }

    // Installing writes the package database; only pretend runs are safe
    // without privileges
    if !env.pretend && !util::is_root() {
        return Err(Error::SuperuserRequired);
    }

    if !env.quiet {
        println!("{}", style::accent("Starting parallel merge."));
        println!(
            " Building package(s) {} on {}",
            env.packages.join(" "),
            env.board.as_deref().unwrap_or("root")
        );
    }

    let plan = resolver::resolve(&env)?;

    if env.tree && env.verbose {
        resolver::print_tree(&plan.tree);
    }

    let mut graph = depgraph::Builder::new(&plan.tree, &plan.order, &plan.packages)
        .quiet(env.quiet)
        .build();

    print_install_plan(&graph)?;
    if env.tree {
        print!("{graph}");
    }

    if env.pretend {
        println!("Skipping merge because of --pretend mode.");
        return Ok(());
    }

    // Upgrading the package manager invalidates everything resolved
    // against the old version: merge it alone, then restart for the rest
    let restart = env.board.is_none()
        && !env.flags.iter().any(|a| a.starts_with("--root"))
        && isolate_package_manager(&mut graph);
    if restart && !env.quiet {
        println!("Upgrading {PACKAGE_MANAGER} first, then restarting...");
    }

    let options = queue::Options {
        procs: env.procs,
        load_average: env.load_average,
        show_output: env.show_output,
    };
    let mut queue = queue::JobQueue::new(graph, options, env.executor())?;
    queue.run()?;

    if restart {
        return Err(Error::Exec(restart_without_package_manager(&args)));
    }

    println!("Done");
    Ok(())
}

/// Partition the raw command line into driver arguments and forwarded
/// executor arguments
fn split_args(args: &[String]) -> (Vec<String>, Vec<String>) {
    let mut driver = vec![args[0].clone()];
    let mut forward = vec![];

    for arg in &args[1..] {
        let name = arg.split_once('=').map_or(arg.as_str(), |(name, _)| name);
        let ours = DRIVER_SWITCHES.contains(&arg.as_str())
            || (arg.contains('=') && DRIVER_FLAGS.contains(&name))
            || arg == "--help";

        if ours {
            driver.push(arg.clone());
        } else {
            forward.push(arg.clone());
        }
    }

    (driver, forward)
}

/// Print the ordered install plan
fn print_install_plan(graph: &DepGraph) -> Result<(), Error> {
    match graph.install_plan() {
        Ok(plan) => {
            for pkg in plan {
                let action = graph.get(&pkg).expect("planned node exists").action;
                println!("[{}] {pkg}", style::dim(&action.to_string()));
            }
            Ok(())
        }
        Err(depgraph::Error::Cyclic(residual)) => {
            println!(
                "Cyclic dependencies: {}",
                residual.sorted_keys().iter().join(" ")
            );
            print!("{residual}");
            Err(Error::CyclicPlan)
        }
    }
}

/// Reduce a larger graph to just the package manager, clearing its edges.
/// Returns whether the reduction happened.
fn isolate_package_manager(graph: &mut DepGraph) -> bool {
    if graph.len() <= 1 {
        return false;
    }

    let prefix = format!("{PACKAGE_MANAGER}-");
    let Some(target) = graph
        .keys()
        .find(|id| id.as_str().starts_with(&prefix))
        .cloned()
    else {
        return false;
    };

    let mut node = graph.remove(&target).expect("node exists");
    node.needs.clear();
    node.provides.clear();
    node.tprovides.clear();

    *graph = DepGraph::new();
    graph.insert(target, node);
    true
}

/// Replace ourselves with the executor for actions we don't parallelize.
/// Only returns on exec failure.
fn delegate(env: &Env) -> io::Error {
    use std::os::unix::process::CommandExt;

    let mut command = process::Command::new(env::executor_program());
    command.args(&env.forward).envs(&env.vars);
    command.exec()
}

/// Re-run the driver under sudo with the package manager excluded, so the
/// remaining merges use the freshly upgraded version. Only returns on
/// exec failure.
fn restart_without_package_manager(args: &[String]) -> io::Error {
    use std::os::unix::process::CommandExt;

    let sudo_user = std::env::var("SUDO_USER").unwrap_or_default();
    let mut command = process::Command::new("sudo");
    command
        .arg("-E")
        .arg(format!("SUDO_USER={sudo_user}"))
        .args(args)
        .arg(format!("--exclude={PACKAGE_MANAGER}"));
    command.exec()
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("{0} is not supported")]
    Unsupported(String),

    #[error("no packages specified")]
    NoPackages,

    #[error("superuser access is required")]
    SuperuserRequired,

    #[error("cyclic dependencies in install plan")]
    CyclicPlan,

    #[error("resolver")]
    Resolver(#[from] resolver::Error),

    #[error("queue")]
    Queue(#[from] queue::Error),

    #[error("exec executor")]
    Exec(#[source] io::Error),
}

#[cfg(test)]
mod test {
    use depgraph::{Action, Node};

    use super::*;

    fn argv(args: &[&str]) -> Vec<String> {
        std::iter::once("pmerge")
            .chain(args.iter().copied())
            .map(ToOwned::to_owned)
            .collect()
    }

    #[test]
    fn driver_flags_are_scraped_anywhere() {
        let (driver, forward) = split_args(&argv(&[
            "--usepkg",
            "--board=arm-generic",
            "--show-output",
            "--jobs=4",
            "cat/foo-1",
        ]));

        assert_eq!(driver[1..], ["--board=arm-generic", "--show-output", "--jobs=4"]);
        assert_eq!(forward, ["--usepkg", "cat/foo-1"]);
    }

    #[test]
    fn unknown_flags_are_forwarded() {
        let (driver, forward) = split_args(&argv(&["--deep", "--newuse", "cat/foo-1"]));
        assert_eq!(driver.len(), 1);
        assert_eq!(forward.len(), 3);
    }

    #[test]
    fn package_manager_upgrade_is_isolated() {
        let mut graph = DepGraph::new();
        let mut pm = Node::new(Action::Merge);
        pm.needs.insert("cat/dep-1".into(), "runtime".to_owned());
        graph.insert("sys-apps/portage-3.0.21".into(), pm);
        let mut dep = Node::new(Action::Merge);
        dep.provides.insert("sys-apps/portage-3.0.21".into());
        graph.insert("cat/dep-1".into(), dep);

        assert!(isolate_package_manager(&mut graph));
        assert_eq!(graph.len(), 1);
        let node = graph.get(&"sys-apps/portage-3.0.21".into()).unwrap();
        assert!(node.needs.is_empty() && node.provides.is_empty());
    }

    #[test]
    fn lone_graphs_are_not_isolated() {
        let mut graph = DepGraph::new();
        graph.insert("sys-apps/portage-3.0.21".into(), Node::new(Action::Merge));
        assert!(!isolate_package_manager(&mut graph));
        assert_eq!(graph.len(), 1);
    }
}
