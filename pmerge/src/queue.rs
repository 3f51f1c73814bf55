// SPDX-FileCopyrightText: Copyright © 2020-2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Scheduling of install jobs against the dependency graph
//!
//! [`JobQueue`] owns the mutable [`DepGraph`], dispatches unblocked
//! packages to the worker pool, and processes completions, removing
//! finished nodes and releasing their dependents. A package gets one
//! silent retry; the second failure dooms the build. When no work can be
//! made ready and the graph is non-empty, the run ends in deadlock.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};

use crossbeam::channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use depgraph::{Action, DepGraph, Node, PackageId};
use fs_err as fs;
use itertools::Itertools;
use thiserror::Error;

use crate::printer::{Message, Printer};
use crate::style;
use crate::util;
use crate::worker::{Executor, JobState, Pool, Task};
use crate::{printer, signal, worker};

/// How long to wait on the result channel before refilling the ready set
const RESULT_TIMEOUT: Duration = Duration::from_secs(5);
/// Result timeouts tolerated before a status line goes out
const STATUS_AFTER: u32 = 3;

/// Priority of a ready package: most transitive dependents first, then
/// prebuilt binaries, then the resolver's install order
type Score = (i64, bool, usize);

fn score(node: &Node) -> Score {
    (-(node.tprovides.len() as i64), node.binary, node.idx)
}

#[derive(Debug, Clone)]
pub struct Options {
    /// Upper bound on concurrent install jobs
    pub procs: usize,
    /// 1 minute load average above which only one job runs
    pub load_average: Option<f64>,
    /// Dump job logs as jobs complete and while they run
    pub show_output: bool,
}

pub struct JobQueue {
    graph: DepGraph,
    ready: BinaryHeap<Reverse<(Score, PackageId)>>,
    /// In-flight jobs; `None` marks a dispatched job the worker hasn't
    /// reported in for yet
    jobs: HashMap<PackageId, Option<JobState>>,
    retry_queue: VecDeque<PackageId>,
    failed: HashSet<PackageId>,
    /// Every package that was ever queued for retry
    retried: HashSet<PackageId>,
    total_jobs: usize,
    procs: usize,
    load_average: Option<f64>,
    show_output: bool,
    tasks: Option<Sender<Option<Task>>>,
    results: Receiver<JobState>,
    print_tx: Option<Sender<Message>>,
    pool: Option<Pool>,
    printer: Option<Printer>,
    start: Instant,
}

impl JobQueue {
    /// Set up the worker pool and printer and seed the ready set
    pub fn new(graph: DepGraph, options: Options, executor: Executor) -> Result<Self, Error> {
        let total_jobs = graph
            .iter()
            .filter(|(_, node)| node.action == Action::Merge)
            .count();

        // The group must exist before the first fork so a group-wide kill
        // reaches every install child
        signal::isolate()?;
        signal::install()?;

        let procs = options.procs.min(total_jobs).max(1);

        let (task_tx, task_rx) = unbounded();
        let (result_tx, result_rx) = unbounded();
        let (print_tx, print_rx) = unbounded();

        let pool = Pool::new(procs, task_rx, task_tx.clone(), result_tx, executor)?;
        let printer = Printer::spawn(print_rx)?;

        let mut queue = Self {
            ready: graph
                .iter()
                .filter(|(_, node)| node.nodeps || node.needs.is_empty())
                .map(|(id, node)| Reverse((score(node), id.clone())))
                .collect(),
            graph,
            jobs: HashMap::new(),
            retry_queue: VecDeque::new(),
            failed: HashSet::new(),
            retried: HashSet::new(),
            total_jobs,
            procs,
            load_average: options.load_average,
            show_output: options.show_output,
            tasks: Some(task_tx),
            results: result_rx,
            print_tx: Some(print_tx),
            pool: Some(pool),
            printer: Some(printer),
            start: Instant::now(),
        };

        queue.schedule_loop();
        queue.status();

        Ok(queue)
    }

    /// Run until the graph is drained or the build cannot proceed
    pub fn run(&mut self) -> Result<(), Error> {
        while !self.graph.is_empty() {
            if signal::killed() {
                return Err(self.exit_on_signal());
            }

            // Nothing queued, nothing running, nothing ready: retry a
            // failed package or give up
            if self.quiescent() {
                if self.retry_queue.is_empty() {
                    self.shutdown()?;
                    // The remaining graph is the best diagnostic we have
                    print!("{}", self.graph);
                    return Err(self.stall_error());
                }
                self.retry();
            }

            let Some(job) = self.next_result() else {
                if signal::killed() {
                    return Err(self.exit_on_signal());
                }
                self.status();
                continue;
            };

            let target = job.target.clone();

            if !job.done {
                self.print_line(format!(
                    "Started {target} (logged in {})",
                    job.log_path.display()
                ));
                self.jobs.insert(target, Some(job));
                continue;
            }

            let retcode = job.retcode.unwrap_or(1);
            if self.show_output || retcode != 0 {
                self.send(Message::Job {
                    job: job.clone(),
                    unlink: true,
                });
            } else {
                let _ = fs::remove_file(&job.log_path);
            }
            self.jobs.remove(&target);

            let details = format!("{target} (in {})", util::time_span(job.start.elapsed()));
            let previously_failed = self.failed.contains(&target);

            if retcode != 0 {
                if previously_failed {
                    // Second failure: the build is doomed. In-flight jobs
                    // drain, then the stall check reports and exits.
                    self.print_line(style::failure(&format!(
                        "Failed {details}. Your build has failed."
                    )));
                } else {
                    self.retried.insert(target.clone());
                    self.retry_queue.push_back(target.clone());
                    self.failed.insert(target.clone());
                    self.print_line(format!("Failed {details}, retrying later."));
                }
            } else {
                if previously_failed {
                    self.failed.remove(&target);
                }
                self.print_line(format!("Completed {details}"));
                self.finish(&target);

                // A successful retry frees the next queued retry; at most
                // one runs at a time
                if previously_failed && !self.retry_queue.is_empty() {
                    self.retry();
                }
            }

            self.schedule_loop();
            self.status();
        }

        self.epilog();
        self.shutdown()
    }

    /// Which packages were retried during the run
    pub fn retried(&self) -> impl Iterator<Item = &PackageId> {
        self.retried.iter()
    }

    fn quiescent(&self) -> bool {
        self.tasks.as_ref().is_some_and(|tasks| tasks.is_empty())
            && self.results.is_empty()
            && self.jobs.is_empty()
            && self.ready.is_empty()
    }

    fn stall_error(&self) -> Error {
        if self.failed.is_empty() {
            println!("Deadlock! Circular dependencies!");
            Error::Deadlock
        } else {
            let mut failed = self.failed.iter().cloned().collect::<Vec<_>>();
            failed.sort();
            println!("Packages failed: {}", failed.iter().join(", "));
            Error::Failed(failed)
        }
    }

    /// Poll the result channel, refilling the ready set between timeouts.
    /// Returns `None` after ~15s idle so a status update can go out.
    fn next_result(&mut self) -> Option<JobState> {
        for _ in 0..STATUS_AFTER {
            match self.results.recv_timeout(RESULT_TIMEOUT) {
                Ok(job) => return Some(job),
                Err(RecvTimeoutError::Timeout) => self.schedule_loop(),
                Err(RecvTimeoutError::Disconnected) => return None,
            }
        }
        None
    }

    /// Dispatch `target`, or skip past it when there is nothing to execute
    fn schedule(&mut self, target: &PackageId) -> bool {
        let Some(action) = self.graph.get(target).map(|node| node.action) else {
            return false;
        };

        if action == Action::Nomerge {
            // Nothing runs for this node; free its dependents right away
            self.finish(target);
            false
        } else if !self.jobs.contains_key(target) {
            // Reserve the slot before the worker reports in. The action
            // rides along so the executor runs the right operation.
            self.jobs.insert(target.clone(), None);
            if let Some(tasks) = &self.tasks {
                let _ = tasks.send(Some(Task {
                    target: target.clone(),
                    action,
                }));
            }
            true
        } else {
            false
        }
    }

    /// Dispatch ready packages up to the parallelism cap
    fn schedule_loop(&mut self) {
        let cap = dispatch_cap(
            self.procs,
            self.load_average,
            util::load_average().map(|loads| loads.0),
        );

        while self.jobs.len() < cap {
            let Some(Reverse((_, target))) = self.ready.pop() else {
                break;
            };
            if !self.failed.contains(&target) {
                self.schedule(&target);
            }
        }
    }

    /// Mark `target` complete and release its dependents
    fn finish(&mut self, target: &PackageId) {
        let mut work = vec![target.clone()];

        while let Some(target) = work.pop() {
            let (early, provides) = {
                let Some(node) = self.graph.get(&target) else {
                    continue;
                };
                (
                    !node.needs.is_empty() && node.nodeps,
                    node.provides.iter().cloned().collect::<Vec<_>>(),
                )
            };

            if early {
                // Merged before its needs were satisfied. Dependents keep
                // waiting until those needs resolve; only the execution is
                // behind us.
                self.graph.get_mut(&target).expect("node exists").action = Action::Nomerge;
                continue;
            }

            for dep in provides {
                let Some(dep_node) = self.graph.get_mut(&dep) else {
                    continue;
                };
                dep_node.needs.remove(&target);
                if dep_node.needs.is_empty() {
                    if dep_node.nodeps && dep_node.action == Action::Nomerge {
                        // Installed early; its turn to unblock dependents
                        work.push(dep);
                    } else {
                        let entry = Reverse((score(dep_node), dep));
                        self.ready.push(entry);
                    }
                }
            }

            self.graph.remove(&target);
        }
    }

    /// Dispatch one queued retry
    fn retry(&mut self) {
        while let Some(target) = self.retry_queue.pop_front() {
            if self.schedule(&target) {
                self.print_line(format!("Retrying install of {target}."));
                break;
            }
        }
    }

    /// Periodic progress output while the result channel is idle
    fn status(&mut self) {
        let now = Instant::now();
        let mut no_output = true;

        // With --show-output, dump interim output every minute. Otherwise
        // nudge about long-running packages every two minutes and dump the
        // log of any job silent for an hour.
        let (interval, notify_interval) = if self.show_output {
            (Duration::from_secs(60), None)
        } else {
            (Duration::from_secs(60 * 60), Some(Duration::from_secs(60 * 2)))
        };

        let mut messages = vec![];
        for job in self.jobs.values_mut().flatten() {
            let last = job.last_output.unwrap_or(job.start);
            if last + interval < now {
                job.last_output = Some(now);
                messages.push(Message::Job {
                    job: job.clone(),
                    unlink: false,
                });
                no_output = false;
            } else if let Some(notify) = notify_interval {
                if job.last_notify + notify < now {
                    job.last_notify = now;
                    messages.push(Message::Line(format!(
                        "Still building {} ({}). Logs in {}",
                        job.pkgname,
                        util::time_span(job.start.elapsed()),
                        job.log_path.display()
                    )));
                    no_output = false;
                }
            }
        }
        for message in messages {
            self.send(message);
        }

        if no_output {
            let load = match util::load_average() {
                Some((one, five, fifteen)) => format!("{one:.2} {five:.2} {fifteen:.2}"),
                None => "unknown".to_owned(),
            };
            self.print_line(format!(
                "Pending {}, Ready {}, Running {}, Retrying {}, Total {} [Time {} Load {load}]",
                self.graph.len(),
                self.ready.len(),
                self.jobs.len(),
                self.retry_queue.len(),
                self.total_jobs,
                util::time_span(self.start.elapsed()),
            ));
        }
    }

    /// Note any retried packages, then declare victory
    fn epilog(&mut self) {
        if !self.retried.is_empty() {
            let mut retried = self.retried.iter().cloned().collect::<Vec<_>>();
            retried.sort();

            self.print_line(String::new());
            self.print_line(style::warning(
                "WARNING: The following packages failed the first time,",
            ));
            self.print_line(style::warning(
                "but succeeded upon retry. This might indicate incorrect",
            ));
            self.print_line(style::warning("dependencies."));
            for pkg in retried {
                self.print_line(format!("  {pkg}"));
            }
            self.print_line(String::new());
        }

        self.print_line("Merge complete".to_owned());
    }

    /// Stop workers, then the printer, each exactly once
    fn shutdown(&mut self) -> Result<(), Error> {
        if let Some(tasks) = self.tasks.take() {
            let _ = tasks.send(None);
        }
        if let Some(pool) = self.pool.take() {
            pool.join();
        }
        drop(self.print_tx.take());
        if let Some(printer) = self.printer.take() {
            printer.join()?;
        }
        Ok(())
    }

    /// First-signal teardown: flush in-flight job logs, then take the
    /// whole process group down hard
    fn exit_on_signal(&mut self) -> Error {
        let signum = signal::signum().unwrap_or(0);

        if let Some(print_tx) = &self.print_tx {
            for job in self.jobs.values().flatten() {
                let _ = print_tx.send(Message::Job {
                    job: job.clone(),
                    unlink: true,
                });
            }
            let _ = print_tx.send(Message::Line(format!("Exiting on signal {signum}")));
        }
        drop(self.print_tx.take());
        if let Some(printer) = self.printer.take() {
            let _ = printer.join();
        }

        signal::kill_group();
        Error::Killed(signum)
    }

    fn print_line(&self, line: String) {
        self.send(Message::Line(line));
    }

    fn send(&self, message: Message) {
        if let Some(print_tx) = &self.print_tx {
            let _ = print_tx.send(message);
        }
    }
}

/// One job at a time while the machine is above the requested load
fn dispatch_cap(procs: usize, cap: Option<f64>, load1: Option<f64>) -> usize {
    match (cap, load1) {
        (Some(cap), Some(load)) if load > cap => 1,
        _ => procs,
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("deadlock, no runnable work remains")]
    Deadlock,

    #[error("packages failed: {}", .0.iter().join(", "))]
    Failed(Vec<PackageId>),

    #[error("exiting on signal {0}")]
    Killed(i32),

    #[error("worker pool")]
    Worker(#[from] worker::Error),

    #[error("printer")]
    Printer(#[from] printer::Error),

    #[error("signal handling")]
    Signal(#[from] signal::Error),
}

#[cfg(test)]
mod test {
    use std::collections::BTreeMap;
    use std::path::Path;

    use super::*;

    fn options(procs: usize) -> Options {
        Options {
            procs,
            load_average: None,
            show_output: false,
        }
    }

    /// Executor recording each target it runs, then delegating to `script`
    fn recording_executor(record: &Path, script: &str) -> Executor {
        Executor::new(
            "/bin/sh".to_owned(),
            vec![
                "-c".to_owned(),
                format!("echo \"$1\" >> {}\n{script}", record.display()),
            ],
            BTreeMap::new(),
        )
    }

    fn record_lines(record: &Path) -> Vec<String> {
        fs::read_to_string(record)
            .unwrap_or_default()
            .lines()
            .map(ToOwned::to_owned)
            .collect()
    }

    /// Graph where each listed package needs the next one; idx follows
    /// list position
    fn chain(ids: &[&str]) -> DepGraph {
        let mut graph = DepGraph::new();
        for (i, id) in ids.iter().enumerate() {
            let mut node = Node::new(Action::Merge);
            node.idx = i;
            graph.insert(PackageId::from(*id), node);
        }
        for pair in ids.windows(2) {
            let (from, to) = (PackageId::from(pair[0]), PackageId::from(pair[1]));
            graph
                .get_mut(&from)
                .unwrap()
                .needs
                .insert(to.clone(), "runtime".to_owned());
            graph.get_mut(&to).unwrap().provides.insert(from);
        }
        graph
    }

    #[test]
    fn linear_chain_dispatches_bottom_up() {
        let dir = tempfile::tempdir().unwrap();
        let record = dir.path().join("record");

        let graph = chain(&["cat/a-1", "cat/b-1", "cat/c-1"]);
        let mut queue = JobQueue::new(
            graph,
            options(2),
            recording_executor(&record, "exit 0"),
        )
        .unwrap();

        queue.run().unwrap();

        assert!(queue.graph.is_empty());
        assert_eq!(queue.total_jobs, 3);
        assert_eq!(record_lines(&record), vec!["=cat/c-1", "=cat/b-1", "=cat/a-1"]);
    }

    #[test]
    fn diamond_runs_middle_concurrently() {
        let dir = tempfile::tempdir().unwrap();
        let record = dir.path().join("record");

        // a needs b and c; b and c need d
        let mut graph = chain(&["cat/a-1", "cat/b-1", "cat/d-1"]);
        let mut c = Node::new(Action::Merge);
        c.idx = 3;
        c.needs.insert("cat/d-1".into(), "runtime".to_owned());
        c.provides.insert("cat/a-1".into());
        graph.insert("cat/c-1".into(), c);
        graph
            .get_mut(&"cat/a-1".into())
            .unwrap()
            .needs
            .insert("cat/c-1".into(), "runtime".to_owned());
        graph
            .get_mut(&"cat/d-1".into())
            .unwrap()
            .provides
            .insert("cat/c-1".into());

        let mut queue = JobQueue::new(
            graph,
            options(2),
            recording_executor(&record, "exit 0"),
        )
        .unwrap();
        queue.run().unwrap();

        let lines = record_lines(&record);
        assert_eq!(queue.total_jobs, 4);
        assert_eq!(lines.len(), 4);
        assert_eq!(lines.first().map(String::as_str), Some("=cat/d-1"));
        assert_eq!(lines.last().map(String::as_str), Some("=cat/a-1"));
    }

    #[test]
    fn nomerge_nodes_skip_execution() {
        let dir = tempfile::tempdir().unwrap();
        let record = dir.path().join("record");

        // a (merge) -> b (nomerge) -> c (merge)
        let mut graph = chain(&["cat/a-1", "cat/b-1", "cat/c-1"]);
        graph.get_mut(&"cat/b-1".into()).unwrap().action = Action::Nomerge;

        let mut queue = JobQueue::new(
            graph,
            options(2),
            recording_executor(&record, "exit 0"),
        )
        .unwrap();
        queue.run().unwrap();

        assert_eq!(queue.total_jobs, 2);
        assert_eq!(record_lines(&record), vec!["=cat/c-1", "=cat/a-1"]);
    }

    #[test]
    fn early_merge_defers_dependents() {
        let dir = tempfile::tempdir().unwrap();
        let record = dir.path().join("record");
        let marker = dir.path().join("b-started");

        // b needs a, but b is a prebuilt with no hooks: both dispatch
        // immediately. b waits in-graph as nomerge until a completes.
        let mut graph = chain(&["cat/b-1", "cat/a-1"]);
        let b = graph.get_mut(&"cat/b-1".into()).unwrap();
        b.binary = true;
        b.nodeps = true;

        // a blocks until b proves it was dispatched concurrently
        let script = format!(
            "case \"$1\" in\n\
             =cat/b-1) : > {marker} ;;\n\
             =cat/a-1) i=0; while [ ! -e {marker} ]; do i=$((i+1)); [ $i -gt 100 ] && exit 7; sleep 0.1; done ;;\n\
             esac\nexit 0",
            marker = marker.display()
        );

        let mut queue =
            JobQueue::new(graph, options(2), recording_executor(&record, &script)).unwrap();
        queue.run().unwrap();

        // Both ran exactly once and the graph fully drained, so the
        // nomerge demotion was resolved by a's completion
        let mut lines = record_lines(&record);
        lines.sort();
        assert_eq!(lines, vec!["=cat/a-1", "=cat/b-1"]);
        assert!(queue.graph.is_empty());
    }

    #[test]
    fn replacementless_uninstall_dispatches_removal() {
        let dir = tempfile::tempdir().unwrap();
        let record = dir.path().join("record");

        // a waits on the removal of u; the resolver found nothing
        // replacing u, so the removal itself goes to the executor
        let mut graph = chain(&["cat/a-1", "cat/u-1"]);
        graph.get_mut(&"cat/u-1".into()).unwrap().action = Action::Uninstall;

        let executor = Executor::new(
            "/bin/sh".to_owned(),
            vec![
                "-c".to_owned(),
                format!("echo \"$0 $@\" >> {}", record.display()),
            ],
            BTreeMap::new(),
        );

        let mut queue = JobQueue::new(graph, options(1), executor).unwrap();
        queue.run().unwrap();

        assert!(queue.graph.is_empty());
        assert_eq!(
            record_lines(&record),
            vec!["--unmerge --nodeps =cat/u-1", "--nodeps =cat/a-1"]
        );
    }

    #[test]
    fn transient_failure_is_retried() {
        let dir = tempfile::tempdir().unwrap();
        let record = dir.path().join("record");
        let marker = dir.path().join("b-failed-once");

        let graph = chain(&["cat/a-1", "cat/b-1"]);
        let script = format!(
            "case \"$1\" in\n\
             =cat/b-1) if [ -e {marker} ]; then exit 0; else : > {marker}; exit 1; fi ;;\n\
             *) exit 0 ;;\n\
             esac",
            marker = marker.display()
        );

        let mut queue =
            JobQueue::new(graph, options(2), recording_executor(&record, &script)).unwrap();
        queue.run().unwrap();

        assert!(queue.graph.is_empty());
        assert!(queue.failed.is_empty());
        let retried = queue.retried().collect::<Vec<_>>();
        assert_eq!(retried, vec![&PackageId::from("cat/b-1")]);

        // b ran twice, a ran once after b finally succeeded
        let lines = record_lines(&record);
        assert_eq!(lines, vec!["=cat/b-1", "=cat/b-1", "=cat/a-1"]);
    }

    #[test]
    fn double_failure_dooms_the_build() {
        let dir = tempfile::tempdir().unwrap();
        let record = dir.path().join("record");

        let graph = chain(&["cat/a-1"]);
        let mut queue = JobQueue::new(
            graph,
            options(1),
            recording_executor(&record, "exit 1"),
        )
        .unwrap();

        let Err(Error::Failed(failed)) = queue.run() else {
            panic!("expected failure");
        };
        assert_eq!(failed, vec![PackageId::from("cat/a-1")]);
        assert_eq!(record_lines(&record).len(), 2, "one retry, then doom");
    }

    #[test]
    fn deadlock_is_detected() {
        let dir = tempfile::tempdir().unwrap();
        let record = dir.path().join("record");

        // a waits on a package which doesn't exist; nothing ever readies
        let mut graph = chain(&["cat/a-1"]);
        graph
            .get_mut(&"cat/a-1".into())
            .unwrap()
            .needs
            .insert("cat/x-1".into(), "runtime".to_owned());

        let mut queue = JobQueue::new(
            graph,
            options(1),
            recording_executor(&record, "exit 0"),
        )
        .unwrap();

        let Err(Error::Deadlock) = queue.run() else {
            panic!("expected deadlock");
        };
        assert!(record_lines(&record).is_empty());
    }

    #[test]
    fn load_gate_caps_dispatch_at_one() {
        assert_eq!(dispatch_cap(8, None, Some(100.0)), 8);
        assert_eq!(dispatch_cap(8, Some(4.0), Some(3.9)), 8);
        assert_eq!(dispatch_cap(8, Some(4.0), Some(4.1)), 1);
        assert_eq!(dispatch_cap(8, Some(4.0), None), 8);
    }
}
