// SPDX-FileCopyrightText: Copyright © 2020-2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Fixed-size pool of install workers
//!
//! Each worker pulls package ids off the task channel and runs the
//! external install executor in a supervised child process, capturing its
//! output in a per-job log file. Start and completion events flow back on
//! the result channel. A worker never panics on job failure; everything is
//! surfaced through the recorded return code.

use std::collections::BTreeMap;
use std::io::{self, Write};
use std::path::PathBuf;
use std::process::{self, Stdio};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use crossbeam::channel::{Receiver, Sender};
use depgraph::{Action, PackageId};
use thiserror::Error;

use crate::signal;

/// One unit of work for the pool
#[derive(Debug, Clone)]
pub struct Task {
    pub target: PackageId,
    pub action: Action,
}

/// Command line and environment composed for the install children
///
/// Children never inherit ad-hoc mutations of the parent environment; they
/// get exactly the variable map built during startup.
#[derive(Debug, Clone)]
pub struct Executor {
    program: String,
    args: Vec<String>,
    vars: BTreeMap<String, String>,
}

impl Executor {
    pub fn new(program: String, args: Vec<String>, vars: BTreeMap<String, String>) -> Self {
        Self {
            program,
            args,
            vars,
        }
    }

    /// Compose the executor command for `target`. `--nodeps` stops the
    /// executor from re-resolving; ordering is ours to enforce.
    ///
    /// An uninstall reaching dispatch had no replacement merge to fold
    /// into, so the executor is asked to remove the package rather than
    /// install it.
    pub fn command(&self, target: &PackageId, action: Action) -> process::Command {
        let mut command = process::Command::new(&self.program);
        command.args(&self.args);
        if action == Action::Uninstall {
            command.arg("--unmerge");
        }
        command
            .arg("--nodeps")
            .arg(format!("={target}"))
            .env_clear()
            .envs(&self.vars)
            .stdin(Stdio::null());
        command
    }
}

/// Record of one dispatched install job
#[derive(Debug, Clone)]
pub struct JobState {
    pub target: PackageId,
    /// Short package name, used to label log output
    pub pkgname: String,
    pub done: bool,
    pub retcode: Option<i32>,
    pub log_path: PathBuf,
    pub start: Instant,
    /// When the last "still building" notice went out
    pub last_notify: Instant,
    /// When the job's log was last dumped
    pub last_output: Option<Instant>,
}

impl JobState {
    fn started(target: PackageId, log_path: PathBuf) -> Self {
        let start = Instant::now();
        Self {
            pkgname: target.short_name().to_owned(),
            target,
            done: false,
            retcode: None,
            log_path,
            start,
            last_notify: start,
            last_output: None,
        }
    }
}

pub struct Pool {
    workers: Vec<JoinHandle<()>>,
}

impl Pool {
    /// Spawn `procs` workers consuming from `tasks`
    pub fn new(
        procs: usize,
        tasks: Receiver<Option<Task>>,
        requeue: Sender<Option<Task>>,
        results: Sender<JobState>,
        executor: Executor,
    ) -> Result<Self, Error> {
        let workers = (0..procs)
            .map(|i| {
                let tasks = tasks.clone();
                let requeue = requeue.clone();
                let results = results.clone();
                let executor = executor.clone();

                thread::Builder::new()
                    .name(format!("worker-{i}"))
                    .spawn(move || serve(&tasks, &requeue, &results, &executor))
            })
            .collect::<Result<Vec<_>, _>>()
            .map_err(Error::Spawn)?;

        Ok(Self { workers })
    }

    /// Wait for every worker to exit
    pub fn join(self) {
        for worker in self.workers {
            let _ = worker.join();
        }
    }
}

fn serve(
    tasks: &Receiver<Option<Task>>,
    requeue: &Sender<Option<Task>>,
    results: &Sender<JobState>,
    executor: &Executor,
) {
    loop {
        let Ok(task) = tasks.recv() else {
            return;
        };
        let Some(task) = task else {
            // Sentinel: repost so sibling workers exit too
            let _ = requeue.send(None);
            return;
        };
        if signal::killed() {
            return;
        }

        let (log, mut job) = open_log(task.target.clone());
        if results.send(job.clone()).is_err() {
            return;
        }
        if signal::killed() {
            return;
        }

        let retcode = match log {
            Some(mut file) => match run_child(executor, &task, &file) {
                Ok(status) => status.code().unwrap_or(1),
                Err(error) => {
                    let _ = writeln!(file, "pmerge: failed to run install executor: {error}");
                    1
                }
            },
            None => 1,
        };

        if signal::killed() {
            return;
        }

        job.done = true;
        job.retcode = Some(retcode);
        if results.send(job).is_err() {
            return;
        }
    }
}

/// Create the job's log file. Creation failure falls back to /dev/null so
/// the job still runs its lifecycle and reports failure via retcode.
fn open_log(target: PackageId) -> (Option<std::fs::File>, JobState) {
    let created = tempfile::Builder::new()
        .prefix(&format!("{}-", target.short_name()))
        .suffix(".log")
        .tempfile();

    match created.map(|file| file.keep()) {
        Ok(Ok((file, path))) => {
            let job = JobState::started(target, path);
            (Some(file), job)
        }
        _ => (None, JobState::started(target, PathBuf::from("/dev/null"))),
    }
}

/// Fork the executor for `task` with stdout and stderr captured to the
/// job log and stdin pointed at /dev/null
fn run_child(
    executor: &Executor,
    task: &Task,
    log: &std::fs::File,
) -> io::Result<process::ExitStatus> {
    let mut command = executor.command(&task.target, task.action);
    command.stdout(log.try_clone()?).stderr(log.try_clone()?);
    command.spawn()?.wait()
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("spawn worker")]
    Spawn(#[source] io::Error),
}
