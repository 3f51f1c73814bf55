// SPDX-FileCopyrightText: Copyright © 2020-2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Single consumer of the print channel
//!
//! Everything written to the controlling terminal during a run flows
//! through here, so log sections from different jobs are never
//! interleaved. Per-file read cursors let partial output from a running
//! job continue where the previous dump stopped.

use std::collections::HashMap;
use std::io::{self, BufRead, BufReader, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::thread::{self, JoinHandle};

use crossbeam::channel::Receiver;
use fs_err as fs;
use thiserror::Error;

use crate::util;
use crate::worker::JobState;

pub enum Message {
    /// Print a single line
    Line(String),
    /// Print new output from a job's log file, deleting it afterwards
    /// when `unlink` is set
    Job { job: JobState, unlink: bool },
}

pub struct Printer {
    thread: JoinHandle<Result<(), Error>>,
}

impl Printer {
    /// Spawn the printer thread. It drains `messages` until every sender
    /// has been dropped.
    pub fn spawn(messages: Receiver<Message>) -> Result<Self, Error> {
        let thread = thread::Builder::new()
            .name("printer".into())
            .spawn(move || serve(&messages))
            .map_err(Error::Spawn)?;

        Ok(Self { thread })
    }

    pub fn join(self) -> Result<(), Error> {
        self.thread.join().map_err(|_| Error::Panicked)?
    }
}

fn serve(messages: &Receiver<Message>) -> Result<(), Error> {
    // Byte offset of the last complete line printed from each log file
    let mut seek_locations = HashMap::new();
    let mut out = io::stdout();

    while let Ok(message) = messages.recv() {
        let result = print(&mut out, &message, &mut seek_locations).and_then(|()| out.flush());
        match result {
            // A signal interrupted the write; keep printing
            Err(error) if error.kind() == io::ErrorKind::Interrupted => continue,
            other => other?,
        }
    }

    Ok(())
}

fn print(
    out: &mut impl Write,
    message: &Message,
    seek_locations: &mut HashMap<PathBuf, u64>,
) -> io::Result<()> {
    match message {
        Message::Line(line) => writeln!(out, "{line}"),
        Message::Job { job, unlink } => print_job(out, job, *unlink, seek_locations),
    }
}

/// Print output accumulated in `job`'s log since our last visit, each line
/// prefixed with the package name
///
/// The cursor only advances past complete lines; a partial trailing line
/// is shown but re-read on the next visit, once the child finished it.
fn print_job(
    out: &mut impl Write,
    job: &JobState,
    unlink: bool,
    seek_locations: &mut HashMap<PathBuf, u64>,
) -> io::Result<()> {
    let info = format!(
        "job {} ({})",
        job.pkgname,
        util::time_span(job.start.elapsed())
    );

    let mut cursor = seek_locations.get(&job.log_path).copied().unwrap_or(0);
    if cursor == 0 {
        writeln!(out, "=== Start output for {info} ===")?;
    } else {
        writeln!(out, "=== Continue output for {info} ===")?;
    }

    let mut file = fs::File::open(&job.log_path)?;
    file.seek(SeekFrom::Start(cursor))?;
    let mut reader = BufReader::new(file);

    let mut buffer = Vec::new();
    loop {
        buffer.clear();
        let read = reader.read_until(b'\n', &mut buffer)?;
        if read == 0 {
            break;
        }
        if buffer.last() == Some(&b'\n') {
            cursor += read as u64;
            buffer.pop();
        }
        writeln!(out, "{}: {}", job.pkgname, String::from_utf8_lossy(&buffer))?;
    }
    seek_locations.insert(job.log_path.clone(), cursor);

    if job.done {
        writeln!(out, "=== Complete: {info} ===")?;
    } else {
        writeln!(out, "=== Still running: {info} ===")?;
    }

    if unlink {
        fs::remove_file(&job.log_path)?;
    }

    Ok(())
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("io")]
    Io(#[from] io::Error),

    #[error("spawn printer")]
    Spawn(#[source] io::Error),

    #[error("printer panicked")]
    Panicked,
}

#[cfg(test)]
mod test {
    use std::io::Write as _;
    use std::time::Instant;

    use depgraph::PackageId;

    use super::*;

    fn job(path: PathBuf, done: bool) -> JobState {
        let start = Instant::now();
        JobState {
            target: PackageId::from("cat/pkg-1.0"),
            pkgname: "pkg-1.0".to_owned(),
            done,
            retcode: done.then_some(0),
            log_path: path,
            start,
            last_notify: start,
            last_output: None,
        }
    }

    #[test]
    fn cursor_stops_at_last_complete_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pkg.log");
        fs::write(&path, "one\ntwo\npartial").unwrap();

        let mut seek_locations = HashMap::new();
        let mut out = Vec::new();
        print_job(&mut out, &job(path.clone(), false), false, &mut seek_locations).unwrap();

        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("=== Start output for job pkg-1.0"));
        assert!(text.contains("pkg-1.0: one\n"));
        assert!(text.contains("pkg-1.0: partial\n"));
        assert!(text.contains("=== Still running:"));

        // Cursor sits after "one\ntwo\n", not after the partial line
        assert_eq!(seek_locations[&path], 8);
    }

    #[test]
    fn second_visit_continues_from_cursor() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pkg.log");
        fs::write(&path, "one\n").unwrap();

        let mut seek_locations = HashMap::new();
        print_job(&mut Vec::new(), &job(path.clone(), false), false, &mut seek_locations).unwrap();

        let mut file = fs::OpenOptions::new().append(true).open(&path).unwrap();
        writeln!(file, "two").unwrap();

        let mut out = Vec::new();
        print_job(&mut out, &job(path.clone(), true), false, &mut seek_locations).unwrap();

        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("=== Continue output for job pkg-1.0"));
        assert!(!text.contains("pkg-1.0: one"));
        assert!(text.contains("pkg-1.0: two\n"));
        assert!(text.contains("=== Complete:"));
    }

    #[test]
    fn unlink_removes_the_log() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pkg.log");
        fs::write(&path, "done\n").unwrap();

        let mut seek_locations = HashMap::new();
        print_job(&mut Vec::new(), &job(path.clone(), true), true, &mut seek_locations).unwrap();

        assert!(!path.exists());
    }
}
