// SPDX-FileCopyrightText: Copyright © 2020-2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Signal handling and process-group lifecycle
//!
//! The first interrupt or terminate records the signal and sets the shared
//! kill flag; the scheduler and workers poll it at their loop boundaries.
//! The handler then re-arms to a hard-kill variant, so a second signal
//! takes down the whole process group.

use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};

use nix::errno::Errno;
use nix::sys::signal::{killpg, sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::unistd::{setpgid, Pid};
use thiserror::Error;

static KILLED: AtomicBool = AtomicBool::new(false);
static SIGNUM: AtomicI32 = AtomicI32::new(0);

/// Whether a terminating signal has been observed
pub fn killed() -> bool {
    KILLED.load(Ordering::SeqCst)
}

/// The signal which set the kill flag
pub fn signum() -> Option<i32> {
    match SIGNUM.load(Ordering::SeqCst) {
        0 => None,
        n => Some(n),
    }
}

/// Place the process in its own process group so a group-wide kill fans
/// out to every install child. Must happen before the first worker forks.
pub fn isolate() -> Result<(), Error> {
    match setpgid(Pid::from_raw(0), Pid::from_raw(0)) {
        // A session leader already heads its own group
        Ok(()) | Err(Errno::EPERM) => Ok(()),
        Err(error) => Err(Error::ProcessGroup(error)),
    }
}

/// Install the interrupt and terminate handlers
pub fn install() -> Result<(), Error> {
    let action = SigAction::new(
        SigHandler::Handler(on_exit_signal),
        SaFlags::empty(),
        SigSet::empty(),
    );
    for signal in [Signal::SIGINT, Signal::SIGTERM] {
        unsafe { sigaction(signal, &action).map_err(Error::Install)? };
    }
    Ok(())
}

/// SIGKILL the whole process group, ourselves included
pub fn kill_group() {
    let _ = killpg(Pid::from_raw(0), Signal::SIGKILL);
}

extern "C" fn on_exit_signal(signum: i32) {
    SIGNUM.store(signum, Ordering::SeqCst);
    KILLED.store(true, Ordering::SeqCst);

    // Re-arm so we aren't called recursively; the next signal is fatal
    let action = SigAction::new(
        SigHandler::Handler(on_repeat_signal),
        SaFlags::empty(),
        SigSet::empty(),
    );
    for signal in [Signal::SIGINT, Signal::SIGTERM] {
        unsafe {
            let _ = sigaction(signal, &action);
        }
    }
}

extern "C" fn on_repeat_signal(_signum: i32) {
    kill_group();
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("create process group")]
    ProcessGroup(#[source] nix::Error),

    #[error("install signal handler")]
    Install(#[source] nix::Error),
}
