// SPDX-FileCopyrightText: Copyright © 2020-2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

use std::num::NonZeroUsize;
use std::thread;
use std::time::Duration;

pub fn num_cpus() -> NonZeroUsize {
    thread::available_parallelism().unwrap_or_else(|_| NonZeroUsize::new(1).unwrap())
}

pub fn is_root() -> bool {
    use nix::unistd::Uid;

    Uid::effective().is_root()
}

/// 1, 5 and 15 minute load averages, when the platform reports them
pub fn load_average() -> Option<(f64, f64, f64)> {
    let mut loads = [0f64; 3];
    let written = unsafe { libc::getloadavg(loads.as_mut_ptr(), 3) };
    (written == 3).then_some((loads[0], loads[1], loads[2]))
}

/// Format an elapsed duration as `XmY.Ys`
pub fn time_span(duration: Duration) -> String {
    let seconds = duration.as_secs_f64();
    format!("{}m{:.1}s", (seconds / 60.0) as u64, seconds % 60.0)
}
