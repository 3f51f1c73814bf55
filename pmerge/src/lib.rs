// SPDX-FileCopyrightText: Copyright © 2020-2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0
pub use self::env::Env;
pub use self::queue::JobQueue;
pub use self::worker::{Executor, JobState, Pool};

pub mod env;
pub mod printer;
pub mod queue;
pub mod resolver;
pub mod signal;
pub mod style;
pub mod util;
pub mod worker;
