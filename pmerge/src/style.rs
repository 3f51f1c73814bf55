// SPDX-FileCopyrightText: Copyright © 2020-2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Terminal styling which degrades to plain text when stdout is piped

use std::io::stdout;

use crossterm::style::Stylize;
use crossterm::tty::IsTty;

pub fn accent(text: &str) -> String {
    styled(text, |t| t.bold().to_string())
}

pub fn dim(text: &str) -> String {
    styled(text, |t| t.dim().to_string())
}

pub fn warning(text: &str) -> String {
    styled(text, |t| t.yellow().to_string())
}

pub fn failure(text: &str) -> String {
    styled(text, |t| t.red().to_string())
}

fn styled(text: &str, apply: impl FnOnce(&str) -> String) -> String {
    if stdout().is_tty() {
        apply(text)
    } else {
        text.to_owned()
    }
}
