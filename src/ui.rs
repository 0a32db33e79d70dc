// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Progress reporting affordances handed to running steps.

use std::{
    io::{BufRead, Write},
    process::Stdio,
};

use indicatif::ProgressBar;

/// The interface a running step uses to tell the operator what it is doing.
pub trait Ui {
    /// Replaces the detail text shown next to the current step's label.
    fn set_substep(&self, substep: &str);

    /// Where child processes launched by the step should send their output.
    fn stdout_target(&self) -> Stdio;
}

/// The UI for a step drawn as a spinner by the script runner.
pub struct ProgressUi<'a> {
    pub(crate) bar: &'a ProgressBar,
    pub(crate) label: &'a str,
    pub(crate) interactive: bool,
}

impl Ui for ProgressUi<'_> {
    fn set_substep(&self, substep: &str) {
        log::info!("{}: {}", self.label, substep);
        self.bar.set_message(format!("{}: {}", self.label, substep));
    }

    fn stdout_target(&self) -> Stdio {
        if self.interactive {
            Stdio::piped()
        } else {
            Stdio::inherit()
        }
    }
}

/// A UI that only logs. Used by subcommands that don't draw progress bars.
pub struct LogUi;

impl Ui for LogUi {
    fn set_substep(&self, substep: &str) {
        log::info!("{}", substep);
    }

    fn stdout_target(&self) -> Stdio {
        Stdio::null()
    }
}

/// Asks the operator a yes/no question on the terminal. Anything but an
/// explicit "y" or "yes" is a no.
pub fn confirm(question: &str) -> std::io::Result<bool> {
    print!("{question} [y/N] ");
    std::io::stdout().flush()?;
    let mut answer = String::new();
    std::io::stdin().lock().read_line(&mut answer)?;
    Ok(matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes"))
}
