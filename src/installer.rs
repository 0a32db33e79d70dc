// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Drives the guest operating system's text installer over its serial
//! console.
//!
//! The installer has no programmatic interface, so the driver reads console
//! output and answers prompts as an operator would. The conversation is an
//! explicit table of (stage, prompt pattern, reply, next stage) rows. In each
//! stage the driver waits for one of that stage's prompts; rows that keep the
//! stage unchanged answer prompts that may or may not appear, or may appear
//! in any order, while rows that change it mark a point the installation must
//! pass through. A stage that sees none of its prompts within its time limit,
//! or a console that closes early, fails the installation.

use std::time::{Duration, Instant};

use anyhow::Context as _;
use regex::Regex;

use crate::{
    cancel::CancelToken,
    console::{Console, ConsoleRead},
    error::{Cancelled, FatalInstallError},
    secrets::Secret,
    shell::sh_quote,
    ui::Ui,
};

/// How much unmatched console output to keep around.
const MAX_BUFFERED_OUTPUT: usize = 64 * 1024;

/// How much of the most recent output to quote in a failure.
const FAILURE_CONTEXT: usize = 400;

/// Longest single read, so cancellation is noticed promptly.
const READ_SLICE: Duration = Duration::from_millis(500);

/// Printed by the shell once the host key is in place.
const KEY_INSTALLED: &str = "cibox-key-installed";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Stage {
    /// The boot loader, still talking to the default console.
    BootLoader,

    /// The boot loader after switching to the serial console.
    SerialBootLoader,

    Welcome,
    SystemIdentity,
    Network,
    Accounts,
    Disks,
    SetSelection,
    ConfirmSets,
    InstallingSets,
    Completed,
    InstallerShell,
    AuthorizedKey,

    /// The new system has been told to power off. Terminal.
    PoweringOff,
}

impl Stage {
    fn name(self) -> &'static str {
        match self {
            Stage::BootLoader => "boot loader",
            Stage::SerialBootLoader => "serial boot loader",
            Stage::Welcome => "welcome",
            Stage::SystemIdentity => "system identity",
            Stage::Network => "network",
            Stage::Accounts => "accounts",
            Stage::Disks => "disks",
            Stage::SetSelection => "set selection",
            Stage::ConfirmSets => "set confirmation",
            Stage::InstallingSets => "installing sets",
            Stage::Completed => "completion",
            Stage::InstallerShell => "installer shell",
            Stage::AuthorizedKey => "authorized key",
            Stage::PoweringOff => "power off",
        }
    }

    /// How long to wait for any of this stage's prompts.
    fn timeout(self) -> Duration {
        match self {
            // Firmware, then loading the installer kernel from the CD.
            Stage::BootLoader | Stage::Welcome => Duration::from_secs(5 * 60),
            // Extracting the sets onto disk.
            Stage::InstallingSets => Duration::from_secs(45 * 60),
            _ => Duration::from_secs(2 * 60),
        }
    }
}

/// What to type in response to a prompt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Reply {
    Line(&'static str),
    Hostname,
    RootPassword,
    AuthorizeHostKey,
    PowerOff,

    /// Just observe the prompt.
    Nothing,
}

/// Values the dialogue fills into its replies.
pub struct InstallInputs {
    pub hostname: String,
    pub root_password: Secret,

    /// The host's SSH public key, authorized for root on the new system.
    pub public_key: String,
}

struct Row {
    stage: Stage,
    prompt: Regex,
    reply: Reply,
    next: Stage,
}

/// The installer conversation.
pub struct Dialogue {
    rows: Vec<Row>,
}

impl Dialogue {
    pub fn new() -> anyhow::Result<Self> {
        use Reply::*;
        use Stage::*;

        let key_installed = format!("(?m)^{KEY_INSTALLED}");

        #[rustfmt::skip]
        let table: &[(Stage, &str, Reply, Stage)] = &[
            (BootLoader, r"boot>", Line("set tty com0"), SerialBootLoader),
            (SerialBootLoader, r"boot>", Line("boot"), Welcome),

            (Welcome, r"\(I\)nstall, \(U\)pgrade, \(A\)utoinstall or \(S\)hell\?", Line("i"), SystemIdentity),

            (SystemIdentity, r"Terminal type\?", Line("vt220"), SystemIdentity),
            (SystemIdentity, r"Choose your keyboard layout", Line(""), SystemIdentity),
            (SystemIdentity, r"System hostname\?", Hostname, Network),

            (Network, r"Network interface to configure\?.*\[vio0\]", Line("vio0"), Network),
            (Network, r"IPv4 address for vio0\?", Line("autoconf"), Network),
            (Network, r"IPv6 address for vio0\?", Line("none"), Network),
            (Network, r"Network interface to configure\?.*\[done\]", Line("done"), Accounts),

            (Accounts, r"Password for root account\? \(will not echo\)", RootPassword, Accounts),
            (Accounts, r"Password for root account\? \(again\)", RootPassword, Accounts),
            (Accounts, r"Start sshd\(8\) by default\?", Line("yes"), Accounts),
            (Accounts, r"Do you expect to run the X Window System\?", Line("no"), Accounts),
            (Accounts, r"Change the default console to com0\?", Line("yes"), Accounts),
            (Accounts, r"Which speed should com0 use\?", Line("115200"), Accounts),
            (Accounts, r"Setup a user\?", Line("no"), Accounts),
            (Accounts, r"Allow root ssh login\?", Line("prohibit-password"), Disks),

            (Disks, r"What timezone are you in\?", Line("UTC"), Disks),
            (Disks, r"Which disk is the root disk\?", Line("sd0"), Disks),
            (Disks, r"Encrypt the root disk with a \(p\)assphrase", Line("no"), Disks),
            (Disks, r"Use \(W\)hole disk MBR, whole disk \(G\)PT", Line("whole"), Disks),
            (Disks, r"Use \(A\)uto layout, \(E\)dit auto layout", Line("a"), Disks),
            (Disks, r"Which disk do you wish to initialize\?", Line("done"), Disks),
            (Disks, r"Location of sets\?.*\[cd0\]", Line("cd0"), SetSelection),

            (SetSelection, r"Pathname to the sets\?", Line(""), SetSelection),
            (SetSelection, r"Set name\(s\)\?", Line("-game* -x*"), ConfirmSets),
            (ConfirmSets, r"Set name\(s\)\?", Line("done"), InstallingSets),

            (InstallingSets, r"Continue without verification\?", Line("yes"), InstallingSets),
            (InstallingSets, r"Location of sets\?.*\[done\]", Line("done"), InstallingSets),
            (InstallingSets, r"Time appears wrong\. Set to", Line("yes"), InstallingSets),
            (InstallingSets, r"CONGRATULATIONS!", Nothing, Completed),

            (Completed, r"Exit to \(S\)hell, \(H\)alt or \(R\)eboot\?", Line("s"), InstallerShell),
            (InstallerShell, r"(?m)^# ", AuthorizeHostKey, AuthorizedKey),
            (AuthorizedKey, key_installed.as_str(), PowerOff, PoweringOff),
        ];

        let rows = table
            .iter()
            .map(|(stage, prompt, reply, next)| {
                Ok(Row {
                    stage: *stage,
                    prompt: Regex::new(prompt).with_context(|| {
                        format!("compiling installer prompt {prompt:?}")
                    })?,
                    reply: *reply,
                    next: *next,
                })
            })
            .collect::<anyhow::Result<Vec<_>>>()?;

        Ok(Self { rows })
    }

    /// Finds the row of `stage` whose prompt appears earliest in `output`,
    /// and the offset just past the matched prompt.
    fn next_prompt(&self, stage: Stage, output: &str) -> Option<(&Row, usize)> {
        self.rows
            .iter()
            .filter(|row| row.stage == stage)
            .filter_map(|row| {
                row.prompt.find(output).map(|m| (row, m.start(), m.end()))
            })
            .min_by_key(|(_, start, _)| *start)
            .map(|(row, _, end)| (row, end))
    }
}

/// A reply ready to be typed, and how it may be shown in logs.
struct Rendered {
    line: String,
    display: String,
}

fn render(reply: Reply, inputs: &InstallInputs) -> Option<Rendered> {
    let plain = |line: String| Rendered { display: line.clone(), line };
    match reply {
        Reply::Line(line) => Some(plain(line.to_string())),
        Reply::Hostname => Some(plain(inputs.hostname.clone())),
        Reply::RootPassword => Some(Rendered {
            line: inputs.root_password.expose().to_string(),
            display: inputs.root_password.to_string(),
        }),
        Reply::AuthorizeHostKey => Some(plain(format!(
            "mkdir -p -m 700 /mnt/root/.ssh && echo {} >> \
            /mnt/root/.ssh/authorized_keys && chmod 600 \
            /mnt/root/.ssh/authorized_keys && echo {KEY_INSTALLED}",
            sh_quote(&inputs.public_key)
        ))),
        Reply::PowerOff => Some(plain("sync; halt -p".to_string())),
        Reply::Nothing => None,
    }
}

/// The last `max` bytes of `s`, cut at a character boundary.
fn tail(s: &str, max: usize) -> &str {
    let mut start = s.len().saturating_sub(max);
    while !s.is_char_boundary(start) {
        start += 1;
    }
    &s[start..]
}

pub struct InstallerDriver<'a> {
    dialogue: &'a Dialogue,
    inputs: &'a InstallInputs,
    cancel: &'a CancelToken,

    /// Guidance attached to failures: where to look next.
    console_log_hint: String,

    /// Caps every stage's time limit.
    timeout_cap: Option<Duration>,
}

impl<'a> InstallerDriver<'a> {
    pub fn new(
        dialogue: &'a Dialogue,
        inputs: &'a InstallInputs,
        cancel: &'a CancelToken,
        console_log_hint: impl Into<String>,
    ) -> Self {
        Self {
            dialogue,
            inputs,
            cancel,
            console_log_hint: console_log_hint.into(),
            timeout_cap: None,
        }
    }

    /// Caps every stage's time limit at `cap`, if given.
    pub fn with_timeout_cap(mut self, cap: Option<Duration>) -> Self {
        self.timeout_cap = cap;
        self
    }

    fn stage_timeout(&self, stage: Stage) -> Duration {
        match self.timeout_cap {
            Some(cap) => stage.timeout().min(cap),
            None => stage.timeout(),
        }
    }

    fn failure(
        &self,
        stage: Stage,
        reason: String,
        output: &str,
    ) -> anyhow::Error {
        let mut error = FatalInstallError::new(format!(
            "{reason} during the '{}' stage",
            stage.name()
        ));

        let recent = tail(output, FAILURE_CONTEXT).trim();
        if !recent.is_empty() {
            error = error.with_guidance(format!(
                "last console output: {:?}",
                recent
            ));
        }

        error
            .with_guidance(self.console_log_hint.clone())
            .with_guidance(
                "re-run 'cibox provision' to start the installation over",
            )
            .into()
    }

    /// Runs the installer conversation to completion. On success the guest
    /// has been told to power off.
    pub fn run(
        &self,
        console: &mut dyn Console,
        ui: &dyn Ui,
    ) -> anyhow::Result<()> {
        let mut stage = Stage::BootLoader;
        let mut output = String::new();
        let mut stage_started = Instant::now();
        ui.set_substep(&format!("installer: {}", stage.name()));

        while stage != Stage::PoweringOff {
            if self.cancel.is_cancelled() {
                return Err(Cancelled {
                    what: format!("installer ({} stage)", stage.name()),
                }
                .into());
            }

            if let Some((row, end)) = self.dialogue.next_prompt(stage, &output)
            {
                let prompt = output[..end].trim_end().to_string();
                output.drain(..end);

                if let Some(reply) = render(row.reply, self.inputs) {
                    log::info!(
                        "installer: {:?} -> {:?}",
                        tail(&prompt, 120),
                        reply.display
                    );
                    console.send_line(&reply.line).map_err(|e| {
                        self.failure(
                            stage,
                            format!("could not type into the console ({e})"),
                            &prompt,
                        )
                    })?;
                }

                if row.next != stage {
                    stage = row.next;
                    ui.set_substep(&format!("installer: {}", stage.name()));
                }

                // Any prompt counts as progress.
                stage_started = Instant::now();
                continue;
            }

            let elapsed = stage_started.elapsed();
            let limit = self.stage_timeout(stage);
            if elapsed >= limit {
                return Err(self.failure(
                    stage,
                    format!(
                        "no expected installer prompt appeared within \
                        {limit:?}"
                    ),
                    &output,
                ));
            }

            match console.read((limit - elapsed).min(READ_SLICE)) {
                Ok(ConsoleRead::Data(data)) => {
                    output.push_str(&data);
                    if output.len() > MAX_BUFFERED_OUTPUT {
                        output = tail(&output, MAX_BUFFERED_OUTPUT / 2)
                            .to_string();
                    }
                }
                Ok(ConsoleRead::Timeout) => {}
                Ok(ConsoleRead::Closed) => {
                    return Err(self.failure(
                        stage,
                        "the console closed before installation finished"
                            .to_string(),
                        &output,
                    ));
                }
                Err(e) => {
                    return Err(self.failure(
                        stage,
                        format!("reading the console failed ({e})"),
                        &output,
                    ));
                }
            }
        }

        ui.set_substep("installer: complete");
        Ok(())
    }
}
