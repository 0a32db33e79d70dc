// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Structs, traits, and functions for defining and running a set of scripted
//! operations.

use std::{
    io::{Read, Write},
    time::{Duration, Instant},
};

use colored::Colorize;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};

use crate::{
    cancel::CancelToken,
    report::{StepOutcome, StepRecord, CANCELLED},
    ui::{ProgressUi, Ui},
};

const PROGRESS_TICK_INTERVAL: Duration = Duration::from_millis(100);

type StepFn<C> = dyn Fn(&mut C, &dyn Ui) -> anyhow::Result<()>;

/// What the runner does when a step fails.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OnFailure {
    /// Stop the script; the remaining steps are recorded as skipped.
    Abort,

    /// Record the failure and move on to the next step.
    Continue,
}

/// A step in a scripted procedure.
pub struct ScriptStep<C> {
    /// A descriptive label for this procedure step.
    label: &'static str,

    /// The function to execute to run this procedure step.
    func: Box<StepFn<C>>,

    /// A list of commands that this step expects to launch via
    /// `[std::process::Command]`. The script runner uses these to check for
    /// missing dependencies before running the script.
    prereq_commands: Vec<&'static str>,

    on_failure: OnFailure,
}

impl<C> ScriptStep<C> {
    pub fn new(
        label: &'static str,
        func: impl Fn(&mut C, &dyn Ui) -> anyhow::Result<()> + 'static,
    ) -> Self {
        Self {
            label,
            func: Box::new(func),
            prereq_commands: Vec::new(),
            on_failure: OnFailure::Abort,
        }
    }

    pub fn with_prereqs(
        label: &'static str,
        func: impl Fn(&mut C, &dyn Ui) -> anyhow::Result<()> + 'static,
        commands: &[&'static str],
    ) -> Self {
        Self { prereq_commands: commands.to_vec(), ..Self::new(label, func) }
    }

    /// Marks this step's failure as survivable.
    pub fn continue_on_failure(mut self) -> Self {
        self.on_failure = OnFailure::Continue;
        self
    }

    pub fn label(&self) -> &'static str {
        self.label
    }

    pub fn prereq_commands(&self) -> &[&'static str] {
        self.prereq_commands.as_slice()
    }
}

/// Errors and warnings found while checking a script's prerequisites.
#[derive(Debug, Default)]
pub struct MissingPrerequisites {
    errors: Vec<String>,
    warnings: Vec<String>,
}

impl MissingPrerequisites {
    pub fn from_messages(errors: Vec<String>, warnings: Vec<String>) -> Self {
        Self { errors, warnings }
    }
}

/// Implemented by objects that can be used as scripts.
pub trait Script<C> {
    /// Yields a slice of steps that can be executed to run this script.
    fn steps(&self) -> &[ScriptStep<C>];

    fn print_configuration(&self, w: &mut dyn Write) -> std::io::Result<()>;

    fn check_prerequisites(&self) -> MissingPrerequisites;
}

/// How the runner should present a script.
pub struct RunOptions {
    pub interactive: bool,
    pub cancel: CancelToken,
}

struct StepAndProgress<'a, C> {
    step: &'a ScriptStep<C>,
    bar: ProgressBar,
}

/// Runs a script, pretty-printing its various labels and the outcomes of each
/// step, and returns a record for every step.
///
/// Returns `Err` only if the script could not start at all (unsatisfied
/// prerequisites, or the operator declined to continue). Step failures are
/// recorded instead; after a step that aborts the script fails, the rest are
/// recorded as skipped.
pub fn run_script<C>(
    script: &dyn Script<C>,
    ctx: &mut C,
    options: &RunOptions,
) -> anyhow::Result<Vec<StepRecord>> {
    let mut stdout = std::io::stdout();
    script.print_configuration(&mut stdout)?;
    println!();

    let prereqs = script.check_prerequisites();
    if !prereqs.warnings.is_empty() {
        println!("{}", "Warnings:".bold());
        for warning in &prereqs.warnings {
            println!("  {}", warning);
        }
        println!();
    }

    if !prereqs.errors.is_empty() {
        println!("{}", "Some prerequisites were not satisfied:".bold());
        for unsatisfied in &prereqs.errors {
            println!("  {}", unsatisfied);
        }

        println!();
        anyhow::bail!("some script prerequisites weren't satisfied");
    }

    if options.interactive {
        println!("Press Enter to continue or CTRL-C to cancel.");
        std::io::stdout().flush()?;
        std::io::stdin().read(&mut [0u8])?;
    }

    let multi = options.interactive.then(MultiProgress::new);
    let steps_with_progress: Vec<StepAndProgress<C>> = script
        .steps()
        .iter()
        .map(|step| {
            let bar = if let Some(multi) = &multi {
                multi.add(ProgressBar::new_spinner())
            } else {
                ProgressBar::hidden()
            };

            bar.set_message(step.label);
            bar.set_style(
                ProgressStyle::with_template("  {msg:.dim}").unwrap(),
            );
            bar.tick();
            StepAndProgress { step, bar }
        })
        .collect();

    let mut records = Vec::with_capacity(steps_with_progress.len());
    let mut abort_reason: Option<String> = None;
    for step in steps_with_progress {
        let label = step.step.label;
        let optional = step.step.on_failure == OnFailure::Continue;

        if let Some(reason) = &abort_reason {
            step.bar.finish_and_clear();
            records.push(StepRecord::skipped(label, optional, reason.clone()));
            continue;
        }

        if options.cancel.is_cancelled() {
            step.bar.finish_and_clear();
            records.push(StepRecord::skipped(label, optional, CANCELLED));
            continue;
        }

        log::info!("starting: {label}");
        if !options.interactive {
            println!("→ {label}");
        }

        step.bar.set_style(ProgressStyle::default_spinner());
        step.bar.enable_steady_tick(PROGRESS_TICK_INTERVAL);
        let ui = ProgressUi {
            bar: &step.bar,
            label,
            interactive: options.interactive,
        };

        let start = Instant::now();
        let result = (step.step.func)(ctx, &ui);
        let record =
            StepRecord::from_result(label, optional, result, start.elapsed());

        step.bar.set_message(label);
        match &record.outcome {
            StepOutcome::Success => {
                log::info!("finished: {label}");
                step.bar.set_style(
                    ProgressStyle::with_template("✓ {msg:.green}").unwrap(),
                );
                step.bar.finish();
                if !options.interactive {
                    println!("{} {label}", "✓".green());
                }
            }
            StepOutcome::Failed { reason, .. } => {
                log::warn!("{label} failed: {reason}");
                let style = if optional {
                    "⚠ {msg:.bold.yellow}"
                } else {
                    "⚠ {msg:.bold.red}"
                };
                step.bar
                    .set_style(ProgressStyle::with_template(style).unwrap());
                step.bar.finish();
                if !options.interactive {
                    println!("{} {label}: {reason}", "⚠".red());
                }

                if step.step.on_failure == OnFailure::Abort {
                    abort_reason =
                        Some(format!("run aborted after '{label}' failed"));
                }
            }
            StepOutcome::Skipped { .. } => unreachable!(),
        }

        records.push(record);
    }

    Ok(records)
}
