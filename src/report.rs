// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Per-step outcomes and the end-of-run summary.

use std::{io::Write, time::Duration};

use colored::Colorize;

use crate::{
    error::{Cancelled, FatalInstallError, ReadinessTimeout},
    trust::TrustReport,
};

/// Why a step failed, as far as the summary cares.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailureKind {
    /// An ordinary failure of one unit of work.
    Step,

    /// A bounded wait the step depended on expired.
    ReadinessTimeout,

    /// The operator stopped the run during the step.
    Cancelled,

    /// The failure aborts the run.
    Fatal,
}

impl FailureKind {
    /// Classifies an error by the typed error attached to it, if any.
    pub fn of(error: &anyhow::Error) -> Self {
        if error.downcast_ref::<FatalInstallError>().is_some() {
            FailureKind::Fatal
        } else if error.downcast_ref::<ReadinessTimeout>().is_some() {
            FailureKind::ReadinessTimeout
        } else if error.downcast_ref::<Cancelled>().is_some() {
            FailureKind::Cancelled
        } else {
            FailureKind::Step
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StepOutcome {
    Success,
    Failed { kind: FailureKind, reason: String },
    Skipped { reason: String },
}

impl StepOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, StepOutcome::Success)
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, StepOutcome::Failed { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        match self {
            StepOutcome::Failed { kind, .. } => *kind == FailureKind::Cancelled,
            StepOutcome::Skipped { reason } => reason == CANCELLED,
            StepOutcome::Success => false,
        }
    }
}

/// The skip reason for steps that never ran because the run was cancelled.
pub const CANCELLED: &str = "cancelled";

/// The recorded result of one step.
#[derive(Clone, Debug)]
pub struct StepRecord {
    pub name: String,
    pub optional: bool,
    pub outcome: StepOutcome,
    pub elapsed: Duration,

    /// A command the operator can run to retry this step by hand.
    pub remediation: Option<String>,

    /// Extra hints attached to a fatal failure.
    pub guidance: Vec<String>,
}

impl StepRecord {
    pub fn from_result(
        name: impl Into<String>,
        optional: bool,
        result: anyhow::Result<()>,
        elapsed: Duration,
    ) -> Self {
        let (outcome, guidance) = match result {
            Ok(()) => (StepOutcome::Success, Vec::new()),
            Err(e) => {
                let guidance = e
                    .downcast_ref::<FatalInstallError>()
                    .map(|fatal| fatal.guidance.clone())
                    .unwrap_or_default();
                let outcome = StepOutcome::Failed {
                    kind: FailureKind::of(&e),
                    reason: format!("{e:#}"),
                };
                (outcome, guidance)
            }
        };

        Self {
            name: name.into(),
            optional,
            outcome,
            elapsed,
            remediation: None,
            guidance,
        }
    }

    pub fn skipped(
        name: impl Into<String>,
        optional: bool,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            optional,
            outcome: StepOutcome::Skipped { reason: reason.into() },
            elapsed: Duration::ZERO,
            remediation: None,
            guidance: Vec::new(),
        }
    }

    pub fn with_remediation(mut self, remediation: impl Into<String>) -> Self {
        self.remediation = Some(remediation.into());
        self
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verdict {
    Success,

    /// No fatal error, but at least one step failed.
    DegradedSuccess,

    Fatal,
}

impl Verdict {
    pub fn exit_code(self) -> i32 {
        match self {
            Verdict::Success => 0,
            Verdict::Fatal => 1,
            Verdict::DegradedSuccess => 2,
        }
    }
}

/// Everything a provisioning run did, in order.
#[derive(Debug, Default)]
pub struct RunReport {
    /// The top-level phases of the run.
    pub phases: Vec<StepRecord>,

    /// The guest configuration steps, if the run got that far.
    pub install_steps: Vec<StepRecord>,

    pub trust: Option<TrustReport>,
}

impl RunReport {
    /// A run is fatal if a required phase failed or the run was cancelled.
    /// Failed guest configuration steps only degrade it.
    pub fn verdict(&self) -> Verdict {
        let fatal = self.phases.iter().any(|p| {
            (!p.optional && p.outcome.is_failure()) || p.outcome.is_cancelled()
        });

        if fatal {
            return Verdict::Fatal;
        }

        let failures = self
            .phases
            .iter()
            .chain(self.install_steps.iter())
            .filter(|r| r.outcome.is_failure())
            .count();

        if failures == 0 {
            Verdict::Success
        } else {
            Verdict::DegradedSuccess
        }
    }

    pub fn failed_install_steps(&self) -> impl Iterator<Item = &StepRecord> {
        self.install_steps.iter().filter(|r| r.outcome.is_failure())
    }

    pub fn print_summary(&self, w: &mut dyn Write) -> std::io::Result<()> {
        writeln!(w)?;
        writeln!(w, "{}", "Run summary".bold())?;
        for record in &self.phases {
            print_record(w, record, "  ")?;
        }

        if !self.install_steps.is_empty() {
            writeln!(w)?;
            writeln!(w, "{}", "Guest configuration steps".bold())?;
            for record in &self.install_steps {
                print_record(w, record, "  ")?;
            }
        }

        if let Some(trust) = &self.trust {
            writeln!(w)?;
            writeln!(w, "{}", "Trust propagation".bold())?;
            write!(w, "{trust}")?;
        }

        writeln!(w)?;
        match self.verdict() {
            Verdict::Success => {
                writeln!(w, "{}", "Provisioning succeeded.".green().bold())?
            }
            Verdict::DegradedSuccess => {
                let required_failed = self
                    .failed_install_steps()
                    .filter(|r| !r.optional)
                    .count();
                writeln!(
                    w,
                    "{}",
                    "Provisioning finished with failures (degraded success)."
                        .yellow()
                        .bold()
                )?;
                if required_failed > 0 {
                    writeln!(
                        w,
                        "{}",
                        format!(
                            "{required_failed} required guest step(s) failed; \
                            the CI environment is probably not usable until \
                            they are re-run."
                        )
                        .red()
                    )?;
                }
            }
            Verdict::Fatal => {
                writeln!(w, "{}", "Provisioning failed.".red().bold())?
            }
        }

        Ok(())
    }
}

fn print_record(
    w: &mut dyn Write,
    record: &StepRecord,
    indent: &str,
) -> std::io::Result<()> {
    let secs = record.elapsed.as_secs();
    match &record.outcome {
        StepOutcome::Success => {
            writeln!(w, "{indent}✓ {} ({secs}s)", record.name.green())
        }
        StepOutcome::Skipped { reason } => writeln!(
            w,
            "{indent}- {} {}",
            record.name.dimmed(),
            format!("(skipped: {reason})").dimmed()
        ),
        StepOutcome::Failed { reason, .. } => {
            let label = if record.optional {
                format!("{} (optional)", record.name).yellow().bold()
            } else {
                record.name.as_str().red().bold()
            };
            writeln!(w, "{indent}⚠ {label}: {reason}")?;
            for hint in &record.guidance {
                writeln!(w, "{indent}    {hint}")?;
            }
            if let Some(remediation) = &record.remediation {
                writeln!(w, "{indent}    to retry: {}", remediation.bold())?;
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn ok(name: &str) -> StepRecord {
        StepRecord::from_result(name, false, Ok(()), Duration::ZERO)
    }

    fn failed(name: &str, error: anyhow::Error) -> StepRecord {
        StepRecord::from_result(name, false, Err(error), Duration::ZERO)
    }

    #[test]
    fn classifies_typed_errors() {
        let timeout: anyhow::Error = ReadinessTimeout {
            what: "ssh".to_string(),
            waited: Duration::from_secs(300),
            last_error: None,
        }
        .into();
        assert_eq!(FailureKind::of(&timeout), FailureKind::ReadinessTimeout);

        let fatal = anyhow::Error::new(FatalInstallError::new("no prompt"))
            .context("installing guest");
        assert_eq!(FailureKind::of(&fatal), FailureKind::Fatal);

        assert_eq!(
            FailureKind::of(&anyhow::anyhow!("pkg_add failed")),
            FailureKind::Step
        );
    }

    #[test]
    fn step_failures_make_a_degraded_success() {
        let report = RunReport {
            phases: vec![ok("download"), ok("configure guest")],
            install_steps: vec![
                ok("one"),
                failed("two", anyhow::anyhow!("boom")),
                ok("three"),
            ],
            trust: None,
        };

        assert_eq!(report.verdict(), Verdict::DegradedSuccess);
        assert_eq!(report.failed_install_steps().count(), 1);

        let mut out = Vec::new();
        report.print_summary(&mut out).unwrap();
        let out = String::from_utf8(out).unwrap();
        assert!(out.contains("degraded success"));
    }

    #[test]
    fn fatal_phase_wins() {
        let report = RunReport {
            phases: vec![
                ok("download"),
                failed("install", FatalInstallError::new("timeout").into()),
                StepRecord::skipped("configure guest", false, "run aborted"),
            ],
            install_steps: vec![],
            trust: None,
        };

        assert_eq!(report.verdict(), Verdict::Fatal);
        assert_eq!(report.verdict().exit_code(), 1);
    }

    #[test]
    fn optional_phase_failures_degrade_and_cancellation_is_fatal() {
        let mut trust = failed("trust", anyhow::anyhow!("no certutil"));
        trust.optional = true;
        let mut report = RunReport {
            phases: vec![ok("download"), trust],
            install_steps: vec![],
            trust: None,
        };
        assert_eq!(report.verdict(), Verdict::DegradedSuccess);
        assert_eq!(report.verdict().exit_code(), 2);

        report.phases.push(StepRecord::skipped("token", true, CANCELLED));
        assert_eq!(report.verdict(), Verdict::Fatal);
    }
}
