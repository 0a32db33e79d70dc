// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Bounded readiness polling.
//!
//! Every suspension point in a run (waiting for the guest to boot, for its
//! SSH service, for the CI server, for a shutdown) goes through
//! [`poll_until`]: the probe is retried with exponential backoff until it
//! succeeds, the time budget runs out, or the run is cancelled. Long waits
//! periodically report how long they have been waiting so that a slow guest
//! can be told apart from a hung one.

use std::time::{Duration, Instant};

use crate::{
    cancel::CancelToken,
    error::{Cancelled, ReadinessTimeout},
    ui::Ui,
};

/// Granularity at which sleeps check for cancellation.
const CANCEL_CHECK_INTERVAL: Duration = Duration::from_millis(100);

/// The shape of one bounded wait.
#[derive(Clone, Copy, Debug)]
pub struct Backoff {
    /// Delay after the first failed probe.
    pub initial: Duration,

    /// Upper bound on the delay between probes.
    pub max: Duration,

    /// Total time after which the wait gives up.
    pub budget: Duration,

    /// How often to report elapsed time while waiting.
    pub report_every: Duration,
}

impl Backoff {
    /// The guest's SSH service. Boot time under emulation varies wildly, so
    /// this is generous.
    pub const GUEST_SHELL: Backoff = Backoff {
        initial: Duration::from_secs(2),
        max: Duration::from_secs(15),
        budget: Duration::from_secs(5 * 60),
        report_every: Duration::from_secs(15),
    };

    /// The CI server's first start unpacks its archive and loads plugins.
    pub const CI_SERVER: Backoff = Backoff {
        initial: Duration::from_secs(3),
        max: Duration::from_secs(20),
        budget: Duration::from_secs(10 * 60),
        report_every: Duration::from_secs(20),
    };

    /// An in-guest power-off request.
    pub const SHUTDOWN: Backoff = Backoff {
        initial: Duration::from_millis(500),
        max: Duration::from_secs(3),
        budget: Duration::from_secs(90),
        report_every: Duration::from_secs(10),
    };

    /// The hypervisor process exiting after SIGTERM.
    pub const TERMINATE: Backoff = Backoff {
        initial: Duration::from_millis(100),
        max: Duration::from_secs(1),
        budget: Duration::from_secs(10),
        report_every: Duration::from_secs(5),
    };

    /// The installer powering the guest off once installation completes.
    pub const INSTALLER_POWER_OFF: Backoff = Backoff {
        initial: Duration::from_secs(1),
        max: Duration::from_secs(5),
        budget: Duration::from_secs(3 * 60),
        report_every: Duration::from_secs(15),
    };

    /// The QEMU serial console socket appearing after launch.
    pub const CONSOLE: Backoff = Backoff {
        initial: Duration::from_millis(250),
        max: Duration::from_secs(1),
        budget: Duration::from_secs(30),
        report_every: Duration::from_secs(5),
    };

    /// A backoff for tests: fast, but with the same control flow.
    #[cfg(test)]
    pub const fn quick(budget_ms: u64) -> Backoff {
        Backoff {
            initial: Duration::from_millis(1),
            max: Duration::from_millis(5),
            budget: Duration::from_millis(budget_ms),
            report_every: Duration::from_millis(10),
        }
    }
}

/// Sleeps for `duration`, waking early if `cancel` trips. Returns `false` if
/// the sleep was cut short.
pub fn sleep_unless_cancelled(
    duration: Duration,
    cancel: &CancelToken,
) -> bool {
    let deadline = Instant::now() + duration;
    loop {
        if cancel.is_cancelled() {
            return false;
        }

        let now = Instant::now();
        if now >= deadline {
            return true;
        }

        std::thread::sleep((deadline - now).min(CANCEL_CHECK_INTERVAL));
    }
}

/// Calls `probe` until it returns `Ok`, backing off between attempts.
///
/// A probe error means "not ready yet"; the most recent one is included in
/// the [`ReadinessTimeout`] returned when the budget runs out. If `cancel`
/// trips, returns [`Cancelled`] instead.
pub fn poll_until<T>(
    what: &str,
    backoff: &Backoff,
    cancel: &CancelToken,
    ui: &dyn Ui,
    mut probe: impl FnMut() -> anyhow::Result<T>,
) -> anyhow::Result<T> {
    let start = Instant::now();
    let mut delay = backoff.initial;
    let mut last_report = start;

    loop {
        if cancel.is_cancelled() {
            return Err(Cancelled { what: what.to_owned() }.into());
        }

        let last_error = match probe() {
            Ok(value) => {
                log::info!(
                    "{what} ready after {}s",
                    start.elapsed().as_secs()
                );
                return Ok(value);
            }
            Err(e) => {
                log::debug!("{what} not ready: {e:#}");
                format!("{e:#}")
            }
        };

        let elapsed = start.elapsed();
        if elapsed >= backoff.budget {
            return Err(ReadinessTimeout {
                what: what.to_owned(),
                waited: elapsed,
                last_error: Some(last_error),
            }
            .into());
        }

        if last_report.elapsed() >= backoff.report_every {
            ui.set_substep(&format!(
                "waiting for {what} ({}s elapsed)",
                elapsed.as_secs()
            ));
            last_report = Instant::now();
        }

        let remaining = backoff.budget - elapsed;
        if !sleep_unless_cancelled(delay.min(remaining), cancel) {
            return Err(Cancelled { what: what.to_owned() }.into());
        }

        delay = (delay * 2).min(backoff.max);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::ui::LogUi;

    #[test]
    fn returns_once_probe_succeeds() {
        let mut attempts = 0;
        let value = poll_until(
            "thing",
            &Backoff::quick(1000),
            &CancelToken::new(),
            &LogUi,
            || {
                attempts += 1;
                if attempts < 3 {
                    anyhow::bail!("not yet");
                }
                Ok(attempts)
            },
        )
        .unwrap();

        assert_eq!(value, 3);
    }

    #[test]
    fn gives_up_after_budget() {
        let err = poll_until(
            "never",
            &Backoff::quick(30),
            &CancelToken::new(),
            &LogUi,
            || -> anyhow::Result<()> { anyhow::bail!("connection refused") },
        )
        .unwrap_err();

        let timeout = err.downcast_ref::<ReadinessTimeout>().unwrap();
        assert_eq!(timeout.what, "never");
        assert_eq!(timeout.last_error.as_deref(), Some("connection refused"));
    }

    #[test]
    fn timeout_carries_the_latest_probe_error() {
        let mut attempts = 0;
        let err = poll_until(
            "flapping",
            &Backoff::quick(30),
            &CancelToken::new(),
            &LogUi,
            || -> anyhow::Result<()> {
                attempts += 1;
                anyhow::bail!("attempt {attempts}")
            },
        )
        .unwrap_err();

        let timeout = err.downcast_ref::<ReadinessTimeout>().unwrap();
        let expected = format!("attempt {attempts}");
        assert!(attempts > 1);
        assert_eq!(timeout.last_error.as_deref(), Some(expected.as_str()));
    }

    #[test]
    fn cancellation_interrupts_the_wait() {
        let cancel = CancelToken::new();
        let trip = cancel.clone();
        let mut attempts = 0;
        let err = poll_until(
            "guest",
            &Backoff::quick(60_000),
            &cancel,
            &LogUi,
            || -> anyhow::Result<()> {
                attempts += 1;
                if attempts == 2 {
                    trip.cancel();
                }
                anyhow::bail!("still booting")
            },
        )
        .unwrap_err();

        assert!(err.downcast_ref::<Cancelled>().is_some());
    }
}
