// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Cooperative cancellation for the run's wait loops.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use anyhow::Context as _;
use signal_hook::{
    consts::{SIGINT, SIGTERM},
    flag,
};

/// Exit status used when a second signal arrives before the run has wound
/// down: 128 + SIGINT, as a shell would report it.
const FORCED_EXIT: i32 = 130;

/// A flag that wait loops poll between sleeps. Cloning shares the flag.
#[derive(Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a token that also trips when the process receives SIGINT or
    /// SIGTERM. A second signal terminates the process immediately.
    pub fn with_interrupt_handler() -> anyhow::Result<Self> {
        Self::on_signals(&[SIGINT, SIGTERM])
    }

    fn on_signals(signals: &[i32]) -> anyhow::Result<Self> {
        let token = Self::new();
        for &signal in signals {
            let context = || format!("installing signal {signal} handler");
            // Registered first so it sees the flag as it was before this
            // delivery.
            flag::register_conditional_shutdown(
                signal,
                FORCED_EXIT,
                Arc::clone(&token.flag),
            )
            .with_context(context)?;
            flag::register(signal, Arc::clone(&token.flag))
                .with_context(context)?;
        }
        Ok(token)
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use signal_hook::{consts::SIGUSR2, low_level::raise};

    #[test]
    fn clones_share_the_flag() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(!clone.is_cancelled());
        token.cancel();
        assert!(clone.is_cancelled());
    }

    #[test]
    fn first_signal_trips_the_token() {
        let token = CancelToken::on_signals(&[SIGUSR2]).unwrap();
        let clone = token.clone();
        assert!(!clone.is_cancelled());
        raise(SIGUSR2).unwrap();
        assert!(clone.is_cancelled());
    }
}
