// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Error kinds that callers branch on. Everything else travels as a plain
//! `anyhow::Error`; these types are attached to it so the step runner can
//! classify a failure with `downcast_ref`.

use std::time::Duration;

use thiserror::Error;

/// The guest operating system could not be installed. This aborts the whole
/// run: there is no useful partial state for a half-installed guest.
#[derive(Debug, Error)]
#[error("guest operating system installation failed: {reason}")]
pub struct FatalInstallError {
    pub reason: String,

    /// Actionable hints printed beneath the failure: what to re-check and
    /// which log to inspect.
    pub guidance: Vec<String>,
}

impl FatalInstallError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self { reason: reason.into(), guidance: Vec::new() }
    }

    pub fn with_guidance(mut self, hint: impl Into<String>) -> Self {
        self.guidance.push(hint.into());
        self
    }
}

/// A bounded wait expired before the awaited dependency became usable.
#[derive(Debug, Error)]
#[error(
    "timed out after {}s waiting for {what}{}",
    .waited.as_secs(),
    last_error_suffix(.last_error)
)]
pub struct ReadinessTimeout {
    pub what: String,
    pub waited: Duration,
    pub last_error: Option<String>,
}

fn last_error_suffix(last_error: &Option<String>) -> String {
    match last_error {
        Some(e) => format!(" (last error: {e})"),
        None => String::new(),
    }
}

/// The operator asked to stop while a wait was in progress.
#[derive(Debug, Error)]
#[error("cancelled while waiting for {what}")]
pub struct Cancelled {
    pub what: String,
}

/// One or more trust targets could not be updated. Reported, never fatal.
#[derive(Debug, Error)]
#[error("CA certificate was not installed into: {}", .failed.join(", "))]
pub struct TrustPropagationPartial {
    pub failed: Vec<String>,
}

/// A cached artifact failed its integrity check and must be fetched again.
#[derive(Debug, Error)]
#[error("cached {name} {version} is unusable: {reason}")]
pub struct CacheCorruption {
    pub name: String,
    pub version: String,
    pub reason: String,
}

/// Errors produced while fetching an artifact into the cache.
#[derive(Debug, Error)]
pub enum FetchError {
    /// The remote could not be reached or the transfer broke off. Worth
    /// retrying.
    #[error("network error fetching {source_url}: {message}")]
    Network { source_url: String, message: String },

    /// The remote answered, but not with the artifact.
    #[error("{source_url} answered with HTTP status {status}")]
    Status { source_url: String, status: u16 },

    #[error(
        "downloaded {name} {version} has digest {actual}, expected {expected}"
    )]
    Digest { name: String, version: String, expected: String, actual: String },

    #[error("{list} has no digest for {file_name}")]
    Unlisted { file_name: String, list: String },

    #[error("downloaded {name} {version} is empty")]
    Empty { name: String, version: String },

    #[error("cache I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl FetchError {
    pub fn is_retryable(&self) -> bool {
        match self {
            FetchError::Network { .. } => true,
            FetchError::Status { status, .. } => *status >= 500,
            _ => false,
        }
    }
}
