// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The host-side cache of the CI server API token.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Context as _;
use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use crate::{
    ciserver::TOKEN_FILE, secrets::Secret, shell::GuestShell,
    util::write_private_file,
};

/// How long a fetched token is used before it is fetched again.
pub const TOKEN_TTL: Duration = Duration::from_secs(30 * 24 * 60 * 60);

pub trait Clock {
    fn now(&self) -> SystemTime;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }
}

/// Somewhere a fresh token can be read from.
pub trait TokenSource {
    fn fetch_token(&self) -> anyhow::Result<Secret>;
}

/// Reads the token the CI server wrote out when it created it.
pub struct GuestTokenSource<'a> {
    pub shell: &'a dyn GuestShell,
}

impl TokenSource for GuestTokenSource<'_> {
    fn fetch_token(&self) -> anyhow::Result<Secret> {
        let token = self
            .shell
            .run(&format!("cat {TOKEN_FILE}"))
            .context("reading the API token from the guest")?;
        let token = token.trim();
        if token.is_empty() {
            anyhow::bail!("the guest's API token file is empty");
        }
        Ok(Secret::from_string(token.to_string()))
    }
}

#[derive(Serialize, Deserialize)]
struct StoredEntry {
    token: String,

    /// Seconds since the Unix epoch.
    fetched_at: u64,
}

/// A cached token and when it was fetched.
#[derive(Clone, Debug)]
pub struct TokenCacheEntry {
    pub token: Secret,
    pub fetched_at: SystemTime,
}

impl TokenCacheEntry {
    /// The entry's age, or `None` if it claims to come from the future.
    pub fn age(&self, now: SystemTime) -> Option<Duration> {
        now.duration_since(self.fetched_at).ok()
    }

    pub fn is_fresh(&self, now: SystemTime, ttl: Duration) -> bool {
        matches!(self.age(now), Some(age) if age < ttl)
    }
}

/// What `cibox token` reports.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TokenStatus {
    Missing,
    Valid { age: Duration, expires_in: Duration },
    Expired,
}

pub struct TokenCache<'a> {
    path: Utf8PathBuf,
    clock: &'a dyn Clock,
    ttl: Duration,
}

impl<'a> TokenCache<'a> {
    pub fn new(path: impl Into<Utf8PathBuf>, clock: &'a dyn Clock) -> Self {
        Self { path: path.into(), clock, ttl: TOKEN_TTL }
    }

    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    /// Reads the cache file. A missing or unreadable file is an empty cache.
    pub fn load(&self) -> Option<TokenCacheEntry> {
        let bytes = match std::fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                log::warn!(
                    "ignoring unreadable token cache {}: {e}",
                    self.path
                );
                return None;
            }
        };

        match serde_json::from_slice::<StoredEntry>(&bytes) {
            Ok(stored) => Some(TokenCacheEntry {
                token: Secret::from_string(stored.token),
                fetched_at: UNIX_EPOCH + Duration::from_secs(stored.fetched_at),
            }),
            Err(e) => {
                log::warn!("ignoring corrupt token cache {}: {e}", self.path);
                None
            }
        }
    }

    pub fn status(&self) -> TokenStatus {
        let now = self.clock.now();
        match self.load() {
            None => TokenStatus::Missing,
            Some(entry) if entry.is_fresh(now, self.ttl) => {
                // is_fresh implies a known age below the TTL.
                let age = entry.age(now).unwrap_or_default();
                TokenStatus::Valid { age, expires_in: self.ttl - age }
            }
            Some(_) => TokenStatus::Expired,
        }
    }

    /// Returns the cached token while it is fresh. Otherwise fetches a new
    /// one from `source` and caches it.
    pub fn get_token(
        &self,
        source: &dyn TokenSource,
    ) -> anyhow::Result<Secret> {
        let now = self.clock.now();
        if let Some(entry) = self.load() {
            if entry.is_fresh(now, self.ttl) {
                log::debug!("using cached API token");
                return Ok(entry.token);
            }
            log::info!("cached API token has expired; fetching a new one");
        }

        self.refresh(source)
    }

    /// Like [`get_token`](Self::get_token), but always fetches a new token
    /// when `force` is set.
    pub fn current(
        &self,
        source: &dyn TokenSource,
        force: bool,
    ) -> anyhow::Result<Secret> {
        if force {
            self.refresh(source)
        } else {
            self.get_token(source)
        }
    }

    /// Fetches a new token from `source` unconditionally.
    pub fn refresh(
        &self,
        source: &dyn TokenSource,
    ) -> anyhow::Result<Secret> {
        let token = source.fetch_token()?;
        let fetched_at = self
            .clock
            .now()
            .duration_since(UNIX_EPOCH)
            .context("system clock is before the Unix epoch")?
            .as_secs();

        let stored =
            StoredEntry { token: token.expose().to_string(), fetched_at };
        write_private_file(&self.path, &serde_json::to_vec_pretty(&stored)?)
            .context("caching the API token")?;

        Ok(token)
    }

    /// Forgets the cached token. Used when the guest issues a new one.
    pub fn invalidate(&self) -> anyhow::Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => {
                Err(anyhow::Error::new(e)
                    .context(format!("removing {}", self.path)))
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::shell::test::FakeShell;
    use std::{
        os::unix::fs::PermissionsExt,
        sync::{
            atomic::{AtomicUsize, Ordering},
            Mutex,
        },
    };

    const DAY: Duration = Duration::from_secs(24 * 60 * 60);

    struct FakeClock(Mutex<SystemTime>);

    impl FakeClock {
        fn at(t: SystemTime) -> Self {
            Self(Mutex::new(t))
        }

        fn advance(&self, by: Duration) {
            *self.0.lock().unwrap() += by;
        }
    }

    impl Clock for FakeClock {
        fn now(&self) -> SystemTime {
            *self.0.lock().unwrap()
        }
    }

    #[derive(Default)]
    struct CountingSource {
        calls: AtomicUsize,
    }

    impl TokenSource for CountingSource {
        fn fetch_token(&self) -> anyhow::Result<Secret> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(Secret::from_string(format!("token-{n}")))
        }
    }

    fn setup() -> (tempfile::TempDir, Utf8PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(dir.path().join("token.json"))
            .unwrap();
        (dir, path)
    }

    fn t0() -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(1_700_000_000)
    }

    #[test]
    fn token_is_reused_until_it_expires() {
        let (_dir, path) = setup();
        let clock = FakeClock::at(t0());
        let source = CountingSource::default();
        let cache = TokenCache::new(&path, &clock);

        assert_eq!(cache.status(), TokenStatus::Missing);
        assert_eq!(cache.get_token(&source).unwrap().expose(), "token-1");

        clock.advance(DAY);
        assert_eq!(cache.get_token(&source).unwrap().expose(), "token-1");
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            cache.status(),
            TokenStatus::Valid { age: DAY, expires_in: 29 * DAY }
        );

        clock.advance(30 * DAY);
        assert_eq!(cache.status(), TokenStatus::Expired);
        assert_eq!(cache.get_token(&source).unwrap().expose(), "token-2");
        assert_eq!(cache.get_token(&source).unwrap().expose(), "token-2");
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn future_timestamps_count_as_expired() {
        let (_dir, path) = setup();
        let source = CountingSource::default();
        let ahead = FakeClock::at(t0() + DAY);
        TokenCache::new(&path, &ahead).get_token(&source).unwrap();

        let clock = FakeClock::at(t0());
        let cache = TokenCache::new(&path, &clock);
        assert_eq!(cache.status(), TokenStatus::Expired);
        assert_eq!(cache.get_token(&source).unwrap().expose(), "token-2");
    }

    #[test]
    fn cache_file_is_private_and_corruption_is_tolerated() {
        let (_dir, path) = setup();
        let clock = FakeClock::at(t0());
        let source = CountingSource::default();
        let cache = TokenCache::new(&path, &clock);

        cache.get_token(&source).unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);

        std::fs::write(&path, b"{ not json").unwrap();
        assert_eq!(cache.status(), TokenStatus::Missing);
        assert_eq!(cache.get_token(&source).unwrap().expose(), "token-2");

        cache.invalidate().unwrap();
        cache.invalidate().unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn missing_token_is_fetched_and_force_refetches() {
        let (_dir, path) = setup();
        let clock = FakeClock::at(t0());
        let source = CountingSource::default();
        let cache = TokenCache::new(&path, &clock);

        assert_eq!(cache.status(), TokenStatus::Missing);
        assert_eq!(cache.current(&source, false).unwrap().expose(), "token-1");
        assert!(matches!(cache.status(), TokenStatus::Valid { .. }));

        assert_eq!(cache.current(&source, false).unwrap().expose(), "token-1");
        assert_eq!(cache.current(&source, true).unwrap().expose(), "token-2");
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn guest_source_reads_the_token_file() {
        let shell =
            FakeShell::default().on("provisioner.token", 0, "11aa22bb\n");
        let token = GuestTokenSource { shell: &shell }.fetch_token().unwrap();
        assert_eq!(token.expose(), "11aa22bb");

        let empty = FakeShell::default().on("provisioner.token", 0, "");
        assert!(GuestTokenSource { shell: &empty }.fetch_token().is_err());
    }
}
