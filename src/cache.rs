// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A download cache keyed by artifact name and version.
//!
//! Each artifact lives at `<root>/<name>/<version>`. Next to it, a hidden
//! sidecar `<root>/<name>/.<version>.json` records the artifact's size and
//! SHA-256 digest. The sidecar is written only after the artifact has been
//! renamed into place, so an artifact without a matching sidecar is a
//! leftover from an interrupted run and gets fetched again. A cached copy is
//! reused only while its contents still hash to the recorded digest.
//!
//! Where a mirror publishes a digest list next to an artifact, the list is
//! fetched before the artifact and the download must match its entry.
//!
//! Downloads stream into a uniquely-named temporary file in the same
//! directory and are renamed into place once complete, so the final path
//! only ever holds a whole artifact. Fetches of the same key from multiple
//! threads are serialized; fetches of different keys proceed in parallel.

use std::{
    collections::HashMap,
    fs::File,
    io::{BufReader, Read, Write},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use camino::{Utf8Path, Utf8PathBuf};
use nix::{errno::Errno, sys::signal::kill, unistd::Pid};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{
    error::{CacheCorruption, FetchError},
    util::temp_sibling,
};

/// How many times a retryable download failure is attempted in total.
const MAX_FETCH_ATTEMPTS: usize = 3;

const RETRY_PAUSE: Duration = Duration::from_secs(2);

/// One artifact to fetch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ArtifactRequest {
    pub name: String,
    pub version: String,

    /// Where to download the artifact from.
    pub source: String,

    /// The artifact's expected SHA-256 digest, hex-encoded, if known.
    pub sha256: Option<String>,

    /// A published list of SHA-256 digests that has an entry for this
    /// artifact's file name. Consulted when `sha256` is not set.
    pub digest_list: Option<String>,

    /// Whether the run can proceed without this artifact.
    pub required: bool,
}

/// An artifact present in the cache.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CachedArtifact {
    pub name: String,
    pub version: String,
    pub path: Utf8PathBuf,
    pub size: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct Sidecar {
    size: u64,
    sha256: String,
}

/// Something that can retrieve bytes from a source locator.
pub trait Fetcher: Send + Sync {
    /// Streams the artifact at `source` into `dest` and returns the number of
    /// bytes written.
    fn fetch(&self, source: &str, dest: &mut dyn Write)
        -> Result<u64, FetchError>;
}

/// Fetches over HTTP(S).
pub struct HttpFetcher {
    agent: ureq::Agent,
}

impl HttpFetcher {
    pub fn new() -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(Duration::from_secs(30))
            .timeout_read(Duration::from_secs(60))
            .user_agent(concat!("cibox/", env!("CARGO_PKG_VERSION")))
            .build();
        Self { agent }
    }
}

impl Default for HttpFetcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Fetcher for HttpFetcher {
    fn fetch(
        &self,
        source: &str,
        dest: &mut dyn Write,
    ) -> Result<u64, FetchError> {
        let response = match self.agent.get(source).call() {
            Ok(response) => response,
            Err(ureq::Error::Status(status, _)) => {
                return Err(FetchError::Status {
                    source_url: source.to_string(),
                    status,
                })
            }
            Err(ureq::Error::Transport(e)) => {
                return Err(FetchError::Network {
                    source_url: source.to_string(),
                    message: e.to_string(),
                })
            }
        };

        let mut reader = response.into_reader();
        std::io::copy(&mut reader, dest).map_err(|e| FetchError::Network {
            source_url: source.to_string(),
            message: e.to_string(),
        })
    }
}

/// Hashes everything written through it.
struct HashingWriter<W> {
    inner: W,
    hasher: Sha256,
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

type KeyLock = Arc<Mutex<()>>;

pub struct DownloadCache {
    root: Utf8PathBuf,
    fetcher: Arc<dyn Fetcher>,
    key_locks: Mutex<HashMap<(String, String), KeyLock>>,
    retry_pause: Duration,
}

impl DownloadCache {
    pub fn new(
        root: impl Into<Utf8PathBuf>,
        fetcher: Arc<dyn Fetcher>,
    ) -> Self {
        let cache = Self {
            root: root.into(),
            fetcher,
            key_locks: Mutex::new(HashMap::new()),
            retry_pause: RETRY_PAUSE,
        };
        cache.sweep_temp_files();
        cache
    }

    /// Removes temporary files left behind by runs that died mid-download.
    /// Files belonging to a process that is still running are left alone.
    fn sweep_temp_files(&self) {
        let Ok(dirs) = self.root.read_dir_utf8() else {
            return;
        };

        let files = dirs
            .filter_map(Result::ok)
            .filter_map(|dir| dir.path().read_dir_utf8().ok())
            .flatten()
            .filter_map(Result::ok);
        for entry in files {
            let Some(owner) = temp_file_owner(entry.file_name()) else {
                continue;
            };
            if is_running(owner) {
                continue;
            }

            match std::fs::remove_file(entry.path()) {
                Ok(()) => log::debug!("removed stale {}", entry.path()),
                Err(e) => {
                    log::warn!("could not remove stale {}: {e}", entry.path())
                }
            }
        }
    }

    #[cfg(test)]
    fn without_retry_pause(mut self) -> Self {
        self.retry_pause = Duration::ZERO;
        self
    }

    pub fn artifact_path(&self, name: &str, version: &str) -> Utf8PathBuf {
        self.root.join(name).join(version)
    }

    fn sidecar_path(&self, name: &str, version: &str) -> Utf8PathBuf {
        self.root.join(name).join(format!(".{version}.json"))
    }

    fn key_lock(&self, name: &str, version: &str) -> KeyLock {
        let mut locks =
            self.key_locks.lock().unwrap_or_else(|poison| poison.into_inner());
        locks
            .entry((name.to_string(), version.to_string()))
            .or_default()
            .clone()
    }

    /// Returns the cached artifact for `request` if a valid copy is present.
    pub fn lookup(
        &self,
        request: &ArtifactRequest,
    ) -> Result<Option<CachedArtifact>, FetchError> {
        match self.validate(request) {
            Ok(found) => Ok(found),
            Err(corruption) => {
                log::warn!("{corruption}; it will be downloaded again");
                self.discard(request)?;
                Ok(None)
            }
        }
    }

    /// Checks the cached copy of `request`. `Ok(None)` means there is no
    /// copy at all; `Err` means there is one, but it can't be trusted.
    fn validate(
        &self,
        request: &ArtifactRequest,
    ) -> Result<Option<CachedArtifact>, CacheCorruption> {
        let path = self.artifact_path(&request.name, &request.version);
        let corrupt = |reason: String| CacheCorruption {
            name: request.name.clone(),
            version: request.version.clone(),
            reason,
        };

        let metadata = match std::fs::metadata(&path) {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(None)
            }
            Err(e) => return Err(corrupt(format!("cannot stat {path}: {e}"))),
        };

        if metadata.len() == 0 {
            return Err(corrupt("file is empty".to_string()));
        }

        let sidecar_path = self.sidecar_path(&request.name, &request.version);
        let sidecar: Sidecar = std::fs::read(&sidecar_path)
            .map_err(|e| format!("no readable metadata ({e})"))
            .and_then(|bytes| {
                serde_json::from_slice(&bytes)
                    .map_err(|e| format!("unparseable metadata ({e})"))
            })
            .map_err(corrupt)?;

        if sidecar.size != metadata.len() {
            return Err(corrupt(format!(
                "size is {} bytes, expected {}",
                metadata.len(),
                sidecar.size
            )));
        }

        if let Some(expected) = &request.sha256 {
            if !expected.eq_ignore_ascii_case(&sidecar.sha256) {
                return Err(corrupt(format!(
                    "recorded digest {} does not match expected {expected}",
                    sidecar.sha256
                )));
            }
        }

        let actual = sha256_file(&path)
            .map_err(|e| corrupt(format!("cannot read {path}: {e}")))?;
        if !actual.eq_ignore_ascii_case(&sidecar.sha256) {
            return Err(corrupt(format!(
                "contents hash to {actual}, recorded {}",
                sidecar.sha256
            )));
        }

        Ok(Some(CachedArtifact {
            name: request.name.clone(),
            version: request.version.clone(),
            path,
            size: metadata.len(),
        }))
    }

    fn discard(&self, request: &ArtifactRequest) -> std::io::Result<()> {
        for path in [
            self.sidecar_path(&request.name, &request.version),
            self.artifact_path(&request.name, &request.version),
        ] {
            match std::fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Returns the cached copy of `request`, downloading it first if there
    /// is no valid copy in the cache.
    pub fn fetch(
        &self,
        request: &ArtifactRequest,
    ) -> Result<CachedArtifact, FetchError> {
        let lock = self.key_lock(&request.name, &request.version);
        let _guard = lock.lock().unwrap_or_else(|poison| poison.into_inner());

        if let Some(cached) = self.lookup(request)? {
            log::debug!("{} {} already cached", request.name, request.version);
            return Ok(cached);
        }

        let mut attempt = 1;
        loop {
            match self.download(request) {
                Ok(artifact) => return Ok(artifact),
                Err(e) if e.is_retryable() && attempt < MAX_FETCH_ATTEMPTS => {
                    log::warn!(
                        "attempt {attempt} to download {} {} failed: {e}",
                        request.name,
                        request.version
                    );
                    attempt += 1;
                    std::thread::sleep(self.retry_pause);
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn download(
        &self,
        request: &ArtifactRequest,
    ) -> Result<CachedArtifact, FetchError> {
        let path = self.artifact_path(&request.name, &request.version);
        let dir = self.root.join(&request.name);
        std::fs::create_dir_all(&dir)?;

        log::info!(
            "downloading {} {} from {}",
            request.name,
            request.version,
            request.source
        );

        let expected = self.expected_digest(request)?;
        let tmp = temp_sibling(&path);
        let result = self
            .download_to(request, expected.as_deref(), &tmp)
            .and_then(|sidecar| {
                std::fs::rename(&tmp, &path)?;
                let sidecar_json = serde_json::to_vec(&sidecar)
                    .map_err(|e| FetchError::Io(e.into()))?;
                let sidecar_path =
                    self.sidecar_path(&request.name, &request.version);
                let sidecar_tmp = temp_sibling(&sidecar_path);
                std::fs::write(&sidecar_tmp, sidecar_json)?;
                std::fs::rename(&sidecar_tmp, &sidecar_path)?;
                Ok(sidecar)
            });

        match result {
            Ok(sidecar) => Ok(CachedArtifact {
                name: request.name.clone(),
                version: request.version.clone(),
                path,
                size: sidecar.size,
            }),
            Err(e) => {
                let _ = std::fs::remove_file(&tmp);
                Err(e)
            }
        }
    }

    /// The digest a download of `request` has to match, if one is known.
    fn expected_digest(
        &self,
        request: &ArtifactRequest,
    ) -> Result<Option<String>, FetchError> {
        if let Some(sha256) = &request.sha256 {
            return Ok(Some(sha256.clone()));
        }
        let Some(list) = &request.digest_list else {
            return Ok(None);
        };

        let mut listing = Vec::new();
        self.fetcher.fetch(list, &mut listing)?;
        let file_name = source_file_name(&request.source);
        find_digest(&String::from_utf8_lossy(&listing), file_name)
            .map(Some)
            .ok_or_else(|| FetchError::Unlisted {
                file_name: file_name.to_string(),
                list: list.clone(),
            })
    }

    fn download_to(
        &self,
        request: &ArtifactRequest,
        expected: Option<&str>,
        tmp: &Utf8Path,
    ) -> Result<Sidecar, FetchError> {
        let file = File::create(tmp)?;
        let mut writer = HashingWriter { inner: file, hasher: Sha256::new() };
        let size = self.fetcher.fetch(&request.source, &mut writer)?;
        writer.flush()?;
        writer.inner.sync_all()?;

        if size == 0 {
            return Err(FetchError::Empty {
                name: request.name.clone(),
                version: request.version.clone(),
            });
        }

        let sha256 = hex::encode(writer.hasher.finalize());
        if let Some(expected) = expected {
            if !expected.eq_ignore_ascii_case(&sha256) {
                return Err(FetchError::Digest {
                    name: request.name.clone(),
                    version: request.version.clone(),
                    expected: expected.to_string(),
                    actual: sha256,
                });
            }
        }

        Ok(Sidecar { size, sha256 })
    }

    /// Fetches every request, running at most `workers` downloads at a time.
    /// Results are returned in the order of `requests`.
    pub fn fetch_all(
        &self,
        requests: &[ArtifactRequest],
        workers: usize,
    ) -> Vec<Result<CachedArtifact, FetchError>> {
        let next = AtomicUsize::new(0);
        let results: Mutex<Vec<Option<Result<CachedArtifact, FetchError>>>> =
            Mutex::new(requests.iter().map(|_| None).collect());

        std::thread::scope(|scope| {
            for _ in 0..workers.clamp(1, requests.len().max(1)) {
                scope.spawn(|| loop {
                    let index = next.fetch_add(1, Ordering::SeqCst);
                    let Some(request) = requests.get(index) else {
                        break;
                    };

                    let result = self.fetch(request);
                    results
                        .lock()
                        .unwrap_or_else(|poison| poison.into_inner())[index] =
                        Some(result);
                });
            }
        });

        results
            .into_inner()
            .unwrap_or_else(|poison| poison.into_inner())
            .into_iter()
            .zip(requests)
            .map(|(result, request)| {
                result.unwrap_or_else(|| {
                    Err(FetchError::Network {
                        source_url: request.source.clone(),
                        message: "download worker exited early".to_string(),
                    })
                })
            })
            .collect()
    }
}

/// The last path segment of a source locator.
fn source_file_name(source: &str) -> &str {
    source.rsplit('/').next().unwrap_or(source)
}

/// Finds `file_name`'s digest in a published list. Both the BSD layout
/// (`SHA256 (name) = digest`) and the coreutils one (`digest  name`) are
/// understood; a list holding a lone digest applies to any file.
fn find_digest(listing: &str, file_name: &str) -> Option<String> {
    let is_digest =
        |s: &str| s.len() == 64 && s.bytes().all(|b| b.is_ascii_hexdigit());

    listing.lines().map(str::trim).find_map(|line| {
        if let Some(rest) = line.strip_prefix("SHA256 (") {
            let (name, digest) = rest.split_once(") = ")?;
            return (name == file_name && is_digest(digest))
                .then(|| digest.to_ascii_lowercase());
        }

        let mut words = line.split_whitespace();
        let digest = words.next().filter(|&d| is_digest(d))?;
        match words.next() {
            Some(name) if name.trim_start_matches('*') != file_name => None,
            _ => Some(digest.to_ascii_lowercase()),
        }
    })
}

/// The pid that created a temporary file named by
/// [`temp_sibling`](crate::util::temp_sibling), if `name` is one.
fn temp_file_owner(name: &str) -> Option<i32> {
    let (_, rest) = name.strip_prefix('.')?.rsplit_once(".tmp-")?;
    let (pid, _) = rest.split_once('-')?;
    pid.parse().ok()
}

fn is_running(pid: i32) -> bool {
    // EPERM still means the process exists.
    !matches!(kill(Pid::from_raw(pid), None), Err(Errno::ESRCH))
}

/// Computes the SHA-256 digest of a file, hex-encoded.
pub fn sha256_file(path: &Utf8Path) -> std::io::Result<String> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}
