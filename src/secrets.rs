// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Generated secrets and the credentials record that holds them.

use std::{collections::BTreeMap, fmt};

use anyhow::Context as _;
use camino::Utf8Path;
use rand::{distributions::Alphanumeric, rngs::OsRng, Rng};

use crate::{config::Config, util::write_private_file};

/// Length of generated passwords.
pub const SECRET_LEN: usize = 24;

/// The guest account that runs the CI server and builds.
pub const SERVICE_USER: &str = "builder";

/// The CI server's administrative account.
pub const CI_ADMIN_USER: &str = "admin";

/// A secret string. Formatting it never reveals its value.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    /// Generates a random secret from the operating system's CSPRNG.
    pub fn generate() -> Self {
        Self(
            OsRng
                .sample_iter(&Alphanumeric)
                .take(SECRET_LEN)
                .map(char::from)
                .collect(),
        )
    }

    pub fn from_string(value: String) -> Self {
        Self(value)
    }

    /// Returns the secret's value. Callers must not log it.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(<redacted>)")
    }
}

impl fmt::Display for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("<redacted>")
    }
}

/// The secrets for each account the provisioner creates.
#[derive(Clone, Debug)]
pub struct Credentials {
    pub root: Secret,
    pub service: Secret,
    pub ci_admin: Secret,
}

impl Credentials {
    pub fn generate() -> Self {
        Self {
            root: Secret::generate(),
            service: Secret::generate(),
            ci_admin: Secret::generate(),
        }
    }

    /// Loads the credentials record at `path` if there is one, or generates
    /// new credentials and writes them there. An existing record is reused
    /// because an already-installed guest carries its secrets.
    pub fn load_or_generate(config: &Config) -> anyhow::Result<(Self, bool)> {
        let path = config.credentials_file();
        if path.exists() {
            return Ok((Self::load(&path)?, false));
        }

        let credentials = Self::generate();
        credentials.write(config)?;
        Ok((credentials, true))
    }

    pub fn load(path: &Utf8Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading credentials record {path}"))?;
        let fields = parse_record(&text);
        let field = |key: &str| {
            fields
                .get(key)
                .map(|v| Secret::from_string(v.to_string()))
                .ok_or_else(|| {
                    anyhow::anyhow!("credentials record {path} lacks '{key}'")
                })
        };

        Ok(Self {
            root: field("root_password")?,
            service: field("service_password")?,
            ci_admin: field("ci_admin_password")?,
        })
    }

    /// Writes the credentials record, readable only by the current user,
    /// along with the details needed to reach the guest.
    pub fn write(&self, config: &Config) -> anyhow::Result<()> {
        let record = format!(
            "# cibox credentials for guest '{guest}'. Keep this file private.\n\
            root_password={root}\n\
            service_user={SERVICE_USER}\n\
            service_password={service}\n\
            ci_admin_user={CI_ADMIN_USER}\n\
            ci_admin_password={admin}\n\
            ssh_host=127.0.0.1\n\
            ssh_port={ssh_port}\n\
            ssh_identity={identity}\n\
            ci_url={url}\n\
            ci_token_cache={token}\n",
            guest = config.guest_name,
            root = self.root.expose(),
            service = self.service.expose(),
            admin = self.ci_admin.expose(),
            ssh_port = config.ports.ssh,
            identity = config.ssh_identity(),
            url = config.https_url(),
            token = config.token_file(),
        );

        write_private_file(&config.credentials_file(), record.as_bytes())
    }
}

fn parse_record(text: &str) -> BTreeMap<&str, &str> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| line.split_once('='))
        .collect()
}

#[cfg(test)]
mod test {
    use super::*;
    use camino::Utf8PathBuf;
    use std::os::unix::fs::PermissionsExt;

    #[test]
    fn secrets_are_random_and_redacted() {
        let a = Secret::generate();
        let b = Secret::generate();
        assert_ne!(a, b);
        assert_eq!(a.expose().len(), SECRET_LEN);
        assert!(a.expose().chars().all(|c| c.is_ascii_alphanumeric()));
        assert_eq!(format!("{a:?}"), "Secret(<redacted>)");
        assert_eq!(format!("{a}"), "<redacted>");
    }

    #[test]
    fn record_round_trips_and_is_private() {
        let dir = tempfile::tempdir().unwrap();
        let work = Utf8PathBuf::from_path_buf(dir.path().to_path_buf())
            .unwrap();
        let config = Config::for_test(&work);

        let (first, created) = Credentials::load_or_generate(&config).unwrap();
        assert!(created);
        let (second, created) =
            Credentials::load_or_generate(&config).unwrap();
        assert!(!created);
        assert_eq!(first.root, second.root);
        assert_eq!(first.ci_admin, second.ci_admin);

        let path = config.credentials_file();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("ssh_port=2222"));
        assert!(text.contains(&format!(
            "service_password={}",
            first.service.expose()
        )));
    }
}
