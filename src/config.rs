// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The run configuration handed to every component, and the layout of the
//! work directory.

use camino::Utf8PathBuf;

use crate::app::{App, SourceArgs};

/// Host loopback ports wired to the guest.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GuestPorts {
    pub ssh: u16,
    pub https: u16,
    pub console: u16,
}

/// Where artifacts and guest packages come from.
#[derive(Clone, Debug)]
pub struct Sources {
    pub os_mirror: String,
    pub ci_mirror: String,
    pub plugin_mirror: String,
    pub download_workers: usize,
}

impl Default for Sources {
    fn default() -> Self {
        Self {
            os_mirror: "https://cdn.openbsd.org/pub/OpenBSD".to_string(),
            ci_mirror: "https://get.jenkins.io".to_string(),
            plugin_mirror: "https://updates.jenkins.io/download".to_string(),
            download_workers: 4,
        }
    }
}

impl From<&SourceArgs> for Sources {
    fn from(args: &SourceArgs) -> Self {
        Self {
            os_mirror: args.os_mirror.trim_end_matches('/').to_string(),
            ci_mirror: args.ci_mirror.trim_end_matches('/').to_string(),
            plugin_mirror: args.plugin_mirror.trim_end_matches('/').to_string(),
            download_workers: args.download_workers.max(1),
        }
    }
}

#[derive(Clone, Debug)]
pub struct Config {
    pub guest_name: String,
    pub work_dir: Utf8PathBuf,
    pub cache_dir: Utf8PathBuf,
    pub ports: GuestPorts,
    pub sources: Sources,
    pub interactive: bool,
}

impl Config {
    pub fn from_app(app: &App, interactive: bool, sources: Sources) -> Self {
        let cache_dir =
            app.cache_dir.clone().unwrap_or_else(|| app.work_dir.join("cache"));
        Self {
            guest_name: app.guest_name.clone(),
            work_dir: app.work_dir.clone(),
            cache_dir,
            ports: GuestPorts {
                ssh: app.ports.ssh_port,
                https: app.ports.https_port,
                console: app.ports.console_port,
            },
            sources,
            interactive,
        }
    }

    /// A configuration rooted at `work_dir`, for tests.
    #[cfg(test)]
    pub fn for_test(work_dir: &camino::Utf8Path) -> Self {
        Self {
            guest_name: "test".to_string(),
            work_dir: work_dir.to_owned(),
            cache_dir: work_dir.join("cache"),
            ports: GuestPorts { ssh: 2222, https: 8443, console: 4555 },
            sources: Sources::default(),
            interactive: false,
        }
    }

    fn state_file(&self, suffix: &str) -> Utf8PathBuf {
        self.work_dir.join(format!("{}{suffix}", self.guest_name))
    }

    /// The record of the running guest process.
    pub fn pid_file(&self) -> Utf8PathBuf {
        self.state_file(".pid")
    }

    /// The pid file QEMU itself writes when it daemonizes.
    pub fn qemu_pid_file(&self) -> Utf8PathBuf {
        self.state_file(".qemu.pid")
    }

    /// Marks a completed operating system install.
    pub fn install_marker(&self) -> Utf8PathBuf {
        self.state_file(".installed")
    }

    /// The sizing profile chosen when the guest was provisioned.
    pub fn profile_file(&self) -> Utf8PathBuf {
        self.state_file(".profile.json")
    }

    pub fn system_disk(&self) -> Utf8PathBuf {
        self.state_file("-system.qcow2")
    }

    pub fn data_disk(&self) -> Utf8PathBuf {
        self.state_file("-data.qcow2")
    }

    /// A copy of everything the guest printed on its serial console.
    pub fn console_log(&self) -> Utf8PathBuf {
        self.state_file("-console.log")
    }

    pub fn credentials_file(&self) -> Utf8PathBuf {
        self.work_dir.join("credentials")
    }

    pub fn token_file(&self) -> Utf8PathBuf {
        self.work_dir.join("token.json")
    }

    pub fn ssh_identity(&self) -> Utf8PathBuf {
        self.work_dir.join("id_ed25519")
    }

    pub fn known_hosts(&self) -> Utf8PathBuf {
        self.work_dir.join("known_hosts")
    }

    /// The guest CA certificate once it has been copied to the host.
    pub fn ca_certificate(&self) -> Utf8PathBuf {
        self.work_dir.join("ca.crt")
    }

    pub fn cli_jar(&self) -> Utf8PathBuf {
        self.work_dir.join("bin").join("jenkins-cli.jar")
    }

    pub fn https_url(&self) -> String {
        format!("https://127.0.0.1:{}/", self.ports.https)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn state_files_are_named_after_the_guest() {
        let config = Config::for_test(camino::Utf8Path::new("/w"));
        assert_eq!(config.pid_file(), "/w/test.pid");
        assert_eq!(config.system_disk(), "/w/test-system.qcow2");
        assert_eq!(config.credentials_file(), "/w/credentials");
        assert_eq!(config.https_url(), "https://127.0.0.1:8443/");
    }
}
