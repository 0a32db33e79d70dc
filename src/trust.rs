// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Installs the guest's certificate authority into the host's trust stores.
//!
//! There are several independent stores on a typical workstation: the
//! operating system's, the Java runtime's, and one NSS database per browser
//! profile. Each is attempted on its own and reported on its own. A store
//! that isn't present is skipped; one that is present but refuses the
//! certificate is a failure that doesn't affect the others.

use std::{fmt, process::Command};

use camino::{Utf8Path, Utf8PathBuf};

use crate::{
    error::TrustPropagationPartial, ui::Ui, util::run_command_check_status,
};

/// The password every JDK ships its cacerts keystore with.
const JAVA_STOREPASS: &str = "changeit";

/// What happened when a store was asked to trust the certificate.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TrustOutcome {
    /// The certificate was added to this many databases.
    Installed { entries: usize },

    /// The store doesn't exist on this host.
    Absent { reason: String },

    Failed { reason: String },
}

/// A place the host keeps trusted certificates.
pub trait TrustStore {
    fn name(&self) -> String;

    /// True for stores that count browser profiles.
    fn is_browser(&self) -> bool {
        false
    }

    /// Adds `ca` under the nickname `label`, replacing any earlier
    /// certificate with that nickname. Returns `Absent` if the store isn't
    /// present; an `Err` is recorded as a failure.
    fn install(
        &self,
        ca: &Utf8Path,
        label: &str,
        ui: &dyn Ui,
    ) -> anyhow::Result<TrustOutcome>;
}

/// How the host should talk to the guest's CI server from here on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Transport {
    /// The HTTPS endpoint answered and its certificate chained to the CA.
    VerifiedHttps,

    /// HTTPS could not be verified. Retrievals go through the guest shell.
    GuestShell,
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transport::VerifiedHttps => f.write_str("verified HTTPS"),
            Transport::GuestShell => {
                f.write_str("guest shell (HTTPS unverified)")
            }
        }
    }
}

#[derive(Clone, Debug)]
pub struct TargetResult {
    pub name: String,
    pub browser: bool,
    pub outcome: TrustOutcome,
}

/// The outcome for every trust target, and the transport chosen afterwards.
#[derive(Clone, Debug)]
pub struct TrustReport {
    pub targets: Vec<TargetResult>,
    pub transport: Option<Transport>,
}

impl TrustReport {
    pub fn browser_profiles_updated(&self) -> usize {
        self.targets
            .iter()
            .filter(|t| t.browser)
            .map(|t| match t.outcome {
                TrustOutcome::Installed { entries } => entries,
                _ => 0,
            })
            .sum()
    }

    /// The targets that failed, as an error, if there were any.
    pub fn partial(&self) -> Option<TrustPropagationPartial> {
        let failed: Vec<String> = self
            .targets
            .iter()
            .filter(|t| matches!(t.outcome, TrustOutcome::Failed { .. }))
            .map(|t| t.name.clone())
            .collect();

        (!failed.is_empty()).then_some(TrustPropagationPartial { failed })
    }
}

impl fmt::Display for TrustReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for target in self.targets.iter().filter(|t| !t.browser) {
            match &target.outcome {
                TrustOutcome::Installed { .. } => {
                    writeln!(f, "  ✓ {}", target.name)?
                }
                TrustOutcome::Absent { reason } => {
                    writeln!(f, "  - {} (not present: {reason})", target.name)?
                }
                TrustOutcome::Failed { reason } => {
                    writeln!(f, "  ⚠ {}: {reason}", target.name)?
                }
            }
        }

        let browsers: Vec<&TargetResult> =
            self.targets.iter().filter(|t| t.browser).collect();
        if !browsers.is_empty() {
            writeln!(
                f,
                "  {} browser profiles updated",
                self.browser_profiles_updated()
            )?;
            for target in browsers {
                if let TrustOutcome::Failed { reason } = &target.outcome {
                    writeln!(f, "  ⚠ {}: {reason}", target.name)?;
                }
            }
        }

        if let Some(transport) = self.transport {
            writeln!(f, "  CI server transport: {transport}")?;
        }

        Ok(())
    }
}

/// Offers `ca` to every store in turn.
pub fn propagate(
    stores: &[Box<dyn TrustStore>],
    ca: &Utf8Path,
    label: &str,
    ui: &dyn Ui,
) -> TrustReport {
    let targets = stores
        .iter()
        .map(|store| {
            let name = store.name();
            ui.set_substep(&format!("trusting the guest CA in {name}"));
            let outcome = match store.install(ca, label, ui) {
                Ok(outcome) => outcome,
                Err(e) => TrustOutcome::Failed { reason: format!("{e:#}") },
            };

            match &outcome {
                TrustOutcome::Failed { reason } => {
                    log::warn!("could not update {name}: {reason}")
                }
                outcome => log::info!("{name}: {outcome:?}"),
            }

            TargetResult { name, browser: store.is_browser(), outcome }
        })
        .collect();

    TrustReport { targets, transport: None }
}

/// The stores worth trying on this host.
pub fn host_stores() -> Vec<Box<dyn TrustStore>> {
    let home = std::env::var("HOME").map(Utf8PathBuf::from).ok();
    let mut stores: Vec<Box<dyn TrustStore>> =
        vec![Box::new(SystemStore::detect()), Box::new(JavaStore::detect())];
    if let Some(home) = home {
        stores.push(Box::new(NssStore::detect(home)));
    }
    stores
}

fn is_root() -> bool {
    nix::unistd::geteuid().is_root()
}

/// A command that runs with root privileges, through non-interactive sudo
/// unless we already have them.
fn privileged(program: &str) -> Command {
    if is_root() {
        Command::new(program)
    } else {
        let mut cmd = Command::new("sudo");
        cmd.arg("-n").arg(program);
        cmd
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SystemFlavor {
    /// `update-ca-certificates` reading `/usr/local/share/ca-certificates`.
    Debian,

    /// `update-ca-trust` reading `/etc/pki/ca-trust/source/anchors`.
    Fedora,

    /// The login keychain, through `security`.
    MacOs,
}

/// The operating system's trust store.
pub struct SystemStore {
    flavor: Option<SystemFlavor>,
}

impl SystemStore {
    pub fn detect() -> Self {
        let flavor = if cfg!(target_os = "macos") {
            Some(SystemFlavor::MacOs)
        } else if which::which("update-ca-certificates").is_ok() {
            Some(SystemFlavor::Debian)
        } else if which::which("update-ca-trust").is_ok() {
            Some(SystemFlavor::Fedora)
        } else {
            None
        };

        Self { flavor }
    }
}

impl TrustStore for SystemStore {
    fn name(&self) -> String {
        "host OS trust store".to_string()
    }

    fn install(
        &self,
        ca: &Utf8Path,
        label: &str,
        ui: &dyn Ui,
    ) -> anyhow::Result<TrustOutcome> {
        let Some(flavor) = self.flavor else {
            return Ok(TrustOutcome::Absent {
                reason: "no supported trust store tool found".to_string(),
            });
        };

        let (anchor_dir, refresh): (&str, &[&str]) = match flavor {
            SystemFlavor::Debian => (
                "/usr/local/share/ca-certificates",
                &["update-ca-certificates"][..],
            ),
            SystemFlavor::Fedora => (
                "/etc/pki/ca-trust/source/anchors",
                &["update-ca-trust", "extract"][..],
            ),
            SystemFlavor::MacOs => return install_in_keychain(ca, label, ui),
        };

        let anchor = format!("{anchor_dir}/{label}.crt");
        run_command_check_status(
            privileged("install").args(["-m", "644", ca.as_str(), &anchor]),
            ui,
        )?;
        run_command_check_status(
            privileged(refresh[0]).args(&refresh[1..]),
            ui,
        )?;

        Ok(TrustOutcome::Installed { entries: 1 })
    }
}

fn install_in_keychain(
    ca: &Utf8Path,
    label: &str,
    ui: &dyn Ui,
) -> anyhow::Result<TrustOutcome> {
    let home = std::env::var("HOME")?;
    let keychain = format!("{home}/Library/Keychains/login.keychain-db");

    // An earlier guest's CA has the same name.
    let _ = Command::new("security")
        .args(["delete-certificate", "-c", label, &keychain])
        .output();
    run_command_check_status(
        Command::new("security").args([
            "add-trusted-cert",
            "-r",
            "trustRoot",
            "-k",
            &keychain,
            ca.as_str(),
        ]),
        ui,
    )?;

    Ok(TrustOutcome::Installed { entries: 1 })
}

/// The Java runtime's `cacerts` keystore.
pub struct JavaStore {
    keytool: Option<Utf8PathBuf>,
}

impl JavaStore {
    pub fn detect() -> Self {
        let from_java_home = std::env::var("JAVA_HOME")
            .ok()
            .map(|home| Utf8PathBuf::from(home).join("bin").join("keytool"))
            .filter(|path| path.exists());
        let keytool = from_java_home.or_else(|| {
            which::which("keytool")
                .ok()
                .and_then(|p| Utf8PathBuf::from_path_buf(p).ok())
        });

        Self { keytool }
    }
}

/// A keytool invocation against the runtime's `cacerts`, which is owned by
/// root on most installs.
fn keytool_command(keytool: &Utf8Path, args: &[&str]) -> Command {
    let mut cmd = privileged(keytool.as_str());
    cmd.args(args).args(["-cacerts", "-storepass", JAVA_STOREPASS]);
    cmd
}

impl TrustStore for JavaStore {
    fn name(&self) -> String {
        "Java runtime cacerts".to_string()
    }

    fn install(
        &self,
        ca: &Utf8Path,
        label: &str,
        ui: &dyn Ui,
    ) -> anyhow::Result<TrustOutcome> {
        let Some(keytool) = &self.keytool else {
            return Ok(TrustOutcome::Absent {
                reason: "keytool not found".to_string(),
            });
        };

        let _ = keytool_command(keytool, &["-delete", "-alias", label])
            .output();

        run_command_check_status(
            &mut keytool_command(
                keytool,
                &[
                    "-importcert",
                    "-noprompt",
                    "-alias",
                    label,
                    "-file",
                    ca.as_str(),
                ],
            ),
            ui,
        )?;

        Ok(TrustOutcome::Installed { entries: 1 })
    }
}

/// Every NSS certificate database under a home directory: the shared one
/// Chromium-family browsers use and one per Firefox profile.
pub struct NssStore {
    home: Utf8PathBuf,
    certutil: Option<Utf8PathBuf>,
}

impl NssStore {
    pub fn detect(home: Utf8PathBuf) -> Self {
        let certutil = which::which("certutil")
            .ok()
            .and_then(|p| Utf8PathBuf::from_path_buf(p).ok());
        Self { home, certutil }
    }

    /// The databases present, identified by their directories.
    fn databases(&self) -> Vec<Utf8PathBuf> {
        let mut found = Vec::new();
        let shared = self.home.join(".pki/nssdb");
        if shared.join("cert9.db").exists() {
            found.push(shared);
        }

        for profiles in [
            ".mozilla/firefox",
            "snap/firefox/common/.mozilla/firefox",
            "Library/Application Support/Firefox/Profiles",
        ] {
            let Ok(entries) = self.home.join(profiles).read_dir_utf8() else {
                continue;
            };

            let mut dirs: Vec<Utf8PathBuf> = entries
                .filter_map(Result::ok)
                .map(|entry| entry.path().to_owned())
                .filter(|dir| dir.join("cert9.db").exists())
                .collect();
            dirs.sort();
            found.extend(dirs);
        }

        found
    }
}

impl TrustStore for NssStore {
    fn name(&self) -> String {
        "browser NSS databases".to_string()
    }

    fn is_browser(&self) -> bool {
        true
    }

    fn install(
        &self,
        ca: &Utf8Path,
        label: &str,
        ui: &dyn Ui,
    ) -> anyhow::Result<TrustOutcome> {
        let databases = self.databases();
        if databases.is_empty() {
            return Ok(TrustOutcome::Installed { entries: 0 });
        }

        let Some(certutil) = &self.certutil else {
            anyhow::bail!(
                "found {} browser certificate database(s) but no certutil; \
                install the NSS tools and re-run",
                databases.len()
            );
        };

        let mut updated = 0;
        let mut failed = Vec::new();
        for db in &databases {
            let db_arg = format!("sql:{db}");
            let _ = Command::new(certutil)
                .args(["-D", "-n", label, "-d", &db_arg])
                .output();

            let result = run_command_check_status(
                Command::new(certutil).args([
                    "-A",
                    "-n",
                    label,
                    "-t",
                    "C,,",
                    "-i",
                    ca.as_str(),
                    "-d",
                    &db_arg,
                ]),
                ui,
            );

            match result {
                Ok(_) => updated += 1,
                Err(e) => {
                    log::warn!("could not update NSS database {db}: {e:#}");
                    failed.push(db.to_string());
                }
            }
        }

        if !failed.is_empty() {
            anyhow::bail!(
                "{updated} browser profiles updated, {} failed: {}",
                failed.len(),
                failed.join(", ")
            );
        }

        Ok(TrustOutcome::Installed { entries: updated })
    }
}

/// Talks HTTPS to the guest's CI server.
pub trait HttpsClient {
    /// Succeeds if `url` answers over HTTPS with a certificate that chains
    /// to `ca`.
    fn probe(&self, url: &str, ca: &Utf8Path) -> anyhow::Result<()>;

    fn download(
        &self,
        url: &str,
        ca: &Utf8Path,
        dest: &Utf8Path,
    ) -> anyhow::Result<()>;
}

/// An [`HttpsClient`] built on the `curl` command, pinned to the guest CA.
pub struct CurlClient;

impl CurlClient {
    fn command(url: &str, ca: &Utf8Path) -> Command {
        let mut cmd = Command::new("curl");
        cmd.args(["-fsS", "--max-time", "60", "--cacert", ca.as_str(), url]);
        cmd
    }
}

impl HttpsClient for CurlClient {
    fn probe(&self, url: &str, ca: &Utf8Path) -> anyhow::Result<()> {
        let output = Self::command(url, ca).args(["-o", "/dev/null"]).output()?;
        if !output.status.success() {
            anyhow::bail!(
                "{url} did not verify: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(())
    }

    fn download(
        &self,
        url: &str,
        ca: &Utf8Path,
        dest: &Utf8Path,
    ) -> anyhow::Result<()> {
        let output = Self::command(url, ca)
            .args(["-o", dest.as_str()])
            .output()?;
        if !output.status.success() {
            anyhow::bail!(
                "downloading {url} failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(())
    }
}

/// Chooses the transport by probing `url`.
pub fn choose_transport(
    client: &dyn HttpsClient,
    url: &str,
    ca: &Utf8Path,
) -> Transport {
    match client.probe(url, ca) {
        Ok(()) => Transport::VerifiedHttps,
        Err(e) => {
            log::warn!("falling back to the guest shell: {e:#}");
            Transport::GuestShell
        }
    }
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;
    use crate::ui::LogUi;
    use std::sync::Mutex;

    /// A store that answers with a fixed outcome.
    pub(crate) struct FakeStore {
        pub name: &'static str,
        pub outcome: Result<TrustOutcome, String>,
        pub installed: Mutex<Vec<String>>,
    }

    impl FakeStore {
        pub fn installing() -> Self {
            Self {
                name: "host OS trust store",
                outcome: Ok(TrustOutcome::Installed { entries: 1 }),
                installed: Mutex::new(Vec::new()),
            }
        }
    }

    impl TrustStore for FakeStore {
        fn name(&self) -> String {
            self.name.to_string()
        }

        fn install(
            &self,
            _ca: &Utf8Path,
            label: &str,
            _ui: &dyn Ui,
        ) -> anyhow::Result<TrustOutcome> {
            self.installed.lock().unwrap().push(label.to_string());
            self.outcome.clone().map_err(|e| anyhow::anyhow!(e))
        }
    }

    #[test]
    fn keytool_runs_privileged_against_cacerts() {
        let keytool = Utf8Path::new("/opt/jdk/bin/keytool");
        let cmd = keytool_command(keytool, &["-delete", "-alias", "cibox"]);
        let argv: Vec<String> = std::iter::once(cmd.get_program())
            .chain(cmd.get_args())
            .map(|arg| arg.to_string_lossy().into_owned())
            .collect();

        let rest = if is_root() {
            &argv[..]
        } else {
            assert_eq!(argv[..2], ["sudo", "-n"]);
            &argv[2..]
        };
        assert_eq!(
            rest,
            [
                "/opt/jdk/bin/keytool",
                "-delete",
                "-alias",
                "cibox",
                "-cacerts",
                "-storepass",
                "changeit"
            ]
        );
    }

    /// An HTTPS client that either always verifies or never does.
    pub(crate) struct FakeHttps {
        pub verifies: bool,
        pub downloads: Mutex<Vec<String>>,
    }

    impl HttpsClient for FakeHttps {
        fn probe(&self, url: &str, _ca: &Utf8Path) -> anyhow::Result<()> {
            if !self.verifies {
                anyhow::bail!("certificate for {url} did not verify");
            }
            Ok(())
        }

        fn download(
            &self,
            url: &str,
            ca: &Utf8Path,
            dest: &Utf8Path,
        ) -> anyhow::Result<()> {
            self.probe(url, ca)?;
            self.downloads.lock().unwrap().push(url.to_string());
            std::fs::write(dest, b"PK fake jar")?;
            Ok(())
        }
    }

    fn home() -> (tempfile::TempDir, Utf8PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path =
            Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        (dir, path)
    }

    #[test]
    fn no_browsers_is_a_normal_outcome() {
        let (_dir, home) = home();
        let stores: Vec<Box<dyn TrustStore>> = vec![
            Box::new(FakeStore::installing()),
            Box::new(NssStore { home, certutil: None }),
        ];

        let ca = Utf8Path::new("/tmp/ca.crt");
        let report = propagate(&stores, ca, "cibox-test", &LogUi);
        assert!(report.partial().is_none());
        assert_eq!(report.browser_profiles_updated(), 0);
        assert_eq!(
            report.targets[0].outcome,
            TrustOutcome::Installed { entries: 1 }
        );

        let text = report.to_string();
        assert!(text.contains("✓ host OS trust store"));
        assert!(text.contains("0 browser profiles updated"));
    }

    #[test]
    fn one_failing_store_does_not_stop_the_others() {
        let (_dir, home) = home();
        let profile = home.join(".mozilla/firefox/abcd.default-release");
        std::fs::create_dir_all(&profile).unwrap();
        std::fs::write(profile.join("cert9.db"), b"").unwrap();

        let java = FakeStore {
            name: "Java runtime cacerts",
            outcome: Err("keystore was tampered with".to_string()),
            installed: Mutex::new(Vec::new()),
        };
        let stores: Vec<Box<dyn TrustStore>> = vec![
            Box::new(java),
            Box::new(NssStore { home, certutil: None }),
            Box::new(FakeStore::installing()),
        ];

        let ca = Utf8Path::new("/tmp/ca.crt");
        let report = propagate(&stores, ca, "cibox-test", &LogUi);
        let partial = report.partial().unwrap();
        assert_eq!(
            partial.failed,
            ["Java runtime cacerts", "browser NSS databases"]
        );
        assert!(matches!(
            report.targets[1].outcome,
            TrustOutcome::Failed { .. }
        ));
        assert_eq!(
            report.targets[2].outcome,
            TrustOutcome::Installed { entries: 1 }
        );
        assert!(report.to_string().contains("no certutil"));
    }

    #[test]
    fn finds_shared_and_firefox_databases() {
        let (_dir, home) = home();
        for dir in [
            ".pki/nssdb",
            ".mozilla/firefox/b.default",
            ".mozilla/firefox/a.dev",
        ] {
            std::fs::create_dir_all(home.join(dir)).unwrap();
            std::fs::write(home.join(dir).join("cert9.db"), b"").unwrap();
        }
        std::fs::create_dir_all(home.join(".mozilla/firefox/Crash Reports"))
            .unwrap();

        let store = NssStore { home: home.clone(), certutil: None };
        assert_eq!(
            store.databases(),
            [
                home.join(".pki/nssdb"),
                home.join(".mozilla/firefox/a.dev"),
                home.join(".mozilla/firefox/b.default"),
            ]
        );
    }

    #[test]
    fn unverified_https_falls_back_to_the_guest_shell() {
        let ca = Utf8Path::new("/tmp/ca.crt");
        let ok =
            FakeHttps { verifies: true, downloads: Mutex::new(Vec::new()) };
        let bad =
            FakeHttps { verifies: false, downloads: Mutex::new(Vec::new()) };
        assert_eq!(
            choose_transport(&ok, "https://127.0.0.1:8443/login", ca),
            Transport::VerifiedHttps
        );
        assert_eq!(
            choose_transport(&bad, "https://127.0.0.1:8443/login", ca),
            Transport::GuestShell
        );
    }
}
