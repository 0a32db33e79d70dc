// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The provisioning run: every phase from sizing the guest to caching the CI
//! token, expressed as a script for the step runner.

use std::{io::Write, sync::Arc, time::Duration};

use anyhow::Context as _;
use camino::Utf8Path;

use crate::{
    artifacts::{fetch_manifest, Artifacts, Manifest, OS_RELEASE},
    bootstrap::{self, StepEnv, CA_CERT_PATH},
    cache::{DownloadCache, Fetcher, HttpFetcher},
    cancel::CancelToken,
    ciserver::LOCAL_URL,
    config::Config,
    error::{Cancelled, FatalInstallError},
    guest::{GuestController, GuestStatus, Hypervisor, LaunchSpec},
    installer::{Dialogue, InstallInputs, InstallerDriver},
    poll::Backoff,
    profile::{self, CapacityError, HostProbe, LocalHost, Profile, Undersized},
    qemu::{QemuHypervisor, QEMU, QEMU_IMG},
    report::{RunReport, StepOutcome},
    runner::{
        run_script, MissingPrerequisites, RunOptions, Script, ScriptStep,
    },
    secrets::Credentials,
    shell::{
        reset_known_hosts, GuestAccess, GuestShell, SshAccess, SshIdentity,
    },
    token::{Clock, GuestTokenSource, SystemClock, TokenCache},
    trust::{
        self, choose_transport, CurlClient, HttpsClient, Transport, TrustStore,
    },
    ui::{confirm, Ui},
    util::{check_executable_prerequisites, temp_sibling},
};

/// The outside world, as the run sees it.
pub struct Services {
    pub hypervisor: Box<dyn Hypervisor>,
    pub fetcher: Arc<dyn Fetcher>,
    pub host: Box<dyn HostProbe>,
    pub access: Box<dyn GuestAccess>,
    pub trust_stores: Vec<Box<dyn TrustStore>>,
    pub https: Box<dyn HttpsClient>,
    pub clock: Box<dyn Clock>,
}

impl Services {
    /// QEMU, OpenSSH, curl, and this host's trust stores.
    pub fn real(config: &Config) -> Self {
        Self {
            hypervisor: Box::new(QemuHypervisor::new(config)),
            fetcher: Arc::new(HttpFetcher::new()),
            host: Box::new(LocalHost),
            access: Box::new(SshAccess),
            trust_stores: trust::host_stores(),
            https: Box::new(CurlClient),
            clock: Box::new(SystemClock),
        }
    }
}

/// Bounded waits used by the run.
#[derive(Clone, Copy, Debug)]
pub struct PhaseWaits {
    pub bootstrap: bootstrap::Waits,
    pub installer_power_off: Backoff,

    /// Caps each installer stage's time limit.
    pub installer_stage_cap: Option<Duration>,
}

impl Default for PhaseWaits {
    fn default() -> Self {
        Self {
            bootstrap: bootstrap::Waits::default(),
            installer_power_off: Backoff::INSTALLER_POWER_OFF,
            installer_stage_cap: None,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct ProvisionOptions {
    /// A profile name to use instead of the largest that fits.
    pub profile: Option<String>,
    pub accept_undersized: bool,

    /// Bootstrap steps to run; empty means all of them.
    pub steps: Vec<String>,
    pub waits: PhaseWaits,
}

/// Which run to perform.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    /// Everything, from an empty work directory or wherever the last run
    /// stopped.
    Provision,

    /// Configuration steps against an already-running guest, then the
    /// host-side phases that depend on them.
    Bootstrap,
}

/// The state a run accumulates as its phases complete.
pub struct Provisioning {
    config: Config,
    services: Services,
    options: ProvisionOptions,
    cancel: CancelToken,

    profile: Option<Profile>,
    credentials: Option<Credentials>,
    identity: Option<SshIdentity>,
    artifacts: Option<Artifacts>,
    transport: Option<Transport>,
    report: RunReport,
}

impl Provisioning {
    fn new(
        config: Config,
        services: Services,
        options: ProvisionOptions,
        cancel: CancelToken,
    ) -> Self {
        Self {
            config,
            services,
            options,
            cancel,
            profile: None,
            credentials: None,
            identity: None,
            artifacts: None,
            transport: None,
            report: RunReport::default(),
        }
    }

    fn profile(&self) -> anyhow::Result<&Profile> {
        self.profile
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("no guest profile was chosen"))
    }

    fn credentials(&self) -> anyhow::Result<&Credentials> {
        self.credentials
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("credentials were not loaded"))
    }

    fn identity(&self) -> anyhow::Result<&SshIdentity> {
        self.identity
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("the SSH key pair was not loaded"))
    }

    fn artifacts(&self) -> anyhow::Result<&Artifacts> {
        self.artifacts
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("artifacts were not downloaded"))
    }

    fn shell(&self) -> anyhow::Result<Arc<dyn GuestShell>> {
        Ok(self.services.access.shell(&self.config, self.identity()?))
    }

    fn guests(&self) -> GuestController<'_> {
        GuestController::new(
            &self.config,
            self.services.hypervisor.as_ref(),
            self.cancel.clone(),
        )
    }

    fn trust_label(&self) -> String {
        format!("cibox-{}", self.config.guest_name)
    }
}

pub struct ProvisionScript {
    steps: Vec<ScriptStep<Provisioning>>,
    summary: Vec<(&'static str, String)>,
    check_host_tools: bool,
}

impl ProvisionScript {
    pub fn new(
        mode: Mode,
        config: &Config,
        options: &ProvisionOptions,
    ) -> Self {
        let mut summary = vec![
            ("Guest", config.guest_name.clone()),
            ("Work directory", config.work_dir.to_string()),
            ("Artifact cache", config.cache_dir.to_string()),
            (
                "Ports",
                format!(
                    "ssh 127.0.0.1:{}, https 127.0.0.1:{}, \
                    console 127.0.0.1:{}",
                    config.ports.ssh, config.ports.https, config.ports.console
                ),
            ),
            ("Package mirror", config.sources.os_mirror.clone()),
        ];

        if mode == Mode::Bootstrap {
            let steps = if options.steps.is_empty() {
                "all".to_string()
            } else {
                options.steps.join(", ")
            };
            summary.push(("Steps", steps));
        }

        Self { steps: get_steps(mode), summary, check_host_tools: true }
    }
}

fn get_steps(mode: Mode) -> Vec<ScriptStep<Provisioning>> {
    let mut steps = Vec::new();
    if mode == Mode::Provision {
        steps.push(ScriptStep::with_prereqs(
            "Choose a guest profile",
            choose_profile,
            &["df"],
        ));
    }

    steps.push(ScriptStep::with_prereqs(
        "Load credentials",
        move |run: &mut Provisioning, ui: &dyn Ui| {
            load_credentials(run, ui, mode == Mode::Provision)
        },
        &["ssh-keygen"],
    ));
    steps.push(ScriptStep::new("Download artifacts", download_artifacts));

    match mode {
        Mode::Provision => {
            steps.push(ScriptStep::with_prereqs(
                "Install the guest operating system",
                install_guest_os,
                &[QEMU, QEMU_IMG],
            ));
            steps.push(ScriptStep::with_prereqs(
                "Boot the installed guest",
                boot_installed_guest,
                &[QEMU, QEMU_IMG],
            ));
        }
        Mode::Bootstrap => {
            steps.push(ScriptStep::new(
                "Check that the guest is running",
                require_running_guest,
            ));
        }
    }

    steps.push(ScriptStep::with_prereqs(
        "Configure the guest",
        configure_guest,
        &["ssh", "scp"],
    ));
    steps.push(
        ScriptStep::new(
            "Trust the guest's certificate authority",
            trust_guest_ca,
        )
        .continue_on_failure(),
    );
    steps.push(
        ScriptStep::new("Fetch the CI command-line client", fetch_cli_client)
            .continue_on_failure(),
    );
    steps.push(
        ScriptStep::new("Cache the CI access token", cache_token)
            .continue_on_failure(),
    );

    steps
}

impl Script<Provisioning> for ProvisionScript {
    fn steps(&self) -> &[ScriptStep<Provisioning>] {
        self.steps.as_slice()
    }

    fn print_configuration(&self, w: &mut dyn Write) -> std::io::Result<()> {
        writeln!(w, "cibox will provision a CI guest with these settings:")?;
        for (label, value) in &self.summary {
            writeln!(w, "  {label}: {value}")?;
        }
        Ok(())
    }

    fn check_prerequisites(&self) -> MissingPrerequisites {
        if !self.check_host_tools {
            return MissingPrerequisites::default();
        }

        let errors = check_executable_prerequisites(
            self.steps.iter().flat_map(|s| s.prereq_commands().iter().copied()),
        );

        // These only matter to phases whose failure the run survives.
        let warnings = check_executable_prerequisites(["curl"])
            .into_iter()
            .map(|w| {
                format!("{w}; the CI client will be fetched via the guest")
            })
            .collect();

        MissingPrerequisites::from_messages(errors, warnings)
    }
}

/// Runs `mode`'s phases and returns what happened.
pub fn run(
    mode: Mode,
    config: Config,
    services: Services,
    options: ProvisionOptions,
    cancel: CancelToken,
) -> anyhow::Result<RunReport> {
    let script = ProvisionScript::new(mode, &config, &options);
    run_with_script(&script, config, services, options, cancel)
}

fn run_with_script(
    script: &ProvisionScript,
    config: Config,
    services: Services,
    options: ProvisionOptions,
    cancel: CancelToken,
) -> anyhow::Result<RunReport> {
    let run_options =
        RunOptions { interactive: config.interactive, cancel: cancel.clone() };
    let mut run = Provisioning::new(config, services, options, cancel);
    let phases = run_script(script, &mut run, &run_options)?;
    run.report.phases = phases;
    Ok(run.report)
}

fn choose_profile(run: &mut Provisioning, ui: &dyn Ui) -> anyhow::Result<()> {
    let host = run.services.host.capacity(&run.config.work_dir, ui)?;
    log::info!("host capacity: {host}");
    let candidates = profile::candidates();
    let requested = run.options.profile.as_deref();
    let undersized = if run.options.accept_undersized {
        Undersized::Accept
    } else {
        Undersized::Refuse
    };

    let selection = profile::select(&host, &candidates, requested, undersized);
    let selection = match selection {
        Err(e)
            if run.config.interactive
                && e.downcast_ref::<CapacityError>().is_some() =>
        {
            println!("\n{e}");
            if !confirm("Provision an undersized guest anyway?")? {
                return Err(e);
            }
            profile::select(&host, &candidates, requested, Undersized::Accept)?
        }
        result => result?,
    };

    ui.set_substep(&format!("using profile {}", selection.profile));
    let json = serde_json::to_vec_pretty(&selection.profile)?;
    std::fs::write(run.config.profile_file(), json)
        .with_context(|| format!("writing {}", run.config.profile_file()))?;
    run.profile = Some(selection.profile);
    Ok(())
}

fn load_credentials(
    run: &mut Provisioning,
    ui: &dyn Ui,
    may_generate: bool,
) -> anyhow::Result<()> {
    std::fs::create_dir_all(&run.config.work_dir)
        .with_context(|| format!("creating {}", run.config.work_dir))?;

    let credentials = if may_generate {
        let (credentials, created) =
            Credentials::load_or_generate(&run.config)?;
        if created {
            ui.set_substep(&format!(
                "generated new credentials in {}",
                run.config.credentials_file()
            ));
        } else {
            log::info!(
                "reusing the credentials in {}",
                run.config.credentials_file()
            );
        }
        credentials
    } else {
        Credentials::load(&run.config.credentials_file()).context(
            "this guest has not been provisioned; run 'cibox provision' first",
        )?
    };

    run.identity = Some(run.services.access.identity(&run.config, ui)?);
    run.credentials = Some(credentials);
    Ok(())
}

fn download_artifacts(
    run: &mut Provisioning,
    ui: &dyn Ui,
) -> anyhow::Result<()> {
    let cache = DownloadCache::new(
        run.config.cache_dir.clone(),
        run.services.fetcher.clone(),
    );
    let manifest = Manifest::new(&run.config.sources);
    let artifacts = fetch_manifest(
        &cache,
        &manifest,
        run.config.sources.download_workers,
        ui,
    )?;
    run.artifacts = Some(artifacts);
    Ok(())
}

fn install_guest_os(run: &mut Provisioning, ui: &dyn Ui) -> anyhow::Result<()> {
    let marker = run.config.install_marker();
    if marker.exists() {
        ui.set_substep("already installed; skipping the installer");
        log::info!("{marker} exists; not reinstalling");
        return Ok(());
    }

    let guests = run.guests();
    if let GuestStatus::Running(handle) = guests.status()? {
        log::warn!("terminating guest pid {} to reinstall it", handle.pid);
        guests.terminate(&handle, ui)?;
    }

    // A reinstalled guest has a new host key and a blank system disk. The
    // data disk is kept.
    reset_known_hosts(&run.config)?;
    let system_disk = run.config.system_disk();
    if system_disk.exists() {
        std::fs::remove_file(&system_disk)
            .with_context(|| format!("removing {system_disk}"))?;
    }

    let profile = run.profile()?;
    let iso = &run.artifacts()?.installer.path;
    let spec = LaunchSpec::installer(&run.config, profile, iso);
    let handle = guests.start(&spec, ui)?;

    let result = (|| -> anyhow::Result<()> {
        let credentials = run.credentials()?;
        let identity = run.identity()?;
        let inputs = InstallInputs {
            hostname: run.config.guest_name.clone(),
            root_password: credentials.root.clone(),
            public_key: identity.public_key.clone(),
        };

        let dialogue = Dialogue::new()?;
        let mut console =
            run.services.hypervisor.attach_console(&run.cancel, ui)?;
        InstallerDriver::new(
            &dialogue,
            &inputs,
            &run.cancel,
            format!("the full console log is {}", run.config.console_log()),
        )
        .with_timeout_cap(run.options.waits.installer_stage_cap)
        .run(console.as_mut(), ui)?;

        ui.set_substep("waiting for the installer to power off");
        guests.wait_for_exit(
            &handle,
            &run.options.waits.installer_power_off,
            ui,
        )
    })();

    if let Err(e) = result {
        // Release the guest's ports before giving up.
        if let Err(kill) = guests.terminate(&handle, ui) {
            log::warn!("could not terminate the installer guest: {kill:#}");
        }

        if e.downcast_ref::<FatalInstallError>().is_some()
            || e.downcast_ref::<Cancelled>().is_some()
        {
            return Err(e);
        }

        return Err(FatalInstallError::new(format!("{e:#}"))
            .with_guidance(format!(
                "the full console log is {}",
                run.config.console_log()
            ))
            .with_guidance(
                "re-run 'cibox provision' to start the installation over",
            )
            .into());
    }

    std::fs::write(&marker, format!("OpenBSD {OS_RELEASE}\n"))
        .with_context(|| format!("writing {marker}"))?;
    Ok(())
}

fn boot_installed_guest(
    run: &mut Provisioning,
    ui: &dyn Ui,
) -> anyhow::Result<()> {
    let spec = LaunchSpec::installed(&run.config, run.profile()?);
    let handle = run.guests().start(&spec, ui)?;
    ui.set_substep(&format!("guest running as pid {}", handle.pid));
    Ok(())
}

fn require_running_guest(
    run: &mut Provisioning,
    _ui: &dyn Ui,
) -> anyhow::Result<()> {
    match run.guests().status()? {
        GuestStatus::Running(_) => Ok(()),
        _ => anyhow::bail!(
            "guest '{}' is not running; start it with 'cibox start'",
            run.config.guest_name
        ),
    }
}

fn configure_guest(run: &mut Provisioning, ui: &dyn Ui) -> anyhow::Result<()> {
    bootstrap::validate_selection(&run.options.steps)?;

    let shell = run.shell()?;
    let env = StepEnv {
        shell: shell.as_ref(),
        credentials: run.credentials()?,
        public_key: &run.identity()?.public_key,
        sources: &run.config.sources,
        artifacts: run.artifacts()?,
        cancel: &run.cancel,
        waits: run.options.waits.bootstrap,
    };

    let records = bootstrap::run(&env, &run.options.steps, ui);

    // A successful ci-server step issues a new token, revoking the old one.
    let reissued = records
        .iter()
        .any(|r| r.name == "ci-server" && r.outcome.is_success());
    if reissued {
        TokenCache::new(run.config.token_file(), run.services.clock.as_ref())
            .invalidate()?;
    }

    let failed = records.iter().filter(|r| r.outcome.is_failure()).count();
    if failed > 0 {
        ui.set_substep(&format!("{failed} configuration step(s) failed"));
    }
    run.report.install_steps = records;
    Ok(())
}

fn trust_guest_ca(run: &mut Provisioning, ui: &dyn Ui) -> anyhow::Result<()> {
    let shell = run.shell()?;
    ui.set_substep("retrieving the guest's CA certificate");
    let pem = shell
        .run(&format!("cat {CA_CERT_PATH}"))
        .context("retrieving the guest's CA certificate")?;
    if !pem.contains("-----BEGIN CERTIFICATE-----") {
        anyhow::bail!("{CA_CERT_PATH} in the guest is not a PEM certificate");
    }

    let ca = run.config.ca_certificate();
    std::fs::write(&ca, pem.as_bytes())
        .with_context(|| format!("writing {ca}"))?;

    let mut report = trust::propagate(
        &run.services.trust_stores,
        &ca,
        &run.trust_label(),
        ui,
    );

    ui.set_substep("checking the guest's HTTPS endpoint");
    let transport = choose_transport(
        run.services.https.as_ref(),
        &format!("{}login", run.config.https_url()),
        &ca,
    );
    report.transport = Some(transport);
    run.transport = Some(transport);

    let partial = report.partial();
    run.report.trust = Some(report);
    match partial {
        Some(partial) => Err(partial.into()),
        None => Ok(()),
    }
}

fn fetch_cli_client(run: &mut Provisioning, ui: &dyn Ui) -> anyhow::Result<()> {
    let dest = run.config.cli_jar();
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {parent}"))?;
    }

    let tmp = temp_sibling(&dest);
    let fetched = match run.transport {
        Some(Transport::VerifiedHttps) => {
            let url =
                format!("{}jnlpJars/jenkins-cli.jar", run.config.https_url());
            ui.set_substep(&format!("downloading {url}"));
            let ca = run.config.ca_certificate();
            run.services.https.download(&url, &ca, &tmp)
        }
        _ => {
            ui.set_substep("downloading the CI client through the guest");
            fetch_cli_through_guest(run.shell()?.as_ref(), &tmp)
        }
    };

    let result = fetched.and_then(|()| {
        std::fs::rename(&tmp, &dest)
            .with_context(|| format!("moving the CI client to {dest}"))
    });
    if result.is_err() {
        let _ = std::fs::remove_file(&tmp);
    }
    result
}

fn fetch_cli_through_guest(
    shell: &dyn GuestShell,
    dest: &Utf8Path,
) -> anyhow::Result<()> {
    const GUEST_COPY: &str = "/tmp/jenkins-cli.jar";
    shell.run(&format!(
        "ftp -M -V -o {GUEST_COPY} {LOCAL_URL}/jnlpJars/jenkins-cli.jar"
    ))?;
    shell.download(GUEST_COPY, dest)?;
    shell.run(&format!("rm -f {GUEST_COPY}"))?;
    Ok(())
}

fn cache_token(run: &mut Provisioning, ui: &dyn Ui) -> anyhow::Result<()> {
    let ci_server_ok = run
        .report
        .install_steps
        .iter()
        .find(|r| r.name == "ci-server")
        .map_or(true, |r| r.outcome == StepOutcome::Success);
    if !ci_server_ok {
        anyhow::bail!(
            "the ci-server step did not succeed, so there is no token"
        );
    }

    let shell = run.shell()?;
    let cache =
        TokenCache::new(run.config.token_file(), run.services.clock.as_ref());
    cache.get_token(&GuestTokenSource { shell: shell.as_ref() })?;
    ui.set_substep(&format!("token cached in {}", cache.path()));
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        bootstrap::test::{healthy_guest, quick_waits},
        cache::test::CountingFetcher,
        guest::test::FakeHypervisor,
        installer::test::{FULL_INSTALL, UNEXPECTED_PROMPT},
        profile::HostCapacity,
        report::{FailureKind, Verdict},
        shell::test::{FakeAccess, FakeShell},
        trust::test::{FakeHttps, FakeStore},
    };
    use camino::Utf8PathBuf;
    use std::sync::Mutex;

    const CA_PEM: &str =
        "-----BEGIN CERTIFICATE-----\nMIIB\n-----END CERTIFICATE-----\n";

    /// A host exactly big enough for the smallest profile.
    struct MinimumHost;

    impl HostProbe for MinimumHost {
        fn capacity(
            &self,
            _work_dir: &Utf8Path,
            _ui: &dyn Ui,
        ) -> anyhow::Result<HostCapacity> {
            Ok(HostCapacity { memory_mb: 3072, cpus: 2, free_disk_gb: 40 })
        }
    }

    struct Harness {
        _dir: tempfile::TempDir,
        config: Config,
        hypervisor: Arc<FakeHypervisor>,
        shell: Arc<FakeShell>,
        fetcher: Arc<CountingFetcher>,
        https_verifies: bool,
    }

    /// Shares a fake hypervisor with the run so the test can inspect it.
    struct SharedHypervisor(Arc<FakeHypervisor>);

    impl Hypervisor for SharedHypervisor {
        fn prepare_disk(
            &self,
            path: &Utf8Path,
            size_gb: u64,
            ui: &dyn Ui,
        ) -> anyhow::Result<()> {
            self.0.prepare_disk(path, size_gb, ui)
        }

        fn launch(
            &self,
            spec: &LaunchSpec,
            ui: &dyn Ui,
        ) -> anyhow::Result<u32> {
            self.0.launch(spec, ui)
        }

        fn attach_console(
            &self,
            cancel: &CancelToken,
            ui: &dyn Ui,
        ) -> anyhow::Result<Box<dyn crate::console::Console>> {
            self.0.attach_console(cancel, ui)
        }

        fn is_alive(&self, pid: u32) -> bool {
            self.0.is_alive(pid)
        }

        fn signal(
            &self,
            pid: u32,
            signal: nix::sys::signal::Signal,
        ) -> anyhow::Result<()> {
            self.0.signal(pid, signal)
        }
    }

    fn harness(transcript: &str) -> Harness {
        harness_with(transcript, FakeShell::default(), true)
    }

    /// `guest` rules are checked before those of a healthy guest.
    fn harness_with(
        transcript: &str,
        guest: FakeShell,
        https_verifies: bool,
    ) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let work =
            Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        let mut config = Config::for_test(&work);
        config.guest_name = "cibox".to_string();

        let shell = healthy_guest(
            guest
                .on("cat /etc/ssl/cibox/ca.crt", 0, CA_PEM)
                .on("cat /var/ci/secrets/provisioner.token", 0, "11aa22bb\n"),
        );

        let fetcher = Arc::new(CountingFetcher::publishing(
            Manifest::new(&config.sources).requests(),
        ));
        Harness {
            _dir: dir,
            config,
            hypervisor: Arc::new(FakeHypervisor::with_transcript(transcript)),
            shell: Arc::new(shell),
            fetcher,
            https_verifies,
        }
    }

    impl Harness {
        fn services(&self) -> Services {
            Services {
                hypervisor: Box::new(SharedHypervisor(self.hypervisor.clone())),
                fetcher: self.fetcher.clone(),
                host: Box::new(MinimumHost),
                access: Box::new(FakeAccess { shell: self.shell.clone() }),
                trust_stores: vec![Box::new(FakeStore::installing())],
                https: Box::new(FakeHttps {
                    verifies: self.https_verifies,
                    downloads: Mutex::new(Vec::new()),
                }),
                clock: Box::new(SystemClock),
            }
        }

        fn run(&self, mode: Mode) -> RunReport {
            let options = ProvisionOptions {
                waits: PhaseWaits {
                    bootstrap: quick_waits(),
                    installer_power_off: Backoff::quick(1000),
                    installer_stage_cap: Some(Duration::from_secs(1)),
                },
                ..Default::default()
            };
            let mut script = ProvisionScript::new(mode, &self.config, &options);
            script.check_host_tools = false;
            run_with_script(
                &script,
                self.config.clone(),
                self.services(),
                options,
                CancelToken::new(),
            )
            .unwrap()
        }
    }

    #[test]
    fn fresh_run_on_a_minimum_host_succeeds() {
        let h = harness(FULL_INSTALL);
        let report = h.run(Mode::Provision);

        assert_eq!(report.verdict(), Verdict::Success, "{report:#?}");
        assert_eq!(report.install_steps.len(), 7);
        assert!(report.install_steps.iter().all(|r| r.outcome.is_success()));

        // The smallest profile, and both the installer and the installed
        // system were booted.
        let launches = h.hypervisor.launches.lock().unwrap();
        assert_eq!(launches.len(), 2);
        assert_eq!(launches[0].profile.name, "small");
        assert!(launches[0].paused && launches[0].boot_iso.is_some());
        assert!(launches[1].boot_iso.is_none());
        drop(launches);

        assert!(h.config.install_marker().exists());
        assert!(h.config.cli_jar().exists());
        assert!(h.config.token_file().exists());
        assert_eq!(
            std::fs::read_to_string(h.config.ca_certificate()).unwrap(),
            CA_PEM
        );
        let trust = report.trust.unwrap();
        assert_eq!(trust.transport, Some(Transport::VerifiedHttps));

        // A second run reuses the cache and skips the installer.
        let fetches = h.fetcher.calls();
        let again = h.run(Mode::Provision);
        assert_eq!(again.verdict(), Verdict::Success);
        assert_eq!(h.fetcher.calls(), fetches);
        assert_eq!(h.hypervisor.launch_count(), 2);
    }

    #[test]
    fn unexpected_installer_prompt_is_fatal() {
        let h = harness(UNEXPECTED_PROMPT);
        let started = std::time::Instant::now();
        let report = h.run(Mode::Provision);

        // The stage cap bounds the wait for a prompt that never comes.
        assert!(started.elapsed() < Duration::from_secs(30));
        assert_eq!(report.verdict(), Verdict::Fatal);
        let install = &report.phases[3];
        match &install.outcome {
            StepOutcome::Failed { kind, .. } => {
                assert_eq!(*kind, FailureKind::Fatal)
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert!(!install.guidance.is_empty());

        // Nothing ran in the guest, and the installer guest was killed.
        assert!(report.install_steps.is_empty());
        assert_eq!(h.shell.command_count(), 0);
        assert!(report.phases[4..]
            .iter()
            .all(|p| matches!(p.outcome, StepOutcome::Skipped { .. })));
        assert!(!h.config.install_marker().exists());
        assert!(!h.config.pid_file().exists());
    }

    #[test]
    fn bootstrap_requires_a_provisioned_running_guest() {
        let h = harness(FULL_INSTALL);
        let report = h.run(Mode::Bootstrap);
        assert_eq!(report.verdict(), Verdict::Fatal);
        assert!(report.phases[0].outcome.is_failure());

        h.run(Mode::Provision);
        let before = h.shell.command_count();
        let report = h.run(Mode::Bootstrap);
        assert_eq!(report.verdict(), Verdict::Success, "{report:#?}");
        assert_eq!(report.install_steps.len(), 7);
        assert!(h.shell.command_count() > before);
    }

    #[test]
    fn unverified_https_fetches_the_client_through_the_guest() {
        let guest = FakeShell::default()
            .with_file("/tmp/jenkins-cli.jar", b"PK guest jar");
        let h = harness_with(FULL_INSTALL, guest, false);
        let report = h.run(Mode::Provision);

        assert_eq!(report.verdict(), Verdict::Success, "{report:#?}");
        let trust = report.trust.unwrap();
        assert_eq!(trust.transport, Some(Transport::GuestShell));
        assert!(h.shell.ran("ftp -M -V -o /tmp/jenkins-cli.jar"));
        assert_eq!(std::fs::read(h.config.cli_jar()).unwrap(), b"PK guest jar");
    }
}
