// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Guest lifecycle: one guest process per guest name, tracked through a pid
//! record in the work directory.

use anyhow::Context as _;
use camino::{Utf8Path, Utf8PathBuf};
use nix::sys::signal::Signal;
use serde::{Deserialize, Serialize};

use crate::{
    cancel::CancelToken,
    config::Config,
    console::Console,
    poll::{poll_until, Backoff},
    profile::Profile,
    shell::GuestShell,
    ui::Ui,
    util::write_private_file,
};

/// What to boot.
#[derive(Clone, Debug)]
pub struct LaunchSpec {
    pub name: String,
    pub profile: Profile,
    pub system_disk: Utf8PathBuf,
    pub data_disk: Utf8PathBuf,

    /// Installation media to boot from instead of the system disk.
    pub boot_iso: Option<Utf8PathBuf>,

    /// Leaves the guest's CPUs stopped until its console is attached.
    pub paused: bool,
}

impl LaunchSpec {
    pub fn installed(config: &Config, profile: &Profile) -> Self {
        Self {
            name: config.guest_name.clone(),
            profile: profile.clone(),
            system_disk: config.system_disk(),
            data_disk: config.data_disk(),
            boot_iso: None,
            paused: false,
        }
    }

    pub fn installer(
        config: &Config,
        profile: &Profile,
        iso: &Utf8Path,
    ) -> Self {
        Self {
            boot_iso: Some(iso.to_owned()),
            paused: true,
            ..Self::installed(config, profile)
        }
    }
}

/// The virtual machine monitor the controller drives.
pub trait Hypervisor {
    /// Creates a blank disk image at `path` unless one already exists.
    fn prepare_disk(
        &self,
        path: &Utf8Path,
        size_gb: u64,
        ui: &dyn Ui,
    ) -> anyhow::Result<()>;

    /// Starts a guest and returns its process ID.
    fn launch(&self, spec: &LaunchSpec, ui: &dyn Ui) -> anyhow::Result<u32>;

    /// Connects to the serial console of the guest most recently launched,
    /// resuming it if it was launched paused.
    fn attach_console(
        &self,
        cancel: &CancelToken,
        ui: &dyn Ui,
    ) -> anyhow::Result<Box<dyn Console>>;

    fn is_alive(&self, pid: u32) -> bool;

    fn signal(&self, pid: u32, signal: Signal) -> anyhow::Result<()>;
}

/// The on-disk pid record.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
struct PidRecord {
    pid: u32,
    ssh_port: u16,
    https_port: u16,
}

/// A running guest.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GuestHandle {
    pub pid: u32,
    pub ssh_port: u16,
    pub https_port: u16,
    pub pid_file: Utf8PathBuf,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GuestStatus {
    Running(GuestHandle),

    /// No guest has been started, or it was stopped cleanly.
    Stopped,

    /// A pid record was left behind by a guest that is no longer running.
    /// The record has been removed.
    Stale { pid: u32 },
}

pub struct GuestController<'a> {
    config: &'a Config,
    hypervisor: &'a dyn Hypervisor,
    cancel: CancelToken,
    shutdown_wait: Backoff,
    terminate_wait: Backoff,
}

impl<'a> GuestController<'a> {
    pub fn new(
        config: &'a Config,
        hypervisor: &'a dyn Hypervisor,
        cancel: CancelToken,
    ) -> Self {
        Self {
            config,
            hypervisor,
            cancel,
            shutdown_wait: Backoff::SHUTDOWN,
            terminate_wait: Backoff::TERMINATE,
        }
    }

    #[cfg(test)]
    pub(crate) fn with_shutdown_wait(mut self, backoff: Backoff) -> Self {
        self.shutdown_wait = backoff;
        self
    }

    #[cfg(test)]
    pub(crate) fn with_terminate_wait(mut self, backoff: Backoff) -> Self {
        self.terminate_wait = backoff;
        self
    }

    fn read_record(&self) -> anyhow::Result<Option<PidRecord>> {
        let path = self.config.pid_file();
        let contents = match std::fs::read(&path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(None)
            }
            Err(e) => {
                return Err(anyhow::Error::new(e)
                    .context(format!("reading pid record {path}")))
            }
        };

        match serde_json::from_slice(&contents) {
            Ok(record) => Ok(Some(record)),
            Err(e) => {
                // Treat an unreadable record like one whose guest is gone.
                log::warn!("ignoring unparseable pid record {path}: {e}");
                self.clear_record()?;
                Ok(None)
            }
        }
    }

    fn clear_record(&self) -> anyhow::Result<()> {
        let path = self.config.pid_file();
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => {
                Err(anyhow::Error::new(e).context(format!("removing {path}")))
            }
        }
    }

    fn handle(&self, record: &PidRecord) -> GuestHandle {
        GuestHandle {
            pid: record.pid,
            ssh_port: record.ssh_port,
            https_port: record.https_port,
            pid_file: self.config.pid_file(),
        }
    }

    pub fn status(&self) -> anyhow::Result<GuestStatus> {
        let Some(record) = self.read_record()? else {
            return Ok(GuestStatus::Stopped);
        };

        if self.hypervisor.is_alive(record.pid) {
            return Ok(GuestStatus::Running(self.handle(&record)));
        }

        log::info!(
            "guest '{}' pid {} is gone; clearing its stale record",
            self.config.guest_name,
            record.pid
        );
        self.clear_record()?;
        Ok(GuestStatus::Stale { pid: record.pid })
    }

    /// Starts the guest described by `spec`, or returns the handle of the
    /// guest that is already running under this name.
    pub fn start(
        &self,
        spec: &LaunchSpec,
        ui: &dyn Ui,
    ) -> anyhow::Result<GuestHandle> {
        if let GuestStatus::Running(handle) = self.status()? {
            log::info!(
                "guest '{}' is already running as pid {}",
                self.config.guest_name,
                handle.pid
            );
            return Ok(handle);
        }

        ui.set_substep("preparing disks");
        self.hypervisor.prepare_disk(
            &spec.system_disk,
            spec.profile.system_disk_gb,
            ui,
        )?;
        self.hypervisor.prepare_disk(
            &spec.data_disk,
            spec.profile.data_disk_gb,
            ui,
        )?;

        ui.set_substep("launching guest");
        let pid = self.hypervisor.launch(spec, ui)?;
        let record = PidRecord {
            pid,
            ssh_port: self.config.ports.ssh,
            https_port: self.config.ports.https,
        };

        let json = serde_json::to_vec_pretty(&record)?;
        write_private_file(&self.config.pid_file(), &json)
            .context("recording guest pid")?;

        log::info!("guest '{}' started as pid {pid}", self.config.guest_name);
        Ok(self.handle(&record))
    }

    /// Waits up to `backoff`'s budget for the guest process to exit on its
    /// own, then clears its record.
    pub fn wait_for_exit(
        &self,
        handle: &GuestHandle,
        backoff: &Backoff,
        ui: &dyn Ui,
    ) -> anyhow::Result<()> {
        poll_until("guest power-off", backoff, &self.cancel, ui, || {
            if self.hypervisor.is_alive(handle.pid) {
                anyhow::bail!("pid {} still running", handle.pid);
            }
            Ok(())
        })?;

        self.clear_record()
    }

    /// Stops the guest: first asks it to power off through `shell`, then
    /// escalates to SIGTERM and finally SIGKILL.
    pub fn stop(
        &self,
        handle: &GuestHandle,
        shell: Option<&dyn GuestShell>,
        ui: &dyn Ui,
    ) -> anyhow::Result<()> {
        if let Some(shell) = shell {
            ui.set_substep("asking the guest to power off");
            // The connection usually drops mid-command as the guest goes
            // down, so the result says little.
            if let Err(e) = shell.run("halt -p") {
                log::debug!("power-off request: {e:#}");
            }

            match self.wait_for_exit(handle, &self.shutdown_wait, ui) {
                Ok(()) => return Ok(()),
                Err(e) => log::warn!("guest did not power off: {e:#}"),
            }
        }

        self.terminate(handle, ui)
    }

    /// Kills the guest process without asking the guest first.
    pub fn terminate(
        &self,
        handle: &GuestHandle,
        ui: &dyn Ui,
    ) -> anyhow::Result<()> {
        for signal in [Signal::SIGTERM, Signal::SIGKILL] {
            if !self.hypervisor.is_alive(handle.pid) {
                break;
            }

            ui.set_substep(&format!(
                "sending {signal:?} to pid {}",
                handle.pid
            ));
            self.hypervisor.signal(handle.pid, signal)?;

            // A cancelled run still has to release the guest's ports, so this
            // wait doesn't honor cancellation.
            let uncancellable = CancelToken::new();
            let exited = poll_until(
                "guest process exit",
                &self.terminate_wait,
                &uncancellable,
                ui,
                || {
                    if self.hypervisor.is_alive(handle.pid) {
                        anyhow::bail!("pid {} still running", handle.pid);
                    }
                    Ok(())
                },
            );

            if exited.is_ok() {
                break;
            }
        }

        if self.hypervisor.is_alive(handle.pid) {
            anyhow::bail!("guest pid {} survived SIGKILL", handle.pid);
        }

        self.clear_record()
    }
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;
    use crate::{
        console::ReplayConsole,
        profile::candidates,
        shell::{test::FakeShell, CommandOutput},
        ui::LogUi,
    };
    use std::{
        collections::HashSet,
        sync::{Arc, Mutex},
    };

    /// A hypervisor whose guests are entries in a set of live pids.
    #[derive(Default)]
    pub(crate) struct FakeHypervisor {
        pub launches: Mutex<Vec<LaunchSpec>>,
        pub live: Arc<Mutex<HashSet<u32>>>,
        pub disks: Mutex<Vec<Utf8PathBuf>>,
        pub signals: Mutex<Vec<Signal>>,
        pub transcript: Mutex<Option<String>>,

        /// Whether SIGTERM is enough to end the guest.
        pub ignore_sigterm: bool,
    }

    impl FakeHypervisor {
        pub fn with_transcript(transcript: &str) -> Self {
            let fake = Self::default();
            *fake.transcript.lock().unwrap() = Some(transcript.to_string());
            fake
        }

        pub fn launch_count(&self) -> usize {
            self.launches.lock().unwrap().len()
        }

        pub fn kill_all(&self) {
            self.live.lock().unwrap().clear();
        }
    }

    /// A replayed console whose guest exits once told to halt.
    struct HaltingConsole {
        inner: ReplayConsole,
        live: Arc<Mutex<HashSet<u32>>>,
        pid: u32,
    }

    impl Console for HaltingConsole {
        fn read(
            &mut self,
            timeout: std::time::Duration,
        ) -> std::io::Result<crate::console::ConsoleRead> {
            self.inner.read(timeout)
        }

        fn send_line(&mut self, line: &str) -> std::io::Result<()> {
            self.inner.send_line(line)?;
            if line.contains("halt -p") {
                self.live.lock().unwrap().remove(&self.pid);
            }
            Ok(())
        }
    }

    /// A guest shell whose guest powers off when asked to halt.
    struct HaltingShell {
        inner: FakeShell,
        live: Arc<Mutex<HashSet<u32>>>,
        pid: u32,
    }

    impl GuestShell for HaltingShell {
        fn exec(
            &self,
            command: &str,
            input: Option<&[u8]>,
        ) -> anyhow::Result<CommandOutput> {
            let output = self.inner.exec(command, input)?;
            if command.contains("halt -p") {
                self.live.lock().unwrap().remove(&self.pid);
            }
            Ok(output)
        }

        fn upload(&self, local: &Utf8Path, remote: &str) -> anyhow::Result<()> {
            self.inner.upload(local, remote)
        }

        fn download(
            &self,
            remote: &str,
            local: &Utf8Path,
        ) -> anyhow::Result<()> {
            self.inner.download(remote, local)
        }
    }

    impl Hypervisor for FakeHypervisor {
        fn prepare_disk(
            &self,
            path: &Utf8Path,
            _size_gb: u64,
            _ui: &dyn Ui,
        ) -> anyhow::Result<()> {
            self.disks.lock().unwrap().push(path.to_owned());
            Ok(())
        }

        fn launch(
            &self,
            spec: &LaunchSpec,
            _ui: &dyn Ui,
        ) -> anyhow::Result<u32> {
            let mut launches = self.launches.lock().unwrap();
            launches.push(spec.clone());
            let pid = 40_000 + launches.len() as u32;
            self.live.lock().unwrap().insert(pid);
            Ok(pid)
        }

        fn attach_console(
            &self,
            _cancel: &CancelToken,
            _ui: &dyn Ui,
        ) -> anyhow::Result<Box<dyn Console>> {
            let transcript =
                self.transcript.lock().unwrap().clone().unwrap_or_default();
            Ok(Box::new(HaltingConsole {
                inner: ReplayConsole::from_transcript(&transcript),
                live: self.live.clone(),
                pid: 40_000 + self.launch_count() as u32,
            }))
        }

        fn is_alive(&self, pid: u32) -> bool {
            self.live.lock().unwrap().contains(&pid)
        }

        fn signal(&self, pid: u32, signal: Signal) -> anyhow::Result<()> {
            self.signals.lock().unwrap().push(signal);
            if signal == Signal::SIGKILL || !self.ignore_sigterm {
                self.live.lock().unwrap().remove(&pid);
            }
            Ok(())
        }
    }

    fn setup() -> (tempfile::TempDir, Config) {
        let dir = tempfile::tempdir().unwrap();
        let work =
            Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        let config = Config::for_test(&work);
        (dir, config)
    }

    fn spec(config: &Config) -> LaunchSpec {
        LaunchSpec::installed(config, &candidates()[2])
    }

    #[test]
    fn start_is_idempotent() {
        let (_dir, config) = setup();
        let hypervisor = FakeHypervisor::default();
        let guests =
            GuestController::new(&config, &hypervisor, CancelToken::new());

        let first = guests.start(&spec(&config), &LogUi).unwrap();
        let second = guests.start(&spec(&config), &LogUi).unwrap();
        assert_eq!(first, second);
        assert_eq!(hypervisor.launch_count(), 1);
        assert_eq!(first.ssh_port, 2222);

        let record: PidRecord =
            serde_json::from_slice(&std::fs::read(config.pid_file()).unwrap())
                .unwrap();
        assert_eq!(record.pid, first.pid);
    }

    #[test]
    fn status_reports_and_clears_stale_records() {
        let (_dir, config) = setup();
        let hypervisor = FakeHypervisor::default();
        let guests =
            GuestController::new(&config, &hypervisor, CancelToken::new());

        assert_eq!(guests.status().unwrap(), GuestStatus::Stopped);

        let handle = guests.start(&spec(&config), &LogUi).unwrap();
        assert_eq!(
            guests.status().unwrap(),
            GuestStatus::Running(handle.clone())
        );

        hypervisor.kill_all();
        assert_eq!(
            guests.status().unwrap(),
            GuestStatus::Stale { pid: handle.pid }
        );
        assert!(!config.pid_file().exists());
        assert_eq!(guests.status().unwrap(), GuestStatus::Stopped);

        // With the stale record gone, start launches a fresh guest.
        let fresh = guests.start(&spec(&config), &LogUi).unwrap();
        assert_ne!(fresh.pid, handle.pid);
        assert_eq!(hypervisor.launch_count(), 2);
    }

    #[test]
    fn terminate_escalates_to_sigkill() {
        let (_dir, config) = setup();
        let hypervisor =
            FakeHypervisor { ignore_sigterm: true, ..Default::default() };
        let guests =
            GuestController::new(&config, &hypervisor, CancelToken::new())
                .with_terminate_wait(Backoff::quick(20));

        let handle = guests.start(&spec(&config), &LogUi).unwrap();
        guests.terminate(&handle, &LogUi).unwrap();

        assert_eq!(
            *hypervisor.signals.lock().unwrap(),
            [Signal::SIGTERM, Signal::SIGKILL]
        );
        assert_eq!(guests.status().unwrap(), GuestStatus::Stopped);
    }

    #[test]
    fn stop_lets_a_halting_guest_power_off() {
        let (_dir, config) = setup();
        let hypervisor = FakeHypervisor::default();
        let guests =
            GuestController::new(&config, &hypervisor, CancelToken::new())
                .with_shutdown_wait(Backoff::quick(200));

        let handle = guests.start(&spec(&config), &LogUi).unwrap();
        let shell = HaltingShell {
            inner: FakeShell::default(),
            live: hypervisor.live.clone(),
            pid: handle.pid,
        };
        guests.stop(&handle, Some(&shell), &LogUi).unwrap();

        assert!(shell.inner.ran("halt -p"));
        assert!(hypervisor.signals.lock().unwrap().is_empty());
        assert_eq!(guests.status().unwrap(), GuestStatus::Stopped);
    }

    #[test]
    fn stop_terminates_a_guest_that_ignores_halt() {
        let (_dir, config) = setup();
        let hypervisor = FakeHypervisor::default();
        let guests =
            GuestController::new(&config, &hypervisor, CancelToken::new())
                .with_shutdown_wait(Backoff::quick(30))
                .with_terminate_wait(Backoff::quick(20));

        let handle = guests.start(&spec(&config), &LogUi).unwrap();
        let shell = FakeShell::default();
        guests.stop(&handle, Some(&shell), &LogUi).unwrap();

        assert!(shell.ran("halt -p"));
        assert_eq!(*hypervisor.signals.lock().unwrap(), [Signal::SIGTERM]);
        assert!(!hypervisor.is_alive(handle.pid));
        assert_eq!(guests.status().unwrap(), GuestStatus::Stopped);
    }
}
