// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Runs the guest under QEMU.

use std::{io::Write, net::TcpStream, process::Command};

use anyhow::Context as _;
use camino::{Utf8Path, Utf8PathBuf};
use nix::{sys::signal, unistd::Pid};

use crate::{
    cancel::CancelToken,
    config::{Config, GuestPorts},
    console::{Console, TcpConsole},
    guest::{Hypervisor, LaunchSpec},
    poll::{poll_until, Backoff},
    ui::Ui,
};

pub const QEMU: &str = "qemu-system-x86_64";
pub const QEMU_IMG: &str = "qemu-img";

pub struct QemuHypervisor {
    ports: GuestPorts,
    qemu_pid_file: Utf8PathBuf,
    console_log: Utf8PathBuf,
}

impl QemuHypervisor {
    pub fn new(config: &Config) -> Self {
        Self {
            ports: config.ports,
            qemu_pid_file: config.qemu_pid_file(),
            console_log: config.console_log(),
        }
    }

    /// The QEMU monitor listens one port above the serial console.
    fn monitor_port(&self) -> u16 {
        self.ports.console.saturating_add(1)
    }

    fn launch_args(&self, spec: &LaunchSpec) -> Vec<String> {
        let (accel, cpu) = accelerator();
        let mut args: Vec<String> = [
            "-name",
            &spec.name,
            "-nodefaults",
            "-machine",
            "q35",
            "-accel",
            accel,
            "-cpu",
            cpu,
            "-m",
            &spec.profile.memory_mb.to_string(),
            "-smp",
            &spec.profile.vcpus.to_string(),
            "-rtc",
            "base=utc",
            // User-mode networking with the guest's SSH and HTTPS services
            // forwarded to host loopback ports.
            "-netdev",
            &format!(
                "user,id=net0,hostfwd=tcp:127.0.0.1:{}-:22,\
                hostfwd=tcp:127.0.0.1:{}-:443",
                self.ports.ssh, self.ports.https
            ),
            "-device",
            "virtio-net-pci,netdev=net0",
            "-drive",
            &format!("if=virtio,format=qcow2,file={}", spec.system_disk),
            "-drive",
            &format!("if=virtio,format=qcow2,file={}", spec.data_disk),
            // The serial console is the only console. QEMU listens for a
            // single client and drops output while nobody is connected.
            "-serial",
            &format!(
                "tcp:127.0.0.1:{},server=on,wait=off",
                self.ports.console
            ),
            // The monitor lets the driver resume a guest launched paused.
            "-monitor",
            &format!(
                "tcp:127.0.0.1:{},server=on,wait=off",
                self.monitor_port()
            ),
            "-display",
            "none",
            "-daemonize",
            "-pidfile",
            self.qemu_pid_file.as_str(),
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();

        if let Some(iso) = &spec.boot_iso {
            args.extend([
                "-drive".to_string(),
                format!("media=cdrom,readonly=on,file={iso}"),
                "-boot".to_string(),
                "once=d".to_string(),
            ]);
        }

        if spec.paused {
            args.push("-S".to_string());
        }

        args
    }

    fn read_pid_file(&self) -> anyhow::Result<u32> {
        let contents = std::fs::read_to_string(&self.qemu_pid_file)
            .with_context(|| format!("reading {}", self.qemu_pid_file))?;
        contents.trim().parse().with_context(|| {
            format!("parsing pid {:?} from {}", contents, self.qemu_pid_file)
        })
    }

    fn resume(&self) -> anyhow::Result<()> {
        let mut monitor =
            TcpStream::connect(("127.0.0.1", self.monitor_port()))
                .context("connecting to the QEMU monitor")?;
        monitor.write_all(b"cont\n")?;
        monitor.flush()?;
        Ok(())
    }
}

/// Picks hardware acceleration where the host offers it.
fn accelerator() -> (&'static str, &'static str) {
    if cfg!(target_os = "macos") {
        ("hvf", "host")
    } else if Utf8Path::new("/dev/kvm").exists() {
        ("kvm", "host")
    } else {
        log::warn!(
            "/dev/kvm not found; the guest will run without acceleration"
        );
        ("tcg", "qemu64")
    }
}

impl Hypervisor for QemuHypervisor {
    fn prepare_disk(
        &self,
        path: &Utf8Path,
        size_gb: u64,
        ui: &dyn Ui,
    ) -> anyhow::Result<()> {
        if path.exists() {
            log::debug!("disk {path} already exists");
            return Ok(());
        }

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        crate::util::run_command_check_status(
            Command::new(QEMU_IMG).args([
                "create",
                "-f",
                "qcow2",
                path.as_str(),
                &format!("{size_gb}G"),
            ]),
            ui,
        )
        .map(|_| ())
    }

    fn launch(&self, spec: &LaunchSpec, ui: &dyn Ui) -> anyhow::Result<u32> {
        let _ = std::fs::remove_file(&self.qemu_pid_file);

        // With -daemonize the foreground process exits once the guest is set
        // up, leaving the guest running as a daemon that isn't our child.
        crate::util::run_command_check_status(
            Command::new(QEMU).args(self.launch_args(spec)),
            ui,
        )
        .context("launching QEMU")?;

        self.read_pid_file()
    }

    fn attach_console(
        &self,
        cancel: &CancelToken,
        ui: &dyn Ui,
    ) -> anyhow::Result<Box<dyn Console>> {
        let console = poll_until(
            "guest serial console",
            &Backoff::CONSOLE,
            cancel,
            ui,
            || TcpConsole::connect(self.ports.console, Some(&self.console_log)),
        )?;

        // Only resumed once the console is attached, so the boot loader's
        // prompt can't be printed to nobody.
        self.resume()?;
        Ok(Box::new(console))
    }

    fn is_alive(&self, pid: u32) -> bool {
        match signal::kill(Pid::from_raw(pid as i32), None) {
            Ok(()) => true,
            Err(nix::errno::Errno::EPERM) => true,
            Err(_) => false,
        }
    }

    fn signal(&self, pid: u32, sig: signal::Signal) -> anyhow::Result<()> {
        match signal::kill(Pid::from_raw(pid as i32), sig) {
            Ok(()) | Err(nix::errno::Errno::ESRCH) => Ok(()),
            Err(e) => Err(anyhow::anyhow!("sending {sig:?} to pid {pid}: {e}")),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::profile::candidates;

    #[test]
    fn installer_launch_arguments() {
        let config = Config::for_test(Utf8Path::new("/w"));
        let qemu = QemuHypervisor::new(&config);
        let spec = LaunchSpec {
            name: "test".to_string(),
            profile: candidates().pop().unwrap(),
            system_disk: config.system_disk(),
            data_disk: config.data_disk(),
            boot_iso: Some(Utf8PathBuf::from("/cache/install76.iso")),
            paused: true,
        };

        let args = qemu.launch_args(&spec).join(" ");
        assert!(args.contains("-m 2048 -smp 2"));
        assert!(args.contains(
            "hostfwd=tcp:127.0.0.1:2222-:22,hostfwd=tcp:127.0.0.1:8443-:443"
        ));
        assert!(args.contains("-serial tcp:127.0.0.1:4555,server=on,wait=off"));
        assert!(args.contains("-monitor tcp:127.0.0.1:4556"));
        assert!(args.contains("file=/w/test-system.qcow2"));
        assert!(args.contains("file=/cache/install76.iso -boot once=d"));
        assert!(args.ends_with("-S"));
        assert!(args.contains("-daemonize -pidfile /w/test.qemu.pid"));
    }

    #[test]
    fn installed_launch_boots_from_disk() {
        let config = Config::for_test(Utf8Path::new("/w"));
        let qemu = QemuHypervisor::new(&config);
        let spec = LaunchSpec {
            name: "test".to_string(),
            profile: candidates().remove(0),
            system_disk: config.system_disk(),
            data_disk: config.data_disk(),
            boot_iso: None,
            paused: false,
        };

        let args = qemu.launch_args(&spec);
        assert!(!args.iter().any(|a| a.contains("cdrom")));
        assert!(!args.iter().any(|a| a == "-S"));
    }

    #[test]
    fn liveness_of_own_process() {
        let config = Config::for_test(Utf8Path::new("/w"));
        let qemu = QemuHypervisor::new(&config);
        assert!(qemu.is_alive(std::process::id()));
    }
}
