// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Running commands in the guest over SSH.

use std::{
    io::Write,
    process::{Command, Stdio},
    sync::Arc,
};

use anyhow::Context as _;
use camino::{Utf8Path, Utf8PathBuf};

use crate::{config::Config, ui::Ui, util::run_command_check_status};

/// ssh's exit status when the connection itself failed.
const SSH_CONNECTION_FAILED: i32 = 255;

/// What a guest command produced.
#[derive(Clone, Debug, Default)]
pub struct CommandOutput {
    pub status: Option<i32>,
    pub stdout: Vec<u8>,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }

    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }
}

/// A shell in the guest.
///
/// Secrets are passed to commands on standard input, never as part of the
/// command line, which ends up in process listings and logs.
pub trait GuestShell {
    /// Runs `command` with `input` on its standard input. Returns `Err` only
    /// if the command couldn't be run at all.
    fn exec(
        &self,
        command: &str,
        input: Option<&[u8]>,
    ) -> anyhow::Result<CommandOutput>;

    /// Copies a host file into the guest.
    fn upload(&self, local: &Utf8Path, remote: &str) -> anyhow::Result<()>;

    /// Copies a guest file to the host.
    fn download(&self, remote: &str, local: &Utf8Path) -> anyhow::Result<()>;

    /// Runs `command` and returns its standard output, failing if it exits
    /// unsuccessfully.
    fn run(&self, command: &str) -> anyhow::Result<String> {
        check(command, self.exec(command, None)?)
    }

    fn run_with_input(
        &self,
        command: &str,
        input: &[u8],
    ) -> anyhow::Result<String> {
        check(command, self.exec(command, Some(input))?)
    }
}

fn check(command: &str, output: CommandOutput) -> anyhow::Result<String> {
    match output.status {
        Some(0) => Ok(output.stdout_text()),
        Some(SSH_CONNECTION_FAILED) => anyhow::bail!(
            "could not reach the guest to run '{command}': {}",
            output.stderr.trim()
        ),
        status => anyhow::bail!(
            "guest command '{command}' failed with status {status:?}: {}",
            output.stderr.trim()
        ),
    }
}

/// Quotes `s` for a POSIX shell.
pub fn sh_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}

/// The host's key pair for logging in to the guest.
#[derive(Clone, Debug)]
pub struct SshIdentity {
    pub private_key: Utf8PathBuf,
    pub public_key: String,
}

impl SshIdentity {
    /// Loads the work directory's key pair, generating one first if needed.
    pub fn ensure(config: &Config, ui: &dyn Ui) -> anyhow::Result<Self> {
        let private_key = config.ssh_identity();
        let public_path = Utf8PathBuf::from(format!("{private_key}.pub"));
        if !private_key.exists() || !public_path.exists() {
            let _ = std::fs::remove_file(&private_key);
            let _ = std::fs::remove_file(&public_path);
            std::fs::create_dir_all(&config.work_dir)?;
            run_command_check_status(
                Command::new("ssh-keygen").args([
                    "-q",
                    "-t",
                    "ed25519",
                    "-N",
                    "",
                    "-C",
                    &format!("cibox@{}", config.guest_name),
                    "-f",
                    private_key.as_str(),
                ]),
                ui,
            )
            .context("generating the SSH key pair")?;
        }

        let public_key = std::fs::read_to_string(&public_path)
            .with_context(|| format!("reading {public_path}"))?
            .trim()
            .to_string();

        Ok(Self { private_key, public_key })
    }
}

/// Forgets the guest's host key. A reinstalled guest has a new one.
pub fn reset_known_hosts(config: &Config) -> anyhow::Result<()> {
    let path = config.known_hosts();
    match std::fs::remove_file(&path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => {
            Err(anyhow::Error::new(e).context(format!("removing {path}")))
        }
    }
}

/// How the host gets a shell in the guest.
pub trait GuestAccess {
    /// Returns the host's key pair for the guest, creating it if needed.
    fn identity(
        &self,
        config: &Config,
        ui: &dyn Ui,
    ) -> anyhow::Result<SshIdentity>;

    /// A root shell in the guest.
    fn shell(
        &self,
        config: &Config,
        identity: &SshIdentity,
    ) -> Arc<dyn GuestShell>;
}

/// Guest access through the OpenSSH client tools.
pub struct SshAccess;

impl GuestAccess for SshAccess {
    fn identity(
        &self,
        config: &Config,
        ui: &dyn Ui,
    ) -> anyhow::Result<SshIdentity> {
        SshIdentity::ensure(config, ui)
    }

    fn shell(
        &self,
        config: &Config,
        identity: &SshIdentity,
    ) -> Arc<dyn GuestShell> {
        Arc::new(SshShell::new(config, identity, "root"))
    }
}

/// A guest shell reached with the `ssh` and `scp` clients.
#[derive(Clone, Debug)]
pub struct SshShell {
    user: String,
    port: u16,
    identity: Utf8PathBuf,
    known_hosts: Utf8PathBuf,
}

impl SshShell {
    pub fn new(config: &Config, identity: &SshIdentity, user: &str) -> Self {
        Self {
            user: user.to_string(),
            port: config.ports.ssh,
            identity: identity.private_key.clone(),
            known_hosts: config.known_hosts(),
        }
    }

    fn configure(&self, cmd: &mut Command, scp_style: bool) {
        cmd.arg(if scp_style { "-P" } else { "-p" })
            .arg(self.port.to_string())
            .arg("-i")
            .arg(self.identity.as_str());

        for option in [
            "BatchMode=yes",
            "IdentitiesOnly=yes",
            "ConnectTimeout=10",
            // A guest that stops answering mid-command fails the command
            // within a minute instead of hanging the run.
            "ServerAliveInterval=15",
            "ServerAliveCountMax=4",
            "StrictHostKeyChecking=accept-new",
            "GlobalKnownHostsFile=/dev/null",
            "LogLevel=ERROR",
        ] {
            cmd.arg("-o").arg(option);
        }

        cmd.arg("-o").arg(format!("UserKnownHostsFile={}", self.known_hosts));
    }

    fn destination(&self) -> String {
        format!("{}@127.0.0.1", self.user)
    }

    fn scp(&self, from: &str, to: &str) -> anyhow::Result<()> {
        let mut cmd = Command::new("scp");
        self.configure(&mut cmd, true);
        cmd.arg("-q").arg(from).arg(to);
        let output = cmd.output().context("launching scp")?;
        if !output.status.success() {
            anyhow::bail!(
                "copying {from} to {to} failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(())
    }
}

impl GuestShell for SshShell {
    fn exec(
        &self,
        command: &str,
        input: Option<&[u8]>,
    ) -> anyhow::Result<CommandOutput> {
        log::debug!("guest ({}): {command}", self.user);
        let mut cmd = Command::new("ssh");
        self.configure(&mut cmd, false);
        cmd.arg(self.destination())
            .arg(command)
            .stdin(if input.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd.spawn().context("launching ssh")?;
        if let (Some(input), Some(mut stdin)) = (input, child.stdin.take()) {
            stdin.write_all(input).context("writing to guest command")?;
        }

        let output = child.wait_with_output().context("waiting for ssh")?;
        Ok(CommandOutput {
            status: output.status.code(),
            stdout: output.stdout,
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    fn upload(&self, local: &Utf8Path, remote: &str) -> anyhow::Result<()> {
        log::debug!("uploading {local} to guest:{remote}");
        self.scp(local.as_str(), &format!("{}:{remote}", self.destination()))
    }

    fn download(&self, remote: &str, local: &Utf8Path) -> anyhow::Result<()> {
        log::debug!("downloading guest:{remote} to {local}");
        if let Some(parent) = local.parent() {
            std::fs::create_dir_all(parent)?;
        }
        self.scp(&format!("{}:{remote}", self.destination()), local.as_str())
    }
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;
    use std::{collections::HashMap, sync::Mutex};

    struct Rule {
        needle: String,
        status: i32,
        stdout: String,
    }

    /// A scripted guest. Each command gets the reply of the first rule whose
    /// needle it contains, or empty success.
    #[derive(Default)]
    pub(crate) struct FakeShell {
        rules: Vec<Rule>,
        files: HashMap<String, Vec<u8>>,
        pub commands: Mutex<Vec<String>>,
        pub inputs: Mutex<Vec<(String, Vec<u8>)>>,
        pub uploads: Mutex<Vec<(Utf8PathBuf, String)>>,
        unreachable: bool,
    }

    impl FakeShell {
        /// A guest whose SSH service never answers.
        pub fn unreachable() -> Self {
            Self { unreachable: true, ..Default::default() }
        }

        pub fn on(mut self, needle: &str, status: i32, stdout: &str) -> Self {
            self.rules.push(Rule {
                needle: needle.to_string(),
                status,
                stdout: stdout.to_string(),
            });
            self
        }

        /// Makes `remote` downloadable.
        pub fn with_file(mut self, remote: &str, contents: &[u8]) -> Self {
            self.files.insert(remote.to_string(), contents.to_vec());
            self
        }

        pub fn ran(&self, needle: &str) -> bool {
            self.commands.lock().unwrap().iter().any(|c| c.contains(needle))
        }

        pub fn command_count(&self) -> usize {
            self.commands.lock().unwrap().len()
        }
    }

    impl GuestShell for FakeShell {
        fn exec(
            &self,
            command: &str,
            input: Option<&[u8]>,
        ) -> anyhow::Result<CommandOutput> {
            self.commands.lock().unwrap().push(command.to_string());
            if let Some(input) = input {
                self.inputs
                    .lock()
                    .unwrap()
                    .push((command.to_string(), input.to_vec()));
            }

            if self.unreachable {
                return Ok(CommandOutput {
                    status: Some(SSH_CONNECTION_FAILED),
                    stderr: "Connection refused".to_string(),
                    ..Default::default()
                });
            }

            let (status, stdout) = self
                .rules
                .iter()
                .find(|rule| command.contains(&rule.needle))
                .map(|rule| (rule.status, rule.stdout.clone()))
                .unwrap_or((0, String::new()));

            Ok(CommandOutput {
                status: Some(status),
                stdout: stdout.into_bytes(),
                stderr: if status == 0 {
                    String::new()
                } else {
                    "scripted failure".to_string()
                },
            })
        }

        fn upload(&self, local: &Utf8Path, remote: &str) -> anyhow::Result<()> {
            if self.unreachable {
                anyhow::bail!("connection refused");
            }
            self.uploads
                .lock()
                .unwrap()
                .push((local.to_owned(), remote.to_string()));
            Ok(())
        }

        fn download(
            &self,
            remote: &str,
            local: &Utf8Path,
        ) -> anyhow::Result<()> {
            let contents = self
                .files
                .get(remote)
                .ok_or_else(|| anyhow::anyhow!("no such guest file {remote}"))?;
            std::fs::write(local, contents)?;
            Ok(())
        }
    }

    /// Access to a shared [`FakeShell`] with a made-up key pair.
    pub(crate) struct FakeAccess {
        pub shell: Arc<FakeShell>,
    }

    impl GuestAccess for FakeAccess {
        fn identity(
            &self,
            config: &Config,
            _ui: &dyn Ui,
        ) -> anyhow::Result<SshIdentity> {
            Ok(SshIdentity {
                private_key: config.ssh_identity(),
                public_key:
                    "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAITEST cibox@test"
                        .to_string(),
            })
        }

        fn shell(
            &self,
            _config: &Config,
            _identity: &SshIdentity,
        ) -> Arc<dyn GuestShell> {
            self.shell.clone()
        }
    }

    #[test]
    fn failures_name_the_command_not_the_input() {
        let shell = FakeShell::default().on("usermod", 1, "");
        let err = shell
            .run_with_input("usermod -p \"$hash\" builder", b"hunter2\n")
            .unwrap_err();
        let message = err.to_string();
        assert!(message.contains("usermod"));
        assert!(!message.contains("hunter2"));

        let unreachable = FakeShell::unreachable();
        let err = unreachable.run("echo ready").unwrap_err();
        assert!(err.to_string().contains("could not reach the guest"));
    }

    #[test]
    fn ssh_detects_a_silent_guest() {
        let shell = SshShell {
            user: "root".to_string(),
            port: 2222,
            identity: Utf8PathBuf::from("/keys/id_ed25519"),
            known_hosts: Utf8PathBuf::from("/keys/known_hosts"),
        };
        let mut cmd = Command::new("ssh");
        shell.configure(&mut cmd, false);
        let args: Vec<String> = cmd
            .get_args()
            .map(|arg| arg.to_string_lossy().into_owned())
            .collect();

        assert_eq!(args[..2], ["-p", "2222"]);
        for option in ["ServerAliveInterval=15", "ServerAliveCountMax=4"] {
            let at = args.iter().position(|arg| arg == option).unwrap();
            assert_eq!(args[at - 1], "-o");
        }
    }

    #[test]
    fn quoting() {
        assert_eq!(sh_quote("plain"), "'plain'");
        assert_eq!(sh_quote("it's"), "'it'\\''s'");
    }
}
