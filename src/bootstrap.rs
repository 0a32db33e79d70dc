// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Configures an installed guest over SSH.
//!
//! Configuration is a fixed sequence of install steps. Each step's failure is
//! recorded and the sequence carries on, so one broken package mirror doesn't
//! cost the operator every other step. A failed step can be retried on its
//! own with `cibox bootstrap --step <name>`.

use std::time::Instant;

use crate::{
    artifacts::Artifacts,
    cancel::CancelToken,
    ciserver,
    config::Sources,
    error::{Cancelled, ReadinessTimeout},
    poll::{poll_until, Backoff},
    report::{StepRecord, CANCELLED},
    secrets::{Credentials, SERVICE_USER},
    shell::GuestShell,
    ui::Ui,
};

/// Where the reverse proxy's certificate authority lives in the guest.
pub const CA_CERT_PATH: &str = "/etc/ssl/cibox/ca.crt";

const SSHD_CONFIG: &str = "/etc/ssh/sshd_config";
const SSHD_CONFIG_BACKUP: &str = "/etc/ssh/sshd_config.cibox-backup";

const TOOLCHAIN_PACKAGES: &[&str] =
    &["git", "gmake", "cmake", "ninja", "bash", "curl"];

pub const JAVA_HOME: &str = "/usr/local/jdk-17";

/// How long bootstrap waits on the things it depends on.
#[derive(Clone, Copy, Debug)]
pub struct Waits {
    pub guest_shell: Backoff,
    pub ci_server: Backoff,
}

impl Default for Waits {
    fn default() -> Self {
        Self {
            guest_shell: Backoff::GUEST_SHELL,
            ci_server: Backoff::CI_SERVER,
        }
    }
}

/// Everything an install step may use.
pub struct StepEnv<'a> {
    pub shell: &'a dyn GuestShell,
    pub credentials: &'a Credentials,
    pub public_key: &'a str,
    pub sources: &'a Sources,
    pub artifacts: &'a Artifacts,
    pub cancel: &'a CancelToken,
    pub waits: Waits,
}

type StepBody = fn(&StepEnv, &dyn Ui) -> anyhow::Result<()>;

/// One independently-failing unit of guest configuration.
pub struct InstallStep {
    pub slug: &'static str,
    pub optional: bool,
    body: StepBody,
}

pub fn steps() -> Vec<InstallStep> {
    vec![
        InstallStep {
            slug: "service-account",
            optional: false,
            body: service_account,
        },
        InstallStep {
            slug: "ssh-hardening",
            optional: false,
            body: ssh_hardening,
        },
        InstallStep {
            slug: "package-repository",
            optional: false,
            body: package_repository,
        },
        InstallStep {
            slug: "build-toolchain",
            optional: true,
            body: build_toolchain,
        },
        InstallStep {
            slug: "java-runtime",
            optional: false,
            body: java_runtime,
        },
        InstallStep {
            slug: "reverse-proxy",
            optional: true,
            body: reverse_proxy,
        },
        InstallStep {
            slug: "ci-server",
            optional: false,
            body: ciserver::install,
        },
    ]
}

/// The command that retries `slug` on its own.
pub fn remediation(slug: &str) -> String {
    format!("cibox bootstrap --step {slug}")
}

/// Checks that every name in `selected` is a step.
pub fn validate_selection(selected: &[String]) -> anyhow::Result<()> {
    let all = steps();
    let unknown: Vec<&str> = selected
        .iter()
        .map(String::as_str)
        .filter(|name| !all.iter().any(|step| step.slug == *name))
        .collect();

    if !unknown.is_empty() {
        anyhow::bail!(
            "unknown bootstrap step(s): {} (steps are: {})",
            unknown.join(", "),
            all.iter().map(|s| s.slug).collect::<Vec<_>>().join(", ")
        );
    }

    Ok(())
}

/// Waits for the guest to accept commands over SSH. Reachable isn't enough:
/// sshd answers before the guest has finished its first boot.
pub fn wait_for_guest_shell(
    shell: &dyn GuestShell,
    backoff: &Backoff,
    cancel: &CancelToken,
    ui: &dyn Ui,
) -> anyhow::Result<()> {
    poll_until("guest SSH service", backoff, cancel, ui, || {
        let answer = shell.run("echo ready")?;
        if answer.trim() != "ready" {
            anyhow::bail!("unexpected answer {:?}", answer.trim());
        }
        Ok(())
    })
}

/// Runs the selected steps (all of them if `selected` is empty) in their
/// declared order and returns a record for each.
pub fn run(
    env: &StepEnv,
    selected: &[String],
    ui: &dyn Ui,
) -> Vec<StepRecord> {
    let chosen: Vec<InstallStep> = steps()
        .into_iter()
        .filter(|step| {
            selected.is_empty() || selected.iter().any(|s| s == step.slug)
        })
        .collect();

    ui.set_substep("waiting for the guest to accept commands");
    let start = Instant::now();
    if let Err(e) =
        wait_for_guest_shell(env.shell, &env.waits.guest_shell, env.cancel, ui)
    {
        if e.downcast_ref::<Cancelled>().is_some() {
            return chosen
                .iter()
                .map(|s| StepRecord::skipped(s.slug, s.optional, CANCELLED))
                .collect();
        }

        // Without a shell no step can run. Each is recorded as failed with
        // the readiness failure as its cause.
        let elapsed = start.elapsed();
        log::warn!("guest never became ready: {e:#}");
        return chosen
            .iter()
            .map(|step| {
                StepRecord::from_result(
                    step.slug,
                    step.optional,
                    Err(readiness_failure(&e)),
                    elapsed,
                )
                .with_remediation(remediation(step.slug))
            })
            .collect();
    }

    let mut records = Vec::with_capacity(chosen.len());
    for step in &chosen {
        if env.cancel.is_cancelled() {
            records.push(StepRecord::skipped(
                step.slug,
                step.optional,
                CANCELLED,
            ));
            continue;
        }

        ui.set_substep(step.slug);
        log::info!("install step {}: starting", step.slug);
        let start = Instant::now();
        let result = (step.body)(env, ui);
        if let Err(e) = &result {
            let severity = if step.optional { "optional" } else { "required" };
            log::warn!("{severity} install step {} failed: {e:#}", step.slug);
        } else {
            log::info!("install step {}: done", step.slug);
        }

        records.push(
            StepRecord::from_result(
                step.slug,
                step.optional,
                result,
                start.elapsed(),
            )
            .with_remediation(remediation(step.slug)),
        );
    }

    records
}

/// A copy of a readiness failure that keeps its classification.
fn readiness_failure(e: &anyhow::Error) -> anyhow::Error {
    match e.downcast_ref::<ReadinessTimeout>() {
        Some(timeout) => ReadinessTimeout {
            what: timeout.what.clone(),
            waited: timeout.waited,
            last_error: timeout.last_error.clone(),
        }
        .into(),
        None => anyhow::anyhow!("{e:#}"),
    }
}

fn line(value: &str) -> Vec<u8> {
    format!("{value}\n").into_bytes()
}

fn service_account(env: &StepEnv, ui: &dyn Ui) -> anyhow::Result<()> {
    let user = SERVICE_USER;
    ui.set_substep("creating the service account");
    env.shell.run(&format!(
        "id -u {user} >/dev/null 2>&1 || \
        useradd -m -s /bin/ksh -L default {user}"
    ))?;

    // encrypt(1) hashes the password read from stdin, so the plain text never
    // appears in a command line.
    ui.set_substep("setting the service account password");
    env.shell.run_with_input(
        &format!("hash=$(encrypt -b a) && usermod -p \"$hash\" {user}"),
        &line(env.credentials.service.expose()),
    )?;

    ui.set_substep("authorizing the host key for the service account");
    let ssh_dir = format!("/home/{user}/.ssh");
    env.shell.run_with_input(
        &format!(
            "install -d -m 700 -o {user} -g {user} {ssh_dir} && \
            cat > {ssh_dir}/authorized_keys && \
            chown {user}:{user} {ssh_dir}/authorized_keys && \
            chmod 600 {ssh_dir}/authorized_keys"
        ),
        &line(env.public_key),
    )?;

    let hash = env.shell.run(&format!(
        "grep '^{user}:' /etc/master.passwd | cut -d: -f2"
    ))?;
    if !hash.trim().starts_with("$2b$") {
        anyhow::bail!("the service account's password was not set");
    }

    Ok(())
}

const SSHD_MANAGED_BLOCK: &str = "\
# BEGIN cibox managed
PasswordAuthentication no
KbdInteractiveAuthentication no
PermitRootLogin prohibit-password
AllowUsers root builder
# END cibox managed
";

fn ssh_hardening(env: &StepEnv, ui: &dyn Ui) -> anyhow::Result<()> {
    ui.set_substep("backing up sshd_config");
    env.shell.run(&format!("cp -p {SSHD_CONFIG} {SSHD_CONFIG_BACKUP}"))?;

    // sshd uses the first value it finds for each keyword, so the managed
    // block goes first. Any block from an earlier run is dropped.
    ui.set_substep("installing the managed sshd_config block");
    env.shell.run_with_input(
        &format!(
            "{{ cat; sed '/^# BEGIN cibox managed$/,/^# END cibox managed$/d' \
            {SSHD_CONFIG_BACKUP}; }} > {SSHD_CONFIG}"
        ),
        SSHD_MANAGED_BLOCK.as_bytes(),
    )?;

    ui.set_substep("validating sshd_config");
    if let Err(e) = env.shell.run("sshd -t") {
        env.shell
            .run(&format!("cp -p {SSHD_CONFIG_BACKUP} {SSHD_CONFIG}"))
            .map_err(|restore| {
                e.context(format!(
                    "restoring the previous sshd_config also failed: \
                    {restore:#}"
                ))
            })?;
        anyhow::bail!("new sshd_config was rejected and has been rolled back");
    }

    env.shell.run("rcctl reload sshd")?;

    let effective = env.shell.run("sshd -T")?;
    if !effective.lines().any(|l| l.trim() == "passwordauthentication no") {
        anyhow::bail!("sshd still allows password authentication");
    }

    Ok(())
}

fn package_repository(env: &StepEnv, ui: &dyn Ui) -> anyhow::Result<()> {
    ui.set_substep("pointing the package tools at the mirror");
    let mirror = line(&env.sources.os_mirror);
    env.shell.run_with_input("cat > /etc/installurl", &mirror)?;

    ui.set_substep("querying the package index");
    let found = env.shell.run("pkg_info -Q gmake")?;
    if !found.contains("gmake") {
        anyhow::bail!(
            "the package index at {} has no gmake package",
            env.sources.os_mirror
        );
    }

    Ok(())
}

fn build_toolchain(env: &StepEnv, ui: &dyn Ui) -> anyhow::Result<()> {
    let packages = TOOLCHAIN_PACKAGES.join(" ");
    ui.set_substep(&format!("installing {packages}"));
    env.shell.run(&format!("pkg_add -I {packages}"))?;
    env.shell.run(&format!("which {packages}"))?;
    Ok(())
}

fn java_runtime(env: &StepEnv, ui: &dyn Ui) -> anyhow::Result<()> {
    ui.set_substep("installing JDK 17");
    env.shell.run("pkg_add -I jdk%17")?;

    let version =
        env.shell.run(&format!("{JAVA_HOME}/bin/java -version 2>&1"))?;
    if !version.contains("\"17") {
        anyhow::bail!("unexpected Java version: {}", version.trim());
    }

    Ok(())
}

const NGINX_CONF: &str = r#"worker_processes 1;

events {
    worker_connections 256;
}

http {
    server {
        listen 443 ssl;
        server_name localhost;

        ssl_certificate /etc/ssl/cibox/server.crt;
        ssl_certificate_key /etc/ssl/cibox/server.key;

        client_max_body_size 256m;

        location / {
            proxy_pass http://127.0.0.1:8080;
            proxy_set_header Host $http_host;
            proxy_set_header X-Forwarded-Proto https;
            proxy_set_header X-Forwarded-For $proxy_add_x_forwarded_for;
        }
    }
}
"#;

/// Creates the CA once, then a server certificate signed by it.
const CERTIFICATE_SCRIPT: &str = "\
set -e
install -d -m 755 /etc/ssl/cibox
cd /etc/ssl/cibox
umask 077
if [ ! -s ca.key ]; then
    openssl genrsa -out ca.key 4096
    openssl req -x509 -new -key ca.key -sha256 -days 3650 \
        -subj '/CN=cibox local CA' \
        -addext basicConstraints=critical,CA:TRUE \
        -addext keyUsage=critical,keyCertSign,cRLSign \
        -out ca.crt
fi
openssl genrsa -out server.key 2048
openssl req -new -key server.key -subj '/CN=localhost' -out server.csr
printf '%s\\n' 'subjectAltName=DNS:localhost,IP:127.0.0.1' \
    'basicConstraints=CA:FALSE' 'extendedKeyUsage=serverAuth' > server.ext
openssl x509 -req -in server.csr -CA ca.crt -CAkey ca.key -CAcreateserial \
    -days 825 -sha256 -extfile server.ext -out server.crt
chmod 644 ca.crt server.crt
";

fn reverse_proxy(env: &StepEnv, ui: &dyn Ui) -> anyhow::Result<()> {
    ui.set_substep("installing nginx");
    env.shell.run("pkg_add -I nginx")?;

    ui.set_substep("generating certificates");
    env.shell.run_with_input("sh -s", CERTIFICATE_SCRIPT.as_bytes())?;
    env.shell.run(&format!("test -s {CA_CERT_PATH}"))?;

    ui.set_substep("configuring nginx");
    env.shell
        .run_with_input("cat > /etc/nginx/nginx.conf", NGINX_CONF.as_bytes())?;
    env.shell.run("nginx -t")?;
    env.shell.run("rcctl enable nginx && rcctl restart nginx")?;
    Ok(())
}
