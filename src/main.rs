// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! cibox: provisions a single-node CI environment in a local QEMU guest.

use anyhow::Context as _;
use app::{App, Command};
use clap::Parser;
use colored::Colorize;

#[cfg(not(unix))]
compile_error!("only Unix-like hosts are supported");

pub mod app;
pub mod artifacts;
pub mod bootstrap;
pub mod cache;
pub mod cancel;
pub mod ciserver;
pub mod config;
pub mod console;
pub mod error;
pub mod guest;
pub mod installer;
pub mod pipeline;
pub mod poll;
pub mod profile;
pub mod qemu;
pub mod report;
pub mod runner;
pub mod secrets;
pub mod shell;
pub mod token;
pub mod tokenstore;
pub mod trust;
pub mod ui;
pub mod util;

use cancel::CancelToken;
use config::{Config, Sources};
use guest::{GuestController, GuestStatus, LaunchSpec};
use pipeline::{Mode, ProvisionOptions, Services};
use profile::Profile;
use shell::{GuestAccess, SshAccess};
use secrets::Secret;
use token::{
    GuestTokenSource, SystemClock, TokenCache, TokenSource, TokenStatus,
};
use ui::LogUi;

fn main() -> anyhow::Result<()> {
    let app = App::parse();
    let interactive = match app.interactive {
        Some(val) => val,
        None => atty::is(atty::Stream::Stdout),
    };

    // Progress bars carry the detail in interactive runs.
    let default_level = if interactive { "warn" } else { "info" };
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(default_level),
    )
    .init();

    let cancel = CancelToken::with_interrupt_handler()?;
    let code = match &app.command {
        Command::Provision { profile, accept_undersized, sources } => {
            let config =
                Config::from_app(&app, interactive, Sources::from(sources));
            let options = ProvisionOptions {
                profile: profile.clone(),
                accept_undersized: *accept_undersized,
                ..Default::default()
            };
            run_pipeline(Mode::Provision, config, options, cancel)?
        }
        Command::Bootstrap { steps, sources } => {
            bootstrap::validate_selection(steps)?;
            let config =
                Config::from_app(&app, interactive, Sources::from(sources));
            let options =
                ProvisionOptions { steps: steps.clone(), ..Default::default() };
            run_pipeline(Mode::Bootstrap, config, options, cancel)?
        }
        Command::Start => {
            start(&Config::from_app(&app, interactive, Sources::default()))?;
            0
        }
        Command::Stop => {
            stop(&Config::from_app(&app, interactive, Sources::default()))?;
            0
        }
        Command::Status => {
            status(&Config::from_app(&app, interactive, Sources::default()))?;
            0
        }
        Command::Token { refresh, reveal } => {
            let config =
                Config::from_app(&app, interactive, Sources::default());
            token(&config, *refresh, *reveal)?;
            0
        }
        Command::Profile => {
            show_profile(&Config::from_app(
                &app,
                interactive,
                Sources::default(),
            ))?;
            0
        }
    };

    std::process::exit(code);
}

fn run_pipeline(
    mode: Mode,
    config: Config,
    options: ProvisionOptions,
    cancel: CancelToken,
) -> anyhow::Result<i32> {
    let services = Services::real(&config);
    let report = pipeline::run(mode, config, services, options, cancel)?;
    report.print_summary(&mut std::io::stdout())?;
    Ok(report.verdict().exit_code())
}

fn saved_profile(config: &Config) -> anyhow::Result<Profile> {
    let path = config.profile_file();
    let json = std::fs::read(&path).with_context(|| {
        format!("reading {path}; has this guest been provisioned?")
    })?;
    serde_json::from_slice(&json).with_context(|| format!("parsing {path}"))
}

fn start(config: &Config) -> anyhow::Result<()> {
    if !config.install_marker().exists() {
        anyhow::bail!(
            "guest '{}' is not installed; run 'cibox provision' first",
            config.guest_name
        );
    }

    let profile = saved_profile(config)?;
    let hypervisor = qemu::QemuHypervisor::new(config);
    let guests = GuestController::new(config, &hypervisor, CancelToken::new());
    let handle =
        guests.start(&LaunchSpec::installed(config, &profile), &LogUi)?;
    println!(
        "guest '{}' is running as pid {} (ssh 127.0.0.1:{}, https {})",
        config.guest_name,
        handle.pid,
        handle.ssh_port,
        config.https_url()
    );
    Ok(())
}

fn stop(config: &Config) -> anyhow::Result<()> {
    let hypervisor = qemu::QemuHypervisor::new(config);
    let guests = GuestController::new(config, &hypervisor, CancelToken::new());
    let handle = match guests.status()? {
        GuestStatus::Running(handle) => handle,
        _ => {
            println!("guest '{}' is not running", config.guest_name);
            return Ok(());
        }
    };

    // An installer guest has no key to log in with; it is simply killed.
    let shell = if config.install_marker().exists() {
        let identity = SshAccess.identity(config, &LogUi)?;
        Some(SshAccess.shell(config, &identity))
    } else {
        None
    };

    guests.stop(&handle, shell.as_deref(), &LogUi)?;
    println!("guest '{}' stopped", config.guest_name);
    Ok(())
}

fn status(config: &Config) -> anyhow::Result<()> {
    let hypervisor = qemu::QemuHypervisor::new(config);
    let guests = GuestController::new(config, &hypervisor, CancelToken::new());
    match guests.status()? {
        GuestStatus::Running(handle) => println!(
            "guest '{}': {} (pid {}, ssh 127.0.0.1:{}, https 127.0.0.1:{})",
            config.guest_name,
            "running".green(),
            handle.pid,
            handle.ssh_port,
            handle.https_port
        ),
        GuestStatus::Stopped => {
            println!("guest '{}': {}", config.guest_name, "stopped".dimmed())
        }
        GuestStatus::Stale { pid } => println!(
            "guest '{}': {} (cleared the record of exited pid {pid})",
            config.guest_name,
            "stopped".dimmed()
        ),
    }
    Ok(())
}

/// Reads the token from the guest, connecting only when asked to.
struct SshTokenSource<'a> {
    config: &'a Config,
}

impl TokenSource for SshTokenSource<'_> {
    fn fetch_token(&self) -> anyhow::Result<Secret> {
        let identity = SshAccess.identity(self.config, &LogUi)?;
        let shell = SshAccess.shell(self.config, &identity);
        GuestTokenSource { shell: shell.as_ref() }.fetch_token()
    }
}

fn token(config: &Config, refresh: bool, reveal: bool) -> anyhow::Result<()> {
    let clock = SystemClock;
    let cache = TokenCache::new(config.token_file(), &clock);
    let token = cache.current(&SshTokenSource { config }, refresh)?;

    match cache.status() {
        TokenStatus::Missing | TokenStatus::Expired => {
            println!("the API token could not be cached in {}", cache.path())
        }
        TokenStatus::Valid { age, expires_in } => println!(
            "API token cached in {} ({} days old, refreshed in {} days)",
            cache.path(),
            age.as_secs() / 86_400,
            expires_in.as_secs() / 86_400
        ),
    }

    if reveal {
        println!("{}", token.expose());
    }
    Ok(())
}

fn show_profile(config: &Config) -> anyhow::Result<()> {
    let host = profile::probe_host(&config.work_dir, &LogUi)?;
    println!("host: {host}");
    for candidate in profile::candidates() {
        let verdict = if candidate.fits(&host) {
            "fits".green()
        } else {
            "too large".red()
        };
        println!("  {candidate}: {verdict}");
    }

    if let Ok(saved) = saved_profile(config) {
        println!("guest '{}' was provisioned as {saved}", config.guest_name);
    }
    Ok(())
}
