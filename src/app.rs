// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use camino::Utf8PathBuf;
use clap::{Args, Parser, Subcommand};

#[derive(Parser)]
#[command(
    version,
    about = "Provisions a single-node build/CI environment in a QEMU guest"
)]
pub struct App {
    /// The directory in which to keep guest disks, credentials, and other
    /// per-guest state.
    #[arg(long, global = true, default_value = "cibox-work")]
    pub work_dir: Utf8PathBuf,

    /// The directory in which to cache downloaded artifacts. Defaults to a
    /// `cache` directory inside the work directory. Sharing one cache between
    /// work directories avoids downloading the same artifacts twice.
    #[arg(long, global = true)]
    pub cache_dir: Option<Utf8PathBuf>,

    /// The name of the guest. Only one guest with a given name may run at a
    /// time.
    #[arg(long, global = true, default_value = "cibox")]
    pub guest_name: String,

    /// Forces the tool to run in an interactive or non-interactive mode. If not
    /// set, the tool infers whether to run interactively from whether it is
    /// running in an interactive terminal.
    #[arg(long, global = true, default_value = Option::None)]
    pub interactive: Option<bool>,

    #[command(flatten)]
    pub ports: PortArgs,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Args, Clone)]
pub struct PortArgs {
    /// The host loopback port forwarded to the guest's SSH service.
    #[arg(long, global = true, default_value_t = 2222)]
    pub ssh_port: u16,

    /// The host loopback port forwarded to the guest's HTTPS reverse proxy.
    #[arg(long, global = true, default_value_t = 8443)]
    pub https_port: u16,

    /// The host loopback port on which QEMU exposes the guest's serial
    /// console.
    #[arg(long, global = true, default_value_t = 4555)]
    pub console_port: u16,
}

#[derive(Args, Clone)]
pub struct SourceArgs {
    /// The base URL of the guest operating system mirror. Used both for the
    /// installer image and for the guest's package repository.
    #[arg(long, default_value = "https://cdn.openbsd.org/pub/OpenBSD")]
    pub os_mirror: String,

    /// The base URL from which to download the CI server and its plugins.
    #[arg(long, default_value = "https://get.jenkins.io")]
    pub ci_mirror: String,

    /// The base URL of the CI plugin repository.
    #[arg(long, default_value = "https://updates.jenkins.io/download")]
    pub plugin_mirror: String,

    /// How many artifacts to download at once.
    #[arg(long, default_value_t = 4)]
    pub download_workers: usize,
}

#[derive(Subcommand)]
pub enum Command {
    /// Creates, installs, and configures the guest from scratch, or picks up
    /// where a previous run left off.
    Provision {
        /// The name of a sizing profile to use instead of the largest one
        /// that fits on this host.
        #[arg(long)]
        profile: Option<String>,

        /// Proceeds with the smallest profile even if the host doesn't have
        /// the capacity for it. Without this flag a non-interactive run
        /// refuses to continue on an undersized host.
        #[arg(long, default_value_t = false)]
        accept_undersized: bool,

        #[command(flatten)]
        sources: SourceArgs,
    },

    /// Re-runs guest configuration steps against a running guest.
    Bootstrap {
        /// A step to run (may be repeated). If omitted, all steps run.
        #[arg(long = "step", value_name = "STEP")]
        steps: Vec<String>,

        #[command(flatten)]
        sources: SourceArgs,
    },

    /// Boots the installed guest if it isn't already running.
    Start,

    /// Shuts the guest down, forcibly if it doesn't power off on request.
    Stop,

    /// Reports whether the guest is running.
    Status,

    /// Reports on the cached CI access token, refreshing it from the guest if
    /// it has expired.
    Token {
        /// Fetches a fresh token from the guest even if the cached one is
        /// still valid.
        #[arg(long, default_value_t = false)]
        refresh: bool,

        /// Prints the token itself to stdout.
        #[arg(long, default_value_t = false)]
        reveal: bool,
    },

    /// Shows this host's capacity and the guest sizing profile it supports.
    Profile,
}
