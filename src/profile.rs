// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Guest sizing: measures the host and picks the largest guest profile that
//! fits on it.

use std::{fmt, process::Command};

use anyhow::Context as _;
use camino::Utf8Path;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{ui::Ui, util::grep_command_for_row_and_column};

/// Memory left to the host on top of the guest's allocation.
pub const HOST_MEMORY_RESERVE_MB: u64 = 1024;

/// A guest sizing profile.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub name: String,
    pub memory_mb: u64,
    pub vcpus: u32,
    pub system_disk_gb: u64,
    pub data_disk_gb: u64,
}

impl Profile {
    fn new(
        name: &str,
        memory_mb: u64,
        vcpus: u32,
        system_disk_gb: u64,
        data_disk_gb: u64,
    ) -> Self {
        Self {
            name: name.to_string(),
            memory_mb,
            vcpus,
            system_disk_gb,
            data_disk_gb,
        }
    }

    /// Lists the ways in which `host` falls short of this profile.
    fn shortfalls(&self, host: &HostCapacity) -> Vec<String> {
        let mut short = Vec::new();
        let memory_needed = self.memory_mb + HOST_MEMORY_RESERVE_MB;
        if memory_needed > host.memory_mb {
            short.push(format!(
                "memory: need {memory_needed} MiB, host has {} MiB",
                host.memory_mb
            ));
        }

        if self.vcpus > host.cpus {
            short.push(format!(
                "CPUs: need {}, host has {}",
                self.vcpus, host.cpus
            ));
        }

        let disk_needed = self.system_disk_gb + self.data_disk_gb;
        if disk_needed > host.free_disk_gb {
            short.push(format!(
                "disk: need {disk_needed} GiB free, host has {} GiB",
                host.free_disk_gb
            ));
        }

        short
    }

    pub fn fits(&self, host: &HostCapacity) -> bool {
        self.shortfalls(host).is_empty()
    }
}

impl fmt::Display for Profile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({} MiB memory, {} vCPUs, {} GiB system disk, \
            {} GiB data disk)",
            self.name,
            self.memory_mb,
            self.vcpus,
            self.system_disk_gb,
            self.data_disk_gb
        )
    }
}

/// The candidate profiles, most generous first.
pub fn candidates() -> Vec<Profile> {
    vec![
        Profile::new("large", 8192, 4, 40, 100),
        Profile::new("medium", 4096, 2, 24, 50),
        Profile::new("small", 2048, 2, 16, 20),
    ]
}

/// What the host has to offer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HostCapacity {
    pub memory_mb: u64,
    pub cpus: u32,
    pub free_disk_gb: u64,
}

impl fmt::Display for HostCapacity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} MiB memory, {} CPUs, {} GiB free disk",
            self.memory_mb, self.cpus, self.free_disk_gb
        )
    }
}

#[derive(Debug, Error)]
#[error(
    "this host is too small for even the '{profile}' guest profile ({}); \
    pass --accept-undersized to proceed anyway",
    .shortfalls.join("; ")
)]
pub struct CapacityError {
    pub profile: String,
    pub shortfalls: Vec<String>,
}

/// How to treat a host that can't fit any profile.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Undersized {
    Refuse,

    /// The operator explicitly agreed to run the minimum profile anyway.
    Accept,
}

/// The outcome of profile selection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Selection {
    pub profile: Profile,

    /// True if the profile does not actually fit the host.
    pub undersized: bool,
}

/// Picks the first of `candidates` that fits `host`. If `requested` names a
/// profile, only that one is considered. If nothing fits, either fails with a
/// [`CapacityError`] or, when the operator has accepted it, falls back to the
/// last (smallest) candidate considered.
pub fn select(
    host: &HostCapacity,
    candidates: &[Profile],
    requested: Option<&str>,
    undersized: Undersized,
) -> anyhow::Result<Selection> {
    let considered: Vec<&Profile> = match requested {
        Some(name) => {
            let profile =
                candidates.iter().find(|p| p.name == name).ok_or_else(|| {
                    anyhow::anyhow!(
                        "no profile named '{name}' (choose from {})",
                        candidates
                            .iter()
                            .map(|p| p.name.as_str())
                            .collect::<Vec<_>>()
                            .join(", ")
                    )
                })?;
            vec![profile]
        }
        None => candidates.iter().collect(),
    };

    if let Some(profile) = considered.iter().find(|p| p.fits(host)) {
        return Ok(Selection { profile: (*profile).clone(), undersized: false });
    }

    let minimum = considered
        .last()
        .ok_or_else(|| anyhow::anyhow!("no guest profiles to choose from"))?;

    match undersized {
        Undersized::Accept => {
            log::warn!(
                "host ({host}) is too small for profile {minimum}; \
                continuing because the operator accepted an undersized guest"
            );
            Ok(Selection { profile: (*minimum).clone(), undersized: true })
        }
        Undersized::Refuse => Err(CapacityError {
            profile: minimum.name.clone(),
            shortfalls: minimum.shortfalls(host),
        }
        .into()),
    }
}

/// Reports the capacity of the machine the guest will run on.
pub trait HostProbe {
    fn capacity(
        &self,
        work_dir: &Utf8Path,
        ui: &dyn Ui,
    ) -> anyhow::Result<HostCapacity>;
}

/// The machine this process runs on.
pub struct LocalHost;

impl HostProbe for LocalHost {
    fn capacity(
        &self,
        work_dir: &Utf8Path,
        ui: &dyn Ui,
    ) -> anyhow::Result<HostCapacity> {
        probe_host(work_dir, ui)
    }
}

/// Measures the host's memory, CPU count, and the free space of the file
/// system that holds `work_dir`.
pub fn probe_host(
    work_dir: &Utf8Path,
    ui: &dyn Ui,
) -> anyhow::Result<HostCapacity> {
    let memory_mb = host_memory_mb(ui)?;
    let cpus = std::thread::available_parallelism()
        .context("counting host CPUs")?
        .get() as u32;

    std::fs::create_dir_all(work_dir)
        .with_context(|| format!("creating work directory {work_dir}"))?;

    // `df -P` prints one header row and one row for the file system, whose
    // fourth column is the available space in 1024-byte blocks. Only the data
    // row contains a '%'.
    let available_kb = grep_command_for_row_and_column(
        Command::new("df").args(["-Pk", work_dir.as_str()]),
        "%",
        3,
        ui,
    )
    .context("running 'df' to measure free disk space")?;

    let available_kb: u64 =
        available_kb.parse().context("parsing available disk space")?;

    Ok(HostCapacity {
        memory_mb,
        cpus,
        free_disk_gb: available_kb / (1024 * 1024),
    })
}

#[cfg(target_os = "linux")]
fn host_memory_mb(_ui: &dyn Ui) -> anyhow::Result<u64> {
    let meminfo = std::fs::read_to_string("/proc/meminfo")
        .context("reading /proc/meminfo")?;
    parse_meminfo_total_kb(&meminfo)
        .map(|kb| kb / 1024)
        .ok_or_else(|| anyhow::anyhow!("MemTotal not found in /proc/meminfo"))
}

#[cfg(not(target_os = "linux"))]
fn host_memory_mb(ui: &dyn Ui) -> anyhow::Result<u64> {
    let output = crate::util::run_command_check_status(
        Command::new("sysctl").args(["-n", "hw.memsize"]),
        ui,
    )?;
    let bytes: u64 = String::from_utf8_lossy(&output.stdout)
        .trim()
        .parse()
        .context("parsing hw.memsize")?;
    Ok(bytes / (1024 * 1024))
}

#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn parse_meminfo_total_kb(meminfo: &str) -> Option<u64> {
    meminfo
        .lines()
        .find_map(|line| line.strip_prefix("MemTotal:"))
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|kb| kb.parse().ok())
}
