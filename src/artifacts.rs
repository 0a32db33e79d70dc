// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The versioned artifacts a provisioning run needs from the network.

use crate::{
    cache::{ArtifactRequest, CachedArtifact, DownloadCache},
    config::Sources,
    ui::Ui,
};

/// The guest operating system release to install.
pub const OS_RELEASE: &str = "7.6";

/// The CI server release to install.
pub const CI_SERVER_RELEASE: &str = "2.462.3";

const PLUGIN_PREFIX: &str = "plugin-";

/// CI server plugins installed alongside the server, as (name, version).
const PLUGINS: &[(&str, &str)] = &[
    ("git", "5.5.2"),
    ("matrix-auth", "3.2.2"),
    ("workflow-aggregator", "600.vb_57cdd26fdd7"),
    ("ssh-slaves", "2.973.v0fa_8c0dea_f9f"),
];

/// Everything to download, in a fixed order: the installer image, the CI
/// server, then its plugins.
#[derive(Clone, Debug)]
pub struct Manifest {
    pub installer: ArtifactRequest,
    pub ci_server: ArtifactRequest,
    pub plugins: Vec<ArtifactRequest>,
}

impl Manifest {
    pub fn new(sources: &Sources) -> Self {
        let compact_release = OS_RELEASE.replace('.', "");
        let release_dir = format!("{}/{OS_RELEASE}/amd64", sources.os_mirror);
        let installer = ArtifactRequest {
            name: "installer-image".to_string(),
            version: OS_RELEASE.to_string(),
            source: format!("{release_dir}/install{compact_release}.iso"),
            sha256: None,
            digest_list: Some(format!("{release_dir}/SHA256")),
            required: true,
        };

        let war = format!(
            "{}/war-stable/{CI_SERVER_RELEASE}/jenkins.war",
            sources.ci_mirror
        );
        let ci_server = ArtifactRequest {
            name: "ci-server".to_string(),
            version: CI_SERVER_RELEASE.to_string(),
            digest_list: Some(format!("{war}.sha256")),
            source: war,
            sha256: None,
            required: true,
        };

        let plugins = PLUGINS
            .iter()
            .map(|(name, version)| ArtifactRequest {
                name: format!("{PLUGIN_PREFIX}{name}"),
                version: version.to_string(),
                source: format!(
                    "{}/plugins/{name}/{version}/{name}.hpi",
                    sources.plugin_mirror
                ),
                sha256: None,
                digest_list: None,
                required: false,
            })
            .collect();

        Self { installer, ci_server, plugins }
    }

    pub fn requests(&self) -> Vec<ArtifactRequest> {
        [self.installer.clone(), self.ci_server.clone()]
            .into_iter()
            .chain(self.plugins.iter().cloned())
            .collect()
    }
}

/// The artifacts a run has in hand after the download phase.
#[derive(Clone, Debug)]
pub struct Artifacts {
    pub installer: CachedArtifact,
    pub ci_server: CachedArtifact,

    /// The plugins that downloaded successfully.
    pub plugins: Vec<CachedArtifact>,
}

/// The file name the CI server expects for a plugin artifact.
pub fn plugin_file_name(plugin: &CachedArtifact) -> String {
    let name = plugin.name.strip_prefix(PLUGIN_PREFIX).unwrap_or(&plugin.name);
    format!("{name}.hpi")
}

/// Downloads everything in `manifest` that isn't cached yet. Fails if a
/// required artifact can't be fetched; optional artifacts that fail are
/// logged and left out.
pub fn fetch_manifest(
    cache: &DownloadCache,
    manifest: &Manifest,
    workers: usize,
    ui: &dyn Ui,
) -> anyhow::Result<Artifacts> {
    let requests = manifest.requests();
    ui.set_substep(&format!(
        "fetching {} artifacts with {workers} workers",
        requests.len()
    ));

    let mut required_failures = Vec::new();
    let mut fetched = Vec::with_capacity(requests.len());
    let results = cache.fetch_all(&requests, workers);
    for (request, result) in requests.iter().zip(results) {
        match result {
            Ok(artifact) => fetched.push(Some(artifact)),
            Err(e) if request.required => {
                required_failures.push(format!("{}: {e}", request.name));
                fetched.push(None);
            }
            Err(e) => {
                log::warn!(
                    "optional artifact {} {} was not downloaded: {e}",
                    request.name,
                    request.version
                );
                ui.set_substep(&format!("skipping {}: {e}", request.name));
                fetched.push(None);
            }
        }
    }

    if !required_failures.is_empty() {
        anyhow::bail!(
            "required artifacts could not be downloaded: {}",
            required_failures.join("; ")
        );
    }

    let mut fetched = fetched.into_iter();
    let mut next_required = |what: &str| {
        fetched.next().flatten().ok_or_else(|| {
            anyhow::anyhow!("{what} missing from download results")
        })
    };
    let installer = next_required("installer image")?;
    let ci_server = next_required("CI server")?;
    let plugins = fetched.flatten().collect();

    Ok(Artifacts { installer, ci_server, plugins })
}
