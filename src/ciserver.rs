// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Installs the CI server in the guest and confirms that it persisted the
//! administrator account and API token it was told to create.

use anyhow::Context as _;

use crate::{
    artifacts::plugin_file_name,
    bootstrap::{StepEnv, JAVA_HOME},
    poll::poll_until,
    secrets::{CI_ADMIN_USER, SERVICE_USER},
    shell::GuestShell,
    tokenstore,
    ui::Ui,
};

/// The CI server's home directory, on the data disk.
pub const CI_HOME: &str = "/var/ci";

/// The name of the API token the provisioner creates for itself.
pub const TOKEN_NAME: &str = "provisioner";

/// Where the server writes the plain text of the new token.
pub const TOKEN_FILE: &str = "/var/ci/secrets/provisioner.token";

const PASSWORD_FILE: &str = "/var/ci/secrets/admin-password";
const WAR_DIR: &str = "/usr/local/share/jenkins";
const RC_SCRIPT: &str = "/etc/rc.d/jenkins";

/// The server listens on the guest's loopback only; the reverse proxy
/// fronts it.
pub const LOCAL_URL: &str = "http://127.0.0.1:8080";

/// Partitions and formats the second disk on first use and mounts it at the
/// CI home. A disk that already carries a filesystem is left alone, so a
/// reinstalled guest keeps its CI data.
const DATA_VOLUME_SCRIPT: &str = "\
set -e
if ! grep -q ' /var/ci ' /etc/fstab; then
    if ! disklabel sd1 2>/dev/null | grep -q '^  a: '; then
        fdisk -iy sd1
        printf 'a a\\n\\n\\n\\nw\\nq\\n' | disklabel -E sd1 >/dev/null
        newfs sd1a
    fi
    duid=$(disklabel sd1 | awk '/^duid:/ { print $2 }')
    install -d /var/ci
    echo \"$duid.a /var/ci ffs rw,nodev,nosuid 1 2\" >> /etc/fstab
fi
mount | grep -q ' on /var/ci ' || mount /var/ci
";

const INIT_SCRIPT: &str = r#"import hudson.model.User
import hudson.security.FullControlOnceLoggedInAuthorizationStrategy
import hudson.security.HudsonPrivateSecurityRealm
import java.nio.file.Files
import java.nio.file.attribute.PosixFilePermissions
import jenkins.model.Jenkins
import jenkins.security.ApiTokenProperty

def jenkins = Jenkins.get()
def passwordFile = new File(jenkins.rootDir, 'secrets/admin-password')
def tokenFile = new File(jenkins.rootDir, 'secrets/provisioner.token')

if (passwordFile.exists()) {
    def password = passwordFile.text.trim()

    def realm = jenkins.securityRealm
    if (!(realm instanceof HudsonPrivateSecurityRealm)) {
        realm = new HudsonPrivateSecurityRealm(false)
        jenkins.securityRealm = realm
    }

    def admin = User.getById('@ADMIN@', false)
    if (admin == null) {
        admin = realm.createAccount('@ADMIN@', password)
    } else {
        admin.addProperty(
            HudsonPrivateSecurityRealm.Details.fromPlainPassword(password))
    }

    def strategy = new FullControlOnceLoggedInAuthorizationStrategy()
    strategy.allowAnonymousRead = false
    jenkins.authorizationStrategy = strategy
    jenkins.save()

    def tokens = admin.getProperty(ApiTokenProperty.class)
    if (tokens == null) {
        tokens = new ApiTokenProperty()
        admin.addProperty(tokens)
    }
    tokens.tokenStore.tokenListSortedByName
        .findAll { it.name == '@TOKEN@' }
        .each { tokens.tokenStore.revokeToken(it.uuid) }
    def token = tokens.tokenStore.generateNewToken('@TOKEN@')
    admin.save()

    def ownerOnly = PosixFilePermissions.fromString('rw-------')
    Files.deleteIfExists(tokenFile.toPath())
    Files.createFile(
        tokenFile.toPath(), PosixFilePermissions.asFileAttribute(ownerOnly))
    tokenFile.text = token.plainValue
    passwordFile.delete()
}
"#;

fn init_script() -> String {
    INIT_SCRIPT.replace("@ADMIN@", CI_ADMIN_USER).replace("@TOKEN@", TOKEN_NAME)
}

fn rc_script() -> String {
    format!(
        "#!/bin/ksh\n\
        \n\
        daemon=\"{JAVA_HOME}/bin/java\"\n\
        daemon_flags=\"-Djava.awt.headless=true -DJENKINS_HOME={CI_HOME} \
        -Djenkins.install.runSetupWizard=false -jar {WAR_DIR}/jenkins.war \
        --httpListenAddress=127.0.0.1 --httpPort=8080\"\n\
        daemon_user=\"{SERVICE_USER}\"\n\
        daemon_logger=\"daemon.info\"\n\
        \n\
        . /etc/rc.d/rc.subr\n\
        \n\
        rc_bg=YES\n\
        rc_reload=NO\n\
        \n\
        rc_cmd $1\n"
    )
}

/// The `ci-server` install step.
pub fn install(env: &StepEnv, ui: &dyn Ui) -> anyhow::Result<()> {
    let shell = env.shell;
    let owner = format!("{SERVICE_USER}:{SERVICE_USER}");

    ui.set_substep("preparing the CI data volume");
    shell
        .run_with_input("sh -s", DATA_VOLUME_SCRIPT.as_bytes())
        .context("preparing the CI data volume")?;
    shell.run(&format!(
        "install -d -m 750 -o {SERVICE_USER} -g {SERVICE_USER} \
        {CI_HOME} {CI_HOME}/plugins {CI_HOME}/init.groovy.d && \
        install -d -m 700 -o {SERVICE_USER} -g {SERVICE_USER} {CI_HOME}/secrets"
    ))?;

    ui.set_substep("uploading the CI server");
    shell.run(&format!("install -d -m 755 {WAR_DIR}"))?;
    shell.upload(
        &env.artifacts.ci_server.path,
        &format!("{WAR_DIR}/jenkins.war"),
    )?;

    for plugin in &env.artifacts.plugins {
        let file = plugin_file_name(plugin);
        ui.set_substep(&format!("uploading plugin {file}"));
        shell.upload(&plugin.path, &format!("{CI_HOME}/plugins/{file}"))?;
    }
    shell.run(&format!("chown -R {owner} {CI_HOME}/plugins"))?;

    // The init script consumes the password file and deletes it.
    ui.set_substep("staging the administrator account");
    shell.run_with_input(
        &format!(
            "umask 077 && cat > {PASSWORD_FILE} && \
            chown {owner} {PASSWORD_FILE}"
        ),
        env.credentials.ci_admin.expose().as_bytes(),
    )?;
    let init_path = format!("{CI_HOME}/init.groovy.d/cibox-security.groovy");
    shell.run_with_input(
        &format!("cat > {init_path} && chown {owner} {init_path}"),
        init_script().as_bytes(),
    )?;

    ui.set_substep("starting the CI server");
    shell.run_with_input(
        &format!("cat > {RC_SCRIPT} && chmod 555 {RC_SCRIPT}"),
        rc_script().as_bytes(),
    )?;
    shell.run("rcctl enable jenkins && rcctl restart jenkins")?;

    poll_until(
        "CI server to persist its administrator and token",
        &env.waits.ci_server,
        env.cancel,
        ui,
        || confirm_persisted(shell),
    )
}

/// Succeeds once the server answers and its on-disk records show the
/// administrator with the provisioner's API token.
pub fn confirm_persisted(shell: &dyn GuestShell) -> anyhow::Result<()> {
    shell
        .run(&format!("ftp -M -V -o /dev/null {LOCAL_URL}/login"))
        .context("CI server is not answering yet")?;

    let users = shell.run(&format!("cat {CI_HOME}/users/users.xml"))?;
    let directories = tokenstore::user_directories(&users)?;
    let directory = directories.get(CI_ADMIN_USER).ok_or_else(|| {
        anyhow::anyhow!("user '{CI_ADMIN_USER}' has not been saved yet")
    })?;
    if directory.is_empty()
        || !directory
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        anyhow::bail!("unexpected user directory name {directory:?}");
    }

    let user_config =
        shell.run(&format!("cat {CI_HOME}/users/{directory}/config.xml"))?;
    let tokens = tokenstore::api_token_names(&user_config)?;
    if !tokens.iter().any(|name| name == TOKEN_NAME) {
        anyhow::bail!(
            "user '{CI_ADMIN_USER}' has no '{TOKEN_NAME}' API token yet"
        );
    }

    shell
        .run(&format!("test -s {TOKEN_FILE}"))
        .context("the API token has not been written out yet")?;

    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        bootstrap::test::{ADMIN_CONFIG_XML, USERS_XML},
        shell::test::FakeShell,
    };

    #[test]
    fn gate_passes_once_everything_is_persisted() {
        let shell = FakeShell::default()
            .on("users.xml", 0, USERS_XML)
            .on("admin_4711/config.xml", 0, ADMIN_CONFIG_XML);
        confirm_persisted(&shell).unwrap();
        assert!(shell.ran("test -s /var/ci/secrets/provisioner.token"));
    }

    #[test]
    fn gate_waits_for_the_token() {
        let no_token = ADMIN_CONFIG_XML.replace("provisioner", "legacy");
        let shell = FakeShell::default()
            .on("users.xml", 0, USERS_XML)
            .on("admin_4711/config.xml", 0, &no_token);
        let err = confirm_persisted(&shell).unwrap_err();
        assert!(err.to_string().contains("no 'provisioner' API token"));
    }

    #[test]
    fn gate_waits_for_the_server() {
        let shell = FakeShell::default().on("ftp -M", 1, "");
        let err = confirm_persisted(&shell).unwrap_err();
        assert!(err.to_string().contains("not answering"));
        assert!(!shell.ran("users.xml"));
    }

    #[test]
    fn gate_rejects_odd_directory_names() {
        let users = USERS_XML.replace("admin_4711", "../../etc");
        let shell = FakeShell::default().on("users.xml", 0, &users);
        assert!(confirm_persisted(&shell).is_err());
        assert!(!shell.ran("etc/config.xml"));
    }

    #[test]
    fn service_scripts_name_the_right_account() {
        let script = init_script();
        assert!(script.contains("User.getById('admin', false)"));
        assert!(script.contains("generateNewToken('provisioner')"));
        assert!(!script.contains('@'));

        let rc = rc_script();
        assert!(rc.contains("daemon_user=\"builder\""));
        assert!(rc.contains("-DJENKINS_HOME=/var/ci "));
        assert!(rc.contains("-Djenkins.install.runSetupWizard=false"));
    }
}
