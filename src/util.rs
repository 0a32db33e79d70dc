// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Utility functions shared by multiple modules.

use std::{
    fs::OpenOptions,
    io::Write,
    os::unix::fs::OpenOptionsExt,
    process::{Command, Output},
};

use anyhow::Context as _;
use camino::{Utf8Path, Utf8PathBuf};
use rand::Rng;

use crate::ui::Ui;

/// Runs a `Command` and returns its output. Returns `Err` if the command's exit
/// status indicates that it failed.
pub fn run_command_check_status(
    cmd: &mut Command,
    ui: &dyn Ui,
) -> anyhow::Result<Output> {
    ui.set_substep(&format!("executing: {}", describe_command(cmd)));
    let output = cmd.output().with_context(|| {
        format!("launching '{}'", cmd.get_program().to_string_lossy())
    })?;

    if !output.status.success() {
        anyhow::bail!(
            "'{}' returned non-success exit code {:?}: {}",
            cmd.get_program().to_string_lossy(),
            output.status.code(),
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }

    Ok(output)
}

/// Renders a command line for progress messages.
fn describe_command(cmd: &Command) -> String {
    std::iter::once(cmd.get_program())
        .chain(cmd.get_args())
        .map(|arg| arg.to_string_lossy())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Runs the supplied `cmd` and searches its `stdout` for the first line
/// containing `row_contains`, then splits it by whitespace and returns the
/// `column`th zero-indexed word from that line.
///
/// Note that all searches are case-sensitive.
pub fn grep_command_for_row_and_column(
    cmd: &mut Command,
    row_contains: &str,
    column: usize,
    ui: &dyn Ui,
) -> anyhow::Result<String> {
    let output = run_command_check_status(cmd, ui)?.stdout;
    let output = String::from_utf8_lossy(&output);
    find_row_and_column(&output, row_contains, column).ok_or_else(|| {
        anyhow::anyhow!(
            "'{row_contains}' column {column} not found in output of {} \
            (output: {:?})",
            cmd.get_program().to_string_lossy(),
            output
        )
    })
}

fn find_row_and_column(
    output: &str,
    row_contains: &str,
    column: usize,
) -> Option<String> {
    output
        .lines()
        .find(|line| line.contains(row_contains))
        .and_then(|line| line.split_whitespace().nth(column))
        .map(str::to_owned)
}

/// Returns a message for each of `commands` that can't be found on the
/// current `PATH`.
pub fn check_executable_prerequisites<'a>(
    commands: impl IntoIterator<Item = &'a str>,
) -> Vec<String> {
    let mut missing: Vec<String> = commands
        .into_iter()
        .filter(|cmd| which::which(cmd).is_err())
        .map(|cmd| format!("executable '{cmd}' not found on PATH"))
        .collect();

    missing.sort();
    missing.dedup();
    missing
}

/// Returns the path of a uniquely-named temporary sibling of `path`, in the
/// same directory so that a later rename is atomic.
pub fn temp_sibling(path: &Utf8Path) -> Utf8PathBuf {
    let suffix: u32 = rand::thread_rng().gen();
    let name = path.file_name().unwrap_or("file");
    path.with_file_name(format!(
        ".{name}.tmp-{}-{suffix:08x}",
        std::process::id()
    ))
}

/// Writes `contents` to `path` such that readers only ever see the old or the
/// new contents, never a torn write. The file is created readable and
/// writable by the current user only.
pub fn write_private_file(
    path: &Utf8Path,
    contents: &[u8],
) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating directory {parent}"))?;
    }

    let tmp = temp_sibling(path);
    let write = || -> std::io::Result<()> {
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(&tmp)?;
        file.write_all(contents)?;
        file.sync_all()?;
        std::fs::rename(&tmp, path)
    };

    write().map_err(|e| {
        let _ = std::fs::remove_file(&tmp);
        anyhow::Error::new(e).context(format!("writing {path}"))
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    #[test]
    fn df_style_output_column() {
        let output = concat!(
            "Filesystem  1024-blocks      Used Available Capacity Mounted on\n",
            "/dev/nvme0n1p2 490617784 205614588 260009176      45% /\n",
        );
        assert_eq!(
            find_row_and_column(output, "%", 3).as_deref(),
            Some("260009176")
        );
        assert_eq!(find_row_and_column(output, "%", 9), None);
        assert_eq!(find_row_and_column(output, "nope", 0), None);
    }

    #[test]
    fn private_file_is_owner_only_and_replaced_whole() {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(dir.path().join("a/secret"))
            .unwrap();

        write_private_file(&path, b"first").unwrap();
        write_private_file(&path, b"second").unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), b"second");
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);

        let leftovers: Vec<_> = std::fs::read_dir(path.parent().unwrap())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(leftovers.len(), 1);
    }
}
