//! Process spawning for leaf commands.

use std::time::Instant;

use camino::Utf8Path;
use tokio::process::Command;
use tracing::debug;

use crate::{command::path_with_local_bin, Error};

/// The captured result of one spawned command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutcome {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
}

impl ExecOutcome {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Runs a shell command in the package directory with the package-local bin
/// dir on `PATH`, capturing stdout and stderr completely.
pub async fn run_command(command: &str, package_dir: &Utf8Path) -> Result<ExecOutcome, Error> {
    debug!(target: "sail::task", %command, dir = %package_dir, "spawning");
    let started = Instant::now();

    let output = shell(command)
        .current_dir(package_dir)
        .env("PATH", path_with_local_bin(package_dir))
        .kill_on_drop(false)
        .output()
        .await
        .map_err(|source| Error::Spawn {
            command: command.to_owned(),
            source,
        })?;

    let duration_ms = started.elapsed().as_millis() as u64;
    Ok(ExecOutcome {
        // A missing code means the process died to a signal; report it as a
        // plain failure.
        exit_code: output.status.code().unwrap_or(1),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        duration_ms,
    })
}

#[cfg(unix)]
fn shell(command: &str) -> Command {
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(command);
    cmd
}

#[cfg(windows)]
fn shell(command: &str) -> Command {
    let mut cmd = Command::new("cmd");
    cmd.arg("/C").arg(command);
    cmd
}
