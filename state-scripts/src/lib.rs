/*!
State scripts are hook executables the device integrator installs around
named deployment transitions. A script is named
`<State>_<Action>_NN[_suffix]`, e.g. `ArtifactInstall_Enter_05_migrate`,
and lives in one of two places: `Artifact*` states read from the directory
the artifact parser installs embedded scripts into, everything else reads
from the rootfs scripts directory baked into the image.

The runner enumerates matching executables, sorts them lexicographically,
and runs them one at a time with a per-script timeout. Exit code 21 is the
distinguished "retry later" answer; any other non-zero exit is a failure.
With `OnError::Ignore` (and always for `Action::Error`) failures are
logged, remaining scripts still run, and the collected failures are folded
into one error at the end.

A missing script directory means the integrator installed no hooks, which
is not an error.
*/

pub mod error;

pub use error::{Error, Result};

use log::{error, info, warn};
use regex::Regex;
use snafu::ResultExt;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};

/// The version of the state-script format we execute.
pub const SUPPORTED_SCRIPT_VERSION: &str = "3";

/// Exit status a script uses to ask for the state to be retried later.
pub const RETRY_EXIT_CODE: i32 = 21;

/// Grace period between SIGTERM and SIGKILL for a timed-out script.
const TERMINATE_GRACE: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Idle,
    Sync,
    Download,
    ArtifactInstall,
    ArtifactReboot,
    ArtifactCommit,
    ArtifactRollback,
    ArtifactRollbackReboot,
    ArtifactFailure,
}

impl State {
    /// Artifact states read scripts delivered inside the artifact; the rest
    /// use the scripts baked into the rootfs.
    pub fn is_artifact_state(self) -> bool {
        matches!(
            self,
            State::ArtifactInstall
                | State::ArtifactReboot
                | State::ArtifactCommit
                | State::ArtifactRollback
                | State::ArtifactRollbackReboot
                | State::ArtifactFailure
        )
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            State::Idle => "Idle",
            State::Sync => "Sync",
            State::Download => "Download",
            State::ArtifactInstall => "ArtifactInstall",
            State::ArtifactReboot => "ArtifactReboot",
            State::ArtifactCommit => "ArtifactCommit",
            State::ArtifactRollback => "ArtifactRollback",
            State::ArtifactRollbackReboot => "ArtifactRollbackReboot",
            State::ArtifactFailure => "ArtifactFailure",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Enter,
    Leave,
    Error,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Action::Enter => "Enter",
            Action::Leave => "Leave",
            Action::Error => "Error",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnError {
    Fail,
    Ignore,
}

pub struct ScriptRunner {
    artifact_scripts_path: PathBuf,
    rootfs_scripts_path: PathBuf,
    timeout: Duration,
}

impl ScriptRunner {
    pub fn new(
        artifact_scripts_path: impl Into<PathBuf>,
        rootfs_scripts_path: impl Into<PathBuf>,
        timeout: Duration,
    ) -> Self {
        Self {
            artifact_scripts_path: artifact_scripts_path.into(),
            rootfs_scripts_path: rootfs_scripts_path.into(),
            timeout,
        }
    }

    /// Runs all scripts for the given state and action.
    pub async fn run(&self, state: State, action: Action, on_error: OnError) -> Result<()> {
        let dir = if state.is_artifact_state() {
            self.check_version_file()?;
            &self.artifact_scripts_path
        } else {
            &self.rootfs_scripts_path
        };

        let scripts = match collect_scripts(dir, state, action)? {
            Some(scripts) => scripts,
            None => {
                warn!(
                    "Found no state script directory ({}). Continuing on",
                    dir.display()
                );
                return Ok(());
            }
        };

        let ignore_errors = on_error == OnError::Ignore || action == Action::Error;
        let mut failures: Vec<String> = Vec::new();

        for script in scripts {
            info!("Running state script: {}", script.display());
            match self.execute(&script).await {
                Ok(()) => {}
                Err(e) if ignore_errors => {
                    error!("State script failed (continuing): {}", e);
                    failures.push(e.to_string());
                }
                Err(e) => return Err(e),
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            error::ScriptsFailedSnafu {
                details: failures.join("; "),
            }
            .fail()
        }
    }

    /// Artifact scripts carry a version stamp next to them; a missing file
    /// is accepted for compatibility with installers that wrote none.
    fn check_version_file(&self) -> Result<()> {
        let path = self.artifact_scripts_path.join("version");
        let raw = match std::fs::read_to_string(&path) {
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(Error::VersionFileRead { path, source: e }),
            Ok(raw) => raw,
        };
        let version = raw.trim().to_string();
        if version != SUPPORTED_SCRIPT_VERSION {
            return error::VersionFileSnafu { version }.fail();
        }
        Ok(())
    }

    async fn execute(&self, script: &Path) -> Result<()> {
        let mut child = tokio::process::Command::new(script)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .context(error::ScriptStartSnafu { script })?;

        let stdout = child.stdout.take().expect("stdout piped");
        let stderr = child.stderr.take().expect("stderr piped");
        let out_task = tokio::spawn(forward_lines(stdout, "State script output (stdout): "));
        let err_task = tokio::spawn(forward_lines(stderr, "State script output (stderr): "));

        let status = match tokio::time::timeout(self.timeout, child.wait()).await {
            Err(_) => {
                terminate(&mut child).await;
                let _ = out_task.await;
                let _ = err_task.await;
                return error::TimeoutSnafu { script }.fail();
            }
            Ok(status) => status.context(error::ScriptWaitSnafu { script })?,
        };
        let _ = out_task.await;
        let _ = err_task.await;

        match status.code() {
            Some(0) => Ok(()),
            Some(RETRY_EXIT_CODE) => error::RetryExitCodeSnafu {
                script,
                code: RETRY_EXIT_CODE,
            }
            .fail(),
            Some(code) => error::NonZeroExitStatusSnafu { script, code }.fail(),
            // Killed by a signal.
            None => error::NonZeroExitStatusSnafu { script, code: -1 }.fail(),
        }
    }
}

/// Returns the sorted matching scripts, or None if the directory is absent.
fn collect_scripts(dir: &Path, state: State, action: Action) -> Result<Option<Vec<PathBuf>>> {
    let pattern = Regex::new(&format!(r"^{}_{}_[0-9][0-9](_\S+)?$", state, action))
        .expect("static pattern");

    let entries = match std::fs::read_dir(dir) {
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(Error::ListScripts {
            path: dir.to_path_buf(),
            source: e,
        }),
        Ok(entries) => entries,
    };

    let mut scripts = Vec::new();
    for entry in entries {
        let entry = entry.context(error::ListScriptsSnafu { path: dir })?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if !pattern.is_match(&name) {
            continue;
        }
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        if nix::unistd::access(&path, nix::unistd::AccessFlags::X_OK).is_err() {
            warn!(
                "State script '{}' matches but is not executable, skipping",
                path.display()
            );
            continue;
        }
        scripts.push(path);
    }
    scripts.sort();
    Ok(Some(scripts))
}

async fn forward_lines<R>(reader: R, prefix: &'static str)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        info!("{}{}", prefix, line);
    }
}

/// SIGTERM, a grace period, then SIGKILL.
async fn terminate(child: &mut tokio::process::Child) {
    if let Some(pid) = child.id() {
        let _ = nix::sys::signal::kill(
            nix::unistd::Pid::from_raw(pid as i32),
            nix::sys::signal::Signal::SIGTERM,
        );
        if tokio::time::timeout(TERMINATE_GRACE, child.wait()).await.is_ok() {
            return;
        }
    }
    let _ = child.kill().await;
}

#[cfg(test)]
mod test {
    use super::*;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    fn write_script(dir: &Path, name: &str, body: &str) {
        let path = dir.join(name);
        fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    }

    fn runner(artifact: &TempDir, rootfs: &TempDir) -> ScriptRunner {
        ScriptRunner::new(
            artifact.path(),
            rootfs.path(),
            Duration::from_secs(5),
        )
    }

    #[tokio::test]
    async fn scripts_run_in_lexicographic_order() {
        let artifact = TempDir::new().unwrap();
        let rootfs = TempDir::new().unwrap();
        let marker = artifact.path().join("order");

        write_script(
            artifact.path(),
            "ArtifactInstall_Enter_02_foo",
            &format!("echo second >> {}", marker.display()),
        );
        write_script(
            artifact.path(),
            "ArtifactInstall_Enter_01_bar",
            &format!("echo first >> {}", marker.display()),
        );

        runner(&artifact, &rootfs)
            .run(State::ArtifactInstall, Action::Enter, OnError::Fail)
            .await
            .unwrap();

        assert_eq!(fs::read_to_string(marker).unwrap(), "first\nsecond\n");
    }

    #[tokio::test]
    async fn non_matching_and_non_executable_scripts_are_skipped() {
        let artifact = TempDir::new().unwrap();
        let rootfs = TempDir::new().unwrap();
        let marker = artifact.path().join("ran");

        // Wrong action, wrong digit count, and an unset executable bit.
        write_script(
            artifact.path(),
            "ArtifactInstall_Leave_01",
            &format!("touch {}", marker.display()),
        );
        write_script(
            artifact.path(),
            "ArtifactInstall_Enter_1",
            &format!("touch {}", marker.display()),
        );
        let not_exec = artifact.path().join("ArtifactInstall_Enter_03");
        fs::write(&not_exec, "#!/bin/sh\nexit 1\n").unwrap();
        fs::set_permissions(&not_exec, fs::Permissions::from_mode(0o644)).unwrap();

        runner(&artifact, &rootfs)
            .run(State::ArtifactInstall, Action::Enter, OnError::Fail)
            .await
            .unwrap();
        assert!(!marker.exists());
    }

    #[tokio::test]
    async fn download_uses_the_rootfs_directory() {
        let artifact = TempDir::new().unwrap();
        let rootfs = TempDir::new().unwrap();
        let marker = rootfs.path().join("ran");

        write_script(
            rootfs.path(),
            "Download_Enter_10",
            &format!("touch {}", marker.display()),
        );
        // A same-named script in the artifact dir must not run.
        write_script(artifact.path(), "Download_Enter_10", "exit 1");

        runner(&artifact, &rootfs)
            .run(State::Download, Action::Enter, OnError::Fail)
            .await
            .unwrap();
        assert!(marker.exists());
    }

    #[tokio::test]
    async fn retry_exit_code_is_distinguished() {
        let artifact = TempDir::new().unwrap();
        let rootfs = TempDir::new().unwrap();
        write_script(artifact.path(), "ArtifactCommit_Enter_01", "exit 21");

        let err = runner(&artifact, &rootfs)
            .run(State::ArtifactCommit, Action::Enter, OnError::Fail)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::RetryExitCode { code: 21, .. }));
    }

    #[tokio::test]
    async fn nonzero_exit_fails_and_stops_the_sequence() {
        let artifact = TempDir::new().unwrap();
        let rootfs = TempDir::new().unwrap();
        let marker = artifact.path().join("ran-second");
        write_script(artifact.path(), "ArtifactInstall_Enter_01", "exit 2");
        write_script(
            artifact.path(),
            "ArtifactInstall_Enter_02",
            &format!("touch {}", marker.display()),
        );

        let err = runner(&artifact, &rootfs)
            .run(State::ArtifactInstall, Action::Enter, OnError::Fail)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NonZeroExitStatus { code: 2, .. }));
        assert!(!marker.exists());
    }

    #[tokio::test]
    async fn ignore_policy_runs_everything_and_folds_errors() {
        let artifact = TempDir::new().unwrap();
        let rootfs = TempDir::new().unwrap();
        let marker = artifact.path().join("ran-second");
        write_script(artifact.path(), "ArtifactFailure_Enter_01", "exit 2");
        write_script(
            artifact.path(),
            "ArtifactFailure_Enter_02",
            &format!("touch {}", marker.display()),
        );

        let err = runner(&artifact, &rootfs)
            .run(State::ArtifactFailure, Action::Enter, OnError::Ignore)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ScriptsFailed { .. }));
        assert!(marker.exists());
    }

    #[tokio::test]
    async fn error_action_always_continues() {
        let artifact = TempDir::new().unwrap();
        let rootfs = TempDir::new().unwrap();
        let marker = artifact.path().join("ran-second");
        write_script(artifact.path(), "ArtifactInstall_Error_01", "exit 1");
        write_script(
            artifact.path(),
            "ArtifactInstall_Error_02",
            &format!("touch {}", marker.display()),
        );

        let err = runner(&artifact, &rootfs)
            .run(State::ArtifactInstall, Action::Error, OnError::Fail)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ScriptsFailed { .. }));
        assert!(marker.exists());
    }

    #[tokio::test]
    async fn missing_directory_is_not_an_error() {
        let artifact = TempDir::new().unwrap();
        let rootfs = TempDir::new().unwrap();
        let runner = ScriptRunner::new(
            artifact.path().join("nope"),
            rootfs.path().join("nope"),
            Duration::from_secs(5),
        );
        runner
            .run(State::ArtifactInstall, Action::Enter, OnError::Fail)
            .await
            .unwrap();
        runner
            .run(State::Download, Action::Enter, OnError::Fail)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn version_file_gates_artifact_states_only() {
        let artifact = TempDir::new().unwrap();
        let rootfs = TempDir::new().unwrap();
        fs::write(artifact.path().join("version"), "2\n").unwrap();
        write_script(rootfs.path(), "Download_Enter_01", "exit 0");

        let runner = runner(&artifact, &rootfs);
        let err = runner
            .run(State::ArtifactInstall, Action::Enter, OnError::Fail)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::VersionFile { .. }));

        // Non-artifact states don't read the version file.
        runner
            .run(State::Download, Action::Enter, OnError::Fail)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn accepted_version_file_passes() {
        let artifact = TempDir::new().unwrap();
        let rootfs = TempDir::new().unwrap();
        fs::write(artifact.path().join("version"), "3\n").unwrap();
        write_script(artifact.path(), "ArtifactInstall_Enter_01", "exit 0");

        runner(&artifact, &rootfs)
            .run(State::ArtifactInstall, Action::Enter, OnError::Fail)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn overrunning_script_times_out() {
        let artifact = TempDir::new().unwrap();
        let rootfs = TempDir::new().unwrap();
        write_script(artifact.path(), "ArtifactReboot_Enter_01", "sleep 30");

        let runner = ScriptRunner::new(
            artifact.path(),
            rootfs.path(),
            Duration::from_millis(200),
        );
        let err = runner
            .run(State::ArtifactReboot, Action::Enter, OnError::Fail)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }));
    }
}
