/*!
Update modules are external executables that implement the actual
installation for one payload type: the agent downloads and verifies the
artifact, the module writes it to wherever it belongs and answers for
reboot and rollback behavior.

A module lives at `<modules_path>/<payload_type>` and is invoked once per
deployment state as `<module> <StateName> <workdir>`, with a prepared file
tree as its working directory:

```text
version                     current_artifact_name    current_artifact_group
current_device_type
header/artifact_name        header/artifact_group    header/payload_type
header/header-info          header/type-info         header/meta-data
tmp/                        files/                   streams/
```

Query states (`NeedsArtifactReboot`, `SupportsRollback`) must print exactly
one answer line on stdout; everything else communicates through the exit
status. The `Download` state additionally speaks the streaming protocol
described in the [`download`] module.

Every invocation runs under a hard timeout; an overrunning module gets
SIGTERM and, after a grace period, SIGKILL.
*/

pub mod download;
pub mod error;

pub use error::{Error, Result};

use log::{debug, info};
use snafu::ResultExt;
use std::fmt;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};

/// Grace period between SIGTERM and SIGKILL for a timed-out module.
const TERMINATE_GRACE: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleState {
    Download,
    ArtifactInstall,
    NeedsArtifactReboot,
    ArtifactReboot,
    SupportsRollback,
    ArtifactRollback,
    ArtifactVerifyReboot,
    ArtifactRollbackReboot,
    ArtifactVerifyRollbackReboot,
    ArtifactCommit,
    ArtifactFailure,
    Cleanup,
}

impl fmt::Display for ModuleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ModuleState::Download => "Download",
            ModuleState::ArtifactInstall => "ArtifactInstall",
            ModuleState::NeedsArtifactReboot => "NeedsArtifactReboot",
            ModuleState::ArtifactReboot => "ArtifactReboot",
            ModuleState::SupportsRollback => "SupportsRollback",
            ModuleState::ArtifactRollback => "ArtifactRollback",
            ModuleState::ArtifactVerifyReboot => "ArtifactVerifyReboot",
            ModuleState::ArtifactRollbackReboot => "ArtifactRollbackReboot",
            ModuleState::ArtifactVerifyRollbackReboot => "ArtifactVerifyRollbackReboot",
            ModuleState::ArtifactCommit => "ArtifactCommit",
            ModuleState::ArtifactFailure => "ArtifactFailure",
            ModuleState::Cleanup => "Cleanup",
        })
    }
}

/// The module's answer to `NeedsArtifactReboot`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebootAction {
    No,
    Automatic,
    Yes,
}

/// Everything that goes into the module's file tree before the first
/// invocation.
#[derive(Debug, Clone, Default)]
pub struct FileTreeData {
    pub current_artifact_name: Option<String>,
    pub current_artifact_group: Option<String>,
    pub current_device_type: String,
    pub artifact_name: String,
    pub artifact_group: Option<String>,
    pub payload_type: String,
    pub header_info: String,
    pub type_info: String,
    pub meta_data: Option<String>,
}

pub struct UpdateModule {
    module_path: PathBuf,
    work_dir: PathBuf,
    timeout: Duration,
}

impl UpdateModule {
    /// `modules_path` is where module executables live; the work dir is the
    /// per-deployment file tree (payload index 0000).
    pub fn new(
        modules_path: &Path,
        modules_work_path: &Path,
        payload_type: &str,
        timeout: Duration,
    ) -> Self {
        Self {
            module_path: modules_path.join(payload_type),
            work_dir: modules_work_path.join("0000"),
            timeout,
        }
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    pub fn module_path(&self) -> &Path {
        &self.module_path
    }

    /// Fails early if the module executable is missing, so the deployment
    /// can error out before anything is downloaded.
    pub fn check_module_exists(&self) -> Result<()> {
        if !self.module_path.is_file() {
            return error::ModuleNotFoundSnafu {
                path: &self.module_path,
            }
            .fail();
        }
        Ok(())
    }

    /// Writes the file tree the module contract promises, then syncs it so
    /// a spontaneous reboot can't leave half a tree.
    pub fn prepare_file_tree(&self, data: &FileTreeData) -> Result<()> {
        let tree = &self.work_dir;
        let header = tree.join("header");
        for dir in [tree.clone(), header.clone(), tree.join("tmp"), tree.join("files"), tree.join("streams")] {
            fs::create_dir_all(&dir).context(error::DirCreateSnafu { path: &dir })?;
        }

        let current = |value: &Option<String>| match value {
            Some(v) => format!("{}\n", v),
            None => String::new(),
        };
        write_entry(tree, "version", "3\n")?;
        write_entry(tree, "current_artifact_name", &current(&data.current_artifact_name))?;
        write_entry(tree, "current_artifact_group", &current(&data.current_artifact_group))?;
        write_entry(tree, "current_device_type", &format!("{}\n", data.current_device_type))?;

        write_entry(&header, "artifact_name", &data.artifact_name)?;
        write_entry(&header, "artifact_group", data.artifact_group.as_deref().unwrap_or(""))?;
        write_entry(&header, "payload_type", &data.payload_type)?;
        write_entry(&header, "header-info", &data.header_info)?;
        write_entry(&header, "type-info", &data.type_info)?;
        write_entry(&header, "meta-data", data.meta_data.as_deref().unwrap_or(""))?;

        for dir in [&header, tree] {
            File::open(dir)
                .and_then(|d| d.sync_all())
                .context(error::TreeSyncSnafu {
                    path: dir.as_path(),
                })?;
        }
        Ok(())
    }

    pub async fn artifact_install(&self) -> Result<()> {
        self.call_state_no_output(ModuleState::ArtifactInstall).await
    }

    pub async fn artifact_reboot(&self) -> Result<()> {
        self.call_state_no_output(ModuleState::ArtifactReboot).await
    }

    pub async fn artifact_verify_reboot(&self) -> Result<()> {
        self.call_state_no_output(ModuleState::ArtifactVerifyReboot).await
    }

    pub async fn artifact_commit(&self) -> Result<()> {
        self.call_state_no_output(ModuleState::ArtifactCommit).await
    }

    pub async fn artifact_rollback(&self) -> Result<()> {
        self.call_state_no_output(ModuleState::ArtifactRollback).await
    }

    pub async fn artifact_rollback_reboot(&self) -> Result<()> {
        self.call_state_no_output(ModuleState::ArtifactRollbackReboot).await
    }

    pub async fn artifact_verify_rollback_reboot(&self) -> Result<()> {
        self.call_state_no_output(ModuleState::ArtifactVerifyRollbackReboot).await
    }

    pub async fn artifact_failure(&self) -> Result<()> {
        self.call_state_no_output(ModuleState::ArtifactFailure).await
    }

    /// Runs the module's `Cleanup` state and removes the file tree. An
    /// already-absent tree means there is nothing to clean.
    pub async fn cleanup(&self) -> Result<()> {
        if self.work_dir.is_dir() {
            self.call_state_no_output(ModuleState::Cleanup).await?;
        }
        match fs::remove_dir_all(&self.work_dir) {
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            other => other.context(error::DirRemoveSnafu {
                path: &self.work_dir,
            }),
        }
    }

    pub async fn needs_reboot(&self) -> Result<RebootAction> {
        let state = ModuleState::NeedsArtifactReboot;
        let answer = self.call_state_capture(state).await?;
        match answer.as_str() {
            "Yes" => Ok(RebootAction::Yes),
            "No" => Ok(RebootAction::No),
            "Automatic" => Ok(RebootAction::Automatic),
            _ => error::UnexpectedOutputSnafu {
                state: state.to_string(),
                output: answer,
            }
            .fail(),
        }
    }

    pub async fn supports_rollback(&self) -> Result<bool> {
        let state = ModuleState::SupportsRollback;
        let answer = self.call_state_capture(state).await?;
        match answer.as_str() {
            "Yes" => Ok(true),
            "No" => Ok(false),
            _ => error::UnexpectedOutputSnafu {
                state: state.to_string(),
                output: answer,
            }
            .fail(),
        }
    }

    async fn call_state_no_output(&self, state: ModuleState) -> Result<()> {
        self.call_state(state, false).await.map(|_| ())
    }

    /// Runs a query state and returns its single stdout line.
    async fn call_state_capture(&self, state: ModuleState) -> Result<String> {
        let output = self.call_state(state, true).await?;
        Ok(output.unwrap_or_default())
    }

    pub(crate) fn timeout(&self) -> Duration {
        self.timeout
    }

    pub(crate) fn check_file_tree(&self, state: ModuleState) -> Result<()> {
        if !self.work_dir.is_dir() {
            return error::FileTreeMissingSnafu {
                state: state.to_string(),
                path: &self.work_dir,
            }
            .fail();
        }
        Ok(())
    }

    async fn call_state(&self, state: ModuleState, capture: bool) -> Result<Option<String>> {
        self.check_file_tree(state)?;
        debug!(
            "Calling update module with command `{} {} {}`",
            self.module_path.display(),
            state,
            self.work_dir.display()
        );

        let mut child = self
            .spawn(state)
            .map_err(|e| spawn_error(state, &self.module_path, e))?;

        let stdout = child.stdout.take().expect("stdout piped");
        let stderr = child.stderr.take().expect("stderr piped");
        let err_task = tokio::spawn(forward_lines(stderr, "Update module output (stderr): "));

        let out_task = if capture {
            tokio::spawn(capture_single_line(stdout))
        } else {
            tokio::spawn(async move {
                forward_lines(stdout, "Update module output (stdout): ").await;
                Ok(None)
            })
        };

        let status = match tokio::time::timeout(self.timeout, child.wait()).await {
            Err(_) => {
                terminate(&mut child).await;
                let _ = err_task.await;
                let _ = out_task.await;
                return error::TimeoutSnafu {
                    state: state.to_string(),
                }
                .fail();
            }
            Ok(status) => status.context(error::ModuleWaitSnafu {
                state: state.to_string(),
            })?,
        };
        let _ = err_task.await;
        let captured = out_task.await.unwrap_or(Ok(None));

        if !status.success() {
            return error::NonZeroExitSnafu {
                state: state.to_string(),
                code: status.code().unwrap_or(-1),
            }
            .fail();
        }

        match captured {
            Ok(line) => Ok(line),
            // Multiple lines from a query state.
            Err(()) => error::TooManyLinesSnafu {
                state: state.to_string(),
            }
            .fail(),
        }
    }

    pub(crate) fn spawn(&self, state: ModuleState) -> std::io::Result<tokio::process::Child> {
        tokio::process::Command::new(&self.module_path)
            .arg(state.to_string())
            .arg(&self.work_dir)
            .current_dir(&self.work_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
    }
}

pub(crate) fn spawn_error(state: ModuleState, path: &Path, e: std::io::Error) -> Error {
    if e.kind() == std::io::ErrorKind::NotFound {
        Error::ModuleNotFound {
            path: path.to_path_buf(),
        }
    } else {
        Error::ModuleStart {
            state: state.to_string(),
            path: path.to_path_buf(),
            source: e,
        }
    }
}

fn write_entry(dir: &Path, name: &str, content: &str) -> Result<()> {
    let path = dir.join(name);
    fs::write(&path, content).context(error::TreeWriteSnafu { path: &path })?;
    File::open(&path)
        .and_then(|f| f.sync_all())
        .context(error::TreeWriteSnafu { path: &path })?;
    Ok(())
}

pub(crate) async fn forward_lines<R>(reader: R, prefix: &'static str)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        info!("{}{}", prefix, line);
    }
}

/// Captures the single line a query state is allowed to print. A second
/// non-empty line is a protocol violation, reported as `Err(())`.
async fn capture_single_line<R>(reader: R) -> std::result::Result<Option<String>, ()>
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    let mut first: Option<String> = None;
    while let Ok(Some(line)) = lines.next_line().await {
        match (&first, line.is_empty()) {
            (None, _) => first = Some(line),
            (Some(_), true) => {}
            (Some(_), false) => return Err(()),
        }
    }
    Ok(first)
}

/// SIGTERM, a grace period, then SIGKILL.
pub(crate) async fn terminate(child: &mut tokio::process::Child) {
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
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    fn install_module(dir: &Path, payload_type: &str, body: &str) {
        let path = dir.join(payload_type);
        fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    }

    fn module_with(modules: &TempDir, work: &TempDir, body: &str) -> UpdateModule {
        install_module(modules.path(), "test-module", body);
        let module = UpdateModule::new(
            modules.path(),
            work.path(),
            "test-module",
            Duration::from_secs(5),
        );
        module.prepare_file_tree(&tree_data()).unwrap();
        module
    }

    fn tree_data() -> FileTreeData {
        FileTreeData {
            current_artifact_name: Some("old-release".to_string()),
            current_artifact_group: None,
            current_device_type: "test-device".to_string(),
            artifact_name: "new-release".to_string(),
            artifact_group: Some("prod".to_string()),
            payload_type: "test-module".to_string(),
            header_info: r#"{"payloads":[{"type":"test-module"}]}"#.to_string(),
            type_info: r#"{"type":"test-module"}"#.to_string(),
            meta_data: None,
        }
    }

    #[test]
    fn file_tree_has_the_promised_layout() {
        let modules = TempDir::new().unwrap();
        let work = TempDir::new().unwrap();
        let module = UpdateModule::new(
            modules.path(),
            work.path(),
            "test-module",
            Duration::from_secs(5),
        );
        module.prepare_file_tree(&tree_data()).unwrap();

        let tree = work.path().join("0000");
        assert_eq!(fs::read_to_string(tree.join("version")).unwrap(), "3\n");
        assert_eq!(
            fs::read_to_string(tree.join("current_artifact_name")).unwrap(),
            "old-release\n"
        );
        // Missing provides become empty files.
        assert_eq!(
            fs::read_to_string(tree.join("current_artifact_group")).unwrap(),
            ""
        );
        assert_eq!(
            fs::read_to_string(tree.join("current_device_type")).unwrap(),
            "test-device\n"
        );
        assert_eq!(
            fs::read_to_string(tree.join("header/artifact_name")).unwrap(),
            "new-release"
        );
        assert_eq!(
            fs::read_to_string(tree.join("header/payload_type")).unwrap(),
            "test-module"
        );
        assert!(tree.join("header/header-info").exists());
        assert!(tree.join("header/type-info").exists());
        assert!(tree.join("header/meta-data").exists());
        for dir in ["tmp", "files", "streams"] {
            assert!(tree.join(dir).is_dir());
        }
    }

    #[tokio::test]
    async fn successful_state_call() {
        let modules = TempDir::new().unwrap();
        let work = TempDir::new().unwrap();
        let module = module_with(&modules, &work, "exit 0");
        module.artifact_install().await.unwrap();
    }

    #[tokio::test]
    async fn module_receives_state_and_workdir() {
        let modules = TempDir::new().unwrap();
        let work = TempDir::new().unwrap();
        let module = module_with(&modules, &work, r#"echo "$1" > "$2/invoked-with""#);
        module.artifact_commit().await.unwrap();
        assert_eq!(
            fs::read_to_string(work.path().join("0000/invoked-with")).unwrap(),
            "ArtifactCommit\n"
        );
    }

    #[tokio::test]
    async fn nonzero_exit_is_reported_with_the_state() {
        let modules = TempDir::new().unwrap();
        let work = TempDir::new().unwrap();
        let module = module_with(&modules, &work, "exit 3");
        let err = module.artifact_install().await.unwrap_err();
        match err {
            Error::NonZeroExit { state, code } => {
                assert_eq!(state, "ArtifactInstall");
                assert_eq!(code, 3);
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[tokio::test]
    async fn reboot_query_answers() {
        let modules = TempDir::new().unwrap();
        let work = TempDir::new().unwrap();

        for (body, expected) in [
            ("echo Yes", RebootAction::Yes),
            ("echo No", RebootAction::No),
            ("echo Automatic", RebootAction::Automatic),
        ] {
            let module = module_with(&modules, &work, body);
            assert_eq!(module.needs_reboot().await.unwrap(), expected);
        }
    }

    #[tokio::test]
    async fn rollback_query_answers() {
        let modules = TempDir::new().unwrap();
        let work = TempDir::new().unwrap();
        let module = module_with(&modules, &work, "echo Yes");
        assert!(module.supports_rollback().await.unwrap());
        let module = module_with(&modules, &work, "echo No");
        assert!(!module.supports_rollback().await.unwrap());
    }

    #[tokio::test]
    async fn two_answer_lines_are_a_protocol_error() {
        let modules = TempDir::new().unwrap();
        let work = TempDir::new().unwrap();
        let module = module_with(&modules, &work, "echo Yes; echo No");
        let err = module.needs_reboot().await.unwrap_err();
        assert!(matches!(err, Error::TooManyLines { .. }));
    }

    #[tokio::test]
    async fn garbage_answer_is_rejected() {
        let modules = TempDir::new().unwrap();
        let work = TempDir::new().unwrap();
        let module = module_with(&modules, &work, "echo Maybe");
        let err = module.needs_reboot().await.unwrap_err();
        assert!(matches!(err, Error::UnexpectedOutput { .. }));
    }

    #[tokio::test]
    async fn missing_module_is_distinguished() {
        let modules = TempDir::new().unwrap();
        let work = TempDir::new().unwrap();
        let module = UpdateModule::new(
            modules.path(),
            work.path(),
            "no-such-module",
            Duration::from_secs(5),
        );
        assert!(matches!(
            module.check_module_exists().unwrap_err(),
            Error::ModuleNotFound { .. }
        ));
        module.prepare_file_tree(&tree_data()).unwrap();
        let err = module.artifact_install().await.unwrap_err();
        assert!(matches!(err, Error::ModuleNotFound { .. }));
    }

    #[tokio::test]
    async fn cleanup_removes_the_tree_and_tolerates_absence() {
        let modules = TempDir::new().unwrap();
        let work = TempDir::new().unwrap();
        let module = module_with(&modules, &work, "exit 0");
        assert!(module.work_dir().is_dir());
        module.cleanup().await.unwrap();
        assert!(!module.work_dir().exists());

        // Second cleanup has nothing to do and succeeds without invoking
        // the module.
        module.cleanup().await.unwrap();
    }

    #[tokio::test]
    async fn overrunning_module_times_out() {
        let modules = TempDir::new().unwrap();
        let work = TempDir::new().unwrap();
        install_module(modules.path(), "slow", "sleep 30");
        let module = UpdateModule::new(
            modules.path(),
            work.path(),
            "slow",
            Duration::from_millis(200),
        );
        module.prepare_file_tree(&tree_data()).unwrap();
        let err = module.artifact_install().await.unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }));
    }
}
