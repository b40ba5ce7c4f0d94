//! The standalone install flow: `install`, `commit`, and `rollback`
//! without the daemon. It drives the same module protocol and state
//! scripts, but persists its progress under the `standalone-state` key,
//! which the daemon never touches.

use crate::context::MenderContext;
use crate::error::{self, Error, Result};
use keyvalue::Transaction;
use log::{info, warn};
use mender_artifact::{Artifact, ParserConfig};
use retry_download::RetrySettings;
use serde::{Deserialize, Serialize};
use snafu::ResultExt;
use state_scripts::{Action, OnError, ScriptRunner};
use std::collections::HashMap;
use std::path::PathBuf;
use update_module::{FileTreeData, RebootAction, UpdateModule};

pub const STANDALONE_DATA_VERSION: i32 = 2;

// The `in_state` value names the next step to perform.
pub const IN_STATE_ARTIFACT_COMMIT: &str = "ArtifactCommit_Enter";

/// The record tracking a started-but-not-committed standalone install.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StandaloneData {
    pub version: i32,
    pub artifact_name: String,
    pub artifact_group: String,
    pub artifact_provides: Option<HashMap<String, String>>,
    pub artifact_clears_provides: Option<Vec<String>>,
    pub payload_types: Vec<String>,
    pub in_state: String,
    pub failed: bool,
    pub rolled_back: bool,
}

impl StandaloneData {
    fn from_artifact(artifact: &Artifact) -> Self {
        Self {
            version: STANDALONE_DATA_VERSION,
            artifact_name: artifact.artifact_name().to_string(),
            artifact_group: artifact.artifact_group().unwrap_or_default().to_string(),
            artifact_provides: Some(artifact.provides()),
            artifact_clears_provides: artifact.clears_provides().map(<[String]>::to_vec),
            payload_types: vec![artifact.payload_type().unwrap_or_default().to_string()],
            in_state: IN_STATE_ARTIFACT_COMMIT.to_string(),
            failed: false,
            rolled_back: false,
        }
    }

    fn new_provides(&self) -> HashMap<String, String> {
        let mut provides = self.artifact_provides.clone().unwrap_or_default();
        provides.insert("artifact_name".to_string(), self.artifact_name.clone());
        if !self.artifact_group.is_empty() {
            provides.insert("artifact_group".to_string(), self.artifact_group.clone());
        }
        provides
    }
}

fn save_standalone_data(ctx: &mut MenderContext, data: &StandaloneData) -> Result<()> {
    let encoded = serde_json::to_vec(data).context(error::StateDataEncodeSnafu)?;
    ctx.store.write(constants::STANDALONE_STATE_KEY, &encoded)?;
    Ok(())
}

fn load_standalone_data(ctx: &MenderContext) -> Result<Option<StandaloneData>> {
    match ctx.store.read(constants::STANDALONE_STATE_KEY) {
        Ok(raw) => {
            let data = serde_json::from_slice(&raw).context(error::StateDataParseSnafu)?;
            Ok(Some(data))
        }
        Err(keyvalue::Error::KeyNotFound { .. }) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn script_runner(ctx: &MenderContext) -> ScriptRunner {
    ScriptRunner::new(
        &ctx.config.artifact_scripts_path,
        &ctx.config.rootfs_scripts_path,
        ctx.config.state_script_timeout,
    )
}

fn module_for(ctx: &MenderContext, payload_type: &str) -> UpdateModule {
    UpdateModule::new(
        &ctx.config.modules_path,
        &ctx.config.modules_work_path,
        payload_type,
        ctx.config.module_timeout,
    )
}

/// What `install` left behind.
#[derive(Debug, PartialEq, Eq)]
pub enum InstallOutcome {
    /// Installed and awaiting `commit`.
    AwaitingCommit,
    /// Installed, but the module wants a reboot before commit.
    RebootRequired,
    /// Empty-payload artifact: provides committed, nothing pending.
    Committed,
}

enum PumpDecision {
    Stream(update_module::download::PumpHandle, PathBuf),
    Abort,
}

/// Installs an artifact from a local path or an HTTP(S) URL, stopping
/// before commit (like the daemon stopping at `ArtifactCommit`).
pub async fn install(ctx: &mut MenderContext, src: &str) -> Result<InstallOutcome> {
    if load_standalone_data(ctx)?.is_some() {
        return error::UpdateAlreadyInProgressSnafu.fail();
    }

    let scripts = script_runner(ctx);
    let device_type = ctx.device_type()?;
    let current_provides = ctx.load_provides()?;
    let parser_config = ParserConfig {
        verify_keys: ctx.config.verify_keys()?,
        artifact_scripts_path: ctx.config.artifact_scripts_path.clone(),
        artifact_scripts_version: 3,
    };

    scripts
        .run(state_scripts::State::Download, Action::Enter, OnError::Fail)
        .await?;

    let (artifact_tx, mut artifact_rx) = tokio::sync::oneshot::channel::<Artifact>();
    let (decision_tx, decision_rx) = std::sync::mpsc::channel::<PumpDecision>();

    let mut parse_task = if src.contains("://") {
        let client = reqwest::Client::new();
        let download =
            retry_download::Download::start(client, src, RetrySettings::default()).await?;
        let (chunk_tx, chunk_reader) = retry_download::reader::channel();
        tokio::spawn(feed_chunks(download, chunk_tx));
        spawn_parse(chunk_reader, parser_config, artifact_tx, decision_rx)
    } else {
        let file = std::fs::File::open(src).context(error::IoSnafu { path: src })?;
        spawn_parse(file, parser_config, artifact_tx, decision_rx)
    };

    let artifact = tokio::select! {
        received = &mut artifact_rx => match received {
            Ok(artifact) => artifact,
            Err(_) => {
                // Empty payload or parse error.
                let artifact = parse_task.await.map_err(join_error)??;
                return commit_empty_payload(ctx, &scripts, &artifact).await;
            }
        },
        result = &mut parse_task => {
            let artifact = result.map_err(join_error)??;
            return commit_empty_payload(ctx, &scripts, &artifact).await;
        }
    };

    let payload_type = artifact.payload_type().expect("payload callback ran");
    let module = module_for(ctx, payload_type);
    let prepared = (|| -> Result<()> {
        module.check_module_exists()?;
        crate::context::check_artifact_depends(&artifact, &device_type, &current_provides)?;
        module.prepare_file_tree(&FileTreeData {
            current_artifact_name: current_provides.get("artifact_name").cloned(),
            current_artifact_group: current_provides.get("artifact_group").cloned(),
            current_device_type: device_type.clone(),
            artifact_name: artifact.artifact_name().to_string(),
            artifact_group: artifact.artifact_group().map(str::to_string),
            payload_type: payload_type.to_string(),
            header_info: artifact.header.info_raw.clone(),
            type_info: artifact.header.type_info_raw.clone(),
            meta_data: artifact.header.meta_data.as_ref().map(|v| v.to_string()),
        })?;
        Ok(())
    })();
    if let Err(e) = prepared {
        let _ = decision_tx.send(PumpDecision::Abort);
        let _ = parse_task.await;
        return Err(e);
    }

    let (driver, pump) = update_module::download::handshake();
    decision_tx
        .send(PumpDecision::Stream(pump, module.work_dir().to_path_buf()))
        .map_err(|_| Error::DownloadAborted)?;
    let download_result = module.download(driver).await;
    let parse_result = parse_task.await.map_err(join_error)?;
    parse_result?;
    download_result?;

    scripts
        .run(state_scripts::State::Download, Action::Leave, OnError::Fail)
        .await?;

    // Install.
    let install_result = async {
        scripts
            .run(
                state_scripts::State::ArtifactInstall,
                Action::Enter,
                OnError::Fail,
            )
            .await?;
        module.artifact_install().await?;
        scripts
            .run(
                state_scripts::State::ArtifactInstall,
                Action::Leave,
                OnError::Fail,
            )
            .await?;
        module.needs_reboot().await.map_err(Error::from)
    }
    .await;

    let reboot = match install_result {
        Ok(reboot) => reboot,
        Err(e) => {
            // Failed install: give the module its failure hook and clean
            // up; nothing was committed.
            warn!("Installation failed: {}", e);
            let _ = scripts
                .run(
                    state_scripts::State::ArtifactFailure,
                    Action::Enter,
                    OnError::Ignore,
                )
                .await;
            if let Err(cleanup_err) = module.artifact_failure().await {
                warn!("ArtifactFailure returned error: {}", cleanup_err);
            }
            if let Err(cleanup_err) = module.cleanup().await {
                warn!("Cleanup returned error: {}", cleanup_err);
            }
            return Err(e);
        }
    };

    let data = StandaloneData::from_artifact(&artifact);
    save_standalone_data(ctx, &data)?;

    match reboot {
        RebootAction::No => {
            info!("Use 'commit' to update, or 'rollback' to roll back the update");
            Ok(InstallOutcome::AwaitingCommit)
        }
        RebootAction::Yes | RebootAction::Automatic => {
            info!("At least one payload requested a reboot of the device it updated");
            Ok(InstallOutcome::RebootRequired)
        }
    }
}

/// Provides-only artifacts have nothing to install; committing the
/// provides is the whole update.
async fn commit_empty_payload(
    ctx: &mut MenderContext,
    scripts: &ScriptRunner,
    artifact: &Artifact,
) -> Result<InstallOutcome> {
    scripts
        .run(state_scripts::State::Download, Action::Leave, OnError::Fail)
        .await?;
    let data = StandaloneData::from_artifact(artifact);
    commit_provides(ctx, &data)?;
    info!("Installed and committed {}", artifact.artifact_name());
    Ok(InstallOutcome::Committed)
}

fn commit_provides(ctx: &mut MenderContext, data: &StandaloneData) -> Result<()> {
    let provides = data.new_provides();
    let clears = data.artifact_clears_provides.clone().unwrap_or_default();
    ctx.commit_artifact_data(&provides, Some(&clears), |txn: &mut Transaction<'_>| {
        txn.remove(constants::STANDALONE_STATE_KEY)?;
        Ok(())
    })
}

/// Commits the pending standalone install.
pub async fn commit(ctx: &mut MenderContext) -> Result<()> {
    let data = load_standalone_data(ctx)?.ok_or(Error::NoUpdateInProgress)?;
    let scripts = script_runner(ctx);
    let payload_type = data
        .payload_types
        .first()
        .cloned()
        .unwrap_or_default();
    let module = module_for(ctx, &payload_type);

    scripts
        .run(
            state_scripts::State::ArtifactCommit,
            Action::Enter,
            OnError::Fail,
        )
        .await?;
    module.artifact_commit().await?;
    commit_provides(ctx, &data)?;
    scripts
        .run(
            state_scripts::State::ArtifactCommit,
            Action::Leave,
            OnError::Fail,
        )
        .await?;
    if let Err(e) = module.cleanup().await {
        warn!("Cleanup returned error: {}", e);
    }
    info!("Committed {}", data.artifact_name);
    Ok(())
}

/// Rolls the pending standalone install back.
pub async fn rollback(ctx: &mut MenderContext) -> Result<()> {
    let data = load_standalone_data(ctx)?.ok_or(Error::NoUpdateInProgress)?;
    let scripts = script_runner(ctx);
    let payload_type = data
        .payload_types
        .first()
        .cloned()
        .unwrap_or_default();
    let module = module_for(ctx, &payload_type);

    if !module.supports_rollback().await? {
        return error::NoRollbackSupportSnafu.fail();
    }

    scripts
        .run(
            state_scripts::State::ArtifactRollback,
            Action::Enter,
            OnError::Fail,
        )
        .await?;
    module.artifact_rollback().await?;
    scripts
        .run(
            state_scripts::State::ArtifactRollback,
            Action::Leave,
            OnError::Fail,
        )
        .await?;

    let _ = scripts
        .run(
            state_scripts::State::ArtifactFailure,
            Action::Enter,
            OnError::Ignore,
        )
        .await;
    if let Err(e) = module.artifact_failure().await {
        warn!("ArtifactFailure returned error: {}", e);
    }
    if let Err(e) = module.cleanup().await {
        warn!("Cleanup returned error: {}", e);
    }
    ctx.store.remove(constants::STANDALONE_STATE_KEY)?;
    info!("Rolled back {}", data.artifact_name);
    Ok(())
}

fn join_error(e: tokio::task::JoinError) -> Error {
    Error::Programming {
        reason: format!("artifact parser task failed: {}", e),
    }
}

fn spawn_parse<R>(
    reader: R,
    config: ParserConfig,
    artifact_tx: tokio::sync::oneshot::Sender<Artifact>,
    decision_rx: std::sync::mpsc::Receiver<PumpDecision>,
) -> tokio::task::JoinHandle<Result<Artifact>>
where
    R: std::io::Read + Send + 'static,
{
    tokio::task::spawn_blocking(move || -> Result<Artifact> {
        let (artifact, _) = mender_artifact::parse::<_, _, Error, _>(
            reader,
            &config,
            move |artifact, payload| {
                let _ = artifact_tx.send(artifact.clone());
                match decision_rx.recv() {
                    Ok(PumpDecision::Stream(pump, work_dir)) => {
                        update_module::download::pump_payload(payload, &work_dir, pump)
                            .map_err(Error::from)
                    }
                    Ok(PumpDecision::Abort) | Err(_) => Err(Error::DownloadAborted),
                }
            },
        )?;
        Ok(artifact)
    })
}

async fn feed_chunks(
    mut download: retry_download::Download,
    chunk_tx: retry_download::reader::ChunkSender,
) {
    loop {
        match download.chunk().await {
            Ok(Some(bytes)) => {
                if !chunk_tx.send(bytes).await {
                    return;
                }
            }
            Ok(None) => return,
            Err(e) => {
                chunk_tx.fail(e.to_string()).await;
                return;
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::MenderConfig;
    use sha2::{Digest, Sha256};
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    fn tar_with(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        for (name, content) in entries {
            let mut header = tar::Header::new_gnu();
            header.set_size(content.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, name, *content).unwrap();
        }
        builder.into_inner().unwrap()
    }

    fn build_artifact(name: &str, payload_type: Option<&str>) -> Vec<u8> {
        let version_doc = br#"{"format":"mender","version":3}"#.to_vec();
        let payload_json = match payload_type {
            Some(t) => format!(r#"{{"type":"{}"}}"#, t),
            None => r#"{"type":null}"#.to_string(),
        };
        let type_info = match payload_type {
            Some(t) => format!(r#"{{"type":"{}"}}"#, t),
            None => "{}".to_string(),
        };
        let header_info = format!(
            r#"{{"payloads":[{}],"artifact_provides":{{"artifact_name":"{}"}},"artifact_depends":{{"device_type":["test-device"]}}}}"#,
            payload_json, name
        );
        let header_tar = tar_with(&[
            ("header-info", header_info.as_bytes()),
            ("headers/0000/type-info", type_info.as_bytes()),
        ]);
        let data_tar = tar_with(&[("payload.dat", b"standalone payload".as_slice())]);
        let sum = |data: &[u8]| hex::encode(Sha256::digest(data));
        let mut manifest = format!(
            "{}  version\n{}  header.tar\n",
            sum(&version_doc),
            sum(&header_tar),
        );
        let mut outer: Vec<(&str, &[u8])> = vec![];
        if payload_type.is_some() {
            manifest.push_str(&format!("{}  data/0000.tar\n", sum(&data_tar)));
        }
        outer.push(("version", &version_doc));
        outer.push(("manifest", manifest.as_bytes()));
        outer.push(("header.tar", &header_tar));
        if payload_type.is_some() {
            outer.push(("data/0000.tar", &data_tar));
        }
        tar_with(&outer)
    }

    fn install_module(dir: &std::path::Path, body: &str) {
        fs::create_dir_all(dir).unwrap();
        let path = dir.join("test-module");
        fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    }

    fn recording_module(reboot: &str, rollback: &str) -> String {
        format!(
            r#"echo "$1" >> "$2/../invocations"
case "$1" in
  NeedsArtifactReboot) echo {};;
  SupportsRollback) echo {};;
esac"#,
            reboot, rollback
        )
    }

    struct Setup {
        _dir: TempDir,
        ctx: MenderContext,
        artifact_path: PathBuf,
    }

    fn setup(artifact_name: &str, module_body: &str) -> Setup {
        let dir = TempDir::new().unwrap();
        let mut config = MenderConfig::default();
        config.set_data_store_dir(dir.path().join("data"));
        config.modules_path = dir.path().join("modules");
        config.rootfs_scripts_path = dir.path().join("rootfs-scripts");

        fs::create_dir_all(&config.data_store_dir).unwrap();
        fs::write(&config.device_type_file, "device_type=test-device\n").unwrap();
        install_module(&config.modules_path, module_body);

        let artifact_path = dir.path().join("release.mender");
        fs::write(&artifact_path, build_artifact(artifact_name, Some("test-module"))).unwrap();

        Setup {
            ctx: MenderContext::initialize(config).unwrap(),
            artifact_path,
            _dir: dir,
        }
    }

    fn invocations(ctx: &MenderContext) -> Vec<String> {
        fs::read_to_string(ctx.config.modules_work_path.join("invocations"))
            .map(|s| s.lines().map(str::to_string).collect())
            .unwrap_or_default()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn install_then_commit() {
        let mut s = setup("standalone-1", &recording_module("No", "Yes"));

        let outcome = install(&mut s.ctx, s.artifact_path.to_str().unwrap())
            .await
            .unwrap();
        assert_eq!(outcome, InstallOutcome::AwaitingCommit);

        // Nothing committed yet, but progress is persisted.
        assert!(s.ctx.store.read(constants::ARTIFACT_NAME_KEY).is_err());
        assert!(s.ctx.store.read(constants::STANDALONE_STATE_KEY).is_ok());
        // The payload was staged for the passive module.
        assert_eq!(
            fs::read(s.ctx.config.modules_work_path.join("0000/files/payload.dat")).unwrap(),
            b"standalone payload"
        );

        commit(&mut s.ctx).await.unwrap();
        assert_eq!(
            s.ctx.store.read(constants::ARTIFACT_NAME_KEY).unwrap(),
            b"standalone-1"
        );
        assert!(s.ctx.store.read(constants::STANDALONE_STATE_KEY).is_err());

        assert_eq!(
            invocations(&s.ctx),
            [
                "Download",
                "ArtifactInstall",
                "NeedsArtifactReboot",
                "ArtifactCommit",
                "Cleanup"
            ]
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn install_then_rollback_leaves_provides_untouched() {
        let mut s = setup("standalone-2", &recording_module("No", "Yes"));
        s.ctx
            .store
            .write(constants::ARTIFACT_NAME_KEY, b"previous")
            .unwrap();

        install(&mut s.ctx, s.artifact_path.to_str().unwrap())
            .await
            .unwrap();
        rollback(&mut s.ctx).await.unwrap();

        assert_eq!(
            s.ctx.store.read(constants::ARTIFACT_NAME_KEY).unwrap(),
            b"previous"
        );
        assert!(s.ctx.store.read(constants::STANDALONE_STATE_KEY).is_err());
        assert!(invocations(&s.ctx)
            .iter()
            .any(|i| i == "ArtifactRollback"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn rollback_without_support_is_refused() {
        let mut s = setup("standalone-3", &recording_module("No", "No"));
        install(&mut s.ctx, s.artifact_path.to_str().unwrap())
            .await
            .unwrap();
        let err = rollback(&mut s.ctx).await.unwrap_err();
        assert!(matches!(err, Error::NoRollbackSupport));
        // The pending state survives for a later commit.
        assert!(s.ctx.store.read(constants::STANDALONE_STATE_KEY).is_ok());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn reboot_required_is_surfaced() {
        let mut s = setup("standalone-4", &recording_module("Yes", "Yes"));
        let outcome = install(&mut s.ctx, s.artifact_path.to_str().unwrap())
            .await
            .unwrap();
        assert_eq!(outcome, InstallOutcome::RebootRequired);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn commit_without_pending_update_is_exit_code_2() {
        let mut s = setup("standalone-5", "exit 0");
        let err = commit(&mut s.ctx).await.unwrap_err();
        assert!(matches!(err, Error::NoUpdateInProgress));
        assert_eq!(crate::error::exit_status(&err), 2);

        let err = rollback(&mut s.ctx).await.unwrap_err();
        assert!(matches!(err, Error::NoUpdateInProgress));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn empty_payload_artifact_commits_immediately() {
        let mut s = setup("ignored", "exit 0");
        let path = s._dir.path().join("bootstrap.mender");
        fs::write(&path, build_artifact("bootstrap-1", None)).unwrap();

        let outcome = install(&mut s.ctx, path.to_str().unwrap()).await.unwrap();
        assert_eq!(outcome, InstallOutcome::Committed);
        assert_eq!(
            s.ctx.store.read(constants::ARTIFACT_NAME_KEY).unwrap(),
            b"bootstrap-1"
        );
        assert!(s.ctx.store.read(constants::STANDALONE_STATE_KEY).is_err());
        // No module involvement for an empty payload.
        assert!(invocations(&s.ctx).is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn failed_install_cleans_up_and_reports() {
        let body = r#"echo "$1" >> "$2/../invocations"
case "$1" in ArtifactInstall) exit 1;; esac"#;
        let mut s = setup("standalone-6", body);
        let err = install(&mut s.ctx, s.artifact_path.to_str().unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Module { .. }));
        assert!(s.ctx.store.read(constants::STANDALONE_STATE_KEY).is_err());
        let calls = invocations(&s.ctx);
        assert!(calls.iter().any(|c| c == "ArtifactFailure"));
        assert!(calls.iter().any(|c| c == "Cleanup"));
        // The work tree is gone.
        assert!(!s.ctx.config.modules_work_path.join("0000").exists());
    }
}
