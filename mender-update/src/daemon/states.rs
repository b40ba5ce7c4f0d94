//! State behavior. Each state's `enter` does its work and posts exactly
//! one event back into the machine (Idle posts none and leaves the daemon
//! waiting on its poll timers). Recoverable states checkpoint `StateData`
//! on entry, before side effects, so a crash resumes rather than repeats.

use crate::context::BROKEN_ARTIFACT_NAME_SUFFIX;
use crate::daemon::context::{DaemonContext, DeploymentContext};
use crate::daemon::state_machine::{State, StateEvent};
use crate::db::{self, state_names};
use crate::deployment_log::DeploymentLog;
use crate::deployments::{self, DeploymentStatus};
use crate::error::{self, Error, Result};
use crate::inventory;
use log::{error, info, warn};
use mender_artifact::{Artifact, ParserConfig};
use retry_download::RetrySettings;
use snafu::ResultExt;
use state_scripts::{Action, OnError};
use std::path::PathBuf;
use std::time::Duration;
use update_module::{RebootAction, UpdateModule};

/// Runs the state's behavior and folds every failure into the event the
/// transition table understands. The loop cap and a server-side abort pass
/// through as errors so the daemon loop can force cleanup directly; an
/// invariant violation passes through and takes the daemon down.
pub async fn enter(state: State, d: &mut DaemonContext) -> Result<Option<StateEvent>> {
    info!("Entering state {}", state);
    match dispatch(state, d).await {
        Ok(event) => Ok(event),
        Err(
            e @ (Error::StateDataStoreCountExceeded
            | Error::DeploymentAborted
            | Error::Programming { .. }),
        ) => Err(e),
        Err(e) => {
            error!("State {} failed: {}", state, e);
            if matches!(
                state,
                State::UpdateRollback
                    | State::UpdateRollbackReboot
                    | State::UpdateVerifyRollbackReboot
            ) {
                if let Some(dep) = d.deployment.as_mut() {
                    dep.state_data.update_info.all_rollbacks_successful = false;
                }
            }
            if let Some(dep) = d.deployment.as_mut() {
                dep.failed = true;
            }
            if let Some(script_state) = error_script_state(state) {
                if let Err(script_err) =
                    run_scripts(d, script_state, Action::Error, OnError::Ignore).await
                {
                    warn!("Error scripts failed: {}", script_err);
                }
            }
            Ok(Some(StateEvent::Failure))
        }
    }
}

async fn dispatch(state: State, d: &mut DaemonContext) -> Result<Option<StateEvent>> {
    match state {
        State::Idle => Ok(None),
        State::SubmitInventory => submit_inventory(d).await.map(Some),
        State::PollForDeployment => poll_for_deployment(d).await.map(Some),
        State::UpdateDownload => update_download(d).await.map(Some),
        State::UpdateInstall => update_install(d).await.map(Some),
        State::UpdateCheckReboot => update_check_reboot(d).map(Some),
        State::UpdateReboot => update_reboot(d).await.map(Some),
        State::UpdateVerifyReboot => update_verify_reboot(d).await.map(Some),
        State::UpdateCommit => update_commit(d).await.map(Some),
        State::UpdateCheckRollback => update_check_rollback(d).map(Some),
        State::UpdateRollback => update_rollback(d).await.map(Some),
        State::UpdateCheckRollbackReboot => update_check_rollback_reboot(d).map(Some),
        State::UpdateRollbackReboot => update_rollback_reboot(d).await.map(Some),
        State::UpdateVerifyRollbackReboot => update_verify_rollback_reboot(d).await.map(Some),
        State::UpdateFailure => update_failure(d).await.map(Some),
        State::UpdateCleanup => update_cleanup(d).await.map(Some),
    }
}

/// Which script state gets the `_Error` hooks when a machine state fails.
fn error_script_state(state: State) -> Option<state_scripts::State> {
    match state {
        State::UpdateDownload => Some(state_scripts::State::Download),
        State::UpdateInstall => Some(state_scripts::State::ArtifactInstall),
        State::UpdateReboot | State::UpdateVerifyReboot => {
            Some(state_scripts::State::ArtifactReboot)
        }
        State::UpdateCommit => Some(state_scripts::State::ArtifactCommit),
        State::UpdateRollback => Some(state_scripts::State::ArtifactRollback),
        State::UpdateRollbackReboot | State::UpdateVerifyRollbackReboot => {
            Some(state_scripts::State::ArtifactRollbackReboot)
        }
        _ => None,
    }
}

/// Runs state scripts, honoring the retry exit code: the scripts are
/// reattempted after the configured interval until the retry budget runs
/// out.
async fn run_scripts(
    d: &DaemonContext,
    state: state_scripts::State,
    action: Action,
    on_error: OnError,
) -> Result<()> {
    let deadline = tokio::time::Instant::now() + d.ctx.config.state_script_retry_timeout;
    loop {
        match d.scripts.run(state, action, on_error).await {
            Err(state_scripts::Error::RetryExitCode { .. })
                if tokio::time::Instant::now() < deadline =>
            {
                info!(
                    "State script for {}_{} requested retry; waiting {:?}",
                    state, action, d.ctx.config.state_script_retry_interval
                );
                tokio::time::sleep(d.ctx.config.state_script_retry_interval).await;
            }
            other => return other.map_err(Into::into),
        }
    }
}

fn deployment_id(d: &DaemonContext) -> Result<String> {
    d.deployment
        .as_ref()
        .map(|dep| dep.id().to_string())
        .ok_or_else(|| Error::Programming {
            reason: "deployment state entered with no deployment context".to_string(),
        })
}

/// Checkpoints the record under the given recoverable state name.
fn checkpoint(d: &mut DaemonContext, state_name: &str) -> Result<()> {
    let dep = d.deployment.as_mut().ok_or_else(|| Error::Programming {
        reason: "checkpoint without a deployment".to_string(),
    })?;
    dep.state_data.state = state_name.to_string();
    db::save_state_data(&mut d.ctx.store, &mut dep.state_data)
}

async fn push_status(d: &DaemonContext, status: DeploymentStatus) -> Result<()> {
    let id = deployment_id(d)?;
    deployments::push_status(&d.api, &id, status, "").await
}

async fn submit_inventory(d: &mut DaemonContext) -> Result<StateEvent> {
    let device_type = d.ctx.device_type()?;
    let data = inventory::gather(&d.ctx.config.inventory_generators_dir, &device_type).await?;
    let payload = inventory::payload(&data);
    let digest = inventory::digest(&payload);

    if d.last_inventory_digest == Some(digest) {
        info!("Inventory unchanged since last submission, skipping");
        return Ok(StateEvent::Success);
    }
    inventory::push(&d.api, &payload).await?;
    d.last_inventory_digest = Some(digest);
    Ok(StateEvent::Success)
}

async fn poll_for_deployment(d: &mut DaemonContext) -> Result<StateEvent> {
    let device_type = d.ctx.device_type()?;
    let provides = d.ctx.load_provides()?;

    let response = match deployments::check_new_deployments(&d.api, &device_type, &provides).await?
    {
        Some(response) => response,
        None => {
            info!("No update available");
            return Ok(StateEvent::NothingToDo);
        }
    };

    let state_data = deployments::state_data_from_response(&response)?;
    info!("Deployment {} discovered", state_data.update_info.id);
    let log = DeploymentLog::begin(
        &d.ctx.config.update_log_path,
        &state_data.update_info.id,
    )
    .map_err(|e| {
        warn!("Could not open deployment log: {}", e);
        e
    })
    .ok();
    d.deployment = Some(DeploymentContext::new(state_data, log));
    Ok(StateEvent::Success)
}

/// What the downloader tells the payload pump to do once the module's
/// behavior is known.
enum PumpDecision {
    Stream(update_module::download::PumpHandle, PathBuf),
    Abort,
}

async fn update_download(d: &mut DaemonContext) -> Result<StateEvent> {
    checkpoint(d, state_names::DOWNLOAD)?;
    push_status(d, DeploymentStatus::Downloading).await?;
    run_scripts(d, state_scripts::State::Download, Action::Enter, OnError::Fail).await?;

    let uri = d
        .deployment
        .as_ref()
        .expect("checkpoint verified the deployment")
        .state_data
        .update_info
        .artifact
        .source
        .uri
        .clone();

    // The artifact is parsed on a blocking thread, fed from the resumable
    // download through a byte channel, while this side supervises the
    // update module.
    let download = retry_download::Download::start(
        d.api.plain_http(),
        uri,
        RetrySettings::default(),
    )
    .await?;
    let (chunk_tx, chunk_reader) = retry_download::reader::channel();
    let feeder = tokio::spawn(feed_chunks(download, chunk_tx));

    let (artifact_tx, mut artifact_rx) = tokio::sync::oneshot::channel::<Artifact>();
    let (decision_tx, decision_rx) = std::sync::mpsc::channel::<PumpDecision>();
    let parser_config = ParserConfig {
        verify_keys: d.ctx.config.verify_keys()?,
        artifact_scripts_path: d.ctx.config.artifact_scripts_path.clone(),
        artifact_scripts_version: 3,
    };

    let mut parse_task = tokio::task::spawn_blocking(move || -> Result<Artifact> {
        let (artifact, _) = mender_artifact::parse::<_, _, Error, _>(
            chunk_reader,
            &parser_config,
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
    });

    // Either the payload callback hands us the parsed header, or the parse
    // finishes outright (an empty-payload artifact, or an error before the
    // payload section).
    let artifact = tokio::select! {
        received = &mut artifact_rx => match received {
            Ok(artifact) => artifact,
            Err(_) => {
                let artifact = join_parse(parse_task).await?;
                record_artifact(d, &artifact)?;
                return finish_download(d).await;
            }
        },
        result = &mut parse_task => {
            let artifact = result.map_err(join_error)??;
            feeder.abort();
            record_artifact(d, &artifact)?;
            return finish_download(d).await;
        }
    };

    // Header in hand: validate, prepare the module, and let the payload
    // through.
    let module = match prepare_module(d, &artifact) {
        Ok(Some(module)) => module,
        Ok(None) => {
            // Already installed; stop the stream and go report as much.
            let _ = decision_tx.send(PumpDecision::Abort);
            let _ = join_parse(parse_task).await;
            feeder.abort();
            return Ok(StateEvent::Failure);
        }
        Err(e) => {
            let _ = decision_tx.send(PumpDecision::Abort);
            let _ = join_parse(parse_task).await;
            feeder.abort();
            return Err(e);
        }
    };

    let (driver, pump) = update_module::download::handshake();
    decision_tx
        .send(PumpDecision::Stream(pump, module.work_dir().to_path_buf()))
        .map_err(|_| Error::DownloadAborted)?;

    let download_result = module.download(driver).await;
    let parse_result = join_parse(parse_task).await;
    feeder.abort();
    parse_result?;
    download_result?;

    if let Some(dep) = d.deployment.as_mut() {
        dep.module = Some(module);
    }
    finish_download(d).await
}

/// Records the artifact's (signed, authoritative) metadata in the
/// persisted state.
fn record_artifact(d: &mut DaemonContext, artifact: &Artifact) -> Result<()> {
    let dep = d.deployment.as_mut().ok_or_else(|| Error::Programming {
        reason: "download finished without a deployment".to_string(),
    })?;
    dep.fill_from_artifact(artifact);
    dep.state_data.state = state_names::DOWNLOAD.to_string();
    db::save_state_data(&mut d.ctx.store, &mut dep.state_data)
}

/// Wraps up a successful download with the leave hooks.
async fn finish_download(d: &mut DaemonContext) -> Result<StateEvent> {
    run_scripts(d, state_scripts::State::Download, Action::Leave, OnError::Fail).await?;
    Ok(StateEvent::Success)
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

fn join_error(e: tokio::task::JoinError) -> Error {
    Error::Programming {
        reason: format!("artifact parser task failed: {}", e),
    }
}

async fn join_parse(task: tokio::task::JoinHandle<Result<Artifact>>) -> Result<Artifact> {
    task.await.map_err(join_error)?
}

/// Depends/applicability checks plus module setup, run between parsing the
/// header and streaming the payload. `Ok(None)` means the artifact is
/// already installed and nothing further should happen.
fn prepare_module(d: &mut DaemonContext, artifact: &Artifact) -> Result<Option<UpdateModule>> {
    let device_type = d.ctx.device_type()?;
    let current = d.ctx.load_provides()?;

    if current.get("artifact_name").map(String::as_str) == Some(artifact.artifact_name()) {
        info!(
            "Artifact '{}' is already installed",
            artifact.artifact_name()
        );
        if let Some(dep) = d.deployment.as_mut() {
            dep.already_installed = true;
        }
        return Ok(None);
    }

    crate::context::check_artifact_depends(artifact, &device_type, &current)?;

    let payload_type = artifact
        .payload_type()
        .ok_or_else(|| Error::Programming {
            reason: "prepare_module called for an empty payload".to_string(),
        })?;
    let module = UpdateModule::new(
        &d.ctx.config.modules_path,
        &d.ctx.config.modules_work_path,
        payload_type,
        d.ctx.config.module_timeout,
    );
    module.check_module_exists()?;

    {
        let dep = d.deployment.as_mut().ok_or_else(|| Error::Programming {
            reason: "prepare_module without a deployment".to_string(),
        })?;
        dep.fill_from_artifact(artifact);
        let tree = dep.file_tree_data(&current, &device_type, artifact);
        module.prepare_file_tree(&tree)?;
        db::save_state_data(&mut d.ctx.store, &mut dep.state_data)?;
    }

    Ok(Some(module))
}

async fn update_install(d: &mut DaemonContext) -> Result<StateEvent> {
    checkpoint(d, state_names::ARTIFACT_INSTALL)?;
    push_status(d, DeploymentStatus::Installing).await?;
    run_scripts(
        d,
        state_scripts::State::ArtifactInstall,
        Action::Enter,
        OnError::Fail,
    )
    .await?;

    let empty = d
        .deployment
        .as_ref()
        .map(|dep| dep.empty_payload)
        .unwrap_or(false);
    let (reboot, rollback) = if empty {
        (RebootAction::No, false)
    } else {
        let module = active_module(d)?;
        module.artifact_install().await?;
        (module.needs_reboot().await?, module.supports_rollback().await?)
    };

    {
        let dep = d.deployment.as_mut().expect("checked above");
        dep.state_data.update_info.reboot_requested =
            vec![db::needs_reboot_to_db_string(reboot).to_string()];
        dep.state_data.update_info.supports_rollback =
            db::supports_rollback_to_db_string(rollback).to_string();
        db::save_state_data(&mut d.ctx.store, &mut dep.state_data)?;
    }

    run_scripts(
        d,
        state_scripts::State::ArtifactInstall,
        Action::Leave,
        OnError::Fail,
    )
    .await?;
    Ok(StateEvent::Success)
}

fn active_module(d: &DaemonContext) -> Result<&UpdateModule> {
    d.deployment
        .as_ref()
        .and_then(|dep| dep.module.as_ref())
        .ok_or_else(|| Error::Programming {
            reason: "module state entered with no update module".to_string(),
        })
}

fn requested_reboot(d: &DaemonContext) -> Result<RebootAction> {
    let dep = d.deployment.as_ref().ok_or_else(|| Error::Programming {
        reason: "reboot check without a deployment".to_string(),
    })?;
    let value = dep
        .state_data
        .update_info
        .reboot_requested
        .first()
        .map(String::as_str)
        .unwrap_or(db::REBOOT_TYPE_NONE);
    db::db_string_to_needs_reboot(value)
}

fn update_check_reboot(d: &mut DaemonContext) -> Result<StateEvent> {
    match requested_reboot(d)? {
        RebootAction::No => Ok(StateEvent::NothingToDo),
        RebootAction::Yes | RebootAction::Automatic => Ok(StateEvent::Success),
    }
}

async fn update_reboot(d: &mut DaemonContext) -> Result<StateEvent> {
    checkpoint(d, state_names::ARTIFACT_REBOOT)?;
    push_status(d, DeploymentStatus::Rebooting).await?;
    run_scripts(
        d,
        state_scripts::State::ArtifactReboot,
        Action::Enter,
        OnError::Fail,
    )
    .await?;
    if let Some(dep) = d.deployment.as_mut() {
        dep.rebooted = true;
    }

    match requested_reboot(d)? {
        RebootAction::Yes => active_module(d)?.artifact_reboot().await?,
        RebootAction::Automatic => system_reboot().await?,
        RebootAction::No => {
            return Err(Error::Programming {
                reason: "reboot state entered with no reboot requested".to_string(),
            })
        }
    }

    // If we get here the device did not actually restart (e.g. a container
    // module); leave the verify breadcrumb and carry on in-process.
    checkpoint(d, state_names::ARTIFACT_VERIFY_REBOOT)?;
    run_scripts(
        d,
        state_scripts::State::ArtifactReboot,
        Action::Leave,
        OnError::Fail,
    )
    .await?;
    Ok(StateEvent::Success)
}

/// Invokes the system `reboot` and waits to be killed by it. The grace
/// period elapsing means the reboot never happened, which routes into the
/// rollback path.
async fn system_reboot() -> Result<()> {
    info!("Calling `reboot` command and waiting for system to restart");
    let mut child = tokio::process::Command::new("reboot")
        .spawn()
        .context(error::IoSnafu { path: "reboot" })?;
    if let Err(e) = child.wait().await {
        warn!("`reboot` command returned error: {}", e);
    }
    tokio::time::sleep(Duration::from_secs(600)).await;
    error::RebootFailedSnafu.fail()
}

async fn update_verify_reboot(d: &mut DaemonContext) -> Result<StateEvent> {
    checkpoint(d, state_names::ARTIFACT_VERIFY_REBOOT)?;
    active_module(d)?.artifact_verify_reboot().await?;
    Ok(StateEvent::Success)
}

async fn update_commit(d: &mut DaemonContext) -> Result<StateEvent> {
    let resumed = d
        .deployment
        .as_ref()
        .map(|dep| dep.resumed_after_commit)
        .unwrap_or(false);

    if !resumed {
        checkpoint(d, state_names::ARTIFACT_COMMIT)?;
        run_scripts(
            d,
            state_scripts::State::ArtifactCommit,
            Action::Enter,
            OnError::Fail,
        )
        .await?;

        let empty = d
            .deployment
            .as_ref()
            .map(|dep| dep.empty_payload)
            .unwrap_or(false);
        if !empty {
            active_module(d)?.artifact_commit().await?;
        }

        let (provides, clears) = {
            let dep = d.deployment.as_ref().expect("checkpoint verified");
            (
                dep.new_provides(),
                dep.state_data
                    .update_info
                    .artifact
                    .clears_artifact_provides
                    .clone(),
            )
        };
        d.ctx.commit_artifact_data(&provides, Some(&clears), |txn| {
            txn.remove(constants::STATE_DATA_KEY)?;
            txn.remove(constants::STATE_DATA_KEY_UNCOMMITTED)?;
            Ok(())
        })?;

        {
            let dep = d.deployment.as_mut().expect("checkpoint verified");
            dep.committed = true;
            // The schema migration, if any, completed with the commit.
            dep.state_data.update_info.has_db_schema_update = false;
        }
        checkpoint(d, state_names::AFTER_ARTIFACT_COMMIT)?;
    }

    run_scripts(
        d,
        state_scripts::State::ArtifactCommit,
        Action::Leave,
        OnError::Fail,
    )
    .await?;
    Ok(StateEvent::Success)
}

fn update_check_rollback(d: &mut DaemonContext) -> Result<StateEvent> {
    let dep = d.deployment.as_ref().ok_or_else(|| Error::Programming {
        reason: "rollback check without a deployment".to_string(),
    })?;
    if dep.committed || dep.empty_payload {
        return Ok(StateEvent::NothingToDo);
    }
    match dep.state_data.update_info.supports_rollback.as_str() {
        "" => Ok(StateEvent::NothingToDo),
        value => {
            if db::db_string_to_supports_rollback(value)? {
                Ok(StateEvent::Success)
            } else {
                Ok(StateEvent::NothingToDo)
            }
        }
    }
}

async fn update_rollback(d: &mut DaemonContext) -> Result<StateEvent> {
    checkpoint(d, state_names::ARTIFACT_ROLLBACK)?;
    run_scripts(
        d,
        state_scripts::State::ArtifactRollback,
        Action::Enter,
        OnError::Fail,
    )
    .await?;
    active_module(d)?.artifact_rollback().await?;
    run_scripts(
        d,
        state_scripts::State::ArtifactRollback,
        Action::Leave,
        OnError::Fail,
    )
    .await?;
    Ok(StateEvent::Success)
}

fn update_check_rollback_reboot(d: &mut DaemonContext) -> Result<StateEvent> {
    let rebooted = d
        .deployment
        .as_ref()
        .map(|dep| dep.rebooted)
        .unwrap_or(false);
    if rebooted {
        Ok(StateEvent::Success)
    } else {
        Ok(StateEvent::NothingToDo)
    }
}

async fn update_rollback_reboot(d: &mut DaemonContext) -> Result<StateEvent> {
    checkpoint(d, state_names::ARTIFACT_ROLLBACK_REBOOT)?;
    match requested_reboot(d)? {
        RebootAction::Automatic => system_reboot().await?,
        _ => active_module(d)?.artifact_rollback_reboot().await?,
    }
    Ok(StateEvent::Success)
}

async fn update_verify_rollback_reboot(d: &mut DaemonContext) -> Result<StateEvent> {
    checkpoint(d, state_names::ARTIFACT_VERIFY_ROLLBACK_REBOOT)?;
    active_module(d)?.artifact_verify_rollback_reboot().await?;
    Ok(StateEvent::Success)
}

async fn update_failure(d: &mut DaemonContext) -> Result<StateEvent> {
    checkpoint(d, state_names::ARTIFACT_FAILURE)?;
    if let Err(e) = run_scripts(
        d,
        state_scripts::State::ArtifactFailure,
        Action::Enter,
        OnError::Ignore,
    )
    .await
    {
        warn!("ArtifactFailure scripts reported errors: {}", e);
    }

    let has_module = d
        .deployment
        .as_ref()
        .map(|dep| dep.module.is_some() && !dep.empty_payload)
        .unwrap_or(false);
    if has_module {
        if let Err(e) = active_module(d)?.artifact_failure().await {
            warn!("ArtifactFailure module call failed: {}", e);
        }
    }

    if let Some(dep) = d.deployment.as_mut() {
        dep.failed = true;
    }
    Ok(StateEvent::Success)
}

async fn update_cleanup(d: &mut DaemonContext) -> Result<StateEvent> {
    if let Err(e) = checkpoint(d, state_names::CLEANUP) {
        // Cleanup proceeds regardless; worst case we clean up again after
        // the next restart.
        warn!("Could not checkpoint cleanup state: {}", e);
    }

    if let Ok(module) = active_module(d) {
        if let Err(e) = module.cleanup().await {
            warn!("Update module cleanup failed: {}", e);
        }
    }

    report_final_status(d).await;
    mark_broken_artifact(d);

    if let Err(e) = db::remove_state_data(&mut d.ctx.store) {
        warn!("Could not remove state data: {}", e);
    }

    if let Some(mut dep) = d.deployment.take() {
        if let Some(log) = dep.log.take() {
            log.finish();
        }
    }
    Ok(StateEvent::Success)
}

/// Pushes the terminal deployment status (and the log on failure),
/// retrying per the retry-poll settings with a persisted breadcrumb
/// between attempts.
async fn report_final_status(d: &mut DaemonContext) {
    let Some(dep) = d.deployment.as_ref() else {
        return;
    };
    if dep.aborted {
        info!("Deployment was aborted; skipping final status report");
        return;
    }

    let status = if dep.already_installed {
        DeploymentStatus::AlreadyInstalled
    } else if dep.failed {
        DeploymentStatus::Failure
    } else {
        DeploymentStatus::Success
    };
    let substate = if dep.loop_detected { "loop" } else { "" };
    let id = dep.id().to_string();
    let log_path = dep.log.as_ref().map(|log| log.path().to_path_buf());

    let attempts = d.ctx.config.retry_poll_count.max(1);
    for attempt in 0..attempts {
        let result = deployments::push_status(&d.api, &id, status, substate).await;
        match result {
            Ok(()) => {
                if status == DeploymentStatus::Failure {
                    if let Some(path) = &log_path {
                        if let Err(e) = deployments::push_logs(&d.api, &id, path).await {
                            warn!("Could not upload deployment log: {}", e);
                        }
                    }
                }
                return;
            }
            Err(Error::DeploymentAborted) => {
                info!("Deployment aborted while reporting final status");
                return;
            }
            Err(e) => {
                warn!(
                    "Could not report final deployment status (attempt {}): {}",
                    attempt + 1,
                    e
                );
                if attempt + 1 == attempts {
                    return;
                }
                if let Err(e) = checkpoint(d, state_names::STATUS_REPORT_RETRY) {
                    warn!("Could not persist status report retry state: {}", e);
                }
                tokio::time::sleep(d.ctx.config.retry_poll_interval).await;
            }
        }
    }
}

/// An update that ended in an unknown state taints the stored artifact
/// name so the fleet can see it.
fn mark_broken_artifact(d: &mut DaemonContext) {
    let Some(dep) = d.deployment.as_ref() else {
        return;
    };
    let rollback_failed =
        dep.failed && !dep.state_data.update_info.all_rollbacks_successful;
    let post_commit_loop = dep.loop_detected && dep.committed;
    if !rollback_failed && !post_commit_loop {
        return;
    }

    let name = if dep.committed {
        match d.ctx.store.read(constants::ARTIFACT_NAME_KEY) {
            Ok(raw) => String::from_utf8_lossy(&raw).to_string(),
            Err(_) => dep.state_data.update_info.artifact.artifact_name.clone(),
        }
    } else {
        dep.state_data.update_info.artifact.artifact_name.clone()
    };
    if name.is_empty() || name.ends_with(BROKEN_ARTIFACT_NAME_SUFFIX) {
        return;
    }
    let broken = format!("{}{}", name, BROKEN_ARTIFACT_NAME_SUFFIX);
    warn!("Marking artifact as '{}'", broken);
    if let Err(e) = d
        .ctx
        .store
        .write(constants::ARTIFACT_NAME_KEY, broken.as_bytes())
    {
        warn!("Could not mark broken artifact name: {}", e);
    }
}
