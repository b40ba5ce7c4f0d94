//! The update daemon: one state machine attached to a timer-driven event
//! loop, with crash recovery from the persisted deployment state.

pub mod context;
pub mod state_machine;
pub mod states;

use crate::context::MenderContext;
use crate::db::{self, state_names, LoadedStateData};
use crate::deployment_log::DeploymentLog;
use crate::error::{Error, Result};
use context::{DaemonContext, DeploymentContext};
use log::{error, info, warn};
use state_machine::{State, StateEvent, StateMachine};

pub async fn run(ctx: MenderContext) -> Result<()> {
    let update_poll = ctx.config.update_poll_interval;
    let inventory_poll = ctx.config.inventory_poll_interval;
    let mut d = DaemonContext::new(ctx)?;

    let mut machine = StateMachine::new(State::Idle);
    let mut startup: Option<State> = None;

    // Spontaneous-reboot recovery: a persisted record means a deployment
    // was in flight; resume it instead of going idle.
    match db::load_state_data(&mut d.ctx.store)? {
        Some(loaded) => {
            let state = resume(&mut d, loaded)?;
            info!("Resuming interrupted deployment in state {}", state);
            machine = StateMachine::new(state);
            startup = Some(state);
        }
        None => {
            // One round of each on startup.
            machine.post(StateEvent::InventoryPollingTriggered);
            machine.post(StateEvent::DeploymentPollingTriggered);
        }
    }

    let start = tokio::time::Instant::now();
    let mut update_interval = tokio::time::interval_at(start + update_poll, update_poll);
    let mut inventory_interval =
        tokio::time::interval_at(start + inventory_poll, inventory_poll);
    let mut sigterm =
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .map_err(|e| Error::Runtime { source: e })?;
    let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())
        .map_err(|e| Error::Runtime { source: e })?;

    loop {
        if let Some(state) = startup.take() {
            run_state(&mut machine, &mut d, state).await?;
        }
        while let Some(state) = machine.step()? {
            run_state(&mut machine, &mut d, state).await?;
        }

        tokio::select! {
            _ = update_interval.tick() => machine.post(StateEvent::DeploymentPollingTriggered),
            _ = inventory_interval.tick() => machine.post(StateEvent::InventoryPollingTriggered),
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down");
                return Ok(());
            }
            _ = sigint.recv() => {
                info!("Received SIGINT, shutting down");
                return Ok(());
            }
        }
    }
}

/// Runs one state's behavior, routing the loop cap and server-side aborts
/// straight into cleanup.
async fn run_state(
    machine: &mut StateMachine,
    d: &mut DaemonContext,
    state: State,
) -> Result<()> {
    let mut state = state;
    loop {
        match states::enter(state, d).await {
            Ok(Some(event)) => {
                machine.post(event);
                return Ok(());
            }
            Ok(None) => return Ok(()),
            Err(Error::StateDataStoreCountExceeded) => {
                error!("State loop detected, forcing cleanup");
                if let Some(dep) = d.deployment.as_mut() {
                    dep.failed = true;
                    dep.loop_detected = true;
                }
                machine.force(State::UpdateCleanup);
                state = State::UpdateCleanup;
            }
            Err(Error::DeploymentAborted) => {
                warn!("Deployment aborted by the server, cleaning up");
                if let Some(dep) = d.deployment.as_mut() {
                    dep.failed = true;
                    dep.aborted = true;
                }
                machine.force(State::UpdateCleanup);
                state = State::UpdateCleanup;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Maps a persisted recoverable state onto the state the machine resumes
/// in, rebuilding the deployment context around it.
fn resume(d: &mut DaemonContext, loaded: LoadedStateData) -> Result<State> {
    let log = DeploymentLog::begin(&d.ctx.config.update_log_path, &loaded.data.update_info.id)
        .map_err(|e| {
            warn!("Could not reopen deployment log: {}", e);
            e
        })
        .ok();

    let mut dep = DeploymentContext::new(loaded.data, log);
    dep.module = dep.make_module(&d.ctx.config);
    dep.empty_payload = dep
        .state_data
        .update_info
        .artifact
        .payload_types
        .first()
        .map(|t| t.is_empty())
        .unwrap_or(true);

    let state = match dep.state_data.state.as_str() {
        // A download can't be resumed mid-stream; the deployment failed.
        state_names::DOWNLOAD => {
            dep.failed = true;
            State::UpdateCleanup
        }
        // A half-done install or commit is treated as failed; the module
        // gets a chance to roll back.
        state_names::ARTIFACT_INSTALL => {
            dep.failed = true;
            State::UpdateCheckRollback
        }
        state_names::ARTIFACT_COMMIT => {
            dep.failed = true;
            State::UpdateCheckRollback
        }
        // The expected path after a real reboot.
        state_names::ARTIFACT_REBOOT | state_names::ARTIFACT_VERIFY_REBOOT => {
            dep.rebooted = true;
            State::UpdateVerifyReboot
        }
        // Commit went through; only the leave hooks and cleanup remain.
        state_names::AFTER_ARTIFACT_COMMIT => {
            dep.committed = true;
            dep.resumed_after_commit = true;
            State::UpdateCommit
        }
        state_names::ARTIFACT_ROLLBACK => {
            dep.failed = true;
            State::UpdateRollback
        }
        state_names::ARTIFACT_ROLLBACK_REBOOT
        | state_names::ARTIFACT_VERIFY_ROLLBACK_REBOOT => {
            dep.failed = true;
            dep.rebooted = true;
            State::UpdateVerifyRollbackReboot
        }
        state_names::ARTIFACT_FAILURE => {
            dep.failed = true;
            State::UpdateFailure
        }
        state_names::CLEANUP | state_names::STATUS_REPORT_RETRY => {
            // Whether the update committed decides the reported status.
            let committed = d
                .ctx
                .store
                .read(constants::ARTIFACT_NAME_KEY)
                .map(|raw| {
                    String::from_utf8_lossy(&raw)
                        == dep.state_data.update_info.artifact.artifact_name
                })
                .unwrap_or(false);
            dep.committed = committed;
            dep.failed = !committed;
            State::UpdateCleanup
        }
        other => {
            return Err(Error::DatabaseValue {
                reason: format!("unknown persisted state '{}'", other),
            })
        }
    };

    if loaded.exceeded {
        error!("State data store count exceeded while resuming; cleaning up");
        dep.failed = true;
        dep.loop_detected = true;
        d.deployment = Some(dep);
        return Ok(State::UpdateCleanup);
    }

    d.deployment = Some(dep);
    Ok(state)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::MenderConfig;
    use crate::db::{
        save_state_data, ArtifactData, ArtifactSource, StateData, UpdateInfo,
        MAX_STATE_DATA_STORE_COUNT, REBOOT_TYPE_NONE, ROLLBACK_SUPPORTED,
    };
    use sha2::{Digest, Sha256};
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;
    use std::sync::Arc;
    use tempfile::TempDir;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, UnixListener};
    use tokio::sync::Mutex;

    /// A request the fake backend saw: method, path, body.
    type Seen = Arc<Mutex<Vec<(String, String, String)>>>;

    /// Minimal HTTP/1.1 backend: answers the deployments API and serves
    /// the artifact bytes.
    async fn fake_backend(
        listener: TcpListener,
        deployment: Option<serde_json::Value>,
        artifact: Vec<u8>,
        seen: Seen,
    ) {
        loop {
            let (mut stream, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => return,
            };
            let deployment = deployment.clone();
            let artifact = artifact.clone();
            let seen = Arc::clone(&seen);
            tokio::spawn(async move {
                let mut buf = Vec::new();
                let mut chunk = [0u8; 4096];
                let (method, path, body) = loop {
                    let n = match stream.read(&mut chunk).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => n,
                    };
                    buf.extend_from_slice(&chunk[..n]);
                    if let Some(parsed) = parse_request(&buf) {
                        break parsed;
                    }
                };
                seen.lock().await.push((method.clone(), path.clone(), body));

                let (status, content): (&str, Vec<u8>) = match path.as_str() {
                    p if p.contains("/deployments/device/deployments/next") => match &deployment
                    {
                        Some(json) => ("200 OK", json.to_string().into_bytes()),
                        None => ("204 No Content", Vec::new()),
                    },
                    "/artifact.mender" => ("200 OK", artifact.clone()),
                    p if p.ends_with("/status") => ("204 No Content", Vec::new()),
                    p if p.ends_with("/log") => ("204 No Content", Vec::new()),
                    p if p.ends_with("/attributes") => ("200 OK", Vec::new()),
                    _ => ("404 Not Found", Vec::new()),
                };
                let header = format!(
                    "HTTP/1.1 {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                    status,
                    content.len()
                );
                let _ = stream.write_all(header.as_bytes()).await;
                let _ = stream.write_all(&content).await;
            });
        }
    }

    /// Returns (method, path, body) once a full request is buffered.
    fn parse_request(buf: &[u8]) -> Option<(String, String, String)> {
        let text = String::from_utf8_lossy(buf);
        let header_end = text.find("\r\n\r\n")?;
        let headers = &text[..header_end];
        let mut lines = headers.lines();
        let request_line = lines.next()?;
        let mut parts = request_line.split_whitespace();
        let method = parts.next()?.to_string();
        let path = parts.next()?.to_string();

        let content_length = headers
            .lines()
            .find_map(|l| {
                let lower = l.to_lowercase();
                lower
                    .strip_prefix("content-length:")
                    .map(|v| v.trim().to_string())
            })
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(0);
        let body_start = header_end + 4;
        if buf.len() < body_start + content_length {
            return None;
        }
        let body = String::from_utf8_lossy(&buf[body_start..body_start + content_length])
            .to_string();
        Some((method, path, body))
    }

    /// Fake auth daemon pointing clients at the fake backend.
    async fn fake_auth(listener: UnixListener, server_url: String) {
        loop {
            let (stream, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => return,
            };
            let server_url = server_url.clone();
            tokio::spawn(async move {
                use tokio::io::{AsyncBufReadExt, BufReader};
                let (read_half, mut write_half) = stream.into_split();
                let mut line = String::new();
                if BufReader::new(read_half)
                    .read_line(&mut line)
                    .await
                    .unwrap_or(0)
                    == 0
                {
                    return;
                }
                let response = format!(
                    "{{\"token\":\"test-jwt\",\"server_url\":\"{}\",\"success\":true}}\n",
                    server_url
                );
                let _ = write_half.write_all(response.as_bytes()).await;
            });
        }
    }

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

    fn build_artifact(name: &str, device_type: &str, files: &[(&str, &[u8])]) -> Vec<u8> {
        let version_doc = br#"{"format":"mender","version":3}"#.to_vec();
        let header_info = format!(
            r#"{{"payloads":[{{"type":"test-module"}}],"artifact_provides":{{"artifact_name":"{}"}},"artifact_depends":{{"device_type":["{}"]}}}}"#,
            name, device_type
        );
        let header_tar = tar_with(&[
            ("header-info", header_info.as_bytes()),
            ("headers/0000/type-info", br#"{"type":"test-module"}"#),
        ]);
        let data_tar = tar_with(files);
        let sum = |data: &[u8]| hex::encode(Sha256::digest(data));
        let manifest = format!(
            "{}  version\n{}  header.tar\n{}  data/0000.tar\n",
            sum(&version_doc),
            sum(&header_tar),
            sum(&data_tar)
        );
        tar_with(&[
            ("version", &version_doc),
            ("manifest", manifest.as_bytes()),
            ("header.tar", &header_tar),
            ("data/0000.tar", &data_tar),
        ])
    }

    fn install_module(dir: &Path, body: &str) {
        fs::create_dir_all(dir).unwrap();
        let path = dir.join("test-module");
        fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    }

    /// A module that answers the queries and records every invocation.
    fn recording_module(reboot_answer: &str, commit_exit: &str) -> String {
        format!(
            r#"echo "$1" >> "$2/../invocations"
case "$1" in
  NeedsArtifactReboot) echo {};;
  SupportsRollback) echo Yes;;
  ArtifactCommit) {};;
esac"#,
            reboot_answer, commit_exit
        )
    }

    struct Harness {
        _data_dir: TempDir,
        d: DaemonContext,
        seen: Seen,
    }

    async fn harness(
        deployment_artifact: Option<(&str, Vec<u8>)>,
        module_body: &str,
    ) -> Harness {
        let data_dir = TempDir::new().unwrap();

        let backend = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let backend_url = format!("http://{}", backend.local_addr().unwrap());
        let seen: Seen = Arc::new(Mutex::new(Vec::new()));
        let deployment = deployment_artifact.as_ref().map(|(id, _)| {
            serde_json::json!({
                "id": id,
                "artifact": {"source": {"uri": format!("{}/artifact.mender", backend_url)}}
            })
        });
        let artifact = deployment_artifact.map(|(_, a)| a).unwrap_or_default();
        tokio::spawn(fake_backend(backend, deployment, artifact, Arc::clone(&seen)));

        let auth_socket = data_dir.path().join("auth.sock");
        let auth = UnixListener::bind(&auth_socket).unwrap();
        tokio::spawn(fake_auth(auth, backend_url));

        let mut config = MenderConfig::default();
        config.set_data_store_dir(data_dir.path().join("data"));
        config.modules_path = data_dir.path().join("modules");
        config.rootfs_scripts_path = data_dir.path().join("rootfs-scripts");
        config.inventory_generators_dir = data_dir.path().join("inventory");
        config.auth_socket_path = auth_socket;
        config.retry_poll_count = 1;
        config.retry_poll_interval = std::time::Duration::from_millis(10);

        fs::create_dir_all(&config.data_store_dir).unwrap();
        fs::write(&config.device_type_file, "device_type=test-device\n").unwrap();
        install_module(&config.modules_path, module_body);

        let ctx = MenderContext::initialize(config).unwrap();
        let d = DaemonContext::new(ctx).unwrap();
        Harness {
            _data_dir: data_dir,
            d,
            seen,
        }
    }

    /// Drives the machine from an initial event until it returns to Idle.
    async fn drive_to_idle(d: &mut DaemonContext, initial: StateEvent) {
        let mut machine = StateMachine::new(State::Idle);
        machine.post(initial);
        loop {
            let state = machine.step().unwrap();
            match state {
                Some(state) => run_state(&mut machine, d, state).await.unwrap(),
                None => return,
            }
        }
    }

    /// Drives a resumed machine until Idle.
    async fn drive_from_state(d: &mut DaemonContext, initial: State) {
        let mut machine = StateMachine::new(initial);
        run_state(&mut machine, d, initial).await.unwrap();
        loop {
            match machine.step().unwrap() {
                Some(state) => run_state(&mut machine, d, state).await.unwrap(),
                None => return,
            }
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn happy_install_commits_provides_and_reports_success() {
        let artifact = build_artifact(
            "my-name",
            "test-device",
            &[("payload.dat", b"payload bytes".as_slice())],
        );
        let mut h = harness(
            Some(("deployment-1", artifact)),
            &recording_module("No", "exit 0"),
        )
        .await;

        drive_to_idle(&mut h.d, StateEvent::DeploymentPollingTriggered).await;

        // Database: new artifact name, no pending state data.
        assert_eq!(
            h.d.ctx.store.read(constants::ARTIFACT_NAME_KEY).unwrap(),
            b"my-name"
        );
        assert!(h.d.ctx.store.read(constants::STATE_DATA_KEY).is_err());
        assert!(h.d.deployment.is_none());

        // The module went through the forward path and cleaned up.
        let invocations =
            fs::read_to_string(h.d.ctx.config.modules_work_path.join("invocations")).unwrap();
        let states: Vec<&str> = invocations.lines().collect();
        assert_eq!(
            states,
            [
                "Download",
                "ArtifactInstall",
                "NeedsArtifactReboot",
                "SupportsRollback",
                "ArtifactCommit",
                "Cleanup"
            ]
        );
        // The work tree is gone.
        assert!(!h.d.ctx.config.modules_work_path.join("0000").exists());

        // The backend saw the terminal success status.
        let seen = h.seen.lock().await;
        let statuses: Vec<&String> = seen
            .iter()
            .filter(|(method, path, _)| method == "POST" && path.ends_with("/status"))
            .map(|(_, _, body)| body)
            .collect();
        assert!(statuses.iter().any(|b| b.contains("downloading")));
        assert!(statuses.iter().any(|b| b.contains("installing")));
        assert!(statuses.last().unwrap().contains("success"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn failed_commit_rolls_back_and_reports_failure() {
        let artifact = build_artifact(
            "bad-release",
            "test-device",
            &[("payload.dat", b"data".as_slice())],
        );
        let mut h = harness(
            Some(("deployment-2", artifact)),
            &recording_module("No", "exit 1"),
        )
        .await;
        // Seed a current artifact name so we can verify it survives.
        h.d.ctx
            .store
            .write(constants::ARTIFACT_NAME_KEY, b"old-release")
            .unwrap();

        drive_to_idle(&mut h.d, StateEvent::DeploymentPollingTriggered).await;

        // Provides unchanged after the rollback.
        assert_eq!(
            h.d.ctx.store.read(constants::ARTIFACT_NAME_KEY).unwrap(),
            b"old-release"
        );
        assert!(h.d.ctx.store.read(constants::STATE_DATA_KEY).is_err());

        let invocations =
            fs::read_to_string(h.d.ctx.config.modules_work_path.join("invocations")).unwrap();
        let states: Vec<&str> = invocations.lines().collect();
        assert_eq!(
            states,
            [
                "Download",
                "ArtifactInstall",
                "NeedsArtifactReboot",
                "SupportsRollback",
                "ArtifactCommit",
                "ArtifactRollback",
                "ArtifactFailure",
                "Cleanup"
            ]
        );

        let seen = h.seen.lock().await;
        let last_status = seen
            .iter()
            .filter(|(m, p, _)| m == "POST" && p.ends_with("/status"))
            .last()
            .cloned()
            .unwrap();
        assert!(last_status.2.contains("failure"));
        // The failure log was uploaded.
        assert!(seen.iter().any(|(m, p, _)| m == "PUT" && p.ends_with("/log")));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn no_deployment_returns_to_idle() {
        let mut h = harness(None, "exit 0").await;
        drive_to_idle(&mut h.d, StateEvent::DeploymentPollingTriggered).await;
        assert!(h.d.deployment.is_none());
        assert!(h.d.ctx.store.read(constants::STATE_DATA_KEY).is_err());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn already_installed_artifact_reports_as_such() {
        let artifact = build_artifact(
            "current-release",
            "test-device",
            &[("payload.dat", b"data".as_slice())],
        );
        let mut h = harness(
            Some(("deployment-3", artifact)),
            &recording_module("No", "exit 0"),
        )
        .await;
        h.d.ctx
            .store
            .write(constants::ARTIFACT_NAME_KEY, b"current-release")
            .unwrap();

        drive_to_idle(&mut h.d, StateEvent::DeploymentPollingTriggered).await;

        let seen = h.seen.lock().await;
        let last_status = seen
            .iter()
            .filter(|(m, p, _)| m == "POST" && p.ends_with("/status"))
            .last()
            .cloned()
            .unwrap();
        assert!(last_status.2.contains("already-installed"));
        // The module never ran.
        assert!(!h
            .d
            .ctx
            .config
            .modules_work_path
            .join("invocations")
            .exists());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn resume_after_reboot_commits() {
        let mut h = harness(None, &recording_module("No", "exit 0")).await;

        // Simulate the state the daemon left behind when the device
        // rebooted: module work tree present, verify-reboot persisted.
        let module = update_module::UpdateModule::new(
            &h.d.ctx.config.modules_path,
            &h.d.ctx.config.modules_work_path,
            "test-module",
            std::time::Duration::from_secs(30),
        );
        module
            .prepare_file_tree(&update_module::FileTreeData::default())
            .unwrap();

        let mut data = StateData {
            state: state_names::ARTIFACT_VERIFY_REBOOT.to_string(),
            update_info: UpdateInfo {
                id: "deployment-4".to_string(),
                artifact: ArtifactData {
                    source: ArtifactSource::default(),
                    compatible_devices: vec!["test-device".to_string()],
                    payload_types: vec!["test-module".to_string()],
                    artifact_name: "my-name".to_string(),
                    artifact_group: String::new(),
                    ..ArtifactData::default()
                },
                reboot_requested: vec![REBOOT_TYPE_NONE.to_string()],
                supports_rollback: ROLLBACK_SUPPORTED.to_string(),
                all_rollbacks_successful: true,
                ..UpdateInfo::default()
            },
            ..StateData::default()
        };
        save_state_data(&mut h.d.ctx.store, &mut data).unwrap();

        let loaded = db::load_state_data(&mut h.d.ctx.store).unwrap().unwrap();
        let state = resume(&mut h.d, loaded).unwrap();
        assert_eq!(state, State::UpdateVerifyReboot);

        drive_from_state(&mut h.d, state).await;

        assert_eq!(
            h.d.ctx.store.read(constants::ARTIFACT_NAME_KEY).unwrap(),
            b"my-name"
        );
        assert!(h.d.ctx.store.read(constants::STATE_DATA_KEY).is_err());

        let invocations =
            fs::read_to_string(h.d.ctx.config.modules_work_path.join("invocations")).unwrap();
        let states: Vec<&str> = invocations.lines().collect();
        assert_eq!(states, ["ArtifactVerifyReboot", "ArtifactCommit", "Cleanup"]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn loop_cap_on_resume_forces_cleanup_with_inconsistent_name() {
        let mut h = harness(None, &recording_module("No", "exit 0")).await;
        h.d.ctx
            .store
            .write(constants::ARTIFACT_NAME_KEY, b"my-name")
            .unwrap();

        let data = StateData {
            state: state_names::AFTER_ARTIFACT_COMMIT.to_string(),
            update_info: UpdateInfo {
                id: "deployment-5".to_string(),
                artifact: ArtifactData {
                    payload_types: vec!["test-module".to_string()],
                    artifact_name: "my-name".to_string(),
                    ..ArtifactData::default()
                },
                state_data_store_count: MAX_STATE_DATA_STORE_COUNT,
                all_rollbacks_successful: true,
                ..UpdateInfo::default()
            },
            ..StateData::default()
        };
        // Write directly; save_state_data would refuse at the cap.
        h.d.ctx
            .store
            .write(
                constants::STATE_DATA_KEY,
                &serde_json::to_vec(&data).unwrap(),
            )
            .unwrap();

        let loaded = db::load_state_data(&mut h.d.ctx.store).unwrap().unwrap();
        assert!(loaded.exceeded);
        let state = resume(&mut h.d, loaded).unwrap();
        assert_eq!(state, State::UpdateCleanup);
        // The committed marker survives from the AfterArtifactCommit arm.
        assert!(h.d.deployment.as_ref().unwrap().committed);

        drive_from_state(&mut h.d, state).await;

        assert_eq!(
            h.d.ctx.store.read(constants::ARTIFACT_NAME_KEY).unwrap(),
            b"my-name_INCONSISTENT"
        );
        assert!(h.d.ctx.store.read(constants::STATE_DATA_KEY).is_err());
    }
}
