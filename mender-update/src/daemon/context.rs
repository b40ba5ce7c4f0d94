//! Shared state for the running daemon: the persistent context, the API
//! client, the script runner, and the in-flight deployment (if any).

use crate::config::MenderConfig;
use crate::context::MenderContext;
use crate::db::StateData;
use crate::deployment_log::DeploymentLog;
use crate::deployments::ApiClient;
use crate::error::Result;
use state_scripts::ScriptRunner;
use update_module::{FileTreeData, UpdateModule};

pub struct DaemonContext {
    pub ctx: MenderContext,
    pub api: ApiClient,
    pub scripts: ScriptRunner,
    pub deployment: Option<DeploymentContext>,
    /// Digest of the last submitted inventory payload; unchanged inventory
    /// is not resubmitted.
    pub last_inventory_digest: Option<[u8; 32]>,
}

impl DaemonContext {
    pub fn new(ctx: MenderContext) -> Result<Self> {
        let api = ApiClient::new(&ctx.config)?;
        let scripts = ScriptRunner::new(
            &ctx.config.artifact_scripts_path,
            &ctx.config.rootfs_scripts_path,
            ctx.config.state_script_timeout,
        );
        Ok(Self {
            ctx,
            api,
            scripts,
            deployment: None,
            last_inventory_digest: None,
        })
    }
}

/// Everything the daemon tracks about the deployment in progress.
pub struct DeploymentContext {
    pub state_data: StateData,
    pub module: Option<UpdateModule>,
    pub log: Option<DeploymentLog>,
    /// The offered artifact is already installed; report `already-installed`
    /// and skip the install.
    pub already_installed: bool,
    /// The deployment failed somewhere; the terminal status is `failure`.
    pub failed: bool,
    /// The server aborted the deployment; no further status pushes.
    pub aborted: bool,
    /// We went through a reboot, so a rollback needs a rollback-reboot.
    pub rebooted: bool,
    /// The provides were committed; rollback is no longer possible.
    pub committed: bool,
    /// Resumed from the `AfterArtifactCommit` breadcrumb: skip the module
    /// commit, run the leave hooks, and clean up.
    pub resumed_after_commit: bool,
    /// The artifact carries no payload (provides-only update).
    pub empty_payload: bool,
    /// The state-data store cap fired; cleanup runs with a "loop" substate.
    pub loop_detected: bool,
}

impl DeploymentContext {
    pub fn new(state_data: StateData, log: Option<DeploymentLog>) -> Self {
        Self {
            state_data,
            module: None,
            log,
            already_installed: false,
            failed: false,
            aborted: false,
            rebooted: false,
            committed: false,
            resumed_after_commit: false,
            empty_payload: false,
            loop_detected: false,
        }
    }

    pub fn id(&self) -> &str {
        &self.state_data.update_info.id
    }

    /// Copies the artifact's (authoritative, signed) metadata into the
    /// persisted record.
    pub fn fill_from_artifact(&mut self, artifact: &mender_artifact::Artifact) {
        let data = &mut self.state_data.update_info.artifact;
        data.compatible_devices = artifact.compatible_devices().to_vec();
        data.payload_types = vec![artifact.payload_type().unwrap_or_default().to_string()];
        data.artifact_name = artifact.artifact_name().to_string();
        data.artifact_group = artifact.artifact_group().unwrap_or_default().to_string();
        data.type_info_provides = artifact
            .header
            .type_info
            .artifact_provides
            .clone()
            .unwrap_or_default();
        data.clears_artifact_provides = artifact
            .clears_provides()
            .map(<[String]>::to_vec)
            .unwrap_or_default();
        self.empty_payload = artifact.payload_type().is_none();
    }

    /// The provides set this deployment commits on success.
    pub fn new_provides(&self) -> std::collections::HashMap<String, String> {
        let artifact = &self.state_data.update_info.artifact;
        let mut provides = artifact.type_info_provides.clone();
        provides.insert("artifact_name".to_string(), artifact.artifact_name.clone());
        if !artifact.artifact_group.is_empty() {
            provides.insert("artifact_group".to_string(), artifact.artifact_group.clone());
        }
        provides
    }

    /// Recreates the module driver from persisted data (after a restart).
    pub fn make_module(&self, config: &MenderConfig) -> Option<UpdateModule> {
        let payload_type = self.state_data.update_info.artifact.payload_types.first()?;
        if payload_type.is_empty() {
            return None;
        }
        Some(UpdateModule::new(
            &config.modules_path,
            &config.modules_work_path,
            payload_type,
            config.module_timeout,
        ))
    }

    /// The file-tree contents for the module, from the current provides
    /// and the artifact's header.
    pub fn file_tree_data(
        &self,
        current_provides: &std::collections::HashMap<String, String>,
        device_type: &str,
        artifact: &mender_artifact::Artifact,
    ) -> FileTreeData {
        FileTreeData {
            current_artifact_name: current_provides.get("artifact_name").cloned(),
            current_artifact_group: current_provides.get("artifact_group").cloned(),
            current_device_type: device_type.to_string(),
            artifact_name: artifact.artifact_name().to_string(),
            artifact_group: artifact.artifact_group().map(str::to_string),
            payload_type: artifact.payload_type().unwrap_or_default().to_string(),
            header_info: artifact.header.info_raw.clone(),
            type_info: artifact.header.type_info_raw.clone(),
            meta_data: artifact
                .header
                .meta_data
                .as_ref()
                .map(|v| v.to_string()),
        }
    }
}
