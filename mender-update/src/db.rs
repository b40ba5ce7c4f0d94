//! The persisted deployment state: the record that lets the daemon resume
//! mid-deployment after a reboot or crash, plus the bookkeeping that bounds
//! state-machine loops.

use crate::error::{self, Error, Result};
use keyvalue::Database;
use log::info;
use serde::{Deserialize, Serialize};
use snafu::ResultExt;
use std::collections::HashMap;
use update_module::RebootAction;

/// Current version of the StateData schema.
pub const STATE_DATA_VERSION: i32 = 2;

/// Cap on state-data stores per deployment: twice the number of
/// recoverable states, with margin. Exceeding it means the machine is
/// looping and gets forced into cleanup.
pub const MAX_STATE_DATA_STORE_COUNT: i64 = 28;

// Database values for `supports_rollback`.
pub const ROLLBACK_SUPPORTED: &str = "rollback-supported";
pub const ROLLBACK_NOT_SUPPORTED: &str = "rollback-not-supported";

// Database values for `reboot_requested`.
pub const REBOOT_TYPE_NONE: &str = "";
pub const REBOOT_TYPE_CUSTOM: &str = "reboot-type-custom";
pub const REBOOT_TYPE_AUTOMATIC: &str = "reboot-type-automatic";

pub fn supports_rollback_to_db_string(support: bool) -> &'static str {
    if support {
        ROLLBACK_SUPPORTED
    } else {
        ROLLBACK_NOT_SUPPORTED
    }
}

pub fn db_string_to_supports_rollback(value: &str) -> Result<bool> {
    match value {
        ROLLBACK_SUPPORTED => Ok(true),
        ROLLBACK_NOT_SUPPORTED => Ok(false),
        other => Err(Error::DatabaseValue {
            reason: format!("\"{}\" is not a valid value for SupportsRollback", other),
        }),
    }
}

pub fn needs_reboot_to_db_string(action: RebootAction) -> &'static str {
    match action {
        RebootAction::No => REBOOT_TYPE_NONE,
        RebootAction::Automatic => REBOOT_TYPE_AUTOMATIC,
        RebootAction::Yes => REBOOT_TYPE_CUSTOM,
    }
}

pub fn db_string_to_needs_reboot(value: &str) -> Result<RebootAction> {
    match value {
        REBOOT_TYPE_NONE => Ok(RebootAction::No),
        REBOOT_TYPE_AUTOMATIC => Ok(RebootAction::Automatic),
        REBOOT_TYPE_CUSTOM => Ok(RebootAction::Yes),
        other => Err(Error::DatabaseValue {
            reason: format!("\"{}\" is not a valid value for RebootRequested", other),
        }),
    }
}

/// Recoverable state identifiers, persisted literally in the `state`
/// field.
pub mod state_names {
    pub const DOWNLOAD: &str = "Download";
    pub const ARTIFACT_INSTALL: &str = "ArtifactInstall";
    pub const ARTIFACT_REBOOT: &str = "ArtifactReboot";
    pub const ARTIFACT_VERIFY_REBOOT: &str = "ArtifactVerifyReboot";
    pub const ARTIFACT_COMMIT: &str = "ArtifactCommit";
    pub const AFTER_ARTIFACT_COMMIT: &str = "AfterArtifactCommit";
    pub const ARTIFACT_ROLLBACK: &str = "ArtifactRollback";
    pub const ARTIFACT_ROLLBACK_REBOOT: &str = "ArtifactRollbackReboot";
    pub const ARTIFACT_VERIFY_ROLLBACK_REBOOT: &str = "ArtifactVerifyRollbackReboot";
    pub const ARTIFACT_FAILURE: &str = "ArtifactFailure";
    pub const CLEANUP: &str = "Cleanup";
    pub const STATUS_REPORT_RETRY: &str = "StatusReportRetry";
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArtifactSource {
    pub uri: String,
    pub expire: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArtifactData {
    pub source: ArtifactSource,
    pub compatible_devices: Vec<String>,
    pub payload_types: Vec<String>,
    pub artifact_name: String,
    pub artifact_group: String,
    pub type_info_provides: HashMap<String, String>,
    pub clears_artifact_provides: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdateInfo {
    pub artifact: ArtifactData,
    pub id: String,
    /// Indexed like `payload_types`; values are the reboot db strings.
    pub reboot_requested: Vec<String>,
    pub supports_rollback: String,
    pub state_data_store_count: i64,
    pub has_db_schema_update: bool,
    pub all_rollbacks_successful: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StateData {
    pub version: i32,
    pub state: String,
    pub update_info: UpdateInfo,
}

impl Default for StateData {
    fn default() -> Self {
        Self {
            version: STATE_DATA_VERSION,
            state: String::new(),
            update_info: UpdateInfo {
                all_rollbacks_successful: true,
                ..UpdateInfo::default()
            },
        }
    }
}

/// A loaded record plus whether the loop cap was hit while loading.
#[derive(Debug)]
pub struct LoadedStateData {
    pub data: StateData,
    pub exceeded: bool,
}

/// Persists the record, bumping the store count first. Returns
/// `StateDataStoreCountExceeded` without writing once the cap is hit.
/// While a schema update is in progress the record is mirrored under the
/// uncommitted key, so rolling back to the previous client finds its own
/// schema untouched.
pub fn save_state_data(db: &mut Database, data: &mut StateData) -> Result<()> {
    data.update_info.state_data_store_count += 1;
    if data.update_info.state_data_store_count > MAX_STATE_DATA_STORE_COUNT {
        return error::StateDataStoreCountExceededSnafu.fail();
    }
    data.version = STATE_DATA_VERSION;

    let encoded = serde_json::to_vec(data).context(error::StateDataEncodeSnafu)?;
    let mirror = data.update_info.has_db_schema_update;
    db.write_transaction(|txn| {
        txn.write(constants::STATE_DATA_KEY, &encoded)?;
        if mirror {
            txn.write(constants::STATE_DATA_KEY_UNCOMMITTED, &encoded)?;
        }
        Ok::<_, Error>(())
    })
}

/// Loads the record, preferring the uncommitted key (the one written last
/// while a schema migration was in flight). The store count is bumped and
/// written back on load too, which is what bounds crash loops even when
/// the state function itself never gets to store anything.
pub fn load_state_data(db: &mut Database) -> Result<Option<LoadedStateData>> {
    let raw = match db.read(constants::STATE_DATA_KEY_UNCOMMITTED) {
        Ok(raw) => raw,
        Err(keyvalue::Error::KeyNotFound { .. }) => match db.read(constants::STATE_DATA_KEY) {
            Ok(raw) => raw,
            Err(keyvalue::Error::KeyNotFound { .. }) => return Ok(None),
            Err(e) => return Err(e.into()),
        },
        Err(e) => return Err(e.into()),
    };

    let mut data: StateData =
        serde_json::from_slice(&raw).context(error::StateDataParseSnafu)?;
    if data.version != STATE_DATA_VERSION {
        info!(
            "State data has schema version {}, current is {}; migration in progress",
            data.version, STATE_DATA_VERSION
        );
        data.update_info.has_db_schema_update = true;
    }

    data.update_info.state_data_store_count += 1;
    if data.update_info.state_data_store_count > MAX_STATE_DATA_STORE_COUNT {
        // Hand the record back anyway so the caller can route to cleanup
        // without losing the breadcrumb.
        return Ok(Some(LoadedStateData {
            data,
            exceeded: true,
        }));
    }

    let encoded = serde_json::to_vec(&data).context(error::StateDataEncodeSnafu)?;
    let mirror = data.update_info.has_db_schema_update;
    db.write_transaction(|txn| {
        txn.write(constants::STATE_DATA_KEY, &encoded)?;
        if mirror {
            txn.write(constants::STATE_DATA_KEY_UNCOMMITTED, &encoded)?;
        }
        Ok::<_, Error>(())
    })?;

    Ok(Some(LoadedStateData {
        data,
        exceeded: false,
    }))
}

/// Removes both state-data keys.
pub fn remove_state_data(db: &mut Database) -> Result<()> {
    db.write_transaction(|txn| {
        txn.remove(constants::STATE_DATA_KEY)?;
        txn.remove(constants::STATE_DATA_KEY_UNCOMMITTED)?;
        Ok::<_, Error>(())
    })
}
