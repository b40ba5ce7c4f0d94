//! The agent's persistent context: the key-value store plus the artifact
//! provides bookkeeping that install flows read and commit updates.

use crate::config::MenderConfig;
use crate::error::{self, Error, Result};
use glob::Pattern;
use keyvalue::{Database, Transaction};
use snafu::ResultExt;
use std::collections::HashMap;

/// Suffix appended to the stored artifact name when an update can't roll
/// back and ends in an unknown state.
pub const BROKEN_ARTIFACT_NAME_SUFFIX: &str = "_INCONSISTENT";

pub struct MenderContext {
    pub config: MenderConfig,
    pub store: Database,
}

impl MenderContext {
    /// Opens (or creates) the store under the configured data dir.
    pub fn initialize(config: MenderConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.data_store_dir).context(error::IoSnafu {
            path: &config.data_store_dir,
        })?;
        let store = Database::open(config.store_path())?;
        Ok(Self { config, store })
    }

    /// Loads the current provides: `artifact_name` and `artifact_group`
    /// from their dedicated keys, everything else from the JSON blob.
    pub fn load_provides(&self) -> Result<HashMap<String, String>> {
        self.store
            .read_transaction(|txn| load_provides_txn(txn))
    }

    /// Stores a new artifact's provides, applying clears-provides
    /// filtering against the existing set, and runs `txn_fn` inside the
    /// same write transaction so callers can piggy-back deletions.
    pub fn commit_artifact_data<F>(
        &mut self,
        new_provides: &HashMap<String, String>,
        clears_provides: Option<&[String]>,
        txn_fn: F,
    ) -> Result<()>
    where
        F: FnOnce(&mut Transaction<'_>) -> Result<()>,
    {
        let patterns = compile_patterns(clears_provides.unwrap_or(&[]))?;
        self.store.write_transaction(|txn| {
            let current = load_provides_txn(txn)?;
            let merged = filter_provides(&current, &patterns, new_provides);

            match merged.get("artifact_name") {
                Some(name) => txn.write(constants::ARTIFACT_NAME_KEY, name.as_bytes())?,
                None => txn.remove(constants::ARTIFACT_NAME_KEY)?,
            }
            match merged.get("artifact_group") {
                Some(group) => txn.write(constants::ARTIFACT_GROUP_KEY, group.as_bytes())?,
                None => txn.remove(constants::ARTIFACT_GROUP_KEY)?,
            }

            let rest: HashMap<&String, &String> = merged
                .iter()
                .filter(|(k, _)| *k != "artifact_name" && *k != "artifact_group")
                .collect();
            if rest.is_empty() {
                txn.remove(constants::ARTIFACT_PROVIDES_KEY)?;
            } else {
                let encoded =
                    serde_json::to_vec(&rest).context(error::StateDataEncodeSnafu)?;
                txn.write(constants::ARTIFACT_PROVIDES_KEY, &encoded)?;
            }

            txn_fn(txn)
        })
    }

    pub fn device_type(&self) -> Result<String> {
        self.config.device_type()
    }
}

/// Reads the provides inside an open transaction.
pub fn load_provides_txn(txn: &Transaction<'_>) -> Result<HashMap<String, String>> {
    let mut provides = HashMap::new();

    for (key, name) in [
        (constants::ARTIFACT_NAME_KEY, "artifact_name"),
        (constants::ARTIFACT_GROUP_KEY, "artifact_group"),
    ] {
        match txn.read(key) {
            Ok(raw) => {
                let value = String::from_utf8_lossy(&raw).to_string();
                if !value.is_empty() {
                    provides.insert(name.to_string(), value);
                }
            }
            Err(keyvalue::Error::KeyNotFound { .. }) => {}
            Err(e) => return Err(e.into()),
        }
    }

    match txn.read(constants::ARTIFACT_PROVIDES_KEY) {
        Ok(raw) => {
            let rest: HashMap<String, String> =
                serde_json::from_slice(&raw).map_err(|e| Error::DatabaseValue {
                    reason: format!("unexpected data under artifact-provides: {}", e),
                })?;
            provides.extend(rest);
        }
        Err(keyvalue::Error::KeyNotFound { .. }) => {}
        Err(e) => return Err(e.into()),
    }

    Ok(provides)
}

/// Checks an artifact's depends against this device and the currently
/// installed provides.
pub fn check_artifact_depends(
    artifact: &mender_artifact::Artifact,
    device_type: &str,
    current: &HashMap<String, String>,
) -> Result<()> {
    if !artifact
        .compatible_devices()
        .iter()
        .any(|d| d == device_type)
    {
        return error::DependsMismatchSnafu {
            reason: format!(
                "device type '{}' not among compatible devices {:?}",
                device_type,
                artifact.compatible_devices()
            ),
        }
        .fail();
    }

    let depends = &artifact.header.info.artifact_depends;
    if let Some(names) = &depends.artifact_name {
        let installed = current.get("artifact_name").cloned().unwrap_or_default();
        if !names.iter().any(|n| *n == installed) {
            return error::DependsMismatchSnafu {
                reason: format!(
                    "currently installed artifact '{}' not among required {:?}",
                    installed, names
                ),
            }
            .fail();
        }
    }
    if let Some(groups) = &depends.artifact_group {
        let group = current.get("artifact_group").cloned().unwrap_or_default();
        if !groups.iter().any(|g| *g == group) {
            return error::DependsMismatchSnafu {
                reason: format!(
                    "current artifact group '{}' not among required {:?}",
                    group, groups
                ),
            }
            .fail();
        }
    }
    Ok(())
}

pub fn compile_patterns(clears: &[String]) -> Result<Vec<Pattern>> {
    clears
        .iter()
        .map(|p| {
            Pattern::new(p).context(error::ProvidesPatternSnafu { pattern: p.clone() })
        })
        .collect()
}

/// Clears-provides semantics: an existing key is dropped when it matches
/// any pattern and the new artifact doesn't re-supply it; the new provides
/// then overwrite and augment what's left. Idempotent by construction.
pub fn filter_provides(
    current: &HashMap<String, String>,
    clears: &[Pattern],
    new_provides: &HashMap<String, String>,
) -> HashMap<String, String> {
    let mut result: HashMap<String, String> = current
        .iter()
        .filter(|(key, _)| {
            new_provides.contains_key(*key) || !clears.iter().any(|p| p.matches(key))
        })
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    result.extend(
        new_provides
            .iter()
            .map(|(k, v)| (k.clone(), v.clone())),
    );
    result
}
