//! Inventory scraping and submission. Generators are executables named
//! `mender-inventory-*`; each prints `key=value` lines, duplicate keys
//! merge into arrays, and the agent always appends its own version. The
//! serialized payload is hashed so unchanged inventory isn't resubmitted.

use crate::deployments::ApiClient;
use crate::error::{self, Result};
use log::{info, warn};
use sha2::{Digest, Sha256};
use snafu::ResultExt;
use std::collections::BTreeMap;
use std::path::Path;

pub const GENERATOR_PREFIX: &str = "mender-inventory-";

/// Runs every generator in `dir` and merges their output. Keys are sorted
/// so the payload (and its hash) is deterministic.
pub async fn gather(dir: &Path, device_type: &str) -> Result<BTreeMap<String, Vec<String>>> {
    let mut data: BTreeMap<String, Vec<String>> = BTreeMap::new();

    let entries = match std::fs::read_dir(dir) {
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            warn!(
                "Inventory generator directory '{}' does not exist",
                dir.display()
            );
            Vec::new()
        }
        Err(e) => return Err(e).context(error::IoSnafu { path: dir }),
        Ok(entries) => {
            let mut paths: Vec<_> = entries
                .filter_map(|e| e.ok())
                .map(|e| e.path())
                .filter(|p| {
                    p.is_file()
                        && p.file_name()
                            .map(|n| n.to_string_lossy().starts_with(GENERATOR_PREFIX))
                            .unwrap_or(false)
                        && nix::unistd::access(p, nix::unistd::AccessFlags::X_OK).is_ok()
                })
                .collect();
            paths.sort();
            paths
        }
    };

    for path in entries {
        let output = tokio::process::Command::new(&path)
            .output()
            .await
            .context(error::InventoryGeneratorSnafu { path: &path })?;
        if !output.status.success() {
            warn!(
                "Inventory generator '{}' exited with {}; skipping its output",
                path.display(),
                output.status
            );
            continue;
        }
        for line in String::from_utf8_lossy(&output.stdout).lines() {
            match line.split_once('=') {
                Some((key, value)) if !key.is_empty() => {
                    data.entry(key.to_string())
                        .or_default()
                        .push(value.to_string());
                }
                _ => warn!(
                    "Ignoring malformed inventory line from '{}': {}",
                    path.display(),
                    line
                ),
            }
        }
    }

    data.entry("device_type".to_string())
        .or_default()
        .push(device_type.to_string());
    data.insert(
        "mender_client_version".to_string(),
        vec![constants::MENDER_CLIENT_VERSION.to_string()],
    );
    Ok(data)
}

/// The `PUT /inventory/device/attributes` payload: an array of
/// `{"name", "value"}` objects, scalar for single values.
pub fn payload(data: &BTreeMap<String, Vec<String>>) -> serde_json::Value {
    let items: Vec<serde_json::Value> = data
        .iter()
        .map(|(name, values)| {
            let value = if values.len() == 1 {
                serde_json::Value::String(values[0].clone())
            } else {
                serde_json::Value::Array(
                    values
                        .iter()
                        .map(|v| serde_json::Value::String(v.clone()))
                        .collect(),
                )
            };
            serde_json::json!({"name": name, "value": value})
        })
        .collect();
    serde_json::Value::Array(items)
}

/// Hash of the serialized payload, used to suppress unchanged submissions.
pub fn digest(payload: &serde_json::Value) -> [u8; 32] {
    Sha256::digest(payload.to_string().as_bytes()).into()
}

pub async fn push(client: &ApiClient, payload: &serde_json::Value) -> Result<()> {
    let (status, body) = client
        .send(reqwest::Method::PUT, constants::INVENTORY_URI, Some(payload))
        .await?;
    match status.as_u16() {
        200 | 201 => {
            info!("Inventory submitted");
            Ok(())
        }
        code => error::BadResponseSnafu { status: code, body }.fail(),
    }
}
