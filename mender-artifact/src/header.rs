//! The `header.tar` section: `header-info`, optional embedded state
//! scripts, and the single payload's `type-info` / `meta-data` pair.

use crate::error::{self, Error, Result};
use serde::{Deserialize, Serialize};
use snafu::{ensure, ResultExt};
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

/// One payload slot in `header-info`. `type` is null for an empty payload
/// (an artifact that only updates provides).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PayloadRef {
    #[serde(rename = "type")]
    pub payload_type: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ArtifactProvides {
    pub artifact_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact_group: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ArtifactDepends {
    pub device_type: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact_name: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact_group: Option<Vec<String>>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HeaderInfo {
    pub payloads: Vec<PayloadRef>,
    pub artifact_provides: ArtifactProvides,
    pub artifact_depends: ArtifactDepends,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct TypeInfo {
    #[serde(rename = "type", default)]
    pub payload_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact_provides: Option<HashMap<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub clears_artifact_provides: Option<Vec<String>>,
}

#[derive(Debug, Clone)]
pub struct Header {
    pub info: HeaderInfo,
    pub type_info: TypeInfo,
    pub meta_data: Option<serde_json::Value>,
    /// Paths of state scripts installed from the artifact.
    pub scripts: Vec<PathBuf>,
    /// The raw `header-info` and `type-info` documents, reproduced verbatim
    /// in the update module's file tree.
    pub info_raw: String,
    pub type_info_raw: String,
}

/// Where embedded state scripts get installed, and the version stamp
/// written next to them.
#[derive(Debug, Clone)]
pub struct ScriptsConfig {
    pub path: PathBuf,
    pub version: u32,
}

/// Parses the (decompressed) header tar stream, extracting any embedded
/// scripts into `scripts.path`.
pub fn parse<R: Read>(reader: R, scripts: &ScriptsConfig) -> Result<Header> {
    let mut archive = tar::Archive::new(reader);
    let mut entries = archive.entries().context(error::TarEntrySnafu)?;

    let mut entry = next_required(&mut entries, "header-info")?;
    let name = entry_name(&entry)?;
    ensure!(
        name == "header-info",
        error::UnexpectedEntrySnafu {
            name,
            expected: "header-info",
        }
    );
    let info_raw = read_to_string(&mut entry)?;
    let info: HeaderInfo =
        serde_json::from_str(&info_raw).context(error::HeaderInfoJsonSnafu)?;
    ensure!(
        info.payloads.len() == 1,
        error::MultiplePayloadsSnafu {
            count: info.payloads.len(),
        }
    );

    // Zero or more embedded state scripts.
    let mut installed_scripts = Vec::new();
    let mut entry = loop {
        let mut entry = next_required(&mut entries, "headers/0000/type-info")?;
        let name = entry_name(&entry)?;
        match name.strip_prefix("scripts/") {
            Some(script_name) => {
                installed_scripts.push(install_script(&mut entry, script_name, &scripts.path)?);
            }
            None => break entry,
        }
    };
    if !installed_scripts.is_empty() {
        write_version_file(scripts)?;
    }

    let name = entry_name(&entry)?;
    ensure!(
        name.starts_with("headers/"),
        error::UnexpectedEntrySnafu {
            name,
            expected: "headers/0000/type-info",
        }
    );
    ensure!(
        name == "headers/0000/type-info",
        error::HeaderIndexSnafu { name }
    );
    let type_info_raw = read_to_string(&mut entry)?;
    let type_info: TypeInfo =
        serde_json::from_str(&type_info_raw).context(error::TypeInfoJsonSnafu)?;

    // Optional meta-data, and nothing else after it.
    let mut meta_data = None;
    if let Some(entry) = entries.next() {
        let mut entry = entry.context(error::TarEntrySnafu)?;
        let name = entry_name(&entry)?;
        if name == "headers/0000/meta-data" {
            let raw = read_to_string(&mut entry)?;
            meta_data =
                Some(serde_json::from_str(&raw).context(error::MetaDataJsonSnafu)?);
        } else if name.starts_with("headers/") {
            return error::HeaderIndexSnafu { name }.fail();
        } else {
            return error::UnexpectedEntrySnafu {
                name,
                expected: "headers/0000/meta-data or end of header",
            }
            .fail();
        }
    }
    if let Some(entry) = entries.next() {
        let entry = entry.context(error::TarEntrySnafu)?;
        let name = entry_name(&entry)?;
        return if name.starts_with("headers/") {
            error::HeaderIndexSnafu { name }.fail()
        } else {
            error::UnexpectedEntrySnafu {
                name,
                expected: "end of header",
            }
            .fail()
        };
    }

    Ok(Header {
        info,
        type_info,
        meta_data,
        scripts: installed_scripts,
        info_raw,
        type_info_raw,
    })
}

fn next_required<'a, R: Read>(
    entries: &mut tar::Entries<'a, R>,
    expected: &str,
) -> Result<tar::Entry<'a, R>> {
    entries
        .next()
        .ok_or_else(|| {
            error::MissingEntrySnafu {
                expected: expected.to_string(),
            }
            .build()
        })?
        .context(error::TarEntrySnafu)
}

pub(crate) fn entry_name<R: Read>(entry: &tar::Entry<'_, R>) -> Result<String> {
    let path = entry.path().context(error::TarEntrySnafu)?;
    let name = path.to_string_lossy();
    Ok(name.strip_prefix("./").unwrap_or(&name).to_string())
}

fn read_to_string<R: Read>(entry: &mut tar::Entry<'_, R>) -> Result<String> {
    let mut raw = String::new();
    entry
        .read_to_string(&mut raw)
        .context(error::TarEntrySnafu)?;
    Ok(raw)
}

/// Copies one embedded script to disk with owner-only permissions.
fn install_script<R: Read>(
    entry: &mut tar::Entry<'_, R>,
    script_name: &str,
    dir: &Path,
) -> Result<PathBuf> {
    fs::create_dir_all(dir).context(error::ScriptsDirCreateSnafu { path: dir })?;
    let path = dir.join(script_name);
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o700)
        .open(&path)
        .context(error::ScriptWriteSnafu { path: &path })?;
    io::copy(entry, &mut file).context(error::ScriptWriteSnafu { path: &path })?;
    file.sync_all()
        .context(error::ScriptWriteSnafu { path: &path })?;
    Ok(path)
}

/// Stamps the scripts directory with the expected format version and syncs
/// it so the scripts survive a spontaneous reboot.
fn write_version_file(scripts: &ScriptsConfig) -> Result<()> {
    let path = scripts.path.join("version");
    let mut file =
        File::create(&path).context(error::ScriptWriteSnafu { path: &path })?;
    file.write_all(scripts.version.to_string().as_bytes())
        .context(error::ScriptWriteSnafu { path: &path })?;
    file.sync_all()
        .context(error::ScriptWriteSnafu { path: &path })?;
    File::open(&scripts.path)
        .and_then(|d| d.sync_all())
        .context(error::ScriptsSyncSnafu {
            path: &scripts.path,
        })?;
    Ok(())
}

impl Header {
    /// The single payload's type; None for an empty payload.
    pub fn payload_type(&self) -> Option<&str> {
        self.info.payloads[0].payload_type.as_deref()
    }
}
