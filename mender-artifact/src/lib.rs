/*!
# Background

Updates arrive as "artifacts": a tar container holding, in fixed order, a
`version` document, a `manifest` of SHA-256 checksums, an optional
`manifest.sig`, a nested `header.tar[.gz]` with the update's metadata and
embedded state scripts, and at most one nested `data/0000.tar[.gz]` payload.

This library reads that container as a stream: sections are checked in
order, every manifest-listed stream is digested on the fly and compared at
end of stream, and the payload is handed to the caller file by file without
ever landing on disk. Memory use stays constant no matter how large the
payload is.

Only format version 3 is accepted, and only a single payload; both limits
are part of the wire contract.

# Usage

```no_run
use mender_artifact::{parse, ParserConfig};
use std::io::Read;

let config = ParserConfig {
    verify_keys: vec![],
    artifact_scripts_path: "/var/lib/mender/scripts".into(),
    artifact_scripts_version: 3,
};
let file = std::fs::File::open("release.mender").unwrap();
let (artifact, _) = parse::<_, _, mender_artifact::Error, _>(file, &config, |artifact, payload| {
    while let Some(mut file) = payload.next_file()? {
        let mut content = Vec::new();
        file.read_to_end(&mut content).unwrap();
        println!("{}: {} bytes", file.name, content.len());
    }
    Ok(())
})
.unwrap();
println!("installed artifact: {}", artifact.artifact_name());
```
*/

pub mod compression;
pub mod error;
pub mod header;
pub mod manifest;
pub mod payload;
pub mod signature;
pub mod verify;

pub use error::{Error, Result};
pub use header::{Header, HeaderInfo, ScriptsConfig, TypeInfo};
pub use manifest::Manifest;
pub use payload::{Payload, PayloadFile};
pub use signature::VerifyKey;

use base64::Engine;
use serde::Deserialize;
use snafu::ResultExt;
use std::collections::HashMap;
use std::io::{self, Read};
use std::path::PathBuf;

/// The format version this parser understands.
pub const SUPPORTED_VERSION: i64 = 3;

#[derive(Debug, Clone)]
pub struct ParserConfig {
    /// Keys to verify `manifest.sig` against, in order. Empty disables
    /// verification entirely; non-empty makes a signature mandatory.
    pub verify_keys: Vec<VerifyKey>,
    /// Where embedded state scripts are installed.
    pub artifact_scripts_path: PathBuf,
    /// Version stamped next to installed scripts.
    pub artifact_scripts_version: u32,
}

#[derive(Debug, Deserialize)]
struct VersionDoc {
    format: String,
    version: i64,
}

/// Everything known about an artifact once the header has been read.
#[derive(Debug, Clone)]
pub struct Artifact {
    pub manifest: Manifest,
    pub header: Header,
}

impl Artifact {
    pub fn artifact_name(&self) -> &str {
        &self.header.info.artifact_provides.artifact_name
    }

    pub fn artifact_group(&self) -> Option<&str> {
        self.header.info.artifact_provides.artifact_group.as_deref()
    }

    /// The single payload's type; None means an empty payload that only
    /// updates provides.
    pub fn payload_type(&self) -> Option<&str> {
        self.header.payload_type()
    }

    pub fn compatible_devices(&self) -> &[String] {
        &self.header.info.artifact_depends.device_type
    }

    /// The full provides set this artifact will leave in the database:
    /// `artifact_name` and `artifact_group` from the header-info, plus the
    /// type-info provides.
    pub fn provides(&self) -> HashMap<String, String> {
        let mut provides = self
            .header
            .type_info
            .artifact_provides
            .clone()
            .unwrap_or_default();
        provides.insert("artifact_name".to_string(), self.artifact_name().to_string());
        if let Some(group) = self.artifact_group() {
            provides.insert("artifact_group".to_string(), group.to_string());
        }
        provides
    }

    pub fn clears_provides(&self) -> Option<&[String]> {
        self.header
            .type_info
            .clears_artifact_provides
            .as_deref()
    }
}

/// Parses an artifact stream. Section order and checksums are enforced; the
/// payload, if the artifact carries one, is handed to `with_payload` as a
/// pull iterator and its checksum is verified once the stream is done
/// (files the callback didn't consume are drained).
///
/// Returns the parsed artifact and the callback's value; the callback is
/// not invoked for empty-payload artifacts.
pub fn parse<R, T, E, F>(
    reader: R,
    config: &ParserConfig,
    with_payload: F,
) -> std::result::Result<(Artifact, Option<T>), E>
where
    R: Read,
    E: From<Error>,
    F: FnOnce(&Artifact, &mut Payload<'_, '_>) -> std::result::Result<T, E>,
{
    let mut archive = tar::Archive::new(reader);
    let mut entries = archive
        .entries()
        .context(error::TarEntrySnafu)
        .map_err(E::from)?;

    // version
    let mut entry = next_entry(&mut entries, "version").map_err(E::from)?;
    expect_name(&entry, "version").map_err(E::from)?;
    let version_raw = read_bytes(&mut entry).map_err(E::from)?;
    let version: VersionDoc =
        serde_json::from_slice(&version_raw).context(error::VersionJsonSnafu).map_err(E::from)?;
    if version.format != "mender" {
        return Err(E::from(
            error::UnsupportedFormatSnafu {
                format: version.format,
            }
            .build(),
        ));
    }
    if version.version != SUPPORTED_VERSION {
        return Err(E::from(
            error::UnsupportedVersionSnafu {
                version: version.version,
            }
            .build(),
        ));
    }

    // manifest
    let mut entry = next_entry(&mut entries, "manifest").map_err(E::from)?;
    expect_name(&entry, "manifest").map_err(E::from)?;
    let manifest_raw = read_bytes(&mut entry).map_err(E::from)?;
    let manifest = Manifest::parse(&manifest_raw).map_err(E::from)?;

    // manifest.sig (optional), then header.tar
    let mut entry =
        next_entry(&mut entries, "manifest.sig or header.tar").map_err(E::from)?;
    if header::entry_name(&entry).map_err(E::from)? == "manifest.sig" {
        let sig_raw = read_bytes(&mut entry).map_err(E::from)?;
        let sig_text = String::from_utf8_lossy(&sig_raw);
        let sig = base64::engine::general_purpose::STANDARD
            .decode(sig_text.trim())
            .context(error::SignatureDecodeSnafu)
            .map_err(E::from)?;
        if !config.verify_keys.is_empty() {
            signature::verify_signature(manifest.raw(), &sig, &config.verify_keys)
                .map_err(E::from)?;
        }
        entry = next_entry(&mut entries, "header.tar").map_err(E::from)?;
    } else if !config.verify_keys.is_empty() {
        return Err(E::from(error::MissingSignatureSnafu.build()));
    }

    // header.tar
    let name = header::entry_name(&entry).map_err(E::from)?;
    let (stripped, comp) = compression::strip_suffix(&name);
    if stripped != "header.tar" {
        return Err(E::from(
            error::UnexpectedEntrySnafu {
                name,
                expected: "header.tar",
            }
            .build(),
        ));
    }
    let expected_sum = manifest.expect("header.tar").map_err(E::from)?.to_string();
    let mut verify = verify::VerifyReader::new(&mut entry, "header.tar", &expected_sum);
    let scripts_config = ScriptsConfig {
        path: config.artifact_scripts_path.clone(),
        version: config.artifact_scripts_version,
    };
    let parsed_header = {
        let decomp = compression::wrap(&mut verify, comp).map_err(E::from)?;
        header::parse(decomp, &scripts_config).map_err(E::from)?
    };
    verify.drain_and_verify().map_err(E::from)?;

    let artifact = Artifact {
        manifest,
        header: parsed_header,
    };

    // data/0000.tar
    if artifact.payload_type().is_none() {
        verify_empty_payload(&artifact, &mut entries).map_err(E::from)?;
        return Ok((artifact, None));
    }

    let mut entry = next_entry(&mut entries, "data/0000.tar").map_err(E::from)?;
    let name = header::entry_name(&entry).map_err(E::from)?;
    let (stripped, comp) = compression::strip_suffix(&name);
    if stripped != "data/0000.tar" {
        return Err(E::from(
            error::UnexpectedEntrySnafu {
                name,
                expected: "data/0000.tar",
            }
            .build(),
        ));
    }
    let expected_sum = artifact
        .manifest
        .expect("data/0000.tar")
        .map_err(E::from)?
        .to_string();
    let mut verify = verify::VerifyReader::new(&mut entry, "data/0000.tar", &expected_sum);
    let value = {
        let decomp = compression::wrap(&mut verify, comp).map_err(E::from)?;
        let mut inner = tar::Archive::new(decomp);
        let inner_entries = inner
            .entries()
            .context(error::TarEntrySnafu)
            .map_err(E::from)?;
        let mut payload = Payload::new(inner_entries);
        let value = with_payload(&artifact, &mut payload)?;
        // Drain whatever the callback left so the checksum is complete.
        while let Some(mut file) = payload.next_file().map_err(E::from)? {
            let name = file.name.clone();
            io::copy(&mut file, &mut io::sink())
                .context(error::PayloadReadSnafu { name })
                .map_err(E::from)?;
        }
        value
    };
    verify.drain_and_verify().map_err(E::from)?;

    // Nothing may follow the single payload.
    if let Some(entry) = entries.next() {
        let entry = entry.context(error::TarEntrySnafu).map_err(E::from)?;
        let name = header::entry_name(&entry).map_err(E::from)?;
        return Err(E::from(
            error::UnexpectedEntrySnafu {
                name,
                expected: "end of artifact",
            }
            .build(),
        ));
    }

    Ok((artifact, Some(value)))
}

/// An empty-payload artifact may carry no meta-data and, if a data tar is
/// present at all, it must contain no files.
fn verify_empty_payload<'a, R: Read>(
    artifact: &Artifact,
    entries: &mut tar::Entries<'a, R>,
) -> Result<()> {
    if artifact.header.meta_data.is_some() {
        return error::EmptyPayloadMetaDataSnafu.fail();
    }

    let mut entry = match entries.next() {
        None => return Ok(()),
        Some(entry) => entry.context(error::TarEntrySnafu)?,
    };
    let name = header::entry_name(&entry)?;
    let (stripped, comp) = compression::strip_suffix(&name);
    if stripped != "data/0000.tar" {
        return error::UnexpectedEntrySnafu {
            name,
            expected: "data/0000.tar or end of artifact",
        }
        .fail();
    }

    let expected_sum = artifact.manifest.expect("data/0000.tar")?.to_string();
    let mut verify = verify::VerifyReader::new(&mut entry, "data/0000.tar", &expected_sum);
    {
        let decomp = compression::wrap(&mut verify, comp)?;
        let mut inner = tar::Archive::new(decomp);
        let mut payload = Payload::new(inner.entries().context(error::TarEntrySnafu)?);
        if payload.next_file()?.is_some() {
            return error::EmptyPayloadFilesSnafu.fail();
        }
    }
    verify.drain_and_verify()
}

fn next_entry<'a, R: Read>(
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

fn expect_name<R: Read>(entry: &tar::Entry<'_, R>, expected: &str) -> Result<()> {
    let name = header::entry_name(entry)?;
    if name != expected {
        return error::UnexpectedEntrySnafu {
            name,
            expected: expected.to_string(),
        }
        .fail();
    }
    Ok(())
}

fn read_bytes<R: Read>(entry: &mut tar::Entry<'_, R>) -> Result<Vec<u8>> {
    let mut raw = Vec::new();
    entry
        .read_to_end(&mut raw)
        .context(error::TarEntrySnafu)?;
    Ok(raw)
}
