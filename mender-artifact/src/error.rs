use snafu::Snafu;
use std::io;
use std::path::PathBuf;

/// Possible errors from reading an artifact. Everything here is fatal to
/// the deployment that triggered the read.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(display("Failed to read tar entry: {}", source))]
    TarEntry { source: io::Error },

    #[snafu(display("Got unexpected entry '{}', expected {}", name, expected))]
    UnexpectedEntry { name: String, expected: String },

    #[snafu(display("Artifact ended early, expected {}", expected))]
    MissingEntry { expected: String },

    #[snafu(display("Failed to parse the version header: {}", source))]
    VersionJson { source: serde_json::Error },

    #[snafu(display("Unsupported artifact format '{}'", format))]
    UnsupportedFormat { format: String },

    #[snafu(display("Unsupported artifact version {}", version))]
    UnsupportedVersion { version: i64 },

    #[snafu(display(
        "Line ({}) is not in the expected manifest format: {}",
        line,
        pattern
    ))]
    ManifestLine { line: String, pattern: String },

    #[snafu(display("Manifest has no entry for '{}'", path))]
    ManifestEntryMissing { path: String },

    #[snafu(display(
        "Integrity error: checksum of '{}' is {}, expected {}",
        path,
        computed,
        expected
    ))]
    Integrity {
        path: String,
        expected: String,
        computed: String,
    },

    #[snafu(display("Failed to decode manifest signature: {}", source))]
    SignatureDecode { source: base64::DecodeError },

    #[snafu(display("Failed to parse verification key: {}", reason))]
    KeyParse { reason: String },

    #[snafu(display(
        "Failed to verify the manifest signature ({} key(s) tried)",
        keys_tried
    ))]
    SignatureVerification { keys_tried: usize },

    #[snafu(display("Artifact is not signed, but verification keys are configured"))]
    MissingSignature,

    #[snafu(display("Failed to parse header-info: {}", source))]
    HeaderInfoJson { source: serde_json::Error },

    #[snafu(display("Failed to parse type-info: {}", source))]
    TypeInfoJson { source: serde_json::Error },

    #[snafu(display("Failed to parse meta-data: {}", source))]
    MetaDataJson { source: serde_json::Error },

    #[snafu(display("Artifact declares {} payloads, only one is supported", count))]
    MultiplePayloads { count: usize },

    #[snafu(display("Unexpected header index in '{}', expected headers/0000", name))]
    HeaderIndex { name: String },

    #[snafu(display("Empty payload artifacts cannot contain a meta-data section"))]
    EmptyPayloadMetaData,

    #[snafu(display("Empty payload artifacts cannot have payload files"))]
    EmptyPayloadFiles,

    #[snafu(display("Unsupported compression suffix '{}'", suffix))]
    UnsupportedCompression { suffix: String },

    #[snafu(display("Failed to create scripts directory '{}': {}", path.display(), source))]
    ScriptsDirCreate { path: PathBuf, source: io::Error },

    #[snafu(display("Failed to install artifact script '{}': {}", path.display(), source))]
    ScriptWrite { path: PathBuf, source: io::Error },

    #[snafu(display("Failed to sync scripts directory '{}': {}", path.display(), source))]
    ScriptsSync { path: PathBuf, source: io::Error },

    #[snafu(display("Failed to read payload file '{}': {}", name, source))]
    PayloadRead { name: String, source: io::Error },
}

pub type Result<T> = std::result::Result<T, Error>;
