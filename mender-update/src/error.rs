use snafu::Snafu;
use std::io;
use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(display("Failed to read config file {}: {}", path.display(), source))]
    ConfigRead { path: PathBuf, source: io::Error },

    #[snafu(display("Failed to parse config file {}: {}", path.display(), source))]
    ConfigParse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[snafu(display("ArtifactVerifyKey and ArtifactVerifyKeys are mutually exclusive"))]
    ConflictingVerifyKeys,

    #[snafu(display("Failed to read artifact verify key {}: {}", path.display(), source))]
    VerifyKeyRead { path: PathBuf, source: io::Error },

    #[snafu(display("Failed to read device type file {}: {}", path.display(), source))]
    DeviceTypeRead { path: PathBuf, source: io::Error },

    #[snafu(display("Device type file {} has no device_type entry", path.display()))]
    DeviceTypeParse { path: PathBuf },

    #[snafu(context(false))]
    #[snafu(display("{}", source))]
    Store { source: keyvalue::Error },

    #[snafu(display("Store contained unexpected content: {}", reason))]
    DatabaseValue { reason: String },

    #[snafu(display("Failed to decode state data: {}", source))]
    StateDataParse { source: serde_json::Error },

    #[snafu(display("Failed to encode state data: {}", source))]
    StateDataEncode { source: serde_json::Error },

    #[snafu(display("State data store count exceeded"))]
    StateDataStoreCountExceeded,

    #[snafu(display("Invalid clears_artifact_provides pattern '{}': {}", pattern, source))]
    ProvidesPattern {
        pattern: String,
        source: glob::PatternError,
    },

    #[snafu(context(false))]
    #[snafu(display("{}", source))]
    Artifact { source: mender_artifact::Error },

    #[snafu(context(false))]
    #[snafu(display("{}", source))]
    Module { source: update_module::Error },

    #[snafu(context(false))]
    #[snafu(display("{}", source))]
    Scripts { source: state_scripts::Error },

    #[snafu(context(false))]
    #[snafu(display("{}", source))]
    Auth { source: authclient::Error },

    #[snafu(context(false))]
    #[snafu(display("{}", source))]
    Download { source: retry_download::Error },

    #[snafu(display("Failed to send {} request to '{}': {}", method, url, source))]
    Request {
        method: String,
        url: String,
        source: reqwest::Error,
    },

    #[snafu(display("Got unexpected response [{}]: {}", status, body))]
    BadResponse { status: u16, body: String },

    #[snafu(display("Deployment aborted"))]
    DeploymentAborted,

    #[snafu(display("Unexpected deployment response: {}", reason))]
    InvalidDeploymentResponse { reason: String },

    #[snafu(display("Device has no authorization token; is mender-auth running?"))]
    NotAuthorized,

    #[snafu(display("Artifact dependency not satisfied: {}", reason))]
    DependsMismatch { reason: String },

    #[snafu(display("Inventory generator '{}' failed: {}", path.display(), source))]
    InventoryGenerator { path: PathBuf, source: io::Error },

    #[snafu(display("Failed to access deployment log '{}': {}", path.display(), source))]
    DeploymentLogFile { path: PathBuf, source: io::Error },

    #[snafu(display("Failed to check free space for log files: {}", source))]
    LogFreeSpace { source: nix::errno::Errno },

    #[snafu(display("Logger setup error: {}", source))]
    Logger { source: log::SetLoggerError },

    #[snafu(display("IO error on '{}': {}", path.display(), source))]
    Io { path: PathBuf, source: io::Error },

    #[snafu(display("Unable to create a tokio runtime: {}", source))]
    Runtime { source: io::Error },

    #[snafu(display("Update module requested a reboot to proceed"))]
    RebootRequired,

    #[snafu(display("`reboot` command did not kill us; rebooting failed"))]
    RebootFailed,

    #[snafu(display("No update in progress"))]
    NoUpdateInProgress,

    #[snafu(display("An update is already in progress; commit or roll back first"))]
    UpdateAlreadyInProgress,

    #[snafu(display("Update module supports no rollback"))]
    NoRollbackSupport,

    #[snafu(display("State machine invariant violated: {}", reason))]
    Programming { reason: String },

    #[snafu(display("Download was aborted"))]
    DownloadAborted,
}

/// CLI exit codes. `0` is success, `1` any generic failure.
pub fn exit_status(err: &Error) -> i32 {
    match err {
        Error::NoUpdateInProgress => 2,
        Error::RebootRequired => 4,
        _ => 1,
    }
}
