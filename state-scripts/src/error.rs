use snafu::Snafu;
use std::io;
use std::path::PathBuf;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(display("Failed to list scripts in '{}': {}", path.display(), source))]
    ListScripts { path: PathBuf, source: io::Error },

    #[snafu(display("Failed to read script version file '{}': {}", path.display(), source))]
    VersionFileRead { path: PathBuf, source: io::Error },

    #[snafu(display("Unexpected artifact script version found: {}", version))]
    VersionFile { version: String },

    #[snafu(display("Failed to start script '{}': {}", script.display(), source))]
    ScriptStart { script: PathBuf, source: io::Error },

    #[snafu(display("Failed to wait for script '{}': {}", script.display(), source))]
    ScriptWait { script: PathBuf, source: io::Error },

    #[snafu(display("Script '{}' requested retry (exit code {})", script.display(), code))]
    RetryExitCode { script: PathBuf, code: i32 },

    #[snafu(display("Script '{}' exited with error code {}", script.display(), code))]
    NonZeroExitStatus { script: PathBuf, code: i32 },

    #[snafu(display("Script '{}' timed out and was killed", script.display()))]
    Timeout { script: PathBuf },

    #[snafu(display("State script(s) failed: {}", details))]
    ScriptsFailed { details: String },
}

pub type Result<T> = std::result::Result<T, Error>;
