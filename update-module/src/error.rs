use snafu::Snafu;
use std::io;
use std::path::PathBuf;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(display("Update module '{}' not found", path.display()))]
    ModuleNotFound { path: PathBuf },

    #[snafu(display("{}: failed to start update module '{}': {}", state, path.display(), source))]
    ModuleStart {
        state: String,
        path: PathBuf,
        source: io::Error,
    },

    #[snafu(display("{}: failed to wait for update module: {}", state, source))]
    ModuleWait { state: String, source: io::Error },

    #[snafu(display("{}: update module returned non-zero status: {}", state, code))]
    NonZeroExit { state: String, code: i32 },

    #[snafu(display("{}: update module process timed out", state))]
    Timeout { state: String },

    #[snafu(display("Too many lines when querying {}", state))]
    TooManyLines { state: String },

    #[snafu(display("Unexpected output from the process for {} state: '{}'", state, output))]
    UnexpectedOutput { state: String, output: String },

    #[snafu(display("{}: file tree does not exist: {}", state, path.display()))]
    FileTreeMissing { state: String, path: PathBuf },

    #[snafu(display("Failed to create directory '{}': {}", path.display(), source))]
    DirCreate { path: PathBuf, source: io::Error },

    #[snafu(display("Failed to remove directory '{}': {}", path.display(), source))]
    DirRemove { path: PathBuf, source: io::Error },

    #[snafu(display("Failed to write file tree entry '{}': {}", path.display(), source))]
    TreeWrite { path: PathBuf, source: io::Error },

    #[snafu(display("Failed to sync file tree '{}': {}", path.display(), source))]
    TreeSync { path: PathBuf, source: io::Error },

    #[snafu(display("Failed to create named pipe '{}': {}", path.display(), source))]
    Fifo {
        path: PathBuf,
        source: nix::errno::Errno,
    },

    #[snafu(display("Failed to open named pipe '{}': {}", path.display(), source))]
    FifoOpen { path: PathBuf, source: io::Error },

    #[snafu(display("Failed to write payload stream '{}': {}", path.display(), source))]
    StreamWrite { path: PathBuf, source: io::Error },

    #[snafu(display("Failed to stage payload file '{}': {}", path.display(), source))]
    FileStage { path: PathBuf, source: io::Error },

    #[snafu(display("Download: update module started downloading, but did not finish"))]
    DownloadIncomplete,

    #[snafu(display("Download was aborted"))]
    Aborted,

    #[snafu(context(false))]
    #[snafu(display("{}", source))]
    Artifact { source: mender_artifact::Error },
}

pub type Result<T> = std::result::Result<T, Error>;
