use snafu::Snafu;
use std::io;
use std::path::PathBuf;

/// Possible errors from store operations.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(display("Key '{}' not found in store", key))]
    KeyNotFound { key: String },

    #[snafu(display("Failed to read store file '{}': {}", path.display(), source))]
    StoreRead { path: PathBuf, source: io::Error },

    #[snafu(display("Failed to rename unreadable store file '{}': {}", path.display(), source))]
    BrokenRename { path: PathBuf, source: io::Error },

    #[snafu(display("Failed to create tempfile for writing store: {}", source))]
    CreateTempfile { source: io::Error },

    #[snafu(display("Failed to serialize store contents: {}", source))]
    Serialize { source: serde_json::Error },

    #[snafu(display("Failed to write store file '{}': {}", path.display(), source))]
    StoreWrite { path: PathBuf, source: io::Error },

    #[snafu(display("Failed to replace store file '{}': {}", path.display(), source))]
    StorePersist {
        path: PathBuf,
        source: tempfile::PersistError,
    },

    #[snafu(display("Failed to sync store directory '{}': {}", path.display(), source))]
    DirSync { path: PathBuf, source: io::Error },

    #[snafu(display("Store file '{}' has no parent directory", path.display()))]
    NoParentDir { path: PathBuf },
}

pub type Result<T> = std::result::Result<T, Error>;
