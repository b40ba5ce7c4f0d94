/*!
# Background

The agent persists small pieces of state -- the installed artifact's
provides, in-flight deployment state, standalone install progress -- as
key/value pairs that must survive reboots and power cuts at any point.

This library provides a transactional `string -> bytes` store backed by a
single JSON file. The whole store is kept in memory; a write transaction
mutates a scratch copy and the file is atomically replaced (tempfile +
rename + fsync) before the scratch copy becomes live. An error returned
from the transaction closure rolls everything back.

A store file that exists but cannot be parsed is moved aside with a
`-broken` suffix and a fresh store is started, so a corrupted file can
never wedge the agent. The rename target is overwritten if present, which
keeps this a one-shot recovery rather than a rename loop.

Concurrent access to the same file from multiple processes is not
supported; each daemon uses its own database file.
*/

pub mod error;

pub use error::{Error, Result};

use base64::Engine;
use log::warn;
use snafu::ResultExt;
use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

/// A handle on the data visible inside a transaction. Reads see earlier
/// writes made through the same handle.
pub struct Transaction<'a> {
    data: &'a mut HashMap<String, Vec<u8>>,
}

impl Transaction<'_> {
    pub fn read(&self, key: &str) -> Result<Vec<u8>> {
        self.data
            .get(key)
            .cloned()
            .ok_or_else(|| Error::KeyNotFound { key: key.into() })
    }

    pub fn write<S: Into<String>>(&mut self, key: S, value: &[u8]) -> Result<()> {
        self.data.insert(key.into(), value.to_vec());
        Ok(())
    }

    /// Removes the given key. A missing key is not an error.
    pub fn remove(&mut self, key: &str) -> Result<()> {
        self.data.remove(key);
        Ok(())
    }
}

pub struct Database {
    path: PathBuf,
    live: HashMap<String, Vec<u8>>,
}

impl Database {
    /// Opens the store file at `path`, creating an empty store if the file
    /// doesn't exist. An unreadable file is renamed with a `-broken` suffix
    /// and replaced with an empty store.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let live = match fs::read(&path) {
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(Error::StoreRead { path, source: e }),
            Ok(raw) => match decode_store(&raw) {
                Some(map) => map,
                None => {
                    let broken = broken_path(&path);
                    warn!(
                        "Store file '{}' is unreadable, moving it to '{}' and starting fresh",
                        path.display(),
                        broken.display()
                    );
                    fs::rename(&path, &broken).context(error::BrokenRenameSnafu { path: &path })?;
                    HashMap::new()
                }
            },
        };

        Ok(Self { path, live })
    }

    pub fn read(&self, key: &str) -> Result<Vec<u8>> {
        self.live
            .get(key)
            .cloned()
            .ok_or_else(|| Error::KeyNotFound { key: key.into() })
    }

    pub fn write(&mut self, key: &str, value: &[u8]) -> Result<()> {
        self.write_transaction(|txn| txn.write(key, value))
    }

    /// Removes the given key. A missing key is not an error.
    pub fn remove(&mut self, key: &str) -> Result<()> {
        self.write_transaction(|txn| txn.remove(key))
    }

    /// Runs `txn_fn` against a scratch copy of the store. If it returns
    /// `Ok`, the scratch copy is committed durably to disk before this
    /// function returns; on `Err` nothing is changed.
    ///
    /// The closure's error type only needs a `From<Error>` conversion so
    /// callers can combine store errors with their own using `?`.
    pub fn write_transaction<T, E, F>(&mut self, txn_fn: F) -> std::result::Result<T, E>
    where
        F: FnOnce(&mut Transaction<'_>) -> std::result::Result<T, E>,
        E: From<Error>,
    {
        let mut scratch = self.live.clone();
        let value = txn_fn(&mut Transaction { data: &mut scratch })?;
        self.persist(&scratch)?;
        self.live = scratch;
        Ok(value)
    }

    /// Runs `txn_fn` with read access to a stable snapshot of the store.
    pub fn read_transaction<T, E, F>(&self, txn_fn: F) -> std::result::Result<T, E>
    where
        F: FnOnce(&Transaction<'_>) -> std::result::Result<T, E>,
        E: From<Error>,
    {
        let mut snapshot = self.live.clone();
        txn_fn(&Transaction {
            data: &mut snapshot,
        })
    }

    /// Atomically replaces the store file with the given contents. The
    /// tempfile is written and synced in the store's directory, renamed
    /// over the store file, and the directory is synced so the rename is
    /// durable.
    fn persist(&self, data: &HashMap<String, Vec<u8>>) -> Result<()> {
        let dir = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));

        let encoded: BTreeMap<&String, String> = data
            .iter()
            .map(|(k, v)| (k, base64::engine::general_purpose::STANDARD.encode(v)))
            .collect();

        let tempfile = NamedTempFile::new_in(&dir).context(error::CreateTempfileSnafu)?;
        serde_json::to_writer(&tempfile, &encoded).context(error::SerializeSnafu)?;
        tempfile
            .as_file()
            .sync_all()
            .context(error::StoreWriteSnafu { path: &self.path })?;
        tempfile
            .persist(&self.path)
            .context(error::StorePersistSnafu { path: &self.path })?;

        File::open(&dir)
            .and_then(|d| d.sync_all())
            .context(error::DirSyncSnafu { path: &dir })?;
        Ok(())
    }
}

fn broken_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push("-broken");
    PathBuf::from(name)
}

/// Decodes the on-disk JSON object into the live map, returning None on any
/// shape we don't recognize.
fn decode_store(raw: &[u8]) -> Option<HashMap<String, Vec<u8>>> {
    let parsed: BTreeMap<String, String> = serde_json::from_slice(raw).ok()?;
    let mut map = HashMap::new();
    for (k, v) in parsed {
        let bytes = base64::engine::general_purpose::STANDARD.decode(v).ok()?;
        map.insert(k, bytes);
    }
    Some(map)
}
