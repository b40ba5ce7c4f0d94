//! The single `data/0000.tar` payload: a pull iterator over the files the
//! update module will install.

use crate::error::{self, Result};
use crate::header::entry_name;
use snafu::ResultExt;
use std::io::{self, Read};

/// Reads payload files out of the (decompressed, checksum-wrapped) data
/// tar. Files must be consumed in order; the next call invalidates the
/// previous file's reader.
pub struct Payload<'a, 'r> {
    entries: tar::Entries<'a, Box<dyn Read + 'r>>,
    files_yielded: usize,
}

impl<'a, 'r> Payload<'a, 'r> {
    pub(crate) fn new(entries: tar::Entries<'a, Box<dyn Read + 'r>>) -> Self {
        Self {
            entries,
            files_yielded: 0,
        }
    }

    /// Yields the next payload file, or None at the end of the payload.
    pub fn next_file(&mut self) -> Result<Option<PayloadFile<'a, 'r>>> {
        for entry in self.entries.by_ref() {
            let entry = entry.context(error::TarEntrySnafu)?;
            // Directories and other special entries carry no payload data.
            if !entry.header().entry_type().is_file() {
                continue;
            }
            let name = entry_name(&entry)?;
            let size = entry.header().size().context(error::TarEntrySnafu)?;
            self.files_yielded += 1;
            return Ok(Some(PayloadFile { name, size, entry }));
        }
        Ok(None)
    }

    pub fn files_yielded(&self) -> usize {
        self.files_yielded
    }
}

pub struct PayloadFile<'a, 'r> {
    pub name: String,
    pub size: u64,
    entry: tar::Entry<'a, Box<dyn Read + 'r>>,
}

impl Read for PayloadFile<'_, '_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.entry.read(buf)
    }
}
