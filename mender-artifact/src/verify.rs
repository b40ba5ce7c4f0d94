//! A `Read` wrapper that digests everything passing through it and compares
//! the result with the manifest's checksum at end of stream.

use crate::error::{self, Result};
use sha2::{Digest, Sha256};
use snafu::ResultExt;
use std::io::{self, Read};

pub struct VerifyReader<R: Read> {
    inner: R,
    hasher: Sha256,
    expected: String,
    path: String,
}

impl<R: Read> VerifyReader<R> {
    /// `expected` is the lowercase hex checksum from the manifest entry for
    /// `path` (the suffix-stripped name, used in error messages).
    pub fn new(inner: R, path: &str, expected: &str) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            expected: expected.to_string(),
            path: path.to_string(),
        }
    }

    /// Consumes any bytes left in the stream and checks the digest. Must be
    /// called once the consumer is done; stopping short of EOF would leave
    /// the digest incomplete.
    pub fn drain_and_verify(mut self) -> Result<()> {
        let mut buf = [0u8; 8192];
        loop {
            let n = self
                .inner
                .read(&mut buf)
                .context(error::PayloadReadSnafu {
                    name: self.path.as_str(),
                })?;
            if n == 0 {
                break;
            }
            self.hasher.update(&buf[..n]);
        }

        let computed = hex::encode(self.hasher.finalize());
        if computed != self.expected {
            return error::IntegritySnafu {
                path: self.path,
                expected: self.expected,
                computed,
            }
            .fail();
        }
        Ok(())
    }
}

impl<R: Read> Read for VerifyReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.hasher.update(&buf[..n]);
        Ok(n)
    }
}
