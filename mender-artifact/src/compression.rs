//! Transport compression of the nested tars. Gzip is what the artifact
//! builder emits in practice and what we decode; the other recognized
//! suffixes still strip for manifest lookups but fail with a dedicated
//! error when a stream actually uses them.

use crate::error::{self, Result};
use flate2::read::GzDecoder;
use std::io::Read;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    None,
    Gzip,
    Xz,
    Zstd,
}

/// Splits a recognized compression suffix off `path`, returning the
/// stripped path and the compression it implies.
pub fn strip_suffix(path: &str) -> (&str, Compression) {
    for (suffix, compression) in [
        (".gz", Compression::Gzip),
        (".xz", Compression::Xz),
        (".zst", Compression::Zstd),
    ] {
        if let Some(stripped) = path.strip_suffix(suffix) {
            return (stripped, compression);
        }
    }
    (path, Compression::None)
}

/// Wraps `reader` in the decoder the suffix calls for.
pub fn wrap<'a, R: Read + 'a>(reader: R, compression: Compression) -> Result<Box<dyn Read + 'a>> {
    match compression {
        Compression::None => Ok(Box::new(reader)),
        Compression::Gzip => Ok(Box::new(GzDecoder::new(reader))),
        Compression::Xz => error::UnsupportedCompressionSnafu { suffix: ".xz" }.fail(),
        Compression::Zstd => error::UnsupportedCompressionSnafu { suffix: ".zst" }.fail(),
    }
}
