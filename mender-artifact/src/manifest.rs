//! The artifact manifest: one `<sha256>  <path>` line per stored file.
//! Compression suffixes are stripped from paths on parse, so lookups use the
//! uncompressed name regardless of how the artifact was packed.

use crate::compression;
use crate::error::{self, Error, Result};
use regex::Regex;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

const LINE_PATTERN: &str = r"^([0-9a-z]{64})\s{2}([^\s]+)$";

#[derive(Debug, Clone)]
pub struct Manifest {
    entries: BTreeMap<String, String>,
    // SHA-256 over the raw manifest bytes; the manifest signature signs
    // these bytes.
    shasum: [u8; 32],
    raw: Vec<u8>,
}

impl Manifest {
    pub fn parse(raw: &[u8]) -> Result<Self> {
        let pattern = Regex::new(LINE_PATTERN).expect("static regex");
        let text = String::from_utf8_lossy(raw);

        let mut entries = BTreeMap::new();
        for line in text.split('\n') {
            // The terminator on the last line is optional.
            if line.is_empty() {
                continue;
            }
            let captures = pattern
                .captures(line)
                .ok_or_else(|| Error::ManifestLine {
                    line: line.to_string(),
                    pattern: LINE_PATTERN.to_string(),
                })?;
            let sum = captures.get(1).expect("group 1").as_str().to_string();
            let path = captures.get(2).expect("group 2").as_str();
            entries.insert(compression::strip_suffix(path).0.to_string(), sum);
        }

        let mut hasher = Sha256::new();
        hasher.update(raw);

        Ok(Self {
            entries,
            shasum: hasher.finalize().into(),
            raw: raw.to_vec(),
        })
    }

    /// Looks up the checksum recorded for a (suffix-stripped) path.
    pub fn get(&self, path: &str) -> Option<&str> {
        self.entries.get(path).map(String::as_str)
    }

    pub fn expect(&self, path: &str) -> Result<&str> {
        self.get(path).ok_or_else(|| {
            error::ManifestEntryMissingSnafu {
                path: path.to_string(),
            }
            .build()
        })
    }

    pub fn shasum(&self) -> &[u8; 32] {
        &self.shasum
    }

    /// The manifest exactly as stored in the artifact; signatures are
    /// computed over these bytes.
    pub fn raw(&self) -> &[u8] {
        &self.raw
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const SUM_A: &str = "aec070645fe53ee3b3763059376134f058cc337247c978add178b6ccdfb0019f";
    const SUM_B: &str = "9f65db081a46f7832b9767c56afcc7bfe784f0a62cc2950b6375b2b6390e6e50";
    const SUM_C: &str = "96bcd965947569404798bcbdb614f103db5a004eb6e364cfc162c146890ea35b";

    #[test]
    fn parses_a_manifest() {
        let data = format!(
            "{}  data/0000.tar\n{}  header.tar\n{}  version\n",
            SUM_A, SUM_B, SUM_C
        );
        let manifest = Manifest::parse(data.as_bytes()).unwrap();
        assert_eq!(manifest.get("version"), Some(SUM_C));
        assert_eq!(manifest.get("header.tar"), Some(SUM_B));
        assert_eq!(manifest.get("data/0000.tar"), Some(SUM_A));
        assert_eq!(manifest.get("i-do-not-exist"), None);
    }

    #[test]
    fn missing_terminator_is_accepted() {
        let data = format!("{}  version", SUM_C);
        let manifest = Manifest::parse(data.as_bytes()).unwrap();
        assert_eq!(manifest.get("version"), Some(SUM_C));
    }

    #[test]
    fn compression_suffixes_are_stripped() {
        let data = format!("{}  header.tar.gz\n{}  data/0000.tar.zst\n", SUM_A, SUM_B);
        let manifest = Manifest::parse(data.as_bytes()).unwrap();
        assert_eq!(manifest.get("header.tar"), Some(SUM_A));
        assert_eq!(manifest.get("data/0000.tar"), Some(SUM_B));
        assert_eq!(manifest.get("header.tar.gz"), None);
    }

    #[test]
    fn short_checksum_is_rejected_and_quoted() {
        let line = "aec070645fe53ee3b3763059376134f058cc337247c978add178b6ccdfb001  data/0000.tar";
        let err = Manifest::parse(format!("{}\n", line).as_bytes()).unwrap_err();
        match err {
            Error::ManifestLine { line: quoted, .. } => assert_eq!(quoted, line),
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn missing_path_is_rejected() {
        let err = Manifest::parse(format!("{}\n", SUM_C).as_bytes()).unwrap_err();
        assert!(matches!(err, Error::ManifestLine { .. }));
    }

    #[test]
    fn extra_whitespace_is_rejected() {
        // Three spaces instead of two.
        let err = Manifest::parse(format!("{}   version\n", SUM_C).as_bytes()).unwrap_err();
        assert!(matches!(err, Error::ManifestLine { .. }));

        // A space inside the path.
        let err = Manifest::parse(format!("{}  data/00 00.tar\n", SUM_A).as_bytes()).unwrap_err();
        assert!(matches!(err, Error::ManifestLine { .. }));
    }

    #[test]
    fn uppercase_hex_is_rejected() {
        let err = Manifest::parse(
            format!("{}  version\n", SUM_C.to_uppercase()).as_bytes(),
        )
        .unwrap_err();
        assert!(matches!(err, Error::ManifestLine { .. }));
    }

    #[test]
    fn shasum_covers_the_raw_bytes() {
        let data = format!("{}  version\n", SUM_C);
        let manifest = Manifest::parse(data.as_bytes()).unwrap();
        let mut hasher = Sha256::new();
        hasher.update(data.as_bytes());
        let expected: [u8; 32] = hasher.finalize().into();
        assert_eq!(manifest.shasum(), &expected);
        assert_eq!(manifest.raw(), data.as_bytes());
    }
}
