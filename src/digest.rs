use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use std::{fmt, fs, path::Path, path::PathBuf};

/// A content digest, e.g. `sha256:3cb500ed...`.
///
/// The textual form is an algorithm name and a hex (or more generally
/// base64url-ish) payload joined by a single colon, per the descriptor rules
/// of the OCI image specification. Parsing enforces that shape; digests that
/// compare equal are byte-equal strings.
///
/// stamp only ever *produces* sha256 digests, but will parse any well-formed
/// digest found in an existing image.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Digest {
    pub algorithm: String,
    pub encoded: String,
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.encoded)
    }
}

impl Serialize for Digest {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        Self::new(&text).map_err(serde::de::Error::custom)
    }
}

impl Digest {
    pub fn new(input: &str) -> Result<Self> {
        let mut iter = input.split(':');
        match (iter.next(), iter.next(), iter.next()) {
            (Some(algorithm), Some(encoded), None) if !algorithm.is_empty() && !encoded.is_empty() => {
                let algorithm_ok = algorithm
                    .chars()
                    .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || "+._-".contains(c));
                let encoded_ok = encoded
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || "=_-".contains(c));
                if algorithm_ok && encoded_ok {
                    Ok(Digest {
                        algorithm: algorithm.to_string(),
                        encoded: encoded.to_string(),
                    })
                } else {
                    Err(Error::InvalidDigest(input.to_string()))
                }
            }
            _ => Err(Error::InvalidDigest(input.to_string())),
        }
    }

    /// As a path relative to a blob store root, e.g. `blobs/sha256/<hex>`.
    pub fn as_blob_path(&self) -> PathBuf {
        PathBuf::from(format!("blobs/{}/{}", self.algorithm, self.encoded))
    }

    /// As a bare `<algorithm>/<hex>` path fraction, used by diff forests.
    pub fn as_path_fraction(&self) -> PathBuf {
        PathBuf::from(format!("{}/{}", self.algorithm, self.encoded))
    }

    /// Calc digest using SHA-256 algorithm
    pub fn from_buf_sha256(buf: &[u8]) -> Self {
        let hash = Sha256::digest(buf);
        Self::from_sha256_hash(&hash)
    }

    pub(crate) fn from_sha256_hash(hash: &[u8]) -> Self {
        Self {
            algorithm: "sha256".to_string(),
            encoded: base16ct::lower::encode_string(hash),
        }
    }

    /// Read a digest file as written by [`Digest::write_to_file`].
    pub fn read_from_file(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        Self::new(contents.trim())
    }

    /// Write this digest as the sole content of `path`.
    pub fn write_to_file(&self, path: &Path) -> Result<()> {
        fs::write(path, self.to_string())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_display() {
        let digest = Digest::new("sha256:0123abcd").unwrap();
        assert_eq!(digest.algorithm, "sha256");
        assert_eq!(digest.encoded, "0123abcd");
        assert_eq!(digest.to_string(), "sha256:0123abcd");
        assert_eq!(digest.as_blob_path(), PathBuf::from("blobs/sha256/0123abcd"));
        assert_eq!(digest.as_path_fraction(), PathBuf::from("sha256/0123abcd"));
    }

    #[test]
    fn reject_malformed() {
        assert!(Digest::new("sha256").is_err());
        assert!(Digest::new("sha256:").is_err());
        assert!(Digest::new("sha256:ab:cd").is_err());
        assert!(Digest::new("sha256:white space").is_err());
    }

    #[test]
    fn sha256_of_buffer() {
        let digest = Digest::from_buf_sha256(b"");
        assert_eq!(
            digest.to_string(),
            "sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855",
        );
    }

    #[test]
    fn digest_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("digest");
        let digest = Digest::from_buf_sha256(b"hello");
        digest.write_to_file(&path).unwrap();
        assert_eq!(Digest::read_from_file(&path).unwrap(), digest);
    }
}
