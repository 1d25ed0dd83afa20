//! Content digests used to detect corruption across a transfer.
//!
//! A digest is captured when a document is enqueued and compared against the
//! digest of the destination copy after it has been re-fetched. The value
//! returned by an adapter's `put` is never trusted on its own.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

use crate::error::MigrationError;

const PREFIX: &str = "sha256:";

/// SHA-256 fingerprint of a document body.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ContentDigest([u8; 32]);

impl ContentDigest {
    /// Digest of `content`.
    pub fn of(content: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(content);
        Self(hasher.finalize().into())
    }

    /// Raw digest bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Lowercase hex without the `sha256:` prefix.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse either the prefixed (`sha256:<hex>`) or the bare hex form.
    pub fn parse(raw: &str) -> Result<Self, MigrationError> {
        let trimmed = raw.trim();
        let hex_part = trimmed.strip_prefix(PREFIX).unwrap_or(trimmed);
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(hex_part, &mut bytes).map_err(|e| {
            MigrationError::Internal(format!("invalid content digest {raw:?}: {e}"))
        })?;
        Ok(Self(bytes))
    }
}

impl fmt::Display for ContentDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{PREFIX}{}", self.to_hex())
    }
}

impl fmt::Debug for ContentDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentDigest({self})")
    }
}

impl FromStr for ContentDigest {
    type Err = MigrationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for ContentDigest {
    type Error = MigrationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<ContentDigest> for String {
    fn from(value: ContentDigest) -> Self {
        value.to_string()
    }
}

/// Outcome of comparing a source body against its destination copy.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationResult {
    /// Whether the digests agree.
    pub matched: bool,
    /// Digest recorded at enqueue time.
    pub source_digest: ContentDigest,
    /// Digest of the destination copy.
    pub dest_digest: ContentDigest,
    /// Absolute difference in body length.
    pub bytes_diff: usize,
}

impl ValidationResult {
    /// The destination digest, or `ContentMismatch`.
    pub fn into_result(self) -> Result<ContentDigest, MigrationError> {
        if self.matched {
            Ok(self.dest_digest)
        } else {
            Err(MigrationError::ContentMismatch {
                expected: self.source_digest.to_string(),
                actual: self.dest_digest.to_string(),
            })
        }
    }
}

/// Compare the digest recorded at enqueue time against a re-fetched
/// destination body.
pub fn validate(expected: ContentDigest, dest_content: &[u8], source_len: usize) -> ValidationResult {
    let dest_digest = ContentDigest::of(dest_content);
    ValidationResult {
        matched: expected == dest_digest,
        source_digest: expected,
        dest_digest,
        bytes_diff: source_len.abs_diff(dest_content.len()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_matches_known_vector() {
        let digest = ContentDigest::of(b"abc");
        assert_eq!(
            digest.to_hex(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert!(digest.to_string().starts_with("sha256:"));
    }

    #[test]
    fn parse_accepts_bare_and_prefixed_forms() {
        let digest = ContentDigest::of(b"hello");
        let bare: ContentDigest = digest.to_hex().parse().expect("bare hex");
        let prefixed: ContentDigest = digest.to_string().parse().expect("prefixed");
        assert_eq!(bare, digest);
        assert_eq!(prefixed, digest);
    }

    #[test]
    fn parse_rejects_short_hex() {
        assert!(ContentDigest::parse("sha256:abcd").is_err());
    }

    #[test]
    fn validation_detects_single_byte_corruption() {
        let expected = ContentDigest::of(b"document body");
        let result = validate(expected, b"document bodY", 13);
        assert!(!result.matched);
        assert_eq!(result.bytes_diff, 0);
        assert!(matches!(
            result.into_result(),
            Err(MigrationError::ContentMismatch { .. })
        ));
    }

    #[test]
    fn validation_reports_length_difference() {
        let expected = ContentDigest::of(b"short");
        let result = validate(expected, b"a little longer", 5);
        assert_eq!(result.bytes_diff, 10);
    }
}
