//! Content digest types for artifact identity.
//!
//! Provides a validated SHA-256 digest newtype plus streaming digest
//! computation over files, so downstream stages never need a second
//! full-file read for basic integrity.

use camino::Utf8Path;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256, Sha512};
use std::fmt;
use std::io::Read;

/// Expected length of a hex-encoded SHA-256 digest.
const SHA256_HEX_LEN: usize = 64;

/// Expected length of a hex-encoded SHA-512 digest.
const SHA512_HEX_LEN: usize = 128;

/// Buffer size for streaming digest computation.
const DIGEST_BUF_LEN: usize = 64 * 1024;

/// Digest algorithms a catalog entry may declare for a content-hash claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DigestAlgorithm {
    /// SHA-256, also the pipeline's canonical digest.
    Sha256,
    /// SHA-512.
    Sha512,
}

impl DigestAlgorithm {
    /// Expected hex string length for this algorithm.
    #[must_use]
    pub fn hex_len(self) -> usize {
        match self {
            Self::Sha256 => SHA256_HEX_LEN,
            Self::Sha512 => SHA512_HEX_LEN,
        }
    }
}

impl fmt::Display for DigestAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sha256 => write!(f, "sha256"),
            Self::Sha512 => write!(f, "sha512"),
        }
    }
}

/// Errors arising from digest validation.
#[derive(Debug, thiserror::Error)]
pub enum DigestError {
    /// The supplied value is not a well-formed hex digest.
    #[error("invalid {algorithm} digest: {reason}")]
    Invalid {
        /// The algorithm the value was declared as.
        algorithm: DigestAlgorithm,
        /// Description of the malformation.
        reason: String,
    },
}

/// A validated, lowercase hex-encoded SHA-256 digest.
///
/// Values are normalized to lowercase on construction so comparisons are
/// byte-for-byte without case pitfalls.
///
/// # Examples
///
/// ```
/// use packferry::digest::Sha256Digest;
///
/// let digest = Sha256Digest::try_from("AB".repeat(32))?;
/// assert_eq!(digest.as_str(), "ab".repeat(32));
/// # Ok::<(), packferry::digest::DigestError>(())
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct Sha256Digest(String);

impl Sha256Digest {
    /// Return the digest as a lowercase hex string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Consume the wrapper and return the inner string.
    #[must_use]
    pub fn into_inner(self) -> String {
        self.0
    }

    /// Compute the SHA-256 digest of an in-memory byte slice.
    ///
    /// # Examples
    ///
    /// ```
    /// use packferry::digest::Sha256Digest;
    ///
    /// let digest = Sha256Digest::of_bytes(b"hello world");
    /// assert!(digest.as_str().starts_with("b94d27b9"));
    /// ```
    #[must_use]
    pub fn of_bytes(bytes: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        Self(hex_encode(&hasher.finalize()))
    }
}

impl TryFrom<&str> for Sha256Digest {
    type Error = DigestError;

    fn try_from(value: &str) -> Result<Self, DigestError> {
        validate_hex(value, DigestAlgorithm::Sha256)?;
        Ok(Self(value.to_ascii_lowercase()))
    }
}

impl TryFrom<String> for Sha256Digest {
    type Error = DigestError;

    fn try_from(value: String) -> Result<Self, DigestError> {
        validate_hex(&value, DigestAlgorithm::Sha256)?;
        Ok(Self(value.to_ascii_lowercase()))
    }
}

impl AsRef<str> for Sha256Digest {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Sha256Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Validate that `value` is well-formed hex of the algorithm's length.
pub fn validate_hex(value: &str, algorithm: DigestAlgorithm) -> Result<(), DigestError> {
    if value.len() != algorithm.hex_len() {
        return Err(DigestError::Invalid {
            algorithm,
            reason: format!(
                "expected {} hex characters, got {}",
                algorithm.hex_len(),
                value.len()
            ),
        });
    }
    if let Some(bad) = value.chars().find(|c| !c.is_ascii_hexdigit()) {
        return Err(DigestError::Invalid {
            algorithm,
            reason: format!("non-hex character '{bad}'"),
        });
    }
    Ok(())
}

/// Finalize an in-progress SHA-256 hasher into a digest.
pub(crate) fn sha256_from_hasher(hasher: Sha256) -> Sha256Digest {
    Sha256Digest(hex_encode(&hasher.finalize()))
}

/// Stream a file through SHA-256 and return the validated digest.
pub fn sha256_of_file(path: &Utf8Path) -> std::io::Result<Sha256Digest> {
    let mut hasher = Sha256::new();
    fold_file(path, &mut hasher)?;
    Ok(Sha256Digest(hex_encode(&hasher.finalize())))
}

/// Stream a file through the declared algorithm and return lowercase hex.
pub fn hex_digest_of_file(path: &Utf8Path, algorithm: DigestAlgorithm) -> std::io::Result<String> {
    match algorithm {
        DigestAlgorithm::Sha256 => Ok(sha256_of_file(path)?.into_inner()),
        DigestAlgorithm::Sha512 => {
            let mut hasher = Sha512::new();
            fold_file(path, &mut hasher)?;
            Ok(hex_encode(&hasher.finalize()))
        }
    }
}

/// Feed a file's bytes into `hasher` in fixed-size reads.
fn fold_file<H: Digest>(path: &Utf8Path, hasher: &mut H) -> std::io::Result<()> {
    let mut file = std::fs::File::open(path)?;
    let mut buf = vec![0u8; DIGEST_BUF_LEN];
    loop {
        let read = file.read(&mut buf)?;
        if read == 0 {
            return Ok(());
        }
        hasher.update(&buf[..read]);
    }
}

/// Lowercase hex encoding of a byte slice.
fn hex_encode(bytes: &[u8]) -> String {
    use fmt::Write;

    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        // Writing to a String cannot fail.
        let _ = write!(out, "{byte:02x}");
    }
    out
}
