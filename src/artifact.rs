//! Artifact value type shared by every pipeline stage.

use crate::digest::Sha256Digest;
use camino::Utf8PathBuf;

/// A byte stream at rest: the unit of work flowing through the pipeline.
///
/// Created by the fetcher, optionally replaced by the normalizer, and
/// consumed read-only by the verifier, reputation gate, and publisher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    /// Logical name from the catalog entry.
    pub name: String,
    /// Location on local storage.
    pub path: Utf8PathBuf,
    /// Size in bytes.
    pub len: u64,
    /// Canonical SHA-256 digest of the bytes at `path`.
    pub digest: Sha256Digest,
}

impl Artifact {
    /// File name component of the artifact path, when present.
    #[must_use]
    pub fn file_name(&self) -> Option<&str> {
        self.path.file_name()
    }
}
