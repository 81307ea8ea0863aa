//! Catalog loading and validation.
//!
//! The catalog is the declarative list of what to fetch: one entry per
//! logical package, each with a source URL, a declared package kind, and
//! exactly one identity claim. Malformed or contradictory entries are
//! rejected here, before any network activity.

use crate::digest::{DigestAlgorithm, validate_hex};
use camino::{Utf8Path, Utf8PathBuf};
use serde::Deserialize;
use std::collections::HashSet;
use std::fmt;
use thiserror::Error;

/// Declared container shape of a catalog entry's artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum PackageKind {
    /// A flat installer file, published as downloaded.
    #[serde(rename = "flat")]
    Flat,
    /// A container holding exactly one installer package.
    #[serde(rename = "container")]
    Container,
    /// A container holding an installer package or an application bundle
    /// that must be wrapped in a synthesized installer.
    #[serde(rename = "containerWithInstaller")]
    ContainerWithInstaller,
}

impl PackageKind {
    /// Whether this kind requires container normalization before use.
    #[must_use]
    pub fn is_container(self) -> bool {
        matches!(self, Self::Container | Self::ContainerWithInstaller)
    }
}

impl fmt::Display for PackageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Flat => write!(f, "flat"),
            Self::Container => write!(f, "container"),
            Self::ContainerWithInstaller => write!(f, "containerWithInstaller"),
        }
    }
}

/// The identity a publisher is claimed to have shipped.
///
/// A closed sum type: exactly one claim kind is active per entry, and the
/// verifier matches exhaustively so adding a strategy is a compile-time
/// decision point rather than a silent fallthrough.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdentityClaim {
    /// The artifact's bytes must hash to this value under this algorithm.
    ContentDigest {
        /// Declared digest algorithm.
        algorithm: DigestAlgorithm,
        /// Declared lowercase hex digest.
        value: String,
    },
    /// The artifact's embedded code signature must carry this signer
    /// identity token. Survives routine version updates, unlike a hash.
    SignerToken(String),
}

impl fmt::Display for IdentityClaim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ContentDigest { algorithm, value } => {
                write!(f, "{algorithm} digest {value}")
            }
            Self::SignerToken(token) => write!(f, "signer token {token}"),
        }
    }
}

/// A validated catalog entry, immutable for the duration of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogEntry {
    /// Logical package name, unique within the catalog.
    pub name: String,
    /// Source URL to fetch.
    pub url: String,
    /// Declared package kind.
    pub kind: PackageKind,
    /// The entry's single identity claim.
    pub identity: IdentityClaim,
}

/// Errors arising from catalog loading and validation.
#[derive(Debug, Error)]
pub enum CatalogError {
    /// The catalog file could not be read.
    #[error("failed to read catalog {path}: {source}")]
    Read {
        /// Path to the catalog file.
        path: Utf8PathBuf,
        /// The underlying I/O failure.
        #[source]
        source: std::io::Error,
    },

    /// The catalog file is not valid JSON of the expected shape.
    #[error("failed to parse catalog {path}: {reason}")]
    Parse {
        /// Path to the catalog file.
        path: Utf8PathBuf,
        /// Description of the parse failure.
        reason: String,
    },

    /// An entry declares both a content digest and a signer token.
    #[error("entry {name}: conflicting identity claims (digest and signer token both present)")]
    ConflictingIdentity {
        /// Offending entry name.
        name: String,
    },

    /// An entry declares no identity claim at all.
    #[error("entry {name}: no identity claim (one of sha256, sha512, or signerToken is required)")]
    MissingIdentity {
        /// Offending entry name.
        name: String,
    },

    /// An entry's declared digest is not well-formed hex.
    #[error("entry {name}: {source}")]
    InvalidDigest {
        /// Offending entry name.
        name: String,
        /// The digest validation failure.
        #[source]
        source: crate::digest::DigestError,
    },

    /// An entry has an empty name or URL.
    #[error("entry {index}: {field} must not be empty")]
    EmptyField {
        /// Zero-based index of the offending entry.
        index: usize,
        /// Which field was empty.
        field: &'static str,
    },

    /// Two entries share a logical name.
    #[error("duplicate entry name {name}")]
    DuplicateName {
        /// The duplicated name.
        name: String,
    },
}

/// Raw entry shape as it appears in the catalog JSON.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawEntry {
    name: String,
    url: String,
    kind: PackageKind,
    #[serde(default)]
    sha256: Option<String>,
    #[serde(default)]
    sha512: Option<String>,
    #[serde(default, rename = "signerToken")]
    signer_token: Option<String>,
}

/// Load and validate a catalog file.
///
/// # Errors
///
/// Returns a [`CatalogError`] when the file cannot be read, is not valid
/// JSON, or any entry fails validation. Validation is exhaustive: the
/// first error aborts the load, so no partially-valid catalog is ever
/// handed to the pipeline.
pub fn load(path: &Utf8Path) -> Result<Vec<CatalogEntry>, CatalogError> {
    let text = std::fs::read_to_string(path).map_err(|source| CatalogError::Read {
        path: path.to_owned(),
        source,
    })?;
    let raw: Vec<RawEntry> = serde_json::from_str(&text).map_err(|e| CatalogError::Parse {
        path: path.to_owned(),
        reason: e.to_string(),
    })?;
    validate_entries(raw)
}

/// Validate raw entries into the closed catalog representation.
fn validate_entries(raw: Vec<RawEntry>) -> Result<Vec<CatalogEntry>, CatalogError> {
    let mut seen = HashSet::new();
    let mut entries = Vec::with_capacity(raw.len());
    for (index, entry) in raw.into_iter().enumerate() {
        if entry.name.trim().is_empty() {
            return Err(CatalogError::EmptyField {
                index,
                field: "name",
            });
        }
        if entry.url.trim().is_empty() {
            return Err(CatalogError::EmptyField { index, field: "url" });
        }
        if !seen.insert(entry.name.clone()) {
            return Err(CatalogError::DuplicateName { name: entry.name });
        }
        let identity = validate_identity(&entry)?;
        entries.push(CatalogEntry {
            name: entry.name,
            url: entry.url,
            kind: entry.kind,
            identity,
        });
    }
    Ok(entries)
}

/// Resolve the raw optional identity fields into exactly one claim.
fn validate_identity(entry: &RawEntry) -> Result<IdentityClaim, CatalogError> {
    let digest_claim = match (&entry.sha256, &entry.sha512) {
        (Some(_), Some(_)) => {
            return Err(CatalogError::ConflictingIdentity {
                name: entry.name.clone(),
            });
        }
        (Some(value), None) => Some((DigestAlgorithm::Sha256, value)),
        (None, Some(value)) => Some((DigestAlgorithm::Sha512, value)),
        (None, None) => None,
    };
    match (digest_claim, &entry.signer_token) {
        (Some(_), Some(_)) => Err(CatalogError::ConflictingIdentity {
            name: entry.name.clone(),
        }),
        (Some((algorithm, value)), None) => {
            validate_hex(value, algorithm).map_err(|source| CatalogError::InvalidDigest {
                name: entry.name.clone(),
                source,
            })?;
            Ok(IdentityClaim::ContentDigest {
                algorithm,
                value: value.to_ascii_lowercase(),
            })
        }
        (None, Some(token)) if !token.trim().is_empty() => {
            Ok(IdentityClaim::SignerToken(token.clone()))
        }
        _ => Err(CatalogError::MissingIdentity {
            name: entry.name.clone(),
        }),
    }
}
