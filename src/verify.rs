//! Identity verification for fetched artifacts.
//!
//! Polymorphic over the two identity-claim kinds: a content-hash check
//! against the declared digest, and a publisher-identity check against
//! the signer token embedded in the artifact's code signature. The
//! signer-token strategy is preferred when available because it survives
//! routine version updates; the result records which strategy decided so
//! reports stay auditable. A failure is terminal for the artifact in
//! this run and is never retried with weaker criteria.

use crate::catalog::IdentityClaim;
use crate::digest::{DigestAlgorithm, Sha256Digest, hex_digest_of_file};
use crate::exec::CommandExecutor;
use camino::Utf8Path;
use std::fmt;

/// Failure reason: the recomputed digest differs from the declared one.
pub const REASON_DIGEST_MISMATCH: &str = "digest-mismatch";
/// Failure reason: the artifact carries no code signature.
pub const REASON_SIGNATURE_MISSING: &str = "signature-missing";
/// Failure reason: the signature exists but cannot be validated.
pub const REASON_SIGNATURE_INVALID: &str = "signature-invalid";
/// Failure reason: the signer token differs from the declared identity.
pub const REASON_IDENTITY_MISMATCH: &str = "identity-mismatch";

/// Which verification strategy produced a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// Byte-for-byte digest comparison against the declared hash.
    ContentHash,
    /// Signer identity token comparison against the declared token.
    PublisherIdentity,
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ContentHash => write!(f, "content-hash"),
            Self::PublisherIdentity => write!(f, "publisher-identity"),
        }
    }
}

/// Outcome of identity verification. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerificationResult {
    /// The claim held.
    Verified {
        /// Strategy that decided.
        strategy: Strategy,
        /// Human-readable evidence for the report.
        evidence: String,
    },
    /// The claim did not hold. Terminal for this artifact in this run.
    Failed {
        /// Strategy that decided.
        strategy: Strategy,
        /// One of the `REASON_*` constants.
        reason: String,
    },
    /// No judgement was possible: the artifact or its signature could
    /// not be inspected. An infrastructure failure, not a trust verdict.
    Unverifiable {
        /// Strategy that was attempted.
        strategy: Strategy,
        /// What prevented inspection.
        reason: String,
    },
}

impl VerificationResult {
    /// Whether the artifact may proceed to later stages.
    #[must_use]
    pub fn is_verified(&self) -> bool {
        matches!(self, Self::Verified { .. })
    }

    /// Report-facing summary line.
    #[must_use]
    pub fn summary(&self) -> String {
        match self {
            Self::Verified { strategy, evidence } => format!("{strategy}: {evidence}"),
            Self::Failed { strategy, reason } => format!("{strategy}: {reason}"),
            Self::Unverifiable { strategy, reason } => {
                format!("{strategy}: unverifiable ({reason})")
            }
        }
    }
}

/// Errors a signature reader can report.
#[derive(Debug, thiserror::Error)]
pub enum SignatureError {
    /// The artifact carries no embedded signature.
    #[error("no embedded signature")]
    Missing,
    /// The signature exists but is unverifiable, expired, or carries no
    /// identity token.
    #[error("signature invalid: {reason}")]
    Invalid {
        /// Description of the defect.
        reason: String,
    },
    /// The signature tooling could not be invoked.
    #[error("signature tooling failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Trait for extracting the signer identity token from an artifact.
#[cfg_attr(test, mockall::automock)]
pub trait SignatureReader {
    /// Return the signer identity token embedded in the artifact at
    /// `path` (a package file or an application bundle directory).
    ///
    /// # Errors
    ///
    /// Returns [`SignatureError::Missing`] for unsigned artifacts and
    /// [`SignatureError::Invalid`] for unverifiable signatures or
    /// signatures without an identity token.
    fn signer_token(&self, path: &Utf8Path) -> Result<String, SignatureError>;
}

/// Signer token length used by the platform signature tooling.
const TOKEN_LEN: usize = 10;

/// Signature reader backed by the platform's signature tools.
///
/// Installer package files are inspected with `pkgutil`; application
/// bundle directories with `codesign`. Both run through the
/// [`CommandExecutor`] seam so tests never spawn processes.
pub struct CommandSignatureReader<E> {
    executor: E,
}

impl<E: CommandExecutor> CommandSignatureReader<E> {
    /// Create a reader over the given executor.
    #[must_use]
    pub fn new(executor: E) -> Self {
        Self { executor }
    }
}

impl<E: CommandExecutor> SignatureReader for CommandSignatureReader<E> {
    fn signer_token(&self, path: &Utf8Path) -> Result<String, SignatureError> {
        if path.is_dir() {
            self.bundle_token(path)
        } else {
            self.package_token(path)
        }
    }
}

impl<E: CommandExecutor> CommandSignatureReader<E> {
    /// Extract the signer token from an installer package file.
    fn package_token(&self, path: &Utf8Path) -> Result<String, SignatureError> {
        let output = self
            .executor
            .run("pkgutil", &["--check-signature", path.as_str()])?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        if !output.status.success() {
            if stdout.contains("no signature") {
                return Err(SignatureError::Missing);
            }
            return Err(SignatureError::Invalid {
                reason: first_line(&String::from_utf8_lossy(&output.stderr))
                    .unwrap_or("signature check failed")
                    .to_owned(),
            });
        }
        parse_parenthesized_token(&stdout).ok_or_else(|| SignatureError::Invalid {
            reason: "no identity token in signature".to_owned(),
        })
    }

    /// Extract the signer token from an application bundle directory.
    fn bundle_token(&self, path: &Utf8Path) -> Result<String, SignatureError> {
        // codesign writes its report to stderr.
        let output = self
            .executor
            .run("codesign", &["-dv", "--verbose=2", path.as_str()])?;
        let report = String::from_utf8_lossy(&output.stderr);
        if !output.status.success() {
            if report.contains("not signed") {
                return Err(SignatureError::Missing);
            }
            return Err(SignatureError::Invalid {
                reason: first_line(&report).unwrap_or("signature check failed").to_owned(),
            });
        }
        match parse_team_identifier(&report) {
            Some("not set") | None => Err(SignatureError::Invalid {
                reason: "no identity token in signature".to_owned(),
            }),
            Some(token) => Ok(token.to_owned()),
        }
    }
}

/// Find a parenthesized signer token, e.g. `Developer ID Installer:
/// Example Corp (TEAM123456)`.
fn parse_parenthesized_token(text: &str) -> Option<String> {
    let mut rest = text;
    while let Some(open) = rest.find('(') {
        let tail = &rest[open + 1..];
        if let Some(close) = tail.find(')') {
            let candidate = &tail[..close];
            if candidate.len() == TOKEN_LEN
                && candidate.chars().all(|c| c.is_ascii_alphanumeric() && !c.is_ascii_lowercase())
            {
                return Some(candidate.to_owned());
            }
            rest = &tail[close + 1..];
        } else {
            return None;
        }
    }
    None
}

/// Find the `TeamIdentifier=` line in a codesign report.
fn parse_team_identifier(report: &str) -> Option<&str> {
    report
        .lines()
        .find_map(|line| line.trim().strip_prefix("TeamIdentifier="))
        .map(str::trim)
}

fn first_line(text: &str) -> Option<&str> {
    text.lines().next().map(str::trim).filter(|l| !l.is_empty())
}

/// Verify an artifact against its catalog entry's identity claim.
///
/// `artifact_path` and `streamed_sha256` describe the bytes whose hash
/// the catalog declares (the downloaded blob); `signature_source` is the
/// path whose embedded signature counts (for containers, the inner
/// installer or application bundle produced by normalization, never the
/// container wrapper).
pub fn verify_identity(
    claim: &IdentityClaim,
    artifact_path: &Utf8Path,
    streamed_sha256: &Sha256Digest,
    signature_source: &Utf8Path,
    signatures: &dyn SignatureReader,
) -> VerificationResult {
    match claim {
        IdentityClaim::ContentDigest { algorithm, value } => {
            verify_content(*algorithm, value, artifact_path, streamed_sha256)
        }
        IdentityClaim::SignerToken(expected) => {
            verify_signer(expected, signature_source, signatures)
        }
    }
}

/// Content-hash strategy: recompute (or reuse) the declared algorithm's
/// digest and compare case-insensitively, byte for byte.
fn verify_content(
    algorithm: DigestAlgorithm,
    declared: &str,
    artifact_path: &Utf8Path,
    streamed_sha256: &Sha256Digest,
) -> VerificationResult {
    let actual = match algorithm {
        DigestAlgorithm::Sha256 => streamed_sha256.as_str().to_owned(),
        DigestAlgorithm::Sha512 => match hex_digest_of_file(artifact_path, algorithm) {
            Ok(hex) => hex,
            Err(e) => {
                log::debug!("digest recomputation failed for {artifact_path}: {e}");
                return VerificationResult::Unverifiable {
                    strategy: Strategy::ContentHash,
                    reason: format!("cannot read artifact: {e}"),
                };
            }
        },
    };
    if actual.eq_ignore_ascii_case(declared) {
        VerificationResult::Verified {
            strategy: Strategy::ContentHash,
            evidence: format!("{algorithm} digest matched declared value"),
        }
    } else {
        log::debug!("digest mismatch: declared {declared}, computed {actual}");
        VerificationResult::Failed {
            strategy: Strategy::ContentHash,
            reason: REASON_DIGEST_MISMATCH.to_owned(),
        }
    }
}

/// Publisher-identity strategy: compare the embedded signer token.
fn verify_signer(
    expected: &str,
    signature_source: &Utf8Path,
    signatures: &dyn SignatureReader,
) -> VerificationResult {
    match signatures.signer_token(signature_source) {
        Ok(token) if token == expected => VerificationResult::Verified {
            strategy: Strategy::PublisherIdentity,
            evidence: format!("signer token {token} matched declared identity"),
        },
        Ok(token) => {
            log::debug!("signer token mismatch: declared {expected}, found {token}");
            VerificationResult::Failed {
                strategy: Strategy::PublisherIdentity,
                reason: REASON_IDENTITY_MISMATCH.to_owned(),
            }
        }
        Err(SignatureError::Missing) => VerificationResult::Failed {
            strategy: Strategy::PublisherIdentity,
            reason: REASON_SIGNATURE_MISSING.to_owned(),
        },
        Err(e @ SignatureError::Io(_)) => {
            log::debug!("signature tooling failed for {signature_source}: {e}");
            VerificationResult::Unverifiable {
                strategy: Strategy::PublisherIdentity,
                reason: e.to_string(),
            }
        }
        Err(e) => {
            log::debug!("signature inspection failed for {signature_source}: {e}");
            VerificationResult::Failed {
                strategy: Strategy::PublisherIdentity,
                reason: REASON_SIGNATURE_INVALID.to_owned(),
            }
        }
    }
}
