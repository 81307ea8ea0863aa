//! Distribution publishing: idempotent, chunked, resumable-by-retry.
//!
//! The publisher asks the endpoint what it already holds under the
//! artifact's logical name and transfers nothing when the digests match.
//! Otherwise the bytes go up in fixed-size chunks, each carrying its
//! offset and checksum, each retried independently on transport failure
//! with exponential backoff. Commit is a distinct final step: its
//! failure is reported separately from chunk failures, and a cancelled
//! or exhausted session is aborted rather than left half-committed.

use crate::artifact::Artifact;
use crate::cancel::CancelFlag;
use crate::config::DistributionSection;
use crate::digest::Sha256Digest;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use std::io::Read;
use std::sync::{Mutex, OnceLock, PoisonError};
use std::time::Duration;
use thiserror::Error;

/// Network timeout for a single endpoint call.
const PUBLISH_TIMEOUT: Duration = Duration::from_secs(120);

/// Cap on the backoff doubling exponent, to keep waits sane.
const MAX_BACKOFF_DOUBLINGS: u32 = 8;

/// Errors arising from distribution publishing.
#[derive(Debug, Error)]
pub enum PublishError {
    /// The endpoint rejected or never granted credentials.
    #[error("authentication failed: {reason}")]
    Auth {
        /// Description of the failure.
        reason: String,
    },

    /// Network-level failure on a single call.
    #[error("distribution transport error: {reason}")]
    Transport {
        /// Description of the failure.
        reason: String,
    },

    /// One chunk exhausted its retry budget.
    #[error("chunk-exhausted: chunk at offset {offset} failed {attempts} attempts")]
    ChunkExhausted {
        /// Byte offset of the failing chunk.
        offset: u64,
        /// Attempts made before giving up.
        attempts: u32,
    },

    /// Every chunk was acknowledged but the final commit failed.
    #[error("commit-failed: {reason}")]
    CommitFailed {
        /// Description of the failure.
        reason: String,
    },

    /// The run was cancelled between chunks; the session was aborted.
    #[error("publish cancelled")]
    Cancelled,

    /// I/O failure reading the artifact.
    #[error("I/O error reading artifact for upload: {0}")]
    Io(#[from] std::io::Error),
}

/// Proof of a completed (or skipped) publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishReceipt {
    /// Logical name published under.
    pub name: String,
    /// Digest now associated with the name.
    pub digest: Sha256Digest,
    /// Bytes actually transferred; zero when the endpoint was current.
    pub bytes_sent: u64,
    /// Whether the endpoint already held these exact bytes.
    pub already_current: bool,
}

/// Trait for the remote distribution endpoint.
#[cfg_attr(test, mockall::automock)]
pub trait DistributionEndpoint {
    /// Establish credentials for the calls that follow.
    ///
    /// # Errors
    ///
    /// Returns [`PublishError::Auth`] when the endpoint rejects the
    /// credentials and [`PublishError::Transport`] on network failure.
    fn authenticate(&self) -> Result<(), PublishError>;

    /// Digest currently associated with `name`, when one exists.
    ///
    /// # Errors
    ///
    /// Returns [`PublishError::Transport`] on network failure. An
    /// unknown name is `Ok(None)`, not an error.
    fn existing_digest(&self, name: &str) -> Result<Option<Sha256Digest>, PublishError>;

    /// Open an upload session for `total_len` bytes under `name`.
    ///
    /// # Errors
    ///
    /// Returns [`PublishError::Transport`] on network failure.
    fn begin_upload(&self, name: &str, total_len: u64) -> Result<String, PublishError>;

    /// Send one chunk with its offset and checksum.
    ///
    /// # Errors
    ///
    /// Returns [`PublishError::Transport`] on network failure; the
    /// caller owns the retry budget.
    fn upload_chunk(
        &self,
        session: &str,
        offset: u64,
        bytes: &[u8],
        chunk_digest: &Sha256Digest,
    ) -> Result<(), PublishError>;

    /// Atomically associate the uploaded bytes with `name`, replacing
    /// any prior association.
    ///
    /// # Errors
    ///
    /// Returns [`PublishError::Transport`] on network failure.
    fn commit(&self, session: &str, name: &str, digest: &Sha256Digest)
    -> Result<(), PublishError>;

    /// Discard an unfinished session. Failures are swallowed; the
    /// session is already lost to this run.
    fn abort(&self, session: &str);
}

/// Publish an artifact, skipping the transfer when the endpoint is
/// already current.
///
/// # Errors
///
/// Returns [`PublishError::ChunkExhausted`] when one chunk runs out of
/// retries, [`PublishError::CommitFailed`] when the final commit fails,
/// [`PublishError::Cancelled`] when the run is cancelled between
/// chunks, and transport/auth/I/O errors from the underlying calls. On
/// every error after session open the session has been aborted, except
/// after a failed commit, which the endpoint itself must not
/// half-apply.
///
/// # Examples
///
/// ```no_run
/// use packferry::cancel::CancelFlag;
/// use packferry::config::DistributionSection;
/// use packferry::publish::{HttpEndpoint, publish};
///
/// # fn demo(artifact: &packferry::artifact::Artifact) -> Result<(), packferry::publish::PublishError> {
/// let endpoint = HttpEndpoint::new("https://dist.example", "svc-packferry", "secret");
/// let receipt = publish(&endpoint, artifact, &DistributionSection::default(), &CancelFlag::new())?;
/// assert!(receipt.already_current || receipt.bytes_sent == artifact.len);
/// # Ok(())
/// # }
/// ```
pub fn publish(
    endpoint: &dyn DistributionEndpoint,
    artifact: &Artifact,
    settings: &DistributionSection,
    cancel: &CancelFlag,
) -> Result<PublishReceipt, PublishError> {
    endpoint.authenticate()?;

    if endpoint.existing_digest(&artifact.name)?.as_ref() == Some(&artifact.digest) {
        log::info!(
            "{}: endpoint already holds digest {}, skipping transfer",
            artifact.name,
            artifact.digest
        );
        return Ok(PublishReceipt {
            name: artifact.name.clone(),
            digest: artifact.digest.clone(),
            bytes_sent: 0,
            already_current: true,
        });
    }

    let session = endpoint.begin_upload(&artifact.name, artifact.len)?;
    match send_chunks(endpoint, &session, artifact, settings, cancel) {
        Ok(bytes_sent) => {
            endpoint
                .commit(&session, &artifact.name, &artifact.digest)
                .map_err(|e| PublishError::CommitFailed {
                    reason: e.to_string(),
                })?;
            Ok(PublishReceipt {
                name: artifact.name.clone(),
                digest: artifact.digest.clone(),
                bytes_sent,
                already_current: false,
            })
        }
        Err(e) => {
            endpoint.abort(&session);
            Err(e)
        }
    }
}

/// Stream the artifact to the session in order, one chunk at a time.
fn send_chunks(
    endpoint: &dyn DistributionEndpoint,
    session: &str,
    artifact: &Artifact,
    settings: &DistributionSection,
    cancel: &CancelFlag,
) -> Result<u64, PublishError> {
    let mut file = std::fs::File::open(&artifact.path)?;
    let chunk_len = usize::try_from(settings.chunk_size).unwrap_or(usize::MAX);
    let mut buf = vec![0u8; chunk_len];
    let mut offset: u64 = 0;

    loop {
        if cancel.is_cancelled() {
            return Err(PublishError::Cancelled);
        }
        let read = fill_chunk(&mut file, &mut buf)?;
        if read == 0 {
            return Ok(offset);
        }
        let chunk = &buf[..read];
        let chunk_digest = Sha256Digest::of_bytes(chunk);
        send_with_retry(endpoint, session, offset, chunk, &chunk_digest, settings)?;
        offset += read as u64;
    }
}

/// Retry one chunk on transport failure, up to the configured budget.
fn send_with_retry(
    endpoint: &dyn DistributionEndpoint,
    session: &str,
    offset: u64,
    chunk: &[u8],
    chunk_digest: &Sha256Digest,
    settings: &DistributionSection,
) -> Result<(), PublishError> {
    for attempt in 1..=settings.chunk_retry_limit {
        match endpoint.upload_chunk(session, offset, chunk, chunk_digest) {
            Ok(()) => return Ok(()),
            Err(PublishError::Transport { reason }) => {
                log::warn!(
                    "chunk at offset {offset}: attempt {attempt}/{} failed: {reason}",
                    settings.chunk_retry_limit
                );
                if attempt < settings.chunk_retry_limit {
                    std::thread::sleep(backoff(settings.retry_backoff_ms, attempt));
                }
            }
            Err(other) => return Err(other),
        }
    }
    Err(PublishError::ChunkExhausted {
        offset,
        attempts: settings.chunk_retry_limit,
    })
}

/// Exponential backoff: base doubles per completed attempt, capped.
fn backoff(base_ms: u64, attempt: u32) -> Duration {
    let doublings = (attempt - 1).min(MAX_BACKOFF_DOUBLINGS);
    Duration::from_millis(base_ms.saturating_mul(1 << doublings))
}

/// Read until the buffer is full or the file ends.
fn fill_chunk(file: &mut std::fs::File, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let read = file.read(&mut buf[filled..])?;
        if read == 0 {
            break;
        }
        filled += read;
    }
    Ok(filled)
}

/// HTTP distribution endpoint with bearer-token sessions obtained from
/// a basic-auth token exchange.
pub struct HttpEndpoint {
    base_url: String,
    username: String,
    password: String,
    token: Mutex<Option<String>>,
}

impl HttpEndpoint {
    /// Build an endpoint client against `base_url`.
    #[must_use]
    pub fn new(
        base_url: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            base_url: base_url.into(),
            username: username.into(),
            password: password.into(),
            token: Mutex::new(None),
        }
    }

    /// Current bearer token, authenticating first when none is held.
    fn bearer(&self) -> Result<String, PublishError> {
        {
            let token = self.token.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(token) = token.as_ref() {
                return Ok(token.clone());
            }
        }
        self.authenticate()?;
        let token = self.token.lock().unwrap_or_else(PoisonError::into_inner);
        token.clone().ok_or_else(|| PublishError::Auth {
            reason: "token endpoint returned no token".to_owned(),
        })
    }
}

impl DistributionEndpoint for HttpEndpoint {
    fn authenticate(&self) -> Result<(), PublishError> {
        let credentials = BASE64.encode(format!("{}:{}", self.username, self.password));
        let url = format!("{}/auth/token", self.base_url);
        let mut response = dist_agent()
            .post(&url)
            .header("authorization", &format!("Basic {credentials}"))
            .send_empty()
            .map_err(map_auth_error)?;
        let body: serde_json::Value =
            response
                .body_mut()
                .read_json()
                .map_err(|e| PublishError::Auth {
                    reason: format!("malformed token response: {e}"),
                })?;
        let token = body["token"]
            .as_str()
            .ok_or_else(|| PublishError::Auth {
                reason: "token endpoint returned no token".to_owned(),
            })?
            .to_owned();
        *self.token.lock().unwrap_or_else(PoisonError::into_inner) = Some(token);
        Ok(())
    }

    fn existing_digest(&self, name: &str) -> Result<Option<Sha256Digest>, PublishError> {
        let bearer = self.bearer()?;
        let url = format!("{}/packages/{name}", self.base_url);
        let result = dist_agent()
            .get(&url)
            .header("authorization", &format!("Bearer {bearer}"))
            .call();
        let mut response = match result {
            Ok(response) => response,
            Err(ureq::Error::StatusCode(404)) => return Ok(None),
            Err(e) => return Err(map_transport(&e)),
        };
        let body: serde_json::Value =
            response
                .body_mut()
                .read_json()
                .map_err(|e| PublishError::Transport {
                    reason: format!("malformed package response: {e}"),
                })?;
        match body["digest"].as_str() {
            Some(hex) => Sha256Digest::try_from(hex)
                .map(Some)
                .map_err(|e| PublishError::Transport {
                    reason: format!("malformed digest in package response: {e}"),
                }),
            None => Ok(None),
        }
    }

    fn begin_upload(&self, name: &str, total_len: u64) -> Result<String, PublishError> {
        let bearer = self.bearer()?;
        let url = format!("{}/uploads", self.base_url);
        let mut response = dist_agent()
            .post(&url)
            .header("authorization", &format!("Bearer {bearer}"))
            .send_json(serde_json::json!({ "name": name, "totalLength": total_len }))
            .map_err(|e| map_transport(&e))?;
        let body: serde_json::Value =
            response
                .body_mut()
                .read_json()
                .map_err(|e| PublishError::Transport {
                    reason: format!("malformed session response: {e}"),
                })?;
        body["id"]
            .as_str()
            .map(str::to_owned)
            .ok_or_else(|| PublishError::Transport {
                reason: "session response carries no id".to_owned(),
            })
    }

    fn upload_chunk(
        &self,
        session: &str,
        offset: u64,
        bytes: &[u8],
        chunk_digest: &Sha256Digest,
    ) -> Result<(), PublishError> {
        let bearer = self.bearer()?;
        let url = format!("{}/uploads/{session}/chunks/{offset}", self.base_url);
        dist_agent()
            .put(&url)
            .header("authorization", &format!("Bearer {bearer}"))
            .header("x-chunk-sha256", chunk_digest.as_str())
            .content_type("application/octet-stream")
            .send(bytes)
            .map_err(|e| map_transport(&e))?;
        Ok(())
    }

    fn commit(
        &self,
        session: &str,
        name: &str,
        digest: &Sha256Digest,
    ) -> Result<(), PublishError> {
        let bearer = self.bearer()?;
        let url = format!("{}/uploads/{session}/commit", self.base_url);
        dist_agent()
            .post(&url)
            .header("authorization", &format!("Bearer {bearer}"))
            .send_json(serde_json::json!({ "name": name, "digest": digest.as_str() }))
            .map_err(|e| map_transport(&e))?;
        Ok(())
    }

    fn abort(&self, session: &str) {
        let Ok(bearer) = self.bearer() else { return };
        let url = format!("{}/uploads/{session}", self.base_url);
        if let Err(e) = dist_agent()
            .delete(&url)
            .header("authorization", &format!("Bearer {bearer}"))
            .call()
        {
            log::warn!("failed to abort upload session {session}: {e}");
        }
    }
}

/// Shared agent for distribution calls.
fn dist_agent() -> &'static ureq::Agent {
    static AGENT: OnceLock<ureq::Agent> = OnceLock::new();
    AGENT.get_or_init(|| {
        let config = ureq::Agent::config_builder()
            .timeout_global(Some(PUBLISH_TIMEOUT))
            .build();
        ureq::Agent::new_with_config(config)
    })
}

fn map_transport(err: &ureq::Error) -> PublishError {
    match err {
        ureq::Error::StatusCode(code) => PublishError::Transport {
            reason: format!("status {code}"),
        },
        other => PublishError::Transport {
            reason: other.to_string(),
        },
    }
}

fn map_auth_error(err: ureq::Error) -> PublishError {
    match err {
        ureq::Error::StatusCode(code @ (401 | 403)) => PublishError::Auth {
            reason: format!("credentials rejected (status {code})"),
        },
        other => map_transport(&other),
    }
}
