//! Content fetching over encrypted transport.
//!
//! Streams a remote artifact to stable storage while folding the bytes
//! into a SHA-256 digest, so no downstream stage needs a second full
//! read for basic integrity. Writes go to a temporary sibling path and
//! are renamed into place only on success; a failed attempt never leaves
//! a partial file at the final destination.

use camino::{Utf8Path, Utf8PathBuf};
use crate::digest::{Sha256Digest, sha256_from_hasher};
use sha2::{Digest, Sha256};
use std::io::{Read, Write};
use std::sync::OnceLock;
use std::time::Duration;
use ureq::http::HeaderMap;

/// Network timeout for a whole download.
const FETCH_TIMEOUT: Duration = Duration::from_secs(300);

/// Read buffer size while streaming the response body.
const STREAM_BUF_LEN: usize = 64 * 1024;

/// Suffix appended to the destination while a transfer is in flight.
const PARTIAL_SUFFIX: &str = ".partial";

/// A successfully fetched artifact reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedArtifact {
    /// Final destination path of the downloaded bytes.
    pub path: Utf8PathBuf,
    /// Number of bytes written.
    pub len: u64,
    /// SHA-256 digest streamed during the transfer.
    pub digest: Sha256Digest,
}

/// Errors arising from artifact retrieval.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    /// Network-level failure: connect, timeout, or an error status.
    #[error("transport error fetching {url}: {reason}")]
    Transport {
        /// The URL that was requested.
        url: String,
        /// Description of the failure.
        reason: String,
    },

    /// The body ended short of the declared content length.
    #[error("truncated transfer from {url}: declared {declared} bytes, received {received}")]
    Truncated {
        /// The URL that was requested.
        url: String,
        /// Length the transport declared.
        declared: u64,
        /// Bytes actually received.
        received: u64,
    },

    /// I/O error writing the downloaded bytes.
    #[error("I/O error writing download: {0}")]
    Io(#[from] std::io::Error),
}

/// Trait for retrieving a remote artifact into local storage.
#[cfg_attr(test, mockall::automock)]
pub trait ArtifactFetcher {
    /// Fetch `url` into `dest`, returning the artifact reference with
    /// its streamed digest.
    ///
    /// # Errors
    ///
    /// Returns [`FetchError::Transport`] for network failures and error
    /// statuses, [`FetchError::Truncated`] when the body ends short of a
    /// declared length, and [`FetchError::Io`] for write failures. On
    /// any error no file exists at `dest`.
    fn fetch(&self, url: &str, dest: &Utf8Path) -> Result<FetchedArtifact, FetchError>;
}

/// HTTP fetcher backed by a shared `ureq` agent.
#[derive(Debug, Clone, Copy, Default)]
pub struct HttpFetcher;

impl ArtifactFetcher for HttpFetcher {
    fn fetch(&self, url: &str, dest: &Utf8Path) -> Result<FetchedArtifact, FetchError> {
        let response = http_agent()
            .get(url)
            .call()
            .map_err(|e| map_ureq_error(url, &e))?;

        let declared_len = content_length(response.headers());
        let mut body = response.into_body();
        write_artifact(url, body.as_reader(), declared_len, dest)
    }
}

/// Stream `reader` into a partial sibling of `dest`, check any declared
/// length, and rename into place. On any error no file remains at `dest`
/// or the partial path.
fn write_artifact<R: Read>(
    url: &str,
    reader: R,
    declared_len: Option<u64>,
    dest: &Utf8Path,
) -> Result<FetchedArtifact, FetchError> {
    let partial = Utf8PathBuf::from(format!("{dest}{PARTIAL_SUFFIX}"));
    match stream_to(reader, &partial) {
        Ok((len, digest)) => {
            if let Some(declared) = declared_len.filter(|&d| d != len) {
                let _ = std::fs::remove_file(&partial);
                return Err(FetchError::Truncated {
                    url: url.to_owned(),
                    declared,
                    received: len,
                });
            }
            std::fs::rename(&partial, dest)?;
            Ok(FetchedArtifact {
                path: dest.to_owned(),
                len,
                digest,
            })
        }
        Err(e) => {
            let _ = std::fs::remove_file(&partial);
            Err(e)
        }
    }
}

/// Stream a reader to `partial`, folding bytes into SHA-256.
fn stream_to<R: Read>(
    mut reader: R,
    partial: &Utf8Path,
) -> Result<(u64, Sha256Digest), FetchError> {
    let mut file = std::fs::File::create(partial)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; STREAM_BUF_LEN];
    let mut written: u64 = 0;

    loop {
        let read = reader.read(&mut buf).map_err(FetchError::Io)?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
        file.write_all(&buf[..read])?;
        written += read as u64;
    }
    file.flush()?;

    Ok((written, sha256_from_hasher(hasher)))
}

/// Parse the declared content length, when the transport supplies one.
fn content_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get("content-length")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
}

/// Shared `ureq` agent with download timeout configuration.
fn http_agent() -> &'static ureq::Agent {
    static AGENT: OnceLock<ureq::Agent> = OnceLock::new();
    AGENT.get_or_init(|| {
        let config = ureq::Agent::config_builder()
            .timeout_global(Some(FETCH_TIMEOUT))
            .build();
        ureq::Agent::new_with_config(config)
    })
}

/// Map a ureq error to a [`FetchError`].
fn map_ureq_error(url: &str, err: &ureq::Error) -> FetchError {
    match err {
        ureq::Error::StatusCode(code) => FetchError::Transport {
            url: url.to_owned(),
            reason: format!("status {code}"),
        },
        other => FetchError::Transport {
            url: url.to_owned(),
            reason: other.to_string(),
        },
    }
}
