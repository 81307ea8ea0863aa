//! Hand-rolled test doubles shared by the integration suites.

#![allow(dead_code)]

use camino::{Utf8Path, Utf8PathBuf};
use packferry::config::RunConfig;
use packferry::digest::Sha256Digest;
use packferry::fetch::{ArtifactFetcher, FetchError, FetchedArtifact};
use packferry::publish::{DistributionEndpoint, PublishError};
use packferry::reputation::{DetectorTally, PollStatus, ReputationClient, ReputationError};
use packferry::verify::{SignatureError, SignatureReader};
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

/// A run configuration pointed at a scratch directory, with retries
/// tightened for tests.
pub fn test_config(root: &Utf8Path) -> RunConfig {
    let mut config = RunConfig::default();
    config.run.jobs = 2;
    config.run.downloads_dir = root.join("downloads");
    config.run.report_path = root.join("reports/results.json");
    config.distribution.base_url = "https://dist.example".to_owned();
    config.distribution.chunk_size = 4;
    config.distribution.retry_backoff_ms = 0;
    config.reputation.base_url = "https://scan.example/api/v3".to_owned();
    config.reputation.poll_interval_secs = 0;
    config.reputation.poll_deadline_secs = 1;
    config
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Serves a local file as if it were the remote artifact.
pub struct FileFetcher {
    pub source: Utf8PathBuf,
}

impl ArtifactFetcher for FileFetcher {
    fn fetch(&self, _url: &str, dest: &Utf8Path) -> Result<FetchedArtifact, FetchError> {
        let bytes = std::fs::read(&self.source).map_err(FetchError::Io)?;
        std::fs::write(dest, &bytes).map_err(FetchError::Io)?;
        Ok(FetchedArtifact {
            path: dest.to_owned(),
            len: bytes.len() as u64,
            digest: Sha256Digest::of_bytes(&bytes),
        })
    }
}

/// Signature reader returning a fixed token, recording every path it
/// was asked about.
pub struct FixedTokenReader {
    token: String,
    pub consulted: Mutex<Vec<Utf8PathBuf>>,
}

impl FixedTokenReader {
    pub fn new(token: &str) -> Self {
        Self {
            token: token.to_owned(),
            consulted: Mutex::new(Vec::new()),
        }
    }

    pub fn consulted_paths(&self) -> Vec<Utf8PathBuf> {
        lock(&self.consulted).clone()
    }
}

impl SignatureReader for FixedTokenReader {
    fn signer_token(&self, path: &Utf8Path) -> Result<String, SignatureError> {
        lock(&self.consulted).push(path.to_owned());
        Ok(self.token.clone())
    }
}

/// Scanner that knows every digest and reports it clean.
pub struct CleanScanner;

impl ReputationClient for CleanScanner {
    fn lookup(&self, _digest: &Sha256Digest) -> Result<Option<DetectorTally>, ReputationError> {
        Ok(Some(DetectorTally {
            positives: 0,
            total: 70,
        }))
    }

    fn submit(&self, _path: &Utf8Path) -> Result<String, ReputationError> {
        unreachable!("a known digest is never submitted")
    }

    fn poll(&self, _analysis_id: &str) -> Result<PollStatus, ReputationError> {
        unreachable!("a known digest is never polled")
    }
}

/// Scanner whose every call fails at the transport level.
pub struct UnreachableScanner;

impl ReputationClient for UnreachableScanner {
    fn lookup(&self, _digest: &Sha256Digest) -> Result<Option<DetectorTally>, ReputationError> {
        Err(ReputationError::Transport {
            reason: "connection refused".to_owned(),
        })
    }

    fn submit(&self, _path: &Utf8Path) -> Result<String, ReputationError> {
        Err(ReputationError::Transport {
            reason: "connection refused".to_owned(),
        })
    }

    fn poll(&self, _analysis_id: &str) -> Result<PollStatus, ReputationError> {
        Err(ReputationError::Transport {
            reason: "connection refused".to_owned(),
        })
    }
}

struct Session {
    name: String,
    buf: Vec<u8>,
}

/// In-memory distribution endpoint with optional chunk-failure
/// injection, verifying offsets, checksums, and commit digests.
#[derive(Default)]
pub struct MemoryEndpoint {
    stored: Mutex<HashMap<String, (Sha256Digest, Vec<u8>)>>,
    sessions: Mutex<HashMap<String, Session>>,
    next_session: Mutex<u32>,
    /// The next N `upload_chunk` calls fail with a transport error.
    pub fail_next_chunks: Mutex<u32>,
    pub uploads_begun: Mutex<u32>,
    pub aborted: Mutex<Vec<String>>,
}

impl MemoryEndpoint {
    pub fn inject_chunk_failures(&self, count: u32) {
        *lock(&self.fail_next_chunks) = count;
    }

    pub fn stored_bytes(&self, name: &str) -> Option<Vec<u8>> {
        lock(&self.stored).get(name).map(|(_, bytes)| bytes.clone())
    }

    pub fn stored_digest(&self, name: &str) -> Option<Sha256Digest> {
        lock(&self.stored).get(name).map(|(digest, _)| digest.clone())
    }

    pub fn stored_count(&self) -> usize {
        lock(&self.stored).len()
    }

    pub fn upload_sessions_opened(&self) -> u32 {
        *lock(&self.uploads_begun)
    }

    pub fn aborted_sessions(&self) -> Vec<String> {
        lock(&self.aborted).clone()
    }
}

impl DistributionEndpoint for MemoryEndpoint {
    fn authenticate(&self) -> Result<(), PublishError> {
        Ok(())
    }

    fn existing_digest(&self, name: &str) -> Result<Option<Sha256Digest>, PublishError> {
        Ok(lock(&self.stored).get(name).map(|(digest, _)| digest.clone()))
    }

    fn begin_upload(&self, name: &str, _total_len: u64) -> Result<String, PublishError> {
        let mut counter = lock(&self.next_session);
        *counter += 1;
        let id = format!("session-{}", *counter);
        lock(&self.sessions).insert(
            id.clone(),
            Session {
                name: name.to_owned(),
                buf: Vec::new(),
            },
        );
        *lock(&self.uploads_begun) += 1;
        Ok(id)
    }

    fn upload_chunk(
        &self,
        session: &str,
        offset: u64,
        bytes: &[u8],
        chunk_digest: &Sha256Digest,
    ) -> Result<(), PublishError> {
        {
            let mut failures = lock(&self.fail_next_chunks);
            if *failures > 0 {
                *failures -= 1;
                return Err(PublishError::Transport {
                    reason: "injected chunk failure".to_owned(),
                });
            }
        }
        assert_eq!(
            chunk_digest,
            &Sha256Digest::of_bytes(bytes),
            "chunk checksum must cover the chunk bytes"
        );
        let mut sessions = lock(&self.sessions);
        let state = sessions.get_mut(session).expect("session must be open");
        assert_eq!(
            offset,
            state.buf.len() as u64,
            "chunks must arrive in order without gaps or re-sends"
        );
        state.buf.extend_from_slice(bytes);
        Ok(())
    }

    fn commit(
        &self,
        session: &str,
        name: &str,
        digest: &Sha256Digest,
    ) -> Result<(), PublishError> {
        let state = lock(&self.sessions)
            .remove(session)
            .expect("commit of an open session");
        assert_eq!(state.name, name);
        assert_eq!(
            digest,
            &Sha256Digest::of_bytes(&state.buf),
            "committed digest must cover the assembled bytes"
        );
        lock(&self.stored).insert(name.to_owned(), (digest.clone(), state.buf));
        Ok(())
    }

    fn abort(&self, session: &str) {
        lock(&self.sessions).remove(session);
        lock(&self.aborted).push(session.to_owned());
    }
}
