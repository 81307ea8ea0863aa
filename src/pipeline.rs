//! Run orchestration: the only module that sequences pipeline stages.
//!
//! Entries flow through a bounded worker pool; inside one worker the
//! stages for an entry run strictly in order. A content-hash claim is
//! checked against the downloaded bytes before any conversion; a
//! signer-token claim is checked after normalization against the
//! payload that actually carries the signature. Nothing reaches the
//! publisher without a verified identity and an acceptable reputation
//! verdict. Every entry ends in exactly one ledger outcome; one entry's
//! failure never aborts the run.

use crate::artifact::Artifact;
use crate::cancel::CancelFlag;
use crate::catalog::{CatalogEntry, IdentityClaim};
use crate::config::{RunConfig, UnavailablePolicy};
use crate::fetch::ArtifactFetcher;
use crate::ledger::{RunLedger, RunOutcome, RunReport, RunState};
use crate::normalize::{CanonicalArtifact, normalize};
use crate::output::write_stderr_line;
use crate::publish::{DistributionEndpoint, PublishError, publish};
use crate::reputation::{ReputationGate, ReputationVerdict};
use crate::verify::{SignatureReader, VerificationResult, verify_identity};
use camino::Utf8PathBuf;
use chrono::Utc;
use std::io::Write;
use std::sync::{Arc, Mutex, PoisonError};

/// Shared sink for per-entry progress lines.
pub type ProgressSink = Mutex<Box<dyn Write + Send>>;

/// Everything a run needs, with trait objects at every external seam.
pub struct PipelineContext {
    /// Artifact retrieval.
    pub fetcher: Arc<dyn ArtifactFetcher + Send + Sync>,
    /// Signature inspection for publisher-identity claims.
    pub signatures: Arc<dyn SignatureReader + Send + Sync>,
    /// Reputation gate; `None` when checking is disabled by config.
    pub reputation: Option<ReputationGate>,
    /// Distribution endpoint.
    pub endpoint: Arc<dyn DistributionEndpoint + Send + Sync>,
    /// Run configuration.
    pub config: RunConfig,
    /// Run-level cancellation flag.
    pub cancel: CancelFlag,
}

/// Process every catalog entry through a bounded worker pool and
/// produce the finalized report.
///
/// Cancellation semantics: entries not yet started are recorded as
/// [`RunState::Cancelled`] without timings; in-flight entries finish
/// their current stage boundary and record their real or cancelled
/// outcome; completed entries keep their outcome. The ledger is always
/// finalized.
pub fn run(ctx: &PipelineContext, entries: &[CatalogEntry], progress: &ProgressSink) -> RunReport {
    let started_at = Utc::now();
    let ledger = RunLedger::new();
    let jobs = ctx.config.run.jobs.min(entries.len().max(1));

    let (tx, rx) = crossbeam_channel::unbounded::<CatalogEntry>();
    for entry in entries {
        // Send on an unbounded channel with a live receiver cannot fail.
        let _ = tx.send(entry.clone());
    }
    drop(tx);

    std::thread::scope(|scope| {
        for _ in 0..jobs {
            let rx = rx.clone();
            let ledger = &ledger;
            scope.spawn(move || {
                while let Ok(entry) = rx.recv() {
                    let outcome = if ctx.cancel.is_cancelled() {
                        RunOutcome::never_started(&entry.name)
                    } else {
                        process_entry(ctx, &entry)
                    };
                    report_progress(progress, &outcome);
                    ledger.record(outcome);
                }
            });
        }
    });

    ledger.finalize(started_at)
}

/// Run all stages for one entry. This is the per-entry failure
/// boundary: every stage error becomes a ledger outcome here.
pub fn process_entry(ctx: &PipelineContext, entry: &CatalogEntry) -> RunOutcome {
    let outcome = RunOutcome::started(&entry.name, Utc::now());
    let workdir = ctx.config.run.downloads_dir.join(&entry.name);
    if let Err(e) = std::fs::create_dir_all(&workdir) {
        return outcome.failed(
            RunState::TransportError,
            format!("cannot create working directory {workdir}: {e}"),
        );
    }

    let result = run_stages(ctx, entry, &workdir, outcome);

    if !ctx.config.run.retain_artifacts {
        if let Err(e) = std::fs::remove_dir_all(&workdir) {
            log::warn!("{}: failed to clean working directory: {e}", entry.name);
        }
    }
    result
}

fn run_stages(
    ctx: &PipelineContext,
    entry: &CatalogEntry,
    workdir: &Utf8PathBuf,
    mut outcome: RunOutcome,
) -> RunOutcome {
    // Fetch.
    let dest = workdir.join(download_file_name(&entry.url, &entry.name));
    let fetched = match ctx.fetcher.fetch(&entry.url, &dest) {
        Ok(fetched) => fetched,
        Err(e) => return outcome.failed(RunState::TransportError, e.to_string()),
    };
    let downloaded = Artifact {
        name: entry.name.clone(),
        path: fetched.path,
        len: fetched.len,
        digest: fetched.digest,
    };
    log::info!(
        "{}: fetched {} bytes, sha256 {}",
        entry.name,
        downloaded.len,
        downloaded.digest
    );

    // A hash claim describes the downloaded bytes; check it before any
    // conversion touches them.
    if matches!(entry.identity, IdentityClaim::ContentDigest { .. }) {
        let result = verify_identity(
            &entry.identity,
            &downloaded.path,
            &downloaded.digest,
            &downloaded.path,
            ctx.signatures.as_ref(),
        );
        outcome = match record_verification(outcome, &result) {
            Ok(outcome) => outcome,
            Err(finished) => return finished,
        };
    }

    // Normalize to the canonical installer shape.
    let CanonicalArtifact {
        artifact: canonical,
        signature_source,
    } = match normalize(entry, &downloaded, workdir) {
        Ok(canonical) => canonical,
        Err(e) => return outcome.failed(RunState::ConversionFailed, e.to_string()),
    };
    outcome = outcome.with_artifact(canonical.len, canonical.digest.as_str());

    // A signer claim describes the payload's embedded signature, which
    // only exists after normalization (never the container wrapper).
    if matches!(entry.identity, IdentityClaim::SignerToken(_)) {
        let result = verify_identity(
            &entry.identity,
            &downloaded.path,
            &downloaded.digest,
            &signature_source,
            ctx.signatures.as_ref(),
        );
        outcome = match record_verification(outcome, &result) {
            Ok(outcome) => outcome,
            Err(finished) => return finished,
        };
    }

    // Reputation gate.
    match &ctx.reputation {
        None => {
            outcome = outcome.with_verdict("reputation checking disabled");
        }
        Some(gate) => {
            let verdict = gate.check(&canonical);
            outcome = outcome.with_verdict(verdict.summary());
            match verdict {
                ReputationVerdict::Clean(_) => {}
                ReputationVerdict::Flagged(tally) => {
                    return outcome.failed(
                        RunState::Flagged,
                        format!("{}/{} detectors flagged the artifact", tally.positives, tally.total),
                    );
                }
                ReputationVerdict::Unavailable { reason } => {
                    match ctx.config.reputation.unavailable_policy {
                        UnavailablePolicy::Block => {
                            return outcome
                                .failed(RunState::ReputationUnavailableBlocked, reason);
                        }
                        UnavailablePolicy::Allow => {
                            outcome = outcome
                                .with_warning(format!("published without verdict: {reason}"));
                        }
                    }
                }
            }
        }
    }

    // Publish. The flag is checked again here and between chunks.
    if ctx.cancel.is_cancelled() {
        return outcome.cancelled();
    }
    match publish(
        ctx.endpoint.as_ref(),
        &canonical,
        &ctx.config.distribution,
        &ctx.cancel,
    ) {
        Ok(receipt) => {
            if receipt.already_current {
                log::info!("{}: endpoint already current, nothing sent", entry.name);
            }
            outcome.success()
        }
        Err(PublishError::Cancelled) => outcome.cancelled(),
        Err(e @ (PublishError::ChunkExhausted { .. } | PublishError::CommitFailed { .. })) => {
            outcome.failed(RunState::PublishFailed, e.to_string())
        }
        Err(e) => outcome.failed(RunState::TransportError, e.to_string()),
    }
}

/// Fold a verification result into the outcome. A claim that did not
/// hold is `VerificationFailed`; an artifact that could not be
/// inspected at all is `TransportError`, never a trust verdict.
fn record_verification(
    outcome: RunOutcome,
    result: &VerificationResult,
) -> Result<RunOutcome, RunOutcome> {
    let outcome = outcome.with_verification(result.summary());
    match result {
        VerificationResult::Verified { .. } => Ok(outcome),
        VerificationResult::Failed { .. } => {
            Err(outcome.failed(RunState::VerificationFailed, result.summary()))
        }
        VerificationResult::Unverifiable { .. } => {
            Err(outcome.failed(RunState::TransportError, result.summary()))
        }
    }
}

/// Derive a local file name from the URL's last path segment.
fn download_file_name(url: &str, fallback: &str) -> String {
    let without_query = url.split(['?', '#']).next().unwrap_or(url);
    let after_scheme = without_query
        .split_once("://")
        .map_or(without_query, |(_, rest)| rest);
    match after_scheme.split('/').skip(1).last() {
        Some(segment) if !segment.is_empty() => segment.to_owned(),
        _ => format!("{fallback}.download"),
    }
}

fn report_progress(progress: &ProgressSink, outcome: &RunOutcome) {
    let marker = match outcome.state {
        RunState::Success => "ok  ",
        RunState::Cancelled => "stop",
        _ => "FAIL",
    };
    let mut sink = progress.lock().unwrap_or_else(PoisonError::into_inner);
    write_stderr_line(&mut **sink, format!("  {marker}  {}  {}", outcome.name, outcome.state));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::PackageKind;
    use crate::config::ReputationSection;
    use crate::digest::Sha256Digest;
    use crate::fetch::{FetchError, FetchedArtifact, MockArtifactFetcher};
    use crate::publish::MockDistributionEndpoint;
    use crate::reputation::{DetectorTally, MockReputationClient, RateLimiter};
    use crate::verify::MockSignatureReader;
    use std::time::Duration;

    const PAYLOAD: &[u8] = b"installer-bytes";

    fn quiet_sink() -> ProgressSink {
        Mutex::new(Box::new(std::io::sink()))
    }

    fn test_config(dir: &tempfile::TempDir) -> RunConfig {
        let mut config = RunConfig::default();
        config.run.downloads_dir =
            Utf8PathBuf::from_path_buf(dir.path().join("downloads")).expect("utf8 path");
        config.run.jobs = 2;
        config.distribution.base_url = "https://dist.example".to_owned();
        config.distribution.retry_backoff_ms = 0;
        config
    }

    /// A fetcher that writes `PAYLOAD` to the destination.
    fn payload_fetcher() -> MockArtifactFetcher {
        let mut fetcher = MockArtifactFetcher::new();
        fetcher.expect_fetch().returning(|_, dest| {
            std::fs::write(dest, PAYLOAD).map_err(FetchError::Io)?;
            Ok(FetchedArtifact {
                path: dest.to_owned(),
                len: PAYLOAD.len() as u64,
                digest: Sha256Digest::of_bytes(PAYLOAD),
            })
        });
        fetcher
    }

    /// An endpoint that accepts anything.
    fn accepting_endpoint() -> MockDistributionEndpoint {
        let mut endpoint = MockDistributionEndpoint::new();
        endpoint.expect_authenticate().returning(|| Ok(()));
        endpoint.expect_existing_digest().returning(|_| Ok(None));
        endpoint
            .expect_begin_upload()
            .returning(|_, _| Ok("session".to_owned()));
        endpoint
            .expect_upload_chunk()
            .returning(|_, _, _, _| Ok(()));
        endpoint.expect_commit().returning(|_, _, _| Ok(()));
        endpoint
    }

    fn flat_entry(name: &str, identity: IdentityClaim) -> CatalogEntry {
        CatalogEntry {
            name: name.to_owned(),
            url: format!("https://downloads.example/{name}.pkg"),
            kind: PackageKind::Flat,
            identity,
        }
    }

    fn sha256_claim_for(bytes: &[u8]) -> IdentityClaim {
        IdentityClaim::ContentDigest {
            algorithm: crate::digest::DigestAlgorithm::Sha256,
            value: Sha256Digest::of_bytes(bytes).into_inner(),
        }
    }

    fn context(
        dir: &tempfile::TempDir,
        fetcher: MockArtifactFetcher,
        endpoint: MockDistributionEndpoint,
        reputation: Option<ReputationGate>,
    ) -> PipelineContext {
        PipelineContext {
            fetcher: Arc::new(fetcher),
            signatures: Arc::new(MockSignatureReader::new()),
            reputation,
            endpoint: Arc::new(endpoint),
            config: test_config(dir),
            cancel: CancelFlag::new(),
        }
    }

    fn gate_with_tally(positives: u32) -> ReputationGate {
        let mut client = MockReputationClient::new();
        client.expect_lookup().returning(move |_| {
            Ok(Some(DetectorTally {
                positives,
                total: 70,
            }))
        });
        ReputationGate::new(
            Arc::new(client),
            Arc::new(RateLimiter::with_interval(Duration::ZERO)),
            &ReputationSection::default(),
        )
    }

    #[test]
    fn flat_entry_with_matching_digest_publishes() {
        let dir = tempfile::tempdir().expect("temp dir");
        let ctx = context(&dir, payload_fetcher(), accepting_endpoint(), None);
        let entry = flat_entry("App1", sha256_claim_for(PAYLOAD));

        let outcome = process_entry(&ctx, &entry);
        assert_eq!(outcome.state, RunState::Success);
        assert_eq!(outcome.artifact_size, Some(PAYLOAD.len() as u64));
        assert!(outcome.verification.as_deref().unwrap().contains("content-hash"));
        assert_eq!(outcome.verdict.as_deref(), Some("reputation checking disabled"));
    }

    #[test]
    fn digest_mismatch_never_reaches_the_publisher() {
        let dir = tempfile::tempdir().expect("temp dir");
        // No endpoint expectations: any publish call panics the mock.
        let ctx = context(
            &dir,
            payload_fetcher(),
            MockDistributionEndpoint::new(),
            None,
        );
        let entry = flat_entry("App1", sha256_claim_for(b"different-bytes"));

        let outcome = process_entry(&ctx, &entry);
        assert_eq!(outcome.state, RunState::VerificationFailed);
        assert!(outcome.error.as_deref().unwrap().contains("digest-mismatch"));
    }

    #[test]
    fn unreadable_signature_tooling_is_a_transport_outcome() {
        let dir = tempfile::tempdir().expect("temp dir");
        let mut ctx = context(&dir, payload_fetcher(), MockDistributionEndpoint::new(), None);
        let mut reader = MockSignatureReader::new();
        reader.expect_signer_token().returning(|_| {
            Err(crate::verify::SignatureError::Io(std::io::Error::other(
                "pkgutil not found",
            )))
        });
        ctx.signatures = Arc::new(reader);
        let entry = flat_entry("App1", IdentityClaim::SignerToken("TEAM123456".to_owned()));

        let outcome = process_entry(&ctx, &entry);
        assert_eq!(outcome.state, RunState::TransportError);
        assert_eq!(
            outcome.failure_class,
            Some(crate::ledger::FailureClass::Infrastructure)
        );
    }

    #[test]
    fn fetch_failure_is_a_transport_outcome() {
        let dir = tempfile::tempdir().expect("temp dir");
        let mut fetcher = MockArtifactFetcher::new();
        fetcher.expect_fetch().returning(|url, _| {
            Err(FetchError::Transport {
                url: url.to_owned(),
                reason: "connect timeout".to_owned(),
            })
        });
        let ctx = context(&dir, fetcher, MockDistributionEndpoint::new(), None);

        let outcome = process_entry(&ctx, &flat_entry("App1", sha256_claim_for(PAYLOAD)));
        assert_eq!(outcome.state, RunState::TransportError);
    }

    #[test]
    fn flagged_artifact_is_not_published() {
        let dir = tempfile::tempdir().expect("temp dir");
        let ctx = context(
            &dir,
            payload_fetcher(),
            MockDistributionEndpoint::new(),
            Some(gate_with_tally(3)),
        );

        let outcome = process_entry(&ctx, &flat_entry("App1", sha256_claim_for(PAYLOAD)));
        assert_eq!(outcome.state, RunState::Flagged);
        assert!(outcome.verdict.as_deref().unwrap().contains("flagged"));
    }

    #[test]
    fn unavailable_scanner_fails_open_with_a_warning() {
        let dir = tempfile::tempdir().expect("temp dir");
        let mut client = MockReputationClient::new();
        client.expect_lookup().returning(|_| {
            Err(crate::reputation::ReputationError::Transport {
                reason: "connection refused".to_owned(),
            })
        });
        let gate = ReputationGate::new(
            Arc::new(client),
            Arc::new(RateLimiter::with_interval(Duration::ZERO)),
            &ReputationSection::default(),
        );
        let mut ctx = context(&dir, payload_fetcher(), accepting_endpoint(), Some(gate));
        ctx.config.reputation.unavailable_policy = UnavailablePolicy::Allow;

        let outcome = process_entry(&ctx, &flat_entry("App1", sha256_claim_for(PAYLOAD)));
        assert_eq!(outcome.state, RunState::Success);
        assert!(outcome.warning.as_deref().unwrap().contains("connection refused"));
    }

    #[test]
    fn unavailable_scanner_fails_closed_by_default() {
        let dir = tempfile::tempdir().expect("temp dir");
        let mut client = MockReputationClient::new();
        client.expect_lookup().returning(|_| {
            Err(crate::reputation::ReputationError::Transport {
                reason: "connection refused".to_owned(),
            })
        });
        let gate = ReputationGate::new(
            Arc::new(client),
            Arc::new(RateLimiter::with_interval(Duration::ZERO)),
            &ReputationSection::default(),
        );
        let ctx = context(
            &dir,
            payload_fetcher(),
            MockDistributionEndpoint::new(),
            Some(gate),
        );

        let outcome = process_entry(&ctx, &flat_entry("App1", sha256_claim_for(PAYLOAD)));
        assert_eq!(outcome.state, RunState::ReputationUnavailableBlocked);
    }

    #[test]
    fn cancelled_run_records_unstarted_entries() {
        let dir = tempfile::tempdir().expect("temp dir");
        // No fetcher expectations: a fetch attempt panics the mock.
        let ctx = context(
            &dir,
            MockArtifactFetcher::new(),
            MockDistributionEndpoint::new(),
            None,
        );
        ctx.cancel.cancel();

        let entries = vec![
            flat_entry("App1", sha256_claim_for(PAYLOAD)),
            flat_entry("App2", sha256_claim_for(PAYLOAD)),
        ];
        let report = run(&ctx, &entries, &quiet_sink());
        assert_eq!(report.summary.total, 2);
        assert_eq!(report.summary.cancelled, 2);
        assert!(report.outcomes.iter().all(|o| o.started_at.is_none()));
    }

    #[test]
    fn working_directories_are_removed_unless_retained() {
        let dir = tempfile::tempdir().expect("temp dir");
        let mut ctx = context(&dir, payload_fetcher(), accepting_endpoint(), None);
        let entry = flat_entry("App1", sha256_claim_for(PAYLOAD));

        let _ = process_entry(&ctx, &entry);
        assert!(!ctx.config.run.downloads_dir.join("App1").exists());

        ctx.config.run.retain_artifacts = true;
        let _ = process_entry(&ctx, &entry);
        assert!(ctx.config.run.downloads_dir.join("App1").exists());
    }

    #[rstest::rstest]
    #[case::plain("https://downloads.example/App1.pkg", "App1.pkg")]
    #[case::query("https://downloads.example/App1.zip?token=abc", "App1.zip")]
    #[case::trailing_slash("https://downloads.example/", "App1.download")]
    fn download_file_names(#[case] url: &str, #[case] expected: &str) {
        assert_eq!(download_file_name(url, "App1"), expected);
    }
}
