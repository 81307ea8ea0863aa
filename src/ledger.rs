//! Run ledger: the append-only collector of per-entry outcomes.
//!
//! Workers append under mutual exclusion; nothing outside this module
//! ever sees a partial view. `finalize` consumes the ledger (so it can
//! only happen once), sorts outcomes by logical name to keep reports
//! diff-stable across runs, and produces the serializable [`RunReport`]
//! that is the sole contract surface for the invoking collaborator.

use camino::Utf8Path;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::sync::Mutex;

/// Final state of one catalog entry in one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RunState {
    /// Verified, clean, and published.
    Success,
    /// The identity claim did not hold.
    VerificationFailed,
    /// Container normalization failed.
    ConversionFailed,
    /// The reputation verdict exceeded the flag threshold.
    Flagged,
    /// No reputation verdict was obtainable and policy is fail-closed.
    ReputationUnavailableBlocked,
    /// Chunk transfer or commit failed at the distribution endpoint.
    PublishFailed,
    /// Download or transfer-level failure.
    TransportError,
    /// The run was cancelled before this entry completed.
    Cancelled,
}

impl RunState {
    /// Which investigation path this state demands of an operator.
    ///
    /// Untrusted content needs publisher-side investigation; an
    /// infrastructure failure just needs a retry on a later run.
    #[must_use]
    pub fn failure_class(self) -> Option<FailureClass> {
        match self {
            Self::Success => None,
            Self::VerificationFailed | Self::ConversionFailed | Self::Flagged => {
                Some(FailureClass::UntrustedContent)
            }
            Self::ReputationUnavailableBlocked
            | Self::PublishFailed
            | Self::TransportError
            | Self::Cancelled => Some(FailureClass::Infrastructure),
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Coarse operator-facing classification of a failed outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FailureClass {
    /// The artifact itself is suspect; investigate before retrying.
    #[serde(rename = "untrusted-content")]
    UntrustedContent,
    /// Transient or environmental; safe to retry on a later run.
    #[serde(rename = "infrastructure")]
    Infrastructure,
}

/// One entry's outcome record, append-only within a run.
#[derive(Debug, Clone, Serialize)]
pub struct RunOutcome {
    /// Logical package name.
    pub name: String,
    /// Final state.
    pub state: RunState,
    /// Operator-facing failure classification, absent on success.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_class: Option<FailureClass>,
    /// When processing of this entry began.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// When processing of this entry ended.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    /// Size of the canonical artifact in bytes, when one was produced.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact_size: Option<u64>,
    /// SHA-256 digest of the canonical artifact.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
    /// How the identity verification decided, for auditability.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verification: Option<String>,
    /// Reputation verdict summary.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verdict: Option<String>,
    /// Non-fatal warning (for example an unavailable scanner under a
    /// fail-open policy).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
    /// Error detail for failed states.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RunOutcome {
    /// Begin an outcome record for an entry whose processing has started.
    ///
    /// The state defaults to [`RunState::Cancelled`]: an in-flight entry
    /// that never reaches a finisher was interrupted.
    #[must_use]
    pub fn started(name: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            name: name.into(),
            state: RunState::Cancelled,
            failure_class: RunState::Cancelled.failure_class(),
            started_at: Some(at),
            finished_at: None,
            artifact_size: None,
            digest: None,
            verification: None,
            verdict: None,
            warning: None,
            error: None,
        }
    }

    /// Record an entry the run never started on before cancellation.
    #[must_use]
    pub fn never_started(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: RunState::Cancelled,
            failure_class: RunState::Cancelled.failure_class(),
            started_at: None,
            finished_at: None,
            artifact_size: None,
            digest: None,
            verification: None,
            verdict: None,
            warning: None,
            error: None,
        }
    }

    /// Attach canonical artifact details.
    #[must_use]
    pub fn with_artifact(mut self, size: u64, digest: impl Into<String>) -> Self {
        self.artifact_size = Some(size);
        self.digest = Some(digest.into());
        self
    }

    /// Attach the verification evidence or failure reason.
    #[must_use]
    pub fn with_verification(mut self, detail: impl Into<String>) -> Self {
        self.verification = Some(detail.into());
        self
    }

    /// Attach the reputation verdict summary.
    #[must_use]
    pub fn with_verdict(mut self, detail: impl Into<String>) -> Self {
        self.verdict = Some(detail.into());
        self
    }

    /// Attach a non-fatal warning.
    #[must_use]
    pub fn with_warning(mut self, detail: impl Into<String>) -> Self {
        self.warning = Some(detail.into());
        self
    }

    /// Finish the record successfully.
    #[must_use]
    pub fn success(mut self) -> Self {
        self.state = RunState::Success;
        self.failure_class = None;
        self.finished_at = Some(Utc::now());
        self
    }

    /// Finish the record in a failed state with error detail.
    #[must_use]
    pub fn failed(mut self, state: RunState, error: impl Into<String>) -> Self {
        self.state = state;
        self.failure_class = state.failure_class();
        self.error = Some(error.into());
        self.finished_at = Some(Utc::now());
        self
    }

    /// Finish the record as cancelled mid-flight.
    #[must_use]
    pub fn cancelled(mut self) -> Self {
        self.state = RunState::Cancelled;
        self.failure_class = RunState::Cancelled.failure_class();
        self.finished_at = Some(Utc::now());
        self
    }
}

/// Aggregate counts for the report header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    /// Entries processed (or skipped under cancellation).
    pub total: usize,
    /// Entries that reached [`RunState::Success`].
    pub succeeded: usize,
    /// Entries in any failed state.
    pub failed: usize,
    /// Entries cancelled before completion.
    pub cancelled: usize,
}

/// The finalized, complete result set of one run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    /// When the run started.
    pub started_at: DateTime<Utc>,
    /// When the report was finalized.
    pub generated_at: DateTime<Utc>,
    /// Aggregate counts.
    pub summary: RunSummary,
    /// Per-entry outcomes, sorted by logical name.
    pub outcomes: Vec<RunOutcome>,
}

impl RunReport {
    /// Whether any entry failed (cancelled entries do not count as
    /// failures; they are retried wholesale on the next run).
    #[must_use]
    pub fn has_failures(&self) -> bool {
        self.summary.failed > 0
    }

    /// Serialize the report as pretty-printed JSON.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    /// Write the serialized report to `path`, creating parent directories.
    pub fn write_to(&self, path: &Utf8Path) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = self.to_json().map_err(std::io::Error::other)?;
        std::fs::write(path, json)
    }
}

/// Mutex-guarded append-only outcome collector.
#[derive(Debug, Default)]
pub struct RunLedger {
    entries: Mutex<Vec<RunOutcome>>,
}

impl RunLedger {
    /// Create an empty ledger.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one outcome under the lock.
    pub fn record(&self, outcome: RunOutcome) {
        let mut entries = self
            .entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        entries.push(outcome);
    }

    /// Consume the ledger and produce the finalized report.
    ///
    /// Consuming `self` makes double-finalization a compile error.
    #[must_use]
    pub fn finalize(self, started_at: DateTime<Utc>) -> RunReport {
        let mut outcomes = self
            .entries
            .into_inner()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        outcomes.sort_by(|a, b| a.name.cmp(&b.name));

        let total = outcomes.len();
        let succeeded = outcomes
            .iter()
            .filter(|o| o.state == RunState::Success)
            .count();
        let cancelled = outcomes
            .iter()
            .filter(|o| o.state == RunState::Cancelled)
            .count();
        let failed = total - succeeded - cancelled;

        RunReport {
            started_at,
            generated_at: Utc::now(),
            summary: RunSummary {
                total,
                succeeded,
                failed,
                cancelled,
            },
            outcomes,
        }
    }
}
