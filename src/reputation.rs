//! Reputation gate: external scanner consultation before publishing.
//!
//! The gate never produces verdicts itself; it consults a scanning
//! collaborator by content digest first, submits the artifact only when
//! the digest is unknown, and polls for the analysis outcome up to a
//! bounded deadline. An unreachable scanner is a distinct
//! [`ReputationVerdict::Unavailable`] state, never conflated with a
//! flagged artifact; configuration alone decides whether unscanned
//! artifacts may proceed.

use crate::artifact::Artifact;
use crate::config::ReputationSection;
use crate::digest::Sha256Digest;
use camino::Utf8Path;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Network timeout for a single scanner API call.
const SCAN_TIMEOUT: Duration = Duration::from_secs(60);

/// Detection counts reported by the scanning collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DetectorTally {
    /// Number of detectors that flagged the artifact.
    pub positives: u32,
    /// Number of detectors consulted.
    pub total: u32,
}

/// The gate's decision for one artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReputationVerdict {
    /// Scanned; detections at or below the configured threshold.
    Clean(DetectorTally),
    /// Scanned; detections above the configured threshold.
    Flagged(DetectorTally),
    /// No verdict could be obtained within the run's bounds.
    Unavailable {
        /// Why the verdict is missing.
        reason: String,
    },
}

impl ReputationVerdict {
    /// Short human-readable form for reports.
    #[must_use]
    pub fn summary(&self) -> String {
        match self {
            Self::Clean(tally) => format!("clean ({}/{} detections)", tally.positives, tally.total),
            Self::Flagged(tally) => {
                format!("flagged ({}/{} detections)", tally.positives, tally.total)
            }
            Self::Unavailable { reason } => format!("unavailable ({reason})"),
        }
    }
}

/// Progress of a submitted analysis.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollStatus {
    /// The analysis has not completed yet.
    Pending,
    /// The analysis finished with these counts.
    Complete(DetectorTally),
}

/// Errors arising from scanner communication.
#[derive(Debug, Error)]
pub enum ReputationError {
    /// Network-level failure: connect, timeout, or an error status.
    #[error("scanner transport error: {reason}")]
    Transport {
        /// Description of the failure.
        reason: String,
    },

    /// The scanner answered with a payload the client cannot interpret.
    #[error("scanner protocol error: {reason}")]
    Protocol {
        /// Description of the malformed answer.
        reason: String,
    },

    /// I/O failure reading the artifact for submission.
    #[error("I/O error reading artifact for submission: {0}")]
    Io(#[from] std::io::Error),
}

/// Trait for talking to the scanning collaborator.
#[cfg_attr(test, mockall::automock)]
pub trait ReputationClient {
    /// Look up a previously scanned digest.
    ///
    /// # Errors
    ///
    /// Returns [`ReputationError::Transport`] on network failure and
    /// [`ReputationError::Protocol`] on an uninterpretable answer. An
    /// unknown digest is `Ok(None)`, not an error.
    fn lookup(&self, digest: &Sha256Digest) -> Result<Option<DetectorTally>, ReputationError>;

    /// Submit artifact bytes for analysis, returning the analysis id.
    ///
    /// # Errors
    ///
    /// Returns [`ReputationError::Io`] when the artifact cannot be read
    /// and transport/protocol errors as for [`Self::lookup`].
    fn submit(&self, path: &Utf8Path) -> Result<String, ReputationError>;

    /// Check on a submitted analysis.
    ///
    /// # Errors
    ///
    /// Transport/protocol errors as for [`Self::lookup`].
    fn poll(&self, analysis_id: &str) -> Result<PollStatus, ReputationError>;
}

/// Fixed-interval rate gate shared by all workers.
///
/// Each acquisition reserves the next free slot under the lock and then
/// sleeps outside it, so a slow caller never blocks slot allocation for
/// the others.
///
/// # Examples
///
/// ```
/// use packferry::reputation::RateLimiter;
/// use std::time::Duration;
///
/// let limiter = RateLimiter::with_interval(Duration::ZERO);
/// limiter.acquire(); // a zero interval never sleeps
/// ```
#[derive(Debug)]
pub struct RateLimiter {
    interval: Duration,
    next_slot: Mutex<Instant>,
}

impl RateLimiter {
    /// Limiter allowing `requests_per_minute` calls, evenly spaced.
    #[must_use]
    pub fn per_minute(requests_per_minute: u32) -> Self {
        let interval = Duration::from_secs(60) / requests_per_minute.max(1);
        Self::with_interval(interval)
    }

    /// Limiter with an explicit inter-call interval. A zero interval
    /// never sleeps.
    #[must_use]
    pub fn with_interval(interval: Duration) -> Self {
        Self {
            interval,
            next_slot: Mutex::new(Instant::now()),
        }
    }

    /// Block until the caller's reserved slot arrives.
    pub fn acquire(&self) {
        let wait = {
            let mut slot = self
                .next_slot
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            let now = Instant::now();
            let reserved = (*slot).max(now);
            *slot = reserved + self.interval;
            reserved.saturating_duration_since(now)
        };
        if !wait.is_zero() {
            std::thread::sleep(wait);
        }
    }
}

/// The reputation gate: lookup, submit-and-poll, and policy judgement.
pub struct ReputationGate {
    client: Arc<dyn ReputationClient + Send + Sync>,
    limiter: Arc<RateLimiter>,
    flag_threshold: u32,
    poll_interval: Duration,
    poll_deadline: Duration,
}

impl ReputationGate {
    /// Build a gate from configuration, a client, and a shared limiter.
    #[must_use]
    pub fn new(
        client: Arc<dyn ReputationClient + Send + Sync>,
        limiter: Arc<RateLimiter>,
        settings: &ReputationSection,
    ) -> Self {
        Self {
            client,
            limiter,
            flag_threshold: settings.flag_threshold,
            poll_interval: Duration::from_secs(settings.poll_interval_secs),
            poll_deadline: Duration::from_secs(settings.poll_deadline_secs),
        }
    }

    /// Obtain a verdict for the artifact.
    ///
    /// A known digest answers from the scanner's cache without
    /// resubmission; an unknown digest is submitted and polled at the
    /// configured interval until the deadline expires.
    #[must_use]
    pub fn check(&self, artifact: &Artifact) -> ReputationVerdict {
        self.limiter.acquire();
        match self.client.lookup(&artifact.digest) {
            Ok(Some(tally)) => self.judge(tally),
            Ok(None) => self.submit_and_poll(artifact),
            Err(e) => ReputationVerdict::Unavailable {
                reason: e.to_string(),
            },
        }
    }

    fn submit_and_poll(&self, artifact: &Artifact) -> ReputationVerdict {
        self.limiter.acquire();
        let analysis_id = match self.client.submit(&artifact.path) {
            Ok(id) => id,
            Err(e) => {
                return ReputationVerdict::Unavailable {
                    reason: e.to_string(),
                };
            }
        };

        let started = Instant::now();
        loop {
            if started.elapsed() >= self.poll_deadline {
                return ReputationVerdict::Unavailable {
                    reason: format!(
                        "timeout: no verdict within {}s",
                        self.poll_deadline.as_secs()
                    ),
                };
            }
            std::thread::sleep(self.poll_interval);
            self.limiter.acquire();
            match self.client.poll(&analysis_id) {
                Ok(PollStatus::Pending) => {}
                Ok(PollStatus::Complete(tally)) => return self.judge(tally),
                Err(e) => {
                    return ReputationVerdict::Unavailable {
                        reason: e.to_string(),
                    };
                }
            }
        }
    }

    fn judge(&self, tally: DetectorTally) -> ReputationVerdict {
        if tally.positives > self.flag_threshold {
            log::warn!(
                "artifact flagged: {}/{} detections exceed threshold {}",
                tally.positives,
                tally.total,
                self.flag_threshold
            );
            ReputationVerdict::Flagged(tally)
        } else {
            ReputationVerdict::Clean(tally)
        }
    }
}

/// HTTP client for a digest-indexed file scanning API.
#[derive(Debug, Clone)]
pub struct HttpReputationClient {
    base_url: String,
    api_key: String,
}

impl HttpReputationClient {
    /// Build a client against `base_url`, authenticating with `api_key`.
    #[must_use]
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
        }
    }

    fn get_json(&self, url: &str) -> Result<serde_json::Value, ReputationError> {
        let mut response = scan_agent()
            .get(url)
            .header("x-apikey", &self.api_key)
            .call()
            .map_err(map_transport)?;
        response
            .body_mut()
            .read_json()
            .map_err(|e| ReputationError::Protocol {
                reason: e.to_string(),
            })
    }
}

impl ReputationClient for HttpReputationClient {
    fn lookup(&self, digest: &Sha256Digest) -> Result<Option<DetectorTally>, ReputationError> {
        let url = format!("{}/files/{}", self.base_url, digest);
        match self.get_json(&url) {
            Ok(body) => {
                let stats = &body["data"]["attributes"]["last_analysis_stats"];
                tally_from_stats(stats).map(Some)
            }
            Err(ReputationError::Transport { reason }) if reason == "status 404" => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn submit(&self, path: &Utf8Path) -> Result<String, ReputationError> {
        let bytes = std::fs::read(path)?;
        let url = format!("{}/files", self.base_url);
        let mut response = scan_agent()
            .post(&url)
            .header("x-apikey", &self.api_key)
            .content_type("application/octet-stream")
            .send(&bytes[..])
            .map_err(map_transport)?;
        let body: serde_json::Value =
            response
                .body_mut()
                .read_json()
                .map_err(|e| ReputationError::Protocol {
                    reason: e.to_string(),
                })?;
        body["data"]["id"]
            .as_str()
            .map(str::to_owned)
            .ok_or_else(|| ReputationError::Protocol {
                reason: "submission response carries no analysis id".to_owned(),
            })
    }

    fn poll(&self, analysis_id: &str) -> Result<PollStatus, ReputationError> {
        let url = format!("{}/analyses/{analysis_id}", self.base_url);
        let body = self.get_json(&url)?;
        match body["data"]["attributes"]["status"].as_str() {
            Some("completed") => {
                let stats = &body["data"]["attributes"]["stats"];
                tally_from_stats(stats).map(PollStatus::Complete)
            }
            Some(_) => Ok(PollStatus::Pending),
            None => Err(ReputationError::Protocol {
                reason: "analysis response carries no status".to_owned(),
            }),
        }
    }
}

/// Read detection counts from an analysis-stats JSON object.
///
/// `positives` is the count of detectors reporting malicious; `total`
/// sums every detector category present.
fn tally_from_stats(stats: &serde_json::Value) -> Result<DetectorTally, ReputationError> {
    let object = stats.as_object().ok_or_else(|| ReputationError::Protocol {
        reason: "analysis stats missing or not an object".to_owned(),
    })?;
    let count = |key: &str| {
        object
            .get(key)
            .and_then(serde_json::Value::as_u64)
            .unwrap_or(0) as u32
    };
    let positives = count("malicious");
    let total: u32 = object
        .values()
        .filter_map(serde_json::Value::as_u64)
        .map(|v| v as u32)
        .sum();
    Ok(DetectorTally { positives, total })
}

/// Shared agent for scanner calls, with its own timeout budget.
fn scan_agent() -> &'static ureq::Agent {
    static AGENT: OnceLock<ureq::Agent> = OnceLock::new();
    AGENT.get_or_init(|| {
        let config = ureq::Agent::config_builder()
            .timeout_global(Some(SCAN_TIMEOUT))
            .build();
        ureq::Agent::new_with_config(config)
    })
}

fn map_transport(err: ureq::Error) -> ReputationError {
    match err {
        ureq::Error::StatusCode(code) => ReputationError::Transport {
            reason: format!("status {code}"),
        },
        other => ReputationError::Transport {
            reason: other.to_string(),
        },
    }
}
