//! Pattern-analysis collaborator.
//!
//! The semantic judgment ("is VAT included in this entry?") is delegated to
//! an external service behind [`PatternAnalysisClient`]. The engine only
//! consumes the contract: a batch of records in, one [`Judgment`] per record
//! out, where anything short of a confident definitive answer is UNCERTAIN.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;
use tracing::warn;

/// Literal classification the service returns when it cannot decide.
pub const UNCERTAIN: &str = "UNCERTAIN";

// ── Wire types ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub counterpart: String,
    pub amount: i64,
    pub description: String,
    pub account_code: u32,
}

/// Ordered so that `Unknown < Low < Medium < High`. Parsing is
/// case-insensitive; unrecognized strings become `Unknown`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Confidence {
    Unknown,
    Low,
    Medium,
    High,
}

impl Confidence {
    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_uppercase().as_str() {
            "HIGH" => Self::High,
            "MEDIUM" => Self::Medium,
            "LOW" => Self::Low,
            _ => Self::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::High => "HIGH",
            Self::Medium => "MEDIUM",
            Self::Low => "LOW",
            Self::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for Confidence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for Confidence {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Confidence {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(Self::parse(&s))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Judgment {
    pub classification: String,
    pub confidence: Confidence,
    #[serde(default)]
    pub reasoning: String,
}

impl Judgment {
    pub fn new(classification: &str, confidence: Confidence, reasoning: &str) -> Self {
        Self {
            classification: classification.to_string(),
            confidence,
            reasoning: reasoning.to_string(),
        }
    }

    pub fn uncertain(reasoning: &str) -> Self {
        Self::new(UNCERTAIN, Confidence::Unknown, reasoning)
    }

    /// A judgment counts only when it is not the UNCERTAIN sentinel and its
    /// confidence reaches the floor. The confidence of an UNCERTAIN verdict
    /// is irrelevant.
    pub fn is_definitive(&self, floor: Confidence) -> bool {
        let class = self.classification.trim();
        !class.is_empty() && !class.eq_ignore_ascii_case(UNCERTAIN) && self.confidence >= floor
    }
}

// ── Client contract ─────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("analysis request timed out")]
    Timeout,
    #[error("analysis transport error: {0}")]
    Transport(String),
    #[error("analysis service returned HTTP {0}: {1}")]
    Http(u16, String),
    #[error("malformed analysis response: {0}")]
    Malformed(String),
    #[error("analysis response has {got} judgments for {expected} records")]
    CountMismatch { expected: usize, got: usize },
}

pub trait PatternAnalysisClient: Send + Sync {
    /// One judgment per record, in request order.
    fn analyze(&self, records: &[TransactionRecord]) -> Result<Vec<Judgment>, AnalysisError>;
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &crate::config::AnalysisConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_backoff: Duration::from_millis(config.backoff_ms),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnalysisOutcome {
    Judged(Vec<Judgment>),
    /// Retries exhausted or no client configured; every record is UNCERTAIN.
    Unavailable { attempts: u32, reason: String },
}

/// Call `client` with exponential backoff. Never fails: exhaustion degrades
/// to [`AnalysisOutcome::Unavailable`].
pub fn analyze_with_retry(
    client: Option<&dyn PatternAnalysisClient>,
    records: &[TransactionRecord],
    policy: RetryPolicy,
) -> AnalysisOutcome {
    let Some(client) = client else {
        return AnalysisOutcome::Unavailable {
            attempts: 0,
            reason: "no analysis client configured".into(),
        };
    };

    let mut backoff = policy.initial_backoff;
    let mut last_error = String::new();

    for attempt in 1..=policy.max_attempts {
        let result = client.analyze(records).and_then(|judgments| {
            if judgments.len() == records.len() {
                Ok(judgments)
            } else {
                Err(AnalysisError::CountMismatch {
                    expected: records.len(),
                    got: judgments.len(),
                })
            }
        });

        match result {
            Ok(judgments) => return AnalysisOutcome::Judged(judgments),
            Err(e) => {
                warn!(attempt, max = policy.max_attempts, error = %e, "pattern analysis failed");
                last_error = e.to_string();
                if attempt < policy.max_attempts {
                    thread::sleep(backoff);
                    backoff *= 2;
                }
            }
        }
    }

    AnalysisOutcome::Unavailable {
        attempts: policy.max_attempts,
        reason: last_error,
    }
}

// ── Deterministic stub ──────────────────────────────────────────────

type Rule = Box<dyn Fn(&TransactionRecord) -> Judgment + Send + Sync>;

/// In-process client for tests and offline runs. Counts calls so retry
/// behaviour can be asserted.
pub struct StubAnalysisClient {
    rule: Rule,
    failures_before_success: usize,
    calls: AtomicUsize,
}

impl StubAnalysisClient {
    pub fn new(rule: impl Fn(&TransactionRecord) -> Judgment + Send + Sync + 'static) -> Self {
        Self {
            rule: Box::new(rule),
            failures_before_success: 0,
            calls: AtomicUsize::new(0),
        }
    }

    /// Same judgment for every record.
    pub fn uniform(judgment: Judgment) -> Self {
        Self::new(move |_| judgment.clone())
    }

    /// Fails with a transport error `n` times before answering.
    pub fn failing_first(mut self, n: usize) -> Self {
        self.failures_before_success = n;
        self
    }

    /// Never answers.
    pub fn always_failing() -> Self {
        Self::uniform(Judgment::uncertain("unreachable")).failing_first(usize::MAX)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl PatternAnalysisClient for StubAnalysisClient {
    fn analyze(&self, records: &[TransactionRecord]) -> Result<Vec<Judgment>, AnalysisError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.failures_before_success {
            return Err(AnalysisError::Transport("stub failure".into()));
        }
        Ok(records.iter().map(|r| (self.rule)(r)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(amount: i64) -> TransactionRecord {
        TransactionRecord {
            counterpart: "(주)한빛".into(),
            amount,
            description: "매입 부가세".into(),
            account_code: 13500,
        }
    }

    fn fast() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            initial_backoff: Duration::ZERO,
        }
    }

    #[test]
    fn confidence_order_and_parse() {
        assert!(Confidence::High > Confidence::Medium);
        assert!(Confidence::Low > Confidence::Unknown);
        assert_eq!(Confidence::parse("high"), Confidence::High);
        assert_eq!(Confidence::parse("certain"), Confidence::Unknown);
        let j: Judgment =
            serde_json::from_str(r#"{"classification":"VAT_INCLUDED","confidence":"HIGH"}"#).unwrap();
        assert_eq!(j.confidence, Confidence::High);
        assert_eq!(j.reasoning, "");
    }

    #[test]
    fn uncertain_is_never_definitive() {
        let j = Judgment::new(UNCERTAIN, Confidence::High, "high but unsure");
        assert!(!j.is_definitive(Confidence::High));
        assert!(!Judgment::new("uncertain", Confidence::High, "").is_definitive(Confidence::Medium));
    }

    #[test]
    fn floor_applies() {
        let j = Judgment::new("VAT_INCLUDED", Confidence::Medium, "");
        assert!(!j.is_definitive(Confidence::High));
        assert!(j.is_definitive(Confidence::Medium));
    }

    #[test]
    fn retry_recovers_after_transient_failures() {
        let client = StubAnalysisClient::uniform(Judgment::new("VAT_EXCLUDED", Confidence::High, ""))
            .failing_first(2);
        let out = analyze_with_retry(Some(&client), &[record(100)], fast());
        assert!(matches!(out, AnalysisOutcome::Judged(ref j) if j.len() == 1));
        assert_eq!(client.calls(), 3);
    }

    #[test]
    fn retry_exhaustion_degrades() {
        let client = StubAnalysisClient::always_failing();
        let out = analyze_with_retry(Some(&client), &[record(100)], fast());
        match out {
            AnalysisOutcome::Unavailable { attempts, reason } => {
                assert_eq!(attempts, 3);
                assert!(reason.contains("stub failure"));
            }
            other => panic!("expected unavailable, got {other:?}"),
        }
        assert_eq!(client.calls(), 3);
    }

    #[test]
    fn short_response_counts_as_failure() {
        struct Short;
        impl PatternAnalysisClient for Short {
            fn analyze(&self, _: &[TransactionRecord]) -> Result<Vec<Judgment>, AnalysisError> {
                Ok(vec![])
            }
        }
        let out = analyze_with_retry(Some(&Short), &[record(1), record(2)], fast());
        assert!(matches!(out, AnalysisOutcome::Unavailable { .. }));
    }

    #[test]
    fn no_client_is_unavailable_without_calls() {
        let out = analyze_with_retry(None, &[record(1)], fast());
        assert!(matches!(out, AnalysisOutcome::Unavailable { attempts: 0, .. }));
    }
}
