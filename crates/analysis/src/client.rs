use std::time::Duration;

use ledgerscan_pipeline::analysis::{AnalysisError, Judgment, PatternAnalysisClient, TransactionRecord};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Task name sent with every request.
pub const ANALYSIS_TASK: &str = "vat_judgment";

/// Optional bearer token for the analysis endpoint.
pub const TOKEN_ENV: &str = "LEDGERSCAN_ANALYSIS_TOKEN";

#[derive(Serialize)]
struct AnalysisRequest<'a> {
    task: &'static str,
    records: &'a [TransactionRecord],
}

#[derive(Deserialize)]
struct AnalysisResponse {
    judgments: Vec<Judgment>,
}

/// Pattern-analysis client (blocking).
#[derive(Clone)]
pub struct HttpAnalysisClient {
    http: reqwest::blocking::Client,
    endpoint: String,
    token: Option<String>,
}

impl HttpAnalysisClient {
    /// `timeout` applies to each request as a whole.
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self, AnalysisError> {
        let http = reqwest::blocking::Client::builder()
            .user_agent(format!("ledgerscan/{}", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()
            .map_err(|e| AnalysisError::Transport(e.to_string()))?;
        Ok(Self {
            http,
            endpoint: endpoint.into(),
            token: None,
        })
    }

    pub fn with_token(mut self, token: Option<String>) -> Self {
        self.token = token.filter(|t| !t.is_empty());
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

impl PatternAnalysisClient for HttpAnalysisClient {
    fn analyze(&self, records: &[TransactionRecord]) -> Result<Vec<Judgment>, AnalysisError> {
        let body = AnalysisRequest {
            task: ANALYSIS_TASK,
            records,
        };
        let mut request = self.http.post(&self.endpoint).json(&body);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request.send().map_err(|e| {
            if e.is_timeout() {
                AnalysisError::Timeout
            } else {
                AnalysisError::Transport(e.to_string())
            }
        })?;

        let status = response.status().as_u16();
        if !response.status().is_success() {
            let body = response.text().unwrap_or_default();
            return Err(AnalysisError::Http(status, body));
        }

        let parsed: AnalysisResponse = response
            .json()
            .map_err(|e| AnalysisError::Malformed(e.to_string()))?;
        debug!(records = records.len(), judgments = parsed.judgments.len(), "analysis response");

        if parsed.judgments.len() != records.len() {
            return Err(AnalysisError::CountMismatch {
                expected: records.len(),
                got: parsed.judgments.len(),
            });
        }
        Ok(parsed.judgments)
    }
}
