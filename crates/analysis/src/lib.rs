//! Pattern-analysis HTTP client.
//!
//! Implements the pipeline's `PatternAnalysisClient` over a blocking reqwest
//! client (no Tokio runtime required). Retries and the UNCERTAIN fallback are
//! the pipeline's job; this crate makes exactly one request per call.

mod client;

pub use client::{HttpAnalysisClient, ANALYSIS_TASK, TOKEN_ENV};
