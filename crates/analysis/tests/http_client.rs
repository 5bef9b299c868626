use std::time::Duration;

use httpmock::prelude::*;
use ledgerscan_analysis::HttpAnalysisClient;
use ledgerscan_pipeline::analysis::{
    analyze_with_retry, AnalysisError, AnalysisOutcome, Confidence, PatternAnalysisClient, RetryPolicy,
    TransactionRecord,
};

fn records() -> Vec<TransactionRecord> {
    vec![
        TransactionRecord {
            counterpart: "(주)상대처".into(),
            amount: 110000,
            description: "매입 부가세".into(),
            account_code: 13500,
        },
        TransactionRecord {
            counterpart: "세무서".into(),
            amount: 5000,
            description: "환급".into(),
            account_code: 13500,
        },
    ]
}

fn client(server: &MockServer) -> HttpAnalysisClient {
    HttpAnalysisClient::new(server.url("/v1/analyze"), Duration::from_secs(5)).unwrap()
}

#[test]
fn judgments_come_back_in_order() {
    let server = MockServer::start();
    let mock = server.mock(|when, then| {
        when.method(POST)
            .path("/v1/analyze")
            .header("authorization", "Bearer secret")
            .body_contains("\"task\":\"vat_judgment\"")
            .body_contains("\"account_code\":13500");
        then.status(200)
            .header("content-type", "application/json")
            .json_body(serde_json::json!({
                "judgments": [
                    { "classification": "VAT_INCLUDED", "confidence": "high", "reasoning": "invoice" },
                    { "classification": "UNCERTAIN", "confidence": "HIGH" }
                ]
            }));
    });

    let judgments = client(&server)
        .with_token(Some("secret".into()))
        .analyze(&records())
        .unwrap();

    mock.assert();
    assert_eq!(judgments.len(), 2);
    assert_eq!(judgments[0].confidence, Confidence::High);
    assert!(judgments[0].is_definitive(Confidence::High));
    assert!(!judgments[1].is_definitive(Confidence::Low));
    assert_eq!(judgments[1].reasoning, "");
}

#[test]
fn server_error_is_http_error() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(POST).path("/v1/analyze");
        then.status(503).body("overloaded");
    });

    let err = client(&server).analyze(&records()).unwrap_err();
    match err {
        AnalysisError::Http(status, body) => {
            assert_eq!(status, 503);
            assert_eq!(body, "overloaded");
        }
        other => panic!("expected HTTP error, got {other:?}"),
    }
}

#[test]
fn short_response_is_rejected() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(POST).path("/v1/analyze");
        then.status(200).json_body(serde_json::json!({
            "judgments": [{ "classification": "VAT_INCLUDED", "confidence": "HIGH" }]
        }));
    });

    let err = client(&server).analyze(&records()).unwrap_err();
    assert!(matches!(err, AnalysisError::CountMismatch { expected: 2, got: 1 }));
}

#[test]
fn malformed_body_is_rejected() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(POST).path("/v1/analyze");
        then.status(200).body("not json");
    });

    let err = client(&server).analyze(&records()).unwrap_err();
    assert!(matches!(err, AnalysisError::Malformed(_)));
}

#[test]
fn slow_service_times_out() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(POST).path("/v1/analyze");
        then.status(200)
            .delay(Duration::from_millis(800))
            .json_body(serde_json::json!({ "judgments": [] }));
    });

    let slow = HttpAnalysisClient::new(server.url("/v1/analyze"), Duration::from_millis(100)).unwrap();
    let err = slow.analyze(&records()).unwrap_err();
    assert!(matches!(err, AnalysisError::Timeout));
}

#[test]
fn retries_stop_at_the_attempt_limit() {
    let server = MockServer::start();
    let mock = server.mock(|when, then| {
        when.method(POST).path("/v1/analyze");
        then.status(500);
    });

    let client = client(&server);
    let policy = RetryPolicy {
        max_attempts: 3,
        initial_backoff: Duration::ZERO,
    };
    let outcome = analyze_with_retry(Some(&client), &records(), policy);

    mock.assert_hits(3);
    assert!(matches!(outcome, AnalysisOutcome::Unavailable { attempts: 3, .. }));
}
