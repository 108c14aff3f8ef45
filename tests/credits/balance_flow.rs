use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use serde_json::json;
use tokio::sync::Notify;

use creditsync::credits::{
    error::CreditsErrorKind,
    telemetry::CreditsTelemetryEvent,
    types::{ApiRequest, ApiResponse, BalanceSource},
};

use crate::support::{
    ScriptedTransport, balance_body, client, credential, ok_json, status, wait_for_balance,
};

#[tokio::test]
async fn given_new_session_when_began_then_initial_pull_sets_ground_truth() {
    let transport = ScriptedTransport::new(|_request| async { balance_body(25) });
    let (client, _telemetry) = client(transport.clone());

    assert!(!client.read().is_known());
    let balance = client
        .begin_session(credential())
        .await
        .expect("initial pull should succeed");

    assert_eq!(balance.value, Some(25));
    assert_eq!(balance.source, Some(BalanceSource::Pull));
    assert!(balance.last_applied_at.is_some());
    assert_eq!(transport.calls_to("/credits/balance"), 1);
}

#[tokio::test]
async fn given_known_balance_when_reconciled_then_pull_value_replaces_it() {
    let pulls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&pulls);
    let transport = ScriptedTransport::new(move |_request| {
        let previous = counter.fetch_add(1, Ordering::SeqCst);
        async move { balance_body(if previous == 0 { 40 } else { 25 }) }
    });
    let (client, _telemetry) = client(transport);
    client.begin_session(credential()).await.expect("session should start");
    let before = client.read().sequence;

    let balance = client.reconcile().await.expect("reconcile should succeed");

    assert_eq!(balance.value, Some(25));
    assert_eq!(balance.source, Some(BalanceSource::Pull));
    assert_eq!(balance.sequence, before + 1);
}

#[tokio::test]
async fn given_concurrent_reconciles_when_pull_in_flight_then_one_request_serves_both() {
    let pulls = Arc::new(AtomicUsize::new(0));
    let started = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());

    let (counter, started_handle, release_handle) =
        (Arc::clone(&pulls), Arc::clone(&started), Arc::clone(&release));
    let transport = ScriptedTransport::new(move |_request| {
        let previous = counter.fetch_add(1, Ordering::SeqCst);
        let started = Arc::clone(&started_handle);
        let release = Arc::clone(&release_handle);
        async move {
            if previous > 0 {
                started.notify_one();
                release.notified().await;
            }
            balance_body(if previous == 0 { 10 } else { 31 })
        }
    });
    let (client, telemetry) = client(transport.clone());
    client.begin_session(credential()).await.expect("session should start");

    let (first, second, ()) = tokio::join!(client.reconcile(), client.reconcile(), async {
        started.notified().await;
        release.notify_one();
    });

    let first = first.expect("first caller should get the balance");
    let second = second.expect("second caller should get the balance");
    assert_eq!(first.value, Some(31));
    assert_eq!(first, second);
    assert_eq!(transport.calls_to("/credits/balance"), 2);
    assert!(telemetry.events().iter().any(|event| matches!(
        event,
        CreditsTelemetryEvent::ReconcileJoined { .. }
    )));
}

#[tokio::test]
async fn given_completed_pull_when_reconciled_again_then_a_fresh_request_is_sent() {
    let transport = ScriptedTransport::new(|_request| async { balance_body(12) });
    let (client, _telemetry) = client(transport.clone());
    client.begin_session(credential()).await.expect("session should start");

    client.reconcile().await.expect("first reconcile");
    client.reconcile().await.expect("second reconcile");

    assert_eq!(transport.calls_to("/credits/balance"), 3);
}

#[tokio::test]
async fn given_backend_failure_when_reconciled_then_balance_is_left_unchanged() {
    let pulls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&pulls);
    let transport = ScriptedTransport::new(move |_request| {
        let previous = counter.fetch_add(1, Ordering::SeqCst);
        async move {
            if previous == 0 {
                balance_body(10)
            } else {
                status(503, "maintenance")
            }
        }
    });
    let (client, telemetry) = client(transport);
    client.begin_session(credential()).await.expect("session should start");
    let before = client.read();

    let err = client.reconcile().await.expect_err("pull should fail");

    assert_eq!(err.kind, CreditsErrorKind::Backend);
    assert!(err.retryable);
    assert_eq!(err.http_status, Some(503));
    assert_eq!(client.read(), before);
    assert!(telemetry.events().iter().any(|event| matches!(
        event,
        CreditsTelemetryEvent::ReconcileFailed { .. }
    )));
}

#[tokio::test]
async fn given_negative_pull_when_reconciled_then_value_is_rejected() {
    let pulls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&pulls);
    let transport = ScriptedTransport::new(move |_request| {
        let previous = counter.fetch_add(1, Ordering::SeqCst);
        async move { balance_body(if previous == 0 { 10 } else { -5 }) }
    });
    let (client, _telemetry) = client(transport);
    client.begin_session(credential()).await.expect("session should start");

    let err = client.reconcile().await.expect_err("negative pull should fail");

    assert_eq!(err.kind, CreditsErrorKind::Protocol);
    assert_eq!(client.read().value, Some(10));
}

#[tokio::test]
async fn given_malformed_balance_body_when_reconciled_then_protocol_error() {
    let transport =
        ScriptedTransport::new(|_request| async { ok_json(json!({ "balance": "ten" })) });
    let (client, _telemetry) = client(transport);

    let err = client
        .begin_session(credential())
        .await
        .expect_err("malformed body should fail");

    assert_eq!(err.kind, CreditsErrorKind::Protocol);
    assert_eq!(err.endpoint.as_deref(), Some("/credits/balance"));
    assert!(!client.read().is_known());
}

#[tokio::test]
async fn given_binary_voice_response_when_received_then_balance_is_pulled() {
    let pulls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&pulls);
    let transport = ScriptedTransport::new(move |request: ApiRequest| {
        let counter = Arc::clone(&counter);
        async move {
            if request.path == "/api/voice/tts" {
                return Ok(ApiResponse::binary(200, "audio/mpeg", vec![0xff, 0xfb, 0x90]));
            }
            let previous = counter.fetch_add(1, Ordering::SeqCst);
            balance_body(if previous == 0 { 10 } else { 6 })
        }
    });
    let (client, _telemetry) = client(transport.clone());
    client.begin_session(credential()).await.expect("session should start");

    let response = client
        .send(ApiRequest::post("/api/voice/tts", json!({ "text": "hello" })))
        .await
        .expect("voice request should succeed");
    assert_eq!(response.body, vec![0xff, 0xfb, 0x90]);

    let balance = wait_for_balance(&client, |balance| balance.value == Some(6)).await;
    assert_eq!(balance.source, Some(BalanceSource::Pull));
    assert_eq!(transport.calls_to("/credits/balance"), 2);
}
