use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use serde_json::json;
use tokio::sync::Notify;

use creditsync::credits::{
    error::CreditsErrorKind,
    session::SessionStatus,
    telemetry::{CreditsTelemetryEvent, SessionEndReason},
    types::{ApiRequest, BalanceSource, SessionCredential},
};

use crate::support::{ScriptedTransport, balance_body, client, credential, ok_json, status};

#[tokio::test]
async fn given_unauthorized_feature_response_when_received_then_session_is_reset() {
    let transport = ScriptedTransport::new(|request: ApiRequest| async move {
        match request.path.as_str() {
            "/api/image/generate" => status(401, "token expired"),
            _ => balance_body(10),
        }
    });
    let (client, telemetry) = client(transport.clone());
    client.begin_session(credential()).await.expect("session should start");
    let mut status_rx = client.subscribe_session();

    let err = client
        .send(ApiRequest::post("/api/image/generate", json!({ "prompt": "cat" })))
        .await
        .expect_err("401 should surface as an error");

    assert_eq!(err.kind, CreditsErrorKind::Authentication);
    assert_eq!(err.http_status, Some(401));
    let balance = client.read();
    assert_eq!(balance.value, None);
    assert_eq!(balance.source, Some(BalanceSource::Reset));
    assert_eq!(balance.pending_optimistic, None);
    assert_eq!(*status_rx.borrow_and_update(), SessionStatus::Expired);
    assert!(telemetry.events().iter().any(|event| matches!(
        event,
        CreditsTelemetryEvent::SessionEnded {
            reason: SessionEndReason::Unauthorized,
            ..
        }
    )));
}

#[tokio::test]
async fn given_expired_session_when_sending_again_then_no_credential_is_attached() {
    let transport = ScriptedTransport::new(|request: ApiRequest| async move {
        match request.path.as_str() {
            "/api/chat/send" => status(401, "token expired"),
            _ => balance_body(10),
        }
    });
    let (client, _telemetry) = client(transport.clone());
    client.begin_session(credential()).await.expect("session should start");

    let _ = client
        .send(ApiRequest::post("/api/chat/send", json!({})))
        .await;
    let _ = client
        .send(ApiRequest::post("/api/chat/send", json!({})))
        .await;

    let requests = transport.requests();
    let chat_requests = requests
        .iter()
        .filter(|request| request.path == "/api/chat/send")
        .collect::<Vec<_>>();
    assert_eq!(chat_requests.len(), 2);
    assert!(
        chat_requests[0]
            .headers
            .iter()
            .any(|(key, value)| key == "authorization" && value == "Bearer token-1")
    );
    assert!(
        chat_requests[1]
            .headers
            .iter()
            .all(|(key, _)| key != "authorization")
    );
}

#[tokio::test]
async fn given_pull_from_ended_session_when_it_lands_then_new_session_balance_wins() {
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
            match previous {
                0 => balance_body(10),
                1 => {
                    started.notify_one();
                    release.notified().await;
                    balance_body(99)
                }
                _ => balance_body(20),
            }
        }
    });
    let (client, _telemetry) = client(transport);
    client.begin_session(credential()).await.expect("first session should start");

    let stale_client = client.clone();
    let stale_pull = tokio::spawn(async move { stale_client.reconcile().await });
    started.notified().await;

    let fresh = client
        .begin_session(SessionCredential::bearer("token-2"))
        .await
        .expect("second session should start its own pull");
    assert_eq!(fresh.value, Some(20));

    release.notify_one();
    let err = stale_pull
        .await
        .expect("stale pull should not panic")
        .expect_err("stale pull must not land");
    assert_eq!(err.kind, CreditsErrorKind::Authentication);

    let balance = client.read();
    assert_eq!(balance.value, Some(20));
    assert_eq!(balance.session(), fresh.session());
    assert_eq!(
        client.session_status(),
        SessionStatus::Active {
            session: fresh.session()
        }
    );
}

#[tokio::test]
async fn given_pending_mutation_when_logged_out_then_everything_is_cleared() {
    let started = Arc::new(Notify::new());
    let started_handle = Arc::clone(&started);
    let transport = ScriptedTransport::new(move |request: ApiRequest| {
        let started = Arc::clone(&started_handle);
        async move {
            if request.path == "/credits/deduct" {
                started.notify_one();
                std::future::pending::<()>().await;
            }
            balance_body(10)
        }
    });
    let (client, telemetry) = client(transport);
    client.begin_session(credential()).await.expect("session should start");

    let deduct_client = client.clone();
    let deduct_task = tokio::spawn(async move { deduct_client.deduct(3).await });
    started.notified().await;
    assert_eq!(client.read().pending_optimistic, Some(-3));

    client.logout().await;

    let balance = client.read();
    assert_eq!(balance.value, None);
    assert_eq!(balance.pending_optimistic, None);
    assert_eq!(balance.displayed(), None);
    assert_eq!(client.session_status(), SessionStatus::LoggedOut);
    assert!(telemetry.events().iter().any(|event| matches!(
        event,
        CreditsTelemetryEvent::SessionEnded {
            reason: SessionEndReason::Logout,
            endpoint: None
        }
    )));

    deduct_task.abort();
    let _ = deduct_task.await;
    assert_eq!(client.read().pending_optimistic, None);
}

#[tokio::test]
async fn given_hint_from_ended_session_when_it_lands_then_it_is_discarded() {
    let started = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());
    let (started_handle, release_handle) = (Arc::clone(&started), Arc::clone(&release));
    let transport = ScriptedTransport::new(move |request: ApiRequest| {
        let started = Arc::clone(&started_handle);
        let release = Arc::clone(&release_handle);
        async move {
            if request.path == "/api/convert/pdf" {
                started.notify_one();
                release.notified().await;
                return ok_json(json!({ "credits_info": { "remaining": 3 } }));
            }
            balance_body(10)
        }
    });
    let (client, _telemetry) = client(transport);
    client.begin_session(credential()).await.expect("first session should start");

    let convert_client = client.clone();
    let convert = tokio::spawn(async move {
        convert_client
            .send(ApiRequest::post("/api/convert/pdf", json!({})))
            .await
    });
    started.notified().await;
    client
        .begin_session(SessionCredential::bearer("token-2"))
        .await
        .expect("second session should start");
    let before = client.read();

    release.notify_one();
    convert
        .await
        .expect("convert task should not panic")
        .expect("convert request should succeed");

    assert_eq!(client.read(), before);
}

#[tokio::test]
async fn given_expired_session_when_mutating_or_reconciling_then_refused_without_request() {
    let transport = ScriptedTransport::new(|request: ApiRequest| async move {
        match request.path.as_str() {
            "/api/chat/send" => status(401, "token expired"),
            "/credits/deduct" => ok_json(json!({ "remaining_credits": 7 })),
            "/credits/add" => ok_json(json!({ "new_balance": 15 })),
            _ => balance_body(10),
        }
    });
    let (client, telemetry) = client(transport.clone());
    client.begin_session(credential()).await.expect("session should start");
    let _ = client
        .send(ApiRequest::post("/api/chat/send", json!({})))
        .await;
    let expired = client.read();
    let requests_before = transport.requests().len();

    let deduct = client.deduct(3).await.expect_err("deduct must be refused");
    let add = client.add(5, None).await.expect_err("add must be refused");
    let reconcile = client.reconcile().await.expect_err("reconcile must be refused");

    for err in [&deduct, &add, &reconcile] {
        assert_eq!(err.kind, CreditsErrorKind::Authentication);
        assert!(!err.retryable);
    }
    assert_eq!(transport.requests().len(), requests_before);
    assert_eq!(client.read(), expired);
    assert_eq!(client.session_status(), SessionStatus::Expired);
    let session_ends = telemetry
        .events()
        .into_iter()
        .filter(|event| matches!(event, CreditsTelemetryEvent::SessionEnded { .. }))
        .count();
    assert_eq!(session_ends, 1);
}

#[tokio::test]
async fn given_logged_out_client_when_began_again_then_operations_resume() {
    let transport = ScriptedTransport::new(|request: ApiRequest| async move {
        match request.path.as_str() {
            "/credits/deduct" => ok_json(json!({ "remaining_credits": 7 })),
            _ => balance_body(10),
        }
    });
    let (client, _telemetry) = client(transport);
    client.begin_session(credential()).await.expect("session should start");
    client.logout().await;

    let err = client.deduct(3).await.expect_err("deduct after logout is refused");
    assert_eq!(err.kind, CreditsErrorKind::Authentication);

    client.begin_session(credential()).await.expect("session should restart");
    let receipt = client.deduct(3).await.expect("deduct should succeed");
    assert_eq!(receipt.confirmed, 7);
    assert_eq!(client.read().value, Some(7));
}
