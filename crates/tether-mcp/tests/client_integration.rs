//! Integration tests for `McpClient` against a scripted in-memory transport.
//!
//! Time is paused, so the fixed backoff delays elapse instantly and the
//! tests stay deterministic.

mod common;

use common::{MockTransport, Responder, init_result, ok_responder};
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tether_mcp::{ClientConfig, McpClient, McpError, TransportError};

fn test_config() -> ClientConfig {
    ClientConfig {
        max_attempts: 3,
        request_timeout_ms: 30_000,
        settle_delay_ms: 1,
    }
}

fn client_on(transport: &Arc<MockTransport>) -> McpClient {
    McpClient::new(
        Arc::clone(transport) as Arc<dyn tether_mcp::Transport>,
        test_config(),
    )
}

#[tokio::test(start_paused = true)]
async fn handshake_caches_capabilities_and_sends_initialized() {
    let transport = MockTransport::new(ok_responder());
    let client = client_on(&transport);

    client.start().await.unwrap();

    assert!(client.is_ready());
    assert_eq!(
        client.capabilities().await.unwrap(),
        json!({ "tools": {} })
    );
    assert!(client.has_capability(|caps| caps.get("tools").is_some()).await);
    assert!(!client.has_capability(|caps| caps.get("prompts").is_some()).await);
    assert_eq!(client.server_info().await.unwrap().name, "mock-server");
    assert_eq!(
        transport.notifications().await,
        vec!["notifications/initialized".to_string()]
    );

    client.stop().await.unwrap();
    assert!(!client.is_ready());
}

#[tokio::test(start_paused = true)]
async fn responses_route_by_id_regardless_of_arrival_order() {
    // Leave both requests unanswered, then answer them in reverse order.
    let responder: Responder = Arc::new(|method, _call| match method {
        "initialize" => Some(init_result()),
        _ => None,
    });
    let transport = MockTransport::new(responder);
    let client = Arc::new(client_on(&transport));
    client.start().await.unwrap();

    let alpha = {
        let client = Arc::clone(&client);
        tokio::spawn(async move { client.send_request::<Value>("alpha", None).await })
    };
    tokio::time::sleep(Duration::from_millis(1)).await;
    let beta = {
        let client = Arc::clone(&client);
        tokio::spawn(async move { client.send_request::<Value>("beta", None).await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;

    // initialize took id 1, alpha id 2, beta id 3. Answer beta first.
    transport
        .inject(json!({"jsonrpc": "2.0", "id": 3, "result": {"who": "beta"}}))
        .await;
    transport
        .inject(json!({"jsonrpc": "2.0", "id": 2, "result": {"who": "alpha"}}))
        .await;

    assert_eq!(alpha.await.unwrap().unwrap()["who"], "alpha");
    assert_eq!(beta.await.unwrap().unwrap()["who"], "beta");
}

#[tokio::test(start_paused = true)]
async fn stop_fails_every_pending_request_with_client_stopped() {
    let responder: Responder = Arc::new(|method, _call| match method {
        "initialize" => Some(init_result()),
        _ => None,
    });
    let transport = MockTransport::new(responder);
    let client = Arc::new(client_on(&transport));
    client.start().await.unwrap();

    let mut waiters = Vec::new();
    for _ in 0..3 {
        let client = Arc::clone(&client);
        waiters.push(tokio::spawn(async move {
            client.send_request::<Value>("hang", None).await
        }));
    }
    tokio::time::sleep(Duration::from_millis(10)).await;

    client.stop().await.unwrap();

    for waiter in waiters {
        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(McpError::ClientStopped)));
    }
    let err = client
        .send_request::<Value>("after", None)
        .await
        .unwrap_err();
    assert!(matches!(err, McpError::NotInitialized));
}

#[tokio::test(start_paused = true)]
async fn session_error_reinitializes_then_retries() {
    let responder: Responder = Arc::new(|method, call| match method {
        "initialize" => Some(init_result()),
        "work" if call == 1 => Some(json!({
            "error": { "code": -32000, "message": "session not found" }
        })),
        _ => Some(json!({ "result": { "ok": true } })),
    });
    let transport = MockTransport::new(responder);
    let client = client_on(&transport);
    client.start().await.unwrap();

    let result: Value = client.send_request("work", None).await.unwrap();
    assert_eq!(result["ok"], true);

    assert_eq!(transport.call_count("work").await, 2);
    assert_eq!(transport.call_count("initialize").await, 2);
    assert_eq!(transport.cleared_sessions(), 1);
    assert_eq!(transport.starts(), 2);
}

#[tokio::test(start_paused = true)]
async fn server_5xx_retries_without_reinitializing() {
    let responder: Responder = Arc::new(|method, call| match method {
        "initialize" => Some(init_result()),
        "work" if call == 1 => Some(json!({
            "error": { "code": 500, "message": "temporary" }
        })),
        _ => Some(json!({ "result": { "ok": true } })),
    });
    let transport = MockTransport::new(responder);
    let client = client_on(&transport);
    client.start().await.unwrap();

    let result: Value = client.send_request("work", None).await.unwrap();
    assert_eq!(result["ok"], true);

    assert_eq!(transport.call_count("work").await, 2);
    // Not a session failure: no reinitialization, no transport restart.
    assert_eq!(transport.cleared_sessions(), 0);
    assert_eq!(transport.starts(), 1);
    assert_eq!(transport.call_count("initialize").await, 1);
}

#[tokio::test(start_paused = true)]
async fn unrelated_error_propagates_without_retry() {
    let responder: Responder = Arc::new(|method, _call| match method {
        "initialize" => Some(init_result()),
        _ => Some(json!({
            "error": { "code": -32602, "message": "invalid params" }
        })),
    });
    let transport = MockTransport::new(responder);
    let client = client_on(&transport);
    client.start().await.unwrap();

    let err = client.send_request::<Value>("work", None).await.unwrap_err();
    match err {
        McpError::Server { code, message } => {
            assert_eq!(code, -32602);
            assert_eq!(message, "invalid params");
        }
        other => panic!("expected Server, got {other:?}"),
    }
    assert_eq!(transport.call_count("work").await, 1);
}

#[tokio::test(start_paused = true)]
async fn handshake_failure_is_never_retried() {
    // The same 500 a normal request would retry past.
    let responder: Responder = Arc::new(|method, _call| match method {
        "initialize" => Some(json!({
            "error": { "code": 500, "message": "temporary" }
        })),
        _ => Some(json!({ "result": {} })),
    });
    let transport = MockTransport::new(responder);
    let client = client_on(&transport);

    let err = client.start().await.unwrap_err();
    match err {
        McpError::Server { code, .. } => assert_eq!(code, 500),
        other => panic!("expected Server, got {other:?}"),
    }
    assert_eq!(transport.call_count("initialize").await, 1);
    assert!(!client.is_ready());
}

#[tokio::test(start_paused = true)]
async fn response_with_neither_field_is_no_result() {
    let responder: Responder = Arc::new(|method, _call| match method {
        "initialize" => Some(init_result()),
        _ => Some(json!({})),
    });
    let transport = MockTransport::new(responder);
    let client = client_on(&transport);
    client.start().await.unwrap();

    let err = client.send_request::<Value>("work", None).await.unwrap_err();
    assert!(matches!(err, McpError::NoResult));
}

#[tokio::test(start_paused = true)]
async fn result_shape_mismatch_is_a_decode_error() {
    let responder: Responder = Arc::new(|method, _call| match method {
        "initialize" => Some(init_result()),
        _ => Some(json!({ "result": "not a number" })),
    });
    let transport = MockTransport::new(responder);
    let client = client_on(&transport);
    client.start().await.unwrap();

    let err = client.send_request::<u64>("work", None).await.unwrap_err();
    assert!(matches!(err, McpError::Decode(_)));
}

#[tokio::test(start_paused = true)]
async fn unknown_id_response_is_dropped_not_fatal() {
    let responder: Responder = Arc::new(|method, _call| match method {
        "initialize" => Some(init_result()),
        _ => None,
    });
    let transport = MockTransport::new(responder);
    let client = Arc::new(client_on(&transport));
    client.start().await.unwrap();

    let request = {
        let client = Arc::clone(&client);
        tokio::spawn(async move { client.send_request::<Value>("work", None).await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;

    // Nothing waits on id 999; the loop must log it and keep going.
    transport
        .inject(json!({"jsonrpc": "2.0", "id": 999, "result": {}}))
        .await;
    transport
        .inject(json!({"jsonrpc": "2.0", "id": 2, "result": {"ok": true}}))
        .await;

    let result = request.await.unwrap().unwrap();
    assert_eq!(result["ok"], true);
}

#[tokio::test(start_paused = true)]
async fn forced_reconnect_fails_pending_and_restores_service() {
    let responder: Responder = Arc::new(|method, _call| match method {
        "initialize" => Some(init_result()),
        "hang" => None,
        _ => Some(json!({ "result": { "ok": true } })),
    });
    let transport = MockTransport::new(responder);
    let client = Arc::new(client_on(&transport));
    client.start().await.unwrap();

    let hung = {
        let client = Arc::clone(&client);
        tokio::spawn(async move { client.send_request::<Value>("hang", None).await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;

    client.reconnect().await.unwrap();

    let result = hung.await.unwrap();
    assert!(matches!(
        result,
        Err(McpError::Transport(TransportError::ConnectionClosed))
    ));
    assert!(client.is_ready());
    assert_eq!(transport.cleared_sessions(), 1);
    assert_eq!(transport.starts(), 2);

    let after: Value = client.send_request("work", None).await.unwrap();
    assert_eq!(after["ok"], true);
}

#[tokio::test(start_paused = true)]
async fn connection_loss_fails_pending_requests() {
    let responder: Responder = Arc::new(|method, _call| match method {
        "initialize" => Some(init_result()),
        _ => None,
    });
    let transport = MockTransport::new(responder);
    let client = Arc::new(client_on(&transport));
    client.start().await.unwrap();

    let hung = {
        let client = Arc::clone(&client);
        tokio::spawn(async move { client.send_request::<Value>("hang", None).await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;

    transport.fail_connection();

    // The pending request fails through the receive loop, well before its
    // 30s timeout could fire.
    let result = tokio::time::timeout(Duration::from_secs(5), hung)
        .await
        .expect("pending request was not resolved")
        .unwrap();
    assert!(matches!(
        result,
        Err(McpError::Transport(TransportError::ConnectionClosed))
    ));
    assert!(!client.is_ready());
}

#[tokio::test(start_paused = true)]
async fn request_timeout_is_retried_and_cleans_pending() {
    let responder: Responder = Arc::new(|method, call| match method {
        "initialize" => Some(init_result()),
        // Unanswered on the first attempt, answered on the second.
        "slow" if call == 1 => None,
        _ => Some(json!({ "result": { "ok": true } })),
    });
    let transport = MockTransport::new(responder);
    let client = McpClient::new(
        Arc::clone(&transport) as Arc<dyn tether_mcp::Transport>,
        ClientConfig {
            max_attempts: 2,
            request_timeout_ms: 100,
            settle_delay_ms: 1,
        },
    );
    client.start().await.unwrap();

    let result: Value = client.send_request("slow", None).await.unwrap();
    assert_eq!(result["ok"], true);
    assert_eq!(transport.call_count("slow").await, 2);
    // A timeout alone does not tear the session down.
    assert_eq!(transport.cleared_sessions(), 0);
}
