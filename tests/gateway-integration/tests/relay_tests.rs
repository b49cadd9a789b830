//! End-to-end tests: relay transport and synchronizers against a live gateway.

use std::sync::Arc;
use std::time::Duration;

use hlchat_client::transport::SignedForm;
use hlchat_client::{
    ChatError, Entry, NoopListener, OutgoingMessage, RelayConfig, RelayTransport, RoomStatus,
    RoomSynchronizer, SyncConfig, Transport,
};
use hlchat_common::message::now_millis;
use hlchat_common::{Eip712Domain, LocalWallet, MessagePayload, RoomId, SignatureScheme};
use hlchat_gateway::names::StaticNameRegistry;
use hlchat_gateway::GatewayConfig;
use hlchat_gateway_integration::{
    recv_matching, spawn_gateway, spawn_gateway_with_registry, ChannelListener,
};
use serde_json::json;

fn relay(url: &str) -> Arc<RelayTransport> {
    Arc::new(RelayTransport::new(RelayConfig::new(url)).expect("relay transport"))
}

async fn outgoing(wallet: &LocalWallet, content: &str, scheme: SignatureScheme) -> OutgoingMessage {
    OutgoingMessage::sign(
        wallet,
        "BTC",
        "perp",
        content,
        None,
        scheme,
        &Eip712Domain::default(),
    )
    .await
    .expect("sign")
}

fn message_body(wallet: &LocalWallet, nonce: &str) -> serde_json::Value {
    let payload = MessagePayload {
        room: RoomId::new("BTC", "perp"),
        content: "hi".into(),
        timestamp: now_millis(),
        nonce: nonce.into(),
        name: None,
    };
    let plain = payload.to_plain();
    let signature = wallet.sign_personal(&plain).expect("sign");
    json!({
        "signature": signature.to_string(),
        "message": plain,
        "address": wallet.address().to_string(),
        "pair": "BTC",
        "market": "perp",
    })
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn health_reports_ok() {
    tracing_subscriber::fmt::try_init().ok();
    let gw = spawn_gateway(GatewayConfig::default()).await;
    let body: serde_json::Value = reqwest::get(format!("{}/health", gw.url))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body, json!({"ok": true}));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn relay_send_then_history() {
    tracing_subscriber::fmt::try_init().ok();
    let gw = spawn_gateway(GatewayConfig::default()).await;
    let transport = relay(&gw.url);
    let wallet = LocalWallet::random();

    let first = outgoing(&wallet, "first", SignatureScheme::Personal).await;
    let second = outgoing(&wallet, "second", SignatureScheme::Typed).await;
    assert!(matches!(second.signed, SignedForm::Typed(_)));
    transport.send(&first).await.unwrap();
    transport.send(&second).await.unwrap();

    let history = transport
        .load_history(&RoomId::new("BTC", "perp"), transport.default_window())
        .await
        .unwrap();
    let contents: Vec<&str> = history.iter().map(|m| m.content.as_str()).collect();
    assert_eq!(contents, vec!["first", "second"]);
    assert!(history.iter().all(|m| m.address == wallet.address()));
    assert!(history.iter().all(|m| m.is_authentic()));

    let other_room = transport
        .load_history(&RoomId::new("ETH", "perp"), transport.default_window())
        .await
        .unwrap();
    assert!(other_room.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn replayed_request_is_rejected() {
    tracing_subscriber::fmt::try_init().ok();
    let gw = spawn_gateway(GatewayConfig::default()).await;
    let http = reqwest::Client::new();
    let wallet = LocalWallet::random();
    let body = message_body(&wallet, "n1");

    let resp = http
        .post(format!("{}/message", gw.url))
        .json(&body)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 200);
    let ok: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(ok, json!({"success": true}));

    let resp = http
        .post(format!("{}/message", gw.url))
        .json(&body)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 400);
    let err: serde_json::Value = resp.json().await.unwrap();
    assert!(err["error"].as_str().unwrap().contains("nonce"));
    assert_eq!(gw.store.len().await, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn forged_address_and_bad_json_are_400() {
    tracing_subscriber::fmt::try_init().ok();
    let gw = spawn_gateway(GatewayConfig::default()).await;
    let http = reqwest::Client::new();
    let wallet = LocalWallet::random();

    let mut forged = message_body(&wallet, "f1");
    forged["address"] = json!(LocalWallet::random().address().to_string());
    let resp = http
        .post(format!("{}/message", gw.url))
        .json(&forged)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 400);
    let err: serde_json::Value = resp.json().await.unwrap();
    assert!(err["error"].as_str().unwrap().contains("signature"));

    let resp = http
        .post(format!("{}/message", gw.url))
        .header("content-type", "application/json")
        .body("{not json")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 400);
    let err: serde_json::Value = resp.json().await.unwrap();
    assert!(err["error"].is_string());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn rate_limit_maps_to_429_and_client_error() {
    tracing_subscriber::fmt::try_init().ok();
    let config = GatewayConfig {
        rate_limit: 2,
        ..GatewayConfig::default()
    };
    let gw = spawn_gateway(config).await;
    let transport = relay(&gw.url);
    let wallet = LocalWallet::random();

    for content in ["one", "two"] {
        let out = outgoing(&wallet, content, SignatureScheme::Personal).await;
        transport.send(&out).await.unwrap();
    }
    let third = outgoing(&wallet, "three", SignatureScheme::Personal).await;
    let err = transport.send(&third).await.unwrap_err();
    assert!(matches!(err, ChatError::RateLimited));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn live_fanout_skips_own_echo() {
    tracing_subscriber::fmt::try_init().ok();
    let gw = spawn_gateway(GatewayConfig::default()).await;
    let alice = LocalWallet::random();
    let bob = LocalWallet::random();

    let (alice_listener, mut alice_rx, _alice_errors) = ChannelListener::new();
    let alice_sync = RoomSynchronizer::new(
        relay(&gw.url),
        alice_listener,
        SyncConfig {
            local_address: Some(alice.address()),
            ..SyncConfig::default()
        },
    );
    let (bob_listener, mut bob_rx, _bob_errors) = ChannelListener::new();
    let bob_sync = RoomSynchronizer::new(
        relay(&gw.url),
        bob_listener,
        SyncConfig {
            local_address: Some(bob.address()),
            ..SyncConfig::default()
        },
    );

    alice_sync.set_room("BTC", "perp").await.unwrap();
    bob_sync.set_room("BTC", "perp").await.unwrap();
    assert_eq!(alice_sync.status(), RoomStatus::Subscribed);

    let sent = alice_sync.send_message("gm from alice", &alice).await.unwrap();

    let received = recv_matching(&mut bob_rx, |m| m.nonce == sent.nonce, Duration::from_secs(5))
        .await
        .expect("bob should see alice's message");
    assert_eq!(received.address, alice.address());
    assert!(bob_sync
        .messages()
        .iter()
        .any(|e| matches!(e, Entry::Confirmed(m) if m.nonce == sent.nonce)));

    // Alice's own echo never arrives as a new message.
    assert!(
        recv_matching(&mut alice_rx, |m| m.nonce == sent.nonce, Duration::from_millis(500))
            .await
            .is_none()
    );
    let alice_view = alice_sync.messages();
    assert_eq!(alice_view.len(), 1);
    assert_eq!(alice_view[0], Entry::Confirmed(sent));

    alice_sync.shutdown().await;
    bob_sync.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn live_feed_is_scoped_to_room() {
    tracing_subscriber::fmt::try_init().ok();
    let gw = spawn_gateway(GatewayConfig::default()).await;
    let (listener, mut rx, _errors) = ChannelListener::new();
    let watcher = RoomSynchronizer::new(relay(&gw.url), listener, SyncConfig::default());
    watcher.set_room("ETH", "perp").await.unwrap();

    let sender = relay(&gw.url);
    let wallet = LocalWallet::random();
    let btc = outgoing(&wallet, "btc only", SignatureScheme::Personal).await;
    sender.send(&btc).await.unwrap();

    assert!(recv_matching(&mut rx, |_| true, Duration::from_millis(500))
        .await
        .is_none());
    assert!(watcher.messages().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn required_session_is_obtained_by_the_client() {
    tracing_subscriber::fmt::try_init().ok();
    let config = GatewayConfig {
        require_session: true,
        ..GatewayConfig::default()
    };
    let gw = spawn_gateway(config).await;
    let wallet = LocalWallet::random();

    let resp = reqwest::Client::new()
        .post(format!("{}/message", gw.url))
        .json(&message_body(&wallet, "nosession"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 400);

    let sync = RoomSynchronizer::new(relay(&gw.url), Arc::new(NoopListener), SyncConfig::default());
    sync.set_room("BTC", "perp").await.unwrap();
    let sent = sync.send_message("signed in", &wallet).await.unwrap();
    assert_eq!(sent.content, "signed in");
    assert_eq!(gw.store.len().await, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn expired_session_is_renewed_by_the_client() {
    tracing_subscriber::fmt::try_init().ok();
    let config = GatewayConfig {
        require_session: true,
        session_ttl: Duration::from_millis(500),
        ..GatewayConfig::default()
    };
    let gw = spawn_gateway(config).await;
    let wallet = LocalWallet::random();

    let sync = RoomSynchronizer::new(relay(&gw.url), Arc::new(NoopListener), SyncConfig::default());
    sync.set_room("BTC", "perp").await.unwrap();
    sync.send_message("first", &wallet).await.unwrap();

    tokio::time::sleep(Duration::from_millis(800)).await;
    sync.send_message("after expiry", &wallet).await.unwrap();
    sync.send_message("still signed in", &wallet).await.unwrap();
    assert_eq!(gw.store.len().await, 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn malformed_history_query_gets_json_error() {
    tracing_subscriber::fmt::try_init().ok();
    let gw = spawn_gateway(GatewayConfig::default()).await;

    let resp = reqwest::get(format!("{}/rooms/BTC_perp/messages?limit=abc", gw.url))
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 400);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert!(body["error"].as_str().is_some_and(|e| e.starts_with("invalid payload")));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn display_names_must_be_owned() {
    tracing_subscriber::fmt::try_init().ok();
    let owner = LocalWallet::random();
    let registry = StaticNameRegistry::default().with_name(owner.address(), "whale.hl");
    let gw = spawn_gateway_with_registry(GatewayConfig::default(), Arc::new(registry)).await;

    let named = |name: &str| SyncConfig {
        display_name: Some(name.to_string()),
        ..SyncConfig::default()
    };

    let sync = RoomSynchronizer::new(relay(&gw.url), Arc::new(NoopListener), named("whale.hl"));
    sync.set_room("BTC", "perp").await.unwrap();
    let sent = sync.send_message("size", &owner).await.unwrap();
    assert_eq!(sent.display_name.as_deref(), Some("whale.hl"));

    let impostor = LocalWallet::random();
    let sync = RoomSynchronizer::new(relay(&gw.url), Arc::new(NoopListener), named("whale.hl"));
    sync.set_room("BTC", "perp").await.unwrap();
    let err = sync.send_message("fake size", &impostor).await.unwrap_err();
    assert!(matches!(err, ChatError::NameNotOwned(_)));
    // History holds the earlier message only; the rejected one was rolled back.
    assert_eq!(sync.messages().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unreachable_gateway_fails_room_after_retries() {
    tracing_subscriber::fmt::try_init().ok();
    // Bind then drop to get a port nobody is listening on.
    let addr = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap()
    };
    let config = SyncConfig {
        backoff_step: Duration::from_millis(10),
        ..SyncConfig::default()
    };
    let sync = RoomSynchronizer::new(relay(&format!("http://{addr}")), Arc::new(NoopListener), config);
    let err = sync.set_room("BTC", "perp").await.unwrap_err();
    assert!(matches!(err, ChatError::HistoryLoadFailed { attempts: 3, .. }));
    assert!(matches!(sync.status(), RoomStatus::Failed { .. }));
}
