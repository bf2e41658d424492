//! Subscription gateway tests over a real WebSocket client.

use depot_core::config::GatewayConfig;
use depot_core::OperationId;
use depot_progress::{ProgressRegistry, RegistryOptions};
use depot_protocol::messages::{GatewayMessage, MessageType, ProgressPayload, SubscribePayload};
use depot_server::GatewayServer;
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

type WsClient = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

async fn start_gateway() -> (Arc<ProgressRegistry>, Arc<GatewayServer>, WsClient) {
    let registry = ProgressRegistry::new(RegistryOptions {
        coalesce_interval: Duration::ZERO,
        retention_after_terminal: Duration::from_secs(60),
        subscriber_buffer_capacity: 64,
    });

    let gateway = GatewayServer::new(
        "127.0.0.1:0".to_string(),
        registry.clone(),
        GatewayConfig::default(),
        CancellationToken::new(),
    );
    {
        let gateway = gateway.clone();
        tokio::spawn(async move {
            gateway.run().await.unwrap();
        });
    }

    // Wait for the listener to bind.
    let addr = loop {
        if let Some(addr) = gateway.local_addr().await {
            break addr;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    };

    let url = format!("ws://{addr}");
    let (client, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
    (registry, gateway, client)
}

async fn next_message(client: &mut WsClient) -> GatewayMessage {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), client.next())
            .await
            .expect("timed out waiting for gateway message")
            .expect("connection closed")
            .expect("read error");
        match msg {
            Message::Text(text) => return serde_json::from_str(&text).unwrap(),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}

async fn send_subscribe(client: &mut WsClient, id: &str, operation_id: &OperationId) {
    let payload = SubscribePayload {
        operation_id: operation_id.to_string(),
    };
    let msg = GatewayMessage::with_payload(id, MessageType::Subscribe, &payload).unwrap();
    client
        .send(Message::Text(serde_json::to_string(&msg).unwrap().into()))
        .await
        .unwrap();
}

#[tokio::test]
async fn subscribe_receives_progress_and_complete() {
    let (registry, gateway, mut client) = start_gateway().await;

    let operation_id = OperationId::new();
    let handle = registry.open(operation_id, 1000);

    send_subscribe(&mut client, "req-1", &operation_id).await;

    let ack = next_message(&mut client).await;
    assert_eq!(ack.msg_type, MessageType::Subscribed);
    assert_eq!(ack.id, "req-1");

    // Initial snapshot arrives immediately.
    let first = next_message(&mut client).await;
    assert_eq!(first.msg_type, MessageType::Progress);
    let payload: ProgressPayload = first.payload_as().unwrap();
    assert_eq!(payload.snapshot.bytes_processed, 0);

    handle.advance(400, Some("chunk"));
    handle.advance(600, None);
    handle.complete(Some("done"));

    // Drain progress events until the complete marker; bytes must be
    // monotone.
    let mut last_bytes = 0;
    loop {
        let msg = next_message(&mut client).await;
        match msg.msg_type {
            MessageType::Progress => {
                let payload: ProgressPayload = msg.payload_as().unwrap();
                assert!(payload.snapshot.bytes_processed >= last_bytes);
                last_bytes = payload.snapshot.bytes_processed;
            }
            MessageType::Complete => {
                assert_eq!(last_bytes, 1000);
                break;
            }
            other => panic!("unexpected message type: {other:?}"),
        }
    }

    gateway.shutdown();
}

#[tokio::test]
async fn subscribe_unknown_operation_gets_error() {
    let (_registry, gateway, mut client) = start_gateway().await;

    let ghost = OperationId::new();
    send_subscribe(&mut client, "req-2", &ghost).await;

    let reply = next_message(&mut client).await;
    assert_eq!(reply.msg_type, MessageType::Error);
    assert_eq!(reply.id, "req-2");
    assert_eq!(reply.error.unwrap().code, 404);

    gateway.shutdown();
}

#[tokio::test]
async fn failed_operation_ends_with_failed_message() {
    let (registry, gateway, mut client) = start_gateway().await;

    let operation_id = OperationId::new();
    let handle = registry.open(operation_id, 100);
    send_subscribe(&mut client, "req-3", &operation_id).await;

    let ack = next_message(&mut client).await;
    assert_eq!(ack.msg_type, MessageType::Subscribed);

    handle.fail("digest_mismatch");

    loop {
        let msg = next_message(&mut client).await;
        match msg.msg_type {
            MessageType::Progress => continue,
            MessageType::Failed => {
                let payload: depot_protocol::messages::FailedPayload =
                    msg.payload_as().unwrap();
                assert_eq!(payload.error, "digest_mismatch");
                break;
            }
            other => panic!("unexpected message type: {other:?}"),
        }
    }

    gateway.shutdown();
}

#[tokio::test]
async fn unsubscribe_stops_events() {
    let (registry, gateway, mut client) = start_gateway().await;

    let operation_id = OperationId::new();
    let handle = registry.open(operation_id, 100);
    send_subscribe(&mut client, "req-4", &operation_id).await;

    let ack = next_message(&mut client).await;
    assert_eq!(ack.msg_type, MessageType::Subscribed);
    // Initial snapshot.
    let first = next_message(&mut client).await;
    assert_eq!(first.msg_type, MessageType::Progress);

    let payload = SubscribePayload {
        operation_id: operation_id.to_string(),
    };
    let msg =
        GatewayMessage::with_payload("req-5", MessageType::Unsubscribe, &payload).unwrap();
    client
        .send(Message::Text(serde_json::to_string(&msg).unwrap().into()))
        .await
        .unwrap();

    let ack = next_message(&mut client).await;
    assert_eq!(ack.msg_type, MessageType::Unsubscribed);

    // Updates after unsubscribing are not relayed; the ping/pong
    // exchange below would otherwise surface them first.
    handle.advance(50, None);
    handle.complete(None);
    tokio::time::sleep(Duration::from_millis(100)).await;

    let ping = GatewayMessage::bare("req-6", MessageType::Ping);
    client
        .send(Message::Text(serde_json::to_string(&ping).unwrap().into()))
        .await
        .unwrap();
    let reply = next_message(&mut client).await;
    assert_eq!(reply.msg_type, MessageType::Pong);
    assert_eq!(reply.id, "req-6");

    gateway.shutdown();
}

#[tokio::test]
async fn malformed_message_gets_error_reply() {
    let (_registry, gateway, mut client) = start_gateway().await;

    client
        .send(Message::Text("this is not json".to_string().into()))
        .await
        .unwrap();

    let reply = next_message(&mut client).await;
    assert_eq!(reply.msg_type, MessageType::Error);
    assert_eq!(reply.error.unwrap().code, 400);

    gateway.shutdown();
}

#[tokio::test]
async fn two_clients_both_observe_terminal() {
    let (registry, gateway, mut first) = start_gateway().await;

    let addr = gateway.local_addr().await.unwrap();
    let (mut second, _) = tokio_tungstenite::connect_async(format!("ws://{addr}"))
        .await
        .unwrap();

    let operation_id = OperationId::new();
    let handle = registry.open(operation_id, 10);

    send_subscribe(&mut first, "a-1", &operation_id).await;
    send_subscribe(&mut second, "b-1", &operation_id).await;
    assert_eq!(next_message(&mut first).await.msg_type, MessageType::Subscribed);
    assert_eq!(next_message(&mut second).await.msg_type, MessageType::Subscribed);

    handle.advance(10, None);
    handle.complete(None);

    for client in [&mut first, &mut second] {
        loop {
            let msg = next_message(client).await;
            match msg.msg_type {
                MessageType::Progress => continue,
                MessageType::Complete => break,
                other => panic!("unexpected message type: {other:?}"),
            }
        }
    }

    gateway.shutdown();
}
