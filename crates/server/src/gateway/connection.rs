//! Per-connection gateway plumbing: read loop, write pump, heartbeat,
//! and subscription relay tasks.

use crate::gateway::GatewayServerError;
use crate::metrics::{GATEWAY_CONNECTIONS, GATEWAY_SUBSCRIPTIONS};
use depot_core::config::GatewayConfig;
use depot_core::{OperationId, ProgressStatus};
use depot_progress::{ProgressRegistry, ProgressStream, SubscribeError};
use depot_protocol::messages::{
    CompletePayload, FailedPayload, GatewayMessage, MessageType, ProgressPayload, SubscribePayload,
};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::{WebSocketStream, accept_async_with_config};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;
type WsSource = SplitStream<WebSocketStream<TcpStream>>;

/// Capacity of the per-connection outbound queue. The registry-side
/// subscriber buffer already coalesces under pressure; this bound just
/// keeps one stuck socket from accumulating frames.
const WRITE_QUEUE_CAPACITY: usize = 64;

/// Handle one gateway connection until close, error, or shutdown.
pub(crate) async fn handle_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    registry: Arc<ProgressRegistry>,
    config: GatewayConfig,
    server_cancel: CancellationToken,
) -> Result<(), GatewayServerError> {
    let mut ws_config = WebSocketConfig::default();
    ws_config.max_message_size = Some(config.max_message_bytes);
    ws_config.max_frame_size = Some(config.max_message_bytes);
    let ws_stream = accept_async_with_config(stream, Some(ws_config)).await?;
    tracing::info!(%peer_addr, "gateway connection established");

    let (sink, source) = ws_stream.split();
    let cancel = server_cancel.child_token();
    let (write_tx, write_rx) = mpsc::channel::<Message>(WRITE_QUEUE_CAPACITY);
    let last_pong = Arc::new(Mutex::new(Instant::now()));

    let write_task = tokio::spawn(write_pump(sink, write_rx, cancel.clone()));
    let ping_task = tokio::spawn(ping_pump(
        write_tx.clone(),
        cancel.clone(),
        config.clone(),
        last_pong.clone(),
    ));

    GATEWAY_CONNECTIONS.inc();
    let result = read_loop(source, &registry, &write_tx, &cancel, &last_pong).await;
    GATEWAY_CONNECTIONS.dec();

    // Tear down pumps and any still-running relay tasks.
    cancel.cancel();
    let _ = write_task.await;
    let _ = ping_task.await;
    tracing::info!(%peer_addr, "gateway connection closed");
    result
}

/// The connection's subscription set, keyed by operation id.
struct Subscriptions {
    relays: HashMap<OperationId, JoinHandle<()>>,
}

impl Subscriptions {
    fn new() -> Self {
        Self {
            relays: HashMap::new(),
        }
    }

    fn insert(&mut self, id: OperationId, handle: JoinHandle<()>) {
        match self.relays.insert(id, handle) {
            // Re-subscribe replaces the old relay.
            Some(old) => old.abort(),
            None => GATEWAY_SUBSCRIPTIONS.inc(),
        }
    }

    fn remove(&mut self, id: &OperationId) -> bool {
        match self.relays.remove(id) {
            Some(handle) => {
                handle.abort();
                GATEWAY_SUBSCRIPTIONS.dec();
                true
            }
            None => false,
        }
    }
}

impl Drop for Subscriptions {
    fn drop(&mut self) {
        for (_, handle) in self.relays.drain() {
            handle.abort();
            GATEWAY_SUBSCRIPTIONS.dec();
        }
    }
}

async fn read_loop(
    mut source: WsSource,
    registry: &Arc<ProgressRegistry>,
    write_tx: &mpsc::Sender<Message>,
    cancel: &CancellationToken,
    last_pong: &Arc<Mutex<Instant>>,
) -> Result<(), GatewayServerError> {
    let mut subscriptions = Subscriptions::new();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            incoming = source.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    match serde_json::from_str::<GatewayMessage>(&text) {
                        Ok(message) => {
                            handle_message(message, registry, write_tx, &mut subscriptions)
                                .await;
                        }
                        Err(e) => {
                            let reply =
                                GatewayMessage::failure("", 400, format!("invalid message: {e}"));
                            send_message(write_tx, &reply).await;
                        }
                    }
                }
                Some(Ok(Message::Ping(data))) => {
                    let _ = write_tx.send(Message::Pong(data)).await;
                }
                Some(Ok(Message::Pong(_))) => {
                    *last_pong.lock().unwrap() = Instant::now();
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {
                    let reply = GatewayMessage::failure("", 400, "binary messages not supported");
                    send_message(write_tx, &reply).await;
                }
                Some(Err(e)) => {
                    tracing::debug!("gateway read error: {e}");
                    break;
                }
            }
        }
    }

    Ok(())
}

/// Dispatch one parsed client message.
async fn handle_message(
    message: GatewayMessage,
    registry: &Arc<ProgressRegistry>,
    write_tx: &mpsc::Sender<Message>,
    subscriptions: &mut Subscriptions,
) {
    match message.msg_type {
        MessageType::Subscribe => {
            let Some(operation_id) = parse_subscribe_payload(&message, write_tx).await else {
                return;
            };

            match registry.subscribe(&operation_id) {
                Ok(stream) => {
                    let ack_payload = SubscribePayload {
                        operation_id: operation_id.to_string(),
                    };
                    if let Ok(ack) = message.ack_with(MessageType::Subscribed, &ack_payload) {
                        send_message(write_tx, &ack).await;
                    }

                    let relay = tokio::spawn(relay_progress(
                        operation_id,
                        stream,
                        write_tx.clone(),
                    ));
                    subscriptions.insert(operation_id, relay);
                }
                Err(SubscribeError::NotFound(id)) => {
                    let reply = message.rejection(404, format!("operation not found: {id}"));
                    send_message(write_tx, &reply).await;
                }
            }
        }

        MessageType::Unsubscribe => {
            let Some(operation_id) = parse_subscribe_payload(&message, write_tx).await else {
                return;
            };
            subscriptions.remove(&operation_id);
            let ack_payload = SubscribePayload {
                operation_id: operation_id.to_string(),
            };
            if let Ok(ack) = message.ack_with(MessageType::Unsubscribed, &ack_payload) {
                send_message(write_tx, &ack).await;
            }
        }

        MessageType::Ping => {
            send_message(write_tx, &message.ack(MessageType::Pong)).await;
        }

        other => {
            let reply = message.rejection(400, format!("unexpected message type: {other:?}"));
            send_message(write_tx, &reply).await;
        }
    }
}

async fn parse_subscribe_payload(
    message: &GatewayMessage,
    write_tx: &mpsc::Sender<Message>,
) -> Option<OperationId> {
    let payload = match message.payload_as::<SubscribePayload>() {
        Ok(payload) => payload,
        Err(e) => {
            let reply = message.rejection(400, e.to_string());
            send_message(write_tx, &reply).await;
            return None;
        }
    };

    match OperationId::parse(&payload.operation_id) {
        Ok(id) => Some(id),
        Err(e) => {
            let reply = message.rejection(400, e.to_string());
            send_message(write_tx, &reply).await;
            None
        }
    }
}

/// Pump registry snapshots for one subscription into the connection's
/// write queue, ending with a `complete`/`failed` event after the
/// terminal snapshot.
async fn relay_progress(
    operation_id: OperationId,
    mut stream: ProgressStream,
    write_tx: mpsc::Sender<Message>,
) {
    while let Some(snapshot) = stream.next().await {
        let status = snapshot.status;
        let error = snapshot.error.clone();

        let payload = ProgressPayload {
            operation_id: operation_id.to_string(),
            snapshot,
        };
        let Ok(event) =
            GatewayMessage::with_payload(event_id(), MessageType::Progress, &payload)
        else {
            continue;
        };
        if !send_message(&write_tx, &event).await {
            return;
        }

        match status {
            ProgressStatus::InProgress => {}
            ProgressStatus::Completed => {
                let payload = CompletePayload {
                    operation_id: operation_id.to_string(),
                };
                if let Ok(event) =
                    GatewayMessage::with_payload(event_id(), MessageType::Complete, &payload)
                {
                    send_message(&write_tx, &event).await;
                }
                return;
            }
            ProgressStatus::Failed => {
                let payload = FailedPayload {
                    operation_id: operation_id.to_string(),
                    error: error.unwrap_or_else(|| "unknown".to_string()),
                };
                if let Ok(event) =
                    GatewayMessage::with_payload(event_id(), MessageType::Failed, &payload)
                {
                    send_message(&write_tx, &event).await;
                }
                return;
            }
        }
    }
}

fn event_id() -> String {
    format!("evt-{}", Uuid::new_v4())
}

/// Serialize and enqueue a message; returns false when the connection
/// is gone.
async fn send_message(write_tx: &mpsc::Sender<Message>, message: &GatewayMessage) -> bool {
    match serde_json::to_string(message) {
        Ok(json) => write_tx.send(Message::Text(json.into())).await.is_ok(),
        Err(e) => {
            tracing::warn!("failed to serialize gateway message: {e}");
            true
        }
    }
}

/// Drains the write queue into the socket.
async fn write_pump(mut sink: WsSink, mut rx: mpsc::Receiver<Message>, cancel: CancellationToken) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = sink.close().await;
                break;
            }
            message = rx.recv() => match message {
                Some(message) => {
                    if sink.send(message).await.is_err() {
                        cancel.cancel();
                        break;
                    }
                }
                None => break,
            }
        }
    }
}

/// Sends periodic pings; two missed pongs terminate the connection.
async fn ping_pump(
    write_tx: mpsc::Sender<Message>,
    cancel: CancellationToken,
    config: GatewayConfig,
    last_pong: Arc<Mutex<Instant>>,
) {
    let mut interval = tokio::time::interval(config.heartbeat());
    interval.tick().await; // Skip immediate first tick.

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {
                let stale = last_pong.lock().unwrap().elapsed() > config.pong_deadline();
                if stale {
                    tracing::info!("gateway peer missed pong deadline, closing");
                    cancel.cancel();
                    break;
                }
                let ping = Message::Ping(vec![].into());
                if write_tx.send(ping).await.is_err() {
                    break;
                }
            }
        }
    }
}
