// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! End-to-end spec harness: an in-process mock edge node.
//!
//! The node speaks the real control protocol over WebSocket, keeps
//! published messages in storage for replay, answers resend requests, and
//! records the full wire trace so tests can assert on exactly which
//! requests a client produced. REST stream metadata is served alongside,
//! with an optional artificial delay on the next lookup.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Once};
use std::time::Duration;

use axum::extract::{Path, State};
use axum::routing::get;
use axum::{Json, Router};
use brook::protocol::control::ControlMessage;
use brook::protocol::message::StreamMessage;
use brook::Config;
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

static TRACING: Once = Once::new();
static CRYPTO_INIT: Once = Once::new();

/// Install a test tracing subscriber once per process.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .with_test_writer()
            .try_init();
    });
}

/// Install the ring crypto provider for reqwest/rustls.
/// Safe to call multiple times — only the first call has effect.
pub fn ensure_crypto() {
    CRYPTO_INIT.call_once(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

struct ConnEntry {
    tx: mpsc::UnboundedSender<ControlMessage>,
    subs: Arc<Mutex<HashSet<(String, u32)>>>,
    kill: CancellationToken,
}

struct NodeState {
    storage: Mutex<HashMap<(String, u32), Vec<StreamMessage>>>,
    trace: Mutex<Vec<ControlMessage>>,
    conns: Mutex<Vec<Arc<ConnEntry>>>,
    /// One-shot delay applied to the next stream-metadata lookup, ms.
    lookup_delay_next: AtomicU64,
}

/// An in-process edge node plus REST collaborator.
pub struct MockNode {
    pub ws_url: String,
    pub rest_url: String,
    state: Arc<NodeState>,
}

impl MockNode {
    pub async fn start() -> anyhow::Result<Self> {
        init_tracing();
        ensure_crypto();
        let state = Arc::new(NodeState {
            storage: Mutex::new(HashMap::new()),
            trace: Mutex::new(Vec::new()),
            conns: Mutex::new(Vec::new()),
            lookup_delay_next: AtomicU64::new(0),
        });

        // WebSocket control endpoint.
        let ws_listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let ws_url = format!("ws://{}", ws_listener.local_addr()?);
        let accept_state = Arc::clone(&state);
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = ws_listener.accept().await else { break };
                let Ok(ws) = tokio_tungstenite::accept_async(stream).await else { continue };
                let (tx, rx) = mpsc::unbounded_channel();
                let entry = Arc::new(ConnEntry {
                    tx,
                    subs: Arc::new(Mutex::new(HashSet::new())),
                    kill: CancellationToken::new(),
                });
                accept_state.conns.lock().await.push(Arc::clone(&entry));
                tokio::spawn(run_conn(Arc::clone(&accept_state), entry, ws, rx));
            }
        });

        // REST collaborator (stream metadata only).
        let rest_listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let rest_url = format!("http://{}", rest_listener.local_addr()?);
        let rest_state = Arc::clone(&state);
        let router = Router::new()
            .route(
                "/streams/{id}",
                get(|State(state): State<Arc<NodeState>>, Path(id): Path<String>| async move {
                    let delay = state.lookup_delay_next.swap(0, Ordering::SeqCst);
                    if delay > 0 {
                        tokio::time::sleep(Duration::from_millis(delay)).await;
                    }
                    Json(json!({ "id": id, "partitions": 4 }))
                }),
            )
            .with_state(rest_state);
        tokio::spawn(async move {
            let _ = axum::serve(rest_listener, router).await;
        });

        Ok(Self { ws_url, rest_url, state })
    }

    /// Client configuration pointed at this node. Tests override the knobs
    /// they care about.
    pub fn client_config(&self) -> Config {
        Config {
            url: self.ws_url.clone(),
            rest_url: self.rest_url.clone(),
            auto_disconnect: false,
            reconnect_backoff_ms: 50,
            reconnect_backoff_max_ms: 200,
            ..Config::default()
        }
    }

    /// Delay the next stream-metadata lookup by `ms`.
    pub fn delay_next_lookup(&self, ms: u64) {
        self.state.lookup_delay_next.store(ms, Ordering::SeqCst);
    }

    /// Snapshot of everything stored for a stream partition.
    pub async fn stored(&self, stream_id: &str, partition: u32) -> Vec<StreamMessage> {
        self.state
            .storage
            .lock()
            .await
            .get(&(stream_id.to_owned(), partition))
            .cloned()
            .unwrap_or_default()
    }

    /// Wait until at least `count` messages landed in storage.
    pub async fn wait_for_stored(
        &self,
        stream_id: &str,
        partition: u32,
        count: usize,
    ) -> anyhow::Result<Vec<StreamMessage>> {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let stored = self.stored(stream_id, partition).await;
            if stored.len() >= count {
                return Ok(stored);
            }
            anyhow::ensure!(
                tokio::time::Instant::now() < deadline,
                "stored {} of {count} messages",
                stored.len()
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    /// Wait until the wire trace holds at least `count` requests of a type.
    pub async fn wait_for_requests(&self, type_name: &str, count: usize) -> anyhow::Result<()> {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let seen =
                self.trace_names().await.iter().filter(|n| **n == type_name).count();
            if seen >= count {
                return Ok(());
            }
            anyhow::ensure!(
                tokio::time::Instant::now() < deadline,
                "saw {seen} of {count} {type_name} requests"
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    /// Type names of every client request seen, in arrival order.
    pub async fn trace_names(&self) -> Vec<&'static str> {
        self.state.trace.lock().await.iter().map(ControlMessage::type_name).collect()
    }

    /// Full wire trace.
    pub async fn trace(&self) -> Vec<ControlMessage> {
        self.state.trace.lock().await.clone()
    }

    /// Push a broadcast to every subscribed connection without storing it.
    pub async fn push_broadcast(&self, msg: StreamMessage) {
        broadcast(&self.state, &msg).await;
    }

    /// Drop every open connection, as a network partition would.
    pub async fn kill_connections(&self) {
        let mut conns = self.state.conns.lock().await;
        for conn in conns.drain(..) {
            conn.kill.cancel();
        }
    }

    /// Number of currently tracked connections (dead ones are pruned on
    /// kill only, so this is an upper bound between kills).
    pub async fn connection_count(&self) -> usize {
        self.state.conns.lock().await.len()
    }
}

async fn broadcast(state: &Arc<NodeState>, msg: &StreamMessage) {
    let key = (msg.id.stream_id.clone(), msg.id.stream_partition);
    let conns = state.conns.lock().await;
    for conn in conns.iter() {
        if conn.subs.lock().await.contains(&key) {
            let _ = conn.tx.send(ControlMessage::BroadcastMessage {
                request_id: String::new(),
                message: msg.clone(),
            });
        }
    }
}

async fn run_conn(
    state: Arc<NodeState>,
    entry: Arc<ConnEntry>,
    ws: tokio_tungstenite::WebSocketStream<tokio::net::TcpStream>,
    mut outbound: mpsc::UnboundedReceiver<ControlMessage>,
) {
    let (mut sink, mut stream) = ws.split();
    loop {
        tokio::select! {
            _ = entry.kill.cancelled() => {
                let _ = sink.close().await;
                return;
            }
            out = outbound.recv() => match out {
                Some(msg) => {
                    if sink.send(Message::Text(msg.encode().into())).await.is_err() {
                        return;
                    }
                }
                None => return,
            },
            frame = stream.next() => {
                let text = match frame {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Close(_))) | None | Some(Err(_)) => return,
                    _ => continue,
                };
                let Ok(request) = ControlMessage::decode(text.as_str()) else { continue };
                // Trace after handling so a traced request is a handled one.
                handle_request(&state, &entry, request.clone()).await;
                state.trace.lock().await.push(request);
            }
        }
    }
}

async fn handle_request(state: &Arc<NodeState>, entry: &Arc<ConnEntry>, request: ControlMessage) {
    match request {
        ControlMessage::SubscribeRequest { request_id, stream_id, stream_partition, .. } => {
            entry.subs.lock().await.insert((stream_id.clone(), stream_partition));
            let _ = entry.tx.send(ControlMessage::SubscribeResponse {
                request_id,
                stream_id,
                stream_partition,
            });
        }
        ControlMessage::UnsubscribeRequest { request_id, stream_id, stream_partition } => {
            entry.subs.lock().await.remove(&(stream_id.clone(), stream_partition));
            let _ = entry.tx.send(ControlMessage::UnsubscribeResponse {
                request_id,
                stream_id,
                stream_partition,
            });
        }
        ControlMessage::PublishRequest { message, .. } => {
            let key = (message.id.stream_id.clone(), message.id.stream_partition);
            state.storage.lock().await.entry(key).or_default().push(message.clone());
            broadcast(state, &message).await;
        }
        ControlMessage::ResendLastRequest {
            stream_id, stream_partition, sub_id, number_last, ..
        } => {
            let msgs = {
                let storage = state.storage.lock().await;
                let all = storage
                    .get(&(stream_id.clone(), stream_partition))
                    .cloned()
                    .unwrap_or_default();
                let skip = all.len().saturating_sub(number_last as usize);
                all.into_iter().skip(skip).collect::<Vec<_>>()
            };
            reply_resend(entry, &stream_id, stream_partition, &sub_id, msgs).await;
        }
        ControlMessage::ResendFromRequest {
            stream_id, stream_partition, sub_id, from, publisher_id, ..
        } => {
            let msgs = {
                let storage = state.storage.lock().await;
                storage
                    .get(&(stream_id.clone(), stream_partition))
                    .cloned()
                    .unwrap_or_default()
                    .into_iter()
                    .filter(|m| m.msg_ref() >= from)
                    .filter(|m| match &publisher_id {
                        Some(p) => m.id.publisher_id.eq_ignore_ascii_case(p),
                        None => true,
                    })
                    .collect::<Vec<_>>()
            };
            reply_resend(entry, &stream_id, stream_partition, &sub_id, msgs).await;
        }
        ControlMessage::ResendRangeRequest {
            stream_id,
            stream_partition,
            sub_id,
            from,
            to,
            publisher_id,
            msg_chain_id,
            ..
        } => {
            let msgs = {
                let storage = state.storage.lock().await;
                storage
                    .get(&(stream_id.clone(), stream_partition))
                    .cloned()
                    .unwrap_or_default()
                    .into_iter()
                    .filter(|m| m.msg_ref() >= from && m.msg_ref() <= to)
                    .filter(|m| match &publisher_id {
                        Some(p) => m.id.publisher_id.eq_ignore_ascii_case(p),
                        None => true,
                    })
                    .filter(|m| match &msg_chain_id {
                        Some(c) => &m.id.msg_chain_id == c,
                        None => true,
                    })
                    .collect::<Vec<_>>()
            };
            reply_resend(entry, &stream_id, stream_partition, &sub_id, msgs).await;
        }
        _ => {}
    }
}

async fn reply_resend(
    entry: &Arc<ConnEntry>,
    stream_id: &str,
    stream_partition: u32,
    sub_id: &str,
    msgs: Vec<StreamMessage>,
) {
    if msgs.is_empty() {
        let _ = entry.tx.send(ControlMessage::ResendResponseNoResend {
            sub_id: sub_id.to_owned(),
            stream_id: stream_id.to_owned(),
            stream_partition,
        });
        return;
    }
    let _ = entry.tx.send(ControlMessage::ResendResponseResending {
        sub_id: sub_id.to_owned(),
        stream_id: stream_id.to_owned(),
        stream_partition,
    });
    for message in msgs {
        let _ = entry
            .tx
            .send(ControlMessage::UnicastMessage { sub_id: sub_id.to_owned(), message });
    }
    let _ = entry.tx.send(ControlMessage::ResendResponseResent {
        sub_id: sub_id.to_owned(),
        stream_id: stream_id.to_owned(),
        stream_partition,
    });
}

/// Wait for a full disconnect/reconnect cycle on a client event stream.
/// Subscribe the receiver before triggering the drop.
pub async fn wait_for_reconnect(
    events: &mut tokio::sync::broadcast::Receiver<brook::ClientEvent>,
) -> anyhow::Result<()> {
    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), events.recv()).await??;
        if matches!(event, brook::ClientEvent::Disconnected) {
            break;
        }
    }
    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), events.recv()).await??;
        if matches!(event, brook::ClientEvent::Connected) {
            return Ok(());
        }
    }
}

/// Wait up to five seconds for the next message on a subscription.
pub async fn next_message(
    sub: &mut brook::Subscription,
) -> anyhow::Result<brook::StreamMessage> {
    tokio::time::timeout(Duration::from_secs(5), sub.next_message())
        .await?
        .ok_or_else(|| anyhow::anyhow!("subscription ended"))
}

/// Wait up to five seconds for a matching subscription event.
pub async fn wait_for_event(
    events: &mut tokio::sync::broadcast::Receiver<brook::SubscriptionEvent>,
    matches: impl Fn(&brook::SubscriptionEvent) -> bool,
) -> anyhow::Result<brook::SubscriptionEvent> {
    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), events.recv()).await??;
        if matches(&event) {
            return Ok(event);
        }
    }
}
