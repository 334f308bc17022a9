// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Single-socket connection state machine.
//!
//! One WebSocket carries all control traffic. The machine has four states
//! (`Disconnected`, `Connecting`, `Connected`, `Disconnecting`); lifecycle
//! transitions are published on a watch channel so concurrent `connect()` /
//! `disconnect()` calls can wait for the state they need:
//!
//! - a `disconnect()` issued while `Connecting` waits for `Connected` first;
//! - a `connect()` issued while `Disconnecting` waits for `Disconnected`
//!   and then reconnects.
//!
//! An unexpected close (not caller-initiated) re-enters `Connecting` after
//! an exponential backoff; a caller-initiated disconnect never reconnects.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{broadcast, mpsc, oneshot, watch, Mutex};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::error::ClientError;
use crate::protocol::control::ControlMessage;

/// Lifecycle states of the socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnecting => "disconnecting",
        };
        f.write_str(s)
    }
}

/// Events emitted by the connection.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    Connecting,
    Connected,
    Disconnecting,
    Disconnected,
    /// A recoverable transport or parse error. The connection survives.
    Error(String),
}

struct ConnInner {
    ws_url: String,
    reconnect_backoff: Duration,
    reconnect_backoff_max: Duration,
    state_tx: watch::Sender<ConnectionState>,
    event_tx: broadcast::Sender<ConnectionEvent>,
    inbound_tx: mpsc::UnboundedSender<ControlMessage>,
    /// Writer channel of the live socket, if any.
    writer: Mutex<Option<mpsc::UnboundedSender<String>>>,
    /// Frames buffered while `Connecting`; flushed on `Connected`.
    send_queue: Mutex<VecDeque<String>>,
    /// Stop token of the active socket task, if one is running.
    run_stop: Mutex<Option<CancellationToken>>,
    cancel: CancellationToken,
}

impl ConnInner {
    /// Apply a state transition, emitting the matching lifecycle event.
    /// No-op when the state is unchanged.
    fn transition(&self, next: ConnectionState) {
        let changed = self.state_tx.send_if_modified(|s| {
            if *s == next {
                false
            } else {
                *s = next;
                true
            }
        });
        if changed {
            tracing::debug!(state = %next, "connection state");
            let event = match next {
                ConnectionState::Disconnected => ConnectionEvent::Disconnected,
                ConnectionState::Connecting => ConnectionEvent::Connecting,
                ConnectionState::Connected => ConnectionEvent::Connected,
                ConnectionState::Disconnecting => ConnectionEvent::Disconnecting,
            };
            let _ = self.event_tx.send(event);
        }
    }

    fn emit_error(&self, message: String) {
        let _ = self.event_tx.send(ConnectionEvent::Error(message));
    }

    /// Parse and forward an inbound text frame. Unparseable frames are
    /// dropped with a recoverable error event.
    fn dispatch_frame(&self, text: &str) {
        match ControlMessage::decode(text) {
            Ok(msg) => {
                tracing::trace!(message = msg.type_name(), "inbound control message");
                let _ = self.inbound_tx.send(msg);
            }
            Err(e) => {
                tracing::warn!(err = %e, "dropping unparseable inbound frame");
                self.emit_error(e.to_string());
            }
        }
    }
}

/// The client's single WebSocket connection.
pub struct Connection {
    inner: Arc<ConnInner>,
    /// Serialises `connect()` / `disconnect()` operations (FIFO-fair).
    op_lock: Mutex<()>,
}

impl Connection {
    /// Build a connection. Inbound control messages arrive on the returned
    /// receiver; the caller owns dispatch.
    pub fn new(config: &Config, cancel: CancellationToken) -> (Self, mpsc::UnboundedReceiver<ControlMessage>) {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (event_tx, _) = broadcast::channel(64);
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(ConnInner {
            ws_url: config.ws_url(),
            reconnect_backoff: config.reconnect_backoff(),
            reconnect_backoff_max: config.reconnect_backoff_max(),
            state_tx,
            event_tx,
            inbound_tx,
            writer: Mutex::new(None),
            send_queue: Mutex::new(VecDeque::new()),
            run_stop: Mutex::new(None),
            cancel,
        });
        (Self { inner, op_lock: Mutex::new(()) }, inbound_rx)
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state_tx.borrow()
    }

    /// Subscribe to lifecycle and error events.
    pub fn events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.inner.event_tx.subscribe()
    }

    /// Bring the socket to `Connected`.
    ///
    /// Waits out an in-progress disconnect, joins an in-progress connect,
    /// and fails with `Connection` if the initial socket attempt fails.
    pub async fn connect(&self) -> Result<(), ClientError> {
        let _guard = self.op_lock.lock().await;
        loop {
            match self.state() {
                ConnectionState::Connected => return Ok(()),
                ConnectionState::Connecting => self.wait_changed().await?,
                ConnectionState::Disconnecting => {
                    self.wait_for_state(ConnectionState::Disconnected).await?;
                }
                ConnectionState::Disconnected => {
                    let mut run_stop = self.inner.run_stop.lock().await;
                    if run_stop.is_some() {
                        // A reconnect loop already owns the socket; wait for it.
                        drop(run_stop);
                        self.wait_changed().await?;
                        continue;
                    }
                    self.inner.transition(ConnectionState::Connecting);
                    let stop = CancellationToken::new();
                    *run_stop = Some(stop.clone());
                    drop(run_stop);

                    let (ready_tx, ready_rx) = oneshot::channel();
                    tokio::spawn(run_socket(Arc::clone(&self.inner), stop, ready_tx));
                    return ready_rx
                        .await
                        .map_err(|_| ClientError::Connection("connect aborted".to_owned()))?;
                }
            }
        }
    }

    /// Bring the socket to `Disconnected` without triggering a reconnect.
    pub async fn disconnect(&self) -> Result<(), ClientError> {
        let _guard = self.op_lock.lock().await;
        loop {
            match self.state() {
                // A disconnect during connection establishment waits for the
                // connection to land, then tears it down. A failed attempt
                // lands on `Disconnected` and is handled below.
                ConnectionState::Connecting => self.wait_changed().await?,
                ConnectionState::Connected => {
                    self.inner.transition(ConnectionState::Disconnecting);
                    if let Some(stop) = self.inner.run_stop.lock().await.clone() {
                        stop.cancel();
                    }
                    return self.wait_for_state(ConnectionState::Disconnected).await;
                }
                ConnectionState::Disconnecting => {
                    return self.wait_for_state(ConnectionState::Disconnected).await;
                }
                ConnectionState::Disconnected => {
                    // Stop a backoff loop that may still be retrying.
                    if let Some(stop) = self.inner.run_stop.lock().await.take() {
                        stop.cancel();
                    }
                    return Ok(());
                }
            }
        }
    }

    /// Send a control message.
    ///
    /// While `Connecting` the frame is buffered and flushed on `Connected`;
    /// in any other non-connected state the send fails with `NotConnected`.
    pub async fn send(&self, msg: &ControlMessage) -> Result<(), ClientError> {
        let text = msg.encode();
        match self.state() {
            ConnectionState::Connected => {
                let writer = self.inner.writer.lock().await;
                match writer.as_ref() {
                    Some(tx) if tx.send(text).is_ok() => Ok(()),
                    _ => Err(ClientError::NotConnected),
                }
            }
            ConnectionState::Connecting => {
                self.inner.send_queue.lock().await.push_back(text);
                Ok(())
            }
            _ => Err(ClientError::NotConnected),
        }
    }

    /// Send now when connected, otherwise buffer for the next `Connected`.
    ///
    /// Used for control traffic that must reach the node exactly once even
    /// when issued before the socket is up (e.g. a subscribe immediately
    /// followed by its unsubscribe).
    pub async fn send_or_queue(&self, msg: &ControlMessage) -> Result<(), ClientError> {
        let text = msg.encode();
        if self.state() == ConnectionState::Connected {
            let writer = self.inner.writer.lock().await;
            if let Some(tx) = writer.as_ref() {
                if tx.send(text.clone()).is_ok() {
                    return Ok(());
                }
            }
            drop(writer);
        }
        self.inner.send_queue.lock().await.push_back(text);
        // The socket may have come up between the state check and the push,
        // in which case the connect-time flush already ran; drain again.
        if self.state() == ConnectionState::Connected {
            let writer = self.inner.writer.lock().await;
            if let Some(tx) = writer.as_ref() {
                let mut queue = self.inner.send_queue.lock().await;
                while let Some(text) = queue.pop_front() {
                    let _ = tx.send(text);
                }
            }
        }
        Ok(())
    }

    /// Wait until the connection reaches `target`.
    pub async fn wait_for_state(&self, target: ConnectionState) -> Result<(), ClientError> {
        let mut rx = self.inner.state_tx.subscribe();
        loop {
            if *rx.borrow_and_update() == target {
                return Ok(());
            }
            tokio::select! {
                _ = self.inner.cancel.cancelled() => {
                    return Err(ClientError::Connection("client closed".to_owned()));
                }
                changed = rx.changed() => {
                    if changed.is_err() {
                        return Err(ClientError::Connection("connection dropped".to_owned()));
                    }
                }
            }
        }
    }

    async fn wait_changed(&self) -> Result<(), ClientError> {
        let mut rx = self.inner.state_tx.subscribe();
        rx.borrow_and_update();
        tokio::select! {
            _ = self.inner.cancel.cancelled() => {
                Err(ClientError::Connection("client closed".to_owned()))
            }
            changed = rx.changed() => changed
                .map_err(|_| ClientError::Connection("connection dropped".to_owned())),
        }
    }
}

/// Socket task: owns the WebSocket for one `connect()` call, including any
/// reconnects after unexpected closes. Exits on stop/cancel or when the
/// initial attempt fails.
async fn run_socket(
    inner: Arc<ConnInner>,
    stop: CancellationToken,
    ready: oneshot::Sender<Result<(), ClientError>>,
) {
    let mut ready = Some(ready);
    let mut backoff = inner.reconnect_backoff;

    // State is `Connecting` on entry, both for the first attempt and for
    // every retry iteration. Every terminal path clears `run_stop` before
    // its final state transition so a follow-up `connect()` never observes
    // a stale token.
    loop {
        if stop.is_cancelled() || inner.cancel.is_cancelled() {
            inner.run_stop.lock().await.take();
            return;
        }

        match tokio_tungstenite::connect_async(&inner.ws_url).await {
            Ok((ws, _response)) => {
                backoff = inner.reconnect_backoff;
                let (mut sink, mut stream) = ws.split();
                let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
                *inner.writer.lock().await = Some(out_tx);
                inner.transition(ConnectionState::Connected);
                if let Some(r) = ready.take() {
                    let _ = r.send(Ok(()));
                }

                // Flush frames buffered while connecting.
                let queued: Vec<String> = inner.send_queue.lock().await.drain(..).collect();
                for text in queued {
                    if sink.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }

                let mut caller_initiated = false;
                loop {
                    tokio::select! {
                        _ = stop.cancelled() => {
                            let _ = sink.close().await;
                            caller_initiated = true;
                            break;
                        }
                        _ = inner.cancel.cancelled() => {
                            let _ = sink.close().await;
                            caller_initiated = true;
                            break;
                        }
                        msg = stream.next() => {
                            match msg {
                                Some(Ok(Message::Text(text))) => inner.dispatch_frame(text.as_str()),
                                Some(Ok(Message::Close(_))) | None => {
                                    tracing::debug!("socket closed by peer");
                                    break;
                                }
                                Some(Err(e)) => {
                                    tracing::debug!(err = %e, "socket error");
                                    inner.emit_error(e.to_string());
                                    break;
                                }
                                _ => {} // ping/pong/binary ignored
                            }
                        }
                        out = out_rx.recv() => {
                            if let Some(text) = out {
                                if sink.send(Message::Text(text.into())).await.is_err() {
                                    tracing::debug!("socket write failed");
                                    break;
                                }
                            }
                        }
                    }
                }

                *inner.writer.lock().await = None;
                if caller_initiated {
                    inner.run_stop.lock().await.take();
                    inner.transition(ConnectionState::Disconnected);
                    return;
                }
                inner.transition(ConnectionState::Disconnected);
                // Unexpected close: fall through to backoff and reconnect.
            }
            Err(e) => {
                tracing::debug!(err = %e, "socket connect failed");
                inner.emit_error(e.to_string());
                if let Some(r) = ready.take() {
                    // First attempt: surface the failure to the caller
                    // instead of retrying.
                    inner.run_stop.lock().await.take();
                    inner.transition(ConnectionState::Disconnected);
                    let _ = r.send(Err(ClientError::Connection(e.to_string())));
                    return;
                }
                inner.transition(ConnectionState::Disconnected);
            }
        }

        tokio::select! {
            _ = stop.cancelled() => {
                inner.run_stop.lock().await.take();
                return;
            }
            _ = inner.cancel.cancelled() => {
                inner.run_stop.lock().await.take();
                return;
            }
            _ = tokio::time::sleep(backoff) => {}
        }
        backoff = (backoff * 2).min(inner.reconnect_backoff_max);
        inner.transition(ConnectionState::Connecting);
    }
}

#[cfg(test)]
#[path = "connection_tests.rs"]
mod tests;
