// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Subscription registry: one server-side subscription per stream
//! partition, shared by any number of local handles, plus routing of
//! inbound control messages into the per-subscription pipelines.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::connection::{Connection, ConnectionState};
use crate::error::ClientError;
use crate::keystore::{GroupKey, GroupKeyStore};
use crate::protocol::control::ControlMessage;
use crate::protocol::message::StreamMessage;
use crate::session::Session;
use crate::subscription::{
    ResendOptions, SubCommand, Subscription, SubscriptionEvent, SubscriptionInner,
    SubscriptionKind,
};

/// Wire state of the per-stream server-side subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WireState {
    Subscribing,
    Subscribed,
}

struct StreamSub {
    wire_state: WireState,
    subs: Vec<Arc<SubscriptionInner>>,
    /// Whether a SubscribeRequest has been sent (or buffered) for the
    /// current connection; cleared on disconnect so the reconnect pass
    /// re-issues exactly one.
    request_sent: bool,
}

struct SubscriberState {
    config: Config,
    connection: Arc<Connection>,
    session: Arc<Session>,
    key_store: Arc<GroupKeyStore>,
    streams: Mutex<HashMap<(String, u32), StreamSub>>,
    by_sub_id: Mutex<HashMap<String, Arc<SubscriptionInner>>>,
    command_tx: mpsc::UnboundedSender<SubCommand>,
    cancel: CancellationToken,
}

pub struct Subscriber {
    state: Arc<SubscriberState>,
}

impl Subscriber {
    pub fn new(
        config: &Config,
        connection: Arc<Connection>,
        session: Arc<Session>,
        key_store: Arc<GroupKeyStore>,
        cancel: CancellationToken,
    ) -> Self {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let state = Arc::new(SubscriberState {
            config: config.clone(),
            connection,
            session,
            key_store,
            streams: Mutex::new(HashMap::new()),
            by_sub_id: Mutex::new(HashMap::new()),
            command_tx,
            cancel,
        });
        tokio::spawn(run_commands(Arc::clone(&state), command_rx));
        Self { state }
    }

    /// Subscribe to realtime messages; with a resend spec the handle first
    /// replays history, then continues live (combined).
    pub async fn subscribe(
        &self,
        stream_id: &str,
        partition: u32,
        resend: Option<ResendOptions>,
    ) -> Result<Subscription, ClientError> {
        let kind = match resend {
            Some(_) => SubscriptionKind::Combined,
            None => SubscriptionKind::Realtime,
        };
        self.create(stream_id, partition, kind, resend).await
    }

    /// Replay history only; the handle's stream ends with the resend.
    pub async fn resend(
        &self,
        stream_id: &str,
        partition: u32,
        resend: ResendOptions,
    ) -> Result<Subscription, ClientError> {
        self.create(stream_id, partition, SubscriptionKind::Historical, Some(resend)).await
    }

    async fn create(
        &self,
        stream_id: &str,
        partition: u32,
        kind: SubscriptionKind,
        resend: Option<ResendOptions>,
    ) -> Result<Subscription, ClientError> {
        let state = &self.state;
        let (inner, rx) = SubscriptionInner::new(
            &state.config,
            stream_id.to_owned(),
            partition,
            kind,
            resend,
            Arc::clone(&state.connection),
            Arc::clone(&state.session),
            Arc::clone(&state.key_store),
            state.command_tx.clone(),
            &state.cancel,
        );
        state.by_sub_id.lock().await.insert(inner.id.clone(), Arc::clone(&inner));

        let (first_handle, already_subscribed) = {
            let mut streams = state.streams.lock().await;
            match streams.get_mut(&(stream_id.to_owned(), partition)) {
                Some(entry) => {
                    entry.subs.push(Arc::clone(&inner));
                    (false, entry.wire_state == WireState::Subscribed)
                }
                None => {
                    streams.insert(
                        (stream_id.to_owned(), partition),
                        StreamSub {
                            wire_state: WireState::Subscribing,
                            subs: vec![Arc::clone(&inner)],
                            request_sent: true,
                        },
                    );
                    (true, false)
                }
            }
        };

        if first_handle {
            if let Err(e) = state.send_subscribe(stream_id, partition).await {
                state.remove_sub(&inner).await;
                inner.close().await;
                return Err(e);
            }
        } else if already_subscribed {
            inner.emit(SubscriptionEvent::Subscribed);
            state.maybe_send_resend(&inner).await;
        }

        Ok(Subscription::new(inner, rx))
    }

    /// Insert keys for `(stream, publisher)` and drain every parked queue
    /// that was waiting on them.
    pub async fn set_group_keys(
        &self,
        stream_id: &str,
        publisher_id: &str,
        keys: Vec<GroupKey>,
    ) {
        // Each key stays retrievable by id; the last supplied one becomes
        // current.
        for key in keys {
            self.state.key_store.set_current(stream_id, publisher_id, key).await;
        }
        let subs = self.state.subs_for_stream(stream_id).await;
        for sub in subs {
            sub.drain_parked(publisher_id).await;
        }
    }

    /// Number of live local handles.
    pub async fn subscription_count(&self) -> usize {
        self.state.streams.lock().await.values().map(|s| s.subs.len()).sum()
    }

    // -- inbound routing (driven by the client dispatch task) ------------------

    pub(crate) async fn handle_broadcast(&self, msg: StreamMessage) {
        let key = (msg.id.stream_id.clone(), msg.id.stream_partition);
        let subs = {
            let streams = self.state.streams.lock().await;
            streams.get(&key).map(|s| s.subs.clone()).unwrap_or_default()
        };
        if subs.is_empty() {
            tracing::debug!(stream = %msg.id.stream_id, "broadcast for unknown stream dropped");
            return;
        }
        for sub in subs {
            sub.handle_realtime(msg.clone()).await;
        }
    }

    pub(crate) async fn handle_unicast(&self, sub_id: &str, msg: StreamMessage) {
        let sub = self.state.by_sub_id.lock().await.get(sub_id).cloned();
        match sub {
            Some(sub) => {
                sub.note_resend_activity();
                sub.handle_unicast(msg).await;
            }
            None => tracing::debug!(sub_id, "unicast for unknown subscription dropped"),
        }
    }

    pub(crate) async fn handle_subscribe_response(&self, stream_id: &str, partition: u32) {
        let subs = {
            let mut streams = self.state.streams.lock().await;
            let Some(entry) = streams.get_mut(&(stream_id.to_owned(), partition)) else {
                return;
            };
            entry.wire_state = WireState::Subscribed;
            entry.subs.clone()
        };
        for sub in subs {
            sub.emit(SubscriptionEvent::Subscribed);
            self.state.maybe_send_resend(&sub).await;
        }
    }

    pub(crate) async fn handle_unsubscribe_response(&self, stream_id: &str, partition: u32) {
        // Normally the entry is already gone (removed when the unsubscribe
        // was sent); this covers server-initiated teardown.
        let entry = self.state.streams.lock().await.remove(&(stream_id.to_owned(), partition));
        if let Some(entry) = entry {
            for sub in entry.subs {
                self.state.by_sub_id.lock().await.remove(&sub.id);
                sub.close().await;
            }
        }
    }

    pub(crate) async fn handle_resending(&self, sub_id: &str) {
        if let Some(sub) = self.state.by_sub_id.lock().await.get(sub_id) {
            sub.note_resend_activity();
            sub.emit(SubscriptionEvent::Resending);
        }
    }

    pub(crate) async fn handle_resent(&self, sub_id: &str) {
        let sub = self.state.by_sub_id.lock().await.get(sub_id).cloned();
        if let Some(sub) = sub {
            sub.resend_done(false).await;
        }
    }

    pub(crate) async fn handle_no_resend(&self, sub_id: &str) {
        let sub = self.state.by_sub_id.lock().await.get(sub_id).cloned();
        if let Some(sub) = sub {
            sub.resend_done(true).await;
        }
    }

    /// Route one inbound control message to the right handler.
    pub(crate) async fn dispatch(&self, msg: ControlMessage) {
        match msg {
            ControlMessage::BroadcastMessage { message, .. } => {
                self.handle_broadcast(message).await;
            }
            ControlMessage::UnicastMessage { sub_id, message } => {
                self.handle_unicast(&sub_id, message).await;
            }
            ControlMessage::SubscribeResponse { stream_id, stream_partition, .. } => {
                self.handle_subscribe_response(&stream_id, stream_partition).await;
            }
            ControlMessage::UnsubscribeResponse { stream_id, stream_partition, .. } => {
                self.handle_unsubscribe_response(&stream_id, stream_partition).await;
            }
            ControlMessage::ResendResponseResending { sub_id, .. } => {
                self.handle_resending(&sub_id).await;
            }
            ControlMessage::ResendResponseResent { sub_id, .. } => {
                self.handle_resent(&sub_id).await;
            }
            ControlMessage::ResendResponseNoResend { sub_id, .. } => {
                self.handle_no_resend(&sub_id).await;
            }
            ControlMessage::ErrorResponse { error_message, error_code, .. } => {
                tracing::warn!(code = %error_code, message = %error_message, "node error");
            }
            other => {
                tracing::debug!(message = other.type_name(), "unexpected inbound message");
            }
        }
    }

    /// The connection dropped: per-connection request bookkeeping resets so
    /// the reconnect pass re-issues subscribes.
    pub(crate) async fn on_disconnected(&self) {
        let mut streams = self.state.streams.lock().await;
        for entry in streams.values_mut() {
            entry.request_sent = false;
        }
    }

    /// Issue a SubscribeRequest for every live stream whose request does
    /// not belong to the current connection. Streams unsubscribed before
    /// the reconnect are gone from the map and are not resubscribed.
    pub(crate) async fn resubscribe_all(&self) {
        let entries: Vec<((String, u32), Vec<Arc<SubscriptionInner>>)> = {
            let mut streams = self.state.streams.lock().await;
            streams
                .iter_mut()
                .filter(|(_, entry)| !entry.request_sent)
                .map(|(key, entry)| {
                    entry.wire_state = WireState::Subscribing;
                    entry.request_sent = true;
                    (key.clone(), entry.subs.clone())
                })
                .collect()
        };
        for ((stream_id, partition), subs) in entries {
            // An interrupted resend is re-requested once the fresh
            // subscribe completes.
            for sub in &subs {
                if sub.resend_pending() {
                    sub.reset_resend_request();
                }
            }
            if let Err(e) = self.state.send_subscribe(&stream_id, partition).await {
                tracing::warn!(stream = %stream_id, err = %e, "resubscribe failed");
            }
        }
    }
}

impl SubscriberState {
    async fn send_subscribe(&self, stream_id: &str, partition: u32) -> Result<(), ClientError> {
        let state = self.connection.state();
        if !self.config.auto_connect
            && matches!(state, ConnectionState::Disconnected | ConnectionState::Disconnecting)
        {
            return Err(ClientError::NotConnected);
        }
        let session_token = self.session.get_session_token(false).await?;
        let request = ControlMessage::SubscribeRequest {
            request_id: uuid::Uuid::new_v4().to_string(),
            stream_id: stream_id.to_owned(),
            stream_partition: partition,
            session_token,
        };
        // Buffered when the socket is not up yet; flushed on `Connected`.
        self.connection.send_or_queue(&request).await?;

        if matches!(state, ConnectionState::Disconnected | ConnectionState::Disconnecting) {
            let connection = Arc::clone(&self.connection);
            tokio::spawn(async move {
                if let Err(e) = connection.connect().await {
                    tracing::debug!(err = %e, "auto-connect failed");
                }
            });
        }
        Ok(())
    }

    async fn maybe_send_resend(&self, sub: &Arc<SubscriptionInner>) {
        let Some(resend) = sub.resend.clone() else { return };
        if sub.resend_requested.swap(true, Ordering::SeqCst) {
            return;
        }
        let session_token = match self.session.get_session_token(false).await {
            Ok(token) => token,
            Err(e) => {
                sub.emit(SubscriptionEvent::Error(e));
                return;
            }
        };
        let request_id = uuid::Uuid::new_v4().to_string();
        let request = match resend {
            ResendOptions::Last { count } => ControlMessage::ResendLastRequest {
                request_id,
                stream_id: sub.stream_id.clone(),
                stream_partition: sub.partition,
                sub_id: sub.id.clone(),
                number_last: count,
                session_token,
            },
            ResendOptions::From { from, publisher_id } => ControlMessage::ResendFromRequest {
                request_id,
                stream_id: sub.stream_id.clone(),
                stream_partition: sub.partition,
                sub_id: sub.id.clone(),
                from,
                publisher_id,
                session_token,
            },
            ResendOptions::Range { from, to, publisher_id, msg_chain_id } => {
                ControlMessage::ResendRangeRequest {
                    request_id,
                    stream_id: sub.stream_id.clone(),
                    stream_partition: sub.partition,
                    sub_id: sub.id.clone(),
                    from,
                    to,
                    publisher_id,
                    msg_chain_id,
                    session_token,
                }
            }
        };
        if let Err(e) = self.connection.send(&request).await {
            tracing::warn!(err = %e, "resend request not sent");
            sub.emit(SubscriptionEvent::Error(e));
            return;
        }

        // Silent-resend watchdog: one retry, then a timeout failure.
        let sub = Arc::clone(sub);
        let connection = Arc::clone(&self.connection);
        let retry_after = self.config.retry_resend_after();
        let resend_timeout = self.config.resend_timeout();
        tokio::spawn(async move {
            tokio::select! {
                _ = sub.cancel.cancelled() => return,
                _ = tokio::time::sleep(retry_after) => {}
            }
            if !sub.resend_pending() || sub.resend_seen() {
                return;
            }
            tracing::debug!(sub_id = %sub.id, "resend silent, re-requesting");
            if connection.send(&request).await.is_err() {
                return;
            }
            tokio::select! {
                _ = sub.cancel.cancelled() => return,
                _ = tokio::time::sleep(resend_timeout) => {}
            }
            if sub.resend_pending() && !sub.resend_seen() {
                tracing::warn!(sub_id = %sub.id, "resend timed out");
                sub.emit(SubscriptionEvent::Error(ClientError::Connection(
                    "resend timed out".to_owned(),
                )));
                sub.resend_done(true).await;
            }
        });
    }

    async fn subs_for_stream(&self, stream_id: &str) -> Vec<Arc<SubscriptionInner>> {
        let streams = self.streams.lock().await;
        streams
            .iter()
            .filter(|((id, _), _)| id == stream_id)
            .flat_map(|(_, entry)| entry.subs.iter().cloned())
            .collect()
    }

    async fn remove_sub(&self, inner: &Arc<SubscriptionInner>) {
        self.by_sub_id.lock().await.remove(&inner.id);
        let mut streams = self.streams.lock().await;
        let key = (inner.stream_id.clone(), inner.partition);
        let last_handle = match streams.get_mut(&key) {
            Some(entry) => {
                entry.subs.retain(|s| s.id != inner.id);
                entry.subs.is_empty()
            }
            None => false,
        };
        if last_handle {
            streams.remove(&key);
        }
    }

    /// Detach a handle; the last handle for a stream tears down the
    /// server-side subscription.
    async fn unsubscribe(&self, inner: Arc<SubscriptionInner>) {
        let key = (inner.stream_id.clone(), inner.partition);
        let was_tracked = {
            let streams = self.streams.lock().await;
            streams.get(&key).is_some_and(|e| e.subs.iter().any(|s| s.id == inner.id))
        };
        if !was_tracked {
            inner.close().await;
            return;
        }
        self.remove_sub(&inner).await;
        inner.close().await;

        let stream_gone = !self.streams.lock().await.contains_key(&key);
        if stream_gone {
            let request = ControlMessage::UnsubscribeRequest {
                request_id: uuid::Uuid::new_v4().to_string(),
                stream_id: inner.stream_id.clone(),
                stream_partition: inner.partition,
            };
            if let Err(e) = self.connection.send_or_queue(&request).await {
                tracing::debug!(err = %e, "unsubscribe request not sent");
            }
        }
    }
}

/// Processes handle-originated commands (unsubscribes from `cancel()` and
/// `Drop`).
async fn run_commands(
    state: Arc<SubscriberState>,
    mut rx: mpsc::UnboundedReceiver<SubCommand>,
) {
    loop {
        let command = tokio::select! {
            _ = state.cancel.cancelled() => return,
            command = rx.recv() => match command {
                Some(command) => command,
                None => return,
            },
        };
        match command {
            SubCommand::Unsubscribe(inner) => state.unsubscribe(inner).await,
        }
    }
}

#[cfg(test)]
#[path = "subscriber_tests.rs"]
mod tests;
