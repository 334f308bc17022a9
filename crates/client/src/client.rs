// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Client facade: owns the connection, session, publisher, subscriber, and
//! key store, and wires reconnect resumption and the auto-connect /
//! auto-disconnect lifecycle.

use std::sync::Arc;

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::config::{Auth, Config};
use crate::connection::{Connection, ConnectionEvent, ConnectionState};
use crate::crypto::SigningIdentity;
use crate::error::ClientError;
use crate::keystore::{GroupKey, GroupKeyStore};
use crate::protocol::message::MessageRef;
use crate::publisher::{PublishOptions, Publisher};
use crate::rest::{RestClient, StreamInfo, StreamRegistry};
use crate::session::Session;
use crate::subscriber::Subscriber;
use crate::subscription::{ResendOptions, Subscription};

/// Client-level events forwarded to applications.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    Connected,
    Disconnected,
    /// A recoverable transport-level error.
    Error(String),
}

/// A client instance. All state is owned here; there is no process-wide
/// state, so any number of clients coexist in one process.
pub struct Client {
    config: Config,
    connection: Arc<Connection>,
    session: Arc<Session>,
    registry: Arc<StreamRegistry>,
    key_store: Arc<GroupKeyStore>,
    publisher: Arc<Publisher>,
    subscriber: Arc<Subscriber>,
    events: broadcast::Sender<ClientEvent>,
    cancel: CancellationToken,
}

impl Client {
    pub fn new(config: Config) -> Result<Self, ClientError> {
        let identity = match &config.auth {
            Auth::PrivateKey(key) => Some(Arc::new(SigningIdentity::from_private_key(key)?)),
            _ => None,
        };
        let cancel = CancellationToken::new();
        let rest = Arc::new(RestClient::new(&config.rest_url, config.rest_timeout()));
        let session =
            Arc::new(Session::new(config.auth.clone(), identity.clone(), Arc::clone(&rest)));
        let registry = Arc::new(StreamRegistry::new(rest, Arc::clone(&session)));
        let key_store = Arc::new(GroupKeyStore::new());

        let (connection, mut inbound) = Connection::new(&config, cancel.clone());
        let connection = Arc::new(connection);
        let publisher = Arc::new(Publisher::new(
            &config,
            Arc::clone(&connection),
            Arc::clone(&session),
            Arc::clone(&registry),
            Arc::clone(&key_store),
            identity,
        ));
        let subscriber = Arc::new(Subscriber::new(
            &config,
            Arc::clone(&connection),
            Arc::clone(&session),
            Arc::clone(&key_store),
            cancel.clone(),
        ));

        let (events, _) = broadcast::channel(64);

        // Inbound dispatch.
        let dispatch_subscriber = Arc::clone(&subscriber);
        let dispatch_cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                let msg = tokio::select! {
                    _ = dispatch_cancel.cancelled() => return,
                    msg = inbound.recv() => match msg {
                        Some(msg) => msg,
                        None => return,
                    },
                };
                dispatch_subscriber.dispatch(msg).await;
            }
        });

        // Reconnect resumption and event forwarding.
        let lifecycle_subscriber = Arc::clone(&subscriber);
        let lifecycle_publisher = Arc::clone(&publisher);
        let lifecycle_events = events.clone();
        let mut connection_events = connection.events();
        let lifecycle_cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = lifecycle_cancel.cancelled() => return,
                    event = connection_events.recv() => match event {
                        Ok(event) => event,
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => return,
                    },
                };
                match event {
                    ConnectionEvent::Connected => {
                        lifecycle_subscriber.resubscribe_all().await;
                        lifecycle_publisher.drain_pending().await;
                        let _ = lifecycle_events.send(ClientEvent::Connected);
                    }
                    ConnectionEvent::Disconnected => {
                        lifecycle_subscriber.on_disconnected().await;
                        let _ = lifecycle_events.send(ClientEvent::Disconnected);
                    }
                    ConnectionEvent::Error(e) => {
                        let _ = lifecycle_events.send(ClientEvent::Error(e));
                    }
                    _ => {}
                }
            }
        });

        // Auto-disconnect when idle.
        if config.auto_disconnect {
            let idle_connection = Arc::clone(&connection);
            let idle_subscriber = Arc::clone(&subscriber);
            let idle_publisher = Arc::clone(&publisher);
            let delay = config.auto_disconnect_delay();
            let idle_cancel = cancel.clone();
            tokio::spawn(async move {
                let mut was_idle = false;
                loop {
                    tokio::select! {
                        _ = idle_cancel.cancelled() => return,
                        _ = tokio::time::sleep(delay) => {}
                    }
                    let idle = idle_connection.state() == ConnectionState::Connected
                        && idle_subscriber.subscription_count().await == 0
                        && idle_publisher.pending_len().await == 0;
                    if idle && was_idle {
                        tracing::debug!("idle for a full interval, disconnecting");
                        if let Err(e) = idle_connection.disconnect().await {
                            tracing::debug!(err = %e, "auto-disconnect failed");
                        }
                        was_idle = false;
                    } else {
                        was_idle = idle;
                    }
                }
            });
        }

        Ok(Self {
            config,
            connection,
            session,
            registry,
            key_store,
            publisher,
            subscriber,
            events,
            cancel,
        })
    }

    // -- lifecycle -------------------------------------------------------------

    pub async fn connect(&self) -> Result<(), ClientError> {
        self.connection.connect().await
    }

    pub async fn disconnect(&self) -> Result<(), ClientError> {
        self.connection.disconnect().await
    }

    pub fn state(&self) -> ConnectionState {
        self.connection.state()
    }

    /// Wait until the connection reaches `state`.
    pub async fn wait_for_state(&self, state: ConnectionState) -> Result<(), ClientError> {
        self.connection.wait_for_state(state).await
    }

    /// Subscribe to client-level events.
    pub fn events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    // -- publish ---------------------------------------------------------------

    /// Publish onto a stream's default partition with the wall-clock
    /// timestamp.
    pub async fn publish(
        &self,
        stream_id: &str,
        payload: &serde_json::Value,
    ) -> Result<MessageRef, ClientError> {
        self.publisher.publish(stream_id, payload, PublishOptions::default()).await
    }

    /// Publish with explicit timestamp and/or partition key.
    pub async fn publish_with(
        &self,
        stream_id: &str,
        payload: &serde_json::Value,
        options: PublishOptions,
    ) -> Result<MessageRef, ClientError> {
        self.publisher.publish(stream_id, payload, options).await
    }

    /// Address (or anonymous id) this client publishes under.
    pub fn publisher_id(&self) -> &str {
        self.publisher.publisher_id()
    }

    /// Stage a group-key rotation for the next publish.
    pub async fn rotate_group_key(&self, stream_id: &str) -> GroupKey {
        self.publisher.rotate_group_key(stream_id).await
    }

    /// Replace the current group key immediately.
    pub async fn rekey(&self, stream_id: &str) -> GroupKey {
        self.publisher.rekey(stream_id).await
    }

    // -- subscribe -------------------------------------------------------------

    /// Subscribe to realtime messages; with a resend spec the subscription
    /// replays history first and then continues live.
    pub async fn subscribe(
        &self,
        stream_id: &str,
        partition: u32,
        resend: Option<ResendOptions>,
    ) -> Result<Subscription, ClientError> {
        self.subscriber.subscribe(stream_id, partition, resend).await
    }

    /// Historical replay only.
    pub async fn resend(
        &self,
        stream_id: &str,
        partition: u32,
        resend: ResendOptions,
    ) -> Result<Subscription, ClientError> {
        self.subscriber.resend(stream_id, partition, resend).await
    }

    /// Provide group keys for a publisher, releasing any parked messages.
    pub async fn set_group_keys(
        &self,
        stream_id: &str,
        publisher_id: &str,
        keys: Vec<GroupKey>,
    ) {
        self.subscriber.set_group_keys(stream_id, publisher_id, keys).await;
    }

    // -- collaborators ---------------------------------------------------------

    /// Stream metadata from the REST collaborator.
    pub async fn get_stream(&self, stream_id: &str) -> Result<StreamInfo, ClientError> {
        self.registry.get_stream(stream_id).await
    }

    /// The session token, acquiring one if needed.
    pub async fn session_token(&self, force_refresh: bool) -> Result<Option<String>, ClientError> {
        self.session.get_session_token(force_refresh).await
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Group-key store shared by the publish and subscribe pipelines.
    pub fn group_key_store(&self) -> &Arc<GroupKeyStore> {
        &self.key_store
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
#[path = "client_tests.rs"]
mod tests;
