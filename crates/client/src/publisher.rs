// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Publish pipeline: per-stream chaining, signing, encryption, and the
//! bounded pending queue that survives reconnects.
//!
//! Ordering contract: concurrent `publish` calls on one stream produce the
//! same refs as if they had run serially in call order, even when stream
//! metadata lookups resolve out of order. The per-stream mutex ticket is
//! taken at call entry (tokio mutexes queue FIFO) and the metadata lookup
//! runs concurrently with the ticket wait; the chained steps run under the
//! guard.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::config::{Config, SignaturePolicy};
use crate::connection::{Connection, ConnectionState};
use crate::crypto::{self, SigningIdentity};
use crate::error::ClientError;
use crate::keystore::{GroupKey, GroupKeyStore};
use crate::protocol::message::{
    ContentType, EncryptedGroupKey, EncryptionType, MessageId, MessageRef, MessageType,
    SignatureType, StreamMessage,
};
use crate::protocol::control::ControlMessage;
use crate::rest::StreamRegistry;
use crate::session::Session;

/// Caller-supplied options for a single publish.
#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    /// Event timestamp in ms; defaults to the wall clock.
    pub timestamp: Option<u64>,
    /// Keyed partition selection; defaults to partition 0.
    pub partition_key: Option<String>,
}

struct StreamState {
    last_ref: Option<MessageRef>,
    msg_chain_id: String,
}

pub struct Publisher {
    connection: Arc<Connection>,
    session: Arc<Session>,
    registry: Arc<StreamRegistry>,
    key_store: Arc<GroupKeyStore>,
    identity: Option<Arc<SigningIdentity>>,
    publisher_id: String,
    sign_policy: SignaturePolicy,
    auto_connect: bool,
    max_queue: usize,
    /// Per-stream chain state; the inner mutex is the publish critical
    /// section.
    streams: Mutex<HashMap<String, Arc<Mutex<StreamState>>>>,
    /// Requests held back while disconnected, drained FIFO on connect.
    pending: Mutex<VecDeque<ControlMessage>>,
}

impl Publisher {
    pub fn new(
        config: &Config,
        connection: Arc<Connection>,
        session: Arc<Session>,
        registry: Arc<StreamRegistry>,
        key_store: Arc<GroupKeyStore>,
        identity: Option<Arc<SigningIdentity>>,
    ) -> Self {
        let publisher_id = match &identity {
            Some(identity) => identity.address().to_owned(),
            // Anonymous publishers get a session-scoped random id.
            None => {
                use rand::RngCore;
                let mut bytes = [0u8; 20];
                rand::rng().fill_bytes(&mut bytes);
                format!("0x{}", hex::encode(bytes))
            }
        };
        Self {
            connection,
            session,
            registry,
            key_store,
            identity,
            publisher_id,
            sign_policy: config.publish_with_signature,
            auto_connect: config.auto_connect,
            max_queue: config.max_publish_queue_size,
            streams: Mutex::new(HashMap::new()),
            pending: Mutex::new(VecDeque::new()),
        }
    }

    pub fn publisher_id(&self) -> &str {
        &self.publisher_id
    }

    /// Publish a payload, returning the ref assigned to it.
    pub async fn publish(
        &self,
        stream_id: &str,
        payload: &serde_json::Value,
        options: PublishOptions,
    ) -> Result<MessageRef, ClientError> {
        let state = self.stream_state(stream_id).await;
        // The lock future enters the FIFO queue as soon as it is polled, so
        // the metadata lookup overlapping it cannot reorder calls.
        let (mut guard, info) =
            tokio::join!(state.lock(), self.registry.get_stream(stream_id));
        let info = info?;

        let timestamp = options.timestamp.unwrap_or_else(epoch_ms);
        // The chain clock never goes backwards.
        let timestamp = match guard.last_ref {
            Some(last) => timestamp.max(last.timestamp),
            None => timestamp,
        };
        let sequence_number = match guard.last_ref {
            Some(last) if last.timestamp == timestamp => last.sequence_number + 1,
            _ => 0,
        };

        let stream_partition = match &options.partition_key {
            Some(key) => crypto::hash_partition(key, info.partitions),
            None => 0,
        };

        let plaintext = serde_json::to_string(payload)?;
        let (content, encryption_type, group_key_id, new_group_key) =
            self.encrypt_content(stream_id, plaintext, info.require_encrypted_data).await?;

        let mut message = StreamMessage {
            id: MessageId {
                stream_id: stream_id.to_owned(),
                stream_partition,
                timestamp,
                sequence_number,
                publisher_id: self.publisher_id.clone(),
                msg_chain_id: guard.msg_chain_id.clone(),
            },
            prev_msg_ref: guard.last_ref,
            message_type: MessageType::StreamMessage,
            content_type: ContentType::Json,
            encryption_type,
            group_key_id,
            content,
            new_group_key,
            signature_type: SignatureType::None,
            signature: None,
        };
        self.sign(&mut message)?;
        let msg_ref = message.msg_ref();

        let session_token = self.session.get_session_token(false).await?;
        let request = ControlMessage::PublishRequest {
            request_id: uuid::Uuid::new_v4().to_string(),
            message,
            session_token,
        };
        self.dispatch(request).await?;
        // Only an accepted request advances the chain head; a rejected one
        // must not leave a hole for subscribers to gap-fill forever.
        guard.last_ref = Some(msg_ref);
        Ok(msg_ref)
    }

    /// Stage a fresh key: the next publish announces it inline and promotes
    /// it to current.
    pub async fn rotate_group_key(&self, stream_id: &str) -> GroupKey {
        let key = GroupKey::generate();
        self.key_store.set_next(stream_id, &self.publisher_id, key.clone()).await;
        key
    }

    /// Replace the current key immediately, without an inline announcement.
    pub async fn rekey(&self, stream_id: &str) -> GroupKey {
        let key = GroupKey::generate();
        self.key_store.set_current(stream_id, &self.publisher_id, key.clone()).await;
        key
    }

    /// Flush the pending queue onto a (re)connected socket, preserving FIFO.
    pub async fn drain_pending(&self) {
        let mut pending = self.pending.lock().await;
        while let Some(request) = pending.pop_front() {
            if let Err(e) = self.connection.send(&request).await {
                tracing::debug!(err = %e, "pending drain interrupted");
                pending.push_front(request);
                return;
            }
        }
    }

    /// Number of requests waiting for a connection.
    pub async fn pending_len(&self) -> usize {
        self.pending.lock().await.len()
    }

    async fn stream_state(&self, stream_id: &str) -> Arc<Mutex<StreamState>> {
        let mut streams = self.streams.lock().await;
        Arc::clone(streams.entry(stream_id.to_owned()).or_insert_with(|| {
            Arc::new(Mutex::new(StreamState {
                last_ref: None,
                msg_chain_id: uuid::Uuid::new_v4().to_string(),
            }))
        }))
    }

    /// Encryption step: rotation handoff first, then the current key, then
    /// a generated key when the stream demands encryption.
    async fn encrypt_content(
        &self,
        stream_id: &str,
        plaintext: String,
        require_encrypted: bool,
    ) -> Result<(String, EncryptionType, Option<String>, Option<EncryptedGroupKey>), ClientError>
    {
        if let Some(next) = self.key_store.next_pending(stream_id, &self.publisher_id).await {
            if let Some(old) = self.key_store.current(stream_id, &self.publisher_id).await {
                // Announce the successor under the old key, then promote.
                let content = crypto::encrypt(old.bytes(), plaintext.as_bytes())?;
                let announced = EncryptedGroupKey {
                    group_key_id: next.id().to_owned(),
                    encrypted: crypto::encrypt(old.bytes(), next.bytes())?,
                };
                self.key_store.promote_next(stream_id, &self.publisher_id).await;
                return Ok((
                    content,
                    EncryptionType::NewKeyAndAes,
                    Some(old.id().to_owned()),
                    Some(announced),
                ));
            }
            // No predecessor to announce under: the staged key simply
            // becomes the first current key.
            self.key_store.promote_next(stream_id, &self.publisher_id).await;
            let content = crypto::encrypt(next.bytes(), plaintext.as_bytes())?;
            return Ok((content, EncryptionType::Aes, Some(next.id().to_owned()), None));
        }

        if let Some(current) = self.key_store.current(stream_id, &self.publisher_id).await {
            let content = crypto::encrypt(current.bytes(), plaintext.as_bytes())?;
            return Ok((content, EncryptionType::Aes, Some(current.id().to_owned()), None));
        }

        if require_encrypted {
            let key = GroupKey::generate();
            self.key_store.set_current(stream_id, &self.publisher_id, key.clone()).await;
            let content = crypto::encrypt(key.bytes(), plaintext.as_bytes())?;
            return Ok((content, EncryptionType::Aes, Some(key.id().to_owned()), None));
        }

        Ok((plaintext, EncryptionType::None, None, None))
    }

    fn sign(&self, message: &mut StreamMessage) -> Result<(), ClientError> {
        let identity = match (self.sign_policy, &self.identity) {
            (SignaturePolicy::Never, _) => return Ok(()),
            (SignaturePolicy::Auto, None) => return Ok(()),
            (SignaturePolicy::Always, None) => {
                return Err(ClientError::Auth(
                    "signing required but no private key is configured".to_owned(),
                ));
            }
            (_, Some(identity)) => identity,
        };
        let payload = message.signature_payload();
        message.signature = Some(identity.sign(payload.as_bytes())?);
        message.signature_type = SignatureType::Eth;
        Ok(())
    }

    /// Send or queue the request depending on connection state.
    async fn dispatch(&self, request: ControlMessage) -> Result<(), ClientError> {
        match self.connection.state() {
            // The connection buffers frames itself while connecting.
            ConnectionState::Connecting => self.connection.send(&request).await,
            ConnectionState::Connected => {
                let mut pending = self.pending.lock().await;
                if pending.is_empty() {
                    drop(pending);
                    return self.connection.send(&request).await;
                }
                // Earlier messages are still queued; keep FIFO.
                if pending.len() >= self.max_queue {
                    return Err(ClientError::QueueFull { limit: self.max_queue });
                }
                pending.push_back(request);
                drop(pending);
                self.drain_pending().await;
                Ok(())
            }
            ConnectionState::Disconnected | ConnectionState::Disconnecting => {
                if !self.auto_connect {
                    return Err(ClientError::NotConnected);
                }
                let mut pending = self.pending.lock().await;
                if pending.len() >= self.max_queue {
                    return Err(ClientError::QueueFull { limit: self.max_queue });
                }
                pending.push_back(request);
                drop(pending);

                let connection = Arc::clone(&self.connection);
                tokio::spawn(async move {
                    if let Err(e) = connection.connect().await {
                        tracing::debug!(err = %e, "auto-connect failed");
                    }
                });
                Ok(())
            }
        }
    }
}

/// Current epoch millis.
pub(crate) fn epoch_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
#[path = "publisher_tests.rs"]
mod tests;
