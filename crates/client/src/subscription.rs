// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! A single subscription: message pipeline, decryption parking, and the
//! iterable handle returned to the application.
//!
//! Pipeline per message: signature verification → group-key parking /
//! decryption → per-chain ordering → delivery. A combined (resend +
//! realtime) subscription buffers realtime arrivals until the resend
//! terminates, then replays them through the same chains; chain duplicate
//! suppression performs the boundary dedup.

use std::collections::{HashMap, HashSet, VecDeque};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use futures_util::StreamExt;
use indexmap::IndexMap;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;

use crate::config::{Config, SignaturePolicy};
use crate::connection::Connection;
use crate::crypto;
use crate::error::ClientError;
use crate::keystore::{GroupKey, GroupKeyStore};
use crate::ordering::{ChainEvent, OrderedMsgChain};
use crate::protocol::control::ControlMessage;
use crate::protocol::message::{EncryptionType, MessageRef, StreamMessage};
use crate::session::Session;

/// What historical data a subscription asks for.
#[derive(Debug, Clone)]
pub enum ResendOptions {
    /// The last `count` stored messages.
    Last { count: u64 },
    /// Everything from `from` onwards, optionally for one publisher.
    From { from: MessageRef, publisher_id: Option<String> },
    /// A closed range, optionally narrowed to one chain.
    Range {
        from: MessageRef,
        to: MessageRef,
        publisher_id: Option<String>,
        msg_chain_id: Option<String>,
    },
}

/// The three subscription shapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionKind {
    /// Realtime broadcasts only.
    Realtime,
    /// Historical replay only; the stream ends when the resend does.
    Historical,
    /// Historical replay seamlessly followed by realtime.
    Combined,
}

/// Events emitted on a subscription's event channel.
#[derive(Debug, Clone)]
pub enum SubscriptionEvent {
    Subscribed,
    Unsubscribed,
    Resending,
    /// Resend finished; for a combined subscription realtime follows.
    Resent,
    /// The resend produced no messages.
    NoResend,
    /// An encrypted message arrived with no usable key. The application
    /// should obtain keys and call `set_group_keys`.
    GroupKeyMissing { publisher_id: String, start: u64, end: u64 },
    /// A per-message or per-chain failure (invalid signature, decryption
    /// failure, exhausted gap fill).
    Error(ClientError),
}

/// Delivery phase of the subscription.
enum Phase {
    /// Waiting for the resend to finish; realtime arrivals are buffered.
    Resending { realtime_buffer: Vec<StreamMessage> },
    Realtime,
    Done,
}

pub(crate) enum SubCommand {
    Unsubscribe(Arc<SubscriptionInner>),
}

/// Shared state of one subscription.
pub(crate) struct SubscriptionInner {
    pub(crate) id: String,
    pub(crate) stream_id: String,
    pub(crate) partition: u32,
    pub(crate) kind: SubscriptionKind,
    pub(crate) resend: Option<ResendOptions>,
    /// Set once the resend request has gone out (it is sent at most once
    /// per subscribe response).
    pub(crate) resend_requested: AtomicBool,
    resend_terminated: AtomicBool,
    /// Any resend traffic (Resending or a unicast) has been observed;
    /// keeps the silent-resend watchdog from retrying a live replay.
    resend_seen: AtomicBool,

    connection: Arc<Connection>,
    session: Arc<Session>,
    key_store: Arc<GroupKeyStore>,
    verify_policy: SignaturePolicy,
    order_messages: bool,
    propagation_timeout: std::time::Duration,
    gap_fill_timeout: std::time::Duration,
    max_gap_requests: u32,

    /// Serialises the message pipeline against key-arrival drains.
    pipeline: Mutex<()>,
    phase: Mutex<Phase>,
    chains: Mutex<HashMap<(String, String), OrderedMsgChain>>,
    chain_tx: mpsc::UnboundedSender<ChainEvent>,
    /// Encrypted messages parked per publisher until keys arrive.
    parked: Mutex<IndexMap<String, VecDeque<StreamMessage>>>,
    waiting_for_keys: Mutex<HashSet<String>>,

    out: Mutex<Option<mpsc::UnboundedSender<StreamMessage>>>,
    events: broadcast::Sender<SubscriptionEvent>,
    closed: AtomicBool,
    pub(crate) cancel: CancellationToken,
    command_tx: mpsc::UnboundedSender<SubCommand>,
}

impl SubscriptionInner {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        config: &Config,
        stream_id: String,
        partition: u32,
        kind: SubscriptionKind,
        resend: Option<ResendOptions>,
        connection: Arc<Connection>,
        session: Arc<Session>,
        key_store: Arc<GroupKeyStore>,
        command_tx: mpsc::UnboundedSender<SubCommand>,
        parent_cancel: &CancellationToken,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<StreamMessage>) {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (chain_tx, chain_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(64);
        let phase = match kind {
            SubscriptionKind::Realtime => Phase::Realtime,
            _ => Phase::Resending { realtime_buffer: Vec::new() },
        };
        let inner = Arc::new(Self {
            id: uuid::Uuid::new_v4().to_string(),
            stream_id,
            partition,
            kind,
            resend,
            resend_requested: AtomicBool::new(false),
            resend_terminated: AtomicBool::new(false),
            resend_seen: AtomicBool::new(false),
            connection,
            session,
            key_store,
            verify_policy: config.verify_signatures,
            order_messages: config.order_messages,
            propagation_timeout: config.propagation_timeout(),
            gap_fill_timeout: config.gap_fill_timeout(),
            max_gap_requests: config.max_gap_requests,
            pipeline: Mutex::new(()),
            phase: Mutex::new(phase),
            chains: Mutex::new(HashMap::new()),
            chain_tx,
            parked: Mutex::new(IndexMap::new()),
            waiting_for_keys: Mutex::new(HashSet::new()),
            out: Mutex::new(Some(out_tx)),
            events,
            closed: AtomicBool::new(false),
            cancel: parent_cancel.child_token(),
            command_tx,
        });
        tokio::spawn(run_chain_pump(Arc::clone(&inner), chain_rx));
        (inner, out_rx)
    }

    pub(crate) fn emit(&self, event: SubscriptionEvent) {
        let _ = self.events.send(event);
    }

    /// Whether a requested resend has not yet terminated (used to re-issue
    /// the request after a reconnect).
    pub(crate) fn resend_pending(&self) -> bool {
        self.resend.is_some() && !self.resend_terminated.load(Ordering::SeqCst)
    }

    pub(crate) fn note_resend_activity(&self) {
        self.resend_seen.store(true, Ordering::SeqCst);
    }

    /// Allow the resend request to be issued again (fresh connection).
    pub(crate) fn reset_resend_request(&self) {
        self.resend_requested.store(false, Ordering::SeqCst);
        self.resend_seen.store(false, Ordering::SeqCst);
    }

    pub(crate) fn resend_seen(&self) -> bool {
        self.resend_seen.load(Ordering::SeqCst)
    }

    pub(crate) fn subscribe_events(&self) -> broadcast::Receiver<SubscriptionEvent> {
        self.events.subscribe()
    }

    /// A realtime broadcast for this stream partition.
    pub(crate) async fn handle_realtime(&self, msg: StreamMessage) {
        match self.kind {
            // A pure historical subscription ignores the live stream.
            SubscriptionKind::Historical => {}
            SubscriptionKind::Realtime => self.process(msg).await,
            SubscriptionKind::Combined => {
                let passthrough = {
                    let mut phase = self.phase.lock().await;
                    match &mut *phase {
                        Phase::Resending { realtime_buffer } => {
                            realtime_buffer.push(msg);
                            None
                        }
                        _ => Some(msg),
                    }
                };
                if let Some(msg) = passthrough {
                    self.process(msg).await;
                }
            }
        }
    }

    /// A unicast resend result (or gap fill) addressed to this subscription.
    pub(crate) async fn handle_unicast(&self, msg: StreamMessage) {
        self.process(msg).await;
    }

    /// The resend terminated (`Resent` or `NoResend`).
    pub(crate) async fn resend_done(&self, empty: bool) {
        self.resend_terminated.store(true, Ordering::SeqCst);
        self.emit(if empty { SubscriptionEvent::NoResend } else { SubscriptionEvent::Resent });
        match self.kind {
            SubscriptionKind::Historical => self.maybe_finish_historical().await,
            SubscriptionKind::Combined => {
                let buffered = {
                    let mut phase = self.phase.lock().await;
                    match std::mem::replace(&mut *phase, Phase::Realtime) {
                        Phase::Resending { realtime_buffer } => realtime_buffer,
                        other => {
                            *phase = other;
                            Vec::new()
                        }
                    }
                };
                // Replay buffered realtime through the same chains; refs at
                // or below the resend tail are suppressed there.
                for msg in buffered {
                    self.process(msg).await;
                }
            }
            SubscriptionKind::Realtime => {}
        }
    }

    /// Keys became available for `publisher_id`: drain its parked queue in
    /// arrival order through the normal pipeline.
    pub(crate) async fn drain_parked(&self, publisher_id: &str) {
        let guard = self.pipeline.lock().await;
        let queued = {
            let mut parked = self.parked.lock().await;
            self.waiting_for_keys.lock().await.remove(&publisher_id.to_lowercase());
            parked.shift_remove(&publisher_id.to_lowercase()).unwrap_or_default()
        };
        for msg in queued {
            self.process_locked(msg).await;
        }
        drop(guard);
        self.maybe_finish_historical().await;
    }

    /// Tear down the subscription: cancel gap timers, end the iterator,
    /// emit `Unsubscribed`.
    pub(crate) async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cancel.cancel();
        self.chains.lock().await.clear();
        self.out.lock().await.take();
        self.emit(SubscriptionEvent::Unsubscribed);
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    // -- pipeline --------------------------------------------------------------

    async fn process(&self, msg: StreamMessage) {
        let _guard = self.pipeline.lock().await;
        self.process_locked(msg).await;
    }

    async fn process_locked(&self, msg: StreamMessage) {
        if let Err(e) = self.verify(&msg) {
            tracing::warn!(publisher = %msg.id.publisher_id, err = %e, "message rejected");
            self.emit(SubscriptionEvent::Error(e));
            return;
        }
        let publisher_key = msg.id.publisher_id.to_lowercase();
        if self.waiting_for_keys.lock().await.contains(&publisher_key) {
            self.parked.lock().await.entry(publisher_key).or_default().push_back(msg);
            return;
        }
        if msg.encryption_type.is_encrypted() {
            match self.decrypt(msg).await {
                DecryptOutcome::Ready(msg) => self.forward(msg).await,
                DecryptOutcome::MissingKey(msg) => {
                    let start = msg.id.timestamp;
                    let publisher_id = msg.id.publisher_id.clone();
                    self.waiting_for_keys.lock().await.insert(publisher_key.clone());
                    self.parked.lock().await.entry(publisher_key).or_default().push_back(msg);
                    self.emit(SubscriptionEvent::GroupKeyMissing {
                        publisher_id,
                        start,
                        end: crate::publisher::epoch_ms(),
                    });
                }
                DecryptOutcome::Failed(e) => {
                    tracing::warn!(err = %e, "dropping undecryptable message");
                    self.emit(SubscriptionEvent::Error(e));
                }
            }
        } else {
            self.forward(msg).await;
        }
    }

    fn verify(&self, msg: &StreamMessage) -> Result<(), ClientError> {
        match (self.verify_policy, &msg.signature) {
            (SignaturePolicy::Never, _) => Ok(()),
            (SignaturePolicy::Always, None) => {
                Err(ClientError::InvalidSignature { publisher_id: msg.id.publisher_id.clone() })
            }
            (SignaturePolicy::Auto, None) => Ok(()),
            (_, Some(signature)) => {
                let recovered =
                    crypto::recover_address(signature, msg.signature_payload().as_bytes())?;
                if recovered.eq_ignore_ascii_case(&msg.id.publisher_id) {
                    Ok(())
                } else {
                    Err(ClientError::InvalidSignature {
                        publisher_id: msg.id.publisher_id.clone(),
                    })
                }
            }
        }
    }

    async fn decrypt(&self, mut msg: StreamMessage) -> DecryptOutcome {
        let Some(key_id) = msg.group_key_id.clone() else {
            return DecryptOutcome::Failed(ClientError::Decryption(
                "encrypted message without a group key id".to_owned(),
            ));
        };
        let Some(key) =
            self.key_store.get(&self.stream_id, &msg.id.publisher_id, &key_id).await
        else {
            return DecryptOutcome::MissingKey(msg);
        };
        let plaintext = match crypto::decrypt(key.bytes(), &msg.content) {
            Ok(p) => p,
            Err(e) => return DecryptOutcome::Failed(e),
        };
        // A rotation frame carries its successor under the same key.
        if msg.encryption_type == EncryptionType::NewKeyAndAes {
            if let Some(announced) = msg.new_group_key.take() {
                match crypto::decrypt(key.bytes(), &announced.encrypted)
                    .and_then(|bytes| GroupKey::from_bytes(announced.group_key_id, &bytes))
                {
                    Ok(new_key) => {
                        self.key_store
                            .set_current(&self.stream_id, &msg.id.publisher_id, new_key)
                            .await;
                    }
                    Err(e) => {
                        tracing::warn!(err = %e, "ignoring malformed key announcement");
                    }
                }
            }
        }
        match String::from_utf8(plaintext) {
            Ok(content) => {
                msg.content = content;
                msg.encryption_type = EncryptionType::None;
                msg.group_key_id = None;
                DecryptOutcome::Ready(msg)
            }
            Err(_) => {
                DecryptOutcome::Failed(ClientError::Decryption("plaintext is not UTF-8".to_owned()))
            }
        }
    }

    async fn forward(&self, msg: StreamMessage) {
        if !self.order_messages {
            self.deliver(msg).await;
            return;
        }
        // Chains write straight into the delivery channel, so everything a
        // `handle` call makes deliverable is enqueued before it returns.
        let Some(delivery) = self.out.lock().await.clone() else { return };
        let key = (msg.id.publisher_id.to_lowercase(), msg.id.msg_chain_id.clone());
        let mut chains = self.chains.lock().await;
        let chain = chains.entry(key).or_insert_with(|| {
            OrderedMsgChain::new(
                msg.id.publisher_id.clone(),
                msg.id.msg_chain_id.clone(),
                self.propagation_timeout,
                self.gap_fill_timeout,
                self.max_gap_requests,
                delivery,
                self.chain_tx.clone(),
                &self.cancel,
            )
        });
        chain.handle(msg).await;
    }

    async fn deliver(&self, msg: StreamMessage) {
        if let Some(out) = self.out.lock().await.as_ref() {
            let _ = out.send(msg);
        }
    }

    /// A historical subscription completes once the resend has terminated
    /// and no parked messages remain. Dropping the chains releases their
    /// delivery-channel clones so the iterator ends after the tail drains.
    async fn maybe_finish_historical(&self) {
        if self.kind != SubscriptionKind::Historical
            || !self.resend_terminated.load(Ordering::SeqCst)
        {
            return;
        }
        let drained = self.parked.lock().await.values().all(VecDeque::is_empty);
        if drained {
            *self.phase.lock().await = Phase::Done;
            self.chains.lock().await.clear();
            self.out.lock().await.take();
        }
    }

    async fn send_gap_request(&self, publisher_id: String, msg_chain_id: String, from: MessageRef, to: MessageRef) {
        let session_token = match self.session.get_session_token(false).await {
            Ok(token) => token,
            Err(e) => {
                tracing::warn!(err = %e, "gap fill blocked on session token");
                None
            }
        };
        let request = ControlMessage::ResendRangeRequest {
            request_id: uuid::Uuid::new_v4().to_string(),
            stream_id: self.stream_id.clone(),
            stream_partition: self.partition,
            sub_id: self.id.clone(),
            from,
            to,
            publisher_id: Some(publisher_id),
            msg_chain_id: Some(msg_chain_id),
            session_token,
        };
        if let Err(e) = self.connection.send(&request).await {
            tracing::debug!(err = %e, "gap fill request not sent");
        }
    }
}

enum DecryptOutcome {
    Ready(StreamMessage),
    MissingKey(StreamMessage),
    Failed(ClientError),
}

/// Consumes chain output: delivers ordered messages, issues gap-fill
/// requests, and fails the subscription when a chain dies.
async fn run_chain_pump(
    inner: Arc<SubscriptionInner>,
    mut rx: mpsc::UnboundedReceiver<ChainEvent>,
) {
    loop {
        let event = tokio::select! {
            _ = inner.cancel.cancelled() => return,
            event = rx.recv() => match event {
                Some(event) => event,
                None => return,
            },
        };
        match event {
            ChainEvent::GapFill { publisher_id, msg_chain_id, from, to } => {
                inner.send_gap_request(publisher_id, msg_chain_id, from, to).await;
            }
            ChainEvent::GapFailed { publisher_id, msg_chain_id, from, to } => {
                inner.emit(SubscriptionEvent::Error(ClientError::GapFill {
                    publisher_id,
                    msg_chain_id,
                    from,
                    to,
                }));
                // Fatal for the subscription's delivery stream.
                inner.chains.lock().await.clear();
                inner.out.lock().await.take();
            }
        }
    }
}

// -- public handle -------------------------------------------------------------

/// Borrowed handle to a live subscription.
///
/// Iterate it as a `Stream` of in-order messages. Dropping the handle (or
/// calling [`Subscription::cancel`]) unsubscribes; when it was the stream's
/// last handle the server-side subscription is torn down too.
pub struct Subscription {
    inner: Arc<SubscriptionInner>,
    rx: UnboundedReceiverStream<StreamMessage>,
}

impl Subscription {
    pub(crate) fn new(
        inner: Arc<SubscriptionInner>,
        rx: mpsc::UnboundedReceiver<StreamMessage>,
    ) -> Self {
        Self { inner, rx: UnboundedReceiverStream::new(rx) }
    }

    /// Client-generated id tying resend traffic to this subscription.
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn stream_id(&self) -> &str {
        &self.inner.stream_id
    }

    pub fn partition(&self) -> u32 {
        self.inner.partition
    }

    pub fn kind(&self) -> SubscriptionKind {
        self.inner.kind
    }

    /// Subscribe to lifecycle and error events.
    pub fn events(&self) -> broadcast::Receiver<SubscriptionEvent> {
        self.inner.subscribe_events()
    }

    /// Receive the next in-order message, or `None` when the subscription
    /// has ended.
    pub async fn next_message(&mut self) -> Option<StreamMessage> {
        self.rx.next().await
    }

    /// Unsubscribe. Equivalent to dropping the handle, but explicit.
    pub fn cancel(&self) {
        self.request_unsubscribe();
    }

    fn request_unsubscribe(&self) {
        if !self.inner.is_closed() {
            let _ = self
                .inner
                .command_tx
                .send(SubCommand::Unsubscribe(Arc::clone(&self.inner)));
        }
    }
}

impl futures_util::Stream for Subscription {
    type Item = StreamMessage;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.rx).poll_next(cx)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.request_unsubscribe();
    }
}

#[cfg(test)]
#[path = "subscription_tests.rs"]
mod tests;
