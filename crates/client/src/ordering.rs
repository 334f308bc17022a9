// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Per-chain ordering buffer: in-order delivery, duplicate suppression,
//! and bounded gap-fill scheduling.
//!
//! One instance exists per `(subscription, publisherId, msgChainId)`. A
//! message is deliverable when its `prevMsgRef` is at or below the last
//! delivered ref (or when nothing has been delivered yet); anything ahead
//! of the chain is buffered in ref order. A buffered message implies a gap,
//! which arms a timer that emits `GapFill` requests up to the configured
//! budget, then fails the chain with a single `GapFailed`.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::protocol::message::{MessageRef, StreamMessage};

/// Gap-control output of a chain, consumed by the owning subscription.
/// In-order messages are written synchronously to the delivery channel
/// instead, so a caller returning from [`OrderedMsgChain::handle`] knows
/// every deliverable message has been handed off.
#[derive(Debug, Clone)]
pub enum ChainEvent {
    /// A gap-fill request covering `from..=to` for this chain.
    GapFill {
        publisher_id: String,
        msg_chain_id: String,
        from: MessageRef,
        to: MessageRef,
    },
    /// The gap-fill budget is exhausted; the chain is dead.
    GapFailed {
        publisher_id: String,
        msg_chain_id: String,
        from: MessageRef,
        to: MessageRef,
    },
}

struct ChainInner {
    last_delivered: Option<MessageRef>,
    buffer: BTreeMap<MessageRef, StreamMessage>,
    /// Stop token of the armed gap timer, if any.
    gap_token: Option<CancellationToken>,
    /// `last_delivered` at the moment the timer was armed; progress since
    /// then re-arms with a fresh attempt budget.
    gap_baseline: Option<MessageRef>,
    failed: bool,
}

/// Ordering buffer for one `(publisherId, msgChainId)` chain.
pub struct OrderedMsgChain {
    publisher_id: String,
    msg_chain_id: String,
    inner: Arc<Mutex<ChainInner>>,
    delivery: mpsc::UnboundedSender<StreamMessage>,
    control: mpsc::UnboundedSender<ChainEvent>,
    /// Wait before the first gap request.
    propagation_timeout: Duration,
    /// Interval between gap request retries.
    gap_fill_timeout: Duration,
    max_gap_requests: u32,
    cancel: CancellationToken,
}

impl OrderedMsgChain {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        publisher_id: impl Into<String>,
        msg_chain_id: impl Into<String>,
        propagation_timeout: Duration,
        gap_fill_timeout: Duration,
        max_gap_requests: u32,
        delivery: mpsc::UnboundedSender<StreamMessage>,
        control: mpsc::UnboundedSender<ChainEvent>,
        parent_cancel: &CancellationToken,
    ) -> Self {
        Self {
            publisher_id: publisher_id.into(),
            msg_chain_id: msg_chain_id.into(),
            inner: Arc::new(Mutex::new(ChainInner {
                last_delivered: None,
                buffer: BTreeMap::new(),
                gap_token: None,
                gap_baseline: None,
                failed: false,
            })),
            delivery,
            control,
            propagation_timeout,
            gap_fill_timeout,
            max_gap_requests,
            cancel: parent_cancel.child_token(),
        }
    }

    /// Feed one arriving message through the chain. Every message that
    /// became deliverable is on the delivery channel when this returns.
    pub async fn handle(&self, msg: StreamMessage) {
        let mut inner = self.inner.lock().await;
        if inner.failed {
            return;
        }
        let msg_ref = msg.msg_ref();
        if inner.last_delivered.is_some_and(|last| msg_ref <= last) {
            tracing::debug!(msg_ref = %msg_ref, "duplicate dropped");
            return;
        }
        if in_order(&inner, &msg) {
            deliver(&mut inner, &self.delivery, msg);
            drain(&mut inner, &self.delivery);
        } else {
            inner.buffer.insert(msg_ref, msg);
        }
        self.reconcile_timer(&mut inner);
    }

    /// Last delivered ref, if anything has been delivered.
    pub async fn last_delivered(&self) -> Option<MessageRef> {
        self.inner.lock().await.last_delivered
    }

    /// Cancel the gap timer. Called on unsubscribe.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Arm, re-arm, or disarm the gap timer to match the buffer state.
    fn reconcile_timer(&self, inner: &mut ChainInner) {
        if inner.buffer.is_empty() {
            if let Some(token) = inner.gap_token.take() {
                token.cancel();
            }
            return;
        }
        // Partial progress shrinks the gap; restart with a fresh budget.
        if inner.gap_token.is_some() && inner.gap_baseline != inner.last_delivered {
            if let Some(token) = inner.gap_token.take() {
                token.cancel();
            }
        }
        if inner.gap_token.is_none() {
            let token = self.cancel.child_token();
            inner.gap_token = Some(token.clone());
            inner.gap_baseline = inner.last_delivered;
            tokio::spawn(run_gap_timer(
                Arc::clone(&self.inner),
                self.control.clone(),
                token,
                self.propagation_timeout,
                self.gap_fill_timeout,
                self.max_gap_requests,
                self.publisher_id.clone(),
                self.msg_chain_id.clone(),
            ));
        }
    }
}

impl Drop for OrderedMsgChain {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// A message is in order when nothing has been delivered yet, when it claims
/// to start the chain, or when its predecessor is already behind us.
fn in_order(inner: &ChainInner, msg: &StreamMessage) -> bool {
    match (inner.last_delivered, msg.prev_msg_ref) {
        (None, _) | (_, None) => true,
        (Some(last), Some(prev)) => prev <= last,
    }
}

fn deliver(inner: &mut ChainInner, out: &mpsc::UnboundedSender<StreamMessage>, msg: StreamMessage) {
    inner.last_delivered = Some(msg.msg_ref());
    let _ = out.send(msg);
}

/// Flush every buffered message that became deliverable.
fn drain(inner: &mut ChainInner, out: &mpsc::UnboundedSender<StreamMessage>) {
    while let Some((&first_ref, _)) = inner.buffer.first_key_value() {
        let last = inner.last_delivered;
        if last.is_some_and(|l| first_ref <= l) {
            inner.buffer.remove(&first_ref);
            continue;
        }
        let deliverable = inner
            .buffer
            .get(&first_ref)
            .is_some_and(|m| match (last, m.prev_msg_ref) {
                (None, _) | (_, None) => true,
                (Some(l), Some(prev)) => prev <= l,
            });
        if !deliverable {
            break;
        }
        if let Some(msg) = inner.buffer.remove(&first_ref) {
            deliver(inner, out, msg);
        }
    }
}

/// The currently detected gap, if any: from one past the last delivered ref
/// up to the predecessor of the earliest buffered message.
fn gap_range(inner: &ChainInner) -> Option<(MessageRef, MessageRef)> {
    let (_, first) = inner.buffer.first_key_value()?;
    let from = inner.last_delivered?.next();
    let to = first.prev_msg_ref?;
    Some((from, to))
}

/// Gap timer task: one `GapFill` per expiry up to the budget, then a final
/// grace period, then a single `GapFailed` if the gap persists. The first
/// wait uses the propagation timeout; retries use the gap-fill interval.
#[allow(clippy::too_many_arguments)]
async fn run_gap_timer(
    inner: Arc<Mutex<ChainInner>>,
    out: mpsc::UnboundedSender<ChainEvent>,
    token: CancellationToken,
    propagation_timeout: Duration,
    gap_fill_timeout: Duration,
    max_gap_requests: u32,
    publisher_id: String,
    msg_chain_id: String,
) {
    for attempt in 1..=max_gap_requests {
        let wait = if attempt == 1 { propagation_timeout } else { gap_fill_timeout };
        tokio::select! {
            _ = token.cancelled() => return,
            _ = tokio::time::sleep(wait) => {}
        }
        let range = {
            let guard = inner.lock().await;
            gap_range(&guard)
        };
        let Some((from, to)) = range else { return };
        tracing::debug!(
            publisher = %publisher_id,
            chain = %msg_chain_id,
            %from,
            %to,
            attempt,
            "requesting gap fill"
        );
        let _ = out.send(ChainEvent::GapFill {
            publisher_id: publisher_id.clone(),
            msg_chain_id: msg_chain_id.clone(),
            from,
            to,
        });
    }

    // One more interval for the final request to be answered.
    tokio::select! {
        _ = token.cancelled() => return,
        _ = tokio::time::sleep(gap_fill_timeout) => {}
    }
    let mut guard = inner.lock().await;
    if let Some((from, to)) = gap_range(&guard) {
        tracing::warn!(
            publisher = %publisher_id,
            chain = %msg_chain_id,
            %from,
            %to,
            "gap fill budget exhausted"
        );
        guard.failed = true;
        guard.buffer.clear();
        guard.gap_token = None;
        let _ = out.send(ChainEvent::GapFailed { publisher_id, msg_chain_id, from, to });
    }
}

#[cfg(test)]
#[path = "ordering_tests.rs"]
mod tests;
