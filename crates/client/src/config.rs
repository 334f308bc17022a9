// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::time::Duration;

use serde::Deserialize;

/// How the client authenticates against the network.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Auth {
    /// Hex secp256k1 private key; enables signing and challenge/response login.
    PrivateKey(String),
    /// Legacy API key exchanged for a session token.
    ApiKey(String),
    /// Anonymous; only public streams are reachable.
    #[default]
    None,
}

impl Auth {
    /// Whether this auth method can produce message signatures.
    pub fn can_sign(&self) -> bool {
        matches!(self, Self::PrivateKey(_))
    }
}

/// Signing/verification policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignaturePolicy {
    /// Sign iff credentials can produce a signature; verify iff present.
    #[default]
    Auto,
    Always,
    Never,
}

/// Client configuration.
///
/// All intervals are stored in milliseconds; `Duration` accessors are
/// provided for the call sites that want them.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    /// WebSocket URL of the edge node, without version query parameters.
    pub url: String,

    /// Base URL of the REST collaborator.
    pub rest_url: String,

    /// Connect automatically on the first publish/subscribe/resend.
    pub auto_connect: bool,

    /// Disconnect after the last subscription ends and the publish queue
    /// is quiescent.
    pub auto_disconnect: bool,

    /// Delay before an auto-disconnect fires, in milliseconds.
    pub auto_disconnect_delay_ms: u64,

    /// Run incoming messages through the per-chain ordering buffers.
    pub order_messages: bool,

    /// Authentication method.
    pub auth: Auth,

    /// When to sign outgoing messages.
    pub publish_with_signature: SignaturePolicy,

    /// When to verify incoming signatures.
    pub verify_signatures: SignaturePolicy,

    /// How long to wait for the first resend response before retrying, ms.
    pub retry_resend_after_ms: u64,

    /// Gap-fill timer interval, ms.
    pub gap_fill_timeout_ms: u64,

    /// Bound on messages queued while disconnected.
    pub max_publish_queue_size: usize,

    /// How long a chain waits for a missing message before requesting a
    /// gap fill, ms.
    pub propagation_timeout_ms: u64,

    /// Bound on how long a resend may stay silent before it is failed, ms.
    pub resend_timeout_ms: u64,

    /// Gap-fill attempt budget per gap.
    pub max_gap_requests: u32,

    /// Initial reconnect backoff, ms. Doubles per failed attempt.
    pub reconnect_backoff_ms: u64,

    /// Reconnect backoff cap, ms.
    pub reconnect_backoff_max_ms: u64,

    /// Timeout applied to REST collaborator calls, ms.
    pub rest_timeout_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            url: "wss://node.brook.network/api/v1/ws".to_owned(),
            rest_url: "https://node.brook.network/api/v1".to_owned(),
            auto_connect: true,
            auto_disconnect: true,
            auto_disconnect_delay_ms: 5000,
            order_messages: true,
            auth: Auth::None,
            publish_with_signature: SignaturePolicy::Auto,
            verify_signatures: SignaturePolicy::Auto,
            retry_resend_after_ms: 5000,
            gap_fill_timeout_ms: 5000,
            max_publish_queue_size: 10_000,
            propagation_timeout_ms: 5000,
            resend_timeout_ms: 5000,
            max_gap_requests: 10,
            reconnect_backoff_ms: 2000,
            reconnect_backoff_max_ms: 30_000,
            rest_timeout_ms: 10_000,
        }
    }
}

impl Config {
    /// The full WebSocket URL including protocol version parameters.
    pub fn ws_url(&self) -> String {
        let sep = if self.url.contains('?') { '&' } else { '?' };
        format!(
            "{}{sep}controlLayerVersion={}&messageLayerVersion={}&brookClient={}",
            self.url,
            crate::protocol::CONTROL_LAYER_VERSION,
            crate::protocol::MESSAGE_LAYER_VERSION,
            env!("CARGO_PKG_VERSION"),
        )
    }

    pub fn auto_disconnect_delay(&self) -> Duration {
        Duration::from_millis(self.auto_disconnect_delay_ms)
    }

    pub fn retry_resend_after(&self) -> Duration {
        Duration::from_millis(self.retry_resend_after_ms)
    }

    pub fn gap_fill_timeout(&self) -> Duration {
        Duration::from_millis(self.gap_fill_timeout_ms)
    }

    pub fn propagation_timeout(&self) -> Duration {
        Duration::from_millis(self.propagation_timeout_ms)
    }

    pub fn resend_timeout(&self) -> Duration {
        Duration::from_millis(self.resend_timeout_ms)
    }

    pub fn reconnect_backoff(&self) -> Duration {
        Duration::from_millis(self.reconnect_backoff_ms)
    }

    pub fn reconnect_backoff_max(&self) -> Duration {
        Duration::from_millis(self.reconnect_backoff_max_ms)
    }

    pub fn rest_timeout(&self) -> Duration {
        Duration::from_millis(self.rest_timeout_ms)
    }
}
