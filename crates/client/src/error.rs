// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::fmt;

use crate::protocol::message::MessageRef;

/// Errors surfaced by client operations.
///
/// Transport and per-message failures are recovered locally and emitted as
/// events; variants here are returned from the operation that caused them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    /// Transport-level failure. Recoverable via reconnect.
    Connection(String),
    /// A send was attempted while the socket was not connected and no
    /// queueing was permitted.
    NotConnected,
    /// An inbound frame failed to parse.
    InvalidJson { reason: String },
    /// A message carried a signature that did not verify against its
    /// publisher address.
    InvalidSignature { publisher_id: String },
    /// Decryption failed with a known group key.
    Decryption(String),
    /// An ordering chain exhausted its gap-fill budget.
    GapFill {
        publisher_id: String,
        msg_chain_id: String,
        from: MessageRef,
        to: MessageRef,
    },
    /// The publish queue bound was exceeded.
    QueueFull { limit: usize },
    /// Session acquisition failed after the forced-refresh retry.
    Auth(String),
    /// The peer sent a well-formed frame that violates the control protocol.
    Protocol(String),
    /// A REST collaborator call failed.
    Rest { status: u16, message: String },
}

impl ClientError {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connection(_) => "CONNECTION_ERROR",
            Self::NotConnected => "NOT_CONNECTED",
            Self::InvalidJson { .. } => "INVALID_JSON",
            Self::InvalidSignature { .. } => "INVALID_SIGNATURE",
            Self::Decryption(_) => "DECRYPTION_ERROR",
            Self::GapFill { .. } => "GAP_FILL_ERROR",
            Self::QueueFull { .. } => "QUEUE_FULL",
            Self::Auth(_) => "AUTH_ERROR",
            Self::Protocol(_) => "PROTOCOL_ERROR",
            Self::Rest { .. } => "REST_ERROR",
        }
    }
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connection(msg) => write!(f, "connection error: {msg}"),
            Self::NotConnected => f.write_str("not connected"),
            Self::InvalidJson { reason } => write!(f, "invalid json frame: {reason}"),
            Self::InvalidSignature { publisher_id } => {
                write!(f, "invalid signature from publisher {publisher_id}")
            }
            Self::Decryption(msg) => write!(f, "decryption failed: {msg}"),
            Self::GapFill { publisher_id, msg_chain_id, from, to } => write!(
                f,
                "gap fill exhausted for chain ({publisher_id}, {msg_chain_id}): missing {from}..{to}"
            ),
            Self::QueueFull { limit } => write!(f, "publish queue full (limit {limit})"),
            Self::Auth(msg) => write!(f, "auth error: {msg}"),
            Self::Protocol(msg) => write!(f, "protocol error: {msg}"),
            Self::Rest { status, message } => write!(f, "rest error ({status}): {message}"),
        }
    }
}

impl std::error::Error for ClientError {}

impl From<serde_json::Error> for ClientError {
    fn from(e: serde_json::Error) -> Self {
        Self::InvalidJson { reason: e.to_string() }
    }
}
