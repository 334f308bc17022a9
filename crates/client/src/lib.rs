// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Brook: a client for a publish/subscribe streaming network.
//!
//! The client speaks a versioned WebSocket control protocol to an edge
//! node. Publishers frame payloads into totally-ordered per-publisher
//! message chains, optionally signed and end-to-end encrypted with
//! rotating group keys; subscribers receive a merged stream of historical
//! and realtime messages with duplicate suppression, gap detection and
//! bounded gap-fill, signature verification, and decryption.

pub mod client;
pub mod config;
pub mod connection;
pub mod crypto;
pub mod error;
pub mod keystore;
pub mod ordering;
pub mod protocol;
pub mod publisher;
pub mod rest;
pub mod session;
pub mod subscriber;
pub mod subscription;

pub use client::{Client, ClientEvent};
pub use config::{Auth, Config, SignaturePolicy};
pub use connection::{ConnectionEvent, ConnectionState};
pub use error::ClientError;
pub use keystore::GroupKey;
pub use protocol::message::{MessageRef, StreamMessage};
pub use publisher::PublishOptions;
pub use subscription::{ResendOptions, Subscription, SubscriptionEvent, SubscriptionKind};
