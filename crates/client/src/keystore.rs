// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Group keys and the per-(stream, publisher) key store.
//!
//! Keys are never mutated: rotation inserts a successor and repoints the
//! `current`/`next` selection. Superseded keys stay retrievable by id so
//! historical messages remain decryptable.

use std::collections::HashMap;

use tokio::sync::Mutex;

use crate::error::ClientError;

/// A 32-byte symmetric group key with its wire identifier.
#[derive(Clone, PartialEq, Eq)]
pub struct GroupKey {
    id: String,
    key: [u8; 32],
}

impl GroupKey {
    pub fn new(id: impl Into<String>, key: [u8; 32]) -> Self {
        Self { id: id.into(), key }
    }

    /// Build from raw bytes, enforcing the 32-byte length.
    pub fn from_bytes(id: impl Into<String>, bytes: &[u8]) -> Result<Self, ClientError> {
        let key: [u8; 32] = bytes
            .try_into()
            .map_err(|_| ClientError::Decryption(format!("group key is {} bytes, expected 32", bytes.len())))?;
        Ok(Self { id: id.into(), key })
    }

    /// Generate a fresh random key with a UUID identifier.
    pub fn generate() -> Self {
        use rand::RngCore;
        let mut key = [0u8; 32];
        rand::rng().fill_bytes(&mut key);
        Self { id: uuid::Uuid::new_v4().to_string(), key }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn bytes(&self) -> &[u8; 32] {
        &self.key
    }
}

impl std::fmt::Debug for GroupKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Key bytes stay out of logs.
        f.debug_struct("GroupKey").field("id", &self.id).finish_non_exhaustive()
    }
}

#[derive(Default)]
struct KeySlot {
    by_id: HashMap<String, GroupKey>,
    current: Option<String>,
    next: Option<String>,
}

/// Shared store of group keys, keyed by `(stream_id, publisher_id)`.
///
/// Shared between the publisher (its own slot) and the subscriber (one slot
/// per remote publisher). Access is serialised through one async mutex.
#[derive(Default)]
pub struct GroupKeyStore {
    slots: Mutex<HashMap<(String, String), KeySlot>>,
}

impl GroupKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a key without changing the current/next selection.
    pub async fn add(&self, stream_id: &str, publisher_id: &str, key: GroupKey) {
        let mut slots = self.slots.lock().await;
        let slot = slots.entry(slot_key(stream_id, publisher_id)).or_default();
        slot.by_id.insert(key.id.clone(), key);
    }

    /// Look up a key by id.
    pub async fn get(&self, stream_id: &str, publisher_id: &str, key_id: &str) -> Option<GroupKey> {
        let slots = self.slots.lock().await;
        slots.get(&slot_key(stream_id, publisher_id))?.by_id.get(key_id).cloned()
    }

    /// The key new publishes encrypt with.
    pub async fn current(&self, stream_id: &str, publisher_id: &str) -> Option<GroupKey> {
        let slots = self.slots.lock().await;
        let slot = slots.get(&slot_key(stream_id, publisher_id))?;
        slot.by_id.get(slot.current.as_deref()?).cloned()
    }

    /// Install `key` as current, retaining any predecessor by id.
    pub async fn set_current(&self, stream_id: &str, publisher_id: &str, key: GroupKey) {
        let mut slots = self.slots.lock().await;
        let slot = slots.entry(slot_key(stream_id, publisher_id)).or_default();
        slot.current = Some(key.id.clone());
        slot.by_id.insert(key.id.clone(), key);
    }

    /// Stage `key` for the rotation handoff on the next publish.
    pub async fn set_next(&self, stream_id: &str, publisher_id: &str, key: GroupKey) {
        let mut slots = self.slots.lock().await;
        let slot = slots.entry(slot_key(stream_id, publisher_id)).or_default();
        slot.next = Some(key.id.clone());
        slot.by_id.insert(key.id.clone(), key);
    }

    /// The staged successor, if a rotation is pending.
    pub async fn next_pending(&self, stream_id: &str, publisher_id: &str) -> Option<GroupKey> {
        let slots = self.slots.lock().await;
        let slot = slots.get(&slot_key(stream_id, publisher_id))?;
        slot.by_id.get(slot.next.as_deref()?).cloned()
    }

    /// Complete a rotation: the staged key becomes current.
    ///
    /// Returns the new current key, or `None` when no rotation was pending.
    pub async fn promote_next(&self, stream_id: &str, publisher_id: &str) -> Option<GroupKey> {
        let mut slots = self.slots.lock().await;
        let slot = slots.get_mut(&slot_key(stream_id, publisher_id))?;
        let next_id = slot.next.take()?;
        slot.current = Some(next_id.clone());
        slot.by_id.get(&next_id).cloned()
    }

    /// Whether any key is known for this (stream, publisher).
    pub async fn has_any(&self, stream_id: &str, publisher_id: &str) -> bool {
        let slots = self.slots.lock().await;
        slots.get(&slot_key(stream_id, publisher_id)).is_some_and(|s| !s.by_id.is_empty())
    }
}

fn slot_key(stream_id: &str, publisher_id: &str) -> (String, String) {
    (stream_id.to_owned(), publisher_id.to_lowercase())
}

#[cfg(test)]
#[path = "keystore_tests.rs"]
mod tests;
