// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;

const STREAM: &str = "stream-1";
const PUBLISHER: &str = "0xAbC0000000000000000000000000000000000001";

#[tokio::test]
async fn current_and_next_selection() {
    let store = GroupKeyStore::new();
    assert!(store.current(STREAM, PUBLISHER).await.is_none());

    let first = GroupKey::generate();
    store.set_current(STREAM, PUBLISHER, first.clone()).await;
    assert_eq!(store.current(STREAM, PUBLISHER).await, Some(first.clone()));

    let second = GroupKey::generate();
    store.set_next(STREAM, PUBLISHER, second.clone()).await;
    // Staging does not change the current key.
    assert_eq!(store.current(STREAM, PUBLISHER).await, Some(first.clone()));
    assert_eq!(store.next_pending(STREAM, PUBLISHER).await, Some(second.clone()));

    let promoted = store.promote_next(STREAM, PUBLISHER).await;
    assert_eq!(promoted, Some(second.clone()));
    assert_eq!(store.current(STREAM, PUBLISHER).await, Some(second));
    assert!(store.next_pending(STREAM, PUBLISHER).await.is_none());
}

#[tokio::test]
async fn superseded_keys_stay_retrievable() {
    let store = GroupKeyStore::new();
    let old = GroupKey::generate();
    let new = GroupKey::generate();
    store.set_current(STREAM, PUBLISHER, old.clone()).await;
    store.set_next(STREAM, PUBLISHER, new.clone()).await;
    store.promote_next(STREAM, PUBLISHER).await;

    // Historical messages encrypted under the old key still decrypt.
    assert_eq!(store.get(STREAM, PUBLISHER, old.id()).await, Some(old));
}

#[tokio::test]
async fn slots_are_isolated_by_stream_and_publisher() {
    let store = GroupKeyStore::new();
    let key = GroupKey::generate();
    store.set_current(STREAM, PUBLISHER, key).await;

    assert!(store.current("stream-2", PUBLISHER).await.is_none());
    assert!(store.current(STREAM, "0xother").await.is_none());
    assert!(store.has_any(STREAM, PUBLISHER).await);
}

#[tokio::test]
async fn publisher_id_lookup_is_case_insensitive() {
    let store = GroupKeyStore::new();
    let key = GroupKey::generate();
    store.set_current(STREAM, PUBLISHER, key.clone()).await;
    assert_eq!(store.current(STREAM, &PUBLISHER.to_lowercase()).await, Some(key));
}

#[tokio::test]
async fn promote_without_pending_is_none() {
    let store = GroupKeyStore::new();
    assert!(store.promote_next(STREAM, PUBLISHER).await.is_none());
}

#[test]
fn from_bytes_enforces_length() {
    assert!(GroupKey::from_bytes("k", &[0u8; 16]).is_err());
    assert!(GroupKey::from_bytes("k", &[0u8; 32]).is_ok());
}

#[test]
fn debug_redacts_key_bytes() {
    let key = GroupKey::new("gk-1", [0xAA; 32]);
    let rendered = format!("{key:?}");
    assert!(rendered.contains("gk-1"));
    assert!(!rendered.contains("170"));
    assert!(!rendered.to_lowercase().contains("aa, aa"));
}
