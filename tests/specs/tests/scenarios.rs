// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! End-to-end scenarios against the in-process mock node.

use std::time::Duration;

use brook::protocol::control::ControlMessage;
use brook::protocol::message::{
    ContentType, EncryptionType, MessageId, MessageRef, MessageType, SignatureType, StreamMessage,
};
use brook::{
    Client, Config, ConnectionState, PublishOptions, ResendOptions, SubscriptionEvent,
};
use brook_specs::{next_message, wait_for_event, wait_for_reconnect, MockNode};
use serde_json::json;

const STREAM: &str = "stream-1";

fn at(timestamp: u64) -> PublishOptions {
    PublishOptions { timestamp: Some(timestamp), ..PublishOptions::default() }
}

async fn subscribed_handle(
    client: &Client,
    stream: &str,
    resend: Option<ResendOptions>,
) -> anyhow::Result<brook::Subscription> {
    let sub = client.subscribe(stream, 0, resend).await?;
    let mut events = sub.events();
    wait_for_event(&mut events, |e| matches!(e, SubscriptionEvent::Subscribed)).await?;
    Ok(sub)
}

// ── S1/S2: publish ordering ───────────────────────────────────────────

#[tokio::test]
async fn s1_publish_chain_refs_follow_call_order() -> anyhow::Result<()> {
    let node = MockNode::start().await?;
    let client = Client::new(node.client_config())?;
    client.connect().await?;

    for ts in [1000, 1000, 1001, 1001] {
        client.publish_with(STREAM, &json!({"ts": ts}), at(ts)).await?;
    }
    // Publishes are sent in order on a single socket; wait for storage.
    let stored = node.wait_for_stored(STREAM, 0, 4).await?;
    let refs: Vec<(u64, u32)> =
        stored.iter().map(|m| (m.id.timestamp, m.id.sequence_number)).collect();
    let prevs: Vec<Option<(u64, u32)>> = stored
        .iter()
        .map(|m| m.prev_msg_ref.map(|r| (r.timestamp, r.sequence_number)))
        .collect();
    assert_eq!(refs, [(1000, 0), (1000, 1), (1001, 0), (1001, 1)]);
    assert_eq!(prevs, [None, Some((1000, 0)), Some((1000, 1)), Some((1001, 0))]);
    Ok(())
}

#[tokio::test]
async fn s2_delayed_stream_lookup_preserves_call_order() -> anyhow::Result<()> {
    let node = MockNode::start().await?;
    let client = Client::new(node.client_config())?;
    client.connect().await?;

    // The first lookup (triggered by the first publish) is held back.
    node.delay_next_lookup(100);
    let first_content = json!({"n": 1});
    let second_content = json!({"n": 2});
    let first = client.publish_with(STREAM, &first_content, at(1000));
    let second = client.publish_with(STREAM, &second_content, at(1000));
    let (first, second) = tokio::join!(first, second);
    assert_eq!(first?, MessageRef::new(1000, 0));
    assert_eq!(second?, MessageRef::new(1000, 1));

    let stored = node.wait_for_stored(STREAM, 0, 2).await?;
    assert_eq!(stored[0].parse_content()?["n"], 1);
    assert_eq!(stored[1].parse_content()?["n"], 2);
    Ok(())
}

// ── S3: gap fill ──────────────────────────────────────────────────────

fn raw_msg(ts: u64, prev: Option<(u64, u32)>) -> StreamMessage {
    StreamMessage {
        id: MessageId {
            stream_id: STREAM.to_owned(),
            stream_partition: 0,
            timestamp: ts,
            sequence_number: 0,
            publisher_id: "0xremote".to_owned(),
            msg_chain_id: "chain-r".to_owned(),
        },
        prev_msg_ref: prev.map(|(t, s)| MessageRef::new(t, s)),
        message_type: MessageType::StreamMessage,
        content_type: ContentType::Json,
        encryption_type: EncryptionType::None,
        group_key_id: None,
        content: json!({"ts": ts}).to_string(),
        new_group_key: None,
        signature_type: SignatureType::None,
        signature: None,
    }
}

#[tokio::test]
async fn s3_gap_triggers_a_range_request_for_the_missing_span() -> anyhow::Result<()> {
    let node = MockNode::start().await?;
    let config = Config { propagation_timeout_ms: 50, ..node.client_config() };
    let client = Client::new(config)?;
    client.connect().await?;
    let mut sub = subscribed_handle(&client, STREAM, None).await?;

    node.push_broadcast(raw_msg(1, None)).await;
    node.push_broadcast(raw_msg(2, Some((1, 0)))).await;
    node.push_broadcast(raw_msg(5, Some((4, 0)))).await;

    assert_eq!(next_message(&mut sub).await?.id.timestamp, 1);
    assert_eq!(next_message(&mut sub).await?.id.timestamp, 2);

    // The chain asks storage for exactly the missing span.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let trace = node.trace().await;
        let gap = trace.iter().find_map(|m| match m {
            ControlMessage::ResendRangeRequest { from, to, publisher_id, msg_chain_id, .. } => {
                Some((*from, *to, publisher_id.clone(), msg_chain_id.clone()))
            }
            _ => None,
        });
        if let Some((from, to, publisher_id, msg_chain_id)) = gap {
            assert_eq!(from, MessageRef::new(2, 1));
            assert_eq!(to, MessageRef::new(4, 0));
            assert_eq!(publisher_id.as_deref(), Some("0xremote"));
            assert_eq!(msg_chain_id.as_deref(), Some("chain-r"));
            break;
        }
        anyhow::ensure!(tokio::time::Instant::now() < deadline, "no gap request observed");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    Ok(())
}

// ── S4/S5: resend and the resend + realtime union ─────────────────────

#[tokio::test]
async fn s4_resend_last_replays_in_publish_order() -> anyhow::Result<()> {
    let node = MockNode::start().await?;
    let publisher = Client::new(node.client_config())?;
    publisher.connect().await?;
    for n in 0..10u64 {
        publisher.publish_with(STREAM, &json!({"n": n}), at(1000 + n)).await?;
    }
    node.wait_for_stored(STREAM, 0, 10).await?;

    let consumer = Client::new(node.client_config())?;
    consumer.connect().await?;
    let mut sub = consumer.subscribe(STREAM, 0, Some(ResendOptions::Last { count: 10 })).await?;
    let mut events = sub.events();

    for n in 0..10u64 {
        assert_eq!(next_message(&mut sub).await?.parse_content()?["n"], n);
    }
    wait_for_event(&mut events, |e| matches!(e, SubscriptionEvent::Resent)).await?;
    Ok(())
}

#[tokio::test]
async fn s5_resend_then_realtime_delivers_all_without_duplicates() -> anyhow::Result<()> {
    let node = MockNode::start().await?;
    let publisher = Client::new(node.client_config())?;
    publisher.connect().await?;
    for n in 0..10u64 {
        publisher.publish_with(STREAM, &json!({"n": n}), at(1000 + n)).await?;
    }
    node.wait_for_stored(STREAM, 0, 10).await?;

    let consumer = Client::new(node.client_config())?;
    consumer.connect().await?;
    let mut sub = consumer.subscribe(STREAM, 0, Some(ResendOptions::Last { count: 10 })).await?;
    let mut events = sub.events();
    wait_for_event(&mut events, |e| matches!(e, SubscriptionEvent::Resent)).await?;

    for n in 10..20u64 {
        publisher.publish_with(STREAM, &json!({"n": n}), at(1000 + n)).await?;
    }

    let mut seen = Vec::new();
    for _ in 0..20 {
        seen.push(next_message(&mut sub).await?.parse_content()?["n"].as_u64());
    }
    let expected: Vec<Option<u64>> = (0..20).map(Some).collect();
    assert_eq!(seen, expected);
    Ok(())
}

// ── S6: encryption handoff ────────────────────────────────────────────

#[tokio::test]
async fn s6_subscriber_parks_until_keys_arrive_then_drains_in_order() -> anyhow::Result<()> {
    let node = MockNode::start().await?;
    let publisher = Client::new(node.client_config())?;
    publisher.connect().await?;

    // Messages 0..=4 under the first key, rotation announced at index 5,
    // 6..=9 under the successor.
    let old_key = publisher.rekey(STREAM).await;
    for n in 0..5u64 {
        publisher.publish_with(STREAM, &json!({"n": n}), at(1000 + n)).await?;
    }
    publisher.rotate_group_key(STREAM).await;
    for n in 5..10u64 {
        publisher.publish_with(STREAM, &json!({"n": n}), at(1000 + n)).await?;
    }
    node.wait_for_stored(STREAM, 0, 10).await?;

    let consumer = Client::new(node.client_config())?;
    consumer.connect().await?;
    let mut sub = consumer.resend(STREAM, 0, ResendOptions::Last { count: 10 }).await?;
    let mut events = sub.events();

    // No keys: the whole replay parks behind the first undecryptable
    // message and exactly one key-missing event fires.
    let event = wait_for_event(&mut events, |e| {
        matches!(e, SubscriptionEvent::GroupKeyMissing { .. })
    })
    .await?;
    let publisher_id = match event {
        SubscriptionEvent::GroupKeyMissing { publisher_id, start, .. } => {
            assert_eq!(start, 1000);
            publisher_id
        }
        other => anyhow::bail!("expected key-missing event, got {other:?}"),
    };
    assert_eq!(publisher_id, publisher.publisher_id());

    // Supplying the first key is enough: the rotation frame carries the
    // successor inline.
    consumer.set_group_keys(STREAM, &publisher_id, vec![old_key]).await;

    for n in 0..10u64 {
        assert_eq!(next_message(&mut sub).await?.parse_content()?["n"], n);
    }
    // Historical handle: the stream ends once the drain completes.
    let end = tokio::time::timeout(Duration::from_secs(5), sub.next_message()).await?;
    assert!(end.is_none());
    Ok(())
}

// ── reconnect resumption ──────────────────────────────────────────────

#[tokio::test]
async fn reconnect_resubscribes_and_storage_covers_the_outage() -> anyhow::Result<()> {
    let node = MockNode::start().await?;
    let publisher = Client::new(node.client_config())?;
    publisher.connect().await?;
    let consumer = Client::new(node.client_config())?;
    consumer.connect().await?;

    let mut sub = subscribed_handle(&consumer, STREAM, None).await?;
    publisher.publish_with(STREAM, &json!({"n": 0}), at(1000)).await?;
    assert_eq!(next_message(&mut sub).await?.parse_content()?["n"], 0);

    // Network drop. Both clients reconnect on their own.
    let mut publisher_events = publisher.events();
    let mut consumer_events = consumer.events();
    node.kill_connections().await;
    wait_for_reconnect(&mut publisher_events).await?;
    wait_for_reconnect(&mut consumer_events).await?;
    // The fresh SubscribeRequest must be handled by the node before the
    // next publish fans out.
    node.wait_for_requests("SubscribeRequest", 2).await?;

    // Published after the drop: lands in storage and reaches the live,
    // resubscribed consumer.
    publisher.publish_with(STREAM, &json!({"n": 1}), at(1001)).await?;
    assert_eq!(next_message(&mut sub).await?.parse_content()?["n"], 1);

    // A fresh resend also covers the whole history.
    let mut replay = consumer.resend(STREAM, 0, ResendOptions::Last { count: 2 }).await?;
    assert_eq!(next_message(&mut replay).await?.parse_content()?["n"], 0);
    assert_eq!(next_message(&mut replay).await?.parse_content()?["n"], 1);
    Ok(())
}

#[tokio::test]
async fn unsubscribe_before_connected_yields_one_sub_and_one_unsub() -> anyhow::Result<()> {
    let node = MockNode::start().await?;
    let client = Client::new(node.client_config())?;

    // Subscribe while disconnected (auto-connect kicks in) and cancel
    // immediately, before the connection is up.
    let sub = client.subscribe(STREAM, 0, None).await?;
    sub.cancel();
    drop(sub);

    client.wait_for_state(ConnectionState::Connected).await?;
    tokio::time::sleep(Duration::from_millis(200)).await;

    // Force a reconnect; the dead stream must not be resubscribed.
    let mut client_events = client.events();
    node.kill_connections().await;
    wait_for_reconnect(&mut client_events).await?;
    tokio::time::sleep(Duration::from_millis(200)).await;

    let names = node.trace_names().await;
    let subs = names.iter().filter(|n| **n == "SubscribeRequest").count();
    let unsubs = names.iter().filter(|n| **n == "UnsubscribeRequest").count();
    assert_eq!(subs, 1, "wire trace: {names:?}");
    assert_eq!(unsubs, 1, "wire trace: {names:?}");
    Ok(())
}
