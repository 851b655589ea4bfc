// SPDX-FileCopyrightText: © 2025 WebMCast Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! End-to-end scenarios across registry, channel and subscriber queue,
//! without any HTTP glue involved.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use webmcast_engine::ebml::{ids, vint, DEFAULT_MAX_ELEMENT_SIZE};
use webmcast_engine::queue::DEFAULT_MAX_ENQUEUED_FRAMES;
use webmcast_engine::{ClaimOutcome, Registry, RegistryConfig, SubscriberQueue};

fn leaf(id: u64, body: &[u8]) -> Vec<u8> {
    let mut out = vint::encode_id(id);
    out.extend(vint::encode_size(body.len() as u64));
    out.extend_from_slice(body);
    out
}

fn init_segment() -> Vec<u8> {
    let mut segment = vint::encode_id(ids::ID_SEGMENT);
    segment.extend(vint::unknown_size());
    segment.extend(leaf(ids::ID_INFO, b"info"));
    segment.extend(leaf(ids::ID_TRACKS, b"tracks"));

    let mut stream = leaf(ids::ID_EBML_HEADER, b"ebml");
    stream.extend(segment);
    stream
}

fn cluster(timecode: u8, keyframe: bool) -> Vec<u8> {
    let flags = if keyframe { 0x80 } else { 0x00 };
    let mut cluster = vint::encode_id(ids::ID_CLUSTER);
    cluster.extend(vint::unknown_size());
    cluster.extend(leaf(ids::ID_TIMECODE, &[timecode]));
    cluster.extend(leaf(ids::ID_SIMPLE_BLOCK, &[0x81, 0x00, 0x00, flags]));
    cluster
}

fn registry() -> Arc<Registry> {
    Registry::new(RegistryConfig {
        max_downtime: Duration::from_millis(50),
        max_enqueued_frames: DEFAULT_MAX_ENQUEUED_FRAMES,
        max_element_size: DEFAULT_MAX_ELEMENT_SIZE,
    })
}

#[tokio::test]
async fn subscriber_joining_before_publish_waits_for_the_first_keyframe() {
    let registry = registry();
    let ClaimOutcome::Created(channel) = registry.claim("pre-join").unwrap() else {
        panic!("expected Created")
    };

    let queue = Arc::new(SubscriberQueue::new(DEFAULT_MAX_ENQUEUED_FRAMES));
    channel.connect(queue.clone()).await.unwrap();

    let mut publish_bytes = init_segment();
    publish_bytes.extend(cluster(0, false));
    publish_bytes.extend(cluster(1, true));
    channel.publish(Bytes::from(publish_bytes)).await.unwrap();

    // Header arrives immediately on connect, even before the publisher sent anything.
    assert!(!queue.recv().await.unwrap().is_empty());
    // The non-keyframe Cluster never reaches the subscriber.
    let first_cluster = queue.recv().await.unwrap();
    assert!(first_cluster.windows(2).any(|w| w == [0xE7, 0x81])); // retimed to zero: that's cluster(1, true)
}

#[tokio::test]
async fn late_joiner_skips_straight_to_the_next_keyframe() {
    let registry = registry();
    let ClaimOutcome::Created(channel) = registry.claim("late-join").unwrap() else {
        panic!("expected Created")
    };

    let mut publish_bytes = init_segment();
    publish_bytes.extend(cluster(0, true));
    channel.publish(Bytes::from(publish_bytes)).await.unwrap();

    let queue = Arc::new(SubscriberQueue::new(DEFAULT_MAX_ENQUEUED_FRAMES));
    channel.connect(queue.clone()).await.unwrap();
    let _header = queue.recv().await.unwrap();

    channel.publish(Bytes::from(cluster(5, false))).await.unwrap();
    channel.publish(Bytes::from(cluster(10, true))).await.unwrap();

    let first_delivered = queue.recv().await.unwrap();
    // Should be the timecode=10 keyframe, retimed to zero, not timecode=5.
    assert!(first_delivered.windows(2).any(|w| w == [0xE7, 0x81]));
}

#[tokio::test]
async fn name_taken_while_live_rejects_a_second_publisher() {
    let registry = registry();
    let ClaimOutcome::Created(_channel) = registry.claim("taken").unwrap() else {
        panic!("expected Created")
    };
    assert!(registry.claim("taken").is_err());
}

#[tokio::test]
async fn reclaiming_during_grace_period_preserves_subscribers() {
    let registry = registry();
    let ClaimOutcome::Created(channel) = registry.claim("reconnect").unwrap() else {
        panic!("expected Created")
    };

    // The first publisher freezes the header and sends one keyframe, then
    // hangs up; `publisher_ended` flushes its still-open trailing Cluster
    // before any subscriber exists to receive it.
    let mut first_publish = init_segment();
    first_publish.extend(cluster(0, true));
    channel.publish(Bytes::from(first_publish)).await.unwrap();
    channel.publisher_ended();

    let queue = Arc::new(SubscriberQueue::new(DEFAULT_MAX_ENQUEUED_FRAMES));
    channel.connect(queue.clone()).await.unwrap();
    // The header blob was already frozen, so it's delivered immediately.
    assert!(!queue.recv().await.unwrap().is_empty());

    registry.release("reconnect".to_string(), channel);

    let ClaimOutcome::Reclaimed(new_publisher) = registry.claim("reconnect").unwrap() else {
        panic!("expected Reclaimed")
    };
    new_publisher.reclaim().await.unwrap();

    // The reclaiming publisher re-sends its own EBML Header/Segment/Tracks,
    // which must be discarded rather than replacing the frozen header. A
    // second Cluster closes the first within this one feed, so the
    // pre-existing subscriber sees it without the publisher disconnecting.
    let mut resumed_publish = init_segment();
    resumed_publish.extend(cluster(0, true));
    resumed_publish.extend(cluster(1, true));
    new_publisher.publish(Bytes::from(resumed_publish)).await.unwrap();

    let delivered = queue.recv().await.unwrap();
    assert!(delivered.windows(2).any(|w| w == [0xE7, 0x81])); // retimed Timecode element
}

#[tokio::test]
async fn name_frees_up_after_the_grace_period_expires() {
    let registry = registry();
    let ClaimOutcome::Created(channel) = registry.claim("expiring").unwrap() else {
        panic!("expected Created")
    };
    registry.release("expiring".to_string(), channel);

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(matches!(registry.claim("expiring"), Ok(ClaimOutcome::Created(_))));
}

#[tokio::test]
async fn malformed_publisher_input_surfaces_as_an_error() {
    let registry = registry();
    let ClaimOutcome::Created(channel) = registry.claim("bad-input").unwrap() else {
        panic!("expected Created")
    };
    // A leading 0x00 byte can never start a valid VINT.
    let result = channel.publish(Bytes::from_static(b"\x00not even close to ebml")).await;
    assert!(result.is_err());
}

#[tokio::test]
async fn a_slow_subscriber_drops_mid_gop_clusters_but_recovers_on_the_next_keyframe() {
    let registry = registry();
    let ClaimOutcome::Created(channel) = registry.claim("slow-subscriber").unwrap() else {
        panic!("expected Created")
    };

    let mut publish_bytes = init_segment();
    publish_bytes.extend(cluster(0, true));
    channel.publish(Bytes::from(publish_bytes)).await.unwrap();

    let queue = Arc::new(SubscriberQueue::new(3));
    channel.connect(queue.clone()).await.unwrap(); // queue: [header]

    // First keyframe after attach starts the stream.
    channel.publish(Bytes::from(cluster(1, true))).await.unwrap(); // queue: [header, c1]

    // Without draining, a non-keyframe still fits...
    channel.publish(Bytes::from(cluster(2, false))).await.unwrap(); // queue: [header, c1, c2] (full)
    // ...but the next one doesn't, and gets dropped rather than queued.
    channel.publish(Bytes::from(cluster(3, false))).await.unwrap(); // dropped, queue unchanged

    // A post-drop non-keyframe is skipped outright: the slot is back to
    // waiting for a keyframe before it resumes.
    channel.publish(Bytes::from(cluster(4, false))).await.unwrap();

    // The next keyframe always gets through, evicting the oldest entry.
    channel.publish(Bytes::from(cluster(5, true))).await.unwrap(); // queue: [c1, c2, c5]

    let mut chunks = Vec::new();
    while let Ok(Some(chunk)) = tokio::time::timeout(Duration::from_millis(20), queue.recv()).await
    {
        chunks.push(chunk);
    }
    assert_eq!(chunks.len(), 3);
    let last = chunks.last().unwrap();
    assert!(last.windows(2).any(|w| w == [0xE7, 0x81])); // c5 retimed to zero
}
