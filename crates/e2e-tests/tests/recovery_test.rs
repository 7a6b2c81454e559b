//! Crash recovery: pending entries of dead replicas are reclaimed and
//! reprocessed without visible duplicates.

use std::time::Duration;

use pretty_assertions::assert_eq;
use tokio_util::sync::CancellationToken;

use docsync_log::DurableLog;
use docsync_pipeline::StageWorker;
use docsync_types::{point_id, EmbeddedMessage, RawMessage};
use e2e_tests::TestPipeline;

const PAST_MIN_IDLE: Duration = Duration::from_secs(61);

/// Enrichment replica reads and dies before acknowledging; a survivor
/// claims the entry after the idle threshold and forwards it.
#[tokio::test(start_paused = true)]
async fn test_enrichment_reclaims_dead_replica_entries() {
    let pipeline = TestPipeline::start().await;
    pipeline.insert("A", "S", "C").await;
    pipeline.insert("B", "S", "D").await;

    let stolen = pipeline
        .log
        .read_group(
            &pipeline.settings.streams.raw_stream,
            &pipeline.settings.groups.enrichment,
            "embedder_dead",
            10,
            Duration::ZERO,
        )
        .await
        .unwrap();
    assert_eq!(stolen.len(), 2);

    let survivor = pipeline.enrichment_replica();
    let cancel = CancellationToken::new();

    // Too early: the dead replica might still be working.
    assert_eq!(survivor.recover(&cancel).await.unwrap().read, 0);

    tokio::time::advance(PAST_MIN_IDLE).await;
    let report = survivor.recover(&cancel).await.unwrap();
    assert_eq!(report.read, 2);
    assert_eq!(report.completed, 2);
    assert_eq!(survivor.stats().reclaimed, 2);
    assert_eq!(pipeline.raw_pending().await, 0);

    pipeline.drain().await;
    assert!(pipeline.store.contains(point_id("A")));
    assert!(pipeline.store.contains(point_id("B")));
}

/// Crash between the Stage-2 append and the Stage-1 ack: recovery
/// forwards the entry a second time and the index still holds one point.
#[tokio::test(start_paused = true)]
async fn test_crash_after_forward_before_ack_is_harmless() {
    let pipeline = TestPipeline::start().await;
    let stage1_id = pipeline.insert("A", "S", "C").await;

    let entries = pipeline
        .log
        .read_group(
            &pipeline.settings.streams.raw_stream,
            &pipeline.settings.groups.enrichment,
            "embedder_dead",
            1,
            Duration::ZERO,
        )
        .await
        .unwrap();
    // The dead replica got as far as forwarding.
    let event = RawMessage::from_fields(&entries[0].fields)
        .unwrap()
        .into_event();
    let forwarded = EmbeddedMessage::embedded(
        &event,
        pipeline.embedder.vector_for("S C"),
        Some(stage1_id.to_string()),
    );
    pipeline
        .log
        .append(
            &pipeline.settings.streams.embedded_stream,
            forwarded.to_fields().unwrap(),
            pipeline.settings.streams.embedded_capacity,
        )
        .await
        .unwrap();

    tokio::time::advance(PAST_MIN_IDLE).await;
    pipeline
        .enrichment
        .recover(&CancellationToken::new())
        .await
        .unwrap();
    pipeline.drain().await;

    let embedded = pipeline.embedded_messages().await;
    assert_eq!(embedded.len(), 2);
    assert!(embedded.iter().all(|m| m.doc_id() == "A"));
    assert_eq!(pipeline.store.len(), 1);
    assert_eq!(pipeline.raw_pending().await, 0);
    assert_eq!(pipeline.embedded_pending().await, 0);
}

/// Index replica dies holding a tombstone; the survivor applies it.
#[tokio::test(start_paused = true)]
async fn test_indexer_reclaims_dead_replica_entries() {
    let pipeline = TestPipeline::start().await;
    pipeline.insert("A", "S", "C").await;
    pipeline.drain().await;

    pipeline.delete("A").await;
    pipeline.step_enrichment().await;
    pipeline
        .log
        .read_group(
            &pipeline.settings.streams.embedded_stream,
            &pipeline.settings.groups.indexing,
            "upserter_dead",
            10,
            Duration::ZERO,
        )
        .await
        .unwrap();
    assert_eq!(pipeline.step_indexer().await.read, 0);
    assert!(pipeline.store.contains(point_id("A")));

    tokio::time::advance(PAST_MIN_IDLE).await;
    let report = pipeline
        .indexer_replica()
        .recover(&CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.completed, 1);
    assert!(!pipeline.store.contains(point_id("A")));
    assert_eq!(pipeline.embedded_pending().await, 0);
}

/// Entries trimmed away while pending cannot be reclaimed.
#[tokio::test(start_paused = true)]
async fn test_trimmed_pending_entries_are_dropped() {
    let mut settings = e2e_tests::test_settings();
    settings.streams.raw_capacity = 2;
    let pipeline = TestPipeline::start_with(settings).await;

    pipeline.insert("old", "S", "C").await;
    pipeline
        .log
        .read_group(
            &pipeline.settings.streams.raw_stream,
            &pipeline.settings.groups.enrichment,
            "embedder_dead",
            1,
            Duration::ZERO,
        )
        .await
        .unwrap();
    pipeline.insert("B", "S", "C").await;
    pipeline.insert("C", "S", "C").await;

    tokio::time::advance(PAST_MIN_IDLE).await;
    let report = pipeline
        .enrichment
        .recover(&CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.read, 0);
    assert_eq!(pipeline.raw_pending().await, 0);
}
