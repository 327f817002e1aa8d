//! Failure handling across stage boundaries: what is acknowledged, what is
//! redelivered, and what is published on the way.

use std::time::Duration;

use backup_core::{ProjectDiscovered, TableDueForBackup};
use chrono::Utc;
use integration_tests::fixtures::{
    self, hours_ago, table, BACKUPS_TOPIC, DEAD_LETTER_TOPIC, ORG_ID, PROJECTS_TOPIC,
};
use integration_tests::mocks::FETCH_BATCH;
use integration_tests::setup::{PipelineOptions, TestPipeline};
use redpanda::publish_message;

async fn discover(pipeline: &TestPipeline, project_id: &str) {
    publish_message(
        pipeline.bus.as_ref(),
        PROJECTS_TOPIC,
        &ProjectDiscovered::new(project_id),
    )
    .await
    .unwrap();
}

async fn request_backup(pipeline: &TestPipeline, table_ref: backup_core::TableRef) {
    publish_message(
        pipeline.bus.as_ref(),
        BACKUPS_TOPIC,
        &TableDueForBackup::new(table_ref),
    )
    .await
    .unwrap();
}

#[tokio::test]
async fn test_dataset_listing_unavailable_publishes_nothing_and_does_not_ack() {
    let pipeline = TestPipeline::new();
    pipeline
        .warehouse
        .add_table(&table("p1", "d1", "t1"), hours_ago(Utc::now(), 1));
    pipeline.warehouse.set_project_unavailable("p1", true);
    discover(&pipeline, "p1").await;

    let outcome = pipeline.step_check().await;

    assert_eq!(outcome.acked, 0);
    assert_eq!(outcome.redelivered, 1);
    assert!(pipeline.bus.messages(BACKUPS_TOPIC).is_empty());
    assert_eq!(pipeline.bus.committed(PROJECTS_TOPIC), 0);

    // Redelivery after recovery finishes the project
    pipeline.warehouse.set_project_unavailable("p1", false);
    let outcome = pipeline.step_check().await;

    assert_eq!(outcome.acked, 1);
    assert_eq!(pipeline.bus.keys(BACKUPS_TOPIC), vec!["p1:d1.t1"]);
    assert_eq!(pipeline.bus.committed(PROJECTS_TOPIC), 1);
}

#[tokio::test]
async fn test_export_failure_then_success_acks_once() {
    let pipeline = TestPipeline::new();
    let t1 = table("p1", "d1", "t1");
    pipeline.exporter.fail_next(1);
    request_backup(&pipeline, t1.clone()).await;

    let first = pipeline.step_backup().await;
    assert_eq!(first.redelivered, 1);
    assert!(pipeline.exporter.artifacts().is_empty());
    assert!(pipeline.bus.commits(BACKUPS_TOPIC).is_empty());

    let second = pipeline.step_backup().await;
    assert_eq!(second.acked, 1);

    assert_eq!(pipeline.bus.commits(BACKUPS_TOPIC), vec![1]);
    let artifacts = pipeline.exporter.artifacts();
    assert_eq!(artifacts[&fixtures::expected_uri(&t1)], (t1, 1));

    // Retried from scratch to the same place
    let requests = pipeline.exporter.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0].destination_uri, requests[1].destination_uri);

    // Nothing left to deliver
    assert_eq!(pipeline.step_backup().await.delivered, 0);
}

#[tokio::test]
async fn test_table_listing_failure_keeps_sibling_datasets() {
    let pipeline = TestPipeline::new();
    let now = Utc::now();
    pipeline.warehouse.add_table(&table("p1", "d1", "t1"), hours_ago(now, 1));
    pipeline.warehouse.add_table(&table("p1", "d2", "t2"), hours_ago(now, 1));
    pipeline.warehouse.set_dataset_unavailable("p1", "d1", true);
    discover(&pipeline, "p1").await;

    let outcome = pipeline.step_check().await;

    assert_eq!(outcome.redelivered, 1);
    assert_eq!(pipeline.bus.keys(BACKUPS_TOPIC), vec!["p1:d2.t2"]);
    assert_eq!(pipeline.bus.committed(PROJECTS_TOPIC), 0);

    pipeline.warehouse.set_dataset_unavailable("p1", "d1", false);
    pipeline.step_check().await;

    // d2 is published again on redelivery; duplicates are tolerated downstream
    assert_eq!(
        pipeline.bus.keys(BACKUPS_TOPIC),
        vec!["p1:d2.t2", "p1:d1.t1", "p1:d2.t2"]
    );
    assert_eq!(pipeline.bus.committed(PROJECTS_TOPIC), 1);
}

#[tokio::test]
async fn test_metadata_failure_skips_only_that_table() {
    let pipeline = TestPipeline::new();
    let now = Utc::now();
    let broken = table("p1", "d1", "broken");
    pipeline.warehouse.add_table(&broken, hours_ago(now, 1));
    pipeline.warehouse.add_table(&table("p1", "d1", "fine"), hours_ago(now, 1));
    pipeline.warehouse.set_metadata_missing(&broken);
    discover(&pipeline, "p1").await;

    let outcome = pipeline.step_check().await;

    assert_eq!(outcome.acked, 1);
    assert_eq!(pipeline.bus.keys(BACKUPS_TOPIC), vec!["p1:d1.fine"]);
    assert!(pipeline
        .warehouse
        .calls()
        .contains(&"metadata:p1:d1.broken".to_string()));
}

#[tokio::test]
async fn test_publish_failure_leaves_project_unacked() {
    let pipeline = TestPipeline::new();
    pipeline
        .warehouse
        .add_table(&table("p1", "d1", "t1"), hours_ago(Utc::now(), 1));
    discover(&pipeline, "p1").await;
    pipeline.bus.set_fail_all(true);

    let outcome = pipeline.step_check().await;

    assert_eq!(outcome.redelivered, 1);
    assert_eq!(pipeline.bus.committed(PROJECTS_TOPIC), 0);

    pipeline.bus.set_fail_all(false);
    pipeline.step_check().await;
    assert_eq!(pipeline.bus.keys(BACKUPS_TOPIC), vec!["p1:d1.t1"]);
    assert_eq!(pipeline.bus.committed(PROJECTS_TOPIC), 1);
}

#[tokio::test]
async fn test_poison_messages_do_not_block_the_partition() {
    let pipeline = TestPipeline::new();
    pipeline
        .warehouse
        .add_table(&table("p1", "d1", "t1"), hours_ago(Utc::now(), 1));
    pipeline.bus.inject_raw(PROJECTS_TOPIC, "junk", b"not json");
    pipeline
        .bus
        .inject_raw(PROJECTS_TOPIC, "bad", br#"{"project_id": "bad/id"}"#);
    discover(&pipeline, "p1").await;

    let outcome = pipeline.step_check().await;

    assert_eq!(outcome.delivered, 3);
    assert_eq!(outcome.acked, 3);
    assert_eq!(pipeline.bus.committed(PROJECTS_TOPIC), 3);
    assert_eq!(pipeline.bus.keys(BACKUPS_TOPIC), vec!["p1:d1.t1"]);
}

#[tokio::test]
async fn test_failed_project_does_not_hold_back_later_projects() {
    let pipeline = TestPipeline::new();
    let now = Utc::now();
    pipeline.warehouse.add_table(&table("p1", "d1", "t1"), hours_ago(now, 1));
    pipeline.warehouse.add_table(&table("p2", "d1", "t1"), hours_ago(now, 1));
    pipeline.warehouse.set_project_unavailable("p1", true);
    discover(&pipeline, "p1").await;
    discover(&pipeline, "p2").await;

    let outcome = pipeline.step_check().await;

    assert_eq!(outcome.acked, 1);
    assert_eq!(outcome.redelivered, 1);
    assert_eq!(pipeline.bus.keys(BACKUPS_TOPIC), vec!["p2:d1.t1"]);
    // p1 at offset 0 is still unacknowledged
    assert_eq!(pipeline.bus.committed(PROJECTS_TOPIC), 0);

    pipeline.warehouse.set_project_unavailable("p1", false);
    let outcome = pipeline.step_check().await;

    // Only p1 comes back; p2 is not enumerated a second time
    assert_eq!(outcome.delivered, 1);
    assert_eq!(outcome.acked, 1);
    assert_eq!(pipeline.bus.keys(BACKUPS_TOPIC), vec!["p2:d1.t1", "p1:d1.t1"]);
    assert_eq!(pipeline.bus.committed(PROJECTS_TOPIC), 2);
}

#[tokio::test]
async fn test_broken_table_does_not_stall_the_partition() {
    let pipeline = TestPipeline::new();
    let broken = table("p1", "d1", "broken");
    pipeline.exporter.break_table(&broken);
    request_backup(&pipeline, broken.clone()).await;
    let healthy: Vec<_> = (0..FETCH_BATCH + 50)
        .map(|i| table("p1", "d1", &format!("t{}", i)))
        .collect();
    for t in &healthy {
        request_backup(&pipeline, t.clone()).await;
    }

    for _ in 0..5 {
        pipeline.step_backup().await;
    }

    // Every healthy table exported exactly once, across more than one fetch
    for t in &healthy {
        assert_eq!(pipeline.exporter.export_count(t), 1, "{}", t);
    }
    assert_eq!(pipeline.exporter.export_count(&broken), 0);
    assert_eq!(pipeline.backup_retries(), 1);
    // Nothing committed past the broken table at offset 0
    assert_eq!(pipeline.bus.committed(BACKUPS_TOPIC), 0);

    pipeline.exporter.repair(&broken);
    let outcome = pipeline.step_backup().await;

    assert_eq!(outcome.delivered, 1);
    assert_eq!(outcome.acked, 1);
    assert_eq!(pipeline.exporter.export_count(&broken), 1);
    assert_eq!(
        pipeline.bus.committed(BACKUPS_TOPIC),
        (FETCH_BATCH + 51) as i64
    );
    assert_eq!(pipeline.backup_retries(), 0);
}

#[tokio::test]
async fn test_restarted_stage_resumes_at_stored_commit() {
    let mut pipeline = TestPipeline::new();
    let tables: Vec<_> = (0..4).map(|i| table("p1", "d1", &format!("t{}", i))).collect();
    pipeline.exporter.break_table(&tables[2]);
    for t in &tables {
        request_backup(&pipeline, t.clone()).await;
    }

    pipeline.step_backup().await;
    assert_eq!(pipeline.bus.committed(BACKUPS_TOPIC), 2);

    pipeline.restart_backup();
    pipeline.exporter.repair(&tables[2]);
    let outcome = pipeline.step_backup().await;

    // Offsets 0 and 1 were committed and are not read again; everything from
    // the first unacknowledged offset is
    assert_eq!(outcome.delivered, 2);
    assert_eq!(pipeline.exporter.export_count(&tables[0]), 1);
    assert_eq!(pipeline.exporter.export_count(&tables[1]), 1);
    assert_eq!(pipeline.exporter.export_count(&tables[2]), 1);
    assert_eq!(pipeline.exporter.export_count(&tables[3]), 2);
    assert_eq!(pipeline.bus.committed(BACKUPS_TOPIC), 4);
}

#[tokio::test]
async fn test_export_timeout_cancels_and_redelivers() {
    let pipeline = TestPipeline::with_options(PipelineOptions {
        export_timeout: Duration::from_millis(50),
        ..Default::default()
    });
    pipeline.exporter.set_delay(Duration::from_secs(2));
    request_backup(&pipeline, table("p1", "d1", "t1")).await;

    let outcome = pipeline.step_backup().await;

    assert_eq!(outcome.redelivered, 1);
    assert_eq!(pipeline.exporter.cancelled(), vec!["job-1"]);
    assert!(pipeline.exporter.artifacts().is_empty());
    assert_eq!(pipeline.bus.committed(BACKUPS_TOPIC), 0);
}

#[tokio::test]
async fn test_exhausted_export_goes_to_dead_letter() {
    let pipeline = TestPipeline::with_options(PipelineOptions {
        max_deliveries: Some(2),
        ..Default::default()
    });
    pipeline.exporter.fail_next(10);
    request_backup(&pipeline, table("p1", "d1", "t1")).await;

    let first = pipeline.step_backup().await;
    assert_eq!(first.redelivered, 1);
    assert!(pipeline.bus.messages(DEAD_LETTER_TOPIC).is_empty());

    let second = pipeline.step_backup().await;
    assert_eq!(second.acked, 1);
    assert_eq!(pipeline.bus.committed(BACKUPS_TOPIC), 1);

    let dead = pipeline.bus.messages(DEAD_LETTER_TOPIC);
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].key, "p1:d1.t1");
    assert_eq!(dead[0].headers["dlq-source-topic"], BACKUPS_TOPIC.as_bytes());
    assert_eq!(dead[0].headers["dlq-attempts"], b"2");

    let original: TableDueForBackup = serde_json::from_slice(&dead[0].payload).unwrap();
    assert_eq!(original.table_ref, table("p1", "d1", "t1"));
}

#[tokio::test]
async fn test_scan_aborts_on_listing_error() {
    let pipeline = TestPipeline::new();
    pipeline.directory.add_project("p1", ORG_ID);
    pipeline.directory.add_project("p2", ORG_ID);
    pipeline.directory.fail_after(1);

    let result = pipeline.scan().await;

    assert!(matches!(
        result,
        Err(ref e) if e.error_code() == Some("SVC_001")
    ));
    assert_eq!(pipeline.bus.keys(PROJECTS_TOPIC), vec!["p1"]);
}

#[tokio::test]
async fn test_scan_reports_unpublished_projects() {
    let pipeline = TestPipeline::new();
    pipeline.directory.add_project("p1", ORG_ID);
    pipeline.directory.add_project("p2", ORG_ID);
    pipeline.bus.reject_key("p2");

    let report = pipeline.scan().await.unwrap();

    assert_eq!(report.projects_found, 2);
    assert_eq!(report.published, 1);
    assert_eq!(report.failed, vec!["p2"]);
    assert!(!report.is_complete());
}
