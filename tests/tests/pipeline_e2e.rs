//! End-to-end runs of scanner → checker → executor over the in-memory bus.

use backup_core::{BusMessage, ProjectDiscovered, TableDueForBackup};
use chrono::{Duration, Utc};
use integration_tests::fixtures::{self, hours_ago, table, BACKUPS_TOPIC, ORG_ID, PROJECTS_TOPIC};
use integration_tests::setup::TestPipeline;
use redpanda::publish_message;

#[tokio::test]
async fn test_only_recently_modified_table_is_backed_up() {
    let pipeline = TestPipeline::new();
    let now = Utc::now();
    let t1 = table("p1", "d1", "t1");
    let t2 = table("p1", "d1", "t2");
    pipeline.directory.add_project("p1", ORG_ID);
    pipeline.warehouse.add_table(&t1, hours_ago(now, 1));
    pipeline.warehouse.add_table(&t2, hours_ago(now, 48));

    pipeline.run_once().await.unwrap();

    let due: Vec<TableDueForBackup> = pipeline.bus.decoded(BACKUPS_TOPIC);
    assert_eq!(due.len(), 1);
    assert_eq!(due[0].table_ref, t1);

    let artifacts = pipeline.exporter.artifacts();
    assert_eq!(artifacts.len(), 1);
    assert_eq!(artifacts[&fixtures::expected_uri(&t1)], (t1, 1));

    // Both hops acknowledged
    assert_eq!(pipeline.bus.pending(PROJECTS_TOPIC), 0);
    assert_eq!(pipeline.bus.pending(BACKUPS_TOPIC), 0);
}

#[tokio::test]
async fn test_each_scan_publishes_one_event_per_project() {
    let pipeline = TestPipeline::new();
    for project in ["p1", "p2", "p3"] {
        pipeline.directory.add_project(project, ORG_ID);
    }
    // Listed twice by the directory, still one event
    pipeline.directory.add_project("p2", ORG_ID);
    pipeline.directory.add_project("other", "org-2");

    let report = pipeline.scan().await.unwrap();

    assert_eq!(report.projects_found, 3);
    assert_eq!(report.published, 3);
    assert!(report.is_complete());
    assert_eq!(pipeline.bus.keys(PROJECTS_TOPIC), vec!["p1", "p2", "p3"]);

    let events: Vec<ProjectDiscovered> = pipeline.bus.decoded(PROJECTS_TOPIC);
    assert!(events
        .iter()
        .all(|e| e.organization_id.as_deref() == Some(ORG_ID)));

    // A re-run is another full pass
    pipeline.scan().await.unwrap();
    assert_eq!(pipeline.bus.messages(PROJECTS_TOPIC).len(), 6);
}

#[tokio::test]
async fn test_table_modified_exactly_at_cutoff_is_due() {
    let pipeline = TestPipeline::new();
    let now = Utc::now();
    let at_cutoff = table("p1", "d1", "edge");
    let just_before = table("p1", "d1", "older");
    pipeline.warehouse.add_table(&at_cutoff, now - Duration::hours(24));
    pipeline
        .warehouse
        .add_table(&just_before, now - Duration::hours(24) - Duration::seconds(1));

    let check = pipeline.checker.check_project("p1", now).await.unwrap();

    assert_eq!(check.tables_checked, 2);
    assert_eq!(check.tables_due, vec![at_cutoff]);
}

#[tokio::test]
async fn test_future_timestamp_is_due() {
    let pipeline = TestPipeline::new();
    let now = Utc::now();
    let skewed = table("p1", "d1", "skewed");
    pipeline.warehouse.add_table(&skewed, now + Duration::minutes(5));

    let check = pipeline.checker.check_project("p1", now).await.unwrap();

    assert_eq!(check.tables_due, vec![skewed]);
}

#[tokio::test]
async fn test_fan_out_across_datasets() {
    let pipeline = TestPipeline::new();
    let now = Utc::now();
    pipeline.directory.add_project("p1", ORG_ID);
    pipeline.directory.add_project("p2", ORG_ID);
    for t in [
        table("p1", "d1", "a"),
        table("p1", "d1", "b"),
        table("p1", "d2", "c"),
        table("p2", "sales", "orders"),
    ] {
        pipeline.warehouse.add_table(&t, hours_ago(now, 2));
    }

    pipeline.run_once().await.unwrap();

    let mut keys = pipeline.bus.keys(BACKUPS_TOPIC);
    keys.sort();
    assert_eq!(keys, vec!["p1:d1.a", "p1:d1.b", "p1:d2.c", "p2:sales.orders"]);
    assert_eq!(pipeline.exporter.artifacts().len(), 4);
}

#[tokio::test]
async fn test_duplicate_backup_event_overwrites_same_destination() {
    let pipeline = TestPipeline::new();
    let t1 = table("p1", "d1", "t1");
    let message = TableDueForBackup::new(t1.clone());
    publish_message(pipeline.bus.as_ref(), BACKUPS_TOPIC, &message)
        .await
        .unwrap();
    publish_message(pipeline.bus.as_ref(), BACKUPS_TOPIC, &message)
        .await
        .unwrap();

    let outcome = pipeline.step_backup().await;

    assert_eq!(outcome.acked, 2);
    let requests = pipeline.exporter.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0].destination_uri, requests[1].destination_uri);

    let artifacts = pipeline.exporter.artifacts();
    assert_eq!(artifacts.len(), 1);
    assert_eq!(artifacts[&fixtures::expected_uri(&t1)].1, 2);
}

#[tokio::test]
async fn test_backup_messages_carry_type_header_and_table_key() {
    let pipeline = TestPipeline::new();
    let now = Utc::now();
    pipeline.directory.add_project("p1", ORG_ID);
    pipeline.warehouse.add_table(&table("p1", "d1", "t1"), hours_ago(now, 1));

    pipeline.scan().await.unwrap();
    pipeline.step_check().await;

    let messages = pipeline.bus.messages(BACKUPS_TOPIC);
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].key, "p1:d1.t1");
    assert_eq!(
        messages[0].headers["message-type"],
        TableDueForBackup::MESSAGE_TYPE.as_bytes()
    );

    let payload: serde_json::Value = serde_json::from_slice(&messages[0].payload).unwrap();
    assert_eq!(payload["project_id"], "p1");
    assert_eq!(payload["dataset_id"], "d1");
    assert_eq!(payload["table_id"], "t1");
}
