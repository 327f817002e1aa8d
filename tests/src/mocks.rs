//! In-memory bus and fake collaborators.
//!
//! `InMemoryBus` implements both bus seams (`MessagePublisher` and, per
//! topic, `MessageSource`) with the same semantics as the Redpanda consumer:
//! each source reads forward from its own cursor, and a new source resumes
//! at the topic's stored commit. The real subscription loop runs unchanged.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use backup_core::{
    BackupRequest, BusMessage, Error, JobHandle, JobOutcome, Organization, Project, Result,
    TableMetadata, TableRef,
};
use chrono::{DateTime, Utc};
use futures::stream;
use gcp::{ProjectDirectory, ProjectStream, TableExporter, WarehouseCatalog};
use parking_lot::Mutex;
use redpanda::{Delivery, MessagePublisher, MessageSource, Offset, OutboundMessage};

/// Batch size handed out by `fetch`.
pub const FETCH_BATCH: usize = 100;

#[derive(Default)]
struct Log {
    messages: Vec<OutboundMessage>,
    committed: i64,
    commits: Vec<i64>,
}

/// Single-partition in-memory topics with committed offsets.
#[derive(Default)]
pub struct InMemoryBus {
    topics: Mutex<HashMap<String, Log>>,
    /// Message keys whose publish fails
    reject_keys: Mutex<HashSet<String>>,
    fail_all: Mutex<bool>,
}

impl InMemoryBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// A consumer view of `topic`, partition 0, starting at the stored
    /// commit.
    pub fn source(self: &Arc<Self>, topic: &str) -> Arc<dyn MessageSource> {
        Arc::new(TopicSource {
            bus: self.clone(),
            topic: topic.to_string(),
            cursor: Mutex::new(None),
        })
    }

    /// Writes raw bytes, bypassing encoding (for poison messages).
    pub fn inject_raw(&self, topic: &str, key: &str, payload: &[u8]) {
        self.topics
            .lock()
            .entry(topic.to_string())
            .or_default()
            .messages
            .push(OutboundMessage {
                key: key.to_string(),
                payload: payload.to_vec(),
                headers: BTreeMap::new(),
            });
    }

    pub fn messages(&self, topic: &str) -> Vec<OutboundMessage> {
        self.topics
            .lock()
            .get(topic)
            .map(|log| log.messages.clone())
            .unwrap_or_default()
    }

    /// Decodes every message on `topic`.
    pub fn decoded<M: BusMessage>(&self, topic: &str) -> Vec<M> {
        self.messages(topic)
            .iter()
            .map(|m| M::decode(&m.payload).expect("message on topic should decode"))
            .collect()
    }

    pub fn keys(&self, topic: &str) -> Vec<String> {
        self.messages(topic).into_iter().map(|m| m.key).collect()
    }

    /// Stored commit of `topic`: where a new consumer starts reading.
    pub fn committed(&self, topic: &str) -> i64 {
        self.topics.lock().get(topic).map(|log| log.committed).unwrap_or(0)
    }

    /// Every commit made on `topic`, in order.
    pub fn commits(&self, topic: &str) -> Vec<i64> {
        self.topics
            .lock()
            .get(topic)
            .map(|log| log.commits.clone())
            .unwrap_or_default()
    }

    /// Messages not yet acknowledged.
    pub fn pending(&self, topic: &str) -> usize {
        self.topics
            .lock()
            .get(topic)
            .map(|log| log.messages.len() - log.committed as usize)
            .unwrap_or(0)
    }

    pub fn reject_key(&self, key: &str) {
        self.reject_keys.lock().insert(key.to_string());
    }

    pub fn set_fail_all(&self, fail: bool) {
        *self.fail_all.lock() = fail;
    }
}

#[async_trait]
impl MessagePublisher for InMemoryBus {
    async fn publish(&self, topic: &str, message: OutboundMessage) -> Result<()> {
        if *self.fail_all.lock() || self.reject_keys.lock().contains(&message.key) {
            return Err(Error::publish(format!("rejected {}", message.key)));
        }
        self.topics
            .lock()
            .entry(topic.to_string())
            .or_default()
            .messages
            .push(message);
        Ok(())
    }

    fn is_healthy(&self) -> bool {
        !*self.fail_all.lock()
    }
}

struct TopicSource {
    bus: Arc<InMemoryBus>,
    topic: String,
    /// Next offset to read; resolved from the stored commit on first fetch
    cursor: Mutex<Option<i64>>,
}

#[async_trait]
impl MessageSource for TopicSource {
    fn topic(&self) -> &str {
        &self.topic
    }

    fn partition(&self) -> i32 {
        0
    }

    async fn fetch(&self) -> Result<Vec<Delivery>> {
        let topics = self.bus.topics.lock();
        let Some(log) = topics.get(&self.topic) else {
            return Ok(Vec::new());
        };
        let mut cursor = self.cursor.lock();
        let start = *cursor.get_or_insert(log.committed);
        let deliveries: Vec<Delivery> = log
            .messages
            .iter()
            .enumerate()
            .skip(start as usize)
            .take(FETCH_BATCH)
            .map(|(offset, m)| Delivery {
                topic: self.topic.clone(),
                partition: 0,
                offset: offset as i64,
                key: Some(m.key.clone().into_bytes()),
                payload: Some(m.payload.clone()),
                headers: m.headers.clone(),
            })
            .collect();
        if let Some(last) = deliveries.last() {
            *cursor = Some(last.offset + 1);
        }
        Ok(deliveries)
    }

    async fn commit(&self, offset: Offset) -> Result<()> {
        let mut topics = self.bus.topics.lock();
        let log = topics.entry(self.topic.clone()).or_default();
        log.committed = offset.offset;
        log.commits.push(offset.offset);
        Ok(())
    }
}

/// Organization listing backed by a fixed project list.
#[derive(Default)]
pub struct FakeDirectory {
    projects: Mutex<Vec<Project>>,
    /// Fail after yielding this many projects
    fail_after: Mutex<Option<usize>>,
}

impl FakeDirectory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add_project(&self, project_id: &str, organization_id: &str) {
        self.projects
            .lock()
            .push(Project::new(project_id, organization_id));
    }

    pub fn fail_after(&self, count: usize) {
        *self.fail_after.lock() = Some(count);
    }
}

impl ProjectDirectory for FakeDirectory {
    fn list_projects<'a>(&'a self, organization: &'a Organization) -> ProjectStream<'a> {
        let mut items: Vec<Result<Project>> = self
            .projects
            .lock()
            .iter()
            .filter(|p| p.organization_id == organization.id)
            .cloned()
            .map(Ok)
            .collect();
        if let Some(count) = *self.fail_after.lock() {
            items.truncate(count);
            items.push(Err(Error::permission_denied("projects.list denied")));
        }
        Box::pin(stream::iter(items))
    }
}

/// Warehouse catalog with per-call failure injection and call recording.
#[derive(Default)]
pub struct FakeWarehouse {
    /// project -> dataset -> table -> last modified
    tables: Mutex<BTreeMap<String, BTreeMap<String, BTreeMap<String, DateTime<Utc>>>>>,
    unavailable_projects: Mutex<HashSet<String>>,
    unavailable_datasets: Mutex<HashSet<(String, String)>>,
    missing_tables: Mutex<HashSet<TableRef>>,
    calls: Mutex<Vec<String>>,
}

impl FakeWarehouse {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add_table(&self, table: &TableRef, last_modified_at: DateTime<Utc>) {
        self.tables
            .lock()
            .entry(table.project_id.clone())
            .or_default()
            .entry(table.dataset_id.clone())
            .or_default()
            .insert(table.table_id.clone(), last_modified_at);
    }

    /// `listDatasets(project)` fails with Unavailable until cleared.
    pub fn set_project_unavailable(&self, project_id: &str, unavailable: bool) {
        let mut projects = self.unavailable_projects.lock();
        if unavailable {
            projects.insert(project_id.to_string());
        } else {
            projects.remove(project_id);
        }
    }

    /// `listTables(project, dataset)` fails with Unavailable until cleared.
    pub fn set_dataset_unavailable(&self, project_id: &str, dataset_id: &str, unavailable: bool) {
        let key = (project_id.to_string(), dataset_id.to_string());
        let mut datasets = self.unavailable_datasets.lock();
        if unavailable {
            datasets.insert(key);
        } else {
            datasets.remove(&key);
        }
    }

    /// `getTableMetadata(table)` fails with NotFound.
    pub fn set_metadata_missing(&self, table: &TableRef) {
        self.missing_tables.lock().insert(table.clone());
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl WarehouseCatalog for FakeWarehouse {
    async fn list_datasets(&self, project_id: &str) -> Result<Vec<String>> {
        self.calls.lock().push(format!("datasets:{}", project_id));
        if self.unavailable_projects.lock().contains(project_id) {
            return Err(Error::unavailable("datasets.list returned 503"));
        }
        Ok(self
            .tables
            .lock()
            .get(project_id)
            .map(|datasets| datasets.keys().cloned().collect())
            .unwrap_or_default())
    }

    async fn list_tables(&self, project_id: &str, dataset_id: &str) -> Result<Vec<String>> {
        self.calls
            .lock()
            .push(format!("tables:{}.{}", project_id, dataset_id));
        let key = (project_id.to_string(), dataset_id.to_string());
        if self.unavailable_datasets.lock().contains(&key) {
            return Err(Error::unavailable("tables.list returned 503"));
        }
        self.tables
            .lock()
            .get(project_id)
            .and_then(|datasets| datasets.get(dataset_id))
            .map(|tables| tables.keys().cloned().collect())
            .ok_or_else(|| Error::not_found(format!("dataset {}", dataset_id)))
    }

    async fn get_table_metadata(&self, table: &TableRef) -> Result<TableMetadata> {
        self.calls.lock().push(format!("metadata:{}", table));
        if self.missing_tables.lock().contains(table) {
            return Err(Error::not_found(format!("table {}", table)));
        }
        let last_modified_at = self
            .tables
            .lock()
            .get(&table.project_id)
            .and_then(|datasets| datasets.get(&table.dataset_id))
            .and_then(|tables| tables.get(&table.table_id))
            .copied()
            .ok_or_else(|| Error::not_found(format!("table {}", table)))?;
        Ok(TableMetadata {
            table_ref: table.clone(),
            last_modified_at,
        })
    }
}

/// Export collaborator writing to an in-memory "bucket".
#[derive(Default)]
pub struct FakeExporter {
    /// Jobs that will still fail before one succeeds
    failures_remaining: Mutex<u32>,
    /// Tables whose exports always fail
    broken_tables: Mutex<HashSet<TableRef>>,
    /// Completion delay, for timeout tests
    delay: Mutex<Option<Duration>>,
    requests: Mutex<Vec<BackupRequest>>,
    /// destination URI -> table exported there and write count
    artifacts: Mutex<HashMap<String, (TableRef, u32)>>,
    pending: Mutex<HashMap<String, BackupRequest>>,
    cancelled: Mutex<Vec<String>>,
}

impl FakeExporter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_next(&self, count: u32) {
        *self.failures_remaining.lock() = count;
    }

    /// Every export of `table` fails until `repair` is called.
    pub fn break_table(&self, table: &TableRef) {
        self.broken_tables.lock().insert(table.clone());
    }

    pub fn repair(&self, table: &TableRef) {
        self.broken_tables.lock().remove(table);
    }

    /// Completed exports of `table`.
    pub fn export_count(&self, table: &TableRef) -> u32 {
        self.artifacts
            .lock()
            .values()
            .filter(|(t, _)| t == table)
            .map(|(_, count)| *count)
            .sum()
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = Some(delay);
    }

    pub fn requests(&self) -> Vec<BackupRequest> {
        self.requests.lock().clone()
    }

    /// Destinations holding an export, with how often each was written.
    pub fn artifacts(&self) -> HashMap<String, (TableRef, u32)> {
        self.artifacts.lock().clone()
    }

    pub fn cancelled(&self) -> Vec<String> {
        self.cancelled.lock().clone()
    }
}

#[async_trait]
impl TableExporter for FakeExporter {
    async fn start_export(&self, request: &BackupRequest) -> Result<JobHandle> {
        let mut requests = self.requests.lock();
        requests.push(request.clone());
        let job_id = format!("job-{}", requests.len());
        self.pending.lock().insert(job_id.clone(), request.clone());
        Ok(JobHandle {
            job_id,
            project_id: request.table_ref.project_id.clone(),
            location: None,
        })
    }

    async fn await_completion(&self, job: &JobHandle) -> Result<JobOutcome> {
        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let Some(request) = self.pending.lock().remove(&job.job_id) else {
            return Err(Error::not_found(format!("job {}", job.job_id)));
        };

        if self.broken_tables.lock().contains(&request.table_ref) {
            return Ok(JobOutcome::Failed {
                reason: "table is broken".to_string(),
            });
        }

        {
            let mut failures = self.failures_remaining.lock();
            if *failures > 0 {
                *failures -= 1;
                return Ok(JobOutcome::Failed {
                    reason: "backend error".to_string(),
                });
            }
        }

        let mut artifacts = self.artifacts.lock();
        let entry = artifacts
            .entry(request.destination_uri.clone())
            .or_insert((request.table_ref.clone(), 0));
        entry.1 += 1;
        Ok(JobOutcome::Succeeded)
    }

    async fn cancel(&self, job: &JobHandle) -> Result<()> {
        self.pending.lock().remove(&job.job_id);
        self.cancelled.lock().push(job.job_id.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use backup_core::ProjectDiscovered;
    use redpanda::publish_message;

    #[tokio::test]
    async fn test_bus_redelivers_until_committed() {
        let bus = InMemoryBus::new();
        publish_message(bus.as_ref(), "projects", &ProjectDiscovered::new("p1"))
            .await
            .unwrap();
        let source = bus.source("projects");

        assert_eq!(source.fetch().await.unwrap().len(), 1);
        assert_eq!(source.fetch().await.unwrap().len(), 1);

        source
            .commit(Offset {
                partition: 0,
                offset: 1,
            })
            .await
            .unwrap();
        assert!(source.fetch().await.unwrap().is_empty());
        assert_eq!(bus.pending("projects"), 0);
    }

    #[tokio::test]
    async fn test_rejected_key_is_not_stored() {
        let bus = InMemoryBus::new();
        bus.reject_key("p1");

        let result = publish_message(bus.as_ref(), "projects", &ProjectDiscovered::new("p1")).await;

        assert!(result.is_err());
        assert!(bus.messages("projects").is_empty());
    }
}
