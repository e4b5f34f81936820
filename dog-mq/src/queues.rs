//! Queue lifecycle and metadata.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::DateTime;
use futures::TryStreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, instrument};

use crate::backend::{Document, Filter, FindOptions, Sort, Update};
use crate::clock::Clock;
use crate::config::MissingQueueStats;
use crate::cursor::Cursor;
use crate::error::{BrokerError, BrokerResult};
use crate::messages::{self, MessageRecord, CLAIMS, COUNTERS, MESSAGES};
use crate::pooling::catalog::CATALOGUE;
use crate::pooling::Catalog;
use crate::retry::Guarded;
use crate::types::{scope, MessageStat, MetadataPatch, QueueMetadata, QueueStats, QueueSummary};
use crate::validation::Validator;

pub(crate) const QUEUES: &str = "queues";

/// Queue operations shared by the storage-backed controller and pipeline stages
#[async_trait]
pub trait QueueController: Send + Sync {
    /// Create or overwrite a queue; `true` only when it did not exist before
    async fn create(&self, name: &str, project: &str, metadata: QueueMetadata)
        -> BrokerResult<bool>;

    /// Stored metadata with message defaults filled in
    async fn get(&self, name: &str, project: &str) -> BrokerResult<QueueMetadata>;

    async fn exists(&self, name: &str, project: &str) -> BrokerResult<bool>;

    async fn update_metadata(
        &self,
        name: &str,
        project: &str,
        ops: &[MetadataPatch],
    ) -> BrokerResult<QueueMetadata>;

    /// Replace the whole metadata object
    async fn set_metadata(&self, name: &str, project: &str, metadata: QueueMetadata)
        -> BrokerResult<()>;

    /// Remove the queue with its messages, claims and route; idempotent
    async fn delete(&self, name: &str, project: &str) -> BrokerResult<()>;

    /// Queues of a project ordered by name, resuming after `marker`
    async fn list(
        &self,
        project: &str,
        marker: Option<&str>,
        limit: Option<usize>,
        detailed: bool,
    ) -> BrokerResult<Cursor<QueueSummary>>;

    async fn stats(&self, name: &str, project: &str) -> BrokerResult<QueueStats>;
}

/// Stored queue document
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct QueueRecord {
    #[serde(rename = "_id")]
    pub id: String,
    pub project: String,
    pub name: String,
    #[serde(default)]
    pub metadata: QueueMetadata,
    pub created: i64,
}

impl QueueRecord {
    fn new(project: &str, name: &str, metadata: QueueMetadata, now: i64) -> Self {
        Self {
            id: scope(project, name),
            project: project.to_string(),
            name: name.to_string(),
            metadata,
            created: now,
        }
    }

    fn to_document(&self) -> BrokerResult<Document> {
        match serde_json::to_value(self)? {
            Value::Object(map) => Ok(map),
            _ => Err(BrokerError::Serialization("queue record is not an object".into())),
        }
    }
}

/// Stored metadata of a queue, `None` when the queue document is missing
pub(crate) async fn load_metadata(
    backend: &Guarded,
    project: &str,
    name: &str,
) -> BrokerResult<Option<QueueMetadata>> {
    match backend.find_one(QUEUES, &Filter::id(scope(project, name))).await? {
        Some(doc) => {
            let record: QueueRecord = serde_json::from_value(Value::Object(doc))?;
            Ok(Some(record.metadata))
        }
        None => Ok(None),
    }
}

/// Create an empty queue document if none exists; used by implicit creation on post
pub(crate) async fn ensure_queue(
    backend: &Guarded,
    project: &str,
    name: &str,
    now: i64,
) -> BrokerResult<()> {
    let record = QueueRecord::new(project, name, QueueMetadata::default(), now);
    match backend.insert(QUEUES, record.to_document()?).await {
        Ok(_) => {
            info!(project, queue = name, "queue created implicitly");
            Ok(())
        }
        Err(BrokerError::Backend(err)) if err.is_duplicate_key() => Ok(()),
        Err(err) => Err(err),
    }
}

/// Storage-backed queue controller
pub struct QueueStore {
    catalog: Arc<Catalog>,
    validator: Validator,
    clock: Arc<dyn Clock>,
}

impl QueueStore {
    pub fn new(catalog: Arc<Catalog>, validator: Validator, clock: Arc<dyn Clock>) -> Self {
        Self {
            catalog,
            validator,
            clock,
        }
    }

    async fn require(&self, name: &str, project: &str) -> BrokerResult<(Guarded, QueueMetadata)> {
        let missing = || BrokerError::queue_missing(name, project);
        let backend = self
            .catalog
            .lookup_backend(project, name)
            .await?
            .ok_or_else(missing)?;
        let metadata = load_metadata(&backend, project, name)
            .await?
            .ok_or_else(missing)?;
        Ok((backend, metadata))
    }

    async fn write_metadata(
        &self,
        backend: &Guarded,
        name: &str,
        project: &str,
        metadata: &QueueMetadata,
    ) -> BrokerResult<()> {
        let update = Update::new().set("metadata", serde_json::to_value(metadata)?);
        let matched = backend
            .update_one(QUEUES, &Filter::id(scope(project, name)), &update, false)
            .await?;
        if !matched {
            return Err(BrokerError::queue_missing(name, project));
        }
        Ok(())
    }

    fn missing_stats(&self, name: &str, project: &str) -> BrokerResult<QueueStats> {
        match self.validator.config().missing_queue_stats {
            MissingQueueStats::NotFound => Err(BrokerError::queue_missing(name, project)),
            MissingQueueStats::Zeroed => Ok(QueueStats::default()),
        }
    }

    async fn edge_message(
        &self,
        backend: &Guarded,
        alive: &Filter,
        sort: Sort,
        now: i64,
    ) -> BrokerResult<Option<MessageStat>> {
        let mut stream = backend
            .find(MESSAGES, alive, &FindOptions::sorted(sort).limit(1))
            .await?;
        let Some(doc) = stream.try_next().await? else {
            return Ok(None);
        };
        let record = MessageRecord::from_document(doc)?;
        Ok(Some(MessageStat {
            id: record.message_id(),
            age: (now - record.created).max(0),
            created: DateTime::from_timestamp(record.created, 0).unwrap_or_default(),
        }))
    }
}

#[async_trait]
impl QueueController for QueueStore {
    #[instrument(skip_all, fields(project = %project, queue = %name))]
    async fn create(
        &self,
        name: &str,
        project: &str,
        metadata: QueueMetadata,
    ) -> BrokerResult<bool> {
        self.validator.queue_identification(name, project)?;
        self.validator.queue_metadata(&metadata)?;

        let backend = self
            .catalog
            .resolve_backend(project, name, metadata.flavor.as_deref())
            .await?;
        let record = QueueRecord::new(project, name, metadata, self.clock.timestamp());

        match backend.insert(QUEUES, record.to_document()?).await {
            Ok(_) => {
                info!("queue created");
                Ok(true)
            }
            Err(BrokerError::Backend(err)) if err.is_duplicate_key() => {
                self.write_metadata(&backend, name, project, &record.metadata)
                    .await?;
                debug!("queue already existed, metadata overwritten");
                Ok(false)
            }
            Err(err) => Err(err),
        }
    }

    async fn get(&self, name: &str, project: &str) -> BrokerResult<QueueMetadata> {
        self.validator.queue_identification(name, project)?;
        let (_, metadata) = self.require(name, project).await?;
        Ok(metadata.with_defaults(self.validator.config()))
    }

    async fn exists(&self, name: &str, project: &str) -> BrokerResult<bool> {
        self.validator.queue_identification(name, project)?;
        match self.catalog.lookup_backend(project, name).await? {
            Some(backend) => Ok(load_metadata(&backend, project, name).await?.is_some()),
            None => Ok(false),
        }
    }

    #[instrument(skip_all, fields(project = %project, queue = %name))]
    async fn update_metadata(
        &self,
        name: &str,
        project: &str,
        ops: &[MetadataPatch],
    ) -> BrokerResult<QueueMetadata> {
        self.validator.queue_identification(name, project)?;
        let (backend, current) = self.require(name, project).await?;
        let patched = current.patched(ops)?;
        self.validator.queue_metadata(&patched)?;
        self.write_metadata(&backend, name, project, &patched).await?;
        Ok(patched)
    }

    #[instrument(skip_all, fields(project = %project, queue = %name))]
    async fn set_metadata(
        &self,
        name: &str,
        project: &str,
        metadata: QueueMetadata,
    ) -> BrokerResult<()> {
        self.validator.queue_identification(name, project)?;
        self.validator.queue_metadata(&metadata)?;
        let (backend, _) = self.require(name, project).await?;
        self.write_metadata(&backend, name, project, &metadata).await
    }

    #[instrument(skip_all, fields(project = %project, queue = %name))]
    async fn delete(&self, name: &str, project: &str) -> BrokerResult<()> {
        self.validator.queue_identification(name, project)?;
        let Some(backend) = self.catalog.lookup_backend(project, name).await? else {
            return Ok(());
        };

        let scope = scope(project, name);
        let in_queue = Filter::eq("scope", scope.as_str());
        let messages = backend.delete_many(MESSAGES, &in_queue).await?;
        let claims = backend.delete_many(CLAIMS, &in_queue).await?;
        backend.delete_one(COUNTERS, &Filter::id(scope.as_str())).await?;
        backend.delete_one(QUEUES, &Filter::id(scope.as_str())).await?;
        self.catalog.forget(project, name).await?;

        info!(messages, claims, "queue deleted");
        Ok(())
    }

    async fn list(
        &self,
        project: &str,
        marker: Option<&str>,
        limit: Option<usize>,
        detailed: bool,
    ) -> BrokerResult<Cursor<QueueSummary>> {
        self.validator.project_identification(project)?;
        let limit = limit.unwrap_or(self.validator.config().max_queues_per_page);
        self.validator.queue_listing(limit)?;

        let control = self.catalog.registry().control();
        let mut page = Vec::with_capacity(limit);
        let mut after = marker.map(str::to_string);
        // routes whose queue document is gone are skipped, so refill until full
        while page.len() < limit {
            let wanted = limit - page.len();
            let resumed_from = after.clone();
            let options = FindOptions::sorted(Sort::asc("queue"))
                .after(after.clone().map(Value::from))
                .limit(wanted);
            let entries: Vec<Document> = control
                .find(CATALOGUE, &Filter::eq("project", project), &options)
                .await?
                .try_collect()
                .await?;
            let fetched = entries.len();

            for entry in entries {
                let Some(name) = entry.get("queue").and_then(Value::as_str) else {
                    continue;
                };
                after = Some(name.to_string());
                let stored = match self.catalog.lookup_backend(project, name).await? {
                    Some(backend) => load_metadata(&backend, project, name).await?,
                    None => None,
                };
                let Some(metadata) = stored else {
                    debug!(queue = name, "skipping route without a queue document");
                    continue;
                };
                page.push(Ok(QueueSummary {
                    name: name.to_string(),
                    metadata: detailed.then_some(metadata),
                }));
            }
            if fetched < wanted || after == resumed_from {
                break;
            }
        }
        Ok(Cursor::new(Box::pin(futures::stream::iter(page))))
    }

    async fn stats(&self, name: &str, project: &str) -> BrokerResult<QueueStats> {
        self.validator.queue_identification(name, project)?;
        let Some(backend) = self.catalog.lookup_backend(project, name).await? else {
            return self.missing_stats(name, project);
        };
        if load_metadata(&backend, project, name).await?.is_none() {
            return self.missing_stats(name, project);
        }

        let now = self.clock.timestamp();
        let scope = scope(project, name);
        let alive = messages::alive(&scope, now);
        let total = backend.count(MESSAGES, &alive).await?;
        let claimed = backend
            .count(MESSAGES, &messages::claimed(&scope, now))
            .await?;

        let mut stats = QueueStats {
            claimed,
            free: total.saturating_sub(claimed),
            total,
            oldest: None,
            newest: None,
        };
        if total > 0 {
            stats.oldest = self
                .edge_message(&backend, &alive, Sort::asc("marker"), now)
                .await?;
            stats.newest = self
                .edge_message(&backend, &alive, Sort::desc("marker"), now)
                .await?;
        }
        Ok(stats)
    }
}
