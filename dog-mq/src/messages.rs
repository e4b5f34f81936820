//! Message storage.
//!
//! Each queue owns a counter document. A post reads the counter, assigns
//! `marker = counter + index` to every message and inserts them; markers are
//! unique per queue so two posters racing for the same range collide on the
//! primary key. The loser rolls its batch back, backs off and tries again.
//! Multi-message batches carry a transaction id and stay invisible until the
//! whole batch is stored.
//!
//! Visibility is computed on read from stored timestamps:
//!
//! ```text
//! free     = tx is null  && expires > now && claim_expires <= now && delay_until <= now
//! claimed  = tx is null  && expires > now && claim_expires >  now
//! ```

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::DateTime;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::backend::{Document, Filter, FindOptions, Sort, Update};
use crate::clock::Clock;
use crate::cursor::Cursor;
use crate::error::{BackendResult, BrokerError, BrokerResult};
use crate::pooling::Catalog;
use crate::queues::{ensure_queue, load_metadata};
use crate::retry::Guarded;
use crate::types::{scope, ClaimId, ListOptions, Message, MessageId, NewMessage, QueueMetadata};
use crate::validation::Validator;

pub(crate) const MESSAGES: &str = "messages";
pub(crate) const CLAIMS: &str = "claims";
pub(crate) const COUNTERS: &str = "counters";

/// A counter untouched this long while posts keep conflicting is repaired
const COUNTER_STALL_WINDOW: i64 = 5;

/// Upper bound on time spent retrying one conflicting post
const MAX_RETRY_POST_DURATION: Duration = Duration::from_secs(45);

const DEFAULT_MESSAGES_PER_PAGE: usize = 10;

/// Message operations shared by the storage-backed controller and pipeline stages
#[async_trait]
pub trait MessageController: Send + Sync {
    /// Store a batch, all or nothing; ids come back in input order
    async fn post(
        &self,
        queue: &str,
        project: &str,
        messages: Vec<NewMessage>,
        client_uuid: Option<&str>,
    ) -> BrokerResult<Vec<MessageId>>;

    async fn get(&self, queue: &str, project: &str, id: &MessageId) -> BrokerResult<Message>;

    /// Existing messages among `ids`; missing ones are skipped
    async fn bulk_get(&self, queue: &str, project: &str, ids: &[MessageId])
        -> BrokerResult<Vec<Message>>;

    async fn list(
        &self,
        queue: &str,
        project: &str,
        options: &ListOptions,
    ) -> BrokerResult<Cursor<Message>>;

    /// Claimed messages require the owning claim's id; missing messages are a no-op
    async fn delete(
        &self,
        queue: &str,
        project: &str,
        id: &MessageId,
        claim: Option<&ClaimId>,
    ) -> BrokerResult<()>;

    async fn bulk_delete(
        &self,
        queue: &str,
        project: &str,
        ids: &[MessageId],
        claim_ids: Option<&[ClaimId]>,
    ) -> BrokerResult<()>;

    /// Remove and return up to `limit` free messages, oldest first
    async fn pop(&self, queue: &str, project: &str, limit: usize) -> BrokerResult<Vec<Message>>;
}

/// Stored message document
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct MessageRecord {
    #[serde(rename = "_id")]
    pub id: String,
    pub scope: String,
    pub marker: u64,
    pub body: Value,
    pub ttl: u64,
    pub created: i64,
    pub expires: i64,
    pub delay_until: i64,
    pub client_uuid: Option<String>,
    pub claim_id: Option<String>,
    pub claim_expires: i64,
    pub claim_count: u32,
    pub tx: Option<String>,
}

impl MessageRecord {
    pub fn key(scope: &str, marker: u64) -> String {
        format!("{}/{}", scope, marker)
    }

    pub fn from_document(doc: Document) -> BrokerResult<Self> {
        Ok(serde_json::from_value(Value::Object(doc))?)
    }

    pub fn to_document(&self) -> BrokerResult<Document> {
        match serde_json::to_value(self)? {
            Value::Object(map) => Ok(map),
            _ => Err(BrokerError::Serialization("message record is not an object".into())),
        }
    }

    pub fn message_id(&self) -> MessageId {
        MessageId::from_marker(self.marker)
    }

    pub fn is_claimed(&self, now: i64) -> bool {
        self.claim_id.is_some() && self.claim_expires > now
    }

    pub fn into_message(self, now: i64) -> Message {
        let claim_id = if self.is_claimed(now) {
            self.claim_id.map(ClaimId)
        } else {
            None
        };
        Message {
            id: MessageId::from_marker(self.marker),
            body: self.body,
            ttl: self.ttl,
            age: (now - self.created).max(0),
            created_at: DateTime::from_timestamp(self.created, 0).unwrap_or_default(),
            claim_id,
            claim_count: self.claim_count,
            client_uuid: self.client_uuid,
        }
    }
}

pub(crate) fn alive(scope: &str, now: i64) -> Filter {
    Filter::eq("scope", scope)
        .and(Filter::Eq("tx".into(), Value::Null))
        .and(Filter::gt("expires", now))
}

pub(crate) fn claimed(scope: &str, now: i64) -> Filter {
    alive(scope, now).and(Filter::gt("claim_expires", now))
}

pub(crate) fn free(scope: &str, now: i64) -> Filter {
    alive(scope, now)
        .and(Filter::lte("claim_expires", now))
        .and(Filter::lte("delay_until", now))
}

pub(crate) fn claimed_by(scope: &str, claim: &str, now: i64) -> Filter {
    claimed(scope, now).and(Filter::eq("claim_id", claim))
}

/// Filter for the ids this broker could have issued; foreign ids are dropped
fn keys_for(scope: &str, ids: &[MessageId]) -> Vec<String> {
    ids.iter()
        .filter_map(MessageId::marker)
        .map(|m| MessageRecord::key(scope, m))
        .collect()
}

/// Storage-backed message controller
pub struct MessageStore {
    catalog: Arc<Catalog>,
    validator: Validator,
    clock: Arc<dyn Clock>,
}

impl MessageStore {
    pub fn new(catalog: Arc<Catalog>, validator: Validator, clock: Arc<dyn Clock>) -> Self {
        Self {
            catalog,
            validator,
            clock,
        }
    }

    /// Next marker to hand out and when the counter last moved
    async fn counter(&self, backend: &Guarded, scope: &str, now: i64) -> BrokerResult<(u64, i64)> {
        if let Some(doc) = backend.find_one(COUNTERS, &Filter::id(scope)).await? {
            return Ok(read_counter(&doc, now));
        }

        let mut doc = Document::new();
        doc.insert("_id".into(), json!(scope));
        doc.insert("v".into(), json!(1));
        doc.insert("t".into(), json!(now));
        match backend.insert(COUNTERS, doc).await {
            Ok(_) => Ok((1, now)),
            Err(BrokerError::Backend(err)) if err.is_duplicate_key() => {
                let doc = backend.find_one(COUNTERS, &Filter::id(scope)).await?;
                Ok(doc.map_or((1, now), |d| read_counter(&d, now)))
            }
            Err(err) => Err(err),
        }
    }

    /// Move the counter past a committed batch unless someone already did
    async fn advance_counter(
        &self,
        backend: &Guarded,
        scope: &str,
        from: u64,
        by: u64,
        now: i64,
    ) -> BrokerResult<()> {
        let filter = Filter::id(scope).and(Filter::eq("v", from));
        let update = Update::new().set("v", from + by).set("t", now);
        backend.update_one(COUNTERS, &filter, &update, false).await?;
        Ok(())
    }

    /// Jump a stalled counter past the highest marker actually stored
    async fn repair_counter(
        &self,
        backend: &Guarded,
        scope: &str,
        from: u64,
        now: i64,
    ) -> BrokerResult<()> {
        let newest = FindOptions::sorted(Sort::desc("marker")).limit(1);
        let mut stream = backend
            .find(MESSAGES, &Filter::eq("scope", scope), &newest)
            .await?;
        let highest = match stream.next().await {
            Some(doc) => doc?.get("marker").and_then(Value::as_u64).unwrap_or(0),
            None => 0,
        };
        let next = (highest + 1).max(from + 1);

        warn!(scope, from, next, "message counter stalled, moving it forward");
        let filter = Filter::id(scope).and(Filter::eq("v", from));
        let update = Update::new().set("v", next).set("t", now);
        backend.update_one(COUNTERS, &filter, &update, false).await?;
        Ok(())
    }

    async fn rollback(&self, backend: &Guarded, tx: Option<&str>) -> BrokerResult<()> {
        if let Some(tx) = tx {
            let removed = backend.delete_many(MESSAGES, &Filter::eq("tx", tx)).await?;
            debug!(tx, removed, "rolled back uncommitted batch");
        }
        Ok(())
    }

    async fn insert_batch(
        &self,
        backend: &Guarded,
        project: &str,
        queue: &str,
        messages: &[(NewMessage, u64, u64)],
        client_uuid: Option<&str>,
    ) -> BrokerResult<Vec<MessageId>> {
        let scope = scope(project, queue);
        let tx = (messages.len() > 1).then(|| Uuid::new_v4().to_string());
        let retry = backend.executor().clone();
        let started = Instant::now();

        for attempt in 0..retry.config().max_attempts {
            let now = self.clock.timestamp();
            let (next, touched) = self.counter(backend, &scope, now).await?;

            let records: Vec<MessageRecord> = messages
                .iter()
                .enumerate()
                .map(|(i, (msg, ttl, delay))| {
                    let marker = next + i as u64;
                    MessageRecord {
                        id: MessageRecord::key(&scope, marker),
                        scope: scope.clone(),
                        marker,
                        body: msg.body.clone(),
                        ttl: *ttl,
                        created: now,
                        expires: now + *ttl as i64,
                        delay_until: now + *delay as i64,
                        client_uuid: client_uuid.map(str::to_string),
                        claim_id: None,
                        claim_expires: now,
                        claim_count: 0,
                        tx: tx.clone(),
                    }
                })
                .collect();
            let docs = records
                .iter()
                .map(MessageRecord::to_document)
                .collect::<BrokerResult<Vec<_>>>()?;

            match backend.insert_many(MESSAGES, docs).await {
                Ok(_) => {
                    self.advance_counter(backend, &scope, next, records.len() as u64, now)
                        .await?;
                    if let Some(tx) = &tx {
                        let commit = Update::new().set("tx", Value::Null);
                        backend
                            .update_many(MESSAGES, &Filter::eq("tx", tx.as_str()), &commit)
                            .await?;
                    }
                    debug!(first = next, count = records.len(), attempt, "messages stored");
                    return Ok(records.iter().map(MessageRecord::message_id).collect());
                }
                Err(BrokerError::Backend(err)) if err.is_duplicate_key() => {
                    self.rollback(backend, tx.as_deref()).await?;
                    if started.elapsed() >= MAX_RETRY_POST_DURATION {
                        break;
                    }
                    if now - touched >= COUNTER_STALL_WINDOW {
                        self.repair_counter(backend, &scope, next, now).await?;
                    }
                    debug!(attempt, marker = next, "marker conflict, retrying post");
                    retry.backoff().await;
                }
                Err(err) => {
                    if let Err(rollback) = self.rollback(backend, tx.as_deref()).await {
                        warn!(error = %rollback, "rollback after failed post also failed");
                    }
                    return Err(err);
                }
            }
        }

        warn!(project, queue, "message post gave up after repeated conflicts");
        Err(BrokerError::MessageConflict {
            queue: queue.to_string(),
            project: project.to_string(),
        })
    }

    async fn claim_is_active(
        &self,
        backend: &Guarded,
        scope: &str,
        claim: &ClaimId,
        now: i64,
    ) -> BrokerResult<bool> {
        let filter = Filter::id(claim.as_str())
            .and(Filter::eq("scope", scope))
            .and(Filter::gt("expires", now));
        Ok(backend.find_one(CLAIMS, &filter).await?.is_some())
    }
}

fn read_counter(doc: &Document, now: i64) -> (u64, i64) {
    let v = doc.get("v").and_then(Value::as_u64).unwrap_or(1);
    let t = doc.get("t").and_then(Value::as_i64).unwrap_or(now);
    (v, t)
}

#[async_trait]
impl MessageController for MessageStore {
    #[instrument(skip_all, fields(project = %project, queue = %queue, count = messages.len()))]
    async fn post(
        &self,
        queue: &str,
        project: &str,
        messages: Vec<NewMessage>,
        client_uuid: Option<&str>,
    ) -> BrokerResult<Vec<MessageId>> {
        self.validator.queue_identification(queue, project)?;
        self.validator.message_posting(&messages, None)?;

        let existing = match self.catalog.lookup_backend(project, queue).await? {
            Some(backend) => load_metadata(&backend, project, queue).await?,
            None => None,
        };
        if let Some(meta) = &existing {
            self.validator
                .message_posting(&messages, meta.max_messages_post_size)?;
        }

        let backend = self.catalog.resolve_backend(project, queue, None).await?;
        let metadata = match existing {
            Some(meta) => meta,
            None => {
                ensure_queue(&backend, project, queue, self.clock.timestamp()).await?;
                QueueMetadata::default()
            }
        };

        let cfg = self.validator.config();
        let ttl = metadata.default_message_ttl.unwrap_or(cfg.default_message_ttl);
        let delay = metadata
            .default_message_delay
            .unwrap_or(cfg.default_message_delay);
        let prepared: Vec<(NewMessage, u64, u64)> = messages
            .into_iter()
            .map(|m| {
                let (t, d) = (m.ttl.unwrap_or(ttl), m.delay.unwrap_or(delay));
                (m, t, d)
            })
            .collect();

        let ids = self
            .insert_batch(&backend, project, queue, &prepared, client_uuid)
            .await?;
        info!(count = ids.len(), "messages posted");
        Ok(ids)
    }

    async fn get(&self, queue: &str, project: &str, id: &MessageId) -> BrokerResult<Message> {
        self.validator.queue_identification(queue, project)?;
        let missing = || BrokerError::message_missing(id.as_str(), queue, project);

        let marker = id.marker().ok_or_else(missing)?;
        let backend = self
            .catalog
            .lookup_backend(project, queue)
            .await?
            .ok_or_else(missing)?;

        let now = self.clock.timestamp();
        let scope = scope(project, queue);
        let filter = Filter::id(MessageRecord::key(&scope, marker)).and(alive(&scope, now));
        let doc = backend.find_one(MESSAGES, &filter).await?.ok_or_else(missing)?;
        Ok(MessageRecord::from_document(doc)?.into_message(now))
    }

    async fn bulk_get(
        &self,
        queue: &str,
        project: &str,
        ids: &[MessageId],
    ) -> BrokerResult<Vec<Message>> {
        self.validator.queue_identification(queue, project)?;
        self.validator.message_ids(ids.len())?;
        let Some(backend) = self.catalog.lookup_backend(project, queue).await? else {
            return Ok(Vec::new());
        };

        let now = self.clock.timestamp();
        let scope = scope(project, queue);
        let keys = keys_for(&scope, ids);
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let filter = Filter::is_in("_id", keys).and(alive(&scope, now));
        let mut stream = backend
            .find(MESSAGES, &filter, &FindOptions::sorted(Sort::asc("marker")))
            .await?;

        let mut found = Vec::new();
        while let Some(doc) = stream.next().await {
            found.push(MessageRecord::from_document(doc?)?.into_message(now));
        }
        Ok(found)
    }

    async fn list(
        &self,
        queue: &str,
        project: &str,
        options: &ListOptions,
    ) -> BrokerResult<Cursor<Message>> {
        self.validator.queue_identification(queue, project)?;
        let cfg = self.validator.config();
        let limit = options
            .limit
            .unwrap_or(DEFAULT_MESSAGES_PER_PAGE.min(cfg.max_messages_per_page));
        self.validator.message_listing(limit)?;
        let after = match &options.marker {
            Some(marker) => Some(marker.parse::<u64>().map_err(|_| {
                BrokerError::validation(format!("invalid message marker: {marker}"))
            })?),
            None => None,
        };

        let Some(backend) = self.catalog.lookup_backend(project, queue).await? else {
            return Ok(Cursor::empty());
        };

        let now = self.clock.timestamp();
        let scope = scope(project, queue);
        let mut filter = alive(&scope, now);
        if !options.include_claimed {
            filter = filter.and(Filter::lte("claim_expires", now));
        }
        if !options.include_delayed {
            filter = filter.and(Filter::lte("delay_until", now));
        }
        if let (false, Some(uuid)) = (options.echo, &options.client_uuid) {
            filter = filter.and(Filter::ne("client_uuid", uuid.as_str()));
        }

        let find = FindOptions::sorted(Sort::asc("marker"))
            .after(after.map(Value::from))
            .limit(limit);
        let stream = backend.find(MESSAGES, &filter, &find).await?;
        let messages = stream.map(move |doc: BackendResult<Document>| -> BrokerResult<Message> {
            Ok(MessageRecord::from_document(doc?)?.into_message(now))
        });
        Ok(Cursor::new(Box::pin(messages)))
    }

    #[instrument(skip_all, fields(project = %project, queue = %queue, message = %id))]
    async fn delete(
        &self,
        queue: &str,
        project: &str,
        id: &MessageId,
        claim: Option<&ClaimId>,
    ) -> BrokerResult<()> {
        self.validator.queue_identification(queue, project)?;
        let Some(marker) = id.marker() else {
            return Ok(());
        };
        let Some(backend) = self.catalog.lookup_backend(project, queue).await? else {
            return Ok(());
        };

        let scope = scope(project, queue);
        let key = MessageRecord::key(&scope, marker);
        let Some(doc) = backend.find_one(MESSAGES, &Filter::id(key.as_str())).await? else {
            return Ok(());
        };
        let record = MessageRecord::from_document(doc)?;
        let now = self.clock.timestamp();
        let claimed_now = record.is_claimed(now);

        match claim {
            None => {
                if claimed_now {
                    return Err(BrokerError::MessageIsClaimed {
                        id: id.to_string(),
                    });
                }
                let unclaimed = Filter::id(key.as_str()).and(Filter::lte("claim_expires", now));
                if backend.delete_one(MESSAGES, &unclaimed).await? == 0
                    && backend
                        .find_one(MESSAGES, &Filter::id(key.as_str()))
                        .await?
                        .is_some()
                {
                    // claimed between our read and the delete
                    return Err(BrokerError::MessageIsClaimed {
                        id: id.to_string(),
                    });
                }
            }
            Some(cid) => {
                if claimed_now && record.claim_id.as_deref() == Some(cid.as_str()) {
                    let owned = Filter::id(key.as_str()).and(Filter::eq("claim_id", cid.as_str()));
                    backend.delete_one(MESSAGES, &owned).await?;
                } else if claimed_now {
                    return Err(BrokerError::MessageNotClaimedBy {
                        id: id.to_string(),
                        claim: cid.to_string(),
                    });
                } else if !self.claim_is_active(&backend, &scope, cid, now).await? {
                    return Err(BrokerError::claim_missing(cid.as_str(), queue, project));
                } else {
                    return Err(BrokerError::MessageNotClaimed {
                        id: id.to_string(),
                    });
                }
            }
        }
        debug!("message deleted");
        Ok(())
    }

    #[instrument(skip_all, fields(project = %project, queue = %queue, count = ids.len()))]
    async fn bulk_delete(
        &self,
        queue: &str,
        project: &str,
        ids: &[MessageId],
        claim_ids: Option<&[ClaimId]>,
    ) -> BrokerResult<()> {
        self.validator.queue_identification(queue, project)?;
        self.validator.message_ids(ids.len())?;
        let Some(backend) = self.catalog.lookup_backend(project, queue).await? else {
            return Ok(());
        };

        let scope = scope(project, queue);
        let keys = keys_for(&scope, ids);
        if keys.is_empty() {
            return Ok(());
        }
        let now = self.clock.timestamp();
        let targeted = Filter::is_in("_id", keys);
        let mut deletable = targeted.clone().and(Filter::lte("claim_expires", now));

        if let Some(claim_ids) = claim_ids {
            for cid in claim_ids {
                let owns = targeted
                    .clone()
                    .and(claimed_by(&scope, cid.as_str(), now));
                if backend.count(MESSAGES, &owns).await? == 0 {
                    return Err(BrokerError::claim_missing(cid.as_str(), queue, project));
                }
            }
            let by_claims = targeted
                .clone()
                .and(Filter::is_in("claim_id", claim_ids.iter().map(|c| c.as_str())))
                .and(Filter::gt("claim_expires", now));
            deletable = deletable.or(by_claims);
        }

        let removed = backend.delete_many(MESSAGES, &deletable).await?;
        debug!(removed, "messages bulk deleted");
        Ok(())
    }

    #[instrument(skip_all, fields(project = %project, queue = %queue, limit = limit))]
    async fn pop(&self, queue: &str, project: &str, limit: usize) -> BrokerResult<Vec<Message>> {
        self.validator.queue_identification(queue, project)?;
        self.validator.pop_limit(limit)?;
        let Some(backend) = self.catalog.lookup_backend(project, queue).await? else {
            return Ok(Vec::new());
        };

        let now = self.clock.timestamp();
        let scope = scope(project, queue);
        let docs = backend
            .find_and_delete_many(MESSAGES, &free(&scope, now), Some(&Sort::asc("marker")), limit)
            .await?;
        let popped = docs
            .into_iter()
            .map(|doc| -> BrokerResult<Message> {
                Ok(MessageRecord::from_document(doc)?.into_message(now))
            })
            .collect::<BrokerResult<Vec<_>>>()?;
        debug!(count = popped.len(), "messages popped");
        Ok(popped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(now: i64) -> MessageRecord {
        MessageRecord {
            id: MessageRecord::key("p/q", 7),
            scope: "p/q".into(),
            marker: 7,
            body: json!({"event": "BackupStarted"}),
            ttl: 300,
            created: now - 10,
            expires: now + 290,
            delay_until: now - 10,
            client_uuid: None,
            claim_id: None,
            claim_expires: now - 10,
            claim_count: 0,
            tx: None,
        }
    }

    #[test]
    fn fresh_records_are_free() {
        let now = 1_000;
        let doc = record(now).to_document().unwrap();
        assert!(free("p/q", now).matches(&doc));
        assert!(alive("p/q", now).matches(&doc));
        assert!(!claimed("p/q", now).matches(&doc));
        assert!(!alive("p/other", now).matches(&doc));
    }

    #[test]
    fn uncommitted_and_delayed_records_are_hidden() {
        let now = 1_000;
        let mut pending = record(now);
        pending.tx = Some("tx-1".into());
        assert!(!alive("p/q", now).matches(&pending.to_document().unwrap()));

        let mut delayed = record(now);
        delayed.delay_until = now + 5;
        let doc = delayed.to_document().unwrap();
        assert!(alive("p/q", now).matches(&doc));
        assert!(!free("p/q", now).matches(&doc));
    }

    #[test]
    fn claim_id_is_only_reported_while_active() {
        let now = 1_000;
        let mut held = record(now);
        held.claim_id = Some("c1".into());
        held.claim_expires = now + 30;
        let doc = held.clone().to_document().unwrap();
        assert!(claimed_by("p/q", "c1", now).matches(&doc));
        assert!(!claimed_by("p/q", "c2", now).matches(&doc));
        assert_eq!(held.clone().into_message(now).claim_id, Some(ClaimId::from("c1")));

        held.claim_expires = now;
        let msg = held.into_message(now);
        assert_eq!(msg.claim_id, None);
        assert_eq!(msg.age, 10);
        assert_eq!(msg.id, MessageId::from_marker(7));
    }

    #[test]
    fn foreign_ids_are_dropped_from_key_sets() {
        let ids = [MessageId::from_marker(3), MessageId::from("nope")];
        assert_eq!(keys_for("p/q", &ids), vec!["p/q/3".to_string()]);
    }
}
