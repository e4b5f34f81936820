//! Claim lifecycle.
//!
//! A claim is a document in the pool's `claims` collection plus a stamp on every
//! message it holds (`claim_id`, `claim_expires`). Taking a message is a
//! conditional update that only matches while the message is free, so two
//! claims racing for the same message cannot both win. Nothing is stored when
//! a claim runs out: once `claim_expires` passes, the filters simply treat the
//! message as free again.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::DateTime;
use futures::TryStreamExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, instrument, warn};

use crate::backend::{Document, Filter, FindOptions, Sort, Update};
use crate::clock::Clock;
use crate::error::{BrokerError, BrokerResult};
use crate::messages::{claimed_by, free, MessageController, MessageRecord, MessageStore, CLAIMS, MESSAGES};
use crate::pooling::Catalog;
use crate::queues::load_metadata;
use crate::retry::Guarded;
use crate::types::{
    scope, ClaimDetails, ClaimId, ClaimMeta, ClaimOptions, ClaimUpdate, Message, NewClaim,
    NewMessage, QueueMetadata,
};
use crate::validation::Validator;

/// Scan rounds per claim; each round retries after losing races to other claimers
const MAX_CLAIM_ROUNDS: usize = 10;

/// Claim operations shared by the storage-backed controller and pipeline stages
#[async_trait]
pub trait ClaimController: Send + Sync {
    /// Claim up to `limit` free messages, lowest ids first.
    ///
    /// An empty queue, or one that does not exist, yields [`NewClaim::empty`].
    async fn create(
        &self,
        queue: &str,
        project: &str,
        options: &ClaimOptions,
    ) -> BrokerResult<NewClaim>;

    async fn get(&self, queue: &str, project: &str, claim: &ClaimId)
        -> BrokerResult<ClaimDetails>;

    /// Move the claim's expiry to `now + ttl`
    async fn update(
        &self,
        queue: &str,
        project: &str,
        claim: &ClaimId,
        update: &ClaimUpdate,
    ) -> BrokerResult<()>;

    /// Release every message at once and drop the claim; idempotent
    async fn delete(&self, queue: &str, project: &str, claim: &ClaimId) -> BrokerResult<()>;
}

/// Stored claim document
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct ClaimRecord {
    #[serde(rename = "_id")]
    pub id: String,
    pub scope: String,
    pub ttl: u64,
    pub grace: u64,
    pub created: i64,
    pub expires: i64,
    #[serde(default)]
    pub message_ids: Vec<String>,
}

impl ClaimRecord {
    fn from_document(doc: Document) -> BrokerResult<Self> {
        Ok(serde_json::from_value(Value::Object(doc))?)
    }

    fn to_document(&self) -> BrokerResult<Document> {
        match serde_json::to_value(self)? {
            Value::Object(map) => Ok(map),
            _ => Err(BrokerError::Serialization("claim record is not an object".into())),
        }
    }

    fn meta(&self, now: i64) -> ClaimMeta {
        ClaimMeta {
            id: ClaimId(self.id.clone()),
            ttl: self.ttl,
            grace: self.grace,
            age: (now - self.created).max(0),
            created_at: DateTime::from_timestamp(self.created, 0).unwrap_or_default(),
            expires_at: DateTime::from_timestamp(self.expires, 0).unwrap_or_default(),
        }
    }
}

pub(crate) fn active_claim(scope: &str, claim: &str, now: i64) -> Filter {
    Filter::id(claim)
        .and(Filter::eq("scope", scope))
        .and(Filter::gt("expires", now))
}

/// Where messages go once they were claimed too often
struct DeadLetter {
    queue: String,
    max_claims: u32,
    ttl: Option<u64>,
}

impl DeadLetter {
    fn from_metadata(meta: &QueueMetadata) -> Option<Self> {
        match (meta.max_claim_count, &meta.dead_letter_queue) {
            (Some(max_claims), Some(queue)) => Some(Self {
                queue: queue.clone(),
                max_claims,
                ttl: meta.dead_letter_queue_messages_ttl,
            }),
            _ => None,
        }
    }
}

/// What one claim may take
struct Grab<'a> {
    claim: &'a ClaimId,
    expires: i64,
    limit: usize,
    dead_letter: Option<&'a DeadLetter>,
}

/// Storage-backed claim controller
pub struct ClaimStore {
    catalog: Arc<Catalog>,
    validator: Validator,
    clock: Arc<dyn Clock>,
    messages: Arc<MessageStore>,
}

impl ClaimStore {
    /// `messages` receives dead-lettered messages
    pub fn new(
        catalog: Arc<Catalog>,
        validator: Validator,
        clock: Arc<dyn Clock>,
        messages: Arc<MessageStore>,
    ) -> Self {
        Self {
            catalog,
            validator,
            clock,
            messages,
        }
    }

    async fn held_messages(
        &self,
        backend: &Guarded,
        scope: &str,
        claim: &ClaimId,
        now: i64,
    ) -> BrokerResult<Vec<Message>> {
        let docs: Vec<Document> = backend
            .find(
                MESSAGES,
                &claimed_by(scope, claim.as_str(), now),
                &FindOptions::sorted(Sort::asc("marker")),
            )
            .await?
            .try_collect()
            .await?;
        docs.into_iter()
            .map(|doc| -> BrokerResult<Message> {
                Ok(MessageRecord::from_document(doc)?.into_message(now))
            })
            .collect()
    }

    async fn active(
        &self,
        backend: &Guarded,
        scope: &str,
        claim: &ClaimId,
        now: i64,
    ) -> BrokerResult<Option<ClaimRecord>> {
        match backend
            .find_one(CLAIMS, &active_claim(scope, claim.as_str(), now))
            .await?
        {
            Some(doc) => Ok(Some(ClaimRecord::from_document(doc)?)),
            None => Ok(None),
        }
    }

    /// Free every message stamped with `claim`
    async fn release(
        &self,
        backend: &Guarded,
        scope: &str,
        claim: &ClaimId,
        now: i64,
    ) -> BrokerResult<u64> {
        let held = Filter::eq("scope", scope).and(Filter::eq("claim_id", claim.as_str()));
        let release = Update::new()
            .set("claim_id", Value::Null)
            .set("claim_expires", now);
        backend.update_many(MESSAGES, &held, &release).await
    }

    /// Post a copy into the dead-letter queue, then drop the original
    async fn dead_letter(
        &self,
        backend: &Guarded,
        project: &str,
        record: &MessageRecord,
        claim: &ClaimId,
        target: &DeadLetter,
    ) -> BrokerResult<()> {
        let copy = NewMessage::new(record.body.clone()).with_ttl(target.ttl.unwrap_or(record.ttl));
        self.messages
            .post(&target.queue, project, vec![copy], record.client_uuid.as_deref())
            .await?;

        let owned = Filter::id(record.id.as_str()).and(Filter::eq("claim_id", claim.as_str()));
        backend.delete_one(MESSAGES, &owned).await?;
        info!(
            message = record.marker,
            claims = record.claim_count,
            dead_letter_queue = %target.queue,
            "message moved to dead letter queue"
        );
        Ok(())
    }

    /// Undo a half-built claim after a failure
    async fn abandon(&self, backend: &Guarded, scope: &str, claim: &ClaimId, now: i64) {
        if let Err(err) = self.release(backend, scope, claim, now).await {
            warn!(claim = %claim, error = %err, "failed to release abandoned claim");
        }
        if let Err(err) = backend.delete_one(CLAIMS, &Filter::id(claim.as_str())).await {
            warn!(claim = %claim, error = %err, "failed to remove abandoned claim");
        }
    }

    /// Stamp free messages with the claim until `limit` are held or none are left
    async fn take(
        &self,
        backend: &Guarded,
        project: &str,
        scope: &str,
        grab: &Grab<'_>,
        now: i64,
    ) -> BrokerResult<Vec<String>> {
        let mut held = Vec::with_capacity(grab.limit);
        for _ in 0..MAX_CLAIM_ROUNDS {
            let remaining = grab.limit - held.len();
            if remaining == 0 {
                break;
            }
            let candidates: Vec<Document> = backend
                .find(
                    MESSAGES,
                    &free(scope, now),
                    &FindOptions::sorted(Sort::asc("marker")).limit(remaining),
                )
                .await?
                .try_collect()
                .await?;
            if candidates.is_empty() {
                break;
            }

            for doc in candidates {
                let record = MessageRecord::from_document(doc)?;
                let still_free = Filter::id(record.id.as_str()).and(free(scope, now));
                let stamp = Update::new()
                    .set("claim_id", grab.claim.as_str())
                    .set("claim_expires", grab.expires)
                    .inc("claim_count", 1);
                if !backend.update_one(MESSAGES, &still_free, &stamp, false).await? {
                    debug!(message = record.marker, "message taken by another claim");
                    continue;
                }

                match grab.dead_letter {
                    Some(dl) if record.claim_count >= dl.max_claims => {
                        self.dead_letter(backend, project, &record, grab.claim, dl).await?;
                    }
                    _ => held.push(record.id),
                }
            }
        }
        Ok(held)
    }

    /// Take messages for a fresh claim and stretch their expiry past its grace.
    /// `None` when nothing was free; any error leaves cleanup to the caller.
    async fn fill(
        &self,
        backend: &Guarded,
        project: &str,
        scope: &str,
        grab: &Grab<'_>,
        message_expires: i64,
        now: i64,
    ) -> BrokerResult<Option<Vec<Message>>> {
        let held = self.take(backend, project, scope, grab, now).await?;
        if held.is_empty() {
            return Ok(None);
        }

        // held messages must outlive the claim by at least the grace period
        let short_lived = Filter::eq("scope", scope)
            .and(Filter::eq("claim_id", grab.claim.as_str()))
            .and(Filter::lt("expires", message_expires));
        backend
            .update_many(MESSAGES, &short_lived, &Update::new().set("expires", message_expires))
            .await?;
        backend
            .update_one(
                CLAIMS,
                &Filter::id(grab.claim.as_str()),
                &Update::new().set("message_ids", json!(held)),
                false,
            )
            .await?;

        let messages = self.held_messages(backend, scope, grab.claim, now).await?;
        Ok(Some(messages))
    }
}

#[async_trait]
impl ClaimController for ClaimStore {
    #[instrument(skip_all, fields(project = %project, queue = %queue))]
    async fn create(
        &self,
        queue: &str,
        project: &str,
        options: &ClaimOptions,
    ) -> BrokerResult<NewClaim> {
        self.validator.queue_identification(queue, project)?;
        let terms = self.validator.claim_creation(options)?;

        let Some(backend) = self.catalog.lookup_backend(project, queue).await? else {
            return Ok(NewClaim::empty());
        };
        let Some(metadata) = load_metadata(&backend, project, queue).await? else {
            return Ok(NewClaim::empty());
        };

        let now = self.clock.timestamp();
        let scope = scope(project, queue);
        let claim = ClaimId::new();
        let claim_expires = now + terms.ttl as i64;
        let message_expires = claim_expires + terms.grace as i64;

        let record = ClaimRecord {
            id: claim.to_string(),
            scope: scope.clone(),
            ttl: terms.ttl,
            grace: terms.grace,
            created: now,
            expires: claim_expires,
            message_ids: Vec::new(),
        };
        backend.insert(CLAIMS, record.to_document()?).await?;

        let dead_letter = DeadLetter::from_metadata(&metadata);
        let grab = Grab {
            claim: &claim,
            expires: claim_expires,
            limit: terms.limit,
            dead_letter: dead_letter.as_ref(),
        };
        let messages = match self
            .fill(&backend, project, &scope, &grab, message_expires, now)
            .await
        {
            Ok(Some(messages)) => messages,
            Ok(None) => {
                backend.delete_one(CLAIMS, &Filter::id(claim.as_str())).await?;
                debug!("nothing to claim");
                return Ok(NewClaim::empty());
            }
            Err(err) => {
                self.abandon(&backend, &scope, &claim, now).await;
                return Err(err);
            }
        };
        info!(claim = %claim, count = messages.len(), ttl = terms.ttl, "claim created");
        Ok(NewClaim {
            id: Some(claim),
            messages,
        })
    }

    async fn get(
        &self,
        queue: &str,
        project: &str,
        claim: &ClaimId,
    ) -> BrokerResult<ClaimDetails> {
        self.validator.queue_identification(queue, project)?;
        let missing = || BrokerError::claim_missing(claim.as_str(), queue, project);
        let backend = self
            .catalog
            .lookup_backend(project, queue)
            .await?
            .ok_or_else(missing)?;

        let now = self.clock.timestamp();
        let scope = scope(project, queue);
        let record = self
            .active(&backend, &scope, claim, now)
            .await?
            .ok_or_else(missing)?;
        let messages = self.held_messages(&backend, &scope, claim, now).await?;
        Ok(ClaimDetails {
            meta: record.meta(now),
            messages,
        })
    }

    #[instrument(skip_all, fields(project = %project, queue = %queue, claim = %claim))]
    async fn update(
        &self,
        queue: &str,
        project: &str,
        claim: &ClaimId,
        update: &ClaimUpdate,
    ) -> BrokerResult<()> {
        self.validator.queue_identification(queue, project)?;
        self.validator.claim_updating(update)?;
        let missing = || BrokerError::claim_missing(claim.as_str(), queue, project);
        let backend = self
            .catalog
            .lookup_backend(project, queue)
            .await?
            .ok_or_else(missing)?;

        let now = self.clock.timestamp();
        let scope = scope(project, queue);
        let current = self
            .active(&backend, &scope, claim, now)
            .await?
            .ok_or_else(missing)?;

        let grace = update.grace.unwrap_or(current.grace);
        let claim_expires = now + update.ttl as i64;
        let message_expires = claim_expires + grace as i64;

        let renewed = backend
            .update_one(
                CLAIMS,
                &active_claim(&scope, claim.as_str(), now),
                &Update::new()
                    .set("ttl", update.ttl)
                    .set("grace", grace)
                    .set("expires", claim_expires),
                false,
            )
            .await?;
        if !renewed {
            return Err(missing());
        }

        backend
            .update_many(
                MESSAGES,
                &claimed_by(&scope, claim.as_str(), now),
                &Update::new().set("claim_expires", claim_expires),
            )
            .await?;
        let short_lived = Filter::eq("scope", scope.as_str())
            .and(Filter::eq("claim_id", claim.as_str()))
            .and(Filter::lt("expires", message_expires));
        backend
            .update_many(MESSAGES, &short_lived, &Update::new().set("expires", message_expires))
            .await?;

        debug!(ttl = update.ttl, grace, "claim renewed");
        Ok(())
    }

    #[instrument(skip_all, fields(project = %project, queue = %queue, claim = %claim))]
    async fn delete(&self, queue: &str, project: &str, claim: &ClaimId) -> BrokerResult<()> {
        self.validator.queue_identification(queue, project)?;
        let Some(backend) = self.catalog.lookup_backend(project, queue).await? else {
            return Ok(());
        };

        let now = self.clock.timestamp();
        let scope = scope(project, queue);
        let released = self.release(&backend, &scope, claim, now).await?;
        backend
            .delete_one(
                CLAIMS,
                &Filter::id(claim.as_str()).and(Filter::eq("scope", scope.as_str())),
            )
            .await?;
        debug!(released, "claim released");
        Ok(())
    }
}
