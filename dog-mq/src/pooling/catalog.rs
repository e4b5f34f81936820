use std::sync::Arc;

use serde_json::json;
use tracing::{debug, info, instrument};

use crate::backend::{Document, Filter};
use crate::error::{BrokerError, BrokerResult};
use crate::pooling::PoolRegistry;
use crate::retry::Guarded;
use crate::types::scope;

pub(crate) const CATALOGUE: &str = "catalogue";

/// Routes each (project, queue) to the pool that stores it.
///
/// Entries are written once with create-if-absent and never rewritten, so a
/// queue stays on its pool even after weights or group membership change.
pub struct Catalog {
    registry: Arc<PoolRegistry>,
    default_group: Option<String>,
}

impl Catalog {
    pub fn new(registry: Arc<PoolRegistry>, default_group: Option<String>) -> Self {
        Self {
            registry,
            default_group,
        }
    }

    pub fn registry(&self) -> &Arc<PoolRegistry> {
        &self.registry
    }

    /// Pool serving a queue, if one was ever assigned
    pub async fn lookup(&self, project: &str, queue: &str) -> BrokerResult<Option<String>> {
        let entry = self
            .registry
            .control()
            .find_one(CATALOGUE, &Filter::id(scope(project, queue)))
            .await?;
        Ok(entry.and_then(|doc| doc.get("pool").and_then(|p| p.as_str()).map(str::to_string)))
    }

    /// Backend for reads; `None` means the queue was never written
    pub async fn lookup_backend(&self, project: &str, queue: &str) -> BrokerResult<Option<Guarded>> {
        match self.lookup(project, queue).await? {
            Some(pool) => Ok(Some(self.registry.connect(&pool).await?)),
            None => Ok(None),
        }
    }

    /// Pool for a write, assigning one on first use.
    ///
    /// Concurrent first resolutions converge: the losing insert reads back the
    /// winner's entry instead of overwriting it.
    #[instrument(skip(self))]
    pub async fn resolve(
        &self,
        project: &str,
        queue: &str,
        flavor: Option<&str>,
    ) -> BrokerResult<String> {
        if let Some(pool) = self.lookup(project, queue).await? {
            return Ok(pool);
        }

        let chosen = match flavor {
            Some(flavor) => self.registry.select_flavor_pool(flavor).await?,
            None => self.registry.select_pool(self.default_group.as_deref()).await?,
        };

        let mut entry = Document::new();
        entry.insert("_id".into(), json!(scope(project, queue)));
        entry.insert("project".into(), json!(project));
        entry.insert("queue".into(), json!(queue));
        entry.insert("pool".into(), json!(chosen.name));

        match self.registry.control().insert(CATALOGUE, entry).await {
            Ok(_) => {
                info!(pool = %chosen.name, "queue routed to pool");
                Ok(chosen.name)
            }
            Err(BrokerError::Backend(err)) if err.is_duplicate_key() => {
                debug!("lost catalogue race, reading back existing entry");
                self.lookup(project, queue)
                    .await?
                    .ok_or(BrokerError::NoPoolFound)
            }
            Err(err) => Err(err),
        }
    }

    /// Backend for writes, assigning a pool on first use
    pub async fn resolve_backend(
        &self,
        project: &str,
        queue: &str,
        flavor: Option<&str>,
    ) -> BrokerResult<Guarded> {
        let pool = self.resolve(project, queue, flavor).await?;
        self.registry.connect(&pool).await
    }

    /// Drop a queue's route; idempotent
    pub async fn forget(&self, project: &str, queue: &str) -> BrokerResult<()> {
        self.registry
            .control()
            .delete_one(CATALOGUE, &Filter::id(scope(project, queue)))
            .await?;
        debug!(project, queue, "catalogue entry removed");
        Ok(())
    }
}
