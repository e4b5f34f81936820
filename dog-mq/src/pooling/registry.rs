use std::collections::HashMap;

use futures::TryStreamExt;
use parking_lot::RwLock;
use serde_json::Value;
use tracing::{debug, info, instrument};

use crate::backend::{Document, DriverRegistry, Filter, FindOptions, Sort, Update, ID};
use crate::error::{BrokerError, BrokerResult};
use crate::pooling::select;
use crate::retry::{Guarded, RetryExecutor};
use crate::types::{capabilities, Capabilities, Flavor, Pool};

pub(crate) const POOLS: &str = "pools";
pub(crate) const FLAVORS: &str = "flavors";

/// Pool and flavor registrations, persisted in the control store.
///
/// Also owns one connected backend per pool, created on first use.
pub struct PoolRegistry {
    control: Guarded,
    drivers: DriverRegistry,
    executor: RetryExecutor,
    connections: RwLock<HashMap<String, Guarded>>,
}

fn to_document<T: serde::Serialize>(value: &T) -> BrokerResult<Document> {
    match serde_json::to_value(value)? {
        Value::Object(map) => Ok(map),
        other => Err(BrokerError::Serialization(format!(
            "expected an object, got {other}"
        ))),
    }
}

fn from_document<T: serde::de::DeserializeOwned>(mut doc: Document) -> BrokerResult<T> {
    doc.remove(ID);
    Ok(serde_json::from_value(Value::Object(doc))?)
}

impl PoolRegistry {
    pub fn new(control: Guarded, drivers: DriverRegistry, executor: RetryExecutor) -> Self {
        Self {
            control,
            drivers,
            executor,
            connections: RwLock::new(HashMap::new()),
        }
    }

    /// Declared capabilities, or the driver's when none were declared
    pub fn effective_capabilities(&self, pool: &Pool) -> BrokerResult<Capabilities> {
        if !pool.capabilities.is_empty() {
            return Ok(pool.capabilities.clone());
        }
        Ok(self.drivers.for_pool(pool)?.capabilities())
    }

    /// Insert or replace a pool
    #[instrument(skip(self, pool), fields(pool = %pool.name))]
    pub async fn register_pool(&self, pool: Pool) -> BrokerResult<()> {
        if pool.name.trim().is_empty() {
            return Err(BrokerError::validation("pool name must not be empty"));
        }

        let driver = self.drivers.for_pool(&pool)?;
        let supported = driver.capabilities();
        if !pool.capabilities.is_subset(&supported) {
            return Err(BrokerError::CapabilityMismatch(format!(
                "pool {} declares {} but its {} driver supports {}",
                pool.name,
                capabilities::describe(&pool.capabilities),
                driver.scheme(),
                capabilities::describe(&supported)
            )));
        }

        let effective = self.effective_capabilities(&pool)?;
        for other in self.pools_in_group(pool.group.as_deref()).await? {
            if other.name == pool.name {
                continue;
            }
            let theirs = self.effective_capabilities(&other)?;
            if theirs != effective {
                return Err(BrokerError::CapabilityMismatch(format!(
                    "pool {} offers {} but pool {} in the same group offers {}",
                    pool.name,
                    capabilities::describe(&effective),
                    other.name,
                    capabilities::describe(&theirs)
                )));
            }
        }

        let mut update = Update::new();
        for (k, v) in to_document(&pool)? {
            update = update.set(&k, v);
        }
        self.control
            .update_one(POOLS, &Filter::id(pool.name.as_str()), &update, true)
            .await?;

        // uri or options may have changed
        self.connections.write().remove(&pool.name);
        info!(uri = %pool.uri, weight = pool.weight, group = ?pool.group, "pool registered");
        Ok(())
    }

    pub async fn get_pool(&self, name: &str) -> BrokerResult<Pool> {
        match self.control.find_one(POOLS, &Filter::id(name)).await? {
            Some(doc) => from_document(doc),
            None => Err(BrokerError::PoolDoesNotExist(name.to_string())),
        }
    }

    pub async fn list_pools(&self) -> BrokerResult<Vec<Pool>> {
        self.find_pools(&Filter::All).await
    }

    /// Remove a pool; refused while a flavor lists it
    #[instrument(skip(self))]
    pub async fn delete_pool(&self, name: &str) -> BrokerResult<()> {
        // pool_list is an array, so membership is checked here rather than in a filter
        for flavor in self.list_flavors().await? {
            if flavor.pool_list.iter().any(|p| p == name) {
                return Err(BrokerError::PoolInUseByFlavor {
                    pool: name.to_string(),
                    flavor: flavor.name,
                });
            }
        }

        let removed = self.control.delete_one(POOLS, &Filter::id(name)).await?;
        self.connections.write().remove(name);
        if removed > 0 {
            info!("pool deleted");
        }
        Ok(())
    }

    /// Weighted choice among the pools of a group (`None` is the ungrouped set)
    pub async fn select_pool(&self, group: Option<&str>) -> BrokerResult<Pool> {
        let pools = self.pools_in_group(group).await?;
        let chosen = select::weighted(&pools, &mut rand::thread_rng()).cloned();
        chosen.ok_or(BrokerError::NoPoolFound)
    }

    /// Weighted choice among the pools serving a flavor
    pub async fn select_flavor_pool(&self, flavor: &str) -> BrokerResult<Pool> {
        let flavor = self.get_flavor(flavor).await?;
        let pools: Vec<Pool> = self
            .list_pools()
            .await?
            .into_iter()
            .filter(|p| {
                flavor.pool_list.contains(&p.name) || p.flavor.as_deref() == Some(flavor.name.as_str())
            })
            .collect();
        let chosen = select::weighted(&pools, &mut rand::thread_rng()).cloned();
        chosen.ok_or(BrokerError::NoPoolFound)
    }

    #[instrument(skip(self, flavor), fields(flavor = %flavor.name))]
    pub async fn register_flavor(&self, flavor: Flavor) -> BrokerResult<()> {
        if flavor.name.trim().is_empty() {
            return Err(BrokerError::validation("flavor name must not be empty"));
        }
        if flavor.pool_list.is_empty() {
            return Err(BrokerError::validation(format!(
                "flavor {} must list at least one pool",
                flavor.name
            )));
        }
        for name in &flavor.pool_list {
            let pool = self.get_pool(name).await?;
            let offered = self.effective_capabilities(&pool)?;
            if !flavor.capabilities.is_subset(&offered) {
                return Err(BrokerError::CapabilityMismatch(format!(
                    "flavor {} requires {} but pool {} offers {}",
                    flavor.name,
                    capabilities::describe(&flavor.capabilities),
                    pool.name,
                    capabilities::describe(&offered)
                )));
            }
        }

        let mut update = Update::new();
        for (k, v) in to_document(&flavor)? {
            update = update.set(&k, v);
        }
        self.control
            .update_one(FLAVORS, &Filter::id(flavor.name.as_str()), &update, true)
            .await?;
        info!(pools = ?flavor.pool_list, "flavor registered");
        Ok(())
    }

    pub async fn get_flavor(&self, name: &str) -> BrokerResult<Flavor> {
        match self.control.find_one(FLAVORS, &Filter::id(name)).await? {
            Some(doc) => from_document(doc),
            None => Err(BrokerError::FlavorDoesNotExist(name.to_string())),
        }
    }

    pub async fn list_flavors(&self) -> BrokerResult<Vec<Flavor>> {
        let docs: Vec<Document> = self
            .control
            .find(FLAVORS, &Filter::All, &FindOptions::sorted(Sort::asc(ID)))
            .await?
            .try_collect()
            .await?;
        docs.into_iter().map(from_document).collect()
    }

    pub async fn delete_flavor(&self, name: &str) -> BrokerResult<()> {
        self.control.delete_one(FLAVORS, &Filter::id(name)).await?;
        Ok(())
    }

    /// Connected, retry-guarded backend for a registered pool
    pub async fn connect(&self, name: &str) -> BrokerResult<Guarded> {
        if let Some(conn) = self.connections.read().get(name) {
            return Ok(conn.clone());
        }

        let pool = self.get_pool(name).await?;
        let driver = self.drivers.for_pool(&pool)?;
        let backend = self
            .executor
            .run("connect", || driver.connect(&pool))
            .await?;
        let guarded = Guarded::new(backend, self.executor.clone());
        debug!(pool = name, "connected pool backend");

        Ok(self
            .connections
            .write()
            .entry(name.to_string())
            .or_insert(guarded)
            .clone())
    }

    /// Every connected pool backend, connecting as needed
    pub async fn connect_all(&self) -> BrokerResult<Vec<(String, Guarded)>> {
        let mut out = Vec::new();
        for pool in self.list_pools().await? {
            let conn = self.connect(&pool.name).await?;
            out.push((pool.name, conn));
        }
        Ok(out)
    }

    pub(crate) fn control(&self) -> &Guarded {
        &self.control
    }

    async fn pools_in_group(&self, group: Option<&str>) -> BrokerResult<Vec<Pool>> {
        let filter = match group {
            Some(g) => Filter::eq("group", g),
            None => Filter::Eq("group".into(), Value::Null),
        };
        self.find_pools(&filter).await
    }

    async fn find_pools(&self, filter: &Filter) -> BrokerResult<Vec<Pool>> {
        let docs: Vec<Document> = self
            .control
            .find(POOLS, filter, &FindOptions::sorted(Sort::asc(ID)))
            .await?
            .try_collect()
            .await?;
        docs.into_iter().map(from_document).collect()
    }
}
