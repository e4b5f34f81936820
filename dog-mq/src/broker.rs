use std::sync::Arc;

use tracing::{info, warn};

use crate::backend::{Backend, BackendFactory, DriverRegistry};
use crate::claims::{ClaimController, ClaimStore};
use crate::clock::{Clock, SystemClock};
use crate::config::BrokerConfig;
use crate::encryption::{EncryptionStage, MessageCipher};
use crate::error::BrokerResult;
use crate::gc::{GcReport, Reaper};
use crate::messages::{MessageController, MessageStore};
use crate::pipeline::{
    ClaimPipeline, ClaimStage, MessagePipeline, MessageStage, QueuePipeline, QueueStage,
};
use crate::pooling::{Catalog, PoolRegistry};
use crate::queues::{QueueController, QueueStore};
use crate::retry::{Guarded, RetryExecutor};
use crate::validation::Validator;

/// One broker instance: the pool registry, the catalog and the three
/// controller pipelines, all sharing one configuration and clock.
pub struct Broker {
    config: Arc<BrokerConfig>,
    clock: Arc<dyn Clock>,
    registry: Arc<PoolRegistry>,
    catalog: Arc<Catalog>,
    queues: QueuePipeline,
    messages: MessagePipeline,
    claims: ClaimPipeline,
}

impl Broker {
    pub fn builder() -> BrokerBuilder {
        BrokerBuilder::default()
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn queues(&self) -> &dyn QueueController {
        &self.queues
    }

    pub fn messages(&self) -> &dyn MessageController {
        &self.messages
    }

    pub fn claims(&self) -> &dyn ClaimController {
        &self.claims
    }

    /// Pool and flavor management
    pub fn pools(&self) -> &Arc<PoolRegistry> {
        &self.registry
    }

    pub fn catalog(&self) -> &Arc<Catalog> {
        &self.catalog
    }

    /// A reaper over this broker's pools, for running in the background
    pub fn reaper(&self) -> Reaper {
        Reaper::new(self.registry.clone(), self.clock.clone())
    }

    /// Purge expired rows from every pool now
    pub async fn gc(&self) -> BrokerResult<GcReport> {
        self.reaper().reap().await
    }

    /// Control store and every registered pool answer
    pub async fn is_alive(&self) -> bool {
        if !self.registry.control().is_alive().await {
            warn!("control store is not responding");
            return false;
        }
        let pools = match self.registry.connect_all().await {
            Ok(pools) => pools,
            Err(err) => {
                warn!(error = %err, "could not reach pool backends");
                return false;
            }
        };
        for (name, backend) in pools {
            if !backend.is_alive().await {
                warn!(pool = %name, "pool backend is not responding");
                return false;
            }
        }
        true
    }
}

/// Assembles a [`Broker`]; pools and flavors from the config are registered on build
pub struct BrokerBuilder {
    config: BrokerConfig,
    clock: Option<Arc<dyn Clock>>,
    control: Option<Arc<dyn Backend>>,
    drivers: DriverRegistry,
    queue_stages: Vec<Arc<dyn QueueStage>>,
    message_stages: Vec<Arc<dyn MessageStage>>,
    claim_stages: Vec<Arc<dyn ClaimStage>>,
}

impl Default for BrokerBuilder {
    fn default() -> Self {
        Self {
            config: BrokerConfig::default(),
            clock: None,
            control: None,
            drivers: DriverRegistry::with_builtin(),
            queue_stages: Vec::new(),
            message_stages: Vec::new(),
            claim_stages: Vec::new(),
        }
    }
}

impl BrokerBuilder {
    pub fn with_config(mut self, config: BrokerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Store for pools, flavors and the catalog; in-memory when not set
    pub fn with_control(mut self, control: Arc<dyn Backend>) -> Self {
        self.control = Some(control);
        self
    }

    /// Replace the driver set, including the built-in drivers
    pub fn with_drivers(mut self, drivers: DriverRegistry) -> Self {
        self.drivers = drivers;
        self
    }

    pub fn with_driver(mut self, driver: Arc<dyn BackendFactory>) -> Self {
        self.drivers.register(driver);
        self
    }

    pub fn with_queue_stage(mut self, stage: Arc<dyn QueueStage>) -> Self {
        self.queue_stages.push(stage);
        self
    }

    pub fn with_message_stage(mut self, stage: Arc<dyn MessageStage>) -> Self {
        self.message_stages.push(stage);
        self
    }

    pub fn with_claim_stage(mut self, stage: Arc<dyn ClaimStage>) -> Self {
        self.claim_stages.push(stage);
        self
    }

    #[cfg(feature = "memory")]
    fn default_control() -> BrokerResult<Arc<dyn Backend>> {
        let control: Arc<dyn Backend> = Arc::new(crate::backend::memory::MemoryBackend::new());
        Ok(control)
    }

    #[cfg(not(feature = "memory"))]
    fn default_control() -> BrokerResult<Arc<dyn Backend>> {
        Err(crate::error::BrokerError::InvalidConfig(
            "no control store configured and the memory driver is disabled".into(),
        ))
    }

    pub async fn build(self) -> BrokerResult<Broker> {
        self.config.validate()?;
        let config = Arc::new(self.config);
        let clock = self
            .clock
            .unwrap_or_else(|| Arc::new(SystemClock) as Arc<dyn Clock>);
        let executor = RetryExecutor::new(config.retry.clone());

        let control = match self.control {
            Some(control) => control,
            None => Self::default_control()?,
        };
        let registry = Arc::new(PoolRegistry::new(
            Guarded::new(control, executor.clone()),
            self.drivers,
            executor,
        ));
        for pool in &config.pools {
            registry.register_pool(pool.clone()).await?;
        }
        for flavor in &config.flavors {
            registry.register_flavor(flavor.clone()).await?;
        }

        let catalog = Arc::new(Catalog::new(
            registry.clone(),
            config.default_pool_group.clone(),
        ));
        let validator = Validator::new(config.clone());

        let queue_store = Arc::new(QueueStore::new(
            catalog.clone(),
            validator.clone(),
            clock.clone(),
        ));
        let message_store = Arc::new(MessageStore::new(
            catalog.clone(),
            validator.clone(),
            clock.clone(),
        ));
        let claim_store = ClaimStore::new(
            catalog.clone(),
            validator,
            clock.clone(),
            message_store.clone(),
        );

        let mut message_stages = self.message_stages;
        let mut claim_stages = self.claim_stages;
        if let Some(secret) = &config.message_encryption_key {
            // innermost, so every other stage sees plain bodies
            let stage = Arc::new(EncryptionStage::new(
                MessageCipher::new(secret),
                queue_store.clone(),
            ));
            message_stages.push(stage.clone());
            claim_stages.push(stage);
        }

        let queues = self
            .queue_stages
            .into_iter()
            .fold(QueuePipeline::new(queue_store), QueuePipeline::with_stage);
        let messages = message_stages
            .into_iter()
            .fold(MessagePipeline::new(message_store), MessagePipeline::with_stage);
        let claims = claim_stages
            .into_iter()
            .fold(ClaimPipeline::new(Arc::new(claim_store)), ClaimPipeline::with_stage);

        info!(
            pools = config.pools.len(),
            flavors = config.flavors.len(),
            stages = queues.len() + messages.len() + claims.len(),
            "broker ready"
        );
        Ok(Broker {
            config,
            clock,
            registry,
            catalog,
            queues,
            messages,
            claims,
        })
    }
}
