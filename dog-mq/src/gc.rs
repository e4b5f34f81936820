//! Physical cleanup of rows whose computed state is already gone.
//!
//! Expired messages and claims are invisible to every read, so nothing here is
//! needed for correctness; the reaper only gives the space back.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::time::interval;
use tracing::{debug, info, warn};

use crate::backend::Filter;
use crate::clock::Clock;
use crate::error::BrokerResult;
use crate::messages::{CLAIMS, MESSAGES};
use crate::pooling::PoolRegistry;

/// Batch rows still tagged with a transaction after this long belong to a dead poster
const ABANDONED_BATCH_AGE: i64 = 60;

const DEFAULT_INTERVAL: Duration = Duration::from_secs(30);

/// Rows removed by one sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GcReport {
    pub messages: u64,
    pub claims: u64,
    /// Messages of batches that were never finalised
    pub abandoned: u64,
}

impl GcReport {
    pub fn total(&self) -> u64 {
        self.messages + self.claims + self.abandoned
    }
}

/// Sweeps expired rows out of every pool
pub struct Reaper {
    registry: Arc<PoolRegistry>,
    clock: Arc<dyn Clock>,
    interval: Duration,
}

impl Reaper {
    pub fn new(registry: Arc<PoolRegistry>, clock: Arc<dyn Clock>) -> Self {
        Self {
            registry,
            clock,
            interval: DEFAULT_INTERVAL,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// One sweep over all pools
    pub async fn reap(&self) -> BrokerResult<GcReport> {
        let now = self.clock.timestamp();
        let expired = Filter::lte("expires", now);
        let abandoned = Filter::Ne("tx".into(), Value::Null)
            .and(Filter::lt("created", now - ABANDONED_BATCH_AGE));

        let mut report = GcReport::default();
        for (pool, backend) in self.registry.connect_all().await? {
            let messages = backend.delete_many(MESSAGES, &expired).await?;
            let claims = backend.delete_many(CLAIMS, &expired).await?;
            let batches = backend.delete_many(MESSAGES, &abandoned).await?;
            debug!(pool = %pool, messages, claims, abandoned = batches, "pool swept");

            report.messages += messages;
            report.claims += claims;
            report.abandoned += batches;
        }
        Ok(report)
    }

    /// Sweep every `interval` until the task is dropped
    pub async fn start(self) -> BrokerResult<()> {
        let mut ticker = interval(self.interval);
        info!(interval = ?self.interval, "starting reaper");

        loop {
            ticker.tick().await;
            match self.reap().await {
                Ok(report) if report.total() > 0 => {
                    info!(
                        messages = report.messages,
                        claims = report.claims,
                        abandoned = report.abandoned,
                        "reclaimed expired rows"
                    );
                }
                Ok(_) => debug!("nothing to reclaim"),
                Err(err) => warn!(error = %err, "reaper sweep failed"),
            }
        }
    }
}
