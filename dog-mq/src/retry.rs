//! Bounded retry around backend calls.
//!
//! Transient failures are retried up to `max_attempts` times with a uniform
//! random sleep plus jitter; lost connections are retried up to
//! `max_reconnect_attempts` times with exponential backoff. Anything else is
//! returned at once. Callers above this layer only ever see [`BrokerError`].

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tracing::{error, warn};

use crate::backend::{Backend, BoxStream, Document, Filter, FindOptions, Sort, Update};
use crate::config::RetryConfig;
use crate::error::{BackendResult, BrokerError, BrokerResult, RetryClass};
use crate::types::Capabilities;

/// Runs backend calls under the configured retry policy
#[derive(Debug, Clone)]
pub struct RetryExecutor {
    config: RetryConfig,
}

impl RetryExecutor {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// `uniform(0, max_retry_sleep) + uniform(0, max_retry_jitter)`
    pub fn jittered_delay(&self) -> Duration {
        let mut rng = rand::thread_rng();
        self.config.max_retry_sleep.mul_f64(rng.gen::<f64>())
            + self.config.max_retry_jitter.mul_f64(rng.gen::<f64>())
    }

    /// `reconnect_sleep * 2^attempt`, attempt counted from zero
    pub fn reconnect_delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.config.reconnect_sleep.saturating_mul(factor)
    }

    /// Sleep between two attempts of a caller-driven retry loop
    pub async fn backoff(&self) {
        let delay = self.jittered_delay();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }

    /// Call `op` until it succeeds, fails permanently, or exhausts its class's attempts
    pub async fn run<T, F, Fut>(&self, op: &'static str, mut call: F) -> BrokerResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = BackendResult<T>>,
    {
        let mut transient = 0u32;
        let mut failover = 0u32;

        loop {
            let err = match call().await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            let (attempt, limit, delay) = match err.retry_class() {
                RetryClass::Never => return Err(BrokerError::Backend(err)),
                RetryClass::Transient => {
                    transient += 1;
                    (transient, self.config.max_attempts, self.jittered_delay())
                }
                RetryClass::Failover => {
                    let delay = self.reconnect_delay(failover);
                    failover += 1;
                    (failover, self.config.max_reconnect_attempts, delay)
                }
            };

            if attempt >= limit {
                let attempts = transient + failover;
                error!(op, attempts, error = %err, "backend retries exhausted");
                return Err(BrokerError::RetriesExhausted {
                    op,
                    attempts,
                    source: err,
                });
            }

            warn!(op, attempt, ?delay, error = %err, "retrying backend call");
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
        }
    }
}

impl Default for RetryExecutor {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}

/// A backend handle whose calls go through a [`RetryExecutor`]
#[derive(Clone)]
pub struct Guarded {
    backend: Arc<dyn Backend>,
    executor: RetryExecutor,
}

impl Guarded {
    pub fn new(backend: Arc<dyn Backend>, executor: RetryExecutor) -> Self {
        Self { backend, executor }
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    pub fn executor(&self) -> &RetryExecutor {
        &self.executor
    }

    pub async fn insert(&self, collection: &str, doc: Document) -> BrokerResult<String> {
        let backend = &self.backend;
        self.executor
            .run("insert", move || backend.insert(collection, doc.clone()))
            .await
    }

    pub async fn insert_many(
        &self,
        collection: &str,
        docs: Vec<Document>,
    ) -> BrokerResult<Vec<String>> {
        let backend = &self.backend;
        self.executor
            .run("insert_many", move || backend.insert_many(collection, docs.clone()))
            .await
    }

    pub async fn find_one(&self, collection: &str, filter: &Filter) -> BrokerResult<Option<Document>> {
        let backend = &self.backend;
        self.executor
            .run("find_one", move || backend.find_one(collection, filter))
            .await
    }

    pub async fn find(
        &self,
        collection: &str,
        filter: &Filter,
        options: &FindOptions,
    ) -> BrokerResult<BoxStream<BackendResult<Document>>> {
        let backend = &self.backend;
        self.executor
            .run("find", move || backend.find(collection, filter, options))
            .await
    }

    pub async fn count(&self, collection: &str, filter: &Filter) -> BrokerResult<u64> {
        let backend = &self.backend;
        self.executor
            .run("count", move || backend.count(collection, filter))
            .await
    }

    pub async fn update_one(
        &self,
        collection: &str,
        filter: &Filter,
        update: &Update,
        upsert: bool,
    ) -> BrokerResult<bool> {
        let backend = &self.backend;
        self.executor
            .run("update_one", move || {
                backend.update_one(collection, filter, update, upsert)
            })
            .await
    }

    pub async fn update_many(
        &self,
        collection: &str,
        filter: &Filter,
        update: &Update,
    ) -> BrokerResult<u64> {
        let backend = &self.backend;
        self.executor
            .run("update_many", move || backend.update_many(collection, filter, update))
            .await
    }

    pub async fn delete_one(&self, collection: &str, filter: &Filter) -> BrokerResult<u64> {
        let backend = &self.backend;
        self.executor
            .run("delete_one", move || backend.delete_one(collection, filter))
            .await
    }

    pub async fn delete_many(&self, collection: &str, filter: &Filter) -> BrokerResult<u64> {
        let backend = &self.backend;
        self.executor
            .run("delete_many", move || backend.delete_many(collection, filter))
            .await
    }

    pub async fn find_and_delete_many(
        &self,
        collection: &str,
        filter: &Filter,
        sort: Option<&Sort>,
        limit: usize,
    ) -> BrokerResult<Vec<Document>> {
        let backend = &self.backend;
        self.executor
            .run("find_and_delete_many", move || {
                backend.find_and_delete_many(collection, filter, sort, limit)
            })
            .await
    }

    pub fn capabilities(&self) -> Capabilities {
        self.backend.capabilities()
    }

    pub async fn is_alive(&self) -> bool {
        self.backend.is_alive().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BackendError;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn executor(max_attempts: u32, max_reconnect_attempts: u32) -> RetryExecutor {
        RetryExecutor::new(RetryConfig::immediate(max_attempts, max_reconnect_attempts))
    }

    #[test]
    fn reconnect_delay_doubles() {
        let exec = RetryExecutor::new(RetryConfig {
            reconnect_sleep: Duration::from_millis(20),
            ..RetryConfig::default()
        });
        assert_eq!(exec.reconnect_delay(0), Duration::from_millis(20));
        assert_eq!(exec.reconnect_delay(3), Duration::from_millis(160));
        assert!(exec.reconnect_delay(64) >= exec.reconnect_delay(31));
    }

    #[test]
    fn jittered_delay_stays_in_bounds() {
        let exec = RetryExecutor::default();
        let ceiling = exec.config().max_retry_sleep + exec.config().max_retry_jitter;
        for _ in 0..100 {
            assert!(exec.jittered_delay() <= ceiling);
        }
    }

    #[tokio::test]
    async fn transient_failures_are_retried_until_success() {
        let calls = AtomicU32::new(0);
        let result = executor(5, 5)
            .run("op", || async {
                if calls.fetch_add(1, Ordering::SeqCst) < 3 {
                    Err(BackendError::Unavailable("busy".into()))
                } else {
                    Ok(7)
                }
            })
            .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn permanent_failures_are_not_retried() {
        let calls = AtomicU32::new(0);
        let err = executor(5, 5)
            .run("op", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(BackendError::Internal("boom".into()))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::Backend(BackendError::Internal(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhaustion_keeps_the_original_error() {
        let calls = AtomicU32::new(0);
        let err = executor(5, 3)
            .run("op", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(BackendError::ConnectionLost("reset".into()))
            })
            .await
            .unwrap_err();
        match err {
            BrokerError::RetriesExhausted { op, attempts, source } => {
                assert_eq!(op, "op");
                assert_eq!(attempts, 3);
                assert_eq!(source, BackendError::ConnectionLost("reset".into()));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
