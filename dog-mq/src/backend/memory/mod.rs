//! In-memory pool driver (`memory://` URIs).

mod storage;

pub use storage::MemoryBackend;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::debug;

use crate::backend::{Backend, BackendFactory};
use crate::error::BackendResult;
use crate::types::{Capabilities, Pool};

/// Driver for `memory://` pools.
///
/// Pools with the same URI share one backend, so re-registering a pool or
/// rebuilding the catalog cache keeps its data.
#[derive(Default)]
pub struct MemoryDriver {
    instances: Mutex<HashMap<String, Arc<MemoryBackend>>>,
}

impl MemoryDriver {
    pub const SCHEME: &'static str = "memory";

    pub fn new() -> Self {
        Self::default()
    }

    /// The backend behind a URI, creating it on first use
    pub fn backend(&self, uri: &str) -> Arc<MemoryBackend> {
        self.instances
            .lock()
            .entry(uri.to_string())
            .or_insert_with(|| {
                debug!(uri, "creating in-memory backend");
                Arc::new(MemoryBackend::new())
            })
            .clone()
    }
}

#[async_trait]
impl BackendFactory for MemoryDriver {
    fn scheme(&self) -> &'static str {
        Self::SCHEME
    }

    fn capabilities(&self) -> Capabilities {
        MemoryBackend::new().capabilities()
    }

    async fn connect(&self, pool: &Pool) -> BackendResult<Arc<dyn Backend>> {
        Ok(self.backend(&pool.uri))
    }
}
