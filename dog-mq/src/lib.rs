//! # dog-mq: multi-tenant message broker core
//!
//! Producers post messages into named queues; consumers take them with
//! time-bounded claims and delete what they processed. Delivery is
//! at-least-once: a claim that runs out simply makes its messages free again.
//!
//! ## Layout
//!
//! - **Pools and the catalog**: every queue is pinned to one storage pool on
//!   first write. Pools are chosen by weight within a group or a flavor, and
//!   a queue never moves afterwards.
//! - **Controllers**: [`QueueController`], [`MessageController`] and
//!   [`ClaimController`] are the operation sets. The storage-backed
//!   implementations sit at the end of a [`pipeline`] whose stages can wrap
//!   any call.
//! - **Backends**: documents in collections behind the [`Backend`] trait, with
//!   every call running under the [`RetryExecutor`]. An in-memory driver ships
//!   behind the `memory` feature.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use dog_mq::prelude::*;
//! use serde_json::json;
//!
//! # async fn run() -> BrokerResult<()> {
//! let broker = Broker::builder()
//!     .with_config(BrokerConfig::default().with_pool(Pool::new("primary", "memory://primary")))
//!     .build()
//!     .await?;
//!
//! broker
//!     .messages()
//!     .post("orders", "acme", vec![NewMessage::new(json!({"sku": 42}))], None)
//!     .await?;
//!
//! let claim = broker
//!     .claims()
//!     .create("orders", "acme", &ClaimOptions::new().limit(5))
//!     .await?;
//! for message in &claim.messages {
//!     // process, then delete under the claim
//!     broker
//!         .messages()
//!         .delete("orders", "acme", &message.id, claim.id.as_ref())
//!         .await?;
//! }
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod broker;
pub mod claims;
pub mod clock;
pub mod config;
pub mod cursor;
pub mod encryption;
pub mod error;
pub mod gc;
pub mod messages;
pub mod observability;
pub mod pipeline;
pub mod pooling;
pub mod queues;
pub mod retry;
pub mod types;
pub mod validation;

pub use backend::{Backend, BackendFactory, Document, DriverRegistry, Filter, FindOptions, Sort, Update};
pub use broker::{Broker, BrokerBuilder};
pub use claims::{ClaimController, ClaimStore};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{BrokerConfig, MissingQueueStats, RetryConfig};
pub use cursor::{Cursor, Page};
pub use encryption::{EncryptionStage, MessageCipher};
pub use error::{BackendError, BackendResult, BrokerError, BrokerResult, ErrorKind};
pub use gc::{GcReport, Reaper};
pub use messages::{MessageController, MessageStore};
pub use pipeline::{
    AuditStage, ClaimPipeline, ClaimStage, MessagePipeline, MessageStage, QueuePipeline,
    QueueStage,
};
pub use pooling::{Catalog, PoolRegistry};
pub use queues::{QueueController, QueueStore};
pub use retry::{Guarded, RetryExecutor};
pub use types::{
    Capabilities, Capability, ClaimDetails, ClaimId, ClaimMeta, ClaimOptions, ClaimUpdate,
    Flavor, ListOptions, Message, MessageId, MessageStat, MetadataPatch, NewClaim, NewMessage,
    PatchOp, Pool, QueueMetadata, QueueStats, QueueSummary,
};

#[cfg(feature = "memory")]
pub use backend::memory::{MemoryBackend, MemoryDriver};

#[cfg(feature = "tracing-basic")]
pub use observability::init_tracing;

/// Everything needed to build a broker and call it
pub mod prelude {
    pub use crate::{
        Broker, BrokerConfig, BrokerError, BrokerResult, ClaimController, MessageController,
        QueueController,
    };

    pub use crate::{
        ClaimId, ClaimOptions, ClaimUpdate, Flavor, ListOptions, Message, MessageId,
        MetadataPatch, NewMessage, Pool, QueueMetadata,
    };

    pub use crate::{ClaimStage, MessageStage, QueueStage};

    pub use async_trait::async_trait;
}
