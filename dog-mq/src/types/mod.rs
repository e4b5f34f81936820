pub mod capabilities;
pub mod claim;
pub mod ids;
pub mod message;
pub mod metadata;
pub mod pool;
pub mod queue;

pub use capabilities::{Capabilities, Capability};
pub use claim::{ClaimDetails, ClaimMeta, ClaimOptions, ClaimUpdate, NewClaim};
pub use ids::{ClaimId, MessageId};
pub(crate) use ids::scope;
pub use message::{ListOptions, Message, NewMessage};
pub use metadata::{MetadataPatch, PatchOp, QueueMetadata};
pub use pool::{Flavor, Pool};
pub use queue::{MessageStat, QueueStats, QueueSummary};
