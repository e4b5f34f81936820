use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{MessageId, QueueMetadata};

/// One entry of a queue listing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueSummary {
    pub name: String,
    /// Present only for detailed listings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<QueueMetadata>,
}

/// Age information for the oldest or newest message in a queue
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageStat {
    pub id: MessageId,
    pub age: i64,
    pub created: DateTime<Utc>,
}

/// Message counts for one queue, computed at call time
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub claimed: u64,
    pub free: u64,
    pub total: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oldest: Option<MessageStat>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub newest: Option<MessageStat>,
}
