use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{ClaimId, MessageId};

/// A message as submitted by a producer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewMessage {
    pub body: Value,

    /// Seconds until the message expires; queue default when omitted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<u64>,

    /// Seconds the message stays invisible after posting; queue default when omitted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay: Option<u64>,
}

impl NewMessage {
    pub fn new(body: Value) -> Self {
        Self {
            body,
            ttl: None,
            delay: None,
        }
    }

    pub fn with_ttl(mut self, ttl: u64) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn with_delay(mut self, delay: u64) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Serialized body size, counted against post size limits
    pub fn body_len(&self) -> usize {
        serde_json::to_vec(&self.body).map(|v| v.len()).unwrap_or(usize::MAX)
    }
}

/// A stored message as seen by a consumer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub body: Value,
    pub ttl: u64,
    /// Seconds since the message was posted
    pub age: i64,
    pub created_at: DateTime<Utc>,
    /// Set only while a claim is active on the message
    pub claim_id: Option<ClaimId>,
    /// How many claims have taken this message so far
    pub claim_count: u32,
    pub client_uuid: Option<String>,
}

/// Options for `MessageController::list`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ListOptions {
    /// Resume after this marker (exclusive)
    pub marker: Option<String>,
    /// Page size; config default when omitted
    pub limit: Option<usize>,
    /// Include messages posted by `client_uuid` itself
    pub echo: bool,
    pub include_claimed: bool,
    pub include_delayed: bool,
    pub client_uuid: Option<String>,
}

impl ListOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn marker(mut self, marker: impl Into<String>) -> Self {
        self.marker = Some(marker.into());
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn echo(mut self, echo: bool) -> Self {
        self.echo = echo;
        self
    }

    pub fn include_claimed(mut self, include: bool) -> Self {
        self.include_claimed = include;
        self
    }

    pub fn include_delayed(mut self, include: bool) -> Self {
        self.include_delayed = include;
        self
    }

    pub fn client_uuid(mut self, client_uuid: impl Into<String>) -> Self {
        self.client_uuid = Some(client_uuid.into());
        self
    }
}
