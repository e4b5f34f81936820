use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{ClaimId, Message};

/// Parameters for creating a claim; `None` falls back to configured defaults
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimOptions {
    pub ttl: Option<u64>,
    pub grace: Option<u64>,
    pub limit: Option<usize>,
}

impl ClaimOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ttl(mut self, ttl: u64) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn grace(mut self, grace: u64) -> Self {
        self.grace = Some(grace);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// New ttl (and optionally grace) for an active claim
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimUpdate {
    pub ttl: u64,
    pub grace: Option<u64>,
}

impl ClaimUpdate {
    pub fn ttl(ttl: u64) -> Self {
        Self { ttl, grace: None }
    }

    pub fn with_grace(mut self, grace: u64) -> Self {
        self.grace = Some(grace);
        self
    }
}

/// Claim bookkeeping as reported to its holder
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimMeta {
    pub id: ClaimId,
    pub ttl: u64,
    pub grace: u64,
    /// Seconds since creation, never negative
    pub age: i64,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Result of `ClaimController::create`.
///
/// `id` is `None` when nothing was eligible, so no claim was persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewClaim {
    pub id: Option<ClaimId>,
    pub messages: Vec<Message>,
}

impl NewClaim {
    pub fn empty() -> Self {
        Self {
            id: None,
            messages: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

/// Result of `ClaimController::get`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClaimDetails {
    pub meta: ClaimMeta,
    pub messages: Vec<Message>,
}
