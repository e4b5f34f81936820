//! Input checks run by the storage-backed controllers before touching a backend.

use std::sync::Arc;

use crate::config::{BrokerConfig, MIN_TTL_SECS};
use crate::error::{BrokerError, BrokerResult};
use crate::types::{ClaimOptions, ClaimUpdate, NewMessage, QueueMetadata};

pub const QUEUE_NAME_MAX_LEN: usize = 64;
pub const PROJECT_ID_MAX_LEN: usize = 256;

/// Claim size used when the caller gives no limit
pub const DEFAULT_MESSAGES_PER_CLAIM: usize = 10;

/// Claim parameters after defaults were applied and bounds checked
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClaimSpec {
    pub ttl: u64,
    pub grace: u64,
    pub limit: usize,
}

#[derive(Debug, Clone)]
pub struct Validator {
    config: Arc<BrokerConfig>,
}

fn fail<T>(msg: String) -> BrokerResult<T> {
    Err(BrokerError::ValidationFailed(msg))
}

fn within(what: &str, value: u64, min: u64, max: u64) -> BrokerResult<()> {
    if value < min || value > max {
        return fail(format!("{what} must be between {min} and {max} seconds, got {value}"));
    }
    Ok(())
}

fn count_within(what: &str, value: usize, max: usize) -> BrokerResult<()> {
    if value == 0 || value > max {
        return fail(format!("{what} must be between 1 and {max}, got {value}"));
    }
    Ok(())
}

impl Validator {
    pub fn new(config: Arc<BrokerConfig>) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn project_identification(&self, project: &str) -> BrokerResult<()> {
        if project.len() > PROJECT_ID_MAX_LEN {
            return fail(format!(
                "project id may not exceed {PROJECT_ID_MAX_LEN} characters"
            ));
        }
        Ok(())
    }

    pub fn queue_identification(&self, name: &str, project: &str) -> BrokerResult<()> {
        self.project_identification(project)?;
        if name.is_empty() || name.len() > QUEUE_NAME_MAX_LEN {
            return fail(format!(
                "queue name must be 1 to {QUEUE_NAME_MAX_LEN} characters long"
            ));
        }
        if !name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'-' | b'.'))
        {
            return fail(format!(
                "queue name {name:?} may only contain ASCII letters, digits, underscores, dashes and dots"
            ));
        }
        Ok(())
    }

    pub fn queue_metadata(&self, meta: &QueueMetadata) -> BrokerResult<()> {
        let cfg = &self.config;
        let size = meta.encoded_len();
        if size > cfg.max_queue_metadata {
            return fail(format!(
                "queue metadata is {size} bytes, the limit is {}",
                cfg.max_queue_metadata
            ));
        }
        if let Some(ttl) = meta.default_message_ttl {
            within("_default_message_ttl", ttl, MIN_TTL_SECS, cfg.max_message_ttl)?;
        }
        if let Some(delay) = meta.default_message_delay {
            within("_default_message_delay", delay, 0, cfg.max_message_delay)?;
        }
        if let Some(size) = meta.max_messages_post_size {
            if size == 0 || size > cfg.max_messages_post_size {
                return fail(format!(
                    "_max_messages_post_size must be between 1 and {}",
                    cfg.max_messages_post_size
                ));
            }
        }
        if let Some(dlq) = &meta.dead_letter_queue {
            if dlq.is_empty()
                || dlq.len() > QUEUE_NAME_MAX_LEN
                || !dlq
                    .bytes()
                    .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'-' | b'.'))
            {
                return fail(format!("_dead_letter_queue {dlq:?} is not a valid queue name"));
            }
        }
        if let Some(ttl) = meta.dead_letter_queue_messages_ttl {
            within(
                "_dead_letter_queue_messages_ttl",
                ttl,
                MIN_TTL_SECS,
                cfg.max_message_ttl,
            )?;
        }
        if meta.max_claim_count == Some(0) {
            return fail("_max_claim_count must be positive".into());
        }
        if matches!(&meta.flavor, Some(f) if f.trim().is_empty()) {
            return fail("_flavor must not be empty".into());
        }
        if meta.enable_encrypt_messages == Some(true) && cfg.message_encryption_key.is_none() {
            return fail("_enable_encrypt_messages needs a message_encryption_key".into());
        }
        Ok(())
    }

    /// Batch size, per-message bounds and aggregate body size.
    ///
    /// `queue_post_size` is the queue's own `_max_messages_post_size`, if any.
    pub fn message_posting(
        &self,
        messages: &[NewMessage],
        queue_post_size: Option<usize>,
    ) -> BrokerResult<()> {
        let cfg = &self.config;
        if messages.is_empty() {
            return fail("no messages to enqueue".into());
        }
        if messages.len() > cfg.max_messages_per_page {
            return fail(format!(
                "no more than {} messages may be posted at once, got {}",
                cfg.max_messages_per_page,
                messages.len()
            ));
        }

        for msg in messages {
            if let Some(ttl) = msg.ttl {
                within("message ttl", ttl, MIN_TTL_SECS, cfg.max_message_ttl)?;
            }
            if let Some(delay) = msg.delay {
                within("message delay", delay, 0, cfg.max_message_delay)?;
            }
        }

        let limit = queue_post_size
            .map_or(cfg.max_messages_post_size, |q| q.min(cfg.max_messages_post_size));
        let total: usize = messages.iter().map(NewMessage::body_len).fold(0, usize::saturating_add);
        if total > limit {
            return fail(format!(
                "message bodies total {total} bytes, the limit is {limit}"
            ));
        }
        Ok(())
    }

    pub fn message_listing(&self, limit: usize) -> BrokerResult<()> {
        count_within("message page size", limit, self.config.max_messages_per_page)
    }

    pub fn queue_listing(&self, limit: usize) -> BrokerResult<()> {
        count_within("queue page size", limit, self.config.max_queues_per_page)
    }

    /// Number of ids in a bulk get or delete
    pub fn message_ids(&self, count: usize) -> BrokerResult<()> {
        count_within("number of message ids", count, self.config.max_messages_per_page)
    }

    pub fn pop_limit(&self, limit: usize) -> BrokerResult<()> {
        count_within("pop limit", limit, self.config.max_messages_per_claim_or_pop)
    }

    pub fn claim_creation(&self, options: &ClaimOptions) -> BrokerResult<ClaimSpec> {
        let cfg = &self.config;
        let spec = ClaimSpec {
            ttl: options.ttl.unwrap_or(cfg.default_claim_ttl),
            grace: options.grace.unwrap_or(cfg.default_claim_grace),
            limit: options.limit.unwrap_or(DEFAULT_MESSAGES_PER_CLAIM),
        };
        within("claim ttl", spec.ttl, MIN_TTL_SECS, cfg.max_claim_ttl)?;
        within("claim grace", spec.grace, MIN_TTL_SECS, cfg.max_claim_grace)?;
        count_within("claim limit", spec.limit, cfg.max_messages_per_claim_or_pop)?;
        Ok(spec)
    }

    pub fn claim_updating(&self, update: &ClaimUpdate) -> BrokerResult<()> {
        let cfg = &self.config;
        within("claim ttl", update.ttl, MIN_TTL_SECS, cfg.max_claim_ttl)?;
        if let Some(grace) = update.grace {
            within("claim grace", grace, MIN_TTL_SECS, cfg.max_claim_grace)?;
        }
        Ok(())
    }
}
