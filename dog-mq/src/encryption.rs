//! At-rest encryption of message bodies.
//!
//! Queues opt in with `_enable_encrypt_messages`. Bodies of those queues are
//! sealed with AES-256-GCM before they reach storage and opened again on every
//! read path, so the stored body is an opaque base64 string:
//!
//! ```text
//! base64( [12-byte nonce][ciphertext of the JSON body][16-byte tag] )
//! ```
//!
//! The key is the SHA-256 digest of the configured secret.

use std::sync::Arc;

use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Key, Nonce,
};
use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use futures::StreamExt;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::claims::ClaimController;
use crate::cursor::Cursor;
use crate::error::{BrokerError, BrokerResult, ErrorKind};
use crate::messages::MessageController;
use crate::pipeline::{ClaimStage, MessageStage};
use crate::queues::QueueController;
use crate::types::{
    ClaimDetails, ClaimId, ClaimOptions, ListOptions, Message, MessageId, NewClaim, NewMessage,
};

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// Seals and opens message bodies with one key
#[derive(Clone)]
pub struct MessageCipher {
    cipher: Aes256Gcm,
}

impl MessageCipher {
    pub fn new(secret: &str) -> Self {
        let key: [u8; 32] = Sha256::digest(secret.as_bytes()).into();
        Self {
            cipher: Aes256Gcm::new(&Key::<Aes256Gcm>::from(key)),
        }
    }

    pub fn seal(&self, body: &Value) -> BrokerResult<Value> {
        let plain = serde_json::to_vec(body)?;
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let sealed = self
            .cipher
            .encrypt(&nonce, plain.as_slice())
            .map_err(|e| BrokerError::Serialization(format!("message encryption failed: {e}")))?;

        let mut data = nonce.to_vec();
        data.extend_from_slice(&sealed);
        Ok(Value::String(general_purpose::STANDARD.encode(data)))
    }

    /// Bodies that were never sealed come back unchanged
    pub fn open(&self, body: Value) -> BrokerResult<Value> {
        let Value::String(encoded) = &body else {
            return Ok(body);
        };
        let data = match general_purpose::STANDARD.decode(encoded) {
            Ok(data) if data.len() >= NONCE_LEN + TAG_LEN => data,
            _ => return Ok(body),
        };

        let (nonce, sealed) = data.split_at(NONCE_LEN);
        let plain = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), sealed)
            .map_err(|_| {
                BrokerError::Serialization("encrypted message body appears to be corrupted".into())
            })?;
        Ok(serde_json::from_slice(&plain)?)
    }

    fn open_message(&self, mut message: Message) -> BrokerResult<Message> {
        message.body = self.open(message.body)?;
        Ok(message)
    }

    fn open_all(&self, messages: Vec<Message>) -> BrokerResult<Vec<Message>> {
        messages.into_iter().map(|m| self.open_message(m)).collect()
    }
}

/// Message and claim stage that encrypts bodies of opted-in queues
pub struct EncryptionStage {
    cipher: MessageCipher,
    queues: Arc<dyn QueueController>,
}

impl EncryptionStage {
    /// `queues` answers the per-queue opt-in lookups
    pub fn new(cipher: MessageCipher, queues: Arc<dyn QueueController>) -> Self {
        Self { cipher, queues }
    }

    async fn enabled(&self, queue: &str, project: &str) -> BrokerResult<bool> {
        match self.queues.get(queue, project).await {
            Ok(meta) => Ok(meta.enable_encrypt_messages.unwrap_or(false)),
            Err(err) if err.kind() == ErrorKind::DoesNotExist => Ok(false),
            Err(err) => Err(err),
        }
    }
}

#[async_trait]
impl MessageStage for EncryptionStage {
    async fn post(
        &self,
        queue: &str,
        project: &str,
        messages: Vec<NewMessage>,
        client_uuid: Option<&str>,
        next: &dyn MessageController,
    ) -> BrokerResult<Vec<MessageId>> {
        if !self.enabled(queue, project).await? {
            return next.post(queue, project, messages, client_uuid).await;
        }
        let sealed = messages
            .into_iter()
            .map(|mut m| -> BrokerResult<NewMessage> {
                m.body = self.cipher.seal(&m.body)?;
                Ok(m)
            })
            .collect::<BrokerResult<Vec<_>>>()?;
        debug!(queue, count = sealed.len(), "message bodies sealed");
        next.post(queue, project, sealed, client_uuid).await
    }

    async fn get(
        &self,
        queue: &str,
        project: &str,
        id: &MessageId,
        next: &dyn MessageController,
    ) -> BrokerResult<Message> {
        let message = next.get(queue, project, id).await?;
        if self.enabled(queue, project).await? {
            return self.cipher.open_message(message);
        }
        Ok(message)
    }

    async fn bulk_get(
        &self,
        queue: &str,
        project: &str,
        ids: &[MessageId],
        next: &dyn MessageController,
    ) -> BrokerResult<Vec<Message>> {
        let messages = next.bulk_get(queue, project, ids).await?;
        if self.enabled(queue, project).await? {
            return self.cipher.open_all(messages);
        }
        Ok(messages)
    }

    async fn list(
        &self,
        queue: &str,
        project: &str,
        options: &ListOptions,
        next: &dyn MessageController,
    ) -> BrokerResult<Cursor<Message>> {
        let listing = next.list(queue, project, options).await?;
        if !self.enabled(queue, project).await? {
            return Ok(listing);
        }
        let cipher = self.cipher.clone();
        let opened = listing.map(move |item| item.and_then(|m| cipher.open_message(m)));
        Ok(Cursor::new(Box::pin(opened)))
    }

    async fn pop(
        &self,
        queue: &str,
        project: &str,
        limit: usize,
        next: &dyn MessageController,
    ) -> BrokerResult<Vec<Message>> {
        let messages = next.pop(queue, project, limit).await?;
        if !messages.is_empty() && self.enabled(queue, project).await? {
            return self.cipher.open_all(messages);
        }
        Ok(messages)
    }
}

#[async_trait]
impl ClaimStage for EncryptionStage {
    async fn create(
        &self,
        queue: &str,
        project: &str,
        options: &ClaimOptions,
        next: &dyn ClaimController,
    ) -> BrokerResult<NewClaim> {
        let mut claim = next.create(queue, project, options).await?;
        if !claim.messages.is_empty() && self.enabled(queue, project).await? {
            claim.messages = self.cipher.open_all(claim.messages)?;
        }
        Ok(claim)
    }

    async fn get(
        &self,
        queue: &str,
        project: &str,
        claim: &ClaimId,
        next: &dyn ClaimController,
    ) -> BrokerResult<ClaimDetails> {
        let mut details = next.get(queue, project, claim).await?;
        if self.enabled(queue, project).await? {
            details.messages = self.cipher.open_all(details.messages)?;
        }
        Ok(details)
    }
}
