//! Ordered stages in front of the storage-backed controllers.
//!
//! A pipeline owns a fixed list of stages and a terminal controller. Each call
//! enters the first stage, which receives the rest of the chain as `next` and
//! may answer on its own, call `next` and adjust the result, or just pass the
//! call through. Every stage method defaults to passing through, so a stage
//! only overrides the operations it cares about.
//!
//! ```text
//! caller → stage[0] → stage[1] → … → terminal controller
//! ```
//!
//! Stages must hand errors back unchanged.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::claims::ClaimController;
use crate::cursor::Cursor;
use crate::error::BrokerResult;
use crate::messages::MessageController;
use crate::queues::QueueController;
use crate::types::{
    ClaimDetails, ClaimId, ClaimOptions, ClaimUpdate, ListOptions, Message, MessageId,
    MetadataPatch, NewClaim, NewMessage, QueueMetadata, QueueStats, QueueSummary,
};

/// A queue pipeline stage
#[async_trait]
pub trait QueueStage: Send + Sync {
    async fn create(
        &self,
        name: &str,
        project: &str,
        metadata: QueueMetadata,
        next: &dyn QueueController,
    ) -> BrokerResult<bool> {
        next.create(name, project, metadata).await
    }

    async fn get(
        &self,
        name: &str,
        project: &str,
        next: &dyn QueueController,
    ) -> BrokerResult<QueueMetadata> {
        next.get(name, project).await
    }

    async fn exists(
        &self,
        name: &str,
        project: &str,
        next: &dyn QueueController,
    ) -> BrokerResult<bool> {
        next.exists(name, project).await
    }

    async fn update_metadata(
        &self,
        name: &str,
        project: &str,
        ops: &[MetadataPatch],
        next: &dyn QueueController,
    ) -> BrokerResult<QueueMetadata> {
        next.update_metadata(name, project, ops).await
    }

    async fn set_metadata(
        &self,
        name: &str,
        project: &str,
        metadata: QueueMetadata,
        next: &dyn QueueController,
    ) -> BrokerResult<()> {
        next.set_metadata(name, project, metadata).await
    }

    async fn delete(&self, name: &str, project: &str, next: &dyn QueueController) -> BrokerResult<()> {
        next.delete(name, project).await
    }

    async fn list(
        &self,
        project: &str,
        marker: Option<&str>,
        limit: Option<usize>,
        detailed: bool,
        next: &dyn QueueController,
    ) -> BrokerResult<Cursor<QueueSummary>> {
        next.list(project, marker, limit, detailed).await
    }

    async fn stats(
        &self,
        name: &str,
        project: &str,
        next: &dyn QueueController,
    ) -> BrokerResult<QueueStats> {
        next.stats(name, project).await
    }
}

/// A message pipeline stage
#[async_trait]
pub trait MessageStage: Send + Sync {
    async fn post(
        &self,
        queue: &str,
        project: &str,
        messages: Vec<NewMessage>,
        client_uuid: Option<&str>,
        next: &dyn MessageController,
    ) -> BrokerResult<Vec<MessageId>> {
        next.post(queue, project, messages, client_uuid).await
    }

    async fn get(
        &self,
        queue: &str,
        project: &str,
        id: &MessageId,
        next: &dyn MessageController,
    ) -> BrokerResult<Message> {
        next.get(queue, project, id).await
    }

    async fn bulk_get(
        &self,
        queue: &str,
        project: &str,
        ids: &[MessageId],
        next: &dyn MessageController,
    ) -> BrokerResult<Vec<Message>> {
        next.bulk_get(queue, project, ids).await
    }

    async fn list(
        &self,
        queue: &str,
        project: &str,
        options: &ListOptions,
        next: &dyn MessageController,
    ) -> BrokerResult<Cursor<Message>> {
        next.list(queue, project, options).await
    }

    async fn delete(
        &self,
        queue: &str,
        project: &str,
        id: &MessageId,
        claim: Option<&ClaimId>,
        next: &dyn MessageController,
    ) -> BrokerResult<()> {
        next.delete(queue, project, id, claim).await
    }

    async fn bulk_delete(
        &self,
        queue: &str,
        project: &str,
        ids: &[MessageId],
        claim_ids: Option<&[ClaimId]>,
        next: &dyn MessageController,
    ) -> BrokerResult<()> {
        next.bulk_delete(queue, project, ids, claim_ids).await
    }

    async fn pop(
        &self,
        queue: &str,
        project: &str,
        limit: usize,
        next: &dyn MessageController,
    ) -> BrokerResult<Vec<Message>> {
        next.pop(queue, project, limit).await
    }
}

/// A claim pipeline stage
#[async_trait]
pub trait ClaimStage: Send + Sync {
    async fn create(
        &self,
        queue: &str,
        project: &str,
        options: &ClaimOptions,
        next: &dyn ClaimController,
    ) -> BrokerResult<NewClaim> {
        next.create(queue, project, options).await
    }

    async fn get(
        &self,
        queue: &str,
        project: &str,
        claim: &ClaimId,
        next: &dyn ClaimController,
    ) -> BrokerResult<ClaimDetails> {
        next.get(queue, project, claim).await
    }

    async fn update(
        &self,
        queue: &str,
        project: &str,
        claim: &ClaimId,
        update: &ClaimUpdate,
        next: &dyn ClaimController,
    ) -> BrokerResult<()> {
        next.update(queue, project, claim, update).await
    }

    async fn delete(
        &self,
        queue: &str,
        project: &str,
        claim: &ClaimId,
        next: &dyn ClaimController,
    ) -> BrokerResult<()> {
        next.delete(queue, project, claim).await
    }
}

/// Remaining stages plus the terminal; `next` for the stage in front of it
struct QueueChain<'a> {
    stages: &'a [Arc<dyn QueueStage>],
    terminal: &'a dyn QueueController,
}

impl<'a> QueueChain<'a> {
    fn split(&self) -> Option<(&'a dyn QueueStage, QueueChain<'a>)> {
        let (stage, rest) = self.stages.split_first()?;
        Some((
            stage.as_ref(),
            QueueChain {
                stages: rest,
                terminal: self.terminal,
            },
        ))
    }
}

#[async_trait]
impl<'a> QueueController for QueueChain<'a> {
    async fn create(&self, name: &str, project: &str, metadata: QueueMetadata) -> BrokerResult<bool> {
        match self.split() {
            Some((stage, next)) => stage.create(name, project, metadata, &next).await,
            None => self.terminal.create(name, project, metadata).await,
        }
    }

    async fn get(&self, name: &str, project: &str) -> BrokerResult<QueueMetadata> {
        match self.split() {
            Some((stage, next)) => stage.get(name, project, &next).await,
            None => self.terminal.get(name, project).await,
        }
    }

    async fn exists(&self, name: &str, project: &str) -> BrokerResult<bool> {
        match self.split() {
            Some((stage, next)) => stage.exists(name, project, &next).await,
            None => self.terminal.exists(name, project).await,
        }
    }

    async fn update_metadata(
        &self,
        name: &str,
        project: &str,
        ops: &[MetadataPatch],
    ) -> BrokerResult<QueueMetadata> {
        match self.split() {
            Some((stage, next)) => stage.update_metadata(name, project, ops, &next).await,
            None => self.terminal.update_metadata(name, project, ops).await,
        }
    }

    async fn set_metadata(&self, name: &str, project: &str, metadata: QueueMetadata) -> BrokerResult<()> {
        match self.split() {
            Some((stage, next)) => stage.set_metadata(name, project, metadata, &next).await,
            None => self.terminal.set_metadata(name, project, metadata).await,
        }
    }

    async fn delete(&self, name: &str, project: &str) -> BrokerResult<()> {
        match self.split() {
            Some((stage, next)) => stage.delete(name, project, &next).await,
            None => self.terminal.delete(name, project).await,
        }
    }

    async fn list(
        &self,
        project: &str,
        marker: Option<&str>,
        limit: Option<usize>,
        detailed: bool,
    ) -> BrokerResult<Cursor<QueueSummary>> {
        match self.split() {
            Some((stage, next)) => stage.list(project, marker, limit, detailed, &next).await,
            None => self.terminal.list(project, marker, limit, detailed).await,
        }
    }

    async fn stats(&self, name: &str, project: &str) -> BrokerResult<QueueStats> {
        match self.split() {
            Some((stage, next)) => stage.stats(name, project, &next).await,
            None => self.terminal.stats(name, project).await,
        }
    }
}

struct MessageChain<'a> {
    stages: &'a [Arc<dyn MessageStage>],
    terminal: &'a dyn MessageController,
}

impl<'a> MessageChain<'a> {
    fn split(&self) -> Option<(&'a dyn MessageStage, MessageChain<'a>)> {
        let (stage, rest) = self.stages.split_first()?;
        Some((
            stage.as_ref(),
            MessageChain {
                stages: rest,
                terminal: self.terminal,
            },
        ))
    }
}

#[async_trait]
impl<'a> MessageController for MessageChain<'a> {
    async fn post(
        &self,
        queue: &str,
        project: &str,
        messages: Vec<NewMessage>,
        client_uuid: Option<&str>,
    ) -> BrokerResult<Vec<MessageId>> {
        match self.split() {
            Some((stage, next)) => stage.post(queue, project, messages, client_uuid, &next).await,
            None => self.terminal.post(queue, project, messages, client_uuid).await,
        }
    }

    async fn get(&self, queue: &str, project: &str, id: &MessageId) -> BrokerResult<Message> {
        match self.split() {
            Some((stage, next)) => stage.get(queue, project, id, &next).await,
            None => self.terminal.get(queue, project, id).await,
        }
    }

    async fn bulk_get(
        &self,
        queue: &str,
        project: &str,
        ids: &[MessageId],
    ) -> BrokerResult<Vec<Message>> {
        match self.split() {
            Some((stage, next)) => stage.bulk_get(queue, project, ids, &next).await,
            None => self.terminal.bulk_get(queue, project, ids).await,
        }
    }

    async fn list(
        &self,
        queue: &str,
        project: &str,
        options: &ListOptions,
    ) -> BrokerResult<Cursor<Message>> {
        match self.split() {
            Some((stage, next)) => stage.list(queue, project, options, &next).await,
            None => self.terminal.list(queue, project, options).await,
        }
    }

    async fn delete(
        &self,
        queue: &str,
        project: &str,
        id: &MessageId,
        claim: Option<&ClaimId>,
    ) -> BrokerResult<()> {
        match self.split() {
            Some((stage, next)) => stage.delete(queue, project, id, claim, &next).await,
            None => self.terminal.delete(queue, project, id, claim).await,
        }
    }

    async fn bulk_delete(
        &self,
        queue: &str,
        project: &str,
        ids: &[MessageId],
        claim_ids: Option<&[ClaimId]>,
    ) -> BrokerResult<()> {
        match self.split() {
            Some((stage, next)) => stage.bulk_delete(queue, project, ids, claim_ids, &next).await,
            None => self.terminal.bulk_delete(queue, project, ids, claim_ids).await,
        }
    }

    async fn pop(&self, queue: &str, project: &str, limit: usize) -> BrokerResult<Vec<Message>> {
        match self.split() {
            Some((stage, next)) => stage.pop(queue, project, limit, &next).await,
            None => self.terminal.pop(queue, project, limit).await,
        }
    }
}

struct ClaimChain<'a> {
    stages: &'a [Arc<dyn ClaimStage>],
    terminal: &'a dyn ClaimController,
}

impl<'a> ClaimChain<'a> {
    fn split(&self) -> Option<(&'a dyn ClaimStage, ClaimChain<'a>)> {
        let (stage, rest) = self.stages.split_first()?;
        Some((
            stage.as_ref(),
            ClaimChain {
                stages: rest,
                terminal: self.terminal,
            },
        ))
    }
}

#[async_trait]
impl<'a> ClaimController for ClaimChain<'a> {
    async fn create(
        &self,
        queue: &str,
        project: &str,
        options: &ClaimOptions,
    ) -> BrokerResult<NewClaim> {
        match self.split() {
            Some((stage, next)) => stage.create(queue, project, options, &next).await,
            None => self.terminal.create(queue, project, options).await,
        }
    }

    async fn get(
        &self,
        queue: &str,
        project: &str,
        claim: &ClaimId,
    ) -> BrokerResult<ClaimDetails> {
        match self.split() {
            Some((stage, next)) => stage.get(queue, project, claim, &next).await,
            None => self.terminal.get(queue, project, claim).await,
        }
    }

    async fn update(
        &self,
        queue: &str,
        project: &str,
        claim: &ClaimId,
        update: &ClaimUpdate,
    ) -> BrokerResult<()> {
        match self.split() {
            Some((stage, next)) => stage.update(queue, project, claim, update, &next).await,
            None => self.terminal.update(queue, project, claim, update).await,
        }
    }

    async fn delete(&self, queue: &str, project: &str, claim: &ClaimId) -> BrokerResult<()> {
        match self.split() {
            Some((stage, next)) => stage.delete(queue, project, claim, &next).await,
            None => self.terminal.delete(queue, project, claim).await,
        }
    }
}

/// Queue controller made of stages in front of a terminal controller
pub struct QueuePipeline {
    stages: Vec<Arc<dyn QueueStage>>,
    terminal: Arc<dyn QueueController>,
}

impl QueuePipeline {
    pub fn new(terminal: Arc<dyn QueueController>) -> Self {
        Self {
            stages: Vec::new(),
            terminal,
        }
    }

    /// Append a stage; earlier stages run first
    pub fn with_stage(mut self, stage: Arc<dyn QueueStage>) -> Self {
        self.stages.push(stage);
        self
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    fn chain(&self) -> QueueChain<'_> {
        QueueChain {
            stages: &self.stages,
            terminal: self.terminal.as_ref(),
        }
    }
}

#[async_trait]
impl QueueController for QueuePipeline {
    async fn create(&self, name: &str, project: &str, metadata: QueueMetadata) -> BrokerResult<bool> {
        self.chain().create(name, project, metadata).await
    }

    async fn get(&self, name: &str, project: &str) -> BrokerResult<QueueMetadata> {
        self.chain().get(name, project).await
    }

    async fn exists(&self, name: &str, project: &str) -> BrokerResult<bool> {
        self.chain().exists(name, project).await
    }

    async fn update_metadata(
        &self,
        name: &str,
        project: &str,
        ops: &[MetadataPatch],
    ) -> BrokerResult<QueueMetadata> {
        self.chain().update_metadata(name, project, ops).await
    }

    async fn set_metadata(&self, name: &str, project: &str, metadata: QueueMetadata) -> BrokerResult<()> {
        self.chain().set_metadata(name, project, metadata).await
    }

    async fn delete(&self, name: &str, project: &str) -> BrokerResult<()> {
        self.chain().delete(name, project).await
    }

    async fn list(
        &self,
        project: &str,
        marker: Option<&str>,
        limit: Option<usize>,
        detailed: bool,
    ) -> BrokerResult<Cursor<QueueSummary>> {
        self.chain().list(project, marker, limit, detailed).await
    }

    async fn stats(&self, name: &str, project: &str) -> BrokerResult<QueueStats> {
        self.chain().stats(name, project).await
    }
}

/// Message controller made of stages in front of a terminal controller
pub struct MessagePipeline {
    stages: Vec<Arc<dyn MessageStage>>,
    terminal: Arc<dyn MessageController>,
}

impl MessagePipeline {
    pub fn new(terminal: Arc<dyn MessageController>) -> Self {
        Self {
            stages: Vec::new(),
            terminal,
        }
    }

    pub fn with_stage(mut self, stage: Arc<dyn MessageStage>) -> Self {
        self.stages.push(stage);
        self
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    fn chain(&self) -> MessageChain<'_> {
        MessageChain {
            stages: &self.stages,
            terminal: self.terminal.as_ref(),
        }
    }
}

#[async_trait]
impl MessageController for MessagePipeline {
    async fn post(
        &self,
        queue: &str,
        project: &str,
        messages: Vec<NewMessage>,
        client_uuid: Option<&str>,
    ) -> BrokerResult<Vec<MessageId>> {
        self.chain().post(queue, project, messages, client_uuid).await
    }

    async fn get(&self, queue: &str, project: &str, id: &MessageId) -> BrokerResult<Message> {
        self.chain().get(queue, project, id).await
    }

    async fn bulk_get(
        &self,
        queue: &str,
        project: &str,
        ids: &[MessageId],
    ) -> BrokerResult<Vec<Message>> {
        self.chain().bulk_get(queue, project, ids).await
    }

    async fn list(
        &self,
        queue: &str,
        project: &str,
        options: &ListOptions,
    ) -> BrokerResult<Cursor<Message>> {
        self.chain().list(queue, project, options).await
    }

    async fn delete(
        &self,
        queue: &str,
        project: &str,
        id: &MessageId,
        claim: Option<&ClaimId>,
    ) -> BrokerResult<()> {
        self.chain().delete(queue, project, id, claim).await
    }

    async fn bulk_delete(
        &self,
        queue: &str,
        project: &str,
        ids: &[MessageId],
        claim_ids: Option<&[ClaimId]>,
    ) -> BrokerResult<()> {
        self.chain().bulk_delete(queue, project, ids, claim_ids).await
    }

    async fn pop(&self, queue: &str, project: &str, limit: usize) -> BrokerResult<Vec<Message>> {
        self.chain().pop(queue, project, limit).await
    }
}

/// Claim controller made of stages in front of a terminal controller
pub struct ClaimPipeline {
    stages: Vec<Arc<dyn ClaimStage>>,
    terminal: Arc<dyn ClaimController>,
}

impl ClaimPipeline {
    pub fn new(terminal: Arc<dyn ClaimController>) -> Self {
        Self {
            stages: Vec::new(),
            terminal,
        }
    }

    pub fn with_stage(mut self, stage: Arc<dyn ClaimStage>) -> Self {
        self.stages.push(stage);
        self
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    fn chain(&self) -> ClaimChain<'_> {
        ClaimChain {
            stages: &self.stages,
            terminal: self.terminal.as_ref(),
        }
    }
}

#[async_trait]
impl ClaimController for ClaimPipeline {
    async fn create(
        &self,
        queue: &str,
        project: &str,
        options: &ClaimOptions,
    ) -> BrokerResult<NewClaim> {
        self.chain().create(queue, project, options).await
    }

    async fn get(
        &self,
        queue: &str,
        project: &str,
        claim: &ClaimId,
    ) -> BrokerResult<ClaimDetails> {
        self.chain().get(queue, project, claim).await
    }

    async fn update(
        &self,
        queue: &str,
        project: &str,
        claim: &ClaimId,
        update: &ClaimUpdate,
    ) -> BrokerResult<()> {
        self.chain().update(queue, project, claim, update).await
    }

    async fn delete(&self, queue: &str, project: &str, claim: &ClaimId) -> BrokerResult<()> {
        self.chain().delete(queue, project, claim).await
    }
}

/// Logs every mutating call that passes through it, with its outcome.
///
/// Reads are not logged.
#[derive(Debug, Clone, Copy, Default)]
pub struct AuditStage;

impl AuditStage {
    fn record<T>(
        controller: &'static str,
        op: &'static str,
        project: &str,
        queue: &str,
        result: BrokerResult<T>,
    ) -> BrokerResult<T> {
        match &result {
            Ok(_) => debug!(target: "dog_mq::audit", controller, op, project, queue, "ok"),
            Err(err) => warn!(
                target: "dog_mq::audit",
                controller,
                op,
                project,
                queue,
                kind = err.kind().name(),
                error = %err,
                "failed"
            ),
        }
        result
    }
}

#[async_trait]
impl QueueStage for AuditStage {
    async fn create(
        &self,
        name: &str,
        project: &str,
        metadata: QueueMetadata,
        next: &dyn QueueController,
    ) -> BrokerResult<bool> {
        let result = next.create(name, project, metadata).await;
        Self::record("queue", "create", project, name, result)
    }

    async fn update_metadata(
        &self,
        name: &str,
        project: &str,
        ops: &[MetadataPatch],
        next: &dyn QueueController,
    ) -> BrokerResult<QueueMetadata> {
        let result = next.update_metadata(name, project, ops).await;
        Self::record("queue", "update_metadata", project, name, result)
    }

    async fn set_metadata(
        &self,
        name: &str,
        project: &str,
        metadata: QueueMetadata,
        next: &dyn QueueController,
    ) -> BrokerResult<()> {
        let result = next.set_metadata(name, project, metadata).await;
        Self::record("queue", "set_metadata", project, name, result)
    }

    async fn delete(&self, name: &str, project: &str, next: &dyn QueueController) -> BrokerResult<()> {
        let result = next.delete(name, project).await;
        Self::record("queue", "delete", project, name, result)
    }
}

#[async_trait]
impl MessageStage for AuditStage {
    async fn post(
        &self,
        queue: &str,
        project: &str,
        messages: Vec<NewMessage>,
        client_uuid: Option<&str>,
        next: &dyn MessageController,
    ) -> BrokerResult<Vec<MessageId>> {
        let result = next.post(queue, project, messages, client_uuid).await;
        Self::record("message", "post", project, queue, result)
    }

    async fn delete(
        &self,
        queue: &str,
        project: &str,
        id: &MessageId,
        claim: Option<&ClaimId>,
        next: &dyn MessageController,
    ) -> BrokerResult<()> {
        let result = next.delete(queue, project, id, claim).await;
        Self::record("message", "delete", project, queue, result)
    }

    async fn bulk_delete(
        &self,
        queue: &str,
        project: &str,
        ids: &[MessageId],
        claim_ids: Option<&[ClaimId]>,
        next: &dyn MessageController,
    ) -> BrokerResult<()> {
        let result = next.bulk_delete(queue, project, ids, claim_ids).await;
        Self::record("message", "bulk_delete", project, queue, result)
    }

    async fn pop(
        &self,
        queue: &str,
        project: &str,
        limit: usize,
        next: &dyn MessageController,
    ) -> BrokerResult<Vec<Message>> {
        let result = next.pop(queue, project, limit).await;
        Self::record("message", "pop", project, queue, result)
    }
}

#[async_trait]
impl ClaimStage for AuditStage {
    async fn create(
        &self,
        queue: &str,
        project: &str,
        options: &ClaimOptions,
        next: &dyn ClaimController,
    ) -> BrokerResult<NewClaim> {
        let result = next.create(queue, project, options).await;
        Self::record("claim", "create", project, queue, result)
    }

    async fn update(
        &self,
        queue: &str,
        project: &str,
        claim: &ClaimId,
        update: &ClaimUpdate,
        next: &dyn ClaimController,
    ) -> BrokerResult<()> {
        let result = next.update(queue, project, claim, update).await;
        Self::record("claim", "update", project, queue, result)
    }

    async fn delete(
        &self,
        queue: &str,
        project: &str,
        claim: &ClaimId,
        next: &dyn ClaimController,
    ) -> BrokerResult<()> {
        let result = next.delete(queue, project, claim).await;
        Self::record("claim", "delete", project, queue, result)
    }
}
