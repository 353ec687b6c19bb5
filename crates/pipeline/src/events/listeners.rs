use async_trait::async_trait;
use std::sync::Arc;

use super::{DomainEvent, Listener};
use crate::analysis::{AnalysisJob, ANALYZE_JOB};
use crate::contacts::{parse_sender, ContactAggregator};
use crate::error::ListenerError;
use crate::queue::{JobOptions, TaskQueue};

/// Queues an analysis job for every synced email.
pub struct AnalysisListener {
    queue: Arc<dyn TaskQueue>,
    options: JobOptions,
}

impl AnalysisListener {
    pub fn new(queue: Arc<dyn TaskQueue>, options: JobOptions) -> Self {
        Self { queue, options }
    }
}

#[async_trait]
impl Listener for AnalysisListener {
    fn name(&self) -> &str {
        "analysis"
    }

    async fn handle(&self, event: &DomainEvent) -> Result<(), ListenerError> {
        let DomainEvent::EmailSynced(synced) = event;

        let payload = AnalysisJob::new(synced.email.id, synced.user_id).encode()?;
        let job_id = self.queue.submit(ANALYZE_JOB, payload, self.options).await?;

        tracing::debug!("Queued analysis job {} for email {}", job_id, synced.email.id);
        Ok(())
    }
}

/// Counts an interaction with the sender of every synced email.
pub struct ContactListener {
    contacts: Arc<ContactAggregator>,
}

impl ContactListener {
    pub fn new(contacts: Arc<ContactAggregator>) -> Self {
        Self { contacts }
    }
}

#[async_trait]
impl Listener for ContactListener {
    fn name(&self) -> &str {
        "contacts"
    }

    async fn handle(&self, event: &DomainEvent) -> Result<(), ListenerError> {
        let DomainEvent::EmailSynced(synced) = event;

        let (address, name) = parse_sender(&synced.email.sender);
        if address.is_empty() {
            return Ok(());
        }

        self.contacts
            .record_interaction(synced.user_id, &address, &name, synced.email.received_at)
            .await?;
        Ok(())
    }
}
