//! In-process event bus.
//!
//! Listeners are keyed by event name and run one after another, in the order
//! they subscribed, on the publisher's task. The first listener error stops
//! dispatch and is returned to the publisher; later listeners do not run.
//! There is no buffering or retry at this layer.

use async_trait::async_trait;
use shared_types::Email;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::ListenerError;

pub mod listeners;

pub use listeners::{AnalysisListener, ContactListener};

pub const EMAIL_SYNCED: &str = "email.synced";

/// A newly stored email, announced once per ingestion
#[derive(Debug, Clone)]
pub struct EmailSyncedEvent {
    pub user_id: Uuid,
    pub email: Email,
}

#[derive(Debug, Clone)]
pub enum DomainEvent {
    EmailSynced(EmailSyncedEvent),
}

impl DomainEvent {
    pub fn name(&self) -> &'static str {
        match self {
            DomainEvent::EmailSynced(_) => EMAIL_SYNCED,
        }
    }
}

impl From<EmailSyncedEvent> for DomainEvent {
    fn from(event: EmailSyncedEvent) -> Self {
        DomainEvent::EmailSynced(event)
    }
}

#[async_trait]
pub trait Listener: Send + Sync {
    /// Short name used in logs
    fn name(&self) -> &str;

    async fn handle(&self, event: &DomainEvent) -> Result<(), ListenerError>;
}

#[derive(Default)]
pub struct EventBus {
    listeners: HashMap<String, Vec<Arc<dyn Listener>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&mut self, event_name: impl Into<String>, listener: Arc<dyn Listener>) {
        let event_name = event_name.into();
        tracing::debug!("Listener {} subscribed to {}", listener.name(), event_name);
        self.listeners.entry(event_name).or_default().push(listener);
    }

    pub fn listener_count(&self, event_name: &str) -> usize {
        self.listeners.get(event_name).map_or(0, Vec::len)
    }

    /// Run every listener for the event's name, stopping at the first error.
    pub async fn publish(&self, event: &DomainEvent) -> Result<(), ListenerError> {
        let Some(listeners) = self.listeners.get(event.name()) else {
            tracing::trace!("No listeners for {}", event.name());
            return Ok(());
        };

        for listener in listeners {
            if let Err(e) = listener.handle(event).await {
                tracing::warn!(
                    "Listener {} failed on {}: {}",
                    listener.name(),
                    event.name(),
                    e
                );
                return Err(e);
            }
        }
        Ok(())
    }
}
