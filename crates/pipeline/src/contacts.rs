//! Per-user contact statistics.
//!
//! Two independent writes feed a contact: an interaction when a message from
//! the address is first stored, and a sentiment observation once the message
//! has been analysed. They are counted separately (`interaction_count` and
//! `sentiment_samples`) so neither path inflates the other, and both are
//! single atomic upserts in the store.

use chrono::{DateTime, Utc};
use shared_types::Contact;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::{StoreError, StoreResult};
use crate::models::{Interaction, SentimentObservation};
use crate::store::ContactStore;

pub struct ContactAggregator {
    store: Arc<dyn ContactStore>,
}

impl ContactAggregator {
    pub fn new(store: Arc<dyn ContactStore>) -> Self {
        Self { store }
    }

    /// Count one interaction with `email_address`, creating the contact on
    /// first sight. The display name is overwritten on every call.
    pub async fn record_interaction(
        &self,
        user_id: Uuid,
        email_address: &str,
        display_name: &str,
        at: DateTime<Utc>,
    ) -> StoreResult<Contact> {
        let email_address = normalize_address(email_address)?;
        let interaction = Interaction {
            user_id,
            email_address,
            display_name: display_name.trim().to_string(),
            at,
        };

        let contact = self.store.record_interaction(&interaction).await?;
        tracing::debug!(
            "Contact {} now has {} interactions",
            contact.email_address,
            contact.interaction_count
        );
        Ok(contact)
    }

    /// Fold a sentiment score (see `Sentiment::score`) into the contact's
    /// running average.
    pub async fn record_sentiment(
        &self,
        user_id: Uuid,
        email_address: &str,
        value: f64,
        at: DateTime<Utc>,
    ) -> StoreResult<Contact> {
        if !value.is_finite() {
            return Err(StoreError::invalid(format!("sentiment value {}", value)));
        }

        let email_address = normalize_address(email_address)?;
        let observation = SentimentObservation {
            user_id,
            email_address,
            value,
            at,
        };

        let contact = self.store.record_sentiment(&observation).await?;
        tracing::debug!(
            "Contact {} average sentiment {:.3} over {} samples",
            contact.email_address,
            contact.avg_sentiment,
            contact.sentiment_samples
        );
        Ok(contact)
    }

    pub async fn get(&self, user_id: Uuid, email_address: &str) -> StoreResult<Option<Contact>> {
        let email_address = normalize_address(email_address)?;
        self.store.get_contact(user_id, &email_address).await
    }
}

/// Contacts are keyed by the trimmed, lower-cased address.
pub fn normalize_address(email_address: &str) -> StoreResult<String> {
    let normalized = email_address.trim().to_lowercase();
    if normalized.is_empty() {
        return Err(StoreError::invalid("empty email address"));
    }
    Ok(normalized)
}

/// Parse a sender like `"John Doe" <john@example.com>` into (address, name).
///
/// Without angle brackets the whole string is the address and the name is
/// empty.
pub fn parse_sender(from: &str) -> (String, String) {
    let from = from.trim();

    if let (Some(start), Some(end)) = (from.rfind('<'), from.rfind('>')) {
        if start < end {
            let address = from[start + 1..end].trim().to_string();
            let name = from[..start].trim().trim_matches('"').trim().to_string();
            return (address, name);
        }
    }

    (from.to_string(), String::new())
}
