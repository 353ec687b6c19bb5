//! In-process store.
//!
//! Each operation runs inside one critical section, which gives the same
//! guarantees as the single-statement upserts in the Postgres store.

use async_trait::async_trait;
use chrono::Utc;
use shared_types::{Contact, Email, EmailAccount};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use uuid::Uuid;

use super::{incremental_mean, latest, AccountStore, ContactStore, EmailStore};
use crate::error::{StoreError, StoreResult};
use crate::models::{EmailAnalysisUpdate, Interaction, NewEmail, SentimentObservation, SyncOutcome};

#[derive(Default)]
pub struct MemoryStore {
    emails: Mutex<HashMap<Uuid, Email>>,
    contacts: Mutex<HashMap<(Uuid, String), Contact>>,
    accounts: Mutex<HashMap<Uuid, EmailAccount>>,
}

fn guard<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_account(&self, account: EmailAccount) {
        guard(&self.accounts).insert(account.id, account);
    }

    /// All emails stored for a user, oldest first.
    pub fn emails_for(&self, user_id: Uuid) -> Vec<Email> {
        let mut emails: Vec<Email> = guard(&self.emails)
            .values()
            .filter(|e| e.user_id == user_id)
            .cloned()
            .collect();
        emails.sort_by_key(|e| e.received_at);
        emails
    }

    pub fn contacts_for(&self, user_id: Uuid) -> Vec<Contact> {
        guard(&self.contacts)
            .values()
            .filter(|c| c.user_id == user_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl EmailStore for MemoryStore {
    async fn exists(&self, user_id: Uuid, message_id: &str) -> StoreResult<bool> {
        Ok(guard(&self.emails)
            .values()
            .any(|e| e.user_id == user_id && e.message_id == message_id))
    }

    async fn insert(&self, new_email: NewEmail) -> StoreResult<Option<Email>> {
        let mut emails = guard(&self.emails);
        let duplicate = emails
            .values()
            .any(|e| e.user_id == new_email.user_id && e.message_id == new_email.message_id);
        if duplicate {
            return Ok(None);
        }

        let email = Email {
            id: Uuid::new_v4(),
            user_id: new_email.user_id,
            message_id: new_email.message_id,
            subject: new_email.subject,
            sender: new_email.sender,
            received_at: new_email.received_at,
            body_text: new_email.body_text,
            body_html: new_email.body_html,
            snippet: new_email.snippet,
            summary: None,
            category: None,
            sentiment: None,
            urgency: None,
            action_items: None,
            created_at: Utc::now(),
            analyzed_at: None,
        };
        emails.insert(email.id, email.clone());
        Ok(Some(email))
    }

    async fn get_email(&self, user_id: Uuid, email_id: Uuid) -> StoreResult<Option<Email>> {
        Ok(guard(&self.emails)
            .get(&email_id)
            .filter(|e| e.user_id == user_id)
            .cloned())
    }

    async fn apply_analysis(
        &self,
        user_id: Uuid,
        email_id: Uuid,
        update: EmailAnalysisUpdate,
    ) -> StoreResult<Email> {
        let mut emails = guard(&self.emails);
        let email = emails
            .get_mut(&email_id)
            .filter(|e| e.user_id == user_id)
            .ok_or_else(|| StoreError::not_found(format!("Email {email_id}")))?;

        if let Some(summary) = update.summary {
            email.summary = Some(summary);
        }
        if let Some(category) = update.category {
            email.category = Some(category);
        }
        if let Some(items) = update.action_items {
            email.action_items = Some(items);
        }
        if let Some(sentiment) = update.sentiment {
            email.sentiment = Some(sentiment);
        }
        if let Some(urgency) = update.urgency {
            email.urgency = Some(urgency);
        }
        if let Some(at) = update.analyzed_at {
            email.analyzed_at = Some(at);
        }

        Ok(email.clone())
    }

    async fn list_unanalyzed(&self, user_id: Uuid, limit: i64) -> StoreResult<Vec<Email>> {
        let limit = usize::try_from(limit).unwrap_or(0);
        Ok(self
            .emails_for(user_id)
            .into_iter()
            .filter(|e| e.analyzed_at.is_none())
            .take(limit)
            .collect())
    }
}

#[async_trait]
impl ContactStore for MemoryStore {
    async fn record_interaction(&self, interaction: &Interaction) -> StoreResult<Contact> {
        let now = Utc::now();
        let mut contacts = guard(&self.contacts);
        let key = (interaction.user_id, interaction.email_address.clone());

        let contact = contacts
            .entry(key)
            .and_modify(|c| {
                c.interaction_count += 1;
                c.display_name = interaction.display_name.clone();
                c.last_interaction_at = latest(c.last_interaction_at, interaction.at);
                c.updated_at = now;
            })
            .or_insert_with(|| Contact {
                id: Uuid::new_v4(),
                user_id: interaction.user_id,
                email_address: interaction.email_address.clone(),
                display_name: interaction.display_name.clone(),
                interaction_count: 1,
                avg_sentiment: 0.0,
                sentiment_samples: 0,
                last_interaction_at: interaction.at,
                created_at: now,
                updated_at: now,
            });

        Ok(contact.clone())
    }

    async fn record_sentiment(&self, observation: &SentimentObservation) -> StoreResult<Contact> {
        let now = Utc::now();
        let mut contacts = guard(&self.contacts);
        let key = (observation.user_id, observation.email_address.clone());

        let contact = contacts
            .entry(key)
            .and_modify(|c| {
                c.avg_sentiment =
                    incremental_mean(c.avg_sentiment, c.sentiment_samples, observation.value);
                c.sentiment_samples += 1;
                c.last_interaction_at = latest(c.last_interaction_at, observation.at);
                c.updated_at = now;
            })
            .or_insert_with(|| Contact {
                id: Uuid::new_v4(),
                user_id: observation.user_id,
                email_address: observation.email_address.clone(),
                display_name: String::new(),
                interaction_count: 0,
                avg_sentiment: observation.value,
                sentiment_samples: 1,
                last_interaction_at: observation.at,
                created_at: now,
                updated_at: now,
            });

        Ok(contact.clone())
    }

    async fn get_contact(&self, user_id: Uuid, email_address: &str) -> StoreResult<Option<Contact>> {
        Ok(guard(&self.contacts)
            .get(&(user_id, email_address.to_string()))
            .cloned())
    }
}

#[async_trait]
impl AccountStore for MemoryStore {
    async fn list_active(&self) -> StoreResult<Vec<EmailAccount>> {
        let mut accounts: Vec<EmailAccount> = guard(&self.accounts)
            .values()
            .filter(|a| a.is_active)
            .cloned()
            .collect();
        accounts.sort_by_key(|a| a.last_synced);
        Ok(accounts)
    }

    async fn get_account(&self, account_id: Uuid) -> StoreResult<Option<EmailAccount>> {
        Ok(guard(&self.accounts).get(&account_id).cloned())
    }

    async fn record_sync(&self, account_id: Uuid, outcome: &SyncOutcome) -> StoreResult<()> {
        let mut accounts = guard(&self.accounts);
        let account = accounts
            .get_mut(&account_id)
            .ok_or_else(|| StoreError::not_found(format!("Email account {account_id}")))?;

        account.sync_status = outcome.status.as_str().to_string();
        account.last_sync_error = outcome.error.clone();
        if let Some(watermark) = outcome.last_synced {
            account.last_synced = Some(watermark);
        }
        Ok(())
    }
}
