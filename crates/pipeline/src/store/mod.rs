//! Data-access seams used by the pipeline.
//!
//! Every read and write is scoped by user id. `postgres` is the production
//! backend; `memory` keeps the same atomicity guarantees in-process and
//! backs the unit tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use shared_types::{Contact, Email, EmailAccount};
use uuid::Uuid;

use crate::error::StoreResult;
use crate::models::{EmailAnalysisUpdate, Interaction, NewEmail, SentimentObservation, SyncOutcome};

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

#[async_trait]
pub trait EmailStore: Send + Sync {
    /// Whether a message with this protocol id is already stored for the user.
    async fn exists(&self, user_id: Uuid, message_id: &str) -> StoreResult<bool>;

    /// Insert a new email. Returns `None` when `(user_id, message_id)` is
    /// already present.
    async fn insert(&self, new_email: NewEmail) -> StoreResult<Option<Email>>;

    async fn get_email(&self, user_id: Uuid, email_id: Uuid) -> StoreResult<Option<Email>>;

    /// Write analysis results onto an email owned by `user_id`.
    async fn apply_analysis(
        &self,
        user_id: Uuid,
        email_id: Uuid,
        update: EmailAnalysisUpdate,
    ) -> StoreResult<Email>;

    /// Emails whose analysis never completed (`analyzed_at` unset), oldest
    /// first.
    async fn list_unanalyzed(&self, user_id: Uuid, limit: i64) -> StoreResult<Vec<Email>>;
}

/// Contact statistics. Each method is a single atomic upsert keyed by
/// `(user_id, email_address)`.
#[async_trait]
pub trait ContactStore: Send + Sync {
    /// Create the contact with one interaction, or bump its count, overwrite
    /// the display name and advance `last_interaction_at` when newer.
    async fn record_interaction(&self, interaction: &Interaction) -> StoreResult<Contact>;

    /// Fold one score into the running average using the number of samples
    /// seen before this one. Does not touch `interaction_count`.
    async fn record_sentiment(&self, observation: &SentimentObservation) -> StoreResult<Contact>;

    async fn get_contact(&self, user_id: Uuid, email_address: &str) -> StoreResult<Option<Contact>>;
}

#[async_trait]
pub trait AccountStore: Send + Sync {
    async fn list_active(&self) -> StoreResult<Vec<EmailAccount>>;

    async fn get_account(&self, account_id: Uuid) -> StoreResult<Option<EmailAccount>>;

    async fn record_sync(&self, account_id: Uuid, outcome: &SyncOutcome) -> StoreResult<()>;
}

/// Incremental mean: fold `value` into `avg`, which summarises `samples`
/// earlier observations.
pub fn incremental_mean(avg: f64, samples: i64, value: f64) -> f64 {
    (avg * samples as f64 + value) / (samples + 1) as f64
}

/// Later of two timestamps; used for `last_interaction_at`.
pub(crate) fn latest(current: DateTime<Utc>, candidate: DateTime<Utc>) -> DateTime<Utc> {
    current.max(candidate)
}
