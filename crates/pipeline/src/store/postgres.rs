//! Postgres store backed by the diesel-async connection pool.

use async_trait::async_trait;
use shared_types::{Contact, Email, EmailAccount};
use uuid::Uuid;

use super::{AccountStore, ContactStore, EmailStore};
use crate::db::{self, DbPool};
use crate::error::{StoreError, StoreResult};
use crate::models::{EmailAnalysisUpdate, Interaction, NewEmail, SentimentObservation, SyncOutcome};

#[derive(Clone)]
pub struct PgStore {
    pool: DbPool,
}

impl PgStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl EmailStore for PgStore {
    async fn exists(&self, user_id: Uuid, message_id: &str) -> StoreResult<bool> {
        let mut conn = self.pool.get().await?;
        Ok(db::emails::exists(&mut conn, user_id, message_id).await?)
    }

    async fn insert(&self, new_email: NewEmail) -> StoreResult<Option<Email>> {
        let mut conn = self.pool.get().await?;
        Ok(db::emails::insert(&mut conn, &new_email).await?)
    }

    async fn get_email(&self, user_id: Uuid, email_id: Uuid) -> StoreResult<Option<Email>> {
        let mut conn = self.pool.get().await?;
        Ok(db::emails::get_by_id(&mut conn, user_id, email_id).await?)
    }

    async fn apply_analysis(
        &self,
        user_id: Uuid,
        email_id: Uuid,
        update: EmailAnalysisUpdate,
    ) -> StoreResult<Email> {
        let mut conn = self.pool.get().await?;
        db::emails::apply_analysis(&mut conn, user_id, email_id, &update)
            .await?
            .ok_or_else(|| StoreError::not_found(format!("Email {email_id}")))
    }

    async fn list_unanalyzed(&self, user_id: Uuid, limit: i64) -> StoreResult<Vec<Email>> {
        let mut conn = self.pool.get().await?;
        Ok(db::emails::list_unanalyzed(&mut conn, user_id, limit).await?)
    }
}

#[async_trait]
impl ContactStore for PgStore {
    async fn record_interaction(&self, interaction: &Interaction) -> StoreResult<Contact> {
        let mut conn = self.pool.get().await?;
        let row = db::contacts::record_interaction(&mut conn, interaction).await?;
        Ok(row.into())
    }

    async fn record_sentiment(&self, observation: &SentimentObservation) -> StoreResult<Contact> {
        let mut conn = self.pool.get().await?;
        let row = db::contacts::record_sentiment(&mut conn, observation).await?;
        Ok(row.into())
    }

    async fn get_contact(&self, user_id: Uuid, email_address: &str) -> StoreResult<Option<Contact>> {
        let mut conn = self.pool.get().await?;
        let row = db::contacts::get_by_address(&mut conn, user_id, email_address).await?;
        Ok(row.map(Contact::from))
    }
}

#[async_trait]
impl AccountStore for PgStore {
    async fn list_active(&self) -> StoreResult<Vec<EmailAccount>> {
        let mut conn = self.pool.get().await?;
        Ok(db::email_accounts::list_active(&mut conn).await?)
    }

    async fn get_account(&self, account_id: Uuid) -> StoreResult<Option<EmailAccount>> {
        let mut conn = self.pool.get().await?;
        Ok(db::email_accounts::get_by_id(&mut conn, account_id).await?)
    }

    async fn record_sync(&self, account_id: Uuid, outcome: &SyncOutcome) -> StoreResult<()> {
        let mut conn = self.pool.get().await?;
        let updated = db::email_accounts::record_sync(&mut conn, account_id, outcome).await?;
        if updated == 0 {
            return Err(StoreError::not_found(format!("Email account {account_id}")));
        }
        Ok(())
    }
}
