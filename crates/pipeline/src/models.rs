// Database write models for Diesel
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use shared_types::{ActionItems, Contact, Sentiment, Urgency};
use uuid::Uuid;

/// Insertable struct for new emails
#[derive(Debug, Clone, PartialEq, Insertable)]
#[diesel(table_name = crate::schema::emails)]
pub struct NewEmail {
    pub user_id: Uuid,
    pub message_id: String,
    pub subject: String,
    pub sender: String,
    pub received_at: DateTime<Utc>,
    pub body_text: Option<String>,
    pub body_html: Option<String>,
    pub snippet: Option<String>,
}

/// Enrichment written back by the analysis worker.
///
/// `None` fields are left untouched, so a failed sentiment call keeps
/// whatever sentiment/urgency the row already had.
#[derive(Debug, Clone, Default, PartialEq, AsChangeset)]
#[diesel(table_name = crate::schema::emails)]
pub struct EmailAnalysisUpdate {
    pub summary: Option<String>,
    pub category: Option<String>,
    pub action_items: Option<ActionItems>,
    pub sentiment: Option<Sentiment>,
    pub urgency: Option<Urgency>,
    pub analyzed_at: Option<DateTime<Utc>>,
}

/// Contact row read back from raw upsert statements
#[derive(Debug, Clone, QueryableByName, Selectable, Queryable)]
#[diesel(table_name = crate::schema::contacts)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct ContactRow {
    pub id: Uuid,
    pub user_id: Uuid,
    pub email_address: String,
    pub display_name: String,
    pub interaction_count: i64,
    pub avg_sentiment: f64,
    pub sentiment_samples: i64,
    pub last_interaction_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<ContactRow> for Contact {
    fn from(row: ContactRow) -> Self {
        Contact {
            id: row.id,
            user_id: row.user_id,
            email_address: row.email_address,
            display_name: row.display_name,
            interaction_count: row.interaction_count,
            avg_sentiment: row.avg_sentiment,
            sentiment_samples: row.sentiment_samples,
            last_interaction_at: row.last_interaction_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

/// Result of one sync attempt for an account
#[derive(Debug, Clone, PartialEq)]
pub struct SyncOutcome {
    pub status: shared_types::SyncStatus,
    pub error: Option<String>,
    /// New watermark; `None` keeps the stored one
    pub last_synced: Option<DateTime<Utc>>,
}

impl SyncOutcome {
    pub fn syncing() -> Self {
        Self {
            status: shared_types::SyncStatus::Syncing,
            error: None,
            last_synced: None,
        }
    }

    pub fn success(watermark: Option<DateTime<Utc>>) -> Self {
        Self {
            status: shared_types::SyncStatus::Success,
            error: None,
            last_synced: watermark,
        }
    }

    pub fn failed(status: shared_types::SyncStatus, error: impl Into<String>) -> Self {
        Self {
            status,
            error: Some(error.into()),
            last_synced: None,
        }
    }
}

/// One observed message from a sender, before analysis
#[derive(Debug, Clone, PartialEq)]
pub struct Interaction {
    pub user_id: Uuid,
    pub email_address: String,
    pub display_name: String,
    pub at: DateTime<Utc>,
}

/// One sentiment score to fold into a contact's running average
#[derive(Debug, Clone, PartialEq)]
pub struct SentimentObservation {
    pub user_id: Uuid,
    pub email_address: String,
    pub value: f64,
    pub at: DateTime<Utc>,
}
