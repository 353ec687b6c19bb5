use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

mod action_items;
#[cfg(feature = "diesel")]
mod sql;

pub use action_items::ActionItems;

/// Email struct matching database column order exactly
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "diesel", derive(diesel::Queryable))]
pub struct Email {
    pub id: Uuid,
    pub user_id: Uuid,
    /// Protocol-level identifier (the `Message-ID` header), unique per user
    pub message_id: String,
    pub subject: String,
    /// Raw sender header, e.g. `"Jane Doe <jane@example.com>"`
    pub sender: String,
    pub received_at: DateTime<Utc>,
    pub body_text: Option<String>,
    pub body_html: Option<String>,
    pub snippet: Option<String>,
    pub summary: Option<String>,
    pub category: Option<String>,
    pub sentiment: Option<Sentiment>,
    pub urgency: Option<Urgency>,
    pub action_items: Option<ActionItems>,
    pub created_at: DateTime<Utc>,
    pub analyzed_at: Option<DateTime<Utc>>,
}

impl Email {
    /// Text handed to the AI provider: the plain body, or the snippet when
    /// the body is missing or blank.
    pub fn analysis_input(&self) -> &str {
        match self.body_text.as_deref() {
            Some(body) if !body.trim().is_empty() => body,
            _ => self.snippet.as_deref().unwrap_or_default(),
        }
    }
}

/// Per-user statistics for one sender address
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "diesel", derive(diesel::Queryable))]
pub struct Contact {
    pub id: Uuid,
    pub user_id: Uuid,
    pub email_address: String,
    pub display_name: String,
    pub interaction_count: i64,
    /// Running mean of every sentiment score observed for this contact
    pub avg_sentiment: f64,
    /// Number of observations folded into `avg_sentiment`
    pub sentiment_samples: i64,
    pub last_interaction_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "diesel", derive(diesel::Queryable))]
pub struct EmailAccount {
    pub id: Uuid,
    pub user_id: Uuid,
    pub email_address: String,
    pub imap_server: String,
    pub imap_port: i32,
    pub username: String,
    /// AES-GCM sealed password, base64 encoded
    pub encrypted_secret: String,
    pub last_synced: Option<DateTime<Utc>>,
    pub sync_status: String,
    pub last_sync_error: Option<String>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncStatus {
    Pending,
    Syncing,
    Success,
    Failed,
    AuthRequired,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Pending => "pending",
            SyncStatus::Syncing => "syncing",
            SyncStatus::Success => "success",
            SyncStatus::Failed => "failed",
            SyncStatus::AuthRequired => "auth_required",
        }
    }

    pub fn from_label(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(SyncStatus::Pending),
            "syncing" => Some(SyncStatus::Syncing),
            "success" => Some(SyncStatus::Success),
            "failed" => Some(SyncStatus::Failed),
            "auth_required" => Some(SyncStatus::AuthRequired),
            _ => None,
        }
    }
}

/// Sentiment label attached to an analysed email.
///
/// The numeric scale is stable because it feeds every contact's running
/// average: Positive = 1.0, Neutral = 0.0, Negative = -1.0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "diesel", derive(diesel::AsExpression, diesel::FromSqlRow))]
#[cfg_attr(feature = "diesel", diesel(sql_type = diesel::sql_types::Text))]
pub enum Sentiment {
    Positive,
    Neutral,
    Negative,
}

impl Sentiment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Sentiment::Positive => "positive",
            Sentiment::Neutral => "neutral",
            Sentiment::Negative => "negative",
        }
    }

    /// Parse a label as produced by a model or read back from storage.
    /// Matching ignores case and surrounding whitespace.
    pub fn from_label(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "positive" => Some(Sentiment::Positive),
            "neutral" => Some(Sentiment::Neutral),
            "negative" => Some(Sentiment::Negative),
            _ => None,
        }
    }

    pub fn score(&self) -> f64 {
        match self {
            Sentiment::Positive => 1.0,
            Sentiment::Neutral => 0.0,
            Sentiment::Negative => -1.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "diesel", derive(diesel::AsExpression, diesel::FromSqlRow))]
#[cfg_attr(feature = "diesel", diesel(sql_type = diesel::sql_types::Text))]
pub enum Urgency {
    High,
    Medium,
    Low,
}

impl Urgency {
    pub fn as_str(&self) -> &'static str {
        match self {
            Urgency::High => "high",
            Urgency::Medium => "medium",
            Urgency::Low => "low",
        }
    }

    pub fn from_label(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "high" | "urgent" => Some(Urgency::High),
            "medium" | "normal" => Some(Urgency::Medium),
            "low" => Some(Urgency::Low),
            _ => None,
        }
    }
}
