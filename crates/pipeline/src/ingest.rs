//! Mailbox ingestion.
//!
//! Pulls the most recent messages from a [`MailSession`], drops the ones the
//! user already has, and persists the rest. Publishing events for the new
//! rows is the caller's job.

use chrono::{DateTime, Utc};
use regex::Regex;
use shared_types::Email;
use std::future::Future;
use std::sync::{Arc, LazyLock};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{IngestError, StoreResult};
use crate::mail::{MailSession, RawMessage};
use crate::models::NewEmail;
use crate::store::EmailStore;

const SNIPPET_CHARS: usize = 200;

static BLOCK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)<(script|style|head)\b.*?</(script|style|head)\s*>").expect("static pattern")
});
static TAG_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<[^>]*>").expect("static pattern"));

/// What one ingestion pass did
#[derive(Debug, Default)]
pub struct IngestReport {
    /// Rows created by this pass, in fetch order
    pub created: Vec<Email>,
    pub already_stored: usize,
    pub before_watermark: usize,
    /// Messages skipped because persisting them failed
    pub failed: usize,
    /// Earliest `Date` among the failed messages. The next pass must not
    /// filter them out by watermark.
    pub oldest_failed: Option<DateTime<Utc>>,
}

impl IngestReport {
    fn record_failure(&mut self, message: &RawMessage) {
        self.failed += 1;
        if let Some(date) = message.date {
            self.oldest_failed = Some(self.oldest_failed.map_or(date, |d| d.min(date)));
        }
    }
}

pub struct EmailIngestor {
    store: Arc<dyn EmailStore>,
    fetch_limit: u32,
}

impl EmailIngestor {
    pub fn new(store: Arc<dyn EmailStore>, fetch_limit: u32) -> Self {
        Self { store, fetch_limit }
    }

    /// Ingest the most recent messages of `mailbox` for `user_id`.
    ///
    /// Messages dated strictly before `last_synced` are skipped. Fetch
    /// failures abort the call; a message that fails to persist is logged and
    /// skipped. On cancellation, rows written so far stay written.
    pub async fn ingest(
        &self,
        session: &mut dyn MailSession,
        user_id: Uuid,
        mailbox: &str,
        last_synced: Option<DateTime<Utc>>,
        cancel: &CancellationToken,
    ) -> Result<IngestReport, IngestError> {
        let messages = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(IngestError::Cancelled),
            fetched = session.fetch_recent(mailbox, self.fetch_limit) => fetched?,
        };

        tracing::debug!(
            "Fetched {} messages from {} for user {}",
            messages.len(),
            mailbox,
            user_id
        );

        let mut report = IngestReport::default();

        for message in messages {
            if cancel.is_cancelled() {
                tracing::info!(
                    "Ingestion cancelled after storing {} new emails",
                    report.created.len()
                );
                return Err(IngestError::Cancelled);
            }

            if let (Some(date), Some(watermark)) = (message.date, last_synced) {
                if date < watermark {
                    report.before_watermark += 1;
                    continue;
                }
            }

            let exists = self
                .store_call(cancel, self.store.exists(user_id, &message.message_id))
                .await?;
            match exists {
                Ok(true) => {
                    report.already_stored += 1;
                    continue;
                }
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!("Failed to check {}: {}", message.message_id, e);
                    report.record_failure(&message);
                    continue;
                }
            }

            let new_email = to_new_email(user_id, &message);
            match self.store_call(cancel, self.store.insert(new_email)).await? {
                Ok(Some(email)) => {
                    tracing::debug!("Stored: {} - {}", email.message_id, email.subject);
                    report.created.push(email);
                }
                Ok(None) => {
                    tracing::trace!("Skipped (duplicate): {}", message.message_id);
                    report.already_stored += 1;
                }
                Err(e) => {
                    tracing::warn!("Failed to store {}: {}", message.message_id, e);
                    report.record_failure(&message);
                }
            }
        }

        Ok(report)
    }

    /// Run a store call unless the token fires first.
    async fn store_call<T>(
        &self,
        cancel: &CancellationToken,
        call: impl Future<Output = StoreResult<T>>,
    ) -> Result<StoreResult<T>, IngestError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(IngestError::Cancelled),
            result = call => Ok(result),
        }
    }
}

fn to_new_email(user_id: Uuid, message: &RawMessage) -> NewEmail {
    NewEmail {
        user_id,
        message_id: message.message_id.clone(),
        subject: message.subject.clone(),
        sender: message.from.clone(),
        received_at: message.date.unwrap_or_else(Utc::now),
        body_text: message.body_text.clone(),
        body_html: message.body_html.clone(),
        snippet: build_snippet(message.body_text.as_deref(), message.body_html.as_deref()),
    }
}

/// First 200 characters of the text body on one line, falling back to the
/// HTML body with markup removed.
pub fn build_snippet(body_text: Option<&str>, body_html: Option<&str>) -> Option<String> {
    let source = match body_text.filter(|t| !t.trim().is_empty()) {
        Some(text) => text.to_string(),
        None => strip_html(body_html?),
    };

    let flattened = source.split_whitespace().collect::<Vec<_>>().join(" ");
    if flattened.is_empty() {
        return None;
    }
    Some(flattened.chars().take(SNIPPET_CHARS).collect())
}

fn strip_html(html: &str) -> String {
    let without_blocks = BLOCK_RE.replace_all(html, " ");
    let text = TAG_RE.replace_all(&without_blocks, " ");
    text.replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&")
}
