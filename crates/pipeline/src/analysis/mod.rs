//! Email analysis jobs.
//!
//! [`AnalysisJob`] is the queue payload; [`AnalysisWorker`] is its consumer.
//! The worker summarises the email, classifies its sentiment, writes both
//! back onto the row and feeds the sentiment into the sender's contact
//! statistics. `analyzed_at` is stamped last, once the contact update has
//! landed, and is what marks a job as done.

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use shared_types::Email;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::contacts::{parse_sender, ContactAggregator};
use crate::error::JobError;
use crate::models::EmailAnalysisUpdate;
use crate::queue::JobHandler;
use crate::store::EmailStore;

pub mod ai;

pub use ai::{
    AiConfig, OpenAiCompatClient, SentimentAnalyzer, SentimentResult, SummaryResult, Summarizer,
};

/// Job type under which analysis jobs are queued
pub const ANALYZE_JOB: &str = "email:analyze";

/// Queue payload. Both fields are required when decoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalysisJob {
    pub email_id: Uuid,
    pub user_id: Uuid,
}

impl AnalysisJob {
    pub fn new(email_id: Uuid, user_id: Uuid) -> Self {
        Self { email_id, user_id }
    }

    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn decode(payload: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(payload)
    }
}

#[derive(Debug)]
pub enum AnalysisOutcome {
    Analyzed(Box<Email>),
    /// Analysis of the email already completed; redelivered jobs end here
    AlreadyAnalyzed,
}

pub struct AnalysisWorker {
    emails: Arc<dyn EmailStore>,
    contacts: Arc<ContactAggregator>,
    summarizer: Arc<dyn Summarizer>,
    sentiment: Arc<dyn SentimentAnalyzer>,
}

impl AnalysisWorker {
    pub fn new(
        emails: Arc<dyn EmailStore>,
        contacts: Arc<ContactAggregator>,
        summarizer: Arc<dyn Summarizer>,
        sentiment: Arc<dyn SentimentAnalyzer>,
    ) -> Self {
        Self {
            emails,
            contacts,
            summarizer,
            sentiment,
        }
    }

    pub async fn analyze(&self, job: &AnalysisJob) -> Result<AnalysisOutcome, JobError> {
        let email = self
            .emails
            .get_email(job.user_id, job.email_id)
            .await
            .context("Failed to load email")
            .map_err(JobError::Retryable)?
            // Most likely the row is not visible yet; let the queue try again
            .ok_or_else(|| {
                JobError::retryable(anyhow!(
                    "Email {} not found for user {}",
                    job.email_id,
                    job.user_id
                ))
            })?;

        if email.analyzed_at.is_some() {
            debug!("Email {} already analysed, skipping", email.id);
            return Ok(AnalysisOutcome::AlreadyAnalyzed);
        }

        let input = match email.analysis_input() {
            "" => email.subject.as_str(),
            text => text,
        };

        let summary = self
            .summarizer
            .summarize(input)
            .await
            .context("Summarisation failed")
            .map_err(JobError::Retryable)?;

        let sentiment = match self.sentiment.analyze_sentiment(input).await {
            Ok(result) => Some(result),
            Err(e) => {
                warn!(
                    "Sentiment analysis failed for email {}, keeping summary only: {}",
                    email.id, e
                );
                None
            }
        };

        let update = EmailAnalysisUpdate {
            summary: Some(summary.summary),
            category: summary.category,
            action_items: Some(summary.action_items),
            sentiment: sentiment.map(|s| s.sentiment),
            urgency: sentiment.and_then(|s| s.urgency),
            analyzed_at: None,
        };

        self.emails
            .apply_analysis(job.user_id, job.email_id, update)
            .await
            .context("Failed to store analysis")
            .map_err(JobError::Retryable)?;

        if let Some(result) = sentiment {
            let (address, _) = parse_sender(&email.sender);
            if !address.is_empty() {
                self.contacts
                    .record_sentiment(
                        job.user_id,
                        &address,
                        result.sentiment.score(),
                        email.received_at,
                    )
                    .await
                    .context("Failed to update contact sentiment")
                    .map_err(JobError::Retryable)?;
            }
        }

        // A failure from here on re-runs the contact update on retry
        let done = EmailAnalysisUpdate {
            analyzed_at: Some(Utc::now()),
            ..Default::default()
        };
        let updated = self
            .emails
            .apply_analysis(job.user_id, job.email_id, done)
            .await
            .context("Failed to mark email analysed")
            .map_err(JobError::Retryable)?;

        info!(
            "Analysed email {} ({}): sentiment {}",
            updated.id,
            updated.subject,
            updated.sentiment.map(|s| s.as_str()).unwrap_or("unknown")
        );
        Ok(AnalysisOutcome::Analyzed(Box::new(updated)))
    }
}

#[async_trait]
impl JobHandler for AnalysisWorker {
    async fn handle(&self, payload: &[u8]) -> Result<(), JobError> {
        // A payload that does not decode now never will
        let job = AnalysisJob::decode(payload)
            .context("Malformed analysis job payload")
            .map_err(JobError::Permanent)?;

        self.analyze(&job).await.map(|_| ())
    }
}
