//! Wiring of the analysis queue and the event bus.
//!
//! Listener order matters: the analysis job is queued before the sender's
//! interaction is counted, and a failed enqueue stops the contact update for
//! that email.

use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::analysis::{AnalysisWorker, SentimentAnalyzer, Summarizer, ANALYZE_JOB};
use crate::contacts::ContactAggregator;
use crate::events::{AnalysisListener, ContactListener, EventBus, EMAIL_SYNCED};
use crate::queue::{JobOptions, LocalQueueConfig, LocalTaskQueue, TaskQueue};
use crate::store::EmailStore;

/// Start a local queue whose only consumer is the analysis worker.
pub fn start_analysis_queue(
    emails: Arc<dyn EmailStore>,
    contacts: Arc<ContactAggregator>,
    summarizer: Arc<dyn Summarizer>,
    sentiment: Arc<dyn SentimentAnalyzer>,
    config: LocalQueueConfig,
    shutdown: CancellationToken,
) -> LocalTaskQueue {
    let worker = AnalysisWorker::new(emails, contacts, summarizer, sentiment);
    LocalTaskQueue::builder(config)
        .handler(ANALYZE_JOB, Arc::new(worker))
        .start(shutdown)
}

/// Bus with the analysis listener first and the contact listener second.
pub fn build_event_bus(
    queue: Arc<dyn TaskQueue>,
    analysis_job: JobOptions,
    contacts: Arc<ContactAggregator>,
) -> EventBus {
    let mut bus = EventBus::new();
    bus.subscribe(
        EMAIL_SYNCED,
        Arc::new(AnalysisListener::new(queue, analysis_job)),
    );
    bus.subscribe(EMAIL_SYNCED, Arc::new(ContactListener::new(contacts)));
    bus
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::{SentimentResult, SummaryResult};
    use crate::error::{AiError, MailError};
    use crate::ingest::EmailIngestor;
    use crate::mail::{MailConnector, MailSession, RawMessage};
    use crate::store::{AccountStore, MemoryStore};
    use crate::sync::{SyncConfig, SyncService};
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use shared_types::{ActionItems, EmailAccount, Sentiment, Urgency};
    use std::time::Duration;
    use tokio_test::assert_ok;
    use uuid::Uuid;

    struct OneMessage;

    #[async_trait]
    impl MailSession for OneMessage {
        async fn fetch_recent(
            &mut self,
            _mailbox: &str,
            _limit: u32,
        ) -> Result<Vec<RawMessage>, MailError> {
            Ok(vec![RawMessage {
                uid: 7,
                message_id: "<123@x.com>".to_string(),
                subject: "Update on Project Alpha".to_string(),
                from: "Boss <boss@example.com>".to_string(),
                date: Some(Utc.with_ymd_and_hms(2026, 3, 9, 14, 0, 0).unwrap()),
                body_text: Some("Great news, the launch went well.".to_string()),
                body_html: None,
            }])
        }

        async fn logout(&mut self) -> Result<(), MailError> {
            Ok(())
        }
    }

    struct OneMessageConnector;

    #[async_trait]
    impl MailConnector for OneMessageConnector {
        async fn connect(
            &self,
            _account: &EmailAccount,
        ) -> Result<Box<dyn MailSession>, MailError> {
            Ok(Box::new(OneMessage))
        }
    }

    struct FakeAi;

    #[async_trait]
    impl Summarizer for FakeAi {
        async fn summarize(&self, _text: &str) -> Result<SummaryResult, AiError> {
            Ok(SummaryResult {
                summary: "Launch went well".to_string(),
                category: Some("work".to_string()),
                sentiment: None,
                urgency: None,
                action_items: ActionItems::new(["Send congratulations"]),
            })
        }
    }

    #[async_trait]
    impl SentimentAnalyzer for FakeAi {
        async fn analyze_sentiment(&self, _text: &str) -> Result<SentimentResult, AiError> {
            Ok(SentimentResult {
                sentiment: Sentiment::Positive,
                urgency: Some(Urgency::Low),
            })
        }
    }

    #[tokio::test]
    async fn test_synced_email_is_analysed_and_counted_once() {
        let store = Arc::new(MemoryStore::new());
        let user_id = Uuid::new_v4();
        let account = EmailAccount {
            id: Uuid::new_v4(),
            user_id,
            email_address: "me@example.com".to_string(),
            imap_server: "imap.example.com".to_string(),
            imap_port: 993,
            username: "me".to_string(),
            encrypted_secret: String::new(),
            last_synced: None,
            sync_status: "pending".to_string(),
            last_sync_error: None,
            is_active: true,
            created_at: Utc::now(),
        };
        store.add_account(account.clone());

        let contacts = Arc::new(ContactAggregator::new(store.clone()));
        let ai = Arc::new(FakeAi);
        let shutdown = CancellationToken::new();
        let queue = start_analysis_queue(
            store.clone(),
            contacts.clone(),
            ai.clone(),
            ai,
            LocalQueueConfig::default(),
            shutdown.clone(),
        );
        let bus = build_event_bus(Arc::new(queue.clone()), JobOptions::default(), contacts);
        assert_eq!(bus.listener_count(EMAIL_SYNCED), 2);

        let service = SyncService::new(
            store.clone(),
            Arc::new(OneMessageConnector),
            EmailIngestor::new(store.clone(), 50),
            Arc::new(bus),
            SyncConfig::default(),
        );

        let report = service.sync_account(&account, &shutdown).await.unwrap();
        assert_eq!(report.created, 1);
        assert_ok!(tokio::time::timeout(Duration::from_secs(5), queue.wait_idle()).await);

        // Same message again: nothing new is stored, queued or counted
        let account = store.get_account(account.id).await.unwrap().unwrap();
        let report = service.sync_account(&account, &shutdown).await.unwrap();
        assert_eq!(report.created, 0);
        assert_ok!(tokio::time::timeout(Duration::from_secs(5), queue.wait_idle()).await);

        let emails = store.emails_for(user_id);
        assert_eq!(emails.len(), 1);
        assert_eq!(emails[0].summary.as_deref(), Some("Launch went well"));
        assert_eq!(emails[0].category.as_deref(), Some("work"));
        assert_eq!(emails[0].sentiment, Some(Sentiment::Positive));
        assert_eq!(emails[0].urgency, Some(Urgency::Low));
        assert!(emails[0].analyzed_at.is_some());

        let contacts = store.contacts_for(user_id);
        assert_eq!(contacts.len(), 1);
        assert_eq!(contacts[0].email_address, "boss@example.com");
        assert_eq!(contacts[0].display_name, "Boss");
        assert_eq!(contacts[0].interaction_count, 1);
        assert_eq!(contacts[0].sentiment_samples, 1);
        assert_eq!(contacts[0].avg_sentiment, 1.0);

        let stats = queue.stats();
        assert_eq!(stats.submitted, 1);
        assert_eq!(stats.succeeded, 1);
        assert_eq!(stats.dead_lettered, 0);

        queue.shutdown().await;
    }
}
