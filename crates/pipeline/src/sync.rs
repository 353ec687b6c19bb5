//! Account synchronisation.
//!
//! A sync pass connects to one account, ingests its newest messages, announces
//! every new row on the event bus and records the outcome on the account.
//! [`SyncService::run`] repeats that for every active account on a timer.

use chrono::{DateTime, Utc};
use shared_types::{EmailAccount, SyncStatus};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::analysis::{AnalysisJob, ANALYZE_JOB};
use crate::error::{StoreError, SyncError};
use crate::events::{DomainEvent, EmailSyncedEvent, EventBus};
use crate::ingest::{EmailIngestor, IngestReport};
use crate::mail::MailConnector;
use crate::models::SyncOutcome;
use crate::queue::{JobOptions, TaskQueue};
use crate::store::{AccountStore, EmailStore};

/// Upper bound on the IMAP LOGOUT exchange after a pass
const LOGOUT_TIMEOUT: Duration = Duration::from_secs(10);

/// Tracks the last poll time for each account
pub struct RateLimiter {
    last_poll: HashMap<Uuid, Instant>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self {
            last_poll: HashMap::new(),
        }
    }

    /// Check if enough time has passed since last poll
    pub fn can_poll(&self, account_id: Uuid, min_gap: Duration) -> bool {
        match self.last_poll.get(&account_id) {
            Some(last) => last.elapsed() >= min_gap,
            None => true,
        }
    }

    /// Record that we just polled this account
    pub fn record_poll(&mut self, account_id: Uuid) {
        self.last_poll.insert(account_id, Instant::now());
    }

    /// Time left until the account may be polled again
    pub fn until_allowed(&self, account_id: Uuid, min_gap: Duration) -> Duration {
        match self.last_poll.get(&account_id) {
            Some(last) => min_gap.saturating_sub(last.elapsed()),
            None => Duration::ZERO,
        }
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub mailbox: String,
    /// How often `run` walks the active accounts
    pub poll_interval: Duration,
    /// Minimum gap between two syncs of the same account
    pub rate_limit: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            mailbox: "INBOX".to_string(),
            poll_interval: Duration::from_secs(300),
            rate_limit: Duration::from_secs(60),
        }
    }
}

/// What one account sync did
#[derive(Debug, Default)]
pub struct SyncReport {
    pub account_id: Uuid,
    pub created: usize,
    pub published: usize,
    /// New rows whose event a listener rejected
    pub publish_failures: usize,
    pub already_stored: usize,
    pub before_watermark: usize,
    pub failed: usize,
    pub watermark: Option<DateTime<Utc>>,
}

pub struct SyncService {
    accounts: Arc<dyn AccountStore>,
    connector: Arc<dyn MailConnector>,
    ingestor: EmailIngestor,
    bus: Arc<EventBus>,
    config: SyncConfig,
    rate_limiter: Mutex<RateLimiter>,
}

impl SyncService {
    pub fn new(
        accounts: Arc<dyn AccountStore>,
        connector: Arc<dyn MailConnector>,
        ingestor: EmailIngestor,
        bus: Arc<EventBus>,
        config: SyncConfig,
    ) -> Self {
        Self {
            accounts,
            connector,
            ingestor,
            bus,
            config,
            rate_limiter: Mutex::new(RateLimiter::new()),
        }
    }

    /// Sync one account and record the outcome on it.
    pub async fn sync_account(
        &self,
        account: &EmailAccount,
        cancel: &CancellationToken,
    ) -> Result<SyncReport, SyncError> {
        tracing::info!(
            "Syncing account {} ({})",
            account.email_address,
            account.id
        );

        self.accounts
            .record_sync(account.id, &SyncOutcome::syncing())
            .await?;

        match self.pull(account, cancel).await {
            Ok(report) => {
                self.accounts
                    .record_sync(account.id, &SyncOutcome::success(report.watermark))
                    .await?;
                tracing::info!(
                    "Synced {}: {} new, {} already stored, {} failed",
                    account.email_address,
                    report.created,
                    report.already_stored,
                    report.failed
                );
                Ok(report)
            }
            Err(e) => {
                let status = if e.is_auth() {
                    SyncStatus::AuthRequired
                } else {
                    SyncStatus::Failed
                };
                tracing::error!(
                    "Failed to sync account {} ({}): {}",
                    account.email_address,
                    status.as_str(),
                    e
                );

                if let Err(record_err) = self
                    .accounts
                    .record_sync(account.id, &SyncOutcome::failed(status, e.to_string()))
                    .await
                {
                    tracing::error!(
                        "Failed to record sync status for {}: {}",
                        account.id,
                        record_err
                    );
                }
                Err(e)
            }
        }
    }

    pub async fn sync_by_id(
        &self,
        account_id: Uuid,
        cancel: &CancellationToken,
    ) -> Result<SyncReport, SyncError> {
        let account = self
            .accounts
            .get_account(account_id)
            .await?
            .ok_or_else(|| StoreError::not_found(format!("Email account {account_id}")))?;
        self.sync_account(&account, cancel).await
    }

    /// Poll every active account until `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) {
        tracing::info!(
            "Starting sync loop (every {:?}, mailbox {})",
            self.config.poll_interval,
            self.config.mailbox
        );

        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            if let Err(e) = self.poll_all(&cancel).await {
                tracing::error!("Error polling accounts: {}", e);
            }
        }

        tracing::info!("Sync loop stopped");
    }

    async fn poll_all(&self, cancel: &CancellationToken) -> Result<(), SyncError> {
        let accounts = self.accounts.list_active().await?;
        tracing::debug!("Found {} active email accounts", accounts.len());

        for account in accounts {
            if cancel.is_cancelled() {
                break;
            }

            {
                let mut limiter = self
                    .rate_limiter
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner);
                if !limiter.can_poll(account.id, self.config.rate_limit) {
                    tracing::debug!(
                        "Skipping {} for another {:?}",
                        account.email_address,
                        limiter.until_allowed(account.id, self.config.rate_limit)
                    );
                    continue;
                }
                limiter.record_poll(account.id);
            }

            // Failures are already logged and recorded on the account
            let _ = self.sync_account(&account, cancel).await;
        }

        Ok(())
    }

    async fn pull(
        &self,
        account: &EmailAccount,
        cancel: &CancellationToken,
    ) -> Result<SyncReport, SyncError> {
        let started_at = Utc::now();

        let mut session = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(SyncError::Cancelled),
            connected = self.connector.connect(account) => connected?,
        };

        let ingested = self
            .ingestor
            .ingest(
                session.as_mut(),
                account.user_id,
                &self.config.mailbox,
                account.last_synced,
                cancel,
            )
            .await;

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tracing::debug!("Skipping logout from {} on cancel", account.email_address);
            }
            logout = tokio::time::timeout(LOGOUT_TIMEOUT, session.logout()) => match logout {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::debug!("Logout from {} failed: {}", account.email_address, e);
                }
                Err(_) => {
                    tracing::debug!("Logout from {} timed out", account.email_address);
                }
            },
        }

        let IngestReport {
            created,
            already_stored,
            before_watermark,
            failed,
            oldest_failed,
        } = ingested?;

        let mut report = SyncReport {
            account_id: account.id,
            created: created.len(),
            already_stored,
            before_watermark,
            failed,
            watermark: Some(next_watermark(
                account.last_synced,
                started_at,
                oldest_failed,
            )),
            ..Default::default()
        };

        for email in created {
            let email_id = email.id;
            let event: DomainEvent = EmailSyncedEvent {
                user_id: account.user_id,
                email,
            }
            .into();

            match self.bus.publish(&event).await {
                Ok(()) => report.published += 1,
                Err(e) => {
                    tracing::warn!("Failed to publish email {}: {}", email_id, e);
                    report.publish_failures += 1;
                }
            }
        }

        Ok(report)
    }
}

/// Watermark to store after a successful pass that started at `started_at`.
///
/// `Date` headers are chosen by the sender, so only the local clock advances
/// the watermark. A message that failed to persist holds it back so the next
/// pass fetches it again. A stored watermark in the future is pulled back to
/// `started_at`.
pub fn next_watermark(
    previous: Option<DateTime<Utc>>,
    started_at: DateTime<Utc>,
    oldest_failed: Option<DateTime<Utc>>,
) -> DateTime<Utc> {
    let candidate = oldest_failed.map_or(started_at, |failed| failed.min(started_at));
    previous
        .map_or(candidate, |previous| previous.max(candidate))
        .min(started_at)
}

/// Re-queues analysis for stored emails whose analysis never completed, e.g.
/// after a restart dropped jobs from the in-process queue.
pub struct Backfill {
    emails: Arc<dyn EmailStore>,
    queue: Arc<dyn TaskQueue>,
    options: JobOptions,
}

impl Backfill {
    pub fn new(emails: Arc<dyn EmailStore>, queue: Arc<dyn TaskQueue>, options: JobOptions) -> Self {
        Self {
            emails,
            queue,
            options,
        }
    }

    /// Enqueue up to `limit` emails of `user_id` with unfinished analysis,
    /// oldest first.
    pub async fn reanalyze(&self, user_id: Uuid, limit: i64) -> Result<usize, SyncError> {
        let pending = self.emails.list_unanalyzed(user_id, limit).await?;

        for email in &pending {
            let payload = AnalysisJob::new(email.id, user_id).encode()?;
            self.queue.submit(ANALYZE_JOB, payload, self.options).await?;
        }

        tracing::info!("Queued {} emails for re-analysis", pending.len());
        Ok(pending.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ListenerError, MailError, QueueError};
    use crate::events::{Listener, EMAIL_SYNCED};
    use crate::mail::{MailSession, RawMessage};
    use crate::models::{EmailAnalysisUpdate, NewEmail};
    use crate::queue::JobId;
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tokio_test::{assert_err, assert_ok};

    #[derive(Clone, Copy)]
    enum Mode {
        Ok,
        AuthFails,
        FetchFails,
        /// `connect` never returns
        Hangs,
    }

    struct FakeConnector {
        inbox: Arc<Mutex<Vec<RawMessage>>>,
        mode: Mode,
        logouts: Arc<AtomicUsize>,
    }

    struct FakeSession {
        messages: Vec<RawMessage>,
        fail: bool,
        logouts: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl MailSession for FakeSession {
        async fn fetch_recent(
            &mut self,
            _mailbox: &str,
            limit: u32,
        ) -> Result<Vec<RawMessage>, MailError> {
            if self.fail {
                return Err(MailError::Protocol("BYE server shutting down".into()));
            }
            Ok(self.messages.iter().take(limit as usize).cloned().collect())
        }

        async fn logout(&mut self) -> Result<(), MailError> {
            self.logouts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[async_trait]
    impl MailConnector for FakeConnector {
        async fn connect(
            &self,
            _account: &EmailAccount,
        ) -> Result<Box<dyn MailSession>, MailError> {
            match self.mode {
                Mode::AuthFails => return Err(MailError::Auth("Invalid credentials".into())),
                Mode::Hangs => std::future::pending::<()>().await,
                Mode::Ok | Mode::FetchFails => {}
            }
            Ok(Box::new(FakeSession {
                messages: self.inbox.lock().unwrap().clone(),
                fail: matches!(self.mode, Mode::FetchFails),
                logouts: Arc::clone(&self.logouts),
            }))
        }
    }

    /// Counts events; rejects the ones whose subject contains "reject"
    #[derive(Default)]
    struct CountingListener {
        seen: AtomicUsize,
    }

    #[async_trait]
    impl Listener for CountingListener {
        fn name(&self) -> &str {
            "counting"
        }

        async fn handle(&self, event: &DomainEvent) -> Result<(), ListenerError> {
            let DomainEvent::EmailSynced(synced) = event;
            self.seen.fetch_add(1, Ordering::SeqCst);
            if synced.email.subject.contains("reject") {
                return Err(ListenerError::Other(anyhow::anyhow!("rejected")));
            }
            Ok(())
        }
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 6, 1, 8, 0, 0).unwrap()
    }

    fn raw(n: u32, subject: &str) -> RawMessage {
        RawMessage {
            uid: n,
            message_id: format!("<{}@example.com>", n),
            subject: subject.to_string(),
            from: "Boss <boss@example.com>".to_string(),
            date: Some(t0() + chrono::Duration::minutes(n as i64)),
            body_text: Some("Status update".to_string()),
            body_html: None,
        }
    }

    fn account(user_id: Uuid) -> EmailAccount {
        EmailAccount {
            id: Uuid::new_v4(),
            user_id,
            email_address: "me@example.com".to_string(),
            imap_server: "imap.example.com".to_string(),
            imap_port: 993,
            username: "me@example.com".to_string(),
            encrypted_secret: String::new(),
            last_synced: None,
            sync_status: "pending".to_string(),
            last_sync_error: None,
            is_active: true,
            created_at: t0(),
        }
    }

    struct Fixture {
        store: Arc<MemoryStore>,
        inbox: Arc<Mutex<Vec<RawMessage>>>,
        listener: Arc<CountingListener>,
        logouts: Arc<AtomicUsize>,
        service: SyncService,
        account: EmailAccount,
    }

    fn fixture(messages: Vec<RawMessage>, mode: Mode, config: SyncConfig) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let account = account(Uuid::new_v4());
        store.add_account(account.clone());

        let listener = Arc::new(CountingListener::default());
        let mut bus = EventBus::new();
        bus.subscribe(EMAIL_SYNCED, listener.clone());

        let logouts = Arc::new(AtomicUsize::new(0));
        let inbox = Arc::new(Mutex::new(messages));
        let connector = Arc::new(FakeConnector {
            inbox: Arc::clone(&inbox),
            mode,
            logouts: Arc::clone(&logouts),
        });

        let service = SyncService::new(
            store.clone(),
            connector,
            EmailIngestor::new(store.clone(), 50),
            Arc::new(bus),
            config,
        );

        Fixture {
            store,
            inbox,
            listener,
            logouts,
            service,
            account,
        }
    }

    async fn stored_account(fixture: &Fixture) -> EmailAccount {
        fixture
            .store
            .get_account(fixture.account.id)
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_sync_publishes_new_emails_and_advances_watermark() {
        let f = fixture(
            vec![raw(3, "third"), raw(2, "second"), raw(1, "first")],
            Mode::Ok,
            SyncConfig::default(),
        );
        let cancel = CancellationToken::new();

        let before = Utc::now();
        let report = f.service.sync_account(&f.account, &cancel).await.unwrap();
        let watermark = report.watermark.unwrap();

        assert_eq!(report.created, 3);
        assert_eq!(report.published, 3);
        assert!(watermark >= before && watermark <= Utc::now());
        assert_eq!(f.listener.seen.load(Ordering::SeqCst), 3);
        assert_eq!(f.logouts.load(Ordering::SeqCst), 1);

        let account = stored_account(&f).await;
        assert_eq!(account.sync_status, "success");
        assert_eq!(account.last_synced, report.watermark);
        assert!(account.last_sync_error.is_none());

        // A second pass from the stored watermark finds nothing new
        let report = f.service.sync_account(&account, &cancel).await.unwrap();
        assert_eq!(report.created, 0);
        assert_eq!(f.listener.seen.load(Ordering::SeqCst), 3);
        assert_eq!(f.store.emails_for(account.user_id).len(), 3);
    }

    #[tokio::test]
    async fn test_auth_failure_marks_account() {
        let f = fixture(vec![raw(1, "first")], Mode::AuthFails, SyncConfig::default());

        let err = f
            .service
            .sync_account(&f.account, &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(err.is_auth());
        let account = stored_account(&f).await;
        assert_eq!(account.sync_status, "auth_required");
        assert_eq!(
            account.last_sync_error.as_deref(),
            Some("Authentication failed: Invalid credentials")
        );
        assert!(f.store.emails_for(account.user_id).is_empty());
    }

    #[tokio::test]
    async fn test_fetch_failure_marks_account_failed_and_logs_out() {
        let f = fixture(vec![raw(1, "first")], Mode::FetchFails, SyncConfig::default());

        assert_err!(
            f.service
                .sync_account(&f.account, &CancellationToken::new())
                .await
        );

        let account = stored_account(&f).await;
        assert_eq!(account.sync_status, "failed");
        assert!(account.last_sync_error.unwrap().contains("BYE"));
        assert!(account.last_synced.is_none());
        assert_eq!(f.logouts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_publish_failure_does_not_stop_other_events() {
        let f = fixture(
            vec![raw(3, "third"), raw(2, "please reject"), raw(1, "first")],
            Mode::Ok,
            SyncConfig::default(),
        );

        let report = f
            .service
            .sync_account(&f.account, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.created, 3);
        assert_eq!(report.published, 2);
        assert_eq!(report.publish_failures, 1);
        assert_eq!(f.listener.seen.load(Ordering::SeqCst), 3);
        assert_eq!(stored_account(&f).await.sync_status, "success");
    }

    #[tokio::test]
    async fn test_watermark_never_moves_backwards() {
        let mut f = fixture(vec![raw(1, "old")], Mode::Ok, SyncConfig::default());
        let previous = Utc::now() - chrono::Duration::hours(1);
        f.account.last_synced = Some(previous);

        let report = f
            .service
            .sync_account(&f.account, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.before_watermark, 1);
        assert!(report.watermark.unwrap() >= previous);
    }

    #[tokio::test]
    async fn test_future_dated_message_does_not_hide_later_mail() {
        let mut spam = raw(1, "from the future");
        spam.date = Some(Utc.with_ymd_and_hms(2099, 1, 1, 0, 0, 0).unwrap());
        let f = fixture(vec![spam.clone()], Mode::Ok, SyncConfig::default());
        let cancel = CancellationToken::new();

        let report = f.service.sync_account(&f.account, &cancel).await.unwrap();
        assert_eq!(report.created, 1);
        assert!(report.watermark.unwrap() <= Utc::now());

        let mut real = raw(2, "real");
        real.date = Some(Utc::now() + chrono::Duration::minutes(5));
        *f.inbox.lock().unwrap() = vec![real, spam];

        let account = stored_account(&f).await;
        let report = f.service.sync_account(&account, &cancel).await.unwrap();
        assert_eq!(report.created, 1);
        assert_eq!(report.before_watermark, 0);
        assert_eq!(report.already_stored, 1);
        assert_eq!(f.store.emails_for(account.user_id).len(), 2);
    }

    #[test]
    fn test_next_watermark() {
        let now = t0();
        let hour = chrono::Duration::hours(1);

        assert_eq!(next_watermark(None, now, None), now);
        assert_eq!(next_watermark(Some(now - hour), now, None), now);
        // A stored watermark in the future is pulled back to the clock
        assert_eq!(next_watermark(Some(now + hour), now, None), now);
        // Failed messages hold it back, but never behind the stored one
        assert_eq!(next_watermark(None, now, Some(now - hour)), now - hour);
        assert_eq!(
            next_watermark(Some(now - hour * 2), now, Some(now - hour)),
            now - hour
        );
        assert_eq!(next_watermark(None, now, Some(now + hour)), now);
    }

    /// Refuses to insert `poisoned` until `healed` is set
    struct RefusingStore {
        inner: Arc<MemoryStore>,
        poisoned: String,
        healed: AtomicBool,
    }

    #[async_trait]
    impl EmailStore for RefusingStore {
        async fn exists(&self, user_id: Uuid, message_id: &str) -> Result<bool, StoreError> {
            self.inner.exists(user_id, message_id).await
        }

        async fn insert(
            &self,
            new_email: NewEmail,
        ) -> Result<Option<shared_types::Email>, StoreError> {
            if new_email.message_id == self.poisoned && !self.healed.load(Ordering::SeqCst) {
                return Err(StoreError::invalid("connection reset"));
            }
            self.inner.insert(new_email).await
        }

        async fn get_email(
            &self,
            user_id: Uuid,
            email_id: Uuid,
        ) -> Result<Option<shared_types::Email>, StoreError> {
            self.inner.get_email(user_id, email_id).await
        }

        async fn apply_analysis(
            &self,
            user_id: Uuid,
            email_id: Uuid,
            update: EmailAnalysisUpdate,
        ) -> Result<shared_types::Email, StoreError> {
            self.inner.apply_analysis(user_id, email_id, update).await
        }

        async fn list_unanalyzed(
            &self,
            user_id: Uuid,
            limit: i64,
        ) -> Result<Vec<shared_types::Email>, StoreError> {
            self.inner.list_unanalyzed(user_id, limit).await
        }
    }

    #[tokio::test]
    async fn test_failed_message_is_fetched_again() {
        let store = Arc::new(MemoryStore::new());
        let account = account(Uuid::new_v4());
        store.add_account(account.clone());

        let mut ok = raw(1, "stored");
        ok.date = Some(Utc::now() - chrono::Duration::hours(2));
        let mut bad = raw(2, "refused once");
        bad.date = Some(Utc::now() - chrono::Duration::hours(1));

        let emails = Arc::new(RefusingStore {
            inner: store.clone(),
            poisoned: bad.message_id.clone(),
            healed: AtomicBool::new(false),
        });
        let service = SyncService::new(
            store.clone(),
            Arc::new(FakeConnector {
                inbox: Arc::new(Mutex::new(vec![bad.clone(), ok])),
                mode: Mode::Ok,
                logouts: Arc::new(AtomicUsize::new(0)),
            }),
            EmailIngestor::new(emails.clone(), 50),
            Arc::new(EventBus::new()),
            SyncConfig::default(),
        );
        let cancel = CancellationToken::new();

        let report = service.sync_account(&account, &cancel).await.unwrap();
        assert_eq!(report.created, 1);
        assert_eq!(report.failed, 1);
        assert_eq!(report.watermark, bad.date);

        emails.healed.store(true, Ordering::SeqCst);
        let account = store.get_account(account.id).await.unwrap().unwrap();
        let report = service.sync_account(&account, &cancel).await.unwrap();
        assert_eq!(report.created, 1);
        assert_eq!(report.failed, 0);
        assert_eq!(store.emails_for(account.user_id).len(), 2);
    }

    #[tokio::test]
    async fn test_cancel_interrupts_hanging_connect() {
        let f = fixture(vec![raw(1, "first")], Mode::Hangs, SyncConfig::default());

        let cancelled = CancellationToken::new();
        cancelled.cancel();
        let result = tokio::time::timeout(
            Duration::from_secs(1),
            f.service.sync_account(&f.account, &cancelled),
        )
        .await
        .unwrap();
        assert!(matches!(result, Err(SyncError::Cancelled)));

        // Cancelled while already waiting on the server
        let cancel = CancellationToken::new();
        tokio::spawn({
            let cancel = cancel.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                cancel.cancel();
            }
        });
        let result = tokio::time::timeout(
            Duration::from_secs(1),
            f.service.sync_account(&f.account, &cancel),
        )
        .await
        .unwrap();
        assert!(matches!(result, Err(SyncError::Cancelled)));

        let account = stored_account(&f).await;
        assert_eq!(account.sync_status, "failed");
        assert_eq!(account.last_sync_error.as_deref(), Some("Sync cancelled"));
        assert!(account.last_synced.is_none());
        assert_eq!(f.logouts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_sync_by_id_unknown_account() {
        let f = fixture(vec![], Mode::Ok, SyncConfig::default());

        let err = f
            .service
            .sync_by_id(Uuid::new_v4(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Store(StoreError::NotFound(_))));

        assert_ok!(
            f.service
                .sync_by_id(f.account.id, &CancellationToken::new())
                .await
        );
    }

    #[tokio::test]
    async fn test_run_polls_until_cancelled() {
        let f = fixture(
            vec![raw(1, "first")],
            Mode::Ok,
            SyncConfig {
                poll_interval: Duration::from_millis(10),
                rate_limit: Duration::from_secs(3600),
                ..Default::default()
            },
        );
        let service = Arc::new(f.service);
        let cancel = CancellationToken::new();

        let handle = tokio::spawn({
            let service = Arc::clone(&service);
            let cancel = cancel.clone();
            async move { service.run(cancel).await }
        });

        let synced = tokio::time::timeout(Duration::from_secs(5), async {
            while f.store.emails_for(f.account.user_id).is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;
        assert_ok!(synced);

        // Let a few more ticks pass; the rate limit keeps the account idle
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        assert_ok!(tokio::time::timeout(Duration::from_secs(5), handle).await);

        assert_eq!(f.logouts.load(Ordering::SeqCst), 1);
        assert_eq!(f.listener.seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_rate_limiter() {
        let mut limiter = RateLimiter::new();
        let id = Uuid::new_v4();
        let gap = Duration::from_secs(60);

        assert!(limiter.can_poll(id, gap));
        assert_eq!(limiter.until_allowed(id, gap), Duration::ZERO);

        limiter.record_poll(id);
        assert!(!limiter.can_poll(id, gap));
        assert!(limiter.until_allowed(id, gap) > Duration::from_secs(59));
        assert!(limiter.can_poll(id, Duration::ZERO));
        assert!(limiter.can_poll(Uuid::new_v4(), gap));
    }

    #[derive(Default)]
    struct RecordingQueue {
        submitted: Mutex<Vec<Vec<u8>>>,
    }

    #[async_trait]
    impl TaskQueue for RecordingQueue {
        async fn submit(
            &self,
            _job_type: &str,
            payload: Vec<u8>,
            _options: JobOptions,
        ) -> Result<JobId, QueueError> {
            self.submitted.lock().unwrap().push(payload);
            Ok(JobId::new())
        }
    }

    #[tokio::test]
    async fn test_backfill_requeues_only_unanalyzed() {
        let store = Arc::new(MemoryStore::new());
        let user_id = Uuid::new_v4();

        let mut ids = Vec::new();
        for n in 0..3 {
            let email = store
                .insert(NewEmail {
                    user_id,
                    message_id: format!("<{}@example.com>", n),
                    subject: "hello".to_string(),
                    sender: "a@example.com".to_string(),
                    received_at: t0() + chrono::Duration::minutes(n),
                    body_text: None,
                    body_html: None,
                    snippet: None,
                })
                .await
                .unwrap()
                .unwrap();
            ids.push(email.id);
        }
        store
            .apply_analysis(
                user_id,
                ids[1],
                EmailAnalysisUpdate {
                    summary: Some("done".to_string()),
                    analyzed_at: Some(Utc::now()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let queue = Arc::new(RecordingQueue::default());
        let backfill = Backfill::new(store.clone(), queue.clone(), JobOptions::default());

        assert_eq!(backfill.reanalyze(user_id, 10).await.unwrap(), 2);
        assert_eq!(backfill.reanalyze(Uuid::new_v4(), 10).await.unwrap(), 0);

        let jobs: Vec<AnalysisJob> = queue
            .submitted
            .lock()
            .unwrap()
            .iter()
            .map(|p| AnalysisJob::decode(p).unwrap())
            .collect();
        assert_eq!(
            jobs,
            vec![
                AnalysisJob::new(ids[0], user_id),
                AnalysisJob::new(ids[2], user_id)
            ]
        );
    }
}
