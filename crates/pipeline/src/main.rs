use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use mail_pipeline::analysis::OpenAiCompatClient;
use mail_pipeline::config::PipelineConfig;
use mail_pipeline::contacts::ContactAggregator;
use mail_pipeline::credentials::CredentialCipher;
use mail_pipeline::db;
use mail_pipeline::events::EventBus;
use mail_pipeline::ingest::EmailIngestor;
use mail_pipeline::mail::ImapConnector;
use mail_pipeline::pipeline::{build_event_bus, start_analysis_queue};
use mail_pipeline::queue::LocalTaskQueue;
use mail_pipeline::store::PgStore;
use mail_pipeline::sync::{Backfill, SyncService};

/// How long shutdown waits for queued analysis jobs
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Parser)]
#[command(name = "mail-pipeline")]
#[command(about = "Sync mailboxes, analyse new email and keep contact statistics")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Poll every active account until interrupted
    Run,

    /// Sync one account now and wait for its analysis jobs
    Sync {
        /// Email account id
        #[arg(long, value_name = "UUID")]
        account: Uuid,
    },

    /// Queue analysis for a user's emails whose analysis never completed
    Reanalyze {
        #[arg(long, value_name = "UUID")]
        user: Uuid,

        /// Maximum number of emails to queue
        #[arg(long, default_value_t = 100)]
        limit: i64,
    },

    /// Encrypt an account password for the email_accounts table
    EncryptSecret {
        plaintext: String,

        /// Base64 AES-256 key
        #[arg(long, env = "CREDENTIALS_KEY", hide_env_values = true)]
        key: String,
    },

    /// Print a fresh base64 key suitable for CREDENTIALS_KEY
    GenerateKey,
}

/// Long-lived pieces shared by the database-backed subcommands
struct Runtime {
    config: PipelineConfig,
    store: Arc<PgStore>,
    queue: LocalTaskQueue,
    bus: Arc<EventBus>,
    shutdown: CancellationToken,
}

impl Runtime {
    fn build(config: PipelineConfig) -> Result<Self> {
        let pool = db::establish_connection_pool(&config.database_url, config.database_pool_size)?;
        let store = Arc::new(PgStore::new(pool));

        let ai = Arc::new(
            OpenAiCompatClient::new(config.ai.clone()).context("Failed to build AI client")?,
        );
        let contacts = Arc::new(ContactAggregator::new(store.clone()));
        let shutdown = CancellationToken::new();

        let queue = start_analysis_queue(
            store.clone(),
            contacts.clone(),
            ai.clone(),
            ai,
            config.queue.clone(),
            shutdown.clone(),
        );
        let bus = build_event_bus(Arc::new(queue.clone()), config.analysis_job, contacts);

        Ok(Self {
            config,
            store,
            queue,
            bus: Arc::new(bus),
            shutdown,
        })
    }

    /// Only the subcommands that talk IMAP need the credentials key.
    fn sync_service(&self) -> Result<SyncService> {
        let key = self
            .config
            .credentials_key
            .as_deref()
            .context("CREDENTIALS_KEY must be set to sync IMAP accounts")?;
        let cipher = CredentialCipher::from_base64_key(key).context("Invalid CREDENTIALS_KEY")?;

        Ok(SyncService::new(
            self.store.clone(),
            Arc::new(ImapConnector::new(cipher)),
            EmailIngestor::new(self.store.clone(), self.config.fetch_limit),
            self.bus.clone(),
            self.config.sync.clone(),
        ))
    }

    /// Let queued jobs finish (bounded), then stop the workers.
    async fn drain(&self) {
        if tokio::time::timeout(DRAIN_TIMEOUT, self.queue.wait_idle())
            .await
            .is_err()
        {
            tracing::warn!(
                "Gave up waiting for {} analysis jobs",
                self.queue.stats().in_flight
            );
        }
        self.queue.shutdown().await;

        let stats = self.queue.stats();
        tracing::info!(
            "Analysis queue: {} submitted, {} succeeded, {} retried, {} dead-lettered, {} dropped",
            stats.submitted,
            stats.succeeded,
            stats.retried,
            stats.dead_lettered,
            stats.dropped
        );
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // rustls 0.23 needs a process-wide crypto provider
    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        tracing::debug!("rustls crypto provider already installed");
    }

    let cli = Cli::parse();

    match cli.command {
        Commands::EncryptSecret { plaintext, key } => {
            let cipher = CredentialCipher::from_base64_key(&key).context("Invalid key")?;
            println!("{}", cipher.encrypt(&plaintext)?);
        }
        Commands::GenerateKey => {
            println!("{}", CredentialCipher::generate_key());
        }
        Commands::Run => {
            let runtime = Runtime::build(PipelineConfig::from_env()?)?;
            let service = runtime.sync_service()?;
            let shutdown = runtime.shutdown.clone();

            tokio::spawn(async move {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    tracing::error!("Failed to listen for ctrl-c: {}", e);
                    return;
                }
                tracing::info!("Shutdown requested");
                shutdown.cancel();
            });

            // The queue workers stop with the same token, so jobs still
            // queued at that point are left for `reanalyze`
            service.run(runtime.shutdown.clone()).await;
            runtime.queue.shutdown().await;
        }
        Commands::Sync { account } => {
            let runtime = Runtime::build(PipelineConfig::from_env()?)?;
            let service = runtime.sync_service()?;
            let cancel = CancellationToken::new();

            let result = service.sync_by_id(account, &cancel).await;
            runtime.drain().await;

            let report = result.with_context(|| format!("Sync of account {} failed", account))?;
            println!(
                "Synced account {}: {} new ({} published, {} failed to publish), {} already stored, {} failed",
                account,
                report.created,
                report.published,
                report.publish_failures,
                report.already_stored,
                report.failed
            );
        }
        Commands::Reanalyze { user, limit } => {
            let runtime = Runtime::build(PipelineConfig::from_env()?)?;
            let backfill = Backfill::new(
                runtime.store.clone(),
                Arc::new(runtime.queue.clone()),
                runtime.config.analysis_job,
            );

            let result = backfill.reanalyze(user, limit).await;
            runtime.drain().await;

            let queued = result.context("Failed to queue re-analysis")?;
            println!("Queued {} emails for user {}", queued, user);
        }
    }

    Ok(())
}
