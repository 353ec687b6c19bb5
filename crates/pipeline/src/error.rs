//! Error types for each seam of the pipeline.
//!
//! Every boundary (store, mail session, queue, AI provider, event listeners)
//! gets its own enum so callers can decide what is transient and what is not.
//! Glue code in the binary wraps these in `anyhow`.

use thiserror::Error;

use crate::credentials::CredentialError;

/// Persistence failures
#[derive(Debug, Error)]
pub enum StoreError {
    /// Database connection pool error
    #[error("Database connection error")]
    ConnectionPool(#[source] diesel_async::pooled_connection::deadpool::PoolError),

    /// Database query error
    #[error("Database error: {0}")]
    Database(#[from] diesel::result::Error),

    /// Row expected by the caller is missing
    #[error("{0} not found")]
    NotFound(String),

    /// Value rejected before reaching storage
    #[error("Invalid input: {0}")]
    Invalid(String),
}

impl StoreError {
    pub fn not_found(resource: impl Into<String>) -> Self {
        StoreError::NotFound(resource.into())
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        StoreError::Invalid(message.into())
    }
}

impl From<diesel_async::pooled_connection::deadpool::PoolError> for StoreError {
    fn from(err: diesel_async::pooled_connection::deadpool::PoolError) -> Self {
        StoreError::ConnectionPool(err)
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Remote mailbox failures
#[derive(Debug, Error)]
pub enum MailError {
    #[error("Failed to connect to {server}: {source}")]
    Connect {
        server: String,
        #[source]
        source: std::io::Error,
    },

    #[error("TLS handshake failed: {0}")]
    Tls(String),

    /// Server rejected the credentials
    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("{server} did not respond within {after:?}")]
    Timeout {
        server: String,
        after: std::time::Duration,
    },

    #[error("Account credentials unusable: {0}")]
    Credentials(#[from] CredentialError),
}

impl MailError {
    pub fn is_auth(&self) -> bool {
        matches!(self, MailError::Auth(_) | MailError::Credentials(_))
    }
}

/// Ingestion aborts; per-message persistence failures never surface here
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("Failed to fetch messages: {0}")]
    Fetch(#[from] MailError),

    #[error("Ingestion cancelled")]
    Cancelled,
}

/// Submission failures reported by a task queue
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Task queue is closed")]
    Closed,

    #[error("No handler registered for job type {0}")]
    UnknownJobType(String),

    #[error("Task queue rejected job: {0}")]
    Rejected(String),
}

/// Outcome of a failed job attempt, consumed by the queue adapter
#[derive(Debug, Error)]
pub enum JobError {
    /// Transient failure; the queue may run the job again
    #[error("{0}")]
    Retryable(anyhow::Error),

    /// The job can never succeed (for example an undecodable payload)
    #[error("{0}")]
    Permanent(anyhow::Error),
}

impl JobError {
    pub fn retryable(err: impl Into<anyhow::Error>) -> Self {
        JobError::Retryable(err.into())
    }

    pub fn permanent(err: impl Into<anyhow::Error>) -> Self {
        JobError::Permanent(err.into())
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, JobError::Retryable(_))
    }
}

/// AI provider failures
#[derive(Debug, Error)]
pub enum AiError {
    #[error("AI request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("AI provider returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("AI provider returned an empty response")]
    EmptyResponse,

    #[error("Failed to parse AI response: {0}")]
    Parse(String),
}

/// Errors returned by event listeners; the bus hands the first one back to
/// the publisher unchanged
#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("Failed to enqueue job: {0}")]
    Enqueue(#[from] QueueError),

    #[error("Failed to encode job payload: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

/// Failures of a whole account sync or backfill pass
#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Mail(#[from] MailError),

    #[error(transparent)]
    Ingest(#[from] IngestError),

    #[error(transparent)]
    Enqueue(#[from] QueueError),

    #[error("Failed to encode job payload: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("Sync cancelled")]
    Cancelled,
}

impl SyncError {
    /// The account needs new credentials before it can sync again
    pub fn is_auth(&self) -> bool {
        match self {
            SyncError::Mail(e) | SyncError::Ingest(IngestError::Fetch(e)) => e.is_auth(),
            _ => false,
        }
    }
}
