//! Task queue contract.
//!
//! The pipeline only needs to submit opaque payloads under a job type and
//! to register one consumer per type. Delivery is at-least-once, so handlers
//! must tolerate running the same payload more than once.

use async_trait::async_trait;
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

use crate::error::{JobError, QueueError};

pub mod local;

pub use local::{LocalQueueConfig, LocalTaskQueue, QueueStats};

/// Identifier assigned to an accepted job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        JobId(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Per-job delivery policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobOptions {
    /// Retries allowed after the first attempt
    pub max_retry: u32,
    /// Budget for a single attempt
    pub timeout: Duration,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            max_retry: 5,
            timeout: Duration::from_secs(120),
        }
    }
}

#[async_trait]
pub trait TaskQueue: Send + Sync {
    async fn submit(
        &self,
        job_type: &str,
        payload: Vec<u8>,
        options: JobOptions,
    ) -> Result<JobId, QueueError>;
}

/// Consumer for one job type.
///
/// `JobError::Permanent` tells the queue never to run the payload again.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, payload: &[u8]) -> Result<(), JobError>;
}
