//! Lease-protected body storage: `write`, `read`, `delete` of a single
//! immutable blob keyed by message id.

use crate::error::Result;
use async_trait::async_trait;
use rand::Rng;
use rq_common::QueueKey;
use std::time::Duration;

/// Outcome of a body read: either the bytes, or an explicit null body
/// (message never had content written, or its blob was already removed).
#[derive(Debug, Clone)]
pub struct BodyReadResult {
    pub bytes: Option<Vec<u8>>,
    pub size: Option<u64>,
}

impl BodyReadResult {
    pub fn null() -> Self {
        Self {
            bytes: None,
            size: None,
        }
    }

    pub fn is_null(&self) -> bool {
        self.bytes.is_none()
    }
}

/// Result of a successful write: the metadata to stamp onto the message row.
#[derive(Debug, Clone, Copy)]
pub struct BodyWriteOutcome {
    pub body_is_null: bool,
    pub size: Option<u64>,
}

#[async_trait]
pub trait BodyStore: Send + Sync {
    /// Write `bytes` as the body for `message_id`. `None`/empty yields a
    /// null body (no blob persisted).
    async fn write(
        &self,
        queue_key: &QueueKey,
        message_id: &str,
        bytes: Option<&[u8]>,
        timeout: Duration,
    ) -> Result<BodyWriteOutcome>;

    /// Read the body for `message_id`. Missing blob returns a null result
    /// rather than an error.
    async fn read(
        &self,
        queue_key: &QueueKey,
        message_id: &str,
        timeout: Duration,
    ) -> Result<BodyReadResult>;

    /// Delete the body for `message_id`. A missing blob is a no-op.
    async fn delete(&self, queue_key: &QueueKey, message_id: &str, timeout: Duration) -> Result<()>;
}

/// Shared back-off loop for lease acquisition: uniform random delay between
/// 250 and 500 ms between attempts, bounded by `timeout`.
pub(crate) async fn lease_backoff_delay() -> Duration {
    let millis = rand::thread_rng().gen_range(250..=500);
    Duration::from_millis(millis)
}

pub(crate) struct Deadline {
    start: tokio::time::Instant,
    timeout: Duration,
}

impl Deadline {
    pub fn new(timeout: Duration) -> Self {
        Self {
            start: tokio::time::Instant::now(),
            timeout,
        }
    }

    pub fn expired(&self) -> bool {
        self.start.elapsed() >= self.timeout
    }

    pub fn remaining(&self) -> Duration {
        self.timeout.saturating_sub(self.start.elapsed())
    }
}

pub(crate) fn outcome_for_length(length: u64) -> BodyWriteOutcome {
    if length > 0 {
        BodyWriteOutcome {
            body_is_null: false,
            size: Some(length),
        }
    } else {
        BodyWriteOutcome {
            body_is_null: true,
            size: None,
        }
    }
}
