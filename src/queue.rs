//! Redis-backed scan job queue.

use std::num::NonZeroUsize;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanJob {
    pub scan_id: Uuid,
    pub enqueued_at: DateTime<Utc>,
}

/// Hands a scan id to whatever executes scans.
#[async_trait]
pub trait ScanSubmitter: Send + Sync {
    async fn submit(&self, scan_id: Uuid) -> Result<()>;
}

pub struct ScanQueue {
    client: redis::Client,
    key: String,
}

impl ScanQueue {
    pub fn new(redis_url: &str, key: impl Into<String>) -> Result<Self> {
        Ok(Self {
            client: redis::Client::open(redis_url)?,
            key: key.into(),
        })
    }

    pub async fn push_job(&self, job: &ScanJob) -> Result<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let payload = serde_json::to_string(job)?;
        conn.lpush::<_, _, ()>(&self.key, payload).await?;
        Ok(())
    }

    /// Oldest queued job, if any.
    pub async fn pop_job(&self) -> Result<Option<ScanJob>> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let payload: Option<String> = conn.rpop(&self.key, None::<NonZeroUsize>).await?;
        match payload {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    pub async fn len(&self) -> Result<usize> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        Ok(conn.llen(&self.key).await?)
    }
}

#[async_trait]
impl ScanSubmitter for ScanQueue {
    async fn submit(&self, scan_id: Uuid) -> Result<()> {
        self.push_job(&ScanJob {
            scan_id,
            enqueued_at: Utc::now(),
        })
        .await
    }
}
