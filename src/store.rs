//! Persistence boundary consumed by the scan pipeline.
//!
//! [`crate::db::PgStore`] is the production implementation,
//! [`crate::memory::MemoryStore`] the in-process one.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::Result;
use crate::models::{
    Alert, NewAlert, NewResult, NewScan, ProxyRecord, ProxyStatus, Scan, ScanResult, ScanStatus,
};
use crate::telemetry::LogEvent;

/// Global setting key: route browser sessions through the proxy pool.
pub const USE_SYSTEM_PROXY: &str = "useSystemProxy";

/// Fields accepted when registering a proxy.
#[derive(Debug, Clone)]
pub struct NewProxy {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub protocol: crate::models::ProxyProtocol,
    pub kind: crate::models::ProxyKind,
}

#[async_trait]
pub trait Store: Send + Sync {
    // scans
    async fn create_scan(&self, scan: NewScan) -> Result<Scan>;
    async fn get_scan(&self, id: Uuid) -> Result<Option<Scan>>;
    async fn list_scans(&self, limit: i64) -> Result<Vec<Scan>>;
    async fn scan_status(&self, id: Uuid) -> Result<Option<ScanStatus>>;
    async fn set_scan_status(&self, id: Uuid, status: ScanStatus) -> Result<()>;
    /// Move a PENDING scan to RUNNING. Returns false, changing nothing, when
    /// the scan is missing or in any other state.
    async fn claim_scan(&self, id: Uuid) -> Result<bool>;
    /// Most recent COMPLETED scan for the same keyword and business, other than `exclude`.
    async fn latest_completed_scan(
        &self,
        keyword: &str,
        business_name: &str,
        exclude: Uuid,
    ) -> Result<Option<Scan>>;
    /// Completed scans for keyword + business, oldest first.
    async fn completed_scan_series(&self, keyword: &str, business_name: &str) -> Result<Vec<Scan>>;
    /// Set COMPLETED and `next_run`, inserting `alert` in the same transaction.
    async fn complete_scan(
        &self,
        id: Uuid,
        next_run: Option<DateTime<Utc>>,
        alert: Option<NewAlert>,
    ) -> Result<()>;
    /// Set FAILED and record a `SCAN_ERROR` alert in the same transaction.
    async fn fail_scan(&self, id: Uuid, message: &str) -> Result<()>;
    /// Drop previous results and put the scan back to PENDING.
    async fn rerun_scan(&self, id: Uuid) -> Result<()>;
    /// Recurring scans in a terminal state whose `next_run` is at or before `now`.
    async fn due_scans(&self, now: DateTime<Utc>) -> Result<Vec<Scan>>;
    /// Copy a due scan into a fresh PENDING scan and clear the original's
    /// `next_run`, in one transaction. The copy carries the schedule forward.
    async fn spawn_recurrence(&self, id: Uuid) -> Result<Scan>;
    /// Undo [`Store::spawn_recurrence`]: delete the PENDING `copy` and give the
    /// original back its `next_run`, in one transaction.
    async fn revert_recurrence(&self, original: Uuid, next_run: DateTime<Utc>, copy: Uuid) -> Result<()>;

    // results
    async fn insert_result(&self, result: NewResult) -> Result<ScanResult>;
    async fn results_for_scan(&self, scan_id: Uuid) -> Result<Vec<ScanResult>>;

    // alerts
    async fn alerts_for_scan(&self, scan_id: Uuid) -> Result<Vec<Alert>>;

    // proxies
    async fn list_proxies(&self) -> Result<Vec<ProxyRecord>>;
    async fn add_proxy(&self, proxy: NewProxy) -> Result<ProxyRecord>;
    async fn remove_proxy(&self, id: Uuid) -> Result<bool>;
    async fn set_proxy_enabled(&self, id: Uuid, enabled: bool) -> Result<bool>;
    async fn set_proxy_status(&self, id: Uuid, status: ProxyStatus, tested_at: DateTime<Utc>) -> Result<()>;

    // settings
    async fn get_setting(&self, key: &str) -> Result<Option<String>>;
    async fn put_setting(&self, key: &str, value: &str) -> Result<()>;

    // telemetry
    async fn log_event(&self, event: &LogEvent) -> Result<()>;
}
