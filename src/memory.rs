//! In-process [`Store`] used by tests and dry runs.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{CrawlerError, Result};
use crate::models::{
    Alert, AlertKind, NewAlert, NewResult, NewScan, ProxyRecord, ProxyStatus, Scan, ScanResult,
    ScanStatus,
};
use crate::store::{NewProxy, Store};
use crate::telemetry::LogEvent;

#[derive(Default)]
struct Tables {
    scans: Vec<Scan>,
    results: Vec<ScanResult>,
    alerts: Vec<Alert>,
    proxies: Vec<ProxyRecord>,
    settings: HashMap<String, String>,
    logs: Vec<LogEvent>,
}

#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a fully-formed proxy row, bypassing `add_proxy` defaults.
    pub async fn insert_proxy_record(&self, proxy: ProxyRecord) {
        self.tables.write().await.proxies.push(proxy);
    }

    pub async fn logs(&self) -> Vec<LogEvent> {
        self.tables.read().await.logs.clone()
    }

    fn scan_mut<'a>(tables: &'a mut Tables, id: Uuid) -> Result<&'a mut Scan> {
        tables
            .scans
            .iter_mut()
            .find(|s| s.id == id)
            .ok_or_else(|| CrawlerError::not_found("scan", id))
    }

    fn push_alert(tables: &mut Tables, alert: NewAlert) {
        tables.alerts.push(Alert {
            id: Uuid::new_v4(),
            scan_id: alert.scan_id,
            kind: alert.kind,
            message: alert.message,
            created_at: Utc::now(),
        });
    }
}

fn same_target(scan: &Scan, keyword: &str, business_name: &str) -> bool {
    scan.keyword == keyword && scan.business_name.as_deref() == Some(business_name)
}

#[async_trait]
impl Store for MemoryStore {
    async fn create_scan(&self, scan: NewScan) -> Result<Scan> {
        let record = Scan {
            id: Uuid::new_v4(),
            keyword: scan.keyword,
            business_name: scan.business_name,
            center_lat: scan.center_lat,
            center_lng: scan.center_lng,
            radius_km: scan.radius_km,
            grid_size: scan.grid_size,
            shape: scan.shape,
            custom_points: scan.custom_points,
            recurrence: scan.recurrence,
            status: ScanStatus::Pending,
            next_run: None,
            created_at: Utc::now(),
        };
        self.tables.write().await.scans.push(record.clone());
        Ok(record)
    }

    async fn get_scan(&self, id: Uuid) -> Result<Option<Scan>> {
        Ok(self.tables.read().await.scans.iter().find(|s| s.id == id).cloned())
    }

    async fn list_scans(&self, limit: i64) -> Result<Vec<Scan>> {
        let tables = self.tables.read().await;
        let mut scans = tables.scans.clone();
        scans.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        scans.truncate(limit.max(0) as usize);
        Ok(scans)
    }

    async fn scan_status(&self, id: Uuid) -> Result<Option<ScanStatus>> {
        Ok(self.tables.read().await.scans.iter().find(|s| s.id == id).map(|s| s.status))
    }

    async fn set_scan_status(&self, id: Uuid, status: ScanStatus) -> Result<()> {
        let mut tables = self.tables.write().await;
        Self::scan_mut(&mut tables, id)?.status = status;
        Ok(())
    }

    async fn claim_scan(&self, id: Uuid) -> Result<bool> {
        let mut tables = self.tables.write().await;
        match tables.scans.iter_mut().find(|s| s.id == id) {
            Some(scan) if scan.status == ScanStatus::Pending => {
                scan.status = ScanStatus::Running;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn latest_completed_scan(
        &self,
        keyword: &str,
        business_name: &str,
        exclude: Uuid,
    ) -> Result<Option<Scan>> {
        let tables = self.tables.read().await;
        Ok(tables
            .scans
            .iter()
            .filter(|s| s.id != exclude && s.status == ScanStatus::Completed)
            .filter(|s| same_target(s, keyword, business_name))
            .max_by_key(|s| s.created_at)
            .cloned())
    }

    async fn completed_scan_series(&self, keyword: &str, business_name: &str) -> Result<Vec<Scan>> {
        let tables = self.tables.read().await;
        let mut scans: Vec<Scan> = tables
            .scans
            .iter()
            .filter(|s| s.status == ScanStatus::Completed && same_target(s, keyword, business_name))
            .cloned()
            .collect();
        scans.sort_by_key(|s| s.created_at);
        Ok(scans)
    }

    async fn complete_scan(
        &self,
        id: Uuid,
        next_run: Option<DateTime<Utc>>,
        alert: Option<NewAlert>,
    ) -> Result<()> {
        // one write guard covers both changes
        let mut tables = self.tables.write().await;
        let scan = Self::scan_mut(&mut tables, id)?;
        scan.status = ScanStatus::Completed;
        scan.next_run = next_run;
        if let Some(alert) = alert {
            Self::push_alert(&mut tables, alert);
        }
        Ok(())
    }

    async fn fail_scan(&self, id: Uuid, message: &str) -> Result<()> {
        let mut tables = self.tables.write().await;
        Self::scan_mut(&mut tables, id)?.status = ScanStatus::Failed;
        Self::push_alert(
            &mut tables,
            NewAlert {
                scan_id: id,
                kind: AlertKind::ScanError,
                message: message.to_string(),
            },
        );
        Ok(())
    }

    async fn rerun_scan(&self, id: Uuid) -> Result<()> {
        let mut tables = self.tables.write().await;
        Self::scan_mut(&mut tables, id)?.status = ScanStatus::Pending;
        tables.results.retain(|r| r.scan_id != id);
        Ok(())
    }

    async fn due_scans(&self, now: DateTime<Utc>) -> Result<Vec<Scan>> {
        let tables = self.tables.read().await;
        Ok(tables
            .scans
            .iter()
            .filter(|s| matches!(s.status, ScanStatus::Completed | ScanStatus::Failed))
            .filter(|s| s.next_run.is_some_and(|t| t <= now))
            .cloned()
            .collect())
    }

    async fn spawn_recurrence(&self, id: Uuid) -> Result<Scan> {
        let mut tables = self.tables.write().await;
        let original = Self::scan_mut(&mut tables, id)?;
        original.next_run = None;
        let copy = Scan {
            id: Uuid::new_v4(),
            status: ScanStatus::Pending,
            next_run: None,
            created_at: Utc::now(),
            ..original.clone()
        };
        tables.scans.push(copy.clone());
        Ok(copy)
    }

    async fn revert_recurrence(&self, original: Uuid, next_run: DateTime<Utc>, copy: Uuid) -> Result<()> {
        let mut tables = self.tables.write().await;
        Self::scan_mut(&mut tables, original)?.next_run = Some(next_run);
        tables
            .scans
            .retain(|s| !(s.id == copy && s.status == ScanStatus::Pending));
        Ok(())
    }

    async fn insert_result(&self, result: NewResult) -> Result<ScanResult> {
        let row = ScanResult {
            id: Uuid::new_v4(),
            scan_id: result.scan_id,
            point_id: result.point.id,
            lat: result.point.lat,
            lng: result.point.lng,
            top_results: result.top_results,
            rank: result.rank,
            matched_name: result.matched_name,
            created_at: Utc::now(),
        };
        let mut tables = self.tables.write().await;
        if !tables.scans.iter().any(|s| s.id == row.scan_id) {
            return Err(CrawlerError::not_found("scan", row.scan_id));
        }
        tables.results.push(row.clone());
        Ok(row)
    }

    async fn results_for_scan(&self, scan_id: Uuid) -> Result<Vec<ScanResult>> {
        let tables = self.tables.read().await;
        Ok(tables.results.iter().filter(|r| r.scan_id == scan_id).cloned().collect())
    }

    async fn alerts_for_scan(&self, scan_id: Uuid) -> Result<Vec<Alert>> {
        let tables = self.tables.read().await;
        Ok(tables.alerts.iter().filter(|a| a.scan_id == scan_id).cloned().collect())
    }

    async fn list_proxies(&self) -> Result<Vec<ProxyRecord>> {
        Ok(self.tables.read().await.proxies.clone())
    }

    async fn add_proxy(&self, proxy: NewProxy) -> Result<ProxyRecord> {
        let mut tables = self.tables.write().await;
        if tables
            .proxies
            .iter()
            .any(|p| p.host == proxy.host && p.port == proxy.port)
        {
            return Err(CrawlerError::InvalidInput(format!(
                "proxy {}:{} already exists",
                proxy.host, proxy.port
            )));
        }
        let record = ProxyRecord {
            id: Uuid::new_v4(),
            host: proxy.host,
            port: proxy.port,
            username: proxy.username,
            password: proxy.password,
            protocol: proxy.protocol,
            kind: proxy.kind,
            enabled: true,
            status: ProxyStatus::Untested,
            last_tested: None,
        };
        tables.proxies.push(record.clone());
        Ok(record)
    }

    async fn remove_proxy(&self, id: Uuid) -> Result<bool> {
        let mut tables = self.tables.write().await;
        let before = tables.proxies.len();
        tables.proxies.retain(|p| p.id != id);
        Ok(tables.proxies.len() != before)
    }

    async fn set_proxy_enabled(&self, id: Uuid, enabled: bool) -> Result<bool> {
        let mut tables = self.tables.write().await;
        match tables.proxies.iter_mut().find(|p| p.id == id) {
            Some(p) => {
                p.enabled = enabled;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn set_proxy_status(&self, id: Uuid, status: ProxyStatus, tested_at: DateTime<Utc>) -> Result<()> {
        let mut tables = self.tables.write().await;
        if let Some(p) = tables.proxies.iter_mut().find(|p| p.id == id) {
            p.status = status;
            p.last_tested = Some(tested_at);
        }
        Ok(())
    }

    async fn get_setting(&self, key: &str) -> Result<Option<String>> {
        Ok(self.tables.read().await.settings.get(key).cloned())
    }

    async fn put_setting(&self, key: &str, value: &str) -> Result<()> {
        self.tables
            .write()
            .await
            .settings
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn log_event(&self, event: &LogEvent) -> Result<()> {
        self.tables.write().await.logs.push(event.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{GridShape, Recurrence, SamplePoint};

    fn new_scan() -> NewScan {
        NewScan {
            keyword: "plumber".into(),
            business_name: Some("Joe's Plumbing".into()),
            center_lat: 40.0,
            center_lng: -74.0,
            radius_km: 2.0,
            grid_size: 3,
            shape: GridShape::Lattice,
            custom_points: None,
            recurrence: Recurrence::Daily,
        }
    }

    fn result_for(scan_id: Uuid) -> NewResult {
        NewResult {
            scan_id,
            point: SamplePoint::new("grid-0-0", 40.0, -74.0),
            top_results: vec![],
            rank: None,
            matched_name: None,
        }
    }

    #[tokio::test]
    async fn rerun_clears_results_and_resets_status() {
        let store = MemoryStore::new();
        let scan = store.create_scan(new_scan()).await.unwrap();
        store.insert_result(result_for(scan.id)).await.unwrap();
        store.complete_scan(scan.id, None, None).await.unwrap();

        store.rerun_scan(scan.id).await.unwrap();
        assert_eq!(store.scan_status(scan.id).await.unwrap(), Some(ScanStatus::Pending));
        assert!(store.results_for_scan(scan.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn due_recurrence_spawns_a_fresh_pending_copy() {
        let store = MemoryStore::new();
        let scan = store.create_scan(new_scan()).await.unwrap();
        let due_at = Utc::now() - chrono::Duration::minutes(1);
        store.complete_scan(scan.id, Some(due_at), None).await.unwrap();

        let due = store.due_scans(Utc::now()).await.unwrap();
        assert_eq!(due.len(), 1);

        let copy = store.spawn_recurrence(scan.id).await.unwrap();
        assert_ne!(copy.id, scan.id);
        assert_eq!(copy.status, ScanStatus::Pending);
        assert_eq!(copy.recurrence, Recurrence::Daily);
        assert!(store.due_scans(Utc::now()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn reverted_recurrence_is_due_again() {
        let store = MemoryStore::new();
        let scan = store.create_scan(new_scan()).await.unwrap();
        let due_at = Utc::now() - chrono::Duration::minutes(1);
        store.complete_scan(scan.id, Some(due_at), None).await.unwrap();

        let copy = store.spawn_recurrence(scan.id).await.unwrap();
        store.revert_recurrence(scan.id, due_at, copy.id).await.unwrap();

        assert!(store.get_scan(copy.id).await.unwrap().is_none());
        let due = store.due_scans(Utc::now()).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].id, scan.id);
    }

    #[tokio::test]
    async fn only_pending_scans_can_be_claimed() {
        let store = MemoryStore::new();
        let scan = store.create_scan(new_scan()).await.unwrap();

        assert!(store.claim_scan(scan.id).await.unwrap());
        assert_eq!(store.scan_status(scan.id).await.unwrap(), Some(ScanStatus::Running));
        assert!(!store.claim_scan(scan.id).await.unwrap());

        store.complete_scan(scan.id, None, None).await.unwrap();
        assert!(!store.claim_scan(scan.id).await.unwrap());
        assert_eq!(store.scan_status(scan.id).await.unwrap(), Some(ScanStatus::Completed));
        assert!(!store.claim_scan(Uuid::new_v4()).await.unwrap());
    }

    #[tokio::test]
    async fn failure_records_scan_error_alert() {
        let store = MemoryStore::new();
        let scan = store.create_scan(new_scan()).await.unwrap();
        store.fail_scan(scan.id, "database unreachable").await.unwrap();

        let alerts = store.alerts_for_scan(scan.id).await.unwrap();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].kind, AlertKind::ScanError);
        assert_eq!(store.scan_status(scan.id).await.unwrap(), Some(ScanStatus::Failed));
    }

    #[tokio::test]
    async fn results_for_unknown_scan_are_rejected() {
        let store = MemoryStore::new();
        assert!(store.insert_result(result_for(Uuid::new_v4())).await.is_err());
    }
}
