use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use geo_rank_crawler::config::{ProxySettings, ScanSettings};
use geo_rank_crawler::error::{CrawlerError, Result};
use geo_rank_crawler::memory::MemoryStore;
use geo_rank_crawler::models::{
    Alert, AlertKind, BusinessEntry, Coordinate, GridShape, NewAlert, NewResult, NewScan, ProxyKind,
    ProxyProtocol, ProxyRecord, ProxyStatus, Recurrence, SamplePoint, Scan, ScanResult, ScanStatus,
};
use geo_rank_crawler::orchestrator::{Orchestrator, RunOutcome};
use geo_rank_crawler::proxy::ProxyPool;
use geo_rank_crawler::session::{BrowserLauncher, SearchSession};
use geo_rank_crawler::stealth::{Persona, RegionProfile};
use geo_rank_crawler::store::{NewProxy, Store, USE_SYSTEM_PROXY};
use geo_rank_crawler::telemetry::LogEvent;

#[derive(Clone)]
enum Search {
    Listings(Vec<BusinessEntry>),
    AlwaysFail(&'static str),
    FailFirst(usize, &'static str, Vec<BusinessEntry>),
    /// One page per search, cycling.
    Pages(Vec<Vec<BusinessEntry>>),
}

#[derive(Clone, Copy)]
enum Launch {
    Ok,
    FailProxied(&'static str),
    FailAll,
}

/// Something that happens to the scan while a search is in flight.
enum Hook {
    Stop,
    Rerun,
}

struct Script {
    search: Search,
    launch: Launch,
    searches: AtomicUsize,
    repositions: AtomicUsize,
    /// Proxy id (or None for direct) of every launch attempt, in order.
    launches: Mutex<Vec<Option<Uuid>>>,
    /// Apply the hook to the scan during the n-th search.
    during: Option<(Arc<MemoryStore>, Uuid, usize, Hook)>,
}

impl Script {
    fn new(search: Search, launch: Launch) -> Self {
        Self {
            search,
            launch,
            searches: AtomicUsize::new(0),
            repositions: AtomicUsize::new(0),
            launches: Mutex::new(Vec::new()),
            during: None,
        }
    }

    fn launches(&self) -> Vec<Option<Uuid>> {
        self.launches.lock().unwrap().clone()
    }
}

struct FakeLauncher(Arc<Script>);

struct FakeSession(Arc<Script>);

#[async_trait]
impl SearchSession for FakeSession {
    async fn reposition(&mut self, _point: Coordinate) -> Result<()> {
        self.0.repositions.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn search(&mut self, _keyword: &str, _point: Coordinate) -> Result<Vec<BusinessEntry>> {
        let n = self.0.searches.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some((store, scan_id, at, hook)) = &self.0.during {
            if n == *at {
                match hook {
                    Hook::Stop => store.set_scan_status(*scan_id, ScanStatus::Stopped).await?,
                    Hook::Rerun => store.rerun_scan(*scan_id).await?,
                }
            }
        }
        match &self.0.search {
            Search::Listings(listings) => Ok(listings.clone()),
            Search::AlwaysFail(msg) => Err(CrawlerError::Navigation(msg.to_string())),
            Search::FailFirst(k, msg, listings) => {
                if n <= *k {
                    Err(CrawlerError::Navigation(msg.to_string()))
                } else {
                    Ok(listings.clone())
                }
            }
            Search::Pages(pages) => Ok(pages[(n - 1) % pages.len()].clone()),
        }
    }

    async fn close(&mut self) {}
}

#[async_trait]
impl BrowserLauncher for FakeLauncher {
    type Session = FakeSession;

    async fn launch(
        &self,
        proxy: Option<&ProxyRecord>,
        _persona: Persona,
        _region: RegionProfile,
    ) -> Result<FakeSession> {
        self.0.launches.lock().unwrap().push(proxy.map(|p| p.id));
        match (self.0.launch, proxy) {
            (Launch::FailAll, _) => Err(CrawlerError::Launch("chrome binary not found".into())),
            (Launch::FailProxied(msg), Some(_)) => Err(CrawlerError::Launch(msg.into())),
            _ => Ok(FakeSession(self.0.clone())),
        }
    }
}

fn fast_settings() -> ScanSettings {
    ScanSettings {
        point_delay_min: Duration::ZERO,
        point_delay_max: Duration::ZERO,
        ..ScanSettings::default()
    }
}

fn orchestrator(store: &Arc<MemoryStore>, script: &Arc<Script>) -> Orchestrator<MemoryStore, FakeLauncher> {
    Orchestrator::new(
        store.clone(),
        ProxyPool::new(store.clone(), ProxySettings::default()),
        Arc::new(FakeLauncher(script.clone())),
        fast_settings(),
    )
}

fn points(n: usize) -> Vec<SamplePoint> {
    (0..n)
        .map(|i| SamplePoint::new(format!("p{i}"), 40.70 + i as f64 * 0.01, -74.0))
        .collect()
}

fn page(names: &[&str]) -> Vec<BusinessEntry> {
    names
        .iter()
        .enumerate()
        .map(|(i, n)| BusinessEntry::new(*n, i as u32 + 1))
        .collect()
}

async fn create_scan(store: &MemoryStore, n_points: usize) -> Scan {
    store
        .create_scan(NewScan {
            keyword: "plumber".into(),
            business_name: Some("Joe's Plumbing".into()),
            center_lat: 40.7,
            center_lng: -74.0,
            radius_km: 2.0,
            grid_size: 3,
            shape: GridShape::Lattice,
            custom_points: Some(points(n_points)),
            recurrence: Recurrence::None,
        })
        .await
        .unwrap()
}

async fn add_proxy(store: &MemoryStore) -> Uuid {
    store.put_setting(USE_SYSTEM_PROXY, "true").await.unwrap();
    store
        .add_proxy(NewProxy {
            host: "10.0.0.9".into(),
            port: 3128,
            username: None,
            password: None,
            protocol: ProxyProtocol::Http,
            kind: ProxyKind::Datacenter,
        })
        .await
        .unwrap()
        .id
}

async fn proxy_status(store: &MemoryStore, id: Uuid) -> ProxyStatus {
    store
        .list_proxies()
        .await
        .unwrap()
        .into_iter()
        .find(|p| p.id == id)
        .unwrap()
        .status
}

#[tokio::test]
async fn records_rank_and_completes() {
    let store = Arc::new(MemoryStore::new());
    let scan = create_scan(&store, 3).await;
    let script = Arc::new(Script::new(
        Search::Listings(page(&["Ace Drain", "Joe's Plumbing & Heating", "Pipe Pros"])),
        Launch::Ok,
    ));

    let outcome = orchestrator(&store, &script).run_scan(scan.id).await.unwrap();
    assert_eq!(outcome, RunOutcome::Completed { points: 3, alert: None });

    let results = store.results_for_scan(scan.id).await.unwrap();
    assert_eq!(results.len(), 3);
    assert!(results.iter().all(|r| r.rank == Some(2)));
    assert_eq!(results[0].matched_name.as_deref(), Some("Joe's Plumbing & Heating"));
    assert_eq!(results[0].top_results.len(), 3);

    // one session for the whole scan, moved once per point
    assert_eq!(script.launches(), vec![None]);
    assert_eq!(script.repositions.load(Ordering::SeqCst), 3);
    assert_eq!(store.scan_status(scan.id).await.unwrap(), Some(ScanStatus::Completed));
}

#[tokio::test]
async fn failing_point_is_tried_three_times_then_recorded_empty() {
    let store = Arc::new(MemoryStore::new());
    let scan = create_scan(&store, 1).await;
    let script = Arc::new(Script::new(Search::AlwaysFail("results feed never rendered"), Launch::Ok));

    let outcome = orchestrator(&store, &script).run_scan(scan.id).await.unwrap();
    assert_eq!(outcome, RunOutcome::Completed { points: 1, alert: None });

    assert_eq!(script.searches.load(Ordering::SeqCst), 3);
    // initial launch plus one fresh session before each retry
    assert_eq!(script.launches().len(), 3);

    let results = store.results_for_scan(scan.id).await.unwrap();
    assert_eq!(results.len(), 1);
    assert!(results[0].top_results.is_empty());
    assert_eq!(results[0].rank, None);
    assert_eq!(store.scan_status(scan.id).await.unwrap(), Some(ScanStatus::Completed));
}

#[tokio::test]
async fn stop_request_ends_the_run_without_further_writes() {
    let store = Arc::new(MemoryStore::new());
    let scan = create_scan(&store, 5).await;
    let mut script = Script::new(Search::Listings(page(&["Joe's Plumbing"])), Launch::Ok);
    script.during = Some((store.clone(), scan.id, 1, Hook::Stop));
    let script = Arc::new(script);

    let outcome = orchestrator(&store, &script).run_scan(scan.id).await.unwrap();
    assert_eq!(outcome, RunOutcome::Superseded(ScanStatus::Stopped));

    // the point in flight when the stop landed is dropped too
    assert!(store.results_for_scan(scan.id).await.unwrap().is_empty());
    assert_eq!(script.searches.load(Ordering::SeqCst), 1);
    assert_eq!(store.scan_status(scan.id).await.unwrap(), Some(ScanStatus::Stopped));
    assert!(store.alerts_for_scan(scan.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn stopped_scan_is_not_started() {
    let store = Arc::new(MemoryStore::new());
    let scan = create_scan(&store, 2).await;
    store.set_scan_status(scan.id, ScanStatus::Stopped).await.unwrap();
    let script = Arc::new(Script::new(Search::Listings(Vec::new()), Launch::Ok));

    let outcome = orchestrator(&store, &script).run_scan(scan.id).await.unwrap();
    assert_eq!(outcome, RunOutcome::Skipped(ScanStatus::Stopped));
    assert!(script.launches().is_empty());
    assert_eq!(store.scan_status(scan.id).await.unwrap(), Some(ScanStatus::Stopped));
}

#[tokio::test]
async fn rerun_mid_point_discards_the_stale_write() {
    let store = Arc::new(MemoryStore::new());
    let scan = create_scan(&store, 2).await;
    let mut script = Script::new(Search::Listings(page(&["Joe's Plumbing"])), Launch::Ok);
    script.during = Some((store.clone(), scan.id, 1, Hook::Rerun));
    let script = Arc::new(script);

    let outcome = orchestrator(&store, &script).run_scan(scan.id).await.unwrap();
    assert_eq!(outcome, RunOutcome::Superseded(ScanStatus::Pending));
    assert!(store.results_for_scan(scan.id).await.unwrap().is_empty());
    assert_eq!(store.scan_status(scan.id).await.unwrap(), Some(ScanStatus::Pending));

    // the queued rerun then produces exactly one row per point
    let fresh = Arc::new(Script::new(Search::Listings(page(&["Joe's Plumbing"])), Launch::Ok));
    let outcome = orchestrator(&store, &fresh).run_scan(scan.id).await.unwrap();
    assert_eq!(outcome, RunOutcome::Completed { points: 2, alert: None });
    assert_eq!(store.results_for_scan(scan.id).await.unwrap().len(), 2);
}

#[tokio::test]
async fn duplicate_job_for_completed_scan_is_skipped() {
    let store = Arc::new(MemoryStore::new());
    let scan = create_scan(&store, 2).await;
    let script = Arc::new(Script::new(Search::Listings(page(&["Joe's Plumbing"])), Launch::Ok));

    orchestrator(&store, &script).run_scan(scan.id).await.unwrap();
    let outcome = orchestrator(&store, &script).run_scan(scan.id).await.unwrap();

    assert_eq!(outcome, RunOutcome::Skipped(ScanStatus::Completed));
    assert_eq!(store.results_for_scan(scan.id).await.unwrap().len(), 2);
    assert_eq!(script.searches.load(Ordering::SeqCst), 2);
    assert_eq!(script.launches().len(), 1);
}

#[tokio::test]
async fn unknown_scan_is_reported_missing() {
    let store = Arc::new(MemoryStore::new());
    let script = Arc::new(Script::new(Search::Listings(Vec::new()), Launch::Ok));
    let outcome = orchestrator(&store, &script).run_scan(Uuid::new_v4()).await.unwrap();
    assert_eq!(outcome, RunOutcome::Missing);
}

#[tokio::test]
async fn proxy_error_retires_the_endpoint_and_retries_direct() {
    let store = Arc::new(MemoryStore::new());
    let proxy_id = add_proxy(&store).await;
    let scan = create_scan(&store, 1).await;
    let script = Arc::new(Script::new(
        Search::FailFirst(1, "net::ERR_PROXY_CONNECTION_FAILED", page(&["Joe's Plumbing"])),
        Launch::Ok,
    ));

    let outcome = orchestrator(&store, &script).run_scan(scan.id).await.unwrap();
    assert!(matches!(outcome, RunOutcome::Completed { points: 1, .. }));

    assert_eq!(proxy_status(&store, proxy_id).await, ProxyStatus::Dead);
    // the dead endpoint is never picked again
    assert_eq!(script.launches(), vec![Some(proxy_id), None]);

    let results = store.results_for_scan(scan.id).await.unwrap();
    assert_eq!(results[0].rank, Some(1));
}

#[tokio::test]
async fn non_proxy_errors_leave_the_endpoint_alone() {
    let store = Arc::new(MemoryStore::new());
    let proxy_id = add_proxy(&store).await;
    let scan = create_scan(&store, 1).await;
    let script = Arc::new(Script::new(
        Search::FailFirst(1, "results feed never rendered", page(&["Joe's Plumbing"])),
        Launch::Ok,
    ));

    orchestrator(&store, &script).run_scan(scan.id).await.unwrap();
    assert_eq!(proxy_status(&store, proxy_id).await, ProxyStatus::Untested);
    assert_eq!(script.launches(), vec![Some(proxy_id), Some(proxy_id)]);
}

#[tokio::test]
async fn failed_proxied_launch_falls_back_to_direct() {
    let store = Arc::new(MemoryStore::new());
    let proxy_id = add_proxy(&store).await;
    let scan = create_scan(&store, 2).await;
    let script = Arc::new(Script::new(
        Search::Listings(page(&["Joe's Plumbing"])),
        Launch::FailProxied("net::ERR_TUNNEL_CONNECTION_FAILED"),
    ));

    let outcome = orchestrator(&store, &script).run_scan(scan.id).await.unwrap();
    assert!(matches!(outcome, RunOutcome::Completed { points: 2, .. }));
    assert_eq!(script.launches(), vec![Some(proxy_id), None]);
    assert_eq!(proxy_status(&store, proxy_id).await, ProxyStatus::Dead);
    assert_eq!(store.results_for_scan(scan.id).await.unwrap().len(), 2);
}

#[tokio::test]
async fn launch_failure_marks_scan_failed_with_alert() {
    let store = Arc::new(MemoryStore::new());
    let scan = create_scan(&store, 2).await;
    let script = Arc::new(Script::new(Search::Listings(Vec::new()), Launch::FailAll));

    let outcome = orchestrator(&store, &script).run_scan(scan.id).await.unwrap();
    assert!(matches!(outcome, RunOutcome::Failed(ref msg) if msg.contains("chrome binary not found")));

    assert_eq!(store.scan_status(scan.id).await.unwrap(), Some(ScanStatus::Failed));
    let alerts = store.alerts_for_scan(scan.id).await.unwrap();
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].kind, AlertKind::ScanError);
    assert!(store.results_for_scan(scan.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn rank_change_between_scans_raises_alert() {
    let store = Arc::new(MemoryStore::new());

    let first = create_scan(&store, 2).await;
    let low = Arc::new(Script::new(
        Search::Listings(page(&["A", "B", "C", "D", "Joe's Plumbing"])),
        Launch::Ok,
    ));
    orchestrator(&store, &low).run_scan(first.id).await.unwrap();

    let second = create_scan(&store, 2).await;
    let high = Arc::new(Script::new(Search::Listings(page(&["Joe's Plumbing", "A"])), Launch::Ok));
    let outcome = orchestrator(&store, &high).run_scan(second.id).await.unwrap();
    assert_eq!(
        outcome,
        RunOutcome::Completed {
            points: 2,
            alert: Some(AlertKind::RankUp)
        }
    );

    let alerts = store.alerts_for_scan(second.id).await.unwrap();
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].kind, AlertKind::RankUp);
    assert!(alerts[0].message.contains("5.0"));
    assert!(alerts[0].message.contains("1.0"));
}

#[tokio::test]
async fn rank_drop_between_scans_raises_alert() {
    let store = Arc::new(MemoryStore::new());

    let first = create_scan(&store, 2).await;
    let high = Arc::new(Script::new(Search::Listings(page(&["Joe's Plumbing", "A"])), Launch::Ok));
    orchestrator(&store, &high).run_scan(first.id).await.unwrap();

    let second = create_scan(&store, 2).await;
    let low = Arc::new(Script::new(
        Search::Listings(page(&["A", "B", "C", "D", "Joe's Plumbing"])),
        Launch::Ok,
    ));
    let outcome = orchestrator(&store, &low).run_scan(second.id).await.unwrap();
    assert_eq!(
        outcome,
        RunOutcome::Completed {
            points: 2,
            alert: Some(AlertKind::RankDown)
        }
    );

    let alerts = store.alerts_for_scan(second.id).await.unwrap();
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].kind, AlertKind::RankDown);
    assert!(alerts[0].message.contains("dropped from 1.0 to 5.0"));
}

#[tokio::test]
async fn small_rank_shift_raises_no_alert() {
    let store = Arc::new(MemoryStore::new());

    let first = create_scan(&store, 4).await;
    let steady = Arc::new(Script::new(Search::Listings(page(&["A", "Joe's Plumbing"])), Launch::Ok));
    orchestrator(&store, &steady).run_scan(first.id).await.unwrap();

    // ranks 2, 2, 2, 3: average 2.25 against 2.0
    let second = create_scan(&store, 4).await;
    let slipping = Arc::new(Script::new(
        Search::Pages(vec![
            page(&["A", "Joe's Plumbing"]),
            page(&["A", "Joe's Plumbing"]),
            page(&["A", "Joe's Plumbing"]),
            page(&["A", "B", "Joe's Plumbing"]),
        ]),
        Launch::Ok,
    ));
    let outcome = orchestrator(&store, &slipping).run_scan(second.id).await.unwrap();
    assert_eq!(outcome, RunOutcome::Completed { points: 4, alert: None });

    let ranks: Vec<_> = store
        .results_for_scan(second.id)
        .await
        .unwrap()
        .iter()
        .map(|r| r.rank)
        .collect();
    assert_eq!(ranks, vec![Some(2), Some(2), Some(2), Some(3)]);
    assert!(store.alerts_for_scan(second.id).await.unwrap().is_empty());
}

/// Delegates to [`MemoryStore`] but refuses every result write.
struct ResultsOffline(Arc<MemoryStore>);

#[async_trait]
impl Store for ResultsOffline {
    async fn create_scan(&self, scan: NewScan) -> Result<Scan> {
        self.0.create_scan(scan).await
    }
    async fn get_scan(&self, id: Uuid) -> Result<Option<Scan>> {
        self.0.get_scan(id).await
    }
    async fn list_scans(&self, limit: i64) -> Result<Vec<Scan>> {
        self.0.list_scans(limit).await
    }
    async fn scan_status(&self, id: Uuid) -> Result<Option<ScanStatus>> {
        self.0.scan_status(id).await
    }
    async fn set_scan_status(&self, id: Uuid, status: ScanStatus) -> Result<()> {
        self.0.set_scan_status(id, status).await
    }
    async fn claim_scan(&self, id: Uuid) -> Result<bool> {
        self.0.claim_scan(id).await
    }
    async fn latest_completed_scan(&self, keyword: &str, business_name: &str, exclude: Uuid) -> Result<Option<Scan>> {
        self.0.latest_completed_scan(keyword, business_name, exclude).await
    }
    async fn completed_scan_series(&self, keyword: &str, business_name: &str) -> Result<Vec<Scan>> {
        self.0.completed_scan_series(keyword, business_name).await
    }
    async fn complete_scan(&self, id: Uuid, next_run: Option<DateTime<Utc>>, alert: Option<NewAlert>) -> Result<()> {
        self.0.complete_scan(id, next_run, alert).await
    }
    async fn fail_scan(&self, id: Uuid, message: &str) -> Result<()> {
        self.0.fail_scan(id, message).await
    }
    async fn rerun_scan(&self, id: Uuid) -> Result<()> {
        self.0.rerun_scan(id).await
    }
    async fn due_scans(&self, now: DateTime<Utc>) -> Result<Vec<Scan>> {
        self.0.due_scans(now).await
    }
    async fn spawn_recurrence(&self, id: Uuid) -> Result<Scan> {
        self.0.spawn_recurrence(id).await
    }
    async fn revert_recurrence(&self, original: Uuid, next_run: DateTime<Utc>, copy: Uuid) -> Result<()> {
        self.0.revert_recurrence(original, next_run, copy).await
    }
    async fn insert_result(&self, _result: NewResult) -> Result<ScanResult> {
        Err(CrawlerError::Database(sqlx::Error::PoolTimedOut))
    }
    async fn results_for_scan(&self, scan_id: Uuid) -> Result<Vec<ScanResult>> {
        self.0.results_for_scan(scan_id).await
    }
    async fn alerts_for_scan(&self, scan_id: Uuid) -> Result<Vec<Alert>> {
        self.0.alerts_for_scan(scan_id).await
    }
    async fn list_proxies(&self) -> Result<Vec<ProxyRecord>> {
        self.0.list_proxies().await
    }
    async fn add_proxy(&self, proxy: NewProxy) -> Result<ProxyRecord> {
        self.0.add_proxy(proxy).await
    }
    async fn remove_proxy(&self, id: Uuid) -> Result<bool> {
        self.0.remove_proxy(id).await
    }
    async fn set_proxy_enabled(&self, id: Uuid, enabled: bool) -> Result<bool> {
        self.0.set_proxy_enabled(id, enabled).await
    }
    async fn set_proxy_status(&self, id: Uuid, status: ProxyStatus, tested_at: DateTime<Utc>) -> Result<()> {
        self.0.set_proxy_status(id, status, tested_at).await
    }
    async fn get_setting(&self, key: &str) -> Result<Option<String>> {
        self.0.get_setting(key).await
    }
    async fn put_setting(&self, key: &str, value: &str) -> Result<()> {
        self.0.put_setting(key, value).await
    }
    async fn log_event(&self, event: &LogEvent) -> Result<()> {
        self.0.log_event(event).await
    }
}

#[tokio::test]
async fn result_write_failure_mid_scan_marks_scan_failed_with_alert() {
    let inner = Arc::new(MemoryStore::new());
    let scan = create_scan(&inner, 3).await;
    let store = Arc::new(ResultsOffline(inner.clone()));
    let script = Arc::new(Script::new(Search::Listings(page(&["Joe's Plumbing"])), Launch::Ok));

    let orchestrator = Orchestrator::new(
        store.clone(),
        ProxyPool::new(store.clone(), ProxySettings::default()),
        Arc::new(FakeLauncher(script.clone())),
        fast_settings(),
    );
    let outcome = orchestrator.run_scan(scan.id).await.unwrap();
    assert!(matches!(outcome, RunOutcome::Failed(ref msg) if msg.contains("database error")));

    // the loop stops at the first failed write
    assert_eq!(script.searches.load(Ordering::SeqCst), 1);
    assert_eq!(inner.scan_status(scan.id).await.unwrap(), Some(ScanStatus::Failed));
    let alerts = inner.alerts_for_scan(scan.id).await.unwrap();
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].kind, AlertKind::ScanError);
    assert!(alerts[0].message.contains("database error"));
}
