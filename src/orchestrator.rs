//! Scan state machine: PENDING -> RUNNING -> COMPLETED | FAILED | STOPPED.
//!
//! One browser session is shared across every point of a scan and moved with
//! a geolocation override. Points are visited in order; each gets up to
//! `max_attempts` tries with a fresh session (and a fresh proxy when the old
//! one looks responsible) between tries. A point that never succeeds is still
//! written, with no listings and no rank.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::json;
use uuid::Uuid;

use crate::config::ScanSettings;
use crate::error::{CrawlerError, Result};
use crate::grid;
use crate::insights::{average_rank, matches_target};
use crate::models::{
    AlertKind, BusinessEntry, NewAlert, NewResult, ProxyRecord, SamplePoint, Scan, ScanStatus,
};
use crate::proxy::ProxyPool;
use crate::session::{BrowserLauncher, LaunchReport, SessionController};
use crate::store::{Store, USE_SYSTEM_PROXY};
use crate::telemetry::{LogEvent, LogLevel, Telemetry};

const SOURCE: &str = "orchestrator";

/// How a call to [`Orchestrator::run_scan`] ended.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Completed {
        points: usize,
        alert: Option<AlertKind>,
    },
    /// Status flipped to STOPPED or PENDING while running; nothing more was written.
    Superseded(ScanStatus),
    /// The scan was not PENDING when picked up, so it was left untouched.
    Skipped(ScanStatus),
    /// The scan row disappeared.
    Missing,
    Failed(String),
}

/// First listing whose name contains the target name, ignoring case.
pub fn match_target(listings: &[BusinessEntry], target: Option<&str>) -> Option<(u32, String)> {
    let target = target?;
    listings
        .iter()
        .find(|entry| matches_target(&entry.name, target))
        .map(|entry| (entry.rank, entry.name.clone()))
}

pub struct Orchestrator<S: Store + ?Sized, L: BrowserLauncher> {
    store: Arc<S>,
    proxies: ProxyPool<S>,
    launcher: Arc<L>,
    telemetry: Telemetry<S>,
    settings: ScanSettings,
}

impl<S, L> Orchestrator<S, L>
where
    S: Store + ?Sized + 'static,
    L: BrowserLauncher,
{
    pub fn new(store: Arc<S>, proxies: ProxyPool<S>, launcher: Arc<L>, settings: ScanSettings) -> Self {
        Self {
            telemetry: Telemetry::new(store.clone()),
            store,
            proxies,
            launcher,
            settings,
        }
    }

    pub fn settings(&self) -> &ScanSettings {
        &self.settings
    }

    /// Run one scan to a terminal state. Errors are only returned when even
    /// recording the failure did not work.
    pub async fn run_scan(&self, scan_id: Uuid) -> Result<RunOutcome> {
        let Some(scan) = self.store.get_scan(scan_id).await? else {
            self.telemetry.warn(SOURCE, format!("scan {scan_id} not found, nothing to run"));
            return Ok(RunOutcome::Missing);
        };
        if !self.store.claim_scan(scan_id).await? {
            let status = self.store.scan_status(scan_id).await?.unwrap_or(scan.status);
            self.telemetry.info(SOURCE, format!("scan {scan_id} is {status}, not starting"));
            return Ok(RunOutcome::Skipped(status));
        }

        let mut controller = SessionController::new(self.launcher.clone());
        let outcome = self.drive(&scan, &mut controller).await;
        controller.close().await;

        match outcome {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                let message = e.to_string();
                self.telemetry.emit(
                    LogEvent::new(LogLevel::Error, SOURCE, format!("scan {scan_id} failed: {message}"))
                        .with_detail(json!({ "scan_id": scan_id })),
                );
                self.store.fail_scan(scan_id, &message).await?;
                Ok(RunOutcome::Failed(message))
            }
        }
    }

    async fn drive(&self, scan: &Scan, controller: &mut SessionController<L>) -> Result<RunOutcome> {
        let mut rng = StdRng::from_entropy();
        let points = grid::points_for_scan(scan, &mut rng);

        self.telemetry.emit(
            LogEvent::new(
                LogLevel::Info,
                SOURCE,
                format!("scan {} started: \"{}\" over {} points", scan.id, scan.keyword, points.len()),
            )
            .with_detail(json!({
                "scan_id": scan.id,
                "shape": scan.shape.as_str(),
                "radius_km": scan.radius_km,
                "points": points.len(),
            })),
        );

        let use_proxy = self
            .store
            .get_setting(USE_SYSTEM_PROXY)
            .await?
            .is_some_and(|v| v.trim().eq_ignore_ascii_case("true"));

        let proxy = self.next_proxy(use_proxy).await?;
        let report = controller.open(proxy, scan.center()).await?;
        self.after_launch(&report).await?;

        for (idx, point) in points.iter().enumerate() {
            if idx > 0 {
                self.pause_between_points(&mut rng).await;
            }
            if let Some(exit) = self.superseded(scan.id).await? {
                return Ok(exit);
            }

            let result = self.visit_point(scan, point, controller, use_proxy).await?;
            // A stop or rerun may have landed while the point was in flight.
            if let Some(exit) = self.superseded(scan.id).await? {
                return Ok(exit);
            }
            self.store.insert_result(result).await?;
        }

        if let Some(exit) = self.superseded(scan.id).await? {
            return Ok(exit);
        }

        let next_run = scan.recurrence.next_run(Utc::now());
        let alert = self.rank_alert(scan).await?;
        let alert_kind = alert.as_ref().map(|a| a.kind);
        if let Some(alert) = &alert {
            self.telemetry.info(SOURCE, alert.message.clone());
        }
        self.store.complete_scan(scan.id, next_run, alert).await?;

        self.telemetry.emit(
            LogEvent::new(
                LogLevel::Info,
                SOURCE,
                format!("scan {} completed ({} points)", scan.id, points.len()),
            )
            .with_detail(json!({ "scan_id": scan.id, "next_run": next_run })),
        );

        Ok(RunOutcome::Completed {
            points: points.len(),
            alert: alert_kind,
        })
    }

    async fn next_proxy(&self, use_proxy: bool) -> Result<Option<ProxyRecord>> {
        if !use_proxy {
            return Ok(None);
        }
        let picked = self.proxies.pick().await?;
        if picked.is_none() {
            self.telemetry.warn(SOURCE, "system proxy enabled but no usable endpoint, going direct");
        }
        Ok(picked)
    }

    /// Retire the endpoint behind a failed proxied launch.
    async fn after_launch(&self, report: &LaunchReport) -> Result<()> {
        let Some(error) = &report.proxy_error else {
            return Ok(());
        };
        self.telemetry.warn(SOURCE, format!("proxied launch failed, continuing direct: {error}"));
        if let Some(id) = report.failed_proxy {
            if crate::error::message_indicates_proxy_failure(error) {
                self.proxies.mark_dead(id).await?;
            }
        }
        Ok(())
    }

    async fn superseded(&self, scan_id: Uuid) -> Result<Option<RunOutcome>> {
        match self.store.scan_status(scan_id).await? {
            None => Ok(Some(RunOutcome::Missing)),
            Some(status) if status.supersedes_run() => {
                self.telemetry.info(
                    SOURCE,
                    format!("scan {scan_id} is now {status}, exiting without further writes"),
                );
                Ok(Some(RunOutcome::Superseded(status)))
            }
            Some(_) => Ok(None),
        }
    }

    async fn pause_between_points(&self, rng: &mut StdRng) {
        let min = self.settings.point_delay_min.as_millis() as u64;
        let max = self.settings.point_delay_max.as_millis() as u64;
        let wait = if max > min { rng.gen_range(min..=max) } else { min };
        if wait > 0 {
            tokio::time::sleep(Duration::from_millis(wait)).await;
        }
    }

    async fn attempt(
        &self,
        controller: &mut SessionController<L>,
        keyword: &str,
        point: &SamplePoint,
    ) -> Result<Vec<BusinessEntry>> {
        controller.reposition(point.coordinate()).await?;
        controller.search(keyword, point.coordinate()).await
    }

    async fn visit_point(
        &self,
        scan: &Scan,
        point: &SamplePoint,
        controller: &mut SessionController<L>,
        use_proxy: bool,
    ) -> Result<NewResult> {
        let max_attempts = self.settings.max_attempts.max(1);

        for attempt in 1..=max_attempts {
            let err = match self.attempt(controller, &scan.keyword, point).await {
                Ok(listings) => {
                    let matched = match_target(&listings, scan.business_name.as_deref());
                    self.telemetry.debug(
                        SOURCE,
                        format!(
                            "point {} -> {} listings, target rank {:?}",
                            point.id,
                            listings.len(),
                            matched.as_ref().map(|(rank, _)| *rank)
                        ),
                    );
                    let (rank, matched_name) = match matched {
                        Some((rank, name)) => (Some(rank), Some(name)),
                        None => (None, None),
                    };
                    return Ok(NewResult {
                        scan_id: scan.id,
                        point: point.clone(),
                        top_results: listings,
                        rank,
                        matched_name,
                    });
                }
                Err(e) => e,
            };

            self.telemetry.emit(
                LogEvent::new(
                    LogLevel::Warn,
                    SOURCE,
                    format!("point {} attempt {}/{} failed: {}", point.id, attempt, max_attempts, err),
                )
                .with_detail(json!({ "scan_id": scan.id, "point": point.id, "attempt": attempt })),
            );

            if attempt < max_attempts {
                self.rotate_session(scan, controller, &err, use_proxy).await?;
            }
        }

        self.telemetry.emit(
            LogEvent::new(
                LogLevel::Error,
                SOURCE,
                format!("point {} exhausted {} attempts, recording empty result", point.id, max_attempts),
            )
            .with_detail(json!({ "scan_id": scan.id, "point": point.id })),
        );
        Ok(NewResult {
            scan_id: scan.id,
            point: point.clone(),
            top_results: Vec::new(),
            rank: None,
            matched_name: None,
        })
    }

    /// Reopen the session before the next attempt, retiring the proxy first
    /// when the failure points at it. A reopen failure leaves the controller
    /// closed; the next attempt then fails with `SessionClosed`.
    async fn rotate_session(
        &self,
        scan: &Scan,
        controller: &mut SessionController<L>,
        err: &CrawlerError,
        use_proxy: bool,
    ) -> Result<()> {
        if err.is_proxy_failure() {
            if let Some(id) = controller.proxy().map(|p| p.id) {
                self.proxies.mark_dead(id).await?;
            }
        }

        let proxy = self.next_proxy(use_proxy).await?;
        match controller.open(proxy, scan.center()).await {
            Ok(report) => self.after_launch(&report).await,
            Err(e) => {
                self.telemetry.warn(SOURCE, format!("session reopen failed: {e}"));
                Ok(())
            }
        }
    }

    /// Compare this scan's average target rank with the previous completed
    /// scan of the same keyword and business.
    async fn rank_alert(&self, scan: &Scan) -> Result<Option<NewAlert>> {
        let Some(business) = scan.business_name.as_deref().filter(|b| !b.trim().is_empty()) else {
            return Ok(None);
        };
        let Some(previous) = self
            .store
            .latest_completed_scan(&scan.keyword, business, scan.id)
            .await?
        else {
            return Ok(None);
        };

        let penalty = self.settings.missing_rank_penalty;
        let current = self.store.results_for_scan(scan.id).await?;
        let prior = self.store.results_for_scan(previous.id).await?;
        let (Some(cur_avg), Some(prev_avg)) = (average_rank(&current, penalty), average_rank(&prior, penalty))
        else {
            return Ok(None);
        };

        let delta = prev_avg - cur_avg;
        if delta.abs() < self.settings.rank_alert_threshold {
            return Ok(None);
        }

        let (kind, verb) = if delta > 0.0 {
            (AlertKind::RankUp, "improved")
        } else {
            (AlertKind::RankDown, "dropped")
        };
        Ok(Some(NewAlert {
            scan_id: scan.id,
            kind,
            message: format!(
                "\"{}\" average rank for \"{}\" {} from {:.1} to {:.1}",
                business, scan.keyword, verb, prev_avg, cur_avg
            ),
        }))
    }
}
