use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgRow};
use sqlx::types::Json;
use sqlx::Row;
use uuid::Uuid;

use crate::error::{CrawlerError, Result};
use crate::models::{
    Alert, AlertKind, BusinessEntry, NewAlert, NewResult, NewScan, ProxyRecord, ProxyStatus,
    SamplePoint, Scan, ScanResult, ScanStatus,
};
use crate::store::{NewProxy, Store};
use crate::telemetry::LogEvent;

pub async fn init_db(pool: &PgPool) -> Result<()> {
    // 1. Base schema
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS scans (
            id UUID PRIMARY KEY,
            keyword TEXT NOT NULL,
            business_name TEXT,
            center_lat DOUBLE PRECISION NOT NULL,
            center_lng DOUBLE PRECISION NOT NULL,
            radius_km DOUBLE PRECISION NOT NULL,
            grid_size INTEGER NOT NULL,
            shape TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'PENDING',
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        );
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS results (
            id UUID PRIMARY KEY,
            scan_id UUID NOT NULL REFERENCES scans(id) ON DELETE CASCADE,
            point_id TEXT NOT NULL,
            lat DOUBLE PRECISION NOT NULL,
            lng DOUBLE PRECISION NOT NULL,
            top_results JSONB NOT NULL DEFAULT '[]',
            rank INTEGER,
            matched_name TEXT,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        );
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS alerts (
            id UUID PRIMARY KEY,
            scan_id UUID NOT NULL REFERENCES scans(id) ON DELETE CASCADE,
            kind TEXT NOT NULL,
            message TEXT NOT NULL,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        );
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS proxies (
            id UUID PRIMARY KEY,
            host TEXT NOT NULL,
            port INTEGER NOT NULL,
            username TEXT,
            password TEXT,
            protocol TEXT NOT NULL DEFAULT 'HTTP',
            enabled BOOLEAN NOT NULL DEFAULT TRUE,
            status TEXT NOT NULL DEFAULT 'UNTESTED',
            last_tested TIMESTAMPTZ,
            UNIQUE (host, port)
        );
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE TABLE IF NOT EXISTS global_settings (key TEXT PRIMARY KEY, value TEXT NOT NULL);")
        .execute(pool)
        .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS system_logs (
            id BIGSERIAL PRIMARY KEY,
            level TEXT NOT NULL,
            source TEXT NOT NULL,
            message TEXT NOT NULL,
            detail JSONB,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        );
        "#,
    )
    .execute(pool)
    .await?;

    // 2. Schema evolution: columns added after the first release
    let evolutions = [
        "ALTER TABLE scans ADD COLUMN IF NOT EXISTS custom_points JSONB;",
        "ALTER TABLE scans ADD COLUMN IF NOT EXISTS recurrence TEXT NOT NULL DEFAULT 'NONE';",
        "ALTER TABLE scans ADD COLUMN IF NOT EXISTS next_run TIMESTAMPTZ;",
        "ALTER TABLE proxies ADD COLUMN IF NOT EXISTS kind TEXT NOT NULL DEFAULT 'RESIDENTIAL';",
        "CREATE INDEX IF NOT EXISTS idx_results_scan ON results (scan_id, created_at);",
        "CREATE INDEX IF NOT EXISTS idx_scans_target ON scans (keyword, business_name, status);",
    ];
    for statement in evolutions {
        if let Err(e) = sqlx::query(statement).execute(pool).await {
            tracing::warn!("schema evolution skipped ({}): {}", statement, e);
        }
    }

    Ok(())
}

const SCAN_COLUMNS: &str = "id, keyword, business_name, center_lat, center_lng, radius_km, grid_size, \
     shape, custom_points, recurrence, status, next_run, created_at";

const PROXY_COLUMNS: &str = "id, host, port, username, password, protocol, kind, enabled, status, last_tested";

fn text_column<T>(row: &PgRow, column: &str) -> Result<T>
where
    T: std::str::FromStr<Err = CrawlerError>,
{
    let raw: String = row.try_get(column)?;
    raw.parse()
}

fn scan_from_row(row: &PgRow) -> Result<Scan> {
    let custom_points: Option<Json<Vec<SamplePoint>>> = row.try_get("custom_points")?;
    let grid_size: i32 = row.try_get("grid_size")?;
    Ok(Scan {
        id: row.try_get("id")?,
        keyword: row.try_get("keyword")?,
        business_name: row.try_get("business_name")?,
        center_lat: row.try_get("center_lat")?,
        center_lng: row.try_get("center_lng")?,
        radius_km: row.try_get("radius_km")?,
        grid_size: grid_size.max(0) as u32,
        shape: text_column(row, "shape")?,
        custom_points: custom_points.map(|j| j.0),
        recurrence: text_column(row, "recurrence")?,
        status: text_column(row, "status")?,
        next_run: row.try_get("next_run")?,
        created_at: row.try_get("created_at")?,
    })
}

fn result_from_row(row: &PgRow) -> Result<ScanResult> {
    let top_results: Json<Vec<BusinessEntry>> = row.try_get("top_results")?;
    let rank: Option<i32> = row.try_get("rank")?;
    Ok(ScanResult {
        id: row.try_get("id")?,
        scan_id: row.try_get("scan_id")?,
        point_id: row.try_get("point_id")?,
        lat: row.try_get("lat")?,
        lng: row.try_get("lng")?,
        top_results: top_results.0,
        rank: rank.map(|r| r.max(0) as u32),
        matched_name: row.try_get("matched_name")?,
        created_at: row.try_get("created_at")?,
    })
}

fn proxy_from_row(row: &PgRow) -> Result<ProxyRecord> {
    let port: i32 = row.try_get("port")?;
    Ok(ProxyRecord {
        id: row.try_get("id")?,
        host: row.try_get("host")?,
        port: u16::try_from(port).map_err(|_| CrawlerError::InvalidInput(format!("stored port {port}")))?,
        username: row.try_get("username")?,
        password: row.try_get("password")?,
        protocol: text_column(row, "protocol")?,
        kind: text_column(row, "kind")?,
        enabled: row.try_get("enabled")?,
        status: text_column(row, "status")?,
        last_tested: row.try_get("last_tested")?,
    })
}

fn alert_from_row(row: &PgRow) -> Result<Alert> {
    Ok(Alert {
        id: row.try_get("id")?,
        scan_id: row.try_get("scan_id")?,
        kind: text_column(row, "kind")?,
        message: row.try_get("message")?,
        created_at: row.try_get("created_at")?,
    })
}

/// Postgres-backed [`Store`].
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn fetch_scans(&self, sql: &str, binds: ScanQuery<'_>) -> Result<Vec<Scan>> {
        let query = sqlx::query(sql);
        let query = match binds {
            ScanQuery::Target { keyword, business } => query.bind(keyword).bind(business),
            ScanQuery::Due(now) => query.bind(now),
            ScanQuery::Limit(limit) => query.bind(limit),
        };
        query.fetch_all(&self.pool).await?.iter().map(scan_from_row).collect()
    }
}

enum ScanQuery<'a> {
    Target { keyword: &'a str, business: &'a str },
    Due(DateTime<Utc>),
    Limit(i64),
}

async fn insert_alert(conn: &mut sqlx::PgConnection, alert: &NewAlert) -> Result<()> {
    sqlx::query("INSERT INTO alerts (id, scan_id, kind, message) VALUES ($1, $2, $3, $4)")
        .bind(Uuid::new_v4())
        .bind(alert.scan_id)
        .bind(alert.kind.as_str())
        .bind(&alert.message)
        .execute(conn)
        .await?;
    Ok(())
}

#[async_trait]
impl Store for PgStore {
    async fn create_scan(&self, scan: NewScan) -> Result<Scan> {
        let sql = format!(
            "INSERT INTO scans (id, keyword, business_name, center_lat, center_lng, radius_km, grid_size, \
             shape, custom_points, recurrence, status) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, 'PENDING') RETURNING {SCAN_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(Uuid::new_v4())
            .bind(&scan.keyword)
            .bind(&scan.business_name)
            .bind(scan.center_lat)
            .bind(scan.center_lng)
            .bind(scan.radius_km)
            .bind(scan.grid_size as i32)
            .bind(scan.shape.as_str())
            .bind(scan.custom_points.as_ref().map(Json))
            .bind(scan.recurrence.as_str())
            .fetch_one(&self.pool)
            .await?;
        scan_from_row(&row)
    }

    async fn get_scan(&self, id: Uuid) -> Result<Option<Scan>> {
        let sql = format!("SELECT {SCAN_COLUMNS} FROM scans WHERE id = $1");
        let row = sqlx::query(&sql).bind(id).fetch_optional(&self.pool).await?;
        row.as_ref().map(scan_from_row).transpose()
    }

    async fn list_scans(&self, limit: i64) -> Result<Vec<Scan>> {
        let sql = format!("SELECT {SCAN_COLUMNS} FROM scans ORDER BY created_at DESC LIMIT $1");
        self.fetch_scans(&sql, ScanQuery::Limit(limit)).await
    }

    async fn scan_status(&self, id: Uuid) -> Result<Option<ScanStatus>> {
        let status: Option<String> = sqlx::query_scalar("SELECT status FROM scans WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        status.map(|s| s.parse()).transpose()
    }

    async fn set_scan_status(&self, id: Uuid, status: ScanStatus) -> Result<()> {
        let done = sqlx::query("UPDATE scans SET status = $2 WHERE id = $1")
            .bind(id)
            .bind(status.as_str())
            .execute(&self.pool)
            .await?;
        if done.rows_affected() == 0 {
            return Err(CrawlerError::not_found("scan", id));
        }
        Ok(())
    }

    async fn claim_scan(&self, id: Uuid) -> Result<bool> {
        let done = sqlx::query("UPDATE scans SET status = 'RUNNING' WHERE id = $1 AND status = 'PENDING'")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(done.rows_affected() == 1)
    }

    async fn latest_completed_scan(
        &self,
        keyword: &str,
        business_name: &str,
        exclude: Uuid,
    ) -> Result<Option<Scan>> {
        let sql = format!(
            "SELECT {SCAN_COLUMNS} FROM scans \
             WHERE keyword = $1 AND business_name = $2 AND status = 'COMPLETED' AND id <> $3 \
             ORDER BY created_at DESC LIMIT 1"
        );
        let row = sqlx::query(&sql)
            .bind(keyword)
            .bind(business_name)
            .bind(exclude)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(scan_from_row).transpose()
    }

    async fn completed_scan_series(&self, keyword: &str, business_name: &str) -> Result<Vec<Scan>> {
        let sql = format!(
            "SELECT {SCAN_COLUMNS} FROM scans \
             WHERE keyword = $1 AND business_name = $2 AND status = 'COMPLETED' ORDER BY created_at ASC"
        );
        self.fetch_scans(
            &sql,
            ScanQuery::Target {
                keyword,
                business: business_name,
            },
        )
        .await
    }

    async fn complete_scan(
        &self,
        id: Uuid,
        next_run: Option<DateTime<Utc>>,
        alert: Option<NewAlert>,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        if let Some(alert) = &alert {
            insert_alert(&mut tx, alert).await?;
        }
        sqlx::query("UPDATE scans SET status = 'COMPLETED', next_run = $2 WHERE id = $1")
            .bind(id)
            .bind(next_run)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn fail_scan(&self, id: Uuid, message: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("UPDATE scans SET status = 'FAILED' WHERE id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        insert_alert(
            &mut tx,
            &NewAlert {
                scan_id: id,
                kind: AlertKind::ScanError,
                message: message.to_string(),
            },
        )
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn rerun_scan(&self, id: Uuid) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM results WHERE scan_id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        let done = sqlx::query("UPDATE scans SET status = 'PENDING' WHERE id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        if done.rows_affected() == 0 {
            return Err(CrawlerError::not_found("scan", id));
        }
        tx.commit().await?;
        Ok(())
    }

    async fn due_scans(&self, now: DateTime<Utc>) -> Result<Vec<Scan>> {
        let sql = format!(
            "SELECT {SCAN_COLUMNS} FROM scans \
             WHERE status IN ('COMPLETED', 'FAILED') AND next_run IS NOT NULL AND next_run <= $1 \
             ORDER BY next_run ASC"
        );
        self.fetch_scans(&sql, ScanQuery::Due(now)).await
    }

    async fn spawn_recurrence(&self, id: Uuid) -> Result<Scan> {
        let mut tx = self.pool.begin().await?;
        let sql = format!(
            "INSERT INTO scans (id, keyword, business_name, center_lat, center_lng, radius_km, grid_size, \
             shape, custom_points, recurrence, status) \
             SELECT $2, keyword, business_name, center_lat, center_lng, radius_km, grid_size, \
             shape, custom_points, recurrence, 'PENDING' FROM scans WHERE id = $1 \
             RETURNING {SCAN_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(id)
            .bind(Uuid::new_v4())
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| CrawlerError::not_found("scan", id))?;
        sqlx::query("UPDATE scans SET next_run = NULL WHERE id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        scan_from_row(&row)
    }

    async fn revert_recurrence(&self, original: Uuid, next_run: DateTime<Utc>, copy: Uuid) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM scans WHERE id = $1 AND status = 'PENDING'")
            .bind(copy)
            .execute(&mut *tx)
            .await?;
        let done = sqlx::query("UPDATE scans SET next_run = $2 WHERE id = $1")
            .bind(original)
            .bind(next_run)
            .execute(&mut *tx)
            .await?;
        if done.rows_affected() == 0 {
            return Err(CrawlerError::not_found("scan", original));
        }
        tx.commit().await?;
        Ok(())
    }

    async fn insert_result(&self, result: NewResult) -> Result<ScanResult> {
        let row = sqlx::query(
            "INSERT INTO results (id, scan_id, point_id, lat, lng, top_results, rank, matched_name) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
             RETURNING id, scan_id, point_id, lat, lng, top_results, rank, matched_name, created_at",
        )
        .bind(Uuid::new_v4())
        .bind(result.scan_id)
        .bind(&result.point.id)
        .bind(result.point.lat)
        .bind(result.point.lng)
        .bind(Json(&result.top_results))
        .bind(result.rank.map(|r| r as i32))
        .bind(&result.matched_name)
        .fetch_one(&self.pool)
        .await?;
        result_from_row(&row)
    }

    async fn results_for_scan(&self, scan_id: Uuid) -> Result<Vec<ScanResult>> {
        sqlx::query(
            "SELECT id, scan_id, point_id, lat, lng, top_results, rank, matched_name, created_at \
             FROM results WHERE scan_id = $1 ORDER BY created_at ASC",
        )
        .bind(scan_id)
        .fetch_all(&self.pool)
        .await?
        .iter()
        .map(result_from_row)
        .collect()
    }

    async fn alerts_for_scan(&self, scan_id: Uuid) -> Result<Vec<Alert>> {
        sqlx::query(
            "SELECT id, scan_id, kind, message, created_at FROM alerts WHERE scan_id = $1 ORDER BY created_at ASC",
        )
        .bind(scan_id)
        .fetch_all(&self.pool)
        .await?
        .iter()
        .map(alert_from_row)
        .collect()
    }

    async fn list_proxies(&self) -> Result<Vec<ProxyRecord>> {
        let sql = format!("SELECT {PROXY_COLUMNS} FROM proxies ORDER BY host, port");
        sqlx::query(&sql)
            .fetch_all(&self.pool)
            .await?
            .iter()
            .map(proxy_from_row)
            .collect()
    }

    async fn add_proxy(&self, proxy: NewProxy) -> Result<ProxyRecord> {
        let sql = format!(
            "INSERT INTO proxies (id, host, port, username, password, protocol, kind) \
             VALUES ($1, $2, $3, $4, $5, $6, $7) \
             ON CONFLICT (host, port) DO NOTHING RETURNING {PROXY_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(Uuid::new_v4())
            .bind(&proxy.host)
            .bind(proxy.port as i32)
            .bind(&proxy.username)
            .bind(&proxy.password)
            .bind(proxy.protocol.as_str())
            .bind(proxy.kind.as_str())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| {
                CrawlerError::InvalidInput(format!("proxy {}:{} already exists", proxy.host, proxy.port))
            })?;
        proxy_from_row(&row)
    }

    async fn remove_proxy(&self, id: Uuid) -> Result<bool> {
        let done = sqlx::query("DELETE FROM proxies WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(done.rows_affected() > 0)
    }

    async fn set_proxy_enabled(&self, id: Uuid, enabled: bool) -> Result<bool> {
        let done = sqlx::query("UPDATE proxies SET enabled = $2 WHERE id = $1")
            .bind(id)
            .bind(enabled)
            .execute(&self.pool)
            .await?;
        Ok(done.rows_affected() > 0)
    }

    async fn set_proxy_status(&self, id: Uuid, status: ProxyStatus, tested_at: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE proxies SET status = $2, last_tested = $3 WHERE id = $1")
            .bind(id)
            .bind(status.as_str())
            .bind(tested_at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_setting(&self, key: &str) -> Result<Option<String>> {
        Ok(sqlx::query_scalar("SELECT value FROM global_settings WHERE key = $1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn put_setting(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO global_settings (key, value) VALUES ($1, $2) \
             ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value",
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn log_event(&self, event: &LogEvent) -> Result<()> {
        sqlx::query("INSERT INTO system_logs (level, source, message, detail) VALUES ($1, $2, $3, $4)")
            .bind(event.level.as_str())
            .bind(&event.source)
            .bind(&event.message)
            .bind(&event.detail)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
