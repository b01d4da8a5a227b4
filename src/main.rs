use std::sync::Arc;

use anyhow::Context;
use axum::{
    routing::{delete, get, post},
    Router,
};
use sqlx::postgres::PgPoolOptions;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use geo_rank_crawler::api::{self, AppState};
use geo_rank_crawler::config::AppConfig;
use geo_rank_crawler::db::{self, PgStore};
use geo_rank_crawler::geocode::Geocoder;
use geo_rank_crawler::orchestrator::Orchestrator;
use geo_rank_crawler::proxy::{HttpProber, ProxyPool};
use geo_rank_crawler::queue::ScanQueue;
use geo_rank_crawler::session::ChromeLauncher;
use geo_rank_crawler::store::Store;
use geo_rank_crawler::{scheduler, worker};

#[derive(OpenApi)]
#[openapi(
    paths(
        api::create_scan,
        api::list_scans,
        api::get_scan,
        api::get_results,
        api::stop_scan,
        api::rerun_scan,
        api::scan_insights,
        api::rank_history,
        api::grid_preview,
        api::list_proxies,
        api::add_proxies,
        api::remove_proxy,
        api::enable_proxy,
        api::validate_proxies,
        api::proxy_stats,
        api::get_system_proxy,
        api::put_system_proxy
    ),
    components(
        schemas(
            api::CreateScanRequest,
            api::ScanDetail,
            api::GridPreviewRequest,
            api::AddProxiesRequest,
            api::AddProxiesResponse,
            api::RejectedProxy,
            api::EnableProxyRequest,
            api::ProxyActionResponse,
            api::SystemProxySetting,
            api::ErrorResponse,
            geo_rank_crawler::models::Scan,
            geo_rank_crawler::models::ScanResult,
            geo_rank_crawler::models::ScanStatus,
            geo_rank_crawler::models::GridShape,
            geo_rank_crawler::models::Recurrence,
            geo_rank_crawler::models::Coordinate,
            geo_rank_crawler::models::SamplePoint,
            geo_rank_crawler::models::BusinessEntry,
            geo_rank_crawler::models::Alert,
            geo_rank_crawler::models::AlertKind,
            geo_rank_crawler::models::ProxyRecord,
            geo_rank_crawler::models::ProxyProtocol,
            geo_rank_crawler::models::ProxyKind,
            geo_rank_crawler::models::ProxyStatus,
            geo_rank_crawler::proxy::PoolStats,
            geo_rank_crawler::proxy::ProbeOutcome,
            geo_rank_crawler::insights::MarketInsights,
            geo_rank_crawler::insights::CompetitorProfile,
            geo_rank_crawler::insights::ThreatLevel,
            geo_rank_crawler::insights::CategoryStat,
            geo_rank_crawler::insights::RatingBucket,
            geo_rank_crawler::insights::RatingHistogram,
            geo_rank_crawler::insights::ReviewStats,
            geo_rank_crawler::insights::ProfileMetrics,
            geo_rank_crawler::insights::TargetSummary,
            geo_rank_crawler::insights::Priority,
            geo_rank_crawler::insights::Recommendation,
            geo_rank_crawler::insights::RankHistoryPoint
        )
    ),
    tags(
        (name = "scans", description = "Scan lifecycle"),
        (name = "insights", description = "Competitive intelligence"),
        (name = "proxy", description = "Proxy Management API"),
        (name = "settings", description = "Global settings")
    )
)]
struct ApiDoc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::from_env().context("loading configuration")?;
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&config.database_url)
        .await
        .context("connecting to Postgres")?;
    db::init_db(&pool).await.context("initialising schema")?;

    let store = Arc::new(PgStore::new(pool));
    let queue = Arc::new(ScanQueue::new(&config.redis_url, config.queue_key.clone())?);
    let launcher = Arc::new(ChromeLauncher::new(config.browser.clone()));

    let orchestrator = Arc::new(Orchestrator::new(
        store.clone(),
        ProxyPool::new(store.clone(), config.proxy.clone()),
        launcher,
        config.scan.clone(),
    ));
    tokio::spawn(worker::start_worker(queue.clone(), orchestrator));

    let _scheduler = scheduler::start_scheduler(&config.scheduler_cron, store.clone(), queue.clone())
        .await
        .context("starting recurrence scheduler")?;
    tracing::info!("recurrence scheduler running ({})", config.scheduler_cron);

    let shared: Arc<dyn Store> = store;
    let state = Arc::new(AppState {
        proxies: ProxyPool::new(shared.clone(), config.proxy.clone()),
        store: shared,
        submitter: queue,
        geocoder: Geocoder::new(config.geocoder_url.clone())?,
        prober: Arc::new(HttpProber::new(&config.proxy)),
        scan: config.scan.clone(),
    });

    let app = Router::new()
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .route("/scans", post(api::create_scan).get(api::list_scans))
        .route("/scans/:scan_id", get(api::get_scan))
        .route("/scans/:scan_id/results", get(api::get_results))
        .route("/scans/:scan_id/stop", post(api::stop_scan))
        .route("/scans/:scan_id/rerun", post(api::rerun_scan))
        .route("/scans/:scan_id/insights", get(api::scan_insights))
        .route("/scans/:scan_id/history", get(api::rank_history))
        .route("/grid/preview", post(api::grid_preview))
        // Proxy management endpoints
        .route("/proxies", get(api::list_proxies).post(api::add_proxies))
        .route("/proxies/stats", get(api::proxy_stats))
        .route("/proxies/validate", post(api::validate_proxies))
        .route("/proxies/:proxy_id", delete(api::remove_proxy))
        .route("/proxies/:proxy_id/enable", post(api::enable_proxy))
        .route(
            "/settings/system-proxy",
            get(api::get_system_proxy).put(api::put_system_proxy),
        )
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
    tracing::info!("listening on {}", listener.local_addr()?);
    axum::serve(listener, app).await?;

    Ok(())
}
