use std::sync::Arc;

use anyhow::Context;
use tokio::time::{sleep, Duration};

use crate::orchestrator::{Orchestrator, RunOutcome};
use crate::queue::{ScanJob, ScanQueue};
use crate::session::BrowserLauncher;
use crate::store::Store;

/// Poll the queue forever and run each scan to a terminal state, one at a time.
pub async fn start_worker<S, L>(queue: Arc<ScanQueue>, orchestrator: Arc<Orchestrator<S, L>>)
where
    S: Store + ?Sized + 'static,
    L: BrowserLauncher,
{
    tracing::info!("worker started, polling queue");

    loop {
        match queue.pop_job().await {
            Ok(Some(job)) => {
                tracing::info!("picked up scan {} (queued {})", job.scan_id, job.enqueued_at);
                if let Err(e) = process_job(&orchestrator, &job).await {
                    tracing::error!("scan {} could not be settled: {:#}", job.scan_id, e);
                }
            }
            Ok(None) => {
                sleep(Duration::from_millis(1000)).await;
            }
            Err(e) => {
                tracing::error!("queue error: {}", e);
                sleep(Duration::from_secs(5)).await;
            }
        }
    }
}

async fn process_job<S, L>(orchestrator: &Orchestrator<S, L>, job: &ScanJob) -> anyhow::Result<()>
where
    S: Store + ?Sized + 'static,
    L: BrowserLauncher,
{
    let outcome = orchestrator
        .run_scan(job.scan_id)
        .await
        .with_context(|| format!("running scan {}", job.scan_id))?;

    match outcome {
        RunOutcome::Completed { points, alert } => {
            tracing::info!("scan {} completed: {} points, alert {:?}", job.scan_id, points, alert)
        }
        RunOutcome::Superseded(status) => {
            tracing::info!("scan {} superseded ({})", job.scan_id, status)
        }
        RunOutcome::Skipped(status) => {
            tracing::info!("scan {} is {}, job dropped", job.scan_id, status)
        }
        RunOutcome::Missing => tracing::warn!("scan {} no longer exists", job.scan_id),
        RunOutcome::Failed(reason) => tracing::warn!("scan {} failed: {}", job.scan_id, reason),
    }
    Ok(())
}
