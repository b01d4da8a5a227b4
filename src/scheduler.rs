//! Recurring scan scheduler.
//!
//! A single cron job looks for DAILY/WEEKLY scans whose `next_run` has
//! passed, spawns a fresh PENDING copy of each and submits it for execution.
//! A copy that cannot be queued is removed again and the original stays due,
//! so the next sweep retries it.

use std::sync::Arc;

use chrono::Utc;
use tokio_cron_scheduler::{Job, JobScheduler, JobSchedulerError};

use crate::error::Result;
use crate::queue::ScanSubmitter;
use crate::store::Store;
use crate::telemetry::Telemetry;

const SOURCE: &str = "scheduler";

/// Build and start the scheduler. Dropping the returned handle stops it.
pub async fn start_scheduler<S, Q>(
    cron: &str,
    store: Arc<S>,
    submitter: Arc<Q>,
) -> std::result::Result<JobScheduler, JobSchedulerError>
where
    S: Store + ?Sized + 'static,
    Q: ScanSubmitter + 'static,
{
    let scheduler = JobScheduler::new().await?;

    let job = Job::new_async(cron, move |_uuid, _lock| {
        let store = Arc::clone(&store);
        let submitter = Arc::clone(&submitter);
        Box::pin(async move {
            match enqueue_due(store.as_ref(), submitter.as_ref(), &Telemetry::new(store.clone())).await {
                Ok(0) => tracing::debug!("scheduler: no recurring scans due"),
                Ok(n) => tracing::info!("scheduler: queued {} recurring scans", n),
                Err(e) => tracing::error!(error = %e, "scheduler: recurrence sweep failed"),
            }
        })
    })?;

    scheduler.add(job).await?;
    scheduler.start().await?;
    Ok(scheduler)
}

/// Spawn and submit every due recurrence. Returns how many were queued.
pub async fn enqueue_due<S, Q>(store: &S, submitter: &Q, telemetry: &Telemetry<S>) -> Result<usize>
where
    S: Store + ?Sized + 'static,
    Q: ScanSubmitter + ?Sized,
{
    let due = store.due_scans(Utc::now()).await?;
    let mut queued = 0;
    for scan in due {
        let next = store.spawn_recurrence(scan.id).await?;
        if let Err(e) = submitter.submit(next.id).await {
            telemetry.error(SOURCE, format!("could not queue recurrence {} of {}: {}", next.id, scan.id, e));
            if let Some(next_run) = scan.next_run {
                if let Err(e) = store.revert_recurrence(scan.id, next_run, next.id).await {
                    telemetry.error(SOURCE, format!("could not restore schedule of {}: {}", scan.id, e));
                }
            }
            continue;
        }
        telemetry.info(
            SOURCE,
            format!("{} recurrence of \"{}\" queued as {}", scan.recurrence, scan.keyword, next.id),
        );
        queued += 1;
    }
    Ok(queued)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use crate::models::{GridShape, NewScan, Recurrence, ScanStatus};
    use async_trait::async_trait;
    use tokio::sync::Mutex;
    use uuid::Uuid;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<Uuid>>);

    #[async_trait]
    impl ScanSubmitter for Recorder {
        async fn submit(&self, scan_id: Uuid) -> Result<()> {
            self.0.lock().await.push(scan_id);
            Ok(())
        }
    }

    struct Unreachable;

    #[async_trait]
    impl ScanSubmitter for Unreachable {
        async fn submit(&self, _scan_id: Uuid) -> Result<()> {
            Err(redis::RedisError::from((redis::ErrorKind::IoError, "connection refused")).into())
        }
    }

    async fn due_weekly_scan(store: &MemoryStore) -> Uuid {
        let scan = store
            .create_scan(NewScan {
                keyword: "dentist".into(),
                business_name: None,
                center_lat: 51.5,
                center_lng: -0.12,
                radius_km: 3.0,
                grid_size: 5,
                shape: GridShape::ConcentricRing,
                custom_points: None,
                recurrence: Recurrence::Weekly,
            })
            .await
            .unwrap();
        store
            .complete_scan(scan.id, Some(Utc::now() - chrono::Duration::seconds(5)), None)
            .await
            .unwrap();
        scan.id
    }

    #[tokio::test]
    async fn due_scans_are_copied_and_submitted_once() {
        let store = Arc::new(MemoryStore::new());
        due_weekly_scan(&store).await;

        let recorder = Recorder::default();
        let telemetry = Telemetry::new(store.clone());
        assert_eq!(enqueue_due(store.as_ref(), &recorder, &telemetry).await.unwrap(), 1);
        assert_eq!(enqueue_due(store.as_ref(), &recorder, &telemetry).await.unwrap(), 0);

        let submitted = recorder.0.lock().await.clone();
        assert_eq!(submitted.len(), 1);
        let copy = store.get_scan(submitted[0]).await.unwrap().unwrap();
        assert_eq!(copy.status, ScanStatus::Pending);
        assert_eq!(copy.keyword, "dentist");
    }

    #[tokio::test]
    async fn failed_submit_keeps_the_recurrence_due() {
        let store = Arc::new(MemoryStore::new());
        let original = due_weekly_scan(&store).await;
        let telemetry = Telemetry::new(store.clone());

        assert_eq!(enqueue_due(store.as_ref(), &Unreachable, &telemetry).await.unwrap(), 0);
        let scans = store.list_scans(10).await.unwrap();
        assert_eq!(scans.len(), 1);
        assert_eq!(scans[0].id, original);
        assert!(scans[0].next_run.is_some());

        let recorder = Recorder::default();
        assert_eq!(enqueue_due(store.as_ref(), &recorder, &telemetry).await.unwrap(), 1);
        let submitted = recorder.0.lock().await.clone();
        assert_eq!(submitted.len(), 1);
        assert_ne!(submitted[0], original);
    }
}
