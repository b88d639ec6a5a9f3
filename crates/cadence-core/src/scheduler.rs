//! Global release scheduler
//!
//! A fixed-interval tick over every release eligible for orchestration.
//! Each tick fans out over the candidates with bounded concurrency; per
//! release it acquires the cron lease, runs one orchestrator step under a
//! soft timeout, and releases the lease. Lease contention is a silent skip
//! and one release's error never stops the others.
//!
//! The tick trigger is pluggable: the in-process interval timer is the
//! default [`TickSource`], and an external job scheduler can drive the same
//! [`Scheduler::run_tick`] entrypoint instead.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{watch, Semaphore};
use tokio::time::{sleep, timeout, Duration};
use tracing::{debug, error, info, warn};

use crate::database::Database;
use crate::orchestrator::Orchestrator;
use crate::providers::ProviderRegistry;
use crate::task_executor::TaskExecutor;
use crate::Result;

/// Scheduler configuration
#[derive(Clone, Debug)]
pub struct SchedulerConfig {
    /// Tick interval in seconds
    pub tick_interval_secs: u64,
    /// Maximum releases orchestrated concurrently within one tick
    pub max_concurrency: usize,
    /// Soft timeout for one orchestrator execute; the next tick resumes
    pub execute_timeout_secs: u64,
    /// How long shutdown waits for in-flight orchestrators
    pub shutdown_grace_secs: u64,
    /// Lease owner identity of this scheduler instance
    pub instance_id: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: 60,
            max_concurrency: 8,
            execute_timeout_secs: 120,
            shutdown_grace_secs: 30,
            instance_id: format!("scheduler-{}", uuid::Uuid::new_v4()),
        }
    }
}

/// Outcome counters for one tick
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickStats {
    /// Releases whose orchestrator ran
    pub processed: usize,
    /// Releases skipped on lease contention
    pub skipped_lease: usize,
    /// Releases whose orchestrator errored or timed out
    pub failed: usize,
}

/// Global scheduler over all active releases
pub struct Scheduler {
    db: Database,
    providers: ProviderRegistry,
    config: SchedulerConfig,
}

impl Scheduler {
    pub fn new(db: Database, providers: ProviderRegistry, config: SchedulerConfig) -> Self {
        Self {
            db,
            providers,
            config,
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Run the tick loop until the shutdown signal flips.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            tick_interval_secs = self.config.tick_interval_secs,
            max_concurrency = self.config.max_concurrency,
            instance_id = %self.config.instance_id,
            "Starting release scheduler"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            let tick = self.run_tick();
            let grace = Duration::from_secs(
                self.config.tick_interval_secs + self.config.shutdown_grace_secs,
            );
            match timeout(grace, tick).await {
                Ok(Ok(stats)) => {
                    info!(
                        processed = stats.processed,
                        skipped_lease = stats.skipped_lease,
                        failed = stats.failed,
                        "Scheduler tick finished"
                    );
                }
                Ok(Err(e)) => {
                    // Database unreachable or similar: abort this tick,
                    // keep the scheduler alive
                    error!(error = %e, "Scheduler tick aborted");
                }
                Err(_) => {
                    warn!("Scheduler tick overran its grace period");
                }
            }

            tokio::select! {
                _ = sleep(Duration::from_secs(self.config.tick_interval_secs)) => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!(instance_id = %self.config.instance_id, "Scheduler stopped");
    }

    /// Process every eligible release once.
    pub async fn run_tick(&self) -> Result<TickStats> {
        let now = chrono::Utc::now();
        let candidates = self.db.list_running_candidates(now).await?;

        if candidates.is_empty() {
            debug!("No releases due for orchestration");
            return Ok(TickStats::default());
        }

        debug!(count = candidates.len(), "Found orchestration candidates");

        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrency));
        let mut handles = Vec::with_capacity(candidates.len());

        for cron in candidates {
            let Ok(permit) = semaphore.clone().acquire_owned().await else {
                break;
            };
            let db = self.db.clone();
            let providers = self.providers.clone();
            let instance_id = self.config.instance_id.clone();
            let execute_timeout = Duration::from_secs(self.config.execute_timeout_secs);

            handles.push(tokio::spawn(async move {
                let _permit = permit;
                process_release(db, providers, cron, instance_id, execute_timeout).await
            }));
        }

        let mut stats = TickStats::default();
        for handle in handles {
            match handle.await {
                Ok(ReleaseOutcome::Processed) => stats.processed += 1,
                Ok(ReleaseOutcome::SkippedLease) => stats.skipped_lease += 1,
                Ok(ReleaseOutcome::Failed) => stats.failed += 1,
                Err(e) => {
                    error!(error = %e, "Orchestrator worker panicked");
                    stats.failed += 1;
                }
            }
        }

        Ok(stats)
    }
}

enum ReleaseOutcome {
    Processed,
    SkippedLease,
    Failed,
}

/// Lease, orchestrate, unlease one release. Errors stay inside the worker.
async fn process_release(
    db: Database,
    providers: ProviderRegistry,
    cron: crate::cron_job::CronJob,
    instance_id: String,
    execute_timeout: Duration,
) -> ReleaseOutcome {
    let acquired = match db.acquire_lease(&cron.id, &instance_id).await {
        Ok(acquired) => acquired,
        Err(e) => {
            error!(release_id = %cron.release_id, error = %e, "Lease acquire failed");
            return ReleaseOutcome::Failed;
        }
    };
    if !acquired {
        debug!(
            release_id = %cron.release_id,
            "Lease contention, skipping until next tick"
        );
        return ReleaseOutcome::SkippedLease;
    }

    let executor = TaskExecutor::new(db.clone(), providers);
    let orchestrator = Orchestrator::new(db.clone(), executor, cron.release_id.clone());

    let outcome = match timeout(execute_timeout, orchestrator.execute()).await {
        Ok(Ok(())) => ReleaseOutcome::Processed,
        Ok(Err(e)) => {
            error!(release_id = %cron.release_id, error = %e, "Orchestrator failed");
            ReleaseOutcome::Failed
        }
        Err(_) => {
            // Abandon further mutation this tick; idempotency and the lease
            // TTL make the next tick safe
            warn!(
                release_id = %cron.release_id,
                "Orchestrator execute timed out"
            );
            ReleaseOutcome::Failed
        }
    };

    if let Err(e) = db.release_lease(&cron.id, &instance_id).await {
        error!(release_id = %cron.release_id, error = %e, "Lease release failed");
    }

    outcome
}

// ==================== Tick Source ====================

/// Pluggable trigger for scheduler ticks
#[async_trait]
pub trait TickSource: Send + Sync {
    /// Start delivering ticks until stopped. Blocks for the lifetime of the
    /// source.
    async fn start(&self, scheduler: Arc<Scheduler>);

    /// Ask the source to stop delivering ticks.
    fn stop(&self);
}

/// In-process interval timer, the default tick source
pub struct IntervalTickSource {
    shutdown_tx: watch::Sender<bool>,
}

impl IntervalTickSource {
    pub fn new() -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self { shutdown_tx }
    }
}

impl Default for IntervalTickSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TickSource for IntervalTickSource {
    async fn start(&self, scheduler: Arc<Scheduler>) {
        let shutdown_rx = self.shutdown_tx.subscribe();
        scheduler.run(shutdown_rx).await;
    }

    fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cron_job::{CronJob, CronStatus, StageStatus};
    use crate::providers::mock::mock_registry;
    use crate::release::{
        PlatformName, PlatformTargetMapping, Release, ReleaseStatus, ReleaseType, TargetName,
    };

    async fn seed_running_release(db: &Database) -> (Release, CronJob) {
        let mut release = Release::new(
            "tenant-1".to_string(),
            ReleaseType::Minor,
            "develop".to_string(),
            "config-1".to_string(),
            "acct-1".to_string(),
        );
        release.status = ReleaseStatus::InProgress;
        db.insert_release(&release).await.unwrap();

        let mapping = PlatformTargetMapping::new(
            release.id.clone(),
            PlatformName::Android,
            TargetName::PlayStore,
            "v1.0.0".to_string(),
        );
        db.insert_platform_mapping(&mapping).await.unwrap();

        let mut cron = CronJob::new(release.id.clone());
        cron.stage1_status = StageStatus::InProgress;
        cron.cron_status = CronStatus::Running;
        db.insert_cron_job(&cron).await.unwrap();
        (release, cron)
    }

    fn scheduler(db: &Database) -> Scheduler {
        let (registry, _state) = mock_registry();
        Scheduler::new(db.clone(), registry, SchedulerConfig::default())
    }

    #[tokio::test]
    async fn test_tick_processes_running_release() {
        let db = Database::in_memory().await.unwrap();
        let (release, _cron) = seed_running_release(&db).await;

        let stats = scheduler(&db).run_tick().await.unwrap();
        assert_eq!(stats.processed, 1);
        assert_eq!(stats.failed, 0);

        let cron = db.get_cron_job_by_release(&release.id).await.unwrap().unwrap();
        assert_eq!(cron.stage1_status, StageStatus::Completed);
        // Lease was released after the tick
        assert!(cron.locked_by.is_none());
    }

    #[tokio::test]
    async fn test_tick_with_no_candidates() {
        let db = Database::in_memory().await.unwrap();
        let stats = scheduler(&db).run_tick().await.unwrap();
        assert_eq!(stats, TickStats::default());
    }

    #[tokio::test]
    async fn test_tick_skips_leased_release() {
        let db = Database::in_memory().await.unwrap();
        let (_release, cron) = seed_running_release(&db).await;

        // Candidate listing already filters held leases; simulate a race
        // where the lease lands between listing and acquiring
        let candidates = db.list_running_candidates(chrono::Utc::now()).await.unwrap();
        assert_eq!(candidates.len(), 1);
        assert!(db.acquire_lease(&cron.id, "other-instance").await.unwrap());

        let stats = scheduler(&db).run_tick().await.unwrap();
        // Listing filters it out entirely
        assert_eq!(stats.processed, 0);
        assert_eq!(stats.failed, 0);
    }

    #[tokio::test]
    async fn test_one_release_error_does_not_stop_others() {
        let db = Database::in_memory().await.unwrap();

        // Corrupt release: two stages in progress
        let (_r1, mut c1) = seed_running_release(&db).await;
        c1.stage2_status = StageStatus::InProgress;
        db.update_cron_job(&c1).await.unwrap();

        // Healthy release
        let (r2, _c2) = seed_running_release(&db).await;

        let stats = scheduler(&db).run_tick().await.unwrap();
        assert_eq!(stats.processed, 1);
        assert_eq!(stats.failed, 1);

        let cron = db.get_cron_job_by_release(&r2.id).await.unwrap().unwrap();
        assert_eq!(cron.stage1_status, StageStatus::Completed);
    }

    #[tokio::test]
    async fn test_back_to_back_ticks_are_idempotent_when_quiescent() {
        let db = Database::in_memory().await.unwrap();
        let (release, _cron) = seed_running_release(&db).await;

        let scheduler = scheduler(&db);
        scheduler.run_tick().await.unwrap();
        let after_first = db
            .get_cron_job_by_release(&release.id)
            .await
            .unwrap()
            .unwrap();

        scheduler.run_tick().await.unwrap();
        scheduler.run_tick().await.unwrap();
        scheduler.run_tick().await.unwrap();
        let after_more = db
            .get_cron_job_by_release(&release.id)
            .await
            .unwrap()
            .unwrap();

        // Stage progression continues deterministically to completion and
        // then stays put
        assert_eq!(after_first.stage1_status, StageStatus::Completed);
        assert_eq!(after_more.stage3_status, StageStatus::Completed);
        assert_eq!(after_more.cron_status, CronStatus::Completed);

        let settled = db
            .get_cron_job_by_release(&release.id)
            .await
            .unwrap()
            .unwrap();
        scheduler.run_tick().await.unwrap();
        let resettled = db
            .get_cron_job_by_release(&release.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(settled.version, resettled.version);
    }

    #[tokio::test]
    async fn test_interval_tick_source_stops() {
        let db = Database::in_memory().await.unwrap();
        let (registry, _state) = mock_registry();
        let config = SchedulerConfig {
            tick_interval_secs: 3600,
            ..Default::default()
        };
        let scheduler = Arc::new(Scheduler::new(db, registry, config));
        let source = Arc::new(IntervalTickSource::new());

        let handle = {
            let source = source.clone();
            let scheduler = scheduler.clone();
            tokio::spawn(async move { source.start(scheduler).await })
        };

        // Stop immediately; run() observes the flag before sleeping a full
        // interval
        source.stop();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("tick source did not stop")
            .unwrap();
    }
}
