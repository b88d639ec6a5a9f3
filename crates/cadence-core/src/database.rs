//! Database layer for SQLite
//!
//! One `Database` value carries every repository operation the core consumes.
//! It is constructed once at process start and passed down; nothing looks it
//! up ambiently.

use chrono::{DateTime, Duration, Utc};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use std::path::Path;

use crate::cron_job::{CronConfig, CronJob, CronStatus, PauseType, RegressionSlot, StageStatus};
use crate::regression::{CycleStatus, RegressionCycle};
use crate::release::{
    PlatformName, PlatformTargetMapping, Release, ReleaseStatus, ReleaseType, TargetName,
};
use crate::state_history::{HistoryAction, StateHistory, StateHistoryItem};
use crate::task::{ReleaseTask, TaskStage, TaskStatus, TaskType};
use crate::uploads::{Build, ReleaseUpload};
use crate::{Error, Result};

/// Database configuration
pub struct DatabaseConfig {
    /// Maximum number of connections
    pub max_connections: u32,
    /// Connection acquire timeout
    pub acquire_timeout: std::time::Duration,
    /// Idle connection timeout
    pub idle_timeout: std::time::Duration,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            max_connections: 5,
            acquire_timeout: std::time::Duration::from_secs(30),
            idle_timeout: std::time::Duration::from_secs(600),
        }
    }
}

/// Database connection and operations
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Create a new database connection with default config
    pub async fn new(path: impl AsRef<Path>) -> Result<Self> {
        Self::with_config(path, DatabaseConfig::default()).await
    }

    /// Create a new database connection with custom config
    pub async fn with_config(path: impl AsRef<Path>, config: DatabaseConfig) -> Result<Self> {
        let path = path.as_ref();

        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        // Use WAL mode for better concurrent access
        let url = format!("sqlite:{}?mode=rwc", path.display());
        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.acquire_timeout)
            .idle_timeout(config.idle_timeout)
            .connect(&url)
            .await?;

        sqlx::query("PRAGMA journal_mode=WAL")
            .execute(&pool)
            .await?;
        sqlx::query("PRAGMA foreign_keys=ON").execute(&pool).await?;
        sqlx::query("PRAGMA busy_timeout=5000")
            .execute(&pool)
            .await?;

        let db = Self { pool };
        db.run_migrations().await?;
        Ok(db)
    }

    /// Create an in-memory database (for testing)
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;

        sqlx::query("PRAGMA foreign_keys=ON").execute(&pool).await?;

        let db = Self { pool };
        db.run_migrations().await?;
        Ok(db)
    }

    /// Run database migrations
    async fn run_migrations(&self) -> Result<()> {
        sqlx::query(include_str!("../../../migrations/001_releases.sql"))
            .execute(&self.pool)
            .await?;
        sqlx::query(include_str!("../../../migrations/002_cron_jobs.sql"))
            .execute(&self.pool)
            .await?;
        sqlx::query(include_str!("../../../migrations/003_tasks_cycles.sql"))
            .execute(&self.pool)
            .await?;
        sqlx::query(include_str!("../../../migrations/004_uploads_builds.sql"))
            .execute(&self.pool)
            .await?;
        sqlx::query(include_str!("../../../migrations/005_state_history.sql"))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ==================== Release Operations ====================

    /// Insert a new release
    pub async fn insert_release(&self, release: &Release) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO releases (
                id, tenant_id, release_type, status, branch, base_branch,
                release_config_id, target_release_date, kick_off_date,
                kick_off_reminder_date, has_manual_build_upload,
                created_by_account_id, release_pilot_account_id,
                last_updated_by_account_id, created_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&release.id)
        .bind(&release.tenant_id)
        .bind(release.release_type.as_str())
        .bind(release.status.as_str())
        .bind(&release.branch)
        .bind(&release.base_branch)
        .bind(&release.release_config_id)
        .bind(release.target_release_date.map(|dt| dt.to_rfc3339()))
        .bind(release.kick_off_date.map(|dt| dt.to_rfc3339()))
        .bind(release.kick_off_reminder_date.map(|dt| dt.to_rfc3339()))
        .bind(release.has_manual_build_upload)
        .bind(&release.created_by_account_id)
        .bind(&release.release_pilot_account_id)
        .bind(&release.last_updated_by_account_id)
        .bind(release.created_at.to_rfc3339())
        .bind(release.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Get a release by ID
    pub async fn get_release(&self, id: &str) -> Result<Option<Release>> {
        let row = sqlx::query_as::<_, ReleaseRow>("SELECT * FROM releases WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(TryInto::try_into).transpose()
    }

    /// Update a release
    pub async fn update_release(&self, release: &Release) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE releases
            SET status = ?, branch = ?, target_release_date = ?, kick_off_date = ?,
                kick_off_reminder_date = ?, has_manual_build_upload = ?,
                release_pilot_account_id = ?, last_updated_by_account_id = ?,
                updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(release.status.as_str())
        .bind(&release.branch)
        .bind(release.target_release_date.map(|dt| dt.to_rfc3339()))
        .bind(release.kick_off_date.map(|dt| dt.to_rfc3339()))
        .bind(release.kick_off_reminder_date.map(|dt| dt.to_rfc3339()))
        .bind(release.has_manual_build_upload)
        .bind(&release.release_pilot_account_id)
        .bind(&release.last_updated_by_account_id)
        .bind(Utc::now().to_rfc3339())
        .bind(&release.id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ==================== Platform Mapping Operations ====================

    /// Insert a platform/target mapping
    pub async fn insert_platform_mapping(&self, mapping: &PlatformTargetMapping) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO release_platforms_targets_mapping (
                id, release_id, platform, target, version,
                project_management_run_id, test_management_run_id,
                created_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&mapping.id)
        .bind(&mapping.release_id)
        .bind(mapping.platform.as_str())
        .bind(mapping.target.as_str())
        .bind(&mapping.version)
        .bind(&mapping.project_management_run_id)
        .bind(&mapping.test_management_run_id)
        .bind(mapping.created_at.to_rfc3339())
        .bind(mapping.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// List the mappings of a release
    pub async fn list_platform_mappings(
        &self,
        release_id: &str,
    ) -> Result<Vec<PlatformTargetMapping>> {
        let rows = sqlx::query_as::<_, PlatformMappingRow>(
            "SELECT * FROM release_platforms_targets_mapping WHERE release_id = ? ORDER BY created_at ASC",
        )
        .bind(release_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    /// Update a mapping (run ids populated by tasks)
    pub async fn update_platform_mapping(&self, mapping: &PlatformTargetMapping) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE release_platforms_targets_mapping
            SET version = ?, project_management_run_id = ?, test_management_run_id = ?,
                updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(&mapping.version)
        .bind(&mapping.project_management_run_id)
        .bind(&mapping.test_management_run_id)
        .bind(Utc::now().to_rfc3339())
        .bind(&mapping.id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ==================== Cron Job Operations ====================

    /// Insert a cron job
    pub async fn insert_cron_job(&self, cron: &CronJob) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO cron_jobs (
                id, release_id, stage1_status, stage2_status, stage3_status,
                cron_status, pause_type, auto_transition_to_stage2,
                auto_transition_to_stage3, cron_config, upcoming_regressions,
                locked_by, locked_at, lock_timeout_sec, version,
                created_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&cron.id)
        .bind(&cron.release_id)
        .bind(cron.stage1_status.as_str())
        .bind(cron.stage2_status.as_str())
        .bind(cron.stage3_status.as_str())
        .bind(cron.cron_status.as_str())
        .bind(cron.pause_type.as_str())
        .bind(cron.auto_transition_to_stage2)
        .bind(cron.auto_transition_to_stage3)
        .bind(serde_json::to_string(&cron.cron_config)?)
        .bind(serde_json::to_string(&cron.upcoming_regressions)?)
        .bind(&cron.locked_by)
        .bind(cron.locked_at.map(|dt| dt.to_rfc3339()))
        .bind(cron.lock_timeout_sec)
        .bind(cron.version)
        .bind(cron.created_at.to_rfc3339())
        .bind(cron.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Get a cron job by ID
    pub async fn get_cron_job(&self, id: &str) -> Result<Option<CronJob>> {
        let row = sqlx::query_as::<_, CronJobRow>("SELECT * FROM cron_jobs WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(TryInto::try_into).transpose()
    }

    /// Get the cron job of a release
    pub async fn get_cron_job_by_release(&self, release_id: &str) -> Result<Option<CronJob>> {
        let row = sqlx::query_as::<_, CronJobRow>("SELECT * FROM cron_jobs WHERE release_id = ?")
            .bind(release_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(TryInto::try_into).transpose()
    }

    /// Update a cron job's orchestration state.
    ///
    /// Lease columns are owned by the lease operations and are never touched
    /// here. Every update bumps the row version.
    pub async fn update_cron_job(&self, cron: &CronJob) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE cron_jobs
            SET stage1_status = ?, stage2_status = ?, stage3_status = ?,
                cron_status = ?, pause_type = ?, auto_transition_to_stage2 = ?,
                auto_transition_to_stage3 = ?, cron_config = ?,
                upcoming_regressions = ?, lock_timeout_sec = ?,
                version = version + 1, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(cron.stage1_status.as_str())
        .bind(cron.stage2_status.as_str())
        .bind(cron.stage3_status.as_str())
        .bind(cron.cron_status.as_str())
        .bind(cron.pause_type.as_str())
        .bind(cron.auto_transition_to_stage2)
        .bind(cron.auto_transition_to_stage3)
        .bind(serde_json::to_string(&cron.cron_config)?)
        .bind(serde_json::to_string(&cron.upcoming_regressions)?)
        .bind(cron.lock_timeout_sec)
        .bind(Utc::now().to_rfc3339())
        .bind(&cron.id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Cron jobs eligible for an orchestrator tick at `now`: running (or
    /// paused awaiting a stage trigger, which Regression may resume on slot
    /// time), release non-terminal, lease free or expired.
    pub async fn list_running_candidates(&self, now: DateTime<Utc>) -> Result<Vec<CronJob>> {
        let rows = sqlx::query_as::<_, CronJobRow>(
            r#"
            SELECT cj.* FROM cron_jobs cj
            JOIN releases r ON r.id = cj.release_id
            WHERE r.status NOT IN ('ARCHIVED', 'COMPLETED')
            AND (
                cj.cron_status = 'RUNNING'
                OR (cj.cron_status = 'PAUSED' AND cj.pause_type = 'AWAITING_STAGE_TRIGGER')
            )
            ORDER BY cj.created_at ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let jobs: Vec<CronJob> = rows
            .into_iter()
            .map(TryInto::try_into)
            .collect::<Result<_>>()?;
        Ok(jobs
            .into_iter()
            .filter(|job| job.lease_available(now))
            .collect())
    }

    // ==================== Lease Operations ====================

    /// Try to acquire the advisory lease on a cron job.
    ///
    /// Succeeds only when the lease is free or has outlived its TTL; the
    /// update is compare-and-set on the observed lease value so two racing
    /// instances cannot both win. Returns false on contention.
    #[tracing::instrument(skip(self), level = "debug")]
    pub async fn acquire_lease(&self, cron_id: &str, owner: &str) -> Result<bool> {
        let now = Utc::now();

        let observed = sqlx::query_as::<_, LeaseRow>(
            "SELECT locked_by, locked_at, lock_timeout_sec FROM cron_jobs WHERE id = ?",
        )
        .bind(cron_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(observed) = observed else {
            return Ok(false);
        };

        let locked_at = observed
            .locked_at
            .as_deref()
            .map(parse_datetime)
            .transpose()?;
        let expired = match locked_at {
            None => true,
            Some(at) => now - at > Duration::seconds(observed.lock_timeout_sec),
        };
        if observed.locked_by.is_some() && !expired {
            return Ok(false);
        }

        let result = sqlx::query(
            r#"
            UPDATE cron_jobs
            SET locked_by = ?, locked_at = ?, version = version + 1, updated_at = ?
            WHERE id = ? AND locked_by IS ? AND locked_at IS ?
            "#,
        )
        .bind(owner)
        .bind(now.to_rfc3339())
        .bind(now.to_rfc3339())
        .bind(cron_id)
        .bind(&observed.locked_by)
        .bind(&observed.locked_at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Extend a held lease. Returns false when ownership was lost, in which
    /// case the caller must abandon further mutation.
    #[tracing::instrument(skip(self), level = "debug")]
    pub async fn renew_lease(&self, cron_id: &str, owner: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE cron_jobs SET locked_at = ? WHERE id = ? AND locked_by = ?",
        )
        .bind(Utc::now().to_rfc3339())
        .bind(cron_id)
        .bind(owner)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Release a held lease. A lease held by someone else is left alone.
    #[tracing::instrument(skip(self), level = "debug")]
    pub async fn release_lease(&self, cron_id: &str, owner: &str) -> Result<()> {
        sqlx::query(
            "UPDATE cron_jobs SET locked_by = NULL, locked_at = NULL WHERE id = ? AND locked_by = ?",
        )
        .bind(cron_id)
        .bind(owner)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ==================== Release Task Operations ====================

    /// Bulk-insert tasks inside one transaction
    pub async fn insert_tasks(&self, tasks: &[ReleaseTask]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for task in tasks {
            sqlx::query(
                r#"
                INSERT INTO release_tasks (
                    id, release_id, regression_id, task_type, stage,
                    task_status, external_id, external_data, created_at, updated_at
                )
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&task.id)
            .bind(&task.release_id)
            .bind(&task.regression_id)
            .bind(task.task_type.as_str())
            .bind(task.stage.as_str())
            .bind(task.task_status.as_str())
            .bind(&task.external_id)
            .bind(
                task.external_data
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?,
            )
            .bind(task.created_at.to_rfc3339())
            .bind(task.updated_at.to_rfc3339())
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Get a task by ID
    pub async fn get_task(&self, id: &str) -> Result<Option<ReleaseTask>> {
        let row = sqlx::query_as::<_, ReleaseTaskRow>("SELECT * FROM release_tasks WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(TryInto::try_into).transpose()
    }

    /// List the stage-level tasks of a release (tasks not bound to a cycle)
    pub async fn list_stage_tasks(
        &self,
        release_id: &str,
        stage: TaskStage,
    ) -> Result<Vec<ReleaseTask>> {
        let rows = sqlx::query_as::<_, ReleaseTaskRow>(
            r#"
            SELECT * FROM release_tasks
            WHERE release_id = ? AND stage = ? AND regression_id IS NULL
            ORDER BY created_at ASC
            "#,
        )
        .bind(release_id)
        .bind(stage.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    /// List the tasks of one regression cycle
    pub async fn list_cycle_tasks(&self, regression_id: &str) -> Result<Vec<ReleaseTask>> {
        let rows = sqlx::query_as::<_, ReleaseTaskRow>(
            "SELECT * FROM release_tasks WHERE regression_id = ? ORDER BY created_at ASC",
        )
        .bind(regression_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    /// List tasks of one type across all releases (used by workflow polling)
    pub async fn list_tasks_by_type_and_status(
        &self,
        task_type: TaskType,
        status: TaskStatus,
    ) -> Result<Vec<ReleaseTask>> {
        let rows = sqlx::query_as::<_, ReleaseTaskRow>(
            "SELECT * FROM release_tasks WHERE task_type = ? AND task_status = ? ORDER BY created_at ASC",
        )
        .bind(task_type.as_str())
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    /// Update a task
    pub async fn update_task(&self, task: &ReleaseTask) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE release_tasks
            SET task_status = ?, external_id = ?, external_data = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(task.task_status.as_str())
        .bind(&task.external_id)
        .bind(
            task.external_data
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?,
        )
        .bind(Utc::now().to_rfc3339())
        .bind(&task.id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ==================== Regression Cycle Operations ====================

    /// Insert a new cycle, demoting the previous latest in the same
    /// transaction. The demoted cycle is marked done.
    pub async fn insert_cycle(&self, cycle: &RegressionCycle) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            UPDATE regression_cycles
            SET is_latest = 0, status = 'DONE', updated_at = ?
            WHERE release_id = ? AND is_latest = 1
            "#,
        )
        .bind(Utc::now().to_rfc3339())
        .bind(&cycle.release_id)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO regression_cycles (
                id, release_id, cycle_tag, status, is_latest, created_at, updated_at
            )
            VALUES (?, ?, ?, ?, 1, ?, ?)
            "#,
        )
        .bind(&cycle.id)
        .bind(&cycle.release_id)
        .bind(&cycle.cycle_tag)
        .bind(cycle.status.as_str())
        .bind(cycle.created_at.to_rfc3339())
        .bind(cycle.updated_at.to_rfc3339())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Latest cycle of a release, if any
    pub async fn latest_cycle(&self, release_id: &str) -> Result<Option<RegressionCycle>> {
        let row = sqlx::query_as::<_, RegressionCycleRow>(
            "SELECT * FROM regression_cycles WHERE release_id = ? AND is_latest = 1",
        )
        .bind(release_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(TryInto::try_into).transpose()
    }

    /// All cycles of a release, oldest first
    pub async fn list_cycles(&self, release_id: &str) -> Result<Vec<RegressionCycle>> {
        let rows = sqlx::query_as::<_, RegressionCycleRow>(
            "SELECT * FROM regression_cycles WHERE release_id = ? ORDER BY created_at ASC",
        )
        .bind(release_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    /// Update a cycle
    pub async fn update_cycle(&self, cycle: &RegressionCycle) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE regression_cycles
            SET status = ?, is_latest = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(cycle.status.as_str())
        .bind(cycle.is_latest)
        .bind(Utc::now().to_rfc3339())
        .bind(&cycle.id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Number of cycles a release has had
    pub async fn cycle_count(&self, release_id: &str) -> Result<i64> {
        let count: (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM regression_cycles WHERE release_id = ?")
                .bind(release_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(count.0)
    }

    /// Number of cycles already tagged for a version, which is the next rc
    /// ordinal
    pub async fn tag_count(&self, release_id: &str, version: &str) -> Result<i64> {
        let prefix = format!("v{}_rc_%", version.trim_start_matches('v'));
        let count: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM regression_cycles WHERE release_id = ? AND cycle_tag LIKE ?",
        )
        .bind(release_id)
        .bind(prefix)
        .fetch_one(&self.pool)
        .await?;
        Ok(count.0)
    }

    // ==================== Upload Operations ====================

    /// Insert or replace the upload for a `(release, stage, platform)`
    pub async fn upsert_upload(&self, upload: &ReleaseUpload) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO release_uploads (
                id, release_id, stage, platform, artifact_path, download_url, uploaded_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(release_id, stage, platform) DO UPDATE
            SET artifact_path = excluded.artifact_path,
                download_url = excluded.download_url,
                uploaded_at = excluded.uploaded_at
            "#,
        )
        .bind(&upload.id)
        .bind(&upload.release_id)
        .bind(upload.stage.as_str())
        .bind(upload.platform.as_str())
        .bind(&upload.artifact_path)
        .bind(&upload.download_url)
        .bind(upload.uploaded_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// List the uploads of a release stage
    pub async fn list_uploads(
        &self,
        release_id: &str,
        stage: TaskStage,
    ) -> Result<Vec<ReleaseUpload>> {
        let rows = sqlx::query_as::<_, ReleaseUploadRow>(
            "SELECT * FROM release_uploads WHERE release_id = ? AND stage = ? ORDER BY uploaded_at ASC",
        )
        .bind(release_id)
        .bind(stage.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    // ==================== Build Operations ====================

    /// Insert a triggered build record
    pub async fn insert_build(&self, build: &Build) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO builds (
                id, release_id, regression_id, platform, build_number,
                workflow_run_id, created_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&build.id)
        .bind(&build.release_id)
        .bind(&build.regression_id)
        .bind(build.platform.as_str())
        .bind(&build.build_number)
        .bind(&build.workflow_run_id)
        .bind(build.created_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// List the builds of a release
    pub async fn list_builds(&self, release_id: &str) -> Result<Vec<Build>> {
        let rows = sqlx::query_as::<_, BuildRow>(
            "SELECT * FROM builds WHERE release_id = ? ORDER BY created_at ASC",
        )
        .bind(release_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    // ==================== State History Operations ====================

    /// Append an audit entry with its items in one transaction
    pub async fn insert_state_history(&self, entry: &StateHistory) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO state_history (id, release_id, account_id, action, created_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&entry.id)
        .bind(&entry.release_id)
        .bind(&entry.account_id)
        .bind(entry.action.as_str())
        .bind(entry.created_at.to_rfc3339())
        .execute(&mut *tx)
        .await?;

        for item in &entry.items {
            sqlx::query(
                r#"
                INSERT INTO state_history_items (id, state_history_id, item_key, item_value)
                VALUES (?, ?, ?, ?)
                "#,
            )
            .bind(&item.id)
            .bind(&entry.id)
            .bind(&item.item_key)
            .bind(&item.item_value)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// List the audit entries of a release, oldest first
    pub async fn list_state_history(&self, release_id: &str) -> Result<Vec<StateHistory>> {
        let rows = sqlx::query_as::<_, StateHistoryRow>(
            "SELECT * FROM state_history WHERE release_id = ? ORDER BY created_at ASC",
        )
        .bind(release_id)
        .fetch_all(&self.pool)
        .await?;

        let mut entries = Vec::with_capacity(rows.len());
        for row in rows {
            let items = sqlx::query_as::<_, StateHistoryItemRow>(
                "SELECT * FROM state_history_items WHERE state_history_id = ?",
            )
            .bind(&row.id)
            .fetch_all(&self.pool)
            .await?;
            let mut entry: StateHistory = row.try_into()?;
            entry.items = items.into_iter().map(Into::into).collect();
            entries.push(entry);
        }
        Ok(entries)
    }
}

// ==================== Row Types ====================

fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(Into::into)
        .map_err(|e| Error::Other(format!("Invalid timestamp '{}': {}", s, e)))
}

fn parse_opt_datetime(s: Option<String>) -> Result<Option<DateTime<Utc>>> {
    s.as_deref().map(parse_datetime).transpose()
}

#[derive(sqlx::FromRow)]
struct ReleaseRow {
    id: String,
    tenant_id: String,
    release_type: String,
    status: String,
    branch: Option<String>,
    base_branch: String,
    release_config_id: String,
    target_release_date: Option<String>,
    kick_off_date: Option<String>,
    kick_off_reminder_date: Option<String>,
    has_manual_build_upload: bool,
    created_by_account_id: String,
    release_pilot_account_id: Option<String>,
    last_updated_by_account_id: Option<String>,
    created_at: String,
    updated_at: String,
}

impl TryFrom<ReleaseRow> for Release {
    type Error = Error;

    fn try_from(row: ReleaseRow) -> Result<Self> {
        Ok(Release {
            id: row.id,
            tenant_id: row.tenant_id,
            release_type: row.release_type.parse::<ReleaseType>()?,
            status: row.status.parse::<ReleaseStatus>()?,
            branch: row.branch,
            base_branch: row.base_branch,
            release_config_id: row.release_config_id,
            target_release_date: parse_opt_datetime(row.target_release_date)?,
            kick_off_date: parse_opt_datetime(row.kick_off_date)?,
            kick_off_reminder_date: parse_opt_datetime(row.kick_off_reminder_date)?,
            has_manual_build_upload: row.has_manual_build_upload,
            created_by_account_id: row.created_by_account_id,
            release_pilot_account_id: row.release_pilot_account_id,
            last_updated_by_account_id: row.last_updated_by_account_id,
            created_at: parse_datetime(&row.created_at)?,
            updated_at: parse_datetime(&row.updated_at)?,
        })
    }
}

#[derive(sqlx::FromRow)]
struct PlatformMappingRow {
    id: String,
    release_id: String,
    platform: String,
    target: String,
    version: String,
    project_management_run_id: Option<String>,
    test_management_run_id: Option<String>,
    created_at: String,
    updated_at: String,
}

impl TryFrom<PlatformMappingRow> for PlatformTargetMapping {
    type Error = Error;

    fn try_from(row: PlatformMappingRow) -> Result<Self> {
        Ok(PlatformTargetMapping {
            id: row.id,
            release_id: row.release_id,
            platform: row.platform.parse::<PlatformName>()?,
            target: row.target.parse::<TargetName>()?,
            version: row.version,
            project_management_run_id: row.project_management_run_id,
            test_management_run_id: row.test_management_run_id,
            created_at: parse_datetime(&row.created_at)?,
            updated_at: parse_datetime(&row.updated_at)?,
        })
    }
}

#[derive(sqlx::FromRow)]
struct CronJobRow {
    id: String,
    release_id: String,
    stage1_status: String,
    stage2_status: String,
    stage3_status: String,
    cron_status: String,
    pause_type: String,
    auto_transition_to_stage2: bool,
    auto_transition_to_stage3: bool,
    cron_config: String,
    upcoming_regressions: String,
    locked_by: Option<String>,
    locked_at: Option<String>,
    lock_timeout_sec: i64,
    version: i64,
    created_at: String,
    updated_at: String,
}

impl TryFrom<CronJobRow> for CronJob {
    type Error = Error;

    fn try_from(row: CronJobRow) -> Result<Self> {
        let cron_config: CronConfig = serde_json::from_str(&row.cron_config)?;
        let upcoming_regressions: Vec<RegressionSlot> =
            serde_json::from_str(&row.upcoming_regressions)?;
        Ok(CronJob {
            id: row.id,
            release_id: row.release_id,
            stage1_status: row.stage1_status.parse::<StageStatus>()?,
            stage2_status: row.stage2_status.parse::<StageStatus>()?,
            stage3_status: row.stage3_status.parse::<StageStatus>()?,
            cron_status: row.cron_status.parse::<CronStatus>()?,
            pause_type: row.pause_type.parse::<PauseType>()?,
            auto_transition_to_stage2: row.auto_transition_to_stage2,
            auto_transition_to_stage3: row.auto_transition_to_stage3,
            cron_config,
            upcoming_regressions,
            locked_by: row.locked_by,
            locked_at: parse_opt_datetime(row.locked_at)?,
            lock_timeout_sec: row.lock_timeout_sec,
            version: row.version,
            created_at: parse_datetime(&row.created_at)?,
            updated_at: parse_datetime(&row.updated_at)?,
        })
    }
}

#[derive(sqlx::FromRow)]
struct LeaseRow {
    locked_by: Option<String>,
    locked_at: Option<String>,
    lock_timeout_sec: i64,
}

#[derive(sqlx::FromRow)]
struct ReleaseTaskRow {
    id: String,
    release_id: String,
    regression_id: Option<String>,
    task_type: String,
    stage: String,
    task_status: String,
    external_id: Option<String>,
    external_data: Option<String>,
    created_at: String,
    updated_at: String,
}

impl TryFrom<ReleaseTaskRow> for ReleaseTask {
    type Error = Error;

    fn try_from(row: ReleaseTaskRow) -> Result<Self> {
        Ok(ReleaseTask {
            id: row.id,
            release_id: row.release_id,
            regression_id: row.regression_id,
            task_type: row.task_type.parse::<TaskType>()?,
            stage: row.stage.parse::<TaskStage>()?,
            task_status: row.task_status.parse::<TaskStatus>()?,
            external_id: row.external_id,
            external_data: row
                .external_data
                .as_deref()
                .map(serde_json::from_str)
                .transpose()?,
            created_at: parse_datetime(&row.created_at)?,
            updated_at: parse_datetime(&row.updated_at)?,
        })
    }
}

#[derive(sqlx::FromRow)]
struct RegressionCycleRow {
    id: String,
    release_id: String,
    cycle_tag: String,
    status: String,
    is_latest: bool,
    created_at: String,
    updated_at: String,
}

impl TryFrom<RegressionCycleRow> for RegressionCycle {
    type Error = Error;

    fn try_from(row: RegressionCycleRow) -> Result<Self> {
        Ok(RegressionCycle {
            id: row.id,
            release_id: row.release_id,
            cycle_tag: row.cycle_tag,
            status: row.status.parse::<CycleStatus>()?,
            is_latest: row.is_latest,
            created_at: parse_datetime(&row.created_at)?,
            updated_at: parse_datetime(&row.updated_at)?,
        })
    }
}

#[derive(sqlx::FromRow)]
struct ReleaseUploadRow {
    id: String,
    release_id: String,
    stage: String,
    platform: String,
    artifact_path: String,
    download_url: Option<String>,
    uploaded_at: String,
}

impl TryFrom<ReleaseUploadRow> for ReleaseUpload {
    type Error = Error;

    fn try_from(row: ReleaseUploadRow) -> Result<Self> {
        Ok(ReleaseUpload {
            id: row.id,
            release_id: row.release_id,
            stage: row.stage.parse::<TaskStage>()?,
            platform: row.platform.parse::<PlatformName>()?,
            artifact_path: row.artifact_path,
            download_url: row.download_url,
            uploaded_at: parse_datetime(&row.uploaded_at)?,
        })
    }
}

#[derive(sqlx::FromRow)]
struct BuildRow {
    id: String,
    release_id: String,
    regression_id: Option<String>,
    platform: String,
    build_number: String,
    workflow_run_id: Option<String>,
    created_at: String,
}

impl TryFrom<BuildRow> for Build {
    type Error = Error;

    fn try_from(row: BuildRow) -> Result<Self> {
        Ok(Build {
            id: row.id,
            release_id: row.release_id,
            regression_id: row.regression_id,
            platform: row.platform.parse::<PlatformName>()?,
            build_number: row.build_number,
            workflow_run_id: row.workflow_run_id,
            created_at: parse_datetime(&row.created_at)?,
        })
    }
}

#[derive(sqlx::FromRow)]
struct StateHistoryRow {
    id: String,
    release_id: String,
    account_id: String,
    action: String,
    created_at: String,
}

impl TryFrom<StateHistoryRow> for StateHistory {
    type Error = Error;

    fn try_from(row: StateHistoryRow) -> Result<Self> {
        Ok(StateHistory {
            id: row.id,
            release_id: row.release_id,
            account_id: row.account_id,
            action: row.action.parse::<HistoryAction>()?,
            items: Vec::new(),
            created_at: parse_datetime(&row.created_at)?,
        })
    }
}

#[derive(sqlx::FromRow)]
struct StateHistoryItemRow {
    id: String,
    item_key: String,
    item_value: String,
}

impl From<StateHistoryItemRow> for StateHistoryItem {
    fn from(row: StateHistoryItemRow) -> Self {
        StateHistoryItem {
            id: row.id,
            item_key: row.item_key,
            item_value: row.item_value,
        }
    }
}
