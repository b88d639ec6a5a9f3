//! Release service operations
//!
//! The mutations the external HTTP layer invokes on behalf of users. Each is
//! validated against the persisted state, atomic with respect to a single
//! cron row, and audited into the state history. The service never calls
//! providers inline; the next scheduler tick picks up whatever it arms.

use std::path::PathBuf;
use tracing::info;

use crate::cron_job::{CronStatus, PauseType, StageStatus};
use crate::database::Database;
use crate::release::{PlatformName, ReleaseStatus};
use crate::state_history::{HistoryAction, StateHistory};
use crate::task::{TaskStage, TaskStatus};
use crate::uploads::{validate_build_extension, ReleaseUpload, UploadSummary};
use crate::{Error, Result};

/// Result of pausing a release
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PauseOutcome {
    pub already_paused: bool,
}

/// User-facing mutations over releases and their orchestration state
#[derive(Clone)]
pub struct ReleaseService {
    db: Database,
    uploads_dir: PathBuf,
}

impl ReleaseService {
    pub fn new(db: Database, uploads_dir: impl Into<PathBuf>) -> Self {
        Self {
            db,
            uploads_dir: uploads_dir.into(),
        }
    }

    /// Start orchestration for a release.
    pub async fn start(&self, release_id: &str, account_id: &str) -> Result<()> {
        let mut release = self.require_release(release_id).await?;
        if release.is_terminal() {
            return Err(Error::Conflict(format!(
                "Release {} is {} and cannot be started",
                release_id,
                release.status.as_str()
            )));
        }

        let mut cron = self.require_cron(release_id).await?;
        if cron.cron_status == CronStatus::Running {
            return Err(Error::Conflict(format!(
                "Release {} is already running",
                release_id
            )));
        }
        if cron.stage1_status != StageStatus::Pending {
            return Err(Error::Conflict(format!(
                "Release {} was already started",
                release_id
            )));
        }

        cron.stage1_status = StageStatus::InProgress;
        cron.cron_status = CronStatus::Running;
        cron.pause_type = PauseType::None;
        self.db.update_cron_job(&cron).await?;

        release.status = ReleaseStatus::InProgress;
        release.last_updated_by_account_id = Some(account_id.to_string());
        self.db.update_release(&release).await?;

        self.audit(
            StateHistory::new(
                release_id.to_string(),
                account_id.to_string(),
                HistoryAction::ReleaseStarted,
            )
            .with_item("cronStatus", CronStatus::Running.as_str()),
        )
        .await?;

        info!(release_id = %release_id, "Release started");
        Ok(())
    }

    /// Pause a running release. Idempotent: pausing an already-paused
    /// release succeeds and reports it.
    pub async fn pause(
        &self,
        release_id: &str,
        tenant_id: &str,
        account_id: &str,
    ) -> Result<PauseOutcome> {
        let release = self.require_tenant_release(release_id, tenant_id).await?;
        if release.status != ReleaseStatus::InProgress {
            return Err(Error::Validation(format!(
                "Release {} is not in progress",
                release_id
            )));
        }

        let mut cron = self.require_cron(release_id).await?;
        if cron.pause_type == PauseType::UserRequested {
            return Ok(PauseOutcome {
                already_paused: true,
            });
        }

        cron.pause_type = PauseType::UserRequested;
        cron.cron_status = CronStatus::Paused;
        self.db.update_cron_job(&cron).await?;

        self.audit(
            StateHistory::new(
                release_id.to_string(),
                account_id.to_string(),
                HistoryAction::ReleasePaused,
            )
            .with_item("pauseType", PauseType::UserRequested.as_str()),
        )
        .await?;

        info!(release_id = %release_id, "Release paused");
        Ok(PauseOutcome {
            already_paused: false,
        })
    }

    /// Resume a user-paused release. Other pause kinds need their own remedy
    /// (task retry, stage trigger).
    pub async fn resume(
        &self,
        release_id: &str,
        tenant_id: &str,
        account_id: &str,
    ) -> Result<()> {
        self.require_tenant_release(release_id, tenant_id).await?;
        let mut cron = self.require_cron(release_id).await?;

        match cron.pause_type {
            PauseType::UserRequested => {}
            other => {
                return Err(Error::Validation(format!(
                    "Release {} cannot be resumed from pause type {}",
                    release_id,
                    other.as_str()
                )));
            }
        }

        cron.pause_type = PauseType::None;
        cron.cron_status = CronStatus::Running;
        self.db.update_cron_job(&cron).await?;

        self.audit(
            StateHistory::new(
                release_id.to_string(),
                account_id.to_string(),
                HistoryAction::ReleaseResumed,
            )
            .with_item("cronStatus", CronStatus::Running.as_str()),
        )
        .await?;

        info!(release_id = %release_id, "Release resumed");
        Ok(())
    }

    /// Manually start Stage 2 after kickoff completed without auto
    /// transition.
    pub async fn trigger_stage2(&self, release_id: &str, account_id: &str) -> Result<()> {
        let mut cron = self.require_cron(release_id).await?;

        if cron.stage1_status != StageStatus::Completed {
            return Err(Error::Conflict(format!(
                "Stage 1 is {} for release {}, stage 2 cannot start",
                cron.stage1_status.as_str(),
                release_id
            )));
        }
        if cron.stage2_status != StageStatus::Pending {
            return Err(Error::Conflict(format!(
                "Stage 2 is already {} for release {}",
                cron.stage2_status.as_str(),
                release_id
            )));
        }

        cron.auto_transition_to_stage2 = true;
        cron.stage2_status = StageStatus::InProgress;
        cron.cron_status = CronStatus::Running;
        cron.pause_type = PauseType::None;
        self.db.update_cron_job(&cron).await?;

        self.audit(
            StateHistory::new(
                release_id.to_string(),
                account_id.to_string(),
                HistoryAction::StageTriggered,
            )
            .with_item("stage", "2"),
        )
        .await?;

        info!(release_id = %release_id, "Stage 2 triggered");
        Ok(())
    }

    /// Manually start Stage 3 after regression completed without auto
    /// transition.
    pub async fn trigger_stage3(&self, release_id: &str, account_id: &str) -> Result<()> {
        let mut cron = self.require_cron(release_id).await?;

        if cron.stage2_status != StageStatus::Completed {
            return Err(Error::Conflict(format!(
                "Stage 2 is {} for release {}, stage 3 cannot start",
                cron.stage2_status.as_str(),
                release_id
            )));
        }
        if cron.stage3_status != StageStatus::Pending {
            return Err(Error::Conflict(format!(
                "Stage 3 is already {} for release {}",
                cron.stage3_status.as_str(),
                release_id
            )));
        }

        cron.auto_transition_to_stage3 = true;
        cron.stage3_status = StageStatus::InProgress;
        cron.cron_status = CronStatus::Running;
        cron.pause_type = PauseType::None;
        self.db.update_cron_job(&cron).await?;

        self.audit(
            StateHistory::new(
                release_id.to_string(),
                account_id.to_string(),
                HistoryAction::StageTriggered,
            )
            .with_item("stage", "3"),
        )
        .await?;

        info!(release_id = %release_id, "Stage 3 triggered");
        Ok(())
    }

    /// Archive a release. Idempotent; subsequent ticks become no-ops.
    pub async fn archive(&self, release_id: &str, account_id: &str) -> Result<()> {
        let mut release = self.require_release(release_id).await?;
        let mut cron = self.require_cron(release_id).await?;

        let already_archived = release.status == ReleaseStatus::Archived;
        if !already_archived {
            release.status = ReleaseStatus::Archived;
            release.last_updated_by_account_id = Some(account_id.to_string());
            self.db.update_release(&release).await?;
        }
        if cron.cron_status != CronStatus::Completed {
            cron.cron_status = CronStatus::Completed;
            self.db.update_cron_job(&cron).await?;
        }

        if !already_archived {
            self.audit(
                StateHistory::new(
                    release_id.to_string(),
                    account_id.to_string(),
                    HistoryAction::ReleaseArchived,
                )
                .with_item("status", ReleaseStatus::Archived.as_str()),
            )
            .await?;
        }

        info!(release_id = %release_id, "Release archived");
        Ok(())
    }

    /// Reset a failed task for re-execution on the next tick. The provider
    /// is never re-invoked inline.
    pub async fn retry_task(&self, task_id: &str, account_id: &str) -> Result<()> {
        let mut task = self
            .db
            .get_task(task_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Task {}", task_id)))?;

        if task.task_status != TaskStatus::Failed {
            return Err(Error::Conflict(format!(
                "Task {} is {}, only failed tasks can be retried",
                task_id,
                task.task_status.as_str()
            )));
        }

        task.task_status = TaskStatus::Pending;
        // Drop the failure but keep any dispatch progress recorded before
        // it, so the retry only covers the work that never went out
        task.external_data = match task.external_data.take() {
            Some(mut data) => {
                if let Some(obj) = data.as_object_mut() {
                    obj.remove("error");
                    obj.remove("timestamp");
                }
                match &data {
                    serde_json::Value::Object(obj) if obj.is_empty() => None,
                    _ => Some(data),
                }
            }
            None => None,
        };
        self.db.update_task(&task).await?;

        let mut cron = self.require_cron(&task.release_id).await?;
        if cron.pause_type == PauseType::TaskFailure {
            cron.pause_type = PauseType::None;
            self.db.update_cron_job(&cron).await?;
        }

        self.audit(
            StateHistory::new(
                task.release_id.clone(),
                account_id.to_string(),
                HistoryAction::TaskRetried,
            )
            .with_item("taskId", task_id)
            .with_item("taskType", task.task_type.as_str()),
        )
        .await?;

        info!(task_id = %task_id, release_id = %task.release_id, "Task reset for retry");
        Ok(())
    }

    /// Record a manually uploaded build artifact and report per-platform
    /// readiness for the stage.
    #[allow(clippy::too_many_arguments)]
    pub async fn upload_manual_build(
        &self,
        release_id: &str,
        stage: TaskStage,
        platform: PlatformName,
        file_bytes: &[u8],
        filename: &str,
        account_id: &str,
    ) -> Result<UploadSummary> {
        validate_build_extension(filename)?;
        let mut release = self.require_release(release_id).await?;

        let dir = self
            .uploads_dir
            .join(release_id)
            .join(stage.as_str().to_lowercase());
        std::fs::create_dir_all(&dir)?;
        let artifact_path = dir.join(filename);
        std::fs::write(&artifact_path, file_bytes)?;

        let upload = ReleaseUpload::new(
            release_id.to_string(),
            stage,
            platform,
            artifact_path.to_string_lossy().into_owned(),
        );
        self.db.upsert_upload(&upload).await?;

        if !release.has_manual_build_upload {
            release.has_manual_build_upload = true;
            self.db.update_release(&release).await?;
        }

        self.audit(
            StateHistory::new(
                release_id.to_string(),
                account_id.to_string(),
                HistoryAction::ManualBuildUploaded,
            )
            .with_item("stage", stage.as_str())
            .with_item("platform", platform.as_str())
            .with_item("filename", filename),
        )
        .await?;

        self.upload_summary(release_id, stage).await
    }

    /// Per-platform upload readiness for a stage.
    pub async fn upload_summary(
        &self,
        release_id: &str,
        stage: TaskStage,
    ) -> Result<UploadSummary> {
        let mappings = self.db.list_platform_mappings(release_id).await?;
        let uploads = self.db.list_uploads(release_id, stage).await?;

        let uploaded_platforms: Vec<PlatformName> =
            uploads.iter().map(|u| u.platform).collect();
        let missing_platforms: Vec<PlatformName> = mappings
            .iter()
            .map(|m| m.platform)
            .filter(|p| !uploaded_platforms.contains(p))
            .collect();
        let all_platforms_ready = missing_platforms.is_empty() && !mappings.is_empty();

        Ok(UploadSummary {
            uploaded_platforms,
            missing_platforms,
            all_platforms_ready,
        })
    }

    // ==================== Helpers ====================

    async fn require_release(&self, release_id: &str) -> Result<crate::release::Release> {
        self.db
            .get_release(release_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Release {}", release_id)))
    }

    async fn require_tenant_release(
        &self,
        release_id: &str,
        tenant_id: &str,
    ) -> Result<crate::release::Release> {
        let release = self.require_release(release_id).await?;
        if release.tenant_id != tenant_id {
            return Err(Error::NotFound(format!("Release {}", release_id)));
        }
        Ok(release)
    }

    async fn require_cron(&self, release_id: &str) -> Result<crate::cron_job::CronJob> {
        self.db
            .get_cron_job_by_release(release_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Cron job for release {}", release_id)))
    }

    async fn audit(&self, entry: StateHistory) -> Result<()> {
        self.db.insert_state_history(&entry).await
    }
}
