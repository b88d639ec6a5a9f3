//! Pre-release stage (Stage 3)
//!
//! Bulk-creates the post-regression task set on first execute, gated on the
//! integrations the release actually has, then runs it in order. Completing
//! the stage closes out the whole cron job.

use tracing::info;

use super::{all_enabled_complete, run_tasks_in_order, StageContext, StageState};
use crate::cron_job::{CronStatus, PauseType, StageStatus};
use crate::release::{PlatformName, ReleaseStatus};
use crate::task::{post_regression_task_types, ReleaseTask, TaskStage};
use crate::Result;

pub struct PreReleaseState;

impl PreReleaseState {
    pub async fn execute(&self, ctx: &mut StageContext) -> Result<()> {
        let mut tasks = ctx
            .db
            .list_stage_tasks(&ctx.release.id, TaskStage::PostRegression)
            .await?;

        if tasks.is_empty() {
            let has_ios = ctx
                .mappings
                .iter()
                .any(|m| m.platform == PlatformName::Ios);
            let seeded: Vec<ReleaseTask> =
                post_regression_task_types(&ctx.cron.cron_config, has_ios)
                    .into_iter()
                    .map(|t| ReleaseTask::new(ctx.release.id.clone(), t))
                    .collect();
            ctx.db.insert_tasks(&seeded).await?;
            info!(
                release_id = %ctx.release.id,
                count = seeded.len(),
                "Seeded pre-release tasks"
            );
            tasks = seeded;
        }

        run_tasks_in_order(ctx, &tasks, None).await?;
        Ok(())
    }

    pub async fn is_complete(&self, ctx: &mut StageContext) -> Result<bool> {
        let tasks = ctx
            .db
            .list_stage_tasks(&ctx.release.id, TaskStage::PostRegression)
            .await?;
        if tasks.is_empty() {
            return Ok(false);
        }
        Ok(all_enabled_complete(ctx, &tasks))
    }

    pub async fn transition_to_next(&self, ctx: &mut StageContext) -> Result<Option<StageState>> {
        ctx.refresh_cron().await?;
        let mut cron = ctx.cron.clone();
        cron.stage3_status = StageStatus::Completed;
        cron.cron_status = CronStatus::Completed;
        cron.pause_type = PauseType::None;
        ctx.db.update_cron_job(&cron).await?;
        ctx.cron = cron;

        let mut release = ctx.release.clone();
        release.status = ReleaseStatus::Completed;
        ctx.db.update_release(&release).await?;
        ctx.release = release;

        info!(release_id = %ctx.release.id, "Release complete");
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cron_job::CronJob;
    use crate::database::Database;
    use crate::providers::mock::mock_registry;
    use crate::release::{
        PlatformTargetMapping, Release, ReleaseType, TargetName,
    };
    use crate::task::{TaskStatus, TaskType};
    use crate::task_executor::TaskExecutor;

    async fn context(platforms: &[(PlatformName, TargetName)], test_flight: bool) -> StageContext {
        let db = Database::in_memory().await.unwrap();
        let (registry, _state) = mock_registry();
        let executor = TaskExecutor::new(db.clone(), registry);

        let mut release = Release::new(
            "tenant-1".to_string(),
            ReleaseType::Minor,
            "develop".to_string(),
            "config-1".to_string(),
            "acct-1".to_string(),
        );
        release.branch = Some("release/v1.0.0".to_string());
        release.status = ReleaseStatus::InProgress;
        db.insert_release(&release).await.unwrap();

        for (platform, target) in platforms {
            let mut mapping = PlatformTargetMapping::new(
                release.id.clone(),
                *platform,
                *target,
                "v1.0.0".to_string(),
            );
            mapping.project_management_run_id = Some("TICKET-seed".to_string());
            db.insert_platform_mapping(&mapping).await.unwrap();
        }

        let mut cron = CronJob::new(release.id.clone());
        cron.stage1_status = StageStatus::Completed;
        cron.stage2_status = StageStatus::Completed;
        cron.stage3_status = StageStatus::InProgress;
        cron.cron_status = CronStatus::Running;
        cron.cron_config.test_flight_builds = test_flight;
        db.insert_cron_job(&cron).await.unwrap();

        StageContext::load(db, executor, &release.id).await.unwrap()
    }

    #[tokio::test]
    async fn test_execute_seeds_and_completes() {
        let mut ctx = context(&[(PlatformName::Android, TargetName::PlayStore)], false).await;

        PreReleaseState.execute(&mut ctx).await.unwrap();

        let tasks = ctx
            .db
            .list_stage_tasks(&ctx.release.id, TaskStage::PostRegression)
            .await
            .unwrap();
        assert!(!tasks.is_empty());
        assert!(tasks.iter().all(|t| t.task_status == TaskStatus::Completed));
        assert!(PreReleaseState.is_complete(&mut ctx).await.unwrap());
    }

    #[tokio::test]
    async fn test_test_flight_task_only_with_ios_mapping() {
        let mut ctx = context(
            &[
                (PlatformName::Android, TargetName::PlayStore),
                (PlatformName::Ios, TargetName::AppStore),
            ],
            true,
        )
        .await;
        PreReleaseState.execute(&mut ctx).await.unwrap();
        let tasks = ctx
            .db
            .list_stage_tasks(&ctx.release.id, TaskStage::PostRegression)
            .await
            .unwrap();
        assert!(tasks
            .iter()
            .any(|t| t.task_type == TaskType::TriggerTestFlightBuild));

        let mut ctx = context(&[(PlatformName::Android, TargetName::PlayStore)], true).await;
        PreReleaseState.execute(&mut ctx).await.unwrap();
        let tasks = ctx
            .db
            .list_stage_tasks(&ctx.release.id, TaskStage::PostRegression)
            .await
            .unwrap();
        assert!(!tasks
            .iter()
            .any(|t| t.task_type == TaskType::TriggerTestFlightBuild));
    }

    #[tokio::test]
    async fn test_transition_completes_cron_and_release() {
        let mut ctx = context(&[(PlatformName::Android, TargetName::PlayStore)], false).await;
        PreReleaseState.execute(&mut ctx).await.unwrap();

        let next = PreReleaseState.transition_to_next(&mut ctx).await.unwrap();
        assert_eq!(next, None);
        assert_eq!(ctx.cron.stage3_status, StageStatus::Completed);
        assert_eq!(ctx.cron.cron_status, CronStatus::Completed);

        let release = ctx.db.get_release(&ctx.release.id).await.unwrap().unwrap();
        assert_eq!(release.status, ReleaseStatus::Completed);
    }
}
