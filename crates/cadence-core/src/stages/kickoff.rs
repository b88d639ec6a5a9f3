//! Kickoff stage (Stage 1)
//!
//! Seeds and runs the kickoff task set: reminder, branch fork, ticket and
//! test-suite creation, optional pre-regression builds. The reminder and the
//! fork are time-gated on the release's scheduled dates.

use tracing::info;

use super::{all_enabled_complete, run_tasks_in_order, StageContext, StageState};
use crate::cron_job::{CronStatus, PauseType, StageStatus};
use crate::task::{kickoff_task_types, ReleaseTask, TaskStage};
use crate::{Error, Result};

pub struct KickoffState;

impl KickoffState {
    pub async fn execute(&self, ctx: &mut StageContext) -> Result<()> {
        let mut tasks = ctx
            .db
            .list_stage_tasks(&ctx.release.id, TaskStage::Kickoff)
            .await?;

        if tasks.is_empty() {
            let seeded: Vec<ReleaseTask> = kickoff_task_types(&ctx.cron.cron_config)
                .into_iter()
                .map(|t| ReleaseTask::new(ctx.release.id.clone(), t))
                .collect();
            ctx.db.insert_tasks(&seeded).await?;
            info!(
                release_id = %ctx.release.id,
                count = seeded.len(),
                "Seeded kickoff tasks"
            );
            tasks = seeded;
        }

        run_tasks_in_order(ctx, &tasks, None).await?;
        Ok(())
    }

    pub async fn is_complete(&self, ctx: &mut StageContext) -> Result<bool> {
        let tasks = ctx
            .db
            .list_stage_tasks(&ctx.release.id, TaskStage::Kickoff)
            .await?;
        if tasks.is_empty() {
            return Ok(false);
        }
        Ok(all_enabled_complete(ctx, &tasks))
    }

    pub async fn transition_to_next(&self, ctx: &mut StageContext) -> Result<Option<StageState>> {
        ctx.refresh_cron().await?;
        let mut cron = ctx.cron.clone();

        if cron.stage2_status == StageStatus::Completed {
            return Err(Error::Corruption(
                ctx.release.id.clone(),
                "stage 2 already completed while stage 1 was active".to_string(),
            ));
        }

        cron.stage1_status = StageStatus::Completed;

        let next = if cron.auto_transition_to_stage2 {
            cron.stage2_status = StageStatus::InProgress;
            cron.cron_status = CronStatus::Running;
            cron.pause_type = PauseType::None;
            info!(release_id = %ctx.release.id, "Kickoff complete, entering regression");
            Some(StageState::Regression)
        } else {
            cron.cron_status = CronStatus::Paused;
            cron.pause_type = PauseType::AwaitingStageTrigger;
            info!(
                release_id = %ctx.release.id,
                "Kickoff complete, awaiting manual regression trigger"
            );
            None
        };

        ctx.db.update_cron_job(&cron).await?;
        ctx.cron = cron;
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cron_job::CronJob;
    use crate::database::Database;
    use crate::providers::mock::mock_registry;
    use crate::release::{
        PlatformName, PlatformTargetMapping, Release, ReleaseType, TargetName,
    };
    use crate::task::{TaskStatus, TaskType};
    use crate::task_executor::TaskExecutor;
    use chrono::{Duration, Utc};

    async fn context() -> StageContext {
        let db = Database::in_memory().await.unwrap();
        let (registry, _state) = mock_registry();
        let executor = TaskExecutor::new(db.clone(), registry);

        let release = Release::new(
            "tenant-1".to_string(),
            ReleaseType::Minor,
            "develop".to_string(),
            "config-1".to_string(),
            "acct-1".to_string(),
        );
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

        StageContext::load(db, executor, &release.id).await.unwrap()
    }

    #[tokio::test]
    async fn test_execute_seeds_and_completes_tasks() {
        let mut ctx = context().await;

        KickoffState.execute(&mut ctx).await.unwrap();

        let tasks = ctx
            .db
            .list_stage_tasks(&ctx.release.id, TaskStage::Kickoff)
            .await
            .unwrap();
        // Reminder and pre-regression builds are off by default
        assert_eq!(tasks.len(), 3);
        assert!(tasks.iter().all(|t| t.task_status == TaskStatus::Completed));

        assert!(KickoffState.is_complete(&mut ctx).await.unwrap());
    }

    #[tokio::test]
    async fn test_fork_waits_for_kickoff_date() {
        let mut ctx = context().await;
        ctx.release.kick_off_date = Some(Utc::now() + Duration::hours(2));
        ctx.db.update_release(&ctx.release).await.unwrap();

        KickoffState.execute(&mut ctx).await.unwrap();

        let tasks = ctx
            .db
            .list_stage_tasks(&ctx.release.id, TaskStage::Kickoff)
            .await
            .unwrap();
        // Nothing ran: the fork gate holds the whole walk
        assert!(tasks.iter().all(|t| t.task_status == TaskStatus::Pending));
        assert!(!KickoffState.is_complete(&mut ctx).await.unwrap());
    }

    #[tokio::test]
    async fn test_transition_auto_enters_regression() {
        let mut ctx = context().await;
        KickoffState.execute(&mut ctx).await.unwrap();

        let next = KickoffState.transition_to_next(&mut ctx).await.unwrap();
        assert_eq!(next, Some(StageState::Regression));
        assert_eq!(ctx.cron.stage1_status, StageStatus::Completed);
        assert_eq!(ctx.cron.stage2_status, StageStatus::InProgress);
        assert_eq!(ctx.cron.cron_status, CronStatus::Running);
    }

    #[tokio::test]
    async fn test_transition_manual_pauses_awaiting_trigger() {
        let mut ctx = context().await;
        ctx.cron.auto_transition_to_stage2 = false;
        ctx.db.update_cron_job(&ctx.cron).await.unwrap();

        KickoffState.execute(&mut ctx).await.unwrap();
        let next = KickoffState.transition_to_next(&mut ctx).await.unwrap();

        assert_eq!(next, None);
        assert_eq!(ctx.cron.stage1_status, StageStatus::Completed);
        assert_eq!(ctx.cron.stage2_status, StageStatus::Pending);
        assert_eq!(ctx.cron.cron_status, CronStatus::Paused);
        assert_eq!(ctx.cron.pause_type, PauseType::AwaitingStageTrigger);
    }

    #[tokio::test]
    async fn test_reminder_runs_when_enabled_and_due() {
        let mut ctx = context().await;
        ctx.cron.cron_config.kick_off_reminder = true;
        ctx.db.update_cron_job(&ctx.cron).await.unwrap();
        ctx.release.kick_off_reminder_date = Some(Utc::now() - Duration::minutes(1));
        ctx.db.update_release(&ctx.release).await.unwrap();

        KickoffState.execute(&mut ctx).await.unwrap();

        let tasks = ctx
            .db
            .list_stage_tasks(&ctx.release.id, TaskStage::Kickoff)
            .await
            .unwrap();
        let reminder = tasks
            .iter()
            .find(|t| t.task_type == TaskType::PreKickOffReminder)
            .unwrap();
        assert_eq!(reminder.task_status, TaskStatus::Completed);
    }
}
