//! Regression stage (Stage 2) — the cycle loop
//!
//! Each tick advances the active regression cycle if one exists, then
//! consumes at most one due slot from the upcoming-regressions queue,
//! spawning a new tagged cycle with its task set and advancing it within the
//! same tick. Slots appended mid-stage keep the release in regression even
//! when auto-transition to pre-release is on.

use chrono::Utc;
use tracing::info;

use super::{run_tasks_in_order, StageContext, StageProgress, StageState};
use crate::cron_job::{CronConfig, CronStatus, PauseType, StageStatus};
use crate::regression::{cycle_tag, CycleStatus, RegressionCycle};
use crate::task::{regression_task_types, ReleaseTask};
use crate::{Error, Result};

pub struct RegressionState;

impl RegressionState {
    pub async fn execute(&self, ctx: &mut StageContext) -> Result<()> {
        // Advance the active cycle first
        if let Some(cycle) = ctx.db.latest_cycle(&ctx.release.id).await? {
            if cycle.status != CycleStatus::Done {
                let done = self.advance_cycle(ctx, cycle).await?;
                if !done {
                    return Ok(());
                }
            }
        }

        // The latest cycle is done or absent: consume the earliest due slot
        ctx.refresh_cron().await?;
        let now = Utc::now();
        let Some(idx) = ctx.cron.next_due_slot(now) else {
            return Ok(());
        };

        let mut cron = ctx.cron.clone();
        let slot = cron.upcoming_regressions.remove(idx);
        ctx.db.update_cron_job(&cron).await?;
        ctx.cron = cron;

        let cycle = self.spawn_cycle(ctx, slot.config).await?;
        self.advance_cycle(ctx, cycle).await?;
        Ok(())
    }

    /// Run the cycle's tasks; marks the cycle done when they all complete.
    async fn advance_cycle(
        &self,
        ctx: &mut StageContext,
        mut cycle: RegressionCycle,
    ) -> Result<bool> {
        if cycle.status == CycleStatus::NotStarted || cycle.status == CycleStatus::Started {
            cycle.status = CycleStatus::InProgress;
            ctx.db.update_cycle(&cycle).await?;
        }

        let tasks = ctx.db.list_cycle_tasks(&cycle.id).await?;
        match run_tasks_in_order(ctx, &tasks, Some(&cycle)).await? {
            StageProgress::AllComplete => {
                cycle.status = CycleStatus::Done;
                ctx.db.update_cycle(&cycle).await?;
                info!(
                    release_id = %ctx.release.id,
                    cycle_tag = %cycle.cycle_tag,
                    "Regression cycle done"
                );
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Create the next cycle and its task set. The previous latest cycle is
    /// demoted inside the insert transaction.
    async fn spawn_cycle(
        &self,
        ctx: &mut StageContext,
        slot_config: serde_json::Value,
    ) -> Result<RegressionCycle> {
        let version = ctx
            .mappings
            .first()
            .map(|m| m.normalized_version().to_string())
            .ok_or_else(|| {
                Error::Corruption(
                    ctx.release.id.clone(),
                    "release has no platform mappings".to_string(),
                )
            })?;

        let first_cycle = ctx.db.cycle_count(&ctx.release.id).await? == 0;
        let ordinal = ctx.db.tag_count(&ctx.release.id, &version).await?;
        let cycle = RegressionCycle::new(ctx.release.id.clone(), cycle_tag(&version, ordinal));
        ctx.db.insert_cycle(&cycle).await?;

        // A slot may carry its own task flags; otherwise the release's apply
        let config = match &slot_config {
            serde_json::Value::Object(map) if !map.is_empty() => {
                serde_json::from_value::<CronConfig>(slot_config.clone())
                    .unwrap_or_else(|_| ctx.cron.cron_config.clone())
            }
            _ => ctx.cron.cron_config.clone(),
        };

        let tasks: Vec<ReleaseTask> = regression_task_types(&config, first_cycle)
            .into_iter()
            .map(|t| ReleaseTask::for_cycle(ctx.release.id.clone(), cycle.id.clone(), t))
            .collect();
        ctx.db.insert_tasks(&tasks).await?;

        info!(
            release_id = %ctx.release.id,
            cycle_tag = %cycle.cycle_tag,
            first_cycle = first_cycle,
            tasks = tasks.len(),
            "Spawned regression cycle"
        );
        Ok(cycle)
    }

    pub async fn is_complete(&self, ctx: &mut StageContext) -> Result<bool> {
        ctx.refresh_cron().await?;
        // Pending slots, due or not, keep the stage open
        if !ctx.cron.upcoming_regressions.is_empty() {
            return Ok(false);
        }
        match ctx.db.latest_cycle(&ctx.release.id).await? {
            Some(cycle) => Ok(cycle.status == CycleStatus::Done),
            None => Ok(true),
        }
    }

    pub async fn transition_to_next(&self, ctx: &mut StageContext) -> Result<Option<StageState>> {
        ctx.refresh_cron().await?;
        let mut cron = ctx.cron.clone();

        // Slots added mid-stage override the auto-transition flag
        if !cron.upcoming_regressions.is_empty() {
            info!(
                release_id = %ctx.release.id,
                slots = cron.upcoming_regressions.len(),
                "Staying in regression for newly scheduled slots"
            );
            return Ok(None);
        }

        cron.stage2_status = StageStatus::Completed;

        let next = if cron.auto_transition_to_stage3 {
            if cron.stage3_status == StageStatus::Pending {
                cron.stage3_status = StageStatus::InProgress;
            }
            cron.cron_status = CronStatus::Running;
            cron.pause_type = PauseType::None;
            info!(release_id = %ctx.release.id, "Regression complete, entering pre-release");
            Some(StageState::PreRelease)
        } else {
            cron.cron_status = CronStatus::Paused;
            cron.pause_type = PauseType::AwaitingStageTrigger;
            info!(
                release_id = %ctx.release.id,
                "Regression complete, awaiting manual pre-release trigger"
            );
            None
        };

        ctx.db.update_cron_job(&cron).await?;
        ctx.cron = cron;
        Ok(next)
    }
}
