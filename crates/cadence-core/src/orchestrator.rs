//! Release orchestrator
//!
//! One orchestrator instance advances one release by one step per tick. It
//! refetches persisted state, applies the archive and pause guards, selects
//! the active stage state, delegates execution, and transitions when the
//! stage reports completion. It assumes the caller holds the release's cron
//! lease for the duration of the call.

use tracing::{info, warn};

use crate::cron_job::{CronJob, CronStatus, PauseType, StageStatus};
use crate::database::Database;
use crate::release::ReleaseStatus;
use crate::stages::{StageContext, StageState};
use crate::task_executor::TaskExecutor;
use crate::{Error, Result};

pub struct Orchestrator {
    db: Database,
    executor: TaskExecutor,
    release_id: String,
}

impl Orchestrator {
    pub fn new(db: Database, executor: TaskExecutor, release_id: impl Into<String>) -> Self {
        Self {
            db,
            executor,
            release_id: release_id.into(),
        }
    }

    /// Advance the release by one tick.
    pub async fn execute(&self) -> Result<()> {
        let release = self
            .db
            .get_release(&self.release_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Release {}", self.release_id)))?;
        let cron = self
            .db
            .get_cron_job_by_release(&self.release_id)
            .await?
            .ok_or_else(|| {
                Error::NotFound(format!("Cron job for release {}", self.release_id))
            })?;

        // Archive guard: archived releases are frozen, only the cron status
        // is settled
        if release.status == ReleaseStatus::Archived {
            if cron.cron_status != CronStatus::Completed {
                let mut cron = cron;
                cron.cron_status = CronStatus::Completed;
                self.db.update_cron_job(&cron).await?;
                info!(release_id = %self.release_id, "Settled cron status for archived release");
            }
            return Ok(());
        }

        // Pause guard: user pauses and task failures stop the release until
        // explicit action. Awaiting a stage trigger passes through because
        // regression may legitimately resume itself on slot time.
        match cron.pause_type {
            PauseType::UserRequested | PauseType::TaskFailure => {
                return Ok(());
            }
            PauseType::None | PauseType::AwaitingStageTrigger => {}
        }

        if cron.in_progress_count() > 1 {
            warn!(
                release_id = %self.release_id,
                "Multiple stages in progress, halting release"
            );
            return Err(Error::Corruption(
                self.release_id.clone(),
                "more than one stage is in progress".to_string(),
            ));
        }

        let Some(state) = select_state(&cron) else {
            return Ok(());
        };

        let mut ctx = StageContext::load(
            self.db.clone(),
            self.executor.clone(),
            &self.release_id,
        )
        .await?;

        // Recovery path: a stage selected while still pending is promoted
        // before it runs, keeping exactly one stage in progress
        if ctx.cron.stage_status(state.stage()) == StageStatus::Pending {
            let mut cron = ctx.cron.clone();
            cron.set_stage_status(state.stage(), StageStatus::InProgress);
            self.db.update_cron_job(&cron).await?;
            ctx.cron = cron;
        }

        state.execute(&mut ctx).await?;
        if state.is_complete(&mut ctx).await? {
            state.transition_to_next(&mut ctx).await?;
        }
        Ok(())
    }
}

/// Pick the stage state for this tick from the persisted statuses.
fn select_state(cron: &CronJob) -> Option<StageState> {
    if cron.stage1_status == StageStatus::InProgress {
        return Some(StageState::Kickoff);
    }
    if cron.stage2_status == StageStatus::InProgress {
        return Some(StageState::Regression);
    }
    if cron.stage3_status == StageStatus::InProgress {
        return Some(StageState::PreRelease);
    }

    // Flexible regression: slots scheduled after stage 2 completed re-open it
    if cron.stage2_status == StageStatus::Completed && !cron.upcoming_regressions.is_empty() {
        return Some(StageState::Regression);
    }

    // No stage running: pick the first pending stage whose predecessor is
    // complete, honoring the auto-transition flags
    if cron.stage1_status == StageStatus::Pending {
        return Some(StageState::Kickoff);
    }
    if cron.stage1_status == StageStatus::Completed
        && cron.stage2_status == StageStatus::Pending
        && cron.auto_transition_to_stage2
    {
        return Some(StageState::Regression);
    }
    if cron.stage2_status == StageStatus::Completed
        && cron.stage3_status == StageStatus::Pending
        && cron.auto_transition_to_stage3
    {
        return Some(StageState::PreRelease);
    }

    None
}
