//! Stage states
//!
//! Each release advances through three ordered stages. A stage state reads
//! the current cron job and tasks, performs at most one forward step per
//! tick, and reports completeness so the orchestrator can transition. States
//! never block on external systems: slow work stays `IN_PROGRESS` across
//! ticks and the scheduler is the resumption mechanism.

pub mod kickoff;
pub mod pre_release;
pub mod regression;

pub use kickoff::KickoffState;
pub use pre_release::PreReleaseState;
pub use regression::RegressionState;

use chrono::Utc;

use crate::cron_job::CronJob;
use crate::database::Database;
use crate::regression::RegressionCycle;
use crate::release::{PlatformTargetMapping, Release};
use crate::task::{ReleaseTask, TaskStage, TaskStatus, TaskType};
use crate::task_executor::{TaskContext, TaskExecutor};
use crate::{Error, Result};

/// Per-tick context shared by the stage states
pub struct StageContext {
    pub db: Database,
    pub executor: TaskExecutor,
    pub release: Release,
    pub cron: CronJob,
    pub mappings: Vec<PlatformTargetMapping>,
}

impl StageContext {
    /// Build the context for one release tick.
    pub async fn load(db: Database, executor: TaskExecutor, release_id: &str) -> Result<Self> {
        let release = db
            .get_release(release_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Release {}", release_id)))?;
        let cron = db
            .get_cron_job_by_release(release_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Cron job for release {}", release_id)))?;
        let mappings = db.list_platform_mappings(release_id).await?;
        Ok(Self {
            db,
            executor,
            release,
            cron,
            mappings,
        })
    }

    /// Re-read the cron job; slots and pause state may move under us.
    pub async fn refresh_cron(&mut self) -> Result<()> {
        self.cron = self
            .db
            .get_cron_job_by_release(&self.release.id)
            .await?
            .ok_or_else(|| {
                Error::NotFound(format!("Cron job for release {}", self.release.id))
            })?;
        Ok(())
    }

    /// Re-read the release; tasks write back onto it (branch fork).
    pub async fn refresh_release(&mut self) -> Result<()> {
        self.release = self
            .db
            .get_release(&self.release.id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Release {}", self.release.id)))?;
        Ok(())
    }
}

/// How far a task walk got this tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StageProgress {
    /// Every enabled task is completed
    AllComplete,
    /// Waiting on a time gate or in-flight external work
    Waiting,
    /// A task failed; the cron job is paused until retry
    Blocked,
}

/// Walk the stage's tasks in declared order, dispatching each eligible one.
///
/// A task runs only when every prior required task is completed; tasks
/// disabled by the cron config are skipped entirely. The walk stops at the
/// first task that stays in flight, is not yet due, or failed.
pub(crate) async fn run_tasks_in_order(
    ctx: &mut StageContext,
    tasks: &[ReleaseTask],
    cycle: Option<&RegressionCycle>,
) -> Result<StageProgress> {
    let mut ordered = tasks.to_vec();
    ordered.sort_by_key(|t| t.task_type.order_index());

    for task in &ordered {
        if !task.task_type.is_enabled(&ctx.cron.cron_config) {
            continue;
        }
        match task.task_status {
            TaskStatus::Completed => continue,
            TaskStatus::Failed => return Ok(StageProgress::Blocked),
            TaskStatus::Pending | TaskStatus::InProgress => {
                if task.task_status == TaskStatus::Pending && !time_gate_open(ctx, task) {
                    return Ok(StageProgress::Waiting);
                }

                let status = {
                    let task_ctx = TaskContext {
                        release: &ctx.release,
                        cron: &ctx.cron,
                        mappings: &ctx.mappings,
                        cycle,
                    };
                    ctx.executor.execute(task, &task_ctx).await?
                };

                // Tasks write back onto the aggregate (branch, run ids)
                ctx.refresh_release().await?;
                ctx.mappings = ctx.db.list_platform_mappings(&ctx.release.id).await?;

                match status {
                    TaskStatus::Completed => continue,
                    TaskStatus::InProgress => return Ok(StageProgress::Waiting),
                    _ => return Ok(StageProgress::Blocked),
                }
            }
        }
    }

    Ok(StageProgress::AllComplete)
}

/// Time-gated kickoff tasks wait for their scheduled moment.
fn time_gate_open(ctx: &StageContext, task: &ReleaseTask) -> bool {
    let now = Utc::now();
    match task.task_type {
        TaskType::PreKickOffReminder => ctx
            .release
            .kick_off_reminder_date
            .map_or(true, |d| d <= now),
        TaskType::ForkBranch => ctx.release.kick_off_date.map_or(true, |d| d <= now),
        _ => true,
    }
}

/// Whether every enabled task in the list is completed.
pub(crate) fn all_enabled_complete(ctx: &StageContext, tasks: &[ReleaseTask]) -> bool {
    tasks
        .iter()
        .filter(|t| t.task_type.is_enabled(&ctx.cron.cron_config))
        .all(|t| t.task_status == TaskStatus::Completed)
}

// ==================== Stage State ====================

/// The orchestrator's current stage, as a tagged variant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageState {
    Kickoff,
    Regression,
    PreRelease,
}

impl StageState {
    pub fn stage(&self) -> TaskStage {
        match self {
            StageState::Kickoff => TaskStage::Kickoff,
            StageState::Regression => TaskStage::Regression,
            StageState::PreRelease => TaskStage::PostRegression,
        }
    }

    /// Advance this stage by one step.
    pub async fn execute(&self, ctx: &mut StageContext) -> Result<()> {
        match self {
            StageState::Kickoff => KickoffState.execute(ctx).await,
            StageState::Regression => RegressionState.execute(ctx).await,
            StageState::PreRelease => PreReleaseState.execute(ctx).await,
        }
    }

    /// Whether the stage has nothing left to do.
    pub async fn is_complete(&self, ctx: &mut StageContext) -> Result<bool> {
        match self {
            StageState::Kickoff => KickoffState.is_complete(ctx).await,
            StageState::Regression => RegressionState.is_complete(ctx).await,
            StageState::PreRelease => PreReleaseState.is_complete(ctx).await,
        }
    }

    /// Close out this stage and hand over to the next one, honoring the
    /// auto-transition flags. Returns the state to run on the next tick.
    pub async fn transition_to_next(&self, ctx: &mut StageContext) -> Result<Option<StageState>> {
        match self {
            StageState::Kickoff => KickoffState.transition_to_next(ctx).await,
            StageState::Regression => RegressionState.transition_to_next(ctx).await,
            StageState::PreRelease => PreReleaseState.transition_to_next(ctx).await,
        }
    }
}
