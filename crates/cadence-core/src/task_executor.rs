//! Task execution engine
//!
//! Executes one release task end-to-end: marks it in progress, dispatches to
//! the provider picked by its type, persists the provider result, and settles
//! the task as completed or failed. Provider failures never escape a tick;
//! they pause the release's cron job until an explicit retry.

use chrono::Utc;
use futures::future::try_join_all;
use serde_json::json;
use tracing::{error, info, warn};

use crate::cron_job::{CronJob, PauseType};
use crate::database::Database;
use crate::notify::Notifier;
use crate::providers::{ProviderRegistry, WorkflowKind, WorkflowTrigger};
use crate::regression::{release_tag, RegressionCycle};
use crate::release::{PlatformName, PlatformTargetMapping, Release};
use crate::task::{ReleaseTask, TaskStatus, TaskType};
use crate::uploads::Build;
use crate::{Error, Result};

/// Release-scoped context a task executes against
pub struct TaskContext<'a> {
    pub release: &'a Release,
    pub cron: &'a CronJob,
    pub mappings: &'a [PlatformTargetMapping],
    pub cycle: Option<&'a RegressionCycle>,
}

impl<'a> TaskContext<'a> {
    /// Version of the release, taken from the first platform mapping.
    fn version(&self) -> Result<String> {
        self.mappings
            .first()
            .map(|m| m.normalized_version().to_string())
            .ok_or_else(|| {
                Error::Corruption(
                    self.release.id.clone(),
                    "release has no platform mappings".to_string(),
                )
            })
    }

    /// Working branch, which must have been forked already.
    fn branch(&self) -> Result<String> {
        self.release
            .branch
            .clone()
            .ok_or_else(|| Error::Validation("release branch has not been forked yet".to_string()))
    }

    /// Tag of the active regression cycle.
    fn cycle_tag(&self) -> Result<String> {
        self.cycle
            .map(|c| c.cycle_tag.clone())
            .ok_or_else(|| {
                Error::Corruption(
                    self.release.id.clone(),
                    "regression task executed outside a cycle".to_string(),
                )
            })
    }
}

/// Outcome shape of one provider dispatch
enum TaskOutput {
    /// One identifier, mirrored into `external_data.externalId`
    Single {
        external_id: String,
        data: serde_json::Value,
    },
    /// Structured payload only, no external id
    Structured(serde_json::Value),
    /// Long-running work observed but not yet terminal; the task stays
    /// in progress and is re-polled on a later tick
    InFlight(serde_json::Value),
}

/// Executes individual release tasks against the provider bundle
#[derive(Clone)]
pub struct TaskExecutor {
    db: Database,
    providers: ProviderRegistry,
    notifier: Notifier,
}

impl TaskExecutor {
    pub fn new(db: Database, providers: ProviderRegistry) -> Self {
        let notifier = Notifier::new(providers.messaging.clone());
        Self {
            db,
            providers,
            notifier,
        }
    }

    /// Execute one task, returning its settled status.
    ///
    /// Provider failures settle the task as failed and pause the release's
    /// cron job; only infrastructure errors (database) propagate.
    pub async fn execute(
        &self,
        task: &ReleaseTask,
        ctx: &TaskContext<'_>,
    ) -> Result<TaskStatus> {
        let mut task = task.clone();

        info!(
            release_id = %task.release_id,
            task_id = %task.id,
            task_type = %task.task_type.as_str(),
            "Executing task"
        );

        task.task_status = TaskStatus::InProgress;
        self.db.update_task(&task).await?;

        match self.dispatch(&mut task, ctx).await {
            Ok(TaskOutput::Single { external_id, data }) => {
                task.external_id = Some(external_id);
                task.external_data = Some(data);
                task.task_status = TaskStatus::Completed;
            }
            Ok(TaskOutput::Structured(data)) => {
                task.external_data = Some(data);
                task.task_status = TaskStatus::Completed;
            }
            Ok(TaskOutput::InFlight(data)) => {
                task.external_data = Some(data);
                // Stays in progress until a later tick observes completion
            }
            Err(Error::Database(e)) => return Err(Error::Database(e)),
            Err(e) => {
                error!(
                    task_id = %task.id,
                    task_type = %task.task_type.as_str(),
                    error = %e,
                    "Task failed"
                );
                task.task_status = TaskStatus::Failed;
                // Progress persisted before the failure stays on the record;
                // the error is merged in alongside it
                let mut data = task.external_data.take().unwrap_or_else(|| json!({}));
                if let Some(obj) = data.as_object_mut() {
                    obj.insert("error".to_string(), json!(e.to_string()));
                    obj.insert("timestamp".to_string(), json!(Utc::now().to_rfc3339()));
                }
                task.external_data = Some(data);
                self.db.update_task(&task).await?;
                self.pause_for_failure(&task.release_id).await?;
                return Ok(TaskStatus::Failed);
            }
        }

        self.db.update_task(&task).await?;
        Ok(task.task_status)
    }

    /// Halt further ticks for the release until an explicit retry.
    async fn pause_for_failure(&self, release_id: &str) -> Result<()> {
        let Some(mut cron) = self.db.get_cron_job_by_release(release_id).await? else {
            warn!(release_id = %release_id, "No cron job to pause after task failure");
            return Ok(());
        };
        cron.pause_type = PauseType::TaskFailure;
        self.db.update_cron_job(&cron).await
    }

    /// Route the task to its provider call.
    async fn dispatch(&self, task: &mut ReleaseTask, ctx: &TaskContext<'_>) -> Result<TaskOutput> {
        match task.task_type {
            TaskType::PreKickOffReminder => self.pre_kickoff_reminder(ctx).await,
            TaskType::ForkBranch => self.fork_branch(ctx).await,
            TaskType::CreateProjectManagementTicket => self.create_pm_tickets(ctx).await,
            TaskType::CreateTestSuite => self.create_test_suite(ctx).await,
            TaskType::TriggerPreRegressionBuilds => {
                self.trigger_builds(task, ctx, WorkflowKind::PreRegressionBuild, None)
                    .await
            }
            TaskType::ResetTestSuite => self.reset_test_suite(ctx).await,
            TaskType::CreateRcTag => self.create_rc_tag(ctx).await,
            TaskType::CreateReleaseNotes => self.create_release_notes(ctx).await,
            TaskType::TriggerRegressionBuilds => {
                let cycle_id = ctx.cycle.map(|c| c.id.clone());
                self.trigger_builds(task, ctx, WorkflowKind::RegressionBuild, cycle_id)
                    .await
            }
            TaskType::TriggerAutomationRuns => self.trigger_automation_runs(task, ctx).await,
            TaskType::AutomationRuns => self.observe_automation_runs(ctx).await,
            TaskType::SendRegressionBuildMessage => {
                self.send_regression_message(&*task, ctx).await
            }
            TaskType::PreReleaseCherryPicksReminder => self.cherry_picks_reminder(ctx).await,
            TaskType::CreateReleaseTag => self.create_final_tag(ctx).await,
            TaskType::CreateFinalReleaseNotes => self.create_final_notes(ctx).await,
            TaskType::TriggerTestFlightBuild => self.trigger_test_flight(&*task, ctx).await,
            TaskType::SendPostRegressionMessage => self.send_post_regression_message(ctx).await,
            TaskType::CheckProjectReleaseApproval => self.check_release_approval(ctx).await,
        }
    }

    // ==================== Kickoff Tasks ====================

    async fn pre_kickoff_reminder(&self, ctx: &TaskContext<'_>) -> Result<TaskOutput> {
        let version = ctx.version()?;
        let notified = self
            .notifier
            .kickoff_reminder(&ctx.release.id, &version)
            .await;
        Ok(TaskOutput::Structured(json!({
            "template": "kickoff-reminder",
            "notified": notified,
        })))
    }

    async fn fork_branch(&self, ctx: &TaskContext<'_>) -> Result<TaskOutput> {
        let version = ctx.version()?;
        let branch = format!("release/v{}", version);
        let response = self
            .providers
            .scm
            .fork_branch(&ctx.release.base_branch, &branch)
            .await?;

        let mut release = ctx.release.clone();
        release.branch = Some(branch.clone());
        self.db.update_release(&release).await?;

        Ok(TaskOutput::Structured(json!({
            "branch": branch,
            "baseBranch": ctx.release.base_branch,
            "response": response,
        })))
    }

    async fn create_pm_tickets(&self, ctx: &TaskContext<'_>) -> Result<TaskOutput> {
        // One ticket per configured platform, created in parallel. Each key
        // lands on its mapping row as soon as the ticket exists, so a retry
        // only creates tickets for the platforms still missing one.
        let creations = ctx
            .mappings
            .iter()
            .filter(|m| m.project_management_run_id.is_none())
            .cloned()
            .map(|mapping| {
                let pm = self.providers.pm.clone();
                let db = self.db.clone();
                async move {
                    let version = mapping.normalized_version().to_string();
                    let key = pm.create_tickets(mapping.platform, &version).await?;
                    let mut mapping = mapping;
                    mapping.project_management_run_id = Some(key.clone());
                    db.update_platform_mapping(&mapping).await?;
                    Ok::<String, Error>(key)
                }
            });
        try_join_all(creations).await?;

        // The mapping rows are the record; assemble the full key set fresh
        let mappings = self.db.list_platform_mappings(&ctx.release.id).await?;
        let keys: Vec<String> = mappings
            .iter()
            .filter_map(|m| m.project_management_run_id.clone())
            .collect();

        let external_id = keys.join(",");
        Ok(TaskOutput::Single {
            data: json!({"externalId": external_id, "tickets": keys}),
            external_id,
        })
    }

    async fn create_test_suite(&self, ctx: &TaskContext<'_>) -> Result<TaskOutput> {
        for mapping in ctx.mappings {
            // Runs recorded by a prior attempt are kept, not re-created
            if mapping.test_management_run_id.is_some() {
                continue;
            }
            let run_id = self
                .providers
                .test_management
                .create_test_runs(mapping.platform, mapping.normalized_version())
                .await?;
            let mut mapping = mapping.clone();
            mapping.test_management_run_id = Some(run_id.clone());
            self.db.update_platform_mapping(&mapping).await?;
        }

        let mappings = self.db.list_platform_mappings(&ctx.release.id).await?;
        let run_ids: Vec<String> = mappings
            .iter()
            .filter_map(|m| m.test_management_run_id.clone())
            .collect();

        let external_id = run_ids.join(",");
        Ok(TaskOutput::Single {
            data: json!({"externalId": external_id, "runs": run_ids}),
            external_id,
        })
    }

    // ==================== Regression Tasks ====================

    async fn reset_test_suite(&self, ctx: &TaskContext<'_>) -> Result<TaskOutput> {
        let mut reset = Vec::new();
        for mapping in ctx.mappings {
            let Some(run_id) = &mapping.test_management_run_id else {
                return Err(Error::Corruption(
                    ctx.release.id.clone(),
                    format!(
                        "no test run recorded for platform {}",
                        mapping.platform.as_str()
                    ),
                ));
            };
            self.providers.test_management.reset_test_run(run_id).await?;
            reset.push(run_id.clone());
        }
        Ok(TaskOutput::Structured(json!({"resetRuns": reset})))
    }

    async fn create_rc_tag(&self, ctx: &TaskContext<'_>) -> Result<TaskOutput> {
        let tag = ctx.cycle_tag()?;
        let branch = ctx.branch()?;
        let response = self.providers.scm.create_tag(&tag, &branch).await?;
        Ok(TaskOutput::Structured(json!({"tag": tag, "response": response})))
    }

    async fn create_release_notes(&self, ctx: &TaskContext<'_>) -> Result<TaskOutput> {
        let tag = ctx.cycle_tag()?;
        let branch = ctx.branch()?;
        let response = self
            .providers
            .scm
            .create_release_notes(&tag, &branch)
            .await?;
        Ok(TaskOutput::Structured(json!({"tag": tag, "notes": response})))
    }

    /// Dispatch one build workflow per platform and persist a build row each.
    ///
    /// Progress is written back to the task row after every platform, so a
    /// crash or a later platform's failure never re-triggers the builds that
    /// already went out: re-execution skips recorded platforms and takes the
    /// status-check path for their runs.
    async fn trigger_builds(
        &self,
        task: &mut ReleaseTask,
        ctx: &TaskContext<'_>,
        kind: WorkflowKind,
        regression_id: Option<String>,
    ) -> Result<TaskOutput> {
        let branch = ctx.branch()?;

        let mut platforms_done = recorded_strings(task, "platformsDispatched");
        let mut build_numbers = recorded_strings(task, "builds");
        let mut run_ids = recorded_strings(task, "runIds");
        let mut resumed = false;

        for mapping in ctx.mappings {
            if platforms_done.iter().any(|p| p == mapping.platform.as_str()) {
                resumed = true;
                continue;
            }

            let run = self
                .providers
                .cicd
                .trigger(&WorkflowTrigger {
                    kind,
                    platform: mapping.platform,
                    branch: branch.clone(),
                    version: mapping.normalized_version().to_string(),
                })
                .await?;

            let number = run.build_number.clone().unwrap_or_else(|| run.run_id.clone());
            let mut build = Build::new(ctx.release.id.clone(), mapping.platform, number.clone());
            build.workflow_run_id = Some(run.run_id.clone());
            if let Some(cycle_id) = &regression_id {
                build = build.for_cycle(cycle_id.clone());
            }
            self.db.insert_build(&build).await?;

            build_numbers.push(number);
            run_ids.push(run.run_id);
            platforms_done.push(mapping.platform.as_str().to_string());

            // Persist progress before moving to the next platform
            let joined = build_numbers.join(",");
            task.external_id = Some(joined.clone());
            task.external_data = Some(json!({
                "externalId": joined,
                "builds": &build_numbers,
                "runIds": &run_ids,
                "platformsDispatched": &platforms_done,
            }));
            self.db.update_task(task).await?;
        }

        let external_id = build_numbers.join(",");
        let mut data = json!({
            "externalId": external_id,
            "builds": &build_numbers,
            "runIds": &run_ids,
            "platformsDispatched": &platforms_done,
        });

        if resumed {
            info!(
                task_id = %task.id,
                external_id = %external_id,
                "Builds already dispatched, checked status instead of re-triggering"
            );
            let statuses = self.run_statuses(&run_ids).await?;
            data["statuses"] = json!(statuses);
            data["resumed"] = json!(true);
        }

        Ok(TaskOutput::Single { external_id, data })
    }

    async fn trigger_automation_runs(
        &self,
        task: &mut ReleaseTask,
        ctx: &TaskContext<'_>,
    ) -> Result<TaskOutput> {
        let branch = ctx.branch()?;

        let mut platforms_done = recorded_strings(task, "platformsDispatched");
        let mut run_ids = recorded_strings(task, "runIds");
        let mut resumed = false;

        for mapping in ctx.mappings {
            if platforms_done.iter().any(|p| p == mapping.platform.as_str()) {
                resumed = true;
                continue;
            }

            let run = self
                .providers
                .cicd
                .trigger(&WorkflowTrigger {
                    kind: WorkflowKind::AutomationRun,
                    platform: mapping.platform,
                    branch: branch.clone(),
                    version: mapping.normalized_version().to_string(),
                })
                .await?;

            run_ids.push(run.run_id);
            platforms_done.push(mapping.platform.as_str().to_string());

            let joined = run_ids.join(",");
            task.external_id = Some(joined.clone());
            task.external_data = Some(json!({
                "externalId": joined,
                "runIds": &run_ids,
                "platformsDispatched": &platforms_done,
            }));
            self.db.update_task(task).await?;
        }

        let external_id = run_ids.join(",");
        let mut data = json!({
            "externalId": external_id,
            "runIds": &run_ids,
            "platformsDispatched": &platforms_done,
        });

        if resumed {
            let statuses = self.run_statuses(&run_ids).await?;
            data["statuses"] = json!(statuses);
            data["resumed"] = json!(true);
        }

        Ok(TaskOutput::Single { external_id, data })
    }

    /// Current status of each recorded workflow run.
    async fn run_statuses(&self, run_ids: &[String]) -> Result<Vec<serde_json::Value>> {
        let mut statuses = Vec::with_capacity(run_ids.len());
        for run_id in run_ids {
            let run = self.providers.cicd.get_status(run_id).await?;
            statuses.push(json!({"runId": run.run_id, "status": run.status.as_str()}));
        }
        Ok(statuses)
    }

    /// Observe automation progress; completion is decided by the test
    /// management provider reporting a terminal run. The heavy polling lives
    /// in the workflow-polling collaborator, this records the snapshot.
    async fn observe_automation_runs(&self, ctx: &TaskContext<'_>) -> Result<TaskOutput> {
        let mut runs = Vec::new();
        let mut all_terminal = true;
        let mut threshold_met = true;

        for mapping in ctx.mappings {
            let Some(run_id) = &mapping.test_management_run_id else {
                continue;
            };
            let status = self.providers.test_management.get_test_status(run_id).await?;
            all_terminal &= status.is_terminal;
            threshold_met &= status.threshold_met;
            runs.push(json!({
                "runId": status.run_id,
                "passed": status.passed,
                "failed": status.failed,
                "total": status.total,
                "thresholdMet": status.threshold_met,
            }));
        }

        let data = json!({"runs": runs, "thresholdMet": threshold_met});
        if all_terminal {
            Ok(TaskOutput::Structured(data))
        } else {
            Ok(TaskOutput::InFlight(data))
        }
    }

    async fn send_regression_message(
        &self,
        task: &ReleaseTask,
        ctx: &TaskContext<'_>,
    ) -> Result<TaskOutput> {
        let tag = ctx.cycle_tag()?;
        // Announce the builds triggered for this cycle
        let builds = self.db.list_builds(&ctx.release.id).await?;
        let numbers: Vec<String> = builds
            .iter()
            .filter(|b| b.regression_id.as_deref() == task.regression_id.as_deref())
            .map(|b| b.build_number.clone())
            .collect();
        let notified = self
            .notifier
            .regression_build_message(&tag, &numbers.join(","))
            .await;
        Ok(TaskOutput::Structured(json!({
            "template": "regression-build",
            "cycleTag": tag,
            "builds": numbers,
            "notified": notified,
        })))
    }

    // ==================== Post-Regression Tasks ====================

    async fn cherry_picks_reminder(&self, ctx: &TaskContext<'_>) -> Result<TaskOutput> {
        let branch = ctx.branch()?;
        let since_tag = match self.db.latest_cycle(&ctx.release.id).await? {
            Some(cycle) => cycle.cycle_tag,
            None => release_tag(&ctx.version()?),
        };

        // true means the branch head has commits beyond the tag
        let divergent = self
            .providers
            .scm
            .check_cherry_picks(&branch, &since_tag)
            .await?;

        let mut notified = false;
        if divergent {
            notified = self.notifier.cherry_picks_reminder(&branch, &since_tag).await;
        }

        Ok(TaskOutput::Structured(json!({
            "cherryPickAvailable": divergent,
            "sinceTag": since_tag,
            "notified": notified,
        })))
    }

    async fn create_final_tag(&self, ctx: &TaskContext<'_>) -> Result<TaskOutput> {
        let tag = release_tag(&ctx.version()?);
        let branch = ctx.branch()?;
        let response = self.providers.scm.create_tag(&tag, &branch).await?;
        Ok(TaskOutput::Structured(json!({"tag": tag, "response": response})))
    }

    async fn create_final_notes(&self, ctx: &TaskContext<'_>) -> Result<TaskOutput> {
        let tag = release_tag(&ctx.version()?);
        let branch = ctx.branch()?;
        let response = self
            .providers
            .scm
            .create_release_notes(&tag, &branch)
            .await?;
        Ok(TaskOutput::Structured(json!({"tag": tag, "notes": response})))
    }

    async fn trigger_test_flight(
        &self,
        task: &ReleaseTask,
        ctx: &TaskContext<'_>,
    ) -> Result<TaskOutput> {
        // Dispatched on a prior attempt: check status instead of re-triggering
        if let Some(number) = task.external_id.clone() {
            let run_ids = recorded_strings(task, "runIds");
            let statuses = self.run_statuses(&run_ids).await?;
            return Ok(TaskOutput::Single {
                data: json!({
                    "externalId": number,
                    "runIds": &run_ids,
                    "statuses": statuses,
                    "resumed": true,
                }),
                external_id: number,
            });
        }

        let mapping = ctx
            .mappings
            .iter()
            .find(|m| m.platform == PlatformName::Ios)
            .ok_or_else(|| {
                Error::Validation(
                    "TestFlight build requires an iOS platform mapping".to_string(),
                )
            })?;

        let branch = ctx.branch()?;
        let run = self
            .providers
            .cicd
            .trigger(&WorkflowTrigger {
                kind: WorkflowKind::TestFlightBuild,
                platform: PlatformName::Ios,
                branch,
                version: mapping.normalized_version().to_string(),
            })
            .await?;

        let number = run.build_number.clone().unwrap_or_else(|| run.run_id.clone());
        let mut build = Build::new(ctx.release.id.clone(), PlatformName::Ios, number.clone());
        build.workflow_run_id = Some(run.run_id.clone());
        self.db.insert_build(&build).await?;

        Ok(TaskOutput::Single {
            data: json!({"externalId": number, "runIds": [run.run_id]}),
            external_id: number,
        })
    }

    async fn send_post_regression_message(&self, ctx: &TaskContext<'_>) -> Result<TaskOutput> {
        let tag = release_tag(&ctx.version()?);
        let notified = self
            .notifier
            .post_regression_message(&ctx.release.id, &tag)
            .await;
        Ok(TaskOutput::Structured(json!({
            "template": "post-regression",
            "tag": tag,
            "notified": notified,
        })))
    }

    async fn check_release_approval(&self, ctx: &TaskContext<'_>) -> Result<TaskOutput> {
        let mut tickets = Vec::new();
        let mut all_complete = true;

        for mapping in ctx.mappings {
            let Some(key) = &mapping.project_management_run_id else {
                continue;
            };
            let status = self.providers.pm.check_ticket_status(key).await?;
            all_complete &= status.is_complete();
            tickets.push(json!({
                "ticket": key,
                "currentStatus": status.current_status,
                "completedStatus": status.completed_status,
            }));
        }

        let data = json!({"tickets": tickets, "approved": all_complete});
        if all_complete {
            Ok(TaskOutput::Structured(data))
        } else {
            Ok(TaskOutput::InFlight(data))
        }
    }
}

/// String list recorded under a key of the task's payload, if any.
fn recorded_strings(task: &ReleaseTask, key: &str) -> Vec<String> {
    task.external_data
        .as_ref()
        .and_then(|d| d.get(key))
        .and_then(|v| serde_json::from_value(v.clone()).ok())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cron_job::CronJob;
    use crate::providers::mock::mock_registry;
    use crate::release::{PlatformTargetMapping, Release, ReleaseType, TargetName};
    use std::sync::atomic::Ordering;

    struct Fixture {
        db: Database,
        executor: TaskExecutor,
        state: std::sync::Arc<crate::providers::mock::MockState>,
        release: Release,
        cron: CronJob,
        mappings: Vec<PlatformTargetMapping>,
    }

    async fn fixture(platforms: &[(PlatformName, TargetName)]) -> Fixture {
        let db = Database::in_memory().await.unwrap();
        let (registry, state) = mock_registry();
        let executor = TaskExecutor::new(db.clone(), registry);

        let release = Release::new(
            "tenant-1".to_string(),
            ReleaseType::Minor,
            "develop".to_string(),
            "config-1".to_string(),
            "acct-1".to_string(),
        );
        db.insert_release(&release).await.unwrap();

        let cron = CronJob::new(release.id.clone());
        db.insert_cron_job(&cron).await.unwrap();

        let mut mappings = Vec::new();
        for (platform, target) in platforms {
            let mapping = PlatformTargetMapping::new(
                release.id.clone(),
                *platform,
                *target,
                "v1.0.0".to_string(),
            );
            db.insert_platform_mapping(&mapping).await.unwrap();
            mappings.push(mapping);
        }

        Fixture {
            db,
            executor,
            state,
            release,
            cron,
            mappings,
        }
    }

    async fn seed_task(fx: &Fixture, task_type: TaskType) -> ReleaseTask {
        let task = ReleaseTask::new(fx.release.id.clone(), task_type);
        fx.db.insert_tasks(std::slice::from_ref(&task)).await.unwrap();
        task
    }

    #[tokio::test]
    async fn test_fork_branch_stores_branch_on_release() {
        let fx = fixture(&[(PlatformName::Android, TargetName::PlayStore)]).await;
        let task = seed_task(&fx, TaskType::ForkBranch).await;

        let ctx = TaskContext {
            release: &fx.release,
            cron: &fx.cron,
            mappings: &fx.mappings,
            cycle: None,
        };
        let status = fx.executor.execute(&task, &ctx).await.unwrap();
        assert_eq!(status, TaskStatus::Completed);

        let release = fx.db.get_release(&fx.release.id).await.unwrap().unwrap();
        assert_eq!(release.branch.as_deref(), Some("release/v1.0.0"));

        let task = fx.db.get_task(&task.id).await.unwrap().unwrap();
        assert_eq!(task.task_status, TaskStatus::Completed);
        assert!(task.external_id.is_none());
        assert_eq!(
            task.external_data.unwrap()["branch"],
            serde_json::json!("release/v1.0.0")
        );
    }

    #[tokio::test]
    async fn test_provider_failure_pauses_cron() {
        let fx = fixture(&[(PlatformName::Android, TargetName::PlayStore)]).await;
        let task = seed_task(&fx, TaskType::ForkBranch).await;
        fx.state.set_failing("fork_branch", true);

        let ctx = TaskContext {
            release: &fx.release,
            cron: &fx.cron,
            mappings: &fx.mappings,
            cycle: None,
        };
        let status = fx.executor.execute(&task, &ctx).await.unwrap();
        assert_eq!(status, TaskStatus::Failed);

        let task = fx.db.get_task(&task.id).await.unwrap().unwrap();
        assert_eq!(task.task_status, TaskStatus::Failed);
        let data = task.external_data.unwrap();
        assert!(data["error"].as_str().unwrap().contains("fork_branch"));
        assert!(data["timestamp"].is_string());

        let cron = fx
            .db
            .get_cron_job_by_release(&fx.release.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(cron.pause_type, PauseType::TaskFailure);
    }

    #[tokio::test]
    async fn test_pm_tickets_fan_out_per_platform() {
        let fx = fixture(&[
            (PlatformName::Android, TargetName::PlayStore),
            (PlatformName::Ios, TargetName::AppStore),
        ])
        .await;
        let task = seed_task(&fx, TaskType::CreateProjectManagementTicket).await;

        let ctx = TaskContext {
            release: &fx.release,
            cron: &fx.cron,
            mappings: &fx.mappings,
            cycle: None,
        };
        let status = fx.executor.execute(&task, &ctx).await.unwrap();
        assert_eq!(status, TaskStatus::Completed);

        let task = fx.db.get_task(&task.id).await.unwrap().unwrap();
        let external_id = task.external_id.unwrap();
        // Comma-joined ticket keys, one per platform
        assert_eq!(external_id.split(',').count(), 2);
        assert_eq!(
            task.external_data.unwrap()["externalId"],
            serde_json::json!(external_id)
        );

        // Mapping run ids were populated
        let mappings = fx.db.list_platform_mappings(&fx.release.id).await.unwrap();
        assert!(mappings
            .iter()
            .all(|m| m.project_management_run_id.is_some()));
    }

    #[tokio::test]
    async fn test_trigger_builds_persists_build_rows() {
        let fx = fixture(&[
            (PlatformName::Android, TargetName::PlayStore),
            (PlatformName::Web, TargetName::Web),
        ])
        .await;
        let mut release = fx.release.clone();
        release.branch = Some("release/v1.0.0".to_string());
        fx.db.update_release(&release).await.unwrap();

        let task = seed_task(&fx, TaskType::TriggerPreRegressionBuilds).await;
        let ctx = TaskContext {
            release: &release,
            cron: &fx.cron,
            mappings: &fx.mappings,
            cycle: None,
        };
        let status = fx.executor.execute(&task, &ctx).await.unwrap();
        assert_eq!(status, TaskStatus::Completed);

        let builds = fx.db.list_builds(&fx.release.id).await.unwrap();
        assert_eq!(builds.len(), 2);
        assert!(builds.iter().all(|b| b.regression_id.is_none()));

        let task = fx.db.get_task(&task.id).await.unwrap().unwrap();
        assert_eq!(task.external_id.unwrap().split(',').count(), 2);
    }

    #[tokio::test]
    async fn test_resumed_trigger_does_not_redispatch() {
        let fx = fixture(&[(PlatformName::Android, TargetName::PlayStore)]).await;
        let mut release = fx.release.clone();
        release.branch = Some("release/v1.0.0".to_string());
        fx.db.update_release(&release).await.unwrap();

        // State left behind by a crash after the dispatch was recorded
        let mut task = seed_task(&fx, TaskType::TriggerPreRegressionBuilds).await;
        task.task_status = TaskStatus::InProgress;
        task.external_id = Some("build-0".to_string());
        task.external_data = Some(serde_json::json!({
            "externalId": "build-0",
            "builds": ["build-0"],
            "runIds": ["run-0"],
            "platformsDispatched": ["ANDROID"],
        }));
        fx.db.update_task(&task).await.unwrap();

        let ctx = TaskContext {
            release: &release,
            cron: &fx.cron,
            mappings: &fx.mappings,
            cycle: None,
        };
        let status = fx.executor.execute(&task, &ctx).await.unwrap();
        assert_eq!(status, TaskStatus::Completed);

        assert_eq!(fx.state.call_count("trigger"), 0);
        assert_eq!(fx.state.call_count("get_status"), 1);

        let task = fx.db.get_task(&task.id).await.unwrap().unwrap();
        assert_eq!(task.external_id.as_deref(), Some("build-0"));
        assert_eq!(
            task.external_data.unwrap()["resumed"],
            serde_json::json!(true)
        );
    }

    #[tokio::test]
    async fn test_mid_loop_failure_retries_only_missing_platform() {
        let fx = fixture(&[
            (PlatformName::Android, TargetName::PlayStore),
            (PlatformName::Web, TargetName::Web),
        ])
        .await;
        let mut release = fx.release.clone();
        release.branch = Some("release/v1.0.0".to_string());
        fx.db.update_release(&release).await.unwrap();

        // First platform dispatches, the second platform's trigger fails
        fx.state.set_failing_after("trigger", 1);

        let task = seed_task(&fx, TaskType::TriggerPreRegressionBuilds).await;
        let ctx = TaskContext {
            release: &release,
            cron: &fx.cron,
            mappings: &fx.mappings,
            cycle: None,
        };
        let status = fx.executor.execute(&task, &ctx).await.unwrap();
        assert_eq!(status, TaskStatus::Failed);

        // The Android dispatch survived on the task row and in builds
        let builds = fx.db.list_builds(&fx.release.id).await.unwrap();
        assert_eq!(builds.len(), 1);
        assert_eq!(builds[0].platform, PlatformName::Android);

        let failed = fx.db.get_task(&task.id).await.unwrap().unwrap();
        assert!(failed.external_id.is_some());
        let data = failed.external_data.clone().unwrap();
        assert_eq!(
            data["platformsDispatched"],
            serde_json::json!(["ANDROID"])
        );
        assert!(data["error"].is_string());

        let cron = fx
            .db
            .get_cron_job_by_release(&fx.release.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(cron.pause_type, PauseType::TaskFailure);

        // Retry keeps the dispatch record, drops the failure
        let tmp = tempfile::tempdir().unwrap();
        let service = crate::release_service::ReleaseService::new(fx.db.clone(), tmp.path());
        service.retry_task(&task.id, "acct-1").await.unwrap();

        let retried = fx.db.get_task(&task.id).await.unwrap().unwrap();
        assert_eq!(retried.task_status, TaskStatus::Pending);
        let data = retried.external_data.clone().unwrap();
        assert!(data.get("error").is_none());
        assert_eq!(
            data["platformsDispatched"],
            serde_json::json!(["ANDROID"])
        );

        // With the provider healthy again, only the missing platform is
        // triggered; the Android build is never dispatched twice
        fx.state.set_failing("trigger", false);
        let status = fx.executor.execute(&retried, &ctx).await.unwrap();
        assert_eq!(status, TaskStatus::Completed);

        assert_eq!(fx.state.call_count("trigger:pre-regression-build:ANDROID"), 1);
        // One failed attempt plus the successful retry
        assert_eq!(fx.state.call_count("trigger:pre-regression-build:WEB"), 2);

        let builds = fx.db.list_builds(&fx.release.id).await.unwrap();
        assert_eq!(builds.len(), 2);
        assert_eq!(
            builds
                .iter()
                .filter(|b| b.platform == PlatformName::Android)
                .count(),
            1
        );

        let task = fx.db.get_task(&task.id).await.unwrap().unwrap();
        assert_eq!(task.external_id.unwrap().split(',').count(), 2);

        // The recovered tick re-checked the dispatched run instead of
        // re-triggering it
        let data = task.external_data.unwrap();
        assert_eq!(data["resumed"], serde_json::json!(true));
        assert_eq!(
            data["platformsDispatched"],
            serde_json::json!(["ANDROID", "WEB"])
        );
    }

    #[tokio::test]
    async fn test_pm_tickets_only_created_for_unrecorded_platforms() {
        let fx = fixture(&[
            (PlatformName::Android, TargetName::PlayStore),
            (PlatformName::Ios, TargetName::AppStore),
        ])
        .await;

        // A prior attempt already ticketed Android
        let mut mapping = fx.mappings[0].clone();
        mapping.project_management_run_id = Some("TICKET-prior".to_string());
        fx.db.update_platform_mapping(&mapping).await.unwrap();

        let task = seed_task(&fx, TaskType::CreateProjectManagementTicket).await;
        let mappings = fx.db.list_platform_mappings(&fx.release.id).await.unwrap();
        let ctx = TaskContext {
            release: &fx.release,
            cron: &fx.cron,
            mappings: &mappings,
            cycle: None,
        };
        let status = fx.executor.execute(&task, &ctx).await.unwrap();
        assert_eq!(status, TaskStatus::Completed);

        // Only the iOS ticket was created
        assert_eq!(fx.state.call_count("create_tickets"), 1);

        let task = fx.db.get_task(&task.id).await.unwrap().unwrap();
        let external_id = task.external_id.unwrap();
        assert_eq!(external_id.split(',').count(), 2);
        assert!(external_id.contains("TICKET-prior"));
    }

    #[tokio::test]
    async fn test_test_flight_requires_ios_mapping() {
        let fx = fixture(&[(PlatformName::Android, TargetName::PlayStore)]).await;
        let mut release = fx.release.clone();
        release.branch = Some("release/v1.0.0".to_string());
        fx.db.update_release(&release).await.unwrap();

        let task = seed_task(&fx, TaskType::TriggerTestFlightBuild).await;
        let ctx = TaskContext {
            release: &release,
            cron: &fx.cron,
            mappings: &fx.mappings,
            cycle: None,
        };
        let status = fx.executor.execute(&task, &ctx).await.unwrap();
        assert_eq!(status, TaskStatus::Failed);

        let task = fx.db.get_task(&task.id).await.unwrap().unwrap();
        assert!(task.external_data.unwrap()["error"]
            .as_str()
            .unwrap()
            .contains("iOS"));
    }

    #[tokio::test]
    async fn test_automation_runs_stay_in_progress_until_terminal() {
        let fx = fixture(&[(PlatformName::Android, TargetName::PlayStore)]).await;

        // Test run was created during kickoff
        let mut mapping = fx.mappings[0].clone();
        mapping.test_management_run_id = Some("testrun-7".to_string());
        fx.db.update_platform_mapping(&mapping).await.unwrap();
        let mappings = vec![mapping];

        let task = seed_task(&fx, TaskType::AutomationRuns).await;
        fx.state.automation_terminal.store(false, Ordering::SeqCst);

        let ctx = TaskContext {
            release: &fx.release,
            cron: &fx.cron,
            mappings: &mappings,
            cycle: None,
        };
        let status = fx.executor.execute(&task, &ctx).await.unwrap();
        assert_eq!(status, TaskStatus::InProgress);

        // A later tick observes the terminal run
        fx.state.automation_terminal.store(true, Ordering::SeqCst);
        let task = fx.db.get_task(&task.id).await.unwrap().unwrap();
        let status = fx.executor.execute(&task, &ctx).await.unwrap();
        assert_eq!(status, TaskStatus::Completed);

        let task = fx.db.get_task(&task.id).await.unwrap().unwrap();
        assert_eq!(
            task.external_data.unwrap()["thresholdMet"],
            serde_json::json!(true)
        );
    }

    #[tokio::test]
    async fn test_cherry_picks_literal_contract() {
        let fx = fixture(&[(PlatformName::Android, TargetName::PlayStore)]).await;
        let mut release = fx.release.clone();
        release.branch = Some("release/v1.0.0".to_string());
        fx.db.update_release(&release).await.unwrap();

        fx.state.cherry_picks_divergent.store(true, Ordering::SeqCst);
        let task = seed_task(&fx, TaskType::PreReleaseCherryPicksReminder).await;
        let ctx = TaskContext {
            release: &release,
            cron: &fx.cron,
            mappings: &fx.mappings,
            cycle: None,
        };
        let status = fx.executor.execute(&task, &ctx).await.unwrap();
        assert_eq!(status, TaskStatus::Completed);

        let task = fx.db.get_task(&task.id).await.unwrap().unwrap();
        let data = task.external_data.unwrap();
        // true = divergence exists, and the reminder went out
        assert_eq!(data["cherryPickAvailable"], serde_json::json!(true));
        assert_eq!(data["notified"], serde_json::json!(true));
    }

    #[tokio::test]
    async fn test_messaging_failure_never_fails_send_task() {
        let fx = fixture(&[(PlatformName::Android, TargetName::PlayStore)]).await;
        fx.state.set_failing("send_notification", true);

        let task = seed_task(&fx, TaskType::SendPostRegressionMessage).await;
        let ctx = TaskContext {
            release: &fx.release,
            cron: &fx.cron,
            mappings: &fx.mappings,
            cycle: None,
        };
        let status = fx.executor.execute(&task, &ctx).await.unwrap();
        assert_eq!(status, TaskStatus::Completed);

        let task = fx.db.get_task(&task.id).await.unwrap().unwrap();
        assert_eq!(
            task.external_data.unwrap()["notified"],
            serde_json::json!(false)
        );
    }
}
