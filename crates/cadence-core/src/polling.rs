//! Workflow status polling
//!
//! An out-of-band observer that keeps task `external_data` fresh while CI/CD
//! work runs to completion elsewhere. Two passes run per poll: the pending
//! pass locates runs whose dispatch has not been confirmed yet, the running
//! pass refreshes the status of known runs until they go terminal. The
//! orchestrator only ever reads these updates.

use serde_json::json;
use tokio::sync::watch;
use tokio::time::{sleep, Duration};
use tracing::{debug, error, info};

use crate::database::Database;
use crate::providers::ProviderRegistry;
use crate::task::{ReleaseTask, TaskStatus, TaskType};
use crate::Result;

/// Task types that dispatch CI/CD workflows worth polling
const POLLED_TASK_TYPES: &[TaskType] = &[
    TaskType::TriggerPreRegressionBuilds,
    TaskType::TriggerRegressionBuilds,
    TaskType::TriggerAutomationRuns,
    TaskType::TriggerTestFlightBuild,
];

/// Poller configuration
#[derive(Clone, Debug)]
pub struct PollerConfig {
    /// Poll interval in seconds
    pub poll_interval_secs: u64,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 30,
        }
    }
}

/// Counters for one poll pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollStats {
    /// Tasks whose dispatched run was located
    pub pending_resolved: usize,
    /// Tasks whose run status was refreshed
    pub running_refreshed: usize,
}

/// Periodic workflow status observer
pub struct WorkflowPoller {
    db: Database,
    providers: ProviderRegistry,
    config: PollerConfig,
}

impl WorkflowPoller {
    pub fn new(db: Database, providers: ProviderRegistry, config: PollerConfig) -> Self {
        Self {
            db,
            providers,
            config,
        }
    }

    /// Run the poll loop until the shutdown signal flips.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            poll_interval_secs = self.config.poll_interval_secs,
            "Starting workflow poller"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            if let Err(e) = self.poll_once().await {
                error!(error = %e, "Workflow poll failed");
            }

            tokio::select! {
                _ = sleep(Duration::from_secs(self.config.poll_interval_secs)) => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Workflow poller stopped");
    }

    /// One pending pass plus one running pass.
    pub async fn poll_once(&self) -> Result<PollStats> {
        let mut stats = PollStats::default();

        for task_type in POLLED_TASK_TYPES {
            // Pending: dispatched but the run was never located (crash
            // between trigger and persist, or an async provider)
            for task in self
                .db
                .list_tasks_by_type_and_status(*task_type, TaskStatus::InProgress)
                .await?
            {
                if run_ids(&task).is_empty() && task.external_id.is_some() {
                    stats.pending_resolved += self.resolve_pending(&task).await?;
                }
            }

            // Running: refresh known runs until they settle
            for status in [TaskStatus::InProgress, TaskStatus::Completed] {
                for task in self
                    .db
                    .list_tasks_by_type_and_status(*task_type, status)
                    .await?
                {
                    let ids = run_ids(&task);
                    if !ids.is_empty() && !runs_settled(&task) {
                        stats.running_refreshed += self.refresh_running(&task, &ids).await?;
                    }
                }
            }
        }

        debug!(
            pending_resolved = stats.pending_resolved,
            running_refreshed = stats.running_refreshed,
            "Workflow poll pass finished"
        );
        Ok(stats)
    }

    async fn resolve_pending(&self, task: &ReleaseTask) -> Result<usize> {
        let correlation = task.external_id.clone().unwrap_or_default();
        let Some(run) = self.providers.cicd.find_dispatched_run(&correlation).await? else {
            return Ok(0);
        };

        let mut task = task.clone();
        merge_external_data(
            &mut task,
            json!({
                "runIds": [run.run_id],
                "workflowStatuses": [{"runId": run.run_id, "status": run.status.as_str()}],
            }),
        );
        self.db.update_task(&task).await?;
        Ok(1)
    }

    async fn refresh_running(&self, task: &ReleaseTask, ids: &[String]) -> Result<usize> {
        let mut statuses = Vec::with_capacity(ids.len());
        let mut all_terminal = true;
        for run_id in ids {
            let run = self.providers.cicd.get_status(run_id).await?;
            all_terminal &= run.status.is_terminal();
            statuses.push(json!({"runId": run.run_id, "status": run.status.as_str()}));
        }

        let mut task = task.clone();
        merge_external_data(
            &mut task,
            json!({
                "workflowStatuses": statuses,
                "workflowsSettled": all_terminal,
                "polledAt": chrono::Utc::now().to_rfc3339(),
            }),
        );
        self.db.update_task(&task).await?;
        Ok(1)
    }
}

/// Run ids recorded on the task, if any
fn run_ids(task: &ReleaseTask) -> Vec<String> {
    task.external_data
        .as_ref()
        .and_then(|d| d.get("runIds"))
        .and_then(|v| serde_json::from_value(v.clone()).ok())
        .unwrap_or_default()
}

/// Whether a previous poll already saw every run terminal
fn runs_settled(task: &ReleaseTask) -> bool {
    task.external_data
        .as_ref()
        .and_then(|d| d.get("workflowsSettled"))
        .and_then(|v| v.as_bool())
        .unwrap_or(false)
}

/// Merge new keys into the task's payload without dropping what tasks wrote
fn merge_external_data(task: &mut ReleaseTask, patch: serde_json::Value) {
    let mut data = task
        .external_data
        .take()
        .unwrap_or_else(|| json!({}));
    if let (Some(obj), serde_json::Value::Object(patch)) = (data.as_object_mut(), patch) {
        for (key, value) in patch {
            obj.insert(key, value);
        }
    }
    task.external_data = Some(data);
}
