//! Release task domain models
//!
//! This module defines the closed set of task types, their stage membership,
//! result category, per-stage ordering tables, and the optional-task gating
//! driven by the cron config flags.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

use crate::cron_job::CronConfig;
use crate::{Error, Result};

// ==================== Task Stage / Status ====================

/// Stage a task belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStage {
    Kickoff,
    Regression,
    PostRegression,
}

impl FromStr for TaskStage {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "KICKOFF" => Ok(TaskStage::Kickoff),
            "REGRESSION" => Ok(TaskStage::Regression),
            "POST_REGRESSION" => Ok(TaskStage::PostRegression),
            _ => Err(Error::Other(format!("Invalid task stage: {}", s))),
        }
    }
}

impl TaskStage {
    pub fn as_str(&self) -> &str {
        match self {
            TaskStage::Kickoff => "KICKOFF",
            TaskStage::Regression => "REGRESSION",
            TaskStage::PostRegression => "POST_REGRESSION",
        }
    }
}

/// Task status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl FromStr for TaskStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "PENDING" => Ok(TaskStatus::Pending),
            "IN_PROGRESS" => Ok(TaskStatus::InProgress),
            "COMPLETED" => Ok(TaskStatus::Completed),
            "FAILED" => Ok(TaskStatus::Failed),
            _ => Err(Error::Other(format!("Invalid task status: {}", s))),
        }
    }
}

impl TaskStatus {
    pub fn as_str(&self) -> &str {
        match self {
            TaskStatus::Pending => "PENDING",
            TaskStatus::InProgress => "IN_PROGRESS",
            TaskStatus::Completed => "COMPLETED",
            TaskStatus::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

// ==================== Task Type ====================

/// How a task's provider result is persisted.
///
/// `Single` tasks return one identifier string stored in both `external_id`
/// and `external_data.externalId`; `Structured` tasks return an object stored
/// in `external_data` with `external_id` left null.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskCategory {
    Single,
    Structured,
}

/// Closed set of task types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskType {
    // Kickoff
    PreKickOffReminder,
    ForkBranch,
    CreateProjectManagementTicket,
    CreateTestSuite,
    TriggerPreRegressionBuilds,
    // Regression
    ResetTestSuite,
    CreateRcTag,
    CreateReleaseNotes,
    TriggerRegressionBuilds,
    TriggerAutomationRuns,
    AutomationRuns,
    SendRegressionBuildMessage,
    // Post-regression
    PreReleaseCherryPicksReminder,
    CreateReleaseTag,
    CreateFinalReleaseNotes,
    TriggerTestFlightBuild,
    SendPostRegressionMessage,
    CheckProjectReleaseApproval,
}

impl FromStr for TaskType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "PRE_KICK_OFF_REMINDER" => Ok(TaskType::PreKickOffReminder),
            "FORK_BRANCH" => Ok(TaskType::ForkBranch),
            "CREATE_PROJECT_MANAGEMENT_TICKET" => Ok(TaskType::CreateProjectManagementTicket),
            "CREATE_TEST_SUITE" => Ok(TaskType::CreateTestSuite),
            "TRIGGER_PRE_REGRESSION_BUILDS" => Ok(TaskType::TriggerPreRegressionBuilds),
            "RESET_TEST_SUITE" => Ok(TaskType::ResetTestSuite),
            "CREATE_RC_TAG" => Ok(TaskType::CreateRcTag),
            "CREATE_RELEASE_NOTES" => Ok(TaskType::CreateReleaseNotes),
            "TRIGGER_REGRESSION_BUILDS" => Ok(TaskType::TriggerRegressionBuilds),
            "TRIGGER_AUTOMATION_RUNS" => Ok(TaskType::TriggerAutomationRuns),
            "AUTOMATION_RUNS" => Ok(TaskType::AutomationRuns),
            "SEND_REGRESSION_BUILD_MESSAGE" => Ok(TaskType::SendRegressionBuildMessage),
            "PRE_RELEASE_CHERRY_PICKS_REMINDER" => Ok(TaskType::PreReleaseCherryPicksReminder),
            "CREATE_RELEASE_TAG" => Ok(TaskType::CreateReleaseTag),
            "CREATE_FINAL_RELEASE_NOTES" => Ok(TaskType::CreateFinalReleaseNotes),
            "TRIGGER_TEST_FLIGHT_BUILD" => Ok(TaskType::TriggerTestFlightBuild),
            "SEND_POST_REGRESSION_MESSAGE" => Ok(TaskType::SendPostRegressionMessage),
            "CHECK_PROJECT_RELEASE_APPROVAL" => Ok(TaskType::CheckProjectReleaseApproval),
            _ => Err(Error::Other(format!("Invalid task type: {}", s))),
        }
    }
}

impl TaskType {
    pub fn as_str(&self) -> &str {
        match self {
            TaskType::PreKickOffReminder => "PRE_KICK_OFF_REMINDER",
            TaskType::ForkBranch => "FORK_BRANCH",
            TaskType::CreateProjectManagementTicket => "CREATE_PROJECT_MANAGEMENT_TICKET",
            TaskType::CreateTestSuite => "CREATE_TEST_SUITE",
            TaskType::TriggerPreRegressionBuilds => "TRIGGER_PRE_REGRESSION_BUILDS",
            TaskType::ResetTestSuite => "RESET_TEST_SUITE",
            TaskType::CreateRcTag => "CREATE_RC_TAG",
            TaskType::CreateReleaseNotes => "CREATE_RELEASE_NOTES",
            TaskType::TriggerRegressionBuilds => "TRIGGER_REGRESSION_BUILDS",
            TaskType::TriggerAutomationRuns => "TRIGGER_AUTOMATION_RUNS",
            TaskType::AutomationRuns => "AUTOMATION_RUNS",
            TaskType::SendRegressionBuildMessage => "SEND_REGRESSION_BUILD_MESSAGE",
            TaskType::PreReleaseCherryPicksReminder => "PRE_RELEASE_CHERRY_PICKS_REMINDER",
            TaskType::CreateReleaseTag => "CREATE_RELEASE_TAG",
            TaskType::CreateFinalReleaseNotes => "CREATE_FINAL_RELEASE_NOTES",
            TaskType::TriggerTestFlightBuild => "TRIGGER_TEST_FLIGHT_BUILD",
            TaskType::SendPostRegressionMessage => "SEND_POST_REGRESSION_MESSAGE",
            TaskType::CheckProjectReleaseApproval => "CHECK_PROJECT_RELEASE_APPROVAL",
        }
    }

    pub fn stage(&self) -> TaskStage {
        match self {
            TaskType::PreKickOffReminder
            | TaskType::ForkBranch
            | TaskType::CreateProjectManagementTicket
            | TaskType::CreateTestSuite
            | TaskType::TriggerPreRegressionBuilds => TaskStage::Kickoff,
            TaskType::ResetTestSuite
            | TaskType::CreateRcTag
            | TaskType::CreateReleaseNotes
            | TaskType::TriggerRegressionBuilds
            | TaskType::TriggerAutomationRuns
            | TaskType::AutomationRuns
            | TaskType::SendRegressionBuildMessage => TaskStage::Regression,
            TaskType::PreReleaseCherryPicksReminder
            | TaskType::CreateReleaseTag
            | TaskType::CreateFinalReleaseNotes
            | TaskType::TriggerTestFlightBuild
            | TaskType::SendPostRegressionMessage
            | TaskType::CheckProjectReleaseApproval => TaskStage::PostRegression,
        }
    }

    pub fn category(&self) -> TaskCategory {
        match self {
            TaskType::CreateProjectManagementTicket
            | TaskType::CreateTestSuite
            | TaskType::TriggerPreRegressionBuilds
            | TaskType::TriggerRegressionBuilds
            | TaskType::TriggerAutomationRuns
            | TaskType::TriggerTestFlightBuild => TaskCategory::Single,
            _ => TaskCategory::Structured,
        }
    }

    /// Whether the cron config enables this task. Required tasks are always
    /// enabled; optional tasks follow their flag.
    pub fn is_enabled(&self, config: &CronConfig) -> bool {
        match self {
            TaskType::PreKickOffReminder => config.kick_off_reminder,
            TaskType::TriggerPreRegressionBuilds => config.pre_regression_builds,
            TaskType::TriggerAutomationRuns => config.automation_builds,
            TaskType::AutomationRuns => config.automation_runs,
            TaskType::TriggerTestFlightBuild => config.test_flight_builds,
            _ => true,
        }
    }

    /// Optional tasks are gated by a cron config flag and never block stage
    /// completeness when disabled.
    pub fn is_optional(&self) -> bool {
        matches!(
            self,
            TaskType::PreKickOffReminder
                | TaskType::TriggerPreRegressionBuilds
                | TaskType::TriggerAutomationRuns
                | TaskType::AutomationRuns
                | TaskType::TriggerTestFlightBuild
        )
    }

    /// Declared execution order within the stage.
    pub fn order_index(&self) -> usize {
        let order: &[TaskType] = match self.stage() {
            TaskStage::Kickoff => KICKOFF_TASK_ORDER,
            TaskStage::Regression => REGRESSION_TASK_ORDER,
            TaskStage::PostRegression => POST_REGRESSION_TASK_ORDER,
        };
        order.iter().position(|t| t == self).unwrap_or(usize::MAX)
    }
}

/// Kickoff tasks in execution order
pub const KICKOFF_TASK_ORDER: &[TaskType] = &[
    TaskType::PreKickOffReminder,
    TaskType::ForkBranch,
    TaskType::CreateProjectManagementTicket,
    TaskType::CreateTestSuite,
    TaskType::TriggerPreRegressionBuilds,
];

/// Regression-cycle tasks in execution order
pub const REGRESSION_TASK_ORDER: &[TaskType] = &[
    TaskType::ResetTestSuite,
    TaskType::CreateRcTag,
    TaskType::CreateReleaseNotes,
    TaskType::TriggerRegressionBuilds,
    TaskType::TriggerAutomationRuns,
    TaskType::AutomationRuns,
    TaskType::SendRegressionBuildMessage,
];

/// Post-regression tasks in execution order
pub const POST_REGRESSION_TASK_ORDER: &[TaskType] = &[
    TaskType::PreReleaseCherryPicksReminder,
    TaskType::CreateReleaseTag,
    TaskType::CreateFinalReleaseNotes,
    TaskType::TriggerTestFlightBuild,
    TaskType::SendPostRegressionMessage,
    TaskType::CheckProjectReleaseApproval,
];

/// Enabled kickoff task types for a given config, in order.
pub fn kickoff_task_types(config: &CronConfig) -> Vec<TaskType> {
    KICKOFF_TASK_ORDER
        .iter()
        .copied()
        .filter(|t| t.is_enabled(config))
        .collect()
}

/// Enabled regression-cycle task types, in order. The first cycle runs
/// against the suite created during kickoff, so it skips the reset task.
pub fn regression_task_types(config: &CronConfig, first_cycle: bool) -> Vec<TaskType> {
    REGRESSION_TASK_ORDER
        .iter()
        .copied()
        .filter(|t| t.is_enabled(config))
        .filter(|t| !(first_cycle && *t == TaskType::ResetTestSuite))
        .collect()
}

/// Enabled post-regression task types, in order. The TestFlight task is only
/// created when the release actually maps an iOS platform.
pub fn post_regression_task_types(config: &CronConfig, has_ios_mapping: bool) -> Vec<TaskType> {
    POST_REGRESSION_TASK_ORDER
        .iter()
        .copied()
        .filter(|t| t.is_enabled(config))
        .filter(|t| !(*t == TaskType::TriggerTestFlightBuild && !has_ios_mapping))
        .collect()
}

// ==================== Release Task ====================

/// One unit of work, executed by a single provider call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleaseTask {
    pub id: String,
    pub release_id: String,
    pub regression_id: Option<String>,
    pub task_type: TaskType,
    pub stage: TaskStage,
    pub task_status: TaskStatus,
    /// Short provider-returned key (Single-category tasks only)
    pub external_id: Option<String>,
    /// Structured provider response payload
    pub external_data: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ReleaseTask {
    pub fn new(release_id: String, task_type: TaskType) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            release_id,
            regression_id: None,
            stage: task_type.stage(),
            task_type,
            task_status: TaskStatus::Pending,
            external_id: None,
            external_data: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn for_cycle(release_id: String, regression_id: String, task_type: TaskType) -> Self {
        let mut task = Self::new(release_id, task_type);
        task.regression_id = Some(regression_id);
        task
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_type_round_trip() {
        for order in [
            KICKOFF_TASK_ORDER,
            REGRESSION_TASK_ORDER,
            POST_REGRESSION_TASK_ORDER,
        ] {
            for t in order {
                assert_eq!(t.as_str().parse::<TaskType>().unwrap(), *t);
            }
        }
    }

    #[test]
    fn test_single_category_set() {
        let singles: Vec<TaskType> = KICKOFF_TASK_ORDER
            .iter()
            .chain(REGRESSION_TASK_ORDER)
            .chain(POST_REGRESSION_TASK_ORDER)
            .copied()
            .filter(|t| t.category() == TaskCategory::Single)
            .collect();
        assert_eq!(
            singles,
            vec![
                TaskType::CreateProjectManagementTicket,
                TaskType::CreateTestSuite,
                TaskType::TriggerPreRegressionBuilds,
                TaskType::TriggerRegressionBuilds,
                TaskType::TriggerAutomationRuns,
                TaskType::TriggerTestFlightBuild,
            ]
        );
    }

    #[test]
    fn test_stage_membership() {
        assert_eq!(TaskType::ForkBranch.stage(), TaskStage::Kickoff);
        assert_eq!(TaskType::CreateRcTag.stage(), TaskStage::Regression);
        assert_eq!(
            TaskType::CheckProjectReleaseApproval.stage(),
            TaskStage::PostRegression
        );
    }

    #[test]
    fn test_kickoff_tasks_all_optional_off() {
        let types = kickoff_task_types(&CronConfig::default());
        assert_eq!(
            types,
            vec![
                TaskType::ForkBranch,
                TaskType::CreateProjectManagementTicket,
                TaskType::CreateTestSuite,
            ]
        );
    }

    #[test]
    fn test_kickoff_tasks_with_reminder() {
        let config = CronConfig {
            kick_off_reminder: true,
            ..Default::default()
        };
        let types = kickoff_task_types(&config);
        assert_eq!(types[0], TaskType::PreKickOffReminder);
    }

    #[test]
    fn test_regression_tasks_first_cycle_skips_reset() {
        let config = CronConfig::default();
        let first = regression_task_types(&config, true);
        assert!(!first.contains(&TaskType::ResetTestSuite));

        let later = regression_task_types(&config, false);
        assert_eq!(later[0], TaskType::ResetTestSuite);
    }

    #[test]
    fn test_post_regression_testflight_gating() {
        let config = CronConfig {
            test_flight_builds: true,
            ..Default::default()
        };
        let with_ios = post_regression_task_types(&config, true);
        assert!(with_ios.contains(&TaskType::TriggerTestFlightBuild));

        let without_ios = post_regression_task_types(&config, false);
        assert!(!without_ios.contains(&TaskType::TriggerTestFlightBuild));

        // Flag off means no TestFlight task even with an iOS mapping
        let flag_off = post_regression_task_types(&CronConfig::default(), true);
        assert!(!flag_off.contains(&TaskType::TriggerTestFlightBuild));
    }

    #[test]
    fn test_order_index_follows_declared_order() {
        assert!(
            TaskType::CreateRcTag.order_index() < TaskType::TriggerRegressionBuilds.order_index()
        );
        assert!(
            TaskType::PreKickOffReminder.order_index() < TaskType::ForkBranch.order_index()
        );
    }
}
