//! Per-release orchestration state
//!
//! A `CronJob` is the persistent record driving one release through its three
//! stages. It is one-to-one with a release and carries the stage statuses,
//! pause bookkeeping, optional-task flags, the queue of upcoming regression
//! slots, and the advisory lease columns that serialize orchestrator ticks.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

use crate::task::TaskStage;
use crate::{Error, Result};

/// Default lease TTL in seconds
pub const DEFAULT_LOCK_TIMEOUT_SEC: i64 = 300;

// ==================== Cron Job ====================

/// Orchestration record bound one-to-one to a release
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CronJob {
    pub id: String,
    pub release_id: String,
    pub stage1_status: StageStatus,
    pub stage2_status: StageStatus,
    pub stage3_status: StageStatus,
    pub cron_status: CronStatus,
    pub pause_type: PauseType,
    pub auto_transition_to_stage2: bool,
    pub auto_transition_to_stage3: bool,
    pub cron_config: CronConfig,
    /// Ordered queue of regression slot descriptors
    pub upcoming_regressions: Vec<RegressionSlot>,
    pub locked_by: Option<String>,
    pub locked_at: Option<DateTime<Utc>>,
    pub lock_timeout_sec: i64,
    /// Optimistic row version, bumped on every write
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CronJob {
    pub fn new(release_id: String) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            release_id,
            stage1_status: StageStatus::Pending,
            stage2_status: StageStatus::Pending,
            stage3_status: StageStatus::Pending,
            cron_status: CronStatus::Pending,
            pause_type: PauseType::None,
            auto_transition_to_stage2: true,
            auto_transition_to_stage3: true,
            cron_config: CronConfig::default(),
            upcoming_regressions: Vec::new(),
            locked_by: None,
            locked_at: None,
            lock_timeout_sec: DEFAULT_LOCK_TIMEOUT_SEC,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn stage_status(&self, stage: TaskStage) -> StageStatus {
        match stage {
            TaskStage::Kickoff => self.stage1_status,
            TaskStage::Regression => self.stage2_status,
            TaskStage::PostRegression => self.stage3_status,
        }
    }

    pub fn set_stage_status(&mut self, stage: TaskStage, status: StageStatus) {
        match stage {
            TaskStage::Kickoff => self.stage1_status = status,
            TaskStage::Regression => self.stage2_status = status,
            TaskStage::PostRegression => self.stage3_status = status,
        }
    }

    /// Number of stages currently `IN_PROGRESS`. More than one is corruption.
    pub fn in_progress_count(&self) -> usize {
        [self.stage1_status, self.stage2_status, self.stage3_status]
            .iter()
            .filter(|s| **s == StageStatus::InProgress)
            .count()
    }

    /// Whether the lease is free or has outlived its TTL at `now`.
    pub fn lease_available(&self, now: DateTime<Utc>) -> bool {
        match self.locked_at {
            None => true,
            Some(locked_at) => now - locked_at > Duration::seconds(self.lock_timeout_sec),
        }
    }

    /// Earliest slot with `due_at <= now`, if any.
    pub fn next_due_slot(&self, now: DateTime<Utc>) -> Option<usize> {
        self.upcoming_regressions
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.due_at <= now)
            .min_by_key(|(_, slot)| slot.due_at)
            .map(|(idx, _)| idx)
    }
}

// ==================== Stage / Cron Status ====================

/// Stage status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StageStatus {
    Pending,
    InProgress,
    Completed,
}

impl FromStr for StageStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "PENDING" => Ok(StageStatus::Pending),
            "IN_PROGRESS" => Ok(StageStatus::InProgress),
            "COMPLETED" => Ok(StageStatus::Completed),
            _ => Err(Error::Other(format!("Invalid stage status: {}", s))),
        }
    }
}

impl StageStatus {
    pub fn as_str(&self) -> &str {
        match self {
            StageStatus::Pending => "PENDING",
            StageStatus::InProgress => "IN_PROGRESS",
            StageStatus::Completed => "COMPLETED",
        }
    }
}

/// Cron status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CronStatus {
    Pending,
    Running,
    Paused,
    Completed,
}

impl FromStr for CronStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "PENDING" => Ok(CronStatus::Pending),
            "RUNNING" => Ok(CronStatus::Running),
            "PAUSED" => Ok(CronStatus::Paused),
            "COMPLETED" => Ok(CronStatus::Completed),
            _ => Err(Error::Other(format!("Invalid cron status: {}", s))),
        }
    }
}

impl CronStatus {
    pub fn as_str(&self) -> &str {
        match self {
            CronStatus::Pending => "PENDING",
            CronStatus::Running => "RUNNING",
            CronStatus::Paused => "PAUSED",
            CronStatus::Completed => "COMPLETED",
        }
    }
}

/// Why a running release is paused
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PauseType {
    None,
    UserRequested,
    TaskFailure,
    AwaitingStageTrigger,
}

impl FromStr for PauseType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "NONE" => Ok(PauseType::None),
            "USER_REQUESTED" => Ok(PauseType::UserRequested),
            "TASK_FAILURE" => Ok(PauseType::TaskFailure),
            "AWAITING_STAGE_TRIGGER" => Ok(PauseType::AwaitingStageTrigger),
            _ => Err(Error::Other(format!("Invalid pause type: {}", s))),
        }
    }
}

impl PauseType {
    pub fn as_str(&self) -> &str {
        match self {
            PauseType::None => "NONE",
            PauseType::UserRequested => "USER_REQUESTED",
            PauseType::TaskFailure => "TASK_FAILURE",
            PauseType::AwaitingStageTrigger => "AWAITING_STAGE_TRIGGER",
        }
    }
}

// ==================== Cron Config ====================

/// Flags enabling the optional tasks of each stage
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CronConfig {
    pub kick_off_reminder: bool,
    pub pre_regression_builds: bool,
    pub automation_builds: bool,
    pub automation_runs: bool,
    pub test_flight_builds: bool,
}

// ==================== Regression Slot ====================

/// One scheduled regression-cycle slot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegressionSlot {
    #[serde(rename = "date")]
    pub due_at: DateTime<Utc>,
    #[serde(default)]
    pub config: serde_json::Value,
}

impl RegressionSlot {
    pub fn new(due_at: DateTime<Utc>) -> Self {
        Self {
            due_at,
            config: serde_json::Value::Object(Default::default()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_status_round_trip() {
        for s in ["PENDING", "IN_PROGRESS", "COMPLETED"] {
            assert_eq!(s.parse::<StageStatus>().unwrap().as_str(), s);
        }
    }

    #[test]
    fn test_in_progress_count() {
        let mut cron = CronJob::new("r1".to_string());
        assert_eq!(cron.in_progress_count(), 0);
        cron.stage1_status = StageStatus::InProgress;
        assert_eq!(cron.in_progress_count(), 1);
        cron.stage2_status = StageStatus::InProgress;
        assert_eq!(cron.in_progress_count(), 2);
    }

    #[test]
    fn test_lease_available() {
        let mut cron = CronJob::new("r1".to_string());
        let now = Utc::now();
        assert!(cron.lease_available(now));

        cron.locked_by = Some("instance-a".to_string());
        cron.locked_at = Some(now - Duration::seconds(30));
        assert!(!cron.lease_available(now));

        cron.locked_at = Some(now - Duration::seconds(DEFAULT_LOCK_TIMEOUT_SEC + 1));
        assert!(cron.lease_available(now));
    }

    #[test]
    fn test_next_due_slot_picks_earliest() {
        let mut cron = CronJob::new("r1".to_string());
        let now = Utc::now();
        cron.upcoming_regressions = vec![
            RegressionSlot::new(now - Duration::minutes(1)),
            RegressionSlot::new(now - Duration::minutes(10)),
            RegressionSlot::new(now + Duration::minutes(5)),
        ];
        // Index 1 is the earliest due slot
        assert_eq!(cron.next_due_slot(now), Some(1));

        cron.upcoming_regressions = vec![RegressionSlot::new(now + Duration::minutes(5))];
        assert_eq!(cron.next_due_slot(now), None);
    }

    #[test]
    fn test_cron_config_serde_defaults() {
        let config: CronConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, CronConfig::default());

        let config: CronConfig =
            serde_json::from_str(r#"{"kickOffReminder": true, "automationRuns": true}"#).unwrap();
        assert!(config.kick_off_reminder);
        assert!(config.automation_runs);
        assert!(!config.test_flight_builds);
    }

    #[test]
    fn test_regression_slot_wire_field() {
        let slot = RegressionSlot::new(Utc::now());
        let json = serde_json::to_value(&slot).unwrap();
        assert!(json.get("date").is_some());
    }
}
