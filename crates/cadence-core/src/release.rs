//! Release domain models
//!
//! A release is the root aggregate: a versioned shipment of one or more
//! platform targets under a tenant. It owns its cron job, platform mappings,
//! regression cycles, tasks, uploads, and state history.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

use crate::{Error, Result};

// ==================== Release ====================

/// Release root aggregate
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Release {
    pub id: String,
    pub tenant_id: String,
    pub release_type: ReleaseType,
    pub status: ReleaseStatus,
    /// Working branch, set by the fork-branch task
    pub branch: Option<String>,
    pub base_branch: String,
    /// Integration bundle this release draws its providers from
    pub release_config_id: String,
    pub target_release_date: Option<DateTime<Utc>>,
    pub kick_off_date: Option<DateTime<Utc>>,
    pub kick_off_reminder_date: Option<DateTime<Utc>>,
    pub has_manual_build_upload: bool,
    pub created_by_account_id: String,
    pub release_pilot_account_id: Option<String>,
    pub last_updated_by_account_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Release {
    pub fn new(
        tenant_id: String,
        release_type: ReleaseType,
        base_branch: String,
        release_config_id: String,
        created_by_account_id: String,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            tenant_id,
            release_type,
            status: ReleaseStatus::Pending,
            branch: None,
            base_branch,
            release_config_id,
            target_release_date: None,
            kick_off_date: None,
            kick_off_reminder_date: None,
            has_manual_build_upload: false,
            created_by_account_id,
            release_pilot_account_id: None,
            last_updated_by_account_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Archived and completed releases admit no further stage progression.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.status,
            ReleaseStatus::Archived | ReleaseStatus::Completed
        )
    }
}

/// Release type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReleaseType {
    Major,
    Minor,
    Hotfix,
}

impl FromStr for ReleaseType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "MAJOR" => Ok(ReleaseType::Major),
            "MINOR" => Ok(ReleaseType::Minor),
            "HOTFIX" => Ok(ReleaseType::Hotfix),
            _ => Err(Error::Other(format!("Invalid release type: {}", s))),
        }
    }
}

impl ReleaseType {
    pub fn as_str(&self) -> &str {
        match self {
            ReleaseType::Major => "MAJOR",
            ReleaseType::Minor => "MINOR",
            ReleaseType::Hotfix => "HOTFIX",
        }
    }
}

/// Release status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReleaseStatus {
    Pending,
    InProgress,
    Paused,
    Submitted,
    Completed,
    Archived,
}

impl FromStr for ReleaseStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "PENDING" => Ok(ReleaseStatus::Pending),
            "IN_PROGRESS" => Ok(ReleaseStatus::InProgress),
            "PAUSED" => Ok(ReleaseStatus::Paused),
            "SUBMITTED" => Ok(ReleaseStatus::Submitted),
            "COMPLETED" => Ok(ReleaseStatus::Completed),
            "ARCHIVED" => Ok(ReleaseStatus::Archived),
            _ => Err(Error::Other(format!("Invalid release status: {}", s))),
        }
    }
}

impl ReleaseStatus {
    pub fn as_str(&self) -> &str {
        match self {
            ReleaseStatus::Pending => "PENDING",
            ReleaseStatus::InProgress => "IN_PROGRESS",
            ReleaseStatus::Paused => "PAUSED",
            ReleaseStatus::Submitted => "SUBMITTED",
            ReleaseStatus::Completed => "COMPLETED",
            ReleaseStatus::Archived => "ARCHIVED",
        }
    }
}

// ==================== Platform / Target ====================

/// Platform a release ships on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PlatformName {
    Android,
    Ios,
    Web,
}

impl FromStr for PlatformName {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "ANDROID" => Ok(PlatformName::Android),
            "IOS" => Ok(PlatformName::Ios),
            "WEB" => Ok(PlatformName::Web),
            _ => Err(Error::Other(format!("Invalid platform: {}", s))),
        }
    }
}

impl PlatformName {
    pub fn as_str(&self) -> &str {
        match self {
            PlatformName::Android => "ANDROID",
            PlatformName::Ios => "IOS",
            PlatformName::Web => "WEB",
        }
    }
}

/// Store/destination a platform build lands on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TargetName {
    PlayStore,
    AppStore,
    Web,
}

impl FromStr for TargetName {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "PLAY_STORE" => Ok(TargetName::PlayStore),
            "APP_STORE" => Ok(TargetName::AppStore),
            "WEB" => Ok(TargetName::Web),
            _ => Err(Error::Other(format!("Invalid target: {}", s))),
        }
    }
}

impl TargetName {
    pub fn as_str(&self) -> &str {
        match self {
            TargetName::PlayStore => "PLAY_STORE",
            TargetName::AppStore => "APP_STORE",
            TargetName::Web => "WEB",
        }
    }
}

// ==================== Platform/Target Mapping ====================

/// Per-release `(platform, target, version)` triple
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlatformTargetMapping {
    pub id: String,
    pub release_id: String,
    pub platform: PlatformName,
    pub target: TargetName,
    pub version: String,
    /// Ticket key created by the project-management ticket task
    pub project_management_run_id: Option<String>,
    /// Run id created by the test-suite task
    pub test_management_run_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PlatformTargetMapping {
    pub fn new(
        release_id: String,
        platform: PlatformName,
        target: TargetName,
        version: String,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            release_id,
            platform,
            target,
            version,
            project_management_run_id: None,
            test_management_run_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Version with any leading `v` stripped, for tag computation.
    pub fn normalized_version(&self) -> &str {
        self.version.trim_start_matches('v')
    }
}
