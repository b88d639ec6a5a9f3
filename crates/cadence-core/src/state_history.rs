//! Append-only audit trail for release mutations
//!
//! Every mutating service operation records who did what, with a list of
//! key/value detail items. Rows are never updated after the initial write.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

use crate::{Error, Result};

/// Audited action type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HistoryAction {
    ReleaseStarted,
    ReleasePaused,
    ReleaseResumed,
    ReleaseArchived,
    StageTriggered,
    TaskRetried,
    ManualBuildUploaded,
}

impl FromStr for HistoryAction {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "RELEASE_STARTED" => Ok(HistoryAction::ReleaseStarted),
            "RELEASE_PAUSED" => Ok(HistoryAction::ReleasePaused),
            "RELEASE_RESUMED" => Ok(HistoryAction::ReleaseResumed),
            "RELEASE_ARCHIVED" => Ok(HistoryAction::ReleaseArchived),
            "STAGE_TRIGGERED" => Ok(HistoryAction::StageTriggered),
            "TASK_RETRIED" => Ok(HistoryAction::TaskRetried),
            "MANUAL_BUILD_UPLOADED" => Ok(HistoryAction::ManualBuildUploaded),
            _ => Err(Error::Other(format!("Invalid history action: {}", s))),
        }
    }
}

impl HistoryAction {
    pub fn as_str(&self) -> &str {
        match self {
            HistoryAction::ReleaseStarted => "RELEASE_STARTED",
            HistoryAction::ReleasePaused => "RELEASE_PAUSED",
            HistoryAction::ReleaseResumed => "RELEASE_RESUMED",
            HistoryAction::ReleaseArchived => "RELEASE_ARCHIVED",
            HistoryAction::StageTriggered => "STAGE_TRIGGERED",
            HistoryAction::TaskRetried => "TASK_RETRIED",
            HistoryAction::ManualBuildUploaded => "MANUAL_BUILD_UPLOADED",
        }
    }
}

/// One audit entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateHistory {
    pub id: String,
    pub release_id: String,
    pub account_id: String,
    pub action: HistoryAction,
    pub items: Vec<StateHistoryItem>,
    pub created_at: DateTime<Utc>,
}

impl StateHistory {
    pub fn new(release_id: String, account_id: String, action: HistoryAction) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            release_id,
            account_id,
            action,
            items: Vec::new(),
            created_at: Utc::now(),
        }
    }

    pub fn with_item(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.items.push(StateHistoryItem {
            id: Uuid::new_v4().to_string(),
            item_key: key.into(),
            item_value: value.into(),
        });
        self
    }
}

/// One key/value detail on an audit entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateHistoryItem {
    pub id: String,
    pub item_key: String,
    pub item_value: String,
}
