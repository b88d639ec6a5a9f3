//! Regression cycle domain model
//!
//! A regression cycle is one sub-iteration inside Stage 2, tagged
//! `v{version}_rc_{n}` and carrying its own task set. At most one cycle per
//! release is the latest; spawning a new cycle demotes its predecessor.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

use crate::{Error, Result};

/// Regression cycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CycleStatus {
    NotStarted,
    Started,
    InProgress,
    Done,
}

impl FromStr for CycleStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "NOT_STARTED" => Ok(CycleStatus::NotStarted),
            "STARTED" => Ok(CycleStatus::Started),
            "IN_PROGRESS" => Ok(CycleStatus::InProgress),
            "DONE" => Ok(CycleStatus::Done),
            _ => Err(Error::Other(format!("Invalid cycle status: {}", s))),
        }
    }
}

impl CycleStatus {
    pub fn as_str(&self) -> &str {
        match self {
            CycleStatus::NotStarted => "NOT_STARTED",
            CycleStatus::Started => "STARTED",
            CycleStatus::InProgress => "IN_PROGRESS",
            CycleStatus::Done => "DONE",
        }
    }
}

/// A Stage-2 sub-iteration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegressionCycle {
    pub id: String,
    pub release_id: String,
    pub cycle_tag: String,
    pub status: CycleStatus,
    pub is_latest: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RegressionCycle {
    pub fn new(release_id: String, cycle_tag: String) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            release_id,
            cycle_tag,
            status: CycleStatus::NotStarted,
            is_latest: true,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Compute the tag for the `n`th regression cycle of a version.
///
/// The version may arrive with or without a leading `v`; the tag always
/// carries exactly one.
pub fn cycle_tag(version: &str, tag_count: i64) -> String {
    format!("v{}_rc_{}", version.trim_start_matches('v'), tag_count)
}

/// Compute the final release tag for a version.
pub fn release_tag(version: &str) -> String {
    format!("v{}", version.trim_start_matches('v'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_tag() {
        assert_eq!(cycle_tag("1.4.0", 3), "v1.4.0_rc_3");
        assert_eq!(cycle_tag("v1.0.0", 0), "v1.0.0_rc_0");
    }

    #[test]
    fn test_release_tag() {
        assert_eq!(release_tag("2.1.0"), "v2.1.0");
        assert_eq!(release_tag("v2.1.0"), "v2.1.0");
    }

    #[test]
    fn test_new_cycle_is_latest() {
        let cycle = RegressionCycle::new("r1".to_string(), "v1.0.0_rc_0".to_string());
        assert!(cycle.is_latest);
        assert_eq!(cycle.status, CycleStatus::NotStarted);
    }

    #[test]
    fn test_cycle_status_round_trip() {
        for s in ["NOT_STARTED", "STARTED", "IN_PROGRESS", "DONE"] {
            assert_eq!(s.parse::<CycleStatus>().unwrap().as_str(), s);
        }
    }
}
