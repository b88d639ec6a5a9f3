//! Provider capability abstractions
//!
//! The core never depends on a concrete integration (GitHub vs. Jenkins,
//! Jira vs. Linear); it consumes these capability traits and dispatches via
//! the provider type carried on the release's integration config. Each
//! concrete provider converts its native response to these domain shapes at
//! the boundary.

pub mod mock;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;

use crate::release::PlatformName;
use crate::{Error, Result};

// ==================== Shared Shapes ====================

/// Kind of CI/CD workflow a task triggers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkflowKind {
    PreRegressionBuild,
    RegressionBuild,
    AutomationRun,
    TestFlightBuild,
}

impl WorkflowKind {
    pub fn as_str(&self) -> &str {
        match self {
            WorkflowKind::PreRegressionBuild => "pre-regression-build",
            WorkflowKind::RegressionBuild => "regression-build",
            WorkflowKind::AutomationRun => "automation-run",
            WorkflowKind::TestFlightBuild => "testflight-build",
        }
    }
}

/// Request to dispatch a CI/CD workflow
#[derive(Debug, Clone)]
pub struct WorkflowTrigger {
    pub kind: WorkflowKind,
    pub platform: PlatformName,
    pub branch: String,
    pub version: String,
}

/// A dispatched or observed CI/CD workflow run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRun {
    pub run_id: String,
    pub build_number: Option<String>,
    pub status: WorkflowRunStatus,
    pub url: Option<String>,
}

/// Workflow run status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowRunStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
}

impl WorkflowRunStatus {
    pub fn as_str(&self) -> &str {
        match self {
            WorkflowRunStatus::Queued => "queued",
            WorkflowRunStatus::Running => "running",
            WorkflowRunStatus::Succeeded => "succeeded",
            WorkflowRunStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkflowRunStatus::Succeeded | WorkflowRunStatus::Failed
        )
    }
}

/// Project-management ticket status against the configured completion status
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TicketStatus {
    pub current_status: String,
    pub completed_status: String,
}

impl TicketStatus {
    pub fn is_complete(&self) -> bool {
        self.current_status == self.completed_status
    }
}

/// Test-management run status snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutomationStatus {
    pub run_id: String,
    pub passed: i64,
    pub failed: i64,
    pub total: i64,
    pub threshold_met: bool,
    pub is_terminal: bool,
}

/// A templated message sent to the configured channel
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub template: String,
    pub subject: String,
    pub body: String,
}

impl Notification {
    pub fn new(
        template: impl Into<String>,
        subject: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            template: template.into(),
            subject: subject.into(),
            body: body.into(),
        }
    }
}

// ==================== Capability Traits ====================

/// Source-control operations
#[async_trait]
pub trait Scm: Send + Sync {
    /// Fork a new branch off the base branch
    async fn fork_branch(&self, base_branch: &str, new_branch: &str) -> Result<serde_json::Value>;

    /// Create a tag at the head of a branch
    async fn create_tag(&self, tag: &str, branch: &str) -> Result<serde_json::Value>;

    /// Generate release notes for a tag
    async fn create_release_notes(&self, tag: &str, branch: &str) -> Result<serde_json::Value>;

    /// Whether the branch head has diverged from the given tag.
    ///
    /// `true` means divergence exists (cherry-picks are outstanding),
    /// `false` means branch and tag are aligned.
    async fn check_cherry_picks(&self, branch: &str, since_tag: &str) -> Result<bool>;
}

/// CI/CD workflow operations
#[async_trait]
pub trait CicdWorkflow: Send + Sync {
    /// Dispatch a workflow run
    async fn trigger(&self, request: &WorkflowTrigger) -> Result<WorkflowRun>;

    /// Current status of a run
    async fn get_status(&self, run_id: &str) -> Result<WorkflowRun>;

    /// Locate a run dispatched earlier by correlation key, if the provider
    /// has registered it yet
    async fn find_dispatched_run(&self, correlation_id: &str) -> Result<Option<WorkflowRun>>;
}

/// Project-management ticket operations
#[async_trait]
pub trait PmTicket: Send + Sync {
    /// Create the release ticket for a platform, returning its key
    async fn create_tickets(&self, platform: PlatformName, version: &str) -> Result<String>;

    /// Current ticket status against the configured completion status
    async fn check_ticket_status(&self, ticket_key: &str) -> Result<TicketStatus>;
}

/// Test-management run operations
#[async_trait]
pub trait TestManagementRun: Send + Sync {
    /// Create the test run for a platform, returning its id
    async fn create_test_runs(&self, platform: PlatformName, version: &str) -> Result<String>;

    /// Reset an existing test run for a new regression cycle
    async fn reset_test_run(&self, run_id: &str) -> Result<serde_json::Value>;

    /// Current automation/test status of a run
    async fn get_test_status(&self, run_id: &str) -> Result<AutomationStatus>;
}

/// Messaging operations
#[async_trait]
pub trait Messaging: Send + Sync {
    /// Send a templated notification
    async fn send_notification(&self, notification: &Notification) -> Result<()>;
}

// ==================== Registry ====================

/// CI/CD provider kind carried on the integration config; used only to pick
/// the concrete `CicdWorkflow` implementation at wiring time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CicdProviderType {
    GithubActions,
    Jenkins,
}

impl FromStr for CicdProviderType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "github_actions" | "github-actions" => Ok(CicdProviderType::GithubActions),
            "jenkins" => Ok(CicdProviderType::Jenkins),
            _ => Err(Error::Other(format!("Invalid CI/CD provider type: {}", s))),
        }
    }
}

/// The provider bundle one release config resolves to.
///
/// Built once at process start by the hosting binary and passed down;
/// the union of capabilities both task-executor surfaces of the product
/// historically required.
#[derive(Clone)]
pub struct ProviderRegistry {
    pub scm: Arc<dyn Scm>,
    pub cicd: Arc<dyn CicdWorkflow>,
    pub pm: Arc<dyn PmTicket>,
    pub test_management: Arc<dyn TestManagementRun>,
    pub messaging: Arc<dyn Messaging>,
}

impl ProviderRegistry {
    pub fn new(
        scm: Arc<dyn Scm>,
        cicd: Arc<dyn CicdWorkflow>,
        pm: Arc<dyn PmTicket>,
        test_management: Arc<dyn TestManagementRun>,
        messaging: Arc<dyn Messaging>,
    ) -> Self {
        Self {
            scm,
            cicd,
            pm,
            test_management,
            messaging,
        }
    }
}
